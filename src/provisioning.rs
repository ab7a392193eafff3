//! Device-wide provisioning arbitration.
//!
//! Only one session may run the provisioning exchange at a time. Sessions
//! that hit a not-provisioned error register with the coordinator and wait;
//! the outcome of the single exchange is broadcast to all of them.
use parking_lot::Mutex;

use crate::error::SharedError;
use crate::inbox::{SessionKey, SessionNotifier};

/// Arbitrates provisioning across every session of a device.
pub trait ProvisioningCoordinator: Send + Sync {
    /// A session needs the device provisioned before it can continue.
    fn provision_required(&self, session: SessionNotifier);

    /// The provisioning session loaded a provisioning response.
    fn on_provision_completed(&self);

    /// The provisioning exchange failed.
    fn on_provision_error(&self, error: SharedError);

    /// A session reached a reference count of zero.
    fn session_released(&self, _session: SessionKey) {}
}

/// Told about every reference count change of a session.
pub trait ReferenceCountListener: Send + Sync {
    fn on_reference_count_incremented(&self, session: SessionKey, new_count: usize);

    fn on_reference_count_decremented(&self, session: SessionKey, new_count: usize);
}

/// FIFO [`ProvisioningCoordinator`].
///
/// The first waiting session performs provisioning. If it is released
/// before finishing, the next waiting session takes over.
#[derive(Debug, Default)]
pub struct DeviceProvisioner {
    waiting: Mutex<Vec<SessionNotifier>>,
}

impl DeviceProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waiting_sessions(&self) -> Vec<SessionKey> {
        self.waiting.lock().iter().map(SessionNotifier::key).collect()
    }

    fn take_waiting(&self) -> Vec<SessionNotifier> {
        std::mem::take(&mut *self.waiting.lock())
    }
}

impl ProvisioningCoordinator for DeviceProvisioner {
    fn provision_required(&self, session: SessionNotifier) {
        let mut waiting = self.waiting.lock();
        if waiting.iter().any(|s| s.key() == session.key()) {
            return;
        }
        waiting.push(session);
        if waiting.len() == 1 {
            debug!("Session {} starts device provisioning", waiting[0].key());
            waiting[0].provision();
        }
    }

    fn on_provision_completed(&self) {
        let waiting = self.take_waiting();
        info!("Device provisioned, resuming {} session(s)", waiting.len());
        for session in waiting {
            session.provision_completed();
        }
    }

    fn on_provision_error(&self, error: SharedError) {
        let waiting = self.take_waiting();
        warn!("Device provisioning failed: {}", error);
        for session in waiting {
            session.provision_error(error.clone());
        }
    }

    fn session_released(&self, session: SessionKey) {
        let mut waiting = self.waiting.lock();
        let Some(position) = waiting.iter().position(|s| s.key() == session) else {
            return;
        };
        waiting.remove(position);
        if position == 0 {
            if let Some(next) = waiting.first() {
                debug!("Handing device provisioning over to session {}", next.key());
                next.provision();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::Error;
    use crate::inbox::SessionMessage;

    fn notifier(key: SessionKey) -> (SessionNotifier, kanal::Receiver<SessionMessage>) {
        let (tx, rx) = kanal::unbounded();
        (SessionNotifier::new(key, tx), rx)
    }

    fn drain(rx: &kanal::Receiver<SessionMessage>) -> Vec<&'static str> {
        let mut out = Vec::new();
        while let Ok(Some(message)) = rx.try_recv() {
            out.push(match message {
                SessionMessage::Provision => "provision",
                SessionMessage::ProvisionCompleted => "completed",
                SessionMessage::ProvisionError(_) => "error",
                SessionMessage::Response(_) => "response",
                SessionMessage::EngineEvent(_) => "engine",
            });
        }
        out
    }

    #[test]
    fn only_first_session_provisions() {
        let provisioner = DeviceProvisioner::new();
        let (a, a_rx) = notifier(1);
        let (b, b_rx) = notifier(2);

        provisioner.provision_required(a.clone());
        provisioner.provision_required(b);
        provisioner.provision_required(a);

        assert_eq!(provisioner.waiting_sessions(), vec![1, 2]);
        assert_eq!(drain(&a_rx), vec!["provision"]);
        assert!(drain(&b_rx).is_empty());

        provisioner.on_provision_completed();
        assert_eq!(drain(&a_rx), vec!["completed"]);
        assert_eq!(drain(&b_rx), vec!["completed"]);
        assert!(provisioner.waiting_sessions().is_empty());
    }

    #[test]
    fn error_is_broadcast() {
        let provisioner = DeviceProvisioner::new();
        let (a, a_rx) = notifier(1);
        let (b, b_rx) = notifier(2);
        provisioner.provision_required(a);
        provisioner.provision_required(b);

        provisioner.on_provision_error(Arc::new(Error::Other("boom".into())));

        assert_eq!(drain(&a_rx), vec!["provision", "error"]);
        assert_eq!(drain(&b_rx), vec!["error"]);
    }

    #[test]
    fn released_head_hands_over() {
        let provisioner = DeviceProvisioner::new();
        let (a, _a_rx) = notifier(1);
        let (b, b_rx) = notifier(2);
        provisioner.provision_required(a);
        provisioner.provision_required(b);

        provisioner.session_released(1);

        assert_eq!(provisioner.waiting_sessions(), vec![2]);
        assert_eq!(drain(&b_rx), vec!["provision"]);
    }

    #[test]
    fn released_waiter_is_dropped_quietly() {
        let provisioner = DeviceProvisioner::new();
        let (a, a_rx) = notifier(1);
        let (b, _b_rx) = notifier(2);
        provisioner.provision_required(a);
        provisioner.provision_required(b);

        provisioner.session_released(2);

        assert_eq!(provisioner.waiting_sessions(), vec![1]);
        assert_eq!(drain(&a_rx), vec!["provision"]);
    }
}
