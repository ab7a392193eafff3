//! Messages a session applies on its owning context.
use crate::dispatcher::RequestOutcome;
use crate::engine::EngineEvent;
use crate::error::SharedError;

/// Unique identity of a session within the process.
pub type SessionKey = u64;

pub(crate) enum SessionMessage {
    Response(RequestOutcome),
    Provision,
    ProvisionCompleted,
    ProvisionError(SharedError),
    EngineEvent(EngineEvent),
}

/// Posts signals into a session's inbox from any thread.
///
/// Signals are only acted upon when the owner next processes the inbox.
/// Posting to a released session is a no-op.
#[derive(Clone)]
pub struct SessionNotifier {
    key: SessionKey,
    inbox: kanal::Sender<SessionMessage>,
}

impl std::fmt::Debug for SessionNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionNotifier").field("key", &self.key).finish()
    }
}

impl SessionNotifier {
    pub(crate) fn new(key: SessionKey, inbox: kanal::Sender<SessionMessage>) -> Self {
        Self { key, inbox }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Ask the session to run the provisioning exchange itself.
    pub fn provision(&self) {
        self.send(SessionMessage::Provision);
    }

    pub fn provision_completed(&self) {
        self.send(SessionMessage::ProvisionCompleted);
    }

    pub fn provision_error(&self, error: SharedError) {
        self.send(SessionMessage::ProvisionError(error));
    }

    pub fn engine_event(&self, event: EngineEvent) {
        self.send(SessionMessage::EngineEvent(event));
    }

    pub(crate) fn send(&self, message: SessionMessage) {
        if self.inbox.send(message).is_err() {
            trace!("Session {} inbox closed, dropping message", self.key);
        }
    }
}
