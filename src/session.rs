//! DRM session lifecycle.
//!
//! A [`DrmSession`] binds one native crypto engine session to the consumers
//! that use it. It is reference counted: the native session is opened when
//! the first consumer acquires it and closed when the last one releases it.
//! Provisioning and key requests run on a background
//! [`RequestDispatcher`](crate::dispatcher::RequestDispatcher); their results,
//! provisioning signals and engine events queue up in the session's inbox and
//! are applied when the owner calls [`DrmSession::process_pending`] or
//! [`DrmSession::process_next`]. All state changes and event dispatch happen
//! on the owner's thread.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::dispatcher::{DrmRequest, RequestDispatcher, RequestKind, RequestOutcome};
use crate::engine::{self, CryptoEngine, CryptoHandle, EngineEvent, KeyStatus, KeyType};
use crate::error::{Error, Result, SharedError};
use crate::events::EventDispatcher;
use crate::inbox::{SessionKey, SessionMessage, SessionNotifier};
use crate::provisioning::{ProvisioningCoordinator, ReferenceCountListener};
use crate::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::scheme::{SchemeData, WIDEVINE_UUID};
use crate::transport::RequestTransport;

/// Restored offline licenses with less time left than this are renewed.
pub const MAX_LICENSE_DURATION_TO_RENEW_SECS: i64 = 60;

static NEXT_SESSION_KEY: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, or waiting for the native session to open.
    Opening,
    Opened,
    OpenedWithKeys,
    /// A fatal error occurred before keys were loaded. See [`DrmSession::error`].
    Error,
    /// The reference count reached zero. Terminal.
    Released,
}

/// What a session acquires keys for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionMode {
    /// Play content, restoring and renewing offline keys when a key-set id is given.
    #[default]
    Playback,
    /// Restore offline keys only to inspect them.
    Query,
    /// Fetch an offline license and keep its key-set id.
    Download,
    /// Release a persisted offline license.
    Release,
}

/// Per-session construction parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub scheme: Uuid,
    pub scheme_data: Option<Vec<SchemeData>>,
    pub mode: SessionMode,
    pub offline_key_set_id: Option<Vec<u8>>,
    /// Participates in the pipeline but never requests keys.
    pub placeholder: bool,
    pub play_clear_samples_without_keys: bool,
    pub key_request_parameters: HashMap<String, String>,
}

impl SessionConfig {
    pub fn new(scheme: Uuid) -> Self {
        Self {
            scheme,
            scheme_data: None,
            mode: SessionMode::Playback,
            offline_key_set_id: None,
            placeholder: false,
            play_clear_samples_without_keys: false,
            key_request_parameters: HashMap::new(),
        }
    }

    pub fn with_scheme_data(mut self, scheme_data: Vec<SchemeData>) -> Self {
        self.scheme_data = Some(scheme_data);
        self
    }

    pub fn with_mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_offline_key_set_id(mut self, key_set_id: Vec<u8>) -> Self {
        self.offline_key_set_id = Some(key_set_id);
        self
    }

    pub fn placeholder(mut self, placeholder: bool) -> Self {
        self.placeholder = placeholder;
        self
    }

    pub fn play_clear_samples_without_keys(mut self, play: bool) -> Self {
        self.play_clear_samples_without_keys = play;
        self
    }

    pub fn with_key_request_parameter(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.key_request_parameters.insert(name.into(), value.into());
        self
    }

    /// Check the construction invariants and normalize the config.
    ///
    /// Scheme data is dropped when an offline key-set id is given.
    pub fn validate(mut self) -> Result<Self> {
        if matches!(self.mode, SessionMode::Query | SessionMode::Release)
            && self.offline_key_set_id.is_none()
        {
            return Err(Error::InvalidConfig(format!(
                "{:?} mode requires an offline key-set id",
                self.mode
            )));
        }

        if self.offline_key_set_id.is_some() {
            self.scheme_data = None;
        } else if self.scheme_data.is_none() && !self.placeholder {
            return Err(Error::InvalidConfig(
                "scheme data is required without an offline key-set id".to_string(),
            ));
        }

        Ok(self)
    }
}

/// Shared services a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub engine: Arc<dyn CryptoEngine>,
    pub transport: Arc<dyn RequestTransport>,
    pub provisioning: Arc<dyn ProvisioningCoordinator>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub reference_listener: Option<Arc<dyn ReferenceCountListener>>,
}

impl Collaborators {
    pub fn new(
        engine: Arc<dyn CryptoEngine>,
        transport: Arc<dyn RequestTransport>,
        provisioning: Arc<dyn ProvisioningCoordinator>,
    ) -> Self {
        Self {
            engine,
            transport,
            provisioning,
            retry_policy: Arc::new(DefaultRetryPolicy::default()),
            reference_listener: None,
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_reference_listener(mut self, listener: Arc<dyn ReferenceCountListener>) -> Self {
        self.reference_listener = Some(listener);
        self
    }
}

/// A reference counted DRM session.
pub struct DrmSession {
    key: SessionKey,
    config: SessionConfig,
    services: Collaborators,

    state: SessionState,
    reference_count: usize,
    last_error: Option<SharedError>,
    session_id: Option<Vec<u8>>,
    crypto: Option<CryptoHandle>,
    offline_key_set_id: Option<Vec<u8>>,

    current_key_request: Option<u64>,
    current_provision_request: Option<u64>,
    dispatcher: Option<RequestDispatcher>,
    /// Multiset of event dispatchers, one entry per distinct view.
    event_dispatchers: Vec<(EventDispatcher, usize)>,

    inbox_tx: kanal::Sender<SessionMessage>,
    inbox_rx: kanal::Receiver<SessionMessage>,
}

impl std::fmt::Debug for DrmSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmSession")
            .field("key", &self.key)
            .field("scheme", &self.config.scheme)
            .field("mode", &self.config.mode)
            .field("state", &self.state)
            .field("reference_count", &self.reference_count)
            .field("session_id", &self.session_id.as_ref().map(hex::encode))
            .finish()
    }
}

impl DrmSession {
    pub fn new(config: SessionConfig, services: Collaborators) -> Result<Self> {
        let config = config.validate()?;
        let (inbox_tx, inbox_rx) = kanal::unbounded();

        Ok(Self {
            key: NEXT_SESSION_KEY.fetch_add(1, Ordering::Relaxed),
            offline_key_set_id: config.offline_key_set_id.clone(),
            config,
            services,
            state: SessionState::Opening,
            reference_count: 0,
            last_error: None,
            session_id: None,
            crypto: None,
            current_key_request: None,
            current_provision_request: None,
            dispatcher: None,
            event_dispatchers: Vec::new(),
            inbox_tx,
            inbox_rx,
        })
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The error that moved the session into [`SessionState::Error`].
    ///
    /// Errors reported while keys are loaded do not change the state and are
    /// not returned here; listeners still receive them.
    pub fn error(&self) -> Option<&SharedError> {
        if self.state == SessionState::Error {
            self.last_error.as_ref()
        } else {
            None
        }
    }

    pub fn media_crypto(&self) -> Option<&CryptoHandle> {
        self.crypto.as_ref()
    }

    /// Key status of the native session, `None` if it is not open.
    pub fn query_key_status(&self) -> Result<Option<KeyStatus>> {
        match &self.session_id {
            Some(id) => self.services.engine.query_key_status(id).map(Some),
            None => Ok(None),
        }
    }

    pub fn offline_license_key_set_id(&self) -> Option<&[u8]> {
        self.offline_key_set_id.as_deref()
    }

    pub fn has_session_id(&self, session_id: &[u8]) -> bool {
        self.session_id.as_deref() == Some(session_id)
    }

    pub fn play_clear_samples_without_keys(&self) -> bool {
        self.config.play_clear_samples_without_keys
    }

    pub fn reference_count(&self) -> usize {
        self.reference_count
    }

    pub fn mode(&self) -> SessionMode {
        self.config.mode
    }

    pub fn scheme_uuid(&self) -> Uuid {
        self.config.scheme
    }

    /// Handle for posting provisioning signals and engine events to this session.
    pub fn notifier(&self) -> SessionNotifier {
        SessionNotifier::new(self.key, self.inbox_tx.clone())
    }

    /// Take a reference, opening the native session on the first one.
    ///
    /// Failures never escape: they move the session to
    /// [`SessionState::Error`] and are reported to listeners.
    pub fn acquire(&mut self, events: Option<&EventDispatcher>) {
        if self.state == SessionState::Released {
            warn!("Ignoring acquire of released session {}", self.key);
            return;
        }

        if let Some(events) = events {
            self.add_event_dispatcher(events);
        }

        self.reference_count += 1;
        if self.reference_count == 1 {
            debug_assert_eq!(self.state, SessionState::Opening);
            if self.start_dispatcher() && self.open_internal(true) {
                self.do_license(true);
            }
        } else if let Some(events) = events {
            if self.is_open() {
                // Only the new listener hears about an already open session.
                events.drm_session_acquired();
            }
        }

        if let Some(listener) = &self.services.reference_listener {
            listener.on_reference_count_incremented(self.key, self.reference_count);
        }
    }

    /// Drop a reference, tearing the session down on the last one.
    pub fn release(&mut self, events: Option<&EventDispatcher>) {
        if self.reference_count == 0 {
            warn!("Ignoring release of session {} without references", self.key);
            return;
        }

        self.reference_count -= 1;
        if self.reference_count == 0 {
            self.state = SessionState::Released;
            if let Some(mut dispatcher) = self.dispatcher.take() {
                dispatcher.shutdown();
            }
            while let Ok(Some(_)) = self.inbox_rx.try_recv() {}
            self.crypto = None;
            self.last_error = None;
            self.current_key_request = None;
            self.current_provision_request = None;
            if let Some(session_id) = self.session_id.take() {
                debug!("Closing session {} ({})", self.key, hex::encode(&session_id));
                self.services.engine.close_session(&session_id);
            }
            self.dispatch_event(EventDispatcher::drm_session_released);
            self.services.provisioning.session_released(self.key);
        }

        if let Some(events) = events {
            if self.is_open() {
                // Only the departing listener hears that the session is gone.
                events.drm_session_released();
            }
            self.remove_event_dispatcher(events);
        }

        if let Some(listener) = &self.services.reference_listener {
            listener.on_reference_count_decremented(self.key, self.reference_count);
        }
    }

    /// Run the provisioning exchange for the device.
    ///
    /// Called when the provisioning coordinator picks this session.
    pub fn provision(&mut self) {
        if !self.is_open() && self.state != SessionState::Opening {
            return;
        }
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };

        match self.services.engine.get_provision_request() {
            Ok(request) => {
                info!("Session {} is provisioning the device", self.key);
                let task_id = dispatcher.post(DrmRequest::Provision(request), true);
                self.current_provision_request = Some(task_id);
            }
            Err(e) => self.services.provisioning.on_provision_error(Arc::new(e)),
        }
    }

    /// The device is provisioned; open the native session and load keys.
    pub fn on_provision_completed(&mut self) {
        if !self.is_open() && self.state != SessionState::Opening {
            return;
        }
        if self.open_internal(false) {
            self.do_license(true);
        }
    }

    pub fn on_provision_error(&mut self, error: SharedError) {
        if self.state == SessionState::Released {
            return;
        }
        self.on_error(error);
    }

    pub fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::KeyRequired => self.on_keys_required(),
            other => {
                trace!("Session {} ignores engine event {:?}", self.key, other);
            }
        }
    }

    /// Apply everything queued in the inbox. Returns the number of messages handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(Some(message)) = self.inbox_rx.try_recv() {
            self.handle_message(message);
            handled += 1;
        }
        handled
    }

    /// Wait up to `timeout` for one inbox message and apply it.
    pub fn process_next(&mut self, timeout: Duration) -> bool {
        let Ok(message) = self.inbox_rx.recv_timeout(timeout) else {
            return false;
        };
        self.handle_message(message);
        true
    }

    #[cfg(test)]
    pub(crate) fn post_message(&self, message: SessionMessage) {
        if self.inbox_tx.send(message).is_err() {
            trace!("Session {} inbox closed", self.key);
        }
    }

    fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Response(outcome) => self.on_response(outcome),
            SessionMessage::Provision => self.provision(),
            SessionMessage::ProvisionCompleted => self.on_provision_completed(),
            SessionMessage::ProvisionError(error) => self.on_provision_error(error),
            SessionMessage::EngineEvent(event) => self.on_engine_event(event),
        }
    }

    fn start_dispatcher(&mut self) -> bool {
        let notifier = self.notifier();
        let dispatcher = RequestDispatcher::spawn(
            self.config.scheme,
            self.services.transport.clone(),
            self.services.retry_policy.clone(),
            Box::new(move |outcome| notifier.send(SessionMessage::Response(outcome))),
        );

        match dispatcher {
            Ok(dispatcher) => {
                self.dispatcher = Some(dispatcher);
                true
            }
            Err(e) => {
                self.on_error(e);
                false
            }
        }
    }

    /// Open the native session unless already open.
    ///
    /// A not-provisioned failure is routed to the provisioning coordinator
    /// when `allow_provisioning` is set.
    fn open_internal(&mut self, allow_provisioning: bool) -> bool {
        if self.is_open() {
            return true;
        }

        let session_id = match self.services.engine.open_session() {
            Ok(id) => id,
            Err(Error::NotProvisioned) if allow_provisioning => {
                debug!("Session {} waits for device provisioning", self.key);
                self.services.provisioning.provision_required(self.notifier());
                return false;
            }
            Err(e) => {
                self.on_error(e);
                return false;
            }
        };

        debug!("Opened session {} ({})", self.key, hex::encode(&session_id));
        self.session_id = Some(session_id.clone());
        match self.services.engine.create_crypto_handle(&session_id) {
            Ok(handle) => self.crypto = Some(handle),
            Err(e) => {
                self.on_error(e);
                return false;
            }
        }

        self.dispatch_event(EventDispatcher::drm_session_acquired);
        self.state = SessionState::Opened;
        true
    }

    fn do_license(&mut self, allow_retry: bool) {
        if self.config.placeholder {
            return;
        }
        let Some(session_id) = self.session_id.clone() else {
            return;
        };

        match self.config.mode {
            SessionMode::Playback | SessionMode::Query => {
                if self.offline_key_set_id.is_none() {
                    self.post_key_request(&session_id, KeyType::Streaming, allow_retry);
                } else if self.state == SessionState::OpenedWithKeys
                    || self.restore_keys(&session_id)
                {
                    let remaining = self.license_duration_remaining(&session_id);
                    if self.config.mode == SessionMode::Playback
                        && remaining <= MAX_LICENSE_DURATION_TO_RENEW_SECS
                    {
                        debug!(
                            "Offline license expired or expires soon, renewing. Remaining seconds: {}",
                            remaining
                        );
                        self.post_key_request(&session_id, KeyType::Offline, allow_retry);
                    } else if remaining <= 0 {
                        self.on_error(Error::KeysExpired);
                    } else {
                        self.state = SessionState::OpenedWithKeys;
                        self.dispatch_event(EventDispatcher::drm_keys_restored);
                    }
                }
            }
            SessionMode::Download => {
                if self.offline_key_set_id.is_none() || self.restore_keys(&session_id) {
                    self.post_key_request(&session_id, KeyType::Offline, allow_retry);
                }
            }
            SessionMode::Release => {
                let Some(key_set_id) = self.offline_key_set_id.clone() else {
                    return;
                };
                // Restoring first fails fast if the persisted license is unusable.
                if self.restore_keys(&session_id) {
                    self.post_key_request(&key_set_id, KeyType::Release, allow_retry);
                }
            }
        }
    }

    fn restore_keys(&mut self, session_id: &[u8]) -> bool {
        let Some(key_set_id) = self.offline_key_set_id.clone() else {
            return false;
        };
        match self.services.engine.restore_keys(session_id, &key_set_id) {
            Ok(()) => true,
            Err(e) => {
                error!("Error trying to restore keys: {}", e);
                self.on_error(e);
                false
            }
        }
    }

    fn license_duration_remaining(&self, session_id: &[u8]) -> i64 {
        if self.config.scheme != WIDEVINE_UUID {
            return i64::MAX;
        }
        match self.services.engine.query_key_status(session_id) {
            Ok(status) => engine::license_duration_remaining(&status),
            Err(e) => {
                warn!("Failed to query key status: {}", e);
                0
            }
        }
    }

    fn post_key_request(&mut self, scope: &[u8], key_type: KeyType, allow_retry: bool) {
        let request = self.services.engine.get_key_request(
            scope,
            self.config.scheme_data.as_deref(),
            key_type,
            &self.config.key_request_parameters,
        );

        match request {
            Ok(request) => {
                let Some(dispatcher) = &self.dispatcher else {
                    return;
                };
                let task_id = dispatcher.post(DrmRequest::Key(request), allow_retry);
                debug!(
                    "Session {} requested {} keys as task {}",
                    self.key,
                    key_type.as_str(),
                    task_id
                );
                self.current_key_request = Some(task_id);
            }
            Err(e) => self.on_keys_error(e),
        }
    }

    fn on_response(&mut self, outcome: RequestOutcome) {
        match outcome.kind {
            RequestKind::Provision => self.on_provision_response(outcome.task_id, outcome.result),
            RequestKind::Keys => self.on_key_response(outcome.task_id, outcome.result),
        }
    }

    fn on_provision_response(&mut self, task_id: u64, response: Result<Vec<u8>>) {
        if self.current_provision_request != Some(task_id)
            || (self.state != SessionState::Opening && !self.is_open())
        {
            trace!("Session {} drops stale provision response {}", self.key, task_id);
            return;
        }
        self.current_provision_request = None;

        let provisioning = self.services.provisioning.clone();
        let loaded = response.and_then(|bytes| {
            self.services.engine.provide_provision_response(&bytes)
        });
        match loaded {
            Ok(()) => provisioning.on_provision_completed(),
            Err(e) => provisioning.on_provision_error(Arc::new(e)),
        }
    }

    fn on_key_response(&mut self, task_id: u64, response: Result<Vec<u8>>) {
        if self.current_key_request != Some(task_id) || !self.is_open() {
            trace!("Session {} drops stale key response {}", self.key, task_id);
            return;
        }
        self.current_key_request = None;

        let response = match response {
            Ok(bytes) => bytes,
            Err(e) => {
                self.on_keys_error(e);
                return;
            }
        };

        if let Err(e) = self.load_key_response(&response) {
            self.on_keys_error(e);
        }
    }

    fn load_key_response(&mut self, response: &[u8]) -> Result<()> {
        let engine = self.services.engine.clone();

        if self.config.mode == SessionMode::Release {
            if let Some(key_set_id) = &self.offline_key_set_id {
                engine.provide_key_response(key_set_id, response)?;
            }
            self.dispatch_event(EventDispatcher::drm_keys_removed);
            return Ok(());
        }

        let Some(session_id) = &self.session_id else {
            return Ok(());
        };
        let key_set_id = engine.provide_key_response(session_id, response)?;

        let keeps_key_set = self.config.mode == SessionMode::Download
            || (self.config.mode == SessionMode::Playback && self.offline_key_set_id.is_some());
        if let Some(key_set_id) = key_set_id.filter(|id| keeps_key_set && !id.is_empty()) {
            self.offline_key_set_id = Some(key_set_id);
        }

        self.state = SessionState::OpenedWithKeys;
        self.dispatch_event(EventDispatcher::drm_keys_loaded);
        Ok(())
    }

    fn on_keys_required(&mut self) {
        if self.config.mode == SessionMode::Playback && self.state == SessionState::OpenedWithKeys
        {
            // Fail fast rather than stall playback on retries.
            self.do_license(false);
        }
    }

    fn on_keys_error(&mut self, error: Error) {
        if error.is_not_provisioned() {
            self.services.provisioning.provision_required(self.notifier());
        } else {
            self.on_error(error);
        }
    }

    fn on_error(&mut self, error: impl Into<SharedError>) {
        let error = error.into();
        error!("Session {} error: {}", self.key, error);
        self.last_error = Some(error.clone());
        self.dispatch_event(|events| events.drm_session_manager_error(error.clone()));
        if self.state != SessionState::OpenedWithKeys {
            self.state = SessionState::Error;
        }
    }

    fn is_open(&self) -> bool {
        matches!(
            self.state,
            SessionState::Opened | SessionState::OpenedWithKeys
        )
    }

    fn dispatch_event(&self, event: impl Fn(&EventDispatcher)) {
        for (events, _) in &self.event_dispatchers {
            event(events);
        }
    }

    fn add_event_dispatcher(&mut self, events: &EventDispatcher) {
        match self
            .event_dispatchers
            .iter_mut()
            .find(|(existing, _)| existing.id() == events.id())
        {
            Some((_, count)) => *count += 1,
            None => self.event_dispatchers.push((events.clone(), 1)),
        }
    }

    fn remove_event_dispatcher(&mut self, events: &EventDispatcher) {
        let Some(position) = self
            .event_dispatchers
            .iter()
            .position(|(existing, _)| existing.id() == events.id())
        else {
            return;
        };
        let (_, count) = &mut self.event_dispatchers[position];
        *count -= 1;
        if *count == 0 {
            self.event_dispatchers.remove(position);
        }
    }
}

impl Drop for DrmSession {
    fn drop(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            warn!("Session {} dropped while open, closing it", self.key);
            self.services.engine.close_session(&session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::dispatcher::next_task_id;
    use crate::looper::Immediate;
    use crate::testing::{FakeEngine, FakeTransport, RecordingCoordinator, RecordingListener};

    struct Fixture {
        engine: Arc<FakeEngine>,
        transport: Arc<FakeTransport>,
        coordinator: Arc<RecordingCoordinator>,
        listener: Arc<RecordingListener>,
        events: EventDispatcher,
    }

    impl Fixture {
        fn new() -> Self {
            let listener = Arc::new(RecordingListener::default());
            let events = EventDispatcher::new();
            events.add_listener(Arc::new(Immediate), listener.clone());
            Self {
                engine: Arc::new(FakeEngine::new()),
                transport: Arc::new(FakeTransport::new()),
                coordinator: Arc::new(RecordingCoordinator::default()),
                listener,
                events,
            }
        }

        fn session(&self, config: SessionConfig) -> DrmSession {
            let services = Collaborators::new(
                self.engine.clone(),
                self.transport.clone(),
                self.coordinator.clone(),
            );
            DrmSession::new(config, services).unwrap()
        }
    }

    fn streaming_config() -> SessionConfig {
        SessionConfig::new(WIDEVINE_UUID).with_scheme_data(vec![SchemeData::new(
            WIDEVINE_UUID,
            None,
            "video/mp4",
            Some(b"init".to_vec()),
        )])
    }

    fn wait_for_keys(session: &mut DrmSession) {
        while session.state() == SessionState::Opened {
            assert!(session.process_next(Duration::from_secs(5)));
        }
    }

    #[rstest]
    #[case::query_without_key_set(SessionConfig::new(WIDEVINE_UUID).with_mode(SessionMode::Query))]
    #[case::release_without_key_set(SessionConfig::new(WIDEVINE_UUID).with_mode(SessionMode::Release))]
    #[case::playback_without_data(SessionConfig::new(WIDEVINE_UUID))]
    fn rejects_invalid_config(#[case] config: SessionConfig) {
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn key_set_id_drops_scheme_data() {
        let config = streaming_config()
            .with_offline_key_set_id(b"ks".to_vec())
            .validate()
            .unwrap();
        assert!(config.scheme_data.is_none());
    }

    #[test]
    fn placeholder_needs_no_scheme_data() {
        let fixture = Fixture::new();
        let mut session = fixture.session(SessionConfig::new(WIDEVINE_UUID).placeholder(true));

        session.acquire(Some(&fixture.events));

        assert_eq!(session.state(), SessionState::Opened);
        assert!(fixture.engine.key_requests().is_empty());
        session.release(Some(&fixture.events));
    }

    #[test]
    fn stale_key_response_is_ignored() {
        let fixture = Fixture::new();
        let mut session = fixture.session(streaming_config());
        session.acquire(Some(&fixture.events));
        wait_for_keys(&mut session);
        let before = fixture.listener.events();

        for _ in 0..3 {
            session.post_message(SessionMessage::Response(RequestOutcome {
                task_id: next_task_id(),
                kind: RequestKind::Keys,
                result: Ok(b"license".to_vec()),
            }));
            session.process_pending();
        }

        assert_eq!(fixture.listener.events(), before);
        assert_eq!(fixture.engine.key_responses().len(), 1);
        session.release(Some(&fixture.events));
    }

    #[test]
    fn stale_provision_response_is_ignored() {
        let fixture = Fixture::new();
        let mut session = fixture.session(streaming_config());
        session.acquire(Some(&fixture.events));
        wait_for_keys(&mut session);
        let before = fixture.listener.events();

        let replay = |session: &mut DrmSession, result: Result<Vec<u8>>| {
            session.post_message(SessionMessage::Response(RequestOutcome {
                task_id: next_task_id(),
                kind: RequestKind::Provision,
                result,
            }));
            session.process_pending();
        };
        for _ in 0..3 {
            replay(&mut session, Ok(b"certificate".to_vec()));
        }
        replay(&mut session, Err(Error::Other("late failure".into())));

        session.release(Some(&fixture.events));
        replay(&mut session, Ok(b"certificate".to_vec()));

        assert_eq!(fixture.engine.provision_responses(), 0);
        assert_eq!(fixture.coordinator.completed(), 0);
        assert!(fixture.coordinator.errors().is_empty());
        assert_eq!(session.state(), SessionState::Released);
        assert_eq!(fixture.listener.events()[..before.len()], before[..]);
        assert_eq!(fixture.listener.events().len(), before.len() + 1);
    }

    #[test]
    fn error_after_keys_keeps_state() {
        let fixture = Fixture::new();
        let mut session = fixture.session(streaming_config());
        session.acquire(Some(&fixture.events));
        wait_for_keys(&mut session);

        session.on_provision_error(Arc::new(Error::Other("late failure".into())));

        assert_eq!(session.state(), SessionState::OpenedWithKeys);
        assert!(session.error().is_none());
        assert_eq!(fixture.listener.count("error"), 1);
        session.release(Some(&fixture.events));
    }

    #[test]
    fn open_failure_moves_to_error() {
        let fixture = Fixture::new();
        fixture.engine.fail_next_open(Error::Engine("no resources".into()));
        let mut session = fixture.session(streaming_config());

        session.acquire(Some(&fixture.events));

        assert_eq!(session.state(), SessionState::Error);
        assert!(matches!(session.error().map(|e| &**e), Some(Error::Engine(_))));
        assert_eq!(fixture.listener.events(), vec!["error"]);
        session.release(Some(&fixture.events));
        assert_eq!(session.state(), SessionState::Released);
        assert!(session.error().is_none());
    }

    #[test]
    fn released_session_is_not_reused() {
        let fixture = Fixture::new();
        let mut session = fixture.session(streaming_config());
        session.acquire(None);
        session.release(None);

        session.acquire(None);

        assert_eq!(session.state(), SessionState::Released);
        assert_eq!(session.reference_count(), 0);
        assert_eq!(fixture.engine.opens(), 1);
    }

    #[test]
    fn release_without_references_is_ignored() {
        let fixture = Fixture::new();
        let mut session = fixture.session(streaming_config());
        session.release(None);
        assert_eq!(session.reference_count(), 0);
        assert_eq!(session.state(), SessionState::Opening);
    }

    #[test]
    fn drop_closes_open_session() {
        let fixture = Fixture::new();
        let mut session = fixture.session(streaming_config());
        session.acquire(None);
        drop(session);
        assert_eq!(fixture.engine.closes(), 1);
    }
}
