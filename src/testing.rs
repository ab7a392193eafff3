//! Fake collaborators for driving sessions in tests.
//!
//! Every fake records what it was asked to do and can be told to fail the
//! next call of a given kind. Waiting helpers use a condition variable so
//! tests block on worker and looper threads without sleeping.
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::engine::{
    CryptoEngine, CryptoHandle, KeyRequest, KeyStatus, KeyType, ProvisionRequest,
    LICENSE_DURATION_REMAINING, PLAYBACK_DURATION_REMAINING,
};
use crate::error::{Error, Result, SharedError};
use crate::events::{DrmSessionEventListener, EventContext};
use crate::inbox::{SessionKey, SessionNotifier};
use crate::provisioning::{ProvisioningCoordinator, ReferenceCountListener};
use crate::retry::{DataType, LoadErrorInfo, RetryPolicy};
use crate::scheme::{SchemeData, WIDEVINE_UUID};
use crate::transport::{RequestTransport, TransportError};

/// Block on `condvar` until `done` holds for the guarded state or `timeout` passes.
fn wait_until<T>(
    mutex: &Mutex<T>,
    condvar: &Condvar,
    timeout: Duration,
    mut done: impl FnMut(&T) -> bool,
) -> bool {
    let mut guard = mutex.lock();
    let deadline = std::time::Instant::now() + timeout;
    while !done(&*guard) {
        if condvar.wait_until(&mut guard, deadline).timed_out() {
            return done(&*guard);
        }
    }
    true
}

#[derive(Debug, Default)]
struct EngineState {
    provisioned: bool,
    next_session: u32,
    opens: usize,
    closes: usize,
    restores: usize,
    provision_responses: usize,
    open_failures: VecDeque<Error>,
    restore_failures: VecDeque<Error>,
    key_request_failures: VecDeque<Error>,
    key_response_failures: VecDeque<Error>,
    key_status: KeyStatus,
    key_set_id: Option<Vec<u8>>,
    key_requests: Vec<(Vec<u8>, KeyType)>,
    key_responses: Vec<Vec<u8>>,
}

/// In-memory [`CryptoEngine`].
#[derive(Debug)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    /// A provisioned engine.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState {
                provisioned: true,
                ..EngineState::default()
            }),
        }
    }

    /// An engine that refuses to open sessions until provisioned.
    pub fn unprovisioned() -> Self {
        let engine = Self::new();
        engine.state.lock().provisioned = false;
        engine
    }

    /// Report `seconds` for both the license and playback duration.
    pub fn with_license_duration(self, seconds: i64) -> Self {
        {
            let mut state = self.state.lock();
            state
                .key_status
                .insert(LICENSE_DURATION_REMAINING.to_string(), seconds.to_string());
            state
                .key_status
                .insert(PLAYBACK_DURATION_REMAINING.to_string(), seconds.to_string());
        }
        self
    }

    /// Key-set id returned from every key response.
    pub fn with_key_set_id(self, key_set_id: &[u8]) -> Self {
        self.state.lock().key_set_id = Some(key_set_id.to_vec());
        self
    }

    pub fn fail_next_open(&self, error: Error) {
        self.state.lock().open_failures.push_back(error);
    }

    pub fn fail_next_restore(&self, error: Error) {
        self.state.lock().restore_failures.push_back(error);
    }

    pub fn fail_next_key_request(&self, error: Error) {
        self.state.lock().key_request_failures.push_back(error);
    }

    pub fn fail_next_key_response(&self, error: Error) {
        self.state.lock().key_response_failures.push_back(error);
    }

    pub fn is_provisioned(&self) -> bool {
        self.state.lock().provisioned
    }

    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }

    pub fn restores(&self) -> usize {
        self.state.lock().restores
    }

    pub fn provision_responses(&self) -> usize {
        self.state.lock().provision_responses
    }

    /// Key types of every key request built, in order.
    pub fn key_requests(&self) -> Vec<KeyType> {
        self.state.lock().key_requests.iter().map(|(_, t)| *t).collect()
    }

    pub fn key_request_scopes(&self) -> Vec<Vec<u8>> {
        self.state.lock().key_requests.iter().map(|(s, _)| s.clone()).collect()
    }

    /// Scopes of every key response loaded, in order.
    pub fn key_responses(&self) -> Vec<Vec<u8>> {
        self.state.lock().key_responses.clone()
    }
}

impl CryptoEngine for FakeEngine {
    fn open_session(&self) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if !state.provisioned {
            return Err(Error::NotProvisioned);
        }
        if let Some(error) = state.open_failures.pop_front() {
            return Err(error);
        }
        state.opens += 1;
        state.next_session += 1;
        Ok(format!("session-{}", state.next_session).into_bytes())
    }

    fn close_session(&self, _session_id: &[u8]) {
        self.state.lock().closes += 1;
    }

    fn create_crypto_handle(&self, session_id: &[u8]) -> Result<CryptoHandle> {
        Ok(CryptoHandle {
            scheme: WIDEVINE_UUID,
            session_id: session_id.to_vec(),
            requires_secure_decoder: false,
        })
    }

    fn get_provision_request(&self) -> Result<ProvisionRequest> {
        Ok(ProvisionRequest {
            data: b"provision-request".to_vec(),
            default_url: "https://provisioning.test/certificate".to_string(),
        })
    }

    fn provide_provision_response(&self, _response: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.provision_responses += 1;
        state.provisioned = true;
        Ok(())
    }

    fn get_key_request(
        &self,
        scope: &[u8],
        _scheme_data: Option<&[SchemeData]>,
        key_type: KeyType,
        _parameters: &HashMap<String, String>,
    ) -> Result<KeyRequest> {
        let mut state = self.state.lock();
        if let Some(error) = state.key_request_failures.pop_front() {
            return Err(error);
        }
        state.key_requests.push((scope.to_vec(), key_type));
        Ok(KeyRequest {
            data: b"challenge".to_vec(),
            license_server_url: String::new(),
        })
    }

    fn provide_key_response(&self, scope: &[u8], _response: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        if let Some(error) = state.key_response_failures.pop_front() {
            return Err(error);
        }
        state.key_responses.push(scope.to_vec());
        Ok(state.key_set_id.clone())
    }

    fn restore_keys(&self, _session_id: &[u8], _key_set_id: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(error) = state.restore_failures.pop_front() {
            return Err(error);
        }
        state.restores += 1;
        Ok(())
    }

    fn query_key_status(&self, _session_id: &[u8]) -> Result<KeyStatus> {
        Ok(self.state.lock().key_status.clone())
    }
}

#[derive(Debug, Default)]
struct TransportState {
    key_responses: VecDeque<std::result::Result<Vec<u8>, TransportError>>,
    provision_responses: VecDeque<std::result::Result<Vec<u8>, TransportError>>,
    key_attempts: usize,
    provision_attempts: usize,
    held: bool,
}

/// Scripted [`RequestTransport`].
///
/// Queued responses are used first; once empty, key requests return
/// `b"license"` and provisioning requests return `b"certificate"`.
#[derive(Debug, Default)]
pub struct FakeTransport {
    state: Mutex<TransportState>,
    changed: Condvar,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_key_response(&self, response: std::result::Result<Vec<u8>, TransportError>) {
        self.state.lock().key_responses.push_back(response);
    }

    pub fn push_provision_response(&self, response: std::result::Result<Vec<u8>, TransportError>) {
        self.state.lock().provision_responses.push_back(response);
    }

    /// Make requests block until [`FakeTransport::resume`].
    pub fn hold(&self) {
        self.state.lock().held = true;
    }

    pub fn resume(&self) {
        self.state.lock().held = false;
        self.changed.notify_all();
    }

    pub fn key_attempts(&self) -> usize {
        self.state.lock().key_attempts
    }

    pub fn provision_attempts(&self) -> usize {
        self.state.lock().provision_attempts
    }

    pub fn wait_for_key_attempts(&self, count: usize, timeout: Duration) -> bool {
        wait_until(&self.state, &self.changed, timeout, |s| s.key_attempts >= count)
    }

    pub fn wait_for_provision_attempts(&self, count: usize, timeout: Duration) -> bool {
        wait_until(&self.state, &self.changed, timeout, |s| s.provision_attempts >= count)
    }

    /// Count the attempt, wait while held, then take the scripted response.
    fn execute(
        &self,
        count: impl FnOnce(&mut TransportState),
        pick: impl FnOnce(&mut TransportState) -> std::result::Result<Vec<u8>, TransportError>,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock();
        count(&mut state);
        self.changed.notify_all();
        while state.held {
            if self
                .changed
                .wait_for(&mut state, Duration::from_secs(10))
                .timed_out()
            {
                break;
            }
        }
        pick(&mut state)
    }
}

impl RequestTransport for FakeTransport {
    fn execute_provision_request(
        &self,
        _scheme: Uuid,
        _request: &ProvisionRequest,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        self.execute(
            |state| state.provision_attempts += 1,
            |state| {
                state
                    .provision_responses
                    .pop_front()
                    .unwrap_or_else(|| Ok(b"certificate".to_vec()))
            },
        )
    }

    fn execute_key_request(
        &self,
        _scheme: Uuid,
        _request: &KeyRequest,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        self.execute(
            |state| state.key_attempts += 1,
            |state| {
                state
                    .key_responses
                    .pop_front()
                    .unwrap_or_else(|| Ok(b"license".to_vec()))
            },
        )
    }
}

#[derive(Debug, Default)]
struct RetryState {
    concluded: Vec<u64>,
    retry_decisions: usize,
}

/// [`RetryPolicy`] with a fixed retry budget and delay that records its calls.
#[derive(Debug)]
pub struct RecordingRetryPolicy {
    max_retries: u32,
    delay: Duration,
    state: Mutex<RetryState>,
    changed: Condvar,
}

impl RecordingRetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            delay: Duration::from_millis(1),
            state: Mutex::new(RetryState::default()),
            changed: Condvar::new(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn concluded(&self) -> Vec<u64> {
        self.state.lock().concluded.clone()
    }

    pub fn retry_decisions(&self) -> usize {
        self.state.lock().retry_decisions
    }

    pub fn wait_for_concluded(&self, count: usize, timeout: Duration) -> bool {
        wait_until(&self.state, &self.changed, timeout, |s| s.concluded.len() >= count)
    }

    pub fn wait_for_retry_decisions(&self, count: usize, timeout: Duration) -> bool {
        wait_until(&self.state, &self.changed, timeout, |s| s.retry_decisions >= count)
    }
}

impl RetryPolicy for RecordingRetryPolicy {
    fn retry_delay(&self, info: &LoadErrorInfo<'_>) -> Option<Duration> {
        self.state.lock().retry_decisions += 1;
        self.changed.notify_all();
        info.error.is_retryable().then_some(self.delay)
    }

    fn minimum_retry_count(&self, _data_type: DataType) -> u32 {
        self.max_retries
    }

    fn on_task_concluded(&self, task_id: u64) {
        self.state.lock().concluded.push(task_id);
        self.changed.notify_all();
    }
}

#[derive(Default)]
struct ListenerState {
    events: Vec<(String, usize)>,
    errors: Vec<SharedError>,
}

/// Listener recording event names with the window index they were stamped with.
#[derive(Default)]
pub struct RecordingListener {
    state: Mutex<ListenerState>,
    changed: Condvar,
}

impl RecordingListener {
    fn record(&self, name: &str, context: &EventContext) {
        self.state
            .lock()
            .events
            .push((name.to_string(), context.window_index));
        self.changed.notify_all();
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn events_with_context(&self) -> Vec<(String, usize)> {
        self.state.lock().events.clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.state.lock().events.iter().filter(|(n, _)| n == name).count()
    }

    pub fn errors(&self) -> Vec<SharedError> {
        self.state.lock().errors.clone()
    }

    pub fn wait_for_events(&self, count: usize, timeout: Duration) -> bool {
        wait_until(&self.state, &self.changed, timeout, |s| s.events.len() >= count)
    }
}

impl DrmSessionEventListener for RecordingListener {
    fn on_drm_session_acquired(&self, context: &EventContext) {
        self.record("acquired", context);
    }

    fn on_drm_keys_loaded(&self, context: &EventContext) {
        self.record("keys_loaded", context);
    }

    fn on_drm_session_manager_error(&self, context: &EventContext, error: &SharedError) {
        self.state.lock().errors.push(error.clone());
        self.record("error", context);
    }

    fn on_drm_keys_restored(&self, context: &EventContext) {
        self.record("keys_restored", context);
    }

    fn on_drm_keys_removed(&self, context: &EventContext) {
        self.record("keys_removed", context);
    }

    fn on_drm_session_released(&self, context: &EventContext) {
        self.record("released", context);
    }
}

#[derive(Default)]
struct CoordinatorState {
    required: Vec<SessionNotifier>,
    completed: usize,
    errors: Vec<SharedError>,
    released: Vec<SessionKey>,
}

/// [`ProvisioningCoordinator`] that only records calls.
///
/// Tests drive provisioning through the recorded notifiers.
#[derive(Default)]
pub struct RecordingCoordinator {
    state: Mutex<CoordinatorState>,
}

impl RecordingCoordinator {
    pub fn required(&self) -> Vec<SessionNotifier> {
        self.state.lock().required.clone()
    }

    pub fn completed(&self) -> usize {
        self.state.lock().completed
    }

    pub fn errors(&self) -> Vec<SharedError> {
        self.state.lock().errors.clone()
    }

    pub fn released(&self) -> Vec<SessionKey> {
        self.state.lock().released.clone()
    }
}

impl ProvisioningCoordinator for RecordingCoordinator {
    fn provision_required(&self, session: SessionNotifier) {
        self.state.lock().required.push(session);
    }

    fn on_provision_completed(&self) {
        self.state.lock().completed += 1;
    }

    fn on_provision_error(&self, error: SharedError) {
        self.state.lock().errors.push(error);
    }

    fn session_released(&self, session: SessionKey) {
        self.state.lock().released.push(session);
    }
}

/// Direction of a reference count change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceChange {
    Incremented(usize),
    Decremented(usize),
}

/// [`ReferenceCountListener`] recording every change in order.
#[derive(Default)]
pub struct RecordingReferenceListener {
    changes: Mutex<Vec<(SessionKey, ReferenceChange)>>,
}

impl RecordingReferenceListener {
    pub fn changes(&self) -> Vec<(SessionKey, ReferenceChange)> {
        self.changes.lock().clone()
    }
}

impl ReferenceCountListener for RecordingReferenceListener {
    fn on_reference_count_incremented(&self, session: SessionKey, new_count: usize) {
        self.changes
            .lock()
            .push((session, ReferenceChange::Incremented(new_count)));
    }

    fn on_reference_count_decremented(&self, session: SessionKey, new_count: usize) {
        self.changes
            .lock()
            .push((session, ReferenceChange::Decremented(new_count)));
    }
}
