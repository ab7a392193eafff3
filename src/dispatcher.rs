//! Background execution of provisioning and key requests.
//!
//! Each opened session owns one [`RequestDispatcher`]. Requests are posted
//! from the owning context and executed one at a time on a dedicated worker
//! thread; retries are rescheduled on the same worker after the delay the
//! [`RetryPolicy`] asks for. Every concluded request is handed back through
//! the delivery callback the dispatcher was spawned with.
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use kanal::ReceiveErrorTimeout;
use uuid::Uuid;

use crate::engine::{KeyRequest, ProvisionRequest};
use crate::error::{Error, Result};
use crate::retry::{DataType, LoadErrorInfo, RetryPolicy};
use crate::transport::{RequestTransport, TransportError};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a process wide unique, monotonically increasing task id.
pub fn next_task_id() -> u64 {
    NEXT_TASK_ID.fetch_add(1, AtomicOrdering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Provision,
    Keys,
}

/// Payload of a request sent to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrmRequest {
    Provision(ProvisionRequest),
    Key(KeyRequest),
}

impl DrmRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            DrmRequest::Provision(_) => RequestKind::Provision,
            DrmRequest::Key(_) => RequestKind::Keys,
        }
    }
}

/// A request travelling through the worker, including its retry bookkeeping.
#[derive(Debug)]
pub struct PendingRequest {
    pub task_id: u64,
    pub allow_retry: bool,
    pub started_at: Instant,
    pub request: DrmRequest,
    pub error_count: u32,
}

/// Result of a concluded request, matched against the session's tracked task id.
#[derive(Debug)]
pub struct RequestOutcome {
    pub task_id: u64,
    pub kind: RequestKind,
    pub result: Result<Vec<u8>>,
}

/// Callback handing outcomes back to the owning context.
pub type DeliverFn = Box<dyn Fn(RequestOutcome) + Send + 'static>;

/// Serializes requests onto a background worker.
pub struct RequestDispatcher {
    tx: Option<kanal::Sender<PendingRequest>>,
    cancelled: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl RequestDispatcher {
    /// Spawn the worker thread for a session of the given scheme.
    pub fn spawn(
        scheme: Uuid,
        transport: Arc<dyn RequestTransport>,
        retry_policy: Arc<dyn RetryPolicy>,
        deliver: DeliverFn,
    ) -> Result<Self> {
        let (tx, rx) = kanal::unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            scheme,
            transport,
            retry_policy,
            deliver,
            rx,
            cancelled: cancelled.clone(),
            delayed: BinaryHeap::new(),
            sequence: 0,
        };
        let handle = thread::Builder::new()
            .name("drm-request-handler".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            tx: Some(tx),
            cancelled,
            worker: Some(handle),
        })
    }

    /// Enqueue a request and return its task id.
    pub fn post(&self, request: DrmRequest, allow_retry: bool) -> u64 {
        let task = PendingRequest {
            task_id: next_task_id(),
            allow_retry,
            started_at: Instant::now(),
            request,
            error_count: 0,
        };
        let task_id = task.task_id;
        let kind = task.request.kind();
        match &self.tx {
            Some(tx) if tx.send(task).is_ok() => {
                trace!("Posted {:?} request as task {}", kind, task_id);
            }
            _ => {
                warn!("Dropping {:?} request task {} posted after shutdown", kind, task_id);
            }
        }
        task_id
    }

    /// Stop accepting work and cancel queued or delayed requests.
    ///
    /// A request already executing is not interrupted; its outcome is still
    /// delivered and is expected to be dropped as stale by the receiver.
    pub fn shutdown(&mut self) {
        self.cancelled.store(true, AtomicOrdering::Release);
        self.tx.take();
        // Detached: joining would block the owning context on a slow server.
        self.worker.take();
    }

    pub fn is_shut_down(&self) -> bool {
        self.tx.is_none()
    }
}

impl Drop for RequestDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Delayed {
    due: Instant,
    sequence: u64,
    task: PendingRequest,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.sequence).cmp(&(other.due, other.sequence))
    }
}

struct Worker {
    scheme: Uuid,
    transport: Arc<dyn RequestTransport>,
    retry_policy: Arc<dyn RetryPolicy>,
    deliver: DeliverFn,
    rx: kanal::Receiver<PendingRequest>,
    cancelled: Arc<AtomicBool>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    sequence: u64,
}

impl Worker {
    fn run(mut self) {
        trace!("Request worker started");

        while let Some(task) = self.next_task() {
            if self.cancelled.load(AtomicOrdering::Acquire) {
                self.retry_policy.on_task_concluded(task.task_id);
                continue;
            }
            self.execute(task);
        }

        // Cancellation still counts as a conclusion for in-flight accounting.
        for Reverse(delayed) in self.delayed.drain() {
            self.retry_policy.on_task_concluded(delayed.task.task_id);
        }
        while let Ok(Some(task)) = self.rx.try_recv() {
            self.retry_policy.on_task_concluded(task.task_id);
        }

        trace!("Request worker stopped");
    }

    /// Next task to run: a due retry, or a newly posted request.
    ///
    /// Returns `None` once the dispatcher is shut down.
    fn next_task(&mut self) -> Option<PendingRequest> {
        loop {
            if self.cancelled.load(AtomicOrdering::Acquire) {
                return None;
            }

            let Some(Reverse(next)) = self.delayed.peek() else {
                return self.rx.recv().ok();
            };

            let now = Instant::now();
            if next.due <= now {
                return self.delayed.pop().map(|Reverse(delayed)| delayed.task);
            }

            match self.rx.recv_timeout(next.due - now) {
                Ok(task) => return Some(task),
                Err(ReceiveErrorTimeout::Timeout) => continue,
                Err(_) => return None,
            }
        }
    }

    fn execute(&mut self, mut task: PendingRequest) {
        let response = match &task.request {
            DrmRequest::Provision(request) => {
                self.transport.execute_provision_request(self.scheme, request)
            }
            DrmRequest::Key(request) => self.transport.execute_key_request(self.scheme, request),
        };

        let result = match response {
            Ok(bytes) => Ok(bytes),
            Err(error) => {
                if let Some(delay) = self.retry_delay(&mut task, &error) {
                    debug!(
                        "Retrying task {} in {:?} after error {}: {}",
                        task.task_id, delay, task.error_count, error
                    );
                    self.schedule(task, delay);
                    return;
                }
                Err(Error::Transport(error))
            }
        };

        self.retry_policy.on_task_concluded(task.task_id);
        (self.deliver)(RequestOutcome {
            task_id: task.task_id,
            kind: task.request.kind(),
            result,
        });
    }

    fn retry_delay(&self, task: &mut PendingRequest, error: &TransportError) -> Option<Duration> {
        if !task.allow_retry {
            return None;
        }
        task.error_count += 1;
        if task.error_count > self.retry_policy.minimum_retry_count(DataType::Drm) {
            return None;
        }
        self.retry_policy.retry_delay(&LoadErrorInfo {
            task_id: task.task_id,
            data_type: DataType::Drm,
            error,
            error_count: task.error_count,
            load_duration: task.started_at.elapsed(),
        })
    }

    fn schedule(&mut self, task: PendingRequest, delay: Duration) {
        self.sequence += 1;
        self.delayed.push(Reverse(Delayed {
            due: Instant::now() + delay,
            sequence: self.sequence,
            task,
        }));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{FakeTransport, RecordingRetryPolicy};

    fn key_request() -> DrmRequest {
        DrmRequest::Key(KeyRequest {
            data: b"challenge".to_vec(),
            license_server_url: String::new(),
        })
    }

    fn spawn(
        transport: Arc<FakeTransport>,
        policy: Arc<RecordingRetryPolicy>,
    ) -> (RequestDispatcher, kanal::Receiver<RequestOutcome>) {
        let (tx, rx) = kanal::unbounded();
        let dispatcher = RequestDispatcher::spawn(
            Uuid::nil(),
            transport,
            policy,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )
        .expect("spawn dispatcher");
        (dispatcher, rx)
    }

    #[test]
    fn delivers_successful_response() {
        let transport = Arc::new(FakeTransport::new());
        let policy = Arc::new(RecordingRetryPolicy::new(3));
        let (dispatcher, rx) = spawn(transport.clone(), policy.clone());

        let task_id = dispatcher.post(key_request(), true);
        let outcome = rx.recv_timeout(Duration::from_secs(5)).expect("outcome");

        assert_eq!(outcome.task_id, task_id);
        assert_eq!(outcome.kind, RequestKind::Keys);
        assert_eq!(outcome.result.expect("bytes"), b"license".to_vec());
        assert_eq!(policy.concluded(), vec![task_id]);
    }

    #[test]
    fn stops_after_retry_budget() {
        let transport = Arc::new(FakeTransport::new());
        for _ in 0..10 {
            transport.push_key_response(Err(TransportError::new("connection reset")));
        }
        let policy = Arc::new(RecordingRetryPolicy::new(2));
        let (dispatcher, rx) = spawn(transport.clone(), policy.clone());

        let task_id = dispatcher.post(key_request(), true);
        let outcome = rx.recv_timeout(Duration::from_secs(5)).expect("outcome");

        assert!(matches!(outcome.result, Err(Error::Transport(_))));
        assert_eq!(transport.key_attempts(), 3);
        assert_eq!(policy.concluded(), vec![task_id]);
    }

    #[test]
    fn no_retry_when_disallowed() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_key_response(Err(TransportError::new("connection reset")));
        let policy = Arc::new(RecordingRetryPolicy::new(5));
        let (dispatcher, rx) = spawn(transport.clone(), policy);

        dispatcher.post(key_request(), false);
        let outcome = rx.recv_timeout(Duration::from_secs(5)).expect("outcome");

        assert!(outcome.result.is_err());
        assert_eq!(transport.key_attempts(), 1);
    }

    #[test]
    fn recovers_after_transient_failure() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_key_response(Err(TransportError::http_status(503, "https://l/")));
        let policy = Arc::new(RecordingRetryPolicy::new(3));
        let (dispatcher, rx) = spawn(transport.clone(), policy);

        dispatcher.post(key_request(), true);
        let outcome = rx.recv_timeout(Duration::from_secs(5)).expect("outcome");

        assert!(outcome.result.is_ok());
        assert_eq!(transport.key_attempts(), 2);
    }

    #[test]
    fn shutdown_concludes_delayed_retries() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_key_response(Err(TransportError::new("connection reset")));
        let policy = Arc::new(RecordingRetryPolicy::new(3).with_delay(Duration::from_secs(60)));
        let (mut dispatcher, rx) = spawn(transport.clone(), policy.clone());

        let task_id = dispatcher.post(key_request(), true);
        assert!(policy.wait_for_retry_decisions(1, Duration::from_secs(5)));
        dispatcher.shutdown();

        assert!(policy.wait_for_concluded(1, Duration::from_secs(5)));
        assert_eq!(policy.concluded(), vec![task_id]);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(dispatcher.is_shut_down());
    }
}
