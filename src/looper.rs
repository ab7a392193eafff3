//! Execution contexts listeners are called back on.
use std::thread::{self, JoinHandle};

use crate::error::Result;

/// A unit of work posted to a [`DeliveryContext`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere callbacks can run.
///
/// Tasks posted to one context run in the order they were posted.
pub trait DeliveryContext: Send + Sync {
    fn post(&self, task: Task);
}

/// Runs every task inline on the posting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct Immediate;

impl DeliveryContext for Immediate {
    fn post(&self, task: Task) {
        task();
    }
}

/// A dedicated thread draining tasks in FIFO order.
pub struct Looper {
    name: String,
    tx: Option<kanal::Sender<Task>>,
    handle: Option<JoinHandle<()>>,
}

impl Looper {
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (tx, rx) = kanal::unbounded::<Task>();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            while let Ok(task) = rx.recv() {
                task();
            }
        })?;

        Ok(Self {
            name,
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run every task posted so far, then stop the thread.
    pub fn quit_safely(mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Looper {} panicked", self.name);
            }
        }
    }
}

impl DeliveryContext for Looper {
    fn post(&self, task: Task) {
        let sent = self.tx.as_ref().is_some_and(|tx| tx.send(task).is_ok());
        if !sent {
            warn!("Looper {} is gone, dropping task", self.name);
        }
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        // Queued tasks still run; the thread exits once the queue is empty.
        self.tx.take();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn immediate_runs_inline() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        Immediate.post(Box::new(move || s.lock().push(1)));
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn looper_preserves_order() {
        let looper = Looper::spawn("test-looper").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let s = seen.clone();
            looper.post(Box::new(move || s.lock().push(i)));
        }
        looper.quit_safely();
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }
}
