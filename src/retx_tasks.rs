//! Bookkeeping for the per-receiver retransmission tasks.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;

use crate::tcp_send::ReceiverId;

/// Thread-safe registry of the running per-receiver tasks, kept so that
/// shutdown can cancel all of them at once.
pub struct RetxTaskList {
    tasks: Mutex<FxHashMap<ReceiverId, JoinHandle<()>>>,
}

impl RetxTaskList {
    pub fn new() -> RetxTaskList {
        RetxTaskList {
            tasks: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn add(&self, id: ReceiverId, handle: JoinHandle<()>) {
        self.tasks.lock().insert(id, handle);
    }

    /// Called by a finished worker for itself; a no-op after [shutdown].
    pub fn remove(&self, id: ReceiverId) {
        self.tasks.lock().remove(&id);
    }

    /// Cancels every registered task and empties the list.
    pub fn shutdown(&self) {
        let drained: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock();
            tasks.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &drained {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}
