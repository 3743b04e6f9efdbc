use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

/// FIFO of pending reconcile keys with duplicate suppression.
///
/// A key enqueued while already pending is dropped: the worker re-reads the
/// latest object state when it processes the key, so only the fact that
/// something changed needs to be retained. Single consumer.
#[derive(Default)]
pub(super) struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    shutdown: bool,
}

impl WorkQueue {
    pub(super) fn add(&self, key: String) {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return;
        }

        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            self.notify.notify_one();
        }
    }

    /// The next pending key, in arrival order. `None` once the queue has
    /// been shut down and drained.
    pub(super) async fn next(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    return Some(key);
                }

                if state.shutdown {
                    return None;
                }
            }

            self.notify.notified().await;
        }
    }

    pub(super) fn shutdown(&self) {
        self.state.lock().unwrap().shutdown = true;
        // a stored permit wakes the consumer even if it has not yet
        // registered for notification
        self.notify.notify_one();
    }
}
