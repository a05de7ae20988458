//! Deferred work queue consumed by the action worker thread.
//!
//! Long-running tasks must not block the datagram loop; the loop pushes an
//! [`Action`] and the worker picks it up. The pop wait is bounded so the
//! worker re-checks the running flag at least every [`POP_TIMEOUT`].

use crate::types::NodeId;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Queue capacity; pushes beyond it are dropped.
pub const QUEUE_CAPACITY: usize = 1024;

/// Worker wake-up interval while the queue is idle.
pub const POP_TIMEOUT: Duration = Duration::from_millis(100);

/// Enumerated deferred tasks, each with its own payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Ask `node_id` for its public key (the opening handshake step).
    RequestPublicKey { node_id: NodeId },
}

/// Bounded FIFO under a mutex, with a condvar waking the worker on push.
pub struct ActionQueue {
    queue: Mutex<VecDeque<Action>>,
    available: Condvar,
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Enqueue an action and wake the worker. Returns false (and drops the
    /// action) when the queue is full.
    pub fn push(&self, action: Action) -> bool {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= QUEUE_CAPACITY {
            return false;
        }
        queue.push_back(action);
        self.available.notify_one();
        true
    }

    /// Pop the next action, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Action> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(action) = queue.pop_front() {
                return Some(action);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(queue, deadline - now)
                .unwrap();
            queue = guard;
        }
    }

    /// Wake the worker without queueing anything, so it notices shutdown.
    pub fn interrupt(&self) {
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_order() {
        let queue = ActionQueue::new();
        queue.push(Action::RequestPublicKey { node_id: 1 });
        queue.push(Action::RequestPublicKey { node_id: 2 });

        assert_eq!(
            queue.pop_timeout(Duration::from_millis(10)),
            Some(Action::RequestPublicKey { node_id: 1 })
        );
        assert_eq!(
            queue.pop_timeout(Duration::from_millis(10)),
            Some(Action::RequestPublicKey { node_id: 2 })
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_times_out_when_idle() {
        let queue = ActionQueue::new();
        let start = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn push_wakes_waiting_worker() {
        let queue = Arc::new(ActionQueue::new());
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.pop_timeout(Duration::from_secs(5)))
        };

        std::thread::sleep(Duration::from_millis(20));
        queue.push(Action::RequestPublicKey { node_id: 42 });

        assert_eq!(
            consumer.join().unwrap(),
            Some(Action::RequestPublicKey { node_id: 42 })
        );
    }

    #[test]
    fn capacity_bounds_pushes() {
        let queue = ActionQueue::new();
        for id in 0..QUEUE_CAPACITY as u64 {
            assert!(queue.push(Action::RequestPublicKey { node_id: id }));
        }
        assert!(!queue.push(Action::RequestPublicKey { node_id: 9999 }));
        assert_eq!(queue.len(), QUEUE_CAPACITY);
    }
}
