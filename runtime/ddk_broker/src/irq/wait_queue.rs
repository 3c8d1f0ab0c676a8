//! FIFO queue of threads blocked on an interrupt object
//!
//! Each waiter parks on its own `crossbeam` [`Parker`](crossbeam::sync::Parker)
//! and leaves the matching [`Unparker`] here. Triggers pop one waiter from the
//! front; cancellation drains them all. The queue never allocates after
//! construction, so dequeueing is safe from interrupt-handler context.

use crate::config::MAX_WAITERS;
use crossbeam::sync::Unparker;

pub(crate) type WaiterId = u64;

struct Waiter {
    id: WaiterId,
    unparker: Unparker,
}

pub(crate) struct WaitQueue {
    waiters: [Option<Waiter>; MAX_WAITERS],
    count: usize,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            waiters: core::array::from_fn(|_| None),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn contains(&self, id: WaiterId) -> bool {
        self.waiters[..self.count]
            .iter()
            .flatten()
            .any(|waiter| waiter.id == id)
    }

    /// Add a waiter at the back
    ///
    /// Returns `false` if the queue is full.
    pub fn enqueue(&mut self, id: WaiterId, unparker: Unparker) -> bool {
        if self.count == MAX_WAITERS {
            return false;
        }
        self.waiters[self.count] = Some(Waiter { id, unparker });
        self.count += 1;
        true
    }

    /// Take the waiter at the front
    pub fn dequeue(&mut self) -> Option<Unparker> {
        if self.count == 0 {
            return None;
        }
        let waiter = self.waiters[0].take();
        self.waiters[..self.count].rotate_left(1);
        self.count -= 1;
        waiter.map(|w| w.unparker)
    }

    /// Drop a waiter that is leaving on its own
    pub fn remove(&mut self, id: WaiterId) {
        let position = self.waiters[..self.count]
            .iter()
            .position(|w| w.as_ref().is_some_and(|w| w.id == id));

        if let Some(index) = position {
            self.waiters[index] = None;
            self.waiters[index..self.count].rotate_left(1);
            self.count -= 1;
        }
    }

    /// Take every waiter, front first
    pub fn drain(&mut self) -> Vec<Unparker> {
        let drained = self.waiters[..self.count]
            .iter_mut()
            .filter_map(|w| w.take().map(|w| w.unparker))
            .collect();
        self.count = 0;
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::sync::Parker;

    #[test]
    fn test_fifo_dequeue() {
        let parkers: Vec<Parker> = (0..3).map(|_| Parker::new()).collect();
        let mut queue = WaitQueue::new();

        for (id, parker) in parkers.iter().enumerate() {
            assert!(queue.enqueue(id as WaiterId, parker.unparker().clone()));
        }
        assert_eq!(queue.len(), 3);

        // Waking the front waiter leaves a token on parker 0 only
        queue.dequeue().unwrap().unpark();
        assert!(!queue.contains(0));
        assert!(queue.contains(1));
        parkers[0].park();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_remove_keeps_order() {
        let parker = Parker::new();
        let mut queue = WaitQueue::new();
        for id in 0..4 {
            queue.enqueue(id, parker.unparker().clone());
        }

        queue.remove(1);
        assert_eq!(queue.len(), 3);
        assert!(!queue.contains(1));

        // Remaining order is 0, 2, 3
        queue.dequeue();
        assert!(!queue.contains(0));
        queue.dequeue();
        assert!(!queue.contains(2));
        assert!(queue.contains(3));
    }

    #[test]
    fn test_full_queue_refuses() {
        let parker = Parker::new();
        let mut queue = WaitQueue::new();
        for id in 0..MAX_WAITERS as WaiterId {
            assert!(queue.enqueue(id, parker.unparker().clone()));
        }
        assert!(!queue.enqueue(999, parker.unparker().clone()));
    }

    #[test]
    fn test_drain() {
        let parker = Parker::new();
        let mut queue = WaitQueue::new();
        queue.enqueue(1, parker.unparker().clone());
        queue.enqueue(2, parker.unparker().clone());

        assert_eq!(queue.drain().len(), 2);
        assert_eq!(queue.len(), 0);
        assert!(queue.dequeue().is_none());
    }
}
