//! Per-slot event ring
//!
//! Fixed-capacity FIFO of trigger events for one slot. Pushing never
//! allocates, so it is safe from interrupt-handler context. When the ring is
//! full the oldest event is dropped and an overflow flag is raised; the flag
//! rides along with the next event handed to a waiter.

use super::Time;
use crate::config::EVENT_QUEUE_DEPTH;

/// One trigger of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct InterruptEvent {
    /// Position in the object's global trigger order
    pub seq: u64,

    /// Time the trigger happened
    pub timestamp: Time,
}

pub(crate) struct EventQueue {
    events: [InterruptEvent; EVENT_QUEUE_DEPTH],
    head: usize,
    len: usize,
    overflowed: bool,
}

impl EventQueue {
    pub const fn new() -> Self {
        Self {
            events: [InterruptEvent {
                seq: 0,
                timestamp: 0,
            }; EVENT_QUEUE_DEPTH],
            head: 0,
            len: 0,
            overflowed: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Append an event, dropping the oldest if full
    ///
    /// Returns `true` if an event was dropped.
    pub fn push(&mut self, event: InterruptEvent) -> bool {
        let dropped = self.len == EVENT_QUEUE_DEPTH;
        if dropped {
            self.head = (self.head + 1) % EVENT_QUEUE_DEPTH;
            self.len -= 1;
            self.overflowed = true;
        }

        self.events[(self.head + self.len) % EVENT_QUEUE_DEPTH] = event;
        self.len += 1;
        dropped
    }

    /// Oldest pending event
    pub fn front(&self) -> Option<&InterruptEvent> {
        if self.len == 0 {
            None
        } else {
            Some(&self.events[self.head])
        }
    }

    /// Remove the oldest event, with the overflow flag accumulated since the
    /// previous pop (the flag is cleared)
    pub fn pop(&mut self) -> Option<(InterruptEvent, bool)> {
        if self.len == 0 {
            return None;
        }

        let event = self.events[self.head];
        self.head = (self.head + 1) % EVENT_QUEUE_DEPTH;
        self.len -= 1;

        let overflowed = core::mem::take(&mut self.overflowed);
        Some((event, overflowed))
    }

    /// Discard everything, including the overflow flag
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
        self.overflowed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u64) -> InterruptEvent {
        InterruptEvent {
            seq,
            timestamp: seq as Time * 100,
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = EventQueue::new();
        assert!(queue.is_empty());

        queue.push(event(1));
        queue.push(event(2));
        assert_eq!(queue.front(), Some(&event(1)));

        assert_eq!(queue.pop(), Some((event(1), false)));
        assert_eq!(queue.pop(), Some((event(2), false)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut queue = EventQueue::new();
        for seq in 0..EVENT_QUEUE_DEPTH as u64 {
            assert!(!queue.push(event(seq)));
        }
        assert_eq!(queue.len(), EVENT_QUEUE_DEPTH);

        // One more evicts seq 0
        assert!(queue.push(event(100)));
        assert_eq!(queue.len(), EVENT_QUEUE_DEPTH);

        // Overflow is reported once, with the first surviving event
        assert_eq!(queue.pop(), Some((event(1), true)));
        assert_eq!(queue.pop(), Some((event(2), false)));

        let mut last = None;
        while let Some((ev, _)) = queue.pop() {
            last = Some(ev);
        }
        assert_eq!(last, Some(event(100)));
    }

    #[test]
    fn test_clear_resets_overflow() {
        let mut queue = EventQueue::new();
        for seq in 0..=EVENT_QUEUE_DEPTH as u64 {
            queue.push(event(seq));
        }
        queue.clear();
        assert!(queue.is_empty());

        queue.push(event(42));
        assert_eq!(queue.pop(), Some((event(42), false)));
    }
}
