//! Interrupt dispatcher - slot table, triggers and blocking waits
//!
//! ## Locking
//!
//! The whole slot table sits behind one spinlock. Every critical section is
//! short and bounded: bind/unbind touch one slot plus the source's route
//! table, trigger delivery pushes into a fixed ring and pops one waiter. The
//! lock is never held while a thread is parked or unparked.
//!
//! Lock order is slot table, then source route table. Sources release their
//! own lock before calling [`InterruptSink::deliver`], so delivery never
//! inverts that order.
//!
//! ## Events
//!
//! A slot is TRIGGERED exactly while it has pending events. The coalescing
//! [`wait`](InterruptDispatcher::wait) reports and drains every triggered
//! slot at once; [`wait_with_timestamp`](InterruptDispatcher::wait_with_timestamp)
//! pops the single oldest event across all slots, using a per-object
//! sequence number to order triggers.

use super::event_queue::{EventQueue, InterruptEvent};
use super::source::{Binding, InterruptSink, InterruptSource, Subscription};
use super::wait_queue::{WaitQueue, WaiterId};
use super::{InterruptOptions, Time};
use crate::config::MAX_SLOTS;
use crate::{DdkError, Result};
use crossbeam::sync::{Parker, Unparker};
use spin::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// State of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Unbound,
    Bound,
    Triggered,
}

/// Result of a timestamped wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampedInterrupt {
    /// Slot that triggered
    pub slot: u32,

    /// When it triggered
    pub timestamp: Time,

    /// Older events of this slot were dropped because its ring was full
    pub overflowed: bool,
}

struct Slot {
    vector: Option<u32>,
    options: InterruptOptions,
    /// Most recent trigger time, latest wins
    timestamp: Time,
    events: EventQueue,
    binding_id: u64,
    subscription: Option<(Subscription, Arc<dyn InterruptSource>)>,
}

impl Slot {
    fn new() -> Self {
        Self {
            vector: None,
            options: InterruptOptions::empty(),
            timestamp: 0,
            events: EventQueue::new(),
            binding_id: 0,
            subscription: None,
        }
    }

    fn state(&self) -> SlotState {
        match self.vector {
            None => SlotState::Unbound,
            Some(_) if self.events.is_empty() => SlotState::Bound,
            Some(_) => SlotState::Triggered,
        }
    }

    /// Return the slot to UNBOUND, handing back its registration
    fn reset(&mut self) -> Option<(Subscription, Arc<dyn InterruptSource>)> {
        self.vector = None;
        self.options = InterruptOptions::empty();
        self.events.clear();
        self.subscription.take()
    }
}

struct SlotTable {
    slots: Vec<Slot>,
    waiters: WaitQueue,
    /// Bumped on unbind and destroy; waiters that saw an older epoch are
    /// cancelled
    cancel_epoch: u64,
    next_seq: u64,
    destroyed: bool,
}

impl SlotTable {
    /// Record a trigger and pick a waiter to wake
    fn record(&mut self, slot: usize, timestamp: Time) -> Option<Unparker> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let slot = &mut self.slots[slot];
        slot.timestamp = timestamp;
        slot.events.push(InterruptEvent { seq, timestamp });

        self.waiters.dequeue()
    }

    /// Clear every triggered slot and return them as a bitmask
    fn take_triggered_mask(&mut self) -> Option<u64> {
        let mut mask = 0u64;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.state() == SlotState::Triggered {
                slot.events.clear();
                mask |= 1u64 << index;
            }
        }
        (mask != 0).then_some(mask)
    }

    /// Pop the oldest event across all slots
    fn take_oldest_event(&mut self) -> Option<TimestampedInterrupt> {
        let index = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.events.front().map(|ev| (index, ev.seq)))
            .min_by_key(|&(_, seq)| seq)
            .map(|(index, _)| index)?;

        let (event, overflowed) = self.slots[index].events.pop()?;
        Some(TimestampedInterrupt {
            slot: index as u32,
            timestamp: event.timestamp,
            overflowed,
        })
    }

    /// Cancel every blocked waiter
    fn cancel_waiters(&mut self) -> Vec<Unparker> {
        self.cancel_epoch += 1;
        self.waiters.drain()
    }
}

/// Kernel object multiplexing interrupt vectors onto slots
pub struct InterruptDispatcher {
    table: Mutex<SlotTable>,
    next_binding: AtomicU64,
    next_waiter: AtomicU64,
    handle_count: AtomicUsize,
}

impl InterruptDispatcher {
    /// Create an object with every slot UNBOUND
    ///
    /// The caller is responsible for having validated the root resource.
    pub fn create() -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(SlotTable {
                slots: (0..MAX_SLOTS).map(|_| Slot::new()).collect(),
                waiters: WaitQueue::new(),
                cancel_epoch: 0,
                next_seq: 0,
                destroyed: false,
            }),
            next_binding: AtomicU64::new(1),
            next_waiter: AtomicU64::new(1),
            handle_count: AtomicUsize::new(0),
        })
    }

    fn check_slot(slot: u32) -> Result<usize> {
        let index = slot as usize;
        if index < MAX_SLOTS {
            Ok(index)
        } else {
            Err(DdkError::InvalidArgs)
        }
    }

    /// Bind `slot` to `vector` on `source`
    ///
    /// Rebinding a slot to the vector and options it already has is a no-op.
    ///
    /// # Errors
    /// - `InvalidArgs` for an out-of-range slot, bad options, or a vector the
    ///   source does not have
    /// - `AlreadyBound` if the slot is bound to something else, the vector is
    ///   bound to another slot of this object, or the source routes the vector
    ///   elsewhere
    /// - `BadState` if the object has been destroyed
    pub fn bind(
        self: &Arc<Self>,
        slot: u32,
        vector: u32,
        options: InterruptOptions,
        source: &Arc<dyn InterruptSource>,
    ) -> Result<()> {
        let index = Self::check_slot(slot)?;
        let mode = options.mode()?;

        let mut table = self.table.lock();
        if table.destroyed {
            return Err(DdkError::BadState);
        }

        let current = &table.slots[index];
        if let Some(bound) = current.vector {
            return if bound == vector && current.options == options {
                Ok(())
            } else {
                Err(DdkError::AlreadyBound)
            };
        }
        if table.slots.iter().any(|s| s.vector == Some(vector)) {
            return Err(DdkError::AlreadyBound);
        }

        let binding = Binding {
            slot,
            vector,
            id: self.next_binding.fetch_add(1, Ordering::Relaxed),
        };
        let weak: Weak<InterruptDispatcher> = Arc::downgrade(self);
        let sink: Weak<dyn InterruptSink> = weak;
        let subscription = source.register(binding, mode, sink)?;

        let entry = &mut table.slots[index];
        entry.vector = Some(vector);
        entry.options = options;
        entry.timestamp = 0;
        entry.events.clear();
        entry.binding_id = binding.id;
        entry.subscription = Some((subscription, Arc::clone(source)));
        drop(table);

        log::debug!("irq: bound slot {} to vector {} ({:?})", slot, vector, mode);
        Ok(())
    }

    /// Unbind `slot` and cancel every blocked waiter
    ///
    /// Unbinding an UNBOUND slot succeeds (waiters are still cancelled).
    ///
    /// # Errors
    /// `InvalidArgs` for an out-of-range slot
    pub fn unbind(&self, slot: u32) -> Result<()> {
        let index = Self::check_slot(slot)?;

        let mut table = self.table.lock();
        let vector = table.slots[index].vector;
        if let Some((subscription, source)) = table.slots[index].reset() {
            source.unregister(subscription);
        }
        let cancelled = table.cancel_waiters();
        drop(table);

        if let Some(vector) = vector {
            log::debug!("irq: unbound slot {} (vector {})", slot, vector);
        }
        for unparker in cancelled {
            unparker.unpark();
        }
        Ok(())
    }

    /// Software-injected trigger
    ///
    /// # Errors
    /// - `InvalidArgs` for an out-of-range slot
    /// - `BadState` if the slot is UNBOUND
    pub fn signal(&self, slot: u32, timestamp: Time) -> Result<()> {
        let index = Self::check_slot(slot)?;

        let mut table = self.table.lock();
        if table.slots[index].vector.is_none() {
            return Err(DdkError::BadState);
        }
        let waiter = table.record(index, timestamp);
        drop(table);

        if let Some(unparker) = waiter {
            unparker.unpark();
        }
        Ok(())
    }

    /// Block until at least one slot is TRIGGERED, then clear and return the
    /// bitmask of all triggered slots
    ///
    /// # Errors
    /// - `Cancelled` if a slot is unbound or the object destroyed meanwhile
    /// - `BadState` if too many threads are already waiting
    pub fn wait(&self) -> Result<u64> {
        self.block_until(SlotTable::take_triggered_mask)
    }

    /// Block until a trigger is pending, then return the oldest one
    ///
    /// Events come back in the order they were recorded across all slots,
    /// one per call.
    ///
    /// # Errors
    /// Same as [`wait`](Self::wait)
    pub fn wait_with_timestamp(&self) -> Result<TimestampedInterrupt> {
        self.block_until(SlotTable::take_oldest_event)
    }

    fn block_until<T>(&self, mut take: impl FnMut(&mut SlotTable) -> Option<T>) -> Result<T> {
        let parker = Parker::new();
        let id: WaiterId = self.next_waiter.fetch_add(1, Ordering::Relaxed);

        let mut table = self.table.lock();
        let epoch = table.cancel_epoch;

        loop {
            if table.destroyed || table.cancel_epoch != epoch {
                table.waiters.remove(id);
                return Err(DdkError::Cancelled);
            }

            if let Some(value) = take(&mut *table) {
                table.waiters.remove(id);
                return Ok(value);
            }

            if !table.waiters.contains(id) && !table.waiters.enqueue(id, parker.unparker().clone())
            {
                drop(table);
                log::warn!("irq: waiter queue full");
                return Err(DdkError::BadState);
            }

            drop(table);
            parker.park();
            table = self.table.lock();
        }
    }

    /// Unbind every slot and cancel every waiter
    ///
    /// Runs when the last handle closes, and again (as a no-op) on drop.
    pub fn destroy(&self) {
        let mut table = self.table.lock();
        if table.destroyed {
            return;
        }
        table.destroyed = true;

        for slot in table.slots.iter_mut() {
            if let Some((subscription, source)) = slot.reset() {
                source.unregister(subscription);
            }
        }
        let cancelled = table.cancel_waiters();
        drop(table);

        log::debug!("irq: destroyed interrupt object, {} waiters cancelled", cancelled.len());
        for unparker in cancelled {
            unparker.unpark();
        }
    }

    /// Current state of a slot
    pub fn slot_state(&self, slot: u32) -> Result<SlotState> {
        let index = Self::check_slot(slot)?;
        Ok(self.table.lock().slots[index].state())
    }

    /// Vector bound to a slot
    pub fn bound_vector(&self, slot: u32) -> Result<Option<u32>> {
        let index = Self::check_slot(slot)?;
        Ok(self.table.lock().slots[index].vector)
    }

    /// Timestamp of the most recent trigger of a slot
    pub fn last_timestamp(&self, slot: u32) -> Result<Time> {
        let index = Self::check_slot(slot)?;
        Ok(self.table.lock().slots[index].timestamp)
    }

    /// Events queued for a slot that no waiter has consumed yet
    pub fn pending_events(&self, slot: u32) -> Result<usize> {
        let index = Self::check_slot(slot)?;
        Ok(self.table.lock().slots[index].events.len())
    }

    /// Threads currently blocked on this object
    pub fn waiter_count(&self) -> usize {
        self.table.lock().waiters.len()
    }

    /// Has this object been destroyed?
    pub fn is_destroyed(&self) -> bool {
        self.table.lock().destroyed
    }

    pub(crate) fn increment_handles(&self) {
        self.handle_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one handle reference, destroying the object on the last one
    pub(crate) fn decrement_handles(&self) {
        if self.handle_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.destroy();
        }
    }
}

impl InterruptSink for InterruptDispatcher {
    fn deliver(&self, binding: Binding, timestamp: Time) {
        let index = binding.slot as usize;
        let mut table = self.table.lock();

        // Triggers that lost a race with unbind or rebind are dropped
        let live = table
            .slots
            .get(index)
            .is_some_and(|slot| slot.vector == Some(binding.vector) && slot.binding_id == binding.id);
        if !live {
            return;
        }

        let waiter = table.record(index, timestamp);
        drop(table);

        if let Some(unparker) = waiter {
            unparker.unpark();
        }
    }
}

impl Drop for InterruptDispatcher {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl core::fmt::Debug for InterruptDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let table = self.table.lock();
        let bound = table.slots.iter().filter(|s| s.vector.is_some()).count();
        f.debug_struct("InterruptDispatcher")
            .field("bound_slots", &bound)
            .field("waiters", &table.waiters.len())
            .field("destroyed", &table.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::source::VirtualSource;

    fn virtual_source() -> Arc<dyn InterruptSource> {
        Arc::new(VirtualSource::new())
    }

    #[test]
    fn test_create_all_unbound() {
        let irq = InterruptDispatcher::create();
        for slot in 0..MAX_SLOTS as u32 {
            assert_eq!(irq.slot_state(slot).unwrap(), SlotState::Unbound);
        }
        assert_eq!(irq.slot_state(MAX_SLOTS as u32), Err(DdkError::InvalidArgs));
    }

    #[test]
    fn test_bind_and_signal() {
        let source = virtual_source();
        let irq = InterruptDispatcher::create();

        irq.bind(3, 40, InterruptOptions::VIRTUAL, &source).unwrap();
        assert_eq!(irq.slot_state(3).unwrap(), SlotState::Bound);
        assert_eq!(irq.bound_vector(3).unwrap(), Some(40));

        irq.signal(3, 1234).unwrap();
        assert_eq!(irq.slot_state(3).unwrap(), SlotState::Triggered);
        assert_eq!(irq.last_timestamp(3).unwrap(), 1234);

        // Trigger recorded before the wait is not lost
        assert_eq!(irq.wait().unwrap(), 1 << 3);
        assert_eq!(irq.slot_state(3).unwrap(), SlotState::Bound);
    }

    #[test]
    fn test_bind_rejections() {
        let source = virtual_source();
        let irq = InterruptDispatcher::create();

        assert_eq!(
            irq.bind(MAX_SLOTS as u32, 1, InterruptOptions::empty(), &source),
            Err(DdkError::InvalidArgs)
        );

        irq.bind(0, 7, InterruptOptions::empty(), &source).unwrap();
        // Same vector on another slot
        assert_eq!(
            irq.bind(1, 7, InterruptOptions::empty(), &source),
            Err(DdkError::AlreadyBound)
        );
        // Same slot, different vector
        assert_eq!(
            irq.bind(0, 8, InterruptOptions::empty(), &source),
            Err(DdkError::AlreadyBound)
        );
        // Identical rebind is accepted
        assert!(irq.bind(0, 7, InterruptOptions::empty(), &source).is_ok());
    }

    #[test]
    fn test_signal_unbound_slot() {
        let irq = InterruptDispatcher::create();
        assert_eq!(irq.signal(0, 1), Err(DdkError::BadState));
        assert_eq!(irq.signal(MAX_SLOTS as u32, 1), Err(DdkError::InvalidArgs));
    }

    #[test]
    fn test_wait_coalesces_slots_and_repeats() {
        let source = virtual_source();
        let irq = InterruptDispatcher::create();
        irq.bind(0, 10, InterruptOptions::empty(), &source).unwrap();
        irq.bind(5, 15, InterruptOptions::empty(), &source).unwrap();

        irq.signal(0, 100).unwrap();
        irq.signal(0, 200).unwrap();
        irq.signal(5, 300).unwrap();

        assert_eq!(irq.wait().unwrap(), (1 << 0) | (1 << 5));
        // Latest timestamp wins for the coalesced view
        assert_eq!(irq.last_timestamp(0).unwrap(), 200);
        assert_eq!(irq.pending_events(0).unwrap(), 0);
    }

    #[test]
    fn test_wait_with_timestamp_global_order() {
        let source = virtual_source();
        let irq = InterruptDispatcher::create();
        for slot in 1..=3 {
            irq.bind(slot, 100 + slot, InterruptOptions::empty(), &source).unwrap();
        }

        irq.signal(3, 30).unwrap();
        irq.signal(1, 10).unwrap();
        irq.signal(3, 5).unwrap();
        irq.signal(2, 20).unwrap();

        let order: Vec<(u32, Time)> = (0..4)
            .map(|_| irq.wait_with_timestamp().unwrap())
            .map(|ev| (ev.slot, ev.timestamp))
            .collect();
        assert_eq!(order, vec![(3, 30), (1, 10), (3, 5), (2, 20)]);
        assert_eq!(irq.slot_state(3).unwrap(), SlotState::Bound);
    }

    #[test]
    fn test_wait_with_timestamp_reports_overflow() {
        let source = virtual_source();
        let irq = InterruptDispatcher::create();
        irq.bind(0, 1, InterruptOptions::empty(), &source).unwrap();

        let total = crate::config::EVENT_QUEUE_DEPTH as Time + 2;
        for ts in 0..total {
            irq.signal(0, ts).unwrap();
        }

        let first = irq.wait_with_timestamp().unwrap();
        assert!(first.overflowed);
        assert_eq!(first.timestamp, 2);

        let second = irq.wait_with_timestamp().unwrap();
        assert!(!second.overflowed);
        assert_eq!(second.timestamp, 3);
    }

    #[test]
    fn test_unbind_clears_state() {
        let source = virtual_source();
        let irq = InterruptDispatcher::create();
        irq.bind(2, 9, InterruptOptions::empty(), &source).unwrap();
        irq.signal(2, 1).unwrap();

        irq.unbind(2).unwrap();
        assert_eq!(irq.slot_state(2).unwrap(), SlotState::Unbound);
        assert_eq!(irq.pending_events(2).unwrap(), 0);

        // Unbinding again is fine, and the slot can be rebound elsewhere
        irq.unbind(2).unwrap();
        irq.bind(2, 10, InterruptOptions::empty(), &source).unwrap();
        assert_eq!(irq.unbind(MAX_SLOTS as u32), Err(DdkError::InvalidArgs));
    }

    #[test]
    fn test_stale_delivery_is_dropped() {
        let source = virtual_source();
        let irq = InterruptDispatcher::create();
        irq.bind(0, 4, InterruptOptions::empty(), &source).unwrap();
        let stale = Binding {
            slot: 0,
            vector: 4,
            id: 1,
        };

        irq.unbind(0).unwrap();
        irq.bind(0, 4, InterruptOptions::empty(), &source).unwrap();

        // A trigger carrying the old binding id arrives after the rebind
        irq.deliver(stale, 55);
        assert_eq!(irq.slot_state(0).unwrap(), SlotState::Bound);
    }

    #[test]
    fn test_destroy_unregisters_everything() {
        let virtual_irqs = Arc::new(VirtualSource::new());
        let source: Arc<dyn InterruptSource> = virtual_irqs.clone();
        let irq = InterruptDispatcher::create();
        irq.bind(0, 1, InterruptOptions::empty(), &source).unwrap();
        irq.bind(1, 2, InterruptOptions::empty(), &source).unwrap();
        assert_eq!(virtual_irqs.live_bindings(), 2);

        irq.destroy();
        assert!(irq.is_destroyed());
        assert_eq!(virtual_irqs.live_bindings(), 0);
        assert_eq!(irq.wait(), Err(DdkError::Cancelled));
        assert_eq!(
            irq.bind(0, 1, InterruptOptions::empty(), &source),
            Err(DdkError::BadState)
        );
    }

    #[test]
    fn test_drop_unregisters() {
        let virtual_irqs = Arc::new(VirtualSource::new());
        let source: Arc<dyn InterruptSource> = virtual_irqs.clone();
        {
            let irq = InterruptDispatcher::create();
            irq.bind(0, 1, InterruptOptions::empty(), &source).unwrap();
        }
        assert_eq!(virtual_irqs.live_bindings(), 0);
    }

    #[test]
    fn test_last_handle_destroys() {
        let irq = InterruptDispatcher::create();
        irq.increment_handles();
        irq.increment_handles();

        irq.decrement_handles();
        assert!(!irq.is_destroyed());
        irq.decrement_handles();
        assert!(irq.is_destroyed());
    }
}
