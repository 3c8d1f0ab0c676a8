//! Interrupt sources
//!
//! The dispatcher does not know which controller a vector lives on. It talks
//! to an [`InterruptSource`] to register a binding and gets back a
//! [`Subscription`] it hands back on unbind. When the line fires, the source
//! calls [`InterruptSink::deliver`] on the dispatcher that registered it.
//!
//! Two sources exist:
//! - [`IrqController`]: hardware interrupt lines, one binding per vector
//!   system-wide, timestamps read from a [`ClockSource`]
//! - [`VirtualSource`]: software-only slots, never fired by hardware

use super::{Time, TriggerMode};
use crate::{DdkError, Result};
use spin::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// A monotonic clock source that provides a nanosecond timestamp
pub trait ClockSource: Send + Sync {
    /// Current time in nanoseconds since an arbitrary epoch
    fn read_nanos(&self) -> Time;
}

/// Clock counting from its own creation
#[derive(Debug)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for MonotonicClock {
    fn read_nanos(&self) -> Time {
        Time::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(Time::MAX)
    }
}

/// Identity of one bind operation
///
/// `id` is unique per dispatcher and changes on every bind, so a trigger that
/// raced an unbind can be recognized as stale even if the slot was rebound to
/// the same vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Binding {
    pub slot: u32,
    pub vector: u32,
    pub id: u64,
}

/// Receipt for a registration, returned to the source on unbind
#[derive(Debug, PartialEq, Eq)]
pub struct Subscription {
    binding: Binding,
}

/// Receiver of interrupt notifications
///
/// Called from interrupt-handler context: implementations must not block or
/// allocate.
pub trait InterruptSink: Send + Sync {
    fn deliver(&self, binding: Binding, timestamp: Time);
}

/// Provider of interrupt notifications for a class of vectors
pub trait InterruptSource: Send + Sync {
    /// Route `binding.vector` to `sink`
    ///
    /// # Errors
    /// - `InvalidArgs` if the vector does not exist on this source
    /// - `AlreadyBound` if the vector is already routed elsewhere
    fn register(
        &self,
        binding: Binding,
        mode: TriggerMode,
        sink: Weak<dyn InterruptSink>,
    ) -> Result<Subscription>;

    /// Stop routing a previously registered vector
    fn unregister(&self, subscription: Subscription);
}

/// Routing entry for one hardware vector
struct Route {
    binding: Binding,
    mode: TriggerMode,
    sink: Weak<dyn InterruptSink>,
}

/// Hardware interrupt controller
///
/// Keeps one route per vector, much like the kernel's IRQ handler table:
/// a vector can be claimed by only one binding at a time.
pub struct IrqController {
    routes: Mutex<Vec<Option<Route>>>,
    clock: Arc<dyn ClockSource>,
}

impl IrqController {
    /// Create a controller exposing vectors `0..max_vectors`
    pub fn new(max_vectors: u32, clock: Arc<dyn ClockSource>) -> Self {
        let routes = (0..max_vectors).map(|_| None).collect();
        Self {
            routes: Mutex::new(routes),
            clock,
        }
    }

    /// Number of vectors on this controller
    pub fn max_vectors(&self) -> u32 {
        // Bounded by the u32 passed to `new`
        self.routes.lock().len() as u32
    }

    /// Check if a vector currently has a route
    pub fn is_registered(&self, vector: u32) -> bool {
        self.routes
            .lock()
            .get(vector as usize)
            .is_some_and(|route| route.is_some())
    }

    /// Trigger mode configured for a routed vector
    pub fn trigger_mode(&self, vector: u32) -> Option<TriggerMode> {
        self.routes
            .lock()
            .get(vector as usize)
            .and_then(|route| route.as_ref().map(|r| r.mode))
    }

    /// Number of routed vectors
    pub fn registered_count(&self) -> usize {
        self.routes.lock().iter().filter(|r| r.is_some()).count()
    }

    /// Assert a hardware line now, stamping it from the clock
    ///
    /// Returns `true` if the vector was routed to a live sink.
    pub fn fire(&self, vector: u32) -> bool {
        let timestamp = self.clock.read_nanos();
        self.fire_at(vector, timestamp)
    }

    /// Assert a hardware line with an explicit timestamp
    ///
    /// This is the interrupt-handler entry point: the route table lock is
    /// released before the sink runs, so delivery never nests locks.
    pub fn fire_at(&self, vector: u32, timestamp: Time) -> bool {
        let target = {
            let routes = self.routes.lock();
            match routes.get(vector as usize) {
                Some(Some(route)) => Some((route.binding, route.sink.clone())),
                _ => None,
            }
        };

        match target.and_then(|(binding, sink)| sink.upgrade().map(|sink| (binding, sink))) {
            Some((binding, sink)) => {
                sink.deliver(binding, timestamp);
                true
            }
            // Spurious or unclaimed interrupt, already acknowledged
            None => false,
        }
    }
}

impl InterruptSource for IrqController {
    fn register(
        &self,
        binding: Binding,
        mode: TriggerMode,
        sink: Weak<dyn InterruptSink>,
    ) -> Result<Subscription> {
        let mut routes = self.routes.lock();
        let entry = routes
            .get_mut(binding.vector as usize)
            .ok_or(DdkError::InvalidArgs)?;

        if entry.is_some() {
            return Err(DdkError::AlreadyBound);
        }

        *entry = Some(Route {
            binding,
            mode,
            sink,
        });
        Ok(Subscription { binding })
    }

    fn unregister(&self, subscription: Subscription) {
        let mut routes = self.routes.lock();
        if let Some(entry) = routes.get_mut(subscription.binding.vector as usize) {
            if entry
                .as_ref()
                .is_some_and(|route| route.binding == subscription.binding)
            {
                *entry = None;
            }
        }
    }
}

impl core::fmt::Debug for IrqController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrqController")
            .field("max_vectors", &self.max_vectors())
            .field("registered", &self.registered_count())
            .finish()
    }
}

/// Source for software-only slots
///
/// Registration always succeeds; triggers arrive exclusively through
/// `signal`.
#[derive(Debug, Default)]
pub struct VirtualSource {
    live: AtomicUsize,
}

impl VirtualSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live virtual bindings
    pub fn live_bindings(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

impl InterruptSource for VirtualSource {
    fn register(
        &self,
        binding: Binding,
        _mode: TriggerMode,
        _sink: Weak<dyn InterruptSink>,
    ) -> Result<Subscription> {
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(Subscription { binding })
    }

    fn unregister(&self, _subscription: Subscription) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    struct FixedClock(AtomicI64);

    impl ClockSource for FixedClock {
        fn read_nanos(&self) -> Time {
            self.0.load(Ordering::Relaxed)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        last: Mutex<Option<(Binding, Time)>>,
    }

    impl InterruptSink for RecordingSink {
        fn deliver(&self, binding: Binding, timestamp: Time) {
            *self.last.lock() = Some((binding, timestamp));
        }
    }

    fn binding(vector: u32, id: u64) -> Binding {
        Binding { slot: 0, vector, id }
    }

    #[test]
    fn test_register_and_fire() {
        let controller = IrqController::new(32, Arc::new(FixedClock(AtomicI64::new(777))));
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn InterruptSink> = Arc::downgrade(&sink) as Weak<dyn InterruptSink>;

        controller
            .register(binding(4, 1), TriggerMode::EdgeHigh, weak)
            .unwrap();
        assert!(controller.is_registered(4));
        assert_eq!(controller.trigger_mode(4), Some(TriggerMode::EdgeHigh));

        assert!(controller.fire(4));
        assert_eq!(*sink.last.lock(), Some((binding(4, 1), 777)));

        // Unrouted vector is dropped
        assert!(!controller.fire(5));
    }

    #[test]
    fn test_vector_is_exclusive() {
        let controller = IrqController::new(32, Arc::new(MonotonicClock::new()));
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn InterruptSink> = Arc::downgrade(&sink) as Weak<dyn InterruptSink>;

        controller
            .register(binding(11, 1), TriggerMode::Default, weak.clone())
            .unwrap();
        assert_eq!(
            controller.register(binding(11, 2), TriggerMode::Default, weak),
            Err(DdkError::AlreadyBound)
        );
    }

    #[test]
    fn test_vector_out_of_range() {
        let controller = IrqController::new(32, Arc::new(MonotonicClock::new()));
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn InterruptSink> = Arc::downgrade(&sink) as Weak<dyn InterruptSink>;

        assert_eq!(
            controller.register(binding(32, 1), TriggerMode::Default, weak),
            Err(DdkError::InvalidArgs)
        );
    }

    #[test]
    fn test_unregister_ignores_stale_subscription() {
        let controller = IrqController::new(32, Arc::new(MonotonicClock::new()));
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn InterruptSink> = Arc::downgrade(&sink) as Weak<dyn InterruptSink>;

        let first = controller
            .register(binding(7, 1), TriggerMode::Default, weak.clone())
            .unwrap();
        controller.unregister(first);
        let _second = controller
            .register(binding(7, 2), TriggerMode::Default, weak)
            .unwrap();

        // A receipt for binding 1 must not tear down binding 2
        controller.unregister(Subscription {
            binding: binding(7, 1),
        });
        assert!(controller.is_registered(7));
    }

    #[test]
    fn test_dead_sink_is_not_delivered() {
        let controller = IrqController::new(8, Arc::new(MonotonicClock::new()));
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn InterruptSink> = Arc::downgrade(&sink) as Weak<dyn InterruptSink>;
        controller
            .register(binding(3, 1), TriggerMode::Default, weak)
            .unwrap();

        drop(sink);
        assert!(!controller.fire(3));
    }

    #[test]
    fn test_virtual_source_counts_bindings() {
        let source = VirtualSource::new();
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn InterruptSink> = Arc::downgrade(&sink) as Weak<dyn InterruptSink>;

        let sub = source
            .register(binding(5000, 1), TriggerMode::Default, weak)
            .unwrap();
        assert_eq!(source.live_bindings(), 1);
        source.unregister(sub);
        assert_eq!(source.live_bindings(), 0);
    }
}
