//! DDK Broker - Privileged interrupt and physical memory objects for KaaL
//!
//! # Purpose
//! The DDK broker turns raw hardware resources into capability-gated kernel
//! objects that user-mode drivers can wait on, signal or map:
//! - interrupt objects multiplexing up to [`MAX_SLOTS`] vectors onto slots
//! - physical memory objects, either freshly allocated contiguous pages or a
//!   caller-specified MMIO window
//!
//! # Integration Points
//! - Depends on: an interrupt controller ([`InterruptSource`]), the physical
//!   page pool ([`PagePool`]), the per-process handle table ([`HandleTable`])
//! - Provides to: device drivers and the root task, through [`DdkBroker`]
//! - Capabilities required: the root [`Resource`], or an MMIO range resource
//!   for physical windows
//!
//! # Architecture
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   Driver (handles, resources)                │
//! └──────────────┬───────────────────────────────┘
//!                │ sys_* calls
//! ┌──────────────▼───────────────────────────────┐
//! │   DdkBroker (syscalls.rs)                    │
//! │    • gate: validate_root / validate_range    │
//! │    • irq:  InterruptDispatcher + sources     │
//! │    • pmm/vmo: PagePool + PhysicalVmo         │
//! └──────────────┬───────────────────────────────┘
//!                │ map / lookup
//! ┌──────────────▼───────────────────────────────┐
//! │   HandleTable (per process)                  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Testing Strategy
//! - Unit tests: gate checks, slot state machine, event queue overflow,
//!   bitmap search, handle rights
//! - Integration tests: blocking waits, cancellation and bind races across
//!   threads (`tests/integration_test.rs`)
//! - Benchmarks: contiguous allocation under fragmentation

pub mod config;
pub mod gate;
pub mod handle;
pub mod irq;
pub mod pmm;
pub mod syscalls;
pub mod vmo;

pub use config::{
    BrokerConfig, EVENT_QUEUE_DEPTH, MAX_SLOTS, MAX_WAITERS, PAGE_SIZE, PAGE_SIZE_SHIFT,
};
pub use gate::{validate_range, validate_root, Resource, ResourceKind};
pub use handle::{HandleTable, HandleValue, KernelObject, Rights, INVALID_HANDLE};
pub use irq::{
    Binding, ClockSource, InterruptDispatcher, InterruptOptions, InterruptSink, InterruptSource,
    IrqController, MonotonicClock, SlotState, Subscription, Time, TimestampedInterrupt,
    TriggerMode, VirtualSource,
};
pub use pmm::{pages_needed, round_up_page, PagePool};
pub use syscalls::DdkBroker;
pub use vmo::PhysicalVmo;

use thiserror::Error;

/// Status returned by syscalls that succeed
pub const OK: i32 = 0;

/// Error types for broker operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DdkError {
    #[error("Invalid arguments")]
    InvalidArgs,

    #[error("Access denied")]
    AccessDenied,

    #[error("Range outside the authorized window")]
    OutOfRange,

    #[error("Already bound")]
    AlreadyBound,

    #[error("Object in wrong state for this operation")]
    BadState,

    #[error("Out of memory")]
    NoMemory,

    #[error("Wait cancelled")]
    Cancelled,

    #[error("Handle not found")]
    NotFound,

    #[error("Handle refers to a different object type")]
    WrongType,
}

impl DdkError {
    /// Negative status code for the syscall ABI
    pub const fn status(self) -> i32 {
        match self {
            DdkError::NotFound => -3,
            DdkError::NoMemory => -4,
            DdkError::InvalidArgs => -10,
            DdkError::BadState => -20,
            DdkError::Cancelled => -23,
            DdkError::AccessDenied => -30,
            DdkError::OutOfRange => -40,
            DdkError::AlreadyBound => -47,
            DdkError::WrongType => -54,
        }
    }

    /// Cancellation is the expected end of a wait, not a failure
    pub const fn is_routine(self) -> bool {
        matches!(self, DdkError::Cancelled)
    }
}

pub type Result<T> = core::result::Result<T, DdkError>;

/// Flatten a syscall result into an ABI status word
pub fn into_status(result: Result<()>) -> i32 {
    match result {
        Ok(()) => OK,
        Err(err) => err.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_negative_and_distinct() {
        let all = [
            DdkError::InvalidArgs,
            DdkError::AccessDenied,
            DdkError::OutOfRange,
            DdkError::AlreadyBound,
            DdkError::BadState,
            DdkError::NoMemory,
            DdkError::Cancelled,
            DdkError::NotFound,
            DdkError::WrongType,
        ];

        for (i, a) in all.iter().enumerate() {
            assert!(a.status() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.status(), b.status());
            }
        }
    }

    #[test]
    fn test_only_cancel_is_routine() {
        assert!(DdkError::Cancelled.is_routine());
        assert!(!DdkError::BadState.is_routine());
        assert!(!DdkError::NoMemory.is_routine());
    }

    #[test]
    fn test_into_status() {
        assert_eq!(into_status(Ok(())), OK);
        assert_eq!(into_status(Err(DdkError::AccessDenied)), -30);
    }
}
