//! Interrupt objects
//!
//! An [`InterruptDispatcher`] multiplexes up to [`MAX_SLOTS`](crate::MAX_SLOTS)
//! interrupt vectors onto numbered slots. Drivers bind a slot to a vector,
//! then block in [`wait`](InterruptDispatcher::wait) (coalescing bitmask of
//! triggered slots) or
//! [`wait_with_timestamp`](InterruptDispatcher::wait_with_timestamp) (one event
//! at a time, in global trigger order).
//!
//! ## Slot lifecycle
//!
//! ```text
//!            bind                trigger / signal
//! UNBOUND ─────────▶ BOUND ───────────────────────▶ TRIGGERED
//!    ▲                 ▲                                 │
//!    │                 └────── wait drains events ───────┘
//!    └──────────── unbind / destroy (cancels waiters) ◀──┘
//! ```
//!
//! ## Interrupt sources
//!
//! Vectors reach the dispatcher through an [`InterruptSource`]: the hardware
//! [`IrqController`] routes real interrupt lines, the [`VirtualSource`] backs
//! software-only slots that are only ever signalled.

mod dispatcher;
mod event_queue;
mod source;
mod wait_queue;

pub use dispatcher::{InterruptDispatcher, SlotState, TimestampedInterrupt};
pub use source::{
    Binding, ClockSource, InterruptSink, InterruptSource, IrqController, MonotonicClock,
    Subscription, VirtualSource,
};

use crate::{DdkError, Result};
use bitflags::bitflags;

/// Monotonic time in nanoseconds
pub type Time = i64;

bitflags! {
    /// Options accepted when binding a slot
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InterruptOptions: u32 {
        /// Trigger mode field (see [`TriggerMode`])
        const MODE_MASK = 0b1110;

        /// Bind to the software-only source; the vector is a free-form tag
        const VIRTUAL = 1 << 4;
    }
}

/// Electrical trigger mode requested for a hardware vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TriggerMode {
    /// Whatever the platform configured at boot
    #[default]
    Default,
    EdgeLow,
    EdgeHigh,
    LevelLow,
    LevelHigh,
    EdgeBoth,
}

impl InterruptOptions {
    /// Parse a raw options word from a syscall
    ///
    /// # Errors
    /// `InvalidArgs` for unknown bits or an unknown trigger mode
    pub fn parse(raw: u32) -> Result<Self> {
        let options = Self::from_bits(raw).ok_or(DdkError::InvalidArgs)?;
        options.mode()?;
        Ok(options)
    }

    /// Decode the trigger mode field
    pub fn mode(self) -> Result<TriggerMode> {
        match (self & Self::MODE_MASK).bits() >> 1 {
            0 => Ok(TriggerMode::Default),
            1 => Ok(TriggerMode::EdgeLow),
            2 => Ok(TriggerMode::EdgeHigh),
            3 => Ok(TriggerMode::LevelLow),
            4 => Ok(TriggerMode::LevelHigh),
            5 => Ok(TriggerMode::EdgeBoth),
            _ => Err(DdkError::InvalidArgs),
        }
    }

    /// Encode a trigger mode into an options word
    pub fn with_mode(self, mode: TriggerMode) -> Self {
        let field = match mode {
            TriggerMode::Default => 0,
            TriggerMode::EdgeLow => 1,
            TriggerMode::EdgeHigh => 2,
            TriggerMode::LevelLow => 3,
            TriggerMode::LevelHigh => 4,
            TriggerMode::EdgeBoth => 5,
        };
        (self - Self::MODE_MASK) | Self::from_bits_retain(field << 1)
    }

    /// Is the slot software-only?
    pub fn is_virtual(self) -> bool {
        self.contains(Self::VIRTUAL)
    }
}
