//! DDK syscall surface
//!
//! [`DdkBroker`] owns the system-wide pieces (page pool, hardware interrupt
//! controller, virtual interrupt source) and implements the privileged
//! syscalls on top of them. Each call takes the caller's [`HandleTable`] and,
//! where needed, the [`Resource`] the caller presents:
//!
//! ```text
//! sys_interrupt_create ──► validate_root ──► InterruptDispatcher ──► handle
//! sys_vmo_create_*     ──► validate_*    ──► PhysicalVmo          ──► handle
//! sys_interrupt_*      ──► handle lookup ──► InterruptDispatcher op
//! ```
//!
//! If installing the handle fails, the new object is dropped on the spot,
//! which returns committed pages to the pool.

use crate::config::{BrokerConfig, PAGE_SIZE_SHIFT};
use crate::gate::{validate_range, validate_root, Resource};
use crate::handle::{HandleTable, HandleValue, KernelObject, Rights};
use crate::irq::{
    ClockSource, InterruptDispatcher, InterruptOptions, InterruptSource, IrqController,
    MonotonicClock, Time, TimestampedInterrupt, VirtualSource,
};
use crate::pmm::{round_up_page, PagePool};
use crate::vmo::PhysicalVmo;
use crate::{DdkError, Result};
use std::sync::Arc;

/// Privileged broker for interrupt and physical memory objects
pub struct DdkBroker {
    config: BrokerConfig,

    /// Physical page pool for contiguous allocations
    pool: Arc<PagePool>,

    /// Hardware interrupt lines
    hardware: Arc<IrqController>,

    /// Software-only interrupt slots
    virtual_irqs: Arc<VirtualSource>,
}

impl DdkBroker {
    /// Bring up the broker with the monotonic host clock
    ///
    /// # Errors
    /// `InvalidArgs` if the configuration does not validate
    pub fn new(config: BrokerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    /// Bring up the broker stamping hardware triggers from `clock`
    pub fn with_clock(config: BrokerConfig, clock: Arc<dyn ClockSource>) -> Result<Self> {
        config.validate()?;

        let pool = PagePool::new(config.ram_base, config.ram_size)?;
        for &(base, size) in &config.reserved {
            pool.reserve_region(base, size);
        }

        log::debug!(
            "ddk: broker up, {} of {} pages free, {} vectors",
            pool.free_pages(),
            pool.total_pages(),
            config.max_vectors
        );

        Ok(Self {
            hardware: Arc::new(IrqController::new(config.max_vectors, clock)),
            virtual_irqs: Arc::new(VirtualSource::new()),
            pool: Arc::new(pool),
            config,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Physical page pool
    pub fn page_pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    /// Hardware interrupt controller (the interrupt-handler entry point)
    pub fn irq_controller(&self) -> &Arc<IrqController> {
        &self.hardware
    }

    pub fn virtual_source(&self) -> &Arc<VirtualSource> {
        &self.virtual_irqs
    }

    /// Empty handle table sized for one process
    pub fn new_process(&self) -> HandleTable {
        HandleTable::new(self.config.handle_capacity)
    }

    fn install(&self, process: &HandleTable, object: KernelObject) -> Result<HandleValue> {
        let rights = object.default_rights();
        process.map_to_handle_value(object, rights)
    }

    // ========================================================================
    // Interrupt objects
    // ========================================================================

    /// Create an interrupt object with every slot UNBOUND
    ///
    /// # Errors
    /// - `InvalidArgs` for non-zero `options` or a null resource
    /// - `AccessDenied` for a non-root resource
    /// - `NoMemory` if the handle table is full
    pub fn sys_interrupt_create(
        &self,
        process: &HandleTable,
        resource: &Resource,
        options: u32,
    ) -> Result<HandleValue> {
        log::trace!("sys_interrupt_create(options={:#x})", options);

        if options != 0 {
            return Err(DdkError::InvalidArgs);
        }
        validate_root(resource)?;

        self.install(process, KernelObject::Interrupt(InterruptDispatcher::create()))
    }

    /// Bind a slot of an interrupt object to a vector
    ///
    /// `options` selects the trigger mode; with `VIRTUAL` set the slot is
    /// bound to the software-only source and `vector` is just a label.
    ///
    /// # Errors
    /// - `InvalidArgs` / `AccessDenied` from root validation
    /// - `NotFound`, `WrongType`, `AccessDenied` (needs WRITE) from the lookup
    /// - `InvalidArgs` for bad options, slot or hardware vector
    /// - `AlreadyBound` if the slot or vector is taken
    pub fn sys_interrupt_bind(
        &self,
        process: &HandleTable,
        handle: HandleValue,
        slot: u32,
        resource: &Resource,
        vector: u32,
        options: u32,
    ) -> Result<()> {
        log::trace!(
            "sys_interrupt_bind(handle={}, slot={}, vector={}, options={:#x})",
            handle,
            slot,
            vector,
            options
        );

        validate_root(resource)?;
        let irq = process.get_interrupt(handle, Rights::WRITE)?;
        let options = InterruptOptions::parse(options)?;

        let source: Arc<dyn InterruptSource> = if options.is_virtual() {
            self.virtual_irqs.clone()
        } else {
            self.hardware.clone()
        };
        irq.bind(slot, vector, options, &source)
    }

    /// Unbind a slot, cancelling blocked waiters
    pub fn sys_interrupt_unbind(
        &self,
        process: &HandleTable,
        handle: HandleValue,
        slot: u32,
    ) -> Result<()> {
        log::trace!("sys_interrupt_unbind(handle={}, slot={})", handle, slot);

        process.get_interrupt(handle, Rights::WRITE)?.unbind(slot)
    }

    /// Deprecated acknowledge call
    ///
    /// Kept for ABI compatibility: resolves the handle and does nothing else.
    /// Waiting already re-arms the slots.
    pub fn sys_interrupt_complete(&self, process: &HandleTable, handle: HandleValue) -> Result<()> {
        log::trace!("sys_interrupt_complete(handle={})", handle);

        process.get_interrupt(handle, Rights::empty())?;
        Ok(())
    }

    /// Block until a slot triggers; returns the bitmask of triggered slots
    ///
    /// # Errors
    /// - `NotFound`, `WrongType`, `AccessDenied` (needs READ) from the lookup
    /// - `Cancelled` if a slot is unbound or the object destroyed while waiting
    /// - `BadState` if [`MAX_WAITERS`](crate::MAX_WAITERS) threads are already
    ///   blocked on the object
    pub fn sys_interrupt_wait(&self, process: &HandleTable, handle: HandleValue) -> Result<u64> {
        log::trace!("sys_interrupt_wait(handle={})", handle);

        // The lookup holds its own reference, so closing the handle while
        // blocked cannot free the object under us
        let irq = process.get_interrupt(handle, Rights::READ)?;
        irq.wait()
    }

    /// Block until a trigger is pending; returns the oldest one
    ///
    /// # Errors
    /// Same as [`sys_interrupt_wait`](Self::sys_interrupt_wait)
    pub fn sys_interrupt_wait_with_timestamp(
        &self,
        process: &HandleTable,
        handle: HandleValue,
    ) -> Result<TimestampedInterrupt> {
        log::trace!("sys_interrupt_wait_with_timestamp(handle={})", handle);

        let irq = process.get_interrupt(handle, Rights::READ)?;
        irq.wait_with_timestamp()
    }

    /// Software-inject a trigger on a bound slot
    pub fn sys_interrupt_signal(
        &self,
        process: &HandleTable,
        handle: HandleValue,
        slot: u32,
        timestamp: Time,
    ) -> Result<()> {
        log::trace!(
            "sys_interrupt_signal(handle={}, slot={}, timestamp={})",
            handle,
            slot,
            timestamp
        );

        process.get_interrupt(handle, Rights::WRITE)?.signal(slot, timestamp)
    }

    // ========================================================================
    // Physical memory objects
    // ========================================================================

    /// Allocate a physically contiguous memory object
    ///
    /// # Arguments
    /// * `size` - Bytes, rounded up to whole pages
    /// * `alignment_log2` - Base alignment as log2 bytes, 0 for page alignment
    ///
    /// # Errors
    /// - `InvalidArgs` for a zero size, sub-page alignment, alignment at or
    ///   beyond the address width, or a null resource
    /// - `AccessDenied` for a non-root resource
    /// - `NoMemory` if no aligned contiguous run is free, or the handle table
    ///   is full (the pages are released again)
    pub fn sys_vmo_create_contiguous(
        &self,
        process: &HandleTable,
        resource: &Resource,
        size: usize,
        alignment_log2: u32,
    ) -> Result<HandleValue> {
        log::trace!(
            "sys_vmo_create_contiguous(size={:#x}, alignment_log2={})",
            size,
            alignment_log2
        );

        if size == 0 {
            return Err(DdkError::InvalidArgs);
        }
        let alignment_log2 = if alignment_log2 == 0 {
            PAGE_SIZE_SHIFT
        } else {
            alignment_log2
        };
        if alignment_log2 < PAGE_SIZE_SHIFT || alignment_log2 >= u64::BITS {
            return Err(DdkError::InvalidArgs);
        }
        validate_root(resource)?;

        let vmo = PhysicalVmo::create_contiguous(&self.pool, size, alignment_log2)?;
        let committed = vmo.committed();
        self.install(process, KernelObject::Vmo(Arc::new(vmo)))
            .inspect_err(|_| log::debug!("ddk: rolled back {:#x} committed bytes", committed))
    }

    /// Register a physical window (typically device MMIO) as a memory object
    ///
    /// The resource must cover the page-rounded range, since that is what
    /// the object maps.
    ///
    /// # Errors
    /// - `InvalidArgs` for a null resource, zero size, unaligned base, or a
    ///   size that overflows when rounded
    /// - `AccessDenied` if the resource does not cover the rounded range, or
    ///   the range overlaps RAM managed by the page pool
    /// - `OutOfRange` if the range wraps the address space
    /// - `NoMemory` if the handle table is full
    pub fn sys_vmo_create_physical(
        &self,
        process: &HandleTable,
        resource: &Resource,
        paddr: usize,
        size: usize,
    ) -> Result<HandleValue> {
        log::trace!("sys_vmo_create_physical(paddr={:#x}, size={:#x})", paddr, size);

        let rounded = round_up_page(size).ok_or(DdkError::InvalidArgs)?;
        validate_range(resource, paddr as u64, rounded as u64)?;

        if self.pool.overlaps(paddr, rounded) {
            log::warn!(
                "ddk: refused window {:#x}+{:#x} over pool RAM",
                paddr,
                rounded
            );
            return Err(DdkError::AccessDenied);
        }
        let vmo = PhysicalVmo::create_physical(paddr, rounded)?;

        self.install(process, KernelObject::Vmo(Arc::new(vmo)))
    }

    /// Close a handle
    pub fn sys_handle_close(&self, process: &HandleTable, handle: HandleValue) -> Result<()> {
        log::trace!("sys_handle_close(handle={})", handle);

        process.close(handle)
    }

    /// Duplicate a handle with a subset of its rights
    pub fn sys_handle_duplicate(
        &self,
        process: &HandleTable,
        handle: HandleValue,
        rights: Rights,
    ) -> Result<HandleValue> {
        log::trace!("sys_handle_duplicate(handle={}, rights={:?})", handle, rights);

        process.duplicate(handle, rights)
    }
}

impl core::fmt::Debug for DdkBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DdkBroker")
            .field("pool", &self.pool)
            .field("hardware", &self.hardware)
            .field("virtual_bindings", &self.virtual_irqs.live_bindings())
            .finish()
    }
}
