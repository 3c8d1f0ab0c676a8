//! Handle table - per-process map from handle values to kernel objects
//!
//! This is the process side of the broker: objects created by a syscall are
//! installed here and the caller receives a [`HandleValue`]. Later syscalls
//! resolve the value back to a reference-counted object. A lookup hands out
//! its own `Arc`, so the object outlives any in-flight operation even if the
//! handle is closed concurrently.
//!
//! ## Rights
//!
//! Each handle carries [`Rights`]. Duplicates can only drop rights, never add
//! them (same rule as capability derivation in the kernel).

use crate::irq::InterruptDispatcher;
use crate::vmo::PhysicalVmo;
use crate::{DdkError, Result};
use bitflags::bitflags;
use spin::Mutex;
use std::sync::Arc;

/// Process-visible name for a kernel object
pub type HandleValue = u32;

/// Never a valid handle
pub const INVALID_HANDLE: HandleValue = 0;

bitflags! {
    /// Operations a handle permits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Rights: u32 {
        const DUPLICATE = 1 << 0;
        const TRANSFER = 1 << 1;
        const READ = 1 << 2;
        const WRITE = 1 << 3;
        const MAP = 1 << 4;
    }
}

/// Objects a handle can refer to
#[derive(Debug, Clone)]
pub enum KernelObject {
    Interrupt(Arc<InterruptDispatcher>),
    Vmo(Arc<PhysicalVmo>),
}

impl KernelObject {
    /// Rights granted to the handle returned by a create syscall
    pub fn default_rights(&self) -> Rights {
        match self {
            KernelObject::Interrupt(_) => {
                Rights::DUPLICATE | Rights::TRANSFER | Rights::READ | Rights::WRITE
            }
            KernelObject::Vmo(_) => Rights::all(),
        }
    }

    fn on_handle_added(&self) {
        if let KernelObject::Interrupt(irq) = self {
            irq.increment_handles();
        }
    }

    fn on_handle_removed(&self) {
        if let KernelObject::Interrupt(irq) = self {
            irq.decrement_handles();
        }
    }
}

struct HandleEntry {
    object: KernelObject,
    rights: Rights,
}

/// Handle slots with a free list for reuse
struct HandleSlots {
    entries: Vec<Option<HandleEntry>>,
    free_slots: Vec<usize>,
    live: usize,
}

/// Per-process handle table
pub struct HandleTable {
    slots: Mutex<HandleSlots>,
    capacity: usize,
}

impl HandleTable {
    /// Create a table holding at most `capacity` handles
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(HandleSlots {
                entries: Vec::new(),
                free_slots: Vec::new(),
                live: 0,
            }),
            capacity,
        }
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.slots.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Install `object` and return its handle value
    ///
    /// On failure the object is dropped here, which releases whatever it
    /// holds (committed pages, interrupt bindings).
    ///
    /// # Errors
    /// `NoMemory` if the table is full
    pub fn map_to_handle_value(&self, object: KernelObject, rights: Rights) -> Result<HandleValue> {
        let mut slots = self.slots.lock();
        let result = self.insert(&mut slots, object, rights);
        drop(slots);
        result
    }

    /// Add an entry while the caller holds the table lock
    fn insert(
        &self,
        slots: &mut HandleSlots,
        object: KernelObject,
        rights: Rights,
    ) -> Result<HandleValue> {
        if slots.live >= self.capacity {
            log::debug!("handle: table full ({} handles), releasing object", self.capacity);
            return Err(DdkError::NoMemory);
        }

        object.on_handle_added();
        let entry = Some(HandleEntry { object, rights });
        let index = match slots.free_slots.pop() {
            Some(index) => {
                slots.entries[index] = entry;
                index
            }
            None => {
                slots.entries.push(entry);
                slots.entries.len() - 1
            }
        };
        slots.live += 1;

        // Slot 0 maps to handle 1 so that 0 stays invalid
        Ok(index as HandleValue + 1)
    }

    /// Resolve a handle, checking it grants `required`
    ///
    /// # Errors
    /// - `NotFound` for an unknown or closed handle
    /// - `AccessDenied` if the handle lacks `required`
    pub fn lookup(&self, handle: HandleValue, required: Rights) -> Result<KernelObject> {
        let slots = self.slots.lock();
        let entry = Self::entry(&slots, handle)?;
        if !entry.rights.contains(required) {
            return Err(DdkError::AccessDenied);
        }
        Ok(entry.object.clone())
    }

    /// Resolve a handle to an interrupt object
    ///
    /// # Errors
    /// As [`lookup`](Self::lookup), plus `WrongType` for other objects
    pub fn get_interrupt(
        &self,
        handle: HandleValue,
        required: Rights,
    ) -> Result<Arc<InterruptDispatcher>> {
        match self.lookup(handle, required)? {
            KernelObject::Interrupt(irq) => Ok(irq),
            _ => Err(DdkError::WrongType),
        }
    }

    /// Resolve a handle to a memory object
    ///
    /// # Errors
    /// As [`lookup`](Self::lookup), plus `WrongType` for other objects
    pub fn get_vmo(&self, handle: HandleValue, required: Rights) -> Result<Arc<PhysicalVmo>> {
        match self.lookup(handle, required)? {
            KernelObject::Vmo(vmo) => Ok(vmo),
            _ => Err(DdkError::WrongType),
        }
    }

    /// Rights attached to a handle
    pub fn rights(&self, handle: HandleValue) -> Result<Rights> {
        let slots = self.slots.lock();
        Ok(Self::entry(&slots, handle)?.rights)
    }

    /// Create a second handle to the same object with a subset of the rights
    ///
    /// # Errors
    /// - `NotFound` for an unknown handle
    /// - `AccessDenied` if the handle lacks `DUPLICATE`
    /// - `InvalidArgs` if `rights` is not a subset of the handle's rights
    /// - `NoMemory` if the table is full
    pub fn duplicate(&self, handle: HandleValue, rights: Rights) -> Result<HandleValue> {
        // One lock acquisition: a concurrent close cannot retire the source
        // handle between the lookup and the insert
        let mut slots = self.slots.lock();
        let entry = Self::entry(&slots, handle)?;

        if !entry.rights.contains(Rights::DUPLICATE) {
            return Err(DdkError::AccessDenied);
        }
        if !entry.rights.contains(rights) {
            return Err(DdkError::InvalidArgs);
        }
        let object = entry.object.clone();
        self.insert(&mut slots, object, rights)
    }

    /// Close a handle
    ///
    /// Closing the last handle to an interrupt object destroys it.
    ///
    /// # Errors
    /// `NotFound` for an unknown handle
    pub fn close(&self, handle: HandleValue) -> Result<()> {
        let entry = {
            let mut slots = self.slots.lock();
            let index = Self::index(&slots, handle)?;
            let entry = slots.entries[index].take().ok_or(DdkError::NotFound)?;
            slots.free_slots.push(index);
            slots.live -= 1;
            entry
        };

        // Outside the table lock: this may cancel waiters or free pages
        entry.object.on_handle_removed();
        Ok(())
    }

    fn index(slots: &HandleSlots, handle: HandleValue) -> Result<usize> {
        let index = (handle as usize).checked_sub(1).ok_or(DdkError::NotFound)?;
        if index < slots.entries.len() {
            Ok(index)
        } else {
            Err(DdkError::NotFound)
        }
    }

    fn entry(slots: &HandleSlots, handle: HandleValue) -> Result<&HandleEntry> {
        let index = Self::index(slots, handle)?;
        slots.entries[index].as_ref().ok_or(DdkError::NotFound)
    }
}

impl Drop for HandleTable {
    /// Process teardown closes every remaining handle
    fn drop(&mut self) {
        let slots = self.slots.get_mut();
        for entry in slots.entries.iter_mut().filter_map(Option::take) {
            entry.object.on_handle_removed();
        }
    }
}

impl core::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandleTable")
            .field("live", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
