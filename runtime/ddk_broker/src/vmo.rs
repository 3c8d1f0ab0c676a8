//! Physical memory objects
//!
//! A [`PhysicalVmo`] is either:
//! - **contiguous**: pages committed from the [`PagePool`] at creation, handed
//!   back when the object drops
//! - **physical window**: a caller-specified range (typically device MMIO)
//!   recorded without touching pool accounting
//!
//! Creation is one step: either the object exists with all of its pages, or
//! nothing was committed.

use crate::config::PAGE_SIZE;
use crate::pmm::{round_up_page, PagePool};
use crate::{DdkError, Result};
use std::sync::Arc;

/// Where the pages of a memory object come from
#[derive(Debug)]
enum Backing {
    /// Pages committed from the pool
    Contiguous { pool: Arc<PagePool> },

    /// Raw physical range, not owned by the pool
    Window,
}

/// Memory object over a physically contiguous range
#[derive(Debug)]
pub struct PhysicalVmo {
    /// Physical address of the first page
    base: usize,

    /// Size in bytes (whole pages)
    size: usize,

    backing: Backing,
}

impl PhysicalVmo {
    /// Allocate and commit a contiguous run of pages
    ///
    /// # Arguments
    /// * `pool` - Page pool to draw from
    /// * `size` - Requested size in bytes, rounded up to whole pages
    /// * `align_log2` - Required alignment of the base as log2 bytes
    ///
    /// # Errors
    /// - `InvalidArgs` for a zero size, a size that overflows when rounded,
    ///   or an alignment the pool rejects
    /// - `NoMemory` if the pool cannot supply an aligned contiguous run
    pub fn create_contiguous(pool: &Arc<PagePool>, size: usize, align_log2: u32) -> Result<Self> {
        if size == 0 {
            return Err(DdkError::InvalidArgs);
        }
        let size = round_up_page(size).ok_or(DdkError::InvalidArgs)?;

        let base = pool.alloc_contiguous(size / PAGE_SIZE, align_log2)?;

        Ok(Self {
            base,
            size,
            backing: Backing::Contiguous {
                pool: Arc::clone(pool),
            },
        })
    }

    /// Register an existing physical range as a memory object
    ///
    /// # Errors
    /// `InvalidArgs` for a zero size, an unaligned base, or a range that
    /// wraps the address space once rounded to pages
    pub fn create_physical(base: usize, size: usize) -> Result<Self> {
        if size == 0 || base % PAGE_SIZE != 0 {
            return Err(DdkError::InvalidArgs);
        }
        let size = round_up_page(size).ok_or(DdkError::InvalidArgs)?;
        base.checked_add(size).ok_or(DdkError::InvalidArgs)?;

        log::debug!("vmo: registered window {:#x}+{:#x}", base, size);
        Ok(Self {
            base,
            size,
            backing: Backing::Window,
        })
    }

    /// Physical address of the first page
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of pages covered
    #[inline]
    pub fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    /// Bytes committed from the page pool (zero for windows)
    pub fn committed(&self) -> usize {
        match self.backing {
            Backing::Contiguous { .. } => self.size,
            Backing::Window => 0,
        }
    }

    /// Is this object backed by pool pages?
    pub fn is_contiguous(&self) -> bool {
        matches!(self.backing, Backing::Contiguous { .. })
    }
}

impl Drop for PhysicalVmo {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Contiguous { pool } => pool.free_contiguous(self.base, self.page_count()),
            Backing::Window => {
                log::debug!("vmo: unregistered window {:#x}+{:#x}", self.base, self.size)
            }
        }
    }
}
