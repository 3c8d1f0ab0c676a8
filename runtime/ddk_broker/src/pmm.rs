//! Physical page pool
//!
//! Bitmap allocator for the 4KB frames of the RAM region handed to the
//! broker. Contiguous memory objects draw their pages from here.
//!
//! # Design
//! - One bit per frame (1 = allocated, 0 = free)
//! - Frame numbers are relative to `ram_base`
//! - Contiguous allocation is a linear scan over aligned candidate frames;
//!   search and commit happen under a single lock acquisition, so a request
//!   either takes the whole run or leaves the bitmap untouched
//! - The lock is held for the search only, never for the lifetime of the
//!   objects built on top of the pages

use crate::config::PAGE_SIZE;
use crate::{DdkError, Result};
use spin::Mutex;

/// Number of pages needed to hold `size` bytes
pub fn pages_needed(size: usize) -> usize {
    size / PAGE_SIZE + usize::from(size % PAGE_SIZE != 0)
}

/// Round `size` up to a whole number of pages, `None` on overflow
pub fn round_up_page(size: usize) -> Option<usize> {
    size.checked_add(PAGE_SIZE - 1).map(|s| s & !(PAGE_SIZE - 1))
}

/// Frame bitmap protected by the pool lock
struct FrameBitmap {
    /// Bitmap tracking frame allocation (1 = allocated, 0 = free)
    bitmap: Vec<u64>,

    /// Total number of frames managed
    total_frames: usize,

    /// Number of free frames available
    free_frames: usize,
}

impl FrameBitmap {
    fn new(total_frames: usize) -> Self {
        let mut bitmap = vec![0u64; total_frames.div_ceil(64)];

        // Bits past the last frame stay permanently allocated
        let tail = total_frames % 64;
        if tail != 0 {
            if let Some(last) = bitmap.last_mut() {
                *last = !0u64 << tail;
            }
        }

        Self {
            bitmap,
            total_frames,
            free_frames: total_frames,
        }
    }

    #[inline]
    fn is_free(&self, frame: usize) -> bool {
        (self.bitmap[frame / 64] & (1u64 << (frame % 64))) == 0
    }

    #[inline]
    fn mark_allocated(&mut self, frame: usize) {
        self.bitmap[frame / 64] |= 1u64 << (frame % 64);
    }

    #[inline]
    fn mark_free(&mut self, frame: usize) {
        self.bitmap[frame / 64] &= !(1u64 << (frame % 64));
    }

    /// First allocated frame in `[start, start + count)`, if any
    fn first_used(&self, start: usize, count: usize) -> Option<usize> {
        (start..start + count).find(|&frame| !self.is_free(frame))
    }

    /// Find `count` free frames starting at a multiple of `stride` past
    /// `first`, and mark them allocated
    fn claim_run(&mut self, first: usize, stride: usize, count: usize) -> Option<usize> {
        let mut candidate = first;

        while candidate.checked_add(count)? <= self.total_frames {
            match self.first_used(candidate, count) {
                None => {
                    for frame in candidate..candidate + count {
                        self.mark_allocated(frame);
                    }
                    self.free_frames -= count;
                    return Some(candidate);
                }
                Some(used) => {
                    // Skip to the next aligned frame past the blocker
                    let skip = (used + 1 - candidate).div_ceil(stride) * stride;
                    candidate = candidate.checked_add(skip)?;
                }
            }
        }

        None
    }
}

/// Process-wide pool of physical pages
pub struct PagePool {
    /// Base physical address of RAM (frame 0 corresponds to this address)
    ram_base: usize,

    frames: Mutex<FrameBitmap>,
}

impl PagePool {
    /// Create a pool covering `[ram_base, ram_base + ram_size)`, all free
    ///
    /// # Errors
    /// `InvalidArgs` if the region is empty, not page aligned, or wraps
    pub fn new(ram_base: usize, ram_size: usize) -> Result<Self> {
        if ram_size == 0 || ram_base % PAGE_SIZE != 0 || ram_size % PAGE_SIZE != 0 {
            return Err(DdkError::InvalidArgs);
        }
        ram_base.checked_add(ram_size).ok_or(DdkError::InvalidArgs)?;

        Ok(Self {
            ram_base,
            frames: Mutex::new(FrameBitmap::new(ram_size / PAGE_SIZE)),
        })
    }

    /// Total number of pages managed
    pub fn total_pages(&self) -> usize {
        self.frames.lock().total_frames
    }

    /// Number of free pages
    pub fn free_pages(&self) -> usize {
        self.frames.lock().free_frames
    }

    /// Check if a physical range overlaps the pool's RAM
    pub fn overlaps(&self, base: usize, size: usize) -> bool {
        let ram_end = self.ram_base + self.total_pages() * PAGE_SIZE;
        let end = base.saturating_add(size);
        base < ram_end && end > self.ram_base
    }

    /// Reserve a physical region (mark as allocated)
    ///
    /// Used for boot-time carve-outs. Frames outside the pool or already
    /// allocated are ignored.
    pub fn reserve_region(&self, start: usize, size: usize) {
        let mut frames = self.frames.lock();
        let ram_end = self.ram_base + frames.total_frames * PAGE_SIZE;
        let clipped_start = start.max(self.ram_base);
        let clipped_end = start.saturating_add(size).min(ram_end);
        if clipped_start >= clipped_end {
            return;
        }

        let first = (clipped_start - self.ram_base) / PAGE_SIZE;
        let end = pages_needed(clipped_end - self.ram_base);

        for frame in first..end {
            if frames.is_free(frame) {
                frames.mark_allocated(frame);
                frames.free_frames -= 1;
            }
        }
    }

    /// Allocate `pages` physically contiguous pages aligned to
    /// `1 << align_log2` bytes
    ///
    /// All-or-nothing: on failure no frame changes state.
    ///
    /// # Returns
    /// Physical address of the first page
    ///
    /// # Errors
    /// - `InvalidArgs` for zero pages or sub-page / over-wide alignment
    /// - `NoMemory` if not enough free pages exist, or no aligned free run of
    ///   the requested length does
    pub fn alloc_contiguous(&self, pages: usize, align_log2: u32) -> Result<usize> {
        if pages == 0 || align_log2 < crate::config::PAGE_SIZE_SHIFT || align_log2 >= usize::BITS {
            return Err(DdkError::InvalidArgs);
        }

        let align = 1usize << align_log2;
        // First aligned frame at or after ram_base
        let first_addr = match self.ram_base.checked_next_multiple_of(align) {
            Some(addr) => addr,
            None => return Err(DdkError::NoMemory),
        };
        let first = (first_addr - self.ram_base) / PAGE_SIZE;
        let stride = align / PAGE_SIZE;

        let mut frames = self.frames.lock();
        if frames.free_frames < pages {
            return Err(DdkError::NoMemory);
        }

        let frame = frames
            .claim_run(first, stride, pages)
            .ok_or(DdkError::NoMemory)?;
        drop(frames);

        let base = self.ram_base + frame * PAGE_SIZE;
        log::debug!(
            "pmm: committed {} pages at {:#x} (align 2^{})",
            pages,
            base,
            align_log2
        );
        Ok(base)
    }

    /// Return a run previously handed out by [`alloc_contiguous`](Self::alloc_contiguous)
    pub fn free_contiguous(&self, base: usize, pages: usize) {
        if base < self.ram_base || base % PAGE_SIZE != 0 {
            log::warn!("pmm: ignoring free of foreign range {:#x}", base);
            return;
        }

        let mut frames = self.frames.lock();
        let first = (base - self.ram_base) / PAGE_SIZE;
        let end = first.saturating_add(pages).min(frames.total_frames);

        for frame in first..end {
            if !frames.is_free(frame) {
                frames.mark_free(frame);
                frames.free_frames += 1;
            }
        }
        drop(frames);

        log::debug!("pmm: released {} pages at {:#x}", pages, base);
    }

    /// Check if the page containing `addr` is free
    pub fn is_page_free(&self, addr: usize) -> bool {
        let frames = self.frames.lock();
        match addr.checked_sub(self.ram_base) {
            Some(offset) if offset / PAGE_SIZE < frames.total_frames => {
                frames.is_free(offset / PAGE_SIZE)
            }
            _ => false,
        }
    }
}

impl core::fmt::Debug for PagePool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let frames = self.frames.lock();
        f.debug_struct("PagePool")
            .field("ram_base", &format_args!("{:#x}", self.ram_base))
            .field("total_frames", &frames.total_frames)
            .field("free_frames", &frames.free_frames)
            .finish()
    }
}
