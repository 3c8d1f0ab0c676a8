//! Resource gate - capability checks for privileged operations
//!
//! Every privileged syscall presents a [`Resource`]. The gate decides whether
//! that resource authorizes the request:
//! - [`validate_root`]: the caller must hold the root resource
//! - [`validate_range`]: the caller must hold an MMIO resource whose window
//!   covers the requested physical range
//!
//! Both checks are pure functions of the resource and the request, so they
//! can run concurrently from any number of threads.

use crate::{DdkError, Result};

/// Kind of privilege a resource grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Empty slot, grants nothing
    Null,

    /// Root resource, grants every privileged operation
    Root,

    /// Physical address window
    Mmio,
}

/// Unforgeable token proving the holder may perform privileged operations
///
/// Resources are minted by the kernel at boot and are immutable afterwards.
/// Drivers never see the fields directly; they hand the resource back to the
/// broker, which inspects it through the gate.
#[derive(Debug, PartialEq, Eq)]
pub struct Resource {
    kind: ResourceKind,
    base: u64,
    size: u64,
}

impl Resource {
    /// Null resource (revoked or never granted)
    pub const fn null() -> Self {
        Self {
            kind: ResourceKind::Null,
            base: 0,
            size: 0,
        }
    }

    /// The root resource
    pub const fn root() -> Self {
        Self {
            kind: ResourceKind::Root,
            base: 0,
            size: 0,
        }
    }

    /// An MMIO resource authorizing `[base, base + size)`
    ///
    /// # Errors
    /// `InvalidArgs` for an empty window or one that wraps the address space
    pub fn mmio(base: u64, size: u64) -> Result<Self> {
        if size == 0 || base.checked_add(size).is_none() {
            return Err(DdkError::InvalidArgs);
        }

        Ok(Self {
            kind: ResourceKind::Mmio,
            base,
            size,
        })
    }

    /// Get the resource kind
    #[inline]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Base of the authorized window (MMIO resources only)
    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the authorized window (MMIO resources only)
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Check if `[base, end)` lies inside the authorized window
    fn covers(&self, base: u64, end: u64) -> bool {
        base >= self.base && end <= self.base + self.size
    }
}

/// Require the root resource
///
/// # Errors
/// - `InvalidArgs` for a null resource
/// - `AccessDenied` for any other non-root resource
pub fn validate_root(resource: &Resource) -> Result<()> {
    match resource.kind {
        ResourceKind::Root => Ok(()),
        ResourceKind::Null => Err(DdkError::InvalidArgs),
        ResourceKind::Mmio => Err(DdkError::AccessDenied),
    }
}

/// Require an MMIO resource covering `[base, base + length)`
///
/// # Errors
/// - `InvalidArgs` for a null resource or a zero length
/// - `OutOfRange` if the requested range wraps the address space
/// - `AccessDenied` if the resource is not an MMIO resource or does not cover
///   the whole range
pub fn validate_range(resource: &Resource, base: u64, length: u64) -> Result<()> {
    match resource.kind {
        ResourceKind::Mmio => {}
        ResourceKind::Null => return Err(DdkError::InvalidArgs),
        ResourceKind::Root => return Err(DdkError::AccessDenied),
    }

    if length == 0 {
        return Err(DdkError::InvalidArgs);
    }
    let end = base.checked_add(length).ok_or(DdkError::OutOfRange)?;

    if !resource.covers(base, end) {
        return Err(DdkError::AccessDenied);
    }
    Ok(())
}
