//! GPU buffer allocation
//!
//! The device-specific allocator (GBM or similar) lives in the render
//! backend and is reached through [`BufferAllocator`]. This module owns the
//! policy: try the compositor's modifiers first and fall back to a linear
//! allocation when that fails, since compositors do not accept every
//! modifier a driver can produce.

use std::fmt;
use std::os::fd::OwnedFd;

use bitflags::bitflags;
use log::{debug, warn};
use rustix::fs::{ftruncate, memfd_create, MemfdFlags};

use super::{plane_bytes_per_pixel, plane_count, plane_size};
use crate::geometry::Size;
use crate::protocol::format::{Fourcc, DRM_FORMAT_MOD_LINEAR};

bitflags! {
    /// Intended use of an allocation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferUsage: u32 {
        /// Rendered into by the GPU
        const RENDERING = 1;
        /// Candidate for direct scanout
        const SCANOUT = 1 << 1;
        /// Linear layout, CPU mappable
        const LINEAR = 1 << 2;
    }
}

/// One plane of a fresh allocation
#[derive(Debug)]
pub struct AllocatedPlane {
    pub fd: OwnedFd,
    pub stride: u32,
    pub offset: u32,
}

/// Result of a successful allocation
#[derive(Debug)]
pub struct Allocation {
    pub planes: Vec<AllocatedPlane>,
    /// Modifier the buffer was laid out with
    pub modifier: u64,
}

/// Device allocator provided by the render backend
pub trait BufferAllocator: Send + Sync + fmt::Debug {
    /// Allocate using one of the given explicit modifiers
    fn allocate_with_modifiers(
        &self,
        size: Size,
        fourcc: Fourcc,
        modifiers: &[u64],
    ) -> Result<Allocation, AllocError>;

    /// Allocate without modifiers (linear or driver default)
    fn allocate_linear(
        &self,
        size: Size,
        fourcc: Fourcc,
        usage: BufferUsage,
    ) -> Result<Allocation, AllocError>;
}

/// Allocate a buffer, preferring modifiers and falling back to linear
pub fn allocate(
    allocator: &dyn BufferAllocator,
    size: Size,
    fourcc: Fourcc,
    modifiers: &[u64],
) -> Result<Allocation, AllocError> {
    if size.is_empty() {
        return Err(AllocError::InvalidSize(size));
    }

    if !modifiers.is_empty() {
        match allocator.allocate_with_modifiers(size, fourcc, modifiers) {
            Ok(allocation) => {
                debug!(
                    "Allocated {}x{} {:?} with modifier {:#x}",
                    size.width, size.height, fourcc, allocation.modifier
                );
                return Ok(allocation);
            }
            Err(e) => {
                warn!(
                    "Allocation of {}x{} {:?} with {} modifiers failed ({}), falling back to linear",
                    size.width,
                    size.height,
                    fourcc,
                    modifiers.len(),
                    e
                );
            }
        }
    }

    let allocation =
        allocator.allocate_linear(size, fourcc, BufferUsage::RENDERING | BufferUsage::LINEAR)?;
    debug!(
        "Allocated {}x{} {:?} without modifiers",
        size.width, size.height, fourcc
    );
    Ok(allocation)
}

/// Allocator backed by anonymous memory files
///
/// Produces linear, CPU-mappable planes. It cannot honor tiled modifiers,
/// so modifier requests succeed only when the list contains
/// `DRM_FORMAT_MOD_LINEAR`. Useful for software rendering paths and for
/// exercising the allocation policy without a GPU.
#[derive(Debug, Clone, Copy)]
pub struct MemfdAllocator {
    /// Row alignment in bytes
    pub stride_alignment: u32,
}

impl Default for MemfdAllocator {
    fn default() -> Self {
        Self {
            stride_alignment: 64,
        }
    }
}

impl MemfdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_planes(&self, size: Size, fourcc: Fourcc) -> Result<Vec<AllocatedPlane>, AllocError> {
        if size.is_empty() {
            return Err(AllocError::InvalidSize(size));
        }

        let align = self.stride_alignment.max(1);
        let mut layout = Vec::new();
        let mut total: u64 = 0;
        for plane in 0..plane_count(fourcc) {
            let dims = plane_size(fourcc, plane, size);
            let row = dims.width as u32 * plane_bytes_per_pixel(fourcc, plane);
            let stride = row.div_ceil(align) * align;
            layout.push((stride, total as u32));
            total += stride as u64 * dims.height as u64;
        }
        if total > u32::MAX as u64 {
            return Err(AllocError::InvalidSize(size));
        }

        let fd = memfd_create("waylayer-gpu", MemfdFlags::CLOEXEC).map_err(|e| AllocError::Io(e.into()))?;
        ftruncate(&fd, total).map_err(|e| AllocError::Io(e.into()))?;

        let mut planes = Vec::with_capacity(layout.len());
        for (stride, offset) in layout {
            planes.push(AllocatedPlane {
                fd: fd.try_clone().map_err(AllocError::Io)?,
                stride,
                offset,
            });
        }
        Ok(planes)
    }
}

impl BufferAllocator for MemfdAllocator {
    fn allocate_with_modifiers(
        &self,
        size: Size,
        fourcc: Fourcc,
        modifiers: &[u64],
    ) -> Result<Allocation, AllocError> {
        if !modifiers.contains(&DRM_FORMAT_MOD_LINEAR) {
            return Err(AllocError::UnsupportedModifiers(modifiers.to_vec()));
        }
        Ok(Allocation {
            planes: self.allocate_planes(size, fourcc)?,
            modifier: DRM_FORMAT_MOD_LINEAR,
        })
    }

    fn allocate_linear(
        &self,
        size: Size,
        fourcc: Fourcc,
        _usage: BufferUsage,
    ) -> Result<Allocation, AllocError> {
        Ok(Allocation {
            planes: self.allocate_planes(size, fourcc)?,
            modifier: DRM_FORMAT_MOD_LINEAR,
        })
    }
}

/// Buffer allocation errors
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("Invalid buffer size {0:?}")]
    InvalidSize(Size),
    #[error("No allocator available for GPU buffers")]
    NoAllocator,
    #[error("Format {0:?} is not supported")]
    UnsupportedFormat(Fourcc),
    #[error("None of the modifiers {0:x?} is supported")]
    UnsupportedModifiers(Vec<u64>),
    #[error("Out of buffer memory")]
    OutOfMemory,
    #[error("Shared memory allocation failed: {0}")]
    Shm(#[from] crate::protocol::ShmError),
    #[error("Allocation I/O error: {0}")]
    Io(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Allocator whose modifier path always fails
    #[derive(Debug, Default)]
    struct NoModifiers {
        linear_calls: std::sync::atomic::AtomicUsize,
    }

    impl BufferAllocator for NoModifiers {
        fn allocate_with_modifiers(
            &self,
            _size: Size,
            _fourcc: Fourcc,
            _modifiers: &[u64],
        ) -> Result<Allocation, AllocError> {
            Err(AllocError::OutOfMemory)
        }

        fn allocate_linear(
            &self,
            size: Size,
            fourcc: Fourcc,
            usage: BufferUsage,
        ) -> Result<Allocation, AllocError> {
            assert!(usage.contains(BufferUsage::LINEAR));
            self.linear_calls
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            MemfdAllocator::new().allocate_linear(size, fourcc, usage)
        }
    }

    #[test]
    fn test_modifier_failure_falls_back_to_linear() {
        let allocator = NoModifiers::default();
        let allocation = allocate(&allocator, Size::new(64, 64), Fourcc::XRGB8888, &[0x0100_0000_0000_0001])
            .expect("linear fallback should succeed");
        assert_eq!(allocation.modifier, DRM_FORMAT_MOD_LINEAR);
        assert_eq!(allocation.planes.len(), 1);
        assert_eq!(
            allocator
                .linear_calls
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_memfd_allocator_rejects_tiled_modifiers() {
        let allocator = MemfdAllocator::new();
        let result =
            allocator.allocate_with_modifiers(Size::new(8, 8), Fourcc::ARGB8888, &[0x0100_0000_0000_0002]);
        assert!(matches!(result, Err(AllocError::UnsupportedModifiers(_))));

        let ok = allocator
            .allocate_with_modifiers(Size::new(8, 8), Fourcc::ARGB8888, &[DRM_FORMAT_MOD_LINEAR])
            .unwrap();
        assert_eq!(ok.planes[0].stride, 64);
    }

    #[test]
    fn test_memfd_allocator_nv12_layout() {
        let allocation = MemfdAllocator::new()
            .allocate_linear(Size::new(100, 50), Fourcc::NV12, BufferUsage::LINEAR)
            .unwrap();
        assert_eq!(allocation.planes.len(), 2);
        assert_eq!(allocation.planes[0].stride, 128);
        assert_eq!(allocation.planes[1].offset, 128 * 50);
    }

    #[test]
    fn test_empty_size_rejected() {
        let result = allocate(&MemfdAllocator::new(), Size::new(0, 4), Fourcc::ARGB8888, &[]);
        assert!(matches!(result, Err(AllocError::InvalidSize(_))));
    }
}
