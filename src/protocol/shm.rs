//! Shared memory buffer storage
//!
//! Allocates memfd-backed regions for `wl_shm` buffers and keeps them
//! mapped for CPU drawing.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use memmap2::{MmapMut, MmapOptions};
use rustix::fs::{ftruncate, memfd_create, MemfdFlags};

use super::format::Fourcc;
use crate::geometry::Size;

/// Unique identifier for shm regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShmRegionId(pub u64);

impl ShmRegionId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ShmRegionId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Pixel formats as spelled by `wl_shm`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmFormat {
    /// 32-bit ARGB (A in high byte)
    Argb8888,
    /// 32-bit XRGB (X in high byte, alpha ignored)
    Xrgb8888,
    /// Any other format, using its fourcc code
    Other(u32),
}

impl ShmFormat {
    /// Create from Wayland format value
    pub fn from_wayland(format: u32) -> Self {
        match format {
            0 => ShmFormat::Argb8888,
            1 => ShmFormat::Xrgb8888,
            other => ShmFormat::Other(other),
        }
    }

    /// Convert to Wayland format value
    pub fn to_wayland(&self) -> u32 {
        match self {
            ShmFormat::Argb8888 => 0,
            ShmFormat::Xrgb8888 => 1,
            ShmFormat::Other(v) => *v,
        }
    }

    pub fn from_fourcc(fourcc: Fourcc) -> Self {
        match fourcc {
            Fourcc::ARGB8888 => ShmFormat::Argb8888,
            Fourcc::XRGB8888 => ShmFormat::Xrgb8888,
            other => ShmFormat::Other(other.0),
        }
    }

    pub fn fourcc(&self) -> Fourcc {
        match self {
            ShmFormat::Argb8888 => Fourcc::ARGB8888,
            ShmFormat::Xrgb8888 => Fourcc::XRGB8888,
            ShmFormat::Other(v) => Fourcc(*v),
        }
    }

    /// Get bytes per pixel
    pub fn bytes_per_pixel(&self) -> u32 {
        self.fourcc().bytes_per_pixel()
    }
}

/// Layout of one buffer inside a shm region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmLayout {
    pub size: Size,
    pub stride: u32,
    pub offset: u32,
    pub format: ShmFormat,
}

impl ShmLayout {
    /// Tightly packed layout at offset zero
    pub fn packed(size: Size, format: ShmFormat) -> Result<Self, ShmError> {
        if size.is_empty() {
            return Err(ShmError::InvalidSize);
        }
        let stride = (size.width as u32)
            .checked_mul(format.bytes_per_pixel())
            .ok_or(ShmError::BufferTooLarge)?;
        let layout = Self {
            size,
            stride,
            offset: 0,
            format,
        };
        layout.data_size()?;
        Ok(layout)
    }

    /// Get the size of the buffer data in bytes
    pub fn data_size(&self) -> Result<usize, ShmError> {
        (self.stride as usize)
            .checked_mul(self.size.height as usize)
            .filter(|len| *len <= i32::MAX as usize)
            .ok_or(ShmError::BufferTooLarge)
    }

    /// Check the layout against a pool of `pool_size` bytes
    pub fn validate(&self, pool_size: usize) -> Result<(), ShmError> {
        if self.size.is_empty() {
            return Err(ShmError::InvalidSize);
        }

        // Validate stride
        let min_stride = self.size.width as u32 * self.format.bytes_per_pixel();
        if self.stride < min_stride {
            return Err(ShmError::InvalidStride);
        }

        // Validate buffer fits in pool
        let buffer_end = self.offset as usize + self.data_size()?;
        if buffer_end > pool_size {
            return Err(ShmError::BufferTooLarge);
        }
        Ok(())
    }
}

/// A memfd-backed shared memory region, mapped read-write
#[derive(Debug)]
pub struct ShmRegion {
    id: ShmRegionId,
    fd: OwnedFd,
    map: MmapMut,
    layout: ShmLayout,
}

impl ShmRegion {
    /// Allocate and map a region large enough for `layout`
    pub fn allocate(layout: ShmLayout) -> Result<Self, ShmError> {
        let len = layout.offset as usize + layout.data_size()?;
        layout.validate(len)?;

        let fd = memfd_create("waylayer-shm", MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING)
            .map_err(|e| ShmError::Allocate(e.into()))?;
        ftruncate(&fd, len as u64).map_err(|e| ShmError::Allocate(e.into()))?;

        // SAFETY: the memfd was just created by us and is only resized here;
        // nothing truncates it while the mapping is alive.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&fd) }.map_err(ShmError::Map)?;

        let id = ShmRegionId::new();
        debug!(
            "Created shm region {:?}, {}x{}, stride {}, {} bytes",
            id, layout.size.width, layout.size.height, layout.stride, len
        );
        Ok(Self {
            id,
            fd,
            map,
            layout,
        })
    }

    pub fn id(&self) -> ShmRegionId {
        self.id
    }

    pub fn layout(&self) -> &ShmLayout {
        &self.layout
    }

    /// Size of the whole region in bytes
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Pixel bytes of the buffer, starting at the layout offset
    pub fn data(&self) -> &[u8] {
        &self.map[self.layout.offset as usize..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let offset = self.layout.offset as usize;
        &mut self.map[offset..]
    }
}

/// SHM errors
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("Invalid buffer size")]
    InvalidSize,
    #[error("Buffer too large for pool")]
    BufferTooLarge,
    #[error("Invalid stride")]
    InvalidStride,
    #[error("Failed to allocate shared memory: {0}")]
    Allocate(#[source] std::io::Error),
    #[error("Failed to map shared memory: {0}")]
    Map(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shm_format() {
        assert_eq!(ShmFormat::from_wayland(0), ShmFormat::Argb8888);
        assert_eq!(ShmFormat::Argb8888.to_wayland(), 0);
        assert_eq!(ShmFormat::Argb8888.bytes_per_pixel(), 4);
        assert_eq!(ShmFormat::from_fourcc(Fourcc::XRGB8888), ShmFormat::Xrgb8888);
        assert_eq!(
            ShmFormat::from_fourcc(Fourcc::ABGR8888).to_wayland(),
            Fourcc::ABGR8888.0
        );
    }

    #[test]
    fn test_shm_layout() {
        let layout = ShmLayout::packed(Size::new(100, 100), ShmFormat::Argb8888).unwrap();
        assert_eq!(layout.stride, 400);
        assert_eq!(layout.data_size().unwrap(), 40000);
        assert!(layout.validate(40000).is_ok());
        assert!(matches!(layout.validate(39999), Err(ShmError::BufferTooLarge)));

        let narrow = ShmLayout {
            stride: 100,
            ..layout
        };
        assert!(matches!(narrow.validate(40000), Err(ShmError::InvalidStride)));
        assert!(matches!(
            ShmLayout::packed(Size::new(0, 10), ShmFormat::Argb8888),
            Err(ShmError::InvalidSize)
        ));
    }

    #[test]
    fn test_shm_region_is_writable() {
        let layout = ShmLayout::packed(Size::new(16, 8), ShmFormat::Xrgb8888).unwrap();
        let mut region = ShmRegion::allocate(layout).unwrap();
        assert_eq!(region.len(), 16 * 8 * 4);

        region.data_mut()[0..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&region.data()[0..4], &[1, 2, 3, 4]);
    }
}
