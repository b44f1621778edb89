//! Serialized GPU surface descriptor
//!
//! The descriptor is what crosses the IPC boundary: plane fds plus the
//! metadata needed to rebuild the surface on the other side. On the wire it
//! is a fixed little-endian header, one record per plane, and a list of fds
//! sent out of band (`SCM_RIGHTS`) in the order planes, fence, refcount.
//!
//! A descriptor owns one global reference while it exists; it is released
//! when the descriptor is dropped and travels with it through
//! [`GpuSurfaceDescriptor::into_wire`].

use std::os::fd::OwnedFd;

use super::refcount::GlobalRefCount;
use super::{SurfaceKind, MAX_PLANES};
use crate::geometry::Size;
use crate::protocol::format::Fourcc;

const MAGIC: u32 = 0x5347_4c57;
const VERSION: u8 = 1;
const HEADER_LEN: usize = 32;
const PLANE_LEN: usize = 16;

const FLAG_FENCE: u8 = 1 << 0;
const FLAG_REFCOUNT: u8 = 1 << 1;

/// One serialized plane
#[derive(Debug)]
pub struct PlaneDescriptor {
    pub fd: OwnedFd,
    pub stride: u32,
    pub offset: u32,
    pub modifier: u64,
}

/// Everything needed to import a GPU surface in another process
#[derive(Debug)]
pub struct GpuSurfaceDescriptor {
    pub kind: SurfaceKind,
    pub fourcc: Fourcc,
    pub size: Size,
    pub planes: Vec<PlaneDescriptor>,
    pub fence: Option<OwnedFd>,
    pub global_refcount: Option<GlobalRefCount>,
    /// Global id of the surface in its creating process
    pub owner_uid: u64,
    /// Process id of the creator
    pub owner_pid: u32,
}

/// The fd-free part of a descriptor, comparable across round trips
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorMetadata {
    pub kind: SurfaceKind,
    pub fourcc: Fourcc,
    pub size: Size,
    /// `(stride, offset, modifier)` per plane
    pub planes: Vec<(u32, u32, u64)>,
    pub has_fence: bool,
    pub has_global_refcount: bool,
    pub owner_uid: u64,
    pub owner_pid: u32,
}

/// A descriptor flattened for transport
#[derive(Debug)]
pub struct WireDescriptor {
    pub bytes: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

impl GpuSurfaceDescriptor {
    pub fn metadata(&self) -> DescriptorMetadata {
        DescriptorMetadata {
            kind: self.kind,
            fourcc: self.fourcc,
            size: self.size,
            planes: self
                .planes
                .iter()
                .map(|p| (p.stride, p.offset, p.modifier))
                .collect(),
            has_fence: self.fence.is_some(),
            has_global_refcount: self.global_refcount.is_some(),
            owner_uid: self.owner_uid,
            owner_pid: self.owner_pid,
        }
    }

    /// Flatten into bytes and fds, handing over the held reference
    pub fn into_wire(mut self) -> WireDescriptor {
        let mut flags = 0u8;
        if self.fence.is_some() {
            flags |= FLAG_FENCE;
        }
        if self.global_refcount.is_some() {
            flags |= FLAG_REFCOUNT;
        }

        let mut bytes = Vec::with_capacity(HEADER_LEN + PLANE_LEN * self.planes.len());
        bytes.extend_from_slice(&MAGIC.to_le_bytes());
        bytes.push(VERSION);
        bytes.push(self.kind.to_wire());
        bytes.push(self.planes.len() as u8);
        bytes.push(flags);
        bytes.extend_from_slice(&self.fourcc.0.to_le_bytes());
        bytes.extend_from_slice(&(self.size.width as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.size.height as u32).to_le_bytes());
        bytes.extend_from_slice(&self.owner_uid.to_le_bytes());
        bytes.extend_from_slice(&self.owner_pid.to_le_bytes());

        let planes = std::mem::take(&mut self.planes);
        let mut fds = Vec::with_capacity(planes.len() + 2);
        for plane in planes {
            bytes.extend_from_slice(&plane.stride.to_le_bytes());
            bytes.extend_from_slice(&plane.offset.to_le_bytes());
            bytes.extend_from_slice(&plane.modifier.to_le_bytes());
            fds.push(plane.fd);
        }
        if let Some(fence) = self.fence.take() {
            fds.push(fence);
        }
        if let Some(refcount) = self.global_refcount.take() {
            fds.push(refcount.into_fd());
        }

        WireDescriptor { bytes, fds }
    }

    /// Rebuild a descriptor received over IPC
    pub fn from_wire(wire: WireDescriptor) -> Result<Self, DescriptorError> {
        let WireDescriptor { bytes, fds } = wire;
        let mut reader = Reader::new(&bytes);

        if reader.u32()? != MAGIC {
            return Err(DescriptorError::BadMagic);
        }
        let version = reader.u8()?;
        if version != VERSION {
            return Err(DescriptorError::UnsupportedVersion(version));
        }
        let kind = SurfaceKind::from_wire(reader.u8()?)?;
        let plane_count = reader.u8()?;
        if plane_count == 0 || plane_count as usize > MAX_PLANES {
            return Err(DescriptorError::InvalidPlaneCount(plane_count));
        }
        let flags = reader.u8()?;
        let fourcc = Fourcc(reader.u32()?);
        let width = reader.u32()?;
        let height = reader.u32()?;
        if width == 0 || height == 0 || width > i32::MAX as u32 || height > i32::MAX as u32 {
            return Err(DescriptorError::InvalidSize(width, height));
        }
        let owner_uid = reader.u64()?;
        let owner_pid = reader.u32()?;

        let mut records = Vec::with_capacity(plane_count as usize);
        for _ in 0..plane_count {
            records.push((reader.u32()?, reader.u32()?, reader.u64()?));
        }
        if !reader.is_empty() {
            return Err(DescriptorError::TrailingBytes);
        }

        let expected = plane_count as usize
            + usize::from(flags & FLAG_FENCE != 0)
            + usize::from(flags & FLAG_REFCOUNT != 0);
        if fds.len() != expected {
            return Err(DescriptorError::FdCountMismatch {
                expected,
                got: fds.len(),
            });
        }

        let mut fds = fds.into_iter();
        let mut planes = Vec::with_capacity(records.len());
        for ((stride, offset, modifier), fd) in records.into_iter().zip(fds.by_ref()) {
            planes.push(PlaneDescriptor {
                fd,
                stride,
                offset,
                modifier,
            });
        }
        let fence = if flags & FLAG_FENCE != 0 {
            fds.next()
        } else {
            None
        };
        let global_refcount = if flags & FLAG_REFCOUNT != 0 {
            fds.next().map(GlobalRefCount::from_fd)
        } else {
            None
        };

        Ok(Self {
            kind,
            fourcc,
            size: Size::new(width as i32, height as i32),
            planes,
            fence,
            global_refcount,
            owner_uid,
            owner_pid,
        })
    }
}

impl Drop for GpuSurfaceDescriptor {
    fn drop(&mut self) {
        if let Some(refcount) = &self.global_refcount {
            refcount.release();
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DescriptorError> {
        if self.bytes.len() < N {
            return Err(DescriptorError::Truncated);
        }
        let (head, rest) = self.bytes.split_at(N);
        self.bytes = rest;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DescriptorError> {
        Ok(self.take::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, DescriptorError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64, DescriptorError> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Descriptor decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("Descriptor is truncated")]
    Truncated,
    #[error("Descriptor has trailing bytes")]
    TrailingBytes,
    #[error("Bad descriptor magic")]
    BadMagic,
    #[error("Unsupported descriptor version {0}")]
    UnsupportedVersion(u8),
    #[error("Unknown surface kind {0}")]
    InvalidKind(u8),
    #[error("Invalid plane count {0}")]
    InvalidPlaneCount(u8),
    #[error("Invalid surface size {0}x{1}")]
    InvalidSize(u32, u32),
    #[error("Expected {expected} fds, got {got}")]
    FdCountMismatch { expected: usize, got: usize },
}
