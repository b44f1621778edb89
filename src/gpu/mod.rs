//! GPU (dma-buf) surfaces
//!
//! A [`GpuSurface`] describes one dma-buf backed image: its planes, the
//! cross-process identity, an optional fence and an optional global
//! reference count. Surfaces are created by allocation or imported from a
//! [`GpuSurfaceDescriptor`] received from another process.

pub mod allocator;
pub mod context;
pub mod descriptor;
pub mod refcount;
pub mod sync;

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, trace, warn};
use memmap2::{Mmap, MmapMut, MmapOptions};
use rustix::io::Errno;

pub use allocator::{AllocError, Allocation, BufferAllocator, BufferUsage, MemfdAllocator};
pub use context::{ContextId, GpuContext, TextureId};
pub use descriptor::{DescriptorError, DescriptorMetadata, GpuSurfaceDescriptor, PlaneDescriptor, WireDescriptor};
pub use refcount::GlobalRefCount;
pub use sync::Access;

use crate::geometry::Size;
use crate::protocol::format::Fourcc;

/// Maximum number of planes a surface can carry
pub const MAX_PLANES: usize = 4;

/// Number of planes used by a format
pub fn plane_count(fourcc: Fourcc) -> usize {
    match fourcc {
        Fourcc::NV12 => 2,
        Fourcc::YUV420 => 3,
        _ => 1,
    }
}

/// Dimensions of one plane, chroma planes are subsampled 2x2
pub fn plane_size(fourcc: Fourcc, plane: usize, size: Size) -> Size {
    if plane == 0 || !fourcc.is_yuv() {
        return size;
    }
    Size::new(
        (size.width as u32).div_ceil(2) as i32,
        (size.height as u32).div_ceil(2) as i32,
    )
}

/// Bytes per pixel of one plane
pub fn plane_bytes_per_pixel(fourcc: Fourcc, plane: usize) -> u32 {
    match fourcc {
        Fourcc::NV12 if plane == 1 => 2,
        f if f.is_yuv() => 1,
        f => f.bytes_per_pixel(),
    }
}

/// What a surface holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceKind {
    /// Single plane color buffer
    Rgba,
    /// Planar video frame
    Yuv,
}

impl SurfaceKind {
    pub fn for_format(fourcc: Fourcc) -> Self {
        if fourcc.is_yuv() {
            SurfaceKind::Yuv
        } else {
            SurfaceKind::Rgba
        }
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            SurfaceKind::Rgba => 0,
            SurfaceKind::Yuv => 1,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Result<Self, DescriptorError> {
        match value {
            0 => Ok(SurfaceKind::Rgba),
            1 => Ok(SurfaceKind::Yuv),
            other => Err(DescriptorError::InvalidKind(other)),
        }
    }
}

/// One dma-buf plane
#[derive(Debug)]
pub struct Plane {
    fd: OwnedFd,
    stride: u32,
    offset: u32,
    modifier: u64,
}

impl Plane {
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn modifier(&self) -> u64 {
        self.modifier
    }
}

fn next_uid() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A dma-buf backed image shared with the compositor and other processes
#[derive(Debug)]
pub struct GpuSurface {
    kind: SurfaceKind,
    fourcc: Fourcc,
    size: Size,
    planes: Vec<Plane>,
    uid: u64,
    pid: u32,
    fence: Option<OwnedFd>,
    global_ref: Option<GlobalRefCount>,
    /// Whether this copy took a global reference that must be given back
    holds_global_ref: bool,
    textures: Vec<Option<TextureId>>,
    bound_context: Option<ContextId>,
}

impl GpuSurface {
    /// Allocate a new surface, falling back to linear when the modifier
    /// allocation fails
    pub fn allocate(
        allocator: &dyn BufferAllocator,
        size: Size,
        fourcc: Fourcc,
        modifiers: &[u64],
    ) -> Result<Self, AllocError> {
        let allocation = allocator::allocate(allocator, size, fourcc, modifiers)?;
        let expected = plane_count(fourcc);
        if allocation.planes.len() != expected || expected > MAX_PLANES {
            return Err(AllocError::UnsupportedFormat(fourcc));
        }

        let modifier = allocation.modifier;
        let planes = allocation
            .planes
            .into_iter()
            .map(|p| Plane {
                fd: p.fd,
                stride: p.stride,
                offset: p.offset,
                modifier,
            })
            .collect::<Vec<_>>();

        let surface = Self::from_parts(
            SurfaceKind::for_format(fourcc),
            fourcc,
            size,
            planes,
            next_uid(),
            std::process::id(),
        );
        debug!(
            "Created GPU surface {} ({:?} {}x{}, {} planes, modifier {:#x})",
            surface.uid,
            fourcc,
            size.width,
            size.height,
            surface.planes.len(),
            modifier
        );
        Ok(surface)
    }

    fn from_parts(
        kind: SurfaceKind,
        fourcc: Fourcc,
        size: Size,
        planes: Vec<Plane>,
        uid: u64,
        pid: u32,
    ) -> Self {
        let textures = vec![None; planes.len()];
        Self {
            kind,
            fourcc,
            size,
            planes,
            uid,
            pid,
            fence: None,
            global_ref: None,
            holds_global_ref: false,
            textures,
            bound_context: None,
        }
    }

    /// Rebuild a surface from a descriptor received over IPC
    ///
    /// The descriptor's fds are duplicated, the descriptor stays usable.
    pub fn import(descriptor: &GpuSurfaceDescriptor) -> Result<Self, GpuError> {
        let count = descriptor.planes.len();
        if count == 0 || count > MAX_PLANES {
            return Err(GpuError::InvalidPlaneCount(count));
        }

        let mut planes = Vec::with_capacity(count);
        for plane in &descriptor.planes {
            planes.push(Plane {
                fd: plane.fd.try_clone().map_err(GpuError::Io)?,
                stride: plane.stride,
                offset: plane.offset,
                modifier: plane.modifier,
            });
        }

        let mut surface = Self::from_parts(
            descriptor.kind,
            descriptor.fourcc,
            descriptor.size,
            planes,
            descriptor.owner_uid,
            descriptor.owner_pid,
        );
        if let Some(fence) = &descriptor.fence {
            surface.fence = Some(fence.try_clone().map_err(GpuError::Io)?);
        }
        if let Some(refcount) = &descriptor.global_refcount {
            let refcount = GlobalRefCount::from_fd(refcount.try_clone_fd().map_err(GpuError::Io)?);
            refcount.add();
            surface.global_ref = Some(refcount);
            surface.holds_global_ref = true;
        }

        debug!(
            "Imported GPU surface {} from pid {} ({:?} {}x{})",
            surface.uid, surface.pid, surface.fourcc, surface.size.width, surface.size.height
        );
        Ok(surface)
    }

    /// Produce a descriptor for another process
    ///
    /// Plane, fence and refcount fds are duplicated. The descriptor holds
    /// one global reference until it is dropped.
    pub fn serialize(&self) -> Result<GpuSurfaceDescriptor, GpuError> {
        let mut planes = Vec::with_capacity(self.planes.len());
        for plane in &self.planes {
            planes.push(PlaneDescriptor {
                fd: plane.fd.try_clone().map_err(GpuError::Io)?,
                stride: plane.stride,
                offset: plane.offset,
                modifier: plane.modifier,
            });
        }
        let fence = match &self.fence {
            Some(fence) => Some(fence.try_clone().map_err(GpuError::Io)?),
            None => None,
        };
        let global_refcount = match &self.global_ref {
            Some(refcount) => {
                let copy = GlobalRefCount::from_fd(refcount.try_clone_fd().map_err(GpuError::Io)?);
                copy.add();
                Some(copy)
            }
            None => None,
        };

        trace!("Serialized GPU surface {}", self.uid);
        Ok(GpuSurfaceDescriptor {
            kind: self.kind,
            fourcc: self.fourcc,
            size: self.size,
            planes,
            fence,
            global_refcount,
            owner_uid: self.uid,
            owner_pid: self.pid,
        })
    }

    /// Attach a global reference count so other processes can be tracked
    pub fn enable_global_refcount(&mut self) -> Result<(), GpuError> {
        if self.global_ref.is_none() {
            self.global_ref = Some(GlobalRefCount::create().map_err(GpuError::Io)?);
            debug!("Enabled global refcount on GPU surface {}", self.uid);
        }
        Ok(())
    }

    pub fn has_global_refcount(&self) -> bool {
        self.global_ref.is_some()
    }

    /// Whether any other process still references this surface
    pub fn is_globally_referenced(&self) -> bool {
        match &self.global_ref {
            Some(refcount) => refcount.is_referenced(),
            None => false,
        }
    }

    pub fn kind(&self) -> SurfaceKind {
        self.kind
    }

    pub fn fourcc(&self) -> Fourcc {
        self.fourcc
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn plane(&self, index: usize) -> Option<&Plane> {
        self.planes.get(index)
    }

    pub fn modifier(&self) -> u64 {
        self.planes.first().map(|p| p.modifier).unwrap_or_default()
    }

    /// Map a plane for CPU access
    ///
    /// The mapping is bracketed by dma-buf cache sync: start on map, end
    /// when the returned mapping is dropped.
    pub fn map(&self, plane: usize, access: Access) -> Result<PlaneMapping<'_>, GpuError> {
        let p = self.planes.get(plane).ok_or(GpuError::InvalidPlane(plane))?;
        let dims = plane_size(self.fourcc, plane, self.size);
        let len = p.stride as usize * dims.height as usize;

        let mut options = MmapOptions::new();
        options.offset(p.offset as u64).len(len);
        // SAFETY: the plane fd stays open for the lifetime of the mapping,
        // which borrows the surface.
        let data = if access.contains(Access::WRITE) {
            MappingData::Write(unsafe { options.map_mut(&p.fd) }.map_err(GpuError::Map)?)
        } else {
            MappingData::Read(unsafe { options.map(&p.fd) }.map_err(GpuError::Map)?)
        };

        if let Err(e) = sync::begin_cpu_access(p.fd.as_fd(), access) {
            report_sync_failure("begin", e);
        }
        trace!("Mapped plane {} of GPU surface {}", plane, self.uid);

        Ok(PlaneMapping {
            fd: p.fd.as_fd(),
            access,
            stride: p.stride,
            size: dims,
            data,
        })
    }

    /// Bind a plane as a texture of `context`
    ///
    /// Repeated calls with the same context return the existing texture.
    /// A surface bound to one context cannot be used from another.
    pub fn create_texture(
        &mut self,
        context: &dyn GpuContext,
        plane: usize,
    ) -> Result<TextureId, GpuError> {
        if plane >= self.planes.len() {
            return Err(GpuError::InvalidPlane(plane));
        }
        if let Some(bound) = self.bound_context {
            if bound != context.id() {
                error!(
                    "GPU surface {} is bound to context {:?}, refusing texture for {:?}",
                    self.uid,
                    bound,
                    context.id()
                );
                return Err(GpuError::ContextMismatch {
                    bound,
                    requested: context.id(),
                });
            }
        }
        if let Some(texture) = self.textures[plane] {
            return Ok(texture);
        }

        let texture = context.import_plane(self, plane)?;
        self.textures[plane] = Some(texture);
        self.bound_context = Some(context.id());
        debug!(
            "Created texture {:?} for plane {} of GPU surface {}",
            texture, plane, self.uid
        );
        Ok(texture)
    }

    /// Delete every texture created for `context`
    pub fn release_textures(&mut self, context: &dyn GpuContext) {
        if self.bound_context != Some(context.id()) {
            return;
        }
        for texture in self.textures.iter_mut().filter_map(Option::take) {
            context.delete_texture(texture);
        }
        self.bound_context = None;
    }

    /// Create a fence after the submitted rendering and keep it for the
    /// consumer
    pub fn signal_fence(&mut self, context: &dyn GpuContext) -> Result<(), GpuError> {
        let fence = context.create_fence()?;
        if self.fence.replace(fence).is_some() {
            trace!("Replaced unconsumed fence on GPU surface {}", self.uid);
        }
        Ok(())
    }

    /// Wait on the received fence, returns false when there was none
    ///
    /// Fences are single use: the local copy is gone afterwards.
    pub fn wait_fence(&mut self, context: &dyn GpuContext) -> Result<bool, GpuError> {
        match self.fence.take() {
            Some(fence) => {
                context.wait_fence(fence)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn has_fence(&self) -> bool {
        self.fence.is_some()
    }
}

impl Drop for GpuSurface {
    fn drop(&mut self) {
        if self.textures.iter().any(Option::is_some) {
            warn!(
                "GPU surface {} dropped with live textures on {:?}",
                self.uid, self.bound_context
            );
        }
        if self.holds_global_ref {
            if let Some(refcount) = &self.global_ref {
                refcount.release();
            }
        }
        debug!("Destroyed GPU surface {}", self.uid);
    }
}

fn report_sync_failure(stage: &str, e: Errno) {
    // Plain memfd planes are not dma-bufs and have no caches to sync
    if e == Errno::NOTTY {
        trace!("dma-buf sync {} skipped for non dma-buf plane", stage);
    } else {
        warn!("dma-buf sync {} failed: {}", stage, e);
    }
}

#[derive(Debug)]
enum MappingData {
    Read(Mmap),
    Write(MmapMut),
}

/// CPU mapping of one plane, ends cache sync on drop
#[derive(Debug)]
pub struct PlaneMapping<'a> {
    fd: BorrowedFd<'a>,
    access: Access,
    stride: u32,
    size: Size,
    data: MappingData,
}

impl PlaneMapping<'_> {
    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn data(&self) -> &[u8] {
        match &self.data {
            MappingData::Read(map) => map,
            MappingData::Write(map) => map,
        }
    }

    /// Writable bytes, `None` for read-only mappings
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.data {
            MappingData::Read(_) => None,
            MappingData::Write(map) => Some(map),
        }
    }

    /// End CPU access explicitly
    pub fn unmap(self) {}
}

impl Drop for PlaneMapping<'_> {
    fn drop(&mut self) {
        if let MappingData::Write(map) = &self.data {
            if let Err(e) = map.flush() {
                warn!("Failed to flush plane mapping: {}", e);
            }
        }
        if let Err(e) = sync::end_cpu_access(self.fd, self.access) {
            report_sync_failure("end", e);
        }
    }
}

/// GPU surface errors
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("Invalid plane index {0}")]
    InvalidPlane(usize),
    #[error("Invalid plane count {0}")]
    InvalidPlaneCount(usize),
    #[error("Failed to duplicate fd: {0}")]
    Io(#[source] io::Error),
    #[error("Failed to map plane: {0}")]
    Map(#[source] io::Error),
    #[error("Surface is bound to context {bound:?}, not {requested:?}")]
    ContextMismatch {
        bound: ContextId,
        requested: ContextId,
    },
    #[error("Buffer is not GPU backed")]
    NotGpuBacked,
    #[error("Render backend error: {0}")]
    Backend(String),
}
