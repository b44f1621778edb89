//! Drawable buffers
//!
//! A [`BufferObject`] owns one block of pixel storage, either a shared
//! memory region or a [`GpuSurface`], plus the `wl_buffer` created for it.
//! Its attach state lives in a shared [`ReleaseTracker`] so compositor
//! release events can reach it without going through a surface.

mod release;

pub use release::ReleaseTracker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::context::DisplayContext;
use crate::geometry::{Rect, Size};
use crate::gpu::{Access, AllocError, GpuContext, GpuError, GpuSurface, PlaneMapping, TextureId};
use crate::protocol::{
    DmabufPlane, Fourcc, ProtoId, ShmBufferParams, ShmFormat, ShmLayout, ShmRegion, WireProtocol,
};
use crate::surface::SurfaceInbox;

/// Unique identifier for buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl BufferId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        BufferId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Backing storage kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Shm,
    Gpu,
}

#[derive(Debug)]
enum BufferStorage {
    Shm(ShmRegion),
    Gpu(GpuSurface),
}

/// One drawable buffer and its `wl_buffer`
#[derive(Debug)]
pub struct BufferObject {
    id: BufferId,
    size: Size,
    fourcc: Fourcc,
    storage: BufferStorage,
    /// `None` when the compositor refused the buffer
    proto: Option<ProtoId>,
    protocol: Arc<dyn WireProtocol>,
    release: Arc<ReleaseTracker>,
}

impl BufferObject {
    /// Allocate a buffer of the given kind
    pub fn create(
        ctx: &DisplayContext,
        kind: BufferKind,
        size: Size,
        fourcc: Fourcc,
    ) -> Result<Self, AllocError> {
        match kind {
            BufferKind::Shm => Self::create_shm(ctx, size, fourcc),
            BufferKind::Gpu => Self::create_gpu(ctx, size, fourcc),
        }
    }

    /// Allocate a shared memory buffer
    pub fn create_shm(ctx: &DisplayContext, size: Size, fourcc: Fourcc) -> Result<Self, AllocError> {
        let layout = ShmLayout::packed(size, ShmFormat::from_fourcc(fourcc))?;
        let region = ShmRegion::allocate(layout)?;

        let id = BufferId::next();
        let release = Arc::new(ReleaseTracker::new(id));
        let protocol = ctx.protocol().clone();
        let proto = protocol.create_shm_buffer(
            ShmBufferParams {
                fd: region.fd(),
                pool_size: region.len(),
                layout,
            },
            &release,
        );
        if proto.is_none() {
            warn!("Compositor refused shm buffer {:?}", id);
        }

        debug!(
            "Created shm buffer {:?} ({}x{} {:?}, proto {:?})",
            id, size.width, size.height, fourcc, proto
        );
        Ok(Self {
            id,
            size,
            fourcc,
            storage: BufferStorage::Shm(region),
            proto,
            protocol,
            release,
        })
    }

    /// Allocate a dma-buf buffer with the compositor's modifiers
    ///
    /// Falls back to a linear allocation when the modifier allocation fails.
    pub fn create_gpu(ctx: &DisplayContext, size: Size, fourcc: Fourcc) -> Result<Self, AllocError> {
        let allocator = ctx.allocator().ok_or(AllocError::NoAllocator)?;
        let modifiers = ctx.modifiers(fourcc);
        let surface = GpuSurface::allocate(allocator, size, fourcc, &modifiers)?;
        Ok(Self::from_gpu_surface(ctx, surface))
    }

    /// Wrap an existing GPU surface, for instance one imported from
    /// another process
    pub fn from_gpu_surface(ctx: &DisplayContext, surface: GpuSurface) -> Self {
        let id = BufferId::next();
        let release = Arc::new(ReleaseTracker::new(id));
        let protocol = ctx.protocol().clone();

        let planes = surface
            .planes()
            .iter()
            .map(|p| DmabufPlane {
                fd: p.fd(),
                offset: p.offset(),
                stride: p.stride(),
                modifier: p.modifier(),
            })
            .collect::<Vec<_>>();
        let proto = protocol.create_dmabuf_buffer(&planes, surface.size(), surface.fourcc(), &release);
        if proto.is_none() {
            warn!("Compositor refused dma-buf buffer {:?}", id);
        }

        debug!(
            "Created GPU buffer {:?} for surface {} (proto {:?})",
            id,
            surface.uid(),
            proto
        );
        Self {
            id,
            size: surface.size(),
            fourcc: surface.fourcc(),
            storage: BufferStorage::Gpu(surface),
            proto,
            protocol,
            release,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn fourcc(&self) -> Fourcc {
        self.fourcc
    }

    pub fn kind(&self) -> BufferKind {
        match self.storage {
            BufferStorage::Shm(_) => BufferKind::Shm,
            BufferStorage::Gpu(_) => BufferKind::Gpu,
        }
    }

    pub fn proto(&self) -> Option<ProtoId> {
        self.proto
    }

    pub fn is_attached(&self) -> bool {
        self.release.is_attached()
    }

    pub fn is_free(&self) -> bool {
        self.release.is_free()
    }

    /// Still held by the compositor for a surface that was unmapped
    pub fn is_orphaned(&self) -> bool {
        self.release.is_orphaned()
    }

    pub fn release_tracker(&self) -> &Arc<ReleaseTracker> {
        &self.release
    }

    pub fn gpu_surface(&self) -> Option<&GpuSurface> {
        match &self.storage {
            BufferStorage::Gpu(surface) => Some(surface),
            BufferStorage::Shm(_) => None,
        }
    }

    pub fn gpu_surface_mut(&mut self) -> Option<&mut GpuSurface> {
        match &mut self.storage {
            BufferStorage::Gpu(surface) => Some(surface),
            BufferStorage::Shm(_) => None,
        }
    }

    /// Hand the protocol buffer to `owner` for attaching
    ///
    /// Returns `None` when the buffer has no protocol handle.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is still attached somewhere.
    pub fn borrow(&self, owner: &SurfaceInbox) -> Option<ProtoId> {
        let proto = self.proto?;
        self.release.mark_attached(owner);
        Some(proto)
    }

    /// The compositor is done with the buffer
    ///
    /// Releases arriving after the surface unmapped still free the buffer.
    /// Duplicate releases are ignored and return false.
    pub fn on_compositor_release(&self) -> bool {
        self.release.on_compositor_release()
    }

    /// Whether the buffer can be drawn into again
    ///
    /// GPU buffers also need every other process to have dropped them.
    pub fn can_recycle(&self) -> bool {
        if !self.is_free() {
            return false;
        }
        match &self.storage {
            BufferStorage::Gpu(surface) => !surface.is_globally_referenced(),
            BufferStorage::Shm(_) => true,
        }
    }

    /// Map the pixels for CPU drawing
    ///
    /// # Panics
    ///
    /// Panics if the compositor still holds the buffer.
    pub fn lock(&mut self) -> Result<DrawTarget<'_>, GpuError> {
        assert!(
            self.is_free(),
            "buffer {:?} locked for drawing while attached",
            self.id
        );
        let fourcc = self.fourcc;
        let size = self.size;
        match &mut self.storage {
            BufferStorage::Shm(region) => {
                let stride = region.layout().stride;
                Ok(DrawTarget {
                    size,
                    stride,
                    fourcc,
                    pixels: Pixels::Shm(region.data_mut()),
                })
            }
            BufferStorage::Gpu(surface) => {
                let mapping = surface.map(0, Access::READ | Access::WRITE)?;
                Ok(DrawTarget {
                    size,
                    stride: mapping.stride(),
                    fourcc,
                    pixels: Pixels::Gpu(mapping),
                })
            }
        }
    }

    /// Bind the buffer as a render target texture of `context`
    pub fn lock_framebuffer(&mut self, context: &dyn GpuContext) -> Result<TextureId, GpuError> {
        match &mut self.storage {
            BufferStorage::Gpu(surface) => surface.create_texture(context, 0),
            BufferStorage::Shm(_) => Err(GpuError::NotGpuBacked),
        }
    }

    /// Destroy a buffer no surface shows
    ///
    /// Orphaned buffers may be destroyed; the compositor keeps what it
    /// needs of a destroyed `wl_buffer`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is attached to a live surface.
    pub fn destroy(self) {
        assert!(
            self.is_free() || self.is_orphaned(),
            "buffer {:?} destroyed while attached",
            self.id
        );
        drop(self);
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(
                self.is_free() || self.is_orphaned(),
                "buffer {:?} dropped while attached",
                self.id
            );
        }
        if let Some(proto) = self.proto.take() {
            self.protocol.destroy_buffer(proto);
        }
        debug!("Destroyed buffer {:?}", self.id);
    }
}

#[derive(Debug)]
enum Pixels<'a> {
    Shm(&'a mut [u8]),
    Gpu(PlaneMapping<'a>),
}

/// CPU view of a locked buffer
#[derive(Debug)]
pub struct DrawTarget<'a> {
    size: Size,
    stride: u32,
    fourcc: Fourcc,
    pixels: Pixels<'a>,
}

impl DrawTarget<'_> {
    pub fn size(&self) -> Size {
        self.size
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn fourcc(&self) -> Fourcc {
        self.fourcc
    }

    pub fn pixels(&self) -> &[u8] {
        match &self.pixels {
            Pixels::Shm(data) => data,
            Pixels::Gpu(mapping) => mapping.data(),
        }
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        match &mut self.pixels {
            Pixels::Shm(data) => data,
            Pixels::Gpu(mapping) => mapping.data_mut().unwrap_or_default(),
        }
    }

    /// Fill the whole buffer with a 32-bit pixel value
    pub fn fill(&mut self, pixel: u32) {
        let rect = Rect::from_origin_size(Default::default(), self.size);
        self.fill_rect(rect, pixel);
    }

    /// Fill a rectangle, clipped to the buffer, with a 32-bit pixel value
    pub fn fill_rect(&mut self, rect: Rect, pixel: u32) {
        let bounds = Rect::from_origin_size(Default::default(), self.size);
        let rect = rect.intersect(&bounds);
        if rect.is_empty() || self.fourcc.bytes_per_pixel() != 4 {
            return;
        }
        let stride = self.stride as usize;
        let bytes = pixel.to_le_bytes();
        let data = self.pixels_mut();
        for y in rect.y..rect.bottom() {
            let row = y as usize * stride;
            for x in rect.x..rect.right() {
                let at = row + x as usize * 4;
                if let Some(dst) = data.get_mut(at..at + 4) {
                    dst.copy_from_slice(&bytes);
                }
            }
        }
    }

    /// Read back one 32-bit pixel
    pub fn pixel(&self, x: i32, y: i32) -> Option<u32> {
        if !Rect::from_origin_size(Default::default(), self.size).contains(x, y) {
            return None;
        }
        let at = y as usize * self.stride as usize + x as usize * 4;
        let bytes = self.pixels().get(at..at + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, FailingModifierAllocator, FakeContext};

    #[test]
    fn test_shm_buffer_draw() {
        let (recorder, ctx) = testing::recording_context();
        let mut buffer = BufferObject::create_shm(&ctx, Size::new(16, 8), Fourcc::XRGB8888).unwrap();
        assert_eq!(buffer.kind(), BufferKind::Shm);
        assert!(buffer.proto().is_some());
        assert_eq!(recorder.live_buffers(), 1);

        {
            let mut target = buffer.lock().unwrap();
            assert_eq!(target.stride(), 64);
            target.fill(0xff00_ff00);
            target.fill_rect(Rect::new(2, 2, 4, 4), 0xffff_0000);
            assert_eq!(target.pixel(0, 0), Some(0xff00_ff00));
            assert_eq!(target.pixel(3, 3), Some(0xffff_0000));
            assert_eq!(target.pixel(16, 0), None);
        }

        buffer.destroy();
        assert_eq!(recorder.live_buffers(), 0);
    }

    #[test]
    fn test_borrow_without_proto_returns_none() {
        let (recorder, ctx) = testing::recording_context();
        recorder.fail_next_buffer();
        let buffer = BufferObject::create_shm(&ctx, Size::new(4, 4), Fourcc::ARGB8888).unwrap();
        assert!(buffer.proto().is_none());

        let inbox = SurfaceInbox::new();
        assert_eq!(buffer.borrow(&inbox), None);
        assert!(buffer.is_free());
    }

    #[test]
    fn test_double_release_notifies_once() {
        let (_recorder, ctx) = testing::recording_context();
        let buffer = BufferObject::create_shm(&ctx, Size::new(4, 4), Fourcc::ARGB8888).unwrap();
        let inbox = SurfaceInbox::new();

        assert!(buffer.borrow(&inbox).is_some());
        assert!(!buffer.can_recycle());
        assert!(buffer.on_compositor_release());
        assert!(!buffer.on_compositor_release());
        assert_eq!(inbox.drain().len(), 1);
        assert!(buffer.can_recycle());
    }

    #[test]
    #[should_panic(expected = "destroyed while attached")]
    fn test_destroy_attached_panics() {
        let (_recorder, ctx) = testing::recording_context();
        let buffer = BufferObject::create_shm(&ctx, Size::new(4, 4), Fourcc::ARGB8888).unwrap();
        let inbox = SurfaceInbox::new();
        buffer.borrow(&inbox);
        buffer.destroy();
    }

    #[test]
    fn test_orphaned_buffer_can_be_destroyed() {
        let (recorder, ctx) = testing::recording_context();
        let buffer = BufferObject::create_shm(&ctx, Size::new(4, 4), Fourcc::ARGB8888).unwrap();
        let inbox = SurfaceInbox::new();
        buffer.borrow(&inbox);
        assert!(buffer.release_tracker().orphan(&inbox));

        assert!(buffer.is_orphaned());
        assert!(!buffer.can_recycle());
        buffer.destroy();
        assert_eq!(recorder.live_buffers(), 0);
    }

    #[test]
    fn test_gpu_buffer_falls_back_to_linear() {
        let allocator = Arc::new(FailingModifierAllocator::default());
        let (recorder, ctx) = testing::gpu_context(allocator.clone());
        recorder.advertise_dmabuf(Fourcc::XRGB8888, &[0x0100_0000_0000_0001]);

        let mut buffer = BufferObject::create_gpu(&ctx, Size::new(32, 32), Fourcc::XRGB8888).unwrap();
        assert_eq!(buffer.kind(), BufferKind::Gpu);
        assert_eq!(allocator.modifier_attempts(), 1);
        assert_eq!(allocator.linear_calls(), 1);
        assert_eq!(
            buffer.gpu_surface().map(|s| s.modifier()),
            Some(crate::protocol::DRM_FORMAT_MOD_LINEAR)
        );

        let gl = FakeContext::new(1);
        let texture = buffer.lock_framebuffer(&gl).unwrap();
        assert_eq!(buffer.lock_framebuffer(&gl).unwrap(), texture);
        if let Some(surface) = buffer.gpu_surface_mut() {
            surface.release_textures(&gl);
        }
    }

    #[test]
    fn test_gpu_buffer_without_allocator() {
        let (_recorder, ctx) = testing::recording_context();
        let result = BufferObject::create_gpu(&ctx, Size::new(8, 8), Fourcc::ARGB8888);
        assert!(matches!(result, Err(AllocError::NoAllocator)));
    }

    #[test]
    fn test_globally_referenced_gpu_buffer_is_not_recycled() {
        let allocator = Arc::new(crate::gpu::MemfdAllocator::new());
        let (_recorder, ctx) = testing::gpu_context(allocator);
        let mut buffer = BufferObject::create_gpu(&ctx, Size::new(8, 8), Fourcc::ARGB8888).unwrap();
        buffer
            .gpu_surface_mut()
            .map(|s| s.enable_global_refcount())
            .transpose()
            .unwrap();

        let descriptor = buffer.gpu_surface().map(|s| s.serialize()).transpose().unwrap();
        assert!(!buffer.can_recycle());
        drop(descriptor);
        assert!(buffer.can_recycle());
    }
}
