//! Shared fixtures for unit tests

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rustix::fs::{memfd_create, MemfdFlags};

use crate::config::Config;
use crate::context::DisplayContext;
use crate::geometry::Size;
use crate::gpu::{
    AllocError, Allocation, BufferAllocator, BufferUsage, ContextId, GpuContext, GpuError,
    GpuSurface, MemfdAllocator, TextureId,
};
use crate::protocol::{Fourcc, RecordingProtocol, DRM_FORMAT_MOD_LINEAR};

/// Context over a fresh recording protocol, shm only
pub fn recording_context() -> (Arc<RecordingProtocol>, Arc<DisplayContext>) {
    let recorder = Arc::new(RecordingProtocol::new());
    recorder.advertise_shm(Fourcc::ARGB8888);
    recorder.advertise_shm(Fourcc::XRGB8888);
    let ctx = DisplayContext::init(recorder.clone(), None, Config::default());
    (recorder, ctx)
}

/// Context over a fresh recording protocol with a GPU allocator
pub fn gpu_context<A: BufferAllocator + 'static>(
    allocator: Arc<A>,
) -> (Arc<RecordingProtocol>, Arc<DisplayContext>) {
    let recorder = Arc::new(RecordingProtocol::new());
    recorder.advertise_shm(Fourcc::ARGB8888);
    recorder.advertise_shm(Fourcc::XRGB8888);
    recorder.advertise_dmabuf(Fourcc::ARGB8888, &[DRM_FORMAT_MOD_LINEAR]);
    recorder.advertise_dmabuf(Fourcc::XRGB8888, &[DRM_FORMAT_MOD_LINEAR]);
    let ctx = DisplayContext::init(recorder.clone(), Some(allocator), Config::default());
    (recorder, ctx)
}

/// Allocator whose modifier path always fails
#[derive(Debug, Default)]
pub struct FailingModifierAllocator {
    fallback: MemfdAllocator,
    modifier_attempts: AtomicUsize,
    linear_calls: AtomicUsize,
}

impl FailingModifierAllocator {
    pub fn modifier_attempts(&self) -> usize {
        self.modifier_attempts.load(Ordering::SeqCst)
    }

    pub fn linear_calls(&self) -> usize {
        self.linear_calls.load(Ordering::SeqCst)
    }
}

impl BufferAllocator for FailingModifierAllocator {
    fn allocate_with_modifiers(
        &self,
        _size: Size,
        _fourcc: Fourcc,
        modifiers: &[u64],
    ) -> Result<Allocation, AllocError> {
        self.modifier_attempts.fetch_add(1, Ordering::SeqCst);
        Err(AllocError::UnsupportedModifiers(modifiers.to_vec()))
    }

    fn allocate_linear(
        &self,
        size: Size,
        fourcc: Fourcc,
        usage: BufferUsage,
    ) -> Result<Allocation, AllocError> {
        self.linear_calls.fetch_add(1, Ordering::SeqCst);
        self.fallback.allocate_linear(size, fourcc, usage)
    }
}

/// Render context that counts texture and fence operations
#[derive(Debug)]
pub struct FakeContext {
    id: ContextId,
    next_texture: AtomicU32,
    live: Mutex<HashMap<TextureId, (u64, usize)>>,
    imports: AtomicUsize,
    deleted: AtomicUsize,
    waits: AtomicUsize,
}

impl FakeContext {
    pub fn new(id: u64) -> Self {
        Self {
            id: ContextId(id),
            next_texture: AtomicU32::new(1),
            live: Mutex::new(HashMap::new()),
            imports: AtomicUsize::new(0),
            deleted: AtomicUsize::new(0),
            waits: AtomicUsize::new(0),
        }
    }

    pub fn imports(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }

    pub fn live_textures(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl GpuContext for FakeContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn import_plane(&self, surface: &GpuSurface, plane: usize) -> Result<TextureId, GpuError> {
        if plane >= surface.planes().len() {
            return Err(GpuError::InvalidPlane(plane));
        }
        self.imports.fetch_add(1, Ordering::SeqCst);
        let texture = TextureId(self.next_texture.fetch_add(1, Ordering::SeqCst));
        self.live
            .lock()
            .unwrap()
            .insert(texture, (surface.uid(), plane));
        Ok(texture)
    }

    fn delete_texture(&self, texture: TextureId) {
        if self.live.lock().unwrap().remove(&texture).is_some() {
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn create_fence(&self) -> Result<OwnedFd, GpuError> {
        memfd_create("waylayer-test-fence", MemfdFlags::CLOEXEC)
            .map_err(|e| GpuError::Io(e.into()))
    }

    fn wait_fence(&self, _fence: OwnedFd) -> Result<(), GpuError> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
