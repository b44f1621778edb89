//! Render backend hooks used by GPU surfaces
//!
//! Texture import and fences are the render backend's business (EGL/GL or
//! Vulkan). Surfaces only need the narrow interface below.

use std::fmt;
use std::os::fd::OwnedFd;

use super::{GpuError, GpuSurface};

/// Identity of a rendering context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

/// Backend texture name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

/// Rendering context able to import dma-buf planes and handle fences
pub trait GpuContext: fmt::Debug {
    fn id(&self) -> ContextId;

    /// Import one plane of a surface as a texture
    fn import_plane(&self, surface: &GpuSurface, plane: usize) -> Result<TextureId, GpuError>;

    fn delete_texture(&self, texture: TextureId);

    /// Insert a fence after the work submitted so far and export it as a
    /// sync file
    fn create_fence(&self) -> Result<OwnedFd, GpuError>;

    /// Make the GPU wait on an exported fence
    fn wait_fence(&self, fence: OwnedFd) -> Result<(), GpuError>;
}
