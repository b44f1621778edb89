//! Wire protocol seam
//!
//! Surfaces, buffers and layers talk to the compositor only through the
//! [`WireProtocol`] trait. Protocol objects are named by opaque [`ProtoId`]s;
//! the implementation maps them to real proxies.
//!
//! - [`wayland::WaylandProtocol`]: `wayland-client` connection to a compositor
//! - [`recording::RecordingProtocol`]: in-memory compositor that records
//!   requests, used for tests and headless runs
//!
//! Request methods that create objects return `None` when the compositor
//! side cannot provide them (missing global, dead connection). Every other
//! request is fire-and-forget, like the protocol itself.

pub mod format;
pub mod recording;
pub mod shm;
pub mod wayland;

use std::fmt;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::ReleaseTracker;
use crate::geometry::{Point, Rect, RectF, Size};
use crate::surface::{FrameTag, SurfaceInbox, WeakInbox};

pub use format::{Fourcc, FormatTable, DRM_FORMAT_MOD_INVALID, DRM_FORMAT_MOD_LINEAR};
pub use recording::RecordingProtocol;
pub use shm::{ShmError, ShmFormat, ShmLayout, ShmRegion};
pub use wayland::{ConnectError, WaylandDispatch, WaylandProtocol, WaylandQueue};

/// Opaque identity of one protocol object
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtoId(pub u64);

impl ProtoId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ProtoId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for ProtoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtoId({})", self.0)
    }
}

/// Buffer transform, values as in `wl_output.transform`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferTransform {
    #[default]
    Normal,
    Flipped180,
}

impl BufferTransform {
    /// Convert to Wayland wl_output::transform value
    pub fn to_wayland(&self) -> u32 {
        match self {
            BufferTransform::Normal => 0,
            BufferTransform::Flipped180 => 6,
        }
    }
}

/// One plane handed to `zwp_linux_buffer_params_v1.add`
#[derive(Debug, Clone, Copy)]
pub struct DmabufPlane<'a> {
    pub fd: BorrowedFd<'a>,
    pub offset: u32,
    pub stride: u32,
    pub modifier: u64,
}

/// Shm buffer creation parameters
#[derive(Debug, Clone, Copy)]
pub struct ShmBufferParams<'a> {
    pub fd: BorrowedFd<'a>,
    pub pool_size: usize,
    pub layout: ShmLayout,
}

/// Client side of the compositor wire protocol
pub trait WireProtocol: Send + Sync + fmt::Debug {
    /// `wl_compositor.create_surface`; surface-level events go to `inbox`
    fn create_surface(&self, inbox: &SurfaceInbox) -> Option<ProtoId>;

    /// `wl_subcompositor.get_subsurface`
    fn create_subsurface(&self, surface: ProtoId, parent: ProtoId) -> Option<ProtoId>;

    fn destroy_subsurface(&self, subsurface: ProtoId);

    fn destroy_surface(&self, surface: ProtoId);

    /// `wl_subsurface.set_position`, in parent surface-local coordinates
    fn set_position(&self, subsurface: ProtoId, position: Point);

    /// `wl_subsurface.place_above`
    fn place_above(&self, subsurface: ProtoId, sibling_surface: ProtoId);

    /// `wl_subsurface.set_desync`
    fn set_desync(&self, subsurface: ProtoId);

    /// `wl_surface.attach`; `None` detaches the current buffer
    fn attach(&self, surface: ProtoId, buffer: Option<ProtoId>);

    fn damage_buffer(&self, surface: ProtoId, rect: Rect);

    fn set_buffer_scale(&self, surface: ProtoId, scale: i32);

    fn set_buffer_transform(&self, surface: ProtoId, transform: BufferTransform);

    /// `wl_surface.set_opaque_region`; `None` clears it
    fn set_opaque_region(&self, surface: ProtoId, region: Option<Rect>);

    /// Empty input region, so input falls through to the parent
    fn set_empty_input_region(&self, surface: ProtoId);

    /// `wl_surface.frame`; the done event is pushed to `inbox`
    fn request_frame(&self, surface: ProtoId, inbox: WeakInbox, tag: FrameTag) -> bool;

    fn commit(&self, surface: ProtoId);

    /// `wp_viewporter.get_viewport`
    fn create_viewport(&self, surface: ProtoId) -> Option<ProtoId>;

    fn set_viewport(&self, viewport: ProtoId, source: Option<RectF>, destination: Option<Size>);

    fn destroy_viewport(&self, viewport: ProtoId);

    /// `wp_fractional_scale_manager_v1.get_fractional_scale`
    fn create_fractional_scale(&self, surface: ProtoId, inbox: &SurfaceInbox) -> Option<ProtoId>;

    fn destroy_fractional_scale(&self, fractional: ProtoId);

    /// Create a `wl_buffer` from shared memory
    fn create_shm_buffer(
        &self,
        params: ShmBufferParams<'_>,
        release: &Arc<ReleaseTracker>,
    ) -> Option<ProtoId>;

    /// Create a `wl_buffer` from dma-buf planes
    fn create_dmabuf_buffer(
        &self,
        planes: &[DmabufPlane<'_>],
        size: Size,
        fourcc: Fourcc,
        release: &Arc<ReleaseTracker>,
    ) -> Option<ProtoId>;

    fn destroy_buffer(&self, buffer: ProtoId);

    /// Formats negotiated with the compositor so far
    fn formats(&self) -> FormatTable;

    /// Whether `wp_viewporter` is available
    fn has_viewporter(&self) -> bool;

    /// Whether `wp_fractional_scale_manager_v1` is available
    fn has_fractional_scale(&self) -> bool;

    /// Send buffered requests, false when the connection is gone
    fn flush(&self) -> bool;
}
