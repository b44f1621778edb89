//! Layer tree: a root surface with ordered child layers
//!
//! A [`Layer`] owns one sub-surface and the buffers drawn for it: the front
//! buffer shown by the compositor, the buffer currently being drawn and a
//! few spares waiting to be recycled. Layers live in the arena of their
//! [`LayerRoot`] and are addressed by [`LayerId`]; they hold no reference
//! back to the root.

mod arena;
mod root;

pub use arena::LayerId;
pub use root::{LayerRoot, MainThreadEvent, RootEvent, RootStats};

use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace, warn};

use crate::buffer::{BufferKind, BufferObject};
use crate::context::DisplayContext;
use crate::geometry::{Point, Rect, RectF, Size, Transform2D};
use crate::gpu::AllocError;
use crate::protocol::{BufferTransform, Fourcc, ProtoId};
use crate::surface::{Scale, SubsurfaceMode, SurfaceHandle, SurfaceNotification, Viewport};

/// Marker used while diffing the layer list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Usage {
    #[default]
    Unused,
    /// In the old list, not seen in the new one yet
    Removed,
    /// In both lists
    Kept,
    /// Only in the new list
    Added,
}

/// Pixel formats negotiated for layers, by buffer kind and opacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerFormats {
    pub shm_opaque: Fourcc,
    pub shm_translucent: Fourcc,
    pub gpu_opaque: Fourcc,
    pub gpu_translucent: Fourcc,
    /// New layers start with GPU buffers
    pub gpu: bool,
}

impl LayerFormats {
    pub fn negotiate(ctx: &DisplayContext) -> Self {
        Self {
            shm_opaque: ctx.negotiate_format(true, false),
            shm_translucent: ctx.negotiate_format(false, false),
            gpu_opaque: ctx.negotiate_format(true, true),
            gpu_translucent: ctx.negotiate_format(false, true),
            gpu: ctx.use_gpu_buffers(),
        }
    }

    fn select(&self, kind: BufferKind, opaque: bool) -> Fourcc {
        match (kind, opaque) {
            (BufferKind::Shm, true) => self.shm_opaque,
            (BufferKind::Shm, false) => self.shm_translucent,
            (BufferKind::Gpu, true) => self.gpu_opaque,
            (BufferKind::Gpu, false) => self.gpu_translucent,
        }
    }
}

/// Where a layer's surface goes, in root surface coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Placement {
    pub position: Point,
    pub size: Size,
    pub scale: Scale,
    pub clip: Option<Rect>,
    pub viewport: Option<Viewport>,
}

/// One child surface of a [`LayerRoot`]
///
/// Geometry (size, position, clip) is in device pixels of the root; buffers
/// are allocated at the layer size.
#[derive(Debug)]
pub struct Layer {
    id: LayerId,
    ctx: Arc<DisplayContext>,
    surface: SurfaceHandle,
    formats: LayerFormats,
    kind: BufferKind,
    size: Size,
    position: Point,
    transform: Transform2D,
    opaque: bool,
    opacity: f32,
    clip: Option<Rect>,
    flipped: bool,
    front: Option<BufferObject>,
    in_progress: Option<BufferObject>,
    spares: Vec<BufferObject>,
    damage: Vec<Rect>,
    /// The front buffer has not been attached to the surface yet
    front_dirty: bool,
    pub(crate) usage: Usage,
    /// In the layer list but not mapped yet
    pub(crate) pending_map: bool,
}

impl Layer {
    pub(crate) fn new(
        id: LayerId,
        ctx: &Arc<DisplayContext>,
        size: Size,
        opaque: bool,
        formats: LayerFormats,
    ) -> Self {
        let kind = if formats.gpu {
            BufferKind::Gpu
        } else {
            BufferKind::Shm
        };
        debug!(
            "Created layer {:?} ({}x{}, opaque {}, {:?})",
            id, size.width, size.height, opaque, kind
        );
        Self {
            id,
            ctx: ctx.clone(),
            surface: SurfaceHandle::new(ctx),
            formats,
            kind,
            size,
            position: Point::ORIGIN,
            transform: Transform2D::IDENTITY,
            opaque,
            opacity: 1.0,
            clip: None,
            flipped: false,
            front: None,
            in_progress: None,
            spares: Vec::new(),
            damage: Vec::new(),
            front_dirty: false,
            usage: Usage::Unused,
            pending_map: false,
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn surface(&self) -> &SurfaceHandle {
        &self.surface
    }

    pub fn is_mapped(&self) -> bool {
        self.surface.lock().is_mapped()
    }

    pub fn size(&self) -> Size {
        self.size
    }

    /// Resize; buffers of the old size are not reused
    pub fn set_size(&mut self, size: Size) {
        if self.size == size {
            return;
        }
        trace!("Layer {:?} resized to {}x{}", self.id, size.width, size.height);
        self.size = size;
        self.in_progress = None;
        self.prune_spares();
    }

    pub fn position(&self) -> Point {
        self.position
    }

    pub fn set_position(&mut self, position: Point) {
        self.position = position;
    }

    pub fn transform(&self) -> Transform2D {
        self.transform
    }

    /// Set the layer transform
    ///
    /// Returns false, keeping the old transform, unless both scales are
    /// finite and positive.
    pub fn set_transform(&mut self, transform: Transform2D) -> bool {
        let valid = [
            transform.scale_x,
            transform.scale_y,
            transform.translate_x,
            transform.translate_y,
        ]
        .iter()
        .all(|v| v.is_finite())
            && transform.scale_x > 0.0
            && transform.scale_y > 0.0;
        if !valid {
            warn!("Rejected transform {:?} for layer {:?}", transform, self.id);
            return false;
        }
        self.transform = transform;
        true
    }

    /// Set the transform from an affine matrix `[a b c d tx ty]`
    ///
    /// Returns false for rotations, shears and flips.
    pub fn set_transform_matrix(&mut self, matrix: [f64; 6]) -> bool {
        match Transform2D::from_matrix(matrix) {
            Some(transform) => self.set_transform(transform),
            None => {
                warn!("Layer {:?} transform is not rectilinear", self.id);
                false
            }
        }
    }

    pub fn is_opaque(&self) -> bool {
        self.opaque
    }

    /// Changing opacity switches the pixel format of new buffers
    pub fn set_opaque(&mut self, opaque: bool) {
        if self.opaque != opaque {
            self.opaque = opaque;
            self.in_progress = None;
            self.prune_spares();
        }
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    /// Layer opacity; a fully transparent layer is not shown at all
    pub fn set_opacity(&mut self, opacity: f32) {
        self.opacity = if opacity.is_nan() {
            1.0
        } else {
            opacity.clamp(0.0, 1.0)
        };
    }

    pub fn clip(&self) -> Option<Rect> {
        self.clip
    }

    /// Clip rect in root device pixels
    pub fn set_clip(&mut self, clip: Option<Rect>) {
        self.clip = clip;
    }

    pub fn is_flipped(&self) -> bool {
        self.flipped
    }

    /// Content is stored bottom-up, as GL renders it
    pub fn set_flipped(&mut self, flipped: bool) {
        self.flipped = flipped;
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Pixel format of new buffers
    pub fn fourcc(&self) -> Fourcc {
        self.formats.select(self.kind, self.opaque)
    }

    pub fn front(&self) -> Option<&BufferObject> {
        self.front.as_ref()
    }

    pub fn has_in_progress(&self) -> bool {
        self.in_progress.is_some()
    }

    pub fn spare_count(&self) -> usize {
        self.spares.len()
    }

    /// Limit damage of the next front buffer to `rect`, in buffer pixels
    pub fn add_damage(&mut self, rect: Rect) {
        self.damage.push(rect);
    }

    /// Buffer to draw the next frame into
    ///
    /// Reuses the buffer already being drawn, else a released spare, else
    /// allocates one. GPU allocation failures degrade the layer to shared
    /// memory.
    pub fn next_buffer(&mut self) -> Result<&mut BufferObject, AllocError> {
        let buffer = match self.in_progress.take() {
            Some(buffer) => buffer,
            None => match self.take_spare() {
                Some(buffer) => buffer,
                None => self.allocate()?,
            },
        };
        Ok(self.in_progress.insert(buffer))
    }

    fn take_spare(&mut self) -> Option<BufferObject> {
        let size = self.size;
        let fourcc = self.fourcc();
        let index = self
            .spares
            .iter()
            .position(|b| b.size() == size && b.fourcc() == fourcc && b.can_recycle())?;
        let buffer = self.spares.swap_remove(index);
        trace!("Layer {:?} recycles buffer {:?}", self.id, buffer.id());
        Some(buffer)
    }

    fn allocate(&mut self) -> Result<BufferObject, AllocError> {
        if self.kind == BufferKind::Gpu {
            match BufferObject::create_gpu(&self.ctx, self.size, self.fourcc()) {
                Ok(buffer) => return Ok(buffer),
                Err(e) => {
                    warn!(
                        "GPU buffer for layer {:?} failed ({}), using shared memory",
                        self.id, e
                    );
                    self.kind = BufferKind::Shm;
                    self.prune_spares();
                }
            }
        }
        BufferObject::create_shm(&self.ctx, self.size, self.fourcc())
    }

    /// Promote the buffer being drawn to front
    ///
    /// The previous front becomes a spare. Returns false when nothing was
    /// being drawn.
    pub fn notify_draw_complete(&mut self) -> bool {
        let Some(buffer) = self.in_progress.take() else {
            return false;
        };
        trace!("Layer {:?} front is now {:?}", self.id, buffer.id());
        if let Some(previous) = self.front.replace(buffer) {
            self.spares.push(previous);
        }
        self.front_dirty = true;
        self.prune_spares();
        true
    }

    /// Drop spares that can never be reused, keeping buffers the compositor
    /// still holds
    pub(crate) fn prune_spares(&mut self) {
        let max = self.ctx.config().max_spare_buffers;
        let size = self.size;
        let fourcc = self.fourcc();
        let mut kept = 0;
        self.spares.retain(|buffer| {
            if buffer.is_attached() {
                return true;
            }
            let keep = buffer.size() == size && buffer.fourcc() == fourcc && kept < max;
            if keep {
                kept += 1;
            }
            keep
        });
    }

    /// Where the surface goes for a root at `scale`, `None` when nothing
    /// would be visible
    pub(crate) fn placement(&self, scale: Scale) -> Option<Placement> {
        if self.size.is_empty() || self.opacity <= 0.0 {
            return None;
        }
        let factor = scale.factor();
        let bounds = self
            .transform
            .map_rect(Rect::from_origin_size(self.position, self.size));
        let visible = match self.clip {
            Some(clip) => clip.intersect(&bounds),
            None => bounds,
        };
        if visible.is_empty() {
            return None;
        }

        let down = |v: i32| (v as f64 / factor).floor() as i32;
        let up = |v: i32| (v as f64 / factor).ceil() as i32;

        if self.transform.scale_x == 1.0 && self.transform.scale_y == 1.0 {
            let surface_scale = match scale {
                Scale::Ceiled(n) if self.size.width % n == 0 && self.size.height % n == 0 => scale,
                _ => Scale::Fractional(factor),
            };
            let clip = (visible != bounds).then(|| {
                let local = visible.translate(-bounds.x, -bounds.y);
                Rect::new(down(local.x), down(local.y), up(local.width), up(local.height))
            });
            Some(Placement {
                position: Point::new(down(bounds.x), down(bounds.y)),
                size: Size::new(up(bounds.width), up(bounds.height)),
                scale: surface_scale,
                clip,
                viewport: None,
            })
        } else {
            // Scaled layers crop and stretch through the viewport directly
            let sx = self.transform.scale_x;
            let sy = self.transform.scale_y;
            let source = RectF::new(
                (visible.x - bounds.x) as f64 / sx,
                (visible.y - bounds.y) as f64 / sy,
                visible.width as f64 / sx,
                visible.height as f64 / sy,
            );
            let destination = Size::new(up(visible.width), up(visible.height));
            Some(Placement {
                position: Point::new(down(visible.x), down(visible.y)),
                size: destination,
                scale: Scale::Ceiled(1),
                clip: None,
                viewport: Some(Viewport {
                    source: Some(source),
                    destination: Some(destination),
                }),
            })
        }
    }

    pub(crate) fn map(&mut self, parent: ProtoId, position: Point) -> bool {
        if !self.surface.lock().map(parent, position, SubsurfaceMode::Sync) {
            return false;
        }
        self.front_dirty = self.front.is_some();
        true
    }

    /// Unmap the surface, returns whether it was mapped
    pub(crate) fn unmap(&mut self) -> bool {
        let mut lock = self.surface.lock();
        let was_mapped = lock.proto().is_some();
        lock.unmap();
        drop(lock);
        // Re-attached when mapped again
        self.front_dirty = self.front.is_some();
        was_mapped
    }

    /// Push placement and the front buffer to the surface
    ///
    /// The surface is a synchronized sub-surface, so nothing shows until the
    /// root commits.
    pub(crate) fn apply(&mut self, placement: &Placement) {
        let mut lock = self.surface.lock();
        if !lock.is_mapped() {
            return;
        }
        lock.move_to(placement.position);
        lock.resize(placement.size);
        lock.set_scale(placement.scale);
        lock.set_clip(placement.clip);
        lock.set_viewport(placement.viewport);
        lock.set_opaque(self.opaque && self.opacity >= 1.0);
        lock.set_transform(if self.flipped {
            BufferTransform::Flipped180
        } else {
            BufferTransform::Normal
        });

        if !self.front_dirty {
            return;
        }
        match &self.front {
            // Shown by an earlier mapping and not released yet
            Some(front) if front.is_attached() => {
                trace!(
                    "Layer {:?} front {:?} still held, attaching once released",
                    self.id,
                    front.id()
                );
            }
            Some(front) => {
                self.front_dirty = false;
                for rect in self.damage.drain(..) {
                    lock.add_damage(rect);
                }
                if !lock.attach(front) {
                    warn!("Layer {:?} could not attach {:?}", self.id, front.id());
                }
            }
            None => self.front_dirty = false,
        }
    }

    /// Handle surface events, returns how many buffers were released
    pub(crate) fn dispatch_events(&mut self, now: Instant) -> usize {
        let mut released = 0;
        for notification in self.surface.lock().dispatch_events_at(now) {
            match notification {
                SurfaceNotification::BufferReleased(buffer) => {
                    trace!("Layer {:?} buffer {:?} released", self.id, buffer);
                    released += 1;
                }
                SurfaceNotification::ParentReady => {
                    trace!("Layer {:?} ready", self.id);
                }
                SurfaceNotification::Frame { .. } | SurfaceNotification::ScaleChanged(_) => {}
            }
        }
        if released > 0 {
            self.prune_spares();
        }
        released
    }
}

impl Drop for Layer {
    fn drop(&mut self) {
        // Buffers the compositor still holds are orphaned before they drop
        self.surface.lock().unmap();
        debug!("Destroyed layer {:?}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn layer(ctx: &Arc<DisplayContext>, size: Size) -> Layer {
        let mut arena = arena::LayerArena::new();
        let formats = LayerFormats::negotiate(ctx);
        let id = arena.insert_with(|id| id);
        Layer::new(id, ctx, size, true, formats)
    }

    #[test]
    fn test_next_buffer_reuses_in_progress() {
        let (_recorder, ctx) = testing::recording_context();
        let mut layer = layer(&ctx, Size::new(16, 16));
        let first = layer.next_buffer().unwrap().id();
        let again = layer.next_buffer().unwrap().id();
        assert_eq!(first, again);

        assert!(layer.notify_draw_complete());
        assert!(!layer.notify_draw_complete());
        assert_eq!(layer.front().map(|b| b.id()), Some(first));
    }

    #[test]
    fn test_free_spare_is_recycled() {
        let (_recorder, ctx) = testing::recording_context();
        let mut layer = layer(&ctx, Size::new(16, 16));
        let a = layer.next_buffer().unwrap().id();
        layer.notify_draw_complete();
        let b = layer.next_buffer().unwrap().id();
        assert_ne!(a, b);
        layer.notify_draw_complete();

        // Never attached, so the old front is free right away
        assert_eq!(layer.spare_count(), 1);
        assert_eq!(layer.next_buffer().unwrap().id(), a);
    }

    #[test]
    fn test_resize_drops_spares() {
        let (_recorder, ctx) = testing::recording_context();
        let mut layer = layer(&ctx, Size::new(16, 16));
        layer.next_buffer().unwrap();
        layer.notify_draw_complete();
        layer.next_buffer().unwrap();
        layer.notify_draw_complete();
        assert_eq!(layer.spare_count(), 1);

        layer.set_size(Size::new(32, 16));
        assert_eq!(layer.spare_count(), 0);
        assert_eq!(layer.next_buffer().unwrap().size(), Size::new(32, 16));
    }

    #[test]
    fn test_opacity_switches_format() {
        let (_recorder, ctx) = testing::recording_context();
        let mut layer = layer(&ctx, Size::new(8, 8));
        assert_eq!(layer.fourcc(), Fourcc::XRGB8888);
        layer.set_opaque(false);
        assert_eq!(layer.fourcc(), Fourcc::ARGB8888);
        assert_eq!(layer.next_buffer().unwrap().fourcc(), Fourcc::ARGB8888);
    }

    #[test]
    fn test_transform_validation() {
        let (_recorder, ctx) = testing::recording_context();
        let mut layer = layer(&ctx, Size::new(8, 8));
        assert!(!layer.set_transform_matrix([0.0, 1.0, -1.0, 0.0, 0.0, 0.0]));
        assert!(!layer.set_transform(Transform2D::scale(f64::NAN, 1.0)));
        assert!(layer.transform().is_identity());
        assert!(layer.set_transform_matrix([2.0, 0.0, 0.0, 2.0, 4.0, 4.0]));
        assert_eq!(layer.transform().scale_x, 2.0);
    }

    #[test]
    fn test_placement_with_clip_and_scale() {
        let (_recorder, ctx) = testing::recording_context();
        let mut layer = layer(&ctx, Size::new(64, 64));
        layer.set_position(Point::new(20, 20));
        layer.set_clip(Some(Rect::new(0, 0, 52, 52)));

        let placement = layer.placement(Scale::Ceiled(2)).unwrap();
        assert_eq!(placement.position, Point::new(10, 10));
        assert_eq!(placement.size, Size::new(32, 32));
        assert_eq!(placement.scale, Scale::Ceiled(2));
        assert_eq!(placement.clip, Some(Rect::new(0, 0, 16, 16)));

        layer.set_clip(Some(Rect::new(200, 200, 10, 10)));
        assert!(layer.placement(Scale::Ceiled(1)).is_none());
        layer.set_clip(None);
        layer.set_opacity(0.0);
        assert!(layer.placement(Scale::Ceiled(1)).is_none());
    }

    #[test]
    fn test_placement_of_scaled_layer() {
        let (_recorder, ctx) = testing::recording_context();
        let mut layer = layer(&ctx, Size::new(50, 20));
        assert!(layer.set_transform(Transform2D::scale(2.0, 2.0)));

        let placement = layer.placement(Scale::Ceiled(1)).unwrap();
        assert_eq!(placement.size, Size::new(100, 40));
        assert_eq!(
            placement.viewport,
            Some(Viewport {
                source: Some(RectF::new(0.0, 0.0, 50.0, 20.0)),
                destination: Some(Size::new(100, 40)),
            })
        );
    }

    #[test]
    fn test_gpu_layer_allocates_dmabuf() {
        let allocator = Arc::new(crate::gpu::MemfdAllocator::new());
        let (recorder, ctx) = testing::gpu_context(allocator);
        let mut layer = layer(&ctx, Size::new(16, 16));
        assert_eq!(layer.kind(), BufferKind::Gpu);
        let buffer = layer.next_buffer().unwrap();
        assert_eq!(buffer.kind(), BufferKind::Gpu);
        assert_eq!(recorder.live_buffers(), 1);
    }
}
