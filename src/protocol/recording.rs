//! In-memory compositor
//!
//! Implements [`WireProtocol`] without a connection: every request is logged
//! and applied to a small model of the compositor's object state. Frame
//! callbacks and buffer releases are delivered when the caller asks for them,
//! which makes interleavings reproducible in tests and headless runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};

use super::{
    BufferTransform, DmabufPlane, Fourcc, FormatTable, ProtoId, ShmBufferParams, WireProtocol,
};
use crate::buffer::ReleaseTracker;
use crate::geometry::{Point, Rect, RectF, Size};
use crate::surface::{FrameTag, SurfaceEvent, SurfaceInbox, WeakInbox};

/// One request as sent by the client
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    CreateSurface(ProtoId),
    CreateSubsurface {
        subsurface: ProtoId,
        surface: ProtoId,
        parent: ProtoId,
    },
    DestroySubsurface(ProtoId),
    DestroySurface(ProtoId),
    SetPosition(ProtoId, Point),
    PlaceAbove {
        subsurface: ProtoId,
        sibling: ProtoId,
    },
    SetDesync(ProtoId),
    Attach {
        surface: ProtoId,
        buffer: Option<ProtoId>,
    },
    DamageBuffer(ProtoId, Rect),
    SetBufferScale(ProtoId, i32),
    SetBufferTransform(ProtoId, BufferTransform),
    SetOpaqueRegion(ProtoId, Option<Rect>),
    SetEmptyInputRegion(ProtoId),
    Frame {
        surface: ProtoId,
        tag: FrameTag,
    },
    Commit(ProtoId),
    CreateViewport {
        viewport: ProtoId,
        surface: ProtoId,
    },
    SetViewport {
        viewport: ProtoId,
        source: Option<RectF>,
        destination: Option<Size>,
    },
    DestroyViewport(ProtoId),
    CreateFractionalScale {
        fractional: ProtoId,
        surface: ProtoId,
    },
    DestroyFractionalScale(ProtoId),
    CreateBuffer {
        buffer: ProtoId,
        size: Size,
        fourcc: Fourcc,
        dmabuf: bool,
    },
    DestroyBuffer(ProtoId),
}

#[derive(Debug, Default)]
struct RecordedSurface {
    inbox: WeakInbox,
    /// Created by the application outside this protocol (toplevel)
    external: bool,
    pending_buffer: Option<Option<ProtoId>>,
    buffer: Option<ProtoId>,
    commits: u64,
    frame_callbacks: Vec<(WeakInbox, FrameTag)>,
    /// Child surfaces, bottom to top
    children: Vec<ProtoId>,
    fractional: Option<ProtoId>,
}

#[derive(Debug)]
struct RecordedSubsurface {
    surface: ProtoId,
    parent: ProtoId,
    position: Point,
    desync: bool,
}

#[derive(Debug)]
struct RecordedViewport {
    surface: ProtoId,
    source: Option<RectF>,
    destination: Option<Size>,
}

#[derive(Debug)]
struct RecordedBuffer {
    release: Arc<ReleaseTracker>,
}

#[derive(Debug)]
struct Inner {
    surfaces: HashMap<ProtoId, RecordedSurface>,
    subsurfaces: HashMap<ProtoId, RecordedSubsurface>,
    viewports: HashMap<ProtoId, RecordedViewport>,
    fractional: HashMap<ProtoId, ProtoId>,
    buffers: HashMap<ProtoId, RecordedBuffer>,
    requests: Vec<Request>,
    formats: FormatTable,
    fail_surfaces: usize,
    fail_subsurfaces: usize,
    fail_buffers: usize,
    viewporter: bool,
    fractional_scale: bool,
    auto_release: bool,
    frame_time: u32,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            surfaces: HashMap::new(),
            subsurfaces: HashMap::new(),
            viewports: HashMap::new(),
            fractional: HashMap::new(),
            buffers: HashMap::new(),
            requests: Vec::new(),
            formats: FormatTable::new(),
            fail_surfaces: 0,
            fail_subsurfaces: 0,
            fail_buffers: 0,
            viewporter: true,
            fractional_scale: true,
            auto_release: true,
            frame_time: 0,
        }
    }
}

impl Inner {
    fn record(&mut self, request: Request) {
        trace!("Recorded {:?}", request);
        self.requests.push(request);
    }

    fn unlink_child(&mut self, parent: ProtoId, child: ProtoId) {
        if let Some(parent) = self.surfaces.get_mut(&parent) {
            parent.children.retain(|c| *c != child);
        }
    }

    fn release(&self, buffer: ProtoId) -> bool {
        match self.buffers.get(&buffer) {
            Some(recorded) => {
                recorded.release.on_compositor_release();
                true
            }
            None => false,
        }
    }
}

/// Recording in-memory implementation of [`WireProtocol`]
#[derive(Debug, Default)]
pub struct RecordingProtocol {
    inner: Mutex<Inner>,
}

impl RecordingProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create an application-owned surface to parent layers to
    ///
    /// It is not counted as a live object of this protocol.
    pub fn create_toplevel(&self) -> ProtoId {
        let id = ProtoId::next();
        self.lock().surfaces.insert(
            id,
            RecordedSurface {
                external: true,
                ..Default::default()
            },
        );
        debug!("Created toplevel {:?}", id);
        id
    }

    /// Advertise a `wl_shm` format
    pub fn advertise_shm(&self, fourcc: Fourcc) {
        let wl_format = super::ShmFormat::from_fourcc(fourcc).to_wayland();
        self.lock().formats.add_shm(wl_format);
    }

    /// Advertise dma-buf modifiers for a format
    pub fn advertise_dmabuf(&self, fourcc: Fourcc, modifiers: &[u64]) {
        let mut inner = self.lock();
        for modifier in modifiers {
            inner.formats.add_dmabuf(fourcc, *modifier);
        }
    }

    pub fn set_viewporter(&self, available: bool) {
        self.lock().viewporter = available;
    }

    pub fn set_fractional_scale(&self, available: bool) {
        self.lock().fractional_scale = available;
    }

    /// Release the previous buffer whenever a surface commits a new one,
    /// and the shown one when a surface is destroyed
    ///
    /// When disabled, buffers are only released by
    /// [`release_buffer`](Self::release_buffer).
    pub fn set_auto_release(&self, enabled: bool) {
        self.lock().auto_release = enabled;
    }

    /// Refuse the next surface creation
    pub fn fail_next_surface(&self) {
        self.lock().fail_surfaces += 1;
    }

    pub fn fail_next_subsurface(&self) {
        self.lock().fail_subsurfaces += 1;
    }

    pub fn fail_next_buffer(&self) {
        self.lock().fail_buffers += 1;
    }

    /// Fire every frame callback registered on `surface`
    ///
    /// Returns how many callbacks fired.
    pub fn fire_frame(&self, surface: ProtoId) -> usize {
        let mut inner = self.lock();
        inner.frame_time = inner.frame_time.wrapping_add(16);
        let time = inner.frame_time;
        let Some(recorded) = inner.surfaces.get_mut(&surface) else {
            return 0;
        };
        let callbacks = std::mem::take(&mut recorded.frame_callbacks);
        for (inbox, tag) in &callbacks {
            inbox.push(SurfaceEvent::FrameDone { tag: *tag, time });
        }
        callbacks.len()
    }

    /// Send `wl_buffer.release`; false for unknown buffers
    pub fn release_buffer(&self, buffer: ProtoId) -> bool {
        self.lock().release(buffer)
    }

    /// Send `wl_surface.preferred_buffer_scale`
    pub fn send_preferred_scale(&self, surface: ProtoId, scale: i32) -> bool {
        let inner = self.lock();
        match inner.surfaces.get(&surface) {
            Some(recorded) => recorded.inbox.push(SurfaceEvent::PreferredScale(scale)),
            None => false,
        }
    }

    /// Send `wp_fractional_scale_v1.preferred_scale`, in 120ths
    pub fn send_fractional_scale(&self, surface: ProtoId, scale: u32) -> bool {
        let inner = self.lock();
        match inner.surfaces.get(&surface) {
            Some(recorded) if recorded.fractional.is_some() => {
                recorded.inbox.push(SurfaceEvent::PreferredFractionalScale(scale))
            }
            _ => false,
        }
    }

    /// Every request sent so far
    pub fn requests(&self) -> Vec<Request> {
        self.lock().requests.clone()
    }

    /// Number of requests sent so far
    pub fn mutation_count(&self) -> usize {
        self.lock().requests.len()
    }

    /// Protocol objects created through this protocol and not destroyed
    pub fn live_objects(&self) -> usize {
        let inner = self.lock();
        inner.surfaces.values().filter(|s| !s.external).count()
            + inner.subsurfaces.len()
            + inner.viewports.len()
            + inner.fractional.len()
            + inner.buffers.len()
    }

    pub fn live_surfaces(&self) -> usize {
        self.lock().surfaces.values().filter(|s| !s.external).count()
    }

    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn commit_count(&self, surface: ProtoId) -> u64 {
        self.lock()
            .surfaces
            .get(&surface)
            .map(|s| s.commits)
            .unwrap_or_default()
    }

    /// Buffer shown by `surface` after its last commit
    pub fn attached_buffer(&self, surface: ProtoId) -> Option<ProtoId> {
        self.lock().surfaces.get(&surface).and_then(|s| s.buffer)
    }

    pub fn position(&self, subsurface: ProtoId) -> Option<Point> {
        self.lock().subsurfaces.get(&subsurface).map(|s| s.position)
    }

    pub fn is_desync(&self, subsurface: ProtoId) -> bool {
        self.lock()
            .subsurfaces
            .get(&subsurface)
            .is_some_and(|s| s.desync)
    }

    /// Viewport source and destination of `surface`
    pub fn viewport_of(&self, surface: ProtoId) -> Option<(Option<RectF>, Option<Size>)> {
        self.lock()
            .viewports
            .values()
            .find(|v| v.surface == surface)
            .map(|v| (v.source, v.destination))
    }

    /// Child surfaces of `parent`, bottom to top
    pub fn stacking(&self, parent: ProtoId) -> Vec<ProtoId> {
        self.lock()
            .surfaces
            .get(&parent)
            .map(|s| s.children.clone())
            .unwrap_or_default()
    }
}

impl WireProtocol for RecordingProtocol {
    fn create_surface(&self, inbox: &SurfaceInbox) -> Option<ProtoId> {
        let mut inner = self.lock();
        if inner.fail_surfaces > 0 {
            inner.fail_surfaces -= 1;
            debug!("Refusing surface creation");
            return None;
        }
        let id = ProtoId::next();
        inner.surfaces.insert(
            id,
            RecordedSurface {
                inbox: inbox.downgrade(),
                ..Default::default()
            },
        );
        inner.record(Request::CreateSurface(id));
        Some(id)
    }

    fn create_subsurface(&self, surface: ProtoId, parent: ProtoId) -> Option<ProtoId> {
        let mut inner = self.lock();
        if inner.fail_subsurfaces > 0 {
            inner.fail_subsurfaces -= 1;
            debug!("Refusing subsurface creation");
            return None;
        }
        if !inner.surfaces.contains_key(&surface) || !inner.surfaces.contains_key(&parent) {
            return None;
        }
        let id = ProtoId::next();
        inner.subsurfaces.insert(
            id,
            RecordedSubsurface {
                surface,
                parent,
                position: Point::ORIGIN,
                desync: false,
            },
        );
        if let Some(parent) = inner.surfaces.get_mut(&parent) {
            parent.children.push(surface);
        }
        inner.record(Request::CreateSubsurface {
            subsurface: id,
            surface,
            parent,
        });
        Some(id)
    }

    fn destroy_subsurface(&self, subsurface: ProtoId) {
        let mut inner = self.lock();
        if let Some(recorded) = inner.subsurfaces.remove(&subsurface) {
            inner.unlink_child(recorded.parent, recorded.surface);
        }
        inner.record(Request::DestroySubsurface(subsurface));
    }

    fn destroy_surface(&self, surface: ProtoId) {
        let mut inner = self.lock();
        if let Some(recorded) = inner.surfaces.remove(&surface) {
            // The compositor lets go of whatever the surface showed
            if let Some(buffer) = recorded.buffer.filter(|_| inner.auto_release) {
                inner.release(buffer);
            }
        }
        inner.record(Request::DestroySurface(surface));
    }

    fn set_position(&self, subsurface: ProtoId, position: Point) {
        let mut inner = self.lock();
        if let Some(recorded) = inner.subsurfaces.get_mut(&subsurface) {
            recorded.position = position;
        }
        inner.record(Request::SetPosition(subsurface, position));
    }

    fn place_above(&self, subsurface: ProtoId, sibling_surface: ProtoId) {
        let mut inner = self.lock();
        if let Some((surface, parent)) = inner
            .subsurfaces
            .get(&subsurface)
            .map(|s| (s.surface, s.parent))
        {
            if let Some(parent_surface) = inner.surfaces.get_mut(&parent) {
                parent_surface.children.retain(|c| *c != surface);
                let index = if sibling_surface == parent {
                    0
                } else {
                    parent_surface
                        .children
                        .iter()
                        .position(|c| *c == sibling_surface)
                        .map_or(parent_surface.children.len(), |i| i + 1)
                };
                parent_surface.children.insert(index, surface);
            }
        }
        inner.record(Request::PlaceAbove {
            subsurface,
            sibling: sibling_surface,
        });
    }

    fn set_desync(&self, subsurface: ProtoId) {
        let mut inner = self.lock();
        if let Some(recorded) = inner.subsurfaces.get_mut(&subsurface) {
            recorded.desync = true;
        }
        inner.record(Request::SetDesync(subsurface));
    }

    fn attach(&self, surface: ProtoId, buffer: Option<ProtoId>) {
        let mut inner = self.lock();
        if let Some(recorded) = inner.surfaces.get_mut(&surface) {
            recorded.pending_buffer = Some(buffer);
        }
        inner.record(Request::Attach { surface, buffer });
    }

    fn damage_buffer(&self, surface: ProtoId, rect: Rect) {
        self.lock().record(Request::DamageBuffer(surface, rect));
    }

    fn set_buffer_scale(&self, surface: ProtoId, scale: i32) {
        self.lock().record(Request::SetBufferScale(surface, scale));
    }

    fn set_buffer_transform(&self, surface: ProtoId, transform: BufferTransform) {
        self.lock()
            .record(Request::SetBufferTransform(surface, transform));
    }

    fn set_opaque_region(&self, surface: ProtoId, region: Option<Rect>) {
        self.lock().record(Request::SetOpaqueRegion(surface, region));
    }

    fn set_empty_input_region(&self, surface: ProtoId) {
        self.lock().record(Request::SetEmptyInputRegion(surface));
    }

    fn request_frame(&self, surface: ProtoId, inbox: WeakInbox, tag: FrameTag) -> bool {
        let mut inner = self.lock();
        let Some(recorded) = inner.surfaces.get_mut(&surface) else {
            return false;
        };
        recorded.frame_callbacks.push((inbox, tag));
        inner.record(Request::Frame { surface, tag });
        true
    }

    fn commit(&self, surface: ProtoId) {
        let mut inner = self.lock();
        let mut released = None;
        let auto_release = inner.auto_release;
        if let Some(recorded) = inner.surfaces.get_mut(&surface) {
            recorded.commits += 1;
            if let Some(buffer) = recorded.pending_buffer.take() {
                let previous = std::mem::replace(&mut recorded.buffer, buffer);
                if auto_release && previous != buffer {
                    released = previous;
                }
            }
        }
        if let Some(previous) = released {
            inner.release(previous);
        }
        inner.record(Request::Commit(surface));
    }

    fn create_viewport(&self, surface: ProtoId) -> Option<ProtoId> {
        let mut inner = self.lock();
        if !inner.viewporter || !inner.surfaces.contains_key(&surface) {
            return None;
        }
        let id = ProtoId::next();
        inner.viewports.insert(
            id,
            RecordedViewport {
                surface,
                source: None,
                destination: None,
            },
        );
        inner.record(Request::CreateViewport {
            viewport: id,
            surface,
        });
        Some(id)
    }

    fn set_viewport(&self, viewport: ProtoId, source: Option<RectF>, destination: Option<Size>) {
        let mut inner = self.lock();
        if let Some(recorded) = inner.viewports.get_mut(&viewport) {
            recorded.source = source;
            recorded.destination = destination;
        }
        inner.record(Request::SetViewport {
            viewport,
            source,
            destination,
        });
    }

    fn destroy_viewport(&self, viewport: ProtoId) {
        let mut inner = self.lock();
        inner.viewports.remove(&viewport);
        inner.record(Request::DestroyViewport(viewport));
    }

    fn create_fractional_scale(&self, surface: ProtoId, _inbox: &SurfaceInbox) -> Option<ProtoId> {
        let mut inner = self.lock();
        if !inner.fractional_scale {
            return None;
        }
        let id = ProtoId::next();
        let recorded = inner.surfaces.get_mut(&surface)?;
        recorded.fractional = Some(id);
        inner.fractional.insert(id, surface);
        inner.record(Request::CreateFractionalScale {
            fractional: id,
            surface,
        });
        Some(id)
    }

    fn destroy_fractional_scale(&self, fractional: ProtoId) {
        let mut inner = self.lock();
        if let Some(surface) = inner.fractional.remove(&fractional) {
            if let Some(recorded) = inner.surfaces.get_mut(&surface) {
                recorded.fractional = None;
            }
        }
        inner.record(Request::DestroyFractionalScale(fractional));
    }

    fn create_shm_buffer(
        &self,
        params: ShmBufferParams<'_>,
        release: &Arc<ReleaseTracker>,
    ) -> Option<ProtoId> {
        let mut inner = self.lock();
        if inner.fail_buffers > 0 {
            inner.fail_buffers -= 1;
            debug!("Refusing shm buffer");
            return None;
        }
        if let Err(e) = params.layout.validate(params.pool_size) {
            debug!("Refusing shm buffer: {}", e);
            return None;
        }
        let id = ProtoId::next();
        inner.buffers.insert(
            id,
            RecordedBuffer {
                release: release.clone(),
            },
        );
        inner.record(Request::CreateBuffer {
            buffer: id,
            size: params.layout.size,
            fourcc: params.layout.format.fourcc(),
            dmabuf: false,
        });
        Some(id)
    }

    fn create_dmabuf_buffer(
        &self,
        planes: &[DmabufPlane<'_>],
        size: Size,
        fourcc: Fourcc,
        release: &Arc<ReleaseTracker>,
    ) -> Option<ProtoId> {
        let mut inner = self.lock();
        if inner.fail_buffers > 0 {
            inner.fail_buffers -= 1;
            debug!("Refusing dma-buf buffer");
            return None;
        }
        if planes.is_empty() || size.is_empty() {
            return None;
        }
        let id = ProtoId::next();
        inner.buffers.insert(
            id,
            RecordedBuffer {
                release: release.clone(),
            },
        );
        inner.record(Request::CreateBuffer {
            buffer: id,
            size,
            fourcc,
            dmabuf: true,
        });
        Some(id)
    }

    fn destroy_buffer(&self, buffer: ProtoId) {
        let mut inner = self.lock();
        inner.buffers.remove(&buffer);
        inner.record(Request::DestroyBuffer(buffer));
    }

    fn formats(&self) -> FormatTable {
        self.lock().formats.clone()
    }

    fn has_viewporter(&self) -> bool {
        self.lock().viewporter
    }

    fn has_fractional_scale(&self) -> bool {
        self.lock().fractional_scale
    }

    fn flush(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stacking_follows_place_above() {
        let protocol = RecordingProtocol::new();
        let parent = protocol.create_toplevel();
        let inbox = SurfaceInbox::new();

        let a = protocol.create_surface(&inbox).unwrap();
        let b = protocol.create_surface(&inbox).unwrap();
        let sub_a = protocol.create_subsurface(a, parent).unwrap();
        let sub_b = protocol.create_subsurface(b, parent).unwrap();
        assert_eq!(protocol.stacking(parent), vec![a, b]);

        protocol.place_above(sub_a, b);
        assert_eq!(protocol.stacking(parent), vec![b, a]);
        protocol.place_above(sub_a, parent);
        assert_eq!(protocol.stacking(parent), vec![a, b]);

        protocol.destroy_subsurface(sub_b);
        protocol.destroy_surface(b);
        assert_eq!(protocol.stacking(parent), vec![a]);
        assert_eq!(protocol.live_objects(), 2);
    }

    #[test]
    fn test_frame_callbacks_fire_once() {
        let protocol = RecordingProtocol::new();
        let inbox = SurfaceInbox::new();
        let surface = protocol.create_surface(&inbox).unwrap();

        assert!(protocol.request_frame(surface, inbox.downgrade(), FrameTag::Own(1)));
        assert_eq!(protocol.fire_frame(surface), 1);
        assert_eq!(protocol.fire_frame(surface), 0);
        assert_eq!(inbox.len(), 1);

        protocol.request_frame(surface, inbox.downgrade(), FrameTag::Own(1));
        protocol.destroy_surface(surface);
        assert_eq!(protocol.fire_frame(surface), 0);
        assert!(!protocol.request_frame(surface, inbox.downgrade(), FrameTag::Own(1)));
    }

    #[test]
    fn test_commit_releases_previous_buffer() {
        let protocol = RecordingProtocol::new();
        let inbox = SurfaceInbox::new();
        let surface = protocol.create_surface(&inbox).unwrap();

        let first = Arc::new(ReleaseTracker::new(crate::buffer::BufferId(1)));
        let second = Arc::new(ReleaseTracker::new(crate::buffer::BufferId(2)));
        let layout = super::super::ShmLayout::packed(Size::new(4, 4), super::super::ShmFormat::Argb8888).unwrap();
        let region = super::super::ShmRegion::allocate(layout).unwrap();
        let params = ShmBufferParams {
            fd: region.fd(),
            pool_size: region.len(),
            layout,
        };
        let a = protocol.create_shm_buffer(params, &first).unwrap();
        let b = protocol.create_shm_buffer(params, &second).unwrap();

        first.mark_attached(&inbox);
        protocol.attach(surface, Some(a));
        protocol.commit(surface);
        assert!(first.is_attached());

        second.mark_attached(&inbox);
        protocol.attach(surface, Some(b));
        protocol.commit(surface);
        assert!(first.is_free());
        assert!(second.is_attached());
        assert_eq!(protocol.attached_buffer(surface), Some(b));
        second.detach(&inbox);
    }

    #[test]
    fn test_refusals_are_one_shot() {
        let protocol = RecordingProtocol::new();
        let inbox = SurfaceInbox::new();
        protocol.fail_next_surface();
        assert!(protocol.create_surface(&inbox).is_none());
        assert!(protocol.create_surface(&inbox).is_some());
        assert_eq!(protocol.mutation_count(), 1);
    }
}
