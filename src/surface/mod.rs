//! Compositor surfaces
//!
//! A [`SurfaceHandle`] wraps one `wl_surface` + `wl_subsurface` pair. All
//! state lives behind a mutex and is reached through [`SurfaceLock`], the
//! guard every mutating method requires. Dropping a dirty lock commits.
//!
//! Protocol events for the surface (frame done, buffer release, preferred
//! scale) arrive through its [`SurfaceInbox`] and are turned into
//! [`SurfaceNotification`]s by [`SurfaceLock::dispatch_events`] on the
//! thread that owns the surface.

mod frame;
mod inbox;

pub use frame::FrameCallbackKind;
pub use inbox::{FrameTag, SurfaceEvent, SurfaceInbox, WeakInbox};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use log::{debug, trace, warn};

use frame::FrameRequest;

use crate::buffer::{BufferId, BufferObject, ReleaseTracker};
use crate::context::DisplayContext;
use crate::geometry::{Point, Rect, RectF, Size};
use crate::protocol::{BufferTransform, ProtoId};

/// Unique identifier for surface handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

impl SurfaceId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        SurfaceId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Map state of a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapState {
    #[default]
    Unmapped,
    /// Protocol objects are being created
    Mapping,
    /// Protocol objects exist; `ready` once the parent presented a frame
    Mapped { ready: bool },
    /// Protocol objects are being torn down
    Unmapping,
}

/// Commit synchronization with the parent surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsurfaceMode {
    /// State is applied together with the parent's commit
    Sync,
    /// State is applied on the surface's own commit
    Desync,
}

/// Buffer scale of a surface
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scale {
    /// Integer `wl_surface.set_buffer_scale`
    Ceiled(i32),
    /// Fractional scale, realized with a viewport destination
    Fractional(f64),
}

impl Default for Scale {
    fn default() -> Self {
        Scale::Ceiled(1)
    }
}

impl Scale {
    /// Buffer pixels per surface unit
    pub fn factor(&self) -> f64 {
        match *self {
            Scale::Ceiled(s) => s as f64,
            Scale::Fractional(f) => f,
        }
    }

    fn buffer_scale(&self) -> i32 {
        match *self {
            Scale::Ceiled(s) => s,
            Scale::Fractional(_) => 1,
        }
    }

    /// Size of the buffer needed for a surface of `size`
    pub fn buffer_size(&self, size: Size) -> Size {
        let f = self.factor();
        Size::new(
            (size.width as f64 * f).ceil() as i32,
            (size.height as f64 * f).ceil() as i32,
        )
    }
}

/// Explicit viewport crop and scale
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub source: Option<RectF>,
    pub destination: Option<Size>,
}

/// What [`SurfaceLock::dispatch_events`] reports to the owner
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SurfaceNotification {
    /// The parent presented its first frame, the surface can be shown
    ParentReady,
    /// A registered frame callback fired
    Frame { time: u32, emulated: bool },
    /// The compositor released an attached buffer
    BufferReleased(BufferId),
    /// The compositor prefers a different scale
    ScaleChanged(Scale),
}

/// Protocol state sent with the last commit
#[derive(Debug, Clone, PartialEq)]
struct Geometry {
    position: Point,
    buffer_scale: i32,
    source: Option<RectF>,
    destination: Option<Size>,
    opaque: Option<Rect>,
    transform: BufferTransform,
}

#[derive(Debug)]
struct Attached {
    buffer: BufferId,
    tracker: Arc<ReleaseTracker>,
}

#[derive(Debug, Clone, Copy)]
struct PendingAttach {
    buffer: BufferId,
    proto: ProtoId,
    size: Size,
}

#[derive(Debug, Default)]
struct ProtoObjects {
    surface: Option<ProtoId>,
    subsurface: Option<ProtoId>,
    viewport: Option<ProtoId>,
    fractional: Option<ProtoId>,
}

#[derive(Debug, Default)]
struct SurfaceState {
    map_state: MapState,
    objects: ProtoObjects,
    parent: Option<ProtoId>,
    position: Point,
    size: Size,
    scale: Scale,
    viewport: Option<Viewport>,
    clip: Option<Rect>,
    opaque: bool,
    transform: BufferTransform,
    damage: Vec<Rect>,
    attached: Vec<Attached>,
    pending_attach: Option<PendingAttach>,
    has_buffer: bool,
    frame: Option<FrameRequest>,
    sent: Option<Geometry>,
    dirty: bool,
    needs_owner_finish: bool,
    commits: u64,
    /// Bumped on every map, tags frame callbacks
    generation: u32,
}

impl SurfaceState {
    fn is_live(&self) -> bool {
        self.objects.surface.is_some()
    }

    fn geometry(&self) -> Geometry {
        let mut position = self.position;
        let mut source = self.viewport.and_then(|v| v.source);
        let mut destination = self.viewport.and_then(|v| v.destination);

        if let Some(clip) = self.clip {
            let clip = clip.intersect(&Rect::from_origin_size(Point::ORIGIN, self.size));
            if !clip.is_empty() {
                // Viewport source is in surface coordinates after the buffer
                // scale, which is 1 for fractional scaling
                let f = match self.scale {
                    Scale::Ceiled(_) => 1.0,
                    Scale::Fractional(f) => f,
                };
                position = Point::new(position.x + clip.x, position.y + clip.y);
                source = Some(RectF::new(
                    clip.x as f64 * f,
                    clip.y as f64 * f,
                    clip.width as f64 * f,
                    clip.height as f64 * f,
                ));
                destination = Some(clip.size());
            }
        }
        if destination.is_none() && matches!(self.scale, Scale::Fractional(_)) && !self.size.is_empty() {
            destination = Some(self.size);
        }

        let opaque = (self.opaque && !self.size.is_empty())
            .then(|| Rect::from_origin_size(Point::ORIGIN, self.size));

        Geometry {
            position,
            buffer_scale: self.scale.buffer_scale(),
            source,
            destination,
            opaque,
            transform: self.transform,
        }
    }
}

/// One compositor surface placed as a sub-surface of a parent
#[derive(Debug)]
pub struct SurfaceHandle {
    id: SurfaceId,
    ctx: Arc<DisplayContext>,
    inbox: SurfaceInbox,
    created: Instant,
    state: Mutex<SurfaceState>,
}

impl SurfaceHandle {
    pub fn new(ctx: &Arc<DisplayContext>) -> Self {
        let id = SurfaceId::new();
        debug!("Created surface handle {:?}", id);
        Self {
            id,
            ctx: ctx.clone(),
            inbox: SurfaceInbox::new(),
            created: Instant::now(),
            state: Mutex::new(SurfaceState::default()),
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    /// Inbox the protocol pushes this surface's events to
    pub fn inbox(&self) -> &SurfaceInbox {
        &self.inbox
    }

    /// Acquire the surface lock
    pub fn lock(&self) -> SurfaceLock<'_> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        SurfaceLock {
            handle: self,
            state,
        }
    }

    /// Destroy an unmapped surface
    ///
    /// # Panics
    ///
    /// Panics if the surface is still mapped.
    pub fn destroy(self) {
        let mapped = self.lock().state.is_live();
        assert!(!mapped, "surface {:?} destroyed while mapped", self.id);
        drop(self);
    }
}

impl Drop for SurfaceHandle {
    fn drop(&mut self) {
        let mut lock = self.lock();
        if lock.state.is_live() {
            warn!("Surface {:?} dropped while mapped, unmapping", lock.id());
            lock.unmap();
        }
        lock.state.dirty = false;
        drop(lock);
        debug!("Destroyed surface handle {:?}", self.id);
    }
}

/// Exclusive access to a surface
///
/// Every mutation goes through this guard. When it is dropped with pending
/// changes on a mapped surface, the changes are committed.
#[derive(Debug)]
pub struct SurfaceLock<'a> {
    handle: &'a SurfaceHandle,
    state: MutexGuard<'a, SurfaceState>,
}

impl<'a> SurfaceLock<'a> {
    pub fn id(&self) -> SurfaceId {
        self.handle.id
    }

    pub fn map_state(&self) -> MapState {
        self.state.map_state
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.state.map_state, MapState::Mapped { .. })
    }

    /// Mapped and the parent has presented a frame
    pub fn is_ready(&self) -> bool {
        self.state.map_state == MapState::Mapped { ready: true }
    }

    /// The `wl_surface`, when mapped
    pub fn proto(&self) -> Option<ProtoId> {
        self.state.objects.surface
    }

    pub fn subsurface(&self) -> Option<ProtoId> {
        self.state.objects.subsurface
    }

    pub fn position(&self) -> Point {
        self.state.position
    }

    pub fn size(&self) -> Size {
        self.state.size
    }

    pub fn scale(&self) -> Scale {
        self.state.scale
    }

    pub fn clip(&self) -> Option<Rect> {
        self.state.clip
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.state.viewport
    }

    pub fn is_opaque(&self) -> bool {
        self.state.opaque
    }

    pub fn is_dirty(&self) -> bool {
        self.state.dirty
    }

    /// Buffers attached and not yet released
    pub fn attached_buffers(&self) -> Vec<BufferId> {
        self.state.attached.iter().map(|a| a.buffer).collect()
    }

    pub fn has_pending_frame(&self) -> bool {
        self.state.frame.is_some()
    }

    pub fn commit_count(&self) -> u64 {
        self.state.commits
    }

    /// Create the protocol objects and place the surface under `parent`
    ///
    /// Returns false when the compositor refused an object; nothing is left
    /// behind in that case.
    ///
    /// # Panics
    ///
    /// Panics if the surface is already mapped.
    pub fn map(&mut self, parent: ProtoId, position: Point, mode: SubsurfaceMode) -> bool {
        assert!(
            self.state.map_state == MapState::Unmapped,
            "surface {:?} mapped twice",
            self.handle.id
        );
        let handle = self.handle;
        let protocol = handle.ctx.protocol();
        self.state.map_state = MapState::Mapping;

        let Some(surface) = protocol.create_surface(&handle.inbox) else {
            warn!("Failed to create wl_surface for {:?}", handle.id);
            self.state.map_state = MapState::Unmapped;
            return false;
        };
        let Some(subsurface) = protocol.create_subsurface(surface, parent) else {
            warn!("Failed to create wl_subsurface for {:?}", handle.id);
            protocol.destroy_surface(surface);
            self.state.map_state = MapState::Unmapped;
            return false;
        };
        if mode == SubsurfaceMode::Desync {
            protocol.set_desync(subsurface);
        }
        protocol.set_empty_input_region(surface);

        let viewport = if protocol.has_viewporter() {
            protocol.create_viewport(surface)
        } else {
            None
        };
        let fractional = if handle.ctx.config().fractional_scale && protocol.has_fractional_scale() {
            protocol.create_fractional_scale(surface, &handle.inbox)
        } else {
            None
        };

        let generation = self.state.generation.wrapping_add(1);
        let ready = !protocol.request_frame(
            parent,
            handle.inbox.downgrade(),
            FrameTag::Parent(generation),
        );
        if ready {
            debug!("No parent frame callback for {:?}, ready immediately", handle.id);
        }

        let state = &mut *self.state;
        state.objects = ProtoObjects {
            surface: Some(surface),
            subsurface: Some(subsurface),
            viewport,
            fractional,
        };
        state.parent = Some(parent);
        state.position = position;
        state.sent = None;
        state.dirty = true;
        state.needs_owner_finish = false;
        state.generation = generation;
        state.map_state = MapState::Mapped { ready };
        debug!(
            "Mapped surface {:?} as {:?} under {:?} at {:?}",
            handle.id, surface, parent, position
        );
        true
    }

    /// Tear the protocol objects down
    ///
    /// A buffer attached but never committed is taken back. Committed
    /// buffers stay attached, without an owner, until the compositor
    /// releases them. Callbacks and queued events are dropped. Calling it
    /// on an unmapped surface does nothing.
    pub fn unmap(&mut self) {
        match self.state.map_state {
            MapState::Unmapped | MapState::Unmapping => {
                trace!("Surface {:?} already unmapped", self.handle.id);
                return;
            }
            MapState::Mapping | MapState::Mapped { .. } => {}
        }
        let handle = self.handle;
        let protocol = handle.ctx.protocol();
        let state = &mut *self.state;
        state.map_state = MapState::Unmapping;

        let uncommitted = state.pending_attach.take().map(|p| p.buffer);
        for attached in state.attached.drain(..) {
            if Some(attached.buffer) == uncommitted {
                attached.tracker.detach(&handle.inbox);
            } else {
                attached.tracker.orphan(&handle.inbox);
            }
        }
        state.damage.clear();
        state.has_buffer = false;
        state.frame = None;
        handle.inbox.clear();

        let objects = std::mem::take(&mut state.objects);
        if let Some(fractional) = objects.fractional {
            protocol.destroy_fractional_scale(fractional);
        }
        if let Some(viewport) = objects.viewport {
            protocol.destroy_viewport(viewport);
        }
        if let Some(subsurface) = objects.subsurface {
            protocol.destroy_subsurface(subsurface);
        }
        if let Some(surface) = objects.surface {
            protocol.destroy_surface(surface);
        }

        state.parent = None;
        state.sent = None;
        state.dirty = false;
        state.needs_owner_finish = true;
        state.map_state = MapState::Unmapped;
        debug!("Unmapped surface {:?}", handle.id);
    }

    /// Complete an unmap on the thread owning the toolkit objects
    ///
    /// Returns true if there was anything to finish.
    pub fn finish_unmap_on_owner_thread(&mut self) -> bool {
        if !std::mem::take(&mut self.state.needs_owner_finish) {
            return false;
        }
        trace!("Finished unmap of surface {:?}", self.handle.id);
        true
    }

    /// Attach a buffer for the next commit
    ///
    /// Returns false when the surface is not mapped or the buffer has no
    /// protocol handle.
    ///
    /// # Panics
    ///
    /// Panics if `buffer` is still attached to any surface.
    pub fn attach(&mut self, buffer: &BufferObject) -> bool {
        if !self.state.is_live() {
            return false;
        }
        let Some(proto) = buffer.borrow(&self.handle.inbox) else {
            warn!(
                "Buffer {:?} has no protocol handle, not attaching to {:?}",
                buffer.id(),
                self.handle.id
            );
            return false;
        };

        let handle = self.handle;
        let state = &mut *self.state;
        // An attach that was never committed will not be released by the
        // compositor
        if let Some(previous) = state.pending_attach.take().filter(|p| p.buffer != buffer.id()) {
            if let Some(index) = state.attached.iter().position(|a| a.buffer == previous.buffer) {
                state.attached.swap_remove(index).tracker.detach(&handle.inbox);
            }
        }
        // A stale entry from a release not dispatched yet
        state.attached.retain(|a| a.buffer != buffer.id());
        state.attached.push(Attached {
            buffer: buffer.id(),
            tracker: buffer.release_tracker().clone(),
        });
        state.pending_attach = Some(PendingAttach {
            buffer: buffer.id(),
            proto,
            size: buffer.size(),
        });
        state.has_buffer = true;
        state.dirty = true;
        trace!("Attached buffer {:?} to {:?}", buffer.id(), self.handle.id);
        true
    }

    /// Move within the parent, in surface coordinates
    pub fn move_to(&mut self, position: Point) {
        if self.state.position != position {
            self.state.position = position;
            self.state.dirty = true;
        }
    }

    /// Set the logical size
    pub fn resize(&mut self, size: Size) {
        if self.state.size != size {
            self.state.size = size;
            self.state.dirty = true;
        }
    }

    /// Crop to `clip`, in surface coordinates
    pub fn set_clip(&mut self, clip: Option<Rect>) {
        if self.state.clip != clip {
            self.state.clip = clip;
            self.state.dirty = true;
        }
    }

    pub fn set_scale(&mut self, scale: Scale) {
        let scale = match scale {
            Scale::Ceiled(s) if s < 1 => {
                warn!("Invalid buffer scale {} for {:?}, using 1", s, self.handle.id);
                Scale::Ceiled(1)
            }
            Scale::Fractional(f) if !f.is_finite() || f <= 0.0 => {
                warn!("Invalid fractional scale {} for {:?}, ignoring", f, self.handle.id);
                return;
            }
            scale => scale,
        };
        if self.state.scale != scale {
            self.state.scale = scale;
            self.state.dirty = true;
        }
    }

    /// Explicit viewport; a clip rect takes precedence
    pub fn set_viewport(&mut self, viewport: Option<Viewport>) {
        if self.state.viewport != viewport {
            self.state.viewport = viewport;
            self.state.dirty = true;
        }
    }

    /// Mark the whole surface opaque
    pub fn set_opaque(&mut self, opaque: bool) {
        if self.state.opaque != opaque {
            self.state.opaque = opaque;
            self.state.dirty = true;
        }
    }

    pub fn set_transform(&mut self, transform: BufferTransform) {
        if self.state.transform != transform {
            self.state.transform = transform;
            self.state.dirty = true;
        }
    }

    /// Accumulate buffer damage for the next attach
    pub fn add_damage(&mut self, rect: Rect) {
        if !rect.is_empty() {
            self.state.damage.push(rect);
            self.state.dirty = true;
        }
    }

    /// Register a frame callback, replacing any previous registration
    ///
    /// With `emulate` set and no buffer attached, a synthetic callback is
    /// produced every `emulated_frame_interval` since the compositor would
    /// never send one.
    pub fn request_frame_callback(&mut self, kind: FrameCallbackKind, emulate: bool) {
        let interval = self.handle.ctx.config().emulated_frame_interval;
        let state = &mut *self.state;

        let mut request = FrameRequest::new(kind, emulate);
        if let Some(previous) = state.frame.take() {
            request.registered = previous.registered;
        }
        if state.has_buffer && state.is_live() {
            if !request.registered {
                state.dirty = true;
            }
        } else {
            request.arm_emulation(Instant::now(), interval);
        }
        trace!(
            "Frame callback {:?} (emulate {}) on {:?}",
            kind,
            emulate,
            self.handle.id
        );
        state.frame = Some(request);
    }

    pub fn cancel_frame_callback(&mut self) {
        self.state.frame = None;
    }

    /// When the next synthetic frame callback is due
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.frame.as_ref().and_then(|f| f.deadline)
    }

    /// Restack directly above `below`, a sibling under the same parent
    ///
    /// Takes both locks; callers lock the lower sibling first.
    pub fn place_above(&mut self, below: &SurfaceLock<'_>) -> bool {
        let (Some(subsurface), Some(sibling)) = (self.state.objects.subsurface, below.state.objects.surface)
        else {
            return false;
        };
        self.handle.ctx.protocol().place_above(subsurface, sibling);
        true
    }

    /// Restack directly above the parent, below every sibling
    pub fn place_above_parent(&mut self) -> bool {
        let (Some(subsurface), Some(parent)) = (self.state.objects.subsurface, self.state.parent) else {
            return false;
        };
        self.handle.ctx.protocol().place_above(subsurface, parent);
        true
    }

    /// Send pending state and commit
    ///
    /// # Panics
    ///
    /// Panics if the surface is not mapped.
    pub fn commit(&mut self) {
        assert!(
            self.state.is_live(),
            "commit on unmapped surface {:?}",
            self.handle.id
        );
        self.flush();
    }

    fn flush(&mut self) {
        let handle = self.handle;
        let protocol = handle.ctx.protocol();
        let state = &mut *self.state;
        let Some(surface) = state.objects.surface else {
            return;
        };

        let geometry = state.geometry();
        let sent = state.sent.take();
        let changed = |f: &dyn Fn(&Geometry) -> bool| sent.as_ref().map_or(true, f);

        if changed(&|g| g.position != geometry.position) {
            if let Some(subsurface) = state.objects.subsurface {
                protocol.set_position(subsurface, geometry.position);
            }
        }
        if changed(&|g| g.buffer_scale != geometry.buffer_scale) {
            protocol.set_buffer_scale(surface, geometry.buffer_scale);
        }
        if changed(&|g| g.source != geometry.source || g.destination != geometry.destination) {
            match state.objects.viewport {
                Some(viewport) => protocol.set_viewport(viewport, geometry.source, geometry.destination),
                None if geometry.source.is_some() || geometry.destination.is_some() => {
                    trace!("No viewporter, ignoring viewport of {:?}", handle.id);
                }
                None => {}
            }
        }
        if changed(&|g| g.opaque != geometry.opaque) {
            protocol.set_opaque_region(surface, geometry.opaque);
        }
        if changed(&|g| g.transform != geometry.transform) {
            protocol.set_buffer_transform(surface, geometry.transform);
        }
        state.sent = Some(geometry);

        if let Some(pending) = state.pending_attach.take() {
            protocol.attach(surface, Some(pending.proto));
            if state.damage.is_empty() {
                protocol.damage_buffer(surface, Rect::from_origin_size(Point::ORIGIN, pending.size));
            }
        }
        if state.has_buffer {
            for rect in state.damage.drain(..) {
                protocol.damage_buffer(surface, rect);
            }
        }

        if let Some(frame) = state.frame.as_mut() {
            if !frame.registered
                && state.has_buffer
                && protocol.request_frame(
                    surface,
                    handle.inbox.downgrade(),
                    FrameTag::Own(state.generation),
                )
            {
                frame.registered = true;
                frame.cancel_emulation();
            }
        }

        protocol.commit(surface);
        state.dirty = false;
        state.commits += 1;
        trace!("Committed {:?} ({:?})", handle.id, surface);
    }

    /// Handle queued protocol events
    pub fn dispatch_events(&mut self) -> Vec<SurfaceNotification> {
        self.dispatch_events_at(Instant::now())
    }

    /// Handle queued protocol events and synthetic callbacks due at `now`
    pub fn dispatch_events_at(&mut self, now: Instant) -> Vec<SurfaceNotification> {
        let handle = self.handle;
        let state = &mut *self.state;
        let mut notifications = Vec::new();

        for event in handle.inbox.drain() {
            match event {
                SurfaceEvent::FrameDone { tag, .. } if tag.generation() != state.generation => {
                    trace!("Dropping {:?} from an earlier mapping of {:?}", tag, handle.id);
                }
                SurfaceEvent::FrameDone {
                    tag: FrameTag::Parent(_),
                    ..
                } => {
                    if state.map_state == (MapState::Mapped { ready: false }) {
                        state.map_state = MapState::Mapped { ready: true };
                        debug!("Surface {:?} ready, parent presented", handle.id);
                        notifications.push(SurfaceNotification::ParentReady);
                    }
                }
                SurfaceEvent::FrameDone {
                    tag: FrameTag::Own(_),
                    time,
                } => {
                    let keep = match state.frame.as_mut() {
                        Some(frame) if frame.registered => frame.fired(),
                        _ => continue,
                    };
                    if keep {
                        // Re-armed on the next commit
                        state.dirty = true;
                    } else {
                        state.frame = None;
                    }
                    notifications.push(SurfaceNotification::Frame {
                        time,
                        emulated: false,
                    });
                }
                SurfaceEvent::BufferReleased(buffer) => {
                    // The buffer may already be attached again
                    state
                        .attached
                        .retain(|a| a.buffer != buffer || a.tracker.is_attached());
                    notifications.push(SurfaceNotification::BufferReleased(buffer));
                }
                SurfaceEvent::PreferredScale(scale) => {
                    // Fractional scale wins when both are advertised
                    if state.objects.fractional.is_none() && scale >= 1 {
                        notifications.push(SurfaceNotification::ScaleChanged(Scale::Ceiled(scale)));
                    }
                }
                SurfaceEvent::PreferredFractionalScale(scale) => {
                    if scale > 0 {
                        notifications.push(SurfaceNotification::ScaleChanged(Scale::Fractional(
                            scale as f64 / 120.0,
                        )));
                    }
                }
            }
        }

        let interval = handle.ctx.config().emulated_frame_interval;
        let due = match state.frame.as_mut() {
            Some(frame) if !frame.registered && !state.has_buffer && frame.emulation_due(now) => {
                let keep = frame.fired();
                if keep {
                    frame.arm_emulation(now, interval);
                }
                Some(keep)
            }
            _ => None,
        };
        if let Some(keep) = due {
            if !keep {
                state.frame = None;
            }
            let time = now.saturating_duration_since(handle.created).as_millis() as u32;
            trace!("Emulated frame callback on {:?}", handle.id);
            notifications.push(SurfaceNotification::Frame {
                time,
                emulated: true,
            });
        }

        notifications
    }
}

impl Drop for SurfaceLock<'_> {
    fn drop(&mut self) {
        if self.state.dirty && self.state.is_live() {
            self.flush();
        }
    }
}
