//! Root of a layer tree

use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, trace, warn};

use super::arena::{LayerArena, LayerId};
use super::{Layer, LayerFormats, Usage};
use crate::buffer::BufferObject;
use crate::context::DisplayContext;
use crate::geometry::{Point, Size};
use crate::protocol::{Fourcc, ProtoId};
use crate::surface::{
    FrameCallbackKind, Scale, SubsurfaceMode, SurfaceHandle, SurfaceNotification, Viewport,
};

/// What [`LayerRoot::poll_events`] reports
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RootEvent {
    /// The parent presented a frame with the root in it
    Ready,
    /// Frame callback on the root surface
    Frame { time: u32, emulated: bool },
    /// The compositor prefers a new scale, applied on the next frame
    ScaleChanged(Scale),
}

/// Frame counters of one root
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootStats {
    /// Frames committed by [`LayerRoot::commit_frame`]
    pub commits: u64,
    /// Frame callbacks delivered
    pub frames: u64,
    /// Of those, synthetic ones
    pub emulated_frames: u64,
    pub layers: usize,
    pub mapped_layers: usize,
    pub pending_map: usize,
}

/// What [`LayerRoot::drain_main_thread`] reports, in the order it happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainThreadEvent {
    /// The layer's surface was mapped under the root
    Mapped(LayerId),
    /// The layer's surface was torn down; the layer still exists
    Unmapped(LayerId),
    /// The layer was destroyed and its id is stale
    Destroyed(LayerId),
    /// The root surface was torn down
    RootUnmapped,
}

/// Work that has to run on the main thread
#[derive(Debug)]
enum MainThreadTask {
    FinishMap(LayerId),
    FinishUnmap(LayerId),
    Destroyed(Layer),
    FinishRootUnmap,
}

impl MainThreadTask {
    fn layer(&self) -> Option<LayerId> {
        match self {
            MainThreadTask::FinishMap(id) | MainThreadTask::FinishUnmap(id) => Some(*id),
            MainThreadTask::Destroyed(layer) => Some(layer.id()),
            MainThreadTask::FinishRootUnmap => None,
        }
    }
}

/// A root surface and its ordered child layers
///
/// The root is a desynchronized sub-surface of a toolkit surface. Layers are
/// synchronized sub-surfaces of the root, so a frame becomes visible
/// atomically when [`commit_frame`](Self::commit_frame) commits the root.
///
/// Render and main thread share a root through a mutex; everything that
/// must happen on the main thread is queued and run by
/// [`drain_main_thread`](Self::drain_main_thread), which reports it as
/// [`MainThreadEvent`]s.
#[derive(Debug)]
pub struct LayerRoot {
    ctx: Arc<DisplayContext>,
    surface: SurfaceHandle,
    /// Transparent buffer that keeps the root mapped
    backdrop: Option<BufferObject>,
    /// Backdrops replaced while the compositor still held them
    retired: Vec<BufferObject>,
    size: Size,
    scale: Scale,
    pending_scale: Option<Scale>,
    layers: LayerArena<Layer>,
    /// Layer list, bottom to top
    children: Vec<LayerId>,
    /// Mapped layers in the order the compositor stacks them
    stacked: Vec<LayerId>,
    main_thread: Vec<MainThreadTask>,
    formats: Option<LayerFormats>,
    stats: RootStats,
}

impl LayerRoot {
    pub fn new(ctx: &Arc<DisplayContext>) -> Self {
        let surface = SurfaceHandle::new(ctx);
        debug!("Created layer root {:?}", surface.id());
        Self {
            ctx: ctx.clone(),
            surface,
            backdrop: None,
            retired: Vec::new(),
            size: Size::default(),
            scale: Scale::default(),
            pending_scale: None,
            layers: LayerArena::new(),
            children: Vec::new(),
            stacked: Vec::new(),
            main_thread: Vec::new(),
            formats: None,
            stats: RootStats::default(),
        }
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

    pub fn scale(&self) -> Scale {
        self.scale
    }

    /// Use `scale` from the next frame on
    pub fn set_scale(&mut self, scale: Scale) {
        self.pending_scale = Some(scale);
    }

    /// Formats used for new layer buffers, negotiated once
    pub fn formats(&mut self) -> LayerFormats {
        *self
            .formats
            .get_or_insert_with(|| LayerFormats::negotiate(&self.ctx))
    }

    /// Forget the cached formats, for instance after the compositor
    /// announced new ones
    pub fn refresh_formats(&mut self) {
        self.formats = None;
    }

    /// Place the root under the toolkit surface `parent`
    ///
    /// Layers waiting for the root are mapped right away. Returns false
    /// when the compositor refused the root surface.
    ///
    /// # Panics
    ///
    /// Panics if the root is already mapped.
    pub fn map(&mut self, parent: ProtoId, position: Point, size: Size) -> bool {
        {
            let mut lock = self.surface.lock();
            if !lock.map(parent, position, SubsurfaceMode::Desync) {
                warn!("Failed to map layer root {:?}", self.surface.id());
                return false;
            }
            lock.resize(size);
        }
        self.size = size;
        self.attach_backdrop();
        self.map_pending_layers();
        info!(
            "Mapped layer root {:?} ({}x{}, {} layers)",
            self.surface.id(),
            size.width,
            size.height,
            self.children.len()
        );
        true
    }

    /// Unmap the root and every layer
    ///
    /// Layers stay in the list and are mapped again with the root.
    pub fn unmap(&mut self) {
        for id in &self.children {
            if let Some(layer) = self.layers.get_mut(*id) {
                if layer.unmap() {
                    push_task(&mut self.main_thread, MainThreadTask::FinishUnmap(*id));
                }
                layer.pending_map = true;
            }
        }
        self.stacked.clear();
        self.pending_scale = None;

        let was_mapped = {
            let mut lock = self.surface.lock();
            let was_mapped = lock.proto().is_some();
            lock.unmap();
            was_mapped
        };
        if was_mapped {
            push_task(&mut self.main_thread, MainThreadTask::FinishRootUnmap);
            debug!("Unmapped layer root {:?}", self.surface.id());
        }
        self.prune_retired();
    }

    /// Resize the root surface
    pub fn resize(&mut self, size: Size) {
        if self.size == size {
            return;
        }
        self.size = size;
        self.surface.lock().resize(size);
        if self.is_mapped() {
            self.attach_backdrop();
        }
    }

    fn attach_backdrop(&mut self) {
        let viewporter = self.ctx.protocol().has_viewporter();
        let buffer_size = if viewporter {
            Size::new(1, 1)
        } else {
            self.scale.buffer_size(self.size)
        };
        if buffer_size.is_empty() {
            return;
        }

        // An orphaned backdrop is still held for the previous root surface
        let reusable = self
            .backdrop
            .as_ref()
            .is_some_and(|b| b.size() == buffer_size && !b.is_orphaned());
        if !reusable {
            if let Some(old) = self.backdrop.take() {
                self.retired.push(old);
            }
            // Fresh memory is zeroed, which is transparent in ARGB
            match BufferObject::create_shm(&self.ctx, buffer_size, Fourcc::ARGB8888) {
                Ok(buffer) => self.backdrop = Some(buffer),
                Err(e) => {
                    warn!("Failed to allocate root backdrop: {}", e);
                    return;
                }
            }
        }

        let mut lock = self.surface.lock();
        lock.set_viewport(viewporter.then_some(Viewport {
            source: None,
            destination: Some(self.size),
        }));
        if let Some(backdrop) = &self.backdrop {
            if backdrop.is_free() {
                lock.attach(backdrop);
            }
        }
        drop(lock);
        self.prune_retired();
    }

    fn prune_retired(&mut self) {
        self.retired.retain(|buffer| buffer.is_attached());
    }

    /// Create a layer, not yet part of the layer list
    pub fn create_layer(&mut self, size: Size, opaque: bool) -> LayerId {
        let formats = self.formats();
        let ctx = &self.ctx;
        self.layers
            .insert_with(|id| Layer::new(id, ctx, size, opaque, formats))
    }

    /// Remove a layer from the list and destroy it
    ///
    /// The surface is unmapped now; the rest of the teardown runs with the
    /// next [`drain_main_thread`](Self::drain_main_thread).
    pub fn destroy_layer(&mut self, id: LayerId) -> bool {
        let Some(mut layer) = self.layers.remove(id) else {
            return false;
        };
        self.children.retain(|c| *c != id);
        self.stacked.retain(|c| *c != id);
        layer.unmap();
        layer.pending_map = false;
        self.main_thread
            .retain(|task| !matches!(task, MainThreadTask::FinishMap(l) | MainThreadTask::FinishUnmap(l) if *l == id));
        self.main_thread.push(MainThreadTask::Destroyed(layer));
        debug!("Layer {:?} scheduled for destruction", id);
        true
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.get(id)
    }

    pub fn layer_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.layers.get_mut(id)
    }

    /// Run `f` on a layer, `None` for stale ids
    pub fn with_layer<R>(&mut self, id: LayerId, f: impl FnOnce(&mut Layer) -> R) -> Option<R> {
        self.layers.get_mut(id).map(f)
    }

    /// Current layer list, bottom to top
    pub fn layers(&self) -> &[LayerId] {
        &self.children
    }

    /// The layer is listed but waits for the root to be mapped
    pub fn is_pending_map(&self, id: LayerId) -> bool {
        self.layers.get(id).is_some_and(|layer| layer.pending_map)
    }

    /// Replace the layer list with `layers`, bottom to top
    pub fn set_layers(&mut self, layers: impl IntoIterator<Item = LayerId>) {
        let layers: Vec<LayerId> = layers.into_iter().collect();
        self.replace_layers(&layers);
    }

    /// Replace the layer list with `layers`, bottom to top
    ///
    /// Layers no longer listed are unmapped, new ones are mapped (or wait
    /// for the root), and the survivors are restacked. An identical list is
    /// a no-op.
    pub fn replace_layers(&mut self, layers: &[LayerId]) {
        if self.children.as_slice() == layers {
            return;
        }

        for id in &self.children {
            if let Some(layer) = self.layers.get_mut(*id) {
                layer.usage = Usage::Removed;
            }
        }

        let mut next = Vec::with_capacity(layers.len());
        for id in layers {
            let Some(layer) = self.layers.get_mut(*id) else {
                warn!("Ignoring unknown layer {:?}", id);
                continue;
            };
            layer.usage = match layer.usage {
                Usage::Removed => Usage::Kept,
                Usage::Unused => Usage::Added,
                Usage::Kept | Usage::Added => {
                    warn!("Layer {:?} listed twice", id);
                    continue;
                }
            };
            next.push(*id);
        }

        let previous = std::mem::replace(&mut self.children, next);
        for id in previous {
            let Some(layer) = self.layers.get_mut(id) else {
                continue;
            };
            if layer.usage == Usage::Removed {
                layer.usage = Usage::Unused;
                layer.pending_map = false;
                if layer.unmap() {
                    push_task(&mut self.main_thread, MainThreadTask::FinishUnmap(id));
                }
                self.stacked.retain(|c| *c != id);
                trace!("Layer {:?} removed", id);
            }
        }
        for id in &self.children {
            if let Some(layer) = self.layers.get_mut(*id) {
                if layer.usage == Usage::Added {
                    layer.pending_map = true;
                    trace!("Layer {:?} added", id);
                }
                layer.usage = Usage::Unused;
            }
        }

        self.map_pending_layers();
        self.restack();
    }

    /// Map listed layers that wait for the root, returns how many were
    /// mapped
    fn map_pending_layers(&mut self) -> usize {
        let Some(root) = self.surface.lock().proto() else {
            return 0;
        };
        let scale = self.scale;
        let mut mapped = 0;
        for id in &self.children {
            let Some(layer) = self.layers.get_mut(*id) else {
                continue;
            };
            if !layer.pending_map {
                continue;
            }
            // Hidden layers stay pending until they become visible
            let Some(placement) = layer.placement(scale) else {
                continue;
            };
            if layer.map(root, placement.position) {
                layer.pending_map = false;
                self.stacked.push(*id);
                push_task(&mut self.main_thread, MainThreadTask::FinishMap(*id));
                mapped += 1;
            } else {
                warn!("Failed to map layer {:?}, retrying next frame", id);
            }
        }
        if mapped > 0 {
            self.restack();
        }
        mapped
    }

    /// Issue the `place_above` requests that make the compositor's stacking
    /// match the layer list
    fn restack(&mut self) {
        let desired: Vec<LayerId> = self
            .children
            .iter()
            .copied()
            .filter(|id| self.stacked.contains(id))
            .collect();

        for (i, id) in desired.iter().enumerate() {
            let below = i.checked_sub(1).map(|j| desired[j]);
            let Some(index) = self.stacked.iter().position(|s| s == id) else {
                continue;
            };
            let in_place = match below {
                None => index == 0,
                Some(below) => index > 0 && self.stacked[index - 1] == below,
            };
            if in_place {
                continue;
            }

            let placed = match below {
                None => self
                    .layers
                    .get(*id)
                    .is_some_and(|layer| layer.surface.lock().place_above_parent()),
                Some(below) => match (self.layers.get(below), self.layers.get(*id)) {
                    (Some(lower), Some(upper)) => {
                        // Lower sibling first
                        let lower = lower.surface.lock();
                        let mut upper = upper.surface.lock();
                        upper.place_above(&lower)
                    }
                    _ => false,
                },
            };
            if !placed {
                continue;
            }
            let moved = self.stacked.remove(index);
            let at = below
                .and_then(|below| self.stacked.iter().position(|s| *s == below))
                .map_or(0, |p| p + 1);
            self.stacked.insert(at, moved);
            trace!("Layer {:?} placed above {:?}", id, below);
        }
    }

    /// Push every layer's state and commit the frame
    ///
    /// Maps layers waiting for the root, recomputes placement of every
    /// layer, attaches new front buffers and commits the root last. Returns
    /// false while the root is unmapped.
    pub fn commit_frame(&mut self) -> bool {
        if !self.is_mapped() {
            trace!("Skipping frame, root unmapped");
            return false;
        }
        if let Some(scale) = self.pending_scale.take() {
            if scale != self.scale {
                debug!("Layer root {:?} scale {:?}", self.surface.id(), scale);
                self.scale = scale;
                if !self.ctx.protocol().has_viewporter() {
                    self.attach_backdrop();
                }
            }
        }

        self.map_pending_layers();

        let scale = self.scale;
        let mut hidden = Vec::new();
        for id in &self.children {
            let Some(layer) = self.layers.get_mut(*id) else {
                continue;
            };
            if layer.pending_map {
                continue;
            }
            match layer.placement(scale) {
                Some(placement) => layer.apply(&placement),
                None => hidden.push(*id),
            }
        }
        for id in hidden {
            if let Some(layer) = self.layers.get_mut(id) {
                if layer.unmap() {
                    push_task(&mut self.main_thread, MainThreadTask::FinishUnmap(id));
                }
                layer.pending_map = true;
                self.stacked.retain(|c| *c != id);
                trace!("Layer {:?} hidden", id);
            }
        }

        self.surface.lock().commit();
        self.stats.commits += 1;
        true
    }

    /// Register a frame callback on the root surface
    pub fn request_frame_callback(&mut self, kind: FrameCallbackKind, emulate: bool) {
        self.surface.lock().request_frame_callback(kind, emulate);
    }

    pub fn cancel_frame_callback(&mut self) {
        self.surface.lock().cancel_frame_callback();
    }

    /// When the next synthetic frame callback is due
    pub fn next_deadline(&self) -> Option<Instant> {
        self.surface.lock().next_deadline()
    }

    /// Handle protocol events for the root and every layer
    pub fn poll_events(&mut self) -> Vec<RootEvent> {
        self.poll_events_at(Instant::now())
    }

    pub fn poll_events_at(&mut self, now: Instant) -> Vec<RootEvent> {
        let mut events = Vec::new();
        let notifications = self.surface.lock().dispatch_events_at(now);
        for notification in notifications {
            match notification {
                SurfaceNotification::ParentReady => events.push(RootEvent::Ready),
                SurfaceNotification::Frame { time, emulated } => {
                    self.stats.frames += 1;
                    if emulated {
                        self.stats.emulated_frames += 1;
                    }
                    events.push(RootEvent::Frame { time, emulated });
                }
                SurfaceNotification::ScaleChanged(scale) => {
                    if scale != self.scale {
                        self.pending_scale = Some(scale);
                        events.push(RootEvent::ScaleChanged(scale));
                    }
                }
                SurfaceNotification::BufferReleased(_) => {}
            }
        }

        for (_, layer) in self.layers.iter_mut() {
            layer.dispatch_events(now);
        }
        self.prune_retired();
        events
    }

    /// Run queued main-thread work
    ///
    /// Call once per toolkit frame tick. Returns what happened to the root
    /// and its layers since the last call, oldest first.
    pub fn drain_main_thread(&mut self) -> Vec<MainThreadEvent> {
        let tasks = std::mem::take(&mut self.main_thread);
        let mut events = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task {
                MainThreadTask::FinishMap(id) => {
                    trace!("Layer {:?} shown", id);
                    events.push(MainThreadEvent::Mapped(id));
                }
                MainThreadTask::FinishUnmap(id) => {
                    if let Some(layer) = self.layers.get(id) {
                        layer.surface.lock().finish_unmap_on_owner_thread();
                    }
                    events.push(MainThreadEvent::Unmapped(id));
                }
                MainThreadTask::Destroyed(layer) => {
                    let id = layer.id();
                    layer.surface.lock().finish_unmap_on_owner_thread();
                    drop(layer);
                    events.push(MainThreadEvent::Destroyed(id));
                }
                MainThreadTask::FinishRootUnmap => {
                    self.surface.lock().finish_unmap_on_owner_thread();
                    events.push(MainThreadEvent::RootUnmapped);
                }
            }
        }
        if !events.is_empty() {
            trace!("Drained {} main thread tasks", events.len());
        }
        events
    }

    /// Main-thread tasks waiting for [`drain_main_thread`](Self::drain_main_thread)
    pub fn pending_main_thread(&self) -> usize {
        self.main_thread.len()
    }

    pub fn stats(&self) -> RootStats {
        let mut stats = self.stats;
        stats.layers = self.layers.len();
        stats.mapped_layers = self.stacked.len();
        stats.pending_map = self
            .children
            .iter()
            .filter(|id| self.is_pending_map(**id))
            .count();
        stats
    }
}

/// Queue `task` unless the last queued task for the same target is the same
fn push_task(queue: &mut Vec<MainThreadTask>, task: MainThreadTask) {
    let target = task.layer();
    let last = queue.iter().rev().find(|queued| queued.layer() == target);
    let duplicate = matches!(
        (last, &task),
        (Some(MainThreadTask::FinishMap(_)), MainThreadTask::FinishMap(_))
            | (Some(MainThreadTask::FinishUnmap(_)), MainThreadTask::FinishUnmap(_))
            | (Some(MainThreadTask::FinishRootUnmap), MainThreadTask::FinishRootUnmap)
    );
    if !duplicate {
        queue.push(task);
    }
}

impl Drop for LayerRoot {
    fn drop(&mut self) {
        drop(self.layers.drain());
        self.main_thread.clear();
        self.surface.lock().unmap();
        debug!("Destroyed layer root {:?}", self.surface.id());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::geometry::Rect;
    use crate::protocol::recording::Request;
    use crate::protocol::RecordingProtocol;
    use crate::testing;

    fn mapped_root() -> (Arc<RecordingProtocol>, Arc<DisplayContext>, LayerRoot, ProtoId) {
        let (recorder, ctx) = testing::recording_context();
        let toplevel = recorder.create_toplevel();
        let mut root = LayerRoot::new(&ctx);
        assert!(root.map(toplevel, Point::ORIGIN, Size::new(200, 200)));
        (recorder, ctx, root, toplevel)
    }

    fn draw(root: &mut LayerRoot, id: LayerId) {
        root.with_layer(id, |layer| {
            layer.next_buffer().unwrap().lock().unwrap().fill(0xff33_66cc);
            assert!(layer.notify_draw_complete());
        })
        .unwrap();
    }

    fn proto_of(root: &LayerRoot, id: LayerId) -> Option<ProtoId> {
        root.layer(id).and_then(|l| l.surface().lock().proto())
    }

    fn root_proto(root: &LayerRoot) -> ProtoId {
        root.surface().lock().proto().unwrap()
    }

    #[test]
    fn test_replace_same_list_twice_sends_nothing() {
        let (recorder, _ctx, mut root, _) = mapped_root();
        let a = root.create_layer(Size::new(32, 32), true);
        let b = root.create_layer(Size::new(32, 32), false);

        root.replace_layers(&[a, b]);
        root.commit_frame();
        let before = recorder.mutation_count();

        root.replace_layers(&[a, b]);
        assert_eq!(recorder.mutation_count(), before);
    }

    #[test]
    fn test_layer_waits_for_root_map() {
        let (recorder, ctx) = testing::recording_context();
        let toplevel = recorder.create_toplevel();
        let mut root = LayerRoot::new(&ctx);

        let layer = root.create_layer(Size::new(64, 64), true);
        root.set_layers([layer]);
        assert!(root.is_pending_map(layer));
        assert_eq!(recorder.live_surfaces(), 0);
        assert!(!root.commit_frame());

        assert!(root.map(toplevel, Point::ORIGIN, Size::new(128, 128)));
        assert!(root.commit_frame());
        assert!(!root.is_pending_map(layer));
        assert!(root.layer(layer).unwrap().is_mapped());
        assert_eq!(recorder.live_surfaces(), 2);
        assert_eq!(recorder.stacking(root_proto(&root)), vec![proto_of(&root, layer).unwrap()]);
    }

    #[test]
    fn test_commit_frame_attaches_front_and_commits_root_last() {
        let (recorder, _ctx, mut root, _) = mapped_root();
        let layer = root.create_layer(Size::new(32, 32), true);
        root.set_layers([layer]);
        draw(&mut root, layer);

        assert!(root.commit_frame());
        let surface = proto_of(&root, layer).unwrap();
        let front = root.layer(layer).unwrap().front().unwrap().proto();
        assert_eq!(recorder.attached_buffer(surface), front);
        assert_eq!(
            recorder.requests().last(),
            Some(&Request::Commit(root_proto(&root)))
        );
        assert_eq!(root.stats().commits, 1);
    }

    #[test]
    fn test_released_front_is_recycled() {
        let (recorder, _ctx, mut root, _) = mapped_root();
        let layer = root.create_layer(Size::new(16, 16), true);
        root.set_layers([layer]);

        draw(&mut root, layer);
        let first = root.layer(layer).unwrap().front().unwrap().id();
        root.commit_frame();
        draw(&mut root, layer);
        // Attaching the second buffer releases the first
        root.commit_frame();
        root.poll_events();

        draw(&mut root, layer);
        assert_eq!(root.layer(layer).unwrap().front().unwrap().id(), first);
        // Two layer buffers plus the root backdrop
        assert_eq!(recorder.live_buffers(), 3);
    }

    #[test]
    fn test_held_buffers_are_not_reused() {
        let (recorder, _ctx, mut root, _) = mapped_root();
        recorder.set_auto_release(false);
        let layer = root.create_layer(Size::new(16, 16), true);
        root.set_layers([layer]);

        let mut seen = Vec::new();
        for _ in 0..3 {
            draw(&mut root, layer);
            seen.push(root.layer(layer).unwrap().front().unwrap().id());
            root.commit_frame();
            root.poll_events();
        }
        seen.dedup();
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_reorder_uses_minimal_place_above() {
        let (recorder, _ctx, mut root, _) = mapped_root();
        let a = root.create_layer(Size::new(8, 8), true);
        let b = root.create_layer(Size::new(8, 8), true);
        let c = root.create_layer(Size::new(8, 8), true);
        root.replace_layers(&[a, b, c]);
        root.commit_frame();

        let before = recorder.requests().len();
        root.replace_layers(&[c, a, b]);
        let place_above = recorder.requests()[before..]
            .iter()
            .filter(|r| matches!(r, Request::PlaceAbove { .. }))
            .count();
        assert_eq!(place_above, 1);

        let expected: Vec<_> = [c, a, b].iter().map(|id| proto_of(&root, *id).unwrap()).collect();
        assert_eq!(recorder.stacking(root_proto(&root)), expected);
    }

    #[test]
    fn test_removed_layer_is_unmapped_and_drained() {
        let (recorder, _ctx, mut root, _) = mapped_root();
        let a = root.create_layer(Size::new(8, 8), true);
        let b = root.create_layer(Size::new(8, 8), true);
        root.replace_layers(&[a, b]);
        root.drain_main_thread();

        root.replace_layers(&[b]);
        assert!(!root.layer(a).unwrap().is_mapped());
        assert!(!root.is_pending_map(a));
        assert_eq!(recorder.live_surfaces(), 2);
        assert_eq!(root.drain_main_thread(), vec![MainThreadEvent::Unmapped(a)]);

        // Removed layers can come back
        root.replace_layers(&[a, b]);
        assert!(root.layer(a).unwrap().is_mapped());
    }

    #[test]
    fn test_destroy_layer_defers_teardown() {
        let (_recorder, _ctx, mut root, _) = mapped_root();
        let layer = root.create_layer(Size::new(8, 8), true);
        root.set_layers([layer]);
        draw(&mut root, layer);
        root.commit_frame();
        root.drain_main_thread();

        assert!(root.destroy_layer(layer));
        assert!(!root.destroy_layer(layer));
        assert!(root.layers().is_empty());
        assert_eq!(root.pending_main_thread(), 1);
        assert_eq!(root.drain_main_thread(), vec![MainThreadEvent::Destroyed(layer)]);

        let reused = root.create_layer(Size::new(8, 8), true);
        assert!(root.layer(layer).is_none());
        assert!(root.layer(reused).is_some());
    }

    #[test]
    fn test_unmap_root_leaves_no_surfaces() {
        let (recorder, _ctx, mut root, _) = mapped_root();
        let layer = root.create_layer(Size::new(8, 8), true);
        root.set_layers([layer]);
        draw(&mut root, layer);
        root.commit_frame();

        root.unmap();
        assert_eq!(recorder.live_surfaces(), 0);
        assert!(root.is_pending_map(layer));
        assert_eq!(
            root.drain_main_thread(),
            vec![
                MainThreadEvent::Mapped(layer),
                MainThreadEvent::Unmapped(layer),
                MainThreadEvent::RootUnmapped,
            ]
        );

        drop(root);
        assert_eq!(recorder.live_objects(), 0);
    }

    #[test]
    fn test_clipped_out_layer_is_hidden() {
        let (recorder, _ctx, mut root, _) = mapped_root();
        let layer = root.create_layer(Size::new(16, 16), true);
        root.set_layers([layer]);
        root.commit_frame();
        assert_eq!(recorder.live_surfaces(), 2);

        root.layer_mut(layer)
            .unwrap()
            .set_clip(Some(Rect::new(100, 100, 10, 10)));
        root.commit_frame();
        assert!(root.is_pending_map(layer));
        assert_eq!(recorder.live_surfaces(), 1);

        root.layer_mut(layer).unwrap().set_clip(None);
        root.commit_frame();
        assert!(!root.is_pending_map(layer));
        assert_eq!(recorder.live_surfaces(), 2);
    }

    #[test]
    fn test_preferred_scale_applies_next_frame() {
        let (recorder, _ctx, mut root, _) = mapped_root();
        let layer = root.create_layer(Size::new(30, 30), true);
        root.set_layers([layer]);
        root.layer_mut(layer).unwrap().set_position(Point::new(30, 60));
        root.commit_frame();

        assert!(recorder.send_fractional_scale(root_proto(&root), 180));
        assert_eq!(
            root.poll_events(),
            vec![RootEvent::ScaleChanged(Scale::Fractional(1.5))]
        );
        assert_eq!(root.scale(), Scale::default());

        root.commit_frame();
        assert_eq!(root.scale(), Scale::Fractional(1.5));
        let subsurface = root.layer(layer).unwrap().surface().lock().subsurface().unwrap();
        assert_eq!(recorder.position(subsurface), Some(Point::new(20, 40)));
    }

    #[test]
    fn test_emulated_frames_before_map() {
        let (_recorder, ctx) = testing::recording_context();
        let mut root = LayerRoot::new(&ctx);
        root.request_frame_callback(FrameCallbackKind::Persistent, true);
        let deadline = root.next_deadline().unwrap();

        let events = root.poll_events_at(deadline + Duration::from_millis(1));
        assert!(matches!(
            events.as_slice(),
            [RootEvent::Frame { emulated: true, .. }]
        ));
        assert_eq!(root.stats().emulated_frames, 1);
        assert!(root.next_deadline().is_some());
    }

    #[test]
    fn test_root_ready_after_parent_frame() {
        let (recorder, _ctx, mut root, toplevel) = mapped_root();
        assert!(recorder.fire_frame(toplevel) >= 1);
        assert_eq!(root.poll_events(), vec![RootEvent::Ready]);
        assert!(root.surface().lock().is_ready());
    }

    #[test]
    fn test_main_thread_events_arrive_in_order() {
        let (_recorder, _ctx, mut root, toplevel) = mapped_root();
        let a = root.create_layer(Size::new(8, 8), true);
        let b = root.create_layer(Size::new(8, 8), true);
        root.replace_layers(&[a, b]);
        assert_eq!(
            root.drain_main_thread(),
            vec![MainThreadEvent::Mapped(a), MainThreadEvent::Mapped(b)]
        );
        assert!(root.drain_main_thread().is_empty());

        root.replace_layers(&[b]);
        assert!(root.destroy_layer(b));
        root.unmap();
        assert_eq!(
            root.drain_main_thread(),
            vec![
                MainThreadEvent::Unmapped(a),
                MainThreadEvent::Destroyed(b),
                MainThreadEvent::RootUnmapped,
            ]
        );

        // Hidden and shown again before the drain: both are reported
        assert!(root.map(toplevel, Point::ORIGIN, Size::new(200, 200)));
        root.replace_layers(&[a]);
        root.layer_mut(a).unwrap().set_opacity(0.0);
        root.commit_frame();
        root.layer_mut(a).unwrap().set_opacity(1.0);
        root.commit_frame();
        assert_eq!(
            root.drain_main_thread(),
            vec![
                MainThreadEvent::Mapped(a),
                MainThreadEvent::Unmapped(a),
                MainThreadEvent::Mapped(a),
            ]
        );
    }

    #[test]
    fn test_shown_again_layer_waits_for_release_of_front() {
        let (recorder, _ctx, mut root, _) = mapped_root();
        recorder.set_auto_release(false);
        let layer = root.create_layer(Size::new(16, 16), true);
        root.set_layers([layer]);
        draw(&mut root, layer);
        root.commit_frame();
        let front = root.layer(layer).unwrap().front().unwrap().proto().unwrap();

        // Hide, the compositor keeps the front for the destroyed surface
        root.layer_mut(layer)
            .unwrap()
            .set_clip(Some(Rect::new(100, 100, 10, 10)));
        root.commit_frame();
        assert!(root.layer(layer).unwrap().front().unwrap().is_orphaned());
        assert!(!root.layer(layer).unwrap().front().unwrap().can_recycle());

        // Shown again before the release arrived: nothing is attached
        root.layer_mut(layer).unwrap().set_clip(None);
        root.commit_frame();
        let surface = proto_of(&root, layer).unwrap();
        assert_eq!(recorder.attached_buffer(surface), None);

        // The late release frees it, the next frame attaches it
        assert!(recorder.release_buffer(front));
        root.poll_events();
        root.commit_frame();
        assert_eq!(recorder.attached_buffer(surface), Some(front));
        assert!(root.layer(layer).unwrap().front().unwrap().is_attached());

        // The displayed front is never handed out for drawing
        let next = root
            .with_layer(layer, |layer| layer.next_buffer().unwrap().proto())
            .unwrap();
        assert_ne!(next, Some(front));
    }

    #[test]
    fn test_layer_root_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<LayerRoot>();
    }

    #[test]
    fn test_random_interleavings_never_drop_attached_buffers() {
        for seed in 0..24u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let (recorder, ctx) = testing::recording_context();
            recorder.set_auto_release(rng.gen_bool(0.5));
            let toplevel = recorder.create_toplevel();
            let mut root = LayerRoot::new(&ctx);
            let mut ids: Vec<LayerId> = Vec::new();

            for _ in 0..200 {
                match rng.gen_range(0..10) {
                    0 => {
                        if root.is_mapped() {
                            root.unmap();
                        } else {
                            root.map(toplevel, Point::ORIGIN, Size::new(128, 128));
                        }
                    }
                    1 if ids.len() < 6 => {
                        let size = Size::new(rng.gen_range(1..48), rng.gen_range(1..48));
                        ids.push(root.create_layer(size, rng.gen_bool(0.5)));
                    }
                    2 if !ids.is_empty() => {
                        let id = ids.swap_remove(rng.gen_range(0..ids.len()));
                        assert!(root.destroy_layer(id));
                    }
                    3 => {
                        let mut list: Vec<LayerId> =
                            ids.iter().copied().filter(|_| rng.gen_bool(0.7)).collect();
                        for i in (1..list.len()).rev() {
                            list.swap(i, rng.gen_range(0..=i));
                        }
                        root.replace_layers(&list);
                        assert_eq!(root.layers(), list.as_slice());
                    }
                    4 if !ids.is_empty() => {
                        let id = ids[rng.gen_range(0..ids.len())];
                        draw(&mut root, id);
                    }
                    5 => {
                        root.commit_frame();
                    }
                    6 => {
                        let created: Vec<ProtoId> = recorder
                            .requests()
                            .iter()
                            .filter_map(|r| match r {
                                Request::CreateBuffer { buffer, .. } => Some(*buffer),
                                _ => None,
                            })
                            .collect();
                        if !created.is_empty() {
                            recorder.release_buffer(created[rng.gen_range(0..created.len())]);
                        }
                    }
                    7 => {
                        root.poll_events();
                    }
                    8 => {
                        let events = root.drain_main_thread();
                        assert!(events.iter().all(|event| match event {
                            MainThreadEvent::Destroyed(id) => root.layer(*id).is_none(),
                            _ => true,
                        }));
                    }
                    _ => {
                        if let Some(surface) = root.surface().lock().proto() {
                            recorder.fire_frame(surface);
                        }
                        if !ids.is_empty() {
                            let id = ids[rng.gen_range(0..ids.len())];
                            root.with_layer(id, |layer| {
                                layer.set_position(Point::new(rng.gen_range(-8..64), rng.gen_range(-8..64)));
                            });
                        }
                    }
                }

                for id in root.layers() {
                    let layer = root.layer(*id).unwrap();
                    assert_eq!(layer.is_mapped(), root.is_mapped() && !layer.pending_map);
                }
                let root_surface = root.surface().lock().proto();
                if let Some(root_surface) = root_surface {
                    let expected: Vec<ProtoId> = root
                        .layers()
                        .iter()
                        .filter_map(|id| proto_of(&root, *id))
                        .collect();
                    assert_eq!(recorder.stacking(root_surface), expected, "seed {}", seed);
                }
            }

            root.unmap();
            root.drain_main_thread();
            drop(root);
            assert_eq!(recorder.live_objects(), 0, "seed {}", seed);
        }
    }
}
