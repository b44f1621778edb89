//! `wayland-client` implementation of the wire protocol
//!
//! The protocol object is shared by every surface and buffer; the event
//! queue and its dispatch state stay with the thread that pumps the
//! connection (see [`WaylandQueue`]). Events never call back into surfaces:
//! they are pushed to the inbox or release tracker stored as proxy user data.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::os::fd::BorrowedFd;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, trace, warn};
use wayland_client::backend::{ReadEventsGuard, WaylandError};
use wayland_client::globals::{registry_queue_init, BindError, GlobalError, GlobalList, GlobalListContents};
use wayland_client::protocol::{
    wl_buffer::{self, WlBuffer},
    wl_callback::{self, WlCallback},
    wl_compositor::WlCompositor,
    wl_output,
    wl_region::WlRegion,
    wl_registry::{self, WlRegistry},
    wl_shm::{self, WlShm},
    wl_shm_pool::WlShmPool,
    wl_subcompositor::WlSubcompositor,
    wl_subsurface::WlSubsurface,
    wl_surface::{self, WlSurface},
};
use wayland_client::{
    delegate_noop, Connection, Dispatch, DispatchError, EventQueue, Proxy, QueueHandle, WEnum,
};
use wayland_protocols::wp::fractional_scale::v1::client::{
    wp_fractional_scale_manager_v1::WpFractionalScaleManagerV1,
    wp_fractional_scale_v1::{self, WpFractionalScaleV1},
};
use wayland_protocols::wp::linux_dmabuf::zv1::client::{
    zwp_linux_buffer_params_v1::{self, ZwpLinuxBufferParamsV1},
    zwp_linux_dmabuf_v1::{self, ZwpLinuxDmabufV1},
};
use wayland_protocols::wp::viewporter::client::{wp_viewport::WpViewport, wp_viewporter::WpViewporter};
use wayland_protocols::xdg::shell::client::{
    xdg_surface::{self, XdgSurface},
    xdg_toplevel::{self, XdgToplevel},
    xdg_wm_base::{self, XdgWmBase},
};

use super::{
    BufferTransform, DmabufPlane, Fourcc, FormatTable, ProtoId, ShmBufferParams, WireProtocol,
    DRM_FORMAT_MOD_INVALID,
};
use crate::buffer::ReleaseTracker;
use crate::geometry::{Point, Rect, RectF, Size};
use crate::surface::{FrameTag, SurfaceEvent, SurfaceInbox, WeakInbox};

/// Failure to set up the compositor connection
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("failed to connect to the compositor: {0}")]
    Connect(#[from] wayland_client::ConnectError),
    #[error("failed to read compositor globals: {0}")]
    Globals(#[from] GlobalError),
    #[error("compositor does not provide {interface}: {source}")]
    MissingGlobal {
        interface: &'static str,
        #[source]
        source: BindError,
    },
    #[error("initial roundtrip failed: {0}")]
    Roundtrip(#[from] DispatchError),
}

/// Event dispatch state for the connection's queue
#[derive(Debug, Default)]
pub struct WaylandDispatch {
    formats: Arc<Mutex<FormatTable>>,
    toplevel_closed: bool,
    toplevel_configured: bool,
    toplevel_size: Option<Size>,
}

impl WaylandDispatch {
    /// The user asked to close the demo toplevel
    pub fn toplevel_closed(&self) -> bool {
        self.toplevel_closed
    }

    /// The toplevel received its first configure
    pub fn toplevel_configured(&self) -> bool {
        self.toplevel_configured
    }

    /// Size suggested by the last toplevel configure, if any
    pub fn toplevel_size(&self) -> Option<Size> {
        self.toplevel_size
    }
}

/// The connection's event queue with its dispatch state
///
/// Owned by the thread that reads the socket.
pub struct WaylandQueue {
    queue: EventQueue<WaylandDispatch>,
    state: WaylandDispatch,
}

impl fmt::Debug for WaylandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaylandQueue")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl WaylandQueue {
    /// Run handlers for events already read from the socket
    pub fn dispatch_pending(&mut self) -> Result<usize, DispatchError> {
        self.queue.dispatch_pending(&mut self.state)
    }

    /// Flush, block for new events and dispatch them
    pub fn blocking_dispatch(&mut self) -> Result<usize, DispatchError> {
        self.queue.blocking_dispatch(&mut self.state)
    }

    pub fn roundtrip(&mut self) -> Result<usize, DispatchError> {
        self.queue.roundtrip(&mut self.state)
    }

    pub fn flush(&self) -> Result<(), WaylandError> {
        self.queue.flush()
    }

    /// Start a socket read; `None` means queued events must be dispatched
    /// first
    pub fn prepare_read(&self) -> Option<ReadEventsGuard> {
        self.queue.prepare_read()
    }

    /// Read whatever the socket has and dispatch it, without blocking
    pub fn read_and_dispatch(&mut self) -> Result<usize, WaylandError> {
        if let Some(guard) = self.queue.prepare_read() {
            match guard.read() {
                Ok(_) => {}
                Err(WaylandError::Io(e)) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        self.queue
            .dispatch_pending(&mut self.state)
            .map_err(|e| match e {
                DispatchError::Backend(e) => e,
                DispatchError::BadMessage { .. } => {
                    WaylandError::Io(std::io::Error::new(ErrorKind::InvalidData, e.to_string()))
                }
            })
    }

    pub fn state(&self) -> &WaylandDispatch {
        &self.state
    }
}

/// Proxies behind the [`ProtoId`]s handed out so far
#[derive(Default)]
struct Objects {
    surfaces: HashMap<ProtoId, WlSurface>,
    subsurfaces: HashMap<ProtoId, WlSubsurface>,
    viewports: HashMap<ProtoId, WpViewport>,
    fractional: HashMap<ProtoId, WpFractionalScaleV1>,
    buffers: HashMap<ProtoId, WlBuffer>,
    toplevels: HashMap<ProtoId, (XdgSurface, XdgToplevel)>,
}

/// Bound globals
struct Globals {
    compositor: WlCompositor,
    subcompositor: WlSubcompositor,
    shm: WlShm,
    viewporter: Option<WpViewporter>,
    fractional: Option<WpFractionalScaleManagerV1>,
    dmabuf: Option<ZwpLinuxDmabufV1>,
    wm_base: Option<XdgWmBase>,
}

/// Client connection to a real compositor
pub struct WaylandProtocol {
    connection: Connection,
    qh: QueueHandle<WaylandDispatch>,
    globals: Globals,
    objects: Mutex<Objects>,
    formats: Arc<Mutex<FormatTable>>,
}

impl fmt::Debug for WaylandProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaylandProtocol")
            .field("viewporter", &self.globals.viewporter.is_some())
            .field("fractional_scale", &self.globals.fractional.is_some())
            .field("dmabuf", &self.globals.dmabuf.is_some())
            .finish_non_exhaustive()
    }
}

impl WaylandProtocol {
    /// Connect using `WAYLAND_DISPLAY` / `WAYLAND_SOCKET`
    pub fn connect() -> Result<(Arc<Self>, WaylandQueue), ConnectError> {
        let connection = Connection::connect_to_env()?;
        Self::from_connection(connection)
    }

    /// Bind the globals of an existing connection and collect formats
    pub fn from_connection(connection: Connection) -> Result<(Arc<Self>, WaylandQueue), ConnectError> {
        let (global_list, queue) = registry_queue_init::<WaylandDispatch>(&connection)?;
        let qh = queue.handle();
        let formats = Arc::new(Mutex::new(FormatTable::new()));

        let globals = Globals {
            compositor: bind_required(&global_list, &qh, 4..=6, "wl_compositor")?,
            subcompositor: bind_required(&global_list, &qh, 1..=1, "wl_subcompositor")?,
            shm: bind_required(&global_list, &qh, 1..=1, "wl_shm")?,
            viewporter: global_list.bind(&qh, 1..=1, ()).ok(),
            fractional: global_list.bind(&qh, 1..=1, ()).ok(),
            // Version 3 still announces modifiers as plain events
            dmabuf: global_list.bind(&qh, 3..=3, ()).ok(),
            wm_base: global_list.bind(&qh, 1..=5, ()).ok(),
        };

        let mut queue = WaylandQueue {
            queue,
            state: WaylandDispatch {
                formats: formats.clone(),
                ..Default::default()
            },
        };
        // Collect wl_shm and dma-buf format announcements
        queue.roundtrip()?;

        let protocol = Arc::new(Self {
            connection,
            qh,
            globals,
            objects: Mutex::new(Objects::default()),
            formats,
        });
        info!("Connected to compositor: {:?}", protocol);
        Ok((protocol, queue))
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn objects(&self) -> MutexGuard<'_, Objects> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn surface(&self, id: ProtoId) -> Option<WlSurface> {
        let surface = self.objects().surfaces.get(&id).cloned();
        if surface.is_none() {
            warn!("Request on unknown surface {:?}", id);
        }
        surface
    }

    fn subsurface(&self, id: ProtoId) -> Option<WlSubsurface> {
        let subsurface = self.objects().subsurfaces.get(&id).cloned();
        if subsurface.is_none() {
            warn!("Request on unknown subsurface {:?}", id);
        }
        subsurface
    }

    /// Register a surface created by the toolkit so layers can be parented
    /// to it
    ///
    /// Its events stay with whoever created it.
    pub fn adopt_surface(&self, surface: &WlSurface) -> ProtoId {
        let mut objects = self.objects();
        if let Some((id, _)) = objects.surfaces.iter().find(|(_, s)| *s == surface) {
            return *id;
        }
        let id = ProtoId::next();
        objects.surfaces.insert(id, surface.clone());
        debug!("Adopted surface {:?} as {:?}", surface.id(), id);
        id
    }

    /// Create an xdg toplevel to host a layer tree
    ///
    /// Returns `None` without `xdg_wm_base`.
    pub fn create_toplevel(&self, title: &str) -> Option<ProtoId> {
        let wm_base = self.globals.wm_base.as_ref()?;
        let surface = self
            .globals
            .compositor
            .create_surface(&self.qh, WeakInbox::default());
        let xdg_surface = wm_base.get_xdg_surface(&surface, &self.qh, ());
        let toplevel = xdg_surface.get_toplevel(&self.qh, ());
        toplevel.set_title(title.to_string());
        surface.commit();

        let id = ProtoId::next();
        let mut objects = self.objects();
        objects.surfaces.insert(id, surface);
        objects.toplevels.insert(id, (xdg_surface, toplevel));
        debug!("Created toplevel {:?} ({})", id, title);
        Some(id)
    }

    /// Tear down a toplevel created by [`create_toplevel`](Self::create_toplevel)
    pub fn destroy_toplevel(&self, id: ProtoId) {
        let mut objects = self.objects();
        if let Some((xdg_surface, toplevel)) = objects.toplevels.remove(&id) {
            toplevel.destroy();
            xdg_surface.destroy();
        }
        if let Some(surface) = objects.surfaces.remove(&id) {
            surface.destroy();
        }
        debug!("Destroyed toplevel {:?}", id);
    }

    fn region(&self, rect: Rect) -> WlRegion {
        let region = self.globals.compositor.create_region(&self.qh, ());
        if !rect.is_empty() {
            region.add(rect.x, rect.y, rect.width, rect.height);
        }
        region
    }
}

fn bind_required<I>(
    globals: &GlobalList,
    qh: &QueueHandle<WaylandDispatch>,
    version: std::ops::RangeInclusive<u32>,
    interface: &'static str,
) -> Result<I, ConnectError>
where
    I: Proxy + 'static,
    WaylandDispatch: Dispatch<I, ()>,
{
    globals
        .bind(qh, version, ())
        .map_err(|source| ConnectError::MissingGlobal { interface, source })
}

fn to_wl_transform(transform: BufferTransform) -> wl_output::Transform {
    match transform {
        BufferTransform::Normal => wl_output::Transform::Normal,
        BufferTransform::Flipped180 => wl_output::Transform::Flipped180,
    }
}

impl WireProtocol for WaylandProtocol {
    fn create_surface(&self, inbox: &SurfaceInbox) -> Option<ProtoId> {
        let surface = self
            .globals
            .compositor
            .create_surface(&self.qh, inbox.downgrade());
        let id = ProtoId::next();
        trace!("wl_surface {:?} is {:?}", surface.id(), id);
        self.objects().surfaces.insert(id, surface);
        Some(id)
    }

    fn create_subsurface(&self, surface: ProtoId, parent: ProtoId) -> Option<ProtoId> {
        let child = self.surface(surface)?;
        let parent = self.surface(parent)?;
        let subsurface = self
            .globals
            .subcompositor
            .get_subsurface(&child, &parent, &self.qh, ());
        let id = ProtoId::next();
        self.objects().subsurfaces.insert(id, subsurface);
        Some(id)
    }

    fn destroy_subsurface(&self, subsurface: ProtoId) {
        if let Some(subsurface) = self.objects().subsurfaces.remove(&subsurface) {
            subsurface.destroy();
        }
    }

    fn destroy_surface(&self, surface: ProtoId) {
        if let Some(surface) = self.objects().surfaces.remove(&surface) {
            surface.destroy();
        }
    }

    fn set_position(&self, subsurface: ProtoId, position: Point) {
        if let Some(subsurface) = self.subsurface(subsurface) {
            subsurface.set_position(position.x, position.y);
        }
    }

    fn place_above(&self, subsurface: ProtoId, sibling_surface: ProtoId) {
        if let (Some(subsurface), Some(sibling)) =
            (self.subsurface(subsurface), self.surface(sibling_surface))
        {
            subsurface.place_above(&sibling);
        }
    }

    fn set_desync(&self, subsurface: ProtoId) {
        if let Some(subsurface) = self.subsurface(subsurface) {
            subsurface.set_desync();
        }
    }

    fn attach(&self, surface: ProtoId, buffer: Option<ProtoId>) {
        let Some(wl_surface) = self.surface(surface) else {
            return;
        };
        let wl_buffer = buffer.and_then(|id| self.objects().buffers.get(&id).cloned());
        if buffer.is_some() && wl_buffer.is_none() {
            warn!("Attach of unknown buffer {:?} to {:?}", buffer, surface);
            return;
        }
        wl_surface.attach(wl_buffer.as_ref(), 0, 0);
    }

    fn damage_buffer(&self, surface: ProtoId, rect: Rect) {
        if let Some(surface) = self.surface(surface) {
            surface.damage_buffer(rect.x, rect.y, rect.width, rect.height);
        }
    }

    fn set_buffer_scale(&self, surface: ProtoId, scale: i32) {
        if let Some(surface) = self.surface(surface) {
            surface.set_buffer_scale(scale);
        }
    }

    fn set_buffer_transform(&self, surface: ProtoId, transform: BufferTransform) {
        if let Some(surface) = self.surface(surface) {
            surface.set_buffer_transform(to_wl_transform(transform));
        }
    }

    fn set_opaque_region(&self, surface: ProtoId, region: Option<Rect>) {
        let Some(surface) = self.surface(surface) else {
            return;
        };
        match region {
            Some(rect) => {
                let region = self.region(rect);
                surface.set_opaque_region(Some(&region));
                region.destroy();
            }
            None => surface.set_opaque_region(None),
        }
    }

    fn set_empty_input_region(&self, surface: ProtoId) {
        if let Some(surface) = self.surface(surface) {
            let region = self.region(Rect::default());
            surface.set_input_region(Some(&region));
            region.destroy();
        }
    }

    fn request_frame(&self, surface: ProtoId, inbox: WeakInbox, tag: FrameTag) -> bool {
        match self.surface(surface) {
            Some(surface) => {
                surface.frame(&self.qh, (inbox, tag));
                true
            }
            None => false,
        }
    }

    fn commit(&self, surface: ProtoId) {
        if let Some(surface) = self.surface(surface) {
            surface.commit();
        }
    }

    fn create_viewport(&self, surface: ProtoId) -> Option<ProtoId> {
        let viewporter = self.globals.viewporter.as_ref()?;
        let surface = self.surface(surface)?;
        let viewport = viewporter.get_viewport(&surface, &self.qh, ());
        let id = ProtoId::next();
        self.objects().viewports.insert(id, viewport);
        Some(id)
    }

    fn set_viewport(&self, viewport: ProtoId, source: Option<RectF>, destination: Option<Size>) {
        let Some(viewport) = self.objects().viewports.get(&viewport).cloned() else {
            return;
        };
        match source {
            Some(src) => viewport.set_source(src.x, src.y, src.width, src.height),
            None => viewport.set_source(-1.0, -1.0, -1.0, -1.0),
        }
        match destination {
            Some(dst) => viewport.set_destination(dst.width, dst.height),
            None => viewport.set_destination(-1, -1),
        }
    }

    fn destroy_viewport(&self, viewport: ProtoId) {
        if let Some(viewport) = self.objects().viewports.remove(&viewport) {
            viewport.destroy();
        }
    }

    fn create_fractional_scale(&self, surface: ProtoId, inbox: &SurfaceInbox) -> Option<ProtoId> {
        let manager = self.globals.fractional.as_ref()?;
        let surface = self.surface(surface)?;
        let fractional = manager.get_fractional_scale(&surface, &self.qh, inbox.downgrade());
        let id = ProtoId::next();
        self.objects().fractional.insert(id, fractional);
        Some(id)
    }

    fn destroy_fractional_scale(&self, fractional: ProtoId) {
        if let Some(fractional) = self.objects().fractional.remove(&fractional) {
            fractional.destroy();
        }
    }

    fn create_shm_buffer(
        &self,
        params: ShmBufferParams<'_>,
        release: &Arc<ReleaseTracker>,
    ) -> Option<ProtoId> {
        if let Err(e) = params.layout.validate(params.pool_size) {
            warn!("Rejected shm buffer layout: {}", e);
            return None;
        }
        let format = match wl_shm::Format::try_from(params.layout.format.to_wayland()) {
            Ok(format) => format,
            Err(()) => {
                warn!("Unknown shm format {:?}", params.layout.format);
                return None;
            }
        };
        let pool_size = i32::try_from(params.pool_size).ok()?;
        let layout = params.layout;
        let pool: WlShmPool = self
            .globals
            .shm
            .create_pool(params.fd, pool_size, &self.qh, ());
        let buffer = pool.create_buffer(
            layout.offset as i32,
            layout.size.width,
            layout.size.height,
            layout.stride as i32,
            format,
            &self.qh,
            release.clone(),
        );
        // The buffer keeps the pool's memory alive
        pool.destroy();

        let id = ProtoId::next();
        self.objects().buffers.insert(id, buffer);
        debug!("Created shm wl_buffer {:?} for {:?}", id, release.buffer());
        Some(id)
    }

    fn create_dmabuf_buffer(
        &self,
        planes: &[DmabufPlane<'_>],
        size: Size,
        fourcc: Fourcc,
        release: &Arc<ReleaseTracker>,
    ) -> Option<ProtoId> {
        let dmabuf = self.globals.dmabuf.as_ref()?;
        let params = dmabuf.create_params(&self.qh, ());
        for (index, plane) in planes.iter().enumerate() {
            let fd: BorrowedFd<'_> = plane.fd;
            params.add(
                fd,
                index as u32,
                plane.offset,
                plane.stride,
                (plane.modifier >> 32) as u32,
                (plane.modifier & 0xffff_ffff) as u32,
            );
        }
        let buffer = params.create_immed(
            size.width,
            size.height,
            fourcc.0,
            zwp_linux_buffer_params_v1::Flags::empty(),
            &self.qh,
            release.clone(),
        );
        params.destroy();

        let id = ProtoId::next();
        self.objects().buffers.insert(id, buffer);
        debug!(
            "Created dmabuf wl_buffer {:?} for {:?} ({} planes)",
            id,
            release.buffer(),
            planes.len()
        );
        Some(id)
    }

    fn destroy_buffer(&self, buffer: ProtoId) {
        if let Some(buffer) = self.objects().buffers.remove(&buffer) {
            buffer.destroy();
        }
    }

    fn formats(&self) -> FormatTable {
        self.formats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn has_viewporter(&self) -> bool {
        self.globals.viewporter.is_some()
    }

    fn has_fractional_scale(&self) -> bool {
        self.globals.fractional.is_some()
    }

    fn flush(&self) -> bool {
        match self.connection.flush() {
            Ok(()) => true,
            Err(e) => {
                warn!("Wayland flush failed: {}", e);
                false
            }
        }
    }
}

impl Dispatch<WlRegistry, GlobalListContents> for WaylandDispatch {
    fn event(
        _state: &mut Self,
        _registry: &WlRegistry,
        event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_registry::Event::GlobalRemove { name } = event {
            debug!("Global {} removed", name);
        }
    }
}

impl Dispatch<WlShm, ()> for WaylandDispatch {
    fn event(
        state: &mut Self,
        _shm: &WlShm,
        event: wl_shm::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_shm::Event::Format { format } = event {
            let raw = match format {
                WEnum::Value(format) => u32::from(format),
                WEnum::Unknown(raw) => raw,
            };
            trace!("wl_shm format {:#x}", raw);
            state.lock_formats().add_shm(raw);
        }
    }
}

impl Dispatch<ZwpLinuxDmabufV1, ()> for WaylandDispatch {
    fn event(
        state: &mut Self,
        _dmabuf: &ZwpLinuxDmabufV1,
        event: zwp_linux_dmabuf_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            zwp_linux_dmabuf_v1::Event::Format { format } => {
                state
                    .lock_formats()
                    .add_dmabuf(Fourcc(format), DRM_FORMAT_MOD_INVALID);
            }
            zwp_linux_dmabuf_v1::Event::Modifier {
                format,
                modifier_hi,
                modifier_lo,
            } => {
                let modifier = (u64::from(modifier_hi) << 32) | u64::from(modifier_lo);
                trace!("dmabuf format {:?} modifier {:#x}", Fourcc(format), modifier);
                state.lock_formats().add_dmabuf(Fourcc(format), modifier);
            }
            _ => {}
        }
    }
}

impl WaylandDispatch {
    fn lock_formats(&self) -> MutexGuard<'_, FormatTable> {
        self.formats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Dispatch<WlSurface, WeakInbox> for WaylandDispatch {
    fn event(
        _state: &mut Self,
        _surface: &WlSurface,
        event: wl_surface::Event,
        inbox: &WeakInbox,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_surface::Event::PreferredBufferScale { factor } = event {
            inbox.push(SurfaceEvent::PreferredScale(factor));
        }
    }
}

impl Dispatch<WlCallback, (WeakInbox, FrameTag)> for WaylandDispatch {
    fn event(
        _state: &mut Self,
        _callback: &WlCallback,
        event: wl_callback::Event,
        data: &(WeakInbox, FrameTag),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_callback::Event::Done { callback_data } = event {
            let (inbox, tag) = data;
            if !inbox.push(SurfaceEvent::FrameDone {
                tag: *tag,
                time: callback_data,
            }) {
                trace!("Frame callback for a destroyed surface");
            }
        }
    }
}

impl Dispatch<WlBuffer, Arc<ReleaseTracker>> for WaylandDispatch {
    fn event(
        _state: &mut Self,
        _buffer: &WlBuffer,
        event: wl_buffer::Event,
        release: &Arc<ReleaseTracker>,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            release.on_compositor_release();
        }
    }
}

impl Dispatch<WpFractionalScaleV1, WeakInbox> for WaylandDispatch {
    fn event(
        _state: &mut Self,
        _fractional: &WpFractionalScaleV1,
        event: wp_fractional_scale_v1::Event,
        inbox: &WeakInbox,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wp_fractional_scale_v1::Event::PreferredScale { scale } = event {
            inbox.push(SurfaceEvent::PreferredFractionalScale(scale));
        }
    }
}

impl Dispatch<XdgWmBase, ()> for WaylandDispatch {
    fn event(
        _state: &mut Self,
        wm_base: &XdgWmBase,
        event: xdg_wm_base::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            wm_base.pong(serial);
        }
    }
}

impl Dispatch<XdgSurface, ()> for WaylandDispatch {
    fn event(
        state: &mut Self,
        xdg_surface: &XdgSurface,
        event: xdg_surface::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            xdg_surface.ack_configure(serial);
            state.toplevel_configured = true;
        }
    }
}

impl Dispatch<XdgToplevel, ()> for WaylandDispatch {
    fn event(
        state: &mut Self,
        _toplevel: &XdgToplevel,
        event: xdg_toplevel::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            xdg_toplevel::Event::Configure { width, height, .. } => {
                if width > 0 && height > 0 {
                    state.toplevel_size = Some(Size::new(width, height));
                }
            }
            xdg_toplevel::Event::Close => {
                info!("Toplevel close requested");
                state.toplevel_closed = true;
            }
            _ => {}
        }
    }
}

delegate_noop!(WaylandDispatch: WlCompositor);
delegate_noop!(WaylandDispatch: WlSubcompositor);
delegate_noop!(WaylandDispatch: WlSubsurface);
delegate_noop!(WaylandDispatch: WlShmPool);
delegate_noop!(WaylandDispatch: WlRegion);
delegate_noop!(WaylandDispatch: WpViewporter);
delegate_noop!(WaylandDispatch: WpViewport);
delegate_noop!(WaylandDispatch: WpFractionalScaleManagerV1);
delegate_noop!(WaylandDispatch: ignore ZwpLinuxBufferParamsV1);
