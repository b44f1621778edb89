//! Waylayer demo
//!
//! Opens an xdg toplevel, maps a layer root under it and animates two
//! layers until the window is closed.

use std::io;
use std::sync::Arc;

use anyhow::Context;
use calloop::LoopSignal;
use log::{debug, info, warn};
use wayland_client::backend::WaylandError;

use waylayer::backend::EventLoop;
use waylayer::buffer::BufferObject;
use waylayer::config::Config;
use waylayer::context::DisplayContext;
use waylayer::geometry::{Point, Rect, Size};
use waylayer::layer::{LayerId, LayerRoot, RootEvent};
use waylayer::protocol::{Fourcc, ProtoId, WaylandProtocol, WaylandQueue, WireProtocol};
use waylayer::surface::FrameCallbackKind;

const DEFAULT_SIZE: Size = Size {
    width: 640,
    height: 480,
};

struct Demo {
    queue: WaylandQueue,
    ctx: Arc<DisplayContext>,
    toplevel: ProtoId,
    background: Option<BufferObject>,
    root: LayerRoot,
    layers: [LayerId; 2],
    size: Size,
    frame: u64,
    needs_draw: bool,
    signal: LoopSignal,
}

impl Demo {
    /// One frame tick, false once the window is gone
    fn tick(&mut self) -> bool {
        if self.queue.state().toplevel_closed() {
            info!("Toplevel closed, exiting");
            self.signal.stop();
            return false;
        }

        let size = self.queue.state().toplevel_size().unwrap_or(self.size);
        if size != self.size && !size.is_empty() {
            debug!("Toplevel resized to {}x{}", size.width, size.height);
            self.size = size;
            self.attach_background();
            self.root.resize(size);
        }

        for event in self.root.poll_events() {
            match event {
                RootEvent::Frame { .. } => self.needs_draw = true,
                RootEvent::Ready => debug!("Layer root ready"),
                RootEvent::ScaleChanged(scale) => info!("Preferred scale {:?}", scale),
            }
        }

        if std::mem::take(&mut self.needs_draw) {
            self.frame += 1;
            self.draw();
            self.root.commit_frame();
        }
        for event in self.root.drain_main_thread() {
            debug!("Main thread: {:?}", event);
        }

        if !self.ctx.protocol().flush() {
            warn!("Connection lost");
            self.signal.stop();
            return false;
        }
        true
    }

    fn draw(&mut self) {
        let t = self.frame as f64 / 60.0;
        let span = Point::new(self.size.width - 128, self.size.height - 128);
        let orbit = |phase: f64| {
            let x = (t + phase).sin() * 0.5 + 0.5;
            let y = (t * 1.3 + phase).cos() * 0.5 + 0.5;
            Point::new((x * span.x as f64) as i32, (y * span.y as f64) as i32)
        };
        let positions = [orbit(0.0), orbit(2.0)];
        let colors = [0xff2a_7ab0u32, 0xc0d0_6020];

        for ((id, position), color) in self.layers.iter().zip(positions).zip(colors) {
            let drawn = self.root.with_layer(*id, |layer| {
                layer.set_position(position);
                let size = layer.size();
                match layer.next_buffer() {
                    Ok(buffer) => match buffer.lock() {
                        Ok(mut target) => {
                            target.fill(color);
                            target.fill_rect(Rect::new(8, 8, size.width - 16, 8), 0xffff_ffff);
                        }
                        Err(e) => warn!("Failed to map layer buffer: {}", e),
                    },
                    Err(e) => {
                        warn!("Failed to get layer buffer: {}", e);
                        return false;
                    }
                }
                layer.notify_draw_complete()
            });
            if drawn != Some(true) {
                debug!("Layer {:?} not drawn this frame", id);
            }
        }
    }

    /// Fill the toplevel with a solid buffer of the current size
    fn attach_background(&mut self) {
        let mut buffer = match BufferObject::create_shm(&self.ctx, self.size, Fourcc::XRGB8888) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!("Failed to allocate background: {}", e);
                return;
            }
        };
        if let Ok(mut target) = buffer.lock() {
            target.fill(0xff20_2024);
        }
        let protocol = self.ctx.protocol();
        protocol.attach(self.toplevel, buffer.proto());
        protocol.damage_buffer(self.toplevel, Rect::from_origin_size(Point::ORIGIN, self.size));
        protocol.commit(self.toplevel);
        self.background = Some(buffer);
    }
}

fn to_io(e: WaylandError) -> io::Error {
    match e {
        WaylandError::Io(e) => e,
        e => io::Error::other(e),
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env();
    let frame_interval = config.frame_interval;

    let (protocol, mut queue) = WaylandProtocol::connect().context("Failed to connect to compositor")?;
    let toplevel = protocol
        .create_toplevel("waylayer demo")
        .context("Compositor does not support xdg_wm_base")?;
    while !queue.state().toplevel_configured() {
        queue.blocking_dispatch().context("Failed waiting for configure")?;
    }
    let size = queue
        .state()
        .toplevel_size()
        .filter(|size| !size.is_empty())
        .unwrap_or(DEFAULT_SIZE);
    info!("Toplevel configured at {}x{}", size.width, size.height);

    let ctx = DisplayContext::init(protocol.clone(), None, config);
    let mut root = LayerRoot::new(&ctx);
    let layers = [
        root.create_layer(Size::new(128, 128), true),
        root.create_layer(Size::new(160, 96), false),
    ];
    root.with_layer(layers[1], |layer| layer.set_opacity(0.75));
    root.set_layers(layers);

    let mut event_loop = EventLoop::<Demo>::new()?;
    let mut demo = Demo {
        queue,
        ctx: ctx.clone(),
        toplevel,
        background: None,
        root,
        layers,
        size,
        frame: 0,
        needs_draw: true,
        signal: event_loop.signal(),
    };
    demo.attach_background();
    if !demo.root.map(toplevel, Point::ORIGIN, size) {
        anyhow::bail!("Failed to map layer root");
    }
    demo.root.request_frame_callback(FrameCallbackKind::Persistent, true);

    event_loop.insert_connection(protocol.connection(), |demo: &mut Demo| {
        demo.queue.read_and_dispatch().map(|_| ()).map_err(to_io)
    })?;
    event_loop.insert_tick(frame_interval, |demo: &mut Demo| demo.tick())?;
    event_loop.run(&mut demo)?;

    demo.root.unmap();
    demo.root.drain_main_thread();
    let Demo {
        root, background, ..
    } = demo;
    drop(root);
    drop(background);
    protocol.destroy_toplevel(toplevel);
    ctx.shutdown();
    Ok(())
}
