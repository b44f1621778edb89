//! Waylayer - client-side Wayland surface and layer management
//!
//! Waylayer keeps a tree of sub-surfaces under a toolkit-owned surface and
//! manages everything that comes with it: protocol object lifetimes,
//! pending versus committed state, buffer attach and release, frame
//! callbacks, fractional scaling and GPU buffer sharing.
//!
//! # Architecture
//!
//! - **Protocol Layer**: [`protocol::WireProtocol`] with a `wayland-client`
//!   implementation and an in-memory recording one for tests
//! - **Surfaces**: [`surface::SurfaceHandle`] wraps one `wl_surface` +
//!   `wl_subsurface` pair with a lock-guarded state machine
//! - **Buffers**: [`buffer::BufferObject`] over shared memory or dma-buf
//!   backed [`gpu::GpuSurface`]s
//! - **Layers**: [`layer::LayerRoot`] maps an ordered list of
//!   [`layer::Layer`]s and commits them as one frame
//!
//! # Example
//!
//! ```no_run
//! use waylayer::config::Config;
//! use waylayer::context::DisplayContext;
//! use waylayer::geometry::{Point, Size};
//! use waylayer::layer::LayerRoot;
//! use waylayer::protocol::WaylandProtocol;
//!
//! let (protocol, _queue) = WaylandProtocol::connect()?;
//! let toplevel = protocol.create_toplevel("waylayer").ok_or("no xdg_wm_base")?;
//! let ctx = DisplayContext::init(protocol, None, Config::from_env());
//!
//! let mut root = LayerRoot::new(&ctx);
//! let layer = root.create_layer(Size::new(64, 64), true);
//! root.set_layers([layer]);
//! root.map(toplevel, Point::ORIGIN, Size::new(256, 256));
//! root.commit_frame();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backend;
pub mod buffer;
pub mod config;
pub mod context;
pub mod geometry;
pub mod gpu;
pub mod layer;
pub mod protocol;
pub mod surface;

#[cfg(test)]
mod testing;
