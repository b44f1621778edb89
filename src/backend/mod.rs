//! Backend module
//!
//! Event loop integration with calloop.

pub mod event_loop;

pub use event_loop::EventLoop;
