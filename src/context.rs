//! Process-wide display context
//!
//! Everything that used to be per-display global state (the protocol
//! connection, the GPU allocator, configuration) is owned here and passed
//! explicitly to every constructor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::Config;
use crate::gpu::BufferAllocator;
use crate::protocol::{Fourcc, FormatTable, WireProtocol};

/// Shared connection state for surfaces, buffers and layers
#[derive(Debug)]
pub struct DisplayContext {
    protocol: Arc<dyn WireProtocol>,
    allocator: Option<Arc<dyn BufferAllocator>>,
    config: Config,
    shut_down: AtomicBool,
}

impl DisplayContext {
    /// Create the context
    ///
    /// `allocator` is the render backend's dma-buf allocator; without one
    /// only shared memory buffers are used.
    pub fn init(
        protocol: Arc<dyn WireProtocol>,
        allocator: Option<Arc<dyn BufferAllocator>>,
        config: Config,
    ) -> Arc<Self> {
        info!(
            "Display context initialized (dmabuf {}, viewporter {}, fractional scale {})",
            config.use_dmabuf && allocator.is_some(),
            protocol.has_viewporter(),
            protocol.has_fractional_scale()
        );
        Arc::new(Self {
            protocol,
            allocator,
            config,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn protocol(&self) -> &Arc<dyn WireProtocol> {
        &self.protocol
    }

    pub fn allocator(&self) -> Option<&dyn BufferAllocator> {
        self.allocator.as_deref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether new layers should get GPU buffers
    pub fn use_gpu_buffers(&self) -> bool {
        self.config.use_dmabuf && self.allocator.is_some()
    }

    /// Current compositor format table
    pub fn formats(&self) -> FormatTable {
        self.protocol.formats()
    }

    /// Pick a buffer format for opaque or translucent content
    pub fn negotiate_format(&self, opaque: bool, gpu: bool) -> Fourcc {
        let format = self.formats().negotiate(opaque, gpu);
        debug!(
            "Negotiated format {:?} (opaque {}, gpu {})",
            format, opaque, gpu
        );
        format
    }

    /// Explicit modifiers the compositor accepts for `fourcc`
    pub fn modifiers(&self, fourcc: Fourcc) -> Vec<u64> {
        self.formats().modifiers(fourcc)
    }

    /// Flush outstanding requests and stop accepting work
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.protocol.flush() {
            warn!("Connection lost before shutdown flush");
        }
        info!("Display context shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RecordingProtocol, DRM_FORMAT_MOD_LINEAR};

    #[test]
    fn test_negotiation_uses_protocol_formats() {
        let recorder = Arc::new(RecordingProtocol::new());
        recorder.advertise_shm(Fourcc::XRGB8888);
        recorder.advertise_dmabuf(Fourcc::ARGB8888, &[DRM_FORMAT_MOD_LINEAR]);
        let ctx = DisplayContext::init(recorder, None, Config::default());

        assert_eq!(ctx.negotiate_format(true, false), Fourcc::XRGB8888);
        assert_eq!(ctx.negotiate_format(true, true), Fourcc::ARGB8888);
        assert_eq!(ctx.modifiers(Fourcc::ARGB8888), vec![DRM_FORMAT_MOD_LINEAR]);
        assert!(!ctx.use_gpu_buffers());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let ctx = DisplayContext::init(Arc::new(RecordingProtocol::new()), None, Config::default());
        assert!(!ctx.is_shut_down());
        ctx.shutdown();
        ctx.shutdown();
        assert!(ctx.is_shut_down());
    }
}
