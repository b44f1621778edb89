//! Frame callback bookkeeping for one surface

use std::time::{Duration, Instant};

/// How long a frame callback registration lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCallbackKind {
    /// Fires once and is forgotten
    OneShot,
    /// Re-armed after every frame until cancelled
    Persistent,
}

/// A registered frame callback
#[derive(Debug, Clone)]
pub(crate) struct FrameRequest {
    pub kind: FrameCallbackKind,
    /// Fall back to a timer while no buffer is attached
    pub emulate: bool,
    /// A `wl_callback` is outstanding
    pub registered: bool,
    /// Next synthetic callback
    pub deadline: Option<Instant>,
}

impl FrameRequest {
    pub fn new(kind: FrameCallbackKind, emulate: bool) -> Self {
        Self {
            kind,
            emulate,
            registered: false,
            deadline: None,
        }
    }

    /// Schedule the next synthetic callback if emulation is enabled
    pub fn arm_emulation(&mut self, now: Instant, interval: Duration) {
        if self.emulate && self.deadline.is_none() {
            self.deadline = Some(now + interval);
        }
    }

    pub fn cancel_emulation(&mut self) {
        self.deadline = None;
    }

    pub fn emulation_due(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if deadline <= now)
    }

    /// Account for a delivered callback, returns whether the request stays
    /// registered
    pub fn fired(&mut self) -> bool {
        self.registered = false;
        self.deadline = None;
        self.kind == FrameCallbackKind::Persistent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emulation_deadline() {
        let now = Instant::now();
        let mut request = FrameRequest::new(FrameCallbackKind::OneShot, true);
        request.arm_emulation(now, Duration::from_millis(16));
        assert!(!request.emulation_due(now));
        assert!(request.emulation_due(now + Duration::from_millis(16)));

        // Re-arming keeps the first deadline
        request.arm_emulation(now + Duration::from_millis(10), Duration::from_millis(16));
        assert!(request.emulation_due(now + Duration::from_millis(16)));

        assert!(!request.fired());
        assert!(!request.emulation_due(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_no_emulation_without_flag() {
        let now = Instant::now();
        let mut request = FrameRequest::new(FrameCallbackKind::Persistent, false);
        request.arm_emulation(now, Duration::ZERO);
        assert!(!request.emulation_due(now + Duration::from_secs(1)));
        assert!(request.fired());
    }
}
