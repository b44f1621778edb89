//! Per-surface event inbox
//!
//! Protocol dispatch pushes tagged events here and the thread owning the
//! surface drains them in arrival order. The inbox replaces closures
//! captured by frame and release callbacks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use crate::buffer::BufferId;

/// Which surface a frame callback was requested on
///
/// Both variants carry the map generation of the surface at request time.
/// Callbacks still in flight when a surface is unmapped and mapped again
/// carry the old generation and are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameTag {
    /// Callback on the surface itself
    Own(u32),
    /// Initial "parent ready" callback registered on the parent surface
    Parent(u32),
}

impl FrameTag {
    pub fn generation(&self) -> u32 {
        match *self {
            FrameTag::Own(generation) | FrameTag::Parent(generation) => generation,
        }
    }
}

/// Events delivered to a surface by the protocol layer
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SurfaceEvent {
    /// A frame callback fired
    FrameDone { tag: FrameTag, time: u32 },
    /// The compositor released a buffer this surface had attached
    BufferReleased(BufferId),
    /// `wl_surface.preferred_buffer_scale`
    PreferredScale(i32),
    /// `wp_fractional_scale_v1.preferred_scale`, in 120ths
    PreferredFractionalScale(u32),
}

#[derive(Debug, Default)]
struct InboxQueue {
    events: VecDeque<SurfaceEvent>,
    delivered: u64,
}

/// Shared, ordered event queue owned by one surface
#[derive(Debug, Clone, Default)]
pub struct SurfaceInbox {
    inner: Arc<Mutex<InboxQueue>>,
}

impl SurfaceInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event
    pub fn push(&self, event: SurfaceEvent) {
        let mut queue = lock_queue(&self.inner);
        queue.events.push_back(event);
        queue.delivered += 1;
    }

    /// Take every queued event, oldest first
    pub fn drain(&self) -> Vec<SurfaceEvent> {
        lock_queue(&self.inner).events.drain(..).collect()
    }

    /// Drop queued events without handling them
    pub fn clear(&self) {
        lock_queue(&self.inner).events.clear();
    }

    pub fn len(&self) -> usize {
        lock_queue(&self.inner).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of events ever pushed
    pub fn delivered_count(&self) -> u64 {
        lock_queue(&self.inner).delivered
    }

    /// Non-owning handle, used by buffers and in-flight callbacks
    pub fn downgrade(&self) -> WeakInbox {
        WeakInbox {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Weak reference to a [`SurfaceInbox`]
///
/// Events pushed after the owning surface is gone are dropped.
#[derive(Debug, Clone, Default)]
pub struct WeakInbox {
    inner: Weak<Mutex<InboxQueue>>,
}

impl WeakInbox {
    /// Push an event if the inbox still exists, returns whether it did
    pub fn push(&self, event: SurfaceEvent) -> bool {
        match self.inner.upgrade() {
            Some(inner) => {
                SurfaceInbox { inner }.push(event);
                true
            }
            None => false,
        }
    }

    pub fn upgrade(&self) -> Option<SurfaceInbox> {
        self.inner.upgrade().map(|inner| SurfaceInbox { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    /// Whether this handle refers to `inbox`
    pub fn points_to(&self, inbox: &SurfaceInbox) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(&inbox.inner))
    }
}

fn lock_queue(inner: &Mutex<InboxQueue>) -> std::sync::MutexGuard<'_, InboxQueue> {
    // The queue holds plain data; a panic while pushing cannot leave it torn.
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbox_preserves_order() {
        let inbox = SurfaceInbox::new();
        inbox.push(SurfaceEvent::PreferredScale(2));
        inbox.push(SurfaceEvent::FrameDone {
            tag: FrameTag::Own(1),
            time: 7,
        });

        let events = inbox.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], SurfaceEvent::PreferredScale(2));
        assert!(inbox.is_empty());
        assert_eq!(inbox.delivered_count(), 2);
    }

    #[test]
    fn test_weak_inbox_after_drop() {
        let inbox = SurfaceInbox::new();
        let weak = inbox.downgrade();
        assert!(weak.push(SurfaceEvent::PreferredScale(1)));
        assert_eq!(inbox.len(), 1);

        assert!(weak.points_to(&inbox));
        assert!(!weak.points_to(&SurfaceInbox::new()));

        drop(inbox);
        assert!(!weak.is_alive());
        assert!(!weak.push(SurfaceEvent::PreferredScale(1)));
    }
}
