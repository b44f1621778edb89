//! Attach/release bookkeeping shared between a buffer and the protocol
//!
//! The tracker is the only piece of a buffer the dispatch side sees: the
//! `wl_buffer` user data holds an `Arc<ReleaseTracker>`, so a release event
//! can update buffer state even after the surface it was attached to is
//! gone.

use std::sync::Mutex;

use log::{debug, trace};

use super::BufferId;
use crate::surface::{SurfaceEvent, SurfaceInbox, WeakInbox};

/// Attachment state of one buffer
#[derive(Debug, Clone, Default)]
enum ReleaseState {
    #[default]
    Free,
    /// Held by the compositor. The owner is weak so late releases do not
    /// keep a torn-down surface alive; it is dead once the surface unmapped.
    Attached { owner: WeakInbox },
}

/// Shared attach/release state of a [`BufferObject`](super::BufferObject)
#[derive(Debug)]
pub struct ReleaseTracker {
    buffer: BufferId,
    state: Mutex<ReleaseState>,
}

impl ReleaseTracker {
    pub fn new(buffer: BufferId) -> Self {
        Self {
            buffer,
            state: Mutex::new(ReleaseState::Free),
        }
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn is_attached(&self) -> bool {
        matches!(*self.lock(), ReleaseState::Attached { .. })
    }

    pub fn is_free(&self) -> bool {
        !self.is_attached()
    }

    /// Held by the compositor for a surface that no longer exists
    pub fn is_orphaned(&self) -> bool {
        matches!(&*self.lock(), ReleaseState::Attached { owner } if !owner.is_alive())
    }

    /// Transition `Free -> Attached`, recording the owner
    ///
    /// # Panics
    ///
    /// Panics if the buffer is already attached; a buffer is never held by
    /// two surfaces and never re-attached before the compositor let go.
    pub(crate) fn mark_attached(&self, owner: &SurfaceInbox) {
        let mut state = self.lock();
        assert!(
            matches!(*state, ReleaseState::Free),
            "buffer {:?} attached while still in flight",
            self.buffer
        );
        *state = ReleaseState::Attached {
            owner: owner.downgrade(),
        };
        trace!("Buffer {:?} attached", self.buffer);
    }

    /// Compositor released the buffer
    ///
    /// Moves the buffer back to `Free` and tells the owning surface, if it
    /// still exists. Releases for an unmapped surface still free the buffer.
    /// Returns false for duplicate releases, which are ignored.
    pub fn on_compositor_release(&self) -> bool {
        let previous = std::mem::take(&mut *self.lock());
        match previous {
            ReleaseState::Attached { owner } => {
                let delivered = owner.push(SurfaceEvent::BufferReleased(self.buffer));
                debug!(
                    "Buffer {:?} released by compositor (owner {})",
                    self.buffer,
                    if delivered { "notified" } else { "gone" }
                );
                true
            }
            ReleaseState::Free => {
                debug!("Ignoring duplicate release of buffer {:?}", self.buffer);
                false
            }
        }
    }

    /// Take back an attach the compositor never saw
    ///
    /// Only applies while `owner` holds the buffer. The owner is not
    /// notified since it is the caller.
    pub(crate) fn detach(&self, owner: &SurfaceInbox) -> bool {
        let mut state = self.lock();
        let owned = is_owned_by(&state, owner);
        if owned {
            *state = ReleaseState::Free;
        }
        owned
    }

    /// Drop the owner when its surface is torn down
    ///
    /// The buffer stays attached until the compositor releases it. Only
    /// applies while `owner` holds the buffer.
    pub(crate) fn orphan(&self, owner: &SurfaceInbox) -> bool {
        let mut state = self.lock();
        let owned = is_owned_by(&state, owner);
        if owned {
            *state = ReleaseState::Attached {
                owner: WeakInbox::default(),
            };
            trace!("Buffer {:?} orphaned, waiting for release", self.buffer);
        }
        owned
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReleaseState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn is_owned_by(state: &ReleaseState, inbox: &SurfaceInbox) -> bool {
    matches!(state, ReleaseState::Attached { owner } if owner.points_to(inbox))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_notifies_owner_once() {
        let inbox = SurfaceInbox::new();
        let tracker = ReleaseTracker::new(BufferId(42));

        tracker.mark_attached(&inbox);
        assert!(tracker.is_attached());

        assert!(tracker.on_compositor_release());
        assert!(!tracker.on_compositor_release());
        assert!(tracker.is_free());

        assert_eq!(
            inbox.drain(),
            vec![SurfaceEvent::BufferReleased(BufferId(42))]
        );
    }

    #[test]
    fn test_release_after_owner_dropped() {
        let inbox = SurfaceInbox::new();
        let tracker = ReleaseTracker::new(BufferId(7));
        tracker.mark_attached(&inbox);
        drop(inbox);

        assert!(tracker.on_compositor_release());
        assert!(tracker.is_free());
    }

    #[test]
    fn test_detach_does_not_notify() {
        let inbox = SurfaceInbox::new();
        let tracker = ReleaseTracker::new(BufferId(3));
        tracker.mark_attached(&inbox);

        assert!(!tracker.detach(&SurfaceInbox::new()));
        assert!(tracker.detach(&inbox));
        assert!(!tracker.detach(&inbox));
        assert!(inbox.is_empty());
    }

    #[test]
    fn test_orphaned_buffer_waits_for_release() {
        let first = SurfaceInbox::new();
        let tracker = ReleaseTracker::new(BufferId(5));
        tracker.mark_attached(&first);

        assert!(tracker.orphan(&first));
        assert!(tracker.is_attached());
        assert!(tracker.is_orphaned());

        // Another surface cannot take it before the compositor let go
        let second = SurfaceInbox::new();
        assert!(!tracker.orphan(&second));
        assert!(!tracker.detach(&second));

        assert!(tracker.on_compositor_release());
        assert!(tracker.is_free());
        assert!(first.is_empty());

        tracker.mark_attached(&second);
        assert!(!tracker.is_orphaned());
        assert!(!tracker.orphan(&first));
        assert!(tracker.detach(&second));
    }

    #[test]
    #[should_panic(expected = "still in flight")]
    fn test_double_attach_panics() {
        let inbox = SurfaceInbox::new();
        let tracker = ReleaseTracker::new(BufferId(9));
        tracker.mark_attached(&inbox);
        tracker.mark_attached(&inbox);
    }
}
