//! Cross-process global reference count
//!
//! A semaphore eventfd shared with every process that imports a surface.
//! Each serialize/import adds one, each destruction of an importing copy
//! takes one. The creator polls it to learn whether anybody else still
//! uses the buffer before recycling it.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use log::{trace, warn};
use rustix::event::{eventfd, poll, EventfdFlags, PollFd, PollFlags, Timespec};
use rustix::io::Errno;

/// Handle to a global reference count
#[derive(Debug)]
pub struct GlobalRefCount {
    fd: OwnedFd,
}

impl GlobalRefCount {
    /// Create a new counter starting at zero
    pub fn create() -> std::io::Result<Self> {
        let fd = eventfd(
            0,
            EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK | EventfdFlags::SEMAPHORE,
        )?;
        Ok(Self { fd })
    }

    /// Wrap a counter fd received from another process
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Duplicate the fd for handing to another subsystem
    pub fn try_clone_fd(&self) -> std::io::Result<OwnedFd> {
        self.fd.try_clone()
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// Add one reference
    pub fn add(&self) {
        if let Err(e) = rustix::io::write(&self.fd, &1u64.to_ne_bytes()) {
            warn!("Failed to increment global refcount: {}", e);
        } else {
            trace!("Global refcount incremented");
        }
    }

    /// Drop one reference, returns false when the count was already zero
    pub fn release(&self) -> bool {
        let mut buf = [0u8; 8];
        match rustix::io::read(&self.fd, &mut buf) {
            Ok(_) => true,
            Err(Errno::AGAIN) => false,
            Err(e) => {
                warn!("Failed to decrement global refcount: {}", e);
                false
            }
        }
    }

    /// Whether any reference is currently held
    pub fn is_referenced(&self) -> bool {
        let mut fds = [PollFd::new(&self.fd, PollFlags::IN)];
        let timeout = Timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        match poll(&mut fds, Some(&timeout)) {
            Ok(ready) => ready > 0 && fds[0].revents().contains(PollFlags::IN),
            Err(e) => {
                warn!("Failed to poll global refcount: {}", e);
                // Unknown state: keep the buffer out of recycling
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refcount_add_release() {
        let refcount = GlobalRefCount::create().unwrap();
        assert!(!refcount.is_referenced());

        refcount.add();
        refcount.add();
        assert!(refcount.is_referenced());

        assert!(refcount.release());
        assert!(refcount.is_referenced());
        assert!(refcount.release());
        assert!(!refcount.is_referenced());
        assert!(!refcount.release());
    }

    #[test]
    fn test_refcount_shared_through_fd() {
        let creator = GlobalRefCount::create().unwrap();
        let importer = GlobalRefCount::from_fd(creator.try_clone_fd().unwrap());

        importer.add();
        assert!(creator.is_referenced());
        importer.release();
        assert!(!creator.is_referenced());
    }
}
