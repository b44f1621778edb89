//! dma-buf CPU access synchronization (`DMA_BUF_IOCTL_SYNC`)

use std::os::fd::BorrowedFd;

use bitflags::bitflags;
use rustix::ioctl::{ioctl, opcode, Opcode, Setter};

bitflags! {
    /// CPU access direction for a mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

const DMA_BUF_SYNC_START: u64 = 0;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

#[repr(C)]
struct DmaBufSync {
    flags: u64,
}

const DMA_BUF_IOCTL_SYNC: Opcode = opcode::write::<DmaBufSync>(b'b', 0);

fn sync(fd: BorrowedFd<'_>, flags: u64) -> rustix::io::Result<()> {
    // SAFETY: DMA_BUF_IOCTL_SYNC takes a pointer to `struct dma_buf_sync`,
    // which `DmaBufSync` mirrors.
    unsafe {
        let setter = Setter::<DMA_BUF_IOCTL_SYNC, DmaBufSync>::new(DmaBufSync { flags });
        ioctl(fd, setter)
    }
}

/// Flush/invalidate caches before CPU access
pub fn begin_cpu_access(fd: BorrowedFd<'_>, access: Access) -> rustix::io::Result<()> {
    sync(fd, DMA_BUF_SYNC_START | access.bits())
}

/// Flush caches after CPU access
pub fn end_cpu_access(fd: BorrowedFd<'_>, access: Access) -> rustix::io::Result<()> {
    sync(fd, DMA_BUF_SYNC_END | access.bits())
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use super::*;

    #[test]
    fn test_sync_on_non_dmabuf_fails() {
        let fd = rustix::fs::memfd_create("sync-test", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        assert!(begin_cpu_access(fd.as_fd(), Access::READ).is_err());
        assert!(end_cpu_access(fd.as_fd(), Access::READ | Access::WRITE).is_err());
    }

    #[test]
    fn test_access_bits() {
        assert_eq!((Access::READ | Access::WRITE).bits(), 3);
        assert_eq!(DMA_BUF_SYNC_END | Access::WRITE.bits(), 6);
    }
}
