use std::os::fd::RawFd;

/// Readiness interest of a registration.
///
/// Connect-readiness is expressed as write interest, which is how both
/// epoll and kqueue report a completed non-blocking `connect(2)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Interest {
    pub(crate) const READ: Interest = Interest {
        read: true,
        write: false,
    };

    pub(crate) const WRITE: Interest = Interest {
        read: false,
        write: true,
    };

    pub(crate) const READ_WRITE: Interest = Interest {
        read: true,
        write: true,
    };

    pub(crate) const CONNECT: Interest = Interest {
        read: false,
        write: true,
    };
}

/// Cross-thread handle able to interrupt a blocked poll.
///
/// Owns its descriptor (an `eventfd` on Linux, a duplicated kqueue on macOS)
/// so that handles outliving the poller never write into a recycled fd.
pub(crate) struct Waker(pub(crate) RawFd);

unsafe impl Send for Waker {}
unsafe impl Sync for Waker {}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}
