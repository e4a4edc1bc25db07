//! BSD/macOS `kqueue`-based poller implementation.
//!
//! Exposes the same interface as the Linux `epoll` backend. Read and write
//! interest map onto two separate filters per descriptor; the filter that is
//! not wanted is kept registered but disabled so interest changes never have
//! to care whether a filter was added before.

use super::common::Interest;
use crate::reactor::event::Event;
use crate::reactor::poller::Waker;

use libc::{
    EV_ADD, EV_CLEAR, EV_DELETE, EV_DISABLE, EV_ENABLE, EV_EOF, EV_ERROR, EVFILT_READ,
    EVFILT_USER, EVFILT_WRITE, NOTE_TRIGGER, kevent, kqueue,
};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

const WAKE_IDENT: usize = 1;

pub(crate) struct KqueuePoller {
    kqueue: RawFd,
    events: Vec<kevent>,
    waker: Arc<Waker>,
}

unsafe impl Send for KqueuePoller {}

fn change(ident: usize, filter: i16, flags: u16, fflags: u32, udata: usize) -> kevent {
    kevent {
        ident,
        filter,
        flags,
        fflags,
        data: 0,
        udata: udata as *mut _,
    }
}

impl Waker {
    /// Wake the poller by triggering the `EVFILT_USER` event.
    pub(crate) fn wake(&self) {
        let event = change(WAKE_IDENT, EVFILT_USER, 0, NOTE_TRIGGER, 0);
        unsafe {
            kevent(self.0, &event, 1, ptr::null_mut(), 0, ptr::null());
        }
    }
}

impl KqueuePoller {
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        let kqueue = unsafe { kqueue() };
        if kqueue < 0 {
            return Err(io::Error::last_os_error());
        }

        let event = change(WAKE_IDENT, EVFILT_USER, EV_ADD | EV_ENABLE | EV_CLEAR, 0, 0);
        let rc = unsafe { kevent(kqueue, &event, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(kqueue) };
            return Err(err);
        }

        let wake_fd = unsafe { libc::dup(kqueue) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(kqueue) };
            return Err(err);
        }

        Ok(KqueuePoller {
            kqueue,
            events: Vec::with_capacity(capacity.max(1)),
            waker: Arc::new(Waker(wake_fd)),
        })
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub(crate) fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.apply(fd, token, interest)
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.apply(fd, token, interest)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let changes = [
            change(fd as usize, EVFILT_READ, EV_DELETE, 0, 0),
            change(fd as usize, EVFILT_WRITE, EV_DELETE, 0, 0),
        ];

        // Deleting a filter that was never enabled reports ENOENT per change;
        // those are ignored, a hard failure shows up as a negative return.
        let rc = unsafe {
            kevent(
                self.kqueue,
                changes.as_ptr(),
                changes.len() as i32,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };

        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }

        Ok(())
    }

    fn apply(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let toggle = |wanted: bool| {
            if wanted {
                EV_ADD | EV_ENABLE
            } else {
                EV_ADD | EV_DISABLE
            }
        };

        let changes = [
            change(fd as usize, EVFILT_READ, toggle(interest.read), 0, token),
            change(fd as usize, EVFILT_WRITE, toggle(interest.write), 0, token),
        ];

        let rc = unsafe {
            kevent(
                self.kqueue,
                changes.as_ptr(),
                changes.len() as i32,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };

        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub(crate) fn poll(
        &mut self,
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map(|t| t as *const libc::timespec)
            .unwrap_or(ptr::null());

        events.clear();

        let n = unsafe {
            kevent(
                self.kqueue,
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                ts_ptr,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        unsafe {
            self.events.set_len(n as usize);
        }

        for ev in &self.events {
            if ev.filter == EVFILT_USER {
                continue;
            }

            let token = ev.udata as usize;
            let readable = ev.filter == EVFILT_READ;
            let writable = ev.filter == EVFILT_WRITE;
            let error = ev.flags & EV_ERROR != 0 || (writable && ev.flags & EV_EOF != 0);

            // kqueue reports one event per filter; fold them per token.
            if let Some(e) = events.iter_mut().find(|e| e.token == token) {
                e.readable |= readable;
                e.writable |= writable;
                e.error |= error;
            } else {
                events.push(Event {
                    token,
                    readable,
                    writable,
                    error,
                });
            }
        }

        unsafe {
            self.events.set_len(0);
        }

        Ok(())
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kqueue);
        }
    }
}
