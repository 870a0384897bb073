// Copyright 2022 the tokenpool authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Pipe transport for the jobserver.
//!
//! The pipe's two descriptor numbers come out of `MAKEFLAGS`.  Both ends are
//! inherited by every process in the build tree and stay open for our whole
//! lifetime; closing either one would yank it out from under our siblings.
//!
//! Reading a token is the delicate part.  The pipe is shared with sibling
//! processes that grab bytes whenever they like, so a `select` saying the
//! pipe is readable proves nothing by the time our `read` runs; a plain
//! blocking `read` could then hang the whole scheduler.  And we can't switch
//! the descriptor to `O_NONBLOCK`: the flag lives on the shared open file
//! description, and GNU make chokes on a non-blocking jobserver pipe.
//! Instead the read runs on a private `dup` of the read end with `SIGCHLD`
//! and a 100 ms `SIGALRM` both rigged to close that duplicate, so the read
//! is guaranteed to come back quickly one way or another.

use failure::{format_err, Error};
use libc::c_int;
use nix::errno::Errno;
use nix::sys::select::{self, FdSet};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::time::TimeVal;
use nix::unistd;
use std::fmt::{self, Debug};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use super::helpers::{self, IntervalTimerValue};
use crate::log_debug;

/// Scratch duplicate of the jobserver read end, closed asynchronously by the
/// `SIGALRM`/`SIGCHLD` handlers to knock an in-flight `read` loose.  One
/// process-wide cell is enough: all pool calls come from the single scheduler
/// thread, so at most one acquire is ever in flight.
static SCRATCH_FD: AtomicI32 = AtomicI32::new(-1);

/// Close the scratch descriptor.  Runs in signal context: `swap` and
/// `close(2)` only.
extern "C" fn close_scratch_fd(_: c_int) {
    let fd = SCRATCH_FD.swap(-1, Ordering::SeqCst);
    if fd >= 0 {
        unsafe { libc::close(fd) };
    }
}

/// Connection to a jobserver pipe.
pub(crate) struct PipeTransport {
    rfd: RawFd,
    wfd: RawFd,
    old_alrm: SigAction,
}

impl PipeTransport {
    /// Open the transport from the `R,W` payload of the `MAKEFLAGS`
    /// advertisement.  Both descriptors must already be open in this
    /// process; inheriting the numbers without the descriptors is what
    /// happens when make runs us without the magic `+` prefix.
    pub(crate) fn open(auth: &str) -> Result<PipeTransport, Error> {
        let (rfd, wfd) = match parse_fd_pair(auth) {
            Some(fds) => fds,
            None => return Err(format_err!("invalid jobserver fd pair: {:?}", auth)),
        };
        if !helpers::fd_exists(rfd) || !helpers::fd_exists(wfd) {
            return Err(format_err!(
                "jobserver fds {},{} are not open in this process",
                rfd,
                wfd
            ));
        }
        // The SIGALRM closer stays installed for the life of the pool; the
        // prior action goes back on teardown.
        let act = SigAction::new(
            SigHandler::Handler(close_scratch_fd),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let old_alrm = unsafe { signal::sigaction(Signal::SIGALRM, &act) }
            .map_err(|e| format_err!("sigaction(SIGALRM): {}", e))?;
        log_debug!("connected to jobserver pipe fds {},{}", rfd, wfd);
        Ok(PipeTransport { rfd, wfd, old_alrm })
    }

    /// The descriptor the scheduler can put in its `select`/`poll` set to
    /// learn when a token might be available.
    pub(crate) fn monitor_fd(&self) -> RawFd {
        self.rfd
    }

    /// Try to read one token byte without blocking.  A `false` here means
    /// "no token right now", whatever the reason: pipe empty, pipe closed,
    /// a sibling beat us to the byte, or a child of ours exited.
    pub(crate) fn try_acquire(&mut self) -> bool {
        if !poll_readable(self.rfd) {
            return false;
        }

        // The byte can vanish to a sibling between the poll above and our
        // read.  Read from a private duplicate that the signal handlers can
        // close without touching the shared descriptor.
        let scratch = match unistd::dup(self.rfd) {
            Ok(fd) => fd,
            Err(_) => return false,
        };
        SCRATCH_FD.store(scratch, Ordering::SeqCst);
        let acquired = read_token(scratch);
        close_scratch_fd(0);
        acquired
    }

    /// Hand one token back to the pipe.  `false` leaves the caller's
    /// accounting untouched so the return can be retried later.
    pub(crate) fn return_token(&mut self) -> bool {
        loop {
            match unistd::write(self.wfd, b"+") {
                Ok(n) => return n > 0,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(_) => return false,
            }
        }
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        // The pipe ends belong to the whole build tree and stay open; only
        // our signal disposition is undone.
        let _ = unsafe { signal::sigaction(Signal::SIGALRM, &self.old_alrm) };
    }
}

impl Debug for PipeTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeTransport")
            .field("rfd", &self.rfd)
            .field("wfd", &self.wfd)
            .finish()
    }
}

fn parse_fd_pair(auth: &str) -> Option<(RawFd, RawFd)> {
    let mut parts = auth.splitn(2, ',').fuse();
    let rfd = parts.next().and_then(|s| s.parse().ok())?;
    let wfd = parts.next().and_then(|s| s.parse().ok())?;
    Some((rfd, wfd))
}

/// Zero-timeout readability check.
fn poll_readable(fd: RawFd) -> bool {
    let mut rfds = FdSet::new();
    rfds.insert(fd);
    let mut timeout: TimeVal = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    }
    .into();
    match select::select(None, Some(&mut rfds), None, None, Some(&mut timeout)) {
        Ok(n) => n > 0,
        Err(_) => false,
    }
}

/// Read one byte from the scratch descriptor with both tripwires armed.
///
/// A child exiting is the usual way a token frees up elsewhere in the tree,
/// so `SIGCHLD` must bounce us back to the scheduler promptly; the one-shot
/// 100 ms alarm bounds the wait when nothing else happens.
fn read_token(scratch: RawFd) -> bool {
    const READ_TIMEOUT: IntervalTimerValue = IntervalTimerValue {
        interval: Duration::from_millis(0),
        value: Duration::from_millis(100),
    };

    let act = SigAction::new(
        SigHandler::Handler(close_scratch_fd),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let old_chld = match unsafe { signal::sigaction(Signal::SIGCHLD, &act) } {
        Ok(old) => old,
        Err(_) => return false,
    };

    let mut acquired = false;
    if helpers::set_real_interval_timer(&READ_TIMEOUT).is_ok() {
        // read() outcomes:
        //   1            token read
        //   0            pipe closed by the parent
        //   -1 / EINTR   alarm fired or a child exited mid-read
        //   -1 / EBADF   a handler closed the scratch fd before read() ran
        let mut buf = [0u8; 1];
        acquired = match unistd::read(scratch, &mut buf) {
            Ok(n) => n == 1,
            Err(_) => false,
        };
        let _ = helpers::set_real_interval_timer(&IntervalTimerValue::default());
    }

    let _ = unsafe { signal::sigaction(Signal::SIGCHLD, &old_chld) };
    acquired
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_pair_round_trip() {
        assert_eq!(parse_fd_pair("3,4"), Some((3, 4)));
        assert_eq!(parse_fd_pair("17,42"), Some((17, 42)));
    }

    #[test]
    fn fd_pair_malformed() {
        assert_eq!(parse_fd_pair(""), None);
        assert_eq!(parse_fd_pair("3"), None);
        assert_eq!(parse_fd_pair("3,"), None);
        assert_eq!(parse_fd_pair("x,4"), None);
        assert_eq!(parse_fd_pair("3,4,5"), None);
    }

    #[test]
    fn poll_empty_pipe_not_readable() {
        let (r, w) = unistd::pipe().unwrap();
        assert!(!poll_readable(r));
        unistd::write(w, b"x").unwrap();
        assert!(poll_readable(r));
        unistd::close(r).unwrap();
        unistd::close(w).unwrap();
    }
}
