use libc::{itimerval, timeval};
use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg};
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

/// Whether `fd` names an open descriptor in this process.
pub(crate) fn fd_exists(fd: RawFd) -> bool {
    fd >= 0 && fcntl::fcntl(fd, FcntlArg::F_GETFD).is_ok()
}

/// Arming values for the real-time interval timer.  The all-zero default
/// disarms it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct IntervalTimerValue {
    pub(crate) interval: Duration,
    pub(crate) value: Duration,
}

pub(crate) fn timeval_from_duration(d: &Duration) -> timeval {
    timeval {
        tv_sec: d.as_secs() as libc::time_t,
        tv_usec: d.subsec_micros() as libc::suseconds_t,
    }
}

/// Arm (or with the default value, disarm) `ITIMER_REAL`, which delivers
/// `SIGALRM` on expiry.
pub(crate) fn set_real_interval_timer(value: &IntervalTimerValue) -> nix::Result<()> {
    let tv = itimerval {
        it_interval: timeval_from_duration(&value.interval),
        it_value: timeval_from_duration(&value.value),
    };
    let res = unsafe { libc::setitimer(libc::ITIMER_REAL, &tv, ptr::null_mut()) };
    Errno::result(res).map(drop)
}
