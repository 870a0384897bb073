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

//! Client side of the GNU make jobserver protocol.
//!
//! When make runs with `-jN` it creates a pool of N job "tokens" and
//! advertises the pool to every descendant through `MAKEFLAGS`.  A build tool
//! that wants to play along in a recursive build tree connects to the pool,
//! runs one job on the implicit token it owns simply by existing, and must
//! hold one extra token for every additional job it runs in parallel.  When
//! a job finishes, the extra token goes back to the pool so a sibling can
//! have it.  Tokens are opaque; only their count means anything.
//!
//! On POSIX systems the pool is an anonymous pipe whose two ends are
//! inherited by the whole build tree: acquiring a token reads one byte,
//! returning a token writes one back.  On Windows it is a named semaphore.
//! The awkward part of the protocol is that the pipe is shared with
//! arbitrary sibling processes that don't coordinate with us, so "the pipe
//! is readable" never guarantees that our `read` will not block.  See
//! [`TokenPool`] and the transport modules for how that race is handled.
//!
//! The protocol itself is documented at
//! <http://make.mad-scientist.net/papers/jobserver-implementation/>.
//!
//! This crate is only ever a client: it never creates the pool and never
//! decides when a job should run.  The embedding build scheduler asks
//! [`TokenPool::from_env`] for a pool, then drives it with
//! `acquire`/`reserve`/`release` and waits for token readiness alongside its
//! own subprocess I/O (`monitor_fd` on POSIX, `wait_for_token` on Windows).

/// Log an error.
#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {{
        let s = format!($($arg)*);
        $crate::logs::error(s.trim_end());
    }}
}

/// Log a warning.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        let s = format!($($arg)*);
        $crate::logs::warning(s.trim_end());
    }}
}

/// Log an informational message.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        let s = format!($($arg)*);
        $crate::logs::info(s.trim_end());
    }}
}

/// Log a debug message.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        if $crate::logs::debug_level() >= 1 {
            let s = format!($($arg)*);
            $crate::logs::debug(s.trim_end());
        }
    }}
}

#[cfg(unix)]
mod helpers;
pub mod logs;
mod makeflags;
mod pool;
#[cfg(unix)]
mod posix;
#[cfg(windows)]
mod win32;

pub use logs::Logger;
pub use pool::TokenPool;
