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

#[cfg(unix)]
use std::os::unix::io::RawFd;
#[cfg(windows)]
use std::os::windows::io::RawHandle;

use crate::makeflags;
#[cfg(unix)]
use crate::posix::PipeTransport as Transport;
#[cfg(windows)]
use crate::win32::SemaphoreTransport as Transport;
use crate::{log_debug, log_info, log_warn};

/// A pool of job tokens borrowed from a parent jobserver.
///
/// Every process owns one implicit token just by existing, so a fresh pool
/// always lets one job through.  Beyond that, tokens come out of the shared
/// transport and the pool's bookkeeping makes sure each one is eventually
/// either pinned to a running job or handed back, exactly once.
///
/// The intended rhythm, from a single scheduler thread:
///
/// * [`acquire`](TokenPool::acquire) asks whether a job could start right
///   now; it never blocks.
/// * [`reserve`](TokenPool::reserve) commits the token `acquire` saw to a
///   job the caller has decided to start.  Keeping the two steps separate
///   lets the scheduler check other gates (load average, dependency
///   readiness) between them without losing tokens.
/// * [`release`](TokenPool::release) takes the token back from a finished
///   job, returning it to the parent if it was a borrowed one.
/// * [`clear`](TokenPool::clear) pays back everything at shutdown; it also
///   runs on drop.
#[derive(Debug)]
pub struct TokenPool {
    /// Tokens held but not pinned to a job.  Starts at 1: the implicit one.
    available: i32,
    /// Tokens pinned to running jobs.
    used: i32,
    transport: Transport,
}

impl TokenPool {
    /// Connect to the jobserver advertised in `MAKEFLAGS`, if any.
    ///
    /// Returns `None` when no jobserver is advertised, when the advertised
    /// one can't be opened, or when `ignore` asks us to stand alone (with a
    /// warning, since make is offering coordination we're declining).  In
    /// every `None` case the caller falls back to its own `-j` limit.
    ///
    /// On success, a ` -lN` load ceiling in the same `MAKEFLAGS` is written
    /// to `max_load_average`; otherwise the cell is left alone.
    pub fn from_env(ignore: bool, verbose: bool, max_load_average: &mut f64) -> Option<TokenPool> {
        let flags = makeflags::scan()?;
        if ignore {
            log_warn!("-jN forced on command line; ignoring GNU make jobserver");
            return None;
        }
        let transport = match Transport::open(&flags.auth) {
            Ok(transport) => transport,
            Err(err) => {
                log_debug!("cannot use jobserver: {}", err);
                return None;
            }
        };
        if let Some(limit) = flags.load_limit {
            *max_load_average = f64::from(limit);
        }
        if verbose {
            log_info!("using GNU make jobserver");
        }
        Some(TokenPool {
            available: 1,
            used: 0,
            transport,
        })
    }

    /// Whether a token is on hand for one more job.  Never blocks: if
    /// nothing is held locally, this makes one non-blocking attempt to draw
    /// from the transport.
    ///
    /// A `true` is only a snapshot until [`reserve`](TokenPool::reserve)
    /// pins it; a `false` means try again on the next monitor event.
    pub fn acquire(&mut self) -> bool {
        if self.available > 0 {
            return true;
        }
        if self.transport.try_acquire() {
            self.available += 1;
            return true;
        }
        false
    }

    /// Pin an available token to a job the caller is starting.
    ///
    /// # Panics
    ///
    /// If no token is available, i.e. [`acquire`](TokenPool::acquire) has
    /// not returned `true` since the last `reserve`.
    pub fn reserve(&mut self) {
        assert!(self.available >= 1);
        self.available -= 1;
        self.used += 1;
    }

    /// Take back the token of a finished job.  A borrowed token goes back
    /// to the parent right away; the implicit token stays with us.
    pub fn release(&mut self) {
        assert!(self.used >= 1);
        self.available += 1;
        self.used -= 1;
        if self.available > 1 {
            self.return_token();
        }
    }

    /// Pay back every borrowed token, as if all jobs finished.  Safe to
    /// call repeatedly; runs automatically on drop.
    pub fn clear(&mut self) {
        while self.used > 0 {
            self.release();
        }
        while self.available > 1 {
            if !self.return_token() {
                // The transport is refusing tokens; keep the surplus on the
                // books so a later pass can retry rather than losing them.
                break;
            }
        }
    }

    /// `available` comes down only once the transport definitely took the
    /// token back; a failed write stays on our books for a later retry.
    fn return_token(&mut self) -> bool {
        if self.transport.return_token() {
            self.available -= 1;
            true
        } else {
            false
        }
    }

    /// The descriptor the scheduler should add to its `select`/`poll` set;
    /// readable means an [`acquire`](TokenPool::acquire) is worth another
    /// try.  The pool never closes it.
    #[cfg(unix)]
    pub fn monitor_fd(&self) -> RawFd {
        self.transport.monitor_fd()
    }

    /// Block on the scheduler's completion port until either a subprocess
    /// completion arrives (`false`, with `key` identifying it) or a
    /// jobserver token becomes available (`true`).
    #[cfg(windows)]
    pub fn wait_for_token(&mut self, ioport: RawHandle, key: &mut usize) -> bool {
        self.transport.wait_for_token(ioport, key)
    }
}

impl Drop for TokenPool {
    fn drop(&mut self) {
        self.clear();
    }
}
