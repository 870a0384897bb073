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

//! Named-semaphore transport for the jobserver.
//!
//! mingw32-make advertises `--jobserver-auth=gmake_semaphore_<pid>` and
//! backs it with a named kernel semaphore: one unit of the count is one
//! token.  Acquire is a zero-timeout wait, return is a release.
//!
//! The only hard part is waiting for "a subprocess finished OR a token
//! freed up" in one place.  A build scheduler on Windows sits on an I/O
//! completion port, and a completion port is not a waitable handle, so
//! `WaitForMultipleObjects` over both is impossible.  [`wait_for_token`]
//! bridges the gap with a throwaway thread that waits alertably on the
//! semaphore and converts a token sighting into a completion packet.

use failure::{format_err, Error};
use std::any::Any;
use std::ffi::CString;
use std::fmt::{self, Debug};
use std::os::windows::io::{AsRawHandle, RawHandle};
use std::process;
use std::ptr;
use std::thread;
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_BROKEN_PIPE, HANDLE, WAIT_OBJECT_0,
};
use windows_sys::Win32::System::Threading::{
    CreateSemaphoreA, OpenSemaphoreA, QueueUserAPC, ReleaseSemaphore, WaitForSingleObject,
    WaitForSingleObjectEx, INFINITE, SEMAPHORE_ALL_ACCESS,
};
use windows_sys::Win32::System::IO::{
    GetQueuedCompletionStatus, PostQueuedCompletionStatus, OVERLAPPED,
};

use crate::{log_debug, log_err};

/// Connection to a jobserver semaphore.
pub(crate) struct SemaphoreTransport {
    sem: HANDLE,
}

impl SemaphoreTransport {
    /// Open the named semaphore from the `MAKEFLAGS` advertisement.  The
    /// handle is ours alone; children get the name through the environment,
    /// not the handle.
    pub(crate) fn open(auth: &str) -> Result<SemaphoreTransport, Error> {
        let name = match parse_semaphore_name(auth) {
            Some(name) => name,
            None => return Err(format_err!("invalid jobserver semaphore name: {:?}", auth)),
        };
        let cname = CString::new(name)?;
        let sem = unsafe {
            OpenSemaphoreA(
                SEMAPHORE_ALL_ACCESS,
                0, // children don't inherit the handle
                cname.as_ptr() as *const u8,
            )
        };
        if sem.is_null() {
            return Err(format_err!(
                "cannot open jobserver semaphore {:?}: error {}",
                name,
                unsafe { GetLastError() }
            ));
        }
        log_debug!("connected to jobserver semaphore {:?}", name);
        Ok(SemaphoreTransport { sem })
    }

    /// Try to take one unit of the semaphore count without blocking.
    pub(crate) fn try_acquire(&mut self) -> bool {
        unsafe { WaitForSingleObject(self.sem, 0) == WAIT_OBJECT_0 }
    }

    /// Hand one token back.  `false` leaves the caller's accounting
    /// untouched so the return can be retried later.
    pub(crate) fn return_token(&mut self) -> bool {
        unsafe { ReleaseSemaphore(self.sem, 1, ptr::null_mut()) != 0 }
    }

    /// Block until the completion port delivers a packet, counting a token
    /// becoming available as one.  Returns `true` when the wake-up was a
    /// token; otherwise `key` identifies the subprocess completion that
    /// arrived.
    ///
    /// The semaphore is bridged into the port by a thread that lives for
    /// exactly one call: it waits alertably on the semaphore, and on a
    /// genuine wake re-releases the unit (so a following `acquire` can take
    /// it) and posts a packet keyed with our own address.  Once the port
    /// delivers anything, a no-op APC breaks the thread out of its wait and
    /// we join it before returning.
    pub(crate) fn wait_for_token(&self, ioport: RawHandle, key: &mut usize) -> bool {
        let ioport = ioport as HANDLE;
        let pool_key = self as *const SemaphoreTransport as usize;

        // Handshake semaphore so the bridge is known to be running before we
        // commit to the port wait.
        let startup = unsafe { CreateSemaphoreA(ptr::null(), 0, 1, ptr::null()) };
        if startup.is_null() {
            win32_fatal("CreateSemaphore");
        }

        let args = BridgeArgs {
            sem: self.sem as usize,
            ioport: ioport as usize,
            startup: startup as usize,
            key: pool_key,
        };
        let bridge = match thread::Builder::new().spawn(move || bridge_main(args)) {
            Ok(handle) => handle,
            // The spawn failure is an io::Error, not a last-error condition.
            Err(err) => fatal("CreateThread", &err.to_string()),
        };
        if unsafe { WaitForSingleObject(startup, INFINITE) } != WAIT_OBJECT_0 {
            win32_fatal("WaitForSingleObject/startup");
        }
        unsafe { CloseHandle(startup) };

        // The bridge now waits on the semaphore while we wait on the port;
        // between them every event of interest lands here.
        let mut bytes: u32 = 0;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
        *key = 0;
        let ok = unsafe {
            GetQueuedCompletionStatus(ioport, &mut bytes, key, &mut overlapped, INFINITE)
        };
        if ok == 0 && unsafe { GetLastError() } != ERROR_BROKEN_PIPE {
            win32_fatal("GetQueuedCompletionStatus");
        }

        unsafe { QueueUserAPC(Some(noop_apc), bridge.as_raw_handle() as HANDLE, 0) };
        if let Err(panic) = bridge.join() {
            fatal("bridge thread join", panic_message(panic.as_ref()));
        }

        *key == pool_key
    }
}

impl Drop for SemaphoreTransport {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.sem) };
    }
}

impl Debug for SemaphoreTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreTransport")
            .field("sem", &self.sem)
            .finish()
    }
}

// Raw handles for the bridge thread.  Carried as plain integers because the
// pointer-typed HANDLE is not Send; the kernel objects they name outlive the
// thread (the token semaphore and port are held by the caller for the whole
// call, the startup semaphore until the handshake completes).
struct BridgeArgs {
    sem: usize,
    ioport: usize,
    startup: usize,
    key: usize,
}

fn bridge_main(args: BridgeArgs) {
    let sem = args.sem as HANDLE;
    unsafe {
        if ReleaseSemaphore(args.startup as HANDLE, 1, ptr::null_mut()) == 0 {
            win32_fatal("ReleaseSemaphore/startup");
        }

        // Alertable, so the main thread's APC can cancel the wait.
        if WaitForSingleObjectEx(sem, INFINITE, 1) == WAIT_OBJECT_0 {
            // Put the unit straight back so the acquire path finds it; we
            // only report availability, we don't hold tokens.
            if ReleaseSemaphore(sem, 1, ptr::null_mut()) == 0 {
                win32_fatal("ReleaseSemaphore/token");
            }
            if PostQueuedCompletionStatus(args.ioport as HANDLE, 0, args.key, ptr::null_mut())
                == 0
            {
                win32_fatal("PostQueuedCompletionStatus");
            }
        }
    }
}

unsafe extern "system" fn noop_apc(_: usize) {}

/// A kernel-level failure in the integrated wait leaves the scheduler's
/// port and the bridge thread in an unknowable state; dying loudly beats
/// deadlocking quietly.  Only for calls that set the thread's last error.
fn win32_fatal(function: &str) -> ! {
    log_err!("fatal: {}: error {}", function, unsafe { GetLastError() });
    process::exit(1);
}

/// Like [`win32_fatal`], for failures whose detail comes from Rust rather
/// than `GetLastError`.
fn fatal(function: &str, detail: &str) -> ! {
    log_err!("fatal: {}: {}", function, detail);
    process::exit(1);
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Extract the semaphore name from the auth payload: the longest leading
/// run of the characters GNU make uses in semaphore names.
fn parse_semaphore_name(auth: &str) -> Option<&str> {
    let end = auth
        .find(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'))
        .unwrap_or(auth.len());
    if end == 0 {
        None
    } else {
        Some(&auth[..end])
    }
}
