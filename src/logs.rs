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

//! Printer hook for the handful of lines this crate emits.
//!
//! A build tool usually owns the terminal (status lines, job output
//! interleaving), so the pool never writes to it directly.  Everything goes
//! through a process-global [`Logger`] that the embedding tool may replace
//! with its own printer via [`set_logger`]; the default writes to stderr.

use lazy_static::lazy_static;
use std::env;
use std::io::{self, Write};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

/// A line-based logger.
pub trait Logger: Send {
    /// Write a line to the logger.
    /// `line` must not contain any `'\n'` characters.
    fn write_line(&mut self, line: &str);
}

#[derive(Debug)]
struct StderrLog;

impl Logger for StderrLog {
    fn write_line(&mut self, line: &str) {
        debug_assert!(!line.contains('\n'));

        // Flush stdout first so the line lands after any build output that
        // is already on its way out.
        let _ = io::stdout().flush();
        let stderr = io::stderr();
        let mut f = stderr.lock();
        let _ = writeln!(f, "{}", line);
    }
}

lazy_static! {
    static ref LOGGER: Mutex<Box<dyn Logger>> = Mutex::new(Box::new(StderrLog));
}

/// Replace the process-global printer.
pub fn set_logger(logger: Box<dyn Logger>) {
    if let Ok(mut cell) = LOGGER.lock() {
        *cell = logger;
    }
}

fn write_line(line: &str) {
    if let Ok(mut logger) = LOGGER.lock() {
        logger.write_line(line);
    }
}

pub fn error(line: &str) {
    write_line(&format!("tokenpool: error: {}", line));
}

pub fn warning(line: &str) {
    write_line(&format!("tokenpool: warning: {}", line));
}

pub fn info(line: &str) {
    write_line(&format!("tokenpool: {}", line));
}

pub fn debug(line: &str) {
    write_line(&format!("tokenpool: debug: {}", line));
}

// -1 means "not read from the environment yet".
static DEBUG: AtomicI32 = AtomicI32::new(-1);

/// The debug verbosity, from `TOKENPOOL_DEBUG`.
pub fn debug_level() -> i32 {
    let d = DEBUG.load(Ordering::Relaxed);
    if d >= 0 {
        return d;
    }
    let d = env::var("TOKENPOOL_DEBUG")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
        .max(0);
    DEBUG.store(d, Ordering::Relaxed);
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct CaptureLog(Arc<Mutex<Vec<String>>>);

    impl Logger for CaptureLog {
        fn write_line(&mut self, line: &str) {
            self.0.lock().unwrap().push(String::from(line));
        }
    }

    #[test]
    fn warning_lines_are_prefixed() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        set_logger(Box::new(CaptureLog(lines.clone())));
        warning("something odd");
        assert_eq!(
            *lines.lock().unwrap(),
            vec![String::from("tokenpool: warning: something odd")]
        );
        set_logger(Box::new(StderrLog));
    }
}
