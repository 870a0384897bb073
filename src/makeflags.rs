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

//! `MAKEFLAGS` discovery.
//!
//! A make parent advertises its jobserver in `MAKEFLAGS`, mixed in with
//! whatever other flags it was run with, e.g.
//! ` -j --jobserver-auth=3,4 -l8`.  We only pull out the jobserver address
//! and the `-l` load ceiling; the transport decides whether the address
//! actually works.  Anything malformed simply reads as "no jobserver" so
//! the caller can fall back to standalone operation.

use std::env;

/// What the parent advertised in `MAKEFLAGS`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MakeFlags {
    /// Raw payload of `--jobserver-auth=`/`--jobserver-fds=`: an `R,W` fd
    /// pair on POSIX, a semaphore name on Windows.
    pub(crate) auth: String,
    /// `N` from the first ` -lN` fragment, if it parses to a positive
    /// integer.
    pub(crate) load_limit: Option<u32>,
}

/// Scan the process environment for an advertised jobserver.
pub(crate) fn scan() -> Option<MakeFlags> {
    parse(&env::var("MAKEFLAGS").ok()?)
}

/// Parse a `MAKEFLAGS` value.  Returns `None` if no jobserver is advertised.
pub(crate) fn parse(value: &str) -> Option<MakeFlags> {
    // GNU make >= 4.2 advertises --jobserver-auth, older versions
    // --jobserver-fds.  Both may be present; the new spelling wins.
    let auth = flag_value(value, "--jobserver-auth=")
        .or_else(|| flag_value(value, "--jobserver-fds="))?;
    Some(MakeFlags {
        auth: String::from(auth),
        load_limit: load_limit(value),
    })
}

/// The payload of `name` up to the next space, if the flag is present.
fn flag_value<'a>(flags: &'a str, name: &str) -> Option<&'a str> {
    let start = flags.find(name)? + name.len();
    flags[start..].split(' ').next()
}

fn load_limit(flags: &str) -> Option<u32> {
    let start = flags.find(" -l")? + " -l".len();
    let rest = &flags[start..];
    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    match rest[..end].parse() {
        Ok(n) if n > 0 => Some(n),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_jobserver() {
        assert_eq!(parse(""), None);
        assert_eq!(parse(" -j8 -l4"), None);
    }

    #[test]
    fn new_style_auth() {
        assert_eq!(
            parse("foo --jobserver-auth=3,4 bar"),
            Some(MakeFlags {
                auth: String::from("3,4"),
                load_limit: None,
            })
        );
    }

    #[test]
    fn old_style_fds() {
        assert_eq!(
            parse(" -j --jobserver-fds=5,6"),
            Some(MakeFlags {
                auth: String::from("5,6"),
                load_limit: None,
            })
        );
    }

    #[test]
    fn auth_wins_over_fds() {
        let flags = parse(" --jobserver-fds=3,4 --jobserver-auth=5,6").unwrap();
        assert_eq!(flags.auth, "5,6");
    }

    #[test]
    fn payload_stops_at_space() {
        let flags = parse("foo --jobserver-auth=gmake_semaphore_42 bar").unwrap();
        assert_eq!(flags.auth, "gmake_semaphore_42");
    }

    #[test]
    fn payload_at_end_of_string() {
        let flags = parse(" -j --jobserver-auth=3,4").unwrap();
        assert_eq!(flags.auth, "3,4");
    }

    #[test]
    fn load_limit_forwarded() {
        let flags = parse("foo -l9 --jobserver-auth=3,4 bar").unwrap();
        assert_eq!(flags.load_limit, Some(9));
    }

    #[test]
    fn load_limit_zero_rejected() {
        let flags = parse(" -l0 --jobserver-auth=3,4").unwrap();
        assert_eq!(flags.load_limit, None);
    }

    #[test]
    fn load_limit_malformed_rejected() {
        let flags = parse(" -lfoo --jobserver-auth=3,4").unwrap();
        assert_eq!(flags.load_limit, None);
    }
}
