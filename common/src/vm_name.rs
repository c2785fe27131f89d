// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DNS-safe VM names
//!
//! Caller-proposed VM names are free text; the backend requires a
//! DNS-safe token.  [`sanitize_vm_name`] performs the lossy cleanup pass
//! and [`VmName`] can only be constructed from a string that survives
//! validation, so everything past request validation carries a name
//! known to be safe.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Maximum length of a VM name, per DNS label conventions.
pub const MAX_VM_NAME_LEN: usize = 63;

/// A validated, DNS-safe VM name
///
/// Matches `^[a-z0-9]([a-z0-9.-]*[a-z0-9])?$` and is at most
/// [`MAX_VM_NAME_LEN`] characters.  Construct one via
/// `VmName::try_from(String)` (typically on the output of
/// [`sanitize_vm_name`]).
#[derive(
    Clone, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(try_from = "String")]
pub struct VmName(String);

impl TryFrom<String> for VmName {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.len() > MAX_VM_NAME_LEN {
            return Err(format!(
                "name may contain at most {} characters",
                MAX_VM_NAME_LEN
            ));
        }

        let mut iter = value.chars();
        let first = iter.next().ok_or_else(|| {
            String::from("name requires at least one character")
        })?;
        if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
            return Err(String::from(
                "name must begin with a lowercase ASCII letter or digit",
            ));
        }

        let mut last = first;
        for c in iter {
            last = c;
            if !c.is_ascii_lowercase()
                && !c.is_ascii_digit()
                && c != '-'
                && c != '.'
            {
                return Err(format!(
                    "name contains invalid character: \"{}\" (allowed \
                     characters are lowercase ASCII, digits, \"-\", and \
                     \".\")",
                    c
                ));
            }
        }

        if last == '-' || last == '.' {
            return Err(String::from("name cannot end with a separator"));
        }

        Ok(VmName(value))
    }
}

impl FromStr for VmName {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        VmName::try_from(String::from(value))
    }
}

impl fmt::Display for VmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl VmName {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// Reduce an arbitrary proposed name to a DNS-safe token
///
/// Lowercases the input, maps every character outside `[a-z0-9.-]` to a
/// hyphen, collapses each run of separators to the run's first
/// separator, strips leading and trailing separators, and truncates to
/// [`MAX_VM_NAME_LEN`] characters (re-stripping any separator the
/// truncation exposes).  Returns `None` when nothing usable remains.
///
/// The result, when `Some`, always passes `VmName` validation.
pub fn sanitize_vm_name(proposed: &str) -> Option<String> {
    let mut out = String::with_capacity(proposed.len());
    let mut pending_sep: Option<char> = None;

    for c in proposed.trim().chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if let Some(sep) = pending_sep.take() {
                // Separators before the first real character are
                // dropped, not emitted.
                if !out.is_empty() {
                    out.push(sep);
                }
            }
            out.push(c);
        } else {
            // '-' and '.' keep their identity; everything else
            // degrades to '-'.  Only the first separator of a run
            // survives.
            let sep = if c == '.' { '.' } else { '-' };
            pending_sep.get_or_insert(sep);
        }
    }
    // A trailing run of separators is dropped with `pending_sep`.

    out.truncate(MAX_VM_NAME_LEN);
    while out.ends_with('-') || out.ends_with('.') {
        out.pop();
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}
