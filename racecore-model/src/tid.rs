/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Identity of one application thread as observed by the engine.
///
/// Ids are assigned monotonically by the instrumentation runtime and are
/// never reused within a program run.
#[derive(
    PartialEq, // Silly protection from rustfmt disagreements.
    Debug,
    Eq,
    Clone,
    Copy,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Default,
)]
pub struct ThreadId(u64);

impl ThreadId {
    /// The distinguished "no thread" value, used e.g. as the parent of the
    /// root thread.
    pub const INVALID: ThreadId = ThreadId(u64::MAX);

    /// Create a ThreadId from a raw id.
    pub const fn from_raw(tid: u64) -> ThreadId {
        ThreadId(tid)
    }

    /// Convert to a raw integer.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// False for the `INVALID` sentinel.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ThreadId {
    type Err = <u64 as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_raw(s.parse::<u64>()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_is_not_valid() {
        assert!(!ThreadId::INVALID.is_valid());
        assert!(ThreadId::from_raw(0).is_valid());
    }

    #[test]
    fn roundtrip_raw() {
        let t = ThreadId::from_raw(42);
        assert_eq!(t.as_raw(), 42);
        assert_eq!("42".parse::<ThreadId>().unwrap(), t);
    }
}
