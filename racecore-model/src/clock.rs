/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Vector clocks over sparse thread-id maps.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::tid::ThreadId;

/// One thread's logical clock value. Monotonically non-decreasing per thread.
pub type Timestamp = u64;

/// A mapping from thread id to logical clock. Absent entries read as zero, so
/// every operation is total over the space of thread ids.
///
/// INVARIANT: a thread's own component of its own clock never decreases.
///
/// NB: BTreeMap over HashMap so that iteration (and hence logging and race
/// tie-breaking downstream) is deterministic.
#[derive(PartialEq, Debug, Eq, Clone, Default, Serialize, Deserialize)]
pub struct VectorClock {
    clocks: BTreeMap<ThreadId, Timestamp>,
}

impl VectorClock {
    /// An empty clock, all components zero.
    pub fn new() -> Self {
        Default::default()
    }

    /// Read one component. Missing entries are zero.
    pub fn get(&self, tid: ThreadId) -> Timestamp {
        self.clocks.get(&tid).copied().unwrap_or(0)
    }

    /// Overwrite one component.
    pub fn set(&mut self, tid: ThreadId, clk: Timestamp) {
        self.clocks.insert(tid, clk);
    }

    /// Advance one component by one tick.
    pub fn increment(&mut self, tid: ThreadId) {
        *self.clocks.entry(tid).or_insert(0) += 1;
    }

    /// Pointwise maximum: `self = max(self, other)`.
    pub fn join(&mut self, other: &VectorClock) {
        for (tid, clk) in other.clocks.iter() {
            let mine = self.clocks.entry(*tid).or_insert(0);
            *mine = (*mine).max(*clk);
        }
    }

    /// Strict happens-before: every component of `self` is <= the matching
    /// component of `other`, and at least one is strictly less. Equal clocks
    /// are NOT ordered.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        let mut some_lt = false;
        for (tid, clk) in self.clocks.iter() {
            let theirs = other.get(*tid);
            if *clk > theirs {
                return false;
            }
            if *clk < theirs {
                some_lt = true;
            }
        }
        // Components present only on the other side are > our implicit zero.
        some_lt
            || other
                .clocks
                .iter()
                .any(|(tid, clk)| *clk > 0 && !self.clocks.contains_key(tid))
    }

    /// Reset every component to zero.
    pub fn clear(&mut self) {
        self.clocks.clear();
    }

    /// True if every component is zero.
    pub fn is_empty(&self) -> bool {
        self.clocks.values().all(|c| *c == 0)
    }

    /// Iterate over the nonzero components in thread-id order.
    pub fn iter(&self) -> impl Iterator<Item = (ThreadId, Timestamp)> + '_ {
        self.clocks.iter().map(|(t, c)| (*t, *c))
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<")?;
        for (i, (tid, clk)) in self.clocks.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}:{}", tid, clk)?;
        }
        write!(f, ">")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn t(raw: u64) -> ThreadId {
        ThreadId::from_raw(raw)
    }

    #[test]
    fn missing_components_read_zero() {
        let vc = VectorClock::new();
        assert_eq!(vc.get(t(7)), 0);
    }

    #[test]
    fn join_is_pointwise_max() {
        let mut a = VectorClock::new();
        a.set(t(1), 2);
        a.set(t(2), 1);
        let mut b = VectorClock::new();
        b.set(t(1), 1);
        b.set(t(2), 3);
        b.set(t(3), 2);
        a.join(&b);
        assert_eq!(a.get(t(1)), 2);
        assert_eq!(a.get(t(2)), 3);
        assert_eq!(a.get(t(3)), 2);
    }

    #[test]
    fn happens_before_is_strict() {
        let mut a = VectorClock::new();
        a.set(t(1), 1);
        let b = a.clone();
        assert!(!a.happens_before(&b));
        a.increment(t(1));
        assert!(b.happens_before(&a));
        assert!(!a.happens_before(&b));
    }

    #[test]
    fn empty_clock_precedes_any_nonzero() {
        let empty = VectorClock::new();
        let mut b = VectorClock::new();
        b.set(t(1), 1);
        assert!(empty.happens_before(&b));
        assert!(!b.happens_before(&empty));
        assert!(!empty.happens_before(&VectorClock::new()));
    }

    #[test]
    fn concurrent_clocks_are_unordered() {
        let mut a = VectorClock::new();
        a.set(t(1), 2);
        a.set(t(2), 1);
        let mut b = VectorClock::new();
        b.set(t(1), 1);
        b.set(t(2), 2);
        assert!(!a.happens_before(&b));
        assert!(!b.happens_before(&a));
    }
}
