/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Sets of held lock identifiers.

use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::Address;

/// The identity of a synchronization object: its address. Two lock objects at
/// the same address are the same lock.
pub type LockId = Address;

/// An unordered set of lock ids. Equality is by contents.
///
/// INVARIANT: the set held for a thread reflects exactly the nesting of lock
/// acquisitions it has performed minus releases.
#[derive(PartialEq, Debug, Eq, Clone, Default, Serialize, Deserialize)]
pub struct LockSet {
    locks: BTreeSet<LockId>,
}

impl LockSet {
    /// The empty lockset.
    pub fn new() -> Self {
        Default::default()
    }

    /// Record an acquisition.
    pub fn add(&mut self, lock: LockId) {
        self.locks.insert(lock);
    }

    /// Record a release. Returns true if the lock was held.
    pub fn remove(&mut self, lock: LockId) -> bool {
        self.locks.remove(&lock)
    }

    /// Is this lock currently in the set?
    pub fn contains(&self, lock: LockId) -> bool {
        self.locks.contains(&lock)
    }

    /// Union `other` into `self`.
    pub fn join(&mut self, other: &LockSet) {
        self.locks.extend(other.locks.iter().copied());
    }

    /// Is every lock of `self` also in `other`?
    pub fn is_subset(&self, other: &LockSet) -> bool {
        self.locks.is_subset(&other.locks)
    }

    /// Do the two sets share no lock? Two empty sets ARE disjoint: "no lock
    /// held by either" is exactly the unprotected case.
    pub fn is_disjoint(&self, other: &LockSet) -> bool {
        self.locks.is_disjoint(&other.locks)
    }

    /// Keep only the locks also present in `other`.
    pub fn intersect(&mut self, other: &LockSet) {
        self.locks.retain(|l| other.contains(*l));
    }

    /// Number of held locks.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no lock is held.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Iterate the lock ids in address order.
    pub fn iter(&self) -> impl Iterator<Item = LockId> + '_ {
        self.locks.iter().copied()
    }
}

impl fmt::Display for LockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, lock) in self.locks.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:#x}", lock)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sets_are_disjoint() {
        let a = LockSet::new();
        let b = LockSet::new();
        assert!(a.is_disjoint(&b));
    }

    #[test]
    fn equality_is_by_contents() {
        let mut a = LockSet::new();
        a.add(2);
        a.add(1);
        let mut b = LockSet::new();
        b.add(1);
        b.add(2);
        assert_eq!(a, b);
    }

    #[test]
    fn subset_and_disjoint() {
        let mut a = LockSet::new();
        a.add(1);
        let mut ab = LockSet::new();
        ab.add(1);
        ab.add(2);
        assert!(a.is_subset(&ab));
        assert!(!ab.is_subset(&a));
        assert!(!a.is_disjoint(&ab));

        let mut c = LockSet::new();
        c.add(3);
        assert!(ab.is_disjoint(&c));
        // The empty set is a subset of everything, including itself.
        assert!(LockSet::new().is_subset(&a));
        assert!(LockSet::new().is_subset(&LockSet::new()));
    }

    #[test]
    fn join_then_intersect() {
        let mut a = LockSet::new();
        a.add(1);
        let mut b = LockSet::new();
        b.add(2);
        a.join(&b);
        assert!(a.contains(1) && a.contains(2));
        a.intersect(&b);
        assert!(!a.contains(1) && a.contains(2));
    }
}
