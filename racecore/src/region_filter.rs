/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Disjoint-interval set over known address regions (heap, data, bss).
//!
//! Every memory or allocation callback consults the filter before touching
//! meta tables, so addresses outside known regions are ignored.

use std::collections::BTreeMap;
use std::sync::Mutex;

use racecore_model::Address;
use tracing::warn;

/// An ordered set of disjoint `[start, start+size)` intervals with its own
/// mutex. Lookup is O(log n).
#[derive(Debug, Default)]
pub struct RegionFilter {
    regions: Mutex<BTreeMap<Address, u64>>,
}

impl RegionFilter {
    /// Create an empty filter.
    pub fn new() -> Self {
        Default::default()
    }

    /// Register a region. Overlapping registrations keep the new extent for
    /// the given start address.
    pub fn add(&self, addr: Address, size: u64) {
        debug_assert!(addr != 0 && size != 0);
        let mut regions = self.regions.lock().unwrap();
        regions.insert(addr, size);
    }

    /// Remove the region starting at `addr`, returning its size. Unknown
    /// addresses remove nothing and return zero.
    pub fn remove(&self, addr: Address) -> u64 {
        let mut regions = self.regions.lock().unwrap();
        match regions.remove(&addr) {
            Some(size) => size,
            None => {
                warn!("[region-filter] remove of unknown region {:#x}", addr);
                0
            }
        }
    }

    /// Is `addr` inside any known region?
    pub fn contains(&self, addr: Address) -> bool {
        let regions = self.regions.lock().unwrap();
        match regions.range(..=addr).next_back() {
            Some((start, size)) => addr < start + size,
            None => false,
        }
    }
}
