/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The hybrid happens-before + lockset analyzer.
//!
//! A depth-1 variant of the multi-lockset analyzer: per unit and per thread
//! only the most recent read and write summary (epoch + lockset) is kept.
//! Cheaper than full histories, at the cost of missing races that only an
//! older, differently-locked access would expose.

use std::collections::BTreeMap;

use racecore_model::clock::Timestamp;
use racecore_model::lockset::LockSet;
use racecore_model::tid::ThreadId;

use crate::detector::AccessContext;
use crate::detector::AccessMeta;
use crate::detector::AccessPolicy;
use crate::events::AccessKind;
use crate::sinfo::InstRef;

/// The most recent access of one thread to one unit.
#[derive(Debug, Clone)]
struct Summary {
    epoch: Timestamp,
    lockset: LockSet,
    inst: InstRef,
}

/// Per-unit state of the hybrid analyzer.
#[derive(Debug, Default)]
pub struct HybridMeta {
    writer: BTreeMap<ThreadId, Summary>,
    reader: BTreeMap<ThreadId, Summary>,
}

#[derive(Debug, Default)]
pub struct Hybrid;

/// Race condition shared by all four scans: not ordered before the current
/// access, and no common lock.
fn races_with(summary: &Summary, observed: Timestamp, lockset: &LockSet) -> bool {
    summary.epoch > observed && summary.lockset.is_disjoint(lockset)
}

impl AccessPolicy for Hybrid {
    type Ext = HybridMeta;

    const NAME: &'static str = "hybrid";

    fn on_read(&mut self, ctx: &AccessContext<'_>, meta: &mut AccessMeta<HybridMeta>) {
        let addr = meta.addr;
        let ext = &mut meta.ext;
        let lockset = ctx.full_lockset;
        let mut racy = false;
        for (tid, summary) in ext.writer.iter() {
            if *tid == ctx.tid {
                continue;
            }
            if races_with(summary, ctx.vc.get(*tid), lockset) {
                racy = true;
                ctx.report_race(addr, *tid, &summary.inst, AccessKind::Write, AccessKind::Read);
            }
        }
        ext.reader.insert(
            ctx.tid,
            Summary {
                epoch: ctx.epoch(),
                lockset: lockset.clone(),
                inst: ctx.inst.clone(),
            },
        );
        if racy {
            meta.racy = true;
        }
    }

    fn on_write(&mut self, ctx: &AccessContext<'_>, meta: &mut AccessMeta<HybridMeta>) {
        let addr = meta.addr;
        let ext = &mut meta.ext;
        let lockset = ctx.writer_lockset;
        let mut racy = false;
        for (tid, summary) in ext.writer.iter() {
            if *tid == ctx.tid {
                continue;
            }
            if races_with(summary, ctx.vc.get(*tid), lockset) {
                racy = true;
                ctx.report_race(addr, *tid, &summary.inst, AccessKind::Write, AccessKind::Write);
            }
        }
        for (tid, summary) in ext.reader.iter() {
            if *tid == ctx.tid {
                continue;
            }
            if races_with(summary, ctx.vc.get(*tid), lockset) {
                racy = true;
                ctx.report_race(addr, *tid, &summary.inst, AccessKind::Read, AccessKind::Write);
            }
        }
        ext.writer.insert(
            ctx.tid,
            Summary {
                epoch: ctx.epoch(),
                lockset: lockset.clone(),
                inst: ctx.inst.clone(),
            },
        );
        if racy {
            meta.racy = true;
        }
    }
}
