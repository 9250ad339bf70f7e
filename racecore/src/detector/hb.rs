/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The pure happens-before analyzer.
//!
//! Per unit it keeps the last read and last write epoch of each thread. An
//! access races with a remote summary exactly when the summary's epoch is
//! not covered by the current thread's view of that thread; locks matter
//! only through the vector-clock edges they induce.

use std::collections::BTreeMap;

use racecore_model::clock::Timestamp;
use racecore_model::tid::ThreadId;

use crate::detector::AccessContext;
use crate::detector::AccessMeta;
use crate::detector::AccessPolicy;
use crate::events::AccessKind;
use crate::sinfo::InstRef;

/// The last access of one thread to one unit.
#[derive(Debug, Clone)]
struct Summary {
    epoch: Timestamp,
    inst: InstRef,
}

/// Per-unit state of the happens-before analyzer.
#[derive(Debug, Default)]
pub struct HbMeta {
    last_write: BTreeMap<ThreadId, Summary>,
    last_read: BTreeMap<ThreadId, Summary>,
}

#[derive(Debug, Default)]
pub struct HappensBefore;

impl AccessPolicy for HappensBefore {
    type Ext = HbMeta;

    const NAME: &'static str = "hb";

    fn on_read(&mut self, ctx: &AccessContext<'_>, meta: &mut AccessMeta<HbMeta>) {
        let addr = meta.addr;
        let ext = &mut meta.ext;
        let mut racy = false;
        for (tid, summary) in ext.last_write.iter() {
            if *tid == ctx.tid {
                continue;
            }
            if summary.epoch > ctx.vc.get(*tid) {
                racy = true;
                ctx.report_race(addr, *tid, &summary.inst, AccessKind::Write, AccessKind::Read);
            }
        }
        ext.last_read.insert(
            ctx.tid,
            Summary {
                epoch: ctx.epoch(),
                inst: ctx.inst.clone(),
            },
        );
        if racy {
            meta.racy = true;
        }
    }

    fn on_write(&mut self, ctx: &AccessContext<'_>, meta: &mut AccessMeta<HbMeta>) {
        let addr = meta.addr;
        let ext = &mut meta.ext;
        let mut racy = false;
        for (tid, summary) in ext.last_write.iter() {
            if *tid == ctx.tid {
                continue;
            }
            if summary.epoch > ctx.vc.get(*tid) {
                racy = true;
                ctx.report_race(addr, *tid, &summary.inst, AccessKind::Write, AccessKind::Write);
            }
        }
        for (tid, summary) in ext.last_read.iter() {
            if *tid == ctx.tid {
                continue;
            }
            if summary.epoch > ctx.vc.get(*tid) {
                racy = true;
                ctx.report_race(addr, *tid, &summary.inst, AccessKind::Read, AccessKind::Write);
            }
        }
        ext.last_write.insert(
            ctx.tid,
            Summary {
                epoch: ctx.epoch(),
                inst: ctx.inst.clone(),
            },
        );
        if racy {
            meta.racy = true;
        }
    }
}
