/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The multi-lockset happens-before analyzer.
//!
//! Per unit and per thread it keeps the *non-dominated* history of accesses
//! as (epoch, lockset) entries. An entry dominates an older one from the
//! same thread when its epoch is >= and its lockset is a subset; dominated
//! entries are pruned so the histories stay bounded. An access races with a
//! remote history entry when the entry's epoch is not covered by the current
//! thread's view of that thread AND the two locksets share no lock.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use racecore_model::clock::Timestamp;
use racecore_model::lockset::LockSet;
use racecore_model::tid::ThreadId;

use crate::detector::AccessContext;
use crate::detector::AccessMeta;
use crate::detector::AccessPolicy;
use crate::events::AccessKind;
use crate::race_db::RaceDB;
use crate::sinfo::InstRef;

/// One non-dominated access summary.
#[derive(Debug, Clone)]
pub struct EpochLockSet {
    pub epoch: Timestamp,
    pub lockset: LockSet,
}

/// Per-unit state of the multi-lockset HB analyzer.
#[derive(Debug, Default)]
pub struct MlMeta {
    /// Non-dominated writes, per thread, in insertion order.
    writer_history: BTreeMap<ThreadId, Vec<EpochLockSet>>,
    /// Non-dominated reads, per thread, in insertion order.
    reader_history: BTreeMap<ThreadId, Vec<EpochLockSet>>,
    /// Last witnessing write instruction per thread.
    writer_inst: BTreeMap<ThreadId, InstRef>,
    /// Last witnessing read instruction per thread.
    reader_inst: BTreeMap<ThreadId, InstRef>,
    /// Every instruction that touched this unit, kept only when racy
    /// instructions are being tracked.
    race_insts: BTreeSet<InstRef>,
}

/// The policy itself is stateless: per-thread locksets live in the
/// framework and per-unit history in the meta extension.
#[derive(Debug, Default)]
pub struct MultiLockHb;

/// Is the incoming access (epoch, lockset) already covered by a history
/// entry at the same epoch with a subset lockset? (The smaller set races
/// whenever the bigger one would.)
fn dominated(history: Option<&Vec<EpochLockSet>>, epoch: Timestamp, lockset: &LockSet) -> bool {
    history.map_or(false, |entries| {
        entries
            .iter()
            .any(|e| e.epoch == epoch && e.lockset.is_subset(lockset))
    })
}

/// Remove entries the new (epoch, lockset) summary dominates: older epoch
/// and a superset lockset. `keep_last` protects the entry just appended,
/// which would otherwise dominate itself.
fn prune(history: &mut Vec<EpochLockSet>, epoch: Timestamp, lockset: &LockSet, keep_last: bool) {
    let last = history.len().wrapping_sub(1);
    let mut idx = 0;
    history.retain(|e| {
        let keep = (keep_last && idx == last) || !(e.epoch <= epoch && lockset.is_subset(&e.lockset));
        idx += 1;
        keep
    });
}

impl AccessPolicy for MultiLockHb {
    type Ext = MlMeta;

    const NAME: &'static str = "multilock-hb";

    fn on_read(&mut self, ctx: &AccessContext<'_>, meta: &mut AccessMeta<MlMeta>) {
        let addr = meta.addr;
        let ext = &mut meta.ext;
        let epoch = ctx.epoch();
        // Reads may share a reader lock, so they are judged with the full
        // (writer + reader) lockset.
        let lockset = ctx.full_lockset;

        // Skip accesses already covered by this thread's histories.
        if dominated(ext.reader_history.get(&ctx.tid), epoch, lockset)
            || dominated(ext.writer_history.get(&ctx.tid), epoch, lockset)
        {
            return;
        }

        let history = ext.reader_history.entry(ctx.tid).or_default();
        history.push(EpochLockSet {
            epoch,
            lockset: lockset.clone(),
        });
        prune(history, epoch, lockset, true);

        // write -> read races against every other thread's write history.
        let mut racy = false;
        for (tid, entries) in ext.writer_history.iter() {
            if *tid == ctx.tid {
                continue;
            }
            let observed = ctx.vc.get(*tid);
            for entry in entries {
                if entry.epoch > observed && entry.lockset.is_disjoint(lockset) {
                    racy = true;
                    let writer_inst = &ext.writer_inst[tid];
                    ctx.report_race(addr, *tid, writer_inst, AccessKind::Write, AccessKind::Read);
                }
            }
        }
        if racy {
            meta.racy = true;
        }

        meta.ext.reader_inst.insert(ctx.tid, ctx.inst.clone());
        if ctx.track_racy_inst {
            meta.ext.race_insts.insert(ctx.inst.clone());
        }
    }

    fn on_write(&mut self, ctx: &AccessContext<'_>, meta: &mut AccessMeta<MlMeta>) {
        let addr = meta.addr;
        let ext = &mut meta.ext;
        let epoch = ctx.epoch();
        // Writes must not share even a reader lock: the writer set alone.
        let lockset = ctx.writer_lockset;

        if dominated(ext.writer_history.get(&ctx.tid), epoch, lockset) {
            return;
        }

        let history = ext.writer_history.entry(ctx.tid).or_default();
        history.push(EpochLockSet {
            epoch,
            lockset: lockset.clone(),
        });
        prune(history, epoch, lockset, true);
        // A write also subsumes this thread's older reads it dominates.
        if let Some(reads) = ext.reader_history.get_mut(&ctx.tid) {
            prune(reads, epoch, lockset, false);
        }

        let mut racy = false;
        // write -> write races.
        for (tid, entries) in ext.writer_history.iter() {
            if *tid == ctx.tid {
                continue;
            }
            let observed = ctx.vc.get(*tid);
            for entry in entries {
                if entry.epoch > observed && entry.lockset.is_disjoint(lockset) {
                    racy = true;
                    let writer_inst = &ext.writer_inst[tid];
                    ctx.report_race(addr, *tid, writer_inst, AccessKind::Write, AccessKind::Write);
                }
            }
        }
        // read -> write races.
        for (tid, entries) in ext.reader_history.iter() {
            if *tid == ctx.tid {
                continue;
            }
            let observed = ctx.vc.get(*tid);
            for entry in entries {
                if entry.epoch > observed && entry.lockset.is_disjoint(lockset) {
                    racy = true;
                    let reader_inst = &ext.reader_inst[tid];
                    ctx.report_race(addr, *tid, reader_inst, AccessKind::Read, AccessKind::Write);
                }
            }
        }
        if racy {
            meta.racy = true;
        }

        meta.ext.writer_inst.insert(ctx.tid, ctx.inst.clone());
        if ctx.track_racy_inst {
            meta.ext.race_insts.insert(ctx.inst.clone());
        }
    }

    fn on_free(&mut self, meta: AccessMeta<MlMeta>, race_db: &RaceDB, track_racy_inst: bool) {
        // Flush the racy instruction set before the histories disappear.
        if track_racy_inst && meta.racy {
            for inst in meta.ext.race_insts.iter() {
                race_db.set_racy_inst(inst, true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn els(epoch: Timestamp, locks: &[u64]) -> EpochLockSet {
        let mut lockset = LockSet::new();
        for l in locks {
            lockset.add(*l);
        }
        EpochLockSet { epoch, lockset }
    }

    #[test]
    fn prune_removes_dominated_entries() {
        // A later write under {a} dominates an earlier write under {a,b}.
        let mut history = vec![els(5, &[1, 2])];
        let mut new = LockSet::new();
        new.add(1);
        history.push(EpochLockSet {
            epoch: 7,
            lockset: new.clone(),
        });
        prune(&mut history, 7, &new, true);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].epoch, 7);
    }

    #[test]
    fn prune_is_idempotent() {
        let mut history = vec![els(3, &[1]), els(5, &[2])];
        let mut new = LockSet::new();
        new.add(2);
        history.push(EpochLockSet {
            epoch: 6,
            lockset: new.clone(),
        });
        prune(&mut history, 6, &new, true);
        let once = history
            .iter()
            .map(|e| e.epoch)
            .collect::<Vec<_>>();
        prune(&mut history, 6, &new, true);
        let twice = history.iter().map(|e| e.epoch).collect::<Vec<_>>();
        assert_eq!(once, twice);
        // (3, {1}) survives: {2} is not a subset of {1}.
        assert_eq!(once, vec![3, 6]);
    }

    #[test]
    fn domination_requires_equal_epoch_and_subset() {
        let history = vec![els(4, &[1])];
        let mut bigger = LockSet::new();
        bigger.add(1);
        bigger.add(2);
        // Same epoch, existing {1} is a subset of {1,2}: dominated.
        assert!(dominated(Some(&history), 4, &bigger));
        // Different epoch: not dominated.
        assert!(!dominated(Some(&history), 5, &bigger));
        // Existing {1} is not a subset of {2}: not dominated.
        let mut other = LockSet::new();
        other.add(2);
        assert!(!dominated(Some(&history), 4, &other));
    }
}
