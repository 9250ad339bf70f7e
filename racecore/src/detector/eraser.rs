/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The Eraser lockset analyzer.
//!
//! Each unit moves through the classic ownership states; once it is shared,
//! the candidate lockset is refined by intersection with the locks held at
//! each access. An empty candidate set in the shared-modified state is a
//! race. No vector clocks: fork/join ordering is invisible to this analyzer.

use racecore_model::lockset::LockSet;
use racecore_model::tid::ThreadId;

use crate::detector::AccessContext;
use crate::detector::AccessMeta;
use crate::detector::AccessPolicy;
use crate::events::AccessKind;
use crate::sinfo::InstRef;

/// Ownership state of one unit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Never accessed.
    #[default]
    Virgin,
    /// Only ever touched by one thread.
    Exclusive(ThreadId),
    /// Read-shared across threads.
    Shared,
    /// Written while shared.
    SharedModified,
}

/// Per-unit state of the Eraser analyzer.
#[derive(Debug, Default)]
pub struct EraserMeta {
    state: State,
    /// Candidate locks that protected every shared access so far. Only
    /// meaningful outside Virgin/Exclusive.
    candidates: LockSet,
    /// Last write, for pairing in the report.
    last_write: Option<(ThreadId, InstRef)>,
    /// Last access of any kind, for pairing in the report.
    last_access: Option<(ThreadId, InstRef, AccessKind)>,
}

#[derive(Debug, Default)]
pub struct Eraser;

impl Eraser {
    fn report(ctx: &AccessContext<'_>, meta: &mut AccessMeta<EraserMeta>, kind: AccessKind) {
        // One report per unit: the sticky racy flag doubles as "already
        // reported" for this location.
        if meta.racy {
            return;
        }
        meta.racy = true;
        // Prefer pairing against the last write; a racy location has seen
        // at least one write by the time the candidate set empties.
        let (tid, inst, prior_kind) = match (&meta.ext.last_write, &meta.ext.last_access) {
            (Some((tid, inst)), _) if kind == AccessKind::Read => {
                (*tid, inst.clone(), AccessKind::Write)
            }
            (_, Some((tid, inst, prior_kind))) => (*tid, inst.clone(), *prior_kind),
            (Some((tid, inst)), None) => (*tid, inst.clone(), AccessKind::Write),
            (None, None) => return,
        };
        ctx.report_race(meta.addr, tid, &inst, prior_kind, kind);
    }
}

impl AccessPolicy for Eraser {
    type Ext = EraserMeta;

    const NAME: &'static str = "eraser";

    fn on_read(&mut self, ctx: &AccessContext<'_>, meta: &mut AccessMeta<EraserMeta>) {
        let lockset = ctx.full_lockset;
        match meta.ext.state {
            State::Virgin => meta.ext.state = State::Exclusive(ctx.tid),
            State::Exclusive(owner) if owner == ctx.tid => {}
            State::Exclusive(_) => {
                // First shared access initializes the candidate set.
                meta.ext.state = State::Shared;
                meta.ext.candidates = lockset.clone();
            }
            State::Shared => {
                meta.ext.candidates.intersect(lockset);
            }
            State::SharedModified => {
                meta.ext.candidates.intersect(lockset);
                if meta.ext.candidates.is_empty() {
                    Self::report(ctx, meta, AccessKind::Read);
                }
            }
        }
        meta.ext.last_access = Some((ctx.tid, ctx.inst.clone(), AccessKind::Read));
    }

    fn on_write(&mut self, ctx: &AccessContext<'_>, meta: &mut AccessMeta<EraserMeta>) {
        let lockset = ctx.writer_lockset;
        match meta.ext.state {
            State::Virgin => meta.ext.state = State::Exclusive(ctx.tid),
            State::Exclusive(owner) if owner == ctx.tid => {}
            State::Exclusive(_) => {
                meta.ext.state = State::SharedModified;
                meta.ext.candidates = lockset.clone();
                if meta.ext.candidates.is_empty() {
                    Self::report(ctx, meta, AccessKind::Write);
                }
            }
            State::Shared | State::SharedModified => {
                meta.ext.state = State::SharedModified;
                meta.ext.candidates.intersect(lockset);
                if meta.ext.candidates.is_empty() {
                    Self::report(ctx, meta, AccessKind::Write);
                }
            }
        }
        meta.ext.last_write = Some((ctx.tid, ctx.inst.clone()));
        meta.ext.last_access = Some((ctx.tid, ctx.inst.clone(), AccessKind::Write));
    }
}
