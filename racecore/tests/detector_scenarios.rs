/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end detector scenarios, driven by hand-built event sequences.
//!
//! The event order mirrors what the instrumentation wrappers produce; in
//! particular a child's `thread_start` is delivered *before* the parent's
//! `after_pthread_create`, because the create wrapper waits for the child
//! to start before returning.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use racecore::analyzer::Analyzer;
use racecore::detector::eraser::Eraser;
use racecore::detector::hb::HappensBefore;
use racecore::detector::hybrid::Hybrid;
use racecore::detector::multilock_hb::MultiLockHb;
use racecore::detector::AccessPolicy;
use racecore::detector::Detector;
use racecore::race_db::RaceDB;
use racecore::sinfo::InstRef;
use racecore::sinfo::StaticInfo;
use racecore::types::Config;
use racecore::types::ThreadId;

const HEAP: u64 = 0x1000;
const MUTEX1: u64 = 0x2000;
const MUTEX2: u64 = 0x2040;
const RWLOCK: u64 = 0x2080;

struct Harness<P: AccessPolicy> {
    detector: Detector<P>,
    race_db: Arc<RaceDB>,
    sinfo: StaticInfo,
}

impl<P: AccessPolicy> Harness<P> {
    fn new(policy: P) -> Self {
        let cfg = Config::default();
        let race_db = Arc::new(RaceDB::new());
        let harness = Harness {
            detector: Detector::new(&cfg, policy, race_db.clone()),
            race_db,
            sinfo: StaticInfo::new(),
        };
        // One heap region covering the monitored address.
        let inst = harness.inst(0x1, 1);
        harness.detector.after_malloc(t(0), 0, &inst, 64, HEAP);
        harness
    }

    fn inst(&self, offset: u64, line: u32) -> InstRef {
        self.sinfo
            .ensure_inst("app", offset, None, Some(("test.cpp", line, 0)))
    }

    fn races(&self) -> usize {
        self.race_db.race_count()
    }
}

fn t(raw: u64) -> ThreadId {
    ThreadId::from_raw(raw)
}

/// Scenario 1: same lock, and the second thread starts only after the
/// first was joined. No race, through both the lock edge and the
/// create/join edges.
#[test]
fn lock_protected_sequential_threads_do_not_race() {
    let h = Harness::new(MultiLockHb);
    let d = &h.detector;
    let (main, t1, t2) = (t(1), t(2), t(3));
    let i_w1 = h.inst(0x10, 10);
    let i_w2 = h.inst(0x20, 20);

    d.thread_start(main, ThreadId::INVALID);

    d.thread_start(t1, main);
    d.after_pthread_create(main, 0, &i_w1, t1);
    d.after_mutex_lock(t1, 0, &i_w1, MUTEX1);
    d.before_mem_write(t1, 0, &i_w1, HEAP, 4);
    d.before_mutex_unlock(t1, 0, &i_w1, MUTEX1);
    d.thread_exit(t1, 0);
    d.after_pthread_join(main, 0, &i_w1, t1);

    d.thread_start(t2, main);
    d.after_pthread_create(main, 0, &i_w2, t2);
    d.after_mutex_lock(t2, 0, &i_w2, MUTEX1);
    d.before_mem_write(t2, 0, &i_w2, HEAP, 4);
    d.before_mutex_unlock(t2, 0, &i_w2, MUTEX1);

    assert_eq!(h.races(), 0);
}

/// Scenario 2: parent writes after creating the child, child writes
/// concurrently, no locks anywhere. Exactly one write/write race.
#[test]
fn unsynchronized_parent_child_writes_race() {
    let h = Harness::new(MultiLockHb);
    let d = &h.detector;
    let (t1, t2) = (t(1), t(2));
    let i1 = h.inst(0x10, 10);
    let i2 = h.inst(0x20, 20);

    d.thread_start(t1, ThreadId::INVALID);
    d.thread_start(t2, t1);
    d.after_pthread_create(t1, 0, &i1, t2);

    d.before_mem_write(t1, 0, &i1, HEAP, 4);
    d.before_mem_write(t2, 0, &i2, HEAP, 4);

    assert_eq!(h.races(), 1);
    let race = &h.race_db.races()[0];
    assert_eq!(race.first_inst.offset, 0x10);
    assert_eq!(race.second_inst.offset, 0x20);
    // Repeating the access does not re-report the same static pair.
    d.before_mem_write(t2, 0, &i2, HEAP, 4);
    assert_eq!(h.races(), 1);
}

/// Scenario 3: both writes are locked, but under different locks.
#[test]
fn wrong_lock_still_races() {
    let h = Harness::new(MultiLockHb);
    let d = &h.detector;
    let (t1, t2) = (t(1), t(2));
    let i1 = h.inst(0x10, 10);
    let i2 = h.inst(0x20, 20);

    d.thread_start(t1, ThreadId::INVALID);
    d.thread_start(t2, t1);
    d.after_pthread_create(t1, 0, &i1, t2);

    d.after_mutex_lock(t1, 0, &i1, MUTEX1);
    d.before_mem_write(t1, 0, &i1, HEAP, 4);
    d.before_mutex_unlock(t1, 0, &i1, MUTEX1);

    d.after_mutex_lock(t2, 0, &i2, MUTEX2);
    d.before_mem_write(t2, 0, &i2, HEAP, 4);
    d.before_mutex_unlock(t2, 0, &i2, MUTEX2);

    assert_eq!(h.races(), 1);
}

/// Scenario 4a: the writer observes the reader's unlock through the
/// rwlock's released clock, so the accesses are ordered.
#[test]
fn rwlock_ordered_reader_then_writer_does_not_race() {
    let h = Harness::new(MultiLockHb);
    let d = &h.detector;
    let (t1, t2) = (t(1), t(2));
    let i1 = h.inst(0x10, 10);
    let i2 = h.inst(0x20, 20);

    d.thread_start(t1, ThreadId::INVALID);
    d.thread_start(t2, t1);
    d.after_pthread_create(t1, 0, &i1, t2);

    d.after_rwlock_rdlock(t1, 0, &i1, RWLOCK);
    d.before_mem_read(t1, 0, &i1, HEAP, 4);
    d.before_rwlock_unlock(t1, 0, &i1, RWLOCK);
    d.after_rwlock_unlock(t1, 0, &i1, RWLOCK);

    d.after_rwlock_wrlock(t2, 0, &i2, RWLOCK);
    d.before_mem_write(t2, 0, &i2, HEAP, 4);
    d.before_rwlock_unlock(t2, 0, &i2, RWLOCK);
    d.after_rwlock_unlock(t2, 0, &i2, RWLOCK);

    assert_eq!(h.races(), 0);
}

/// Scenario 4b: the read and the write are concurrent (no release
/// observed, writer holds no lock): one read/write race.
#[test]
fn rwlock_concurrent_reader_and_writer_race() {
    let h = Harness::new(MultiLockHb);
    let d = &h.detector;
    let (t1, t2) = (t(1), t(2));
    let i1 = h.inst(0x10, 10);
    let i2 = h.inst(0x20, 20);

    d.thread_start(t1, ThreadId::INVALID);
    d.thread_start(t2, t1);
    d.after_pthread_create(t1, 0, &i1, t2);

    d.after_rwlock_rdlock(t1, 0, &i1, RWLOCK);
    d.before_mem_read(t1, 0, &i1, HEAP, 4);
    d.before_rwlock_unlock(t1, 0, &i1, RWLOCK);
    d.after_rwlock_unlock(t1, 0, &i1, RWLOCK);

    // The writer never takes the rwlock, so it observes no release.
    d.before_mem_write(t2, 0, &i2, HEAP, 4);

    assert_eq!(h.races(), 1);
    let race = &h.race_db.races()[0];
    assert_eq!(
        racecore::race_db::race_kind_name(race.first_kind, race.second_kind),
        "RAW"
    );
}

/// A failed trylock must not grow the lockset: the subsequent write is as
/// unprotected as if no lock call had happened.
#[test]
fn failed_trylock_joins_nothing() {
    let h = Harness::new(MultiLockHb);
    let d = &h.detector;
    let (t1, t2) = (t(1), t(2));
    let i1 = h.inst(0x10, 10);
    let i2 = h.inst(0x20, 20);

    d.thread_start(t1, ThreadId::INVALID);
    d.thread_start(t2, t1);
    d.after_pthread_create(t1, 0, &i1, t2);

    d.after_mutex_lock(t1, 0, &i1, MUTEX1);
    d.before_mem_write(t1, 0, &i1, HEAP, 4);
    d.before_mutex_unlock(t1, 0, &i1, MUTEX1);

    // EBUSY: the after handler must be skipped internally.
    d.after_mutex_try_lock(t2, 0, &i2, MUTEX1, 16);
    d.before_mem_write(t2, 0, &i2, HEAP, 4);

    assert_eq!(h.races(), 1);
}

/// Sanity across the rest of the analyzer family on scenarios 2 and 3.
#[test]
fn hb_analyzer_orders_by_clock_only() {
    // Wrong-lock scenario: HB has no order, so it reports.
    let h = Harness::new(HappensBefore);
    let d = &h.detector;
    let (t1, t2) = (t(1), t(2));
    let i1 = h.inst(0x10, 10);
    let i2 = h.inst(0x20, 20);

    d.thread_start(t1, ThreadId::INVALID);
    d.thread_start(t2, t1);
    d.after_pthread_create(t1, 0, &i1, t2);

    d.after_mutex_lock(t1, 0, &i1, MUTEX1);
    d.before_mem_write(t1, 0, &i1, HEAP, 4);
    d.before_mutex_unlock(t1, 0, &i1, MUTEX1);

    // Same lock: the mutex release/acquire edge orders the writes, so
    // even pure HB stays quiet.
    d.after_mutex_lock(t2, 0, &i2, MUTEX1);
    d.before_mem_write(t2, 0, &i2, HEAP, 4);
    d.before_mutex_unlock(t2, 0, &i2, MUTEX1);
    assert_eq!(h.races(), 0);

    // A third thread with a different lock is unordered: HB reports.
    let t3 = t(3);
    let i3 = h.inst(0x30, 30);
    d.thread_start(t3, t1);
    d.after_pthread_create(t1, 0, &i1, t3);
    d.after_mutex_lock(t3, 0, &i3, MUTEX2);
    d.before_mem_write(t3, 0, &i3, HEAP, 4);
    d.before_mutex_unlock(t3, 0, &i3, MUTEX2);
    assert_eq!(h.races(), 1);
}

#[test]
fn eraser_ignores_fork_join_order_but_respects_locks() {
    // Sequential-threads scenario, common lock: quiet.
    let h = Harness::new(Eraser);
    let d = &h.detector;
    let (main, t1, t2) = (t(1), t(2), t(3));
    let i1 = h.inst(0x10, 10);
    let i2 = h.inst(0x20, 20);

    d.thread_start(main, ThreadId::INVALID);
    d.thread_start(t1, main);
    d.after_pthread_create(main, 0, &i1, t1);
    d.after_mutex_lock(t1, 0, &i1, MUTEX1);
    d.before_mem_write(t1, 0, &i1, HEAP, 4);
    d.before_mutex_unlock(t1, 0, &i1, MUTEX1);
    d.thread_exit(t1, 0);
    d.after_pthread_join(main, 0, &i1, t1);

    d.thread_start(t2, main);
    d.after_pthread_create(main, 0, &i2, t2);
    d.after_mutex_lock(t2, 0, &i2, MUTEX1);
    d.before_mem_write(t2, 0, &i2, HEAP, 4);
    d.before_mutex_unlock(t2, 0, &i2, MUTEX1);
    assert_eq!(h.races(), 0);

    // Drop the lock discipline and the candidate set empties.
    let t3 = t(4);
    let i3 = h.inst(0x30, 30);
    d.thread_start(t3, main);
    d.after_pthread_create(main, 0, &i2, t3);
    d.before_mem_write(t3, 0, &i3, HEAP, 4);
    assert_eq!(h.races(), 1);
}

#[test]
fn hybrid_detects_wrong_lock_race() {
    let h = Harness::new(Hybrid);
    let d = &h.detector;
    let (t1, t2) = (t(1), t(2));
    let i1 = h.inst(0x10, 10);
    let i2 = h.inst(0x20, 20);

    d.thread_start(t1, ThreadId::INVALID);
    d.thread_start(t2, t1);
    d.after_pthread_create(t1, 0, &i1, t2);

    d.after_mutex_lock(t1, 0, &i1, MUTEX1);
    d.before_mem_write(t1, 0, &i1, HEAP, 4);
    d.before_mutex_unlock(t1, 0, &i1, MUTEX1);

    d.after_mutex_lock(t2, 0, &i2, MUTEX2);
    d.before_mem_write(t2, 0, &i2, HEAP, 4);
    d.before_mutex_unlock(t2, 0, &i2, MUTEX2);

    assert_eq!(h.races(), 1);
}

/// Accesses outside every known region never create metas or races.
#[test]
fn unknown_addresses_are_filtered() {
    let h = Harness::new(MultiLockHb);
    let d = &h.detector;
    let (t1, t2) = (t(1), t(2));
    let i1 = h.inst(0x10, 10);

    d.thread_start(t1, ThreadId::INVALID);
    d.thread_start(t2, t1);
    d.after_pthread_create(t1, 0, &i1, t2);

    d.before_mem_write(t1, 0, &i1, 0x9999_0000, 4);
    d.before_mem_write(t2, 0, &i1, 0x9999_0000, 4);
    assert_eq!(h.races(), 0);
}

/// Freed memory stops being monitored; reallocation at the same address
/// starts from a fresh meta.
#[test]
fn free_clears_access_history() {
    let h = Harness::new(MultiLockHb);
    let d = &h.detector;
    let (t1, t2) = (t(1), t(2));
    let i1 = h.inst(0x10, 10);
    let i2 = h.inst(0x20, 20);

    d.thread_start(t1, ThreadId::INVALID);
    d.thread_start(t2, t1);
    d.after_pthread_create(t1, 0, &i1, t2);

    d.before_mem_write(t1, 0, &i1, HEAP, 4);
    d.before_free(t1, 0, &i1, HEAP);
    d.after_malloc(t2, 0, &i2, 64, HEAP);
    d.before_mem_write(t2, 0, &i2, HEAP, 4);

    assert_eq!(h.races(), 0);
}
