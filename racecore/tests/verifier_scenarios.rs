/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Active-verifier scenarios with real application threads: the access
//! handlers genuinely block on the per-thread semaphores, and the liveness
//! rule must let every thread finish.

use std::sync::Arc;
use std::thread;

use racecore::analyzer::Analyzer;
use racecore::pstmt::PRaceDB;
use racecore::pstmt::PStmt;
use racecore::race_db::RaceDB;
use racecore::sinfo::InstRef;
use racecore::sinfo::StaticInfo;
use racecore::types::Config;
use racecore::types::ThreadId;
use racecore::verifier::Verifier;

const HEAP: u64 = 0x1000;

fn t(raw: u64) -> ThreadId {
    ThreadId::from_raw(raw)
}

struct Setup {
    verifier: Arc<Verifier>,
    prace_db: Arc<PRaceDB>,
    race_db: Arc<RaceDB>,
    sinfo: StaticInfo,
}

/// A verifier over one open pair {(file9.cpp, 17), (file9.cpp, 25)}.
fn setup() -> Setup {
    let cfg = Config::default();
    let prace_db = Arc::new(PRaceDB::new());
    prace_db.add_pair(&PStmt::new("file9.cpp", 17), &PStmt::new("file9.cpp", 25));
    let race_db = Arc::new(RaceDB::new());
    let verifier = Arc::new(Verifier::new(&cfg, prace_db.clone(), race_db.clone()));
    let sinfo = StaticInfo::new();
    Setup {
        verifier,
        prace_db,
        race_db,
        sinfo,
    }
}

fn inst(sinfo: &StaticInfo, offset: u64, line: u32) -> InstRef {
    sinfo.ensure_inst("app", offset, None, Some(("src/file9.cpp", line, 0)))
}

/// Scenario 5: the first thread to reach its side of the pair is
/// postponed; the second confirms the race; the pair closes; both threads
/// make progress to exit.
#[test]
fn verifier_confirms_known_pair() {
    let s = setup();
    let i_alloc = inst(&s.sinfo, 0x1, 1);
    let i17 = inst(&s.sinfo, 0x17, 17);
    let i25 = inst(&s.sinfo, 0x25, 25);

    // Both threads are registered before either runs, so the first access
    // really is postponed rather than skipped as the sole live thread.
    s.verifier.thread_start(t(1), ThreadId::INVALID);
    s.verifier.thread_start(t(2), t(1));
    s.verifier.after_malloc(t(1), 0, &i_alloc, 64, HEAP);

    let v1 = s.verifier.clone();
    let a = thread::spawn(move || {
        v1.before_mem_write(t(1), 0, &i17, HEAP, 4);
        v1.thread_exit(t(1), 0);
    });
    let v2 = s.verifier.clone();
    let b = thread::spawn(move || {
        v2.before_mem_write(t(2), 0, &i25, HEAP, 4);
        v2.thread_exit(t(2), 0);
    });
    a.join().unwrap();
    b.join().unwrap();

    // Exactly one write/write race, and the pair is closed.
    assert_eq!(s.race_db.race_count(), 1);
    let race = &s.race_db.races()[0];
    assert_eq!(
        racecore::race_db::race_kind_name(race.first_kind, race.second_kind),
        "WAW"
    );
    assert!(!s
        .prace_db
        .second_potential_statement(&PStmt::new("file9.cpp", 17), &PStmt::new("file9.cpp", 25)));
}

/// Read/read overlap on a candidate pair is not a race; both threads must
/// still terminate (the second postpones behind the first, and thread
/// exits drain the postponed set).
#[test]
fn read_read_overlap_is_not_confirmed() {
    let s = setup();
    let i_alloc = inst(&s.sinfo, 0x1, 1);
    let i17 = inst(&s.sinfo, 0x17, 17);
    let i25 = inst(&s.sinfo, 0x25, 25);

    s.verifier.thread_start(t(1), ThreadId::INVALID);
    s.verifier.thread_start(t(2), t(1));
    s.verifier.after_malloc(t(1), 0, &i_alloc, 64, HEAP);

    let v1 = s.verifier.clone();
    let a = thread::spawn(move || {
        v1.before_mem_read(t(1), 0, &i17, HEAP, 4);
        v1.thread_exit(t(1), 0);
    });
    let v2 = s.verifier.clone();
    let b = thread::spawn(move || {
        v2.before_mem_read(t(2), 0, &i25, HEAP, 4);
        v2.thread_exit(t(2), 0);
    });
    a.join().unwrap();
    b.join().unwrap();

    assert_eq!(s.race_db.race_count(), 0);
    assert!(s
        .prace_db
        .second_potential_statement(&PStmt::new("file9.cpp", 17), &PStmt::new("file9.cpp", 25)));
}

/// Accesses on lines outside the profile are never postponed.
#[test]
fn non_candidate_lines_run_straight_through() {
    let s = setup();
    let i_alloc = inst(&s.sinfo, 0x1, 1);
    let i99 = inst(&s.sinfo, 0x99, 99);

    s.verifier.thread_start(t(1), ThreadId::INVALID);
    s.verifier.after_malloc(t(1), 0, &i_alloc, 64, HEAP);

    // Runs on the calling thread without ever parking it.
    s.verifier.before_mem_write(t(1), 0, &i99, HEAP, 4);
    s.verifier.thread_exit(t(1), 0);
    assert_eq!(s.race_db.race_count(), 0);
}

/// The sole available thread is never postponed, even on a candidate
/// line: postponing it would deadlock the program.
#[test]
fn sole_thread_is_not_postponed() {
    let s = setup();
    let i_alloc = inst(&s.sinfo, 0x1, 1);
    let i17 = inst(&s.sinfo, 0x17, 17);

    s.verifier.thread_start(t(1), ThreadId::INVALID);
    s.verifier.after_malloc(t(1), 0, &i_alloc, 64, HEAP);

    // Must return, not block.
    s.verifier.before_mem_write(t(1), 0, &i17, HEAP, 4);
    s.verifier.thread_exit(t(1), 0);
    assert_eq!(s.race_db.race_count(), 0);
}

/// Mutex integration: a thread blocking on a mutex whose holder is
/// postponed forces the holder awake, so the program cannot deadlock.
#[test]
fn blocked_locker_wakes_postponed_holder() {
    let s = setup();
    let i_alloc = inst(&s.sinfo, 0x1, 1);
    let i17 = inst(&s.sinfo, 0x17, 17);
    let i_lock = inst(&s.sinfo, 0x40, 40);
    let mutex = 0x2000;

    s.verifier.thread_start(t(1), ThreadId::INVALID);
    s.verifier.thread_start(t(2), t(1));
    s.verifier.after_malloc(t(1), 0, &i_alloc, 64, HEAP);

    // Thread 1 takes the mutex, then hits a candidate line and postpones.
    let v1 = s.verifier.clone();
    let i_lock2 = i_lock.clone();
    let a = thread::spawn(move || {
        v1.before_mutex_lock(t(1), 0, &i_lock, mutex);
        v1.after_mutex_lock(t(1), 0, &i_lock, mutex);
        v1.before_mem_write(t(1), 0, &i17, HEAP, 4);
        v1.before_mutex_unlock(t(1), 0, &i_lock, mutex);
        v1.after_mutex_unlock(t(1), 0, &i_lock, mutex);
        v1.thread_exit(t(1), 0);
    });
    // Thread 2 contends on the same mutex: with nobody else available the
    // postponed holder must be woken.
    let v2 = s.verifier.clone();
    let b = thread::spawn(move || {
        // Lag a little so thread 1 usually postpones first; correctness
        // does not depend on the ordering.
        thread::sleep(std::time::Duration::from_millis(5));
        v2.before_mutex_lock(t(2), 0, &i_lock2, mutex);
        v2.after_mutex_lock(t(2), 0, &i_lock2, mutex);
        v2.before_mutex_unlock(t(2), 0, &i_lock2, mutex);
        v2.after_mutex_unlock(t(2), 0, &i_lock2, mutex);
        v2.thread_exit(t(2), 0);
    });
    a.join().unwrap();
    b.join().unwrap();
}
