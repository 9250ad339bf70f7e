/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Whole-engine runs: configuration, dispatch (inline and parallel), and
//! the artifacts persisted at program exit.

use racecore::engine::RaceEngine;
use racecore::types::Config;
use racecore::types::ThreadId;

fn t(raw: u64) -> ThreadId {
    ThreadId::from_raw(raw)
}

/// Scenario 2 driven through the engine: unsynchronized parent/child
/// writes, one race, all artifacts written.
fn run_unsynchronized_writes(mut cfg: Config) -> (usize, String) {
    let dir = tempfile::tempdir().unwrap();
    cfg.enable_multilock_hb = true;
    cfg.sinfo_out = dir.path().join("sinfo.db");
    cfg.race_out = dir.path().join("race.db");
    cfg.race_report = dir.path().join("race.rp");

    let mut engine = RaceEngine::new(cfg);
    let i1 = engine.resolve_inst("app", 0x10, Some("mov"), Some(("main.cpp", 10, 0)));
    let i2 = engine.resolve_inst("app", 0x20, Some("mov"), Some(("main.cpp", 20, 0)));

    engine.thread_start(t(1), ThreadId::INVALID);
    engine.after_malloc(t(1), 0, &i1, 64, 0x1000);
    engine.thread_start(t(2), t(1));
    engine.after_pthread_create(t(1), 0, &i1, t(2));
    engine.mem_write(t(1), 0, &i1, 0x1000, 4);
    engine.mem_write(t(2), 0, &i2, 0x1000, 4);
    engine.thread_exit(t(2), 0);
    engine.after_pthread_join(t(1), 0, &i1, t(2));
    engine.program_exit();

    let races = engine.race_db().race_count();
    let report = std::fs::read_to_string(dir.path().join("race.rp")).unwrap();
    assert!(dir.path().join("sinfo.db").exists());
    assert!(dir.path().join("race.db").exists());
    (races, report)
}

#[test]
fn inline_engine_reports_and_persists() {
    let (races, report) = run_unsynchronized_writes(Config::default());
    assert_eq!(races, 1);
    assert!(report.contains("WAW race detected"));
    assert!(report.contains("main.cpp:10"));
    assert!(report.contains("main.cpp:20"));
}

/// The same run with detection distributed over workers must find the
/// same race: per-address routing preserves analyzer ordering.
#[test]
fn parallel_engine_finds_the_same_race() {
    let cfg = Config {
        parallel_detector_number: 2,
        ..Default::default()
    };
    let (races, report) = run_unsynchronized_writes(cfg);
    assert_eq!(races, 1);
    assert!(report.contains("WAW race detected"));
}

/// A race recorded in a previous run's database suppresses the duplicate
/// report in the next run.
#[test]
fn race_history_carries_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let race_db_path = dir.path().join("race.db");

    let mut cfg = Config {
        enable_multilock_hb: true,
        ..Default::default()
    };
    cfg.sinfo_out = dir.path().join("sinfo.db");
    cfg.race_out = race_db_path.clone();
    cfg.race_report = dir.path().join("race.rp");

    let drive = |engine: &mut RaceEngine| {
        let i1 = engine.resolve_inst("app", 0x10, None, Some(("main.cpp", 10, 0)));
        let i2 = engine.resolve_inst("app", 0x20, None, Some(("main.cpp", 20, 0)));
        engine.thread_start(t(1), ThreadId::INVALID);
        engine.after_malloc(t(1), 0, &i1, 64, 0x1000);
        engine.thread_start(t(2), t(1));
        engine.after_pthread_create(t(1), 0, &i1, t(2));
        engine.mem_write(t(1), 0, &i1, 0x1000, 4);
        engine.mem_write(t(2), 0, &i2, 0x1000, 4);
        engine.program_exit();
    };

    let mut first = RaceEngine::new(cfg.clone());
    drive(&mut first);
    assert_eq!(first.race_db().race_count(), 1);

    // Second run loads the saved database; the pair is already known, so
    // this run reports nothing new.
    cfg.race_in = race_db_path;
    let mut second = RaceEngine::new(cfg);
    drive(&mut second);
    assert_eq!(second.race_db().race_count(), 1);
    assert!(second.race_db().races().is_empty());
}

/// Library filtering: pthread internals are always ignored; other shared
/// libraries only under `ignore_lib`.
#[test]
fn library_accesses_are_filterable() {
    let quiet = RaceEngine::new(Config::default());
    assert!(quiet.ignore_mem_access("/lib64/libpthread-2.31.so"));
    assert!(!quiet.ignore_mem_access("/usr/lib/libz.so.1"));
    assert!(!quiet.ignore_mem_access("/home/user/app"));

    let cfg = Config {
        ignore_lib: true,
        ..Default::default()
    };
    let strict = RaceEngine::new(cfg);
    assert!(strict.ignore_mem_access("/usr/lib/libz.so.1"));
    assert!(!strict.ignore_mem_access("/home/user/app"));
}

/// Images contribute their data and bss ranges to the monitored regions.
#[test]
fn image_data_sections_are_monitored() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = Config {
        enable_multilock_hb: true,
        ..Default::default()
    };
    cfg.sinfo_out = dir.path().join("sinfo.db");
    cfg.race_out = dir.path().join("race.db");
    cfg.race_report = dir.path().join("race.rp");

    let mut engine = RaceEngine::new(cfg);
    let i1 = engine.resolve_inst("app", 0x10, None, Some(("main.cpp", 10, 0)));
    let i2 = engine.resolve_inst("app", 0x20, None, Some(("main.cpp", 20, 0)));

    engine.image_load("app", 0x40_0000, 0x50_0000, 0x48_0000, 0x1000, 0x49_0000, 0x1000);
    engine.thread_start(t(1), ThreadId::INVALID);
    engine.thread_start(t(2), t(1));
    engine.after_pthread_create(t(1), 0, &i1, t(2));
    // A global in .bss, written by both threads with no ordering.
    engine.mem_write(t(1), 0, &i1, 0x49_0010, 4);
    engine.mem_write(t(2), 0, &i2, 0x49_0010, 4);
    engine.program_exit();

    assert_eq!(engine.race_db().race_count(), 1);
}
