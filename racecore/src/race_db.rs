/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The sink every analyzer reports races into.
//!
//! Deduplicates race pairs by their static identity (instruction pair plus
//! access kinds), carries the sticky racy-instruction flags, and persists
//! both across runs.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use racecore_model::tid::ThreadId;
use racecore_model::Address;
use serde::Deserialize;
use serde::Serialize;

use crate::events::AccessKind;
use crate::sinfo::Inst;
use crate::sinfo::InstKey;
use crate::sinfo::InstRef;
use crate::sinfo::StaticInfo;

/// Short name of a race by the kinds of its two accesses, first access first.
pub fn race_kind_name(first: AccessKind, second: AccessKind) -> &'static str {
    match (first, second) {
        (AccessKind::Write, AccessKind::Read) => "WAR",
        (AccessKind::Write, AccessKind::Write) => "WAW",
        (AccessKind::Read, AccessKind::Write) => "RAW",
        _ => "R|W",
    }
}

/// One dynamic occurrence of a race observed in this run.
#[derive(Debug, Clone)]
pub struct Race {
    pub addr: Address,
    pub first_tid: ThreadId,
    pub first_inst: InstRef,
    pub first_kind: AccessKind,
    pub second_tid: ThreadId,
    pub second_inst: InstRef,
    pub second_kind: AccessKind,
}

impl fmt::Display for Race {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} race detected",
            race_kind_name(self.first_kind, self.second_kind)
        )?;
        writeln!(f, "  addr = {:#x}", self.addr)?;
        writeln!(
            f,
            "  first  thread = [{}], inst = [{}]",
            self.first_tid, self.first_inst
        )?;
        write!(
            f,
            "  second thread = [{}], inst = [{}]",
            self.second_tid, self.second_inst
        )
    }
}

type StaticRaceKey = (InstKey, AccessKind, InstKey, AccessKind);

/// Serialized form of the race database.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RaceDbFile {
    races: Vec<(Inst, AccessKind, Inst, AccessKind)>,
    racy_insts: Vec<Inst>,
}

#[derive(Debug, Default)]
struct RaceDbState {
    /// Every static race pair ever observed (including loaded history).
    static_races: BTreeSet<StaticRaceKey>,
    /// Dynamic occurrences reported this run, one per new static pair.
    races: Vec<Race>,
    /// Instructions flagged as having touched racy memory.
    racy_insts: BTreeSet<InstKey>,
}

/// The deduplicating race database.
#[derive(Debug, Default)]
pub struct RaceDB {
    inner: Mutex<RaceDbState>,
}

impl RaceDB {
    /// Create an empty database.
    pub fn new() -> Self {
        Default::default()
    }

    /// Record one discovered race. Returns true when the static pair is new;
    /// repeated reports of a known pair are absorbed here.
    #[allow(clippy::too_many_arguments)]
    pub fn report_race(
        &self,
        addr: Address,
        first_tid: ThreadId,
        first_inst: &InstRef,
        first_kind: AccessKind,
        second_tid: ThreadId,
        second_inst: &InstRef,
        second_kind: AccessKind,
    ) -> bool {
        let key = (
            first_inst.key(),
            first_kind,
            second_inst.key(),
            second_kind,
        );
        let mut st = self.inner.lock().unwrap();
        if !st.static_races.insert(key) {
            return false;
        }
        st.races.push(Race {
            addr,
            first_tid,
            first_inst: first_inst.clone(),
            first_kind,
            second_tid,
            second_inst: second_inst.clone(),
            second_kind,
        });
        true
    }

    /// Set or clear the sticky racy flag of one instruction.
    pub fn set_racy_inst(&self, inst: &InstRef, racy: bool) {
        let mut st = self.inner.lock().unwrap();
        if racy {
            st.racy_insts.insert(inst.key());
        } else {
            st.racy_insts.remove(&inst.key());
        }
    }

    /// Has this instruction ever been flagged racy?
    pub fn is_racy_inst(&self, inst: &InstRef) -> bool {
        self.inner.lock().unwrap().racy_insts.contains(&inst.key())
    }

    /// Number of distinct static race pairs known.
    pub fn race_count(&self) -> usize {
        self.inner.lock().unwrap().static_races.len()
    }

    /// The dynamic races reported this run, in report order.
    pub fn races(&self) -> Vec<Race> {
        self.inner.lock().unwrap().races.clone()
    }

    /// Load a previously saved database. Loaded instructions are interned
    /// through the static info table.
    pub fn load(&self, path: &Path, sinfo: &StaticInfo) -> anyhow::Result<()> {
        let file = File::open(path)
            .with_context(|| format!("opening race database {}", path.display()))?;
        let db: RaceDbFile = serde_json::from_reader(file)
            .with_context(|| format!("parsing race database {}", path.display()))?;
        let mut st = self.inner.lock().unwrap();
        for (first, first_kind, second, second_kind) in db.races {
            intern(sinfo, &first);
            intern(sinfo, &second);
            st.static_races
                .insert((first.key(), first_kind, second.key(), second_kind));
        }
        for inst in db.racy_insts {
            intern(sinfo, &inst);
            st.racy_insts.insert(inst.key());
        }
        Ok(())
    }

    /// Save the database.
    pub fn save(&self, path: &Path, sinfo: &StaticInfo) -> anyhow::Result<()> {
        let st = self.inner.lock().unwrap();
        let db = RaceDbFile {
            races: st
                .races
                .iter()
                .map(|r| {
                    (
                        (*r.first_inst).clone(),
                        r.first_kind,
                        (*r.second_inst).clone(),
                        r.second_kind,
                    )
                })
                .collect(),
            racy_insts: st
                .racy_insts
                .iter()
                .filter_map(|(image, offset)| sinfo.find_inst(image, *offset))
                .map(|i| (*i).clone())
                .collect(),
        };
        let file = File::create(path)
            .with_context(|| format!("creating race database {}", path.display()))?;
        serde_json::to_writer(file, &db)
            .with_context(|| format!("writing race database {}", path.display()))?;
        Ok(())
    }
}

/// Re-create a loaded instruction inside the static info table.
fn intern(sinfo: &StaticInfo, inst: &Inst) {
    let debug = if inst.has_debug_info() {
        Some((inst.file_name.as_str(), inst.line, inst.column))
    } else {
        None
    };
    sinfo.ensure_inst(&inst.image, inst.offset, inst.opcode.as_deref(), debug);
}

/// Human-readable dump of the races reported in the current run.
#[derive(Debug, Default)]
pub struct RaceReport;

impl RaceReport {
    /// Write the report for `race_db` to `path`.
    pub fn save(path: &Path, race_db: &RaceDB) -> anyhow::Result<()> {
        let races = race_db.races();
        let mut file = File::create(path)
            .with_context(|| format!("creating race report {}", path.display()))?;
        writeln!(file, "{} race(s) reported this run", races.len())?;
        for (i, race) in races.iter().enumerate() {
            writeln!(file, "================ race {} ================", i + 1)?;
            writeln!(file, "{}", race)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn inst(sinfo: &StaticInfo, offset: u64, line: u32) -> InstRef {
        sinfo.ensure_inst("app", offset, None, Some(("test.cpp", line, 0)))
    }

    #[test]
    fn duplicate_reports_are_absorbed() {
        let sinfo = StaticInfo::new();
        let db = RaceDB::new();
        let i1 = inst(&sinfo, 0x10, 17);
        let i2 = inst(&sinfo, 0x20, 25);
        let t1 = ThreadId::from_raw(1);
        let t2 = ThreadId::from_raw(2);
        assert!(db.report_race(0x1000, t1, &i1, AccessKind::Write, t2, &i2, AccessKind::Write));
        assert!(!db.report_race(0x1000, t1, &i1, AccessKind::Write, t2, &i2, AccessKind::Write));
        // A different kind is a different static race.
        assert!(db.report_race(0x1000, t1, &i1, AccessKind::Write, t2, &i2, AccessKind::Read));
        assert_eq!(db.race_count(), 2);
    }

    #[test]
    fn racy_flags_are_sticky_until_cleared() {
        let sinfo = StaticInfo::new();
        let db = RaceDB::new();
        let i = inst(&sinfo, 0x30, 9);
        assert!(!db.is_racy_inst(&i));
        db.set_racy_inst(&i, true);
        assert!(db.is_racy_inst(&i));
    }

    #[test]
    fn db_and_report_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("race.db");
        let rp_path = dir.path().join("race.rp");

        let sinfo = StaticInfo::new();
        let db = RaceDB::new();
        let i1 = inst(&sinfo, 0x10, 17);
        let i2 = inst(&sinfo, 0x20, 25);
        db.report_race(
            0x1000,
            ThreadId::from_raw(1),
            &i1,
            AccessKind::Write,
            ThreadId::from_raw(2),
            &i2,
            AccessKind::Read,
        );
        db.set_racy_inst(&i1, true);
        db.save(&db_path, &sinfo).unwrap();
        RaceReport::save(&rp_path, &db).unwrap();

        let sinfo2 = StaticInfo::new();
        let db2 = RaceDB::new();
        db2.load(&db_path, &sinfo2).unwrap();
        assert_eq!(db2.race_count(), 1);
        let i1_again = sinfo2.find_inst("app", 0x10).unwrap();
        assert!(Arc::ptr_eq(&i1_again, &sinfo2.find_inst("app", 0x10).unwrap()));
        assert!(db2.is_racy_inst(&i1_again));
        // Loaded pairs still deduplicate fresh reports.
        assert!(!db2.report_race(
            0x1000,
            ThreadId::from_raw(1),
            &i1_again,
            AccessKind::Write,
            ThreadId::from_raw(2),
            &sinfo2.find_inst("app", 0x20).unwrap(),
            AccessKind::Read
        ));

        let report = std::fs::read_to_string(&rp_path).unwrap();
        assert!(report.contains("WAR race detected"));
        assert!(report.contains("test.cpp:17"));
    }
}
