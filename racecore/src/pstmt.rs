/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Potential racing statements and the pair relation between them.
//!
//! The static race detector emits a plain-text profile, one candidate pair
//! per line: `file1 line1 file2 line2`, whitespace-delimited, first character
//! alphabetic. A pair is *open* until the verifier confirms a race on it, at
//! which point it is removed and no longer monitored.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;

/// A potential racing statement: a source location by (file basename, line).
#[derive(PartialEq, Debug, Eq, Clone, Hash, PartialOrd, Ord)]
pub struct PStmt {
    pub file_name: String,
    pub line: u32,
}

impl PStmt {
    pub fn new(file_name: &str, line: u32) -> Self {
        PStmt {
            file_name: file_name.to_string(),
            line,
        }
    }
}

impl fmt::Display for PStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_name, self.line)
    }
}

#[derive(Debug, Default)]
struct PRaceState {
    /// Symmetric relation of open candidate pairs.
    relation: BTreeMap<PStmt, BTreeSet<PStmt>>,
}

/// The database of potential statement pairs from a prior profile.
#[derive(Debug, Default)]
pub struct PRaceDB {
    inner: Mutex<PRaceState>,
}

impl PRaceDB {
    /// Create an empty database.
    pub fn new() -> Self {
        Default::default()
    }

    /// Load candidate pairs from the static profile.
    pub fn load(&self, path: &Path) -> anyhow::Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading static profile {}", path.display()))?;
        let mut st = self.inner.lock().unwrap();
        for line in text.lines() {
            if !line.chars().next().map_or(false, |c| c.is_alphabetic()) {
                continue;
            }
            let mut toks = line.split_whitespace();
            let (f1, l1, f2, l2) = match (toks.next(), toks.next(), toks.next(), toks.next()) {
                (Some(f1), Some(l1), Some(f2), Some(l2)) => (f1, l1, f2, l2),
                _ => continue,
            };
            let (l1, l2) = match (l1.parse::<u32>(), l2.parse::<u32>()) {
                (Ok(l1), Ok(l2)) => (l1, l2),
                _ => continue,
            };
            let a = PStmt::new(f1, l1);
            let b = PStmt::new(f2, l2);
            st.relation.entry(a.clone()).or_default().insert(b.clone());
            st.relation.entry(b).or_default().insert(a);
        }
        Ok(())
    }

    /// Insert one pair directly (used by tests and by tooling that bypasses
    /// the profile file).
    pub fn add_pair(&self, a: &PStmt, b: &PStmt) {
        let mut st = self.inner.lock().unwrap();
        st.relation.entry(a.clone()).or_default().insert(b.clone());
        st.relation.entry(b.clone()).or_default().insert(a.clone());
    }

    /// Resolve a source location to its potential statement, if the profile
    /// names it.
    pub fn get_pstmt(&self, file_name: &str, line: u32) -> Option<PStmt> {
        let st = self.inner.lock().unwrap();
        let key = PStmt::new(file_name, line);
        st.relation.get(&key).map(|_| key)
    }

    /// Is `(first, second)` an open candidate pair?
    pub fn second_potential_statement(&self, first: &PStmt, second: &PStmt) -> bool {
        let st = self.inner.lock().unwrap();
        st.relation
            .get(first)
            .map_or(false, |peers| peers.contains(second))
    }

    /// Remove a confirmed pair from the open set, in both directions.
    pub fn remove_relation_mapping(&self, a: &PStmt, b: &PStmt) {
        let mut st = self.inner.lock().unwrap();
        if let Some(peers) = st.relation.get_mut(a) {
            peers.remove(b);
        }
        if let Some(peers) = st.relation.get_mut(b) {
            peers.remove(a);
        }
    }

    /// True when no statement is known.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().relation.is_empty()
    }

    /// Every statement in the profile, for the partial-instrumentation
    /// sidecar.
    pub fn statements(&self) -> Vec<PStmt> {
        self.inner.lock().unwrap().relation.keys().cloned().collect()
    }

    /// Write the `instrumented_lines` sidecar: one `file line` pair per line.
    pub fn write_instrumented_lines(&self, path: &Path) -> anyhow::Result<()> {
        let mut file = File::create(path)
            .with_context(|| format!("creating instrumented lines file {}", path.display()))?;
        for stmt in self.statements() {
            writeln!(file, "{} {}", stmt.file_name, stmt.line)?;
        }
        Ok(())
    }
}
