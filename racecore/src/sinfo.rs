/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Static information about the instrumented program: images and the
//! instructions observed inside them.
//!
//! Instructions are created lazily, the first time the instrumentation
//! reports an address, and are immutable thereafter.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;

/// Image name used for instructions that belong to no known image.
pub const PSEUDO_IMAGE_NAME: &str = "<pseudo>";

/// Identity of a static instruction: (image, offset within the image).
pub type InstKey = (String, u64);

/// A static instruction, identified by its image and offset. Debug info and
/// opcode are cached at creation time and never change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inst {
    /// Name of the image this instruction belongs to.
    pub image: String,
    /// Offset of the instruction from the image's low address.
    pub offset: u64,
    /// Source file basename, empty when no debug info was available.
    pub file_name: String,
    /// Source line, zero without debug info.
    pub line: u32,
    /// Source column, zero without debug info.
    pub column: u32,
    /// Short opcode string, when the instrumentation reported one.
    pub opcode: Option<String>,
}

impl Inst {
    /// Did the instrumentation find source-level debug info for this address?
    pub fn has_debug_info(&self) -> bool {
        !self.file_name.is_empty()
    }

    /// The identity key of this instruction.
    pub fn key(&self) -> InstKey {
        (self.image.clone(), self.offset)
    }
}

// Identity is (image, offset); equality, ordering and hashing all agree on
// that key so instruction sets iterate deterministically regardless of the
// debug info they carry.
impl PartialEq for Inst {
    fn eq(&self, other: &Self) -> bool {
        self.image == other.image && self.offset == other.offset
    }
}

impl Eq for Inst {}

impl std::hash::Hash for Inst {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.image.hash(state);
        self.offset.hash(state);
    }
}

impl Ord for Inst {
    fn cmp(&self, other: &Self) -> Ordering {
        self.image
            .cmp(&other.image)
            .then(self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for Inst {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_debug_info() {
            write!(
                f,
                "{}+{:#x} [{}:{}]",
                self.image, self.offset, self.file_name, self.line
            )
        } else {
            write!(f, "{}+{:#x}", self.image, self.offset)
        }
    }
}

/// Shared handle to an immutable instruction.
pub type InstRef = Arc<Inst>;

/// Serialized form of the static info database.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SInfoDb {
    images: Vec<String>,
    insts: Vec<Inst>,
}

#[derive(Debug, Default)]
struct SInfoState {
    /// Known image names, in load order.
    images: Vec<String>,
    /// All instructions, keyed for deterministic iteration.
    insts: BTreeMap<InstKey, InstRef>,
}

/// The table of images and instructions, shared across analyzers.
#[derive(Debug, Default)]
pub struct StaticInfo {
    inner: Mutex<SInfoState>,
}

impl StaticInfo {
    /// Create an empty table containing only the pseudo image.
    pub fn new() -> Self {
        let si = StaticInfo {
            inner: Mutex::new(SInfoState::default()),
        };
        si.ensure_image(PSEUDO_IMAGE_NAME);
        si
    }

    /// Register an image by name, keeping the first registration.
    pub fn ensure_image(&self, name: &str) {
        let mut st = self.inner.lock().unwrap();
        if !st.images.iter().any(|i| i == name) {
            st.images.push(name.to_string());
        }
    }

    /// Look up an instruction without creating it.
    pub fn find_inst(&self, image: &str, offset: u64) -> Option<InstRef> {
        let st = self.inner.lock().unwrap();
        st.insts.get(&(image.to_string(), offset)).cloned()
    }

    /// Resolve an instruction, creating it on first sight. The debug info and
    /// opcode of the first creation win; later calls return the cached
    /// instruction unchanged.
    pub fn ensure_inst(
        &self,
        image: &str,
        offset: u64,
        opcode: Option<&str>,
        debug: Option<(&str, u32, u32)>,
    ) -> InstRef {
        let mut st = self.inner.lock().unwrap();
        let key = (image.to_string(), offset);
        if let Some(inst) = st.insts.get(&key) {
            return inst.clone();
        }
        let (file_name, line, column) = match debug {
            // Debug info arrives with full paths; only the basename is kept,
            // matching how potential statements are addressed.
            Some((file, line, column)) => (basename(file).to_string(), line, column),
            None => (String::new(), 0, 0),
        };
        if !st.images.iter().any(|i| i == image) {
            st.images.push(image.to_string());
        }
        let inst = Arc::new(Inst {
            image: image.to_string(),
            offset,
            file_name,
            line,
            column,
            opcode: opcode.map(|s| s.to_string()),
        });
        st.insts.insert(key, inst.clone());
        inst
    }

    /// Number of known instructions.
    pub fn inst_count(&self) -> usize {
        self.inner.lock().unwrap().insts.len()
    }

    /// Load a previously saved database, merging into this table.
    pub fn load(&self, path: &Path) -> anyhow::Result<()> {
        let file = File::open(path)
            .with_context(|| format!("opening static info database {}", path.display()))?;
        let db: SInfoDb = serde_json::from_reader(file)
            .with_context(|| format!("parsing static info database {}", path.display()))?;
        let mut st = self.inner.lock().unwrap();
        for image in db.images {
            if !st.images.iter().any(|i| *i == image) {
                st.images.push(image);
            }
        }
        for inst in db.insts {
            st.insts.entry(inst.key()).or_insert_with(|| Arc::new(inst));
        }
        Ok(())
    }

    /// Save the database.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let st = self.inner.lock().unwrap();
        let db = SInfoDb {
            images: st.images.clone(),
            insts: st.insts.values().map(|i| (**i).clone()).collect(),
        };
        let file = File::create(path)
            .with_context(|| format!("creating static info database {}", path.display()))?;
        serde_json::to_writer(file, &db)
            .with_context(|| format!("writing static info database {}", path.display()))?;
        Ok(())
    }
}

/// Final path component of a source file path.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insts_are_created_once() {
        let si = StaticInfo::new();
        let a = si.ensure_inst("app", 0x10, Some("mov"), Some(("/src/main.cpp", 17, 3)));
        let b = si.ensure_inst("app", 0x10, None, None);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.file_name, "main.cpp");
        assert_eq!(b.line, 17);
    }

    #[test]
    fn unknown_addresses_go_to_the_pseudo_image() {
        let si = StaticInfo::new();
        let i = si.ensure_inst(PSEUDO_IMAGE_NAME, 0xdeadbeef, None, None);
        assert!(!i.has_debug_info());
        assert_eq!(i.image, PSEUDO_IMAGE_NAME);
    }

    #[test]
    fn db_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sinfo.db");
        let si = StaticInfo::new();
        si.ensure_inst("app", 0x20, Some("cmpxchg"), Some(("lib/worker.cpp", 42, 1)));
        si.save(&path).unwrap();

        let si2 = StaticInfo::new();
        si2.load(&path).unwrap();
        let found = si2.find_inst("app", 0x20).unwrap();
        assert_eq!(found.file_name, "worker.cpp");
        assert_eq!(found.opcode.as_deref(), Some("cmpxchg"));
    }
}
