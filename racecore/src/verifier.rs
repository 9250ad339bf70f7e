/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The active verifier.
//!
//! Given candidate statement pairs from a prior profile, the verifier
//! perturbs the schedule so that the two suspect accesses become
//! simultaneously pending: a thread reaching the first statement of an open
//! pair is *postponed* on its per-thread semaphore; when another thread
//! reaches the matching statement with an overlapping unit, the race is
//! confirmed, reported, and the pair closed.
//!
//! Scheduling state lives behind two locks: `verify_lock` is the coarse
//! gate serializing application progress through the access handler, and
//! the internal lock guards all bookkeeping. `verify_lock` is always taken
//! first. Liveness is guaranteed by one rule: whenever the available set
//! drains, a random postponed thread is woken.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use racecore_model::clock::Timestamp;
use racecore_model::clock::VectorClock;
use racecore_model::config::Config;
use racecore_model::tid::ThreadId;
use racecore_model::Address;
use rand::Rng;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

use crate::analyzer::Analyzer;
use crate::analyzer::Subscription;
use crate::detector::unit_range;
use crate::events::AccessKind;
use crate::pstmt::PRaceDB;
use crate::pstmt::PStmt;
use crate::race_db::RaceDB;
use crate::racelog;
use crate::region_filter::RegionFilter;
use crate::sem::Semaphore;
use crate::sinfo::InstKey;
use crate::sinfo::InstRef;

/// How long to sleep before re-rolling the thread chooser when the RNG
/// picked somebody else.
pub const CHOOSE_RETRY_SLEEP: Duration = Duration::from_millis(1);

/// One recorded access within a candidate statement window.
#[derive(Debug, Clone)]
struct MetaSnapshot {
    clk: Timestamp,
    kind: AccessKind,
    inst: InstRef,
}

/// Per-unit history kept while candidate statements hold the unit open.
#[derive(Debug)]
struct VerifierMeta {
    addr: Address,
    /// Snapshots per thread, in program order.
    snapshots: BTreeMap<ThreadId, Vec<MetaSnapshot>>,
    /// Instruction pairs already reported on this unit.
    raced_pairs: BTreeSet<(InstKey, InstKey)>,
}

impl VerifierMeta {
    fn new(addr: Address) -> Self {
        VerifierMeta {
            addr,
            snapshots: BTreeMap::new(),
            raced_pairs: BTreeSet::new(),
        }
    }

    fn raced_pair(&self, first: &InstRef, second: &InstRef) -> bool {
        self.raced_pairs.contains(&(first.key(), second.key()))
    }

    fn add_raced_pair(&mut self, first: &InstRef, second: &InstRef) {
        self.raced_pairs.insert((first.key(), second.key()));
    }
}

#[derive(Debug, Default)]
struct MutexMeta {
    vc: VectorClock,
    owner: Option<ThreadId>,
}

#[derive(Debug, Default)]
struct RwlockMeta {
    vc: VectorClock,
    wait_vc: VectorClock,
    ref_count: u32,
    wrlock_owner: Option<ThreadId>,
    rdlock_owners: BTreeSet<ThreadId>,
}

#[derive(Debug)]
struct VerifierState {
    thd_vc_map: BTreeMap<ThreadId, VectorClock>,
    thd_sem_map: BTreeMap<ThreadId, Arc<Semaphore>>,
    /// Threads currently allowed to make progress.
    avail: BTreeSet<ThreadId>,
    /// Threads parked on their semaphore by the verifier.
    postponed: BTreeSet<ThreadId>,
    /// Threads blocked on a native sync object.
    blocked: BTreeSet<ThreadId>,
    /// Units currently held open by each candidate statement.
    pstmt_metas: BTreeMap<PStmt, BTreeSet<Address>>,
    /// Units currently pending for each thread.
    thd_metas: BTreeMap<ThreadId, BTreeSet<Address>>,
    meta_table: HashMap<Address, VerifierMeta>,
    mutex_meta_table: HashMap<Address, MutexMeta>,
    rwlock_meta_table: HashMap<Address, RwlockMeta>,
    prng: Pcg64Mcg,
}

impl VerifierState {
    /// INVARIANT (checked in debug builds): avail and postponed are
    /// disjoint.
    fn check_invariants(&self) {
        debug_assert!(self.avail.is_disjoint(&self.postponed));
    }

    fn random_member(&mut self, postponed: bool) -> Option<ThreadId> {
        let set = if postponed { &self.postponed } else { &self.avail };
        if set.is_empty() {
            return None;
        }
        let idx = self.prng.gen_range(0..set.len());
        let chosen = set.iter().nth(idx).copied();
        racelog!(
            "SCHEDRAND: {} set of {} => {:?}",
            if postponed { "postponed" } else { "avail" },
            set.len(),
            chosen
        );
        chosen
    }

    fn sem(&self, tid: ThreadId) -> Arc<Semaphore> {
        self.thd_sem_map.get(&tid).cloned().unwrap_or_else(|| {
            panic!(
                "[verifier] invariant violation: no semaphore for thread {}",
                tid
            )
        })
    }

    fn wake_up_postponed(&mut self, tid: ThreadId) {
        racelog!("[verifier] waking postponed thread {}", tid);
        self.sem(tid).post();
        self.postponed.remove(&tid);
        self.avail.insert(tid);
        self.check_invariants();
    }

    /// The liveness rule: with nothing available, somebody postponed must
    /// run.
    fn choose_random_after_all_unavailable(&mut self) {
        if let Some(tid) = self.random_member(true) {
            self.wake_up_postponed(tid);
        }
    }

    fn block_thread(&mut self, tid: ThreadId) {
        self.avail.remove(&tid);
        self.blocked.insert(tid);
    }

    fn unblock_thread(&mut self, tid: ThreadId) {
        self.blocked.remove(&tid);
        self.postponed.remove(&tid);
        self.avail.insert(tid);
        self.check_invariants();
    }

    fn epoch(&self, tid: ThreadId) -> Timestamp {
        self.thd_vc_map
            .get(&tid)
            .map(|vc| vc.get(tid))
            .unwrap_or_else(|| {
                panic!(
                    "[verifier] invariant violation: no vector clock for thread {}",
                    tid
                )
            })
    }

    fn vc_mut(&mut self, tid: ThreadId) -> &mut VectorClock {
        self.thd_vc_map.get_mut(&tid).unwrap_or_else(|| {
            panic!(
                "[verifier] invariant violation: no vector clock for thread {}",
                tid
            )
        })
    }
}

enum AccessOutcome {
    /// Wait on the per-thread semaphore.
    Postpone,
    /// Wake these threads and flip a coin about who continues.
    Raced(BTreeSet<ThreadId>),
}

/// The active verifier. Implements the analyzer surface so the engine can
/// feed it the event stream; memory-access handlers may block the calling
/// application thread.
#[derive(Debug)]
pub struct Verifier {
    unit_size: u64,
    filter: RegionFilter,
    prace_db: Arc<PRaceDB>,
    race_db: Arc<RaceDB>,
    /// Coarse gate serializing application progress through access
    /// handling. Taken before the internal lock, released before any wait.
    verify_lock: Mutex<()>,
    inner: Mutex<VerifierState>,
}

impl Verifier {
    /// Create a verifier over the candidate pairs in `prace_db`, reporting
    /// confirmed races into `race_db`.
    pub fn new(cfg: &Config, prace_db: Arc<PRaceDB>, race_db: Arc<RaceDB>) -> Self {
        assert!(cfg.unit_size > 0, "unit_size_ must be positive");
        racelog!("SCHEDRAND: seeding verifier chooser with seed {}", cfg.seed);
        Verifier {
            unit_size: cfg.unit_size,
            filter: RegionFilter::new(),
            prace_db,
            race_db,
            verify_lock: Mutex::new(()),
            inner: Mutex::new(VerifierState {
                thd_vc_map: BTreeMap::new(),
                thd_sem_map: BTreeMap::new(),
                avail: BTreeSet::new(),
                postponed: BTreeSet::new(),
                blocked: BTreeSet::new(),
                pstmt_metas: BTreeMap::new(),
                thd_metas: BTreeMap::new(),
                meta_table: HashMap::new(),
                mutex_meta_table: HashMap::new(),
                rwlock_meta_table: HashMap::new(),
                prng: Pcg64Mcg::seed_from_u64(cfg.seed),
            }),
        }
    }

    fn alloc_addr_region(&self, addr: Address, size: u64) {
        if addr == 0 || size == 0 {
            return;
        }
        self.filter.add(addr, size);
    }

    /// Release the region and drain every unit meta it covered, including
    /// the stale unit references held by statement and thread sets.
    fn free_addr_region(&self, addr: Address) {
        if addr == 0 {
            return;
        }
        let size = self.filter.remove(addr);
        if size == 0 {
            return;
        }
        let mut st = self.inner.lock().unwrap();
        for unit in unit_range(addr, size, self.unit_size) {
            st.meta_table.remove(&unit);
            for metas in st.pstmt_metas.values_mut() {
                metas.remove(&unit);
            }
            for metas in st.thd_metas.values_mut() {
                metas.remove(&unit);
            }
        }
    }

    /// Entry point for both reads and writes: bias execution toward the
    /// RNG-chosen available thread, then process the access under the gate.
    fn before_access(&self, tid: ThreadId, inst: &InstRef, addr: Address, size: u64, kind: AccessKind) {
        if !self.filter.contains(addr) {
            return;
        }
        let mut gate = self.verify_lock.lock().unwrap();
        loop {
            let pick = {
                let mut st = self.inner.lock().unwrap();
                if st.avail.is_empty() {
                    None
                } else {
                    st.random_member(false)
                }
            };
            match pick {
                None => break,
                Some(chosen) if chosen == tid => break,
                Some(_) => {
                    drop(gate);
                    std::thread::sleep(CHOOSE_RETRY_SLEEP);
                    gate = self.verify_lock.lock().unwrap();
                }
            }
        }
        self.process_access(gate, tid, inst, addr, size, kind);
    }

    /// Single-threaded region: the caller holds the verify gate.
    fn process_access(
        &self,
        gate: MutexGuard<'_, ()>,
        tid: ThreadId,
        inst: &InstRef,
        addr: Address,
        size: u64,
        kind: AccessKind,
    ) {
        // Resolve the potential statement by (file basename, line). Accesses
        // outside the profile are not candidates.
        let pstmt = match self.prace_db.get_pstmt(&inst.file_name, inst.line) {
            Some(p) => p,
            None => {
                drop(gate);
                return;
            }
        };
        let units: Vec<Address> = unit_range(addr, size, self.unit_size).collect();

        let mut st_guard = self.inner.lock().unwrap();
        let outcome = {
            let st = &mut *st_guard;
            // Every statement currently holding units open whose pairing
            // with the incoming statement is still an open pair.
            let first_pstmts: Vec<PStmt> = st
                .pstmt_metas
                .keys()
                .filter(|p| self.prace_db.second_potential_statement(p, &pstmt))
                .cloned()
                .collect();

            if first_pstmts.is_empty() {
                // First side of a pair: snapshot and hold the units open.
                let curr_clk = st.epoch(tid);
                for &unit in &units {
                    let meta = st
                        .meta_table
                        .entry(unit)
                        .or_insert_with(|| VerifierMeta::new(unit));
                    meta.snapshots.entry(tid).or_default().push(MetaSnapshot {
                        clk: curr_clk,
                        kind,
                        inst: inst.clone(),
                    });
                    st.pstmt_metas.entry(pstmt.clone()).or_default().insert(unit);
                    st.thd_metas.entry(tid).or_default().insert(unit);
                }
                racelog!(
                    "[verifier] thread {} reached first statement {} of an open pair",
                    tid,
                    pstmt
                );
                AccessOutcome::Postpone
            } else {
                let mut pp_thds = BTreeSet::new();
                for first in &first_pstmts {
                    self.raced_meta(st, first, &units, &pstmt, inst, tid, kind, &mut pp_thds);
                }
                if pp_thds.is_empty() {
                    // No overlapping unit: the pair stays open.
                    AccessOutcome::Postpone
                } else {
                    AccessOutcome::Raced(pp_thds)
                }
            }
        };

        match outcome {
            AccessOutcome::Postpone => self.postpone_thread(gate, st_guard, tid),
            AccessOutcome::Raced(pp_thds) => self.handle_race(gate, st_guard, &pp_thds, tid),
        }
    }

    /// A confirmed overlap: wake the postponed side, then flip a fair coin
    /// about whether the current thread keeps running or swaps in behind
    /// them.
    fn handle_race(
        &self,
        gate: MutexGuard<'_, ()>,
        mut st_guard: MutexGuard<'_, VerifierState>,
        pp_thds: &BTreeSet<ThreadId>,
        tid: ThreadId,
    ) {
        let keep_running: bool = {
            let st = &mut *st_guard;
            let coin = st.prng.gen::<bool>();
            racelog!("SCHEDRAND: race handled, coin => {}", coin);
            coin
        };
        if keep_running {
            drop(st_guard);
            drop(gate);
        } else {
            {
                let st = &mut *st_guard;
                for u in pp_thds {
                    st.wake_up_postponed(*u);
                }
            }
            self.postpone_thread(gate, st_guard, tid);
        }
    }

    /// Park the current thread on its semaphore, unless it is the only
    /// live thread that could make progress.
    fn postpone_thread(
        &self,
        gate: MutexGuard<'_, ()>,
        mut st_guard: MutexGuard<'_, VerifierState>,
        tid: ThreadId,
    ) {
        let sem = {
            let st = &mut *st_guard;
            // Everyone else is blocked on native sync: postponing the last
            // available thread would deadlock the program.
            if st.avail.len() == 1 && st.postponed.is_empty() {
                racelog!("[verifier] not postponing sole available thread {}", tid);
                None
            } else {
                st.postponed.insert(tid);
                st.avail.remove(&tid);
                st.check_invariants();
                if st.avail.is_empty() {
                    st.choose_random_after_all_unavailable();
                }
                Some(st.sem(tid))
            }
        };
        drop(st_guard);
        drop(gate);
        if let Some(sem) = sem {
            racelog!("[verifier] thread {} postponed", tid);
            sem.wait();
            racelog!("[verifier] thread {} resumed", tid);
        }
    }

    /// Check the incoming access against every unit the first statement of
    /// the pair holds open: pending snapshots of postponed holders confirm
    /// the race now; historical snapshots not covered by the current
    /// thread's clock confirm races where the first thread already resumed.
    #[allow(clippy::too_many_arguments)]
    fn raced_meta(
        &self,
        st: &mut VerifierState,
        first_pstmt: &PStmt,
        units: &[Address],
        second_pstmt: &PStmt,
        inst: &InstRef,
        curr: ThreadId,
        kind: AccessKind,
        pp_thds: &mut BTreeSet<ThreadId>,
    ) {
        let first_metas = match st.pstmt_metas.get(first_pstmt) {
            Some(metas) if !metas.is_empty() => metas.clone(),
            _ => return,
        };
        let curr_clk = st.epoch(curr);
        let curr_vc = st.thd_vc_map.get(&curr).cloned().unwrap_or_default();
        let mut confirmed = false;

        for &unit in units {
            let VerifierState {
                meta_table,
                thd_metas,
                postponed,
                pstmt_metas,
                ..
            } = st;
            let meta = meta_table
                .entry(unit)
                .or_insert_with(|| VerifierMeta::new(unit));

            if first_metas.contains(&unit) {
                for (u, metas) in thd_metas.iter() {
                    // A postponed holder's latest snapshot is pending right
                    // now: overlap means the race is live.
                    if postponed.contains(u) && metas.contains(&unit) {
                        let last = meta.snapshots.get(u).and_then(|v| v.last()).cloned();
                        if let Some(last) = last {
                            if !meta.raced_pair(&last.inst, inst)
                                && access_pair_races(last.kind, kind)
                            {
                                confirmed = true;
                                pp_thds.insert(*u);
                                racelog!(
                                    "[verifier] confirmed pending race on {:#x}: [{}] {} / [{}] {}",
                                    unit,
                                    u,
                                    last.inst,
                                    curr,
                                    inst
                                );
                                self.race_db.report_race(
                                    unit, *u, &last.inst, last.kind, curr, inst, kind,
                                );
                                meta.add_raced_pair(&last.inst, inst);
                            }
                        }
                    }
                    // Historical snapshots: the first thread may already
                    // have resumed before we arrived.
                    if *u != curr && metas.contains(&unit) {
                        let thd_clk = curr_vc.get(*u);
                        let raced: Vec<(InstRef, AccessKind)> = meta
                            .snapshots
                            .get(u)
                            .map(|snaps| {
                                snaps
                                    .iter()
                                    .filter(|ss| {
                                        !meta.raced_pair(&ss.inst, inst)
                                            && ss.clk > thd_clk
                                            && access_pair_races(ss.kind, kind)
                                    })
                                    .map(|ss| (ss.inst.clone(), ss.kind))
                                    .collect()
                            })
                            .unwrap_or_default();
                        for (prior_inst, prior_kind) in raced {
                            confirmed = true;
                            racelog!(
                                "[verifier] confirmed historical race on {:#x}: [{}] {} / [{}] {}",
                                unit,
                                u,
                                prior_inst,
                                curr,
                                inst
                            );
                            self.race_db
                                .report_race(unit, *u, &prior_inst, prior_kind, curr, inst, kind);
                            meta.add_raced_pair(&prior_inst, inst);
                        }
                    }
                }
            }

            // The current access becomes part of the unit's history and the
            // second statement now holds the unit open too.
            meta.snapshots.entry(curr).or_default().push(MetaSnapshot {
                clk: curr_clk,
                kind,
                inst: inst.clone(),
            });
            pstmt_metas
                .entry(second_pstmt.clone())
                .or_default()
                .insert(unit);
            thd_metas.entry(curr).or_default().insert(unit);
        }

        if confirmed {
            racelog!(
                "[verifier] closing pair ({}, {})",
                first_pstmt,
                second_pstmt
            );
            self.prace_db
                .remove_relation_mapping(first_pstmt, second_pstmt);
        }
    }
}

/// write/write, read/write and write/read race; read/read does not.
fn access_pair_races(first: AccessKind, second: AccessKind) -> bool {
    first == AccessKind::Write || second == AccessKind::Write
}

impl Analyzer for Verifier {
    fn subscription(&self) -> Subscription {
        Subscription::all()
    }

    fn image_load(
        &self,
        _image: &str,
        _low: Address,
        _high: Address,
        data_start: Address,
        data_size: u64,
        bss_start: Address,
        bss_size: u64,
    ) {
        self.alloc_addr_region(data_start, data_size);
        self.alloc_addr_region(bss_start, bss_size);
    }

    fn image_unload(
        &self,
        _image: &str,
        _low: Address,
        _high: Address,
        data_start: Address,
        _data_size: u64,
        bss_start: Address,
        _bss_size: u64,
    ) {
        if data_start != 0 {
            self.free_addr_region(data_start);
        }
        if bss_start != 0 {
            self.free_addr_region(bss_start);
        }
    }

    fn thread_start(&self, tid: ThreadId, parent: ThreadId) {
        let mut st = self.inner.lock().unwrap();
        let mut vc = VectorClock::new();
        vc.increment(tid);
        if parent.is_valid() {
            let parent_vc = st.thd_vc_map.get(&parent).unwrap_or_else(|| {
                panic!(
                    "[verifier] invariant violation: thread {} started by unknown parent {}",
                    tid, parent
                )
            });
            vc.join(parent_vc);
        }
        st.thd_vc_map.insert(tid, vc);
        st.thd_sem_map
            .entry(tid)
            .or_insert_with(|| Arc::new(Semaphore::new(0)));
        // All threads are available at the beginning.
        st.avail.insert(tid);
        st.check_invariants();
    }

    fn thread_exit(&self, tid: ThreadId, _clk: Timestamp) {
        let mut st = self.inner.lock().unwrap();
        racelog!(
            "[verifier] thread {} exiting, postponed set size {}",
            tid,
            st.postponed.len()
        );
        st.thd_sem_map.remove(&tid);
        st.avail.remove(&tid);
        st.blocked.remove(&tid);
        // Must leave the postponed set, or its semaphore could be posted
        // after death.
        st.postponed.remove(&tid);
        if st.avail.is_empty() {
            st.choose_random_after_all_unavailable();
        }
    }

    fn before_pthread_join(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, _child: ThreadId) {
        let mut st = self.inner.lock().unwrap();
        st.block_thread(tid);
        if st.avail.is_empty() {
            st.choose_random_after_all_unavailable();
        }
    }

    fn after_pthread_join(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, child: ThreadId) {
        let mut st = self.inner.lock().unwrap();
        let child_vc = st.thd_vc_map.get(&child).cloned().unwrap_or_else(|| {
            panic!(
                "[verifier] invariant violation: join with unknown thread {}",
                child
            )
        });
        let vc = st.vc_mut(tid);
        vc.join(&child_vc);
        vc.increment(tid);
        st.unblock_thread(tid);
    }

    fn after_pthread_create(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, _child: ThreadId) {
        let mut st = self.inner.lock().unwrap();
        st.vc_mut(tid).increment(tid);
    }

    fn before_mem_read(&self, tid: ThreadId, _clk: Timestamp, inst: &InstRef, addr: Address, size: u64) {
        self.before_access(tid, inst, addr, size, AccessKind::Read);
    }

    fn before_mem_write(&self, tid: ThreadId, _clk: Timestamp, inst: &InstRef, addr: Address, size: u64) {
        self.before_access(tid, inst, addr, size, AccessKind::Write);
    }

    fn before_mutex_lock(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut st = self.inner.lock().unwrap();
        let owner = st.mutex_meta_table.entry(addr).or_default().owner;
        // The lock may block us; if its holder is postponed and nobody else
        // can run, the holder must be woken to release it.
        st.block_thread(tid);
        if let Some(owner) = owner {
            if st.avail.is_empty() && st.postponed.contains(&owner) {
                st.wake_up_postponed(owner);
            }
        }
    }

    fn after_mutex_lock(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut st = self.inner.lock().unwrap();
        let meta_vc = {
            let meta = st.mutex_meta_table.entry(addr).or_default();
            meta.owner = Some(tid);
            meta.vc.clone()
        };
        st.vc_mut(tid).join(&meta_vc);
        st.unblock_thread(tid);
    }

    fn before_mutex_unlock(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut st = self.inner.lock().unwrap();
        let vc = st.vc_mut(tid);
        let released = vc.clone();
        vc.increment(tid);
        st.mutex_meta_table.entry(addr).or_default().vc = released;
    }

    fn after_mutex_unlock(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut st = self.inner.lock().unwrap();
        let meta = st.mutex_meta_table.entry(addr).or_default();
        if meta.owner == Some(tid) {
            meta.owner = None;
        }
    }

    fn before_rwlock_rdlock(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut st = self.inner.lock().unwrap();
        let writer = st.rwlock_meta_table.entry(addr).or_default().wrlock_owner;
        st.block_thread(tid);
        if let Some(writer) = writer {
            if st.avail.is_empty() && st.postponed.contains(&writer) {
                st.wake_up_postponed(writer);
            }
        }
    }

    fn after_rwlock_rdlock(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut st = self.inner.lock().unwrap();
        let meta_vc = {
            let meta = st.rwlock_meta_table.entry(addr).or_default();
            meta.rdlock_owners.insert(tid);
            meta.ref_count += 1;
            meta.vc.clone()
        };
        st.vc_mut(tid).join(&meta_vc);
        st.unblock_thread(tid);
    }

    fn before_rwlock_wrlock(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut st = self.inner.lock().unwrap();
        let readers: Vec<ThreadId> = st
            .rwlock_meta_table
            .entry(addr)
            .or_default()
            .rdlock_owners
            .iter()
            .copied()
            .collect();
        st.block_thread(tid);
        // A writer waits for every reader; wake any postponed ones.
        if !readers.is_empty() && st.avail.is_empty() {
            for reader in readers {
                if st.postponed.contains(&reader) {
                    st.wake_up_postponed(reader);
                }
            }
        }
    }

    fn after_rwlock_wrlock(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut st = self.inner.lock().unwrap();
        st.unblock_thread(tid);
        let meta_vc = {
            let meta = st.rwlock_meta_table.entry(addr).or_default();
            meta.wrlock_owner = Some(tid);
            meta.ref_count += 1;
            meta.vc.clone()
        };
        st.vc_mut(tid).join(&meta_vc);
    }

    fn before_rwlock_unlock(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut st = self.inner.lock().unwrap();
        let vc = st.vc_mut(tid).clone();
        let meta = st.rwlock_meta_table.entry(addr).or_default();
        meta.ref_count = meta.ref_count.saturating_sub(1);
        meta.wait_vc.join(&vc);
        if meta.ref_count == 0 {
            meta.vc = std::mem::take(&mut meta.wait_vc);
        }
        st.vc_mut(tid).increment(tid);
    }

    fn after_rwlock_unlock(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut st = self.inner.lock().unwrap();
        let meta = st.rwlock_meta_table.entry(addr).or_default();
        // Whether this was the reader or writer side is not visible here;
        // clear both forms of ownership for this thread.
        if meta.wrlock_owner == Some(tid) {
            meta.wrlock_owner = None;
        }
        meta.rdlock_owners.remove(&tid);
    }

    fn before_cond_wait(
        &self,
        tid: ThreadId,
        _clk: Timestamp,
        _inst: &InstRef,
        _cond_addr: Address,
        _mutex_addr: Address,
    ) {
        let mut st = self.inner.lock().unwrap();
        st.block_thread(tid);
        if st.avail.is_empty() {
            st.choose_random_after_all_unavailable();
        }
    }

    fn after_cond_wait(
        &self,
        tid: ThreadId,
        _clk: Timestamp,
        _inst: &InstRef,
        _cond_addr: Address,
        _mutex_addr: Address,
    ) {
        let mut st = self.inner.lock().unwrap();
        st.unblock_thread(tid);
    }

    fn before_barrier_wait(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, _addr: Address) {
        let mut st = self.inner.lock().unwrap();
        st.block_thread(tid);
        if st.avail.is_empty() {
            st.choose_random_after_all_unavailable();
        }
    }

    fn after_barrier_wait(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, _addr: Address) {
        let mut st = self.inner.lock().unwrap();
        st.unblock_thread(tid);
    }

    fn before_sem_wait(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, _addr: Address) {
        let mut st = self.inner.lock().unwrap();
        st.block_thread(tid);
        if st.avail.is_empty() {
            st.choose_random_after_all_unavailable();
        }
    }

    fn after_sem_wait(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, _addr: Address) {
        let mut st = self.inner.lock().unwrap();
        st.unblock_thread(tid);
    }

    fn after_malloc(&self, _tid: ThreadId, _clk: Timestamp, _inst: &InstRef, size: u64, addr: Address) {
        self.alloc_addr_region(addr, size);
    }

    fn after_calloc(
        &self,
        _tid: ThreadId,
        _clk: Timestamp,
        _inst: &InstRef,
        nmemb: u64,
        size: u64,
        addr: Address,
    ) {
        self.alloc_addr_region(addr, nmemb.saturating_mul(size));
    }

    fn before_realloc(&self, _tid: ThreadId, _clk: Timestamp, _inst: &InstRef, ori_addr: Address, _size: u64) {
        self.free_addr_region(ori_addr);
    }

    fn after_realloc(
        &self,
        _tid: ThreadId,
        _clk: Timestamp,
        _inst: &InstRef,
        _ori_addr: Address,
        size: u64,
        new_addr: Address,
    ) {
        self.alloc_addr_region(new_addr, size);
    }

    fn before_free(&self, _tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        self.free_addr_region(addr);
    }

    fn program_exit(&self) {
        let st = self.inner.lock().unwrap();
        racelog!(
            "[verifier] finished: {} thread(s) tracked, {} postponed at exit",
            st.thd_vc_map.len(),
            st.postponed.len()
        );
    }
}
