/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The detector framework.
//!
//! `Detector<P>` owns everything an online race analyzer needs: the
//! per-thread vector clocks, the per-thread locksets, the synchronization
//! metadata tables and the per-unit access metas. The analyzer-specific
//! decision ("does this access race?") is delegated to an [`AccessPolicy`],
//! which attaches its own shape of per-address state as the meta extension.
//!
//! All analyzer state is serialized by one internal lock; handlers never
//! block and never report errors back into the instrumented program.

pub mod eraser;
pub mod hb;
pub mod hybrid;
pub mod multilock_hb;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use racecore_model::clock::Timestamp;
use racecore_model::clock::VectorClock;
use racecore_model::config::Config;
use racecore_model::lockset::LockSet;
use racecore_model::tid::ThreadId;
use racecore_model::Address;
use tracing::info;
use tracing::warn;

use crate::analyzer::Analyzer;
use crate::analyzer::Subscription;
use crate::events::AccessKind;
use crate::race_db::RaceDB;
use crate::racelog;
use crate::region_filter::RegionFilter;
use crate::sinfo::InstRef;

/// Per-address state shared by every analyzer, plus the analyzer-owned
/// extension. One meta exists per monitored unit, created on first access
/// and destroyed on free/unmap.
#[derive(Debug)]
pub struct AccessMeta<E> {
    /// The unit-aligned address this meta covers.
    pub addr: Address,
    /// Sticky: once an access to this unit raced, it stays racy.
    pub racy: bool,
    /// Analyzer-owned extension state.
    pub ext: E,
}

impl<E: Default> AccessMeta<E> {
    fn new(addr: Address) -> Self {
        AccessMeta {
            addr,
            racy: false,
            ext: E::default(),
        }
    }
}

/// What a policy sees for one access, borrowed from the framework's state
/// under the internal lock. Policies hold nothing across invocations.
pub struct AccessContext<'a> {
    /// The accessing thread.
    pub tid: ThreadId,
    /// The witnessing instruction.
    pub inst: &'a InstRef,
    /// The accessing thread's current vector clock.
    pub vc: &'a VectorClock,
    /// Locks held for writing (mutexes + write-locked rwlocks).
    pub writer_lockset: &'a LockSet,
    /// Full lockset: writer union reader. Reads may safely share a reader
    /// lock, so reads are judged against this set; writes against the writer
    /// set alone.
    pub full_lockset: &'a LockSet,
    /// Should policies accumulate racy instruction sets?
    pub track_racy_inst: bool,
    name: &'static str,
    race_db: &'a RaceDB,
    races: &'a AtomicU64,
}

impl AccessContext<'_> {
    /// The accessing thread's own epoch.
    pub fn epoch(&self) -> Timestamp {
        self.vc.get(self.tid)
    }

    /// Report one discovered race pair, prior access first. Deduplication
    /// happens in the race database; the return value says whether the
    /// static pair was new.
    pub fn report_race(
        &self,
        addr: Address,
        other_tid: ThreadId,
        other_inst: &InstRef,
        other_kind: AccessKind,
        kind: AccessKind,
    ) -> bool {
        racelog!(
            "[{}] race: addr {:#x} first [{}] inst [{}] {} / second [{}] inst [{}] {}",
            self.name,
            addr,
            other_tid,
            other_inst,
            other_kind,
            self.tid,
            self.inst,
            kind
        );
        let new = self.race_db.report_race(
            addr,
            other_tid,
            other_inst,
            other_kind,
            self.tid,
            self.inst,
            kind,
        );
        if new {
            self.races.fetch_add(1, Ordering::Relaxed);
        }
        new
    }
}

/// The analyzer-specific part of a detector: per-access decisions over the
/// framework-resolved meta.
pub trait AccessPolicy: Send {
    /// The per-address extension state this policy attaches to each meta.
    type Ext: Default + Send + std::fmt::Debug;

    /// Name used in logs and stats.
    const NAME: &'static str;

    /// A read of the meta's unit is about to execute.
    fn on_read(&mut self, ctx: &AccessContext<'_>, meta: &mut AccessMeta<Self::Ext>);

    /// A write of the meta's unit is about to execute.
    fn on_write(&mut self, ctx: &AccessContext<'_>, meta: &mut AccessMeta<Self::Ext>);

    /// The meta's unit was freed; flush whatever must outlive it.
    fn on_free(&mut self, meta: AccessMeta<Self::Ext>, race_db: &RaceDB, track_racy_inst: bool) {
        let _ = (meta, race_db, track_racy_inst);
    }
}

/// Vector clock state of one mutex.
#[derive(Debug, Default)]
struct MutexMeta {
    /// The clock released by the last unlock.
    vc: VectorClock,
    /// The thread currently holding the mutex.
    owner: Option<ThreadId>,
}

/// Vector clock state of one reader-writer lock.
#[derive(Debug, Default)]
struct RwlockMeta {
    /// The clock published at the last full release.
    vc: VectorClock,
    /// Accumulates holder contributions between the first unlock and the
    /// last unlock of one acquisition round.
    wait_vc: VectorClock,
    /// Number of current holders (readers or the writer).
    ref_count: u32,
}

/// Vector clock state of one condition variable.
#[derive(Debug, Default)]
struct CondMeta {
    vc: VectorClock,
}

/// Vector clock state of one barrier.
#[derive(Debug, Default)]
struct BarrierMeta {
    /// Parties required per round, from `barrier_init`. Zero when the init
    /// was not observed; such barriers never publish.
    target: u32,
    arrived: u32,
    wait_vc: VectorClock,
    vc: VectorClock,
}

/// Vector clock state of one semaphore.
#[derive(Debug, Default)]
struct SemMeta {
    vc: VectorClock,
}

/// Counters logged at program exit.
#[derive(Debug, Default)]
struct DetectorStats {
    access_count: u64,
    lock_count: u64,
    sync_count: u64,
}

#[derive(Debug)]
struct DetectorInner<P: AccessPolicy> {
    policy: P,
    curr_vc_map: BTreeMap<ThreadId, VectorClock>,
    writer_locksets: BTreeMap<ThreadId, LockSet>,
    reader_locksets: BTreeMap<ThreadId, LockSet>,
    meta_table: HashMap<Address, AccessMeta<P::Ext>>,
    mutex_meta_table: HashMap<Address, MutexMeta>,
    rwlock_meta_table: HashMap<Address, RwlockMeta>,
    cond_meta_table: HashMap<Address, CondMeta>,
    barrier_meta_table: HashMap<Address, BarrierMeta>,
    sem_meta_table: HashMap<Address, SemMeta>,
    stats: DetectorStats,
}

/// An online race detector: the framework plus one policy.
#[derive(Debug)]
pub struct Detector<P: AccessPolicy> {
    unit_size: u64,
    track_racy_inst: bool,
    race_db: Arc<RaceDB>,
    filter: RegionFilter,
    races: AtomicU64,
    inner: Mutex<DetectorInner<P>>,
}

impl<P: AccessPolicy> Detector<P> {
    /// Create a detector around `policy`, reporting into `race_db`.
    pub fn new(cfg: &Config, policy: P, race_db: Arc<RaceDB>) -> Self {
        assert!(cfg.unit_size > 0, "unit_size_ must be positive");
        Detector {
            unit_size: cfg.unit_size,
            track_racy_inst: cfg.track_racy_inst,
            race_db,
            filter: RegionFilter::new(),
            races: AtomicU64::new(0),
            inner: Mutex::new(DetectorInner {
                policy,
                curr_vc_map: BTreeMap::new(),
                writer_locksets: BTreeMap::new(),
                reader_locksets: BTreeMap::new(),
                meta_table: HashMap::new(),
                mutex_meta_table: HashMap::new(),
                rwlock_meta_table: HashMap::new(),
                cond_meta_table: HashMap::new(),
                barrier_meta_table: HashMap::new(),
                sem_meta_table: HashMap::new(),
                stats: DetectorStats::default(),
            }),
        }
    }

    /// Number of distinct races this detector has reported.
    pub fn races_found(&self) -> u64 {
        self.races.load(Ordering::Relaxed)
    }

    /// A thread's clock going missing means the event stream violated its
    /// ordering contract; nothing downstream can be trusted after that.
    fn vc_mut<'a>(
        map: &'a mut BTreeMap<ThreadId, VectorClock>,
        tid: ThreadId,
    ) -> &'a mut VectorClock {
        map.get_mut(&tid).unwrap_or_else(|| {
            panic!(
                "[{}] invariant violation: no vector clock for thread {}",
                P::NAME,
                tid
            )
        })
    }

    fn handle_access(&self, tid: ThreadId, inst: &InstRef, addr: Address, size: u64, kind: AccessKind) {
        if !self.filter.contains(addr) {
            return;
        }
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.stats.access_count += 1;

        let vc = inner.curr_vc_map.get(&tid).unwrap_or_else(|| {
            panic!(
                "[{}] invariant violation: access from unknown thread {}",
                P::NAME,
                tid
            )
        });
        let writer_lockset: &LockSet = inner.writer_locksets.entry(tid).or_default();
        let full_lockset = {
            let mut ls = writer_lockset.clone();
            if let Some(reader) = inner.reader_locksets.get(&tid) {
                ls.join(reader);
            }
            ls
        };
        let ctx = AccessContext {
            tid,
            inst,
            vc,
            writer_lockset,
            full_lockset: &full_lockset,
            track_racy_inst: self.track_racy_inst,
            name: P::NAME,
            race_db: &self.race_db,
            races: &self.races,
        };
        for unit in unit_range(addr, size, self.unit_size) {
            let meta = inner
                .meta_table
                .entry(unit)
                .or_insert_with(|| AccessMeta::new(unit));
            match kind {
                AccessKind::Read => inner.policy.on_read(&ctx, meta),
                AccessKind::Write => inner.policy.on_write(&ctx, meta),
                AccessKind::Atomic => {}
            }
        }
    }

    fn alloc_addr_region(&self, addr: Address, size: u64) {
        if addr == 0 || size == 0 {
            return;
        }
        self.filter.add(addr, size);
    }

    fn free_addr_region(&self, addr: Address) {
        if addr == 0 {
            return;
        }
        let size = self.filter.remove(addr);
        if size == 0 {
            return;
        }
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        for unit in unit_range(addr, size, self.unit_size) {
            if let Some(meta) = inner.meta_table.remove(&unit) {
                inner
                    .policy
                    .on_free(meta, &self.race_db, self.track_racy_inst);
            }
        }
    }
}

impl<P: AccessPolicy> Analyzer for Detector<P> {
    fn subscription(&self) -> Subscription {
        Subscription {
            before_mem: true,
            atomic_inst: true,
            pthread_func: true,
            malloc_func: true,
        }
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
        let mut inner = self.inner.lock().unwrap();
        let mut vc = VectorClock::new();
        vc.increment(tid);
        if parent.is_valid() {
            let parent_vc = inner.curr_vc_map.get(&parent).unwrap_or_else(|| {
                panic!(
                    "[{}] invariant violation: thread {} started by unknown parent {}",
                    P::NAME,
                    tid,
                    parent
                )
            });
            vc.join(parent_vc);
        }
        inner.curr_vc_map.insert(tid, vc);
    }

    fn thread_exit(&self, _tid: ThreadId, _clk: Timestamp) {
        // The clock stays visible so a later join can pick it up.
    }

    fn before_mem_read(&self, tid: ThreadId, _clk: Timestamp, inst: &InstRef, addr: Address, size: u64) {
        self.handle_access(tid, inst, addr, size, AccessKind::Read);
    }

    fn before_mem_write(&self, tid: ThreadId, _clk: Timestamp, inst: &InstRef, addr: Address, size: u64) {
        self.handle_access(tid, inst, addr, size, AccessKind::Write);
    }

    fn after_pthread_create(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, _child: ThreadId) {
        let mut inner = self.inner.lock().unwrap();
        Self::vc_mut(&mut inner.curr_vc_map, tid).increment(tid);
    }

    fn after_pthread_join(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, child: ThreadId) {
        let mut inner = self.inner.lock().unwrap();
        let child_vc = inner.curr_vc_map.get(&child).cloned().unwrap_or_else(|| {
            panic!(
                "[{}] invariant violation: join with unknown thread {}",
                P::NAME,
                child
            )
        });
        let vc = Self::vc_mut(&mut inner.curr_vc_map, tid);
        vc.join(&child_vc);
        vc.increment(tid);
    }

    fn after_mutex_lock(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.stats.lock_count += 1;
        // Lazy meta creation: programs sometimes hold locks before any
        // observed init.
        let meta = inner.mutex_meta_table.entry(addr).or_default();
        meta.owner = Some(tid);
        let vc = Self::vc_mut(&mut inner.curr_vc_map, tid);
        vc.join(&meta.vc);
        inner.writer_locksets.entry(tid).or_default().add(addr);
    }

    fn before_mutex_unlock(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.stats.lock_count += 1;
        let vc = Self::vc_mut(&mut inner.curr_vc_map, tid);
        let meta = inner.mutex_meta_table.entry(addr).or_default();
        if meta.owner != Some(tid) {
            warn!(
                "[{}] mutex {:#x} unlocked by thread {} but held by {:?}",
                P::NAME,
                addr,
                tid,
                meta.owner
            );
        }
        meta.owner = None;
        meta.vc = vc.clone();
        vc.increment(tid);
        let removed = inner
            .writer_locksets
            .get_mut(&tid)
            .map_or(false, |ls| ls.remove(addr));
        if !removed {
            warn!(
                "[{}] unlock of mutex {:#x} never seen locked by thread {}",
                P::NAME,
                addr,
                tid
            );
        }
    }

    fn after_rwlock_rdlock(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.stats.lock_count += 1;
        let meta = inner.rwlock_meta_table.entry(addr).or_default();
        meta.ref_count += 1;
        let vc = Self::vc_mut(&mut inner.curr_vc_map, tid);
        vc.join(&meta.vc);
        inner.reader_locksets.entry(tid).or_default().add(addr);
    }

    fn after_rwlock_wrlock(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.stats.lock_count += 1;
        let meta = inner.rwlock_meta_table.entry(addr).or_default();
        meta.ref_count += 1;
        let vc = Self::vc_mut(&mut inner.curr_vc_map, tid);
        vc.join(&meta.vc);
        inner.writer_locksets.entry(tid).or_default().add(addr);
    }

    fn before_rwlock_unlock(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.stats.lock_count += 1;
        let vc = Self::vc_mut(&mut inner.curr_vc_map, tid);
        let meta = inner.rwlock_meta_table.entry(addr).or_default();
        meta.ref_count = meta.ref_count.saturating_sub(1);
        meta.wait_vc.join(vc);
        if meta.ref_count == 0 {
            meta.vc = std::mem::take(&mut meta.wait_vc);
        }
        vc.increment(tid);
        // The lock is in exactly one of the two sets, depending on how it
        // was acquired; remove it from the one that holds it.
        let removed_r = inner
            .reader_locksets
            .get_mut(&tid)
            .map_or(false, |ls| ls.remove(addr));
        let removed_w = inner
            .writer_locksets
            .get_mut(&tid)
            .map_or(false, |ls| ls.remove(addr));
        if !(removed_r || removed_w) {
            warn!(
                "[{}] unlock of rwlock {:#x} never seen locked by thread {}",
                P::NAME,
                addr,
                tid
            );
        }
    }

    fn cond_signal(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address, _broadcast: bool) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.stats.sync_count += 1;
        let meta = inner.cond_meta_table.entry(addr).or_default();
        let vc = Self::vc_mut(&mut inner.curr_vc_map, tid);
        meta.vc.join(vc);
        vc.increment(tid);
    }

    fn before_cond_wait(
        &self,
        tid: ThreadId,
        _clk: Timestamp,
        _inst: &InstRef,
        _cond_addr: Address,
        mutex_addr: Address,
    ) {
        // Waiting releases the associated mutex.
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.stats.sync_count += 1;
        let vc = Self::vc_mut(&mut inner.curr_vc_map, tid);
        let meta = inner.mutex_meta_table.entry(mutex_addr).or_default();
        meta.vc = vc.clone();
        vc.increment(tid);
        if let Some(ls) = inner.writer_locksets.get_mut(&tid) {
            ls.remove(mutex_addr);
        }
    }

    fn after_cond_wait(
        &self,
        tid: ThreadId,
        _clk: Timestamp,
        _inst: &InstRef,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
        // Returning re-locks the mutex and observes the signaller's clock.
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.stats.sync_count += 1;
        let mutex_vc = inner.mutex_meta_table.entry(mutex_addr).or_default().vc.clone();
        let cond_vc = inner.cond_meta_table.entry(cond_addr).or_default().vc.clone();
        let vc = Self::vc_mut(&mut inner.curr_vc_map, tid);
        vc.join(&mutex_vc);
        vc.join(&cond_vc);
        inner.writer_locksets.entry(tid).or_default().add(mutex_addr);
    }

    fn barrier_init(&self, _tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address, count: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.barrier_meta_table.insert(
            addr,
            BarrierMeta {
                target: count,
                ..Default::default()
            },
        );
    }

    fn before_barrier_wait(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.stats.sync_count += 1;
        let vc = Self::vc_mut(&mut inner.curr_vc_map, tid);
        let meta = inner.barrier_meta_table.entry(addr).or_default();
        meta.wait_vc.join(vc);
        meta.arrived += 1;
        // The Nth arrival publishes the pairwise join for everyone.
        if meta.target > 0 && meta.arrived >= meta.target {
            meta.vc = std::mem::take(&mut meta.wait_vc);
            meta.arrived = 0;
        }
    }

    fn after_barrier_wait(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let barrier_vc = inner.barrier_meta_table.entry(addr).or_default().vc.clone();
        let vc = Self::vc_mut(&mut inner.curr_vc_map, tid);
        vc.join(&barrier_vc);
        vc.increment(tid);
    }

    fn sem_init(&self, _tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address, _value: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.sem_meta_table.insert(addr, SemMeta::default());
    }

    fn before_sem_post(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.stats.sync_count += 1;
        let meta = inner.sem_meta_table.entry(addr).or_default();
        let vc = Self::vc_mut(&mut inner.curr_vc_map, tid);
        meta.vc.join(vc);
        vc.increment(tid);
    }

    fn after_sem_wait(&self, tid: ThreadId, _clk: Timestamp, _inst: &InstRef, addr: Address) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.stats.sync_count += 1;
        let sem_vc = inner.sem_meta_table.entry(addr).or_default().vc.clone();
        let vc = Self::vc_mut(&mut inner.curr_vc_map, tid);
        vc.join(&sem_vc);
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
        let inner = self.inner.lock().unwrap();
        info!(
            "[{}] finished: {} accesses, {} lock ops, {} other sync ops, {} live metas, {} race(s) reported",
            P::NAME,
            inner.stats.access_count,
            inner.stats.lock_count,
            inner.stats.sync_count,
            inner.meta_table.len(),
            self.races_found(),
        );
    }
}

/// The unit-aligned addresses covering `[addr, addr+size)`.
pub(crate) fn unit_range(addr: Address, size: u64, unit_size: u64) -> impl Iterator<Item = Address> {
    let start = addr / unit_size * unit_size;
    let end = (addr + size).div_ceil(unit_size) * unit_size;
    (start..end).step_by(unit_size as usize)
}
