/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The top-level engine: owns the static info table, the race databases,
//! the registered analyzers and the optional verifier, and fans the event
//! stream out to them.
//!
//! The instrumentation runtime drives this type directly: one call per
//! event record, on the application thread that produced it. With parallel
//! detection enabled, detection analyzers consume from worker deques
//! instead, while the verifier always runs inline because it may block the
//! calling thread.

use std::sync::Arc;

use racecore_model::config::Config;
use racecore_model::tid::ThreadId;
use racecore_model::Address;
use tracing::info;
use tracing::warn;
use tracing::Level;

use crate::analyzer::Analyzer;
use crate::analyzer::DebugAnalyzer;
use crate::analyzer::Subscription;
use crate::detector::eraser::Eraser;
use crate::detector::hb::HappensBefore;
use crate::detector::hybrid::Hybrid;
use crate::detector::multilock_hb::MultiLockHb;
use crate::detector::Detector;
use crate::events::Event;
use crate::events::Timestamp;
use crate::pstmt::PRaceDB;
use crate::race_db::RaceDB;
use crate::race_db::RaceReport;
use crate::sinfo::InstRef;
use crate::sinfo::StaticInfo;
use crate::verifier::Verifier;
use crate::workers::WorkerPool;

/// The assembled race tool for one program run.
pub struct RaceEngine {
    cfg: Config,
    sinfo: Arc<StaticInfo>,
    race_db: Arc<RaceDB>,
    prace_db: Arc<PRaceDB>,
    /// Detection analyzers; fed inline or through the worker pool.
    analyzers: Vec<Arc<dyn Analyzer>>,
    /// The verifier is always inline: its access handlers block the
    /// application thread.
    verifier: Option<Arc<Verifier>>,
    workers: Option<WorkerPool>,
    subscription: Subscription,
}

impl RaceEngine {
    /// Assemble the engine from configuration. Unreadable databases and
    /// profiles are surfaced to the operator and the engine proceeds with
    /// empty tables.
    pub fn new(cfg: Config) -> Self {
        let sinfo = Arc::new(StaticInfo::new());
        if let Err(e) = sinfo.load(&cfg.sinfo_in) {
            warn!("[engine] proceeding without static info: {:#}", e);
        }

        let race_db = Arc::new(RaceDB::new());
        if let Err(e) = race_db.load(&cfg.race_in, &sinfo) {
            warn!("[engine] proceeding without race history: {:#}", e);
        }

        let prace_db = Arc::new(PRaceDB::new());
        if let Some(profile) = &cfg.static_profile {
            match prace_db.load(profile) {
                Ok(()) => {
                    // The sidecar only matters when the instrumentation is
                    // restricted to the profiled lines.
                    if cfg.partial_instrument {
                        if let Some(lines) = &cfg.instrumented_lines {
                            if let Err(e) = prace_db.write_instrumented_lines(lines) {
                                warn!("[engine] could not write instrumented lines: {:#}", e);
                            }
                        }
                    }
                }
                Err(e) => warn!("[engine] proceeding without static profile: {:#}", e),
            }
        }
        if cfg.parallel_verifier_number > 0 {
            // Parallel historical verification is not implemented; the
            // verifier runs inline on the application threads.
            warn!(
                "[engine] parallel_verifier_number {} requested; verification runs inline",
                cfg.parallel_verifier_number
            );
        }

        let mut analyzers: Vec<Arc<dyn Analyzer>> = Vec::new();
        if tracing::enabled!(Level::TRACE) {
            analyzers.push(Arc::new(DebugAnalyzer));
        }
        if cfg.enable_hb {
            analyzers.push(Arc::new(Detector::new(&cfg, HappensBefore, race_db.clone())));
            info!("[engine] registered analyzer: hb");
        }
        if cfg.enable_eraser {
            analyzers.push(Arc::new(Detector::new(&cfg, Eraser, race_db.clone())));
            info!("[engine] registered analyzer: eraser");
        }
        if cfg.enable_hybrid {
            analyzers.push(Arc::new(Detector::new(&cfg, Hybrid, race_db.clone())));
            info!("[engine] registered analyzer: hybrid");
        }
        if cfg.enable_multilock_hb {
            analyzers.push(Arc::new(Detector::new(&cfg, MultiLockHb, race_db.clone())));
            info!("[engine] registered analyzer: multilock-hb");
        }

        let verifier = if cfg.race_verify {
            info!("[engine] registered analyzer: verifier");
            Some(Arc::new(Verifier::new(
                &cfg,
                prace_db.clone(),
                race_db.clone(),
            )))
        } else {
            None
        };

        let mut subscription = Subscription::none();
        for analyzer in analyzers.iter() {
            subscription.merge(analyzer.subscription());
        }
        if let Some(verifier) = &verifier {
            subscription.merge(verifier.subscription());
        }

        let workers = if cfg.parallel_detector_number > 0 && !analyzers.is_empty() {
            Some(WorkerPool::spawn(
                cfg.parallel_detector_number,
                analyzers.clone(),
            ))
        } else {
            None
        };

        RaceEngine {
            cfg,
            sinfo,
            race_db,
            prace_db,
            analyzers,
            verifier,
            workers,
            subscription,
        }
    }

    /// The hook families the instrumentation must deliver for the
    /// registered analyzers.
    pub fn subscription(&self) -> Subscription {
        self.subscription
    }

    /// The engine's configuration.
    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    /// The shared static info table.
    pub fn sinfo(&self) -> &Arc<StaticInfo> {
        &self.sinfo
    }

    /// The shared race database.
    pub fn race_db(&self) -> &Arc<RaceDB> {
        &self.race_db
    }

    /// The potential-statement database.
    pub fn prace_db(&self) -> &Arc<PRaceDB> {
        &self.prace_db
    }

    /// Should memory accesses from this image be dropped at the
    /// instrumentation boundary? Accesses inside the pthread runtime are
    /// never monitored; with `ignore_lib`, neither are other common
    /// libraries.
    pub fn ignore_mem_access(&self, image: &str) -> bool {
        let base = crate::sinfo::basename(image);
        if base.starts_with("libpthread") {
            return true;
        }
        self.cfg.ignore_lib && base.starts_with("lib") && base.contains(".so")
    }

    /// Resolve an instruction handle for an observed address, creating it
    /// on first sight.
    pub fn resolve_inst(
        &self,
        image: &str,
        offset: u64,
        opcode: Option<&str>,
        debug: Option<(&str, u32, u32)>,
    ) -> InstRef {
        self.sinfo.ensure_inst(image, offset, opcode, debug)
    }

    /// Fan one event out. Memory events go through the worker pool when
    /// one exists; synchronization and lifecycle events always run inline
    /// so shared clock state mutates exactly once, before any later access
    /// is enqueued. The verifier runs inline last.
    fn dispatch(&self, event: Event) {
        let mut inline = true;
        if let Some(pool) = &self.workers {
            if event.memory_addr().is_some() {
                pool.dispatch_memory(event.clone());
                inline = false;
            }
        }
        if inline {
            for analyzer in self.analyzers.iter() {
                event.dispatch(analyzer.as_ref());
            }
        }
        if let Some(verifier) = &self.verifier {
            event.dispatch(verifier.as_ref() as &dyn Analyzer);
        }
    }

    // ---- event-stream entry points -------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn image_load(
        &self,
        image: &str,
        low: Address,
        high: Address,
        data_start: Address,
        data_size: u64,
        bss_start: Address,
        bss_size: u64,
    ) {
        self.sinfo.ensure_image(image);
        self.dispatch(Event::ImageLoad {
            image: image.to_string(),
            low,
            high,
            data_start,
            data_size,
            bss_start,
            bss_size,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn image_unload(
        &self,
        image: &str,
        low: Address,
        high: Address,
        data_start: Address,
        data_size: u64,
        bss_start: Address,
        bss_size: u64,
    ) {
        self.dispatch(Event::ImageUnload {
            image: image.to_string(),
            low,
            high,
            data_start,
            data_size,
            bss_start,
            bss_size,
        });
    }

    pub fn thread_start(&self, tid: ThreadId, parent: ThreadId) {
        self.dispatch(Event::ThreadStart { tid, parent });
    }

    pub fn thread_exit(&self, tid: ThreadId, clk: Timestamp) {
        self.dispatch(Event::ThreadExit { tid, clk });
    }

    pub fn mem_read(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address, size: u64) {
        self.dispatch(Event::MemRead {
            tid,
            clk,
            inst: inst.clone(),
            addr,
            size,
        });
    }

    /// Second read operand of one instruction; same contract as `mem_read`.
    pub fn mem_read2(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address, size: u64) {
        self.mem_read(tid, clk, inst, addr, size);
    }

    pub fn mem_write(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address, size: u64) {
        self.dispatch(Event::MemWrite {
            tid,
            clk,
            inst: inst.clone(),
            addr,
            size,
        });
    }

    pub fn before_atomic_inst(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        opcode: &str,
        addr: Address,
    ) {
        self.dispatch(Event::BeforeAtomic {
            tid,
            clk,
            inst: inst.clone(),
            opcode: opcode.to_string(),
            addr,
        });
    }

    pub fn after_atomic_inst(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        opcode: &str,
        addr: Address,
    ) {
        self.dispatch(Event::AfterAtomic {
            tid,
            clk,
            inst: inst.clone(),
            opcode: opcode.to_string(),
            addr,
        });
    }

    pub fn before_pthread_create(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef) {
        self.dispatch(Event::BeforePthreadCreate {
            tid,
            clk,
            inst: inst.clone(),
        });
    }

    pub fn after_pthread_create(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, child: ThreadId) {
        self.dispatch(Event::AfterPthreadCreate {
            tid,
            clk,
            inst: inst.clone(),
            child,
        });
    }

    pub fn before_pthread_join(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, child: ThreadId) {
        self.dispatch(Event::BeforePthreadJoin {
            tid,
            clk,
            inst: inst.clone(),
            child,
        });
    }

    pub fn after_pthread_join(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, child: ThreadId) {
        self.dispatch(Event::AfterPthreadJoin {
            tid,
            clk,
            inst: inst.clone(),
            child,
        });
    }

    pub fn before_mutex_lock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::BeforeMutexLock {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    pub fn after_mutex_lock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::AfterMutexLock {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    pub fn before_mutex_unlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::BeforeMutexUnlock {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    pub fn after_mutex_unlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::AfterMutexUnlock {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    pub fn before_mutex_try_lock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::BeforeMutexTryLock {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    /// `ret` is the call's return value; the joins only happen on success.
    pub fn after_mutex_try_lock(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        addr: Address,
        ret: i32,
    ) {
        self.dispatch(Event::AfterMutexTryLock {
            tid,
            clk,
            inst: inst.clone(),
            addr,
            ret,
        });
    }

    pub fn before_rwlock_rdlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::BeforeRwlockRdlock {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    pub fn after_rwlock_rdlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::AfterRwlockRdlock {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    pub fn before_rwlock_wrlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::BeforeRwlockWrlock {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    pub fn after_rwlock_wrlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::AfterRwlockWrlock {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    pub fn before_rwlock_try_rdlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::BeforeRwlockTryRdlock {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    pub fn after_rwlock_try_rdlock(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        addr: Address,
        ret: i32,
    ) {
        self.dispatch(Event::AfterRwlockTryRdlock {
            tid,
            clk,
            inst: inst.clone(),
            addr,
            ret,
        });
    }

    pub fn before_rwlock_try_wrlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::BeforeRwlockTryWrlock {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    pub fn after_rwlock_try_wrlock(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        addr: Address,
        ret: i32,
    ) {
        self.dispatch(Event::AfterRwlockTryWrlock {
            tid,
            clk,
            inst: inst.clone(),
            addr,
            ret,
        });
    }

    pub fn before_rwlock_unlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::BeforeRwlockUnlock {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    pub fn after_rwlock_unlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::AfterRwlockUnlock {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    /// Covers both `pthread_cond_signal` and `pthread_cond_broadcast`.
    pub fn cond_signal(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        addr: Address,
        broadcast: bool,
    ) {
        self.dispatch(Event::CondSignal {
            tid,
            clk,
            inst: inst.clone(),
            addr,
            broadcast,
        });
    }

    pub fn before_cond_wait(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
        self.dispatch(Event::BeforeCondWait {
            tid,
            clk,
            inst: inst.clone(),
            cond_addr,
            mutex_addr,
        });
    }

    pub fn after_cond_wait(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
        self.dispatch(Event::AfterCondWait {
            tid,
            clk,
            inst: inst.clone(),
            cond_addr,
            mutex_addr,
        });
    }

    pub fn before_cond_timedwait(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
        self.dispatch(Event::BeforeCondTimedwait {
            tid,
            clk,
            inst: inst.clone(),
            cond_addr,
            mutex_addr,
        });
    }

    /// `ret` non-zero (timeout) skips the clock join on the "after" side.
    #[allow(clippy::too_many_arguments)]
    pub fn after_cond_timedwait(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        cond_addr: Address,
        mutex_addr: Address,
        ret: i32,
    ) {
        self.dispatch(Event::AfterCondTimedwait {
            tid,
            clk,
            inst: inst.clone(),
            cond_addr,
            mutex_addr,
            ret,
        });
    }

    pub fn barrier_init(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address, count: u32) {
        self.dispatch(Event::BarrierInit {
            tid,
            clk,
            inst: inst.clone(),
            addr,
            count,
        });
    }

    pub fn before_barrier_wait(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::BeforeBarrierWait {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    pub fn after_barrier_wait(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::AfterBarrierWait {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    pub fn sem_init(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address, value: u32) {
        self.dispatch(Event::SemInit {
            tid,
            clk,
            inst: inst.clone(),
            addr,
            value,
        });
    }

    pub fn before_sem_post(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::BeforeSemPost {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    pub fn after_sem_post(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::AfterSemPost {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    pub fn before_sem_wait(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::BeforeSemWait {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    pub fn after_sem_wait(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::AfterSemWait {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    pub fn after_malloc(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, size: u64, addr: Address) {
        self.dispatch(Event::AfterMalloc {
            tid,
            clk,
            inst: inst.clone(),
            size,
            addr,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn after_calloc(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        nmemb: u64,
        size: u64,
        addr: Address,
    ) {
        self.dispatch(Event::AfterCalloc {
            tid,
            clk,
            inst: inst.clone(),
            nmemb,
            size,
            addr,
        });
    }

    pub fn before_realloc(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, ori_addr: Address, size: u64) {
        self.dispatch(Event::BeforeRealloc {
            tid,
            clk,
            inst: inst.clone(),
            ori_addr,
            size,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn after_realloc(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        ori_addr: Address,
        size: u64,
        new_addr: Address,
    ) {
        self.dispatch(Event::AfterRealloc {
            tid,
            clk,
            inst: inst.clone(),
            ori_addr,
            size,
            new_addr,
        });
    }

    pub fn before_free(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.dispatch(Event::BeforeFree {
            tid,
            clk,
            inst: inst.clone(),
            addr,
        });
    }

    /// Flush analyzers, join detection workers and persist the run's
    /// artifacts.
    pub fn program_exit(&mut self) {
        // Workers drain first so the exit hooks observe final state.
        if let Some(pool) = self.workers.take() {
            pool.shutdown();
        }
        self.dispatch(Event::ProgramExit);
        if let Err(e) = self.sinfo.save(&self.cfg.sinfo_out) {
            warn!("[engine] could not save static info: {:#}", e);
        }
        if let Err(e) = self.race_db.save(&self.cfg.race_out, &self.sinfo) {
            warn!("[engine] could not save race database: {:#}", e);
        }
        if let Err(e) = RaceReport::save(&self.cfg.race_report, &self.race_db) {
            warn!("[engine] could not save race report: {:#}", e);
        }
        info!(
            "[engine] run complete: {} distinct race(s) known",
            self.race_db.race_count()
        );
    }
}

impl Drop for RaceEngine {
    fn drop(&mut self) {
        // A pool left running would block forever on its condvar.
        if let Some(pool) = self.workers.take() {
            pool.shutdown();
        }
    }
}
