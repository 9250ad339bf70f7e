/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The analyzer dispatch surface.
//!
//! Analyzers share a large handler surface covering every event record the
//! instrumentation can deliver. Each concrete analyzer overrides the subset
//! it cares about; everything else defaults to a no-op.

use racecore_model::tid::ThreadId;
use racecore_model::Address;

use crate::events::Timestamp;
use crate::sinfo::InstRef;

/// Which hook families an analyzer needs the instrumentation to deliver.
/// The engine merges the subscriptions of every registered analyzer and
/// republishes the union to the instrumentation driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Subscription {
    /// Memory reads/writes before they execute.
    pub before_mem: bool,
    /// Atomic instructions, before and after.
    pub atomic_inst: bool,
    /// Thread lifecycle and pthread synchronization wrappers.
    pub pthread_func: bool,
    /// Malloc-family wrappers.
    pub malloc_func: bool,
}

impl Subscription {
    /// Subscribe to nothing.
    pub fn none() -> Self {
        Default::default()
    }

    /// Subscribe to every hook family.
    pub fn all() -> Self {
        Subscription {
            before_mem: true,
            atomic_inst: true,
            pthread_func: true,
            malloc_func: true,
        }
    }

    /// Union another subscription into this one.
    pub fn merge(&mut self, other: Subscription) {
        self.before_mem |= other.before_mem;
        self.atomic_inst |= other.atomic_inst;
        self.pthread_func |= other.pthread_func;
        self.malloc_func |= other.malloc_func;
    }
}

/// One consumer of the event stream. All methods default to no-ops; `try`
/// variants gate their "after" semantics on a zero return value so that a
/// failed acquisition never joins clocks or grows locksets.
#[allow(unused_variables, clippy::too_many_arguments)]
pub trait Analyzer: Send + Sync {
    /// Which hook families this analyzer needs delivered.
    fn subscription(&self) -> Subscription {
        Subscription::none()
    }

    /// An image was mapped; data/bss delimit its statically allocated memory.
    fn image_load(
        &self,
        image: &str,
        low: Address,
        high: Address,
        data_start: Address,
        data_size: u64,
        bss_start: Address,
        bss_size: u64,
    ) {
    }

    /// An image was unmapped.
    fn image_unload(
        &self,
        image: &str,
        low: Address,
        high: Address,
        data_start: Address,
        data_size: u64,
        bss_start: Address,
        bss_size: u64,
    ) {
    }

    /// A new application thread began executing. `parent` is `INVALID` for
    /// the root thread.
    fn thread_start(&self, tid: ThreadId, parent: ThreadId) {}

    /// An application thread exited, with its final thread-local clock.
    fn thread_exit(&self, tid: ThreadId, clk: Timestamp) {}

    fn before_mem_read(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address, size: u64) {
    }

    fn before_mem_write(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address, size: u64) {
    }

    fn before_atomic_inst(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        opcode: &str,
        addr: Address,
    ) {
    }

    fn after_atomic_inst(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        opcode: &str,
        addr: Address,
    ) {
    }

    fn before_pthread_create(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef) {}

    fn after_pthread_create(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, child: ThreadId) {}

    fn before_pthread_join(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, child: ThreadId) {}

    fn after_pthread_join(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, child: ThreadId) {}

    fn before_mutex_lock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {}

    fn after_mutex_lock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {}

    fn before_mutex_unlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {}

    fn after_mutex_unlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {}

    fn before_mutex_try_lock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.before_mutex_lock(tid, clk, inst, addr)
    }

    fn after_mutex_try_lock(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        addr: Address,
        ret: i32,
    ) {
        if ret == 0 {
            self.after_mutex_lock(tid, clk, inst, addr)
        }
    }

    fn before_rwlock_rdlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {}

    fn after_rwlock_rdlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {}

    fn before_rwlock_wrlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {}

    fn after_rwlock_wrlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {}

    fn before_rwlock_unlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {}

    fn after_rwlock_unlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {}

    fn before_rwlock_try_rdlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.before_rwlock_rdlock(tid, clk, inst, addr)
    }

    fn after_rwlock_try_rdlock(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        addr: Address,
        ret: i32,
    ) {
        if ret == 0 {
            self.after_rwlock_rdlock(tid, clk, inst, addr)
        }
    }

    fn before_rwlock_try_wrlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        self.before_rwlock_wrlock(tid, clk, inst, addr)
    }

    fn after_rwlock_try_wrlock(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        addr: Address,
        ret: i32,
    ) {
        if ret == 0 {
            self.after_rwlock_wrlock(tid, clk, inst, addr)
        }
    }

    /// A condition variable was signalled (or broadcast when `broadcast`).
    fn cond_signal(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        addr: Address,
        broadcast: bool,
    ) {
    }

    fn before_cond_wait(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
    }

    fn after_cond_wait(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
    }

    fn before_cond_timedwait(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
        self.before_cond_wait(tid, clk, inst, cond_addr, mutex_addr)
    }

    fn after_cond_timedwait(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        cond_addr: Address,
        mutex_addr: Address,
        ret: i32,
    ) {
        if ret == 0 {
            self.after_cond_wait(tid, clk, inst, cond_addr, mutex_addr)
        }
    }

    fn barrier_init(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address, count: u32) {
    }

    fn before_barrier_wait(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {}

    fn after_barrier_wait(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {}

    fn sem_init(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address, value: u32) {}

    fn before_sem_post(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {}

    fn after_sem_post(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {}

    fn before_sem_wait(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {}

    fn after_sem_wait(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {}

    fn after_malloc(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, size: u64, addr: Address) {}

    fn after_calloc(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        nmemb: u64,
        size: u64,
        addr: Address,
    ) {
    }

    fn before_realloc(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        ori_addr: Address,
        size: u64,
    ) {
    }

    fn after_realloc(
        &self,
        tid: ThreadId,
        clk: Timestamp,
        inst: &InstRef,
        ori_addr: Address,
        size: u64,
        new_addr: Address,
    ) {
    }

    fn before_free(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {}

    /// The instrumented program is exiting; flush state and log summaries.
    fn program_exit(&self) {}
}

/// An analyzer that logs every interesting event at TRACE level. Useful when
/// diagnosing the engine itself; the engine registers it only when TRACE
/// logging is enabled.
#[derive(Debug, Default)]
pub struct DebugAnalyzer;

impl Analyzer for DebugAnalyzer {
    fn subscription(&self) -> Subscription {
        Subscription::all()
    }

    fn thread_start(&self, tid: ThreadId, parent: ThreadId) {
        tracing::trace!("[debug-analyzer] thread start: tid {} parent {}", tid, parent);
    }

    fn thread_exit(&self, tid: ThreadId, clk: Timestamp) {
        tracing::trace!("[debug-analyzer] thread exit: tid {} clk {}", tid, clk);
    }

    fn before_mem_read(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address, size: u64) {
        tracing::trace!(
            "[debug-analyzer] read: tid {} clk {} inst {} addr {:#x} size {}",
            tid,
            clk,
            inst,
            addr,
            size
        );
    }

    fn before_mem_write(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address, size: u64) {
        tracing::trace!(
            "[debug-analyzer] write: tid {} clk {} inst {} addr {:#x} size {}",
            tid,
            clk,
            inst,
            addr,
            size
        );
    }

    fn after_mutex_lock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        tracing::trace!(
            "[debug-analyzer] mutex lock: tid {} clk {} inst {} mutex {:#x}",
            tid,
            clk,
            inst,
            addr
        );
    }

    fn before_mutex_unlock(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        tracing::trace!(
            "[debug-analyzer] mutex unlock: tid {} clk {} inst {} mutex {:#x}",
            tid,
            clk,
            inst,
            addr
        );
    }

    fn after_malloc(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, size: u64, addr: Address) {
        tracing::trace!(
            "[debug-analyzer] malloc: tid {} clk {} inst {} size {} -> {:#x}",
            tid,
            clk,
            inst,
            size,
            addr
        );
    }

    fn before_free(&self, tid: ThreadId, clk: Timestamp, inst: &InstRef, addr: Address) {
        tracing::trace!(
            "[debug-analyzer] free: tid {} clk {} inst {} addr {:#x}",
            tid,
            clk,
            inst,
            addr
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_merge_is_union() {
        let mut s = Subscription::none();
        s.merge(Subscription {
            before_mem: true,
            ..Default::default()
        });
        s.merge(Subscription {
            pthread_func: true,
            ..Default::default()
        });
        assert!(s.before_mem && s.pthread_func);
        assert!(!s.atomic_inst && !s.malloc_func);
        s.merge(Subscription::all());
        assert_eq!(s, Subscription::all());
    }
}
