/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Typed records of the event-stream contract.
//!
//! Inline dispatch calls analyzer handlers directly; the `Event` enum exists
//! so that the same records can be materialized into the parallel-detection
//! worker queues and replayed there in FIFO order.

use std::fmt;

pub use racecore_model::clock::Timestamp;
use racecore_model::tid::ThreadId;
use racecore_model::Address;
use serde::Deserialize;
use serde::Serialize;

use crate::analyzer::Analyzer;
use crate::sinfo::InstRef;

/// The kind of one memory access.
#[derive(PartialEq, Debug, Eq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessKind {
    Read,
    Write,
    Atomic,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessKind::Read => "READ",
            AccessKind::Write => "WRITE",
            AccessKind::Atomic => "ATOMIC",
        };
        write!(f, "{}", s)
    }
}

/// One record of the event stream, in the shape the instrumentation delivers
/// it. Every record carries the issuing thread and its thread-local clock.
#[derive(Debug, Clone)]
pub enum Event {
    ImageLoad {
        image: String,
        low: Address,
        high: Address,
        data_start: Address,
        data_size: u64,
        bss_start: Address,
        bss_size: u64,
    },
    ImageUnload {
        image: String,
        low: Address,
        high: Address,
        data_start: Address,
        data_size: u64,
        bss_start: Address,
        bss_size: u64,
    },
    ThreadStart {
        tid: ThreadId,
        parent: ThreadId,
    },
    ThreadExit {
        tid: ThreadId,
        clk: Timestamp,
    },
    MemRead {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
        size: u64,
    },
    MemWrite {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
        size: u64,
    },
    BeforeAtomic {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        opcode: String,
        addr: Address,
    },
    AfterAtomic {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        opcode: String,
        addr: Address,
    },
    BeforePthreadCreate {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
    },
    AfterPthreadCreate {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        child: ThreadId,
    },
    BeforePthreadJoin {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        child: ThreadId,
    },
    AfterPthreadJoin {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        child: ThreadId,
    },
    BeforeMutexLock {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    AfterMutexLock {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    BeforeMutexUnlock {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    AfterMutexUnlock {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    BeforeMutexTryLock {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    AfterMutexTryLock {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
        ret: i32,
    },
    BeforeRwlockRdlock {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    AfterRwlockRdlock {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    BeforeRwlockWrlock {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    AfterRwlockWrlock {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    BeforeRwlockTryRdlock {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    AfterRwlockTryRdlock {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
        ret: i32,
    },
    BeforeRwlockTryWrlock {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    AfterRwlockTryWrlock {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
        ret: i32,
    },
    BeforeRwlockUnlock {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    AfterRwlockUnlock {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    CondSignal {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
        broadcast: bool,
    },
    BeforeCondWait {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        cond_addr: Address,
        mutex_addr: Address,
    },
    AfterCondWait {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        cond_addr: Address,
        mutex_addr: Address,
    },
    BeforeCondTimedwait {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        cond_addr: Address,
        mutex_addr: Address,
    },
    AfterCondTimedwait {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        cond_addr: Address,
        mutex_addr: Address,
        ret: i32,
    },
    BarrierInit {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
        count: u32,
    },
    BeforeBarrierWait {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    AfterBarrierWait {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    SemInit {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
        value: u32,
    },
    BeforeSemPost {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    AfterSemPost {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    BeforeSemWait {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    AfterSemWait {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    AfterMalloc {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        size: u64,
        addr: Address,
    },
    AfterCalloc {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        nmemb: u64,
        size: u64,
        addr: Address,
    },
    BeforeRealloc {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        ori_addr: Address,
        size: u64,
    },
    AfterRealloc {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        ori_addr: Address,
        size: u64,
        new_addr: Address,
    },
    BeforeFree {
        tid: ThreadId,
        clk: Timestamp,
        inst: InstRef,
        addr: Address,
    },
    ProgramExit,
}

impl Event {
    /// The accessed address of a memory event, used to pick the detection
    /// worker that must observe the event. Non-memory events return None and
    /// are broadcast instead.
    pub fn memory_addr(&self) -> Option<Address> {
        match self {
            Event::MemRead { addr, .. } | Event::MemWrite { addr, .. } => Some(*addr),
            _ => None,
        }
    }

    /// Replay this record against one analyzer.
    pub fn dispatch(&self, analyzer: &dyn Analyzer) {
        match self {
            Event::ImageLoad {
                image,
                low,
                high,
                data_start,
                data_size,
                bss_start,
                bss_size,
            } => analyzer.image_load(
                image,
                *low,
                *high,
                *data_start,
                *data_size,
                *bss_start,
                *bss_size,
            ),
            Event::ImageUnload {
                image,
                low,
                high,
                data_start,
                data_size,
                bss_start,
                bss_size,
            } => analyzer.image_unload(
                image,
                *low,
                *high,
                *data_start,
                *data_size,
                *bss_start,
                *bss_size,
            ),
            Event::ThreadStart { tid, parent } => analyzer.thread_start(*tid, *parent),
            Event::ThreadExit { tid, clk } => analyzer.thread_exit(*tid, *clk),
            Event::MemRead {
                tid,
                clk,
                inst,
                addr,
                size,
            } => analyzer.before_mem_read(*tid, *clk, inst, *addr, *size),
            Event::MemWrite {
                tid,
                clk,
                inst,
                addr,
                size,
            } => analyzer.before_mem_write(*tid, *clk, inst, *addr, *size),
            Event::BeforeAtomic {
                tid,
                clk,
                inst,
                opcode,
                addr,
            } => analyzer.before_atomic_inst(*tid, *clk, inst, opcode, *addr),
            Event::AfterAtomic {
                tid,
                clk,
                inst,
                opcode,
                addr,
            } => analyzer.after_atomic_inst(*tid, *clk, inst, opcode, *addr),
            Event::BeforePthreadCreate { tid, clk, inst } => {
                analyzer.before_pthread_create(*tid, *clk, inst)
            }
            Event::AfterPthreadCreate {
                tid,
                clk,
                inst,
                child,
            } => analyzer.after_pthread_create(*tid, *clk, inst, *child),
            Event::BeforePthreadJoin {
                tid,
                clk,
                inst,
                child,
            } => analyzer.before_pthread_join(*tid, *clk, inst, *child),
            Event::AfterPthreadJoin {
                tid,
                clk,
                inst,
                child,
            } => analyzer.after_pthread_join(*tid, *clk, inst, *child),
            Event::BeforeMutexLock {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.before_mutex_lock(*tid, *clk, inst, *addr),
            Event::AfterMutexLock {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.after_mutex_lock(*tid, *clk, inst, *addr),
            Event::BeforeMutexUnlock {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.before_mutex_unlock(*tid, *clk, inst, *addr),
            Event::AfterMutexUnlock {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.after_mutex_unlock(*tid, *clk, inst, *addr),
            Event::BeforeMutexTryLock {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.before_mutex_try_lock(*tid, *clk, inst, *addr),
            Event::AfterMutexTryLock {
                tid,
                clk,
                inst,
                addr,
                ret,
            } => analyzer.after_mutex_try_lock(*tid, *clk, inst, *addr, *ret),
            Event::BeforeRwlockRdlock {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.before_rwlock_rdlock(*tid, *clk, inst, *addr),
            Event::AfterRwlockRdlock {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.after_rwlock_rdlock(*tid, *clk, inst, *addr),
            Event::BeforeRwlockWrlock {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.before_rwlock_wrlock(*tid, *clk, inst, *addr),
            Event::AfterRwlockWrlock {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.after_rwlock_wrlock(*tid, *clk, inst, *addr),
            Event::BeforeRwlockTryRdlock {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.before_rwlock_try_rdlock(*tid, *clk, inst, *addr),
            Event::AfterRwlockTryRdlock {
                tid,
                clk,
                inst,
                addr,
                ret,
            } => analyzer.after_rwlock_try_rdlock(*tid, *clk, inst, *addr, *ret),
            Event::BeforeRwlockTryWrlock {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.before_rwlock_try_wrlock(*tid, *clk, inst, *addr),
            Event::AfterRwlockTryWrlock {
                tid,
                clk,
                inst,
                addr,
                ret,
            } => analyzer.after_rwlock_try_wrlock(*tid, *clk, inst, *addr, *ret),
            Event::BeforeRwlockUnlock {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.before_rwlock_unlock(*tid, *clk, inst, *addr),
            Event::AfterRwlockUnlock {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.after_rwlock_unlock(*tid, *clk, inst, *addr),
            Event::CondSignal {
                tid,
                clk,
                inst,
                addr,
                broadcast,
            } => analyzer.cond_signal(*tid, *clk, inst, *addr, *broadcast),
            Event::BeforeCondWait {
                tid,
                clk,
                inst,
                cond_addr,
                mutex_addr,
            } => analyzer.before_cond_wait(*tid, *clk, inst, *cond_addr, *mutex_addr),
            Event::AfterCondWait {
                tid,
                clk,
                inst,
                cond_addr,
                mutex_addr,
            } => analyzer.after_cond_wait(*tid, *clk, inst, *cond_addr, *mutex_addr),
            Event::BeforeCondTimedwait {
                tid,
                clk,
                inst,
                cond_addr,
                mutex_addr,
            } => analyzer.before_cond_timedwait(*tid, *clk, inst, *cond_addr, *mutex_addr),
            Event::AfterCondTimedwait {
                tid,
                clk,
                inst,
                cond_addr,
                mutex_addr,
                ret,
            } => analyzer.after_cond_timedwait(*tid, *clk, inst, *cond_addr, *mutex_addr, *ret),
            Event::BarrierInit {
                tid,
                clk,
                inst,
                addr,
                count,
            } => analyzer.barrier_init(*tid, *clk, inst, *addr, *count),
            Event::BeforeBarrierWait {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.before_barrier_wait(*tid, *clk, inst, *addr),
            Event::AfterBarrierWait {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.after_barrier_wait(*tid, *clk, inst, *addr),
            Event::SemInit {
                tid,
                clk,
                inst,
                addr,
                value,
            } => analyzer.sem_init(*tid, *clk, inst, *addr, *value),
            Event::BeforeSemPost {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.before_sem_post(*tid, *clk, inst, *addr),
            Event::AfterSemPost {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.after_sem_post(*tid, *clk, inst, *addr),
            Event::BeforeSemWait {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.before_sem_wait(*tid, *clk, inst, *addr),
            Event::AfterSemWait {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.after_sem_wait(*tid, *clk, inst, *addr),
            Event::AfterMalloc {
                tid,
                clk,
                inst,
                size,
                addr,
            } => analyzer.after_malloc(*tid, *clk, inst, *size, *addr),
            Event::AfterCalloc {
                tid,
                clk,
                inst,
                nmemb,
                size,
                addr,
            } => analyzer.after_calloc(*tid, *clk, inst, *nmemb, *size, *addr),
            Event::BeforeRealloc {
                tid,
                clk,
                inst,
                ori_addr,
                size,
            } => analyzer.before_realloc(*tid, *clk, inst, *ori_addr, *size),
            Event::AfterRealloc {
                tid,
                clk,
                inst,
                ori_addr,
                size,
                new_addr,
            } => analyzer.after_realloc(*tid, *clk, inst, *ori_addr, *size, *new_addr),
            Event::BeforeFree {
                tid,
                clk,
                inst,
                addr,
            } => analyzer.before_free(*tid, *clk, inst, *addr),
            Event::ProgramExit => analyzer.program_exit(),
        }
    }
}
