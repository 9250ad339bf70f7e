/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The parallel-detection worker pool.
//!
//! Each worker owns a private event deque guarded by its own lock, and
//! memory events are routed to the worker selected by hashing the accessed
//! address: all events for one address land on one worker in FIFO order,
//! which is the serial-order requirement the analyzers have per address.
//!
//! Synchronization and lifecycle events are NOT queued. They mutate shared
//! clock state exactly once and must land before any later access is even
//! enqueued (a worker must never see an access from a thread whose start it
//! has not observed), so the engine processes them inline on the
//! application thread.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use tracing::debug;
use tracing::info;

use crate::analyzer::Analyzer;
use crate::events::Event;

#[derive(Debug, Default)]
struct QueueState {
    deque: VecDeque<Event>,
    shutdown: bool,
}

/// One worker's single-producer view: a deque plus its wakeup condvar.
#[derive(Debug, Default)]
struct EventQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl EventQueue {
    fn push(&self, event: Event) {
        let mut st = self.state.lock().unwrap();
        st.deque.push_back(event);
        self.cond.notify_one();
    }

    /// Pop the next event in FIFO order, or None once drained and shut
    /// down.
    fn pop(&self) -> Option<Event> {
        let mut st = self.state.lock().unwrap();
        loop {
            if let Some(event) = st.deque.pop_front() {
                return Some(event);
            }
            if st.shutdown {
                return None;
            }
            st = self.cond.wait(st).unwrap();
        }
    }

    fn begin_shutdown(&self) {
        let mut st = self.state.lock().unwrap();
        st.shutdown = true;
        self.cond.notify_one();
    }
}

struct Worker {
    queue: Arc<EventQueue>,
    handle: JoinHandle<()>,
}

/// A fixed pool of detection workers consuming the sharded access stream.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawn `count` workers, each replaying its deque against every
    /// analyzer. Failure to spawn is fatal: detection cannot silently drop
    /// a worker's share of the stream.
    pub fn spawn(count: usize, analyzers: Vec<Arc<dyn Analyzer>>) -> Self {
        assert!(count > 0);
        let mut workers = Vec::with_capacity(count);
        for idx in 0..count {
            let queue = Arc::new(EventQueue::default());
            let worker_queue = queue.clone();
            let worker_analyzers = analyzers.clone();
            let handle = thread::Builder::new()
                .name(format!("race-detector-{}", idx))
                .spawn(move || {
                    debug!("[worker {}] detection worker running", idx);
                    while let Some(event) = worker_queue.pop() {
                        for analyzer in worker_analyzers.iter() {
                            event.dispatch(analyzer.as_ref());
                        }
                    }
                    debug!("[worker {}] detection worker drained, exiting", idx);
                })
                .unwrap_or_else(|e| panic!("cannot spawn detection worker {}: {}", idx, e));
            workers.push(Worker { queue, handle });
        }
        info!("[workers] spawned {} detection worker(s)", count);
        WorkerPool { workers }
    }

    /// Number of workers in the pool.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// True when the pool has no workers. (Never, by construction.)
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Enqueue one memory event onto the deque of the worker its address
    /// hashes to. Returns false for non-memory events, which the caller
    /// must process inline instead.
    pub fn dispatch_memory(&self, event: Event) -> bool {
        match event.memory_addr() {
            Some(addr) => {
                let idx = (addr as usize) % self.workers.len();
                self.workers[idx].queue.push(event);
                true
            }
            None => false,
        }
    }

    /// Drain every deque and join the workers. A worker that panicked
    /// aborts the run.
    pub fn shutdown(self) {
        for worker in self.workers.iter() {
            worker.queue.begin_shutdown();
        }
        for worker in self.workers {
            if worker.handle.join().is_err() {
                panic!("a detection worker exited abnormally");
            }
        }
        info!("[workers] all detection workers joined");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;

    use racecore_model::tid::ThreadId;

    use super::*;
    use crate::sinfo::StaticInfo;

    #[derive(Debug, Default)]
    struct CountingAnalyzer {
        reads: AtomicU64,
    }

    impl Analyzer for CountingAnalyzer {
        fn before_mem_read(
            &self,
            _tid: ThreadId,
            _clk: u64,
            _inst: &crate::sinfo::InstRef,
            _addr: u64,
            _size: u64,
        ) {
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn memory_events_are_sharded_and_drained() {
        let sinfo = StaticInfo::new();
        let inst = sinfo.ensure_inst("app", 0x1, None, None);
        let counter = Arc::new(CountingAnalyzer::default());
        let pool = WorkerPool::spawn(3, vec![counter.clone()]);
        assert_eq!(pool.len(), 3);

        // Non-memory events are refused: the caller handles them inline.
        assert!(!pool.dispatch_memory(Event::ThreadStart {
            tid: ThreadId::from_raw(1),
            parent: ThreadId::INVALID,
        }));
        // Each memory event reaches exactly one worker.
        for i in 0..10u64 {
            assert!(pool.dispatch_memory(Event::MemRead {
                tid: ThreadId::from_raw(1),
                clk: 0,
                inst: inst.clone(),
                addr: 0x1000 + i * 4,
                size: 4,
            }));
        }
        pool.shutdown();

        assert_eq!(counter.reads.load(Ordering::SeqCst), 10);
    }
}
