/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Racecore is a dynamic data-race detection and verification engine for
//! multithreaded native programs.
//!
//! An external instrumentation runtime observes the program's memory
//! accesses and synchronization events and feeds them, in per-thread
//! program order, into a [`engine::RaceEngine`]. The engine fans the
//! stream out to a family of online analyzers (happens-before, lockset,
//! hybrid, and multi-lockset happens-before) that report unordered
//! conflicting accesses into a deduplicating race database, and to an
//! active verifier that perturbs the schedule to prove candidate race
//! pairs from a prior profile.

pub mod analyzer;
pub mod detector;
pub mod engine;
pub mod events;
pub mod pstmt;
pub mod race_db;
pub mod racelog;
pub mod region_filter;
pub mod sem;
pub mod sinfo;
pub mod types;
pub mod verifier;
pub mod workers;

pub use analyzer::Analyzer;
pub use analyzer::Subscription;
pub use detector::eraser::Eraser;
pub use detector::hb::HappensBefore;
pub use detector::hybrid::Hybrid;
pub use detector::multilock_hb::MultiLockHb;
pub use detector::Detector;
pub use engine::RaceEngine;
pub use events::AccessKind;
pub use events::Event;
pub use pstmt::PRaceDB;
pub use pstmt::PStmt;
pub use race_db::RaceDB;
pub use race_db::RaceReport;
pub use sinfo::InstRef;
pub use sinfo::StaticInfo;
pub use types::*;
pub use verifier::Verifier;
