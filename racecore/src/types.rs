/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Widely-shared type definitions.

pub use racecore_model::clock::Timestamp;
pub use racecore_model::clock::VectorClock;
pub use racecore_model::config::Config;
pub use racecore_model::lockset::LockId;
pub use racecore_model::lockset::LockSet;
pub use racecore_model::tid::ThreadId;
pub use racecore_model::Address;
