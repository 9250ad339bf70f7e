/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Module contains macroses that keep race-engine log entries greppable under
//! one prefix.
//! ['racelog'] can be used to write a race-engine log entry at INFO level
//! ['racelog_debug] can be use to write a race-engine log entry at DEBUG level

/// Macro used to encapsulate tracing of race-engine decisions: race reports,
/// scheduler choices, and random draws. This is currently at the INFO log
/// level.
#[macro_export]
macro_rules! racelog {
    ($($arg:tt)+) => {{
        tracing::info!("RACELOG {}", format!($($arg)+));
    }};
}

/// Macro used to encapsulate tracing of race-engine decisions.
/// This variant is at a higher log level and requires that logging verbosity
/// is set to DEBUG.
#[macro_export]
macro_rules! racelog_debug {
    ($($arg:tt)+) => {{
        tracing::debug!("RACELOG {}", format!($($arg)+));
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_racelog() {
        racelog!("Hello : {}. From {:?}", "World", 31337);
    }
}
