/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Engine configuration and widely used option types.
//!
//! The long option names below are a stable contract shared with the
//! instrumentation driver and existing tooling; they keep their underscore
//! spelling rather than clap's kebab-case default.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use serde::Serialize;

/// Configuration options for the race detection engine.
#[derive(Debug, Serialize, Deserialize, Clone, Parser)]
pub struct Config {
    /// Destination for debug messages: "stdout", "stderr", or a file path.
    #[clap(long = "debug_out", default_value = "stdout", value_name = "path")]
    pub debug_out: String,

    /// Input path of the static info database.
    #[clap(long = "sinfo_in", default_value = "sinfo.db", value_name = "path")]
    pub sinfo_in: PathBuf,

    /// Output path of the static info database.
    #[clap(long = "sinfo_out", default_value = "sinfo.db", value_name = "path")]
    pub sinfo_out: PathBuf,

    /// Instrument only the statements named by the static profile, rather
    /// than the whole program.
    #[clap(long = "partial_instrument")]
    pub partial_instrument: bool,

    /// Potential race statement pairs generated by the static race detector.
    #[clap(long = "static_profile", value_name = "path")]
    pub static_profile: Option<PathBuf>,

    /// Sidecar listing of instrumented lines traversed from the static
    /// profile, one whitespace-delimited `file line` pair per line.
    #[clap(long = "instrumented_lines", value_name = "path")]
    pub instrumented_lines: Option<PathBuf>,

    /// Number of parallel detection worker threads. Zero runs every analyzer
    /// inline on the application threads.
    #[clap(
        long = "parallel_detector_number",
        default_value = "0",
        value_name = "uint"
    )]
    pub parallel_detector_number: usize,

    /// Number of parallel verification threads. Negative requests a single
    /// verification thread with no parallel history detection.
    #[clap(
        long = "parallel_verifier_number",
        default_value = "0",
        value_name = "int"
    )]
    pub parallel_verifier_number: i64,

    /// Enable the pure happens-before detector.
    #[clap(long = "enable_hb")]
    pub enable_hb: bool,

    /// Enable the Eraser lockset detector.
    #[clap(long = "enable_eraser")]
    pub enable_eraser: bool,

    /// Enable the hybrid happens-before + lockset detector.
    #[clap(long = "enable_hybrid")]
    pub enable_hybrid: bool,

    /// Enable the multi-lockset happens-before detector.
    #[clap(long = "enable_multilock_hb")]
    pub enable_multilock_hb: bool,

    /// Track potential racy instructions and flush them to the race database
    /// when a racy memory unit is freed.
    #[clap(long = "track_racy_inst")]
    pub track_racy_inst: bool,

    /// Ignore accesses coming from common libraries.
    #[clap(long = "ignore_lib")]
    pub ignore_lib: bool,

    /// Input path of the race database.
    #[clap(long = "race_in", default_value = "race.db", value_name = "path")]
    pub race_in: PathBuf,

    /// Output path of the race database.
    #[clap(long = "race_out", default_value = "race.db", value_name = "path")]
    pub race_out: PathBuf,

    /// Output path of the human-readable race report.
    #[clap(long = "race_report", default_value = "race.rp", value_name = "path")]
    pub race_report: PathBuf,

    /// Enable the active race verifier.
    #[clap(long = "race_verify")]
    pub race_verify: bool,

    /// Monitoring granularity in bytes. Every access is expanded to the
    /// covered units aligned to this size.
    #[clap(long = "unit_size_", default_value = "4", value_name = "bytes")]
    pub unit_size: u64,

    /// Seed for the verifier's random thread chooser.
    #[clap(long = "seed", default_value = "0", value_name = "uint64")]
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        // Defaults must match the clap attributes above.
        Config {
            debug_out: "stdout".to_string(),
            sinfo_in: PathBuf::from("sinfo.db"),
            sinfo_out: PathBuf::from("sinfo.db"),
            partial_instrument: false,
            static_profile: None,
            instrumented_lines: None,
            parallel_detector_number: 0,
            parallel_verifier_number: 0,
            enable_hb: false,
            enable_eraser: false,
            enable_hybrid: false,
            enable_multilock_hb: false,
            track_racy_inst: false,
            ignore_lib: false,
            race_in: PathBuf::from("race.db"),
            race_out: PathBuf::from("race.db"),
            race_report: PathBuf::from("race.rp"),
            race_verify: false,
            unit_size: 4,
            seed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_clap_defaults() {
        let parsed = Config::parse_from(["racecore"]);
        let built = Config::default();
        assert_eq!(format!("{:?}", parsed), format!("{:?}", built));
    }

    #[test]
    fn stable_option_names_accepted() {
        let cfg = Config::parse_from([
            "racecore",
            "--enable_multilock_hb",
            "--unit_size_",
            "8",
            "--race_verify",
            "--static_profile",
            "profile.txt",
        ]);
        assert!(cfg.enable_multilock_hb);
        assert!(cfg.race_verify);
        assert_eq!(cfg.unit_size, 8);
        assert_eq!(cfg.static_profile, Some(PathBuf::from("profile.txt")));
    }
}
