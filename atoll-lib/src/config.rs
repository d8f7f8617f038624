// BSD 2-Clause License
//
// Copyright (c) 2022, 2023 The atoll developers
//
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
// 1. Redistributions of source code must retain the above copyright
// notice, this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright
// notice, this list of conditions and the following disclaimer in the
// documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Runtime configuration. The backend is loaded into an instrumented target
//! process, so everything is picked up from the environment rather than from
//! command line arguments.

use std::env;
use std::path::PathBuf;

use crate::error::BackendError;
use crate::log;

/// Default solver timeout in milliseconds.
pub const DEFAULT_SOLVER_TIMEOUT_MS: u32 = 10_000;

#[derive(Clone, Debug)]
pub struct Config {
    /// File holding the concrete input the target is being run on.
    pub input_file: PathBuf,
    /// Directory new testcases are written to.
    pub output_dir: PathBuf,
    /// CSV file appended to after each emitted testcase.
    pub stats_file: PathBuf,
    /// AFL-style coverage bitmap, shared with previous runs. `None` starts
    /// with an all-virgin map and skips the write-back.
    pub bitmap_file: Option<PathBuf>,
    pub solver_timeout_ms: u32,
    /// Enable the prune stage of the builder pipeline.
    pub pruning: bool,
}

impl Config {
    pub fn new(input_file: PathBuf, output_dir: PathBuf) -> Self {
        let stats_file = output_dir.join("stats.csv");
        Config {
            input_file,
            output_dir,
            stats_file,
            bitmap_file: None,
            solver_timeout_ms: DEFAULT_SOLVER_TIMEOUT_MS,
            pruning: false,
        }
    }

    /// Reads `ATOLL_INPUT`, `ATOLL_OUTPUT_DIR`, `ATOLL_STATS_FILE`,
    /// `ATOLL_BITMAP`, `ATOLL_SOLVER_TIMEOUT_MS`, `ATOLL_PRUNING` and
    /// `ATOLL_LOG`. The first two are required.
    pub fn from_env() -> Result<Self, BackendError> {
        let input_file = PathBuf::from(
            env::var("ATOLL_INPUT").map_err(|_| BackendError::Config("ATOLL_INPUT is not set".to_string()))?,
        );
        let output_dir = PathBuf::from(
            env::var("ATOLL_OUTPUT_DIR")
                .map_err(|_| BackendError::Config("ATOLL_OUTPUT_DIR is not set".to_string()))?,
        );

        let mut config = Config::new(input_file, output_dir);

        if let Ok(stats) = env::var("ATOLL_STATS_FILE") {
            config.stats_file = PathBuf::from(stats)
        }
        if let Ok(bitmap) = env::var("ATOLL_BITMAP") {
            config.bitmap_file = Some(PathBuf::from(bitmap))
        }
        if let Ok(timeout) = env::var("ATOLL_SOLVER_TIMEOUT_MS") {
            config.solver_timeout_ms = timeout
                .parse()
                .map_err(|_| BackendError::Config(format!("bad ATOLL_SOLVER_TIMEOUT_MS: {}", timeout)))?
        }
        if let Ok(pruning) = env::var("ATOLL_PRUNING") {
            config.pruning = pruning == "1" || pruning == "true"
        }
        if let Ok(flags) = env::var("ATOLL_LOG") {
            log::set_flags(parse_log_flags(&flags))
        }

        Ok(config)
    }
}

fn parse_log_flags(names: &str) -> u32 {
    let mut flags = 0u32;
    for name in names.split(',') {
        flags |= match name.trim() {
            "verbose" => log::VERBOSE,
            "expr" => log::EXPR,
            "solver" => log::SOLVER,
            "sync" => log::SYNC,
            "testcase" => log::TESTCASE,
            "coverage" => log::COVERAGE,
            "all" => u32::MAX,
            _ => 0,
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_flag_parsing() {
        assert_eq!(parse_log_flags("solver,sync"), log::SOLVER | log::SYNC);
        assert_eq!(parse_log_flags("nonsense"), 0);
        assert_eq!(parse_log_flags("all") & log::TESTCASE, log::TESTCASE);
    }
}
