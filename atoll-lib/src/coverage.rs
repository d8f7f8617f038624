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

//! AFL-compatible branch-interest filter. A branch at `(pc, taken)` is
//! worth solving if its edge hits a count bucket nobody has seen before,
//! either globally (the virgin map, shared with previous runs through the
//! bitmap file) or under the current call-stack context.

use std::fs;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use crate::error::BackendError;
use crate::log;

/// Power-of-two number of edge slots, matching the AFL trace map layout.
pub const MAP_SIZE: usize = 65536;

/// Bucketizes a hit count the way AFL classifies counts: 1, 2, 3, 4-7,
/// 8-15, 16-31, 32-127, 128+ each get their own bit.
fn bucket(hits: u8) -> u8 {
    match hits {
        0 => 0,
        1 => 1 << 0,
        2 => 1 << 1,
        3 => 1 << 2,
        4..=7 => 1 << 3,
        8..=15 => 1 << 4,
        16..=31 => 1 << 5,
        32..=127 => 1 << 6,
        _ => 1 << 7,
    }
}

fn hash_branch(pc: u64, taken: bool) -> usize {
    let mut hasher = ahash::AHasher::default();
    pc.hash(&mut hasher);
    taken.hash(&mut hasher);
    hasher.finish() as usize & (MAP_SIZE - 1)
}

pub struct AflTraceMap {
    path: Option<PathBuf>,
    prev_loc: usize,
    trace: Vec<u8>,
    virgin: Vec<u8>,
    context: Vec<u8>,
}

impl AflTraceMap {
    /// Imports the virgin map from `path` if it exists; a missing or
    /// unconfigured bitmap starts all-virgin.
    pub fn new(path: Option<PathBuf>) -> Result<Self, BackendError> {
        let virgin = match &path {
            Some(path) if path.exists() => {
                let data = fs::read(path).map_err(|err| BackendError::BadBitmap(err.to_string()))?;
                if data.len() != MAP_SIZE {
                    return Err(BackendError::BadBitmap(format!(
                        "{}: expected {} bytes, got {}",
                        path.display(),
                        MAP_SIZE,
                        data.len()
                    )));
                }
                data
            }
            _ => vec![0; MAP_SIZE],
        };

        Ok(AflTraceMap { path, prev_loc: 0, trace: vec![0; MAP_SIZE], virgin, context: vec![0; MAP_SIZE] })
    }

    /// Decides whether the branch at `(pc, taken)` reveals new coverage,
    /// marking whatever it reveals as seen. `context_hash` is the current
    /// call-stack hash.
    pub fn is_interesting_branch(&mut self, pc: u64, taken: bool, context_hash: u32) -> bool {
        let cur_loc = hash_branch(pc, taken);
        let index = (self.prev_loc ^ cur_loc) & (MAP_SIZE - 1);
        self.prev_loc = cur_loc >> 1;

        self.trace[index] = self.trace[index].saturating_add(1);
        let bucket = bucket(self.trace[index]);

        let new_edge = self.virgin[index] & bucket == 0;
        if new_edge {
            self.virgin[index] |= bucket
        }

        let context_index = (index ^ context_hash as usize) & (MAP_SIZE - 1);
        let new_context = self.context[context_index] & bucket == 0;
        if new_context {
            self.context[context_index] |= bucket
        }

        let interesting = new_edge || new_context;
        if interesting {
            log!(
                log::COVERAGE,
                format!("new coverage at pc={:#x} taken={} edge={:#x} bucket={:#x}", pc, taken, index, bucket)
            );
        }
        interesting
    }

    /// Writes the virgin map back for the next run.
    pub fn commit(&self) {
        if let Some(path) = &self.path {
            if let Err(err) = fs::write(path, &self.virgin) {
                log!(log::COVERAGE, format!("failed to write bitmap {}: {}", path.display(), err));
            }
        }
    }
}

impl Drop for AflTraceMap {
    fn drop(&mut self) {
        self.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> AflTraceMap {
        AflTraceMap::new(None).unwrap()
    }

    #[test]
    fn first_hit_is_interesting() {
        let mut map = fresh();
        assert!(map.is_interesting_branch(0x4000, true, 0));
    }

    #[test]
    fn same_branch_same_context_saturates() {
        let mut map = fresh();
        let mut interesting = 0;
        for _ in 0..256 {
            if map.is_interesting_branch(0x4000, true, 7) {
                interesting += 1
            }
        }
        // The branch alternates between two edge slots (the history hash
        // settles after one step) and each slot has eight count buckets.
        assert!(interesting <= 16);
        assert!(!map.is_interesting_branch(0x4000, true, 7));
    }

    #[test]
    fn taken_direction_matters() {
        let mut map = fresh();
        let _ = map.is_interesting_branch(0x4000, true, 0);
        assert!(map.is_interesting_branch(0x4000, false, 0));
    }

    #[test]
    fn new_context_revives_known_edge() {
        let mut map = fresh();
        for _ in 0..256 {
            let _ = map.is_interesting_branch(0x4000, true, 1);
        }
        assert!(map.is_interesting_branch(0x4000, true, 2));
    }

    #[test]
    fn bitmap_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bitmap");
        {
            let mut map = AflTraceMap::new(Some(path.clone())).unwrap();
            let _ = map.is_interesting_branch(0x4000, true, 0);
            map.commit();
        }
        let data = fs::read(&path).unwrap();
        assert_eq!(data.len(), MAP_SIZE);
        assert!(data.iter().any(|&b| b != 0));
    }

    #[test]
    fn bad_bitmap_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bitmap");
        fs::write(&path, b"short").unwrap();
        assert!(AflTraceMap::new(Some(path)).is_err());
    }
}
