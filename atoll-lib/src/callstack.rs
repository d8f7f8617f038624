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

//! Tracks the dynamic call stack of the instrumented target and a rolling
//! hash over it. The prune stage asks, per created expression, whether the
//! current `(call stack, basic block)` context has produced anything new;
//! contexts that keep hashing into already-hit bitmap slots are treated as
//! uninteresting and their expressions are concretized.

use std::hash::{Hash, Hasher};

const BITMAP_SIZE: usize = 65536;

pub struct CallStackManager {
    call_stack: Vec<u64>,
    stack_hash: u32,
    bitmap: Vec<u16>,
    is_interesting: bool,
    pending: bool,
    last_pc: u64,
}

impl Default for CallStackManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStackManager {
    pub fn new() -> Self {
        CallStackManager {
            call_stack: Vec::new(),
            stack_hash: 0,
            bitmap: vec![0; BITMAP_SIZE],
            // Everything is interesting until the first context repeats.
            is_interesting: true,
            pending: false,
            last_pc: 0,
        }
    }

    pub fn visit_call(&mut self, pc: u64) {
        self.call_stack.push(pc);
        self.compute_hash()
    }

    /// Unwinds to the matching call site. Frames skipped over by longjmp-style
    /// control flow are discarded; an unmatched return leaves the stack as is.
    pub fn visit_ret(&mut self, pc: u64) {
        if let Some(pos) = self.call_stack.iter().rposition(|&call_pc| call_pc == pc) {
            self.call_stack.truncate(pos);
            self.compute_hash()
        }
    }

    pub fn visit_basic_block(&mut self, pc: u64) {
        self.last_pc = pc;
        self.pending = true
    }

    /// Folds the pending `(stack hash, basic block)` pair into the hit
    /// bitmap. Called once per created expression, before the prune stage
    /// reads [CallStackManager::is_interesting].
    pub fn update_bitmap(&mut self) {
        if self.pending {
            self.pending = false;
            let index = self.context_index();
            self.is_interesting = self.bitmap[index] == 0;
            self.bitmap[index] = self.bitmap[index].saturating_add(1)
        }
    }

    pub fn is_interesting(&self) -> bool {
        self.is_interesting
    }

    pub fn hash(&self) -> u32 {
        self.stack_hash
    }

    fn context_index(&self) -> usize {
        let mut hasher = ahash::AHasher::default();
        self.stack_hash.hash(&mut hasher);
        self.last_pc.hash(&mut hasher);
        hasher.finish() as usize % BITMAP_SIZE
    }

    fn compute_hash(&mut self) {
        let mut hasher = ahash::AHasher::default();
        self.call_stack.hash(&mut hasher);
        self.stack_hash = hasher.finish() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_follows_stack() {
        let mut cs = CallStackManager::new();
        let empty = cs.hash();
        cs.visit_call(0x1000);
        let one = cs.hash();
        assert_ne!(empty, one);
        cs.visit_call(0x2000);
        cs.visit_ret(0x2000);
        assert_eq!(cs.hash(), one);
        cs.visit_ret(0x1000);
        assert_eq!(cs.hash(), empty);
    }

    #[test]
    fn ret_unwinds_skipped_frames() {
        let mut cs = CallStackManager::new();
        cs.visit_call(0x1000);
        let one = cs.hash();
        cs.visit_call(0x2000);
        cs.visit_call(0x3000);
        cs.visit_ret(0x2000);
        assert_eq!(cs.hash(), one);
    }

    #[test]
    fn repeated_context_becomes_uninteresting() {
        let mut cs = CallStackManager::new();
        cs.visit_call(0x1000);
        cs.visit_basic_block(0x2000);
        cs.update_bitmap();
        assert!(cs.is_interesting());
        cs.visit_basic_block(0x2000);
        cs.update_bitmap();
        assert!(!cs.is_interesting());
        // A new block in the same frame is interesting again.
        cs.visit_basic_block(0x2040);
        cs.update_bitmap();
        assert!(cs.is_interesting());
    }

    #[test]
    fn flag_is_sticky_between_updates() {
        let mut cs = CallStackManager::new();
        cs.visit_basic_block(0x2000);
        cs.update_bitmap();
        assert!(cs.is_interesting());
        // No new pending block: the flag keeps its value.
        cs.update_bitmap();
        assert!(cs.is_interesting());
    }
}
