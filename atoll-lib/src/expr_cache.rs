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

//! Structural de-duplication of expression nodes. The cache keys weak
//! references by shallow equality, so a freshly built node that looks like a
//! live cached one collapses to the cached reference and shared
//! subexpressions stay shared. Holding only weak references means the cache
//! never extends a node's lifetime; expired entries are reaped lazily.

use std::collections::{HashMap, VecDeque};
use std::rc::Weak;

use crate::expr::{equal_shallow, ExprRef, WeakExprRef};

pub const CACHE_SIZE: usize = 1024;

pub struct ExprCache {
    limit: usize,
    buckets: HashMap<u32, Vec<WeakExprRef>, ahash::RandomState>,
    // Insertion order, oldest first, for bounded shrinking.
    queue: VecDeque<(u32, WeakExprRef)>,
}

impl Default for ExprCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ExprCache {
    pub fn new() -> Self {
        ExprCache { limit: CACHE_SIZE, buckets: HashMap::default(), queue: VecDeque::new() }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Any live cached node shallowly equal to `e`.
    pub fn find(&mut self, e: &ExprRef) -> Option<ExprRef> {
        let bucket = self.buckets.get_mut(&e.hash())?;
        bucket.retain(|entry| entry.strong_count() > 0);
        bucket.iter().filter_map(Weak::upgrade).find(|cached| equal_shallow(cached, e))
    }

    pub fn insert(&mut self, e: &ExprRef) {
        let hash = e.hash();
        self.buckets.entry(hash).or_default().push(ExprRef::downgrade(e));
        self.queue.push_back((hash, ExprRef::downgrade(e)));
        if self.queue.len() > self.limit {
            self.shrink()
        }
    }

    /// Demotes the oldest entries until the cache is back under its limit.
    fn shrink(&mut self) {
        while self.queue.len() > self.limit {
            let (hash, oldest) = self.queue.pop_front().unwrap();
            if let Some(bucket) = self.buckets.get_mut(&hash) {
                bucket.retain(|entry| entry.strong_count() > 0 && !Weak::ptr_eq(entry, &oldest));
                if bucket.is_empty() {
                    self.buckets.remove(&hash);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concrete::BitVec;
    use crate::expr::{Expr, Kind, Payload};
    use std::rc::Rc;

    fn read(index: usize) -> ExprRef {
        Rc::new(Expr::new(Kind::Read, 8, vec![], Payload::Read(index)))
    }

    fn add(l: &ExprRef, r: &ExprRef) -> ExprRef {
        Rc::new(Expr::new(Kind::Add, 8, vec![l.clone(), r.clone()], Payload::None))
    }

    #[test]
    fn shallow_duplicates_collapse() {
        let mut cache = ExprCache::new();
        let r0 = read(0);
        let r1 = read(1);
        let first = add(&r0, &r1);
        cache.insert(&first);
        let second = add(&r0, &r1);
        let found = cache.find(&second).unwrap();
        assert!(Rc::ptr_eq(&found, &first));
    }

    #[test]
    fn dead_entries_are_not_returned() {
        let mut cache = ExprCache::new();
        let r0 = read(0);
        let r1 = read(1);
        cache.insert(&add(&r0, &r1)); // dropped immediately
        assert!(cache.find(&add(&r0, &r1)).is_none());
    }

    #[test]
    fn cache_does_not_keep_nodes_alive() {
        let mut cache = ExprCache::new();
        let r0 = read(0);
        let e = add(&r0, &r0);
        let weak = Rc::downgrade(&e);
        cache.insert(&e);
        drop(e);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn shrinks_past_the_limit() {
        let mut cache = ExprCache::new();
        let mut live = Vec::new();
        for i in 0..(CACHE_SIZE + 16) {
            let c = Rc::new(Expr::new(
                Kind::Constant,
                32,
                vec![],
                Payload::Constant(BitVec::from_u64(i as u64, 32)),
            ));
            cache.insert(&c);
            live.push(c);
        }
        assert!(cache.len() <= CACHE_SIZE);
        // The newest entries survive.
        assert!(cache.find(live.last().unwrap()).is_some());
    }
}
