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

//! Whole-pipeline scenarios: instrumented-style callbacks in, testcase
//! files out.

use std::fs;
use std::path::PathBuf;

use atoll_lib::config::Config;
use atoll_lib::runtime::Engine;

struct Session {
    engine: Engine,
    out_dir: PathBuf,
    _dir: tempfile::TempDir,
}

fn session(input: &[u8]) -> Session {
    let dir = tempfile::tempdir().unwrap();
    let input_file = dir.path().join("input");
    fs::write(&input_file, input).unwrap();
    let out_dir = dir.path().join("out");
    let engine = Engine::new(Config::new(input_file, out_dir.clone())).unwrap();
    Session { engine, out_dir, _dir: dir }
}

impl Session {
    fn testcase(&self, seq: u32) -> Vec<u8> {
        fs::read(self.out_dir.join(format!("{:06}", seq))).unwrap()
    }

    fn optimistic_testcase(&self, seq: u32) -> Vec<u8> {
        fs::read(self.out_dir.join(format!("{:06}-optimistic", seq))).unwrap()
    }
}

#[test]
fn negating_an_additive_branch_solves_both_bytes() {
    let s = session(&[0x00, 0x00, 0x7f]);
    let b = s.engine.builder().clone();

    let sum = b.create_add(&s.engine.get_input_byte(0), &s.engine.get_input_byte(1));
    let target = b.create_constant_u64(0x80, 8);
    let cond = b.create_equal(&sum, &target);

    // The branch was not taken concretely; ask for an input taking it.
    s.engine.push_path_constraint(&cond, false, 0x1000);
    assert_eq!(s.engine.generated_testcases(), 1);

    let testcase = s.testcase(0);
    assert_eq!(testcase.len(), 3);
    assert_eq!((testcase[0] as u16 + testcase[1] as u16) % 256, 0x80);
    // Bytes the branch does not depend on keep their input value.
    assert_eq!(testcase[2], 0x7f);
}

#[test]
fn range_constraints_restrict_later_models() {
    let s = session(&[0x07]);
    let b = s.engine.builder().clone();
    let x = s.engine.get_input_byte(0);

    let c10 = b.create_constant_u64(0x10, 8);
    let c05 = b.create_constant_u64(0x05, 8);
    s.engine.push_path_constraint(&b.create_ult(&x, &c10), true, 0x1000);
    s.engine.push_path_constraint(&b.create_uge(&x, &c05), true, 0x2000);

    // The accumulated unsigned window is [0x05, 0x0f].
    {
        let slot = x.range_set(true).borrow();
        let rs = slot.as_ref().unwrap();
        let intervals: Vec<_> = rs.iter().collect();
        assert_eq!(intervals.len(), 1);
        let (from, to) = &intervals[0];
        assert_eq!(from.limited_value(), 0x05);
        assert_eq!(to.limited_value(), 0x0f);
    }

    // A later negation has to respect the window.
    let seq = s.engine.generated_testcases();
    let c07 = b.create_constant_u64(0x07, 8);
    s.engine.push_path_constraint(&b.create_equal(&x, &c07), true, 0x3000);
    assert!(s.engine.generated_testcases() > seq);

    let testcase = s.testcase(seq);
    assert!((0x05..=0x0f).contains(&testcase[0]));
    assert_ne!(testcase[0], 0x07);
}

#[test]
fn bridged_dependencies_sync_into_one_query() {
    let s = session(&[0x01, 0x02]);
    let b = s.engine.builder().clone();
    let x = s.engine.get_input_byte(0);
    let y = s.engine.get_input_byte(1);

    let one = b.create_constant_u64(1, 8);
    let two = b.create_constant_u64(2, 8);
    let three = b.create_constant_u64(3, 8);
    let nine = b.create_constant_u64(9, 8);

    s.engine.push_path_constraint(&b.create_equal(&x, &one), true, 0x1000);
    s.engine.push_path_constraint(&b.create_equal(&y, &two), true, 0x2000);
    // Bridges the two dependency trees.
    let sum = b.create_add(&x, &y);
    s.engine.push_path_constraint(&b.create_equal(&sum, &three), true, 0x3000);

    // Asking for x == 9 contradicts the recorded x == 1, so only the
    // optimistic retry can produce a testcase. Byte 1 is synced from the
    // same (merged) tree and stays at its concrete value.
    let seq = s.engine.generated_testcases();
    s.engine.push_path_constraint(&b.create_equal(&x, &nine), false, 0x4000);
    let optimistic = s.optimistic_testcase(seq);
    assert_eq!(optimistic[0], 9);
    assert_eq!(optimistic[1], 2);
}

#[test]
fn untouched_bytes_survive_into_testcases() {
    let s = session(&[0x00, 0x00, 0x00, 0x00]);
    let b = s.engine.builder().clone();
    let r0 = s.engine.get_input_byte(0);
    let r2 = s.engine.get_input_byte(2);

    let c41 = b.create_constant_u64(0x41, 8);
    let c42 = b.create_constant_u64(0x42, 8);
    s.engine.push_path_constraint(&b.create_equal(&r0, &c41), true, 0x1000);
    s.engine.push_path_constraint(&b.create_equal(&r2, &c42), true, 0x2000);

    // Take the first branch the other way; the model may only touch bytes
    // 0 and 2, and byte 0 must match it.
    let seq = s.engine.generated_testcases();
    s.engine.push_path_constraint(&b.create_equal(&r0, &c41), false, 0x3000);
    let testcase = s.testcase(seq);
    assert_eq!(testcase[0], 0x41);
    assert_eq!(testcase[1], 0x00);
    assert_eq!(testcase[3], 0x00);
}

#[test]
fn repeated_branches_stop_driving_the_solver() {
    let s = session(&[0x41]);
    let b = s.engine.builder().clone();
    let x = s.engine.get_input_byte(0);
    let c = b.create_constant_u64(0x41, 8);

    for _ in 0..300 {
        let cond = b.create_equal(&x, &c);
        s.engine.push_path_constraint(&cond, true, 0x1000);
    }
    let saturated = s.engine.generated_testcases();

    for _ in 0..50 {
        let cond = b.create_equal(&x, &c);
        s.engine.push_path_constraint(&cond, true, 0x1000);
    }
    // Coverage is saturated: no further branch reaches the solver.
    assert_eq!(s.engine.generated_testcases(), saturated);
}

#[test]
fn concrete_shadow_of_an_extended_read() {
    let s = session(&[0x41]);
    let b = s.engine.builder().clone();
    let x = s.engine.get_input_byte(0);
    let wide = b.create_zext(&x, 16);
    let sum = b.create_add(&wide, &b.create_constant_u64(0x0001, 16));
    let value = sum.evaluate(s.engine.input());
    assert_eq!(value.value().map(|v| v.limited_value()), Some(0x0042));
    assert_eq!(value.bits(), 16);
}
