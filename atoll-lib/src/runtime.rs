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

//! The runtime facade handed to compiler-instrumented code. One [Engine]
//! exists per target process; every entry point takes `&Engine` and uses
//! interior mutability, since the instrumentation calls back synchronously
//! from a single thread.

use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use crate::callstack::CallStackManager;
use crate::concrete::BitVec;
use crate::config::Config;
use crate::error::BackendError;
use crate::expr::ExprRef;
use crate::expr_builder::{new_read_registry, pruning_chain, symbolic_chain, ExprBuilder, ReadRegistry};
use crate::fatal;
use crate::solver::Solver;

/// Query interface of the per-byte shadow memory maintained by the caller.
/// The shadow itself lives with the instrumentation glue; the engine only
/// asks which bytes of a concrete buffer are symbolic.
pub trait ShadowMemory {
    /// The expression shadowing the byte at `addr`, if that byte is
    /// symbolic.
    fn symbolic_byte(&self, addr: u64) -> Option<ExprRef>;

    /// The actual value of the byte at `addr`.
    fn concrete_byte(&self, addr: u64) -> u8;

    fn is_concrete(&self, addr: u64, length: usize) -> bool {
        (0..length).all(|i| self.symbolic_byte(addr + i as u64).is_none())
    }
}

pub struct Engine {
    inputs: Rc<Vec<u8>>,
    builder: Rc<dyn ExprBuilder>,
    reads: ReadRegistry,
    call_stack: Rc<RefCell<CallStackManager>>,
    solver: RefCell<Solver>,
}

impl Engine {
    /// Slurps the input file and wires up the builder pipeline, coverage
    /// filter and solver.
    pub fn new(config: Config) -> Result<Self, BackendError> {
        let data =
            fs::read(&config.input_file).map_err(|err| BackendError::BadInputFile(err.to_string()))?;
        let inputs = Rc::new(data);
        let reads = new_read_registry();
        let call_stack = Rc::new(RefCell::new(CallStackManager::new()));

        let builder: Rc<dyn ExprBuilder> = if config.pruning {
            pruning_chain(&reads, &call_stack, &inputs)
        } else {
            symbolic_chain(&reads)
        };

        let solver = Solver::new(inputs.clone(), builder.clone(), reads.clone(), call_stack.clone(), &config)?;

        Ok(Engine { inputs, builder, reads, call_stack, solver: RefCell::new(solver) })
    }

    pub fn from_env() -> Result<Self, BackendError> {
        Engine::new(Config::from_env()?)
    }

    /// The builder chain; `create_*` calls on it are the `build_<op>` entry
    /// points.
    pub fn builder(&self) -> &Rc<dyn ExprBuilder> {
        &self.builder
    }

    pub fn input(&self) -> &[u8] {
        &self.inputs
    }

    /// The memoized `Read` expression for one input byte.
    pub fn get_input_byte(&self, offset: usize) -> ExprRef {
        self.builder.create_read(offset)
    }

    pub fn push_path_constraint(&self, e: &ExprRef, taken: bool, pc: u64) {
        self.solver.borrow_mut().add_jcc(e, taken, pc)
    }

    /// Registers a memory access through a symbolic address.
    pub fn push_address_constraint(&self, e: &ExprRef, addr: u64) {
        self.solver.borrow_mut().add_addr(e, addr)
    }

    /// Pins `e` to its concretely observed value.
    pub fn push_value_constraint(&self, e: &ExprRef, value: u64) {
        let value = BitVec::from_u64(value, e.bits());
        self.solver.borrow_mut().add_value(e, value)
    }

    /// Enumerates alternative values of `e` (e.g. for indirect call
    /// targets), then pins the observed one.
    pub fn solve_all(&self, e: &ExprRef, value: u64) {
        let value = BitVec::from_u64(value, e.bits());
        self.solver.borrow_mut().solve_all(e, value)
    }

    pub fn notify_call(&self, pc: u64) {
        self.call_stack.borrow_mut().visit_call(pc)
    }

    pub fn notify_ret(&self, pc: u64) {
        self.call_stack.borrow_mut().visit_ret(pc)
    }

    pub fn notify_basic_block(&self, pc: u64) {
        self.call_stack.borrow_mut().visit_basic_block(pc)
    }

    /// A symbolic view of `length` bytes starting at `addr`, or `None` when
    /// the whole region is concrete and the caller should use the real
    /// bytes. Symbolic bytes come from the shadow, concrete ones become
    /// constants, and `little_endian` picks which end of the buffer is
    /// significant.
    pub fn read_memory(
        &self,
        shadow: &dyn ShadowMemory,
        addr: u64,
        length: usize,
        little_endian: bool,
    ) -> Option<ExprRef> {
        if length == 0 {
            fatal!("read_memory of a zero-length region");
        }
        if shadow.is_concrete(addr, length) {
            return None;
        }

        let mut result: Option<ExprRef> = None;
        for i in 0..length {
            let addr = addr + i as u64;
            let byte = shadow.symbolic_byte(addr).unwrap_or_else(|| {
                self.builder.create_constant(BitVec::from_u64(shadow.concrete_byte(addr) as u64, 8))
            });
            result = Some(match result {
                None => byte,
                Some(previous) => {
                    if little_endian {
                        self.builder.create_concat(&byte, &previous)
                    } else {
                        self.builder.create_concat(&previous, &byte)
                    }
                }
            });
        }
        result
    }

    pub fn generated_testcases(&self) -> u32 {
        self.solver.borrow().num_generated()
    }

    /// Extent of the read registry: the highest input byte touched so far
    /// plus one.
    pub fn known_reads(&self) -> usize {
        self.reads.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Kind;
    use std::collections::HashMap;
    use std::rc::Rc;

    fn engine(input: &[u8]) -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let input_file = dir.path().join("input");
        fs::write(&input_file, input).unwrap();
        let config = Config::new(input_file, dir.path().join("out"));
        (Engine::new(config).unwrap(), dir)
    }

    struct FakeShadow {
        symbolic: HashMap<u64, ExprRef>,
        memory: Vec<u8>,
    }

    impl ShadowMemory for FakeShadow {
        fn symbolic_byte(&self, addr: u64) -> Option<ExprRef> {
            self.symbolic.get(&addr).cloned()
        }

        fn concrete_byte(&self, addr: u64) -> u8 {
            self.memory[addr as usize]
        }
    }

    #[test]
    fn input_bytes_are_memoized() {
        let (engine, _dir) = engine(&[1, 2, 3]);
        let a = engine.get_input_byte(1);
        let b = engine.get_input_byte(1);
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(engine.known_reads(), 2);
    }

    #[test]
    fn concrete_regions_read_as_none() {
        let (engine, _dir) = engine(&[0; 4]);
        let shadow = FakeShadow { symbolic: HashMap::new(), memory: vec![0xaa; 8] };
        assert!(engine.read_memory(&shadow, 0, 8, true).is_none());
    }

    #[test]
    fn mixed_regions_concatenate_in_address_order() {
        let (engine, _dir) = engine(&[0x11, 0x22]);
        let mut symbolic = HashMap::new();
        symbolic.insert(1u64, engine.get_input_byte(0));
        let shadow = FakeShadow { symbolic, memory: vec![0xaa, 0xbb, 0xcc, 0xdd] };

        let le = engine.read_memory(&shadow, 0, 2, true).unwrap();
        assert_eq!(le.kind(), Kind::Concat);
        assert_eq!(le.bits(), 16);
        // Little endian: the higher address is the significant half.
        assert_eq!(le.left().kind(), Kind::Read);
        assert_eq!(le.right().value().map(|v| v.limited_value()), Some(0xaa));

        let be = engine.read_memory(&shadow, 0, 2, false).unwrap();
        assert_eq!(be.right().kind(), Kind::Read);
    }

    #[test]
    fn path_constraints_generate_testcases() {
        let (engine, dir) = engine(&[0x00, 0x00]);
        let b = engine.builder().clone();
        let x = engine.get_input_byte(0);
        let c = b.create_constant_u64(0x41, 8);
        let cond = b.create_equal(&x, &c);
        engine.push_path_constraint(&cond, false, 0x1000);
        assert_eq!(engine.generated_testcases(), 1);
        let testcase = fs::read(dir.path().join("out").join("000000")).unwrap();
        assert_eq!(testcase, vec![0x41, 0x00]);
    }
}
