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

//! The solving coordinator. Branch notifications arrive here; the driver
//! consults the coverage filter, negates interesting branches against the
//! relevant slice of the constraint store, and turns models into new
//! testcase files. Constraints themselves are recorded in the dependency
//! forest, range-friendly ones folded into per-expression interval sets.

use std::cell::RefCell;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::callstack::CallStackManager;
use crate::concrete::BitVec;
use crate::config::Config;
use crate::coverage::AflTraceMap;
use crate::dependency::DependencyForest;
use crate::error::BackendError;
use crate::expr::{is_relational, negate_kind, swap_kind, Expr, ExprRef, Kind};
use crate::expr_builder::{ExprBuilder, ReadRegistry};
use crate::smt::{self, Ast, SmtResult, SmtSolver};
use crate::{fatal, log};

/// A comparison between one symbolic and one constant operand, the shape
/// the range engine understands.
fn is_const_sym(e: &ExprRef) -> bool {
    e.kind().is_compare()
        && (e.left().is_constant() != e.right().is_constant())
        && !e.left().is_bool()
        && !e.right().is_bool()
}

/// Orients a constant/symbolic comparison so the symbolic operand comes
/// first, mirroring the comparison if the operands swap.
fn parse_const_sym(e: &ExprRef) -> (Kind, ExprRef, ExprRef) {
    for i in 0..2 {
        let sym = e.child(i);
        let constant = e.child(1 - i);
        if !sym.is_constant() && constant.is_constant() {
            let kind = if i == 0 { e.kind() } else { swap_kind(e.kind()) };
            return (kind, sym.clone(), constant.clone());
        }
    }
    fatal!("parse_const_sym on {}", e)
}

pub struct Solver {
    inputs: Rc<Vec<u8>>,
    out_dir: PathBuf,
    stats_file: PathBuf,
    builder: Rc<dyn ExprBuilder>,
    reads: ReadRegistry,
    smt: SmtSolver,
    trace: AflTraceMap,
    call_stack: Rc<RefCell<CallStackManager>>,
    dep_forest: DependencyForest<Expr>,
    last_interesting: bool,
    last_pc: u64,
    num_generated: u32,

    solver_check_time: Duration,
    sync_time: Duration,
    skipped_constraints: u32,
    added_constraints: u32,
    symbolic_variables: u32,
    concrete_variables: u32,
}

impl Solver {
    pub fn new(
        inputs: Rc<Vec<u8>>,
        builder: Rc<dyn ExprBuilder>,
        reads: ReadRegistry,
        call_stack: Rc<RefCell<CallStackManager>>,
        config: &Config,
    ) -> Result<Self, BackendError> {
        fs::create_dir_all(&config.output_dir)
            .map_err(|err| BackendError::Config(format!("cannot create output dir: {}", err)))?;
        let capacity = inputs.len() + 1;
        Ok(Solver {
            inputs,
            out_dir: config.output_dir.clone(),
            stats_file: config.stats_file.clone(),
            builder,
            reads,
            smt: SmtSolver::new(config.solver_timeout_ms),
            trace: AflTraceMap::new(config.bitmap_file.clone())?,
            call_stack,
            dep_forest: DependencyForest::new(capacity),
            last_interesting: false,
            last_pc: 0,
            num_generated: 0,
            solver_check_time: Duration::ZERO,
            sync_time: Duration::ZERO,
            skipped_constraints: 0,
            added_constraints: 0,
            symbolic_variables: 0,
            concrete_variables: 0,
        })
    }

    pub fn last_pc(&self) -> u64 {
        self.last_pc
    }

    pub fn num_generated(&self) -> u32 {
        self.num_generated
    }

    /// Records the path constraint for a conditional jump and, if the
    /// branch is interesting, asks the solver for an input taking the other
    /// side. A `pc` of zero marks a synthetic branch that inherits the last
    /// real branch's interestingness.
    pub fn add_jcc(&mut self, e: &ExprRef, taken: bool, pc: u64) {
        self.last_pc = pc;
        log!(log::SOLVER, format!("add_jcc pc={:#x} taken={} {}", pc, taken, e));

        if e.kind() == Kind::Bool {
            if e.bool_value() != Some(taken) {
                fatal!("concrete branch condition disagrees with the taken direction");
            }
            return;
        }

        if !is_relational(e) {
            fatal!("non-relational branch condition {}", e);
        }

        let interesting = if pc == 0 {
            self.last_interesting
        } else {
            let hash = self.call_stack.borrow().hash();
            let interesting = self.trace.is_interesting_branch(pc, taken, hash);
            self.last_interesting = interesting;
            interesting
        };

        if interesting {
            self.negate_path(e, taken);
        }
        self.add_constraint(e, taken)
    }

    /// Probes the minimum and maximum feasible values of a symbolic memory
    /// address in an interesting context, then pins the address to its
    /// concrete value.
    pub fn add_addr(&mut self, e: &ExprRef, addr: u64) {
        if e.is_concrete() {
            return;
        }
        if self.last_interesting {
            self.reset();
            self.sync_constraints(e);
            if self.check() != SmtResult::Sat {
                return;
            }
            let ast = smt::to_smt(e, &self.inputs);
            if let Some(min) = self.min_value(&ast) {
                self.solve_one(ast.mk_eq(&min));
            }
            if let Some(max) = self.max_value(&ast) {
                self.solve_one(ast.mk_eq(&max));
            }
        }
        self.add_value(e, BitVec::from_u64(addr, e.bits()))
    }

    /// Pins a symbolic expression to its concretely observed value.
    pub fn add_value(&mut self, e: &ExprRef, value: BitVec) {
        if e.is_concrete() {
            return;
        }
        let value = self.builder.create_constant(value);
        let pinned = self.builder.create_binary_expr(Kind::Equal, e, &value);
        self.add_constraint(&pinned, true)
    }

    /// Enumerates feasible values of `e` other than the observed one,
    /// emitting a testcase for each until the store is exhausted.
    pub fn solve_all(&mut self, e: &ExprRef, value: BitVec) {
        if self.last_interesting {
            let mut postfix = "";
            let observed = self.builder.create_constant(value.clone());
            let pinned = self.builder.create_binary_expr(Kind::Equal, e, &observed);

            self.reset();
            self.sync_constraints(e);
            self.add_to_solver(&pinned, false);

            if self.check() != SmtResult::Sat {
                self.reset();
                self.add_to_solver(&pinned, false);
                postfix = "optimistic";
            }

            let ast = smt::to_smt(e, &self.inputs);
            loop {
                if !self.check_and_save(postfix) {
                    break;
                }
                let found = match self.smt.model().and_then(|m| m.eval(&ast)) {
                    Some(found) => found,
                    None => break,
                };
                self.smt.assert(&found.mk_eq(&ast).mk_not())
            }
        }
        self.add_value(e, value)
    }

    fn reset(&mut self) {
        self.smt.reset();
        self.skipped_constraints = 0;
        self.added_constraints = 0;
        self.symbolic_variables = 0;
        self.concrete_variables = 0;
    }

    fn check(&mut self) -> SmtResult {
        let start = Instant::now();
        let result = self.smt.check();
        self.solver_check_time = start.elapsed();
        log!(
            log::SOLVER,
            format!("check-sat: {:?} after {:.6}s", result, self.solver_check_time.as_secs_f64())
        );
        result
    }

    fn check_and_save(&mut self, postfix: &str) -> bool {
        if self.check() == SmtResult::Sat {
            if let Some(seq) = self.save_values(postfix) {
                self.save_stats(seq)
            }
            true
        } else {
            false
        }
    }

    fn negate_path(&mut self, e: &ExprRef, taken: bool) {
        self.reset();

        let start = Instant::now();
        self.sync_constraints(e);
        self.sync_time = start.elapsed();
        log!(log::SYNC, format!("synced constraints in {:.6}s", self.sync_time.as_secs_f64()));
        self.check_feasible();

        self.add_to_solver(e, !taken);
        self.added_constraints += 1;

        let sat = self.check_and_save("");
        if !sat {
            // Optimistic solving: drop the path context and retry the bare
            // negated branch.
            self.reset();
            self.add_to_solver(e, !taken);
            self.added_constraints += 1;
            self.check_and_save("optimistic");
        }
    }

    fn add_to_solver(&mut self, e: &ExprRef, taken: bool) {
        let e = if taken { e.clone() } else { self.builder.create_lnot(e) };
        self.smt.assert(&smt::to_smt(&e, &self.inputs))
    }

    fn read_expr(&self, index: usize) -> ExprRef {
        let reads = self.reads.borrow();
        match reads.get(index).cloned().flatten() {
            Some(read) => read,
            None => fatal!("no read expression for input byte {}", index),
        }
    }

    /// Pulls the dependency trees touching `e`'s input bytes into the
    /// solver. Reads involved in the branch become symbolic; every other
    /// read in the same trees is bound to its concrete input value, so the
    /// model only varies the bytes the branch actually depends on.
    fn sync_constraints(&mut self, e: &ExprRef) {
        let symdeps = e.deps().clone();
        self.symbolic_variables = symdeps.len() as u32;

        let mut trees = Vec::new();
        for &index in &symdeps {
            let tree = self.dep_forest.find(index);
            if !trees.iter().any(|t| Rc::ptr_eq(t, &tree)) {
                trees.push(tree);
            }
            let read = self.read_expr(index);
            if read.is_concrete() {
                read.symbolize()
            }
        }

        for tree in &trees {
            let tree = tree.borrow();

            for &index in tree.dependencies() {
                if !symdeps.contains(&index) {
                    self.concrete_variables += 1;
                    self.read_expr(index).concretize()
                }
            }

            for node in tree.nodes() {
                if node.is_concrete() {
                    // Fully bound to the current input; cannot constrain
                    // the free bytes.
                    self.skipped_constraints += 1;
                    continue;
                }

                if is_relational(node) {
                    let node = node.clone();
                    self.add_to_solver(&node, true);
                    self.added_constraints += 1;
                } else {
                    let mut valid = false;
                    for is_unsigned in [false, true] {
                        if let Some(range) = self.range_constraint(node, is_unsigned) {
                            self.add_to_solver(&range, true);
                            self.added_constraints += 1;
                            valid = true;
                        }
                    }
                    if !valid {
                        log!(log::SYNC, format!("constraint with no materializable range: {}", node));
                    }
                }
            }
        }
    }

    fn add_constraint(&mut self, e: &ExprRef, taken: bool) {
        if e.kind() == Kind::LNot {
            let inner = e.child(0).clone();
            return self.add_constraint(&inner, !taken);
        }
        if !self.add_range_constraint(e, taken) {
            self.add_normal_constraint(e, taken)
        }
    }

    /// Appends a constraint node to the dependency forest.
    fn record(&mut self, e: &ExprRef) {
        if e.kind() == Kind::Bool {
            if e.bool_value() != Some(true) {
                fatal!("recording a trivially false constraint");
            }
            return;
        }
        self.dep_forest.add_node(e.clone())
    }

    fn add_range_constraint(&mut self, e: &ExprRef, taken: bool) -> bool {
        if !is_const_sym(e) {
            return false;
        }

        let (kind, sym, constant) = parse_const_sym(e);
        let (canonical, adjustment) = self.canonical_expr(&sym);
        let value = constant.value().unwrap().clone();
        let kind = if taken { kind } else { negate_kind(kind) };

        canonical.add_range_constraint(kind, &value, &adjustment);
        self.record(&canonical);
        true
    }

    fn add_normal_constraint(&mut self, e: &ExprRef, taken: bool) {
        let e = if taken { e.clone() } else { self.builder.create_lnot(e) };
        self.record(&e)
    }

    /// Splits `Add(C, X)`/`Sub(C, X)` into a canonical expression and a
    /// constant adjustment so the range sets accumulate on the symbolic
    /// part.
    fn canonical_expr(&self, e: &ExprRef) -> (ExprRef, BitVec) {
        match e.kind() {
            Kind::Add if e.left().is_constant() => {
                (e.right().clone(), e.left().value().unwrap().clone())
            }
            Kind::Sub if e.left().is_constant() => {
                (self.builder.create_neg(e.right()), e.left().value().unwrap().clone())
            }
            _ => (e.clone(), BitVec::zero(e.bits())),
        }
    }

    /// Materializes one signedness of a range set back into a disjunction
    /// of bound clauses.
    fn range_constraint(&self, e: &ExprRef, is_unsigned: bool) -> Option<ExprRef> {
        let slot = e.range_set(is_unsigned).borrow();
        let rs = slot.as_ref()?;

        let (lower_kind, upper_kind) =
            if is_unsigned { (Kind::Uge, Kind::Ule) } else { (Kind::Sge, Kind::Sle) };

        let mut clause: Option<ExprRef> = None;
        for (from, to) in rs.iter() {
            let bound = if from == to {
                let imm = self.builder.create_constant(from);
                self.builder.create_equal(e, &imm)
            } else {
                let lower_imm = self.builder.create_constant(from);
                let upper_imm = self.builder.create_constant(to);
                let lower = self.builder.create_binary_expr(lower_kind, e, &lower_imm);
                let upper = self.builder.create_binary_expr(upper_kind, e, &upper_imm);
                self.builder.create_land(&lower, &upper)
            };
            clause = Some(match clause {
                None => bound,
                Some(previous) => self.builder.create_lor(&previous, &bound),
            });
        }
        clause
    }

    fn min_value(&mut self, ast: &Ast) -> Option<Ast> {
        self.smt.push();
        let mut value = None;
        while self.check_and_save("") {
            match self.smt.model().and_then(|m| m.eval(ast)) {
                Some(found) => {
                    self.smt.assert(&ast.mk_bvult(&found));
                    value = Some(found)
                }
                None => break,
            }
        }
        self.smt.pop();
        value
    }

    fn max_value(&mut self, ast: &Ast) -> Option<Ast> {
        self.smt.push();
        let mut value = None;
        while self.check_and_save("") {
            match self.smt.model().and_then(|m| m.eval(ast)) {
                Some(found) => {
                    self.smt.assert(&ast.mk_bvugt(&found));
                    value = Some(found)
                }
                None => break,
            }
        }
        self.smt.pop();
        value
    }

    /// The constraints recorded along the executed path must be satisfied
    /// by the input that produced them; anything else is a recording bug.
    fn check_feasible(&mut self) {
        if cfg!(debug_assertions) && self.smt.check() == SmtResult::Unsat {
            fatal!("infeasible path constraints after sync");
        }
    }

    fn solve_one(&mut self, ast: Ast) {
        self.smt.push();
        self.smt.assert(&ast);
        self.check_and_save("");
        self.smt.pop()
    }

    /// The current input with every model-assigned byte replaced.
    fn concrete_values(&self) -> Vec<u8> {
        let mut values = (*self.inputs).clone();
        if let Some(model) = self.smt.model() {
            for (index, byte) in model.byte_assignments() {
                if index < values.len() {
                    values[index] = byte
                }
            }
        }
        values
    }

    /// Writes the next testcase file, returning its sequence number.
    fn save_values(&mut self, postfix: &str) -> Option<u32> {
        let values = self.concrete_values();

        let mut name = format!("{:06}", self.num_generated);
        if !postfix.is_empty() {
            name = format!("{}-{}", name, postfix)
        }
        let path = self.out_dir.join(name);

        log!(log::TESTCASE, format!("new testcase: {}", path.display()));
        if let Err(err) = fs::write(&path, &values) {
            log!(log::TESTCASE, format!("failed to write {}: {}", path.display(), err));
            return None;
        }

        let seq = self.num_generated;
        self.num_generated += 1;
        Some(seq)
    }

    fn save_stats(&mut self, seq: u32) {
        let row = format!(
            "{},{:.6},{:.6},{},{},{},{}\n",
            seq,
            self.solver_check_time.as_secs_f64(),
            self.sync_time.as_secs_f64(),
            self.skipped_constraints,
            self.added_constraints,
            self.symbolic_variables,
            self.concrete_variables,
        );
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.stats_file)
            .and_then(|mut file| file.write_all(row.as_bytes()));
        if let Err(err) = result {
            log!(log::SOLVER, format!("failed to append stats: {}", err));
        }
    }
}
