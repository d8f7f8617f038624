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

//! A safe abstraction over the [z3_sys] crate, specialized for the `QF_BV`
//! queries the solver driver issues. The Z3 context is process-global, like
//! every other piece of runtime state; expression nodes cache their
//! materialized [Ast] and the cache is dropped on invalidation, so a node
//! whose concreteness changed between two branches is re-translated.

use libc::c_uint;
use std::ffi::CString;
use std::fmt;

use z3_sys::*;

use crate::concrete::BitVec;
use crate::expr::{ExprRef, Kind};
use crate::fatal;

/// Translation recursion limit; a constraint this deep means the builder
/// has gone off the rails.
const MAX_MATERIALIZE_DEPTH: u32 = 100_000;

/// Config is a wrapper around the `Z3_config` type from the C API.
/// `Z3_del_config` is called when it is dropped.
pub struct Config {
    z3_cfg: Z3_config,
}

impl Config {
    pub fn new() -> Self {
        unsafe { Config { z3_cfg: Z3_mk_config() } }
    }

    pub fn set_param_value(&mut self, id: &str, value: &str) {
        let id = CString::new(id).unwrap();
        let value = CString::new(value).unwrap();
        unsafe { Z3_set_param_value(self.z3_cfg, id.as_ptr(), value.as_ptr()) }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Config {
    fn drop(&mut self) {
        unsafe { Z3_del_config(self.z3_cfg) }
    }
}

/// Context is a wrapper around `Z3_context`.
pub struct Context {
    z3_ctx: Z3_context,
}

impl Context {
    pub fn new(cfg: Config) -> Self {
        unsafe { Context { z3_ctx: Z3_mk_context_rc(cfg.z3_cfg) } }
    }
}

// The runtime is single-threaded per target process. Expressions are
// reference counted with `Rc` and so never cross threads; giving each
// thread its own context keeps the raw pointers honest without locking.
thread_local! {
    static CONTEXT: Context = {
        let mut cfg = Config::new();
        cfg.set_param_value("model", "true");
        Context::new(cfg)
    };
}

fn ctx() -> Z3_context {
    CONTEXT.with(|context| context.z3_ctx)
}

/// A reference-counted Z3 AST node in the global context.
pub struct Ast {
    z3_ast: Z3_ast,
}

impl Clone for Ast {
    fn clone(&self) -> Self {
        unsafe {
            Z3_inc_ref(ctx(), self.z3_ast);
            Ast { z3_ast: self.z3_ast }
        }
    }
}

impl Drop for Ast {
    fn drop(&mut self) {
        unsafe { Z3_dec_ref(ctx(), self.z3_ast) }
    }
}

impl fmt::Display for Ast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        unsafe {
            let s = Z3_ast_to_string(ctx(), self.z3_ast);
            let s = std::ffi::CStr::from_ptr(s).to_string_lossy();
            write!(f, "{}", s)
        }
    }
}

macro_rules! z3_unary_op {
    ($i:ident, $arg:ident) => {
        unsafe {
            let z3_ast = $i(ctx(), $arg.z3_ast);
            Z3_inc_ref(ctx(), z3_ast);
            Ast { z3_ast }
        }
    };
}

macro_rules! z3_binary_op {
    ($i:ident, $lhs:ident, $rhs:ident) => {
        unsafe {
            let z3_ast = $i(ctx(), $lhs.z3_ast, $rhs.z3_ast);
            Z3_inc_ref(ctx(), z3_ast);
            Ast { z3_ast }
        }
    };
}

impl Ast {
    fn wrap(z3_ast: Z3_ast) -> Self {
        unsafe {
            Z3_inc_ref(ctx(), z3_ast);
            Ast { z3_ast }
        }
    }

    pub fn mk_bool(b: bool) -> Self {
        unsafe { Ast::wrap(if b { Z3_mk_true(ctx()) } else { Z3_mk_false(ctx()) }) }
    }

    pub fn mk_bv(value: &BitVec) -> Self {
        unsafe {
            let sort = Z3_mk_bv_sort(ctx(), value.len() as c_uint);
            Z3_inc_ref(ctx(), Z3_sort_to_ast(ctx(), sort));
            let ast = if value.active_bits() <= 64 {
                Ast::wrap(Z3_mk_unsigned_int64(ctx(), value.limited_value(), sort))
            } else {
                let digits = CString::new(value.unsigned_value().to_str_radix(10)).unwrap();
                Ast::wrap(Z3_mk_numeral(ctx(), digits.as_ptr(), sort))
            };
            Z3_dec_ref(ctx(), Z3_sort_to_ast(ctx(), sort));
            ast
        }
    }

    /// A fresh 8-bit variable named by the input byte index.
    pub fn mk_read(index: usize) -> Self {
        unsafe {
            let symbol = Z3_mk_int_symbol(ctx(), index as libc::c_int);
            let sort = Z3_mk_bv_sort(ctx(), 8);
            Z3_inc_ref(ctx(), Z3_sort_to_ast(ctx(), sort));
            let ast = Ast::wrap(Z3_mk_const(ctx(), symbol, sort));
            Z3_dec_ref(ctx(), Z3_sort_to_ast(ctx(), sort));
            ast
        }
    }

    pub fn simplify(&mut self) {
        unsafe {
            let z3_ast = Z3_simplify(ctx(), self.z3_ast);
            Z3_inc_ref(ctx(), z3_ast);
            Z3_dec_ref(ctx(), self.z3_ast);
            self.z3_ast = z3_ast;
        }
    }

    pub fn mk_not(&self) -> Self {
        z3_unary_op!(Z3_mk_not, self)
    }

    pub fn mk_eq(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_eq, self, rhs)
    }

    pub fn mk_and(&self, rhs: &Ast) -> Self {
        unsafe {
            let args = [self.z3_ast, rhs.z3_ast];
            Ast::wrap(Z3_mk_and(ctx(), 2, args.as_ptr()))
        }
    }

    pub fn mk_or(&self, rhs: &Ast) -> Self {
        unsafe {
            let args = [self.z3_ast, rhs.z3_ast];
            Ast::wrap(Z3_mk_or(ctx(), 2, args.as_ptr()))
        }
    }

    pub fn extract(&self, hi: u32, lo: u32) -> Self {
        unsafe { Ast::wrap(Z3_mk_extract(ctx(), hi, lo, self.z3_ast)) }
    }

    pub fn zero_extend(&self, i: u32) -> Self {
        unsafe { Ast::wrap(Z3_mk_zero_ext(ctx(), i, self.z3_ast)) }
    }

    pub fn sign_extend(&self, i: u32) -> Self {
        unsafe { Ast::wrap(Z3_mk_sign_ext(ctx(), i, self.z3_ast)) }
    }

    pub fn ite(&self, then_ast: &Ast, else_ast: &Ast) -> Self {
        unsafe { Ast::wrap(Z3_mk_ite(ctx(), self.z3_ast, then_ast.z3_ast, else_ast.z3_ast)) }
    }

    pub fn mk_bvnot(&self) -> Self {
        z3_unary_op!(Z3_mk_bvnot, self)
    }

    pub fn mk_bvneg(&self) -> Self {
        z3_unary_op!(Z3_mk_bvneg, self)
    }

    pub fn mk_bvand(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvand, self, rhs)
    }

    pub fn mk_bvor(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvor, self, rhs)
    }

    pub fn mk_bvxor(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvxor, self, rhs)
    }

    pub fn mk_bvadd(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvadd, self, rhs)
    }

    pub fn mk_bvsub(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvsub, self, rhs)
    }

    pub fn mk_bvmul(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvmul, self, rhs)
    }

    pub fn mk_bvudiv(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvudiv, self, rhs)
    }

    pub fn mk_bvsdiv(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvsdiv, self, rhs)
    }

    pub fn mk_bvurem(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvurem, self, rhs)
    }

    pub fn mk_bvsrem(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvsrem, self, rhs)
    }

    pub fn mk_bvshl(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvshl, self, rhs)
    }

    pub fn mk_bvlshr(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvlshr, self, rhs)
    }

    pub fn mk_bvashr(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvashr, self, rhs)
    }

    pub fn mk_bvult(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvult, self, rhs)
    }

    pub fn mk_bvule(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvule, self, rhs)
    }

    pub fn mk_bvugt(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvugt, self, rhs)
    }

    pub fn mk_bvuge(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvuge, self, rhs)
    }

    pub fn mk_bvslt(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvslt, self, rhs)
    }

    pub fn mk_bvsle(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvsle, self, rhs)
    }

    pub fn mk_bvsgt(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvsgt, self, rhs)
    }

    pub fn mk_bvsge(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_bvsge, self, rhs)
    }

    pub fn mk_concat(&self, rhs: &Ast) -> Self {
        z3_binary_op!(Z3_mk_concat, self, rhs)
    }

    pub fn get_bool_value(&self) -> Option<bool> {
        unsafe {
            match Z3_get_bool_value(ctx(), self.z3_ast) {
                Z3_L_TRUE => Some(true),
                Z3_L_FALSE => Some(false),
                _ => None,
            }
        }
    }

    pub fn get_numeral_u64(&self) -> Option<u64> {
        let mut v: u64 = 0;
        unsafe {
            if Z3_get_numeral_uint64(ctx(), self.z3_ast, &mut v) {
                Some(v)
            } else {
                None
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmtResult {
    Sat,
    Unsat,
    Unknown,
}

impl SmtResult {
    pub fn is_sat(self) -> bool {
        self == SmtResult::Sat
    }
}

/// The solver handle. Reset between branches; push/pop bracket the min/max
/// probing sub-queries.
pub struct SmtSolver {
    z3_solver: Z3_solver,
    timeout_ms: u32,
}

impl SmtSolver {
    pub fn new(timeout_ms: u32) -> Self {
        unsafe {
            let logic = Z3_mk_string_symbol(ctx(), b"QF_BV\0".as_ptr() as *const libc::c_char);
            let z3_solver = Z3_mk_solver_for_logic(ctx(), logic);
            Z3_solver_inc_ref(ctx(), z3_solver);
            let solver = SmtSolver { z3_solver, timeout_ms };
            solver.apply_params();
            solver
        }
    }

    fn apply_params(&self) {
        unsafe {
            let params = Z3_mk_params(ctx());
            Z3_params_inc_ref(ctx(), params);
            let timeout = Z3_mk_string_symbol(ctx(), b"timeout\0".as_ptr() as *const libc::c_char);
            Z3_params_set_uint(ctx(), params, timeout, self.timeout_ms);
            Z3_solver_set_params(ctx(), self.z3_solver, params);
            Z3_params_dec_ref(ctx(), params);
        }
    }

    /// Drops every assertion and re-applies the timeout parameters.
    pub fn reset(&mut self) {
        unsafe { Z3_solver_reset(ctx(), self.z3_solver) }
        self.apply_params()
    }

    pub fn push(&mut self) {
        unsafe { Z3_solver_push(ctx(), self.z3_solver) }
    }

    pub fn pop(&mut self) {
        unsafe { Z3_solver_pop(ctx(), self.z3_solver, 1) }
    }

    /// Asserts `ast` after Z3-level simplification. Assertions that
    /// simplify to the literal `true` are dropped.
    pub fn assert(&mut self, ast: &Ast) {
        let mut ast = ast.clone();
        ast.simplify();
        if ast.get_bool_value() == Some(true) {
            return;
        }
        unsafe { Z3_solver_assert(ctx(), self.z3_solver, ast.z3_ast) }
    }

    pub fn check(&mut self) -> SmtResult {
        unsafe {
            let result = Z3_solver_check(ctx(), self.z3_solver);
            if result == Z3_L_TRUE {
                SmtResult::Sat
            } else if result == Z3_L_FALSE {
                SmtResult::Unsat
            } else {
                SmtResult::Unknown
            }
        }
    }

    pub fn model(&self) -> Option<Model> {
        unsafe {
            let z3_model = Z3_solver_get_model(ctx(), self.z3_solver);
            if z3_model.is_null() {
                return None;
            }
            Z3_model_inc_ref(ctx(), z3_model);
            Some(Model { z3_model })
        }
    }
}

impl Drop for SmtSolver {
    fn drop(&mut self) {
        unsafe { Z3_solver_dec_ref(ctx(), self.z3_solver) }
    }
}

/// Interface for extracting byte assignments from Z3 models. Free
/// variables are integer symbols carrying their input byte index.
pub struct Model {
    z3_model: Z3_model,
}

impl Drop for Model {
    fn drop(&mut self) {
        unsafe { Z3_model_dec_ref(ctx(), self.z3_model) }
    }
}

impl Model {
    /// Every `(input byte index, value)` pair the model assigns.
    pub fn byte_assignments(&self) -> Vec<(usize, u8)> {
        let mut assignments = Vec::new();
        unsafe {
            let num_consts = Z3_model_get_num_consts(ctx(), self.z3_model);
            for i in 0..num_consts {
                let decl = Z3_model_get_const_decl(ctx(), self.z3_model, i);
                Z3_inc_ref(ctx(), Z3_func_decl_to_ast(ctx(), decl));
                let symbol = Z3_get_decl_name(ctx(), decl);
                if Z3_get_symbol_kind(ctx(), symbol) == SymbolKind::Int {
                    let index = Z3_get_symbol_int(ctx(), symbol);
                    let interp = Z3_model_get_const_interp(ctx(), self.z3_model, decl);
                    if !interp.is_null() {
                        let interp = Ast::wrap(interp);
                        if let Some(value) = interp.get_numeral_u64() {
                            assignments.push((index as usize, value as u8))
                        }
                    }
                }
                Z3_dec_ref(ctx(), Z3_func_decl_to_ast(ctx(), decl));
            }
        }
        assignments
    }

    /// Evaluates `ast` under the model with model completion.
    pub fn eval(&self, ast: &Ast) -> Option<Ast> {
        unsafe {
            let mut result: Z3_ast = std::ptr::null_mut();
            if Z3_model_eval(ctx(), self.z3_model, ast.z3_ast, true, &mut result) {
                Some(Ast::wrap(result))
            } else {
                None
            }
        }
    }
}

/// Materializes an expression to its Z3 form, reusing per-node caches that
/// survive until the node is invalidated by a concreteness change.
pub fn to_smt(e: &ExprRef, inputs: &[u8]) -> Ast {
    to_smt_at(e, inputs, 0)
}

fn to_smt_at(e: &ExprRef, inputs: &[u8], depth: u32) -> Ast {
    if depth > MAX_MATERIALIZE_DEPTH {
        fatal!("expression too deep to materialize: {}", e);
    }
    if let Some(cached) = e.cached_smt() {
        return cached;
    }
    let ast = translate(e, inputs, depth);
    e.set_cached_smt(ast.clone());
    ast
}

fn translate(e: &ExprRef, inputs: &[u8], depth: u32) -> Ast {
    use Kind::*;
    let child = |i: usize| to_smt_at(e.child(i), inputs, depth + 1);
    match e.kind() {
        Bool => Ast::mk_bool(e.bool_value().unwrap()),
        Constant => Ast::mk_bv(e.value().unwrap()),
        Read => {
            // Reads bound to their concrete input value (everything outside
            // the current branch's dependency cut) materialize as constants.
            if e.is_concrete() {
                to_smt_at(&e.evaluate(inputs), inputs, depth + 1)
            } else {
                Ast::mk_read(e.read_index().unwrap())
            }
        }
        Concat => child(0).mk_concat(&child(1)),
        Extract => child(0).extract(e.extract_index() + e.bits() - 1, e.extract_index()),
        ZExt => {
            if e.is_concrete() {
                to_smt_at(&e.evaluate(inputs), inputs, depth + 1)
            } else {
                child(0).zero_extend(e.bits() - e.child(0).bits())
            }
        }
        SExt => {
            if e.is_concrete() {
                to_smt_at(&e.evaluate(inputs), inputs, depth + 1)
            } else {
                child(0).sign_extend(e.bits() - e.child(0).bits())
            }
        }
        Add => child(0).mk_bvadd(&child(1)),
        Sub => child(0).mk_bvsub(&child(1)),
        Mul => child(0).mk_bvmul(&child(1)),
        UDiv => child(0).mk_bvudiv(&child(1)),
        SDiv => child(0).mk_bvsdiv(&child(1)),
        URem => child(0).mk_bvurem(&child(1)),
        SRem => child(0).mk_bvsrem(&child(1)),
        Neg => child(0).mk_bvneg(),
        Not => child(0).mk_bvnot(),
        And => child(0).mk_bvand(&child(1)),
        Or => child(0).mk_bvor(&child(1)),
        Xor => child(0).mk_bvxor(&child(1)),
        Shl => child(0).mk_bvshl(&child(1)),
        LShr => child(0).mk_bvlshr(&child(1)),
        AShr => child(0).mk_bvashr(&child(1)),
        Equal => child(0).mk_eq(&child(1)),
        Distinct => child(0).mk_eq(&child(1)).mk_not(),
        Ult => child(0).mk_bvult(&child(1)),
        Ule => child(0).mk_bvule(&child(1)),
        Ugt => child(0).mk_bvugt(&child(1)),
        Uge => child(0).mk_bvuge(&child(1)),
        Slt => child(0).mk_bvslt(&child(1)),
        Sle => child(0).mk_bvsle(&child(1)),
        Sgt => child(0).mk_bvsgt(&child(1)),
        Sge => child(0).mk_bvsge(&child(1)),
        LOr => child(0).mk_or(&child(1)),
        LAnd => child(0).mk_and(&child(1)),
        LNot => child(0).mk_not(),
        Ite => child(0).ite(&child(1), &child(2)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concrete::BitVec;
    use crate::expr_builder::{new_read_registry, symbolic_chain, ExprBuilder};

    #[test]
    fn trivial_sat_and_unsat() {
        let b = symbolic_chain(&new_read_registry());
        let x = b.create_read(0);
        let c = b.create_constant_u64(0x41, 8);

        let mut solver = SmtSolver::new(1000);
        solver.assert(&to_smt(&b.create_equal(&x, &c), &[]));
        assert_eq!(solver.check(), SmtResult::Sat);

        let model = solver.model().unwrap();
        let assignments = model.byte_assignments();
        assert_eq!(assignments, vec![(0, 0x41)]);

        solver.reset();
        solver.assert(&to_smt(&b.create_equal(&x, &c), &[]));
        solver.assert(&to_smt(&b.create_distinct(&x, &c), &[]));
        assert_eq!(solver.check(), SmtResult::Unsat);
    }

    #[test]
    fn concrete_reads_materialize_as_constants() {
        let b = symbolic_chain(&new_read_registry());
        let x = b.create_read(0);
        let y = b.create_read(1);
        let sum = b.create_add(&x, &y);
        let inputs = [0x10u8, 0x20];

        // Bind y to its input value; only x remains free.
        y.concretize();
        let mut solver = SmtSolver::new(1000);
        let c = b.create_constant_u64(0x30, 8);
        solver.assert(&to_smt(&b.create_equal(&sum, &c), &inputs));
        assert_eq!(solver.check(), SmtResult::Sat);
        let model = solver.model().unwrap();
        assert_eq!(model.byte_assignments(), vec![(0, 0x10)]);
        y.symbolize();
    }

    #[test]
    fn invalidation_retranslates() {
        let b = symbolic_chain(&new_read_registry());
        let x = b.create_read(2);
        let inputs = [0u8, 0, 0x55];

        let symbolic = to_smt(&x, &inputs);
        assert!(format!("{}", symbolic).contains("2"));

        x.concretize();
        let concrete = to_smt(&x, &inputs);
        assert!(format!("{}", concrete).contains("#x55"));
        x.symbolize();
    }

    #[test]
    fn wide_constants_translate() {
        let b = symbolic_chain(&new_read_registry());
        // A 128-bit symbolic word forces the numeral-string constant path.
        let mut word = b.create_read(0);
        for i in 1..16 {
            word = b.create_concat(&word, &b.create_read(i));
        }
        assert_eq!(word.bits(), 128);
        let ones = b.create_constant(BitVec::all_ones(128));

        let mut solver = SmtSolver::new(1000);
        solver.assert(&to_smt(&b.create_equal(&word, &ones), &[]));
        assert_eq!(solver.check(), SmtResult::Sat);
        let assignments = solver.model().unwrap().byte_assignments();
        assert_eq!(assignments.len(), 16);
        assert!(assignments.iter().all(|&(_, byte)| byte == 0xff));
    }
}
