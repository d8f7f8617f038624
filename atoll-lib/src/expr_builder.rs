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

//! The layered expression builder. Every runtime callback enters the
//! pipeline at its head and each stage either rewrites its inputs and
//! re-enters the chain below itself, or delegates unchanged to the next
//! stage:
//!
//! `Commutative -> Symbolic -> CommonSimplify -> ConstantFolding ->
//! [Prune ->] Cache -> Base`
//!
//! The commutative stage keeps constants on a canonical side, the symbolic
//! stage hosts the shape-aware algebra, the common stage the
//! polarity-agnostic rewrites, and the folding stage evaluates fully
//! concrete operations with the bit-vector theory semantics of
//! [crate::concrete::BitVec]. The optional prune stage concretizes results
//! built in dynamic contexts the call-stack manager has already seen.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::callstack::CallStackManager;
use crate::concrete::BitVec;
use crate::expr::{is_zero_bit, Expr, ExprRef, Kind, Payload};
use crate::expr_cache::ExprCache;
use crate::fatal;

/// Memoized `Read` leaves, indexed by input byte. Shared between the base
/// stage and the solver, which flips the concreteness of individual reads
/// while syncing constraints.
pub type ReadRegistry = Rc<RefCell<Vec<Option<ExprRef>>>>;

pub fn new_read_registry() -> ReadRegistry {
    Rc::new(RefCell::new(Vec::new()))
}

pub trait ExprBuilder {
    fn next(&self) -> &dyn ExprBuilder;

    fn create_bool(&self, b: bool) -> ExprRef {
        self.next().create_bool(b)
    }

    fn create_constant(&self, value: BitVec) -> ExprRef {
        self.next().create_constant(value)
    }

    fn create_read(&self, offset: usize) -> ExprRef {
        self.next().create_read(offset)
    }

    fn create_concat(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_concat(l, r)
    }

    fn create_extract(&self, e: &ExprRef, index: u32, bits: u32) -> ExprRef {
        self.next().create_extract(e, index, bits)
    }

    fn create_zext(&self, e: &ExprRef, bits: u32) -> ExprRef {
        self.next().create_zext(e, bits)
    }

    fn create_sext(&self, e: &ExprRef, bits: u32) -> ExprRef {
        self.next().create_sext(e, bits)
    }

    fn create_add(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_add(l, r)
    }

    fn create_sub(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_sub(l, r)
    }

    fn create_mul(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_mul(l, r)
    }

    fn create_udiv(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_udiv(l, r)
    }

    fn create_sdiv(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_sdiv(l, r)
    }

    fn create_urem(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_urem(l, r)
    }

    fn create_srem(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_srem(l, r)
    }

    fn create_neg(&self, e: &ExprRef) -> ExprRef {
        self.next().create_neg(e)
    }

    fn create_not(&self, e: &ExprRef) -> ExprRef {
        self.next().create_not(e)
    }

    fn create_and(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_and(l, r)
    }

    fn create_or(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_or(l, r)
    }

    fn create_xor(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_xor(l, r)
    }

    fn create_shl(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_shl(l, r)
    }

    fn create_lshr(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_lshr(l, r)
    }

    fn create_ashr(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_ashr(l, r)
    }

    fn create_equal(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_equal(l, r)
    }

    fn create_distinct(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_distinct(l, r)
    }

    fn create_ult(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_ult(l, r)
    }

    fn create_ule(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_ule(l, r)
    }

    fn create_ugt(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_ugt(l, r)
    }

    fn create_uge(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_uge(l, r)
    }

    fn create_slt(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_slt(l, r)
    }

    fn create_sle(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_sle(l, r)
    }

    fn create_sgt(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_sgt(l, r)
    }

    fn create_sge(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_sge(l, r)
    }

    fn create_lor(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_lor(l, r)
    }

    fn create_land(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.next().create_land(l, r)
    }

    fn create_lnot(&self, e: &ExprRef) -> ExprRef {
        self.next().create_lnot(e)
    }

    fn create_ite(&self, cond: &ExprRef, then_expr: &ExprRef, else_expr: &ExprRef) -> ExprRef {
        self.next().create_ite(cond, then_expr, else_expr)
    }

    // Convenience entry points, dispatched through the chain they are
    // invoked on.

    fn create_constant_u64(&self, value: u64, bits: u32) -> ExprRef {
        self.create_constant(BitVec::from_u64(value, bits))
    }

    fn create_true(&self) -> ExprRef {
        self.create_bool(true)
    }

    fn create_false(&self) -> ExprRef {
        self.create_bool(false)
    }

    fn create_msb(&self, e: &ExprRef) -> ExprRef {
        self.create_extract(e, e.bits() - 1, 1)
    }

    fn create_lsb(&self, e: &ExprRef) -> ExprRef {
        self.create_extract(e, 0, 1)
    }

    fn create_trunc(&self, e: &ExprRef, bits: u32) -> ExprRef {
        self.create_extract(e, 0, bits)
    }

    /// A one-bit vector as an SMT boolean.
    fn bit_to_bool(&self, e: &ExprRef) -> ExprRef {
        assert_eq!(e.bits(), 1);
        let one = self.create_constant_u64(1, 1);
        self.create_equal(e, &one)
    }

    fn bool_to_bit(&self, e: &ExprRef, bits: u32) -> ExprRef {
        let one = self.create_constant_u64(1, bits);
        let zero = self.create_constant_u64(0, bits);
        self.create_ite(e, &one, &zero)
    }

    /// Folds a most-significant-first list into nested concats.
    fn create_concat_list(&self, exprs: &[ExprRef]) -> ExprRef {
        assert!(!exprs.is_empty());
        let mut result = exprs[0].clone();
        for e in &exprs[1..] {
            result = self.create_concat(&result, e)
        }
        result
    }

    fn create_land_list(&self, exprs: &[ExprRef]) -> ExprRef {
        assert!(!exprs.is_empty());
        let mut result = exprs[0].clone();
        for e in &exprs[1..] {
            result = self.create_land(&result, e)
        }
        result
    }

    fn create_binary_expr(&self, kind: Kind, l: &ExprRef, r: &ExprRef) -> ExprRef {
        use Kind::*;
        match kind {
            Add => self.create_add(l, r),
            Sub => self.create_sub(l, r),
            Mul => self.create_mul(l, r),
            UDiv => self.create_udiv(l, r),
            SDiv => self.create_sdiv(l, r),
            URem => self.create_urem(l, r),
            SRem => self.create_srem(l, r),
            And => self.create_and(l, r),
            Or => self.create_or(l, r),
            Xor => self.create_xor(l, r),
            Shl => self.create_shl(l, r),
            LShr => self.create_lshr(l, r),
            AShr => self.create_ashr(l, r),
            Equal => self.create_equal(l, r),
            Distinct => self.create_distinct(l, r),
            Ult => self.create_ult(l, r),
            Ule => self.create_ule(l, r),
            Ugt => self.create_ugt(l, r),
            Uge => self.create_uge(l, r),
            Slt => self.create_slt(l, r),
            Sle => self.create_sle(l, r),
            Sgt => self.create_sgt(l, r),
            Sge => self.create_sge(l, r),
            LOr => self.create_lor(l, r),
            LAnd => self.create_land(l, r),
            _ => fatal!("non-binary expression kind {:?}", kind),
        }
    }

    fn create_unary_expr(&self, kind: Kind, e: &ExprRef) -> ExprRef {
        match kind {
            Kind::Not => self.create_not(e),
            Kind::Neg => self.create_neg(e),
            Kind::LNot => self.create_lnot(e),
            _ => fatal!("non-unary expression kind {:?}", kind),
        }
    }
}

/// Builds the standard simplifying pipeline.
pub fn symbolic_chain(reads: &ReadRegistry) -> Rc<dyn ExprBuilder> {
    let base = Rc::new(BaseBuilder::new(reads.clone()));
    let cache = Rc::new(CacheBuilder::new(base));
    let folding = Rc::new(ConstantFoldingBuilder::new(cache));
    let common = Rc::new(CommonSimplifyBuilder::new(folding));
    let symbolic = Rc::new(SymbolicBuilder::new(common));
    Rc::new(CommutativeBuilder::new(symbolic))
}

/// The simplifying pipeline with the prune stage between constant folding
/// and the cache.
pub fn pruning_chain(
    reads: &ReadRegistry,
    call_stack: &Rc<RefCell<CallStackManager>>,
    inputs: &Rc<Vec<u8>>,
) -> Rc<dyn ExprBuilder> {
    let base = Rc::new(BaseBuilder::new(reads.clone()));
    let cache = Rc::new(CacheBuilder::new(base));
    let prune = Rc::new(PruneBuilder::new(cache, call_stack.clone(), inputs.clone()));
    let folding = Rc::new(ConstantFoldingBuilder::new(prune));
    let common = Rc::new(CommonSimplifyBuilder::new(folding));
    let symbolic = Rc::new(SymbolicBuilder::new(common));
    Rc::new(CommutativeBuilder::new(symbolic))
}

/// Folding straight onto fresh nodes, used for concrete evaluation.
pub fn folding_chain() -> Rc<dyn ExprBuilder> {
    let base = Rc::new(BaseBuilder::new(new_read_registry()));
    Rc::new(ConstantFoldingBuilder::new(base))
}

fn add_uses(e: &ExprRef) {
    for child in e.children() {
        child.add_use(e)
    }
}

// ---------------------------------------------------------------------------
// Base stage

pub struct BaseBuilder {
    reads: ReadRegistry,
}

impl BaseBuilder {
    pub fn new(reads: ReadRegistry) -> Self {
        BaseBuilder { reads }
    }

    fn alloc(&self, kind: Kind, bits: u32, children: Vec<ExprRef>, payload: Payload) -> ExprRef {
        let e = Rc::new(Expr::new(kind, bits, children, payload));
        add_uses(&e);
        e
    }

    fn binary(&self, kind: Kind, l: &ExprRef, r: &ExprRef) -> ExprRef {
        let bits = if kind.is_compare() { 1 } else { l.bits() };
        self.alloc(kind, bits, vec![l.clone(), r.clone()], Payload::None)
    }
}

macro_rules! base_binary {
    ($($method:ident => $kind:ident),* $(,)?) => {
        $(fn $method(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
            self.binary(Kind::$kind, l, r)
        })*
    };
}

impl ExprBuilder for BaseBuilder {
    fn next(&self) -> &dyn ExprBuilder {
        fatal!("the base builder has no next stage")
    }

    fn create_bool(&self, b: bool) -> ExprRef {
        self.alloc(Kind::Bool, 1, vec![], Payload::Bool(b))
    }

    fn create_constant(&self, value: BitVec) -> ExprRef {
        let bits = value.len();
        self.alloc(Kind::Constant, bits, vec![], Payload::Constant(value))
    }

    fn create_read(&self, offset: usize) -> ExprRef {
        let mut reads = self.reads.borrow_mut();
        if reads.len() <= offset {
            reads.resize(offset + 1, None);
        }
        reads[offset]
            .get_or_insert_with(|| Rc::new(Expr::new(Kind::Read, 8, vec![], Payload::Read(offset))))
            .clone()
    }

    fn create_concat(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.alloc(Kind::Concat, l.bits() + r.bits(), vec![l.clone(), r.clone()], Payload::None)
    }

    fn create_extract(&self, e: &ExprRef, index: u32, bits: u32) -> ExprRef {
        if bits == e.bits() {
            return e.clone();
        }
        self.alloc(Kind::Extract, bits, vec![e.clone()], Payload::Extract(index))
    }

    fn create_zext(&self, e: &ExprRef, bits: u32) -> ExprRef {
        self.alloc(Kind::ZExt, bits, vec![e.clone()], Payload::None)
    }

    fn create_sext(&self, e: &ExprRef, bits: u32) -> ExprRef {
        self.alloc(Kind::SExt, bits, vec![e.clone()], Payload::None)
    }

    fn create_neg(&self, e: &ExprRef) -> ExprRef {
        self.alloc(Kind::Neg, e.bits(), vec![e.clone()], Payload::None)
    }

    fn create_not(&self, e: &ExprRef) -> ExprRef {
        self.alloc(Kind::Not, e.bits(), vec![e.clone()], Payload::None)
    }

    fn create_lnot(&self, e: &ExprRef) -> ExprRef {
        self.alloc(Kind::LNot, e.bits(), vec![e.clone()], Payload::None)
    }

    fn create_ite(&self, cond: &ExprRef, then_expr: &ExprRef, else_expr: &ExprRef) -> ExprRef {
        self.alloc(
            Kind::Ite,
            then_expr.bits(),
            vec![cond.clone(), then_expr.clone(), else_expr.clone()],
            Payload::None,
        )
    }

    base_binary! {
        create_add => Add, create_sub => Sub, create_mul => Mul,
        create_udiv => UDiv, create_sdiv => SDiv, create_urem => URem,
        create_srem => SRem, create_and => And, create_or => Or,
        create_xor => Xor, create_shl => Shl, create_lshr => LShr,
        create_ashr => AShr, create_equal => Equal, create_distinct => Distinct,
        create_ult => Ult, create_ule => Ule, create_ugt => Ugt,
        create_uge => Uge, create_slt => Slt, create_sle => Sle,
        create_sgt => Sgt, create_sge => Sge, create_lor => LOr,
        create_land => LAnd,
    }
}

// ---------------------------------------------------------------------------
// Cache stage

pub struct CacheBuilder {
    next: Rc<dyn ExprBuilder>,
    cache: RefCell<ExprCache>,
}

impl CacheBuilder {
    pub fn new(next: Rc<dyn ExprBuilder>) -> Self {
        CacheBuilder { next, cache: RefCell::new(ExprCache::new()) }
    }

    fn find_or_insert(&self, e: ExprRef) -> ExprRef {
        let mut cache = self.cache.borrow_mut();
        if let Some(cached) = cache.find(&e) {
            return cached;
        }
        cache.insert(&e);
        e
    }
}

macro_rules! cached_unary {
    ($($method:ident),* $(,)?) => {
        $(fn $method(&self, e: &ExprRef) -> ExprRef {
            let e = self.next().$method(e);
            self.find_or_insert(e)
        })*
    };
}

macro_rules! cached_binary {
    ($($method:ident),* $(,)?) => {
        $(fn $method(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
            let e = self.next().$method(l, r);
            self.find_or_insert(e)
        })*
    };
}

impl ExprBuilder for CacheBuilder {
    fn next(&self) -> &dyn ExprBuilder {
        &*self.next
    }

    fn create_concat(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        let e = self.next().create_concat(l, r);
        self.find_or_insert(e)
    }

    fn create_extract(&self, e: &ExprRef, index: u32, bits: u32) -> ExprRef {
        let e = self.next().create_extract(e, index, bits);
        self.find_or_insert(e)
    }

    fn create_zext(&self, e: &ExprRef, bits: u32) -> ExprRef {
        let e = self.next().create_zext(e, bits);
        self.find_or_insert(e)
    }

    fn create_sext(&self, e: &ExprRef, bits: u32) -> ExprRef {
        let e = self.next().create_sext(e, bits);
        self.find_or_insert(e)
    }

    fn create_ite(&self, cond: &ExprRef, then_expr: &ExprRef, else_expr: &ExprRef) -> ExprRef {
        let e = self.next().create_ite(cond, then_expr, else_expr);
        self.find_or_insert(e)
    }

    cached_unary! { create_neg, create_not, create_lnot }

    cached_binary! {
        create_add, create_sub, create_mul, create_udiv, create_sdiv,
        create_urem, create_srem, create_and, create_or, create_xor,
        create_shl, create_lshr, create_ashr, create_equal, create_distinct,
        create_ult, create_ule, create_ugt, create_uge, create_slt,
        create_sle, create_sgt, create_sge, create_lor, create_land,
    }
}

// ---------------------------------------------------------------------------
// Constant folding stage

pub struct ConstantFoldingBuilder {
    next: Rc<dyn ExprBuilder>,
}

impl ConstantFoldingBuilder {
    pub fn new(next: Rc<dyn ExprBuilder>) -> Self {
        ConstantFoldingBuilder { next }
    }
}

fn values<'a>(l: &'a ExprRef, r: &'a ExprRef) -> Option<(&'a BitVec, &'a BitVec)> {
    Some((l.value()?, r.value()?))
}

fn bools(l: &ExprRef, r: &ExprRef) -> Option<(bool, bool)> {
    Some((l.bool_value()?, r.bool_value()?))
}

macro_rules! fold_value {
    ($($method:ident => |$a:ident, $b:ident| $fold:expr),* $(,)?) => {
        $(fn $method(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
            if let Some(($a, $b)) = values(l, r) {
                assert_eq!(l.bits(), r.bits());
                return self.create_constant($fold);
            }
            self.next().$method(l, r)
        })*
    };
}

macro_rules! fold_compare {
    ($($method:ident => $cmp:ident),* $(,)?) => {
        $(fn $method(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
            if let Some((a, b)) = values(l, r) {
                assert_eq!(l.bits(), r.bits());
                return self.create_bool(a.$cmp(b));
            }
            self.next().$method(l, r)
        })*
    };
}

impl ExprBuilder for ConstantFoldingBuilder {
    fn next(&self) -> &dyn ExprBuilder {
        &*self.next
    }

    fn create_concat(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some((a, b)) = values(l, r) {
            return self.create_constant(a.concat(b));
        }
        self.next().create_concat(l, r)
    }

    fn create_extract(&self, e: &ExprRef, index: u32, bits: u32) -> ExprRef {
        if let Some(value) = e.value() {
            return self.create_constant(value.extract(index, bits));
        }
        self.next().create_extract(e, index, bits)
    }

    fn create_zext(&self, e: &ExprRef, bits: u32) -> ExprRef {
        if let Some(value) = e.value() {
            return self.create_constant(value.zext(bits));
        }
        self.next().create_zext(e, bits)
    }

    fn create_sext(&self, e: &ExprRef, bits: u32) -> ExprRef {
        if let Some(value) = e.value() {
            return self.create_constant(value.sext(bits));
        }
        self.next().create_sext(e, bits)
    }

    fn create_neg(&self, e: &ExprRef) -> ExprRef {
        if let Some(value) = e.value() {
            return self.create_constant(-value);
        }
        self.next().create_neg(e)
    }

    fn create_not(&self, e: &ExprRef) -> ExprRef {
        if let Some(value) = e.value() {
            return self.create_constant(!value);
        }
        self.next().create_not(e)
    }

    fn create_lnot(&self, e: &ExprRef) -> ExprRef {
        if let Some(b) = e.bool_value() {
            return self.create_bool(!b);
        }
        self.next().create_lnot(e)
    }

    fold_value! {
        create_add => |a, b| a.add(b),
        create_sub => |a, b| a.sub(b),
        create_mul => |a, b| a.mul(b),
        create_and => |a, b| a & b,
        create_or => |a, b| a | b,
        create_xor => |a, b| a ^ b,
    }

    // Division by zero and shifts past the width are left to the SMT
    // theory; the folder refuses to evaluate them.

    fn create_udiv(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some((a, b)) = values(l, r) {
            if !b.is_zero() {
                return self.create_constant(a.udiv(b));
            }
        }
        self.next().create_udiv(l, r)
    }

    fn create_sdiv(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some((a, b)) = values(l, r) {
            if !b.is_zero() {
                return self.create_constant(a.sdiv(b));
            }
        }
        self.next().create_sdiv(l, r)
    }

    fn create_urem(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some((a, b)) = values(l, r) {
            if !b.is_zero() {
                return self.create_constant(a.urem(b));
            }
        }
        self.next().create_urem(l, r)
    }

    fn create_srem(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some((a, b)) = values(l, r) {
            if !b.is_zero() {
                return self.create_constant(a.srem(b));
            }
        }
        self.next().create_srem(l, r)
    }

    fn create_shl(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some((a, b)) = values(l, r) {
            if b.limited_value() < a.len() as u64 {
                return self.create_constant(a.shl(b.limited_value() as u32));
            }
        }
        self.next().create_shl(l, r)
    }

    fn create_lshr(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some((a, b)) = values(l, r) {
            if b.limited_value() < a.len() as u64 {
                return self.create_constant(a.lshr(b.limited_value() as u32));
            }
        }
        self.next().create_lshr(l, r)
    }

    fn create_ashr(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some((a, b)) = values(l, r) {
            if b.limited_value() < a.len() as u64 {
                return self.create_constant(a.ashr(b.limited_value() as u32));
            }
        }
        self.next().create_ashr(l, r)
    }

    fn create_equal(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some((a, b)) = values(l, r) {
            assert_eq!(l.bits(), r.bits());
            return self.create_bool(a == b);
        }
        if let Some((a, b)) = bools(l, r) {
            return self.create_bool(a == b);
        }
        self.next().create_equal(l, r)
    }

    fn create_distinct(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some((a, b)) = values(l, r) {
            assert_eq!(l.bits(), r.bits());
            return self.create_bool(a != b);
        }
        if let Some((a, b)) = bools(l, r) {
            return self.create_bool(a != b);
        }
        self.next().create_distinct(l, r)
    }

    fn create_land(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some((a, b)) = bools(l, r) {
            return self.create_bool(a && b);
        }
        self.next().create_land(l, r)
    }

    fn create_lor(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some((a, b)) = bools(l, r) {
            return self.create_bool(a || b);
        }
        self.next().create_lor(l, r)
    }

    fn create_ite(&self, cond: &ExprRef, then_expr: &ExprRef, else_expr: &ExprRef) -> ExprRef {
        if let Some(b) = cond.bool_value() {
            return if b { then_expr.clone() } else { else_expr.clone() };
        }
        self.next().create_ite(cond, then_expr, else_expr)
    }

    fold_compare! {
        create_ult => ult, create_ule => ule, create_ugt => ugt,
        create_uge => uge, create_slt => slt, create_sle => sle,
        create_sgt => sgt, create_sge => sge,
    }
}

// ---------------------------------------------------------------------------
// Common simplification stage

pub struct CommonSimplifyBuilder {
    next: Rc<dyn ExprBuilder>,
}

impl CommonSimplifyBuilder {
    pub fn new(next: Rc<dyn ExprBuilder>) -> Self {
        CommonSimplifyBuilder { next }
    }

    fn simplify_and(&self, l: &ExprRef, r: &ExprRef) -> Option<ExprRef> {
        if l.is_zero() {
            return Some(l.clone());
        }
        if l.is_all_ones() {
            return Some(r.clone());
        }
        None
    }

    fn simplify_or(&self, l: &ExprRef, r: &ExprRef) -> Option<ExprRef> {
        if l.is_zero() {
            return Some(r.clone());
        }
        if l.is_all_ones() {
            return Some(l.clone());
        }
        None
    }

    fn simplify_xor(&self, l: &ExprRef, r: &ExprRef) -> Option<ExprRef> {
        if l.is_zero() {
            return Some(r.clone());
        }
        None
    }

    /// Splits a constant along a concat boundary and retries `simplify` on
    /// the upper half, e.g. `0x00ff0000 & Concat(x, y)`.
    fn split_constant_concat(
        &self,
        l: &ExprRef,
        r: &ExprRef,
        simplify: impl Fn(&Self, &ExprRef, &ExprRef) -> Option<ExprRef>,
        rebuild: impl Fn(&Self, &ExprRef, &ExprRef) -> ExprRef,
    ) -> Option<ExprRef> {
        if !l.is_constant() || r.kind() != Kind::Concat {
            return None;
        }
        let r_left = r.left();
        let r_right = r.right();
        let l_left = self.create_extract(l, r_right.bits(), r_left.bits());
        let upper = simplify(self, &l_left, r_left)?;
        let l_right = self.create_extract(l, 0, r_right.bits());
        let lower = rebuild(self, &l_right, r_right);
        Some(self.create_concat(&upper, &lower))
    }
}

impl ExprBuilder for CommonSimplifyBuilder {
    fn next(&self) -> &dyn ExprBuilder {
        &*self.next
    }

    fn create_concat(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        // Concat(Extract(e, y, a), Extract(e, x, b)) with x + b == y
        // => Extract(e, x, a + b)
        if l.kind() == Kind::Extract && r.kind() == Kind::Extract {
            let inner_l = l.child(0);
            let inner_r = r.child(0);
            if Rc::ptr_eq(inner_l, inner_r) && r.extract_index() + r.bits() == l.extract_index() {
                return self.create_extract(inner_l, r.extract_index(), r.bits() + l.bits());
            }
        }

        // Concat(Extract(Ext(e), |e|, k), e) => Extract(Ext(e), 0, |e| + k).
        // Shallow equality is enough here; a deep comparison would be as
        // expensive as just emitting the concat.
        if l.kind() == Kind::Extract {
            let ext = l.child(0);
            if matches!(ext.kind(), Kind::ZExt | Kind::SExt)
                && l.extract_index() == r.bits()
                && crate::expr::equal_shallow(ext.child(0), r)
            {
                return self.create_extract(ext, 0, l.bits() + r.bits());
            }
        }

        self.next().create_concat(l, r)
    }

    fn create_extract(&self, e: &ExprRef, index: u32, bits: u32) -> ExprRef {
        if e.kind() == Kind::Concat {
            let left = e.left();
            let right = e.right();

            // Entirely within one half.
            if index >= right.bits() {
                return self.create_extract(left, index - right.bits(), bits);
            }
            if index + bits <= right.bits() {
                return self.create_extract(right, index, bits);
            }

            // Straddles the boundary with a constant upper half.
            if left.is_constant() {
                return self.create_concat(
                    &self.create_extract(left, 0, bits - right.bits() + index),
                    &self.create_extract(right, index, right.bits() - index),
                );
            }
        } else if matches!(e.kind(), Kind::ZExt | Kind::SExt) {
            let inner = e.child(0);
            if inner.bits() >= index + bits {
                return self.create_extract(inner, index, bits);
            }
            if e.kind() == Kind::ZExt && index >= inner.bits() {
                return self.create_constant(BitVec::zero(bits));
            }
        } else if e.kind() == Kind::Extract {
            return self.create_extract(e.child(0), e.extract_index() + index, bits);
        }

        if index == 0 && e.bits() == bits {
            return e.clone();
        }
        self.next().create_extract(e, index, bits)
    }

    fn create_zext(&self, e: &ExprRef, bits: u32) -> ExprRef {
        // Shrinking is allowed and becomes a truncation.
        if e.bits() > bits {
            return self.create_extract(e, 0, bits);
        }
        if e.bits() == bits {
            return e.clone();
        }
        self.next().create_zext(e, bits)
    }

    fn create_add(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if l.is_zero() {
            return r.clone();
        }
        self.next().create_add(l, r)
    }

    fn create_mul(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if l.is_zero() {
            return l.clone();
        }
        if l.is_one() {
            return r.clone();
        }
        self.next().create_mul(l, r)
    }

    fn create_and(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some(e) = self.simplify_and(l, r) {
            return e;
        }
        if let Some(e) =
            self.split_constant_concat(l, r, Self::simplify_and, |b, l, r| b.create_and(l, r))
        {
            return e;
        }
        self.next().create_and(l, r)
    }

    fn create_or(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some(e) = self.simplify_or(l, r) {
            return e;
        }
        if let Some(e) =
            self.split_constant_concat(l, r, Self::simplify_or, |b, l, r| b.create_or(l, r))
        {
            return e;
        }
        self.next().create_or(l, r)
    }

    fn create_xor(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some(e) = self.simplify_xor(l, r) {
            return e;
        }
        if let Some(e) =
            self.split_constant_concat(l, r, Self::simplify_xor, |b, l, r| b.create_xor(l, r))
        {
            return e;
        }
        self.next().create_xor(l, r)
    }

    fn create_shl(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if l.is_zero() {
            return l.clone();
        }
        if let Some(amount) = r.value() {
            let amount = amount.limited_value();
            if amount == 0 {
                return l.clone();
            }
            if amount >= l.bits() as u64 {
                return self.create_constant(BitVec::zero(l.bits()));
            }
            // (bvshl x k) -> (concat (extract [n-1-k:0] x) bv0:k), but only
            // at byte granularity so reads stay byte-aligned.
            if amount % 8 == 0 {
                let amount = amount as u32;
                let zero = self.create_constant(BitVec::zero(amount));
                let partial = self.create_extract(l, 0, l.bits() - amount);
                return self.create_concat(&partial, &zero);
            }
        }
        self.next().create_shl(l, r)
    }

    fn create_lshr(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if l.is_zero() {
            return l.clone();
        }
        if let Some(amount) = r.value() {
            let amount = amount.limited_value();
            if amount == 0 {
                return l.clone();
            }
            if amount >= l.bits() as u64 {
                return self.create_constant(BitVec::zero(l.bits()));
            }
            if amount % 8 == 0 {
                let amount = amount as u32;
                let zero = self.create_constant(BitVec::zero(amount));
                let partial = self.create_extract(l, amount, l.bits() - amount);
                return self.create_concat(&zero, &partial);
            }
        }
        self.next().create_lshr(l, r)
    }

    fn create_ashr(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some(amount) = r.value() {
            if amount.is_zero() {
                return l.clone();
            }
        }
        self.next().create_ashr(l, r)
    }

    fn create_equal(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some(b) = l.bool_value() {
            return if b { r.clone() } else { self.create_lnot(r) };
        }
        self.next().create_equal(l, r)
    }
}

// ---------------------------------------------------------------------------
// Symbolic stage

pub struct SymbolicBuilder {
    next: Rc<dyn ExprBuilder>,
}

/// Whether `e` can be re-created at a narrower width without changing the
/// low `bits` of its value.
fn can_evaluate_truncated(e: &ExprRef, bits: u32, depth: u32) -> bool {
    if depth > 1 {
        return false;
    }
    match e.kind() {
        Kind::Mul => {
            can_evaluate_truncated(e.left(), bits, depth + 1)
                && can_evaluate_truncated(e.right(), bits, depth + 1)
        }
        Kind::UDiv | Kind::URem => {
            let high_bits = e.bits() - bits;
            e.left().count_leading_zeros() >= high_bits
                && e.right().count_leading_zeros() >= high_bits
                && can_evaluate_truncated(e.left(), bits, depth + 1)
                && can_evaluate_truncated(e.right(), bits, depth + 1)
        }
        Kind::ZExt | Kind::SExt | Kind::Constant | Kind::Concat => true,
        _ => false,
    }
}

fn evaluate_in_different_type(
    builder: &SymbolicBuilder,
    op: &ExprRef,
    index: u32,
    bits: u32,
) -> Option<ExprRef> {
    match op.kind() {
        Kind::Mul | Kind::UDiv | Kind::URem => {
            let l = builder.create_extract(op.left(), index, bits);
            let r = builder.create_extract(op.right(), index, bits);
            Some(builder.create_binary_expr(op.kind(), &l, &r))
        }
        _ => None,
    }
}

impl SymbolicBuilder {
    pub fn new(next: Rc<dyn ExprBuilder>) -> Self {
        SymbolicBuilder { next }
    }

    /// `A | B` or `A + B` where no bit position can be set on both sides
    /// becomes a concat of the live slices.
    fn simplify_exclusive(&self, l: &ExprRef, r: &ExprRef) -> Option<ExprRef> {
        for i in 0..l.bits() {
            if !is_zero_bit(l, i) && !is_zero_bit(r, i) {
                return None;
            }
        }

        let mut slices = VecDeque::new();
        let mut i = 0;
        while i < l.bits() {
            let start = i;
            while i < l.bits() && is_zero_bit(l, i) {
                i += 1
            }
            if i != start {
                slices.push_front(self.create_extract(r, start, i - start))
            }
            let start = i;
            while i < r.bits() && is_zero_bit(r, i) {
                i += 1
            }
            if i != start {
                slices.push_front(self.create_extract(l, start, i - start))
            }
        }

        let slices: Vec<ExprRef> = slices.into_iter().collect();
        Some(self.create_concat_list(&slices))
    }

    fn add_const_sym(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        match r.kind() {
            Kind::Add => {
                // C0 + (C1 + x) => (C0 + C1) + x
                if r.left().is_constant() {
                    return self.create_add(&self.create_add(l, r.left()), r.right());
                }
                // C0 + (x + C1) => (C0 + C1) + x
                if r.right().is_constant() {
                    return self.create_add(&self.create_add(l, r.right()), r.left());
                }
            }
            Kind::Sub => {
                // C0 + (C1 - x) => (C0 + C1) - x
                if r.left().is_constant() {
                    return self.create_sub(&self.create_add(l, r.left()), r.right());
                }
                // C0 + (x - C1) => (C0 - C1) + x
                if r.right().is_constant() {
                    return self.create_add(&self.create_sub(l, r.right()), r.left());
                }
            }
            _ => (),
        }
        self.next().create_add(l, r)
    }

    fn add_sym_sym(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if Rc::ptr_eq(l, r) {
            // x + x => 2 * x
            let two = self.create_constant(BitVec::from_u64(2, l.bits()));
            return self.create_mul(&two, l);
        }

        // Sums sitting on the left swap over so the right-hand patterns
        // below see them.
        let (l, r) = match l.kind() {
            Kind::Add | Kind::Sub => (r, l),
            _ => (l, r),
        };

        match r.kind() {
            Kind::Add => {
                // x + (C0 + y) => C0 + (x + y)
                if r.left().is_constant() {
                    return self.create_add(r.left(), &self.create_add(l, r.right()));
                }
                if r.right().is_constant() {
                    return self.create_add(r.right(), &self.create_add(l, r.left()));
                }
            }
            Kind::Sub => {
                // x + (C0 - y) => C0 + (x - y)
                if r.left().is_constant() {
                    return self.create_add(r.left(), &self.create_sub(l, r.right()));
                }
                // x + (y - C0) => -C0 + (x + y)
                if r.right().is_constant() {
                    return self.create_add(&self.create_neg(r.right()), &self.create_add(l, r.left()));
                }
            }
            _ => (),
        }
        self.next().create_add(l, r)
    }

    fn sub_const_sym(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        match r.kind() {
            Kind::Add => {
                // C0 - (C1 + x) => (C0 - C1) - x
                if r.left().is_constant() {
                    return self.create_sub(&self.create_sub(l, r.left()), r.right());
                }
                if r.right().is_constant() {
                    return self.create_sub(&self.create_sub(l, r.right()), r.left());
                }
            }
            Kind::Sub => {
                // C0 - (C1 - x) => (C0 - C1) + x
                if r.left().is_constant() {
                    return self.create_add(&self.create_sub(l, r.left()), r.right());
                }
                // C0 - (x - C1) => (C0 + C1) - x
                if r.right().is_constant() {
                    return self.create_sub(&self.create_add(l, r.right()), r.left());
                }
            }
            _ => (),
        }
        self.next().create_sub(l, r)
    }

    fn sub_sym_sym(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        // x - x => 0
        if Rc::ptr_eq(l, r) {
            return self.create_constant(BitVec::zero(l.bits()));
        }

        match l.kind() {
            Kind::Add if l.left().is_constant() => {
                // (C + y) - z => C + (y - z)
                return self.create_add(l.left(), &self.create_sub(l.right(), r));
            }
            Kind::Sub if l.left().is_constant() => {
                // (C - y) - z => C - (y + z)
                return self.create_sub(l.left(), &self.create_add(l.right(), r));
            }
            _ => (),
        }

        match r.kind() {
            Kind::Add => {
                // x - (C0 + y) => -C0 + (x - y)
                if r.left().is_constant() {
                    return self.create_add(&self.create_neg(r.left()), &self.create_sub(l, r.right()));
                }
                if r.right().is_constant() {
                    return self.create_add(&self.create_neg(r.right()), &self.create_sub(l, r.left()));
                }
            }
            Kind::Sub => {
                // x - (C0 - y) => -C0 + (x + y)
                if r.left().is_constant() {
                    return self.create_add(&self.create_neg(r.left()), &self.create_add(l, r.right()));
                }
                // x - (y - C0) => C0 + (x - y)
                if r.right().is_constant() {
                    return self.create_add(r.right(), &self.create_sub(l, r.left()));
                }
            }
            _ => (),
        }
        self.next().create_sub(l, r)
    }

    fn mul_const_sym(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        // C0 * (C1 * x) => (C0 * C1) * x
        if r.kind() == Kind::Mul && r.left().is_constant() {
            return self.create_mul(&self.create_mul(l, r.left()), r.right());
        }
        // C0 * (C1 + x) => C0 * C1 + C0 * x
        if r.kind() == Kind::Add && r.left().is_constant() {
            return self.create_add(&self.create_mul(l, r.left()), &self.create_mul(l, r.right()));
        }
        self.next().create_mul(l, r)
    }

    /// The `(x / C0) / C1 => x / (C0 * C1)` rewrite is only sound when the
    /// product does not wrap.
    fn divisor_product_fits(&self, c0: &BitVec, c1: &BitVec, signed: bool) -> bool {
        if signed {
            let product = c0.signed_value() * c1.signed_value();
            BitVec::from_bigint(&product, c0.len()).signed_value() == product
        } else {
            let product = c0.unsigned_value() * c1.unsigned_value();
            *BitVec::new(product.clone(), c0.len()).unsigned_value() == product
        }
    }

    fn sdiv_sym_const(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        // x /s -1 => -x
        if r.is_all_ones() {
            return self.create_neg(l);
        }

        // SExt(x) /s y with y active in x's width => SExt(x /s y). The
        // divisor -1 would be the only wrinkle and is already handled.
        if l.kind() == Kind::SExt {
            let x = l.child(0);
            if x.bits() >= r.value().map_or(u32::MAX, BitVec::active_bits) {
                let narrow = self.create_sdiv(x, &self.create_extract(r, 0, x.bits()));
                return self.create_sext(&narrow, l.bits());
            }
        }

        // (x /s C0) /s C1 => x /s (C0 * C1)
        if l.kind() == Kind::SDiv {
            if let (Some(c0), Some(c1)) = (l.right().value(), r.value()) {
                if self.divisor_product_fits(c0, c1, true) {
                    return self.create_sdiv(l.left(), &self.create_mul(l.right(), r));
                }
            }
        }
        self.next().create_sdiv(l, r)
    }

    fn udiv_sym_const(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        // Concat(0, x) /u y with y active in x's width
        // => Concat(0, x /u Extract(y, 0, |x|))
        if l.kind() == Kind::Concat && l.left().is_zero() {
            let x = l.right();
            if r.value().map_or(false, |c| c.active_bits() <= x.bits()) {
                let narrow = self.create_udiv(x, &self.create_extract(r, 0, x.bits()));
                return self.create_concat(l.left(), &narrow);
            }
        }

        // (x /u C0) /u C1 => x /u (C0 * C1)
        if l.kind() == Kind::UDiv {
            if let (Some(c0), Some(c1)) = (l.right().value(), r.value()) {
                if self.divisor_product_fits(c0, c1, false) {
                    return self.create_udiv(l.left(), &self.create_mul(l.right(), r));
                }
            }
        }
        self.next().create_udiv(l, r)
    }

    fn bitwise_concat_pair(
        &self,
        l: &ExprRef,
        r: &ExprRef,
        rebuild: impl Fn(&Self, &ExprRef, &ExprRef) -> ExprRef,
    ) -> Option<ExprRef> {
        // Concat(x, y) op Concat(w, v) => Concat(x op w, y op v) when the
        // boundaries line up.
        if l.kind() == Kind::Concat
            && r.kind() == Kind::Concat
            && l.left().bits() == r.left().bits()
        {
            let upper = rebuild(self, l.left(), r.left());
            let lower = rebuild(self, l.right(), r.right());
            return Some(self.create_concat(&upper, &lower));
        }
        None
    }
}

impl ExprBuilder for SymbolicBuilder {
    fn next(&self) -> &dyn ExprBuilder {
        &*self.next
    }

    fn create_concat(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        // Concat(C0, Concat(C1, y)) => Concat(C0 ++ C1, y)
        if r.kind() == Kind::Concat && l.is_constant() && r.left().is_constant() {
            return self.create_concat(&self.create_concat(l, r.left()), r.right());
        }

        // Right-associate: Concat(Concat(x, y), z) => Concat(x, Concat(y, z))
        if l.kind() == Kind::Concat {
            return self.create_concat(l.left(), &self.create_concat(l.right(), r));
        }

        self.next().create_concat(l, r)
    }

    fn create_extract(&self, e: &ExprRef, index: u32, bits: u32) -> ExprRef {
        // Byte-wise re-creation of the operation at the narrower width.
        if index == 0 && bits % 8 == 0 && can_evaluate_truncated(e, bits, 0) {
            if let Some(narrowed) = evaluate_in_different_type(self, e, index, bits) {
                return narrowed;
            }
        }
        self.next().create_extract(e, index, bits)
    }

    fn create_add(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some(e) = self.simplify_exclusive(l, r) {
            return e;
        }
        if !r.is_constant() {
            if l.is_constant() {
                return self.add_const_sym(l, r);
            }
            return self.add_sym_sym(l, r);
        }
        self.next().create_add(l, r)
    }

    fn create_sub(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if !r.is_constant() {
            if l.is_constant() {
                return self.sub_const_sym(l, r);
            }
            return self.sub_sym_sym(l, r);
        }
        self.next().create_sub(l, r)
    }

    fn create_mul(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if !r.is_constant() && l.is_constant() {
            return self.mul_const_sym(l, r);
        }
        self.next().create_mul(l, r)
    }

    fn create_sdiv(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if !l.is_constant() && r.is_constant() {
            return self.sdiv_sym_const(l, r);
        }
        self.next().create_sdiv(l, r)
    }

    fn create_udiv(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if !l.is_constant() && r.is_constant() {
            return self.udiv_sym_const(l, r);
        }
        self.next().create_udiv(l, r)
    }

    fn create_and(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if !r.is_constant() && !l.is_constant() {
            // x & x => x
            if Rc::ptr_eq(l, r) {
                return l.clone();
            }
            if let Some(e) = self.bitwise_concat_pair(l, r, |b, l, r| b.create_and(l, r)) {
                return e;
            }
        }
        self.next().create_and(l, r)
    }

    fn create_or(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some(e) = self.simplify_exclusive(l, r) {
            return e;
        }
        if !r.is_constant() {
            if l.is_constant() {
                // C0 | Concat(x, y) => Concat(C0_hi | x, C0_lo | y)
                if r.kind() == Kind::Concat {
                    let upper = self.create_or(
                        &self.create_extract(l, r.right().bits(), r.left().bits()),
                        r.left(),
                    );
                    let lower = self.create_or(&self.create_extract(l, 0, r.right().bits()), r.right());
                    return self.create_concat(&upper, &lower);
                }
            } else {
                // x | x => x
                if Rc::ptr_eq(l, r) {
                    return l.clone();
                }
                if let Some(e) = self.bitwise_concat_pair(l, r, |b, l, r| b.create_or(l, r)) {
                    return e;
                }
            }
        }
        self.next().create_or(l, r)
    }

    fn create_xor(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        // x ^ x => 0
        if !l.is_constant() && !r.is_constant() && Rc::ptr_eq(l, r) {
            return self.create_constant(BitVec::zero(l.bits()));
        }
        self.next().create_xor(l, r)
    }

    fn create_equal(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if Rc::ptr_eq(l, r) {
            return self.create_true();
        }
        self.next().create_equal(l, r)
    }

    fn create_distinct(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        self.create_lnot(&self.create_equal(l, r))
    }

    fn create_lor(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some(b) = l.bool_value() {
            return if b { self.create_true() } else { r.clone() };
        }
        if let Some(b) = r.bool_value() {
            return if b { self.create_true() } else { l.clone() };
        }
        self.next().create_lor(l, r)
    }

    fn create_land(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        if let Some(b) = l.bool_value() {
            return if b { r.clone() } else { self.create_false() };
        }
        if let Some(b) = r.bool_value() {
            return if b { l.clone() } else { self.create_false() };
        }
        self.next().create_land(l, r)
    }

    fn create_lnot(&self, e: &ExprRef) -> ExprRef {
        if let Some(b) = e.bool_value() {
            return self.create_bool(!b);
        }
        if e.kind() == Kind::LNot {
            return e.child(0).clone();
        }
        self.next().create_lnot(e)
    }

    fn create_ite(&self, cond: &ExprRef, then_expr: &ExprRef, else_expr: &ExprRef) -> ExprRef {
        if let Some(b) = cond.bool_value() {
            return if b { then_expr.clone() } else { else_expr.clone() };
        }
        if cond.kind() == Kind::LNot {
            return self.create_ite(cond.child(0), else_expr, then_expr);
        }
        self.next().create_ite(cond, then_expr, else_expr)
    }
}

// ---------------------------------------------------------------------------
// Commutative stage

pub struct CommutativeBuilder {
    next: Rc<dyn ExprBuilder>,
}

impl CommutativeBuilder {
    pub fn new(next: Rc<dyn ExprBuilder>) -> Self {
        CommutativeBuilder { next }
    }
}

fn swappable(l: &ExprRef, r: &ExprRef) -> bool {
    !l.is_constant() && r.is_constant()
}

macro_rules! commute {
    ($($method:ident),* $(,)?) => {
        $(fn $method(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
            if swappable(l, r) {
                return self.$method(r, l);
            }
            self.next().$method(l, r)
        })*
    };
}

macro_rules! commute_compare {
    ($($method:ident => $mirror:ident),* $(,)?) => {
        $(fn $method(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
            if swappable(l, r) {
                return self.$mirror(r, l);
            }
            self.next().$method(l, r)
        })*
    };
}

impl ExprBuilder for CommutativeBuilder {
    fn next(&self) -> &dyn ExprBuilder {
        &*self.next
    }

    fn create_sub(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
        // x - C0 => -C0 + x
        if swappable(l, r) {
            return self.create_add(&self.create_neg(r), l);
        }
        self.next().create_sub(l, r)
    }

    commute! {
        create_add, create_mul, create_and, create_or, create_xor,
        create_equal, create_distinct, create_land, create_lor,
    }

    commute_compare! {
        create_ult => create_ugt,
        create_ule => create_uge,
        create_ugt => create_ult,
        create_uge => create_ule,
        create_slt => create_sgt,
        create_sle => create_sge,
        create_sgt => create_slt,
        create_sge => create_sle,
    }
}

// ---------------------------------------------------------------------------
// Prune stage

pub struct PruneBuilder {
    next: Rc<dyn ExprBuilder>,
    call_stack: Rc<RefCell<CallStackManager>>,
    inputs: Rc<Vec<u8>>,
}

impl PruneBuilder {
    pub fn new(
        next: Rc<dyn ExprBuilder>,
        call_stack: Rc<RefCell<CallStackManager>>,
        inputs: Rc<Vec<u8>>,
    ) -> Self {
        PruneBuilder { next, call_stack, inputs }
    }

    fn prune(&self, e: ExprRef) -> ExprRef {
        let mut call_stack = self.call_stack.borrow_mut();
        call_stack.update_bitmap();
        if call_stack.is_interesting() {
            e
        } else {
            e.evaluate(&self.inputs)
        }
    }
}

macro_rules! prune_unary {
    ($($method:ident),* $(,)?) => {
        $(fn $method(&self, e: &ExprRef) -> ExprRef {
            let e = self.next().$method(e);
            self.prune(e)
        })*
    };
}

macro_rules! prune_binary {
    ($($method:ident),* $(,)?) => {
        $(fn $method(&self, l: &ExprRef, r: &ExprRef) -> ExprRef {
            let e = self.next().$method(l, r);
            self.prune(e)
        })*
    };
}

impl ExprBuilder for PruneBuilder {
    fn next(&self) -> &dyn ExprBuilder {
        &*self.next
    }

    fn create_zext(&self, e: &ExprRef, bits: u32) -> ExprRef {
        let e = self.next().create_zext(e, bits);
        self.prune(e)
    }

    fn create_sext(&self, e: &ExprRef, bits: u32) -> ExprRef {
        let e = self.next().create_sext(e, bits);
        self.prune(e)
    }

    fn create_ite(&self, cond: &ExprRef, then_expr: &ExprRef, else_expr: &ExprRef) -> ExprRef {
        let e = self.next().create_ite(cond, then_expr, else_expr);
        self.prune(e)
    }

    prune_unary! { create_neg, create_not }

    // Relational kinds (compares and the logical connectives) are never
    // pruned: concretizing them would silently drop path constraints.

    prune_binary! {
        create_add, create_sub, create_mul, create_udiv, create_sdiv,
        create_urem, create_srem, create_and, create_or, create_xor,
        create_shl, create_lshr, create_ashr,
    }
}

// ---------------------------------------------------------------------------
// Concrete evaluation

thread_local! {
    static EVAL_BUILDER: Rc<dyn ExprBuilder> = folding_chain();
}

impl Expr {
    /// The concrete value of this expression under the current input, as a
    /// `Constant` (or `Bool`) node. Cached until invalidated. Already
    /// concrete leaves evaluate to themselves without touching the cache,
    /// which would otherwise pin them through a self-reference.
    pub fn evaluate(self: &Rc<Self>, inputs: &[u8]) -> ExprRef {
        if self.is_constant() || self.is_bool() {
            return self.clone();
        }
        if let Some(cached) = self.cached_evaluation() {
            return cached;
        }
        let result = self.evaluate_impl(inputs);
        if !result.is_constant() && !result.is_bool() {
            fatal!("evaluation produced a symbolic result for {}", self);
        }
        self.set_cached_evaluation(result.clone());
        result
    }

    fn evaluate_impl(self: &Rc<Self>, inputs: &[u8]) -> ExprRef {
        EVAL_BUILDER.with(|builder| match self.kind() {
            Kind::Read => {
                let index = self.read_index().unwrap();
                match inputs.get(index) {
                    Some(&byte) => builder.create_constant(BitVec::from_u64(byte as u64, 8)),
                    None => fatal!("read of input byte {} past the input length", index),
                }
            }
            Kind::Extract => builder.create_extract(
                &self.child(0).evaluate(inputs),
                self.extract_index(),
                self.bits(),
            ),
            Kind::ZExt => builder.create_zext(&self.child(0).evaluate(inputs), self.bits()),
            Kind::SExt => builder.create_sext(&self.child(0).evaluate(inputs), self.bits()),
            Kind::Concat => builder.create_concat(
                &self.child(0).evaluate(inputs),
                &self.child(1).evaluate(inputs),
            ),
            Kind::Ite => {
                let cond = self.child(0).evaluate(inputs);
                builder.create_ite(
                    &cond,
                    &self.child(1).evaluate(inputs),
                    &self.child(2).evaluate(inputs),
                )
            }
            Kind::Neg | Kind::Not | Kind::LNot => {
                builder.create_unary_expr(self.kind(), &self.child(0).evaluate(inputs))
            }
            kind => builder.create_binary_expr(
                kind,
                &self.child(0).evaluate(inputs),
                &self.child(1).evaluate(inputs),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::equal_deep;

    fn chain() -> Rc<dyn ExprBuilder> {
        symbolic_chain(&new_read_registry())
    }

    #[test]
    fn read_leaves_are_memoized() {
        let b = chain();
        assert!(Rc::ptr_eq(&b.create_read(3), &b.create_read(3)));
        assert!(!Rc::ptr_eq(&b.create_read(3), &b.create_read(4)));
    }

    #[test]
    fn constant_folding_matches_reference_semantics() {
        let b = chain();
        let l = b.create_constant_u64(0xff, 8);
        let r = b.create_constant_u64(0x02, 8);
        let sum = b.create_add(&l, &r);
        assert_eq!(sum.value(), Some(&BitVec::from_u64(0x01, 8)));
        assert!(sum.children().is_empty());

        let cmp = b.create_ult(&l, &r);
        assert_eq!(cmp.bool_value(), Some(false));
    }

    #[test]
    fn division_by_zero_stays_symbolic() {
        let b = chain();
        let l = b.create_constant_u64(4, 8);
        let zero = b.create_constant_u64(0, 8);
        let div = b.create_udiv(&l, &zero);
        assert_eq!(div.kind(), Kind::UDiv);
    }

    #[test]
    fn cache_returns_identical_references() {
        let b = chain();
        let x = b.create_read(0);
        let y = b.create_read(1);
        let first = b.create_add(&x, &y);
        let second = b.create_add(&x, &y);
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn addition_is_canonicalized() {
        let b = chain();
        let x = b.create_read(0);
        let c = b.create_constant_u64(0x10, 8);
        let e = b.create_add(&x, &c);
        // Add(x, C) must come out as Add(C, x).
        assert_eq!(e.kind(), Kind::Add);
        assert!(e.left().is_constant());
        assert!(Rc::ptr_eq(e.right(), &x));
    }

    #[test]
    fn nested_constants_are_pulled_out() {
        let b = chain();
        let x = b.create_read(0);
        let c1 = b.create_constant_u64(0x10, 8);
        let c2 = b.create_constant_u64(0x20, 8);
        // (x + C1) + C2 => (C1 + C2) + x
        let e = b.create_add(&b.create_add(&x, &c1), &c2);
        assert_eq!(e.kind(), Kind::Add);
        assert_eq!(e.left().value(), Some(&BitVec::from_u64(0x30, 8)));
        assert!(Rc::ptr_eq(e.right(), &x));
    }

    #[test]
    fn sub_becomes_negated_add() {
        let b = chain();
        let x = b.create_read(0);
        let c = b.create_constant_u64(1, 8);
        // x - 1 => 0xff + x
        let e = b.create_sub(&x, &c);
        assert_eq!(e.kind(), Kind::Add);
        assert_eq!(e.left().value(), Some(&BitVec::from_u64(0xff, 8)));
    }

    #[test]
    fn self_cancellation() {
        let b = chain();
        let x = b.create_read(0);
        assert!(b.create_sub(&x, &x).is_zero());
        assert!(b.create_xor(&x, &x).is_zero());
        assert!(Rc::ptr_eq(&b.create_and(&x, &x), &x));
        assert!(Rc::ptr_eq(&b.create_or(&x, &x), &x));
        let sum = b.create_add(&x, &x);
        assert_eq!(sum.kind(), Kind::Mul);
        assert_eq!(sum.left().value(), Some(&BitVec::from_u64(2, 8)));
    }

    #[test]
    fn extract_of_concat_selects_the_half() {
        let b = chain();
        let x = b.create_read(0);
        let y = b.create_read(1);
        let concat = b.create_concat(&x, &y);
        assert!(Rc::ptr_eq(&b.create_extract(&concat, 0, 8), &y));
        assert!(Rc::ptr_eq(&b.create_extract(&concat, 8, 8), &x));
    }

    #[test]
    fn concat_of_adjacent_extracts_merges() {
        let b = chain();
        // Extracts of an addition do not simplify away, so the
        // adjacent-extract rule is what has to fire here.
        let w = b.create_add(
            &b.create_zext(&b.create_read(0), 16),
            &b.create_zext(&b.create_read(1), 16),
        );
        let lo = b.create_extract(&w, 0, 8);
        let hi = b.create_extract(&w, 8, 8);
        assert_eq!(lo.kind(), Kind::Extract);
        // Reassembling the halves gives back the full expression.
        assert!(Rc::ptr_eq(&b.create_concat(&hi, &lo), &w));
    }

    #[test]
    fn zext_identities() {
        let b = chain();
        let x = b.create_read(0);
        assert!(Rc::ptr_eq(&b.create_zext(&x, 8), &x));
        let wide = b.create_zext(&x, 32);
        assert_eq!(wide.bits(), 32);
        // Extract(ZExt(x), 0, |x|) == x
        assert!(Rc::ptr_eq(&b.create_extract(&wide, 0, 8), &x));
        // The extension bits are zero.
        let high = b.create_extract(&wide, 8, 8);
        assert!(high.is_zero());
    }

    #[test]
    fn byte_aligned_shift_becomes_concat() {
        let b = chain();
        let x = b.create_read(0);
        let wide = b.create_concat(&b.create_read(1), &x);
        let k = b.create_constant_u64(8, 16);
        let shifted = b.create_shl(&wide, &k);
        let expected = b.create_concat(&b.create_extract(&wide, 0, 8), &b.create_constant_u64(0, 8));
        assert!(equal_deep(&shifted, &expected));

        let over = b.create_shl(&wide, &b.create_constant_u64(16, 16));
        assert!(over.is_zero());
    }

    #[test]
    fn identity_and_absorbing_elements() {
        let b = chain();
        let x = b.create_read(0);
        let zero = b.create_constant_u64(0, 8);
        let ones = b.create_constant_u64(0xff, 8);
        assert!(Rc::ptr_eq(&b.create_add(&zero, &x), &x));
        assert!(b.create_mul(&x, &zero).is_zero());
        assert!(b.create_and(&zero, &x).is_zero());
        assert!(Rc::ptr_eq(&b.create_and(&ones, &x), &x));
        assert!(Rc::ptr_eq(&b.create_or(&zero, &x), &x));
        assert!(b.create_or(&ones, &x).is_all_ones());
        assert!(Rc::ptr_eq(&b.create_xor(&x, &zero), &x));
    }

    #[test]
    fn comparisons_swap_around_constants() {
        let b = chain();
        let x = b.create_read(0);
        let c = b.create_constant_u64(0x10, 8);
        // x <u C => C >u x
        let e = b.create_ult(&x, &c);
        assert_eq!(e.kind(), Kind::Ugt);
        assert!(e.left().is_constant());
        assert!(Rc::ptr_eq(e.right(), &x));
    }

    #[test]
    fn logical_short_circuits() {
        let b = chain();
        let x = b.create_read(0);
        let c = b.create_constant_u64(1, 8);
        let cond = b.create_equal(&x, &c);
        assert!(Rc::ptr_eq(&b.create_land(&b.create_true(), &cond), &cond));
        assert_eq!(b.create_land(&cond, &b.create_false()).bool_value(), Some(false));
        assert_eq!(b.create_lor(&b.create_true(), &cond).bool_value(), Some(true));
        assert!(Rc::ptr_eq(&b.create_lnot(&b.create_lnot(&cond)), &cond));
    }

    #[test]
    fn equal_against_bool_simplifies() {
        let b = chain();
        let x = b.create_read(0);
        let c = b.create_constant_u64(1, 8);
        let cond = b.create_equal(&x, &c);
        assert!(Rc::ptr_eq(&b.create_equal(&b.create_true(), &cond), &cond));
        assert_eq!(b.create_equal(&b.create_false(), &cond).kind(), Kind::LNot);
    }

    #[test]
    fn ite_simplifications() {
        let b = chain();
        let x = b.create_read(0);
        let y = b.create_read(1);
        let c = b.create_constant_u64(1, 8);
        let cond = b.create_equal(&x, &c);
        assert!(Rc::ptr_eq(&b.create_ite(&b.create_true(), &x, &y), &x));
        let flipped = b.create_ite(&b.create_lnot(&cond), &x, &y);
        assert_eq!(flipped.kind(), Kind::Ite);
        assert!(Rc::ptr_eq(flipped.child(0), &cond));
        assert!(Rc::ptr_eq(flipped.child(1), &y));
    }

    #[test]
    fn sdiv_by_minus_one_negates() {
        let b = chain();
        let x = b.create_read(0);
        let minus_one = b.create_constant_u64(0xff, 8);
        let e = b.create_sdiv(&x, &minus_one);
        assert_eq!(e.kind(), Kind::Neg);
        assert!(Rc::ptr_eq(e.child(0), &x));
    }

    #[test]
    fn nested_division_constants_combine_with_overflow_gate() {
        let b = chain();
        let x = b.create_zext(&b.create_read(0), 16);
        let c4 = b.create_constant_u64(4, 16);
        let c8 = b.create_constant_u64(8, 16);
        let e = b.create_udiv(&b.create_udiv(&x, &c4), &c8);
        assert_eq!(e.kind(), Kind::UDiv);
        assert_eq!(e.right().value(), Some(&BitVec::from_u64(32, 16)));
        // Overflowing product must not be combined.
        let big = b.create_constant_u64(0x8000, 16);
        let e = b.create_udiv(&b.create_udiv(&x, &big), &big);
        assert_eq!(e.kind(), Kind::UDiv);
        assert_eq!(e.left().kind(), Kind::UDiv);
    }

    #[test]
    fn udiv_of_zero_concat_narrows() {
        let b = chain();
        let x = b.create_concat(&b.create_constant_u64(0, 8), &b.create_read(0));
        let e = b.create_udiv(&x, &b.create_constant_u64(3, 16));
        assert_eq!(e.kind(), Kind::Concat);
        assert!(e.left().is_zero());
        assert_eq!(e.right().kind(), Kind::UDiv);
    }

    #[test]
    fn disjoint_or_becomes_concat() {
        let b = chain();
        let lo = b.create_zext(&b.create_read(0), 16);
        let hi = b.create_shl(&b.create_zext(&b.create_read(1), 16), &b.create_constant_u64(8, 16));
        let e = b.create_or(&hi, &lo);
        assert_eq!(e.kind(), Kind::Concat);
        assert_eq!(e.bits(), 16);
    }

    #[test]
    fn truncation_narrows_multiplication() {
        let b = chain();
        let x = b.create_zext(&b.create_read(0), 32);
        let y = b.create_zext(&b.create_read(1), 32);
        let product = b.create_mul(&x, &y);
        let narrow = b.create_extract(&product, 0, 8);
        assert_eq!(narrow.kind(), Kind::Mul);
        assert_eq!(narrow.bits(), 8);
    }

    #[test]
    fn pruned_context_concretizes() {
        let reads = new_read_registry();
        let call_stack = Rc::new(RefCell::new(CallStackManager::new()));
        let inputs = Rc::new(vec![0x41u8, 0x02]);
        let b = pruning_chain(&reads, &call_stack, &inputs);

        // First visit of the context: expressions stay symbolic.
        call_stack.borrow_mut().visit_basic_block(0x1000);
        let x = b.create_read(0);
        let y = b.create_read(1);
        let sum = b.create_add(&x, &y);
        assert_eq!(sum.kind(), Kind::Add);

        // Re-entering the same context prunes to the concrete value.
        call_stack.borrow_mut().visit_basic_block(0x1000);
        let pruned = b.create_add(&x, &y);
        assert_eq!(pruned.value(), Some(&BitVec::from_u64(0x43, 8)));

        // Comparisons survive pruning.
        call_stack.borrow_mut().visit_basic_block(0x1000);
        let cmp = b.create_equal(&x, &y);
        assert_eq!(cmp.kind(), Kind::Equal);
    }

    #[test]
    fn evaluation_uses_the_input() {
        let b = chain();
        let inputs = [0x41u8, 0x01];
        let x = b.create_read(0);
        let wide = b.create_zext(&x, 16);
        let sum = b.create_add(&wide, &b.create_constant_u64(1, 16));
        let value = sum.evaluate(&inputs);
        assert_eq!(value.value(), Some(&BitVec::from_u64(0x42, 16)));
    }
}
