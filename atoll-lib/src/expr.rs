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

//! The symbolic expression DAG. Expressions are immutable in shape and
//! shared between all the places that reference them; parents own their
//! children strongly ([ExprRef] is an `Rc`) while children keep weak
//! back-references to their parents so that concreteness changes and cache
//! invalidation can propagate upward without creating reference cycles.
//!
//! All the mutable per-node state (concreteness, cached hash, cached SMT
//! form, cached evaluation, range sets) lives behind interior mutability;
//! the runtime is strictly single-threaded.

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use crate::concrete::BitVec;
use crate::fatal;
use crate::range::RangeSet;
use crate::smt::Ast;

/// Hard cap on the reported depth of an expression; algorithms that recurse
/// by depth treat anything at the cap as opaque.
pub const MAX_DEPTH: u32 = 100;

pub type ExprRef = Rc<Expr>;
pub type WeakExprRef = Weak<Expr>;
pub type DependencySet = BTreeSet<usize>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Bool,
    Constant,
    Read,
    Concat,
    Extract,
    ZExt,
    SExt,
    // Arithmetic
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    Neg,
    // Bit
    Not,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    // Compare
    Equal,
    Distinct,
    Ult,
    Ule,
    Ugt,
    Uge,
    Slt,
    Sle,
    Sgt,
    Sge,
    // Logical
    LOr,
    LAnd,
    LNot,
    // Special
    Ite,
}

impl Kind {
    pub fn is_compare(self) -> bool {
        use Kind::*;
        matches!(self, Equal | Distinct | Ult | Ule | Ugt | Uge | Slt | Sle | Sgt | Sge)
    }
}

/// The mirrored comparison, for moving a constant to the canonical side.
pub fn swap_kind(kind: Kind) -> Kind {
    use Kind::*;
    match kind {
        Equal => Equal,
        Distinct => Distinct,
        Ult => Ugt,
        Ule => Uge,
        Ugt => Ult,
        Uge => Ule,
        Slt => Sgt,
        Sle => Sge,
        Sgt => Slt,
        Sge => Sle,
        _ => fatal!("swap_kind on non-comparison {:?}", kind),
    }
}

/// The comparison holding on the untaken side of a branch.
pub fn negate_kind(kind: Kind) -> Kind {
    use Kind::*;
    match kind {
        Equal => Distinct,
        Distinct => Equal,
        Ult => Uge,
        Ule => Ugt,
        Ugt => Ule,
        Uge => Ult,
        Slt => Sge,
        Sle => Sgt,
        Sgt => Sle,
        Sge => Slt,
        _ => fatal!("negate_kind on non-comparison {:?}", kind),
    }
}

/// True for expressions that are valid branch conditions.
pub fn is_relational(e: &Expr) -> bool {
    e.kind().is_compare() || matches!(e.kind(), Kind::LOr | Kind::LAnd | Kind::LNot)
}

/// Kind-specific data carried alongside the common header.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Payload {
    None,
    Bool(bool),
    Constant(BitVec),
    Read(usize),
    /// Low bit index of an `Extract`; the width is the node's `bits`.
    Extract(u32),
}

pub struct Expr {
    kind: Kind,
    bits: u32,
    children: Vec<ExprRef>,
    payload: Payload,

    concrete: Cell<bool>,
    invalidated: Cell<bool>,
    hash: Cell<Option<u32>>,
    depth: Cell<Option<u32>>,
    leading_zeros: Cell<Option<u32>>,
    deps: OnceCell<DependencySet>,
    uses: RefCell<Vec<WeakExprRef>>,
    smt: RefCell<Option<Ast>>,
    evaluation: RefCell<Option<ExprRef>>,
    // signed at index 0, unsigned at index 1
    range_sets: [RefCell<Option<RangeSet>>; 2],
}

impl Expr {
    pub(crate) fn new(kind: Kind, bits: u32, children: Vec<ExprRef>, payload: Payload) -> Expr {
        use Kind::*;
        assert!(bits >= 1);
        match kind {
            Bool | Constant | Read => assert!(children.is_empty()),
            Concat => {
                assert_eq!(children.len(), 2);
                assert_eq!(bits, children[0].bits() + children[1].bits())
            }
            Extract => {
                assert_eq!(children.len(), 1);
                match payload {
                    Payload::Extract(low) => assert!(low + bits <= children[0].bits()),
                    _ => fatal!("Extract without an index"),
                }
            }
            ZExt | SExt => {
                assert_eq!(children.len(), 1);
                assert!(bits >= children[0].bits())
            }
            Neg | Not | LNot => assert_eq!(children.len(), 1),
            Ite => {
                assert_eq!(children.len(), 3);
                assert_eq!(children[1].bits(), children[2].bits());
                assert_eq!(bits, children[1].bits())
            }
            _ => {
                assert_eq!(children.len(), 2);
                assert_eq!(children[0].bits(), children[1].bits());
                if kind.is_compare() {
                    assert_eq!(bits, 1)
                } else {
                    assert_eq!(bits, children[0].bits())
                }
            }
        }

        let concrete = kind != Read && children.iter().all(|c| c.is_concrete());

        Expr {
            kind,
            bits,
            children,
            payload,
            concrete: Cell::new(concrete),
            invalidated: Cell::new(false),
            hash: Cell::new(None),
            depth: Cell::new(None),
            leading_zeros: Cell::new(None),
            deps: OnceCell::new(),
            uses: RefCell::new(Vec::new()),
            smt: RefCell::new(None),
            evaluation: RefCell::new(None),
            range_sets: [RefCell::new(None), RefCell::new(None)],
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn bytes(&self) -> u32 {
        assert!(self.bits % 8 == 0);
        self.bits / 8
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    pub fn child(&self, index: usize) -> &ExprRef {
        &self.children[index]
    }

    pub fn left(&self) -> &ExprRef {
        self.child(0)
    }

    pub fn right(&self) -> &ExprRef {
        self.child(1)
    }

    pub fn children(&self) -> &[ExprRef] {
        &self.children
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The constant value, for `Constant` nodes.
    pub fn value(&self) -> Option<&BitVec> {
        match &self.payload {
            Payload::Constant(v) => Some(v),
            _ => None,
        }
    }

    pub fn bool_value(&self) -> Option<bool> {
        match self.payload {
            Payload::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn read_index(&self) -> Option<usize> {
        match self.payload {
            Payload::Read(index) => Some(index),
            _ => None,
        }
    }

    pub fn extract_index(&self) -> u32 {
        match self.payload {
            Payload::Extract(low) => low,
            _ => fatal!("extract_index on {:?}", self.kind),
        }
    }

    pub fn is_constant(&self) -> bool {
        self.kind == Kind::Constant
    }

    pub fn is_bool(&self) -> bool {
        self.kind == Kind::Bool
    }

    pub fn is_zero(&self) -> bool {
        self.value().map_or(false, BitVec::is_zero)
    }

    pub fn is_one(&self) -> bool {
        self.value().map_or(false, BitVec::is_one)
    }

    pub fn is_all_ones(&self) -> bool {
        self.value().map_or(false, BitVec::is_all_ones)
    }

    pub fn is_concrete(&self) -> bool {
        self.concrete.get()
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.get()
    }

    /// 32-bit structural hash over the node's shape: kind, width, payload
    /// and child identities. Shallowly equal nodes hash identically.
    pub fn hash(&self) -> u32 {
        if let Some(h) = self.hash.get() {
            return h;
        }
        let mut hasher = ahash::AHasher::default();
        self.kind.hash(&mut hasher);
        self.bits.hash(&mut hasher);
        self.payload.hash(&mut hasher);
        for child in &self.children {
            (Rc::as_ptr(child) as usize).hash(&mut hasher);
        }
        let h = hasher.finish() as u32;
        self.hash.set(Some(h));
        h
    }

    pub fn depth(&self) -> u32 {
        if let Some(d) = self.depth.get() {
            return d;
        }
        let d = 1 + self.children.iter().map(|c| c.depth()).max().unwrap_or(0);
        let d = d.min(MAX_DEPTH);
        self.depth.set(Some(d));
        d
    }

    /// Number of known-zero high bits, derived from the expression shape.
    pub fn count_leading_zeros(&self) -> u32 {
        if let Some(n) = self.leading_zeros.get() {
            return n;
        }
        let n = match self.kind {
            Kind::Constant => self.value().unwrap().leading_zeros(),
            Kind::Concat => {
                let left = self.left().count_leading_zeros();
                if left == self.left().bits() {
                    left + self.right().count_leading_zeros()
                } else {
                    left
                }
            }
            Kind::ZExt => self.bits - self.child(0).bits(),
            _ => 0,
        };
        self.leading_zeros.set(Some(n));
        n
    }

    /// Input-byte indices this expression transitively reads.
    pub fn deps(&self) -> &DependencySet {
        self.deps.get_or_init(|| {
            let mut deps = DependencySet::new();
            if let Payload::Read(index) = self.payload {
                deps.insert(index);
            }
            for child in &self.children {
                deps.extend(child.deps().iter().copied());
            }
            deps
        })
    }

    pub(crate) fn add_use(&self, user: &ExprRef) {
        self.uses.borrow_mut().push(Rc::downgrade(user))
    }

    /// Live parents of this node. Expired weak references are purged as a
    /// side effect.
    fn live_uses(&self) -> Vec<ExprRef> {
        let mut uses = self.uses.borrow_mut();
        uses.retain(|user| user.strong_count() > 0);
        uses.iter().filter_map(Weak::upgrade).collect()
    }

    /// Marks the cached SMT form stale, transitively through all live
    /// parents. Stops at nodes that are already invalidated, so repeated
    /// invalidation of the same region is linear rather than quadratic.
    pub fn invalidate(&self) {
        if self.invalidated.replace(true) {
            return;
        }
        for user in self.live_uses() {
            user.invalidate()
        }
    }

    pub(crate) fn validate(&self) {
        self.invalidated.set(false)
    }

    pub(crate) fn cached_smt(&self) -> Option<Ast> {
        if self.is_invalidated() {
            return None;
        }
        self.smt.borrow().clone()
    }

    pub(crate) fn set_cached_smt(&self, ast: Ast) {
        *self.smt.borrow_mut() = Some(ast);
        self.validate()
    }

    pub(crate) fn cached_evaluation(&self) -> Option<ExprRef> {
        if self.is_invalidated() {
            return None;
        }
        self.evaluation.borrow().clone()
    }

    pub(crate) fn set_cached_evaluation(&self, e: ExprRef) {
        *self.evaluation.borrow_mut() = Some(e)
    }

    /// Makes this expression symbolic and with it every live user.
    pub fn symbolize(&self) {
        self.invalidate();
        if self.concrete.get() {
            self.concrete.set(false);
            for user in self.live_uses() {
                user.symbolize()
            }
        }
    }

    /// Makes this expression concrete; users become concrete only when all
    /// of their children are.
    pub fn concretize(&self) {
        self.invalidate();
        if !self.concrete.get() {
            self.concrete.set(true);
            for user in self.live_uses() {
                user.try_concretize()
            }
        }
    }

    pub fn try_concretize(&self) {
        if self.concrete.get() {
            return;
        }
        if self.children.iter().all(|c| c.is_concrete()) {
            self.concretize()
        }
    }

    pub fn range_set(&self, is_unsigned: bool) -> &RefCell<Option<RangeSet>> {
        &self.range_sets[is_unsigned as usize]
    }

    /// Accumulates `(adjustment + self) kind rhs` into the matching range
    /// set(s). Equalities narrow both signedness domains; ordered compares
    /// narrow only their own.
    pub fn add_range_constraint(&self, kind: Kind, rhs: &BitVec, adjustment: &BitVec) {
        use Kind::*;
        match kind {
            Equal | Distinct => {
                self.constrain_range(false, kind, rhs, adjustment);
                self.constrain_range(true, kind, rhs, adjustment);
            }
            Ult | Ule | Ugt | Uge => self.constrain_range(true, kind, rhs, adjustment),
            Slt | Sle | Sgt | Sge => self.constrain_range(false, kind, rhs, adjustment),
            _ => fatal!("range constraint with kind {:?}", kind),
        }
    }

    fn constrain_range(&self, is_unsigned: bool, kind: Kind, rhs: &BitVec, adjustment: &BitVec) {
        let mut slot = self.range_set(is_unsigned).borrow_mut();
        let rs = slot.get_or_insert_with(|| RangeSet::full(self.bits, !is_unsigned));
        rs.constrain(kind, rhs, adjustment)
    }
}

/// Metadata equality: same kind, width, payload and arity.
pub fn equal_metadata(l: &Expr, r: &Expr) -> bool {
    l.hash() == r.hash()
        && l.kind == r.kind
        && l.num_children() == r.num_children()
        && l.bits == r.bits
        && l.payload == r.payload
}

/// Shallow equality: equal metadata and identical child references.
pub fn equal_shallow(l: &Expr, r: &Expr) -> bool {
    if !equal_metadata(l, r) {
        return false;
    }
    l.children.iter().zip(r.children.iter()).all(|(a, b)| Rc::ptr_eq(a, b))
}

/// Deep (structural) equality. The hash is no shortcut here: it covers
/// child identities, which deep equality deliberately looks through.
pub fn equal_deep(l: &Expr, r: &Expr) -> bool {
    if l.kind != r.kind
        || l.bits != r.bits
        || l.payload != r.payload
        || l.num_children() != r.num_children()
    {
        return false;
    }
    l.children
        .iter()
        .zip(r.children.iter())
        .all(|(a, b)| Rc::ptr_eq(a, b) || equal_deep(a, b))
}

/// True when bit `index` of `e` is known to be zero from the expression
/// shape alone.
pub fn is_zero_bit(e: &ExprRef, index: u32) -> bool {
    debug_assert!(index < e.bits());
    if let Some(value) = e.value() {
        return !value.bit(index);
    }
    if index >= e.bits() - e.count_leading_zeros() {
        return true;
    }
    match e.kind() {
        Kind::Concat => {
            let right = e.right();
            if index < right.bits() {
                is_zero_bit(right, index)
            } else {
                is_zero_bit(e.left(), index - right.bits())
            }
        }
        Kind::ZExt => {
            let inner = e.child(0);
            index >= inner.bits() || is_zero_bit(inner, index)
        }
        _ => false,
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_expr(self, f, 0)
    }
}

fn fmt_expr(e: &Expr, f: &mut fmt::Formatter<'_>, depth: u32) -> fmt::Result {
    if depth > 8 {
        return write!(f, "...");
    }
    match e.payload() {
        Payload::Bool(b) => write!(f, "(Bool {})", b),
        Payload::Constant(v) => write!(f, "(Constant {})", v),
        Payload::Read(index) => write!(f, "(Read {})", index),
        Payload::Extract(low) => {
            write!(f, "(Extract {} {} ", low, e.bits())?;
            fmt_expr(e.child(0), f, depth + 1)?;
            write!(f, ")")
        }
        Payload::None => {
            write!(f, "({:?}:{}", e.kind(), e.bits())?;
            for child in e.children() {
                write!(f, " ")?;
                fmt_expr(child, f, depth + 1)?;
            }
            write!(f, ")")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(value: u64, bits: u32) -> ExprRef {
        Rc::new(Expr::new(Kind::Constant, bits, vec![], Payload::Constant(BitVec::from_u64(value, bits))))
    }

    fn read(index: usize) -> ExprRef {
        Rc::new(Expr::new(Kind::Read, 8, vec![], Payload::Read(index)))
    }

    fn add(l: &ExprRef, r: &ExprRef) -> ExprRef {
        let e = Rc::new(Expr::new(Kind::Add, l.bits(), vec![l.clone(), r.clone()], Payload::None));
        l.add_use(&e);
        r.add_use(&e);
        e
    }

    #[test]
    fn concreteness_follows_children() {
        let c = constant(1, 8);
        let r = read(0);
        assert!(c.is_concrete());
        assert!(!r.is_concrete());
        assert!(!add(&c, &r).is_concrete());
        assert!(add(&c, &c).is_concrete());
    }

    #[test]
    fn deps_are_unions() {
        let r0 = read(0);
        let r1 = read(1);
        let sum = add(&r0, &r1);
        assert_eq!(r0.deps().len(), 1);
        assert!(sum.deps().contains(&0) && sum.deps().contains(&1));
        assert!(constant(0, 8).deps().is_empty());
    }

    #[test]
    fn shallow_equality_and_hash() {
        let r0 = read(0);
        let a = add(&r0, &r0);
        let b = add(&r0, &r0);
        assert!(equal_shallow(&a, &b));
        assert_eq!(a.hash(), b.hash());
        let r1 = read(1);
        let c = add(&r0, &r1);
        assert!(!equal_shallow(&a, &c));
    }

    #[test]
    fn deep_equality_crosses_distinct_leaves() {
        // Two Read(0) leaves allocated separately are deeply but not
        // shallowly equal parents.
        let a = add(&read(0), &read(0));
        let b = add(&read(0), &read(0));
        assert!(!equal_shallow(&a, &b));
        assert!(equal_deep(&a, &b));
    }

    #[test]
    fn symbolize_and_concretize_propagate() {
        let r0 = read(0);
        let c = constant(3, 8);
        let sum = add(&r0, &c);
        assert!(!sum.is_concrete());
        r0.concretize();
        assert!(sum.is_concrete());
        assert!(sum.is_invalidated());
        r0.symbolize();
        assert!(!sum.is_concrete());
    }

    #[test]
    fn depth_is_clamped() {
        let mut e = read(0);
        for _ in 0..(MAX_DEPTH * 2) {
            e = add(&e, &constant(1, 8));
        }
        assert_eq!(e.depth(), MAX_DEPTH);
    }

    #[test]
    fn zero_bits() {
        let c = constant(0x0f, 8);
        assert!(is_zero_bit(&c, 7));
        assert!(!is_zero_bit(&c, 0));
        let z = Rc::new(Expr::new(Kind::ZExt, 16, vec![read(0)], Payload::None));
        assert!(is_zero_bit(&z, 8));
        assert!(!is_zero_bit(&z, 7));
    }
}
