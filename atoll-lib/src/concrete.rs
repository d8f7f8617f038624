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

//! This module defines a concrete bitvector value [BitVec] of arbitrary
//! width with the semantics of the SMT bit-vector theory: two's-complement
//! wrap-around arithmetic, division rounding toward zero, and logical or
//! arithmetic shifts. Constant folding in the builder pipeline and concrete
//! evaluation of pruned expressions both go through this type, so it has to
//! agree bit-for-bit with what the solver would compute.

use num_bigint::{BigInt, BigUint};
use num_traits::{One, ToPrimitive, Zero};
use std::fmt;
use std::ops::{Add, BitAnd, BitOr, BitXor, Mul, Neg, Not, Sub};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BitVec {
    len: u32,
    bits: BigUint,
}

fn two_pow(len: u32) -> BigUint {
    BigUint::one() << len
}

fn mask(len: u32) -> BigUint {
    two_pow(len) - BigUint::one()
}

impl BitVec {
    pub fn new(bits: BigUint, len: u32) -> Self {
        assert!(len >= 1);
        BitVec { len, bits: bits & mask(len) }
    }

    pub fn from_u64(value: u64, len: u32) -> Self {
        BitVec::new(BigUint::from(value), len)
    }

    /// Interprets `value` as a two's-complement number modulo `2^len`.
    pub fn from_bigint(value: &BigInt, len: u32) -> Self {
        let modulus = BigInt::from(two_pow(len));
        let reduced = ((value % &modulus) + &modulus) % &modulus;
        BitVec { len, bits: reduced.to_biguint().unwrap() }
    }

    pub fn zero(len: u32) -> Self {
        BitVec { len, bits: BigUint::zero() }
    }

    pub fn one(len: u32) -> Self {
        BitVec::from_u64(1, len)
    }

    pub fn all_ones(len: u32) -> Self {
        BitVec { len, bits: mask(len) }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_zero(&self) -> bool {
        self.bits.is_zero()
    }

    pub fn is_one(&self) -> bool {
        self.bits.is_one()
    }

    pub fn is_all_ones(&self) -> bool {
        self.bits == mask(self.len)
    }

    pub fn bit(&self, index: u32) -> bool {
        ((&self.bits >> index) & BigUint::one()).is_one()
    }

    /// The value as an unsigned integer.
    pub fn unsigned_value(&self) -> &BigUint {
        &self.bits
    }

    /// The value as a signed two's-complement integer.
    pub fn signed_value(&self) -> BigInt {
        if self.bit(self.len - 1) {
            BigInt::from(self.bits.clone()) - BigInt::from(two_pow(self.len))
        } else {
            BigInt::from(self.bits.clone())
        }
    }

    /// The low 64 bits, for shift amounts and byte indices.
    pub fn limited_value(&self) -> u64 {
        self.bits.iter_u64_digits().next().unwrap_or(0)
    }

    pub fn leading_zeros(&self) -> u32 {
        self.len - self.active_bits()
    }

    /// Number of bits needed to represent the unsigned value.
    pub fn active_bits(&self) -> u32 {
        self.bits.bits() as u32
    }

    pub fn add(&self, rhs: &BitVec) -> BitVec {
        assert_eq!(self.len, rhs.len);
        BitVec::new(&self.bits + &rhs.bits, self.len)
    }

    pub fn sub(&self, rhs: &BitVec) -> BitVec {
        assert_eq!(self.len, rhs.len);
        BitVec::new((&self.bits + two_pow(self.len)) - &rhs.bits, self.len)
    }

    pub fn mul(&self, rhs: &BitVec) -> BitVec {
        assert_eq!(self.len, rhs.len);
        BitVec::new(&self.bits * &rhs.bits, self.len)
    }

    /// Unsigned division. The divisor must be non-zero; the builder keeps
    /// divisions with a zero divisor symbolic.
    pub fn udiv(&self, rhs: &BitVec) -> BitVec {
        assert!(!rhs.is_zero());
        BitVec::new(&self.bits / &rhs.bits, self.len)
    }

    pub fn urem(&self, rhs: &BitVec) -> BitVec {
        assert!(!rhs.is_zero());
        BitVec::new(&self.bits % &rhs.bits, self.len)
    }

    /// Signed division rounding toward zero, as `bvsdiv` does.
    pub fn sdiv(&self, rhs: &BitVec) -> BitVec {
        assert!(!rhs.is_zero());
        BitVec::from_bigint(&(self.signed_value() / rhs.signed_value()), self.len)
    }

    /// Signed remainder with the sign of the dividend, as `bvsrem` does.
    pub fn srem(&self, rhs: &BitVec) -> BitVec {
        assert!(!rhs.is_zero());
        BitVec::from_bigint(&(self.signed_value() % rhs.signed_value()), self.len)
    }

    /// Left shift by less than the width.
    pub fn shl(&self, amount: u32) -> BitVec {
        assert!(amount < self.len);
        BitVec::new(&self.bits << amount, self.len)
    }

    pub fn lshr(&self, amount: u32) -> BitVec {
        assert!(amount < self.len);
        BitVec { len: self.len, bits: &self.bits >> amount }
    }

    pub fn ashr(&self, amount: u32) -> BitVec {
        assert!(amount < self.len);
        BitVec::from_bigint(&(self.signed_value() >> amount), self.len)
    }

    pub fn zext(&self, len: u32) -> BitVec {
        assert!(len >= self.len);
        BitVec { len, bits: self.bits.clone() }
    }

    pub fn sext(&self, len: u32) -> BitVec {
        assert!(len >= self.len);
        BitVec::from_bigint(&self.signed_value(), len)
    }

    pub fn extract(&self, low: u32, len: u32) -> BitVec {
        assert!(low + len <= self.len);
        BitVec::new(&self.bits >> low, len)
    }

    /// `self` becomes the high part, `rhs` the low part.
    pub fn concat(&self, rhs: &BitVec) -> BitVec {
        BitVec { len: self.len + rhs.len, bits: (&self.bits << rhs.len) | &rhs.bits }
    }

    pub fn ult(&self, rhs: &BitVec) -> bool {
        self.bits < rhs.bits
    }

    pub fn ule(&self, rhs: &BitVec) -> bool {
        self.bits <= rhs.bits
    }

    pub fn ugt(&self, rhs: &BitVec) -> bool {
        self.bits > rhs.bits
    }

    pub fn uge(&self, rhs: &BitVec) -> bool {
        self.bits >= rhs.bits
    }

    pub fn slt(&self, rhs: &BitVec) -> bool {
        self.signed_value() < rhs.signed_value()
    }

    pub fn sle(&self, rhs: &BitVec) -> bool {
        self.signed_value() <= rhs.signed_value()
    }

    pub fn sgt(&self, rhs: &BitVec) -> bool {
        self.signed_value() > rhs.signed_value()
    }

    pub fn sge(&self, rhs: &BitVec) -> bool {
        self.signed_value() >= rhs.signed_value()
    }

    pub fn to_u8(&self) -> Option<u8> {
        self.bits.to_u8()
    }
}

impl Not for &BitVec {
    type Output = BitVec;

    fn not(self) -> BitVec {
        BitVec { len: self.len, bits: &self.bits ^ mask(self.len) }
    }
}

impl Neg for &BitVec {
    type Output = BitVec;

    fn neg(self) -> BitVec {
        BitVec::new(two_pow(self.len) - &self.bits, self.len)
    }
}

impl BitAnd for &BitVec {
    type Output = BitVec;

    fn bitand(self, rhs: Self) -> BitVec {
        BitVec { len: self.len, bits: &self.bits & &rhs.bits }
    }
}

impl BitOr for &BitVec {
    type Output = BitVec;

    fn bitor(self, rhs: Self) -> BitVec {
        BitVec { len: self.len, bits: &self.bits | &rhs.bits }
    }
}

impl BitXor for &BitVec {
    type Output = BitVec;

    fn bitxor(self, rhs: Self) -> BitVec {
        BitVec { len: self.len, bits: &self.bits ^ &rhs.bits }
    }
}

impl Add for &BitVec {
    type Output = BitVec;

    fn add(self, rhs: Self) -> BitVec {
        BitVec::add(self, rhs)
    }
}

impl Sub for &BitVec {
    type Output = BitVec;

    fn sub(self, rhs: Self) -> BitVec {
        BitVec::sub(self, rhs)
    }
}

impl Mul for &BitVec {
    type Output = BitVec;

    fn mul(self, rhs: Self) -> BitVec {
        BitVec::mul(self, rhs)
    }
}

impl fmt::Display for BitVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#x{:x}:{}", self.bits, self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_arithmetic() {
        let a = BitVec::from_u64(0xff, 8);
        let b = BitVec::from_u64(0x02, 8);
        assert_eq!(a.add(&b), BitVec::from_u64(0x01, 8));
        assert_eq!(b.sub(&a), BitVec::from_u64(0x03, 8));
        assert_eq!(a.mul(&b), BitVec::from_u64(0xfe, 8));
        assert_eq!(-&b, BitVec::from_u64(0xfe, 8));
    }

    #[test]
    fn signed_division_rounds_toward_zero() {
        let a = BitVec::from_u64(0xf9, 8); // -7
        let b = BitVec::from_u64(0x02, 8);
        assert_eq!(a.sdiv(&b), BitVec::from_u64(0xfd, 8)); // -3
        assert_eq!(a.srem(&b), BitVec::from_u64(0xff, 8)); // -1
        let c = BitVec::from_u64(0x07, 8);
        let d = BitVec::from_u64(0xfe, 8); // -2
        assert_eq!(c.sdiv(&d), BitVec::from_u64(0xfd, 8)); // -3
        assert_eq!(c.srem(&d), BitVec::from_u64(0x01, 8));
    }

    #[test]
    fn shifts() {
        let a = BitVec::from_u64(0x81, 8);
        assert_eq!(a.shl(1), BitVec::from_u64(0x02, 8));
        assert_eq!(a.lshr(1), BitVec::from_u64(0x40, 8));
        assert_eq!(a.ashr(1), BitVec::from_u64(0xc0, 8));
    }

    #[test]
    fn extensions_and_extract() {
        let a = BitVec::from_u64(0x80, 8);
        assert_eq!(a.zext(16), BitVec::from_u64(0x0080, 16));
        assert_eq!(a.sext(16), BitVec::from_u64(0xff80, 16));
        assert_eq!(a.extract(4, 4), BitVec::from_u64(0x8, 4));
        let b = BitVec::from_u64(0xab, 8);
        assert_eq!(a.concat(&b), BitVec::from_u64(0x80ab, 16));
    }

    #[test]
    fn comparisons() {
        let a = BitVec::from_u64(0x80, 8); // -128 signed, 128 unsigned
        let b = BitVec::from_u64(0x01, 8);
        assert!(b.ult(&a));
        assert!(a.slt(&b));
        assert!(a.sle(&a) && a.uge(&a));
    }

    #[test]
    fn wide_values() {
        let a = BitVec::from_u64(u64::MAX, 64);
        let b = a.concat(&a);
        assert_eq!(b.len(), 128);
        assert!(b.is_all_ones());
        assert_eq!(b.leading_zeros(), 0);
        assert_eq!(b.extract(64, 64), a);
    }

    #[test]
    fn leading_zeros() {
        assert_eq!(BitVec::from_u64(0x00ff, 16).leading_zeros(), 8);
        assert_eq!(BitVec::zero(16).leading_zeros(), 16);
        assert_eq!(BitVec::from_u64(0x0010, 16).active_bits(), 5);
    }
}
