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

//! Interval sets over a fixed bit-width, used to accumulate range-friendly
//! branch constraints (`canonical <cmp> constant`) per expression instead of
//! asserting each of them separately.
//!
//! A set is kept as sorted disjoint inclusive intervals in an *ordering key*
//! domain: the raw value for unsigned sets, the value with the sign bit
//! flipped for signed sets. Flipping the sign bit is the same as adding
//! `2^(n-1)` modulo `2^n`, so both signed and unsigned comparison regions
//! become plain unsigned intervals, and subtracting a constant adjustment is
//! the same rotation in either domain.

use num_bigint::BigUint;
use num_traits::{One, Zero};

use crate::concrete::BitVec;
use crate::expr::Kind;
use crate::fatal;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeSet {
    bits: u32,
    signed: bool,
    intervals: Vec<(BigUint, BigUint)>,
}

impl RangeSet {
    /// The unconstrained set over `bits`-wide values.
    pub fn full(bits: u32, signed: bool) -> Self {
        let max = (BigUint::one() << bits) - BigUint::one();
        RangeSet { bits, signed, intervals: vec![(BigUint::zero(), max)] }
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    fn bias(&self) -> BigUint {
        if self.signed {
            BigUint::one() << (self.bits - 1)
        } else {
            BigUint::zero()
        }
    }

    fn modulus(&self) -> BigUint {
        BigUint::one() << self.bits
    }

    fn max_key(&self) -> BigUint {
        self.modulus() - BigUint::one()
    }

    /// Value domain to key domain. Its own inverse, since adding the bias
    /// twice wraps to zero.
    fn key(&self, value: &BigUint) -> BigUint {
        (value + self.bias()) % self.modulus()
    }

    /// Narrows the set to values `x` satisfying `(adjustment + x) kind rhs`.
    pub fn constrain(&mut self, kind: Kind, rhs: &BitVec, adjustment: &BitVec) {
        assert_eq!(rhs.len(), self.bits);
        let kc = self.key(rhs.unsigned_value());
        let max = self.max_key();
        let one = BigUint::one();

        let mut region: Vec<(BigUint, BigUint)> = Vec::new();
        match kind {
            Kind::Equal => region.push((kc.clone(), kc)),
            Kind::Distinct => {
                if !kc.is_zero() {
                    region.push((BigUint::zero(), &kc - &one));
                }
                if kc < max {
                    region.push((&kc + &one, max));
                }
            }
            Kind::Ult | Kind::Slt => {
                if !kc.is_zero() {
                    region.push((BigUint::zero(), &kc - &one));
                }
            }
            Kind::Ule | Kind::Sle => region.push((BigUint::zero(), kc)),
            Kind::Ugt | Kind::Sgt => {
                if kc < max {
                    region.push((&kc + &one, max));
                }
            }
            Kind::Uge | Kind::Sge => region.push((kc, max)),
            _ => fatal!("range region for kind {:?}", kind),
        }

        // The region constrains adjustment + x; rotate it down by the
        // adjustment to constrain x itself, splitting intervals that wrap.
        let adj = adjustment.unsigned_value();
        let mut rotated: Vec<(BigUint, BigUint)> = Vec::new();
        for (lo, hi) in region {
            let lo = (&lo + &self.modulus() - adj) % self.modulus();
            let hi = (&hi + &self.modulus() - adj) % self.modulus();
            if lo <= hi {
                rotated.push((lo, hi));
            } else {
                rotated.push((lo, self.max_key()));
                rotated.push((BigUint::zero(), hi));
            }
        }
        rotated.sort();

        self.intersect(&rotated)
    }

    fn intersect(&mut self, other: &[(BigUint, BigUint)]) {
        let mut result = Vec::new();
        for (a_lo, a_hi) in &self.intervals {
            for (b_lo, b_hi) in other {
                let lo = a_lo.max(b_lo);
                let hi = a_hi.min(b_hi);
                if lo <= hi {
                    result.push((lo.clone(), hi.clone()));
                }
            }
        }
        result.sort();
        self.intervals = result
    }

    /// Interval endpoints mapped back to the value domain. For a signed set
    /// the endpoints are ordered by the signed comparison.
    pub fn iter(&self) -> impl Iterator<Item = (BitVec, BitVec)> + '_ {
        self.intervals.iter().map(move |(lo, hi)| {
            (BitVec::new(self.key(lo), self.bits), BitVec::new(self.key(hi), self.bits))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bv(value: u64) -> BitVec {
        BitVec::from_u64(value, 8)
    }

    #[test]
    fn unsigned_window() {
        let mut rs = RangeSet::full(8, false);
        rs.constrain(Kind::Ult, &bv(0x10), &bv(0));
        rs.constrain(Kind::Uge, &bv(0x05), &bv(0));
        let intervals: Vec<_> = rs.iter().collect();
        assert_eq!(intervals, vec![(bv(0x05), bv(0x0f))]);
    }

    #[test]
    fn equal_then_distinct_is_empty() {
        let mut rs = RangeSet::full(8, false);
        rs.constrain(Kind::Equal, &bv(0x41), &bv(0));
        let intervals: Vec<_> = rs.iter().collect();
        assert_eq!(intervals, vec![(bv(0x41), bv(0x41))]);
        rs.constrain(Kind::Distinct, &bv(0x41), &bv(0));
        assert!(rs.is_empty());
    }

    #[test]
    fn distinct_splits() {
        let mut rs = RangeSet::full(8, false);
        rs.constrain(Kind::Distinct, &bv(0x00), &bv(0));
        let intervals: Vec<_> = rs.iter().collect();
        assert_eq!(intervals, vec![(bv(0x01), bv(0xff))]);
    }

    #[test]
    fn adjustment_rotates() {
        // (1 + x) == 0 constrains x to 0xff.
        let mut rs = RangeSet::full(8, false);
        rs.constrain(Kind::Equal, &bv(0x00), &bv(0x01));
        let intervals: Vec<_> = rs.iter().collect();
        assert_eq!(intervals, vec![(bv(0xff), bv(0xff))]);
    }

    #[test]
    fn adjustment_can_split_an_interval() {
        // (0x10 + x) <u 0x20 holds for x in [0xf0, 0xff] and [0x00, 0x0f].
        let mut rs = RangeSet::full(8, false);
        rs.constrain(Kind::Ult, &bv(0x20), &bv(0x10));
        let intervals: Vec<_> = rs.iter().collect();
        assert_eq!(intervals, vec![(bv(0x00), bv(0x0f)), (bv(0xf0), bv(0xff))]);
    }

    #[test]
    fn signed_window() {
        // x <s 1 covers -128..=0.
        let mut rs = RangeSet::full(8, true);
        rs.constrain(Kind::Slt, &bv(0x01), &bv(0));
        let intervals: Vec<_> = rs.iter().collect();
        assert_eq!(intervals, vec![(bv(0x80), bv(0x00))]);
        // Additionally x >=s -2 leaves -2..=0.
        rs.constrain(Kind::Sge, &bv(0xfe), &bv(0));
        let intervals: Vec<_> = rs.iter().collect();
        assert_eq!(intervals, vec![(bv(0xfe), bv(0x00))]);
    }

    #[test]
    fn contradiction_empties_the_set() {
        let mut rs = RangeSet::full(8, false);
        rs.constrain(Kind::Ult, &bv(0x05), &bv(0));
        rs.constrain(Kind::Ugt, &bv(0x80), &bv(0));
        assert!(rs.is_empty());
    }
}
