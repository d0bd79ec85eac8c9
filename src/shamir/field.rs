//! Arithmetic over GF(2^8).
//!
//! Elements are bytes. Addition is XOR; multiplication and division go
//! through exponent/logarithm tables built at compile time from the
//! generator `0x03` and the AES reduction polynomial
//! `x^8 + x^4 + x^3 + x + 1`.
//!
//! Nothing here validates share parameters. That happens in the parent
//! module before any arithmetic runs.

use std::ops::{Add, Div, Mul};

const REDUCTION: u8 = 0x1B;

/// Carry-less multiply with reduction. Only used to build the tables.
const fn mul_slow(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0u8;
    while b != 0 {
        if b & 1 != 0 {
            product ^= a;
        }
        let carry = a & 0x80;
        a <<= 1;
        if carry != 0 {
            a ^= REDUCTION;
        }
        b >>= 1;
    }
    product
}

const fn build_tables() -> ([u8; 512], [u8; 256]) {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];
    let mut x: u8 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x;
        log[x as usize] = i as u8;
        x = mul_slow(x, 0x03);
        i += 1;
    }
    // Doubled so `log a + log b` never needs a modulo.
    while i < 512 {
        exp[i] = exp[i - 255];
        i += 1;
    }
    (exp, log)
}

const TABLES: ([u8; 512], [u8; 256]) = build_tables();
const EXP: [u8; 512] = TABLES.0;
const LOG: [u8; 256] = TABLES.1;

/// An element of GF(256).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Gf256(pub(crate) u8);

impl Gf256 {
    pub(crate) const ZERO: Self = Gf256(0);
    pub(crate) const ONE: Self = Gf256(1);

    /// Evaluate `coeffs[0] + coeffs[1]·x + ...` with Horner's method.
    pub(crate) fn eval_polynomial(constant: u8, higher: &[u8], x: Self) -> Self {
        let mut acc = Gf256::ZERO;
        for &c in higher.iter().rev() {
            acc = acc * x + Gf256(c);
        }
        acc * x + Gf256(constant)
    }

    /// Value at `x` of the unique polynomial through `points`.
    ///
    /// All point abscissas must be distinct and non-zero.
    pub(crate) fn interpolate(points: &[(Gf256, Gf256)], x: Gf256) -> Gf256 {
        let mut acc = Gf256::ZERO;

        for (i, &(xi, yi)) in points.iter().enumerate() {
            let mut num = Gf256::ONE;
            let mut den = Gf256::ONE;

            for (j, &(xj, _)) in points.iter().enumerate() {
                if i != j {
                    // Subtraction is addition in characteristic two.
                    num = num * (x + xj);
                    den = den * (xi + xj);
                }
            }

            acc = acc + yi * (num / den);
        }

        acc
    }
}

impl Add for Gf256 {
    type Output = Self;

    #[allow(clippy::suspicious_arithmetic_impl)]
    fn add(self, rhs: Self) -> Self {
        Gf256(self.0 ^ rhs.0)
    }
}

impl Mul for Gf256 {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        if self.0 == 0 || rhs.0 == 0 {
            return Gf256::ZERO;
        }
        let idx = LOG[self.0 as usize] as usize + LOG[rhs.0 as usize] as usize;
        Gf256(EXP[idx])
    }
}

impl Div for Gf256 {
    type Output = Self;

    /// # Panics
    ///
    /// Panics on division by zero. Callers only divide by differences of
    /// distinct abscissas, which are never zero.
    fn div(self, rhs: Self) -> Self {
        assert!(rhs.0 != 0, "division by zero in GF(256)");
        if self.0 == 0 {
            return Gf256::ZERO;
        }
        let idx = LOG[self.0 as usize] as usize + 255 - LOG[rhs.0 as usize] as usize;
        Gf256(EXP[idx])
    }
}
