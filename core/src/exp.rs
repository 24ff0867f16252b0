// ============================================================================
// 18-Decimal Fixed-Point Math
// ============================================================================
//
// Every ratio the ledger stores (exchange rate, borrow index, collateral
// factor, close factor, liquidation incentive, fee factor) is an `Exp`: an
// unsigned integer mantissa scaled by 1e18. All operations are overflow- and
// zero-divide-checked and return MathError; nothing here saturates or wraps.
// Multiply-then-divide forms run over a 256-bit intermediate product, so
// price mantissas up to 1e30 compose with share counts without overflowing;
// an error means the final quotient itself cannot fit in a u128. Callers
// attach a per-computation-step subcode when propagating failures so tests
// can tell exactly which operation overflowed.

use crate::EXP_SCALE;

/// A real number represented as `mantissa / 1e18`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Exp {
    pub mantissa: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MathError {
    Overflow,
    DivisionByZero,
}

pub type MathResult<T> = core::result::Result<T, MathError>;

const LO_MASK: u128 = (1 << 64) - 1;

/// Full 256-bit product of two u128s as (hi, lo) limbs.
#[inline]
fn widening_mul(a: u128, b: u128) -> (u128, u128) {
    let (a_hi, a_lo) = (a >> 64, a & LO_MASK);
    let (b_hi, b_lo) = (b >> 64, b & LO_MASK);

    let ll = a_lo * b_lo;
    let lh = a_lo * b_hi;
    let hl = a_hi * b_lo;
    let hh = a_hi * b_hi;

    let carry = ((ll >> 64) + (lh & LO_MASK) + (hl & LO_MASK)) >> 64;
    let lo = ll.wrapping_add(lh << 64).wrapping_add(hl << 64);
    let hi = hh + (lh >> 64) + (hl >> 64) + carry;
    (hi, lo)
}

/// (hi, lo) / denom by binary long division. Caller guarantees denom != 0
/// and hi < denom, so the quotient fits in a u128 and the running remainder
/// stays below denom.
fn div_wide(hi: u128, lo: u128, denom: u128) -> u128 {
    let mut rem = hi;
    let mut quotient = 0u128;
    for shift in (0..128).rev() {
        let overflow = rem >> 127;
        rem = (rem << 1) | ((lo >> shift) & 1);
        quotient <<= 1;
        if overflow != 0 || rem >= denom {
            rem = rem.wrapping_sub(denom);
            quotient |= 1;
        }
    }
    quotient
}

/// a * b / denom with a 256-bit intermediate product. Errors only when the
/// quotient itself exceeds u128::MAX (hi >= denom is exactly that condition).
pub fn mul_div(a: u128, b: u128, denom: u128) -> MathResult<u128> {
    if denom == 0 {
        return Err(MathError::DivisionByZero);
    }
    let (hi, lo) = widening_mul(a, b);
    if hi >= denom {
        return Err(MathError::Overflow);
    }
    if hi == 0 {
        return Ok(lo / denom);
    }
    Ok(div_wide(hi, lo, denom))
}

impl Exp {
    pub const ZERO: Self = Self { mantissa: 0 };
    pub const ONE: Self = Self { mantissa: EXP_SCALE };

    #[inline]
    pub const fn new(mantissa: u128) -> Self {
        Self { mantissa }
    }

    /// Whole-number part, discarding the fractional 18 decimals.
    #[inline]
    pub fn truncate(self) -> u128 {
        self.mantissa / EXP_SCALE
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.mantissa == 0
    }
}

#[inline]
pub fn add_exp(a: Exp, b: Exp) -> MathResult<Exp> {
    a.mantissa
        .checked_add(b.mantissa)
        .map(Exp::new)
        .ok_or(MathError::Overflow)
}

#[inline]
pub fn sub_exp(a: Exp, b: Exp) -> MathResult<Exp> {
    a.mantissa
        .checked_sub(b.mantissa)
        .map(Exp::new)
        .ok_or(MathError::Overflow)
}

/// (a * b) / 1e18, truncating the product back to scale.
#[inline]
pub fn mul_exp(a: Exp, b: Exp) -> MathResult<Exp> {
    mul_div(a.mantissa, b.mantissa, EXP_SCALE).map(Exp::new)
}

/// a * scalar, keeping the 1e18 scale.
#[inline]
pub fn mul_scalar(a: Exp, scalar: u128) -> MathResult<Exp> {
    a.mantissa
        .checked_mul(scalar)
        .map(Exp::new)
        .ok_or(MathError::Overflow)
}

/// truncate(a * scalar): the integer quantity of `scalar` units scaled by `a`.
#[inline]
pub fn mul_scalar_truncate(a: Exp, scalar: u128) -> MathResult<u128> {
    mul_div(a.mantissa, scalar, EXP_SCALE)
}

/// truncate(a * scalar) + addend, overflow-checked.
#[inline]
pub fn mul_scalar_truncate_add(a: Exp, scalar: u128, addend: u128) -> MathResult<u128> {
    mul_scalar_truncate(a, scalar)?
        .checked_add(addend)
        .ok_or(MathError::Overflow)
}

/// (a / b) at 1e18 scale.
#[inline]
pub fn div_exp(a: Exp, b: Exp) -> MathResult<Exp> {
    mul_div(a.mantissa, EXP_SCALE, b.mantissa).map(Exp::new)
}

/// truncate(scalar / b): the integer quantity of units obtained by dividing
/// `scalar` by the ratio `b`. This is how share counts are derived from an
/// underlying amount and an exchange rate.
#[inline]
pub fn div_scalar_by_exp_truncate(scalar: u128, b: Exp) -> MathResult<u128> {
    mul_div(scalar, EXP_SCALE, b.mantissa)
}
