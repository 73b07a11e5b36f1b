//! Fixed-point amounts, prices and ratios.
//!
//! Every value is an integer scaled by [`DECIMAL_PRECISION`] (1e18). Products
//! of two scaled values are computed on 256 bits before being divided back.

use ethnum::U256;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::marker::PhantomData;
use std::ops::{Add, AddAssign, Sub, SubAssign};

pub const DECIMAL_PRECISION: u128 = 1_000_000_000_000_000_000;

/// Scale of the nominal collateral ratio. Larger than [`DECIMAL_PRECISION`]
/// so that small troves still get a distinct ordering key.
pub const NICR_PRECISION: u128 = 100_000_000_000_000_000_000;

/// Upper bound on the exponent accepted by [`dec_pow`] (1000 years in minutes).
pub const MAX_DECAY_MINUTES: u64 = 525_600_000;

/// Computes `a * b / c` on 256 bits, saturating at `u128::MAX`.
///
/// Panics if `c` is zero.
pub fn mul_div(a: u128, b: u128, c: u128) -> u128 {
    assert_ne!(c, 0, "bug: mul_div by zero");
    let result = U256::from(a) * U256::from(b) / U256::from(c);
    if result > U256::from(u128::MAX) {
        u128::MAX
    } else {
        result.as_u128()
    }
}

/// Returns `(amount * 1e18 + carry) / divisor` together with the remainder
/// of that division.
pub fn scaled_div_rem(amount: u128, carry: u128, divisor: u128) -> (u128, u128) {
    assert_ne!(divisor, 0, "bug: scaled_div_rem by zero");
    let numerator = U256::from(amount) * U256::from(DECIMAL_PRECISION) + U256::from(carry);
    let divisor = U256::from(divisor);
    let quotient = numerator / divisor;
    let remainder = numerator - quotient * divisor;
    assert!(
        quotient <= U256::from(u128::MAX),
        "bug: reward per unit staked overflows"
    );
    (quotient.as_u128(), remainder.as_u128())
}

/// Multiplication of two 1e18 fixed-point values, rounding half up.
pub fn dec_mul(x: u128, y: u128) -> u128 {
    let product = U256::from(x) * U256::from(y) + U256::from(DECIMAL_PRECISION / 2);
    let result = product / U256::from(DECIMAL_PRECISION);
    if result > U256::from(u128::MAX) {
        u128::MAX
    } else {
        result.as_u128()
    }
}

/// `base ^ minutes` in 1e18 fixed point, by exponentiation by squaring.
pub fn dec_pow(base: Ratio, minutes: u64) -> Ratio {
    let mut n = minutes.min(MAX_DECAY_MINUTES);
    if n == 0 {
        return Ratio::ONE;
    }
    let mut y = DECIMAL_PRECISION;
    let mut x = base.0;
    while n > 1 {
        if n % 2 == 0 {
            x = dec_mul(x, x);
            n /= 2;
        } else {
            y = dec_mul(x, y);
            x = dec_mul(x, x);
            n = (n - 1) / 2;
        }
    }
    Ratio(dec_mul(x, y))
}

fn decimal_to_fixed(value: Decimal) -> Option<u128> {
    if value.is_sign_negative() {
        return None;
    }
    value
        .checked_mul(Decimal::from(DECIMAL_PRECISION as u64))?
        .trunc()
        .to_u128()
}

fn fixed_to_decimal(raw: u128) -> Decimal {
    if raw > i128::MAX as u128 {
        return Decimal::MAX;
    }
    Decimal::try_from_i128_with_scale(raw as i128, 18).unwrap_or(Decimal::MAX)
}

/// An amount of some unit, stored as an integer of the smallest subunit.
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct Amount<Unit>(u128, #[serde(skip)] PhantomData<Unit>);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CollUnit {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DebtUnit {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StakeUnit {}

/// Collateral token amount.
pub type Coll = Amount<CollUnit>;
/// Stablecoin amount.
pub type Debt = Amount<DebtUnit>;
/// Weight of a trove in the redistribution scheme.
pub type Stake = Amount<StakeUnit>;

impl<Unit> Amount<Unit> {
    pub const ZERO: Self = Self(0, PhantomData);
    pub const MAX: Self = Self(u128::MAX, PhantomData);

    pub const fn new(value: u128) -> Self {
        Self(value, PhantomData)
    }

    pub const fn get(self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self::new)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self::new)
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self::new(self.0.saturating_sub(rhs.0))
    }

    /// `self * numerator / denominator`, rounding down.
    pub fn mul_div(self, numerator: u128, denominator: u128) -> Self {
        Self::new(mul_div(self.0, numerator, denominator))
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / DECIMAL_PRECISION as f64
    }
}

impl<Unit> Clone for Amount<Unit> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Unit> Copy for Amount<Unit> {}

impl<Unit> PartialEq for Amount<Unit> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Unit> Eq for Amount<Unit> {}

impl<Unit> PartialEq<u128> for Amount<Unit> {
    fn eq(&self, other: &u128) -> bool {
        self.0 == *other
    }
}

impl<Unit> PartialOrd for Amount<Unit> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<Unit> Ord for Amount<Unit> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl<Unit> std::hash::Hash for Amount<Unit> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl<Unit> Default for Amount<Unit> {
    fn default() -> Self {
        Self::ZERO
    }
}

impl<Unit> fmt::Debug for Amount<Unit> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<Unit> fmt::Display for Amount<Unit> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<Unit> From<u128> for Amount<Unit> {
    fn from(value: u128) -> Self {
        Self::new(value)
    }
}

impl<Unit> Add for Amount<Unit> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        match self.0.checked_add(rhs.0) {
            Some(sum) => Self::new(sum),
            None => panic!("bug: amount overflow {} + {}", self.0, rhs.0),
        }
    }
}

impl<Unit> AddAssign for Amount<Unit> {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl<Unit> Sub for Amount<Unit> {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        assert!(
            self.0 >= rhs.0,
            "bug: amount underflow {} - {}",
            self.0,
            rhs.0
        );
        Self::new(self.0 - rhs.0)
    }
}

impl<Unit> SubAssign for Amount<Unit> {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl<Unit> Sum for Amount<Unit> {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, x| acc + x)
    }
}

/// Stablecoin units per whole collateral unit, scaled by 1e18.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Price(u128);

impl Price {
    pub const fn new(raw: u128) -> Self {
        Self(raw)
    }

    pub fn from_decimal(value: Decimal) -> Option<Self> {
        decimal_to_fixed(value).map(Self)
    }

    pub const fn get(self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / DECIMAL_PRECISION as f64
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", fixed_to_decimal(self.0))
    }
}

/// Dimensionless ratio scaled by 1e18 (`Ratio::ONE` is 100%).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ratio(u128);

impl Ratio {
    pub const ZERO: Ratio = Ratio(0);
    pub const ONE: Ratio = Ratio(DECIMAL_PRECISION);
    pub const MAX: Ratio = Ratio(u128::MAX);

    pub const fn new(raw: u128) -> Self {
        Self(raw)
    }

    pub fn from_decimal(value: Decimal) -> Option<Self> {
        decimal_to_fixed(value).map(Self)
    }

    pub const fn get(self) -> u128 {
        self.0
    }

    pub fn to_decimal(self) -> Decimal {
        fixed_to_decimal(self.0)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / DECIMAL_PRECISION as f64
    }

    pub fn saturating_add(self, rhs: Ratio) -> Ratio {
        Ratio(self.0.saturating_add(rhs.0))
    }

    /// Product of two ratios, rounding down.
    pub fn mul(self, rhs: Ratio) -> Ratio {
        Ratio(mul_div(self.0, rhs.0, DECIMAL_PRECISION))
    }

    /// Applies the ratio to an amount, rounding down.
    pub fn apply<Unit>(self, amount: Amount<Unit>) -> Amount<Unit> {
        amount.mul_div(self.0, DECIMAL_PRECISION)
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

/// Price-independent ordering key of a trove: `coll * 1e20 / debt`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NominalRatio(u128);

impl NominalRatio {
    pub const ZERO: NominalRatio = NominalRatio(0);
    pub const MAX: NominalRatio = NominalRatio(u128::MAX);

    pub const fn new(raw: u128) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u128 {
        self.0
    }

    pub fn abs_diff(self, other: NominalRatio) -> u128 {
        self.0.abs_diff(other.0)
    }
}

impl fmt::Display for NominalRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stablecoin value of `coll` at `price`.
pub fn coll_value(coll: Coll, price: Price) -> Debt {
    Debt::new(mul_div(coll.get(), price.get(), DECIMAL_PRECISION))
}

/// Collateral worth `debt` at `price`, rounding down.
pub fn debt_to_coll(debt: Debt, price: Price) -> Coll {
    assert!(!price.is_zero(), "bug: zero price");
    Coll::new(mul_div(debt.get(), DECIMAL_PRECISION, price.get()))
}

/// Collateralization ratio: value of `coll` at `price` over `debt`.
/// A debt-free position has an infinite ratio.
pub fn compute_cr(coll: Coll, debt: Debt, price: Price) -> Ratio {
    if debt.is_zero() {
        return Ratio::MAX;
    }
    Ratio(mul_div(coll.get(), price.get(), debt.get()))
}

pub fn compute_nominal_cr(coll: Coll, debt: Debt) -> NominalRatio {
    if debt.is_zero() {
        return NominalRatio::MAX;
    }
    NominalRatio(mul_div(coll.get(), NICR_PRECISION, debt.get()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const E18: u128 = DECIMAL_PRECISION;

    #[test]
    fn mul_div_does_not_overflow_on_large_products() {
        // 2e29 collateral at a price of 100 is 2e49 before the division.
        let coll = 200_000_000_000 * E18;
        assert_eq!(mul_div(coll, 100 * E18, E18), coll * 100);
    }

    #[test]
    fn mul_div_saturates() {
        assert_eq!(mul_div(u128::MAX, 10, 1), u128::MAX);
    }

    #[test]
    fn collateral_ratio_of_known_trove() {
        let coll = Coll::new(10 * E18);
        let debt = Debt::new(500 * E18);
        let price = Price::new(100 * E18);
        assert_eq!(compute_cr(coll, debt, price), Ratio::new(2 * E18));
        assert_eq!(compute_cr(coll, Debt::ZERO, price), Ratio::MAX);
        assert_eq!(
            compute_nominal_cr(coll, debt),
            NominalRatio::new(2 * E18)
        );
    }

    #[test]
    fn conversions_between_collateral_and_debt() {
        let price = Price::new(200 * E18);
        assert_eq!(coll_value(Coll::new(3 * E18), price), Debt::new(600 * E18));
        assert_eq!(debt_to_coll(Debt::new(600 * E18), price), Coll::new(3 * E18));
    }

    #[test]
    fn decimal_round_trip() {
        let mcr = Ratio::from_decimal(dec!(1.1)).unwrap();
        assert_eq!(mcr.get(), 1_100_000_000_000_000_000);
        assert_eq!(mcr.to_decimal(), dec!(1.1));
        assert!(Ratio::from_decimal(dec!(-1)).is_none());
        assert_eq!(Ratio::MAX.to_decimal(), Decimal::MAX);
    }

    #[test]
    fn dec_pow_matches_repeated_multiplication() {
        let factor = Ratio::from_decimal(dec!(0.999037758833783)).unwrap();
        assert_eq!(dec_pow(factor, 0), Ratio::ONE);
        assert_eq!(dec_pow(factor, 1), factor);

        let mut expected = E18;
        for _ in 0..7 {
            expected = dec_mul(expected, factor.get());
        }
        let got = dec_pow(factor, 7).get();
        assert!(got.abs_diff(expected) <= 10, "{got} vs {expected}");

        // 720 minutes is the 12 hour half-life.
        let half_life = dec_pow(factor, 720).to_f64();
        assert!((half_life - 0.5).abs() < 0.001, "half life factor {half_life}");
    }

    #[test]
    fn scaled_division_keeps_remainder() {
        let (q, r) = scaled_div_rem(10, 0, 3 * E18);
        assert_eq!(q, 3);
        assert_eq!(r, E18);
        let (q, r) = scaled_div_rem(10, r, 3 * E18);
        assert_eq!((q, r), (3, 2 * E18));
    }

    #[test]
    #[should_panic(expected = "amount underflow")]
    fn amount_subtraction_underflow_panics() {
        let _ = Coll::new(1) - Coll::new(2);
    }

    #[test]
    fn amounts_sum_and_compare() {
        let total: Debt = [1u128, 2, 3].into_iter().map(Debt::new).sum();
        assert_eq!(total, 6);
        assert!(Debt::new(5) > Debt::new(4));
        assert_eq!(Coll::new(10).saturating_sub(Coll::new(20)), Coll::ZERO);
    }
}
