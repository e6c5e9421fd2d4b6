//! Base-unit conversion and fee arithmetic.
//!
//! Human-scale amounts (`1.5` ETH) and on-chain base units (`1.5e18` wei) are
//! both carried as `Decimal`; conversion is exact power-of-ten scaling. Values
//! leaving the engine as step amounts are `U256`.

use alloy::primitives::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{DEFAULT_FEE_BIPS, FEE_BASE, MAX_DECIMAL_PRECISION};
use crate::errors::{PlannerError, PlannerResult};

// ---------------------------------------------------------------------------
// Power-of-ten scaling
// ---------------------------------------------------------------------------

fn check_precision(precision: u32) -> PlannerResult<()> {
    if precision > MAX_DECIMAL_PRECISION {
        return Err(PlannerError::invalid_amount(format!(
            "precision {precision} exceeds {MAX_DECIMAL_PRECISION}"
        )));
    }
    Ok(())
}

fn check_non_negative(amount: Decimal) -> PlannerResult<()> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(PlannerError::invalid_amount(format!("negative amount {amount}")));
    }
    Ok(())
}

/// `10^precision` as a `Decimal`. Caller guarantees `precision <= 28`.
fn pow10(precision: u32) -> Decimal {
    Decimal::from_i128_with_scale(10i128.pow(precision), 0)
}

/// Convert a human-scale amount to integer base units.
///
/// Exact for inputs with at most `precision` fractional digits; extra digits
/// are truncated (rounded toward zero).
pub fn to_base_units(amount: Decimal, precision: u32) -> PlannerResult<U256> {
    check_precision(precision)?;
    check_non_negative(amount)?;

    let mantissa = amount.mantissa().unsigned_abs();
    let scale = amount.scale();

    if scale <= precision {
        U256::from(mantissa)
            .checked_mul(U256::from(10u128.pow(precision - scale)))
            .ok_or_else(|| PlannerError::invalid_amount(format!("{amount} overflows U256")))
    } else {
        Ok(U256::from(mantissa / 10u128.pow(scale - precision)))
    }
}

/// Convert integer base units back to a human-scale amount.
pub fn from_base_units(amount: U256, precision: u32) -> PlannerResult<Decimal> {
    check_precision(precision)?;
    let raw = u128::try_from(amount)
        .ok()
        .and_then(|v| i128::try_from(v).ok())
        .ok_or_else(|| PlannerError::invalid_amount(format!("{amount} does not fit a Decimal")))?;
    Decimal::try_from_i128_with_scale(raw, precision)
        .map(|d| d.normalize())
        .map_err(|e| PlannerError::invalid_amount(format!("{amount}: {e}")))
}

/// Human-scale amount to base units kept as an integral `Decimal`.
pub fn to_base_decimal(amount: Decimal, precision: u32) -> PlannerResult<Decimal> {
    check_precision(precision)?;
    check_non_negative(amount)?;
    amount
        .checked_mul(pow10(precision))
        .map(|d| d.trunc())
        .ok_or_else(|| PlannerError::invalid_amount(format!("{amount} overflows at precision {precision}")))
}

/// Base units held in a `Decimal` back to human scale.
pub fn from_base_decimal(amount: Decimal, precision: u32) -> PlannerResult<Decimal> {
    check_precision(precision)?;
    amount
        .checked_div(pow10(precision))
        .ok_or_else(|| PlannerError::invalid_amount(format!("{amount} cannot be scaled down")))
}

/// Convert an integral `Decimal` to `U256` for on-chain step amounts.
///
/// Truncates any fractional part (token amounts are integer native units).
pub fn decimal_to_u256(d: Decimal) -> PlannerResult<U256> {
    check_non_negative(d)?;
    let whole = d.trunc();
    Ok(U256::from(whole.mantissa().unsigned_abs() / 10u128.pow(whole.scale())))
}

/// Convert a `U256` base-unit amount to an integral `Decimal`.
pub fn u256_to_decimal(v: U256) -> PlannerResult<Decimal> {
    from_base_units(v, 0)
}

// ---------------------------------------------------------------------------
// Fees
// ---------------------------------------------------------------------------

/// Fee embedded in `gross`: `floor(gross * fee_bips / (fee_bips + fee_base))`.
///
/// `fee + net_amount == gross`. Rounds down so the user is never over-charged
/// by a fractional unit. Grosses whose product with `fee_bips` exceeds the
/// `Decimal` range divide first.
pub fn calculate_fee(gross: Decimal, fee_bips: u32, fee_base: u32) -> Decimal {
    let bips = Decimal::from(fee_bips);
    let denominator = bips + Decimal::from(fee_base);
    if denominator.is_zero() || gross <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    match gross.checked_mul(bips) {
        Some(scaled) => (scaled / denominator).floor(),
        None => (gross / denominator * bips).floor(),
    }
}

/// Amount left after the embedded fee is taken.
pub fn net_amount(gross: Decimal, fee_bips: u32, fee_base: u32) -> Decimal {
    gross - calculate_fee(gross, fee_bips, fee_base)
}

/// A swap fee tier, e.g. 20 / 10 000 = 0.2%.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeTier {
    pub bips: u32,
    pub base: u32,
}

impl Default for FeeTier {
    fn default() -> Self {
        Self {
            bips: DEFAULT_FEE_BIPS,
            base: FEE_BASE,
        }
    }
}

impl FeeTier {
    /// Share of a gross amount taken as fee, matching [`calculate_fee`].
    pub fn fraction_of_gross(&self) -> Decimal {
        let denominator = Decimal::from(self.bips) + Decimal::from(self.base);
        if denominator.is_zero() {
            return Decimal::ZERO;
        }
        Decimal::from(self.bips) / denominator
    }

    pub fn fee_on(&self, gross: Decimal) -> Decimal {
        calculate_fee(gross, self.bips, self.base)
    }

    pub fn as_percentage(&self) -> Percentage {
        Percentage::new(Decimal::from(self.bips), Decimal::from(self.base))
    }
}

/// A value expressed against a base, e.g. 20 out of 10 000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Percentage {
    #[serde(with = "rust_decimal::serde::str")]
    pub value: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub base: Decimal,
}

impl Percentage {
    pub fn new(value: Decimal, base: Decimal) -> Self {
        Self { value, base }
    }

    /// `value / base`, or zero for a zero base.
    pub fn as_decimal(&self) -> Decimal {
        if self.base.is_zero() {
            return Decimal::ZERO;
        }
        self.value / self.base
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.as_decimal() * Decimal::ONE_HUNDRED)
    }
}

// ---------------------------------------------------------------------------
// Tagged amount inputs
// ---------------------------------------------------------------------------

/// Scale of an amount supplied at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmountUnit {
    /// `1.5` means one and a half tokens.
    Human,
    /// Already integer base units.
    Base,
    /// Guess from magnitude. Only honoured when a threshold is configured.
    Inferred,
}

/// A caller-supplied amount and the unit it is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountInput {
    #[serde(with = "rust_decimal::serde::str")]
    pub value: Decimal,
    pub unit: AmountUnit,
}

impl AmountInput {
    pub const ZERO: AmountInput = AmountInput {
        value: Decimal::ZERO,
        unit: AmountUnit::Base,
    };

    pub fn human(value: Decimal) -> Self {
        Self {
            value,
            unit: AmountUnit::Human,
        }
    }

    pub fn base(value: Decimal) -> Self {
        Self {
            value,
            unit: AmountUnit::Base,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    /// Resolve to integer base units at `precision`.
    ///
    /// `Inferred` inputs below `inference_threshold` are treated as
    /// human-scale; with no threshold configured they are rejected.
    pub fn to_base(&self, precision: u32, inference_threshold: Option<Decimal>) -> PlannerResult<Decimal> {
        check_non_negative(self.value)?;
        match self.unit {
            AmountUnit::Human => to_base_decimal(self.value, precision),
            AmountUnit::Base => {
                if !self.value.fract().is_zero() {
                    return Err(PlannerError::invalid_amount(format!(
                        "base-unit amount {} has a fractional part",
                        self.value
                    )));
                }
                Ok(self.value)
            }
            AmountUnit::Inferred => {
                let threshold = inference_threshold.ok_or_else(|| {
                    PlannerError::invalid_amount("unit inference is disabled; tag the amount as human or base")
                })?;
                if self.value < threshold {
                    to_base_decimal(self.value, precision)
                } else {
                    Ok(self.value.trunc())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_to_base_units_eth() {
        let wei = to_base_units(dec!(1.5), 18).unwrap();
        assert_eq!(wei, U256::from(1_500_000_000_000_000_000u128));
    }

    #[test]
    fn test_to_base_units_usdc() {
        assert_eq!(to_base_units(dec!(2500.25), 6).unwrap(), U256::from(2_500_250_000u64));
    }

    #[test]
    fn test_to_base_units_truncates_excess_digits() {
        assert_eq!(to_base_units(dec!(0.123456789), 6).unwrap(), U256::from(123_456u64));
    }

    #[test]
    fn test_to_base_units_rejects_negative() {
        assert!(matches!(
            to_base_units(dec!(-1), 18),
            Err(PlannerError::InvalidAmount { .. })
        ));
    }

    #[test]
    fn test_from_base_units_wbtc() {
        assert_eq!(from_base_units(U256::from(12_345_678u64), 8).unwrap(), dec!(0.12345678));
    }

    #[test]
    fn test_from_base_units_rejects_oversized() {
        assert!(from_base_units(U256::MAX, 18).is_err());
    }

    #[test]
    fn test_precision_above_decimal_scale_rejected() {
        assert!(to_base_units(dec!(1), 29).is_err());
    }

    #[test]
    fn test_decimal_to_u256_truncates() {
        assert_eq!(decimal_to_u256(dec!(42.9)).unwrap(), U256::from(42u64));
    }

    #[test]
    fn test_calculate_fee_embedded() {
        // 10 020 gross at 20 bips: 20 fee + 10 000 net.
        assert_eq!(calculate_fee(dec!(10020), 20, 10_000), dec!(20));
        assert_eq!(net_amount(dec!(10020), 20, 10_000), dec!(10000));
    }

    #[test]
    fn test_calculate_fee_rounds_down() {
        assert_eq!(calculate_fee(dec!(1000), 20, 10_000), dec!(1));
    }

    #[test]
    fn test_calculate_fee_near_decimal_range() {
        // 5e27 * 20 does not fit a Decimal.
        let gross = dec!(5_000_000_000_000_000_000_000_000_000);
        let fee = calculate_fee(gross, 20, 10_000);
        assert_eq!(fee, dec!(9_980_039_920_159_680_638_722_554));
        assert_eq!(fee + net_amount(gross, 20, 10_000), gross);
        assert!(calculate_fee(Decimal::MAX, 20, 10_000) < Decimal::MAX);
    }

    #[test]
    fn test_fee_tier_fraction_matches_calculate_fee() {
        let tier = FeeTier::default();
        let gross = dec!(1_002_000);
        assert_eq!((gross * tier.fraction_of_gross()).round_dp(12), tier.fee_on(gross));
    }

    #[test]
    fn test_percentage_as_decimal() {
        let fee = Percentage::new(dec!(20), dec!(10000));
        assert_eq!(fee.as_decimal(), dec!(0.002));
        assert!(fee.to_string().starts_with("0.2"));
    }

    #[test]
    fn test_amount_input_human() {
        let input = AmountInput::human(dec!(2));
        assert_eq!(input.to_base(6, None).unwrap(), dec!(2_000_000));
    }

    #[test]
    fn test_amount_input_base_rejects_fraction() {
        assert!(AmountInput::base(dec!(1.5)).to_base(18, None).is_err());
    }

    #[test]
    fn test_amount_input_inferred_requires_threshold() {
        let input = AmountInput {
            value: dec!(5),
            unit: AmountUnit::Inferred,
        };
        assert!(input.to_base(18, None).is_err());
        assert_eq!(
            input.to_base(18, Some(dec!(1_000_000_000))).unwrap(),
            dec!(5_000_000_000_000_000_000)
        );
    }

    #[test]
    fn test_amount_input_inferred_keeps_large_values() {
        let input = AmountInput {
            value: dec!(5_000_000_000),
            unit: AmountUnit::Inferred,
        };
        assert_eq!(input.to_base(18, Some(dec!(1_000_000_000))).unwrap(), dec!(5_000_000_000));
    }

    fn precision() -> impl Strategy<Value = u32> {
        prop_oneof![Just(6u32), Just(8u32), Just(18u32)]
    }

    proptest! {
        #[test]
        fn prop_base_unit_round_trip(mantissa in 0u64..1_000_000_000_000u64, p in precision(), scale_seed in 0u32..=18) {
            let scale = scale_seed.min(p);
            let x = Decimal::new(mantissa as i64, scale);
            let base = to_base_units(x, p).unwrap();
            prop_assert_eq!(from_base_units(base, p).unwrap(), x);
        }

        #[test]
        fn prop_fee_decomposes_gross(gross in 0u64..u64::MAX / 4, bips in 0u32..1_000) {
            let gross = Decimal::from(gross);
            prop_assert_eq!(calculate_fee(gross, bips, FEE_BASE) + net_amount(gross, bips, FEE_BASE), gross);
        }

        #[test]
        fn prop_fee_monotonic_in_gross(a in 0u64..u64::MAX / 4, b in 0u64..u64::MAX / 4, bips in 0u32..1_000) {
            let (lo, hi) = (a.min(b), a.max(b));
            prop_assert!(
                calculate_fee(Decimal::from(lo), bips, FEE_BASE) <= calculate_fee(Decimal::from(hi), bips, FEE_BASE)
            );
        }
    }
}
