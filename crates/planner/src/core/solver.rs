//! Sizing solvers for position transitions.
//!
//! All inputs and outputs are human-scale `Decimal`s. Prices are quoted as
//! debt token per collateral token. Callers convert to base units once the
//! sizes are known.

use alloy::primitives::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{DEFAULT_DEBT_ACCRUAL_BUFFER, DEFAULT_SLIPPAGE, TYPICAL_PRECISION};
use crate::errors::{PlannerError, PlannerResult};
use crate::types::units::{to_base_units, FeeTier};

// ═══════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════

/// Runtime knobs passed into every solver and strategy call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Precision used where a token does not state its own.
    pub default_precision: u32,
    pub fee: FeeTier,
    /// Slippage for requests that do not state one.
    #[serde(with = "rust_decimal::serde::str")]
    pub default_slippage: Decimal,
    /// Extra fraction flashloaned when repaying all debt.
    #[serde(with = "rust_decimal::serde::str")]
    pub debt_accrual_buffer: Decimal,
    /// Magnitude below which `AmountUnit::Inferred` inputs count as human-scale.
    /// `None` disables inference.
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub scale_inference_threshold: Option<Decimal>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            default_precision: TYPICAL_PRECISION,
            fee: FeeTier::default(),
            default_slippage: DEFAULT_SLIPPAGE,
            debt_accrual_buffer: DEFAULT_DEBT_ACCRUAL_BUFFER,
            scale_inference_threshold: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Shared inputs
// ═══════════════════════════════════════════════════════════════════════════

/// Prices and costs a swap-based transition is sized against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketInputs {
    /// Protocol risk-engine price; governs the resulting ratio.
    pub oracle_price: Decimal,
    /// Achievable swap price; governs execution.
    pub market_price: Decimal,
    pub slippage: Decimal,
    /// Share of swap notional taken as fee.
    pub fee_rate: Decimal,
    /// Flashloan fee as a fraction of principal. Zero for own-credit sourcing.
    pub flashloan_fee: Decimal,
}

impl MarketInputs {
    fn validate(&self) -> PlannerResult<()> {
        if self.oracle_price <= Decimal::ZERO || self.market_price <= Decimal::ZERO {
            return Err(PlannerError::invalid_amount(format!(
                "prices must be positive (oracle {}, market {})",
                self.oracle_price, self.market_price
            )));
        }
        if self.slippage < Decimal::ZERO || self.slippage >= Decimal::ONE {
            return Err(PlannerError::invalid_amount(format!(
                "slippage {} outside [0, 1)",
                self.slippage
            )));
        }
        if self.fee_rate < Decimal::ZERO || self.fee_rate >= Decimal::ONE {
            return Err(PlannerError::invalid_amount(format!("fee rate {} outside [0, 1)", self.fee_rate)));
        }
        if self.flashloan_fee < Decimal::ZERO {
            return Err(PlannerError::invalid_amount(format!(
                "flashloan fee {} is negative",
                self.flashloan_fee
            )));
        }
        Ok(())
    }

    pub fn with_flashloan_fee(self, flashloan_fee: Decimal) -> Self {
        Self { flashloan_fee, ..self }
    }
}

/// Current balances, top-ups and the ratio to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatioInputs {
    pub collateral: Decimal,
    pub debt: Decimal,
    /// Debt-token capital supplied by the user.
    pub debt_top_up: Decimal,
    /// Collateral-token capital supplied by the user.
    pub collateral_top_up: Decimal,
    /// Collateral value over debt value after the transition.
    pub target_collateral_ratio: Decimal,
}

/// Collateralization ratio for a leverage multiple: `M / (M - 1)`.
pub fn collateral_ratio_for_multiple(multiple: Decimal) -> PlannerResult<Decimal> {
    if multiple <= Decimal::ONE {
        return Err(PlannerError::InfeasibleTarget {
            requested: multiple,
            minimum: Decimal::ONE,
            reason: "target multiple must exceed 1".into(),
        });
    }
    Ok(multiple / (multiple - Decimal::ONE))
}

/// Reject target ratios at or below the protocol's minimum.
pub fn ensure_above_minimum(target_ratio: Decimal, minimum_ratio: Decimal) -> PlannerResult<()> {
    if target_ratio <= minimum_ratio {
        return Err(PlannerError::InfeasibleTarget {
            requested: target_ratio,
            minimum: minimum_ratio,
            reason: "target collateralization ratio is at or below the protocol minimum".into(),
        });
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Deposit-funded loop solver
// ═══════════════════════════════════════════════════════════════════════════

/// Sizes of a loop to a minimum collateralization ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSizing {
    pub min_multiple: Decimal,
    pub lend_amount: U256,
    pub borrow_amount: U256,
    pub flashloan_amount: U256,
}

/// Size a flashloan-funded loop of `own_deposit` up to `min_collateral_ratio`
/// (a fraction, 0.77 for 77%).
///
/// Assumes collateral and debt trade 1:1 (the same asset or a wrapped or
/// staked equivalent). Not valid for pairs with a real price between them.
pub fn loop_to_min_collateral_ratio(
    own_deposit: Decimal,
    min_collateral_ratio: Decimal,
    precision: u32,
) -> PlannerResult<LoopSizing> {
    if min_collateral_ratio <= Decimal::ZERO || min_collateral_ratio >= Decimal::ONE {
        return Err(PlannerError::InfeasibleTarget {
            requested: min_collateral_ratio,
            minimum: Decimal::ZERO,
            reason: "minimum collateral ratio must lie strictly between 0 and 1".into(),
        });
    }
    if own_deposit <= Decimal::ZERO {
        return Err(PlannerError::invalid_amount("loop deposit must be positive"));
    }

    let min_multiple = Decimal::ONE / min_collateral_ratio;
    let per_unit = own_deposit / (min_multiple - Decimal::ONE);
    let lend = (per_unit * min_multiple).round_dp(precision);
    let borrow = per_unit.round_dp(precision);
    let flashloan = lend - own_deposit;

    debug!(
        %own_deposit,
        %min_collateral_ratio,
        %min_multiple,
        %lend,
        %borrow,
        %flashloan,
        "loop sizing"
    );

    Ok(LoopSizing {
        min_multiple,
        lend_amount: to_base_units(lend, precision)?,
        borrow_amount: to_base_units(borrow, precision)?,
        flashloan_amount: to_base_units(flashloan, precision)?,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Target-ratio solver
// ═══════════════════════════════════════════════════════════════════════════

/// Sizes for moving up in leverage: draw debt, swap into collateral, deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncreaseSizing {
    /// Debt-token amount sourced for the swap (flashloan principal or own credit).
    pub debt_to_swap: Decimal,
    /// Debt drawn from the protocol; covers the flashloan fee.
    pub borrow_amount: Decimal,
    /// Gross swap input, sourced debt plus the debt top-up.
    pub swap_input: Decimal,
    /// Fee on the swap, valued in debt token.
    pub fee: Decimal,
    pub collateral_from_swap: Decimal,
    pub resulting_collateral: Decimal,
    pub resulting_debt: Decimal,
}

/// Sizes for moving down in leverage: sell collateral, repay debt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecreaseSizing {
    pub collateral_to_sell: Decimal,
    /// Debt repaid from swap proceeds (flashloan principal when one is used).
    pub debt_repaid: Decimal,
    /// Expected swap output after fee and slippage.
    pub swap_output: Decimal,
    /// Fee on the swap, valued in debt token.
    pub fee: Decimal,
    pub resulting_collateral: Decimal,
    pub resulting_debt: Decimal,
}

/// Solve for the debt draw that lands the position on the target ratio.
///
/// With `O` oracle, `P' = P(1+s)`, fee `f`, flashloan fee `l`, target `R`:
/// `X = (P'(C·O - R·D) + Td(1-f)·O) / (P'·R·(1+l) - (1-f)·O)`.
pub fn solve_increase(market: &MarketInputs, inputs: &RatioInputs) -> PlannerResult<IncreaseSizing> {
    market.validate()?;
    let one = Decimal::ONE;
    let o = market.oracle_price;
    let p = market.market_price * (one + market.slippage);
    let f = market.fee_rate;
    let l = market.flashloan_fee;
    let r = inputs.target_collateral_ratio;
    let collateral = inputs.collateral + inputs.collateral_top_up;

    let denominator = p * r * (one + l) - (one - f) * o;
    if denominator <= Decimal::ZERO {
        return Err(PlannerError::InfeasibleTarget {
            requested: r,
            minimum: (one - f) * o / (p * (one + l)),
            reason: "swap costs exceed the leverage gained at this ratio".into(),
        });
    }
    let numerator = p * (collateral * o - r * inputs.debt) + inputs.debt_top_up * (one - f) * o;
    let debt_to_swap = numerator / denominator;
    if debt_to_swap <= Decimal::ZERO {
        return Err(PlannerError::InfeasibleTarget {
            requested: r,
            minimum: collateral * o / inputs.debt.max(Decimal::ONE),
            reason: "target ratio does not increase leverage".into(),
        });
    }

    let swap_input = debt_to_swap + inputs.debt_top_up;
    let collateral_from_swap = swap_input * (one - f) / p;
    let borrow_amount = debt_to_swap * (one + l);

    let sizing = IncreaseSizing {
        debt_to_swap,
        borrow_amount,
        swap_input,
        fee: swap_input * f,
        collateral_from_swap,
        resulting_collateral: collateral + collateral_from_swap,
        resulting_debt: inputs.debt + borrow_amount,
    };
    debug!(
        debt_to_swap = %sizing.debt_to_swap,
        borrow = %sizing.borrow_amount,
        collateral_from_swap = %sizing.collateral_from_swap,
        target_ratio = %r,
        "increase sizing"
    );
    Ok(sizing)
}

/// Solve for the collateral to sell so the position lands on the target ratio.
///
/// With `k = P(1-s)(1-f)/(1+l)`: `Y = (R·D - C·O) / (R·k - O)`, repaying `Y·k`.
pub fn solve_decrease(market: &MarketInputs, inputs: &RatioInputs) -> PlannerResult<DecreaseSizing> {
    market.validate()?;
    let one = Decimal::ONE;
    let o = market.oracle_price;
    let f = market.fee_rate;
    let l = market.flashloan_fee;
    let r = inputs.target_collateral_ratio;
    let collateral = inputs.collateral + inputs.collateral_top_up;
    let debt = inputs.debt - inputs.debt_top_up;
    if debt < Decimal::ZERO {
        return Err(PlannerError::InsufficientDebt {
            requested: inputs.debt_top_up,
            available: inputs.debt,
        });
    }

    let gross_rate = market.market_price * (one - market.slippage);
    let net_rate = gross_rate * (one - f);
    let k = net_rate / (one + l);
    let denominator = r * k - o;
    if denominator <= Decimal::ZERO {
        return Err(PlannerError::InfeasibleTarget {
            requested: r,
            minimum: o / k,
            reason: "swap costs exceed the debt repaid at this ratio".into(),
        });
    }
    let collateral_to_sell = (r * debt - collateral * o) / denominator;
    if collateral_to_sell <= Decimal::ZERO {
        return Err(PlannerError::InfeasibleTarget {
            requested: r,
            minimum: if debt.is_zero() { Decimal::ZERO } else { collateral * o / debt },
            reason: "target ratio does not decrease leverage".into(),
        });
    }
    if collateral_to_sell > collateral {
        return Err(PlannerError::InsufficientCollateral {
            requested: collateral_to_sell,
            available: collateral,
        });
    }

    let debt_repaid = collateral_to_sell * k;
    let sizing = DecreaseSizing {
        collateral_to_sell,
        debt_repaid,
        swap_output: collateral_to_sell * net_rate,
        fee: collateral_to_sell * gross_rate * f,
        resulting_collateral: collateral - collateral_to_sell,
        resulting_debt: debt - debt_repaid,
    };
    debug!(
        collateral_to_sell = %sizing.collateral_to_sell,
        debt_repaid = %sizing.debt_repaid,
        target_ratio = %r,
        "decrease sizing"
    );
    Ok(sizing)
}

// ═══════════════════════════════════════════════════════════════════════════
// Own-credit safety
// ═══════════════════════════════════════════════════════════════════════════

/// Ratio right after drawing debt and before the swap output is deposited.
pub fn intermediate_ratio_increase(oracle_price: Decimal, inputs: &RatioInputs, sizing: &IncreaseSizing) -> Decimal {
    let debt = inputs.debt + sizing.borrow_amount;
    if debt.is_zero() {
        return Decimal::MAX;
    }
    (inputs.collateral + inputs.collateral_top_up) * oracle_price / debt
}

/// Ratio right after withdrawing collateral and before the proceeds repay debt.
pub fn intermediate_ratio_decrease(oracle_price: Decimal, inputs: &RatioInputs, sizing: &DecreaseSizing) -> Decimal {
    let debt = inputs.debt - inputs.debt_top_up;
    if debt <= Decimal::ZERO {
        return Decimal::MAX;
    }
    (inputs.collateral + inputs.collateral_top_up - sizing.collateral_to_sell) * oracle_price / debt
}

// ═══════════════════════════════════════════════════════════════════════════
// Close
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseSizing {
    /// Debt plus accrual buffer.
    pub flashloan_amount: Decimal,
    /// Owed back to the provider including its fee.
    pub repayment: Decimal,
    /// Worst-case debt-token proceeds from selling all collateral.
    pub min_proceeds: Decimal,
    pub fee: Decimal,
}

/// Size a full close and check the collateral can repay the flashloan.
pub fn size_close(
    market: &MarketInputs,
    collateral: Decimal,
    debt: Decimal,
    accrual_buffer: Decimal,
) -> PlannerResult<CloseSizing> {
    market.validate()?;
    let one = Decimal::ONE;
    let gross = collateral * market.market_price * (one - market.slippage);
    let flashloan_amount = debt * (one + accrual_buffer);
    let repayment = flashloan_amount * (one + market.flashloan_fee);
    let min_proceeds = gross * (one - market.fee_rate);

    if min_proceeds < repayment {
        return Err(PlannerError::InfeasibleTarget {
            requested: min_proceeds,
            minimum: repayment,
            reason: "collateral proceeds cannot repay the flashloan".into(),
        });
    }
    debug!(%flashloan_amount, %repayment, %min_proceeds, "close sizing");
    Ok(CloseSizing {
        flashloan_amount,
        repayment,
        min_proceeds,
        fee: gross * market.fee_rate,
    })
}
