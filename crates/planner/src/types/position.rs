use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::MAX_DECIMAL_PRECISION;
use crate::errors::{PlannerError, PlannerResult};

/// A quantity of one asset, held in integer base units.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenAmount {
    pub symbol: String,
    pub precision: u32,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

impl TokenAmount {
    pub fn new(symbol: impl Into<String>, precision: u32, amount: Decimal) -> PlannerResult<Self> {
        let symbol = symbol.into();
        if precision > MAX_DECIMAL_PRECISION {
            return Err(PlannerError::invalid_amount(format!(
                "{symbol} precision {precision} exceeds {MAX_DECIMAL_PRECISION}"
            )));
        }
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(PlannerError::invalid_amount(format!("{symbol} amount {amount} is negative")));
        }
        Ok(Self {
            symbol,
            precision,
            amount,
        })
    }

    pub fn zero(symbol: impl Into<String>, precision: u32) -> PlannerResult<Self> {
        Self::new(symbol, precision, Decimal::ZERO)
    }

    /// Same token, different amount.
    pub fn with_amount(&self, amount: Decimal) -> Self {
        Self {
            symbol: self.symbol.clone(),
            precision: self.precision,
            amount,
        }
    }

    /// Amount in human scale (`amount / 10^precision`).
    pub fn normalized(&self) -> Decimal {
        let scale = Decimal::from_i128_with_scale(10i128.pow(self.precision.min(MAX_DECIMAL_PRECISION)), 0);
        self.amount / scale
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.normalized(), self.symbol)
    }
}

/// Protocol risk bucket (AAVE e-mode category, Maker ilk parameters).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionCategory {
    /// LTV at which the position becomes liquidatable.
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidation_threshold: Decimal,
    /// Highest LTV the protocol lets a user borrow up to.
    #[serde(with = "rust_decimal::serde::str")]
    pub max_loan_to_value: Decimal,
    /// Smallest debt the protocol accepts, in debt-token base units.
    #[serde(with = "rust_decimal::serde::str")]
    pub dust_limit: Decimal,
}

/// Leverage state of a position, stored as loan-to-value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RiskRatio {
    #[serde(with = "rust_decimal::serde::str")]
    loan_to_value: Decimal,
}

impl RiskRatio {
    pub const NO_DEBT: RiskRatio = RiskRatio {
        loan_to_value: Decimal::ZERO,
    };

    pub fn from_loan_to_value(loan_to_value: Decimal) -> Self {
        Self { loan_to_value }
    }

    /// `ltv = 1 - 1/multiple`. Multiples below one are rejected.
    pub fn from_multiple(multiple: Decimal) -> PlannerResult<Self> {
        if multiple < Decimal::ONE {
            return Err(PlannerError::InfeasibleTarget {
                requested: multiple,
                minimum: Decimal::ONE,
                reason: "multiple must be at least 1".into(),
            });
        }
        Ok(Self {
            loan_to_value: Decimal::ONE - Decimal::ONE / multiple,
        })
    }

    /// `ltv = 1 / collateralization_ratio`.
    pub fn from_collateralization_ratio(ratio: Decimal) -> PlannerResult<Self> {
        if ratio <= Decimal::ZERO {
            return Err(PlannerError::InfeasibleTarget {
                requested: ratio,
                minimum: Decimal::ZERO,
                reason: "collateralization ratio must be positive".into(),
            });
        }
        Ok(Self {
            loan_to_value: Decimal::ONE / ratio,
        })
    }

    pub fn loan_to_value(&self) -> Decimal {
        self.loan_to_value
    }

    /// `1 / (1 - ltv)`; `Decimal::MAX` for an insolvent position.
    pub fn multiple(&self) -> Decimal {
        if self.loan_to_value >= Decimal::ONE {
            return Decimal::MAX;
        }
        Decimal::ONE / (Decimal::ONE - self.loan_to_value)
    }

    /// Collateral value over debt value; `Decimal::MAX` with no debt.
    pub fn collateralization_ratio(&self) -> Decimal {
        if self.loan_to_value.is_zero() {
            return Decimal::MAX;
        }
        Decimal::ONE / self.loan_to_value
    }
}

impl fmt::Display for RiskRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ltv {} ({}x)", self.loan_to_value.round_dp(6), self.multiple().round_dp(6))
    }
}

/// A leveraged lending position.
///
/// `oracle_price` is the collateral priced in debt-token terms. Two positions
/// are equal iff debt, collateral, oracle price and category are all equal.
/// Transformations return a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub debt: TokenAmount,
    pub collateral: TokenAmount,
    #[serde(with = "rust_decimal::serde::str")]
    pub oracle_price: Decimal,
    pub category: PositionCategory,
}

impl Position {
    pub fn new(
        debt: TokenAmount,
        collateral: TokenAmount,
        oracle_price: Decimal,
        category: PositionCategory,
    ) -> PlannerResult<Self> {
        if oracle_price <= Decimal::ZERO {
            return Err(PlannerError::invalid_amount(format!(
                "oracle price {oracle_price} must be positive"
            )));
        }
        Ok(Self {
            debt,
            collateral,
            oracle_price,
            category,
        })
    }

    // -----------------------------------------------------------------------
    // Derived views
    // -----------------------------------------------------------------------

    /// Debt expressed in collateral-token human units.
    fn debt_in_collateral(&self) -> Decimal {
        self.debt.normalized() / self.oracle_price
    }

    pub fn risk_ratio(&self) -> RiskRatio {
        let collateral = self.collateral.normalized();
        if collateral.is_zero() {
            return if self.debt.is_zero() {
                RiskRatio::NO_DEBT
            } else {
                RiskRatio::from_loan_to_value(Decimal::ONE)
            };
        }
        RiskRatio::from_loan_to_value(self.debt_in_collateral() / collateral)
    }

    /// Collateral value times liquidation threshold over debt. `None` without debt.
    pub fn health_factor(&self) -> Option<Decimal> {
        if self.debt.is_zero() {
            return None;
        }
        Some(
            self.collateral.normalized() * self.oracle_price * self.category.liquidation_threshold
                / self.debt.normalized(),
        )
    }

    /// Oracle price at which the position hits its liquidation threshold.
    pub fn liquidation_price(&self) -> Option<Decimal> {
        let collateral = self.collateral.normalized();
        if self.debt.is_zero() || collateral.is_zero() || self.category.liquidation_threshold.is_zero() {
            return None;
        }
        Some(self.debt.normalized() / (collateral * self.category.liquidation_threshold))
    }

    /// Extra debt (base units) available before reaching the max LTV.
    pub fn max_debt_to_borrow(&self) -> Decimal {
        let capacity = self.collateral.normalized() * self.oracle_price * self.category.max_loan_to_value;
        let headroom = (capacity - self.debt.normalized()).max(Decimal::ZERO);
        let scale = Decimal::from_i128_with_scale(10i128.pow(self.debt.precision.min(MAX_DECIMAL_PRECISION)), 0);
        (headroom * scale).floor()
    }

    /// Riskiest ratio the protocol lets a user configure.
    pub fn min_configurable_risk_ratio(&self) -> RiskRatio {
        RiskRatio::from_loan_to_value(self.category.max_loan_to_value)
    }

    /// Whether paying back `amount` would settle the whole debt.
    pub fn is_full_payback(&self, amount: Decimal) -> bool {
        amount >= self.debt.amount
    }

    pub fn is_empty(&self) -> bool {
        self.debt.is_zero() && self.collateral.is_zero()
    }

    // -----------------------------------------------------------------------
    // Transformations
    // -----------------------------------------------------------------------

    pub fn deposit(&self, amount: Decimal) -> Position {
        Position {
            collateral: self.collateral.with_amount(self.collateral.amount + amount),
            ..self.clone()
        }
    }

    pub fn withdraw(&self, amount: Decimal) -> PlannerResult<Position> {
        if amount > self.collateral.amount {
            return Err(PlannerError::InsufficientCollateral {
                requested: amount,
                available: self.collateral.amount,
            });
        }
        Ok(Position {
            collateral: self.collateral.with_amount(self.collateral.amount - amount),
            ..self.clone()
        })
    }

    pub fn borrow(&self, amount: Decimal) -> Position {
        Position {
            debt: self.debt.with_amount(self.debt.amount + amount),
            ..self.clone()
        }
    }

    /// Reduce debt, clamped at zero.
    pub fn payback(&self, amount: Decimal) -> Position {
        Position {
            debt: self.debt.with_amount((self.debt.amount - amount).max(Decimal::ZERO)),
            ..self.clone()
        }
    }
}
