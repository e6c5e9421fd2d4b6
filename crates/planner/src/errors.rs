use rust_decimal::Decimal;
use thiserror::Error;

/// Typed error hierarchy for the planning engine.
///
/// Validation and infeasibility variants are produced locally, before any plan
/// is built. Collaborator failures pass through `External` untouched.
#[derive(Error, Debug)]
pub enum PlannerError {
    // -- Validation ---------------------------------------------------------
    #[error("{protocol} has no market for {symbol}")]
    UnsupportedAsset { protocol: String, symbol: String },

    #[error("no flashloan provider configured for network {network}")]
    UnsupportedNetwork { network: String },

    #[error("insufficient collateral: requested {requested}, available {available}")]
    InsufficientCollateral {
        requested: Decimal,
        available: Decimal,
    },

    #[error("insufficient debt: requested {requested}, available {available}")]
    InsufficientDebt {
        requested: Decimal,
        available: Decimal,
    },

    #[error("invalid amount: {reason}")]
    InvalidAmount { reason: String },

    // -- Solver -------------------------------------------------------------
    #[error("infeasible target: {reason} (requested {requested}, minimum {minimum})")]
    InfeasibleTarget {
        requested: Decimal,
        minimum: Decimal,
        reason: String,
    },

    // -- Configuration ------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),

    // -- Forwarded errors ---------------------------------------------------
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl PlannerError {
    pub(crate) fn invalid_amount(reason: impl Into<String>) -> Self {
        Self::InvalidAmount {
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported_asset(protocol: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self::UnsupportedAsset {
            protocol: protocol.into(),
            symbol: symbol.into(),
        }
    }

    /// Whether the error is a local validation failure (never retried).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedAsset { .. }
                | Self::UnsupportedNetwork { .. }
                | Self::InsufficientCollateral { .. }
                | Self::InsufficientDebt { .. }
                | Self::InvalidAmount { .. }
        )
    }
}

pub type PlannerResult<T> = Result<T, PlannerError>;
