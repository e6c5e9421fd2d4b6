use alloy::primitives::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which side of a swap the protocol fee is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeSplit {
    /// Fee deducted from the input before swapping.
    Source,
    /// Fee deducted from the swap output.
    Target,
}

impl FeeSplit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Target => "target",
        }
    }
}

/// Whether the swap fee ends up denominated in the position's debt token.
///
/// A swap from debt into collateral (the increasing-risk direction) pays a
/// source-side fee in debt. A swap from collateral into debt pays a
/// target-side fee in debt.
pub fn fee_paid_in_debt_token(debt_to_collateral: bool, collect_from: FeeSplit) -> bool {
    debt_to_collateral == (collect_from == FeeSplit::Source)
}

/// A token as the planner and the aggregator see it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenRef {
    pub symbol: String,
    pub address: Address,
    pub precision: u32,
}

/// Request handed to the external quote collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub from_token: TokenRef,
    pub to_token: TokenRef,
    /// Input amount in `from_token` base units, net of any source-side fee.
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub slippage: Decimal,
}

/// Aggregator quote. Only `to_amount` feeds sizing; `calldata` is passed
/// through to the swap step untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapQuote {
    /// Provider name, e.g. "1inch".
    pub provider: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub from_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub to_amount: Decimal,
    /// Raw calldata for the aggregator router.
    #[serde(with = "hex_bytes")]
    pub calldata: Vec<u8>,
}

/// A planned token exchange, amounts in base units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapSpec {
    pub source: TokenRef,
    pub target: TokenRef,
    /// Gross input, including a source-side fee.
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub quoted_received: Decimal,
    /// `floor(quoted_received * (1 - slippage))`.
    #[serde(with = "rust_decimal::serde::str")]
    pub min_received: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub token_fee: Decimal,
    pub collect_fee_from: FeeSplit,
    #[serde(with = "hex_bytes")]
    pub calldata: Vec<u8>,
}

impl SwapSpec {
    /// Placeholder for plans that contain no exchange.
    pub fn zero(source: TokenRef, target: TokenRef) -> Self {
        Self {
            source,
            target,
            amount: Decimal::ZERO,
            quoted_received: Decimal::ZERO,
            min_received: Decimal::ZERO,
            token_fee: Decimal::ZERO,
            collect_fee_from: FeeSplit::Source,
            calldata: Vec::new(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }
}

/// Hex-encode/decode Vec<u8> for JSON serialization.
pub(crate) mod hex_bytes {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
