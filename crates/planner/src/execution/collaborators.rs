//! Narrow interfaces to the outside world.
//!
//! Chain reads and aggregator quotes live behind async traits so strategy
//! functions stay pure computations around two awaited calls. Their errors are
//! forwarded as `PlannerError::External` without reinterpretation.

use std::collections::HashMap;

use alloy::primitives::Address;
use anyhow::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::{PlannerError, PlannerResult};
use crate::types::{
    FlashloanProvider, LendingProtocol, Network, Position, PositionCategory, QuoteRequest, SwapQuote, TokenRef,
};

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// What a reader needs to locate one position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionQuery {
    pub protocol: LendingProtocol,
    /// Proxy or account that owns the position.
    pub owner: Address,
    pub collateral: TokenRef,
    pub debt: TokenRef,
    /// Risk bucket resolved from the protocol context.
    pub category: PositionCategory,
}

/// Reads live reserve balances and the oracle price for a position.
#[async_trait::async_trait]
pub trait PositionReader: Send + Sync {
    async fn current_position(&self, query: &PositionQuery) -> Result<Position>;
}

/// Fetches an aggregator quote for a swap.
#[async_trait::async_trait]
pub trait SwapQuoter: Send + Sync {
    async fn quote(&self, request: &QuoteRequest) -> Result<SwapQuote>;
}

// ---------------------------------------------------------------------------
// Flashloan providers
// ---------------------------------------------------------------------------

/// Static per-network provider lookup.
pub fn resolve_flashloan_provider(network: Network) -> PlannerResult<FlashloanProvider> {
    match network {
        Network::Mainnet | Network::Goerli => Ok(FlashloanProvider::DssFlash),
        Network::Optimism => Ok(FlashloanProvider::Balancer),
        other => Err(PlannerError::UnsupportedNetwork {
            network: other.to_string(),
        }),
    }
}

/// Deployment parameters of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub address: Address,
    /// Fee as a fraction of principal.
    #[serde(with = "rust_decimal::serde::str")]
    pub fee: Decimal,
    /// Symbols the provider lends; `"*"` means any.
    pub lends: Vec<String>,
}

/// A provider resolved for one planning call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashloanRoute {
    pub provider: FlashloanProvider,
    pub address: Address,
    pub fee: Decimal,
    pub lends: Vec<String>,
}

impl FlashloanRoute {
    pub fn lends(&self, symbol: &str) -> bool {
        self.lends.iter().any(|s| s == "*" || s.eq_ignore_ascii_case(symbol))
    }

    /// Token borrowed when the debt token itself is not lendable.
    pub fn fallback_token(&self) -> Option<&str> {
        self.lends.iter().find(|s| s.as_str() != "*").map(String::as_str)
    }
}

/// Configured providers, keyed by provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlashloanProviders {
    providers: HashMap<FlashloanProvider, ProviderSettings>,
}

impl FlashloanProviders {
    pub fn new(providers: HashMap<FlashloanProvider, ProviderSettings>) -> Self {
        Self { providers }
    }

    pub fn get(&self, provider: FlashloanProvider) -> Option<&ProviderSettings> {
        self.providers.get(&provider)
    }

    /// Provider for `network` with its configured address, fee and token list.
    pub fn route(&self, network: Network) -> PlannerResult<FlashloanRoute> {
        let provider = resolve_flashloan_provider(network)?;
        let settings = self
            .providers
            .get(&provider)
            .ok_or_else(|| PlannerError::Config(format!("flashloan provider {provider} is not configured")))?;
        Ok(FlashloanRoute {
            provider,
            address: settings.address,
            fee: settings.fee,
            lends: settings.lends.clone(),
        })
    }
}
