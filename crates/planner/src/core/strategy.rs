//! Strategy dispatch and the transition flows shared by every protocol.
//!
//! A planning call reads the current position, sizes the transition with the
//! solvers, quotes the swap once sizes are known, then assembles the plan and
//! its simulation. Protocol families differ in how assets resolve, which
//! preparatory steps they need and how capital is sourced.

use std::collections::BTreeMap;

use alloy::primitives::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::operations::{
    close_steps, collateralized_flashloan_amount, decrease_steps, ensure_swap_covers, increase_steps, quote_swap,
    CapitalSourcing, Venue,
};
use super::solver::{
    collateral_ratio_for_multiple, ensure_above_minimum, intermediate_ratio_decrease, intermediate_ratio_increase,
    size_close, solve_decrease, solve_increase, DecreaseSizing, IncreaseSizing, MarketInputs, RatioInputs,
    SolverConfig,
};
use super::{aave, maker};
use crate::errors::{PlannerError, PlannerResult};
use crate::execution::collaborators::{FlashloanProviders, FlashloanRoute, PositionQuery, PositionReader, SwapQuoter};
use crate::types::swap::fee_paid_in_debt_token;
use crate::types::units::{decimal_to_u256, from_base_decimal, to_base_decimal};
use crate::types::{
    AmountInput, Delta, FeeSplit, Flags, Network, OperationKind, OperationName, PlanStep, Position,
    PositionCategory, PositionTransition, SimulationResult, StepAmount, SwapSpec, TokenAmount, TokenRef,
    TransitionPlan,
};

// ---------------------------------------------------------------------------
// Protocol contexts
// ---------------------------------------------------------------------------

/// One AAVE reserve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AaveReserve {
    pub address: Address,
    /// `None` resolves to [`SolverConfig::default_precision`].
    #[serde(default)]
    pub precision: Option<u32>,
    #[serde(with = "rust_decimal::serde::str")]
    pub max_ltv: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidation_threshold: Decimal,
}

/// AAVE v3 efficiency-mode category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EModeCategory {
    pub id: u8,
    #[serde(with = "rust_decimal::serde::str")]
    pub max_ltv: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidation_threshold: Decimal,
    /// Reserve symbols inside the category.
    pub assets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AaveContext {
    pub pool: Address,
    pub oracle: Address,
    /// Reserves keyed by upper-case symbol.
    pub reserves: BTreeMap<String, AaveReserve>,
    #[serde(default)]
    pub e_mode: Option<EModeCategory>,
}

/// One Maker collateral type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakerIlk {
    /// Ilk name, e.g. "ETH-A".
    pub ilk: String,
    pub token: Address,
    pub join_adapter: Address,
    #[serde(default)]
    pub precision: Option<u32>,
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidation_ratio: Decimal,
    /// Minimum vault debt in DAI.
    #[serde(with = "rust_decimal::serde::str")]
    pub dust: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakerContext {
    pub cdp_manager: Address,
    pub dai: Address,
    pub dai_join: Address,
    /// Ilks keyed by upper-case collateral symbol.
    pub ilks: BTreeMap<String, MakerIlk>,
}

/// Protocol a request targets, with its addresses and market metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolContext {
    AaveV2(AaveContext),
    AaveV3(AaveContext),
    Maker(MakerContext),
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Prices supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceInputs {
    /// Collateral priced in debt token on the market.
    #[serde(with = "rust_decimal::serde::str")]
    pub market_price: Decimal,
    /// Oracle price for positions that are not read from chain (opens).
    /// Falls back to the market price.
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub oracle_price: Option<Decimal>,
    /// Falls back to [`SolverConfig::default_slippage`].
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub slippage: Option<Decimal>,
    /// One debt token in flashloan-token terms, for collateralized flashloans.
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub debt_price_in_flashloan_token: Option<Decimal>,
}

/// How an open sizes its leverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OpenTarget {
    Multiple(#[serde(with = "rust_decimal::serde::str")] Decimal),
    /// Loop a debt-token deposit to a minimum collateral ratio (0.77 = 77%).
    /// AAVE only, for pairs priced 1:1.
    LoopToMinCollateralRatio(#[serde(with = "rust_decimal::serde::str")] Decimal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenArgs {
    pub collateral_deposit: AmountInput,
    pub debt_deposit: AmountInput,
    pub target: OpenTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustArgs {
    #[serde(with = "rust_decimal::serde::str")]
    pub target_multiple: Decimal,
    pub collateral_top_up: AmountInput,
    pub debt_top_up: AmountInput,
    #[serde(default)]
    pub collect_fee_from: Option<FeeSplit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaybackWithdrawArgs {
    pub payback: AmountInput,
    pub withdraw: AmountInput,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseArgs {
    #[serde(default)]
    pub collect_fee_from: Option<FeeSplit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StrategyAction {
    Open(OpenArgs),
    Adjust(AdjustArgs),
    PaybackWithdraw(PaybackWithdrawArgs),
    Close(CloseArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyRequest {
    /// Proxy or account that owns the position.
    pub owner: Address,
    pub collateral_symbol: String,
    pub debt_symbol: String,
    pub prices: PriceInputs,
    pub action: StrategyAction,
}

/// Collaborators and configuration for one planning call.
pub struct StrategyDeps<'a> {
    pub reader: &'a dyn PositionReader,
    pub quoter: &'a dyn SwapQuoter,
    pub flashloans: &'a FlashloanProviders,
    pub network: Network,
    pub config: &'a SolverConfig,
}

/// Plan a transition for `request` on the protocol described by `context`.
pub async fn plan(
    request: &StrategyRequest,
    context: &ProtocolContext,
    deps: &StrategyDeps<'_>,
) -> PlannerResult<PositionTransition> {
    match context {
        ProtocolContext::AaveV2(ctx) => aave::plan(aave::AaveVersion::V2, ctx, request, deps).await,
        ProtocolContext::AaveV3(ctx) => aave::plan(aave::AaveVersion::V3, ctx, request, deps).await,
        ProtocolContext::Maker(ctx) => maker::plan(ctx, request, deps).await,
    }
}

// ---------------------------------------------------------------------------
// Resolved market
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourcingPolicy {
    /// Every swap leg runs inside a flashloan.
    AlwaysFlashloan,
    /// Generate-then-swap when the vault stays safe mid-flow.
    PreferOwnCredit,
}

/// Token parked as temporary collateral when the provider cannot lend the debt token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FlashloanCollateral {
    pub token: TokenRef,
    pub max_ltv: Decimal,
}

/// Everything a protocol family resolves before planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedMarket {
    pub venue: Venue,
    pub category: PositionCategory,
    /// Strict lower bound on target collateralization ratios.
    pub min_collateral_ratio: Decimal,
    pub policy: SourcingPolicy,
    pub flashloan_collateral: Option<FlashloanCollateral>,
}

/// User-facing symbol to catalog key. Native ETH trades as WETH.
pub(crate) fn catalog_symbol(symbol: &str) -> (String, bool) {
    let upper = symbol.trim().to_ascii_uppercase();
    if upper == crate::constants::ETH_SYMBOL {
        ("WETH".to_string(), true)
    } else {
        (upper, false)
    }
}

/// A requested leverage change.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RatioChange {
    pub target_multiple: Decimal,
    /// Base units of collateral.
    pub collateral_top_up: Decimal,
    /// Base units of debt.
    pub debt_top_up: Decimal,
    pub collect_fee_from: Option<FeeSplit>,
}

// ---------------------------------------------------------------------------
// Transition builder
// ---------------------------------------------------------------------------

/// Shared flows, parameterized by a resolved market.
pub(crate) struct TransitionBuilder<'a> {
    pub deps: &'a StrategyDeps<'a>,
    pub market: ResolvedMarket,
    pub prices: PriceInputs,
}

impl<'a> TransitionBuilder<'a> {
    pub fn new(deps: &'a StrategyDeps<'a>, market: ResolvedMarket, prices: PriceInputs) -> Self {
        Self { deps, market, prices }
    }

    fn venue(&self) -> &Venue {
        &self.market.venue
    }

    pub fn base_amount(&self, input: &AmountInput, token: &TokenRef) -> PlannerResult<Decimal> {
        input.to_base(token.precision, self.deps.config.scale_inference_threshold)
    }

    pub fn slippage(&self) -> Decimal {
        self.prices.slippage.unwrap_or(self.deps.config.default_slippage)
    }

    pub fn route(&self) -> PlannerResult<FlashloanRoute> {
        self.deps.flashloans.route(self.deps.network)
    }

    pub async fn read_position(&self, owner: Address) -> PlannerResult<Position> {
        let query = PositionQuery {
            protocol: self.venue().protocol,
            owner,
            collateral: self.venue().collateral.clone(),
            debt: self.venue().debt.clone(),
            category: self.market.category,
        };
        let position = self.deps.reader.current_position(&query).await?;
        if position.collateral.precision != query.collateral.precision
            || position.debt.precision != query.debt.precision
        {
            return Err(PlannerError::invalid_amount(format!(
                "reader returned precisions {}/{}, expected {}/{}",
                position.collateral.precision,
                position.debt.precision,
                query.collateral.precision,
                query.debt.precision
            )));
        }
        Ok(position)
    }

    /// Position before an open: nothing deposited, nothing borrowed.
    pub fn empty_position(&self) -> PlannerResult<Position> {
        let venue = self.venue();
        Position::new(
            TokenAmount::zero(venue.debt.symbol.clone(), venue.debt.precision)?,
            TokenAmount::zero(venue.collateral.symbol.clone(), venue.collateral.precision)?,
            self.prices.oracle_price.unwrap_or(self.prices.market_price),
            self.market.category,
        )
    }

    fn market_inputs(&self, position: &Position) -> MarketInputs {
        MarketInputs {
            oracle_price: position.oracle_price,
            market_price: self.prices.market_price,
            slippage: self.slippage(),
            fee_rate: self.deps.config.fee.fraction_of_gross(),
            flashloan_fee: Decimal::ZERO,
        }
    }

    /// Fee a route charges for the sourcing it would be used for.
    pub(crate) fn route_fee(&self, route: &FlashloanRoute) -> Decimal {
        if route.lends(&self.venue().debt.symbol) {
            route.fee
        } else {
            Decimal::ZERO
        }
    }

    /// Direct when the provider lends the debt token, collateralized otherwise.
    /// `debt_value` is the human-scale debt the loan has to back.
    pub(crate) fn flashloan_sourcing(&self, route: FlashloanRoute, debt_value: Decimal) -> PlannerResult<CapitalSourcing> {
        let debt = &self.venue().debt;
        if route.lends(&debt.symbol) {
            return Ok(CapitalSourcing::FlashloanDirect { route });
        }
        let parked = self
            .market
            .flashloan_collateral
            .as_ref()
            .ok_or_else(|| PlannerError::unsupported_asset(route.provider.to_string(), debt.symbol.clone()))?;
        if !route.fee.is_zero() {
            return Err(PlannerError::Config(format!(
                "collateralized flashloans need a fee-free provider, {} charges {}",
                route.provider, route.fee
            )));
        }
        let price = self.prices.debt_price_in_flashloan_token.ok_or_else(|| {
            PlannerError::invalid_amount(format!(
                "{} price in {} is required to size a collateralized flashloan",
                debt.symbol, parked.token.symbol
            ))
        })?;
        let human = collateralized_flashloan_amount(debt_value, price, parked.max_ltv)?;
        Ok(CapitalSourcing::FlashloanCollateralized {
            route,
            token: parked.token.clone(),
            amount: to_base_decimal(human, parked.token.precision)?,
        })
    }

    pub(crate) fn flashloan_principal(&self, sourcing: &CapitalSourcing, debt_principal: Decimal) -> Decimal {
        match sourcing {
            CapitalSourcing::OwnCredit => Decimal::ZERO,
            CapitalSourcing::FlashloanDirect { .. } => debt_principal.ceil(),
            CapitalSourcing::FlashloanCollateralized { amount, .. } => amount.ceil(),
        }
    }

    /// Pull-ins and top-up deposits that precede any flashloan.
    pub(crate) fn top_up_steps(&self, collateral_top_up: Decimal, debt_top_up: Decimal, repay_with_debt_top_up: bool) -> PlannerResult<Vec<PlanStep>> {
        let venue = self.venue();
        let mut steps = Vec::new();
        if collateral_top_up > Decimal::ZERO {
            let amount = decimal_to_u256(collateral_top_up)?;
            steps.push(venue.pull_in(&venue.collateral, venue.collateral_is_eth, amount));
            steps.extend(venue.deposit_collateral(StepAmount::Exact(amount)));
        }
        if debt_top_up > Decimal::ZERO {
            let amount = decimal_to_u256(debt_top_up)?;
            steps.push(venue.pull_in(&venue.debt, venue.debt_is_eth, amount));
            if repay_with_debt_top_up {
                steps.extend(venue.payback(StepAmount::Exact(amount)));
            }
        }
        Ok(steps)
    }

    pub(crate) fn check_dust(&self, position: &Position) -> PlannerResult<()> {
        let dust = position.category.dust_limit;
        if dust > Decimal::ZERO && !position.debt.is_zero() && position.debt.amount < dust {
            return Err(PlannerError::InfeasibleTarget {
                requested: position.debt.amount,
                minimum: dust,
                reason: "resulting debt is below the dust limit".into(),
            });
        }
        Ok(())
    }

    /// Follows the swap's direction rather than the risk flag: a top-up at the
    /// current multiple still buys collateral.
    fn fee_token(&self, swap: &SwapSpec) -> String {
        let buys_collateral = swap.source.address == self.venue().debt.address;
        if fee_paid_in_debt_token(buys_collateral, swap.collect_fee_from) {
            self.venue().debt.symbol.clone()
        } else {
            self.venue().collateral.symbol.clone()
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn finish(
        &self,
        kind: OperationKind,
        steps: Vec<PlanStep>,
        delta: Delta,
        swap: SwapSpec,
        position: Position,
        is_increasing_risk: bool,
        sourcing: &str,
    ) -> PositionTransition {
        let plan = TransitionPlan {
            operation_name: OperationName {
                protocol: self.venue().protocol,
                kind,
            },
            steps,
        };
        let flags = Flags {
            is_increasing_risk,
            requires_flashloan: plan.requires_flashloan(),
        };
        info!(
            operation = %plan.operation_name,
            is_increasing_risk,
            requires_flashloan = flags.requires_flashloan,
            sourcing,
            steps = plan.flatten().len(),
            debt_delta = %delta.debt,
            collateral_delta = %delta.collateral,
            multiple = %position.risk_ratio().multiple().round_dp(6),
            "transition planned"
        );
        let simulation = SimulationResult {
            delta,
            fee: swap.token_fee,
            fee_token: self.fee_token(&swap),
            swap,
            min_configurable_risk_ratio: position.min_configurable_risk_ratio(),
            position,
            flags,
        };
        PositionTransition { plan, simulation }
    }

    /// Plan an action on an existing position read from chain. Opens are
    /// protocol-specific and handled by the families.
    pub async fn plan_existing(&self, owner: Address, action: &StrategyAction) -> PlannerResult<PositionTransition> {
        let venue = self.venue();
        match action {
            StrategyAction::Adjust(args) => {
                let change = RatioChange {
                    target_multiple: args.target_multiple,
                    collateral_top_up: self.base_amount(&args.collateral_top_up, &venue.collateral)?,
                    debt_top_up: self.base_amount(&args.debt_top_up, &venue.debt)?,
                    collect_fee_from: args.collect_fee_from,
                };
                let position = self.read_position(owner).await?;
                self.ratio_change(&position, change, Vec::new(), false).await
            }
            StrategyAction::PaybackWithdraw(args) => {
                let payback = self.base_amount(&args.payback, &venue.debt)?;
                let withdraw = self.base_amount(&args.withdraw, &venue.collateral)?;
                let position = self.read_position(owner).await?;
                self.payback_withdraw(&position, payback, withdraw)
            }
            StrategyAction::Close(args) => {
                let position = self.read_position(owner).await?;
                self.close(&position, args.collect_fee_from).await
            }
            StrategyAction::Open(_) => Err(PlannerError::invalid_amount(
                "open plans start from an empty position and are not read from chain",
            )),
        }
    }

    // -- Ratio change (open / adjust) ----------------------------------------

    /// Move `position` to a target multiple, optionally with top-ups.
    pub async fn ratio_change(
        &self,
        position: &Position,
        change: RatioChange,
        prelude: Vec<PlanStep>,
        is_open: bool,
    ) -> PlannerResult<PositionTransition> {
        let target_ratio = collateral_ratio_for_multiple(change.target_multiple)?;
        ensure_above_minimum(target_ratio, self.market.min_collateral_ratio)?;

        let current_multiple = position.risk_ratio().multiple();
        let is_increasing_risk = change.target_multiple > current_multiple;

        let venue = self.venue();
        let ratio = RatioInputs {
            collateral: position.collateral.normalized(),
            debt: position.debt.normalized(),
            debt_top_up: from_base_decimal(change.debt_top_up, venue.debt.precision)?,
            collateral_top_up: from_base_decimal(change.collateral_top_up, venue.collateral.precision)?,
            target_collateral_ratio: target_ratio,
        };
        let market = self.market_inputs(position);

        if change.target_multiple >= current_multiple {
            self.increase(position, change, ratio, market, prelude, is_open, is_increasing_risk)
                .await
        } else {
            self.decrease(position, change, ratio, market, prelude, is_open, is_increasing_risk)
                .await
        }
    }

    fn choose_increase(&self, market: &MarketInputs, ratio: &RatioInputs) -> PlannerResult<(CapitalSourcing, IncreaseSizing)> {
        if self.market.policy == SourcingPolicy::PreferOwnCredit {
            let own = solve_increase(market, ratio)?;
            if intermediate_ratio_increase(market.oracle_price, ratio, &own) >= self.market.min_collateral_ratio {
                return Ok((CapitalSourcing::OwnCredit, own));
            }
        }
        let route = self.route()?;
        let sizing = solve_increase(&market.with_flashloan_fee(self.route_fee(&route)), ratio)?;
        let sourcing = self.flashloan_sourcing(route, sizing.debt_to_swap)?;
        Ok((sourcing, sizing))
    }

    fn choose_decrease(&self, market: &MarketInputs, ratio: &RatioInputs) -> PlannerResult<(CapitalSourcing, DecreaseSizing)> {
        if self.market.policy == SourcingPolicy::PreferOwnCredit {
            let own = solve_decrease(market, ratio)?;
            if intermediate_ratio_decrease(market.oracle_price, ratio, &own) >= self.market.min_collateral_ratio {
                return Ok((CapitalSourcing::OwnCredit, own));
            }
        }
        let route = self.route()?;
        let sizing = solve_decrease(&market.with_flashloan_fee(self.route_fee(&route)), ratio)?;
        let sourcing = self.flashloan_sourcing(route, sizing.collateral_to_sell * market.oracle_price)?;
        Ok((sourcing, sizing))
    }

    #[allow(clippy::too_many_arguments)]
    async fn increase(
        &self,
        position: &Position,
        change: RatioChange,
        ratio: RatioInputs,
        market: MarketInputs,
        prelude: Vec<PlanStep>,
        is_open: bool,
        is_increasing_risk: bool,
    ) -> PlannerResult<PositionTransition> {
        let venue = self.venue();
        let (sourcing, sizing) = self.choose_increase(&market, &ratio)?;

        let debt_to_swap = to_base_decimal(sizing.debt_to_swap, venue.debt.precision)?;
        let borrow = (debt_to_swap * (Decimal::ONE + sourcing.flashloan_fee())).ceil();
        let collateral_from_swap = to_base_decimal(sizing.collateral_from_swap, venue.collateral.precision)?;

        let swap = quote_swap(
            self.deps.quoter,
            &venue.debt,
            &venue.collateral,
            debt_to_swap + change.debt_top_up,
            change.collect_fee_from.unwrap_or(FeeSplit::Source),
            self.deps.config.fee,
            self.slippage(),
        )
        .await?;
        // Sizing already discounts slippage.
        let expected = (collateral_from_swap * (Decimal::ONE - self.slippage())).floor();
        ensure_swap_covers(&swap, expected, "the collateral the sizing deposits")?;

        let mut steps = prelude;
        steps.extend(self.top_up_steps(change.collateral_top_up, change.debt_top_up, false)?);
        steps.extend(increase_steps(venue, &sourcing, debt_to_swap, borrow, &swap, self.deps.config.fee)?);

        let simulated = position
            .deposit(change.collateral_top_up)
            .borrow(borrow)
            .deposit(collateral_from_swap);
        self.check_dust(&simulated)?;

        let delta = Delta {
            debt: borrow,
            collateral: change.collateral_top_up + collateral_from_swap,
            flashloan: self.flashloan_principal(&sourcing, debt_to_swap),
        };
        let kind = if is_open {
            OperationKind::Open
        } else {
            OperationKind::IncreaseMultiple
        };
        Ok(self.finish(kind, steps, delta, swap, simulated, is_increasing_risk, sourcing.label()))
    }

    #[allow(clippy::too_many_arguments)]
    async fn decrease(
        &self,
        position: &Position,
        change: RatioChange,
        ratio: RatioInputs,
        market: MarketInputs,
        prelude: Vec<PlanStep>,
        is_open: bool,
        is_increasing_risk: bool,
    ) -> PlannerResult<PositionTransition> {
        let venue = self.venue();
        let (sourcing, sizing) = self.choose_decrease(&market, &ratio)?;

        let collateral_to_sell = to_base_decimal(sizing.collateral_to_sell, venue.collateral.precision)?;
        let debt_repaid = to_base_decimal(sizing.debt_repaid, venue.debt.precision)?;

        let swap = quote_swap(
            self.deps.quoter,
            &venue.collateral,
            &venue.debt,
            collateral_to_sell,
            change.collect_fee_from.unwrap_or(FeeSplit::Target),
            self.deps.config.fee,
            self.slippage(),
        )
        .await?;
        let repayment = (debt_repaid * (Decimal::ONE + sourcing.flashloan_fee())).ceil();
        ensure_swap_covers(&swap, repayment, "the planned repayment")?;
        // A direct flashloan is repaid from the swap, so rounding comes out of the principal.
        let debt_repaid = match &sourcing {
            CapitalSourcing::FlashloanDirect { route } => {
                debt_repaid.min((swap.min_received / (Decimal::ONE + route.fee)).floor())
            }
            _ => debt_repaid,
        };

        let mut steps = prelude;
        steps.extend(self.top_up_steps(change.collateral_top_up, change.debt_top_up, true)?);
        steps.extend(decrease_steps(
            venue,
            &sourcing,
            collateral_to_sell,
            debt_repaid,
            &swap,
            self.deps.config.fee,
        )?);

        let simulated = position
            .deposit(change.collateral_top_up)
            .payback(change.debt_top_up + debt_repaid)
            .withdraw(collateral_to_sell)?;
        self.check_dust(&simulated)?;

        let delta = Delta {
            debt: -(change.debt_top_up + debt_repaid),
            collateral: change.collateral_top_up - collateral_to_sell,
            flashloan: self.flashloan_principal(&sourcing, debt_repaid),
        };
        let kind = if is_open {
            OperationKind::Open
        } else {
            OperationKind::DecreaseMultiple
        };
        Ok(self.finish(kind, steps, delta, swap, simulated, is_increasing_risk, sourcing.label()))
    }

    // -- Payback / withdraw ---------------------------------------------------

    /// Repay debt and/or withdraw collateral without a swap.
    ///
    /// A payback covering the whole debt becomes "payback all" and a withdrawal
    /// covering all collateral becomes "withdraw all".
    pub fn payback_withdraw(
        &self,
        position: &Position,
        payback: Decimal,
        withdraw: Decimal,
    ) -> PlannerResult<PositionTransition> {
        let venue = self.venue();
        if payback.is_zero() && withdraw.is_zero() {
            return Err(PlannerError::invalid_amount("payback and withdraw are both zero"));
        }
        if payback > Decimal::ZERO && position.debt.is_zero() {
            return Err(PlannerError::InsufficientDebt {
                requested: payback,
                available: Decimal::ZERO,
            });
        }
        if withdraw > Decimal::ZERO && position.collateral.is_zero() {
            return Err(PlannerError::InsufficientCollateral {
                requested: withdraw,
                available: Decimal::ZERO,
            });
        }

        let payback_all = payback > Decimal::ZERO && position.is_full_payback(payback);
        let withdraw_all = withdraw > Decimal::ZERO && withdraw >= position.collateral.amount;
        let repaid = payback.min(position.debt.amount);
        let withdrawn = withdraw.min(position.collateral.amount);

        let simulated = position.payback(repaid).withdraw(withdrawn)?;
        if !simulated.debt.is_zero() {
            let ltv = simulated.risk_ratio().loan_to_value();
            if ltv >= self.market.category.max_loan_to_value {
                return Err(PlannerError::InfeasibleTarget {
                    requested: ltv,
                    minimum: self.market.category.max_loan_to_value,
                    reason: "withdrawal leaves the position above its max loan-to-value".into(),
                });
            }
        }
        self.check_dust(&simulated)?;

        let mut steps = Vec::new();
        if payback > Decimal::ZERO {
            let amount = if payback_all {
                warn!(requested = %payback, debt = %position.debt.amount, "payback covers all debt, using payback-all");
                StepAmount::All
            } else {
                StepAmount::Exact(decimal_to_u256(payback)?)
            };
            let pulled = decimal_to_u256(payback)?;
            steps.push(venue.pull_in(&venue.debt, venue.debt_is_eth, pulled));
            steps.extend(venue.payback(amount));
        }
        if withdraw > Decimal::ZERO {
            let amount = if withdraw_all {
                warn!(requested = %withdraw, collateral = %position.collateral.amount, "withdrawal covers all collateral, using withdraw-all");
                StepAmount::All
            } else {
                StepAmount::Exact(decimal_to_u256(withdraw)?)
            };
            steps.push(venue.withdraw_collateral(amount));
            steps.extend(venue.return_funds(&venue.collateral, venue.collateral_is_eth));
        }
        if payback_all {
            steps.extend(venue.return_funds(&venue.debt, venue.debt_is_eth));
        }

        let is_increasing_risk = position.risk_ratio().loan_to_value() < simulated.risk_ratio().loan_to_value();
        let delta = Delta {
            debt: -repaid,
            collateral: -withdrawn,
            flashloan: Decimal::ZERO,
        };
        let swap = SwapSpec::zero(venue.collateral.clone(), venue.debt.clone());
        Ok(self.finish(
            OperationKind::PaybackWithdraw,
            steps,
            delta,
            swap,
            simulated,
            is_increasing_risk,
            "none",
        ))
    }

    // -- Close ------------------------------------------------------------------

    /// Repay everything, sell all collateral into the debt token, return funds.
    pub async fn close(&self, position: &Position, collect_fee_from: Option<FeeSplit>) -> PlannerResult<PositionTransition> {
        let venue = self.venue();
        if position.collateral.is_zero() {
            return Err(PlannerError::InsufficientCollateral {
                requested: Decimal::ZERO,
                available: Decimal::ZERO,
            });
        }

        let buffer = self.deps.config.debt_accrual_buffer;
        let flashloan_amount = (position.debt.amount * (Decimal::ONE + buffer)).ceil();
        let sourcing = if position.debt.is_zero() {
            CapitalSourcing::OwnCredit
        } else {
            let route = self.route()?;
            let market = self.market_inputs(position).with_flashloan_fee(self.route_fee(&route));
            size_close(&market, position.collateral.normalized(), position.debt.normalized(), buffer)?;
            self.flashloan_sourcing(route, position.debt.normalized() * (Decimal::ONE + buffer))?
        };

        let swap = quote_swap(
            self.deps.quoter,
            &venue.collateral,
            &venue.debt,
            position.collateral.amount,
            collect_fee_from.unwrap_or(FeeSplit::Target),
            self.deps.config.fee,
            self.slippage(),
        )
        .await?;
        if sourcing.requires_flashloan() {
            let repayment = (flashloan_amount * (Decimal::ONE + sourcing.flashloan_fee())).ceil();
            ensure_swap_covers(&swap, repayment, "the flashloan repayment")?;
        }

        let steps = close_steps(venue, &sourcing, flashloan_amount, &swap, self.deps.config.fee)?;
        let simulated = position.payback(position.debt.amount).withdraw(position.collateral.amount)?;
        let delta = Delta {
            debt: -position.debt.amount,
            collateral: -position.collateral.amount,
            flashloan: self.flashloan_principal(&sourcing, flashloan_amount),
        };
        Ok(self.finish(OperationKind::Close, steps, delta, swap, simulated, false, sourcing.label()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::constants::{
        AAVE_V3_ORACLE, AAVE_V3_POOL, MAKER_CDP_MANAGER, MAKER_JOIN_ETH_A, TOKEN_DAI, TOKEN_STETH, TOKEN_USDC,
        TOKEN_WETH,
    };
    use crate::execution::collaborators::tests::providers;
    use crate::types::{QuoteRequest, SwapQuote};
    use alloy::primitives::address;
    use anyhow::Result;
    use rust_decimal_macros::dec;

    pub(crate) const OWNER: Address = address!("00000000000000000000000000000000000000aa");
    pub(crate) const DAI_JOIN: Address = address!("9759A6Ac90977b93B58547b4A71c78317f391A28");

    /// Returns a fixed position for every query.
    pub(crate) struct StaticReader {
        pub position: Position,
    }

    #[async_trait::async_trait]
    impl PositionReader for StaticReader {
        async fn current_position(&self, query: &PositionQuery) -> Result<Position> {
            Ok(Position {
                category: query.category,
                ..self.position.clone()
            })
        }
    }

    pub(crate) struct FailingReader;

    #[async_trait::async_trait]
    impl PositionReader for FailingReader {
        async fn current_position(&self, _: &PositionQuery) -> Result<Position> {
            anyhow::bail!("rpc unavailable")
        }
    }

    /// Quotes at a fixed collateral price, honouring token precisions.
    pub(crate) struct PriceQuoter {
        pub collateral_symbol: String,
        pub price: Decimal,
    }

    #[async_trait::async_trait]
    impl SwapQuoter for PriceQuoter {
        async fn quote(&self, request: &QuoteRequest) -> Result<SwapQuote> {
            let rate = if request.from_token.symbol == self.collateral_symbol {
                self.price
            } else {
                Decimal::ONE / self.price
            };
            let from = from_base_decimal(request.amount, request.from_token.precision)?;
            let to = to_base_decimal(from * rate, request.to_token.precision)?;
            Ok(SwapQuote {
                provider: "static".into(),
                from_amount: request.amount,
                to_amount: to,
                calldata: vec![0x01, 0x02],
            })
        }
    }

    pub(crate) fn aave_v3_context() -> AaveContext {
        let mut reserves = BTreeMap::new();
        reserves.insert(
            "WETH".to_string(),
            AaveReserve {
                address: TOKEN_WETH,
                precision: Some(18),
                max_ltv: dec!(0.8),
                liquidation_threshold: dec!(0.825),
            },
        );
        reserves.insert(
            "USDC".to_string(),
            AaveReserve {
                address: TOKEN_USDC,
                precision: Some(6),
                max_ltv: dec!(0.77),
                liquidation_threshold: dec!(0.8),
            },
        );
        reserves.insert(
            "DAI".to_string(),
            AaveReserve {
                address: TOKEN_DAI,
                precision: None,
                max_ltv: dec!(0.75),
                liquidation_threshold: dec!(0.8),
            },
        );
        reserves.insert(
            "STETH".to_string(),
            AaveReserve {
                address: TOKEN_STETH,
                precision: Some(18),
                max_ltv: dec!(0.69),
                liquidation_threshold: dec!(0.795),
            },
        );
        AaveContext {
            pool: AAVE_V3_POOL,
            oracle: AAVE_V3_ORACLE,
            reserves,
            e_mode: Some(EModeCategory {
                id: 1,
                max_ltv: dec!(0.9),
                liquidation_threshold: dec!(0.93),
                assets: vec!["WETH".into(), "STETH".into()],
            }),
        }
    }

    pub(crate) fn maker_context() -> MakerContext {
        let mut ilks = BTreeMap::new();
        ilks.insert(
            "WETH".to_string(),
            MakerIlk {
                ilk: "ETH-A".into(),
                token: TOKEN_WETH,
                join_adapter: MAKER_JOIN_ETH_A,
                precision: Some(18),
                liquidation_ratio: dec!(1.45),
                dust: dec!(5000),
            },
        );
        MakerContext {
            cdp_manager: MAKER_CDP_MANAGER,
            dai: TOKEN_DAI,
            dai_join: DAI_JOIN,
            ilks,
        }
    }

    pub(crate) fn prices(market_price: Decimal) -> PriceInputs {
        PriceInputs {
            market_price,
            oracle_price: None,
            slippage: Some(dec!(0.0001)),
            debt_price_in_flashloan_token: None,
        }
    }

    pub(crate) fn request(collateral: &str, debt: &str, market_price: Decimal, action: StrategyAction) -> StrategyRequest {
        StrategyRequest {
            owner: OWNER,
            collateral_symbol: collateral.into(),
            debt_symbol: debt.into(),
            prices: prices(market_price),
            action,
        }
    }

    /// WETH/DAI position: `collateral` ETH, `debt` DAI, oracle at `price`.
    pub(crate) fn eth_dai_position(collateral: Decimal, debt: Decimal, price: Decimal) -> Position {
        let wad = dec!(1_000_000_000_000_000_000);
        Position::new(
            TokenAmount::new("DAI", 18, debt * wad).unwrap(),
            TokenAmount::new("WETH", 18, collateral * wad).unwrap(),
            price,
            PositionCategory {
                liquidation_threshold: dec!(0.8),
                max_loan_to_value: dec!(0.75),
                dust_limit: Decimal::ZERO,
            },
        )
        .unwrap()
    }

    pub(crate) struct Fixture {
        pub reader: Box<dyn PositionReader>,
        pub quoter: PriceQuoter,
        pub flashloans: FlashloanProviders,
        pub config: SolverConfig,
        pub network: Network,
    }

    impl Fixture {
        pub fn new(position: Position, price: Decimal) -> Self {
            Self {
                reader: Box::new(StaticReader { position }),
                quoter: PriceQuoter {
                    collateral_symbol: "WETH".into(),
                    price,
                },
                flashloans: providers(),
                config: SolverConfig::default(),
                network: Network::Mainnet,
            }
        }

        pub fn deps(&self) -> StrategyDeps<'_> {
            StrategyDeps {
                reader: self.reader.as_ref(),
                quoter: &self.quoter,
                flashloans: &self.flashloans,
                network: self.network,
                config: &self.config,
            }
        }
    }

    #[test]
    fn test_catalog_symbol_maps_eth() {
        assert_eq!(catalog_symbol("eth"), ("WETH".to_string(), true));
        assert_eq!(catalog_symbol("Dai"), ("DAI".to_string(), false));
    }

    #[tokio::test]
    async fn test_reader_error_is_forwarded() {
        let mut fixture = Fixture::new(eth_dai_position(dec!(10), dec!(10000), dec!(2000)), dec!(2000));
        fixture.reader = Box::new(FailingReader);
        let req = request("ETH", "DAI", dec!(2000), StrategyAction::Close(CloseArgs::default()));
        let err = plan(&req, &ProtocolContext::Maker(maker_context()), &fixture.deps())
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::External(_)));
        assert!(err.to_string().contains("rpc unavailable"));
    }

    #[tokio::test]
    async fn test_missing_slippage_uses_configured_default() {
        let mut fixture = Fixture::new(eth_dai_position(dec!(10), dec!(10000), dec!(2000)), dec!(2000));
        fixture.config.default_slippage = dec!(0.01);
        let mut req = request("ETH", "DAI", dec!(2000), StrategyAction::Close(CloseArgs::default()));
        req.prices.slippage = None;
        let transition = plan(&req, &ProtocolContext::Maker(maker_context()), &fixture.deps())
            .await
            .unwrap();
        let swap = &transition.simulation.swap;
        assert_eq!(swap.min_received, (swap.quoted_received * dec!(0.99)).floor());
    }

    #[tokio::test]
    async fn test_unknown_network_fails_when_flashloan_needed() {
        let mut fixture = Fixture::new(eth_dai_position(dec!(10), dec!(10000), dec!(2000)), dec!(2000));
        fixture.network = Network::Arbitrum;
        let req = request("ETH", "DAI", dec!(2000), StrategyAction::Close(CloseArgs::default()));
        let err = plan(&req, &ProtocolContext::Maker(maker_context()), &fixture.deps())
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::UnsupportedNetwork { .. }));
    }

    #[test]
    fn test_request_round_trips_through_json() {
        let req = request(
            "ETH",
            "DAI",
            dec!(2900),
            StrategyAction::Adjust(AdjustArgs {
                target_multiple: dec!(3),
                collateral_top_up: AmountInput::ZERO,
                debt_top_up: AmountInput::human(dec!(100)),
                collect_fee_from: None,
            }),
        );
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"action\":\"adjust\""));
        let back: StrategyRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }
}
