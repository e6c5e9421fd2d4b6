//! AAVE v2 / v3 strategy family.
//!
//! AAVE cannot generate debt before the collateral backing it is deposited, so
//! every swap leg runs inside a flashloan. When the network's provider cannot
//! lend the debt token, its own token is parked as temporary collateral.

use rust_decimal::Decimal;
use tracing::debug;

use super::operations::{ensure_swap_covers, increase_steps, quote_swap, Venue};
use super::solver::{ensure_above_minimum, loop_to_min_collateral_ratio};
use super::strategy::{
    catalog_symbol, AaveContext, FlashloanCollateral, OpenArgs, OpenTarget, RatioChange, ResolvedMarket,
    SourcingPolicy, StrategyAction, StrategyDeps, StrategyRequest, TransitionBuilder,
};
use crate::errors::{PlannerError, PlannerResult};
use crate::execution::collaborators::FlashloanRoute;
use crate::types::units::{from_base_decimal, to_base_decimal, u256_to_decimal};
use crate::types::{
    Delta, FeeSplit, LendingProtocol, OperationKind, PlanStep, Position, PositionCategory, PositionTransition,
    TokenRef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AaveVersion {
    V2,
    V3,
}

impl AaveVersion {
    fn protocol(&self) -> LendingProtocol {
        match self {
            Self::V2 => LendingProtocol::AaveV2,
            Self::V3 => LendingProtocol::AaveV3,
        }
    }
}

/// Resolved AAVE market plus the e-mode category to enter on open, if any.
struct AaveMarket {
    market: ResolvedMarket,
    e_mode: Option<u8>,
}

fn resolve(
    version: AaveVersion,
    ctx: &AaveContext,
    request: &StrategyRequest,
    route: Option<&FlashloanRoute>,
    default_precision: u32,
) -> PlannerResult<AaveMarket> {
    let protocol = version.protocol();
    let (collateral_key, collateral_is_eth) = catalog_symbol(&request.collateral_symbol);
    let (debt_key, debt_is_eth) = catalog_symbol(&request.debt_symbol);
    if collateral_key == debt_key {
        return Err(PlannerError::invalid_amount(format!(
            "collateral and debt are both {collateral_key}"
        )));
    }

    let collateral = ctx
        .reserves
        .get(&collateral_key)
        .ok_or_else(|| PlannerError::unsupported_asset(protocol.as_str(), request.collateral_symbol.clone()))?;
    let debt = ctx
        .reserves
        .get(&debt_key)
        .ok_or_else(|| PlannerError::unsupported_asset(protocol.as_str(), request.debt_symbol.clone()))?;

    let e_mode = match (version, &ctx.e_mode) {
        (AaveVersion::V3, Some(category))
            if category.assets.iter().any(|a| a.eq_ignore_ascii_case(&collateral_key))
                && category.assets.iter().any(|a| a.eq_ignore_ascii_case(&debt_key)) =>
        {
            Some(category)
        }
        _ => None,
    };
    let (max_ltv, liquidation_threshold) = match e_mode {
        Some(category) => (category.max_ltv, category.liquidation_threshold),
        None => (collateral.max_ltv, collateral.liquidation_threshold),
    };
    if max_ltv <= Decimal::ZERO {
        return Err(PlannerError::unsupported_asset(protocol.as_str(), request.collateral_symbol.clone()));
    }

    // Parked flashloan collateral is only needed when the provider cannot lend the debt.
    let flashloan_collateral = route
        .filter(|r| !r.lends(&debt_key))
        .and_then(|r| r.fallback_token())
        .and_then(|symbol| {
            let (key, _) = catalog_symbol(symbol);
            ctx.reserves.get(&key).map(|reserve| FlashloanCollateral {
                token: TokenRef {
                    symbol: key,
                    address: reserve.address,
                    precision: reserve.precision.unwrap_or(default_precision),
                },
                max_ltv: reserve.max_ltv,
            })
        });

    let venue = Venue {
        protocol,
        collateral: TokenRef {
            symbol: collateral_key,
            address: collateral.address,
            precision: collateral.precision.unwrap_or(default_precision),
        },
        debt: TokenRef {
            symbol: debt_key,
            address: debt.address,
            precision: debt.precision.unwrap_or(default_precision),
        },
        collateral_asset: collateral.address,
        debt_asset: debt.address,
        spender: Some(ctx.pool),
        collateral_is_eth,
        debt_is_eth,
    };

    Ok(AaveMarket {
        market: ResolvedMarket {
            venue,
            category: PositionCategory {
                liquidation_threshold,
                max_loan_to_value: max_ltv,
                dust_limit: Decimal::ZERO,
            },
            min_collateral_ratio: Decimal::ONE / max_ltv,
            policy: SourcingPolicy::AlwaysFlashloan,
            flashloan_collateral,
        },
        e_mode: e_mode.map(|c| c.id),
    })
}

pub(crate) async fn plan(
    version: AaveVersion,
    ctx: &AaveContext,
    request: &StrategyRequest,
    deps: &StrategyDeps<'_>,
) -> PlannerResult<PositionTransition> {
    // Resolve the provider up front; every AAVE swap leg depends on it.
    let route = match request.action {
        StrategyAction::PaybackWithdraw(_) => None,
        _ => Some(deps.flashloans.route(deps.network)?),
    };
    let resolved = resolve(version, ctx, request, route.as_ref(), deps.config.default_precision)?;
    let builder = TransitionBuilder::new(deps, resolved.market, request.prices);

    match &request.action {
        StrategyAction::Open(args) => {
            let prelude: Vec<PlanStep> = resolved
                .e_mode
                .map(|category_id| PlanStep::SetEMode { category_id })
                .into_iter()
                .collect();
            open(&builder, args, prelude).await
        }
        action => builder.plan_existing(request.owner, action).await,
    }
}

async fn open(builder: &TransitionBuilder<'_>, args: &OpenArgs, prelude: Vec<PlanStep>) -> PlannerResult<PositionTransition> {
    let venue = &builder.market.venue;
    let collateral_top_up = builder.base_amount(&args.collateral_deposit, &venue.collateral)?;
    let debt_top_up = builder.base_amount(&args.debt_deposit, &venue.debt)?;
    if collateral_top_up.is_zero() && debt_top_up.is_zero() {
        return Err(PlannerError::invalid_amount("open requires a collateral or debt-token deposit"));
    }
    let position = builder.empty_position()?;

    match args.target {
        OpenTarget::Multiple(target_multiple) => {
            let change = RatioChange {
                target_multiple,
                collateral_top_up,
                debt_top_up,
                collect_fee_from: None,
            };
            builder.ratio_change(&position, change, prelude, true).await
        }
        OpenTarget::LoopToMinCollateralRatio(ratio) => {
            if !collateral_top_up.is_zero() {
                return Err(PlannerError::invalid_amount("loop opens take a debt-token deposit only"));
            }
            open_loop(builder, &position, debt_top_up, ratio, prelude).await
        }
    }
}

/// Open by looping a debt-token deposit, for pairs priced 1:1.
async fn open_loop(
    builder: &TransitionBuilder<'_>,
    position: &Position,
    deposit: Decimal,
    min_collateral_ratio: Decimal,
    prelude: Vec<PlanStep>,
) -> PlannerResult<PositionTransition> {
    let venue = &builder.market.venue;
    if min_collateral_ratio > Decimal::ZERO {
        ensure_above_minimum(Decimal::ONE / min_collateral_ratio, builder.market.min_collateral_ratio)?;
    }
    let own_deposit = from_base_decimal(deposit, venue.debt.precision)?;
    let sizing = loop_to_min_collateral_ratio(own_deposit, min_collateral_ratio, venue.debt.precision)?;

    let flashloan = u256_to_decimal(sizing.flashloan_amount)?;
    let lend = u256_to_decimal(sizing.lend_amount)?;
    let route = builder.route()?;
    let borrow = (flashloan * (Decimal::ONE + builder.route_fee(&route))).ceil();
    let sourcing = builder.flashloan_sourcing(route, from_base_decimal(flashloan, venue.debt.precision)?)?;
    debug!(%flashloan, %borrow, %lend, sourcing = sourcing.label(), "loop open sized");

    let swap = quote_swap(
        builder.deps.quoter,
        &venue.debt,
        &venue.collateral,
        lend,
        FeeSplit::Source,
        builder.deps.config.fee,
        builder.slippage(),
    )
    .await?;
    let net_lend = from_base_decimal(lend - builder.deps.config.fee.fee_on(lend), venue.debt.precision)?;
    let expected = to_base_decimal(net_lend, venue.collateral.precision)? * (Decimal::ONE - builder.slippage());
    ensure_swap_covers(&swap, expected.floor(), "the looped deposit")?;

    let mut steps = prelude;
    steps.extend(builder.top_up_steps(Decimal::ZERO, deposit, false)?);
    steps.extend(increase_steps(venue, &sourcing, flashloan, borrow, &swap, builder.deps.config.fee)?);

    // Collateral and debt trade 1:1 in this model.
    let collateral_added = to_base_decimal(from_base_decimal(lend, venue.debt.precision)?, venue.collateral.precision)?;
    let simulated = position.deposit(collateral_added).borrow(borrow);
    let delta = Delta {
        debt: borrow,
        collateral: collateral_added,
        flashloan: builder.flashloan_principal(&sourcing, flashloan),
    };
    Ok(builder.finish(OperationKind::Open, steps, delta, swap, simulated, true, sourcing.label()))
}
