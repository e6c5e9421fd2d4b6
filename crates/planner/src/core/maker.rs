//! Maker CDP strategy family.
//!
//! Vaults generate DAI against locked collateral, so a transition can often be
//! funded from the vault's own credit. A DAI flashloan is taken only when the
//! vault would dip below its liquidation ratio between steps.

use rust_decimal::Decimal;

use super::operations::Venue;
use super::strategy::{
    catalog_symbol, MakerContext, OpenArgs, OpenTarget, RatioChange, ResolvedMarket, SourcingPolicy, StrategyAction,
    StrategyDeps, StrategyRequest, TransitionBuilder,
};
use crate::constants::DAI_SYMBOL;
use crate::errors::{PlannerError, PlannerResult};
use crate::types::units::to_base_decimal;
use crate::types::{LendingProtocol, PlanStep, PositionCategory, PositionTransition, TokenRef};

const PROTOCOL: LendingProtocol = LendingProtocol::Maker;
const DAI_PRECISION: u32 = 18;

fn resolve(
    ctx: &MakerContext,
    request: &StrategyRequest,
    default_precision: u32,
) -> PlannerResult<(ResolvedMarket, PlanStep)> {
    let (debt_key, _) = catalog_symbol(&request.debt_symbol);
    if debt_key != DAI_SYMBOL {
        return Err(PlannerError::unsupported_asset(PROTOCOL.as_str(), request.debt_symbol.clone()));
    }
    let (collateral_key, collateral_is_eth) = catalog_symbol(&request.collateral_symbol);
    let ilk = ctx
        .ilks
        .get(&collateral_key)
        .ok_or_else(|| PlannerError::unsupported_asset(PROTOCOL.as_str(), request.collateral_symbol.clone()))?;
    if ilk.liquidation_ratio <= Decimal::ONE {
        return Err(PlannerError::Config(format!(
            "ilk {} has liquidation ratio {}, expected above 1",
            ilk.ilk, ilk.liquidation_ratio
        )));
    }

    // Maker has a single threshold: liquidation and max LTV coincide.
    let max_ltv = Decimal::ONE / ilk.liquidation_ratio;
    let venue = Venue {
        protocol: PROTOCOL,
        collateral: TokenRef {
            symbol: collateral_key,
            address: ilk.token,
            precision: ilk.precision.unwrap_or(default_precision),
        },
        debt: TokenRef {
            symbol: debt_key,
            address: ctx.dai,
            precision: DAI_PRECISION,
        },
        collateral_asset: ilk.join_adapter,
        debt_asset: ctx.dai_join,
        spender: None,
        collateral_is_eth,
        debt_is_eth: false,
    };
    let market = ResolvedMarket {
        venue,
        category: PositionCategory {
            liquidation_threshold: max_ltv,
            max_loan_to_value: max_ltv,
            dust_limit: to_base_decimal(ilk.dust, DAI_PRECISION)?,
        },
        min_collateral_ratio: ilk.liquidation_ratio,
        policy: SourcingPolicy::PreferOwnCredit,
        flashloan_collateral: None,
    };
    let open_vault = PlanStep::OpenVault {
        join_adapter: ilk.join_adapter,
    };
    Ok((market, open_vault))
}

pub(crate) async fn plan(
    ctx: &MakerContext,
    request: &StrategyRequest,
    deps: &StrategyDeps<'_>,
) -> PlannerResult<PositionTransition> {
    let (market, open_vault) = resolve(ctx, request, deps.config.default_precision)?;
    let builder = TransitionBuilder::new(deps, market, request.prices);
    match &request.action {
        StrategyAction::Open(args) => open(&builder, args, open_vault).await,
        action => builder.plan_existing(request.owner, action).await,
    }
}

async fn open(builder: &TransitionBuilder<'_>, args: &OpenArgs, open_vault: PlanStep) -> PlannerResult<PositionTransition> {
    let target_multiple = match args.target {
        OpenTarget::Multiple(multiple) => multiple,
        OpenTarget::LoopToMinCollateralRatio(_) => {
            return Err(PlannerError::invalid_amount("Maker vaults cannot be opened by looping"));
        }
    };
    let venue = &builder.market.venue;
    let change = RatioChange {
        target_multiple,
        collateral_top_up: builder.base_amount(&args.collateral_deposit, &venue.collateral)?,
        debt_top_up: builder.base_amount(&args.debt_deposit, &venue.debt)?,
        collect_fee_from: None,
    };
    if change.collateral_top_up.is_zero() && change.debt_top_up.is_zero() {
        return Err(PlannerError::invalid_amount("open requires a collateral or DAI deposit"));
    }
    let position = builder.empty_position()?;
    builder.ratio_change(&position, change, vec![open_vault], true).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::strategy::tests::{eth_dai_position, maker_context, request, Fixture};
    use crate::core::strategy::{plan as dispatch, AdjustArgs, CloseArgs, PaybackWithdrawArgs, ProtocolContext};
    use crate::types::{AmountInput, FlashloanProvider, OperationKind, StepAmount};
    use rust_decimal_macros::dec;

    fn maker() -> ProtocolContext {
        ProtocolContext::Maker(maker_context())
    }

    fn kinds(transition: &PositionTransition) -> Vec<&'static str> {
        transition.plan.flatten().iter().map(|s| s.kind()).collect()
    }

    fn adjust(target_multiple: Decimal, debt_top_up: Decimal) -> StrategyAction {
        StrategyAction::Adjust(AdjustArgs {
            target_multiple,
            collateral_top_up: AmountInput::ZERO,
            debt_top_up: AmountInput::human(debt_top_up),
            collect_fee_from: None,
        })
    }

    #[tokio::test]
    async fn test_dai_top_up_uses_own_credit() {
        // 100 ETH, no debt, 20 000 DAI top-up, target ratio 500%
        let fixture = Fixture::new(eth_dai_position(dec!(100), Decimal::ZERO, dec!(2900)), dec!(2900));
        let req = request("ETH", "DAI", dec!(2900), adjust(dec!(1.25), dec!(20000)));
        let transition = dispatch(&req, &maker(), &fixture.deps()).await.unwrap();

        assert!(!transition.simulation.flags.requires_flashloan);
        assert!(transition.simulation.flags.is_increasing_risk);
        assert_eq!(kinds(&transition), vec!["pull_token", "borrow", "swap", "deposit"]);
        let ratio = transition.simulation.position.risk_ratio().collateralization_ratio();
        assert!((ratio - dec!(5)).abs() < dec!(0.001), "ratio {ratio}");
        assert_eq!(transition.plan.operation_name.to_string(), "MakerIncreaseMultiple");
        // Fee charged on the DAI going into the swap.
        assert_eq!(transition.simulation.fee_token, "DAI");
    }

    #[tokio::test]
    async fn test_deep_increase_falls_back_to_dai_flashloan() {
        // Ratio 290% -> 150% would breach 145% before the swap output lands.
        let fixture = Fixture::new(eth_dai_position(dec!(10), dec!(10000), dec!(2900)), dec!(2900));
        let req = request("ETH", "DAI", dec!(2900), adjust(dec!(3), Decimal::ZERO));
        let transition = dispatch(&req, &maker(), &fixture.deps()).await.unwrap();

        assert!(transition.simulation.flags.requires_flashloan);
        let PlanStep::Flashloan { provider, token, .. } = &transition.plan.steps[0] else {
            panic!("expected a flashloan");
        };
        assert_eq!(*provider, FlashloanProvider::DssFlash);
        assert_eq!(*token, crate::constants::TOKEN_DAI);
        assert_eq!(kinds(&transition), vec!["flashloan", "swap", "deposit", "borrow"]);
        let ratio = transition.simulation.position.risk_ratio().collateralization_ratio();
        assert!((ratio - dec!(1.5)).abs() < dec!(0.001), "ratio {ratio}");
    }

    #[tokio::test]
    async fn test_small_decrease_uses_own_credit() {
        // 200% -> 300%, staying above 145% after the withdrawal
        let fixture = Fixture::new(eth_dai_position(dec!(20), dec!(20000), dec!(2000)), dec!(2000));
        let req = request("ETH", "DAI", dec!(2000), adjust(dec!(1.5), Decimal::ZERO));
        let transition = dispatch(&req, &maker(), &fixture.deps()).await.unwrap();

        assert!(!transition.simulation.flags.requires_flashloan);
        assert!(!transition.simulation.flags.is_increasing_risk);
        assert_eq!(kinds(&transition), vec!["withdraw", "swap", "payback"]);
        assert_eq!(transition.plan.operation_name.kind, OperationKind::DecreaseMultiple);
    }

    #[tokio::test]
    async fn test_open_starts_with_vault() {
        let fixture = Fixture::new(eth_dai_position(Decimal::ZERO, Decimal::ZERO, dec!(2000)), dec!(2000));
        let req = request(
            "ETH",
            "DAI",
            dec!(2000),
            StrategyAction::Open(OpenArgs {
                collateral_deposit: AmountInput::human(dec!(10)),
                debt_deposit: AmountInput::ZERO,
                target: OpenTarget::Multiple(dec!(2)),
            }),
        );
        let transition = dispatch(&req, &maker(), &fixture.deps()).await.unwrap();
        let top: Vec<_> = transition.plan.steps.iter().map(|s| s.kind()).collect();
        // 200% sits too close to 145% for own credit.
        assert_eq!(top, vec!["open_vault", "wrap_eth", "deposit", "flashloan"]);
        assert_eq!(transition.plan.operation_name.to_string(), "MakerOpen");
        assert_eq!(
            transition.plan.steps[0],
            PlanStep::OpenVault {
                join_adapter: crate::constants::MAKER_JOIN_ETH_A
            }
        );
    }

    #[tokio::test]
    async fn test_open_rejects_loop_target() {
        let fixture = Fixture::new(eth_dai_position(Decimal::ZERO, Decimal::ZERO, dec!(2000)), dec!(2000));
        let req = request(
            "ETH",
            "DAI",
            dec!(2000),
            StrategyAction::Open(OpenArgs {
                collateral_deposit: AmountInput::ZERO,
                debt_deposit: AmountInput::human(dec!(1000)),
                target: OpenTarget::LoopToMinCollateralRatio(dec!(0.77)),
            }),
        );
        let err = dispatch(&req, &maker(), &fixture.deps()).await.unwrap_err();
        assert!(matches!(err, PlannerError::InvalidAmount { .. }));
    }

    #[tokio::test]
    async fn test_debt_must_be_dai() {
        let fixture = Fixture::new(eth_dai_position(dec!(10), dec!(10000), dec!(2000)), dec!(2000));
        let req = request("ETH", "USDC", dec!(2000), StrategyAction::Close(CloseArgs::default()));
        let err = dispatch(&req, &maker(), &fixture.deps()).await.unwrap_err();
        assert!(matches!(err, PlannerError::UnsupportedAsset { ref protocol, .. } if protocol == "Maker"));
    }

    #[tokio::test]
    async fn test_payback_below_dust_is_infeasible() {
        let fixture = Fixture::new(eth_dai_position(dec!(10), dec!(6000), dec!(2000)), dec!(2000));
        let req = request(
            "ETH",
            "DAI",
            dec!(2000),
            StrategyAction::PaybackWithdraw(PaybackWithdrawArgs {
                payback: AmountInput::human(dec!(2000)),
                withdraw: AmountInput::ZERO,
            }),
        );
        let err = dispatch(&req, &maker(), &fixture.deps()).await.unwrap_err();
        assert!(matches!(err, PlannerError::InfeasibleTarget { .. }));
    }

    #[tokio::test]
    async fn test_withdraw_all_returns_eth() {
        let fixture = Fixture::new(eth_dai_position(dec!(10), Decimal::ZERO, dec!(2000)), dec!(2000));
        let req = request(
            "ETH",
            "DAI",
            dec!(2000),
            StrategyAction::PaybackWithdraw(PaybackWithdrawArgs {
                payback: AmountInput::ZERO,
                withdraw: AmountInput::human(dec!(10)),
            }),
        );
        let transition = dispatch(&req, &maker(), &fixture.deps()).await.unwrap();
        assert_eq!(kinds(&transition), vec!["withdraw", "unwrap_eth", "return_funds"]);
        let PlanStep::Withdraw { amount, .. } = &transition.plan.steps[0] else {
            panic!("expected withdraw");
        };
        assert_eq!(*amount, StepAmount::All);
        assert_eq!(
            transition.plan.steps[2],
            PlanStep::ReturnFunds {
                token: crate::constants::ETH_PSEUDO_ADDRESS
            }
        );
    }

    #[tokio::test]
    async fn test_close_with_flashloan() {
        let fixture = Fixture::new(eth_dai_position(dec!(10), dec!(10000), dec!(2000)), dec!(2000));
        let req = request("ETH", "DAI", dec!(2000), StrategyAction::Close(CloseArgs::default()));
        let transition = dispatch(&req, &maker(), &fixture.deps()).await.unwrap();
        assert_eq!(
            kinds(&transition),
            vec!["flashloan", "payback", "withdraw", "swap", "return_funds"]
        );
        assert_eq!(transition.simulation.fee_token, "DAI");
        assert!(transition.simulation.position.is_empty());
    }

    #[tokio::test]
    async fn test_close_rejects_quote_below_flashloan() {
        // 10 ETH sold at 900 cannot repay a 10 010 DAI flashloan.
        let mut fixture = Fixture::new(eth_dai_position(dec!(10), dec!(10000), dec!(2000)), dec!(2000));
        fixture.quoter.price = dec!(900);
        let req = request("ETH", "DAI", dec!(2000), StrategyAction::Close(CloseArgs::default()));
        let err = dispatch(&req, &maker(), &fixture.deps()).await.unwrap_err();
        assert!(matches!(err, PlannerError::InfeasibleTarget { .. }), "{err}");
    }
}
