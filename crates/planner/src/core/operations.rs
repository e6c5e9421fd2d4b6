//! Step builders shared by the protocol strategy families.
//!
//! A strategy decides sizes and how capital is sourced; the builders here turn
//! that into ordered steps. Any flashloan encloses every step that depends on
//! the borrowed liquidity.

use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use crate::constants::ETH_PSEUDO_ADDRESS;
use crate::errors::{PlannerError, PlannerResult};
use crate::execution::collaborators::{FlashloanRoute, SwapQuoter};
use crate::types::units::{calculate_fee, decimal_to_u256, FeeTier};
use crate::types::{FeeSplit, LendingProtocol, PlanStep, QuoteRequest, StepAmount, SwapSpec, TokenRef};

// ---------------------------------------------------------------------------
// Venue
// ---------------------------------------------------------------------------

/// A resolved market: the tokens and the identifiers the protocol uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Venue {
    pub protocol: LendingProtocol,
    pub collateral: TokenRef,
    pub debt: TokenRef,
    /// Asset id for collateral steps (AAVE reserve token, Maker join adapter).
    pub collateral_asset: Address,
    /// Asset id for debt steps.
    pub debt_asset: Address,
    /// Contract that pulls tokens on deposit/payback, when approvals are needed.
    pub spender: Option<Address>,
    pub collateral_is_eth: bool,
    pub debt_is_eth: bool,
}

impl Venue {
    fn approval(&self, token: Address, amount: StepAmount) -> Option<PlanStep> {
        self.spender.map(|spender| PlanStep::SetApproval { token, spender, amount })
    }

    pub fn deposit_collateral(&self, amount: StepAmount) -> Vec<PlanStep> {
        self.deposit_asset(self.collateral.address, self.collateral_asset, amount)
    }

    /// Deposit any asset (used for temporary flashloan collateral).
    pub fn deposit_asset(&self, token: Address, asset: Address, amount: StepAmount) -> Vec<PlanStep> {
        let mut steps: Vec<PlanStep> = self.approval(token, amount).into_iter().collect();
        steps.push(PlanStep::Deposit {
            protocol: self.protocol,
            asset,
            amount,
        });
        steps
    }

    pub fn borrow(&self, amount: U256) -> PlanStep {
        PlanStep::Borrow {
            protocol: self.protocol,
            asset: self.debt_asset,
            amount,
        }
    }

    pub fn payback(&self, amount: StepAmount) -> Vec<PlanStep> {
        let mut steps: Vec<PlanStep> = self.approval(self.debt.address, amount).into_iter().collect();
        steps.push(PlanStep::Payback {
            protocol: self.protocol,
            asset: self.debt_asset,
            amount,
        });
        steps
    }

    pub fn withdraw_collateral(&self, amount: StepAmount) -> PlanStep {
        self.withdraw_asset(self.collateral_asset, amount)
    }

    pub fn withdraw_asset(&self, asset: Address, amount: StepAmount) -> PlanStep {
        PlanStep::Withdraw {
            protocol: self.protocol,
            asset,
            amount,
        }
    }

    /// Bring user funds onto the proxy: wrap native ETH, pull anything else.
    pub fn pull_in(&self, token: &TokenRef, is_eth: bool, amount: U256) -> PlanStep {
        if is_eth {
            PlanStep::WrapEth { amount }
        } else {
            PlanStep::PullToken {
                token: token.address,
                amount,
            }
        }
    }

    /// Hand remaining funds back to the user, unwrapping WETH first when the
    /// user deals in native ETH.
    pub fn return_funds(&self, token: &TokenRef, is_eth: bool) -> Vec<PlanStep> {
        if is_eth {
            vec![
                PlanStep::UnwrapEth { amount: StepAmount::All },
                PlanStep::ReturnFunds {
                    token: ETH_PSEUDO_ADDRESS,
                },
            ]
        } else {
            vec![PlanStep::ReturnFunds { token: token.address }]
        }
    }
}

// ---------------------------------------------------------------------------
// Capital sourcing
// ---------------------------------------------------------------------------

/// Where the liquidity for the swap leg comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapitalSourcing {
    /// Generate debt first and swap it; the position itself funds the flow.
    OwnCredit,
    /// Flashloan the debt token.
    FlashloanDirect { route: FlashloanRoute },
    /// Flashloan another token and park it as collateral for the duration.
    FlashloanCollateralized {
        route: FlashloanRoute,
        token: TokenRef,
        /// Principal in `token` base units.
        amount: Decimal,
    },
}

impl CapitalSourcing {
    pub fn requires_flashloan(&self) -> bool {
        !matches!(self, Self::OwnCredit)
    }

    /// Fee charged on the flashloan principal, as a fraction.
    pub fn flashloan_fee(&self) -> Decimal {
        match self {
            Self::FlashloanDirect { route } => route.fee,
            _ => Decimal::ZERO,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::OwnCredit => "own_credit",
            Self::FlashloanDirect { .. } => "flashloan_direct",
            Self::FlashloanCollateralized { .. } => "flashloan_collateralized",
        }
    }
}

/// Collateralized principal: debt value in flashloan-token terms, scaled up so
/// the deposit alone backs it at the token's max LTV.
pub fn collateralized_flashloan_amount(
    debt_value: Decimal,
    debt_price_in_flashloan_token: Decimal,
    flashloan_token_max_ltv: Decimal,
) -> PlannerResult<Decimal> {
    if flashloan_token_max_ltv <= Decimal::ZERO {
        return Err(PlannerError::InfeasibleTarget {
            requested: flashloan_token_max_ltv,
            minimum: Decimal::ZERO,
            reason: "flashloan token cannot be used as collateral".into(),
        });
    }
    Ok(debt_value * debt_price_in_flashloan_token / flashloan_token_max_ltv)
}

fn flashloan_step(route: &FlashloanRoute, token: Address, amount: Decimal, steps: Vec<PlanStep>) -> PlannerResult<PlanStep> {
    Ok(PlanStep::Flashloan {
        provider: route.provider,
        token,
        amount: decimal_to_u256(amount.ceil())?,
        steps,
    })
}

// ---------------------------------------------------------------------------
// Swaps
// ---------------------------------------------------------------------------

/// Quote `gross` base units of `source` into `target` and derive the fee and
/// minimum received.
///
/// A source-side fee is taken before quoting. A target-side fee comes out of
/// the quoted output.
pub async fn quote_swap(
    quoter: &dyn SwapQuoter,
    source: &TokenRef,
    target: &TokenRef,
    gross: Decimal,
    collect_fee_from: FeeSplit,
    fee: FeeTier,
    slippage: Decimal,
) -> PlannerResult<SwapSpec> {
    if gross <= Decimal::ZERO {
        return Ok(SwapSpec::zero(source.clone(), target.clone()));
    }
    let source_fee = match collect_fee_from {
        FeeSplit::Source => fee.fee_on(gross),
        FeeSplit::Target => Decimal::ZERO,
    };
    let request = QuoteRequest {
        from_token: source.clone(),
        to_token: target.clone(),
        amount: gross - source_fee,
        slippage,
    };
    let quote = quoter.quote(&request).await?;

    let (token_fee, received) = match collect_fee_from {
        FeeSplit::Source => (source_fee, quote.to_amount),
        FeeSplit::Target => {
            let target_fee = calculate_fee(quote.to_amount, fee.bips, fee.base);
            (target_fee, quote.to_amount - target_fee)
        }
    };
    let min_received = (received * (Decimal::ONE - slippage)).floor();

    debug!(
        provider = %quote.provider,
        from = %source.symbol,
        to = %target.symbol,
        %gross,
        %received,
        %min_received,
        fee = %token_fee,
        fee_side = collect_fee_from.as_str(),
        "swap quoted"
    );

    Ok(SwapSpec {
        source: source.clone(),
        target: target.clone(),
        amount: gross,
        quoted_received: received,
        min_received,
        token_fee,
        collect_fee_from,
        calldata: quote.calldata,
    })
}

/// Relative shortfall a quote may show against sizing through base-unit
/// rounding alone.
const QUOTE_ROUNDING_TOLERANCE: Decimal = dec!(0.000001);

/// Fail when the swap's worst-case output falls short of `required`, the
/// amount the sizing relies on it producing.
///
/// Shortfalls within base-unit rounding pass; callers clamp any amount that
/// must not exceed the output.
pub fn ensure_swap_covers(swap: &SwapSpec, required: Decimal, what: &str) -> PlannerResult<()> {
    let slack = (required * QUOTE_ROUNDING_TOLERANCE).max(Decimal::TWO);
    if swap.min_received + slack < required {
        warn!(
            from = %swap.source.symbol,
            to = %swap.target.symbol,
            min_received = %swap.min_received,
            %required,
            "quote falls short of the sizing"
        );
        return Err(PlannerError::InfeasibleTarget {
            requested: swap.min_received,
            minimum: required,
            reason: format!("worst-case swap output does not cover {what}"),
        });
    }
    Ok(())
}

pub fn swap_step(swap: &SwapSpec, fee: FeeTier) -> PlannerResult<PlanStep> {
    Ok(PlanStep::Swap {
        from_token: swap.source.address,
        to_token: swap.target.address,
        amount: decimal_to_u256(swap.amount)?,
        min_received: decimal_to_u256(swap.min_received)?,
        fee_bips: fee.bips,
        collect_fee_from: swap.collect_fee_from,
        calldata: swap.calldata.clone(),
    })
}

// ---------------------------------------------------------------------------
// Core step sequences
// ---------------------------------------------------------------------------

/// Draw debt, swap it (with any debt top-up) into collateral and deposit.
///
/// `debt_to_swap` is the sourced principal and `borrow` the debt drawn, both
/// in debt base units.
pub fn increase_steps(
    venue: &Venue,
    sourcing: &CapitalSourcing,
    debt_to_swap: Decimal,
    borrow: Decimal,
    swap: &SwapSpec,
    fee: FeeTier,
) -> PlannerResult<Vec<PlanStep>> {
    let swap = swap_step(swap, fee)?;
    let borrow = venue.borrow(decimal_to_u256(borrow)?);
    let deposit = venue.deposit_collateral(StepAmount::SwapOutput);

    let steps = match sourcing {
        CapitalSourcing::OwnCredit => {
            let mut steps = vec![borrow, swap];
            steps.extend(deposit);
            steps
        }
        CapitalSourcing::FlashloanDirect { route } => {
            let mut inner = vec![swap];
            inner.extend(deposit);
            inner.push(borrow);
            vec![flashloan_step(route, venue.debt.address, debt_to_swap, inner)?]
        }
        CapitalSourcing::FlashloanCollateralized { route, token, amount } => {
            let parked = StepAmount::Exact(decimal_to_u256(amount.ceil())?);
            let mut inner = venue.deposit_asset(token.address, token.address, parked);
            inner.push(borrow);
            inner.push(swap);
            inner.extend(deposit);
            inner.push(venue.withdraw_asset(token.address, parked));
            vec![flashloan_step(route, token.address, *amount, inner)?]
        }
    };
    Ok(steps)
}

/// Sell collateral and repay debt with the proceeds.
///
/// `debt_repaid` is the planned repayment in debt base units; with a direct
/// flashloan it is also the principal.
pub fn decrease_steps(
    venue: &Venue,
    sourcing: &CapitalSourcing,
    collateral_to_sell: Decimal,
    debt_repaid: Decimal,
    swap: &SwapSpec,
    fee: FeeTier,
) -> PlannerResult<Vec<PlanStep>> {
    let withdraw = venue.withdraw_collateral(StepAmount::Exact(decimal_to_u256(collateral_to_sell)?));
    let swap_step = swap_step(swap, fee)?;

    let steps = match sourcing {
        CapitalSourcing::OwnCredit => {
            let mut steps = vec![withdraw, swap_step];
            steps.extend(venue.payback(StepAmount::SwapOutput));
            steps
        }
        CapitalSourcing::FlashloanDirect { route } => {
            let mut inner = venue.payback(StepAmount::Exact(decimal_to_u256(debt_repaid)?));
            inner.push(withdraw);
            inner.push(swap_step);
            vec![flashloan_step(route, venue.debt.address, debt_repaid, inner)?]
        }
        CapitalSourcing::FlashloanCollateralized { route, token, amount } => {
            let parked = StepAmount::Exact(decimal_to_u256(amount.ceil())?);
            let mut inner = venue.deposit_asset(token.address, token.address, parked);
            inner.push(withdraw);
            inner.push(swap_step);
            inner.extend(venue.payback(StepAmount::SwapOutput));
            inner.push(venue.withdraw_asset(token.address, parked));
            vec![flashloan_step(route, token.address, *amount, inner)?]
        }
    };
    Ok(steps)
}

/// Repay all debt, withdraw all collateral, sell it and return the rest.
///
/// Own-credit sourcing only applies to debt-free positions.
pub fn close_steps(
    venue: &Venue,
    sourcing: &CapitalSourcing,
    flashloan_amount: Decimal,
    swap: &SwapSpec,
    fee: FeeTier,
) -> PlannerResult<Vec<PlanStep>> {
    let swap_step = swap_step(swap, fee)?;
    let mut steps = match sourcing {
        CapitalSourcing::FlashloanDirect { route } => {
            let mut inner = venue.payback(StepAmount::All);
            inner.push(venue.withdraw_collateral(StepAmount::All));
            inner.push(swap_step);
            vec![flashloan_step(route, venue.debt.address, flashloan_amount, inner)?]
        }
        CapitalSourcing::FlashloanCollateralized { route, token, amount } => {
            let parked = StepAmount::Exact(decimal_to_u256(amount.ceil())?);
            let mut inner = venue.deposit_asset(token.address, token.address, parked);
            inner.push(venue.withdraw_collateral(StepAmount::All));
            inner.push(swap_step);
            inner.extend(venue.payback(StepAmount::All));
            inner.push(venue.withdraw_asset(token.address, parked));
            vec![flashloan_step(route, token.address, *amount, inner)?]
        }
        CapitalSourcing::OwnCredit => {
            if flashloan_amount > Decimal::ZERO {
                return Err(PlannerError::InfeasibleTarget {
                    requested: flashloan_amount,
                    minimum: Decimal::ZERO,
                    reason: "closing a position with debt requires flashloan liquidity".into(),
                });
            }
            vec![venue.withdraw_collateral(StepAmount::All), swap_step]
        }
    };
    steps.extend(venue.return_funds(&venue.debt, venue.debt_is_eth));
    Ok(steps)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::constants::{AAVE_V3_POOL, DSS_FLASH, TOKEN_DAI, TOKEN_USDC, TOKEN_WETH};
    use crate::types::{FlashloanProvider, SwapQuote};
    use anyhow::Result;
    use rust_decimal_macros::dec;

    /// Quotes at a fixed rate of target base units per source base unit.
    pub(crate) struct FixedRateQuoter {
        pub rate: Decimal,
    }

    #[async_trait::async_trait]
    impl SwapQuoter for FixedRateQuoter {
        async fn quote(&self, request: &QuoteRequest) -> Result<SwapQuote> {
            Ok(SwapQuote {
                provider: "fixed".into(),
                from_amount: request.amount,
                to_amount: (request.amount * self.rate).floor(),
                calldata: vec![0xab],
            })
        }
    }

    fn token(symbol: &str, address: Address, precision: u32) -> TokenRef {
        TokenRef {
            symbol: symbol.into(),
            address,
            precision,
        }
    }

    pub(crate) fn aave_venue() -> Venue {
        Venue {
            protocol: LendingProtocol::AaveV3,
            collateral: token("WETH", TOKEN_WETH, 18),
            debt: token("USDC", TOKEN_USDC, 6),
            collateral_asset: TOKEN_WETH,
            debt_asset: TOKEN_USDC,
            spender: Some(AAVE_V3_POOL),
            collateral_is_eth: false,
            debt_is_eth: false,
        }
    }

    fn dss_route() -> FlashloanRoute {
        FlashloanRoute {
            provider: FlashloanProvider::DssFlash,
            address: DSS_FLASH,
            fee: Decimal::ZERO,
            lends: vec!["DAI".into()],
        }
    }

    fn kinds(steps: &[PlanStep]) -> Vec<&'static str> {
        steps.iter().map(|s| s.kind()).collect()
    }

    fn inner(step: &PlanStep) -> Vec<&'static str> {
        match step {
            PlanStep::Flashloan { steps, .. } => kinds(steps),
            other => panic!("expected flashloan, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_quote_swap_source_fee() {
        let quoter = FixedRateQuoter { rate: dec!(2) };
        let venue = aave_venue();
        let swap = quote_swap(
            &quoter,
            &venue.debt,
            &venue.collateral,
            dec!(10020),
            FeeSplit::Source,
            FeeTier::default(),
            dec!(0.01),
        )
        .await
        .unwrap();
        assert_eq!(swap.token_fee, dec!(20));
        assert_eq!(swap.quoted_received, dec!(20000));
        assert_eq!(swap.min_received, dec!(19800));
        assert_eq!(swap.calldata, vec![0xab]);
    }

    #[tokio::test]
    async fn test_quote_swap_target_fee() {
        let quoter = FixedRateQuoter { rate: dec!(1) };
        let venue = aave_venue();
        let swap = quote_swap(
            &quoter,
            &venue.collateral,
            &venue.debt,
            dec!(10020),
            FeeSplit::Target,
            FeeTier::default(),
            Decimal::ZERO,
        )
        .await
        .unwrap();
        assert_eq!(swap.token_fee, dec!(20));
        assert_eq!(swap.quoted_received, dec!(10000));
        assert_eq!(swap.min_received, dec!(10000));
    }

    #[tokio::test]
    async fn test_quote_swap_zero_amount_skips_quoter() {
        struct FailingQuoter;
        #[async_trait::async_trait]
        impl SwapQuoter for FailingQuoter {
            async fn quote(&self, _: &QuoteRequest) -> Result<SwapQuote> {
                anyhow::bail!("should not be called")
            }
        }
        let venue = aave_venue();
        let swap = quote_swap(
            &FailingQuoter,
            &venue.debt,
            &venue.collateral,
            Decimal::ZERO,
            FeeSplit::Source,
            FeeTier::default(),
            Decimal::ZERO,
        )
        .await
        .unwrap();
        assert!(swap.is_zero());
    }

    #[test]
    fn test_increase_own_credit_order() {
        let venue = Venue {
            spender: None,
            ..aave_venue()
        };
        let swap = SwapSpec::zero(venue.debt.clone(), venue.collateral.clone());
        let steps =
            increase_steps(&venue, &CapitalSourcing::OwnCredit, dec!(100), dec!(100), &swap, FeeTier::default())
                .unwrap();
        assert_eq!(kinds(&steps), vec!["borrow", "swap", "deposit"]);
    }

    #[test]
    fn test_increase_direct_flashloan_wraps_everything() {
        let venue = aave_venue();
        let swap = SwapSpec::zero(venue.debt.clone(), venue.collateral.clone());
        let sourcing = CapitalSourcing::FlashloanDirect { route: dss_route() };
        let steps = increase_steps(&venue, &sourcing, dec!(100), dec!(101), &swap, FeeTier::default()).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(inner(&steps[0]), vec!["swap", "set_approval", "deposit", "borrow"]);
        let PlanStep::Flashloan { amount, token, .. } = &steps[0] else {
            panic!("expected flashloan");
        };
        assert_eq!(*amount, U256::from(100u64));
        assert_eq!(*token, TOKEN_USDC);
    }

    #[test]
    fn test_increase_collateralized_parks_and_releases_token() {
        let venue = aave_venue();
        let swap = SwapSpec::zero(venue.debt.clone(), venue.collateral.clone());
        let sourcing = CapitalSourcing::FlashloanCollateralized {
            route: dss_route(),
            token: token("DAI", TOKEN_DAI, 18),
            amount: dec!(1250),
        };
        let steps = increase_steps(&venue, &sourcing, dec!(100), dec!(100), &swap, FeeTier::default()).unwrap();
        assert_eq!(
            inner(&steps[0]),
            vec!["set_approval", "deposit", "borrow", "swap", "set_approval", "deposit", "withdraw"]
        );
    }

    #[test]
    fn test_decrease_direct_flashloan_pays_back_first() {
        let venue = aave_venue();
        let swap = SwapSpec::zero(venue.collateral.clone(), venue.debt.clone());
        let sourcing = CapitalSourcing::FlashloanDirect { route: dss_route() };
        let steps = decrease_steps(&venue, &sourcing, dec!(5), dec!(100), &swap, FeeTier::default()).unwrap();
        assert_eq!(inner(&steps[0]), vec!["set_approval", "payback", "withdraw", "swap"]);
    }

    #[test]
    fn test_close_returns_funds_after_flashloan() {
        let venue = aave_venue();
        let swap = SwapSpec::zero(venue.collateral.clone(), venue.debt.clone());
        let sourcing = CapitalSourcing::FlashloanDirect { route: dss_route() };
        let steps = close_steps(&venue, &sourcing, dec!(1001), &swap, FeeTier::default()).unwrap();
        assert_eq!(kinds(&steps), vec!["flashloan", "return_funds"]);
        assert_eq!(inner(&steps[0]), vec!["set_approval", "payback", "withdraw", "swap"]);
    }

    #[test]
    fn test_close_unwraps_eth_debt() {
        let venue = Venue {
            debt_is_eth: true,
            ..aave_venue()
        };
        let steps = venue.return_funds(&venue.debt, true);
        assert_eq!(kinds(&steps), vec!["unwrap_eth", "return_funds"]);
    }

    #[test]
    fn test_collateralized_amount() {
        // 1000 USDC of debt, 1 DAI per USDC, DAI max LTV 0.8
        assert_eq!(
            collateralized_flashloan_amount(dec!(1000), dec!(1), dec!(0.8)).unwrap(),
            dec!(1250)
        );
        assert!(collateralized_flashloan_amount(dec!(1000), dec!(1), Decimal::ZERO).is_err());
    }
}
