use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::network::FlashloanProvider;
use super::position::{Position, RiskRatio};
use super::swap::{FeeSplit, SwapSpec};
use crate::constants::MAX_UINT;

/// Money market a step targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LendingProtocol {
    AaveV2,
    AaveV3,
    Maker,
}

impl LendingProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AaveV2 => "AaveV2",
            Self::AaveV3 => "AaveV3",
            Self::Maker => "Maker",
        }
    }
}

impl fmt::Display for LendingProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Amount carried by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StepAmount {
    /// Literal base-unit amount.
    Exact(U256),
    /// Everything the protocol holds at execution time (max-uint on chain).
    All,
    /// Whatever the preceding swap produced.
    SwapOutput,
}

impl StepAmount {
    pub fn exact(&self) -> Option<U256> {
        match self {
            Self::Exact(v) => Some(*v),
            _ => None,
        }
    }

    /// Value encoded into calldata. `None` when resolved at execution time.
    pub fn encoded(&self) -> Option<U256> {
        match self {
            Self::Exact(v) => Some(*v),
            Self::All => Some(MAX_UINT),
            Self::SwapOutput => None,
        }
    }
}

/// One abstract step of a transition plan.
///
/// `Flashloan` encloses every step that runs while the loan is outstanding;
/// the loan is repaid when its inner steps finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PlanStep {
    Flashloan {
        provider: FlashloanProvider,
        token: Address,
        amount: U256,
        steps: Vec<PlanStep>,
    },
    PullToken {
        token: Address,
        amount: U256,
    },
    WrapEth {
        amount: U256,
    },
    UnwrapEth {
        amount: StepAmount,
    },
    SetApproval {
        token: Address,
        spender: Address,
        amount: StepAmount,
    },
    Deposit {
        protocol: LendingProtocol,
        asset: Address,
        amount: StepAmount,
    },
    Borrow {
        protocol: LendingProtocol,
        asset: Address,
        amount: U256,
    },
    Payback {
        protocol: LendingProtocol,
        asset: Address,
        amount: StepAmount,
    },
    Withdraw {
        protocol: LendingProtocol,
        asset: Address,
        amount: StepAmount,
    },
    Swap {
        from_token: Address,
        to_token: Address,
        amount: U256,
        min_received: U256,
        fee_bips: u32,
        collect_fee_from: FeeSplit,
        #[serde(with = "super::swap::hex_bytes")]
        calldata: Vec<u8>,
    },
    SetEMode {
        category_id: u8,
    },
    OpenVault {
        join_adapter: Address,
    },
    ReturnFunds {
        token: Address,
    },
}

impl PlanStep {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Flashloan { .. } => "flashloan",
            Self::PullToken { .. } => "pull_token",
            Self::WrapEth { .. } => "wrap_eth",
            Self::UnwrapEth { .. } => "unwrap_eth",
            Self::SetApproval { .. } => "set_approval",
            Self::Deposit { .. } => "deposit",
            Self::Borrow { .. } => "borrow",
            Self::Payback { .. } => "payback",
            Self::Withdraw { .. } => "withdraw",
            Self::Swap { .. } => "swap",
            Self::SetEMode { .. } => "set_e_mode",
            Self::OpenVault { .. } => "open_vault",
            Self::ReturnFunds { .. } => "return_funds",
        }
    }
}

/// Shape of a transition, used to name the operation the executor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Open,
    IncreaseMultiple,
    DecreaseMultiple,
    PaybackWithdraw,
    Close,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::IncreaseMultiple => "IncreaseMultiple",
            Self::DecreaseMultiple => "DecreaseMultiple",
            Self::PaybackWithdraw => "PaybackWithdraw",
            Self::Close => "Close",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationName {
    pub protocol: LendingProtocol,
    pub kind: OperationKind,
}

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.protocol.as_str(), self.kind.as_str())
    }
}

/// Ordered steps for the execution layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionPlan {
    pub operation_name: OperationName,
    pub steps: Vec<PlanStep>,
}

impl TransitionPlan {
    /// Depth-first view of every step, a flashloan before its inner steps.
    pub fn flatten(&self) -> Vec<&PlanStep> {
        fn walk<'a>(steps: &'a [PlanStep], out: &mut Vec<&'a PlanStep>) {
            for step in steps {
                out.push(step);
                if let PlanStep::Flashloan { steps, .. } = step {
                    walk(steps, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.steps, &mut out);
        out
    }

    pub fn flashloan(&self) -> Option<&PlanStep> {
        self.steps.iter().find(|s| matches!(s, PlanStep::Flashloan { .. }))
    }

    pub fn requires_flashloan(&self) -> bool {
        self.flashloan().is_some()
    }
}

/// Signed base-unit changes a plan applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(with = "rust_decimal::serde::str")]
    pub debt: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub collateral: Decimal,
    /// Flashloan principal, in the flashloan token's base units.
    #[serde(with = "rust_decimal::serde::str")]
    pub flashloan: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flags {
    pub is_increasing_risk: bool,
    pub requires_flashloan: bool,
}

/// Predicted outcome of executing a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub delta: Delta,
    pub swap: SwapSpec,
    /// Protocol fee in base units of `fee_token`.
    #[serde(with = "rust_decimal::serde::str")]
    pub fee: Decimal,
    pub fee_token: String,
    pub position: Position,
    pub flags: Flags,
    pub min_configurable_risk_ratio: RiskRatio,
}

/// A plan and its simulation, the result of every strategy call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionTransition {
    pub plan: TransitionPlan,
    pub simulation: SimulationResult,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{AAVE_V3_POOL, TOKEN_DAI, TOKEN_WETH};

    fn sample_plan() -> TransitionPlan {
        TransitionPlan {
            operation_name: OperationName {
                protocol: LendingProtocol::AaveV3,
                kind: OperationKind::IncreaseMultiple,
            },
            steps: vec![
                PlanStep::PullToken {
                    token: TOKEN_DAI,
                    amount: U256::from(10u64),
                },
                PlanStep::Flashloan {
                    provider: FlashloanProvider::Balancer,
                    token: TOKEN_DAI,
                    amount: U256::from(100u64),
                    steps: vec![
                        PlanStep::SetApproval {
                            token: TOKEN_WETH,
                            spender: AAVE_V3_POOL,
                            amount: StepAmount::SwapOutput,
                        },
                        PlanStep::Deposit {
                            protocol: LendingProtocol::AaveV3,
                            asset: TOKEN_WETH,
                            amount: StepAmount::SwapOutput,
                        },
                    ],
                },
            ],
        }
    }

    #[test]
    fn test_operation_name_display() {
        assert_eq!(sample_plan().operation_name.to_string(), "AaveV3IncreaseMultiple");
    }

    #[test]
    fn test_flatten_visits_flashloan_before_inner_steps() {
        let plan = sample_plan();
        let kinds: Vec<_> = plan.flatten().iter().map(|s| s.kind()).collect();
        assert_eq!(kinds, vec!["pull_token", "flashloan", "set_approval", "deposit"]);
        assert!(plan.requires_flashloan());
    }

    #[test]
    fn test_step_serializes_with_tag() {
        let step = PlanStep::Payback {
            protocol: LendingProtocol::Maker,
            asset: TOKEN_DAI,
            amount: StepAmount::All,
        };
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["step"], "payback");
        assert_eq!(value["amount"]["kind"], "all");
    }

    #[test]
    fn test_step_amount_exact() {
        assert_eq!(StepAmount::Exact(U256::from(5u64)).exact(), Some(U256::from(5u64)));
        assert_eq!(StepAmount::All.exact(), None);
    }

    #[test]
    fn test_step_amount_encoding() {
        assert_eq!(StepAmount::All.encoded(), Some(U256::MAX));
        assert_eq!(StepAmount::SwapOutput.encoded(), None);
    }
}
