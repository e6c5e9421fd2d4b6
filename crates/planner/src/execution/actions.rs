//! Plan steps as versioned action descriptors.
//!
//! The execution layer looks actions up by the keccak256 hash of their label.
//! Redeployed actions get a `_n` suffix so old and new versions coexist.

use std::collections::BTreeMap;

use alloy::primitives::{keccak256, B256};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{PlannerError, PlannerResult};
use crate::types::{LendingProtocol, PlanStep, TransitionPlan};

/// Deployed version per action name. Unlisted actions are at version 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionVersions(BTreeMap<String, u32>);

impl ActionVersions {
    pub fn new(versions: BTreeMap<String, u32>) -> Self {
        Self(versions)
    }

    pub fn version(&self, name: &str) -> u32 {
        self.0.get(name).copied().unwrap_or(1)
    }

    /// Label for `name` at its configured version.
    pub fn label(&self, name: &str) -> PlannerResult<String> {
        match self.version(name) {
            0 => Err(PlannerError::Config(format!("action {name} has version 0"))),
            1 => Ok(name.to_string()),
            n => Ok(format!("{name}_{n}")),
        }
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&String, &u32)> {
        self.0.iter()
    }
}

/// One resolved action call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub label: String,
    pub target_hash: B256,
    /// Whether the call runs inside a flashloan callback.
    pub in_flashloan: bool,
}

/// Unversioned action name for a step.
pub fn action_name(step: &PlanStep) -> &'static str {
    match step {
        PlanStep::Flashloan { .. } => "TakeFlashloan",
        PlanStep::PullToken { .. } => "PullToken",
        PlanStep::WrapEth { .. } => "WrapEth",
        PlanStep::UnwrapEth { .. } => "UnwrapEth",
        PlanStep::SetApproval { .. } => "SetApproval",
        PlanStep::Swap { .. } => "SwapAction",
        PlanStep::ReturnFunds { .. } => "ReturnFunds",
        PlanStep::SetEMode { .. } => "AaveV3SetEMode",
        PlanStep::OpenVault { .. } => "MakerOpenVault",
        PlanStep::Deposit { protocol, .. } => match protocol {
            LendingProtocol::AaveV2 => "AaveDeposit",
            LendingProtocol::AaveV3 => "AaveV3Deposit",
            LendingProtocol::Maker => "MakerDeposit",
        },
        PlanStep::Borrow { protocol, .. } => match protocol {
            LendingProtocol::AaveV2 => "AaveBorrow",
            LendingProtocol::AaveV3 => "AaveV3Borrow",
            LendingProtocol::Maker => "MakerGenerate",
        },
        PlanStep::Payback { protocol, .. } => match protocol {
            LendingProtocol::AaveV2 => "AavePayback",
            LendingProtocol::AaveV3 => "AaveV3Payback",
            LendingProtocol::Maker => "MakerPayback",
        },
        PlanStep::Withdraw { protocol, .. } => match protocol {
            LendingProtocol::AaveV2 => "AaveWithdraw",
            LendingProtocol::AaveV3 => "AaveV3Withdraw",
            LendingProtocol::Maker => "MakerWithdraw",
        },
    }
}

pub fn describe_step(step: &PlanStep, versions: &ActionVersions, in_flashloan: bool) -> PlannerResult<ActionDescriptor> {
    let label = versions.label(action_name(step))?;
    Ok(ActionDescriptor {
        target_hash: keccak256(label.as_bytes()),
        label,
        in_flashloan,
    })
}

/// Descriptors for every step of `plan`, flashloans before their inner calls.
pub fn describe_plan(plan: &TransitionPlan, versions: &ActionVersions) -> PlannerResult<Vec<ActionDescriptor>> {
    fn walk(
        steps: &[PlanStep],
        versions: &ActionVersions,
        in_flashloan: bool,
        out: &mut Vec<ActionDescriptor>,
    ) -> PlannerResult<()> {
        for step in steps {
            out.push(describe_step(step, versions, in_flashloan)?);
            if let PlanStep::Flashloan { steps, .. } = step {
                walk(steps, versions, true, out)?;
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    walk(&plan.steps, versions, false, &mut out)?;
    debug!(operation = %plan.operation_name, calls = out.len(), "plan described");
    Ok(out)
}
