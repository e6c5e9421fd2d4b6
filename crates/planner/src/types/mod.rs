pub mod network;
pub mod plan;
pub mod position;
pub mod swap;
pub mod units;

pub use network::{FlashloanProvider, Network};
pub use plan::{
    Delta, Flags, LendingProtocol, OperationKind, OperationName, PlanStep, PositionTransition,
    SimulationResult, StepAmount, TransitionPlan,
};
pub use position::{Position, PositionCategory, RiskRatio, TokenAmount};
pub use swap::{FeeSplit, QuoteRequest, SwapQuote, SwapSpec, TokenRef};
pub use units::{AmountInput, AmountUnit, FeeTier, Percentage};
