//! Position-transition planning for leveraged "multiply" positions on AAVE v2,
//! AAVE v3 and Maker CDP.
//!
//! [`core::strategy::plan`] takes a request and a protocol context and returns
//! an ordered action plan plus a simulation of the resulting position. Chain
//! reads and swap quotes come in through the traits in
//! [`execution::collaborators`].

pub mod config;
pub mod constants;
pub mod core;
pub mod errors;
pub mod execution;
pub mod logging;
pub mod types;

pub use crate::core::strategy::{plan, ProtocolContext, StrategyAction, StrategyDeps, StrategyRequest};
pub use crate::errors::{PlannerError, PlannerResult};
