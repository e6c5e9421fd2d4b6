pub mod aave;
pub mod maker;
pub mod operations;
pub mod solver;
pub mod strategy;
