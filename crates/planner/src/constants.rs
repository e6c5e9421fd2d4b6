use alloy::primitives::{address, Address, U256};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// ---------------------------------------------------------------------------
// Numeric Constants
// ---------------------------------------------------------------------------

/// Decimal places of WAD-scaled ERC-20 tokens (ETH, DAI, stETH).
pub const TYPICAL_PRECISION: u32 = 18;

/// Largest scale a `Decimal` can carry; token precisions above it are rejected.
pub const MAX_DECIMAL_PRECISION: u32 = 28;

/// On-chain "everything" sentinel used for payback-all / withdraw-all.
pub const MAX_UINT: U256 = U256::MAX;

/// Swap fee tier applied when configuration does not override it (0.2%).
pub const DEFAULT_FEE_BIPS: u32 = 20;

/// Denominator for fee tiers expressed in bips.
pub const FEE_BASE: u32 = 10_000;

/// Swap slippage applied when a request does not carry its own (0.1%).
pub const DEFAULT_SLIPPAGE: Decimal = dec!(0.001);

/// Headroom added to a flashloan that repays all debt, covering interest
/// accrued between planning and execution.
pub const DEFAULT_DEBT_ACCRUAL_BUFFER: Decimal = dec!(0.001);

// ---------------------------------------------------------------------------
// Pseudo Addresses
// ---------------------------------------------------------------------------

/// Placeholder address aggregators use for the native asset.
pub const ETH_PSEUDO_ADDRESS: Address = address!("EeeeeEeeeEeEeeEeEeEeeEEEeeeeEeeeeeeeEEeE");

pub const ETH_SYMBOL: &str = "ETH";
pub const DAI_SYMBOL: &str = "DAI";

// ---------------------------------------------------------------------------
// Mainnet Token Addresses
// ---------------------------------------------------------------------------

pub const TOKEN_DAI: Address = address!("6B175474E89094C44Da98b954EedeAC495271d0F");
pub const TOKEN_WETH: Address = address!("C02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2");
pub const TOKEN_STETH: Address = address!("ae7ab96520DE3A18E5e111B5EaAb095312D7fE84");
pub const TOKEN_USDC: Address = address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48");

// ---------------------------------------------------------------------------
// Mainnet Protocol Addresses
// ---------------------------------------------------------------------------

pub const AAVE_V3_POOL: Address = address!("87870Bca3F3fD6335C3F4ce8392D69350B4fA4E2");
pub const AAVE_V3_ORACLE: Address = address!("54586bE62E3c3580375aE3723C145253060Ca0C2");

pub const MAKER_CDP_MANAGER: Address = address!("5ef30b9986345249bc32d8928B7ee64DE9435E39");
pub const MAKER_JOIN_ETH_A: Address = address!("2F0b23f53734252Bda2277357e97e1517d6B042A");

pub const DSS_FLASH: Address = address!("60744434d6339a6B27d73d9Eda62b6F66a0a04FA");
pub const BALANCER_VAULT: Address = address!("BA12222222228d8Ba445958a75a0704d566BF2C8");
