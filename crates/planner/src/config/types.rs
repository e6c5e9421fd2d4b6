use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use alloy::primitives::Address;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::core::solver::SolverConfig;
use crate::core::strategy::{
    AaveContext, AaveReserve, EModeCategory, MakerContext, MakerIlk, ProtocolContext,
};
use crate::execution::actions::ActionVersions;
use crate::execution::collaborators::{FlashloanProviders, ProviderSettings};
use crate::types::{FeeTier, FlashloanProvider, LendingProtocol, Network};

// ---------------------------------------------------------------------------
// Top-level aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerConfig {
    pub app: AppConfig,
    pub fees: FeeConfig,
    pub flashloan: FlashloanConfig,
    pub protocols: ProtocolsConfig,
}

// ---------------------------------------------------------------------------
// app.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub network: Network,
    pub default_precision: u32,
    /// Enables magnitude-based unit inference for `inferred` amounts.
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub scale_inference_threshold: Option<Decimal>,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub action_versions: ActionVersions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub log_dir: String,
    #[serde(default = "default_log_file")]
    pub file_name: String,
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_file() -> String {
    "planner.log".into()
}

fn default_log_filter() -> String {
    "multiply_planner=info,warn".into()
}

// ---------------------------------------------------------------------------
// fees.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    pub fee_bips: u32,
    pub fee_base: u32,
    /// Slippage for requests whose prices leave it unset.
    #[serde(with = "rust_decimal::serde::str")]
    pub default_slippage: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub debt_accrual_buffer: Decimal,
}

// ---------------------------------------------------------------------------
// flashloan.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FlashloanConfig {
    pub providers: HashMap<FlashloanProvider, ProviderEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    pub address: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub fee: Decimal,
    pub lends: Vec<String>,
}

// ---------------------------------------------------------------------------
// protocols.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolsConfig {
    pub aave_v2: AaveProtocolConfig,
    pub aave_v3: AaveProtocolConfig,
    pub maker: MakerProtocolConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AaveProtocolConfig {
    pub pool: String,
    pub oracle: String,
    pub reserves: BTreeMap<String, ReserveEntry>,
    #[serde(default)]
    pub e_mode: Option<EModeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReserveEntry {
    pub address: String,
    /// Falls back to `app.default_precision` when omitted.
    #[serde(default)]
    pub decimals: Option<u32>,
    #[serde(with = "rust_decimal::serde::str")]
    pub max_ltv: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidation_threshold: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EModeEntry {
    pub id: u8,
    #[serde(with = "rust_decimal::serde::str")]
    pub max_ltv: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidation_threshold: Decimal,
    pub assets: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MakerProtocolConfig {
    pub cdp_manager: String,
    pub dai: String,
    pub dai_join: String,
    pub ilks: BTreeMap<String, IlkEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IlkEntry {
    pub ilk: String,
    pub token: String,
    pub join_adapter: String,
    #[serde(default)]
    pub decimals: Option<u32>,
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidation_ratio: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub dust: Decimal,
}

// ---------------------------------------------------------------------------
// Runtime views
// ---------------------------------------------------------------------------

fn parse_address(field: &str, value: &str) -> Result<Address> {
    Address::from_str(value).with_context(|| format!("{field}: invalid address '{value}'"))
}

impl PlannerConfig {
    pub fn solver_config(&self) -> SolverConfig {
        SolverConfig {
            default_precision: self.app.default_precision,
            fee: FeeTier {
                bips: self.fees.fee_bips,
                base: self.fees.fee_base,
            },
            default_slippage: self.fees.default_slippage,
            debt_accrual_buffer: self.fees.debt_accrual_buffer,
            scale_inference_threshold: self.app.scale_inference_threshold,
        }
    }

    pub fn flashloan_providers(&self) -> Result<FlashloanProviders> {
        let mut providers = HashMap::new();
        for (provider, entry) in &self.flashloan.providers {
            let settings = ProviderSettings {
                address: parse_address(&format!("flashloan.{provider}.address"), &entry.address)?,
                fee: entry.fee,
                lends: entry.lends.clone(),
            };
            providers.insert(*provider, settings);
        }
        Ok(FlashloanProviders::new(providers))
    }

    /// Protocol context for `protocol`, with addresses parsed.
    pub fn protocol_context(&self, protocol: LendingProtocol) -> Result<ProtocolContext> {
        Ok(match protocol {
            LendingProtocol::AaveV2 => ProtocolContext::AaveV2(aave_context("aave_v2", &self.protocols.aave_v2)?),
            LendingProtocol::AaveV3 => ProtocolContext::AaveV3(aave_context("aave_v3", &self.protocols.aave_v3)?),
            LendingProtocol::Maker => ProtocolContext::Maker(maker_context(&self.protocols.maker)?),
        })
    }
}

fn aave_context(name: &str, config: &AaveProtocolConfig) -> Result<AaveContext> {
    let mut reserves = BTreeMap::new();
    for (symbol, reserve) in &config.reserves {
        reserves.insert(
            symbol.to_ascii_uppercase(),
            AaveReserve {
                address: parse_address(&format!("{name}.reserves.{symbol}.address"), &reserve.address)?,
                precision: reserve.decimals,
                max_ltv: reserve.max_ltv,
                liquidation_threshold: reserve.liquidation_threshold,
            },
        );
    }
    Ok(AaveContext {
        pool: parse_address(&format!("{name}.pool"), &config.pool)?,
        oracle: parse_address(&format!("{name}.oracle"), &config.oracle)?,
        reserves,
        e_mode: config.e_mode.as_ref().map(|e| EModeCategory {
            id: e.id,
            max_ltv: e.max_ltv,
            liquidation_threshold: e.liquidation_threshold,
            assets: e.assets.iter().map(|a| a.to_ascii_uppercase()).collect(),
        }),
    })
}

fn maker_context(config: &MakerProtocolConfig) -> Result<MakerContext> {
    let mut ilks = BTreeMap::new();
    for (symbol, ilk) in &config.ilks {
        ilks.insert(
            symbol.to_ascii_uppercase(),
            MakerIlk {
                ilk: ilk.ilk.clone(),
                token: parse_address(&format!("maker.ilks.{symbol}.token"), &ilk.token)?,
                join_adapter: parse_address(&format!("maker.ilks.{symbol}.join_adapter"), &ilk.join_adapter)?,
                precision: ilk.decimals,
                liquidation_ratio: ilk.liquidation_ratio,
                dust: ilk.dust,
            },
        );
    }
    Ok(MakerContext {
        cdp_manager: parse_address("maker.cdp_manager", &config.cdp_manager)?,
        dai: parse_address("maker.dai", &config.dai)?,
        dai_join: parse_address("maker.dai_join", &config.dai_join)?,
        ilks,
    })
}
