pub mod types;
pub mod validate;

pub use types::*;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

use crate::types::Network;

/// Load and merge all config JSON files into a single [`PlannerConfig`],
/// then apply environment variable overrides and validate.
///
/// Expected directory layout:
/// ```text
/// config/
///   app.json
///   fees.json
///   flashloan.json
///   protocols.json
/// ```
///
/// # Environment variable overrides
///
/// | Env Var                             | Config Field                    |
/// |-------------------------------------|---------------------------------|
/// | `PLANNER_NETWORK`                   | `app.network`                   |
/// | `PLANNER_FEE_BIPS`                  | `fees.fee_bips`                 |
/// | `PLANNER_DEFAULT_SLIPPAGE`          | `fees.default_slippage`         |
/// | `PLANNER_LOG_DIR`                   | `app.logging.log_dir`           |
/// | `PLANNER_SCALE_INFERENCE_THRESHOLD` | `app.scale_inference_threshold` |
pub fn load_config(config_dir: &Path) -> Result<PlannerConfig> {
    let read = |name: &str| -> Result<String> {
        let path = config_dir.join(name);
        std::fs::read_to_string(&path).with_context(|| format!("failed to read config file: {}", path.display()))
    };

    let app: AppConfig = serde_json::from_str(&read("app.json")?).context("parsing app.json")?;

    let fees: FeeConfig = serde_json::from_str(&read("fees.json")?).context("parsing fees.json")?;

    let flashloan: FlashloanConfig =
        serde_json::from_str(&read("flashloan.json")?).context("parsing flashloan.json")?;

    let protocols: ProtocolsConfig =
        serde_json::from_str(&read("protocols.json")?).context("parsing protocols.json")?;

    let mut config = PlannerConfig {
        app,
        fees,
        flashloan,
        protocols,
    };

    apply_env_overrides(&mut config);
    validate::validate_config(&config)?;

    Ok(config)
}

// ---------------------------------------------------------------------------
// Environment variable overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides to the loaded config.
///
/// Only non-empty env vars take effect. Parse failures are logged and skipped
/// (the JSON value remains).
fn apply_env_overrides(config: &mut PlannerConfig) {
    // -- App -----------------------------------------------------------------
    if let Some(val) = env_parse::<Network>("PLANNER_NETWORK") {
        info!(network = %val, "env override: PLANNER_NETWORK");
        config.app.network = val;
    }

    if let Some(val) = env_string("PLANNER_LOG_DIR") {
        info!(log_dir = %val, "env override: PLANNER_LOG_DIR");
        config.app.logging.log_dir = val;
    }

    if let Some(val) = env_decimal("PLANNER_SCALE_INFERENCE_THRESHOLD") {
        info!(%val, "env override: PLANNER_SCALE_INFERENCE_THRESHOLD");
        config.app.scale_inference_threshold = Some(val);
    }

    // -- Fees ----------------------------------------------------------------
    if let Some(val) = env_parse::<u32>("PLANNER_FEE_BIPS") {
        info!(val, "env override: PLANNER_FEE_BIPS");
        config.fees.fee_bips = val;
    }

    if let Some(val) = env_decimal("PLANNER_DEFAULT_SLIPPAGE") {
        info!(%val, "env override: PLANNER_DEFAULT_SLIPPAGE");
        config.fees.default_slippage = val;
    }
}

/// Read a non-empty env var as a `String`.
fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Read a non-empty env var and parse it as `T`.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse() {
        Ok(val) => Some(val),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable env override");
            None
        }
    }
}

/// Read a non-empty env var and parse it as `Decimal`.
fn env_decimal(key: &str) -> Option<Decimal> {
    let raw = env_string(key)?;
    match Decimal::from_str(&raw) {
        Ok(val) => Some(val),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring unparsable env override");
            None
        }
    }
}
