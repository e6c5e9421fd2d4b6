use anyhow::{bail, Result};
use rust_decimal::Decimal;

use super::types::{AaveProtocolConfig, PlannerConfig};
use crate::constants::MAX_DECIMAL_PRECISION;
use crate::execution::collaborators::resolve_flashloan_provider;

/// Validate invariants across the merged config that serde alone cannot enforce.
///
/// Every problem is collected and reported in one error. Called automatically
/// by [`super::load_config`].
pub fn validate_config(config: &PlannerConfig) -> Result<()> {
    let mut errors: Vec<String> = Vec::new();

    validate_app_config(config, &mut errors);
    validate_fee_config(config, &mut errors);
    validate_flashloan_config(config, &mut errors);
    validate_aave_config("aave_v2", &config.protocols.aave_v2, &mut errors);
    validate_aave_config("aave_v3", &config.protocols.aave_v3, &mut errors);
    validate_maker_config(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        let msg = format!(
            "Configuration validation failed ({} error{}):\n  - {}",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" },
            errors.join("\n  - ")
        );
        bail!("{msg}");
    }
}

// ---------------------------------------------------------------------------
// App config
// ---------------------------------------------------------------------------

fn validate_app_config(config: &PlannerConfig, errors: &mut Vec<String>) {
    let app = &config.app;

    if app.default_precision > MAX_DECIMAL_PRECISION {
        errors.push(format!(
            "app.default_precision: {} exceeds {MAX_DECIMAL_PRECISION}",
            app.default_precision
        ));
    }

    if let Some(threshold) = app.scale_inference_threshold {
        if threshold <= Decimal::ZERO {
            errors.push(format!("app.scale_inference_threshold: must be > 0, got {threshold}"));
        }
    }

    if app.logging.log_dir.is_empty() {
        errors.push("app.logging: log_dir is empty".into());
    }

    for (name, version) in app.action_versions.entries() {
        if *version == 0 {
            errors.push(format!("app.action_versions.{name}: versions start at 1"));
        }
    }
}

// ---------------------------------------------------------------------------
// Fees
// ---------------------------------------------------------------------------

fn validate_fee_config(config: &PlannerConfig, errors: &mut Vec<String>) {
    let fees = &config.fees;

    if fees.fee_base == 0 {
        errors.push("fees.fee_base: must be > 0".into());
    }

    if fees.fee_bips >= fees.fee_base && fees.fee_base > 0 {
        errors.push(format!(
            "fees.fee_bips: {} must be below fee_base {}",
            fees.fee_bips, fees.fee_base
        ));
    }

    if fees.default_slippage < Decimal::ZERO || fees.default_slippage >= Decimal::ONE {
        errors.push(format!(
            "fees.default_slippage: {} outside [0, 1)",
            fees.default_slippage
        ));
    }

    if fees.debt_accrual_buffer < Decimal::ZERO {
        errors.push(format!(
            "fees.debt_accrual_buffer: must be >= 0, got {}",
            fees.debt_accrual_buffer
        ));
    }
}

// ---------------------------------------------------------------------------
// Flashloan providers
// ---------------------------------------------------------------------------

fn validate_flashloan_config(config: &PlannerConfig, errors: &mut Vec<String>) {
    for (provider, entry) in &config.flashloan.providers {
        if let Err(e) = validate_address(&entry.address) {
            errors.push(format!("flashloan.{provider}.address: {e}"));
        }
        if entry.fee < Decimal::ZERO || entry.fee >= Decimal::ONE {
            errors.push(format!("flashloan.{provider}.fee: {} outside [0, 1)", entry.fee));
        }
        if entry.lends.is_empty() {
            errors.push(format!("flashloan.{provider}.lends: must list at least one token"));
        }
    }

    // The selected network must have a configured provider.
    match resolve_flashloan_provider(config.app.network) {
        Ok(provider) if !config.flashloan.providers.contains_key(&provider) => {
            errors.push(format!(
                "flashloan: provider {provider} for network {} is not configured",
                config.app.network
            ));
        }
        Ok(_) => {}
        Err(e) => errors.push(format!("app.network: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Protocols
// ---------------------------------------------------------------------------

fn validate_aave_config(name: &str, aave: &AaveProtocolConfig, errors: &mut Vec<String>) {
    for (field, addr) in [("pool", &aave.pool), ("oracle", &aave.oracle)] {
        if let Err(e) = validate_address(addr) {
            errors.push(format!("{name}.{field}: {e}"));
        }
    }

    if aave.reserves.is_empty() {
        errors.push(format!("{name}.reserves: must have at least one reserve"));
    }

    for (symbol, reserve) in &aave.reserves {
        let prefix = format!("{name}.reserves.{symbol}");
        if let Err(e) = validate_address(&reserve.address) {
            errors.push(format!("{prefix}.address: {e}"));
        }
        if let Some(decimals) = reserve.decimals.filter(|d| *d > MAX_DECIMAL_PRECISION) {
            errors.push(format!("{prefix}.decimals: {decimals} exceeds {MAX_DECIMAL_PRECISION}"));
        }
        if !is_open_unit(reserve.max_ltv) {
            errors.push(format!("{prefix}.max_ltv: {} outside (0, 1)", reserve.max_ltv));
        }
        if reserve.liquidation_threshold < reserve.max_ltv || reserve.liquidation_threshold >= Decimal::ONE {
            errors.push(format!(
                "{prefix}.liquidation_threshold: {} must lie in [max_ltv, 1)",
                reserve.liquidation_threshold
            ));
        }
    }

    if let Some(e_mode) = &aave.e_mode {
        if !is_open_unit(e_mode.max_ltv) {
            errors.push(format!("{name}.e_mode.max_ltv: {} outside (0, 1)", e_mode.max_ltv));
        }
        for asset in &e_mode.assets {
            if !aave.reserves.keys().any(|k| k.eq_ignore_ascii_case(asset)) {
                errors.push(format!("{name}.e_mode.assets: {asset} is not a configured reserve"));
            }
        }
    }
}

fn validate_maker_config(config: &PlannerConfig, errors: &mut Vec<String>) {
    let maker = &config.protocols.maker;

    let addrs = [
        ("cdp_manager", &maker.cdp_manager),
        ("dai", &maker.dai),
        ("dai_join", &maker.dai_join),
    ];
    for (field, addr) in addrs {
        if let Err(e) = validate_address(addr) {
            errors.push(format!("maker.{field}: {e}"));
        }
    }

    for (symbol, ilk) in &maker.ilks {
        let prefix = format!("maker.ilks.{symbol}");
        for (field, addr) in [("token", &ilk.token), ("join_adapter", &ilk.join_adapter)] {
            if let Err(e) = validate_address(addr) {
                errors.push(format!("{prefix}.{field}: {e}"));
            }
        }
        if let Some(decimals) = ilk.decimals.filter(|d| *d > MAX_DECIMAL_PRECISION) {
            errors.push(format!("{prefix}.decimals: {decimals} exceeds {MAX_DECIMAL_PRECISION}"));
        }
        if ilk.liquidation_ratio <= Decimal::ONE {
            errors.push(format!("{prefix}.liquidation_ratio: must be > 1, got {}", ilk.liquidation_ratio));
        }
        if ilk.dust < Decimal::ZERO {
            errors.push(format!("{prefix}.dust: must be >= 0, got {}", ilk.dust));
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn is_open_unit(value: Decimal) -> bool {
    value > Decimal::ZERO && value < Decimal::ONE
}

fn validate_address(addr: &str) -> Result<(), String> {
    if addr.is_empty() {
        return Err("address is empty".into());
    }
    if !addr.starts_with("0x") && !addr.starts_with("0X") {
        return Err(format!("address '{addr}' must start with 0x"));
    }
    if addr.len() != 42 {
        return Err(format!("address '{addr}' has length {} (expected 42)", addr.len()));
    }
    if !addr[2..].chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("address '{addr}' contains non-hex characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_validate_address() {
        assert!(validate_address("0x6B175474E89094C44Da98b954EedeAC495271d0F").is_ok());
        assert!(validate_address("").is_err());
        assert!(validate_address("6B175474E89094C44Da98b954EedeAC495271d0F").unwrap_err().contains("0x"));
        assert!(validate_address("0x6B175474E8").unwrap_err().contains("length"));
        assert!(validate_address("0xZZ75474E89094C44Da98b954EedeAC495271d0F")
            .unwrap_err()
            .contains("non-hex"));
    }

    #[test]
    fn test_open_unit() {
        assert!(is_open_unit(dec!(0.8)));
        assert!(!is_open_unit(Decimal::ZERO));
        assert!(!is_open_unit(Decimal::ONE));
    }
}
