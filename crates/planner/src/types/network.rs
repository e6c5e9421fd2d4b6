use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::PlannerError;

/// Chains the planner knows about. Not every chain has a flashloan provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Mainnet,
    Goerli,
    Optimism,
    Arbitrum,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Goerli => "goerli",
            Self::Optimism => "optimism",
            Self::Arbitrum => "arbitrum",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = PlannerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "ethereum" => Ok(Self::Mainnet),
            "goerli" => Ok(Self::Goerli),
            "optimism" | "opt_mainnet" => Ok(Self::Optimism),
            "arbitrum" => Ok(Self::Arbitrum),
            other => Err(PlannerError::UnsupportedNetwork {
                network: other.to_string(),
            }),
        }
    }
}

/// Source of same-transaction liquidity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashloanProvider {
    /// Maker's flash mint module; lends DAI only.
    DssFlash,
    /// Balancer vault; lends any pooled token.
    Balancer,
}

impl FlashloanProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DssFlash => "dss_flash",
            Self::Balancer => "balancer",
        }
    }
}

impl fmt::Display for FlashloanProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_from_str() {
        assert_eq!("Mainnet".parse::<Network>().unwrap(), Network::Mainnet);
        assert_eq!("opt_mainnet".parse::<Network>().unwrap(), Network::Optimism);
        assert!(matches!(
            "polygon".parse::<Network>(),
            Err(PlannerError::UnsupportedNetwork { .. })
        ));
    }

    #[test]
    fn test_network_serde_snake_case() {
        let json = serde_json::to_string(&Network::Optimism).unwrap();
        assert_eq!(json, "\"optimism\"");
        let provider: FlashloanProvider = serde_json::from_str("\"dss_flash\"").unwrap();
        assert_eq!(provider, FlashloanProvider::DssFlash);
    }
}
