use candid::{CandidType, Principal};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// ICP ledger canister id on mainnet.
pub const ICP_LEDGER_CANISTER_ID: &str = "ryjl3-tyaaa-aaaaa-aaaba-cai";

pub const WEI_PER_ETH: f64 = 1e18;
pub const E8S_PER_ICP: f64 = 1e8;
pub const GWEI: u64 = 1_000_000_000;

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct RpcEndpointConfig {
    pub url: String,
    /// Higher weight is tried first among healthy endpoints.
    pub weight: u8,
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_endpoints: Vec<RpcEndpointConfig>,
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct BridgeConfig {
    pub min_quote_amount: u64,
    pub max_quote_amount: u64,
    pub quote_validity_minutes: u64,
    /// Circuit breaker: quotes are refused above this max_fee_per_gas (wei).
    pub max_gas_price: u64,
    pub safety_margin_percent: u32,
    /// Floor for the EIP-1559 priority fee estimate (wei).
    pub min_priority_fee: u64,
    pub supported_chains: Vec<ChainConfig>,
    pub ledger_canister: Principal,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            min_quote_amount: 1_000_000_000_000_000,      // 0.001 ETH
            max_quote_amount: 1_000_000_000_000_000_000,  // 1 ETH
            quote_validity_minutes: 15,
            max_gas_price: 500 * GWEI,
            safety_margin_percent: 20,
            min_priority_fee: GWEI,
            supported_chains: vec![ChainConfig {
                name: "Base Sepolia".to_string(),
                chain_id: 84532,
                rpc_endpoints: vec![
                    RpcEndpointConfig {
                        url: "https://sepolia.base.org".to_string(),
                        weight: 4,
                    },
                    RpcEndpointConfig {
                        url: "https://base-sepolia.publicnode.com".to_string(),
                        weight: 3,
                    },
                    RpcEndpointConfig {
                        url: "https://rpc.ankr.com/base_sepolia".to_string(),
                        weight: 2,
                    },
                    RpcEndpointConfig {
                        url: "https://1rpc.io/base-sepolia".to_string(),
                        weight: 1,
                    },
                ],
            }],
            ledger_canister: Principal::from_text(ICP_LEDGER_CANISTER_ID)
                .unwrap_or(Principal::anonymous()),
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> BridgeResult<()> {
        if self.min_quote_amount == 0 || self.min_quote_amount > self.max_quote_amount {
            return Err(BridgeError::ConfigInvalid {
                message: "quote amount bounds are inverted or zero".to_string(),
            });
        }
        if self.quote_validity_minutes == 0 {
            return Err(BridgeError::ConfigInvalid {
                message: "quote validity must be at least one minute".to_string(),
            });
        }
        if self.safety_margin_percent > 100 {
            return Err(BridgeError::ConfigInvalid {
                message: "safety margin above 100 percent".to_string(),
            });
        }
        if self.supported_chains.is_empty() {
            return Err(BridgeError::ConfigInvalid {
                message: "no destination chains configured".to_string(),
            });
        }
        for chain in &self.supported_chains {
            if chain.rpc_endpoints.is_empty() {
                return Err(BridgeError::ConfigInvalid {
                    message: format!("chain {} has no rpc endpoints", chain.name),
                });
            }
        }
        Ok(())
    }

    pub fn chain(&self, name: &str) -> BridgeResult<&ChainConfig> {
        self.supported_chains
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| BridgeError::UnsupportedChain {
                chain: name.to_string(),
            })
    }

    pub fn validity_window_seconds(&self) -> u64 {
        self.quote_validity_minutes * 60
    }
}

/// Installation arguments. Every field is optional so redeploys can keep the
/// stored configuration.
#[derive(Clone, Debug, Default, CandidType, Deserialize)]
pub struct InitArgs {
    pub admins: Vec<Principal>,
    pub ledger_canister: Option<Principal>,
    pub min_quote_amount: Option<u64>,
    pub max_quote_amount: Option<u64>,
    pub quote_validity_minutes: Option<u64>,
    pub max_gas_price: Option<u64>,
    pub safety_margin_percent: Option<u32>,
    pub daily_limit: Option<u64>,
    pub supported_chains: Option<Vec<ChainConfig>>,
}

impl InitArgs {
    pub fn into_config(self) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        if let Some(ledger) = self.ledger_canister {
            config.ledger_canister = ledger;
        }
        if let Some(v) = self.min_quote_amount {
            config.min_quote_amount = v;
        }
        if let Some(v) = self.max_quote_amount {
            config.max_quote_amount = v;
        }
        if let Some(v) = self.quote_validity_minutes {
            config.quote_validity_minutes = v;
        }
        if let Some(v) = self.max_gas_price {
            config.max_gas_price = v;
        }
        if let Some(v) = self.safety_margin_percent {
            config.safety_margin_percent = v;
        }
        if let Some(chains) = self.supported_chains {
            config.supported_chains = chains;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chain("Base Sepolia").unwrap().chain_id, 84532);
        assert!(matches!(
            config.chain("Arbitrum One"),
            Err(BridgeError::UnsupportedChain { .. })
        ));
    }

    #[test]
    fn validation_rejects_inverted_bounds() {
        let mut config = BridgeConfig::default();
        config.min_quote_amount = config.max_quote_amount + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn init_args_override_defaults() {
        let args = InitArgs {
            max_quote_amount: Some(5_000_000_000_000_000_000),
            safety_margin_percent: Some(10),
            ..InitArgs::default()
        };
        let config = args.into_config();
        assert_eq!(config.max_quote_amount, 5_000_000_000_000_000_000);
        assert_eq!(config.safety_margin_percent, 10);
        assert_eq!(config.quote_validity_minutes, 15);
    }
}
