//! EIP-1559 fee estimation from `eth_feeHistory`, with a projection buffer
//! for the next block and a circuit breaker against runaway gas prices.

use std::cell::RefCell;

use candid::CandidType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{BridgeConfig, ChainConfig, GWEI};
use crate::error::{BridgeError, BridgeResult};
use crate::rpc;

pub const FEE_HISTORY_BLOCKS: u64 = 20;
pub const TRANSFER_GAS_LIMIT: u64 = 21_000;
const CALLDATA_GAS_PER_BYTE: u64 = 16;

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct GasEstimate {
    /// Next-block base fee projection (wei per gas).
    pub base_fee: u64,
    pub priority_fee: u64,
    pub max_fee_per_gas: u64,
    pub gas_limit: u64,
    pub fetched_at: u64,
}

impl GasEstimate {
    /// Worst-case wei spent on gas if the whole limit burns at max fee.
    pub fn gas_budget(&self) -> u64 {
        self.max_fee_per_gas.saturating_mul(self.gas_limit)
    }

    /// Minimum EIP-1559 replacement bump: both fee caps up by 12.5 %.
    pub fn bumped(&self) -> GasEstimate {
        let bump = |fee: u64| fee.saturating_add(fee / 8).saturating_add(1);
        GasEstimate {
            base_fee: self.base_fee,
            priority_fee: bump(self.priority_fee),
            max_fee_per_gas: bump(self.max_fee_per_gas),
            gas_limit: self.gas_limit,
            fetched_at: self.fetched_at,
        }
    }
}

pub fn gas_limit_for(data: &[u8]) -> u64 {
    TRANSFER_GAS_LIMIT + CALLDATA_GAS_PER_BYTE * data.len() as u64
}

/// Derive an estimate from a raw `eth_feeHistory` result.
///
/// * base fee: the last entry of `baseFeePerGas` scaled by 1.25;
/// * priority fee: 60th percentile of the per-block reward samples, floored
///   at the configured minimum;
/// * max fee: `2 * base + priority` headroom.
pub fn estimate_from_fee_history(
    result: &Value,
    min_priority_fee: u64,
    now_sec: u64,
) -> BridgeResult<GasEstimate> {
    let base_fees = result
        .get("baseFeePerGas")
        .and_then(Value::as_array)
        .ok_or(BridgeError::BadRpcResponse {
            expected: "baseFeePerGas".to_string(),
        })?;
    let last_base_hex = base_fees
        .last()
        .and_then(Value::as_str)
        .ok_or(BridgeError::BadRpcResponse {
            expected: "base fee entry".to_string(),
        })?;
    let last_base = rpc::u64_from_hex(last_base_hex)?;
    let base_fee = (last_base as u128 * 5 / 4) as u64;

    let mut reward_samples: Vec<u64> = Vec::new();
    if let Some(rewards) = result.get("reward").and_then(Value::as_array) {
        for block in rewards {
            if let Some(values) = block.as_array() {
                for value in values {
                    if let Some(hex) = value.as_str() {
                        if let Ok(fee) = rpc::u64_from_hex(hex) {
                            reward_samples.push(fee);
                        }
                    }
                }
            }
        }
    }
    let priority_fee = percentile_60(&mut reward_samples).max(min_priority_fee);

    let max_fee_per_gas = base_fee
        .saturating_mul(2)
        .saturating_add(priority_fee);

    Ok(GasEstimate {
        base_fee,
        priority_fee,
        max_fee_per_gas,
        gas_limit: TRANSFER_GAS_LIMIT,
        fetched_at: now_sec,
    })
}

fn percentile_60(samples: &mut Vec<u64>) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    samples.sort_unstable();
    let index = (samples.len() * 60 / 100).min(samples.len() - 1);
    samples[index]
}

/// Conservative constants for previews when the chain is unreachable. Never
/// used to price a real quote.
pub fn fallback_estimate(now_sec: u64) -> GasEstimate {
    let base_fee = 50 * GWEI;
    let priority_fee = 2 * GWEI;
    GasEstimate {
        base_fee,
        priority_fee,
        max_fee_per_gas: 2 * base_fee + priority_fee,
        gas_limit: TRANSFER_GAS_LIMIT,
        fetched_at: now_sec,
    }
}

pub fn validate(estimate: &GasEstimate, config: &BridgeConfig) -> BridgeResult<()> {
    if estimate.max_fee_per_gas > config.max_gas_price {
        return Err(BridgeError::validation(format!(
            "gas price {} above circuit breaker {}",
            estimate.max_fee_per_gas, config.max_gas_price
        )));
    }
    if estimate.gas_limit < TRANSFER_GAS_LIMIT {
        return Err(BridgeError::validation("gas limit below transfer floor"));
    }
    Ok(())
}

thread_local! {
    // chain id -> last derived estimate
    static LAST_ESTIMATES: RefCell<std::collections::BTreeMap<u64, GasEstimate>> =
        RefCell::new(std::collections::BTreeMap::new());
}

fn now_sec() -> u64 {
    ic_cdk::api::time() / 1_000_000_000
}

/// Current estimate for the chain. Re-fetched when older than a third of the
/// quote validity window; the RPC layer adds its own 15 s fee cache below
/// that.
pub async fn estimate(chain: &ChainConfig, config: &BridgeConfig) -> BridgeResult<GasEstimate> {
    let max_age = config.validity_window_seconds() / 3;
    let now = now_sec();
    let cached = LAST_ESTIMATES.with(|cell| cell.borrow().get(&chain.chain_id).cloned());
    if let Some(estimate) = cached {
        if now.saturating_sub(estimate.fetched_at) < max_age {
            validate(&estimate, config)?;
            return Ok(estimate);
        }
    }

    let history = rpc::fee_history(chain, FEE_HISTORY_BLOCKS).await?;
    let estimate = estimate_from_fee_history(&history, config.min_priority_fee, now_sec())?;
    validate(&estimate, config)?;
    LAST_ESTIMATES.with(|cell| {
        cell.borrow_mut().insert(chain.chain_id, estimate.clone());
    });
    Ok(estimate)
}

pub fn invalidate_cached_estimate() {
    LAST_ESTIMATES.with(|cell| cell.borrow_mut().clear());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use serde_json::json;

    #[test]
    fn derives_fees_from_history() {
        // Raw next-block base fee 24 gwei scales to a 30 gwei projection;
        // the 60th-percentile reward lands on 1 gwei.
        let history = json!({
            "baseFeePerGas": ["0x4a817c800", "0x59682f000"],
            "gasUsedRatio": [0.4, 0.6],
            "reward": [["0x3b9aca00"], ["0x3b9aca00"], ["0x5f5e100"]],
        });
        let estimate = estimate_from_fee_history(&history, GWEI, 1_000).unwrap();
        assert_eq!(estimate.base_fee, 30 * GWEI);
        assert_eq!(estimate.priority_fee, GWEI);
        assert_eq!(estimate.max_fee_per_gas, 61 * GWEI);
        assert_eq!(estimate.gas_limit, 21_000);
        assert_eq!(estimate.gas_budget(), 61 * GWEI * 21_000);
    }

    #[test]
    fn priority_fee_floors_at_minimum() {
        let history = json!({
            "baseFeePerGas": ["0x3b9aca00"],
            "reward": [["0x1"], ["0x2"]],
        });
        let estimate = estimate_from_fee_history(&history, GWEI, 0).unwrap();
        assert_eq!(estimate.priority_fee, GWEI);
    }

    #[test]
    fn missing_rewards_fall_back_to_floor() {
        let history = json!({ "baseFeePerGas": ["0x3b9aca00"] });
        let estimate = estimate_from_fee_history(&history, GWEI, 0).unwrap();
        assert_eq!(estimate.priority_fee, GWEI);
        assert!(estimate_from_fee_history(&json!({}), GWEI, 0).is_err());
    }

    #[test]
    fn percentile_picks_sixtieth() {
        let mut samples = vec![5, 1, 4, 2, 3];
        assert_eq!(percentile_60(&mut samples), 4);
        let mut single = vec![7];
        assert_eq!(percentile_60(&mut single), 7);
        let mut empty = Vec::new();
        assert_eq!(percentile_60(&mut empty), 0);
    }

    #[test]
    fn replacement_bump_is_at_least_12_5_percent() {
        let estimate = fallback_estimate(0);
        let bumped = estimate.bumped();
        assert!(bumped.max_fee_per_gas as f64 >= estimate.max_fee_per_gas as f64 * 1.125);
        assert!(bumped.priority_fee as f64 >= estimate.priority_fee as f64 * 1.125);
        assert_eq!(bumped.gas_limit, estimate.gas_limit);
    }

    #[test]
    fn circuit_breaker_rejects_expensive_estimates() {
        let config = BridgeConfig::default();
        let mut estimate = fallback_estimate(0);
        assert!(validate(&estimate, &config).is_ok());
        estimate.max_fee_per_gas = config.max_gas_price + 1;
        assert!(validate(&estimate, &config).is_err());
    }

    #[test]
    fn calldata_raises_gas_limit() {
        assert_eq!(gas_limit_for(&[]), 21_000);
        assert_eq!(gas_limit_for(&[0u8; 100]), 21_000 + 1_600);
    }
}
