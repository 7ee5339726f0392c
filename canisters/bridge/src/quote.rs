//! Quote issuance and lifecycle: pricing against live gas and prices,
//! reserving liquidity while a quote is Active, and expiring stale quotes.

use candid::Principal;

use crate::config::{BridgeConfig, E8S_PER_ICP, WEI_PER_ETH};
use crate::error::{BridgeError, BridgeResult};
use crate::gas::{self, GasEstimate};
use crate::price;
use crate::reserve::ReserveState;
use crate::storage::{self, AuditEvent};
use crate::types::{parse_evm_address, ulid, Quote, QuoteStatus};

/// Wei-side and source-side costs of one quote.
#[derive(Clone, Debug, PartialEq)]
pub struct PricedQuote {
    pub gas_budget: u64,
    pub safety_margin: u64,
    pub total_cost_e8s: u64,
}

/// Price a delivery: worst-case gas budget on top of the delivered amount,
/// converted through USD into source-token e8s with the safety margin
/// applied multiplicatively, rounded up.
pub fn price_quote(
    amount_out: u64,
    estimate: &GasEstimate,
    icp_usd: f64,
    eth_usd: f64,
    safety_margin_percent: u32,
) -> BridgeResult<PricedQuote> {
    if !(icp_usd > 0.0) || !(eth_usd > 0.0) {
        return Err(BridgeError::PriceUnavailable {
            asset: "ICP/ETH".to_string(),
        });
    }
    let gas_budget = estimate.gas_budget();
    let covered_wei = amount_out
        .checked_add(gas_budget)
        .ok_or_else(|| BridgeError::validation("delivery plus gas budget overflows"))?;
    let safety_margin =
        (covered_wei as u128 * safety_margin_percent as u128 / 100) as u64;

    let covered_eth = covered_wei as f64 / WEI_PER_ETH;
    let margin_factor = 1.0 + safety_margin_percent as f64 / 100.0;
    let total_cost_icp = covered_eth * eth_usd / icp_usd * margin_factor;
    let total_cost_e8s = (total_cost_icp * E8S_PER_ICP).ceil() as u64;

    Ok(PricedQuote {
        gas_budget,
        safety_margin,
        total_cost_e8s,
    })
}

/// Backpressure gate for quote issuance: paused, below-critical, or an
/// exhausted daily limit all fail fast, before any gas or price outcall.
/// The reservation will be at least `amount`, so a daily remainder under
/// that can never lock.
pub fn check_backpressure(
    reserve: &ReserveState,
    amount: u64,
    now_sec: u64,
) -> BridgeResult<()> {
    if reserve.paused {
        return Err(BridgeError::ReservePaused);
    }
    if !reserve.accepting_quotes() {
        return Err(BridgeError::InsufficientReserve {
            required: amount,
            available: reserve.available(),
        });
    }
    let remaining = reserve.daily_remaining_at(now_sec);
    if remaining < amount {
        return Err(BridgeError::DailyLimitExceeded {
            requested: amount,
            remaining,
        });
    }
    Ok(())
}

pub fn validate_request(
    config: &BridgeConfig,
    amount: u64,
    destination_address: &str,
    destination_chain: &str,
) -> BridgeResult<()> {
    if amount < config.min_quote_amount || amount > config.max_quote_amount {
        return Err(BridgeError::AmountOutOfRange {
            amount,
            min: config.min_quote_amount,
            max: config.max_quote_amount,
        });
    }
    parse_evm_address(destination_address)?;
    config.chain(destination_chain)?;
    Ok(())
}

fn now_sec() -> u64 {
    ic_cdk::api::time() / 1_000_000_000
}

fn now_ms() -> u64 {
    ic_cdk::api::time() / 1_000_000
}

pub fn new_id() -> String {
    ulid(now_ms(), storage::next_ulid_seq() as u128)
}

/// Issue a quote for delivering `amount` wei. Locks the reserve for the
/// delivery plus gas budget; the lock is rolled back if anything after it
/// fails.
pub async fn request_quote(
    caller: Principal,
    amount: u64,
    destination_address: String,
    destination_chain: String,
) -> BridgeResult<Quote> {
    let config = storage::get_config();
    validate_request(&config, amount, &destination_address, &destination_chain)?;

    storage::with_reserve(|r| check_backpressure(r, amount, now_sec()))?;

    let chain = config.chain(&destination_chain)?.clone();
    let estimate = gas::estimate(&chain, &config).await?;
    let (icp_usd, eth_usd) = price::fresh_pair().await?;
    let priced = price_quote(
        amount,
        &estimate,
        icp_usd,
        eth_usd,
        config.safety_margin_percent,
    )?;

    let now = now_sec();
    let reserved = amount
        .checked_add(priced.gas_budget)
        .ok_or_else(|| BridgeError::validation("reservation amount overflows"))?;
    storage::mutate_reserve(|r| r.lock(reserved, now))?;

    let quote = Quote {
        id: new_id(),
        user: caller,
        amount_requested: amount,
        amount_out: amount,
        gas_estimate: estimate.gas_limit,
        base_fee: estimate.base_fee,
        priority_fee: estimate.priority_fee,
        max_fee_per_gas: estimate.max_fee_per_gas,
        safety_margin: priced.safety_margin,
        total_cost: priced.total_cost_e8s,
        destination_address,
        source_chain: "ICP".to_string(),
        destination_chain,
        created_at: now,
        expires_at: now + config.validity_window_seconds(),
        status: QuoteStatus::Active,
    };
    storage::insert_quote(quote.clone());
    storage::audit(
        now,
        AuditEvent {
            event_type: "quote_created",
            actor: Some(caller),
            admin: None,
            amount: Some(amount),
            tx_hash: None,
            details: format!(
                "quote {} for {} wei to {}, total cost {} e8s",
                quote.id, amount, quote.destination_address, quote.total_cost
            ),
        },
    );
    Ok(quote)
}

/// Expire an overdue Active quote, releasing its reservation exactly once.
pub fn check_expiry(quote_id: &str, now_sec: u64) -> Option<Quote> {
    let quote = storage::get_quote(quote_id)?;
    if quote.status != QuoteStatus::Active || !quote.is_expired(now_sec) {
        return Some(quote);
    }
    let updated = storage::update_quote(quote_id, |q| q.status = QuoteStatus::Expired)?;
    storage::mutate_reserve(|r| r.unlock(quote.reserved_amount(), now_sec));
    storage::audit(
        now_sec,
        AuditEvent {
            event_type: "quote_expired",
            actor: Some(quote.user),
            admin: None,
            amount: Some(quote.amount_out),
            tx_hash: None,
            details: format!("quote {} expired, {} wei unlocked", quote.id, quote.reserved_amount()),
        },
    );
    Some(updated)
}

/// Opportunistic sweep run on API entry points.
pub fn sweep_expired(now_sec: u64) {
    for id in storage::active_quote_ids() {
        check_expiry(&id, now_sec);
    }
}

/// A quote that is Active, unexpired, owned by `caller`, and not already
/// settled; the common precondition of the settlement paths.
pub fn settleable_quote(quote_id: &str, caller: Principal, now_sec: u64) -> BridgeResult<Quote> {
    let quote = check_expiry(quote_id, now_sec).ok_or(BridgeError::QuoteNotFound {
        quote_id: quote_id.to_string(),
    })?;
    if quote.user != caller {
        return Err(BridgeError::NotAuthorized);
    }
    match quote.status {
        QuoteStatus::Active => {}
        QuoteStatus::Expired => {
            return Err(BridgeError::QuoteExpired {
                quote_id: quote_id.to_string(),
            })
        }
        QuoteStatus::Settled | QuoteStatus::Failed => {
            let settlement_id = storage::settlement_by_quote(quote_id)
                .map(|s| s.id)
                .unwrap_or_default();
            return Err(BridgeError::QuoteAlreadySettled {
                quote_id: quote_id.to_string(),
                settlement_id,
            });
        }
    }
    if let Some(existing) = storage::settlement_by_quote(quote_id) {
        return Err(BridgeError::QuoteAlreadySettled {
            quote_id: quote_id.to_string(),
            settlement_id: existing.id,
        });
    }
    Ok(quote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GWEI;
    use crate::reserve::ReserveState;

    fn scenario_estimate() -> GasEstimate {
        GasEstimate {
            base_fee: 30 * GWEI,
            priority_fee: GWEI,
            max_fee_per_gas: 61 * GWEI,
            gas_limit: 21_000,
            fetched_at: 0,
        }
    }

    #[test]
    fn scenario_pricing_one_eth_to_base_sepolia() {
        let estimate = scenario_estimate();
        let priced = price_quote(1_000_000_000_000_000_000, &estimate, 6.0, 3000.0, 20).unwrap();
        assert_eq!(priced.gas_budget, 61 * GWEI * 21_000);
        // ((1 ETH + gas budget) * 3000 / 6) * 1.20, in e8s, rounded up.
        assert!(priced.total_cost_e8s >= 60_076_860_000);
        assert!(priced.total_cost_e8s <= 60_076_860_002);
        assert_eq!(
            priced.safety_margin,
            (1_000_000_000_000_000_000u64 + priced.gas_budget) / 5
        );
    }

    #[test]
    fn quote_conservation_property() {
        // total_cost must always cover amount_out + max_fee * gas in source
        // units, for a spread of amounts and prices.
        for &amount in &[1_000_000_000_000_000u64, 25_000_000_000_000_000, 999_000_000_000_000_000] {
            for &(icp, eth) in &[(6.0, 3000.0), (11.5, 1800.0), (4.2, 4200.0)] {
                let estimate = scenario_estimate();
                let priced = price_quote(amount, &estimate, icp, eth, 20).unwrap();
                let covered_wei = amount as f64 + estimate.gas_budget() as f64;
                let floor_e8s = covered_wei / WEI_PER_ETH * eth / icp * E8S_PER_ICP;
                assert!(priced.total_cost_e8s as f64 >= floor_e8s);
            }
        }
    }

    #[test]
    fn pricing_requires_positive_prices() {
        let estimate = scenario_estimate();
        assert!(price_quote(1, &estimate, 0.0, 3000.0, 20).is_err());
        assert!(price_quote(1, &estimate, 6.0, f64::NAN, 20).is_err());
    }

    #[test]
    fn request_validation() {
        let config = BridgeConfig::default();
        let addr = "0x742d35Cc6634C0532925a3b844Bc9e7595f3Ab00";
        assert!(validate_request(&config, config.min_quote_amount, addr, "Base Sepolia").is_ok());
        assert!(matches!(
            validate_request(&config, config.min_quote_amount - 1, addr, "Base Sepolia"),
            Err(BridgeError::AmountOutOfRange { .. })
        ));
        assert!(matches!(
            validate_request(&config, config.min_quote_amount, "0xnope", "Base Sepolia"),
            Err(BridgeError::InvalidAddress { .. })
        ));
        assert!(matches!(
            validate_request(&config, config.min_quote_amount, addr, "Mainnet"),
            Err(BridgeError::UnsupportedChain { .. })
        ));
    }

    #[test]
    fn backpressure_fails_fast_before_any_outcall() {
        const ETH: u64 = 1_000_000_000_000_000_000;
        let mut reserve = ReserveState::default();
        reserve.topup(100 * ETH, 1_000);
        reserve.set_daily_limit(ETH);
        reserve.lock(ETH, 1_000).unwrap();

        // Daily limit exhausted: refused before gas or price fetches run.
        let err = check_backpressure(&reserve, ETH / 100, 1_001).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::DailyLimitExceeded { remaining: 0, .. }
        ));

        // The same request clears once the UTC day rolls over.
        assert!(check_backpressure(&reserve, ETH / 100, 86_400 + 1_000).is_ok());

        // Paused wins over everything else.
        reserve.paused = true;
        assert_eq!(
            check_backpressure(&reserve, 1, 1_001),
            Err(BridgeError::ReservePaused)
        );
    }

    #[test]
    fn backpressure_refuses_below_critical_reserve() {
        let mut reserve = ReserveState::default();
        // 0.05 ETH available is under the default 0.1 ETH critical threshold.
        reserve.topup(50_000_000_000_000_000, 1_000);
        let err = check_backpressure(&reserve, 1_000_000_000_000_000, 1_001).unwrap_err();
        assert!(matches!(err, BridgeError::InsufficientReserve { .. }));

        // Exactly at the threshold still quotes.
        reserve.topup(50_000_000_000_000_000, 1_002);
        assert!(check_backpressure(&reserve, 1_000_000_000_000_000, 1_003).is_ok());
    }

    #[test]
    fn expiry_unlocks_exactly_once() {
        let now = 10_000;
        let quote = Quote {
            id: "expiry-test-quote".to_string(),
            user: Principal::anonymous(),
            amount_requested: 1_000,
            amount_out: 1_000,
            gas_estimate: 21_000,
            base_fee: 0,
            priority_fee: 0,
            max_fee_per_gas: 2,
            safety_margin: 0,
            total_cost: 1,
            destination_address: "0x0000000000000000000000000000000000000042".to_string(),
            source_chain: "ICP".to_string(),
            destination_chain: "Base Sepolia".to_string(),
            created_at: now,
            expires_at: now + 900,
            status: QuoteStatus::Active,
        };
        let reserved = quote.reserved_amount();
        storage::mutate_reserve(|r| {
            *r = ReserveState::default();
            r.topup(10 * reserved, now);
            r.lock(reserved, now).unwrap();
        });
        storage::insert_quote(quote.clone());

        // Not yet expired: untouched.
        check_expiry(&quote.id, now + 899);
        assert_eq!(storage::with_reserve(|r| r.locked), reserved);

        // Expired: released once, and a second check is a no-op.
        let expired = check_expiry(&quote.id, now + 900).unwrap();
        assert_eq!(expired.status, QuoteStatus::Expired);
        assert_eq!(storage::with_reserve(|r| r.locked), 0);
        check_expiry(&quote.id, now + 901);
        assert_eq!(storage::with_reserve(|r| r.locked), 0);
        assert_eq!(storage::with_reserve(|r| r.available()), 10 * reserved);
    }
}
