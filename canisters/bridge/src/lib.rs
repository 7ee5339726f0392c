//! Gasless ICP -> EVM settlement bridge canister. Callers pay in ICP on the
//! source side; the bridge covers all destination-chain gas from its own
//! reserve, signs EIP-1559 transactions with threshold ECDSA, and guarantees
//! the recipient receives exactly the quoted amount.

use candid::Principal;
use ic_cdk::api::caller;
use ic_cdk::api::management_canister::http_request::{HttpResponse, TransformArgs};
use ic_cdk::{init, post_upgrade, query, update};

pub mod config;
pub mod error;
pub mod gas;
pub mod payment;
pub mod price;
pub mod quote;
pub mod reserve;
pub mod rpc;
pub mod settlement;
pub mod signer;
pub mod storage;
pub mod tx;
pub mod types;

use candid::CandidType;
use config::{BridgeConfig, InitArgs};
use error::{BridgeError, BridgeResult};
use price::PriceFeedStatus;
use rpc::RpcStats;
use serde::{Deserialize, Serialize};
use storage::AuditEvent;
use types::{
    AuditEntry, BridgeStatistics, Quote, Settlement, SponsorshipStatus, UserTransaction,
};

fn now_sec() -> u64 {
    ic_cdk::api::time() / 1_000_000_000
}

fn ensure_admin() -> BridgeResult<Principal> {
    let caller = caller();
    if storage::is_admin(&caller) {
        Ok(caller)
    } else {
        Err(BridgeError::NotAdmin)
    }
}

fn ensure_identified() -> BridgeResult<Principal> {
    let caller = caller();
    if caller == Principal::anonymous() {
        Err(BridgeError::AnonymousCaller)
    } else {
        Ok(caller)
    }
}

/// Opportunistic housekeeping on update entry points: expire overdue quotes
/// and release their reservations.
fn sweep() {
    quote::sweep_expired(now_sec());
}

#[init]
fn canister_init(args: Option<InitArgs>) {
    let args = args.unwrap_or_default();
    // The deployer is always the bootstrap admin.
    storage::add_admin(caller());
    for admin in &args.admins {
        storage::add_admin(*admin);
    }
    let daily_limit = args.daily_limit;
    let config = args.into_config();
    storage::set_config(config);
    if let Some(limit) = daily_limit {
        storage::mutate_reserve(|r| r.set_daily_limit(limit));
    }
    storage::run_migrations();
    storage::audit(
        now_sec(),
        AuditEvent {
            event_type: "canister_init",
            actor: None,
            admin: Some(caller()),
            amount: None,
            tx_hash: None,
            details: "bridge initialised".to_string(),
        },
    );
}

#[post_upgrade]
fn canister_post_upgrade() {
    // Stable structures survive in place; only the schema ladder runs here.
    storage::run_migrations();
}

// --- quoting and settlement ---

#[update]
async fn request_quote(
    amount_wei: u64,
    destination_address: String,
    destination_chain: String,
) -> Result<Quote, BridgeError> {
    sweep();
    let caller = ensure_identified()?;
    quote::request_quote(caller, amount_wei, destination_address, destination_chain).await
}

#[update]
async fn settle_quote(
    quote_id: String,
    payment_proof: String,
) -> Result<Settlement, BridgeError> {
    sweep();
    let caller = ensure_identified()?;
    settlement::settle_with_proof(caller, quote_id, payment_proof).await
}

/// Combined flow: quote, capture the caller's ICP payment through their
/// ICRC-2 allowance, and drive the settlement inline.
#[update]
async fn bridge_assets(
    amount_wei: u64,
    destination_address: String,
    destination_chain: String,
) -> Result<Settlement, BridgeError> {
    sweep();
    let caller = ensure_identified()?;
    let (_, settlement) =
        settlement::paid_flow(caller, amount_wei, destination_address, destination_chain).await?;
    Ok(settlement)
}

/// Same flow as `bridge_assets`, returning the source-side payment record.
#[update]
async fn create_icp_payment(
    amount_wei: u64,
    destination_address: String,
    destination_chain: String,
) -> Result<UserTransaction, BridgeError> {
    sweep();
    let caller = ensure_identified()?;
    let (user_tx, _) =
        settlement::paid_flow(caller, amount_wei, destination_address, destination_chain).await?;
    Ok(user_tx)
}

// --- lookups ---

#[query]
fn get_quote(quote_id: String) -> Option<Quote> {
    storage::get_quote(&quote_id)
}

#[query]
fn get_settlement(settlement_id: String) -> Option<Settlement> {
    storage::get_settlement(&settlement_id)
}

#[query]
fn get_settlement_by_quote(quote_id: String) -> Option<Settlement> {
    storage::settlement_by_quote(&quote_id)
}

#[query]
fn get_user_quotes() -> Vec<Quote> {
    storage::quotes_by_user(caller())
}

#[query]
fn get_user_settlements() -> Vec<Settlement> {
    storage::settlements_by_user(caller())
}

#[query]
fn get_user_transactions() -> Vec<UserTransaction> {
    storage::user_transactions_by_user(caller())
}

// --- status and statistics ---

/// Whether the bridge can sponsor a delivery right now, and what it would
/// cost. This is a preview: stale prices and fallback gas are acceptable.
#[update]
async fn get_sponsorship_status(
    amount_wei: u64,
    destination_chain: String,
) -> Result<SponsorshipStatus, BridgeError> {
    sweep();
    let config = storage::get_config();
    let chain = config.chain(&destination_chain)?.clone();

    let estimate = match gas::estimate(&chain, &config).await {
        Ok(estimate) => estimate,
        Err(_) => gas::fallback_estimate(now_sec()),
    };
    price::refresh().await;
    let status = price::feed_status();

    let gas_budget = estimate.gas_budget();
    let total_wei = amount_wei.saturating_add(gas_budget);
    let estimated_cost_icp = match (status.icp, status.eth) {
        (Some(icp), Some(eth)) => quote::price_quote(
            amount_wei,
            &estimate,
            icp.price_usd,
            eth.price_usd,
            config.safety_margin_percent,
        )
        .map(|priced| priced.total_cost_e8s)
        .unwrap_or(0),
        _ => 0,
    };

    let now = now_sec();
    let (health, can_lock, accepting) = storage::with_reserve(|r| {
        (
            r.health(),
            r.available() >= total_wei && r.daily_remaining_at(now) >= total_wei,
            r.accepting_quotes(),
        )
    });
    let can_sponsor = accepting
        && can_lock
        && amount_wei >= config.min_quote_amount
        && amount_wei <= config.max_quote_amount;

    Ok(SponsorshipStatus {
        can_sponsor,
        estimated_cost_eth: total_wei,
        estimated_cost_icp,
        gas_coverage: if can_lock {
            "Covered".to_string()
        } else {
            "Needs top-up".to_string()
        },
        reserve_health: health.to_string(),
    })
}

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct DetailedReserveStatus {
    pub balance: u64,
    pub locked: u64,
    pub available: u64,
    pub threshold_warning: u64,
    pub threshold_critical: u64,
    pub daily_limit: u64,
    pub daily_used: u64,
    pub daily_remaining: u64,
    pub paused: bool,
    pub health: String,
    pub last_topup: u64,
    pub total_deposited: u64,
    pub total_committed: u64,
}

#[query]
fn get_detailed_reserve_status() -> DetailedReserveStatus {
    storage::with_reserve(|r| DetailedReserveStatus {
        balance: r.balance,
        locked: r.locked,
        available: r.available(),
        threshold_warning: r.threshold_warning,
        threshold_critical: r.threshold_critical,
        daily_limit: r.daily_limit,
        daily_used: r.daily_used,
        daily_remaining: r.daily_remaining(),
        paused: r.paused,
        health: r.health().to_string(),
        last_topup: r.last_topup,
        total_deposited: r.total_deposited,
        total_committed: r.total_committed,
    })
}

#[query]
fn get_bridge_statistics() -> BridgeStatistics {
    storage::with_reserve(|r| BridgeStatistics {
        total_quotes: storage::quote_count(),
        total_settlements: storage::settlement_count(),
        completed_settlements: storage::completed_settlement_count(),
        total_user_transactions: storage::user_transaction_count(),
        reserve_balance: r.balance,
        reserve_locked: r.locked,
        reserve_health: r.health().to_string(),
        daily_used: r.daily_used,
        daily_limit: r.daily_limit,
    })
}

#[query]
fn get_price_feed_status() -> PriceFeedStatus {
    price::feed_status()
}

#[query]
fn get_config() -> BridgeConfig {
    storage::get_config()
}

#[query]
fn health_check() -> String {
    storage::with_reserve(|r| {
        format!(
            "bridge ok: reserve {} wei available ({}), {} quotes, {} settlements",
            r.available(),
            r.health(),
            storage::quote_count(),
            storage::settlement_count(),
        )
    })
}

/// The bridge's threshold-ECDSA address on the destination chains.
#[update]
async fn get_bridge_address() -> Result<String, BridgeError> {
    let address = signer::ethereum_address().await?;
    Ok(types::format_evm_address(&address))
}

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct OnchainStatus {
    pub chain_id: u64,
    pub block_number: u64,
    pub gas_price: u64,
    pub bridge_address: String,
    /// Wei actually sitting at the bridge address; reconcile against the
    /// internal reserve balance.
    pub bridge_balance: String,
}

/// Live view of the destination chain, for reconciling the internal reserve
/// against what the chain reports.
#[update]
async fn get_onchain_status(destination_chain: String) -> Result<OnchainStatus, BridgeError> {
    let config = storage::get_config();
    let chain = config.chain(&destination_chain)?.clone();

    let chain_id = rpc::chain_id(&chain).await?;
    let block_number = rpc::block_number(&chain).await?;
    let gas_price = rpc::gas_price(&chain).await?;
    let address = signer::ethereum_address().await?;
    let bridge_address = types::format_evm_address(&address);
    let bridge_balance = rpc::get_balance(&chain, &bridge_address).await?;

    Ok(OnchainStatus {
        chain_id,
        block_number,
        gas_price,
        bridge_address,
        bridge_balance: bridge_balance.to_string(),
    })
}

#[query]
fn get_audit_log(limit: u32) -> Vec<AuditEntry> {
    storage::audit_tail(limit as usize)
}

#[query]
fn get_admins() -> Vec<Principal> {
    storage::get_admins()
}

// --- admin ---

#[update]
fn add_admin(principal: Principal) -> Result<String, BridgeError> {
    let admin = ensure_admin()?;
    storage::add_admin(principal);
    storage::audit(
        now_sec(),
        AuditEvent {
            event_type: "admin_added",
            actor: None,
            admin: Some(admin),
            amount: None,
            tx_hash: None,
            details: format!("admin {} added", principal),
        },
    );
    Ok(format!("admin {} added", principal))
}

#[update]
fn admin_add_reserve_funds(amount_wei: u64) -> Result<String, BridgeError> {
    let admin = ensure_admin()?;
    let now = now_sec();
    storage::mutate_reserve(|r| r.topup(amount_wei, now));
    storage::audit(
        now,
        AuditEvent {
            event_type: "reserve_topup",
            actor: None,
            admin: Some(admin),
            amount: Some(amount_wei),
            tx_hash: None,
            details: format!("reserve topped up by {} wei", amount_wei),
        },
    );
    Ok(format!("reserve credited with {} wei", amount_wei))
}

#[update]
fn admin_set_daily_limit(limit_wei: u64) -> Result<String, BridgeError> {
    let admin = ensure_admin()?;
    let now = now_sec();
    storage::mutate_reserve(|r| {
        r.roll_day(now);
        r.set_daily_limit(limit_wei);
    });
    storage::audit(
        now,
        AuditEvent {
            event_type: "daily_limit_changed",
            actor: None,
            admin: Some(admin),
            amount: Some(limit_wei),
            tx_hash: None,
            details: format!("daily limit set to {} wei", limit_wei),
        },
    );
    Ok(format!("daily limit set to {} wei", limit_wei))
}

#[update]
fn admin_set_reserve_thresholds(
    warning_wei: u64,
    critical_wei: u64,
) -> Result<String, BridgeError> {
    let admin = ensure_admin()?;
    let now = now_sec();
    storage::mutate_reserve(|r| r.set_thresholds(warning_wei, critical_wei))?;
    storage::audit(
        now,
        AuditEvent {
            event_type: "thresholds_changed",
            actor: None,
            admin: Some(admin),
            amount: None,
            tx_hash: None,
            details: format!(
                "thresholds set to warning {} / critical {} wei",
                warning_wei, critical_wei
            ),
        },
    );
    Ok("thresholds updated".to_string())
}

#[update]
fn admin_emergency_pause() -> Result<String, BridgeError> {
    let admin = ensure_admin()?;
    storage::mutate_reserve(|r| r.paused = true);
    storage::audit(
        now_sec(),
        AuditEvent {
            event_type: "emergency_pause",
            actor: None,
            admin: Some(admin),
            amount: None,
            tx_hash: None,
            details: "bridge paused".to_string(),
        },
    );
    Ok("bridge paused".to_string())
}

#[update]
fn admin_emergency_unpause() -> Result<String, BridgeError> {
    let admin = ensure_admin()?;
    storage::mutate_reserve(|r| r.paused = false);
    storage::audit(
        now_sec(),
        AuditEvent {
            event_type: "emergency_unpause",
            actor: None,
            admin: Some(admin),
            amount: None,
            tx_hash: None,
            details: "bridge unpaused".to_string(),
        },
    );
    Ok("bridge unpaused".to_string())
}

#[update]
fn update_config(new_config: BridgeConfig) -> Result<String, BridgeError> {
    let admin = ensure_admin()?;
    new_config.validate()?;
    storage::set_config(new_config);
    storage::audit(
        now_sec(),
        AuditEvent {
            event_type: "config_updated",
            actor: None,
            admin: Some(admin),
            amount: None,
            tx_hash: None,
            details: "bridge configuration replaced".to_string(),
        },
    );
    Ok("configuration updated".to_string())
}

// --- cache maintenance ---

#[update]
fn clear_rpc_cache() -> Result<String, BridgeError> {
    ensure_admin()?;
    let config = storage::get_config();
    let (mut hits, mut misses) = (0, 0);
    for chain in &config.supported_chains {
        let (h, m) = rpc::clear_cache(chain);
        hits += h;
        misses += m;
    }
    storage::record_cache_flush(hits, misses, now_sec());
    gas::invalidate_cached_estimate();
    Ok("rpc caches cleared".to_string())
}

#[update]
fn invalidate_gas_cache() -> Result<String, BridgeError> {
    ensure_admin()?;
    let config = storage::get_config();
    for chain in &config.supported_chains {
        rpc::invalidate_gas_cache(chain);
    }
    gas::invalidate_cached_estimate();
    Ok("gas caches invalidated".to_string())
}

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct RpcCacheStatsView {
    pub chains: Vec<RpcStats>,
    pub lifetime: storage::RpcCacheMeta,
}

#[query]
fn get_rpc_cache_stats() -> RpcCacheStatsView {
    let config = storage::get_config();
    RpcCacheStatsView {
        chains: config.supported_chains.iter().map(rpc::stats).collect(),
        lifetime: storage::get_rpc_cache_meta(),
    }
}

ic_cdk::export_candid!();
