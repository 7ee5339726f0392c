//! Stable persistence and the append-only audit log. Every record the engine
//! owns lives in one of the maps below and survives canister upgrades; heap
//! state (rpc health, caches) is rebuilt on demand.

use std::borrow::Cow;
use std::cell::RefCell;

use candid::{CandidType, Decode, Encode, Principal};
use ic_stable_structures::memory_manager::{MemoryId, MemoryManager, VirtualMemory};
use ic_stable_structures::storable::Bound;
use ic_stable_structures::{DefaultMemoryImpl, StableBTreeMap, StableCell, Storable};
use serde::Deserialize;

use crate::config::BridgeConfig;
use crate::reserve::ReserveState;
use crate::types::{AuditEntry, IcpPayment, Quote, Settlement, UserTransaction};

type Memory = VirtualMemory<DefaultMemoryImpl>;

const QUOTES_MEMORY_ID: MemoryId = MemoryId::new(0);
const SETTLEMENTS_MEMORY_ID: MemoryId = MemoryId::new(1);
const USER_TRANSACTIONS_MEMORY_ID: MemoryId = MemoryId::new(2);
const PAYMENTS_MEMORY_ID: MemoryId = MemoryId::new(3);
const USED_PROOFS_MEMORY_ID: MemoryId = MemoryId::new(4);
const AUDIT_LOG_MEMORY_ID: MemoryId = MemoryId::new(5);
const RESERVE_MEMORY_ID: MemoryId = MemoryId::new(6);
const CONFIG_MEMORY_ID: MemoryId = MemoryId::new(7);
const ADMINS_MEMORY_ID: MemoryId = MemoryId::new(8);
const SCHEMA_MEMORY_ID: MemoryId = MemoryId::new(9);
const COUNTERS_MEMORY_ID: MemoryId = MemoryId::new(10);
const RPC_CACHE_META_MEMORY_ID: MemoryId = MemoryId::new(11);

pub const SCHEMA_VERSION: u64 = 1;

#[derive(Clone, Debug, Default, CandidType, Deserialize)]
pub struct AdminList {
    pub admins: Vec<Principal>,
}

/// Monotonic counters that must survive upgrades: audit ids, the ULID
/// sequence, and the per-chain transaction nonce the engine has issued.
#[derive(Clone, Debug, Default, CandidType, Deserialize)]
pub struct Counters {
    pub next_audit_id: u64,
    pub ulid_seq: u64,
    pub next_nonce: Vec<(u64, u64)>,
}

/// Lifetime RPC cache accounting. The cache itself is heap-only and dies
/// with the process; these counters roll up across flushes and upgrades.
#[derive(Clone, Debug, Default, CandidType, Deserialize, serde::Serialize)]
pub struct RpcCacheMeta {
    pub lifetime_hits: u64,
    pub lifetime_misses: u64,
    pub last_cleared_at: u64,
}

macro_rules! impl_storable {
    ($($ty:ty),+ $(,)?) => {
        $(impl Storable for $ty {
            fn to_bytes(&self) -> Cow<[u8]> {
                Cow::Owned(Encode!(self).expect("candid encoding"))
            }

            fn from_bytes(bytes: Cow<[u8]>) -> Self {
                Decode!(bytes.as_ref(), Self).expect("candid decoding")
            }

            const BOUND: Bound = Bound::Unbounded;
        })+
    };
}

impl_storable!(
    Quote,
    Settlement,
    UserTransaction,
    IcpPayment,
    AuditEntry,
    ReserveState,
    BridgeConfig,
    AdminList,
    Counters,
    RpcCacheMeta,
);

thread_local! {
    static MEMORY_MANAGER: RefCell<MemoryManager<DefaultMemoryImpl>> =
        RefCell::new(MemoryManager::init(DefaultMemoryImpl::default()));

    static QUOTES: RefCell<StableBTreeMap<String, Quote, Memory>> = RefCell::new(
        StableBTreeMap::init(MEMORY_MANAGER.with(|m| m.borrow().get(QUOTES_MEMORY_ID)))
    );

    static SETTLEMENTS: RefCell<StableBTreeMap<String, Settlement, Memory>> = RefCell::new(
        StableBTreeMap::init(MEMORY_MANAGER.with(|m| m.borrow().get(SETTLEMENTS_MEMORY_ID)))
    );

    static USER_TRANSACTIONS: RefCell<StableBTreeMap<String, UserTransaction, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(USER_TRANSACTIONS_MEMORY_ID)),
        ));

    static PAYMENTS: RefCell<StableBTreeMap<String, IcpPayment, Memory>> = RefCell::new(
        StableBTreeMap::init(MEMORY_MANAGER.with(|m| m.borrow().get(PAYMENTS_MEMORY_ID)))
    );

    // payment proof -> settlement id that consumed it
    static USED_PROOFS: RefCell<StableBTreeMap<String, String, Memory>> = RefCell::new(
        StableBTreeMap::init(MEMORY_MANAGER.with(|m| m.borrow().get(USED_PROOFS_MEMORY_ID)))
    );

    static AUDIT_LOG: RefCell<StableBTreeMap<u64, AuditEntry, Memory>> = RefCell::new(
        StableBTreeMap::init(MEMORY_MANAGER.with(|m| m.borrow().get(AUDIT_LOG_MEMORY_ID)))
    );

    static RESERVE: RefCell<StableCell<ReserveState, Memory>> = RefCell::new(
        StableCell::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(RESERVE_MEMORY_ID)),
            ReserveState::default(),
        )
        .expect("reserve cell")
    );

    static CONFIG: RefCell<StableCell<BridgeConfig, Memory>> = RefCell::new(
        StableCell::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(CONFIG_MEMORY_ID)),
            BridgeConfig::default(),
        )
        .expect("config cell")
    );

    static ADMINS: RefCell<StableCell<AdminList, Memory>> = RefCell::new(
        StableCell::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(ADMINS_MEMORY_ID)),
            AdminList::default(),
        )
        .expect("admin cell")
    );

    static SCHEMA: RefCell<StableCell<u64, Memory>> = RefCell::new(
        StableCell::init(MEMORY_MANAGER.with(|m| m.borrow().get(SCHEMA_MEMORY_ID)), 0)
            .expect("schema cell")
    );

    static COUNTERS: RefCell<StableCell<Counters, Memory>> = RefCell::new(
        StableCell::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(COUNTERS_MEMORY_ID)),
            Counters::default(),
        )
        .expect("counters cell")
    );

    static RPC_CACHE_META: RefCell<StableCell<RpcCacheMeta, Memory>> = RefCell::new(
        StableCell::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(RPC_CACHE_META_MEMORY_ID)),
            RpcCacheMeta::default(),
        )
        .expect("rpc cache meta cell")
    );
}

// --- quotes ---

pub fn insert_quote(quote: Quote) {
    QUOTES.with(|map| {
        map.borrow_mut().insert(quote.id.clone(), quote);
    });
}

pub fn get_quote(quote_id: &str) -> Option<Quote> {
    QUOTES.with(|map| map.borrow().get(&quote_id.to_string()))
}

pub fn update_quote<F>(quote_id: &str, f: F) -> Option<Quote>
where
    F: FnOnce(&mut Quote),
{
    QUOTES.with(|map| {
        let mut map = map.borrow_mut();
        let mut quote = map.get(&quote_id.to_string())?;
        f(&mut quote);
        map.insert(quote.id.clone(), quote.clone());
        Some(quote)
    })
}

pub fn quotes_by_user(user: Principal) -> Vec<Quote> {
    QUOTES.with(|map| {
        map.borrow()
            .iter()
            .map(|(_, quote)| quote)
            .filter(|quote| quote.user == user)
            .collect()
    })
}

/// Ids of quotes still marked Active; the expiry sweep walks these.
pub fn active_quote_ids() -> Vec<String> {
    QUOTES.with(|map| {
        map.borrow()
            .iter()
            .filter(|(_, quote)| quote.status == crate::types::QuoteStatus::Active)
            .map(|(id, _)| id)
            .collect()
    })
}

pub fn quote_count() -> u64 {
    QUOTES.with(|map| map.borrow().len())
}

// --- settlements ---

pub fn insert_settlement(settlement: Settlement) {
    SETTLEMENTS.with(|map| {
        map.borrow_mut().insert(settlement.id.clone(), settlement);
    });
}

pub fn get_settlement(settlement_id: &str) -> Option<Settlement> {
    SETTLEMENTS.with(|map| map.borrow().get(&settlement_id.to_string()))
}

pub fn update_settlement<F>(settlement_id: &str, f: F) -> Option<Settlement>
where
    F: FnOnce(&mut Settlement),
{
    SETTLEMENTS.with(|map| {
        let mut map = map.borrow_mut();
        let mut settlement = map.get(&settlement_id.to_string())?;
        f(&mut settlement);
        map.insert(settlement.id.clone(), settlement.clone());
        Some(settlement)
    })
}

pub fn settlements_by_user(user: Principal) -> Vec<Settlement> {
    SETTLEMENTS.with(|map| {
        map.borrow()
            .iter()
            .map(|(_, settlement)| settlement)
            .filter(|settlement| settlement.user == user)
            .collect()
    })
}

/// The settlement tied to a quote, ignoring Failed attempts. At most one
/// such record exists per quote.
pub fn settlement_by_quote(quote_id: &str) -> Option<Settlement> {
    SETTLEMENTS.with(|map| {
        map.borrow()
            .iter()
            .map(|(_, settlement)| settlement)
            .find(|settlement| {
                settlement.quote_id == quote_id
                    && settlement.status != crate::types::SettlementStatus::Failed
            })
    })
}

pub fn settlement_count() -> u64 {
    SETTLEMENTS.with(|map| map.borrow().len())
}

pub fn completed_settlement_count() -> u64 {
    SETTLEMENTS.with(|map| {
        map.borrow()
            .iter()
            .filter(|(_, s)| s.status == crate::types::SettlementStatus::Completed)
            .count() as u64
    })
}

// --- payment proofs ---

pub fn proof_consumer(proof: &str) -> Option<String> {
    USED_PROOFS.with(|map| map.borrow().get(&proof.to_string()))
}

pub fn consume_proof(proof: &str, settlement_id: &str) {
    USED_PROOFS.with(|map| {
        map.borrow_mut()
            .insert(proof.to_string(), settlement_id.to_string());
    });
}

pub fn release_proof(proof: &str) {
    USED_PROOFS.with(|map| {
        map.borrow_mut().remove(&proof.to_string());
    });
}

// --- user transactions & captured payments ---

pub fn insert_user_transaction(tx: UserTransaction) {
    USER_TRANSACTIONS.with(|map| {
        map.borrow_mut().insert(tx.id.clone(), tx);
    });
}

pub fn update_user_transaction<F>(id: &str, f: F) -> Option<UserTransaction>
where
    F: FnOnce(&mut UserTransaction),
{
    USER_TRANSACTIONS.with(|map| {
        let mut map = map.borrow_mut();
        let mut tx = map.get(&id.to_string())?;
        f(&mut tx);
        map.insert(tx.id.clone(), tx.clone());
        Some(tx)
    })
}

pub fn user_transactions_by_user(user: Principal) -> Vec<UserTransaction> {
    USER_TRANSACTIONS.with(|map| {
        map.borrow()
            .iter()
            .map(|(_, tx)| tx)
            .filter(|tx| tx.user == user)
            .collect()
    })
}

pub fn user_transaction_by_payment(payment_id: &str) -> Option<UserTransaction> {
    USER_TRANSACTIONS.with(|map| {
        map.borrow()
            .iter()
            .map(|(_, tx)| tx)
            .find(|tx| tx.icp_payment_id == payment_id)
    })
}

pub fn user_transaction_count() -> u64 {
    USER_TRANSACTIONS.with(|map| map.borrow().len())
}

pub fn insert_payment(payment: IcpPayment) {
    PAYMENTS.with(|map| {
        map.borrow_mut().insert(payment.payment_id.clone(), payment);
    });
}

pub fn get_payment(payment_id: &str) -> Option<IcpPayment> {
    PAYMENTS.with(|map| map.borrow().get(&payment_id.to_string()))
}

// --- reserve / config / admins ---

pub fn with_reserve<T>(f: impl FnOnce(&ReserveState) -> T) -> T {
    RESERVE.with(|cell| f(cell.borrow().get()))
}

/// The single critical section every reserve mutation funnels through.
pub fn mutate_reserve<T>(f: impl FnOnce(&mut ReserveState) -> T) -> T {
    RESERVE.with(|cell| {
        let mut cell = cell.borrow_mut();
        let mut state = cell.get().clone();
        let out = f(&mut state);
        cell.set(state).expect("reserve write");
        out
    })
}

pub fn get_config() -> BridgeConfig {
    CONFIG.with(|cell| cell.borrow().get().clone())
}

pub fn set_config(config: BridgeConfig) {
    CONFIG.with(|cell| {
        cell.borrow_mut().set(config).expect("config write");
    });
}

pub fn get_admins() -> Vec<Principal> {
    ADMINS.with(|cell| cell.borrow().get().admins.clone())
}

pub fn is_admin(principal: &Principal) -> bool {
    ADMINS.with(|cell| cell.borrow().get().admins.contains(principal))
}

pub fn add_admin(principal: Principal) {
    ADMINS.with(|cell| {
        let mut list = cell.borrow().get().clone();
        if !list.admins.contains(&principal) {
            list.admins.push(principal);
            cell.borrow_mut().set(list).expect("admin write");
        }
    });
}

// --- counters ---

fn mutate_counters<T>(f: impl FnOnce(&mut Counters) -> T) -> T {
    COUNTERS.with(|cell| {
        let mut cell = cell.borrow_mut();
        let mut counters = cell.get().clone();
        let out = f(&mut counters);
        cell.set(counters).expect("counters write");
        out
    })
}

pub fn next_ulid_seq() -> u64 {
    mutate_counters(|c| {
        let seq = c.ulid_seq;
        c.ulid_seq += 1;
        seq
    })
}

/// Reconcile the chain-observed nonce with the engine's own issue counter
/// and reserve the slot. Two in-flight settlements never share a nonce.
pub fn reserve_nonce(chain_id: u64, observed: u64) -> u64 {
    mutate_counters(|c| {
        let entry = c.next_nonce.iter_mut().find(|(id, _)| *id == chain_id);
        match entry {
            Some((_, next)) => {
                let nonce = observed.max(*next);
                *next = nonce + 1;
                nonce
            }
            None => {
                c.next_nonce.push((chain_id, observed + 1));
                observed
            }
        }
    })
}

/// Drop the local counter back after an on-chain rejection told us the
/// observed nonce moved (settlement refetches and re-reserves).
pub fn reset_nonce(chain_id: u64) {
    mutate_counters(|c| {
        c.next_nonce.retain(|(id, _)| *id != chain_id);
    });
}

pub fn get_rpc_cache_meta() -> RpcCacheMeta {
    RPC_CACHE_META.with(|cell| cell.borrow().get().clone())
}

/// Roll the current runtime counters into the lifetime totals, typically on
/// a cache flush.
pub fn record_cache_flush(hits: u64, misses: u64, now_sec: u64) {
    RPC_CACHE_META.with(|cell| {
        let mut meta = cell.borrow().get().clone();
        meta.lifetime_hits += hits;
        meta.lifetime_misses += misses;
        meta.last_cleared_at = now_sec;
        cell.borrow_mut().set(meta).expect("rpc cache meta write");
    });
}

// --- audit log ---

pub struct AuditEvent<'a> {
    pub event_type: &'a str,
    pub actor: Option<Principal>,
    pub admin: Option<Principal>,
    pub amount: Option<u64>,
    pub tx_hash: Option<String>,
    pub details: String,
}

pub fn audit(now_sec: u64, event: AuditEvent<'_>) {
    let id = mutate_counters(|c| {
        let id = c.next_audit_id;
        c.next_audit_id += 1;
        id
    });
    let entry = AuditEntry {
        id,
        timestamp: now_sec,
        event_type: event.event_type.to_string(),
        actor: event.actor,
        admin: event.admin,
        amount: event.amount,
        tx_hash: event.tx_hash,
        details: event.details,
    };
    AUDIT_LOG.with(|map| {
        map.borrow_mut().insert(id, entry);
    });
}

pub fn audit_tail(limit: usize) -> Vec<AuditEntry> {
    AUDIT_LOG.with(|map| {
        let map = map.borrow();
        let mut entries: Vec<AuditEntry> =
            map.iter().rev().take(limit.max(1)).map(|(_, e)| e).collect();
        entries.reverse();
        entries
    })
}

// --- schema / migration ---

/// Versioned layout. Runs on init and post-upgrade; each step upgrades one
/// version. Version 0 means a fresh install.
pub fn run_migrations() {
    let stored = SCHEMA.with(|cell| *cell.borrow().get());
    if stored >= SCHEMA_VERSION {
        return;
    }
    // Future layout changes slot in here, one `if stored < N` block each.
    SCHEMA.with(|cell| {
        cell.borrow_mut().set(SCHEMA_VERSION).expect("schema write");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_reservation_is_monotonic_per_chain() {
        reset_nonce(999_001);
        assert_eq!(reserve_nonce(999_001, 5), 5);
        assert_eq!(reserve_nonce(999_001, 5), 6);
        // Chain reports ahead of us after an external transaction.
        assert_eq!(reserve_nonce(999_001, 10), 10);
        assert_eq!(reserve_nonce(999_001, 3), 11);
        reset_nonce(999_001);
        assert_eq!(reserve_nonce(999_001, 3), 3);
    }

    #[test]
    fn audit_ids_are_sequential() {
        let before = mutate_counters(|c| c.next_audit_id);
        audit(
            100,
            AuditEvent {
                event_type: "test_event",
                actor: None,
                admin: None,
                amount: Some(1),
                tx_hash: None,
                details: "first".to_string(),
            },
        );
        audit(
            101,
            AuditEvent {
                event_type: "test_event",
                actor: None,
                admin: None,
                amount: Some(2),
                tx_hash: None,
                details: "second".to_string(),
            },
        );
        let tail = audit_tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].id, tail[0].id + 1);
        assert!(tail[0].id >= before);
    }

    #[test]
    fn used_proofs_round_trip() {
        consume_proof("proof-123", "settlement-1");
        assert_eq!(proof_consumer("proof-123"), Some("settlement-1".to_string()));
        release_proof("proof-123");
        assert_eq!(proof_consumer("proof-123"), None);
    }
}
