use candid::{CandidType, Principal};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub enum QuoteStatus {
    Active,
    Settled,
    Expired,
    Failed,
}

/// A time-bound promise to deliver `amount_out` wei for `total_cost` e8s.
/// While Active the reserve holds `amount_out + gas_budget()` locked.
#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct Quote {
    pub id: String,
    pub user: Principal,
    /// Wei the recipient receives; equals `amount_out` by construction.
    pub amount_requested: u64,
    pub amount_out: u64,
    /// Gas units budgeted for the delivery transaction.
    pub gas_estimate: u64,
    pub base_fee: u64,
    pub priority_fee: u64,
    pub max_fee_per_gas: u64,
    /// Wei buffer on top of delivery + gas budget, folded into `total_cost`.
    pub safety_margin: u64,
    /// What the user pays on the source side, in ledger e8s.
    pub total_cost: u64,
    pub destination_address: String,
    pub source_chain: String,
    pub destination_chain: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub status: QuoteStatus,
}

impl Quote {
    pub fn gas_budget(&self) -> u64 {
        self.max_fee_per_gas.saturating_mul(self.gas_estimate)
    }

    /// Wei the reserve must hold while this quote is Active.
    pub fn reserved_amount(&self) -> u64 {
        self.amount_out.saturating_add(self.gas_budget())
    }

    pub fn is_expired(&self, now_sec: u64) -> bool {
        now_sec >= self.expires_at
    }

    pub fn is_active(&self, now_sec: u64) -> bool {
        self.status == QuoteStatus::Active && !self.is_expired(now_sec)
    }
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub enum SettlementStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

/// State-machine record for one on-chain delivery attempt.
#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct Settlement {
    pub id: String,
    pub quote_id: String,
    pub user: Principal,
    pub amount: u64,
    pub destination_address: String,
    pub destination_chain: String,
    pub payment_proof: String,
    pub created_at: u64,
    pub status: SettlementStatus,
    pub gas_used: Option<u64>,
    pub transaction_hash: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl Settlement {
    pub fn new(id: String, quote: &Quote, payment_proof: String, now_sec: u64) -> Self {
        Settlement {
            id,
            quote_id: quote.id.clone(),
            user: quote.user,
            amount: quote.amount_out,
            destination_address: quote.destination_address.clone(),
            destination_chain: quote.destination_chain.clone(),
            payment_proof,
            created_at: now_sec,
            status: SettlementStatus::Pending,
            gas_used: None,
            transaction_hash: None,
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn mark_executing(&mut self) {
        self.status = SettlementStatus::Executing;
    }

    pub fn mark_completed(&mut self, gas_used: u64, transaction_hash: String) {
        self.status = SettlementStatus::Completed;
        self.gas_used = Some(gas_used);
        self.transaction_hash = Some(transaction_hash);
    }

    pub fn mark_failed(&mut self, reason: String) {
        self.status = SettlementStatus::Failed;
        self.last_error = Some(reason);
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            SettlementStatus::Completed | SettlementStatus::Failed
        )
    }
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
}

/// Source-side paid flow: links a ledger payment to a destination settlement.
#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct UserTransaction {
    pub id: String,
    pub user: Principal,
    pub icp_payment_id: String,
    pub amount_icp: u64,
    pub amount_eth: u64,
    pub gas_sponsored: u64,
    pub destination_address: String,
    pub destination_chain: String,
    pub status: TransactionStatus,
    pub created_at: u64,
    pub completed_at: Option<u64>,
    pub transaction_hash: Option<String>,
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Captured source-ledger payment. `payment_id` is the ledger block index,
/// which doubles as the settlement payment proof.
#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct IcpPayment {
    pub payment_id: String,
    pub user: Principal,
    pub amount_e8s: u64,
    pub timestamp: u64,
    pub status: PaymentStatus,
}

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct AuditEntry {
    pub id: u64,
    pub timestamp: u64,
    pub event_type: String,
    pub actor: Option<Principal>,
    pub admin: Option<Principal>,
    pub amount: Option<u64>,
    pub tx_hash: Option<String>,
    pub details: String,
}

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct SponsorshipStatus {
    pub can_sponsor: bool,
    pub estimated_cost_eth: u64,
    pub estimated_cost_icp: u64,
    pub gas_coverage: String,
    pub reserve_health: String,
}

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct BridgeStatistics {
    pub total_quotes: u64,
    pub total_settlements: u64,
    pub completed_settlements: u64,
    pub total_user_transactions: u64,
    pub reserve_balance: u64,
    pub reserve_locked: u64,
    pub reserve_health: String,
    pub daily_used: u64,
    pub daily_limit: u64,
}

const ULID_LEN: usize = 26;
const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Monotonic ULID from a millisecond timestamp and a per-process sequence.
/// 48 bits of time, 80 bits of sequence, Crockford base32.
pub fn ulid(now_ms: u64, seq: u128) -> String {
    let value = ((now_ms as u128 & 0xFFFF_FFFF_FFFF) << 80) | (seq & ((1u128 << 80) - 1));
    let mut out = [0u8; ULID_LEN];
    let mut rest = value;
    for slot in out.iter_mut().rev() {
        *slot = CROCKFORD[(rest & 0x1F) as usize];
        rest >>= 5;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Checksum-tolerant EVM address validation: 0x-prefixed 20-byte hex,
/// zero address rejected. Returns the raw bytes.
pub fn parse_evm_address(address: &str) -> BridgeResult<[u8; 20]> {
    let trimmed = address.trim();
    if trimmed.len() != 42 || !trimmed.starts_with("0x") {
        return Err(BridgeError::InvalidAddress {
            value: trimmed.to_string(),
        });
    }
    let bytes = hex::decode(&trimmed[2..]).map_err(|_| BridgeError::InvalidAddress {
        value: trimmed.to_string(),
    })?;
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    if out == [0u8; 20] {
        return Err(BridgeError::InvalidAddress {
            value: trimmed.to_string(),
        });
    }
    Ok(out)
}

pub fn format_evm_address(bytes: &[u8; 20]) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_quote(now: u64) -> Quote {
        Quote {
            id: "q1".to_string(),
            user: Principal::anonymous(),
            amount_requested: 1_000_000_000_000_000_000,
            amount_out: 1_000_000_000_000_000_000,
            gas_estimate: 21_000,
            base_fee: 30_000_000_000,
            priority_fee: 1_000_000_000,
            max_fee_per_gas: 61_000_000_000,
            safety_margin: 0,
            total_cost: 60_076_860_000,
            destination_address: "0x742d35cc6634c0532925a3b844bc9e7595f3ab00".to_string(),
            source_chain: "ICP".to_string(),
            destination_chain: "Base Sepolia".to_string(),
            created_at: now,
            expires_at: now + 900,
            status: QuoteStatus::Active,
        }
    }

    #[test]
    fn quote_reservation_covers_delivery_and_gas() {
        let quote = test_quote(1_000);
        assert_eq!(quote.gas_budget(), 61_000_000_000 * 21_000);
        assert_eq!(
            quote.reserved_amount(),
            1_000_000_000_000_000_000 + 61_000_000_000 * 21_000
        );
    }

    #[test]
    fn quote_expiry_is_inclusive_of_deadline() {
        let quote = test_quote(1_000);
        assert!(quote.is_active(1_899));
        assert!(quote.is_expired(1_900));
        assert!(!quote.is_active(1_900));
    }

    #[test]
    fn settlement_transitions() {
        let quote = test_quote(5);
        let mut settlement = Settlement::new("s1".to_string(), &quote, "77".to_string(), 6);
        assert_eq!(settlement.status, SettlementStatus::Pending);
        settlement.mark_executing();
        assert!(!settlement.is_terminal());
        settlement.mark_completed(21_000, "0xabc".to_string());
        assert!(settlement.is_terminal());
        assert_eq!(settlement.gas_used, Some(21_000));
    }

    #[test]
    fn ulid_is_sortable_and_monotonic() {
        let a = ulid(1_700_000_000_000, 1);
        let b = ulid(1_700_000_000_000, 2);
        let c = ulid(1_700_000_000_001, 0);
        assert_eq!(a.len(), 26);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn evm_address_validation() {
        let ok = parse_evm_address("0x742d35Cc6634C0532925a3b844Bc9e7595f3Ab00").unwrap();
        assert_eq!(ok[0], 0x74);
        assert!(parse_evm_address("742d35cc6634c0532925a3b844bc9e7595f3ab00").is_err());
        assert!(parse_evm_address("0x1234").is_err());
        assert!(parse_evm_address(&format!("0x{}", "00".repeat(20))).is_err());
        assert!(parse_evm_address("0xzz2d35cc6634c0532925a3b844bc9e7595f3ab00").is_err());
    }
}
