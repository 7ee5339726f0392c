//! Source-side payment capture and verification against the ICP ledger.
//! Payments arrive either through `icrc2_transfer_from` (allowance flow) or
//! as a user-submitted ledger block index that we verify with
//! `query_blocks`.

use candid::{CandidType, Nat, Principal};
use num_traits::ToPrimitive;
use serde::Deserialize;
use sha2::{Digest, Sha224};

use crate::error::{BridgeError, BridgeResult};

/// Standard ICP ledger transfer fee.
pub const LEDGER_FEE_E8S: u64 = 10_000;

// --- ICRC-1 / ICRC-2 types ---

#[derive(Clone, Debug, CandidType, Deserialize)]
pub struct Account {
    pub owner: Principal,
    pub subaccount: Option<Vec<u8>>,
}

impl Account {
    pub fn of(owner: Principal) -> Self {
        Account {
            owner,
            subaccount: None,
        }
    }
}

#[derive(Clone, Debug, CandidType, Deserialize)]
pub struct TransferFromArgs {
    pub spender_subaccount: Option<Vec<u8>>,
    pub from: Account,
    pub to: Account,
    pub amount: Nat,
    pub fee: Option<Nat>,
    pub memo: Option<Vec<u8>>,
    pub created_at_time: Option<u64>,
}

#[derive(Clone, Debug, CandidType, Deserialize)]
pub enum TransferFromError {
    BadFee { expected_fee: Nat },
    BadBurn { min_burn_amount: Nat },
    InsufficientFunds { balance: Nat },
    InsufficientAllowance { allowance: Nat },
    TooOld,
    CreatedInFuture { ledger_time: u64 },
    Duplicate { duplicate_of: Nat },
    TemporarilyUnavailable,
    GenericError { error_code: Nat, message: String },
}

// --- legacy ledger block query types ---

#[derive(Clone, Debug, CandidType, Deserialize)]
pub struct GetBlocksArgs {
    pub start: u64,
    pub length: u64,
}

#[derive(Clone, Debug, CandidType, Deserialize)]
pub struct Tokens {
    pub e8s: u64,
}

#[derive(Clone, Debug, CandidType, Deserialize)]
pub struct TimeStamp {
    pub timestamp_nanos: u64,
}

#[derive(Clone, Debug, CandidType, Deserialize)]
pub enum Operation {
    Mint {
        to: Vec<u8>,
        amount: Tokens,
    },
    Burn {
        from: Vec<u8>,
        amount: Tokens,
        spender: Option<Vec<u8>>,
    },
    Transfer {
        from: Vec<u8>,
        to: Vec<u8>,
        amount: Tokens,
        fee: Tokens,
        spender: Option<Vec<u8>>,
    },
    Approve {
        from: Vec<u8>,
        spender: Vec<u8>,
        allowance: Tokens,
        expected_allowance: Option<Tokens>,
        expires_at: Option<TimeStamp>,
        fee: Tokens,
    },
}

#[derive(Clone, Debug, CandidType, Deserialize)]
pub struct Transaction {
    pub memo: u64,
    pub icrc1_memo: Option<Vec<u8>>,
    pub operation: Option<Operation>,
    pub created_at_time: TimeStamp,
}

#[derive(Clone, Debug, CandidType, Deserialize)]
pub struct CandidBlock {
    pub parent_hash: Option<Vec<u8>>,
    pub transaction: Transaction,
    pub timestamp: TimeStamp,
}

#[derive(Clone, Debug, CandidType, Deserialize)]
pub struct QueryBlocksResponse {
    pub chain_length: u64,
    pub certificate: Option<Vec<u8>>,
    pub blocks: Vec<CandidBlock>,
    pub first_block_index: u64,
}

// --- account identifiers ---

/// CRC-32 (IEEE, reflected) without a lookup table; only account ids need it.
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// Legacy ledger account identifier: CRC32 checksum over
/// sha224("\x0Aaccount-id" ‖ principal ‖ subaccount), prepended to the hash.
pub fn account_identifier(owner: &Principal, subaccount: Option<[u8; 32]>) -> [u8; 32] {
    let mut hasher = Sha224::new();
    hasher.update(b"\x0Aaccount-id");
    hasher.update(owner.as_slice());
    hasher.update(subaccount.unwrap_or([0u8; 32]));
    let hash = hasher.finalize();

    let checksum = crc32(&hash).to_be_bytes();
    let mut out = [0u8; 32];
    out[..4].copy_from_slice(&checksum);
    out[4..].copy_from_slice(&hash);
    out
}

/// Check a fetched ledger block against the expected transfer. Pure so the
/// matching rules are testable without a ledger.
pub fn check_transfer_block(
    block: &CandidBlock,
    proof: &str,
    expected_from: &[u8; 32],
    expected_to: &[u8; 32],
    min_amount_e8s: u64,
) -> BridgeResult<u64> {
    match &block.transaction.operation {
        Some(Operation::Transfer {
            from, to, amount, ..
        }) => {
            if to.as_slice() != expected_to.as_slice() {
                return Err(BridgeError::PaymentNotFound {
                    proof: proof.to_string(),
                });
            }
            if from.as_slice() != expected_from.as_slice() {
                return Err(BridgeError::PaymentNotFound {
                    proof: proof.to_string(),
                });
            }
            if amount.e8s < min_amount_e8s {
                return Err(BridgeError::PaymentAmountMismatch {
                    required: min_amount_e8s,
                    actual: amount.e8s,
                });
            }
            Ok(amount.e8s)
        }
        _ => Err(BridgeError::PaymentNotFound {
            proof: proof.to_string(),
        }),
    }
}

fn transfer_from_error_message(error: &TransferFromError) -> String {
    match error {
        TransferFromError::BadFee { expected_fee } => format!("bad fee, expected {}", expected_fee),
        TransferFromError::BadBurn { .. } => "bad burn".to_string(),
        TransferFromError::InsufficientFunds { balance } => {
            format!("insufficient funds, balance {}", balance)
        }
        TransferFromError::InsufficientAllowance { allowance } => {
            format!("insufficient allowance, approved {}", allowance)
        }
        TransferFromError::TooOld => "transfer too old".to_string(),
        TransferFromError::CreatedInFuture { .. } => "created in future".to_string(),
        TransferFromError::Duplicate { duplicate_of } => {
            format!("duplicate of block {}", duplicate_of)
        }
        TransferFromError::TemporarilyUnavailable => "ledger temporarily unavailable".to_string(),
        TransferFromError::GenericError { message, .. } => message.clone(),
    }
}

/// Pull `amount_e8s` from the caller's ledger account into the bridge's
/// collection account. Requires a prior `icrc2_approve` by the caller.
/// Returns the ledger block index, which becomes the payment proof.
pub async fn collect_payment(
    ledger: Principal,
    from: Principal,
    amount_e8s: u64,
) -> BridgeResult<u64> {
    let args = TransferFromArgs {
        spender_subaccount: None,
        from: Account::of(from),
        to: Account::of(ic_cdk::id()),
        amount: Nat::from(amount_e8s),
        fee: Some(Nat::from(LEDGER_FEE_E8S)),
        memo: None,
        created_at_time: Some(ic_cdk::api::time()),
    };

    let (result,): (Result<Nat, TransferFromError>,) =
        ic_cdk::call(ledger, "icrc2_transfer_from", (args,))
            .await
            .map_err(|(code, message)| BridgeError::LedgerTransfer {
                message: format!("transfer_from rejected ({:?}): {}", code, message),
            })?;

    let block = result.map_err(|e| BridgeError::LedgerTransfer {
        message: transfer_from_error_message(&e),
    })?;
    block.0.to_u64().ok_or(BridgeError::LedgerTransfer {
        message: "ledger block index out of range".to_string(),
    })
}

/// Verify a user-submitted payment proof (ledger block index) against the
/// ledger: a finalised transfer of at least `min_amount_e8s` from `payer` to
/// the bridge's collection account.
pub async fn verify_transfer(
    ledger: Principal,
    proof: &str,
    payer: Principal,
    min_amount_e8s: u64,
) -> BridgeResult<u64> {
    let block_index: u64 = proof.parse().map_err(|_| BridgeError::PaymentNotFound {
        proof: proof.to_string(),
    })?;

    let args = GetBlocksArgs {
        start: block_index,
        length: 1,
    };
    let (response,): (QueryBlocksResponse,) = ic_cdk::call(ledger, "query_blocks", (args,))
        .await
        .map_err(|(code, message)| BridgeError::LedgerTransfer {
            message: format!("query_blocks rejected ({:?}): {}", code, message),
        })?;

    if block_index >= response.chain_length {
        return Err(BridgeError::PaymentNotFinal {
            proof: proof.to_string(),
        });
    }
    let offset = block_index.checked_sub(response.first_block_index);
    let block = offset
        .and_then(|i| response.blocks.get(i as usize))
        .ok_or(BridgeError::PaymentNotFound {
            proof: proof.to_string(),
        })?;

    let expected_from = account_identifier(&payer, None);
    let expected_to = account_identifier(&ic_cdk::id(), None);
    check_transfer_block(block, proof, &expected_from, &expected_to, min_amount_e8s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_with(operation: Option<Operation>) -> CandidBlock {
        CandidBlock {
            parent_hash: None,
            transaction: Transaction {
                memo: 0,
                icrc1_memo: None,
                operation,
                created_at_time: TimeStamp { timestamp_nanos: 0 },
            },
            timestamp: TimeStamp { timestamp_nanos: 0 },
        }
    }

    #[test]
    fn crc32_check_value() {
        // Standard CRC-32 check input.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn account_identifier_embeds_its_checksum() {
        let id = account_identifier(&Principal::anonymous(), None);
        assert_eq!(id[..4], crc32(&id[4..]).to_be_bytes());
        // Subaccounts produce distinct identifiers.
        let sub = account_identifier(&Principal::anonymous(), Some([1u8; 32]));
        assert_ne!(id, sub);
    }

    #[test]
    fn transfer_block_matching() {
        let from = account_identifier(&Principal::anonymous(), None);
        let to = account_identifier(&Principal::management_canister(), None);
        let block = block_with(Some(Operation::Transfer {
            from: from.to_vec(),
            to: to.to_vec(),
            amount: Tokens { e8s: 500 },
            fee: Tokens { e8s: 10_000 },
            spender: None,
        }));

        assert_eq!(check_transfer_block(&block, "9", &from, &to, 500).unwrap(), 500);
        assert!(matches!(
            check_transfer_block(&block, "9", &from, &to, 501),
            Err(BridgeError::PaymentAmountMismatch {
                required: 501,
                actual: 500
            })
        ));
        // Wrong direction: recipient is not the bridge account.
        assert!(matches!(
            check_transfer_block(&block, "9", &from, &from, 500),
            Err(BridgeError::PaymentNotFound { .. })
        ));
    }

    #[test]
    fn non_transfer_blocks_are_rejected() {
        let from = account_identifier(&Principal::anonymous(), None);
        let to = account_identifier(&Principal::management_canister(), None);
        let mint = block_with(Some(Operation::Mint {
            to: to.to_vec(),
            amount: Tokens { e8s: 500 },
        }));
        assert!(check_transfer_block(&mint, "3", &from, &to, 1).is_err());
        let empty = block_with(None);
        assert!(check_transfer_block(&empty, "3", &from, &to, 1).is_err());
    }
}
