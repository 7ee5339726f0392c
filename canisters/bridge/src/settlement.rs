//! Per-request settlement state machine: verify the source payment, build,
//! sign and broadcast the delivery transaction, poll for the receipt, and
//! reconcile the reserve. Pending -> Executing -> Completed | Failed.

use candid::Principal;

use crate::config::ChainConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::gas::GasEstimate;
use crate::payment;
use crate::quote;
use crate::rpc;
use crate::signer;
use crate::storage::{self, AuditEvent};
use crate::tx::Eip1559Transaction;
use crate::types::{
    format_evm_address, parse_evm_address, IcpPayment, PaymentStatus, Quote, QuoteStatus,
    Settlement, SettlementStatus, TransactionStatus, UserTransaction,
};

const MAX_RETRIES: u32 = 3;
/// Total wall-clock budget for receipt polling.
const RECEIPT_DEADLINE_SECONDS: u64 = 300;
const MAX_POLL_ATTEMPTS: u32 = 40;

/// Split the quote's reservation into the committed spend and the surplus
/// returned to the reserve.
pub fn settle_accounts(reserved: u64, amount: u64, gas_cost: u64) -> (u64, u64) {
    let spend = amount.saturating_add(gas_cost).min(reserved);
    (spend, reserved - spend)
}

fn now_sec() -> u64 {
    ic_cdk::api::time() / 1_000_000_000
}

/// Verify a payment proof for `required_e8s`. Payments captured through the
/// allowance flow are checked locally; anything else goes to the ledger.
async fn verify_proof(
    ledger: Principal,
    caller: Principal,
    proof: &str,
    required_e8s: u64,
) -> BridgeResult<()> {
    if let Some(captured) = storage::get_payment(proof) {
        if captured.user != caller {
            return Err(BridgeError::NotAuthorized);
        }
        if captured.status != PaymentStatus::Confirmed {
            return Err(BridgeError::PaymentNotFinal {
                proof: proof.to_string(),
            });
        }
        if captured.amount_e8s < required_e8s {
            return Err(BridgeError::PaymentAmountMismatch {
                required: required_e8s,
                actual: captured.amount_e8s,
            });
        }
        return Ok(());
    }
    payment::verify_transfer(ledger, proof, caller, required_e8s).await?;
    Ok(())
}

/// Settle a quote against a payment proof. Idempotent: a proof that already
/// produced a settlement returns that settlement unchanged.
pub async fn settle_with_proof(
    caller: Principal,
    quote_id: String,
    payment_proof: String,
) -> BridgeResult<Settlement> {
    if let Some(settlement_id) = storage::proof_consumer(&payment_proof) {
        return storage::get_settlement(&settlement_id).ok_or(BridgeError::PaymentAlreadyUsed {
            proof: payment_proof,
        });
    }

    let now = now_sec();
    let quote = quote::settleable_quote(&quote_id, caller, now)?;
    let config = storage::get_config();
    verify_proof(config.ledger_canister, caller, &payment_proof, quote.total_cost).await?;

    // State may have moved while the ledger call was in flight: someone else
    // could have consumed the proof or settled the quote. Re-check and claim
    // both atomically before the first destination-chain call.
    if let Some(settlement_id) = storage::proof_consumer(&payment_proof) {
        return storage::get_settlement(&settlement_id).ok_or(BridgeError::PaymentAlreadyUsed {
            proof: payment_proof,
        });
    }
    let now = now_sec();
    let quote = quote::settleable_quote(&quote_id, caller, now)?;

    let settlement = Settlement::new(quote::new_id(), &quote, payment_proof.clone(), now);
    storage::insert_settlement(settlement.clone());
    storage::consume_proof(&payment_proof, &settlement.id);
    storage::audit(
        now,
        AuditEvent {
            event_type: "settlement_created",
            actor: Some(caller),
            admin: None,
            amount: Some(settlement.amount),
            tx_hash: None,
            details: format!(
                "settlement {} for quote {} with proof {}",
                settlement.id, quote.id, settlement.payment_proof
            ),
        },
    );

    let chain = config.chain(&quote.destination_chain)?.clone();
    execute(&settlement.id, &quote, &chain).await;

    storage::get_settlement(&settlement.id).ok_or(BridgeError::QuoteNotFound { quote_id })
}

/// Gas terms committed at quote time; executions never re-quote, they only
/// bump these per the EIP-1559 replacement rules.
fn quoted_estimate(quote: &Quote) -> GasEstimate {
    GasEstimate {
        base_fee: quote.base_fee,
        priority_fee: quote.priority_fee,
        max_fee_per_gas: quote.max_fee_per_gas,
        gas_limit: quote.gas_estimate,
        fetched_at: quote.created_at,
    }
}

/// Drive one settlement from Pending to a terminal state. Errors end in the
/// stored settlement record rather than the return value.
async fn execute(settlement_id: &str, quote: &Quote, chain: &ChainConfig) {
    storage::update_settlement(settlement_id, |s| s.mark_executing());

    let recipient = match parse_evm_address(&quote.destination_address) {
        Ok(address) => address,
        Err(err) => {
            fail_settlement(settlement_id, quote, err.to_string()).await;
            return;
        }
    };

    match broadcast_with_retries(settlement_id, quote, chain, recipient).await {
        Ok(tx_hash) => finalise(settlement_id, quote, chain, &tx_hash).await,
        Err(err) => fail_settlement(settlement_id, quote, err.to_string()).await,
    }
}

/// Broadcast the delivery transaction, retrying transient failures with
/// bumped fees on the same nonce, and refetching the nonce when the chain
/// reports it consumed.
async fn broadcast_with_retries(
    settlement_id: &str,
    quote: &Quote,
    chain: &ChainConfig,
    recipient: [u8; 20],
) -> BridgeResult<String> {
    let from = signer::ethereum_address().await?;
    let from_hex = format_evm_address(&from);

    let mut estimate = quoted_estimate(quote);
    let observed = rpc::nonce(chain, &from_hex).await?;
    let mut nonce = storage::reserve_nonce(chain.chain_id, observed);
    let mut last_hash: Option<String> = None;

    let mut attempt = 0u32;
    loop {
        let transaction = Eip1559Transaction::new_transfer(
            chain.chain_id,
            recipient,
            quote.amount_out,
            nonce,
            &estimate,
        );
        transaction.validate()?;
        let preimage = transaction.signing_hash();
        let signature = signer::sign(&preimage).await?;
        let signed = transaction.into_signed(&signature);

        match rpc::send_raw(chain, &signed.raw_transaction).await {
            Ok(tx_hash) => {
                storage::update_settlement(settlement_id, |s| {
                    s.transaction_hash = Some(tx_hash.clone());
                    s.retry_count = attempt;
                });
                return Ok(tx_hash);
            }
            Err(err) if err.is_nonce_too_low() => {
                // The slot was consumed. If it was consumed by our own
                // earlier broadcast, hand over to receipt polling.
                if let Some(hash) = &last_hash {
                    if let Ok(Some(_)) = rpc::receipt(chain, hash).await {
                        return Ok(hash.clone());
                    }
                }
                attempt += 1;
                if attempt > MAX_RETRIES {
                    return Err(err);
                }
                storage::reset_nonce(chain.chain_id);
                let observed = rpc::nonce(chain, &from_hex).await?;
                nonce = storage::reserve_nonce(chain.chain_id, observed);
            }
            Err(err) if err.is_transient() => {
                attempt += 1;
                if attempt > MAX_RETRIES {
                    return Err(err);
                }
                estimate = estimate.bumped();
                last_hash = Some(signed.hash_hex());
            }
            Err(err) => return Err(err),
        }
        storage::update_settlement(settlement_id, |s| s.retry_count = attempt);
    }
}

/// Poll for the receipt until the deadline, then reconcile reserve and
/// records on the observed outcome.
///
/// Pending receipts are never cached, so every probe is a real outcall and
/// each miss costs at least a consensus round; the attempt cap and the
/// 5-minute deadline bound the search together.
async fn finalise(settlement_id: &str, quote: &Quote, chain: &ChainConfig, tx_hash: &str) {
    let deadline = now_sec() + RECEIPT_DEADLINE_SECONDS;
    let mut attempt = 0u32;

    let receipt = loop {
        if now_sec() > deadline || attempt >= MAX_POLL_ATTEMPTS {
            break None;
        }
        attempt += 1;
        match rpc::receipt(chain, tx_hash).await {
            Ok(Some(receipt)) => break Some(receipt),
            // Not mined yet, or a transient endpoint problem; either way the
            // clock advanced, try again.
            Ok(None) | Err(_) => {}
        }
    };

    let now = now_sec();
    match receipt {
        Some(receipt) if receipt.status == 1 => {
            let gas_cost = receipt
                .gas_used
                .saturating_mul(receipt.effective_gas_price);
            let (spend, refund) = settle_accounts(quote.reserved_amount(), quote.amount_out, gas_cost);
            storage::mutate_reserve(|r| {
                r.commit(spend, now);
                if refund > 0 {
                    r.unlock(refund, now);
                }
            });
            storage::update_settlement(settlement_id, |s| {
                s.mark_completed(receipt.gas_used, tx_hash.to_string());
            });
            storage::update_quote(&quote.id, |q| q.status = QuoteStatus::Settled);
            complete_user_transaction(settlement_id, tx_hash, now);
            storage::audit(
                now,
                AuditEvent {
                    event_type: "settlement_completed",
                    actor: Some(quote.user),
                    admin: None,
                    amount: Some(quote.amount_out),
                    tx_hash: Some(tx_hash.to_string()),
                    details: format!(
                        "settlement {} delivered, gas used {}, spend {} wei, refund {} wei",
                        settlement_id, receipt.gas_used, spend, refund
                    ),
                },
            );
        }
        Some(receipt) => {
            fail_settlement(
                settlement_id,
                quote,
                format!("transaction reverted in block {}", receipt.block_number),
            )
            .await;
        }
        None => {
            fail_settlement(
                settlement_id,
                quote,
                format!("no receipt for {} within {} s", tx_hash, RECEIPT_DEADLINE_SECONDS),
            )
            .await;
        }
    }
}

/// Terminal failure: release the reservation, fail the quote, flag the
/// linked user transaction for an operator refund, and audit. The payment
/// proof stays consumed; refund issuance is operator-driven.
async fn fail_settlement(settlement_id: &str, quote: &Quote, reason: String) {
    let now = now_sec();
    let settlement = storage::update_settlement(settlement_id, |s| {
        s.mark_failed(reason.clone());
    });
    storage::mutate_reserve(|r| r.unlock(quote.reserved_amount(), now));
    storage::update_quote(&quote.id, |q| q.status = QuoteStatus::Failed);

    if let Some(settlement) = settlement {
        if let Some(mut user_tx) = storage::user_transaction_by_payment(&settlement.payment_proof) {
            user_tx.status = TransactionStatus::Refunded;
            user_tx.completed_at = Some(now);
            storage::insert_user_transaction(user_tx);
        }
    }

    storage::audit(
        now,
        AuditEvent {
            event_type: "settlement_failed",
            actor: Some(quote.user),
            admin: None,
            amount: Some(quote.amount_out),
            tx_hash: None,
            details: format!("settlement {} failed: {}", settlement_id, reason),
        },
    );
}

fn complete_user_transaction(settlement_id: &str, tx_hash: &str, now: u64) {
    if let Some(settlement) = storage::get_settlement(settlement_id) {
        if let Some(mut user_tx) = storage::user_transaction_by_payment(&settlement.payment_proof) {
            user_tx.status = TransactionStatus::Completed;
            user_tx.completed_at = Some(now);
            user_tx.transaction_hash = Some(tx_hash.to_string());
            storage::insert_user_transaction(user_tx);
        }
    }
}

/// The combined paid flow behind `bridge_assets` and `create_icp_payment`:
/// quote, capture the source payment via the caller's allowance, then settle
/// inline.
pub async fn paid_flow(
    caller: Principal,
    amount: u64,
    destination_address: String,
    destination_chain: String,
) -> BridgeResult<(UserTransaction, Settlement)> {
    let issued = quote::request_quote(
        caller,
        amount,
        destination_address.clone(),
        destination_chain.clone(),
    )
    .await?;
    let config = storage::get_config();

    let block_index =
        match payment::collect_payment(config.ledger_canister, caller, issued.total_cost).await {
            Ok(block) => block,
            Err(err) => {
                // Quote dies with the failed capture; free its reservation.
                let now = now_sec();
                storage::update_quote(&issued.id, |q| q.status = QuoteStatus::Failed);
                storage::mutate_reserve(|r| r.unlock(issued.reserved_amount(), now));
                storage::audit(
                    now,
                    AuditEvent {
                        event_type: "payment_capture_failed",
                        actor: Some(caller),
                        admin: None,
                        amount: Some(issued.total_cost),
                        tx_hash: None,
                        details: format!("quote {}: {}", issued.id, err),
                    },
                );
                return Err(err);
            }
        };

    let proof = block_index.to_string();
    let now = now_sec();
    storage::insert_payment(IcpPayment {
        payment_id: proof.clone(),
        user: caller,
        amount_e8s: issued.total_cost,
        timestamp: now,
        status: PaymentStatus::Confirmed,
    });

    let user_tx = UserTransaction {
        id: quote::new_id(),
        user: caller,
        icp_payment_id: proof.clone(),
        amount_icp: issued.total_cost,
        amount_eth: issued.amount_out,
        gas_sponsored: issued.gas_budget(),
        destination_address,
        destination_chain,
        status: TransactionStatus::Processing,
        created_at: now,
        completed_at: None,
        transaction_hash: None,
    };
    storage::insert_user_transaction(user_tx.clone());
    storage::audit(
        now,
        AuditEvent {
            event_type: "payment_captured",
            actor: Some(caller),
            admin: None,
            amount: Some(issued.total_cost),
            tx_hash: None,
            details: format!("ledger block {} captured for quote {}", proof, issued.id),
        },
    );

    let settlement = settle_with_proof(caller, issued.id.clone(), proof.clone()).await?;
    let user_tx = storage::update_user_transaction(&user_tx.id, |t| {
        if t.status == TransactionStatus::Processing
            && settlement.status == SettlementStatus::Failed
        {
            t.status = TransactionStatus::Failed;
        }
    })
    .unwrap_or(user_tx);

    Ok((user_tx, settlement))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settle_accounts_splits_reservation() {
        // Actual spend below the reservation refunds the difference.
        let (spend, refund) = settle_accounts(1_500, 1_000, 200);
        assert_eq!(spend, 1_200);
        assert_eq!(refund, 300);
        // Spend can never exceed what was reserved.
        let (spend, refund) = settle_accounts(1_500, 1_000, 900);
        assert_eq!(spend, 1_500);
        assert_eq!(refund, 0);
        assert_eq!(spend + refund, 1_500);
    }

    #[test]
    fn duplicate_settlement_for_quote_is_rejected() {
        use crate::reserve::ReserveState;

        let now = 50_000;
        let quote = Quote {
            id: "dup-quote".to_string(),
            user: Principal::anonymous(),
            amount_requested: 1_000,
            amount_out: 1_000,
            gas_estimate: 21_000,
            base_fee: 1,
            priority_fee: 1,
            max_fee_per_gas: 2,
            safety_margin: 0,
            total_cost: 10,
            destination_address: "0x0000000000000000000000000000000000000042".to_string(),
            source_chain: "ICP".to_string(),
            destination_chain: "Base Sepolia".to_string(),
            created_at: now,
            expires_at: now + 900,
            status: QuoteStatus::Active,
        };
        storage::mutate_reserve(|r| *r = ReserveState::default());
        storage::insert_quote(quote.clone());

        // First claim succeeds while no settlement exists.
        assert!(quote::settleable_quote(&quote.id, quote.user, now).is_ok());

        let settlement = Settlement::new("dup-settlement".to_string(), &quote, "41".to_string(), now);
        storage::insert_settlement(settlement);
        let err = quote::settleable_quote(&quote.id, quote.user, now).unwrap_err();
        assert!(matches!(err, BridgeError::QuoteAlreadySettled { .. }));
    }

    #[test]
    fn consumed_proof_maps_to_its_settlement() {
        storage::consume_proof("proof-dup", "settlement-xyz");
        assert_eq!(
            storage::proof_consumer("proof-dup"),
            Some("settlement-xyz".to_string())
        );
    }
}
