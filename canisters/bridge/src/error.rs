use candid::CandidType;
use serde::{Deserialize, Serialize};

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Classified error surface of the bridge. User-visible messages stay short;
/// anything longer goes to the audit log.
#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub enum BridgeError {
    NotAuthorized,
    NotAdmin,
    AnonymousCaller,
    Validation {
        message: String,
    },
    InvalidAddress {
        value: String,
    },
    AmountOutOfRange {
        amount: u64,
        min: u64,
        max: u64,
    },
    UnsupportedChain {
        chain: String,
    },
    InsufficientReserve {
        required: u64,
        available: u64,
    },
    ReservePaused,
    DailyLimitExceeded {
        requested: u64,
        remaining: u64,
    },
    QuoteNotFound {
        quote_id: String,
    },
    QuoteExpired {
        quote_id: String,
    },
    QuoteAlreadySettled {
        quote_id: String,
        settlement_id: String,
    },
    PaymentNotFound {
        proof: String,
    },
    PaymentAmountMismatch {
        required: u64,
        actual: u64,
    },
    PaymentAlreadyUsed {
        proof: String,
    },
    PaymentNotFinal {
        proof: String,
    },
    LedgerTransfer {
        message: String,
    },
    RpcTimeout {
        endpoint: String,
    },
    RpcError {
        code: i64,
        message: String,
    },
    BadRpcResponse {
        expected: String,
    },
    AllEndpointsDown {
        chain: String,
    },
    SignerUnavailable {
        message: String,
    },
    SignerRejected {
        message: String,
    },
    PriceUnavailable {
        asset: String,
    },
    PriceStale {
        asset: String,
        age_seconds: u64,
    },
    ConfigInvalid {
        message: String,
    },
}

impl BridgeError {
    /// Errors the settlement engine may retry with the same nonce.
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::RpcTimeout { .. }
            | BridgeError::AllEndpointsDown { .. }
            | BridgeError::SignerUnavailable { .. } => true,
            // -32005 is the conventional "limit exceeded / underpriced" band.
            BridgeError::RpcError { code, message } => {
                *code == -32005 || message.contains("underpriced")
            }
            _ => false,
        }
    }

    /// Broadcast rejections that mean the nonce was already consumed.
    pub fn is_nonce_too_low(&self) -> bool {
        matches!(self, BridgeError::RpcError { message, .. } if message.contains("nonce too low"))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        BridgeError::Validation {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::NotAuthorized => write!(f, "not authorized"),
            BridgeError::NotAdmin => write!(f, "caller is not an admin"),
            BridgeError::AnonymousCaller => write!(f, "anonymous caller not allowed"),
            BridgeError::Validation { message } => write!(f, "validation failed: {}", message),
            BridgeError::InvalidAddress { value } => write!(f, "invalid address: {}", value),
            BridgeError::AmountOutOfRange { amount, min, max } => {
                write!(f, "amount {} outside allowed range [{}, {}]", amount, min, max)
            }
            BridgeError::UnsupportedChain { chain } => write!(f, "unsupported chain: {}", chain),
            BridgeError::InsufficientReserve {
                required,
                available,
            } => write!(
                f,
                "insufficient reserve: required {} wei, available {} wei",
                required, available
            ),
            BridgeError::ReservePaused => write!(f, "reserve is paused"),
            BridgeError::DailyLimitExceeded {
                requested,
                remaining,
            } => write!(
                f,
                "daily limit exceeded: requested {} wei, remaining {} wei",
                requested, remaining
            ),
            BridgeError::QuoteNotFound { quote_id } => write!(f, "quote not found: {}", quote_id),
            BridgeError::QuoteExpired { quote_id } => write!(f, "quote expired: {}", quote_id),
            BridgeError::QuoteAlreadySettled {
                quote_id,
                settlement_id,
            } => write!(
                f,
                "quote {} already settled by {}",
                quote_id, settlement_id
            ),
            BridgeError::PaymentNotFound { proof } => write!(f, "payment not found: {}", proof),
            BridgeError::PaymentAmountMismatch { required, actual } => write!(
                f,
                "payment amount mismatch: required {} e8s, got {} e8s",
                required, actual
            ),
            BridgeError::PaymentAlreadyUsed { proof } => {
                write!(f, "payment proof already used: {}", proof)
            }
            BridgeError::PaymentNotFinal { proof } => {
                write!(f, "payment not finalised: {}", proof)
            }
            BridgeError::LedgerTransfer { message } => {
                write!(f, "ledger transfer failed: {}", message)
            }
            BridgeError::RpcTimeout { endpoint } => write!(f, "rpc timeout at {}", endpoint),
            BridgeError::RpcError { code, message } => {
                write!(f, "rpc error {}: {}", code, message)
            }
            BridgeError::BadRpcResponse { expected } => {
                write!(f, "unexpected rpc response, expected {}", expected)
            }
            BridgeError::AllEndpointsDown { chain } => {
                write!(f, "all rpc endpoints down for {}", chain)
            }
            BridgeError::SignerUnavailable { message } => {
                write!(f, "signer unavailable: {}", message)
            }
            BridgeError::SignerRejected { message } => {
                write!(f, "signer rejected request: {}", message)
            }
            BridgeError::PriceUnavailable { asset } => {
                write!(f, "no usable price for {}", asset)
            }
            BridgeError::PriceStale { asset, age_seconds } => {
                write!(f, "price for {} is stale ({} s old)", asset, age_seconds)
            }
            BridgeError::ConfigInvalid { message } => {
                write!(f, "invalid configuration: {}", message)
            }
        }
    }
}

impl std::error::Error for BridgeError {}
