//! Signing oracle for the bridge's destination-chain key. Production path is
//! the management canister's threshold ECDSA; the pure normalisation and
//! recovery logic underneath is shared with the deterministic test key.

use std::cell::RefCell;

use ic_cdk::api::management_canister::ecdsa::{
    ecdsa_public_key, sign_with_ecdsa, EcdsaCurve, EcdsaKeyId, EcdsaPublicKeyArgument,
    SignWithEcdsaArgument,
};
use libsecp256k1::{recover, Message, PublicKey, RecoveryId, Signature};
use sha3::{Digest, Keccak256};

use crate::error::{BridgeError, BridgeResult};

const ECDSA_KEY_NAME: &str = "key_1";

/// An Ethereum-ready signature: minimal big-endian `r`/`s` and the EIP-1559
/// parity bit.
#[derive(Clone, Debug)]
pub struct SignatureParts {
    pub r: Vec<u8>,
    pub s: Vec<u8>,
    pub y_parity: u8,
}

fn trim_leading_zeroes(data: &[u8]) -> Vec<u8> {
    let start = data.iter().position(|&b| b != 0).unwrap_or(data.len());
    data[start..].to_vec()
}

/// Ethereum address of a compressed secp256k1 public key: keccak256 of the
/// uncompressed point (without the 0x04 tag), last 20 bytes.
pub fn address_from_public_key(public_key: &[u8]) -> BridgeResult<[u8; 20]> {
    let compressed: &[u8; 33] =
        public_key
            .try_into()
            .map_err(|_| BridgeError::SignerRejected {
                message: format!("public key length {}, expected 33", public_key.len()),
            })?;
    let parsed =
        PublicKey::parse_compressed(compressed).map_err(|e| BridgeError::SignerRejected {
            message: format!("invalid public key: {:?}", e),
        })?;
    let uncompressed = parsed.serialize();

    let mut hasher = Keccak256::new();
    hasher.update(&uncompressed[1..]);
    let hash = hasher.finalize();

    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..32]);
    Ok(address)
}

/// Turn a raw 64-byte (r ‖ s) signature into Ethereum form: enforce low-s,
/// then find the parity bit by recovering against the known public key.
pub fn finish_signature(
    raw_signature: &[u8],
    message_hash: &[u8; 32],
    public_key: &[u8],
) -> BridgeResult<SignatureParts> {
    let bytes: &[u8; 64] = raw_signature
        .try_into()
        .map_err(|_| BridgeError::SignerRejected {
            message: format!("signature length {}, expected 64", raw_signature.len()),
        })?;
    let mut signature =
        Signature::parse_standard(bytes).map_err(|e| BridgeError::SignerRejected {
            message: format!("unparseable signature: {:?}", e),
        })?;
    if signature.s.is_high() {
        signature.normalize_s();
    }

    let compressed: &[u8; 33] =
        public_key
            .try_into()
            .map_err(|_| BridgeError::SignerRejected {
                message: "bad public key length".to_string(),
            })?;
    let expected =
        PublicKey::parse_compressed(compressed).map_err(|e| BridgeError::SignerRejected {
            message: format!("invalid public key: {:?}", e),
        })?;

    let message = Message::parse(message_hash);
    for candidate in 0..4u8 {
        let recovery_id = match RecoveryId::parse(candidate) {
            Ok(id) => id,
            Err(_) => continue,
        };
        if let Ok(recovered) = recover(&message, &signature, &recovery_id) {
            if recovered == expected {
                let serialized = signature.serialize();
                return Ok(SignatureParts {
                    r: trim_leading_zeroes(&serialized[0..32]),
                    s: trim_leading_zeroes(&serialized[32..64]),
                    y_parity: candidate,
                });
            }
        }
    }

    Err(BridgeError::SignerRejected {
        message: "no recovery id reproduces the signing key".to_string(),
    })
}

thread_local! {
    static CACHED_PUBLIC_KEY: RefCell<Option<Vec<u8>>> = RefCell::new(None);
}

fn key_id() -> EcdsaKeyId {
    EcdsaKeyId {
        curve: EcdsaCurve::Secp256k1,
        name: ECDSA_KEY_NAME.to_string(),
    }
}

fn derivation_path() -> Vec<Vec<u8>> {
    vec![ic_cdk::id().as_slice().to_vec()]
}

/// The bridge's compressed public key, fetched once and cached for the
/// process lifetime.
pub async fn public_key() -> BridgeResult<Vec<u8>> {
    if let Some(key) = CACHED_PUBLIC_KEY.with(|cell| cell.borrow().clone()) {
        return Ok(key);
    }
    let response = ecdsa_public_key(EcdsaPublicKeyArgument {
        canister_id: None,
        derivation_path: derivation_path(),
        key_id: key_id(),
    })
    .await
    .map_err(|(code, message)| BridgeError::SignerUnavailable {
        message: format!("public key fetch rejected ({:?}): {}", code, message),
    })?;
    let key = response.0.public_key;
    if key.len() != 33 {
        return Err(BridgeError::SignerRejected {
            message: format!("public key length {}, expected 33", key.len()),
        });
    }
    CACHED_PUBLIC_KEY.with(|cell| *cell.borrow_mut() = Some(key.clone()));
    Ok(key)
}

pub async fn ethereum_address() -> BridgeResult<[u8; 20]> {
    let key = public_key().await?;
    address_from_public_key(&key)
}

/// Sign a 32-byte preimage via threshold ECDSA. Transient management-canister
/// rejections surface as `SignerUnavailable` and are retried by the
/// settlement engine.
pub async fn sign(message_hash: &[u8; 32]) -> BridgeResult<SignatureParts> {
    let key = public_key().await?;
    let response = sign_with_ecdsa(SignWithEcdsaArgument {
        message_hash: message_hash.to_vec(),
        derivation_path: derivation_path(),
        key_id: key_id(),
    })
    .await
    .map_err(|(code, message)| BridgeError::SignerUnavailable {
        message: format!("sign rejected ({:?}): {}", code, message),
    })?;
    finish_signature(&response.0.signature, message_hash, &key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsecp256k1::{sign as secp_sign, SecretKey};

    fn test_key() -> (SecretKey, Vec<u8>) {
        let mut secret_bytes = [0u8; 32];
        secret_bytes[31] = 1;
        let secret = SecretKey::parse(&secret_bytes).unwrap();
        let public = PublicKey::from_secret_key(&secret);
        (secret, public.serialize_compressed().to_vec())
    }

    #[test]
    fn derives_known_address_for_key_one() {
        // The address of private key 0x...01 is a fixed point of the scheme.
        let (_, public) = test_key();
        let address = address_from_public_key(&public).unwrap();
        assert_eq!(
            hex::encode(address),
            "7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn rejects_malformed_public_keys() {
        assert!(address_from_public_key(&[0u8; 32]).is_err());
        assert!(address_from_public_key(&[0u8; 33]).is_err());
    }

    #[test]
    fn finished_signature_recovers_to_the_signing_key() {
        let (secret, public) = test_key();
        let hash = {
            let mut hasher = Keccak256::new();
            hasher.update(b"settlement preimage");
            let digest = hasher.finalize();
            let mut out = [0u8; 32];
            out.copy_from_slice(&digest);
            out
        };
        let (signature, recovery_id) = secp_sign(&Message::parse(&hash), &secret);
        let parts = finish_signature(&signature.serialize(), &hash, &public).unwrap();
        assert_eq!(parts.y_parity, recovery_id.serialize());
        assert!(parts.r.len() <= 32 && !parts.r.is_empty());
        assert!(parts.s.len() <= 32);
    }

    #[test]
    fn high_s_signatures_are_normalised() {
        let (secret, public) = test_key();
        let hash = [7u8; 32];
        let (signature, _) = secp_sign(&Message::parse(&hash), &secret);

        // Flip s to its high form; the parity bit must flip back with it.
        let mut high = signature;
        high.s = -high.s;
        assert!(high.s.is_high());

        let parts = finish_signature(&high.serialize(), &hash, &public).unwrap();
        let low = finish_signature(&signature.serialize(), &hash, &public).unwrap();
        assert_eq!(parts.s, low.s);
        assert_eq!(parts.r, low.r);
        assert_eq!(parts.y_parity, low.y_parity);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let (secret, _) = test_key();
        let mut other_bytes = [0u8; 32];
        other_bytes[31] = 2;
        let other_public =
            PublicKey::from_secret_key(&SecretKey::parse(&other_bytes).unwrap());
        let hash = [9u8; 32];
        let (signature, _) = secp_sign(&Message::parse(&hash), &secret);
        let err = finish_signature(
            &signature.serialize(),
            &hash,
            &other_public.serialize_compressed(),
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::SignerRejected { .. }));
    }

    #[test]
    fn signature_length_is_enforced() {
        let (_, public) = test_key();
        let err = finish_signature(&[0u8; 63], &[0u8; 32], &public).unwrap_err();
        assert!(matches!(err, BridgeError::SignerRejected { .. }));
    }
}
