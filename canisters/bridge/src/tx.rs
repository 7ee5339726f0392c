//! EIP-1559 (type 0x02) transaction construction: the RLP envelope, the
//! signing preimage, and reassembly into broadcastable raw bytes.

use rlp::RlpStream;
use sha3::{Digest, Keccak256};

use crate::error::{BridgeError, BridgeResult};
use crate::gas::GasEstimate;
use crate::signer::SignatureParts;

pub const EIP1559_TX_TYPE: u8 = 0x02;

pub fn keccak256(input: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

#[derive(Clone, Debug)]
pub struct Eip1559Transaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub max_priority_fee_per_gas: u64,
    pub max_fee_per_gas: u64,
    pub gas_limit: u64,
    pub to: [u8; 20],
    pub value: u64,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct SignedTransaction {
    pub raw_transaction: Vec<u8>,
    pub transaction_hash: [u8; 32],
}

impl SignedTransaction {
    pub fn hash_hex(&self) -> String {
        format!("0x{}", hex::encode(self.transaction_hash))
    }
}

impl Eip1559Transaction {
    /// Plain ETH delivery to `to`, priced off the current estimate.
    pub fn new_transfer(
        chain_id: u64,
        to: [u8; 20],
        value: u64,
        nonce: u64,
        estimate: &GasEstimate,
    ) -> Self {
        Eip1559Transaction {
            chain_id,
            nonce,
            max_priority_fee_per_gas: estimate.priority_fee,
            max_fee_per_gas: estimate.max_fee_per_gas,
            gas_limit: estimate.gas_limit,
            to,
            value,
            data: Vec::new(),
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.to == [0u8; 20] {
            return Err(BridgeError::validation("zero recipient address"));
        }
        if self.value == 0 {
            return Err(BridgeError::validation("zero-value transfer"));
        }
        if self.gas_limit < 21_000 {
            return Err(BridgeError::validation("gas limit below 21000"));
        }
        if self.max_fee_per_gas < self.max_priority_fee_per_gas {
            return Err(BridgeError::validation(
                "max fee below priority fee",
            ));
        }
        Ok(())
    }

    /// The nine unsigned envelope fields in EIP-1559 order. The access list
    /// is always empty but must still encode as an empty RLP *list*.
    fn append_envelope(&self, stream: &mut RlpStream) {
        stream.append(&self.chain_id);
        stream.append(&self.nonce);
        stream.append(&self.max_priority_fee_per_gas);
        stream.append(&self.max_fee_per_gas);
        stream.append(&self.gas_limit);
        stream.append(&self.to.as_slice());
        stream.append(&self.value);
        stream.append(&self.data);
        stream.begin_list(0);
    }

    /// keccak256 of `0x02 || rlp(envelope)`: the preimage handed to the signer.
    pub fn signing_hash(&self) -> [u8; 32] {
        let mut stream = RlpStream::new();
        stream.begin_list(9);
        self.append_envelope(&mut stream);
        let encoded = stream.out();

        let mut preimage = Vec::with_capacity(1 + encoded.len());
        preimage.push(EIP1559_TX_TYPE);
        preimage.extend_from_slice(&encoded);
        keccak256(&preimage)
    }

    /// Reassemble with the signature into raw broadcast bytes and the
    /// network transaction hash.
    pub fn into_signed(&self, signature: &SignatureParts) -> SignedTransaction {
        let mut stream = RlpStream::new();
        stream.begin_list(12);
        self.append_envelope(&mut stream);
        stream.append(&(signature.y_parity as u64));
        stream.append(&signature.r);
        stream.append(&signature.s);
        let encoded = stream.out();

        let mut raw = Vec::with_capacity(1 + encoded.len());
        raw.push(EIP1559_TX_TYPE);
        raw.extend_from_slice(&encoded);
        let transaction_hash = keccak256(&raw);

        SignedTransaction {
            raw_transaction: raw,
            transaction_hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer;
    use libsecp256k1::{sign as secp_sign, Message, PublicKey, SecretKey};
    use rlp::Rlp;

    fn test_tx() -> Eip1559Transaction {
        let estimate = GasEstimate {
            base_fee: 30_000_000_000,
            priority_fee: 1_000_000_000,
            max_fee_per_gas: 61_000_000_000,
            gas_limit: 21_000,
            fetched_at: 0,
        };
        let mut to = [0u8; 20];
        to[19] = 0x42;
        Eip1559Transaction::new_transfer(84532, to, 1_000_000_000_000_000, 7, &estimate)
    }

    #[test]
    fn keccak_empty_input_vector() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn envelope_is_well_formed_rlp() {
        let tx = test_tx();
        let mut stream = RlpStream::new();
        stream.begin_list(9);
        tx.append_envelope(&mut stream);
        let encoded = stream.out();

        let rlp = Rlp::new(&encoded);
        assert!(rlp.is_list());
        assert_eq!(rlp.item_count().unwrap(), 9);
        assert_eq!(rlp.val_at::<u64>(0).unwrap(), 84532);
        assert_eq!(rlp.val_at::<u64>(1).unwrap(), 7);
        assert_eq!(rlp.val_at::<u64>(2).unwrap(), 1_000_000_000);
        assert_eq!(rlp.val_at::<u64>(3).unwrap(), 61_000_000_000);
        assert_eq!(rlp.val_at::<u64>(4).unwrap(), 21_000);
        assert_eq!(rlp.at(5).unwrap().data().unwrap(), tx.to.as_slice());
        assert_eq!(rlp.val_at::<u64>(6).unwrap(), 1_000_000_000_000_000);
        assert!(rlp.at(7).unwrap().data().unwrap().is_empty());
        // Empty access list must be an empty list, not an empty string.
        let access_list = rlp.at(8).unwrap();
        assert!(access_list.is_list());
        assert_eq!(access_list.item_count().unwrap(), 0);
    }

    #[test]
    fn preimage_is_typed() {
        let tx = test_tx();
        let mut stream = RlpStream::new();
        stream.begin_list(9);
        tx.append_envelope(&mut stream);
        let expected = {
            let mut preimage = vec![EIP1559_TX_TYPE];
            preimage.extend_from_slice(&stream.out());
            keccak256(&preimage)
        };
        assert_eq!(tx.signing_hash(), expected);
    }

    #[test]
    fn signed_transaction_round_trips_through_rlp() {
        let tx = test_tx();
        let secret = {
            let mut bytes = [0u8; 32];
            bytes[31] = 1;
            SecretKey::parse(&bytes).unwrap()
        };
        let public = PublicKey::from_secret_key(&secret);
        let hash = tx.signing_hash();
        let (raw_sig, _) = secp_sign(&Message::parse(&hash), &secret);
        let parts =
            signer::finish_signature(&raw_sig.serialize(), &hash, &public.serialize_compressed())
                .unwrap();

        let signed = tx.into_signed(&parts);
        assert_eq!(signed.raw_transaction[0], EIP1559_TX_TYPE);
        assert_eq!(signed.transaction_hash, keccak256(&signed.raw_transaction));

        let rlp = Rlp::new(&signed.raw_transaction[1..]);
        assert_eq!(rlp.item_count().unwrap(), 12);
        assert_eq!(rlp.val_at::<u64>(9).unwrap(), parts.y_parity as u64);
        assert_eq!(rlp.at(10).unwrap().data().unwrap(), parts.r.as_slice());
        assert_eq!(rlp.at(11).unwrap().data().unwrap(), parts.s.as_slice());
    }

    #[test]
    fn validation_rejects_bad_transfers() {
        let mut tx = test_tx();
        assert!(tx.validate().is_ok());
        tx.to = [0u8; 20];
        assert!(tx.validate().is_err());

        let mut tx = test_tx();
        tx.value = 0;
        assert!(tx.validate().is_err());

        let mut tx = test_tx();
        tx.gas_limit = 20_999;
        assert!(tx.validate().is_err());

        let mut tx = test_tx();
        tx.max_fee_per_gas = tx.max_priority_fee_per_gas - 1;
        assert!(tx.validate().is_err());
    }
}
