//! Key material and canonical transaction hashing
//!
//! Member and shared wallet keys are ed25519, derived from passphrases via
//! SHA-256. The canonical transaction digest covers every field except the
//! signature lists, so all federation members derive the same transaction
//! id for the same payout.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::{NodeError, NodeResult};
use crate::ledger::{ChainId, MemberSignature, MultisigWalletInfo, OutgoingTransaction};

/// Derive a signing key from a passphrase
pub fn signing_key_from_passphrase(passphrase: &str) -> SigningKey {
    let mut hasher = Sha256::new();
    hasher.update(passphrase.as_bytes());
    let seed: [u8; 32] = hasher.finalize().into();
    SigningKey::from_bytes(&seed)
}

pub fn public_key_hex(key: &SigningKey) -> String {
    hex::encode(key.verifying_key().to_bytes())
}

/// Decrypt an encrypted passphrase with a SHA-256 keystream under `password`
pub fn decrypt_passphrase(cipher_hex: &str, password: &str) -> NodeResult<String> {
    let cipher = hex::decode(cipher_hex)
        .map_err(|e| NodeError::Config(format!("Invalid encrypted passphrase hex: {}", e)))?;
    let mut plain = Vec::with_capacity(cipher.len());
    let mut counter: u64 = 0;
    let mut stream = Vec::new();
    while stream.len() < cipher.len() {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hasher.update(counter.to_le_bytes());
        stream.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    for (i, byte) in cipher.iter().enumerate() {
        plain.push(*byte ^ stream[i]);
    }
    String::from_utf8(plain)
        .map_err(|_| NodeError::Config("Decrypted passphrase is not valid UTF-8".to_string()))
}

/// Canonical digest over a transaction's payload, without signatures
pub fn transaction_digest(
    chain: &ChainId,
    sender: &str,
    recipient: &str,
    amount: u64,
    timestamp: u64,
    height: u64,
    memo: &str,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(chain.as_str().as_bytes());
    hasher.update(sender.as_bytes());
    hasher.update(recipient.as_bytes());
    hasher.update(amount.to_le_bytes());
    hasher.update(timestamp.to_le_bytes());
    hasher.update(height.to_le_bytes());
    hasher.update(memo.as_bytes());
    hasher.finalize().into()
}

/// Digest of an already-built transaction, recomputed from its fields
pub fn digest_of(tx: &OutgoingTransaction) -> [u8; 32] {
    transaction_digest(
        &tx.chain,
        &tx.sender,
        &tx.recipient,
        tx.amount,
        tx.timestamp,
        tx.height,
        &tx.memo,
    )
}

pub fn sign_digest(key: &SigningKey, digest: &[u8; 32]) -> String {
    hex::encode(key.sign(digest).to_bytes())
}

/// Verify a hex signature over a digest; malformed input is a failed
/// verification, never an error
pub fn verify_digest(public_key_hex: &str, signature_hex: &str, digest: &[u8; 32]) -> bool {
    let Ok(pk_bytes) = hex::decode(public_key_hex) else {
        return false;
    };
    let Ok(pk_array) = <[u8; 32]>::try_from(pk_bytes.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&pk_array) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(sig_array) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_array);
    verifying_key.verify(digest, &signature).is_ok()
}

/// Key material and wallet description for one chain
pub struct ChainWallet {
    pub chain: ChainId,
    /// Multisig wallet address on this chain
    pub address: String,
    /// Shared wallet key all members hold
    pub shared: SigningKey,
    /// This node's member key
    pub member: SigningKey,
    /// Hex verifying key of the member key
    pub member_public: String,
    pub info: MultisigWalletInfo,
}

impl ChainWallet {
    pub fn new(
        chain: ChainId,
        address: String,
        shared: SigningKey,
        member: SigningKey,
        info: MultisigWalletInfo,
    ) -> Self {
        let member_public = public_key_hex(&member);
        Self {
            chain,
            address,
            shared,
            member,
            member_public,
            info,
        }
    }

    /// Build a canonical transfer on this wallet's chain, signed by the
    /// shared key, with this node's member signature attached first
    pub fn build_transaction(
        &self,
        recipient: &str,
        amount: u64,
        timestamp: u64,
        height: u64,
        memo: String,
    ) -> OutgoingTransaction {
        let digest = transaction_digest(
            &self.chain,
            &self.address,
            recipient,
            amount,
            timestamp,
            height,
            &memo,
        );
        let own_signature = MemberSignature {
            public_key: self.member_public.clone(),
            signature: sign_digest(&self.member, &digest),
        };
        OutgoingTransaction {
            id: hex::encode(digest),
            chain: self.chain.clone(),
            sender: self.address.clone(),
            recipient: recipient.to_string(),
            amount,
            timestamp,
            height,
            memo,
            wallet_signature: sign_digest(&self.shared, &digest),
            signatures: vec![own_signature],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passphrase_keys_are_deterministic() {
        let a = signing_key_from_passphrase("wagon dignity spoil");
        let b = signing_key_from_passphrase("wagon dignity spoil");
        assert_eq!(public_key_hex(&a), public_key_hex(&b));
        let c = signing_key_from_passphrase("different words here");
        assert_ne!(public_key_hex(&a), public_key_hex(&c));
    }

    #[test]
    fn test_decrypt_round_trip() {
        // Encrypt with the same keystream construction.
        let password = "hunter2";
        let plain = b"lucky number seven";
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hasher.update(0u64.to_le_bytes());
        let stream = hasher.finalize();
        let cipher: Vec<u8> = plain.iter().zip(stream.iter()).map(|(p, k)| p ^ k).collect();

        let decrypted = decrypt_passphrase(&hex::encode(cipher), password).unwrap();
        assert_eq!(decrypted, "lucky number seven");
    }

    #[test]
    fn test_transaction_id_and_signatures_verify() {
        let shared = signing_key_from_passphrase("shared");
        let member = signing_key_from_passphrase("member");
        let wallet = ChainWallet::new(
            ChainId::new("beta"),
            "multisig-beta".to_string(),
            shared,
            member,
            MultisigWalletInfo {
                members: Default::default(),
                member_count: 3,
                required_signature_count: 2,
            },
        );

        let tx = wallet.build_transaction("alice", 100, 50, 5, "r2,bid1: Expired order".into());
        let digest = digest_of(&tx);
        assert_eq!(tx.id, hex::encode(digest));
        assert_eq!(tx.signatures.len(), 1);
        assert!(verify_digest(
            &tx.signatures[0].public_key,
            &tx.signatures[0].signature,
            &digest
        ));
        assert!(verify_digest(
            &public_key_hex(&wallet.shared),
            &tx.wallet_signature,
            &digest
        ));

        // Same payout on every node derives the same id.
        let tx2 = wallet.build_transaction("alice", 100, 50, 5, "r2,bid1: Expired order".into());
        assert_eq!(tx.id, tx2.id);
    }

    #[test]
    fn test_malformed_signature_material_fails_quietly() {
        let digest = [7u8; 32];
        assert!(!verify_digest("zz", "zz", &digest));
        assert!(!verify_digest("aabb", "ccdd", &digest));
        let member = signing_key_from_passphrase("member");
        let sig = sign_digest(&member, &digest);
        let other = [8u8; 32];
        assert!(!verify_digest(&public_key_hex(&member), &sig, &other));
    }
}
