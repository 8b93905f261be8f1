use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::block::timestamp_now;
use super::crypto::{hmac_tag, verify_tag, Address, HashProvider, LedgerSecret, Signature};

/// Errors that can occur when admitting a transaction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("Invalid amount: {0} (must be positive)")]
    InvalidAmount(i64),

    #[error("Insufficient balance for {address}: required {required}, available {available}")]
    InsufficientBalance {
        address: Address,
        required: i64,
        available: i64,
    },

    #[error("Crediting {amount} to {address} would overflow its balance")]
    BalanceOverflow { address: Address, amount: i64 },
}

/// Fields covered by the content hash and, together with the hash, by the
/// signature. Encoded as compact JSON so field boundaries are unambiguous.
#[derive(Serialize)]
struct Preimage<'a> {
    from_address: Option<&'a Address>,
    to_address: &'a Address,
    amount: i64,
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<&'a str>,
}

/// Represents a transfer of value between two addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender's address, `None` for coinbase (reward) transactions
    pub from_address: Option<Address>,

    /// Recipient's address
    pub to_address: Address,

    /// Amount being transferred
    pub amount: i64,

    /// Time the transaction was sealed, in Unix milliseconds on the wire
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Content hash, empty until the transaction is sealed
    pub hash: String,

    /// Authentication tag issued by the ledger
    pub signature: Signature,
}

impl Transaction {
    /// Creates a new unsealed transfer
    ///
    /// # Arguments
    ///
    /// * `from` - The address of the sender
    /// * `to` - The address of the recipient
    /// * `amount` - The amount to transfer
    pub fn new(from: Address, to: Address, amount: i64) -> Self {
        Transaction {
            from_address: Some(from),
            to_address: to,
            amount,
            timestamp: timestamp_now(),
            hash: String::new(),
            signature: Signature::Unsigned,
        }
    }

    /// Creates a new unsealed coinbase transaction (mining reward)
    pub fn coinbase(to: Address, amount: i64) -> Self {
        Transaction {
            from_address: None,
            to_address: to,
            amount,
            timestamp: timestamp_now(),
            hash: String::new(),
            signature: Signature::Unsigned,
        }
    }

    /// Checks if the transaction is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.from_address.is_none()
    }

    /// Calculates the content hash over sender, recipient, amount and timestamp
    pub fn calculate_hash(&self, provider: &dyn HashProvider) -> String {
        provider.digest_hex(self.preimage(None).as_bytes())
    }

    /// Timestamps, hashes and signs the transaction with the ledger secret
    pub fn seal(&mut self, provider: &dyn HashProvider, secret: &LedgerSecret) {
        self.timestamp = timestamp_now();
        self.hash = self.calculate_hash(provider);
        let tag = hmac_tag(provider, secret.as_bytes(), self.signing_payload().as_bytes());
        self.signature = Signature::Signed(tag);
    }

    /// Verifies the signature if one is present; unsigned transactions pass
    pub fn verify_signature(&self, provider: &dyn HashProvider, secret: &LedgerSecret) -> bool {
        match &self.signature {
            Signature::Unsigned => true,
            Signature::Signed(tag) => verify_tag(
                provider,
                secret.as_bytes(),
                self.signing_payload().as_bytes(),
                tag,
            ),
        }
    }

    fn signing_payload(&self) -> String {
        self.preimage(Some(self.hash.as_str()))
    }

    fn preimage(&self, hash: Option<&str>) -> String {
        let preimage = Preimage {
            from_address: self.from_address.as_ref(),
            to_address: &self.to_address,
            amount: self.amount,
            timestamp: self.timestamp.timestamp_millis(),
            hash,
        };
        // Borrowed strings and integers always serialize.
        serde_json::to_string(&preimage).expect("transaction preimage serializes to JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Sha256Provider;

    fn secret() -> LedgerSecret {
        LedgerSecret::from_bytes(b"transaction-test-secret").unwrap()
    }

    #[test]
    fn test_new_transaction() {
        let transaction = Transaction::new(Address::from("alice"), Address::from("bob"), 40);

        assert_eq!(transaction.from_address, Some(Address::from("alice")));
        assert_eq!(transaction.to_address, Address::from("bob"));
        assert_eq!(transaction.amount, 40);
        assert!(transaction.hash.is_empty());
        assert_eq!(transaction.signature, Signature::Unsigned);
        assert!(!transaction.is_coinbase());
    }

    #[test]
    fn test_coinbase_transaction() {
        let transaction = Transaction::coinbase(Address::from("miner"), 100);

        assert!(transaction.is_coinbase());
        assert_eq!(transaction.to_address, Address::from("miner"));
        assert_eq!(transaction.amount, 100);
    }

    #[test]
    fn test_seal_and_verify() {
        let provider = Sha256Provider;
        let secret = secret();
        let mut transaction = Transaction::new(Address::from("alice"), Address::from("bob"), 40);

        transaction.seal(&provider, &secret);

        assert_eq!(transaction.hash, transaction.calculate_hash(&provider));
        assert!(transaction.signature.is_signed());
        assert!(transaction.verify_signature(&provider, &secret));

        let other = LedgerSecret::from_bytes(b"someone-else").unwrap();
        assert!(!transaction.verify_signature(&provider, &other));
    }

    #[test]
    fn test_tampered_amount_fails_verification() {
        let provider = Sha256Provider;
        let secret = secret();
        let mut transaction = Transaction::new(Address::from("alice"), Address::from("bob"), 40);
        transaction.seal(&provider, &secret);

        transaction.amount = 4000;

        assert!(!transaction.verify_signature(&provider, &secret));
    }

    #[test]
    fn test_shifted_field_boundary_fails_verification() {
        let provider = Sha256Provider;
        let secret = secret();
        let mut transaction = Transaction::new(Address::from("alice"), Address::from("bob1"), 5);
        transaction.seal(&provider, &secret);

        transaction.to_address = Address::from("bob");
        transaction.amount = 15;

        assert_ne!(transaction.hash, transaction.calculate_hash(&provider));
        assert!(!transaction.verify_signature(&provider, &secret));
    }

    #[test]
    fn test_coinbase_differs_from_sender_named_null() {
        let provider = Sha256Provider;
        let coinbase = Transaction::coinbase(Address::from("miner"), 100);
        let mut transfer = Transaction::new(Address::from("null"), Address::from("miner"), 100);
        transfer.timestamp = coinbase.timestamp;

        assert_ne!(
            coinbase.calculate_hash(&provider),
            transfer.calculate_hash(&provider)
        );
    }

    #[test]
    fn test_hash_preimage_layout() {
        let mut transaction = Transaction::new(Address::from("alice"), Address::from("bob"), 40);
        transaction.timestamp = DateTime::<Utc>::from_timestamp_millis(42).unwrap();

        assert_eq!(
            transaction.preimage(None),
            r#"{"from_address":"alice","to_address":"bob","amount":40,"timestamp":42}"#
        );
        assert_eq!(
            transaction.preimage(Some("ab")),
            r#"{"from_address":"alice","to_address":"bob","amount":40,"timestamp":42,"hash":"ab"}"#
        );
    }

    #[test]
    fn test_unsigned_transaction_passes_verification() {
        let transaction = Transaction::coinbase(Address::from("miner"), 100);
        assert!(transaction.verify_signature(&Sha256Provider, &secret()));
    }

    #[test]
    fn test_canonical_field_order() {
        let mut transaction = Transaction::coinbase(Address::from("miner"), 100);
        transaction.timestamp = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap();

        let json = serde_json::to_string(&transaction).unwrap();
        assert_eq!(
            json,
            r#"{"from_address":null,"to_address":"miner","amount":100,"timestamp":1700000000000,"hash":"","signature":{"state":"unsigned"}}"#
        );
    }
}
