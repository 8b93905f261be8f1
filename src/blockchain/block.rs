use chrono::{DateTime, SubsecRound, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use std::time::Instant;

use super::crypto::{hmac_tag, verify_tag, HashProvider, LedgerSecret, Signature};
use super::mining::{self, MiningError, MiningOptions, MiningResult};
use super::transaction::Transaction;

/// Previous-hash value carried by the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Sentinel payload of the genesis block
pub const GENESIS_DATA: &str = "Genesis Block";

/// Current time truncated to the millisecond precision used on the wire
pub(crate) fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Payload carried by a block
///
/// Serializes untagged: the genesis sentinel as a JSON string, a batch as a
/// JSON array (an empty batch is `[]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlockData {
    Genesis(String),
    Transactions(Vec<Transaction>),
}

impl BlockData {
    /// Transactions in the payload; the genesis sentinel has none
    pub fn transactions(&self) -> &[Transaction] {
        match self {
            BlockData::Genesis(_) => &[],
            BlockData::Transactions(transactions) => transactions,
        }
    }

    /// Canonical compact JSON encoding fed to the hash function
    pub fn canonical_json(&self) -> String {
        // Plain structs with string keys always serialize.
        serde_json::to_string(self).expect("block payload serializes to JSON")
    }
}

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Timestamp when the block was assembled
    pub timestamp: DateTime<Utc>,

    /// Transactions (or the genesis sentinel) included in this block
    pub data: BlockData,

    /// Hash of the previous block
    pub previous_hash: String,

    /// Hash of the current block
    pub hash: String,

    /// Proof of work
    pub nonce: u64,

    /// Difficulty the block was mined at (0 until mined)
    pub difficulty: u32,

    /// Authentication tag issued by the ledger
    pub signature: Signature,
}

impl Block {
    /// Creates a new unmined block with nonce 0 and its hash already computed
    ///
    /// # Arguments
    ///
    /// * `timestamp` - The block timestamp
    /// * `data` - The payload
    /// * `previous_hash` - The hash of the previous block
    /// * `provider` - The hash backend
    pub fn new(
        timestamp: DateTime<Utc>,
        data: BlockData,
        previous_hash: String,
        provider: &dyn HashProvider,
    ) -> Self {
        let mut block = Block {
            timestamp,
            data,
            previous_hash,
            hash: String::new(),
            nonce: 0,
            difficulty: 0,
            signature: Signature::Unsigned,
        };
        block.hash = block.calculate_hash(provider);
        block
    }

    /// Creates the genesis block (first block in the chain)
    pub fn genesis(timestamp: DateTime<Utc>, provider: &dyn HashProvider) -> Self {
        Block::new(
            timestamp,
            BlockData::Genesis(GENESIS_DATA.to_string()),
            GENESIS_PREVIOUS_HASH.to_string(),
            provider,
        )
    }

    pub fn is_genesis(&self) -> bool {
        self.previous_hash == GENESIS_PREVIOUS_HASH && matches!(self.data, BlockData::Genesis(_))
    }

    pub fn transactions(&self) -> &[Transaction] {
        self.data.transactions()
    }

    /// Everything in the hash input except the trailing nonce
    pub fn hash_prefix(&self) -> String {
        format!(
            "{}{}{}",
            self.previous_hash,
            self.timestamp.timestamp_millis(),
            self.data.canonical_json()
        )
    }

    /// The canonical hash input: previous hash, timestamp, payload, nonce
    pub fn hash_input(&self) -> String {
        format!("{}{}", self.hash_prefix(), self.nonce)
    }

    /// Calculates the hash of the block as a hexadecimal string
    pub fn calculate_hash(&self, provider: &dyn HashProvider) -> String {
        provider.digest_hex(self.hash_input().as_bytes())
    }

    /// Runs the proof-of-work search on the calling thread until the hash
    /// starts with `difficulty` zero hex digits
    pub fn mine(
        &mut self,
        difficulty: u32,
        provider: &dyn HashProvider,
    ) -> Result<MiningResult, MiningError> {
        self.mine_with(provider, &MiningOptions::new(difficulty))
    }

    /// Runs the proof-of-work search with explicit worker and cancellation options.
    ///
    /// The search restarts from nonce 0. On error the block is left untouched.
    pub fn mine_with(
        &mut self,
        provider: &dyn HashProvider,
        options: &MiningOptions,
    ) -> Result<MiningResult, MiningError> {
        let started = Instant::now();
        let prefix = self.hash_prefix();
        let solution = mining::search(&prefix, provider, options)?;
        let duration = started.elapsed();

        self.nonce = solution.nonce;
        self.hash = solution.hash;
        self.difficulty = options.difficulty;

        debug!(
            "Found nonce {} after {} attempts in {:?}",
            self.nonce, solution.attempts, duration
        );

        Ok(MiningResult::new(
            self.hash.clone(),
            self.nonce,
            solution.attempts,
            duration,
        ))
    }

    /// Checks the leading-zero condition on the stored hash without mining
    pub fn is_valid_hash(&self, difficulty: u32) -> bool {
        mining::meets_difficulty(&self.hash, difficulty)
    }

    /// Hash input plus the recorded difficulty; the difficulty follows the
    /// last `:` since the nonce before it is all digits
    fn signing_payload(&self) -> String {
        format!("{}:{}", self.hash_input(), self.difficulty)
    }

    /// Signs the block's hash input and recorded difficulty with the ledger secret
    pub fn sign(&mut self, provider: &dyn HashProvider, secret: &LedgerSecret) {
        let tag = hmac_tag(provider, secret.as_bytes(), self.signing_payload().as_bytes());
        self.signature = Signature::Signed(tag);
    }

    /// Verifies the signature if one is present; unsigned blocks pass
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::{Address, Sha256Provider};

    fn fixed_time(millis: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(millis).unwrap()
    }

    fn sample_block(previous_hash: &str) -> Block {
        let transactions = vec![Transaction::coinbase(Address::from("miner"), 100)];
        Block::new(
            fixed_time(1_700_000_000_000),
            BlockData::Transactions(transactions),
            previous_hash.to_string(),
            &Sha256Provider,
        )
    }

    #[test]
    fn test_new_block() {
        let block = sample_block("previous_hash");

        assert_eq!(block.nonce, 0);
        assert_eq!(block.difficulty, 0);
        assert_eq!(block.previous_hash, "previous_hash");
        assert_eq!(block.hash, block.calculate_hash(&Sha256Provider));
        assert_eq!(block.hash.len(), 64);
        assert_eq!(block.signature, Signature::Unsigned);
    }

    #[test]
    fn test_hash_input_layout() {
        let block = Block::new(
            fixed_time(42),
            BlockData::Transactions(Vec::new()),
            "abc".to_string(),
            &Sha256Provider,
        );

        assert_eq!(block.hash_input(), "abc42[]0");
    }

    #[test]
    fn test_empty_payload_hashes_deterministically() {
        let make = || {
            Block::new(
                fixed_time(1_000),
                BlockData::Transactions(Vec::new()),
                "prev".to_string(),
                &Sha256Provider,
            )
        };

        assert_eq!(make().hash, make().hash);
    }

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis(fixed_time(1_000), &Sha256Provider);

        assert_eq!(genesis.previous_hash, GENESIS_PREVIOUS_HASH);
        assert_eq!(genesis.data, BlockData::Genesis(GENESIS_DATA.to_string()));
        assert!(genesis.is_genesis());
        assert!(genesis.transactions().is_empty());
        assert_eq!(genesis.hash_input(), "01000\"Genesis Block\"0");
    }

    #[test]
    fn test_mining_produces_leading_zeros() {
        let mut block = sample_block("prev");
        let result = block.mine(2, &Sha256Provider).unwrap();

        assert!(block.hash.starts_with("00"));
        assert!(block.is_valid_hash(2));
        assert_eq!(block.difficulty, 2);
        assert_eq!(block.hash, block.calculate_hash(&Sha256Provider));
        assert_eq!(result.hash, block.hash);
        assert_eq!(result.nonce, block.nonce);
        assert_eq!(result.attempts, block.nonce);
    }

    #[test]
    fn test_difficulty_zero_returns_immediately() {
        let mut block = sample_block("prev");
        let original_hash = block.hash.clone();

        let result = block.mine(0, &Sha256Provider).unwrap();

        assert_eq!(result.nonce, 0);
        assert_eq!(result.attempts, 0);
        assert_eq!(block.hash, original_hash);
        assert!(block.is_valid_hash(0));
    }

    #[test]
    fn test_expected_work_grows_with_difficulty() {
        let total_attempts = |difficulty: u32| -> u64 {
            (0..8)
                .map(|i| {
                    let mut block = sample_block(&format!("prev-{}", i));
                    block.mine(difficulty, &Sha256Provider).unwrap().attempts
                })
                .sum()
        };

        assert!(total_attempts(2) > total_attempts(1));
    }

    #[test]
    fn test_invalid_when_mutated() {
        let mut block = sample_block("prev");
        block.mine(1, &Sha256Provider).unwrap();
        let mined_hash = block.hash.clone();

        block.data = BlockData::Transactions(vec![Transaction::coinbase(
            Address::from("forger"),
            1_000_000,
        )]);

        assert_ne!(mined_hash, block.calculate_hash(&Sha256Provider));
    }

    #[test]
    fn test_sign_and_verify() {
        let secret = LedgerSecret::from_bytes(b"block-secret").unwrap();
        let mut block = sample_block("prev");

        assert!(block.verify_signature(&Sha256Provider, &secret));

        block.sign(&Sha256Provider, &secret);
        assert!(block.signature.is_signed());
        assert!(block.verify_signature(&Sha256Provider, &secret));

        block.nonce += 1;
        assert!(!block.verify_signature(&Sha256Provider, &secret));
    }

    #[test]
    fn test_signature_covers_recorded_difficulty() {
        let secret = LedgerSecret::from_bytes(b"block-secret").unwrap();
        let mut block = sample_block("prev");
        block.mine(2, &Sha256Provider).unwrap();
        block.sign(&Sha256Provider, &secret);

        block.difficulty = 1;

        assert!(block.is_valid_hash(block.difficulty));
        assert_eq!(block.hash, block.calculate_hash(&Sha256Provider));
        assert!(!block.verify_signature(&Sha256Provider, &secret));
    }

    #[test]
    fn test_unreachable_difficulty_is_rejected() {
        let mut block = sample_block("prev");
        let before = block.clone();

        assert!(matches!(
            block.mine(65, &Sha256Provider),
            Err(MiningError::UnreachableDifficulty(65))
        ));
        assert_eq!(block, before);
    }
}
