use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use super::balance::{balance_from_chain, BalanceError, BalanceIndex};
use super::block::{timestamp_now, Block, BlockData};
use super::crypto::{Address, HashProvider, LedgerSecret};
use super::difficulty::DifficultyController;
use super::mining::{rate, CancellationToken, MiningError, MiningOptions, MiningResult};
use super::pool::TransactionPool;
use super::transaction::{Transaction, TransactionError};
use crate::config::{ConfigError, LedgerConfig};

/// Length of the network id derived at construction
const NETWORK_ID_LEN: usize = 16;

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Mining error: {0}")]
    MiningError(#[from] MiningError),

    #[error("Balance index error: {0}")]
    BalanceError(#[from] BalanceError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),
}

/// The first invariant a chain audit found broken
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainViolation {
    #[error("Genesis block is malformed")]
    InvalidGenesis,

    #[error("Block {index} hash does not match its contents")]
    HashMismatch { index: usize },

    #[error("Block {index} does not link to the previous block")]
    BrokenLink { index: usize },

    #[error("Block {index} does not satisfy proof-of-work at difficulty {difficulty}")]
    InsufficientWork { index: usize, difficulty: u32 },

    #[error("Block {index} carries an invalid signature")]
    InvalidBlockSignature { index: usize },

    #[error("Transaction {tx_hash} in block {index} does not match its contents")]
    TransactionHashMismatch { index: usize, tx_hash: String },

    #[error("Transaction {tx_hash} in block {index} carries an invalid signature")]
    InvalidTransactionSignature { index: usize, tx_hash: String },

    #[error("Replaying the chain failed: {0}")]
    BalanceReplay(BalanceError),

    #[error("Balance of {address} is {indexed} in the index but {replayed} on replay")]
    BalanceMismatch {
        address: Address,
        indexed: i64,
        replayed: i64,
    },
}

/// Cumulative mining statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MiningStats {
    /// Committed blocks, genesis included
    pub total_blocks: u64,
    pub total_mining_time: Duration,
    pub total_attempts: u64,
    pub last_mining_time: Option<Duration>,
    pub average_hash_rate: f64,
}

impl MiningStats {
    fn new() -> Self {
        MiningStats {
            total_blocks: 1,
            total_mining_time: Duration::ZERO,
            total_attempts: 0,
            last_mining_time: None,
            average_hash_rate: 0.0,
        }
    }

    fn record(&mut self, result: &MiningResult) {
        self.total_blocks += 1;
        self.total_mining_time += result.duration;
        self.total_attempts += result.attempts;
        self.last_mining_time = Some(result.duration);
        self.average_hash_rate = rate(self.total_attempts, self.total_mining_time);
    }
}

/// Exported view of one block; the signature is left out
#[derive(Debug, Clone, Serialize)]
pub struct BlockSnapshot {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub data: BlockData,
    pub previous_hash: String,
    pub hash: String,
    pub nonce: u64,
    pub difficulty: u32,
}

impl From<&Block> for BlockSnapshot {
    fn from(block: &Block) -> Self {
        BlockSnapshot {
            timestamp: block.timestamp,
            data: block.data.clone(),
            previous_hash: block.previous_hash.clone(),
            hash: block.hash.clone(),
            nonce: block.nonce,
            difficulty: block.difficulty,
        }
    }
}

/// Serializable export of the ledger; carries no keying material
#[derive(Debug, Clone, Serialize)]
pub struct ChainSnapshot {
    pub id: Uuid,
    pub network_id: String,
    pub hash_algorithm: &'static str,
    pub difficulty: u32,
    pub mining_stats: MiningStats,
    pub chain: Vec<BlockSnapshot>,
}

/// Represents the blockchain
///
/// A single owner mutates the chain, the pending pool and the balance index;
/// every mutating operation takes `&mut self`.
#[derive(Debug)]
pub struct Blockchain {
    /// Random identity of this ledger instance
    id: Uuid,

    network_id: String,

    /// The chain of blocks, never empty
    chain: Vec<Block>,

    /// Pending transactions to be included in the next block
    pending: TransactionPool,

    balances: BalanceIndex,

    /// Difficulty for the next mined block
    difficulty: u32,

    /// Lowest difficulty a committed block may carry
    min_difficulty: u32,

    mining_reward: i64,

    mining_workers: usize,

    controller: Option<DifficultyController>,

    stats: MiningStats,

    secret: LedgerSecret,

    hasher: Arc<dyn HashProvider>,
}

impl Blockchain {
    /// Creates a new blockchain with a genesis block and default settings
    ///
    /// # Arguments
    ///
    /// * `mining_reward` - Amount minted to the miner of each block
    /// * `initial_difficulty` - Difficulty of the first mined block
    pub fn new(mining_reward: i64, initial_difficulty: u32) -> Result<Self, BlockchainError> {
        let config = LedgerConfig {
            mining_reward,
            initial_difficulty,
            ..LedgerConfig::default()
        };
        Self::from_config(&config)
    }

    /// Creates a new blockchain using the hash backend named in `config`
    pub fn from_config(config: &LedgerConfig) -> Result<Self, BlockchainError> {
        Self::with_hash_provider(config, config.hash_algorithm.provider())
    }

    /// Creates a new blockchain with an injected hash backend and a fresh secret
    pub fn with_hash_provider(
        config: &LedgerConfig,
        hasher: Arc<dyn HashProvider>,
    ) -> Result<Self, BlockchainError> {
        Self::with_components(config, hasher, LedgerSecret::generate())
    }

    /// Creates a new blockchain from explicit parts
    pub fn with_components(
        config: &LedgerConfig,
        hasher: Arc<dyn HashProvider>,
        secret: LedgerSecret,
    ) -> Result<Self, BlockchainError> {
        config.validate()?;

        let id = Uuid::new_v4();
        let created = timestamp_now();
        let mut network_id =
            hasher.digest_hex(format!("{}{}", id, created.timestamp_millis()).as_bytes());
        network_id.truncate(NETWORK_ID_LEN);

        let mut genesis = Block::genesis(created, hasher.as_ref());
        genesis.sign(hasher.as_ref(), &secret);

        let chain = vec![genesis];
        let balances = BalanceIndex::from_chain(&chain)?;

        info!(
            "Genesis block created for ledger {} (network {}, {} hashing)",
            id,
            network_id,
            hasher.name()
        );

        Ok(Blockchain {
            id,
            network_id,
            chain,
            pending: TransactionPool::new(),
            balances,
            difficulty: config.initial_difficulty,
            min_difficulty: config.difficulty.min,
            mining_reward: config.mining_reward,
            mining_workers: config.mining.workers,
            controller: config.difficulty.controller(),
            stats: MiningStats::new(),
            secret,
            hasher,
        })
    }

    /// Gets the last block in the chain
    pub fn latest_block(&self) -> &Block {
        &self.chain[self.chain.len() - 1]
    }

    /// Validates, seals and admits a transaction to the pending pool
    ///
    /// # Returns
    ///
    /// The hash of the admitted transaction. On error the pool is unchanged.
    pub fn create_transaction(
        &mut self,
        mut transaction: Transaction,
    ) -> Result<String, TransactionError> {
        if transaction.amount <= 0 {
            return Err(TransactionError::InvalidAmount(transaction.amount));
        }

        self.check_credit_headroom(&transaction)?;

        match &transaction.from_address {
            Some(sender) => {
                let available = self.get_balance(sender);
                if available < transaction.amount {
                    return Err(TransactionError::InsufficientBalance {
                        address: sender.clone(),
                        required: transaction.amount,
                        available,
                    });
                }
            }
            // Nothing limits how many of these a caller submits.
            None => warn!(
                "Admitting coinbase transaction of {} to {} from outside the miner",
                transaction.amount, transaction.to_address
            ),
        }

        transaction.seal(self.hasher.as_ref(), &self.secret);
        debug!(
            "Transaction {} admitted: {} -> {}: {}",
            transaction.hash,
            transaction
                .from_address
                .as_ref()
                .map(Address::as_str)
                .unwrap_or("coinbase"),
            transaction.to_address,
            transaction.amount
        );

        let hash = transaction.hash.clone();
        self.pending.admit(transaction);
        Ok(hash)
    }

    /// Fails if crediting `transaction` on top of the recipient's confirmed
    /// balance and pending credits would overflow
    fn check_credit_headroom(&self, transaction: &Transaction) -> Result<(), TransactionError> {
        let recipient = &transaction.to_address;
        let pending_credits: i128 = self
            .pending
            .transactions()
            .iter()
            .filter(|pending| &pending.to_address == recipient)
            .map(|pending| i128::from(pending.amount))
            .sum();

        let projected = i128::from(self.get_balance(recipient))
            + pending_credits
            + i128::from(transaction.amount);
        if projected > i128::from(i64::MAX) {
            return Err(TransactionError::BalanceOverflow {
                address: recipient.clone(),
                amount: transaction.amount,
            });
        }
        Ok(())
    }

    /// Mines a new block with the pending transactions plus a reward
    pub fn mine_pending_transactions(
        &mut self,
        reward_address: &Address,
    ) -> Result<MiningResult, BlockchainError> {
        self.mine_pending_transactions_with(reward_address, &CancellationToken::new())
    }

    /// Mines a new block, giving up if `cancel` fires.
    ///
    /// Either the block is committed together with its balance effects, or
    /// nothing changes and the pending pool is left as it was.
    pub fn mine_pending_transactions_with(
        &mut self,
        reward_address: &Address,
        cancel: &CancellationToken,
    ) -> Result<MiningResult, BlockchainError> {
        let height = self.chain.len();
        self.balances.check_next(height)?;

        let hasher = Arc::clone(&self.hasher);
        let mut reward = Transaction::coinbase(reward_address.clone(), self.mining_reward);
        reward.seal(hasher.as_ref(), &self.secret);

        let mut transactions = self.pending.drain_for_block();
        let drained = transactions.len();
        transactions.push(reward);

        let mut block = Block::new(
            timestamp_now(),
            BlockData::Transactions(transactions),
            self.latest_block().hash.clone(),
            hasher.as_ref(),
        );

        info!(
            "Mining block #{} at difficulty {} with {} pending transactions",
            height, self.difficulty, drained
        );

        let options = MiningOptions::new(self.difficulty)
            .with_workers(self.mining_workers)
            .with_cancellation(cancel.clone());

        let result = match block.mine_with(hasher.as_ref(), &options) {
            Ok(result) => result,
            Err(err) => {
                warn!("Mining of block #{} aborted: {}", height, err);
                self.restore_pending(block, drained);
                return Err(err.into());
            }
        };

        block.sign(hasher.as_ref(), &self.secret);

        if let Err(err) = self.balances.apply_block(height, &block) {
            warn!("Block #{} not committed: {}", height, err);
            self.restore_pending(block, drained);
            return Err(err.into());
        }
        self.chain.push(block);
        self.stats.record(&result);
        self.adjust_difficulty(result.duration);

        info!(
            "Block #{} committed: hash {}, nonce {}, {} attempts in {:?} ({:.0} H/s)",
            height, result.hash, result.nonce, result.attempts, result.duration, result.hash_rate
        );

        Ok(result)
    }

    /// Returns a failed block's transactions (minus the reward) to the pool
    fn restore_pending(&mut self, block: Block, drained: usize) {
        let mut transactions = match block.data {
            BlockData::Transactions(transactions) => transactions,
            BlockData::Genesis(_) => Vec::new(),
        };
        transactions.truncate(drained);
        self.pending.restore(transactions);
    }

    fn adjust_difficulty(&mut self, last_mining_time: Duration) {
        let Some(controller) = self.controller else {
            return;
        };

        let next = controller.adjust(self.difficulty, last_mining_time);
        if next > self.difficulty {
            info!("Difficulty raised to {}", next);
        } else if next < self.difficulty {
            info!("Difficulty lowered to {}", next);
        }
        self.difficulty = next;
    }

    /// Gets the balance of an address
    ///
    /// Served from the balance index; if the index is out of step with the
    /// chain the balance is recomputed by scanning every block instead.
    pub fn get_balance(&self, address: &Address) -> i64 {
        if self.balances.height() != self.chain.len() {
            warn!(
                "Balance index is stale (height {}, chain length {}), scanning chain for {}",
                self.balances.height(),
                self.chain.len(),
                address
            );
            return balance_from_chain(&self.chain, address).unwrap_or_else(|err| {
                warn!("Chain scan failed ({}), serving indexed balance", err);
                self.balances.get(address)
            });
        }

        self.balances.get(address)
    }

    /// Every address that appears as sender or recipient in the chain
    pub fn get_all_addresses(&self) -> BTreeSet<Address> {
        let mut addresses = BTreeSet::new();
        for transaction in self.chain.iter().flat_map(Block::transactions) {
            if let Some(sender) = &transaction.from_address {
                addresses.insert(sender.clone());
            }
            addresses.insert(transaction.to_address.clone());
        }
        addresses
    }

    /// Replaces the balance index with one rebuilt from the chain.
    /// On error the current index is kept.
    pub fn rebuild_balances(&mut self) -> Result<(), BalanceError> {
        self.balances.rebuild_from_chain(&self.chain)?;
        info!(
            "Balance index rebuilt from {} blocks ({} addresses)",
            self.chain.len(),
            self.balances.len()
        );
        Ok(())
    }

    /// Validates the blockchain
    ///
    /// # Returns
    ///
    /// true if every audit check passes, false otherwise
    pub fn is_chain_valid(&self) -> bool {
        match self.audit() {
            Ok(()) => {
                info!("Chain audit passed ({} blocks)", self.chain.len());
                true
            }
            Err(violation) => {
                warn!("Chain audit failed: {}", violation);
                false
            }
        }
    }

    /// Recomputes every invariant of the committed chain and reports the
    /// first one that does not hold
    pub fn audit(&self) -> Result<(), ChainViolation> {
        let hasher = self.hasher.as_ref();

        let genesis = self.chain.first().ok_or(ChainViolation::InvalidGenesis)?;
        if !genesis.is_genesis() || genesis.hash != genesis.calculate_hash(hasher) {
            return Err(ChainViolation::InvalidGenesis);
        }
        if !genesis.verify_signature(hasher, &self.secret) {
            return Err(ChainViolation::InvalidBlockSignature { index: 0 });
        }

        for (offset, pair) in self.chain.windows(2).enumerate() {
            let (previous, block) = (&pair[0], &pair[1]);
            let index = offset + 1;

            if block.hash != block.calculate_hash(hasher) {
                return Err(ChainViolation::HashMismatch { index });
            }

            if block.previous_hash != previous.hash {
                return Err(ChainViolation::BrokenLink { index });
            }

            if block.difficulty < self.min_difficulty || !block.is_valid_hash(block.difficulty) {
                return Err(ChainViolation::InsufficientWork {
                    index,
                    difficulty: block.difficulty,
                });
            }

            if !block.verify_signature(hasher, &self.secret) {
                return Err(ChainViolation::InvalidBlockSignature { index });
            }

            for transaction in block.transactions() {
                if transaction.hash != transaction.calculate_hash(hasher) {
                    return Err(ChainViolation::TransactionHashMismatch {
                        index,
                        tx_hash: transaction.hash.clone(),
                    });
                }
                if !transaction.verify_signature(hasher, &self.secret) {
                    return Err(ChainViolation::InvalidTransactionSignature {
                        index,
                        tx_hash: transaction.hash.clone(),
                    });
                }
            }
        }

        let replayed =
            BalanceIndex::from_chain(&self.chain).map_err(ChainViolation::BalanceReplay)?;
        if let Some(mismatch) = self.balances.first_mismatch(&replayed) {
            return Err(ChainViolation::BalanceMismatch {
                address: mismatch.address,
                indexed: mismatch.ours,
                replayed: mismatch.theirs,
            });
        }

        Ok(())
    }

    /// Exports the chain without secrets or block signatures
    pub fn export_chain(&self) -> ChainSnapshot {
        ChainSnapshot {
            id: self.id,
            network_id: self.network_id.clone(),
            hash_algorithm: self.hasher.name(),
            difficulty: self.difficulty,
            mining_stats: self.stats.clone(),
            chain: self.chain.iter().map(BlockSnapshot::from).collect(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// Gets the entire blockchain
    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Gets all pending transactions
    pub fn pending_transactions(&self) -> &[Transaction] {
        self.pending.transactions()
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn mining_reward(&self) -> i64 {
        self.mining_reward
    }

    pub fn mining_stats(&self) -> &MiningStats {
        &self.stats
    }

    pub fn balance_index(&self) -> &BalanceIndex {
        &self.balances
    }

    pub fn hash_provider(&self) -> &dyn HashProvider {
        self.hasher.as_ref()
    }
}
