// Blockchain module
//
// This module contains the core ledger implementation including:
// - Block structure and proof of work
// - Transaction structure
// - Pending transaction pool
// - Balance index
// - Difficulty controller
// - Hashing and signing utilities

pub mod balance;
pub mod block;
pub mod chain;
pub mod crypto;
pub mod difficulty;
pub mod mining;
pub mod pool;
pub mod transaction;

// Re-export main components for easier access
pub use balance::{BalanceError, BalanceIndex};
pub use block::{Block, BlockData};
pub use chain::{
    BlockSnapshot, Blockchain, BlockchainError, ChainSnapshot, ChainViolation, MiningStats,
};
pub use crypto::{Address, Blake3Provider, HashProvider, LedgerSecret, Sha256Provider, Signature};
pub use difficulty::DifficultyController;
pub use mining::{CancellationToken, MiningError, MiningOptions, MiningResult};
pub use pool::TransactionPool;
pub use transaction::{Transaction, TransactionError};
