//! A single-node proof-of-work ledger.
//!
//! Transactions are admitted into a pending pool, batched into blocks by a
//! nonce search and committed to an append-only hash chain. Balances are
//! served from an index kept in step with the chain, and the whole chain can
//! be audited at any time.

pub mod blockchain;
pub mod config;

pub use blockchain::{
    Address, Block, Blockchain, BlockchainError, CancellationToken, ChainViolation, HashProvider,
    LedgerSecret, MiningResult, Transaction, TransactionError,
};
pub use config::{ConfigError, HashAlgorithm, LedgerConfig};
