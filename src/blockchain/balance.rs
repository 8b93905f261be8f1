use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use super::block::Block;
use super::crypto::Address;
use super::transaction::Transaction;

/// Errors that can occur while maintaining the balance index
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalanceError {
    #[error("Block at height {got} cannot be applied, index expects height {expected}")]
    OutOfOrder { expected: usize, got: usize },

    #[error("Balance of {address} would leave the representable range")]
    Overflow { address: Address },
}

/// A balance that differs between two indexes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceMismatch {
    pub address: Address,
    pub ours: i64,
    pub theirs: i64,
}

/// Running balance per address, derived from the committed chain.
///
/// The index remembers how many blocks it has applied (its height) and
/// refuses to apply any block other than the next one, so a block can never
/// be counted twice.
#[derive(Debug, Clone, Default)]
pub struct BalanceIndex {
    balances: HashMap<Address, i64>,
    height: usize,
}

impl BalanceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an index by replaying every block of `chain`
    pub fn from_chain(chain: &[Block]) -> Result<Self, BalanceError> {
        let mut index = BalanceIndex::new();
        index.rebuild_from_chain(chain)?;
        Ok(index)
    }

    /// Balance of `address`; addresses without history hold 0
    pub fn get(&self, address: &Address) -> i64 {
        self.lookup(address).unwrap_or(0)
    }

    /// Balance of `address` if the index has seen it
    pub fn lookup(&self, address: &Address) -> Option<i64> {
        self.balances.get(address).copied()
    }

    /// Number of blocks applied so far
    pub fn height(&self) -> usize {
        self.height
    }

    /// Debits senders and credits recipients. Coinbase transactions only credit.
    ///
    /// All or nothing: if any balance would overflow, the index is unchanged.
    pub fn apply(&mut self, transactions: &[Transaction]) -> Result<(), BalanceError> {
        let mut staged: HashMap<Address, i64> = HashMap::new();
        for transaction in transactions {
            if let Some(sender) = &transaction.from_address {
                self.stage(&mut staged, sender, |balance| {
                    balance.checked_sub(transaction.amount)
                })?;
            }
            self.stage(&mut staged, &transaction.to_address, |balance| {
                balance.checked_add(transaction.amount)
            })?;
        }

        self.balances.extend(staged);
        Ok(())
    }

    fn stage(
        &self,
        staged: &mut HashMap<Address, i64>,
        address: &Address,
        update: impl FnOnce(i64) -> Option<i64>,
    ) -> Result<(), BalanceError> {
        let current = staged
            .get(address)
            .copied()
            .unwrap_or_else(|| self.get(address));
        let next = update(current).ok_or_else(|| BalanceError::Overflow {
            address: address.clone(),
        })?;
        staged.insert(address.clone(), next);
        Ok(())
    }

    /// Fails unless `height` is the next block this index expects
    pub fn check_next(&self, height: usize) -> Result<(), BalanceError> {
        if height != self.height {
            return Err(BalanceError::OutOfOrder {
                expected: self.height,
                got: height,
            });
        }
        Ok(())
    }

    /// Applies the block committed at `height`
    pub fn apply_block(&mut self, height: usize, block: &Block) -> Result<(), BalanceError> {
        self.check_next(height)?;
        self.apply(block.transactions())?;
        self.height += 1;
        Ok(())
    }

    /// Replays every block in chain order into a fresh index and swaps it in.
    /// On error the index keeps its previous contents.
    pub fn rebuild_from_chain(&mut self, chain: &[Block]) -> Result<(), BalanceError> {
        let mut rebuilt = BalanceIndex::new();
        for (height, block) in chain.iter().enumerate() {
            rebuilt.apply_block(height, block)?;
        }
        *self = rebuilt;
        Ok(())
    }

    /// First address (in address order) whose balance differs from `other`,
    /// treating absent entries as 0
    pub fn first_mismatch(&self, other: &BalanceIndex) -> Option<BalanceMismatch> {
        let addresses: BTreeSet<&Address> =
            self.balances.keys().chain(other.balances.keys()).collect();

        addresses.into_iter().find_map(|address| {
            let ours = self.get(address);
            let theirs = other.get(address);
            (ours != theirs).then(|| BalanceMismatch {
                address: address.clone(),
                ours,
                theirs,
            })
        })
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.balances.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, i64)> {
        self.balances.iter().map(|(address, balance)| (address, *balance))
    }

    pub fn len(&self) -> usize {
        self.balances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }
}

/// Computes one address's balance by scanning the whole chain
pub fn balance_from_chain(chain: &[Block], address: &Address) -> Result<i64, BalanceError> {
    let overflow = || BalanceError::Overflow {
        address: address.clone(),
    };

    chain
        .iter()
        .flat_map(|block| block.transactions())
        .try_fold(0i64, |mut balance, transaction| -> Result<i64, BalanceError> {
            if transaction.from_address.as_ref() == Some(address) {
                balance = balance
                    .checked_sub(transaction.amount)
                    .ok_or_else(overflow)?;
            }
            if &transaction.to_address == address {
                balance = balance
                    .checked_add(transaction.amount)
                    .ok_or_else(overflow)?;
            }
            Ok(balance)
        })
}
