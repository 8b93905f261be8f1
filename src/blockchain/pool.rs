use super::transaction::Transaction;

/// Transactions admitted by the ledger and waiting for the next block.
///
/// Inclusion order is admission order.
#[derive(Debug, Clone, Default)]
pub struct TransactionPool {
    transactions: Vec<Transaction>,
}

impl TransactionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an already validated transaction
    pub fn admit(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
    }

    /// Takes every pending transaction, leaving the pool empty
    pub fn drain_for_block(&mut self) -> Vec<Transaction> {
        std::mem::take(&mut self.transactions)
    }

    /// Puts drained transactions back ahead of anything admitted since
    pub fn restore(&mut self, mut drained: Vec<Transaction>) {
        drained.append(&mut self.transactions);
        self.transactions = drained;
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Address;

    fn transfer(amount: i64) -> Transaction {
        Transaction::new(Address::from("alice"), Address::from("bob"), amount)
    }

    #[test]
    fn test_admission_order_is_preserved() {
        let mut pool = TransactionPool::new();
        pool.admit(transfer(1));
        pool.admit(transfer(2));
        pool.admit(transfer(3));

        let amounts: Vec<i64> = pool.transactions().iter().map(|tx| tx.amount).collect();
        assert_eq!(amounts, vec![1, 2, 3]);
    }

    #[test]
    fn test_drain_clears_pool() {
        let mut pool = TransactionPool::new();
        pool.admit(transfer(1));
        pool.admit(transfer(2));

        let drained = pool.drain_for_block();

        assert_eq!(drained.len(), 2);
        assert!(pool.is_empty());
        assert!(pool.drain_for_block().is_empty());
    }

    #[test]
    fn test_restore_puts_drained_first() {
        let mut pool = TransactionPool::new();
        pool.admit(transfer(1));
        pool.admit(transfer(2));

        let drained = pool.drain_for_block();
        pool.admit(transfer(3));
        pool.restore(drained);

        let amounts: Vec<i64> = pool.transactions().iter().map(|tx| tx.amount).collect();
        assert_eq!(amounts, vec![1, 2, 3]);
        assert_eq!(pool.len(), 3);
    }
}
