//! Read-only access to normalized transactions

use crate::types::Transaction;
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Filter applied when reading transactions from a source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionQuery {
    /// Inclusive lower bound
    pub from: Option<NaiveDate>,
    /// Inclusive upper bound
    pub to: Option<NaiveDate>,
    pub product_line_id: Option<String>,
}

impl TransactionQuery {
    pub fn between(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            product_line_id: None,
        }
    }

    pub fn product_line(mut self, product_line_id: &str) -> Self {
        self.product_line_id = Some(product_line_id.to_string());
        self
    }

    pub fn matches(&self, transaction: &Transaction) -> bool {
        if matches!(self.from, Some(from) if transaction.timestamp < from) {
            return false;
        }
        if matches!(self.to, Some(to) if transaction.timestamp > to) {
            return false;
        }
        match &self.product_line_id {
            Some(line) => transaction.product_line_id.as_deref() == Some(line.as_str()),
            None => true,
        }
    }
}

/// Tabular data source of transactions keyed by platform
pub trait TransactionSource {
    /// Transactions of a platform matching the query
    fn query(&self, platform_id: &str, query: &TransactionQuery) -> Vec<Transaction>;

    /// Every transaction of a platform
    fn get_transactions(&self, platform_id: &str) -> Vec<Transaction> {
        self.query(platform_id, &TransactionQuery::default())
    }

    /// Platforms with at least one transaction
    fn platforms(&self) -> Vec<String>;
}

/// In-memory transaction table grouped by platform
#[derive(Debug, Clone, Default)]
pub struct TransactionStore {
    by_platform: BTreeMap<String, Vec<Transaction>>,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_transactions(transactions: impl IntoIterator<Item = Transaction>) -> Self {
        let mut store = Self::new();
        store.extend(transactions);
        store
    }

    pub fn extend(&mut self, transactions: impl IntoIterator<Item = Transaction>) {
        for transaction in transactions {
            self.by_platform
                .entry(transaction.platform_id.clone())
                .or_default()
                .push(transaction);
        }
    }

    pub fn len(&self) -> usize {
        self.by_platform.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransactionSource for TransactionStore {
    fn query(&self, platform_id: &str, query: &TransactionQuery) -> Vec<Transaction> {
        self.by_platform
            .get(platform_id)
            .map(|rows| rows.iter().filter(|t| query.matches(t)).cloned().collect())
            .unwrap_or_default()
    }

    fn platforms(&self) -> Vec<String> {
        self.by_platform.keys().cloned().collect()
    }
}
