use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::message::{Message, TRANSACTION_ID_FIELD};
use crate::node::NodeError;

/// Compensation for one completed transactional call. Receives the messages
/// that call produced.
pub type RollbackFn = Arc<dyn Fn(&[Message]) -> Result<(), NodeError> + Send + Sync>;

/// Bookkeeping behind `Router::transaction`.
///
/// Implementations own transaction membership, rollback functions and the
/// per-id saga state. The router only drives the calls.
pub trait TransactionHandler: Send + Sync {
    fn add_transaction(&self, transaction: &str, node: &str);
    fn add_rollback(&self, transaction: &str, node: &str, rollback: RollbackFn);
    /// Names of every transaction `node` is a member of.
    fn transactions_for(&self, node: &str) -> Vec<String>;

    /// Reuse the id already carried by `message`, or assign a fresh one.
    fn set_transaction_id(&self, message: Message) -> (String, Message) {
        if let Some(id) = message.transaction_id() {
            return (id.to_string(), message);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let message = message.with_field(TRANSACTION_ID_FIELD, Value::String(id.clone()));
        (id, message)
    }

    fn start_call(&self, transaction_id: &str, node: &str, message: &Message);
    fn finish_call(&self, transaction_id: &str, node: &str, produced: &[Message]);
    /// Compensate the completed calls of the other members of every
    /// transaction `node` belongs to. Returns how many rollbacks ran.
    fn rollback(&self, transaction_id: &str, node: &str) -> usize;
    /// Called once the frame that opened `transaction_id` has returned.
    fn close(&self, _transaction_id: &str) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallMarker {
    pub node: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedStep {
    pub node: String,
    pub produced: Vec<Message>,
    pub started: Option<DateTime<Utc>>,
    pub finished: DateTime<Utc>,
}

/// Saga state for one transaction id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionRecord {
    pub started: Vec<CallMarker>,
    /// Completed calls, oldest first.
    pub completed: Vec<CompletedStep>,
    /// Completed calls that have since been compensated, in rollback order.
    pub compensated: Vec<CompletedStep>,
}

impl TransactionRecord {
    /// Nodes that started under this id and have not finished.
    pub fn in_flight(&self) -> Vec<String> {
        let mut open: Vec<String> = self.started.iter().map(|m| m.node.clone()).collect();
        for step in self.completed.iter().chain(&self.compensated) {
            if let Some(pos) = open.iter().position(|n| n == &step.node) {
                open.remove(pos);
            }
        }
        open
    }
}

/// Process-local transaction handler.
#[derive(Default)]
pub struct InMemoryTransactionHandler {
    /// node -> transaction names
    memberships: DashMap<String, BTreeSet<String>>,
    /// (transaction, node) -> rollback
    rollbacks: DashMap<(String, String), RollbackFn>,
    records: DashMap<String, TransactionRecord>,
    keep_history: bool,
}

impl InMemoryTransactionHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Keep records after their transaction closes, for inspection.
    pub fn with_history() -> Arc<Self> {
        Arc::new(Self {
            keep_history: true,
            ..Default::default()
        })
    }

    pub fn record(&self, transaction_id: &str) -> Option<TransactionRecord> {
        self.records.get(transaction_id).map(|r| r.clone())
    }

    pub fn transaction_ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.key().clone()).collect()
    }

    pub fn forget(&self, transaction_id: &str) -> Option<TransactionRecord> {
        self.records.remove(transaction_id).map(|(_, r)| r)
    }

    pub fn has_rollback(&self, transaction: &str, node: &str) -> bool {
        self.rollbacks
            .contains_key(&(transaction.to_string(), node.to_string()))
    }

    fn shares_transaction(&self, node: &str, transactions: &BTreeSet<String>) -> bool {
        self.memberships
            .get(node)
            .is_some_and(|m| m.iter().any(|t| transactions.contains(t)))
    }
}

impl fmt::Debug for InMemoryTransactionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTransactionHandler")
            .field("memberships", &self.memberships)
            .field("rollbacks", &self.rollbacks.len())
            .field("records", &self.records.len())
            .finish()
    }
}

impl TransactionHandler for InMemoryTransactionHandler {
    fn add_transaction(&self, transaction: &str, node: &str) {
        self.memberships
            .entry(node.to_string())
            .or_default()
            .insert(transaction.to_string());
    }

    fn add_rollback(&self, transaction: &str, node: &str, rollback: RollbackFn) {
        self.rollbacks
            .insert((transaction.to_string(), node.to_string()), rollback);
    }

    fn transactions_for(&self, node: &str) -> Vec<String> {
        self.memberships
            .get(node)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn start_call(&self, transaction_id: &str, node: &str, _message: &Message) {
        debug!("transaction {}: started \"{}\"", transaction_id, node);
        self.records
            .entry(transaction_id.to_string())
            .or_default()
            .started
            .push(CallMarker {
                node: node.to_string(),
                at: Utc::now(),
            });
    }

    fn finish_call(&self, transaction_id: &str, node: &str, produced: &[Message]) {
        debug!("transaction {}: finished \"{}\"", transaction_id, node);
        let mut record = self.records.entry(transaction_id.to_string()).or_default();
        let started = record
            .started
            .iter()
            .rev()
            .find(|m| m.node == node)
            .map(|m| m.at);
        record.completed.push(CompletedStep {
            node: node.to_string(),
            produced: produced.to_vec(),
            started,
            finished: Utc::now(),
        });
    }

    fn rollback(&self, transaction_id: &str, node: &str) -> usize {
        let transactions: BTreeSet<String> = self.transactions_for(node).into_iter().collect();

        // pull the steps out first so no lock is held while user code runs
        let to_compensate: Vec<CompletedStep> = {
            let Some(mut record) = self.records.get_mut(transaction_id) else {
                return 0;
            };
            let (undo, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut record.completed)
                .into_iter()
                .partition(|step| {
                    step.node != node && self.shares_transaction(&step.node, &transactions)
                });
            record.completed = keep;
            undo.into_iter().rev().collect()
        };

        let mut ran = 0;
        for step in &to_compensate {
            for transaction in &transactions {
                let key = (transaction.clone(), step.node.clone());
                let Some(rollback) = self.rollbacks.get(&key).map(|r| r.clone()) else {
                    continue;
                };
                info!(
                    "transaction {}: rolling back \"{}\" for \"{}\"",
                    transaction_id, step.node, transaction
                );
                if let Err(err) = rollback(&step.produced) {
                    error!(
                        "transaction {}: rollback of \"{}\" failed: {}",
                        transaction_id, step.node, err
                    );
                }
                ran += 1;
            }
        }

        if let Some(mut record) = self.records.get_mut(transaction_id) {
            record.compensated.extend(to_compensate);
        }
        ran
    }

    fn close(&self, transaction_id: &str) {
        if !self.keep_history {
            self.records.remove(transaction_id);
        }
    }
}
