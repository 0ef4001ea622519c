// src/router.rs

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::message::{FieldNotFound, Message, ORIGIN_FIELD, TRANSACTION_ID_FIELD};
use crate::node::{Item, NodeError, NodeFn, NodeHandle, NodeSpec, Output, RegisteredNode};
use crate::transaction::{RollbackFn, TransactionHandler};

pub mod invoker;
pub mod queue;
pub mod resolver;

pub use invoker::{DirectInvoker, Invoker};
pub use resolver::{ENTRY_POINT, RouteResolver, RouteTable};

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    FieldNotFound(#[from] FieldNotFound),

    #[error("\"{0}\" has no associated fields")]
    UnknownFieldSet(String),

    #[error("\"{node}\" declares {expected} fields but returned {got} values")]
    FieldArity {
        node: String,
        expected: usize,
        got: usize,
    },

    #[error("no node registered as \"{0}\"")]
    UnknownNode(String),

    #[error("node \"{node}\" failed: {source}")]
    NodeExecution {
        node: String,
        #[source]
        source: NodeError,
    },

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("enqueue failed: {0}")]
    Enqueue(String),
}

impl RouterError {
    /// The node error at the bottom of this failure, if a node body raised it.
    pub fn node_error(&self) -> Option<&NodeError> {
        match self {
            RouterError::NodeExecution { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Holds the node registry and the route table, and dispatches messages
/// along it.
pub struct Router {
    nodes: DashMap<String, Arc<RegisteredNode>>,
    resolver: RwLock<RouteResolver>,
    invoker: Arc<dyn Invoker>,
    transactions: Option<Arc<dyn TransactionHandler>>,
    routing_enabled: AtomicBool,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("nodes", &self.nodes.len())
            .field("routes", &*self.read_resolver())
            .field("routing_enabled", &self.routing_enabled())
            .finish()
    }
}

impl Router {
    /// A router that calls destinations directly and has no transaction handler.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    fn read_resolver(&self) -> RwLockReadGuard<'_, RouteResolver> {
        self.resolver.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_resolver(&self) -> RwLockWriteGuard<'_, RouteResolver> {
        self.resolver.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a node and recompute the route table.
    ///
    /// Registering an existing name replaces the earlier node and its rules.
    pub fn register<F>(&self, spec: NodeSpec, func: F) -> Result<NodeHandle, RouterError>
    where
        F: Fn(&Message) -> Result<Output, NodeError> + Send + Sync + 'static,
    {
        self.register_fn(spec, Arc::new(func))
    }

    pub fn register_fn(&self, spec: NodeSpec, func: NodeFn) -> Result<NodeHandle, RouterError> {
        // patterns are validated by the resolver before anything is stored
        self.write_resolver().register(
            &spec.name,
            &spec.subscribe,
            &spec.ignore,
            spec.entry_point,
        )?;

        let node = RegisteredNode {
            name: spec.name.clone(),
            fields: spec.fields,
            func,
        };
        if self.nodes.insert(spec.name.clone(), Arc::new(node)).is_some() {
            debug!("\"{}\" registered again, replacing it", spec.name);
        }

        info!("registered {}", spec.name);
        Ok(NodeHandle::new(spec.name))
    }

    pub fn node(&self, name: &str) -> Option<Arc<RegisteredNode>> {
        self.nodes.get(name).map(|n| n.value().clone())
    }

    pub fn node_names(&self) -> BTreeSet<String> {
        self.read_resolver().names().clone()
    }

    pub fn fields(&self, name: &str) -> Option<Vec<String>> {
        self.nodes.get(name).map(|n| n.fields.clone())
    }

    /// Snapshot of the current route table.
    pub fn routes(&self) -> RouteTable {
        self.read_resolver().routes().clone()
    }

    pub fn destinations(&self, origin: &str) -> BTreeSet<String> {
        self.read_resolver()
            .destinations(origin)
            .cloned()
            .unwrap_or_default()
    }

    pub fn regenerate_routes(&self) {
        self.write_resolver().regenerate();
    }

    pub fn disable_routing(&self) {
        self.routing_enabled.store(false, Ordering::SeqCst);
    }

    pub fn enable_routing(&self) {
        self.routing_enabled.store(true, Ordering::SeqCst);
    }

    pub fn routing_enabled(&self) -> bool {
        self.routing_enabled.load(Ordering::SeqCst)
    }

    /// Route a message to every node marked as an entry point.
    pub fn call(&self, message: Message) -> Result<(), RouterError> {
        info!("calling entry point with {}", message);
        self.route(ENTRY_POINT, &message)
    }

    /// Mark `node` as a member of `transaction`.
    pub fn transaction(&self, transaction: &str, node: &str) -> Result<(), RouterError> {
        self.add_to_transaction(transaction, node, None)
    }

    /// Mark `node` as a member of `transaction`, compensated by `rollback`
    /// when a later member of the same transaction fails.
    pub fn transaction_with_rollback<F>(
        &self,
        transaction: &str,
        node: &str,
        rollback: F,
    ) -> Result<(), RouterError>
    where
        F: Fn(&[Message]) -> Result<(), NodeError> + Send + Sync + 'static,
    {
        self.add_to_transaction(transaction, node, Some(Arc::new(rollback)))
    }

    fn add_to_transaction(
        &self,
        transaction: &str,
        node: &str,
        rollback: Option<RollbackFn>,
    ) -> Result<(), RouterError> {
        let Some(handler) = &self.transactions else {
            return Err(RouterError::Configuration(
                "no transaction handler is configured on this router".to_string(),
            ));
        };
        if !self.nodes.contains_key(node) {
            return Err(RouterError::Configuration(format!(
                "transactions may only be applied to nodes, \"{node}\" is not one"
            )));
        }

        handler.add_transaction(transaction, node);
        if let Some(rollback) = rollback {
            handler.add_rollback(transaction, node, rollback);
        }
        debug!("\"{}\" joined transaction \"{}\"", node, transaction);
        Ok(())
    }

    pub fn transaction_handler(&self) -> Option<&Arc<dyn TransactionHandler>> {
        self.transactions.as_ref()
    }

    /// Run a node through the full pipeline: execute, wrap, route.
    ///
    /// Returns the messages the node produced (empty when it suppressed its
    /// output with `NoResult`).
    #[tracing::instrument(skip(self, message))]
    pub fn invoke(&self, name: &str, message: Message) -> Result<Vec<Message>, RouterError> {
        let node = self
            .node(name)
            .ok_or_else(|| RouterError::UnknownNode(name.to_string()))?;

        let handler = match &self.transactions {
            Some(handler) if !handler.transactions_for(name).is_empty() => handler,
            _ => return self.execute(&node, message),
        };

        let opened_here = message.transaction_id().is_none();
        let (transaction_id, message) = handler.set_transaction_id(message);
        handler.start_call(&transaction_id, name, &message);

        let result = self.execute(&node, message);
        match &result {
            Ok(produced) => handler.finish_call(&transaction_id, name, produced),
            Err(err) => {
                warn!(
                    "transaction {}: \"{}\" failed, rolling back: {}",
                    transaction_id, name, err
                );
                handler.rollback(&transaction_id, name);
            }
        }
        if opened_here {
            handler.close(&transaction_id);
        }
        result
    }

    fn execute(&self, node: &RegisteredNode, message: Message) -> Result<Vec<Message>, RouterError> {
        info!("calling \"{}\" with {}", node.name, message);
        let transaction_id = message.get(TRANSACTION_ID_FIELD).ok().cloned();

        let output = (node.func)(&message).map_err(|source| RouterError::NodeExecution {
            node: node.name.clone(),
            source,
        })?;

        let results = match output {
            Output::Return(Item::NoResult) => return Ok(Vec::new()),
            Output::Return(item) => {
                let wrapped = self.wrap_result(&node.name, item, transaction_id.as_ref())?;
                debug!("\"{}\" returned single value {}", node.name, wrapped);
                vec![wrapped]
            }
            // drain the whole sequence before routing anything, so a failure
            // partway through never leaks a partial emission downstream
            Output::Yield(items) => {
                let mut results = Vec::new();
                for item in items {
                    let item = item.map_err(|source| RouterError::NodeExecution {
                        node: node.name.clone(),
                        source,
                    })?;
                    if item.is_no_result() {
                        continue;
                    }
                    results.push(self.wrap_result(&node.name, item, transaction_id.as_ref())?);
                }
                debug!("\"{}\" yielded {} items", node.name, results.len());
                results
            }
        };

        for result in &results {
            self.route(&node.name, result)?;
        }
        Ok(results)
    }

    /// Zip a node's return value with its declared fields.
    pub fn wrap_result(
        &self,
        name: &str,
        item: Item,
        transaction_id: Option<&Value>,
    ) -> Result<Message, RouterError> {
        let fields = self
            .fields(name)
            .filter(|fields| !fields.is_empty())
            .ok_or_else(|| RouterError::UnknownFieldSet(name.to_string()))?;

        let values = item.into_values();
        if values.len() != fields.len() {
            return Err(RouterError::FieldArity {
                node: name.to_string(),
                expected: fields.len(),
                got: values.len(),
            });
        }

        let message = Message::from_pairs(fields.into_iter().zip(values));
        Ok(match transaction_id {
            Some(id) => message.with_field(TRANSACTION_ID_FIELD, id.clone()),
            None => message,
        })
    }

    /// Dispatch `message` to every current subscriber of `origin`.
    pub fn route(&self, origin: &str, message: &Message) -> Result<(), RouterError> {
        if !self.routing_enabled() {
            return Ok(());
        }

        // copy the destinations out so the table lock is not held while they run
        let destinations = match self.read_resolver().destinations(origin) {
            Some(destinations) => destinations.clone(),
            None => return Ok(()),
        };

        for destination in &destinations {
            debug!("routing \"{}\" -> \"{}\"", origin, destination);
            self.dispatch(origin, destination, message)?;
        }
        Ok(())
    }

    /// Hand one message to one destination through the configured invoker.
    pub fn dispatch(
        &self,
        origin: &str,
        destination: &str,
        message: &Message,
    ) -> Result<(), RouterError> {
        let message = message.with_field(ORIGIN_FIELD, Value::String(origin.to_string()));
        self.invoker.invoke(self, origin, destination, message)
    }
}

#[derive(Default)]
pub struct RouterBuilder {
    invoker: Option<Arc<dyn Invoker>>,
    transactions: Option<Arc<dyn TransactionHandler>>,
    routing_enabled: Option<bool>,
}

impl RouterBuilder {
    pub fn invoker(mut self, invoker: Arc<dyn Invoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn transactions(mut self, handler: Arc<dyn TransactionHandler>) -> Self {
        self.transactions = Some(handler);
        self
    }

    pub fn routing_enabled(mut self, enabled: bool) -> Self {
        self.routing_enabled = Some(enabled);
        self
    }

    pub fn build(self) -> Router {
        Router {
            nodes: DashMap::new(),
            resolver: RwLock::new(RouteResolver::new()),
            invoker: self.invoker.unwrap_or_else(|| Arc::new(DirectInvoker)),
            transactions: self.transactions,
            routing_enabled: AtomicBool::new(self.routing_enabled.unwrap_or(true)),
        }
    }
}
