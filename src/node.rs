use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{FieldNotFound, Message};
use crate::router::{Router, RouterError};

/// The raw callable behind a node.
pub type NodeFn = Arc<dyn Fn(&Message) -> Result<Output, NodeError> + Send + Sync>;

/// A single thing a node emits: one value, a tuple of values, or nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Value(Value),
    Tuple(Vec<Value>),
    /// Suppresses propagation of this output.
    NoResult,
}

impl Item {
    pub fn is_no_result(&self) -> bool {
        matches!(self, Item::NoResult)
    }

    /// The positional values of this item. A scalar counts as a 1-tuple.
    pub fn into_values(self) -> Vec<Value> {
        match self {
            Item::Value(v) => vec![v],
            Item::Tuple(vs) => vs,
            Item::NoResult => Vec::new(),
        }
    }
}

macro_rules! item_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Item {
                fn from(value: $ty) -> Self {
                    Item::Value(Value::from(value))
                }
            }
        )*
    };
}

item_from!(bool, i32, i64, u32, u64, usize, f64, String, &str, Value);

/// Build an `Item::Tuple` from a list of JSON-convertible values.
#[macro_export]
macro_rules! tuple {
    ($($value:expr),* $(,)?) => {
        $crate::node::Item::Tuple(vec![$(::serde_json::Value::from($value)),*])
    };
}

pub type Emission = Box<dyn Iterator<Item = Result<Item, NodeError>> + Send>;

/// What a node body hands back to the router.
pub enum Output {
    /// Direct return: exactly one item.
    Return(Item),
    /// Multi-emit: a lazy sequence, drained completely before anything is routed.
    Yield(Emission),
}

impl Output {
    pub fn no_result() -> Self {
        Output::Return(Item::NoResult)
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Output::Return(Item::Value(value.into()))
    }

    pub fn tuple(values: Vec<Value>) -> Self {
        Output::Return(Item::Tuple(values))
    }

    /// Multi-emit from an infallible sequence of items.
    pub fn yielding<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Into<Item> + 'static,
    {
        Output::Yield(Box::new(items.into_iter().map(|item| Ok(item.into()))))
    }

    /// Multi-emit from a sequence that may fail partway through production.
    pub fn try_yielding<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Result<Item, NodeError>>,
        I::IntoIter: Send + 'static,
    {
        Output::Yield(Box::new(items.into_iter()))
    }
}

impl From<Item> for Output {
    fn from(item: Item) -> Self {
        Output::Return(item)
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Return(item) => f.debug_tuple("Return").field(item).finish(),
            Output::Yield(_) => f.write_str("Yield(..)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeError {
    InvalidInput(String),
    MissingField(String),
    ExecutionFailed(String),
    Internal(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            NodeError::MissingField(field) => {
                write!(f, "\"{}\" is not included in this message", field)
            }
            NodeError::ExecutionFailed(msg) => write!(f, "Processing error: {}", msg),
            NodeError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<FieldNotFound> for NodeError {
    fn from(err: FieldNotFound) -> Self {
        NodeError::MissingField(err.0)
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::InvalidInput(err.to_string())
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::ExecutionFailed(err.to_string())
    }
}

/// Everything the router needs to know about a node apart from its body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    /// Output fields, in the order the node returns its values.
    pub fields: Vec<String>,
    /// Origins to subscribe to, as regular expressions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscribe: Vec<String>,
    /// Origins to ignore even when a subscribe pattern matches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub entry_point: bool,
}

impl NodeSpec {
    pub fn new<N, F, S>(name: N, fields: F) -> Self
    where
        N: Into<String>,
        F: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn subscribe(mut self, pattern: impl Into<String>) -> Self {
        self.subscribe.push(pattern.into());
        self
    }

    pub fn ignore(mut self, pattern: impl Into<String>) -> Self {
        self.ignore.push(pattern.into());
        self
    }

    pub fn entry_point(mut self) -> Self {
        self.entry_point = true;
        self
    }
}

/// A registered node.
#[derive(Clone)]
pub struct RegisteredNode {
    pub name: String,
    pub fields: Vec<String>,
    pub func: NodeFn,
}

impl fmt::Debug for RegisteredNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredNode")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .finish()
    }
}

/// Returned by registration; calls the node through the full pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    name: String,
}

impl NodeHandle {
    pub(crate) fn new(name: String) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke(&self, router: &Router, message: Message) -> Result<Vec<Message>, RouterError> {
        router.invoke(&self.name, message)
    }

    /// Invoke with call-style arguments, see [`Message::from_call`].
    pub fn call(
        &self,
        router: &Router,
        args: &[Value],
        kwargs: serde_json::Map<String, Value>,
    ) -> Result<Vec<Message>, RouterError> {
        router.invoke(&self.name, Message::from_call(args, kwargs)?)
    }
}
