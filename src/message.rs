use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::node::NodeError;
use crate::router::RouterError;

/// Field the dispatcher stamps on a destination's input with the origin's name.
pub const ORIGIN_FIELD: &str = "_origin";
/// Field carrying the transaction id across transactional hops.
pub const TRANSACTION_ID_FIELD: &str = "_transaction_id";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("\"{0}\" is not included in this message")]
pub struct FieldNotFound(pub String);

/// The unit of data flowing along every edge of the graph.
///
/// A message is an immutable mapping from field name to JSON value. It is
/// never edited in place: `with_field` and `without_field` build new ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message {
    bundle: BTreeMap<String, Value>,
}

impl Message {
    pub fn new(bundle: BTreeMap<String, Value>) -> Self {
        Self { bundle }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Keyword-style construction: `Message::from_pairs([("document", json!("a b"))])`.
    pub fn from_pairs<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self {
            bundle: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Turn the arguments of a node call into a message.
    ///
    /// Accepted shapes, in order:
    /// - a single positional argument which is a JSON object
    /// - no positional arguments and at least one keyword argument
    pub fn from_call(args: &[Value], kwargs: Map<String, Value>) -> Result<Self, RouterError> {
        match (args, kwargs.is_empty()) {
            ([Value::Object(map)], true) => {
                tracing::debug!("called with arg dictionary");
                Ok(Self::from(map.clone()))
            }
            ([], false) => {
                tracing::debug!("called with kwargs");
                Ok(Self::from(kwargs))
            }
            _ => {
                tracing::error!(
                    "from_call could not handle {:?}, {:?}",
                    args,
                    kwargs
                );
                Err(RouterError::Configuration(
                    "pass either keyword arguments or a dictionary argument".to_string(),
                ))
            }
        }
    }

    pub fn get(&self, field: &str) -> Result<&Value, FieldNotFound> {
        self.bundle
            .get(field)
            .ok_or_else(|| FieldNotFound(field.to_string()))
    }

    pub fn get_str(&self, field: &str) -> Result<&str, NodeError> {
        self.get(field)?
            .as_str()
            .ok_or_else(|| NodeError::InvalidInput(format!("\"{field}\" is not a string")))
    }

    pub fn get_i64(&self, field: &str) -> Result<i64, NodeError> {
        self.get(field)?
            .as_i64()
            .ok_or_else(|| NodeError::InvalidInput(format!("\"{field}\" is not an integer")))
    }

    pub fn get_u64(&self, field: &str) -> Result<u64, NodeError> {
        self.get(field)?.as_u64().ok_or_else(|| {
            NodeError::InvalidInput(format!("\"{field}\" is not an unsigned integer"))
        })
    }

    pub fn get_f64(&self, field: &str) -> Result<f64, NodeError> {
        self.get(field)?
            .as_f64()
            .ok_or_else(|| NodeError::InvalidInput(format!("\"{field}\" is not a number")))
    }

    pub fn contains(&self, field: &str) -> bool {
        self.bundle.contains_key(field)
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.bundle
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.bundle.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.bundle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundle.is_empty()
    }

    pub fn origin(&self) -> Option<&str> {
        self.bundle.get(ORIGIN_FIELD).and_then(Value::as_str)
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.bundle.get(TRANSACTION_ID_FIELD).and_then(Value::as_str)
    }

    /// A copy of this message with `field` set to `value`.
    pub fn with_field(&self, field: impl Into<String>, value: Value) -> Self {
        let mut bundle = self.bundle.clone();
        bundle.insert(field.into(), value);
        Self { bundle }
    }

    /// A copy of this message without `field`.
    pub fn without_field(&self, field: &str) -> Self {
        let mut bundle = self.bundle.clone();
        bundle.remove(field);
        Self { bundle }
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.bundle
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// JSON followed by a newline, one framed message for line-based transports.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut line = self.to_json()?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl From<Map<String, Value>> for Message {
    fn from(map: Map<String, Value>) -> Self {
        Self {
            bundle: map.into_iter().collect(),
        }
    }
}

impl From<BTreeMap<String, Value>> for Message {
    fn from(bundle: BTreeMap<String, Value>) -> Self {
        Self { bundle }
    }
}

impl From<Message> for Value {
    fn from(message: Message) -> Self {
        Value::Object(message.bundle.into_iter().collect())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_json() {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self.bundle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_from_pairs() {
        let msg = Message::from_pairs([("x", json!(1)), ("y", json!("two"))]);
        assert_eq!(msg.get("x").unwrap(), &json!(1));
        assert_eq!(msg.get_str("y").unwrap(), "two");
        assert_eq!(msg.len(), 2);
    }

    #[test]
    fn test_missing_field() {
        let msg = Message::from_pairs([("x", json!(1))]);
        let err = msg.get("nope").unwrap_err();
        assert_eq!(err, FieldNotFound("nope".to_string()));
        assert_eq!(err.to_string(), "\"nope\" is not included in this message");
    }

    #[test]
    fn test_typed_getter_rejects_wrong_type() {
        let msg = Message::from_pairs([("x", json!("one"))]);
        assert!(matches!(msg.get_i64("x"), Err(NodeError::InvalidInput(_))));
        assert!(matches!(msg.get_i64("y"), Err(NodeError::MissingField(_))));
    }

    #[test]
    fn test_equality_by_value() {
        let a = Message::from_pairs([("x", json!(1)), ("y", json!(2))]);
        let b = Message::from_pairs([("y", json!(2)), ("x", json!(1))]);
        assert_eq!(a, b);
        assert_ne!(a, b.with_field("z", json!(3)));
    }

    #[test]
    fn test_derivations_do_not_mutate() {
        let a = Message::from_pairs([("x", json!(1))]);
        let b = a.with_field("y", json!(2));
        let c = b.without_field("x");
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 2);
        assert!(!c.contains("x"));
    }

    #[test]
    fn test_from_call_with_dictionary() {
        let msg = Message::from_call(&[json!({"x": 1})], Map::new()).unwrap();
        assert_eq!(msg.get_i64("x").unwrap(), 1);
    }

    #[test]
    fn test_from_call_with_kwargs() {
        let mut kwargs = Map::new();
        kwargs.insert("x".to_string(), json!(1));
        let msg = Message::from_call(&[], kwargs).unwrap();
        assert_eq!(msg.get_i64("x").unwrap(), 1);
    }

    #[test]
    fn test_from_call_rejects_other_shapes() {
        assert!(matches!(
            Message::from_call(&[], Map::new()),
            Err(RouterError::Configuration(_))
        ));
        assert!(matches!(
            Message::from_call(&[json!(1)], Map::new()),
            Err(RouterError::Configuration(_))
        ));

        let mut kwargs = Map::new();
        kwargs.insert("x".to_string(), json!(1));
        assert!(matches!(
            Message::from_call(&[json!({"y": 2})], kwargs),
            Err(RouterError::Configuration(_))
        ));
    }

    #[test]
    fn test_json_encoding_is_a_plain_object() {
        let msg = Message::from_pairs([("word", json!("got"))]);
        assert_eq!(msg.to_json().unwrap(), r#"{"word":"got"}"#);
        assert_eq!(msg.to_json_line().unwrap(), "{\"word\":\"got\"}\n");
        assert_eq!(Message::from_json(r#"{"word":"got"}"#).unwrap(), msg);
    }
}
