//! Regex-routed publish/subscribe dispatch graph.
//!
//! Nodes register with a name, the fields they emit and the origins they
//! subscribe to. The router derives the edges from those patterns and
//! pushes every emitted message to the current subscribers of its origin.

pub mod config;
pub mod graph;
pub mod logger;
pub mod message;
pub mod node;
pub mod router;
pub mod shell;
pub mod transaction;

pub use message::Message;
pub use node::{Item, NodeError, NodeHandle, NodeSpec, Output};
pub use router::{Router, RouterError};
