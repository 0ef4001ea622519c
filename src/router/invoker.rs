use crate::message::Message;

use super::{Router, RouterError};

/// How a dispatched message reaches its destination.
///
/// The router hands every (origin, destination, message) triple to one
/// invoker. Implementations decide whether the destination runs now, later,
/// or somewhere else.
pub trait Invoker: Send + Sync {
    fn invoke(
        &self,
        router: &Router,
        origin: &str,
        destination: &str,
        message: Message,
    ) -> Result<(), RouterError>;
}

/// Runs the destination's pipeline synchronously, depth-first.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectInvoker;

impl Invoker for DirectInvoker {
    fn invoke(
        &self,
        router: &Router,
        _origin: &str,
        destination: &str,
        message: Message,
    ) -> Result<(), RouterError> {
        router.invoke(destination, message).map(|_| ())
    }
}
