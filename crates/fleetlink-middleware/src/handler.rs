//! Local topic handlers.
//!
//! A vehicle only ever stores handlers for its *own* subscriptions; remote
//! subscribers are recorded by identity alone.  Handlers live inside the
//! shared [`TopicRegistry`][crate::registry::TopicRegistry] and are invoked
//! from listener tasks, so they must be `Send + Sync`.

use async_trait::async_trait;
use fleetlink_types::Message;

/// Receives [`MessageKind::Data`][fleetlink_types::MessageKind::Data]
/// messages for a topic the local vehicle subscribed to.
///
/// # Contract
///
/// * `on_message` is awaited by the dispatcher with no registry lock held,
///   so an implementation may call back into
///   [`FleetAgent`][crate::agent::FleetAgent] (for example to publish a
///   reply).
/// * The payload is opaque to FleetLink; decoding it is the handler's job.
#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn on_message(&self, message: &Message);
}

/// Adapts a plain closure into a [`TopicHandler`].
///
/// ```
/// use std::sync::Arc;
/// use fleetlink_middleware::{FnHandler, TopicHandler};
///
/// let handler: Arc<dyn TopicHandler> = Arc::new(FnHandler::new(|msg| {
///     println!("{} says {}", msg.sender, msg.payload);
/// }));
/// ```
pub struct FnHandler<F> {
    callback: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> TopicHandler for FnHandler<F>
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    async fn on_message(&self, message: &Message) {
        (self.callback)(message)
    }
}
