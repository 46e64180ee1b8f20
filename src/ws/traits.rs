//! Core traits for message dispatch.

use std::future::Future;

use crate::types::Message;

/// Receives inbound messages selected by a subscription.
///
/// Implemented for every `Fn(&Message) + Send + Sync` closure, so most callers never name this
/// trait:
///
/// ```ignore
/// let id = connection.subscribe("chat", |message: &Message| {
///     println!("chat: {}", message.data);
/// });
/// ```
///
/// Handlers run on the connection's reader task. A handler that panics is caught and logged and
/// does not prevent delivery to the remaining subscribers. Long-running work belongs in an
/// [`AsyncHandler`], which is spawned rather than awaited.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: &Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    fn handle(&self, message: &Message) {
        self(message);
    }
}

/// Adapts an `async` closure into a fire-and-forget [`MessageHandler`].
///
/// Each matching message spawns the returned future on the current tokio runtime; dispatch moves
/// on to the next subscriber without waiting for it.
#[derive(Debug, Clone)]
pub struct AsyncHandler<F>(F);

impl<F> AsyncHandler<F> {
    pub const fn new(handler: F) -> Self {
        Self(handler)
    }
}

impl<F, Fut> MessageHandler for AsyncHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, message: &Message) {
        drop(tokio::spawn((self.0)(message.clone())));
    }
}
