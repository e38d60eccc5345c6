//! Narrow publish/subscribe capability consumed by the Tasmota link.
//!
//! A [`Bus`] delivers every inbound message whose topic matches a subscribed
//! filter to the handler registered under that `(filter, id)` pair. Handlers
//! are async and are awaited in subscription order, so a transport that
//! dispatches through [`dispatch`] preserves per-topic arrival order.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;

mod filter;
mod local;
mod table;

pub use filter::filter_matches;
pub use local::LocalBus;
pub use table::SubscriptionTable;

/// Identifier disambiguating subscriptions that share a topic filter.
pub type SubscriptionId = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Callback invoked once per matching inbound message until unsubscribed.
pub type Handler = Arc<dyn Fn(BusMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(BusMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| f(message).boxed())
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn subscribe(&self, filter: &str, id: SubscriptionId, handler: Handler)
        -> BusResult<()>;
    async fn unsubscribe(&self, filter: &str, id: SubscriptionId) -> BusResult<()>;
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool, qos: u8) -> BusResult<()>;
    /// Starts background delivery. Only called by the owner of the transport.
    async fn serve(&self) -> BusResult<()>;
    /// Stops delivery and releases the transport. Only called by its owner.
    async fn close(&self) -> BusResult<()>;
}

/// Runs `handlers` one after another against a single message.
pub async fn dispatch(handlers: Vec<Handler>, message: BusMessage) {
    for handler in handlers {
        handler(message.clone()).await;
    }
}
