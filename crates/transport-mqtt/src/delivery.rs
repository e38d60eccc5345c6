//! Per-subscription delivery queues.
//!
//! Network transports feed every inbound message through one event loop. A
//! queued handler only enqueues there; its own task awaits the wrapped
//! handler, so messages for one subscription stay in arrival order and a
//! handler that waits holds back nobody but itself.

use tokio::sync::mpsc;
use tracing::trace;
use transport_bus::{handler, BusMessage, Handler};

/// Wraps `inner` in an ordered queue drained by a dedicated task. The task
/// ends once the returned handler and all its clones are dropped and the
/// queue is empty. Must be called inside a tokio runtime.
pub(crate) fn queued(inner: Handler) -> Handler {
    let (tx, mut rx) = mpsc::unbounded_channel::<BusMessage>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            inner(message).await;
        }
    });
    handler(move |message: BusMessage| {
        if let Err(err) = tx.send(message) {
            trace!(topic = %err.0.topic, "delivery queue closed; message dropped");
        }
        async {}
    })
}
