use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::trace;

use crate::{
    dispatch, filter_matches, Bus, BusError, BusMessage, BusResult, Handler, SubscriptionId,
    SubscriptionTable,
};

/// In-memory broker for tests and embedders that never leave the process.
///
/// Publishing awaits every matching handler before returning, and no lock is
/// held while a handler runs, so a handler may publish again (for example a
/// simulated device answering a command).
#[derive(Debug, Default)]
pub struct LocalBus {
    table: SubscriptionTable,
    retained: RwLock<HashMap<String, Bytes>>,
    serving: AtomicBool,
    closed: AtomicBool,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently registered `(filter, id)` pairs, in subscription order.
    pub fn subscriptions(&self) -> Vec<(String, SubscriptionId)> {
        self.table.entries()
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> BusResult<()> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn subscribe(
        &self,
        filter: &str,
        id: SubscriptionId,
        handler: Handler,
    ) -> BusResult<()> {
        self.ensure_open()?;
        self.table.insert(filter, id, handler.clone());

        let retained: Vec<BusMessage> = self
            .retained
            .read()
            .iter()
            .filter(|(topic, _)| filter_matches(filter, topic))
            .map(|(topic, payload)| BusMessage {
                topic: topic.clone(),
                payload: payload.clone(),
            })
            .collect();
        for message in retained {
            handler(message).await;
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str, id: SubscriptionId) -> BusResult<()> {
        if self.table.remove(filter, id).is_none() {
            trace!(filter, subscription_id = id, "unsubscribe for unknown subscription");
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, retain: bool, _qos: u8) -> BusResult<()> {
        self.ensure_open()?;
        if retain {
            let mut retained = self.retained.write();
            if payload.is_empty() {
                retained.remove(topic);
            } else {
                retained.insert(topic.to_string(), payload.clone());
            }
        }

        let handlers = self.table.matching(topic);
        trace!(topic, handlers = handlers.len(), "local bus publish");
        dispatch(
            handlers,
            BusMessage {
                topic: topic.to_string(),
                payload,
            },
        )
        .await;
        Ok(())
    }

    async fn serve(&self) -> BusResult<()> {
        self.ensure_open()?;
        self.serving.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> BusResult<()> {
        self.closed.store(true, Ordering::Release);
        self.serving.store(false, Ordering::Release);
        self.table.clear();
        self.retained.write().clear();
        Ok(())
    }
}
