#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tasmota_link::transport_bus::{
    filter_matches, Bus, BusError, BusMessage, BusResult, Handler, SubscriptionId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Subscribe { filter: String, id: SubscriptionId },
    Unsubscribe { filter: String, id: SubscriptionId },
    Publish { topic: String, payload: Bytes, qos: u8 },
    Serve,
    Close,
}

/// Bus fake that records every call, keeps handlers for manual delivery and
/// fails on request.
#[derive(Default)]
pub struct RecordingBus {
    calls: Mutex<Vec<Call>>,
    handlers: Mutex<Vec<(String, SubscriptionId, Handler)>>,
    subscribes: AtomicUsize,
    fail_subscribe_at: Mutex<Option<usize>>,
    fail_publish: AtomicBool,
    fail_serve: AtomicBool,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the `n`th subscribe (1-based).
    pub fn fail_subscribe_at(&self, n: usize) {
        *self.fail_subscribe_at.lock() = Some(n);
    }

    pub fn fail_publishes(&self) {
        self.fail_publish.store(true, Ordering::SeqCst);
    }

    pub fn fail_serve(&self) {
        self.fail_serve.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn publishes(&self) -> Vec<(String, Bytes)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Publish { topic, payload, .. } => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    /// Ids subscribed under `filter`, in call order.
    pub fn subscribed_ids(&self, filter: &str) -> Vec<SubscriptionId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Subscribe { filter: f, id } if f == filter => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn unsubscribe_count(&self, filter: &str, id: SubscriptionId) -> usize {
        let expected = Call::Unsubscribe {
            filter: filter.to_string(),
            id,
        };
        self.calls().iter().filter(|call| **call == expected).count()
    }

    /// Live subscriptions.
    pub fn active(&self) -> Vec<(String, SubscriptionId)> {
        self.handlers
            .lock()
            .iter()
            .map(|(filter, id, _)| (filter.clone(), *id))
            .collect()
    }

    /// Hands a message to every live handler whose filter matches `topic`.
    pub async fn deliver(&self, topic: &str, payload: &'static [u8]) {
        let matching: Vec<Handler> = self
            .handlers
            .lock()
            .iter()
            .filter(|(filter, _, _)| filter_matches(filter, topic))
            .map(|(_, _, handler)| handler.clone())
            .collect();
        let message = BusMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(payload),
        };
        for handler in matching {
            handler(message.clone()).await;
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Bus for RecordingBus {
    async fn subscribe(&self, filter: &str, id: SubscriptionId, handler: Handler) -> BusResult<()> {
        self.record(Call::Subscribe {
            filter: filter.to_string(),
            id,
        });
        let n = self.subscribes.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_subscribe_at.lock() == Some(n) {
            return Err(BusError::Transport("subscribe refused".into()));
        }
        self.handlers.lock().push((filter.to_string(), id, handler));
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str, id: SubscriptionId) -> BusResult<()> {
        self.record(Call::Unsubscribe {
            filter: filter.to_string(),
            id,
        });
        self.handlers
            .lock()
            .retain(|(f, existing, _)| !(f == filter && *existing == id));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, _retain: bool, qos: u8) -> BusResult<()> {
        self.record(Call::Publish {
            topic: topic.to_string(),
            payload,
            qos,
        });
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BusError::Transport("publish refused".into()));
        }
        Ok(())
    }

    async fn serve(&self) -> BusResult<()> {
        self.record(Call::Serve);
        if self.fail_serve.load(Ordering::SeqCst) {
            return Err(BusError::Transport("serve refused".into()));
        }
        Ok(())
    }

    async fn close(&self) -> BusResult<()> {
        self.record(Call::Close);
        Ok(())
    }
}

/// Yields until `ready` holds; panics after a bounded number of turns.
pub async fn settle(mut ready: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if ready() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
