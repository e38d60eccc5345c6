//! Pairs one published command with the first reply on its status topic.
//!
//! Every call owns a private temporary subscription and a capacity-1 result
//! channel. The subscription is registered before the command is published
//! and released exactly once when the call ends, whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use transport_bus::{handler, Bus, BusMessage, SubscriptionId};

use crate::error::{LinkError, LinkResult};
use crate::subscription::SubscriptionIds;
use crate::topic;

pub struct Correlator {
    bus: Arc<dyn Bus>,
    ids: Arc<SubscriptionIds>,
    root: CancellationToken,
    qos: u8,
}

impl Correlator {
    pub fn new(
        bus: Arc<dyn Bus>,
        ids: Arc<SubscriptionIds>,
        root: CancellationToken,
        qos: u8,
    ) -> Self {
        Self {
            bus,
            ids,
            root,
            qos,
        }
    }

    /// Publishes `payload` on `cmnd/{peer}/{command}` and returns the first
    /// payload seen on `stat/{peer}/{response}`, verbatim.
    ///
    /// A failed publish does not end the call; the wait continues and the
    /// publish error is attached to the resulting timeout.
    pub async fn call(
        &self,
        peer: &str,
        command: &str,
        response: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> LinkResult<Bytes> {
        let status_topic = topic::status_topic(peer, response);
        if self.root.is_cancelled() {
            return Err(LinkError::Cancelled {
                topic: status_topic,
            });
        }
        let command_topic = topic::command_topic(peer, command);

        let call_token = self.root.child_token();
        let _cancel_on_exit = call_token.clone().drop_guard();

        let id = self.ids.next_id();
        let (tx, mut rx) = mpsc::channel::<Bytes>(1);
        let on_reply = handler(move |message: BusMessage| {
            // Only the first reply fits; later ones are dropped without waiting.
            let _ = tx.try_send(message.payload);
            async {}
        });

        self.bus.subscribe(&status_topic, id, on_reply).await?;
        let subscription = TemporarySubscription::new(Arc::clone(&self.bus), &status_topic, id);

        let publish_error = match self
            .bus
            .publish(&command_topic, Bytes::copy_from_slice(payload), false, self.qos)
            .await
        {
            Ok(()) => None,
            Err(err) => {
                warn!(
                    topic = %command_topic,
                    error = %err,
                    "command publish failed; still waiting for a reply"
                );
                Some(err)
            }
        };
        debug!(
            command = %command_topic,
            status = %status_topic,
            subscription_id = id,
            timeout_secs = timeout.as_secs(),
            "awaiting command response"
        );

        let outcome = tokio::select! {
            biased;
            Some(reply) = rx.recv() => Ok(reply),
            _ = call_token.cancelled() => Err(LinkError::Cancelled {
                topic: status_topic.clone(),
            }),
            _ = tokio::time::sleep(timeout) => Err(LinkError::Timeout {
                timeout,
                publish_error,
            }),
        };

        subscription.release().await;
        outcome
    }
}

/// Unsubscribes on release, or from `Drop` if the call future is abandoned.
struct TemporarySubscription {
    bus: Arc<dyn Bus>,
    filter: String,
    id: SubscriptionId,
    released: bool,
}

impl TemporarySubscription {
    fn new(bus: Arc<dyn Bus>, filter: &str, id: SubscriptionId) -> Self {
        Self {
            bus,
            filter: filter.to_string(),
            id,
            released: false,
        }
    }

    async fn release(mut self) {
        self.released = true;
        if let Err(err) = self.bus.unsubscribe(&self.filter, self.id).await {
            warn!(
                filter = %self.filter,
                subscription_id = self.id,
                error = %err,
                "failed to release response subscription"
            );
        }
    }
}

impl Drop for TemporarySubscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let bus = Arc::clone(&self.bus);
        let filter = std::mem::take(&mut self.filter);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = bus.unsubscribe(&filter, id).await {
                        warn!(filter = %filter, subscription_id = id, error = %err, "failed to release abandoned response subscription");
                    }
                });
            }
            Err(_) => {
                warn!(filter = %filter, subscription_id = id, "no runtime left to release response subscription");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport_bus::LocalBus;

    fn correlator(bus: Arc<LocalBus>, root: CancellationToken) -> Correlator {
        Correlator::new(bus, Arc::new(SubscriptionIds::new()), root, 1)
    }

    /// Answers every command on `cmnd/{peer}/{command}` with `reply`.
    async fn respond_with(bus: &Arc<LocalBus>, peer: &str, command: &str, reply: &'static [u8]) {
        let responder_bus = Arc::downgrade(bus);
        let reply_topic = topic::status_topic(peer, command);
        bus.subscribe(
            &topic::command_topic(peer, command),
            u32::MAX,
            handler(move |_| {
                let bus = responder_bus.clone();
                let reply_topic = reply_topic.clone();
                async move {
                    if let Some(bus) = bus.upgrade() {
                        let _ = bus
                            .publish(&reply_topic, Bytes::from_static(reply), false, 0)
                            .await;
                    }
                }
            }),
        )
        .await
        .expect("responder subscription");
    }

    #[tokio::test]
    async fn returns_the_reply_verbatim() {
        let bus = Arc::new(LocalBus::new());
        respond_with(&bus, "1", "POWER", b"ON").await;

        let reply = correlator(bus.clone(), CancellationToken::new())
            .call("1", "POWER", "POWER", b"ON", Duration::from_secs(1))
            .await
            .expect("reply");
        assert_eq!(reply, Bytes::from_static(b"ON"));
        assert_eq!(
            bus.subscriptions(),
            vec![("cmnd/1/POWER".to_string(), u32::MAX)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_releases_the_subscription() {
        let bus = Arc::new(LocalBus::new());
        let started = tokio::time::Instant::now();
        let err = correlator(bus.clone(), CancellationToken::new())
            .call("2", "POWER", "POWER", b"", Duration::from_secs(1))
            .await
            .expect_err("no reply");

        assert!(err.is_timeout(), "unexpected error: {err}");
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(bus.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn cancelled_root_short_circuits() {
        let bus = Arc::new(LocalBus::new());
        let root = CancellationToken::new();
        root.cancel();

        let err = correlator(bus.clone(), root)
            .call("1", "STATUS", "STATUS1", b"1", Duration::from_secs(5))
            .await
            .expect_err("cancelled");
        assert!(err.is_cancelled());
        assert!(bus.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn subscribe_failure_aborts_the_call() {
        let bus = Arc::new(LocalBus::new());
        bus.close().await.unwrap();

        let err = correlator(bus, CancellationToken::new())
            .call("1", "POWER", "POWER", b"", Duration::from_secs(5))
            .await
            .expect_err("closed bus");
        assert!(matches!(err, LinkError::Transport(transport_bus::BusError::Closed)));
    }

    #[tokio::test]
    async fn abandoned_call_still_releases() {
        let bus = Arc::new(LocalBus::new());
        let corr = correlator(bus.clone(), CancellationToken::new());
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            corr.call("3", "POWER", "POWER", b"", Duration::from_secs(30)),
        )
        .await;
        assert!(abandoned.is_err());

        for _ in 0..10 {
            if bus.subscriptions().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(bus.subscriptions().is_empty());
    }
}
