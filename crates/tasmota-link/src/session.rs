use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use transport_bus::Bus;

use crate::config::{SessionConfig, TransportOwnership};
use crate::correlator::Correlator;
use crate::error::{LinkError, LinkResult};
use crate::presence::{PeerEvents, PresenceTracker};
use crate::subscription::SubscriptionIds;
use crate::topic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Serving,
    /// Terminal.
    Closed,
}

/// Root owner of the transport handle, the cancellation root and the two
/// presence channels.
///
/// Closing the session cancels every in-flight call and ends both presence
/// sequences. A shared transport is only ever subscribed to and published
/// on; its `serve`/`close` belong to whoever supplied it.
pub struct Session {
    bus: Arc<dyn Bus>,
    ownership: TransportOwnership,
    qos: u8,
    response_timeout_secs: AtomicU64,
    root: CancellationToken,
    ids: Arc<SubscriptionIds>,
    presence: PresenceTracker,
    correlator: Correlator,
    state: Mutex<SessionState>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Session {
    /// Uses a transport supplied (and served) by the caller.
    pub fn with_bus(bus: Arc<dyn Bus>, config: SessionConfig) -> Self {
        Self::build(bus, TransportOwnership::Shared, config)
    }

    /// Takes ownership of `bus`: `start` serves it and `close` closes it.
    pub fn owning(bus: Arc<dyn Bus>, config: SessionConfig) -> Self {
        Self::build(bus, TransportOwnership::Owned, config)
    }

    /// Owns an embedded broker listening on `broker.listen`; peers connect to
    /// it directly. The listener address is reserved here, `start` begins
    /// accepting.
    #[cfg(feature = "mqtt")]
    pub fn bind(
        broker: transport_mqtt::BrokerBusConfig,
        config: SessionConfig,
    ) -> LinkResult<Self> {
        let bus = transport_mqtt::BrokerBus::new(broker)?;
        Ok(Self::owning(Arc::new(bus), config))
    }

    /// Owns a client connection to a broker running elsewhere.
    #[cfg(feature = "mqtt")]
    pub fn connect(
        broker: transport_mqtt::MqttBusConfig,
        config: SessionConfig,
    ) -> LinkResult<Self> {
        let bus = transport_mqtt::MqttBus::new(broker)?;
        Ok(Self::owning(Arc::new(bus), config))
    }

    fn build(bus: Arc<dyn Bus>, ownership: TransportOwnership, config: SessionConfig) -> Self {
        let root = CancellationToken::new();
        let ids = Arc::new(SubscriptionIds::new());
        let presence = PresenceTracker::new(Arc::clone(&bus), root.clone());
        let correlator = Correlator::new(
            Arc::clone(&bus),
            Arc::clone(&ids),
            root.clone(),
            config.qos,
        );
        Self {
            bus,
            ownership,
            qos: config.qos,
            response_timeout_secs: AtomicU64::new(config.response_timeout_secs),
            root,
            ids,
            presence,
            correlator,
            state: Mutex::new(SessionState::Created),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn ownership(&self) -> TransportOwnership {
        self.ownership
    }

    pub fn qos(&self) -> u8 {
        self.qos
    }

    pub fn response_timeout_secs(&self) -> u64 {
        self.response_timeout_secs.load(Ordering::Relaxed)
    }

    /// Applies to calls started after this returns.
    pub fn set_response_timeout_secs(&self, secs: u64) {
        self.response_timeout_secs.store(secs, Ordering::Relaxed);
    }

    /// Peers announcing `Online`. Ends when the session closes.
    pub fn connected_events(&self) -> PeerEvents {
        self.presence.connected()
    }

    /// Peers announcing `Offline`. Ends when the session closes.
    pub fn disconnected_events(&self) -> PeerEvents {
        self.presence.disconnected()
    }

    /// Created -> Serving: subscribes the presence filters, then serves an
    /// owned transport. Any failure leaves the session in `Created`.
    pub async fn start(&self) -> LinkResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let current = self.state();
        if current != SessionState::Created {
            return Err(LinkError::InvalidState {
                expected: SessionState::Created,
                actual: current,
            });
        }

        self.presence.subscribe(&self.ids).await?;
        if self.ownership == TransportOwnership::Owned {
            if let Err(err) = self.bus.serve().await {
                self.presence.unsubscribe().await;
                return Err(err.into());
            }
        }

        *self.state.lock() = SessionState::Serving;
        info!(ownership = ?self.ownership, qos = self.qos, "session serving");
        Ok(())
    }

    /// -> Closed: cancels the root token, ends both presence sequences,
    /// releases the presence subscriptions and closes an owned transport.
    /// Closing an already closed session does nothing.
    pub async fn close(&self) -> LinkResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == SessionState::Closed {
            debug!("session already closed");
            return Ok(());
        }

        // Producers must observe cancellation before their channels go away.
        self.root.cancel();
        self.presence.close_channels();
        self.presence.unsubscribe().await;
        *self.state.lock() = SessionState::Closed;
        info!(ownership = ?self.ownership, "session closed");

        if self.ownership == TransportOwnership::Owned {
            self.bus.close().await?;
        }
        Ok(())
    }

    /// Sends `command` to `peer` and waits for the first reply on the
    /// `response` status topic, bounded by the current response timeout.
    pub async fn call(
        &self,
        peer: &str,
        command: &str,
        response: &str,
        payload: Option<&[u8]>,
    ) -> LinkResult<Bytes> {
        let timeout = Duration::from_secs(self.response_timeout_secs());
        self.correlator
            .call(peer, command, response, payload.unwrap_or_default(), timeout)
            .await
    }

    /// Publishes a command without waiting for any reply.
    pub async fn publish_command(
        &self,
        peer: &str,
        command: &str,
        payload: Option<&[u8]>,
    ) -> LinkResult<()> {
        let topic = topic::command_topic(peer, command);
        let payload = Bytes::copy_from_slice(payload.unwrap_or_default());
        self.bus.publish(&topic, payload, false, self.qos).await?;
        debug!(topic = %topic, "command published");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
