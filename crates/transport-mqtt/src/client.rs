//! Client connection to an external MQTT broker, built on `rumqttc`.
//!
//! Local subscriptions are routed through a [`SubscriptionTable`]; one broker
//! subscription per distinct filter is shared by every local `(filter, id)`
//! pair registered under it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use transport_bus::{
    dispatch, Bus, BusError, BusMessage, BusResult, Handler, SubscriptionId, SubscriptionTable,
};
use uuid::Uuid;

use crate::delivery::queued;
use crate::{qos_from_byte, transport_error};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct MqttBusConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Keep-alive interval negotiated with the broker; must be at least 5 seconds.
    pub keep_alive: Duration,
    /// Capacity of the request queue between the client and the event loop.
    pub capacity: usize,
    /// QoS requested for broker-level subscriptions.
    pub subscribe_qos: u8,
}

impl MqttBusConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: format!("tasmota-link-{}", Uuid::new_v4().simple()),
            keep_alive: Duration::from_secs(30),
            capacity: 64,
            subscribe_qos: 0,
        }
    }
}

pub struct MqttBus {
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    routes: Arc<SubscriptionTable>,
    subscribe_qos: QoS,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MqttBus {
    pub fn new(config: MqttBusConfig) -> BusResult<Self> {
        let subscribe_qos = qos_from_byte(config.subscribe_qos)?;
        let mut options = MqttOptions::new(config.client_id, config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        let (client, event_loop) = AsyncClient::new(options, config.capacity);
        Ok(Self {
            client,
            event_loop: Mutex::new(Some(event_loop)),
            routes: Arc::new(SubscriptionTable::new()),
            subscribe_qos,
            pump: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Local `(filter, id)` pairs currently routed by this bus.
    pub fn subscriptions(&self) -> Vec<(String, SubscriptionId)> {
        self.routes.entries()
    }

    fn ensure_open(&self) -> BusResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Bus for MqttBus {
    async fn subscribe(
        &self,
        filter: &str,
        id: SubscriptionId,
        handler: Handler,
    ) -> BusResult<()> {
        self.ensure_open()?;
        if self.routes.insert(filter, id, queued(handler)) {
            if let Err(err) = self.client.subscribe(filter, self.subscribe_qos).await {
                self.routes.remove(filter, id);
                return Err(transport_error(err));
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str, id: SubscriptionId) -> BusResult<()> {
        let last = self.routes.remove(filter, id) == Some(true);
        if last && !self.closed.load(Ordering::Acquire) {
            self.client
                .unsubscribe(filter)
                .await
                .map_err(transport_error)?;
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, retain: bool, qos: u8) -> BusResult<()> {
        self.ensure_open()?;
        let qos = qos_from_byte(qos)?;
        self.client
            .publish(topic, qos, retain, payload.to_vec())
            .await
            .map_err(transport_error)
    }

    async fn serve(&self) -> BusResult<()> {
        self.ensure_open()?;
        let event_loop = self
            .event_loop
            .lock()
            .take()
            .ok_or_else(|| BusError::Transport("mqtt event loop already running".into()))?;
        let handle = tokio::spawn(pump(
            event_loop,
            self.client.clone(),
            Arc::clone(&self.routes),
            self.subscribe_qos,
        ));
        *self.pump.lock() = Some(handle);
        Ok(())
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.routes.clear();
        let disconnect = self.client.disconnect().await.map_err(transport_error);

        let pump = self.pump.lock().take();
        if let Some(mut handle) = pump {
            if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                debug!("mqtt event loop did not drain in time; aborting");
                handle.abort();
            }
        }
        disconnect
    }
}

async fn pump(
    mut event_loop: EventLoop,
    client: AsyncClient,
    routes: Arc<SubscriptionTable>,
    subscribe_qos: QoS,
) {
    let mut connected_once = false;
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                // Handlers only enqueue, so a slow subscriber never stalls the event loop.
                let handlers = routes.matching(&publish.topic);
                dispatch(
                    handlers,
                    BusMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                    },
                )
                .await;
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(session_present = ack.session_present, "connected to mqtt broker");
                if connected_once && !ack.session_present {
                    resubscribe(&client, &routes, subscribe_qos);
                }
                connected_once = true;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("mqtt disconnect sent; stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "mqtt event loop error; reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

// The pump drains the request queue, so it must never await on it.
fn resubscribe(client: &AsyncClient, routes: &SubscriptionTable, qos: QoS) {
    let filters: BTreeSet<String> = routes
        .entries()
        .into_iter()
        .map(|(filter, _)| filter)
        .collect();
    for filter in filters {
        if let Err(err) = client.try_subscribe(filter.as_str(), qos) {
            warn!(filter = %filter, error = %err, "failed to restore broker subscription");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport_bus::handler;

    fn unreachable_config() -> MqttBusConfig {
        let mut config = MqttBusConfig::new("127.0.0.1", 1);
        config.capacity = 16;
        config
    }

    #[test]
    fn generated_client_ids_are_distinct() {
        let a = MqttBusConfig::new("localhost", 1883);
        let b = MqttBusConfig::new("localhost", 1883);
        assert!(a.client_id.starts_with("tasmota-link-"));
        assert_ne!(a.client_id, b.client_id);
    }

    #[tokio::test]
    async fn local_routes_share_one_broker_filter() {
        let bus = MqttBus::new(unreachable_config()).expect("bus");
        bus.subscribe("tele/+/LWT", 1, handler(|_| async {}))
            .await
            .expect("first subscribe queued");
        bus.subscribe("tele/+/LWT", 2, handler(|_| async {}))
            .await
            .expect("second subscribe is local only");
        assert_eq!(bus.subscriptions().len(), 2);

        bus.unsubscribe("tele/+/LWT", 1).await.expect("unsubscribe");
        assert_eq!(bus.subscriptions(), vec![("tele/+/LWT".to_string(), 2)]);
    }

    #[tokio::test]
    async fn rejects_invalid_publish_qos() {
        let bus = MqttBus::new(unreachable_config()).expect("bus");
        let result = bus.publish("cmnd/1/POWER", Bytes::new(), false, 7).await;
        assert!(matches!(result, Err(BusError::Transport(_))));
    }

    #[tokio::test]
    async fn serve_runs_once_and_close_is_final() {
        let bus = MqttBus::new(unreachable_config()).expect("bus");
        bus.serve().await.expect("first serve");
        assert!(matches!(bus.serve().await, Err(BusError::Transport(_))));

        let _ = bus.close().await;
        assert!(matches!(
            bus.publish("cmnd/1/POWER", Bytes::new(), false, 0).await,
            Err(BusError::Closed)
        ));
        assert!(bus.close().await.is_ok());
    }
}
