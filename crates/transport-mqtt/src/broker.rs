//! Embedded MQTT broker, built on `rumqttd`.
//!
//! Devices connect to the listener over TCP; the bus itself talks to the
//! router through an in-process link subscribed to `#`, and routes what it
//! receives through a [`SubscriptionTable`]. `rumqttd` has no shutdown hook,
//! so closing the bus detaches the link and stops delivery while the listener
//! thread stays up until the process exits.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttd::local::{LinkRx, LinkTx};
use rumqttd::protocol::{Packet, Publish};
use rumqttd::{Broker, Config, ConnectionSettings, Notification, RouterConfig, ServerSettings};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use transport_bus::{
    dispatch, Bus, BusError, BusMessage, BusResult, Handler, SubscriptionId, SubscriptionTable,
};

use crate::delivery::queued;
use crate::transport_error;

const LOCAL_LINK_ID: &str = "tasmota-link";
const ALL_TOPICS: &str = "#";
const LISTEN_TIMEOUT: Duration = Duration::from_secs(5);
const LISTEN_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct BrokerBusConfig {
    /// Address devices connect to. Port 0 picks a free port.
    pub listen: SocketAddr,
    pub max_connections: usize,
    /// Largest accepted publish payload, in bytes.
    pub max_payload_size: usize,
    pub connection_timeout_ms: u16,
}

impl BrokerBusConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            max_connections: 1024,
            max_payload_size: 20 * 1024,
            connection_timeout_ms: 60_000,
        }
    }

    fn broker_config(&self, listen: SocketAddr) -> Config {
        let server = ServerSettings {
            name: "tasmota-link-v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: self.connection_timeout_ms,
                max_payload_size: self.max_payload_size,
                max_inflight_count: 100,
                auth: None,
                external_auth: None,
                dynamic_filters: true,
            },
        };
        Config {
            id: 0,
            router: RouterConfig {
                max_connections: self.max_connections,
                max_outgoing_packet_count: 200,
                max_segment_size: 1024 * 1024,
                max_segment_count: 10,
                ..RouterConfig::default()
            },
            v4: Some(HashMap::from([("1".to_string(), server)])),
            ..Config::default()
        }
    }
}

pub struct BrokerBus {
    config: BrokerBusConfig,
    listen: SocketAddr,
    link: tokio::sync::Mutex<Option<LinkTx>>,
    routes: Arc<SubscriptionTable>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BrokerBus {
    /// Resolves the listen address up front, so an ephemeral port is known
    /// (see [`local_addr`](Self::local_addr)) before `serve`.
    pub fn new(config: BrokerBusConfig) -> BusResult<Self> {
        let listen = TcpListener::bind(config.listen)
            .and_then(|listener| listener.local_addr())
            .map_err(|err| {
                BusError::Transport(format!("cannot listen on {}: {err}", config.listen))
            })?;
        Ok(Self {
            config,
            listen,
            link: tokio::sync::Mutex::new(None),
            routes: Arc::new(SubscriptionTable::new()),
            forwarder: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listen
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
impl Bus for BrokerBus {
    async fn subscribe(
        &self,
        filter: &str,
        id: SubscriptionId,
        handler: Handler,
    ) -> BusResult<()> {
        self.ensure_open()?;
        self.routes.insert(filter, id, queued(handler));
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str, id: SubscriptionId) -> BusResult<()> {
        self.routes.remove(filter, id);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, retain: bool, _qos: u8) -> BusResult<()> {
        self.ensure_open()?;
        let mut link = self.link.lock().await;
        let link = link
            .as_mut()
            .ok_or_else(|| BusError::Transport("embedded broker is not serving".into()))?;
        // The in-process link always publishes at QoS 0.
        let publish = Publish::new(Bytes::copy_from_slice(topic.as_bytes()), payload, retain);
        link.send(Packet::Publish(publish, None))
            .await
            .map_err(transport_error)?;
        Ok(())
    }

    async fn serve(&self) -> BusResult<()> {
        self.ensure_open()?;
        let mut link = self.link.lock().await;
        if link.is_some() {
            return Err(BusError::Transport("embedded broker already serving".into()));
        }

        let mut broker = Broker::new(self.config.broker_config(self.listen));
        let (mut link_tx, link_rx) = broker.link(LOCAL_LINK_ID).map_err(transport_error)?;
        thread::Builder::new()
            .name("mqtt-broker".to_string())
            .spawn(move || {
                if let Err(err) = broker.start() {
                    error!(error = %err, "embedded mqtt broker stopped");
                }
            })
            .map_err(transport_error)?;
        link_tx.subscribe(ALL_TOPICS).map_err(transport_error)?;
        wait_listening(self.listen).await?;

        let forwarder = tokio::spawn(forward(link_rx, Arc::clone(&self.routes)));
        *self.forwarder.lock() = Some(forwarder);
        *link = Some(link_tx);
        info!(listen = %self.listen, "embedded mqtt broker listening");
        Ok(())
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.routes.clear();
        self.link.lock().await.take();
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
        debug!(listen = %self.listen, "embedded mqtt broker detached");
        Ok(())
    }
}

async fn wait_listening(listen: SocketAddr) -> BusResult<()> {
    let target = match listen.ip() {
        ip if ip.is_unspecified() => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), listen.port()),
        _ => listen,
    };
    let deadline = tokio::time::Instant::now() + LISTEN_TIMEOUT;
    loop {
        match TcpStream::connect(target).await {
            Ok(_) => return Ok(()),
            Err(err) if tokio::time::Instant::now() >= deadline => {
                return Err(BusError::Transport(format!(
                    "embedded broker not accepting on {listen}: {err}"
                )));
            }
            Err(_) => tokio::time::sleep(LISTEN_POLL).await,
        }
    }
}

async fn forward(mut link_rx: LinkRx, routes: Arc<SubscriptionTable>) {
    loop {
        match link_rx.next().await {
            Ok(Some(Notification::Forward(forwarded))) => {
                let topic = match String::from_utf8(forwarded.publish.topic.to_vec()) {
                    Ok(topic) => topic,
                    Err(err) => {
                        warn!(error = %err, "dropping publish with a non-utf8 topic");
                        continue;
                    }
                };
                let handlers = routes.matching(&topic);
                dispatch(
                    handlers,
                    BusMessage {
                        topic,
                        payload: forwarded.publish.payload,
                    },
                )
                .await;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "embedded broker link closed");
                break;
            }
        }
    }
}
