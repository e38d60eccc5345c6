use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tasmota_link::transport_mqtt::{BrokerBusConfig, MqttBusConfig};
use tasmota_link::{PeerEvents, Session, SessionConfig, DEFAULT_RESPONSE_TIMEOUT_SECS};
use tokio::signal;
use tracing::{info, warn};

mod telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "tasmota-watch",
    author,
    version,
    about = "Logs Tasmota devices coming online and going offline"
)]
struct Cli {
    /// Run an embedded broker on this address instead of connecting to one.
    #[arg(long, env = "TASMOTA_LISTEN")]
    listen: Option<SocketAddr>,

    /// MQTT broker host.
    #[arg(long, env = "TASMOTA_BROKER_HOST", default_value = "127.0.0.1")]
    broker_host: String,

    #[arg(long, env = "TASMOTA_BROKER_PORT", default_value_t = 1883)]
    broker_port: u16,

    /// Client id presented to the broker; random when unset.
    #[arg(long, env = "TASMOTA_CLIENT_ID")]
    client_id: Option<String>,

    /// QoS used for commands and broker subscriptions.
    #[arg(long, env = "TASMOTA_QOS", default_value_t = 0)]
    qos: u8,

    #[arg(
        long,
        env = "TASMOTA_RESPONSE_TIMEOUT_SECS",
        default_value_t = DEFAULT_RESPONSE_TIMEOUT_SECS
    )]
    response_timeout_secs: u64,

    /// Do not query the status of peers as they come online.
    #[arg(long, default_value_t = false)]
    no_status: bool,
}

#[derive(Debug)]
enum Transport {
    Client(MqttBusConfig),
    Embedded(BrokerBusConfig),
}

#[derive(Debug)]
struct WatchConfig {
    transport: Transport,
    session: SessionConfig,
    query_status: bool,
}

impl TryFrom<Cli> for WatchConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.qos > 2 {
            bail!("invalid qos level: {}", cli.qos);
        }
        if cli.response_timeout_secs == 0 {
            bail!("response timeout must be at least one second");
        }
        let transport = match cli.listen {
            Some(listen) => Transport::Embedded(BrokerBusConfig::new(listen)),
            None => {
                let mut broker = MqttBusConfig::new(cli.broker_host, cli.broker_port);
                if let Some(client_id) = cli.client_id {
                    broker.client_id = client_id;
                }
                broker.subscribe_qos = cli.qos;
                Transport::Client(broker)
            }
        };
        Ok(WatchConfig {
            transport,
            session: SessionConfig::default()
                .with_qos(cli.qos)
                .with_response_timeout_secs(cli.response_timeout_secs),
            query_status: !cli.no_status,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;

    let config = WatchConfig::try_from(Cli::parse())?;
    match &config.transport {
        Transport::Client(broker) => info!(
            host = %broker.host,
            port = broker.port,
            client_id = %broker.client_id,
            "starting tasmota-watch"
        ),
        Transport::Embedded(broker) => {
            info!(listen = %broker.listen, "starting tasmota-watch with an embedded broker")
        }
    }

    run(config).await
}

async fn run(config: WatchConfig) -> Result<()> {
    let session = match config.transport {
        Transport::Client(broker) => Session::connect(broker, config.session)
            .context("failed to configure broker connection")?,
        Transport::Embedded(broker) => Session::bind(broker, config.session)
            .context("failed to bind embedded broker")?,
    };
    let session = Arc::new(session);
    session.start().await.context("failed to start session")?;

    let connected = tokio::spawn(watch_connected(session.clone(), config.query_status));
    let disconnected = tokio::spawn(watch_disconnected(session.disconnected_events()));

    signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    session.close().await.context("failed to close session")?;

    let _ = connected.await;
    let _ = disconnected.await;
    Ok(())
}

async fn watch_connected(session: Arc<Session>, query_status: bool) {
    let events = session.connected_events();
    while let Some(peer) = events.recv().await {
        info!(peer = %peer, "peer connected");
        if !query_status {
            continue;
        }
        // Queried off the event loop so a silent peer does not hold back presence.
        let session = session.clone();
        tokio::spawn(async move {
            match session.status(&peer).await {
                Ok(status) => info!(
                    peer = %peer,
                    device = %status.device.device_name,
                    firmware = %status.firmware.version,
                    ip = %status.network.ip_address,
                    power = %status.runtime.power,
                    "peer status"
                ),
                Err(err) if err.is_cancelled() => {}
                Err(err) => warn!(peer = %peer, error = %err, "status query failed"),
            }
        });
    }
}

async fn watch_disconnected(events: PeerEvents) {
    while let Some(peer) = events.recv().await {
        info!(peer = %peer, "peer disconnected");
    }
}
