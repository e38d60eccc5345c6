//! Synchronous command/reply and presence tracking for Tasmota devices over a
//! publish/subscribe [`Bus`](transport_bus::Bus).
//!
//! Peers are addressed with three topic families: commands go to
//! `cmnd/{peer}/{command}`, replies arrive on `stat/{peer}/{name}` and the
//! last-will presence announcement on `tele/{peer}/LWT`. A [`Session`] turns
//! the asynchronous exchange into a single awaited call bounded by a response
//! timeout, and exposes peers coming online or going offline as
//! [`PeerEvents`].

pub mod config;
pub mod correlator;
pub mod device;
pub mod error;
pub mod presence;
pub mod session;
pub mod status;
pub mod subscription;
pub mod topic;

pub use config::{SessionConfig, TransportOwnership, DEFAULT_RESPONSE_TIMEOUT_SECS};
pub use device::{PowerAction, PowerState};
pub use error::{LinkError, LinkResult};
pub use presence::{PeerEvents, Presence};
pub use session::{Session, SessionState};
pub use status::{
    DeviceSettings, Firmware, FullStatus, Logging, Memory, MqttSettings, Network, Parameters,
    RuntimeState, Sensors, StatusSection, TimeSettings, Wifi,
};
pub use subscription::SubscriptionIds;

pub use transport_bus;
#[cfg(feature = "mqtt")]
pub use transport_mqtt;
