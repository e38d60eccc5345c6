//! [`Bus`](transport_bus::Bus) bindings for MQTT.
//!
//! [`BrokerBus`] embeds a broker that devices connect to directly;
//! [`MqttBus`] is a client of a broker running elsewhere. Both hand inbound
//! messages to per-subscription queues, so one slow subscriber cannot stall
//! delivery to the rest.

mod broker;
mod client;
mod delivery;

pub use broker::{BrokerBus, BrokerBusConfig};
pub use client::{MqttBus, MqttBusConfig};

use rumqttc::QoS;
use transport_bus::{BusError, BusResult};

/// Maps a raw QoS byte onto the broker's delivery levels.
pub fn qos_from_byte(qos: u8) -> BusResult<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(BusError::Transport(format!("invalid qos level {other}"))),
    }
}

pub(crate) fn transport_error(err: impl std::fmt::Display) -> BusError {
    BusError::Transport(err.to_string())
}
