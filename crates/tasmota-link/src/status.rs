//! Typed views of Tasmota `STATUS` replies.
//!
//! `STATUS0` answers with every section at once ([`FullStatus`]); `STATUS N`
//! answers with a single section wrapped in an object keyed by the section
//! name (`{"StatusPRM": {...}}`), see [`StatusSection`]. Missing fields decode
//! to their defaults.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Tasmota's local timestamp format, `YYYY-MM-DDTHH:MM:SS` without an offset.
pub mod tasmota_time {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error)]
pub enum StatusDecodeError {
    #[error("invalid status json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("status reply has no {0} section")]
    MissingSection(&'static str),
}

/// A section that `STATUS N` returns on its own.
pub trait StatusSection: DeserializeOwned {
    /// Argument of the `STATUS` command; the reply arrives on `STATUS{INDEX}`.
    const INDEX: u8;
    /// Object key wrapping the section in the reply.
    const KEY: &'static str;
}

pub fn decode_section<T: StatusSection>(payload: &[u8]) -> Result<T, StatusDecodeError> {
    let mut sections: Map<String, Value> = serde_json::from_slice(payload)?;
    let section = sections
        .remove(T::KEY)
        .ok_or(StatusDecodeError::MissingSection(T::KEY))?;
    Ok(serde_json::from_value(section)?)
}

pub fn decode_full(payload: &[u8]) -> Result<FullStatus, StatusDecodeError> {
    Ok(serde_json::from_slice(payload)?)
}

/// `Status`: module, naming and relay behaviour.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeviceSettings {
    pub module: i64,
    pub device_name: String,
    pub friendly_name: Vec<String>,
    pub topic: String,
    pub button_topic: String,
    pub power: String,
    pub power_lock: String,
    pub power_on_state: i64,
    pub led_state: i64,
    pub led_mask: String,
    pub save_data: i64,
    pub save_state: i64,
    pub switch_topic: String,
    pub switch_mode: Vec<i64>,
    pub button_retain: i64,
    pub switch_retain: i64,
    pub sensor_retain: i64,
    pub power_retain: i64,
    pub info_retain: i64,
    pub state_retain: i64,
    pub status_retain: i64,
}

/// `StatusPRM` (STATUS 1): boot and persistence parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Parameters {
    pub baudrate: i64,
    pub serial_config: String,
    pub group_topic: String,
    pub ota_url: String,
    pub restart_reason: String,
    pub uptime: String,
    #[serde(rename = "StartupUTC", with = "tasmota_time")]
    pub startup_utc: NaiveDateTime,
    pub sleep: i64,
    pub cfg_holder: i64,
    pub boot_count: i64,
    #[serde(rename = "BCResetTime", with = "tasmota_time")]
    pub bc_reset_time: NaiveDateTime,
    pub save_count: i64,
    pub save_address: String,
}

impl StatusSection for Parameters {
    const INDEX: u8 = 1;
    const KEY: &'static str = "StatusPRM";
}

/// `StatusFWR` (STATUS 2): firmware build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Firmware {
    pub version: String,
    #[serde(with = "tasmota_time")]
    pub build_date_time: NaiveDateTime,
    pub boot: i64,
    pub core: String,
    #[serde(rename = "SDK")]
    pub sdk: String,
    pub cpu_frequency: i64,
    pub hardware: String,
    #[serde(rename = "CR")]
    pub cr: String,
}

impl StatusSection for Firmware {
    const INDEX: u8 = 2;
    const KEY: &'static str = "StatusFWR";
}

/// `StatusLOG` (STATUS 3): log levels and sinks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Logging {
    pub serial_log: i64,
    pub web_log: i64,
    pub mqtt_log: i64,
    pub sys_log: i64,
    pub log_host: String,
    pub log_port: i64,
    #[serde(rename = "SSId")]
    pub ssid: Vec<String>,
    pub tele_period: i64,
    pub resolution: String,
    pub set_option: Vec<String>,
}

impl StatusSection for Logging {
    const INDEX: u8 = 3;
    const KEY: &'static str = "StatusLOG";
}

/// `StatusMEM` (STATUS 4): flash and heap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Memory {
    pub program_size: i64,
    pub free: i64,
    pub heap: i64,
    pub program_flash_size: i64,
    pub flash_size: i64,
    pub flash_chip_id: String,
    pub flash_frequency: i64,
    pub flash_mode: String,
    pub features: Vec<String>,
    pub drivers: String,
    pub sensors: String,
    #[serde(rename = "I2CDriver")]
    pub i2c_driver: String,
}

impl StatusSection for Memory {
    const INDEX: u8 = 4;
    const KEY: &'static str = "StatusMEM";
}

/// `StatusNET` (STATUS 5): addressing and wifi configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Network {
    pub hostname: String,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    pub gateway: String,
    pub subnetmask: String,
    #[serde(rename = "DNSServer1")]
    pub dns_server1: String,
    #[serde(rename = "DNSServer2")]
    pub dns_server2: String,
    pub mac: String,
    pub webserver: i64,
    #[serde(rename = "HTTP_API")]
    pub http_api: i64,
    pub wifi_config: i64,
    pub wifi_power: f64,
}

impl StatusSection for Network {
    const INDEX: u8 = 5;
    const KEY: &'static str = "StatusNET";
}

/// `StatusMQT` (STATUS 6): the device's own broker settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MqttSettings {
    pub mqtt_host: String,
    pub mqtt_port: i64,
    pub mqtt_client_mask: String,
    pub mqtt_client: String,
    pub mqtt_user: String,
    pub mqtt_count: i64,
    #[serde(rename = "MAX_PACKET_SIZE")]
    pub max_packet_size: i64,
    #[serde(rename = "KEEPALIVE")]
    pub keepalive: i64,
    #[serde(rename = "SOCKET_TIMEOUT")]
    pub socket_timeout: i64,
}

impl StatusSection for MqttSettings {
    const INDEX: u8 = 6;
    const KEY: &'static str = "StatusMQT";
}

/// `StatusTIM` (STATUS 7): clock, DST window and sun times.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TimeSettings {
    #[serde(rename = "UTC")]
    pub utc: DateTime<Utc>,
    #[serde(with = "tasmota_time")]
    pub local: NaiveDateTime,
    #[serde(rename = "StartDST", with = "tasmota_time")]
    pub start_dst: NaiveDateTime,
    #[serde(rename = "EndDST", with = "tasmota_time")]
    pub end_dst: NaiveDateTime,
    pub timezone: String,
    pub sunrise: String,
    pub sunset: String,
}

impl StatusSection for TimeSettings {
    const INDEX: u8 = 7;
    const KEY: &'static str = "StatusTIM";
}

/// `StatusSNS` (STATUS 8): sensor snapshot. Readings depend on the attached
/// sensors and are kept as raw JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Sensors {
    #[serde(with = "tasmota_time")]
    pub time: NaiveDateTime,
    #[serde(flatten)]
    pub readings: Map<String, Value>,
}

impl StatusSection for Sensors {
    const INDEX: u8 = 8;
    const KEY: &'static str = "StatusSNS";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Wifi {
    #[serde(rename = "AP")]
    pub ap: i64,
    #[serde(rename = "SSId")]
    pub ssid: String,
    #[serde(rename = "BSSId")]
    pub bssid: String,
    pub channel: i64,
    pub mode: String,
    #[serde(rename = "RSSI")]
    pub rssi: i64,
    pub signal: i64,
    pub link_count: i64,
    pub downtime: String,
}

/// `StatusSTS` (STATUS 11): runtime state including the relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RuntimeState {
    #[serde(with = "tasmota_time")]
    pub time: NaiveDateTime,
    pub uptime: String,
    pub uptime_sec: i64,
    pub heap: i64,
    pub sleep_mode: String,
    pub sleep: i64,
    pub load_avg: i64,
    pub mqtt_count: i64,
    #[serde(rename = "POWER")]
    pub power: String,
    pub wifi: Wifi,
}

impl StatusSection for RuntimeState {
    const INDEX: u8 = 11;
    const KEY: &'static str = "StatusSTS";
}

/// Reply to `STATUS0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FullStatus {
    #[serde(rename = "Status")]
    pub device: DeviceSettings,
    #[serde(rename = "StatusPRM")]
    pub parameters: Parameters,
    #[serde(rename = "StatusFWR")]
    pub firmware: Firmware,
    #[serde(rename = "StatusLOG")]
    pub logging: Logging,
    #[serde(rename = "StatusMEM")]
    pub memory: Memory,
    #[serde(rename = "StatusNET")]
    pub network: Network,
    #[serde(rename = "StatusMQT")]
    pub mqtt: MqttSettings,
    #[serde(rename = "StatusTIM")]
    pub time: TimeSettings,
    #[serde(rename = "StatusSNS")]
    pub sensors: Sensors,
    #[serde(rename = "StatusSTS")]
    pub runtime: RuntimeState,
}
