//! Tasmota device commands on top of [`Session`].

use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::error::{LinkError, LinkResult};
use crate::session::Session;
use crate::status::{self, FullStatus, StatusSection};
use crate::topic;

pub const POWER: &str = "POWER";
pub const STATUS: &str = "STATUS";
pub const STATUS_ALL: &str = "STATUS0";
pub const SET_OPTION_73: &str = "SETOPTION73";
pub const RESULT: &str = "RESULT";

/// Reply key for `SETOPTION73`; `OFF` means the button drives the relay.
const SET_OPTION_73_KEY: &str = "SetOption73";
const BUTTON_ENABLE: &[u8] = b"0";
const BUTTON_DISABLE: &[u8] = b"1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    On,
    Off,
    Toggle,
}

impl PowerAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PowerAction::On => "ON",
            PowerAction::Off => "OFF",
            PowerAction::Toggle => "TOGGLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match payload {
            b"ON" => Some(PowerState::On),
            b"OFF" => Some(PowerState::Off),
            _ => None,
        }
    }
}

fn malformed(peer: &str, response: &str, reason: impl ToString) -> LinkError {
    LinkError::MalformedResponse {
        topic: topic::status_topic(peer, response),
        reason: reason.to_string(),
    }
}

impl Session {
    pub async fn power_on(&self, peer: &str) -> LinkResult<()> {
        self.publish_power(peer, PowerAction::On).await
    }

    pub async fn power_off(&self, peer: &str) -> LinkResult<()> {
        self.publish_power(peer, PowerAction::Off).await
    }

    pub async fn power_toggle(&self, peer: &str) -> LinkResult<()> {
        self.publish_power(peer, PowerAction::Toggle).await
    }

    async fn publish_power(&self, peer: &str, action: PowerAction) -> LinkResult<()> {
        self.publish_command(peer, POWER, Some(action.as_str().as_bytes()))
            .await
    }

    /// Lets the device's own button switch the relay.
    pub async fn physical_button_on(&self, peer: &str) -> LinkResult<()> {
        self.publish_command(peer, SET_OPTION_73, Some(BUTTON_ENABLE))
            .await
    }

    /// Decouples the device's button from the relay.
    pub async fn physical_button_off(&self, peer: &str) -> LinkResult<()> {
        self.publish_command(peer, SET_OPTION_73, Some(BUTTON_DISABLE))
            .await
    }

    /// Applies `action` and returns the relay state the device reports.
    pub async fn switch_power(&self, peer: &str, action: PowerAction) -> LinkResult<PowerState> {
        let reply = self
            .call(peer, POWER, POWER, Some(action.as_str().as_bytes()))
            .await?;
        let state = PowerState::parse(&reply)
            .ok_or_else(|| malformed(peer, POWER, format!("unexpected power state {reply:?}")))?;
        debug!(peer, action = action.as_str(), ?state, "power switched");
        Ok(state)
    }

    pub async fn status(&self, peer: &str) -> LinkResult<FullStatus> {
        let reply = self.call(peer, STATUS_ALL, STATUS_ALL, None).await?;
        status::decode_full(&reply).map_err(|err| malformed(peer, STATUS_ALL, err))
    }

    /// Queries one status section, e.g. `session.status_section::<Network>("1")`.
    pub async fn status_section<T: StatusSection>(&self, peer: &str) -> LinkResult<T> {
        let index = T::INDEX.to_string();
        let response = format!("{STATUS}{index}");
        let reply = self
            .call(peer, STATUS, &response, Some(index.as_bytes()))
            .await?;
        status::decode_section::<T>(&reply).map_err(|err| malformed(peer, &response, err))
    }

    /// Whether the device's button currently drives the relay.
    pub async fn physical_button_enabled(&self, peer: &str) -> LinkResult<bool> {
        let reply = self.call(peer, SET_OPTION_73, RESULT, None).await?;
        parse_button_option(&reply).map_err(|reason| malformed(peer, RESULT, reason))
    }
}

fn parse_button_option(reply: &Bytes) -> Result<bool, String> {
    let value: Value = serde_json::from_slice(reply).map_err(|err| err.to_string())?;
    match value.get(SET_OPTION_73_KEY).and_then(Value::as_str) {
        Some(setting) => Ok(setting == "OFF"),
        None => Err(format!("no {SET_OPTION_73_KEY} in reply")),
    }
}
