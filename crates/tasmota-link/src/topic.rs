//! Topic addressing for Tasmota peers: `{prefix}/{peer-id}/{name}`.
//!
//! Peer identifiers are used verbatim as a path segment. An identifier that
//! itself contains `/` produces a topic with extra levels and will not parse
//! back to the same identifier; such identifiers are not rejected here.

use std::fmt;

pub const SEPARATOR: char = '/';

/// Single-level wildcard accepted in subscription filters.
pub const WILDCARD: &str = "+";

/// Last-will topic name Tasmota uses to announce availability.
pub const PRESENCE_NAME: &str = "LWT";
pub const PRESENCE_ONLINE: &str = "Online";
pub const PRESENCE_OFFLINE: &str = "Offline";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prefix {
    /// `cmnd`: instructions sent to a peer.
    Command,
    /// `stat`: replies and state changes reported by a peer.
    Status,
    /// `tele`: periodic telemetry and the last-will presence topic.
    Telemetry,
}

impl Prefix {
    pub const fn as_str(self) -> &'static str {
        match self {
            Prefix::Command => "cmnd",
            Prefix::Status => "stat",
            Prefix::Telemetry => "tele",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cmnd" => Some(Prefix::Command),
            "stat" => Some(Prefix::Status),
            "tele" => Some(Prefix::Telemetry),
            _ => None,
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A three-part topic address. Built on demand, never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic<'a> {
    pub prefix: Prefix,
    pub peer: &'a str,
    pub name: &'a str,
}

impl<'a> Topic<'a> {
    pub fn new(prefix: Prefix, peer: &'a str, name: &'a str) -> Self {
        Self { prefix, peer, name }
    }

    /// Splits a concrete topic into its three parts. The peer is the second
    /// level and the name is everything after it.
    pub fn parse(topic: &'a str) -> Option<Self> {
        let mut parts = topic.splitn(3, SEPARATOR);
        let prefix = Prefix::parse(parts.next()?)?;
        let peer = parts.next()?;
        let name = parts.next()?;
        Some(Self { prefix, peer, name })
    }
}

impl fmt::Display for Topic<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.prefix, self.peer, self.name
        )
    }
}

pub fn full_topic(prefix: Prefix, peer: &str, name: &str) -> String {
    Topic::new(prefix, peer, name).to_string()
}

pub fn command_topic(peer: &str, command: &str) -> String {
    full_topic(Prefix::Command, peer, command)
}

pub fn status_topic(peer: &str, status: &str) -> String {
    full_topic(Prefix::Status, peer, status)
}

pub fn telemetry_topic(peer: &str, name: &str) -> String {
    full_topic(Prefix::Telemetry, peer, name)
}

/// `tele/+/LWT`: the presence topic of every peer.
pub fn presence_filter() -> String {
    telemetry_topic(WILDCARD, PRESENCE_NAME)
}

/// Extracts the peer identifier (second level) from an inbound topic.
pub fn peer_id(topic: &str) -> Option<&str> {
    topic.split(SEPARATOR).nth(1)
}
