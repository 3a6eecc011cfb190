//! Core types for the feeder network

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of feeder identities a coordinator routes to
pub const MAX_FEEDERS: u8 = 50;

/// Raw wire identity announced by a node that has not been assigned one
pub const UNASSIGNED_FEEDER_ID: u8 = 255;

/// Logical feeder identity in `[0, MAX_FEEDERS)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct FeederId(u8);

impl FeederId {
    pub fn new(raw: u8) -> Result<Self> {
        if raw < MAX_FEEDERS {
            Ok(Self(raw))
        } else {
            Err(Error::invalid(format!(
                "feeder N{} outside 0-{}",
                raw,
                MAX_FEEDERS - 1
            )))
        }
    }

    /// Validate an operator supplied number
    pub fn parse(raw: i64) -> Result<Self> {
        u8::try_from(raw)
            .map_err(|_| Error::invalid(format!("feeder N{} outside 0-{}", raw, MAX_FEEDERS - 1)))
            .and_then(Self::new)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for FeederId {
    type Error = Error;

    fn try_from(raw: u8) -> Result<Self> {
        Self::new(raw)
    }
}

impl From<FeederId> for u8 {
    fn from(id: FeederId) -> u8 {
        id.0
    }
}

impl fmt::Display for FeederId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

/// Link-level address of a physical node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeHandle([u8; 6]);

impl NodeHandle {
    pub const BROADCAST: NodeHandle = NodeHandle([0xFF; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Random locally administered unicast address
    pub fn random() -> Self {
        let mut bytes: [u8; 6] = rand::thread_rng().gen();
        bytes[0] = (bytes[0] & 0xFE) | 0x02;
        Self(bytes)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl Default for NodeHandle {
    fn default() -> Self {
        Self::random()
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for NodeHandle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| Error::invalid(format!("node handle '{}' too short", s)))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| Error::invalid(format!("node handle '{}' is not hex", s)))?;
        }
        if parts.next().is_some() {
            return Err(Error::invalid(format!("node handle '{}' too long", s)));
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for NodeHandle {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<NodeHandle> for String {
    fn from(handle: NodeHandle) -> String {
        handle.to_string()
    }
}

/// Feeder operational mode, owned by the actuator node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationalMode {
    #[default]
    Idle,
    Feeding,
    Retracting,
    Faulted,
}

impl OperationalMode {
    pub fn is_moving(self) -> bool {
        matches!(self, OperationalMode::Feeding | OperationalMode::Retracting)
    }
}

impl fmt::Display for OperationalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationalMode::Idle => "idle",
            OperationalMode::Feeding => "feeding",
            OperationalMode::Retracting => "retracting",
            OperationalMode::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Point-in-time projection of a node's feeder state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeederSnapshot {
    pub mode: OperationalMode,
    pub feedback_enabled: bool,
    pub tape_loaded: bool,
    pub manual_feed_pending: bool,
    pub error_count: u32,
    pub servo_angle: u16,
    /// Length the node feeds when a command names none
    #[serde(default)]
    pub feed_length: u8,
    #[serde(default)]
    pub settle_time_ms: u64,
}
