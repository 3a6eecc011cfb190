//! Wire packets exchanged between the coordinator and actuator nodes

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::feeder::SettingsPatch;
use crate::types::{FeederId, FeederSnapshot, NodeHandle};

/// Numeric command code carried by every packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandCode {
    SetAngle = 0x01,
    Advance = 0x04,
    Retract = 0x05,
    StatusRequest = 0x06,
    Response = 0x07,
    Heartbeat = 0x08,
    Register = 0x09,
    Discovery = 0x0A,
    SetFeederId = 0x0B,
    SetFeedback = 0x0C,
    ClearManualFeed = 0x0D,
    Configure = 0x0E,
}

/// Packet body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    #[serde(rename = "DISCOVERY")]
    Discovery,

    #[serde(rename = "REGISTER")]
    Register,

    #[serde(rename = "HEARTBEAT")]
    Heartbeat,

    #[serde(rename = "ADVANCE")]
    Advance {
        seq: u32,
        /// `None` feeds the node's configured length
        length: Option<u8>,
        force: bool,
    },

    #[serde(rename = "RETRACT")]
    Retract { seq: u32 },

    #[serde(rename = "SET_ANGLE")]
    SetAngle { seq: u32, angle: u16 },

    #[serde(rename = "SET_FEEDBACK")]
    SetFeedback { seq: u32, enabled: bool },

    #[serde(rename = "CLEAR_MANUAL_FEED")]
    ClearManualFeed { seq: u32 },

    #[serde(rename = "STATUS_REQUEST")]
    StatusRequest { seq: u32 },

    #[serde(rename = "CONFIGURE")]
    Configure { seq: u32, settings: SettingsPatch },

    #[serde(rename = "SET_FEEDER_ID")]
    SetFeederId { feeder: u8 },

    #[serde(rename = "RESPONSE")]
    Response {
        seq: u32,
        result: std::result::Result<(), Error>,
        snapshot: FeederSnapshot,
    },
}

impl Payload {
    pub fn code(&self) -> CommandCode {
        match self {
            Payload::Discovery => CommandCode::Discovery,
            Payload::Register => CommandCode::Register,
            Payload::Heartbeat => CommandCode::Heartbeat,
            Payload::Advance { .. } => CommandCode::Advance,
            Payload::Retract { .. } => CommandCode::Retract,
            Payload::SetAngle { .. } => CommandCode::SetAngle,
            Payload::SetFeedback { .. } => CommandCode::SetFeedback,
            Payload::ClearManualFeed { .. } => CommandCode::ClearManualFeed,
            Payload::StatusRequest { .. } => CommandCode::StatusRequest,
            Payload::Configure { .. } => CommandCode::Configure,
            Payload::SetFeederId { .. } => CommandCode::SetFeederId,
            Payload::Response { .. } => CommandCode::Response,
        }
    }

    /// Sent by nodes; everything else originates at the coordinator
    pub fn is_from_node(&self) -> bool {
        matches!(self, Payload::Register | Payload::Response { .. })
    }
}

/// One datagram on the link.
///
/// `node` names the sender for node packets and the target (or broadcast)
/// for coordinator packets. `feeder` is the raw identity so unassigned nodes
/// can announce themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub code: u8,
    pub feeder: u8,
    pub node: NodeHandle,
    pub payload: Payload,
}

impl Packet {
    pub fn new(feeder: u8, node: NodeHandle, payload: Payload) -> Self {
        Self {
            code: payload.code() as u8,
            feeder,
            node,
            payload,
        }
    }

    pub fn broadcast(payload: Payload) -> Self {
        Self::new(0, NodeHandle::BROADCAST, payload)
    }

    /// Coordinator command addressed to the node registered for `feeder`
    pub fn command(feeder: FeederId, node: NodeHandle, payload: Payload) -> Self {
        Self::new(feeder.get(), node, payload)
    }

    /// Serialize packet to bytes
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Deserialize packet from bytes, rejecting a code that disagrees with the payload
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let packet: Packet = serde_json::from_slice(bytes)
            .map_err(|e| Error::invalid(format!("malformed packet: {}", e)))?;
        if packet.code != packet.payload.code() as u8 {
            return Err(Error::invalid(format!(
                "command code 0x{:02X} does not match {:?}",
                packet.code,
                packet.payload.code()
            )));
        }
        Ok(packet)
    }
}
