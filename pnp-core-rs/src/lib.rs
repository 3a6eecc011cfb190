//! PnP Core Library
//!
//! Command routing and device registration for a pick-and-place feeder bench.
//! A coordinator drives up to 50 actuator nodes, one per tape feeder, over a
//! broadcast datagram link with random-backoff discovery.

pub mod command;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod feeder;
pub mod hal;
pub mod link;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod types;

pub use config::{CoordinatorConfig, DispatchConfig, LinkConfig, ManualFeedConfig, NodeConfig};
pub use coordinator::{Coordinator, CoordinatorHandle};
pub use error::{Error, Result};
pub use feeder::{FeederSettings, ManualTrigger};
pub use hal::{Servo, SimServo, SimTapeSensor, TapeSensor};
pub use link::{Link, MemoryBus, UdpLink};
pub use node::{ActuatorNode, NodeStatus};
pub use protocol::{Packet, Payload};
pub use router::Reply;
pub use types::*;
