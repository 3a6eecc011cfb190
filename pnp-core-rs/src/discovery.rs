//! Discovery and registration protocol
//!
//! The coordinator broadcasts `DISCOVERY`; every node answers with `REGISTER`
//! after its own random backoff so replies from a full bench do not collide.
//! [`Registrar`] is the coordinator half and [`Announcer`] the node half.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::{Registration, RegistrationTable};
use crate::types::{FeederId, NodeHandle, UNASSIGNED_FEEDER_ID};

/// Upper bound of the registration backoff
pub const DISCOVERY_BACKOFF_MAX: Duration = Duration::from_millis(2000);

/// Uniform delay in `[0, max]`
pub fn backoff_delay<R: Rng + ?Sized>(rng: &mut R, max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(rng.gen_range(0..=max_ms))
}

/// Node heard announcing without an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnassignedNode {
    pub node: NodeHandle,
    pub last_seen: Instant,
}

/// Bounded list of unassigned nodes; the least recently heard slot is reused
#[derive(Debug)]
pub struct UnassignedNodes {
    slots: Vec<UnassignedNode>,
    capacity: usize,
}

impl UnassignedNodes {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, node: NodeHandle, now: Instant) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.node == node) {
            slot.last_seen = now;
            return;
        }

        let entry = UnassignedNode {
            node,
            last_seen: now,
        };
        if self.slots.len() < self.capacity {
            self.slots.push(entry);
        } else if let Some(oldest) = self.slots.iter_mut().min_by_key(|s| s.last_seen) {
            debug!("Unassigned list full, replacing {}", oldest.node);
            *oldest = entry;
        }
    }

    pub fn remove(&mut self, node: NodeHandle) {
        self.slots.retain(|s| s.node != node);
    }

    /// Nodes heard within `window`, most recent first
    pub fn active(&self, now: Instant, window: Duration) -> Vec<UnassignedNode> {
        let mut nodes: Vec<_> = self
            .slots
            .iter()
            .filter(|s| now.saturating_duration_since(s.last_seen) <= window)
            .copied()
            .collect();
        nodes.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        nodes
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Result of an accepted `REGISTER`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announcement {
    Registered {
        feeder: FeederId,
        outcome: Registration,
    },
    Unassigned,
}

/// Coordinator side of the protocol and sole writer of the table
pub struct Registrar {
    table: Arc<RwLock<RegistrationTable>>,
    unassigned: UnassignedNodes,
}

impl Registrar {
    pub fn new(liveness: Duration, max_unassigned: usize) -> Self {
        Self {
            table: Arc::new(RwLock::new(RegistrationTable::new(liveness))),
            unassigned: UnassignedNodes::new(max_unassigned),
        }
    }

    /// Shared read handle for routing
    pub fn table(&self) -> Arc<RwLock<RegistrationTable>> {
        self.table.clone()
    }

    /// Apply a `REGISTER` packet. Out-of-range identities are rejected.
    pub async fn handle_register(
        &mut self,
        raw_feeder: u8,
        node: NodeHandle,
        now: Instant,
    ) -> Result<Announcement> {
        if raw_feeder == UNASSIGNED_FEEDER_ID {
            info!("Node {} announced without a feeder id", node);
            self.unassigned.record(node, now);
            return Ok(Announcement::Unassigned);
        }

        let feeder = FeederId::new(raw_feeder).map_err(|e| {
            warn!("Rejecting registration from {}: {}", node, e);
            e
        })?;

        self.unassigned.remove(node);
        let outcome = self.table.write().await.register(feeder, node, now);
        match outcome {
            Registration::Created => info!("Registered {} at {}", feeder, node),
            Registration::Rebound { previous } => {
                warn!("{} moved from {} to {}", feeder, previous, node)
            }
            Registration::Refreshed => debug!("Refreshed {} at {}", feeder, node),
        }
        Ok(Announcement::Registered { feeder, outcome })
    }

    /// Any valid packet from a node counts as liveness
    pub async fn touch(&self, node: NodeHandle, now: Instant) -> Option<FeederId> {
        self.table.write().await.touch(node, now)
    }

    pub async fn clear(&mut self) -> usize {
        let count = self.table.write().await.clear();
        info!("Cleared {} registrations", count);
        count
    }

    pub fn unassigned(&self, now: Instant, window: Duration) -> Vec<UnassignedNode> {
        self.unassigned.active(now, window)
    }
}

/// Node side: one pending registration scheduled after a random backoff
#[derive(Debug)]
pub struct Announcer {
    max_backoff: Duration,
    heartbeat_spread: Duration,
    deadline: Option<tokio::time::Instant>,
}

impl Announcer {
    pub fn new(max_backoff: Duration, heartbeat_spread: Duration) -> Self {
        Self {
            max_backoff,
            heartbeat_spread,
            deadline: None,
        }
    }

    /// Schedule a reply to `DISCOVERY`. A reply already pending keeps its slot.
    pub fn on_discovery<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        now: tokio::time::Instant,
    ) -> tokio::time::Instant {
        self.schedule(rng, now, self.max_backoff)
    }

    /// Schedule a reply to `HEARTBEAT` within the (shorter) heartbeat spread
    pub fn on_heartbeat<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        now: tokio::time::Instant,
    ) -> tokio::time::Instant {
        self.schedule(rng, now, self.heartbeat_spread)
    }

    fn schedule<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        now: tokio::time::Instant,
        max: Duration,
    ) -> tokio::time::Instant {
        if let Some(deadline) = self.deadline {
            return deadline;
        }
        let deadline = now + backoff_delay(rng, max);
        self.deadline = Some(deadline);
        deadline
    }

    pub fn deadline(&self) -> Option<tokio::time::Instant> {
        self.deadline
    }

    /// Mark the pending reply as sent
    pub fn fired(&mut self) {
        self.deadline = None;
    }
}
