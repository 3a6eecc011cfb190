//! Registration table
//!
//! Maps each logical feeder identity to the node currently serving it.
//! Liveness is never swept: an entry is stale when it is read more than the
//! liveness threshold after its last traffic.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::types::{FeederId, NodeHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationEntry {
    pub feeder: FeederId,
    pub node: NodeHandle,
    pub last_seen: Instant,
    /// False once the node has moved to another identity
    pub registered: bool,
}

impl RegistrationEntry {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    pub fn is_live(&self, now: Instant, threshold: Duration) -> bool {
        self.registered && self.age(now) <= threshold
    }
}

/// What a registration did to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Refreshed,
    /// Identity taken over from another node
    Rebound { previous: NodeHandle },
}

#[derive(Debug)]
pub struct RegistrationTable {
    entries: BTreeMap<FeederId, RegistrationEntry>,
    liveness: Duration,
}

impl RegistrationTable {
    pub fn new(liveness: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            liveness,
        }
    }

    pub fn liveness(&self) -> Duration {
        self.liveness
    }

    /// Bind `feeder` to `node`; the last writer wins
    pub fn register(&mut self, feeder: FeederId, node: NodeHandle, now: Instant) -> Registration {
        // A node serves at most one identity
        for entry in self.entries.values_mut() {
            if entry.feeder != feeder && entry.node == node {
                entry.registered = false;
            }
        }

        match self.entries.get_mut(&feeder) {
            Some(entry) if entry.node == node => {
                entry.last_seen = now;
                entry.registered = true;
                Registration::Refreshed
            }
            Some(entry) => {
                let previous = entry.node;
                entry.node = node;
                entry.last_seen = now;
                entry.registered = true;
                Registration::Rebound { previous }
            }
            None => {
                self.entries.insert(
                    feeder,
                    RegistrationEntry {
                        feeder,
                        node,
                        last_seen: now,
                        registered: true,
                    },
                );
                Registration::Created
            }
        }
    }

    /// Refresh liveness for traffic from `node`
    pub fn touch(&mut self, node: NodeHandle, now: Instant) -> Option<FeederId> {
        let entry = self
            .entries
            .values_mut()
            .find(|e| e.registered && e.node == node)?;
        entry.last_seen = now;
        Some(entry.feeder)
    }

    /// Routable entry for `feeder`, or `NotRegistered`
    pub fn resolve(&self, feeder: FeederId, now: Instant) -> Result<&RegistrationEntry> {
        match self.entries.get(&feeder) {
            Some(entry) if entry.is_live(now, self.liveness) => Ok(entry),
            Some(entry) => Err(Error::NotRegistered {
                feeder: feeder.get(),
                stale: entry.registered,
            }),
            None => Err(Error::NotRegistered {
                feeder: feeder.get(),
                stale: false,
            }),
        }
    }

    pub fn get(&self, feeder: FeederId) -> Option<&RegistrationEntry> {
        self.entries.get(&feeder)
    }

    /// Entries in identity order
    pub fn entries(&self) -> impl Iterator<Item = &RegistrationEntry> {
        self.entries.values()
    }

    pub fn live_count(&self, now: Instant) -> usize {
        self.entries
            .values()
            .filter(|e| e.is_live(now, self.liveness))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry, returning how many there were
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}
