//! Actuator node
//!
//! One node drives one feeder. Its loop owns the [`Feeder`] state and reacts
//! to coordinator packets, the tape sensor poll, the manual-feed button, the
//! discovery backoff and the settle deadline of the motion in progress. Motion
//! never blocks the loop, so status requests are answered mid-feed.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::discovery::{backoff_delay, Announcer};
use crate::error::{Error, Result};
use crate::feeder::{Feeder, ManualFeedLatch, ManualTrigger};
use crate::hal::{Servo, TapeSensor};
use crate::link::Link;
use crate::protocol::{Packet, Payload};
use crate::types::{FeederId, FeederSnapshot, NodeHandle, OperationalMode, UNASSIGNED_FEEDER_ID};

/// What the node currently looks like from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    pub feeder: Option<FeederId>,
    pub snapshot: FeederSnapshot,
}

#[derive(Debug, Clone, Copy)]
enum MotionKind {
    Feed { force: bool },
    Retract,
}

#[derive(Debug)]
struct ActiveMotion {
    kind: MotionKind,
    steps: VecDeque<u16>,
    next_at: Instant,
    /// Coordinator request to answer; `None` for local manual feeds
    seq: Option<u32>,
}

pub struct ActuatorNode {
    config: NodeConfig,
    feeder_id: Option<FeederId>,
    feeder: Feeder,
    link: Arc<dyn Link>,
    inbound: mpsc::Receiver<Packet>,
    servo: Box<dyn Servo>,
    sensor: Arc<dyn TapeSensor>,
    announcer: Announcer,
    motion: Option<ActiveMotion>,
    latch: ManualFeedLatch,
    manual_tx: mpsc::Sender<()>,
    manual_rx: mpsc::Receiver<()>,
    status_tx: watch::Sender<NodeStatus>,
}

impl ActuatorNode {
    pub fn new(
        config: NodeConfig,
        link: Arc<dyn Link>,
        inbound: mpsc::Receiver<Packet>,
        servo: Box<dyn Servo>,
        sensor: Arc<dyn TapeSensor>,
    ) -> Self {
        let latch = ManualFeedLatch::new();
        let mut feeder = Feeder::new(config.settings, config.feedback_enabled, latch.clone());
        feeder.observe_tape(sensor.tape_present());

        let feeder_id = config.feeder();
        let (manual_tx, manual_rx) = mpsc::channel(1);
        let (status_tx, _) = watch::channel(NodeStatus {
            feeder: feeder_id,
            snapshot: feeder.snapshot(),
        });

        Self {
            announcer: Announcer::new(
                config.discovery_backoff_max(),
                config.heartbeat_reply_max(),
            ),
            config,
            feeder_id,
            feeder,
            link,
            inbound,
            servo,
            sensor,
            motion: None,
            latch,
            manual_tx,
            manual_rx,
            status_tx,
        }
    }

    pub fn handle(&self) -> NodeHandle {
        self.config.handle
    }

    /// Button input feeding this node
    pub fn manual_trigger(&self) -> ManualTrigger {
        ManualTrigger::new(
            self.config.manual_feed.min_pulse(),
            self.config.manual_feed.max_pulse(),
            self.latch.clone(),
            self.manual_tx.clone(),
        )
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status_tx.subscribe()
    }

    /// Run until the link's inbound side closes
    pub async fn run(mut self) {
        match self.feeder_id {
            Some(id) => info!("Node {} serving feeder {}", self.config.handle, id),
            None => info!("Node {} waiting for a feeder id", self.config.handle),
        }

        let mut poll = interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Boot registration, then re-announce on a per-node random phase
        self.announce();
        let period = self.config.announce_interval();
        let phase = backoff_delay(&mut rand::thread_rng(), period / 2);
        let mut announce = interval_at(Instant::now() + period + phase, period);
        announce.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let backoff = self.announcer.deadline();
            let step = self.motion.as_ref().map(|m| m.next_at);

            tokio::select! {
                packet = self.inbound.recv() => match packet {
                    Some(packet) => self.handle_packet(packet),
                    None => {
                        info!("Link closed, node {} stopping", self.config.handle);
                        break;
                    }
                },
                _ = poll.tick() => self.poll_sensor(),
                _ = announce.tick() => self.announce(),
                Some(()) = self.manual_rx.recv() => self.on_manual_feed(),
                _ = sleep_until_opt(backoff) => {
                    self.announcer.fired();
                    self.announce();
                }
                _ = sleep_until_opt(step) => self.advance_motion(),
            }
        }
    }

    fn handle_packet(&mut self, packet: Packet) {
        if packet.payload.is_from_node() {
            return;
        }

        let Packet {
            feeder,
            node,
            payload,
            ..
        } = packet;

        match payload {
            Payload::Discovery => {
                let now = Instant::now();
                let at = self.announcer.on_discovery(&mut rand::thread_rng(), now);
                debug!(
                    "Discovery heard, registering in {:?}",
                    at.saturating_duration_since(now)
                );
            }
            Payload::Heartbeat => {
                let now = Instant::now();
                let at = self.announcer.on_heartbeat(&mut rand::thread_rng(), now);
                trace!(
                    "Heartbeat heard, answering in {:?}",
                    at.saturating_duration_since(now)
                );
            }
            Payload::SetFeederId { feeder: raw } => {
                if node == self.config.handle {
                    self.adopt_identity(raw);
                }
            }
            payload => {
                if self.is_addressed(feeder, node) {
                    self.handle_command(payload);
                }
            }
        }

        self.publish();
    }

    fn is_addressed(&self, feeder: u8, node: NodeHandle) -> bool {
        let Some(id) = self.feeder_id else {
            return false;
        };
        id.get() == feeder && (node == self.config.handle || node.is_broadcast())
    }

    fn handle_command(&mut self, payload: Payload) {
        match payload {
            Payload::Advance { seq, length, force } => {
                match self.feeder.begin_feed(length, force) {
                    Ok(steps) => self.start_motion(MotionKind::Feed { force }, steps, Some(seq)),
                    Err(e) => self.respond(seq, Err(e)),
                }
            }
            Payload::Retract { seq } => match self.feeder.begin_retract() {
                Ok(steps) => {
                    if let Some(previous) = self.motion.take() {
                        info!("Retract supersedes running feed");
                        if let Some(prev_seq) = previous.seq {
                            self.respond(prev_seq, Err(Error::busy("feed superseded by retract")));
                        }
                    }
                    self.start_motion(MotionKind::Retract, steps, Some(seq));
                }
                Err(e) => self.respond(seq, Err(e)),
            },
            Payload::SetAngle { seq, angle } => {
                let result = self.feeder.set_angle(angle);
                if result.is_ok() {
                    self.servo.set_angle(angle);
                }
                self.respond(seq, result);
            }
            Payload::SetFeedback { seq, enabled } => {
                self.feeder.set_feedback(enabled, self.sensor.tape_present());
                info!(
                    "Feedback {}",
                    if enabled { "enabled" } else { "disabled" }
                );
                self.respond(seq, Ok(()));
            }
            Payload::ClearManualFeed { seq } => {
                if self.feeder.clear_manual_feed() {
                    debug!("Manual feed flag cleared");
                }
                self.respond(seq, Ok(()));
            }
            Payload::StatusRequest { seq } => self.respond(seq, Ok(())),
            Payload::Configure { seq, settings } => {
                let result = self.feeder.configure(&settings);
                if result.is_ok() {
                    info!("Settings updated: {:?}", self.feeder.settings());
                }
                self.respond(seq, result);
            }
            other => debug!("Ignoring {:?}", other.code()),
        }
    }

    fn start_motion(&mut self, kind: MotionKind, steps: Vec<u16>, seq: Option<u32>) {
        let mut steps: VecDeque<u16> = steps.into();
        if let Some(angle) = steps.pop_front() {
            self.drive(angle);
        }
        debug!("{:?} started, {} steps left", kind, steps.len());
        self.motion = Some(ActiveMotion {
            kind,
            steps,
            next_at: Instant::now() + self.feeder.settings().settle_time(),
            seq,
        });
    }

    fn advance_motion(&mut self) {
        let Some(mut motion) = self.motion.take() else {
            return;
        };

        if let Some(angle) = motion.steps.pop_front() {
            self.drive(angle);
            motion.next_at = Instant::now() + self.feeder.settings().settle_time();
            self.motion = Some(motion);
        } else {
            let force = matches!(motion.kind, MotionKind::Feed { force: true });
            let result = self.feeder.finish_motion(self.sensor.tape_present(), force);
            match &result {
                Ok(()) => debug!("{:?} complete", motion.kind),
                Err(e) => warn!("{:?} failed: {}", motion.kind, e),
            }
            if let Some(seq) = motion.seq {
                self.respond(seq, result);
            }
        }

        self.publish();
    }

    fn drive(&mut self, angle: u16) {
        self.servo.set_angle(angle);
        self.feeder.record_step(angle);
    }

    fn on_manual_feed(&mut self) {
        if self.config.manual_feed.advance {
            if self.feeder.mode() == OperationalMode::Idle {
                match self.feeder.begin_feed(None, true) {
                    Ok(steps) => {
                        info!("Manual feed of {}", self.feeder.settings().feed_length);
                        self.start_motion(MotionKind::Feed { force: true }, steps, None);
                    }
                    Err(e) => warn!("Manual feed refused: {}", e),
                }
            } else {
                debug!("Manual feed latched while {}", self.feeder.mode());
            }
        }
        self.publish();
    }

    fn poll_sensor(&mut self) {
        if self.feeder.observe_tape(self.sensor.tape_present()) {
            debug!("Tape {}", if self.feeder.snapshot().tape_loaded { "loaded" } else { "missing" });
            self.publish();
        }
    }

    fn adopt_identity(&mut self, raw: u8) {
        let id = match FeederId::new(raw) {
            Ok(id) => id,
            Err(e) => {
                warn!("Ignoring SET_FEEDER_ID: {}", e);
                return;
            }
        };

        info!("Node {} now serves feeder {}", self.config.handle, id);
        self.feeder_id = Some(id);
        self.config.feeder_id = Some(raw);
        if let Err(e) = self.config.persist() {
            warn!("Could not store feeder id: {}", e);
        }
        self.announce();
    }

    fn announce(&self) {
        let raw = self.raw_feeder();
        self.send(Packet::new(raw, self.config.handle, Payload::Register));
    }

    fn respond(&self, seq: u32, result: Result<()>) {
        // Local observers see the state before the coordinator does
        self.publish();
        let payload = Payload::Response {
            seq,
            result,
            snapshot: self.feeder.snapshot(),
        };
        self.send(Packet::new(self.raw_feeder(), self.config.handle, payload));
    }

    fn raw_feeder(&self) -> u8 {
        self.feeder_id.map(FeederId::get).unwrap_or(UNASSIGNED_FEEDER_ID)
    }

    fn send(&self, packet: Packet) {
        if let Err(e) = self.link.send(&packet) {
            warn!("Failed to send {:?}: {}", packet.payload.code(), e);
        }
    }

    fn publish(&self) {
        let status = NodeStatus {
            feeder: self.feeder_id,
            snapshot: self.feeder.snapshot(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
