//! Command router
//!
//! Turns parsed operator commands into validated dispatches and renders the
//! outcome. Checks run in a fixed order and the first failure wins:
//! system enablement for motion, identity resolution, parameters, then the
//! per-feeder in-flight slot. The router only reads the registration table.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::command::{Command, SettingsArgs};
use crate::config::DispatchConfig;
use crate::error::{Error, Result};
use crate::feeder::{validate_angle, validate_feed_length, MAX_SETTLE_TIME_MS};
use crate::link::Link;
use crate::protocol::{Packet, Payload};
use crate::registry::RegistrationTable;
use crate::types::{FeederId, FeederSnapshot, NodeHandle};

/// Rendered command outcome: info lines, then `ok` or `error: <reason>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<String>,
    pub result: Result<()>,
}

impl Reply {
    pub fn ok(lines: Vec<String>) -> Self {
        Self {
            lines,
            result: Ok(()),
        }
    }

    pub fn error(error: Error) -> Self {
        Self {
            lines: Vec::new(),
            result: Err(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error_kind(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|l| l.contains(needle))
    }
}

impl From<Result<Vec<String>>> for Reply {
    fn from(result: Result<Vec<String>>) -> Self {
        match result {
            Ok(lines) => Reply::ok(lines),
            Err(e) => Reply::error(e),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{}", line)?;
        }
        match &self.result {
            Ok(()) => write!(f, "ok"),
            Err(e) => write!(f, "error: {}", e),
        }
    }
}

/// Node answer to a dispatched command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReply {
    pub result: Result<()>,
    pub snapshot: FeederSnapshot,
}

/// Per-feeder dispatch counters for this session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub completed: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Copy)]
struct CachedSnapshot {
    snapshot: FeederSnapshot,
    at: Instant,
}

/// Resolved routing target
#[derive(Debug, Clone, Copy)]
struct Target {
    feeder: FeederId,
    node: NodeHandle,
    age: Duration,
}

struct RouterInner {
    table: Arc<RwLock<RegistrationTable>>,
    link: Arc<dyn Link>,
    dispatch: DispatchConfig,
    enabled: AtomicBool,
    next_seq: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<NodeReply>>>,
    in_flight: Mutex<HashSet<FeederId>>,
    cache: Mutex<HashMap<FeederId, CachedSnapshot>>,
    stats: Mutex<HashMap<FeederId, FeedStats>>,
}

/// Releases a feeder's in-flight slot on every exit path
struct InFlightSlot<'a> {
    slots: &'a Mutex<HashSet<FeederId>>,
    feeder: FeederId,
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.slots.lock().remove(&self.feeder);
    }
}

struct PendingSlot<'a> {
    pending: &'a Mutex<HashMap<u32, oneshot::Sender<NodeReply>>>,
    seq: u32,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.seq);
    }
}

#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(
        table: Arc<RwLock<RegistrationTable>>,
        link: Arc<dyn Link>,
        dispatch: DispatchConfig,
        enabled: bool,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                table,
                link,
                dispatch,
                enabled: AtomicBool::new(enabled),
                next_seq: AtomicU32::new(1),
                pending: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                cache: Mutex::new(HashMap::new()),
                stats: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn stats(&self, feeder: FeederId) -> FeedStats {
        self.inner
            .stats
            .lock()
            .get(&feeder)
            .copied()
            .unwrap_or_default()
    }

    /// Deliver a node's `RESPONSE` to the waiting dispatch
    pub fn complete(&self, feeder: FeederId, seq: u32, result: Result<()>, snapshot: FeederSnapshot) {
        self.observe(feeder, snapshot);
        let waiter = self.inner.pending.lock().remove(&seq);
        match waiter {
            Some(tx) => {
                // The waiter may have just timed out
                let _ = tx.send(NodeReply { result, snapshot });
            }
            None => debug!("No dispatch waiting for seq {} from {}", seq, feeder),
        }
    }

    /// Record the latest snapshot a node reported
    pub fn observe(&self, feeder: FeederId, snapshot: FeederSnapshot) {
        self.inner.cache.lock().insert(
            feeder,
            CachedSnapshot {
                snapshot,
                at: Instant::now(),
            },
        );
    }

    /// Run one routed command to completion
    pub async fn execute(&self, command: Command) -> Reply {
        if command.is_motion() && !self.is_enabled() {
            return Reply::error(Error::SystemDisabled);
        }
        let result = match command {
            Command::Enable { state } => self.enable(state),
            Command::Hands => Ok(self.hands().await),
            Command::Status => Ok(self.status().await),
            Command::FeederStatus { feeder } => self.feeder_status(feeder).await,
            Command::FeedbackStatus { feeder } => self.feedback_status(feeder).await,
            Command::AckManualFeed { feeder } => self.ack_manual_feed(feeder).await,
            Command::Configure { feeder, settings } => self.configure(feeder, settings).await,
            Command::SetFeedback { feeder, state } => self.set_feedback(feeder, state).await,
            Command::ClearManualFeed { feeder } => self.clear_manual_feed(feeder).await,
            Command::Feed {
                feeder,
                length,
                force,
            } => self.feed(feeder, length, force).await,
            Command::Retract { feeder } => self.retract(feeder).await,
            Command::SetAngle { feeder, angle } => self.set_angle(feeder, angle).await,
            Command::Discovery
            | Command::ClearRegistration
            | Command::Unassigned
            | Command::Assign { .. } => Err(Error::invalid(
                "registration commands run on the coordinator loop",
            )),
        };
        Reply::from(result)
    }

    // ------------------------------------------------------------------
    // Motion
    // ------------------------------------------------------------------

    async fn feed(&self, feeder: Option<i64>, length: Option<i64>, force: bool) -> Result<Vec<String>> {
        let target = self.resolve(feeder).await?;
        let length = length.map(validate_feed_length).transpose()?;
        let _slot = self.claim(target.feeder)?;

        let timeout = self.feed_timeout(target.feeder, length);
        let outcome = self
            .dispatch(
                &target,
                |seq| Payload::Advance { seq, length, force },
                timeout,
            )
            .await
            .and_then(|reply| reply.result);
        self.record_feed(target.feeder, outcome.is_ok());
        outcome?;

        let what = match length {
            Some(length) => format!("{} units", length),
            None => "default length".to_string(),
        };
        info!("{} fed {}{}", target.feeder, what, if force { " (forced)" } else { "" });
        Ok(vec![format!("{} fed {}", target.feeder, what)])
    }

    async fn retract(&self, feeder: Option<i64>) -> Result<Vec<String>> {
        let target = self.resolve(feeder).await?;
        self.mutate(&target, |seq| Payload::Retract { seq }).await?;
        Ok(vec![format!("{} retracted", target.feeder)])
    }

    async fn set_angle(&self, feeder: Option<i64>, angle: Option<i64>) -> Result<Vec<String>> {
        let target = self.resolve(feeder).await?;
        let angle = validate_angle(angle.ok_or_else(|| Error::invalid("missing angle A"))?)?;
        self.mutate(&target, |seq| Payload::SetAngle { seq, angle })
            .await?;
        Ok(vec![format!("{} servo at {} deg", target.feeder, angle)])
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    fn enable(&self, state: Option<i64>) -> Result<Vec<String>> {
        match state {
            None => {}
            Some(0) => self.inner.enabled.store(false, Ordering::Release),
            Some(1) => self.inner.enabled.store(true, Ordering::Release),
            Some(other) => return Err(Error::invalid(format!("S{} (use S0 or S1)", other))),
        }
        if state.is_some() {
            info!("System {}", enabled_word(self.is_enabled()));
        }
        Ok(vec![format!("System: {}", enabled_word(self.is_enabled()))])
    }

    async fn set_feedback(&self, feeder: Option<i64>, state: Option<i64>) -> Result<Vec<String>> {
        let target = self.resolve(feeder).await?;
        let enabled = match state {
            Some(0) => false,
            Some(1) => true,
            Some(other) => return Err(Error::invalid(format!("S{} (use S0 or S1)", other))),
            None => return Err(Error::invalid("missing S0/S1")),
        };
        self.mutate(&target, |seq| Payload::SetFeedback { seq, enabled })
            .await?;
        Ok(vec![format!(
            "{} feedback {}",
            target.feeder,
            if enabled { "enabled" } else { "disabled" }
        )])
    }

    async fn configure(&self, feeder: Option<i64>, settings: SettingsArgs) -> Result<Vec<String>> {
        let target = self.resolve(feeder).await?;
        let settings = settings.validate()?;
        self.mutate(&target, |seq| Payload::Configure { seq, settings })
            .await?;
        Ok(vec![format!("{} settings updated", target.feeder)])
    }

    async fn clear_manual_feed(&self, feeder: Option<i64>) -> Result<Vec<String>> {
        let target = self.resolve(feeder).await?;
        self.mutate(&target, |seq| Payload::ClearManualFeed { seq })
            .await?;
        Ok(vec![format!("{} manual feed flag cleared", target.feeder)])
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    async fn feeder_status(&self, feeder: Option<i64>) -> Result<Vec<String>> {
        let target = self.resolve(feeder).await?;
        let mut lines = vec![format!(
            "{} at {}, online, last seen {} ms ago",
            target.feeder,
            target.node,
            target.age.as_millis()
        )];
        match self.snapshot(&target).await {
            Some((snapshot, fresh)) => lines.push(format!(
                "{}{}",
                describe(&snapshot),
                cached_marker(fresh)
            )),
            None => lines.push("state unknown (no reply)".to_string()),
        }
        let stats = self.stats(target.feeder);
        lines.push(format!("feeds: {} ok, {} failed", stats.completed, stats.failed));
        Ok(lines)
    }

    async fn feedback_status(&self, feeder: Option<i64>) -> Result<Vec<String>> {
        let target = self.resolve(feeder).await?;
        let line = match self.snapshot(&target).await {
            Some((s, fresh)) => format!(
                "{} feedback: {}, tape: {}, manual feed pending: {}, errors: {}{}",
                target.feeder,
                on_off(s.feedback_enabled),
                tape_word(s.tape_loaded),
                yes_no(s.manual_feed_pending),
                s.error_count,
                cached_marker(fresh)
            ),
            None => format!("{} feedback state unknown (no reply)", target.feeder),
        };
        Ok(vec![line])
    }

    /// Reports the latch without clearing it
    async fn ack_manual_feed(&self, feeder: Option<i64>) -> Result<Vec<String>> {
        let target = self.resolve(feeder).await?;
        let line = match self.snapshot(&target).await {
            Some((s, fresh)) => format!(
                "{} manual feed pending: {}{}",
                target.feeder,
                yes_no(s.manual_feed_pending),
                cached_marker(fresh)
            ),
            None => format!("{} manual feed state unknown (no reply)", target.feeder),
        };
        Ok(vec![line])
    }

    async fn hands(&self) -> Vec<String> {
        let now = Instant::now();
        let table = self.inner.table.read().await;
        let mut lines = vec![format!("System: {}", enabled_word(self.is_enabled()))];
        for entry in table.entries() {
            let state = if !entry.registered {
                "UNREGISTERED"
            } else if entry.is_live(now, table.liveness()) {
                "ONLINE"
            } else {
                "OFFLINE"
            };
            lines.push(format!(
                "{} {} {} ({} ms ago)",
                entry.feeder,
                entry.node,
                state,
                entry.age(now).as_millis()
            ));
        }
        lines.push(format!("Online: {}/{}", table.live_count(now), table.len()));
        lines
    }

    async fn status(&self) -> Vec<String> {
        let now = Instant::now();
        let table = self.inner.table.read().await;
        let mut lines = vec![format!("Registered feeders: {}", table.len())];
        for entry in table.entries() {
            let stats = self.stats(entry.feeder);
            lines.push(format!(
                "{} -> {} registered: {}, live: {}, last seen {} ms ago, feeds {}/{}",
                entry.feeder,
                entry.node,
                yes_no(entry.registered),
                yes_no(entry.is_live(now, table.liveness())),
                entry.age(now).as_millis(),
                stats.completed,
                stats.failed
            ));
        }
        lines
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    async fn resolve(&self, feeder: Option<i64>) -> Result<Target> {
        let raw = feeder.ok_or_else(|| Error::invalid("missing feeder number N"))?;
        let feeder = FeederId::parse(raw)?;
        let now = Instant::now();
        let table = self.inner.table.read().await;
        let entry = table.resolve(feeder, now)?;
        Ok(Target {
            feeder,
            node: entry.node,
            age: entry.age(now),
        })
    }

    fn claim(&self, feeder: FeederId) -> Result<InFlightSlot<'_>> {
        if !self.inner.in_flight.lock().insert(feeder) {
            return Err(Error::busy(format!("{} has a command in flight", feeder)));
        }
        Ok(InFlightSlot {
            slots: &self.inner.in_flight,
            feeder,
        })
    }

    /// Claim, dispatch with the command bound, surface the node's verdict
    async fn mutate(&self, target: &Target, make: impl FnOnce(u32) -> Payload) -> Result<FeederSnapshot> {
        let _slot = self.claim(target.feeder)?;
        let timeout = self.inner.dispatch.command_timeout();
        let reply = self.dispatch(target, make, timeout).await?;
        reply.result?;
        Ok(reply.snapshot)
    }

    async fn dispatch(
        &self,
        target: &Target,
        make: impl FnOnce(u32) -> Payload,
        timeout: Duration,
    ) -> Result<NodeReply> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(seq, tx);
        let _pending = PendingSlot {
            pending: &self.inner.pending,
            seq,
        };

        let packet = Packet::command(target.feeder, target.node, make(seq));
        debug!(
            "Dispatching {:?} seq {} to {} at {}",
            packet.payload.code(),
            seq,
            target.feeder,
            target.node
        );
        self.inner.link.send(&packet)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::link("completion channel dropped")),
            Err(_) => {
                warn!("{} did not answer seq {} within {:?}", target.feeder, seq, timeout);
                Err(Error::Timeout {
                    after_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Fresh snapshot, or the cached one when the node is slow
    async fn snapshot(&self, target: &Target) -> Option<(FeederSnapshot, bool)> {
        let timeout = self.inner.dispatch.query_timeout();
        match self
            .dispatch(target, |seq| Payload::StatusRequest { seq }, timeout)
            .await
        {
            Ok(reply) => Some((reply.snapshot, true)),
            Err(e) => {
                let cached = self.inner.cache.lock().get(&target.feeder).copied();
                debug!("Status of {} from cache after: {}", target.feeder, e);
                cached.map(|c| {
                    debug!("Cached snapshot is {:?} old", c.at.elapsed());
                    (c.snapshot, false)
                })
            }
        }
    }

    /// Sized from the node's last reported settings; the slowest accepted
    /// settle time until the node has reported any
    fn feed_timeout(&self, feeder: FeederId, length: Option<u8>) -> Duration {
        let reported = self.inner.cache.lock().get(&feeder).map(|c| c.snapshot);
        let (length, settle_ms) = match reported {
            Some(s) if s.feed_length > 0 => (length.or(Some(s.feed_length)), s.settle_time_ms),
            _ => (length, MAX_SETTLE_TIME_MS),
        };
        self.inner.dispatch.feed_timeout(length, settle_ms)
    }

    fn record_feed(&self, feeder: FeederId, ok: bool) {
        let mut stats = self.inner.stats.lock();
        let entry = stats.entry(feeder).or_default();
        if ok {
            entry.completed += 1;
        } else {
            entry.failed += 1;
        }
    }
}

fn describe(s: &FeederSnapshot) -> String {
    format!(
        "mode: {}, servo: {} deg, tape: {}, feedback: {}, manual feed: {}, errors: {}",
        s.mode,
        s.servo_angle,
        tape_word(s.tape_loaded),
        on_off(s.feedback_enabled),
        yes_no(s.manual_feed_pending),
        s.error_count
    )
}

fn cached_marker(fresh: bool) -> &'static str {
    if fresh {
        ""
    } else {
        " (cached)"
    }
}

fn enabled_word(enabled: bool) -> &'static str {
    if enabled {
        "ENABLED"
    } else {
        "DISABLED"
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn tape_word(loaded: bool) -> &'static str {
    if loaded {
        "loaded"
    } else {
        "missing"
    }
}
