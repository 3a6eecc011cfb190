//! Feeder state machine
//!
//! Lives on the actuator node. Owns the operational mode, the feedback state
//! and the fault counter of a single tape feeder, and turns feed or retract
//! requests into the servo angles the node steps through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::{FeederSnapshot, OperationalMode};

/// Tape advance granularity of the mechanism
pub const FEED_PITCH: u8 = 2;
/// Longest single feed the mechanism travels
pub const MAX_FEED_LENGTH: u8 = 24;
pub const MAX_SERVO_ANGLE: u16 = 180;
/// Keeps the longest plan inside the default 15 s feed timeout ceiling
pub const MAX_SETTLE_TIME_MS: u64 = 900;

/// Accept even lengths in `[FEED_PITCH, MAX_FEED_LENGTH]`
pub fn validate_feed_length(length: i64) -> Result<u8> {
    let pitch = i64::from(FEED_PITCH);
    if length >= pitch && length <= i64::from(MAX_FEED_LENGTH) && length % pitch == 0 {
        Ok(length as u8)
    } else {
        Err(Error::invalid(format!(
            "feed length {} (allowed: even values {}-{})",
            length, FEED_PITCH, MAX_FEED_LENGTH
        )))
    }
}

pub fn validate_angle(angle: i64) -> Result<u16> {
    if (0..=i64::from(MAX_SERVO_ANGLE)).contains(&angle) {
        Ok(angle as u16)
    } else {
        Err(Error::invalid(format!(
            "angle {} outside 0-{}",
            angle, MAX_SERVO_ANGLE
        )))
    }
}

/// Mechanical tuning of one feeder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeederSettings {
    pub full_advance_angle: u16,
    pub half_advance_angle: u16,
    pub retract_angle: u16,
    /// Length used when a feed names none
    pub feed_length: u8,
    pub settle_time_ms: u64,
}

impl Default for FeederSettings {
    fn default() -> Self {
        Self {
            full_advance_angle: 80,
            half_advance_angle: 40,
            retract_angle: 0,
            feed_length: 4,
            settle_time_ms: 255,
        }
    }
}

impl FeederSettings {
    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.settle_time_ms)
    }

    pub fn validate(&self) -> Result<()> {
        for angle in [
            self.full_advance_angle,
            self.half_advance_angle,
            self.retract_angle,
        ] {
            validate_angle(i64::from(angle))?;
        }
        validate_feed_length(i64::from(self.feed_length))?;
        if self.settle_time_ms > MAX_SETTLE_TIME_MS {
            return Err(Error::invalid(format!(
                "settle time {} ms above {}",
                self.settle_time_ms, MAX_SETTLE_TIME_MS
            )));
        }
        Ok(())
    }

    /// Apply a partial update; all or nothing
    pub fn apply(&mut self, patch: &SettingsPatch) -> Result<()> {
        let mut next = *self;
        if let Some(angle) = patch.full_advance_angle {
            next.full_advance_angle = angle;
        }
        if let Some(angle) = patch.half_advance_angle {
            next.half_advance_angle = angle;
        }
        if let Some(angle) = patch.retract_angle {
            next.retract_angle = angle;
        }
        if let Some(length) = patch.feed_length {
            next.feed_length = length;
        }
        if let Some(ms) = patch.settle_time_ms {
            next.settle_time_ms = ms;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

/// Partial settings update carried by `CONFIGURE`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_advance_angle: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub half_advance_angle: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retract_angle: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_length: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settle_time_ms: Option<u64>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == SettingsPatch::default()
    }
}

/// Where the feed lever rests between motions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServoPosition {
    #[default]
    Retracted,
    HalfAdvanced,
    FullAdvanced,
}

/// Break a feed of `length` units into servo angles.
///
/// A full stroke moves 4 units and a half stroke 2. Returns the angles in
/// order and the position the lever ends in.
pub fn plan_feed(
    from: ServoPosition,
    length: u8,
    settings: &FeederSettings,
) -> (Vec<u16>, ServoPosition) {
    let mut remaining = length;
    let mut position = from;
    let mut steps = Vec::new();

    loop {
        match position {
            ServoPosition::Retracted if remaining >= 2 * FEED_PITCH => {
                steps.push(settings.full_advance_angle);
                position = ServoPosition::FullAdvanced;
                remaining -= 2 * FEED_PITCH;
            }
            ServoPosition::Retracted if remaining >= FEED_PITCH => {
                steps.push(settings.half_advance_angle);
                position = ServoPosition::HalfAdvanced;
                remaining -= FEED_PITCH;
            }
            ServoPosition::HalfAdvanced if remaining >= FEED_PITCH => {
                steps.push(settings.full_advance_angle);
                position = ServoPosition::FullAdvanced;
                remaining -= FEED_PITCH;
            }
            ServoPosition::FullAdvanced => {
                steps.push(settings.retract_angle);
                position = ServoPosition::Retracted;
            }
            _ => break,
        }
    }

    (steps, position)
}

/// Upper bound on the strokes `plan_feed` emits for `length`, from any
/// starting position
pub fn max_strokes(length: u8) -> u64 {
    u64::from(length / FEED_PITCH) + 1
}

/// Manual-feed flag shared between the trigger and the node loop
#[derive(Debug, Clone, Default)]
pub struct ManualFeedLatch(Arc<AtomicBool>);

impl ManualFeedLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns whether the flag was set
    pub fn clear(&self) -> bool {
        self.0
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Debounced manual-feed button.
///
/// A press counts only when its width falls inside the configured window.
/// Accepted presses latch the flag and wake the node loop.
#[derive(Debug)]
pub struct ManualTrigger {
    min_pulse: Duration,
    max_pulse: Duration,
    pressed_at: Option<Instant>,
    latch: ManualFeedLatch,
    events: mpsc::Sender<()>,
}

impl ManualTrigger {
    pub fn new(
        min_pulse: Duration,
        max_pulse: Duration,
        latch: ManualFeedLatch,
        events: mpsc::Sender<()>,
    ) -> Self {
        Self {
            min_pulse,
            max_pulse,
            pressed_at: None,
            latch,
            events,
        }
    }

    pub fn press(&mut self, now: Instant) {
        self.pressed_at = Some(now);
    }

    /// Returns true when the pulse was accepted
    pub fn release(&mut self, now: Instant) -> bool {
        let Some(pressed_at) = self.pressed_at.take() else {
            return false;
        };
        let width = now.saturating_duration_since(pressed_at);
        if width < self.min_pulse || width > self.max_pulse {
            debug!("Ignoring manual pulse of {:?}", width);
            return false;
        }

        self.latch.set();
        // A full queue already holds a wake-up for the loop
        let _ = self.events.try_send(());
        true
    }
}

/// Per-feeder state owned by the node loop
#[derive(Debug)]
pub struct Feeder {
    settings: FeederSettings,
    mode: OperationalMode,
    feedback_enabled: bool,
    tape_loaded: bool,
    error_count: u32,
    servo_angle: u16,
    position: ServoPosition,
    latch: ManualFeedLatch,
}

impl Feeder {
    pub fn new(settings: FeederSettings, feedback_enabled: bool, latch: ManualFeedLatch) -> Self {
        Self {
            servo_angle: settings.retract_angle,
            settings,
            mode: OperationalMode::Idle,
            feedback_enabled,
            tape_loaded: false,
            error_count: 0,
            position: ServoPosition::Retracted,
            latch,
        }
    }

    pub fn mode(&self) -> OperationalMode {
        self.mode
    }

    pub fn settings(&self) -> &FeederSettings {
        &self.settings
    }

    pub fn snapshot(&self) -> FeederSnapshot {
        FeederSnapshot {
            mode: self.mode,
            feedback_enabled: self.feedback_enabled,
            tape_loaded: self.tape_loaded,
            manual_feed_pending: self.latch.is_pending(),
            error_count: self.error_count,
            servo_angle: self.servo_angle,
            feed_length: self.settings.feed_length,
            settle_time_ms: self.settings.settle_time_ms,
        }
    }

    /// Enter `Feeding` and plan the strokes. `None` feeds the configured length.
    pub fn begin_feed(&mut self, length: Option<u8>, force: bool) -> Result<Vec<u16>> {
        let length = match length {
            Some(length) => validate_feed_length(i64::from(length))?,
            None => self.settings.feed_length,
        };

        match self.mode {
            OperationalMode::Idle => {}
            OperationalMode::Faulted if force => {
                info!("Forced feed overriding fault ({} errors)", self.error_count);
            }
            OperationalMode::Faulted => {
                return Err(Error::busy(
                    "feeder faulted, force with X1 or disable feedback with M605 S0",
                ));
            }
            mode => return Err(Error::busy(format!("feeder {}", mode))),
        }

        let (steps, end) = plan_feed(self.position, length, &self.settings);
        self.position = end;
        self.mode = OperationalMode::Feeding;
        Ok(steps)
    }

    /// Enter `Retracting`; allowed from `Idle` or mid-feed
    pub fn begin_retract(&mut self) -> Result<Vec<u16>> {
        match self.mode {
            OperationalMode::Idle | OperationalMode::Feeding => {}
            OperationalMode::Retracting => return Err(Error::busy("feeder retracting")),
            OperationalMode::Faulted => return Err(Error::busy("feeder faulted")),
        }
        self.position = ServoPosition::Retracted;
        self.mode = OperationalMode::Retracting;
        Ok(vec![self.settings.retract_angle])
    }

    pub fn record_step(&mut self, angle: u16) {
        self.servo_angle = angle;
    }

    /// Close out the current motion, checking tape presence unless forced
    pub fn finish_motion(&mut self, tape_present: bool, force: bool) -> Result<()> {
        self.tape_loaded = tape_present;
        if self.feedback_enabled && !force && !tape_present {
            self.mode = OperationalMode::Faulted;
            self.error_count = self.error_count.saturating_add(1);
            warn!("No tape after motion, fault #{}", self.error_count);
            return Err(Error::FeedbackFault {
                error_count: self.error_count,
            });
        }
        self.mode = OperationalMode::Idle;
        Ok(())
    }

    pub fn set_angle(&mut self, angle: u16) -> Result<()> {
        validate_angle(i64::from(angle))?;
        if self.mode.is_moving() {
            return Err(Error::busy(format!("feeder {}", self.mode)));
        }
        self.servo_angle = angle;
        Ok(())
    }

    /// Toggle feedback checking; disabling clears a fault
    pub fn set_feedback(&mut self, enabled: bool, tape_present: bool) {
        self.feedback_enabled = enabled;
        if enabled {
            self.tape_loaded = tape_present;
        } else if self.mode == OperationalMode::Faulted {
            info!("Feedback disabled, clearing fault");
            self.mode = OperationalMode::Idle;
        }
    }

    /// Returns true when the reading changed
    pub fn observe_tape(&mut self, present: bool) -> bool {
        let changed = self.tape_loaded != present;
        self.tape_loaded = present;
        changed
    }

    pub fn manual_feed_pending(&self) -> bool {
        self.latch.is_pending()
    }

    pub fn clear_manual_feed(&mut self) -> bool {
        self.latch.clear()
    }

    pub fn configure(&mut self, patch: &SettingsPatch) -> Result<()> {
        if self.mode.is_moving() {
            return Err(Error::busy(format!("feeder {}", self.mode)));
        }
        self.settings.apply(patch)
    }
}
