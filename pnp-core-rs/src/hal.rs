//! Hardware seam of the actuator node
//!
//! The node drives a hobby servo and reads a tape-presence sensor. Real boards
//! implement these traits over PWM and GPIO; the simulated versions here back
//! the `pnp-hand` binary and the tests.
//!
//! # Implementing a servo
//!
//! ```ignore
//! struct PwmServo { channel: Pwm }
//!
//! impl Servo for PwmServo {
//!     fn set_angle(&mut self, angle: u16) {
//!         self.channel.set_duty(angle_to_duty(angle));
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

// ============================================================================
// Traits
// ============================================================================

/// Position-controlled servo
pub trait Servo: Send {
    /// Command an absolute angle in degrees, `[0, 180]`
    fn set_angle(&mut self, angle: u16);
}

/// Tape-presence sensor
pub trait TapeSensor: Send + Sync {
    fn tape_present(&self) -> bool;
}

// ============================================================================
// Simulation
// ============================================================================

/// Servo that records every commanded angle
#[derive(Debug, Clone, Default)]
pub struct SimServo {
    history: Arc<Mutex<Vec<u16>>>,
}

impl SimServo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<u16> {
        self.history.lock().clone()
    }

    pub fn last_angle(&self) -> Option<u16> {
        self.history.lock().last().copied()
    }
}

impl Servo for SimServo {
    fn set_angle(&mut self, angle: u16) {
        debug!("Servo -> {} deg", angle);
        self.history.lock().push(angle);
    }
}

/// Sensor whose reading is set from outside
#[derive(Debug, Clone)]
pub struct SimTapeSensor {
    present: Arc<AtomicBool>,
}

impl SimTapeSensor {
    pub fn new(present: bool) -> Self {
        Self {
            present: Arc::new(AtomicBool::new(present)),
        }
    }

    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::Release);
    }
}

impl TapeSensor for SimTapeSensor {
    fn tape_present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }
}
