//! # PID error transducer
//!
//! The lowest level of the steering control loop. A `Pid` turns the current
//! cross-track error into a steering demand using
//!
//! ```text
//! out = -k_p * e - k_d * (e - e_prev) - k_i * sum(e)
//! ```
//!
//! The controller is frame-based rather than time-aware: it assumes one call
//! per simulation frame at a fixed rate, so the derivative and integral terms
//! are in units of "per frame". No output limiting is performed here.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// The three gains of a PID controller.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gains {
    /// Proportional gain
    pub k_p: f64,

    /// Integral gain
    pub k_i: f64,

    /// Derivative gain
    pub k_d: f64,
}

/// A PID controller
#[derive(Debug, Serialize, Clone)]
pub struct Pid {
    gains: Gains,

    /// Error from the previous call, zero before the first call
    prev_error: f64,

    /// The integral accumulation
    integral: f64,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Gains {
    pub fn new(k_p: f64, k_i: f64, k_d: f64) -> Self {
        Self { k_p, k_i, k_d }
    }

    /// Returns true if all gains are finite numbers.
    pub fn is_finite(&self) -> bool {
        self.k_p.is_finite() && self.k_i.is_finite() && self.k_d.is_finite()
    }
}

impl Pid {

    /// Create a new controller with the given gains.
    ///
    /// The integral and previous error both start at zero, the only way to
    /// clear them is to create a new controller.
    pub fn new(gains: Gains) -> Self {
        Self {
            gains,
            prev_error: 0f64,
            integral: 0f64,
        }
    }

    /// The gains this controller was built with.
    pub fn gains(&self) -> Gains {
        self.gains
    }

    /// Get the value of the controller for the given error.
    pub fn get(&mut self, error: f64) -> f64 {
        self.integral += error;
        let deriv = error - self.prev_error;
        self.prev_error = error;

        - self.gains.k_p * error
        - self.gains.k_d * deriv
        - self.gains.k_i * self.integral
    }
}
