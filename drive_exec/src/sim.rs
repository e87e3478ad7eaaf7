//! # Kinematic track simulation
//!
//! A simple stand-in for the vehicle simulator, used to exercise PidCtrl in a
//! closed loop without any network connection. The vehicle is a kinematic
//! bicycle model driving along a track whose centreline is
//!
//! ```text
//! y = amplitude * sin(x / wavelength)
//! ```
//!
//! An amplitude of zero gives a straight track along the X axis. The CTE is
//! approximated as the vertical offset from the centreline at the vehicle's X
//! position, which is close to the true lateral distance for gentle curves.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::Deserialize;

use crate::pid_ctrl::MPH_TO_MS;
use util::maths::{clamp, wrap_2pi};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Heading changes smaller than this are integrated as a straight line.
///
/// Units: radians
const STRAIGHT_TURN_TOLERANCE_RAD: f64 = 1e-3;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters of the simulated vehicle and track.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SimParams {
    /// Units: meters
    pub wheelbase_m: f64,

    /// Steer angle at a normalised steering demand of 1.
    ///
    /// Units: radians
    pub max_steer_rad: f64,

    /// Lateral offset from the centreline at the start of the track.
    ///
    /// Units: meters
    pub start_cte_m: f64,

    /// Units: miles/hour
    pub start_speed_mph: f64,

    /// Units: miles/hour
    pub max_speed_mph: f64,

    /// Acceleration at full throttle, deceleration at full reverse throttle.
    ///
    /// Units: miles/hour/second
    pub accel_mphps: f64,

    /// Units: meters
    pub track_amplitude_m: f64,

    /// Units: meters
    pub track_wavelength_m: f64,

    /// Units: Hz
    #[serde(default = "default_frame_rate_hz")]
    pub frame_rate_hz: f64,

    /// Number of frames the executable simulates before stopping
    #[serde(default = "default_max_frames")]
    pub max_frames: u64,
}

/// The simulated vehicle.
#[derive(Debug, Clone)]
pub struct KinematicSim {
    params: SimParams,

    /// Units: meters
    x_m: f64,

    /// Units: meters
    y_m: f64,

    /// Units: radians, [0, 2pi)
    heading_rad: f64,

    /// Units: miles/hour
    speed_mph: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SimError {
    #[error("The wheelbase must be positive (found {0})")]
    InvalidWheelbase(f64),

    #[error("The track wavelength must be positive (found {0})")]
    InvalidWavelength(f64),

    #[error("The frame rate must be positive (found {0})")]
    InvalidFrameRate(f64),

    #[error(
        "The controller expects frames at {ctrl_hz} Hz but the simulation \
         runs at {sim_hz} Hz"
    )]
    FrameRateMismatch { sim_hz: f64, ctrl_hz: f64 },
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for SimParams {
    fn default() -> Self {
        Self {
            wheelbase_m: 2.7,
            max_steer_rad: 0.436,
            start_cte_m: 1.0,
            start_speed_mph: 5.0,
            max_speed_mph: 30.0,
            accel_mphps: 10.0,
            track_amplitude_m: 4.0,
            track_wavelength_m: 30.0,
            frame_rate_hz: default_frame_rate_hz(),
            max_frames: default_max_frames(),
        }
    }
}

impl KinematicSim {
    /// Create a new simulation with the vehicle at the start of the track.
    pub fn new(params: SimParams) -> Result<Self, SimError> {
        if !(params.wheelbase_m > 0.0) {
            return Err(SimError::InvalidWheelbase(params.wheelbase_m));
        }
        if !(params.track_wavelength_m > 0.0) {
            return Err(SimError::InvalidWavelength(params.track_wavelength_m));
        }
        if !(params.frame_rate_hz > 0.0) {
            return Err(SimError::InvalidFrameRate(params.frame_rate_hz));
        }

        let mut sim = Self {
            params,
            x_m: 0.0,
            y_m: 0.0,
            heading_rad: 0.0,
            speed_mph: 0.0,
        };
        sim.reset();

        Ok(sim)
    }

    pub fn params(&self) -> &SimParams {
        &self.params
    }

    /// Check that a controller expecting frames at `frame_rate_hz` measures
    /// time and distance with the same frame period as the simulation.
    pub fn check_frame_rate(&self, frame_rate_hz: f64) -> Result<(), SimError> {
        if frame_rate_hz != self.params.frame_rate_hz {
            return Err(SimError::FrameRateMismatch {
                sim_hz: self.params.frame_rate_hz,
                ctrl_hz: frame_rate_hz,
            });
        }

        Ok(())
    }

    /// Return the vehicle to the start of the track.
    pub fn reset(&mut self) {
        self.x_m = 0.0;
        self.y_m = self.centreline_y_m(0.0) + self.params.start_cte_m;
        self.heading_rad = 0.0;
        self.speed_mph = self.params.start_speed_mph;
    }

    /// Signed offset of the vehicle from the centreline, positive to the
    /// left.
    ///
    /// Units: meters
    pub fn cte(&self) -> f64 {
        self.y_m - self.centreline_y_m(self.x_m)
    }

    pub fn speed_mph(&self) -> f64 {
        self.speed_mph
    }

    /// Position of the vehicle.
    ///
    /// Units: meters
    pub fn position_m(&self) -> (f64, f64) {
        (self.x_m, self.y_m)
    }

    /// Advance the simulation by one frame with the given normalised
    /// demands.
    pub fn step(&mut self, steering: f64, throttle: f64) {
        let dt_s = 1.0 / self.params.frame_rate_hz;

        self.speed_mph = clamp(
            self.speed_mph + throttle * self.params.accel_mphps * dt_s,
            0.0,
            self.params.max_speed_mph
        );
        let dist_m = self.speed_mph * MPH_TO_MS * dt_s;

        let turn_rad = (steering * self.params.max_steer_rad).tan()
            * dist_m / self.params.wheelbase_m;

        if turn_rad.abs() < STRAIGHT_TURN_TOLERANCE_RAD {
            self.x_m += dist_m * self.heading_rad.cos();
            self.y_m += dist_m * self.heading_rad.sin();
            self.heading_rad = wrap_2pi(self.heading_rad + turn_rad);
        }
        else {
            // Move along the arc about the instantaneous centre of rotation
            let radius_m = dist_m / turn_rad;
            let cx_m = self.x_m - self.heading_rad.sin() * radius_m;
            let cy_m = self.y_m + self.heading_rad.cos() * radius_m;

            self.heading_rad = wrap_2pi(self.heading_rad + turn_rad);
            self.x_m = cx_m + self.heading_rad.sin() * radius_m;
            self.y_m = cy_m - self.heading_rad.cos() * radius_m;
        }
    }

    fn centreline_y_m(&self, x_m: f64) -> f64 {
        self.params.track_amplitude_m * (x_m / self.params.track_wavelength_m).sin()
    }
}

fn default_frame_rate_hz() -> f64 {
    crate::pid_ctrl::params::DEFAULT_FRAME_RATE_HZ
}

fn default_max_frames() -> u64 {
    20_000
}
