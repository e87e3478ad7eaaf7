//! # PID control module
//!
//! PID control keeps the vehicle on the track by turning the cross-track error
//! (CTE) reported each frame into steering and throttle demands. It can run in
//! two modes:
//!
//! - Final: the gains are fixed and every frame produces a control demand.
//! - Tuning: the gains are searched with twiddle. Each attempt to drive the
//!   track is a trial. A trial ends when the vehicle leaves the track, stalls,
//!   or covers the track length. Ended trials are scored, new gains are
//!   proposed and the simulation is asked to reset. The first trial which
//!   completes the track with a max CTE below half of the off-track CTE has
//!   its gains adopted, and the module switches to final mode for good.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

pub mod params;
pub mod pid;
pub mod state;
pub mod twiddle;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// Internal
pub use params::{Params, ParamsError, TuningParams};
pub use pid::*;
pub use state::*;
pub use twiddle::*;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Number of tuned gains (proportional, integral, derivative).
pub const NUM_GAINS: usize = 3;

/// Distance a trial must cover before off-track and stall checks are made.
///
/// Units: meters
pub const MIN_MEASUREMENT_DISTANCE_M: f64 = 5.0;

/// Fraction of the track length driven before max CTE is recorded, so the
/// launch transient is ignored.
pub const MAX_CTE_SKIP_FRACTION: f64 = 0.025;

/// Penalty divided by distance travelled to score a trial which left the
/// track.
pub const OFF_TRACK_PENALTY: f64 = 1e6;

/// Units: meters/mile
pub const METERS_PER_MILE: f64 = 1609.344;

/// Conversion from miles per hour to meters per second.
pub const MPH_TO_MS: f64 = METERS_PER_MILE / 3600.0;

/// Speed below which the vehicle is considered stalled.
///
/// Units: miles/hour
pub const STALL_SPEED_MPH: f64 = 1.0;

/// Speed above which throttle is reduced in proportion to the CTE.
///
/// Units: miles/hour
pub const BRAKING_ONSET_SPEED_MPH: f64 = 60.0;

/// Throttle reduction per unit of CTE normalised by the off-track CTE.
pub const BRAKING_GAIN: f64 = 4.0;

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Possible errors that can occur during PidCtrl operation.
#[derive(Debug, thiserror::Error)]
pub enum PidCtrlError {
    #[error("Could not load parameters: {0}")]
    ParamLoadError(util::params::LoadError),

    #[error("Invalid parameters: {0}")]
    InvalidParams(ParamsError),

    #[error("Could not start the gain search: {0}")]
    TwiddleError(TwiddleError),

    #[error("Could not initialise the archives: {0}")]
    ArchiveError(util::archive::ArchiveError),

    /// The control law has no guard against NaN or infinite values so they
    /// are rejected before any state changes.
    #[error("Received non-finite telemetry (cte = {cte}, speed = {speed_mph})")]
    NonFiniteInput { cte: f64, speed_mph: f64 },
}
