//! PID control parameters

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use serde::Deserialize;

// Internal
use super::Gains;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Minimum allowed off-track cross-track error.
pub const MIN_OFF_TRACK_CTE_M: f64 = 0.1;

/// Minimum allowed track length for tuning.
pub const MIN_TRACK_LENGTH_M: f64 = 50.0;

/// Default simulation frame rate.
pub const DEFAULT_FRAME_RATE_HZ: f64 = 25.0;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for PID control
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Params {

    /// Proportional gain, the starting point when tuning
    pub k_p: f64,

    /// Integral gain, the starting point when tuning
    pub k_i: f64,

    /// Derivative gain, the starting point when tuning
    pub k_d: f64,

    /// Absolute cross-track error above which the vehicle is considered off
    /// the track. Also scales the high-speed braking.
    ///
    /// Units: meters
    pub off_track_cte_m: f64,

    /// Rate at which telemetry frames arrive. Used to convert speed into
    /// distance travelled per frame.
    ///
    /// Units: Hz
    #[serde(default = "default_frame_rate_hz")]
    pub frame_rate_hz: f64,

    /// If present the gains are tuned with twiddle, otherwise they are used
    /// as they are.
    #[serde(default)]
    pub tuning: Option<TuningParams>,
}

/// Parameters for the twiddle search
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TuningParams {
    /// Search step of the proportional gain
    pub d_k_p: f64,

    /// Search step of the integral gain
    pub d_k_i: f64,

    /// Search step of the derivative gain
    pub d_k_d: f64,

    /// Distance after which a trial is considered to have completed the
    /// track.
    ///
    /// Units: meters
    pub track_length_m: f64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Reasons the parameters can be rejected.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParamsError {
    #[error("Gains must be finite and non-negative, found {0:?}")]
    InvalidGains(Gains),

    #[error("Off-track CTE may not be negative (found {0})")]
    NegativeOffTrackCte(f64),

    #[error("Off-track CTE must be at least {} m (found {0})", MIN_OFF_TRACK_CTE_M)]
    OffTrackCteTooSmall(f64),

    #[error("Track length may not be negative (found {0})")]
    NegativeTrackLength(f64),

    #[error("Track length must be at least {} m (found {0})", MIN_TRACK_LENGTH_M)]
    TrackLengthTooShort(f64),

    #[error("Gain deltas must be finite and positive, found {0:?}")]
    InvalidDeltas(Gains),

    #[error("Frame rate must be finite and positive (found {0})")]
    InvalidFrameRate(f64),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for Params {
    fn default() -> Self {
        Self {
            k_p: 0.12,
            k_i: 1e-5,
            k_d: 4.0,
            off_track_cte_m: 5.0,
            frame_rate_hz: DEFAULT_FRAME_RATE_HZ,
            tuning: None,
        }
    }
}

impl Params {
    /// The configured gains.
    pub fn gains(&self) -> Gains {
        Gains::new(self.k_p, self.k_i, self.k_d)
    }

    /// Check the parameters describe a usable controller.
    pub fn validate(&self) -> Result<(), ParamsError> {
        check_gains(self.gains())?;
        check_off_track_cte(self.off_track_cte_m)?;
        check_frame_rate(self.frame_rate_hz)?;

        if let Some(ref tuning) = self.tuning {
            tuning.validate()?;
        }

        Ok(())
    }
}

impl TuningParams {
    /// The search steps as a set of gains.
    pub fn deltas(&self) -> Gains {
        Gains::new(self.d_k_p, self.d_k_i, self.d_k_d)
    }

    fn validate(&self) -> Result<(), ParamsError> {
        let deltas = self.deltas();
        if !deltas.is_finite() || deltas.k_p <= 0.0 || deltas.k_i <= 0.0 || deltas.k_d <= 0.0 {
            return Err(ParamsError::InvalidDeltas(deltas));
        }

        check_track_length(self.track_length_m)
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Configured gains must be finite and non-negative.
pub fn check_gains(gains: Gains) -> Result<(), ParamsError> {
    if !gains.is_finite() || gains.k_p < 0.0 || gains.k_i < 0.0 || gains.k_d < 0.0 {
        return Err(ParamsError::InvalidGains(gains));
    }

    Ok(())
}

pub fn check_off_track_cte(off_track_cte_m: f64) -> Result<(), ParamsError> {
    if off_track_cte_m < 0.0 {
        return Err(ParamsError::NegativeOffTrackCte(off_track_cte_m));
    }
    // Negated comparison so NaN is also rejected
    if !(off_track_cte_m >= MIN_OFF_TRACK_CTE_M) {
        return Err(ParamsError::OffTrackCteTooSmall(off_track_cte_m));
    }

    Ok(())
}

pub fn check_track_length(track_length_m: f64) -> Result<(), ParamsError> {
    if track_length_m < 0.0 {
        return Err(ParamsError::NegativeTrackLength(track_length_m));
    }
    if !(track_length_m >= MIN_TRACK_LENGTH_M) {
        return Err(ParamsError::TrackLengthTooShort(track_length_m));
    }

    Ok(())
}

pub fn check_frame_rate(frame_rate_hz: f64) -> Result<(), ParamsError> {
    if !frame_rate_hz.is_finite() || frame_rate_hz <= 0.0 {
        return Err(ParamsError::InvalidFrameRate(frame_rate_hz));
    }

    Ok(())
}

fn default_frame_rate_hz() -> f64 {
    DEFAULT_FRAME_RATE_HZ
}
