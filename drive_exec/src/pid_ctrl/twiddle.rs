//! # Twiddle parameter search
//!
//! Coordinate-ascent local search over a fixed number of parameters. Each
//! call to `Twiddler::update_error` scores the parameter set proposed by the
//! previous call (lower is better) and proposes the next one.
//!
//! For the active parameter the search first tries `value + delta`. If that
//! doesn't beat the best score it tries `value - delta`. If neither helps the
//! value is restored and `delta` shrinks, if either helps `delta` grows.
//! Either way the search then moves on to the next parameter.
//!
//! The search never decides it has converged, the caller chooses when to stop
//! scoring trials.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::trace;
use serde::Serialize;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Factor applied to a parameter's delta when a perturbation improved the
/// score.
pub const DELTA_GROW_FACTOR: f64 = 1.1;

/// Factor applied to a parameter's delta when neither perturbation improved
/// the score.
pub const DELTA_SHRINK_FACTOR: f64 = 0.9;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A single searched parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TwiddleParam {
    /// Current value of the parameter
    pub value: f64,

    /// Perturbation step, always positive
    pub delta: f64,
}

/// Twiddle search state over `N` parameters.
#[derive(Debug, Clone)]
pub struct Twiddler<const N: usize> {
    params: [TwiddleParam; N],

    /// Lowest score seen so far, `None` until the first score arrives
    best_score: Option<f64>,

    phase: TwiddlePhase,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Which trial the next score belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TwiddlePhase {
    /// No score has been received, the next one scores the initial values.
    AwaitingFirstScore,

    /// The parameter at the index has been moved up by its delta.
    Increasing(usize),

    /// The parameter at the index has been moved down by its delta after the
    /// increase failed to improve the score.
    Decreasing(usize),
}

/// Errors raised when building a `Twiddler`.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TwiddleError {
    #[error("Cannot search over an empty parameter list")]
    NoParams,

    #[error("Parameter {index} has a non-finite value ({value})")]
    NonFiniteValue { index: usize, value: f64 },

    #[error("Parameter {index} has an invalid delta ({delta}), deltas must be finite and positive")]
    InvalidDelta { index: usize, delta: f64 },
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl TwiddleParam {
    pub fn new(value: f64, delta: f64) -> Self {
        Self { value, delta }
    }
}

impl<const N: usize> Twiddler<N> {

    /// Create a new search starting from the given parameters.
    pub fn new(params: [TwiddleParam; N]) -> Result<Self, TwiddleError> {
        if N == 0 {
            return Err(TwiddleError::NoParams);
        }

        for (index, p) in params.iter().enumerate() {
            if !p.value.is_finite() {
                return Err(TwiddleError::NonFiniteValue { index, value: p.value });
            }
            if !p.delta.is_finite() || p.delta <= 0.0 {
                return Err(TwiddleError::InvalidDelta { index, delta: p.delta });
            }
        }

        Ok(Self {
            params,
            best_score: None,
            phase: TwiddlePhase::AwaitingFirstScore,
        })
    }

    /// The parameters currently proposed for the next trial.
    pub fn params(&self) -> &[TwiddleParam; N] {
        &self.params
    }

    /// The lowest score seen so far.
    pub fn best_score(&self) -> Option<f64> {
        self.best_score
    }

    pub fn phase(&self) -> TwiddlePhase {
        self.phase
    }

    /// Score the current parameters and get the parameters for the next
    /// trial.
    pub fn update_error(&mut self, score: f64) -> [TwiddleParam; N] {
        match (self.phase, self.best_score) {
            (TwiddlePhase::AwaitingFirstScore, _) | (_, None) => {
                self.best_score = Some(score);
                self.begin_increase(0);
            }
            (TwiddlePhase::Increasing(i), Some(best))
            | (TwiddlePhase::Decreasing(i), Some(best)) if score < best => {
                self.best_score = Some(score);
                self.params[i].delta *= DELTA_GROW_FACTOR;
                self.begin_increase(self.next_index(i));
            }
            (TwiddlePhase::Increasing(i), Some(_)) => {
                self.params[i].value -= 2.0 * self.params[i].delta;
                self.phase = TwiddlePhase::Decreasing(i);
            }
            (TwiddlePhase::Decreasing(i), Some(_)) => {
                self.params[i].value += self.params[i].delta;
                self.params[i].delta *= DELTA_SHRINK_FACTOR;
                self.begin_increase(self.next_index(i));
            }
        }

        trace!(
            "Twiddle score {}, best {:?}, next phase {:?}",
            score, self.best_score, self.phase
        );

        self.params
    }

    fn next_index(&self, index: usize) -> usize {
        (index + 1) % N
    }

    fn begin_increase(&mut self, index: usize) {
        self.params[index].value += self.params[index].delta;
        self.phase = TwiddlePhase::Increasing(index);
    }
}
