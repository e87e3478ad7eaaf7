//! PidCtrl module state

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::{debug, info, trace};
use serde::Serialize;

// Internal
use super::*;
use util::{
    archive::{Archived, ArchiveError, Archiver},
    maths::normalise,
    module::State,
    session::Session,
};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// The PID control module.
pub struct PidCtrl {
    /// The gain search and trial bookkeeping, `None` once final gains are in
    /// use.
    tuner: Option<Tuner>,

    /// Controller operating on the CTE. Replaced whenever new gains are
    /// proposed.
    pid: Pid,

    /// Units: meters
    off_track_cte_m: f64,

    /// Units: Hz
    frame_rate_hz: f64,

    report: StatusReport,
    arch_report: Archiver,

    /// Report on the trial which ended during the last frame, if any
    trial_report: Option<TrialReport>,
    arch_trials: Archiver,
}

/// State of the gain search.
struct Tuner {
    twiddler: Twiddler<NUM_GAINS>,

    /// Units: meters
    track_length_m: f64,

    /// Number of the trial currently being driven, starting at zero
    trial_num: u32,

    /// Units: meters
    distance_m: f64,

    /// Units: seconds
    time_s: f64,

    /// Largest absolute CTE seen after the launch transient.
    ///
    /// Units: meters
    max_cte_m: f64,
}

/// Telemetry for a single frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct InputData {
    /// Signed cross-track error.
    ///
    /// Units: meters
    pub cte_m: f64,

    /// Units: miles/hour
    pub speed_mph: f64,
}

/// Status report for PidCtrl processing.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct StatusReport {
    pub mode: PidCtrlMode,
    pub trial_num: u32,
    pub distance_m: f64,
    pub time_s: f64,
    pub max_cte_m: f64,

    /// The CTE exceeded the off-track CTE
    pub off_track: bool,

    /// The speed dropped below the stall speed
    pub stalled: bool,

    /// The trial covered the track length
    pub track_complete: bool,

    /// The gains were adopted as final on this frame
    pub finalised: bool,
}

/// Summary of a finished trial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrialReport {
    pub trial_num: u32,
    pub k_p: f64,
    pub k_i: f64,
    pub k_d: f64,
    pub distance_m: f64,
    pub time_s: f64,
    pub max_cte_m: f64,
    pub avg_speed_mph: f64,

    /// Score passed to the gain search, lower is better. Completed trials are
    /// not scored and carry their max CTE.
    pub score: f64,
    pub outcome: TrialOutcome,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Mode of the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PidCtrlMode {
    /// Searching for gains
    Tuning,

    /// Using fixed gains, never left once entered
    Final,
}

/// Result of processing one frame. Exactly one of these is produced for each
/// frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PidCtrlOutput {
    /// Demands to send to the vehicle. Both are in `[-1, 1]`.
    Control { steering: f64, throttle: f64 },

    /// The trial has ended, the vehicle must be returned to the start of the
    /// track.
    Reset,
}

/// How a trial ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrialOutcome {
    /// The CTE exceeded the off-track CTE
    OffTrack,

    /// The vehicle dropped below the stall speed. Scored the same as leaving
    /// the track.
    Stalled,

    /// The track was covered but the max CTE was too large
    Incomplete,

    /// The track was covered with a small enough max CTE, the gains are final
    Completed,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for PidCtrlMode {
    fn default() -> Self {
        PidCtrlMode::Final
    }
}

impl State for PidCtrl {
    type InitData = String;
    type InitError = PidCtrlError;

    type InputData = InputData;
    type OutputData = PidCtrlOutput;
    type StatusReport = StatusReport;
    type ProcError = PidCtrlError;

    /// Initialise the PidCtrl module.
    ///
    /// Expected init data is the path to the parameter file, relative to the
    /// params directory.
    fn init(init_data: Self::InitData, session: &Session)
        -> Result<Self, Self::InitError>
    {
        let params: Params = util::params::load(&init_data)
            .map_err(PidCtrlError::ParamLoadError)?;

        Self::from_params(&params)?.with_archives(session)
    }

    /// Process one frame of telemetry.
    fn proc(&mut self, input_data: &Self::InputData)
        -> Result<(Self::OutputData, Self::StatusReport), Self::ProcError>
    {
        let output = self.update(input_data.cte_m, input_data.speed_mph)?;

        Ok((output, self.report))
    }
}

impl Archived for PidCtrl {
    /// Write the status report and any finished trial. Archives which weren't
    /// set up by `with_archives` are skipped.
    fn write(&mut self) -> Result<(), ArchiveError> {
        if self.arch_report.is_init() {
            self.arch_report.serialise(self.report)?;
        }

        if let Some(trial) = self.trial_report {
            if self.arch_trials.is_init() {
                self.arch_trials.serialise(trial)?;
            }
        }

        Ok(())
    }
}

impl PidCtrl {

    /// Create a controller which uses the given gains without tuning them.
    ///
    /// The off-track CTE is still needed to scale the high-speed braking.
    pub fn with_final_gains(
        gains: Gains,
        off_track_cte_m: f64
    ) -> Result<Self, PidCtrlError> {
        params::check_gains(gains).map_err(PidCtrlError::InvalidParams)?;
        params::check_off_track_cte(off_track_cte_m)
            .map_err(PidCtrlError::InvalidParams)?;

        info!(
            "Creating PID controller with final gains Kp={}, Ki={}, Kd={}",
            gains.k_p, gains.k_i, gains.k_d
        );

        Ok(Self::build(None, gains, off_track_cte_m))
    }

    /// Create a controller which searches for gains starting from `gains`
    /// with search steps `deltas`.
    pub fn with_tuning(
        gains: Gains,
        deltas: Gains,
        off_track_cte_m: f64,
        track_length_m: f64
    ) -> Result<Self, PidCtrlError> {
        params::check_gains(gains).map_err(PidCtrlError::InvalidParams)?;
        params::check_off_track_cte(off_track_cte_m)
            .map_err(PidCtrlError::InvalidParams)?;
        params::check_track_length(track_length_m)
            .map_err(PidCtrlError::InvalidParams)?;

        info!(
            "Creating PID controller with initial gains Kp={}, Ki={}, Kd={}, \
            dKp={}, dKi={}, dKd={}",
            gains.k_p, gains.k_i, gains.k_d,
            deltas.k_p, deltas.k_i, deltas.k_d
        );

        let twiddler = Twiddler::new([
            TwiddleParam::new(gains.k_p, deltas.k_p),
            TwiddleParam::new(gains.k_i, deltas.k_i),
            TwiddleParam::new(gains.k_d, deltas.k_d),
        ]).map_err(PidCtrlError::TwiddleError)?;

        let tuner = Tuner {
            twiddler,
            track_length_m,
            trial_num: 0,
            distance_m: 0.0,
            time_s: 0.0,
            max_cte_m: 0.0,
        };

        Ok(Self::build(Some(tuner), gains, off_track_cte_m))
    }

    /// Create a controller from validated parameters, without archives.
    pub fn from_params(params: &Params) -> Result<Self, PidCtrlError> {
        params.validate().map_err(PidCtrlError::InvalidParams)?;

        let pid_ctrl = match params.tuning {
            Some(ref t) => Self::with_tuning(
                params.gains(), t.deltas(), params.off_track_cte_m, t.track_length_m
            )?,
            None => Self::with_final_gains(params.gains(), params.off_track_cte_m)?
        };

        pid_ctrl.with_frame_rate(params.frame_rate_hz)
    }

    /// Set the rate at which frames are expected.
    pub fn with_frame_rate(mut self, frame_rate_hz: f64) -> Result<Self, PidCtrlError> {
        params::check_frame_rate(frame_rate_hz).map_err(PidCtrlError::InvalidParams)?;

        self.frame_rate_hz = frame_rate_hz;
        Ok(self)
    }

    /// Archive the status and trial reports into the session's `pid_ctrl`
    /// directory.
    pub fn with_archives(mut self, session: &Session) -> Result<Self, PidCtrlError> {
        self.arch_report = Archiver::from_path(
            session, "pid_ctrl/status_report.csv"
        ).map_err(PidCtrlError::ArchiveError)?;
        self.arch_trials = Archiver::from_path(
            session, "pid_ctrl/trials.csv"
        ).map_err(PidCtrlError::ArchiveError)?;

        Ok(self)
    }

    fn build(tuner: Option<Tuner>, gains: Gains, off_track_cte_m: f64) -> Self {
        Self {
            tuner,
            pid: Pid::new(gains),
            off_track_cte_m,
            frame_rate_hz: params::DEFAULT_FRAME_RATE_HZ,
            report: StatusReport::default(),
            arch_report: Archiver::default(),
            trial_report: None,
            arch_trials: Archiver::default(),
        }
    }

    /// Units: Hz
    pub fn frame_rate_hz(&self) -> f64 {
        self.frame_rate_hz
    }

    pub fn mode(&self) -> PidCtrlMode {
        match self.tuner {
            Some(_) => PidCtrlMode::Tuning,
            None => PidCtrlMode::Final
        }
    }

    /// Gains of the controller currently in use.
    pub fn gains(&self) -> Gains {
        self.pid.gains()
    }

    /// The gain search, if still tuning.
    pub fn twiddler(&self) -> Option<&Twiddler<NUM_GAINS>> {
        self.tuner.as_ref().map(|t| &t.twiddler)
    }

    /// Status of the last processed frame.
    pub fn report(&self) -> &StatusReport {
        &self.report
    }

    /// Summary of the trial which ended on the last processed frame.
    pub fn trial_report(&self) -> Option<&TrialReport> {
        self.trial_report.as_ref()
    }

    /// Process one frame of telemetry.
    ///
    /// Returns either the control demands for this frame or a request to
    /// reset the vehicle when a trial has ended. Non-finite inputs are
    /// rejected with an error and leave the module untouched.
    pub fn update(
        &mut self,
        cte_m: f64,
        speed_mph: f64
    ) -> Result<PidCtrlOutput, PidCtrlError> {
        if !cte_m.is_finite() || !speed_mph.is_finite() {
            return Err(PidCtrlError::NonFiniteInput { cte: cte_m, speed_mph });
        }

        // Setup cycle data
        self.report = StatusReport {
            mode: self.mode(),
            ..StatusReport::default()
        };
        self.trial_report = None;

        if self.proc_trial(cte_m, speed_mph) {
            return Ok(PidCtrlOutput::Reset);
        }

        let steering = normalise(self.pid.get(cte_m));
        let throttle = if speed_mph > BRAKING_ONSET_SPEED_MPH {
            normalise(1.0 - BRAKING_GAIN * cte_m.abs() / self.off_track_cte_m)
        }
        else {
            1.0
        };

        trace!(
            "PidCtrl cte {:.4} m, speed {:.2} mph -> steering {:.4}, throttle {:.4}",
            cte_m, speed_mph, steering, throttle
        );

        Ok(PidCtrlOutput::Control { steering, throttle })
    }

    /// Process one frame of telemetry, calling `on_control` with the steering
    /// and throttle demands or `on_reset` if the trial ended.
    ///
    /// On `Ok` exactly one of the callbacks has been called. On error neither
    /// has.
    pub fn update_with<C, R>(
        &mut self,
        cte_m: f64,
        speed_mph: f64,
        on_control: C,
        on_reset: R
    ) -> Result<(), PidCtrlError>
    where
        C: FnOnce(f64, f64),
        R: FnOnce()
    {
        match self.update(cte_m, speed_mph)? {
            PidCtrlOutput::Control { steering, throttle } => on_control(steering, throttle),
            PidCtrlOutput::Reset => on_reset()
        }

        Ok(())
    }

    /// Update the trial bookkeeping, ending the trial if required.
    ///
    /// Returns true if the trial was ended and the vehicle must be reset.
    fn proc_trial(&mut self, cte_m: f64, speed_mph: f64) -> bool {
        let off_track_cte_m = self.off_track_cte_m;
        let frame_rate_hz = self.frame_rate_hz;

        let tuner = match self.tuner.as_mut() {
            Some(t) => t,
            None => return false
        };

        tuner.distance_m += speed_mph * MPH_TO_MS / frame_rate_hz;
        tuner.time_s += 1.0 / frame_rate_hz;

        if tuner.distance_m > tuner.track_length_m * MAX_CTE_SKIP_FRACTION
            && cte_m.abs() > tuner.max_cte_m
        {
            tuner.max_cte_m = cte_m.abs();
            debug!(
                "New max CTE {:.3} m at distance {:.1} m",
                tuner.max_cte_m, tuner.distance_m
            );
        }

        self.report.trial_num = tuner.trial_num;
        self.report.distance_m = tuner.distance_m;
        self.report.time_s = tuner.time_s;
        self.report.max_cte_m = tuner.max_cte_m;

        // Detect leaving the track, either laterally or by stalling
        if tuner.distance_m > MIN_MEASUREMENT_DISTANCE_M {
            self.report.off_track = cte_m.abs() > off_track_cte_m;
            self.report.stalled = speed_mph < STALL_SPEED_MPH;

            let outcome = if self.report.off_track {
                Some(TrialOutcome::OffTrack)
            }
            else if self.report.stalled {
                Some(TrialOutcome::Stalled)
            }
            else {
                None
            };

            if let Some(outcome) = outcome {
                let score = OFF_TRACK_PENALTY / tuner.distance_m;
                info!(
                    "Trial {} {:?} at distance {:.1} m, speed {:.1} mph (score {:.1})",
                    tuner.trial_num, outcome, tuner.distance_m, speed_mph, score
                );

                let (report, gains) = tuner.end_trial(self.pid.gains(), outcome, score);
                self.pid = Pid::new(gains);
                self.trial_report = Some(report);
                return true;
            }
        }

        // Detect completing the track
        if tuner.distance_m > tuner.track_length_m {
            self.report.track_complete = true;
            info!(
                "Trial {} covered {:.1} m in {:.1} s (average speed {:.1} mph), max CTE {:.3} m",
                tuner.trial_num, tuner.distance_m, tuner.time_s,
                tuner.avg_speed_mph(), tuner.max_cte_m
            );

            if tuner.max_cte_m < off_track_cte_m / 2.0 {
                let gains = self.pid.gains();
                info!(
                    "Using the final gains Kp={}, Ki={}, Kd={}",
                    gains.k_p, gains.k_i, gains.k_d
                );

                self.trial_report = Some(tuner.report(
                    gains, TrialOutcome::Completed, tuner.max_cte_m
                ));
                self.report.finalised = true;
                self.report.mode = PidCtrlMode::Final;
                self.tuner = None;
                return false;
            }

            let score = tuner.max_cte_m;
            let (report, gains) = tuner.end_trial(
                self.pid.gains(), TrialOutcome::Incomplete, score
            );
            self.pid = Pid::new(gains);
            self.trial_report = Some(report);
            return true;
        }

        false
    }
}

impl Tuner {
    /// Units: miles/hour
    fn avg_speed_mph(&self) -> f64 {
        self.distance_m / (self.time_s * MPH_TO_MS)
    }

    fn report(&self, gains: Gains, outcome: TrialOutcome, score: f64) -> TrialReport {
        TrialReport {
            trial_num: self.trial_num,
            k_p: gains.k_p,
            k_i: gains.k_i,
            k_d: gains.k_d,
            distance_m: self.distance_m,
            time_s: self.time_s,
            max_cte_m: self.max_cte_m,
            avg_speed_mph: self.avg_speed_mph(),
            score,
            outcome,
        }
    }

    /// Score the trial driven with `gains`, reset the bookkeeping and get the
    /// gains for the next trial.
    fn end_trial(
        &mut self,
        gains: Gains,
        outcome: TrialOutcome,
        score: f64
    ) -> (TrialReport, Gains) {
        let report = self.report(gains, outcome, score);

        let [k_p, k_i, k_d] = self.twiddler.update_error(score);
        let next = Gains::new(k_p.value, k_i.value, k_d.value);

        info!("Trying PID gains Kp={}, Ki={}, Kd={}", next.k_p, next.k_i, next.k_d);

        self.trial_num += 1;
        self.distance_m = 0.0;
        self.time_s = 0.0;
        self.max_cte_m = 0.0;

        (report, next)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{KinematicSim, SimParams};
    use approx::assert_abs_diff_eq;
    use std::cell::Cell;

    const GAINS: Gains = Gains { k_p: 0.1, k_i: 1e-4, k_d: 4.0 };
    const DELTAS: Gains = Gains { k_p: 0.01, k_i: 1e-5, k_d: 0.1 };
    const OFF_TRACK_CTE_M: f64 = 5.0;

    /// At 100 mph each frame covers 1.788 m, so the 28th frame passes 50 m.
    const FRAMES_BEFORE_COMPLETE: usize = 27;

    /// The shortest allowed track, so trials end quickly.
    fn short_track() -> PidCtrl {
        PidCtrl::with_tuning(GAINS, DELTAS, OFF_TRACK_CTE_M, params::MIN_TRACK_LENGTH_M)
            .unwrap()
    }

    /// Read an archive back as a header and rows of fields.
    fn read_archive(session: &Session, path: &str) -> (Vec<String>, Vec<Vec<String>>) {
        let contents = std::fs::read_to_string(session.arch_root.join(path)).unwrap();
        let mut lines = contents
            .lines()
            .map(|l| l.split(',').map(String::from).collect::<Vec<_>>());

        let header = lines.next().unwrap();
        (header, lines.collect())
    }

    fn expect_control(out: PidCtrlOutput) -> (f64, f64) {
        match out {
            PidCtrlOutput::Control { steering, throttle } => (steering, throttle),
            PidCtrlOutput::Reset => panic!("Expected a control output, got a reset")
        }
    }

    #[test]
    fn test_final_gains_converge() {
        // Straight track, 1 m per frame with a 20 m wheelbase and no
        // acceleration, starting 1 m off the centreline
        let speed_mph = 25.0 / MPH_TO_MS;
        let mut sim = KinematicSim::new(SimParams {
            wheelbase_m: 20.0,
            max_steer_rad: 1.0,
            start_cte_m: 1.0,
            start_speed_mph: speed_mph,
            max_speed_mph: speed_mph,
            accel_mphps: 0.0,
            track_amplitude_m: 0.0,
            ..SimParams::default()
        }).unwrap();

        let mut pid_ctrl = PidCtrl::with_final_gains(GAINS, OFF_TRACK_CTE_M).unwrap();
        let mut steering = 1.0;
        let mut throttle = 0.0;

        for _ in 0..200 {
            let out = pid_ctrl.update(sim.cte(), sim.speed_mph()).unwrap();
            let (s, t) = expect_control(out);
            steering = s;
            throttle = t;
            sim.step(steering, throttle);
        }

        assert_abs_diff_eq!(steering, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(throttle, 1.0, epsilon = 0.1);
        assert_eq!(pid_ctrl.mode(), PidCtrlMode::Final);
    }

    #[test]
    fn test_on_track() {
        let mut pid_ctrl = short_track();
        let mut last = (0.0, 0.0);

        for _ in 0..5 {
            last = expect_control(pid_ctrl.update(4.99, 100.0).unwrap());
        }

        assert_abs_diff_eq!(last.0, -0.5, epsilon = 0.1);
        assert_abs_diff_eq!(last.1, -1.0, epsilon = 1e-3);
        assert_eq!(pid_ctrl.report().trial_num, 0);
        assert!(pid_ctrl.trial_report().is_none());
    }

    #[test]
    fn test_off_track() {
        let mut pid_ctrl = short_track();

        for _ in 0..5 {
            expect_control(pid_ctrl.update(4.99, 100.0).unwrap());
        }
        let distance_m = pid_ctrl.report().distance_m + 100.0 * MPH_TO_MS / 25.0;

        assert_eq!(pid_ctrl.update(5.01, 100.0).unwrap(), PidCtrlOutput::Reset);

        let trial = *pid_ctrl.trial_report().unwrap();
        assert_eq!(trial.outcome, TrialOutcome::OffTrack);
        assert_eq!(trial.trial_num, 0);
        assert_abs_diff_eq!(trial.distance_m, distance_m, epsilon = 1e-9);
        assert_abs_diff_eq!(trial.score, OFF_TRACK_PENALTY / distance_m, epsilon = 1e-6);
        assert!(pid_ctrl.report().off_track);

        // The first score moves Kp up by its delta
        assert_abs_diff_eq!(pid_ctrl.gains().k_p, GAINS.k_p + DELTAS.k_p);
        assert_eq!(pid_ctrl.gains().k_i, GAINS.k_i);
        assert_eq!(pid_ctrl.gains().k_d, GAINS.k_d);

        // The next frame starts a fresh trial
        expect_control(pid_ctrl.update(0.0, 100.0).unwrap());
        assert_eq!(pid_ctrl.report().trial_num, 1);
        assert_abs_diff_eq!(pid_ctrl.report().distance_m, 100.0 * MPH_TO_MS / 25.0);
        assert_eq!(pid_ctrl.report().max_cte_m, 0.0);
    }

    #[test]
    fn test_large_cte_before_measurement_distance() {
        let mut pid_ctrl = short_track();

        // 3.6 m covered, checks are not made yet
        expect_control(pid_ctrl.update(20.0, 100.0).unwrap());
        expect_control(pid_ctrl.update(20.0, 100.0).unwrap());

        // 5.4 m covered
        assert_eq!(pid_ctrl.update(20.0, 100.0).unwrap(), PidCtrlOutput::Reset);
    }

    #[test]
    fn test_stalled() {
        let mut pid_ctrl = short_track();

        for _ in 0..3 {
            expect_control(pid_ctrl.update(0.5, 100.0).unwrap());
        }
        assert_eq!(pid_ctrl.update(0.5, 0.5).unwrap(), PidCtrlOutput::Reset);

        let trial = pid_ctrl.trial_report().unwrap();
        assert_eq!(trial.outcome, TrialOutcome::Stalled);
        assert_abs_diff_eq!(trial.score, OFF_TRACK_PENALTY / trial.distance_m);
        assert!(pid_ctrl.report().stalled);
        assert!(!pid_ctrl.report().off_track);
    }

    #[test]
    fn test_track_complete_with_large_cte() {
        let mut pid_ctrl = short_track();

        for _ in 0..FRAMES_BEFORE_COMPLETE {
            expect_control(pid_ctrl.update(4.99, 100.0).unwrap());
        }
        assert_eq!(pid_ctrl.update(4.99, 100.0).unwrap(), PidCtrlOutput::Reset);

        let trial = pid_ctrl.trial_report().unwrap();
        assert_eq!(trial.outcome, TrialOutcome::Incomplete);
        assert_eq!(trial.score, 4.99);
        assert!(pid_ctrl.report().track_complete);
        assert_eq!(pid_ctrl.mode(), PidCtrlMode::Tuning);
    }

    #[test]
    fn test_track_complete_finalises() {
        let mut pid_ctrl = short_track();

        for _ in 0..FRAMES_BEFORE_COMPLETE {
            expect_control(pid_ctrl.update(0.5, 100.0).unwrap());
        }

        // Completing the track still produces a control output
        expect_control(pid_ctrl.update(0.5, 100.0).unwrap());
        assert!(pid_ctrl.report().finalised);
        assert_eq!(pid_ctrl.report().mode, PidCtrlMode::Final);
        assert_eq!(pid_ctrl.trial_report().unwrap().outcome, TrialOutcome::Completed);
        assert_eq!(pid_ctrl.mode(), PidCtrlMode::Final);
        assert!(pid_ctrl.twiddler().is_none());
        assert_eq!(pid_ctrl.gains(), GAINS);

        // Never reset again, however far off the track
        for _ in 0..100 {
            let (_, throttle) = expect_control(pid_ctrl.update(10.0, 100.0).unwrap());
            assert_eq!(throttle, -1.0);
        }
        assert!(!pid_ctrl.report().finalised);
        assert_eq!(pid_ctrl.gains(), GAINS);
    }

    #[test]
    fn test_max_cte_skips_launch() {
        let mut pid_ctrl = PidCtrl::with_tuning(
            GAINS, DELTAS, OFF_TRACK_CTE_M, 1000.0
        ).unwrap();

        // The first 25 m are not counted, at 1.788 m per frame that is 13
        // frames
        for _ in 0..13 {
            expect_control(pid_ctrl.update(4.9, 100.0).unwrap());
        }
        assert_eq!(pid_ctrl.report().max_cte_m, 0.0);

        expect_control(pid_ctrl.update(1.0, 100.0).unwrap());
        assert_eq!(pid_ctrl.report().max_cte_m, 1.0);

        expect_control(pid_ctrl.update(-2.0, 100.0).unwrap());
        assert_eq!(pid_ctrl.report().max_cte_m, 2.0);

        expect_control(pid_ctrl.update(0.5, 100.0).unwrap());
        assert_eq!(pid_ctrl.report().max_cte_m, 2.0);
    }

    #[test]
    fn test_throttle() {
        let mut pid_ctrl = PidCtrl::with_final_gains(GAINS, OFF_TRACK_CTE_M).unwrap();

        let (_, throttle) = expect_control(pid_ctrl.update(1.0, 60.0).unwrap());
        assert_eq!(throttle, 1.0);

        let (_, throttle) = expect_control(pid_ctrl.update(1.0, 61.0).unwrap());
        assert_abs_diff_eq!(throttle, 0.2, epsilon = 1e-12);

        let (_, throttle) = expect_control(pid_ctrl.update(-1.0, 61.0).unwrap());
        assert_abs_diff_eq!(throttle, 0.2, epsilon = 1e-12);

        let (_, throttle) = expect_control(pid_ctrl.update(0.0, 61.0).unwrap());
        assert_eq!(throttle, 1.0);
    }

    #[test]
    fn test_zero_gains() {
        let mut pid_ctrl = PidCtrl::with_final_gains(Gains::default(), OFF_TRACK_CTE_M)
            .unwrap();

        for cte in &[0.3, -2.0, 4.0] {
            let (steering, _) = expect_control(pid_ctrl.update(*cte, 30.0).unwrap());
            assert_eq!(steering, 0.0);
        }
    }

    #[test]
    fn test_non_finite_input() {
        let mut pid_ctrl = short_track();
        expect_control(pid_ctrl.update(0.5, 100.0).unwrap());
        let distance_m = pid_ctrl.report().distance_m;

        assert!(matches!(
            pid_ctrl.update(std::f64::NAN, 100.0),
            Err(PidCtrlError::NonFiniteInput { .. })
        ));
        assert!(matches!(
            pid_ctrl.update(0.5, std::f64::INFINITY),
            Err(PidCtrlError::NonFiniteInput { .. })
        ));

        // Nothing was accumulated by the rejected frames
        expect_control(pid_ctrl.update(0.5, 100.0).unwrap());
        assert_abs_diff_eq!(pid_ctrl.report().distance_m, 2.0 * distance_m, epsilon = 1e-12);
    }

    #[test]
    fn test_update_with_fires_once() {
        let mut pid_ctrl = short_track();
        let controls = Cell::new(0);
        let resets = Cell::new(0);

        for cte in &[4.99, 4.99, 4.99, 4.99, 4.99, 5.01] {
            let before = controls.get() + resets.get();
            pid_ctrl.update_with(
                *cte,
                100.0,
                |_, _| controls.set(controls.get() + 1),
                || resets.set(resets.get() + 1)
            ).unwrap();
            assert_eq!(controls.get() + resets.get(), before + 1);
        }

        assert_eq!(controls.get(), 5);
        assert_eq!(resets.get(), 1);

        assert!(pid_ctrl.update_with(
            std::f64::NAN, 100.0, |_, _| panic!("control"), || panic!("reset")
        ).is_err());
    }

    #[test]
    fn test_from_params() {
        let mut params = Params::default();
        let pid_ctrl = PidCtrl::from_params(&params).unwrap();
        assert_eq!(pid_ctrl.mode(), PidCtrlMode::Final);
        assert_eq!(pid_ctrl.gains(), params.gains());

        params.tuning = Some(TuningParams {
            d_k_p: 0.01,
            d_k_i: 1e-5,
            d_k_d: 0.1,
            track_length_m: 100.0,
        });
        params.frame_rate_hz = 50.0;
        let mut pid_ctrl = PidCtrl::from_params(&params).unwrap();
        assert_eq!(pid_ctrl.mode(), PidCtrlMode::Tuning);

        // Half the distance per frame at 50 Hz
        pid_ctrl.update(0.0, 100.0).unwrap();
        assert_abs_diff_eq!(pid_ctrl.report().distance_m, 100.0 * MPH_TO_MS / 50.0);
        assert_abs_diff_eq!(pid_ctrl.report().time_s, 0.02);

        params.off_track_cte_m = 0.0;
        assert!(matches!(
            PidCtrl::from_params(&params),
            Err(PidCtrlError::InvalidParams(ParamsError::OffTrackCteTooSmall(_)))
        ));
    }

    #[test]
    fn test_rejects_bad_config() {
        let invalid = |r: Result<PidCtrl, PidCtrlError>| match r {
            Err(PidCtrlError::InvalidParams(e)) => e,
            Err(e) => panic!("Expected InvalidParams, got {:?}", e),
            Ok(_) => panic!("Expected InvalidParams, got a controller")
        };

        assert_eq!(
            invalid(PidCtrl::with_final_gains(Gains::new(0.1, 0.0, 1.0), 0.0)),
            ParamsError::OffTrackCteTooSmall(0.0)
        );
        assert_eq!(
            invalid(PidCtrl::with_final_gains(GAINS, std::f64::NAN)).to_string(),
            ParamsError::OffTrackCteTooSmall(std::f64::NAN).to_string()
        );
        assert_eq!(
            invalid(PidCtrl::with_final_gains(Gains::new(0.1, -1.0, 1.0), OFF_TRACK_CTE_M)),
            ParamsError::InvalidGains(Gains::new(0.1, -1.0, 1.0))
        );
        assert_eq!(
            invalid(PidCtrl::with_tuning(GAINS, DELTAS, -1.0, 100.0)),
            ParamsError::NegativeOffTrackCte(-1.0)
        );
        assert_eq!(
            invalid(PidCtrl::with_tuning(GAINS, DELTAS, OFF_TRACK_CTE_M, 0.0)),
            ParamsError::TrackLengthTooShort(0.0)
        );
        assert_eq!(
            invalid(PidCtrl::with_tuning(GAINS, DELTAS, OFF_TRACK_CTE_M, -10.0)),
            ParamsError::NegativeTrackLength(-10.0)
        );
        assert!(matches!(
            PidCtrl::with_tuning(GAINS, Gains::new(0.01, 0.0, 0.1), OFF_TRACK_CTE_M, 100.0),
            Err(PidCtrlError::TwiddleError(_))
        ));

        let pid_ctrl = PidCtrl::with_final_gains(GAINS, OFF_TRACK_CTE_M).unwrap();
        assert_eq!(
            invalid(pid_ctrl.with_frame_rate(0.0)),
            ParamsError::InvalidFrameRate(0.0)
        );
        let pid_ctrl = PidCtrl::with_final_gains(GAINS, OFF_TRACK_CTE_M).unwrap();
        assert_eq!(
            invalid(pid_ctrl.with_frame_rate(std::f64::INFINITY)),
            ParamsError::InvalidFrameRate(std::f64::INFINITY)
        );

        // The smallest allowed threshold keeps the braking throttle in range
        let mut pid_ctrl = PidCtrl::with_final_gains(GAINS, params::MIN_OFF_TRACK_CTE_M)
            .unwrap();
        for cte in &[0.0, 0.05, -3.0] {
            let (_, throttle) = expect_control(pid_ctrl.update(*cte, 65.0).unwrap());
            assert!(throttle >= -1.0 && throttle <= 1.0);
        }
    }

    #[test]
    fn test_archives() {
        let parent = std::env::temp_dir().join("pidtune_pid_ctrl_test");
        let session = Session::new_in("pid_ctrl_test", parent).unwrap();

        let mut pid_ctrl = short_track().with_archives(&session).unwrap();

        // Five frames on the track, one off it, then one into the next trial
        for cte in &[4.99, 4.99, 4.99, 4.99, 4.99, 5.01, 0.0] {
            pid_ctrl.update(*cte, 100.0).unwrap();
            pid_ctrl.write().unwrap();
        }

        let (header, rows) = read_archive(&session, "pid_ctrl/status_report.csv");
        assert_eq!(header[0], "mode");
        assert_eq!(rows.len(), 7);
        let trial_col = header.iter().position(|h| h == "trial_num").unwrap();
        assert_eq!(rows[5][trial_col], "0");
        assert_eq!(rows[6][trial_col], "1");

        let (header, rows) = read_archive(&session, "pid_ctrl/trials.csv");
        assert_eq!(rows.len(), 1);

        let col = |name: &str| header.iter().position(|h| h == name).unwrap();
        let distance_m: f64 = rows[0][col("distance_m")].parse().unwrap();
        let score: f64 = rows[0][col("score")].parse().unwrap();
        assert_eq!(rows[0][col("outcome")], "OffTrack");
        assert_eq!(rows[0][col("trial_num")], "0");
        assert_abs_diff_eq!(distance_m, 6.0 * 100.0 * MPH_TO_MS / 25.0, epsilon = 1e-9);
        assert_abs_diff_eq!(score, OFF_TRACK_PENALTY / distance_m, epsilon = 1e-6);
    }

    #[test]
    fn test_tuning_on_sim() {
        // Curved track which the initial gains are too weak to follow
        let sim_params = SimParams {
            wheelbase_m: 2.7,
            max_steer_rad: 0.436,
            start_cte_m: 1.0,
            start_speed_mph: 5.0,
            max_speed_mph: 30.0,
            accel_mphps: 10.0,
            track_amplitude_m: 4.0,
            track_wavelength_m: 30.0,
            ..SimParams::default()
        };
        let mut sim = KinematicSim::new(sim_params).unwrap();

        let mut pid_ctrl = PidCtrl::with_tuning(
            Gains::new(0.05, 0.0, 0.0),
            Gains::new(0.05, 1e-4, 0.5),
            3.0,
            200.0
        ).unwrap();

        let mut resets = 0;
        for _ in 0..5000 {
            match pid_ctrl.update(sim.cte(), sim.speed_mph()).unwrap() {
                PidCtrlOutput::Control { steering, throttle } => {
                    sim.step(steering, throttle)
                }
                PidCtrlOutput::Reset => {
                    resets += 1;
                    sim.reset()
                }
            }

            if pid_ctrl.mode() == PidCtrlMode::Final {
                break;
            }
        }

        assert_eq!(pid_ctrl.mode(), PidCtrlMode::Final);
        assert!(resets >= 1);
        assert_ne!(pid_ctrl.gains(), Gains::new(0.05, 0.0, 0.0));
    }
}
