//! Offline tuning executable entry point.
//! 
//! # Architecture
//! 
//! The general execution methodology consists of:
//! 
//!     - Initialise the session, logging and parameters
//!     - Initialise PidCtrl and the kinematic simulation
//!     - Main loop, once per simulation frame:
//!         - Read CTE and speed from the simulation
//!         - PidCtrl processing
//!         - Apply the demands to the simulation, or reset it if the trial
//!           ended
//!         - Archive PidCtrl's reports
//! 
//! The executable takes a single optional argument, the name of the PidCtrl
//! parameter file inside the params directory. If not given `pid_ctrl.toml`
//! is used.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::{debug, info, warn};
use std::env;
use color_eyre::{Report, eyre::{WrapErr, eyre}};

// Internal
use drive_lib::{
    pid_ctrl::{self, PidCtrl, PidCtrlMode, PidCtrlOutput},
    sim::{KinematicSim, SimParams},
};
use util::{
    archive::Archived,
    module::State,
    logger::{logger_init, LevelFilter},
    session::Session,
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Parameter file used if none is given on the command line.
const DEFAULT_PID_CTRL_PARAMS: &str = "pid_ctrl.toml";

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {

    // ---- EARLY INITIALISATION ----

    color_eyre::install()?;

    // Initialise session
    let session = Session::new(
        "drive_exec", 
        "sessions"
    ).wrap_err("Failed to create the session")?;

    // Initialise logger
    logger_init(LevelFilter::Debug, &session)
        .wrap_err("Failed to initialise logging")?;

    info!("PID Tuning Executable\n");
    info!("Session directory: {:?}\n", session.session_root);

    // ---- LOAD PARAMETERS ----

    let args: Vec<String> = env::args().collect();
    debug!("CLI arguments: {:?}", args);

    let pid_ctrl_params = match args.len() {
        1 => String::from(DEFAULT_PID_CTRL_PARAMS),
        2 => args[1].clone(),
        n => return Err(eyre!(
            "Expected either zero or one argument, found {}", n - 1
        ))
    };

    let sim_params: SimParams = util::params::load("sim.toml")
        .wrap_err("Could not load sim params")?;

    info!("Exec parameters loaded");

    // ---- INITIALISE MODULES ----

    info!("Initialising modules...");

    let mut pid_ctrl = PidCtrl::init(pid_ctrl_params, &session)
        .wrap_err("Failed to initialise PidCtrl")?;
    info!("PidCtrl init complete");

    let mut sim = KinematicSim::new(sim_params)
        .wrap_err("Failed to initialise the simulation")?;
    info!("Simulation init complete");

    sim.check_frame_rate(pid_ctrl.frame_rate_hz())
        .wrap_err("PidCtrl and the simulation disagree on the frame rate")?;

    info!("Module initialisation complete\n");

    // ---- MAIN LOOP ----

    info!("Begining main loop\n");

    let mut num_resets = 0u64;
    let mut frame = 0u64;

    while frame < sim.params().max_frames {
        let input = pid_ctrl::InputData {
            cte_m: sim.cte(),
            speed_mph: sim.speed_mph(),
        };

        let (output, report) = pid_ctrl.proc(&input)
            .wrap_err("Error during PidCtrl processing")?;

        match output {
            PidCtrlOutput::Control { steering, throttle } => {
                sim.step(steering, throttle)
            }
            PidCtrlOutput::Reset => {
                num_resets += 1;
                sim.reset()
            }
        }

        if report.finalised {
            info!("Gains finalised on frame {}", frame);
        }

        // ---- WRITE ARCHIVES ----

        if let Err(e) = pid_ctrl.write() {
            warn!("Could not write PidCtrl archives: {}", e);
        }

        frame += 1;
    }

    // ---- SHUTDOWN ----

    let gains = pid_ctrl.gains();
    match pid_ctrl.mode() {
        PidCtrlMode::Final => info!(
            "Driving with final gains Kp={}, Ki={}, Kd={}",
            gains.k_p, gains.k_i, gains.k_d
        ),
        PidCtrlMode::Tuning => warn!(
            "Gains were not finalised after {} frames, last tried Kp={}, Ki={}, Kd={}",
            frame, gains.k_p, gains.k_i, gains.k_d
        )
    }

    if let Some(best) = pid_ctrl.twiddler().and_then(|t| t.best_score()) {
        info!("Best trial score: {}", best);
    }

    info!("Simulated {} frames with {} resets", frame, num_resets);
    info!("End of execution");

    Ok(())
}
