//! # Drive library.
//!
//! This library allows other crates in the workspace to access items defined inside the drive
//! crate.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// PID control module - steers the vehicle along the track and tunes its own gains
pub mod pid_ctrl;

/// Kinematic simulation - a closed loop vehicle model for offline runs and tests
pub mod sim;
