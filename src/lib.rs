//! `spectrum-calib` library crate.
//!
//! The binary (`scal`) is a thin wrapper around this library so that:
//!
//! - core logic is testable without spawning processes
//! - the calibration stages are reusable from other tools (batch drivers, notebooks)
//! - code stays easy to navigate as the project grows

pub mod app;
pub mod calibration;
pub mod cli;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod report;
pub mod spectrum;
