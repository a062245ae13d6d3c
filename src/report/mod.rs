//! Reporting utilities: formatted terminal output of runs and analyses.

pub mod format;

pub use format::*;
