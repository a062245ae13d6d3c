//! Catch-at-length fitting.
//!
//! Responsibilities:
//!
//! - assemble the catch objective of one species and gear (`objective`)
//! - minimise it with a quasi-Newton solver (`optimizer`)
//! - probe robustness and identifiability (`multistart`)

pub mod multistart;
pub mod objective;
pub mod optimizer;

pub use multistart::*;
pub use objective::*;
pub use optimizer::*;
