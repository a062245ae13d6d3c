//! Ordered calibration pipeline.
//!
//! Per species, stages run strictly in sequence:
//!
//! - growth matching (feeding rates vs age at maturity)
//! - steady state
//! - biomass matching
//! - catch matching (selectivity, catchability, `mu_mat`)
//! - consumption matching
//!
//! Species are independent until diet matching, which needs every
//! participating species to be consumption-matched.

pub mod diet;
pub mod run;
pub mod species;

#[cfg(test)]
pub(crate) mod fixtures;

pub use diet::*;
pub use run::*;
pub use species::*;
