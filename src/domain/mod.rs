//! Domain types used throughout the calibration pipeline.
//!
//! This module defines:
//!
//! - parameter table rows (`SpeciesParams`, `GearParams`)
//! - observation inputs (`ObservedCatch`, `EcopathEstimate`, `DietEntry`, `KernelFit`)
//! - calibration progress (`CalibrationStage`) and run settings (`CalibrationConfig`)

pub mod types;

pub use types::*;
