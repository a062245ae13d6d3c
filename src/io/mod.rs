//! Input/output helpers.
//!
//! - CSV ingest + validation of the input tables (`ingest`)
//! - calibrated species/gear CSV exports (`export`)
//! - calibration snapshot JSON (`snapshot`)

pub mod export;
pub mod ingest;
pub mod snapshot;

pub use export::*;
pub use ingest::*;
pub use snapshot::*;
