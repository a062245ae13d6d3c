//! Size-spectrum population model for one species in isolation.
//!
//! - weight grid (`grid`)
//! - individual energy budget and growth (`energy`)
//! - steady-state abundance and its aggregates (`steady_state`)

pub mod energy;
pub mod grid;
pub mod steady_state;

pub use energy::*;
pub use grid::*;
pub use steady_state::*;
