//! Mathematical utilities: grids, root finding and summary statistics.

pub mod grid;
pub mod roots;
pub mod stats;

pub use grid::*;
pub use roots::*;
pub use stats::*;
