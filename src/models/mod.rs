//! Parametric curve families used by the population model.
//!
//! Curves are implemented as small, pure functions so that solver and
//! objective code can stay generic over the number type.

pub mod selectivity;

pub use selectivity::*;
