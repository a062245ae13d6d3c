//! Discretised weight axis of one species.

use serde::{Deserialize, Serialize};

use crate::domain::SpeciesParams;
use crate::error::CalibrationError;
use crate::math::weight_nodes;

/// Log-spaced weight nodes with their bin widths and lengths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightGrid {
    /// Node weights, `w[0] = w_min`, last node `= w_max`.
    pub w: Vec<f64>,
    /// Bin width attached to each node.
    pub dw: Vec<f64>,
    /// Length at each node.
    pub l: Vec<f64>,
}

impl WeightGrid {
    pub fn for_species(species: &SpeciesParams, points: usize) -> Result<Self, CalibrationError> {
        let w = weight_nodes(&species.species, species.w_min, species.w_max, points)?;
        let len = w.len();
        let mut dw: Vec<f64> = w.windows(2).map(|pair| pair[1] - pair[0]).collect();
        // Geometric grid: the last width continues the constant ratio.
        let ratio = w[len - 1] / w[len - 2];
        dw.push(dw[len - 2] * ratio);
        let l = w.iter().map(|&wi| species.length_at(wi)).collect();
        Ok(Self { w, dw, l })
    }

    pub fn len(&self) -> usize {
        self.w.len()
    }

    pub fn is_empty(&self) -> bool {
        self.w.is_empty()
    }
}
