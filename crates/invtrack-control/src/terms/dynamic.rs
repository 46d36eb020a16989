//! Regularization with weights adapted to each actuator's influence on the
//! tracked motion.
//!
//! Each step the contribution `c_j = ||Hv[:, j]|| / max_k ||Hv[:, k]||` is
//! mapped through a decreasing function, so actuators that barely move the
//! targets are penalized more.

use invtrack_core::ControlError;
use nalgebra::{DMatrix, DVector};

use crate::term::{add_least_squares_cost, CostTerm, TermBase, TermContext};

/// Decreasing map from normalized contribution `c` in `[0, 1]` to weight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WeightMapping {
    /// `exp(-rate * c)`
    Exponential { rate: f64 },
    /// `(1 + c)^-exponent`
    Power { exponent: f64 },
    /// `1 / (1 + exp(steepness * (c - midpoint)))`
    Sigmoid { steepness: f64, midpoint: f64 },
}

impl Default for WeightMapping {
    fn default() -> Self {
        Self::Exponential { rate: 1.0 }
    }
}

impl WeightMapping {
    pub fn weight(self, c: f64) -> f64 {
        match self {
            Self::Exponential { rate } => (-rate * c).exp(),
            Self::Power { exponent } => (1.0 + c).powf(-exponent),
            Self::Sigmoid {
                steepness,
                midpoint,
            } => 1.0 / (1.0 + (steepness * (c - midpoint)).exp()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DynamicRegularizationTerm {
    base: TermBase,
    mapping: WeightMapping,
    normalize: bool,
    weights: DVector<f64>,
}

impl DynamicRegularizationTerm {
    pub fn new(weight: f64, mapping: WeightMapping) -> Self {
        Self {
            base: TermBase::new("dynamic regularization", weight),
            mapping,
            normalize: false,
            weights: DVector::zeros(0),
        }
    }

    /// Rescale the per-actuator weights to sum to the actuator count.
    #[must_use]
    pub const fn with_normalization(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub const fn mapping(&self) -> WeightMapping {
        self.mapping
    }

    pub fn set_mapping(&mut self, mapping: WeightMapping) {
        self.mapping = mapping;
    }

    /// Per-actuator weights used at the last step.
    pub const fn actuator_weights(&self) -> &DVector<f64> {
        &self.weights
    }

    fn compute_weights(&self, hv: &DMatrix<f64>, reg: &DVector<f64>) -> DVector<f64> {
        let m = reg.len();
        let norms = DVector::from_iterator(m, (0..m).map(|j| {
            if hv.nrows() == 0 || j >= hv.ncols() {
                0.0
            } else {
                hv.column(j).norm()
            }
        }));
        let max = norms.iter().copied().fold(0.0, f64::max);
        let mut g = DVector::from_iterator(
            m,
            norms.iter().zip(reg.iter()).map(|(&n, &r)| {
                let c = if max > 0.0 { n / max } else { 0.0 };
                r * self.mapping.weight(c)
            }),
        );
        if self.normalize {
            let total = g.sum();
            if total > 0.0 {
                #[allow(clippy::cast_precision_loss)]
                let scale = m as f64 / total;
                g *= scale;
            }
        }
        g
    }
}

impl_term!(DynamicRegularizationTerm);

impl CostTerm for DynamicRegularizationTerm {
    fn add_cost(
        &mut self,
        q: &mut DMatrix<f64>,
        p: &mut DVector<f64>,
        ctx: &mut TermContext<'_>,
    ) -> Result<(), ControlError> {
        self.weights = self.compute_weights(&ctx.response.hv, &ctx.actuators.regularization_weights());
        let sqrt_g = self.weights.map(f64::sqrt);
        let h = DMatrix::from_diagonal(&sqrt_g);
        let b = -ctx.excitation_offset().component_mul(&sqrt_g);
        add_least_squares_cost(&self.base, q, p, h, b);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn mappings_are_decreasing() {
        let maps = [
            WeightMapping::Exponential { rate: 2.0 },
            WeightMapping::Power { exponent: 1.5 },
            WeightMapping::Sigmoid {
                steepness: 10.0,
                midpoint: 0.5,
            },
        ];
        for map in maps {
            let mut prev = map.weight(0.0);
            for i in 1..=10 {
                let w = map.weight(f64::from(i) / 10.0);
                assert!(w < prev, "{map:?} not decreasing at {i}");
                prev = w;
            }
        }
        assert_relative_eq!(WeightMapping::Power { exponent: 1.0 }.weight(1.0), 0.5);
    }

    #[test]
    fn strongest_actuator_gets_smallest_weight() {
        let term = DynamicRegularizationTerm::new(1.0, WeightMapping::Exponential { rate: 1.0 });
        let hv = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 0.5, 0.0, 0.0, 0.0]);
        let g = term.compute_weights(&hv, &DVector::from_element(3, 1.0));
        assert_relative_eq!(g[0], (-1.0f64).exp());
        assert_relative_eq!(g[1], 1.0);
        assert_relative_eq!(g[2], (-0.5f64).exp());
    }

    #[test]
    fn normalization_preserves_mass() {
        let term = DynamicRegularizationTerm::new(1.0, WeightMapping::default())
            .with_normalization(true);
        let hv = DMatrix::from_row_slice(1, 3, &[3.0, 1.0, 0.0]);
        let g = term.compute_weights(&hv, &DVector::from_element(3, 1.0));
        assert_relative_eq!(g.sum(), 3.0, epsilon = 1e-12);
    }

    #[test]
    fn empty_response_gives_uniform_weights() {
        let term = DynamicRegularizationTerm::new(1.0, WeightMapping::default());
        let g = term.compute_weights(&DMatrix::zeros(0, 2), &DVector::from_element(2, 2.0));
        assert_relative_eq!(g, DVector::from_element(2, 2.0));
    }
}
