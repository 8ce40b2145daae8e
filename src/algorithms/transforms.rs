//! Maps between parameter space and the unconstrained space the sampler walks in
//!
//! `forward` takes an unconstrained `z` to a parameter value, `inverse` does the opposite.
//! The sampler adds `log|d value / d z|` to the target so the prior keeps its meaning.

use crate::structs::parameters::ParameterKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// `value = z`
    Identity,
    /// `value = exp(z)`, for strictly positive parameters
    Log,
    /// `value = 1 / (1 + exp(-z))`, for probabilities
    Logit,
}

/// `ln(1 + exp(x))` without overflow
#[inline]
fn softplus(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

impl Transform {
    pub fn for_kind(kind: ParameterKind) -> Self {
        match kind {
            ParameterKind::OutlierProb => Transform::Logit,
            ParameterKind::InitialBg => Transform::Identity,
            ParameterKind::Basal
            | ParameterKind::CarbRatio
            | ParameterKind::CorrectionFactor
            | ParameterKind::NoiseSigma
            | ParameterKind::ActionTimeScale => Transform::Log,
        }
    }

    #[inline]
    pub fn forward(&self, z: f64) -> f64 {
        match self {
            Transform::Identity => z,
            Transform::Log => z.exp(),
            Transform::Logit => 1.0 / (1.0 + (-z).exp()),
        }
    }

    #[inline]
    pub fn inverse(&self, value: f64) -> f64 {
        match self {
            Transform::Identity => value,
            Transform::Log => value.ln(),
            Transform::Logit => value.ln() - (-value).ln_1p(),
        }
    }

    /// `log|d forward(z) / dz|`
    #[inline]
    pub fn log_abs_det_jacobian(&self, z: f64) -> f64 {
        match self {
            Transform::Identity => 0.0,
            Transform::Log => z,
            Transform::Logit => -softplus(-z) - softplus(z),
        }
    }
}

/// One transform per entry of a flattened parameter vector
#[derive(Debug, Clone, PartialEq)]
pub struct Transforms(Vec<Transform>);

impl Transforms {
    pub fn new(kinds: &[ParameterKind]) -> Self {
        Transforms(kinds.iter().map(|k| Transform::for_kind(*k)).collect())
    }

    pub fn get(&self, index: usize) -> Transform {
        self.0[index]
    }

    pub fn forward(&self, z: &[f64]) -> Vec<f64> {
        self.0.iter().zip(z).map(|(t, z)| t.forward(*z)).collect()
    }

    pub fn inverse(&self, values: &[f64]) -> Vec<f64> {
        self.0.iter().zip(values).map(|(t, v)| t.inverse(*v)).collect()
    }

    pub fn log_abs_det_jacobian(&self, z: &[f64]) -> f64 {
        self.0
            .iter()
            .zip(z)
            .map(|(t, z)| t.log_abs_det_jacobian(*z))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_undoes_forward() {
        for transform in [Transform::Identity, Transform::Log, Transform::Logit] {
            for z in [-4.0, -0.3, 0.0, 1.7, 6.0] {
                let back = transform.inverse(transform.forward(z));
                assert!((back - z).abs() < 1e-9, "{:?} at {}", transform, z);
            }
        }
    }

    #[test]
    fn test_jacobian_matches_finite_difference() {
        let h = 1e-6;
        for transform in [Transform::Log, Transform::Logit] {
            for z in [-3.0, -0.5, 0.0, 2.0] {
                let slope = (transform.forward(z + h) - transform.forward(z - h)) / (2.0 * h);
                assert!((slope.ln() - transform.log_abs_det_jacobian(z)).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_kinds() {
        assert_eq!(Transform::for_kind(ParameterKind::Basal), Transform::Log);
        assert_eq!(Transform::for_kind(ParameterKind::OutlierProb), Transform::Logit);
        assert_eq!(Transform::for_kind(ParameterKind::InitialBg), Transform::Identity);
    }
}
