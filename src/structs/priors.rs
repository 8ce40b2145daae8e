use anyhow::{anyhow, bail, Result};
use rand::Rng;
use rand_distr::{Beta, Distribution, LogNormal, Normal};
use serde::{Deserialize, Serialize};
use statrs::function::beta::ln_beta;

use crate::data::{DayPeriod, MealSlot, Protocol};
use crate::routines::math::{normal_log_density, LN_SQRT_2PI};
use crate::structs::parameters::{Layout, ParameterKind, ParameterVector};

/// A univariate prior distribution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "distribution", rename_all = "lowercase", deny_unknown_fields)]
pub enum Prior {
    Normal { mean: f64, sd: f64 },
    /// Log-normal, parameterised by its median and the standard deviation of the log
    #[serde(alias = "log_normal")]
    LogNormal { median: f64, sigma: f64 },
    Uniform { lower: f64, upper: f64 },
    Beta { alpha: f64, beta: f64 },
    #[serde(alias = "half_normal")]
    HalfNormal { sd: f64 },
}

/// `a * ln(x)`, taken as zero when `a` is zero
fn xlogy(a: f64, x: f64) -> f64 {
    if a == 0.0 {
        0.0
    } else {
        a * x.ln()
    }
}

impl Prior {
    pub fn validate(&self) -> Result<()> {
        let ok = match *self {
            Prior::Normal { mean, sd } => mean.is_finite() && sd.is_finite() && sd > 0.0,
            Prior::LogNormal { median, sigma } => {
                median.is_finite() && median > 0.0 && sigma.is_finite() && sigma > 0.0
            }
            Prior::Uniform { lower, upper } => {
                lower.is_finite() && upper.is_finite() && lower < upper
            }
            Prior::Beta { alpha, beta } => {
                alpha.is_finite() && alpha > 0.0 && beta.is_finite() && beta > 0.0
            }
            Prior::HalfNormal { sd } => sd.is_finite() && sd > 0.0,
        };
        if !ok {
            bail!("Invalid prior {:?}", self);
        }
        Ok(())
    }

    /// Normalised log density at `x`, `-inf` outside the support
    pub fn log_density(&self, x: f64) -> f64 {
        match *self {
            Prior::Normal { mean, sd } => normal_log_density(x, mean, sd),
            Prior::LogNormal { median, sigma } => {
                if x <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                let z = (x.ln() - median.ln()) / sigma;
                -LN_SQRT_2PI - sigma.ln() - x.ln() - 0.5 * z * z
            }
            Prior::Uniform { lower, upper } => {
                if (lower..=upper).contains(&x) {
                    -(upper - lower).ln()
                } else {
                    f64::NEG_INFINITY
                }
            }
            Prior::Beta { alpha, beta } => {
                if !(0.0..=1.0).contains(&x) {
                    return f64::NEG_INFINITY;
                }
                xlogy(alpha - 1.0, x) + xlogy(beta - 1.0, 1.0 - x) - ln_beta(alpha, beta)
            }
            Prior::HalfNormal { sd } => {
                if x < 0.0 {
                    return f64::NEG_INFINITY;
                }
                let z = x / sd;
                std::f64::consts::LN_2 - LN_SQRT_2PI - sd.ln() - 0.5 * z * z
            }
        }
    }

    /// Draw a value from the prior
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<f64> {
        let value = match *self {
            Prior::Normal { mean, sd } => Normal::new(mean, sd)
                .map_err(|e| anyhow!("Invalid normal prior: {:?}", e))?
                .sample(rng),
            Prior::LogNormal { median, sigma } => LogNormal::new(median.ln(), sigma)
                .map_err(|e| anyhow!("Invalid log-normal prior: {:?}", e))?
                .sample(rng),
            Prior::Uniform { lower, upper } => lower + (upper - lower) * rng.random::<f64>(),
            Prior::Beta { alpha, beta } => Beta::new(alpha, beta)
                .map_err(|e| anyhow!("Invalid beta prior: {:?}", e))?
                .sample(rng),
            Prior::HalfNormal { sd } => Normal::new(0.0, sd)
                .map_err(|e| anyhow!("Invalid half-normal prior: {:?}", e))?
                .sample(rng)
                .abs(),
        };
        Ok(value)
    }
}

/// Prior configuration, one distribution per kind of parameter
///
/// The same distribution is used for every basal block, meal slot and day period.
/// When `initial_bg` is not given, a normal prior centred on the first glucose reading is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Priors {
    pub basal: Prior,
    pub carb_ratio: Prior,
    pub correction_factor: Prior,
    pub noise_sigma: Prior,
    pub outlier_prob: Prior,
    pub action_time_scale: Prior,
    pub initial_bg: Option<Prior>,
}

impl Default for Priors {
    fn default() -> Self {
        Priors {
            basal: Prior::LogNormal {
                median: 1.0,
                sigma: 1.0,
            },
            carb_ratio: Prior::LogNormal {
                median: 10.0,
                sigma: 0.75,
            },
            correction_factor: Prior::LogNormal {
                median: 50.0,
                sigma: 0.75,
            },
            noise_sigma: Prior::LogNormal {
                median: 15.0,
                sigma: 0.75,
            },
            outlier_prob: Prior::Beta {
                alpha: 2.0,
                beta: 98.0,
            },
            action_time_scale: Prior::LogNormal {
                median: 1.0,
                sigma: 0.2,
            },
            initial_bg: None,
        }
    }
}

impl Priors {
    pub fn validate(&self) -> Result<()> {
        for prior in [
            &self.basal,
            &self.carb_ratio,
            &self.correction_factor,
            &self.noise_sigma,
            &self.outlier_prob,
            &self.action_time_scale,
        ] {
            prior.validate()?;
        }
        if let Some(prior) = &self.initial_bg {
            prior.validate()?;
        }
        Ok(())
    }
}

/// Standard deviation of the default prior on the initial glucose level, in mg/dL
pub const INITIAL_BG_SD: f64 = 30.0;

/// The parameter space: a [Layout] with an independent prior on every entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSpace {
    layout: Layout,
    names: Vec<String>,
    kinds: Vec<ParameterKind>,
    priors: Vec<Prior>,
}

impl ParameterSpace {
    /// Expand a [Priors] configuration over a layout
    ///
    /// `first_reading` centres the default prior on the initial glucose level.
    pub fn new(layout: Layout, priors: &Priors, first_reading: f64) -> Result<Self> {
        layout.validate()?;
        priors.validate()?;
        let initial_bg = priors.initial_bg.unwrap_or(Prior::Normal {
            mean: first_reading,
            sd: INITIAL_BG_SD,
        });
        let entries = layout
            .kinds()
            .iter()
            .map(|kind| match kind {
                ParameterKind::Basal => priors.basal,
                ParameterKind::CarbRatio => priors.carb_ratio,
                ParameterKind::CorrectionFactor => priors.correction_factor,
                ParameterKind::NoiseSigma => priors.noise_sigma,
                ParameterKind::OutlierProb => priors.outlier_prob,
                ParameterKind::ActionTimeScale => priors.action_time_scale,
                ParameterKind::InitialBg => initial_bg,
            })
            .collect();
        Self::from_priors(layout, entries)
    }

    /// Weakly-informative priors centred on a prescribed protocol
    ///
    /// Basal, carbohydrate ratio and correction factor priors are log-normal with median at the prescribed value and
    /// log-scale standard deviation `spread`. Per-slot entries take the value prescribed for their slot.
    pub fn from_protocol(
        layout: Layout,
        protocol: &Protocol,
        spread: f64,
        priors: &Priors,
        first_reading: f64,
    ) -> Result<Self> {
        protocol.validate()?;
        if !(spread.is_finite() && spread > 0.0) {
            bail!("The spread of protocol-centred priors must be positive, got {}", spread);
        }
        let centred = |median: f64| Prior::LogNormal {
            median: median.max(1e-3),
            sigma: spread,
        };

        let mut space = Self::new(layout, priors, first_reading)?;
        let mut index = 0;
        for _ in 0..layout.basal_blocks {
            space.priors[index] = centred(protocol.basal);
            index += 1;
        }
        if layout.meal_slot_ratios {
            for slot in MealSlot::ALL {
                space.priors[index] = centred(protocol.carb_ratio(slot));
                index += 1;
            }
        } else {
            space.priors[index] = centred(protocol.mean_carb_ratio());
            index += 1;
        }
        if layout.day_night_factors {
            for period in [DayPeriod::Day, DayPeriod::Night] {
                space.priors[index] = centred(protocol.correction_factor(period));
                index += 1;
            }
        } else {
            space.priors[index] = centred(protocol.mean_correction_factor());
        }
        Ok(space)
    }

    /// Build from one prior per entry, in [Layout::names] order
    pub fn from_priors(layout: Layout, priors: Vec<Prior>) -> Result<Self> {
        layout.validate()?;
        if priors.len() != layout.len() {
            bail!(
                "Expected {} priors for the layout, got {}",
                layout.len(),
                priors.len()
            );
        }
        for prior in &priors {
            prior.validate()?;
        }
        Ok(ParameterSpace {
            layout,
            names: layout.names(),
            kinds: layout.kinds(),
            priors,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn kinds(&self) -> &[ParameterKind] {
        &self.kinds
    }

    pub fn priors(&self) -> &[Prior] {
        &self.priors
    }

    pub fn dim(&self) -> usize {
        self.priors.len()
    }

    /// Sum of the independent log priors, `-inf` when any entry is outside its support
    pub fn log_prior(&self, parameters: &ParameterVector) -> f64 {
        self.log_prior_slice(&parameters.to_vec())
    }

    /// [ParameterSpace::log_prior] on a flattened vector
    pub fn log_prior_slice(&self, values: &[f64]) -> f64 {
        if values.len() != self.priors.len() {
            return f64::NEG_INFINITY;
        }
        let mut total = 0.0;
        for ((value, kind), prior) in values.iter().zip(&self.kinds).zip(&self.priors) {
            if !kind.in_support(*value) {
                return f64::NEG_INFINITY;
            }
            total += prior.log_density(*value);
        }
        total
    }

    /// Draw a flattened vector from the priors, redrawing entries that fall outside their support
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<f64>> {
        const MAX_ATTEMPTS: usize = 1000;
        let mut values = Vec::with_capacity(self.priors.len());
        for ((prior, kind), name) in self.priors.iter().zip(&self.kinds).zip(&self.names) {
            let mut attempts = 0;
            let value = loop {
                let candidate = prior.sample(rng)?;
                if kind.in_support(candidate) {
                    break candidate;
                }
                attempts += 1;
                if attempts >= MAX_ATTEMPTS {
                    bail!(
                        "Prior for {} places no mass on the support of the parameter",
                        name
                    );
                }
            };
            values.push(value);
        }
        Ok(values)
    }

    /// Prior draw as a [ParameterVector]
    pub fn sample_parameters<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<ParameterVector> {
        let values = self.sample(rng)?;
        ParameterVector::from_slice(&self.layout, &values)
    }
}
