use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::data::{CarbKind, Data, Event};
use crate::routines::math::{logsumexp, normal_log_density};
use crate::simulator::Trajectory;
use crate::structs::parameters::ParameterVector;

/// Reliability of a glucose reading, set by recent events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReliabilityFlag {
    Normal,
    /// Within the lookback window after a carbohydrate treatment of a low
    PostTreatment,
    /// During or within the lookback window after an exercise session
    PostExercise,
}

/// An observed glucose value with its reliability
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub time: f64,
    pub value: f64,
    pub flag: ReliabilityFlag,
}

impl Reading {
    pub fn is_flagged(&self) -> bool {
        self.flag != ReliabilityFlag::Normal
    }
}

/// Distribution of a reading around the predicted glucose
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseModel {
    /// Additive noise, `noise_sigma` in mg/dL
    #[default]
    Gaussian,
    /// Multiplicative noise, `noise_sigma` on the log scale
    #[serde(alias = "log-normal")]
    LogNormal,
}

/// Treatment of readings flagged by [ReliabilityFlag]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutlierHandling {
    /// Multiply the noise scale by `inflation`
    #[default]
    Inflate,
    /// Leave flagged readings out of the likelihood
    Exclude,
    /// Raise the weight of the discount component for flagged readings
    Mixture,
}

/// The observation model linking predicted glucose to readings
///
/// Every included reading is a two-component mixture: with probability `outlier_prob` it is drawn from a uniform
/// discount distribution over `discount_range`, otherwise from the [NoiseModel] centred on the prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ObservationModel {
    pub noise: NoiseModel,
    /// Hours after a treatment or exercise during which readings are flagged
    ///
    /// Exercise sessions scale it by [crate::data::Intensity::lookback_factor].
    pub lookback: f64,
    pub outlier_handling: OutlierHandling,
    /// Noise multiplier for [OutlierHandling::Inflate]
    pub inflation: f64,
    /// Additional discount weight for [OutlierHandling::Mixture]
    pub flagged_discount: f64,
    /// Support of the discount distribution, mg/dL
    pub discount_range: (f64, f64),
}

impl Default for ObservationModel {
    fn default() -> Self {
        ObservationModel {
            noise: NoiseModel::Gaussian,
            lookback: 2.0,
            outlier_handling: OutlierHandling::Inflate,
            inflation: 3.0,
            flagged_discount: 0.5,
            discount_range: (0.0, 600.0),
        }
    }
}

impl ObservationModel {
    pub fn validate(&self) -> Result<()> {
        if !(self.lookback.is_finite() && self.lookback >= 0.0) {
            bail!("The lookback window must be non-negative, got {}", self.lookback);
        }
        if !(self.inflation.is_finite() && self.inflation >= 1.0) {
            bail!("The noise inflation must be at least 1, got {}", self.inflation);
        }
        if !(0.0..=1.0).contains(&self.flagged_discount) {
            bail!(
                "The flagged discount must be within [0, 1], got {}",
                self.flagged_discount
            );
        }
        let (lower, upper) = self.discount_range;
        if !(lower.is_finite() && upper.is_finite() && lower < upper) {
            bail!("Invalid discount range ({}, {})", lower, upper);
        }
        Ok(())
    }

    /// Glucose readings of `data`, flagged by preceding treatments and exercise
    ///
    /// Readings taken before the first basal record are left out, since the delivered basal rate is unknown there.
    pub fn readings(&self, data: &Data) -> Vec<Reading> {
        let treatments: Vec<f64> = data
            .events()
            .iter()
            .filter_map(|e| match e {
                Event::Carbs(c) if c.kind == CarbKind::Treatment => Some(c.time),
                _ => None,
            })
            .collect();
        // Start, end and lookback of each exercise session
        let sessions: Vec<(f64, f64, f64)> = data
            .events()
            .iter()
            .filter_map(|e| match e {
                Event::Exercise(x) => Some((
                    x.time,
                    x.end(),
                    self.lookback * x.intensity.lookback_factor(),
                )),
                _ => None,
            })
            .collect();

        data.readings()
            .filter(|g| data.basal_known_at(g.time))
            .map(|g| {
                let t = g.time;
                let flag = if treatments
                    .iter()
                    .any(|&s| s <= t && s >= t - self.lookback)
                {
                    ReliabilityFlag::PostTreatment
                } else if sessions
                    .iter()
                    .any(|&(start, end, lookback)| start <= t && end >= t - lookback)
                {
                    ReliabilityFlag::PostExercise
                } else {
                    ReliabilityFlag::Normal
                };
                Reading {
                    time: t,
                    value: g.value,
                    flag,
                }
            })
            .collect()
    }

    /// Whether a reading is left out of the likelihood
    pub fn excludes(&self, reading: &Reading) -> bool {
        reading.is_flagged() && self.outlier_handling == OutlierHandling::Exclude
    }

    /// Noise scale applied to a reading
    pub fn sigma_for(&self, reading: &Reading, noise_sigma: f64) -> f64 {
        if reading.is_flagged() && self.outlier_handling == OutlierHandling::Inflate {
            noise_sigma * self.inflation
        } else {
            noise_sigma
        }
    }

    /// Weight of the discount component for a reading
    fn discount_weight(&self, reading: &Reading, outlier_prob: f64) -> f64 {
        if reading.is_flagged() && self.outlier_handling == OutlierHandling::Mixture {
            1.0 - (1.0 - outlier_prob) * (1.0 - self.flagged_discount)
        } else {
            outlier_prob
        }
    }

    /// Log density of the regular noise component
    fn log_regular(&self, value: f64, prediction: f64, sigma: f64) -> f64 {
        match self.noise {
            NoiseModel::Gaussian => normal_log_density(value, prediction, sigma),
            NoiseModel::LogNormal => {
                if prediction <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                normal_log_density(value.ln(), prediction.ln(), sigma) - value.ln()
            }
        }
    }

    fn log_discount(&self, value: f64) -> f64 {
        let (lower, upper) = self.discount_range;
        if (lower..=upper).contains(&value) {
            -(upper - lower).ln()
        } else {
            f64::NEG_INFINITY
        }
    }

    /// Log-likelihood of a single reading given the predicted glucose, `None` if the reading is excluded
    pub fn log_density(
        &self,
        reading: &Reading,
        prediction: f64,
        parameters: &ParameterVector,
    ) -> Option<f64> {
        if self.excludes(reading) {
            return None;
        }
        let sigma = self.sigma_for(reading, parameters.noise_sigma);
        let weight = self.discount_weight(reading, parameters.outlier_prob);
        let components = [
            weight.ln() + self.log_discount(reading.value),
            (1.0 - weight).ln() + self.log_regular(reading.value, prediction, sigma),
        ];
        Some(logsumexp(&components))
    }

    /// Sum of per-reading log-likelihoods over all included readings
    ///
    /// Readings outside the trajectory, or a non-positive noise scale, give `-inf`.
    pub fn log_likelihood(
        &self,
        trajectory: &Trajectory,
        readings: &[Reading],
        parameters: &ParameterVector,
    ) -> f64 {
        if !(parameters.noise_sigma > 0.0) || !(0.0..=1.0).contains(&parameters.outlier_prob) {
            return f64::NEG_INFINITY;
        }
        let mut total = 0.0;
        for reading in readings {
            if self.excludes(reading) {
                continue;
            }
            let Some(prediction) = trajectory.bg_at(reading.time) else {
                return f64::NEG_INFINITY;
            };
            if let Some(term) = self.log_density(reading, prediction, parameters) {
                total += term;
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Intensity;
    use crate::simulator::{kinetics::ProfileSet, simulate, SimulationOptions};

    fn fixture() -> (Data, Trajectory, ParameterVector) {
        let data = Data::builder()
            .basal(0.0, 24.0)
            .glucose(0.0, 118.0)
            .meal(0.5, 30.0)
            .bolus(0.5, 3.0)
            .glucose(1.0, 131.0)
            .glucose(2.0, 150.0)
            .treatment(2.5, 15.0)
            .glucose(3.0, 95.0)
            .glucose(4.0, 104.0)
            .build()
            .unwrap();
        let parameters = ParameterVector::scalar(1.0, 10.0, 50.0)
            .with_noise(12.0, 0.02)
            .with_initial_bg(120.0);
        let times = data.glucose_times();
        let trajectory = simulate(
            &data,
            &parameters,
            &ProfileSet::default(),
            &SimulationOptions::default(),
            &times,
        )
        .unwrap();
        (data, trajectory, parameters)
    }

    #[test]
    fn test_flags_follow_lookback() {
        let data = Data::builder()
            .basal(0.0, 24.0)
            .glucose(0.0, 100.0)
            .treatment(1.0, 15.0)
            .glucose(2.5, 110.0)
            .glucose(3.5, 110.0)
            .exercise(4.0, 1.0, Intensity::Moderate)
            .glucose(4.5, 90.0)
            .glucose(6.5, 95.0)
            .glucose(7.5, 100.0)
            .build()
            .unwrap();
        let model = ObservationModel::default();
        let flags: Vec<ReliabilityFlag> = model.readings(&data).iter().map(|r| r.flag).collect();
        assert_eq!(
            flags,
            vec![
                ReliabilityFlag::Normal,
                ReliabilityFlag::PostTreatment,
                ReliabilityFlag::Normal,
                ReliabilityFlag::PostExercise,
                ReliabilityFlag::PostExercise,
                ReliabilityFlag::Normal,
            ]
        );
    }

    #[test]
    fn test_exercise_intensity_scales_lookback() {
        let flags = |intensity: Intensity| -> Vec<ReliabilityFlag> {
            let data = Data::builder()
                .basal(0.0, 24.0)
                .exercise(0.0, 1.0, intensity)
                .glucose(1.5, 100.0)
                .glucose(2.5, 100.0)
                .glucose(4.5, 100.0)
                .build()
                .unwrap();
            ObservationModel::default()
                .readings(&data)
                .iter()
                .map(|r| r.flag)
                .collect()
        };
        use ReliabilityFlag::{Normal, PostExercise};
        assert_eq!(flags(Intensity::Light), vec![PostExercise, Normal, Normal]);
        assert_eq!(flags(Intensity::Moderate), vec![PostExercise, PostExercise, Normal]);
        assert_eq!(
            flags(Intensity::Vigorous),
            vec![PostExercise, PostExercise, PostExercise]
        );
    }

    #[test]
    fn test_reordering_readings_does_not_change_the_sum() {
        let (data, trajectory, parameters) = fixture();
        let model = ObservationModel::default();
        let readings = model.readings(&data);
        let mut reversed = readings.clone();
        reversed.reverse();
        reversed.swap(0, 2);

        let forward = model.log_likelihood(&trajectory, &readings, &parameters);
        let backward = model.log_likelihood(&trajectory, &reversed, &parameters);
        assert!(forward.is_finite());
        assert!((forward - backward).abs() < 1e-9);
    }

    #[test]
    fn test_event_order_changes_the_likelihood() {
        let (data, trajectory, parameters) = fixture();
        let model = ObservationModel::default();
        let readings = model.readings(&data);

        let shifted = Data::builder()
            .basal(0.0, 24.0)
            .glucose(0.0, 118.0)
            .glucose(1.0, 131.0)
            .glucose(2.0, 150.0)
            .meal(2.5, 30.0)
            .bolus(2.5, 3.0)
            .glucose(3.0, 95.0)
            .glucose(4.0, 104.0)
            .build()
            .unwrap();
        let other = simulate(
            &shifted,
            &parameters,
            &ProfileSet::default(),
            &SimulationOptions::default(),
            &shifted.glucose_times(),
        )
        .unwrap();
        let original = model.log_likelihood(&trajectory, &readings, &parameters);
        let reordered = model.log_likelihood(&other, &readings, &parameters);
        assert!((original - reordered).abs() > 1e-6);
    }

    #[test]
    fn test_vanishing_outlier_prob_gives_pure_noise_model() {
        let (_, trajectory, parameters) = fixture();
        let readings: Vec<Reading> = trajectory
            .points()
            .iter()
            .zip([3.0, -5.0, 8.0, -2.0, 4.0])
            .map(|(point, offset)| Reading {
                time: point.time,
                value: point.bg + offset,
                flag: ReliabilityFlag::Normal,
            })
            .collect();
        for noise in [NoiseModel::Gaussian, NoiseModel::LogNormal] {
            let model = ObservationModel {
                noise,
                ..ObservationModel::default()
            };
            let sigma = match noise {
                NoiseModel::Gaussian => 12.0,
                NoiseModel::LogNormal => 0.1,
            };
            let pure: f64 = readings
                .iter()
                .map(|r| {
                    let prediction = trajectory.bg_at(r.time).unwrap();
                    model.log_regular(r.value, prediction, model.sigma_for(r, sigma))
                })
                .sum();

            let mut previous_gap = f64::INFINITY;
            for p in [1e-2, 1e-4, 1e-6, 1e-9] {
                let params = parameters.clone().with_noise(sigma, p);
                let gap = (model.log_likelihood(&trajectory, &readings, &params) - pure).abs();
                assert!(gap <= previous_gap);
                previous_gap = gap;
            }
            assert!(previous_gap < 1e-6);
            let exact = parameters.clone().with_noise(sigma, 0.0);
            assert!((model.log_likelihood(&trajectory, &readings, &exact) - pure).abs() < 1e-12);
        }
    }

    #[test]
    fn test_outlier_handling_variants() {
        let (data, trajectory, parameters) = fixture();
        let inflate = ObservationModel::default();
        let exclude = ObservationModel {
            outlier_handling: OutlierHandling::Exclude,
            ..ObservationModel::default()
        };
        let mixture = ObservationModel {
            outlier_handling: OutlierHandling::Mixture,
            ..ObservationModel::default()
        };
        let readings = inflate.readings(&data);
        let flagged = readings.iter().find(|r| r.is_flagged()).unwrap();
        assert_eq!(flagged.time, 3.0);

        assert!(exclude.excludes(flagged));
        assert_eq!(inflate.sigma_for(flagged, 12.0), 36.0);
        assert!(mixture.discount_weight(flagged, 0.02) > 0.5);

        let included: Vec<Reading> = readings.iter().filter(|r| !r.is_flagged()).copied().collect();
        let excluded_total = exclude.log_likelihood(&trajectory, &readings, &parameters);
        let normal_only = inflate.log_likelihood(&trajectory, &included, &parameters);
        assert!((excluded_total - normal_only).abs() < 1e-12);
    }

    #[test]
    fn test_gross_outlier_is_bounded_by_discount_component() {
        let (_, trajectory, parameters) = fixture();
        let model = ObservationModel::default();
        let outlier = Reading {
            time: 2.0,
            value: 5.0,
            flag: ReliabilityFlag::Normal,
        };
        let term = model
            .log_density(&outlier, trajectory.bg_at(2.0).unwrap(), &parameters)
            .unwrap();
        assert!(term >= 0.02_f64.ln() - 600.0_f64.ln() - 1e-12);
    }

    #[test]
    fn test_reading_outside_trajectory() {
        let (_, trajectory, parameters) = fixture();
        let model = ObservationModel::default();
        let late = Reading {
            time: 10.0,
            value: 100.0,
            flag: ReliabilityFlag::Normal,
        };
        assert_eq!(
            model.log_likelihood(&trajectory, &[late], &parameters),
            f64::NEG_INFINITY
        );
    }
}
