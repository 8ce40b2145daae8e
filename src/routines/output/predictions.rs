use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{OutputFile, PosteriorSummary};
use crate::data::Data;
use crate::routines::math::{mean, quantile_sorted, sorted};
use crate::simulator::likelihood::{NoiseModel, ObservationModel, Reading};
use crate::simulator::{Context, TrajectoryPoint};
use crate::structs::parameters::ParameterVector;

/// Posterior predictive distribution at a single time point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub time: f64,
    /// Mean of the simulated glucose over the posterior draws
    pub mean: f64,
    pub median: f64,
    /// Lower bound of the predictive band, observation noise included
    pub lower: f64,
    pub upper: f64,
    pub iob: f64,
    pub cob: f64,
}

/// Glucose, IOB and COB predicted by a subset of the posterior draws
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PosteriorPredictive {
    rows: Vec<PredictionRow>,
    level: f64,
    ndraws: usize,
}

/// Evenly spread draw indices, at most `max_draws` of `n`
fn thin_indices(n: usize, max_draws: usize) -> Vec<usize> {
    let k = n.min(max_draws);
    (0..k).map(|i| i * n / k).collect()
}

/// A noisy reading around `bg`, from the regular noise component
fn observe<R: Rng + ?Sized>(noise: NoiseModel, bg: f64, sigma: f64, rng: &mut R) -> f64 {
    let z: f64 = rng.sample(StandardNormal);
    match noise {
        NoiseModel::Gaussian => bg + sigma * z,
        NoiseModel::LogNormal => bg * (sigma * z).exp(),
    }
}

impl PosteriorPredictive {
    /// Simulate up to `max_draws` posterior draws at `times`
    ///
    /// The band holds `level` of the simulated readings, which add the regular observation noise of each draw to
    /// its trajectory. Draw `i` uses its own generator seeded with `seed + i`.
    pub fn calculate(
        summary: &PosteriorSummary,
        data: &Data,
        context: &Context,
        times: &[f64],
        level: f64,
        max_draws: usize,
        seed: u64,
    ) -> Result<Self> {
        if !(level > 0.0 && level < 1.0) {
            bail!("The credible level must be within (0, 1), got {}", level);
        }
        let draws = summary.draws();
        if draws.nrows() == 0 {
            bail!("The posterior has no draws to predict from");
        }

        let indices = thin_indices(draws.nrows(), max_draws.max(1));
        let simulated: Vec<(Vec<TrajectoryPoint>, Vec<f64>)> = indices
            .par_iter()
            .enumerate()
            .map(|(i, &index)| -> Result<(Vec<TrajectoryPoint>, Vec<f64>)> {
                let values = draws.row(index).to_vec();
                let parameters = ParameterVector::from_slice(summary.layout(), &values)?;
                let trajectory = context.simulate(data, &parameters, times)?;
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
                let noisy = trajectory
                    .points()
                    .iter()
                    .map(|p| {
                        observe(
                            context.observation.noise,
                            p.bg,
                            parameters.noise_sigma,
                            &mut rng,
                        )
                    })
                    .collect();
                Ok((trajectory.points().to_vec(), noisy))
            })
            .collect::<Result<Vec<_>>>()?;

        let tail = (1.0 - level) / 2.0;
        let rows = times
            .iter()
            .enumerate()
            .map(|(t, &time)| {
                let bg: Vec<f64> = simulated.iter().map(|(p, _)| p[t].bg).collect();
                let noisy = sorted(&simulated.iter().map(|(_, n)| n[t]).collect::<Vec<_>>());
                let iob: Vec<f64> = simulated.iter().map(|(p, _)| p[t].iob).collect();
                let cob: Vec<f64> = simulated.iter().map(|(p, _)| p[t].cob).collect();
                PredictionRow {
                    time,
                    mean: mean(&bg),
                    median: quantile_sorted(&sorted(&bg), 0.5),
                    lower: quantile_sorted(&noisy, tail),
                    upper: quantile_sorted(&noisy, 1.0 - tail),
                    iob: mean(&iob),
                    cob: mean(&cob),
                }
            })
            .collect();

        Ok(PosteriorPredictive {
            rows,
            level,
            ndraws: indices.len(),
        })
    }

    pub fn rows(&self) -> &[PredictionRow] {
        &self.rows
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    /// Number of posterior draws simulated
    pub fn ndraws(&self) -> usize {
        self.ndraws
    }

    /// The row predicted at exactly `time`
    pub fn at(&self, time: f64) -> Option<&PredictionRow> {
        let index = self.rows.partition_point(|r| r.time < time);
        self.rows.get(index).filter(|r| r.time == time)
    }

    pub fn write(&self, folder: &str) -> Result<()> {
        tracing::debug!("Writing predictions...");
        OutputFile::new(folder, "predictions.csv")?.write_rows(&self.rows)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Residual {
    pub time: f64,
    pub observed: f64,
    pub predicted: f64,
    pub residual: f64,
    pub flagged: bool,
}

/// Observed minus posterior-mean predicted glucose for every included reading
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Residuals {
    rows: Vec<Residual>,
}

impl Residuals {
    /// `predictive` must have been calculated at the reading times
    pub fn new(
        readings: &[Reading],
        predictive: &PosteriorPredictive,
        observation: &ObservationModel,
    ) -> Self {
        let rows = readings
            .iter()
            .filter(|r| !observation.excludes(r))
            .filter_map(|r| {
                let row = predictive.at(r.time)?;
                Some(Residual {
                    time: r.time,
                    observed: r.value,
                    predicted: row.mean,
                    residual: r.value - row.mean,
                    flagged: r.is_flagged(),
                })
            })
            .collect();
        Residuals { rows }
    }

    pub fn rows(&self) -> &[Residual] {
        &self.rows
    }

    fn values(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.residual).collect()
    }

    pub fn mean(&self) -> f64 {
        mean(&self.values())
    }

    /// Population standard deviation
    pub fn sd(&self) -> f64 {
        let values = self.values();
        let mu = mean(&values);
        mean(&values.iter().map(|v| (v - mu).powi(2)).collect::<Vec<_>>()).sqrt()
    }

    pub fn rmse(&self) -> f64 {
        mean(&self.values().iter().map(|v| v * v).collect::<Vec<_>>()).sqrt()
    }

    pub fn mae(&self) -> f64 {
        mean(&self.values().iter().map(|v| v.abs()).collect::<Vec<_>>())
    }
}

/// How many included readings fall inside the predictive band
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Calibration {
    pub level: f64,
    pub inside: usize,
    pub total: usize,
}

impl Calibration {
    pub fn new(
        readings: &[Reading],
        predictive: &PosteriorPredictive,
        observation: &ObservationModel,
    ) -> Self {
        let mut inside = 0;
        let mut total = 0;
        for reading in readings.iter().filter(|r| !observation.excludes(r)) {
            if let Some(row) = predictive.at(reading.time) {
                total += 1;
                if row.lower <= reading.value && reading.value <= row.upper {
                    inside += 1;
                }
            }
        }
        Calibration {
            level: predictive.level(),
            inside,
            total,
        }
    }

    /// Fraction of readings inside the band, NaN without readings
    pub fn coverage(&self) -> f64 {
        if self.total == 0 {
            f64::NAN
        } else {
            self.inside as f64 / self.total as f64
        }
    }
}
