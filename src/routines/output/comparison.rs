use anyhow::{bail, Result};
use serde::Serialize;

use super::{OutputFile, PosteriorSummary};
use crate::data::{DayPeriod, MealSlot, Protocol};
use crate::routines::math::{mean, quantile_sorted, sorted};

/// Prescribed value of one parameter against its posterior
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRow {
    pub parameter: String,
    pub prescribed: f64,
    pub posterior_mean: f64,
    pub lower: f64,
    pub upper: f64,
    pub within_interval: bool,
    /// `(posterior_mean - prescribed) / prescribed`
    pub relative_difference: f64,
}

/// The basal rates, carbohydrate ratios and correction factors of a prescribed protocol, set against the posterior
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolComparison {
    level: f64,
    rows: Vec<ComparisonRow>,
}

impl ProtocolComparison {
    /// Compare with central credible intervals holding `level` of the posterior mass
    ///
    /// Shared ratios and factors are compared against the mean of the prescribed values.
    pub fn new(summary: &PosteriorSummary, protocol: &Protocol, level: f64) -> Result<Self> {
        if !(level > 0.0 && level < 1.0) {
            bail!("The credible level must be within (0, 1), got {}", level);
        }
        let draws = summary.draws();
        if draws.nrows() == 0 {
            bail!("The posterior has no draws to compare against");
        }
        let layout = summary.layout();

        let mut prescribed = vec![protocol.basal; layout.basal_blocks];
        if layout.meal_slot_ratios {
            prescribed.extend(MealSlot::ALL.iter().map(|s| protocol.carb_ratio(*s)));
        } else {
            prescribed.push(protocol.mean_carb_ratio());
        }
        if layout.day_night_factors {
            prescribed.extend(
                [DayPeriod::Day, DayPeriod::Night]
                    .iter()
                    .map(|p| protocol.correction_factor(*p)),
            );
        } else {
            prescribed.push(protocol.mean_correction_factor());
        }

        let tail = (1.0 - level) / 2.0;
        let rows = prescribed
            .into_iter()
            .enumerate()
            .map(|(j, prescribed)| {
                let column = draws.column(j).to_vec();
                let ordered = sorted(&column);
                let posterior_mean = mean(&column);
                let lower = quantile_sorted(&ordered, tail);
                let upper = quantile_sorted(&ordered, 1.0 - tail);
                ComparisonRow {
                    parameter: summary.names()[j].clone(),
                    prescribed,
                    posterior_mean,
                    lower,
                    upper,
                    within_interval: lower <= prescribed && prescribed <= upper,
                    relative_difference: if prescribed > 0.0 {
                        (posterior_mean - prescribed) / prescribed
                    } else {
                        f64::NAN
                    },
                }
            })
            .collect();

        Ok(ProtocolComparison { level, rows })
    }

    pub fn rows(&self) -> &[ComparisonRow] {
        &self.rows
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    /// Whether every prescribed value lies within its credible interval
    pub fn consistent(&self) -> bool {
        self.rows.iter().all(|r| r.within_interval)
    }

    pub fn write(&self, folder: &str) -> Result<()> {
        OutputFile::new(folder, "comparison.csv")?.write_rows(&self.rows)
    }
}
