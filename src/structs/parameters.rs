use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::data::{DayPeriod, MealSlot, HOURS_PER_DAY};

/// The role of a single entry in the flattened parameter vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Basal,
    CarbRatio,
    CorrectionFactor,
    NoiseSigma,
    OutlierProb,
    ActionTimeScale,
    InitialBg,
}

impl ParameterKind {
    /// Whether `value` lies within the support of this parameter
    pub fn in_support(&self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match self {
            ParameterKind::Basal => value >= 0.0,
            ParameterKind::OutlierProb => (0.0..=1.0).contains(&value),
            ParameterKind::CarbRatio
            | ParameterKind::CorrectionFactor
            | ParameterKind::NoiseSigma
            | ParameterKind::ActionTimeScale
            | ParameterKind::InitialBg => value > 0.0,
        }
    }
}

/// Shape of the parameter vector
///
/// Basal may be a single rate or a rate per block of the day. Carbohydrate ratios may be shared or given per [MealSlot],
/// correction factors shared or given per [DayPeriod].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Layout {
    /// Number of equally long basal blocks covering the day
    pub basal_blocks: usize,
    /// One carbohydrate ratio per meal slot
    pub meal_slot_ratios: bool,
    /// Separate correction factors for day and night
    pub day_night_factors: bool,
}

impl Default for Layout {
    fn default() -> Self {
        Layout {
            basal_blocks: 1,
            meal_slot_ratios: false,
            day_night_factors: false,
        }
    }
}

impl Layout {
    pub fn validate(&self) -> Result<()> {
        if self.basal_blocks == 0 || self.basal_blocks > 24 {
            bail!(
                "The number of basal blocks must be between 1 and 24, got {}",
                self.basal_blocks
            );
        }
        Ok(())
    }

    pub fn ncarb_ratios(&self) -> usize {
        if self.meal_slot_ratios {
            MealSlot::ALL.len()
        } else {
            1
        }
    }

    pub fn ncorrection_factors(&self) -> usize {
        if self.day_night_factors {
            2
        } else {
            1
        }
    }

    /// Total number of entries in the flattened vector
    pub fn len(&self) -> usize {
        self.basal_blocks + self.ncarb_ratios() + self.ncorrection_factors() + 4
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Length of one basal block, in hours
    pub fn block_length(&self) -> f64 {
        HOURS_PER_DAY / self.basal_blocks as f64
    }

    /// Kind of every entry in the flattened vector
    pub fn kinds(&self) -> Vec<ParameterKind> {
        let mut kinds = vec![ParameterKind::Basal; self.basal_blocks];
        kinds.extend(vec![ParameterKind::CarbRatio; self.ncarb_ratios()]);
        kinds.extend(vec![ParameterKind::CorrectionFactor; self.ncorrection_factors()]);
        kinds.extend([
            ParameterKind::NoiseSigma,
            ParameterKind::OutlierProb,
            ParameterKind::ActionTimeScale,
            ParameterKind::InitialBg,
        ]);
        kinds
    }

    /// Name of every entry in the flattened vector
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.len());
        if self.basal_blocks == 1 {
            names.push("basal".to_string());
        } else {
            let length = self.block_length();
            for block in 0..self.basal_blocks {
                let start = block as f64 * length;
                names.push(format!("basal_{:02.0}_{:02.0}", start, start + length));
            }
        }
        if self.meal_slot_ratios {
            names.extend(MealSlot::ALL.iter().map(|s| format!("cr_{}", s.name())));
        } else {
            names.push("cr".to_string());
        }
        if self.day_night_factors {
            names.extend(
                [DayPeriod::Day, DayPeriod::Night]
                    .iter()
                    .map(|p| format!("cf_{}", p.name())),
            );
        } else {
            names.push("cf".to_string());
        }
        names.extend(
            ["noise_sigma", "outlier_prob", "action_time_scale", "initial_bg"]
                .iter()
                .map(|s| s.to_string()),
        );
        names
    }
}

/// A single point in parameter space
///
/// Rates are in U/h, carbohydrate ratios in g/U, correction factors in mg/dL per U.
/// `initial_bg` is the glucose level at the first simulated time point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterVector {
    pub basal: Vec<f64>,
    pub carb_ratio: Vec<f64>,
    pub correction_factor: Vec<f64>,
    pub noise_sigma: f64,
    pub outlier_prob: f64,
    pub action_time_scale: f64,
    pub initial_bg: f64,
}

impl ParameterVector {
    /// A vector with a single basal rate, carbohydrate ratio and correction factor
    pub fn scalar(basal: f64, carb_ratio: f64, correction_factor: f64) -> Self {
        ParameterVector {
            basal: vec![basal],
            carb_ratio: vec![carb_ratio],
            correction_factor: vec![correction_factor],
            noise_sigma: 10.0,
            outlier_prob: 0.0,
            action_time_scale: 1.0,
            initial_bg: 120.0,
        }
    }

    pub fn with_noise(mut self, noise_sigma: f64, outlier_prob: f64) -> Self {
        self.noise_sigma = noise_sigma;
        self.outlier_prob = outlier_prob;
        self
    }

    pub fn with_initial_bg(mut self, initial_bg: f64) -> Self {
        self.initial_bg = initial_bg;
        self
    }

    pub fn with_action_time_scale(mut self, scale: f64) -> Self {
        self.action_time_scale = scale;
        self
    }

    /// The layout this vector conforms to
    pub fn layout(&self) -> Result<Layout> {
        let layout = Layout {
            basal_blocks: self.basal.len(),
            meal_slot_ratios: match self.carb_ratio.len() {
                1 => false,
                5 => true,
                n => bail!("Expected 1 or 5 carbohydrate ratios, got {}", n),
            },
            day_night_factors: match self.correction_factor.len() {
                1 => false,
                2 => true,
                n => bail!("Expected 1 or 2 correction factors, got {}", n),
            },
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Basal rate in effect at `hour` of the day
    pub fn basal_at(&self, hour: f64) -> f64 {
        let n = self.basal.len();
        let block = ((hour / HOURS_PER_DAY * n as f64).floor() as usize).min(n - 1);
        self.basal[block]
    }

    /// Carbohydrate ratio for food eaten in `slot`
    pub fn carb_ratio_for(&self, slot: MealSlot) -> f64 {
        if self.carb_ratio.len() == 1 {
            self.carb_ratio[0]
        } else {
            self.carb_ratio[slot.index()]
        }
    }

    /// Correction factor during `period`
    pub fn correction_factor_for(&self, period: DayPeriod) -> f64 {
        if self.correction_factor.len() == 1 {
            self.correction_factor[0]
        } else {
            self.correction_factor[period.index()]
        }
    }

    /// Flatten in [Layout::names] order
    pub fn to_vec(&self) -> Vec<f64> {
        let mut values = Vec::with_capacity(self.basal.len() + self.carb_ratio.len() + 6);
        values.extend(&self.basal);
        values.extend(&self.carb_ratio);
        values.extend(&self.correction_factor);
        values.extend([
            self.noise_sigma,
            self.outlier_prob,
            self.action_time_scale,
            self.initial_bg,
        ]);
        values
    }

    /// Rebuild from a flattened slice in [Layout::names] order
    pub fn from_slice(layout: &Layout, values: &[f64]) -> Result<Self> {
        if values.len() != layout.len() {
            bail!(
                "Expected {} parameter values for the layout, got {}",
                layout.len(),
                values.len()
            );
        }
        let (basal, rest) = values.split_at(layout.basal_blocks);
        let (carb_ratio, rest) = rest.split_at(layout.ncarb_ratios());
        let (correction_factor, rest) = rest.split_at(layout.ncorrection_factors());
        Ok(ParameterVector {
            basal: basal.to_vec(),
            carb_ratio: carb_ratio.to_vec(),
            correction_factor: correction_factor.to_vec(),
            noise_sigma: rest[0],
            outlier_prob: rest[1],
            action_time_scale: rest[2],
            initial_bg: rest[3],
        })
    }
}
