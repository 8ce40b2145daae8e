//! Action-time profiles for insulin and carbohydrates
//!
//! A profile describes how one unit of a dose (or one gram of carbohydrate) is used up over time.
//! Two curves are exposed for each profile:
//!
//! - the remaining fraction, [action_fraction], which starts at 1 and decays to exactly 0 at the end of the action time
//! - the effect rate, [effect_rate], the negative derivative of the remaining fraction, which integrates to 1
//!
//! All time arguments are in hours. The `time_scale` argument stretches the time axis of every profile uniformly,
//! on top of the profile's own `scale`.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::data::{CarbKind, Event, InsulinKind};

/// Shape of an action-time curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    /// Triangular effect rate, rising linearly to the peak and falling linearly to zero at the end of the action time
    Linear,
    /// Rapid-acting insulin curve, an exponentially decaying activity shaped by the peak time
    #[serde(alias = "biexponential", alias = "humalog")]
    Exponential,
}

/// A parametric action-time curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionProfile {
    pub shape: Shape,
    /// Time of maximum effect rate, in hours
    pub peak: f64,
    /// Total action time, in hours
    pub duration: f64,
    /// Fixed stretch of the time axis for this profile
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_scale() -> f64 {
    1.0
}

impl ActionProfile {
    pub fn linear(peak: f64, duration: f64) -> Self {
        ActionProfile {
            shape: Shape::Linear,
            peak,
            duration,
            scale: 1.0,
        }
    }

    pub fn exponential(peak: f64, duration: f64) -> Self {
        ActionProfile {
            shape: Shape::Exponential,
            peak,
            duration,
            scale: 1.0,
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Action time after applying both the profile scale and `time_scale`
    pub fn scaled_duration(&self, time_scale: f64) -> f64 {
        self.duration * self.scale * time_scale
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.duration.is_finite() && self.duration > 0.0) {
            bail!("Action profile duration must be positive, got {}", self.duration);
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            bail!("Action profile scale must be positive, got {}", self.scale);
        }
        match self.shape {
            Shape::Linear => {
                if !(0.0..self.duration).contains(&self.peak) {
                    bail!(
                        "Linear profile peak ({}) must be within [0, duration) = [0, {})",
                        self.peak,
                        self.duration
                    );
                }
            }
            Shape::Exponential => {
                if !(self.peak > 0.0 && self.peak < self.duration / 2.0) {
                    bail!(
                        "Exponential profile peak ({}) must be within (0, duration / 2) = (0, {})",
                        self.peak,
                        self.duration / 2.0
                    );
                }
            }
        }
        Ok(())
    }

    /// Time constants of the exponential curve: (tau, a, S)
    fn exponential_constants(&self) -> (f64, f64, f64) {
        let tp = self.peak;
        let td = self.duration;
        let tau = tp * (1.0 - tp / td) / (1.0 - 2.0 * tp / td);
        let a = 2.0 * tau / td;
        let s = 1.0 / (1.0 - a + (1.0 + a) * (-td / tau).exp());
        (tau, a, s)
    }

    /// Remaining fraction at unscaled time `t` within `[0, duration]`
    fn remaining(&self, t: f64) -> f64 {
        let td = self.duration;
        match self.shape {
            Shape::Linear => {
                let tp = self.peak;
                let height = 2.0 / td;
                if t < tp {
                    1.0 - 0.5 * height * t * t / tp
                } else {
                    let left = td - t;
                    0.5 * height * left * left / (td - tp)
                }
            }
            Shape::Exponential => {
                let (tau, a, s) = self.exponential_constants();
                let decay = (-t / tau).exp();
                1.0 - s * (1.0 - a) * ((t * t / (tau * td * (1.0 - a)) - t / tau - 1.0) * decay + 1.0)
            }
        }
    }

    /// Effect rate at unscaled time `t` within `[0, duration)`
    fn rate(&self, t: f64) -> f64 {
        let td = self.duration;
        match self.shape {
            Shape::Linear => {
                let tp = self.peak;
                let height = 2.0 / td;
                if t < tp {
                    height * t / tp
                } else {
                    height * (td - t) / (td - tp)
                }
            }
            Shape::Exponential => {
                let (tau, _, s) = self.exponential_constants();
                s / (tau * tau) * t * (1.0 - t / td) * (-t / tau).exp()
            }
        }
    }
}

/// Fraction of a dose still to act after `elapsed` hours
///
/// Zero before the event (`elapsed < 0`) and at or after the end of the scaled action time.
/// Non-increasing on `[0, duration)`, starting at one.
pub fn action_fraction(profile: &ActionProfile, elapsed: f64, time_scale: f64) -> f64 {
    let stretch = profile.scale * time_scale;
    if elapsed < 0.0 || elapsed >= profile.duration * stretch {
        return 0.0;
    }
    profile.remaining(elapsed / stretch).clamp(0.0, 1.0)
}

/// Rate, per hour, at which a unit dose acts after `elapsed` hours
///
/// Zero before the event and after the end of the scaled action time.
pub fn effect_rate(profile: &ActionProfile, elapsed: f64, time_scale: f64) -> f64 {
    let stretch = profile.scale * time_scale;
    if elapsed < 0.0 || elapsed >= profile.duration * stretch {
        return 0.0;
    }
    profile.rate(elapsed / stretch).max(0.0) / stretch
}

/// Fraction of a dose that has acted after `elapsed` hours
///
/// Zero before the event, one after the end of the scaled action time.
/// The integral of [effect_rate] over `[a, b]` is `absorbed_fraction(b) - absorbed_fraction(a)`.
pub fn absorbed_fraction(profile: &ActionProfile, elapsed: f64, time_scale: f64) -> f64 {
    if elapsed <= 0.0 {
        return 0.0;
    }
    1.0 - action_fraction(profile, elapsed, time_scale)
}

/// Action profiles keyed by event kind and subtype
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProfileSet {
    /// Rapid-acting insulin boluses
    pub insulin: ActionProfile,
    /// Ordinary meals
    pub meal: ActionProfile,
    /// Fast sugar taken to treat a low
    pub treatment: ActionProfile,
    /// Carbohydrates eaten for exercise
    pub exercise_snack: ActionProfile,
}

impl Default for ProfileSet {
    fn default() -> Self {
        ProfileSet {
            insulin: ActionProfile::exponential(1.25, 5.0),
            meal: ActionProfile::linear(0.75, 3.0),
            treatment: ActionProfile::linear(0.25, 1.0),
            exercise_snack: ActionProfile::linear(1.0, 4.0),
        }
    }
}

impl ProfileSet {
    pub fn validate(&self) -> Result<()> {
        self.insulin.validate()?;
        self.meal.validate()?;
        self.treatment.validate()?;
        self.exercise_snack.validate()?;
        Ok(())
    }

    pub fn carbs(&self, kind: CarbKind) -> &ActionProfile {
        match kind {
            CarbKind::Meal => &self.meal,
            CarbKind::Treatment => &self.treatment,
            CarbKind::ExerciseSnack => &self.exercise_snack,
        }
    }

    /// The profile governing an event, if it contributes to insulin or carbs on board
    pub fn for_event(&self, event: &Event) -> Option<&ActionProfile> {
        match event {
            Event::Insulin(insulin) if insulin.kind == InsulinKind::Bolus => {
                Some(&self.insulin)
            }
            Event::Carbs(carbs) => Some(self.carbs(carbs.kind)),
            _ => None,
        }
    }

    /// Longest scaled action time across all profiles
    pub fn max_duration(&self, time_scale: f64) -> f64 {
        [&self.insulin, &self.meal, &self.treatment, &self.exercise_snack]
            .iter()
            .map(|p| p.scaled_duration(time_scale))
            .fold(0.0, f64::max)
    }
}
