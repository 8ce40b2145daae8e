pub mod kinetics;
pub mod likelihood;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::data::{Data, DayPeriod, Event, InsulinKind, MealSlot, HOURS_PER_DAY};
use crate::structs::parameters::ParameterVector;
use kinetics::{absorbed_fraction, action_fraction, ActionProfile, ProfileSet};
use likelihood::{ObservationModel, Reading};

/// Starting point of the integrated glucose trajectory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Anchor {
    /// Integrate from `initial_bg` at the first query time
    #[default]
    Free,
    /// Restart from the most recent glucose reading strictly before each query time
    ///
    /// Query times preceding every reading fall back to the free trajectory.
    Readings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SimulationOptions {
    pub anchor: Anchor,
    /// Longest interval between readings, in hours, that the free trajectory integrates across
    ///
    /// The first reading after a longer gap restarts the free trajectory from its observed value.
    pub max_gap: f64,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        SimulationOptions {
            anchor: Anchor::Free,
            max_gap: 16.0,
        }
    }
}

impl SimulationOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_gap > 0.0) {
            bail!("The maximum gap between readings must be positive, got {}", self.max_gap);
        }
        Ok(())
    }
}

/// Predicted state at a single time point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub time: f64,
    /// Predicted blood glucose, mg/dL
    pub bg: f64,
    /// Insulin on board, U
    pub iob: f64,
    /// Carbohydrates on board, g
    pub cob: f64,
}

/// An ordered sequence of predicted states
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    points: Vec<TrajectoryPoint>,
}

impl Trajectory {
    pub fn points(&self) -> &[TrajectoryPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn times(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.time).collect()
    }

    pub fn bg(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.bg).collect()
    }

    /// State at `time`, linearly interpolated between neighbouring points
    ///
    /// Returns `None` when `time` lies outside the trajectory.
    pub fn at(&self, time: f64) -> Option<TrajectoryPoint> {
        let first = self.points.first()?;
        let last = self.points.last()?;
        if time < first.time || time > last.time || time.is_nan() {
            return None;
        }
        let index = self.points.partition_point(|p| p.time < time);
        let right = self.points[index];
        if right.time == time || index == 0 {
            return Some(right);
        }
        let left = self.points[index - 1];
        let w = (time - left.time) / (right.time - left.time);
        let lerp = |a: f64, b: f64| a + w * (b - a);
        Some(TrajectoryPoint {
            time,
            bg: lerp(left.bg, right.bg),
            iob: lerp(left.iob, right.iob),
            cob: lerp(left.cob, right.cob),
        })
    }

    /// Predicted glucose at `time`, see [Trajectory::at]
    pub fn bg_at(&self, time: f64) -> Option<f64> {
        self.at(time).map(|p| p.bg)
    }
}

/// Kinetic, simulation and observation settings shared by inference and reporting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub profiles: ProfileSet,
    pub simulation: SimulationOptions,
    pub observation: ObservationModel,
}

impl Context {
    pub fn validate(&self) -> Result<()> {
        self.profiles.validate()?;
        self.simulation.validate()?;
        self.observation.validate()
    }

    pub fn simulate(
        &self,
        data: &Data,
        parameters: &ParameterVector,
        query_times: &[f64],
    ) -> Result<Trajectory> {
        simulate(data, parameters, &self.profiles, &self.simulation, query_times)
    }

    /// Log-likelihood of `readings` under the trajectory simulated at their times
    ///
    /// Parameters the simulator rejects give `-inf`.
    pub fn log_likelihood(
        &self,
        data: &Data,
        readings: &[Reading],
        parameters: &ParameterVector,
    ) -> f64 {
        let mut times: Vec<f64> = readings.iter().map(|r| r.time).collect();
        times.sort_by(|a, b| a.total_cmp(b));
        match self.simulate(data, parameters, &times) {
            Ok(trajectory) => self
                .observation
                .log_likelihood(&trajectory, readings, parameters),
            Err(_) => f64::NEG_INFINITY,
        }
    }
}

/// A dose or intake with its glucose effect per unit amount
struct Contribution<'a> {
    time: f64,
    amount: f64,
    /// mg/dL per unit amount, negative for insulin
    effect: f64,
    profile: &'a ActionProfile,
}

/// Everything the integrator needs, resolved once per call
struct Model<'a> {
    data: &'a Data,
    parameters: &'a ParameterVector,
    time_scale: f64,
    basal_records: Vec<(f64, f64)>,
    boundaries: Vec<f64>,
    insulin: Vec<Contribution<'a>>,
    carbs: Vec<Contribution<'a>>,
}

impl<'a> Model<'a> {
    fn new(data: &'a Data, parameters: &'a ParameterVector, profiles: &'a ProfileSet) -> Self {
        let cf_at = |time: f64| {
            parameters.correction_factor_for(DayPeriod::from_hour(data.time_of_day(time)))
        };

        let mut basal_records = Vec::new();
        let mut insulin = Vec::new();
        let mut carbs = Vec::new();
        for event in data.events() {
            match event {
                Event::Insulin(dose) if dose.kind == InsulinKind::Basal => {
                    basal_records.push((dose.time, dose.units / HOURS_PER_DAY));
                }
                Event::Insulin(dose) => insulin.push(Contribution {
                    time: dose.time,
                    amount: dose.units,
                    effect: -cf_at(dose.time),
                    profile: &profiles.insulin,
                }),
                Event::Carbs(intake) => {
                    let slot = MealSlot::from_hour(data.time_of_day(intake.time));
                    carbs.push(Contribution {
                        time: intake.time,
                        amount: intake.grams,
                        effect: cf_at(intake.time) / parameters.carb_ratio_for(slot),
                        profile: profiles.carbs(intake.kind),
                    })
                }
                Event::Glucose(_) | Event::Exercise(_) => {}
            }
        }

        // Hours of day at which the basal need or the correction factor may change
        let block = HOURS_PER_DAY / parameters.basal.len() as f64;
        let mut boundaries: Vec<f64> = (0..parameters.basal.len())
            .map(|k| k as f64 * block)
            .chain([DayPeriod::DAY_START, DayPeriod::NIGHT_START])
            .collect();
        boundaries.sort_by(|a, b| a.total_cmp(b));
        boundaries.dedup();

        Model {
            data,
            parameters,
            time_scale: parameters.action_time_scale,
            basal_records,
            boundaries,
            insulin,
            carbs,
        }
    }

    /// Delivered basal rate at `time`, zero before the first record
    fn delivered(&self, time: f64) -> f64 {
        let index = self.basal_records.partition_point(|(t, _)| *t <= time);
        if index == 0 {
            0.0
        } else {
            self.basal_records[index - 1].1
        }
    }

    /// Times in `(a, b)` where the drift integrand may jump
    fn breakpoints(&self, a: f64, b: f64) -> Vec<f64> {
        let mut points = vec![a];
        let hour = self.data.time_of_day(a);
        for boundary in &self.boundaries {
            let mut ahead = (boundary - hour).rem_euclid(HOURS_PER_DAY);
            if ahead == 0.0 {
                ahead = HOURS_PER_DAY;
            }
            let mut t = a + ahead;
            while t < b {
                points.push(t);
                t += HOURS_PER_DAY;
            }
        }
        points.extend(
            self.basal_records
                .iter()
                .map(|(t, _)| *t)
                .filter(|t| *t > a && *t < b),
        );
        points.push(b);
        points.sort_by(|x, y| x.total_cmp(y));
        points.dedup();
        points
    }

    /// ∫ CF(u) (basal need(u) - basal delivered(u)) du over `[a, b]`
    fn drift(&self, a: f64, b: f64) -> f64 {
        self.breakpoints(a, b)
            .windows(2)
            .map(|piece| {
                let mid = 0.5 * (piece[0] + piece[1]);
                let hour = self.data.time_of_day(mid);
                let cf = self
                    .parameters
                    .correction_factor_for(DayPeriod::from_hour(hour));
                let need = self.parameters.basal_at(hour);
                cf * (need - self.delivered(mid)) * (piece[1] - piece[0])
            })
            .sum()
    }

    fn effect(&self, contributions: &[Contribution], a: f64, b: f64) -> f64 {
        contributions
            .iter()
            .take_while(|c| c.time < b)
            .map(|c| {
                let absorbed = absorbed_fraction(c.profile, b - c.time, self.time_scale)
                    - absorbed_fraction(c.profile, a - c.time, self.time_scale);
                c.amount * c.effect * absorbed
            })
            .sum()
    }

    /// Change in glucose over `[a, b]`
    fn increment(&self, a: f64, b: f64) -> f64 {
        if b <= a {
            return 0.0;
        }
        self.drift(a, b) + self.effect(&self.insulin, a, b) + self.effect(&self.carbs, a, b)
    }

    fn on_board(&self, contributions: &[Contribution], time: f64) -> f64 {
        contributions
            .iter()
            .take_while(|c| c.time <= time)
            .map(|c| c.amount * action_fraction(c.profile, time - c.time, self.time_scale))
            .sum()
    }
}

/// Predict glucose, insulin on board and carbohydrates on board at each query time
///
/// The glucose change between two time points integrates the unmet basal need, the insulin effect scaled by the
/// correction factor, and the carbohydrate effect scaled by the correction factor over the carbohydrate ratio.
/// Effect rates are integrated exactly through the absorbed fraction of each profile.
///
/// With [Anchor::Free] the trajectory starts from `initial_bg` at the first query time, and restarts from the
/// observed value at each reading that follows more than `max_gap` hours without readings.
///
/// Query times must be finite and non-decreasing.
pub fn simulate(
    data: &Data,
    parameters: &ParameterVector,
    profiles: &ProfileSet,
    options: &SimulationOptions,
    query_times: &[f64],
) -> Result<Trajectory> {
    parameters.layout()?;
    if !(parameters.action_time_scale.is_finite() && parameters.action_time_scale > 0.0) {
        bail!(
            "The action time scale must be positive, got {}",
            parameters.action_time_scale
        );
    }
    let mut previous = f64::NEG_INFINITY;
    for &time in query_times {
        if !time.is_finite() || time < previous {
            bail!("Query times must be finite and non-decreasing, got {} after {}", time, previous);
        }
        previous = time;
    }
    options.validate()?;

    let model = Model::new(data, parameters, profiles);
    let readings: Vec<(f64, f64)> = data.readings().map(|g| (g.time, g.value)).collect();
    let restarts: Vec<(f64, f64)> = readings
        .windows(2)
        .filter(|pair| pair[1].0 - pair[0].0 > options.max_gap)
        .map(|pair| pair[1])
        .collect();

    let mut points = Vec::with_capacity(query_times.len());
    let mut free: Option<(f64, f64)> = None;
    for &time in query_times {
        let anchored = match options.anchor {
            Anchor::Free => None,
            Anchor::Readings => {
                let index = readings.partition_point(|(t, _)| *t < time);
                index.checked_sub(1).map(|i| readings[i])
            }
        };
        let bg = match anchored {
            Some((start, value)) => value + model.increment(start, time),
            None => {
                let bg = match free {
                    None => parameters.initial_bg,
                    Some((start, value)) => {
                        let index = restarts.partition_point(|(t, _)| *t <= time);
                        match index.checked_sub(1).map(|i| restarts[i]) {
                            Some((gap_end, observed)) if gap_end > start => {
                                observed + model.increment(gap_end, time)
                            }
                            _ => value + model.increment(start, time),
                        }
                    }
                };
                free = Some((time, bg));
                bg
            }
        };
        points.push(TrajectoryPoint {
            time,
            bg,
            iob: model.on_board(&model.insulin, time),
            cob: model.on_board(&model.carbs, time),
        });
    }

    Ok(Trajectory { points })
}
