use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{DayPeriod, MealSlot};

/// Clinician-prescribed dosing parameters
///
/// `basal` is a rate in U/h. Carbohydrate ratios are given per [MealSlot], correction factors per [DayPeriod].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Protocol {
    pub basal: f64,
    pub carb_ratios: [f64; 5],
    pub correction_factors: [f64; 2],
}

impl Protocol {
    /// A protocol with the same ratio for every meal and the same factor day and night
    pub fn uniform(basal: f64, carb_ratio: f64, correction_factor: f64) -> Self {
        Protocol {
            basal,
            carb_ratios: [carb_ratio; 5],
            correction_factors: [correction_factor; 2],
        }
    }

    pub fn carb_ratio(&self, slot: MealSlot) -> f64 {
        self.carb_ratios[slot.index()]
    }

    pub fn correction_factor(&self, period: DayPeriod) -> f64 {
        self.correction_factors[period.index()]
    }

    /// Mean carbohydrate ratio over all meal slots
    pub fn mean_carb_ratio(&self) -> f64 {
        self.carb_ratios.iter().sum::<f64>() / self.carb_ratios.len() as f64
    }

    /// Mean correction factor over day and night
    pub fn mean_correction_factor(&self) -> f64 {
        self.correction_factors.iter().sum::<f64>() / self.correction_factors.len() as f64
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let values = std::iter::once(self.basal)
            .chain(self.carb_ratios)
            .chain(self.correction_factors);
        for value in values {
            if !value.is_finite() || value < 0.0 {
                anyhow::bail!("Protocol values must be finite and non-negative, got {}", value);
            }
        }
        if self.carb_ratios.iter().chain(&self.correction_factors).any(|&v| v == 0.0) {
            anyhow::bail!("Carbohydrate ratios and correction factors must be positive");
        }
        Ok(())
    }
}

/// Range (min, max) of a protocol field over a period
pub type Range = (f64, f64);

/// Ranges of every protocol field over a date interval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolRanges {
    pub basal: Range,
    pub carb_ratios: [Range; 5],
    pub correction_factors: [Range; 2],
}

/// Dated protocol changes
///
/// Each entry holds the date a protocol came into effect. It stays in effect until the next entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolHistory {
    entries: Vec<(NaiveDate, Protocol)>,
}

impl ProtocolHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a protocol starting on `start`, keeping entries ordered by date
    pub fn add(mut self, start: NaiveDate, protocol: Protocol) -> Self {
        let position = self.entries.partition_point(|(date, _)| *date <= start);
        self.entries.insert(position, (start, protocol));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The protocol in effect on `date`, if any started on or before it
    pub fn active_on(&self, date: NaiveDate) -> Option<&Protocol> {
        self.entries
            .iter()
            .rev()
            .find(|(start, _)| *start <= date)
            .map(|(_, protocol)| protocol)
    }

    /// All protocols in effect at some point between `start` and `end` (inclusive)
    pub fn active_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<&Protocol> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(i, (date, _))| {
                let next = self.entries.get(i + 1).map(|(d, _)| *d);
                *date <= end && next.map_or(true, |n| n > start)
            })
            .map(|(_, (_, protocol))| protocol)
            .collect()
    }

    /// Min and max of each protocol field over the protocols in effect between `start` and `end`
    pub fn ranges(&self, start: NaiveDate, end: NaiveDate) -> Option<ProtocolRanges> {
        let active = self.active_between(start, end);
        let first = active.first()?;

        let span = |f: &dyn Fn(&Protocol) -> f64| -> Range {
            active.iter().fold((f(first), f(first)), |(lo, hi), p| {
                (lo.min(f(p)), hi.max(f(p)))
            })
        };

        Some(ProtocolRanges {
            basal: span(&|p: &Protocol| p.basal),
            carb_ratios: std::array::from_fn(|i| span(&|p: &Protocol| p.carb_ratios[i])),
            correction_factors: std::array::from_fn(|i| {
                span(&|p: &Protocol| p.correction_factors[i])
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn history() -> ProtocolHistory {
        ProtocolHistory::new()
            .add(date("2016-12-01"), Protocol::uniform(1.1, 35.0, 200.0))
            .add(date("2016-11-01"), Protocol::uniform(1.0, 40.0, 250.0))
            .add(date("2017-01-15"), Protocol::uniform(1.2, 30.0, 180.0))
    }

    #[test]
    fn test_active_on() {
        let history = history();
        assert!(history.active_on(date("2016-10-01")).is_none());
        assert_eq!(history.active_on(date("2016-11-20")).unwrap().basal, 1.0);
        assert_eq!(history.active_on(date("2016-12-01")).unwrap().basal, 1.1);
        assert_eq!(history.active_on(date("2017-06-01")).unwrap().basal, 1.2);
    }

    #[test]
    fn test_ranges_over_interval() {
        let history = history();
        let ranges = history
            .ranges(date("2016-11-15"), date("2016-12-15"))
            .unwrap();
        assert_eq!(ranges.basal, (1.0, 1.1));
        assert_eq!(ranges.carb_ratios[0], (35.0, 40.0));
        assert_eq!(ranges.correction_factors[1], (200.0, 250.0));

        assert_eq!(history.active_between(date("2017-02-01"), date("2017-03-01")).len(), 1);
    }
}
