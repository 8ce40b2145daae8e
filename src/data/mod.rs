use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod protocol;

pub use protocol::{Protocol, ProtocolHistory};

/// Hours in a day, used to map timestamps onto the clock
pub const HOURS_PER_DAY: f64 = 24.0;

/// Reasons a collection of events is rejected at ingestion
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("event {index} has a non-finite field")]
    NonFinite { index: usize },
    #[error("event {index} at time {time} precedes the previous event at time {previous}")]
    Unsorted {
        index: usize,
        time: f64,
        previous: f64,
    },
    #[error("glucose reading {index} has non-positive value {value}")]
    NonPositiveGlucose { index: usize, value: f64 },
    #[error("event {index} has negative amount {amount}")]
    NegativeAmount { index: usize, amount: f64 },
    #[error("exercise event {index} has non-positive duration {duration}")]
    NonPositiveDuration { index: usize, duration: f64 },
    #[error("clock offset {0} is not within [0, 24)")]
    InvalidClockOffset(f64),
    #[error("the data contains no glucose readings")]
    NoReadings,
}

/// Subtype of an insulin dose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsulinKind {
    /// Rapid-acting dose, contributes to insulin on board
    Bolus,
    /// Long-acting daily dose, sets the delivered basal rate until the next record
    Basal,
}

/// Subtype of a carbohydrate intake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CarbKind {
    /// Ordinary food
    Meal,
    /// Fast sugar taken to treat a low
    Treatment,
    /// Carbohydrates eaten for exercise
    ExerciseSnack,
}

/// Intensity class of an exercise session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    Light,
    Moderate,
    Vigorous,
}

impl Intensity {
    /// Multiplier on the lookback window during which readings after the session are flagged
    pub fn lookback_factor(&self) -> f64 {
        match self {
            Intensity::Light => 0.5,
            Intensity::Moderate => 1.0,
            Intensity::Vigorous => 2.0,
        }
    }
}

/// A measured blood glucose concentration in mg/dL
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Glucose {
    pub time: f64,
    pub value: f64,
}

/// An insulin dose in units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Insulin {
    pub time: f64,
    pub units: f64,
    pub kind: InsulinKind,
}

/// A carbohydrate intake in grams
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Carbs {
    pub time: f64,
    pub grams: f64,
    pub kind: CarbKind,
}

/// An exercise session starting at `time` and lasting `duration` hours
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Exercise {
    pub time: f64,
    pub duration: f64,
    pub intensity: Intensity,
}

impl Exercise {
    pub fn end(&self) -> f64 {
        self.time + self.duration
    }
}

/// An Event can be a glucose reading, an insulin dose, a carbohydrate intake or an exercise marker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Event {
    Glucose(Glucose),
    Insulin(Insulin),
    Carbs(Carbs),
    Exercise(Exercise),
}

impl Event {
    pub fn time(&self) -> f64 {
        match self {
            Event::Glucose(glucose) => glucose.time,
            Event::Insulin(insulin) => insulin.time,
            Event::Carbs(carbs) => carbs.time,
            Event::Exercise(exercise) => exercise.time,
        }
    }

    fn is_finite(&self) -> bool {
        match self {
            Event::Glucose(g) => g.time.is_finite() && g.value.is_finite(),
            Event::Insulin(i) => i.time.is_finite() && i.units.is_finite(),
            Event::Carbs(c) => c.time.is_finite() && c.grams.is_finite(),
            Event::Exercise(e) => e.time.is_finite() && e.duration.is_finite(),
        }
    }

    fn validate(&self, index: usize) -> Result<(), DataError> {
        if !self.is_finite() {
            return Err(DataError::NonFinite { index });
        }
        match self {
            Event::Glucose(g) if g.value <= 0.0 => Err(DataError::NonPositiveGlucose {
                index,
                value: g.value,
            }),
            Event::Insulin(i) if i.units < 0.0 => Err(DataError::NegativeAmount {
                index,
                amount: i.units,
            }),
            Event::Carbs(c) if c.grams < 0.0 => Err(DataError::NegativeAmount {
                index,
                amount: c.grams,
            }),
            Event::Exercise(e) if e.duration <= 0.0 => Err(DataError::NonPositiveDuration {
                index,
                duration: e.duration,
            }),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Event::Glucose(g) => write!(f, "Glucose at time {:.2}: {:.1} mg/dL", g.time, g.value),
            Event::Insulin(i) => write!(
                f,
                "{:?} insulin at time {:.2}: {:.2} U",
                i.kind, i.time, i.units
            ),
            Event::Carbs(c) => write!(f, "{:?} carbs at time {:.2}: {:.1} g", c.kind, c.time, c.grams),
            Event::Exercise(e) => write!(
                f,
                "{:?} exercise at time {:.2} for {:.2} h",
                e.intensity, e.time, e.duration
            ),
        }
    }
}

/// Time-of-day slot in which carbohydrates are eaten
///
/// The carbohydrate ratio is keyed on when food is eaten, not on when it acts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MealSlot {
    Breakfast,
    Lunch,
    Snack,
    Dinner,
    Bedtime,
}

impl MealSlot {
    pub const ALL: [MealSlot; 5] = [
        MealSlot::Breakfast,
        MealSlot::Lunch,
        MealSlot::Snack,
        MealSlot::Dinner,
        MealSlot::Bedtime,
    ];

    /// Classify an hour of day in `[0, 24)`
    pub fn from_hour(hour: f64) -> Self {
        match hour {
            h if (4.0..10.0).contains(&h) => MealSlot::Breakfast,
            h if (10.0..14.0).contains(&h) => MealSlot::Lunch,
            h if (14.0..17.0).contains(&h) => MealSlot::Snack,
            h if (17.0..21.0).contains(&h) => MealSlot::Dinner,
            _ => MealSlot::Bedtime,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            MealSlot::Breakfast => 0,
            MealSlot::Lunch => 1,
            MealSlot::Snack => 2,
            MealSlot::Dinner => 3,
            MealSlot::Bedtime => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MealSlot::Breakfast => "breakfast",
            MealSlot::Lunch => "lunch",
            MealSlot::Snack => "snack",
            MealSlot::Dinner => "dinner",
            MealSlot::Bedtime => "bedtime",
        }
    }
}

/// Day or night period, used for the correction factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayPeriod {
    Day,
    Night,
}

impl DayPeriod {
    /// Hour of day at which the day period starts
    pub const DAY_START: f64 = 6.0;
    /// Hour of day at which the night period starts
    pub const NIGHT_START: f64 = 22.0;

    pub fn from_hour(hour: f64) -> Self {
        if (Self::DAY_START..Self::NIGHT_START).contains(&hour) {
            DayPeriod::Day
        } else {
            DayPeriod::Night
        }
    }

    pub fn index(&self) -> usize {
        match self {
            DayPeriod::Day => 0,
            DayPeriod::Night => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DayPeriod::Day => "day",
            DayPeriod::Night => "night",
        }
    }
}

/// A validated, chronologically ordered series of events
///
/// Events are immutable once ingested. Events sharing a timestamp keep their ingestion order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Data {
    events: Vec<Event>,
    /// Hour of day at `time = 0`
    clock_offset: f64,
}

impl Data {
    /// Validate and wrap a series of events, with `time = 0` at midnight
    pub fn new(events: Vec<Event>) -> Result<Self, DataError> {
        Self::with_clock_offset(events, 0.0)
    }

    /// Validate and wrap a series of events, with `time = 0` at hour `clock_offset` of the day
    pub fn with_clock_offset(events: Vec<Event>, clock_offset: f64) -> Result<Self, DataError> {
        if !(0.0..HOURS_PER_DAY).contains(&clock_offset) {
            return Err(DataError::InvalidClockOffset(clock_offset));
        }

        let mut previous = f64::NEG_INFINITY;
        for (index, event) in events.iter().enumerate() {
            event.validate(index)?;
            let time = event.time();
            if time < previous {
                return Err(DataError::Unsorted {
                    index,
                    time,
                    previous,
                });
            }
            previous = time;
        }

        if !events.iter().any(|e| matches!(e, Event::Glucose(_))) {
            return Err(DataError::NoReadings);
        }

        Ok(Data {
            events,
            clock_offset,
        })
    }

    pub fn builder() -> DataBuilder {
        DataBuilder::new()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn clock_offset(&self) -> f64 {
        self.clock_offset
    }

    /// Hour of day, in `[0, 24)`, of a timestamp
    pub fn time_of_day(&self, time: f64) -> f64 {
        (time + self.clock_offset).rem_euclid(HOURS_PER_DAY)
    }

    /// Glucose readings in chronological order
    pub fn readings(&self) -> impl Iterator<Item = &Glucose> + '_ {
        self.events.iter().filter_map(|e| match e {
            Event::Glucose(g) => Some(g),
            _ => None,
        })
    }

    pub fn glucose_times(&self) -> Vec<f64> {
        self.readings().map(|g| g.time).collect()
    }

    pub fn nreadings(&self) -> usize {
        self.readings().count()
    }

    /// The first glucose reading; validation guarantees there is one
    pub fn first_reading(&self) -> Glucose {
        self.readings()
            .next()
            .copied()
            .unwrap_or(Glucose { time: 0.0, value: 0.0 })
    }

    /// Time of the first basal record
    ///
    /// The delivered basal rate is unknown before it, and `None` means it is unknown throughout.
    pub fn basal_known_from(&self) -> Option<f64> {
        self.events.iter().find_map(|e| match e {
            Event::Insulin(i) if i.kind == InsulinKind::Basal => Some(i.time),
            _ => None,
        })
    }

    /// Whether the delivered basal rate is known at `time`
    pub fn basal_known_at(&self, time: f64) -> bool {
        self.basal_known_from().is_some_and(|start| time >= start)
    }

    /// The first glucose reading taken while the delivered basal rate is known
    pub fn first_known_reading(&self) -> Option<Glucose> {
        let start = self.basal_known_from()?;
        self.readings().find(|g| g.time >= start).copied()
    }

    /// Time span covered by the events
    pub fn span(&self) -> (f64, f64) {
        let first = self.events.first().map(|e| e.time()).unwrap_or(0.0);
        let last = self.events.last().map(|e| e.time()).unwrap_or(0.0);
        (first, last)
    }

    /// Events with `start <= time < end`
    ///
    /// Returns `None` if the window holds no glucose readings.
    /// Basal records before the window are carried over to its start, so the delivered basal rate stays known.
    pub fn window(&self, start: f64, end: f64) -> Option<Data> {
        let carried = self
            .events
            .iter()
            .filter(|e| e.time() < start)
            .filter_map(|e| match e {
                Event::Insulin(i) if i.kind == InsulinKind::Basal => Some(*i),
                _ => None,
            })
            .last()
            .map(|i| Event::Insulin(Insulin { time: start, ..i }));

        let events: Vec<Event> = carried
            .into_iter()
            .chain(
                self.events
                    .iter()
                    .filter(|e| e.time() >= start && e.time() < end)
                    .copied(),
            )
            .collect();

        Data::with_clock_offset(events, self.clock_offset).ok()
    }

    /// Split the series into consecutive windows of `length` hours
    ///
    /// Windows without glucose readings are skipped.
    pub fn segments(&self, length: f64) -> Vec<Data> {
        if !(length > 0.0) {
            return vec![];
        }
        let (first, last) = self.span();
        let mut segments = Vec::new();
        let mut start = first;
        while start <= last {
            if let Some(segment) = self.window(start, start + length) {
                segments.push(segment);
            }
            start += length;
        }
        segments
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Data (clock offset {:.2} h):", self.clock_offset)?;
        for event in &self.events {
            writeln!(f, "  {}", event)?;
        }
        Ok(())
    }
}

/// Incrementally collects events, validated on [DataBuilder::build]
#[derive(Debug, Clone, Default)]
pub struct DataBuilder {
    events: Vec<Event>,
    clock_offset: f64,
}

impl DataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clock_offset(mut self, hour: f64) -> Self {
        self.clock_offset = hour;
        self
    }

    pub fn event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }

    pub fn glucose(self, time: f64, value: f64) -> Self {
        self.event(Event::Glucose(Glucose { time, value }))
    }

    pub fn bolus(self, time: f64, units: f64) -> Self {
        self.event(Event::Insulin(Insulin {
            time,
            units,
            kind: InsulinKind::Bolus,
        }))
    }

    /// A long-acting daily basal dose
    pub fn basal(self, time: f64, units: f64) -> Self {
        self.event(Event::Insulin(Insulin {
            time,
            units,
            kind: InsulinKind::Basal,
        }))
    }

    pub fn meal(self, time: f64, grams: f64) -> Self {
        self.carbs(time, grams, CarbKind::Meal)
    }

    pub fn treatment(self, time: f64, grams: f64) -> Self {
        self.carbs(time, grams, CarbKind::Treatment)
    }

    pub fn carbs(self, time: f64, grams: f64, kind: CarbKind) -> Self {
        self.event(Event::Carbs(Carbs { time, grams, kind }))
    }

    pub fn exercise(self, time: f64, duration: f64, intensity: Intensity) -> Self {
        self.event(Event::Exercise(Exercise {
            time,
            duration,
            intensity,
        }))
    }

    pub fn build(self) -> Result<Data, DataError> {
        Data::with_clock_offset(self.events, self.clock_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsorted_events_are_rejected() {
        let result = Data::builder()
            .glucose(1.0, 120.0)
            .bolus(0.5, 2.0)
            .build();

        assert_eq!(
            result,
            Err(DataError::Unsorted {
                index: 1,
                time: 0.5,
                previous: 1.0
            })
        );
    }

    #[test]
    fn test_equal_timestamps_keep_ingestion_order() {
        let data = Data::builder()
            .glucose(0.0, 120.0)
            .meal(1.0, 40.0)
            .bolus(1.0, 4.0)
            .build()
            .unwrap();

        assert!(matches!(data.events()[1], Event::Carbs(_)));
        assert!(matches!(data.events()[2], Event::Insulin(_)));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            Data::builder().glucose(0.0, 0.0).build(),
            Err(DataError::NonPositiveGlucose { index: 0, .. })
        ));
        assert!(matches!(
            Data::builder().glucose(0.0, 100.0).bolus(1.0, -1.0).build(),
            Err(DataError::NegativeAmount { index: 1, .. })
        ));
        assert!(matches!(
            Data::builder()
                .glucose(0.0, 100.0)
                .exercise(1.0, 0.0, Intensity::Light)
                .build(),
            Err(DataError::NonPositiveDuration { index: 1, .. })
        ));
        assert!(matches!(
            Data::builder().glucose(f64::NAN, 100.0).build(),
            Err(DataError::NonFinite { index: 0 })
        ));
        assert_eq!(
            Data::builder().meal(0.0, 10.0).build(),
            Err(DataError::NoReadings)
        );
    }

    #[test]
    fn test_time_of_day_slots() {
        let data = Data::builder()
            .clock_offset(7.0)
            .glucose(0.0, 100.0)
            .build()
            .unwrap();

        assert_eq!(data.time_of_day(0.0), 7.0);
        assert_eq!(data.time_of_day(20.0), 3.0);
        assert_eq!(MealSlot::from_hour(data.time_of_day(0.0)), MealSlot::Breakfast);
        assert_eq!(MealSlot::from_hour(data.time_of_day(20.0)), MealSlot::Bedtime);
        assert_eq!(DayPeriod::from_hour(data.time_of_day(16.0)), DayPeriod::Night);
    }

    #[test]
    fn test_segments_carry_basal_records() {
        let data = Data::builder()
            .basal(0.0, 24.0)
            .glucose(1.0, 100.0)
            .glucose(30.0, 110.0)
            .glucose(50.0, 105.0)
            .build()
            .unwrap();

        let segments = data.segments(24.0);
        assert_eq!(segments.len(), 3);
        for segment in &segments {
            assert_eq!(segment.nreadings(), 1);
            assert!(matches!(
                segment.events()[0],
                Event::Insulin(Insulin {
                    kind: InsulinKind::Basal,
                    ..
                })
            ));
        }
        assert_eq!(segments[1].events()[0].time(), 24.0);
    }

    #[test]
    fn test_basal_is_unknown_before_first_record() {
        let data = Data::builder()
            .glucose(0.0, 100.0)
            .glucose(6.0, 110.0)
            .basal(12.0, 24.0)
            .glucose(12.0, 120.0)
            .glucose(18.0, 115.0)
            .build()
            .unwrap();
        assert_eq!(data.basal_known_from(), Some(12.0));
        assert!(!data.basal_known_at(6.0));
        assert!(data.basal_known_at(12.0));
        assert_eq!(
            data.first_known_reading(),
            Some(Glucose {
                time: 12.0,
                value: 120.0
            })
        );

        let unknown = Data::builder().glucose(0.0, 100.0).build().unwrap();
        assert_eq!(unknown.basal_known_from(), None);
        assert!(!unknown.basal_known_at(0.0));
        assert_eq!(unknown.first_known_reading(), None);
    }
}
