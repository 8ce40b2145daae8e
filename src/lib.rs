//! bgcore infers personal insulin dosing parameters from glucose, insulin, carbohydrate and exercise records.
//!
//! A forward model predicts blood glucose from the events and a parameter vector (basal rates, carbohydrate ratios,
//! correction factors, observation noise and an action-time scale). Random-walk Metropolis chains sample the
//! posterior of that vector under a mixture observation model, and the posterior is summarised, checked for
//! convergence and compared against the prescribed protocol.
//!
//! ```no_run
//! use bgcore::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let data = Data::builder()
//!     .basal(0.0, 24.0)
//!     .glucose(0.0, 110.0)
//!     .meal(1.0, 40.0)
//!     .bolus(1.0, 4.0)
//!     .glucose(3.0, 150.0)
//!     .build()?;
//! let settings = settings::read("settings.toml")?;
//! let result = fit(&data, &settings)?;
//! for row in result.summary.parameter_summaries() {
//!     println!("{}: {:.2} ({:.2} - {:.2})", row.name, row.mean, row.lower, row.upper);
//! }
//! # Ok(())
//! # }
//! ```

pub mod algorithms;
pub mod data;
pub mod routines;
pub mod simulator;
pub mod structs;

pub use anyhow::Result;

use algorithms::{infer, Budget, Sampler};
use data::Data;
use routines::logger::setup_log;
use routines::output::{PosteriorSummary, Report};
use routines::settings::Settings;
use structs::priors::ParameterSpace;

pub mod prelude {
    pub use super::Result;
    pub use super::{fit, fit_with_budget, FitResult};
    pub use crate::algorithms;
    pub use crate::algorithms::diagnostics::{Convergence, Diagnostics};
    pub use crate::algorithms::{infer, Budget, Chain, ChainFailure, ChainOutcome, Sampler, Status};
    pub use crate::data::{
        CarbKind, Data, DataError, DayPeriod, Event, InsulinKind, Intensity, MealSlot, Protocol,
        ProtocolHistory,
    };
    pub use crate::routines;
    pub use crate::routines::logger;
    pub use crate::routines::output::{
        Calibration, ParameterSummary, PosteriorPredictive, PosteriorSummary, ProtocolComparison,
        Report, Residuals,
    };
    pub use crate::routines::settings::{self, Config, Settings};
    pub use crate::simulator::kinetics::{ActionProfile, ProfileSet, Shape};
    pub use crate::simulator::likelihood::{
        NoiseModel, ObservationModel, OutlierHandling, Reading, ReliabilityFlag,
    };
    pub use crate::simulator::{simulate, Anchor, Context, SimulationOptions, Trajectory};
    pub use crate::structs::parameters::{Layout, ParameterKind, ParameterVector};
    pub use crate::structs::priors::{ParameterSpace, Prior, Priors};
}

/// Everything produced by [fit]
#[derive(Debug, Clone)]
pub struct FitResult {
    pub space: ParameterSpace,
    pub summary: PosteriorSummary,
    /// Absent when no chain produced draws
    pub report: Option<Report>,
}

/// Fit the parameters of `data` as configured by `settings`
pub fn fit(data: &Data, settings: &Settings) -> Result<FitResult> {
    fit_with_budget(data, settings, Budget::unlimited())
}

/// Like [fit], stopping the chains early once `budget` is exhausted
pub fn fit_with_budget(data: &Data, settings: &Settings, budget: Budget) -> Result<FitResult> {
    setup_log(settings)?;
    settings.validate()?;
    tracing::info!("Fitting {} readings over {} events", data.nreadings(), data.events().len());

    let data = match settings.simulation.clock_offset {
        Some(offset) => Data::with_clock_offset(data.events().to_vec(), offset)?,
        None => data.clone(),
    };
    let first_reading = data
        .first_known_reading()
        .unwrap_or_else(|| data.first_reading())
        .value;

    let space = match (&settings.protocol.prescribed, settings.protocol.centre_priors) {
        (Some(protocol), true) => {
            tracing::info!("Centring priors on the prescribed protocol");
            ParameterSpace::from_protocol(
                settings.parameters,
                protocol,
                settings.protocol.spread,
                &settings.priors,
                first_reading,
            )?
        }
        _ => ParameterSpace::new(settings.parameters, &settings.priors, first_reading)?,
    };

    let context = settings.context();
    let sampler = Sampler::new(settings.config.clone())
        .with_convergence(settings.convergence.clone())
        .with_budget(budget);
    let summary = infer(&data, &space, &context, &sampler)?;

    let report = if summary.ndraws() > 0 {
        Some(Report::new(
            &summary,
            &data,
            &context,
            &settings.predictions,
            settings.protocol.prescribed.as_ref(),
            settings.config.seed,
        )?)
    } else {
        tracing::warn!("No draws to report on");
        None
    };

    if settings.output.write {
        let folder = settings.output.path.as_str();
        summary.write_draws(folder)?;
        summary.write_summary(folder)?;
        if let Some(report) = &report {
            report.write(folder)?;
        }
        tracing::info!("Results written to {}", folder);
    }

    Ok(FitResult {
        space,
        summary,
        report,
    })
}
