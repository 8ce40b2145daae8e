use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::Data;
use crate::routines::output::PosteriorSummary;
use crate::routines::settings::Config;
use crate::simulator::Context;
use crate::structs::priors::ParameterSpace;
use diagnostics::Convergence;
use metropolis::Target;

pub mod diagnostics;
pub mod metropolis;
pub mod transforms;

/// Represents the status of a posterior summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Every chain completed and the diagnostics meet the convergence thresholds
    Converged,
    /// The chains completed, but the diagnostics do not meet the thresholds or a chain failed
    NotConverged,
    /// Sampling was cut short by the budget
    Incomplete,
    /// No chain produced usable draws
    Failed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Converged => write!(f, "Converged"),
            Status::NotConverged => write!(f, "Not converged"),
            Status::Incomplete => write!(f, "Incomplete, budget exhausted"),
            Status::Failed => write!(f, "All chains failed"),
        }
    }
}

/// Reasons a chain stops without usable draws
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum ChainFailure {
    #[error("no prior draw with a finite posterior density in {attempts} attempts")]
    NoFiniteStart { attempts: usize },
    #[error("gave up after {restarts} restarts from the prior following divergent proposals")]
    RetriesExhausted { restarts: usize },
    #[error("could not draw from the prior: {0}")]
    Prior(String),
}

/// How a chain ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChainOutcome {
    Completed,
    /// Stopped by the budget, the draws cover only part of the requested iterations
    Cancelled,
    Failed(ChainFailure),
}

/// Draws and bookkeeping of a single chain
#[derive(Debug, Clone, Serialize)]
pub struct Chain {
    pub id: usize,
    pub seed: u64,
    /// Retained draws (rows) by parameters (columns), in parameter space
    pub draws: Array2<f64>,
    /// Log posterior density of each retained draw
    pub log_density: Vec<f64>,
    /// Fraction of accepted proposals after burn-in
    pub acceptance_rate: f64,
    /// Restarts from the prior after runs of divergent proposals
    pub restarts: usize,
    /// Final proposal scales, in unconstrained space
    pub proposal_scales: Vec<f64>,
    pub outcome: ChainOutcome,
}

impl Chain {
    pub fn ndraws(&self) -> usize {
        self.draws.nrows()
    }

    pub fn failed(&self) -> bool {
        matches!(self.outcome, ChainOutcome::Failed(_))
    }

    pub fn cancelled(&self) -> bool {
        self.outcome == ChainOutcome::Cancelled
    }
}

/// External limits on a sampling run
///
/// Chains poll the budget once per iteration and stop with [ChainOutcome::Cancelled] when it is exhausted.
#[derive(Debug, Clone, Default)]
pub struct Budget {
    pub deadline: Option<Instant>,
    pub stop: Option<Arc<AtomicBool>>,
}

impl Budget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Stop once `timeout` has elapsed from now, or at the existing deadline if that comes first
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    /// Stop once `flag` is set
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    pub fn exhausted(&self) -> bool {
        if let Some(stop) = &self.stop {
            if stop.load(Ordering::Relaxed) {
                return true;
            }
        }
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Everything that controls a sampling run
#[derive(Debug, Clone, Default)]
pub struct Sampler {
    pub config: Config,
    pub convergence: Convergence,
    pub budget: Budget,
}

impl Sampler {
    pub fn new(config: Config) -> Self {
        Sampler {
            config,
            ..Default::default()
        }
    }

    pub fn with_convergence(mut self, convergence: Convergence) -> Self {
        self.convergence = convergence;
        self
    }

    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }
}

/// Sample the posterior of the parameters given the data
///
/// Runs `config.chains` random-walk Metropolis chains in parallel on the target
/// `log_prior + log_likelihood(simulate(...))`. Only invalid inputs are errors: numerical trouble ends up in the
/// chain outcomes, non-convergence and cancellation in the [Status] of the summary.
pub fn infer(
    data: &Data,
    space: &ParameterSpace,
    context: &Context,
    sampler: &Sampler,
) -> Result<PosteriorSummary> {
    let config = &sampler.config;
    config.validate()?;
    context.validate()?;
    sampler.convergence.validate()?;

    let Some(basal_start) = data.basal_known_from() else {
        bail!("The data holds no basal record, so the delivered basal rate is unknown");
    };
    let readings = context.observation.readings(data);
    let unknown = data.nreadings() - readings.len();
    if unknown > 0 {
        tracing::warn!(
            "{} readings precede the first basal record at {:.2} h and are left out",
            unknown,
            basal_start
        );
    }
    if readings.iter().all(|r| context.observation.excludes(r)) {
        bail!("Every glucose reading is excluded by the observation model");
    }
    let flagged = readings.iter().filter(|r| r.is_flagged()).count();
    tracing::info!(
        "Sampling {} parameters from {} readings ({} flagged) with {} chains",
        space.dim(),
        readings.len(),
        flagged,
        config.chains
    );

    let budget = match config.timeout {
        Some(seconds) => sampler
            .budget
            .clone()
            .with_timeout(Duration::from_secs_f64(seconds)),
        None => sampler.budget.clone(),
    };

    let target = Target::new(data, space, context, &readings);
    let chains: Vec<Chain> = (0..config.chains)
        .into_par_iter()
        .map(|id| metropolis::run_chain(&target, config, id, &budget))
        .collect();

    for chain in chains.iter() {
        if let ChainOutcome::Failed(failure) = &chain.outcome {
            tracing::error!("Chain {} failed: {}", chain.id, failure);
        }
    }

    let summary = PosteriorSummary::new(space, chains, &sampler.convergence);
    tracing::info!(
        "Sampling finished: {} (max R-hat {:.3}, min ESS {:.0})",
        summary.status(),
        summary.diagnostics().max_r_hat(),
        summary.diagnostics().min_ess()
    );
    Ok(summary)
}
