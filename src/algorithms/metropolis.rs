use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use super::transforms::{Transform, Transforms};
use super::{Budget, Chain, ChainFailure, ChainOutcome};
use crate::data::Data;
use crate::routines::settings::Config;
use crate::simulator::likelihood::Reading;
use crate::simulator::Context;
use crate::structs::parameters::ParameterVector;
use crate::structs::priors::ParameterSpace;

/// Prior draws tried before a chain gives up on finding a starting point
const MAX_INIT_ATTEMPTS: usize = 100;

/// The log posterior density, evaluated in unconstrained space
pub struct Target<'a> {
    data: &'a Data,
    space: &'a ParameterSpace,
    context: &'a Context,
    readings: &'a [Reading],
    transforms: Transforms,
}

impl<'a> Target<'a> {
    pub fn new(
        data: &'a Data,
        space: &'a ParameterSpace,
        context: &'a Context,
        readings: &'a [Reading],
    ) -> Self {
        Target {
            data,
            space,
            context,
            readings,
            transforms: Transforms::new(space.kinds()),
        }
    }

    pub fn dim(&self) -> usize {
        self.space.dim()
    }

    /// `log_prior + log_likelihood` at a point in parameter space
    pub fn log_posterior(&self, values: &[f64]) -> f64 {
        let log_prior = self.space.log_prior_slice(values);
        if !log_prior.is_finite() {
            return f64::NEG_INFINITY;
        }
        let Ok(parameters) = ParameterVector::from_slice(self.space.layout(), values) else {
            return f64::NEG_INFINITY;
        };
        log_prior
            + self
                .context
                .log_likelihood(self.data, self.readings, &parameters)
    }

    /// Log posterior density of the unconstrained point `z`, including the Jacobian of the transform
    pub fn log_density(&self, z: &[f64]) -> f64 {
        let values = self.transforms.forward(z);
        let density = self.log_posterior(&values) + self.transforms.log_abs_det_jacobian(z);
        if density.is_nan() {
            f64::NEG_INFINITY
        } else {
            density
        }
    }
}

struct State {
    z: Vec<f64>,
    log_density: f64,
}

/// A fresh starting point drawn from the prior, with finite density
fn initial_state(target: &Target, rng: &mut StdRng) -> Result<State, ChainFailure> {
    for _ in 0..MAX_INIT_ATTEMPTS {
        let values = target
            .space
            .sample(rng)
            .map_err(|e| ChainFailure::Prior(e.to_string()))?;
        let z = target.transforms.inverse(&values);
        if z.iter().any(|v| !v.is_finite()) {
            continue;
        }
        let log_density = target.log_density(&z);
        if log_density.is_finite() {
            return Ok(State { z, log_density });
        }
    }
    Err(ChainFailure::NoFiniteStart {
        attempts: MAX_INIT_ATTEMPTS,
    })
}

/// Starting proposal scale for each coordinate, in unconstrained units
fn initial_scales(target: &Target, z: &[f64]) -> Vec<f64> {
    z.iter()
        .enumerate()
        .map(|(j, value)| match target.transforms.get(j) {
            Transform::Identity => 0.05 * value.abs().max(10.0),
            Transform::Log | Transform::Logit => 0.1,
        })
        .collect()
}

/// Run a single component-wise random-walk Metropolis chain
///
/// Each iteration updates every coordinate in turn with a normal step. During burn-in the step of each
/// coordinate is tuned every `adapt_interval` iterations toward `target_acceptance`, then frozen.
/// Proposals with a non-finite density are rejected; after `max_divergent` of them in a row the chain restarts
/// from a fresh prior draw, and fails once it has restarted more than `max_retries` times.
/// The `burn_in` iterations following a restart are discarded, with the proposal scales left as they are.
pub fn run_chain(target: &Target, config: &Config, id: usize, budget: &Budget) -> Chain {
    let seed = config.seed.wrapping_add(id as u64);
    let mut rng = StdRng::seed_from_u64(seed);
    let dim = target.dim();

    let span = tracing::info_span!("", "{}", format!("Chain {}", id));
    let _enter = span.enter();

    let mut state = match initial_state(target, &mut rng) {
        Ok(state) => state,
        Err(failure) => {
            return Chain {
                id,
                seed,
                draws: Array2::zeros((0, dim)),
                log_density: vec![],
                acceptance_rate: 0.0,
                restarts: 0,
                proposal_scales: vec![],
                outcome: ChainOutcome::Failed(failure),
            }
        }
    };
    let mut scales = initial_scales(target, &state.z);

    let mut draws: Vec<Vec<f64>> = Vec::new();
    let mut log_density: Vec<f64> = Vec::new();
    let mut batch_accepted = vec![0usize; dim];
    let mut batch_length = 0usize;
    let mut batches = 0usize;
    let mut accepted = 0usize;
    let mut proposed = 0usize;
    let mut divergent = 0usize;
    let mut restarts = 0usize;
    // First iteration whose state is retained
    let mut retain_from = config.burn_in;

    let total = if config.iterations == 0 {
        0
    } else {
        config.burn_in + config.iterations
    };
    let mut outcome = if config.iterations == 0 {
        ChainOutcome::Cancelled
    } else {
        ChainOutcome::Completed
    };

    tracing::debug!("Starting chain with seed {}", seed);

    'sampling: for iteration in 0..total {
        if budget.exhausted() {
            tracing::warn!("Budget exhausted after {} iterations", iteration);
            outcome = ChainOutcome::Cancelled;
            break;
        }
        let adapting = iteration < config.burn_in;

        for j in 0..dim {
            let sampling = iteration >= retain_from;
            let mut proposal = state.z.clone();
            proposal[j] += scales[j] * rng.sample::<f64, _>(StandardNormal);
            let density = target.log_density(&proposal);
            if sampling {
                proposed += 1;
            }

            if !density.is_finite() {
                divergent += 1;
                if divergent >= config.max_divergent {
                    restarts += 1;
                    if restarts > config.max_retries {
                        outcome = ChainOutcome::Failed(ChainFailure::RetriesExhausted {
                            restarts: config.max_retries,
                        });
                        break 'sampling;
                    }
                    tracing::warn!(
                        "{} consecutive non-finite proposals, restarting from the prior ({}/{})",
                        divergent,
                        restarts,
                        config.max_retries
                    );
                    state = match initial_state(target, &mut rng) {
                        Ok(state) => state,
                        Err(failure) => {
                            outcome = ChainOutcome::Failed(failure);
                            break 'sampling;
                        }
                    };
                    divergent = 0;
                    retain_from = iteration + 1 + config.burn_in;
                }
                continue;
            }
            divergent = 0;

            if density - state.log_density >= rng.random::<f64>().ln() {
                state = State {
                    z: proposal,
                    log_density: density,
                };
                if sampling {
                    accepted += 1;
                }
                if adapting {
                    batch_accepted[j] += 1;
                }
            }
        }

        if adapting {
            batch_length += 1;
            if batch_length == config.adapt_interval {
                batches += 1;
                let delta = (1.0 / (batches as f64).sqrt()).min(0.5);
                for (scale, count) in scales.iter_mut().zip(batch_accepted.iter_mut()) {
                    let rate = *count as f64 / batch_length as f64;
                    if rate > config.target_acceptance {
                        *scale *= delta.exp();
                    } else {
                        *scale /= delta.exp();
                    }
                    *count = 0;
                }
                batch_length = 0;
            }
        } else if iteration >= retain_from && (iteration - config.burn_in) % config.thin == 0 {
            draws.push(target.transforms.forward(&state.z));
            log_density.push(state.log_density);
        }
    }

    if draws.is_empty() && !matches!(outcome, ChainOutcome::Failed(_)) {
        draws.push(target.transforms.forward(&state.z));
        log_density.push(state.log_density);
    }

    let acceptance_rate = if proposed > 0 {
        accepted as f64 / proposed as f64
    } else {
        0.0
    };
    tracing::info!(
        "Finished with {} draws, acceptance rate {:.3}, {} restarts",
        draws.len(),
        acceptance_rate,
        restarts
    );

    Chain {
        id,
        seed,
        draws: Array2::from_shape_fn((draws.len(), dim), |(i, j)| draws[i][j]),
        log_density,
        acceptance_rate,
        restarts,
        proposal_scales: scales,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::diagnostics::Convergence;
    use crate::algorithms::Status;
    use crate::routines::output::PosteriorSummary;
    use crate::structs::parameters::Layout;
    use crate::structs::priors::{Prior, Priors};

    fn fixture() -> (Data, ParameterSpace, Context) {
        let data = Data::builder()
            .basal(0.0, 24.0)
            .glucose(0.0, 120.0)
            .glucose(2.0, 118.0)
            .glucose(4.0, 123.0)
            .glucose(6.0, 121.0)
            .build()
            .unwrap();
        let space = ParameterSpace::new(Layout::default(), &Priors::default(), 120.0).unwrap();
        (data, space, Context::default())
    }

    #[test]
    fn test_chains_are_reproducible() {
        let (data, space, context) = fixture();
        let readings = context.observation.readings(&data);
        let target = Target::new(&data, &space, &context, &readings);
        let config = Config {
            iterations: 50,
            burn_in: 50,
            ..Config::default()
        };
        let first = run_chain(&target, &config, 1, &Budget::unlimited());
        let second = run_chain(&target, &config, 1, &Budget::unlimited());
        assert_eq!(first.draws, second.draws);
        assert_eq!(first.outcome, ChainOutcome::Completed);
        assert_eq!(first.ndraws(), 50);

        let other = run_chain(&target, &config, 2, &Budget::unlimited());
        assert_ne!(first.draws, other.draws);
    }

    #[test]
    fn test_draws_stay_in_support() {
        let (data, space, context) = fixture();
        let readings = context.observation.readings(&data);
        let target = Target::new(&data, &space, &context, &readings);
        let config = Config {
            iterations: 200,
            burn_in: 100,
            thin: 2,
            ..Config::default()
        };
        let chain = run_chain(&target, &config, 0, &Budget::unlimited());
        assert_eq!(chain.ndraws(), 100);
        for row in chain.draws.rows() {
            assert!(space.log_prior_slice(row.as_slice().unwrap()).is_finite());
        }
        assert!(chain.acceptance_rate > 0.0 && chain.acceptance_rate < 1.0);
    }

    #[test]
    fn test_stop_flag_cancels() {
        let (data, space, context) = fixture();
        let readings = context.observation.readings(&data);
        let target = Target::new(&data, &space, &context, &readings);
        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
        let budget = Budget::unlimited().with_stop_flag(flag);
        let chain = run_chain(&target, &Config::default(), 0, &budget);
        assert_eq!(chain.outcome, ChainOutcome::Cancelled);
        assert_eq!(chain.ndraws(), 1);
    }

    #[test]
    fn test_chain_without_finite_start_fails() {
        let (data, _, context) = fixture();
        // A reading without a density makes every point -inf
        let readings = vec![Reading {
            time: 2.0,
            value: f64::NAN,
            flag: crate::simulator::likelihood::ReliabilityFlag::Normal,
        }];
        let space = ParameterSpace::new(Layout::default(), &Priors::default(), 120.0).unwrap();
        let target = Target::new(&data, &space, &context, &readings);
        let chain = run_chain(&target, &Config::default(), 0, &Budget::unlimited());
        assert_eq!(
            chain.outcome,
            ChainOutcome::Failed(ChainFailure::NoFiniteStart {
                attempts: MAX_INIT_ATTEMPTS
            })
        );
        assert_eq!(chain.ndraws(), 0);
    }

    /// A basal prior so narrow that most basal proposals leave its support
    fn narrow_basal_space(width: f64) -> ParameterSpace {
        let priors = Priors {
            basal: Prior::Uniform {
                lower: 1.0 - width,
                upper: 1.0 + width,
            },
            ..Priors::default()
        };
        ParameterSpace::new(Layout::default(), &priors, 120.0).unwrap()
    }

    #[test]
    fn test_exhausted_retries_fail_the_chain() {
        let (data, space, context) = fixture();
        let readings = context.observation.readings(&data);
        let narrow = narrow_basal_space(0.01);
        let failing = Target::new(&data, &narrow, &context, &readings);
        let config = Config {
            iterations: 500,
            burn_in: 10,
            max_divergent: 1,
            max_retries: 2,
            ..Config::default()
        };
        let failed = run_chain(&failing, &config, 0, &Budget::unlimited());
        assert_eq!(
            failed.outcome,
            ChainOutcome::Failed(ChainFailure::RetriesExhausted { restarts: 2 })
        );
        assert!(failed.restarts > config.max_retries);

        let target = Target::new(&data, &space, &context, &readings);
        let completed = run_chain(
            &target,
            &Config {
                iterations: 100,
                burn_in: 50,
                ..Config::default()
            },
            1,
            &Budget::unlimited(),
        );
        assert_eq!(completed.outcome, ChainOutcome::Completed);

        let summary = PosteriorSummary::new(&space, vec![failed, completed], &Convergence::default());
        assert_eq!(summary.ndraws(), 100);
        assert_eq!(summary.draws().nrows(), 100);
        assert_eq!(summary.status(), Status::NotConverged);
        assert_eq!(summary.chains().len(), 2);
    }

    #[test]
    fn test_restarts_discard_the_following_burn_in() {
        let (data, _, context) = fixture();
        let readings = context.observation.readings(&data);
        let narrow = narrow_basal_space(0.1);
        let target = Target::new(&data, &narrow, &context, &readings);
        let config = Config {
            iterations: 300,
            burn_in: 20,
            max_divergent: 1,
            max_retries: 100_000,
            ..Config::default()
        };
        let chain = run_chain(&target, &config, 0, &Budget::unlimited());
        assert_eq!(chain.outcome, ChainOutcome::Completed);
        assert!(chain.restarts > 0);
        assert!(
            chain.ndraws() + config.burn_in <= config.iterations,
            "{} draws retained after {} restarts",
            chain.ndraws(),
            chain.restarts
        );
        for row in chain.draws.rows() {
            assert!(narrow.log_prior_slice(row.as_slice().unwrap()).is_finite());
        }

        // Without divergences every post burn-in iteration is retained
        let relaxed = Config {
            max_divergent: 100_000,
            ..config.clone()
        };
        let kept = run_chain(&target, &relaxed, 0, &Budget::unlimited());
        assert_eq!(kept.restarts, 0);
        assert_eq!(kept.ndraws(), config.iterations);
    }
}
