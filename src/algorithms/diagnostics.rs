//! Convergence diagnostics: split R-hat and bulk effective sample size

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::routines::math::mean_and_var;

/// Per-parameter diagnostics over a set of chains
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    /// Split R-hat per parameter, NaN when the chains are too short
    pub r_hat: Vec<f64>,
    /// Bulk effective sample size per parameter
    pub ess: Vec<f64>,
    /// Post burn-in acceptance rate per chain
    pub acceptance: Vec<f64>,
}

impl Diagnostics {
    /// Diagnostics from draws (rows) by parameters (columns), one array per chain
    pub fn compute(chains: &[&Array2<f64>], acceptance: Vec<f64>) -> Self {
        let nparameters = chains.first().map(|c| c.ncols()).unwrap_or(0);
        let mut r_hat = Vec::with_capacity(nparameters);
        let mut ess = Vec::with_capacity(nparameters);
        for j in 0..nparameters {
            let columns: Vec<Vec<f64>> = chains.iter().map(|c| c.column(j).to_vec()).collect();
            let slices: Vec<&[f64]> = columns.iter().map(|c| c.as_slice()).collect();
            r_hat.push(split_r_hat(&slices));
            ess.push(ess_bulk(&slices));
        }
        Diagnostics {
            r_hat,
            ess,
            acceptance,
        }
    }

    pub fn max_r_hat(&self) -> f64 {
        self.r_hat.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn min_ess(&self) -> f64 {
        self.ess.iter().cloned().fold(f64::INFINITY, f64::min)
    }
}

/// Thresholds a run must meet to be reported as converged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Convergence {
    /// Maximum split R-hat over all parameters
    pub r_hat: f64,
    /// Minimum bulk effective sample size over all parameters
    pub min_ess: f64,
}

impl Default for Convergence {
    fn default() -> Self {
        Convergence {
            r_hat: 1.1,
            min_ess: 100.0,
        }
    }
}

impl Convergence {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.r_hat.is_finite() && self.r_hat >= 1.0) {
            anyhow::bail!("The R-hat threshold must be at least 1, got {}", self.r_hat);
        }
        if !(self.min_ess.is_finite() && self.min_ess >= 0.0) {
            anyhow::bail!("The minimum ESS must be non-negative, got {}", self.min_ess);
        }
        Ok(())
    }

    /// Every R-hat finite and below the threshold, every ESS above the minimum
    pub fn check(&self, diagnostics: &Diagnostics) -> bool {
        !diagnostics.r_hat.is_empty()
            && diagnostics
                .r_hat
                .iter()
                .all(|r| r.is_finite() && *r <= self.r_hat)
            && diagnostics.ess.iter().all(|e| *e >= self.min_ess)
    }
}

/// Split every chain in half and trim the halves to a common length
fn split_chains<'a>(chains: &[&'a [f64]], min_len: usize) -> Option<Vec<&'a [f64]>> {
    if chains.is_empty() {
        return None;
    }
    let mut halves: Vec<&[f64]> = Vec::with_capacity(chains.len() * 2);
    for chain in chains {
        if chain.len() < 4 {
            return None;
        }
        let mid = chain.len() / 2;
        halves.push(&chain[..mid]);
        halves.push(&chain[mid..]);
    }
    let shortest = halves.iter().map(|c| c.len()).min().unwrap_or(0);
    if shortest < min_len {
        return None;
    }
    Some(halves.into_iter().map(|c| &c[..shortest]).collect())
}

/// Between-chain (B) and within-chain (W) variances of equally long chains
fn variances(chains: &[&[f64]]) -> (f64, f64) {
    let m = chains.len() as f64;
    let n = chains[0].len() as f64;
    let (means, vars): (Vec<f64>, Vec<f64>) = chains.iter().map(|c| mean_and_var(c)).unzip();
    let grand_mean = means.iter().sum::<f64>() / m;
    let b = means.iter().map(|mu| (mu - grand_mean).powi(2)).sum::<f64>() * n / (m - 1.0);
    let w = vars.iter().sum::<f64>() / m;
    (b, w)
}

/// Split R-hat (Gelman et al.)
///
/// Returns NaN for chains shorter than four draws, or when every chain is constant.
pub fn split_r_hat(chains: &[&[f64]]) -> f64 {
    let Some(halves) = split_chains(chains, 2) else {
        return f64::NAN;
    };
    let (b, w) = variances(&halves);
    if w < 1e-30 {
        return f64::NAN;
    }
    let n = halves[0].len() as f64;
    let var_hat_plus = (n - 1.0) / n * w + b / n;
    (var_hat_plus / w).sqrt()
}

/// Replace every draw by the normal quantile of its pooled rank
///
/// Ties share their average rank, and ranks map to quantiles through `(r - 3/8) / (S + 1/4)`.
fn rank_normalize(chains: &[&[f64]]) -> Vec<Vec<f64>> {
    let mut out: Vec<Vec<f64>> = chains.iter().map(|c| c.to_vec()).collect();
    let Ok(normal) = Normal::new(0.0, 1.0) else {
        return out;
    };
    let mut flat: Vec<(f64, usize, usize)> = chains
        .iter()
        .enumerate()
        .flat_map(|(c, chain)| chain.iter().enumerate().map(move |(t, &x)| (x, c, t)))
        .collect();
    flat.sort_by(|a, b| a.0.total_cmp(&b.0));

    let total = flat.len() as f64;
    let mut i = 0;
    while i < flat.len() {
        let mut j = i + 1;
        while j < flat.len() && flat[j].0 == flat[i].0 {
            j += 1;
        }
        let rank = 0.5 * ((i + 1) as f64 + j as f64);
        let z = normal.inverse_cdf((rank - 0.375) / (total + 0.25));
        for &(_, c, t) in &flat[i..j] {
            out[c][t] = z;
        }
        i = j;
    }
    out
}

/// Bulk effective sample size
///
/// The effective sample size of the rank-normalized draws, see [ess].
pub fn ess_bulk(chains: &[&[f64]]) -> f64 {
    let normalized = rank_normalize(chains);
    let slices: Vec<&[f64]> = normalized.iter().map(|c| c.as_slice()).collect();
    ess(&slices)
}

/// Effective sample size of the draws as given
///
/// Autocorrelations come from the multi-chain variogram. They are summed in pairs and truncated with
/// Geyer's initial monotone sequence.
pub fn ess(chains: &[&[f64]]) -> f64 {
    let Some(halves) = split_chains(chains, 4) else {
        return 0.0;
    };
    let m = halves.len();
    let n = halves[0].len();
    let total = (m * n) as f64;

    let (b, w) = variances(&halves);
    let var_hat_plus = (n as f64 - 1.0) / n as f64 * w + b / n as f64;
    if !var_hat_plus.is_finite() || var_hat_plus < 1e-30 {
        return total;
    }

    let mut rho: Vec<f64> = Vec::with_capacity(n);
    for lag in 1..n {
        let mut sum = 0.0;
        let mut count = 0usize;
        for chain in &halves {
            for i in 0..(n - lag) {
                let d = chain[i] - chain[i + lag];
                sum += d * d;
                count += 1;
            }
        }
        let variogram = sum / count as f64;
        rho.push((1.0 - variogram / (2.0 * var_hat_plus)).clamp(-1.0, 1.0));

        let k = rho.len();
        if k % 2 == 0 && rho[k - 2] + rho[k - 1] < 0.0 {
            break;
        }
    }

    let mut gammas: Vec<f64> = Vec::new();
    for pair in rho.chunks_exact(2) {
        let g = pair[0] + pair[1];
        if g < 0.0 {
            break;
        }
        gammas.push(g);
    }
    for k in 1..gammas.len() {
        if gammas[k] > gammas[k - 1] {
            gammas[k] = gammas[k - 1];
        }
    }

    let tau = 1.0 + 2.0 * gammas.iter().sum::<f64>();
    if !tau.is_finite() || tau <= 0.0 {
        return total;
    }
    (total / tau).clamp(1.0, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn iid(seed: u64, n: usize, mean: f64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(mean, 1.0).unwrap();
        (0..n).map(|_| normal.sample(&mut rng)).collect()
    }

    #[test]
    fn test_mixed_chains_have_r_hat_near_one() {
        let a = iid(1, 1000, 0.0);
        let b = iid(2, 1000, 0.0);
        let r = split_r_hat(&[a.as_slice(), b.as_slice()]);
        assert!((r - 1.0).abs() < 0.02, "r_hat = {}", r);
        let ess = ess_bulk(&[a.as_slice(), b.as_slice()]);
        assert!(ess > 800.0, "ess = {}", ess);
    }

    #[test]
    fn test_separated_chains_have_large_r_hat() {
        let a = iid(1, 500, 0.0);
        let b = iid(2, 500, 5.0);
        assert!(split_r_hat(&[a.as_slice(), b.as_slice()]) > 2.0);
    }

    #[test]
    fn test_autocorrelated_chain_has_small_ess() {
        let noise = iid(3, 2000, 0.0);
        let mut chain = vec![0.0; noise.len()];
        for i in 1..chain.len() {
            chain[i] = 0.95 * chain[i - 1] + noise[i];
        }
        let ess = ess_bulk(&[chain.as_slice()]);
        assert!(ess < 200.0, "ess = {}", ess);
    }

    #[test]
    fn test_bulk_ess_ignores_monotone_transforms() {
        let a = iid(4, 500, 0.0);
        let b = iid(5, 500, 0.0);
        let exp_a: Vec<f64> = a.iter().map(|x| (3.0 * x).exp()).collect();
        let exp_b: Vec<f64> = b.iter().map(|x| (3.0 * x).exp()).collect();
        let raw = ess_bulk(&[a.as_slice(), b.as_slice()]);
        let skewed = ess_bulk(&[exp_a.as_slice(), exp_b.as_slice()]);
        assert!((raw - skewed).abs() < 1e-9, "{} vs {}", raw, skewed);
        assert!(skewed > 800.0);
    }

    #[test]
    fn test_rank_normalize() {
        let a = [3.0, 1.0, 2.0];
        let b = [2.0, 5.0];
        let z = rank_normalize(&[a.as_slice(), b.as_slice()]);
        // Pooled ranks: 1.0 -> 1, 2.0 -> 2.5 (tied), 3.0 -> 4, 5.0 -> 5
        assert!(z[0][1] < z[0][2] && z[0][2] < z[0][0] && z[0][0] < z[1][1]);
        assert_eq!(z[0][2], z[1][0]);
        // Ranks 1 and 5 of 5 are symmetric around the median
        assert!((z[0][1] + z[1][1]).abs() < 1e-9);

        let constant = [7.0; 6];
        let flat = rank_normalize(&[constant.as_slice()]);
        assert!(flat[0].iter().all(|z| z.abs() < 1e-12));
    }

    #[test]
    fn test_short_chains() {
        let short = [1.0, 2.0, 3.0];
        assert!(split_r_hat(&[short.as_slice()]).is_nan());
        assert_eq!(ess_bulk(&[short.as_slice()]), 0.0);
        assert_eq!(ess(&[short.as_slice()]), 0.0);
    }

    #[test]
    fn test_convergence_check() {
        let convergence = Convergence::default();
        let good = Diagnostics {
            r_hat: vec![1.01, 1.02],
            ess: vec![400.0, 250.0],
            acceptance: vec![0.3],
        };
        assert!(convergence.check(&good));
        let bad = Diagnostics {
            r_hat: vec![1.01, f64::NAN],
            ..good.clone()
        };
        assert!(!convergence.check(&bad));
        let few = Diagnostics {
            ess: vec![400.0, 20.0],
            ..good
        };
        assert!(!convergence.check(&few));
    }
}
