//! Numerically stable helpers shared by the likelihood, the diagnostics and the reports

/// ln(sqrt(2 pi))
pub const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// Log-sum-exp of a slice, shifted by its maximum
///
/// Returns `-inf` for an empty slice or when every value is `-inf`.
#[inline]
pub fn logsumexp(values: &[f64]) -> f64 {
    let max_val = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max_val == f64::INFINITY {
        return f64::INFINITY;
    }
    max_val
        + values
            .iter()
            .map(|&x| (x - max_val).exp())
            .sum::<f64>()
            .ln()
}

/// Log density of a normal distribution
#[inline]
pub fn normal_log_density(x: f64, mean: f64, sd: f64) -> f64 {
    let z = (x - mean) / sd;
    -LN_SQRT_2PI - sd.ln() - 0.5 * z * z
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Mean and unbiased variance
pub fn mean_and_var(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    let m = mean(values);
    if n < 2 {
        return (m, 0.0);
    }
    let var = values.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (n - 1) as f64;
    (m, var)
}

/// Linearly interpolated quantile of an ascending slice
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let position = p.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = position.floor() as usize;
            let hi = position.ceil() as usize;
            let frac = position - lo as f64;
            sorted[lo] * (1.0 - frac) + sorted[hi] * frac
        }
    }
}

/// Sort a copy of `values`, NaNs last
pub fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}
