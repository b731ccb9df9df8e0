//! Small numeric helpers shared by the feature builders.

const MIN_VARIANCE: f64 = 1e-12;

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let mean = mean(values)?;
    let variance = values
        .iter()
        .map(|value| {
            let diff = value - mean;
            diff * diff
        })
        .sum::<f64>()
        / values.len() as f64;
    Some(variance.sqrt())
}

/// Least-squares slope of `ys` against their index positions `0..n`.
///
/// Returns `None` when fewer than `min_points` samples exist or when the fit is
/// degenerate, so callers decide the fallback.
pub fn linear_slope(ys: &[f64], min_points: usize) -> Option<f64> {
    let n = ys.len();
    if n < min_points.max(2) {
        return None;
    }
    let n_f = n as f64;
    let x_mean = (n_f - 1.0) / 2.0;
    let y_mean = mean(ys)?;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (idx, y) in ys.iter().enumerate() {
        let dx = idx as f64 - x_mean;
        sxy += dx * (y - y_mean);
        sxx += dx * dx;
    }
    if sxx < MIN_VARIANCE {
        return None;
    }
    let slope = sxy / sxx;
    slope.is_finite().then_some(slope)
}

/// `numerator / (denominator + 1)`, the smoothed ratio used by several features.
pub fn smoothed_ratio(numerator: f64, denominator: f64) -> f64 {
    numerator / (denominator + 1.0)
}
