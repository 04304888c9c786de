//! Small descriptive statistics over `f64` samples.
//!
//! Empty inputs yield `None` rather than `NaN` so callers decide what an
//! absent statistic means.

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let mean = mean(values)?;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
        / values.len() as f64;

    Some(variance.sqrt())
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mid = sorted.len() / 2;

    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Linear-interpolated percentile, `percentile` in `[0, 1]`.
pub fn percentile(values: &[f64], percentile: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let pos = (sorted.len() - 1) as f64 * percentile.clamp(0.0, 1.0);
    let base = pos.floor() as usize;
    let rest = pos - base as f64;

    if base + 1 < sorted.len() {
        return Some(sorted[base] + rest * (sorted[base + 1] - sorted[base]));
    }

    Some(sorted[base])
}

/// Mean absolute difference between consecutive samples.
pub fn jitter(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }

    let diffs: Vec<f64> =
        values.windows(2).map(|pair| (pair[1] - pair[0]).abs()).collect();

    mean(&diffs)
}
