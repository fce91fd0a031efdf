//! Centered rolling windows and the Hampel despike filter over gappy series.

use crate::stats::{mad, median};

fn window_bounds(index: usize, len: usize, window: usize) -> (usize, usize) {
    let half = window / 2;
    let start = index.saturating_sub(half);
    let end = (start + window).min(len);
    let start = end.saturating_sub(window);
    (start, end)
}

/// Centered rolling mean over present values; a position with at least one
/// present neighbor in its window yields a value (min_periods = 1).
pub fn rolling_mean(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    if window <= 1 {
        return values.to_vec();
    }
    let len = values.len();
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let (start, end) = window_bounds(i, len, window);
        let mut sum = 0.0;
        let mut count = 0usize;
        for v in values[start..end].iter().flatten() {
            sum += v;
            count += 1;
        }
        out.push((count > 0).then(|| sum / count as f64));
    }
    out
}

/// Centered rolling median over present values.
pub fn rolling_median(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    if window <= 1 {
        return values.to_vec();
    }
    let len = values.len();
    let mut out = Vec::with_capacity(len);
    let mut scratch = Vec::with_capacity(window);
    for i in 0..len {
        let (start, end) = window_bounds(i, len, window);
        scratch.clear();
        scratch.extend(values[start..end].iter().flatten());
        out.push(median(&scratch));
    }
    out
}

/// Subtract the centered rolling median, a cheap high-pass that removes
/// slow baseline drift while leaving short-period structure.
pub fn highpass_rolling_median(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let baseline = rolling_median(values, window);
    values
        .iter()
        .zip(baseline)
        .map(|(v, base)| match (v, base) {
            (Some(value), Some(b)) => Some(value - b),
            (v, _) => *v,
        })
        .collect()
}

/// Hampel filter: replace points further than `n_sigmas` robust deviations
/// from the local rolling median with that median.
///
/// Returns the indices that were replaced so the caller can flag them.
pub fn hampel(values: &mut [Option<f64>], window: usize, n_sigmas: f64) -> Vec<usize> {
    if window <= 1 {
        return Vec::new();
    }
    let len = values.len();
    let snapshot: Vec<Option<f64>> = values.to_vec();
    let mut replaced = Vec::new();
    let mut scratch = Vec::with_capacity(window);
    for i in 0..len {
        let Some(value) = snapshot[i] else { continue };
        let (start, end) = window_bounds(i, len, window);
        scratch.clear();
        scratch.extend(snapshot[start..end].iter().flatten());
        let Some(center) = median(&scratch) else { continue };
        let Some(deviation) = mad(&scratch) else { continue };
        let sigma = 1.4826 * deviation;
        if sigma > 0.0 && (value - center).abs() > n_sigmas * sigma {
            values[i] = Some(center);
            replaced.push(i);
        }
    }
    replaced
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().map(|v| Some(*v)).collect()
    }

    #[test]
    fn rolling_mean_smooths_and_respects_gaps() {
        let values = vec![Some(1.0), None, Some(3.0)];
        let out = rolling_mean(&values, 3);
        assert_eq!(out[0], Some(2.0));
        assert_eq!(out[1], Some(2.0));
        assert_eq!(out[2], Some(2.0));

        let empty: Vec<Option<f64>> = vec![None, None];
        assert_eq!(rolling_mean(&empty, 3), vec![None, None]);
    }

    #[test]
    fn window_of_one_is_identity() {
        let values = present(&[1.0, 2.0, 3.0]);
        assert_eq!(rolling_mean(&values, 1), values);
        assert_eq!(rolling_median(&values, 1), values);
    }

    #[test]
    fn rolling_median_ignores_a_spike() {
        let values = present(&[1.0, 1.0, 100.0, 1.0, 1.0]);
        let out = rolling_median(&values, 3);
        assert_eq!(out[2], Some(1.0));
    }

    #[test]
    fn highpass_removes_constant_baseline() {
        let values = present(&[10.0, 10.0, 10.0, 10.0, 10.0]);
        let out = highpass_rolling_median(&values, 3);
        for v in out {
            assert_eq!(v, Some(0.0));
        }
    }

    #[test]
    fn hampel_replaces_the_spike_only() {
        let mut values = present(&[1.0, 1.0, 1.1, 50.0, 0.9, 1.0, 1.0]);
        let replaced = hampel(&mut values, 5, 3.0);
        assert_eq!(replaced, vec![3]);
        assert!(values[3].unwrap() < 2.0);
        assert_eq!(values[0], Some(1.0));
    }

    #[test]
    fn hampel_keeps_constant_series_untouched() {
        let mut values = present(&[2.0; 9]);
        let replaced = hampel(&mut values, 5, 3.0);
        assert!(replaced.is_empty());
    }
}
