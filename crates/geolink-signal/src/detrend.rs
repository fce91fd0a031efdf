//! Linear and constant detrending over series with gaps.

/// Subtract a least-squares line fitted through the present values.
///
/// Missing positions are untouched; the fit uses the sample index as the
/// abscissa, which is exact for regularly sampled groups and a close
/// approximation elsewhere.
pub fn detrend_linear(values: &mut [Option<f64>]) {
    let points: Vec<(f64, f64)> = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|value| (i as f64, value)))
        .collect();
    if points.len() < 2 {
        return;
    }
    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;
    for (i, slot) in values.iter_mut().enumerate() {
        if let Some(v) = slot {
            *v -= slope * i as f64 + intercept;
        }
    }
}

/// Subtract the mean of the present values.
pub fn detrend_constant(values: &mut [Option<f64>]) {
    let present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    if present.is_empty() {
        return;
    }
    let mean = present.iter().sum::<f64>() / present.len() as f64;
    for slot in values.iter_mut() {
        if let Some(v) = slot {
            *v -= mean;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_detrend_removes_a_ramp() {
        let mut values: Vec<Option<f64>> = (0..10).map(|i| Some(2.0 * i as f64 + 3.0)).collect();
        detrend_linear(&mut values);
        for v in values {
            assert!(v.unwrap().abs() < 1e-9);
        }
    }

    #[test]
    fn linear_detrend_skips_missing() {
        let mut values = vec![Some(3.0), None, Some(7.0), Some(9.0), None];
        detrend_linear(&mut values);
        assert!(values[1].is_none());
        assert!(values[4].is_none());
    }

    #[test]
    fn constant_detrend_centers_values() {
        let mut values = vec![Some(1.0), Some(2.0), Some(3.0)];
        detrend_constant(&mut values);
        let sum: f64 = values.iter().filter_map(|v| *v).sum();
        assert!(sum.abs() < 1e-12);
    }
}
