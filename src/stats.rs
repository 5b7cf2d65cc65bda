//! Streaming moments and correlation helpers

/// Welford accumulator for mean and unbiased variance.
///
/// A constant stream leaves `m2` at exactly zero, so the standard error of a
/// constant group is exactly zero rather than a rounding residue.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OnlineStats {
    count: usize,
    mean: f64,
    m2: f64,
}

impl OnlineStats {
    /// Create an empty accumulator
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    /// Add one observation
    pub fn update(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        #[allow(clippy::cast_precision_loss)]
        let n = self.count as f64;
        self.mean += delta / n;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    /// Number of observations seen
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Running mean (0 when empty)
    #[must_use]
    pub const fn mean(&self) -> f64 {
        self.mean
    }

    /// Unbiased sample variance, `None` below two observations
    #[must_use]
    pub fn variance(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let denom = (self.count - 1) as f64;
        Some(self.m2 / denom)
    }

    /// Standard error of the mean: sample SD / sqrt(n)
    #[must_use]
    pub fn standard_error(&self) -> Option<f64> {
        #[allow(clippy::cast_precision_loss)]
        self.variance()
            .map(|var| (var / self.count as f64).sqrt())
    }
}

/// Pearson correlation of two equally long slices.
///
/// Returns `None` for mismatched lengths, fewer than two points, or a
/// zero-variance input.
#[must_use]
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = xs.len() as f64;
    let mx = xs.iter().sum::<f64>() / n;
    let my = ys.iter().sum::<f64>() / n;

    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (&x, &y) in xs.iter().zip(ys) {
        let dx = x - mx;
        let dy = y - my;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 || syy == 0.0 {
        return None;
    }
    Some(sxy / (sxx * syy).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_stats_matches_closed_form() {
        let mut stats = OnlineStats::new();
        for x in [1.0, 2.0, 3.0, 4.0, 5.0] {
            stats.update(x);
        }
        assert_eq!(stats.count(), 5);
        assert!((stats.mean() - 3.0).abs() < 1e-12);
        assert!((stats.variance().unwrap() - 2.5).abs() < 1e-12);
        assert!((stats.standard_error().unwrap() - (0.5f64).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_constant_stream_has_zero_variance() {
        let mut stats = OnlineStats::new();
        for _ in 0..100 {
            stats.update(3.7);
        }
        assert_eq!(stats.variance(), Some(0.0));
        assert_eq!(stats.standard_error(), Some(0.0));
    }

    #[test]
    fn test_variance_undefined_below_two() {
        let mut stats = OnlineStats::new();
        assert!(stats.variance().is_none());
        stats.update(1.0);
        assert!(stats.standard_error().is_none());
    }

    #[test]
    fn test_pearson_perfect_and_degenerate() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        let ys = [2.0, 4.0, 6.0, 8.0];
        assert!((pearson(&xs, &ys).unwrap() - 1.0).abs() < 1e-12);
        let neg: Vec<f64> = ys.iter().map(|y| -y).collect();
        assert!((pearson(&xs, &neg).unwrap() + 1.0).abs() < 1e-12);
        assert!(pearson(&xs, &[1.0, 1.0, 1.0, 1.0]).is_none());
        assert!(pearson(&xs, &ys[..3]).is_none());
    }
}
