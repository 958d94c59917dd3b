//! Robust statistics over samples and difference images.

use ndarray::ArrayView2;

use crate::image::MaskedImage;

/// Iteratively sigma-clipped mean and standard deviation of a sample.
///
/// Values farther than `n_sigma` standard deviations from the running mean
/// are dropped and the moments recomputed, `n_iter` times or until no value
/// is clipped.  Non-finite values are ignored from the start.  Returns
/// `(0.0, 0.0)` for an empty sample.
pub fn clipped_mean_std(values: &[f64], n_sigma: f64, n_iter: usize) -> (f64, f64) {
    let mut sample: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sample.is_empty() {
        return (0.0, 0.0);
    }

    let (mut mean, mut std) = mean_std(&sample);
    for _ in 0..n_iter {
        if std == 0.0 {
            break;
        }
        let kept: Vec<f64> = sample
            .iter()
            .copied()
            .filter(|v| (v - mean).abs() <= n_sigma * std)
            .collect();
        if kept.len() == sample.len() || kept.is_empty() {
            break;
        }
        sample = kept;
        let (m, s) = mean_std(&sample);
        mean = m;
        std = s;
    }
    (mean, std)
}

fn mean_std(sample: &[f64]) -> (f64, f64) {
    let n = sample.len() as f64;
    let mean = sample.iter().sum::<f64>() / n;
    if sample.len() < 2 {
        return (mean, 0.0);
    }
    let var = sample.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

/// Minimum and maximum of an array, ignoring non-finite entries.
pub fn min_max(values: ArrayView2<f64>) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &v in values.iter() {
        if !v.is_finite() {
            continue;
        }
        min = min.min(v);
        max = max.max(v);
    }
    (min, max)
}

/// Moments of the per-pixel residuals of a difference image.
///
/// Residuals are measured in sigma units, `value / sqrt(variance)`, over
/// pixels with no mask bit set and positive finite variance.  The variance
/// of the residual distribution doubles as the candidate chi-square.
#[derive(Debug, Clone, Copy)]
pub struct ResidualStats {
    /// Mean residual.
    pub mean: f64,
    /// Unbiased sample variance of the residuals.
    pub variance: f64,
    /// Root mean square residual.
    pub rms: f64,
    /// Number of pixels that entered the statistics.
    pub npoints: usize,
}

impl ResidualStats {
    /// Compute residual statistics of a difference image.
    pub fn from_diffim(diffim: &MaskedImage) -> Self {
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        let mut n = 0usize;

        for ((r, c), &value) in diffim.image().indexed_iter() {
            if diffim.mask()[[r, c]] != 0 {
                continue;
            }
            let var = diffim.variance()[[r, c]];
            if !(var.is_finite() && var > 0.0) || !value.is_finite() {
                continue;
            }
            let res = value / var.sqrt();
            sum += res;
            sum_sq += res * res;
            n += 1;
        }

        if n == 0 {
            return Self {
                mean: f64::NAN,
                variance: f64::NAN,
                rms: f64::NAN,
                npoints: 0,
            };
        }

        let nf = n as f64;
        let mean = sum / nf;
        let variance = if n > 1 {
            (sum_sq - sum * sum / nf) / (nf - 1.0)
        } else {
            0.0
        };
        Self {
            mean,
            variance,
            rms: (sum_sq / nf).sqrt(),
            npoints: n,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    use super::{clipped_mean_std, min_max, ResidualStats};
    use crate::image::MaskedImage;

    #[test]
    fn clipping_removes_outlier() {
        let mut values = vec![1.0; 20];
        values.extend([0.9, 1.1, 1.05, 0.95]);
        values.push(50.0);

        let (clipped_mean, clipped_std) = clipped_mean_std(&values, 3.0, 3);
        assert_abs_diff_eq!(clipped_mean, 1.0, epsilon = 0.02);
        assert!(clipped_std < 0.1);

        // Without clipping the outlier dominates.
        let (raw_mean, _) = clipped_mean_std(&values, f64::INFINITY, 0);
        assert!(raw_mean > 2.0);
    }

    #[test]
    fn clipping_handles_degenerate_samples() {
        assert_eq!(clipped_mean_std(&[], 3.0, 3), (0.0, 0.0));
        assert_eq!(clipped_mean_std(&[2.0], 3.0, 3), (2.0, 0.0));
        let (m, s) = clipped_mean_std(&[4.0, 4.0, 4.0], 3.0, 3);
        assert_eq!((m, s), (4.0, 0.0));
    }

    #[test]
    fn min_max_skips_nan() {
        let arr = array![[1.0, f64::NAN], [-3.0, 2.0]];
        assert_eq!(min_max(arr.view()), (-3.0, 2.0));
    }

    #[test]
    fn residuals_in_sigma_units() {
        // Residual value 2 with variance 4 => 1 sigma everywhere.
        let mi = MaskedImage::from_parts(
            Array2::from_elem((4, 4), 2.0),
            Array2::from_elem((4, 4), 4.0),
            Array2::zeros((4, 4)),
        )
        .unwrap();

        let stats = ResidualStats::from_diffim(&mi);
        assert_eq!(stats.npoints, 16);
        assert_abs_diff_eq!(stats.mean, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.rms, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.variance, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn residuals_skip_masked_pixels() {
        let mut mi = MaskedImage::from_parts(
            Array2::from_elem((2, 2), 1.0),
            Array2::from_elem((2, 2), 1.0),
            Array2::zeros((2, 2)),
        )
        .unwrap();
        mi.image_mut()[[0, 0]] = 1e6;
        mi.mask_mut()[[0, 0]] = 1;

        let stats = ResidualStats::from_diffim(&mi);
        assert_eq!(stats.npoints, 3);
        assert_abs_diff_eq!(stats.mean, 1.0, epsilon = 1e-12);
    }
}
