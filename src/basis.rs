//! Kernel basis generators: delta-function and Alard-Lupton sets.

use ndarray::Array2;

use crate::error::Error;
use crate::kernel::KernelBasis;

/// Kernel sums smaller than this are treated as zero during
/// renormalization (odd polynomial modulations integrate to zero up to
/// rounding).
const ZERO_SUM_EPS: f64 = 1e-8;

/// Generate the delta-function basis: `width · height` kernels, the k-th
/// being 1 at the k-th pixel in row-major order.
pub fn delta_function_basis(width: usize, height: usize) -> Result<KernelBasis, Error> {
    if width < 1 || height < 1 {
        return Err(Error::Domain(format!(
            "delta-function basis dimensions must be positive, got {width}x{height}"
        )));
    }
    let mut kernels = Vec::with_capacity(width * height);
    for row in 0..height {
        for col in 0..width {
            let mut k = Array2::zeros((height, width));
            k[[row, col]] = 1.0;
            kernels.push(k);
        }
    }
    KernelBasis::new(kernels)
}

/// Generate a renormalized Alard-Lupton basis.
///
/// For each Gaussian width `sig_gauss[i]`, one kernel per monomial
/// `x^j y^k` with `j + k <= deg_gauss[i]`, evaluated on a
/// `(2 half_width + 1)²` grid with `x, y` mapped to `[-1, 1]` over the
/// half-width.  The list is then renormalized so the first kernel sums to 1
/// and the rest sum to 0 with unit self inner product.
pub fn alard_lupton_basis(
    half_width: usize,
    sig_gauss: &[f64],
    deg_gauss: &[usize],
) -> Result<KernelBasis, Error> {
    if half_width < 1 {
        return Err(Error::Domain("halfWidth must be positive".into()));
    }
    if sig_gauss.len() != deg_gauss.len() {
        return Err(Error::Config(format!(
            "sigGauss has {} entries but degGauss has {}",
            sig_gauss.len(),
            deg_gauss.len()
        )));
    }
    if sig_gauss.is_empty() {
        return Err(Error::Config("no Gaussian components configured".into()));
    }
    if let Some(sig) = sig_gauss.iter().find(|&&s| !(s > 0.0)) {
        return Err(Error::Domain(format!("non-positive Gaussian width {sig}")));
    }

    let full_width = 2 * half_width + 1;
    let h = half_width as f64;

    let mut kernels = Vec::new();
    for (&sig, &deg) in sig_gauss.iter().zip(deg_gauss) {
        // Base Gaussian, normalized to unit sum before modulation.
        let mut gauss = Array2::from_shape_fn((full_width, full_width), |(r, c)| {
            let u = c as f64 - h;
            let v = r as f64 - h;
            (-(u * u + v * v) / (2.0 * sig * sig)).exp()
        });
        let total = gauss.sum();
        gauss /= total;

        for d in 0..=deg {
            for j in 0..=d {
                if d == 0 {
                    kernels.push(gauss.clone());
                    continue;
                }
                // Modulate by x^(d-j) y^j evaluated from -1 to 1.
                let image = Array2::from_shape_fn((full_width, full_width), |(r, c)| {
                    let x = (c as f64 - h) / h;
                    let y = (r as f64 - h) / h;
                    gauss[[r, c]] * x.powi((d - j) as i32) * y.powi(j as i32)
                });
                kernels.push(image);
            }
        }
    }
    renormalize_basis(kernels)
}

/// Renormalize a kernel list for kernel-sum conservation: the first kernel
/// to unit sum; every other kernel to unit sum, minus the first, rescaled
/// to unit self inner product.
///
/// All the flux ends up in the first kernel, so a spatial fit that holds
/// its coefficient constant conserves the kernel sum across the image.
pub fn renormalize_basis(mut kernels: Vec<Array2<f64>>) -> Result<KernelBasis, Error> {
    {
        let first = kernels
            .first_mut()
            .ok_or_else(|| Error::Domain("empty kernel list".into()))?;
        let sum = first.sum();
        if sum.abs() <= ZERO_SUM_EPS {
            return Err(Error::Domain("first kernel has zero sum".into()));
        }
        *first /= sum;
    }
    let first = kernels[0].clone();

    for kernel in kernels.iter_mut().skip(1) {
        let sum = kernel.sum();
        if sum.abs() > ZERO_SUM_EPS {
            *kernel /= sum;
            *kernel -= &first;
        }
        let norm_sq: f64 = kernel.iter().map(|v| v * v).sum();
        if norm_sq <= 0.0 {
            return Err(Error::Domain(
                "kernel collapses to zero during renormalization".into(),
            ));
        }
        *kernel /= norm_sq.sqrt();
    }
    KernelBasis::new(kernels)
}
