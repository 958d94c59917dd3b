//! Discrete convolution and the convolve-and-subtract step of difference
//! imaging.
//!
//! Pixel `(col c, row r)` of `K ⊛ I` is
//! `Σ_{u,v} K(u, v) · I(c + u - ctr_x, r + v - ctr_y)` with the kernel
//! center at `(w/2, h/2)`.  Output images keep the input shape; pixels whose
//! stencil leaves the image are zeroed and flagged in the `"EDGE"` mask
//! plane, and all downstream fitting consumes interior pixels only.

use ndarray::{Array2, ArrayView2};

use crate::error::Error;
use crate::image::MaskedImage;
use crate::kernel::SpatialKernel;
use crate::spatial_fn::SpatialFunction;

/// Name of the mask plane flagging convolution boundary pixels.
pub const EDGE_PLANE: &str = "EDGE";

/// Differential background added to the convolved template: either a scalar
/// or a spatial function evaluated per pixel.
#[derive(Debug, Clone, Copy)]
pub enum Background<'a> {
    /// Constant background level.
    Scalar(f64),
    /// Spatially varying background.
    Spatial(&'a SpatialFunction),
}

/// Rows and columns of `image` on which a `kernel`-sized stencil stays
/// inside the image: `(row_start, row_end, col_start, col_end)`, ends
/// exclusive.
pub fn interior_bounds(
    image_shape: (usize, usize),
    kernel_shape: (usize, usize),
) -> Result<(usize, usize, usize, usize), Error> {
    let (rows, cols) = image_shape;
    let (k_rows, k_cols) = kernel_shape;
    if k_rows == 0 || k_cols == 0 {
        return Err(Error::Domain("kernel has zero extent".into()));
    }
    if rows < k_rows || cols < k_cols {
        return Err(Error::Domain(format!(
            "image {rows}x{cols} smaller than kernel {k_rows}x{k_cols}"
        )));
    }
    let ctr_y = k_rows / 2;
    let ctr_x = k_cols / 2;
    Ok((
        ctr_y,
        rows - k_rows + ctr_y + 1,
        ctr_x,
        cols - k_cols + ctr_x + 1,
    ))
}

/// Convolve a single plane with a kernel image.  Boundary pixels are left
/// at zero.
pub fn convolve_image(image: ArrayView2<f64>, kernel: ArrayView2<f64>) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let (k_rows, k_cols) = kernel.dim();
    let mut out = Array2::zeros((rows, cols));
    let Ok((r0, r1, c0, c1)) = interior_bounds((rows, cols), (k_rows, k_cols)) else {
        return out;
    };
    let ctr_y = k_rows / 2;
    let ctr_x = k_cols / 2;

    for r in r0..r1 {
        for c in c0..c1 {
            let mut sum = 0.0;
            for kr in 0..k_rows {
                for kc in 0..k_cols {
                    sum += kernel[[kr, kc]] * image[[r + kr - ctr_y, c + kc - ctr_x]];
                }
            }
            out[[r, c]] = sum;
        }
    }
    out
}

/// Convolve a masked image: the intensity plane with `K`, the variance
/// plane with `K²`, the mask plane OR-ed over the stencil.  Boundary pixels
/// get the `"EDGE"` bit.
pub fn convolve_masked(mi: &MaskedImage, kernel: ArrayView2<f64>) -> Result<MaskedImage, Error> {
    let (rows, cols) = (mi.height(), mi.width());
    let (k_rows, k_cols) = kernel.dim();
    let (r0, r1, c0, c1) = interior_bounds((rows, cols), (k_rows, k_cols))?;
    let ctr_y = k_rows / 2;
    let ctr_x = k_cols / 2;

    let mut out = mi.clone();
    let edge = out.add_mask_plane(EDGE_PLANE)?;
    out.image_mut().fill(0.0);
    out.variance_mut().fill(0.0);
    out.mask_mut().fill(edge);

    for r in r0..r1 {
        for c in c0..c1 {
            let mut sum = 0.0;
            let mut var = 0.0;
            let mut bits = 0u16;
            for kr in 0..k_rows {
                for kc in 0..k_cols {
                    let k = kernel[[kr, kc]];
                    let (ir, ic) = (r + kr - ctr_y, c + kc - ctr_x);
                    sum += k * mi.image()[[ir, ic]];
                    var += k * k * mi.variance()[[ir, ic]];
                    bits |= mi.mask()[[ir, ic]];
                }
            }
            out.image_mut()[[r, c]] = sum;
            out.variance_mut()[[r, c]] = var;
            out.mask_mut()[[r, c]] = bits;
        }
    }
    Ok(out)
}

fn add_background(conv: &mut MaskedImage, background: Background<'_>) {
    match background {
        Background::Scalar(value) => conv.add_scalar(value),
        Background::Spatial(function) => {
            let (rows, cols) = (conv.height(), conv.width());
            for r in 0..rows {
                for c in 0..cols {
                    let (x, y) = conv.position(c, r);
                    conv.image_mut()[[r, c]] += function.eval(x, y);
                }
            }
        }
    }
}

/// The fundamental difference-imaging step: `D = S - (K ⊛ T + b)` when
/// `invert` is true, `(K ⊛ T + b) - S` otherwise.
pub fn convolve_and_subtract(
    template: &MaskedImage,
    science: &MaskedImage,
    kernel: ArrayView2<f64>,
    background: Background<'_>,
    invert: bool,
) -> Result<MaskedImage, Error> {
    let mut conv = convolve_masked(template, kernel)?;
    add_background(&mut conv, background);
    conv.subtract(science)?;
    if invert {
        conv.scale(-1.0);
    }
    Ok(conv)
}

/// Convolve a masked image with a spatially varying kernel.
///
/// Each basis kernel is convolved once; per pixel the basis planes are
/// combined with the spatial coefficients evaluated there (squared for the
/// variance plane).
pub fn convolve_spatial(mi: &MaskedImage, kernel: &SpatialKernel) -> Result<MaskedImage, Error> {
    let planes: Vec<MaskedImage> = kernel
        .basis()
        .iter()
        .map(|k| convolve_masked(mi, k.view()))
        .collect::<Result<_, _>>()?;

    let mut out = planes[0].clone();
    let (rows, cols) = (out.height(), out.width());
    for r in 0..rows {
        for c in 0..cols {
            let (x, y) = out.position(c, r);
            let mut sum = 0.0;
            let mut var = 0.0;
            for (function, plane) in kernel.functions().iter().zip(&planes) {
                let f = function.eval(x, y);
                sum += f * plane.image()[[r, c]];
                var += f * f * plane.variance()[[r, c]];
            }
            out.image_mut()[[r, c]] = sum;
            out.variance_mut()[[r, c]] = var;
        }
    }
    Ok(out)
}

/// [`convolve_and_subtract`] with a spatially varying kernel and background.
pub fn convolve_and_subtract_spatial(
    template: &MaskedImage,
    science: &MaskedImage,
    kernel: &SpatialKernel,
    background: &SpatialFunction,
    invert: bool,
) -> Result<MaskedImage, Error> {
    let mut conv = convolve_spatial(template, kernel)?;
    add_background(&mut conv, Background::Spatial(background));
    conv.subtract(science)?;
    if invert {
        conv.scale(-1.0);
    }
    Ok(conv)
}
