//! Kernel representations: ordered image bases, linear combinations, and
//! spatially varying linear combinations.
//!
//! Every kernel is carried as a rendered image; basis generation collapses
//! analytic forms to fixed images before any fitting happens, so nothing
//! downstream needs to re-evaluate them.

use ndarray::Array2;

use crate::error::Error;
use crate::spatial_fn::SpatialFunction;

/// An ordered set of kernel images, all of the same shape.
#[derive(Debug, Clone)]
pub struct KernelBasis {
    kernels: Vec<Array2<f64>>,
}

impl KernelBasis {
    /// Build a basis from kernel images.
    ///
    /// Fails with [`Error::Domain`] if the list is empty, any kernel has a
    /// zero dimension, or the shapes disagree.
    pub fn new(kernels: Vec<Array2<f64>>) -> Result<Self, Error> {
        let first = kernels
            .first()
            .ok_or_else(|| Error::Domain("empty kernel basis".into()))?;
        let shape = first.dim();
        if shape.0 < 1 || shape.1 < 1 {
            return Err(Error::Domain(format!(
                "kernel dimensions must be positive, got {shape:?}"
            )));
        }
        if let Some(other) = kernels.iter().find(|k| k.dim() != shape) {
            return Err(Error::Domain(format!(
                "kernel basis mixes shapes {:?} and {:?}",
                shape,
                other.dim()
            )));
        }
        Ok(Self { kernels })
    }

    /// Number of basis kernels.
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// Whether the basis holds no kernels (never true for a constructed
    /// basis).
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Kernel width (columns).
    pub fn width(&self) -> usize {
        self.kernels[0].ncols()
    }

    /// Kernel height (rows).
    pub fn height(&self) -> usize {
        self.kernels[0].nrows()
    }

    /// Kernel center `(ctr_x, ctr_y)`.
    pub fn ctr(&self) -> (usize, usize) {
        (self.width() / 2, self.height() / 2)
    }

    /// The `i`-th basis kernel.
    pub fn kernel(&self, i: usize) -> &Array2<f64> {
        &self.kernels[i]
    }

    /// Iterate over the basis kernels in order.
    pub fn iter(&self) -> impl Iterator<Item = &Array2<f64>> {
        self.kernels.iter()
    }
}

/// A kernel expressed as `Σ cᵢ Bᵢ` over a basis, rendered at construction.
#[derive(Debug, Clone)]
pub struct LinearCombinationKernel {
    coeffs: Vec<f64>,
    image: Array2<f64>,
    sum: f64,
}

impl LinearCombinationKernel {
    /// Combine a basis with coefficients.  The coefficient count must match
    /// the basis size.
    pub fn new(basis: &KernelBasis, coeffs: &[f64]) -> Result<Self, Error> {
        if coeffs.len() != basis.len() {
            return Err(Error::Domain(format!(
                "{} coefficients for a basis of {} kernels",
                coeffs.len(),
                basis.len()
            )));
        }
        let mut image = Array2::zeros((basis.height(), basis.width()));
        for (c, k) in coeffs.iter().zip(basis.iter()) {
            image.zip_mut_with(k, |pixel, &b| *pixel += c * b);
        }
        let sum = image.sum();
        Ok(Self {
            coeffs: coeffs.to_vec(),
            image,
            sum,
        })
    }

    /// The basis coefficients.
    pub fn coeffs(&self) -> &[f64] {
        &self.coeffs
    }

    /// The rendered kernel image.
    pub fn image(&self) -> &Array2<f64> {
        &self.image
    }

    /// The kernel sum.
    pub fn sum(&self) -> f64 {
        self.sum
    }
}

/// A linear-combination kernel whose coefficients vary across the image as
/// spatial functions, one per basis kernel.
#[derive(Debug, Clone)]
pub struct SpatialKernel {
    basis: KernelBasis,
    functions: Vec<SpatialFunction>,
}

impl SpatialKernel {
    /// Build a spatial kernel over `basis` with one zeroed copy of
    /// `function` per basis kernel.
    pub fn new(basis: KernelBasis, function: &SpatialFunction) -> Self {
        let functions = (0..basis.len()).map(|_| function.zeroed()).collect();
        Self { basis, functions }
    }

    /// The underlying basis.
    pub fn basis(&self) -> &KernelBasis {
        &self.basis
    }

    /// The per-basis spatial coefficient functions.
    pub fn functions(&self) -> &[SpatialFunction] {
        &self.functions
    }

    /// Set the spatial coefficients, outer index over basis kernels.
    pub fn set_spatial_coeffs(&mut self, coeffs: &[Vec<f64>]) -> Result<(), Error> {
        if coeffs.len() != self.basis.len() {
            return Err(Error::Domain(format!(
                "{} coefficient rows for a basis of {} kernels",
                coeffs.len(),
                self.basis.len()
            )));
        }
        for (function, row) in self.functions.iter_mut().zip(coeffs) {
            function.set_coeffs(row)?;
        }
        Ok(())
    }

    /// Render the local kernel image at position `(x, y)`.
    pub fn image_at(&self, x: f64, y: f64) -> Array2<f64> {
        let mut image = Array2::zeros((self.basis.height(), self.basis.width()));
        for (function, kernel) in self.functions.iter().zip(self.basis.iter()) {
            let c = function.eval(x, y);
            image.zip_mut_with(kernel, |pixel, &b| *pixel += c * b);
        }
        image
    }

    /// The kernel sum at position `(x, y)`.
    pub fn sum_at(&self, x: f64, y: f64) -> f64 {
        self.image_at(x, y).sum()
    }
}
