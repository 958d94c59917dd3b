//! Principal component analysis of kernel-image populations.
//!
//! The per-candidate kernels, normalized to unit sum, are stacked; the mean
//! is subtracted before the eigen-decomposition so the leading components
//! capture the spatial variation rather than re-encoding the mean.  The
//! reduced basis is the mean plus the leading eigen-images.

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::Array2;

use crate::basis::renormalize_basis;
use crate::error::Error;
use crate::kernel::KernelBasis;
use crate::stats::min_max;

/// A weighted collection of equally shaped images with an eigen-analysis.
#[derive(Debug, Clone, Default)]
pub struct ImagePca {
    images: Vec<Array2<f64>>,
    weights: Vec<f64>,
    eigen_images: Vec<Array2<f64>>,
    eigen_values: Vec<f64>,
}

impl ImagePca {
    /// Empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of collected images.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Add an image with a scalar weight.
    pub fn add_image(&mut self, image: Array2<f64>, weight: f64) -> Result<(), Error> {
        if let Some(first) = self.images.first() {
            if first.dim() != image.dim() {
                return Err(Error::Domain(format!(
                    "PCA image shape {:?} does not match collection shape {:?}",
                    image.dim(),
                    first.dim()
                )));
            }
        }
        if !(weight.is_finite() && weight > 0.0) {
            return Err(Error::Domain(format!("non-positive PCA weight {weight}")));
        }
        self.images.push(image);
        self.weights.push(weight);
        Ok(())
    }

    /// Weighted mean of the collection.
    pub fn mean(&self) -> Result<Array2<f64>, Error> {
        let first = self
            .images
            .first()
            .ok_or_else(|| Error::Domain("PCA collection is empty".into()))?;
        let mut mean = Array2::zeros(first.dim());
        let mut total = 0.0;
        for (image, &weight) in self.images.iter().zip(&self.weights) {
            mean.zip_mut_with(image, |m, &v| *m += weight * v);
            total += weight;
        }
        mean /= total;
        Ok(mean)
    }

    /// Subtract an image (typically the mean) from every member.
    pub fn subtract(&mut self, image: &Array2<f64>) {
        for member in &mut self.images {
            *member -= image;
        }
    }

    /// Eigen-decompose the collection via the Gram matrix of image inner
    /// products; eigen-images come out in descending eigenvalue order with
    /// unit L2 norm.
    pub fn analyze(&mut self) -> Result<(), Error> {
        let n = self.images.len();
        if n == 0 {
            return Err(Error::Domain("PCA collection is empty".into()));
        }

        let gram = DMatrix::from_fn(n, n, |i, j| {
            self.images[i]
                .iter()
                .zip(self.images[j].iter())
                .map(|(a, b)| a * b)
                .sum::<f64>()
        });
        let eigen = SymmetricEigen::try_new(gram, 0.0, 0).ok_or(Error::SolveFailure {
            trace: f64::NAN,
        })?;

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            eigen.eigenvalues[b]
                .partial_cmp(&eigen.eigenvalues[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        self.eigen_images.clear();
        self.eigen_values.clear();
        let shape = self.images[0].dim();
        for &k in &order {
            let lambda = eigen.eigenvalues[k].max(0.0);
            let mut image = Array2::zeros(shape);
            for (i, member) in self.images.iter().enumerate() {
                let v = eigen.eigenvectors[(i, k)];
                image.zip_mut_with(member, |pixel, &m| *pixel += v * m);
            }
            // || Σ v_i I_i ||^2 = λ for a unit Gram eigenvector.
            if lambda > 0.0 {
                image /= lambda.sqrt();
            }
            self.eigen_images.push(image);
            self.eigen_values.push(lambda);
        }
        Ok(())
    }

    /// Eigen-images, descending eigenvalue order; empty before
    /// [`analyze`](ImagePca::analyze).
    pub fn eigen_images(&self) -> &[Array2<f64>] {
        &self.eigen_images
    }

    /// Eigenvalues matching [`eigen_images`](ImagePca::eigen_images).
    pub fn eigen_values(&self) -> &[f64] {
        &self.eigen_values
    }

    pub(crate) fn eigen_images_mut(&mut self) -> &mut [Array2<f64>] {
        &mut self.eigen_images
    }
}

/// [`ImagePca`] specialized for kernel images: after analysis each
/// eigen-image is rescaled so its extreme value (the larger magnitude of
/// min and max) becomes plus or minus one.
#[derive(Debug, Clone, Default)]
pub struct KernelPca {
    pca: ImagePca,
}

impl KernelPca {
    /// Empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of collected kernel images.
    pub fn len(&self) -> usize {
        self.pca.len()
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.pca.is_empty()
    }

    /// Add a kernel image with a scalar weight.
    pub fn add_image(&mut self, image: Array2<f64>, weight: f64) -> Result<(), Error> {
        self.pca.add_image(image, weight)
    }

    /// Weighted mean of the collection.
    pub fn mean(&self) -> Result<Array2<f64>, Error> {
        self.pca.mean()
    }

    /// Subtract an image from every member.
    pub fn subtract(&mut self, image: &Array2<f64>) {
        self.pca.subtract(image);
    }

    /// Analyze, then normalize each eigen-image to an extreme of plus or
    /// minus one.  Eigen-images with mean zero cannot be normalized by
    /// their sum, hence the extreme.
    pub fn analyze(&mut self) -> Result<(), Error> {
        self.pca.analyze()?;
        for image in self.pca.eigen_images_mut() {
            let (min, max) = min_max(image.view());
            let extreme = if min.abs() > max { min } else { max };
            if extreme != 0.0 {
                *image /= extreme;
            }
        }
        Ok(())
    }

    /// Eigen-images after analysis.
    pub fn eigen_images(&self) -> &[Array2<f64>] {
        self.pca.eigen_images()
    }

    /// Eigenvalues after analysis.
    pub fn eigen_values(&self) -> &[f64] {
        self.pca.eigen_values()
    }
}

/// Assemble the reduced kernel basis: the mean kernel plus the leading
/// `n_components` eigen-images (non-positive keeps all), renormalized for
/// kernel-sum conservation.
pub fn pca_kernel_basis(
    mean: &Array2<f64>,
    eigen_images: &[Array2<f64>],
    n_components: i32,
) -> Result<KernelBasis, Error> {
    let available = eigen_images.len();
    let keep = if n_components <= 0 {
        available
    } else {
        available.min(n_components as usize)
    };
    let mut kernels = Vec::with_capacity(keep + 1);
    kernels.push(mean.clone());
    kernels.extend(eigen_images.iter().take(keep).cloned());
    renormalize_basis(kernels)
}
