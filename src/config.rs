//! Pipeline configuration.
//!
//! One flat struct covering basis choice, solver behavior, candidate
//! rejection, stamp extraction and driver iteration.  Serde derives let
//! callers load it from any serde-backed format; unknown use cases start
//! from [`Config::default`] and override fields.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::regularize::{RegBoundary, RegStencil};

/// Which kernel basis the fit starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KernelBasisSet {
    /// One delta-function kernel per kernel pixel.
    DeltaFunction,
    /// Gaussians with polynomial modulations, renormalized.
    AlardLupton,
}

/// Spatial function family for kernel and background interpolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpatialFunctionKind {
    /// Ordinary polynomial over image coordinates.
    Polynomial,
    /// First-kind Chebyshev products over the fit region.
    Chebyshev1,
}

/// How the detection threshold is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetThresholdType {
    /// Absolute pixel value.
    Value,
    /// Multiple of the clipped standard deviation of the image.
    Stdev,
    /// Multiple of the square root of the median variance.
    Variance,
}

/// Configuration for PSF matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Kernel grid columns.
    pub kernel_cols: usize,
    /// Kernel grid rows.
    pub kernel_rows: usize,
    /// Basis choice at the start of the fit.
    pub kernel_basis_set: KernelBasisSet,
    /// Alard-Lupton Gaussian widths, one per component.
    pub alard_sig_gauss: Vec<f64>,
    /// Alard-Lupton polynomial degrees, one per component.
    pub alard_deg_gauss: Vec<usize>,

    /// Regularize delta-function fits with a smoothness penalty.
    pub use_regularization: bool,
    /// Multiplier on the Tikhonov lambda.
    pub regularization_scaling: f64,
    /// Derivative order of the smoothness penalty.
    pub reg_order: usize,
    /// Finite-difference stencil of the penalty.
    pub reg_stencil: RegStencil,
    /// Boundary treatment of the penalty.
    pub reg_boundary: RegBoundary,

    /// After the first single-kernel pass, rebuild on a PCA basis.
    pub use_pca_for_spatial_kernel: bool,
    /// PCA components kept; non-positive keeps all.
    pub n_eigen_components: i32,

    /// Order of the spatial kernel variation.
    pub spatial_kernel_order: usize,
    /// Order of the spatial background variation.
    pub spatial_bg_order: usize,
    /// Spatial function family for the kernel.
    pub spatial_kernel_type: SpatialFunctionKind,
    /// Spatial function family for the background.
    pub spatial_bg_type: SpatialFunctionKind,
    /// Fit a differential background; when false the spatial background is
    /// identically zero.
    pub fit_for_background: bool,

    /// Weight pixels equally instead of by inverse variance.
    pub constant_variance_weighting: bool,
    /// Refit each stamp once using the first difference image's variance.
    pub iterate_single_kernel: bool,

    /// Reject candidates on single-kernel residuals.
    pub single_kernel_clipping: bool,
    /// Reject candidates on spatial-kernel residuals.
    pub spatial_kernel_clipping: bool,
    /// Reject candidates on kernel-sum outliers.
    pub kernel_sum_clipping: bool,
    /// Maximum absolute mean residual, in sigma.
    pub candidate_residual_mean_max: f64,
    /// Maximum residual rms, in sigma.
    pub candidate_residual_std_max: f64,
    /// Kernel-sum rejection threshold, in clipped standard deviations.
    pub max_ksum_sigma: f64,

    /// Smallest accepted footprint, in pixels.
    pub fp_npix_min: usize,
    /// Largest accepted footprint, in pixels.
    pub fp_npix_max: usize,
    /// Footprint growth, in units of the larger kernel dimension.
    pub fp_grow_ksize: f64,
    /// Starting detection threshold.
    pub det_threshold: f64,
    /// Threshold multiplier applied on each retry.
    pub det_threshold_scaling: f64,
    /// Lowest threshold the retry loop may reach.
    pub det_threshold_min: f64,
    /// Interpretation of the detection threshold.
    pub det_threshold_type: DetThresholdType,
    /// Retry the detection until this many clean footprints are found.
    pub min_clean_fp: usize,

    /// Maximum outer iterations of the spatial fit.
    pub max_spatial_iterations: usize,
    /// Candidates considered per cell and pass; non-positive considers all.
    pub n_star_per_cell: i32,
    /// Spatial cell width, pixels.
    pub size_cell_x: usize,
    /// Spatial cell height, pixels.
    pub size_cell_y: usize,

    /// Return `science - (K ⊛ template + b)` rather than its negation.
    pub invert: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kernel_cols: 19,
            kernel_rows: 19,
            kernel_basis_set: KernelBasisSet::AlardLupton,
            alard_sig_gauss: vec![0.7, 1.5, 3.0],
            alard_deg_gauss: vec![4, 3, 2],

            use_regularization: false,
            regularization_scaling: 1.0,
            reg_order: 1,
            reg_stencil: RegStencil::Central,
            reg_boundary: RegBoundary::Wrapped,

            use_pca_for_spatial_kernel: false,
            n_eigen_components: 3,

            spatial_kernel_order: 2,
            spatial_bg_order: 1,
            spatial_kernel_type: SpatialFunctionKind::Polynomial,
            spatial_bg_type: SpatialFunctionKind::Polynomial,
            fit_for_background: true,

            constant_variance_weighting: false,
            iterate_single_kernel: false,

            single_kernel_clipping: true,
            spatial_kernel_clipping: true,
            kernel_sum_clipping: true,
            candidate_residual_mean_max: 0.25,
            candidate_residual_std_max: 1.5,
            max_ksum_sigma: 3.0,

            fp_npix_min: 5,
            fp_npix_max: 500,
            fp_grow_ksize: 1.0,
            det_threshold: 10.0,
            det_threshold_scaling: 0.75,
            det_threshold_min: 3.0,
            det_threshold_type: DetThresholdType::Stdev,
            min_clean_fp: 10,

            max_spatial_iterations: 3,
            n_star_per_cell: 3,
            size_cell_x: 128,
            size_cell_y: 128,

            invert: true,
        }
    }
}

impl Config {
    /// Check internal consistency; every violation is an
    /// [`Error::Config`].
    pub fn validate(&self) -> Result<(), Error> {
        if self.kernel_cols < 1 || self.kernel_rows < 1 {
            return Err(Error::Config(format!(
                "kernel grid must be positive, got {}x{}",
                self.kernel_cols, self.kernel_rows
            )));
        }
        if self.kernel_basis_set == KernelBasisSet::AlardLupton {
            if self.kernel_cols != self.kernel_rows {
                return Err(Error::Config(format!(
                    "Alard-Lupton kernels are square, got {}x{}",
                    self.kernel_cols, self.kernel_rows
                )));
            }
            if self.kernel_cols % 2 == 0 {
                return Err(Error::Config(format!(
                    "Alard-Lupton kernels have odd size, got {}",
                    self.kernel_cols
                )));
            }
            if self.alard_sig_gauss.len() != self.alard_deg_gauss.len() {
                return Err(Error::Config(format!(
                    "alardSigGauss has {} entries but alardDegGauss has {}",
                    self.alard_sig_gauss.len(),
                    self.alard_deg_gauss.len()
                )));
            }
            if self.alard_sig_gauss.is_empty() {
                return Err(Error::Config(
                    "Alard-Lupton basis needs at least one Gaussian".into(),
                ));
            }
        }
        if self.use_regularization && self.kernel_basis_set != KernelBasisSet::DeltaFunction {
            return Err(Error::Config(
                "regularization applies to the delta-function basis only".into(),
            ));
        }
        if self.reg_order > 2 {
            return Err(Error::Config(format!(
                "regularization order must be 0, 1 or 2, got {}",
                self.reg_order
            )));
        }
        if !(self.det_threshold_scaling > 0.0 && self.det_threshold_scaling < 1.0) {
            return Err(Error::Config(format!(
                "detThresholdScaling must lie in (0, 1), got {}",
                self.det_threshold_scaling
            )));
        }
        if self.det_threshold_min > self.det_threshold {
            return Err(Error::Config(format!(
                "detThresholdMin {} exceeds detThreshold {}",
                self.det_threshold_min, self.det_threshold
            )));
        }
        if self.fp_npix_min > self.fp_npix_max {
            return Err(Error::Config(format!(
                "fpNpixMin {} exceeds fpNpixMax {}",
                self.fp_npix_min, self.fp_npix_max
            )));
        }
        if self.size_cell_x < 1 || self.size_cell_y < 1 {
            return Err(Error::Config(format!(
                "cell sizes must be positive, got {}x{}",
                self.size_cell_x, self.size_cell_y
            )));
        }
        if self.max_spatial_iterations < 1 {
            return Err(Error::Config(
                "maxSpatialIterations must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Effective spatial background order: forced to zero when the
    /// background is not fit.
    pub fn effective_bg_order(&self) -> usize {
        if self.fit_for_background {
            self.spatial_bg_order
        } else {
            0
        }
    }

    /// Whether the first basis term is held spatially constant: true for
    /// bases whose first kernel carries the kernel sum.
    pub fn constant_first_term(&self) -> bool {
        self.kernel_basis_set == KernelBasisSet::AlardLupton || self.use_pca_for_spatial_kernel
    }
}
