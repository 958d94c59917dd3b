//! A kernel candidate: one stamp pair with its fit state.

use nalgebra::{DMatrix, DVector};
use ndarray::ArrayView2;

use crate::convolve::{convolve_and_subtract, Background};
use crate::error::Error;
use crate::image::MaskedImage;
use crate::kernel::LinearCombinationKernel;

/// Lifecycle state of a candidate.
///
/// Candidates start `Unknown`, move to `Good` when a build passes the
/// residual limits, and to `Bad` when a solve fails, residuals land out of
/// bounds, or the kernel sum is an outlier.  `Bad` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateStatus {
    /// Not yet fit, or not yet assessed.
    Unknown,
    /// Current fit passed every check.
    Good,
    /// Rejected; the cell grid steps to the next-best candidate.
    Bad,
}

/// One candidate source: its stamp pair, position, rating and fit products.
#[derive(Debug, Clone)]
pub struct KernelCandidate {
    id: usize,
    x_center: f64,
    y_center: f64,
    template: MaskedImage,
    science: MaskedImage,
    rating: f64,
    status: CandidateStatus,
    kernel: Option<LinearCombinationKernel>,
    background: f64,
    m: Option<DMatrix<f64>>,
    b: Option<DVector<f64>>,
    chi2: f64,
}

impl KernelCandidate {
    /// Create a candidate from co-located template and science stamps.
    ///
    /// The rating, used to order candidates within a spatial cell, is the
    /// total template flux of the stamp.
    pub fn new(
        id: usize,
        x_center: f64,
        y_center: f64,
        template: MaskedImage,
        science: MaskedImage,
    ) -> Result<Self, Error> {
        if template.image().dim() != science.image().dim() {
            return Err(Error::Domain(format!(
                "candidate stamps disagree in shape: {:?} vs {:?}",
                template.image().dim(),
                science.image().dim()
            )));
        }
        let rating = template.image().sum();
        Ok(Self {
            id,
            x_center,
            y_center,
            template,
            science,
            rating,
            status: CandidateStatus::Unknown,
            kernel: None,
            background: 0.0,
            m: None,
            b: None,
            chi2: f64::NAN,
        })
    }

    /// Stable candidate id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// x of the candidate center, image coordinates.
    pub fn x_center(&self) -> f64 {
        self.x_center
    }

    /// y of the candidate center, image coordinates.
    pub fn y_center(&self) -> f64 {
        self.y_center
    }

    /// The template stamp.
    pub fn template(&self) -> &MaskedImage {
        &self.template
    }

    /// The science stamp.
    pub fn science(&self) -> &MaskedImage {
        &self.science
    }

    /// Candidate rating (template flux); higher is visited first.
    pub fn rating(&self) -> f64 {
        self.rating
    }

    /// Current lifecycle status.
    pub fn status(&self) -> CandidateStatus {
        self.status
    }

    /// Set the lifecycle status.
    pub fn set_status(&mut self, status: CandidateStatus) {
        self.status = status;
    }

    /// Whether a kernel has been fit for this candidate.
    pub fn has_kernel(&self) -> bool {
        self.kernel.is_some()
    }

    /// The current kernel, if built.
    pub fn kernel(&self) -> Option<&LinearCombinationKernel> {
        self.kernel.as_ref()
    }

    /// The current kernel sum, if built.
    pub fn ksum(&self) -> Option<f64> {
        self.kernel.as_ref().map(|k| k.sum())
    }

    /// The current scalar background.
    pub fn background(&self) -> f64 {
        self.background
    }

    /// Replace the candidate's kernel and background.
    pub fn set_kernel(&mut self, kernel: LinearCombinationKernel, background: f64) {
        self.kernel = Some(kernel);
        self.background = background;
    }

    /// The candidate's normal-equation matrix, if built.
    pub fn m(&self) -> Option<&DMatrix<f64>> {
        self.m.as_ref()
    }

    /// The candidate's normal-equation right-hand side, if built.
    pub fn b(&self) -> Option<&DVector<f64>> {
        self.b.as_ref()
    }

    /// Store the normal equations for the spatial fit.  Always refreshed on
    /// a rebuild, even when the kernel itself is kept.
    pub fn set_mb(&mut self, m: DMatrix<f64>, b: DVector<f64>) {
        self.m = Some(m);
        self.b = Some(b);
    }

    /// Chi-square of the current difference image.
    pub fn chi2(&self) -> f64 {
        self.chi2
    }

    /// Record the chi-square of the current difference image.
    pub fn set_chi2(&mut self, chi2: f64) {
        self.chi2 = chi2;
    }

    /// Difference image of the stamps under the given kernel and
    /// background: `science - (kernel ⊛ template + background)`.
    pub fn difference_image(
        &self,
        kernel: ArrayView2<f64>,
        background: f64,
    ) -> Result<MaskedImage, Error> {
        convolve_and_subtract(
            &self.template,
            &self.science,
            kernel,
            Background::Scalar(background),
            true,
        )
    }

    /// Difference image under the candidate's own current solution.
    pub fn difference_image_own(&self) -> Result<MaskedImage, Error> {
        let kernel = self
            .kernel
            .as_ref()
            .ok_or_else(|| Error::Domain(format!("candidate {} has no kernel", self.id)))?;
        self.difference_image(kernel.image().view(), self.background)
    }
}
