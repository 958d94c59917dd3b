//! Candidate visitors: the operations the pipeline sweeps over the cell
//! grid.
//!
//! Each visitor mutates one candidate at a time and aggregates pass-level
//! state (rejection counts, kernel-sum moments, the global spatial system).
//! Candidate-scope numerical failures mark the candidate bad and the sweep
//! continues; anything else propagates.

use log::{debug, trace};
use nalgebra::DMatrix;
use ndarray::Array2;

use crate::candidate::{CandidateStatus, KernelCandidate};
use crate::cells::CandidateVisitor;
use crate::config::{Config, SpatialFunctionKind};
use crate::error::Error;
use crate::image::BBox;
use crate::kernel::{KernelBasis, SpatialKernel};
use crate::pca::{pca_kernel_basis, KernelPca};
use crate::solver::StaticKernelSolution;
use crate::spatial::SpatialKernelSolution;
use crate::spatial_fn::SpatialFunction;
use crate::stats::{clipped_mean_std, ResidualStats};

/// Sigma and iteration count of the clipped kernel-sum statistics.
const KSUM_CLIP_SIGMA: f64 = 3.0;
const KSUM_CLIP_ITER: usize = 3;

fn spatial_function(kind: SpatialFunctionKind, order: usize, region: &BBox) -> SpatialFunction {
    match kind {
        SpatialFunctionKind::Polynomial => SpatialFunction::polynomial(order),
        SpatialFunctionKind::Chebyshev1 => SpatialFunction::chebyshev(order, region),
    }
}

/// Aggregate kernel sums across candidates, then reject outliers.
#[derive(Debug)]
pub struct KernelSumVisitor<'a> {
    config: &'a Config,
    mode: KernelSumMode,
    ksums: Vec<f64>,
    ksum_mean: f64,
    ksum_std: f64,
    dksum_max: f64,
    n_rejected: usize,
}

/// Operating mode of [`KernelSumVisitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelSumMode {
    /// Collect each candidate's kernel sum.
    Aggregate,
    /// Mark candidates whose kernel sum is an outlier bad.
    Reject,
}

impl<'a> KernelSumVisitor<'a> {
    /// New visitor in aggregate mode.
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            mode: KernelSumMode::Aggregate,
            ksums: Vec::new(),
            ksum_mean: 0.0,
            ksum_std: 0.0,
            dksum_max: 0.0,
            n_rejected: 0,
        }
    }

    /// Switch between aggregation and rejection.
    pub fn set_mode(&mut self, mode: KernelSumMode) {
        self.mode = mode;
    }

    /// Compute the clipped kernel-sum distribution and the rejection
    /// threshold `maxKsumSigma · std`.
    pub fn process_ksum_distribution(&mut self) {
        let (mean, std) = clipped_mean_std(&self.ksums, KSUM_CLIP_SIGMA, KSUM_CLIP_ITER);
        self.ksum_mean = mean;
        self.ksum_std = std;
        self.dksum_max = self.config.max_ksum_sigma * std;
        debug!(
            "Kernel sum distribution: {:.3} +/- {:.3} ({} points)",
            mean,
            std,
            self.ksums.len()
        );
    }

    /// Clipped mean of the aggregated kernel sums.
    pub fn ksum_mean(&self) -> f64 {
        self.ksum_mean
    }

    /// Clipped standard deviation of the aggregated kernel sums.
    pub fn ksum_std(&self) -> f64 {
        self.ksum_std
    }

    /// Number of aggregated kernel sums.
    pub fn ksum_npts(&self) -> usize {
        self.ksums.len()
    }

    /// Candidates rejected in the last rejection pass.
    pub fn n_rejected(&self) -> usize {
        self.n_rejected
    }
}

impl CandidateVisitor for KernelSumVisitor<'_> {
    fn process_candidate(&mut self, candidate: &mut KernelCandidate) -> Result<(), Error> {
        let Some(ksum) = candidate.ksum() else {
            return Ok(());
        };
        match self.mode {
            KernelSumMode::Aggregate => self.ksums.push(ksum),
            KernelSumMode::Reject => {
                if self.config.kernel_sum_clipping
                    && (ksum - self.ksum_mean).abs() > self.dksum_max
                {
                    debug!(
                        "Rejecting candidate {} due to bad kernel sum ({:.2})",
                        candidate.id(),
                        ksum
                    );
                    candidate.set_status(CandidateStatus::Bad);
                    self.n_rejected += 1;
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.ksums.clear();
        self.ksum_mean = 0.0;
        self.ksum_std = 0.0;
        self.dksum_max = 0.0;
        self.n_rejected = 0;
    }
}

/// Fit (or re-fit) each candidate's single-stamp kernel.
#[derive(Debug)]
pub struct BuildSingleKernelVisitor<'a> {
    basis: &'a KernelBasis,
    regularization: Option<&'a DMatrix<f64>>,
    config: &'a Config,
    skip_built: bool,
    set_candidate_kernel: bool,
    n_rejected: usize,
    n_processed: usize,
}

impl<'a> BuildSingleKernelVisitor<'a> {
    /// New builder over `basis`, optionally regularized by `h`.
    pub fn new(
        basis: &'a KernelBasis,
        regularization: Option<&'a DMatrix<f64>>,
        config: &'a Config,
    ) -> Self {
        Self {
            basis,
            regularization,
            config,
            skip_built: true,
            set_candidate_kernel: true,
            n_rejected: 0,
            n_processed: 0,
        }
    }

    /// Skip candidates that already carry a kernel (default true).  Used
    /// when revisiting cells only to build replacements for rejects.
    pub fn with_skip_built(mut self, skip: bool) -> Self {
        self.skip_built = skip;
        self
    }

    /// When false, refresh the candidate's M and B but keep its kernel and
    /// image (default true).  The PCA second pass keeps the raw
    /// delta-function kernels the eigen-basis was derived from while the
    /// normal equations switch to the eigen-basis.
    pub fn with_set_candidate_kernel(mut self, set: bool) -> Self {
        self.set_candidate_kernel = set;
        self
    }

    /// Candidates rejected since the last reset.
    pub fn n_rejected(&self) -> usize {
        self.n_rejected
    }

    /// Candidates processed since the last reset.
    pub fn n_processed(&self) -> usize {
        self.n_processed
    }

    fn regularization(&self) -> Option<(&'a DMatrix<f64>, f64)> {
        self.regularization
            .map(|h| (h, self.config.regularization_scaling))
    }

    /// Solver and numerical failures are recoverable per candidate, as is a
    /// stamp too small for the kernel stencil.
    fn recoverable(err: &Error) -> bool {
        err.is_candidate_recoverable() || matches!(err, Error::Domain(_))
    }

    fn reject(&mut self, candidate: &mut KernelCandidate, why: &str) {
        debug!("Rejecting candidate {}: {}", candidate.id(), why);
        candidate.set_status(CandidateStatus::Bad);
        self.n_rejected += 1;
    }
}

impl CandidateVisitor for BuildSingleKernelVisitor<'_> {
    fn process_candidate(&mut self, candidate: &mut KernelCandidate) -> Result<(), Error> {
        if self.skip_built && candidate.has_kernel() {
            return Ok(());
        }
        trace!("Processing candidate {}", candidate.id());
        self.n_processed += 1;

        // Variance estimate: unity, or the straight-difference variance of
        // the stamp pair.
        let variance: Array2<f64> = if self.config.constant_variance_weighting {
            Array2::ones(candidate.template().image().dim())
        } else {
            candidate.science().variance() + candidate.template().variance()
        };

        let mut solution = match StaticKernelSolution::build(
            candidate.template().image().view(),
            candidate.science().image().view(),
            variance.view(),
            self.basis,
            self.regularization(),
        ) {
            Ok(solution) => solution,
            Err(err) if Self::recoverable(&err) => {
                self.reject(candidate, &err.to_string());
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if self.set_candidate_kernel {
            candidate.set_kernel(solution.kernel().clone(), solution.background());
        }
        // M and B always refresh; the spatial fit consumes them.
        candidate.set_mb(solution.m().clone(), solution.b().clone());

        let mut diffim =
            candidate.difference_image(solution.kernel().image().view(), solution.background())?;

        // Optionally refit with the first-pass difference-image variance as
        // a better weight; pointless under constant weighting.
        if self.config.iterate_single_kernel && !self.config.constant_variance_weighting {
            solution = match StaticKernelSolution::build(
                candidate.template().image().view(),
                candidate.science().image().view(),
                diffim.variance().view(),
                self.basis,
                self.regularization(),
            ) {
                Ok(solution) => solution,
                Err(err) if Self::recoverable(&err) => {
                    self.reject(candidate, &err.to_string());
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            if self.set_candidate_kernel {
                candidate.set_kernel(solution.kernel().clone(), solution.background());
            }
            candidate.set_mb(solution.m().clone(), solution.b().clone());
            diffim = candidate
                .difference_image(solution.kernel().image().view(), solution.background())?;
        }

        let stats = ResidualStats::from_diffim(&diffim);
        candidate.set_chi2(stats.variance);
        trace!(
            "Candidate {}: X = {:.2} Y = {:.2}, kernel sum = {:.3}, background = {:.3}",
            candidate.id(),
            candidate.x_center(),
            candidate.y_center(),
            solution.ksum(),
            solution.background()
        );
        debug!(
            "Candidate {} diffim residuals = {:.2} +/- {:.2} sigma",
            candidate.id(),
            stats.mean,
            stats.rms
        );

        if !stats.mean.is_finite() || !stats.rms.is_finite() {
            self.reject(candidate, "non-finite diffim residuals");
            return Ok(());
        }

        if self.config.single_kernel_clipping {
            if stats.mean.abs() > self.config.candidate_residual_mean_max {
                self.reject(
                    candidate,
                    &format!(
                        "bad mean residual |{:.2}| > {:.2}",
                        stats.mean, self.config.candidate_residual_mean_max
                    ),
                );
            } else if stats.rms > self.config.candidate_residual_std_max {
                self.reject(
                    candidate,
                    &format!(
                        "bad residual rms {:.2} > {:.2}",
                        stats.rms, self.config.candidate_residual_std_max
                    ),
                );
            } else {
                candidate.set_status(CandidateStatus::Good);
            }
        } else {
            candidate.set_status(CandidateStatus::Good);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.n_rejected = 0;
        self.n_processed = 0;
    }
}

/// Collect each candidate's unit-sum kernel image for the PCA basis.
#[derive(Debug, Default)]
pub struct KernelPcaVisitor {
    pca: KernelPca,
    mean: Option<Array2<f64>>,
}

impl KernelPcaVisitor {
    /// Empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of collected kernel images.
    pub fn len(&self) -> usize {
        self.pca.len()
    }

    /// Whether nothing has been collected.
    pub fn is_empty(&self) -> bool {
        self.pca.is_empty()
    }

    /// Subtract the mean kernel from the collection, keeping it for the
    /// basis.  Without this step the first eigen-image is essentially the
    /// mean and crowds out the variation signal.
    pub fn subtract_mean(&mut self) -> Result<(), Error> {
        let mean = self.pca.mean()?;
        self.pca.subtract(&mean);
        self.mean = Some(mean);
        Ok(())
    }

    /// Run the eigen-analysis.
    pub fn analyze(&mut self) -> Result<(), Error> {
        self.pca.analyze()
    }

    /// Eigenvalues after analysis.
    pub fn eigen_values(&self) -> &[f64] {
        self.pca.eigen_values()
    }

    /// The reduced basis: mean kernel plus the leading `n_components`
    /// eigen-images (non-positive keeps all).
    pub fn eigen_kernel_basis(&self, n_components: i32) -> Result<KernelBasis, Error> {
        let mean = self
            .mean
            .as_ref()
            .ok_or_else(|| Error::Domain("PCA mean has not been subtracted".into()))?;
        pca_kernel_basis(mean, self.pca.eigen_images(), n_components)
    }
}

impl CandidateVisitor for KernelPcaVisitor {
    fn process_candidate(&mut self, candidate: &mut KernelCandidate) -> Result<(), Error> {
        let Some(kernel) = candidate.kernel() else {
            return Ok(());
        };
        let ksum = kernel.sum();
        if !(ksum.is_finite() && ksum != 0.0) {
            return Ok(());
        }
        // Constant weight per kernel: brighter candidates get no extra
        // pull, so normalize to unit sum and weight by one.
        let image = kernel.image() / ksum;
        if let Err(err) = self.pca.add_image(image, 1.0) {
            trace!(
                "Skipping candidate {} in PCA: {}",
                candidate.id(),
                err
            );
        }
        Ok(())
    }
}

/// Accumulate the global spatial system from per-candidate normal
/// equations.
#[derive(Debug)]
pub struct BuildSpatialKernelVisitor {
    solution: SpatialKernelSolution,
    n_candidates: usize,
}

impl BuildSpatialKernelVisitor {
    /// Set up the spatial fit over `basis` for the image `region`.
    pub fn new(basis: KernelBasis, region: BBox, config: &Config) -> Self {
        let kernel_function = spatial_function(
            config.spatial_kernel_type,
            config.spatial_kernel_order,
            &region,
        );
        let bg_function =
            spatial_function(config.spatial_bg_type, config.effective_bg_order(), &region);
        Self {
            solution: SpatialKernelSolution::new(
                basis,
                kernel_function,
                bg_function,
                config.constant_first_term(),
                config.fit_for_background,
            ),
            n_candidates: 0,
        }
    }

    /// Candidates folded into the system.
    pub fn n_candidates(&self) -> usize {
        self.n_candidates
    }

    /// Solve the assembled system.
    pub fn solve(&mut self) -> Result<(), Error> {
        self.solution.solve()
    }

    /// The fitted spatial kernel and background.
    pub fn solution_pair(&self) -> Result<(SpatialKernel, SpatialFunction), Error> {
        self.solution.solution_pair()
    }

    /// Access the underlying solution accumulator.
    pub fn solution(&self) -> &SpatialKernelSolution {
        &self.solution
    }
}

impl CandidateVisitor for BuildSpatialKernelVisitor {
    fn process_candidate(&mut self, candidate: &mut KernelCandidate) -> Result<(), Error> {
        let (x, y) = (candidate.x_center(), candidate.y_center());
        match (candidate.m(), candidate.b()) {
            (Some(m), Some(b)) => {
                trace!("Processing candidate {}", candidate.id());
                self.solution.add_constraint(x, y, m, b)?;
                self.n_candidates += 1;
            }
            _ => {
                debug!(
                    "Cannot process candidate {} without a build, continuing",
                    candidate.id()
                );
                candidate.set_status(CandidateStatus::Bad);
            }
        }
        Ok(())
    }
}

/// Evaluate the fitted spatial model at each candidate and re-assess.
#[derive(Debug)]
pub struct AssessSpatialKernelVisitor<'a> {
    kernel: &'a SpatialKernel,
    background: &'a SpatialFunction,
    config: &'a Config,
    n_good: usize,
    n_rejected: usize,
}

impl<'a> AssessSpatialKernelVisitor<'a> {
    /// New assessor for a fitted spatial model.
    pub fn new(
        kernel: &'a SpatialKernel,
        background: &'a SpatialFunction,
        config: &'a Config,
    ) -> Self {
        Self {
            kernel,
            background,
            config,
            n_good: 0,
            n_rejected: 0,
        }
    }

    /// Candidates that passed the spatial assessment.
    pub fn n_good(&self) -> usize {
        self.n_good
    }

    /// Candidates rejected by the spatial assessment.
    pub fn n_rejected(&self) -> usize {
        self.n_rejected
    }
}

impl CandidateVisitor for AssessSpatialKernelVisitor<'_> {
    fn process_candidate(&mut self, candidate: &mut KernelCandidate) -> Result<(), Error> {
        if !candidate.has_kernel() {
            trace!(
                "Cannot process candidate {}, continuing",
                candidate.id()
            );
            return Ok(());
        }
        trace!("Processing candidate {}", candidate.id());

        // Render the local fixed kernel from the spatial model.
        let kernel_image = self
            .kernel
            .image_at(candidate.x_center(), candidate.y_center());
        let background = self
            .background
            .eval(candidate.x_center(), candidate.y_center());

        let diffim = candidate.difference_image(kernel_image.view(), background)?;
        let stats = ResidualStats::from_diffim(&diffim);
        candidate.set_chi2(stats.variance);
        debug!(
            "Candidate {} spatial diffim residuals = {:.2} +/- {:.2} sigma",
            candidate.id(),
            stats.mean,
            stats.rms
        );

        if !stats.mean.is_finite() || !stats.rms.is_finite() {
            candidate.set_status(CandidateStatus::Bad);
            self.n_rejected += 1;
            return Ok(());
        }

        if self.config.spatial_kernel_clipping {
            if stats.mean.abs() > self.config.candidate_residual_mean_max {
                debug!(
                    "Rejecting candidate {}: bad spatial kernel mean residual |{:.2}| > {:.2}",
                    candidate.id(),
                    stats.mean,
                    self.config.candidate_residual_mean_max
                );
                candidate.set_status(CandidateStatus::Bad);
                self.n_rejected += 1;
            } else if stats.rms > self.config.candidate_residual_std_max {
                debug!(
                    "Rejecting candidate {}: bad spatial kernel residual rms {:.2} > {:.2}",
                    candidate.id(),
                    stats.rms,
                    self.config.candidate_residual_std_max
                );
                candidate.set_status(CandidateStatus::Bad);
                self.n_rejected += 1;
            } else {
                candidate.set_status(CandidateStatus::Good);
                self.n_good += 1;
            }
        } else {
            candidate.set_status(CandidateStatus::Good);
            self.n_good += 1;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.n_good = 0;
        self.n_rejected = 0;
    }
}

#[cfg(feature = "parallel")]
mod parallel {
    use rayon::prelude::*;

    use super::*;
    use crate::cells::SpatialCellSet;

    impl BuildSingleKernelVisitor<'_> {
        /// Build every non-bad candidate in the grid concurrently.
        ///
        /// Each candidate owns independent normal equations, so the builds
        /// are embarrassingly parallel; rejection and processing counts are
        /// reduced into this visitor afterwards.
        ///
        /// **Warning: This function ignores the `nStarPerCell` option.**
        pub fn process_all_par(&mut self, cells: &mut SpatialCellSet) -> Result<(), Error> {
            let counts: Vec<(usize, usize)> = cells
                .candidates_mut()
                .par_iter_mut()
                .filter(|candidate| candidate.status() != CandidateStatus::Bad)
                .map(|candidate| {
                    let mut worker =
                        BuildSingleKernelVisitor::new(self.basis, self.regularization, self.config)
                            .with_skip_built(self.skip_built)
                            .with_set_candidate_kernel(self.set_candidate_kernel);
                    worker
                        .process_candidate(candidate)
                        .map(|()| (worker.n_rejected, worker.n_processed))
                })
                .collect::<Result<_, _>>()?;
            for (rejected, processed) in counts {
                self.n_rejected += rejected;
                self.n_processed += processed;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::{
        AssessSpatialKernelVisitor, BuildSingleKernelVisitor, BuildSpatialKernelVisitor,
        KernelPcaVisitor, KernelSumMode, KernelSumVisitor,
    };
    use crate::basis::delta_function_basis;
    use crate::candidate::{CandidateStatus, KernelCandidate};
    use crate::cells::CandidateVisitor;
    use crate::config::{Config, KernelBasisSet};
    use crate::image::{BBox, MaskedImage};
    use crate::kernel::LinearCombinationKernel;

    fn delta_config() -> Config {
        Config {
            kernel_cols: 3,
            kernel_rows: 3,
            kernel_basis_set: KernelBasisSet::DeltaFunction,
            constant_variance_weighting: true,
            spatial_kernel_order: 0,
            spatial_bg_order: 0,
            ..Config::default()
        }
    }

    fn stamp_from(image: Array2<f64>) -> MaskedImage {
        let shape = image.dim();
        MaskedImage::from_parts(image, Array2::ones(shape), Array2::zeros(shape)).unwrap()
    }

    fn random_stamp(seed: u64, size: usize) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((size, size), |_| 100.0 + 1000.0 * rng.gen::<f64>())
    }

    /// Candidate whose science stamp equals its template stamp.
    fn clean_candidate(id: usize, x: f64, y: f64) -> KernelCandidate {
        let template = random_stamp(id as u64 + 1, 14);
        KernelCandidate::new(
            id,
            x,
            y,
            stamp_from(template.clone()),
            stamp_from(template),
        )
        .unwrap()
    }

    /// Candidate with an identity kernel of the given sum already set.
    fn candidate_with_ksum(id: usize, ksum: f64) -> KernelCandidate {
        let mut cand = clean_candidate(id, 10.0, 10.0);
        let basis = delta_function_basis(3, 3).unwrap();
        let mut coeffs = vec![0.0; 9];
        coeffs[4] = ksum;
        cand.set_kernel(LinearCombinationKernel::new(&basis, &coeffs).unwrap(), 0.0);
        cand
    }

    #[test]
    fn single_kernel_build_marks_good_and_fills_products() {
        let config = delta_config();
        let basis = delta_function_basis(3, 3).unwrap();
        let mut visitor = BuildSingleKernelVisitor::new(&basis, None, &config);

        let mut cand = clean_candidate(0, 10.0, 10.0);
        visitor.process_candidate(&mut cand).unwrap();

        assert_eq!(cand.status(), CandidateStatus::Good);
        assert!(cand.has_kernel());
        assert!(cand.m().is_some());
        assert!(cand.b().is_some());
        assert_abs_diff_eq!(cand.ksum().unwrap(), 1.0, epsilon = 1e-6);
        assert_eq!(visitor.n_rejected(), 0);

        // The stored chi-square is the residual variance of the candidate's
        // own difference image.
        let stats = crate::stats::ResidualStats::from_diffim(&cand.difference_image_own().unwrap());
        assert_abs_diff_eq!(cand.chi2(), stats.variance, epsilon = 1e-12);
    }

    #[test]
    fn skip_built_leaves_candidate_untouched() {
        let config = delta_config();
        let basis = delta_function_basis(3, 3).unwrap();
        let mut visitor = BuildSingleKernelVisitor::new(&basis, None, &config);

        let mut cand = clean_candidate(0, 10.0, 10.0);
        visitor.process_candidate(&mut cand).unwrap();
        assert_eq!(visitor.n_processed(), 1);

        // Sentinel proves the second visit does not recompute anything.
        cand.set_chi2(-123.0);
        visitor.process_candidate(&mut cand).unwrap();
        assert_eq!(visitor.n_processed(), 1);
        assert_eq!(cand.chi2(), -123.0);

        // With skip disabled the candidate is rebuilt.
        let mut rebuild = BuildSingleKernelVisitor::new(&basis, None, &config).with_skip_built(false);
        rebuild.process_candidate(&mut cand).unwrap();
        assert_ne!(cand.chi2(), -123.0);
    }

    #[test]
    fn unmatchable_candidate_is_rejected() {
        let config = delta_config();
        let basis = delta_function_basis(3, 3).unwrap();
        let mut visitor = BuildSingleKernelVisitor::new(&basis, None, &config);

        // Science is uncorrelated noise: residuals blow past the limits.
        let template = random_stamp(1, 14);
        let science = random_stamp(2, 14);
        let mut cand =
            KernelCandidate::new(7, 10.0, 10.0, stamp_from(template), stamp_from(science))
                .unwrap();
        visitor.process_candidate(&mut cand).unwrap();

        assert_eq!(cand.status(), CandidateStatus::Bad);
        assert_eq!(visitor.n_rejected(), 1);
    }

    #[test]
    fn set_candidate_kernel_false_keeps_kernel_updates_mb() {
        let config = delta_config();
        let basis = delta_function_basis(3, 3).unwrap();
        let mut build = BuildSingleKernelVisitor::new(&basis, None, &config);
        let mut cand = clean_candidate(0, 10.0, 10.0);
        build.process_candidate(&mut cand).unwrap();
        let original_coeffs = cand.kernel().unwrap().coeffs().to_vec();
        let original_m = cand.m().unwrap().clone();

        // Rebuild on a different (smaller) basis without touching the
        // kernel.
        let small_basis = delta_function_basis(1, 1).unwrap();
        let mut rebuild = BuildSingleKernelVisitor::new(&small_basis, None, &config)
            .with_skip_built(false)
            .with_set_candidate_kernel(false);
        rebuild.process_candidate(&mut cand).unwrap();

        assert_eq!(cand.kernel().unwrap().coeffs(), original_coeffs.as_slice());
        let new_m = cand.m().unwrap();
        assert_ne!(new_m.nrows(), original_m.nrows());
        assert_eq!(new_m.nrows(), 2);
    }

    #[test]
    fn all_masked_stamp_is_rejected_on_build() {
        let mut config = delta_config();
        config.constant_variance_weighting = false;
        let basis = delta_function_basis(3, 3).unwrap();
        let mut visitor = BuildSingleKernelVisitor::new(&basis, None, &config);

        // Zero variance everywhere: the weights are undefined and the
        // build must fail, marking the candidate bad.
        let image = random_stamp(5, 12);
        let zero_var = MaskedImage::from_parts(
            image.clone(),
            Array2::zeros((12, 12)),
            Array2::zeros((12, 12)),
        )
        .unwrap();
        let mut cand = KernelCandidate::new(3, 5.0, 5.0, zero_var.clone(), zero_var).unwrap();
        visitor.process_candidate(&mut cand).unwrap();

        assert_eq!(cand.status(), CandidateStatus::Bad);
        assert_eq!(visitor.n_rejected(), 1);
    }

    #[test]
    fn kernel_sum_outlier_rejected() {
        let config = delta_config();
        let mut visitor = KernelSumVisitor::new(&config);

        // Twenty inliers with small scatter and one far outlier.
        let mut candidates: Vec<KernelCandidate> = (0..20)
            .map(|i| candidate_with_ksum(i, 1.0 + 0.01 * (i as f64 - 9.5)))
            .collect();
        candidates.push(candidate_with_ksum(20, 3.0));

        for cand in candidates.iter_mut() {
            visitor.process_candidate(cand).unwrap();
        }
        visitor.process_ksum_distribution();
        assert_abs_diff_eq!(visitor.ksum_mean(), 1.0, epsilon = 0.05);
        assert_eq!(visitor.ksum_npts(), 21);

        visitor.set_mode(KernelSumMode::Reject);
        for cand in candidates.iter_mut() {
            visitor.process_candidate(cand).unwrap();
        }

        assert_eq!(visitor.n_rejected(), 1);
        assert_eq!(candidates[20].status(), CandidateStatus::Bad);
        assert!(candidates[..20]
            .iter()
            .all(|c| c.status() != CandidateStatus::Bad));
    }

    #[test]
    fn kernel_sum_clipping_off_leaves_candidates_alone() {
        let mut config = delta_config();
        config.kernel_sum_clipping = false;
        let mut visitor = KernelSumVisitor::new(&config);

        let mut candidates: Vec<KernelCandidate> = (0..5)
            .map(|i| candidate_with_ksum(i, if i == 0 { 50.0 } else { 1.0 + 1e-3 * i as f64 }))
            .collect();
        for cand in candidates.iter_mut() {
            visitor.process_candidate(cand).unwrap();
        }
        visitor.process_ksum_distribution();
        visitor.set_mode(KernelSumMode::Reject);
        for cand in candidates.iter_mut() {
            visitor.process_candidate(cand).unwrap();
        }

        assert_eq!(visitor.n_rejected(), 0);
        assert!(candidates
            .iter()
            .all(|c| c.status() != CandidateStatus::Bad));
    }

    #[test]
    fn pca_visitor_collects_unit_sum_kernels() {
        let basis = delta_function_basis(3, 3).unwrap();
        let mut visitor = KernelPcaVisitor::new();
        // Kernels whose shape varies from candidate to candidate.
        let mut candidates: Vec<KernelCandidate> = (0..4)
            .map(|i| {
                let mut cand = clean_candidate(i, 10.0, 10.0);
                let mut coeffs = vec![0.0; 9];
                coeffs[4] = 1.0;
                coeffs[3] = 0.05 * (i as f64 + 1.0);
                cand.set_kernel(
                    LinearCombinationKernel::new(&basis, &coeffs).unwrap(),
                    0.0,
                );
                cand
            })
            .collect();
        // One candidate without a kernel is skipped.
        candidates.push(clean_candidate(4, 10.0, 10.0));

        for cand in candidates.iter_mut() {
            visitor.process_candidate(cand).unwrap();
        }
        assert_eq!(visitor.len(), 4);

        visitor.subtract_mean().unwrap();
        visitor.analyze().unwrap();
        let reduced = visitor.eigen_kernel_basis(1).unwrap();
        assert_eq!(reduced.len(), 2);
        // The mean of unit-sum kernels is unit sum.
        assert_abs_diff_eq!(reduced.kernel(0).sum(), 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(reduced.kernel(1).sum(), 0.0, epsilon = 1e-8);
    }

    #[test]
    fn spatial_build_and_assess_round_trip() {
        let config = delta_config();
        let basis = delta_function_basis(3, 3).unwrap();
        let region = BBox::new(0, 0, 128, 128);

        // Build three clean candidates on the grid.
        let mut candidates: Vec<KernelCandidate> = vec![
            clean_candidate(0, 20.0, 20.0),
            clean_candidate(1, 90.0, 40.0),
            clean_candidate(2, 60.0, 100.0),
        ];
        let mut build = BuildSingleKernelVisitor::new(&basis, None, &config);
        for cand in candidates.iter_mut() {
            build.process_candidate(cand).unwrap();
        }

        let mut spatial = BuildSpatialKernelVisitor::new(basis.clone(), region, &config);
        for cand in candidates.iter_mut() {
            spatial.process_candidate(cand).unwrap();
        }
        assert_eq!(spatial.n_candidates(), 3);
        spatial.solve().unwrap();
        let (kernel, background) = spatial.solution_pair().unwrap();

        // All stamps identical: the common solution is the identity kernel
        // with zero background.
        let image = kernel.image_at(64.0, 64.0);
        assert_abs_diff_eq!(image[[1, 1]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(image.sum(), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(background.eval(64.0, 64.0), 0.0, epsilon = 1e-6);

        let mut assess = AssessSpatialKernelVisitor::new(&kernel, &background, &config);
        for cand in candidates.iter_mut() {
            assess.process_candidate(cand).unwrap();
        }
        assert_eq!(assess.n_good(), 3);
        assert_eq!(assess.n_rejected(), 0);
    }

    #[test]
    fn assess_rejects_mismatched_candidate() {
        let config = delta_config();
        let basis = delta_function_basis(3, 3).unwrap();
        let region = BBox::new(0, 0, 128, 128);

        let mut candidates: Vec<KernelCandidate> = vec![
            clean_candidate(0, 20.0, 20.0),
            clean_candidate(1, 90.0, 40.0),
        ];
        // A candidate whose science stamp got 40% brighter after the fit
        // products were computed: the common spatial model cannot match it.
        let template = random_stamp(77, 14);
        let science = template.mapv(|v| 1.4 * v);
        let mut rogue =
            KernelCandidate::new(2, 60.0, 100.0, stamp_from(template), stamp_from(science))
                .unwrap();

        let mut build = BuildSingleKernelVisitor::new(&basis, None, &config);
        for cand in candidates.iter_mut() {
            build.process_candidate(cand).unwrap();
        }
        // Give the rogue candidate the identity kernel so assessment uses
        // the shared spatial model against its mismatched stamps.
        let mut coeffs = vec![0.0; 9];
        coeffs[4] = 1.0;
        rogue.set_kernel(LinearCombinationKernel::new(&basis, &coeffs).unwrap(), 0.0);

        let mut spatial = BuildSpatialKernelVisitor::new(basis.clone(), region, &config);
        for cand in candidates.iter_mut() {
            spatial.process_candidate(cand).unwrap();
        }
        spatial.solve().unwrap();
        let (kernel, background) = spatial.solution_pair().unwrap();

        let mut assess = AssessSpatialKernelVisitor::new(&kernel, &background, &config);
        for cand in candidates.iter_mut() {
            assess.process_candidate(cand).unwrap();
        }
        assess.process_candidate(&mut rogue).unwrap();

        assert_eq!(assess.n_good(), 2);
        assert_eq!(assess.n_rejected(), 1);
        assert_eq!(rogue.status(), CandidateStatus::Bad);
    }
}
