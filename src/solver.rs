//! The single-stamp kernel solver and its cascading linear-solve strategy.
//!
//! A stamp pair (template, science) and a kernel basis define weighted
//! least-squares normal equations `M x = B` whose solution gives the basis
//! coefficients and a scalar differential background.  `M` can turn
//! ill-conditioned on low-signal stamps or nearly collinear bases, so the
//! solve cascades through progressively more forgiving methods, ending at a
//! symmetric-eigendecomposition pseudo-inverse that always returns a number.

use log::{debug, trace};
use nalgebra::{Cholesky, DMatrix, DVector, SymmetricEigen, LU};
use ndarray::ArrayView2;

use crate::convolve::{convolve_image, interior_bounds};
use crate::error::Error;
use crate::kernel::{KernelBasis, LinearCombinationKernel};

/// Relative residual accepted from the direct solver tiers.
const RESIDUAL_TOL: f64 = 1e-8;

/// Which tier of the cascading solver produced a solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolvedBy {
    /// Cholesky LDLᵀ factorization.
    CholeskyLdlt,
    /// Cholesky LLᵀ factorization.
    CholeskyLlt,
    /// LU decomposition.
    Lu,
    /// Symmetric eigendecomposition pseudo-inverse.
    Eigenvector,
}

/// Unpivoted LDLᵀ factor-and-solve; `None` on a zero or non-finite pivot.
pub(crate) fn ldlt_solve(m: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    let n = m.nrows();
    let mut l = DMatrix::<f64>::identity(n, n);
    let mut d = vec![0.0; n];

    for j in 0..n {
        let mut pivot = m[(j, j)];
        for k in 0..j {
            pivot -= l[(j, k)] * l[(j, k)] * d[k];
        }
        if !pivot.is_finite() || pivot == 0.0 {
            return None;
        }
        d[j] = pivot;
        for i in (j + 1)..n {
            let mut v = m[(i, j)];
            for k in 0..j {
                v -= l[(i, k)] * l[(j, k)] * d[k];
            }
            l[(i, j)] = v / pivot;
        }
    }

    let mut x = b.clone();
    // L z = b
    for i in 0..n {
        for k in 0..i {
            let t = l[(i, k)] * x[k];
            x[i] -= t;
        }
    }
    // D y = z
    for i in 0..n {
        x[i] /= d[i];
    }
    // Lᵀ x = y
    for i in (0..n).rev() {
        for k in (i + 1)..n {
            let t = l[(k, i)] * x[k];
            x[i] -= t;
        }
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Accept a direct-tier solution only if it is finite and actually solves
/// the system; a near-singular factorization can return huge garbage
/// without reporting failure.
fn acceptable(m: &DMatrix<f64>, b: &DVector<f64>, x: &DVector<f64>) -> bool {
    if !x.iter().all(|v| v.is_finite()) {
        return false;
    }
    let residual = (m * x - b).norm();
    residual <= RESIDUAL_TOL * b.norm().max(f64::MIN_POSITIVE)
}

/// Solve `M x = B`, trying Cholesky LDLᵀ, Cholesky LLᵀ, LU, then the
/// symmetric-eigendecomposition pseudo-inverse.
///
/// The eigen tier maps zero eigenvalues to zero inverses (Moore-Penrose),
/// so a rank-deficient system yields the minimum-norm solution.  Fails only
/// if the eigendecomposition itself does.
pub fn solve_linear(m: &DMatrix<f64>, b: &DVector<f64>) -> Result<(DVector<f64>, SolvedBy), Error> {
    if let Some(x) = ldlt_solve(m, b) {
        if acceptable(m, b, &x) {
            return Ok((x, SolvedBy::CholeskyLdlt));
        }
    }
    trace!("Unable to determine kernel via Cholesky LDL^T");

    if let Some(chol) = Cholesky::new(m.clone()) {
        let x = chol.solve(b);
        if acceptable(m, b, &x) {
            return Ok((x, SolvedBy::CholeskyLlt));
        }
    }
    trace!("Unable to determine kernel via Cholesky LL^T");

    if let Some(x) = LU::new(m.clone()).solve(b) {
        if acceptable(m, b, &x) {
            return Ok((x, SolvedBy::Lu));
        }
    }
    trace!("Unable to determine kernel via LU");

    let eigen = SymmetricEigen::try_new(m.clone(), 0.0, 0).ok_or(Error::SolveFailure {
        trace: m.trace(),
    })?;
    let max_abs = eigen
        .eigenvalues
        .iter()
        .fold(0.0f64, |acc, v| acc.max(v.abs()));
    let tol = max_abs * m.nrows() as f64 * f64::EPSILON;
    let inv = DVector::from_iterator(
        eigen.eigenvalues.len(),
        eigen
            .eigenvalues
            .iter()
            .map(|&v| if v.abs() > tol { 1.0 / v } else { 0.0 }),
    );
    let r = &eigen.eigenvectors;
    let x = r * DMatrix::from_diagonal(&inv) * r.transpose() * b;
    if !x.iter().all(|v| v.is_finite()) {
        return Err(Error::SolveFailure { trace: m.trace() });
    }
    debug!("Kernel solution determined via eigen-value pseudo-inverse");
    Ok((x, SolvedBy::Eigenvector))
}

/// Immutable-after-solve result of fitting one stamp pair on a basis.
#[derive(Debug, Clone)]
pub struct StaticKernelSolution {
    m: DMatrix<f64>,
    b: DVector<f64>,
    solution: DVector<f64>,
    solved_by: SolvedBy,
    kernel: LinearCombinationKernel,
    background: f64,
}

impl StaticKernelSolution {
    /// Build and solve the normal equations for one stamp pair.
    ///
    /// `template`, `science` and `variance` must share a shape at least as
    /// large as the basis kernels.  `regularization` supplies the penalty
    /// matrix H and its scaling; the Tikhonov step replaces
    /// `M <- MᵀM + λH`, `B <- MᵀB` with `λ = trace(MᵀM)/trace(H) ·
    /// scaling`.  Without it M is already symmetric and the shorter solver
    /// path is kept.
    pub fn build(
        template: ArrayView2<f64>,
        science: ArrayView2<f64>,
        variance: ArrayView2<f64>,
        basis: &KernelBasis,
        regularization: Option<(&DMatrix<f64>, f64)>,
    ) -> Result<Self, Error> {
        if template.dim() != science.dim() || template.dim() != variance.dim() {
            return Err(Error::Domain(format!(
                "stamp shapes disagree: {:?} vs {:?} vs {:?}",
                template.dim(),
                science.dim(),
                variance.dim()
            )));
        }
        let n_kernel = basis.len();
        let n_params = n_kernel + 1;
        if let Some((h, _)) = regularization {
            if h.nrows() != n_params || h.ncols() != n_params {
                return Err(Error::Config(format!(
                    "regularization matrix is {}x{}, expected {}x{}",
                    h.nrows(),
                    h.ncols(),
                    n_params,
                    n_params
                )));
            }
        }

        let (r0, r1, c0, c1) = interior_bounds(template.dim(), (basis.height(), basis.width()))?;
        let n_pixels = (r1 - r0) * (c1 - c0);

        // Interior science values and inverse-variance weights.
        let mut s_vec = DVector::<f64>::zeros(n_pixels);
        let mut weights = DVector::<f64>::zeros(n_pixels);
        let mut idx = 0;
        for r in r0..r1 {
            for c in c0..c1 {
                let s = science[[r, c]];
                let t = template[[r, c]];
                let v = variance[[r, c]];
                if !s.is_finite() || !t.is_finite() {
                    return Err(Error::NumericalInvalid(format!(
                        "non-finite stamp value at ({r}, {c})"
                    )));
                }
                if !(v.is_finite() && v > 0.0) {
                    return Err(Error::NumericalInvalid(format!(
                        "non-positive variance {v} at ({r}, {c})"
                    )));
                }
                s_vec[idx] = s;
                weights[idx] = 1.0 / v;
                idx += 1;
            }
        }

        // Design matrix: one column per convolved basis, trailing ones for
        // the background.
        let mut c_mat = DMatrix::<f64>::zeros(n_pixels, n_params);
        for (ki, kernel) in basis.iter().enumerate() {
            let conv = convolve_image(template, kernel.view());
            let mut idx = 0;
            for r in r0..r1 {
                for c in c0..c1 {
                    c_mat[(idx, ki)] = conv[[r, c]];
                    idx += 1;
                }
            }
        }
        for i in 0..n_pixels {
            c_mat[(i, n_params - 1)] = 1.0;
        }

        let mut wc = c_mat.clone();
        for (i, &w) in weights.iter().enumerate() {
            let mut row = wc.row_mut(i);
            row *= w;
        }

        let mut m = c_mat.transpose() * &wc;
        let mut b = wc.transpose() * &s_vec;

        if let Some((h, scaling)) = regularization {
            let mt = m.transpose();
            let mm = &mt * &m;
            let lambda = mm.trace() / h.trace() * scaling;
            m = mm + h * lambda;
            b = mt * b;
            trace!("Applying kernel regularization with lambda = {lambda:.2e}");
        }

        let (solution, solved_by) = solve_linear(&m, &b)?;
        if let Some(pos) = solution.iter().position(|v| !v.is_finite()) {
            return Err(Error::NumericalInvalid(format!(
                "kernel solution component {pos} is not finite"
            )));
        }

        let kernel = LinearCombinationKernel::new(basis, &solution.as_slice()[..n_kernel])?;
        let background = solution[n_kernel];

        Ok(Self {
            m,
            b,
            solution,
            solved_by,
            kernel,
            background,
        })
    }

    /// The normal-equation matrix as stored (regularized if requested).
    pub fn m(&self) -> &DMatrix<f64> {
        &self.m
    }

    /// The normal-equation right-hand side as stored.
    pub fn b(&self) -> &DVector<f64> {
        &self.b
    }

    /// The raw solution vector (basis coefficients then background).
    pub fn solution(&self) -> &DVector<f64> {
        &self.solution
    }

    /// Which solver tier produced the solution.
    pub fn solved_by(&self) -> SolvedBy {
        self.solved_by
    }

    /// The fitted kernel.
    pub fn kernel(&self) -> &LinearCombinationKernel {
        &self.kernel
    }

    /// The fitted kernel sum.
    pub fn ksum(&self) -> f64 {
        self.kernel.sum()
    }

    /// The fitted differential background.
    pub fn background(&self) -> f64 {
        self.background
    }

    /// Per-parameter standard deviations from the covariance `MᵀM`,
    /// composed into a kernel-shaped uncertainty plus a background error.
    pub fn uncertainties(
        &self,
        basis: &KernelBasis,
    ) -> Result<(LinearCombinationKernel, f64), Error> {
        let cov = self.m.transpose() * &self.m;
        let chol = Cholesky::new(cov).ok_or_else(|| {
            Error::NumericalInvalid("covariance matrix is not positive definite".into())
        })?;
        let error2 = chol.inverse();

        let n_kernel = basis.len();
        let mut sigmas = Vec::with_capacity(n_kernel);
        for i in 0..=n_kernel {
            let var = error2[(i, i)];
            if var.is_nan() {
                return Err(Error::NumericalInvalid(format!(
                    "uncertainty {i} is NaN"
                )));
            }
            if var < 0.0 {
                return Err(Error::NumericalInvalid(format!(
                    "negative variance {var:.3e} for parameter {i}"
                )));
            }
            if i < n_kernel {
                sigmas.push(var.sqrt());
            } else {
                let kernel_err = LinearCombinationKernel::new(basis, &sigmas)?;
                return Ok((kernel_err, var.sqrt()));
            }
        }
        unreachable!("loop returns on the background term");
    }
}
