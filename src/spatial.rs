//! The global spatial fit: per-candidate normal equations re-weighted by
//! spatial polynomial evaluations and summed into one system.
//!
//! With basis size `n_b`, `n_kt` spatial kernel terms and `n_bt` background
//! terms, the assembled system has `n_b·n_kt + n_bt` parameters, or
//! `1 + (n_b-1)·n_kt + n_bt` when the first basis kernel is held spatially
//! constant to conserve the kernel sum.  The constant-first-term case packs
//! the matrix tight rather than leaving empty rows, so all later indices
//! shift by `n_kt - 1`.

use log::{debug, trace};
use nalgebra::{DMatrix, DVector};

use crate::error::Error;
use crate::kernel::{KernelBasis, SpatialKernel};
use crate::solver::{solve_linear, SolvedBy};
use crate::spatial_fn::SpatialFunction;

/// Accumulator and solver for the spatial kernel and background model.
#[derive(Debug, Clone)]
pub struct SpatialKernelSolution {
    basis: KernelBasis,
    kernel_function: SpatialFunction,
    bg_function: SpatialFunction,
    constant_first_term: bool,
    fit_for_background: bool,
    n_bases: usize,
    n_kt: usize,
    n_bt: usize,
    n_t: usize,
    m: DMatrix<f64>,
    b: DVector<f64>,
    solution: Option<DVector<f64>>,
    solved_by: Option<SolvedBy>,
    n_constraints: usize,
}

impl SpatialKernelSolution {
    /// Set up an empty system for `basis` with the given spatial function
    /// templates.
    ///
    /// `constant_first_term` holds the first kernel's coefficient spatially
    /// constant (Alard-Lupton and PCA bases, whose first kernel carries the
    /// kernel sum).  With `fit_for_background` false the background
    /// coefficient is forced to zero when the model is emitted.
    pub fn new(
        basis: KernelBasis,
        kernel_function: SpatialFunction,
        bg_function: SpatialFunction,
        constant_first_term: bool,
        fit_for_background: bool,
    ) -> Self {
        let n_bases = basis.len();
        let n_kt = kernel_function.n_terms();
        let n_bt = bg_function.n_terms();
        let n_t = if constant_first_term {
            (n_bases - 1) * n_kt + 1 + n_bt
        } else {
            n_bases * n_kt + n_bt
        };
        trace!(
            "Initializing spatial fit: {n_kt} kernel terms, {n_bt} background terms, \
             {n_t} total, constant first term = {constant_first_term}"
        );
        Self {
            basis,
            kernel_function,
            bg_function,
            constant_first_term,
            fit_for_background,
            n_bases,
            n_kt,
            n_bt,
            n_t,
            m: DMatrix::zeros(n_t, n_t),
            b: DVector::zeros(n_t),
            solution: None,
            solved_by: None,
            n_constraints: 0,
        }
    }

    /// Total parameter count of the assembled system.
    pub fn n_parameters(&self) -> usize {
        self.n_t
    }

    /// Number of candidates folded in so far.
    pub fn n_constraints(&self) -> usize {
        self.n_constraints
    }

    /// Which solver tier produced the solution, once solved.
    pub fn solved_by(&self) -> Option<SolvedBy> {
        self.solved_by
    }

    /// Fold one candidate's normal equations `(Q, W)` into the global
    /// system, weighted by the spatial term values at `(x, y)`.
    ///
    /// Only the upper triangle of the diagonal kernel and background blocks
    /// is accumulated; [`solve`](SpatialKernelSolution::solve) symmetrizes
    /// once.
    pub fn add_constraint(
        &mut self,
        x: f64,
        y: f64,
        q: &DMatrix<f64>,
        w: &DVector<f64>,
    ) -> Result<(), Error> {
        let n = self.n_bases + 1;
        if q.nrows() != n || q.ncols() != n || w.len() != n {
            return Err(Error::Domain(format!(
                "candidate normal equations are {}x{} / {}, expected {n}x{n} / {n}",
                q.nrows(),
                q.ncols(),
                w.len()
            )));
        }

        let pk = self.kernel_function.term_values(x, y);
        let pb = self.bg_function.term_values(x, y);
        let (n_kt, n_bt, n_bases) = (self.n_kt, self.n_bt, self.n_bases);
        // First spatial block and the index shift under a constant first
        // term; background block start.
        let (m0, dm) = if self.constant_first_term {
            (1, n_kt - 1)
        } else {
            (0, 0)
        };
        let mb = self.n_t - n_bt;

        if self.constant_first_term {
            self.m[(0, 0)] += q[(0, 0)];
            for m2 in 1..n_bases {
                for j in 0..n_kt {
                    self.m[(0, m2 * n_kt - dm + j)] += q[(0, m2)] * pk[j];
                }
            }
            for j in 0..n_bt {
                self.m[(0, mb + j)] += q[(0, n_bases)] * pb[j];
            }
            self.b[0] += w[0];
        }

        for m1 in m0..n_bases {
            let r0 = m1 * n_kt - dm;
            // Diagonal kernel-kernel block, upper triangle only.
            for i in 0..n_kt {
                for j in i..n_kt {
                    self.m[(r0 + i, r0 + j)] += q[(m1, m1)] * pk[i] * pk[j];
                }
            }
            // Off-diagonal kernel-kernel blocks.
            for m2 in (m1 + 1)..n_bases {
                let c0 = m2 * n_kt - dm;
                for i in 0..n_kt {
                    for j in 0..n_kt {
                        self.m[(r0 + i, c0 + j)] += q[(m1, m2)] * pk[i] * pk[j];
                    }
                }
            }
            // Kernel-background cross block.
            for i in 0..n_kt {
                for j in 0..n_bt {
                    self.m[(r0 + i, mb + j)] += q[(m1, n_bases)] * pk[i] * pb[j];
                }
            }
            for i in 0..n_kt {
                self.b[r0 + i] += w[m1] * pk[i];
            }
        }

        // Background-background block, upper triangle only.
        for i in 0..n_bt {
            for j in i..n_bt {
                self.m[(mb + i, mb + j)] += q[(n_bases, n_bases)] * pb[i] * pb[j];
            }
        }
        for i in 0..n_bt {
            self.b[mb + i] += w[n_bases] * pb[i];
        }

        self.n_constraints += 1;
        Ok(())
    }

    /// Symmetrize and solve the assembled system.  A failure here is fatal
    /// to the pipeline, unlike the per-candidate solves.
    pub fn solve(&mut self) -> Result<(), Error> {
        if self.n_constraints == 0 {
            return Err(Error::NoCandidates);
        }
        debug!(
            "Solving spatial model from {} candidates, {} parameters",
            self.n_constraints, self.n_t
        );
        for i in 0..self.n_t {
            for j in (i + 1)..self.n_t {
                self.m[(j, i)] = self.m[(i, j)];
            }
        }
        let (solution, solved_by) = solve_linear(&self.m, &self.b)?;
        self.solution = Some(solution);
        self.solved_by = Some(solved_by);
        Ok(())
    }

    /// Distribute the solution into a spatially varying kernel and a
    /// spatial background function.
    pub fn solution_pair(&self) -> Result<(SpatialKernel, SpatialFunction), Error> {
        let solution = self
            .solution
            .as_ref()
            .ok_or_else(|| Error::Domain("spatial system has not been solved".into()))?;

        let mut k_coeffs = Vec::with_capacity(self.n_bases);
        let mut idx = 0;
        for i in 0..self.n_bases {
            let mut row = vec![0.0; self.n_kt];
            if i == 0 && self.constant_first_term {
                row[0] = solution[idx];
                idx += 1;
            } else {
                for item in row.iter_mut() {
                    *item = solution[idx];
                    idx += 1;
                }
            }
            k_coeffs.push(row);
        }

        let mut bg_coeffs = vec![0.0; self.n_bt];
        if self.fit_for_background {
            for (i, coeff) in bg_coeffs.iter_mut().enumerate() {
                *coeff = solution[self.n_t - self.n_bt + i];
            }
        }

        let mut kernel = SpatialKernel::new(self.basis.clone(), &self.kernel_function);
        kernel.set_spatial_coeffs(&k_coeffs)?;
        let background = self.bg_function.with_coeffs(&bg_coeffs)?;
        Ok((kernel, background))
    }
}
