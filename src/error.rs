//! Error type shared across the crate.

/// Failure kinds surfaced by the PSF-matching pipeline.
///
/// Candidate-scope failures ([`Error::SolveFailure`],
/// [`Error::NumericalInvalid`]) are recovered by the visitors, which mark the
/// offending candidate bad and continue.  The same failures during the global
/// spatial solve, and every other variant, abort the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Inconsistent configuration, e.g. Alard-Lupton sigma and degree lists
    /// of different lengths.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Nonsensical dimensions or shapes, e.g. an empty basis or coupled
    /// image planes of different sizes.
    #[error("invalid domain: {0}")]
    Domain(String),

    /// All four tiers of the cascading linear solver failed.
    #[error("all linear solvers failed on normal equations (trace = {trace:.6e})")]
    SolveFailure {
        /// Trace of the matrix that could not be solved.
        trace: f64,
    },

    /// NaN in a solution vector or negative variance in an uncertainty
    /// estimate.
    #[error("numerically invalid result: {0}")]
    NumericalInvalid(String),

    /// The stamp extractor found no clean footprints to fit kernels around.
    #[error("no clean footprints found for PSF matching")]
    NoCandidates,
}

impl Error {
    /// True for failures that are recovered at single-candidate scope by
    /// marking the candidate bad.
    pub fn is_candidate_recoverable(&self) -> bool {
        matches!(
            self,
            Error::SolveFailure { .. } | Error::NumericalInvalid(_)
        )
    }
}
