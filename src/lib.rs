#![warn(missing_docs)]

//! Astronomical difference imaging: fit a spatially varying convolution
//! kernel K and differential background b such that `K ⊛ T + b ≈ S` for a
//! registered template image T and science image S, then subtract.  The
//! kernel is expressed on a linear basis (delta-function or
//! [Alard-Lupton](https://ui.adsabs.harvard.edu/abs/1998ApJ...503..325A)
//! sums of Gaussians), fit per candidate source, optionally compressed by a
//! PCA of the per-candidate kernels, and interpolated across the field by
//! polynomial or Chebyshev spatial functions.
//!
//! ## Interface
//! The top-level entry points are [`psf_match`], which returns the fitted
//! [`SpatialKernel`] and background, and [`subtract_masked_images`], which
//! additionally forms the full-frame difference image.  Behavior is
//! controlled through [`Config`].
//!
//! ```no_run
//! use diffimrs::{psf_match, Config, MaskedImage};
//!
//! # fn run() -> Result<(), diffimrs::Error> {
//! let mut template = MaskedImage::new(2048, 2048);
//! let mut science = MaskedImage::new(2048, 2048);
//! // ... fill the image, variance and mask planes ...
//!
//! let config = Config::default();
//! let result = psf_match(&mut template, &mut science, &config)?;
//! let local_kernel = result.kernel.image_at(1024.0, 1024.0);
//! let local_background = result.background.eval(1024.0, 1024.0);
//! # let _ = (local_kernel, local_background);
//! # Ok(())
//! # }
//! ```
//!
//! The individual stages are public for callers that need finer control:
//! stamp extraction ([`detect`]), the single-stamp solver ([`solver`]), the
//! candidate cell grid and visitors ([`cells`], [`visitors`]), the PCA
//! reduction ([`pca`]) and the spatial fit ([`spatial`]).
//!
//! ## Pixel conventions
//! Image planes are `ndarray` arrays indexed `[[row, col]]`; image
//! coordinates `(x, y)` map to `(col, row)` offset by the image origin.
//! Pixel `(x, y)` of `K ⊛ T` is `Σ_{u,v} K(u,v) · T(x+u-ctrX, y+v-ctrY)`;
//! all fitting consumes only pixels whose kernel stencil stays inside the
//! stamp.

pub mod basis;
pub mod candidate;
pub mod cells;
pub mod config;
pub mod convolve;
pub mod detect;
pub mod error;
pub mod image;
pub mod kernel;
pub mod pca;
pub mod pipeline;
pub mod regularize;
pub mod solver;
pub mod spatial;
pub mod spatial_fn;
pub mod stats;
pub mod visitors;

pub use config::{Config, DetThresholdType, KernelBasisSet, SpatialFunctionKind};
pub use error::Error;
pub use image::{BBox, MaskedImage};
pub use kernel::{KernelBasis, LinearCombinationKernel, SpatialKernel};
pub use pipeline::{psf_match, psf_match_with_footprints, subtract_masked_images, PsfMatch};
pub use spatial_fn::SpatialFunction;
