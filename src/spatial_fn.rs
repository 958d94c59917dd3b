//! 2-D spatial functions used to interpolate fit coefficients across an
//! image: ordinary polynomials and first-kind Chebyshev products over a
//! bounding box.
//!
//! Terms are ordered degree-major with descending x power within a degree,
//! `1, x, y, x², xy, y², ...`; a function of order `n` has
//! `(n + 1)(n + 2) / 2` terms.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::image::BBox;

/// A scalar function of image position with linear parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpatialFunction {
    /// Polynomial in raw image coordinates.
    Polynomial2 {
        /// Total polynomial order.
        order: usize,
        /// One coefficient per term, degree-major.
        coeffs: Vec<f64>,
    },
    /// Products of first-kind Chebyshev polynomials over coordinates
    /// normalized to `[-1, 1]` across a bounding box.
    Chebyshev2 {
        /// Total order (`i + j <= order` for the `Tᵢ(x)Tⱼ(y)` products).
        order: usize,
        /// One coefficient per term, degree-major.
        coeffs: Vec<f64>,
        /// Normalization domain, `[x_min, y_min, x_max, y_max]`.
        domain: [f64; 4],
    },
}

fn n_terms_for(order: usize) -> usize {
    (order + 1) * (order + 2) / 2
}

/// First-kind Chebyshev values `T_0(t) .. T_order(t)` by recurrence.
fn chebyshev_values(t: f64, order: usize) -> Vec<f64> {
    let mut values = Vec::with_capacity(order + 1);
    values.push(1.0);
    if order >= 1 {
        values.push(t);
    }
    for k in 2..=order {
        let next = 2.0 * t * values[k - 1] - values[k - 2];
        values.push(next);
    }
    values
}

impl SpatialFunction {
    /// Zero-coefficient polynomial of the given order.
    pub fn polynomial(order: usize) -> Self {
        SpatialFunction::Polynomial2 {
            order,
            coeffs: vec![0.0; n_terms_for(order)],
        }
    }

    /// Zero-coefficient Chebyshev function of the given order over `bbox`.
    pub fn chebyshev(order: usize, bbox: &BBox) -> Self {
        SpatialFunction::Chebyshev2 {
            order,
            coeffs: vec![0.0; n_terms_for(order)],
            domain: [
                bbox.x0 as f64,
                bbox.y0 as f64,
                bbox.x1() as f64,
                bbox.y1() as f64,
            ],
        }
    }

    /// Number of linear parameters.
    pub fn n_terms(&self) -> usize {
        match self {
            SpatialFunction::Polynomial2 { order, .. }
            | SpatialFunction::Chebyshev2 { order, .. } => n_terms_for(*order),
        }
    }

    /// Current coefficients.
    pub fn coeffs(&self) -> &[f64] {
        match self {
            SpatialFunction::Polynomial2 { coeffs, .. }
            | SpatialFunction::Chebyshev2 { coeffs, .. } => coeffs,
        }
    }

    /// Replace the coefficients; the length must match [`n_terms`].
    ///
    /// [`n_terms`]: SpatialFunction::n_terms
    pub fn set_coeffs(&mut self, new_coeffs: &[f64]) -> Result<(), Error> {
        if new_coeffs.len() != self.n_terms() {
            return Err(Error::Domain(format!(
                "spatial function expects {} coefficients, got {}",
                self.n_terms(),
                new_coeffs.len()
            )));
        }
        match self {
            SpatialFunction::Polynomial2 { coeffs, .. }
            | SpatialFunction::Chebyshev2 { coeffs, .. } => {
                coeffs.clear();
                coeffs.extend_from_slice(new_coeffs);
            }
        }
        Ok(())
    }

    /// A copy of the same form with the given coefficients.
    pub fn with_coeffs(&self, new_coeffs: &[f64]) -> Result<Self, Error> {
        let mut copy = self.clone();
        copy.set_coeffs(new_coeffs)?;
        Ok(copy)
    }

    /// A copy of the same form with all coefficients zero.
    pub fn zeroed(&self) -> Self {
        let mut copy = self.clone();
        match &mut copy {
            SpatialFunction::Polynomial2 { coeffs, .. }
            | SpatialFunction::Chebyshev2 { coeffs, .. } => coeffs.iter_mut().for_each(|c| *c = 0.0),
        }
        copy
    }

    /// Values of every term at `(x, y)`: the `P` vector of the spatial
    /// normal equations.
    pub fn term_values(&self, x: f64, y: f64) -> Vec<f64> {
        match self {
            SpatialFunction::Polynomial2 { order, .. } => {
                let mut terms = Vec::with_capacity(n_terms_for(*order));
                for d in 0..=*order {
                    for j in 0..=d {
                        terms.push(x.powi((d - j) as i32) * y.powi(j as i32));
                    }
                }
                terms
            }
            SpatialFunction::Chebyshev2 { order, domain, .. } => {
                let tx = normalize(x, domain[0], domain[2]);
                let ty = normalize(y, domain[1], domain[3]);
                let cx = chebyshev_values(tx, *order);
                let cy = chebyshev_values(ty, *order);
                let mut terms = Vec::with_capacity(n_terms_for(*order));
                for d in 0..=*order {
                    for j in 0..=d {
                        terms.push(cx[d - j] * cy[j]);
                    }
                }
                terms
            }
        }
    }

    /// Evaluate the function at `(x, y)`.
    pub fn eval(&self, x: f64, y: f64) -> f64 {
        self.term_values(x, y)
            .iter()
            .zip(self.coeffs())
            .map(|(t, c)| t * c)
            .sum()
    }
}

fn normalize(v: f64, min: f64, max: f64) -> f64 {
    if max > min {
        (2.0 * v - (min + max)) / (max - min)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::SpatialFunction;
    use crate::image::BBox;

    #[test]
    fn term_counts() {
        for order in 0..5 {
            let f = SpatialFunction::polynomial(order);
            assert_eq!(f.n_terms(), (order + 1) * (order + 2) / 2);
            assert_eq!(f.term_values(1.3, -0.4).len(), f.n_terms());
        }
    }

    #[test]
    fn polynomial_term_ordering() {
        let f = SpatialFunction::polynomial(2);
        let terms = f.term_values(2.0, 3.0);
        // 1, x, y, x^2, x y, y^2
        assert_eq!(terms, vec![1.0, 2.0, 3.0, 4.0, 6.0, 9.0]);
    }

    #[test]
    fn polynomial_eval() {
        let f = SpatialFunction::polynomial(1)
            .with_coeffs(&[10.0, 2.0, -1.0])
            .unwrap();
        assert_abs_diff_eq!(f.eval(3.0, 4.0), 10.0 + 6.0 - 4.0, epsilon = 1e-12);
    }

    #[test]
    fn chebyshev_matches_polynomial_on_unit_domain() {
        // Over [-1, 1]^2, T0 = 1, T1 = t, T2 = 2t^2 - 1.
        let bbox = BBox::new(-1, -1, 3, 3);
        let f = SpatialFunction::chebyshev(2, &bbox);
        let terms = f.term_values(0.5, -0.25);
        assert_abs_diff_eq!(terms[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(terms[1], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(terms[2], -0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(terms[3], 2.0 * 0.25 - 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(terms[4], 0.5 * -0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(terms[5], 2.0 * 0.0625 - 1.0, epsilon = 1e-12);
    }

    #[test]
    fn chebyshev_normalizes_domain() {
        let bbox = BBox::new(0, 0, 101, 201);
        let f = SpatialFunction::chebyshev(1, &bbox)
            .with_coeffs(&[0.0, 1.0, 0.0])
            .unwrap();
        // T1 at domain edges is -1 / +1.
        assert_abs_diff_eq!(f.eval(0.0, 100.0), -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(f.eval(100.0, 100.0), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(f.eval(50.0, 100.0), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn set_coeffs_checks_length() {
        let mut f = SpatialFunction::polynomial(1);
        assert!(f.set_coeffs(&[1.0, 2.0]).is_err());
        assert!(f.set_coeffs(&[1.0, 2.0, 3.0]).is_ok());
        assert_eq!(f.zeroed().coeffs(), &[0.0, 0.0, 0.0]);
    }
}
