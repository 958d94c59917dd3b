//! Finite-difference regularization of the kernel solution.
//!
//! Builds a discrete differential operator L over the kernel pixel grid and
//! returns the symmetric positive semi-definite penalty `H = Lᵀ L`, sized
//! `(n_pix + 1)²` with an empty trailing row and column so the background
//! term is never penalized.

use nalgebra::DMatrix;

use crate::error::Error;

/// Finite-difference stencil family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegStencil {
    /// One-sided forward differences.
    Forward,
    /// Symmetric central differences.
    Central,
}

/// Treatment of stencil terms that cross the kernel edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegBoundary {
    /// Drop out-of-bounds terms.
    Unwrapped,
    /// Wrap toroidally.
    Wrapped,
    /// Fall back to lower derivative orders near the edge.
    TaperedOrder,
}

/// Stencil coefficient tables, `[order][dx][dy]`, with per-order extents
/// and centers.
struct StencilTable {
    coeffs: [[[f64; 5]; 5]; 3],
    size: usize,
    center: usize,
    center1: usize,
    center2: usize,
}

fn stencil_table(order: usize, stencil: RegStencil) -> StencilTable {
    let mut coeffs = [[[0.0; 5]; 5]; 3];
    match stencil {
        RegStencil::Forward => {
            coeffs[0][0][0] = -2.0;
            coeffs[0][0][1] = 1.0;
            coeffs[0][1][0] = 1.0;

            coeffs[1][0][0] = -2.0;
            coeffs[1][0][1] = 2.0;
            coeffs[1][0][2] = -1.0;
            coeffs[1][1][0] = 2.0;
            coeffs[1][2][0] = -1.0;

            coeffs[2][0][0] = -2.0;
            coeffs[2][0][1] = 3.0;
            coeffs[2][0][2] = -3.0;
            coeffs[2][0][3] = 1.0;
            coeffs[2][1][0] = 3.0;
            coeffs[2][2][0] = -3.0;
            coeffs[2][3][0] = 1.0;

            StencilTable {
                coeffs,
                size: order + 2,
                center: 0,
                center1: 0,
                center2: 0,
            }
        }
        RegStencil::Central => {
            coeffs[0][0][1] = -1.0;
            coeffs[0][1][0] = -1.0;
            coeffs[0][1][2] = 1.0;
            coeffs[0][2][1] = 1.0;

            coeffs[1][0][1] = 1.0;
            coeffs[1][1][0] = 1.0;
            coeffs[1][1][1] = -4.0;
            coeffs[1][1][2] = 1.0;
            coeffs[1][2][1] = 1.0;

            coeffs[2][0][2] = -1.0;
            coeffs[2][1][2] = 2.0;
            coeffs[2][2][0] = -1.0;
            coeffs[2][2][1] = 2.0;
            coeffs[2][2][3] = -2.0;
            coeffs[2][2][4] = 1.0;
            coeffs[2][3][2] = -2.0;
            coeffs[2][4][2] = 1.0;

            StencilTable {
                coeffs,
                size: if order == 2 { 5 } else { 3 },
                center: if order == 2 { 2 } else { 1 },
                center1: 1,
                center2: 2,
            }
        }
    }
}

/// Build the regularization matrix `H = Lᵀ L` for a `width x height` kernel
/// grid.
pub fn regularization_matrix(
    width: usize,
    height: usize,
    order: usize,
    stencil: RegStencil,
    boundary: RegBoundary,
) -> Result<DMatrix<f64>, Error> {
    if order > 2 {
        return Err(Error::Config(format!(
            "regularization order must be 0, 1 or 2, got {order}"
        )));
    }
    if width < 1 || height < 1 {
        return Err(Error::Domain(format!(
            "regularization grid must be positive, got {width}x{height}"
        )));
    }

    let table = stencil_table(order, stencil);
    let n_pix = width * height;
    let w = width as i32;
    let h = height as i32;

    // The +1 leaves an empty row/column for the background term.
    let mut l = DMatrix::<f64>::zeros(n_pix + 1, n_pix + 1);

    for i in 0..n_pix {
        let x0 = (i % width) as i32;
        let y0 = (i / width) as i32;

        let x_edge = x0.min(w - x0 - 1);
        let y_edge = y0.min(h - y0 - 1);
        let edge_distance = x_edge.min(y_edge);

        for dx in 0..table.size {
            for dy in 0..table.size {
                let (x, y, coeff) = match boundary {
                    RegBoundary::Unwrapped => {
                        let x = x0 + dx as i32 - table.center as i32;
                        let y = y0 + dy as i32 - table.center as i32;
                        if x < 0 || x >= w || y < 0 || y >= h {
                            continue;
                        }
                        (x, y, table.coeffs[order][dx][dy])
                    }
                    RegBoundary::Wrapped => {
                        let x = (w + x0 + dx as i32 - table.center as i32) % w;
                        let y = (h + y0 + dy as i32 - table.center as i32) % h;
                        (x, y, table.coeffs[order][dx][dy])
                    }
                    RegBoundary::TaperedOrder => {
                        if edge_distance == 0 {
                            (x0, y0, 1.0)
                        } else if edge_distance == 1 && order > 0 {
                            let x = (w + x0 + dx as i32 - table.center1 as i32) % w;
                            let y = (h + y0 + dy as i32 - table.center1 as i32) % h;
                            let coeff = if dx < 3 && dy < 3 {
                                table.coeffs[1][dx][dy]
                            } else {
                                0.0
                            };
                            (x, y, coeff)
                        } else if edge_distance == 2 && order > 1 {
                            let x = (w + x0 + dx as i32 - table.center2 as i32) % w;
                            let y = (h + y0 + dy as i32 - table.center2 as i32) % h;
                            (x, y, table.coeffs[2][dx][dy])
                        } else if edge_distance > order as i32 {
                            let x = (w + x0 + dx as i32 - table.center as i32) % w;
                            let y = (h + y0 + dy as i32 - table.center as i32) % h;
                            (x, y, table.coeffs[order][dx][dy])
                        } else {
                            continue;
                        }
                    }
                };
                l[(i, (y * w + x) as usize)] = coeff;
            }
        }
    }

    Ok(l.transpose() * &l)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use nalgebra::DMatrix;

    use super::{regularization_matrix, RegBoundary, RegStencil};
    use crate::error::Error;

    fn assert_symmetric(h: &DMatrix<f64>) {
        for i in 0..h.nrows() {
            for j in 0..i {
                assert_abs_diff_eq!(h[(i, j)], h[(j, i)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn size_and_empty_background_row() {
        let h = regularization_matrix(5, 5, 1, RegStencil::Forward, RegBoundary::Wrapped).unwrap();
        assert_eq!(h.nrows(), 26);
        assert_eq!(h.ncols(), 26);
        for j in 0..26 {
            assert_eq!(h[(25, j)], 0.0);
            assert_eq!(h[(j, 25)], 0.0);
        }
    }

    #[test]
    fn symmetric_positive_semidefinite() {
        for &stencil in &[RegStencil::Forward, RegStencil::Central] {
            for &boundary in &[
                RegBoundary::Unwrapped,
                RegBoundary::Wrapped,
                RegBoundary::TaperedOrder,
            ] {
                for order in 0..=2 {
                    let h = regularization_matrix(4, 4, order, stencil, boundary).unwrap();
                    assert_symmetric(&h);
                    // H = L^T L has non-negative diagonal.
                    for i in 0..h.nrows() {
                        assert!(h[(i, i)] >= -1e-12);
                    }
                }
            }
        }
    }

    #[test]
    fn wrapped_order0_operator_rows_sum_to_zero() {
        // Test against L itself via H 1 = L^T L 1 = 0 when every row of L
        // sums to zero.
        let h = regularization_matrix(4, 4, 0, RegStencil::Forward, RegBoundary::Wrapped).unwrap();
        let ones = nalgebra::DVector::from_element(16, 1.0);
        let h_interior = h.view((0, 0), (16, 16)).into_owned();
        let product = h_interior * ones;
        for v in product.iter() {
            assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(matches!(
            regularization_matrix(4, 4, 3, RegStencil::Forward, RegBoundary::Wrapped),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            regularization_matrix(0, 4, 1, RegStencil::Forward, RegBoundary::Wrapped),
            Err(Error::Domain(_))
        ));
    }
}
