//! Host-side dense linear algebra for the small `dim x dim` mixing matrices.
//!
//! Burn has no LU or matrix inverse, so these run on the CPU in `f64`
//! through nalgebra and are moved back onto the device afterwards.

use nalgebra::DMatrix;

use crate::errors::FlowError;

/// Pivot magnitude below which a matrix is treated as singular.
const SINGULAR_EPS: f64 = 1e-12;

/// Row-major PLU factors of a square matrix, `W = P * L * (U + diag(sign * exp(log_s)))`.
#[derive(Debug, Clone)]
pub struct PluFactors {
    pub permutation: Vec<f32>,
    pub lower: Vec<f32>,
    pub upper: Vec<f32>,
    pub sign: Vec<f32>,
    pub log_s: Vec<f32>,
}

fn to_row_major(matrix: &DMatrix<f64>) -> Vec<f32> {
    let (rows, cols) = matrix.shape();
    (0..rows)
        .flat_map(|i| (0..cols).map(move |j| matrix[(i, j)] as f32))
        .collect()
}

fn from_row_major(values: &[f32], dim: usize) -> Result<DMatrix<f64>, FlowError> {
    if values.len() != dim * dim {
        return Err(FlowError::ShapeMismatch {
            context: "square matrix",
            expected: dim * dim,
            actual: values.len(),
        });
    }
    let values: Vec<f64> = values.iter().map(|&v| f64::from(v)).collect();
    Ok(DMatrix::from_row_slice(dim, dim, &values))
}

/// Orthogonalizes a `dim x dim` matrix of samples with a QR decomposition.
pub fn orthogonal_from_samples(samples: &[f32], dim: usize) -> Result<DMatrix<f64>, FlowError> {
    Ok(from_row_major(samples, dim)?.qr().q())
}

/// Factors `matrix` into the PLU form used by the invertible linear mix.
pub fn plu_factors(matrix: DMatrix<f64>) -> Result<PluFactors, FlowError> {
    let dim = matrix.nrows();
    let (p, l, u) = matrix.lu().unpack();

    // `lu` gives P * A = L * U, so A = P^-1 * L * U.
    let mut permutation = DMatrix::<f64>::identity(dim, dim);
    p.inv_permute_rows(&mut permutation);

    let diagonal = u.diagonal();
    if diagonal.iter().any(|d| d.abs() < SINGULAR_EPS) {
        return Err(FlowError::SingularMatrix);
    }

    Ok(PluFactors {
        permutation: to_row_major(&permutation),
        lower: to_row_major(&l),
        upper: to_row_major(&u),
        sign: diagonal.iter().map(|d| d.signum() as f32).collect(),
        log_s: diagonal.iter().map(|d| d.abs().ln() as f32).collect(),
    })
}

/// Inverts a row-major square matrix.
pub fn invert(values: &[f32], dim: usize) -> Result<Vec<f32>, FlowError> {
    let matrix = from_row_major(values, dim)?;
    let inverse = matrix.try_inverse().ok_or(FlowError::SingularMatrix)?;
    Ok(to_row_major(&inverse))
}

/// `log |det|` of a row-major square matrix.
pub fn log_abs_det(values: &[f32], dim: usize) -> Result<f64, FlowError> {
    Ok(from_row_major(values, dim)?.determinant().abs().ln())
}

/// Row-major strictly lower (`below = true`) or strictly upper triangular mask.
pub fn strict_triangle(dim: usize, below: bool) -> Vec<f32> {
    (0..dim)
        .flat_map(|i| {
            (0..dim).map(move |j| {
                let keep = if below { i > j } else { i < j };
                if keep { 1.0 } else { 0.0 }
            })
        })
        .collect()
}

/// Row-major identity matrix.
pub fn identity(dim: usize) -> Vec<f32> {
    (0..dim)
        .flat_map(|i| (0..dim).map(move |j| if i == j { 1.0 } else { 0.0 }))
        .collect()
}
