// src/diagnostics.rs

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Quality report attached to every fitted model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitDiagnostics {
    /// Rank requested by the caller.
    pub requested_rank: usize,
    /// Rank actually reached. Equal to `requested_rank` in sample mode; the
    /// population variant may stop earlier.
    pub achieved_rank: usize,

    // --- Per-component metrics ---
    /// Leading eigenvalue of the (residual) cross-covariance Gram matrix at each
    /// step, i.e. the squared covariance captured by that direction.
    pub component_eigenvalues: Vec<f64>,
    /// Zero-based indices of components whose leading eigenvalue was tied.
    pub tied_components: Vec<usize>,
    /// Zero-based indices of sample-mode components taken from the residual
    /// predictor covariance because the response covariance was exhausted.
    pub fallback_components: Vec<usize>,

    // --- Whole-fit metrics ---
    /// ||W^T W - I||_F over the accumulated weight columns.
    pub orthogonality_error: f64,
    /// 2-norm condition number of the matrix inverted to form the coefficients.
    pub inner_condition_number: f64,
    /// True when the population variant hit its stopping rule before the requested rank.
    pub stopped_early: bool,
}

/// Frobenius norm of an f64 matrix.
pub fn compute_frob_norm_f64(matrix: &ArrayView2<f64>) -> f64 {
    matrix.iter().map(|&x| x * x).sum::<f64>().sqrt()
}

/// Computes orthogonality error ||I - Q^T Q||_F for an f64 matrix.
///
/// Returns `None` for an empty matrix.
pub fn compute_orthogonality_error_f64(q_matrix: &ArrayView2<f64>) -> Option<f64> {
    if q_matrix.nrows() == 0 || q_matrix.ncols() == 0 {
        return None;
    }
    let qtq = q_matrix.t().dot(q_matrix);
    let identity = Array2::<f64>::eye(qtq.nrows());
    let diff = identity - qtq;
    Some(compute_frob_norm_f64(&diff.view()))
}
