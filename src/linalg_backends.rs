// src/linalg_backends.rs

#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

// --- Common imports needed by multiple sections ---
use ndarray::{Array1, Array2, ArrayView2, Axis};
use float_cmp::{ApproxEq, F64Margin};
use std::error::Error;
use std::marker::PhantomData;

/// Error type returned by the backends, so it can cross threads if a caller needs it to.
pub type BackendError = Box<dyn Error + Send + Sync + 'static>;

// --- Trait Definitions ---

/// Output of a symmetric eigendecomposition.
#[derive(Debug)]
pub struct EighOutput<F: 'static> {
    /// Eigenvalues, typically sorted in ascending order.
    pub eigenvalues: Array1<F>,
    /// Eigenvectors as columns of the matrix.
    /// eigenvectors.column(i) corresponds to eigenvalues[i].
    pub eigenvectors: Array2<F>,
}

/// Trait for symmetric eigendecomposition (similar to LAPACK's DSYEVD).
/// Implementers will typically expect `matrix` to be symmetric.
pub trait BackendEigh<F: 'static + Copy + Send + Sync> {
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, BackendError>;
}

/// Output of a Singular Value Decomposition.
#[derive(Debug)]
pub struct SVDOutput<F: 'static> {
    pub u: Option<Array2<F>>,
    pub s: Array1<F>,
    pub vt: Option<Array2<F>>,
}

/// Trait for Singular Value Decomposition.
pub trait BackendSVD<F: 'static + Copy + Send + Sync> {
    fn svd_into(&self, matrix: Array2<F>, compute_u: bool, compute_v: bool) -> Result<SVDOutput<F>, BackendError>;
}

// --- NdarrayLinAlgBackend Implementation ---
use ndarray_linalg::{Eigh as NdLinalgEigh, SVDInto as NdLinalgSVDInto, UPLO};

/// LAPACK-backed implementation through `ndarray-linalg`.
#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

fn to_dyn_error<E: Error + Send + Sync + 'static>(e: E) -> BackendError {
    Box::new(e)
}

impl BackendEigh<f64> for NdarrayLinAlgBackend {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput<f64>, BackendError> {
        if matrix.nrows() != matrix.ncols() {
            return Err(format!(
                "Matrix must be square for eigendecomposition, got {}x{}.",
                matrix.nrows(),
                matrix.ncols()
            )
            .into());
        }
        let (eigenvalues, eigenvectors) = matrix.eigh(UPLO::Upper).map_err(to_dyn_error)?;
        Ok(EighOutput { eigenvalues, eigenvectors })
    }
}

impl BackendSVD<f64> for NdarrayLinAlgBackend {
    fn svd_into(&self, matrix: Array2<f64>, compute_u: bool, compute_v: bool) -> Result<SVDOutput<f64>, BackendError> {
        let (u, s, vt) = matrix.svd_into(compute_u, compute_v).map_err(to_dyn_error)?;
        Ok(SVDOutput { u, s, vt })
    }
}

// --- FaerLinAlgBackend Implementation ---
#[cfg(feature = "backend_faer")]
mod faer_specific_code {
    use super::{BackendEigh, BackendError, BackendSVD, EighOutput, SVDOutput};
    use ndarray::{Array1, Array2};

    /// Pure-Rust implementation through `faer`.
    #[derive(Debug, Default, Copy, Clone)]
    pub struct FaerLinAlgBackend;

    fn ndarray_to_faer(matrix: &Array2<f64>) -> faer::Mat<f64> {
        faer::Mat::from_fn(matrix.nrows(), matrix.ncols(), |i, j| matrix[[i, j]])
    }

    fn faer_to_ndarray(matrix: faer::MatRef<'_, f64>) -> Array2<f64> {
        Array2::from_shape_fn((matrix.nrows(), matrix.ncols()), |(i, j)| matrix[(i, j)])
    }

    fn faer_col_to_ndarray(col: faer::ColRef<'_, f64>) -> Array1<f64> {
        Array1::from_shape_fn(col.nrows(), |i| col[i])
    }

    impl BackendEigh<f64> for FaerLinAlgBackend {
        fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput<f64>, BackendError> {
            if matrix.nrows() != matrix.ncols() {
                return Err("Matrix must be square for eigendecomposition.".into());
            }
            if matrix.is_empty() {
                return Ok(EighOutput { eigenvalues: Array1::zeros(0), eigenvectors: Array2::zeros((0, 0)) });
            }
            let faer_mat = ndarray_to_faer(matrix);
            let eig = faer_mat
                .as_ref()
                .self_adjoint_eigen(faer::Side::Upper)
                .map_err(|e| -> BackendError { format!("Faer eigendecomposition failed: {:?}", e).into() })?;
            Ok(EighOutput {
                eigenvalues: faer_col_to_ndarray(eig.S().column_vector()),
                eigenvectors: faer_to_ndarray(eig.U()),
            })
        }
    }

    impl BackendSVD<f64> for FaerLinAlgBackend {
        fn svd_into(&self, matrix: Array2<f64>, compute_u: bool, compute_v: bool) -> Result<SVDOutput<f64>, BackendError> {
            let (nrows, ncols) = matrix.dim();
            if matrix.is_empty() {
                let k_dim = nrows.min(ncols);
                return Ok(SVDOutput {
                    u: if compute_u { Some(Array2::zeros((nrows, k_dim))) } else { None },
                    s: Array1::zeros(k_dim),
                    vt: if compute_v { Some(Array2::zeros((k_dim, ncols))) } else { None },
                });
            }
            let faer_mat = ndarray_to_faer(&matrix);
            let svd = faer_mat
                .as_ref()
                .thin_svd()
                .map_err(|e| -> BackendError { format!("Faer SVD computation failed: {:?}", e).into() })?;

            let s = faer_col_to_ndarray(svd.S().column_vector());
            let u = if compute_u { Some(faer_to_ndarray(svd.U())) } else { None };
            let vt = if compute_v { Some(faer_to_ndarray(svd.V()).t().to_owned()) } else { None };
            Ok(SVDOutput { u, s, vt })
        }
    }
}

#[cfg(feature = "backend_faer")]
pub use self::faer_specific_code::FaerLinAlgBackend;

// --- LinAlgBackendProvider Dispatch ---

impl BackendEigh<f64> for LinAlgBackendProvider<f64> {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput<f64>, BackendError> {
        #[cfg(feature = "backend_faer")]
        {
            faer_specific_code::FaerLinAlgBackend.eigh_upper(matrix)
        }
        #[cfg(not(feature = "backend_faer"))]
        {
            NdarrayLinAlgBackend.eigh_upper(matrix)
        }
    }
}

impl BackendSVD<f64> for LinAlgBackendProvider<f64> {
    fn svd_into(&self, matrix: Array2<f64>, compute_u: bool, compute_v: bool) -> Result<SVDOutput<f64>, BackendError> {
        #[cfg(feature = "backend_faer")]
        {
            faer_specific_code::FaerLinAlgBackend.svd_into(matrix, compute_u, compute_v)
        }
        #[cfg(not(feature = "backend_faer"))]
        {
            NdarrayLinAlgBackend.svd_into(matrix, compute_u, compute_v)
        }
    }
}

// --- Derived routines used by the PLS fit ---

/// Leading eigenpair of a symmetric matrix, see [`dominant_eigenvector`].
#[derive(Debug, Clone)]
pub struct DominantEigenpair {
    pub eigenvalue: f64,
    /// Unit-norm eigenvector with its largest-magnitude entry positive.
    pub eigenvector: Array1<f64>,
    /// True when the runner-up eigenvalue equals the leading one to within
    /// rounding, i.e. the leading eigenspace has dimension > 1 and the choice
    /// of vector inside it is the backend's.
    pub degenerate: bool,
}

/// Leading eigenpair of a symmetric matrix.
///
/// The eigenpairs are sorted by descending eigenvalue with a stable sort, so
/// exactly repeated eigenvalues keep the backend's order and the first one wins.
/// The returned vector is renormalised to unit length and its sign is pinned so
/// that the entry of largest magnitude (first index on ties) is positive.
pub fn dominant_eigenvector<B>(backend: &B, symmetric: &Array2<f64>) -> Result<DominantEigenpair, BackendError>
where
    B: BackendEigh<f64>,
{
    if symmetric.is_empty() {
        return Err("Cannot take the dominant eigenvector of an empty matrix.".into());
    }
    let EighOutput { eigenvalues, eigenvectors } = backend.eigh_upper(symmetric)?;
    if eigenvalues.iter().any(|v| !v.is_finite()) {
        return Err("Eigendecomposition produced non-finite eigenvalues.".into());
    }

    let mut order: Vec<usize> = (0..eigenvalues.len()).collect();
    order.sort_by(|&a, &b| {
        eigenvalues[b]
            .partial_cmp(&eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let top = order[0];
    let eigenvalue = eigenvalues[top];

    let degenerate = order.get(1).is_some_and(|&second| {
        let margin = F64Margin { epsilon: 1e-12 * eigenvalue.abs(), ulps: 64 };
        eigenvalue.approx_eq(eigenvalues[second], margin)
    });

    let mut eigenvector = eigenvectors.column(top).to_owned();
    let norm = eigenvector.dot(&eigenvector).sqrt();
    if !norm.is_finite() || norm <= f64::EPSILON {
        return Err(format!("Leading eigenvector has degenerate norm {:e}.", norm).into());
    }
    eigenvector /= norm;
    canonicalize_sign(&mut eigenvector);
    Ok(DominantEigenpair { eigenvalue, eigenvector, degenerate })
}

/// Flips `vector` so that its largest-magnitude entry is positive.
pub fn canonicalize_sign(vector: &mut Array1<f64>) {
    let mut pivot = 0usize;
    let mut best = 0.0f64;
    for (i, v) in vector.iter().enumerate() {
        if v.abs() > best {
            best = v.abs();
            pivot = i;
        }
    }
    if best > 0.0 && vector[pivot] < 0.0 {
        vector.mapv_inplace(|v| -v);
    }
}

/// Inverse of a square matrix through its SVD, refusing ill-conditioned input.
///
/// Returns the inverse together with the 2-norm condition number `s_max / s_min`.
/// Fails when a singular value is non-finite or `s_min <= tolerance * s_max`.
pub fn checked_inverse<B>(backend: &B, square: ArrayView2<f64>, tolerance: f64) -> Result<(Array2<f64>, f64), BackendError>
where
    B: BackendSVD<f64>,
{
    let (rows, cols) = square.dim();
    if rows != cols || rows == 0 {
        return Err(format!("Cannot invert a {}x{} matrix.", rows, cols).into());
    }
    if square.iter().any(|v| !v.is_finite()) {
        return Err(format!("Matrix to invert ({}x{}) contains non-finite entries.", rows, cols).into());
    }

    let SVDOutput { u, s, vt } = backend.svd_into(square.to_owned(), true, true)?;
    let u = u.ok_or("SVD backend did not return U.")?;
    let vt = vt.ok_or("SVD backend did not return V^T.")?;

    let s_max = s.iter().cloned().fold(0.0f64, f64::max);
    let s_min = s.iter().cloned().fold(f64::INFINITY, f64::min);
    if !s_max.is_finite() || s_max <= 0.0 || s_min <= tolerance * s_max {
        return Err(format!(
            "Matrix ({}x{}) is singular or ill-conditioned: smallest singular value {:e}, largest {:e}.",
            rows, cols, s_min, s_max
        )
        .into());
    }
    let condition_number = s_max / s_min;

    // A^{-1} = V diag(1/s) U^T
    let mut v_scaled = vt.t().to_owned();
    for (mut column, &sigma) in v_scaled.axis_iter_mut(Axis(1)).zip(s.iter()) {
        column /= sigma;
    }
    Ok((v_scaled.dot(&u.t()), condition_number))
}
