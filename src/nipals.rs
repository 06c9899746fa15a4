// Partial least squares regression through NIPALS deflation

use crate::diagnostics::{compute_frob_norm_f64, compute_orthogonality_error_f64, FitDiagnostics};
use crate::linalg_backends::{checked_inverse, dominant_eigenvector, BackendError, LinAlgBackendProvider};
use log::{debug, info, trace, warn};
use ndarray::{s, Array1, Array2, ArrayBase, ArrayView2, Axis, Data, Dimension, Ix2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while fitting or applying a NIPALS model.
#[derive(Error, Debug)]
pub enum NipalsError {
    /// Malformed call: unknown version, wrong dimensionality, mismatched shapes,
    /// rank out of range or non-finite input. Always detected before any numeric work.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A required inverse was singular or ill-conditioned, or an eigendecomposition failed.
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    #[error("NIPALS model is not fitted. Run `fit` before calling this function.")]
    NotFitted,
}

fn invalid(msg: impl Into<String>) -> NipalsError {
    NipalsError::InvalidArgument(msg.into())
}

fn unstable(context: impl fmt::Display, err: BackendError) -> NipalsError {
    NipalsError::NumericalInstability(format!("{}: {}", context, err))
}

/// Which form of the algorithm to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlsVersion {
    /// Empirical NIPALS/PLS2 on the data, deflating X and Y after every component.
    Sample,
    /// Projection form driven by the covariance matrices `Σ_X` and `Σ_XY`.
    /// Experimental: it is not reconciled with the sample form beyond sharing
    /// its first weight.
    Population,
}

impl PlsVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlsVersion::Sample => "sample",
            PlsVersion::Population => "population",
        }
    }
}

impl fmt::Display for PlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlsVersion {
    type Err = NipalsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sample" => Ok(PlsVersion::Sample),
            "population" => Ok(PlsVersion::Population),
            other => Err(invalid(format!(
                "version must be 'sample' or 'population', not '{}'.",
                other
            ))),
        }
    }
}

/// Numerical thresholds used by the fit.
#[derive(Debug, Clone)]
pub struct NipalsConfig {
    /// An inverse is refused when `s_min <= singular_tolerance * s_max`.
    pub singular_tolerance: f64,
    /// Sample mode: a step whose leading cross-covariance eigenvalue is at most
    /// this fraction of the first step's counts as response-exhausted. Eigenvalues
    /// at the rounding level of `X^T Y / n` count as exhausted regardless.
    pub exhaustion_tolerance: f64,
    /// Population mode: stop once every entry of the residual cross-covariance
    /// is at most this in magnitude.
    pub population_stop_tolerance: f64,
}

impl Default for NipalsConfig {
    fn default() -> Self {
        Self {
            singular_tolerance: 1e-12,
            exhaustion_tolerance: 1e-20,
            population_stop_tolerance: 1e-10,
        }
    }
}

/// An immutable fitted PLS model.
///
/// Weights `W` are `p x q` with unit-norm, mutually orthogonal columns ordered by
/// explained covariance. Coefficients `beta` are `p x r`, mapping predictors to
/// responses.
#[derive(Debug, Clone)]
pub struct NipalsModel {
    version: PlsVersion,
    weights: Array2<f64>,
    coefficients: Array2<f64>,
    /// Sample mode only: `p x q`, `r x q` and `n x q`.
    x_loadings: Option<Array2<f64>>,
    y_loadings: Option<Array2<f64>>,
    scores: Option<Array2<f64>>,
    diagnostics: FitDiagnostics,
}

impl NipalsModel {
    /// Fits a model on the predictor block `x` (`n x p`) and response block `y` (`n x r`)
    /// with `q` components.
    ///
    /// The caller is responsible for any centring or scaling.
    ///
    /// # Errors
    /// `InvalidArgument` for mismatched row counts, empty input, `q` outside `[1, p]`
    /// or non-finite entries; `NumericalInstability` when a decomposition fails, the
    /// predictor residual runs out of rank before `q` components, or the matrix
    /// inverted for the coefficients is singular.
    pub fn fit(
        x: ArrayView2<f64>,
        y: ArrayView2<f64>,
        q: usize,
        version: PlsVersion,
        config: &NipalsConfig,
    ) -> Result<Self, NipalsError> {
        validate_training_blocks(&x, &y, q)?;
        info!(
            "Fitting {} NIPALS: X is {}x{}, Y is {}x{}, q = {}.",
            version,
            x.nrows(),
            x.ncols(),
            y.nrows(),
            y.ncols(),
            q
        );
        let model = match version {
            PlsVersion::Sample => fit_sample(x, y, q, config)?,
            PlsVersion::Population => {
                let n = x.nrows() as f64;
                let sigma_x = x.t().dot(&x) / n;
                let sigma_xy = x.t().dot(&y) / n;
                fit_population(sigma_x.view(), sigma_xy.view(), q, config)?
            }
        };
        info!(
            "NIPALS fit finished at rank {} (orthogonality error {:e}, inner condition number {:e}).",
            model.rank(),
            model.diagnostics.orthogonality_error,
            model.diagnostics.inner_condition_number
        );
        Ok(model)
    }

    /// Population fit from known covariances `sigma_x` (`p x p`, symmetric) and
    /// `sigma_xy` (`p x r`).
    pub fn fit_covariances(
        sigma_x: ArrayView2<f64>,
        sigma_xy: ArrayView2<f64>,
        q: usize,
        config: &NipalsConfig,
    ) -> Result<Self, NipalsError> {
        let p = sigma_x.nrows();
        if sigma_x.ncols() != p {
            return Err(invalid(format!(
                "sigma_x must be square. Current shape: {:?}.",
                sigma_x.shape()
            )));
        }
        if sigma_xy.nrows() != p {
            return Err(invalid(format!(
                "sigma_xy must have as many rows as sigma_x. Current shapes: {:?} and {:?}.",
                sigma_x.shape(),
                sigma_xy.shape()
            )));
        }
        if sigma_xy.ncols() == 0 {
            return Err(invalid("sigma_xy must have at least one column."));
        }
        check_rank(q, p)?;
        check_finite("sigma_x", &sigma_x)?;
        check_finite("sigma_xy", &sigma_xy)?;
        let scale = sigma_x.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        let asymmetric = sigma_x
            .indexed_iter()
            .any(|((i, j), &v)| (v - sigma_x[[j, i]]).abs() > 1e-10 * scale.max(1.0));
        if asymmetric {
            return Err(invalid("sigma_x must be symmetric."));
        }
        info!("Fitting population NIPALS from covariances: p = {}, r = {}, q = {}.", p, sigma_xy.ncols(), q);
        fit_population(sigma_x, sigma_xy, q, config)
    }

    /// Projects row-sample data `x` (`m x p`) through the fitted basis.
    ///
    /// Returns `(W^T x^T, beta^T x^T)`, of shapes `(q, m)` and `(r, m)`.
    pub fn transform(&self, x: ArrayView2<f64>) -> Result<(Array2<f64>, Array2<f64>), NipalsError> {
        self.check_features(&x)?;
        let projected = self.weights.t().dot(&x.t());
        let responses = self.coefficients.t().dot(&x.t());
        Ok((projected, responses))
    }

    /// Predicted responses `x · beta`, shape `(m, r)`.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, NipalsError> {
        self.check_features(&x)?;
        Ok(x.dot(&self.coefficients))
    }

    fn check_features(&self, x: &ArrayView2<f64>) -> Result<(), NipalsError> {
        if x.ncols() != self.n_features() {
            return Err(invalid(format!(
                "Input has {} columns but the model was fitted with {} features.",
                x.ncols(),
                self.n_features()
            )));
        }
        Ok(())
    }

    pub fn version(&self) -> PlsVersion {
        self.version
    }

    /// Number of components actually extracted.
    pub fn rank(&self) -> usize {
        self.weights.ncols()
    }

    pub fn n_features(&self) -> usize {
        self.weights.nrows()
    }

    pub fn n_responses(&self) -> usize {
        self.coefficients.ncols()
    }

    /// Weight basis `W`, `p x q`.
    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    /// Regression coefficients `beta`, `p x r`.
    pub fn coefficients(&self) -> &Array2<f64> {
        &self.coefficients
    }

    pub fn x_loadings(&self) -> Option<&Array2<f64>> {
        self.x_loadings.as_ref()
    }

    pub fn y_loadings(&self) -> Option<&Array2<f64>> {
        self.y_loadings.as_ref()
    }

    /// Training scores, one column per component.
    pub fn scores(&self) -> Option<&Array2<f64>> {
        self.scores.as_ref()
    }

    pub fn diagnostics(&self) -> &FitDiagnostics {
        &self.diagnostics
    }
}

/// Stateful PLS fitter.
///
/// Holds the model of the last successful fit (rank, weights, coefficients). A
/// failed fit leaves the previous state untouched.
///
/// # Examples
///
/// ```
/// use ndarray::array;
/// use nipals_pls::Nipals;
///
/// let x = array![[1.0, 0.2], [0.1, 1.1], [-0.9, -0.3], [-0.2, -1.0]];
/// let y = array![[1.1], [0.9], [-1.0], [-1.0]];
///
/// let mut pls = Nipals::new();
/// pls.fit(&x, &y, 2, "sample").unwrap();
/// let (scores, responses) = pls.transform(&x).unwrap();
/// assert_eq!(scores.dim(), (2, 4));
/// assert_eq!(responses.dim(), (1, 4));
/// ```
#[derive(Debug, Default)]
pub struct Nipals {
    model: Option<NipalsModel>,
    config: NipalsConfig,
}

impl Nipals {
    /// Creates an unfitted instance with default thresholds.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: NipalsConfig) -> Self {
        Self { config, ..Self::default() }
    }

    /// Fits this model to `x` (`n_samples x p_features`) and `y` (`n_samples x r_features`)
    /// using `q` projections. `version` is `"sample"` or `"population"`.
    ///
    /// Inputs of any dimensionality are accepted so that non-matrix input is
    /// reported as `InvalidArgument` rather than rejected at compile time.
    pub fn fit<S1, D1, S2, D2>(
        &mut self,
        x: &ArrayBase<S1, D1>,
        y: &ArrayBase<S2, D2>,
        q: usize,
        version: &str,
    ) -> Result<(), NipalsError>
    where
        S1: Data<Elem = f64>,
        D1: Dimension,
        S2: Data<Elem = f64>,
        D2: Dimension,
    {
        let version: PlsVersion = version.parse()?;
        if x.ndim() != 2 || y.ndim() != 2 {
            return Err(invalid(format!(
                "X and Y must be 2 dimensional. Current dimensions: {} and {}.",
                x.ndim(),
                y.ndim()
            )));
        }
        let x = as_matrix(x)?;
        let y = as_matrix(y)?;

        // Build first, assign only on success.
        self.model = Some(NipalsModel::fit(x, y, q, version, &self.config)?);
        Ok(())
    }

    /// Transforms `x` (`m x p`) with the fitted weights and coefficients.
    ///
    /// Returns the `W` and `beta` transformed data, respectively.
    pub fn transform<S, D>(&self, x: &ArrayBase<S, D>) -> Result<(Array2<f64>, Array2<f64>), NipalsError>
    where
        S: Data<Elem = f64>,
        D: Dimension,
    {
        let model = self.fitted()?;
        if x.ndim() != 2 {
            return Err(invalid(format!(
                "X must be 2 dimensional. Current dimension: {}.",
                x.ndim()
            )));
        }
        model.transform(as_matrix(x)?)
    }

    /// Predicted responses for `x` (`m x p`), shape `(m, r)`.
    pub fn predict<S, D>(&self, x: &ArrayBase<S, D>) -> Result<Array2<f64>, NipalsError>
    where
        S: Data<Elem = f64>,
        D: Dimension,
    {
        let model = self.fitted()?;
        model.predict(as_matrix(x)?)
    }

    fn fitted(&self) -> Result<&NipalsModel, NipalsError> {
        self.model.as_ref().ok_or(NipalsError::NotFitted)
    }

    /// Rank reached by the last fit, if any.
    pub fn q(&self) -> Option<usize> {
        self.model.as_ref().map(NipalsModel::rank)
    }

    pub fn weights(&self) -> Option<&Array2<f64>> {
        self.model.as_ref().map(NipalsModel::weights)
    }

    pub fn coefficients(&self) -> Option<&Array2<f64>> {
        self.model.as_ref().map(NipalsModel::coefficients)
    }

    /// The full fitted model, including loadings, scores and diagnostics.
    pub fn model(&self) -> Option<&NipalsModel> {
        self.model.as_ref()
    }

    /// Drops the fitted state and hands back the model.
    pub fn into_model(self) -> Option<NipalsModel> {
        self.model
    }
}

// --- Validation ---

fn as_matrix<'a, S, D>(a: &'a ArrayBase<S, D>) -> Result<ArrayView2<'a, f64>, NipalsError>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    let ndim = a.ndim();
    a.view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| invalid(format!("Expected a 2 dimensional array, got {} dimension(s).", ndim)))
}

fn check_rank(q: usize, p: usize) -> Result<(), NipalsError> {
    if q < 1 || q > p {
        return Err(invalid(format!(
            "q should be between 1 and X's second dimension. Currently {} and {}.",
            q, p
        )));
    }
    Ok(())
}

fn check_finite(name: &str, a: &ArrayView2<f64>) -> Result<(), NipalsError> {
    if let Some(((i, j), v)) = a.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(invalid(format!("{} contains a non-finite value {} at ({}, {}).", name, v, i, j)));
    }
    Ok(())
}

fn validate_training_blocks(x: &ArrayView2<f64>, y: &ArrayView2<f64>, q: usize) -> Result<(), NipalsError> {
    if x.nrows() != y.nrows() {
        return Err(invalid(format!(
            "X and Y must have the same first dimension. Current shapes: {:?} and {:?}.",
            x.shape(),
            y.shape()
        )));
    }
    if x.nrows() == 0 {
        return Err(invalid("X and Y must have at least one row."));
    }
    if y.ncols() == 0 {
        return Err(invalid("Y must have at least one column."));
    }
    check_rank(q, x.ncols())?;
    check_finite("X", x)?;
    check_finite("Y", y)?;
    Ok(())
}

// --- Sample mode ---

fn fit_sample(
    x: ArrayView2<f64>,
    y: ArrayView2<f64>,
    q: usize,
    config: &NipalsConfig,
) -> Result<NipalsModel, NipalsError> {
    let backend = LinAlgBackendProvider::<f64>::new();
    let (n, p) = x.dim();
    let r = y.ncols();
    let n_f64 = n as f64;

    let mut cur_x = x.to_owned();
    let mut cur_y = y.to_owned();

    let mut weights = Array2::<f64>::zeros((p, q));
    let mut x_loadings = Array2::<f64>::zeros((p, q));
    let mut y_loadings = Array2::<f64>::zeros((r, q));
    let mut scores = Array2::<f64>::zeros((n, q));

    let mut diagnostics = FitDiagnostics {
        requested_rank: q,
        achieved_rank: q,
        ..FitDiagnostics::default()
    };
    // Below this squared norm a score vector is indistinguishable from rounding noise.
    let score_floor = (1e3 * f64::EPSILON * compute_frob_norm_f64(&x)).powi(2);
    // Cross-covariance eigenvalues at or below this are rounding noise, whatever the first step saw.
    let noise_floor =
        (1e3 * f64::EPSILON * compute_frob_norm_f64(&x) * compute_frob_norm_f64(&y) / n_f64).powi(2);
    let mut first_eigenvalue: Option<f64> = None;

    for d in 0..q {
        // Empirical cross-covariance and its Gram form
        let cross_cov = cur_x.t().dot(&cur_y) / n_f64;
        let gram = cross_cov.dot(&cross_cov.t());
        let pair = dominant_eigenvector(&backend, &gram)
            .map_err(|e| unstable(format!("component {}: eigendecomposition of the cross-covariance Gram matrix failed", d + 1), e))?;

        let reference = *first_eigenvalue.get_or_insert(pair.eigenvalue);
        let exhausted = pair.eigenvalue <= (config.exhaustion_tolerance * reference).max(noise_floor);
        let weight = if exhausted {
            warn!(
                "Component {}: response covariance exhausted (eigenvalue {:e}); taking the leading direction of the residual X instead.",
                d + 1,
                pair.eigenvalue
            );
            diagnostics.fallback_components.push(d);
            let x_cov = cur_x.t().dot(&cur_x) / n_f64;
            dominant_eigenvector(&backend, &x_cov)
                .map_err(|e| unstable(format!("component {}: eigendecomposition of the residual X covariance failed", d + 1), e))?
                .eigenvector
        } else {
            if pair.degenerate {
                debug!("Component {}: leading eigenvalue {:e} is repeated; eigenvector choice follows the backend order.", d + 1, pair.eigenvalue);
                diagnostics.tied_components.push(d);
            }
            pair.eigenvector
        };

        let score = cur_x.dot(&weight);
        let score_sq = score.dot(&score);
        if !score_sq.is_finite() || score_sq <= score_floor {
            return Err(NipalsError::NumericalInstability(format!(
                "component {}: score vector is numerically zero (squared norm {:e}); the residual X has rank below q = {}.",
                d + 1,
                score_sq,
                q
            )));
        }

        let x_load: Array1<f64> = cur_x.t().dot(&score) / score_sq;
        let y_load: Array1<f64> = cur_y.t().dot(&score) / score_sq;

        // Deflation
        let score_col = score.view().insert_axis(Axis(1));
        cur_x -= &score_col.dot(&x_load.view().insert_axis(Axis(0)));
        cur_y -= &score_col.dot(&y_load.view().insert_axis(Axis(0)));

        debug!(
            "Component {}: eigenvalue {:e}, score norm {:e}, |x_load| {:e}, |y_load| {:e}.",
            d + 1,
            pair.eigenvalue,
            score_sq.sqrt(),
            x_load.dot(&x_load).sqrt(),
            y_load.dot(&y_load).sqrt()
        );

        weights.column_mut(d).assign(&weight);
        x_loadings.column_mut(d).assign(&x_load);
        y_loadings.column_mut(d).assign(&y_load);
        scores.column_mut(d).assign(&score);
        diagnostics.component_eigenvalues.push(pair.eigenvalue);
    }

    // beta = W (P^T W)^{-1} Q^T
    let inner = x_loadings.t().dot(&weights);
    let (inner_inv, condition_number) = checked_inverse(&backend, inner.view(), config.singular_tolerance)
        .map_err(|e| unstable("inverting X-loadings^T W for the coefficients", e))?;
    trace!("X-loadings^T W condition number: {:e}", condition_number);
    let coefficients = weights.dot(&inner_inv).dot(&y_loadings.t());
    check_coefficients(&coefficients)?;

    diagnostics.inner_condition_number = condition_number;
    diagnostics.orthogonality_error = compute_orthogonality_error_f64(&weights.view()).unwrap_or(0.0);

    Ok(NipalsModel {
        version: PlsVersion::Sample,
        weights,
        coefficients,
        x_loadings: Some(x_loadings),
        y_loadings: Some(y_loadings),
        scores: Some(scores),
        diagnostics,
    })
}

// --- Population mode ---

fn fit_population(
    sigma_x: ArrayView2<f64>,
    sigma_xy: ArrayView2<f64>,
    q: usize,
    config: &NipalsConfig,
) -> Result<NipalsModel, NipalsError> {
    let backend = LinAlgBackendProvider::<f64>::new();
    let p = sigma_x.nrows();

    let mut weights = Array2::<f64>::zeros((p, q));
    let mut diagnostics = FitDiagnostics {
        requested_rank: q,
        ..FitDiagnostics::default()
    };

    let xy_gram = sigma_xy.dot(&sigma_xy.t());
    let first = dominant_eigenvector(&backend, &xy_gram)
        .map_err(|e| unstable("component 1: eigendecomposition of Σ_XY Σ_XY^T failed", e))?;
    if first.degenerate {
        diagnostics.tied_components.push(0);
    }
    weights.column_mut(0).assign(&first.eigenvector);
    diagnostics.component_eigenvalues.push(first.eigenvalue);
    let mut rank = 1;

    while rank < q {
        let w = weights.slice(s![.., ..rank]);
        // P = W (W^T Σ_X W)^{-1} W^T Σ_X projects onto span(W) in the Σ_X inner product.
        let w_sigma_w = w.t().dot(&sigma_x).dot(&w);
        let (w_sigma_w_inv, _) = checked_inverse(&backend, w_sigma_w.view(), config.singular_tolerance)
            .map_err(|e| unstable(format!("rank {}: inverting W^T Σ_X W", rank), e))?;
        let projection = w.dot(&w_sigma_w_inv).dot(&w.t()).dot(&sigma_x);
        let complement = Array2::<f64>::eye(p) - &projection;

        let residual = complement.t().dot(&sigma_xy);
        if residual.iter().all(|v| v.abs() <= config.population_stop_tolerance) {
            warn!(
                "Population NIPALS: residual cross-covariance vanished at rank {} (requested {}).",
                rank, q
            );
            diagnostics.stopped_early = true;
            break;
        }

        let gram = residual.dot(&residual.t());
        let next = dominant_eigenvector(&backend, &gram)
            .map_err(|e| unstable(format!("component {}: eigendecomposition of the residual Gram matrix failed", rank + 1), e))?;
        if next.degenerate {
            diagnostics.tied_components.push(rank);
        }
        debug!("Component {}: eigenvalue {:e}.", rank + 1, next.eigenvalue);
        weights.column_mut(rank).assign(&next.eigenvector);
        diagnostics.component_eigenvalues.push(next.eigenvalue);
        rank += 1;
    }

    let weights = weights.slice(s![.., ..rank]).to_owned();

    // beta = W (W^T Σ_X W)^{-1} W^T Σ_XY
    let inner = weights.t().dot(&sigma_x).dot(&weights);
    let (inner_inv, condition_number) = checked_inverse(&backend, inner.view(), config.singular_tolerance)
        .map_err(|e| unstable("inverting W^T Σ_X W for the coefficients", e))?;
    trace!("W^T Σ_X W condition number: {:e}", condition_number);
    let coefficients = weights.dot(&inner_inv).dot(&weights.t()).dot(&sigma_xy);
    check_coefficients(&coefficients)?;

    diagnostics.achieved_rank = rank;
    diagnostics.inner_condition_number = condition_number;
    diagnostics.orthogonality_error = compute_orthogonality_error_f64(&weights.view()).unwrap_or(0.0);

    Ok(NipalsModel {
        version: PlsVersion::Population,
        weights,
        coefficients,
        x_loadings: None,
        y_loadings: None,
        scores: None,
        diagnostics,
    })
}

fn check_coefficients(coefficients: &Array2<f64>) -> Result<(), NipalsError> {
    if coefficients.iter().any(|v| !v.is_finite()) {
        return Err(NipalsError::NumericalInstability(format!(
            "regression coefficients ({}x{}) contain non-finite values.",
            coefficients.nrows(),
            coefficients.ncols()
        )));
    }
    Ok(())
}
