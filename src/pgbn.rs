// src/pgbn.rs
//
// Poisson Gamma Belief Network: a deep gamma-latent factorization of a
// V x N count matrix, inferred by upward-downward Gibbs sampling. Layer t
// draws theta^(t) ~ Gamma(phi^(t+1) theta^(t+1), 1/c^(t+1)) with Dirichlet
// factor loadings per layer and gamma rates r_k on top.

use crate::config::{PgbnConfig, Priors};
use crate::persist::{self, NamedArray, PersistError};
use crate::sampler::{self, SamplerError};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug)]
pub enum ModelError {
    NotInitialized,
    InvalidConfig(String),
    InvalidData(String),
    ShapeMismatch(String),
    WrongModelKind { expected: String, found: String },
    Persist(PersistError),
    Sampler(SamplerError),
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::NotInitialized => {
                write!(f, "Model not initialized: call initial() or load() first")
            }
            ModelError::InvalidConfig(s) => write!(f, "Invalid config: {}", s),
            ModelError::InvalidData(s) => write!(f, "Invalid data: {}", s),
            ModelError::ShapeMismatch(s) => write!(f, "Shape mismatch: {}", s),
            ModelError::WrongModelKind { expected, found } => {
                write!(f, "Archive holds a '{}' model, expected '{}'", found, expected)
            }
            ModelError::Persist(e) => write!(f, "Persistence error: {}", e),
            ModelError::Sampler(e) => write!(f, "Sampler error: {}", e),
        }
    }
}

impl std::error::Error for ModelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModelError::Persist(ref e) => Some(e),
            ModelError::Sampler(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<PersistError> for ModelError {
    fn from(err: PersistError) -> ModelError {
        ModelError::Persist(err)
    }
}

impl From<SamplerError> for ModelError {
    fn from(err: SamplerError) -> ModelError {
        ModelError::Sampler(err)
    }
}

/// Parameters shared across documents.
#[derive(Debug, Clone)]
pub struct PgbnGlobalParams {
    /// phi[t]: K_{t-1} x K_t Dirichlet factor loadings, K_0 = feature dim.
    pub phi: Vec<Array2<f64>>,
    /// Top-layer gamma rates, length K_T.
    pub r: Array1<f64>,
}

/// Per-document latent variables for one batch.
#[derive(Debug, Clone)]
pub struct PgbnLocalParams {
    /// theta[t]: K_t x N gamma factor scores.
    pub theta: Vec<Array2<f64>>,
    /// c[i] is the scale variable c^(i+2), each of length N.
    pub c: Vec<Array1<f64>>,
}

pub struct Pgbn {
    pub config: PgbnConfig,
    feature_dim: Option<usize>,
    globals: Option<PgbnGlobalParams>,
    rng: StdRng,
}

impl Pgbn {
    pub fn new(config: PgbnConfig, seed: u64) -> Result<Self, ModelError> {
        if config.layer_widths.is_empty() {
            return Err(ModelError::InvalidConfig(
                "layer_widths must not be empty".to_string(),
            ));
        }
        if config.layer_widths.iter().any(|&k| k == 0) {
            return Err(ModelError::InvalidConfig(
                "layer widths must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&config.burn_in) {
            return Err(ModelError::InvalidConfig(format!(
                "burn_in must be in [0, 1), got {}",
                config.burn_in
            )));
        }
        Ok(Self {
            config,
            feature_dim: None,
            globals: None,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn globals(&self) -> Option<&PgbnGlobalParams> {
        self.globals.as_ref()
    }

    /// Initialize global parameters from the shape of the training data.
    pub fn initial(&mut self, data: &Array2<f64>) -> Result<(), ModelError> {
        validate_counts(data)?;
        let v = data.nrows();
        if v == 0 || data.ncols() == 0 {
            return Err(ModelError::InvalidData("data matrix is empty".to_string()));
        }

        let widths = &self.config.layer_widths;
        let mut phi = Vec::with_capacity(widths.len());
        let mut prev = v;
        for &k in widths {
            phi.push(random_loadings(prev, k, &mut self.rng));
            prev = k;
        }
        let k_top = *widths.last().unwrap_or(&1);
        let r = Array1::from_elem(k_top, self.config.priors.gamma0 / k_top as f64);

        self.feature_dim = Some(v);
        self.globals = Some(PgbnGlobalParams { phi, r });
        Ok(())
    }

    /// Run `n_iter` full Gibbs sweeps, updating both global and local
    /// parameters. Factor loadings are averaged over post-burn-in sweeps.
    pub fn train(
        &mut self,
        data: &Array2<f64>,
        n_iter: usize,
    ) -> Result<PgbnLocalParams, ModelError> {
        self.check_data(data)?;
        let mut locals = init_locals(&self.config.layer_widths, data.ncols());
        // Borrowed in place so an error mid-sweep cannot de-initialize the
        // model.
        let globals = self.globals.as_mut().ok_or(ModelError::NotInitialized)?;

        let burn = (n_iter as f64 * self.config.burn_in) as usize;
        let mut phi_sum: Vec<Array2<f64>> = globals.phi.iter().map(|p| Array2::zeros(p.dim())).collect();
        let mut n_collected = 0usize;

        for sweep in 0..n_iter {
            gibbs_sweep(
                data,
                globals,
                &mut locals,
                &self.config.priors,
                true,
                &mut self.rng,
            )?;
            if sweep >= burn {
                for (acc, p) in phi_sum.iter_mut().zip(globals.phi.iter()) {
                    *acc += p;
                }
                n_collected += 1;
            }
            let ll = poisson_log_likelihood(data, &globals.phi[0], &locals.theta[0]);
            info!(sweep, likelihood = ll, "pgbn train sweep");
        }

        if n_collected > 0 {
            for (p, acc) in globals.phi.iter_mut().zip(phi_sum.into_iter()) {
                *p = normalize_columns(acc / n_collected as f64);
            }
        }

        Ok(locals)
    }

    /// Infer local parameters for `data` with frozen global parameters.
    pub fn test(
        &mut self,
        data: &Array2<f64>,
        n_iter: usize,
    ) -> Result<PgbnLocalParams, ModelError> {
        self.check_data(data)?;
        let mut globals = self
            .globals
            .as_ref()
            .ok_or(ModelError::NotInitialized)?
            .clone();
        let mut locals = init_locals(&self.config.layer_widths, data.ncols());
        for sweep in 0..n_iter {
            gibbs_sweep(
                data,
                &mut globals,
                &mut locals,
                &self.config.priors,
                false,
                &mut self.rng,
            )?;
            let ll = poisson_log_likelihood(data, &globals.phi[0], &locals.theta[0]);
            info!(sweep, likelihood = ll, "pgbn test sweep");
        }
        Ok(locals)
    }

    /// Per-document average Poisson log-likelihood of `data` under the
    /// bottom-layer factorization.
    pub fn log_likelihood(
        &self,
        data: &Array2<f64>,
        locals: &PgbnLocalParams,
    ) -> Result<f64, ModelError> {
        let globals = self.globals.as_ref().ok_or(ModelError::NotInitialized)?;
        self.check_data(data)?;
        Ok(poisson_log_likelihood(data, &globals.phi[0], &locals.theta[0]))
    }

    /// Write global parameters to `<dir>/PGBN.dpm` and return the path.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, ModelError> {
        let globals = self.globals.as_ref().ok_or(ModelError::NotInitialized)?;
        let path = dir.join("PGBN.dpm");

        let mut metadata = HashMap::new();
        metadata.insert("model".to_string(), "pgbn".to_string());
        metadata.insert(
            "layer_widths".to_string(),
            serde_json::to_string(&self.config.layer_widths).map_err(PersistError::from)?,
        );
        metadata.insert("burn_in".to_string(), self.config.burn_in.to_string());

        let mut arrays = Vec::new();
        for (t, phi) in globals.phi.iter().enumerate() {
            arrays.push(NamedArray::new(
                format!("phi.{}", t),
                vec![phi.nrows(), phi.ncols()],
                phi.iter().copied().collect(),
            ));
        }
        arrays.push(NamedArray::new(
            "r",
            vec![globals.r.len()],
            globals.r.to_vec(),
        ));

        persist::save_archive(&path, &metadata, &arrays)?;
        Ok(path)
    }

    /// Replace global parameters (and layer widths) from an archive.
    pub fn load(&mut self, path: &Path) -> Result<(), ModelError> {
        let mut archive = persist::load_archive(path)?;
        let kind = archive.meta("model")?.to_string();
        if kind != "pgbn" {
            return Err(ModelError::WrongModelKind {
                expected: "pgbn".to_string(),
                found: kind,
            });
        }

        let mut phi = Vec::new();
        let mut t = 0;
        while archive.contains(&format!("phi.{}", t)) {
            let (shape, data) = archive.take(&format!("phi.{}", t))?;
            phi.push(matrix_from_parts("phi", shape, data)?);
            t += 1;
        }
        if phi.is_empty() {
            return Err(ModelError::ShapeMismatch(
                "archive contains no phi layers".to_string(),
            ));
        }
        let (r_shape, r_data) = archive.take("r")?;
        if r_shape.len() != 1 || r_shape[0] != phi[phi.len() - 1].ncols() {
            return Err(ModelError::ShapeMismatch(format!(
                "r has shape {:?}, expected [{}]",
                r_shape,
                phi[phi.len() - 1].ncols()
            )));
        }

        self.config.layer_widths = phi.iter().map(|p| p.ncols()).collect();
        self.feature_dim = Some(phi[0].nrows());
        self.globals = Some(PgbnGlobalParams {
            phi,
            r: Array1::from_vec(r_data),
        });
        Ok(())
    }

    fn check_data(&self, data: &Array2<f64>) -> Result<(), ModelError> {
        validate_counts(data)?;
        match self.feature_dim {
            None => Err(ModelError::NotInitialized),
            Some(v) if v != data.nrows() => Err(ModelError::ShapeMismatch(format!(
                "data has {} features, model expects {}",
                data.nrows(),
                v
            ))),
            Some(_) => Ok(()),
        }
    }
}

pub(crate) fn matrix_from_parts(
    name: &str,
    shape: Vec<usize>,
    data: Vec<f64>,
) -> Result<Array2<f64>, ModelError> {
    if shape.len() != 2 {
        return Err(ModelError::ShapeMismatch(format!(
            "array '{}' has rank {}, expected 2",
            name,
            shape.len()
        )));
    }
    Array2::from_shape_vec((shape[0], shape[1]), data)
        .map_err(|e| ModelError::ShapeMismatch(format!("array '{}': {}", name, e)))
}

pub(crate) fn validate_counts(data: &Array2<f64>) -> Result<(), ModelError> {
    for &x in data.iter() {
        if !x.is_finite() || x < 0.0 {
            return Err(ModelError::InvalidData(format!(
                "count matrix entries must be finite and non-negative, found {}",
                x
            )));
        }
    }
    Ok(())
}

pub(crate) fn random_loadings<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Array2<f64> {
    let mut phi = Array2::zeros((rows, cols));
    let ones = vec![1.0; rows];
    for k in 0..cols {
        let col = sampler::dirichlet(rng, &ones);
        for v in 0..rows {
            phi[[v, k]] = col[v];
        }
    }
    phi
}

pub(crate) fn normalize_columns(mut phi: Array2<f64>) -> Array2<f64> {
    for mut col in phi.columns_mut() {
        let total: f64 = col.sum();
        if total > 0.0 {
            col.mapv_inplace(|x| x / total);
        }
    }
    phi
}

pub(crate) fn init_locals(widths: &[usize], n: usize) -> PgbnLocalParams {
    let theta = widths
        .iter()
        .map(|&k| Array2::from_elem((k, n), 1.0 / k as f64))
        .collect();
    let c = vec![Array1::ones(n); widths.len()];
    PgbnLocalParams { theta, c }
}

/// Multinomial augmentation of a count matrix against one layer's loadings
/// and scores. Returns the latent counts m (K x N) and the loading
/// sufficient statistics a (V x K); both conserve the input total.
pub(crate) fn augment_counts<R: Rng + ?Sized>(
    input: &Array2<f64>,
    phi: &Array2<f64>,
    theta: &Array2<f64>,
    rng: &mut R,
) -> Result<(Array2<f64>, Array2<f64>), ModelError> {
    let (v_dim, n) = input.dim();
    let k = phi.ncols();
    let mut m = Array2::zeros((k, n));
    let mut a = Array2::zeros((v_dim, k));
    let mut weights = vec![0.0f64; k];

    for j in 0..n {
        for v in 0..v_dim {
            let x = input[[v, j]];
            if x < 0.5 {
                continue;
            }
            for (kk, w) in weights.iter_mut().enumerate() {
                *w = phi[[v, kk]] * theta[[kk, j]];
            }
            let alloc = sampler::multinomial(rng, x.round() as u64, &weights)?;
            for (kk, &cnt) in alloc.iter().enumerate() {
                if cnt > 0 {
                    m[[kk, j]] += cnt as f64;
                    a[[v, kk]] += cnt as f64;
                }
            }
        }
    }
    Ok((m, a))
}

/// Resample Dirichlet factor loadings column-wise from their counts.
pub(crate) fn sample_phi_columns<R: Rng + ?Sized>(
    a: &Array2<f64>,
    eta: f64,
    rng: &mut R,
) -> Array2<f64> {
    let (v_dim, k) = a.dim();
    let mut phi = Array2::zeros((v_dim, k));
    let mut conc = vec![0.0f64; v_dim];
    for kk in 0..k {
        for v in 0..v_dim {
            conc[v] = eta + a[[v, kk]];
        }
        let col = sampler::dirichlet(rng, &conc);
        for v in 0..v_dim {
            phi[[v, kk]] = col[v];
        }
    }
    phi
}

/// Element-wise CRT draws propagating latent counts one layer up.
pub(crate) fn crt_matrix<R: Rng + ?Sized>(
    m: &Array2<f64>,
    shape: &Array2<f64>,
    rng: &mut R,
) -> Array2<f64> {
    let mut out = Array2::zeros(m.dim());
    for ((idx, &count), &sh) in m.indexed_iter().zip(shape.iter()) {
        out[idx] = sampler::crt(rng, count.round() as u64, sh) as f64;
    }
    out
}

/// One full upward-downward Gibbs sweep over a batch. When
/// `update_globals` is false, phi and r are held fixed (test-time
/// inference).
pub(crate) fn gibbs_sweep<R: Rng + ?Sized>(
    data: &Array2<f64>,
    globals: &mut PgbnGlobalParams,
    locals: &mut PgbnLocalParams,
    priors: &Priors,
    update_globals: bool,
    rng: &mut R,
) -> Result<(), ModelError> {
    let t_layers = globals.phi.len();
    let n = data.ncols();

    // Upward pass: augment counts at each layer, propagating CRT table
    // counts as the next layer's observations.
    let mut m_counts: Vec<Array2<f64>> = Vec::with_capacity(t_layers);
    let mut input = data.clone();
    for t in 0..t_layers {
        let (m_t, a_t) = augment_counts(&input, &globals.phi[t], &locals.theta[t], rng)?;
        if update_globals {
            globals.phi[t] = sample_phi_columns(&a_t, priors.eta, rng);
        }
        if t + 1 < t_layers {
            let shape_next = globals.phi[t + 1].dot(&locals.theta[t + 1]);
            input = crt_matrix(&m_t, &shape_next, rng);
        }
        m_counts.push(m_t);
    }

    let shape_of = |t: usize, locals: &PgbnLocalParams| -> Array2<f64> {
        if t + 1 < t_layers {
            globals.phi[t + 1].dot(&locals.theta[t + 1])
        } else {
            let k_top = globals.r.len();
            let mut s = Array2::zeros((k_top, n));
            for j in 0..n {
                for k in 0..k_top {
                    s[[k, j]] = globals.r[k];
                }
            }
            s
        }
    };

    // Scale variables. c^(2) comes from a beta draw on p_j^(2); the deeper
    // c^(t) are gamma conditionals.
    let shape_bottom = shape_of(0, locals);
    for j in 0..n {
        let m_sum: f64 = m_counts[0].column(j).sum();
        let s_sum: f64 = shape_bottom.column(j).sum();
        let p = sampler::beta(rng, priors.a0 + m_sum, priors.b0 + s_sum);
        locals.c[0][j] = (1.0 - p) / p;
    }
    for i in 1..t_layers {
        let shape_l = shape_of(i, locals);
        for j in 0..n {
            let sh = priors.e0 + shape_l.column(j).sum();
            let rate = priors.f0 + locals.theta[i].column(j).sum();
            locals.c[i][j] = sampler::gamma(rng, sh, 1.0 / rate);
        }
    }

    // q^(1) = 1 at the Poisson layer; q^(t+1) = ln(1 + q^(t)/c^(t+1)).
    let mut q: Vec<Array1<f64>> = Vec::with_capacity(t_layers);
    q.push(Array1::ones(n));
    for t in 1..t_layers {
        let next = {
            let prev = &q[t - 1];
            let c_t = &locals.c[t - 1];
            Array1::from_shape_fn(n, |j| (1.0 + prev[j] / c_t[j]).ln())
        };
        q.push(next);
    }

    // Downward pass: resample theta top-down so each layer conditions on
    // the freshly drawn layer above.
    for t in (0..t_layers).rev() {
        let shape_l = shape_of(t, locals);
        let (k_t, _) = locals.theta[t].dim();
        for j in 0..n {
            let denom = locals.c[t][j] + q[t][j];
            for k in 0..k_t {
                locals.theta[t][[k, j]] = sampler::gamma(
                    rng,
                    m_counts[t][[k, j]] + shape_l[[k, j]],
                    1.0 / denom,
                );
            }
        }
    }

    // Top-layer rates.
    if update_globals {
        let k_top = globals.r.len();
        let q_top: f64 = (0..n)
            .map(|j| (1.0 + q[t_layers - 1][j] / locals.c[t_layers - 1][j]).ln())
            .sum();
        for k in 0..k_top {
            let tables: u64 = (0..n)
                .map(|j| {
                    sampler::crt(rng, m_counts[t_layers - 1][[k, j]].round() as u64, globals.r[k])
                })
                .sum();
            globals.r[k] = sampler::gamma(
                rng,
                priors.gamma0 / k_top as f64 + tables as f64,
                1.0 / (priors.c0 + q_top),
            );
        }
    }

    Ok(())
}

/// Per-document average Poisson log-likelihood under lambda = phi theta.
pub(crate) fn poisson_log_likelihood(
    data: &Array2<f64>,
    phi: &Array2<f64>,
    theta: &Array2<f64>,
) -> f64 {
    let lambda = phi.dot(theta);
    let n = data.ncols().max(1) as f64;
    let mut ll = 0.0;
    for (&x, &lam) in data.iter().zip(lambda.iter()) {
        let lam = lam.max(1e-12);
        ll += x * lam.ln() - lam - libm::lgamma(x + 1.0);
    }
    ll / n
}
