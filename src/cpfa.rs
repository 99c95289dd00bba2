// src/cpfa.rs
//
// Convolutional Poisson Factor Analysis: documents are sparse sequences of
// word indices, each token explained by one of K convolutional filter banks
// d_k (V x F, jointly Dirichlet-normalized) shifted to some position of the
// per-document feature map w_nk. Inference is collapsed-count Gibbs, the
// convolutional analogue of the PGBN bottom layer.

use crate::config::{ConvConfig, Priors};
use crate::pgbn::ModelError;
use crate::persist::{self, NamedArray, PersistError};
use crate::sampler;
use crate::text::SparseBatch;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone)]
pub struct CpfaGlobalParams {
    /// filters[k]: V x F, entries summing to 1 over the whole bank.
    pub filters: Vec<Array2<f64>>,
    /// Gamma rates over topics, length K.
    pub r: Array1<f64>,
}

#[derive(Debug, Clone)]
pub struct CpfaLocalParams {
    /// w[n]: K x L_out feature maps, L_out = max(len, F) - F + 1.
    pub w: Vec<Array2<f64>>,
    /// Per-document scale variables.
    pub c: Array1<f64>,
}

impl CpfaLocalParams {
    /// Pool feature maps over positions into a K x N topic-score matrix,
    /// the `W_nk.sum(axis=(2, 3))` step of the demos.
    pub fn pooled_theta(&self) -> Array2<f64> {
        let n = self.w.len();
        let k = self.w.first().map(|w| w.nrows()).unwrap_or(0);
        let mut theta = Array2::zeros((k, n));
        for (j, w) in self.w.iter().enumerate() {
            for kk in 0..k {
                theta[[kk, j]] = w.row(kk).sum();
            }
        }
        theta
    }
}

pub struct Cpfa {
    pub config: ConvConfig,
    vocab_size: Option<usize>,
    globals: Option<CpfaGlobalParams>,
    rng: StdRng,
}

impl Cpfa {
    pub fn new(config: ConvConfig, seed: u64) -> Result<Self, ModelError> {
        validate_conv_config(&config)?;
        Ok(Self {
            config,
            vocab_size: None,
            globals: None,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn globals(&self) -> Option<&CpfaGlobalParams> {
        self.globals.as_ref()
    }

    pub fn initial(&mut self, batch: &SparseBatch) -> Result<(), ModelError> {
        validate_batch(batch)?;
        let k = self.config.n_topics;
        let f = self.config.filter_width;
        let mut filters = Vec::with_capacity(k);
        for _ in 0..k {
            filters.push(random_filter(batch.vocab_size, f, &mut self.rng));
        }
        let r = Array1::from_elem(k, self.config.priors.gamma0 / k as f64);
        self.vocab_size = Some(batch.vocab_size);
        self.globals = Some(CpfaGlobalParams { filters, r });
        Ok(())
    }

    pub fn train(
        &mut self,
        batch: &SparseBatch,
        n_iter: usize,
    ) -> Result<CpfaLocalParams, ModelError> {
        self.check_batch(batch)?;
        let mut locals = init_conv_locals(batch, self.config.n_topics, self.config.filter_width);
        // Borrowed in place so an error mid-sweep cannot de-initialize the
        // model.
        let globals = self.globals.as_mut().ok_or(ModelError::NotInitialized)?;

        let burn = (n_iter as f64 * self.config.burn_in) as usize;
        let mut filter_sum: Vec<Array2<f64>> =
            globals.filters.iter().map(|d| Array2::zeros(d.dim())).collect();
        let mut n_collected = 0usize;

        for sweep in 0..n_iter {
            let ll = cpfa_sweep(
                batch,
                globals,
                &mut locals,
                &self.config.priors,
                self.config.filter_width,
                true,
                &mut self.rng,
            )?;
            if sweep >= burn {
                for (acc, d) in filter_sum.iter_mut().zip(globals.filters.iter()) {
                    *acc += d;
                }
                n_collected += 1;
            }
            info!(sweep, likelihood = ll, "cpfa train sweep");
        }

        if n_collected > 0 {
            for (d, acc) in globals.filters.iter_mut().zip(filter_sum.into_iter()) {
                *d = normalize_filter(acc / n_collected as f64);
            }
        }

        Ok(locals)
    }

    pub fn test(
        &mut self,
        batch: &SparseBatch,
        n_iter: usize,
    ) -> Result<CpfaLocalParams, ModelError> {
        self.check_batch(batch)?;
        let mut globals = self
            .globals
            .as_ref()
            .ok_or(ModelError::NotInitialized)?
            .clone();
        let mut locals = init_conv_locals(batch, self.config.n_topics, self.config.filter_width);
        for sweep in 0..n_iter {
            let ll = cpfa_sweep(
                batch,
                &mut globals,
                &mut locals,
                &self.config.priors,
                self.config.filter_width,
                false,
                &mut self.rng,
            )?;
            info!(sweep, likelihood = ll, "cpfa test sweep");
        }
        Ok(locals)
    }

    /// Write global parameters to `<dir>/CPFA.dpm` and return the path.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, ModelError> {
        let globals = self.globals.as_ref().ok_or(ModelError::NotInitialized)?;
        let path = dir.join("CPFA.dpm");
        let metadata = conv_metadata("cpfa", &self.config)?;
        let arrays = conv_arrays(globals);
        persist::save_archive(&path, &metadata, &arrays)?;
        Ok(path)
    }

    pub fn load(&mut self, path: &Path) -> Result<(), ModelError> {
        let (globals, filter_width) = load_conv_globals(path, "cpfa")?;
        if globals.r.len() != globals.filters.len() {
            return Err(ModelError::ShapeMismatch(format!(
                "top rates have length {}, expected {}",
                globals.r.len(),
                globals.filters.len()
            )));
        }
        self.config.n_topics = globals.filters.len();
        self.config.filter_width = filter_width;
        self.vocab_size = globals.filters.first().map(|d| d.nrows());
        self.globals = Some(globals);
        Ok(())
    }

    fn check_batch(&self, batch: &SparseBatch) -> Result<(), ModelError> {
        validate_batch(batch)?;
        match self.vocab_size {
            None => Err(ModelError::NotInitialized),
            Some(v) if v != batch.vocab_size => Err(ModelError::ShapeMismatch(format!(
                "batch vocab size {} does not match model vocab size {}",
                batch.vocab_size, v
            ))),
            Some(_) => Ok(()),
        }
    }
}

pub(crate) fn validate_conv_config(config: &ConvConfig) -> Result<(), ModelError> {
    if config.n_topics == 0 {
        return Err(ModelError::InvalidConfig(
            "n_topics must be positive".to_string(),
        ));
    }
    if config.filter_width == 0 {
        return Err(ModelError::InvalidConfig(
            "filter_width must be positive".to_string(),
        ));
    }
    if !(0.0..1.0).contains(&config.burn_in) {
        return Err(ModelError::InvalidConfig(format!(
            "burn_in must be in [0, 1), got {}",
            config.burn_in
        )));
    }
    Ok(())
}

pub(crate) fn validate_batch(batch: &SparseBatch) -> Result<(), ModelError> {
    if batch.docs.is_empty() {
        return Err(ModelError::InvalidData("batch has no documents".to_string()));
    }
    if batch.vocab_size == 0 {
        return Err(ModelError::InvalidData("vocab size is zero".to_string()));
    }
    for (n, doc) in batch.docs.iter().enumerate() {
        if doc.is_empty() {
            return Err(ModelError::InvalidData(format!("document {} is empty", n)));
        }
        if let Some(&w) = doc.word_ids.iter().find(|&&w| w >= batch.vocab_size) {
            return Err(ModelError::InvalidData(format!(
                "document {} holds word index {} outside vocab of {}",
                n, w, batch.vocab_size
            )));
        }
    }
    Ok(())
}

pub(crate) fn feature_map_len(doc_len: usize, filter_width: usize) -> usize {
    doc_len.max(filter_width) - filter_width + 1
}

pub(crate) fn random_filter<R: Rng + ?Sized>(v: usize, f: usize, rng: &mut R) -> Array2<f64> {
    let flat = sampler::dirichlet(rng, &vec![1.0; v * f]);
    // dirichlet output length always matches the concentration length
    Array2::from_shape_vec((v, f), flat).unwrap_or_else(|_| Array2::zeros((v, f)))
}

pub(crate) fn normalize_filter(mut d: Array2<f64>) -> Array2<f64> {
    let total: f64 = d.sum();
    if total > 0.0 {
        d.mapv_inplace(|x| x / total);
    }
    d
}

pub(crate) fn init_conv_locals(
    batch: &SparseBatch,
    n_topics: usize,
    filter_width: usize,
) -> CpfaLocalParams {
    let w = batch
        .docs
        .iter()
        .map(|doc| {
            let l_out = feature_map_len(doc.len(), filter_width);
            Array2::from_elem((n_topics, l_out), 1.0 / n_topics as f64)
        })
        .collect();
    CpfaLocalParams {
        w,
        c: Array1::ones(batch.n_docs()),
    }
}

/// Allocate every token of the batch across (topic, shift, offset) triples.
/// Returns per-topic filter count matrices (V x F) and per-document feature
/// map counts (K x L_out); together they conserve the token total.
pub(crate) fn allocate_tokens<R: Rng + ?Sized>(
    batch: &SparseBatch,
    filters: &[Array2<f64>],
    w: &[Array2<f64>],
    filter_width: usize,
    rng: &mut R,
) -> Result<(Vec<Array2<f64>>, Vec<Array2<f64>>), ModelError> {
    let k = filters.len();
    let v_dim = batch.vocab_size;
    let mut filter_counts = vec![Array2::<f64>::zeros((v_dim, filter_width)); k];
    let mut w_counts: Vec<Array2<f64>> =
        w.iter().map(|wm| Array2::zeros(wm.dim())).collect();

    let mut weights: Vec<f64> = Vec::new();
    let mut slots: Vec<(usize, usize, usize)> = Vec::new();

    for (n, doc) in batch.docs.iter().enumerate() {
        let l_out = w[n].ncols();
        for (s, &v) in doc.word_ids.iter().enumerate() {
            weights.clear();
            slots.clear();
            for f in 0..filter_width.min(s + 1) {
                let s_w = s - f;
                if s_w >= l_out {
                    continue;
                }
                for (kk, d) in filters.iter().enumerate() {
                    weights.push(d[[v, f]] * w[n][[kk, s_w]]);
                    slots.push((kk, f, s_w));
                }
            }
            if slots.is_empty() {
                // Degenerate short document: fall back to offset 0.
                for (kk, d) in filters.iter().enumerate() {
                    weights.push(d[[v, 0]] * w[n][[kk, 0]]);
                    slots.push((kk, 0, 0));
                }
            }
            let alloc = sampler::multinomial(rng, 1, &weights)?;
            for (i, &cnt) in alloc.iter().enumerate() {
                if cnt > 0 {
                    let (kk, f, s_w) = slots[i];
                    filter_counts[kk][[v, f]] += cnt as f64;
                    w_counts[n][[kk, s_w]] += cnt as f64;
                }
            }
        }
    }
    Ok((filter_counts, w_counts))
}

/// Resample every filter bank from its allocation counts.
pub(crate) fn sample_filters<R: Rng + ?Sized>(
    filter_counts: &[Array2<f64>],
    eta: f64,
    rng: &mut R,
) -> Vec<Array2<f64>> {
    filter_counts
        .iter()
        .map(|counts| {
            let (v, f) = counts.dim();
            let conc: Vec<f64> = counts.iter().map(|&c| eta + c).collect();
            let flat = sampler::dirichlet(rng, &conc);
            Array2::from_shape_vec((v, f), flat).unwrap_or_else(|_| Array2::zeros((v, f)))
        })
        .collect()
}

/// Resample feature maps given per-document/topic prior shapes (K x N) and
/// scale variables. Each map element has prior shape `prior[k, n] / L_out`.
pub(crate) fn sample_feature_maps<R: Rng + ?Sized>(
    w: &mut [Array2<f64>],
    w_counts: &[Array2<f64>],
    prior_shape: &Array2<f64>,
    c: &Array1<f64>,
    rng: &mut R,
) {
    for (n, wm) in w.iter_mut().enumerate() {
        let (k, l_out) = wm.dim();
        let scale = 1.0 / (c[n] + 1.0);
        for kk in 0..k {
            let base = prior_shape[[kk, n]] / l_out as f64;
            for s in 0..l_out {
                wm[[kk, s]] = sampler::gamma(rng, base + w_counts[n][[kk, s]], scale);
            }
        }
    }
}

/// Resample per-document scale variables against the feature-map totals.
pub(crate) fn sample_conv_scales<R: Rng + ?Sized>(
    c: &mut Array1<f64>,
    w: &[Array2<f64>],
    prior_shape: &Array2<f64>,
    priors: &Priors,
    rng: &mut R,
) {
    for (n, wm) in w.iter().enumerate() {
        let shape_total: f64 = prior_shape.column(n).sum();
        let w_total: f64 = wm.sum();
        c[n] = sampler::gamma(rng, priors.e0 + shape_total, 1.0 / (priors.f0 + w_total));
    }
}

/// Token-level Poisson log-likelihood per document.
pub(crate) fn conv_log_likelihood(
    batch: &SparseBatch,
    filters: &[Array2<f64>],
    w: &[Array2<f64>],
    filter_width: usize,
) -> f64 {
    let mut ll = 0.0;
    for (n, doc) in batch.docs.iter().enumerate() {
        let l_out = w[n].ncols();
        for (s, &v) in doc.word_ids.iter().enumerate() {
            let mut rate = 0.0;
            for f in 0..filter_width.min(s + 1) {
                let s_w = s - f;
                if s_w >= l_out {
                    continue;
                }
                for (kk, d) in filters.iter().enumerate() {
                    rate += d[[v, f]] * w[n][[kk, s_w]];
                }
            }
            ll += rate.max(1e-12).ln();
        }
        // Total exposure: every feature-map unit carries unit filter mass.
        ll -= w[n].sum();
    }
    ll / batch.n_docs().max(1) as f64
}

fn cpfa_sweep<R: Rng + ?Sized>(
    batch: &SparseBatch,
    globals: &mut CpfaGlobalParams,
    locals: &mut CpfaLocalParams,
    priors: &Priors,
    filter_width: usize,
    update_globals: bool,
    rng: &mut R,
) -> Result<f64, ModelError> {
    let (filter_counts, w_counts) =
        allocate_tokens(batch, &globals.filters, &locals.w, filter_width, rng)?;

    if update_globals {
        globals.filters = sample_filters(&filter_counts, priors.eta, rng);
    }

    // Prior shape r_k is shared across documents.
    let n = batch.n_docs();
    let k = globals.r.len();
    let mut prior_shape = Array2::zeros((k, n));
    for j in 0..n {
        for kk in 0..k {
            prior_shape[[kk, j]] = globals.r[kk];
        }
    }

    sample_conv_scales(&mut locals.c, &locals.w, &prior_shape, priors, rng);
    sample_feature_maps(&mut locals.w, &w_counts, &prior_shape, &locals.c, rng);

    if update_globals {
        update_conv_rates(&mut globals.r, &w_counts, &locals.c, priors, rng);
    }

    Ok(conv_log_likelihood(
        batch,
        &globals.filters,
        &locals.w,
        filter_width,
    ))
}

/// Resample the top gamma rates from CRT table counts over the feature-map
/// allocations.
pub(crate) fn update_conv_rates<R: Rng + ?Sized>(
    r: &mut Array1<f64>,
    w_counts: &[Array2<f64>],
    c: &Array1<f64>,
    priors: &Priors,
    rng: &mut R,
) {
    let k = r.len();
    let q_total: f64 = c.iter().map(|&cn| (1.0 + 1.0 / cn).ln()).sum();
    for kk in 0..k {
        let mut tables = 0u64;
        for wc in w_counts.iter() {
            let l_out = wc.ncols();
            let base = r[kk] / l_out as f64;
            for s in 0..l_out {
                tables += sampler::crt(rng, wc[[kk, s]].round() as u64, base);
            }
        }
        r[kk] = sampler::gamma(
            rng,
            priors.gamma0 / k as f64 + tables as f64,
            1.0 / (priors.c0 + q_total),
        );
    }
}

pub(crate) fn conv_metadata(
    kind: &str,
    config: &ConvConfig,
) -> Result<HashMap<String, String>, ModelError> {
    let mut metadata = HashMap::new();
    metadata.insert("model".to_string(), kind.to_string());
    metadata.insert("n_topics".to_string(), config.n_topics.to_string());
    metadata.insert("filter_width".to_string(), config.filter_width.to_string());
    metadata.insert(
        "upper_widths".to_string(),
        serde_json::to_string(&config.upper_widths).map_err(PersistError::from)?,
    );
    Ok(metadata)
}

pub(crate) fn conv_arrays(globals: &CpfaGlobalParams) -> Vec<NamedArray> {
    let mut arrays = Vec::new();
    for (k, d) in globals.filters.iter().enumerate() {
        arrays.push(NamedArray::new(
            format!("filter.{}", k),
            vec![d.nrows(), d.ncols()],
            d.iter().copied().collect(),
        ));
    }
    arrays.push(NamedArray::new("r", vec![globals.r.len()], globals.r.to_vec()));
    arrays
}

pub(crate) fn load_conv_globals(
    path: &Path,
    expected_kind: &str,
) -> Result<(CpfaGlobalParams, usize), ModelError> {
    let mut archive = persist::load_archive(path)?;
    let kind = archive.meta("model")?.to_string();
    if kind != expected_kind {
        return Err(ModelError::WrongModelKind {
            expected: expected_kind.to_string(),
            found: kind,
        });
    }

    let mut filters = Vec::new();
    let mut k = 0;
    while archive.contains(&format!("filter.{}", k)) {
        let (shape, data) = archive.take(&format!("filter.{}", k))?;
        filters.push(crate::pgbn::matrix_from_parts("filter", shape, data)?);
        k += 1;
    }
    if filters.is_empty() {
        return Err(ModelError::ShapeMismatch(
            "archive contains no filters".to_string(),
        ));
    }
    let filter_width = filters[0].ncols();
    // Rate length differs between the flat and stacked models, so only the
    // rank is validated here.
    let (r_shape, r_data) = archive.take("r")?;
    if r_shape.len() != 1 {
        return Err(ModelError::ShapeMismatch(format!(
            "r has shape {:?}, expected rank 1",
            r_shape
        )));
    }

    Ok((
        CpfaGlobalParams {
            filters,
            r: Array1::from_vec(r_data),
        },
        filter_width,
    ))
}
