// src/cpgbn.rs
//
// Convolutional Poisson Gamma Belief Network: the CPFA convolutional layer
// at the bottom, with PGBN-style gamma layers stacked on the pooled
// feature-map counts. Token allocation and filter updates come from the
// cpfa kernels; the upper stack reuses the pgbn update kernels on
// CRT-propagated counts.

use crate::config::{ConvConfig, Priors};
use crate::cpfa::{
    self, conv_arrays, conv_metadata, init_conv_locals, load_conv_globals, CpfaGlobalParams,
    CpfaLocalParams,
};
use crate::pgbn::{self, ModelError, PgbnLocalParams};
use crate::persist::{self, NamedArray};
use crate::sampler;
use crate::text::SparseBatch;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone)]
pub struct CpgbnGlobalParams {
    /// Convolutional filters shared with the CPFA layer. The `r` field of
    /// `conv` is unused here; the stack's rates live in `r` below.
    pub conv: CpfaGlobalParams,
    /// Upper-layer loadings: phi[0] is K_conv x K_2, and so on up.
    pub phi: Vec<Array2<f64>>,
    /// Top-of-stack gamma rates.
    pub r: Array1<f64>,
}

#[derive(Debug, Clone)]
pub struct CpgbnLocalParams {
    /// Feature maps and scales of the convolutional layer.
    pub w: Vec<Array2<f64>>,
    pub c_w: Array1<f64>,
    /// Gamma factor scores of the upper layers (empty when none).
    pub upper: PgbnLocalParams,
}

impl CpgbnLocalParams {
    /// Pool feature maps over positions into a K x N matrix for scoring.
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

pub struct Cpgbn {
    pub config: ConvConfig,
    vocab_size: Option<usize>,
    globals: Option<CpgbnGlobalParams>,
    rng: StdRng,
}

impl Cpgbn {
    pub fn new(config: ConvConfig, seed: u64) -> Result<Self, ModelError> {
        cpfa::validate_conv_config(&config)?;
        if config.upper_widths.iter().any(|&k| k == 0) {
            return Err(ModelError::InvalidConfig(
                "upper layer widths must be positive".to_string(),
            ));
        }
        Ok(Self {
            config,
            vocab_size: None,
            globals: None,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn globals(&self) -> Option<&CpgbnGlobalParams> {
        self.globals.as_ref()
    }

    pub fn initial(&mut self, batch: &SparseBatch) -> Result<(), ModelError> {
        cpfa::validate_batch(batch)?;
        let k_conv = self.config.n_topics;
        let f = self.config.filter_width;

        let mut filters = Vec::with_capacity(k_conv);
        for _ in 0..k_conv {
            filters.push(cpfa::random_filter(batch.vocab_size, f, &mut self.rng));
        }

        let mut phi = Vec::with_capacity(self.config.upper_widths.len());
        let mut prev = k_conv;
        for &k in &self.config.upper_widths {
            phi.push(pgbn::random_loadings(prev, k, &mut self.rng));
            prev = k;
        }
        let k_top = *self.config.upper_widths.last().unwrap_or(&k_conv);
        let r = Array1::from_elem(k_top, self.config.priors.gamma0 / k_top as f64);

        self.vocab_size = Some(batch.vocab_size);
        self.globals = Some(CpgbnGlobalParams {
            conv: CpfaGlobalParams {
                filters,
                r: Array1::zeros(0),
            },
            phi,
            r,
        });
        Ok(())
    }

    pub fn train(
        &mut self,
        batch: &SparseBatch,
        n_iter: usize,
    ) -> Result<CpgbnLocalParams, ModelError> {
        self.check_batch(batch)?;
        let mut locals = self.init_locals(batch);
        // Borrowed in place so an error mid-sweep cannot de-initialize the
        // model.
        let globals = self.globals.as_mut().ok_or(ModelError::NotInitialized)?;

        let burn = (n_iter as f64 * self.config.burn_in) as usize;
        let mut filter_sum: Vec<Array2<f64>> = globals
            .conv
            .filters
            .iter()
            .map(|d| Array2::zeros(d.dim()))
            .collect();
        let mut phi_sum: Vec<Array2<f64>> =
            globals.phi.iter().map(|p| Array2::zeros(p.dim())).collect();
        let mut n_collected = 0usize;

        for sweep in 0..n_iter {
            let ll = cpgbn_sweep(
                batch,
                globals,
                &mut locals,
                &self.config.priors,
                self.config.filter_width,
                true,
                &mut self.rng,
            )?;
            if sweep >= burn {
                for (acc, d) in filter_sum.iter_mut().zip(globals.conv.filters.iter()) {
                    *acc += d;
                }
                for (acc, p) in phi_sum.iter_mut().zip(globals.phi.iter()) {
                    *acc += p;
                }
                n_collected += 1;
            }
            info!(sweep, likelihood = ll, "cpgbn train sweep");
        }

        if n_collected > 0 {
            for (d, acc) in globals.conv.filters.iter_mut().zip(filter_sum.into_iter()) {
                *d = cpfa::normalize_filter(acc / n_collected as f64);
            }
            for (p, acc) in globals.phi.iter_mut().zip(phi_sum.into_iter()) {
                *p = pgbn::normalize_columns(acc / n_collected as f64);
            }
        }

        Ok(locals)
    }

    pub fn test(
        &mut self,
        batch: &SparseBatch,
        n_iter: usize,
    ) -> Result<CpgbnLocalParams, ModelError> {
        self.check_batch(batch)?;
        let mut globals = self
            .globals
            .as_ref()
            .ok_or(ModelError::NotInitialized)?
            .clone();
        let mut locals = self.init_locals(batch);
        for sweep in 0..n_iter {
            let ll = cpgbn_sweep(
                batch,
                &mut globals,
                &mut locals,
                &self.config.priors,
                self.config.filter_width,
                false,
                &mut self.rng,
            )?;
            info!(sweep, likelihood = ll, "cpgbn test sweep");
        }
        Ok(locals)
    }

    /// Write global parameters to `<dir>/CPGBN.dpm` and return the path.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, ModelError> {
        let globals = self.globals.as_ref().ok_or(ModelError::NotInitialized)?;
        let path = dir.join("CPGBN.dpm");
        let metadata = conv_metadata("cpgbn", &self.config)?;

        // Filters first, then the stack arrays; the shared `r` slot holds
        // the top-of-stack rates.
        let mut arrays = conv_arrays(&CpfaGlobalParams {
            filters: globals.conv.filters.clone(),
            r: globals.r.clone(),
        });
        for (t, phi) in globals.phi.iter().enumerate() {
            arrays.push(NamedArray::new(
                format!("phi.{}", t),
                vec![phi.nrows(), phi.ncols()],
                phi.iter().copied().collect(),
            ));
        }

        persist::save_archive(&path, &metadata, &arrays)?;
        Ok(path)
    }

    pub fn load(&mut self, path: &Path) -> Result<(), ModelError> {
        let (conv, filter_width) = load_conv_globals(path, "cpgbn")?;

        let mut archive = persist::load_archive(path)?;
        let mut phi = Vec::new();
        let mut t = 0;
        while archive.contains(&format!("phi.{}", t)) {
            let (shape, data) = archive.take(&format!("phi.{}", t))?;
            phi.push(pgbn::matrix_from_parts("phi", shape, data)?);
            t += 1;
        }

        let r = conv.r.clone();
        let expected_top = phi
            .last()
            .map(|p| p.ncols())
            .unwrap_or(conv.filters.len());
        if r.len() != expected_top {
            return Err(ModelError::ShapeMismatch(format!(
                "top rates have length {}, expected {}",
                r.len(),
                expected_top
            )));
        }

        self.config.n_topics = conv.filters.len();
        self.config.filter_width = filter_width;
        self.config.upper_widths = phi.iter().map(|p| p.ncols()).collect();
        self.vocab_size = conv.filters.first().map(|d| d.nrows());
        self.globals = Some(CpgbnGlobalParams {
            conv: CpfaGlobalParams {
                filters: conv.filters,
                r: Array1::zeros(0),
            },
            phi,
            r,
        });
        Ok(())
    }

    fn init_locals(&self, batch: &SparseBatch) -> CpgbnLocalParams {
        let CpfaLocalParams { w, c } =
            init_conv_locals(batch, self.config.n_topics, self.config.filter_width);
        let upper = pgbn::init_locals(&self.config.upper_widths, batch.n_docs());
        CpgbnLocalParams { w, c_w: c, upper }
    }

    fn check_batch(&self, batch: &SparseBatch) -> Result<(), ModelError> {
        cpfa::validate_batch(batch)?;
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

fn cpgbn_sweep<R: Rng + ?Sized>(
    batch: &SparseBatch,
    globals: &mut CpgbnGlobalParams,
    locals: &mut CpgbnLocalParams,
    priors: &Priors,
    filter_width: usize,
    update_globals: bool,
    rng: &mut R,
) -> Result<f64, ModelError> {
    let n = batch.n_docs();
    let k_conv = globals.conv.filters.len();
    let n_upper = globals.phi.len();

    // Convolutional layer allocation.
    let (filter_counts, w_counts) =
        cpfa::allocate_tokens(batch, &globals.conv.filters, &locals.w, filter_width, rng)?;
    if update_globals {
        globals.conv.filters = cpfa::sample_filters(&filter_counts, priors.eta, rng);
    }

    // Prior shape for the feature maps: the layer above, or the rates.
    let shape_conv = |globals: &CpgbnGlobalParams, locals: &CpgbnLocalParams| -> Array2<f64> {
        if n_upper > 0 {
            globals.phi[0].dot(&locals.upper.theta[0])
        } else {
            let mut s = Array2::zeros((k_conv, n));
            for j in 0..n {
                for k in 0..k_conv {
                    s[[k, j]] = globals.r[k];
                }
            }
            s
        }
    };

    // Upward pass through the gamma stack. Layer-2 observations come from
    // position-wise CRT draws on the feature-map counts.
    let mut m_upper: Vec<Array2<f64>> = Vec::with_capacity(n_upper);
    if n_upper > 0 {
        let shape1 = shape_conv(globals, locals);
        let mut input = Array2::zeros((k_conv, n));
        for (j, wc) in w_counts.iter().enumerate() {
            let l_out = wc.ncols();
            for k in 0..k_conv {
                let base = shape1[[k, j]] / l_out as f64;
                let mut tables = 0u64;
                for s in 0..l_out {
                    tables += sampler::crt(rng, wc[[k, s]].round() as u64, base);
                }
                input[[k, j]] = tables as f64;
            }
        }

        for u in 0..n_upper {
            let (m_u, a_u) =
                pgbn::augment_counts(&input, &globals.phi[u], &locals.upper.theta[u], rng)?;
            if update_globals {
                globals.phi[u] = pgbn::sample_phi_columns(&a_u, priors.eta, rng);
            }
            if u + 1 < n_upper {
                let shape_next = globals.phi[u + 1].dot(&locals.upper.theta[u + 1]);
                input = pgbn::crt_matrix(&m_u, &shape_next, rng);
            }
            m_upper.push(m_u);
        }
    }

    let shape_upper = |u: usize, globals: &CpgbnGlobalParams, locals: &CpgbnLocalParams| {
        if u + 1 < n_upper {
            globals.phi[u + 1].dot(&locals.upper.theta[u + 1])
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

    // Scale and q chains. The convolutional layer contributes
    // q = ln(1 + 1/c_w) per unit of layer-2 shape mass.
    let q_conv = Array1::from_shape_fn(n, |j| (1.0 + 1.0 / locals.c_w[j]).ln());
    let mut q_upper: Vec<Array1<f64>> = Vec::with_capacity(n_upper);
    for u in 0..n_upper {
        let shape_u = shape_upper(u, globals, locals);
        for j in 0..n {
            let sh = priors.e0 + shape_u.column(j).sum();
            let rate = priors.f0 + locals.upper.theta[u].column(j).sum();
            locals.upper.c[u][j] = sampler::gamma(rng, sh, 1.0 / rate);
        }
        let next = {
            let q_prev = if u == 0 { &q_conv } else { &q_upper[u - 1] };
            let c_u = &locals.upper.c[u];
            Array1::from_shape_fn(n, |j| (1.0 + q_prev[j] / c_u[j]).ln())
        };
        q_upper.push(next);
    }

    // Downward pass over the upper stack.
    for u in (0..n_upper).rev() {
        let shape_u = shape_upper(u, globals, locals);
        let q_u = if u == 0 { &q_conv } else { &q_upper[u - 1] };
        let k_u = locals.upper.theta[u].nrows();
        for j in 0..n {
            let denom = locals.upper.c[u][j] + q_u[j];
            for k in 0..k_u {
                locals.upper.theta[u][[k, j]] = sampler::gamma(
                    rng,
                    m_upper[u][[k, j]] + shape_u[[k, j]],
                    1.0 / denom,
                );
            }
        }
    }

    // Convolutional layer: scales then feature maps, conditioned on the
    // freshly drawn layer above.
    let shape1 = shape_conv(globals, locals);
    cpfa::sample_conv_scales(&mut locals.c_w, &locals.w, &shape1, priors, rng);
    cpfa::sample_feature_maps(&mut locals.w, &w_counts, &shape1, &locals.c_w, rng);

    // Top-of-stack rates.
    if update_globals {
        if n_upper > 0 {
            let top = n_upper - 1;
            let k_top = globals.r.len();
            let q_top: f64 = (0..n).map(|j| {
                let q_prev = if top == 0 { q_conv[j] } else { q_upper[top - 1][j] };
                (1.0 + q_prev / locals.upper.c[top][j]).ln()
            })
            .sum();
            for k in 0..k_top {
                let tables: u64 = (0..n)
                    .map(|j| {
                        sampler::crt(rng, m_upper[top][[k, j]].round() as u64, globals.r[k])
                    })
                    .sum();
                globals.r[k] = sampler::gamma(
                    rng,
                    priors.gamma0 / k_top as f64 + tables as f64,
                    1.0 / (priors.c0 + q_top),
                );
            }
        } else {
            cpfa::update_conv_rates(&mut globals.r, &w_counts, &locals.c_w, priors, rng);
        }
    }

    Ok(cpfa::conv_log_likelihood(
        batch,
        &globals.conv.filters,
        &locals.w,
        filter_width,
    ))
}
