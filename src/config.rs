use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Execution device requested on the command line. Only the CPU path is
/// implemented; `Gpu` is accepted for parity with the original demos and
/// callers are expected to warn and fall back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu,
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "gpu" | "cuda" => Ok(Device::Gpu),
            other => Err(format!("Unknown device '{}', expected 'cpu' or 'gpu'", other)),
        }
    }
}

/// Shared prior hyperparameters for the gamma/Dirichlet conditionals.
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct Priors {
    /// Dirichlet concentration for factor loadings / filters.
    pub eta: f64,
    /// Beta prior on the layer-2 probability p_j.
    pub a0: f64,
    pub b0: f64,
    /// Gamma prior on the deeper scale variables c_j.
    pub e0: f64,
    pub f0: f64,
    /// Gamma prior on the top-layer rates r_k.
    pub gamma0: f64,
    pub c0: f64,
}

impl Default for Priors {
    fn default() -> Self {
        Self {
            eta: 0.01,
            a0: 0.01,
            b0: 0.01,
            e0: 1.0,
            f0: 1.0,
            gamma0: 1.0,
            c0: 1.0,
        }
    }
}

/// Hyperparameters for the Poisson Gamma Belief Network.
#[derive(Deserialize, Debug, Clone)]
pub struct PgbnConfig {
    /// Number of topics at each layer, bottom-up, e.g. [128, 64, 32].
    pub layer_widths: Vec<usize>,
    #[serde(default)]
    pub priors: Priors,
    /// Fraction of training sweeps discarded before collecting phi.
    #[serde(default = "default_burn_in")]
    pub burn_in: f64,
}

fn default_burn_in() -> f64 {
    0.5
}

impl Default for PgbnConfig {
    fn default() -> Self {
        Self {
            layer_widths: vec![128, 64, 32],
            priors: Priors::default(),
            burn_in: default_burn_in(),
        }
    }
}

/// Hyperparameters for the convolutional models (CPFA and the bottom layer
/// of CPGBN).
#[derive(Deserialize, Debug, Clone)]
pub struct ConvConfig {
    /// Number of convolutional filter banks.
    pub n_topics: usize,
    /// Filter width in token positions.
    #[serde(default = "default_filter_width")]
    pub filter_width: usize,
    /// Widths of the gamma layers stacked above the convolutional layer.
    /// Empty for CPFA.
    #[serde(default)]
    pub upper_widths: Vec<usize>,
    #[serde(default)]
    pub priors: Priors,
    #[serde(default = "default_burn_in")]
    pub burn_in: f64,
}

fn default_filter_width() -> usize {
    3
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            n_topics: 200,
            filter_width: default_filter_width(),
            upper_widths: Vec::new(),
            priors: Priors::default(),
            burn_in: default_burn_in(),
        }
    }
}

fn load_json<T: serde::de::DeserializeOwned>(
    config_path: &str,
) -> Result<T, Box<dyn std::error::Error>> {
    if !Path::new(config_path).exists() {
        return Err(format!("Config file not found at: {}", config_path).into());
    }

    let mut file = File::open(config_path)
        .map_err(|e| format!("Failed to open config file {}: {}", config_path, e))?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| format!("Failed to read config file {}: {}", config_path, e))?;

    let config: T = serde_json::from_str(&contents)
        .map_err(|e| format!("Failed to deserialize JSON from {}: {}", config_path, e))?;

    Ok(config)
}

impl PgbnConfig {
    pub fn load(config_path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        load_json(config_path)
    }
}

impl ConvConfig {
    pub fn load(config_path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        load_json(config_path)
    }
}
