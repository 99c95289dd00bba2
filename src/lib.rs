// src/lib.rs
//
// Deep Poisson factor models inferred by Gibbs sampling: the Poisson Gamma
// Belief Network over count matrices, and the convolutional Poisson models
// (CPFA, CPGBN) over token sequences. The `dpm` binary wires these into
// train/test/save/load pipelines with classification scoring.

pub mod cli;
pub mod config;
pub mod cpfa;
pub mod cpgbn;
pub mod dataset;
pub mod metric;
pub mod persist;
pub mod pgbn;
pub mod sampler;
pub mod text;
