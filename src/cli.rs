// src/cli.rs
//
// Command line pipelines for the three models. Each subcommand mirrors the
// same flow: load data, fit the model, infer train/test representations,
// persist the globals, reload them, and score a classifier on the inferred
// topic weights.

use clap::{Args, Parser, Subcommand};
use ndarray::Array2;
use std::error::Error;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{ConvConfig, Device, PgbnConfig};
use crate::cpfa::Cpfa;
use crate::cpgbn::Cpgbn;
use crate::dataset;
use crate::metric::{classification_accuracy, Classifier};
use crate::pgbn::{Pgbn, PgbnLocalParams};
use crate::text::TextProcessor;

#[derive(Parser, Debug)]
#[clap(name = "dpm", author, version, about = "Deep Poisson factor models with Gibbs sampling", long_about = None)]
struct CliArgs {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poisson Gamma Belief Network on IDX image counts.
    Pgbn(PgbnArgs),
    /// Convolutional Poisson Factor Analysis on a labelled text corpus.
    Cpfa(ConvArgs),
    /// Convolutional Poisson Gamma Belief Network on a labelled text corpus.
    Cpgbn(ConvArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Directory the trained model archive is written to.
    #[clap(long, value_parser, default_value = "save_models")]
    save_path: PathBuf,
    /// Load globals from an existing archive instead of training.
    #[clap(long, value_parser)]
    load_path: Option<PathBuf>,
    /// Optional JSON config file overriding the model hyperparameters.
    #[clap(long, value_parser)]
    config: Option<String>,
    #[clap(long, value_parser, default_value_t = 100)]
    num_epochs: usize,
    /// Gibbs sweeps used for test-time inference.
    #[clap(long, value_parser, default_value_t = 20)]
    test_epochs: usize,
    #[clap(long, value_parser, default_value_t = 0)]
    seed: u64,
    #[clap(long, value_parser, default_value = "cpu")]
    device: Device,
    /// Cap on the number of training items. Defaults follow the demos:
    /// 999 images for pgbn, 3000 documents for cpfa, 5000 for cpgbn.
    #[clap(long, value_parser)]
    max_train: Option<usize>,
    /// Cap on the number of test items: 999 images for pgbn, 1000
    /// documents for the text models.
    #[clap(long, value_parser)]
    max_test: Option<usize>,
}

const PGBN_CAPS: (usize, usize) = (999, 999);
const CPFA_CAPS: (usize, usize) = (3000, 1000);
const CPGBN_CAPS: (usize, usize) = (5000, 1000);

fn resolve_caps(common: &CommonArgs, defaults: (usize, usize)) -> (usize, usize) {
    (
        common.max_train.unwrap_or(defaults.0),
        common.max_test.unwrap_or(defaults.1),
    )
}

#[derive(Args, Debug)]
struct PgbnArgs {
    #[clap(long, value_parser)]
    train_images: PathBuf,
    #[clap(long, value_parser)]
    train_labels: PathBuf,
    #[clap(long, value_parser)]
    test_images: PathBuf,
    #[clap(long, value_parser)]
    test_labels: PathBuf,
    /// Topic counts per layer, bottom-up.
    #[clap(long, value_parser, value_delimiter = ',', default_value = "128,64,32")]
    z_dims: Vec<usize>,
    #[clap(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct ConvArgs {
    /// Training corpus: one "label<TAB>text" line per document.
    #[clap(long, value_parser)]
    train_file: PathBuf,
    #[clap(long, value_parser)]
    test_file: PathBuf,
    /// Number of convolutional topics.
    #[clap(long, value_parser, default_value_t = 200)]
    z_dim: usize,
    #[clap(long, value_parser, default_value_t = 3)]
    filter_width: usize,
    /// Gamma layer widths stacked above the convolutional layer.
    /// Used by cpgbn only, defaulting to 100,50; ignored by cpfa.
    #[clap(long, value_parser, value_delimiter = ',')]
    upper_widths: Option<Vec<usize>>,
    /// Vocabulary cap, special tokens included.
    #[clap(long, value_parser, default_value_t = 5000)]
    max_vocab: usize,
    #[clap(flatten)]
    common: CommonArgs,
}

pub fn run_cli() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();
    match args.command {
        Command::Pgbn(a) => run_pgbn(a),
        Command::Cpfa(a) => run_conv(a, false),
        Command::Cpgbn(a) => run_conv(a, true),
    }
}

fn resolve_device(device: Device) {
    if device == Device::Gpu {
        warn!("GPU execution is not available, falling back to CPU");
    }
}

/// CPGBN stacks two gamma layers by default, matching its demo's
/// `[200, 100, 50]` shape with the 200 convolutional topics at the bottom.
/// CPFA never carries upper layers.
fn resolve_upper_widths(deep: bool, flag: &Option<Vec<usize>>) -> Vec<usize> {
    if !deep {
        return Vec::new();
    }
    flag.clone().unwrap_or_else(|| vec![100, 50])
}

fn report_accuracy(
    train_theta: &Array2<f64>,
    test_theta: &Array2<f64>,
    train_labels: &[usize],
    test_labels: &[usize],
) -> Result<(), Box<dyn Error>> {
    // Topic score matrices are K x N; classifiers want one row per document.
    let train_features = train_theta.t().to_owned();
    let test_features = test_theta.t().to_owned();

    let centroid = classification_accuracy(
        &train_features,
        &test_features,
        train_labels,
        test_labels,
        Classifier::NearestCentroid,
    )?;
    let knn = classification_accuracy(
        &train_features,
        &test_features,
        train_labels,
        test_labels,
        Classifier::Knn(5),
    )?;
    println!("Nearest-centroid accuracy: {:.4}", centroid);
    println!("5-NN cosine accuracy:      {:.4}", knn);
    Ok(())
}

fn run_pgbn(args: PgbnArgs) -> Result<(), Box<dyn Error>> {
    resolve_device(args.common.device);

    let (max_train, max_test) = resolve_caps(&args.common, PGBN_CAPS);
    let train_data = dataset::load_idx_images(&args.train_images, max_train)?;
    let train_labels = dataset::load_idx_labels(&args.train_labels, max_train)?;
    let test_data = dataset::load_idx_images(&args.test_images, max_test)?;
    let test_labels = dataset::load_idx_labels(&args.test_labels, max_test)?;
    info!(
        n_train = train_data.ncols(),
        n_test = test_data.ncols(),
        features = train_data.nrows(),
        "loaded IDX data"
    );

    let mut config = match &args.common.config {
        Some(path) => PgbnConfig::load(path)?,
        None => PgbnConfig::default(),
    };
    if args.common.config.is_none() {
        config.layer_widths = args.z_dims.clone();
    }

    let mut model = Pgbn::new(config, args.common.seed)?;
    match &args.common.load_path {
        Some(path) => {
            model.load(path)?;
            info!(path = %path.display(), "loaded pretrained globals");
        }
        None => {
            model.initial(&train_data)?;
            model.train(&train_data, args.common.num_epochs)?;
            let saved = model.save(&args.common.save_path)?;
            info!(path = %saved.display(), "saved trained globals");
            reload_pgbn(&mut model, &saved)?;
        }
    }

    let train_local = model.test(&train_data, args.common.test_epochs)?;
    let test_local = model.test(&test_data, args.common.test_epochs)?;
    print_likelihood(&model, &train_data, &train_local, "train")?;
    print_likelihood(&model, &test_data, &test_local, "test")?;

    report_accuracy(
        &train_local.theta[0],
        &test_local.theta[0],
        &train_labels,
        &test_labels,
    )
}

fn reload_pgbn(model: &mut Pgbn, path: &Path) -> Result<(), Box<dyn Error>> {
    model.load(path)?;
    info!(path = %path.display(), "reloaded globals from archive");
    Ok(())
}

fn print_likelihood(
    model: &Pgbn,
    data: &Array2<f64>,
    locals: &PgbnLocalParams,
    split: &str,
) -> Result<(), Box<dyn Error>> {
    let ll = model.log_likelihood(data, locals)?;
    println!("{} log-likelihood per document: {:.4}", split, ll);
    Ok(())
}

fn run_conv(args: ConvArgs, deep: bool) -> Result<(), Box<dyn Error>> {
    resolve_device(args.common.device);

    let (max_train, max_test) =
        resolve_caps(&args.common, if deep { CPGBN_CAPS } else { CPFA_CAPS });
    let train_docs = dataset::load_tsv_corpus(&args.train_file, max_train)?;
    let test_docs = dataset::load_tsv_corpus(&args.test_file, max_test)?;

    let processor = TextProcessor::fit(&train_docs, args.max_vocab);
    let (train_batch, train_labels) = processor.batch(&train_docs);
    let (test_batch, test_labels) = processor.batch(&test_docs);
    info!(
        n_train = train_batch.n_docs(),
        n_test = test_batch.n_docs(),
        vocab = processor.vocab.len(),
        "built sparse batches"
    );

    let mut config = match &args.common.config {
        Some(path) => ConvConfig::load(path)?,
        None => ConvConfig::default(),
    };
    if args.common.config.is_none() {
        config.n_topics = args.z_dim;
        config.filter_width = args.filter_width;
        config.upper_widths = resolve_upper_widths(deep, &args.upper_widths);
    }

    let (train_theta, test_theta) = if deep {
        run_cpgbn_model(config, &args, &train_batch, &test_batch)?
    } else {
        run_cpfa_model(config, &args, &train_batch, &test_batch)?
    };

    report_accuracy(&train_theta, &test_theta, &train_labels, &test_labels)
}

fn run_cpfa_model(
    config: ConvConfig,
    args: &ConvArgs,
    train_batch: &crate::text::SparseBatch,
    test_batch: &crate::text::SparseBatch,
) -> Result<(Array2<f64>, Array2<f64>), Box<dyn Error>> {
    let mut model = Cpfa::new(config, args.common.seed)?;
    match &args.common.load_path {
        Some(path) => {
            model.load(path)?;
            info!(path = %path.display(), "loaded pretrained globals");
        }
        None => {
            model.initial(train_batch)?;
            model.train(train_batch, args.common.num_epochs)?;
            let saved = model.save(&args.common.save_path)?;
            info!(path = %saved.display(), "saved trained globals");
            model.load(&saved)?;
        }
    }
    let train_local = model.test(train_batch, args.common.test_epochs)?;
    let test_local = model.test(test_batch, args.common.test_epochs)?;
    Ok((train_local.pooled_theta(), test_local.pooled_theta()))
}

fn run_cpgbn_model(
    config: ConvConfig,
    args: &ConvArgs,
    train_batch: &crate::text::SparseBatch,
    test_batch: &crate::text::SparseBatch,
) -> Result<(Array2<f64>, Array2<f64>), Box<dyn Error>> {
    let mut model = Cpgbn::new(config, args.common.seed)?;
    match &args.common.load_path {
        Some(path) => {
            model.load(path)?;
            info!(path = %path.display(), "loaded pretrained globals");
        }
        None => {
            model.initial(train_batch)?;
            model.train(train_batch, args.common.num_epochs)?;
            let saved = model.save(&args.common.save_path)?;
            info!(path = %saved.display(), "saved trained globals");
            model.load(&saved)?;
        }
    }
    let train_local = model.test(train_batch, args.common.test_epochs)?;
    let test_local = model.test(test_batch, args.common.test_epochs)?;
    Ok((train_local.pooled_theta(), test_local.pooled_theta()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common(max_train: Option<usize>, max_test: Option<usize>) -> CommonArgs {
        CommonArgs {
            save_path: PathBuf::from("save_models"),
            load_path: None,
            config: None,
            num_epochs: 1,
            test_epochs: 1,
            seed: 0,
            device: Device::Cpu,
            max_train,
            max_test,
        }
    }

    #[test]
    fn test_cpgbn_gets_deep_stack_by_default() {
        assert_eq!(resolve_upper_widths(true, &None), vec![100, 50]);
    }

    #[test]
    fn test_cpgbn_upper_widths_flag_overrides_default() {
        assert_eq!(
            resolve_upper_widths(true, &Some(vec![64, 32, 16])),
            vec![64, 32, 16]
        );
    }

    #[test]
    fn test_cpfa_never_carries_upper_layers() {
        assert!(resolve_upper_widths(false, &None).is_empty());
        assert!(resolve_upper_widths(false, &Some(vec![100, 50])).is_empty());
    }

    #[test]
    fn test_caps_default_per_subcommand() {
        assert_eq!(resolve_caps(&common(None, None), PGBN_CAPS), (999, 999));
        assert_eq!(resolve_caps(&common(None, None), CPFA_CAPS), (3000, 1000));
        assert_eq!(resolve_caps(&common(None, None), CPGBN_CAPS), (5000, 1000));
    }

    #[test]
    fn test_caps_flags_override_defaults() {
        assert_eq!(
            resolve_caps(&common(Some(42), None), CPGBN_CAPS),
            (42, 1000)
        );
        assert_eq!(
            resolve_caps(&common(None, Some(7)), PGBN_CAPS),
            (999, 7)
        );
    }
}
