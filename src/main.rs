// ========================================================================================
//
//                         COMMAND-LINE ENTRY POINT: BIDSURV
//
// ========================================================================================
//
// Loads the three data splits, resolves the training configuration (file first, then
// command-line overrides) and drives one training run. Checkpoints land in the
// output directory whenever the validation loss improves.

use bidsurv::SparseDataset;
use bidsurv::ingest::{IngestError, load_split};
use bidsurv::train::{Trainer, TrainingConfig, snapshot_file_name};
use clap::{Args, CommandFactory, Parser, Subcommand};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

#[derive(Parser)]
#[command(
    name = "bidsurv",
    version,
    about = "Censored survival models for bid landscapes over sparse features"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model and keep the checkpoint with the lowest validation loss
    Train(TrainArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Training split (TSV: time, event, min_bid, max_bid, features)
    #[arg(long, value_name = "PATH")]
    train: PathBuf,

    /// Validation split used for model selection
    #[arg(long, value_name = "PATH")]
    validation: PathBuf,

    /// Test split, evaluated whenever the validation loss improves
    #[arg(long, value_name = "PATH")]
    test: PathBuf,

    /// Width of the feature space; every feature index must be below it
    #[arg(long, value_name = "N")]
    num_features: usize,

    /// TOML file with training hyperparameters
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory receiving parameter snapshots and prediction exports
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    /// Override the number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Override the minibatch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Override the factorization rank (0 disables the pairwise term)
    #[arg(long)]
    k: Option<usize>,

    /// Override the random seed
    #[arg(long)]
    seed: Option<u64>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Train(args)) => train(args),
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("Error: {e}");
                process::exit(1);
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn train(args: TrainArgs) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();

    let mut config = match &args.config {
        Some(path) => {
            log::info!("Loading training configuration from {}", path.display());
            TrainingConfig::load(path)?
        }
        None => TrainingConfig::default(),
    };
    if let Some(epochs) = args.epochs {
        config.num_epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(k) = args.k {
        config.k = k;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }

    let train = load("train", &args.train, args.num_features)?;
    let validation = load("validation", &args.validation, args.num_features)?;
    let test = load("test", &args.test, args.num_features)?;

    let k = config.k;
    let mut trainer = Trainer::new(config, args.num_features)?.with_output_dir(&args.output_dir);
    let report = trainer.fit(&train, &validation, &test)?;

    match &report.best {
        Some(best) => {
            log::info!(
                "Best epoch {}: validation loss = {:.6}, c-index = {:.4}; test loss = {:.6}, c-index = {:.4}",
                best.epoch,
                best.validation_loss,
                best.validation.concordance.unwrap_or(f64::NAN),
                best.test.loss,
                best.test.concordance.unwrap_or(f64::NAN)
            );
            println!(
                "Saved {} to {}",
                snapshot_file_name(k),
                args.output_dir.display()
            );
        }
        None => log::warn!("No epoch was run; nothing was saved"),
    }
    log::info!("Finished in {:.2?}", start_time.elapsed());
    Ok(())
}

fn load(name: &str, path: &Path, num_features: usize) -> Result<SparseDataset, IngestError> {
    let data = load_split(path, num_features)?;
    log::info!(
        "Loaded {} split from {}: {} instances, max {} non-zero features per row",
        name,
        path.display(),
        data.num_instances(),
        data.max_nonzero_len()
    );
    Ok(data)
}
