//! Fog-density classification CLI
//!
//! Trains the two-phase transfer-learning classifier, evaluates saved
//! models and runs predictions on new CCTV images.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use fog_density::backend::{backend_name, default_device, DefaultBackend, TrainingBackend};
use fog_density::config::ExperimentConfig;
use fog_density::dataset::{DatasetStats, CLASS_NAMES};
use fog_density::inference::{collect_image_paths, Predictor};
use fog_density::training::pipeline::{evaluate_run, resolve_run_config, run_pipeline};
use fog_density::utils::logging::{init_logging, LogConfig};

/// Fog-density classification of CCTV images
#[derive(Parser, Debug)]
#[command(name = "fog_density")]
#[command(version)]
#[command(about = "Fine-tune a pre-trained CNN to classify fog density", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error); overrides --verbose
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Experiment configuration (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full two-phase training pipeline
    Train {
        /// Output directory for runs
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Burn record with pre-trained backbone weights
        #[arg(long)]
        pretrained: Option<PathBuf>,

        /// Train from random backbone weights even if the config names a file
        #[arg(long, default_value = "false")]
        no_pretrained: bool,

        /// Batch size
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Split/shuffle seed
        #[arg(long)]
        seed: Option<u64>,

        /// Phase 1 epochs (head only)
        #[arg(long)]
        head_epochs: Option<usize>,

        /// Phase 2 maximum epochs
        #[arg(long)]
        fine_tune_epochs: Option<usize>,

        /// First backbone unit trained in phase 2
        #[arg(long)]
        fine_tune_from: Option<usize>,

        /// Early-stopping patience for phase 2
        #[arg(long)]
        patience: Option<usize>,

        /// Restore the best validation-loss weights after phase 2
        #[arg(long, default_value = "false")]
        restore_best: bool,
    },

    /// Evaluate a saved model on the held-out split of its training run
    ///
    /// Sites come from --config or the run's experiment.json, the split seed
    /// from --seed or the run's split.json.
    Evaluate {
        /// Saved model directory (a training run directory)
        #[arg(short, long)]
        model: PathBuf,

        /// Split seed; defaults to the one recorded in split.json
        #[arg(long)]
        seed: Option<u64>,

        /// Evaluate on every record instead of the test split
        #[arg(long, default_value = "false")]
        all: bool,

        /// Where to write evaluation.json and confusion_matrix.csv
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Predict the fog density of an image or a directory of images
    Predict {
        /// Saved model directory
        #[arg(short, long)]
        model: PathBuf,

        /// Image file or directory
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long, default_value = "16")]
        batch_size: usize,

        /// Print JSON instead of a table
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Show per-site, per-class counts from the metadata
    Stats,

    /// Write a template experiment configuration
    InitConfig {
        #[arg(short, long, default_value = "experiment.json")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    if let Some(level) = &cli.log_level {
        log_config = log_config.with_level_name(level);
    }
    let _ = init_logging(&log_config);

    match cli.command {
        Commands::Train {
            output_dir,
            pretrained,
            no_pretrained,
            batch_size,
            seed,
            head_epochs,
            fine_tune_epochs,
            fine_tune_from,
            patience,
            restore_best,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            if pretrained.is_some() {
                config.pretrained_weights = pretrained;
            }
            if no_pretrained {
                config.pretrained_weights = None;
            }
            if let Some(n) = batch_size {
                config.batch_size = n;
            }
            if seed.is_some() {
                config.split.seed = seed;
            }
            if let Some(n) = head_epochs {
                config.head_training.epochs = n;
            }
            if let Some(n) = fine_tune_epochs {
                config.fine_tuning.epochs = n;
            }
            if fine_tune_from.is_some() {
                config.fine_tune_from = fine_tune_from;
            }
            if let Some(n) = patience {
                config.early_stopping.patience = n;
            }
            if restore_best {
                config.early_stopping.restore_best_weights = true;
            }
            cmd_train(&config)
        }

        Commands::Evaluate {
            model,
            seed,
            all,
            output_dir,
        } => {
            let config = match cli.config.as_deref() {
                Some(path) => Some(load_config(Some(path))?),
                None => None,
            };
            let output_dir = output_dir.unwrap_or_else(|| model.clone());
            cmd_evaluate(config, seed, &model, all, &output_dir)
        }

        Commands::Predict {
            model,
            input,
            batch_size,
            json,
        } => cmd_predict(&model, &input, batch_size, json),

        Commands::Stats => {
            let config = load_config(cli.config.as_deref())?;
            cmd_stats(&config)
        }

        Commands::InitConfig { output } => cmd_init_config(&output),
    }
}

fn load_config(path: Option<&Path>) -> Result<ExperimentConfig> {
    match path {
        Some(path) => ExperimentConfig::load(path)
            .with_context(|| format!("failed to load config {:?}", path)),
        None => bail!("this command needs --config <experiment.json> (see `fog_density init-config`)"),
    }
}

fn cmd_train(config: &ExperimentConfig) -> Result<()> {
    println!("{}", "Fog-density training".green().bold());
    println!("  Backend:          {}", backend_name());
    println!("  Sites:            {}", config.sites.len());
    println!("  Image size:       {}", config.model.image_size);
    println!("  Batch size:       {}", config.batch_size);
    println!(
        "  Phase 1:          {} epochs @ lr {}",
        config.head_training.epochs, config.head_training.learning_rate
    );
    println!(
        "  Phase 2:          up to {} epochs @ lr {} from unit {} (patience {})",
        config.fine_tuning.epochs,
        config.fine_tuning.learning_rate,
        config.resolved_fine_tune_from(),
        config.early_stopping.patience
    );
    println!();

    let device = default_device();
    let report = run_pipeline::<TrainingBackend>(config, &device)?;

    println!();
    println!("{}", "Split".cyan().bold());
    for site in &report.split {
        println!(
            "  {:<16} train {:>6} | test {:>6}",
            site.site, site.train, site.test
        );
    }
    println!("  seed {}", report.seed);

    println!();
    println!(
        "{} phase 1: {} epochs | phase 2: {} epochs{}",
        "→".cyan(),
        report.head_training.epochs_run,
        report.fine_tuning.epochs_run,
        if report.fine_tuning.stopped_early {
            " (early stop)".yellow().to_string()
        } else {
            String::new()
        }
    );

    print_metrics(&report.metrics);
    println!("  💾 Saved to: {:?}", report.run_dir);
    Ok(())
}

fn cmd_evaluate(
    config: Option<ExperimentConfig>,
    seed: Option<u64>,
    model_dir: &Path,
    all: bool,
    output_dir: &Path,
) -> Result<()> {
    let config = resolve_run_config(model_dir, config, seed)
        .with_context(|| format!("cannot evaluate {:?}", model_dir))?;

    let metrics =
        evaluate_run::<DefaultBackend>(model_dir, &config, all, &default_device(), output_dir)?;
    print_metrics(&metrics);
    Ok(())
}

fn cmd_predict(model_dir: &Path, input: &Path, batch_size: usize, json: bool) -> Result<()> {
    let predictor = Predictor::<DefaultBackend>::load(model_dir, default_device())?;
    let paths = collect_image_paths(input)?;
    if paths.is_empty() {
        bail!("no images found under {:?}", input);
    }

    let predictions = predictor.predict_files(&paths, batch_size)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&predictions)?);
        return Ok(());
    }

    for p in &predictions {
        let path = p
            .image_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        println!(
            "{} {} ({:.1}%)",
            path,
            p.class_name.green().bold(),
            p.confidence * 100.0
        );
        let distribution: Vec<String> = CLASS_NAMES
            .iter()
            .zip(&p.probabilities)
            .map(|(name, prob)| format!("{} {:.3}", name, prob))
            .collect();
        println!("    {}", distribution.join(" | "));
    }
    Ok(())
}

fn cmd_stats(config: &ExperimentConfig) -> Result<()> {
    let stats = DatasetStats::from_metadata(&config.sites)?;
    println!("{}", "Dataset statistics".cyan().bold());
    println!("{}", stats);

    for site in &config.sites {
        let n: usize = stats
            .sites
            .iter()
            .find(|(name, _)| name == &site.name)
            .map(|(_, counts)| counts.iter().sum())
            .unwrap_or(0);
        let test = config.split.test_count(n);
        println!(
            "  {:<16} split → train {:>6} | test {:>6}",
            site.name,
            n - test,
            test
        );
    }
    Ok(())
}

fn cmd_init_config(output: &Path) -> Result<()> {
    if output.exists() {
        bail!("{:?} already exists", output);
    }
    ExperimentConfig::template().save(output)?;
    println!("{} Wrote {:?}", "✓".green(), output);
    Ok(())
}

fn print_metrics(metrics: &fog_density::Metrics) {
    println!();
    println!("{}", "Classification report".cyan().bold());
    println!("{}", metrics.classification_report());
    println!("{}", metrics.confusion_matrix.to_table(Some(&CLASS_NAMES[..])));
    println!(
        "{} {:.2}%",
        "Accuracy:".green().bold(),
        metrics.accuracy * 100.0
    );
}
