//! End-to-end training pipeline
//!
//! load sites -> split per site -> build model -> phase 1 (head) ->
//! phase 2 (fine-tune with early stopping) -> save -> reload -> evaluate.

use std::path::{Path, PathBuf};

use burn::config::Config;
use burn::module::{AutodiffModule, Module};
use burn::tensor::backend::{AutodiffBackend, Backend};
use chrono::Local;
use tracing::info;

use crate::config::ExperimentConfig;
use crate::dataset::split::SiteSplitSummary;
use crate::dataset::{
    load_sites, split_sites, DatasetStats, FogBatcher, FogDataset, SplitSummary, CLASS_NAMES,
};
use crate::inference::Predictor;
use crate::model::{FogClassifier, FogClassifierConfig, MODEL_CONFIG_FILE};
use crate::training::freeze::FreezePolicy;
use crate::training::trainer::{PhaseOutcome, Trainer};
use crate::utils::error::{FogError, Result};
use crate::utils::format_duration;
use crate::utils::metrics::Metrics;
use crate::NUM_CLASSES;

pub const HISTORY_FILE: &str = "history.csv";
pub const EVALUATION_FILE: &str = "evaluation.json";
pub const CONFUSION_MATRIX_FILE: &str = "confusion_matrix.csv";
pub const SPLIT_FILE: &str = "split.json";
pub const EXPERIMENT_FILE: &str = "experiment.json";

/// Everything a pipeline run produced
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub run_dir: PathBuf,
    pub seed: u64,
    pub split: Vec<SiteSplitSummary>,
    pub head_training: PhaseOutcome,
    pub fine_tuning: PhaseOutcome,
    pub metrics: Metrics,
}

/// Create `output_dir/run_<timestamp>`
pub fn create_run_dir(output_dir: &Path) -> Result<PathBuf> {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let run_dir = output_dir.join(format!("run_{}", timestamp));
    std::fs::create_dir_all(&run_dir)?;
    Ok(run_dir)
}

/// Evaluate a saved model on a dataset and write the report files into `dir`
pub fn evaluate_saved_model<B: Backend>(
    model_dir: &Path,
    dataset: &FogDataset,
    batch_size: usize,
    device: &B::Device,
    report_dir: &Path,
) -> Result<Metrics> {
    let predictor = Predictor::<B>::load(model_dir, device.clone())?;
    let predictions = predictor.predict_dataset(dataset, batch_size)?;

    let predicted: Vec<usize> = predictions.iter().map(|p| p.predicted_class).collect();
    let metrics = Metrics::from_predictions(&predicted, &dataset.labels(), NUM_CLASSES)
        .with_class_names(&CLASS_NAMES);

    std::fs::create_dir_all(report_dir)?;
    metrics.save_json(&report_dir.join(EVALUATION_FILE))?;
    metrics
        .confusion_matrix
        .save_csv(&report_dir.join(CONFUSION_MATRIX_FILE), Some(&CLASS_NAMES[..]))?;

    Ok(metrics)
}

/// Experiment config and split seed of a training run directory
///
/// `config` replaces the run's own `experiment.json`. The seed comes from
/// `seed` if given, otherwise from the run's `split.json`, so the test split
/// is the one the model never trained on.
pub fn resolve_run_config(
    run_dir: &Path,
    config: Option<ExperimentConfig>,
    seed: Option<u64>,
) -> Result<ExperimentConfig> {
    let mut config = match config {
        Some(config) => config,
        None => {
            let path = run_dir.join(EXPERIMENT_FILE);
            if !path.exists() {
                return Err(FogError::Config(format!(
                    "no experiment config given and {:?} does not exist",
                    path
                )));
            }
            ExperimentConfig::load(&path)?
        }
    };

    let split_path = run_dir.join(SPLIT_FILE);
    if seed.is_some() {
        config.split.seed = seed;
    } else if split_path.exists() {
        let summary = SplitSummary::load(&split_path)?;
        info!("Using split seed {} from {:?}", summary.seed, split_path);
        config.split.seed = Some(summary.seed);
    }
    Ok(config)
}

/// Evaluate the model saved in `run_dir` on the test split of `config`
/// (or on every record with `all`) and write the report files into `report_dir`
pub fn evaluate_run<B: Backend>(
    run_dir: &Path,
    config: &ExperimentConfig,
    all: bool,
    device: &B::Device,
    report_dir: &Path,
) -> Result<Metrics> {
    let model_config_path = run_dir.join(MODEL_CONFIG_FILE);
    if !model_config_path.exists() {
        return Err(FogError::PathNotFound(model_config_path));
    }
    let model_config = FogClassifierConfig::load(&model_config_path).map_err(|e| {
        FogError::Model(format!("failed to read {:?}: {:?}", model_config_path, e))
    })?;
    let image_size = model_config.image_size;

    let sites = load_sites(&config.sites, image_size)?;
    let records = if all {
        sites.into_iter().flat_map(|s| s.records).collect::<Vec<_>>()
    } else {
        if config.split.seed.is_none() {
            return Err(FogError::Config(format!(
                "no split seed for {:?}: {} is missing and none was given",
                run_dir, SPLIT_FILE
            )));
        }
        split_sites(sites, &config.split)?.test
    };

    let dataset = FogDataset::from_records(&records, image_size)?;
    info!("Evaluating on {} images", records.len());

    evaluate_saved_model::<B>(run_dir, &dataset, config.batch_size, device, report_dir)
}

/// Run the whole experiment
pub fn run_pipeline<B: AutodiffBackend>(
    config: &ExperimentConfig,
    device: &B::Device,
) -> Result<PipelineReport> {
    config.validate()?;
    let started = std::time::Instant::now();

    let run_dir = create_run_dir(&config.output_dir)?;
    config.save(&run_dir.join(EXPERIMENT_FILE))?;
    info!("Run directory: {:?}", run_dir);

    // Data
    let sites = load_sites(&config.sites, config.model.image_size)?;
    info!("Dataset:\n{}", DatasetStats::from_sites(&sites));

    let split = split_sites(sites, &config.split)?;
    split.save_summary(&run_dir.join(SPLIT_FILE))?;
    info!("{}", split);

    let image_size = config.model.image_size;
    let train = FogDataset::from_records(&split.train, image_size)?;
    let test = FogDataset::from_records(&split.test, image_size)?;

    // Model
    let model: FogClassifier<B> = config
        .model
        .build(config.pretrained_weights.as_deref(), device)?;
    let batcher = FogBatcher::new(image_size)
        .with_imagenet_normalization(config.model.imagenet_normalization);
    let mut trainer = Trainer::<B>::new(batcher, config.batch_size, split.seed, device.clone());

    // Phase 1: head only
    let mut policy = FreezePolicy::frozen_backbone(model.num_backbone_units());
    let (model, head_training) = trainer.run_phase(
        "head",
        model,
        &policy,
        &config.head_training,
        None,
        &train,
        &test,
    )?;

    // Phase 2: unfreeze the backbone suffix
    policy.unfreeze_from(config.resolved_fine_tune_from())?;
    let (model, fine_tuning) = trainer.run_phase(
        "fine_tune",
        model,
        &policy,
        &config.fine_tuning,
        Some(&config.early_stopping),
        &train,
        &test,
    )?;

    trainer.history().save_csv(&run_dir.join(HISTORY_FILE))?;

    // Persist, then evaluate the reloaded model
    let inference_model = model.valid();
    inference_model.save(&run_dir, &config.model)?;
    let inner_device = inference_model.devices().into_iter().next().unwrap_or_default();
    drop(inference_model);

    let metrics = evaluate_saved_model::<B::InnerBackend>(
        &run_dir,
        &test,
        config.batch_size,
        &inner_device,
        &run_dir,
    )?;

    info!(
        "Pipeline finished in {} | test accuracy {:.2}%",
        format_duration(started.elapsed()),
        metrics.accuracy * 100.0
    );

    Ok(PipelineReport {
        run_dir,
        seed: split.seed,
        split: split.sites,
        head_training,
        fine_tuning,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::loader::tests::write_site;
    use crate::training::{EarlyStoppingConfig, PhaseConfig};
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn test_pipeline_end_to_end() {
        let dir = tempfile::TempDir::new().unwrap();
        let site_a = write_site(dir.path(), "site_a", &[0, 1, 2, 3, 0, 1, 2, 3, 0, 1]);
        let site_b = write_site(dir.path(), "site_b", &[3, 2, 1, 0, 3, 2]);

        let mut config = ExperimentConfig {
            sites: vec![site_a, site_b],
            model: FogClassifierConfig::tiny(32),
            batch_size: 4,
            head_training: PhaseConfig {
                epochs: 1,
                ..PhaseConfig::head_training()
            },
            fine_tuning: PhaseConfig {
                epochs: 2,
                ..PhaseConfig::fine_tuning()
            },
            early_stopping: EarlyStoppingConfig {
                patience: 1,
                ..Default::default()
            },
            output_dir: dir.path().join("out"),
            ..Default::default()
        };
        // No seed: the run draws one and records it in split.json
        config.split.seed = None;

        let device = Default::default();
        let report = run_pipeline::<TestBackend>(&config, &device).unwrap();

        // 10 -> 2 test, 6 -> 2 test
        assert_eq!(report.split[0].test, 2);
        assert_eq!(report.split[1].test, 2);
        assert_eq!(report.metrics.total_samples, 4);
        assert_eq!(report.head_training.epochs_run, 1);
        assert!(report.fine_tuning.epochs_run >= 1 && report.fine_tuning.epochs_run <= 2);

        let row_sums: usize = report.metrics.confusion_matrix.row_sums().iter().sum();
        assert_eq!(row_sums, 4);

        for file in [
            HISTORY_FILE,
            EVALUATION_FILE,
            CONFUSION_MATRIX_FILE,
            SPLIT_FILE,
            EXPERIMENT_FILE,
            MODEL_CONFIG_FILE,
            "fog_classifier.mpk",
        ] {
            assert!(report.run_dir.join(file).exists(), "missing {}", file);
        }

        // Re-evaluating the run directory recovers the same held-out split
        let resolved = resolve_run_config(&report.run_dir, None, None).unwrap();
        assert_eq!(resolved.split.seed, Some(report.seed));

        let report_dir = dir.path().join("reeval");
        let metrics =
            evaluate_run::<NdArray>(&report.run_dir, &resolved, false, &device, &report_dir).unwrap();
        assert_eq!(metrics.total_samples, 4);
        assert_eq!(metrics.confusion_matrix, report.metrics.confusion_matrix);
        assert!(report_dir.join(EVALUATION_FILE).exists());

        let everything =
            evaluate_run::<NdArray>(&report.run_dir, &resolved, true, &device, &report_dir).unwrap();
        assert_eq!(everything.total_samples, 16);
    }

    #[test]
    fn test_resolve_run_config_sources() {
        let dir = tempfile::TempDir::new().unwrap();
        let run_dir = dir.path();

        // Nothing to go on
        let err = resolve_run_config(run_dir, None, None).unwrap_err();
        assert!(matches!(err, FogError::Config(_)));

        let mut config = ExperimentConfig::template();
        config.split.seed = None;
        config.save(&run_dir.join(EXPERIMENT_FILE)).unwrap();

        // experiment.json without split.json: no seed yet
        let resolved = resolve_run_config(run_dir, None, None).unwrap();
        assert_eq!(resolved.sites, config.sites);
        assert_eq!(resolved.split.seed, None);

        std::fs::write(
            run_dir.join(SPLIT_FILE),
            r#"{"seed": 1234, "train": 8, "test": 2, "sites": []}"#,
        )
        .unwrap();
        assert_eq!(resolve_run_config(run_dir, None, None).unwrap().split.seed, Some(1234));

        // An explicit seed wins over the recorded one
        let explicit = resolve_run_config(run_dir, Some(config), Some(7)).unwrap();
        assert_eq!(explicit.split.seed, Some(7));
    }

    #[test]
    fn test_evaluate_run_without_seed_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let site = write_site(dir.path(), "site_a", &[0, 1, 2, 3]);

        let model_config = FogClassifierConfig::tiny(32);
        model_config
            .init::<NdArray>(&Default::default())
            .save(dir.path(), &model_config)
            .unwrap();

        let config = ExperimentConfig {
            sites: vec![site],
            ..Default::default()
        };
        let err = evaluate_run::<NdArray>(dir.path(), &config, false, &Default::default(), dir.path())
            .unwrap_err();
        assert!(matches!(err, FogError::Config(_)));
    }
}
