//! Per-site train/test splitting
//!
//! Each site is shuffled and split on its own, so that one station cannot
//! dominate the test set, and the per-site parts are then concatenated.
//! Test count per site is `ceil(n * test_fraction)`.

use std::path::Path;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::loader::{FogRecord, SiteData};
use crate::utils::error::{FogError, Result};

/// Configuration for splitting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SplitConfig {
    /// Fraction of every site held out for testing
    pub test_fraction: f64,
    /// Shuffle seed; a random one is drawn and logged when absent
    pub seed: Option<u64>,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            test_fraction: 0.2,
            seed: None,
        }
    }
}

impl SplitConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(FogError::Config(format!(
                "test_fraction must be in (0, 1), got {}",
                self.test_fraction
            )));
        }
        Ok(())
    }

    /// Number of test records for a site of `n` records
    pub fn test_count(&self, n: usize) -> usize {
        // The epsilon keeps e.g. 15 * 0.2 = 3.0000000000000004 from rounding up to 4
        let raw = n as f64 * self.test_fraction - 1e-9;
        (raw.ceil().max(0.0) as usize).min(n)
    }
}

/// Train/test counts of one site
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteSplitSummary {
    pub site: String,
    pub total: usize,
    pub train: usize,
    pub test: usize,
}

/// Train and test records, recombined across sites
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    pub train: Vec<FogRecord>,
    pub test: Vec<FogRecord>,
    /// Seed actually used
    pub seed: u64,
    pub sites: Vec<SiteSplitSummary>,
}

/// Contents of `split.json`: the seed and the per-site counts of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitSummary {
    pub seed: u64,
    pub train: usize,
    pub test: usize,
    pub sites: Vec<SiteSplitSummary>,
}

impl SplitSummary {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FogError::PathNotFound(path.to_path_buf()));
        }
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl DatasetSplit {
    pub fn summary(&self) -> SplitSummary {
        SplitSummary {
            seed: self.seed,
            train: self.train.len(),
            test: self.test.len(),
            sites: self.sites.clone(),
        }
    }

    /// Save the split summary (seed + per-site counts) as JSON
    pub fn save_summary(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.summary())?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

impl std::fmt::Display for DatasetSplit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Dataset split (seed {}):", self.seed)?;
        for s in &self.sites {
            writeln!(
                f,
                "  {:<16} total {:>6} | train {:>6} | test {:>6}",
                s.site, s.total, s.train, s.test
            )?;
        }
        writeln!(
            f,
            "  {:<16} total {:>6} | train {:>6} | test {:>6}",
            "all",
            self.train.len() + self.test.len(),
            self.train.len(),
            self.test.len()
        )
    }
}

/// Split every site independently and concatenate the parts
pub fn split_sites(sites: Vec<SiteData>, config: &SplitConfig) -> Result<DatasetSplit> {
    config.validate()?;

    let seed = match config.seed {
        Some(seed) => seed,
        None => {
            let seed = rand::random::<u64>();
            info!("No split seed configured, using random seed {}", seed);
            seed
        }
    };
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let mut train = Vec::new();
    let mut test = Vec::new();
    let mut summaries = Vec::with_capacity(sites.len());

    for site in sites {
        let n = site.records.len();
        let n_test = config.test_count(n);

        let mut records = site.records;
        records.shuffle(&mut rng);
        let site_train = records.split_off(n_test);

        summaries.push(SiteSplitSummary {
            site: site.name,
            total: n,
            train: site_train.len(),
            test: records.len(),
        });
        test.extend(records);
        train.extend(site_train);
    }

    if train.is_empty() {
        return Err(FogError::Dataset("training split is empty".to_string()));
    }

    Ok(DatasetSplit {
        train,
        test,
        seed,
        sites: summaries,
    })
}
