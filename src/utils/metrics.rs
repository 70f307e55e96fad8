//! Evaluation metrics
//!
//! A confusion matrix (rows = actual, columns = predicted) is the single
//! source of truth; per-class precision/recall/F1/support, accuracy and the
//! macro and support-weighted averages are all derived from it.

use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::utils::error::Result;

/// Counts of (actual, predicted) pairs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: vec![vec![0; num_classes]; num_classes],
        }
    }

    /// Pairs `predicted[i]`/`actual[i]`; out-of-range indices are ignored
    pub fn from_predictions(predicted: &[usize], actual: &[usize], num_classes: usize) -> Self {
        let mut matrix = Self::new(num_classes);
        for (&p, &a) in predicted.iter().zip(actual) {
            matrix.record(a, p);
        }
        matrix
    }

    pub fn record(&mut self, actual: usize, predicted: usize) {
        if let Some(cell) = self
            .counts
            .get_mut(actual)
            .and_then(|row| row.get_mut(predicted))
        {
            *cell += 1;
        }
    }

    pub fn count(&self, actual: usize, predicted: usize) -> usize {
        self.counts
            .get(actual)
            .and_then(|row| row.get(predicted))
            .copied()
            .unwrap_or(0)
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    /// Correctly classified samples
    pub fn diagonal(&self) -> usize {
        (0..self.num_classes()).map(|c| self.count(c, c)).sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.diagonal(), self.total())
    }

    /// Samples per actual class
    pub fn row_sums(&self) -> Vec<usize> {
        self.counts.iter().map(|row| row.iter().sum()).collect()
    }

    /// Samples per predicted class
    pub fn col_sums(&self) -> Vec<usize> {
        (0..self.num_classes())
            .map(|col| self.counts.iter().map(|row| row[col]).sum())
            .collect()
    }

    /// Text table with the diagonal bracketed
    pub fn to_table(&self, labels: Option<&[&str]>) -> String {
        let name = |i: usize| -> String {
            labels
                .and_then(|l| l.get(i))
                .map(|s| s.to_string())
                .unwrap_or_else(|| i.to_string())
        };
        let width = (0..self.num_classes())
            .map(|i| name(i).len())
            .max()
            .unwrap_or(1)
            .max(8)
            + 2;

        let mut out = String::from("Confusion matrix (rows = actual, columns = predicted)\n");
        let _ = write!(out, "{:>width$}", "");
        for col in 0..self.num_classes() {
            let _ = write!(out, "{:>width$}", name(col));
        }
        out.push('\n');

        for (r, row) in self.counts.iter().enumerate() {
            let _ = write!(out, "{:>width$}", name(r));
            for (c, count) in row.iter().enumerate() {
                let cell = if r == c {
                    format!("[{}]", count)
                } else {
                    count.to_string()
                };
                let _ = write!(out, "{:>width$}", cell);
            }
            out.push('\n');
        }
        out
    }

    /// Write as CSV with an `actual\predicted` corner cell
    pub fn save_csv(&self, path: &Path, labels: Option<&[&str]>) -> Result<()> {
        let name = |i: usize| -> String {
            labels
                .and_then(|l| l.get(i))
                .map(|s| s.to_string())
                .unwrap_or_else(|| i.to_string())
        };

        let mut writer = csv::Writer::from_path(path)?;
        let header: Vec<String> = std::iter::once("actual\\predicted".to_string())
            .chain((0..self.num_classes()).map(name))
            .collect();
        writer.write_record(&header)?;

        for (r, row) in self.counts.iter().enumerate() {
            let record: Vec<String> = std::iter::once(name(r))
                .chain(row.iter().map(|c| c.to_string()))
                .collect();
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl std::fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_table(None))
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// One row of the classification report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassReport {
    pub class: usize,
    pub name: Option<String>,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Actual samples of this class
    pub support: usize,
}

impl ClassReport {
    fn from_matrix(matrix: &ConfusionMatrix, class: usize, predicted: usize, support: usize) -> Self {
        let hits = matrix.count(class, class);
        let precision = ratio(hits, predicted);
        let recall = ratio(hits, support);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            class,
            name: None,
            precision,
            recall,
            f1,
            support,
        }
    }

    fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.class.to_string())
    }
}

/// Precision/recall/F1 averaged over classes
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Averages {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Evaluation of one prediction set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub total_samples: usize,
    pub accuracy: f64,
    pub classes: Vec<ClassReport>,
    /// Unweighted mean over classes that appear as a label or a prediction
    pub macro_avg: Averages,
    /// Mean weighted by support
    pub weighted_avg: Averages,
    pub confusion_matrix: ConfusionMatrix,
}

impl Metrics {
    /// `predicted` and `actual` are paired by position; extra entries in the
    /// longer slice are ignored.
    pub fn from_predictions(predicted: &[usize], actual: &[usize], num_classes: usize) -> Self {
        let confusion_matrix = ConfusionMatrix::from_predictions(predicted, actual, num_classes);
        let supports = confusion_matrix.row_sums();
        let predicted_counts = confusion_matrix.col_sums();

        let classes: Vec<ClassReport> = (0..num_classes)
            .map(|c| ClassReport::from_matrix(&confusion_matrix, c, predicted_counts[c], supports[c]))
            .collect();

        // Classes that never occur, as label or as prediction, stay out of the macro mean
        let present: Vec<&ClassReport> = classes
            .iter()
            .filter(|c| c.support > 0 || predicted_counts[c.class] > 0)
            .collect();
        let n = present.len().max(1) as f64;
        let macro_avg = Averages {
            precision: present.iter().map(|c| c.precision).sum::<f64>() / n,
            recall: present.iter().map(|c| c.recall).sum::<f64>() / n,
            f1: present.iter().map(|c| c.f1).sum::<f64>() / n,
        };

        let total_samples = confusion_matrix.total();
        let weight = |c: &ClassReport| ratio(c.support, total_samples);
        let weighted_avg = Averages {
            precision: classes.iter().map(|c| c.precision * weight(c)).sum(),
            recall: classes.iter().map(|c| c.recall * weight(c)).sum(),
            f1: classes.iter().map(|c| c.f1 * weight(c)).sum(),
        };

        Self {
            total_samples,
            accuracy: confusion_matrix.accuracy(),
            classes,
            macro_avg,
            weighted_avg,
            confusion_matrix,
        }
    }

    pub fn with_class_names(mut self, names: &[&str]) -> Self {
        for report in &mut self.classes {
            report.name = names.get(report.class).map(|s| s.to_string());
        }
        self
    }

    /// Precision, recall, F1 and support per class, then accuracy and averages
    pub fn classification_report(&self) -> String {
        let width = self
            .classes
            .iter()
            .map(|c| c.label().len())
            .chain(std::iter::once("weighted avg".len()))
            .max()
            .unwrap_or(12);

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:>width$}  {:>9}  {:>9}  {:>9}  {:>9}\n",
            "", "precision", "recall", "f1-score", "support"
        );
        for c in &self.classes {
            let _ = writeln!(
                out,
                "{:>width$}  {:>9.4}  {:>9.4}  {:>9.4}  {:>9}",
                c.label(),
                c.precision,
                c.recall,
                c.f1,
                c.support
            );
        }
        out.push('\n');
        let _ = writeln!(
            out,
            "{:>width$}  {:>9}  {:>9}  {:>9.4}  {:>9}",
            "accuracy", "", "", self.accuracy, self.total_samples
        );
        for (label, avg) in [("macro avg", self.macro_avg), ("weighted avg", self.weighted_avg)] {
            let _ = writeln!(
                out,
                "{:>width$}  {:>9.4}  {:>9.4}  {:>9.4}  {:>9}",
                label, avg.precision, avg.recall, avg.f1, self.total_samples
            );
        }
        out
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl std::fmt::Display for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.classification_report())
    }
}

/// Sample-weighted mean of per-batch losses
#[derive(Debug, Clone, Default)]
pub struct LossMeter {
    weighted_sum: f64,
    samples: usize,
}

impl LossMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a batch mean loss computed over `batch_size` samples
    pub fn update(&mut self, batch_mean: f64, batch_size: usize) {
        self.weighted_sum += batch_mean * batch_size as f64;
        self.samples += batch_size;
    }

    pub fn mean(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.weighted_sum / self.samples as f64
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }
}

/// Running fraction of correct predictions
#[derive(Debug, Clone, Default)]
pub struct AccuracyMeter {
    correct: usize,
    seen: usize,
}

impl AccuracyMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, predicted: &[usize], actual: &[usize]) {
        self.seen += predicted.len().min(actual.len());
        self.correct += predicted.iter().zip(actual).filter(|(p, a)| p == a).count();
    }

    pub fn value(&self) -> f64 {
        ratio(self.correct, self.seen)
    }

    pub fn seen(&self) -> usize {
        self.seen
    }
}
