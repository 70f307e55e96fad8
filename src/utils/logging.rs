//! Logging setup
//!
//! The library only emits `tracing` events; the binary installs a compact
//! fmt subscriber. `PhaseLogger` formats the per-epoch lines of a training
//! phase.

use std::str::FromStr;
use std::time::Instant;

use tracing::{debug, info, warn, Level};

/// Subscriber options
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    /// Print the module path of each event
    pub show_target: bool,
    pub show_thread_ids: bool,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            show_target: false,
            show_thread_ids: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    /// `--verbose`: debug events with their origin
    pub fn verbose() -> Self {
        Self {
            level: Level::DEBUG,
            show_target: true,
            show_thread_ids: true,
            ..Self::default()
        }
    }

    /// Level from a name such as `"warn"`; unknown names keep the default
    pub fn with_level_name(mut self, name: &str) -> Self {
        if let Ok(level) = Level::from_str(name) {
            self.level = level;
        }
        self
    }
}

/// Install the global subscriber; errors if one is already set
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(config.level)
        .with_target(config.show_target)
        .with_thread_ids(config.show_thread_ids)
        .with_ansi(config.ansi)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("failed to install log subscriber: {}", e))
}

/// Epoch progress of one training phase
pub struct PhaseLogger {
    phase: String,
    max_epochs: usize,
    epoch: usize,
    epoch_started: Instant,
    phase_started: Instant,
}

impl PhaseLogger {
    pub fn new(phase: &str, max_epochs: usize) -> Self {
        let now = Instant::now();
        Self {
            phase: phase.to_string(),
            max_epochs,
            epoch: 0,
            epoch_started: now,
            phase_started: now,
        }
    }

    pub fn epoch_started(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.epoch_started = Instant::now();
        debug!("[{}] epoch {}/{}", self.phase, epoch + 1, self.max_epochs);
    }

    /// Losses and accuracies (fractions) of the finished epoch
    pub fn epoch_finished(&self, train: (f64, f64), val: (f64, f64)) {
        info!(
            "[{}] Epoch {}/{} ({:.1}s) | loss {:.4} acc {:.2}% | val_loss {:.4} val_acc {:.2}%",
            self.phase,
            self.epoch + 1,
            self.max_epochs,
            self.epoch_started.elapsed().as_secs_f64(),
            train.0,
            train.1 * 100.0,
            val.0,
            val.1 * 100.0
        );
    }

    pub fn val_loss_improved(&self, previous: f64, current: f64) {
        debug!("[{}] val_loss {:.4} -> {:.4}", self.phase, previous, current);
    }

    pub fn stopped_early(&self, patience: usize) {
        warn!(
            "[{}] Early stopping: no val_loss improvement for {} epochs",
            self.phase, patience
        );
    }

    pub fn phase_secs(&self) -> f64 {
        self.phase_started.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(LogConfig::default().level, Level::INFO);
        assert_eq!(LogConfig::verbose().level, Level::DEBUG);
        assert!(LogConfig::verbose().show_target);
    }

    #[test]
    fn test_level_name() {
        assert_eq!(LogConfig::default().with_level_name("warn").level, Level::WARN);
        assert_eq!(LogConfig::default().with_level_name("TRACE").level, Level::TRACE);
        assert_eq!(LogConfig::default().with_level_name("loud").level, Level::INFO);
    }

    #[test]
    fn test_phase_timer_runs() {
        let mut logger = PhaseLogger::new("head", 3);
        logger.epoch_started(0);
        logger.epoch_finished((1.0, 0.25), (1.1, 0.5));
        assert!(logger.phase_secs() >= 0.0);
    }
}
