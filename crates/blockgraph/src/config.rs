//! Engine configuration
//!
//! [`BspConfig`] carries everything the master and workers need to agree on:
//! cluster shape, liveness timeout, checkpoint cadence, retry policy and
//! partition re-balancing. All durations serialize in humantime format
//! (`"30s"`, `"250ms"`), so configs can be written by hand in YAML or JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BspError, Result};

/// Configuration for a BSP job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BspConfig {
    /// Number of worker processes
    pub num_workers: usize,

    /// Number of hash partitions; defaults to four per worker
    pub num_partitions: Option<usize>,

    /// Threads each worker uses for vertex computation
    pub worker_threads: usize,

    /// Liveness timeout for a single barrier
    #[serde(with = "humantime_serde")]
    pub superstep_timeout: Duration,

    /// Upper bound on supersteps, if any
    pub max_supersteps: Option<u64>,

    /// Checkpoint cadence and retention
    pub checkpoint: CheckpointConfig,

    /// Recovery attempts before the job fails
    pub retry: RetryPolicy,

    /// Partition movement between workers at superstep boundaries
    pub rebalance: RebalanceConfig,
}

impl Default for BspConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            num_partitions: None,
            worker_threads: num_cpus::get(),
            superstep_timeout: Duration::from_secs(60),
            max_supersteps: None,
            checkpoint: CheckpointConfig::default(),
            retry: RetryPolicy::default(),
            rebalance: RebalanceConfig::default(),
        }
    }
}

impl BspConfig {
    /// Create a config for the given number of workers
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Parse a YAML document
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document
    pub fn from_json_str(source: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(source).map_err(|e| BspError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_partitions(mut self, num_partitions: usize) -> Self {
        self.num_partitions = Some(num_partitions);
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_superstep_timeout(mut self, timeout: Duration) -> Self {
        self.superstep_timeout = timeout;
        self
    }

    pub fn with_max_supersteps(mut self, limit: u64) -> Self {
        self.max_supersteps = Some(limit);
        self
    }

    pub fn with_checkpoint_frequency(mut self, every: u64) -> Self {
        self.checkpoint.frequency = Some(every);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rebalance(mut self, rebalance: RebalanceConfig) -> Self {
        self.rebalance = rebalance;
        self
    }

    /// Effective partition count
    pub fn partitions(&self) -> usize {
        self.num_partitions.unwrap_or(self.num_workers * 4)
    }

    /// Check invariants the engine relies on
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(BspError::Config("num_workers must be at least 1".into()));
        }
        if self.partitions() < self.num_workers {
            return Err(BspError::Config(format!(
                "num_partitions ({}) must not be smaller than num_workers ({})",
                self.partitions(),
                self.num_workers
            )));
        }
        if self.partitions() > u32::MAX as usize {
            return Err(BspError::Config("num_partitions does not fit in u32".into()));
        }
        if self.worker_threads == 0 {
            return Err(BspError::Config("worker_threads must be at least 1".into()));
        }
        if self.superstep_timeout.is_zero() {
            return Err(BspError::Config("superstep_timeout must be positive".into()));
        }
        if self.checkpoint.frequency == Some(0) {
            return Err(BspError::Config(
                "checkpoint.frequency must be positive when set".into(),
            ));
        }
        if self.checkpoint.keep == 0 {
            return Err(BspError::Config("checkpoint.keep must be at least 1".into()));
        }
        if !(1..=22).contains(&self.checkpoint.compression_level) {
            return Err(BspError::Config(
                "checkpoint.compression_level must be within 1..=22".into(),
            ));
        }
        if self.rebalance.imbalance_threshold <= 0.0 {
            return Err(BspError::Config(
                "rebalance.imbalance_threshold must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Checkpoint cadence and retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Checkpoint after every `frequency` supersteps; `None` disables checkpoints
    pub frequency: Option<u64>,

    /// Number of complete checkpoints to retain
    pub keep: usize,

    /// zstd compression level for snapshot bodies
    pub compression_level: i32,

    /// Storage key prefix
    pub prefix: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            frequency: None,
            keep: 2,
            compression_level: 3,
            prefix: "checkpoints".to_string(),
        }
    }
}

impl CheckpointConfig {
    /// Whether a checkpoint is due after `superstep` completed
    pub fn is_due(&self, superstep: u64) -> bool {
        matches!(self.frequency, Some(every) if (superstep + 1) % every == 0)
    }
}

/// Retry policy for recoverable failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of recoveries per job
    pub max_attempts: u32,

    /// Delay before the first recovery
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound on the delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Exponential delay before recovery attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Partition re-balancing at superstep boundaries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceConfig {
    pub enabled: bool,

    /// Relative spread `(max - min) / mean` of per-worker vertex counts above
    /// which whole partitions are moved
    pub imbalance_threshold: f64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            imbalance_threshold: 0.25,
        }
    }
}
