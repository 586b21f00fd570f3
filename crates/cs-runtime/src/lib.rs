#![forbid(unsafe_code)]

//! Execution settings for the reduction and filter engine: strategy
//! thresholds, parallelism and the crate-local worker pool.

use std::sync::OnceLock;

use cs_types::NumericKind;
use log::{debug, warn};
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Below this many rows a sum loops over native values into a widened
/// accumulator; at or above it the column is cast and summed vectorized.
pub const DEFAULT_CAST_SUM_THRESHOLD: usize = 150_000;

/// Sums over more rows than this are split into concurrent chunks.
pub const DEFAULT_PARALLEL_SUM_THRESHOLD: usize = 100_000;

pub const ENV_CAST_SUM_THRESHOLD: &str = "COLSTAT_CAST_SUM_THRESHOLD";
pub const ENV_PARALLEL_SUM_THRESHOLD: &str = "COLSTAT_PARALLEL_SUM_THRESHOLD";
pub const ENV_MAX_PARALLELISM: &str = "COLSTAT_MAX_PARALLELISM";
pub const ENV_PARALLEL_FILTER: &str = "COLSTAT_PARALLEL_FILTER";
pub const ENV_THREADS: &str = "COLSTAT_THREADS";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid execution config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{field} must be at least 1")]
    ZeroValue { field: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub cast_sum_threshold: usize,
    pub parallel_sum_threshold: usize,
    /// Chunk count for parallel sums; the pool's thread count when unset.
    pub max_parallelism: Option<usize>,
    pub parallel_filter: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            cast_sum_threshold: DEFAULT_CAST_SUM_THRESHOLD,
            parallel_sum_threshold: DEFAULT_PARALLEL_SUM_THRESHOLD,
            max_parallelism: None,
            parallel_filter: true,
        }
    }
}

impl ExecutionConfig {
    /// Everything on the caller's thread.
    #[must_use]
    pub fn serial() -> Self {
        Self {
            parallel_sum_threshold: usize::MAX,
            max_parallelism: Some(1),
            parallel_filter: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_cast_sum_threshold(mut self, threshold: usize) -> Self {
        self.cast_sum_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_parallel_sum_threshold(mut self, threshold: usize) -> Self {
        self.parallel_sum_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_max_parallelism(mut self, parallelism: usize) -> Self {
        self.max_parallelism = Some(parallelism);
        self
    }

    #[must_use]
    pub fn with_parallel_filter(mut self, enabled: bool) -> Self {
        self.parallel_filter = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.max_parallelism == Some(0) {
            return Err(RuntimeError::ZeroValue {
                field: "max_parallelism",
            });
        }
        Ok(())
    }

    /// Parses a JSON object; absent fields keep their defaults.
    pub fn from_json_str(input: &str) -> Result<Self, RuntimeError> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `COLSTAT_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ExecutionConfig::from_env`] with an arbitrary variable source.
    /// Unparseable values are logged and ignored.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(value) = parse_var(&lookup, ENV_CAST_SUM_THRESHOLD, parse_count) {
            config.cast_sum_threshold = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_PARALLEL_SUM_THRESHOLD, parse_count) {
            config.parallel_sum_threshold = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_MAX_PARALLELISM, parse_positive) {
            config.max_parallelism = Some(value);
        }
        if let Some(value) = parse_var(&lookup, ENV_PARALLEL_FILTER, parse_flag) {
            config.parallel_filter = value;
        }
        config
    }

    /// Process-wide configuration, read from the environment on first use.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<ExecutionConfig> = OnceLock::new();
        GLOBAL.get_or_init(Self::from_env)
    }

    /// Number of chunks a parallel reduction is split into.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.max_parallelism
            .unwrap_or_else(|| pool().map_or(1, ThreadPool::current_num_threads))
            .max(1)
    }

    /// Unchunked strategy for `len` rows of `kind`.
    #[must_use]
    pub fn serial_strategy(&self, kind: NumericKind, len: usize) -> SumStrategy {
        if kind.is_accumulator() || len >= self.cast_sum_threshold {
            SumStrategy::CastVectorized
        } else {
            SumStrategy::Loop
        }
    }

    /// Picks how a sum over `len` rows of `kind` runs.
    #[must_use]
    pub fn plan_sum(&self, kind: NumericKind, len: usize) -> SumPlan {
        let parallelism = self.parallelism();
        if len > self.parallel_sum_threshold && parallelism > 1 {
            let chunk_size = len.div_ceil(parallelism);
            let plan = SumPlan {
                strategy: SumStrategy::Chunked,
                chunks: len.div_ceil(chunk_size),
                chunk_size,
            };
            debug!(
                "sum over {len} {kind} rows: {} chunks of up to {chunk_size}",
                plan.chunks
            );
            return plan;
        }
        let strategy = self.serial_strategy(kind, len);
        debug!("sum over {len} {kind} rows: {strategy:?}");
        SumPlan {
            strategy,
            chunks: 1,
            chunk_size: len,
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = lookup(key)?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        warn!("ignoring {key}={raw:?}: not a valid value");
    }
    parsed
}

fn parse_count(raw: &str) -> Option<usize> {
    raw.replace('_', "").parse().ok()
}

fn parse_positive(raw: &str) -> Option<usize> {
    parse_count(raw).filter(|&value| value > 0)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SumStrategy {
    /// Native values accumulated one by one into the widened type.
    Loop,
    /// Cast to the widened type, then the lane-unrolled kernel.
    CastVectorized,
    /// Contiguous zero-copy chunks summed concurrently.
    Chunked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SumPlan {
    pub strategy: SumStrategy,
    pub chunks: usize,
    pub chunk_size: usize,
}

// ── Worker pool ────────────────────────────────────────────────────────

static POOL: OnceLock<Option<ThreadPool>> = OnceLock::new();

fn desired_threads() -> usize {
    [ENV_THREADS, "RAYON_NUM_THREADS"]
        .into_iter()
        .find_map(|key| {
            std::env::var(key)
                .ok()
                .and_then(|raw| parse_positive(raw.trim()))
        })
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

fn build_pool() -> Option<ThreadPool> {
    let requested = desired_threads().max(1);
    let try_build = |threads: usize| {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|idx| format!("colstat-{idx}"))
            .build()
    };
    match try_build(requested) {
        Ok(pool) => Some(pool),
        Err(err) if requested > 1 => {
            warn!("worker pool with {requested} threads unavailable ({err}); using one");
            try_build(1).ok()
        }
        Err(err) => {
            warn!("worker pool unavailable ({err}); running serially");
            None
        }
    }
}

/// The crate-local worker pool, if one could be created.
pub fn pool() -> Option<&'static ThreadPool> {
    POOL.get_or_init(build_pool).as_ref()
}

/// Runs `op` inside the worker pool, or on the caller's thread without one.
pub fn install<R, F>(op: F) -> R
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    match pool() {
        Some(pool) => pool.install(op),
        None => op(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use cs_types::NumericKind;

    use super::{
        DEFAULT_CAST_SUM_THRESHOLD, DEFAULT_PARALLEL_SUM_THRESHOLD, ENV_CAST_SUM_THRESHOLD,
        ENV_MAX_PARALLELISM, ENV_PARALLEL_FILTER, ENV_PARALLEL_SUM_THRESHOLD, ExecutionConfig,
        RuntimeError, SumPlan, SumStrategy, install,
    };

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = ExecutionConfig::default();
        assert_eq!(config.cast_sum_threshold, 150_000);
        assert_eq!(config.parallel_sum_threshold, 100_000);
        assert_eq!(config.max_parallelism, None);
        assert!(config.parallel_filter);
    }

    #[test]
    fn serial_config_never_chunks() {
        let config = ExecutionConfig::serial();
        assert_eq!(config.parallelism(), 1);
        let plan = config.plan_sum(NumericKind::Int32, 10_000_000);
        assert_eq!(plan.strategy, SumStrategy::CastVectorized);
        assert_eq!(plan.chunks, 1);
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = ExecutionConfig::from_json_str(r#"{"cast_sum_threshold": 10}"#)
            .expect("valid config");
        assert_eq!(config.cast_sum_threshold, 10);
        assert_eq!(config.parallel_sum_threshold, DEFAULT_PARALLEL_SUM_THRESHOLD);

        let json = serde_json::to_string(&config).expect("serialize");
        let back = ExecutionConfig::from_json_str(&json).expect("round trip");
        assert_eq!(back, config);
    }

    #[test]
    fn json_rejects_zero_parallelism_and_garbage() {
        assert!(matches!(
            ExecutionConfig::from_json_str(r#"{"max_parallelism": 0}"#),
            Err(RuntimeError::ZeroValue {
                field: "max_parallelism"
            })
        ));
        assert!(matches!(
            ExecutionConfig::from_json_str("{not json"),
            Err(RuntimeError::Json(_))
        ));
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let config = ExecutionConfig::from_lookup(lookup(&[
            (ENV_CAST_SUM_THRESHOLD, "1_000"),
            (ENV_PARALLEL_SUM_THRESHOLD, "lots"),
            (ENV_MAX_PARALLELISM, "0"),
            (ENV_PARALLEL_FILTER, "off"),
        ]));
        assert_eq!(config.cast_sum_threshold, 1_000);
        assert_eq!(config.parallel_sum_threshold, DEFAULT_PARALLEL_SUM_THRESHOLD);
        assert_eq!(config.max_parallelism, None);
        assert!(!config.parallel_filter);
    }

    #[test]
    fn strategy_switches_at_cast_threshold() {
        let config = ExecutionConfig::serial();
        let below = DEFAULT_CAST_SUM_THRESHOLD - 1;
        assert_eq!(config.serial_strategy(NumericKind::Int8, below), SumStrategy::Loop);
        assert_eq!(
            config.serial_strategy(NumericKind::Int8, DEFAULT_CAST_SUM_THRESHOLD),
            SumStrategy::CastVectorized
        );
        assert_eq!(config.serial_strategy(NumericKind::Float32, 3), SumStrategy::Loop);
    }

    #[test]
    fn wide_kinds_always_use_the_vectorized_kernel() {
        let config = ExecutionConfig::serial();
        for kind in [NumericKind::Int64, NumericKind::UInt64, NumericKind::Float64] {
            assert_eq!(config.serial_strategy(kind, 1), SumStrategy::CastVectorized);
        }
    }

    #[test]
    fn chunk_size_rounds_up() {
        let config = ExecutionConfig::default().with_max_parallelism(4);
        assert_eq!(
            config.plan_sum(NumericKind::UInt16, 100_001),
            SumPlan {
                strategy: SumStrategy::Chunked,
                chunks: 4,
                chunk_size: 25_001,
            }
        );
        assert_eq!(
            config.plan_sum(NumericKind::UInt16, 100_000).strategy,
            SumStrategy::Loop
        );

        let tiny = ExecutionConfig::default()
            .with_parallel_sum_threshold(0)
            .with_max_parallelism(4);
        let plan = tiny.plan_sum(NumericKind::Int16, 5);
        assert_eq!(plan.chunk_size, 2);
        assert_eq!(plan.chunks, 3);
        assert!(plan.chunks * plan.chunk_size >= 5);
    }

    #[test]
    fn install_runs_the_closure() {
        let total: u64 = install(|| (1..=10_u64).sum());
        assert_eq!(total, 55);
    }
}
