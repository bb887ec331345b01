//! Configuration for the audit engine.
//!
//! Layering follows config file > environment variables > built-in
//! defaults; CLI flags (applied in `main.rs`) override everything else.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the audit server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            thresholds: ThresholdConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            cache: CacheConfig::default(),
            judge: JudgeConfig::default(),
            state: StateConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Whether synchronous (loop-until-complete) mode is enabled at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_enabled")]
    pub enabled: bool,
}

fn default_sync_enabled() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_sync_enabled(),
        }
    }
}

/// Completion Evaluator thresholds (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default = "default_tier1_score")]
    pub tier1_score: u8,
    #[serde(default = "default_tier1_min_loops")]
    pub tier1_min_loops: u32,
    #[serde(default = "default_tier2_score")]
    pub tier2_score: u8,
    #[serde(default = "default_tier2_min_loops")]
    pub tier2_min_loops: u32,
    #[serde(default = "default_tier3_score")]
    pub tier3_score: u8,
    #[serde(default = "default_tier3_min_loops")]
    pub tier3_min_loops: u32,
    #[serde(default = "default_hard_stop_loops")]
    pub hard_stop_loops: u32,
    #[serde(default = "default_stagnation_start_loop")]
    pub stagnation_start_loop: u32,
    #[serde(default = "default_stagnation_threshold")]
    pub stagnation_threshold: f64,
    #[serde(default = "default_critical_persist_loops")]
    pub critical_persist_loops: u32,
    /// Lower bound accepted for an inline `gan-config` `threshold` override.
    #[serde(default = "default_inline_threshold_min")]
    pub inline_threshold_min: u8,
    /// Upper bound accepted for an inline `gan-config` `threshold` override.
    #[serde(default = "default_inline_threshold_max")]
    pub inline_threshold_max: u8,
    /// Upper bound accepted for an inline `gan-config` `maxCycles` override.
    #[serde(default = "default_inline_max_cycles_max")]
    pub inline_max_cycles_max: u32,
}

fn default_tier1_score() -> u8 {
    95
}
fn default_tier1_min_loops() -> u32 {
    10
}
fn default_tier2_score() -> u8 {
    90
}
fn default_tier2_min_loops() -> u32 {
    15
}
fn default_tier3_score() -> u8 {
    85
}
fn default_tier3_min_loops() -> u32 {
    20
}
fn default_hard_stop_loops() -> u32 {
    25
}
fn default_stagnation_start_loop() -> u32 {
    10
}
fn default_stagnation_threshold() -> f64 {
    0.95
}
fn default_critical_persist_loops() -> u32 {
    15
}
fn default_inline_threshold_min() -> u8 {
    50
}
fn default_inline_threshold_max() -> u8 {
    100
}
fn default_inline_max_cycles_max() -> u32 {
    100
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            tier1_score: default_tier1_score(),
            tier1_min_loops: default_tier1_min_loops(),
            tier2_score: default_tier2_score(),
            tier2_min_loops: default_tier2_min_loops(),
            tier3_score: default_tier3_score(),
            tier3_min_loops: default_tier3_min_loops(),
            hard_stop_loops: default_hard_stop_loops(),
            stagnation_start_loop: default_stagnation_start_loop(),
            stagnation_threshold: default_stagnation_threshold(),
            critical_persist_loops: default_critical_persist_loops(),
            inline_threshold_min: default_inline_threshold_min(),
            inline_threshold_max: default_inline_threshold_max(),
            inline_max_cycles_max: default_inline_max_cycles_max(),
        }
    }
}

/// Bounded-resource configuration (spec §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_max_concurrent_audits")]
    pub max_concurrent_audits: usize,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    #[serde(default = "default_max_active_sessions")]
    pub max_active_sessions: usize,
    #[serde(default = "default_max_active_contexts")]
    pub max_active_contexts: usize,
    /// Per-audit timeout in milliseconds.
    #[serde(default = "default_audit_timeout_ms")]
    pub audit_timeout_ms: u64,
    #[serde(default = "default_audit_retry_attempts")]
    pub audit_retry_attempts: u32,
}

fn default_max_concurrent_audits() -> usize {
    4
}
fn default_max_queue_depth() -> usize {
    64
}
fn default_max_active_sessions() -> usize {
    256
}
fn default_max_active_contexts() -> usize {
    64
}
fn default_audit_timeout_ms() -> u64 {
    30_000
}
fn default_audit_retry_attempts() -> u32 {
    2
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_audits: default_max_concurrent_audits(),
            max_queue_depth: default_max_queue_depth(),
            max_active_sessions: default_max_active_sessions(),
            max_active_contexts: default_max_active_contexts(),
            audit_timeout_ms: default_audit_timeout_ms(),
            audit_retry_attempts: default_audit_retry_attempts(),
        }
    }
}

/// Review-cache configuration (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_enabled() -> bool {
    true
}
fn default_cache_capacity() -> usize {
    512
}
fn default_cache_ttl_secs() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// External Judge Driver configuration (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    #[serde(default = "default_judge_executable")]
    pub executable: PathBuf,
    #[serde(default = "default_check_available_timeout_ms")]
    pub check_available_timeout_ms: u64,
    /// Grace period granted after a graceful termination signal before
    /// force-killing the child (spec §4.3: "≤5s grace").
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

fn default_judge_executable() -> PathBuf {
    PathBuf::from("gans-analyzer")
}
fn default_check_available_timeout_ms() -> u64 {
    5_000
}
fn default_kill_grace_ms() -> u64 {
    5_000
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            executable: default_judge_executable(),
            check_available_timeout_ms: default_check_available_timeout_ms(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

/// Persisted-state layout configuration (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Sessions whose `updatedAt` is older than this are reaped.
    #[serde(default = "default_max_session_age_secs")]
    pub max_session_age_secs: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".gansauditor/sessions")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from(".gansauditor/logs")
}
fn default_max_session_age_secs() -> u64 {
    60 * 60 * 24 * 7
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            log_dir: default_log_dir(),
            max_session_age_secs: default_max_session_age_secs(),
        }
    }
}

/// Observability Pipe configuration (spec §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_log_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_log_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_log_retention_files")]
    pub retention_files: u32,
}

fn default_log_flush_interval_ms() -> u64 {
    1_000
}
fn default_log_buffer_capacity() -> usize {
    1_024
}
fn default_log_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_log_retention_files() -> u32 {
    7
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_log_flush_interval_ms(),
            buffer_capacity: default_log_buffer_capacity(),
            max_file_bytes: default_log_max_file_bytes(),
            retention_files: default_log_retention_files(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file doesn't exist.
    pub fn load_or_default(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        match path {
            Some(p) if p.exists() => Self::from_file(p),
            _ => Ok(Self::default()),
        }
    }

    /// Apply `GANSAUDITOR_*` environment variable overrides.
    ///
    /// Environment variables override config file values but are
    /// themselves overridden by CLI arguments (applied in `main.rs`).
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("GANSAUDITOR_SYNC_ENABLED")
            && !val.is_empty()
        {
            self.sync.enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }

        if let Ok(val) = std::env::var("GANSAUDITOR_MAX_CONCURRENT_AUDITS")
            && let Ok(n) = val.parse::<usize>()
        {
            self.concurrency.max_concurrent_audits = n;
        }

        if let Ok(val) = std::env::var("GANSAUDITOR_MAX_QUEUE_DEPTH")
            && let Ok(n) = val.parse::<usize>()
        {
            self.concurrency.max_queue_depth = n;
        }

        if let Ok(val) = std::env::var("GANSAUDITOR_AUDIT_TIMEOUT_MS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.concurrency.audit_timeout_ms = n;
        }

        if let Ok(val) = std::env::var("GANSAUDITOR_CACHE_ENABLED")
            && !val.is_empty()
        {
            self.cache.enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }

        if let Ok(val) = std::env::var("GANSAUDITOR_STATE_DIR")
            && !val.is_empty()
        {
            self.state.state_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("GANSAUDITOR_LOG_DIR")
            && !val.is_empty()
        {
            self.state.log_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("GANSAUDITOR_JUDGE_EXECUTABLE")
            && !val.is_empty()
        {
            self.judge.executable = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("GANSAUDITOR_JUDGE_TIMEOUT_MS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.concurrency.audit_timeout_ms = n;
        }

        if let Ok(val) = std::env::var("GANSAUDITOR_HARD_STOP_LOOPS")
            && let Ok(n) = val.parse::<u32>()
        {
            self.thresholds.hard_stop_loops = n;
        }

        if let Ok(val) = std::env::var("GANSAUDITOR_STAGNATION_THRESHOLD")
            && let Ok(n) = val.parse::<f64>()
        {
            self.thresholds.stagnation_threshold = n.clamp(0.0, 1.0);
        }

        self
    }

    /// Load configuration with environment variable overrides applied.
    ///
    /// Priority: config file > env vars > defaults. CLI args override
    /// everything and are applied separately by the caller.
    pub fn load_with_env(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        Self::load_or_default(path).map(|c| c.apply_env_overrides())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_thresholds() {
        let t = ThresholdConfig::default();
        assert_eq!(t.tier1_score, 95);
        assert_eq!(t.tier1_min_loops, 10);
        assert_eq!(t.tier2_score, 90);
        assert_eq!(t.tier2_min_loops, 15);
        assert_eq!(t.tier3_score, 85);
        assert_eq!(t.tier3_min_loops, 20);
        assert_eq!(t.hard_stop_loops, 25);
        assert_eq!(t.stagnation_start_loop, 10);
        assert_eq!(t.stagnation_threshold, 0.95);
        assert_eq!(t.critical_persist_loops, 15);
    }

    #[test]
    fn env_override_clamps_stagnation_threshold() {
        // SAFETY: test is single-threaded within this process's test harness slot
        // for this env var name.
        unsafe { std::env::set_var("GANSAUDITOR_STAGNATION_THRESHOLD", "1.5") };
        let cfg = Config::default().apply_env_overrides();
        assert_eq!(cfg.thresholds.stagnation_threshold, 1.0);
        unsafe { std::env::remove_var("GANSAUDITOR_STAGNATION_THRESHOLD") };
    }

    #[test]
    fn load_or_default_without_path_is_default() {
        let cfg = Config::load_or_default(None).unwrap();
        assert_eq!(cfg.concurrency.max_concurrent_audits, 4);
    }
}
