use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default)]
    pub tokens: Vec<String>,
    /// Per-request deadline in seconds.
    #[serde(default = "default_github_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_github_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

fn default_user_agent() -> String {
    format!("keysweep/{}", env!("CARGO_PKG_VERSION"))
}

impl GithubConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            timeout: default_github_timeout(),
            max_retries: default_max_retries(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between continuous-scan rounds, in seconds.
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default = "default_query_file")]
    pub query_file: String,
    /// Repositories whose last push is older than this many days are skipped.
    #[serde(default = "default_date_range_days")]
    pub date_range_days: i64,
    #[serde(default = "default_file_blacklist")]
    pub file_blacklist: Vec<String>,
}

fn default_worker_count() -> usize {
    20
}

fn default_batch_size() -> usize {
    100
}

fn default_scan_interval() -> u64 {
    600
}

fn default_query_file() -> String {
    "queries.txt".to_string()
}

fn default_date_range_days() -> i64 {
    730
}

fn default_file_blacklist() -> Vec<String> {
    [
        "readme", "docs", "doc/", ".md", "example", "sample", "tutorial", "test", "spec", "demo",
        "mock",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl ScannerConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval)
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            batch_size: default_batch_size(),
            scan_interval: default_scan_interval(),
            auto_start: false,
            query_file: default_query_file(),
            date_range_days: default_date_range_days(),
            file_blacklist: default_file_blacklist(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_model_name")]
    pub tier_detection_model: String,
    #[serde(default = "default_validator_workers")]
    pub worker_count: usize,
    /// Per-probe deadline in seconds.
    #[serde(default = "default_validator_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub enable_tier_detection: bool,
}

fn default_model_name() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_validator_workers() -> usize {
    5
}

fn default_validator_timeout() -> u64 {
    30
}

impl ValidatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            model_name: default_model_name(),
            tier_detection_model: default_model_name(),
            worker_count: default_validator_workers(),
            timeout: default_validator_timeout(),
            enable_tier_detection: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_type", rename = "type")]
    pub kind: String,
    /// Database file path. Empty means `<data_path>/keysweep.db`.
    #[serde(default)]
    pub dsn: String,
    #[serde(default = "default_data_path")]
    pub data_path: String,
}

fn default_storage_type() -> String {
    "sqlite".to_string()
}

fn default_data_path() -> String {
    "./data".to_string()
}

impl StorageConfig {
    pub fn database_path(&self) -> std::path::PathBuf {
        if self.dsn.is_empty() {
            std::path::Path::new(&self.data_path).join("keysweep.db")
        } else {
            std::path::PathBuf::from(&self.dsn)
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: default_storage_type(),
            dsn: String::new(),
            data_path: default_data_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    /// Fallback cooldown after a 403/429 when the reset header is absent,
    /// in seconds.
    #[serde(default = "default_cooldown_duration")]
    pub cooldown_duration: u64,
    #[serde(default = "default_adaptive_enabled")]
    pub adaptive_enabled: bool,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_requests_per_minute() -> u32 {
    30
}

fn default_burst_size() -> u32 {
    10
}

fn default_cooldown_duration() -> u64 {
    300
}

fn default_adaptive_enabled() -> bool {
    true
}

fn default_success_threshold() -> f64 {
    0.8
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

impl RateLimitConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_duration)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            burst_size: default_burst_size(),
            cooldown_duration: default_cooldown_duration(),
            adaptive_enabled: default_adaptive_enabled(),
            success_threshold: default_success_threshold(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            github: GithubConfig::default(),
            scanner: ScannerConfig::default(),
            validator: ValidatorConfig::default(),
            storage: StorageConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.scanner.worker_count, 20);
        assert_eq!(cfg.validator.worker_count, 5);
        assert_eq!(cfg.validator.timeout, 30);
        assert_eq!(cfg.rate_limit.requests_per_minute, 30);
        assert!(cfg.scanner.file_blacklist.contains(&"readme".to_string()));
        assert!(!cfg.scanner.auto_start);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{"github":{"tokens":["ghp_abc"]},"scanner":{"worker_count":4}}"#,
        )
        .expect("partial config should parse");
        assert_eq!(cfg.github.tokens.len(), 1);
        assert_eq!(cfg.scanner.worker_count, 4);
        assert_eq!(cfg.scanner.batch_size, 100);
        assert_eq!(cfg.rate_limit.burst_size, 10);
    }

    #[test]
    fn storage_path_prefers_dsn_when_set() {
        let mut cfg = StorageConfig::default();
        assert!(cfg.database_path().ends_with("keysweep.db"));
        cfg.dsn = "/tmp/custom.db".to_string();
        assert_eq!(
            cfg.database_path(),
            std::path::PathBuf::from("/tmp/custom.db")
        );
    }
}
