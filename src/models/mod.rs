mod config;

pub use config::{
    AppConfig, GithubConfig, RateLimitConfig, ScannerConfig, StorageConfig, ValidatorConfig,
};
