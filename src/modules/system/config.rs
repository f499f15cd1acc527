use std::fs;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::models::AppConfig;

const CONFIG_FILE: &str = "config.json";

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("KEYSWEEP_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    PathBuf::from(CONFIG_FILE)
}

/// Loads `config.json` (creating it with defaults when missing) and applies
/// environment overrides on top.
pub fn load_app_config() -> AppResult<AppConfig> {
    let path = config_path();

    let mut config = if path.exists() {
        let content = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("failed_to_read_config_file: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| AppError::Config(format!("failed_to_parse_config_file: {}", e)))?
    } else {
        let config = AppConfig::default();
        if let Err(e) = save_app_config(&config) {
            warn!("[W-CONFIG-SEED] failed_to_write_default_config: {}", e);
        }
        config
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn save_app_config(config: &AppConfig) -> AppResult<()> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| AppError::Config(format!("failed_to_serialize_config: {}", e)))?;
    fs::write(config_path(), content)
        .map_err(|e| AppError::Config(format!("failed_to_save_config: {}", e)))
}

fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(tokens) = std::env::var("KEYSWEEP_GITHUB_TOKENS") {
        let parsed: Vec<String> = tokens
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if !parsed.is_empty() {
            info!("Using {} GitHub token(s) from environment", parsed.len());
            config.github.tokens = parsed;
        }
    }

    if let Ok(file) = std::env::var("KEYSWEEP_QUERY_FILE") {
        if !file.trim().is_empty() {
            info!("Using query file from environment: {}", file);
            config.scanner.query_file = file;
        }
    }

    if let Ok(path) = std::env::var("KEYSWEEP_DATA_PATH") {
        if !path.trim().is_empty() {
            info!("Using data path from environment: {}", path);
            config.storage.data_path = path;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    #[test]
    fn token_env_override_splits_on_commas() {
        let _guard = env_lock().lock().unwrap_or_else(|p| p.into_inner());
        std::env::set_var("KEYSWEEP_GITHUB_TOKENS", "ghp_one, ghp_two ,,ghp_three");

        let mut config = AppConfig::default();
        apply_env_overrides(&mut config);
        assert_eq!(config.github.tokens, vec!["ghp_one", "ghp_two", "ghp_three"]);

        std::env::remove_var("KEYSWEEP_GITHUB_TOKENS");
    }

    #[test]
    fn empty_token_env_is_ignored() {
        let _guard = env_lock().lock().unwrap_or_else(|p| p.into_inner());
        std::env::set_var("KEYSWEEP_GITHUB_TOKENS", " , ,");

        let mut config = AppConfig::default();
        config.github.tokens = vec!["ghp_keep".to_string()];
        apply_env_overrides(&mut config);
        assert_eq!(config.github.tokens, vec!["ghp_keep"]);

        std::env::remove_var("KEYSWEEP_GITHUB_TOKENS");
    }
}
