use crate::models::AppConfig;

/// Checks the loaded configuration before any task starts. Returns every
/// problem found, not just the first one.
pub fn validate_app_config(config: &AppConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.github.tokens.is_empty() {
        errors.push("github.tokens must contain at least one token".to_string());
    }
    if config.github.tokens.iter().any(|t| t.trim().is_empty()) {
        errors.push("github.tokens must not contain blank entries".to_string());
    }

    if config.scanner.worker_count == 0 {
        errors.push("scanner.worker_count must be greater than 0".to_string());
    }
    if config.scanner.query_file.trim().is_empty() {
        errors.push("scanner.query_file must not be empty".to_string());
    }

    if config.validator.worker_count == 0 {
        errors.push("validator.worker_count must be greater than 0".to_string());
    }
    if config.validator.timeout == 0 {
        errors.push("validator.timeout must be greater than 0".to_string());
    }

    if config.storage.kind != "sqlite" {
        errors.push(format!(
            "storage.type '{}' is not supported (only 'sqlite')",
            config.storage.kind
        ));
    }

    if config.rate_limit.requests_per_minute == 0 {
        errors.push("rate_limit.requests_per_minute must be greater than 0".to_string());
    }
    if config.rate_limit.backoff_multiplier <= 1.0 {
        errors.push("rate_limit.backoff_multiplier must be greater than 1.0".to_string());
    }
    if !(0.0..=1.0).contains(&config.rate_limit.success_threshold) {
        errors.push("rate_limit.success_threshold must be within [0, 1]".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.github.tokens = vec!["ghp_test".to_string()];
        config
    }

    #[test]
    fn default_config_with_token_passes() {
        assert!(validate_app_config(&valid_config()).is_ok());
    }

    #[test]
    fn missing_tokens_are_rejected() {
        let mut config = valid_config();
        config.github.tokens.clear();
        let errors = validate_app_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("github.tokens")));
    }

    #[test]
    fn multiple_problems_are_all_reported() {
        let mut config = valid_config();
        config.scanner.worker_count = 0;
        config.validator.worker_count = 0;
        config.storage.kind = "postgres".to_string();
        let errors = validate_app_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
