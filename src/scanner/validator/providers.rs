use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::debug;

use super::{Validator, Verdict};
use crate::scanner::extract::{CandidateKey, Provider};

/// Raw result of one generation call against the gemini API.
pub(super) enum GeminiCall {
    Ok { has_candidates: bool },
    Failed { status: u16, body: String },
    Transport(String),
    TimedOut,
}

/// Error markers that mean the key itself is dead.
const GEMINI_INVALID_MARKERS: [&str; 5] = [
    "API_KEY_INVALID",
    "PERMISSION_DENIED",
    "UNAUTHENTICATED",
    "SERVICE_DISABLED",
    "API has not been used",
];

/// Error markers that mean the key is alive but throttled.
const GEMINI_LIMITED_MARKERS: [&str; 3] = [
    "QUOTA_EXCEEDED",
    "RESOURCE_EXHAUSTED",
    "RATE_LIMIT_EXCEEDED",
];

impl Validator {
    /// Routes the candidate to its provider's probe.
    pub(super) async fn probe(&self, candidate: &CandidateKey) -> (Verdict, Option<String>) {
        match candidate.provider {
            Provider::Gemini => self.probe_gemini(&candidate.secret).await,
            Provider::OpenAi => self.probe_openai(&candidate.secret).await,
            Provider::Claude => self.probe_claude(&candidate.secret).await,
        }
    }

    async fn probe_gemini(&self, key: &str) -> (Verdict, Option<String>) {
        let call = self
            .call_gemini(key, &self.config.model_name, "hi", self.config.timeout())
            .await;
        let verdict = classify_gemini(&call);
        let error = match call {
            GeminiCall::Ok { has_candidates: false } => Some("empty response".to_string()),
            GeminiCall::Failed { status, body } if verdict == Verdict::Error => {
                Some(format!("status {}: {}", status, truncate(&body, 200)))
            }
            GeminiCall::Transport(e) => Some(e),
            GeminiCall::TimedOut => Some("probe timed out".to_string()),
            _ => None,
        };
        (verdict, error)
    }

    /// Minimal generation request; used by both the liveness probe and tier
    /// detection.
    pub(super) async fn call_gemini(
        &self,
        key: &str,
        model: &str,
        prompt: &str,
        deadline: std::time::Duration,
    ) -> GeminiCall {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.gemini_base, model, key
        );
        let body = json!({
            "contents": [{"parts": [{"text": prompt}]}]
        });

        let request = self.http.post(&url).json(&body).timeout(deadline).send();
        let response = match tokio::time::timeout(deadline, request).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return GeminiCall::Transport(e.to_string()),
            Err(_) => return GeminiCall::TimedOut,
        };

        let status = response.status();
        if status.is_success() {
            let parsed: Value = match response.json().await {
                Ok(value) => value,
                Err(e) => return GeminiCall::Transport(e.to_string()),
            };
            let has_candidates = parsed
                .get("candidates")
                .and_then(|c| c.as_array())
                .map(|c| !c.is_empty())
                .unwrap_or(false);
            GeminiCall::Ok { has_candidates }
        } else {
            let body = response.text().await.unwrap_or_default();
            debug!("Gemini probe returned {}: {}", status, truncate(&body, 200));
            GeminiCall::Failed {
                status: status.as_u16(),
                body,
            }
        }
    }

    async fn probe_openai(&self, key: &str) -> (Verdict, Option<String>) {
        let url = format!("{}/v1/models", self.openai_base);
        let request = self
            .http
            .get(&url)
            .bearer_auth(key)
            .timeout(self.config.timeout())
            .send();
        let response = match tokio::time::timeout(self.config.timeout(), request).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return (Verdict::Error, Some(e.to_string())),
            Err(_) => return (Verdict::Error, Some("probe timed out".to_string())),
        };
        let status = response.status();
        let verdict = classify_http_status(status, false);
        let error = if verdict == Verdict::Error {
            Some(format!("unexpected status: {}", status))
        } else {
            None
        };
        (verdict, error)
    }

    async fn probe_claude(&self, key: &str) -> (Verdict, Option<String>) {
        let url = format!("{}/v1/messages", self.claude_base);
        let body = json!({
            "model": "claude-3-haiku-20240307",
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "hi"}]
        });
        let request = self
            .http
            .post(&url)
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .timeout(self.config.timeout())
            .send();
        let response = match tokio::time::timeout(self.config.timeout(), request).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return (Verdict::Error, Some(e.to_string())),
            Err(_) => return (Verdict::Error, Some("probe timed out".to_string())),
        };
        let status = response.status();
        let verdict = classify_http_status(status, true);
        let error = if verdict == Verdict::Error {
            Some(format!("unexpected status: {}", status))
        } else {
            None
        };
        (verdict, error)
    }
}

/// Status mapping shared by the bearer-style providers. A 400 from the
/// messages endpoint means the request shape was judged, not the key, so
/// claude treats it as valid.
pub(super) fn classify_http_status(status: StatusCode, bad_request_is_valid: bool) -> Verdict {
    match status.as_u16() {
        200 => Verdict::Valid,
        400 if bad_request_is_valid => Verdict::Valid,
        401 | 403 => Verdict::Invalid,
        429 => Verdict::RateLimited,
        402 => Verdict::QuotaExceeded,
        _ => Verdict::Error,
    }
}

pub(super) fn classify_gemini(call: &GeminiCall) -> Verdict {
    match call {
        GeminiCall::Ok { has_candidates } => {
            if *has_candidates {
                Verdict::Valid
            } else {
                Verdict::Error
            }
        }
        GeminiCall::Failed { body, .. } => {
            if GEMINI_INVALID_MARKERS.iter().any(|m| body.contains(m)) {
                Verdict::Invalid
            } else if GEMINI_LIMITED_MARKERS.iter().any(|m| body.contains(m)) {
                Verdict::RateLimited
            } else {
                Verdict::Error
            }
        }
        GeminiCall::Transport(_) | GeminiCall::TimedOut => Verdict::Error,
    }
}

/// True when the failed call indicates throttling rather than a dead key.
pub(super) fn is_rate_limit_failure(call: &GeminiCall) -> bool {
    matches!(call, GeminiCall::Failed { body, .. }
        if GEMINI_LIMITED_MARKERS.iter().any(|m| body.contains(m)))
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
