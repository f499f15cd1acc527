mod providers;
mod tier;

pub use tier::{KeyTier, TierDetection};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::models::ValidatorConfig;
use crate::scanner::extract::{CandidateKey, Provider};

/// Categorical outcome of one liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Valid,
    Invalid,
    RateLimited,
    QuotaExceeded,
    Error,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Valid => "valid",
            Verdict::Invalid => "invalid",
            Verdict::RateLimited => "rate_limited",
            Verdict::QuotaExceeded => "quota_exceeded",
            Verdict::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub candidate: CandidateKey,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<TierDetection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
    pub validated_at: i64,
}

/// Concurrent per-provider liveness probes. A fixed worker group pulls
/// candidates off a bounded channel; probe traffic is jittered and bounded
/// by the per-probe timeout.
pub struct Validator {
    config: ValidatorConfig,
    http: reqwest::Client,
    gemini_base: String,
    openai_base: String,
    claude_base: String,
}

const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com";
const OPENAI_BASE: &str = "https://api.openai.com";
const CLAUDE_BASE: &str = "https://api.anthropic.com";

impl Validator {
    pub fn new(config: ValidatorConfig) -> AppResult<Self> {
        Self::with_base_urls(
            config,
            GEMINI_BASE.to_string(),
            OPENAI_BASE.to_string(),
            CLAUDE_BASE.to_string(),
        )
    }

    pub fn with_base_urls(
        config: ValidatorConfig,
        gemini_base: String,
        openai_base: String,
        claude_base: String,
    ) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(format!("keysweep/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            config,
            http,
            gemini_base,
            openai_base,
            claude_base,
        })
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validates a batch through the worker pool and returns one outcome per
    /// candidate that was processed before cancellation.
    pub async fn validate_batch(
        self: &Arc<Self>,
        candidates: Vec<CandidateKey>,
        cancel: &CancellationToken,
    ) -> Vec<ValidationOutcome> {
        if candidates.is_empty() {
            return Vec::new();
        }

        info!("Starting batch validation of {} key(s)", candidates.len());

        let bound = candidates.len().max(1);
        let (job_tx, job_rx) = mpsc::channel::<CandidateKey>(bound);
        let (result_tx, mut result_rx) = mpsc::channel::<ValidationOutcome>(bound);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));

        let mut workers = Vec::new();
        for worker_id in 0..self.config.worker_count {
            let validator = Arc::clone(self);
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = { job_rx.lock().await.recv().await };
                    let Some(candidate) = job else { break };
                    let outcome = validator.validate_one(candidate, &cancel).await;
                    if result_tx.send(outcome).await.is_err() {
                        break;
                    }
                    if cancel.is_cancelled() {
                        debug!("Validator worker {} stopping on cancel", worker_id);
                        break;
                    }
                }
            }));
        }
        // Workers hold the only remaining result senders.
        drop(result_tx);

        let feeder_cancel = cancel.clone();
        let feeder = tokio::spawn(async move {
            for candidate in candidates {
                tokio::select! {
                    _ = feeder_cancel.cancelled() => break,
                    sent = job_tx.send(candidate) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut outcomes = Vec::new();
        while let Some(outcome) = result_rx.recv().await {
            outcomes.push(outcome);
        }
        let _ = feeder.await;
        for worker in workers {
            let _ = worker.await;
        }

        let mut valid = 0;
        let mut invalid = 0;
        let mut rate_limited = 0;
        let mut errors = 0;
        for outcome in &outcomes {
            match outcome.verdict {
                Verdict::Valid => valid += 1,
                Verdict::Invalid => invalid += 1,
                Verdict::RateLimited | Verdict::QuotaExceeded => rate_limited += 1,
                Verdict::Error => errors += 1,
            }
        }
        info!(
            "Batch validation complete: {} valid, {} invalid, {} rate limited, {} errors",
            valid, invalid, rate_limited, errors
        );

        outcomes
    }

    async fn validate_one(
        &self,
        candidate: CandidateKey,
        cancel: &CancellationToken,
    ) -> ValidationOutcome {
        let started = Instant::now();

        // Spread probe traffic so a burst of candidates does not hammer the
        // provider in lockstep.
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(500..=1500));
        tokio::select! {
            _ = cancel.cancelled() => {
                return ValidationOutcome {
                    candidate,
                    verdict: Verdict::Error,
                    tier: None,
                    error: Some("cancelled".to_string()),
                    latency_ms: started.elapsed().as_millis() as u64,
                    validated_at: Utc::now().timestamp(),
                };
            }
            _ = tokio::time::sleep(jitter) => {}
        }

        let (verdict, error) = self.probe(&candidate).await;

        let tier = if verdict == Verdict::Valid
            && candidate.provider == Provider::Gemini
            && self.config.enable_tier_detection
        {
            match self.detect_gemini_tier(&candidate.secret).await {
                Ok(result) => {
                    info!(
                        "Detected tier for key {}...: {:?} (confidence {:.2})",
                        &candidate.secret[..10.min(candidate.secret.len())],
                        result.tier,
                        result.confidence
                    );
                    Some(result)
                }
                Err(e) => {
                    warn!("Tier detection failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        ValidationOutcome {
            candidate,
            verdict,
            tier,
            error,
            latency_ms: started.elapsed().as_millis() as u64,
            validated_at: Utc::now().timestamp(),
        }
    }
}
