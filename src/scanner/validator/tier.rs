use std::time::{Duration, Instant};

use serde::Serialize;

use super::providers::{is_rate_limit_failure, GeminiCall};
use super::Validator;
use crate::error::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyTier {
    Unknown,
    Free,
    Paid,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierDetection {
    pub tier: KeyTier,
    /// Confidence in [0, 1]; halved when the combined signal is inconclusive.
    pub confidence: f64,
    pub method: String,
    pub evidence: Vec<String>,
    pub latency_ms: u64,
}

const RATE_PROBE_REQUESTS: usize = 3;
const RATE_PROBE_SPACING: Duration = Duration::from_millis(100);
const RATE_PROBE_DEADLINE: Duration = Duration::from_secs(5);
const CAPABILITY_PROBE_DEADLINE: Duration = Duration::from_secs(10);

impl Validator {
    /// Heuristic free/paid classification for a key that already validated.
    ///
    /// Two independent probes: free-tier keys trip per-minute limits under a
    /// short burst, and tend to reject a ~3KB prompt. The rate probe carries
    /// more weight in the combined score.
    pub async fn detect_gemini_tier(&self, key: &str) -> AppResult<TierDetection> {
        let started = Instant::now();
        let mut evidence = Vec::new();

        let rate_tier = self.rate_probe(key, &mut evidence).await;
        let capability_tier = self.capability_probe(key, &mut evidence).await;

        let (tier, confidence) = combine_tier_signals(rate_tier, capability_tier);

        Ok(TierDetection {
            tier,
            confidence,
            method: "rate_limit+capability".to_string(),
            evidence,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn rate_probe(&self, key: &str, evidence: &mut Vec<String>) -> KeyTier {
        let model = &self.config.tier_detection_model;
        let mut limited = 0usize;
        let mut succeeded = 0usize;

        for i in 0..RATE_PROBE_REQUESTS {
            let call = self
                .call_gemini(key, model, "test", RATE_PROBE_DEADLINE)
                .await;
            match &call {
                GeminiCall::Ok { .. } => succeeded += 1,
                _ if is_rate_limit_failure(&call) => {
                    limited += 1;
                    evidence.push(format!("rate_limit_hit_request_{}", i + 1));
                }
                _ => {}
            }
            if i < RATE_PROBE_REQUESTS - 1 {
                tokio::time::sleep(RATE_PROBE_SPACING).await;
            }
        }

        if limited >= 2 {
            evidence.push(format!(
                "high_rate_limit_ratio_{}/{}",
                limited, RATE_PROBE_REQUESTS
            ));
            KeyTier::Free
        } else if succeeded >= 2 {
            evidence.push(format!(
                "low_rate_limit_ratio_{}/{}",
                limited, RATE_PROBE_REQUESTS
            ));
            KeyTier::Paid
        } else {
            KeyTier::Unknown
        }
    }

    async fn capability_probe(&self, key: &str, evidence: &mut Vec<String>) -> KeyTier {
        let model = &self.config.tier_detection_model;
        // ~3KB prompt; free-tier keys often reject it on context or quota.
        let long_input =
            "This is a test input to check context handling capabilities. ".repeat(50);
        let call = self
            .call_gemini(key, model, &long_input, CAPABILITY_PROBE_DEADLINE)
            .await;

        match &call {
            GeminiCall::Ok { .. } => {
                evidence.push("handled_complex_request_successfully".to_string());
                KeyTier::Paid
            }
            GeminiCall::Failed { body, .. } => {
                let lowered = body.to_lowercase();
                if lowered.contains("context")
                    || lowered.contains("token")
                    || lowered.contains("length")
                {
                    evidence.push("context_limit_restriction".to_string());
                    KeyTier::Free
                } else if is_rate_limit_failure(&call) {
                    evidence.push("rate_limit_on_complex_request".to_string());
                    KeyTier::Free
                } else {
                    KeyTier::Unknown
                }
            }
            GeminiCall::Transport(_) | GeminiCall::TimedOut => KeyTier::Unknown,
        }
    }
}

/// Rate probe weight 0.7, capability probe 0.3. Sub-scores are +1 paid,
/// -1 free, 0 unknown; |final| > 0.3 decides, anything closer stays unknown
/// at half confidence.
pub(super) fn combine_tier_signals(rate: KeyTier, capability: KeyTier) -> (KeyTier, f64) {
    let score = |tier: KeyTier| -> f64 {
        match tier {
            KeyTier::Paid => 1.0,
            KeyTier::Free => -1.0,
            KeyTier::Unknown => 0.0,
        }
    };

    let rate_score = score(rate);
    let capability_score = score(capability);
    let final_score = rate_score * 0.7 + capability_score * 0.3;
    let confidence = (final_score.abs() + rate_score.abs() + capability_score.abs()) / 3.0;

    if final_score > 0.3 {
        (KeyTier::Paid, confidence)
    } else if final_score < -0.3 {
        (KeyTier::Free, confidence)
    } else {
        (KeyTier::Unknown, confidence * 0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreeing_probes_decide_with_full_confidence() {
        let (tier, confidence) = combine_tier_signals(KeyTier::Paid, KeyTier::Paid);
        assert_eq!(tier, KeyTier::Paid);
        assert!((confidence - 1.0).abs() < 1e-9);

        let (tier, confidence) = combine_tier_signals(KeyTier::Free, KeyTier::Free);
        assert_eq!(tier, KeyTier::Free);
        assert!((confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rate_probe_outweighs_capability_probe() {
        let (tier, _) = combine_tier_signals(KeyTier::Paid, KeyTier::Free);
        assert_eq!(tier, KeyTier::Paid);

        let (tier, _) = combine_tier_signals(KeyTier::Free, KeyTier::Paid);
        assert_eq!(tier, KeyTier::Free);
    }

    #[test]
    fn capability_alone_is_not_decisive() {
        // 0.3 weight does not clear the 0.3 threshold by itself.
        let (tier, confidence) = combine_tier_signals(KeyTier::Unknown, KeyTier::Paid);
        assert_eq!(tier, KeyTier::Unknown);
        // Inconclusive results carry halved confidence.
        assert!(confidence < 0.5);
    }

    #[test]
    fn rate_probe_alone_is_decisive() {
        let (tier, _) = combine_tier_signals(KeyTier::Paid, KeyTier::Unknown);
        assert_eq!(tier, KeyTier::Paid);
    }

    #[test]
    fn both_unknown_stays_unknown_with_zero_confidence() {
        let (tier, confidence) = combine_tier_signals(KeyTier::Unknown, KeyTier::Unknown);
        assert_eq!(tier, KeyTier::Unknown);
        assert_eq!(confidence, 0.0);
    }
}
