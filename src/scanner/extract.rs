use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gemini,
    OpenAi,
    Claude,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gemini => "gemini",
            Provider::OpenAi => "openai",
            Provider::Claude => "claude",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    ApiKey,
    ProjectKey,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::ApiKey => "api_key",
            KeyKind::ProjectKey => "project_key",
        }
    }
}

/// A secret candidate pulled out of one file, pre-validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateKey {
    pub secret: String,
    pub provider: Provider,
    pub kind: KeyKind,
}

struct KeyPattern {
    provider: Provider,
    kind: KeyKind,
    regex: &'static LazyLock<Regex>,
    /// `-` and `_` count as body characters for boundary purposes.
    dashed_charset: bool,
}

static GEMINI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"AIzaSy[A-Za-z0-9\-_]{33}").expect("invalid gemini regex"));
static OPENAI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sk-[A-Za-z0-9]{48}").expect("invalid openai regex"));
static OPENAI_PROJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sk-proj-[A-Za-z0-9]{48}").expect("invalid openai project regex"));
static CLAUDE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"sk-ant-api03-[A-Za-z0-9\-_]{95}AA").expect("invalid claude regex")
});

static PATTERNS: [KeyPattern; 4] = [
    KeyPattern {
        provider: Provider::Gemini,
        kind: KeyKind::ApiKey,
        regex: &GEMINI_RE,
        dashed_charset: true,
    },
    KeyPattern {
        provider: Provider::OpenAi,
        kind: KeyKind::ProjectKey,
        regex: &OPENAI_PROJECT_RE,
        dashed_charset: false,
    },
    KeyPattern {
        provider: Provider::OpenAi,
        kind: KeyKind::ApiKey,
        regex: &OPENAI_RE,
        dashed_charset: false,
    },
    KeyPattern {
        provider: Provider::Claude,
        kind: KeyKind::ApiKey,
        regex: &CLAUDE_RE,
        dashed_charset: true,
    },
];

/// Context window inspected on each side of a match for placeholder markers.
const CONTEXT_WINDOW: usize = 50;

const PLACEHOLDER_MARKERS: [&str; 9] = [
    "YOUR_",
    "EXAMPLE",
    "PLACEHOLDER",
    "REPLACE",
    "...",
    "TODO",
    "FIXME",
    "XXX",
    "SAMPLE",
];

/// Scans one file body for credential candidates. Placeholder-looking matches
/// are dropped; the result is deduplicated by secret.
pub fn extract_candidates(content: &str) -> Vec<CandidateKey> {
    let bytes = content.as_bytes();
    let mut seen = std::collections::HashSet::new();
    let mut candidates = Vec::new();

    for pattern in &PATTERNS {
        for found in pattern.regex.find_iter(content) {
            if !has_clean_boundaries(bytes, found.start(), found.end(), pattern.dashed_charset) {
                continue;
            }
            if window_has_placeholder(bytes, found.start(), found.end()) {
                continue;
            }
            let secret = found.as_str().to_string();
            if seen.insert(secret.clone()) {
                candidates.push(CandidateKey {
                    secret,
                    provider: pattern.provider,
                    kind: pattern.kind,
                });
            }
        }
    }

    candidates
}

fn is_body_byte(b: u8, dashed: bool) -> bool {
    b.is_ascii_alphanumeric() || (dashed && (b == b'-' || b == b'_'))
}

/// A match that continues into more key-charset bytes on either side is a
/// longer token, not a key of this shape (a 40-char "gemini key" must not
/// yield its 39-char prefix).
fn has_clean_boundaries(bytes: &[u8], start: usize, end: usize, dashed: bool) -> bool {
    if start > 0 && is_body_byte(bytes[start - 1], dashed) {
        return false;
    }
    if end < bytes.len() && is_body_byte(bytes[end], dashed) {
        return false;
    }
    true
}

fn window_has_placeholder(bytes: &[u8], start: usize, end: usize) -> bool {
    let window_start = start.saturating_sub(CONTEXT_WINDOW);
    let window_end = (end + CONTEXT_WINDOW).min(bytes.len());
    let window: Vec<u8> = bytes[window_start..window_end]
        .iter()
        .map(|b| b.to_ascii_uppercase())
        .collect();

    PLACEHOLDER_MARKERS
        .iter()
        .any(|marker| contains_subslice(&window, marker.as_bytes()))
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gemini_key() -> String {
        format!("AIzaSy{}", "A".repeat(33))
    }

    fn claude_key() -> String {
        format!("sk-ant-api03-{}AA", "a".repeat(95))
    }

    #[test]
    fn exact_gemini_shape_is_accepted() {
        let content = format!("const apiKey = \"{}\";", gemini_key());
        let found = extract_candidates(&content);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].provider, Provider::Gemini);
        assert_eq!(found[0].kind, KeyKind::ApiKey);
        assert_eq!(found[0].secret.len(), 39);
    }

    #[test]
    fn one_char_too_long_gemini_is_rejected() {
        // 34 body chars: the 39-char prefix must not be reported.
        let content = format!("const apiKey = \"AIzaSy{}\";", "A".repeat(34));
        assert!(extract_candidates(&content).is_empty());
    }

    #[test]
    fn all_four_shapes_are_recognized() {
        let content = format!(
            "g={}\no=sk-{}\np=sk-proj-{}\nc={}\n",
            gemini_key(),
            "B".repeat(48),
            "C".repeat(48),
            claude_key(),
        );
        let found = extract_candidates(&content);
        assert_eq!(found.len(), 4);
        let kinds: Vec<(Provider, KeyKind)> =
            found.iter().map(|c| (c.provider, c.kind)).collect();
        assert!(kinds.contains(&(Provider::OpenAi, KeyKind::ProjectKey)));
        assert!(kinds.contains(&(Provider::Claude, KeyKind::ApiKey)));
    }

    #[test]
    fn todo_marker_inside_the_window_filters_the_match() {
        let content = format!("let k = \"{}\" // TODO replace", gemini_key());
        assert!(extract_candidates(&content).is_empty());
    }

    #[test]
    fn marker_window_boundary_is_exact() {
        // Marker ends exactly at the 50th byte after the key: filtered.
        let inside = format!("{}{}TODO", gemini_key(), " ".repeat(46));
        assert!(extract_candidates(&inside).is_empty());

        // One byte further and the marker falls outside the window.
        let outside = format!("{}{}TODO", gemini_key(), " ".repeat(47));
        assert_eq!(extract_candidates(&outside).len(), 1);
    }

    #[test]
    fn marker_before_the_key_also_filters() {
        let content = format!("# YOUR_API_KEY goes here: {}", gemini_key());
        assert!(extract_candidates(&content).is_empty());
    }

    #[test]
    fn placeholder_check_is_case_insensitive() {
        let content = format!("let k = \"{}\" // todo: rotate", gemini_key());
        assert!(extract_candidates(&content).is_empty());
    }

    #[test]
    fn duplicate_secrets_in_one_file_collapse() {
        let key = gemini_key();
        let content = format!("a={}\nb={}\n", key, key);
        assert_eq!(extract_candidates(&content).len(), 1);
    }

    #[test]
    fn key_followed_by_unrelated_text_survives() {
        let content = format!("GEMINI_KEY={}\nexport FLAG=1\n", gemini_key());
        let found = extract_candidates(&content);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].secret, gemini_key());
    }

    #[test]
    fn project_key_is_not_double_counted_as_plain_openai() {
        let content = format!("k=sk-proj-{}", "D".repeat(48));
        let found = extract_candidates(&content);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, KeyKind::ProjectKey);
    }
}
