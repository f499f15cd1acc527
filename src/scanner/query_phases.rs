use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::info;

use crate::error::{AppError, AppResult};

/// Phase header: `# **[PHASE 1] High-signal queries **`. Any other `#` line
/// is an ordinary comment.
static PHASE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^# \*\*\[PHASE (\d+)\] (.+?) \*\*$").expect("invalid phase header regex")
});

#[derive(Debug, Clone)]
pub struct QueryPhase {
    pub name: String,
    /// 1-based ordinal; phase 1 drains fully before phase 2.
    pub priority: usize,
    pub description: String,
    pub queries: Vec<String>,
}

/// Loads a phased query file. Files without phase headers degrade to a single
/// implicit phase so plain query lists keep working.
#[derive(Debug, Default)]
pub struct PhasedQueryManager {
    phases: Vec<QueryPhase>,
}

impl PhasedQueryManager {
    pub fn new() -> Self {
        Self { phases: Vec::new() }
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("failed to open query file {:?}: {}", path, e))
        })?;
        let manager = Self::parse(&content);
        info!(
            "Loaded {} query phase(s), {} queries total from {:?}",
            manager.phases.len(),
            manager.total_queries(),
            path
        );
        Ok(manager)
    }

    pub fn parse(content: &str) -> Self {
        let mut phases: Vec<QueryPhase> = Vec::new();
        let mut current: Option<QueryPhase> = None;

        for raw_line in content.lines() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(captures) = PHASE_HEADER.captures(line) {
                if let Some(phase) = current.take() {
                    phases.push(phase);
                }
                current = Some(QueryPhase {
                    name: format!("Phase {}", &captures[1]),
                    priority: phases.len() + 1,
                    description: captures[2].to_string(),
                    queries: Vec::new(),
                });
                continue;
            }

            if line.starts_with('#') {
                continue;
            }

            match current.as_mut() {
                Some(phase) => phase.queries.push(line.to_string()),
                None => {
                    // Queries before any header form the implicit phase.
                    current = Some(QueryPhase {
                        name: "Phase 1".to_string(),
                        priority: 1,
                        description: "default".to_string(),
                        queries: vec![line.to_string()],
                    });
                }
            }
        }

        if let Some(phase) = current {
            phases.push(phase);
        }

        Self { phases }
    }

    pub fn phases(&self) -> &[QueryPhase] {
        &self.phases
    }

    pub fn all_queries(&self) -> Vec<String> {
        self.phases
            .iter()
            .flat_map(|p| p.queries.iter().cloned())
            .collect()
    }

    pub fn total_queries(&self) -> usize {
        self.phases.iter().map(|p| p.queries.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phased_file_splits_queries_by_header() {
        let content = "\
# ordinary comment, ignored
# **[PHASE 1] High signal **
AIzaSy in:file extension:py
sk-proj in:file

# **[PHASE 2] Broad sweep **
AIzaSy in:file
";
        let manager = PhasedQueryManager::parse(content);
        let phases = manager.phases();
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[0].name, "Phase 1");
        assert_eq!(phases[0].priority, 1);
        assert_eq!(phases[0].description, "High signal");
        assert_eq!(phases[0].queries.len(), 2);
        assert_eq!(phases[1].priority, 2);
        assert_eq!(phases[1].queries, vec!["AIzaSy in:file"]);
    }

    #[test]
    fn file_without_headers_degrades_to_one_phase() {
        let content = "# just a comment\nAIzaSy in:file\nsk-ant in:file\n\n";
        let manager = PhasedQueryManager::parse(content);
        assert_eq!(manager.phases().len(), 1);
        assert_eq!(manager.phases()[0].priority, 1);
        assert_eq!(manager.total_queries(), 2);
    }

    #[test]
    fn malformed_phase_headers_are_plain_comments() {
        // Missing the trailing ` **`, so it must not open a phase.
        let content = "# **[PHASE 1] Broken\nAIzaSy in:file\n";
        let manager = PhasedQueryManager::parse(content);
        assert_eq!(manager.phases().len(), 1);
        assert_eq!(manager.phases()[0].description, "default");
    }

    #[test]
    fn all_queries_preserves_phase_order() {
        let content = "\
# **[PHASE 1] A **
q1
# **[PHASE 2] B **
q2
q3
";
        let manager = PhasedQueryManager::parse(content);
        assert_eq!(manager.all_queries(), vec!["q1", "q2", "q3"]);
    }
}
