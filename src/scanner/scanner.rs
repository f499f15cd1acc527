use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::credential::{CredentialPool, CredentialStateView};
use super::dedup::Deduplicator;
use super::extract::extract_candidates;
use super::github::{SearchClient, SearchItem};
use super::query_phases::PhasedQueryManager;
use super::stats::{ScanStats, StatsHandle};
use super::validator::{Validator, Verdict};
use crate::error::{AppError, AppResult};
use crate::models::AppConfig;
use crate::modules::persistence::{Finding, RateLimitedFinding, ScanProgress, Store};

/// Composes the pipeline: scheduler -> search -> dedup -> fetch -> extract ->
/// validate -> persist. Owns the lifecycle, the cancellation signal, and the
/// stats snapshot.
pub struct Scanner {
    github: Arc<SearchClient>,
    validator: Arc<Validator>,
    store: Arc<Store>,
    config: AppConfig,
    deduplicator: Deduplicator,
    stats: StatsHandle,
    scan_flag: Mutex<bool>,
    cancel: Mutex<CancellationToken>,
}

impl Scanner {
    pub fn new(config: AppConfig, store: Arc<Store>) -> AppResult<Arc<Self>> {
        let pool = Arc::new(CredentialPool::new(
            config.github.tokens.clone(),
            config.rate_limit.clone(),
        ));
        let github = Arc::new(SearchClient::new(config.github.clone(), pool)?);
        let validator = Arc::new(Validator::new(config.validator.clone())?);
        Ok(Self::with_clients(config, store, github, validator))
    }

    /// Assembles a scanner around externally built clients; tests point the
    /// clients at local mock servers through this.
    pub fn with_clients(
        config: AppConfig,
        store: Arc<Store>,
        github: Arc<SearchClient>,
        validator: Arc<Validator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            github,
            validator,
            store,
            config,
            deduplicator: Deduplicator::new(),
            stats: StatsHandle::new(),
            scan_flag: Mutex::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    /// Runs one pass over an explicit query list (all queries at phase
    /// priority 1). Fails fast with `AlreadyRunning` if a scan is active.
    /// Returns an error when any query could not be completed, so a clean
    /// return means every query is now marked processed.
    pub async fn run_with_queries(self: &Arc<Self>, queries: Vec<String>) -> AppResult<()> {
        let (_guard, cancel) = self.begin_scan()?;

        info!("Starting scan with {} queries", queries.len());
        self.stats.update(|s| s.total_queries = queries.len());
        self.write_progress(true);

        let mut failed = 0usize;
        for (i, query) in queries.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Scan cancelled");
                return Err(AppError::Cancelled);
            }

            info!("Processing query {}/{}: {}", i + 1, queries.len(), query);
            self.stats.update(|s| {
                s.current_query = query.clone();
                s.processed_queries = i + 1;
            });

            match self.process_query(query, 1, &cancel).await {
                Ok(()) => {}
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    error!("Failed to process query '{}': {}", query, e);
                    self.stats.update(|s| s.error_count += 1);
                    failed += 1;
                }
            }
            self.write_progress(true);
        }

        if failed > 0 {
            return Err(AppError::Scan(format!(
                "{} of {} queries failed",
                failed,
                queries.len()
            )));
        }
        info!("Scan completed successfully");
        Ok(())
    }

    /// Loads the phased query file and loops rounds of all phases, separated
    /// by `scan_interval`, until `stop()` is called.
    pub async fn run_continuous(self: &Arc<Self>) -> AppResult<()> {
        let (_guard, cancel) = self.begin_scan()?;

        let manager = PhasedQueryManager::load(Path::new(&self.config.scanner.query_file))?;
        if manager.total_queries() == 0 {
            return Err(AppError::Config(format!(
                "query file '{}' contains no queries",
                self.config.scanner.query_file
            )));
        }

        info!(
            "Starting continuous scanning: {} phase(s), {} queries per round",
            manager.phases().len(),
            manager.total_queries()
        );
        self.stats
            .update(|s| s.total_queries = manager.total_queries());
        self.write_progress(true);

        loop {
            for phase in manager.phases() {
                info!(
                    "Starting {}: {} ({} queries)",
                    phase.name,
                    phase.description,
                    phase.queries.len()
                );

                for query in &phase.queries {
                    if cancel.is_cancelled() {
                        info!("Continuous scanning stopped");
                        return Ok(());
                    }

                    self.stats.update(|s| s.current_query = query.clone());
                    match self.process_query(query, phase.priority, &cancel).await {
                        Ok(()) => {
                            self.stats.update(|s| s.processed_queries += 1);
                        }
                        Err(AppError::Cancelled) => {
                            info!("Continuous scanning stopped");
                            return Ok(());
                        }
                        Err(e) => {
                            error!("Error in {} query '{}': {}", phase.name, query, e);
                            self.stats.update(|s| s.error_count += 1);
                        }
                    }
                    self.write_progress(true);
                }

                info!("Completed {}", phase.name);
            }

            info!(
                "Scan round complete, waiting {:?} before next round",
                self.config.scanner.scan_interval()
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Continuous scanning stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.scanner.scan_interval()) => {}
            }
        }
    }

    /// Cancels the active scan. Every blocking call in the pipeline observes
    /// the signal within its current timeout.
    pub fn stop(&self) {
        self.lock_cancel().cancel();
    }

    pub fn is_running(&self) -> bool {
        *self.scan_flag.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn stats(&self) -> ScanStats {
        self.stats.snapshot()
    }

    pub fn credential_states(&self) -> Vec<CredentialStateView> {
        self.github.pool().states()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn begin_scan(self: &Arc<Self>) -> AppResult<(ScanGuard, CancellationToken)> {
        {
            let mut flag = self.scan_flag.lock().unwrap_or_else(|p| p.into_inner());
            if *flag {
                return Err(AppError::AlreadyRunning);
            }
            *flag = true;
        }

        let token = CancellationToken::new();
        *self.lock_cancel() = token.clone();
        self.stats.update(|s| {
            s.is_active = true;
            s.start_time = Utc::now().timestamp();
        });

        Ok((
            ScanGuard {
                scanner: Arc::clone(self),
            },
            token,
        ))
    }

    fn lock_cancel(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// One query through the whole pipeline. The query is marked processed
    /// only after every item worker has returned.
    async fn process_query(
        self: &Arc<Self>,
        query: &str,
        priority: usize,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        if self.store.is_query_processed(query)? {
            info!("Query already processed, skipping: {}", query);
            return Ok(());
        }

        let result = self.github.search(query, cancel).await?;

        if result.items.is_empty() {
            info!("No items found for query: {}", query);
            return self.store.mark_query_processed(query);
        }
        info!("Found {} items for query: {}", result.items.len(), query);

        let total = result.items.len();
        let unique: Vec<SearchItem> = result
            .items
            .into_iter()
            .filter(|item| {
                self.deduplicator.try_add(
                    &item.html_url,
                    &item.repository.full_name,
                    &item.path,
                    priority,
                )
            })
            .collect();
        if unique.len() < total {
            info!(
                "After deduplication: {} unique items ({} duplicates dropped)",
                unique.len(),
                total - unique.len()
            );
        }

        let filtered = self.filter_items(unique);
        self.stats
            .update(|s| s.total_files += filtered.len() as u64);

        if !filtered.is_empty() {
            self.process_items(filtered, cancel).await?;
        }

        self.store.mark_query_processed(query)
    }

    /// Drops blacklisted paths and repositories older than the configured
    /// push-date window before any fetch is attempted.
    fn filter_items(&self, items: Vec<SearchItem>) -> Vec<SearchItem> {
        let blacklist: Vec<String> = self
            .config
            .scanner
            .file_blacklist
            .iter()
            .map(|t| t.to_lowercase())
            .collect();
        let cutoff = if self.config.scanner.date_range_days > 0 {
            Some(Utc::now() - chrono::Duration::days(self.config.scanner.date_range_days))
        } else {
            None
        };

        items
            .into_iter()
            .filter(|item| {
                let path = item.path.to_lowercase();
                if blacklist.iter().any(|token| path.contains(token)) {
                    debug!("Skipping blacklisted path: {}", item.path);
                    return false;
                }
                if let Some(cutoff) = cutoff {
                    if let Ok(pushed_at) =
                        chrono::DateTime::parse_from_rfc3339(&item.repository.pushed_at)
                    {
                        if pushed_at.with_timezone(&Utc) < cutoff {
                            debug!(
                                "Skipping stale repository {} (pushed {})",
                                item.repository.full_name, item.repository.pushed_at
                            );
                            return false;
                        }
                    }
                }
                true
            })
            .collect()
    }

    /// Fans items out to a bounded worker group. Returns `Cancelled` if any
    /// worker observed the signal, so the caller does not mark the query.
    async fn process_items(
        self: &Arc<Self>,
        items: Vec<SearchItem>,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.scanner.worker_count));
        let mut handles = Vec::new();

        for item in items {
            let scanner = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return Ok(());
                };
                if cancel.is_cancelled() {
                    return Err(AppError::Cancelled);
                }
                scanner.process_item(&item, &cancel).await
            }));
        }

        let mut cancelled = false;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(AppError::Cancelled)) => cancelled = true,
                Ok(Err(e)) => {
                    warn!("Item worker error: {}", e);
                    self.stats.update(|s| s.error_count += 1);
                }
                Err(e) => warn!("Item worker panicked: {}", e),
            }
        }

        if cancelled {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// One artifact: seen-check, fetch, extract, validate, persist, mark.
    /// Fetch and persistence failures skip the item without marking the sha,
    /// so a later round retries it.
    async fn process_item(
        self: &Arc<Self>,
        item: &SearchItem,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        match self.store.is_sha_seen(&item.sha) {
            Ok(true) => {
                debug!("SHA already scanned, skipping: {}", item.sha);
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Failed to check SHA {}: {}", item.sha, e);
                return Ok(());
            }
        }

        let content = match self.github.fetch(item, cancel).await {
            Ok(bytes) => bytes,
            Err(AppError::Cancelled) => return Err(AppError::Cancelled),
            Err(e) => {
                warn!("Failed to get file content for {}: {}", item.html_url, e);
                return Ok(());
            }
        };

        let text = String::from_utf8_lossy(&content);
        let candidates = extract_candidates(&text);
        if candidates.is_empty() {
            if let Err(e) = self.store.mark_sha_seen(&item.sha) {
                warn!("Failed to mark SHA {}: {}", item.sha, e);
                return Ok(());
            }
            self.stats.update(|s| s.processed_files += 1);
            return Ok(());
        }

        info!("Found {} potential key(s) in {}", candidates.len(), item.path);

        let outcomes = self.validator.validate_batch(candidates, cancel).await;

        let now = Utc::now().timestamp();
        let mut valid = Vec::new();
        let mut rate_limited = Vec::new();
        for outcome in outcomes {
            match outcome.verdict {
                Verdict::Valid => valid.push(Finding {
                    id: 0,
                    secret: outcome.candidate.secret,
                    provider: outcome.candidate.provider.as_str().to_string(),
                    kind: outcome.candidate.kind.as_str().to_string(),
                    source: "github".to_string(),
                    repo_name: item.repository.full_name.clone(),
                    file_path: item.path.clone(),
                    file_url: item.html_url.clone(),
                    sha: item.sha.clone(),
                    validated_at: outcome.validated_at,
                    created_at: now,
                    updated_at: now,
                }),
                Verdict::RateLimited | Verdict::QuotaExceeded => {
                    rate_limited.push(RateLimitedFinding {
                        id: 0,
                        secret: outcome.candidate.secret,
                        provider: outcome.candidate.provider.as_str().to_string(),
                        kind: outcome.candidate.kind.as_str().to_string(),
                        source: "github".to_string(),
                        repo_name: item.repository.full_name.clone(),
                        file_path: item.path.clone(),
                        file_url: item.html_url.clone(),
                        sha: item.sha.clone(),
                        reason: outcome.verdict.as_str().to_string(),
                        created_at: now,
                    })
                }
                // Invalid keys and probe errors are not persisted.
                Verdict::Invalid | Verdict::Error => {}
            }
        }

        // Findings must be durable before the sha is marked and the progress
        // counter moves; a failed write leaves the item retryable.
        if !valid.is_empty() {
            if let Err(e) = self.store.save_valid_findings(&valid) {
                error!("Failed to save valid findings: {}", e);
                return Ok(());
            }
            info!("Saved {} valid key(s) from {}", valid.len(), item.path);
            self.stats.update(|s| s.valid_keys += valid.len() as u64);
        }
        if !rate_limited.is_empty() {
            if let Err(e) = self.store.save_rate_limited_findings(&rate_limited) {
                error!("Failed to save rate limited findings: {}", e);
                return Ok(());
            }
            info!(
                "Saved {} rate limited key(s) from {}",
                rate_limited.len(),
                item.path
            );
            self.stats
                .update(|s| s.rate_limited_keys += rate_limited.len() as u64);
        }

        if let Err(e) = self.store.mark_sha_seen(&item.sha) {
            warn!("Failed to mark SHA {}: {}", item.sha, e);
            return Ok(());
        }
        self.stats.update(|s| s.processed_files += 1);
        Ok(())
    }

    fn write_progress(&self, scanning: bool) {
        let stats = self.stats.snapshot();
        let progress = ScanProgress {
            last_scan_at: Utc::now().timestamp(),
            total_files_scanned: stats.processed_files as i64,
            valid_found: stats.valid_keys as i64,
            rate_limited_found: stats.rate_limited_keys as i64,
            queries_processed: stats.processed_queries as i64,
            is_scanning: scanning,
            current_query: stats.current_query,
        };
        if let Err(e) = self.store.update_progress(&progress) {
            warn!("Failed to update scan progress: {}", e);
        }
    }
}

/// Clears the running flag and the progress row's scanning bit however the
/// scan exits.
struct ScanGuard {
    scanner: Arc<Scanner>,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        {
            let mut flag = self
                .scanner
                .scan_flag
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            *flag = false;
        }
        self.scanner.stats.update(|s| s.is_active = false);
        self.scanner.write_progress(false);
    }
}
