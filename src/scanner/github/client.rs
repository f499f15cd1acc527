use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use rand::Rng;
use reqwest::{Client, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{FileContent, SearchItem, SearchResult};
use crate::error::{AppError, AppResult};
use crate::models::GithubConfig;
use crate::scanner::credential::CredentialPool;

const DEFAULT_API_BASE: &str = "https://api.github.com";

/// The search API caps pagination at 10 pages of 100 items.
const MAX_PAGES: u32 = 10;
const PER_PAGE: u32 = 100;
const RESULT_CAP: i64 = 1000;

/// Paginated code search plus file-content retrieval. Every request runs
/// through the credential pool's `pick -> wait -> issue -> report` cycle.
pub struct SearchClient {
    http: Client,
    pool: Arc<CredentialPool>,
    config: GithubConfig,
    api_base: String,
}

impl SearchClient {
    pub fn new(config: GithubConfig, pool: Arc<CredentialPool>) -> AppResult<Self> {
        Self::with_base_url(config, pool, DEFAULT_API_BASE.to_string())
    }

    pub fn with_base_url(
        config: GithubConfig,
        pool: Arc<CredentialPool>,
        api_base: String,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            pool,
            config,
            api_base,
        })
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Searches up to `min(total_count, 1000)` items across at most 10 pages.
    ///
    /// A first-page failure fails the query. A later-page failure logs and
    /// returns the partial result. Pages are separated by a 500-1500ms
    /// cancellable jitter sleep.
    pub async fn search(&self, query: &str, cancel: &CancellationToken) -> AppResult<SearchResult> {
        let mut all_items: Vec<SearchItem> = Vec::new();
        let mut total_count = 0i64;
        let mut expected = 0i64;

        for page in 1..=MAX_PAGES {
            let page_result = match self.search_page(query, page, cancel).await {
                Ok(result) => result,
                Err(e) => {
                    if page == 1 {
                        return Err(e);
                    }
                    warn!("Search page {} failed for query '{}': {}", page, query, e);
                    break;
                }
            };

            if page == 1 {
                total_count = page_result.total_count;
                expected = total_count.min(RESULT_CAP);
            }

            if page_result.items.is_empty() {
                break;
            }
            all_items.extend(page_result.items);

            if all_items.len() as i64 >= expected {
                break;
            }

            if page < MAX_PAGES {
                let delay = Duration::from_millis(rand::thread_rng().gen_range(500..=1500));
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AppError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        info!(
            "Search complete for query '{}': {}/{} items retrieved",
            query,
            all_items.len(),
            expected
        );

        Ok(SearchResult {
            total_count,
            incomplete_results: (all_items.len() as i64) < expected,
            items: all_items,
        })
    }

    async fn search_page(
        &self,
        query: &str,
        page: u32,
        cancel: &CancellationToken,
    ) -> AppResult<SearchResult> {
        let url = format!("{}/search/code", self.api_base);
        let response = self
            .issue(cancel, |credential| {
                self.http
                    .get(&url)
                    .bearer_auth(credential)
                    .header("Accept", "application/vnd.github.v3+json")
                    .query(&[
                        ("q", query.to_string()),
                        ("page", page.to_string()),
                        ("per_page", PER_PAGE.to_string()),
                    ])
            })
            .await?;

        Ok(response.json::<SearchResult>().await?)
    }

    /// Retrieves the file body for one search item. Inline base64 content is
    /// decoded directly; otherwise (or when decoding fails) the download URL
    /// is fetched with the same credential.
    pub async fn fetch(&self, item: &SearchItem, cancel: &CancellationToken) -> AppResult<Vec<u8>> {
        let url = format!(
            "{}/repos/{}/contents/{}",
            self.api_base, item.repository.full_name, item.path
        );
        let response = self
            .issue(cancel, |credential| {
                self.http
                    .get(&url)
                    .bearer_auth(credential)
                    .header("Accept", "application/vnd.github.v3+json")
            })
            .await?;

        let file: FileContent = response.json().await?;

        if file.encoding == "base64" && !file.content.is_empty() {
            let stripped: String = file
                .content
                .chars()
                .filter(|c| !c.is_ascii_whitespace())
                .collect();
            match base64::engine::general_purpose::STANDARD.decode(stripped) {
                Ok(decoded) => return Ok(decoded),
                Err(e) => {
                    warn!(
                        "Failed to decode inline content for {}: {}, falling back to download_url",
                        item.path, e
                    );
                }
            }
        }

        let download_url = file
            .download_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| AppError::Scan(format!("no download URL for {}", item.path)))?;

        let response = self
            .issue(cancel, |credential| {
                self.http.get(&download_url).bearer_auth(credential)
            })
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// One credential-governed request: pick, wait for a limiter slot, send
    /// with bounded retries, fold the outcome back into the pool, classify
    /// rate limits.
    async fn issue<F>(&self, cancel: &CancellationToken, build: F) -> AppResult<Response>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let credential = self.pool.pick()?;
        self.pool.wait(&credential, cancel).await?;

        let response = self.send_with_retry(cancel, || build(&credential)).await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                let ok = status == StatusCode::OK;
                self.pool.report(&credential, resp.headers(), ok);

                if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
                    let cooldown_secs =
                        self.pool
                            .trip(&credential, status.as_u16(), resp.headers());
                    return Err(AppError::RateLimited { cooldown_secs });
                }
                if status != StatusCode::OK {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(AppError::Scan(format!(
                        "unexpected status code: {}, body: {}",
                        status,
                        body.chars().take(200).collect::<String>()
                    )));
                }
                Ok(resp)
            }
            Err(e) => {
                self.pool
                    .report(&credential, &reqwest::header::HeaderMap::new(), false);
                Err(e)
            }
        }
    }

    /// Sends the request, retrying transport errors and 5xx responses with
    /// exponential backoff (1s doubling, 30s cap), bounded by `max_retries`.
    async fn send_with_retry<F>(&self, cancel: &CancellationToken, build: F) -> AppResult<Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let send = build().send();
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                result = send => result,
            };

            let retryable = match &result {
                Ok(resp) => resp.status().is_server_error(),
                Err(_) => true,
            };

            if !retryable || attempt >= self.config.max_retries {
                return result.map_err(AppError::from);
            }

            let backoff = Duration::from_secs((1u64 << attempt).min(30));
            attempt += 1;
            debug!(
                "Request attempt {} failed, retrying in {:?}",
                attempt, backoff
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RateLimitConfig;
    use axum::extract::{Path, Query, State};
    use axum::http::HeaderMap as AxumHeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn test_pool() -> Arc<CredentialPool> {
        // Large burst so limiter waits never slow the tests down.
        let config = RateLimitConfig {
            burst_size: 1000,
            ..Default::default()
        };
        Arc::new(CredentialPool::new(
            vec!["ghp_testcred_000000000001".to_string()],
            config,
        ))
    }

    fn client_for(base_url: String) -> SearchClient {
        SearchClient::with_base_url(GithubConfig::default(), test_pool(), base_url)
            .expect("build client")
    }

    #[derive(Clone)]
    struct SearchState {
        pages: Arc<Vec<Value>>,
        hits: Arc<AtomicUsize>,
    }

    async fn search_handler(
        State(state): State<SearchState>,
        Query(params): Query<HashMap<String, String>>,
    ) -> (AxumHeaderMap, Json<Value>) {
        state.hits.fetch_add(1, Ordering::SeqCst);
        let page: usize = params
            .get("page")
            .and_then(|p| p.parse().ok())
            .unwrap_or(1);
        let body = state
            .pages
            .get(page - 1)
            .cloned()
            .unwrap_or_else(|| json!({"total_count": 0, "items": []}));
        let mut headers = AxumHeaderMap::new();
        headers.insert("X-RateLimit-Remaining", "4999".parse().unwrap());
        headers.insert("X-RateLimit-Reset", "9999999999".parse().unwrap());
        (headers, Json(body))
    }

    async fn serve(app: Router) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        (format!("http://{}", addr), server)
    }

    fn items(prefix: &str, n: usize) -> Vec<Value> {
        (0..n)
            .map(|i| {
                json!({
                    "name": format!("{}-{}.py", prefix, i),
                    "path": format!("src/{}-{}.py", prefix, i),
                    "sha": format!("{}{:04}", prefix, i),
                    "html_url": format!("https://github.com/octo/app/blob/main/{}-{}.py", prefix, i),
                    "repository": {
                        "full_name": "octo/app",
                        "pushed_at": "2026-07-01T00:00:00Z"
                    }
                })
            })
            .collect()
    }

    #[tokio::test]
    async fn search_merges_pages_until_total_count() {
        let state = SearchState {
            pages: Arc::new(vec![
                json!({"total_count": 150, "items": items("a", 100)}),
                json!({"total_count": 150, "items": items("b", 50)}),
            ]),
            hits: Arc::new(AtomicUsize::new(0)),
        };
        let app = Router::new()
            .route("/search/code", get(search_handler))
            .with_state(state.clone());
        let (base, server) = serve(app).await;

        let client = client_for(base);
        let result = client
            .search("AIzaSy in:file", &CancellationToken::new())
            .await
            .expect("search");
        server.abort();

        assert_eq!(result.items.len(), 150);
        assert_eq!(result.total_count, 150);
        assert!(!result.incomplete_results);
        assert_eq!(state.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn search_stops_at_the_platform_result_cap() {
        // Server claims 5000 results; pagination must stop at 1000 collected.
        let pages: Vec<Value> = (0..10)
            .map(|i| json!({"total_count": 5000, "items": items(&format!("p{}", i), 100)}))
            .collect();
        let state = SearchState {
            pages: Arc::new(pages),
            hits: Arc::new(AtomicUsize::new(0)),
        };
        let app = Router::new()
            .route("/search/code", get(search_handler))
            .with_state(state.clone());
        let (base, server) = serve(app).await;

        let client = client_for(base);
        let result = client
            .search("sk-proj in:file", &CancellationToken::new())
            .await
            .expect("search");
        server.abort();

        assert_eq!(result.items.len(), 1000);
        assert_eq!(state.hits.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn rate_limited_page_trips_the_credential() {
        async fn limited_handler() -> (axum::http::StatusCode, AxumHeaderMap, Json<Value>) {
            let mut headers = AxumHeaderMap::new();
            headers.insert("X-RateLimit-Remaining", "0".parse().unwrap());
            let reset = (chrono::Utc::now().timestamp() + 30).to_string();
            headers.insert("X-RateLimit-Reset", reset.parse().unwrap());
            (
                axum::http::StatusCode::TOO_MANY_REQUESTS,
                headers,
                Json(json!({"message": "API rate limit exceeded"})),
            )
        }
        let app = Router::new().route("/search/code", get(limited_handler));
        let (base, server) = serve(app).await;

        let client = client_for(base);
        let result = client
            .search("AIzaSy in:file", &CancellationToken::new())
            .await;
        server.abort();

        assert!(matches!(result, Err(AppError::RateLimited { .. })));
        // The tripped credential was the only one, so the pool is dry.
        assert!(matches!(
            client.pool().pick(),
            Err(AppError::NoCredentialsAvailable)
        ));
    }

    #[tokio::test]
    async fn fetch_decodes_inline_base64_content() {
        async fn contents_handler(Path(_rest): Path<String>) -> Json<Value> {
            // "let key = ..." encoded with a line wrap, as the API returns it.
            let encoded = base64::engine::general_purpose::STANDARD.encode("let key = secret();");
            let wrapped = format!("{}\n{}", &encoded[..10], &encoded[10..]);
            Json(json!({
                "name": "config.py",
                "path": "src/config.py",
                "sha": "abc123",
                "encoding": "base64",
                "content": wrapped,
                "download_url": "http://127.0.0.1:1/unreachable"
            }))
        }
        let app = Router::new().route("/repos/octo/app/contents/*rest", get(contents_handler));
        let (base, server) = serve(app).await;

        let client = client_for(base);
        let item = SearchItem {
            name: "config.py".to_string(),
            path: "src/config.py".to_string(),
            sha: "abc123".to_string(),
            html_url: String::new(),
            repository: super::super::types::Repository {
                full_name: "octo/app".to_string(),
                pushed_at: String::new(),
                private: false,
            },
        };
        let body = client
            .fetch(&item, &CancellationToken::new())
            .await
            .expect("fetch");
        server.abort();

        assert_eq!(body, b"let key = secret();");
    }

    #[tokio::test]
    async fn fetch_falls_back_to_download_url() {
        #[derive(Clone)]
        struct FallbackState {
            base: Arc<std::sync::Mutex<String>>,
        }

        async fn contents_handler(
            State(state): State<FallbackState>,
            Path(_rest): Path<String>,
        ) -> Json<Value> {
            let base = state.base.lock().unwrap().clone();
            Json(json!({
                "name": "big.py",
                "path": "src/big.py",
                "sha": "def456",
                "encoding": "none",
                "content": "",
                "download_url": format!("{}/raw/big.py", base)
            }))
        }

        async fn raw_handler() -> &'static str {
            "raw file body"
        }

        let state = FallbackState {
            base: Arc::new(std::sync::Mutex::new(String::new())),
        };
        let app = Router::new()
            .route("/repos/octo/app/contents/*rest", get(contents_handler))
            .route("/raw/big.py", get(raw_handler))
            .with_state(state.clone());
        let (base, server) = serve(app).await;
        *state.base.lock().unwrap() = base.clone();

        let client = client_for(base);
        let item = SearchItem {
            name: "big.py".to_string(),
            path: "src/big.py".to_string(),
            sha: "def456".to_string(),
            html_url: String::new(),
            repository: super::super::types::Repository {
                full_name: "octo/app".to_string(),
                pushed_at: String::new(),
                private: false,
            },
        };
        let body = client
            .fetch(&item, &CancellationToken::new())
            .await
            .expect("fetch");
        server.abort();

        assert_eq!(body, b"raw file body");
    }
}
