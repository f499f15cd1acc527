use serde::Deserialize;

/// One page (or the merged whole) of a code-search response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub total_count: i64,
    #[serde(default)]
    pub incomplete_results: bool,
    #[serde(default)]
    pub items: Vec<SearchItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchItem {
    #[serde(default)]
    pub name: String,
    pub path: String,
    pub sha: String,
    #[serde(default)]
    pub html_url: String,
    pub repository: Repository,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub full_name: String,
    /// RFC 3339 timestamp of the repository's last push; empty when the API
    /// omits it.
    #[serde(default)]
    pub pushed_at: String,
    #[serde(default)]
    pub private: bool,
}

/// Response of the contents endpoint. `content` is base64 with embedded
/// newlines when the file is small enough to inline.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileContent {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub encoding: String,
}
