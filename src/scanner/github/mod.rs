mod client;
mod types;

pub use client::SearchClient;
pub use types::{FileContent, Repository, SearchItem, SearchResult};
