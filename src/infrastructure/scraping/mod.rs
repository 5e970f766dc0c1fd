//! Default page fetcher for the scrape worker.
//!
//! Plain HTTP GET with a naive href scan. Browser automation, URL
//! normalization, and HTML conversion are external collaborators; the
//! queue and the worker loop only need something that fetches.

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::error::CoreError;
use crate::domain::ports::{FetchedPage, PageFetcher};

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout_seconds: u64) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .user_agent("zmcp-scrape-worker/0.1")
            .build()
            .map_err(|e| CoreError::TransportUnavailable(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, CoreError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::TransportUnavailable(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(CoreError::TransportUnavailable(format!(
                "{url}: status {}",
                response.status()
            )));
        }
        let content = response
            .text()
            .await
            .map_err(|e| CoreError::TransportUnavailable(format!("{url}: {e}")))?;

        let links = extract_links(&content, url);
        Ok(FetchedPage {
            url: url.to_string(),
            content,
            links,
        })
    }
}

/// Pull absolute http(s) hrefs out of a document. Relative links are the
/// URL normalizer collaborator's problem.
fn extract_links(html: &str, _base: &str) -> Vec<String> {
    let mut links = Vec::new();
    for chunk in html.split("href=").skip(1) {
        let Some(quote) = chunk.chars().next() else {
            continue;
        };
        if quote != '"' && quote != '\'' {
            continue;
        }
        if let Some(end) = chunk[1..].find(quote) {
            let candidate = &chunk[1..=end];
            if candidate.starts_with("http://") || candidate.starts_with("https://") {
                links.push(candidate.to_string());
            }
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_links_absolute_only() {
        let html = r#"<a href="https://x/one">1</a> <a href='/relative'>r</a>
                      <a href="http://y/two">2</a>"#;
        let links = extract_links(html, "https://x");
        assert_eq!(links, vec!["https://x/one", "http://y/two"]);
    }

    #[test]
    fn test_extract_links_tolerates_garbage() {
        assert!(extract_links("href=", "x").is_empty());
        assert!(extract_links("no links here", "x").is_empty());
    }
}
