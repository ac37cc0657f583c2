//! URL discovery for a new crawl session.

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tracing::debug;
use url::Url;

static HREF: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r#"(?i)href\s*=\s*["']([^"'#\s]+)"#).expect("href pattern is valid"));

#[derive(Debug, Error)]
pub enum DiscoveryError {
  #[error("invalid start url {0}")]
  InvalidUrl(String),
  #[error("failed to fetch {url}: {message}")]
  Fetch { url: String, message: String },
}

#[async_trait]
pub trait Discoverer: Send + Sync {
  /// At most `max_pages` URLs to crawl, start URL first.
  async fn discover(&self, start_url: &str, max_pages: usize) -> Result<Vec<String>, DiscoveryError>;
}

/// Same-host links found on the start page.
pub struct HttpLinkDiscoverer {
  client: reqwest::Client,
}

impl HttpLinkDiscoverer {
  pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("crawlq/", env!("CARGO_PKG_VERSION")))
      .build()?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Discoverer for HttpLinkDiscoverer {
  async fn discover(&self, start_url: &str, max_pages: usize) -> Result<Vec<String>, DiscoveryError> {
    let base = Url::parse(start_url).map_err(|_| DiscoveryError::InvalidUrl(start_url.to_string()))?;
    let fetch_err = |e: reqwest::Error| DiscoveryError::Fetch { url: start_url.to_string(), message: e.to_string() };
    let body = self
      .client
      .get(base.clone())
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(fetch_err)?
      .text()
      .await
      .map_err(fetch_err)?;
    let links = extract_links(&base, &body, max_pages);
    debug!(start_url, found = links.len(), "links discovered");
    Ok(links)
  }
}

/// Resolve every href against `base`, keep http(s) links on the same host,
/// drop fragments and duplicates, preserve page order.
pub fn extract_links(base: &Url, html: &str, max_pages: usize) -> Vec<String> {
  let mut seen = HashSet::new();
  let mut links = Vec::new();
  let mut start = base.clone();
  start.set_fragment(None);
  for candidate in std::iter::once(start).chain(HREF.captures_iter(html).filter_map(|c| base.join(&c[1]).ok())) {
    if links.len() >= max_pages {
      break;
    }
    if !matches!(candidate.scheme(), "http" | "https") || candidate.host_str() != base.host_str() {
      continue;
    }
    let mut candidate = candidate;
    candidate.set_fragment(None);
    let text = candidate.to_string();
    if seen.insert(text.clone()) {
      links.push(text);
    }
  }
  links
}

/// Crawls exactly the URLs it was given.
pub struct StaticDiscoverer {
  urls: Vec<String>,
}

impl StaticDiscoverer {
  pub fn new(urls: Vec<String>) -> Self {
    Self { urls }
  }
}

#[async_trait]
impl Discoverer for StaticDiscoverer {
  async fn discover(&self, _start_url: &str, max_pages: usize) -> Result<Vec<String>, DiscoveryError> {
    let mut seen = HashSet::new();
    Ok(
      self
        .urls
        .iter()
        .filter(|u| seen.insert(u.as_str()))
        .take(max_pages)
        .cloned()
        .collect(),
    )
  }
}
