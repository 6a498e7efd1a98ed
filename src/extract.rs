use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use readability_js::{Readability, ReadabilityError, ReadabilityOptions};
use reqwest::header::ACCEPT;

use crate::formats::ExtractedArticle;
use crate::normalize;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const UNTITLED: &str = "Untitled";

/// Turns one URL into a readable article. Every failure mode yields `None`.
#[async_trait]
pub trait PageExtractor: Send + Sync {
    async fn extract(&self, url: &str) -> Option<ExtractedArticle>;
}

#[derive(Debug, Clone)]
pub struct HttpExtractor {
    client: reqwest::Client,
}

impl HttpExtractor {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_timeout(FETCH_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build extractor http client")?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &str) -> anyhow::Result<String> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("GET {url}: HTTP {status}");
        }

        response
            .text()
            .await
            .with_context(|| format!("read body: {url}"))
    }
}

#[async_trait]
impl PageExtractor for HttpExtractor {
    async fn extract(&self, url: &str) -> Option<ExtractedArticle> {
        tracing::info!(url = %url, "fetching");
        let html = match self.fetch(url).await {
            Ok(html) => html,
            Err(err) => {
                tracing::warn!(url = %url, error = %format!("{err:#}"), "fetch failed");
                return None;
            }
        };
        tracing::debug!(url = %url, chars = html.len(), "fetched page");

        let page_url = url.to_owned();
        let parsed = tokio::task::spawn_blocking(move || article_from_html(&html, &page_url)).await;
        match parsed {
            Ok(Ok(Some(article))) => {
                tracing::info!(
                    url = %url,
                    title = %article.title,
                    chars = article.length,
                    images = article.image_urls.len(),
                    "extracted article"
                );
                Some(article)
            }
            Ok(Ok(None)) => {
                tracing::warn!(url = %url, "no readable content");
                None
            }
            Ok(Err(err)) => {
                tracing::warn!(url = %url, error = %format!("{err:#}"), "readability extraction failed");
                None
            }
            Err(err) => {
                tracing::warn!(url = %url, ?err, "extraction task failed");
                None
            }
        }
    }
}

/// Runs readability over a fetched page and normalizes the result against `url`.
pub fn article_from_html(html: &str, url: &str) -> anyhow::Result<Option<ExtractedArticle>> {
    let readability = Readability::new().context("initialize readability-js")?;
    let article = match readability.parse_with_url(html, url) {
        Ok(article) => article,
        Err(ReadabilityError::ReadabilityCheckFailed) => {
            let options = ReadabilityOptions::new()
                .char_threshold(0)
                .nb_top_candidates(10)
                .link_density_modifier(2.0);
            readability
                .parse_with_options(html, Some(url), Some(options))
                .context("readability parse (relaxed)")?
        }
        Err(err) => return Err(err).context("readability parse"),
    };

    if article.content.trim().is_empty() {
        return Ok(None);
    }

    let html_content = normalize::normalize(&article.content, url);
    let image_urls = normalize::collect_image_urls(&html_content, url);
    let plain_text = normalize::plain_text(&html_content);
    if plain_text.is_empty() && image_urls.is_empty() {
        return Ok(None);
    }

    let title = article.title.trim();
    let title = if title.is_empty() { UNTITLED } else { title };

    Ok(Some(ExtractedArticle {
        source_url: url.to_owned(),
        title: title.to_owned(),
        length: plain_text.chars().count(),
        plain_text,
        html_content,
        excerpt: article.excerpt.unwrap_or_default(),
        byline: article.byline.unwrap_or_default(),
        published_time: article.published_time.filter(|t| !t.trim().is_empty()),
        image_urls,
    }))
}
