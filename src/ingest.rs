use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;

use crate::batch;
use crate::extract::PageExtractor;
use crate::formats::{
    ExtractedArticle, ExtractionOutcome, InputKind, InputRequest, ProcessedRequest,
};
use crate::sync_state;

/// Resolves each classified input into articles or a forwarded document. A failing
/// request is recorded as [`ExtractionOutcome::Failed`] and never stops the others.
pub async fn process_requests<E>(
    extractor: Arc<E>,
    requests: Vec<InputRequest>,
) -> Vec<ProcessedRequest>
where
    E: PageExtractor + ?Sized + 'static,
{
    let mut processed = Vec::with_capacity(requests.len());
    for request in requests {
        let outcome = match request.kind {
            InputKind::Url => {
                let urls = vec![request.input.clone()];
                articles_or_failure(batch::extract_many(Arc::clone(&extractor), &urls).await, 1)
            }
            InputKind::UrlFile => match read_url_list(Path::new(&request.input)) {
                Ok(urls) => articles_or_failure(
                    batch::extract_many(Arc::clone(&extractor), &urls).await,
                    urls.len(),
                ),
                Err(err) => {
                    tracing::warn!(input = %request.input, error = %format!("{err:#}"), "cannot read url list");
                    ExtractionOutcome::Failed(format!("{err:#}"))
                }
            },
            InputKind::LocalDocument => ExtractionOutcome::Document(PathBuf::from(&request.input)),
        };
        processed.push(ProcessedRequest { request, outcome });
    }
    processed
}

/// Bare URLs listed in a file, with any sync status suffix removed.
pub fn read_url_list(path: &Path) -> anyhow::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read url list: {}", path.display()))?;
    Ok(contents
        .lines()
        .filter_map(sync_state::parse_line)
        .map(|(url, _)| url.to_owned())
        .collect())
}

fn articles_or_failure(
    articles: Vec<ExtractedArticle>,
    attempted: usize,
) -> ExtractionOutcome {
    if articles.is_empty() {
        ExtractionOutcome::Failed(format!("no readable content from {attempted} url(s)"))
    } else {
        ExtractionOutcome::Articles(articles)
    }
}
