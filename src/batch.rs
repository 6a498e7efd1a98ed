use std::sync::Arc;

use tokio::task::JoinSet;

use crate::extract::PageExtractor;
use crate::formats::ExtractedArticle;

/// Number of fetches in flight at once.
pub const BATCH_SIZE: usize = 3;

/// Extracts `urls` in consecutive groups of [`BATCH_SIZE`].
///
/// A group is fully drained before the next one starts. Within a group, articles are
/// appended in the order their extractions settle. Members that yield nothing or panic
/// are skipped without affecting their siblings.
pub async fn extract_many<E>(extractor: Arc<E>, urls: &[String]) -> Vec<ExtractedArticle>
where
    E: PageExtractor + ?Sized + 'static,
{
    tracing::info!(urls = urls.len(), "extracting pages");

    let mut articles = Vec::with_capacity(urls.len());
    for (group_index, group) in urls.chunks(BATCH_SIZE).enumerate() {
        let mut join_set = JoinSet::new();
        for url in group {
            let extractor = Arc::clone(&extractor);
            let url = url.clone();
            join_set.spawn(async move { extractor.extract(&url).await });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(article)) => articles.push(article),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(group = group_index, ?err, "extraction task aborted");
                }
            }
        }
    }

    tracing::info!(
        extracted = articles.len(),
        total = urls.len(),
        "extraction finished"
    );
    articles
}
