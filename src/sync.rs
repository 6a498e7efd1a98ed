use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;

use crate::batch;
use crate::epub::Packager;
use crate::extract::PageExtractor;
use crate::formats::{ExtractedArticle, MailAttachment, SyncRecord, SyncStatus};
use crate::mail::{DEFAULT_BODY, Mailer};
use crate::sync_state;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// All articles of a run in one document.
    #[default]
    Combined,
    /// One document and one delivery per article.
    Separate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub sent: usize,
    pub failed: usize,
    pub pending: usize,
}

impl std::fmt::Display for SyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sent: {}, failed: {}, pending: {}",
            self.sent, self.failed, self.pending
        )
    }
}

/// Extracts every unsent URL of the sync file, delivers the results, and records each
/// outcome back into the file.
///
/// Articles are paired with their records by source URL. A URL whose extraction yields
/// nothing, or whose delivery fails, is marked `FAILED` so the next run retries it.
pub async fn run_sync<E, P, M>(
    path: &Path,
    extractor: Arc<E>,
    packager: &P,
    mailer: &M,
    mode: DeliveryMode,
    title: Option<&str>,
) -> anyhow::Result<SyncReport>
where
    E: PageExtractor + ?Sized + 'static,
    P: Packager + ?Sized,
    M: Mailer + ?Sized,
{
    let records = sync_state::parse(path)?;
    let pending = sync_state::unprocessed(&records);
    if pending.is_empty() {
        tracing::info!(path = %path.display(), "nothing to sync");
        return report(path);
    }

    let mut seen = HashSet::new();
    let urls = pending
        .iter()
        .filter(|record| seen.insert(record.url.as_str()))
        .map(|record| record.url.clone())
        .collect::<Vec<_>>();
    tracing::info!(
        path = %path.display(),
        records = records.len(),
        unprocessed = pending.len(),
        "syncing reading list"
    );

    let mut articles = batch::extract_many(extractor, &urls).await;
    if articles.is_empty() {
        tracing::warn!("no content extracted; marking every attempted url FAILED");
        mark_all(path, pending.iter(), SyncStatus::Failed)?;
        return report(path);
    }

    let mut by_url: HashMap<&str, Vec<&SyncRecord>> = HashMap::new();
    for record in &pending {
        by_url.entry(record.url.as_str()).or_default().push(record);
    }

    // Settle order is arbitrary; deliver in reading-list order.
    let position = urls
        .iter()
        .enumerate()
        .map(|(idx, url)| (url.as_str(), idx))
        .collect::<HashMap<_, _>>();
    articles.sort_by_key(|article| {
        position
            .get(article.source_url.as_str())
            .copied()
            .unwrap_or(usize::MAX)
    });

    let extracted = articles
        .iter()
        .map(|article| article.source_url.as_str())
        .collect::<HashSet<_>>();
    let missing = pending
        .iter()
        .filter(|record| !extracted.contains(record.url.as_str()));
    mark_all(path, missing, SyncStatus::Failed)?;

    match mode {
        DeliveryMode::Combined => {
            let status = match deliver(packager, mailer, &articles, title).await {
                Ok(()) => SyncStatus::Sent,
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "delivery failed");
                    SyncStatus::Failed
                }
            };
            let delivered = articles
                .iter()
                .flat_map(|article| records_for(&by_url, article));
            mark_all(path, delivered, status)?;
        }
        DeliveryMode::Separate => {
            for article in &articles {
                let status = match deliver(packager, mailer, std::slice::from_ref(article), None)
                    .await
                {
                    Ok(()) => SyncStatus::Sent,
                    Err(err) => {
                        tracing::warn!(
                            url = %article.source_url,
                            error = %format!("{err:#}"),
                            "delivery failed"
                        );
                        SyncStatus::Failed
                    }
                };
                mark_all(path, records_for(&by_url, article), status)?;
            }
        }
    }

    report(path)
}

async fn deliver<P, M>(
    packager: &P,
    mailer: &M,
    articles: &[ExtractedArticle],
    title: Option<&str>,
) -> anyhow::Result<()>
where
    P: Packager + ?Sized,
    M: Mailer + ?Sized,
{
    let document = packager
        .package(articles, title)
        .await
        .context("package articles")?;
    let attachment = MailAttachment::from_path(&document);
    let subject = document
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| attachment.filename.clone());
    mailer
        .deliver(&subject, DEFAULT_BODY, std::slice::from_ref(&attachment))
        .await
        .context("deliver document")
}

fn records_for<'a>(
    by_url: &HashMap<&str, Vec<&'a SyncRecord>>,
    article: &ExtractedArticle,
) -> Vec<&'a SyncRecord> {
    by_url
        .get(article.source_url.as_str())
        .cloned()
        .unwrap_or_default()
}

fn mark_all<'a>(
    path: &Path,
    records: impl IntoIterator<Item = &'a SyncRecord>,
    status: SyncStatus,
) -> anyhow::Result<()> {
    for record in records {
        sync_state::mark(path, record.line_number, &record.url, status)
            .with_context(|| format!("mark {} as {status}", record.url))?;
        if status == SyncStatus::Sent {
            tracing::info!(url = %record.url, "sent");
        } else {
            tracing::warn!(url = %record.url, %status, "not delivered");
        }
    }
    Ok(())
}

fn report(path: &Path) -> anyhow::Result<SyncReport> {
    let summary = sync_state::summarize(&sync_state::parse(path)?);
    Ok(SyncReport {
        sent: summary.sent,
        failed: summary.failed,
        pending: summary.pending,
    })
}

/// Totals followed by the URLs still waiting for delivery.
pub fn render_status(records: &[SyncRecord]) -> String {
    let summary = sync_state::summarize(records);
    let mut out = format!(
        "total: {}\nsent: {}\nfailed: {}\npending: {}\n",
        summary.total, summary.sent, summary.failed, summary.pending
    );
    for status in [SyncStatus::Pending, SyncStatus::Failed] {
        let urls = records
            .iter()
            .filter(|record| record.status == status)
            .map(|record| record.url.as_str())
            .collect::<Vec<_>>();
        if urls.is_empty() {
            continue;
        }
        out.push_str(&format!("\n{status}:\n"));
        for url in urls {
            out.push_str(&format!("  {url}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    struct FakeExtractor {
        broken: Vec<&'static str>,
        calls: AtomicUsize,
    }

    impl FakeExtractor {
        fn failing_on(broken: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                broken: broken.to_vec(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PageExtractor for FakeExtractor {
        async fn extract(&self, url: &str) -> Option<ExtractedArticle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.broken.iter().any(|b| url.ends_with(b)) {
                return None;
            }
            Some(ExtractedArticle {
                source_url: url.to_owned(),
                title: format!("Title of {url}"),
                html_content: "<p>x</p>".to_owned(),
                plain_text: "x".to_owned(),
                length: 1,
                excerpt: String::new(),
                byline: String::new(),
                published_time: None,
                image_urls: HashSet::new(),
            })
        }
    }

    #[derive(Default)]
    struct FakePackager {
        batches: Mutex<Vec<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Packager for FakePackager {
        async fn package(
            &self,
            articles: &[ExtractedArticle],
            title: Option<&str>,
        ) -> anyhow::Result<PathBuf> {
            let urls = articles
                .iter()
                .map(|a| a.source_url.clone())
                .collect::<Vec<_>>();
            if let Some(fail) = self.fail_on
                && urls.iter().any(|u| u.ends_with(fail))
            {
                anyhow::bail!("packaging exploded");
            }
            self.batches.lock().unwrap().push(urls);
            let title = title.unwrap_or(&articles[0].title).replace('/', "_");
            Ok(PathBuf::from(format!("/tmp/books/{title}.epub")))
        }
    }

    #[derive(Default)]
    struct FakeMailer {
        subjects: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Mailer for FakeMailer {
        async fn deliver(
            &self,
            subject: &str,
            _body: &str,
            attachments: &[MailAttachment],
        ) -> anyhow::Result<()> {
            assert_eq!(attachments.len(), 1);
            if self.fail {
                anyhow::bail!("smtp unavailable");
            }
            self.subjects.lock().unwrap().push(subject.to_owned());
            Ok(())
        }
    }

    fn sync_file(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reading-list.md");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn delivered_urls_become_sent_and_failed_fetches_stay_failed() {
        let (_dir, path) = sync_file("https://a.test/u1\nhttps://a.test/u2 - SENT\nhttps://a.test/u3 - FAILED\n");
        let extractor = FakeExtractor::failing_on(&["u3"]);
        let packager = FakePackager::default();
        let mailer = FakeMailer::default();

        let report = run_sync(
            &path,
            Arc::clone(&extractor),
            &packager,
            &mailer,
            DeliveryMode::Combined,
            None,
        )
        .await
        .unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "https://a.test/u1 - SENT\nhttps://a.test/u2 - SENT\nhttps://a.test/u3 - FAILED\n"
        );
        assert_eq!(
            report,
            SyncReport {
                sent: 2,
                failed: 1,
                pending: 0,
            }
        );
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            *packager.batches.lock().unwrap(),
            vec![vec!["https://a.test/u1".to_owned()]]
        );
    }

    #[tokio::test]
    async fn early_failure_does_not_shift_marks_onto_neighbours() {
        let (_dir, path) = sync_file("https://a.test/u1\nhttps://a.test/u2\nhttps://a.test/u3\n");
        let extractor = FakeExtractor::failing_on(&["u1"]);

        run_sync(
            &path,
            extractor,
            &FakePackager::default(),
            &FakeMailer::default(),
            DeliveryMode::Separate,
            None,
        )
        .await
        .unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "https://a.test/u1 - FAILED\nhttps://a.test/u2 - SENT\nhttps://a.test/u3 - SENT\n"
        );
    }

    #[tokio::test]
    async fn nothing_extracted_marks_every_attempt_failed() {
        let (_dir, path) = sync_file("# list\nhttps://a.test/u1\nhttps://a.test/u2 - FAILED\n");
        let packager = FakePackager::default();

        let report = run_sync(
            &path,
            FakeExtractor::failing_on(&["u1", "u2"]),
            &packager,
            &FakeMailer::default(),
            DeliveryMode::Combined,
            None,
        )
        .await
        .unwrap();

        assert_eq!(report.failed, 2);
        assert!(packager.batches.lock().unwrap().is_empty());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "# list\nhttps://a.test/u1 - FAILED\nhttps://a.test/u2 - FAILED\n"
        );
    }

    #[tokio::test]
    async fn mail_failure_marks_whole_combined_batch_failed() {
        let (_dir, path) = sync_file("https://a.test/u1\nhttps://a.test/u2\n");
        let mailer = FakeMailer {
            fail: true,
            ..FakeMailer::default()
        };

        let report = run_sync(
            &path,
            FakeExtractor::failing_on(&[]),
            &FakePackager::default(),
            &mailer,
            DeliveryMode::Combined,
            Some("Weekend"),
        )
        .await
        .unwrap();

        assert_eq!(
            report,
            SyncReport {
                sent: 0,
                failed: 2,
                pending: 0,
            }
        );
    }

    #[tokio::test]
    async fn separate_mode_isolates_packaging_failures() {
        let (_dir, path) = sync_file("https://a.test/u1\nhttps://a.test/u2\nhttps://a.test/u3\n");
        let packager = FakePackager {
            fail_on: Some("u2"),
            ..FakePackager::default()
        };
        let mailer = FakeMailer::default();

        let report = run_sync(
            &path,
            FakeExtractor::failing_on(&[]),
            &packager,
            &mailer,
            DeliveryMode::Separate,
            None,
        )
        .await
        .unwrap();

        assert_eq!(
            report,
            SyncReport {
                sent: 2,
                failed: 1,
                pending: 0,
            }
        );
        assert_eq!(
            *mailer.subjects.lock().unwrap(),
            vec![
                "Title of https:__a.test_u1".to_owned(),
                "Title of https:__a.test_u3".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn combined_book_follows_reading_list_order() {
        let (_dir, path) = sync_file(
            "https://a.test/u1\nhttps://a.test/u2\nhttps://a.test/u3\nhttps://a.test/u4\nhttps://a.test/u1\n",
        );
        let packager = FakePackager::default();

        run_sync(
            &path,
            FakeExtractor::failing_on(&[]),
            &packager,
            &FakeMailer::default(),
            DeliveryMode::Combined,
            None,
        )
        .await
        .unwrap();

        let urls = (1..=4)
            .map(|n| format!("https://a.test/u{n}"))
            .collect::<Vec<_>>();
        assert_eq!(*packager.batches.lock().unwrap(), vec![urls]);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "https://a.test/u1 - SENT\nhttps://a.test/u2 - SENT\nhttps://a.test/u3 - SENT\nhttps://a.test/u4 - SENT\nhttps://a.test/u1 - SENT\n"
        );
    }

    #[tokio::test]
    async fn missing_sync_file_aborts_before_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = FakeExtractor::failing_on(&[]);

        let err = run_sync(
            &dir.path().join("absent.txt"),
            Arc::clone(&extractor),
            &FakePackager::default(),
            &FakeMailer::default(),
            DeliveryMode::Combined,
            None,
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("sync file not found"));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fully_sent_list_does_nothing() {
        let (_dir, path) = sync_file("https://a.test/u1 - SENT\n");
        let extractor = FakeExtractor::failing_on(&[]);

        let report = run_sync(
            &path,
            Arc::clone(&extractor),
            &FakePackager::default(),
            &FakeMailer::default(),
            DeliveryMode::Combined,
            None,
        )
        .await
        .unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn status_lists_pending_and_failed_urls() {
        let records = sync_state::parse_str(
            "https://a.test/u1\nhttps://a.test/u2 - SENT\nhttps://a.test/u3 - FAILED\n",
        );

        assert_eq!(
            render_status(&records),
            "total: 3\nsent: 1\nfailed: 1\npending: 1\n\nPENDING:\n  https://a.test/u1\n\nFAILED:\n  https://a.test/u3\n"
        );
    }
}
