use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;

use crate::classify;
use crate::cli::{DownloadArgs, SendArgs};
use crate::config::AppConfig;
use crate::epub::{EpubPackager, Packager};
use crate::extract::HttpExtractor;
use crate::formats::{ExtractionOutcome, MailAttachment, ProcessedRequest};
use crate::ingest;
use crate::mail::{DEFAULT_BODY, Mailer, SmtpMailer};

pub async fn run(config: &AppConfig, args: SendArgs) -> anyhow::Result<()> {
    let processed = resolve_inputs(&args.items).await?;
    let packager = EpubPackager::new(&config.store_path)?;
    let documents =
        build_documents(&packager, &processed, args.title.as_deref(), args.separate).await;
    if documents.is_empty() {
        anyhow::bail!("nothing to send: every input failed");
    }

    let attachments = documents
        .iter()
        .map(MailAttachment::from_path)
        .collect::<Vec<_>>();
    let mailer = SmtpMailer::from_config(config);
    mailer
        .deliver(&mail_subject(&attachments), DEFAULT_BODY, &attachments)
        .await
        .context("send mail")?;

    for attachment in &attachments {
        println!("sent {}", attachment.filename);
    }
    Ok(())
}

pub async fn download(out_dir: &Path, args: DownloadArgs) -> anyhow::Result<()> {
    let processed = resolve_inputs(&args.items).await?;
    let packager = EpubPackager::new(out_dir)?;
    let documents =
        build_documents(&packager, &processed, args.title.as_deref(), args.separate).await;
    if documents.is_empty() {
        anyhow::bail!("nothing downloaded: every input failed");
    }

    for document in documents {
        let stored = store_document(&document, out_dir)?;
        println!("{}", stored.display());
    }
    Ok(())
}

async fn resolve_inputs(items: &[String]) -> anyhow::Result<Vec<ProcessedRequest>> {
    let requests = classify::classify(items);
    if requests.is_empty() {
        anyhow::bail!("no usable inputs: expected URLs, URL list files or documents");
    }
    let extractor = Arc::new(HttpExtractor::new()?);
    Ok(ingest::process_requests(extractor, requests).await)
}

/// Packages every successful request and passes local documents through. Failed requests and
/// packaging errors are logged and skipped.
pub async fn build_documents<P>(
    packager: &P,
    processed: &[ProcessedRequest],
    title: Option<&str>,
    separate: bool,
) -> Vec<PathBuf>
where
    P: Packager + ?Sized,
{
    let mut documents = Vec::new();
    for item in processed {
        match &item.outcome {
            ExtractionOutcome::Articles(articles) if separate => {
                for article in articles {
                    match packager.package(std::slice::from_ref(article), None).await {
                        Ok(path) => documents.push(path),
                        Err(err) => {
                            tracing::warn!(url = %article.source_url, error = %format!("{err:#}"), "packaging failed");
                        }
                    }
                }
            }
            ExtractionOutcome::Articles(articles) => match packager.package(articles, title).await {
                Ok(path) => documents.push(path),
                Err(err) => {
                    tracing::warn!(input = %item.request.input, error = %format!("{err:#}"), "packaging failed");
                }
            },
            ExtractionOutcome::Document(path) => documents.push(path.clone()),
            ExtractionOutcome::Failed(reason) => {
                tracing::warn!(input = %item.request.input, %reason, "skipping input");
            }
        }
    }
    documents
}

/// Copies `document` into `out_dir` unless it already lives there.
pub fn store_document(document: &Path, out_dir: &Path) -> anyhow::Result<PathBuf> {
    let file_name = document
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("document has no file name: {}", document.display()))?;
    let target = out_dir.join(file_name);
    if target == document {
        return Ok(target);
    }

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("create output dir: {}", out_dir.display()))?;
    std::fs::copy(document, &target).with_context(|| {
        format!(
            "copy {} to {}",
            document.display(),
            target.display()
        )
    })?;
    Ok(target)
}

fn mail_subject(attachments: &[MailAttachment]) -> String {
    match attachments {
        [single] => Path::new(&single.filename)
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| single.filename.clone()),
        many => format!("{} documents", many.len()),
    }
}
