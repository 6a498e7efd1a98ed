//! The reading-list file doubles as the durable per-URL delivery state.
//!
//! ```text
//! https://example.com/article-1
//! https://example.com/article-2 - SENT
//! https://example.com/article-3 - FAILED
//! ```
//!
//! Records are addressed by their zero-based line index. Lines are only ever rewritten in
//! place, never inserted, removed, or reordered, so indices stay valid across repeated marks.
//! Only one writer is supported; there is no file locking.

use std::path::Path;

use anyhow::Context as _;

use crate::formats::{SyncRecord, SyncStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub total: usize,
    pub pending: usize,
    pub sent: usize,
    pub failed: usize,
}

pub fn parse(path: &Path) -> anyhow::Result<Vec<SyncRecord>> {
    if !path.is_file() {
        anyhow::bail!("sync file not found: {}", path.display());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read sync file: {}", path.display()))?;
    Ok(parse_str(&contents))
}

pub fn parse_str(contents: &str) -> Vec<SyncRecord> {
    contents
        .split('\n')
        .enumerate()
        .filter_map(|(line_number, raw_line)| {
            let (url, status) = parse_line(raw_line)?;
            Some(SyncRecord {
                url: url.to_owned(),
                status,
                line_number,
                raw_line: raw_line.to_owned(),
            })
        })
        .collect()
}

/// Bare URL and status of a line, or `None` for lines that are not URL records.
pub fn parse_line(line: &str) -> Option<(&str, SyncStatus)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || !trimmed.starts_with("http") {
        return None;
    }
    Some(split_status(trimmed))
}

pub fn unprocessed(records: &[SyncRecord]) -> Vec<SyncRecord> {
    records
        .iter()
        .filter(|record| record.status.is_unprocessed())
        .cloned()
        .collect()
}

/// Rewrites line `line_number` as `"<url> - <STATUS>"`.
///
/// The file is re-read on every call. A line already marked `SENT` is never downgraded to
/// `FAILED`.
pub fn mark(path: &Path, line_number: usize, url: &str, status: SyncStatus) -> anyhow::Result<()> {
    let Some(suffix) = status.suffix() else {
        anyhow::bail!("cannot mark a sync record as {status}");
    };

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read sync file: {}", path.display()))?;
    let mut lines = contents.split('\n').map(str::to_owned).collect::<Vec<_>>();

    let line_count = lines.len();
    let line = lines.get_mut(line_number).ok_or_else(|| {
        anyhow::anyhow!(
            "sync file line {line_number} out of range ({line_count} lines): {}",
            path.display()
        )
    })?;

    let bare_url = split_status(url.trim()).0;
    let (current_url, current_status) = parse_line(line).ok_or_else(|| {
        anyhow::anyhow!(
            "sync file line {line_number} is not a url record: {}",
            path.display()
        )
    })?;
    if current_url != bare_url {
        anyhow::bail!(
            "sync file line {line_number} holds {current_url}, expected {bare_url}: {}",
            path.display()
        );
    }
    if current_status == SyncStatus::Sent && status == SyncStatus::Failed {
        tracing::warn!(url = %bare_url, line = line_number, "refusing to downgrade SENT record");
        return Ok(());
    }

    let carriage_return = if line.ends_with('\r') { "\r" } else { "" };
    *line = format!("{bare_url}{suffix}{carriage_return}");

    write_atomic(path, &lines.join("\n"))?;
    tracing::debug!(url = %bare_url, line = line_number, %status, "marked sync record");
    Ok(())
}

pub fn summarize(records: &[SyncRecord]) -> SyncSummary {
    let mut summary = SyncSummary {
        total: records.len(),
        ..SyncSummary::default()
    };
    for record in records {
        match record.status {
            SyncStatus::Pending => summary.pending += 1,
            SyncStatus::Sent => summary.sent += 1,
            SyncStatus::Failed => summary.failed += 1,
        }
    }
    summary
}

fn split_status(trimmed: &str) -> (&str, SyncStatus) {
    if let Some(url) = trimmed.strip_suffix(SyncStatus::SENT_SUFFIX) {
        return (url.trim_end(), SyncStatus::Sent);
    }
    if let Some(url) = trimmed.strip_suffix(SyncStatus::FAILED_SUFFIX) {
        return (url.trim_end(), SyncStatus::Failed);
    }
    (trimmed, SyncStatus::Pending)
}

fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp_path, contents)
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("rename tmp to sync file: {}", path.display()))?;
    Ok(())
}
