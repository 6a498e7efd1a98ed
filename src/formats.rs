use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    Url,
    UrlFile,
    LocalDocument,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRequest {
    pub input: String,
    pub kind: InputKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedArticle {
    /// URL the article was fetched from. Sync records are paired with articles by this key.
    pub source_url: String,
    pub title: String,
    pub html_content: String,
    pub plain_text: String,
    pub length: usize,
    pub excerpt: String,
    pub byline: String,
    pub published_time: Option<String>,
    pub image_urls: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    /// Never empty.
    Articles(Vec<ExtractedArticle>),
    /// Local document forwarded as-is.
    Document(PathBuf),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedRequest {
    pub request: InputRequest,
    pub outcome: ExtractionOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    Pending,
    Sent,
    Failed,
}

impl SyncStatus {
    pub const SENT_SUFFIX: &'static str = " - SENT";
    pub const FAILED_SUFFIX: &'static str = " - FAILED";

    pub fn suffix(self) -> Option<&'static str> {
        match self {
            Self::Pending => None,
            Self::Sent => Some(Self::SENT_SUFFIX),
            Self::Failed => Some(Self::FAILED_SUFFIX),
        }
    }

    pub fn is_unprocessed(self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    pub url: String,
    pub status: SyncStatus,
    /// Zero-based index of the line in the sync file.
    pub line_number: usize,
    pub raw_line: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAttachment {
    pub filename: String,
    pub path: PathBuf,
}

impl MailAttachment {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        Self { filename, path }
    }
}
