use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the config file (default: `$EASY_KINDLE_CONFIG` or `~/.easy-kindle/config.json`).
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Turn URLs, URL lists and documents into e-books and mail them.
    Send(SendArgs),
    /// Like `send`, but only write the e-books to disk.
    Download(DownloadArgs),
    /// Deliver every unsent URL of the reading list and record the outcome in it.
    Sync(SyncArgs),
    /// Show sent, failed and pending counts of the reading list.
    Status(StatusArgs),
    /// Write the config file.
    Init(InitArgs),
}

#[derive(Debug, Args)]
pub struct SendArgs {
    /// URLs, files listing one URL per line, or local documents.
    #[arg(required = true)]
    pub items: Vec<String>,

    /// Book title (default: first article title).
    #[arg(long)]
    pub title: Option<String>,

    /// One book per article instead of one combined book per request.
    #[arg(long, default_value_t = false)]
    pub separate: bool,
}

#[derive(Debug, Args)]
pub struct DownloadArgs {
    /// URLs, files listing one URL per line, or local documents.
    #[arg(required = true)]
    pub items: Vec<String>,

    /// Book title (default: first article title).
    #[arg(long)]
    pub title: Option<String>,

    /// One book per article instead of one combined book per request.
    #[arg(long, default_value_t = false)]
    pub separate: bool,

    /// Output directory (default: configured store path).
    #[arg(long)]
    pub out: Option<String>,
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// Reading list to sync (default: configured sync file).
    #[arg(long)]
    pub file: Option<String>,

    /// Book title (default: first article title).
    #[arg(long)]
    pub title: Option<String>,

    /// Mail one book per article.
    #[arg(long, default_value_t = false)]
    pub separate: bool,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Reading list to inspect (default: configured sync file).
    #[arg(long)]
    pub file: Option<String>,
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Sender email address (also the SMTP login).
    #[arg(long)]
    pub sender: String,

    /// Kindle address receiving the books.
    #[arg(long)]
    pub receiver: String,

    /// Directory the e-books are written to.
    #[arg(long)]
    pub store_path: String,

    /// Reading list used by `sync` and `status`.
    #[arg(long)]
    pub sync_file: String,

    /// SMTP password (prefer `EASY_KINDLE_PASSWORD` at runtime).
    #[arg(long)]
    pub password: Option<String>,

    /// SMTP server (default for Gmail senders: smtp.gmail.com).
    #[arg(long)]
    pub server: Option<String>,

    /// SMTP port; 465 uses implicit TLS, anything else STARTTLS.
    #[arg(long)]
    pub port: Option<u16>,

    /// Overwrite an existing config file.
    #[arg(long, default_value_t = false)]
    pub force: bool,
}
