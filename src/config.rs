use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::cli::InitArgs;

pub const CONFIG_PATH_ENV: &str = "EASY_KINDLE_CONFIG";
pub const PASSWORD_ENV: &str = "EASY_KINDLE_PASSWORD";
pub const GMAIL_SMTP_SERVER: &str = "smtp.gmail.com";
pub const DEFAULT_SMTP_PORT: u16 = 465;

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub sender: String,
    pub receiver: String,
    pub store_path: PathBuf,
    #[serde(default)]
    pub password: String,
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub sync_file_path: PathBuf,
}

fn default_port() -> u16 {
    DEFAULT_SMTP_PORT
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .field("store_path", &self.store_path)
            .field("password", &"<redacted>")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("sync_file_path", &self.sync_file_path)
            .finish()
    }
}

impl AppConfig {
    pub fn from_init_args(args: &InitArgs) -> anyhow::Result<Self> {
        let sender = args.sender.trim().to_owned();
        if !sender.contains('@') {
            anyhow::bail!("--sender must be an email address: {sender}");
        }
        let receiver = args.receiver.trim().to_owned();
        if !receiver.contains('@') {
            anyhow::bail!("--receiver must be an email address: {receiver}");
        }

        let server = match args.server.as_deref().map(str::trim) {
            Some(server) if !server.is_empty() => server.to_owned(),
            _ if sender.to_ascii_lowercase().ends_with("@gmail.com") => {
                GMAIL_SMTP_SERVER.to_owned()
            }
            _ => anyhow::bail!("--server is required for non-Gmail senders"),
        };

        Ok(Self {
            sender,
            receiver,
            store_path: PathBuf::from(&args.store_path),
            password: args.password.clone().unwrap_or_default(),
            server,
            port: args.port.unwrap_or(DEFAULT_SMTP_PORT),
            sync_file_path: PathBuf::from(&args.sync_file),
        })
    }
}

/// `--config`, then `EASY_KINDLE_CONFIG`, then `~/.easy-kindle/config.json`.
pub fn resolve_path(flag: Option<&str>) -> anyhow::Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(PathBuf::from(path));
    }
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV)
        && !path.trim().is_empty()
    {
        return Ok(PathBuf::from(path));
    }
    let home = std::env::var("HOME")
        .context("HOME is not set; pass --config or set EASY_KINDLE_CONFIG")?;
    Ok(PathBuf::from(home).join(".easy-kindle").join("config.json"))
}

pub fn load(path: &Path) -> anyhow::Result<AppConfig> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            anyhow::bail!(
                "no config file at {}; run `easy-kindle init` first",
                path.display()
            );
        }
        Err(err) => {
            return Err(err).with_context(|| format!("read config: {}", path.display()));
        }
    };
    let mut config: AppConfig = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse config: {}", path.display()))?;

    if let Ok(password) = std::env::var(PASSWORD_ENV)
        && !password.is_empty()
    {
        config.password = password;
    }

    tracing::info!(path = %path.display(), "loaded config");
    tracing::debug!(?config, "config");
    Ok(config)
}

pub fn save(path: &Path, config: &AppConfig) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create config dir: {}", parent.display()))?;
    }

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(config).context("serialize config")?;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        // Owner-only: the file holds the SMTP password.
        options.mode(0o600);
    }
    let mut file = options
        .open(&tmp_path)
        .with_context(|| format!("create tmp: {}", tmp_path.display()))?;
    file.write_all(&data)
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    drop(file);
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("rename tmp to config: {}", path.display()))?;
    Ok(())
}

pub fn init(config_flag: Option<&str>, args: InitArgs) -> anyhow::Result<()> {
    let path = resolve_path(config_flag)?;
    if path.exists() && !args.force {
        anyhow::bail!(
            "config already exists: {} (pass --force to overwrite)",
            path.display()
        );
    }

    let config = AppConfig::from_init_args(&args)?;
    save(&path, &config)?;
    println!("config written to {}", path.display());
    Ok(())
}
