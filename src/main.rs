use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;

use easy_kindle::cli::{Cli, Command};
use easy_kindle::config::{self, AppConfig};
use easy_kindle::sync::DeliveryMode;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    easy_kindle::logging::init(cli.verbose).context("init logging")?;
    tracing::debug!(?cli, "parsed cli");

    let config_flag = cli.config.as_deref();
    match cli.command {
        Command::Send(args) => {
            let config = load_config(config_flag)?;
            easy_kindle::send::run(&config, args)
                .await
                .context("send")?;
        }
        Command::Download(args) => {
            let out_dir = match args.out.as_deref() {
                Some(out) => PathBuf::from(out),
                None => load_config(config_flag)?.store_path,
            };
            easy_kindle::send::download(&out_dir, args)
                .await
                .context("download")?;
        }
        Command::Sync(args) => {
            let config = load_config(config_flag)?;
            let path = args
                .file
                .map(PathBuf::from)
                .unwrap_or_else(|| config.sync_file_path.clone());
            let mode = if args.separate {
                DeliveryMode::Separate
            } else {
                DeliveryMode::Combined
            };
            let extractor = Arc::new(easy_kindle::extract::HttpExtractor::new()?);
            let packager = easy_kindle::epub::EpubPackager::new(&config.store_path)?;
            let mailer = easy_kindle::mail::SmtpMailer::from_config(&config);
            let report = easy_kindle::sync::run_sync(
                &path,
                extractor,
                &packager,
                &mailer,
                mode,
                args.title.as_deref(),
            )
            .await
            .context("sync")?;
            println!("{report}");
        }
        Command::Status(args) => {
            let path = match args.file {
                Some(file) => PathBuf::from(file),
                None => load_config(config_flag)?.sync_file_path,
            };
            let records = easy_kindle::sync_state::parse(&path).context("status")?;
            print!("{}", easy_kindle::sync::render_status(&records));
        }
        Command::Init(args) => {
            config::init(config_flag, args).context("init")?;
        }
    }

    Ok(())
}

fn load_config(flag: Option<&str>) -> anyhow::Result<AppConfig> {
    let path = config::resolve_path(flag)?;
    config::load(&path).context("load config")
}
