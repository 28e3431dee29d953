//! castwatch - CLI entry point

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use castwatch::cli::{Cli, Commands, ConfigCommands};
use castwatch::config::{Config, Quality};
use castwatch::metadata::MetadataResolver;
use castwatch::probe::LivenessProbe;
use castwatch::session::{SessionContext, SessionLoop};
use castwatch::storage::StorageManager;
use castwatch::tools::{Ffmpeg, FfprobeDuration, HttpFetcher, StatusApiProbe, Streamlink};

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            target,
            url,
            quality,
            output_dir,
            fast_exit,
        } => cmd_run(&target, url, quality, output_dir, fast_exit),
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show => cmd_config_show(),
            ConfigCommands::Edit => cmd_config_edit(),
        },
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "castwatch",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}

fn cmd_run(
    target: &str,
    url: Option<String>,
    quality: Option<Quality>,
    output_dir: Option<String>,
    fast_exit: bool,
) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(quality) = quality {
        config.capture.quality = quality;
    }
    if let Some(dir) = output_dir {
        config.storage.directory = dir;
    }
    if fast_exit {
        config.capture.fast_exit = true;
    }

    let target_url = url.unwrap_or_else(|| format!("https://twitcasting.tv/{}", target));

    let storage = StorageManager::new(config.clone(), target);
    storage.ensure_target_dir()?;
    init_logging(&storage.log_file_path())?;

    // Fail fast while the operator is still watching
    Streamlink::check_available()?;
    Ffmpeg::check_available()?;
    storage.check_free_space()?;

    let ctx = SessionContext::new();
    let cancel = ctx.cancel.clone();
    ctrlc::set_handler(move || match cancel.trigger() {
        1 => eprintln!("\nStopping... press Ctrl+C again to force immediate shutdown"),
        _ => eprintln!("\nForcing immediate shutdown"),
    })
    .context("Failed to install Ctrl+C handler")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        target, url = %target_url, "castwatch starting"
    );

    let http = HttpFetcher::new(&config.auth.user_agent, config.auth.cookies.clone());
    let probe = LivenessProbe::new(
        Streamlink::new(config.clone()),
        StatusApiProbe::new(http.clone()),
        config.capture.quality,
        Duration::from_millis(config.monitor.jitter_max_ms),
        ctx.cancel.clone(),
    );
    let resolver = MetadataResolver::new(http.clone());
    let spawner = Streamlink::new(config.clone());

    let session = SessionLoop::new(
        config,
        target,
        &target_url,
        probe,
        resolver,
        spawner,
        FfprobeDuration,
        Ffmpeg,
        http,
        ctx,
    );
    session.run()
}

/// Log to stderr and to a per-target file inside the save folder.
fn init_logging(log_file: &Path) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Failed to open log file: {:?}", log_file))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
        .init();

    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config = Config::load()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{}", toml_str);
    Ok(())
}

fn cmd_config_edit() -> Result<()> {
    let config_path = Config::config_path()?;

    // Ensure config exists
    if !config_path.exists() {
        let config = Config::default();
        config.save()?;
    }

    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    println!("Opening {} with {}", config_path.display(), editor);

    std::process::Command::new(&editor)
        .arg(&config_path)
        .status()
        .map_err(|e| anyhow::anyhow!("Failed to open editor: {}", e))?;

    Ok(())
}
