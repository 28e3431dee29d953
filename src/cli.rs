//! CLI definitions for castwatch
//!
//! The clap structures live here, separated from main.rs, so completions
//! and help generation can reach them without dragging in the runtime.

use clap::builder::styling::{AnsiColor, Effects, Styles};
use clap::{Parser, Subcommand};
use clap_complete::Shell as CompletionShell;

use crate::config::Quality;

/// Build clap styles using our theme colors.
///
/// - Green: headers, usage, command names (accent color)
/// - White: descriptions, placeholders (renders as light gray on dark terminals)
pub fn build_cli_styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Green.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::White.on_default())
        .valid(AnsiColor::White.on_default())
        .invalid(AnsiColor::Red.on_default())
        .error(AnsiColor::Red.on_default() | Effects::BOLD)
}

#[derive(Parser)]
#[command(name = "castwatch")]
#[command(about = "[ castwatch ] - monitor a live-stream channel and record every broadcast")]
#[command(
    long_about = "castwatch - long-running live-stream monitor and recorder.

Watches a single channel, waits for it to go live, records the broadcast
with streamlink, then remuxes the recording with ffmpeg and embeds the
stream title, date and thumbnail. Recordings land in
~/castwatch_recordings/<target>/ and the monitor goes back to polling
when the stream ends.

QUICK START:
    castwatch run somecaster             Monitor and record a channel
    castwatch run somecaster --quality high
    castwatch config show                Inspect the configuration

CREDENTIALS:
    CASTWATCH_STREAM_PASSWORD            Password for private streams
    CASTWATCH_COOKIES                    Cookie pairs (k=v; k2=v2)

Credentials are only ever read from the environment, never from the
config file."
)]
#[command(version)]
#[command(styles = build_cli_styles())]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Monitor a target and record every live session
    #[command(long_about = "Monitor a channel and record each broadcast as it happens.

Runs until interrupted. While the target is offline the monitor polls
its watch page; when it goes live, the broadcast is captured, validated
and remuxed into a .mkv with embedded metadata. Press Ctrl+C once for a
graceful stop (in-flight recordings are finished or preserved), twice to
force immediate shutdown.

EXAMPLES:
    castwatch run somecaster
    castwatch run somecaster --quality medium
    castwatch run somecaster --url https://twitcasting.tv/c:somecaster
    castwatch run somecaster --fast-exit")]
    Run {
        /// Channel name to monitor
        #[arg(help = "Channel name (also used for the save folder)")]
        target: String,

        /// Watch-page URL when it differs from the default
        #[arg(long, help = "Watch-page URL (default: https://twitcasting.tv/<target>)")]
        url: Option<String>,

        /// Preferred stream quality
        #[arg(long, value_enum, help = "Stream quality (overrides config)")]
        quality: Option<Quality>,

        /// Recordings directory
        #[arg(long, help = "Save folder (overrides config)")]
        output_dir: Option<String>,

        /// Skip graceful shutdown on Ctrl+C
        #[arg(long, help = "Exit immediately on Ctrl+C, discarding partial files")]
        fast_exit: bool,
    },

    /// Configuration management
    #[command(
        subcommand,
        long_about = "View and edit the castwatch configuration file.

Configuration is stored in ~/.config/castwatch/config.toml and covers
polling intervals, capture retries, validation thresholds and storage.

EXAMPLES:
    castwatch config show    Display current configuration
    castwatch config edit    Open config in $EDITOR"
    )]
    Config(ConfigCommands),

    /// Generate shell completions (internal use)
    #[command(hide = true)]
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration as TOML
    #[command(long_about = "Display the current configuration in TOML format.

Credentials pulled from the environment are never shown.

EXAMPLE:
    castwatch config show")]
    Show,
    /// Open configuration file in your default editor
    #[command(long_about = "Open the configuration file in your default editor.

Uses the $EDITOR environment variable (defaults to 'vi').
Config file location: ~/.config/castwatch/config.toml

EXAMPLE:
    castwatch config edit
    EDITOR=nano castwatch config edit")]
    Edit,
}
