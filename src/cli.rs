//! Command-line interface for voxturn
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Duplex voice-conversation audio pipeline
#[derive(Parser, Debug)]
#[command(
    name = "voxturn",
    version,
    about = "Endpointed voice capture and ordered reply playback"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: state changes, -vv: full diagnostics)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Arm the microphone and write every finished utterance as a WAV clip
    Listen {
        /// Audio input device (e.g., hw:0)
        #[arg(long, value_name = "DEVICE")]
        device: Option<String>,

        /// Read audio from a WAV file instead of the microphone
        #[arg(long, value_name = "PATH", conflicts_with = "device")]
        wav: Option<PathBuf>,

        /// Directory clips are written to
        #[arg(long, short = 'o', value_name = "DIR", default_value = ".")]
        output: PathBuf,

        /// Silence before an utterance ends. Examples: 1500, 800ms, 2s
        #[arg(long, short = 's', value_name = "DURATION", value_parser = parse_silence)]
        silence: Option<Duration>,

        /// Exit after the first clip
        #[arg(long)]
        once: bool,
    },

    /// Play WAV files as one reply stream, in the order given
    Play {
        /// Fragment files; the first is fragment 1
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,

        /// Submit fragments in reverse order to exercise reassembly
        #[arg(long)]
        reverse: bool,
    },

    /// List available audio input devices
    Devices,

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration (file + environment) as TOML
    Show,
    /// Print the configuration file path
    Path,
}

/// Parse a silence duration.
///
/// Bare numbers are milliseconds; anything else goes through `humantime`.
fn parse_silence(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let duration = match s.parse::<u64>() {
        Ok(ms) => Duration::from_millis(ms),
        Err(_) => humantime::parse_duration(s).map_err(|e| e.to_string())?,
    };
    if duration.is_zero() {
        return Err("silence must be greater than zero".to_string());
    }
    Ok(duration)
}
