//! Command-line interface for aura.
//!
//! Handles argument parsing and logging configuration.

use clap::{Parser, Subcommand};
use log::LevelFilter;
use std::path::PathBuf;

/// Aura - live voice chat and creative studio for Gemini
#[derive(Parser, Debug)]
#[command(name = "aura")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace (includes websocket and http internals)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Talk to the model through the microphone (default)
    Chat {
        /// Input device name (overrides settings)
        #[arg(long)]
        mic: Option<String>,
        /// Voice to answer with (overrides settings)
        #[arg(long)]
        voice: Option<String>,
        /// Hide the input level bars
        #[arg(long)]
        no_bars: bool,
    },
    /// List audio devices
    Devices,
    /// Manage the stored API key
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Generate an image from a prompt
    Image {
        prompt: String,
        #[arg(long, default_value = "1:1")]
        aspect: String,
        #[arg(long, default_value = "1K")]
        size: String,
        #[arg(short, long, default_value = "image.png")]
        out: PathBuf,
    },
    /// Edit an existing image with a prompt
    Edit {
        input: PathBuf,
        prompt: String,
        #[arg(short, long, default_value = "edited.png")]
        out: PathBuf,
    },
    /// Generate a short video, optionally starting from an image
    Video {
        prompt: String,
        #[arg(long)]
        image: Option<PathBuf>,
        #[arg(long, default_value = "16:9")]
        aspect: String,
        #[arg(short, long, default_value = "video.mp4")]
        out: PathBuf,
    },
    /// Describe the content of a video clip
    Analyze {
        input: PathBuf,
        #[arg(default_value = "Describe what happens in this video.")]
        prompt: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum KeyAction {
    /// Verify a key against the API, then store it
    Set { key: String },
    /// Remove the stored key
    Clear,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    /// Dependency internals only at trace level (-vvv)
    pub fn deps_verbose(&self) -> bool {
        self.verbose >= 3
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);
    builder.filter_module("aura_live", args.log_level());
    builder.filter_module("aura", args.log_level());

    if args.deps_verbose() {
        builder.filter_module("tungstenite", args.log_level());
        builder.filter_module("tokio_tungstenite", args.log_level());
        builder.filter_module("reqwest", args.log_level());
    }

    // RUST_LOG still wins when set.
    builder.parse_default_env();
    builder.format_timestamp_millis().init();
}
