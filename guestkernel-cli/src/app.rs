use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// guestkernel - inspect guest images and exercise the guest process lifecycle
#[derive(Debug, Parser)]
#[command(name = "guestkernel", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared across all subcommands.
#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Emit output as JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Decode a guest image and show where its segments would be mapped.
    Info {
        /// Path to the guest image.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Image format tag.
        #[arg(short, long, default_value = "nro")]
        format: String,
    },

    /// Show the guest address layout and thread resource sizes.
    Layout,

    /// Create a guest process on this host, report its main thread and kill it again.
    Probe {
        /// Stack size of the main thread (hex like 0x10000 or decimal).
        #[arg(long, value_name = "SIZE")]
        stack_size: Option<String>,
    },
}
