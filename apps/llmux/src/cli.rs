use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "llmux", about = "Multi-provider LLM request router")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Validate the configuration and serve the router.
    Run {
        /// Directory containing assembly.json and scheduler.json.
        #[arg(long, default_value = "config")]
        config: PathBuf,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8099)]
        port: u16,
    },
    /// Validate the configuration and print the report.
    Validate {
        #[arg(long, default_value = "config")]
        config: PathBuf,
    },
    /// Enroll a provider's OAuth credentials via the device flow.
    Login {
        /// Instance id the credentials are stored under.
        provider: String,
        /// Dialect deciding which OAuth endpoints to use (qwen, iflow).
        #[arg(long)]
        dialect: String,
    },
}
