use clap::{Parser, Subcommand};

/// A minimal, real entry point for the session engine's HTTP transport.
///
/// No interactive REPL and no credential login flow: both are explicitly
/// out of scope.
#[derive(Debug, Parser)]
#[command(name = "serialagent", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Serve {
        /// Path to a TOML config file.
        #[arg(long, default_value = "config.toml")]
        config: std::path::PathBuf,
        /// Port to bind, overriding the config file.
        #[arg(long)]
        port: Option<u16>,
    },
}
