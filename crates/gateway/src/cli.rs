//! Command-line interface.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use tb_domain::config::RegistryDocument;
use tb_servers::registry::validate_server;

#[derive(Parser)]
#[command(name = "toolbroker", about = "Multi-tenant broker between AI clients and sandboxed tool servers", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the broker (default when no subcommand is given).
    Serve(ServeArgs),

    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Print the version and exit.
    Version,
}

#[derive(Args, Clone)]
pub struct ServeArgs {
    /// Path to the tool-servers document.
    #[arg(long, default_value = "tool-servers.json")]
    pub servers: PathBuf,

    /// Control-API listen address.
    #[arg(long, default_value = "127.0.0.1:8787")]
    pub listen: SocketAddr,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            servers: PathBuf::from("tool-servers.json"),
            listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
        }
    }
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the tool-servers document and print findings.
    Validate {
        #[arg(long, default_value = "tool-servers.json")]
        servers: PathBuf,
    },
}

/// Validate a tool-servers document, printing one line per finding.
/// Returns `false` when anything is invalid.
pub fn validate_document(path: &PathBuf) -> bool {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("error: cannot read {}: {err}", path.display());
            return false;
        }
    };
    let document: RegistryDocument = match serde_json::from_str(&text) {
        Ok(document) => document,
        Err(err) => {
            eprintln!("error: malformed document: {err}");
            return false;
        }
    };

    let mut valid = true;
    for (name, config) in &document.servers {
        match validate_server(name, config) {
            Ok(()) => println!("ok: {name} ({})", config.transport.kind()),
            Err(err) => {
                eprintln!("error: {err}");
                valid = false;
            }
        }
    }
    println!(
        "{} server(s), namespacing={:?}, autoConnect={}",
        document.servers.len(),
        document.settings.tool_namespacing,
        document.settings.auto_connect
    );
    valid
}
