//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::DEFAULT_RELAY_URL;
use crate::core::coordinator::Settings;
use crate::core::signaling::DiscoveryMode;
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Peerdrop - P2P file drop over WebRTC.
#[derive(Parser, Deserialize, Clone, Debug, Default)]
#[command(author, version, about)]
#[command(propagate_version = true)]
#[serde(default)]
pub struct Args {
    /// WebSocket URL of the signaling relay.
    #[clap(long)]
    pub relay: Option<String>,

    /// Display name announced to peers.
    #[clap(long)]
    pub display_name: Option<String>,

    /// Discoverability: `network` (same network) or `direct` (pairing code only).
    #[clap(long, value_enum)]
    pub mode: Option<DiscoveryMode>,

    /// Pairing code of a device to link with once connected.
    #[clap(long)]
    pub pair: Option<String>,

    /// Where received files are written. Defaults to ~/Downloads.
    #[clap(long)]
    pub download_dir: Option<PathBuf>,

    /// Directory for persistent data (session, logs).
    /// Defaults to ~/.peerdrop/
    #[clap(long)]
    pub data_dir: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Accept every incoming share without asking.
    #[clap(long, conflicts_with = "auto_deny")]
    pub auto_accept: bool,

    /// Deny every incoming share without asking.
    #[clap(long)]
    pub auto_deny: bool,

    /// Send SDP offers/answers compressed.
    #[clap(long)]
    pub compress_sdp: bool,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Self {
        let mut cli_args = Args::parse();

        // Resolve relative paths to absolute before any working directory change
        cli_args.data_dir = cli_args.data_dir.map(Self::resolve_path);
        cli_args.download_dir = cli_args.download_dir.map(Self::resolve_path);

        let default_path = PathBuf::from("config.toml");
        if let Some(file_args) = Self::from_file(&default_path) {
            return Self::merge(file_args, cli_args);
        }

        cli_args
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Load args from a TOML file.
    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        Self::parse_toml(&content)
    }

    fn parse_toml(content: &str) -> Option<Self> {
        match toml::from_str::<Args>(content) {
            Ok(args) => Some(args),
            Err(e) => {
                warn!(event = "config_parse_failure", error = %e, "Ignoring invalid config.toml");
                None
            }
        }
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.relay.is_some() {
            file.relay = cli.relay;
        }
        if cli.display_name.is_some() {
            file.display_name = cli.display_name;
        }
        if cli.mode.is_some() {
            file.mode = cli.mode;
        }
        if cli.pair.is_some() {
            file.pair = cli.pair;
        }
        if cli.download_dir.is_some() {
            file.download_dir = cli.download_dir;
        }
        if cli.data_dir.is_some() {
            file.data_dir = cli.data_dir;
        }
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        if cli.auto_accept {
            file.auto_accept = true;
            file.auto_deny = false;
        }
        if cli.auto_deny {
            file.auto_deny = true;
            file.auto_accept = false;
        }
        if cli.compress_sdp {
            file.compress_sdp = true;
        }
        file
    }

    pub fn relay_url(&self) -> &str {
        self.relay.as_deref().unwrap_or(DEFAULT_RELAY_URL)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn settings(&self) -> Settings {
        Settings {
            name: self.display_name.clone(),
            mode: self.mode,
            pairing_code: self.pair.clone(),
            compress_sdp: self.compress_sdp,
        }
    }
}
