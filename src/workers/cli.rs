//! Line-oriented terminal front-end.
//!
//! Reads commands from stdin and prints notices, prompts and transfer
//! progress to stdout. Share prompts queue up; `yes` / `no` answers the
//! oldest one.

use crate::core::connection::PeerSummary;
use crate::core::coordinator::{Command, IdentityInfo};
use crate::core::notify::{Decision, GatewayEvent, ShareRequest};
use crate::core::signaling::DiscoveryMode;
use crate::core::transfer::{Direction, OutgoingFile, TransferEvent};
use crate::utils::atomic_write::atomic_write;
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, Result};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Recognised input lines.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Peers,
    Send { peer: String, paths: Vec<PathBuf> },
    Cancel(String),
    Link(String),
    Unlink(String),
    Close(String),
    /// `name` alone shows the current identity.
    Name(Option<String>),
    Mode(DiscoveryMode),
    Yes,
    No,
    Help,
    Quit,
}

pub const COMMAND_HELP: &[(&str, &str)] = &[
    ("peers", "List known peers"),
    ("send <peer> <path>...", "Offer files to a peer"),
    ("cancel <peer>", "Cancel the outgoing batch to a peer"),
    ("link <code>", "Link with the device showing this pairing code"),
    ("unlink <peer>", "Forget a linked peer"),
    ("close <peer>", "Close the connection to a peer"),
    ("name [new name]", "Show identity or change display name"),
    ("mode network|direct", "Change discoverability"),
    ("yes / no", "Answer the oldest share prompt"),
    ("quit", "Exit"),
];

/// Parse one input line. `None` for blank lines.
pub fn parse_input(line: &str) -> Option<Result<Input, String>> {
    let trimmed = line.trim();
    let (cmd, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (trimmed, ""),
    };
    if cmd.is_empty() {
        return None;
    }

    let arg = |usage: &str| -> Result<String, String> {
        if rest.is_empty() {
            Err(format!("Usage: {usage}"))
        } else {
            Ok(rest.to_string())
        }
    };

    let parsed = match cmd.to_ascii_lowercase().as_str() {
        "peers" | "ls" => Ok(Input::Peers),
        "send" => {
            let mut parts = rest.split_whitespace();
            match parts.next() {
                Some(peer) => {
                    let paths: Vec<PathBuf> = parts.map(PathBuf::from).collect();
                    if paths.is_empty() {
                        Err("Usage: send <peer> <path>...".to_string())
                    } else {
                        Ok(Input::Send {
                            peer: peer.to_string(),
                            paths,
                        })
                    }
                }
                None => Err("Usage: send <peer> <path>...".to_string()),
            }
        }
        "cancel" => arg("cancel <peer>").map(Input::Cancel),
        "link" => arg("link <code>").map(Input::Link),
        "unlink" => arg("unlink <peer>").map(Input::Unlink),
        "close" => arg("close <peer>").map(Input::Close),
        "name" => Ok(Input::Name((!rest.is_empty()).then(|| rest.to_string()))),
        "mode" => match rest.to_ascii_lowercase().as_str() {
            "network" => Ok(Input::Mode(DiscoveryMode::Network)),
            "direct" => Ok(Input::Mode(DiscoveryMode::Direct)),
            _ => Err("Usage: mode network|direct".to_string()),
        },
        "yes" | "y" => Ok(Input::Yes),
        "no" | "n" => Ok(Input::No),
        "help" | "?" => Ok(Input::Help),
        "quit" | "exit" | "q" => Ok(Input::Quit),
        _ => {
            warn!(event = "unknown_command", command = %cmd, "Unknown command");
            Err(format!("Unknown command: {cmd} (try `help`)"))
        }
    };
    Some(parsed)
}

/// Resolve what the user typed to a peer id: exact id, then display name
/// (case-insensitive), then a unique id prefix.
pub fn match_peer(peers: &[PeerSummary], token: &str) -> Option<String> {
    if let Some(p) = peers.iter().find(|p| p.peer_id == token) {
        return Some(p.peer_id.clone());
    }
    if let Some(p) = peers.iter().find(|p| p.name.eq_ignore_ascii_case(token)) {
        return Some(p.peer_id.clone());
    }
    let mut prefixed = peers.iter().filter(|p| p.peer_id.starts_with(token));
    match (prefixed.next(), prefixed.next()) {
        (Some(p), None) => Some(p.peer_id.clone()),
        _ => None,
    }
}

/// Sanitize a (possibly adversarial) file name for use inside the download
/// directory.
///
/// - Normalizes `\` to `/`.
/// - Strips `.` and `..` components.
/// - Keeps only alphanumeric chars plus `.`, `-`, `_`, and ` ` per component.
/// - Falls back to `"file"` when the result would otherwise be empty.
pub fn sanitize_relative_path(name: &str) -> PathBuf {
    let normalized = name.replace('\\', "/");
    let mut result = PathBuf::new();

    for part in normalized.split('/').filter(|s| !s.is_empty()) {
        if matches!(part, "." | "..") {
            continue;
        }
        let safe: String = part
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
            .collect();
        if !safe.is_empty() {
            result.push(safe);
        }
    }

    if result.as_os_str().is_empty() {
        PathBuf::from("file")
    } else {
        result
    }
}

/// First free `dir/name`, then `dir/name (1)`, `dir/name (2)`, ...
fn unique_path(dir: &Path, relative: &Path) -> PathBuf {
    let candidate = dir.join(relative);
    if !candidate.exists() {
        return candidate;
    }
    let stem = candidate
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let ext = candidate
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut n = 1u32;
    loop {
        let next = candidate.with_file_name(format!("{stem} ({n}){ext}"));
        if !next.exists() {
            return next;
        }
        n += 1;
    }
}

/// Write a received file into `dir` without ever escaping it.
pub fn save_received(dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf> {
    let path = unique_path(dir, &sanitize_relative_path(name));
    atomic_write(&path, data)?;
    Ok(path)
}

fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

// ── Front-end loop ───────────────────────────────────────────────────────────

pub struct Cli {
    commands: mpsc::UnboundedSender<Command>,
    download_dir: PathBuf,
    prompts: VecDeque<(ShareRequest, oneshot::Sender<Decision>)>,
    /// Last progress step printed per transfer.
    progress: HashMap<String, u8>,
}

impl Cli {
    pub fn new(commands: mpsc::UnboundedSender<Command>, download_dir: PathBuf) -> Self {
        Self {
            commands,
            download_dir,
            prompts: VecDeque::new(),
            progress: HashMap::new(),
        }
    }

    pub async fn run(
        mut self,
        mut gateway: Option<mpsc::UnboundedReceiver<GatewayEvent>>,
        mut transfers: mpsc::UnboundedReceiver<TransferEvent>,
        sos: SignalOfStop,
    ) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("Type `help` for commands.");

        loop {
            let gateway_event = async {
                match gateway.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = sos.wait() => break,

                line = lines.next_line() => match line? {
                    Some(line) => {
                        if !self.handle_line(&line).await {
                            break;
                        }
                    }
                    None => break,
                },

                Some(event) = gateway_event => self.on_gateway_event(event),

                Some(event) = transfers.recv() => self.on_transfer_event(event),
            }
        }

        for (request, reply) in self.prompts.drain(..) {
            info!(event = "prompt_abandoned", request_id = %request.request_id);
            let _ = reply.send(Decision::Deny);
        }
        Ok(())
    }

    /// Returns `false` when the user asked to quit.
    async fn handle_line(&mut self, line: &str) -> bool {
        let input = match parse_input(line) {
            None => return true,
            Some(Err(msg)) => {
                println!("{msg}");
                return true;
            }
            Some(Ok(input)) => input,
        };

        match input {
            Input::Quit => return false,
            Input::Help => {
                for (cmd, about) in COMMAND_HELP {
                    println!("  {cmd:<24} {about}");
                }
            }
            Input::Peers => match self.peers().await {
                Ok(peers) if peers.is_empty() => println!("No peers yet."),
                Ok(peers) => {
                    for p in peers {
                        println!(
                            "  {} {:<20} {:<10} {}{}",
                            if p.connected { "●" } else { "○" },
                            p.name,
                            p.device,
                            p.peer_id,
                            if p.manually_linked { " (linked)" } else { "" }
                        );
                    }
                }
                Err(e) => println!("{e}"),
            },
            Input::Send { peer, paths } => {
                if let Err(e) = self.send(&peer, &paths).await {
                    println!("{e}");
                }
            }
            Input::Cancel(peer) => {
                self.with_peer(&peer, |peer_id| Command::Cancel { peer_id })
                    .await
            }
            Input::Close(peer) => {
                self.with_peer(&peer, |peer_id| Command::Close { peer_id })
                    .await
            }
            // Linked peers may be offline, so the id is taken as typed.
            Input::Unlink(peer_id) => self.submit(Command::Unlink { peer_id }),
            Input::Link(code) => {
                println!("Looking for {code}...");
                self.submit(Command::Link { code });
            }
            Input::Name(Some(name)) => self.submit(Command::Rename { name }),
            Input::Name(None) => match self.identity().await {
                Ok(id) => println!(
                    "{} ({}), pairing code {}",
                    id.name,
                    id.mode,
                    id.connection_id.as_deref().unwrap_or("pending")
                ),
                Err(e) => println!("{e}"),
            },
            Input::Mode(mode) => self.submit(Command::SetMode(mode)),
            Input::Yes => self.answer(Decision::Accept),
            Input::No => self.answer(Decision::Deny),
        }
        true
    }

    fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!(event = "command_dropped", "Session is no longer running");
        }
    }

    async fn peers(&self) -> Result<Vec<PeerSummary>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Peers { reply })
            .map_err(|_| anyhow!("session is not running"))?;
        Ok(rx.await?)
    }

    async fn identity(&self) -> Result<IdentityInfo> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Identity { reply })
            .map_err(|_| anyhow!("session is not running"))?;
        Ok(rx.await?)
    }

    async fn resolve(&self, token: &str) -> Result<String> {
        let peers = self.peers().await?;
        match_peer(&peers, token).ok_or_else(|| anyhow!("No peer matches `{token}`"))
    }

    async fn with_peer(&self, token: &str, build: impl FnOnce(String) -> Command) {
        match self.resolve(token).await {
            Ok(peer_id) => self.submit(build(peer_id)),
            Err(e) => println!("{e}"),
        }
    }

    async fn send(&self, token: &str, paths: &[PathBuf]) -> Result<()> {
        let peer_id = self.resolve(token).await?;
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(OutgoingFile::from_path(path).await?);
        }
        let total: u64 = files.iter().map(|f| f.size).sum();
        println!(
            "Offering {} file(s), {} to {peer_id}",
            files.len(),
            human_size(total)
        );
        self.submit(Command::Send { peer_id, files });
        Ok(())
    }

    fn answer(&mut self, decision: Decision) {
        let Some((request, reply)) = self.prompts.pop_front() else {
            println!("No pending share request.");
            return;
        };
        if reply.send(decision).is_err() {
            println!("That request is no longer pending.");
        } else if decision.is_accept() {
            println!("Accepted {} file(s) from {}", request.files.len(), request.sender_name);
        } else {
            println!("Denied share from {}", request.sender_name);
        }
        self.show_next_prompt();
    }

    fn show_next_prompt(&self) {
        if let Some((request, _)) = self.prompts.front() {
            println!(
                "{} wants to send {} file(s), {}:",
                request.sender_name,
                request.files.len(),
                human_size(request.total_size())
            );
            for file in &request.files {
                println!("    {} ({})", file.name, human_size(file.size));
            }
            println!("Accept? [yes/no]");
        }
    }

    fn on_gateway_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::Notice(notice) => println!("{notice}"),
            GatewayEvent::Prompt { request, reply } => {
                self.prompts.push_back((request, reply));
                if self.prompts.len() == 1 {
                    self.show_next_prompt();
                }
            }
        }
    }

    fn on_transfer_event(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::Progress {
                peer_id,
                direction,
                file,
                percent,
                ..
            } => {
                let key = format!("{peer_id}:{direction:?}:{file}");
                let step = percent / 10;
                if self.progress.get(&key) == Some(&step) {
                    return;
                }
                self.progress.insert(key, step);
                let arrow = match direction {
                    Direction::Send => "→",
                    Direction::Receive => "←",
                };
                println!("  {arrow} {file} {percent}%");
            }
            TransferEvent::FileReceived { name, data, .. } => {
                match save_received(&self.download_dir, &name, &data) {
                    Ok(path) => {
                        info!(event = "file_saved", path = %path.display(), bytes = data.len());
                        println!("Saved {}", path.display());
                    }
                    Err(e) => {
                        warn!(event = "file_save_failure", file = %name, error = %e);
                        println!("Could not save {name}: {e}");
                    }
                }
            }
            TransferEvent::ReceiveComplete { peer_id } => {
                self.forget_progress(&peer_id);
                println!("All files from {peer_id} received.");
            }
            TransferEvent::SendComplete { peer_id, .. } | TransferEvent::Denied { peer_id } => {
                self.forget_progress(&peer_id);
            }
            TransferEvent::Cancelled { peer_id, direction } => {
                self.forget_progress(&peer_id);
                println!("Transfer with {peer_id} cancelled ({direction:?}).");
            }
            TransferEvent::Failed {
                peer_id,
                direction,
                reason,
            } => {
                self.forget_progress(&peer_id);
                println!("Transfer with {peer_id} failed ({direction:?}): {reason}");
            }
        }
    }

    fn forget_progress(&mut self, peer_id: &str) {
        let prefix = format!("{peer_id}:");
        self.progress.retain(|key, _| !key.starts_with(&prefix));
    }
}
