//! CLI argument parsing with clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use maplepilot_core::input::{CoordinateMode, KeyKind};
use maplepilot_core::settings::{BackendKind, Settings};

/// Minimap-driven game automation agent.
///
/// Follows the player on the minimap, walks and jumps to goals, fires
/// recurring key presses without letting them collide, and recovers when
/// the character gets stuck. Input goes to this machine or to a remote
/// executor speaking a JSON-lines protocol.
#[derive(Debug, Parser)]
#[command(name = "maplepilot", version)]
pub struct Cli {
    /// Settings file [default: $MAPLEPILOT_CONFIG or <config dir>/maplepilot/settings.toml]
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the bot, reading perception samples and commands from stdin
    #[command(after_help = "\
Stdin takes one JSON object per line:
  {\"type\":\"detection\",\"quality\":\"clean\",\"bounds\":{\"width\":200,\"height\":100},\"position\":{\"x\":50,\"y\":60}}
  {\"type\":\"goal\",\"x\":120,\"y\":40,\"key\":\"f1\"}
  {\"type\":\"redetect\"}
  {\"type\":\"reconnect\"}
  {\"type\":\"shutdown\"}

Status changes are printed to stdout as JSON lines.

Examples:
  detector | maplepilot agent                         # Local input
  detector | maplepilot agent --backend remote --address 192.168.1.20:5901")]
    Agent(AgentArgs),

    /// Serve the remote input protocol on this machine
    #[command(after_help = "\
Examples:
  maplepilot executor                               # Listen on 127.0.0.1:5901
  maplepilot executor --listen 0.0.0.0:5901         # Accept agents from the network
  maplepilot executor --coordinate-mode relative    # Convert window-relative mouse input here")]
    Executor(ExecutorArgs),

    /// Press a key once through the configured backend
    #[command(after_help = "\
Examples:
  maplepilot send-key space                         # Seeded hold time
  maplepilot send-key f5 --hold 120 --count 3       # Three 120ms presses
  maplepilot send-key esc --backend remote --address 10.0.0.4:5901")]
    SendKey(SendKeyArgs),

    /// Ask the backend whether a key is currently held
    KeyState(KeyStateArgs),

    /// Print the persisted session seed, creating it on first use
    Seed,

    /// Print the effective settings as TOML
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendChoice {
    /// Inject input on this machine
    Local,
    /// Forward input to a remote executor
    Remote,
}

impl From<BackendChoice> for BackendKind {
    fn from(choice: BackendChoice) -> Self {
        match choice {
            BackendChoice::Local => BackendKind::Local,
            BackendChoice::Remote => BackendKind::Remote,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CoordinateChoice {
    /// Offsets within the game window
    Relative,
    /// Absolute monitor coordinates
    Screen,
}

impl From<CoordinateChoice> for CoordinateMode {
    fn from(choice: CoordinateChoice) -> Self {
        match choice {
            CoordinateChoice::Relative => CoordinateMode::Relative,
            CoordinateChoice::Screen => CoordinateMode::Screen,
        }
    }
}

/// Backend overrides shared by every command that sends input.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct BackendArgs {
    /// Input backend [default: from settings]
    #[arg(long, value_enum)]
    pub backend: Option<BackendChoice>,

    /// Remote executor address (host:port) [default: from settings]
    #[arg(long, value_name = "ADDR")]
    pub address: Option<String>,
}

impl BackendArgs {
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(backend) = self.backend {
            settings.backend.kind = backend.into();
        }
        if let Some(address) = &self.address {
            settings.backend.address = address.clone();
            // An address only makes sense for the remote backend.
            if self.backend.is_none() {
                settings.backend.kind = BackendKind::Remote;
            }
        }
    }
}

#[derive(Debug, clap::Args)]
pub struct AgentArgs {
    #[command(flatten)]
    pub backend: BackendArgs,
}

#[derive(Debug, clap::Args)]
pub struct ExecutorArgs {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:5901", value_name = "ADDR")]
    pub listen: String,

    /// Mouse coordinate mode announced to agents [default: from settings]
    #[arg(long, value_enum)]
    pub coordinate_mode: Option<CoordinateChoice>,
}

#[derive(Debug, clap::Args)]
pub struct SendKeyArgs {
    /// Key name (e.g., space, f5, esc, page_up, a)
    pub key: KeyKind,

    /// Hold time in milliseconds, 0 for a seeded hold time (max 10000)
    #[arg(long, default_value_t = 0, value_name = "MS")]
    pub hold: u64,

    /// Number of presses
    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: u32,

    #[command(flatten)]
    pub backend: BackendArgs,
}

#[derive(Debug, clap::Args)]
pub struct KeyStateArgs {
    /// Key name
    pub key: KeyKind,

    #[command(flatten)]
    pub backend: BackendArgs,
}
