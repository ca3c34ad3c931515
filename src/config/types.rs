//! Configuration block types.

use serde::Deserialize;
use std::path::PathBuf;

/// Everything under `[cluster]`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Description template pushed to every child server; `#id` is replaced
    /// with the server's reference.
    #[serde(default)]
    pub server_description: String,
    /// Asset index URLs handed to web clients.
    #[serde(default)]
    pub assets: Vec<String>,
    /// Server templates.
    #[serde(default)]
    pub presets: Vec<PresetBlock>,
    /// Servers started eagerly at boot.
    #[serde(default)]
    pub servers: Vec<ServerBlock>,
    /// Ingress transports.
    #[serde(default)]
    pub ingress: IngressConfig,
    /// Matchmaking formats.
    #[serde(default)]
    pub matchmaking: MatchmakingConfig,
    /// Child-process spawning.
    #[serde(default)]
    pub spawn: SpawnConfig,
    /// Optional key-value sidecar; absence degrades to anonymous-only mode.
    pub database: Option<DatabaseConfig>,
}

/// A server template, possibly inheriting from another preset.
#[derive(Debug, Clone, Deserialize)]
pub struct PresetBlock {
    pub name: String,
    /// Virtual presets cannot be instantiated directly by users.
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
    /// Inline configuration text written to the child's config file.
    #[serde(default)]
    pub config: String,
    /// Name of the preset whose configuration this one extends.
    pub inherit: Option<String>,
    /// Used when a user creates a game without naming a preset.
    #[serde(default)]
    pub default: bool,
}

/// A server started eagerly at boot, reachable by alias.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerBlock {
    pub alias: String,
    pub preset: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngressConfig {
    /// Reliable-datagram (desktop) binds.
    #[serde(default)]
    pub desktop: Vec<DesktopIngressBlock>,
    /// WebSocket bind.
    pub web: Option<WebIngressBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DesktopIngressBlock {
    pub port: u16,
    /// Command run through the router when a peer connects, as if typed.
    pub command: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebIngressBlock {
    pub port: u16,
    /// URL path the WebSocket upgrade is served under.
    #[serde(default = "super::defaults::web_path")]
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchmakingConfig {
    #[serde(default)]
    pub duel: Vec<DuelFormatBlock>,
}

/// How players respawn when a duel phase resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForceRespawn {
    #[default]
    All,
    Dead,
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DuelFormatBlock {
    pub name: String,
    pub preset: String,
    #[serde(default)]
    pub force_respawn: ForceRespawn,
    #[serde(default)]
    pub pause_on_death: bool,
    /// Used when a player queues without naming a format.
    #[serde(default)]
    pub default: bool,
    /// Warmup length in seconds.
    #[serde(default = "super::defaults::warmup_seconds")]
    pub warmup_seconds: u64,
    /// Main and overtime phase length in seconds.
    #[serde(default = "super::defaults::phase_seconds")]
    pub phase_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpawnConfig {
    /// Path to the game server binary.
    pub server_binary: PathBuf,
    /// Working directory for child processes and generated config files.
    #[serde(default = "super::defaults::working_dir")]
    pub working_dir: PathBuf,
    /// Inclusive UDP port range scanned in steps of two, because the game
    /// claims port+1 for info queries.
    #[serde(default = "super::defaults::min_port")]
    pub min_port: u16,
    #[serde(default = "super::defaults::max_port")]
    pub max_port: u16,
    /// Directory control sockets are created in.
    #[serde(default = "super::defaults::socket_dir")]
    pub socket_dir: PathBuf,
    /// Filename prefix for control sockets.
    #[serde(default = "super::defaults::socket_prefix")]
    pub socket_prefix: String,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            server_binary: PathBuf::from("qserv"),
            working_dir: super::defaults::working_dir(),
            min_port: super::defaults::min_port(),
            max_port: super::defaults::max_port(),
            socket_dir: super::defaults::socket_dir(),
            socket_prefix: super::defaults::socket_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path.
    pub path: String,
}
