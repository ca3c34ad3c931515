//! The server registry and factory.
//!
//! Owns every child-process record: allocates ports and identities, writes
//! preset config files, launches and supervises children, enforces alias
//! uniqueness, prunes idle and dead entries, and fans child events into the
//! cluster through one notice channel.

use crate::config::SpawnConfig;
use crate::error::SpawnError;
use crate::server::instance::{GameServer, ServerStatus};
use crate::server::preset::PresetCatalog;
use dashmap::DashMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use skirmish_proto::GamePacket;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONNECT_POLL: Duration = Duration::from_millis(250);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTHY_POLL: Duration = Duration::from_millis(100);
const HEALTHY_TIMEOUT: Duration = Duration::from_secs(15);
const PRUNE_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Depth of the cluster-wide notice channel.
const NOTICE_DEPTH: usize = 64;

/// Child events the cluster reacts to, fanned in from every server.
#[derive(Debug)]
pub enum ServerNotice {
    /// The child kicked a client (ban, kick, overflow).
    ClientKicked {
        server: Arc<GameServer>,
        client: u16,
        reason: i32,
        text: String,
    },
    /// A packet addressed to one client.
    Unicast {
        server: Arc<GameServer>,
        client: u16,
        packet: GamePacket,
    },
    /// The child wants a map it does not have on disk.
    MapRequest {
        server: Arc<GameServer>,
        name: String,
        mode: i32,
    },
    /// The server became unusable (missed pongs or non-zero exit).
    Failed { server: Arc<GameServer> },
}

pub struct ServerManager {
    spawn: SpawnConfig,
    description: String,
    presets: PresetCatalog,
    servers: DashMap<String, Arc<GameServer>>,
    /// Serializes allocate-probe-insert so two spawns cannot race a port.
    alloc: Mutex<()>,
    notices: mpsc::Sender<ServerNotice>,
    scope: CancellationToken,
}

impl ServerManager {
    pub fn new(
        spawn: SpawnConfig,
        description: String,
        presets: PresetCatalog,
        scope: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<ServerNotice>) {
        let (notices, notices_rx) = mpsc::channel(NOTICE_DEPTH);
        (
            Arc::new(Self {
                spawn,
                description,
                presets,
                servers: DashMap::new(),
                alloc: Mutex::new(()),
                notices,
                scope,
            }),
            notices_rx,
        )
    }

    pub fn presets(&self) -> &PresetCatalog {
        &self.presets
    }

    /// Look a server up by id or alias.
    pub fn find(&self, reference: &str) -> Option<Arc<GameServer>> {
        self.servers
            .iter()
            .find(|entry| entry.value().is_reference(reference))
            .map(|entry| entry.value().clone())
    }

    pub fn get(&self, id: &str) -> Option<Arc<GameServer>> {
        self.servers.get(id).map(|entry| entry.value().clone())
    }

    pub fn servers(&self) -> Vec<Arc<GameServer>> {
        self.servers.iter().map(|e| e.value().clone()).collect()
    }

    /// Create a server record and its child process, in state `Starting`.
    pub async fn spawn_server(
        &self,
        preset: &str,
        alias: Option<String>,
        virtual_allowed: bool,
    ) -> Result<Arc<GameServer>, SpawnError> {
        let preset = self.presets.resolve(preset, virtual_allowed)?;

        let _guard = self.alloc.lock().await;

        if let Some(alias) = &alias {
            if self.find(alias).is_some() {
                return Err(SpawnError::AliasTaken(alias.clone()));
            }
        }

        let held: Vec<u16> = self.servers.iter().map(|e| e.value().port).collect();
        let port = find_port(self.spawn.min_port, self.spawn.max_port, &held)
            .ok_or(SpawnError::PortsExhausted)?;

        let taken: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        let (id, socket_path) = derive_identity(
            port,
            &self.spawn.socket_dir,
            &self.spawn.socket_prefix,
            &taken,
        )
        .ok_or(SpawnError::IdCollision)?;

        std::fs::create_dir_all(&self.spawn.working_dir)?;
        let config_path = self.spawn.working_dir.join(format!("{id}.cfg"));
        std::fs::write(&config_path, &preset.config)?;

        let child = Command::new(&self.spawn.server_binary)
            .arg(format!("-S{}", socket_path.display()))
            .arg(format!("-C{}", config_path.display()))
            .arg(format!("-j{port}"))
            .current_dir(&self.spawn.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let reference = alias.clone().unwrap_or_else(|| id.clone());
        let description = if self.description.is_empty() {
            String::new()
        } else {
            self.description.replace("#id", &reference)
        };

        let server = Arc::new(GameServer::new(
            id.clone(),
            alias,
            port,
            preset.name,
            socket_path,
            config_path,
            description,
            self.scope.child_token(),
        ));

        self.servers.insert(id, server.clone());
        tokio::spawn(server.clone().wait(child, self.notices.clone()));

        info!(server = %server.reference(), port, "server spawned");
        Ok(server)
    }

    /// Wait for the control socket, attach the run loops, and wait for the
    /// child's healthy event.
    pub async fn start_server(&self, server: &Arc<GameServer>) -> Result<(), SpawnError> {
        let socket = self.wait_connectable(server).await?;
        server.set_status(ServerStatus::Started);
        info!(server = %server.reference(), "connected");

        tokio::spawn(server.clone().run(socket, self.notices.clone()));

        if !server.description.is_empty() {
            server
                .send_command(&format!("serverdesc \"{}\"", server.description))
                .await;
        }

        self.wait_healthy(server).await
    }

    async fn wait_connectable(&self, server: &Arc<GameServer>) -> Result<UnixStream, SpawnError> {
        let mut tick = tokio::time::interval(CONNECT_POLL);
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        loop {
            if !server.is_running() {
                return Err(SpawnError::FailedEarly);
            }
            if let Ok(socket) = UnixStream::connect(&server.socket_path).await {
                return Ok(socket);
            }
            tokio::select! {
                _ = tick.tick() => {}
                _ = tokio::time::sleep_until(deadline) => return Err(SpawnError::StartTimeout),
                _ = server.scope().cancelled() => return Err(SpawnError::FailedEarly),
            }
        }
    }

    async fn wait_healthy(&self, server: &Arc<GameServer>) -> Result<(), SpawnError> {
        let mut tick = tokio::time::interval(HEALTHY_POLL);
        let deadline = tokio::time::Instant::now() + HEALTHY_TIMEOUT;
        loop {
            match server.status() {
                ServerStatus::Healthy => return Ok(()),
                ServerStatus::Failed | ServerStatus::Exited => {
                    return Err(SpawnError::FailedEarly)
                }
                _ => {}
            }
            tokio::select! {
                _ = tick.tick() => {}
                _ = tokio::time::sleep_until(deadline) => return Err(SpawnError::StartTimeout),
                _ = server.scope().cancelled() => return Err(SpawnError::FailedEarly),
            }
        }
    }

    /// Spawn and start in one step; a failed start tears the record down.
    pub async fn launch(
        &self,
        preset: &str,
        alias: Option<String>,
        virtual_allowed: bool,
    ) -> Result<Arc<GameServer>, SpawnError> {
        let server = self.spawn_server(preset, alias, virtual_allowed).await?;
        match self.start_server(&server).await {
            Ok(()) => Ok(server),
            Err(e) => {
                warn!(server = %server.reference(), error = %e, "server failed to start");
                self.remove(&server.id);
                Err(e)
            }
        }
    }

    /// Shut a server down and drop it from the registry.
    pub fn remove(&self, id: &str) {
        if let Some((_, server)) = self.servers.remove(id) {
            info!(server = %server.reference(), "removing server");
            server.shutdown();
        }
    }

    /// Drop idle unaliased servers and anything no longer running.
    pub async fn prune(self: Arc<Self>) {
        let mut tick = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            tokio::select! {
                _ = self.scope.cancelled() => return,
                _ = tick.tick() => {}
            }

            let doomed: Vec<String> = self
                .servers
                .iter()
                .filter(|entry| {
                    let server = entry.value();
                    if !server.is_running() {
                        return true;
                    }
                    server.alias.is_none()
                        && server.num_clients() == 0
                        && server.idle_since().elapsed() > IDLE_TIMEOUT
                })
                .map(|entry| entry.key().clone())
                .collect();

            for id in doomed {
                debug!(server = %id, "pruning server");
                self.remove(&id);
            }
        }
    }

    pub fn shutdown(&self) {
        for entry in self.servers.iter() {
            entry.value().shutdown();
        }
        self.servers.clear();
    }
}

fn port_available(port: u16) -> bool {
    std::net::UdpSocket::bind(("127.0.0.1", port)).is_ok()
}

/// Scan the range two ports at a time; the game owns port and port+1.
fn find_port(min_port: u16, max_port: u16, held: &[u16]) -> Option<u16> {
    let mut port = min_port;
    while port < max_port {
        if !held.contains(&port) && port_available(port) {
            return Some(port);
        }
        port += 2;
    }
    None
}

/// Derive a short id and socket path, rejecting collisions with live
/// records and leftover socket files.
fn derive_identity(
    port: u16,
    socket_dir: &Path,
    prefix: &str,
    taken: &[String],
) -> Option<(String, PathBuf)> {
    for _ in 0..64 {
        let nonce: u16 = rand::thread_rng().gen_range(0..1024);
        let digest = Sha256::digest(format!("{port}-{nonce}").as_bytes());
        let id: String = digest
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>()[..8]
            .to_string();
        let path = socket_dir.join(format!("{prefix}_{id}.sock"));
        if taken.contains(&id) || path.exists() {
            continue;
        }
        return Some((id, path));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_short_hex_under_the_prefix() {
        let dir = std::env::temp_dir();
        let (id, path) = derive_identity(50000, &dir, "testsrv", &[]).unwrap();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("testsrv_"));
    }

    #[test]
    fn identity_avoids_taken_ids() {
        let dir = std::env::temp_dir();
        // Exhaust retries against a wildcard set by taking every candidate.
        let (first, _) = derive_identity(50002, &dir, "testsrv", &[]).unwrap();
        let (second, _) = derive_identity(50002, &dir, "testsrv", &[first.clone()]).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn find_port_skips_held_ports() {
        let held = vec![50010];
        let port = find_port(50010, 50020, &held).unwrap();
        assert_ne!(port, 50010);
        assert_eq!(port % 2, 0);
    }

    #[test]
    fn find_port_skips_bound_ports() {
        let keeper = std::net::UdpSocket::bind(("127.0.0.1", 50030)).unwrap();
        let port = find_port(50030, 50040, &[]).unwrap();
        assert_ne!(port, 50030);
        drop(keeper);
    }

    #[test]
    fn exhausted_range_returns_nothing() {
        assert_eq!(find_port(50050, 50050, &[]), None);
    }
}
