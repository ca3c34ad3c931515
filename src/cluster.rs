//! The cluster hub.
//!
//! Owns the shared managers, reacts to child-server events, accepts new
//! connections from every ingress, fans out cross-server chat and presence
//! notices, and implements the built-in command verbs. One instance serves
//! the whole process.

use crate::commands::{self, CommandRegistry, COMMAND_TIMEOUT};
use crate::config::ClusterConfig;
use crate::error::CommandError;
use crate::ingress::{NewConnection, ServerSnapshot, WebControl};
use crate::mapsend::MapSender;
use crate::matchmaker::Matchmaker;
use crate::server::{ServerManager, ServerNotice, ServerStatus};
use crate::session::{task, Session, SessionBundle, SessionManager};
use crate::spaces::SpaceManager;
use crate::verse::{Verse, VerseHandle};
use dashmap::DashMap;
use skirmish_proto::colors;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-host floor between `#creategame` invocations.
const CREATE_SERVER_COOLDOWN: Duration = Duration::from_secs(10);
/// Cadence of the private-match invite reminder.
const MATCH_HELP_INTERVAL: Duration = Duration::from_secs(30);

/// Auth domain injected into server info toward ungreeted clients.
const AUTH_DOMAIN: &str = "skirmish.services";

struct Inbox {
    new_connections: mpsc::Receiver<NewConnection>,
    new_sessions: mpsc::Receiver<SessionBundle>,
    notices: mpsc::Receiver<ServerNotice>,
}

pub struct Cluster {
    pub servers: Arc<ServerManager>,
    pub sessions: Arc<SessionManager>,
    pub matchmaker: Arc<Matchmaker>,
    pub mapsend: Arc<MapSender>,
    pub spaces: SpaceManager,
    pub verse: Arc<VerseHandle>,
    commands: CommandRegistry,
    pub auth_domain: String,

    config: ClusterConfig,
    new_connections: mpsc::Sender<NewConnection>,
    inbox: StdMutex<Option<Inbox>>,

    /// host -> when that host last created a server.
    last_create: DashMap<String, Instant>,
    /// host -> the one server created by that host.
    host_servers: DashMap<String, String>,
    /// Migration fallback when a server dies.
    default_lobby: StdMutex<Option<String>>,

    scope: CancellationToken,
}

impl Cluster {
    pub async fn new(config: ClusterConfig, scope: CancellationToken) -> Arc<Self> {
        let presets = crate::server::PresetCatalog::new(&config.presets);
        let (servers, notices) = ServerManager::new(
            config.spawn.clone(),
            config.server_description.clone(),
            presets,
            scope.clone(),
        );
        let (sessions, new_sessions) = SessionManager::new();
        let matchmaker = Matchmaker::new(
            config.matchmaking.duel.clone(),
            servers.clone(),
            sessions.clone(),
            scope.clone(),
        );
        let mapsend = MapSender::new(sessions.clone());
        let spaces = SpaceManager::new(servers.clone());

        let verse = match &config.database {
            Some(database) => match Verse::connect(&database.path).await {
                Ok(verse) => {
                    info!(path = %database.path, "sidecar connected");
                    Some(verse)
                }
                Err(e) => {
                    warn!(error = %e, "sidecar unavailable, running anonymous-only");
                    None
                }
            },
            None => None,
        };

        let mut registry = CommandRegistry::new();
        commands::register_cluster_commands(&mut registry);

        let (new_connections, new_connections_rx) = mpsc::channel(16);

        Arc::new(Self {
            servers,
            sessions,
            matchmaker,
            mapsend,
            spaces,
            verse: Arc::new(VerseHandle::new(verse)),
            commands: registry,
            auth_domain: AUTH_DOMAIN.to_string(),
            config,
            new_connections,
            inbox: StdMutex::new(Some(Inbox {
                new_connections: new_connections_rx,
                new_sessions,
                notices,
            })),
            last_create: DashMap::new(),
            host_servers: DashMap::new(),
            default_lobby: StdMutex::new(None),
            scope,
        })
    }

    /// Where ingresses publish accepted connections.
    pub fn connection_sink(&self) -> mpsc::Sender<NewConnection> {
        self.new_connections.clone()
    }

    /// Joinable-server snapshot for the web control stream.
    pub fn snapshot(&self) -> Vec<ServerSnapshot> {
        self.servers
            .servers()
            .into_iter()
            .filter(|server| server.status() == ServerStatus::Healthy)
            .map(|server| ServerSnapshot {
                reference: server.reference().to_string(),
                preset: server.preset.clone(),
                clients: server.num_clients(),
            })
            .collect()
    }

    pub fn asset_urls(&self) -> Vec<String> {
        self.config.assets.clone()
    }

    /// Boot eager servers and start every cluster loop.
    pub async fn run(self: Arc<Self>) {
        for block in &self.config.servers {
            match self
                .servers
                .launch(&block.preset, Some(block.alias.clone()), true)
                .await
            {
                Ok(server) => {
                    let mut lobby = self.default_lobby.lock().unwrap();
                    if lobby.is_none() {
                        *lobby = Some(server.id.clone());
                    }
                }
                Err(e) => {
                    error!(alias = %block.alias, error = %e, "failed to start configured server");
                }
            }
        }

        tokio::spawn(self.servers.clone().prune());
        tokio::spawn(self.matchmaker.clone().poll());

        let Some(inbox) = self.inbox.lock().unwrap().take() else {
            return;
        };
        let Inbox {
            mut new_connections,
            mut new_sessions,
            mut notices,
        } = inbox;

        {
            let cluster = self.clone();
            tokio::spawn(async move {
                loop {
                    let accepted = tokio::select! {
                        _ = cluster.scope.cancelled() => return,
                        accepted = new_connections.recv() => match accepted {
                            Some(accepted) => accepted,
                            None => return,
                        },
                    };
                    cluster.sessions.accept(accepted).await;
                }
            });
        }

        {
            let cluster = self.clone();
            tokio::spawn(async move {
                loop {
                    let bundle = tokio::select! {
                        _ = cluster.scope.cancelled() => return,
                        bundle = new_sessions.recv() => match bundle {
                            Some(bundle) => bundle,
                            None => return,
                        },
                    };
                    tokio::spawn(task::run_session(cluster.clone(), bundle));
                }
            });
        }

        {
            let cluster = self.clone();
            tokio::spawn(async move {
                loop {
                    let notice = tokio::select! {
                        _ = cluster.scope.cancelled() => return,
                        notice = notices.recv() => match notice {
                            Some(notice) => notice,
                            None => return,
                        },
                    };
                    cluster.handle_notice(notice).await;
                }
            });
        }
    }

    async fn handle_notice(&self, notice: ServerNotice) {
        match notice {
            ServerNotice::Unicast {
                server,
                client,
                packet,
            } => {
                let Some(session) = self.sessions.find(client) else {
                    return;
                };
                let attached = session.server().map(|s| s.id.clone());
                if attached.as_deref() == Some(server.id.as_str()) {
                    session.queue_server_packet(packet).await;
                }
            }
            ServerNotice::ClientKicked {
                server,
                client,
                reason,
                text,
            } => {
                let Some(session) = self.sessions.find(client) else {
                    return;
                };
                debug!(session = client, server = %server.reference(), reason, "client kicked by server");
                if !text.is_empty() {
                    session.message(&colors::red(&text)).await;
                }
                self.sessions.detach(&session).await;
            }
            ServerNotice::MapRequest { server, name, mode } => {
                self.handle_map_request(server, name, mode).await;
            }
            ServerNotice::Failed { server } => {
                self.handle_server_failure(server).await;
            }
        }
    }

    /// A child asked for a map it does not have: satisfy it from the
    /// sidecar by dropping the payload into the spawn working directory.
    async fn handle_map_request(
        &self,
        server: Arc<crate::server::GameServer>,
        name: String,
        mode: i32,
    ) {
        let ok = match self.verse.map_data(&name).await {
            Some(data) => {
                let path = self.config.spawn.working_dir.join(format!("{name}.ogz"));
                match tokio::fs::write(&path, &data).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(map = %name, error = %e, "failed to stage requested map");
                        false
                    }
                }
            }
            None => false,
        };
        server.send_map_response(&name, mode, ok as i32).await;
    }

    async fn handle_server_failure(&self, server: Arc<crate::server::GameServer>) {
        warn!(server = %server.reference(), "server failed, relocating its sessions");
        self.spaces.forget_server(&server.id);

        let lobby = self
            .default_lobby
            .lock()
            .unwrap()
            .clone()
            .and_then(|id| self.servers.get(&id))
            .filter(|lobby| lobby.status() == ServerStatus::Healthy);

        for session in self.sessions.on_server(&server.id) {
            session
                .message(&colors::red("your server went down"))
                .await;
            match &lobby {
                Some(lobby) => {
                    if self.sessions.connect(&session, lobby).await.is_err() {
                        session
                            .connection
                            .disconnect(0, "server failed".to_string());
                    }
                }
                None => {
                    self.sessions.detach(&session).await;
                    session
                        .connection
                        .disconnect(0, "server failed".to_string());
                }
            }
        }

        self.servers.remove(&server.id);
    }

    // ========================================================================
    // Command dispatch
    // ========================================================================

    /// Run one command line (sans sentinel) for a session, with the
    /// ten-second bound and user-visible error reporting.
    pub async fn run_command(self: Arc<Self>, session: &Arc<Session>, input: &str) {
        let result = tokio::select! {
            _ = session.scope().cancelled() => return,
            result = tokio::time::timeout(
                COMMAND_TIMEOUT,
                self.commands.dispatch(self.clone(), session.clone(), input),
            ) => result.unwrap_or(Err(CommandError::Timeout)),
        };

        if let Err(e) = result {
            debug!(session = session.id, command = input, error = %e, "command failed");
            session.raw_message(&e.user_message()).await;
        }
    }

    /// `#creategame [mode] [map]`
    pub async fn create_game(
        self: Arc<Self>,
        session: &Arc<Session>,
        args: &[String],
    ) -> Result<(), CommandError> {
        let mut mode: Option<i32> = None;
        let mut map: Option<String> = None;
        let mut preset: Option<String> = None;
        for arg in args.iter().filter(|a| !a.is_empty()) {
            if let Some(number) = commands::mode_number(arg) {
                mode = Some(number);
            } else if self.servers.presets().find(arg).is_some() {
                preset = Some(arg.clone());
            } else {
                map = Some(arg.clone());
            }
        }

        let host = session.connection.host();
        if let Some(last) = self.last_create.get(&host) {
            if last.elapsed() < CREATE_SERVER_COOLDOWN {
                return Err(CommandError::CreateCooldown);
            }
        }

        // One created server per host; a new one replaces it.
        if let Some((_, existing)) = self.host_servers.remove(&host) {
            self.servers.remove(&existing);
        }

        info!(session = session.id, "starting server");
        let server = self
            .servers
            .launch(preset.as_deref().unwrap_or(""), None, false)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to create server");
                CommandError::Failed(format!("failed to create server: {e}"))
            })?;

        match (mode, &map) {
            (Some(mode), Some(map)) => {
                server.send_command(&format!("changemap {map} {mode}")).await;
            }
            (Some(mode), None) => {
                server.send_command(&format!("setmode {mode}")).await;
            }
            (None, Some(map)) => {
                server.send_command(&format!("setmap {map}")).await;
            }
            (None, None) => {}
        }

        self.last_create.insert(host.clone(), Instant::now());
        self.host_servers.insert(host, server.id.clone());

        self.sessions
            .connect(session, &server)
            .await
            .map_err(|e| CommandError::Failed(e.to_string()))?;

        if let Some(client_num) = session.client_num() {
            server.send_command(&format!("givemaster {client_num}")).await;
        }

        tokio::spawn(self.clone().private_match_help(session.clone(), server));
        Ok(())
    }

    /// Remind the creator how others can join, until someone does.
    async fn private_match_help(
        self: Arc<Self>,
        session: Arc<Session>,
        server: Arc<crate::server::GameServer>,
    ) {
        use crate::ingress::ConnectionKind;

        let mut message = format!(
            "this is your private server. have other players join by saying '#join {}' in any server.",
            server.id
        );
        if session.connection.kind() == ConnectionKind::Web {
            message.push_str(" (or send them the link in your url bar!)");
        }

        let scope = match session.server_scope() {
            Some(scope) => scope,
            None => return,
        };
        let mut tick = tokio::time::interval(MATCH_HELP_INTERVAL);
        loop {
            if server.num_clients() >= 2 {
                return;
            }
            session.message(&message).await;
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = tick.tick() => {}
            }
        }
    }

    /// `#join <reference>` / `#go <reference>`
    pub async fn go_to(
        self: Arc<Self>,
        session: &Arc<Session>,
        target: &str,
    ) -> Result<(), CommandError> {
        if target == "home" {
            return self.go_home(session).await;
        }

        if let Some(current) = session.server() {
            if current.is_reference(target) {
                return Err(CommandError::AlreadyThere);
            }
        }

        if let Some(server) = self.servers.find(target) {
            self.sessions
                .connect(session, &server)
                .await
                .map_err(|e| CommandError::Failed(e.to_string()))?;
            self.notify_presence(session, true).await;
            return Ok(());
        }

        // Not a server; look for a stored space.
        match self.spaces.start_space(&self.verse, target).await {
            Ok(Some(instance)) => {
                self.sessions
                    .connect(session, &instance.server)
                    .await
                    .map_err(|e| CommandError::Failed(e.to_string()))?;
                self.notify_presence(session, true).await;
                Ok(())
            }
            Ok(None) => Err(CommandError::NoSuchReference(target.to_string())),
            Err(e) => {
                error!(space = target, error = %e, "failed to start space");
                Err(CommandError::Failed("could not start that space".into()))
            }
        }
    }

    /// `#home`
    pub async fn go_home(self: Arc<Self>, session: &Arc<Session>) -> Result<(), CommandError> {
        let auth = session.auth().ok_or(CommandError::NotLoggedIn)?;
        let user = self
            .verse
            .get_or_create_user(&auth.id, &auth.name)
            .await
            .ok_or_else(|| CommandError::Failed("could not go home".into()))?;
        let home = self
            .verse
            .get_or_create_home(&user)
            .await
            .ok_or_else(|| CommandError::Failed("could not go home".into()))?;

        let instance = self
            .spaces
            .start_space(&self.verse, &home.id)
            .await
            .map_err(|_| CommandError::Failed("could not go home".into()))?
            .ok_or_else(|| CommandError::Failed("could not go home".into()))?;

        self.sessions
            .connect(session, &instance.server)
            .await
            .map_err(|e| CommandError::Failed(e.to_string()))?;

        session
            .message(&format!("welcome to your home (space {}).", home.id))
            .await;
        if home.open_edit {
            session.message("editing by others is enabled.").await;
        } else {
            session
                .message("editing by others is disabled.")
                .await;
        }
        Ok(())
    }

    /// `#edit`: toggle open editing on the space the owner stands in.
    pub async fn toggle_edit(self: Arc<Self>, session: &Arc<Session>) -> Result<(), CommandError> {
        let auth = session.auth().ok_or(CommandError::NotLoggedIn)?;
        let server = session
            .server()
            .ok_or_else(|| CommandError::Failed("you are not in a space".into()))?;
        let instance = self
            .spaces
            .find_instance(&server.id)
            .ok_or_else(|| CommandError::Failed("you are not in a space".into()))?;

        if instance.space.owner != auth.id {
            return Err(CommandError::Failed("this is not your space".into()));
        }

        let mut space = instance.space.clone();
        space.open_edit = !space.open_edit;
        if !self.verse.save_space(&space).await {
            return Err(CommandError::Failed("could not update your space".into()));
        }
        self.spaces.update_record(space.clone());

        let notice = if space.open_edit {
            "editing is now enabled"
        } else {
            "editing is now disabled"
        };
        self.announce_in_server(&server.id, notice).await;
        Ok(())
    }

    // ========================================================================
    // Chat, presence, greeting
    // ========================================================================

    /// Fan a non-command chat line out to the whole cluster ourselves;
    /// the game server never sees it.
    pub async fn forward_global_chat(&self, sender: &Arc<Session>, text: &str) {
        use crate::ingress::ConnectionKind;

        let name = sender.name();
        let sender_server = sender.server().map(|s| s.id.clone());
        let same_message = format!("{}: {}", name, colors::green(text));
        let other_message = match sender.server() {
            Some(server) => format!("{} [{}]: {}", name, server.reference(), colors::green(text)),
            None => same_message.clone(),
        };

        for other in self.sessions.all() {
            if other.id == sender.id {
                continue;
            }
            if other.connection.kind() == ConnectionKind::Web {
                other
                    .connection
                    .send_control(WebControl::Chat {
                        message: same_message.clone(),
                    })
                    .await;
                continue;
            }
            let other_server = other.server().map(|s| s.id.clone());
            if other_server == sender_server {
                other.raw_message(&same_message).await;
            } else {
                other.raw_message(&other_message).await;
            }
        }
    }

    /// Tell users on other servers someone joined or left.
    pub async fn notify_presence(&self, session: &Arc<Session>, joined: bool) {
        let event = if joined { "join" } else { "leave" };
        let server_name = session
            .server()
            .map(|s| s.reference().to_string())
            .unwrap_or_else(|| "nowhere".to_string());
        let message = format!("{event}: {} ({server_name})", session.name());
        let session_server = session.server().map(|s| s.id.clone());

        for other in self.sessions.all() {
            if other.id == session.id {
                continue;
            }
            if other.server().map(|s| s.id.clone()) == session_server {
                continue;
            }
            other.raw_message(&message).await;
        }
    }

    /// Tell users on other servers about a rename.
    pub async fn notify_name_change(&self, session: &Arc<Session>, old_name: &str) {
        let new_name = session.name();
        if new_name == old_name || old_name.is_empty() {
            return;
        }
        let server_name = session
            .server()
            .map(|s| s.reference().to_string())
            .unwrap_or_else(|| "nowhere".to_string());
        let message = format!("{old_name} now known as {new_name} [{server_name}]");
        let session_server = session.server().map(|s| s.id.clone());

        for other in self.sessions.all() {
            if other.id == session.id
                || other.server().map(|s| s.id.clone()) == session_server
            {
                continue;
            }
            other.raw_message(&message).await;
        }
    }

    pub async fn announce_in_server(&self, server_id: &str, text: &str) {
        for session in self.sessions.on_server(server_id) {
            session.message(text).await;
        }
    }

    /// First-contact greeting, once per session.
    pub async fn greet(&self, session: &Arc<Session>) {
        if session.was_greeted() {
            return;
        }
        session.set_greeted();
        session.message("welcome to skirmish!").await;
        session
            .message("say #help to see what the cluster can do.")
            .await;
    }

    /// Web auth handshake against the sidecar.
    pub async fn authenticate(&self, session: &Arc<Session>, token: &str) {
        use crate::session::AuthUser;

        let user = self.verse.get_or_create_user(token, &session.name()).await;
        match user {
            Some(user) => {
                info!(session = session.id, user = %user.id, "authenticated");
                session.set_auth(Some(AuthUser {
                    id: user.id,
                    name: user.name.clone(),
                }));
                session
                    .connection
                    .send_control(WebControl::AuthResult {
                        ok: true,
                        name: Some(user.name),
                    })
                    .await;
            }
            None => {
                session
                    .connection
                    .send_control(WebControl::AuthResult {
                        ok: false,
                        name: None,
                    })
                    .await;
            }
        }
        self.greet(session).await;
    }

    // ========================================================================
    // Interception policy
    // ========================================================================

    /// May this session mutate the world it is standing in?
    pub fn edit_denial(&self, session: &Arc<Session>) -> Option<&'static str> {
        let Some(server) = session.server() else {
            return Some("you are not connected to a server.");
        };

        if let Some(instance) = self.spaces.find_instance(&server.id) {
            let is_owner = session
                .auth()
                .map(|auth| auth.id == instance.space.owner)
                .unwrap_or(false);
            if is_owner || instance.space.open_edit {
                return None;
            }
            return Some("you cannot edit this space.");
        }

        // Named public servers are not editable.
        if server.alias.is_some() {
            return Some("you cannot edit this server.");
        }
        None
    }

    /// A teleporter fired inside a space; follow its link if one matches.
    pub async fn handle_teleport(self: Arc<Self>, session: &Arc<Session>, source: i32) {
        let Some(server) = session.server() else {
            return;
        };
        let Some(instance) = self.spaces.find_instance(&server.id) else {
            return;
        };
        let Ok(source) = u8::try_from(source) else {
            return;
        };

        for link in &instance.space.links {
            if link.teleport == source {
                info!(session = session.id, destination = %link.destination, "teleport link");
                let cluster = self.clone();
                let session = session.clone();
                let destination = link.destination.clone();
                tokio::spawn(async move {
                    cluster.run_command(&session, &format!("go {destination}")).await;
                });
                return;
            }
        }
    }
}
