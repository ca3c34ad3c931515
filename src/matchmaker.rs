//! 1v1 matchmaking.
//!
//! One FIFO queue per duel format. The poller pairs the two oldest eligible
//! entries, spawns a temporary server from the format's preset, and walks
//! the pair through warmup, countdown, the main phase, and as many overtime
//! rounds as it takes to reach a three-point margin. Both players are
//! returned to their previous servers however the match ends.

use crate::config::{DuelFormatBlock, ForceRespawn};
use crate::error::CommandError;
use crate::server::{GameServer, ServerManager};
use crate::session::{Session, SessionManager};
use skirmish_proto::{colors, Message};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const COUNTDOWN_SECONDS: u32 = 5;
/// Win-by margin that ends a duel.
const WIN_MARGIN: i32 = 3;

#[derive(Debug, Clone)]
pub struct QueueEntry {
    session: Arc<Session>,
    format: String,
    joined: Instant,
}

pub struct Matchmaker {
    formats: Vec<DuelFormatBlock>,
    servers: Arc<ServerManager>,
    sessions: Arc<SessionManager>,
    queue: Mutex<Vec<QueueEntry>>,
    queue_event: Notify,
    scope: CancellationToken,
}

impl Matchmaker {
    pub fn new(
        formats: Vec<DuelFormatBlock>,
        servers: Arc<ServerManager>,
        sessions: Arc<SessionManager>,
        scope: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            formats,
            servers,
            sessions,
            queue: Mutex::new(Vec::new()),
            queue_event: Notify::new(),
            scope,
        })
    }

    fn resolve_format(&self, name: &str) -> Option<&DuelFormatBlock> {
        if name.is_empty() {
            return self.formats.iter().find(|f| f.default);
        }
        self.formats.iter().find(|f| f.name == name)
    }

    /// Queue a session for dueling. A session holds at most one entry
    /// across all formats; re-queueing moves it.
    pub async fn queue(&self, session: &Arc<Session>, format: &str) -> Result<(), CommandError> {
        let format = self
            .resolve_format(format)
            .ok_or_else(|| CommandError::NoSuchDuelFormat(format.to_string()))?
            .name
            .clone();

        {
            let mut queue = self.queue.lock().await;
            if let Some(entry) = queue.iter_mut().find(|e| e.session.id == session.id) {
                entry.format = format.clone();
            } else {
                queue.push(QueueEntry {
                    session: session.clone(),
                    format: format.clone(),
                    joined: Instant::now(),
                });
            }
        }

        info!(session = session.id, format = %format, "queued for dueling");
        session.message("you are now queued for dueling").await;
        self.queue_event.notify_one();
        Ok(())
    }

    pub async fn dequeue(&self, session: &Arc<Session>) {
        let mut queue = self.queue.lock().await;
        queue.retain(|entry| entry.session.id != session.id);
    }

    /// Pair-forming loop; fires on a timer and on every enqueue.
    pub async fn poll(self: Arc<Self>) {
        let mut tick = tokio::time::interval(POLL_INTERVAL);
        loop {
            let pairs = {
                let mut queue = self.queue.lock().await;
                prune_disconnected(&mut queue);
                let pairs = take_pairs(&mut queue);
                for entry in queue.iter() {
                    let waited = entry.joined.elapsed().as_secs();
                    entry
                        .session
                        .message(&format!(
                            "you have been queued for {waited}s; say #stopduel to leave"
                        ))
                        .await;
                }
                pairs
            };

            for (a, b) in pairs {
                let this = self.clone();
                tokio::spawn(async move {
                    this.duel(a, b).await;
                });
            }

            tokio::select! {
                _ = self.scope.cancelled() => return,
                _ = self.queue_event.notified() => {}
                _ = tick.tick() => {}
            }
        }
    }

    async fn broadcast(a: &Arc<Session>, b: &Arc<Session>, text: &str) {
        a.message(text).await;
        b.message(text).await;
    }

    /// A phase of uninterrupted gameplay; false if the match was canceled.
    async fn run_phase(scope: &CancellationToken, duration: Duration) -> bool {
        tokio::select! {
            _ = scope.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn countdown(
        scope: &CancellationToken,
        a: &Arc<Session>,
        b: &Arc<Session>,
    ) -> bool {
        for remaining in (0..=COUNTDOWN_SECONDS).rev() {
            if !Self::run_phase(scope, Duration::from_secs(1)).await {
                return false;
            }
            Self::broadcast(a, b, &format!("{remaining}")).await;
        }
        true
    }

    /// Run one duel to completion. Convention: player A is the
    /// earlier-joining entry of the pair.
    async fn duel(self: Arc<Self>, a: QueueEntry, b: QueueEntry) {
        let format = match self.resolve_format(&a.format) {
            Some(format) => format.clone(),
            None => return,
        };
        let (a, b) = (a.session, b.session);
        info!(a = a.id, b = b.id, format = %format.name, "initiating 1v1");

        let match_scope = self.scope.child_token();
        let _guard = match_scope.clone().drop_guard();

        // Either player leaving the cluster ends the match.
        for session in [&a, &b] {
            let session = session.clone();
            let match_scope = match_scope.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = match_scope.cancelled() => {}
                    _ = session.scope().cancelled() => {
                        info!(session = session.id, "player disconnected, ending match");
                        match_scope.cancel();
                    }
                }
            });
        }

        Self::broadcast(&a, &b, &colors::green("found a match!")).await;
        Self::broadcast(&a, &b, "starting match server").await;

        let duel_server = match self.servers.launch(&format.preset, None, true).await {
            Ok(server) => server,
            Err(e) => {
                error!(error = %e, "failed to create duel server");
                Self::broadcast(&a, &b, &colors::red("error starting match server")).await;
                return;
            }
        };

        let previous_a = a.server();
        let previous_b = b.server();

        let outcome = self
            .run_match(&match_scope, &format, &duel_server, &a, &b)
            .await;

        if let Some((score_a, score_b)) = outcome {
            info!(
                server = %duel_server.reference(),
                score_a, score_b, "match ended"
            );
            Self::broadcast(&a, &b, &format!("match ended {score_a}:{score_b}")).await;
        }

        // Return whoever is still around, regardless of how it ended.
        for (session, previous) in [(&a, previous_a), (&b, previous_b)] {
            if session.scope().is_cancelled() {
                continue;
            }
            if let Some(previous) = previous {
                if self.sessions.connect(session, &previous).await.is_err() {
                    session
                        .message(&colors::red("could not return you to your server"))
                        .await;
                }
            }
        }

        self.servers.remove(&duel_server.id);
    }

    async fn run_match(
        &self,
        match_scope: &CancellationToken,
        format: &DuelFormatBlock,
        duel_server: &Arc<GameServer>,
        a: &Arc<Session>,
        b: &Arc<Session>,
    ) -> Option<(i32, i32)> {
        duel_server.send_command("pausegame 1").await;

        // Move both players over; a failed migration aborts the whole
        // match and requeues neither.
        for session in [a, b] {
            if self.sessions.connect(session, duel_server).await.is_err() {
                error!(session = session.id, "player failed to connect to duel server");
                Self::broadcast(a, b, &colors::red("error starting match server")).await;
                return None;
            }

            // Leaving the duel server ends the match too.
            if let Some(server_scope) = session.server_scope() {
                let match_scope = match_scope.clone();
                let id = session.id;
                tokio::spawn(async move {
                    tokio::select! {
                        _ = match_scope.cancelled() => {}
                        _ = server_scope.cancelled() => {
                            info!(session = id, "player left duel server, ending match");
                            match_scope.cancel();
                        }
                    }
                });
            }
        }

        duel_server.send_command("pausegame 0").await;
        Self::broadcast(
            a,
            b,
            &colors::blue(&format!("WARMUP: {} seconds", format.warmup_seconds)),
        )
        .await;
        if !Self::run_phase(match_scope, Duration::from_secs(format.warmup_seconds)).await {
            return None;
        }
        Self::broadcast(a, b, &colors::blue("WARMUP OVER")).await;
        reset_players(duel_server, format.force_respawn).await;

        // Frag watcher over the duel server's broadcast stream.
        let scores = Arc::new(std::sync::Mutex::new((0i32, 0i32)));
        {
            let mut broadcasts = duel_server.broadcast_subscribe();
            let scores = scores.clone();
            let watch_scope = match_scope.clone();
            let server = duel_server.clone();
            let pause_on_death = format.pause_on_death;
            let (a, b) = (a.clone(), b.clone());
            tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        _ = watch_scope.cancelled() => return,
                        message = broadcasts.recv() => match message {
                            Some(message) => message,
                            None => return,
                        },
                    };
                    if let Message::Died {
                        client,
                        killer,
                        frags,
                        ..
                    } = message
                    {
                        if client == killer {
                            continue;
                        }
                        let a_num = a.client_num().map(|n| n as i32);
                        let b_num = b.client_num().map(|n| n as i32);
                        {
                            let mut scores = scores.lock().unwrap();
                            if Some(client) == a_num {
                                scores.1 = frags;
                            } else if Some(client) == b_num {
                                scores.0 = frags;
                            }
                        }
                        if pause_on_death {
                            server.send_command("pausegame 1").await;
                            if !Self::run_phase(&watch_scope, Duration::from_secs(1)).await {
                                return;
                            }
                            server.send_command("pausegame 0").await;
                        }
                    }
                }
            });
        }

        duel_server.send_command("pausegame 1").await;
        if !Self::countdown(match_scope, a, b).await {
            return None;
        }
        duel_server.send_command("pausegame 0").await;
        Self::broadcast(a, b, &colors::red("GO")).await;

        if !Self::run_phase(match_scope, Duration::from_secs(format.phase_seconds)).await {
            return None;
        }

        // Win by three from wherever overtime starts.
        loop {
            let (score_a, score_b) = *scores.lock().unwrap();
            if (score_a - score_b).abs() >= WIN_MARGIN {
                return Some((score_a, score_b));
            }

            Self::broadcast(a, b, "OVERTIME").await;
            reset_players(duel_server, format.force_respawn).await;
            duel_server.send_command("pausegame 1").await;
            if !Self::countdown(match_scope, a, b).await {
                return None;
            }
            duel_server.send_command("pausegame 0").await;
            Self::broadcast(a, b, &colors::red("GO")).await;
            if !Self::run_phase(match_scope, Duration::from_secs(format.phase_seconds)).await {
                return None;
            }
        }
    }
}

/// Reset player state between phases according to the format's respawn
/// policy: everyone, only the dead, or nobody.
async fn reset_players(server: &Arc<GameServer>, policy: ForceRespawn) {
    match policy {
        ForceRespawn::All => {
            server.send_command("resetplayers 1").await;
        }
        ForceRespawn::Dead => {
            server.send_command("resetplayers 0").await;
        }
        ForceRespawn::None => {}
    }
}

/// Drop entries whose sessions are no longer on the ingress.
fn prune_disconnected(queue: &mut Vec<QueueEntry>) {
    queue.retain(|entry| {
        let alive = !entry.session.scope().is_cancelled();
        if !alive {
            info!(session = entry.session.id, "pruning disconnected duel entry");
        }
        alive
    });
}

/// Pull matched pairs out of the queue: per format, the two oldest first.
fn take_pairs(queue: &mut Vec<QueueEntry>) -> Vec<(QueueEntry, QueueEntry)> {
    let mut pairs = Vec::new();
    let mut matched: Vec<u16> = Vec::new();

    for i in 0..queue.len() {
        if matched.contains(&queue[i].session.id) {
            continue;
        }
        for j in (i + 1)..queue.len() {
            if matched.contains(&queue[j].session.id) {
                continue;
            }
            if queue[i].format == queue[j].format {
                matched.push(queue[i].session.id);
                matched.push(queue[j].session.id);
                pairs.push((queue[i].clone(), queue[j].clone()));
                break;
            }
        }
    }

    queue.retain(|entry| !matched.contains(&entry.session.id));
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionManager;
    use crate::testutil::fake_session;

    async fn entries(n: usize, format: &str) -> Vec<QueueEntry> {
        let (manager, mut new_sessions) = SessionManager::new();
        let mut out = Vec::new();
        for _ in 0..n {
            let (session, _) = fake_session(&manager, &mut new_sessions).await;
            out.push(QueueEntry {
                session,
                format: format.into(),
                joined: Instant::now(),
            });
        }
        out
    }

    #[tokio::test]
    async fn pairs_come_out_oldest_first() {
        let mut queue = entries(3, "insta").await;
        let ids: Vec<u16> = queue.iter().map(|e| e.session.id).collect();

        let pairs = take_pairs(&mut queue);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.session.id, ids[0]);
        assert_eq!(pairs[0].1.session.id, ids[1]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].session.id, ids[2]);
    }

    #[tokio::test]
    async fn different_formats_never_pair() {
        let mut queue = entries(1, "insta").await;
        queue.extend(entries(1, "ffa").await);
        assert!(take_pairs(&mut queue).is_empty());
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn same_format_pairs_across_interleaved_entries() {
        let mut queue = entries(1, "insta").await;
        queue.extend(entries(1, "ffa").await);
        queue.extend(entries(1, "insta").await);

        let pairs = take_pairs(&mut queue);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.format, "insta");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].format, "ffa");
    }

    #[tokio::test]
    async fn disconnected_entries_are_pruned() {
        let mut queue = entries(2, "insta").await;
        queue[0].session.scope().cancel();
        prune_disconnected(&mut queue);
        assert_eq!(queue.len(), 1);
    }
}
