//! Running instances of stored spaces.
//!
//! A space lives in the sidecar; when a player visits one, a server is
//! started from the space preset and tracked here so later visitors share
//! it. Instances are keyed both ways: space id to server, server id to
//! space.

use crate::error::SpawnError;
use crate::server::{GameServer, ServerManager};
use crate::verse::{SpaceRecord, VerseHandle};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Preset used for space servers; virtual, so users cannot spawn it
/// directly with `#creategame`.
pub const SPACE_PRESET: &str = "space";

#[derive(Clone)]
pub struct SpaceInstance {
    pub space: SpaceRecord,
    pub server: Arc<GameServer>,
}

pub struct SpaceManager {
    servers: Arc<ServerManager>,
    /// space id -> running instance
    instances: DashMap<String, SpaceInstance>,
    /// server id -> space id
    by_server: DashMap<String, String>,
}

impl SpaceManager {
    pub fn new(servers: Arc<ServerManager>) -> Self {
        Self {
            servers,
            instances: DashMap::new(),
            by_server: DashMap::new(),
        }
    }

    /// The space instance running on a server, if that server hosts one.
    pub fn find_instance(&self, server_id: &str) -> Option<SpaceInstance> {
        let space_id = self.by_server.get(server_id)?.value().clone();
        self.instances.get(&space_id).map(|i| i.value().clone())
    }

    pub fn instance_for_space(&self, space_id: &str) -> Option<SpaceInstance> {
        self.instances.get(space_id).map(|i| i.value().clone())
    }

    /// Start (or join) the server instance for a stored space.
    pub async fn start_space(
        &self,
        verse: &VerseHandle,
        reference: &str,
    ) -> Result<Option<SpaceInstance>, SpawnError> {
        let Some(space) = verse.find_space(reference).await else {
            return Ok(None);
        };

        if let Some(instance) = self.instances.get(&space.id) {
            if instance.server.is_running() {
                return Ok(Some(instance.value().clone()));
            }
        }

        info!(space = %space.id, "starting space server");
        let server = self.servers.launch(SPACE_PRESET, None, true).await?;
        if !space.description.is_empty() {
            server
                .send_command(&format!("serverdesc \"{}\"", space.description))
                .await;
        }

        let instance = SpaceInstance {
            space: space.clone(),
            server: server.clone(),
        };
        self.instances.insert(space.id.clone(), instance.clone());
        self.by_server.insert(server.id.clone(), space.id);
        Ok(Some(instance))
    }

    /// Refresh the stored record on a running instance (edit toggles,
    /// link changes).
    pub fn update_record(&self, space: SpaceRecord) {
        if let Some(mut instance) = self.instances.get_mut(&space.id) {
            instance.space = space;
        }
    }

    /// Forget an instance whose server went away.
    pub fn forget_server(&self, server_id: &str) {
        if let Some((_, space_id)) = self.by_server.remove(server_id) {
            self.instances.remove(&space_id);
        }
    }
}
