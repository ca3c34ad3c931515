//! The persistent key-value sidecar.
//!
//! Holds authenticated user records, named spaces, and map payloads under
//! `verse-*` keys. The store is never on the packet-forwarding hot path;
//! when it is absent or failing, the cluster degrades to anonymous-only
//! mode and every lookup simply misses.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

const USER_KEY: &str = "verse-user-";
const SPACE_KEY: &str = "verse-space-";
const ALIAS_KEY: &str = "verse-alias-";
const MAP_META_KEY: &str = "verse-map-meta-";
const MAP_DATA_KEY: &str = "verse-map-data-";

#[derive(Debug, Error)]
pub enum VerseError {
    #[error("sidecar query failed: {0}")]
    Db(#[from] sqlx::Error),
    #[error("sidecar record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// An authenticated user record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    /// Space id of the user's home, created lazily.
    pub home: Option<String>,
}

/// A teleporter link inside a space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpaceLink {
    /// Teleporter tag the link fires on.
    pub teleport: u8,
    /// Server or space reference to send the player to.
    pub destination: String,
}

/// A persistently stored, user-owned virtual server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpaceRecord {
    pub id: String,
    pub owner: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Whether players other than the owner may edit.
    #[serde(default)]
    pub open_edit: bool,
    /// Whether a map vote in this space creates a private game instead.
    #[serde(default)]
    pub voting_creates: bool,
    #[serde(default)]
    pub links: Vec<SpaceLink>,
    /// Content hash of the space's map payload, if one was saved.
    #[serde(default)]
    pub map: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapMeta {
    pub created: chrono::DateTime<Utc>,
    pub creator: String,
}

pub struct Verse {
    pool: SqlitePool,
}

impl Verse {
    pub async fn connect(path: &str) -> Result<Self, VerseError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(VerseError::Db)?
            .create_if_missing(true);
        // One connection: the sidecar is never on the hot path, and a
        // single handle keeps `:memory:` databases coherent in tests.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, VerseError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), VerseError> {
        sqlx::query(
            "INSERT INTO kv (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        key: &str,
    ) -> Result<Option<T>, VerseError> {
        match self.get_raw(key).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), VerseError> {
        self.put_raw(key, &serde_json::to_vec(value)?).await
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<UserRecord>, VerseError> {
        self.get_json(&format!("{USER_KEY}{id}")).await
    }

    pub async fn save_user(&self, user: &UserRecord) -> Result<(), VerseError> {
        self.put_json(&format!("{USER_KEY}{}", user.id), user).await
    }

    pub async fn get_or_create_user(
        &self,
        id: &str,
        name: &str,
    ) -> Result<UserRecord, VerseError> {
        if let Some(user) = self.get_user(id).await? {
            return Ok(user);
        }
        let user = UserRecord {
            id: id.to_string(),
            name: name.to_string(),
            home: None,
        };
        self.save_user(&user).await?;
        Ok(user)
    }

    pub async fn get_space(&self, id: &str) -> Result<Option<SpaceRecord>, VerseError> {
        self.get_json(&format!("{SPACE_KEY}{id}")).await
    }

    pub async fn save_space(&self, space: &SpaceRecord) -> Result<(), VerseError> {
        if let Some(alias) = &space.alias {
            self.put_raw(&format!("{ALIAS_KEY}{alias}"), space.id.as_bytes())
                .await?;
        }
        self.put_json(&format!("{SPACE_KEY}{}", space.id), space)
            .await
    }

    /// Find a space by id or alias.
    pub async fn find_space(&self, reference: &str) -> Result<Option<SpaceRecord>, VerseError> {
        if let Some(space) = self.get_space(reference).await? {
            return Ok(Some(space));
        }
        match self.get_raw(&format!("{ALIAS_KEY}{reference}")).await? {
            Some(id) => {
                let id = String::from_utf8_lossy(&id).to_string();
                self.get_space(&id).await
            }
            None => Ok(None),
        }
    }

    /// Resolve the user's home space, creating it on first use.
    pub async fn get_or_create_home(
        &self,
        user: &UserRecord,
    ) -> Result<SpaceRecord, VerseError> {
        if let Some(home) = &user.home {
            if let Some(space) = self.get_space(home).await? {
                return Ok(space);
            }
        }

        let space = SpaceRecord {
            id: format!("home-{}", user.id),
            owner: user.id.clone(),
            alias: None,
            description: format!("{}'s home", user.name),
            open_edit: false,
            voting_creates: false,
            links: Vec::new(),
            map: None,
        };
        self.save_space(&space).await?;
        self.save_user(&UserRecord {
            home: Some(space.id.clone()),
            ..user.clone()
        })
        .await?;
        Ok(space)
    }

    pub async fn map_data(&self, hash: &str) -> Result<Option<Vec<u8>>, VerseError> {
        self.get_raw(&format!("{MAP_DATA_KEY}{hash}")).await
    }

    pub async fn save_map(
        &self,
        hash: &str,
        data: &[u8],
        creator: &str,
    ) -> Result<(), VerseError> {
        self.put_raw(&format!("{MAP_DATA_KEY}{hash}"), data).await?;
        self.put_json(
            &format!("{MAP_META_KEY}{hash}"),
            &MapMeta {
                created: Utc::now(),
                creator: creator.to_string(),
            },
        )
        .await
    }

    pub async fn map_meta(&self, hash: &str) -> Result<Option<MapMeta>, VerseError> {
        self.get_json(&format!("{MAP_META_KEY}{hash}")).await
    }
}

/// A handle that swallows sidecar failures into anonymous-only behavior.
pub struct VerseHandle {
    inner: Option<Verse>,
}

impl VerseHandle {
    pub fn new(inner: Option<Verse>) -> Self {
        Self { inner }
    }

    pub fn enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub async fn user(&self, id: &str) -> Option<UserRecord> {
        let verse = self.inner.as_ref()?;
        match verse.get_user(id).await {
            Ok(user) => user,
            Err(e) => {
                warn!(error = %e, "sidecar lookup failed, treating as anonymous");
                None
            }
        }
    }

    pub async fn get_or_create_user(&self, id: &str, name: &str) -> Option<UserRecord> {
        let verse = self.inner.as_ref()?;
        match verse.get_or_create_user(id, name).await {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "sidecar user create failed");
                None
            }
        }
    }

    pub async fn find_space(&self, reference: &str) -> Option<SpaceRecord> {
        let verse = self.inner.as_ref()?;
        match verse.find_space(reference).await {
            Ok(space) => space,
            Err(e) => {
                warn!(error = %e, "sidecar space lookup failed");
                None
            }
        }
    }

    pub async fn save_space(&self, space: &SpaceRecord) -> bool {
        let Some(verse) = self.inner.as_ref() else {
            return false;
        };
        match verse.save_space(space).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "sidecar space save failed");
                false
            }
        }
    }

    pub async fn get_or_create_home(&self, user: &UserRecord) -> Option<SpaceRecord> {
        let verse = self.inner.as_ref()?;
        match verse.get_or_create_home(user).await {
            Ok(space) => Some(space),
            Err(e) => {
                warn!(error = %e, "sidecar home lookup failed");
                None
            }
        }
    }

    pub async fn map_data(&self, hash: &str) -> Option<Vec<u8>> {
        let verse = self.inner.as_ref()?;
        match verse.map_data(hash).await {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "sidecar map lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_verse() -> Verse {
        Verse::connect(":memory:").await.expect("open sidecar")
    }

    #[tokio::test]
    async fn users_round_trip() {
        let verse = memory_verse().await;
        let user = verse.get_or_create_user("u1", "alpha").await.unwrap();
        assert_eq!(user.name, "alpha");
        let again = verse.get_user("u1").await.unwrap().unwrap();
        assert_eq!(again, user);
    }

    #[tokio::test]
    async fn spaces_resolve_by_id_and_alias() {
        let verse = memory_verse().await;
        let space = SpaceRecord {
            id: "s1".into(),
            owner: "u1".into(),
            alias: Some("plaza".into()),
            description: String::new(),
            open_edit: true,
            voting_creates: false,
            links: vec![SpaceLink {
                teleport: 1,
                destination: "lobby".into(),
            }],
            map: None,
        };
        verse.save_space(&space).await.unwrap();

        assert_eq!(verse.find_space("s1").await.unwrap(), Some(space.clone()));
        assert_eq!(verse.find_space("plaza").await.unwrap(), Some(space));
        assert_eq!(verse.find_space("nowhere").await.unwrap(), None);
    }

    #[tokio::test]
    async fn home_is_created_once() {
        let verse = memory_verse().await;
        let user = verse.get_or_create_user("u2", "beta").await.unwrap();
        let home = verse.get_or_create_home(&user).await.unwrap();
        assert_eq!(home.owner, "u2");

        let user = verse.get_user("u2").await.unwrap().unwrap();
        assert_eq!(user.home.as_deref(), Some(home.id.as_str()));

        let again = verse.get_or_create_home(&user).await.unwrap();
        assert_eq!(again.id, home.id);
    }

    #[tokio::test]
    async fn map_payloads_round_trip() {
        let verse = memory_verse().await;
        verse.save_map("abc123", &[1, 2, 3], "u1").await.unwrap();
        assert_eq!(verse.map_data("abc123").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(verse.map_meta("abc123").await.unwrap().unwrap().creator, "u1");
    }

    #[tokio::test]
    async fn handle_without_sidecar_is_anonymous() {
        let handle = VerseHandle::new(None);
        assert!(!handle.enabled());
        assert!(handle.user("u1").await.is_none());
        assert!(handle.find_space("s1").await.is_none());
    }
}
