//! Sqlite-backed store for local action history, path mappings and sync
//! plan audit records. Everything the engine remembers between runs lives
//! here; per-run [`crate::sync::record::PathRecord`]s never do.

use std::{fs, path::Path};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

use crate::sync::record::Tombstone;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid key type: {0}")]
    InvalidKeyType(String),
    #[error("invalid action type: {0}")]
    InvalidAction(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    File,
    Folder,
}

impl KeyType {
    fn as_str(&self) -> &'static str {
        match self {
            KeyType::File => "file",
            KeyType::Folder => "folder",
        }
    }

    fn parse(value: &str) -> Result<Self, HistoryError> {
        match value {
            "file" => Ok(KeyType::File),
            "folder" => Ok(KeyType::Folder),
            other => Err(HistoryError::InvalidKeyType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    Delete,
    Rename,
    RenameDestination,
}

impl ActionType {
    fn as_str(&self) -> &'static str {
        match self {
            ActionType::Delete => "delete",
            ActionType::Rename => "rename",
            ActionType::RenameDestination => "renameDestination",
        }
    }

    fn parse(value: &str) -> Result<Self, HistoryError> {
        match value {
            "delete" => Ok(ActionType::Delete),
            "rename" => Ok(ActionType::Rename),
            "renameDestination" => Ok(ActionType::RenameDestination),
            other => Err(HistoryError::InvalidAction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHistoryEntry {
    pub key: String,
    pub key_type: KeyType,
    pub action_type: ActionType,
    /// Epoch milliseconds.
    pub action_when: i64,
}

/// Forward/backward mapping between a local path and the remote object it
/// was last uploaded as. The local size/mtime are the values BEFORE
/// encryption, so both plain and encrypted sizes can be recovered later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMetaMapping {
    pub local_key: String,
    pub local_mtime: Option<i64>,
    pub local_size: Option<i64>,
    pub remote_key: String,
    pub remote_mtime: Option<i64>,
    pub remote_size: Option<i64>,
    pub etag: Option<String>,
}

pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), HistoryError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn record_delete(
        &self,
        key: &str,
        key_type: KeyType,
        action_when: i64,
    ) -> Result<(), HistoryError> {
        self.insert_history(key, key_type, ActionType::Delete, action_when)
            .await
    }

    /// A rename is a tombstone for the old path and a modification signal
    /// for the new one.
    pub async fn record_rename(
        &self,
        from_key: &str,
        to_key: &str,
        key_type: KeyType,
        action_when: i64,
    ) -> Result<(), HistoryError> {
        self.insert_history(from_key, key_type, ActionType::Rename, action_when)
            .await?;
        self.insert_history(to_key, key_type, ActionType::RenameDestination, action_when)
            .await
    }

    async fn insert_history(
        &self,
        key: &str,
        key_type: KeyType,
        action_type: ActionType,
        action_when: i64,
    ) -> Result<(), HistoryError> {
        sqlx::query(
            "INSERT INTO file_history (key, key_type, action_type, action_when) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(key)
        .bind(key_type.as_str())
        .bind(action_type.as_str())
        .bind(action_when)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_file_history(&self) -> Result<Vec<LocalHistoryEntry>, HistoryError> {
        let rows = sqlx::query(
            "SELECT key, key_type, action_type, action_when FROM file_history ORDER BY action_when ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key_type: String = row.try_get("key_type")?;
            let action_type: String = row.try_get("action_type")?;
            out.push(LocalHistoryEntry {
                key: row.try_get("key")?,
                key_type: KeyType::parse(&key_type)?,
                action_type: ActionType::parse(&action_type)?,
                action_when: row.try_get("action_when")?,
            });
        }
        Ok(out)
    }

    /// Removes delete/rename history for a path once it has been acted on.
    /// Folder keys may carry a trailing separator in the plan but not in
    /// the recorded history, so both spellings are cleared.
    pub async fn clear_history_for(&self, key: &str) -> Result<(), HistoryError> {
        let trimmed = key.trim_end_matches('/');
        sqlx::query("DELETE FROM file_history WHERE key = ?1 OR key = ?2")
            .bind(key)
            .bind(trimmed)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_mapping(&self, mapping: &SyncMetaMapping) -> Result<(), HistoryError> {
        sqlx::query(
            "INSERT INTO sync_mappings (local_key, local_mtime, local_size, remote_key, remote_mtime, remote_size, etag)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(local_key) DO UPDATE SET
                local_mtime = excluded.local_mtime,
                local_size = excluded.local_size,
                remote_key = excluded.remote_key,
                remote_mtime = excluded.remote_mtime,
                remote_size = excluded.remote_size,
                etag = excluded.etag;",
        )
        .bind(&mapping.local_key)
        .bind(mapping.local_mtime)
        .bind(mapping.local_size)
        .bind(&mapping.remote_key)
        .bind(mapping.remote_mtime)
        .bind(mapping.remote_size)
        .bind(&mapping.etag)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Backward lookup while parsing a remote listing: the stored mapping
    /// is only trusted when the remote side still matches what we uploaded
    /// (same mtime, or same etag when both sides have one).
    pub async fn mapping_by_remote_key(
        &self,
        remote_key: &str,
        remote_mtime: i64,
        etag: Option<&str>,
    ) -> Result<Option<SyncMetaMapping>, HistoryError> {
        let row = sqlx::query(
            "SELECT local_key, local_mtime, local_size, remote_key, remote_mtime, remote_size, etag
             FROM sync_mappings WHERE remote_key = ?1",
        )
        .bind(remote_key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mapping = SyncMetaMapping {
            local_key: row.try_get("local_key")?,
            local_mtime: row.try_get("local_mtime")?,
            local_size: row.try_get("local_size")?,
            remote_key: row.try_get("remote_key")?,
            remote_mtime: row.try_get("remote_mtime")?,
            remote_size: row.try_get("remote_size")?,
            etag: row.try_get("etag")?,
        };

        let mtime_matches = mapping.remote_mtime == Some(remote_mtime);
        let etag_matches = match (mapping.etag.as_deref(), etag) {
            (Some(stored), Some(seen)) => stored == seen,
            _ => false,
        };
        if mtime_matches || etag_matches {
            Ok(Some(mapping))
        } else {
            Ok(None)
        }
    }

    pub async fn cache_remote_tombstones(
        &self,
        tombstones: &[Tombstone],
    ) -> Result<(), HistoryError> {
        sqlx::query("DELETE FROM remote_tombstone_cache")
            .execute(&self.pool)
            .await?;
        for tombstone in tombstones {
            sqlx::query("INSERT INTO remote_tombstone_cache (key, action_when) VALUES (?1, ?2)")
                .bind(&tombstone.key)
                .bind(tombstone.action_when)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn read_remote_tombstone_cache(&self) -> Result<Vec<Tombstone>, HistoryError> {
        let rows =
            sqlx::query("SELECT key, action_when FROM remote_tombstone_cache ORDER BY key ASC")
                .fetch_all(&self.pool)
                .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Tombstone {
                key: row.try_get("key")?,
                action_when: row.try_get("action_when")?,
            });
        }
        Ok(out)
    }

    pub async fn insert_sync_plan(
        &self,
        ts: i64,
        trigger_kind: &str,
        plan_json: &str,
    ) -> Result<(), HistoryError> {
        sqlx::query("INSERT INTO sync_plans (ts, trigger_kind, plan_json) VALUES (?1, ?2, ?3)")
            .bind(ts)
            .bind(trigger_kind)
            .bind(plan_json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn latest_sync_plan(&self) -> Result<Option<String>, HistoryError> {
        let row = sqlx::query("SELECT plan_json FROM sync_plans ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("plan_json")?),
            None => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_store() -> HistoryStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = HistoryStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn records_and_loads_history_in_time_order() {
        let store = make_store().await;
        store
            .record_delete("b.md", KeyType::File, 2000)
            .await
            .unwrap();
        store
            .record_rename("old.md", "new.md", KeyType::File, 1000)
            .await
            .unwrap();

        let history = store.load_file_history().await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].key, "old.md");
        assert_eq!(history[0].action_type, ActionType::Rename);
        assert_eq!(history[1].key, "new.md");
        assert_eq!(history[1].action_type, ActionType::RenameDestination);
        assert_eq!(history[2].key, "b.md");
        assert_eq!(history[2].action_type, ActionType::Delete);
    }

    #[tokio::test]
    async fn clear_history_handles_folder_key_spellings() {
        let store = make_store().await;
        store
            .record_delete("notes", KeyType::Folder, 1000)
            .await
            .unwrap();
        store.clear_history_for("notes/").await.unwrap();
        assert!(store.load_file_history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn backward_mapping_requires_matching_mtime_or_etag() {
        let store = make_store().await;
        store
            .upsert_mapping(&SyncMetaMapping {
                local_key: "note.md".into(),
                local_mtime: Some(100),
                local_size: Some(5),
                remote_key: "vs2.abc".into(),
                remote_mtime: Some(900),
                remote_size: Some(33),
                etag: Some("etag-1".into()),
            })
            .await
            .unwrap();

        let hit = store
            .mapping_by_remote_key("vs2.abc", 900, None)
            .await
            .unwrap();
        assert_eq!(hit.unwrap().local_key, "note.md");

        let by_etag = store
            .mapping_by_remote_key("vs2.abc", 901, Some("etag-1"))
            .await
            .unwrap();
        assert!(by_etag.is_some());

        let stale = store
            .mapping_by_remote_key("vs2.abc", 901, Some("etag-2"))
            .await
            .unwrap();
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn tombstone_cache_roundtrip_replaces_previous_contents() {
        let store = make_store().await;
        store
            .cache_remote_tombstones(&[Tombstone {
                key: "a.md".into(),
                action_when: 1,
            }])
            .await
            .unwrap();
        store
            .cache_remote_tombstones(&[Tombstone {
                key: "b.md".into(),
                action_when: 2,
            }])
            .await
            .unwrap();

        let cached = store.read_remote_tombstone_cache().await.unwrap();
        assert_eq!(
            cached,
            vec![Tombstone {
                key: "b.md".into(),
                action_when: 2
            }]
        );
    }

    #[tokio::test]
    async fn stores_sync_plans_for_audit() {
        let store = make_store().await;
        store
            .insert_sync_plan(1000, "manual", "{\"records\":{}}")
            .await
            .unwrap();
        let plan = store.latest_sync_plan().await.unwrap().unwrap();
        assert!(plan.contains("records"));
    }
}
