use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use cce_schema::{Checkpoint, Message, Mode, Tier};

const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Durable point-in-time recovery snapshot (spec §4.6). `user_messages` is
/// never truncated; restoring it is what makes P6's round-trip guarantee
/// possible.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub schema_version: u32,
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub token_count: usize,
    pub user_messages: Vec<Message>,
    pub other_messages: Vec<Message>,
    pub checkpoints: Vec<Checkpoint>,
    pub mode: Mode,
    pub tier: Tier,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SnapshotIndex {
    entries: Vec<SnapshotIndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotIndexEntry {
    id: String,
    timestamp: DateTime<Utc>,
}

/// Why a snapshot was taken, recorded only for the caller's own bookkeeping;
/// not part of the persisted schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotReason {
    Manual,
    AutoThresholdCrossed,
    PreRollover,
}

pub struct SnapshotStore {
    root: PathBuf,
    max_count: usize,
}

impl SnapshotStore {
    pub fn new(home: impl AsRef<Path>, max_count: usize) -> Self {
        Self {
            root: home.as_ref().join(".ollm").join("context-snapshots"),
            max_count,
        }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn snapshot_path(&self, session_id: &str, snapshot_id: &str) -> PathBuf {
        self.session_dir(session_id).join(format!("{snapshot_id}.json"))
    }

    fn index_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("index.json")
    }

    pub async fn create(
        &self,
        session_id: &str,
        token_count: usize,
        user_messages: Vec<Message>,
        other_messages: Vec<Message>,
        checkpoints: Vec<Checkpoint>,
        mode: Mode,
        tier: Tier,
        _reason: SnapshotReason,
    ) -> Result<Snapshot> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .context("creating snapshot directory")?;

        let snapshot = Snapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            token_count,
            user_messages,
            other_messages,
            checkpoints,
            mode,
            tier,
        };

        self.write_snapshot_file(&snapshot).await?;
        self.append_index_entry(session_id, &snapshot.id, snapshot.timestamp).await?;
        self.enforce_retention(session_id).await?;
        Ok(snapshot)
    }

    async fn write_snapshot_file(&self, snapshot: &Snapshot) -> Result<()> {
        let final_path = self.snapshot_path(&snapshot.session_id, &snapshot.id);
        let temp_path = final_path.with_extension("json.tmp");
        let serialized = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;

        let result = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(&serialized).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp_path, &final_path).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(error) = result {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(error).context("writing snapshot file");
        }
        Ok(())
    }

    async fn load_index(&self, session_id: &str) -> Result<SnapshotIndex> {
        match tokio::fs::read_to_string(self.index_path(session_id)).await {
            Ok(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(SnapshotIndex::default()),
            Err(error) => Err(error.into()),
        }
    }

    async fn save_index(&self, session_id: &str, index: &SnapshotIndex) -> Result<()> {
        let serialized = serde_json::to_vec_pretty(index).context("serializing snapshot index")?;
        tokio::fs::write(self.index_path(session_id), serialized)
            .await
            .context("writing snapshot index")
    }

    async fn append_index_entry(&self, session_id: &str, snapshot_id: &str, timestamp: DateTime<Utc>) -> Result<()> {
        let mut index = self.load_index(session_id).await?;
        index.entries.push(SnapshotIndexEntry {
            id: snapshot_id.to_string(),
            timestamp,
        });
        self.save_index(session_id, &index).await
    }

    /// Keeps the `max_count` most recent snapshots for a session, deleting
    /// older snapshot files and pruning the index.
    async fn enforce_retention(&self, session_id: &str) -> Result<()> {
        let mut index = self.load_index(session_id).await?;
        if index.entries.len() <= self.max_count {
            return Ok(());
        }
        index.entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let stale: Vec<SnapshotIndexEntry> = index.entries.split_off(self.max_count);
        for entry in &stale {
            let _ = tokio::fs::remove_file(self.snapshot_path(session_id, &entry.id)).await;
        }
        self.save_index(session_id, &index).await
    }

    pub async fn restore(&self, session_id: &str, snapshot_id: &str) -> Result<Snapshot> {
        let raw = tokio::fs::read_to_string(self.snapshot_path(session_id, snapshot_id))
            .await
            .with_context(|| format!("reading snapshot {snapshot_id}"))?;
        let snapshot: Snapshot = serde_json::from_str(&raw).context("parsing snapshot")?;
        if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
            bail!(
                "unsupported snapshot schema version {} (expected {})",
                snapshot.schema_version,
                SNAPSHOT_SCHEMA_VERSION
            );
        }
        Ok(snapshot)
    }

    pub async fn list(&self, session_id: &str) -> Result<Vec<String>> {
        let mut index = self.load_index(session_id).await?;
        index.entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(index.entries.into_iter().map(|e| e.id).collect())
    }
}
