use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use cce_schema::Role;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Set on a message whose stream was cancelled mid-turn (§5 Cancellation).
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionMetadata {
    pub token_count: usize,
    pub compression_count: u32,
    pub mode_history: Vec<String>,
}

/// The root object written to `<home>/.ollm/sessions/<sessionId>.json`.
/// Compression and rollover in memory never touch this struct; it only ever
/// grows by `record_message` / `record_tool_call`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionFile {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub model: String,
    pub provider: String,
    pub messages: Vec<RecordedMessage>,
    pub tool_calls: Vec<RecordedToolCall>,
    pub metadata: SessionMetadata,
}

impl SessionFile {
    pub fn new(session_id: impl Into<String>, model: impl Into<String>, provider: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            start_time: now,
            last_activity: now,
            model: model.into(),
            provider: provider.into(),
            messages: Vec::new(),
            tool_calls: Vec::new(),
            metadata: SessionMetadata::default(),
        }
    }
}

/// Durable, crash-safe append-oriented recorder. Every mutating call writes
/// the whole session object via temp-file + fsync + atomic rename (P7).
pub struct SessionRecorder {
    sessions_dir: PathBuf,
    max_sessions: usize,
}

impl SessionRecorder {
    pub fn new(home: impl AsRef<Path>, max_sessions: usize) -> Self {
        Self {
            sessions_dir: home.as_ref().join(".ollm").join("sessions"),
            max_sessions,
        }
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.json"))
    }

    fn temp_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.json.tmp"))
    }

    pub async fn start_session(&self, session_id: &str, model: &str, provider: &str) -> Result<SessionFile> {
        tokio::fs::create_dir_all(&self.sessions_dir)
            .await
            .context("creating sessions directory")?;
        let session = SessionFile::new(session_id, model, provider);
        self.persist(&session).await?;
        self.enforce_retention().await?;
        Ok(session)
    }

    pub async fn load_session(&self, session_id: &str) -> Result<SessionFile> {
        let raw = tokio::fs::read_to_string(self.session_path(session_id))
            .await
            .with_context(|| format!("reading session {session_id}"))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing session {session_id}"))
    }

    pub async fn record_message(&self, session: &mut SessionFile, role: Role, content: impl Into<String>, truncated: bool) -> Result<()> {
        session.messages.push(RecordedMessage {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            truncated,
        });
        session.last_activity = Utc::now();
        self.persist(session).await?;
        self.enforce_retention().await
    }

    pub async fn record_tool_call(
        &self,
        session: &mut SessionFile,
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
        output: Option<serde_json::Value>,
    ) -> Result<()> {
        session.tool_calls.push(RecordedToolCall {
            id: id.into(),
            name: name.into(),
            input,
            output,
            timestamp: Utc::now(),
        });
        session.last_activity = Utc::now();
        self.persist(session).await?;
        self.enforce_retention().await
    }

    /// Step 2-4 of the write discipline: whole-object write to a temp file,
    /// fsync, atomic rename. A best-effort directory fsync follows; its
    /// failure (unsupported on some filesystems) is not propagated.
    async fn persist(&self, session: &SessionFile) -> Result<()> {
        let final_path = self.session_path(&session.session_id);
        let temp_path = self.temp_path(&session.session_id);
        let serialized = serde_json::to_vec_pretty(session).context("serializing session")?;

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
            return Err(error).context("writing session file");
        }

        if let Err(error) = sync_directory(&self.sessions_dir).await {
            warn!(%error, "directory fsync after session write failed (non-fatal)");
        }
        Ok(())
    }

    /// Deletes the oldest sessions beyond `max_sessions`, ranked by
    /// `last_activity`. Runs on every save and should also run on startup.
    pub async fn enforce_retention(&self) -> Result<()> {
        let mut entries: Vec<(PathBuf, DateTime<Utc>)> = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.sessions_dir).await {
            Ok(dir) => dir,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let Ok(session) = serde_json::from_str::<SessionFile>(&raw) else {
                continue;
            };
            entries.push((path, session.last_activity));
        }

        if entries.len() <= self.max_sessions {
            return Ok(());
        }

        entries.sort_by(|a, b| b.1.cmp(&a.1));
        for (path, _) in entries.into_iter().skip(self.max_sessions) {
            let _ = tokio::fs::remove_file(path).await;
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn sync_directory(dir: &Path) -> std::io::Result<()> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&dir)?;
        file.sync_all()
    })
    .await
    .map_err(|e| std::io::Error::other(e))?
}

#[cfg(not(unix))]
async fn sync_directory(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
