//! Append-only JSONL persistence for events and audit entries.
//!
//! Events are stored one file per subject (`{dir}/{subject}.jsonl`) so a
//! workflow can be replayed without scanning unrelated history. Audit
//! entries share one file guarded by an exclusive file lock per append.

use std::fs::OpenOptions as StdOpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::domain::{AuditEntry, Event, WorkflowExecution};
use crate::error::{CoordError, Result};

use super::{AuditLogger, EventBus};

/// File-backed event log using JSONL format
pub struct JsonlEventLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlEventLog {
    /// Create or open an event log directory
    pub async fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create events directory: {}", dir.display()))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file for a subject
    pub fn path_for(&self, subject_id: &str) -> PathBuf {
        let file_name: String = subject_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.jsonl", file_name))
    }

    pub async fn append(&self, event: &Event) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(&event.subject_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let json = serde_json::to_string(event)?;
        file.write_all(format!("{}\n", json).as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Replay all events for a subject in append order
    pub async fn replay(&self, subject_id: &str) -> Result<Vec<Event>> {
        read_lines(&self.path_for(subject_id)).await
    }

    /// Rebuild a workflow execution from its log
    pub async fn load_execution(&self, workflow_id: &str) -> Result<WorkflowExecution> {
        let events = self.replay(workflow_id).await?;
        WorkflowExecution::from_events(&events)
            .ok_or_else(|| CoordError::not_found("WorkflowExecution", workflow_id))
    }

    /// True if a stage with this idempotency key already finished
    pub async fn is_stage_completed(&self, subject_id: &str, idempotency_key: &str) -> Result<bool> {
        let events = self.replay(subject_id).await?;
        Ok(events.iter().any(|e| {
            e.idempotency_key == idempotency_key
                && e.event_type == crate::domain::EventType::StageEnd
        }))
    }

    /// Subjects with a log file
    pub async fn list_subjects(&self) -> Result<Vec<String>> {
        let mut subjects = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(subject) = name.strip_suffix(".jsonl") {
                    subjects.push(subject.to_string());
                }
            }
        }
        subjects.sort();
        Ok(subjects)
    }
}

#[async_trait]
impl EventBus for JsonlEventLog {
    async fn publish(&self, event: Event) -> Result<()> {
        self.append(&event).await
    }
}

/// Audit trail in a single JSONL file
pub struct JsonlAuditLog {
    path: PathBuf,
}

impl JsonlAuditLog {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create audit directory: {}", parent.display()))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn append_locked(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = StdOpenOptions::new().create(true).append(true).open(path)?;

    // Released when the file is dropped
    file.lock_exclusive()?;
    writeln!(file, "{}", line)?;
    file.flush()
}

#[async_trait]
impl AuditLogger for JsonlAuditLog {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        let line = serde_json::to_string(&entry)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || append_locked(&path, &line))
            .await
            .map_err(|e| CoordError::Internal(format!("audit writer panicked: {}", e)))??;
        Ok(())
    }

    async fn get_audit_trail(&self, subject_id: &str) -> Result<Vec<AuditEntry>> {
        let entries: Vec<AuditEntry> = read_lines(&self.path).await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.subject_id == subject_id)
            .collect())
    }
}

async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut items = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        items.push(serde_json::from_str(&line)?);
    }

    Ok(items)
}
