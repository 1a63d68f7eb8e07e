//! Persistence layer.
//!
//! Saves and loads task snapshots as JSON, one pretty-printed file per task
//! under a configured directory. Snapshots are written whole, so a reader
//! never sees a half-updated task.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::types::Task;

/// JSON-file task store.
#[derive(Debug, Clone)]
pub struct TaskStore {
    dir: PathBuf,
}

impl TaskStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create task directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            anyhow::bail!("Refusing to use task id {id:?} as a file name");
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    /// Write a task snapshot, replacing any previous one.
    pub fn save(&self, task: &Task) -> Result<()> {
        let path = self.path_for(&task.id)?;
        let json = serde_json::to_string_pretty(task).context("Failed to serialise task")?;

        // Write-then-rename so a crash mid-write leaves the old snapshot.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)
            .with_context(|| format!("Failed to write task to {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move task into {}", path.display()))?;

        debug!(task_id = %task.id, status = %task.status, "Task saved");
        Ok(())
    }

    /// Load one task. Returns None if it was never saved.
    pub fn load(&self, id: &str) -> Result<Option<Task>> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(None);
        }
        read_task(&path).map(Some)
    }

    /// Load every saved task, oldest first. Unreadable files are skipped
    /// with a warning.
    pub fn load_all(&self) -> Result<Vec<Task>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list {}", self.dir.display()))?;

        let mut tasks = Vec::new();
        for entry in entries {
            let path = entry.context("Failed to read directory entry")?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_task(&path) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable task file"),
            }
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        info!(dir = %self.dir.display(), count = tasks.len(), "Tasks loaded from disk");
        Ok(tasks)
    }

    /// Remove a task's file. Missing files are not an error.
    pub fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to delete task file {}", path.display()))?;
        }
        Ok(())
    }
}

fn read_task(path: &Path) -> Result<Task> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task from {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("Failed to parse task from {}", path.display()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
