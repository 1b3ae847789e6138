//! Task records persisted to a JSON file.

use std::fs::{self, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{ExecutionResult, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub prompt: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct TaskStore {
    path: PathBuf,
    tasks: Mutex<Vec<TaskRecord>>,
}

impl TaskStore {
    /// Open the store at `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tasks = load_tasks(&path)?;
        debug!(path = %path.display(), count = tasks.len(), "task store loaded");
        Ok(Self {
            path,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn create(&self, prompt: &str) -> Result<TaskRecord> {
        let mut tasks = self.tasks.lock();
        let id = tasks.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        let now = Utc::now();
        let record = TaskRecord {
            id,
            prompt: prompt.to_string(),
            status: TaskStatus::Running,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        tasks.push(record.clone());
        save_tasks(&self.path, &tasks)?;
        Ok(record)
    }

    pub fn complete(&self, id: TaskId, result: ExecutionResult) -> Result<TaskRecord> {
        self.update(id, |record| {
            record.status = TaskStatus::Completed;
            record.error = None;
            record.result = Some(result);
        })
    }

    /// Mark a task failed. A result is kept when the run got far enough to produce one.
    pub fn fail(&self, id: TaskId, error: &str, result: Option<ExecutionResult>) -> Result<TaskRecord> {
        self.update(id, |record| {
            record.status = TaskStatus::Failed;
            record.error = Some(error.to_string());
            if result.is_some() {
                record.result = result;
            }
        })
    }

    pub fn get(&self, id: TaskId) -> Option<TaskRecord> {
        self.tasks.lock().iter().find(|t| t.id == id).cloned()
    }

    /// Newest first.
    pub fn list(&self) -> Vec<TaskRecord> {
        let mut tasks = self.tasks.lock().clone();
        tasks.sort_by(|a, b| b.id.cmp(&a.id));
        tasks
    }

    fn update(&self, id: TaskId, f: impl FnOnce(&mut TaskRecord)) -> Result<TaskRecord> {
        let mut tasks = self.tasks.lock();
        let Some(record) = tasks.iter_mut().find(|t| t.id == id) else {
            bail!("task {id} not found");
        };
        f(record);
        record.updated_at = Utc::now();
        let updated = record.clone();
        save_tasks(&self.path, &tasks)?;
        Ok(updated)
    }
}

fn load_tasks(path: &Path) -> Result<Vec<TaskRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("reading task store {}", path.display()))
}

fn save_tasks(path: &Path, tasks: &[TaskRecord]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("writing {}", path.display()))?;
    serde_json::to_writer_pretty(file, tasks)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(error: Option<&str>) -> ExecutionResult {
        ExecutionResult {
            goal: "g".into(),
            attempts: 1,
            error: error.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn records_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tasks.json");

        let store = TaskStore::open(&path).unwrap();
        let first = store.create("find the docs").unwrap();
        let second = store.create("read the news").unwrap();
        store.complete(first.id, result(None)).unwrap();
        store
            .fail(second.id, "no element matches selector '#x'", Some(result(Some("boom"))))
            .unwrap();

        let reopened = TaskStore::open(&path).unwrap();
        let listed = reopened.list();
        assert_eq!(listed.iter().map(|t| t.id).collect::<Vec<_>>(), vec![2, 1]);

        let done = reopened.get(first.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.result.is_some());

        let failed = reopened.get(second.id).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("no element matches selector '#x'"));
        assert!(failed.updated_at >= failed.created_at);
    }

    #[test]
    fn new_tasks_start_running() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("tasks.json")).unwrap();

        let record = store.create("g").unwrap();
        assert_eq!(record.id, 1);
        assert_eq!(record.status, TaskStatus::Running);
        assert!(record.result.is_none());
    }

    #[test]
    fn failing_without_a_result_keeps_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("tasks.json")).unwrap();
        let record = store.create("g").unwrap();

        let failed = store.fail(record.id, "planning failed", None).unwrap();
        assert!(failed.result.is_none());
    }

    #[test]
    fn updating_an_unknown_task_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("tasks.json")).unwrap();

        assert!(store.complete(7, result(None)).is_err());
        assert!(store.get(7).is_none());
    }

    #[test]
    fn corrupt_store_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(&path, "not json").unwrap();

        assert!(TaskStore::open(&path).is_err());
    }
}
