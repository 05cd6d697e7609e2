use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::backend::{StoreError, TaskBackend};
use crate::task::{Task, TaskDraft, TaskId, TaskPatch};

/// File-backed stand-in for the managed document collection. All owners share
/// one JSON-lines file; each line carries its owner.
#[derive(Debug)]
pub struct JsonlBackend {
    pub data_dir: PathBuf,
    pub tasks_path: PathBuf,
    pub attachments_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskRecord {
    owner: String,
    #[serde(flatten)]
    task: Task,
}

impl JsonlBackend {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let data_dir = data_dir.to_path_buf();
        fs::create_dir_all(&data_dir).map_err(|err| StoreError::io(&data_dir, err))?;

        let tasks_path = data_dir.join("tasks.data");
        let attachments_dir = data_dir.join("attachments");

        if !tasks_path.exists() {
            fs::write(&tasks_path, "").map_err(|err| StoreError::io(&tasks_path, err))?;
        }

        info!(
            data_dir = %data_dir.display(),
            tasks = %tasks_path.display(),
            "opened task store"
        );

        Ok(Self {
            data_dir,
            tasks_path,
            attachments_dir,
        })
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }

    fn load_records(&self) -> Result<Vec<TaskRecord>, StoreError> {
        load_jsonl(&self.tasks_path)
    }

    fn save_records(&self, records: &[TaskRecord]) -> Result<(), StoreError> {
        save_jsonl_atomic(&self.tasks_path, records)
    }
}

impl TaskBackend for JsonlBackend {
    #[tracing::instrument(skip(self))]
    fn list_by_owner(&self, owner: &str) -> Result<Vec<Task>, StoreError> {
        let tasks: Vec<Task> = self
            .load_records()?
            .into_iter()
            .filter(|record| record.owner == owner)
            .map(|record| record.task)
            .collect();
        debug!(count = tasks.len(), "listed tasks for owner");
        Ok(tasks)
    }

    #[tracing::instrument(skip(self, draft), fields(title = %draft.title))]
    fn create(&mut self, owner: &str, draft: TaskDraft, order: i64) -> Result<Task, StoreError> {
        draft.validate()?;
        let mut records = self.load_records()?;

        let mut id = TaskId::generate();
        while records.iter().any(|record| record.task.id == id) {
            id = TaskId::generate();
        }

        let task = draft.into_task(id, order);
        records.push(TaskRecord {
            owner: owner.to_string(),
            task: task.clone(),
        });
        self.save_records(&records)?;

        info!(id = %task.id, order, "created task record");
        Ok(task)
    }

    #[tracing::instrument(skip(self, id, patch), fields(id = %id))]
    fn update(&mut self, owner: &str, id: &TaskId, patch: &TaskPatch) -> Result<(), StoreError> {
        patch.validate()?;
        let mut records = self.load_records()?;
        let record = records
            .iter_mut()
            .find(|record| record.owner == owner && record.task.id == *id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        record.task.apply_patch(patch);
        self.save_records(&records)?;
        debug!("updated task record");
        Ok(())
    }

    #[tracing::instrument(skip(self, id), fields(id = %id))]
    fn delete(&mut self, owner: &str, id: &TaskId) -> Result<(), StoreError> {
        let mut records = self.load_records()?;
        let before = records.len();
        records.retain(|record| !(record.owner == owner && record.task.id == *id));
        if records.len() == before {
            return Err(StoreError::NotFound(id.clone()));
        }

        self.save_records(&records)?;
        info!("deleted task record");
        Ok(())
    }

    #[tracing::instrument(skip(self, path), fields(path = %path.display()))]
    fn upload_attachment(&mut self, owner: &str, path: &Path) -> Result<String, StoreError> {
        let owner_dir = self.attachments_dir.join(owner_segment(owner));
        fs::create_dir_all(&owner_dir).map_err(|err| StoreError::io(&owner_dir, err))?;

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "attachment".to_string());
        let target = owner_dir.join(format!("{}-{name}", TaskId::generate().short()));
        fs::copy(path, &target).map_err(|err| StoreError::io(path, err))?;

        info!(target = %target.display(), "stored attachment");
        Ok(format!("file://{}", target.display()))
    }

    #[tracing::instrument(skip(self))]
    fn remove_attachment(&mut self, owner: &str, reference: &str) -> Result<(), StoreError> {
        let owner_dir = self.attachments_dir.join(owner_segment(owner));
        let target = reference
            .strip_prefix("file://")
            .map(PathBuf::from)
            .filter(|path| path.parent() == Some(owner_dir.as_path()))
            .ok_or_else(|| StoreError::Persist {
                path: owner_dir.clone(),
                reason: format!("{reference} is not an attachment of this owner"),
            })?;

        fs::remove_file(&target).map_err(|err| StoreError::io(&target, err))?;
        info!(target = %target.display(), "removed attachment");
        Ok(())
    }
}

/// Directory name for an owner's attachments. Anything outside
/// `[A-Za-z0-9_-]` becomes `_`, so an owner id can never climb out of the
/// attachments directory.
fn owner_segment(owner: &str) -> String {
    let segment: String = owner
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if segment.is_empty() {
        "_".to_string()
    } else {
        segment
    }
}

#[tracing::instrument(skip(path))]
fn load_jsonl(path: &Path) -> Result<Vec<TaskRecord>, StoreError> {
    debug!(file = %path.display(), "loading jsonl");
    let file = fs::File::open(path).map_err(|err| StoreError::io(path, err))?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| StoreError::io(path, err))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let record: TaskRecord =
            serde_json::from_str(trimmed).map_err(|source| StoreError::Codec {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            })?;
        out.push(record);
    }

    debug!(count = out.len(), "loaded records from jsonl");
    Ok(out)
}

#[tracing::instrument(skip(path, records))]
fn save_jsonl_atomic(path: &Path, records: &[TaskRecord]) -> Result<(), StoreError> {
    debug!(file = %path.display(), count = records.len(), "saving jsonl atomically");

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir).map_err(|err| StoreError::io(dir, err))?;
    for record in records {
        let serialized = serde_json::to_string(record)?;
        writeln!(temp, "{serialized}").map_err(|err| StoreError::io(temp.path(), err))?;
    }
    temp.flush().map_err(|err| StoreError::io(path, err))?;

    temp.persist(path).map_err(|err| StoreError::Persist {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;

    Ok(())
}
