use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::task::{Task, TaskDraft, TaskId, TaskPatch, ValidationError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("i/o failure on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed parsing {} line {line}: {source}", .path.display())]
    Codec {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed encoding task record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to persist {}: {reason}", .path.display())]
    Persist { path: PathBuf, reason: String },

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The remote document collection. Every call is scoped to one owner so a
/// signed-in identity only ever sees its own records.
pub trait TaskBackend {
    fn list_by_owner(&self, owner: &str) -> Result<Vec<Task>, StoreError>;

    /// Stores a new record and returns it with its backend-assigned id.
    fn create(&mut self, owner: &str, draft: TaskDraft, order: i64) -> Result<Task, StoreError>;

    fn update(&mut self, owner: &str, id: &TaskId, patch: &TaskPatch) -> Result<(), StoreError>;

    fn delete(&mut self, owner: &str, id: &TaskId) -> Result<(), StoreError>;

    /// Takes a copy of a local file and returns the reference to keep on the
    /// task.
    fn upload_attachment(&mut self, owner: &str, path: &Path) -> Result<String, StoreError>;

    /// Drops an upload that no task ended up referencing.
    fn remove_attachment(&mut self, owner: &str, reference: &str) -> Result<(), StoreError>;
}

impl<B: TaskBackend + ?Sized> TaskBackend for &mut B {
    fn list_by_owner(&self, owner: &str) -> Result<Vec<Task>, StoreError> {
        (**self).list_by_owner(owner)
    }

    fn create(&mut self, owner: &str, draft: TaskDraft, order: i64) -> Result<Task, StoreError> {
        (**self).create(owner, draft, order)
    }

    fn update(&mut self, owner: &str, id: &TaskId, patch: &TaskPatch) -> Result<(), StoreError> {
        (**self).update(owner, id, patch)
    }

    fn delete(&mut self, owner: &str, id: &TaskId) -> Result<(), StoreError> {
        (**self).delete(owner, id)
    }

    fn upload_attachment(&mut self, owner: &str, path: &Path) -> Result<String, StoreError> {
        (**self).upload_attachment(owner, path)
    }

    fn remove_attachment(&mut self, owner: &str, reference: &str) -> Result<(), StoreError> {
        (**self).remove_attachment(owner, reference)
    }
}

/// In-process backend. Supports injected failures so partial batch writes can
/// be exercised.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Vec<(String, Task)>,
    unavailable: bool,
    failing_creates: bool,
    failing_ids: BTreeSet<TaskId>,
    uploads: Vec<(String, String)>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail as if the network were down.
    pub fn set_unavailable(&mut self, unavailable: bool) {
        self.unavailable = unavailable;
    }

    /// Makes writes to one record fail.
    pub fn fail_writes_to(&mut self, id: TaskId) {
        self.failing_ids.insert(id);
    }

    /// Makes `create` fail while leaving uploads working.
    pub fn fail_creates(&mut self, fail: bool) {
        self.failing_creates = fail;
    }

    pub fn clear_failures(&mut self) {
        self.unavailable = false;
        self.failing_creates = false;
        self.failing_ids.clear();
    }

    /// References of stored uploads for one owner.
    pub fn uploads(&self, owner: &str) -> Vec<&str> {
        self.uploads
            .iter()
            .filter(|(o, _)| o == owner)
            .map(|(_, reference)| reference.as_str())
            .collect()
    }

    pub fn record(&self, owner: &str, id: &TaskId) -> Option<&Task> {
        self.records
            .iter()
            .find(|(o, task)| o == owner && task.id == *id)
            .map(|(_, task)| task)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("memory backend offline".to_string()));
        }
        Ok(())
    }

    fn check_writable(&self, id: &TaskId) -> Result<(), StoreError> {
        self.check_available()?;
        if self.failing_ids.contains(id) {
            return Err(StoreError::Unavailable(format!("write to {id} rejected")));
        }
        Ok(())
    }

    fn find_mut(&mut self, owner: &str, id: &TaskId) -> Result<&mut Task, StoreError> {
        self.records
            .iter_mut()
            .find(|(o, task)| o == owner && task.id == *id)
            .map(|(_, task)| task)
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }
}

impl TaskBackend for MemoryBackend {
    fn list_by_owner(&self, owner: &str) -> Result<Vec<Task>, StoreError> {
        self.check_available()?;
        Ok(self
            .records
            .iter()
            .filter(|(o, _)| o == owner)
            .map(|(_, task)| task.clone())
            .collect())
    }

    fn create(&mut self, owner: &str, draft: TaskDraft, order: i64) -> Result<Task, StoreError> {
        self.check_available()?;
        if self.failing_creates {
            return Err(StoreError::Unavailable("create rejected".to_string()));
        }
        draft.validate()?;
        let task = draft.into_task(TaskId::generate(), order);
        debug!(id = %task.id, owner, "memory create");
        self.records.push((owner.to_string(), task.clone()));
        Ok(task)
    }

    fn update(&mut self, owner: &str, id: &TaskId, patch: &TaskPatch) -> Result<(), StoreError> {
        self.check_writable(id)?;
        patch.validate()?;
        let task = self.find_mut(owner, id)?;
        task.apply_patch(patch);
        Ok(())
    }

    fn delete(&mut self, owner: &str, id: &TaskId) -> Result<(), StoreError> {
        self.check_writable(id)?;
        let before = self.records.len();
        self.records.retain(|(o, task)| !(o == owner && task.id == *id));
        if self.records.len() == before {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    fn upload_attachment(&mut self, owner: &str, path: &Path) -> Result<String, StoreError> {
        self.check_available()?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "attachment".to_string());
        let reference = format!("memory://{name}");
        self.uploads.push((owner.to_string(), reference.clone()));
        Ok(reference)
    }

    fn remove_attachment(&mut self, owner: &str, reference: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.uploads
            .retain(|(o, stored)| !(o == owner && stored == reference));
        Ok(())
    }
}
