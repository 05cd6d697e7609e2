use std::str::FromStr;

use anyhow::anyhow;
use tracing::{debug, error, info, warn};

use crate::backend::{StoreError, TaskBackend};
use crate::reorder::{OrderUpdate, apply_updates, plan_reorder_all};
use crate::task::{Attachment, Status, Task, TaskDraft, TaskId, TaskPatch};

/// How a new task's `order` is picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderPolicy {
    /// One past the highest order among all tasks, whatever their status.
    #[default]
    Global,
    /// One past the highest order in the new task's own status.
    Partition,
}

impl FromStr for OrderPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(OrderPolicy::Global),
            "partition" | "status" => Ok(OrderPolicy::Partition),
            other => Err(anyhow!("invalid order.policy: {other}")),
        }
    }
}

/// A successful write, as merged into the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheMutation {
    Added(Task),
    Edited { id: TaskId, patch: TaskPatch },
    Removed(TaskId),
    Reordered(Vec<OrderUpdate>),
}

/// Outcome of a batch of independent writes.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub applied: Vec<TaskId>,
    pub failed: Vec<(TaskId, StoreError)>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Owns the local mirror of one owner's tasks and routes every mutation
/// through the backend first. The mirror only changes after a write has
/// succeeded.
#[derive(Debug)]
pub struct StoreAccessor<B> {
    backend: B,
    owner: String,
    policy: OrderPolicy,
    cache: Vec<Task>,
    stale: bool,
}

impl<B: TaskBackend> StoreAccessor<B> {
    pub fn new(backend: B, owner: impl Into<String>, policy: OrderPolicy) -> Self {
        Self {
            backend,
            owner: owner.into(),
            policy,
            cache: Vec::new(),
            stale: true,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn tasks(&self) -> &[Task] {
        &self.cache
    }

    pub fn find(&self, id: &TaskId) -> Option<&Task> {
        self.cache.iter().find(|task| task.id == *id)
    }

    /// True until the first fetch, and again after a batch partially failed.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Loads every record for the owner, sorted by `order` across all
    /// statuses, and replaces the cache with it.
    #[tracing::instrument(skip(self), fields(owner = %self.owner))]
    pub fn try_fetch_all(&mut self) -> Result<Vec<Task>, StoreError> {
        let mut tasks = self.backend.list_by_owner(&self.owner)?;
        tasks.sort_by_key(|task| task.order);
        self.cache = tasks.clone();
        self.stale = false;
        debug!(count = tasks.len(), "fetched tasks");
        Ok(tasks)
    }

    /// Like [`Self::try_fetch_all`] but a failed read is logged and yields an
    /// empty list. The cache keeps whatever it held before.
    pub fn fetch_all(&mut self) -> Vec<Task> {
        match self.try_fetch_all() {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(error = %err, "error fetching tasks");
                Vec::new()
            }
        }
    }

    pub fn reconcile(&mut self) -> Result<(), StoreError> {
        self.try_fetch_all()?;
        info!("cache reconciled with backend");
        Ok(())
    }

    pub fn next_order(&self, status: Status) -> i64 {
        let max = match self.policy {
            OrderPolicy::Global => self.cache.iter().map(|task| task.order).max(),
            OrderPolicy::Partition => self
                .cache
                .iter()
                .filter(|task| task.status == status)
                .map(|task| task.order)
                .max(),
        };
        max.unwrap_or(0) + 1
    }

    #[tracing::instrument(skip(self, draft), fields(owner = %self.owner, title = %draft.title))]
    pub fn add(&mut self, mut draft: TaskDraft) -> Result<Task, StoreError> {
        draft.validate()?;
        let was_local = matches!(draft.image, Some(Attachment::Local(_)));
        draft.image = self.persist_attachment(draft.image.take())?;
        let uploaded = match &draft.image {
            Some(Attachment::Remote(reference)) if was_local => Some(reference.clone()),
            _ => None,
        };

        let order = self.next_order(draft.status);
        let task = match self.backend.create(&self.owner, draft, order) {
            Ok(task) => task,
            Err(err) => {
                if let Some(reference) = uploaded {
                    self.discard_upload(&reference);
                }
                return Err(err);
            }
        };
        info!(id = %task.id, order, "task added");
        self.merge(CacheMutation::Added(task.clone()));
        Ok(task)
    }

    #[tracing::instrument(skip(self, id, patch), fields(owner = %self.owner, id = %id))]
    pub fn edit(&mut self, id: &TaskId, mut patch: TaskPatch) -> Result<(), StoreError> {
        patch.validate()?;
        if let Some(image) = patch.image.take() {
            patch.image = Some(self.persist_attachment(image)?);
        }

        self.backend.update(&self.owner, id, &patch)?;
        debug!("task updated");
        self.merge(CacheMutation::Edited {
            id: id.clone(),
            patch,
        });
        Ok(())
    }

    #[tracing::instrument(skip(self, id), fields(owner = %self.owner, id = %id))]
    pub fn remove(&mut self, id: &TaskId) -> Result<(), StoreError> {
        self.backend.delete(&self.owner, id)?;
        info!("task removed");
        self.merge(CacheMutation::Removed(id.clone()));
        Ok(())
    }

    /// Writes `order = index` for each id in turn.
    pub fn reorder_all(&mut self, ids_in_order: &[TaskId]) -> BatchReport {
        self.apply_order_updates(&plan_reorder_all(ids_in_order))
    }

    /// Issues one write per update. Successes are merged; failures are
    /// collected and leave the cache marked stale.
    #[tracing::instrument(skip(self, updates), fields(owner = %self.owner, count = updates.len()))]
    pub fn apply_order_updates(&mut self, updates: &[OrderUpdate]) -> BatchReport {
        let mut report = BatchReport::default();
        let mut merged = Vec::with_capacity(updates.len());

        for update in updates {
            let patch = TaskPatch {
                order: Some(update.order),
                status: update.status,
                ..TaskPatch::default()
            };
            match self.backend.update(&self.owner, &update.id, &patch) {
                Ok(()) => {
                    report.applied.push(update.id.clone());
                    merged.push(update.clone());
                }
                Err(err) => {
                    error!(id = %update.id, error = %err, "error reordering task");
                    report.failed.push((update.id.clone(), err));
                }
            }
        }

        self.merge(CacheMutation::Reordered(merged));
        self.note_batch(&report);
        report
    }

    /// Applies the same patch to several tasks, each independently.
    #[tracing::instrument(skip(self, ids, patch), fields(owner = %self.owner, count = ids.len()))]
    pub fn edit_many(&mut self, ids: &[TaskId], patch: &TaskPatch) -> BatchReport {
        let mut report = BatchReport::default();
        for id in ids {
            match self.edit(id, patch.clone()) {
                Ok(()) => report.applied.push(id.clone()),
                Err(err) => {
                    error!(id = %id, error = %err, "error updating task");
                    report.failed.push((id.clone(), err));
                }
            }
        }
        self.note_batch(&report);
        report
    }

    #[tracing::instrument(skip(self, ids), fields(owner = %self.owner, count = ids.len()))]
    pub fn remove_many(&mut self, ids: &[TaskId]) -> BatchReport {
        let mut report = BatchReport::default();
        for id in ids {
            match self.remove(id) {
                Ok(()) => report.applied.push(id.clone()),
                Err(err) => {
                    error!(id = %id, error = %err, "error deleting task");
                    report.failed.push((id.clone(), err));
                }
            }
        }
        self.note_batch(&report);
        report
    }

    fn note_batch(&mut self, report: &BatchReport) {
        if !report.is_complete() {
            self.stale = true;
            warn!(
                applied = report.applied.len(),
                failed = report.failed.len(),
                "batch partially failed; cache needs reconcile"
            );
        }
    }

    fn persist_attachment(
        &mut self,
        image: Option<Attachment>,
    ) -> Result<Option<Attachment>, StoreError> {
        match image {
            Some(Attachment::Local(path)) => {
                let reference = self.backend.upload_attachment(&self.owner, &path)?;
                Ok(Some(Attachment::Remote(reference)))
            }
            other => Ok(other),
        }
    }

    fn discard_upload(&mut self, reference: &str) {
        match self.backend.remove_attachment(&self.owner, reference) {
            Ok(()) => debug!(reference, "discarded unused upload"),
            Err(err) => warn!(reference, error = %err, "could not discard unused upload"),
        }
    }

    fn merge(&mut self, mutation: CacheMutation) {
        merge_into(&mut self.cache, mutation);
    }
}

/// The single place the cache changes shape.
pub fn merge_into(cache: &mut Vec<Task>, mutation: CacheMutation) {
    match mutation {
        CacheMutation::Added(task) => cache.push(task),
        CacheMutation::Edited { id, patch } => {
            if let Some(task) = cache.iter_mut().find(|task| task.id == id) {
                task.apply_patch(&patch);
            }
        }
        CacheMutation::Removed(id) => cache.retain(|task| task.id != id),
        CacheMutation::Reordered(updates) => apply_updates(cache, &updates),
    }
}
