//! Drag-and-drop reordering.
//!
//! `order` is only compared between tasks of the same status. A drop is
//! turned into a plan: the affected partition is laid out again as
//! `order = index` and only the records whose value changes are written.
//! The partition a task leaves is never renumbered and may keep a gap.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use tracing::debug;

use crate::task::{Status, Task, TaskId};

/// One record write produced by a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderUpdate {
    pub id: TaskId,
    pub order: i64,
    pub status: Option<Status>,
}

/// A draggable item. Board cards are addressed as `STATUS|id`, list rows by
/// bare id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DragHandle {
    pub status: Option<Status>,
    pub id: TaskId,
}

impl DragHandle {
    pub fn row(id: TaskId) -> Self {
        Self { status: None, id }
    }

    pub fn card(task: &Task) -> Self {
        Self {
            status: Some(task.status),
            id: task.id.clone(),
        }
    }
}

impl fmt::Display for DragHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{status}|{}", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

impl FromStr for DragHandle {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let (status, id) = match raw.split_once('|') {
            Some((status, id)) => (Some(status.parse::<Status>()?), id.trim()),
            None => (None, raw),
        };
        if id.is_empty() {
            return Err(anyhow!("drag handle has no task id: {s}"));
        }
        Ok(Self {
            status,
            id: TaskId::new(id),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropTarget {
    /// Dropped onto another task; takes that task's slot.
    Task(DragHandle),
    /// Dropped onto a column itself; goes to the end of it.
    Partition(Status),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DragEnd {
    pub active: DragHandle,
    pub over: Option<DropTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorderPlan {
    Noop,
    SamePartition(Vec<OrderUpdate>),
    CrossPartition(Vec<OrderUpdate>),
}

impl ReorderPlan {
    pub fn updates(&self) -> &[OrderUpdate] {
        match self {
            ReorderPlan::Noop => &[],
            ReorderPlan::SamePartition(updates) | ReorderPlan::CrossPartition(updates) => updates,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.updates().is_empty()
    }
}

/// Tasks of one status ordered by `order`; ties keep their input order.
pub fn partition_sorted(tasks: &[Task], status: Status) -> Vec<&Task> {
    let mut column: Vec<&Task> = tasks.iter().filter(|task| task.status == status).collect();
    column.sort_by_key(|task| task.order);
    column
}

/// Turns a finished drag into the writes that realise it. Unknown ids,
/// self-drops and drops outside any target plan nothing.
#[tracing::instrument(skip(tasks, event), fields(active = %event.active))]
pub fn plan_drag(tasks: &[Task], event: &DragEnd) -> ReorderPlan {
    let Some(over) = &event.over else {
        return ReorderPlan::Noop;
    };
    let Some(dragged) = tasks.iter().find(|task| task.id == event.active.id) else {
        debug!("dragged task not in cache");
        return ReorderPlan::Noop;
    };

    match over {
        DropTarget::Task(handle) => {
            if handle.id == dragged.id {
                return ReorderPlan::Noop;
            }
            let Some(target) = tasks.iter().find(|task| task.id == handle.id) else {
                debug!(over = %handle, "drop target not in cache");
                return ReorderPlan::Noop;
            };
            if target.status == dragged.status {
                plan_same_partition(tasks, dragged, Some(&target.id))
            } else {
                plan_cross_partition(tasks, dragged, target.status, Some(&target.id))
            }
        }
        DropTarget::Partition(status) => {
            if *status == dragged.status {
                plan_same_partition(tasks, dragged, None)
            } else {
                plan_cross_partition(tasks, dragged, *status, None)
            }
        }
    }
}

/// Moves `dragged` onto the slot of `target` (or the last slot) inside its
/// own partition.
fn plan_same_partition(tasks: &[Task], dragged: &Task, target: Option<&TaskId>) -> ReorderPlan {
    let mut column = partition_sorted(tasks, dragged.status);
    let Some(old_index) = column.iter().position(|task| task.id == dragged.id) else {
        return ReorderPlan::Noop;
    };
    let new_index = match target {
        Some(id) => match column.iter().position(|task| task.id == *id) {
            Some(index) => index,
            None => return ReorderPlan::Noop,
        },
        None => column.len() - 1,
    };

    let moved = column.remove(old_index);
    column.insert(new_index, moved);

    let updates = renumber(&column, None);
    debug!(
        status = %dragged.status,
        old_index,
        new_index,
        writes = updates.len(),
        "planned same-partition move"
    );
    if updates.is_empty() {
        ReorderPlan::Noop
    } else {
        ReorderPlan::SamePartition(updates)
    }
}

/// Moves `dragged` into `status` at the slot of `target`, or at the end.
fn plan_cross_partition(
    tasks: &[Task],
    dragged: &Task,
    status: Status,
    target: Option<&TaskId>,
) -> ReorderPlan {
    let mut column = partition_sorted(tasks, status);
    let index = match target {
        Some(id) => match column.iter().position(|task| task.id == *id) {
            Some(index) => index,
            None => return ReorderPlan::Noop,
        },
        None => column.len(),
    };
    column.insert(index, dragged);

    let updates = renumber(&column, Some((&dragged.id, status)));
    debug!(
        from = %dragged.status,
        to = %status,
        index,
        writes = updates.len(),
        "planned cross-partition move"
    );
    ReorderPlan::CrossPartition(updates)
}

fn renumber(column: &[&Task], moved: Option<(&TaskId, Status)>) -> Vec<OrderUpdate> {
    column
        .iter()
        .enumerate()
        .filter_map(|(index, task)| {
            let order = index as i64;
            match moved {
                Some((id, status)) if task.id == *id => Some(OrderUpdate {
                    id: task.id.clone(),
                    order,
                    status: Some(status),
                }),
                _ if task.order != order => Some(OrderUpdate {
                    id: task.id.clone(),
                    order,
                    status: None,
                }),
                _ => None,
            }
        })
        .collect()
}

/// `order = index` for each listed id, regardless of status.
pub fn plan_reorder_all(ids_in_order: &[TaskId]) -> Vec<OrderUpdate> {
    ids_in_order
        .iter()
        .enumerate()
        .map(|(index, id)| OrderUpdate {
            id: id.clone(),
            order: index as i64,
            status: None,
        })
        .collect()
}

/// Applies updates to an in-memory task list. Ids that are not present are
/// skipped.
pub fn apply_updates(tasks: &mut [Task], updates: &[OrderUpdate]) {
    for update in updates {
        if let Some(task) = tasks.iter_mut().find(|task| task.id == update.id) {
            task.order = update.order;
            if let Some(status) = update.status {
                task.status = status;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::task::TaskDraft;

    fn task(id: &str, status: Status, order: i64) -> Task {
        TaskDraft::new(id.to_uppercase(), "2024-06-01T00:00:00.000Z")
            .with_status(status)
            .into_task(TaskId::new(id), order)
    }

    fn drag(active: &str, over: &str) -> DragEnd {
        DragEnd {
            active: DragHandle::row(TaskId::new(active)),
            over: Some(DropTarget::Task(DragHandle::row(TaskId::new(over)))),
        }
    }

    fn layout(tasks: &[Task], status: Status) -> Vec<(String, i64)> {
        partition_sorted(tasks, status)
            .into_iter()
            .map(|task| (task.id.to_string(), task.order))
            .collect()
    }

    fn board() -> Vec<Task> {
        vec![
            task("a", Status::Todo, 0),
            task("b", Status::Todo, 1),
            task("c", Status::Todo, 2),
            task("x", Status::InProgress, 0),
            task("y", Status::InProgress, 1),
            task("z", Status::InProgress, 2),
            task("done", Status::Completed, 7),
        ]
    }

    #[test]
    fn dragging_last_onto_first_rotates_partition() {
        let mut tasks = board();
        let plan = plan_drag(&tasks, &drag("c", "a"));
        assert!(matches!(plan, ReorderPlan::SamePartition(_)));

        apply_updates(&mut tasks, plan.updates());
        assert_eq!(
            layout(&tasks, Status::Todo),
            vec![
                ("c".to_string(), 0),
                ("a".to_string(), 1),
                ("b".to_string(), 2),
            ]
        );
    }

    #[test]
    fn same_partition_move_shifts_only_the_span() {
        let mut tasks: Vec<Task> = (0..6)
            .map(|i| task(&format!("t{i}"), Status::Todo, i))
            .collect();
        let before = tasks.clone();

        let plan = plan_drag(&tasks, &drag("t1", "t4"));
        let written: Vec<&str> = plan.updates().iter().map(|u| u.id.as_str()).collect();
        assert_eq!(written, vec!["t2", "t3", "t4", "t1"]);

        apply_updates(&mut tasks, plan.updates());
        let order_of = |set: &[Task], id: &str| {
            set.iter()
                .find(|task| task.id.as_str() == id)
                .map(|task| task.order)
                .unwrap()
        };
        assert_eq!(order_of(&tasks, "t1"), 4);
        for id in ["t2", "t3", "t4"] {
            assert_eq!(order_of(&tasks, id), order_of(&before, id) - 1);
        }
        for id in ["t0", "t5"] {
            assert_eq!(order_of(&tasks, id), order_of(&before, id));
        }
    }

    #[test]
    fn uninvolved_pairs_keep_relative_order() {
        let mut tasks = board();
        let plan = plan_drag(&tasks, &drag("a", "c"));
        apply_updates(&mut tasks, plan.updates());

        let b = tasks.iter().find(|t| t.id.as_str() == "b").unwrap().order;
        let c = tasks.iter().find(|t| t.id.as_str() == "c").unwrap().order;
        assert!(b < c);
    }

    #[test]
    fn cross_partition_inserts_and_shifts_target_only() {
        let mut tasks = board();
        let plan = plan_drag(&tasks, &drag("b", "y"));
        assert!(matches!(plan, ReorderPlan::CrossPartition(_)));

        apply_updates(&mut tasks, plan.updates());
        let moved = tasks.iter().find(|t| t.id.as_str() == "b").unwrap();
        assert_eq!(moved.status, Status::InProgress);
        assert_eq!(moved.order, 1);

        assert_eq!(
            layout(&tasks, Status::InProgress),
            vec![
                ("x".to_string(), 0),
                ("b".to_string(), 1),
                ("y".to_string(), 2),
                ("z".to_string(), 3),
            ]
        );
        // source keeps its gap
        assert_eq!(
            layout(&tasks, Status::Todo),
            vec![("a".to_string(), 0), ("c".to_string(), 2)]
        );
    }

    #[test]
    fn dropping_on_column_appends() {
        let mut tasks = board();
        let plan = plan_drag(
            &tasks,
            &DragEnd {
                active: DragHandle::row(TaskId::new("a")),
                over: Some(DropTarget::Partition(Status::Completed)),
            },
        );
        assert_eq!(
            plan.updates(),
            &[
                OrderUpdate {
                    id: TaskId::new("done"),
                    order: 0,
                    status: None,
                },
                OrderUpdate {
                    id: TaskId::new("a"),
                    order: 1,
                    status: Some(Status::Completed),
                },
            ]
        );
        apply_updates(&mut tasks, plan.updates());
        assert_eq!(layout(&tasks, Status::Completed).len(), 2);
    }

    #[test]
    fn degenerate_drops_are_noops() {
        let tasks = board();
        assert_eq!(plan_drag(&tasks, &drag("a", "a")), ReorderPlan::Noop);
        assert_eq!(plan_drag(&tasks, &drag("missing", "a")), ReorderPlan::Noop);
        assert_eq!(plan_drag(&tasks, &drag("a", "missing")), ReorderPlan::Noop);
        assert_eq!(
            plan_drag(
                &tasks,
                &DragEnd {
                    active: DragHandle::row(TaskId::new("a")),
                    over: None,
                }
            ),
            ReorderPlan::Noop
        );
    }

    #[test]
    fn handles_round_trip_through_text() {
        let handle: DragHandle = "IN-PROGRESS|abc123".parse().unwrap();
        assert_eq!(handle.status, Some(Status::InProgress));
        assert_eq!(handle.id.as_str(), "abc123");
        assert_eq!(handle.to_string(), "IN-PROGRESS|abc123");

        let bare: DragHandle = "abc123".parse().unwrap();
        assert_eq!(bare.status, None);
        assert!("TO-DO|".parse::<DragHandle>().is_err());
        assert!("LATER|abc".parse::<DragHandle>().is_err());
    }

    #[test]
    fn reorder_all_assigns_positions() {
        let ids = vec![TaskId::new("z"), TaskId::new("a")];
        let updates = plan_reorder_all(&ids);
        assert_eq!(updates[0].order, 0);
        assert_eq!(updates[1].id.as_str(), "a");
        assert_eq!(updates[1].order, 1);
    }
}
