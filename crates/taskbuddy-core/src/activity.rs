use chrono::{DateTime, Utc};

use crate::datetime::iso_timestamp;
use crate::task::{ActivityItem, Task, TaskPatch};

/// Builds the audit entries an edit produces, one per changed field, in a
/// fixed field order. Fields the patch sets to their current value produce
/// nothing.
pub fn describe_changes(task: &Task, patch: &TaskPatch, now: DateTime<Utc>) -> Vec<ActivityItem> {
    let mut messages = Vec::new();

    if let Some(title) = &patch.title
        && *title != task.title
    {
        messages.push(format!(
            "You changed title from \u{201c}{}\u{201d} to \u{201c}{}\u{201d}",
            task.title, title
        ));
    }

    if let Some(description) = &patch.description
        && description.as_deref().unwrap_or_default()
            != task.description.as_deref().unwrap_or_default()
    {
        messages.push("You updated the description".to_string());
    }

    if let Some(category) = patch.category
        && category != task.category
    {
        messages.push(format!(
            "You changed category from {} to {}",
            task.category, category
        ));
    }

    if let Some(due_date) = &patch.due_date
        && *due_date != task.due_date
    {
        messages.push(format!(
            "You changed due date from {} to {}",
            task.due_date, due_date
        ));
    }

    if let Some(status) = patch.status
        && status != task.status
    {
        messages.push(format!(
            "You changed status from {} to {}",
            task.status, status
        ));
    }

    match &patch.image {
        Some(Some(_)) => messages.push("You uploaded an attachment".to_string()),
        Some(None) if task.image.is_some() => {
            messages.push("You removed the attachment".to_string())
        }
        _ => {}
    }

    let timestamp = iso_timestamp(now);
    messages
        .into_iter()
        .map(|message| ActivityItem {
            message,
            timestamp: timestamp.clone(),
        })
        .collect()
}

/// Returns the patch with its audit entries attached.
pub fn with_activity(task: &Task, mut patch: TaskPatch, now: DateTime<Utc>) -> TaskPatch {
    let entries = describe_changes(task, &patch, now);
    patch.append_activity.extend(entries);
    patch
}
