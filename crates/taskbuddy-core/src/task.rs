use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Longest description accepted, counted in characters.
pub const DESCRIPTION_LIMIT: usize = 300;

/// Opaque record identifier handed out by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "TO-DO")]
    Todo,
    #[serde(rename = "IN-PROGRESS")]
    InProgress,
    #[serde(rename = "COMPLETED")]
    Completed,
}

impl Status {
    pub const ALL: [Status; 3] = [Status::Todo, Status::InProgress, Status::Completed];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Todo => "TO-DO",
            Status::InProgress => "IN-PROGRESS",
            Status::Completed => "COMPLETED",
        }
    }

    /// Column heading used by the board.
    pub fn label(self) -> &'static str {
        match self {
            Status::Todo => "TO DO",
            Status::InProgress => "IN PROGRESS",
            Status::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "to-do" | "todo" | "to_do" => Ok(Status::Todo),
            "in-progress" | "inprogress" | "in_progress" | "progress" => Ok(Status::InProgress),
            "completed" | "complete" | "done" => Ok(Status::Completed),
            other => Err(anyhow!("unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Work,
    Personal,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Work, Category::Personal];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Work => "Work",
            Category::Personal => "Personal",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "work" => Ok(Category::Work),
            "personal" => Ok(Category::Personal),
            other => Err(anyhow!("unknown category: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityItem {
    pub message: String,
    pub timestamp: String,
}

/// Image reference. `Local` only exists until the backend has taken a copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Attachment {
    Remote(String),
    Local(PathBuf),
}

impl Attachment {
    pub fn is_local(&self) -> bool {
        matches!(self, Attachment::Local(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("task title cannot be empty")]
    EmptyTitle,
    #[error("due date cannot be empty")]
    EmptyDueDate,
    #[error("description is {len} characters; the limit is {DESCRIPTION_LIMIT}")]
    DescriptionTooLong { len: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    pub title: String,

    #[serde(rename = "dueDate")]
    pub due_date: String,

    pub status: Status,

    pub category: Category,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Attachment>,

    #[serde(default)]
    pub order: i64,

    #[serde(default)]
    pub activity: Vec<ActivityItem>,
}

impl Task {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_fields(&self.title, &self.due_date, self.description.as_deref())
    }

    /// Merges a partial update. Activity is only ever extended.
    pub fn apply_patch(&mut self, patch: &TaskPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(due_date) = &patch.due_date {
            self.due_date = due_date.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(category) = patch.category {
            self.category = category;
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(image) = &patch.image {
            self.image = image.clone();
        }
        if let Some(order) = patch.order {
            self.order = order;
        }
        self.activity.extend(patch.append_activity.iter().cloned());
    }
}

/// A task as the user submits it, before the backend assigns an id and the
/// accessor assigns an order.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDraft {
    pub title: String,
    pub due_date: String,
    pub status: Status,
    pub category: Category,
    pub description: Option<String>,
    pub image: Option<Attachment>,
}

impl TaskDraft {
    pub fn new(title: impl Into<String>, due_date: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            due_date: due_date.into(),
            status: Status::Todo,
            category: Category::Work,
            description: None,
            image: None,
        }
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        let description = description.into().trim().to_string();
        self.description = (!description.is_empty()).then_some(description);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_fields(&self.title, &self.due_date, self.description.as_deref())
    }

    pub fn into_task(self, id: TaskId, order: i64) -> Task {
        Task {
            id,
            title: self.title,
            due_date: self.due_date,
            status: self.status,
            category: self.category,
            description: self.description,
            image: self.image,
            order,
            activity: vec![],
        }
    }
}

/// Partial update. `None` leaves a field alone; nested options clear it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub due_date: Option<String>,
    pub status: Option<Status>,
    pub category: Option<Category>,
    pub description: Option<Option<String>>,
    pub image: Option<Option<Attachment>>,
    pub order: Option<i64>,
    pub append_activity: Vec<ActivityItem>,
}

impl TaskPatch {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn order(order: i64) -> Self {
        Self {
            order: Some(order),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(title) = &self.title
            && title.trim().is_empty()
        {
            return Err(ValidationError::EmptyTitle);
        }
        if let Some(due_date) = &self.due_date
            && due_date.trim().is_empty()
        {
            return Err(ValidationError::EmptyDueDate);
        }
        if let Some(Some(description)) = &self.description {
            check_description(description)?;
        }
        Ok(())
    }
}

fn validate_fields(
    title: &str,
    due_date: &str,
    description: Option<&str>,
) -> Result<(), ValidationError> {
    if title.trim().is_empty() {
        return Err(ValidationError::EmptyTitle);
    }
    if due_date.trim().is_empty() {
        return Err(ValidationError::EmptyDueDate);
    }
    if let Some(description) = description {
        check_description(description)?;
    }
    Ok(())
}

fn check_description(description: &str) -> Result<(), ValidationError> {
    let len = description.chars().count();
    if len > DESCRIPTION_LIMIT {
        return Err(ValidationError::DescriptionTooLong { len });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Task {
        TaskDraft::new("Write report", "2024-06-01T00:00:00.000Z").into_task(TaskId::new("a1"), 3)
    }

    #[test]
    fn status_uses_wire_names() {
        let json = serde_json::to_string(&Status::InProgress).unwrap();
        assert_eq!(json, "\"IN-PROGRESS\"");
        let back: Status = serde_json::from_str("\"TO-DO\"").unwrap();
        assert_eq!(back, Status::Todo);
        assert_eq!("done".parse::<Status>().unwrap(), Status::Completed);
        assert!("later".parse::<Status>().is_err());
    }

    #[test]
    fn task_serializes_due_date_in_camel_case() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["dueDate"], "2024-06-01T00:00:00.000Z");
        assert_eq!(value["category"], "Work");
        assert!(value.get("description").is_none());
    }

    #[test]
    fn patch_appends_activity_and_keeps_history() {
        let mut task = sample();
        task.activity.push(ActivityItem {
            message: "first".to_string(),
            timestamp: "t0".to_string(),
        });

        let patch = TaskPatch {
            title: Some("Write final report".to_string()),
            append_activity: vec![ActivityItem {
                message: "second".to_string(),
                timestamp: "t1".to_string(),
            }],
            ..TaskPatch::default()
        };
        task.apply_patch(&patch);

        assert_eq!(task.title, "Write final report");
        assert_eq!(task.order, 3);
        let messages: Vec<&str> = task.activity.iter().map(|a| a.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }

    #[test]
    fn validation_rejects_blank_title_and_long_description() {
        assert_eq!(
            TaskDraft::new("  ", "2024-06-01").validate(),
            Err(ValidationError::EmptyTitle)
        );
        assert_eq!(
            TaskDraft::new("x", "").validate(),
            Err(ValidationError::EmptyDueDate)
        );

        let long = "é".repeat(DESCRIPTION_LIMIT + 1);
        let draft = TaskDraft::new("x", "2024-06-01").with_description(long);
        assert_eq!(
            draft.validate(),
            Err(ValidationError::DescriptionTooLong {
                len: DESCRIPTION_LIMIT + 1
            })
        );

        let exact = "é".repeat(DESCRIPTION_LIMIT);
        assert!(
            TaskDraft::new("x", "2024-06-01")
                .with_description(exact)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn patch_validation_only_checks_present_fields() {
        assert!(TaskPatch::order(4).validate().is_ok());
        let patch = TaskPatch {
            title: Some(String::new()),
            ..TaskPatch::default()
        };
        assert_eq!(patch.validate(), Err(ValidationError::EmptyTitle));
    }
}
