use std::fmt;

use anyhow::anyhow;
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{LibError, Result};
use crate::ids::{BoardId, ColumnId, TagId, TaskId};

/// Columns a backend creates alongside every new board, in position order.
pub const DEFAULT_COLUMN_TITLES: [&str; 3] = ["To Do", "In Progress", "Done"];

pub fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub id: BoardId,
    pub title: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Board {
    /// Destructive deletion is confirmed by re-entering the exact title.
    pub fn confirms_deletion(&self, typed_title: &str) -> bool {
        !typed_title.is_empty() && typed_title == self.title
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: ColumnId,
    pub board_id: BoardId,
    pub title: String,
    pub position: i32,
    pub tasks: Vec<Task>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Column {
    pub fn record(&self) -> ColumnRecord {
        ColumnRecord {
            id: self.id,
            board_id: self.board_id,
            title: self.title.clone(),
            position: self.position,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub column_id: ColumnId,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    pub position: i32,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Task {
    pub fn apply_patch(&mut self, patch: &TaskPatch, updated_at: NaiveDateTime) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(assignee) = &patch.assignee {
            self.assignee = assignee.clone();
        }
        self.updated_at = updated_at;
    }

    pub fn record(&self) -> TaskRecord {
        TaskRecord {
            id: self.id,
            column_id: self.column_id,
            title: self.title.clone(),
            description: self.description.clone(),
            assignee: self.assignee.clone(),
            position: self.position,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn has_tag(&self, tag_id: TagId) -> bool {
        self.tags.iter().any(|tag| tag.id == tag_id)
    }

    /// Case-insensitive substring match over title, description and assignee.
    pub fn matches_text(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return false;
        }
        [
            Some(self.title.as_str()),
            self.description.as_deref(),
            self.assignee.as_deref(),
        ]
        .into_iter()
        .flatten()
        .any(|field| field.to_lowercase().contains(&needle))
    }
}

/// Six hex digit color, stored as `#RRGGBB`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagColor(String);

impl TagColor {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let digits = trimmed.strip_prefix('#').unwrap_or(trimmed);
        if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(LibError::validation_with_code(
                "invalid_tag_color",
                "Tag color must be a 6 digit hex code",
                anyhow!("invalid tag color {:?}", raw),
            ));
        }
        Ok(Self(format!("#{}", digits.to_ascii_uppercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TagColor {
    type Error = LibError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TagColor> for String {
    fn from(value: TagColor) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: TagId,
    pub board_id: BoardId,
    pub name: String,
    pub color: TagColor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardDetail {
    pub board: Board,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
}

impl NewTask {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn normalize(self) -> Result<Self> {
        let title = normalize_title(&self.title, "Task title is required")?;
        Ok(Self {
            title,
            description: non_blank(self.description),
            assignee: non_blank(self.assignee),
        })
    }
}

/// Partial task update. The outer `Option` on `description`/`assignee` means
/// "leave as is", the inner one allows clearing the field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub assignee: Option<Option<String>>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.assignee.is_none()
    }

    pub fn normalize(self) -> Result<Self> {
        if self.is_empty() {
            return Err(LibError::validation(
                "No task fields to update",
                anyhow!("empty task patch"),
            ));
        }
        let title = match self.title {
            Some(title) => Some(normalize_title(&title, "Task title is required")?),
            None => None,
        };
        Ok(Self {
            title,
            description: self.description.map(non_blank),
            assignee: self.assignee.map(non_blank),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<TagColor>,
}

impl TagPatch {
    pub fn normalize(self) -> Result<Self> {
        if self.name.is_none() && self.color.is_none() {
            return Err(LibError::validation(
                "No tag fields to update",
                anyhow!("empty tag patch"),
            ));
        }
        let name = match self.name {
            Some(name) => Some(normalize_title(&name, "Tag name is required")?),
            None => None,
        };
        Ok(Self {
            name,
            color: self.color,
        })
    }

    pub fn apply_to(&self, tag: &mut Tag) {
        if let Some(name) = &self.name {
            tag.name = name.clone();
        }
        if let Some(color) = &self.color {
            tag.color = color.clone();
        }
    }
}

/// Result of a drag gesture: the task, where it was, and where it was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMove {
    pub task_id: TaskId,
    pub source_column_id: ColumnId,
    pub destination_column_id: ColumnId,
    pub destination_index: usize,
}

impl TaskMove {
    pub fn is_cross_column(&self) -> bool {
        self.source_column_id != self.destination_column_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnRecord {
    pub id: ColumnId,
    pub board_id: BoardId,
    pub title: String,
    pub position: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Task row as it appears on the change feed (tag membership travels separately).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    pub column_id: ColumnId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    pub position: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl TaskRecord {
    pub fn into_task(self, tags: Vec<Tag>) -> Task {
        Task {
            id: self.id,
            column_id: self.column_id,
            title: self.title,
            description: self.description,
            assignee: self.assignee,
            position: self.position,
            tags,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entityKind", rename_all = "snake_case")]
pub enum EntityChange {
    Board {
        #[serde(rename = "eventKind")]
        event: ChangeKind,
        new: Option<Board>,
        old: Option<Board>,
    },
    Column {
        #[serde(rename = "eventKind")]
        event: ChangeKind,
        new: Option<ColumnRecord>,
        old: Option<ColumnRecord>,
    },
    Task {
        #[serde(rename = "eventKind")]
        event: ChangeKind,
        new: Option<TaskRecord>,
        old: Option<TaskRecord>,
    },
    Tag {
        #[serde(rename = "eventKind")]
        event: ChangeKind,
        new: Option<Tag>,
        old: Option<Tag>,
    },
}

/// One collaborator edit, scoped to the board it happened on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub board_id: BoardId,
    pub change: EntityChange,
}

pub(crate) fn normalize_title(raw: &str, public: &'static str) -> Result<String> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(LibError::validation(public, anyhow!("blank title")));
    }
    Ok(title.to_string())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn double_option<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
