//! Collaborator contracts the engine talks to. Implementations own transport,
//! timeouts and authentication; the engine only sees `Result`s.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::ids::{BoardId, ColumnId, TagId, TaskId};
use crate::models::{
    Board, BoardDetail, ChangeEvent, Column, NewTask, Tag, TagColor, TagPatch, Task, TaskPatch,
};

/// Durable store for boards, columns, tasks and tags.
#[async_trait]
pub trait BoardBackend: Send + Sync {
    /// Creates the board together with the default "To Do" / "In Progress" /
    /// "Done" columns.
    async fn create_board(&self, title: &str) -> Result<Board>;

    /// Board with its columns in position order, each holding tasks in position order.
    async fn get_board(&self, board_id: BoardId) -> Result<BoardDetail>;

    /// Boards visible to the session user, most recently updated first.
    async fn list_boards(&self) -> Result<Vec<Board>>;

    /// Cascades to columns, tasks and tags.
    async fn delete_board(&self, board_id: BoardId) -> Result<()>;

    async fn create_column(&self, board_id: BoardId, title: &str, position: i32) -> Result<Column>;

    async fn update_column(&self, column_id: ColumnId, title: &str) -> Result<Column>;

    async fn delete_column(&self, column_id: ColumnId) -> Result<()>;

    /// Positions are taken from slice order.
    async fn reorder_columns(&self, board_id: BoardId, column_ids: &[ColumnId]) -> Result<()>;

    async fn create_task(&self, column_id: ColumnId, task: &NewTask, position: i32)
    -> Result<Task>;

    async fn update_task(&self, task_id: TaskId, patch: &TaskPatch) -> Result<Task>;

    async fn delete_task(&self, task_id: TaskId) -> Result<()>;

    /// Recomputes dense positions for both affected columns.
    async fn move_task(
        &self,
        task_id: TaskId,
        source_column_id: ColumnId,
        destination_column_id: ColumnId,
        destination_index: usize,
    ) -> Result<()>;

    async fn list_tags(&self, board_id: BoardId) -> Result<Vec<Tag>>;

    /// Fails with a conflict when the name or the color is taken on the board.
    async fn create_tag(&self, board_id: BoardId, name: &str, color: &TagColor) -> Result<Tag>;

    async fn update_tag(&self, tag_id: TagId, patch: &TagPatch) -> Result<Tag>;

    /// Cascades tag/task associations.
    async fn delete_tag(&self, tag_id: TagId) -> Result<()>;

    /// Full replace of a task's tag set; returns the resulting tags.
    async fn set_task_tags(&self, task_id: TaskId, tag_ids: &[TagId]) -> Result<Vec<Tag>>;
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSummary {
    pub id: ColumnId,
    pub title: String,
    pub task_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: TaskId,
    pub column_id: ColumnId,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentRequest {
    pub message: String,
    pub columns: Vec<ColumnSummary>,
    pub tasks: Vec<TaskSummary>,
}

/// Raw interpretation. `operation` is validated by the bridge, not trusted.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentReply {
    #[serde(default)]
    pub operation: Option<serde_json::Value>,
    pub response: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Natural-language to structured-operation translator.
#[async_trait]
pub trait IntentService: Send + Sync {
    async fn interpret(&self, request: &IntentRequest) -> Result<IntentReply>;
}

/// Source of collaborator edits. `None` means the feed is closed.
#[async_trait]
pub trait ChangeFeed: Send {
    async fn next_event(&mut self) -> Option<ChangeEvent>;
}

#[async_trait]
impl ChangeFeed for mpsc::Receiver<ChangeEvent> {
    async fn next_event(&mut self) -> Option<ChangeEvent> {
        self.recv().await
    }
}
