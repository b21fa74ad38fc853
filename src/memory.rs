//! Process-local `BoardBackend`.
//!
//! Keeps the same ordering and uniqueness rules as the Postgres backend, and can
//! be told to fail or to hold specific calls so outages and slow round trips can
//! be reproduced deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::backend::BoardBackend;
use crate::error::{LibError, Result};
use crate::ids::{BoardId, ColumnId, TagId, TaskId, new_id};
use crate::models::{
    Board, BoardDetail, Column, DEFAULT_COLUMN_TITLES, NewTask, Tag, TagColor, TagPatch, Task,
    TaskPatch, now,
};
use crate::reorder::{clamp_insert_index, move_across, move_within, reassign_positions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendCall {
    CreateBoard,
    GetBoard,
    ListBoards,
    DeleteBoard,
    CreateColumn,
    UpdateColumn,
    DeleteColumn,
    ReorderColumns,
    CreateTask,
    UpdateTask,
    DeleteTask,
    MoveTask,
    ListTags,
    CreateTag,
    UpdateTag,
    DeleteTag,
    SetTaskTags,
}

#[derive(Debug, Default)]
struct MemoryData {
    boards: Vec<Board>,
    /// Per board, in position order.
    columns: HashMap<BoardId, Vec<Column>>,
    tags: Vec<Tag>,
}

impl MemoryData {
    fn board_columns(&mut self, board_id: BoardId) -> Result<&mut Vec<Column>> {
        self.columns
            .get_mut(&board_id)
            .ok_or_else(|| LibError::not_found("Board not found", anyhow!("board {}", board_id)))
    }

    fn column_mut(&mut self, column_id: ColumnId) -> Result<&mut Column> {
        self.columns
            .values_mut()
            .flat_map(|columns| columns.iter_mut())
            .find(|column| column.id == column_id)
            .ok_or_else(|| {
                LibError::not_found("Column not found", anyhow!("column {}", column_id))
            })
    }

    fn task_mut(&mut self, task_id: TaskId) -> Result<&mut Task> {
        self.columns
            .values_mut()
            .flat_map(|columns| columns.iter_mut())
            .flat_map(|column| column.tasks.iter_mut())
            .find(|task| task.id == task_id)
            .ok_or_else(|| LibError::not_found("Task not found", anyhow!("task {}", task_id)))
    }

    fn board_of_column(&self, column_id: ColumnId) -> Option<BoardId> {
        self.columns.iter().find_map(|(board_id, columns)| {
            columns
                .iter()
                .any(|column| column.id == column_id)
                .then_some(*board_id)
        })
    }

    fn ensure_tag_unique(
        &self,
        board_id: BoardId,
        name: &str,
        color: &TagColor,
        except: Option<TagId>,
    ) -> Result<()> {
        let siblings = self
            .tags
            .iter()
            .filter(|tag| tag.board_id == board_id && Some(tag.id) != except);
        for tag in siblings {
            if tag.name == name {
                return Err(LibError::conflict_name(anyhow!(
                    "tag name {:?} already used on board {}",
                    name,
                    board_id
                )));
            }
            if &tag.color == color {
                return Err(LibError::conflict_color(anyhow!(
                    "tag color {} already used on board {}",
                    color,
                    board_id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<MemoryData>,
    calls: Mutex<Vec<BackendCall>>,
    failures: Mutex<HashMap<BackendCall, VecDeque<LibError>>>,
    holds: Mutex<HashMap<BackendCall, VecDeque<Arc<Notify>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `call` fails with `err` after being recorded.
    pub async fn fail_next(&self, call: BackendCall, err: LibError) {
        self.failures
            .lock()
            .await
            .entry(call)
            .or_default()
            .push_back(err);
    }

    /// The next `call` parks until the returned handle is notified. Repeated
    /// holds on one call queue up and park successive calls in order.
    pub async fn hold(&self, call: BackendCall) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.holds
            .lock()
            .await
            .entry(call)
            .or_default()
            .push_back(Arc::clone(&gate));
        gate
    }

    pub async fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().await.clone()
    }

    pub async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }

    /// Seeds a board without going through the call log. Each entry is a column
    /// title and the titles of its tasks.
    pub async fn seed_board(&self, title: &str, columns: &[(&str, &[&str])]) -> BoardDetail {
        let timestamp = now();
        let board = Board {
            id: new_id(),
            title: title.to_string(),
            created_at: timestamp,
            updated_at: timestamp,
        };
        let columns: Vec<Column> = columns
            .iter()
            .enumerate()
            .map(|(position, (column_title, task_titles))| {
                let column_id: ColumnId = new_id();
                Column {
                    id: column_id,
                    board_id: board.id,
                    title: column_title.to_string(),
                    position: position as i32,
                    tasks: task_titles
                        .iter()
                        .enumerate()
                        .map(|(index, task_title)| Task {
                            id: new_id(),
                            column_id,
                            title: task_title.to_string(),
                            description: None,
                            assignee: None,
                            position: index as i32,
                            tags: vec![],
                            created_at: timestamp,
                            updated_at: timestamp,
                        })
                        .collect(),
                    created_at: timestamp,
                    updated_at: timestamp,
                }
            })
            .collect();

        let mut data = self.data.lock().await;
        data.boards.push(board.clone());
        data.columns.insert(board.id, columns.clone());
        BoardDetail { board, columns }
    }

    pub async fn seed_tag(&self, board_id: BoardId, name: &str, color: &str) -> Result<Tag> {
        let color = TagColor::parse(color)?;
        let mut data = self.data.lock().await;
        data.ensure_tag_unique(board_id, name, &color, None)?;
        let tag = Tag {
            id: new_id(),
            board_id,
            name: name.to_string(),
            color,
        };
        data.tags.push(tag.clone());
        Ok(tag)
    }

    /// Current durable copy of a board.
    pub async fn snapshot(&self, board_id: BoardId) -> Option<BoardDetail> {
        let data = self.data.lock().await;
        let board = data.boards.iter().find(|board| board.id == board_id)?.clone();
        let columns = data.columns.get(&board_id).cloned().unwrap_or_default();
        Some(BoardDetail { board, columns })
    }

    async fn checkpoint(&self, call: BackendCall) -> Result<()> {
        // Claim the gate before logging so a logged call owns its hold.
        let gate = self
            .holds
            .lock()
            .await
            .get_mut(&call)
            .and_then(VecDeque::pop_front);
        self.calls.lock().await.push(call);
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let failure = self
            .failures
            .lock()
            .await
            .get_mut(&call)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BoardBackend for MemoryBackend {
    async fn create_board(&self, title: &str) -> Result<Board> {
        self.checkpoint(BackendCall::CreateBoard).await?;
        let timestamp = now();
        let board = Board {
            id: new_id(),
            title: title.to_string(),
            created_at: timestamp,
            updated_at: timestamp,
        };
        let columns = DEFAULT_COLUMN_TITLES
            .iter()
            .enumerate()
            .map(|(position, column_title)| Column {
                id: new_id(),
                board_id: board.id,
                title: column_title.to_string(),
                position: position as i32,
                tasks: vec![],
                created_at: timestamp,
                updated_at: timestamp,
            })
            .collect();

        let mut data = self.data.lock().await;
        data.boards.push(board.clone());
        data.columns.insert(board.id, columns);
        Ok(board)
    }

    async fn get_board(&self, board_id: BoardId) -> Result<BoardDetail> {
        self.checkpoint(BackendCall::GetBoard).await?;
        self.snapshot(board_id)
            .await
            .ok_or_else(|| LibError::not_found("Board not found", anyhow!("board {}", board_id)))
    }

    async fn list_boards(&self) -> Result<Vec<Board>> {
        self.checkpoint(BackendCall::ListBoards).await?;
        let mut boards = self.data.lock().await.boards.clone();
        boards.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(boards)
    }

    async fn delete_board(&self, board_id: BoardId) -> Result<()> {
        self.checkpoint(BackendCall::DeleteBoard).await?;
        let mut data = self.data.lock().await;
        let before = data.boards.len();
        data.boards.retain(|board| board.id != board_id);
        if data.boards.len() == before {
            return Err(LibError::not_found(
                "Board not found",
                anyhow!("board {}", board_id),
            ));
        }
        data.columns.remove(&board_id);
        data.tags.retain(|tag| tag.board_id != board_id);
        Ok(())
    }

    async fn create_column(&self, board_id: BoardId, title: &str, position: i32) -> Result<Column> {
        self.checkpoint(BackendCall::CreateColumn).await?;
        let mut data = self.data.lock().await;
        let columns = data.board_columns(board_id)?;
        let timestamp = now();
        let column = Column {
            id: new_id(),
            board_id,
            title: title.to_string(),
            position,
            tasks: vec![],
            created_at: timestamp,
            updated_at: timestamp,
        };
        let index = clamp_insert_index(position.max(0) as usize, columns.len());
        columns.insert(index, column.clone());
        reassign_positions(columns);
        Ok(Column {
            position: index as i32,
            ..column
        })
    }

    async fn update_column(&self, column_id: ColumnId, title: &str) -> Result<Column> {
        self.checkpoint(BackendCall::UpdateColumn).await?;
        let mut data = self.data.lock().await;
        let column = data.column_mut(column_id)?;
        column.title = title.to_string();
        column.updated_at = now();
        Ok(column.clone())
    }

    async fn delete_column(&self, column_id: ColumnId) -> Result<()> {
        self.checkpoint(BackendCall::DeleteColumn).await?;
        let mut data = self.data.lock().await;
        let board_id = data.board_of_column(column_id).ok_or_else(|| {
            LibError::not_found("Column not found", anyhow!("column {}", column_id))
        })?;
        let columns = data.board_columns(board_id)?;
        columns.retain(|column| column.id != column_id);
        reassign_positions(columns);
        Ok(())
    }

    async fn reorder_columns(&self, board_id: BoardId, column_ids: &[ColumnId]) -> Result<()> {
        self.checkpoint(BackendCall::ReorderColumns).await?;
        let mut data = self.data.lock().await;
        let columns = data.board_columns(board_id)?;
        if column_ids.len() != columns.len() {
            return Err(LibError::validation(
                "Column order must list every column once",
                anyhow!("{} ids for {} columns", column_ids.len(), columns.len()),
            ));
        }
        let mut reordered = Vec::with_capacity(columns.len());
        for column_id in column_ids {
            let index = columns
                .iter()
                .position(|column| column.id == *column_id)
                .ok_or_else(|| {
                    LibError::validation(
                        "Column order must list every column once",
                        anyhow!("unknown column {}", column_id),
                    )
                })?;
            reordered.push(columns.remove(index));
        }
        reassign_positions(&mut reordered);
        *columns = reordered;
        Ok(())
    }

    async fn create_task(
        &self,
        column_id: ColumnId,
        task: &NewTask,
        position: i32,
    ) -> Result<Task> {
        self.checkpoint(BackendCall::CreateTask).await?;
        let mut data = self.data.lock().await;
        let column = data.column_mut(column_id)?;
        let timestamp = now();
        let index = clamp_insert_index(position.max(0) as usize, column.tasks.len());
        let created = Task {
            id: new_id(),
            column_id,
            title: task.title.clone(),
            description: task.description.clone(),
            assignee: task.assignee.clone(),
            position: index as i32,
            tags: vec![],
            created_at: timestamp,
            updated_at: timestamp,
        };
        column.tasks.insert(index, created.clone());
        reassign_positions(&mut column.tasks);
        Ok(created)
    }

    async fn update_task(&self, task_id: TaskId, patch: &TaskPatch) -> Result<Task> {
        self.checkpoint(BackendCall::UpdateTask).await?;
        let mut data = self.data.lock().await;
        let task = data.task_mut(task_id)?;
        task.apply_patch(patch, now());
        Ok(task.clone())
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<()> {
        self.checkpoint(BackendCall::DeleteTask).await?;
        let mut data = self.data.lock().await;
        let column_id = data.task_mut(task_id)?.column_id;
        let column = data.column_mut(column_id)?;
        column.tasks.retain(|task| task.id != task_id);
        reassign_positions(&mut column.tasks);
        Ok(())
    }

    async fn move_task(
        &self,
        task_id: TaskId,
        source_column_id: ColumnId,
        destination_column_id: ColumnId,
        destination_index: usize,
    ) -> Result<()> {
        self.checkpoint(BackendCall::MoveTask).await?;
        let mut data = self.data.lock().await;
        let current_column = data.task_mut(task_id)?.column_id;
        if current_column != source_column_id {
            return Err(LibError::validation(
                "Task is not in the source column",
                anyhow!("task {} lives in {}", task_id, current_column),
            ));
        }
        let board_id = data.board_of_column(source_column_id).ok_or_else(|| {
            LibError::not_found("Column not found", anyhow!("column {}", source_column_id))
        })?;
        if data.board_of_column(destination_column_id) != Some(board_id) {
            return Err(LibError::not_found(
                "Destination column not found",
                anyhow!("column {}", destination_column_id),
            ));
        }

        let columns = data.board_columns(board_id)?;
        let source_at = columns
            .iter()
            .position(|column| column.id == source_column_id)
            .ok_or_else(|| LibError::message("Source column vanished"))?;
        let source_index = columns[source_at]
            .tasks
            .iter()
            .position(|task| task.id == task_id)
            .ok_or_else(|| LibError::message("Task vanished"))?;

        if source_column_id == destination_column_id {
            let tasks = &mut columns[source_at].tasks;
            let destination_index = destination_index.min(tasks.len() - 1);
            return move_within(tasks, source_index, destination_index);
        }

        let destination_at = columns
            .iter()
            .position(|column| column.id == destination_column_id)
            .ok_or_else(|| LibError::message("Destination column vanished"))?;
        let (source, destination) = if source_at < destination_at {
            let (left, right) = columns.split_at_mut(destination_at);
            (&mut left[source_at], &mut right[0])
        } else {
            let (left, right) = columns.split_at_mut(source_at);
            (&mut right[0], &mut left[destination_at])
        };
        let destination_index = clamp_insert_index(destination_index, destination.tasks.len());
        move_across(
            &mut source.tasks,
            &mut destination.tasks,
            source_index,
            destination_index,
        )?;
        if let Some(moved) = destination.tasks.get_mut(destination_index) {
            moved.column_id = destination_column_id;
            moved.updated_at = now();
        }
        Ok(())
    }

    async fn list_tags(&self, board_id: BoardId) -> Result<Vec<Tag>> {
        self.checkpoint(BackendCall::ListTags).await?;
        let data = self.data.lock().await;
        let mut tags: Vec<Tag> = data
            .tags
            .iter()
            .filter(|tag| tag.board_id == board_id)
            .cloned()
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    async fn create_tag(&self, board_id: BoardId, name: &str, color: &TagColor) -> Result<Tag> {
        self.checkpoint(BackendCall::CreateTag).await?;
        let mut data = self.data.lock().await;
        if !data.columns.contains_key(&board_id) {
            return Err(LibError::not_found(
                "Board not found",
                anyhow!("board {}", board_id),
            ));
        }
        data.ensure_tag_unique(board_id, name, color, None)?;
        let tag = Tag {
            id: new_id(),
            board_id,
            name: name.to_string(),
            color: color.clone(),
        };
        data.tags.push(tag.clone());
        Ok(tag)
    }

    async fn update_tag(&self, tag_id: TagId, patch: &TagPatch) -> Result<Tag> {
        self.checkpoint(BackendCall::UpdateTag).await?;
        let mut data = self.data.lock().await;
        let mut updated = data
            .tags
            .iter()
            .find(|tag| tag.id == tag_id)
            .cloned()
            .ok_or_else(|| LibError::not_found("Tag not found", anyhow!("tag {}", tag_id)))?;
        patch.apply_to(&mut updated);
        data.ensure_tag_unique(updated.board_id, &updated.name, &updated.color, Some(tag_id))?;

        for tag in data.tags.iter_mut().filter(|tag| tag.id == tag_id) {
            *tag = updated.clone();
        }
        if let Some(columns) = data.columns.get_mut(&updated.board_id) {
            for task in columns.iter_mut().flat_map(|column| column.tasks.iter_mut()) {
                for slot in task.tags.iter_mut().filter(|slot| slot.id == tag_id) {
                    *slot = updated.clone();
                }
            }
        }
        Ok(updated)
    }

    async fn delete_tag(&self, tag_id: TagId) -> Result<()> {
        self.checkpoint(BackendCall::DeleteTag).await?;
        let mut data = self.data.lock().await;
        let before = data.tags.len();
        data.tags.retain(|tag| tag.id != tag_id);
        if data.tags.len() == before {
            return Err(LibError::not_found("Tag not found", anyhow!("tag {}", tag_id)));
        }
        for task in data
            .columns
            .values_mut()
            .flat_map(|columns| columns.iter_mut())
            .flat_map(|column| column.tasks.iter_mut())
        {
            task.tags.retain(|tag| tag.id != tag_id);
        }
        Ok(())
    }

    async fn set_task_tags(&self, task_id: TaskId, tag_ids: &[TagId]) -> Result<Vec<Tag>> {
        self.checkpoint(BackendCall::SetTaskTags).await?;
        let mut data = self.data.lock().await;
        let column_id = data.task_mut(task_id)?.column_id;
        let board_id = data.board_of_column(column_id).ok_or_else(|| {
            LibError::not_found("Column not found", anyhow!("column {}", column_id))
        })?;

        let mut tags: Vec<Tag> = Vec::with_capacity(tag_ids.len());
        for tag_id in tag_ids {
            if tags.iter().any(|tag| tag.id == *tag_id) {
                continue;
            }
            let tag = data
                .tags
                .iter()
                .find(|tag| tag.id == *tag_id && tag.board_id == board_id)
                .cloned()
                .ok_or_else(|| {
                    LibError::validation("Tag does not belong to this board", anyhow!("{}", tag_id))
                })?;
            tags.push(tag);
        }

        let task = data.task_mut(task_id)?;
        task.tags = tags.clone();
        task.updated_at = now();
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariants::ensure_board_invariants;

    fn titles(column: &Column) -> Vec<&str> {
        column.tasks.iter().map(|task| task.title.as_str()).collect()
    }

    #[tokio::test]
    async fn create_board_adds_default_columns() {
        let backend = MemoryBackend::new();
        let board = backend.create_board("Launch").await.expect("create board");
        let detail = backend.get_board(board.id).await.expect("get board");

        let column_titles: Vec<&str> = detail.columns.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(column_titles, DEFAULT_COLUMN_TITLES);
        assert!(ensure_board_invariants(&detail.columns).is_ok());
    }

    #[tokio::test]
    async fn move_task_recomputes_both_columns() {
        let backend = MemoryBackend::new();
        let detail = backend
            .seed_board("Launch", &[("To Do", &["T1", "T2"]), ("Done", &["T3"])])
            .await;
        let (todo, done) = (&detail.columns[0], &detail.columns[1]);

        backend
            .move_task(todo.tasks[0].id, todo.id, done.id, 1)
            .await
            .expect("move task");

        let after = backend.snapshot(detail.board.id).await.expect("board exists");
        assert_eq!(titles(&after.columns[0]), ["T2"]);
        assert_eq!(titles(&after.columns[1]), ["T3", "T1"]);
        assert_eq!(after.columns[1].tasks[1].column_id, done.id);
        assert!(ensure_board_invariants(&after.columns).is_ok());
    }

    #[tokio::test]
    async fn duplicate_tag_name_and_color_conflict_separately() {
        let backend = MemoryBackend::new();
        let detail = backend.seed_board("Launch", &[]).await;
        let board_id = detail.board.id;
        backend
            .seed_tag(board_id, "Bug", "#FF0000")
            .await
            .expect("seed tag");

        let red = TagColor::parse("#FF0000").expect("color");
        let blue = TagColor::parse("#0000FF").expect("color");
        let err = backend
            .create_tag(board_id, "Bug", &blue)
            .await
            .expect_err("duplicate name");
        assert_eq!(err.code, "tag_name_conflict");

        let err = backend
            .create_tag(board_id, "Feature", &red)
            .await
            .expect_err("duplicate color");
        assert_eq!(err.code, "tag_color_conflict");
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_once() {
        let backend = MemoryBackend::new();
        backend
            .fail_next(BackendCall::ListBoards, LibError::message("boom"))
            .await;

        assert!(backend.list_boards().await.is_err());
        assert!(backend.list_boards().await.is_ok());
        assert_eq!(
            backend.calls().await,
            vec![BackendCall::ListBoards, BackendCall::ListBoards]
        );
    }

    #[tokio::test]
    async fn set_task_tags_replaces_the_whole_set() {
        let backend = MemoryBackend::new();
        let detail = backend.seed_board("Launch", &[("To Do", &["T1"])]).await;
        let board_id = detail.board.id;
        let task_id = detail.columns[0].tasks[0].id;
        let bug = backend.seed_tag(board_id, "Bug", "#FF0000").await.expect("tag");
        let ui = backend.seed_tag(board_id, "UI", "#00FF00").await.expect("tag");

        backend
            .set_task_tags(task_id, &[bug.id, ui.id])
            .await
            .expect("set tags");
        let tags = backend.set_task_tags(task_id, &[ui.id]).await.expect("set tags");

        assert_eq!(tags, vec![ui]);
    }
}
