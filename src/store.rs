use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{ErrorKind, LibError, Result};
use crate::ids::{BoardId, ColumnId, TagId, TaskId};
use crate::models::{Board, Column, Tag, Task};
use crate::reorder::{clamp_insert_index, reassign_positions};

/// Observable state slice. Every transition replaces the value in one step and
/// subscribers see transitions in the order they were written.
#[derive(Debug)]
pub struct StateContainer<S> {
    tx: Arc<watch::Sender<S>>,
}

impl<S> Clone for StateContainer<S> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<S: Clone + Default> Default for StateContainer<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S: Clone> StateContainer<S> {
    pub fn new(initial: S) -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(initial)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.tx.subscribe()
    }

    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.tx.borrow())
    }

    pub fn current(&self) -> S {
        self.tx.borrow().clone()
    }

    pub fn apply(&self, f: impl FnOnce(&mut S)) {
        self.tx.send_modify(f);
    }

    /// Runs `f` against a copy and publishes it only when `f` succeeds.
    pub fn try_apply<R>(&self, f: impl FnOnce(&mut S) -> Result<R>) -> Result<R> {
        let mut next = self.current();
        let output = f(&mut next)?;
        self.tx.send_replace(next);
        Ok(output)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    LoadBoards,
    LoadBoard,
    CreateBoard,
    DeleteBoard,
    AddColumn,
    RenameColumn,
    DeleteColumn,
    ReorderColumns,
    AddTask,
    UpdateTask,
    DeleteTask,
    MoveTask,
    SetTaskTags,
    LoadTags,
    CreateTag,
    UpdateTag,
    DeleteTag,
    Assistant,
}

impl MutationKind {
    pub const fn describe(self) -> &'static str {
        match self {
            MutationKind::LoadBoards => "load boards",
            MutationKind::LoadBoard => "load board",
            MutationKind::CreateBoard => "create board",
            MutationKind::DeleteBoard => "delete board",
            MutationKind::AddColumn => "add column",
            MutationKind::RenameColumn => "rename column",
            MutationKind::DeleteColumn => "delete column",
            MutationKind::ReorderColumns => "reorder columns",
            MutationKind::AddTask => "add task",
            MutationKind::UpdateTask => "update task",
            MutationKind::DeleteTask => "delete task",
            MutationKind::MoveTask => "move task",
            MutationKind::SetTaskTags => "update task tags",
            MutationKind::LoadTags => "load tags",
            MutationKind::CreateTag => "create tag",
            MutationKind::UpdateTag => "update tag",
            MutationKind::DeleteTag => "delete tag",
            MutationKind::Assistant => "process assistant request",
        }
    }
}

/// Content of a container's single error slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreError {
    pub operation: MutationKind,
    pub kind: ErrorKind,
    pub code: &'static str,
    pub message: String,
}

impl StoreError {
    pub fn from_lib(operation: MutationKind, err: &LibError) -> Self {
        Self {
            operation,
            kind: err.kind,
            code: err.code,
            message: format!("Failed to {}: {}", operation.describe(), err.public),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardState {
    pub boards: Vec<Board>,
    pub current_board: Option<Board>,
    /// Display order; `columns[i].position == i` after every committed transition.
    pub columns: Vec<Column>,
    pub is_loading: bool,
    pub is_dragging: bool,
    pub error: Option<StoreError>,
}

impl BoardState {
    pub fn current_board_id(&self) -> Option<BoardId> {
        self.current_board.as_ref().map(|board| board.id)
    }

    pub fn column(&self, column_id: ColumnId) -> Option<&Column> {
        self.columns.iter().find(|column| column.id == column_id)
    }

    pub fn column_mut(&mut self, column_id: ColumnId) -> Option<&mut Column> {
        self.columns.iter_mut().find(|column| column.id == column_id)
    }

    pub fn column_index(&self, column_id: ColumnId) -> Option<usize> {
        self.columns.iter().position(|column| column.id == column_id)
    }

    /// Two distinct columns borrowed mutably at once, in argument order.
    pub fn column_pair_mut(
        &mut self,
        first: ColumnId,
        second: ColumnId,
    ) -> Option<(&mut Column, &mut Column)> {
        let first_at = self.column_index(first)?;
        let second_at = self.column_index(second)?;
        if first_at == second_at {
            return None;
        }
        if first_at < second_at {
            let (left, right) = self.columns.split_at_mut(second_at);
            Some((&mut left[first_at], &mut right[0]))
        } else {
            let (left, right) = self.columns.split_at_mut(first_at);
            Some((&mut right[0], &mut left[second_at]))
        }
    }

    /// `(column index, task index)` of a task, wherever it currently sits.
    pub fn locate_task(&self, task_id: TaskId) -> Option<(usize, usize)> {
        self.columns.iter().enumerate().find_map(|(column_index, column)| {
            column
                .tasks
                .iter()
                .position(|task| task.id == task_id)
                .map(|task_index| (column_index, task_index))
        })
    }

    pub fn task(&self, task_id: TaskId) -> Option<&Task> {
        self.locate_task(task_id)
            .map(|(column_index, task_index)| &self.columns[column_index].tasks[task_index])
    }

    pub fn task_mut(&mut self, task_id: TaskId) -> Option<&mut Task> {
        let (column_index, task_index) = self.locate_task(task_id)?;
        Some(&mut self.columns[column_index].tasks[task_index])
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.columns.iter().flat_map(|column| column.tasks.iter())
    }

    /// Swaps a whole column value back in; no-op when the column is gone.
    pub fn replace_column(&mut self, column: Column) {
        if let Some(slot) = self.column_mut(column.id) {
            *slot = column;
        }
    }

    pub fn replace_task(&mut self, task: Task) {
        if let Some(slot) = self.task_mut(task.id) {
            *slot = task;
        }
    }

    pub fn insert_column_at(&mut self, index: usize, column: Column) {
        let index = index.min(self.columns.len());
        self.columns.insert(index, column);
        reassign_positions(&mut self.columns);
    }

    pub fn remove_column(&mut self, column_id: ColumnId) -> Option<(usize, Column)> {
        let index = self.column_index(column_id)?;
        let column = self.columns.remove(index);
        reassign_positions(&mut self.columns);
        Some((index, column))
    }

    pub fn remove_task(&mut self, task_id: TaskId) -> Option<(usize, Task)> {
        let (column_index, task_index) = self.locate_task(task_id)?;
        let tasks = &mut self.columns[column_index].tasks;
        let task = tasks.remove(task_index);
        reassign_positions(tasks);
        Some((task_index, task))
    }

    /// Replaces a temporary task id with the confirmed one, touching nothing else.
    /// If a feed echo already inserted the confirmed task, the temporary copy is
    /// dropped instead; if a refetch lost the temporary copy, the confirmed task
    /// is inserted at its server position. Returns `false` only when the task
    /// has nowhere to go (its column is no longer loaded).
    pub fn substitute_task_id(&mut self, temp_id: TaskId, confirmed: &Task) -> bool {
        if self.locate_task(confirmed.id).is_some() {
            self.remove_task(temp_id);
            return true;
        }
        if let Some(task) = self.task_mut(temp_id) {
            task.id = confirmed.id;
            task.created_at = confirmed.created_at;
            task.updated_at = confirmed.updated_at;
            return true;
        }
        let Some(column) = self.column_mut(confirmed.column_id) else {
            return false;
        };
        let index = clamp_insert_index(confirmed.position.max(0) as usize, column.tasks.len());
        column.tasks.insert(index, confirmed.clone());
        reassign_positions(&mut column.tasks);
        true
    }

    pub fn substitute_column_id(&mut self, temp_id: ColumnId, confirmed: &Column) -> bool {
        if self.column(confirmed.id).is_some() {
            self.remove_column(temp_id);
            return true;
        }
        if let Some(column) = self.column_mut(temp_id) {
            column.id = confirmed.id;
            column.created_at = confirmed.created_at;
            column.updated_at = confirmed.updated_at;
            for task in &mut column.tasks {
                task.column_id = confirmed.id;
            }
            return true;
        }
        if self.current_board_id() != Some(confirmed.board_id) {
            return false;
        }
        let index = clamp_insert_index(confirmed.position.max(0) as usize, self.columns.len());
        self.insert_column_at(index, confirmed.clone());
        true
    }

    pub fn substitute_board_id(&mut self, temp_id: BoardId, confirmed: &Board) {
        if let Some(current) = self.current_board.as_mut().filter(|b| b.id == temp_id) {
            *current = confirmed.clone();
        }
        if self.boards.iter().any(|board| board.id == confirmed.id) {
            self.boards.retain(|board| board.id != temp_id);
            return;
        }
        match self.boards.iter_mut().find(|board| board.id == temp_id) {
            Some(board) => *board = confirmed.clone(),
            None => self.boards.insert(0, confirmed.clone()),
        }
    }

    /// Takes a fetched board list, keeping boards whose creates are in flight.
    pub fn adopt_boards(&mut self, fetched: Vec<Board>, is_pending: impl Fn(Uuid) -> bool) {
        let previous = std::mem::replace(&mut self.boards, fetched);
        let carried: Vec<Board> = previous
            .into_iter()
            .filter(|board| is_pending(board.id.0))
            .collect();
        self.boards.splice(0..0, carried);
    }

    /// Takes a fetched column list for the current board. Columns and tasks
    /// whose creates are in flight survive at the end of their parent.
    pub fn adopt_columns(&mut self, fetched: Vec<Column>, is_pending: impl Fn(Uuid) -> bool) {
        let previous = std::mem::replace(&mut self.columns, fetched);
        for column in previous {
            if is_pending(column.id.0) {
                if self.column(column.id).is_none() {
                    self.columns.push(column);
                }
                continue;
            }
            for task in column.tasks.into_iter().filter(|task| is_pending(task.id.0)) {
                if self.locate_task(task.id).is_some() {
                    continue;
                }
                if let Some(target) = self.column_mut(task.column_id) {
                    target.tasks.push(task);
                    reassign_positions(&mut target.tasks);
                }
            }
        }
        reassign_positions(&mut self.columns);
    }

    /// Mirrors a tag's current name/color into every task that carries it.
    pub fn refresh_task_tag(&mut self, tag: &Tag) {
        for column in &mut self.columns {
            for task in &mut column.tasks {
                for slot in task.tags.iter_mut().filter(|slot| slot.id == tag.id) {
                    *slot = tag.clone();
                }
            }
        }
    }

    /// Removes a tag from every task and returns `(task, index in its tag list)`
    /// pairs so the removal can be undone in place.
    pub fn strip_tag(&mut self, tag_id: TagId) -> Vec<(TaskId, usize, Tag)> {
        let mut removed = Vec::new();
        for column in &mut self.columns {
            for task in &mut column.tasks {
                if let Some(index) = task.tags.iter().position(|tag| tag.id == tag_id) {
                    removed.push((task.id, index, task.tags.remove(index)));
                }
            }
        }
        removed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagState {
    pub board_id: Option<BoardId>,
    pub tags: Vec<Tag>,
    pub is_loading: bool,
    pub error: Option<StoreError>,
}

impl TagState {
    pub fn tag(&self, tag_id: TagId) -> Option<&Tag> {
        self.tags.iter().find(|tag| tag.id == tag_id)
    }

    pub fn tag_index(&self, tag_id: TagId) -> Option<usize> {
        self.tags.iter().position(|tag| tag.id == tag_id)
    }

    /// Takes a fetched tag list, keeping tags whose creates are in flight.
    pub fn adopt_tags(&mut self, fetched: Vec<Tag>, is_pending: impl Fn(Uuid) -> bool) {
        let previous = std::mem::replace(&mut self.tags, fetched);
        self.tags
            .extend(previous.into_iter().filter(|tag| is_pending(tag.id.0)));
    }

    /// Resolves ids in order, failing on the first unknown one.
    pub fn resolve(&self, tag_ids: &[TagId]) -> std::result::Result<Vec<Tag>, TagId> {
        let mut resolved: Vec<Tag> = Vec::with_capacity(tag_ids.len());
        for tag_id in tag_ids {
            if resolved.iter().any(|tag| tag.id == *tag_id) {
                continue;
            }
            match self.tag(*tag_id) {
                Some(tag) => resolved.push(tag.clone()),
                None => return Err(*tag_id),
            }
        }
        Ok(resolved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatState {
    pub messages: Vec<ChatMessage>,
    pub is_processing: bool,
    pub error: Option<StoreError>,
}

pub type BoardStore = StateContainer<BoardState>;
pub type TagStore = StateContainer<TagState>;
pub type ChatStore = StateContainer<ChatState>;

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;
    use crate::models::{TagColor, now};

    fn task(column_id: ColumnId, title: &str, position: i32) -> Task {
        Task {
            id: TaskId(Uuid::new_v4()),
            column_id,
            title: title.to_string(),
            description: None,
            assignee: None,
            position,
            tags: vec![],
            created_at: now(),
            updated_at: now(),
        }
    }

    fn state_with_column(titles: &[&str]) -> (BoardState, ColumnId) {
        let column_id = ColumnId(Uuid::new_v4());
        let tasks = titles
            .iter()
            .enumerate()
            .map(|(index, title)| task(column_id, title, index as i32))
            .collect();
        let column = Column {
            id: column_id,
            board_id: BoardId(Uuid::new_v4()),
            title: "To Do".to_string(),
            position: 0,
            tasks,
            created_at: now(),
            updated_at: now(),
        };
        (
            BoardState {
                columns: vec![column],
                ..BoardState::default()
            },
            column_id,
        )
    }

    #[test]
    fn try_apply_publishes_nothing_on_error() {
        let store = BoardStore::default();
        let mut rx = store.subscribe();
        rx.mark_unchanged();

        let result: Result<()> = store.try_apply(|state| {
            state.is_loading = true;
            Err(LibError::message("nope"))
        });

        assert!(result.is_err());
        assert!(!rx.has_changed().expect("sender alive"));
        assert!(!store.read(|state| state.is_loading));
    }

    #[test]
    fn apply_notifies_subscribers_with_latest_value() {
        let store = BoardStore::default();
        let mut rx = store.subscribe();
        store.apply(|state| state.is_dragging = true);
        store.apply(|state| state.is_loading = true);

        assert!(rx.has_changed().expect("sender alive"));
        let seen = rx.borrow_and_update().clone();
        assert!(seen.is_dragging && seen.is_loading);
    }

    #[test]
    fn substitute_task_id_changes_only_that_task() {
        let (mut state, _) = state_with_column(&["A", "B"]);
        let before = state.clone();
        let temp = state.columns[0].tasks[1].id;
        let mut confirmed = state.columns[0].tasks[1].clone();
        confirmed.id = TaskId(Uuid::new_v4());

        assert!(state.substitute_task_id(temp, &confirmed));
        assert_eq!(state.columns[0].tasks[0], before.columns[0].tasks[0]);
        assert_eq!(state.columns[0].tasks[1].id, confirmed.id);
        assert_eq!(state.columns[0].tasks[1].title, "B");
    }

    #[test]
    fn substitute_task_id_drops_temp_when_echo_arrived_first() {
        let (mut state, column_id) = state_with_column(&["A", "B"]);
        let temp = state.columns[0].tasks[1].id;
        let echoed = task(column_id, "B", 2);
        state.columns[0].tasks.push(echoed.clone());

        assert!(state.substitute_task_id(temp, &echoed));
        let ids: Vec<TaskId> = state.columns[0].tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[1], echoed.id);
        assert_eq!(state.columns[0].tasks[1].position, 1);
    }

    #[test]
    fn substitute_task_id_inserts_confirmed_task_when_temp_was_lost() {
        let (mut state, column_id) = state_with_column(&["A", "B"]);
        let confirmed = task(column_id, "C", 1);

        assert!(state.substitute_task_id(TaskId(Uuid::new_v4()), &confirmed));
        let titles: Vec<&str> = state.columns[0].tasks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "C", "B"]);
        assert_eq!(state.columns[0].tasks[2].position, 2);
    }

    #[test]
    fn substitute_task_id_reports_missing_column() {
        let (mut state, _) = state_with_column(&["A"]);
        let orphan = task(ColumnId(Uuid::new_v4()), "C", 0);

        assert!(!state.substitute_task_id(TaskId(Uuid::new_v4()), &orphan));
        assert_eq!(state.columns[0].tasks.len(), 1);
    }

    #[test]
    fn adopt_columns_keeps_pending_tasks_and_columns() {
        let (mut state, column_id) = state_with_column(&["A", "Pending"]);
        let pending_task = state.columns[0].tasks[1].id;
        let mut pending_column = state.columns[0].clone();
        pending_column.id = ColumnId(Uuid::new_v4());
        pending_column.title = "Review".to_string();
        pending_column.tasks.clear();
        state.columns.push(pending_column.clone());

        let mut fetched = state.columns[0].clone();
        fetched.tasks.truncate(1);
        let remote = task(column_id, "Remote", 1);
        fetched.tasks.push(remote.clone());
        let pending = [pending_task.0, pending_column.id.0];
        state.adopt_columns(vec![fetched], |id| pending.contains(&id));

        assert_eq!(state.columns.len(), 2);
        assert_eq!(state.columns[1].id, pending_column.id);
        assert_eq!(state.columns[1].position, 1);
        let ids: Vec<TaskId> = state.columns[0].tasks.iter().map(|t| t.id).collect();
        assert_eq!(&ids[1..], &[remote.id, pending_task]);
        assert_eq!(state.columns[0].tasks[2].position, 2);
    }

    #[test]
    fn adopt_columns_drops_tasks_that_are_not_pending() {
        let (mut state, _) = state_with_column(&["A", "Gone"]);
        let mut fetched = state.columns[0].clone();
        fetched.tasks.truncate(1);

        state.adopt_columns(vec![fetched], |_| false);
        assert_eq!(state.columns[0].tasks.len(), 1);
    }

    #[test]
    fn strip_tag_reports_original_slots() {
        let (mut state, _) = state_with_column(&["A"]);
        let board_id = BoardId(Uuid::new_v4());
        let tags: Vec<Tag> = ["Bug", "UI"]
            .iter()
            .map(|name| Tag {
                id: TagId(Uuid::new_v4()),
                board_id,
                name: name.to_string(),
                color: TagColor::parse("#00FF00").expect("color"),
            })
            .collect();
        state.columns[0].tasks[0].tags = tags.clone();

        let removed = state.strip_tag(tags[1].id);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].1, 1);
        assert_eq!(state.columns[0].tasks[0].tags, vec![tags[0].clone()]);
    }

    #[test]
    fn tag_state_resolve_rejects_unknown_and_dedupes() {
        let board_id = BoardId(Uuid::new_v4());
        let tag = Tag {
            id: TagId(Uuid::new_v4()),
            board_id,
            name: "Bug".to_string(),
            color: TagColor::parse("#FF0000").expect("color"),
        };
        let state = TagState {
            board_id: Some(board_id),
            tags: vec![tag.clone()],
            ..TagState::default()
        };

        assert_eq!(state.resolve(&[tag.id, tag.id]), Ok(vec![tag.clone()]));
        let unknown = TagId(Uuid::new_v4());
        assert_eq!(state.resolve(&[tag.id, unknown]), Err(unknown));
    }

    #[test]
    fn store_error_message_names_the_operation() {
        let err = LibError::transport("Backend unavailable", anyhow!("500"));
        let slot = StoreError::from_lib(MutationKind::AddTask, &err);
        assert_eq!(slot.message, "Failed to add task: Backend unavailable");
        assert_eq!(slot.kind, ErrorKind::Transport);
    }
}
