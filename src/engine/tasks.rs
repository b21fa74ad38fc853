use anyhow::anyhow;
use tracing::{debug, warn};

use super::{BoardEngine, Origin, column_not_found, task_not_found};
use crate::backend::BoardBackend;
use crate::error::{LibError, Result};
use crate::ids::{ColumnId, TagId, TaskId, new_id};
use crate::ledger::EntityKey;
use crate::models::{NewTask, Tag, Task, TaskMove, TaskPatch, now};
use crate::reorder::{is_noop_move, move_across, move_within, reassign_positions};
use crate::store::{BoardState, MutationKind};

impl<B: BoardBackend> BoardEngine<B> {
    pub async fn create_task(&self, column_id: ColumnId, task: NewTask) -> Option<Task> {
        self.try_create_task(column_id, task).await.ok()
    }

    /// Appends a task to `column_id`. The temporary copy is visible before the
    /// backend is called and keeps its slot when the server id is swapped in.
    pub async fn try_create_task(&self, column_id: ColumnId, task: NewTask) -> Result<Task> {
        let kind = MutationKind::AddTask;
        let task = self.board_guard(kind, task.normalize())?;
        self.board_guard(
            kind,
            self.ensure_persisted(column_id.0, "Column is still being saved"),
        )?;

        let temp_id: TaskId = new_id();
        let timestamp = now();
        let staged = self.boards.try_apply(|state| {
            let column = state
                .column_mut(column_id)
                .ok_or_else(|| column_not_found(column_id))?;
            let position = column.tasks.len() as i32;
            column.tasks.push(Task {
                id: temp_id,
                column_id,
                title: task.title.clone(),
                description: task.description.clone(),
                assignee: task.assignee.clone(),
                position,
                tags: vec![],
                created_at: timestamp,
                updated_at: timestamp,
            });
            Ok(position)
        });
        let position = self.board_guard(kind, staged)?;
        // Only this create owns the temp id, so no sibling supersedes it.
        let ticket = self.ledger.begin(vec![EntityKey::Task(temp_id)]);
        self.ledger.register_pending(temp_id.0);
        debug!(task_id = %temp_id, column_id = %column_id, position, "optimistic task created");

        let result = self.backend.create_task(column_id, &task, position).await;
        self.ledger.resolve_pending(temp_id.0);
        match result {
            Ok(created) => {
                let mut placed = true;
                self.boards
                    .apply(|state| placed = state.substitute_task_id(temp_id, &created));
                if !placed {
                    warn!(task_id = %created.id, column_id = %column_id, "confirmed task has no loaded column");
                }
                self.ledger.finish(&ticket);
                debug!(temp_id = %temp_id, task_id = %created.id, "task confirmed");
                Ok(created)
            }
            Err(err) => {
                self.rollback_board(kind, &ticket, err, |state| {
                    state.remove_task(temp_id);
                })
                .await
            }
        }
    }

    pub async fn update_task(&self, task_id: TaskId, patch: TaskPatch) -> Option<Task> {
        self.try_update_task(task_id, patch).await.ok()
    }

    pub async fn try_update_task(&self, task_id: TaskId, patch: TaskPatch) -> Result<Task> {
        let kind = MutationKind::UpdateTask;
        let patch = self.board_guard(kind, patch.normalize())?;
        self.board_guard(
            kind,
            self.ensure_persisted(task_id.0, "Task is still being saved"),
        )?;

        let staged = self.boards.try_apply(|state| {
            let task = state
                .task_mut(task_id)
                .ok_or_else(|| task_not_found(task_id))?;
            let original = task.clone();
            task.apply_patch(&patch, now());
            Ok(original)
        });
        let original = self.board_guard(kind, staged)?;
        let ticket = self.ledger.begin(vec![EntityKey::Task(task_id)]);
        debug!(task_id = %task_id, "optimistic task update");

        match self.backend.update_task(task_id, &patch).await {
            Ok(confirmed) => {
                if self.ledger.is_current(&ticket) {
                    self.boards.apply(|state| {
                        if let Some(task) = state.task_mut(task_id) {
                            task.title = confirmed.title.clone();
                            task.description = confirmed.description.clone();
                            task.assignee = confirmed.assignee.clone();
                            task.created_at = confirmed.created_at;
                            task.updated_at = confirmed.updated_at;
                        }
                    });
                }
                self.ledger.finish(&ticket);
                Ok(confirmed)
            }
            Err(err) => {
                self.rollback_board(kind, &ticket, err, |state| {
                    // Placement belongs to moves; only the entity's own fields revert.
                    if let Some(task) = state.task_mut(task_id) {
                        *task = Task {
                            column_id: task.column_id,
                            position: task.position,
                            ..original
                        };
                    }
                })
                .await
            }
        }
    }

    pub async fn delete_task(&self, task_id: TaskId) -> Option<()> {
        self.try_delete_task(task_id).await.ok()
    }

    pub async fn try_delete_task(&self, task_id: TaskId) -> Result<()> {
        let kind = MutationKind::DeleteTask;
        self.board_guard(
            kind,
            self.ensure_persisted(task_id.0, "Task is still being saved"),
        )?;

        let removed = self.boards.try_apply(|state| {
            let column_id = state
                .task(task_id)
                .map(|task| task.column_id)
                .ok_or_else(|| task_not_found(task_id))?;
            let (index, task) = state
                .remove_task(task_id)
                .ok_or_else(|| task_not_found(task_id))?;
            Ok((column_id, index, task))
        });
        let (column_id, index, task) = self.board_guard(kind, removed)?;
        let ticket = self.ledger.begin(vec![EntityKey::Task(task_id)]);
        debug!(task_id = %task_id, column_id = %column_id, index, "optimistic task delete");

        match self.backend.delete_task(task_id).await {
            Ok(()) => {
                self.ledger.finish(&ticket);
                Ok(())
            }
            Err(err) => {
                self.rollback_board(kind, &ticket, err, |state| {
                    if state.task(task_id).is_some() {
                        return;
                    }
                    if let Some(column) = state.column_mut(column_id) {
                        let index = index.min(column.tasks.len());
                        column.tasks.insert(index, task);
                        reassign_positions(&mut column.tasks);
                    }
                })
                .await
            }
        }
    }

    pub async fn move_task(&self, mv: TaskMove, origin: Origin) -> Option<()> {
        self.try_move_task(mv, origin).await.ok()
    }

    /// Moves a task within or across columns. Moving a task onto its own slot
    /// is a no-op: nothing is written and the backend is not called.
    ///
    /// With `Origin::RemoteEcho` the move is already durable, so only the local
    /// mirror changes and failures are left to the caller.
    pub async fn try_move_task(&self, mv: TaskMove, origin: Origin) -> Result<()> {
        let kind = MutationKind::MoveTask;
        let planned = self.boards.read(|state| plan_move(state, &mv));
        let source_index = match planned {
            Ok(source_index) => source_index,
            Err(err) if origin.is_remote_echo() => return Err(err),
            Err(err) => return self.board_guard(kind, Err(err)),
        };
        if is_noop_move(!mv.is_cross_column(), source_index, mv.destination_index) {
            debug!(task_id = %mv.task_id, index = source_index, "task dropped on its own slot");
            return Ok(());
        }

        if origin.is_remote_echo() {
            self.boards
                .try_apply(|state| apply_move(state, &mv, source_index))?;
            debug!(task_id = %mv.task_id, "remote task move mirrored");
            return Ok(());
        }

        self.board_guard(
            kind,
            self.ensure_persisted(mv.task_id.0, "Task is still being saved"),
        )?;
        let applied = self
            .boards
            .try_apply(|state| apply_move(state, &mv, source_index));
        self.board_guard(kind, applied)?;
        let ticket = self.ledger.begin(vec![
            EntityKey::Column(mv.source_column_id),
            EntityKey::Column(mv.destination_column_id),
            EntityKey::Task(mv.task_id),
        ]);
        debug!(
            task_id = %mv.task_id,
            source_column_id = %mv.source_column_id,
            destination_column_id = %mv.destination_column_id,
            source_index,
            destination_index = mv.destination_index,
            origin = ?origin,
            "optimistic task move"
        );

        let result = self
            .backend
            .move_task(
                mv.task_id,
                mv.source_column_id,
                mv.destination_column_id,
                mv.destination_index,
            )
            .await;
        match result {
            Ok(()) => {
                self.ledger.finish(&ticket);
                Ok(())
            }
            Err(err) => {
                self.rollback_board(kind, &ticket, err, |state| {
                    undo_move(state, &mv, source_index)
                })
                .await
            }
        }
    }

    pub async fn set_task_tags(&self, task_id: TaskId, tag_ids: &[TagId]) -> Option<Vec<Tag>> {
        self.try_set_task_tags(task_id, tag_ids).await.ok()
    }

    /// Replaces the task's whole tag set with `tag_ids` (duplicates collapse).
    pub async fn try_set_task_tags(
        &self,
        task_id: TaskId,
        tag_ids: &[TagId],
    ) -> Result<Vec<Tag>> {
        let kind = MutationKind::SetTaskTags;
        self.board_guard(
            kind,
            self.ensure_persisted(task_id.0, "Task is still being saved"),
        )?;
        for tag_id in tag_ids {
            self.board_guard(
                kind,
                self.ensure_persisted(tag_id.0, "Tag is still being saved"),
            )?;
        }
        let resolved = self.tags.read(|state| state.resolve(tag_ids)).map_err(|unknown| {
            LibError::validation(
                "Tag does not belong to this board",
                anyhow!("tag {} is not loaded for the current board", unknown),
            )
        });
        let tags = self.board_guard(kind, resolved)?;

        let staged = self.boards.try_apply(|state| {
            let task = state
                .task_mut(task_id)
                .ok_or_else(|| task_not_found(task_id))?;
            Ok(std::mem::replace(&mut task.tags, tags.clone()))
        });
        let original = self.board_guard(kind, staged)?;
        let ticket = self.ledger.begin(vec![EntityKey::Task(task_id)]);
        debug!(task_id = %task_id, tags = tags.len(), "optimistic task tag replace");

        let ids: Vec<TagId> = tags.iter().map(|tag| tag.id).collect();
        match self.backend.set_task_tags(task_id, &ids).await {
            Ok(confirmed) => {
                if self.ledger.is_current(&ticket) {
                    self.boards.apply(|state| {
                        if let Some(task) = state.task_mut(task_id) {
                            task.tags = confirmed.clone();
                        }
                    });
                }
                self.ledger.finish(&ticket);
                Ok(confirmed)
            }
            Err(err) => {
                self.rollback_board(kind, &ticket, err, |state| {
                    if let Some(task) = state.task_mut(task_id) {
                        task.tags = original;
                    }
                })
                .await
            }
        }
    }
}

/// Checks a move against the current board and returns the task's index in
/// its source column.
fn plan_move(state: &BoardState, mv: &TaskMove) -> Result<usize> {
    let source = state
        .column(mv.source_column_id)
        .ok_or_else(|| column_not_found(mv.source_column_id))?;
    let destination = state
        .column(mv.destination_column_id)
        .ok_or_else(|| column_not_found(mv.destination_column_id))?;
    let source_index = source
        .tasks
        .iter()
        .position(|task| task.id == mv.task_id)
        .ok_or_else(|| {
            LibError::validation(
                "Task is not in the source column",
                anyhow!("task {} not found in column {}", mv.task_id, source.id),
            )
        })?;

    let limit = if mv.is_cross_column() {
        destination.tasks.len()
    } else {
        destination.tasks.len() - 1
    };
    if mv.destination_index > limit {
        return Err(LibError::validation_with_code(
            "move_index_out_of_range",
            "Destination index is out of range",
            anyhow!("index {} beyond {}", mv.destination_index, limit),
        ));
    }
    Ok(source_index)
}

/// Applies a planned move as one transition over both columns.
fn apply_move(state: &mut BoardState, mv: &TaskMove, source_index: usize) -> Result<()> {
    if !mv.is_cross_column() {
        let column = state
            .column_mut(mv.source_column_id)
            .ok_or_else(|| column_not_found(mv.source_column_id))?;
        return move_within(&mut column.tasks, source_index, mv.destination_index);
    }

    let (source, destination) = state
        .column_pair_mut(mv.source_column_id, mv.destination_column_id)
        .ok_or_else(|| column_not_found(mv.destination_column_id))?;
    move_across(
        &mut source.tasks,
        &mut destination.tasks,
        source_index,
        mv.destination_index,
    )?;
    if let Some(moved) = destination.tasks.get_mut(mv.destination_index) {
        moved.column_id = mv.destination_column_id;
    }
    Ok(())
}

/// Puts a moved task back where it was picked up.
fn undo_move(state: &mut BoardState, mv: &TaskMove, source_index: usize) {
    let Some(current_index) = state.column(mv.destination_column_id).and_then(|column| {
        column
            .tasks
            .iter()
            .position(|task| task.id == mv.task_id)
    }) else {
        warn!(task_id = %mv.task_id, "moved task vanished before rollback");
        return;
    };
    let back_len = state
        .column(mv.source_column_id)
        .map(|column| column.tasks.len())
        .unwrap_or_default();
    let destination_index = if mv.is_cross_column() {
        source_index.min(back_len)
    } else {
        source_index.min(back_len.saturating_sub(1))
    };
    let reverse = TaskMove {
        task_id: mv.task_id,
        source_column_id: mv.destination_column_id,
        destination_column_id: mv.source_column_id,
        destination_index,
    };
    if let Err(err) = apply_move(state, &reverse, current_index) {
        warn!(task_id = %mv.task_id, error = %err, "could not reverse task move");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::test_support::{engine_with_board, wait_for_call};
    use super::*;
    use crate::config::BoardConfig;
    use crate::invariants::ensure_board_invariants;
    use crate::memory::{BackendCall, MemoryBackend};

    fn titles(state: &BoardState, column: usize) -> Vec<String> {
        state.columns[column]
            .tasks
            .iter()
            .map(|task| task.title.clone())
            .collect()
    }

    #[tokio::test]
    async fn create_task_appends_and_keeps_server_id() {
        let (engine, detail) = engine_with_board(&[("To Do", &["T1"])]).await;
        let column_id = detail.columns[0].id;

        let created = engine
            .create_task(column_id, NewTask::titled(" Write docs "))
            .await
            .expect("created");

        let state = engine.boards().current();
        assert_eq!(titles(&state, 0), ["T1", "Write docs"]);
        assert_eq!(state.columns[0].tasks[1].id, created.id);
        assert_eq!(state.columns[0].tasks[1].position, 1);
        assert_eq!(state.columns[0].tasks[0], detail.columns[0].tasks[0]);
        assert!(!engine.ledger().is_pending(created.id.0));
    }

    #[tokio::test]
    async fn blank_title_is_rejected_without_a_backend_call() {
        let (engine, detail) = engine_with_board(&[("To Do", &[])]).await;
        let before = engine.boards().read(|state| state.columns.clone());

        let result = engine
            .try_create_task(detail.columns[0].id, NewTask::titled("   "))
            .await;

        assert!(result.is_err());
        assert!(engine.backend().calls().await.is_empty());
        let state = engine.boards().current();
        assert_eq!(state.columns, before);
        assert_eq!(
            state.error.expect("error recorded").message,
            "Failed to add task: Task title is required"
        );
    }

    #[tokio::test]
    async fn tasks_on_a_pending_column_are_rejected() {
        let (engine, detail) = engine_with_board(&[("To Do", &[])]).await;
        let backend = Arc::clone(engine.backend());
        let hold = backend.hold(BackendCall::CreateColumn).await;
        let pending = tokio::spawn({
            let engine = engine.clone();
            async move { engine.try_create_column("Review").await }
        });
        wait_for_call(&backend, BackendCall::CreateColumn).await;
        let temp_column = engine.boards().read(|state| state.columns[1].id);

        let err = engine
            .try_create_task(temp_column, NewTask::titled("Early"))
            .await
            .expect_err("column not confirmed yet");
        assert_eq!(err.code, "entity_pending");

        hold.notify_one();
        let column = pending.await.expect("join").expect("column created");
        assert!(engine.create_task(column.id, NewTask::titled("Later")).await.is_some());
        assert_eq!(engine.boards().read(|state| state.columns[0].id), detail.columns[0].id);
    }

    #[tokio::test]
    async fn failed_update_restores_the_whole_task() {
        let (engine, detail) = engine_with_board(&[("To Do", &["T1", "T2"])]).await;
        let original = detail.columns[0].tasks[1].clone();
        engine
            .backend()
            .fail_next(BackendCall::UpdateTask, LibError::message("Backend unavailable"))
            .await;

        let patch = TaskPatch {
            title: Some("Renamed".to_string()),
            assignee: Some(Some("sam".to_string())),
            ..TaskPatch::default()
        };
        assert!(engine.update_task(original.id, patch).await.is_none());

        let state = engine.boards().current();
        assert_eq!(state.task(original.id), Some(&original));
        assert_eq!(
            state.error.expect("error").message,
            "Failed to update task: Backend unavailable"
        );
    }

    #[tokio::test]
    async fn superseded_failure_does_not_restore_a_stale_snapshot() {
        let (engine, detail) = engine_with_board(&[("To Do", &["T1"])]).await;
        let backend = Arc::clone(engine.backend());
        let task_id = detail.columns[0].tasks[0].id;
        let hold = backend.hold(BackendCall::UpdateTask).await;

        let first = tokio::spawn({
            let engine = engine.clone();
            async move {
                let patch = TaskPatch {
                    title: Some("First".to_string()),
                    ..TaskPatch::default()
                };
                engine.try_update_task(task_id, patch).await
            }
        });
        wait_for_call(&backend, BackendCall::UpdateTask).await;

        let second = TaskPatch {
            title: Some("Second".to_string()),
            ..TaskPatch::default()
        };
        engine.update_task(task_id, second).await.expect("second update");
        backend
            .fail_next(BackendCall::UpdateTask, LibError::message("Backend unavailable"))
            .await;
        hold.notify_one();
        assert!(first.await.expect("join").is_err());

        let state = engine.boards().current();
        assert_eq!(state.task(task_id).map(|task| task.title.as_str()), Some("Second"));
        assert!(state.error.is_some());
        assert!(backend.calls().await.contains(&BackendCall::GetBoard));
    }

    #[tokio::test]
    async fn failed_delete_reinserts_at_original_index() {
        let (engine, detail) = engine_with_board(&[("To Do", &["T1", "T2", "T3"])]).await;
        let before = engine.boards().read(|state| state.columns.clone());
        engine
            .backend()
            .fail_next(BackendCall::DeleteTask, LibError::message("Backend unavailable"))
            .await;

        assert!(engine.delete_task(detail.columns[0].tasks[1].id).await.is_none());
        assert_eq!(engine.boards().read(|state| state.columns.clone()), before);
    }

    #[tokio::test]
    async fn noop_move_touches_nothing() {
        let (engine, detail) = engine_with_board(&[("To Do", &["T1", "T2"])]).await;
        let mut rx = engine.boards().subscribe();
        rx.mark_unchanged();
        let column_id = detail.columns[0].id;

        let moved = engine
            .move_task(
                TaskMove {
                    task_id: detail.columns[0].tasks[1].id,
                    source_column_id: column_id,
                    destination_column_id: column_id,
                    destination_index: 1,
                },
                Origin::Local,
            )
            .await;

        assert_eq!(moved, Some(()));
        assert!(!rx.has_changed().expect("store alive"));
        assert!(engine.backend().calls().await.is_empty());
    }

    #[tokio::test]
    async fn out_of_range_move_is_a_validation_error() {
        let (engine, detail) = engine_with_board(&[("To Do", &["T1", "T2"])]).await;
        let column_id = detail.columns[0].id;

        let err = engine
            .try_move_task(
                TaskMove {
                    task_id: detail.columns[0].tasks[0].id,
                    source_column_id: column_id,
                    destination_column_id: column_id,
                    destination_index: 2,
                },
                Origin::Local,
            )
            .await
            .expect_err("index 2 of 2");

        assert_eq!(err.code, "move_index_out_of_range");
        assert!(engine.backend().calls().await.is_empty());
    }

    #[tokio::test]
    async fn failed_cross_column_move_restores_both_columns() {
        let (engine, detail) =
            engine_with_board(&[("To Do", &["T1", "T2"]), ("Done", &["T3"])]).await;
        let before = engine.boards().read(|state| state.columns.clone());
        engine
            .backend()
            .fail_next(BackendCall::MoveTask, LibError::message("Backend unavailable"))
            .await;

        let mv = TaskMove {
            task_id: detail.columns[0].tasks[0].id,
            source_column_id: detail.columns[0].id,
            destination_column_id: detail.columns[1].id,
            destination_index: 0,
        };
        assert!(engine.move_task(mv, Origin::Local).await.is_none());

        let state = engine.boards().current();
        assert_eq!(state.columns, before);
        assert_eq!(
            state.error.expect("error").message,
            "Failed to move task: Backend unavailable"
        );
    }

    #[tokio::test]
    async fn remote_echo_moves_skip_the_backend() {
        let (engine, detail) =
            engine_with_board(&[("To Do", &["T1", "T2"]), ("Done", &["T3"])]).await;
        let mv = TaskMove {
            task_id: detail.columns[1].tasks[0].id,
            source_column_id: detail.columns[1].id,
            destination_column_id: detail.columns[0].id,
            destination_index: 2,
        };

        engine
            .try_move_task(mv, Origin::RemoteEcho)
            .await
            .expect("mirrored");

        let state = engine.boards().current();
        assert_eq!(titles(&state, 0), ["T1", "T2", "T3"]);
        assert!(state.columns[1].tasks.is_empty());
        assert!(ensure_board_invariants(&state.columns).is_ok());
        assert!(engine.backend().calls().await.is_empty());
        assert_eq!(engine.ledger().in_flight(), 0);
    }

    #[tokio::test]
    async fn set_task_tags_rejects_unknown_tags() {
        let backend = Arc::new(MemoryBackend::new());
        let detail = backend.seed_board("Launch", &[("To Do", &["T1"])]).await;
        let engine = BoardEngine::new(Arc::clone(&backend), BoardConfig::default());
        engine.load_board(detail.board.id).await.expect("load");
        backend.clear_calls().await;

        let result = engine
            .try_set_task_tags(detail.columns[0].tasks[0].id, &[new_id()])
            .await;

        assert!(result.is_err());
        assert!(backend.calls().await.is_empty());
    }

    #[tokio::test]
    async fn set_task_tags_failure_restores_previous_tags() {
        let backend = Arc::new(MemoryBackend::new());
        let detail = backend.seed_board("Launch", &[("To Do", &["T1"])]).await;
        let bug = backend
            .seed_tag(detail.board.id, "Bug", "#FF0000")
            .await
            .expect("tag");
        let ui = backend
            .seed_tag(detail.board.id, "UI", "#00FF00")
            .await
            .expect("tag");
        let engine = BoardEngine::new(Arc::clone(&backend), BoardConfig::default());
        engine.load_board(detail.board.id).await.expect("load");
        let task_id = detail.columns[0].tasks[0].id;

        let tags = engine
            .set_task_tags(task_id, &[bug.id])
            .await
            .expect("tags set");
        assert_eq!(tags, vec![bug.clone()]);

        backend
            .fail_next(BackendCall::SetTaskTags, LibError::message("Backend unavailable"))
            .await;
        assert!(engine.set_task_tags(task_id, &[ui.id]).await.is_none());

        let state = engine.boards().current();
        assert_eq!(state.task(task_id).map(|task| task.tags.clone()), Some(vec![bug]));
    }
}
