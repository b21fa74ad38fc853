//! Mirrors collaborator edits from the change feed into the local stores.
//!
//! Feed events are already durable, so nothing here calls the backend except
//! a full board refetch when the local copy cannot be trusted anymore.

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backend::{BoardBackend, ChangeFeed};
use crate::config::BoardConfig;
use crate::engine::{BoardEngine, Origin};
use crate::ids::BoardId;
use crate::invariants::board_invariant_violations;
use crate::models::{
    Board, ChangeEvent, ChangeKind, ColumnRecord, EntityChange, Tag, TaskMove, TaskRecord,
};
use crate::reorder::{clamp_insert_index, reassign_positions};
use crate::store::BoardStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied,
    /// Nothing to do: other board, or the change is already reflected locally.
    Ignored,
    /// The local copy was stale; the current board was reloaded.
    Refetched,
}

/// Bounded channel whose receiver can be handed to [`ChangeReconciler::run`].
pub fn channel(config: &BoardConfig) -> (mpsc::Sender<ChangeEvent>, mpsc::Receiver<ChangeEvent>) {
    mpsc::channel(config.change_feed_capacity)
}

pub struct ChangeReconciler<B> {
    engine: BoardEngine<B>,
}

impl<B: BoardBackend> ChangeReconciler<B> {
    pub fn new(engine: BoardEngine<B>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &BoardEngine<B> {
        &self.engine
    }

    /// Consumes `feed` until it closes; returns how many events were seen.
    pub async fn run<F: ChangeFeed>(&self, mut feed: F) -> usize {
        let mut seen = 0;
        while let Some(event) = feed.next_event().await {
            let outcome = self.apply(event).await;
            debug!(outcome = ?outcome, "change event reconciled");
            seen += 1;
        }
        info!(events = seen, "change feed closed");
        seen
    }

    pub async fn apply(&self, event: ChangeEvent) -> ReconcileOutcome {
        let ChangeEvent { board_id, change } = event;
        if let EntityChange::Board { event, new, old } = change {
            return self.apply_board(board_id, event, new, old);
        }

        let current = self.engine.boards().read(|state| state.current_board_id());
        if current != Some(board_id) {
            return ReconcileOutcome::Ignored;
        }

        let outcome = match change {
            EntityChange::Board { .. } => Ok(ReconcileOutcome::Ignored),
            EntityChange::Column { event, new, old } => self.apply_column(event, new, old),
            EntityChange::Task { event, new, old } => self.apply_task(event, new, old).await,
            EntityChange::Tag { event, new, old } => self.apply_tag(board_id, event, new, old),
        };

        match outcome {
            Err(reason) => self.refetch(board_id, reason).await,
            Ok(ReconcileOutcome::Applied) => {
                let violations = self
                    .engine
                    .boards()
                    .read(|state| board_invariant_violations(&state.columns));
                match violations.first() {
                    Some(violation) => self.refetch(board_id, violation.error_code()).await,
                    None => ReconcileOutcome::Applied,
                }
            }
            Ok(outcome) => outcome,
        }
    }

    fn apply_board(
        &self,
        board_id: BoardId,
        event: ChangeKind,
        new: Option<Board>,
        old: Option<Board>,
    ) -> ReconcileOutcome {
        match event {
            ChangeKind::Created => {
                let Some(board) = new else {
                    return ReconcileOutcome::Ignored;
                };
                let mut applied = false;
                self.engine.boards().apply(|state| {
                    if !state.boards.iter().any(|listed| listed.id == board.id) {
                        state.boards.insert(0, board);
                        applied = true;
                    }
                });
                outcome_of(applied)
            }
            ChangeKind::Updated => {
                let Some(board) = new else {
                    return ReconcileOutcome::Ignored;
                };
                let mut applied = false;
                self.engine.boards().apply(|state| {
                    for slot in state
                        .boards
                        .iter_mut()
                        .chain(state.current_board.as_mut())
                        .filter(|slot| slot.id == board.id)
                    {
                        slot.title = board.title.clone();
                        slot.updated_at = board.updated_at;
                        applied = true;
                    }
                });
                outcome_of(applied)
            }
            ChangeKind::Deleted => {
                let deleted = old.map(|board| board.id).unwrap_or(board_id);
                let mut applied = false;
                self.engine.boards().apply(|state| {
                    let before = state.boards.len();
                    state.boards.retain(|board| board.id != deleted);
                    applied = state.boards.len() != before;
                    if state.current_board_id() == Some(deleted) {
                        state.current_board = None;
                        state.columns.clear();
                        applied = true;
                    }
                });
                self.engine.tags().apply(|state| {
                    if state.board_id == Some(deleted) {
                        state.board_id = None;
                        state.tags.clear();
                    }
                });
                outcome_of(applied)
            }
        }
    }

    fn apply_column(
        &self,
        event: ChangeKind,
        new: Option<ColumnRecord>,
        old: Option<ColumnRecord>,
    ) -> Result<ReconcileOutcome, &'static str> {
        let boards = self.engine.boards();
        match event {
            ChangeKind::Created => {
                let known = new
                    .is_some_and(|record| boards.read(|state| state.column(record.id).is_some()));
                if known {
                    return Ok(ReconcileOutcome::Ignored);
                }
                Err("column_created")
            }
            ChangeKind::Deleted => {
                let known = old
                    .or(new)
                    .is_some_and(|record| boards.read(|state| state.column(record.id).is_some()));
                if !known {
                    return Ok(ReconcileOutcome::Ignored);
                }
                Err("column_deleted")
            }
            ChangeKind::Updated => {
                let Some(record) = new else {
                    return Ok(ReconcileOutcome::Ignored);
                };
                let local_index = boards
                    .read(|state| state.column_index(record.id))
                    .ok_or("column_missing")?;
                if local_index as i32 != record.position {
                    return Err("column_reordered");
                }
                let mut applied = false;
                boards.apply(|state| {
                    if let Some(column) = state.column_mut(record.id) {
                        if column.title != record.title {
                            column.title = record.title.clone();
                            applied = true;
                        }
                        column.updated_at = record.updated_at;
                    }
                });
                Ok(outcome_of(applied))
            }
        }
    }

    async fn apply_task(
        &self,
        event: ChangeKind,
        new: Option<TaskRecord>,
        old: Option<TaskRecord>,
    ) -> Result<ReconcileOutcome, &'static str> {
        let boards = self.engine.boards();
        match event {
            ChangeKind::Created => {
                let Some(record) = new else {
                    return Ok(ReconcileOutcome::Ignored);
                };
                if boards.read(|state| state.task(record.id).is_some()) {
                    merge_task_fields(self.engine.boards(), &record);
                    return Ok(ReconcileOutcome::Applied);
                }
                let mut inserted = false;
                boards.apply(|state| {
                    if let Some(column) = state.column_mut(record.column_id) {
                        let index =
                            clamp_insert_index(record.position.max(0) as usize, column.tasks.len());
                        column.tasks.insert(index, record.clone().into_task(vec![]));
                        reassign_positions(&mut column.tasks);
                        inserted = true;
                    }
                });
                if inserted {
                    Ok(ReconcileOutcome::Applied)
                } else {
                    Err("task_column_missing")
                }
            }
            ChangeKind::Updated => {
                let Some(record) = new else {
                    return Ok(ReconcileOutcome::Ignored);
                };
                let placement = boards.read(|state| {
                    let (column_index, task_index) = state.locate_task(record.id)?;
                    let source = &state.columns[column_index];
                    let destination = state.column(record.column_id)?;
                    let requested = record.position.max(0) as usize;
                    let destination_index = if source.id == destination.id {
                        requested.min(destination.tasks.len().saturating_sub(1))
                    } else {
                        clamp_insert_index(requested, destination.tasks.len())
                    };
                    Some((source.id, task_index, destination_index))
                });
                let (source_column_id, task_index, destination_index) =
                    placement.ok_or("task_or_column_missing")?;

                if source_column_id != record.column_id || task_index != destination_index {
                    let mv = TaskMove {
                        task_id: record.id,
                        source_column_id,
                        destination_column_id: record.column_id,
                        destination_index,
                    };
                    if let Err(err) = self.engine.try_move_task(mv, Origin::RemoteEcho).await {
                        warn!(task_id = %record.id, error = %err, "remote move could not be mirrored");
                        return Err("task_move_failed");
                    }
                }
                merge_task_fields(boards, &record);
                Ok(ReconcileOutcome::Applied)
            }
            ChangeKind::Deleted => {
                let Some(task_id) = old.or(new).map(|record| record.id) else {
                    return Ok(ReconcileOutcome::Ignored);
                };
                let mut removed = false;
                boards.apply(|state| removed = state.remove_task(task_id).is_some());
                Ok(outcome_of(removed))
            }
        }
    }

    fn apply_tag(
        &self,
        board_id: BoardId,
        event: ChangeKind,
        new: Option<Tag>,
        old: Option<Tag>,
    ) -> Result<ReconcileOutcome, &'static str> {
        let tags = self.engine.tags();
        if tags.read(|state| state.board_id) != Some(board_id) {
            return Ok(ReconcileOutcome::Ignored);
        }
        match event {
            ChangeKind::Created => {
                let Some(tag) = new else {
                    return Ok(ReconcileOutcome::Ignored);
                };
                let mut applied = false;
                tags.apply(|state| {
                    if state.tag(tag.id).is_none() {
                        state.tags.push(tag);
                        applied = true;
                    }
                });
                Ok(outcome_of(applied))
            }
            ChangeKind::Updated => {
                let Some(tag) = new else {
                    return Ok(ReconcileOutcome::Ignored);
                };
                tags.apply(|state| match state.tags.iter_mut().find(|slot| slot.id == tag.id) {
                    Some(slot) => *slot = tag.clone(),
                    None => state.tags.push(tag.clone()),
                });
                self.engine.boards().apply(|state| state.refresh_task_tag(&tag));
                Ok(ReconcileOutcome::Applied)
            }
            ChangeKind::Deleted => {
                let Some(tag_id) = old.or(new).map(|tag| tag.id) else {
                    return Ok(ReconcileOutcome::Ignored);
                };
                let mut applied = false;
                tags.apply(|state| {
                    let before = state.tags.len();
                    state.tags.retain(|tag| tag.id != tag_id);
                    applied = state.tags.len() != before;
                });
                self.engine.boards().apply(|state| {
                    if !state.strip_tag(tag_id).is_empty() {
                        applied = true;
                    }
                });
                Ok(outcome_of(applied))
            }
        }
    }

    async fn refetch(&self, board_id: BoardId, reason: &'static str) -> ReconcileOutcome {
        warn!(board_id = %board_id, reason, "local board is stale, refetching");
        if let Err(err) = self.engine.refresh_board().await {
            error!(board_id = %board_id, error = %err, "refetch after change event failed");
        }
        ReconcileOutcome::Refetched
    }
}

fn outcome_of(applied: bool) -> ReconcileOutcome {
    if applied {
        ReconcileOutcome::Applied
    } else {
        ReconcileOutcome::Ignored
    }
}

/// Copies the record's own fields; placement and tags stay as they are.
fn merge_task_fields(boards: &BoardStore, record: &TaskRecord) {
    boards.apply(|state| {
        if let Some(task) = state.task_mut(record.id) {
            task.title = record.title.clone();
            task.description = record.description.clone();
            task.assignee = record.assignee.clone();
            task.created_at = record.created_at;
            task.updated_at = record.updated_at;
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ids::new_id;
    use crate::invariants::ensure_board_invariants;
    use crate::memory::{BackendCall, MemoryBackend};
    use crate::models::{BoardDetail, TagColor, now};

    async fn reconciler(
        columns: &[(&str, &[&str])],
    ) -> (ChangeReconciler<MemoryBackend>, BoardDetail) {
        let backend = Arc::new(MemoryBackend::new());
        let detail = backend.seed_board("Launch", columns).await;
        let engine = BoardEngine::new(Arc::clone(&backend), BoardConfig::default());
        engine.load_board(detail.board.id).await.expect("load");
        backend.clear_calls().await;
        (ChangeReconciler::new(engine), detail)
    }

    fn task_event(board_id: BoardId, event: ChangeKind, record: TaskRecord) -> ChangeEvent {
        let (new, old) = match event {
            ChangeKind::Deleted => (None, Some(record)),
            _ => (Some(record), None),
        };
        ChangeEvent {
            board_id,
            change: EntityChange::Task { event, new, old },
        }
    }

    fn titles(reconciler: &ChangeReconciler<MemoryBackend>, column: usize) -> Vec<String> {
        reconciler.engine().boards().read(|state| {
            state.columns[column]
                .tasks
                .iter()
                .map(|task| task.title.clone())
                .collect()
        })
    }

    #[tokio::test]
    async fn collaborator_move_is_mirrored_without_backend_calls() {
        let (reconciler, detail) =
            reconciler(&[("To Do", &["T1", "T2"]), ("Done", &["T3"])]).await;
        let mut record = detail.columns[0].tasks[0].record();
        record.column_id = detail.columns[1].id;
        record.position = 1;

        let outcome = reconciler
            .apply(task_event(detail.board.id, ChangeKind::Updated, record))
            .await;

        assert_eq!(outcome, ReconcileOutcome::Applied);
        assert_eq!(titles(&reconciler, 0), ["T2"]);
        assert_eq!(titles(&reconciler, 1), ["T3", "T1"]);
        let engine = reconciler.engine();
        assert!(engine.boards().read(|state| ensure_board_invariants(&state.columns).is_ok()));
        assert!(engine.backend().calls().await.is_empty());
    }

    #[tokio::test]
    async fn field_updates_merge_in_place() {
        let (reconciler, detail) = reconciler(&[("To Do", &["T1", "T2"])]).await;
        let mut record = detail.columns[0].tasks[1].record();
        record.title = "T2 (edited)".to_string();
        record.assignee = Some("kim".to_string());

        let outcome = reconciler
            .apply(task_event(detail.board.id, ChangeKind::Updated, record))
            .await;

        assert_eq!(outcome, ReconcileOutcome::Applied);
        assert_eq!(titles(&reconciler, 0), ["T1", "T2 (edited)"]);
    }

    #[tokio::test]
    async fn created_tasks_are_inserted_at_their_position() {
        let (reconciler, detail) = reconciler(&[("To Do", &["T1", "T2"])]).await;
        let record = TaskRecord {
            id: new_id(),
            column_id: detail.columns[0].id,
            title: "Remote".to_string(),
            description: None,
            assignee: None,
            position: 1,
            created_at: now(),
            updated_at: now(),
        };

        let first = reconciler
            .apply(task_event(detail.board.id, ChangeKind::Created, record.clone()))
            .await;
        let again = reconciler
            .apply(task_event(detail.board.id, ChangeKind::Created, record))
            .await;

        assert_eq!(first, ReconcileOutcome::Applied);
        assert_eq!(again, ReconcileOutcome::Applied);
        assert_eq!(titles(&reconciler, 0), ["T1", "Remote", "T2"]);
    }

    #[tokio::test]
    async fn update_for_unknown_column_triggers_refetch() {
        let (reconciler, detail) = reconciler(&[("To Do", &["T1"])]).await;
        let mut record = detail.columns[0].tasks[0].record();
        record.column_id = new_id();

        let outcome = reconciler
            .apply(task_event(detail.board.id, ChangeKind::Updated, record))
            .await;

        assert_eq!(outcome, ReconcileOutcome::Refetched);
        let calls = reconciler.engine().backend().calls().await;
        assert!(calls.contains(&BackendCall::GetBoard));
    }

    #[tokio::test]
    async fn column_creation_refetches_and_other_boards_are_ignored() {
        let (reconciler, detail) = reconciler(&[("To Do", &[])]).await;
        let column = ColumnRecord {
            id: new_id(),
            board_id: detail.board.id,
            title: "Review".to_string(),
            position: 1,
            created_at: now(),
            updated_at: now(),
        };
        let created = ChangeEvent {
            board_id: detail.board.id,
            change: EntityChange::Column {
                event: ChangeKind::Created,
                new: Some(column.clone()),
                old: None,
            },
        };
        let elsewhere = ChangeEvent {
            board_id: new_id(),
            ..created.clone()
        };

        assert_eq!(reconciler.apply(elsewhere).await, ReconcileOutcome::Ignored);
        assert_eq!(reconciler.apply(created).await, ReconcileOutcome::Refetched);
    }

    #[tokio::test]
    async fn tag_updates_reach_tasks() {
        let backend = Arc::new(MemoryBackend::new());
        let detail = backend.seed_board("Launch", &[("To Do", &["T1"])]).await;
        let bug = backend
            .seed_tag(detail.board.id, "Bug", "#FF0000")
            .await
            .expect("tag");
        let engine = BoardEngine::new(Arc::clone(&backend), BoardConfig::default());
        engine.load_board(detail.board.id).await.expect("load");
        let task_id = detail.columns[0].tasks[0].id;
        engine.set_task_tags(task_id, &[bug.id]).await.expect("tagged");
        let reconciler = ChangeReconciler::new(engine);

        let renamed = Tag {
            name: "Defect".to_string(),
            color: TagColor::parse("#AA0000").expect("color"),
            ..bug.clone()
        };
        let outcome = reconciler
            .apply(ChangeEvent {
                board_id: detail.board.id,
                change: EntityChange::Tag {
                    event: ChangeKind::Updated,
                    new: Some(renamed.clone()),
                    old: Some(bug),
                },
            })
            .await;

        assert_eq!(outcome, ReconcileOutcome::Applied);
        let engine = reconciler.engine();
        assert_eq!(engine.tags().read(|state| state.tags.clone()), vec![renamed.clone()]);
        assert_eq!(
            engine.boards().read(|state| state.task(task_id).map(|t| t.tags.clone())),
            Some(vec![renamed])
        );
    }

    #[tokio::test]
    async fn board_deletion_clears_the_open_board() {
        let (reconciler, detail) = reconciler(&[("To Do", &["T1"])]).await;

        let outcome = reconciler
            .apply(ChangeEvent {
                board_id: detail.board.id,
                change: EntityChange::Board {
                    event: ChangeKind::Deleted,
                    new: None,
                    old: Some(detail.board.clone()),
                },
            })
            .await;

        assert_eq!(outcome, ReconcileOutcome::Applied);
        let state = reconciler.engine().boards().current();
        assert!(state.current_board.is_none());
        assert!(state.columns.is_empty());
    }

    #[tokio::test]
    async fn run_drains_the_channel_until_closed() {
        let (reconciler, detail) = reconciler(&[("To Do", &["T1", "T2"])]).await;
        let (tx, rx) = channel(reconciler.engine().config());
        let deleted = detail.columns[0].tasks[0].record();
        tx.send(task_event(detail.board.id, ChangeKind::Deleted, deleted.clone()))
            .await
            .expect("send");
        tx.send(task_event(detail.board.id, ChangeKind::Deleted, deleted))
            .await
            .expect("send");
        drop(tx);

        assert_eq!(reconciler.run(rx).await, 2);
        assert_eq!(titles(&reconciler, 0), ["T2"]);
    }
}
