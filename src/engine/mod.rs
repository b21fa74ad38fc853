//! Optimistic mutation engine.
//!
//! Every mutation validates against the current store, captures the slice it is
//! about to change, writes the optimistic value before its first await, calls the
//! backend, then either adopts the confirmed identifiers/timestamps or undoes the
//! optimistic write. Failures land in the owning container's error slot; `try_*`
//! variants additionally hand the error back to the caller.

mod boards;
mod columns;
mod tags;
mod tasks;

use std::sync::Arc;

use anyhow::anyhow;
use tracing::{error, warn};
use uuid::Uuid;

use crate::backend::BoardBackend;
use crate::config::BoardConfig;
use crate::error::{LibError, Result};
use crate::ids::{BoardId, ColumnId, TagId, TaskId};
use crate::ledger::{MutationLedger, MutationTicket};
use crate::store::{BoardState, BoardStore, MutationKind, StoreError, TagState, TagStore};

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Direct user action; full optimistic/rollback protocol.
    Local,
    /// Already durable on the server; only the local mirror is updated.
    RemoteEcho,
    /// Issued by the intent bridge; same protocol as `Local`.
    Assistant,
}

impl Origin {
    pub const fn is_remote_echo(self) -> bool {
        matches!(self, Origin::RemoteEcho)
    }
}

pub struct BoardEngine<B> {
    backend: Arc<B>,
    boards: BoardStore,
    tags: TagStore,
    ledger: MutationLedger,
    config: BoardConfig,
}

impl<B> Clone for BoardEngine<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            boards: self.boards.clone(),
            tags: self.tags.clone(),
            ledger: self.ledger.clone(),
            config: self.config.clone(),
        }
    }
}

impl<B: BoardBackend> BoardEngine<B> {
    pub fn new(backend: Arc<B>, config: BoardConfig) -> Self {
        Self::with_stores(backend, BoardStore::default(), TagStore::default(), config)
    }

    /// Builds an engine over containers the caller already owns.
    pub fn with_stores(
        backend: Arc<B>,
        boards: BoardStore,
        tags: TagStore,
        config: BoardConfig,
    ) -> Self {
        Self {
            backend,
            boards,
            tags,
            ledger: MutationLedger::new(),
            config,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn boards(&self) -> &BoardStore {
        &self.boards
    }

    pub fn tags(&self) -> &TagStore {
        &self.tags
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn ledger(&self) -> &MutationLedger {
        &self.ledger
    }

    pub fn set_dragging(&self, is_dragging: bool) {
        self.boards.apply(|state| state.is_dragging = is_dragging);
    }

    pub fn clear_error(&self) {
        self.boards.apply(|state| state.error = None);
    }

    pub fn clear_tag_error(&self) {
        self.tags.apply(|state| state.error = None);
    }

    fn current_board_id(&self) -> Result<BoardId> {
        self.boards
            .read(BoardState::current_board_id)
            .ok_or_else(|| LibError::validation("No board is selected", anyhow!("no current board")))
    }

    fn ensure_persisted(&self, id: Uuid, public: &'static str) -> Result<()> {
        if self.ledger.is_pending(id) {
            return Err(LibError::validation_with_code(
                "entity_pending",
                public,
                anyhow!("{} has not been confirmed by the backend yet", id),
            ));
        }
        Ok(())
    }

    fn record_board_error(&self, operation: MutationKind, err: &LibError) {
        let slot = StoreError::from_lib(operation, err);
        self.boards.apply(|state| state.error = Some(slot));
    }

    fn record_tag_error(&self, operation: MutationKind, err: &LibError) {
        let slot = StoreError::from_lib(operation, err);
        self.tags.apply(|state| state.error = Some(slot));
    }

    /// Records a pre-flight failure in the board slot and passes it through.
    fn board_guard<T>(&self, operation: MutationKind, result: Result<T>) -> Result<T> {
        result.inspect_err(|err| self.record_board_error(operation, err))
    }

    fn tag_guard<T>(&self, operation: MutationKind, result: Result<T>) -> Result<T> {
        result.inspect_err(|err| self.record_tag_error(operation, err))
    }

    /// Undoes an optimistic board write after a backend failure. The undo and the
    /// error land in one transition. A superseded ticket skips the undo; the slice
    /// is refetched instead. Creates and deletes key their ticket on the entity
    /// itself, so their undo always runs.
    async fn rollback_board<T>(
        &self,
        operation: MutationKind,
        ticket: &MutationTicket,
        err: LibError,
        undo: impl FnOnce(&mut BoardState),
    ) -> Result<T> {
        let slot = StoreError::from_lib(operation, &err);
        if self.ledger.is_current(ticket) {
            warn!(operation = operation.describe(), error = %err, "rolling back optimistic update");
            self.boards.apply(|state| {
                undo(state);
                state.error = Some(slot);
            });
        } else {
            warn!(
                operation = operation.describe(),
                error = %err,
                "superseded update failed, skipping snapshot restore"
            );
            self.boards.apply(|state| state.error = Some(slot));
            if self.config.resync_on_stale {
                self.resync_board().await;
            }
        }
        self.ledger.finish(ticket);
        Err(err)
    }

    /// Tag-side twin of `rollback_board`. The tag list is restored before the
    /// tasks that reference it.
    async fn rollback_tags<T>(
        &self,
        operation: MutationKind,
        ticket: &MutationTicket,
        err: LibError,
        undo_tags: impl FnOnce(&mut TagState),
        undo_tasks: impl FnOnce(&mut BoardState),
    ) -> Result<T> {
        let slot = StoreError::from_lib(operation, &err);
        if self.ledger.is_current(ticket) {
            warn!(operation = operation.describe(), error = %err, "rolling back optimistic tag update");
            self.tags.apply(|state| {
                undo_tags(state);
                state.error = Some(slot);
            });
            self.boards.apply(undo_tasks);
        } else {
            warn!(
                operation = operation.describe(),
                error = %err,
                "superseded tag update failed, skipping snapshot restore"
            );
            self.tags.apply(|state| state.error = Some(slot));
            if self.config.resync_on_stale {
                self.resync_tags().await;
            }
        }
        self.ledger.finish(ticket);
        Err(err)
    }

    async fn resync_board(&self) {
        if let Err(err) = self.refresh_board().await {
            error!(error = %err, "board resync failed");
        }
    }

    async fn resync_tags(&self) {
        let Some(board_id) = self.tags.read(|state| state.board_id) else {
            return;
        };
        if let Err(err) = self.try_load_tags(board_id).await {
            error!(board_id = %board_id, error = %err, "tag resync failed");
        }
    }
}

fn column_not_found(column_id: ColumnId) -> LibError {
    LibError::not_found(
        "Column not found",
        anyhow!("column {} is not on the current board", column_id),
    )
}

fn task_not_found(task_id: TaskId) -> LibError {
    LibError::not_found(
        "Task not found",
        anyhow!("task {} is not on the current board", task_id),
    )
}

fn tag_not_found(tag_id: TagId) -> LibError {
    LibError::not_found("Tag not found", anyhow!("tag {} is not loaded", tag_id))
}
