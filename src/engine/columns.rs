use anyhow::anyhow;
use tracing::{debug, warn};

use super::{BoardEngine, column_not_found};
use crate::backend::BoardBackend;
use crate::error::{LibError, Result};
use crate::ids::{ColumnId, new_id};
use crate::ledger::EntityKey;
use crate::models::{Column, normalize_title, now};
use crate::reorder::{move_within, reassign_positions};
use crate::store::MutationKind;

impl<B: BoardBackend> BoardEngine<B> {
    pub async fn create_column(&self, title: &str) -> Option<Column> {
        self.try_create_column(title).await.ok()
    }

    /// Appends a column to the current board.
    pub async fn try_create_column(&self, title: &str) -> Result<Column> {
        let kind = MutationKind::AddColumn;
        let title = self.board_guard(kind, normalize_title(title, "Column title is required"))?;
        let board_id = self.board_guard(kind, self.current_board_id())?;
        self.board_guard(
            kind,
            self.ensure_persisted(board_id.0, "Board is still being saved"),
        )?;

        let temp_id: ColumnId = new_id();
        let timestamp = now();
        let position = self.boards.read(|state| state.columns.len()) as i32;
        self.boards.apply(|state| {
            state.columns.push(Column {
                id: temp_id,
                board_id,
                title: title.clone(),
                position,
                tasks: vec![],
                created_at: timestamp,
                updated_at: timestamp,
            })
        });
        let ticket = self.ledger.begin(vec![EntityKey::Column(temp_id)]);
        self.ledger.register_pending(temp_id.0);
        debug!(column_id = %temp_id, board_id = %board_id, position, "optimistic column created");

        let result = self.backend.create_column(board_id, &title, position).await;
        self.ledger.resolve_pending(temp_id.0);
        match result {
            Ok(created) => {
                let mut placed = true;
                self.boards
                    .apply(|state| placed = state.substitute_column_id(temp_id, &created));
                if !placed {
                    warn!(column_id = %created.id, board_id = %board_id, "confirmed column belongs to a board no longer open");
                }
                self.ledger.finish(&ticket);
                debug!(temp_id = %temp_id, column_id = %created.id, "column confirmed");
                Ok(created)
            }
            Err(err) => {
                self.rollback_board(kind, &ticket, err, |state| {
                    state.remove_column(temp_id);
                })
                .await
            }
        }
    }

    pub async fn rename_column(&self, column_id: ColumnId, title: &str) -> Option<Column> {
        self.try_rename_column(column_id, title).await.ok()
    }

    pub async fn try_rename_column(&self, column_id: ColumnId, title: &str) -> Result<Column> {
        let kind = MutationKind::RenameColumn;
        let title = self.board_guard(kind, normalize_title(title, "Column title is required"))?;
        self.board_guard(
            kind,
            self.ensure_persisted(column_id.0, "Column is still being saved"),
        )?;

        let staged = self.boards.try_apply(|state| {
            let column = state
                .column_mut(column_id)
                .ok_or_else(|| column_not_found(column_id))?;
            let original = (column.title.clone(), column.updated_at);
            column.title = title.clone();
            column.updated_at = now();
            Ok(original)
        });
        let (original_title, original_updated_at) = self.board_guard(kind, staged)?;
        let ticket = self.ledger.begin(vec![EntityKey::Column(column_id)]);
        debug!(column_id = %column_id, "optimistic column rename");

        match self.backend.update_column(column_id, &title).await {
            Ok(confirmed) => {
                if self.ledger.is_current(&ticket) {
                    self.boards.apply(|state| {
                        if let Some(column) = state.column_mut(column_id) {
                            column.title = confirmed.title.clone();
                            column.updated_at = confirmed.updated_at;
                        }
                    });
                }
                self.ledger.finish(&ticket);
                Ok(confirmed)
            }
            Err(err) => {
                self.rollback_board(kind, &ticket, err, |state| {
                    if let Some(column) = state.column_mut(column_id) {
                        column.title = original_title;
                        column.updated_at = original_updated_at;
                    }
                })
                .await
            }
        }
    }

    pub async fn delete_column(&self, column_id: ColumnId) -> Option<()> {
        self.try_delete_column(column_id).await.ok()
    }

    /// Removes a column with its tasks. Rollback puts it back at its old index.
    pub async fn try_delete_column(&self, column_id: ColumnId) -> Result<()> {
        let kind = MutationKind::DeleteColumn;
        let board_id = self.board_guard(kind, self.current_board_id())?;
        self.board_guard(
            kind,
            self.ensure_persisted(column_id.0, "Column is still being saved"),
        )?;

        let removed = self.boards.try_apply(|state| {
            state
                .remove_column(column_id)
                .ok_or_else(|| column_not_found(column_id))
        });
        let (index, column) = self.board_guard(kind, removed)?;
        let ticket = self.ledger.begin(vec![EntityKey::Column(column_id)]);
        debug!(column_id = %column_id, index, "optimistic column delete");

        match self.backend.delete_column(column_id).await {
            Ok(()) => {
                self.ledger.finish(&ticket);
                Ok(())
            }
            Err(err) => {
                self.rollback_board(kind, &ticket, err, |state| {
                    if state.current_board_id() == Some(board_id) && state.column(column_id).is_none() {
                        state.insert_column_at(index, column);
                    }
                })
                .await
            }
        }
    }

    pub async fn move_column(&self, source_index: usize, destination_index: usize) -> Option<()> {
        self.try_move_column(source_index, destination_index)
            .await
            .ok()
    }

    /// Reorders the current board's columns; the backend receives the full id
    /// order and takes positions from it.
    pub async fn try_move_column(&self, source_index: usize, destination_index: usize) -> Result<()> {
        let kind = MutationKind::ReorderColumns;
        let board_id = self.board_guard(kind, self.current_board_id())?;
        let len = self.boards.read(|state| state.columns.len());
        if source_index >= len || destination_index >= len {
            return self.board_guard(
                kind,
                Err(LibError::validation_with_code(
                    "move_index_out_of_range",
                    "Column index is out of range",
                    anyhow!("{} -> {} with {} columns", source_index, destination_index, len),
                )),
            );
        }
        if source_index == destination_index {
            debug!(index = source_index, "column dropped on its own slot");
            return Ok(());
        }
        let pending = self.boards.read(|state| {
            state
                .columns
                .iter()
                .find(|column| self.ledger.is_pending(column.id.0))
                .map(|column| column.id)
        });
        if let Some(column_id) = pending {
            self.board_guard(
                kind,
                self.ensure_persisted(column_id.0, "Column is still being saved"),
            )?;
        }

        let reordered = self.boards.try_apply(|state| {
            let previous: Vec<ColumnId> = state.columns.iter().map(|column| column.id).collect();
            move_within(&mut state.columns, source_index, destination_index)?;
            let next: Vec<ColumnId> = state.columns.iter().map(|column| column.id).collect();
            Ok((previous, next))
        });
        let (previous, next) = self.board_guard(kind, reordered)?;
        let ticket = self.ledger.begin(vec![EntityKey::ColumnOrder(board_id)]);
        debug!(board_id = %board_id, source_index, destination_index, "optimistic column reorder");

        match self.backend.reorder_columns(board_id, &next).await {
            Ok(()) => {
                self.ledger.finish(&ticket);
                Ok(())
            }
            Err(err) => {
                self.rollback_board(kind, &ticket, err, |state| {
                    state.columns.sort_by_key(|column| {
                        previous
                            .iter()
                            .position(|id| *id == column.id)
                            .unwrap_or(usize::MAX)
                    });
                    reassign_positions(&mut state.columns);
                })
                .await
            }
        }
    }
}
