use anyhow::anyhow;
use tracing::debug;

use super::BoardEngine;
use crate::backend::BoardBackend;
use crate::error::{LibError, Result};
use crate::ids::{BoardId, new_id};
use crate::ledger::EntityKey;
use crate::models::{Board, BoardDetail, normalize_title, now};
use crate::reorder::reassign_positions;
use crate::store::{MutationKind, StoreError};

impl<B: BoardBackend> BoardEngine<B> {
    pub async fn load_boards(&self) -> Option<Vec<Board>> {
        self.try_load_boards().await.ok()
    }

    pub async fn try_load_boards(&self) -> Result<Vec<Board>> {
        self.boards.apply(|state| state.is_loading = true);
        match self.backend.list_boards().await {
            Ok(boards) => {
                let ledger = &self.ledger;
                self.boards.apply(|state| {
                    state.adopt_boards(boards.clone(), |id| ledger.is_pending(id));
                    state.is_loading = false;
                });
                Ok(boards)
            }
            Err(err) => {
                let slot = StoreError::from_lib(MutationKind::LoadBoards, &err);
                self.boards.apply(|state| {
                    state.is_loading = false;
                    state.error = Some(slot);
                });
                Err(err)
            }
        }
    }

    /// Makes `board_id` the current board and loads its tags alongside.
    pub async fn load_board(&self, board_id: BoardId) -> Option<BoardDetail> {
        self.try_load_board(board_id).await.ok()
    }

    pub async fn try_load_board(&self, board_id: BoardId) -> Result<BoardDetail> {
        self.boards.apply(|state| state.is_loading = true);
        let detail = match self.backend.get_board(board_id).await {
            Ok(detail) => normalize_detail(detail),
            Err(err) => {
                let slot = StoreError::from_lib(MutationKind::LoadBoard, &err);
                self.boards.apply(|state| {
                    state.is_loading = false;
                    state.error = Some(slot);
                });
                return Err(err);
            }
        };

        let ledger = &self.ledger;
        self.boards.apply(|state| {
            if state.current_board_id() == Some(board_id) {
                state.adopt_columns(detail.columns.clone(), |id| ledger.is_pending(id));
            } else {
                state.columns = detail.columns.clone();
            }
            state.current_board = Some(detail.board.clone());
            state.is_loading = false;
            if let Some(listed) = state.boards.iter_mut().find(|board| board.id == board_id) {
                *listed = detail.board.clone();
            }
        });
        debug!(board_id = %board_id, columns = detail.columns.len(), "board loaded");

        if let Err(err) = self.try_load_tags(board_id).await {
            debug!(board_id = %board_id, error = %err, "tags failed to load with board");
        }
        Ok(detail)
    }

    /// Refetches the current board, if any.
    pub async fn refresh_board(&self) -> Result<()> {
        match self.boards.read(|state| state.current_board_id()) {
            Some(board_id) => self.try_load_board(board_id).await.map(|_| ()),
            None => Ok(()),
        }
    }

    pub async fn create_board(&self, title: &str) -> Option<Board> {
        self.try_create_board(title).await.ok()
    }

    pub async fn try_create_board(&self, title: &str) -> Result<Board> {
        let kind = MutationKind::CreateBoard;
        let title = self.board_guard(kind, normalize_title(title, "Board title is required"))?;
        let timestamp = now();
        let temp = Board {
            id: new_id(),
            title: title.clone(),
            created_at: timestamp,
            updated_at: timestamp,
        };

        self.boards
            .apply(|state| state.boards.insert(0, temp.clone()));
        let ticket = self.ledger.begin(vec![EntityKey::Board(temp.id)]);
        self.ledger.register_pending(temp.id.0);
        debug!(board_id = %temp.id, "optimistic board created");

        let result = self.backend.create_board(&title).await;
        self.ledger.resolve_pending(temp.id.0);
        match result {
            Ok(created) => {
                self.boards
                    .apply(|state| state.substitute_board_id(temp.id, &created));
                self.ledger.finish(&ticket);
                debug!(temp_id = %temp.id, board_id = %created.id, "board confirmed");
                Ok(created)
            }
            Err(err) => {
                self.rollback_board(kind, &ticket, err, |state| {
                    state.boards.retain(|board| board.id != temp.id)
                })
                .await
            }
        }
    }

    /// Deletes a board. Confirmation (see `Board::confirms_deletion`) is the
    /// caller's responsibility.
    pub async fn delete_board(&self, board_id: BoardId) -> Option<()> {
        self.try_delete_board(board_id).await.ok()
    }

    pub async fn try_delete_board(&self, board_id: BoardId) -> Result<()> {
        let kind = MutationKind::DeleteBoard;
        self.board_guard(
            kind,
            self.ensure_persisted(board_id.0, "Board is still being saved"),
        )?;

        let removed = self.boards.try_apply(|state| {
            let listed = state
                .boards
                .iter()
                .position(|board| board.id == board_id)
                .map(|index| (index, state.boards.remove(index)));
            let opened = if state.current_board_id() == Some(board_id) {
                Some((state.current_board.take(), std::mem::take(&mut state.columns)))
            } else {
                None
            };
            if listed.is_none() && opened.is_none() {
                return Err(LibError::not_found(
                    "Board not found",
                    anyhow!("board {} is not loaded", board_id),
                ));
            }
            Ok((listed, opened))
        });
        let (listed, opened) = self.board_guard(kind, removed)?;
        let ticket = self.ledger.begin(vec![EntityKey::Board(board_id)]);
        debug!(board_id = %board_id, "optimistic board delete");

        match self.backend.delete_board(board_id).await {
            Ok(()) => {
                self.ledger.finish(&ticket);
                self.tags.apply(|state| {
                    if state.board_id == Some(board_id) {
                        state.board_id = None;
                        state.tags.clear();
                    }
                });
                Ok(())
            }
            Err(err) => {
                self.rollback_board(kind, &ticket, err, |state| {
                    if let Some((index, board)) = listed {
                        if !state.boards.iter().any(|listed| listed.id == board_id) {
                            let index = index.min(state.boards.len());
                            state.boards.insert(index, board);
                        }
                    }
                    // Another board opened meanwhile keeps the screen.
                    if let Some((current, columns)) = opened {
                        if state.current_board.is_none() {
                            state.current_board = current;
                            state.columns = columns;
                        }
                    }
                })
                .await
            }
        }
    }
}

/// Orders columns and tasks by position and re-derives dense positions.
pub(crate) fn normalize_detail(mut detail: BoardDetail) -> BoardDetail {
    detail.columns.sort_by_key(|column| column.position);
    reassign_positions(&mut detail.columns);
    for column in &mut detail.columns {
        column.tasks.sort_by_key(|task| task.position);
        reassign_positions(&mut column.tasks);
        for task in &mut column.tasks {
            task.column_id = column.id;
        }
    }
    detail
}
