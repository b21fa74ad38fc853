use tracing::debug;

use super::{BoardEngine, tag_not_found};
use crate::backend::BoardBackend;
use crate::error::Result;
use crate::ids::{BoardId, TagId, new_id};
use crate::ledger::EntityKey;
use crate::models::{Tag, TagColor, TagPatch, normalize_title};
use crate::store::{MutationKind, StoreError};

impl<B: BoardBackend> BoardEngine<B> {
    pub async fn load_tags(&self, board_id: BoardId) -> Option<Vec<Tag>> {
        self.try_load_tags(board_id).await.ok()
    }

    pub async fn try_load_tags(&self, board_id: BoardId) -> Result<Vec<Tag>> {
        self.tags.apply(|state| {
            if state.board_id != Some(board_id) {
                state.tags.clear();
            }
            state.board_id = Some(board_id);
            state.is_loading = true;
        });
        match self.backend.list_tags(board_id).await {
            Ok(tags) => {
                let ledger = &self.ledger;
                self.tags.apply(|state| {
                    state.adopt_tags(tags.clone(), |id| ledger.is_pending(id));
                    state.is_loading = false;
                });
                Ok(tags)
            }
            Err(err) => {
                let slot = StoreError::from_lib(MutationKind::LoadTags, &err);
                self.tags.apply(|state| {
                    state.is_loading = false;
                    state.error = Some(slot);
                });
                Err(err)
            }
        }
    }

    pub async fn create_tag(&self, name: &str, color: &str) -> Option<Tag> {
        self.try_create_tag(name, color).await.ok()
    }

    /// Adds a tag to the current board. Name and color uniqueness is enforced by
    /// the backend; a conflict rolls the optimistic tag back.
    pub async fn try_create_tag(&self, name: &str, color: &str) -> Result<Tag> {
        let kind = MutationKind::CreateTag;
        let name = self.tag_guard(kind, normalize_title(name, "Tag name is required"))?;
        let color = self.tag_guard(kind, TagColor::parse(color))?;
        let board_id = self.tag_guard(kind, self.current_board_id())?;
        self.tag_guard(
            kind,
            self.ensure_persisted(board_id.0, "Board is still being saved"),
        )?;

        let temp = Tag {
            id: new_id(),
            board_id,
            name: name.clone(),
            color: color.clone(),
        };
        self.tags.apply(|state| state.tags.push(temp.clone()));
        let ticket = self.ledger.begin(vec![EntityKey::Tag(temp.id)]);
        self.ledger.register_pending(temp.id.0);
        debug!(tag_id = %temp.id, board_id = %board_id, "optimistic tag created");

        let result = self.backend.create_tag(board_id, &name, &color).await;
        self.ledger.resolve_pending(temp.id.0);
        match result {
            Ok(created) => {
                self.tags.apply(|state| {
                    if state.tag(created.id).is_some() {
                        state.tags.retain(|tag| tag.id != temp.id);
                    } else if let Some(slot) = state.tags.iter_mut().find(|tag| tag.id == temp.id) {
                        *slot = created.clone();
                    } else if state.board_id == Some(created.board_id) {
                        state.tags.push(created.clone());
                    }
                });
                self.ledger.finish(&ticket);
                debug!(temp_id = %temp.id, tag_id = %created.id, "tag confirmed");
                Ok(created)
            }
            Err(err) => {
                self.rollback_tags(
                    kind,
                    &ticket,
                    err,
                    |state| state.tags.retain(|tag| tag.id != temp.id),
                    |_| {},
                )
                .await
            }
        }
    }

    pub async fn update_tag(&self, tag_id: TagId, patch: TagPatch) -> Option<Tag> {
        self.try_update_tag(tag_id, patch).await.ok()
    }

    /// Renames or recolors a tag; every task carrying it shows the change too.
    pub async fn try_update_tag(&self, tag_id: TagId, patch: TagPatch) -> Result<Tag> {
        let kind = MutationKind::UpdateTag;
        let patch = self.tag_guard(kind, patch.normalize())?;
        self.tag_guard(
            kind,
            self.ensure_persisted(tag_id.0, "Tag is still being saved"),
        )?;

        let staged = self.tags.try_apply(|state| {
            let index = state.tag_index(tag_id).ok_or_else(|| tag_not_found(tag_id))?;
            let original = state.tags[index].clone();
            patch.apply_to(&mut state.tags[index]);
            Ok((original, state.tags[index].clone()))
        });
        let (original, updated) = self.tag_guard(kind, staged)?;
        self.boards.apply(|state| state.refresh_task_tag(&updated));
        let ticket = self.ledger.begin(vec![EntityKey::Tag(tag_id)]);
        debug!(tag_id = %tag_id, "optimistic tag update");

        match self.backend.update_tag(tag_id, &patch).await {
            Ok(confirmed) => {
                if self.ledger.is_current(&ticket) {
                    self.tags.apply(|state| {
                        if let Some(slot) = state.tags.iter_mut().find(|tag| tag.id == tag_id) {
                            *slot = confirmed.clone();
                        }
                    });
                    self.boards.apply(|state| state.refresh_task_tag(&confirmed));
                }
                self.ledger.finish(&ticket);
                Ok(confirmed)
            }
            Err(err) => {
                let restored = original.clone();
                self.rollback_tags(
                    kind,
                    &ticket,
                    err,
                    |state| {
                        if let Some(slot) = state.tags.iter_mut().find(|tag| tag.id == tag_id) {
                            *slot = restored;
                        }
                    },
                    |state| state.refresh_task_tag(&original),
                )
                .await
            }
        }
    }

    pub async fn delete_tag(&self, tag_id: TagId) -> Option<()> {
        self.try_delete_tag(tag_id).await.ok()
    }

    /// Deletes a tag and strips it from every task; rollback restores both the
    /// tag list slot and each task's tag slot.
    pub async fn try_delete_tag(&self, tag_id: TagId) -> Result<()> {
        let kind = MutationKind::DeleteTag;
        self.tag_guard(
            kind,
            self.ensure_persisted(tag_id.0, "Tag is still being saved"),
        )?;

        let removed = self.tags.try_apply(|state| {
            let index = state.tag_index(tag_id).ok_or_else(|| tag_not_found(tag_id))?;
            Ok((index, state.tags.remove(index)))
        });
        let (index, tag) = self.tag_guard(kind, removed)?;
        let stripped = self
            .boards
            .try_apply(|state| Ok(state.strip_tag(tag_id)))?;
        let ticket = self.ledger.begin(vec![EntityKey::Tag(tag_id)]);
        debug!(tag_id = %tag_id, index, tasks = stripped.len(), "optimistic tag delete");

        match self.backend.delete_tag(tag_id).await {
            Ok(()) => {
                self.ledger.finish(&ticket);
                Ok(())
            }
            Err(err) => {
                self.rollback_tags(
                    kind,
                    &ticket,
                    err,
                    |state| {
                        if state.tag(tag_id).is_none() && state.board_id == Some(tag.board_id) {
                            let index = index.min(state.tags.len());
                            state.tags.insert(index, tag);
                        }
                    },
                    |state| {
                        for (task_id, slot, tag) in stripped {
                            if let Some(task) = state.task_mut(task_id) {
                                if task.tags.iter().any(|carried| carried.id == tag.id) {
                                    continue;
                                }
                                let slot = slot.min(task.tags.len());
                                task.tags.insert(slot, tag);
                            }
                        }
                    },
                )
                .await
            }
        }
    }
}
