use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::ids::{BoardId, ColumnId, TagId, TaskId};

/// Slice of state a mutation writes optimistically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Board(BoardId),
    ColumnOrder(BoardId),
    Column(ColumnId),
    Task(TaskId),
    Tag(TagId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationTicket {
    pub seq: u64,
    pub keys: Vec<EntityKey>,
}

#[derive(Debug, Default)]
struct LedgerState {
    next_seq: u64,
    latest: HashMap<EntityKey, u64>,
    pending: HashSet<Uuid>,
}

/// Per-entity monotonic version tokens plus the set of temporary identifiers
/// still waiting for a server-assigned replacement.
///
/// A completion whose ticket is no longer current must not restore its snapshot:
/// a newer optimistic write already owns at least one of the slices.
#[derive(Debug, Clone, Default)]
pub struct MutationLedger {
    inner: Arc<Mutex<LedgerState>>,
}

impl MutationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn begin(&self, keys: Vec<EntityKey>) -> MutationTicket {
        let mut state = self.state();
        state.next_seq += 1;
        let seq = state.next_seq;
        for key in &keys {
            state.latest.insert(*key, seq);
        }
        MutationTicket { seq, keys }
    }

    pub fn is_current(&self, ticket: &MutationTicket) -> bool {
        let state = self.state();
        ticket
            .keys
            .iter()
            .all(|key| state.latest.get(key).is_none_or(|seq| *seq == ticket.seq))
    }

    /// Drops bookkeeping for keys nobody touched after `ticket`.
    pub fn finish(&self, ticket: &MutationTicket) {
        let mut state = self.state();
        for key in &ticket.keys {
            if state.latest.get(key) == Some(&ticket.seq) {
                state.latest.remove(key);
            }
        }
    }

    pub fn register_pending(&self, id: Uuid) {
        self.state().pending.insert(id);
    }

    pub fn resolve_pending(&self, id: Uuid) {
        self.state().pending.remove(&id);
    }

    pub fn is_pending(&self, id: Uuid) -> bool {
        self.state().pending.contains(&id)
    }

    pub fn in_flight(&self) -> usize {
        self.state().latest.len()
    }
}
