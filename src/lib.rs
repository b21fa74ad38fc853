#[cfg(feature = "api")]
pub mod api;
pub mod backend;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod engine;
pub mod error;
pub mod ids;
pub mod intent;
pub mod invariants;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod reconcile;
pub mod reorder;
pub mod store;

pub mod prelude {
    #[cfg(feature = "api")]
    pub use crate::api::{AppError, BoardApp, HasPool};
    pub use crate::backend::{BoardBackend, ChangeFeed, IntentReply, IntentRequest, IntentService};
    pub use crate::config::BoardConfig;
    #[cfg(feature = "sqlx")]
    pub use crate::db::{PgBoardBackend, create_board_tables};
    pub use crate::engine::{BoardEngine, Origin};
    pub use crate::error::{ErrorKind, LibError, Result};
    pub use crate::ids::{BoardId, ColumnId, TagId, TaskId, UserId};
    pub use crate::intent::{BridgeAction, BridgeOutcome, IntentBridge, IntentOperation};
    pub use crate::invariants::{board_invariant_violations, ensure_board_invariants};
    pub use crate::memory::MemoryBackend;
    pub use crate::models::{
        Board, BoardDetail, ChangeEvent, ChangeKind, Column, EntityChange, NewTask, Tag, TagColor,
        TagPatch, Task, TaskMove, TaskPatch,
    };
    pub use crate::reconcile::{ChangeReconciler, ReconcileOutcome};
    pub use crate::store::{BoardState, ChatState, MutationKind, StoreError, TagState};
}
