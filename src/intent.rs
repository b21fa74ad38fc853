//! Turns assistant replies into engine calls.
//!
//! The intent service returns a loosely typed operation; it is validated here
//! into [`IntentOperation`] and anything that does not name concrete, known
//! identifiers becomes a clarification turn with no mutation.

use std::sync::Arc;

use anyhow::anyhow;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::backend::{
    BoardBackend, ColumnSummary, IntentReply, IntentRequest, IntentService, TaskSummary,
};
use crate::engine::{BoardEngine, Origin};
use crate::error::{LibError, Result};
use crate::ids::{ColumnId, TaskId};
use crate::models::{NewTask, Task, TaskMove, TaskPatch};
use crate::store::{ChatMessage, ChatRole, ChatStore, MutationKind, StoreError};

/// Operation proposed by the intent service, one variant per kind.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum IntentOperation {
    Create {
        column_id: ColumnId,
        title: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        assignee: Option<String>,
    },
    #[serde(alias = "read")]
    Query { query: String },
    Update { task_id: TaskId, changes: TaskPatch },
    Delete { task_id: TaskId },
    Move {
        task_id: TaskId,
        source_column_id: ColumnId,
        target_column_id: ColumnId,
        /// Absent means "append to the target column".
        #[serde(default)]
        destination_index: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeAction {
    Created(Task),
    Matched(Vec<Task>),
    Updated(Task),
    Deleted(TaskId),
    Moved(TaskMove),
    /// The reply carried an operation that could not be acted on safely.
    NeedsClarification,
    /// The reply carried no operation.
    Answered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOutcome {
    pub action: BridgeAction,
    /// The service's response text, verbatim.
    pub response: String,
    pub suggestions: Vec<String>,
}

pub struct IntentBridge<B, I> {
    engine: BoardEngine<B>,
    intents: Arc<I>,
    chat: ChatStore,
}

impl<B: BoardBackend, I: IntentService> IntentBridge<B, I> {
    pub fn new(engine: BoardEngine<B>, intents: Arc<I>) -> Self {
        Self::with_chat(engine, intents, ChatStore::default())
    }

    pub fn with_chat(engine: BoardEngine<B>, intents: Arc<I>, chat: ChatStore) -> Self {
        Self {
            engine,
            intents,
            chat,
        }
    }

    pub fn chat(&self) -> &ChatStore {
        &self.chat
    }

    pub fn engine(&self) -> &BoardEngine<B> {
        &self.engine
    }

    pub fn clear_chat(&self) {
        self.chat.apply(|state| {
            state.messages.clear();
            state.error = None;
        });
    }

    /// Runs one conversation turn. Failures are recorded in the chat slot (and,
    /// for engine calls, in the board slot) and then returned to the caller.
    pub async fn handle(&self, message: &str) -> Result<BridgeOutcome> {
        let message = message.trim();
        if message.is_empty() {
            return self.fail(LibError::validation(
                "Message is required",
                anyhow!("blank assistant message"),
            ));
        }

        self.chat.apply(|state| {
            state.messages.push(ChatMessage {
                role: ChatRole::User,
                content: message.to_string(),
                suggestions: vec![],
            });
            state.is_processing = true;
        });

        let request = self.build_request(message);
        debug!(
            columns = request.columns.len(),
            tasks = request.tasks.len(),
            "sending message to intent service"
        );
        let reply = match self.intents.interpret(&request).await {
            Ok(reply) => reply,
            Err(err) => return self.fail(err),
        };
        let action = match self.dispatch(&reply).await {
            Ok(action) => action,
            Err(err) => return self.fail(err),
        };

        let IntentReply {
            response,
            suggestions,
            ..
        } = reply;
        self.chat.apply(|state| {
            state.messages.push(ChatMessage {
                role: ChatRole::Assistant,
                content: response.clone(),
                suggestions: suggestions.clone(),
            });
            state.is_processing = false;
        });
        Ok(BridgeOutcome {
            action,
            response,
            suggestions,
        })
    }

    /// Column summaries plus the first `intent_task_limit` tasks in board order.
    pub fn build_request(&self, message: &str) -> IntentRequest {
        let limit = self.engine.config().intent_task_limit;
        self.engine.boards().read(|state| IntentRequest {
            message: message.to_string(),
            columns: state
                .columns
                .iter()
                .map(|column| ColumnSummary {
                    id: column.id,
                    title: column.title.clone(),
                    task_count: column.tasks.len(),
                })
                .collect(),
            tasks: state
                .tasks()
                .take(limit)
                .map(|task| TaskSummary {
                    id: task.id,
                    column_id: task.column_id,
                    title: task.title.clone(),
                    assignee: task.assignee.clone(),
                })
                .collect(),
        })
    }

    async fn dispatch(&self, reply: &IntentReply) -> Result<BridgeAction> {
        let Some(raw) = &reply.operation else {
            return Ok(BridgeAction::Answered);
        };
        let operation = match IntentOperation::deserialize(raw) {
            Ok(operation) => operation,
            Err(err) => {
                debug!(error = %err, "intent operation rejected");
                return Ok(BridgeAction::NeedsClarification);
            }
        };

        let boards = self.engine.boards();
        match operation {
            IntentOperation::Create {
                column_id,
                title,
                description,
                assignee,
            } => {
                let known = boards.read(|state| state.column(column_id).is_some());
                if !known || title.trim().is_empty() {
                    return Ok(BridgeAction::NeedsClarification);
                }
                let task = NewTask {
                    title,
                    description,
                    assignee,
                };
                let created = self.engine.try_create_task(column_id, task).await?;
                Ok(BridgeAction::Created(created))
            }
            IntentOperation::Query { query } => {
                let matches = boards.read(|state| {
                    state
                        .tasks()
                        .filter(|task| task.matches_text(&query))
                        .cloned()
                        .collect()
                });
                Ok(BridgeAction::Matched(matches))
            }
            IntentOperation::Update { task_id, changes } => {
                let known = boards.read(|state| state.task(task_id).is_some());
                if !known || changes.is_empty() {
                    return Ok(BridgeAction::NeedsClarification);
                }
                let updated = self.engine.try_update_task(task_id, changes).await?;
                Ok(BridgeAction::Updated(updated))
            }
            IntentOperation::Delete { task_id } => {
                if boards.read(|state| state.task(task_id).is_none()) {
                    return Ok(BridgeAction::NeedsClarification);
                }
                self.engine.try_delete_task(task_id).await?;
                Ok(BridgeAction::Deleted(task_id))
            }
            IntentOperation::Move {
                task_id,
                source_column_id,
                target_column_id,
                destination_index,
            } => {
                let target_len = boards.read(|state| {
                    let source = state.column(source_column_id)?;
                    source.tasks.iter().find(|task| task.id == task_id)?;
                    state
                        .column(target_column_id)
                        .map(|target| target.tasks.len())
                });
                let Some(target_len) = target_len else {
                    return Ok(BridgeAction::NeedsClarification);
                };
                let append_at = if source_column_id == target_column_id {
                    target_len - 1
                } else {
                    target_len
                };
                let mv = TaskMove {
                    task_id,
                    source_column_id,
                    destination_column_id: target_column_id,
                    destination_index: destination_index.unwrap_or(append_at),
                };
                self.engine.try_move_task(mv, Origin::Assistant).await?;
                Ok(BridgeAction::Moved(mv))
            }
        }
    }

    fn fail<T>(&self, err: LibError) -> Result<T> {
        warn!(error = %err, "assistant request failed");
        let slot = StoreError::from_lib(MutationKind::Assistant, &err);
        self.chat.apply(|state| {
            state.is_processing = false;
            state.error = Some(slot);
        });
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    use super::*;
    use crate::config::BoardConfig;
    use crate::memory::{BackendCall, MemoryBackend};
    use crate::models::BoardDetail;

    #[derive(Default)]
    struct ScriptedIntents {
        replies: Mutex<VecDeque<Result<IntentReply>>>,
        requests: Mutex<Vec<IntentRequest>>,
    }

    impl ScriptedIntents {
        async fn push(&self, reply: Result<IntentReply>) {
            self.replies.lock().await.push_back(reply);
        }
    }

    #[async_trait]
    impl IntentService for ScriptedIntents {
        async fn interpret(&self, request: &IntentRequest) -> Result<IntentReply> {
            self.requests.lock().await.push(request.clone());
            self.replies
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(IntentReply::default()))
        }
    }

    fn reply(operation: serde_json::Value, response: &str) -> Result<IntentReply> {
        Ok(IntentReply {
            operation: Some(operation),
            response: response.to_string(),
            suggestions: vec!["Show my tasks".to_string()],
        })
    }

    async fn bridge(
        columns: &[(&str, &[&str])],
        config: BoardConfig,
    ) -> (
        IntentBridge<MemoryBackend, ScriptedIntents>,
        Arc<ScriptedIntents>,
        BoardDetail,
    ) {
        let backend = Arc::new(MemoryBackend::new());
        let detail = backend.seed_board("Launch", columns).await;
        let engine = BoardEngine::new(Arc::clone(&backend), config);
        engine.load_board(detail.board.id).await.expect("load");
        backend.clear_calls().await;
        let intents = Arc::new(ScriptedIntents::default());
        (IntentBridge::new(engine, Arc::clone(&intents)), intents, detail)
    }

    #[tokio::test]
    async fn create_goes_through_the_engine() {
        let (bridge, intents, detail) =
            bridge(&[("To Do", &["T1"])], BoardConfig::default()).await;
        intents
            .push(reply(
                json!({"type": "create", "columnId": detail.columns[0].id, "title": "Write docs"}),
                "Added \"Write docs\" to To Do.",
            ))
            .await;

        let outcome = bridge.handle("add a task to write docs").await.expect("handled");

        let BridgeAction::Created(task) = &outcome.action else {
            panic!("expected a created task, got {:?}", outcome.action);
        };
        assert_eq!(task.title, "Write docs");
        assert_eq!(outcome.response, "Added \"Write docs\" to To Do.");
        let titles: Vec<String> = bridge
            .engine()
            .boards()
            .read(|state| state.tasks().map(|task| task.title.clone()).collect());
        assert_eq!(titles, ["T1", "Write docs"]);

        let chat = bridge.chat().current();
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[0].role, ChatRole::User);
        assert_eq!(chat.messages[1].suggestions, ["Show my tasks"]);
        assert!(!chat.is_processing);
    }

    #[tokio::test]
    async fn missing_title_asks_for_clarification() {
        let (bridge, intents, detail) = bridge(&[("To Do", &[])], BoardConfig::default()).await;
        intents
            .push(reply(
                json!({"type": "create", "columnId": detail.columns[0].id}),
                "What should the task be called?",
            ))
            .await;

        let outcome = bridge.handle("add a task").await.expect("handled");

        assert_eq!(outcome.action, BridgeAction::NeedsClarification);
        assert_eq!(outcome.response, "What should the task be called?");
        assert!(bridge.engine().backend().calls().await.is_empty());
    }

    #[tokio::test]
    async fn update_without_task_id_is_not_guessed() {
        let (bridge, intents, _) = bridge(&[("To Do", &["Fix login"])], BoardConfig::default()).await;
        intents
            .push(reply(
                json!({"type": "update", "changes": {"title": "Fix signup"}}),
                "Which task do you mean?",
            ))
            .await;

        let outcome = bridge.handle("rename the login one").await.expect("handled");

        assert_eq!(outcome.action, BridgeAction::NeedsClarification);
        assert!(bridge.engine().backend().calls().await.is_empty());
    }

    #[tokio::test]
    async fn query_matches_case_insensitively() {
        let (bridge, intents, _) = bridge(
            &[("To Do", &["Fix LOGIN page", "Write docs"]), ("Done", &["login audit"])],
            BoardConfig::default(),
        )
        .await;
        intents
            .push(reply(json!({"type": "query", "query": "Login"}), "Found 2 tasks."))
            .await;

        let outcome = bridge.handle("what about login?").await.expect("handled");

        let BridgeAction::Matched(tasks) = outcome.action else {
            panic!("expected matches");
        };
        let titles: Vec<&str> = tasks.iter().map(|task| task.title.as_str()).collect();
        assert_eq!(titles, ["Fix LOGIN page", "login audit"]);
        assert!(bridge.engine().backend().calls().await.is_empty());
    }

    #[tokio::test]
    async fn move_without_index_appends() {
        let (bridge, intents, detail) = bridge(
            &[("To Do", &["T1", "T2"]), ("Done", &["T3"])],
            BoardConfig::default(),
        )
        .await;
        intents
            .push(reply(
                json!({
                    "type": "move",
                    "taskId": detail.columns[0].tasks[0].id,
                    "sourceColumnId": detail.columns[0].id,
                    "targetColumnId": detail.columns[1].id,
                }),
                "Moved T1 to Done.",
            ))
            .await;

        let outcome = bridge.handle("T1 is done").await.expect("handled");

        assert!(matches!(outcome.action, BridgeAction::Moved(mv) if mv.destination_index == 1));
        let done: Vec<String> = bridge.engine().boards().read(|state| {
            state.columns[1]
                .tasks
                .iter()
                .map(|task| task.title.clone())
                .collect()
        });
        assert_eq!(done, ["T3", "T1"]);
        assert_eq!(
            bridge.engine().backend().calls().await,
            vec![BackendCall::MoveTask]
        );
    }

    #[tokio::test]
    async fn request_carries_a_bounded_task_prefix() {
        let config = BoardConfig {
            intent_task_limit: 2,
            ..BoardConfig::default()
        };
        let (bridge, intents, _) =
            bridge(&[("To Do", &["T1", "T2"]), ("Done", &["T3"])], config).await;
        intents.push(Ok(IntentReply::default())).await;

        let outcome = bridge.handle("hello").await.expect("handled");

        assert_eq!(outcome.action, BridgeAction::Answered);
        let requests = intents.requests.lock().await;
        let titles: Vec<&str> = requests[0].tasks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, ["T1", "T2"]);
        assert_eq!(requests[0].columns.len(), 2);
        assert_eq!(requests[0].columns[0].task_count, 2);
    }

    #[tokio::test]
    async fn service_failure_is_recorded_and_reraised() {
        let (bridge, intents, _) = bridge(&[("To Do", &[])], BoardConfig::default()).await;
        intents
            .push(Err(LibError::transport(
                "Assistant unavailable",
                anyhow!("503"),
            )))
            .await;

        let err = bridge.handle("hi").await.expect_err("service down");

        assert_eq!(err.public, "Assistant unavailable");
        let chat = bridge.chat().current();
        assert!(!chat.is_processing);
        assert_eq!(
            chat.error.expect("error").message,
            "Failed to process assistant request: Assistant unavailable"
        );
        assert_eq!(chat.messages.len(), 1);
    }

    #[tokio::test]
    async fn engine_failure_rolls_back_and_reraises() {
        let (bridge, intents, detail) =
            bridge(&[("To Do", &["T1", "T2", "T3"])], BoardConfig::default()).await;
        let before = bridge.engine().boards().read(|state| state.columns.clone());
        bridge
            .engine()
            .backend()
            .fail_next(BackendCall::DeleteTask, LibError::message("Backend unavailable"))
            .await;
        intents
            .push(reply(
                json!({"type": "delete", "taskId": detail.columns[0].tasks[1].id}),
                "Deleted T2.",
            ))
            .await;

        assert!(bridge.handle("delete T2").await.is_err());

        let state = bridge.engine().boards().current();
        assert_eq!(state.columns, before);
        assert_eq!(
            state.error.expect("board error").message,
            "Failed to delete task: Backend unavailable"
        );
        assert!(bridge.chat().read(|chat| chat.error.is_some()));
    }
}
