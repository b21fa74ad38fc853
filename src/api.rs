use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::json;

use crate::backend::BoardBackend;
use crate::db::PgBoardBackend;
use crate::error::{ErrorKind, LibError};
use crate::ids::{BoardId, ColumnId, TagId, TaskId, UserId};
use crate::models::{NewTask, TagColor, TagPatch, TaskPatch};

#[derive(Debug)]
pub struct AppError(pub LibError);

impl From<LibError> for AppError {
    fn from(value: LibError) -> Self {
        Self(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Transport => StatusCode::BAD_GATEWAY,
            ErrorKind::Database => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::error!(kind = ?self.0.kind, error = %self.0.source, "board api request failed");
        (
            status,
            Json(json!({
                "error": {
                    "code": self.0.code,
                    "message": self.0.public
                }
            })),
        )
            .into_response()
    }
}

pub trait HasPool {
    fn pool(&self) -> Arc<sqlx::PgPool>;
}

pub trait BoardApp: HasPool {
    fn backend_for(&self, actor: UserId) -> PgBoardBackend {
        PgBoardBackend::new(self.pool().as_ref().clone(), actor)
    }
}

/// Session user placed in the request extensions by the host's auth layer.
#[derive(Debug, Clone, Copy)]
pub struct Actor(pub UserId);

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<UserId>()
            .copied()
            .map(Actor)
            .ok_or_else(|| {
                AppError(LibError::forbidden(
                    "Authentication required",
                    anyhow!("request carried no user id"),
                ))
            })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBoardPayload {
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateColumnPayload {
    pub title: String,
    #[serde(default)]
    pub position: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateColumnPayload {
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderColumnsPayload {
    pub column_ids: Vec<ColumnId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskPayload {
    #[serde(flatten)]
    pub task: NewTask,
    #[serde(default)]
    pub position: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveTaskPayload {
    pub source_column_id: ColumnId,
    pub destination_column_id: ColumnId,
    pub destination_index: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTaskTagsPayload {
    pub tag_ids: Vec<TagId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTagPayload {
    pub name: String,
    pub color: String,
}

async fn list_boards_handler<S>(
    State(app): State<S>,
    Actor(actor): Actor,
) -> Result<impl IntoResponse, AppError>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    let boards = app.backend_for(actor).list_boards().await?;
    Ok(Json(boards))
}

async fn create_board_handler<S>(
    State(app): State<S>,
    Actor(actor): Actor,
    Json(payload): Json<CreateBoardPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    let board = app.backend_for(actor).create_board(&payload.title).await?;
    Ok((StatusCode::CREATED, Json(board)))
}

async fn get_board_handler<S>(
    State(app): State<S>,
    Actor(actor): Actor,
    Path(board_id): Path<BoardId>,
) -> Result<impl IntoResponse, AppError>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    let detail = app.backend_for(actor).get_board(board_id).await?;
    Ok(Json(detail))
}

async fn delete_board_handler<S>(
    State(app): State<S>,
    Actor(actor): Actor,
    Path(board_id): Path<BoardId>,
) -> Result<impl IntoResponse, AppError>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    app.backend_for(actor).delete_board(board_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_column_handler<S>(
    State(app): State<S>,
    Actor(actor): Actor,
    Path(board_id): Path<BoardId>,
    Json(payload): Json<CreateColumnPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    let column = app
        .backend_for(actor)
        .create_column(board_id, &payload.title, payload.position.unwrap_or(i32::MAX))
        .await?;
    Ok((StatusCode::CREATED, Json(column)))
}

async fn reorder_columns_handler<S>(
    State(app): State<S>,
    Actor(actor): Actor,
    Path(board_id): Path<BoardId>,
    Json(payload): Json<ReorderColumnsPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    app.backend_for(actor)
        .reorder_columns(board_id, &payload.column_ids)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_column_handler<S>(
    State(app): State<S>,
    Actor(actor): Actor,
    Path(column_id): Path<ColumnId>,
    Json(payload): Json<UpdateColumnPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    let column = app
        .backend_for(actor)
        .update_column(column_id, &payload.title)
        .await?;
    Ok(Json(column))
}

async fn delete_column_handler<S>(
    State(app): State<S>,
    Actor(actor): Actor,
    Path(column_id): Path<ColumnId>,
) -> Result<impl IntoResponse, AppError>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    app.backend_for(actor).delete_column(column_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_task_handler<S>(
    State(app): State<S>,
    Actor(actor): Actor,
    Path(column_id): Path<ColumnId>,
    Json(payload): Json<CreateTaskPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    let task = app
        .backend_for(actor)
        .create_task(column_id, &payload.task, payload.position.unwrap_or(i32::MAX))
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn update_task_handler<S>(
    State(app): State<S>,
    Actor(actor): Actor,
    Path(task_id): Path<TaskId>,
    Json(payload): Json<TaskPatch>,
) -> Result<impl IntoResponse, AppError>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    let task = app.backend_for(actor).update_task(task_id, &payload).await?;
    Ok(Json(task))
}

async fn delete_task_handler<S>(
    State(app): State<S>,
    Actor(actor): Actor,
    Path(task_id): Path<TaskId>,
) -> Result<impl IntoResponse, AppError>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    app.backend_for(actor).delete_task(task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn move_task_handler<S>(
    State(app): State<S>,
    Actor(actor): Actor,
    Path(task_id): Path<TaskId>,
    Json(payload): Json<MoveTaskPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    app.backend_for(actor)
        .move_task(
            task_id,
            payload.source_column_id,
            payload.destination_column_id,
            payload.destination_index,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_task_tags_handler<S>(
    State(app): State<S>,
    Actor(actor): Actor,
    Path(task_id): Path<TaskId>,
    Json(payload): Json<SetTaskTagsPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    let tags = app
        .backend_for(actor)
        .set_task_tags(task_id, &payload.tag_ids)
        .await?;
    Ok(Json(tags))
}

async fn list_tags_handler<S>(
    State(app): State<S>,
    Actor(actor): Actor,
    Path(board_id): Path<BoardId>,
) -> Result<impl IntoResponse, AppError>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    let tags = app.backend_for(actor).list_tags(board_id).await?;
    Ok(Json(tags))
}

async fn create_tag_handler<S>(
    State(app): State<S>,
    Actor(actor): Actor,
    Path(board_id): Path<BoardId>,
    Json(payload): Json<CreateTagPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    let color = TagColor::parse(&payload.color)?;
    let tag = app
        .backend_for(actor)
        .create_tag(board_id, &payload.name, &color)
        .await?;
    Ok((StatusCode::CREATED, Json(tag)))
}

async fn update_tag_handler<S>(
    State(app): State<S>,
    Actor(actor): Actor,
    Path(tag_id): Path<TagId>,
    Json(payload): Json<TagPatch>,
) -> Result<impl IntoResponse, AppError>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    let tag = app.backend_for(actor).update_tag(tag_id, &payload).await?;
    Ok(Json(tag))
}

async fn delete_tag_handler<S>(
    State(app): State<S>,
    Actor(actor): Actor,
    Path(tag_id): Path<TagId>,
) -> Result<impl IntoResponse, AppError>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    app.backend_for(actor).delete_tag(tag_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn routes<S>() -> Router<S>
where
    S: BoardApp + Clone + Send + Sync + 'static,
{
    tracing::info!("Registering route /board [GET,POST]");
    tracing::info!("Registering route /board/{{board_id}} [GET,DELETE]");
    tracing::info!("Registering route /board/{{board_id}}/column [POST]");
    tracing::info!("Registering route /board/{{board_id}}/column/order [PUT]");
    tracing::info!("Registering route /board/{{board_id}}/tag [GET,POST]");
    tracing::info!("Registering route /column/{{column_id}} [PUT,DELETE]");
    tracing::info!("Registering route /column/{{column_id}}/task [POST]");
    tracing::info!("Registering route /task/{{task_id}} [PUT,DELETE]");
    tracing::info!("Registering route /task/{{task_id}}/move [POST]");
    tracing::info!("Registering route /task/{{task_id}}/tags [PUT]");
    tracing::info!("Registering route /tag/{{tag_id}} [PUT,DELETE]");

    Router::new()
        .route(
            "/board",
            get(list_boards_handler::<S>).post(create_board_handler::<S>),
        )
        .route(
            "/board/{board_id}",
            get(get_board_handler::<S>).delete(delete_board_handler::<S>),
        )
        .route("/board/{board_id}/column", post(create_column_handler::<S>))
        .route(
            "/board/{board_id}/column/order",
            put(reorder_columns_handler::<S>),
        )
        .route(
            "/board/{board_id}/tag",
            get(list_tags_handler::<S>).post(create_tag_handler::<S>),
        )
        .route(
            "/column/{column_id}",
            put(update_column_handler::<S>).delete(delete_column_handler::<S>),
        )
        .route("/column/{column_id}/task", post(create_task_handler::<S>))
        .route(
            "/task/{task_id}",
            put(update_task_handler::<S>).delete(delete_task_handler::<S>),
        )
        .route("/task/{task_id}/move", post(move_task_handler::<S>))
        .route("/task/{task_id}/tags", put(set_task_tags_handler::<S>))
        .route(
            "/tag/{tag_id}",
            put(update_tag_handler::<S>).delete(delete_tag_handler::<S>),
        )
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    #[tokio::test]
    async fn conflicts_map_to_409_with_their_code() {
        let response =
            AppError(LibError::conflict_name(anyhow!("duplicate key"))).into_response();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["error"]["code"], "tag_name_conflict");
    }

    #[test]
    fn create_task_payload_flattens_task_fields() {
        let payload: CreateTaskPayload = serde_json::from_value(json!({
            "title": "Write docs",
            "assignee": "sam",
            "position": 2
        }))
        .expect("payload");

        assert_eq!(payload.task.title, "Write docs");
        assert_eq!(payload.task.assignee.as_deref(), Some("sam"));
        assert_eq!(payload.position, Some(2));
    }

    #[tokio::test]
    async fn missing_actor_is_forbidden() {
        let request = axum::http::Request::builder()
            .uri("/board")
            .body(())
            .expect("request");
        let (mut parts, _) = request.into_parts();

        let rejection = Actor::from_request_parts(&mut parts, &())
            .await
            .expect_err("no user");
        assert_eq!(rejection.0.kind, ErrorKind::Forbidden);
    }
}
