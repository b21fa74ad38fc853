use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::backend::BoardBackend;
use crate::error::{LibError, Result};
use crate::ids::{BoardId, ColumnId, TagId, TaskId, UserId};
use crate::models::{
    Board, BoardDetail, Column, DEFAULT_COLUMN_TITLES, NewTask, Tag, TagColor, TagPatch, Task,
    TaskPatch, normalize_title,
};
use crate::reorder::{TEMPORARY_POSITION_OFFSET, clamp_insert_index};

pub static MIGRATOR: Lazy<Migrator> = Lazy::new(|| {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
});

pub async fn create_board_tables(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Role recorded for the user who created a board.
pub const BOARD_ROLE_OWNER: &str = "owner";

/// Free slot below the parked range; new rows land here before the final
/// order is written.
const INSERT_POSITION: i32 = TEMPORARY_POSITION_OFFSET - 1;

#[derive(Debug, Clone, FromRow)]
struct BoardRow {
    id: Uuid,
    title: String,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, FromRow)]
struct ColumnRow {
    id: Uuid,
    board_id: Uuid,
    title: String,
    position: i32,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, FromRow)]
struct TaskRow {
    id: Uuid,
    column_id: Uuid,
    title: String,
    description: Option<String>,
    assignee: Option<String>,
    position: i32,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, FromRow)]
struct TagRow {
    id: Uuid,
    board_id: Uuid,
    name: String,
    color: String,
}

#[derive(Debug, Clone, FromRow)]
struct TaskTagRow {
    task_id: Uuid,
    id: Uuid,
    board_id: Uuid,
    name: String,
    color: String,
}

impl From<BoardRow> for Board {
    fn from(value: BoardRow) -> Self {
        Self {
            id: BoardId(value.id),
            title: value.title,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

impl ColumnRow {
    fn into_column(self, tasks: Vec<Task>) -> Column {
        Column {
            id: ColumnId(self.id),
            board_id: BoardId(self.board_id),
            title: self.title,
            position: self.position,
            tasks,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl TaskRow {
    fn into_task(self, tags: Vec<Tag>) -> Task {
        Task {
            id: TaskId(self.id),
            column_id: ColumnId(self.column_id),
            title: self.title,
            description: self.description,
            assignee: self.assignee,
            position: self.position,
            tags,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl TryFrom<TagRow> for Tag {
    type Error = LibError;

    fn try_from(value: TagRow) -> Result<Self> {
        let color = TagColor::parse(&value.color).map_err(|err| {
            LibError::database(
                "Stored tag color is invalid",
                anyhow!("tag {}: {}", value.id, err),
            )
        })?;
        Ok(Self {
            id: TagId(value.id),
            board_id: BoardId(value.board_id),
            name: value.name,
            color,
        })
    }
}

fn db_err(public: &'static str, err: sqlx::Error) -> LibError {
    LibError::database(public, anyhow!(err))
}

/// Keeps the first occurrence of every id.
fn dedupe_ids(ids: &[TagId]) -> Vec<Uuid> {
    let mut unique: Vec<Uuid> = Vec::with_capacity(ids.len());
    for id in ids {
        if !unique.contains(&id.0) {
            unique.push(id.0);
        }
    }
    unique
}

/// `BoardBackend` over Postgres, acting on behalf of one user. Every call
/// checks that the user is a member of the board it touches.
#[derive(Debug, Clone)]
pub struct PgBoardBackend {
    pool: PgPool,
    actor: UserId,
}

impl PgBoardBackend {
    pub fn new(pool: PgPool, actor: UserId) -> Self {
        Self { pool, actor }
    }

    pub fn actor(&self) -> UserId {
        self.actor
    }

    pub fn for_actor(&self, actor: UserId) -> Self {
        Self {
            pool: self.pool.clone(),
            actor,
        }
    }

    async fn board_exists(&self, board_id: BoardId) -> Result<bool> {
        let exists: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1
                FROM board.boards
                WHERE id = $1
            )
            "#,
        )
        .bind(board_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query board", err))?;

        Ok(exists.0)
    }

    async fn load_accessible_board(&self, board_id: BoardId) -> Result<BoardRow> {
        let row = sqlx::query_as::<_, BoardRow>(
            r#"
            SELECT b.id, b.title, b.created_at, b.updated_at
            FROM board.boards b
            WHERE b.id = $1
              AND EXISTS (
                  SELECT 1
                  FROM board.board_members m
                  WHERE m.board_id = b.id
                    AND m.user_id = $2
              )
            LIMIT 1
            "#,
        )
        .bind(board_id.0)
        .bind(self.actor.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query board", err))?;

        if let Some(row) = row {
            Ok(row)
        } else if self.board_exists(board_id).await? {
            Err(LibError::forbidden(
                "You do not have access to this board",
                anyhow!("board {} access denied for user {}", board_id, self.actor),
            ))
        } else {
            Err(LibError::not_found(
                "Board not found",
                anyhow!("board {} not found", board_id),
            ))
        }
    }

    async fn board_of_column(&self, column_id: ColumnId) -> Result<BoardId> {
        let board_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT board_id
            FROM board.columns
            WHERE id = $1
            "#,
        )
        .bind(column_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query column", err))?;

        let board_id = board_id.map(BoardId).ok_or_else(|| {
            LibError::not_found("Column not found", anyhow!("column {} not found", column_id))
        })?;
        self.load_accessible_board(board_id).await?;
        Ok(board_id)
    }

    /// Board and column currently holding the task.
    async fn board_of_task(&self, task_id: TaskId) -> Result<(BoardId, ColumnId)> {
        let row: Option<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            SELECT c.board_id, t.column_id
            FROM board.tasks t
            JOIN board.columns c ON c.id = t.column_id
            WHERE t.id = $1
            "#,
        )
        .bind(task_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query task", err))?;

        let (board_id, column_id) = row.ok_or_else(|| {
            LibError::not_found("Task not found", anyhow!("task {} not found", task_id))
        })?;
        let board_id = BoardId(board_id);
        self.load_accessible_board(board_id).await?;
        Ok((board_id, ColumnId(column_id)))
    }

    async fn board_of_tag(&self, tag_id: TagId) -> Result<BoardId> {
        let board_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT board_id
            FROM board.tags
            WHERE id = $1
            "#,
        )
        .bind(tag_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query tag", err))?;

        let board_id = board_id.map(BoardId).ok_or_else(|| {
            LibError::not_found("Tag not found", anyhow!("tag {} not found", tag_id))
        })?;
        self.load_accessible_board(board_id).await?;
        Ok(board_id)
    }

    async fn tags_for_tasks(&self, task_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<Tag>>> {
        let rows = sqlx::query_as::<_, TaskTagRow>(
            r#"
            SELECT tt.task_id, t.id, t.board_id, t.name, t.color
            FROM board.task_tags tt
            JOIN board.tags t ON t.id = tt.tag_id
            WHERE tt.task_id = ANY($1)
            ORDER BY tt.task_id ASC, tt.position ASC, t.name ASC
            "#,
        )
        .bind(task_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query task tags", err))?;

        let mut tags: HashMap<Uuid, Vec<Tag>> = HashMap::new();
        for row in rows {
            let tag = Tag::try_from(TagRow {
                id: row.id,
                board_id: row.board_id,
                name: row.name,
                color: row.color,
            })?;
            tags.entry(row.task_id).or_default().push(tag);
        }
        Ok(tags)
    }

    async fn load_task(&self, task_id: TaskId) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, column_id, title, description, assignee, position, created_at, updated_at
            FROM board.tasks
            WHERE id = $1
            "#,
        )
        .bind(task_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query task", err))?
        .ok_or_else(|| LibError::not_found("Task not found", anyhow!("task {}", task_id)))?;

        let mut tags = self.tags_for_tasks(&[row.id]).await?;
        let task_tags = tags.remove(&row.id).unwrap_or_default();
        Ok(row.into_task(task_tags))
    }

    async fn load_column_tasks(&self, column_ids: &[Uuid]) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, column_id, title, description, assignee, position, created_at, updated_at
            FROM board.tasks
            WHERE column_id = ANY($1)
            ORDER BY position ASC, id ASC
            "#,
        )
        .bind(column_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query tasks", err))?;

        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let mut tags = self.tags_for_tasks(&ids).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let task_tags = tags.remove(&row.id).unwrap_or_default();
                row.into_task(task_tags)
            })
            .collect())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to start transaction", err))
    }
}

async fn commit(tx: Transaction<'_, Postgres>) -> Result<()> {
    tx.commit()
        .await
        .map_err(|err| db_err("Failed to commit transaction", err))
}

async fn touch_board(tx: &mut Transaction<'_, Postgres>, board_id: BoardId) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE board.boards
        SET updated_at = CURRENT_TIMESTAMP
        WHERE id = $1
        "#,
    )
    .bind(board_id.0)
    .execute(&mut **tx)
    .await
    .map_err(|err| db_err("Failed to update board", err))?;
    Ok(())
}

// Positions are unique per parent. Rows are first parked above
// TEMPORARY_POSITION_OFFSET so the final dense order can be written row by
// row without colliding with a sibling that has not been rewritten yet.

async fn task_order(
    tx: &mut Transaction<'_, Postgres>,
    column_id: ColumnId,
    except: Option<TaskId>,
) -> Result<Vec<Uuid>> {
    sqlx::query_scalar(
        r#"
        SELECT id
        FROM board.tasks
        WHERE column_id = $1
          AND ($2::uuid IS NULL OR id <> $2)
        ORDER BY position ASC, id ASC
        "#,
    )
    .bind(column_id.0)
    .bind(except.map(|id| id.0))
    .fetch_all(&mut **tx)
    .await
    .map_err(|err| db_err("Failed to query task order", err))
}

async fn park_tasks(tx: &mut Transaction<'_, Postgres>, column_id: ColumnId) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE board.tasks
        SET position = position + $2
        WHERE column_id = $1
          AND position < $2
        "#,
    )
    .bind(column_id.0)
    .bind(TEMPORARY_POSITION_OFFSET)
    .execute(&mut **tx)
    .await
    .map_err(|err| db_err("Failed to reorder tasks", err))?;
    Ok(())
}

/// Writes `ordered` as the column's dense order; rows coming from another
/// column are re-parented.
async fn write_task_order(
    tx: &mut Transaction<'_, Postgres>,
    column_id: ColumnId,
    ordered: &[Uuid],
) -> Result<()> {
    park_tasks(tx, column_id).await?;
    for (position, task_id) in ordered.iter().enumerate() {
        sqlx::query(
            r#"
            UPDATE board.tasks
            SET column_id = $2,
                position = $3
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(column_id.0)
        .bind(position as i32)
        .execute(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to reorder tasks", err))?;
    }
    Ok(())
}

async fn renumber_tasks(tx: &mut Transaction<'_, Postgres>, column_id: ColumnId) -> Result<()> {
    park_tasks(tx, column_id).await?;
    sqlx::query(
        r#"
        UPDATE board.tasks t
        SET position = ranked.rank - 1
        FROM (
            SELECT id, (ROW_NUMBER() OVER (ORDER BY position ASC, id ASC))::int AS rank
            FROM board.tasks
            WHERE column_id = $1
        ) ranked
        WHERE t.id = ranked.id
        "#,
    )
    .bind(column_id.0)
    .execute(&mut **tx)
    .await
    .map_err(|err| db_err("Failed to reorder tasks", err))?;
    Ok(())
}

async fn column_order(tx: &mut Transaction<'_, Postgres>, board_id: BoardId) -> Result<Vec<Uuid>> {
    sqlx::query_scalar(
        r#"
        SELECT id
        FROM board.columns
        WHERE board_id = $1
        ORDER BY position ASC, id ASC
        "#,
    )
    .bind(board_id.0)
    .fetch_all(&mut **tx)
    .await
    .map_err(|err| db_err("Failed to query column order", err))
}

async fn park_columns(tx: &mut Transaction<'_, Postgres>, board_id: BoardId) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE board.columns
        SET position = position + $2
        WHERE board_id = $1
          AND position < $2
        "#,
    )
    .bind(board_id.0)
    .bind(TEMPORARY_POSITION_OFFSET)
    .execute(&mut **tx)
    .await
    .map_err(|err| db_err("Failed to reorder columns", err))?;
    Ok(())
}

async fn write_column_order(
    tx: &mut Transaction<'_, Postgres>,
    board_id: BoardId,
    ordered: &[Uuid],
) -> Result<()> {
    park_columns(tx, board_id).await?;
    for (position, column_id) in ordered.iter().enumerate() {
        sqlx::query(
            r#"
            UPDATE board.columns
            SET position = $2
            WHERE id = $1
              AND board_id = $3
            "#,
        )
        .bind(column_id)
        .bind(position as i32)
        .bind(board_id.0)
        .execute(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to reorder columns", err))?;
    }
    Ok(())
}

async fn renumber_columns(tx: &mut Transaction<'_, Postgres>, board_id: BoardId) -> Result<()> {
    park_columns(tx, board_id).await?;
    sqlx::query(
        r#"
        UPDATE board.columns c
        SET position = ranked.rank - 1
        FROM (
            SELECT id, (ROW_NUMBER() OVER (ORDER BY position ASC, id ASC))::int AS rank
            FROM board.columns
            WHERE board_id = $1
        ) ranked
        WHERE c.id = ranked.id
        "#,
    )
    .bind(board_id.0)
    .execute(&mut **tx)
    .await
    .map_err(|err| db_err("Failed to reorder columns", err))?;
    Ok(())
}

#[async_trait]
impl BoardBackend for PgBoardBackend {
    async fn create_board(&self, title: &str) -> Result<Board> {
        let title = normalize_title(title, "Board title is required")?;
        let board_id = BoardId(Uuid::new_v4());
        let mut tx = self.begin().await?;

        let row = sqlx::query_as::<_, BoardRow>(
            r#"
            INSERT INTO board.boards (id, owner_user_id, title)
            VALUES ($1, $2, $3)
            RETURNING id, title, created_at, updated_at
            "#,
        )
        .bind(board_id.0)
        .bind(self.actor.0)
        .bind(&title)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to create board", err))?;

        sqlx::query(
            r#"
            INSERT INTO board.board_members (board_id, user_id, role)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(board_id.0)
        .bind(self.actor.0)
        .bind(BOARD_ROLE_OWNER)
        .execute(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to create board", err))?;

        for (position, column_title) in DEFAULT_COLUMN_TITLES.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO board.columns (id, board_id, title, position)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(board_id.0)
            .bind(*column_title)
            .bind(position as i32)
            .execute(&mut *tx)
            .await
            .map_err(|err| db_err("Failed to create default columns", err))?;
        }

        commit(tx).await?;
        Ok(Board::from(row))
    }

    async fn get_board(&self, board_id: BoardId) -> Result<BoardDetail> {
        let board = self.load_accessible_board(board_id).await?;
        let columns = sqlx::query_as::<_, ColumnRow>(
            r#"
            SELECT id, board_id, title, position, created_at, updated_at
            FROM board.columns
            WHERE board_id = $1
            ORDER BY position ASC, id ASC
            "#,
        )
        .bind(board_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query columns", err))?;

        let column_ids: Vec<Uuid> = columns.iter().map(|column| column.id).collect();
        let mut tasks_by_column: HashMap<ColumnId, Vec<Task>> = HashMap::new();
        for task in self.load_column_tasks(&column_ids).await? {
            tasks_by_column.entry(task.column_id).or_default().push(task);
        }

        Ok(BoardDetail {
            board: Board::from(board),
            columns: columns
                .into_iter()
                .map(|column| {
                    let tasks = tasks_by_column
                        .remove(&ColumnId(column.id))
                        .unwrap_or_default();
                    column.into_column(tasks)
                })
                .collect(),
        })
    }

    async fn list_boards(&self) -> Result<Vec<Board>> {
        let rows = sqlx::query_as::<_, BoardRow>(
            r#"
            SELECT b.id, b.title, b.created_at, b.updated_at
            FROM board.boards b
            JOIN board.board_members m ON m.board_id = b.id
            WHERE m.user_id = $1
            ORDER BY b.updated_at DESC, b.id DESC
            "#,
        )
        .bind(self.actor.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_err("Failed to list boards", err))?;

        Ok(rows.into_iter().map(Board::from).collect())
    }

    async fn delete_board(&self, board_id: BoardId) -> Result<()> {
        let _board = self.load_accessible_board(board_id).await?;

        sqlx::query(
            r#"
            DELETE FROM board.boards
            WHERE id = $1
            "#,
        )
        .bind(board_id.0)
        .execute(&self.pool)
        .await
        .map_err(|err| db_err("Failed to delete board", err))?;

        Ok(())
    }

    async fn create_column(&self, board_id: BoardId, title: &str, position: i32) -> Result<Column> {
        let title = normalize_title(title, "Column title is required")?;
        let _board = self.load_accessible_board(board_id).await?;
        let column_id = Uuid::new_v4();
        let mut tx = self.begin().await?;

        let mut order = column_order(&mut tx, board_id).await?;
        let index = clamp_insert_index(position.max(0) as usize, order.len());
        park_columns(&mut tx, board_id).await?;
        let row = sqlx::query_as::<_, ColumnRow>(
            r#"
            INSERT INTO board.columns (id, board_id, title, position)
            VALUES ($1, $2, $3, $4)
            RETURNING id, board_id, title, position, created_at, updated_at
            "#,
        )
        .bind(column_id)
        .bind(board_id.0)
        .bind(&title)
        .bind(INSERT_POSITION)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to create column", err))?;
        order.insert(index, column_id);
        write_column_order(&mut tx, board_id, &order).await?;
        touch_board(&mut tx, board_id).await?;
        commit(tx).await?;

        Ok(ColumnRow {
            position: index as i32,
            ..row
        }
        .into_column(vec![]))
    }

    async fn update_column(&self, column_id: ColumnId, title: &str) -> Result<Column> {
        let title = normalize_title(title, "Column title is required")?;
        let _board_id = self.board_of_column(column_id).await?;

        let row = sqlx::query_as::<_, ColumnRow>(
            r#"
            UPDATE board.columns
            SET title = $2,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $1
            RETURNING id, board_id, title, position, created_at, updated_at
            "#,
        )
        .bind(column_id.0)
        .bind(&title)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| db_err("Failed to update column", err))?;

        let tasks = self.load_column_tasks(&[column_id.0]).await?;
        Ok(row.into_column(tasks))
    }

    async fn delete_column(&self, column_id: ColumnId) -> Result<()> {
        let board_id = self.board_of_column(column_id).await?;
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM board.columns
            WHERE id = $1
            "#,
        )
        .bind(column_id.0)
        .execute(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to delete column", err))?;
        renumber_columns(&mut tx, board_id).await?;
        touch_board(&mut tx, board_id).await?;

        commit(tx).await
    }

    async fn reorder_columns(&self, board_id: BoardId, column_ids: &[ColumnId]) -> Result<()> {
        let _board = self.load_accessible_board(board_id).await?;
        let mut tx = self.begin().await?;

        let current = column_order(&mut tx, board_id).await?;
        let requested: Vec<Uuid> = column_ids.iter().map(|id| id.0).collect();
        let mut sorted_current = current.clone();
        let mut sorted_requested = requested.clone();
        sorted_current.sort();
        sorted_requested.sort();
        if sorted_current != sorted_requested {
            return Err(LibError::validation(
                "Column order must list every column once",
                anyhow!(
                    "{} ids for {} columns on board {}",
                    requested.len(),
                    current.len(),
                    board_id
                ),
            ));
        }
        write_column_order(&mut tx, board_id, &requested).await?;
        touch_board(&mut tx, board_id).await?;

        commit(tx).await
    }

    async fn create_task(
        &self,
        column_id: ColumnId,
        task: &NewTask,
        position: i32,
    ) -> Result<Task> {
        let task = task.clone().normalize()?;
        let board_id = self.board_of_column(column_id).await?;
        let task_id = Uuid::new_v4();
        let mut tx = self.begin().await?;

        let mut order = task_order(&mut tx, column_id, None).await?;
        let index = clamp_insert_index(position.max(0) as usize, order.len());
        park_tasks(&mut tx, column_id).await?;
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            INSERT INTO board.tasks (id, column_id, title, description, assignee, position)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, column_id, title, description, assignee, position, created_at, updated_at
            "#,
        )
        .bind(task_id)
        .bind(column_id.0)
        .bind(&task.title)
        .bind(&task.description)
        .bind(&task.assignee)
        .bind(INSERT_POSITION)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to create task", err))?;
        order.insert(index, task_id);
        write_task_order(&mut tx, column_id, &order).await?;
        touch_board(&mut tx, board_id).await?;
        commit(tx).await?;

        Ok(TaskRow {
            position: index as i32,
            ..row
        }
        .into_task(vec![]))
    }

    async fn update_task(&self, task_id: TaskId, patch: &TaskPatch) -> Result<Task> {
        let patch = patch.clone().normalize()?;
        let (board_id, _) = self.board_of_task(task_id).await?;
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            UPDATE board.tasks
            SET title = COALESCE($2, title),
                description = CASE WHEN $3 THEN $4 ELSE description END,
                assignee = CASE WHEN $5 THEN $6 ELSE assignee END,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $1
            "#,
        )
        .bind(task_id.0)
        .bind(&patch.title)
        .bind(patch.description.is_some())
        .bind(patch.description.clone().flatten())
        .bind(patch.assignee.is_some())
        .bind(patch.assignee.clone().flatten())
        .execute(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to update task", err))?;
        touch_board(&mut tx, board_id).await?;
        commit(tx).await?;

        self.load_task(task_id).await
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<()> {
        let (board_id, column_id) = self.board_of_task(task_id).await?;
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM board.tasks
            WHERE id = $1
            "#,
        )
        .bind(task_id.0)
        .execute(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to delete task", err))?;
        renumber_tasks(&mut tx, column_id).await?;
        touch_board(&mut tx, board_id).await?;

        commit(tx).await
    }

    async fn move_task(
        &self,
        task_id: TaskId,
        source_column_id: ColumnId,
        destination_column_id: ColumnId,
        destination_index: usize,
    ) -> Result<()> {
        let (board_id, current_column_id) = self.board_of_task(task_id).await?;
        if current_column_id != source_column_id {
            return Err(LibError::validation(
                "Task is not in the source column",
                anyhow!("task {} lives in {}", task_id, current_column_id),
            ));
        }
        if self.board_of_column(destination_column_id).await? != board_id {
            return Err(LibError::not_found(
                "Destination column not found",
                anyhow!("column {} is not on board {}", destination_column_id, board_id),
            ));
        }

        let mut tx = self.begin().await?;
        let mut order = task_order(&mut tx, destination_column_id, Some(task_id)).await?;
        let index = clamp_insert_index(destination_index, order.len());
        order.insert(index, task_id.0);
        write_task_order(&mut tx, destination_column_id, &order).await?;
        if source_column_id != destination_column_id {
            renumber_tasks(&mut tx, source_column_id).await?;
        }

        sqlx::query(
            r#"
            UPDATE board.tasks
            SET updated_at = CURRENT_TIMESTAMP
            WHERE id = $1
            "#,
        )
        .bind(task_id.0)
        .execute(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to move task", err))?;
        touch_board(&mut tx, board_id).await?;

        commit(tx).await
    }

    async fn list_tags(&self, board_id: BoardId) -> Result<Vec<Tag>> {
        let _board = self.load_accessible_board(board_id).await?;
        let rows = sqlx::query_as::<_, TagRow>(
            r#"
            SELECT id, board_id, name, color
            FROM board.tags
            WHERE board_id = $1
            ORDER BY name ASC, id ASC
            "#,
        )
        .bind(board_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_err("Failed to list tags", err))?;

        rows.into_iter().map(Tag::try_from).collect()
    }

    async fn create_tag(&self, board_id: BoardId, name: &str, color: &TagColor) -> Result<Tag> {
        let name = normalize_title(name, "Tag name is required")?;
        let _board = self.load_accessible_board(board_id).await?;

        let row = sqlx::query_as::<_, TagRow>(
            r#"
            INSERT INTO board.tags (id, board_id, name, color)
            VALUES ($1, $2, $3, $4)
            RETURNING id, board_id, name, color
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(board_id.0)
        .bind(&name)
        .bind(color.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(LibError::from)?;

        Tag::try_from(row)
    }

    async fn update_tag(&self, tag_id: TagId, patch: &TagPatch) -> Result<Tag> {
        let patch = patch.clone().normalize()?;
        let _board_id = self.board_of_tag(tag_id).await?;

        let row = sqlx::query_as::<_, TagRow>(
            r#"
            UPDATE board.tags
            SET name = COALESCE($2, name),
                color = COALESCE($3, color)
            WHERE id = $1
            RETURNING id, board_id, name, color
            "#,
        )
        .bind(tag_id.0)
        .bind(&patch.name)
        .bind(patch.color.as_ref().map(TagColor::as_str))
        .fetch_one(&self.pool)
        .await
        .map_err(LibError::from)?;

        Tag::try_from(row)
    }

    async fn delete_tag(&self, tag_id: TagId) -> Result<()> {
        let _board_id = self.board_of_tag(tag_id).await?;

        sqlx::query(
            r#"
            DELETE FROM board.tags
            WHERE id = $1
            "#,
        )
        .bind(tag_id.0)
        .execute(&self.pool)
        .await
        .map_err(|err| db_err("Failed to delete tag", err))?;

        Ok(())
    }

    async fn set_task_tags(&self, task_id: TaskId, tag_ids: &[TagId]) -> Result<Vec<Tag>> {
        let (board_id, _) = self.board_of_task(task_id).await?;
        let requested = dedupe_ids(tag_ids);

        let rows = sqlx::query_as::<_, TagRow>(
            r#"
            SELECT id, board_id, name, color
            FROM board.tags
            WHERE id = ANY($1)
              AND board_id = $2
            "#,
        )
        .bind(&requested)
        .bind(board_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_err("Failed to query tags", err))?;
        if rows.len() != requested.len() {
            return Err(LibError::validation(
                "Tag does not belong to this board",
                anyhow!(
                    "{} of {} tags found on board {}",
                    rows.len(),
                    requested.len(),
                    board_id
                ),
            ));
        }
        let mut by_id: HashMap<Uuid, TagRow> = rows.into_iter().map(|row| (row.id, row)).collect();

        let mut tx = self.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM board.task_tags
            WHERE task_id = $1
            "#,
        )
        .bind(task_id.0)
        .execute(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to replace task tags", err))?;

        for (position, tag_id) in requested.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO board.task_tags (task_id, tag_id, position)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(task_id.0)
            .bind(tag_id)
            .bind(position as i32)
            .execute(&mut *tx)
            .await
            .map_err(|err| db_err("Failed to replace task tags", err))?;
        }

        sqlx::query(
            r#"
            UPDATE board.tasks
            SET updated_at = CURRENT_TIMESTAMP
            WHERE id = $1
            "#,
        )
        .bind(task_id.0)
        .execute(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to replace task tags", err))?;
        touch_board(&mut tx, board_id).await?;
        commit(tx).await?;

        requested
            .iter()
            .filter_map(|tag_id| by_id.remove(tag_id))
            .map(Tag::try_from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_keeps_first_occurrence_order() {
        let a = TagId(Uuid::new_v4());
        let b = TagId(Uuid::new_v4());

        assert_eq!(dedupe_ids(&[b, a, b, a]), vec![b.0, a.0]);
    }

    #[test]
    fn stored_tag_colors_are_validated() {
        let row = TagRow {
            id: Uuid::new_v4(),
            board_id: Uuid::new_v4(),
            name: "Bug".to_string(),
            color: "not-a-color".to_string(),
        };

        let err = Tag::try_from(row).expect_err("invalid color");
        assert_eq!(err.kind, crate::error::ErrorKind::Database);
    }

    #[test]
    fn parked_rows_never_reach_the_insert_slot() {
        assert!(INSERT_POSITION < TEMPORARY_POSITION_OFFSET);
        assert!(INSERT_POSITION > 0);
    }
}
