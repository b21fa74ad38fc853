use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::{Next, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use subseq_board::api::{Actor, AppError, BoardApp, HasPool};
use subseq_board::config::env_flag;
use subseq_board::error::LibError;
use subseq_board::ids::UserId;

const DEV_USER_HEADER: &str = "x-dev-user-id";

/// Stand-in for a real auth layer: trusts a header, or falls back to a fixed user.
#[derive(Clone)]
struct DevAuthConfig {
    default_user_id: UserId,
    require_dev_header: bool,
}

impl DevAuthConfig {
    fn from_env() -> anyhow::Result<Self> {
        let raw = env::var("BOARD_EXAMPLE_DEFAULT_USER_ID")
            .unwrap_or_else(|_| "00000000-0000-0000-0000-000000000001".to_string());
        let default_user_id = UserId::from_str(&raw)
            .with_context(|| format!("invalid BOARD_EXAMPLE_DEFAULT_USER_ID '{}'", raw))?;
        Ok(Self {
            default_user_id,
            require_dev_header: env_flag("BOARD_EXAMPLE_REQUIRE_DEV_HEADER"),
        })
    }

    fn resolve(&self, headers: &HeaderMap) -> Result<UserId, LibError> {
        let raw = headers
            .get(DEV_USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        match raw {
            Some(raw) => UserId::from_str(raw).map_err(|err| {
                LibError::validation("x-dev-user-id must be a UUID", anyhow!(err))
            }),
            None if self.require_dev_header => Err(LibError::forbidden(
                "x-dev-user-id header is required",
                anyhow!("missing {} header", DEV_USER_HEADER),
            )),
            None => Ok(self.default_user_id),
        }
    }
}

#[derive(Clone)]
struct ExampleApp {
    pool: Arc<PgPool>,
    auth: DevAuthConfig,
}

impl HasPool for ExampleApp {
    fn pool(&self) -> Arc<PgPool> {
        Arc::clone(&self.pool)
    }
}

impl BoardApp for ExampleApp {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let database_url = env::var("DATABASE_URL")
        .context("DATABASE_URL is required to run demos/board_api_server.rs")?;
    let bind = env::var("BOARD_EXAMPLE_BIND").unwrap_or_else(|_| "127.0.0.1:4020".to_string());
    let bind_addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid BOARD_EXAMPLE_BIND '{}'", bind))?;
    let auth = DevAuthConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to postgres")?;

    subseq_board::db::create_board_tables(&pool)
        .await
        .context("failed to run board migrations")?;

    let app_state = ExampleApp {
        pool: Arc::new(pool),
        auth,
    };

    let api_v1 = Router::new()
        .route("/healthz", get(health_handler))
        .route("/example/whoami", get(whoami_handler))
        .merge(subseq_board::api::routes::<ExampleApp>());

    let app = Router::new()
        .nest("/api/v1", api_v1)
        .layer(from_fn_with_state(
            app_state.clone(),
            dev_identity_middleware,
        ))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", bind_addr))?;

    println!(
        "subseq_board example server listening on http://{}",
        bind_addr
    );
    println!("api base path: /api/v1");
    println!("auth shim header: {}", DEV_USER_HEADER);
    println!("set BOARD_EXAMPLE_REQUIRE_DEV_HEADER=true to require x-dev-user-id");

    axum::serve(listener, app)
        .await
        .context("example server failed")
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true
    }))
}

async fn whoami_handler(Actor(user_id): Actor) -> Json<serde_json::Value> {
    Json(json!({
        "userId": user_id.to_string(),
    }))
}

async fn dev_identity_middleware(
    State(app): State<ExampleApp>,
    mut req: Request,
    next: Next,
) -> Response {
    match app.auth.resolve(req.headers()) {
        Ok(user_id) => {
            req.extensions_mut().insert(user_id);
            next.run(req).await
        }
        Err(err) => AppError(err).into_response(),
    }
}
