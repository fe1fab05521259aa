use anyhow::Context;
use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{Next, from_fn},
    response::Json,
    routing::{get, post},
};
use form_flow::{
    CatalogProvider, Collaborators, DialogEngine, EngineResult, Event, FormError, InMemoryCatalog,
    InMemoryOutbox, InMemoryRecordStore, InMemorySessionStore, LocalFileIntake, OwnerId,
    PostgresRecordStore, PostgresSessionStore, RecordStore, SessionStore, StartMode, forms,
    postgres,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::config::ServiceConfig;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;
type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: &str, details: &str) -> ApiError {
    (
        status,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

#[derive(Clone)]
pub struct AppState {
    pub engine: DialogEngine,
    /// Prompts the engine sent, waiting for the chat transport to pick them up
    pub outbox: InMemoryOutbox,
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub owner_id: OwnerId,
    /// Replace an active form instead of refusing to start
    #[serde(default)]
    pub replace: bool,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub owner_id: OwnerId,
}

pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub records: Arc<dyn RecordStore>,
}

/// PostgreSQL stores when `database_url` is set and reachable, in-memory otherwise
pub async fn create_stores(database_url: Option<&str>) -> Stores {
    let Some(database_url) = database_url else {
        info!("Using in-memory form storage (set DATABASE_URL to use PostgreSQL)");
        return in_memory_stores();
    };

    info!("Using PostgreSQL form storage");
    match postgres::connect(database_url).await {
        Ok(pool) => Stores {
            sessions: Arc::new(PostgresSessionStore::new(pool.clone())),
            records: Arc::new(PostgresRecordStore::new(pool)),
        },
        Err(e) => {
            error!(
                "Failed to connect to PostgreSQL: {}. Falling back to in-memory storage.",
                e
            );
            in_memory_stores()
        }
    }
}

fn in_memory_stores() -> Stores {
    Stores {
        sessions: Arc::new(InMemorySessionStore::new()),
        records: Arc::new(InMemoryRecordStore::new()),
    }
}

/// Reads the YAML catalog seed; a missing file yields an empty catalog
pub async fn load_catalog(path: &FsPath) -> anyhow::Result<InMemoryCatalog> {
    match tokio::fs::read_to_string(path).await {
        Ok(source) => {
            let catalog = InMemoryCatalog::from_yaml(&source)
                .with_context(|| format!("loading catalog {}", path.display()))?;
            info!(path = %path.display(), catalogs = ?catalog.catalog_names(), "Catalog loaded");
            Ok(catalog)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Catalog seed not found, starting with empty catalogs");
            Ok(InMemoryCatalog::new())
        }
    }
}

pub async fn create_app_state(config: &ServiceConfig) -> anyhow::Result<AppState> {
    let stores = create_stores(config.database_url.as_deref()).await;
    let catalog = load_catalog(&config.catalog_path).await?;
    let schemas = forms::registry().context("building form schemas")?;
    Ok(build_state(
        stores,
        Arc::new(catalog),
        LocalFileIntake::new(&config.upload_dir),
        schemas,
        config,
    ))
}

fn build_state(
    stores: Stores,
    catalog: Arc<dyn CatalogProvider>,
    files: LocalFileIntake,
    schemas: form_flow::SchemaRegistry,
    config: &ServiceConfig,
) -> AppState {
    let outbox = InMemoryOutbox::with_capacity(config.outbox_capacity);
    let engine = DialogEngine::new(
        Arc::new(schemas),
        stores.sessions,
        Collaborators {
            catalog,
            files: Arc::new(files),
            records: stores.records,
            sink: Arc::new(outbox.clone()),
        },
        config.engine_config(),
    );
    AppState { engine, outbox }
}

/// Periodically drops sessions idle past the engine's TTL
pub fn spawn_idle_purge(engine: DialogEngine, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(e) = engine.purge_idle().await {
                warn!(error = %e, "Idle session purge failed");
            }
        }
    })
}

/// Middleware to add correlation ID to all requests
async fn correlation_id_middleware(
    mut request: Request<axum::body::Body>,
    next: Next,
) -> axum::response::Response {
    let correlation_id = Uuid::new_v4().to_string();

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        request.headers_mut().insert("x-correlation-id", value);
    }

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    next.run(request).instrument(span).await
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/forms", get(list_forms))
        .route("/forms/{schema_id}/start", post(start_form))
        .route("/events", post(handle_event))
        .route("/cancel", post(cancel_form))
        .route("/outbox/{owner_id}", get(drain_outbox))
        .route("/session/{owner_id}", get(get_session))
        .layer(from_fn(correlation_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn list_forms(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "forms": state.engine.schemas().ids() }))
}

async fn start_form(
    State(state): State<AppState>,
    Path(schema_id): Path<String>,
    Json(request): Json<StartRequest>,
) -> ApiResult<Value> {
    info!(owner_id = %request.owner_id, schema = %schema_id, replace = request.replace, "Start form request");
    let mode = if request.replace {
        StartMode::Replace
    } else {
        StartMode::Reject
    };
    respond(state.engine.start(request.owner_id, &schema_id, mode).await)
}

async fn handle_event(State(state): State<AppState>, Json(event): Json<Event>) -> ApiResult<Value> {
    let owner = event.owner_id;
    let outcome = state.engine.handle_event(event).await;
    if let Err(e) = &outcome {
        info!(owner_id = %owner, error = %e, "Event not applied");
    }
    respond(outcome)
}

async fn cancel_form(
    State(state): State<AppState>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<Value> {
    match state.engine.cancel(request.owner_id).await {
        Ok(cancelled) => Ok(Json(json!({ "cancelled": cancelled }))),
        Err(e) => Err(map_error(e)),
    }
}

async fn drain_outbox(State(state): State<AppState>, Path(owner_id): Path<i64>) -> Json<Value> {
    let prompts = state.outbox.drain(OwnerId(owner_id));
    Json(json!({ "owner_id": owner_id, "prompts": prompts }))
}

async fn get_session(State(state): State<AppState>, Path(owner_id): Path<i64>) -> ApiResult<Value> {
    match state.engine.session(OwnerId(owner_id)).await {
        Ok(Some(session)) => Ok(Json(json!(session))),
        Ok(None) => Err(api_error(
            StatusCode::NOT_FOUND,
            "No active form session",
            &owner_id.to_string(),
        )),
        Err(e) => {
            error!(owner_id, error = %e, "Failed to get session");
            Err(map_error(e))
        }
    }
}

/// Engine outcome as an HTTP response.
///
/// Unrelated chat traffic and rejected answers are normal conversation, not
/// request failures, so both come back as 200.
fn respond(outcome: form_flow::Result<EngineResult>) -> ApiResult<Value> {
    match outcome {
        Ok(result) => Ok(Json(json!(result))),
        Err(FormError::NoActiveSession(_)) => Ok(Json(json!({ "status": "ignored" }))),
        Err(FormError::Validation(reason)) => Ok(Json(json!({
            "status": "rejected",
            "reason": reason
        }))),
        Err(e) => Err(map_error(e)),
    }
}

fn map_error(e: FormError) -> ApiError {
    let status = match &e {
        FormError::Conflict(_) => StatusCode::CONFLICT,
        FormError::UnknownSchema(_) => StatusCode::NOT_FOUND,
        FormError::Validation(_) | FormError::UnsupportedFormat(_) => StatusCode::BAD_REQUEST,
        e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %e, "Form engine failure");
    }
    api_error(status, "Form engine error", &e.to_string())
}
