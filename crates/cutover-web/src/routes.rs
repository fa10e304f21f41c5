//! HTTP routes.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use cutover_engine::{
    MigrationService, MigrationView, NodePhase, StepInfo, TriggerHandler, TriggerRejection,
    TriggerRequest, catalog,
};

use crate::error::WebError;
use crate::sse::migration_events;

/// Shared state for the web server.
pub struct AppState {
    pub handler: TriggerHandler,
}

impl AppState {
    pub fn new(service: Arc<MigrationService>) -> Self {
        Self {
            handler: TriggerHandler::new(service),
        }
    }

    fn service(&self) -> &Arc<MigrationService> {
        self.handler.service()
    }
}

/// Create the web router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/migration", get(list_migrations))
        .route("/migration/steps", get(list_steps))
        .route("/migration/{id}", get(get_migration).post(create_migration))
        .route("/migration/{id}/trigger", post(trigger))
        .route("/migration/{id}/events", get(events))
        .route("/migration/{id}/nodes", get(list_nodes))
        .route("/migration/{id}/nodes/{node}/status", post(node_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve `router` on `port` until `shutdown` resolves.
pub async fn serve(
    router: Router,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), WebError> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("migration server listening on http://0.0.0.0:{}", port);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn list_steps() -> Json<Vec<StepInfo>> {
    Json(catalog())
}

async fn list_migrations(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, WebError> {
    let ids = state
        .service()
        .list()
        .await
        .map_err(TriggerRejection::from)?;
    Ok(Json(json!({ "migrations": ids })))
}

async fn create_migration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MigrationView>, WebError> {
    Ok(Json(state.handler.create(&id).await?))
}

async fn get_migration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MigrationView>, WebError> {
    Ok(Json(state.handler.view(&id).await?))
}

async fn trigger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<MigrationView>, WebError> {
    match state.handler.handle(&id, request).await {
        Ok(view) => Ok(Json(view)),
        Err(rejection) => {
            warn!(migration = %id, code = %rejection.code, "trigger rejected");
            Err(rejection.into())
        }
    }
}

async fn list_nodes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, WebError> {
    state.handler.view(&id).await?;
    let nodes = state.service().node_statuses(&id).await.unwrap_or_default();
    Ok(Json(json!({ "nodes": nodes })))
}

#[derive(Debug, Deserialize)]
struct NodeStatusBody {
    phase: NodePhase,
}

async fn node_status(
    State(state): State<Arc<AppState>>,
    Path((id, node)): Path<(String, String)>,
    Json(body): Json<NodeStatusBody>,
) -> Result<StatusCode, WebError> {
    state
        .service()
        .report_node_status(&id, &node, body.phase)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, WebError> {
    // Subscribe first so no change between the check and the stream is lost.
    let rx = state.service().subscribe();
    state.handler.view(&id).await?;
    Ok(migration_events(rx, id))
}
