//! Read-only HTTP API over the persisted catalog. Records are re-read from
//! the store per request; the files on disk are the source of truth.

use anyhow::Context;
use atlas_storage::{CatalogStore, StoreError};
use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "atlas-web";

#[derive(Clone)]
pub struct AppState {
    store: CatalogStore,
}

pub fn router(store: CatalogStore) -> Router {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/{name}", get(model_by_name))
        .route("/models/{name}/similar", get(similar_models))
        .with_state(AppState { store })
}

async fn list_models(State(state): State<AppState>) -> Response {
    match state.store.load_all().await {
        Ok(records) => Json(records).into_response(),
        Err(err) => storage_error(err),
    }
}

async fn model_by_name(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match state.store.load(&name).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "model not found").into_response(),
        Err(err) => storage_error(err),
    }
}

async fn similar_models(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match state.store.load(&name).await {
        Ok(Some(record)) => Json(record.similar_models).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "model not found").into_response(),
        Err(err) => storage_error(err),
    }
}

fn storage_error(err: StoreError) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

pub async fn serve(addr: &str, store: CatalogStore) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr, "serving catalog api");
    axum::serve(listener, router(store))
        .await
        .context("serving catalog api")?;
    Ok(())
}
