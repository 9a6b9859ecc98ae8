//! The HTTP surface of the broker.
//!
//! Routes only validate bodies and translate between JSON and the core; all
//! state lives in the shared [`Router`] and its registry.

mod error;
mod validate;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::registry::{ModelSummary, ProviderSummary, Registration};
use crate::router::{Router, Source};
use error::AppError;

type Shared = State<Arc<Router>>;

#[derive(Debug, Deserialize)]
struct StatsUpdate {
    #[serde(alias = "ollama_base_url")]
    address: String,
    avg_tokens_per_second: f64,
}

#[derive(Debug, Serialize)]
struct CompletionResponse {
    response: String,
    source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<String>,
}

async fn home(State(router): Shared) -> Json<Value> {
    Json(json!({
        "message": "Andy API broker is running.",
        "providers": router.registry().len(),
    }))
}

async fn join_pool(
    State(router): Shared,
    Json(registration): Json<Registration>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    validate::registration(&registration)?;

    let address = registration.address.clone();
    let registered = router.registry().register(registration)?;

    let status = if registered.replaced {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Ok((
        status,
        Json(json!({
            "message": "Successfully joined the compute pool",
            "address": address,
            "max_clients": registered.max_clients,
        })),
    ))
}

async fn update_stats(
    State(router): Shared,
    Json(update): Json<StatsUpdate>,
) -> Result<Json<Value>, AppError> {
    validate::stats(update.avg_tokens_per_second)?;

    router
        .registry()
        .update_stats(&update.address, update.avg_tokens_per_second)?;

    Ok(Json(json!({ "message": "Stats updated" })))
}

async fn completions(
    State(router): Shared,
    Json(body): Json<Map<String, Value>>,
) -> Result<Json<CompletionResponse>, AppError> {
    let (prompt, alias) = validate::completion(&body)?;

    let completion = router.complete(prompt, alias, &body).await;

    Ok(Json(CompletionResponse {
        response: completion.text,
        source: completion.source,
        provider: completion.provider,
    }))
}

async fn models(State(router): Shared) -> Json<Vec<ModelSummary>> {
    Json(router.registry().models())
}

async fn providers(State(router): Shared) -> Json<Vec<ProviderSummary>> {
    Json(router.registry().providers())
}

pub(crate) fn routes(router: Arc<Router>) -> axum::Router {
    axum::Router::new()
        .route("/", get(home))
        .route("/generations/join_pool", post(join_pool))
        .route("/generations/update_stats", post(update_stats))
        .route("/completions", post(completions))
        .route("/api/models", get(models))
        .route("/api/providers", get(providers))
        .with_state(router)
}

pub(crate) async fn serve(listener: TcpListener, router: Arc<Router>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }

    axum::serve(listener, routes(router)).await
}
