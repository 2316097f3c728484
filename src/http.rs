//! HTTP surface: request validation, routing and response shaping.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::agent::{Agent, AgentOptions};
use crate::collections::{Collection, CollectionAssembler};
use crate::config::{ConfigStore, ResourceDefinition};
use crate::error::BtcaError;
use crate::provider;
use crate::resources::ResourceStore;
use crate::search::Searcher;
use crate::sse::{CollectionRef, ModelRef, StreamMeta, sse_stream, strip_question_echo};

const MAX_QUESTION_CHARS: usize = 10_000;
const MAX_REQUEST_RESOURCES: usize = 20;
const MAX_RESOURCE_NAME_CHARS: usize = 64;

pub struct App {
    pub config: Arc<ConfigStore>,
    pub resources: Arc<ResourceStore>,
    pub collections: CollectionAssembler,
    pub searcher: Arc<dyn Searcher>,
}

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/config", get(get_config))
        .route("/resources", get(get_resources))
        .route("/question", post(post_question))
        .route("/question/stream", post(post_question_stream))
        .route("/config/model", put(put_model))
        .route(
            "/config/resources",
            post(post_config_resource).delete(delete_config_resource),
        )
        .layer(middleware::from_fn(request_span))
        .with_state(app)
}

/// Wrap every request in a span carrying a generated request id; the id is
/// echoed back as `x-request-id`.
async fn request_span(request: Request, next: Next) -> Response {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let request_id = format!("req-{}", COUNTER.fetch_add(1, Ordering::Relaxed));
    let span = tracing::info_span!(
        "request",
        id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

impl IntoResponse for BtcaError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = serde_json::json!({
            "error": self.user_message(),
            "tag": self.tag(),
        });
        if let Some(hint) = self.hint() {
            body["hint"] = serde_json::json!(hint);
        }
        (status, Json(body)).into_response()
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "service": "btca-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn get_config(State(app): State<Arc<App>>) -> Json<serde_json::Value> {
    let snapshot = app.config.snapshot().await;
    Json(serde_json::json!({
        "provider": snapshot.provider,
        "model": snapshot.model,
        "resourcesDirectory": app.resources.resources_dir().display().to_string(),
        "collectionsDirectory": app.collections.collections_dir().display().to_string(),
        "resourceCount": snapshot.resources.len(),
    }))
}

async fn get_resources(State(app): State<Arc<App>>) -> Json<serde_json::Value> {
    let snapshot = app.config.snapshot().await;
    Json(serde_json::json!({"resources": snapshot.resources}))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct QuestionRequest {
    question: String,
    #[serde(default)]
    resources: Option<Vec<String>>,
    #[serde(default)]
    quiet: Option<bool>,
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, BtcaError> {
    serde_json::from_slice(body).map_err(|e| BtcaError::Request(format!("invalid request body: {e}")))
}

/// Bounds checks from the surface contract, applied before any work.
fn validate_question(req: &QuestionRequest) -> Result<(), BtcaError> {
    if req.question.trim().is_empty() {
        return Err(BtcaError::Request("question must not be empty".to_string()));
    }
    if req.question.chars().count() > MAX_QUESTION_CHARS {
        return Err(BtcaError::Request(format!(
            "question too long (max {MAX_QUESTION_CHARS} characters)"
        )));
    }
    if let Some(ref resources) = req.resources {
        if resources.len() > MAX_REQUEST_RESOURCES {
            return Err(BtcaError::Request(format!(
                "too many resources (max {MAX_REQUEST_RESOURCES})"
            )));
        }
        for name in resources {
            if name.chars().count() > MAX_RESOURCE_NAME_CHARS {
                return Err(BtcaError::Request(format!(
                    "resource name too long: {name:?}"
                )));
            }
        }
    }
    Ok(())
}

struct PreparedQuestion {
    collection: Collection,
    model: Arc<dyn provider::LanguageModel>,
    provider_id: String,
    model_id: String,
    question: String,
}

/// Shared preamble of both question endpoints: validate, pick resources,
/// materialize the collection, resolve the model.
async fn prepare_question(app: &App, body: &Bytes) -> Result<PreparedQuestion, BtcaError> {
    let request: QuestionRequest = parse_body(body)?;
    validate_question(&request)?;

    let snapshot = app.config.snapshot().await;
    let names: Vec<String> = match request.resources {
        Some(names) if !names.is_empty() => names,
        _ => snapshot.resources.iter().map(|r| r.name().to_string()).collect(),
    };
    if names.is_empty() {
        return Err(BtcaError::Collection(
            "no resources configured; add one with POST /config/resources".to_string(),
        ));
    }

    let quiet = request.quiet.unwrap_or(false);
    let collection = app.collections.load(&names, quiet).await?;
    let model = provider::get_model(&snapshot.provider, &snapshot.model)?;

    Ok(PreparedQuestion {
        collection,
        provider_id: snapshot.provider,
        model_id: snapshot.model,
        model,
        question: request.question,
    })
}

async fn post_question(
    State(app): State<Arc<App>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, BtcaError> {
    let prepared = prepare_question(&app, &body).await?;

    let agent = Agent::new(prepared.model, Arc::clone(&app.searcher));
    let run = agent
        .run(AgentOptions::new(
            prepared.collection.path.clone(),
            prepared.collection.agent_instructions.clone(),
            prepared.question.clone(),
        ))
        .await;

    if let Some(message) = run.events.iter().find_map(|event| match event {
        crate::agent::AgentEvent::Error { error } => Some(error.clone()),
        _ => None,
    }) {
        return Err(BtcaError::Agent(message));
    }

    let answer = strip_question_echo(&run.answer, &prepared.question);
    Ok(Json(serde_json::json!({
        "answer": answer,
        "model": {"provider": prepared.provider_id, "model": prepared.model_id},
        "resources": prepared.collection.resources,
        "collection": {
            "key": prepared.collection.key,
            "path": prepared.collection.path.display().to_string(),
        },
    })))
}

async fn post_question_stream(
    State(app): State<Arc<App>>,
    body: Bytes,
) -> Result<impl IntoResponse, BtcaError> {
    let prepared = prepare_question(&app, &body).await?;

    let meta = StreamMeta {
        model: ModelRef {
            provider: prepared.provider_id.clone(),
            model: prepared.model_id.clone(),
        },
        resources: prepared.collection.resources.clone(),
        collection: CollectionRef {
            key: prepared.collection.key.clone(),
            path: prepared.collection.path.display().to_string(),
        },
    };

    let agent = Agent::new(prepared.model, Arc::clone(&app.searcher));
    let events = agent.stream(
        AgentOptions::new(
            prepared.collection.path.clone(),
            prepared.collection.agent_instructions.clone(),
            prepared.question.clone(),
        ),
        CancellationToken::new(),
    );

    let frames = sse_stream(meta, events, prepared.question).map(|frame| {
        Ok::<_, std::convert::Infallible>(
            SseEvent::default().event(frame.event).data(frame.data.to_string()),
        )
    });

    Ok(Sse::new(frames).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelUpdateRequest {
    provider: String,
    model: String,
}

async fn put_model(
    State(app): State<Arc<App>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, BtcaError> {
    let request: ModelUpdateRequest = parse_body(&body)?;
    app.config
        .update_model(&request.provider, &request.model)
        .await?;
    Ok(get_config(State(app)).await)
}

async fn post_config_resource(
    State(app): State<Arc<App>>,
    body: Bytes,
) -> Result<impl IntoResponse, BtcaError> {
    let def: ResourceDefinition = parse_body(&body)?;
    // Field violations are the caller's fault here, not a broken config file.
    def.validate()
        .map_err(|e| BtcaError::Request(e.user_message()))?;
    let created = app.config.add_resource(def).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!(created))))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RemoveResourceRequest {
    name: String,
}

async fn delete_config_resource(
    State(app): State<Arc<App>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, BtcaError> {
    let request: RemoveResourceRequest = parse_body(&body)?;
    app.config.remove_resource(&request.name).await?;
    Ok(Json(serde_json::json!({"success": true, "name": request.name})))
}
