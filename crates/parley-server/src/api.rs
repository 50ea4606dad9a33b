use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{future, stream, Stream, StreamExt};
use parley_shared::constants::{ACCOUNT_HEADER, ARCHIVE_CONTENT_TYPE, SESSION_HEADER};
use parley_shared::event::{EventResult, TxEnvelope};
use parley_shared::query::Operation;
use parley_shared::types::{AccountId, BlobId, CardId, SessionId};
use parley_shared::CommunicationError;
use parley_store::{BlobStorage, Session, SessionRegistry};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::workspaces::Workspaces;

/// Shared application state for all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub workspaces: Arc<Workspaces>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            workspaces: Arc::new(Workspaces::new(config.clone())),
            config,
        }
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/tx/:workspace", post(post_event))
        .route(
            "/api/v1/request/communication/:operation/:workspace",
            get(find),
        )
        .route("/api/v1/events/:workspace", get(events))
        .route(
            "/blob/:workspace/:blob_id",
            get(get_blob).put(put_blob).delete(delete_blob),
        )
        .layer(DefaultBodyLimit::max(state.config.max_blob_size))
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server on the given address.
pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Caller identity
// ---------------------------------------------------------------------------

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, ServerError> {
    headers
        .get(name)
        .map(|v| {
            v.to_str()
                .map_err(|_| ServerError::BadRequest(format!("{name} header is not valid text")))
        })
        .transpose()
}

fn account(headers: &HeaderMap) -> Result<AccountId, ServerError> {
    match header_value(headers, ACCOUNT_HEADER)? {
        Some(account) if !account.trim().is_empty() => Ok(AccountId::new(account.trim())),
        _ => Err(ServerError::BadRequest(format!(
            "missing {ACCOUNT_HEADER} header"
        ))),
    }
}

/// The session an event is applied for. Callers holding a broadcast
/// stream send its id so their own events come back on it.
fn caller(headers: &HeaderMap) -> Result<Session, ServerError> {
    let account = account(headers)?;
    let id = header_value(headers, SESSION_HEADER)?
        .filter(|id| !id.is_empty())
        .map(SessionId::new)
        .unwrap_or_else(SessionId::generate);
    Ok(Session { id, account })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn post_event(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<EventResult>, ServerError> {
    let session = caller(&headers)?;
    let envelope: TxEnvelope =
        serde_json::from_slice(&body).map_err(CommunicationError::from)?;
    let ws = state.workspaces.get(&workspace).await?;

    debug!(
        workspace = %ws.name,
        kind = envelope.event.kind(),
        modified_by = %envelope.modified_by,
        session = %session.id,
        "Applying event"
    );
    let result = ws.router.event(&session, envelope.event).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct FindQuery {
    params: Option<String>,
}

fn parse_params<T: DeserializeOwned + Default>(raw: Option<&str>) -> Result<T, ServerError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(T::default()),
        Some(json) => Ok(serde_json::from_str(json).map_err(CommunicationError::from)?),
    }
}

async fn find(
    State(state): State<AppState>,
    Path((operation, workspace)): Path<(String, String)>,
    Query(query): Query<FindQuery>,
) -> Result<Response, ServerError> {
    let op = Operation::parse(&operation).ok_or(ServerError::UnknownOperation(operation))?;
    let ws = state.workspaces.get(&workspace).await?;
    let raw = query.params.as_deref();
    debug!(workspace = %ws.name, operation = %op, "Find request");

    let response = match op {
        Operation::FindMessages => {
            let messages = ws.finder.find_messages(&parse_params(raw)?).await?;
            Json(messages).into_response()
        }
        Operation::FindMessagesMeta => {
            let params = parse_params(raw)?;
            let rows = ws.store.lock().await.find_messages_meta(&params)?;
            Json(rows).into_response()
        }
        Operation::FindMessagesGroups => {
            let params = parse_params(raw)?;
            let rows = ws.store.lock().await.find_messages_groups(&params)?;
            Json(rows).into_response()
        }
        Operation::FindNotificationContexts => {
            let params = parse_params(raw)?;
            let rows = ws.store.lock().await.find_contexts(&params)?;
            Json(rows).into_response()
        }
        Operation::FindNotifications => {
            let params = parse_params(raw)?;
            let rows = ws.store.lock().await.find_notifications(&params)?;
            Json(rows).into_response()
        }
        Operation::FindCollaborators => {
            let params = parse_params(raw)?;
            let rows = ws.store.lock().await.find_collaborators(&params)?;
            Json(rows).into_response()
        }
    };
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    /// Comma-separated card ids.
    #[serde(default)]
    cards: String,
    #[serde(default)]
    contexts: bool,
}

/// Unregisters the session once its stream is dropped.
struct Registration {
    sessions: Arc<SessionRegistry>,
    id: SessionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.sessions.unregister(&self.id);
    }
}

async fn events(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, axum::Error>>>, ServerError> {
    let account = account(&headers)?;
    let ws = state.workspaces.get(&workspace).await?;

    let session = Session::new(account);
    let sessions = ws.router.sessions().clone();
    let rx = sessions.register(&session);
    let cards = query
        .cards
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty());
    for card in cards {
        sessions.subscribe_card(&session.id, CardId::from(card));
    }
    if query.contexts {
        sessions.subscribe_contexts(&session.id);
    }
    info!(
        workspace = %ws.name,
        session = %session.id,
        account = %session.account,
        contexts = query.contexts,
        "Broadcast stream opened"
    );

    let registration = Registration {
        sessions,
        id: session.id.clone(),
    };
    let hello = stream::once(future::ready(Ok::<_, axum::Error>(
        SseEvent::default().event("session").data(session.id.as_str()),
    )));
    let broadcasts = UnboundedReceiverStream::new(rx).map(move |broadcast| {
        let _held = &registration;
        SseEvent::default().event("broadcast").json_data(&broadcast)
    });

    Ok(Sse::new(hello.chain(broadcasts)).keep_alive(KeepAlive::default()))
}

async fn get_blob(
    State(state): State<AppState>,
    Path((workspace, blob_id)): Path<(String, String)>,
) -> Result<Response, ServerError> {
    let ws = state.workspaces.get(&workspace).await?;
    let data = ws.blobs.get(&BlobId::new(blob_id)).await?;
    Ok(([(header::CONTENT_TYPE, ARCHIVE_CONTENT_TYPE)], data).into_response())
}

async fn put_blob(
    State(state): State<AppState>,
    Path((workspace, blob_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    if body.is_empty() {
        return Err(ServerError::BadRequest("Empty blob".to_string()));
    }
    let ws = state.workspaces.get(&workspace).await?;
    ws.blobs.put(&BlobId::new(blob_id), &body).await?;
    Ok(StatusCode::CREATED)
}

async fn delete_blob(
    State(state): State<AppState>,
    Path((workspace, blob_id)): Path<(String, String)>,
) -> Result<StatusCode, ServerError> {
    let ws = state.workspaces.get(&workspace).await?;
    ws.blobs.delete(&BlobId::new(blob_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
