//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (activity receiving), shared and per actor

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::{
    Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde_json::{Value, json};

use crate::AppState;
use crate::data::Actor;
use crate::error::AppError;
use crate::federation::SignedRequest;

const ACTIVITY_JSON: &str = "application/activity+json";

/// Create ActivityPub router
///
/// Routes:
/// - GET /user/:username - Actor profile
/// - POST /user/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/user/:username", get(actor))
        .route("/user/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
}

/// GET /user/:username
///
/// Returns the ActivityPub actor document. The private key never leaves
/// the store.
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let actor = state
        .store
        .get_local_actor_by_username(&username)
        .await?
        .filter(|actor| actor.is_active)
        .ok_or_else(|| AppError::NotFound(format!("No actor named {}", username)))?;

    Ok((
        [(header::CONTENT_TYPE, ACTIVITY_JSON)],
        axum::Json(actor_document(&actor)),
    )
        .into_response())
}

/// Actor document for a local actor
pub(crate) fn actor_document(actor: &Actor) -> Value {
    json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": "Person",
        "id": actor.id,
        "preferredUsername": actor.username,
        "name": actor.display_name.as_deref().unwrap_or(&actor.username),
        "summary": actor.summary.as_deref().unwrap_or_default(),
        "inbox": actor.inbox,
        "followers": format!("{}/followers", actor.id),
        "url": actor.id,
        "endpoints": {
            "sharedInbox": actor.shared_inbox
        },
        "manuallyApprovesFollowers": actor.manually_approves_followers,
        "publicKey": {
            "id": actor.key_id(),
            "owner": actor.id,
            "publicKeyPem": actor.public_key_pem
        }
    })
}

/// POST /user/:username/inbox
///
/// 404 when `username` is not a local actor; otherwise the same as the
/// shared inbox.
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, &method, &uri, &headers, &body, Some(&username)).await
}

/// POST /inbox
///
/// Shared inbox for all actors on this instance.
async fn shared_inbox(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, &method, &uri, &headers, &body, None).await
}

async fn receive(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
    inbox_owner: Option<&str>,
) -> Result<StatusCode, AppError> {
    let path = uri
        .path_and_query()
        .map_or_else(|| uri.path(), |path| path.as_str());

    let request = SignedRequest {
        method: method.as_str(),
        path,
        headers,
        body,
    };

    state.inbox.receive(&request, inbox_owner).await?;
    Ok(StatusCode::OK)
}
