//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/host-meta
//! - /.well-known/nodeinfo and /nodeinfo/2.0

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{WebFingerResponse, generate_webfinger_response, parse_handle};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/host-meta
/// - GET /.well-known/nodeinfo
/// - GET /nodeinfo/2.0
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/host-meta", get(host_meta))
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/nodeinfo/2.0", get(nodeinfo))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<impl IntoResponse, AppError> {
    let federation = &state.config.federation;

    let (username, domain) = parse_handle(&query.resource)
        .ok_or_else(|| AppError::Validation(format!("Invalid resource: {}", query.resource)))?;

    if !domain.eq_ignore_ascii_case(&federation.domain) {
        return Err(AppError::NotFound(format!("{} is not hosted here", domain)));
    }

    let actor = state
        .store
        .get_local_actor_by_username(&username)
        .await?
        .filter(|actor| actor.is_active)
        .ok_or_else(|| AppError::NotFound(format!("No actor named {}", username)))?;

    let response: WebFingerResponse =
        generate_webfinger_response(&actor.username, &federation.domain, &actor.id);

    Ok(([(header::CONTENT_TYPE, "application/jrd+json")], Json(response)))
}

/// GET /.well-known/host-meta
///
/// Returns host-meta XML pointing at the WebFinger endpoint.
async fn host_meta(State(state): State<AppState>) -> impl IntoResponse {
    let base_url = state.config.federation.base_url();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" template="{}/.well-known/webfinger?resource={{uri}}"/>
</XRD>"#,
        base_url
    );

    ([(header::CONTENT_TYPE, "application/xrd+xml")], xml)
}

const NODEINFO_SCHEMA: &str = "http://nodeinfo.diaspora.software/ns/schema/2.0";

/// GET /.well-known/nodeinfo
async fn nodeinfo_links(State(state): State<AppState>) -> Json<serde_json::Value> {
    let base_url = state.config.federation.base_url();
    Json(serde_json::json!({
        "links": [
            {
                "rel": NODEINFO_SCHEMA,
                "href": format!("{}/nodeinfo/2.0", base_url)
            }
        ]
    }))
}

/// GET /nodeinfo/2.0
///
/// Accounts are provisioned from configuration, so registrations are
/// always closed.
async fn nodeinfo(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let users = state.store.count_local_actors().await?;
    let local_posts = state.store.count_local_objects().await?;

    let document = serde_json::json!({
        "version": "2.0",
        "software": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        },
        "protocols": ["activitypub"],
        "services": {"inbound": [], "outbound": []},
        "openRegistrations": false,
        "usage": {
            "users": {"total": users},
            "localPosts": local_posts
        },
        "metadata": {}
    });

    Ok((
        [(
            header::CONTENT_TYPE,
            "application/json; profile=\"http://nodeinfo.diaspora.software/ns/schema/2.0#\"",
        )],
        Json(document),
    ))
}
