//! Actor resolution
//!
//! Resolves actor URIs (or `user@domain` handles) to [`Actor`] records:
//! local and cached actors come from the store, unknown remote actors are
//! fetched once and persisted. Re-fetching only happens on explicit
//! [`ActorResolver::refresh`].

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use super::activity::{ACTOR_TYPES, strip_fragment};
use super::webfinger::{parse_handle, resolve_webfinger};
use crate::config::FederationConfig;
use crate::data::{Actor, DomainStore};
use crate::error::AppError;

const ACTIVITY_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Reject URLs that would make this server fetch from itself or an
/// internal network
///
/// Checks the literal host and, for names, every resolved address.
pub async fn validate_remote_url(url: &str, allow_private: bool) -> Result<url::Url, AppError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| AppError::Validation(format!("Invalid remote URL {}: {}", url, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in remote URL".to_string()))?
        .to_ascii_lowercase();

    if allow_private {
        return Ok(parsed);
    }

    if is_disallowed_host(&host) {
        return Err(AppError::Forbidden(format!("Refusing to fetch from {}", host)));
    }

    let port = parsed.port_or_known_default().unwrap_or(443);
    let lookup = tokio::net::lookup_host((host.trim_end_matches('.'), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve {}: {}", host, e)))?;

    let mut resolved_any = false;
    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden(format!(
                "{} resolves to a private address",
                host
            )));
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(format!("No DNS records for {}", host)));
    }

    Ok(parsed)
}

/// Build an [`Actor`] from an actor document
///
/// The document must carry an actor `type`, `id`, `inbox` and
/// `publicKey.publicKeyPem`.
pub fn parse_actor(doc: &Value) -> Result<Actor, AppError> {
    let invalid = |what: &str| AppError::Federation(format!("Invalid actor document: {}", what));

    let actor_type = doc.get("type").and_then(Value::as_str).unwrap_or_default();
    if !ACTOR_TYPES.contains(&actor_type) {
        return Err(invalid("not an actor type"));
    }

    let id = doc
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing id"))?;
    let domain = url::Url::parse(id)
        .ok()
        .and_then(|u| {
            u.host_str().map(|host| match u.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            })
        })
        .ok_or_else(|| invalid("id is not a URL"))?;

    let inbox = doc
        .get("inbox")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing inbox"))?;

    let shared_inbox = doc
        .get("endpoints")
        .and_then(|e| e.get("sharedInbox"))
        .and_then(Value::as_str)
        .or_else(|| doc.get("sharedInbox").and_then(Value::as_str))
        .map(str::to_string);

    let public_key_pem = doc
        .get("publicKey")
        .and_then(|k| k.get("publicKeyPem"))
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing publicKey"))?;

    let username = doc
        .get("preferredUsername")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            strip_fragment(id)
                .rsplit('/')
                .next()
                .map(str::to_string)
        })
        .unwrap_or_default();

    let now = Utc::now();
    Ok(Actor {
        id: id.to_string(),
        username,
        domain,
        inbox: inbox.to_string(),
        shared_inbox,
        public_key_pem: public_key_pem.to_string(),
        private_key_pem: None,
        local: false,
        manually_approves_followers: doc
            .get("manuallyApprovesFollowers")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        is_active: true,
        display_name: doc.get("name").and_then(Value::as_str).map(str::to_string),
        summary: doc
            .get("summary")
            .and_then(Value::as_str)
            .map(super::activity::sanitize_remote_html),
        created_at: now,
        updated_at: now,
    })
}

/// Record for a new local actor with its own signing key
pub fn build_local_actor(
    config: &FederationConfig,
    username: &str,
    private_key_pem: String,
    public_key_pem: String,
) -> Actor {
    let id = config.actor_uri(username);
    let now = Utc::now();
    Actor {
        inbox: format!("{}/inbox", id),
        shared_inbox: Some(config.shared_inbox_uri()),
        id,
        username: username.to_string(),
        domain: config.domain.clone(),
        public_key_pem,
        private_key_pem: Some(private_key_pem),
        local: true,
        manually_approves_followers: false,
        is_active: true,
        display_name: None,
        summary: None,
        created_at: now,
        updated_at: now,
    }
}

/// Resolves and caches actors
pub struct ActorResolver {
    store: Arc<dyn DomainStore>,
    http_client: Arc<reqwest::Client>,
    config: Arc<FederationConfig>,
}

impl ActorResolver {
    pub fn new(
        store: Arc<dyn DomainStore>,
        http_client: Arc<reqwest::Client>,
        config: Arc<FederationConfig>,
    ) -> Self {
        Self {
            store,
            http_client,
            config,
        }
    }

    /// Whether `uri` is hosted on this instance
    pub fn is_local_uri(&self, uri: &str) -> bool {
        url::Url::parse(uri)
            .ok()
            .and_then(|u| {
                u.host_str().map(|host| match u.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                })
            })
            .is_some_and(|authority| authority.eq_ignore_ascii_case(&self.config.domain))
    }

    /// Resolve an actor URI to a record
    ///
    /// Local actors never touch the network; unknown local URIs are
    /// `NotFound`. Unknown remote actors are fetched and persisted.
    pub async fn resolve(&self, uri: &str) -> Result<Actor, AppError> {
        let uri = uri.split_once('#').map_or(uri, |(base, _)| base);

        if let Some(actor) = self.store.get_actor(uri).await? {
            return Ok(actor);
        }

        if self.is_local_uri(uri) {
            return Err(AppError::NotFound(format!("No local actor {}", uri)));
        }

        self.fetch_and_store(uri).await
    }

    /// Re-fetch a remote actor and overwrite the cached record
    ///
    /// Local actors are returned unchanged.
    pub async fn refresh(&self, uri: &str) -> Result<Actor, AppError> {
        let uri = uri.split_once('#').map_or(uri, |(base, _)| base);
        if self.is_local_uri(uri) {
            return self
                .store
                .get_actor(uri)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("No local actor {}", uri)));
        }

        self.fetch_and_store(uri).await
    }

    /// Resolve a `user@domain` handle through WebFinger
    pub async fn resolve_handle(&self, handle: &str) -> Result<Actor, AppError> {
        let (user, domain) = parse_handle(handle)
            .ok_or_else(|| AppError::Validation(format!("Invalid account handle: {}", handle)))?;

        if domain.eq_ignore_ascii_case(&self.config.domain) {
            return self
                .store
                .get_local_actor_by_username(&user)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("No local actor {}", user)));
        }

        validate_remote_url(
            &format!("{}://{}/", self.config.protocol, domain),
            self.config.allow_private_addresses,
        )
        .await?;
        let result = resolve_webfinger(handle, &self.config.protocol, &self.http_client).await?;
        self.resolve(&result.actor_uri).await
    }

    /// Resolve either an actor URI or a bare handle
    pub async fn resolve_reference(&self, reference: &str) -> Result<Actor, AppError> {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            self.resolve(reference).await
        } else {
            self.resolve_handle(reference).await
        }
    }

    /// GET an ActivityPub document
    pub async fn fetch_object(&self, uri: &str) -> Result<Value, AppError> {
        let url = validate_remote_url(uri, self.config.allow_private_addresses).await?;

        let response = self
            .http_client
            .get(url)
            .header("Accept", ACTIVITY_ACCEPT)
            .timeout(self.config.request_timeout())
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to fetch {}: {}", uri, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Failed to fetch {}: HTTP {}",
                uri,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Invalid JSON from {}: {}", uri, e)))
    }

    async fn fetch_and_store(&self, uri: &str) -> Result<Actor, AppError> {
        let doc = self.fetch_object(uri).await?;
        let mut actor = parse_actor(&doc)?;

        // The document must describe the actor we asked for
        if strip_fragment(&actor.id) != strip_fragment(uri) {
            return Err(AppError::Federation(format!(
                "Actor document id {} does not match {}",
                actor.id, uri
            )));
        }

        if let Some(existing) = self.store.get_actor(&actor.id).await? {
            actor.created_at = existing.created_at;
            actor.is_active = existing.is_active;
        }

        self.store.upsert_actor(&actor).await?;
        tracing::debug!(actor = %actor.id, "Stored remote actor");

        Ok(actor)
    }
}
