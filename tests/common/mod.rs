//! Common test utilities for E2E tests
//!
//! `TestServer` runs the real router on `127.0.0.1:0` over a temp
//! database. `MockRemote` plays a remote instance: it serves actor
//! documents for any username, signs requests with its own key, and
//! records everything POSTed to its inboxes.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use fedshelf::data::{Actor, DomainStore};
use fedshelf::federation::{generate_keypair, sign_request};
use fedshelf::{AppState, config};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const LOCAL_DOMAIN: &str = "a.example";

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

/// Configuration used by [`TestServer::new`]
///
/// Local accounts: `mouse` (auto-accepts followers) and `shrew` (manual).
pub fn test_config(db_path: &Path) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: LOCAL_DOMAIN.to_string(),
            protocol: "https".to_string(),
        },
        database: config::DatabaseConfig {
            path: db_path.to_path_buf(),
        },
        federation: config::FederationConfig {
            domain: LOCAL_DOMAIN.to_string(),
            protocol: "https".to_string(),
            blocked_servers: Vec::new(),
            ignored_activity_types: vec!["Question".to_string(), "Listen".to_string()],
            ignored_object_types: vec!["Question".to_string(), "Video".to_string()],
            max_signature_age_secs: 300,
            request_timeout_secs: 5,
            inbound_timeout_secs: 20,
            delivery_workers: 4,
            max_delivery_attempts: 3,
            base_backoff_secs: 1,
            max_backoff_secs: 4,
            queue_poll_interval_secs: 1,
            allow_private_addresses: true,
            user_agent: "Fedshelf-Test/0.1".to_string(),
            key_size_bits: 1024,
        },
        logging: config::LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
        accounts: vec![
            config::AccountConfig {
                username: "mouse".to_string(),
                display_name: Some("Mouse".to_string()),
                manually_approves_followers: false,
            },
            config::AccountConfig {
                username: "shrew".to_string(),
                display_name: None,
                manually_approves_followers: true,
            },
        ],
    }
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server after adjusting the default test configuration
    pub async fn with_config(adjust: impl FnOnce(&mut config::AppConfig)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir.path().join("test.db"));
        adjust(&mut config);

        let state = AppState::new(config).await.unwrap();

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = fedshelf::build_router(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// URI of a local actor
    pub fn actor_uri(&self, username: &str) -> String {
        format!("https://{}/user/{}", LOCAL_DOMAIN, username)
    }

    pub async fn local_actor(&self, username: &str) -> Actor {
        self.state
            .store
            .get_local_actor_by_username(username)
            .await
            .unwrap()
            .unwrap()
    }
}

/// One request received by the mock remote's inboxes
#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub path: String,
    pub headers: HeaderMap,
    pub raw: Vec<u8>,
    pub body: Value,
}

#[derive(Clone)]
struct MockState {
    base: String,
    keys: Arc<RwLock<(String, String)>>,
    posts: Arc<Mutex<Vec<RecordedPost>>>,
    inbox_status: Arc<AtomicU16>,
}

/// A remote instance on a random local port
pub struct MockRemote {
    pub base: String,
    state: MockState,
}

impl MockRemote {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let base = format!("http://{}", addr);

        let state = MockState {
            base: base.clone(),
            keys: Arc::new(RwLock::new(generate_keypair(1024).unwrap())),
            posts: Arc::new(Mutex::new(Vec::new())),
            inbox_status: Arc::new(AtomicU16::new(202)),
        };

        let app = Router::new()
            .route("/users/:name", get(mock_actor))
            .route("/users/:name/inbox", post(mock_inbox))
            .route("/inbox", post(mock_inbox))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base, state }
    }

    /// Actor URI for `name` on this remote
    pub fn actor(&self, name: &str) -> String {
        format!("{}/users/{}", self.base, name)
    }

    pub fn shared_inbox(&self) -> String {
        format!("{}/inbox", self.base)
    }

    /// Replace the key pair every remote actor signs with
    pub fn rotate_key(&self) {
        *self.state.keys.write().unwrap() = generate_keypair(1024).unwrap();
    }

    /// Status code the inboxes answer with
    pub fn set_inbox_status(&self, status: u16) {
        self.state.inbox_status.store(status, Ordering::SeqCst);
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.state.posts.lock().unwrap().clone()
    }

    /// Recorded posts whose activity `type` is `kind`
    pub fn posts_of_type(&self, kind: &str) -> Vec<RecordedPost> {
        self.posts()
            .into_iter()
            .filter(|post| post.body["type"] == kind)
            .collect()
    }

    /// POST `activity` to `server` at `path`, signed as `actor`
    pub async fn post_signed(
        &self,
        server: &TestServer,
        path: &str,
        actor: &str,
        activity: &Value,
    ) -> reqwest::Response {
        let private_key = self.state.keys.read().unwrap().0.clone();
        self.post_signed_with(server, path, actor, activity, &private_key)
            .await
    }

    /// Like [`post_signed`](Self::post_signed) with an arbitrary key
    pub async fn post_signed_with(
        &self,
        server: &TestServer,
        path: &str,
        actor: &str,
        activity: &Value,
        private_key_pem: &str,
    ) -> reqwest::Response {
        let url = server.url(path);
        let body = serde_json::to_vec(activity).unwrap();
        let signed = sign_request(
            "POST",
            &url,
            Some(&body),
            private_key_pem,
            &format!("{}#main-key", actor),
        )
        .unwrap();

        let mut request = server
            .client
            .post(&url)
            .header("Content-Type", "application/activity+json")
            .header("Date", signed.date)
            .header("Signature", signed.signature);
        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }

        request.body(body).send().await.unwrap()
    }
}

async fn mock_actor(State(state): State<MockState>, UrlPath(name): UrlPath<String>) -> Json<Value> {
    let id = format!("{}/users/{}", state.base, name);
    let public_key = state.keys.read().unwrap().1.clone();

    Json(json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "id": id,
        "type": "Person",
        "preferredUsername": name,
        "name": name,
        "inbox": format!("{}/inbox", id),
        "endpoints": {"sharedInbox": format!("{}/inbox", state.base)},
        "publicKey": {
            "id": format!("{}#main-key", id),
            "owner": id,
            "publicKeyPem": public_key
        }
    }))
}

async fn mock_inbox(
    State(state): State<MockState>,
    uri: axum::http::Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.posts.lock().unwrap().push(RecordedPost {
        path: uri.path().to_string(),
        headers,
        raw: body.to_vec(),
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    });

    StatusCode::from_u16(state.inbox_status.load(Ordering::SeqCst)).unwrap_or(StatusCode::OK)
}
