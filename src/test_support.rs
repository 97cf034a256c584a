//! Shared fixtures for unit tests

use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use crate::config::FederationConfig;
use crate::data::{Actor, Database, DomainStore};
use crate::federation::{
    ActorResolver, Broadcaster, DeliveryQueue, FederationContext, build_local_actor,
};

lazy_static::lazy_static! {
    /// One key pair reused by every fixture actor; generation is slow
    pub static ref TEST_KEYS: (String, String) =
        crate::federation::signature::tests::generate_test_keypair();
}

pub const RAT: &str = "https://b.example/users/rat";

pub async fn test_store() -> (Arc<Database>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::connect(&temp_dir.path().join("test.db"))
        .await
        .unwrap();
    (Arc::new(db), temp_dir)
}

pub fn federation_config() -> FederationConfig {
    crate::config::tests::federation_config("a.example")
}

pub fn local_actor(config: &FederationConfig, username: &str, manual: bool) -> Actor {
    let mut actor = build_local_actor(
        config,
        username,
        TEST_KEYS.0.clone(),
        TEST_KEYS.1.clone(),
    );
    actor.manually_approves_followers = manual;
    actor
}

pub fn remote_actor(id: &str) -> Actor {
    let parsed = url::Url::parse(id).unwrap();
    let now = Utc::now();
    Actor {
        id: id.to_string(),
        username: id.rsplit('/').next().unwrap().to_string(),
        domain: parsed.host_str().unwrap().to_string(),
        inbox: format!("{id}/inbox"),
        shared_inbox: Some(format!("https://{}/inbox", parsed.host_str().unwrap())),
        public_key_pem: TEST_KEYS.1.clone(),
        private_key_pem: None,
        local: false,
        manually_approves_followers: false,
        is_active: true,
        display_name: None,
        summary: None,
        created_at: now,
        updated_at: now,
    }
}

/// Handler context over a temp database, with `mouse` (local) and `rat`
/// (remote) already stored
pub struct Fixture {
    pub ctx: FederationContext,
    pub store: Arc<Database>,
    pub mouse: Actor,
    pub rat: Actor,
    _dir: TempDir,
}

pub async fn fixture() -> Fixture {
    fixture_with(federation_config(), false).await
}

pub async fn fixture_with(config: FederationConfig, mouse_manual: bool) -> Fixture {
    let (store, dir) = test_store().await;
    let config = Arc::new(config);
    let http_client = Arc::new(reqwest::Client::new());

    let mouse = local_actor(&config, "mouse", mouse_manual);
    let rat = remote_actor(RAT);
    store.upsert_actor(&mouse).await.unwrap();
    store.upsert_actor(&rat).await.unwrap();

    let dyn_store: Arc<dyn DomainStore> = store.clone();
    let resolver = Arc::new(ActorResolver::new(
        dyn_store.clone(),
        http_client.clone(),
        config.clone(),
    ));
    let queue = Arc::new(DeliveryQueue::new(
        dyn_store.clone(),
        http_client,
        config.clone(),
    ));
    let broadcaster = Arc::new(Broadcaster::new(
        dyn_store.clone(),
        resolver.clone(),
        queue,
    ));

    Fixture {
        ctx: FederationContext {
            store: dyn_store,
            resolver,
            broadcaster,
            config,
        },
        store,
        mouse,
        rat,
        _dir: dir,
    }
}

/// Parse an activity from JSON, panicking on invalid input
pub fn activity(value: serde_json::Value) -> crate::federation::Activity {
    crate::federation::Activity::from_value(value).unwrap()
}
