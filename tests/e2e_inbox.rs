//! E2E tests for the inboxes: signature checks, dispatch and side effects

mod common;

use common::{MockRemote, TestServer};
use fedshelf::data::{DomainStore, InteractionKind, RelationshipState};
use fedshelf::federation::{SignedRequest, generate_keypair, verify_signature};
use serde_json::json;

#[tokio::test]
async fn follow_is_accepted_and_redelivery_is_idempotent() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    let rat = remote.actor("rat");
    let mouse = server.actor_uri("mouse");

    let follow = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/follows/1", rat),
        "type": "Follow",
        "actor": rat,
        "object": mouse
    });

    let response = remote
        .post_signed(&server, "/user/mouse/inbox", &rat, &follow)
        .await;
    assert_eq!(response.status(), 200);

    let store = &server.state.store;
    let relationship = store.get_relationship(&rat, &mouse).await.unwrap().unwrap();
    assert_eq!(relationship.state, RelationshipState::Accepted);

    let notifications = store.get_notifications(&mouse).await.unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, "FOLLOW");

    // Identical redelivery
    let response = remote
        .post_signed(&server, "/user/mouse/inbox", &rat, &follow)
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(store.get_followers(&mouse).await.unwrap().len(), 1);
    assert_eq!(store.get_notifications(&mouse).await.unwrap().len(), 1);

    // The Accept goes out signed by mouse
    let outcomes = server.state.queue.drain().await.unwrap();
    assert_eq!(outcomes.len(), 1);

    let accepts = remote.posts_of_type("Accept");
    assert_eq!(accepts.len(), 1);
    let accept = &accepts[0];
    assert_eq!(accept.path, "/inbox");
    assert_eq!(accept.body["actor"], mouse.as_str());
    assert_eq!(accept.body["object"]["id"], follow["id"]);

    let mouse_actor = server.local_actor("mouse").await;
    let request = SignedRequest {
        method: "POST",
        path: &accept.path,
        headers: &accept.headers,
        body: &accept.raw,
    };
    verify_signature(&request, &mouse_actor.public_key_pem, 300).unwrap();
}

#[tokio::test]
async fn manual_approval_leaves_follow_pending() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    let rat = remote.actor("rat");
    let shrew = server.actor_uri("shrew");

    let follow = json!({
        "id": format!("{}/follows/2", rat),
        "type": "Follow",
        "actor": rat,
        "object": shrew
    });
    let response = remote.post_signed(&server, "/inbox", &rat, &follow).await;
    assert_eq!(response.status(), 200);

    let relationship = server
        .state
        .store
        .get_relationship(&rat, &shrew)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(relationship.state, RelationshipState::Requested);
    assert!(server.state.queue.drain().await.unwrap().is_empty());
}

#[tokio::test]
async fn wrong_key_is_unauthorized_except_for_delete() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    let rat = remote.actor("rat");
    let (forged_key, _) = generate_keypair(1024).unwrap();

    let follow = json!({
        "id": format!("{}/follows/3", rat),
        "type": "Follow",
        "actor": rat,
        "object": server.actor_uri("mouse")
    });
    let response = remote
        .post_signed_with(&server, "/inbox", &rat, &follow, &forged_key)
        .await;
    assert_eq!(response.status(), 401);
    assert!(
        server
            .state
            .store
            .get_followers(&server.actor_uri("mouse"))
            .await
            .unwrap()
            .is_empty()
    );

    let delete = json!({
        "id": format!("{}#delete", rat),
        "type": "Delete",
        "actor": rat,
        "object": rat
    });
    let response = remote
        .post_signed_with(&server, "/inbox", &rat, &delete, &forged_key)
        .await;
    assert_eq!(response.status(), 200);

    let stored = server.state.store.get_actor(&rat).await.unwrap().unwrap();
    assert!(stored.is_active);
}

#[tokio::test]
async fn forged_signature_is_rejected_for_every_verb() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    let rat = remote.actor("rat");
    let mouse = server.local_actor("mouse").await;
    let store = &server.state.store;

    let follow = json!({
        "id": format!("{}/follows/10", rat),
        "type": "Follow",
        "actor": rat,
        "object": mouse.id
    });
    let response = remote.post_signed(&server, "/inbox", &rat, &follow).await;
    assert_eq!(response.status(), 200);

    let rat_actor = store.get_actor(&rat).await.unwrap().unwrap();
    let outbound = server
        .state
        .broadcaster
        .send_follow(&mouse, &rat_actor)
        .await
        .unwrap();

    let (forged_key, _) = generate_keypair(1024).unwrap();
    let status = format!("{}/status/1", mouse.id);
    let note = format!("{}/statuses/9", rat);
    let list = format!("{}/lists/1", rat);
    let activities = [
        json!({
            "id": format!("{}/activity", note), "type": "Create", "actor": rat,
            "object": {"id": note, "type": "Note", "attributedTo": rat, "content": "forged"}
        }),
        json!({"id": format!("{}/likes/1", rat), "type": "Like", "actor": rat, "object": status}),
        json!({"id": format!("{}/boosts/1", rat), "type": "Announce", "actor": rat, "object": status}),
        json!({"id": format!("{}/undo/10", rat), "type": "Undo", "actor": rat, "object": follow}),
        json!({"id": format!("{}/blocks/10", rat), "type": "Block", "actor": rat, "object": mouse.id}),
        json!({
            "id": format!("{}/add/1", rat), "type": "Add", "actor": rat,
            "object": {"id": "https://c.example/book/1", "type": "Edition", "title": "Forged"},
            "target": list
        }),
        json!({
            "id": format!("{}#update", rat), "type": "Update", "actor": rat,
            "object": {"id": rat, "type": "Person", "preferredUsername": "rat", "name": "Forged"}
        }),
        json!({"id": format!("{}/accepts/10", rat), "type": "Accept", "actor": rat, "object": outbound}),
    ];

    for activity in &activities {
        let response = remote
            .post_signed_with(&server, "/inbox", &rat, activity, &forged_key)
            .await;
        assert_eq!(response.status(), 401, "{}", activity["type"]);
    }

    assert!(store.get_object(&note).await.unwrap().is_none());
    for kind in [InteractionKind::Favorite, InteractionKind::Boost] {
        assert!(store.get_interactions(kind, &status).await.unwrap().is_empty());
    }
    assert_eq!(store.get_followers(&mouse.id).await.unwrap().len(), 1);
    assert!(store.get_block(&rat, &mouse.id).await.unwrap().is_none());
    assert!(store.get_collection_items(&list).await.unwrap().is_empty());
    assert_ne!(
        store.get_actor(&rat).await.unwrap().unwrap().display_name.as_deref(),
        Some("Forged")
    );
    let pending = store.get_relationship(&mouse.id, &rat).await.unwrap().unwrap();
    assert_eq!(pending.state, RelationshipState::Requested);
}

#[tokio::test]
async fn unsigned_and_malformed_requests() {
    let server = TestServer::new().await;

    let response = server
        .client
        .post(server.url("/inbox"))
        .header("Content-Type", "application/activity+json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = server
        .client
        .post(server.url("/user/nobody/inbox"))
        .json(&json!({"id": "x", "type": "Follow", "actor": "y", "object": "z"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let unknown = json!({
        "id": "https://b.example/zap/1",
        "type": "Zap",
        "actor": "https://b.example/users/rat",
        "object": "https://a.example/user/mouse"
    });
    let response = server
        .client
        .post(server.url("/inbox"))
        .json(&unknown)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let unsigned = json!({
        "id": "https://b.example/follows/9",
        "type": "Follow",
        "actor": "https://b.example/users/rat",
        "object": "https://a.example/user/mouse"
    });
    let response = server
        .client
        .post(server.url("/inbox"))
        .json(&unsigned)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn blocked_server_is_dropped_silently() {
    let server = TestServer::with_config(|config| {
        config.federation.blocked_servers = vec!["127.0.0.1".to_string()];
    })
    .await;
    let remote = MockRemote::start().await;
    let rat = remote.actor("rat");
    let mouse = server.actor_uri("mouse");

    let follow = json!({
        "id": format!("{}/follows/4", rat),
        "type": "Follow",
        "actor": rat,
        "object": mouse
    });
    let response = remote.post_signed(&server, "/inbox", &rat, &follow).await;
    assert_eq!(response.status(), 200);

    assert!(server.state.store.get_followers(&mouse).await.unwrap().is_empty());
    assert!(server.state.store.get_actor(&rat).await.unwrap().is_none());
}

#[tokio::test]
async fn rotated_key_is_refetched() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    let rat = remote.actor("rat");
    let mouse = server.actor_uri("mouse");

    let follow = json!({
        "id": format!("{}/follows/5", rat),
        "type": "Follow",
        "actor": rat,
        "object": mouse
    });
    let response = remote.post_signed(&server, "/inbox", &rat, &follow).await;
    assert_eq!(response.status(), 200);

    remote.rotate_key();

    let undo = json!({
        "id": format!("{}/undo/1", rat),
        "type": "Undo",
        "actor": rat,
        "object": follow
    });
    let response = remote.post_signed(&server, "/inbox", &rat, &undo).await;
    assert_eq!(response.status(), 200);

    assert!(server.state.store.get_followers(&mouse).await.unwrap().is_empty());
}

#[tokio::test]
async fn reply_mentioning_local_actor_notifies() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    let rat = remote.actor("rat");
    let mouse = server.actor_uri("mouse");

    let create = json!({
        "id": format!("{}/statuses/1/activity", rat),
        "type": "Create",
        "actor": rat,
        "object": {
            "id": format!("{}/statuses/1", rat),
            "type": "Note",
            "attributedTo": rat,
            "content": "<p>@mouse have you read this?</p>",
            "tag": [{"type": "Mention", "href": mouse}]
        }
    });
    let response = remote.post_signed(&server, "/inbox", &rat, &create).await;
    assert_eq!(response.status(), 200);

    let notifications = server.state.store.get_notifications(&mouse).await.unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, "MENTION");
}

#[tokio::test]
async fn create_from_deleted_actor_is_forbidden() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    let rat = remote.actor("rat");

    let delete = json!({
        "id": format!("{}#delete", rat),
        "type": "Delete",
        "actor": rat,
        "object": rat
    });
    let response = remote.post_signed(&server, "/inbox", &rat, &delete).await;
    assert_eq!(response.status(), 200);

    let create = json!({
        "id": format!("{}/statuses/2/activity", rat),
        "type": "Create",
        "actor": rat,
        "object": {
            "id": format!("{}/statuses/2", rat),
            "type": "Note",
            "attributedTo": rat,
            "content": "still here"
        }
    });
    let response = remote.post_signed(&server, "/inbox", &rat, &create).await;
    assert_eq!(response.status(), 403);
}
