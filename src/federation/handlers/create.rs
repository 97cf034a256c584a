use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;

use super::{is_storable_type, notify_local, object_author, remote_object};
use crate::data::{Actor, NotificationType};
use crate::error::AppError;
use crate::federation::activity::{Activity, ObjectRef, strip_fragment};
use crate::federation::dispatcher::{ActivityHandler, FederationContext};

/// Create of a status, rating, book or collection
///
/// The object must be attributed to the signer. Content is sanitized
/// before storage. Replies to a local author notify that author (REPLY);
/// local actors in `Mention` tags are notified (MENTION) unless they
/// already got the REPLY. Replies to unknown parents are still stored.
pub struct CreateHandler;

#[async_trait]
impl ActivityHandler for CreateHandler {
    async fn handle(
        &self,
        ctx: &FederationContext,
        activity: &Activity,
        signer: &Actor,
    ) -> Result<(), AppError> {
        let object = match &activity.object {
            ObjectRef::Embedded(_) => activity.object.clone(),
            ObjectRef::Uri(uri) => match ctx.resolver.fetch_object(uri).await {
                Ok(Value::Object(map)) => ObjectRef::Embedded(map),
                Ok(_) | Err(_) => {
                    tracing::debug!(object = %uri, "Dropping Create of unfetchable object");
                    return Ok(());
                }
            },
        };

        let object_type = object
            .object_type()
            .ok_or_else(|| AppError::Validation("Created object has no type".to_string()))?;
        if ctx.config.is_ignored_object(object_type) {
            return Ok(());
        }
        if !is_storable_type(object_type) {
            return Err(AppError::UnsupportedObject(format!("Create of {}", object_type)));
        }

        let mut stored = remote_object(&object.to_value())?;
        match object_author(&object) {
            Some(author) if strip_fragment(author) != strip_fragment(&signer.id) => {
                return Err(AppError::Forbidden(format!(
                    "{} cannot create an object attributed to {}",
                    signer.id, author
                )));
            }
            Some(_) => {}
            None => stored.attributed_to = Some(signer.id.clone()),
        }

        if !ctx.store.insert_object(&stored).await? {
            tracing::debug!(object = %stored.id, "Object already known");
            return Ok(());
        }

        tracing::info!(
            object = %stored.id,
            object_type = %stored.object_type,
            author = %signer.id,
            "Stored remote object"
        );

        let mut notified = HashSet::new();

        if let Some(parent_id) = &stored.in_reply_to {
            let parent_author = ctx
                .store
                .get_object(parent_id)
                .await?
                .filter(|parent| parent.local && !parent.deleted)
                .and_then(|parent| parent.attributed_to);
            if let Some(author) = parent_author {
                if notify_local(ctx, &author, NotificationType::Reply, signer, Some(&stored.id))
                    .await?
                {
                    notified.insert(author);
                }
            }
        }

        for mentioned in mention_hrefs(&object) {
            if notified.contains(&mentioned) || !ctx.resolver.is_local_uri(&mentioned) {
                continue;
            }
            if notify_local(ctx, &mentioned, NotificationType::Mention, signer, Some(&stored.id))
                .await?
            {
                notified.insert(mentioned);
            }
        }

        Ok(())
    }
}

/// `href`s of `Mention` tags
fn mention_hrefs(object: &ObjectRef) -> Vec<String> {
    let Some(Value::Array(tags)) = object.get("tag") else {
        return Vec::new();
    };

    tags.iter()
        .filter(|tag| tag.get("type").and_then(Value::as_str) == Some("Mention"))
        .filter_map(|tag| tag.get("href").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DomainStore, StoredObject};
    use crate::test_support::{self, RAT, activity};
    use chrono::Utc;
    use serde_json::json;

    fn create(object: Value) -> Activity {
        activity(json!({
            "id": "https://b.example/create/1",
            "type": "Create",
            "actor": RAT,
            "object": object
        }))
    }

    async fn local_status(fx: &test_support::Fixture, id: &str) {
        let now = Utc::now();
        fx.store
            .insert_object(&StoredObject {
                id: id.to_string(),
                object_type: "Note".to_string(),
                attributed_to: Some(fx.mouse.id.clone()),
                content: Some("squeak".to_string()),
                in_reply_to: None,
                data: "{}".to_string(),
                local: true,
                deleted: false,
                deleted_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reply_with_mention_notifies_once() {
        let fx = test_support::fixture().await;
        local_status(&fx, "https://a.example/status/1").await;

        let reply = create(json!({
            "id": "https://b.example/status/9",
            "type": "Note",
            "attributedTo": RAT,
            "inReplyTo": "https://a.example/status/1",
            "content": "<p>hi <script>x</script></p>",
            "tag": [{"type": "Mention", "href": fx.mouse.id}]
        }));
        CreateHandler.handle(&fx.ctx, &reply, &fx.rat).await.unwrap();
        CreateHandler.handle(&fx.ctx, &reply, &fx.rat).await.unwrap();

        let stored = fx
            .store
            .get_object("https://b.example/status/9")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.content.as_deref(), Some("<p>hi </p>"));

        let notifications = fx.store.get_notifications(&fx.mouse.id).await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, "REPLY");
    }

    #[tokio::test]
    async fn mention_of_local_actor_notifies() {
        let fx = test_support::fixture().await;

        let note = create(json!({
            "id": "https://b.example/status/10",
            "type": "Review",
            "attributedTo": RAT,
            "inReplyTo": "https://b.example/status/unknown",
            "content": "good book",
            "tag": [{"type": "Mention", "href": fx.mouse.id}]
        }));
        CreateHandler.handle(&fx.ctx, &note, &fx.rat).await.unwrap();

        let notifications = fx.store.get_notifications(&fx.mouse.id).await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, "MENTION");
    }

    #[tokio::test]
    async fn misattributed_object_is_forbidden() {
        let fx = test_support::fixture().await;

        let forged = create(json!({
            "id": "https://b.example/status/11",
            "type": "Note",
            "attributedTo": "https://c.example/users/shrew",
            "content": "not mine"
        }));
        let err = CreateHandler.handle(&fx.ctx, &forged, &fx.rat).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn unhandled_subtype_is_unsupported() {
        let fx = test_support::fixture().await;

        let odd = create(json!({
            "id": "https://b.example/thing/1",
            "type": "Hologram",
            "attributedTo": RAT
        }));
        let err = CreateHandler.handle(&fx.ctx, &odd, &fx.rat).await.unwrap_err();
        assert!(matches!(err, AppError::UnsupportedObject(_)));
    }
}
