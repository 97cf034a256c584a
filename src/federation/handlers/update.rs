use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::{object_author, remote_object};
use crate::data::Actor;
use crate::error::AppError;
use crate::federation::activity::{Activity, ObjectRef, strip_fragment};
use crate::federation::dispatcher::{ActivityHandler, FederationContext};
use crate::federation::resolver::parse_actor;

/// Update of an actor profile, only by the actor itself
///
/// Unknown actors are not created here; they are fetched on first real use.
pub struct UpdateActorHandler;

#[async_trait]
impl ActivityHandler for UpdateActorHandler {
    async fn handle(
        &self,
        ctx: &FederationContext,
        activity: &Activity,
        signer: &Actor,
    ) -> Result<(), AppError> {
        let actor_id = activity
            .object
            .id()
            .ok_or_else(|| AppError::Validation("Update without object id".to_string()))?;

        if strip_fragment(actor_id) != strip_fragment(&signer.id) {
            return Err(AppError::Forbidden(format!(
                "{} cannot update {}",
                signer.id, actor_id
            )));
        }

        let Some(existing) = ctx.store.get_actor(&signer.id).await? else {
            return Ok(());
        };
        if existing.local {
            return Err(AppError::Forbidden("Local actors are not updated remotely".to_string()));
        }

        let mut updated = parse_actor(&activity.object.to_value())?;
        updated.id = existing.id.clone();
        updated.created_at = existing.created_at;
        updated.is_active = existing.is_active;
        updated.updated_at = Utc::now();

        ctx.store.upsert_actor(&updated).await?;
        tracing::info!(actor = %updated.id, "Actor profile updated");
        Ok(())
    }
}

/// Update of a known object, only by its author
///
/// Updates for unknown or tombstoned objects are dropped; an Update never
/// creates an object.
pub struct UpdateObjectHandler;

#[async_trait]
impl ActivityHandler for UpdateObjectHandler {
    async fn handle(
        &self,
        ctx: &FederationContext,
        activity: &Activity,
        signer: &Actor,
    ) -> Result<(), AppError> {
        let ObjectRef::Embedded(_) = &activity.object else {
            tracing::debug!(activity = %activity.id, "Update without embedded object, dropping");
            return Ok(());
        };

        let object_id = activity
            .object
            .id()
            .ok_or_else(|| AppError::Validation("Update without object id".to_string()))?;

        let Some(existing) = ctx.store.get_object(object_id).await? else {
            tracing::debug!(object = %object_id, "Update of unknown object, dropping");
            return Ok(());
        };

        let author = existing
            .attributed_to
            .as_deref()
            .or_else(|| object_author(&activity.object));
        if let Some(author) = author {
            if strip_fragment(author) != strip_fragment(&signer.id) {
                return Err(AppError::Forbidden(format!(
                    "{} cannot update {}",
                    signer.id, object_id
                )));
            }
        }
        if existing.local {
            return Err(AppError::Forbidden("Local objects are not updated remotely".to_string()));
        }

        let doc: Value = activity.object.to_value();
        let incoming = remote_object(&doc)?;
        let changed = ctx
            .store
            .update_object(object_id, incoming.content.as_deref(), &incoming.data)
            .await?;

        tracing::info!(object = %object_id, changed, "Object updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DomainStore;
    use crate::test_support::{self, RAT, TEST_KEYS, activity};
    use serde_json::json;

    fn rat_profile(name: &str) -> Value {
        json!({
            "id": RAT,
            "type": "Person",
            "preferredUsername": "rat",
            "name": name,
            "inbox": format!("{RAT}/inbox"),
            "publicKey": {"id": format!("{RAT}#main-key"), "owner": RAT, "publicKeyPem": TEST_KEYS.1}
        })
    }

    #[tokio::test]
    async fn actor_updates_own_profile() {
        let fx = test_support::fixture().await;

        let update = activity(json!({
            "id": "https://b.example/update/1",
            "type": "Update",
            "actor": RAT,
            "object": rat_profile("Ratty")
        }));
        UpdateActorHandler.handle(&fx.ctx, &update, &fx.rat).await.unwrap();

        let stored = fx.store.get_actor(RAT).await.unwrap().unwrap();
        assert_eq!(stored.display_name.as_deref(), Some("Ratty"));
        assert!(!stored.local);
    }

    #[tokio::test]
    async fn actor_cannot_update_another() {
        let fx = test_support::fixture().await;
        let vole = test_support::remote_actor("https://b.example/users/vole");

        let update = activity(json!({
            "id": "https://b.example/update/1",
            "type": "Update",
            "actor": vole.id,
            "object": rat_profile("Impostor")
        }));
        let err = UpdateActorHandler.handle(&fx.ctx, &update, &vole).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn update_of_unknown_object_is_dropped() {
        let fx = test_support::fixture().await;

        let update = activity(json!({
            "id": "https://b.example/update/2",
            "type": "Update",
            "actor": RAT,
            "object": {"id": "https://b.example/status/404", "type": "Note", "attributedTo": RAT, "content": "x"}
        }));
        UpdateObjectHandler.handle(&fx.ctx, &update, &fx.rat).await.unwrap();

        assert!(fx
            .store
            .get_object("https://b.example/status/404")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn author_edits_status() {
        let fx = test_support::fixture().await;
        let original = json!({"id": "https://b.example/status/1", "type": "Note", "attributedTo": RAT, "content": "v1"});
        fx.store
            .insert_object(&remote_object(&original).unwrap())
            .await
            .unwrap();

        let update = activity(json!({
            "id": "https://b.example/update/3",
            "type": "Update",
            "actor": RAT,
            "object": {"id": "https://b.example/status/1", "type": "Note", "attributedTo": RAT, "content": "v2"}
        }));
        UpdateObjectHandler.handle(&fx.ctx, &update, &fx.rat).await.unwrap();

        let stored = fx
            .store
            .get_object("https://b.example/status/1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.content.as_deref(), Some("v2"));
    }
}
