use async_trait::async_trait;

use crate::data::{Actor, InteractionKind};
use crate::error::AppError;
use crate::federation::activity::Activity;
use crate::federation::dispatcher::{ActivityHandler, FederationContext};
use crate::federation::relationship::{unblock, undo_follow};

/// Undo of a Follow, Like, Announce or Block
///
/// The record to remove is located by the original activity's id and must
/// belong to the signer. An Undo that matches nothing is a no-op: the
/// original may never have arrived, or may have been undone already.
pub struct UndoHandler;

#[async_trait]
impl ActivityHandler for UndoHandler {
    async fn handle(
        &self,
        ctx: &FederationContext,
        activity: &Activity,
        signer: &Actor,
    ) -> Result<(), AppError> {
        let original = activity
            .object
            .id()
            .ok_or_else(|| AppError::Validation("Undo without object id".to_string()))?;
        let inner_object = activity.object.str_field("object");
        let store = ctx.store.as_ref();

        let removed = match activity.object.object_type() {
            Some("Follow") => undo_follow(store, &signer.id, original, inner_object).await?,
            Some("Block") => unblock(store, &signer.id, original, inner_object).await?,
            Some("Like") => {
                store
                    .delete_interaction_by_activity(InteractionKind::Favorite, &signer.id, original)
                    .await?
            }
            Some("Announce") => {
                store
                    .delete_interaction_by_activity(InteractionKind::Boost, &signer.id, original)
                    .await?
            }
            Some(other) => {
                return Err(AppError::UnsupportedObject(format!("Undo of {}", other)));
            }
            // Bare URI: whichever record the id created
            None => {
                undo_follow(store, &signer.id, original, None).await?
                    || unblock(store, &signer.id, original, None).await?
                    || store
                        .delete_interaction_by_activity(
                            InteractionKind::Favorite,
                            &signer.id,
                            original,
                        )
                        .await?
                    || store
                        .delete_interaction_by_activity(InteractionKind::Boost, &signer.id, original)
                        .await?
            }
        };

        tracing::info!(
            actor = %signer.id,
            original = %original,
            removed,
            "Undo applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DomainStore, Interaction};
    use crate::test_support::{self, RAT, activity};
    use chrono::Utc;
    use serde_json::json;

    const STATUS: &str = "https://a.example/status/1";

    #[tokio::test]
    async fn undo_like_removes_favorite() {
        let fx = test_support::fixture().await;
        fx.store
            .insert_interaction(
                InteractionKind::Favorite,
                &Interaction {
                    activity_id: "https://b.example/like/1".to_string(),
                    actor: RAT.to_string(),
                    object: STATUS.to_string(),
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let undo = activity(json!({
            "id": "https://b.example/undo/1",
            "type": "Undo",
            "actor": RAT,
            "object": {"id": "https://b.example/like/1", "type": "Like", "actor": RAT, "object": STATUS}
        }));
        UndoHandler.handle(&fx.ctx, &undo, &fx.rat).await.unwrap();

        assert!(fx
            .store
            .get_interactions(InteractionKind::Favorite, STATUS)
            .await
            .unwrap()
            .is_empty());

        // Nothing left to undo
        UndoHandler.handle(&fx.ctx, &undo, &fx.rat).await.unwrap();
    }

    #[tokio::test]
    async fn undo_follow_by_uri_removes_request() {
        let fx = test_support::fixture().await;
        fx.store
            .insert_follow_request(RAT, &fx.mouse.id, "https://b.example/f1")
            .await
            .unwrap();

        let undo = activity(json!({
            "id": "https://b.example/undo/1",
            "type": "Undo",
            "actor": RAT,
            "object": "https://b.example/f1"
        }));
        UndoHandler.handle(&fx.ctx, &undo, &fx.rat).await.unwrap();

        assert!(fx.store.get_relationship(RAT, &fx.mouse.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn undo_block_lifts_block() {
        let fx = test_support::fixture().await;
        fx.store
            .block_and_sever(RAT, &fx.mouse.id, "https://b.example/b1")
            .await
            .unwrap();

        let undo = activity(json!({
            "id": "https://b.example/undo/2",
            "type": "Undo",
            "actor": RAT,
            "object": {"id": "https://b.example/b1", "type": "Block", "object": fx.mouse.id}
        }));
        UndoHandler.handle(&fx.ctx, &undo, &fx.rat).await.unwrap();

        assert!(!fx.store.is_blocked_between(RAT, &fx.mouse.id).await.unwrap());
    }

    #[tokio::test]
    async fn cannot_undo_someone_elses_follow() {
        let fx = test_support::fixture().await;
        fx.store
            .insert_follow_request(RAT, &fx.mouse.id, "https://b.example/f1")
            .await
            .unwrap();
        let vole = test_support::remote_actor("https://b.example/users/vole");

        let undo = activity(json!({
            "id": "https://b.example/undo/3",
            "type": "Undo",
            "actor": vole.id,
            "object": {"id": "https://b.example/f1", "type": "Follow"}
        }));
        UndoHandler.handle(&fx.ctx, &undo, &vole).await.unwrap();

        assert!(fx.store.get_relationship(RAT, &fx.mouse.id).await.unwrap().is_some());
    }
}
