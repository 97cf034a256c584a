use async_trait::async_trait;
use serde_json::json;

use super::notify_local;
use crate::data::{Actor, NotificationType};
use crate::error::AppError;
use crate::federation::activity::Activity;
use crate::federation::dispatcher::{ActivityHandler, FederationContext};
use crate::federation::relationship::{FollowTransition, request_follow};

/// Follow of a local actor
///
/// Auto-accepting targets get an edge, an Accept back to the follower and a
/// FOLLOW notification; manually approving targets get a FOLLOW_REQUEST
/// notification. A Follow from an existing follower only re-sends the
/// Accept.
pub struct FollowHandler;

#[async_trait]
impl ActivityHandler for FollowHandler {
    async fn handle(
        &self,
        ctx: &FederationContext,
        activity: &Activity,
        signer: &Actor,
    ) -> Result<(), AppError> {
        let target_uri = activity
            .object
            .id()
            .ok_or_else(|| AppError::Validation("Follow without object".to_string()))?;

        let target = ctx
            .store
            .get_actor(target_uri)
            .await?
            .filter(|actor| actor.local)
            .ok_or_else(|| AppError::NotFound(format!("No local actor {}", target_uri)))?;

        if !target.is_active {
            return Err(AppError::Forbidden(format!("{} is deactivated", target.id)));
        }

        let transition = request_follow(
            ctx.store.as_ref(),
            &signer.id,
            &target.id,
            &activity.id,
            !target.manually_approves_followers,
        )
        .await?;

        tracing::info!(
            follower = %signer.id,
            followee = %target.id,
            ?transition,
            "Follow received"
        );

        match transition {
            FollowTransition::Accepted => {
                notify_local(ctx, &target.id, NotificationType::Follow, signer, None).await?;
            }
            FollowTransition::Requested => {
                notify_local(ctx, &target.id, NotificationType::FollowRequest, signer, None)
                    .await?;
            }
            FollowTransition::AlreadyAccepted | FollowTransition::AlreadyRequested => {}
        }

        if transition.needs_accept() {
            let follow = json!({
                "id": activity.id,
                "type": "Follow",
                "actor": signer.id,
                "object": target.id,
            });
            ctx.broadcaster.send_accept(&target, signer, follow).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DomainStore, RelationshipState};
    use crate::test_support::{self, RAT, activity};

    fn follow(id: &str, object: &str) -> Activity {
        activity(json!({
            "id": id,
            "type": "Follow",
            "actor": RAT,
            "object": object
        }))
    }

    #[tokio::test]
    async fn auto_accept_creates_edge_accept_and_notification() {
        let fx = test_support::fixture().await;

        FollowHandler
            .handle(&fx.ctx, &follow("https://b.example/f1", &fx.mouse.id), &fx.rat)
            .await
            .unwrap();

        let rel = fx.store.get_relationship(RAT, &fx.mouse.id).await.unwrap().unwrap();
        assert_eq!(rel.state, RelationshipState::Accepted);

        let jobs = fx.store.get_pending_deliveries().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].inbox, fx.rat.delivery_inbox());
        let accept: serde_json::Value = serde_json::from_str(&jobs[0].activity).unwrap();
        assert_eq!(accept["type"], "Accept");
        assert_eq!(accept["object"]["id"], "https://b.example/f1");

        let notifications = fx.store.get_notifications(&fx.mouse.id).await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, "FOLLOW");
    }

    #[tokio::test]
    async fn manual_approval_only_requests() {
        let fx = test_support::fixture_with(test_support::federation_config(), true).await;

        FollowHandler
            .handle(&fx.ctx, &follow("https://b.example/f1", &fx.mouse.id), &fx.rat)
            .await
            .unwrap();

        let rel = fx.store.get_relationship(RAT, &fx.mouse.id).await.unwrap().unwrap();
        assert_eq!(rel.state, RelationshipState::Requested);
        assert!(fx.store.get_pending_deliveries().await.unwrap().is_empty());

        let notifications = fx.store.get_notifications(&fx.mouse.id).await.unwrap();
        assert_eq!(notifications[0].kind, "FOLLOW_REQUEST");
    }

    #[tokio::test]
    async fn refollow_resends_accept_without_notification() {
        let fx = test_support::fixture().await;

        for id in ["https://b.example/f1", "https://b.example/f2"] {
            FollowHandler
                .handle(&fx.ctx, &follow(id, &fx.mouse.id), &fx.rat)
                .await
                .unwrap();
        }

        assert_eq!(fx.store.get_pending_deliveries().await.unwrap().len(), 2);
        assert_eq!(fx.store.get_notifications(&fx.mouse.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_or_remote_target_is_not_found() {
        let fx = test_support::fixture().await;

        for target in ["https://a.example/user/nobody", RAT] {
            let err = FollowHandler
                .handle(&fx.ctx, &follow("https://b.example/f1", target), &fx.rat)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::NotFound(_)));
        }
    }

    #[tokio::test]
    async fn blocked_follow_is_forbidden() {
        let fx = test_support::fixture().await;
        fx.store
            .block_and_sever(&fx.mouse.id, RAT, "https://a.example/b1")
            .await
            .unwrap();

        let err = FollowHandler
            .handle(&fx.ctx, &follow("https://b.example/f1", &fx.mouse.id), &fx.rat)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert!(fx.store.get_notifications(&fx.mouse.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn redelivery_completes_interrupted_auto_accept() {
        let fx = test_support::fixture().await;
        fx.store
            .insert_follow_request(RAT, &fx.mouse.id, "https://b.example/f1")
            .await
            .unwrap();

        FollowHandler
            .handle(&fx.ctx, &follow("https://b.example/f1", &fx.mouse.id), &fx.rat)
            .await
            .unwrap();

        let rel = fx.store.get_relationship(RAT, &fx.mouse.id).await.unwrap().unwrap();
        assert_eq!(rel.state, RelationshipState::Accepted);

        let jobs = fx.store.get_pending_deliveries().await.unwrap();
        assert_eq!(jobs.len(), 1);
        let accept: serde_json::Value = serde_json::from_str(&jobs[0].activity).unwrap();
        assert_eq!(accept["type"], "Accept");
    }
}
