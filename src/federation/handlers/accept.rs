use async_trait::async_trait;

use crate::data::{Actor, RelationshipState};
use crate::error::AppError;
use crate::federation::activity::{Activity, strip_fragment};
use crate::federation::dispatcher::{ActivityHandler, FederationContext};
use crate::federation::relationship::{accept_follow, reject_follow};

/// Accept or Reject of a Follow a local actor sent
///
/// The Follow is located by its id first, then by the embedded
/// `actor`/`object` pair. Only the followee may answer, and only a pending
/// request is changed: an Accept for an edge that already exists or a
/// request that was withdrawn is a no-op.
pub struct AcceptHandler {
    /// `false` for Reject
    pub accept: bool,
}

#[async_trait]
impl ActivityHandler for AcceptHandler {
    async fn handle(
        &self,
        ctx: &FederationContext,
        activity: &Activity,
        signer: &Actor,
    ) -> Result<(), AppError> {
        if let Some(object_type) = activity.object.object_type() {
            if object_type != "Follow" {
                return Err(AppError::UnsupportedObject(format!(
                    "{} of {}",
                    activity.kind, object_type
                )));
            }
        }

        let by_id = match activity.object.id() {
            Some(follow_id) => ctx.store.find_relationship_by_activity(follow_id).await?,
            None => None,
        };

        let (follower, followee) = match by_id {
            Some(rel) => (rel.subject, rel.object),
            None => match (
                activity.object.str_field("actor"),
                activity.object.str_field("object"),
            ) {
                (Some(follower), Some(followee)) => (follower.to_string(), followee.to_string()),
                _ => {
                    tracing::debug!(activity = %activity.id, "No matching follow request");
                    return Ok(());
                }
            },
        };

        if strip_fragment(&followee) != strip_fragment(&signer.id) {
            return Err(AppError::Forbidden(format!(
                "{} cannot answer a follow of {}",
                signer.id, followee
            )));
        }

        let changed = if self.accept {
            accept_follow(ctx.store.as_ref(), &follower, &signer.id).await?
        } else {
            let removed = reject_follow(ctx.store.as_ref(), &follower, &signer.id).await?;
            // A Reject after acceptance removes the edge as well
            removed
                || ctx
                    .store
                    .delete_relationship(&follower, &signer.id, Some(RelationshipState::Accepted))
                    .await?
        };

        tracing::info!(
            follower = %follower,
            followee = %signer.id,
            accepted = self.accept,
            changed,
            "Follow answered"
        );
        Ok(())
    }
}
