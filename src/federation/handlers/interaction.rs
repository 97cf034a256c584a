use async_trait::async_trait;

use super::{notify_local, resolve_object};
use crate::data::{Actor, Interaction, InteractionKind};
use crate::error::AppError;
use crate::federation::activity::Activity;
use crate::federation::dispatcher::{ActivityHandler, FederationContext};

/// Like (favorite) or Announce (boost) of an object
///
/// Unknown remote objects are fetched first. When that fails the activity
/// is dropped without error. The owner of a local object is notified only
/// when the record is new.
pub struct InteractionHandler {
    pub kind: InteractionKind,
}

#[async_trait]
impl ActivityHandler for InteractionHandler {
    async fn handle(
        &self,
        ctx: &FederationContext,
        activity: &Activity,
        signer: &Actor,
    ) -> Result<(), AppError> {
        let Some(object) = resolve_object(ctx, &activity.object).await? else {
            tracing::debug!(
                activity = %activity.id,
                object = ?activity.object.id(),
                "Dropping interaction with unresolvable object"
            );
            return Ok(());
        };

        if object.deleted {
            return Ok(());
        }

        let inserted = ctx
            .store
            .insert_interaction(
                self.kind,
                &Interaction {
                    activity_id: activity.id.clone(),
                    actor: signer.id.clone(),
                    object: object.id.clone(),
                    created_at: chrono::Utc::now(),
                },
            )
            .await?;

        if inserted && object.local {
            if let Some(owner) = &object.attributed_to {
                notify_local(ctx, owner, self.kind.notification(), signer, Some(&object.id))
                    .await?;
            }
        }

        tracing::debug!(
            actor = %signer.id,
            object = %object.id,
            kind = ?self.kind,
            inserted,
            "Interaction recorded"
        );
        Ok(())
    }
}
