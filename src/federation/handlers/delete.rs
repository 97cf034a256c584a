use async_trait::async_trait;

use crate::data::Actor;
use crate::error::AppError;
use crate::federation::activity::{Activity, delete_target_uri, strip_fragment};
use crate::federation::dispatcher::{ActivityHandler, FederationContext};

/// Delete of an object or of the signer's own account
///
/// Objects are tombstoned, never removed, so replies keep resolving.
/// Notifications whose only referent is the object go with it. Deleting
/// an account deactivates the actor record.
pub struct DeleteHandler;

#[async_trait]
impl ActivityHandler for DeleteHandler {
    async fn handle(
        &self,
        ctx: &FederationContext,
        activity: &Activity,
        signer: &Actor,
    ) -> Result<(), AppError> {
        let target = delete_target_uri(&activity.object)
            .ok_or_else(|| AppError::Validation("Delete without object id".to_string()))?;

        if strip_fragment(&target) == strip_fragment(&signer.id) {
            let deactivated = ctx.store.deactivate_actor(&signer.id).await?;
            tracing::info!(actor = %signer.id, deactivated, "Remote account deleted");
            return Ok(());
        }

        let Some(object) = ctx.store.get_object(&target).await? else {
            tracing::debug!(object = %target, "Delete of unknown object");
            return Ok(());
        };

        if let Some(author) = &object.attributed_to {
            if strip_fragment(author) != strip_fragment(&signer.id) {
                return Err(AppError::Forbidden(format!(
                    "{} cannot delete {}",
                    signer.id, target
                )));
            }
        }

        let tombstoned = ctx.store.tombstone_object(&target).await?;
        let removed = ctx.store.delete_notifications_for_object(&target).await?;

        tracing::info!(
            object = %target,
            tombstoned,
            notifications_removed = removed,
            "Object deleted"
        );
        Ok(())
    }
}
