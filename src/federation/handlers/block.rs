use async_trait::async_trait;

use crate::data::Actor;
use crate::error::AppError;
use crate::federation::activity::Activity;
use crate::federation::dispatcher::{ActivityHandler, FederationContext};
use crate::federation::relationship;

/// Block from a remote actor
///
/// Records the block and severs follows in both directions in one
/// transaction. Deliveries across the block stop because the broadcaster
/// checks it per recipient.
pub struct BlockHandler;

#[async_trait]
impl ActivityHandler for BlockHandler {
    async fn handle(
        &self,
        ctx: &FederationContext,
        activity: &Activity,
        signer: &Actor,
    ) -> Result<(), AppError> {
        let target = activity
            .object
            .id()
            .ok_or_else(|| AppError::Validation("Block without object".to_string()))?;

        if target == signer.id {
            return Err(AppError::Validation("Actor cannot block itself".to_string()));
        }

        let created = relationship::block(ctx.store.as_ref(), &signer.id, target, &activity.id).await?;
        tracing::info!(blocker = %signer.id, blocked = %target, created, "Block received");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DomainStore;
    use crate::test_support::{self, RAT, activity};
    use serde_json::json;

    #[tokio::test]
    async fn block_severs_existing_follows() {
        let fx = test_support::fixture().await;
        fx.store
            .insert_follow_request(RAT, &fx.mouse.id, "f1")
            .await
            .unwrap();
        fx.store.accept_follow_request(RAT, &fx.mouse.id).await.unwrap();
        fx.store
            .insert_follow_request(&fx.mouse.id, RAT, "f2")
            .await
            .unwrap();

        let block = activity(json!({
            "id": "https://b.example/block/1",
            "type": "Block",
            "actor": RAT,
            "object": fx.mouse.id
        }));
        BlockHandler.handle(&fx.ctx, &block, &fx.rat).await.unwrap();
        // Redelivery under a new id is harmless
        BlockHandler.handle(&fx.ctx, &block, &fx.rat).await.unwrap();

        assert!(fx.store.get_relationship(RAT, &fx.mouse.id).await.unwrap().is_none());
        assert!(fx.store.get_relationship(&fx.mouse.id, RAT).await.unwrap().is_none());
        assert!(fx.store.get_block(RAT, &fx.mouse.id).await.unwrap().is_some());
    }
}
