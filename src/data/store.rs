//! Domain store interface
//!
//! Handlers, the resolver and the broadcaster only talk to storage through
//! [`DomainStore`]. Every mutation that concurrent inbound requests can race
//! on is a single conditional write that reports whether it changed anything.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::*;
use crate::error::AppError;

#[async_trait]
pub trait DomainStore: Send + Sync {
    // Actors

    async fn get_actor(&self, id: &str) -> Result<Option<Actor>, AppError>;

    async fn get_local_actor_by_username(&self, username: &str)
    -> Result<Option<Actor>, AppError>;

    /// Insert, or overwrite the mutable fields of an existing actor
    async fn upsert_actor(&self, actor: &Actor) -> Result<(), AppError>;

    /// Mark an actor inactive. Returns `true` if it was active.
    async fn deactivate_actor(&self, id: &str) -> Result<bool, AppError>;

    /// Actors with an accepted relationship to `actor_id`
    async fn get_followers(&self, actor_id: &str) -> Result<Vec<Actor>, AppError>;

    // Relationships

    async fn get_relationship(
        &self,
        subject: &str,
        object: &str,
    ) -> Result<Option<Relationship>, AppError>;

    async fn find_relationship_by_activity(
        &self,
        activity_id: &str,
    ) -> Result<Option<Relationship>, AppError>;

    /// Create a `requested` row unless any row exists for the pair
    async fn insert_follow_request(
        &self,
        subject: &str,
        object: &str,
        activity_id: &str,
    ) -> Result<bool, AppError>;

    /// Flip `requested` to `accepted`. Returns `false` when no request existed.
    async fn accept_follow_request(&self, subject: &str, object: &str) -> Result<bool, AppError>;

    /// Delete the row for the pair, optionally only when it is in `state`
    async fn delete_relationship(
        &self,
        subject: &str,
        object: &str,
        state: Option<RelationshipState>,
    ) -> Result<bool, AppError>;

    // Blocks

    /// Create the block and delete relationships in both directions in one
    /// transaction. Returns `true` if the block is new.
    async fn block_and_sever(
        &self,
        subject: &str,
        object: &str,
        activity_id: &str,
    ) -> Result<bool, AppError>;

    async fn delete_block_by_activity(
        &self,
        subject: &str,
        activity_id: &str,
    ) -> Result<bool, AppError>;

    async fn delete_block(&self, subject: &str, object: &str) -> Result<bool, AppError>;

    async fn get_block(&self, subject: &str, object: &str) -> Result<Option<Block>, AppError>;

    /// Whether either actor blocks the other
    async fn is_blocked_between(&self, a: &str, b: &str) -> Result<bool, AppError>;

    // Referenced objects

    async fn get_object(&self, id: &str) -> Result<Option<StoredObject>, AppError>;

    /// Insert unless an object with the same id exists
    async fn insert_object(&self, object: &StoredObject) -> Result<bool, AppError>;

    /// Overwrite mutable fields of a live object. Never inserts.
    async fn update_object(
        &self,
        id: &str,
        content: Option<&str>,
        data: &str,
    ) -> Result<bool, AppError>;

    /// Soft-delete. Returns `true` if the object was live.
    async fn tombstone_object(&self, id: &str) -> Result<bool, AppError>;

    // Notifications

    async fn create_notification(
        &self,
        recipient: &str,
        kind: NotificationType,
        related_actor: Option<&str>,
        related_object: Option<&str>,
    ) -> Result<(), AppError>;

    async fn get_notifications(&self, recipient: &str) -> Result<Vec<Notification>, AppError>;

    /// Remove notifications whose referent is `object_id`
    async fn delete_notifications_for_object(&self, object_id: &str) -> Result<u64, AppError>;

    // Favorites and boosts

    async fn insert_interaction(
        &self,
        kind: InteractionKind,
        interaction: &Interaction,
    ) -> Result<bool, AppError>;

    /// Delete the interaction created by `activity_id`, only if owned by `actor`
    async fn delete_interaction_by_activity(
        &self,
        kind: InteractionKind,
        actor: &str,
        activity_id: &str,
    ) -> Result<bool, AppError>;

    async fn get_interactions(
        &self,
        kind: InteractionKind,
        object: &str,
    ) -> Result<Vec<Interaction>, AppError>;

    // Shelves and lists

    async fn insert_collection_item(&self, item: &CollectionItem) -> Result<bool, AppError>;

    /// Remove membership by record id or by (collection, item), owned by `actor`
    async fn delete_collection_item(
        &self,
        actor: &str,
        collection: &str,
        item_or_id: &str,
    ) -> Result<bool, AppError>;

    async fn get_collection_items(&self, collection: &str)
    -> Result<Vec<CollectionItem>, AppError>;

    // Moderation

    async fn insert_report(&self, report: &Report) -> Result<bool, AppError>;

    async fn get_report(&self, id: &str) -> Result<Option<Report>, AppError>;

    async fn is_server_blocked(&self, domain: &str) -> Result<bool, AppError>;

    async fn block_server(&self, domain: &str) -> Result<(), AppError>;

    // Idempotency ledger

    /// Atomically claim `key`. Returns `false` when it was already claimed.
    async fn claim_activity(&self, key: &str) -> Result<bool, AppError>;

    /// Forget a claim so a failed activity can be retried by its sender
    async fn release_activity(&self, key: &str) -> Result<(), AppError>;

    async fn is_activity_processed(&self, key: &str) -> Result<bool, AppError>;

    // Delivery queue

    async fn enqueue_delivery(&self, job: &DeliveryJob) -> Result<(), AppError>;

    /// Lease up to `limit` jobs due at `now` until `lease_until`
    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeliveryJob>, AppError>;

    async fn complete_delivery(&self, id: &str) -> Result<(), AppError>;

    async fn reschedule_delivery(
        &self,
        id: &str,
        attempts: i64,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    async fn get_pending_deliveries(&self) -> Result<Vec<DeliveryJob>, AppError>;

    async fn count_pending_deliveries(&self) -> Result<i64, AppError>;

    // Instance statistics

    /// Active local actors
    async fn count_local_actors(&self) -> Result<i64, AppError>;

    /// Local objects that are not tombstoned
    async fn count_local_objects(&self) -> Result<i64, AppError>;
}
