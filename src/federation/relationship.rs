//! Follow and block state machine
//!
//! ```text
//!   (none) --Follow--> requested --Accept--> accepted
//!      ^                  |                     |
//!      +---Reject/Undo----+-------Undo----------+
//!
//!   Block(a, b): deletes a->b and b->a in any state, then no Follow
//!   between a and b is admitted until the block is undone.
//! ```
//!
//! Every transition is a single conditional write, so two deliveries of the
//! same Follow racing each other leave exactly one row.

use crate::data::{DomainStore, RelationshipState};
use crate::error::AppError;

/// Result of admitting a Follow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowTransition {
    /// New request waiting for manual approval
    Requested,
    /// New request accepted immediately
    Accepted,
    /// A request for the pair was already pending
    AlreadyRequested,
    /// The pair already has an accepted edge
    AlreadyAccepted,
}

impl FollowTransition {
    /// Whether this transition created state
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Requested | Self::Accepted)
    }

    /// Whether the follower should be sent an Accept
    pub fn needs_accept(&self) -> bool {
        matches!(self, Self::Accepted | Self::AlreadyAccepted)
    }
}

/// Record a Follow from `follower` to `followee`
///
/// `auto_accept` is the followee's "does not manually approve followers"
/// setting.
///
/// # Errors
/// `Forbidden` when either actor blocks the other.
pub async fn request_follow(
    store: &dyn DomainStore,
    follower: &str,
    followee: &str,
    activity_id: &str,
    auto_accept: bool,
) -> Result<FollowTransition, AppError> {
    if store.is_blocked_between(follower, followee).await? {
        return Err(AppError::Forbidden(format!(
            "{} and {} block each other",
            follower, followee
        )));
    }

    if !store
        .insert_follow_request(follower, followee, activity_id)
        .await?
    {
        let existing = store.get_relationship(follower, followee).await?;
        if let Some(RelationshipState::Accepted) = existing.map(|rel| rel.state) {
            return Ok(FollowTransition::AlreadyAccepted);
        }

        // A request left pending by an earlier, interrupted attempt is
        // promoted now that the followee accepts automatically
        if auto_accept && store.accept_follow_request(follower, followee).await? {
            return Ok(FollowTransition::Accepted);
        }

        // A concurrent Undo may have removed the row in between
        return Ok(FollowTransition::AlreadyRequested);
    }

    if auto_accept && store.accept_follow_request(follower, followee).await? {
        return Ok(FollowTransition::Accepted);
    }

    Ok(FollowTransition::Requested)
}

/// Turn a pending request into an edge. `false` if nothing was pending.
pub async fn accept_follow(
    store: &dyn DomainStore,
    follower: &str,
    followee: &str,
) -> Result<bool, AppError> {
    store.accept_follow_request(follower, followee).await
}

/// Drop a pending request without creating an edge
pub async fn reject_follow(
    store: &dyn DomainStore,
    follower: &str,
    followee: &str,
) -> Result<bool, AppError> {
    store
        .delete_relationship(follower, followee, Some(RelationshipState::Requested))
        .await
}

/// Undo the Follow `activity_id`, whichever state it reached
///
/// Only the follower who sent the Follow can undo it. Falls back to the
/// pair when the row was created by a different Follow id.
pub async fn undo_follow(
    store: &dyn DomainStore,
    follower: &str,
    activity_id: &str,
    followee: Option<&str>,
) -> Result<bool, AppError> {
    if let Some(rel) = store.find_relationship_by_activity(activity_id).await? {
        if rel.subject != follower {
            return Ok(false);
        }
        return store
            .delete_relationship(&rel.subject, &rel.object, None)
            .await;
    }

    match followee {
        Some(followee) => store.delete_relationship(follower, followee, None).await,
        None => Ok(false),
    }
}

/// Record `blocker` blocking `blocked` and sever both directions
pub async fn block(
    store: &dyn DomainStore,
    blocker: &str,
    blocked: &str,
    activity_id: &str,
) -> Result<bool, AppError> {
    store.block_and_sever(blocker, blocked, activity_id).await
}

/// Lift the block created by `activity_id`, only if `blocker` owns it
pub async fn unblock(
    store: &dyn DomainStore,
    blocker: &str,
    activity_id: &str,
    blocked: Option<&str>,
) -> Result<bool, AppError> {
    if store.delete_block_by_activity(blocker, activity_id).await? {
        return Ok(true);
    }

    match blocked {
        Some(blocked) => store.delete_block(blocker, blocked).await,
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RAT, test_store};

    const MOUSE: &str = "https://a.example/user/mouse";

    #[tokio::test]
    async fn auto_accept_creates_edge_once() {
        let (store, _dir) = test_store().await;

        let first = request_follow(store.as_ref(), RAT, MOUSE, "f1", true)
            .await
            .unwrap();
        assert_eq!(first, FollowTransition::Accepted);
        assert!(first.needs_accept());

        let again = request_follow(store.as_ref(), RAT, MOUSE, "f1", true)
            .await
            .unwrap();
        assert_eq!(again, FollowTransition::AlreadyAccepted);
        assert!(!again.is_new());
    }

    #[tokio::test]
    async fn pending_request_is_promoted_on_redelivery() {
        let (store, _dir) = test_store().await;
        assert!(store.insert_follow_request(RAT, MOUSE, "f1").await.unwrap());

        let transition = request_follow(store.as_ref(), RAT, MOUSE, "f1", true)
            .await
            .unwrap();
        assert_eq!(transition, FollowTransition::Accepted);
        assert!(transition.needs_accept());

        let rel = store.get_relationship(RAT, MOUSE).await.unwrap().unwrap();
        assert_eq!(rel.state, RelationshipState::Accepted);

        // Still pending for a manually approving followee
        assert!(store.insert_follow_request(MOUSE, RAT, "f2").await.unwrap());
        let transition = request_follow(store.as_ref(), MOUSE, RAT, "f2", false)
            .await
            .unwrap();
        assert_eq!(transition, FollowTransition::AlreadyRequested);
    }

    #[tokio::test]
    async fn manual_approval_waits_for_accept() {
        let (store, _dir) = test_store().await;

        let transition = request_follow(store.as_ref(), RAT, MOUSE, "f1", false)
            .await
            .unwrap();
        assert_eq!(transition, FollowTransition::Requested);
        assert!(!transition.needs_accept());

        assert!(accept_follow(store.as_ref(), RAT, MOUSE).await.unwrap());
        assert!(!accept_follow(store.as_ref(), RAT, MOUSE).await.unwrap());
        // Reject only removes pending requests
        assert!(!reject_follow(store.as_ref(), RAT, MOUSE).await.unwrap());
    }

    #[tokio::test]
    async fn undo_follow_is_scoped_to_follower() {
        let (store, _dir) = test_store().await;
        request_follow(store.as_ref(), RAT, MOUSE, "f1", false)
            .await
            .unwrap();

        assert!(!undo_follow(store.as_ref(), MOUSE, "f1", None).await.unwrap());
        assert!(undo_follow(store.as_ref(), RAT, "f1", None).await.unwrap());
        assert!(!undo_follow(store.as_ref(), RAT, "f1", Some(MOUSE)).await.unwrap());
    }

    #[tokio::test]
    async fn block_prevents_follow() {
        let (store, _dir) = test_store().await;
        request_follow(store.as_ref(), RAT, MOUSE, "f1", true)
            .await
            .unwrap();

        assert!(block(store.as_ref(), MOUSE, RAT, "b1").await.unwrap());
        assert!(store.get_relationship(RAT, MOUSE).await.unwrap().is_none());

        let err = request_follow(store.as_ref(), RAT, MOUSE, "f2", true)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        assert!(unblock(store.as_ref(), MOUSE, "b1", None).await.unwrap());
        assert!(request_follow(store.as_ref(), RAT, MOUSE, "f2", true)
            .await
            .is_ok());
    }
}
