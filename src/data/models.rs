//! Data models
//!
//! Rust structs representing the records the federation layer reads and
//! writes. Ids of records created here are ULIDs; federated records are keyed
//! by their ActivityPub URI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Actor
// =============================================================================

/// A local or remote federated identity
///
/// Remote actors are created lazily the first time they are referenced.
/// `private_key_pem` is only ever set for local actors and is skipped when
/// serializing.
#[derive(Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    /// ActivityPub URI (primary key)
    pub id: String,
    pub username: String,
    /// Host part of the actor URI
    pub domain: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub public_key_pem: String,
    #[serde(skip_serializing)]
    pub private_key_pem: Option<String>,
    pub local: bool,
    pub manually_approves_followers: bool,
    /// False once the account is deleted or deactivated
    pub is_active: bool,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Actor {
    /// Inbox deliveries should go to: the shared inbox when advertised
    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox.as_deref().unwrap_or(&self.inbox)
    }

    /// keyId advertised for this actor's public key
    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.id)
    }
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("id", &self.id)
            .field("inbox", &self.inbox)
            .field("shared_inbox", &self.shared_inbox)
            .field("local", &self.local)
            .field("is_active", &self.is_active)
            .field("manually_approves_followers", &self.manually_approves_followers)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Relationship / Block
// =============================================================================

/// State of a follow edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipState {
    Requested,
    Accepted,
}

impl RelationshipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Accepted => "accepted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(Self::Requested),
            "accepted" => Some(Self::Accepted),
            _ => None,
        }
    }
}

/// Follow edge from `subject` (follower) to `object` (followee)
///
/// At most one row exists per ordered pair, so `requested` and `accepted`
/// are mutually exclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub subject: String,
    pub object: String,
    pub state: RelationshipState,
    /// Id of the Follow activity that created the row
    pub activity_id: String,
    pub created_at: DateTime<Utc>,
}

/// `subject` blocks `object`
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Block {
    pub subject: String,
    pub object: String,
    pub activity_id: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Referenced objects
// =============================================================================

/// Any non-actor object an activity can point at: statuses, reviews,
/// books, shelves, lists
///
/// Deletion sets `deleted`/`deleted_at` and keeps the row so replies and
/// other dependents stay resolvable.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredObject {
    pub id: String,
    pub object_type: String,
    pub attributed_to: Option<String>,
    pub content: Option<String>,
    pub in_reply_to: Option<String>,
    /// Full JSON document as last received
    pub data: String,
    pub local: bool,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Notification
// =============================================================================

/// Notification for a local actor
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: String,
    /// Local actor receiving the notification
    pub recipient: String,
    /// One of `NotificationType::as_str`
    pub kind: String,
    pub related_actor: Option<String>,
    pub related_object: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Notification type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationType {
    Follow,
    FollowRequest,
    Reply,
    Mention,
    Favorite,
    Boost,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "FOLLOW",
            Self::FollowRequest => "FOLLOW_REQUEST",
            Self::Reply => "REPLY",
            Self::Mention => "MENTION",
            Self::Favorite => "FAVORITE",
            Self::Boost => "BOOST",
        }
    }
}

// =============================================================================
// Join records
// =============================================================================

/// Favorite or boost of an object by an actor
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Interaction {
    /// Id of the Like/Announce activity
    pub activity_id: String,
    pub actor: String,
    pub object: String,
    pub created_at: DateTime<Utc>,
}

/// Which interaction table a Like or Announce lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Favorite,
    Boost,
}

impl InteractionKind {
    pub(crate) fn table(&self) -> &'static str {
        match self {
            Self::Favorite => "favorites",
            Self::Boost => "boosts",
        }
    }

    pub fn notification(&self) -> NotificationType {
        match self {
            Self::Favorite => NotificationType::Favorite,
            Self::Boost => NotificationType::Boost,
        }
    }
}

/// Item on a shelf or list
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CollectionItem {
    /// Id of the item record (or the Add activity when the item has none)
    pub id: String,
    pub collection: String,
    pub item: String,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

/// Moderation report created by a Flag
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Report {
    /// Id of the Flag activity
    pub id: String,
    pub reporter: String,
    pub reported_actor: Option<String>,
    /// JSON array of reported object URIs
    pub objects: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Delivery
// =============================================================================

/// One activity bound for one inbox
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryJob {
    pub id: String,
    /// Local actor that signs the request
    pub sender: String,
    pub inbox: String,
    /// Serialized activity JSON
    pub activity: String,
    pub attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryJob {
    pub fn new(sender: &str, inbox: &str, activity: &serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new().0,
            sender: sender.to_string(),
            inbox: inbox.to_string(),
            activity: activity.to_string(),
            attempts: 0,
            next_attempt_at: now,
            created_at: now,
        }
    }
}
