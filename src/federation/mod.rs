//! ActivityPub federation module
//!
//! Handles:
//! - Activity parsing and dispatch (inbox)
//! - Relationship state machine
//! - Activity delivery (outbox) and the delivery queue
//! - HTTP Signatures
//! - WebFinger
//! - Actor fetching

mod activity;
mod delivery;
mod dispatcher;
mod handlers;
mod inbox;
mod queue;
pub mod relationship;
mod resolver;
pub mod signature;
mod webfinger;

pub use activity::{Activity, ActivityType, ObjectRef};
pub use delivery::{
    ActivityDelivery, Audience, Broadcaster, PUBLIC_COLLECTION, builder, compute_destinations,
    new_activity_id,
};
pub use dispatcher::{ActivityHandler, DispatchOutcome, Dispatcher, FederationContext};
pub use inbox::InboxProcessor;
pub use queue::{DeliveryQueue, JobOutcome, backoff_delay};
pub use resolver::{ActorResolver, build_local_actor, parse_actor, validate_remote_url};
pub use signature::{SignedRequest, generate_keypair, sign_request, verify_signature};
pub use webfinger::{
    WebFingerResponse, generate_webfinger_response, parse_handle, resolve_webfinger,
};
