//! Activity delivery
//!
//! [`Broadcaster`] turns "this local actor sends this activity to this
//! audience" into one persisted [`DeliveryJob`] per destination inbox.
//! [`ActivityDelivery`] performs a single signed POST and classifies the
//! outcome; the queue decides what to do with failures.

use std::collections::HashSet;
use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::Value;

use super::queue::DeliveryQueue;
use super::resolver::{ActorResolver, validate_remote_url};
use super::signature::sign_request;
use crate::config::FederationConfig;
use crate::data::{Actor, DeliveryJob, DomainStore, EntityId};
use crate::error::AppError;

/// The public addressing collection
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Who an outbound activity is addressed to, besides explicit recipients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Followers, addressed to the public collection
    Public,
    /// Followers only
    Followers,
    /// Explicit recipients only
    Direct,
}

impl Audience {
    /// `to` and `cc` for an activity from `actor_uri`
    pub fn addressing(&self, actor_uri: &str, direct: &[String]) -> (Vec<String>, Vec<String>) {
        let followers = format!("{}/followers", actor_uri);
        match self {
            Self::Public => (vec![PUBLIC_COLLECTION.to_string()], {
                let mut cc = vec![followers];
                cc.extend(direct.iter().cloned());
                cc
            }),
            Self::Followers => (vec![followers], direct.to_vec()),
            Self::Direct => (direct.to_vec(), Vec::new()),
        }
    }

    fn includes_followers(&self) -> bool {
        !matches!(self, Self::Direct)
    }
}

/// Inboxes to deliver to for a set of recipients
///
/// Shared inboxes are preferred and each inbox appears once; local
/// recipients are skipped since they never need a network hop.
pub fn compute_destinations(recipients: &[Actor]) -> Vec<String> {
    let mut seen = HashSet::new();
    recipients
        .iter()
        .filter(|actor| !actor.local)
        .map(|actor| actor.delivery_inbox().to_string())
        .filter(|inbox| seen.insert(inbox.clone()))
        .collect()
}

/// Sends one signed activity to one inbox
#[derive(Clone)]
pub struct ActivityDelivery {
    http_client: Arc<reqwest::Client>,
    config: Arc<FederationConfig>,
}

impl ActivityDelivery {
    pub fn new(http_client: Arc<reqwest::Client>, config: Arc<FederationConfig>) -> Self {
        Self {
            http_client,
            config,
        }
    }

    /// Deliver `body` to `inbox_uri`, signed as `sender`
    ///
    /// # Errors
    /// - `Config` if the sender has no usable private key
    /// - `TransientDelivery` on network errors, timeouts, 408, 429 and 5xx
    /// - `PermanentDelivery` on any other non-2xx status or a refused URL
    pub async fn deliver(
        &self,
        sender: &Actor,
        inbox_uri: &str,
        body: &[u8],
    ) -> Result<(), AppError> {
        let private_key = sender.private_key_pem.as_deref().ok_or_else(|| {
            AppError::Config(format!("Local actor {} has no private key", sender.id))
        })?;

        let url = validate_remote_url(inbox_uri, self.config.allow_private_addresses)
            .await
            .map_err(|e| match e {
                AppError::Federation(msg) => AppError::TransientDelivery(msg),
                other => AppError::PermanentDelivery(other.to_string()),
            })?;

        let sig_headers = sign_request("POST", inbox_uri, Some(body), private_key, &sender.key_id())?;

        let mut request = self
            .http_client
            .post(url)
            .header("Content-Type", "application/activity+json")
            .header("User-Agent", &self.config.user_agent)
            .header("Date", sig_headers.date)
            .header("Signature", sig_headers.signature)
            .timeout(self.config.request_timeout());

        if let Some(digest) = sig_headers.digest {
            request = request.header("Digest", digest);
        }

        let response = request.body(body.to_vec()).send().await.map_err(|e| {
            AppError::TransientDelivery(format!("Failed to deliver to {}: {}", inbox_uri, e))
        })?;

        classify_status(inbox_uri, response.status())
    }
}

/// Map a remote inbox's response status to a delivery outcome
pub fn classify_status(inbox_uri: &str, status: StatusCode) -> Result<(), AppError> {
    if status.is_success() {
        return Ok(());
    }

    let message = format!("Inbox {} answered HTTP {}", inbox_uri, status);
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(AppError::TransientDelivery(message))
    } else {
        Err(AppError::PermanentDelivery(message))
    }
}

/// Fans an activity out to its audience through the delivery queue
pub struct Broadcaster {
    store: Arc<dyn DomainStore>,
    resolver: Arc<ActorResolver>,
    queue: Arc<DeliveryQueue>,
}

impl Broadcaster {
    pub fn new(
        store: Arc<dyn DomainStore>,
        resolver: Arc<ActorResolver>,
        queue: Arc<DeliveryQueue>,
    ) -> Self {
        Self {
            store,
            resolver,
            queue,
        }
    }

    /// Queue `activity` for every destination of `audience` plus `direct`
    ///
    /// `direct` entries may be actor URIs or `user@domain` handles; ones
    /// that cannot be resolved are skipped with a warning. Returns the
    /// number of inboxes queued.
    ///
    /// # Errors
    /// `Config` if `sender` has no private key. Nothing is queued then.
    pub async fn broadcast(
        &self,
        sender: &Actor,
        activity: &Value,
        audience: Audience,
        direct: &[String],
    ) -> Result<usize, AppError> {
        if !sender.local || sender.private_key_pem.is_none() {
            tracing::error!(
                sender = %sender.id,
                "Refusing to broadcast: sender has no private key (configuration error)"
            );
            return Err(AppError::Config(format!(
                "Local actor {} has no private key",
                sender.id
            )));
        }

        let mut recipients = Vec::new();
        if audience.includes_followers() {
            recipients.extend(self.store.get_followers(&sender.id).await?);
        }

        for reference in direct {
            match self.resolver.resolve_reference(reference).await {
                Ok(actor) => recipients.push(actor),
                Err(error) => {
                    tracing::warn!(recipient = %reference, %error, "Skipping unresolvable recipient");
                }
            }
        }

        let mut deliverable = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            if !recipient.is_active || recipient.id == sender.id {
                continue;
            }
            if self
                .store
                .is_blocked_between(&sender.id, &recipient.id)
                .await?
            {
                tracing::debug!(recipient = %recipient.id, "Not delivering across a block");
                continue;
            }
            deliverable.push(recipient);
        }

        let destinations = compute_destinations(&deliverable);
        for inbox in &destinations {
            self.queue
                .enqueue(DeliveryJob::new(&sender.id, inbox, activity))
                .await?;
        }

        let activity_type = activity
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("?");
        tracing::info!(
            sender = %sender.id,
            activity_type,
            inboxes = destinations.len(),
            "Queued activity for delivery"
        );

        Ok(destinations.len())
    }

    /// Queue `activity` for a single actor
    pub async fn send_to(
        &self,
        sender: &Actor,
        activity: &Value,
        recipient: &Actor,
    ) -> Result<usize, AppError> {
        self.broadcast(sender, activity, Audience::Direct, &[recipient.id.clone()])
            .await
    }

    /// Accept `follow` (the original Follow document or its id) on behalf
    /// of `local`
    pub async fn send_accept(
        &self,
        local: &Actor,
        follower: &Actor,
        follow: Value,
    ) -> Result<(), AppError> {
        let activity = builder::accept(&new_activity_id(&local.id, "accept"), &local.id, follow);
        self.send_to(local, &activity, follower).await?;
        Ok(())
    }

    /// Reject a pending request from `follower` and tell them
    pub async fn send_reject(
        &self,
        local: &Actor,
        follower: &Actor,
        follow: Value,
    ) -> Result<(), AppError> {
        super::relationship::reject_follow(self.store.as_ref(), &follower.id, &local.id).await?;

        let activity = builder::reject(&new_activity_id(&local.id, "reject"), &local.id, follow);
        self.send_to(local, &activity, follower).await?;
        Ok(())
    }

    /// Request to follow `target` as `local`
    ///
    /// Records the pending request so the remote Accept can complete it.
    /// Returns the Follow id.
    pub async fn send_follow(&self, local: &Actor, target: &Actor) -> Result<String, AppError> {
        let follow_id = new_activity_id(&local.id, "follow");
        super::relationship::request_follow(
            self.store.as_ref(),
            &local.id,
            &target.id,
            &follow_id,
            false,
        )
        .await?;

        let activity = builder::follow(&follow_id, &local.id, &target.id);
        self.send_to(local, &activity, target).await?;
        Ok(follow_id)
    }

    /// Withdraw the Follow `follow_id` from `local` to `target`
    pub async fn send_unfollow(
        &self,
        local: &Actor,
        target: &Actor,
        follow_id: &str,
    ) -> Result<(), AppError> {
        super::relationship::undo_follow(self.store.as_ref(), &local.id, follow_id, Some(&target.id))
            .await?;

        let activity = builder::undo(
            &new_activity_id(&local.id, "undo"),
            &local.id,
            builder::follow(follow_id, &local.id, &target.id),
        );
        self.send_to(local, &activity, target).await?;
        Ok(())
    }
}

/// New activity URI under a local actor, e.g. `{actor}/accept/{ulid}`
pub fn new_activity_id(actor_uri: &str, kind: &str) -> String {
    format!("{}/{}/{}", actor_uri, kind, EntityId::new().0)
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::{Value, json};

    const CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

    /// Build a Follow activity
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        json!({
            "@context": CONTEXT,
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Original activity being accepted (usually a Follow)
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        json!({
            "@context": CONTEXT,
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    pub fn reject(id: &str, actor: &str, object: Value) -> Value {
        json!({
            "@context": CONTEXT,
            "type": "Reject",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Create activity wrapping `object`
    pub fn create(id: &str, actor: &str, object: Value, to: &[String], cc: &[String]) -> Value {
        json!({
            "@context": CONTEXT,
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build an Undo activity
    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        json!({
            "@context": CONTEXT,
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }
}
