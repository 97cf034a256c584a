//! Inbound activity processing
//!
//! Both the shared inbox and the per-actor inboxes end up here. The order
//! of checks matters: cheap rejections (unknown inbox, bad JSON, unknown
//! verb, blocked server) come before anything that fetches remote keys.

use std::sync::Arc;

use serde_json::Value;

use super::activity::{Activity, ActivityType, strip_fragment, uri_host};
use super::dispatcher::{DispatchOutcome, Dispatcher};
use super::signature::{SignedRequest, extract_signature_key_id, key_id_matches_actor, verify_signature};
use crate::data::Actor;
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_RECEIVED, SIGNATURE_VERIFICATIONS};

/// Verifies inbound requests and hands them to the [`Dispatcher`]
pub struct InboxProcessor {
    dispatcher: Arc<Dispatcher>,
}

impl InboxProcessor {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Process one POST to an inbox
    ///
    /// `inbox_owner` is the username of a per-actor inbox, `None` for the
    /// shared inbox. The whole request is bounded by the inbound timeout.
    ///
    /// # Errors
    /// The error's status is the response status: 400 for bad JSON, 401
    /// for a failed signature (except Delete, which is answered 200 and not
    /// applied), 403/404 from the dispatcher and handlers.
    pub async fn receive(
        &self,
        request: &SignedRequest<'_>,
        inbox_owner: Option<&str>,
    ) -> Result<DispatchOutcome, AppError> {
        let timeout = self.dispatcher.context().config.inbound_timeout();
        // Set as soon as the verb is known, so rejections are counted
        // under it too
        let mut activity_type = "unknown";
        let result = match tokio::time::timeout(
            timeout,
            self.process(request, inbox_owner, &mut activity_type),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::Federation(
                "Timed out processing inbound activity".to_string(),
            )),
        };

        let outcome = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(error) => error.status_and_type().1,
        };
        ACTIVITIES_RECEIVED
            .with_label_values(&[activity_type, outcome])
            .inc();

        result
    }

    async fn process(
        &self,
        request: &SignedRequest<'_>,
        inbox_owner: Option<&str>,
        activity_type: &mut &'static str,
    ) -> Result<DispatchOutcome, AppError> {
        let ctx = self.dispatcher.context();

        let recipient = match inbox_owner {
            Some(username) => {
                let actor = ctx
                    .store
                    .get_local_actor_by_username(username)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("No inbox for {}", username)))?;
                if !actor.is_active {
                    return Err(AppError::Forbidden(format!("{} is deactivated", username)));
                }
                Some(actor)
            }
            None => None,
        };

        let raw: Value = serde_json::from_slice(request.body)
            .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;
        let activity = Activity::from_value(raw)?;

        let Some(verb) = activity.activity_type() else {
            if ctx.config.is_ignored_activity(&activity.kind) {
                return Ok(DispatchOutcome::Ignored);
            }
            return Err(AppError::UnsupportedActivity(activity.kind.clone()));
        };
        let label = verb.as_str();
        *activity_type = label;

        if self.is_blocked_host(uri_host(&activity.actor).as_deref()).await?
            || self.is_blocked_host(user_agent_host(request).as_deref()).await?
        {
            tracing::info!(
                actor = %activity.actor,
                activity = %activity.id,
                "Dropping activity from blocked server"
            );
            return Ok(DispatchOutcome::Dropped);
        }

        let signer = match self.authenticate(request, &activity).await {
            Ok(signer) => {
                SIGNATURE_VERIFICATIONS.with_label_values(&["success"]).inc();
                signer
            }
            Err(error @ AppError::Database(_)) => return Err(error),
            Err(error) => {
                SIGNATURE_VERIFICATIONS.with_label_values(&["failure"]).inc();
                tracing::info!(
                    actor = %activity.actor,
                    activity = %activity.id,
                    %error,
                    "Signature verification failed"
                );
                // The key owner may itself be gone
                if verb == ActivityType::Delete {
                    return Ok(DispatchOutcome::Dropped);
                }
                return Err(AppError::InvalidSignature);
            }
        };

        let outcome = self
            .dispatcher
            .dispatch(&activity, &signer, recipient.as_ref())
            .await?;

        tracing::debug!(
            activity = %activity.id,
            activity_type = label,
            signer = %signer.id,
            outcome = outcome.as_str(),
            "Inbound activity processed"
        );
        Ok(outcome)
    }

    /// Resolve the signing actor and verify the request with its key
    ///
    /// A failure against a cached key triggers one refetch of the actor;
    /// verification is retried only when the key actually changed.
    async fn authenticate(
        &self,
        request: &SignedRequest<'_>,
        activity: &Activity,
    ) -> Result<Actor, AppError> {
        let ctx = self.dispatcher.context();
        let max_age = ctx.config.max_signature_age_secs;

        let key_id = extract_signature_key_id(request.headers)?;
        if !key_id_matches_actor(&key_id, &activity.actor) {
            return Err(AppError::Validation(format!(
                "keyId {} does not belong to {}",
                key_id, activity.actor
            )));
        }

        let signer = ctx.resolver.resolve(strip_fragment(&key_id)).await?;
        let Err(first) = verify_signature(request, &signer.public_key_pem, max_age) else {
            return Ok(signer);
        };

        if signer.local {
            return Err(first.into());
        }

        let refreshed = ctx.resolver.refresh(&signer.id).await?;
        if refreshed.public_key_pem == signer.public_key_pem {
            return Err(first.into());
        }

        tracing::info!(actor = %refreshed.id, "Actor key rotated, retrying verification");
        verify_signature(request, &refreshed.public_key_pem, max_age)?;
        Ok(refreshed)
    }

    async fn is_blocked_host(&self, host: Option<&str>) -> Result<bool, AppError> {
        let Some(host) = host else {
            return Ok(false);
        };
        let ctx = self.dispatcher.context();
        if ctx.config.is_server_blocked(host) {
            return Ok(true);
        }
        ctx.store.is_server_blocked(host).await
    }
}

/// Host of a URL embedded in the User-Agent, e.g.
/// `Mastodon/4.0 (+https://x.example/)`
fn user_agent_host(request: &SignedRequest<'_>) -> Option<String> {
    let agent = request.headers.get(http::header::USER_AGENT)?.to_str().ok()?;
    let start = agent.find("https://").or_else(|| agent.find("http://"))?;
    let url = agent[start..]
        .split(|c: char| c.is_whitespace() || c == ')' || c == ';')
        .next()?;
    uri_host(url)
}
