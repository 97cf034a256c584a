//! Activity dispatcher
//!
//! Maps `(verb, object type)` to a handler. For the ambiguous verbs
//! (Add, Remove, Undo, Update) the nested object's type picks the handler;
//! other verbs register a single handler under `(verb, None)`.
//!
//! Lookup order for an activity:
//! 1. unknown verb: ignored if on the ignore-list, `UnsupportedActivity` otherwise
//! 2. embedded object of an ignored type: ignored
//! 3. registered handler for the key
//! 4. otherwise `UnsupportedObject`

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::activity::{Activity, ActivityType, uri_host};
use super::delivery::Broadcaster;
use super::handlers;
use super::resolver::ActorResolver;
use crate::config::FederationConfig;
use crate::data::{Actor, DomainStore};
use crate::error::AppError;

/// Everything a handler may touch
#[derive(Clone)]
pub struct FederationContext {
    pub store: Arc<dyn DomainStore>,
    pub resolver: Arc<ActorResolver>,
    pub broadcaster: Arc<Broadcaster>,
    pub config: Arc<FederationConfig>,
}

/// Side effects of one verb (or verb and object type)
///
/// Implementations must be idempotent on their own: the ledger prevents
/// exact redelivery, but distinct activities can describe the same change.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &FederationContext,
        activity: &Activity,
        signer: &Actor,
    ) -> Result<(), AppError>;
}

/// Result of a successful dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler ran
    Applied,
    /// Already applied earlier; nothing done
    Duplicate,
    /// On the ignore-list
    Ignored,
    /// Sender or its server is blocked
    Dropped,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::Ignored => "ignored",
            Self::Dropped => "dropped",
        }
    }
}

type HandlerKey = (ActivityType, Option<&'static str>);

enum Route {
    Handler(Arc<dyn ActivityHandler>),
    Ignored,
}

pub struct Dispatcher {
    ctx: FederationContext,
    handlers: HashMap<HandlerKey, Arc<dyn ActivityHandler>>,
}

impl Dispatcher {
    /// Dispatcher with every built-in handler registered
    pub fn new(ctx: FederationContext) -> Self {
        let mut dispatcher = Self::empty(ctx);
        handlers::register_all(&mut dispatcher);
        dispatcher
    }

    /// Dispatcher with no handlers
    pub fn empty(ctx: FederationContext) -> Self {
        Self {
            ctx,
            handlers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        verb: ActivityType,
        object_type: Option<&'static str>,
        handler: Arc<dyn ActivityHandler>,
    ) {
        self.handlers.insert((verb, object_type), handler);
    }

    /// Register `handler` for `verb` with each of `object_types`
    pub fn register_types(
        &mut self,
        verb: ActivityType,
        object_types: &[&'static str],
        handler: Arc<dyn ActivityHandler>,
    ) {
        for object_type in object_types {
            self.register(verb, Some(object_type), handler.clone());
        }
    }

    pub fn context(&self) -> &FederationContext {
        &self.ctx
    }

    fn route(&self, activity: &Activity) -> Result<Route, AppError> {
        let config = &self.ctx.config;

        let Some(verb) = activity.activity_type() else {
            if config.is_ignored_activity(&activity.kind) {
                return Ok(Route::Ignored);
            }
            return Err(AppError::UnsupportedActivity(activity.kind.clone()));
        };

        let object_type = activity.object.object_type();
        if object_type.is_some_and(|t| config.is_ignored_object(t)) {
            return Ok(Route::Ignored);
        }

        let handler = if verb.is_ambiguous() {
            match object_type {
                Some(object_type) => self
                    .handlers
                    .iter()
                    .find(|((v, t), _)| *v == verb && *t == Some(object_type))
                    .map(|(_, handler)| handler.clone()),
                None => self.handlers.get(&(verb, None)).cloned(),
            }
        } else {
            self.handlers.get(&(verb, None)).cloned()
        };

        handler.map(Route::Handler).ok_or_else(|| {
            AppError::UnsupportedObject(format!(
                "{} of {}",
                verb.as_str(),
                object_type.unwrap_or("untyped object")
            ))
        })
    }

    /// Whether the signer's server is blocked, by configuration or by the store
    pub async fn is_server_blocked(&self, signer: &Actor) -> Result<bool, AppError> {
        let host = uri_host(&signer.id).unwrap_or_else(|| signer.domain.to_ascii_lowercase());
        if self.ctx.config.is_server_blocked(&host) {
            return Ok(true);
        }
        self.ctx.store.is_server_blocked(&host).await
    }

    /// Route, deduplicate and apply one verified activity
    ///
    /// `recipient` is the local actor whose personal inbox received the
    /// activity, if any. Activities from an actor the recipient has
    /// blocked are dropped, except the ones that undo or request state
    /// (Follow answers with a permission error instead).
    ///
    /// Handler errors release the ledger claim so the sender's retry is
    /// applied, and are logged with the raw activity.
    pub async fn dispatch(
        &self,
        activity: &Activity,
        signer: &Actor,
        recipient: Option<&Actor>,
    ) -> Result<DispatchOutcome, AppError> {
        let handler = match self.route(activity)? {
            Route::Handler(handler) => handler,
            Route::Ignored => {
                tracing::debug!(
                    activity = %activity.id,
                    activity_type = %activity.kind,
                    "Ignoring activity"
                );
                return Ok(DispatchOutcome::Ignored);
            }
        };

        if self.is_server_blocked(signer).await? {
            tracing::info!(signer = %signer.id, "Dropping activity from blocked server");
            return Ok(DispatchOutcome::Dropped);
        }

        let verb = activity.activity_type();
        if let Some(recipient) = recipient {
            let exempt = matches!(
                verb,
                Some(ActivityType::Follow | ActivityType::Undo | ActivityType::Delete)
            );
            if !exempt
                && self
                    .ctx
                    .store
                    .get_block(&recipient.id, &signer.id)
                    .await?
                    .is_some()
            {
                tracing::info!(
                    signer = %signer.id,
                    recipient = %recipient.id,
                    "Dropping activity from blocked actor"
                );
                return Ok(DispatchOutcome::Dropped);
            }
        }

        if verb == Some(ActivityType::Create) && !signer.is_active {
            return Err(AppError::Forbidden(format!(
                "{} is deactivated",
                signer.id
            )));
        }

        let key = activity.idempotency_key();
        if !self.ctx.store.claim_activity(&key).await? {
            tracing::debug!(activity = %activity.id, %key, "Activity already applied");
            return Ok(DispatchOutcome::Duplicate);
        }

        match handler.handle(&self.ctx, activity, signer).await {
            Ok(()) => Ok(DispatchOutcome::Applied),
            Err(error) => {
                tracing::error!(
                    activity = %activity.id,
                    activity_type = %activity.kind,
                    signer = %signer.id,
                    %error,
                    raw = %activity.raw,
                    "Activity handler failed"
                );
                if let Err(release_error) = self.ctx.store.release_activity(&key).await {
                    tracing::error!(%key, error = %release_error, "Failed to release ledger claim");
                }
                Err(error)
            }
        }
    }
}
