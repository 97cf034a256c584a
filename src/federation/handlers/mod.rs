//! Side-effect handlers, one module per verb family

mod accept;
mod block;
mod collection;
mod create;
mod delete;
mod flag;
mod follow;
mod interaction;
mod undo;
mod update;

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use super::activity::{
    ACTOR_TYPES, ActivityType, BOOK_TYPES, COLLECTION_ITEM_TYPES, COLLECTION_TYPES, ObjectRef,
    RECORD_TYPES, STATUS_TYPES, sanitize_remote_html,
};
use super::dispatcher::{Dispatcher, FederationContext};
use crate::data::{Actor, NotificationType, StoredObject};
use crate::error::AppError;

pub use accept::AcceptHandler;
pub use block::BlockHandler;
pub use collection::CollectionHandler;
pub use create::CreateHandler;
pub use delete::DeleteHandler;
pub use flag::FlagHandler;
pub use follow::FollowHandler;
pub use interaction::InteractionHandler;
pub use undo::UndoHandler;
pub use update::{UpdateActorHandler, UpdateObjectHandler};

/// Register the built-in handlers
pub fn register_all(dispatcher: &mut Dispatcher) {
    use crate::data::InteractionKind;

    dispatcher.register(ActivityType::Follow, None, Arc::new(FollowHandler));
    dispatcher.register(ActivityType::Accept, None, Arc::new(AcceptHandler { accept: true }));
    dispatcher.register(ActivityType::Reject, None, Arc::new(AcceptHandler { accept: false }));
    dispatcher.register(ActivityType::Block, None, Arc::new(BlockHandler));
    dispatcher.register(ActivityType::Create, None, Arc::new(CreateHandler));
    dispatcher.register(ActivityType::Delete, None, Arc::new(DeleteHandler));
    dispatcher.register(ActivityType::Flag, None, Arc::new(FlagHandler));
    dispatcher.register(
        ActivityType::Like,
        None,
        Arc::new(InteractionHandler {
            kind: InteractionKind::Favorite,
        }),
    );
    dispatcher.register(
        ActivityType::Announce,
        None,
        Arc::new(InteractionHandler {
            kind: InteractionKind::Boost,
        }),
    );

    let undo: Arc<UndoHandler> = Arc::new(UndoHandler);
    dispatcher.register_types(
        ActivityType::Undo,
        &["Follow", "Like", "Announce", "Block"],
        undo.clone(),
    );
    dispatcher.register(ActivityType::Undo, None, undo);

    dispatcher.register_types(ActivityType::Update, ACTOR_TYPES, Arc::new(UpdateActorHandler));
    let update_object: Arc<UpdateObjectHandler> = Arc::new(UpdateObjectHandler);
    for types in [STATUS_TYPES, RECORD_TYPES, BOOK_TYPES, COLLECTION_TYPES] {
        dispatcher.register_types(ActivityType::Update, types, update_object.clone());
    }
    dispatcher.register(ActivityType::Update, None, update_object);

    for (verb, add) in [(ActivityType::Add, true), (ActivityType::Remove, false)] {
        let handler: Arc<CollectionHandler> = Arc::new(CollectionHandler { add });
        for types in [COLLECTION_ITEM_TYPES, BOOK_TYPES, STATUS_TYPES] {
            dispatcher.register_types(verb, types, handler.clone());
        }
        dispatcher.register(verb, None, handler);
    }
}

/// Object types handlers store in the objects table
pub(crate) fn is_storable_type(object_type: &str) -> bool {
    [STATUS_TYPES, RECORD_TYPES, BOOK_TYPES, COLLECTION_TYPES]
        .iter()
        .any(|types| types.contains(&object_type))
}

/// Author of an object document: `attributedTo`, or `actor`/`user` for
/// records that use those instead
pub(crate) fn object_author(object: &ObjectRef) -> Option<&str> {
    object
        .str_field("attributedTo")
        .or_else(|| object.str_field("actor"))
        .or_else(|| object.str_field("user"))
}

/// Build a remote [`StoredObject`] from a document, sanitizing its content
pub(crate) fn remote_object(doc: &Value) -> Result<StoredObject, AppError> {
    let object = match doc {
        Value::Object(map) => ObjectRef::Embedded(map.clone()),
        _ => return Err(AppError::Validation("Object must be a JSON object".to_string())),
    };

    let id = object
        .id()
        .ok_or_else(|| AppError::Validation("Object has no id".to_string()))?;
    let object_type = object
        .object_type()
        .ok_or_else(|| AppError::Validation("Object has no type".to_string()))?;

    let now = Utc::now();
    Ok(StoredObject {
        id: id.to_string(),
        object_type: object_type.to_string(),
        attributed_to: object_author(&object).map(str::to_string),
        content: object
            .get("content")
            .and_then(Value::as_str)
            .map(sanitize_remote_html),
        in_reply_to: object.str_field("inReplyTo").map(str::to_string),
        data: doc.to_string(),
        local: false,
        deleted: false,
        deleted_at: None,
        created_at: now,
        updated_at: now,
    })
}

/// Find a known object, or fetch and store a remote one
///
/// Returns `None` when the object is unknown locally or cannot be fetched;
/// remote objects may be deliberately inaccessible.
pub(crate) async fn resolve_object(
    ctx: &FederationContext,
    object: &ObjectRef,
) -> Result<Option<StoredObject>, AppError> {
    let Some(id) = object.id() else {
        return Ok(None);
    };

    if let Some(existing) = ctx.store.get_object(id).await? {
        return Ok(Some(existing));
    }

    if ctx.resolver.is_local_uri(id) {
        return Ok(None);
    }

    // Embedded documents are only trusted as far as their id; fetch the
    // authoritative copy
    let doc = match ctx.resolver.fetch_object(id).await {
        Ok(doc) => doc,
        Err(error) => {
            tracing::debug!(object = %id, %error, "Could not fetch remote object");
            return Ok(None);
        }
    };

    let fetched = match remote_object(&doc) {
        Ok(fetched) if fetched.id == id && is_storable_type(&fetched.object_type) => fetched,
        _ => {
            tracing::debug!(object = %id, "Fetched document is not a usable object");
            return Ok(None);
        }
    };

    ctx.store.insert_object(&fetched).await?;
    Ok(ctx.store.get_object(id).await?)
}

/// Notify a local actor, unless it is the actor itself or a block exists
pub(crate) async fn notify_local(
    ctx: &FederationContext,
    recipient: &str,
    kind: NotificationType,
    actor: &Actor,
    object: Option<&str>,
) -> Result<bool, AppError> {
    if recipient == actor.id {
        return Ok(false);
    }

    match ctx.store.get_actor(recipient).await? {
        Some(local) if local.local && local.is_active => {}
        _ => return Ok(false),
    }

    if ctx.store.is_blocked_between(recipient, &actor.id).await? {
        return Ok(false);
    }

    ctx.store
        .create_notification(recipient, kind, Some(&actor.id), object)
        .await?;
    Ok(true)
}
