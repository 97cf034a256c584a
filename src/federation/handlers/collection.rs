use async_trait::async_trait;
use serde_json::Value;

use super::{remote_object, resolve_object};
use crate::data::{Actor, CollectionItem};
use crate::error::AppError;
use crate::federation::activity::{Activity, COLLECTION_ITEM_TYPES, ObjectRef, strip_fragment};
use crate::federation::dispatcher::{ActivityHandler, FederationContext};

/// Add to / Remove from a shelf or list
///
/// The object is either a membership record (`ShelfItem`, `ListItem`, ...)
/// naming the book, or the book itself. Add resolves the book, fetching it
/// when unknown, before recording membership.
pub struct CollectionHandler {
    /// `false` for Remove
    pub add: bool,
}

/// `(record id, item uri)` for the object of an Add/Remove
fn membership(activity: &Activity) -> Option<(String, ObjectRef)> {
    let object = &activity.object;
    let is_record = object
        .object_type()
        .is_some_and(|t| COLLECTION_ITEM_TYPES.contains(&t));

    if is_record {
        let record_id = object.id().unwrap_or(&activity.id).to_string();
        let item = object.get("book").or_else(|| object.get("object"))?;
        let item = match item {
            Value::String(uri) => ObjectRef::Uri(uri.clone()),
            Value::Object(map) => ObjectRef::Embedded(map.clone()),
            _ => return None,
        };
        Some((record_id, item))
    } else {
        Some((activity.id.clone(), object.clone()))
    }
}

#[async_trait]
impl ActivityHandler for CollectionHandler {
    async fn handle(
        &self,
        ctx: &FederationContext,
        activity: &Activity,
        signer: &Actor,
    ) -> Result<(), AppError> {
        let collection = activity
            .target
            .as_ref()
            .and_then(ObjectRef::id)
            .ok_or_else(|| AppError::Validation(format!("{} without target", activity.kind)))?
            .to_string();

        let (record_id, item) = membership(activity)
            .ok_or_else(|| AppError::Validation(format!("{} without item", activity.kind)))?;
        let item_id = item
            .id()
            .ok_or_else(|| AppError::Validation("Item without id".to_string()))?
            .to_string();

        if let Some(known) = ctx.store.get_object(&collection).await? {
            if let Some(owner) = &known.attributed_to {
                if strip_fragment(owner) != strip_fragment(&signer.id) {
                    return Err(AppError::Forbidden(format!(
                        "{} does not own {}",
                        signer.id, collection
                    )));
                }
            }
        }

        if !self.add {
            let removed = ctx
                .store
                .delete_collection_item(&signer.id, &collection, &record_id)
                .await?
                || ctx
                    .store
                    .delete_collection_item(&signer.id, &collection, &item_id)
                    .await?;
            tracing::info!(collection = %collection, item = %item_id, removed, "Item removed");
            return Ok(());
        }

        let mut resolved = resolve_object(ctx, &item).await?;
        if resolved.is_none() {
            // Fall back to an embedded document when the origin is unreachable
            if let ObjectRef::Embedded(_) = item {
                if let Ok(object) = remote_object(&item.to_value()) {
                    ctx.store.insert_object(&object).await?;
                    resolved = ctx.store.get_object(&object.id).await?;
                }
            }
        }
        if resolved.is_none() {
            tracing::warn!(item = %item_id, "Cannot resolve item, dropping Add");
            return Ok(());
        }

        let inserted = ctx
            .store
            .insert_collection_item(&CollectionItem {
                id: record_id,
                collection: collection.clone(),
                item: item_id.clone(),
                actor: signer.id.clone(),
                created_at: chrono::Utc::now(),
            })
            .await?;

        tracing::info!(collection = %collection, item = %item_id, inserted, "Item added");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DomainStore;
    use crate::test_support::{self, RAT, activity};
    use serde_json::json;

    const SHELF: &str = "https://b.example/users/rat/shelf/to-read";
    const BOOK: &str = "https://b.example/book/1";

    fn shelve(kind: &str, id: &str) -> Activity {
        activity(json!({
            "id": id,
            "type": kind,
            "actor": RAT,
            "object": {
                "id": "https://b.example/shelfitem/1",
                "type": "ShelfItem",
                "actor": RAT,
                "book": {"id": BOOK, "type": "Edition", "title": "Whiskers"}
            },
            "target": SHELF
        }))
    }

    #[tokio::test]
    async fn add_then_remove_membership() {
        let fx = test_support::fixture().await;
        // b.example does not resolve; the embedded book is stored as-is
        let add = CollectionHandler { add: true };
        add.handle(&fx.ctx, &shelve("Add", "https://b.example/add/1"), &fx.rat)
            .await
            .unwrap();
        add.handle(&fx.ctx, &shelve("Add", "https://b.example/add/2"), &fx.rat)
            .await
            .unwrap();

        let items = fx.store.get_collection_items(SHELF).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item, BOOK);
        assert!(fx.store.get_object(BOOK).await.unwrap().is_some());

        CollectionHandler { add: false }
            .handle(&fx.ctx, &shelve("Remove", "https://b.example/remove/1"), &fx.rat)
            .await
            .unwrap();
        assert!(fx.store.get_collection_items(SHELF).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_without_target_is_invalid() {
        let fx = test_support::fixture().await;
        let add = activity(json!({
            "id": "https://b.example/add/3",
            "type": "Add",
            "actor": RAT,
            "object": BOOK
        }));
        let err = CollectionHandler { add: true }
            .handle(&fx.ctx, &add, &fx.rat)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
