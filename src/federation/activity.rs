//! Activity envelope
//!
//! Incoming activities are only partially typed: the envelope fields the
//! dispatcher needs are extracted, the rest stays as raw JSON for handlers.

use serde_json::Value;

use crate::error::AppError;

/// ActivityPub activity verbs this server understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityType {
    Create,
    Update,
    Delete,
    Follow,
    Accept,
    Reject,
    Undo,
    Like,
    Announce,
    Add,
    Remove,
    Block,
    Flag,
}

impl ActivityType {
    /// Parse activity type from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Create" => Some(Self::Create),
            "Update" => Some(Self::Update),
            "Delete" => Some(Self::Delete),
            "Follow" => Some(Self::Follow),
            "Accept" => Some(Self::Accept),
            "Reject" => Some(Self::Reject),
            "Undo" => Some(Self::Undo),
            "Like" => Some(Self::Like),
            "Announce" => Some(Self::Announce),
            "Add" => Some(Self::Add),
            "Remove" => Some(Self::Remove),
            "Block" => Some(Self::Block),
            "Flag" => Some(Self::Flag),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Undo => "Undo",
            Self::Like => "Like",
            Self::Announce => "Announce",
            Self::Add => "Add",
            Self::Remove => "Remove",
            Self::Block => "Block",
            Self::Flag => "Flag",
        }
    }

    /// Verbs whose handler depends on the nested object's type
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Add | Self::Remove | Self::Undo | Self::Update)
    }
}

/// Actor document types
pub const ACTOR_TYPES: &[&str] = &["Person", "Service", "Application", "Group", "Organization"];

/// Status-like objects
pub const STATUS_TYPES: &[&str] = &["Note", "Comment", "Quotation", "Review", "GeneratedNote"];

/// Rating/record objects
pub const RECORD_TYPES: &[&str] = &["Rating", "ReviewRating"];

/// Book-like objects
pub const BOOK_TYPES: &[&str] = &["Edition", "Work", "Author"];

/// Shelves and lists
pub const COLLECTION_TYPES: &[&str] = &["Shelf", "BookList", "Collection", "OrderedCollection"];

/// Membership records carried by Add/Remove
pub const COLLECTION_ITEM_TYPES: &[&str] = &["ShelfItem", "ListItem", "CollectionItem"];

/// `object` or `target` of an activity: a bare URI or an embedded document
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectRef {
    Uri(String),
    Embedded(serde_json::Map<String, Value>),
}

impl ObjectRef {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(uri) if !uri.is_empty() => Some(Self::Uri(uri.clone())),
            Value::Object(map) => Some(Self::Embedded(map.clone())),
            // Flag sends several objects; the first one is the primary
            Value::Array(items) => items.first().and_then(Self::from_value),
            _ => None,
        }
    }

    /// URI of the referenced object, if it has one
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Uri(uri) => Some(uri),
            Self::Embedded(map) => map.get("id").and_then(Value::as_str),
        }
    }

    /// Declared `type` of an embedded object
    pub fn object_type(&self) -> Option<&str> {
        match self {
            Self::Uri(_) => None,
            Self::Embedded(map) => map.get("type").and_then(Value::as_str),
        }
    }

    /// String field of an embedded object, or the id of an embedded sub-object
    pub fn str_field(&self, field: &str) -> Option<&str> {
        match self {
            Self::Uri(_) => None,
            Self::Embedded(map) => map.get(field).and_then(|value| {
                value
                    .as_str()
                    .or_else(|| value.get("id").and_then(Value::as_str))
            }),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        match self {
            Self::Uri(_) => None,
            Self::Embedded(map) => map.get(field),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Uri(uri) => Value::String(uri.clone()),
            Self::Embedded(map) => Value::Object(map.clone()),
        }
    }
}

/// A parsed inbound activity
#[derive(Debug, Clone)]
pub struct Activity {
    pub id: String,
    /// Verb as sent, e.g. "Follow"
    pub kind: String,
    pub actor: String,
    pub object: ObjectRef,
    pub target: Option<ObjectRef>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub published: Option<chrono::DateTime<chrono::Utc>>,
    /// The full document as received
    pub raw: Value,
}

impl Activity {
    /// Extract the envelope from a JSON document
    ///
    /// # Errors
    /// `AppError::Validation` when `id`, `type`, `actor` or `object` is
    /// missing or has the wrong shape.
    pub fn from_value(raw: Value) -> Result<Self, AppError> {
        if !raw.is_object() {
            return Err(AppError::Validation(
                "Activity must be a JSON object".to_string(),
            ));
        }

        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?
            .to_string();

        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::Validation("Missing activity id".to_string()))?
            .to_string();

        let actor = raw
            .get("actor")
            .and_then(ObjectRef::from_value)
            .and_then(|actor| actor.id().map(str::to_string))
            .ok_or_else(|| AppError::Validation("Missing or invalid actor".to_string()))?;

        let object = raw
            .get("object")
            .and_then(ObjectRef::from_value)
            .ok_or_else(|| AppError::Validation(format!("Missing object in {kind}")))?;

        let target = raw.get("target").and_then(ObjectRef::from_value);

        let published = raw
            .get("published")
            .and_then(Value::as_str)
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        Ok(Self {
            to: string_list(raw.get("to")),
            cc: string_list(raw.get("cc")),
            id,
            kind,
            actor,
            object,
            target,
            published,
            raw,
        })
    }

    /// Parse the verb, if this server knows it
    pub fn activity_type(&self) -> Option<ActivityType> {
        ActivityType::parse(&self.kind)
    }

    /// Key recorded in the idempotency ledger
    ///
    /// Deletes are keyed by sender and deleted object so that distinct
    /// Delete activities for the same object from one actor are applied
    /// once. Another actor's Delete never shadows the author's.
    pub fn idempotency_key(&self) -> String {
        match self.activity_type() {
            Some(ActivityType::Delete) => match delete_target_uri(&self.object) {
                Some(target) => format!("Delete:{}:{}", strip_fragment(&self.actor), target),
                None => self.id.clone(),
            },
            _ => self.id.clone(),
        }
    }
}

/// Accepts a string, an array of strings, or objects with ids
pub fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                item.as_str()
                    .or_else(|| item.get("id").and_then(Value::as_str))
                    .map(str::to_string)
            })
            .collect(),
        Some(Value::Object(map)) => map
            .get("id")
            .and_then(Value::as_str)
            .map(|id| vec![id.to_string()])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// URI of the object a Delete refers to
///
/// Tombstones may carry the original id in `id` or (rarely) `object`.
pub fn delete_target_uri(object: &ObjectRef) -> Option<String> {
    match object {
        ObjectRef::Uri(uri) => Some(uri.clone()),
        ObjectRef::Embedded(_) => object
            .id()
            .or_else(|| object.str_field("object"))
            .map(str::to_string),
    }
}

/// Strip tags and attributes a remote server should not be able to inject
pub fn sanitize_remote_html(content: &str) -> String {
    ammonia::clean(content)
}

/// Remove the fragment (and a trailing slash) so keyIds compare to actor ids
pub fn strip_fragment(uri: &str) -> &str {
    let without_fragment = uri.split_once('#').map_or(uri, |(base, _)| base);
    without_fragment.trim_end_matches('/')
}

/// Host of a URI, lowercased
pub fn uri_host(uri: &str) -> Option<String> {
    url::Url::parse(uri)
        .ok()
        .and_then(|parsed| parsed.host_str().map(|host| host.to_ascii_lowercase()))
}
