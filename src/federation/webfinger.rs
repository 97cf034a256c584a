//! WebFinger protocol implementation
//!
//! Used to discover ActivityPub actor URIs from `user@domain` handles, and to
//! answer the same question for local actors.

use serde::{Deserialize, Serialize};

use crate::error::AppError;

const ACTIVITY_JSON: &str = "application/activity+json";

/// WebFinger result
#[derive(Debug, Clone)]
pub struct WebFingerResult {
    /// Subject (acct:user@domain)
    pub subject: String,
    /// ActivityPub actor URI
    pub actor_uri: String,
}

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

impl WebFingerResponse {
    /// href of the `rel=self` ActivityPub link
    pub fn actor_uri(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| {
                link.rel == "self"
                    && link.link_type.as_deref().is_some_and(|t| {
                        t == ACTIVITY_JSON || t.starts_with("application/ld+json")
                    })
            })
            .and_then(|link| link.href.as_deref())
    }
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Split `user@domain` (optionally prefixed by `@` or `acct:`)
pub fn parse_handle(handle: &str) -> Option<(String, String)> {
    let handle = handle.trim();
    let handle = handle.strip_prefix("acct:").unwrap_or(handle);
    let handle = handle.strip_prefix('@').unwrap_or(handle);
    let (user, domain) = handle.split_once('@')?;

    if user.is_empty() || domain.is_empty() || domain.contains('/') || domain.contains('@') {
        return None;
    }

    Some((user.to_string(), domain.to_ascii_lowercase()))
}

/// Resolve a handle to an ActivityPub actor URI
///
/// # Arguments
/// * `handle` - Account address (user@domain)
/// * `protocol` - "https" in production; "http" for local development
/// * `http_client` - HTTP client with a bounded timeout
pub async fn resolve_webfinger(
    handle: &str,
    protocol: &str,
    http_client: &reqwest::Client,
) -> Result<WebFingerResult, AppError> {
    let (user, domain) = parse_handle(handle)
        .ok_or_else(|| AppError::Validation(format!("Invalid account handle: {}", handle)))?;

    let resource = format!("acct:{}@{}", user, domain);
    let url = format!(
        "{}://{}/.well-known/webfinger?resource={}",
        protocol,
        domain,
        urlencoding::encode(&resource)
    );

    tracing::debug!(%url, "Resolving WebFinger handle");

    let response = http_client
        .get(&url)
        .header("Accept", "application/jrd+json, application/json")
        .send()
        .await
        .map_err(|e| AppError::Federation(format!("WebFinger request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(AppError::Federation(format!(
            "WebFinger lookup for {} returned HTTP {}",
            resource,
            response.status()
        )));
    }

    let jrd: WebFingerResponse = response
        .json()
        .await
        .map_err(|e| AppError::Federation(format!("Invalid WebFinger response: {}", e)))?;

    let actor_uri = jrd
        .actor_uri()
        .ok_or_else(|| AppError::Federation(format!("No ActivityPub link for {}", resource)))?
        .to_string();

    Ok(WebFingerResult {
        subject: jrd.subject,
        actor_uri,
    })
}

/// Generate WebFinger response for a local actor
pub fn generate_webfinger_response(username: &str, domain: &str, actor_uri: &str) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: Some(vec![actor_uri.to_string()]),
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some(ACTIVITY_JSON.to_string()),
            href: Some(actor_uri.to_string()),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_handle_accepts_common_forms() {
        for handle in ["rat@b.example", "@rat@b.example", "acct:rat@B.example"] {
            assert_eq!(
                parse_handle(handle),
                Some(("rat".to_string(), "b.example".to_string()))
            );
        }
        assert_eq!(parse_handle("https://b.example/users/rat"), None);
        assert_eq!(parse_handle("rat@"), None);
    }

    #[test]
    fn generated_document_points_at_actor() {
        let jrd = generate_webfinger_response("mouse", "a.example", "https://a.example/user/mouse");
        assert_eq!(jrd.subject, "acct:mouse@a.example");
        assert_eq!(jrd.actor_uri(), Some("https://a.example/user/mouse"));

        let json = serde_json::to_value(&jrd).unwrap();
        assert_eq!(json["links"][0]["type"], "application/activity+json");
    }

    #[test]
    fn actor_uri_skips_profile_page_links() {
        let jrd: WebFingerResponse = serde_json::from_value(serde_json::json!({
            "subject": "acct:rat@b.example",
            "links": [
                {"rel": "http://webfinger.net/rel/profile-page", "type": "text/html", "href": "https://b.example/@rat"},
                {"rel": "self", "type": "application/activity+json", "href": "https://b.example/users/rat"}
            ]
        }))
        .unwrap();

        assert_eq!(jrd.actor_uri(), Some("https://b.example/users/rat"));
    }
}
