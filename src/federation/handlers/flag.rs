use async_trait::async_trait;
use serde_json::Value;

use crate::data::{Actor, Report};
use crate::error::AppError;
use crate::federation::activity::{Activity, sanitize_remote_html, string_list};
use crate::federation::dispatcher::{ActivityHandler, FederationContext};

/// Flag (moderation report) from a remote server
///
/// The object list mixes the reported actor with the offending objects; the
/// first URI that names a known actor becomes the reported actor.
pub struct FlagHandler;

#[async_trait]
impl ActivityHandler for FlagHandler {
    async fn handle(
        &self,
        ctx: &FederationContext,
        activity: &Activity,
        signer: &Actor,
    ) -> Result<(), AppError> {
        let uris = string_list(activity.raw.get("object"));
        if uris.is_empty() {
            return Err(AppError::Validation("Flag without object".to_string()));
        }

        let mut reported_actor = None;
        let mut objects = Vec::with_capacity(uris.len());
        for uri in uris {
            if reported_actor.is_none() && ctx.store.get_actor(&uri).await?.is_some() {
                reported_actor = Some(uri);
            } else {
                objects.push(Value::String(uri));
            }
        }

        let report = Report {
            id: activity.id.clone(),
            reporter: signer.id.clone(),
            reported_actor,
            objects: Value::Array(objects).to_string(),
            note: activity
                .raw
                .get("content")
                .and_then(Value::as_str)
                .map(sanitize_remote_html),
            created_at: chrono::Utc::now(),
        };

        let inserted = ctx.store.insert_report(&report).await?;
        tracing::info!(
            report = %report.id,
            reporter = %report.reporter,
            reported = ?report.reported_actor,
            inserted,
            "Report received"
        );
        Ok(())
    }
}
