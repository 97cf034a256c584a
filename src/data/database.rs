//! SQLite database operations
//!
//! The only [`DomainStore`] implementation. Conditional writes use
//! `INSERT OR IGNORE`, guarded `UPDATE`/`DELETE`, or `BEGIN IMMEDIATE`
//! transactions so racing deliveries of the same activity cannot duplicate
//! rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use super::store::DomainStore;
use crate::error::AppError;

/// Database connection pool wrapper
pub struct Database {
    pool: Pool<Sqlite>,
}

fn relationship_from_row(row: &SqliteRow) -> Result<Relationship, AppError> {
    let state: String = row.try_get("state")?;
    let state = RelationshipState::parse(&state).ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!("unknown relationship state '{state}'"))
    })?;

    Ok(Relationship {
        subject: row.try_get("subject")?,
        object: row.try_get("object")?,
        state,
        activity_id: row.try_get("activity_id")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the file (and parent directory) if missing and runs the
    /// embedded migrations.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            tracing::error!("Migration failed: {}", e);
            AppError::Migration(e)
        })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Run `body` inside `BEGIN IMMEDIATE`, committing on success
    async fn immediate<T, F>(&self, body: F) -> Result<T, AppError>
    where
        F: for<'c> FnOnce(
            &'c mut sqlx::SqliteConnection,
        ) -> futures::future::BoxFuture<'c, Result<T, AppError>>,
    {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match body(&mut *conn).await {
            Ok(value) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(value)
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }
}

#[async_trait]
impl DomainStore for Database {
    // =========================================================================
    // Actors
    // =========================================================================

    async fn get_actor(&self, id: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    async fn get_local_actor_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>(
            "SELECT * FROM actors WHERE local = 1 AND username = ? COLLATE NOCASE",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(actor)
    }

    async fn upsert_actor(&self, actor: &Actor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO actors (
                id, username, domain, inbox, shared_inbox, public_key_pem, private_key_pem,
                local, manually_approves_followers, is_active, display_name, summary,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                username = excluded.username,
                inbox = excluded.inbox,
                shared_inbox = excluded.shared_inbox,
                public_key_pem = excluded.public_key_pem,
                private_key_pem = COALESCE(excluded.private_key_pem, actors.private_key_pem),
                manually_approves_followers = excluded.manually_approves_followers,
                is_active = excluded.is_active,
                display_name = excluded.display_name,
                summary = excluded.summary,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.username)
        .bind(&actor.domain)
        .bind(&actor.inbox)
        .bind(&actor.shared_inbox)
        .bind(&actor.public_key_pem)
        .bind(&actor.private_key_pem)
        .bind(actor.local)
        .bind(actor.manually_approves_followers)
        .bind(actor.is_active)
        .bind(&actor.display_name)
        .bind(&actor.summary)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn deactivate_actor(&self, id: &str) -> Result<bool, AppError> {
        let result =
            sqlx::query("UPDATE actors SET is_active = 0, updated_at = ? WHERE id = ? AND is_active = 1")
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_followers(&self, actor_id: &str) -> Result<Vec<Actor>, AppError> {
        let followers = sqlx::query_as::<_, Actor>(
            r#"
            SELECT a.* FROM actors a
            JOIN relationships r ON r.subject = a.id
            WHERE r.object = ? AND r.state = 'accepted' AND a.is_active = 1
            ORDER BY r.created_at
            "#,
        )
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(followers)
    }

    // =========================================================================
    // Relationships
    // =========================================================================

    async fn get_relationship(
        &self,
        subject: &str,
        object: &str,
    ) -> Result<Option<Relationship>, AppError> {
        let row = sqlx::query("SELECT * FROM relationships WHERE subject = ? AND object = ?")
            .bind(subject)
            .bind(object)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(relationship_from_row).transpose()
    }

    async fn find_relationship_by_activity(
        &self,
        activity_id: &str,
    ) -> Result<Option<Relationship>, AppError> {
        let row = sqlx::query("SELECT * FROM relationships WHERE activity_id = ? LIMIT 1")
            .bind(activity_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(relationship_from_row).transpose()
    }

    async fn insert_follow_request(
        &self,
        subject: &str,
        object: &str,
        activity_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO relationships (subject, object, state, activity_id, created_at)
            VALUES (?, ?, 'requested', ?, ?)
            "#,
        )
        .bind(subject)
        .bind(object)
        .bind(activity_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn accept_follow_request(&self, subject: &str, object: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE relationships SET state = 'accepted'
            WHERE subject = ? AND object = ? AND state = 'requested'
            "#,
        )
        .bind(subject)
        .bind(object)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_relationship(
        &self,
        subject: &str,
        object: &str,
        state: Option<RelationshipState>,
    ) -> Result<bool, AppError> {
        let result = match state {
            Some(state) => {
                sqlx::query(
                    "DELETE FROM relationships WHERE subject = ? AND object = ? AND state = ?",
                )
                .bind(subject)
                .bind(object)
                .bind(state.as_str())
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("DELETE FROM relationships WHERE subject = ? AND object = ?")
                    .bind(subject)
                    .bind(object)
                    .execute(&self.pool)
                    .await?
            }
        };

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    async fn block_and_sever(
        &self,
        subject: &str,
        object: &str,
        activity_id: &str,
    ) -> Result<bool, AppError> {
        let subject = subject.to_string();
        let object = object.to_string();
        let activity_id = activity_id.to_string();

        self.immediate(move |conn| {
            Box::pin(async move {
                let inserted = sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO blocks (subject, object, activity_id, created_at)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(&subject)
                .bind(&object)
                .bind(&activity_id)
                .bind(Utc::now())
                .execute(&mut *conn)
                .await?;

                sqlx::query(
                    r#"
                    DELETE FROM relationships
                    WHERE (subject = ? AND object = ?) OR (subject = ? AND object = ?)
                    "#,
                )
                .bind(&subject)
                .bind(&object)
                .bind(&object)
                .bind(&subject)
                .execute(&mut *conn)
                .await?;

                Ok(inserted.rows_affected() == 1)
            })
        })
        .await
    }

    async fn delete_block_by_activity(
        &self,
        subject: &str,
        activity_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM blocks WHERE subject = ? AND activity_id = ?")
            .bind(subject)
            .bind(activity_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_block(&self, subject: &str, object: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM blocks WHERE subject = ? AND object = ?")
            .bind(subject)
            .bind(object)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_block(&self, subject: &str, object: &str) -> Result<Option<Block>, AppError> {
        let block =
            sqlx::query_as::<_, Block>("SELECT * FROM blocks WHERE subject = ? AND object = ?")
                .bind(subject)
                .bind(object)
                .fetch_optional(&self.pool)
                .await?;

        Ok(block)
    }

    async fn is_blocked_between(&self, a: &str, b: &str) -> Result<bool, AppError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM blocks
            WHERE (subject = ? AND object = ?) OR (subject = ? AND object = ?)
            "#,
        )
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    // =========================================================================
    // Referenced objects
    // =========================================================================

    async fn get_object(&self, id: &str) -> Result<Option<StoredObject>, AppError> {
        let object = sqlx::query_as::<_, StoredObject>("SELECT * FROM objects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(object)
    }

    async fn insert_object(&self, object: &StoredObject) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO objects (
                id, object_type, attributed_to, content, in_reply_to, data,
                local, deleted, deleted_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&object.id)
        .bind(&object.object_type)
        .bind(&object.attributed_to)
        .bind(&object.content)
        .bind(&object.in_reply_to)
        .bind(&object.data)
        .bind(object.local)
        .bind(object.deleted)
        .bind(object.deleted_at)
        .bind(object.created_at)
        .bind(object.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_object(
        &self,
        id: &str,
        content: Option<&str>,
        data: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE objects SET content = ?, data = ?, updated_at = ?
            WHERE id = ? AND deleted = 0
            "#,
        )
        .bind(content)
        .bind(data)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn tombstone_object(&self, id: &str) -> Result<bool, AppError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE objects SET deleted = 1, deleted_at = ?, updated_at = ?
            WHERE id = ? AND deleted = 0
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    async fn create_notification(
        &self,
        recipient: &str,
        kind: NotificationType,
        related_actor: Option<&str>,
        related_object: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, recipient, kind, related_actor, related_object, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(EntityId::new().0)
        .bind(recipient)
        .bind(kind.as_str())
        .bind(related_actor)
        .bind(related_object)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_notifications(&self, recipient: &str) -> Result<Vec<Notification>, AppError> {
        let notifications = sqlx::query_as::<_, Notification>(
            "SELECT * FROM notifications WHERE recipient = ? ORDER BY created_at DESC",
        )
        .bind(recipient)
        .fetch_all(&self.pool)
        .await?;

        Ok(notifications)
    }

    async fn delete_notifications_for_object(&self, object_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM notifications WHERE related_object = ?")
            .bind(object_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Favorites and boosts
    // =========================================================================

    async fn insert_interaction(
        &self,
        kind: InteractionKind,
        interaction: &Interaction,
    ) -> Result<bool, AppError> {
        let sql = format!(
            "INSERT OR IGNORE INTO {} (activity_id, actor, object, created_at) VALUES (?, ?, ?, ?)",
            kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(&interaction.activity_id)
            .bind(&interaction.actor)
            .bind(&interaction.object)
            .bind(interaction.created_at)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_interaction_by_activity(
        &self,
        kind: InteractionKind,
        actor: &str,
        activity_id: &str,
    ) -> Result<bool, AppError> {
        let sql = format!(
            "DELETE FROM {} WHERE actor = ? AND activity_id = ?",
            kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(actor)
            .bind(activity_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_interactions(
        &self,
        kind: InteractionKind,
        object: &str,
    ) -> Result<Vec<Interaction>, AppError> {
        let sql = format!(
            "SELECT * FROM {} WHERE object = ? ORDER BY created_at",
            kind.table()
        );
        let interactions = sqlx::query_as::<_, Interaction>(&sql)
            .bind(object)
            .fetch_all(&self.pool)
            .await?;

        Ok(interactions)
    }

    // =========================================================================
    // Shelves and lists
    // =========================================================================

    async fn insert_collection_item(&self, item: &CollectionItem) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO collection_items (id, collection, item, actor, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(&item.collection)
        .bind(&item.item)
        .bind(&item.actor)
        .bind(item.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_collection_item(
        &self,
        actor: &str,
        collection: &str,
        item_or_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM collection_items
            WHERE actor = ? AND collection = ? AND (id = ? OR item = ?)
            "#,
        )
        .bind(actor)
        .bind(collection)
        .bind(item_or_id)
        .bind(item_or_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_collection_items(
        &self,
        collection: &str,
    ) -> Result<Vec<CollectionItem>, AppError> {
        let items = sqlx::query_as::<_, CollectionItem>(
            "SELECT * FROM collection_items WHERE collection = ? ORDER BY created_at",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    // =========================================================================
    // Moderation
    // =========================================================================

    async fn insert_report(&self, report: &Report) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO reports (id, reporter, reported_actor, objects, note, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&report.id)
        .bind(&report.reporter)
        .bind(&report.reported_actor)
        .bind(&report.objects)
        .bind(&report.note)
        .bind(report.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_report(&self, id: &str) -> Result<Option<Report>, AppError> {
        let report = sqlx::query_as::<_, Report>("SELECT * FROM reports WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(report)
    }

    async fn is_server_blocked(&self, domain: &str) -> Result<bool, AppError> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM blocked_servers
            WHERE ? = domain OR ? LIKE '%.' || domain
            "#,
        )
        .bind(&domain)
        .bind(&domain)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    async fn block_server(&self, domain: &str) -> Result<(), AppError> {
        sqlx::query("INSERT OR IGNORE INTO blocked_servers (domain, created_at) VALUES (?, ?)")
            .bind(domain.trim_end_matches('.').to_ascii_lowercase())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Idempotency ledger
    // =========================================================================

    async fn claim_activity(&self, key: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO processed_activities (key, processed_at) VALUES (?, ?)",
        )
        .bind(key)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_activity(&self, key: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM processed_activities WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn is_activity_processed(&self, key: &str) -> Result<bool, AppError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM processed_activities WHERE key = ?")
                .bind(key)
                .fetch_one(&self.pool)
                .await?;

        Ok(count > 0)
    }

    // =========================================================================
    // Delivery queue
    // =========================================================================

    async fn enqueue_delivery(&self, job: &DeliveryJob) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_jobs (id, sender, inbox, activity, attempts, next_attempt_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.sender)
        .bind(&job.inbox)
        .bind(&job.activity)
        .bind(job.attempts)
        .bind(job.next_attempt_at)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeliveryJob>, AppError> {
        let jobs = sqlx::query_as::<_, DeliveryJob>(
            r#"
            UPDATE delivery_jobs SET next_attempt_at = ?
            WHERE id IN (
                SELECT id FROM delivery_jobs
                WHERE next_attempt_at <= ?
                ORDER BY next_attempt_at
                LIMIT ?
            )
            RETURNING *
            "#,
        )
        .bind(lease_until)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn complete_delivery(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM delivery_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn reschedule_delivery(
        &self,
        id: &str,
        attempts: i64,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE delivery_jobs SET attempts = ?, next_attempt_at = ? WHERE id = ?")
            .bind(attempts)
            .bind(next_attempt_at)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_pending_deliveries(&self) -> Result<Vec<DeliveryJob>, AppError> {
        let jobs = sqlx::query_as::<_, DeliveryJob>(
            "SELECT * FROM delivery_jobs ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn count_pending_deliveries(&self) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM delivery_jobs")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    async fn count_local_actors(&self) -> Result<i64, AppError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM actors WHERE local = 1 AND is_active = 1")
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    async fn count_local_objects(&self) -> Result<i64, AppError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE local = 1 AND deleted = 0")
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}
