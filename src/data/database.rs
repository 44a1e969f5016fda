//! SQLite database operations
//!
//! All database access goes through this module. Connections are held in
//! a pool inside `Database`; handles are passed explicitly, there is no
//! ambient global state.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Local actors
    // =========================================================================

    /// Insert a local actor.
    ///
    /// # Returns
    /// `false` if the username is already taken.
    pub async fn insert_local_actor(&self, actor: &LocalActor) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO local_actors
                (id, username, display_name, summary, private_key_pem, public_key_pem,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(username) DO NOTHING
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.username)
        .bind(&actor.display_name)
        .bind(&actor.summary)
        .bind(&actor.private_key_pem)
        .bind(&actor.public_key_pem)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Get a local actor by username.
    pub async fn get_local_actor_by_username(
        &self,
        username: &str,
    ) -> Result<Option<LocalActor>, AppError> {
        let actor = sqlx::query_as::<_, LocalActor>(
            "SELECT * FROM local_actors WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(actor)
    }

    /// Get a local actor by id.
    pub async fn get_local_actor_by_id(&self, id: &str) -> Result<Option<LocalActor>, AppError> {
        let actor = sqlx::query_as::<_, LocalActor>("SELECT * FROM local_actors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    // =========================================================================
    // Remote actors
    // =========================================================================

    /// Insert or refresh a cached remote actor descriptor, keyed by URI.
    ///
    /// Refreshes may race; last-writer-wins is acceptable since the cached
    /// document is advisory and re-verified cryptographically on use.
    pub async fn upsert_remote_actor(&self, actor: &RemoteActor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO remote_actors
                (uri, username, domain, display_name, summary, inbox_uri,
                 shared_inbox_uri, key_id, public_key_pem, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uri) DO UPDATE SET
                username = excluded.username,
                domain = excluded.domain,
                display_name = excluded.display_name,
                summary = excluded.summary,
                inbox_uri = excluded.inbox_uri,
                shared_inbox_uri = excluded.shared_inbox_uri,
                key_id = excluded.key_id,
                public_key_pem = excluded.public_key_pem,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(&actor.uri)
        .bind(&actor.username)
        .bind(&actor.domain)
        .bind(&actor.display_name)
        .bind(&actor.summary)
        .bind(&actor.inbox_uri)
        .bind(&actor.shared_inbox_uri)
        .bind(&actor.key_id)
        .bind(&actor.public_key_pem)
        .bind(actor.fetched_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a cached remote actor by URI.
    pub async fn get_remote_actor(&self, uri: &str) -> Result<Option<RemoteActor>, AppError> {
        let actor = sqlx::query_as::<_, RemoteActor>("SELECT * FROM remote_actors WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    // =========================================================================
    // Activities
    // =========================================================================

    /// Insert an activity record if its URI is not already known.
    ///
    /// The URI unique constraint is the deduplication primitive for inbox
    /// processing: under concurrent delivery of the same activity exactly
    /// one insert wins.
    ///
    /// # Returns
    /// `true` if the row was inserted, `false` on a URI conflict.
    pub async fn insert_activity_if_new(
        &self,
        activity: &ActivityRecord,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO activities
                (uri, activity_type, actor_uri, document, direction, status,
                 reject_reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uri) DO NOTHING
            "#,
        )
        .bind(&activity.uri)
        .bind(&activity.activity_type)
        .bind(&activity.actor_uri)
        .bind(&activity.document)
        .bind(&activity.direction)
        .bind(&activity.status)
        .bind(&activity.reject_reason)
        .bind(activity.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Get an activity record by URI.
    pub async fn get_activity(&self, uri: &str) -> Result<Option<ActivityRecord>, AppError> {
        let activity =
            sqlx::query_as::<_, ActivityRecord>("SELECT * FROM activities WHERE uri = ?")
                .bind(uri)
                .fetch_optional(&self.pool)
                .await?;

        Ok(activity)
    }

    /// Transition an activity's processing status.
    pub async fn set_activity_status(
        &self,
        uri: &str,
        status: ActivityStatus,
        reject_reason: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE activities SET status = ?, reject_reason = ? WHERE uri = ?")
            .bind(status.as_str())
            .bind(reject_reason)
            .bind(uri)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Followers
    // =========================================================================

    /// Create or re-activate a follower edge.
    ///
    /// The partial unique index on (local_actor_id, remote_actor_uri) for
    /// non-undone rows keeps at most one active edge per pair; a repeated
    /// Follow updates the existing edge in place.
    pub async fn upsert_follower(&self, edge: &FollowerEdge) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO followers
                (id, local_actor_id, remote_actor_uri, inbox_uri, shared_inbox_uri,
                 follow_activity_uri, state, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(local_actor_id, remote_actor_uri) WHERE state != 'undone'
            DO UPDATE SET
                inbox_uri = excluded.inbox_uri,
                shared_inbox_uri = excluded.shared_inbox_uri,
                follow_activity_uri = excluded.follow_activity_uri,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&edge.id)
        .bind(&edge.local_actor_id)
        .bind(&edge.remote_actor_uri)
        .bind(&edge.inbox_uri)
        .bind(&edge.shared_inbox_uri)
        .bind(&edge.follow_activity_uri)
        .bind(&edge.state)
        .bind(edge.created_at)
        .bind(edge.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All accepted follower edges for a local actor.
    pub async fn get_accepted_followers(
        &self,
        local_actor_id: &str,
    ) -> Result<Vec<FollowerEdge>, AppError> {
        let edges = sqlx::query_as::<_, FollowerEdge>(
            "SELECT * FROM followers WHERE local_actor_id = ? AND state = 'accepted' ORDER BY id DESC",
        )
        .bind(local_actor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(edges)
    }

    /// Keyset page of accepted followers (newest first, ids below `max_id`).
    pub async fn get_follower_page(
        &self,
        local_actor_id: &str,
        max_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<FollowerEdge>, AppError> {
        let edges = match max_id {
            Some(max_id) => {
                sqlx::query_as::<_, FollowerEdge>(
                    r#"
                    SELECT * FROM followers
                    WHERE local_actor_id = ? AND state = 'accepted' AND id < ?
                    ORDER BY id DESC LIMIT ?
                    "#,
                )
                .bind(local_actor_id)
                .bind(max_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, FollowerEdge>(
                    r#"
                    SELECT * FROM followers
                    WHERE local_actor_id = ? AND state = 'accepted'
                    ORDER BY id DESC LIMIT ?
                    "#,
                )
                .bind(local_actor_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(edges)
    }

    /// Count accepted followers for a local actor.
    pub async fn count_accepted_followers(&self, local_actor_id: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM followers WHERE local_actor_id = ? AND state = 'accepted'",
        )
        .bind(local_actor_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Mark the edge created by `follow_activity_uri` as undone.
    ///
    /// The edge must belong to `remote_actor_uri`: only the original
    /// follower can undo its own Follow.
    ///
    /// # Returns
    /// `true` if an active edge was transitioned.
    pub async fn undo_follower_by_activity_uri(
        &self,
        follow_activity_uri: &str,
        remote_actor_uri: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE followers SET state = 'undone', updated_at = ?
            WHERE follow_activity_uri = ? AND remote_actor_uri = ? AND state != 'undone'
            "#,
        )
        .bind(updated_at)
        .bind(follow_activity_uri)
        .bind(remote_actor_uri)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark the active edge for (local, remote) as undone.
    ///
    /// Fallback for minimal Undo payloads that omit the Follow id.
    pub async fn undo_follower_by_pair(
        &self,
        local_actor_id: &str,
        remote_actor_uri: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE followers SET state = 'undone', updated_at = ?
            WHERE local_actor_id = ? AND remote_actor_uri = ? AND state != 'undone'
            "#,
        )
        .bind(updated_at)
        .bind(local_actor_id)
        .bind(remote_actor_uri)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Notes
    // =========================================================================

    /// Insert a note row.
    pub async fn insert_note(&self, note: &Note) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO notes
                (id, local_actor_id, remote_actor_uri, object_uri, content_url,
                 content, in_reply_to_uri, published_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&note.id)
        .bind(&note.local_actor_id)
        .bind(&note.remote_actor_uri)
        .bind(&note.object_uri)
        .bind(&note.content_url)
        .bind(&note.content)
        .bind(&note.in_reply_to_uri)
        .bind(note.published_at)
        .bind(note.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Update content and updated timestamp of an existing note.
    ///
    /// The object URI is deliberately not touched: it is stable for the
    /// life of the content.
    pub async fn update_note_content(
        &self,
        note_id: &str,
        content: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE notes SET content = ?, updated_at = ? WHERE id = ?")
            .bind(content)
            .bind(updated_at)
            .bind(note_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Look up a local note by its upsert key.
    pub async fn get_note_by_content_url(
        &self,
        local_actor_id: &str,
        content_url: &str,
    ) -> Result<Option<Note>, AppError> {
        let note = sqlx::query_as::<_, Note>(
            "SELECT * FROM notes WHERE local_actor_id = ? AND content_url = ?",
        )
        .bind(local_actor_id)
        .bind(content_url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(note)
    }

    /// Look up any note (local or remote) by object URI.
    pub async fn get_note_by_object_uri(&self, object_uri: &str) -> Result<Option<Note>, AppError> {
        let note = sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE object_uri = ?")
            .bind(object_uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(note)
    }

    /// Keyset page of a local actor's notes (newest first).
    pub async fn get_local_notes_page(
        &self,
        local_actor_id: &str,
        max_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Note>, AppError> {
        let notes = match max_id {
            Some(max_id) => {
                sqlx::query_as::<_, Note>(
                    r#"
                    SELECT * FROM notes
                    WHERE local_actor_id = ? AND id < ?
                    ORDER BY id DESC LIMIT ?
                    "#,
                )
                .bind(local_actor_id)
                .bind(max_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Note>(
                    r#"
                    SELECT * FROM notes
                    WHERE local_actor_id = ?
                    ORDER BY id DESC LIMIT ?
                    "#,
                )
                .bind(local_actor_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(notes)
    }

    /// Count a local actor's notes.
    pub async fn count_local_notes(&self, local_actor_id: &str) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM notes WHERE local_actor_id = ?")
                .bind(local_actor_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// Delete a note row (used for local deletes and remote Tombstones).
    pub async fn delete_note(&self, note_id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM note_interactions WHERE note_id = ?")
            .bind(note_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM notes WHERE id = ?")
            .bind(note_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Interactions
    // =========================================================================

    /// Record a like/announce against a local note, idempotently.
    ///
    /// # Returns
    /// `true` if a new row was inserted, `false` if the (note, actor, kind)
    /// interaction already existed.
    pub async fn insert_interaction(
        &self,
        interaction: &NoteInteraction,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO note_interactions
                (id, note_id, remote_actor_uri, kind, activity_uri, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(note_id, remote_actor_uri, kind) DO NOTHING
            "#,
        )
        .bind(&interaction.id)
        .bind(&interaction.note_id)
        .bind(&interaction.remote_actor_uri)
        .bind(&interaction.kind)
        .bind(&interaction.activity_uri)
        .bind(interaction.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Remove the interaction created by a given activity URI (Undo).
    ///
    /// Constrained to the acting remote actor: only the interaction's
    /// author can undo it.
    ///
    /// # Returns
    /// `true` if a row was removed.
    pub async fn delete_interaction_by_activity_uri(
        &self,
        activity_uri: &str,
        remote_actor_uri: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "DELETE FROM note_interactions WHERE activity_uri = ? AND remote_actor_uri = ?",
        )
        .bind(activity_uri)
        .bind(remote_actor_uri)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove an interaction by its (note, actor, kind) key.
    ///
    /// Fallback for Undo payloads that reference the note instead of the
    /// original Like/Announce activity.
    pub async fn delete_interaction_by_pair(
        &self,
        note_id: &str,
        remote_actor_uri: &str,
        kind: InteractionKind,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "DELETE FROM note_interactions WHERE note_id = ? AND remote_actor_uri = ? AND kind = ?",
        )
        .bind(note_id)
        .bind(remote_actor_uri)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Count interactions of a kind for a note.
    pub async fn count_interactions(
        &self,
        note_id: &str,
        kind: InteractionKind,
    ) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM note_interactions WHERE note_id = ? AND kind = ?",
        )
        .bind(note_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    // =========================================================================
    // Delivery tasks
    // =========================================================================

    /// Insert a delivery task.
    pub async fn insert_delivery_task(&self, task: &DeliveryTask) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_tasks
                (id, local_actor_id, inbox_uri, payload, attempts, next_attempt_at,
                 status, last_error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.local_actor_id)
        .bind(&task.inbox_uri)
        .bind(&task.payload)
        .bind(task.attempts)
        .bind(task.next_attempt_at)
        .bind(&task.status)
        .bind(&task.last_error)
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Claim due pending tasks, atomically.
    ///
    /// The single UPDATE flips status to `inflight` and bumps the attempt
    /// counter before returning the claimed rows, so two dispatcher
    /// instances can never claim the same task.
    pub async fn claim_due_delivery_tasks(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeliveryTask>, AppError> {
        let tasks = sqlx::query_as::<_, DeliveryTask>(
            r#"
            UPDATE delivery_tasks
            SET status = 'inflight', attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM delivery_tasks
                WHERE status = 'pending' AND next_attempt_at <= ?
                ORDER BY next_attempt_at
                LIMIT ?
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(tasks)
    }

    /// Mark a task delivered (terminal).
    pub async fn mark_task_delivered(&self, task_id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE delivery_tasks SET status = 'delivered', last_error = NULL WHERE id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Put a task back in the queue for a later attempt.
    pub async fn reschedule_task(
        &self,
        task_id: &str,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE delivery_tasks
            SET status = 'pending', next_attempt_at = ?, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(next_attempt_at)
        .bind(last_error)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark a task failed (terminal, retries exhausted).
    pub async fn mark_task_failed(&self, task_id: &str, last_error: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE delivery_tasks SET status = 'failed', last_error = ? WHERE id = ?")
            .bind(last_error)
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Fetch a task by id (used by tests and operator tooling).
    pub async fn get_delivery_task(&self, task_id: &str) -> Result<Option<DeliveryTask>, AppError> {
        let task = sqlx::query_as::<_, DeliveryTask>("SELECT * FROM delivery_tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(task)
    }

    /// All tasks for an inbox URI (used by tests and operator tooling).
    pub async fn get_delivery_tasks_for_inbox(
        &self,
        inbox_uri: &str,
    ) -> Result<Vec<DeliveryTask>, AppError> {
        let tasks = sqlx::query_as::<_, DeliveryTask>(
            "SELECT * FROM delivery_tasks WHERE inbox_uri = ? ORDER BY created_at",
        )
        .bind(inbox_uri)
        .fetch_all(&self.pool)
        .await?;

        Ok(tasks)
    }

    /// Count tasks currently pending.
    pub async fn count_pending_tasks(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM delivery_tasks WHERE status = 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
