//! Local content publishing
//!
//! Creates canonical note objects for local content and hands the
//! corresponding Create/Update/Delete activities to the delivery
//! dispatcher. Publishing is fire-and-forget relative to delivery: a
//! local publish never fails because a follower's inbox is unreachable.

use std::sync::Arc;

use chrono::Utc;

use crate::data::{Database, EntityId, LocalActor, Note};
use crate::error::AppError;
use crate::federation::{DeliveryDispatcher, builder, generate_keypair};

/// Publisher for locally authored content.
pub struct OutboxPublisher {
    db: Arc<Database>,
    dispatcher: Arc<DeliveryDispatcher>,
    base_url: String,
}

impl OutboxPublisher {
    /// Create a new publisher.
    pub fn new(db: Arc<Database>, dispatcher: Arc<DeliveryDispatcher>, base_url: String) -> Self {
        Self {
            db,
            dispatcher,
            base_url,
        }
    }

    /// Provision a local actor, generating its key pair if absent.
    ///
    /// Idempotent: an existing actor is returned unchanged, keys are never
    /// regenerated.
    pub async fn provision_actor(
        &self,
        username: &str,
        display_name: Option<String>,
        summary: Option<String>,
    ) -> Result<LocalActor, AppError> {
        if let Some(existing) = self.db.get_local_actor_by_username(username).await? {
            return Ok(existing);
        }

        // Key generation is CPU-bound; keep it off the async executor.
        let keys = tokio::task::spawn_blocking(generate_keypair)
            .await
            .map_err(|e| AppError::Internal(e.into()))??;

        let now = Utc::now();
        let actor = LocalActor {
            id: EntityId::new().0,
            username: username.to_string(),
            display_name,
            summary,
            private_key_pem: keys.private_key_pem,
            public_key_pem: keys.public_key_pem,
            created_at: now,
            updated_at: now,
        };

        if !self.db.insert_local_actor(&actor).await? {
            // Lost a provisioning race; the winner's row is authoritative.
            return self
                .db
                .get_local_actor_by_username(username)
                .await?
                .ok_or_else(|| {
                    AppError::Internal(anyhow::anyhow!(
                        "actor {} vanished after insert conflict",
                        username
                    ))
                });
        }

        tracing::info!(username = %actor.username, "Local actor provisioned");
        Ok(actor)
    }

    /// Publish or update local content, keyed on (actor, content_url).
    ///
    /// A second publish with the same key updates content and timestamp in
    /// place, preserving the object URI, and fans out an Update instead of
    /// a Create. Safe to call on every save of the underlying content.
    pub async fn upsert_note(
        &self,
        local_actor: &LocalActor,
        content: &str,
        content_url: &str,
    ) -> Result<Note, AppError> {
        let actor_uri = local_actor.actor_uri(&self.base_url);
        let now = Utc::now();

        match self
            .db
            .get_note_by_content_url(&local_actor.id, content_url)
            .await?
        {
            Some(existing) => {
                self.db
                    .update_note_content(&existing.id, content, now)
                    .await?;
                let note = Note {
                    content: content.to_string(),
                    updated_at: now,
                    ..existing
                };

                let object = self.note_object(&note, local_actor);
                let update_id = format!("{}#updates/{}", note.object_uri, now.timestamp());
                let activity =
                    builder::update(&update_id, &actor_uri, object, &now.to_rfc3339());
                self.dispatcher.fan_out(&activity, local_actor).await?;

                tracing::info!(object = %note.object_uri, "Note updated");
                Ok(note)
            }
            None => {
                let note = Note {
                    id: EntityId::new().0,
                    local_actor_id: Some(local_actor.id.clone()),
                    remote_actor_uri: None,
                    object_uri: format!("{}/notes/{}", actor_uri, EntityId::new().0),
                    content_url: content_url.to_string(),
                    content: content.to_string(),
                    in_reply_to_uri: None,
                    published_at: now,
                    updated_at: now,
                };
                self.db.insert_note(&note).await?;

                let object = self.note_object(&note, local_actor);
                let create_id = format!("{}/activities/{}", self.base_url, EntityId::new().0);
                let activity =
                    builder::create(&create_id, &actor_uri, object, &now.to_rfc3339());
                self.dispatcher.fan_out(&activity, local_actor).await?;

                tracing::info!(object = %note.object_uri, "Note published");
                Ok(note)
            }
        }
    }

    /// Delete local content by its source URL, announcing a Tombstone.
    ///
    /// # Returns
    /// `false` if no note matched (nothing to do).
    pub async fn delete_note(
        &self,
        local_actor: &LocalActor,
        content_url: &str,
    ) -> Result<bool, AppError> {
        let Some(note) = self
            .db
            .get_note_by_content_url(&local_actor.id, content_url)
            .await?
        else {
            return Ok(false);
        };

        let delete_id = format!("{}/activities/{}", self.base_url, EntityId::new().0);
        let activity = builder::delete(
            &delete_id,
            &local_actor.actor_uri(&self.base_url),
            &note.object_uri,
        );
        self.dispatcher.fan_out(&activity, local_actor).await?;

        self.db.delete_note(&note.id).await?;
        tracing::info!(object = %note.object_uri, "Note deleted");
        Ok(true)
    }

    /// The canonical JSON representation of a local note.
    pub fn note_object(&self, note: &Note, local_actor: &LocalActor) -> serde_json::Value {
        builder::note(
            &note.object_uri,
            &local_actor.actor_uri(&self.base_url),
            &note.content,
            &note.published_at.to_rfc3339(),
            note.in_reply_to_uri.as_deref(),
        )
    }
}
