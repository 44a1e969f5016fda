//! Inbox activity processing
//!
//! The state machine for verified inbound activities: parse into a closed
//! typed variant, pass the URI-dedup gate, apply the per-type side effect,
//! and record the outcome on the activity row. Side effects are idempotent
//! so at-least-once delivery from peers yields at-most-once application.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::data::{
    ActivityDirection, ActivityRecord, ActivityStatus, Database, EntityId, FollowState,
    FollowerEdge, InteractionKind, LocalActor, Note, NoteInteraction, RemoteActor,
};
use crate::error::{AppError, ProcessingError};
use crate::federation::delivery::{DeliveryDispatcher, builder};
use crate::metrics::ACTIVITIES_RECEIVED_TOTAL;

fn sanitize_remote_html(content: &str) -> String {
    ammonia::clean(content)
}

/// Extract a URI from a field that may be a string or an object with `id`.
fn extract_object_reference(value: &Value) -> Option<String> {
    value
        .as_str()
        .or_else(|| value.get("id").and_then(|id| id.as_str()))
        .map(str::to_string)
}

/// The prior activity referenced by an Undo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoObject {
    /// Bare prior-activity URI
    Reference(String),
    /// Embedded prior activity
    Embedded {
        kind: String,
        id: Option<String>,
        target: Option<String>,
    },
}

/// Closed set of inbound activity shapes.
///
/// Adding a type is a compile-time-checked extension point: every match
/// over this enum is exhaustive.
#[derive(Debug, Clone)]
pub enum InboundActivity {
    Follow { target: String },
    Like { object_uri: String },
    Announce { object_uri: String },
    Create { object: Value },
    Delete { object_uri: String },
    Undo { object: UndoObject },
    Unknown { kind: String },
}

/// Extract the deleted object URI from a Delete activity's object field.
///
/// Accepts a bare URI, a Tombstone object, or any object carrying an id.
fn extract_delete_target(object: &Value) -> Option<String> {
    if let Some(uri) = object.as_str() {
        return Some(uri.to_string());
    }

    object
        .get("id")
        .and_then(|id| id.as_str())
        .or_else(|| object.get("object").and_then(|o| o.as_str()))
        .map(str::to_string)
}

/// A deserialized inbound activity with its validated payload.
#[derive(Debug, Clone)]
pub struct ParsedActivity {
    /// Activity URI (the deduplication key)
    pub uri: String,
    /// Actor URI claimed by the activity
    pub actor_uri: String,
    /// Raw type string, kept for the audit record
    pub kind: String,
    pub detail: InboundActivity,
}

impl ParsedActivity {
    /// Parse a raw activity document.
    ///
    /// Requires `id`, `actor`, and `type`; per-type payload requirements
    /// are validated here so handlers receive well-formed shapes.
    pub fn parse(raw: &Value) -> Result<Self, ProcessingError> {
        let uri = raw
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProcessingError::MalformedActivity("missing id".to_string()))?
            .to_string();

        let actor_uri = raw
            .get("actor")
            .and_then(extract_object_reference)
            .ok_or_else(|| ProcessingError::MalformedActivity("missing actor".to_string()))?;

        let kind = raw
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProcessingError::MalformedActivity("missing type".to_string()))?
            .to_string();

        let object = raw.get("object");
        let require_reference = |field: &str| -> Result<String, ProcessingError> {
            object
                .and_then(extract_object_reference)
                .ok_or_else(|| ProcessingError::MalformedActivity(format!("missing {}", field)))
        };

        let detail = match kind.as_str() {
            "Follow" => InboundActivity::Follow {
                target: require_reference("Follow object")?,
            },
            "Like" => InboundActivity::Like {
                object_uri: require_reference("Like object")?,
            },
            "Announce" => InboundActivity::Announce {
                object_uri: require_reference("Announce object")?,
            },
            "Create" => InboundActivity::Create {
                object: object
                    .cloned()
                    .ok_or_else(|| {
                        ProcessingError::MalformedActivity("missing Create object".to_string())
                    })?,
            },
            "Delete" => InboundActivity::Delete {
                object_uri: object.and_then(extract_delete_target).ok_or_else(|| {
                    ProcessingError::MalformedActivity("missing Delete object".to_string())
                })?,
            },
            "Undo" => {
                let object = object.ok_or_else(|| {
                    ProcessingError::MalformedActivity("missing Undo object".to_string())
                })?;

                let undo_object = if let Some(uri) = object.as_str() {
                    UndoObject::Reference(uri.to_string())
                } else if let Some(kind) = object.get("type").and_then(|v| v.as_str()) {
                    UndoObject::Embedded {
                        kind: kind.to_string(),
                        id: object.get("id").and_then(|v| v.as_str()).map(str::to_string),
                        target: object.get("object").and_then(extract_object_reference),
                    }
                } else if let Some(id) = object.get("id").and_then(|v| v.as_str()) {
                    UndoObject::Reference(id.to_string())
                } else {
                    return Err(ProcessingError::MalformedActivity(
                        "Undo object has neither type nor id".to_string(),
                    ));
                };

                InboundActivity::Undo {
                    object: undo_object,
                }
            }
            other => InboundActivity::Unknown {
                kind: other.to_string(),
            },
        };

        Ok(Self {
            uri,
            actor_uri,
            kind,
            detail,
        })
    }
}

/// Result of processing one inbound activity.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Side effect applied (or a benign no-op, e.g. Undo without a match)
    Applied,
    /// Activity URI already processed; nothing done
    Duplicate,
    /// Recorded as rejected; the HTTP layer still acknowledges receipt
    Rejected(ProcessingError),
}

/// Inbox activity processor
pub struct InboxProcessor {
    db: Arc<Database>,
    dispatcher: Arc<DeliveryDispatcher>,
    /// Instance base URL, e.g. "https://social.example.com"
    base_url: String,
    /// Instance domain (authority), for local-target checks
    domain: String,
}

impl InboxProcessor {
    /// Create a new processor.
    pub fn new(
        db: Arc<Database>,
        dispatcher: Arc<DeliveryDispatcher>,
        base_url: String,
        domain: String,
    ) -> Self {
        Self {
            db,
            dispatcher,
            base_url,
            domain,
        }
    }

    /// Process a verified inbound activity.
    ///
    /// `signer` is the actor authenticated by the HTTP signature; the
    /// activity's `actor` field must match it.
    ///
    /// Benign failures (unsupported type, non-local target, malformed
    /// payload) come back as `ProcessOutcome::Rejected`; only
    /// infrastructure failures surface as `Err`.
    pub async fn process(
        &self,
        raw: Value,
        signer: &RemoteActor,
    ) -> Result<ProcessOutcome, AppError> {
        let parsed = match ParsedActivity::parse(&raw) {
            Ok(parsed) => parsed,
            Err(reason) => {
                tracing::info!(actor = %signer.uri, %reason, "Rejected unparseable activity");
                ACTIVITIES_RECEIVED_TOTAL
                    .with_label_values(&["invalid", "rejected"])
                    .inc();
                return Ok(ProcessOutcome::Rejected(reason));
            }
        };

        if parsed.actor_uri != signer.uri {
            let reason = ProcessingError::MalformedActivity(format!(
                "activity actor {} does not match signer {}",
                parsed.actor_uri, signer.uri
            ));
            tracing::warn!(%reason, "Rejected spoofed activity");
            ACTIVITIES_RECEIVED_TOTAL
                .with_label_values(&[parsed.kind.as_str(), "rejected"])
                .inc();
            return Ok(ProcessOutcome::Rejected(reason));
        }

        // Deduplication gate: the activities.uri unique constraint decides
        // atomically which of two concurrent deliveries proceeds.
        let record = ActivityRecord {
            uri: parsed.uri.clone(),
            activity_type: parsed.kind.clone(),
            actor_uri: parsed.actor_uri.clone(),
            document: raw.to_string(),
            direction: ActivityDirection::Inbound.as_str().to_string(),
            status: ActivityStatus::Received.as_str().to_string(),
            reject_reason: None,
            created_at: Utc::now(),
        };

        if !self.db.insert_activity_if_new(&record).await? {
            let resumable = matches!(
                self.db.get_activity(&parsed.uri).await?,
                Some(existing) if existing.status == ActivityStatus::Received.as_str()
            );
            if !resumable {
                tracing::debug!(uri = %parsed.uri, "Duplicate activity, short-circuiting");
                ACTIVITIES_RECEIVED_TOTAL
                    .with_label_values(&[parsed.kind.as_str(), "duplicate"])
                    .inc();
                return Ok(ProcessOutcome::Duplicate);
            }
            // A row stuck in `received` means a previous attempt died
            // mid-apply; side effects are idempotent, so reprocess.
        }

        let applied = match &parsed.detail {
            InboundActivity::Follow { target } => {
                self.apply_follow(&parsed, target, &raw, signer).await
            }
            InboundActivity::Like { object_uri } => {
                self.apply_interaction(&parsed, object_uri, InteractionKind::Like, signer)
                    .await
            }
            InboundActivity::Announce { object_uri } => {
                self.apply_interaction(&parsed, object_uri, InteractionKind::Announce, signer)
                    .await
            }
            InboundActivity::Create { object } => self.apply_create(object, signer).await,
            InboundActivity::Delete { object_uri } => self.apply_delete(object_uri, signer).await,
            InboundActivity::Undo { object } => self.apply_undo(object, signer).await,
            InboundActivity::Unknown { kind } => {
                Err(AppError::Processing(ProcessingError::UnsupportedType(
                    kind.clone(),
                )))
            }
        };

        match applied {
            Ok(()) => {
                self.db
                    .set_activity_status(&parsed.uri, ActivityStatus::Applied, None)
                    .await?;
                ACTIVITIES_RECEIVED_TOTAL
                    .with_label_values(&[parsed.kind.as_str(), "applied"])
                    .inc();
                Ok(ProcessOutcome::Applied)
            }
            Err(AppError::Processing(reason)) => {
                self.db
                    .set_activity_status(
                        &parsed.uri,
                        ActivityStatus::Rejected,
                        Some(&reason.to_string()),
                    )
                    .await?;
                tracing::info!(uri = %parsed.uri, %reason, "Activity rejected");
                ACTIVITIES_RECEIVED_TOTAL
                    .with_label_values(&[parsed.kind.as_str(), "rejected"])
                    .inc();
                Ok(ProcessOutcome::Rejected(reason))
            }
            // Infrastructure failure: leave the row in `received` so a
            // peer retry can resume the apply.
            Err(other) => Err(other),
        }
    }

    // =========================================================================
    // Activity type handlers
    // =========================================================================

    /// Follow: activate the follower edge and enqueue an Accept.
    async fn apply_follow(
        &self,
        parsed: &ParsedActivity,
        target: &str,
        raw: &Value,
        signer: &RemoteActor,
    ) -> Result<(), AppError> {
        let local = self
            .local_actor_for_target(target)
            .await?
            .ok_or_else(|| ProcessingError::TargetNotLocal(target.to_string()))?;

        let now = Utc::now();
        let edge = FollowerEdge {
            id: EntityId::new().0,
            local_actor_id: local.id.clone(),
            remote_actor_uri: signer.uri.clone(),
            inbox_uri: signer.inbox_uri.clone(),
            shared_inbox_uri: signer.shared_inbox_uri.clone(),
            follow_activity_uri: parsed.uri.clone(),
            state: FollowState::Accepted.as_str().to_string(),
            created_at: now,
            updated_at: now,
        };
        self.db.upsert_follower(&edge).await?;

        // The Accept embeds the original Follow and goes back to the
        // follower's personal inbox.
        let accept_id = format!("{}/activities/{}", self.base_url, EntityId::new().0);
        let accept = builder::accept(&accept_id, &local.actor_uri(&self.base_url), raw.clone());
        self.dispatcher
            .enqueue_to_inbox(&accept, &local, &signer.inbox_uri)
            .await?;

        tracing::info!(
            follower = %signer.uri,
            local = %local.username,
            "Follow accepted"
        );
        Ok(())
    }

    /// Like/Announce: record an interaction against a local note.
    async fn apply_interaction(
        &self,
        parsed: &ParsedActivity,
        object_uri: &str,
        kind: InteractionKind,
        signer: &RemoteActor,
    ) -> Result<(), AppError> {
        let note = self
            .db
            .get_note_by_object_uri(object_uri)
            .await?
            .filter(|note| note.local_actor_id.is_some())
            .ok_or_else(|| ProcessingError::TargetNotLocal(object_uri.to_string()))?;

        let interaction = NoteInteraction {
            id: EntityId::new().0,
            note_id: note.id.clone(),
            remote_actor_uri: signer.uri.clone(),
            kind: kind.as_str().to_string(),
            activity_uri: parsed.uri.clone(),
            created_at: Utc::now(),
        };

        if self.db.insert_interaction(&interaction).await? {
            tracing::info!(note = %note.object_uri, actor = %signer.uri, kind = kind.as_str(), "Interaction recorded");
        }
        Ok(())
    }

    /// Create: store the embedded object when it is a note; other object
    /// types stay opaque in the recorded activity document.
    async fn apply_create(&self, object: &Value, signer: &RemoteActor) -> Result<(), AppError> {
        let Some(object_type) = object.get("type").and_then(|v| v.as_str()) else {
            // Bare object references are retained opaquely.
            return Ok(());
        };

        if object_type != "Note" && object_type != "Article" {
            return Ok(());
        }

        let object_uri = object
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AppError::Processing(ProcessingError::MalformedActivity(
                    "Create object missing id".to_string(),
                ))
            })?;

        let content = sanitize_remote_html(
            object
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default(),
        );
        let published_at = object
            .get("published")
            .and_then(|v| v.as_str())
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let in_reply_to_uri = object
            .get("inReplyTo")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let content_url = object
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or(object_uri)
            .to_string();

        match self.db.get_note_by_object_uri(object_uri).await? {
            Some(existing) => {
                // Only the authoring actor may replace stored content.
                if existing.remote_actor_uri.as_deref() == Some(signer.uri.as_str()) {
                    self.db
                        .update_note_content(&existing.id, &content, Utc::now())
                        .await?;
                } else {
                    tracing::debug!(
                        object = %object_uri,
                        actor = %signer.uri,
                        "Create for object owned by another actor, ignoring"
                    );
                }
            }
            None => {
                let note = Note {
                    id: EntityId::new().0,
                    local_actor_id: None,
                    remote_actor_uri: Some(signer.uri.clone()),
                    object_uri: object_uri.to_string(),
                    content_url,
                    content,
                    in_reply_to_uri,
                    published_at,
                    updated_at: published_at,
                };
                self.db.insert_note(&note).await?;
            }
        }

        Ok(())
    }

    /// Delete: remove a stored remote note, owner-checked.
    ///
    /// Deletes of objects we never stored (the common case) are a no-op
    /// success; local notes are only deletable through the publish API.
    async fn apply_delete(&self, object_uri: &str, signer: &RemoteActor) -> Result<(), AppError> {
        let Some(note) = self.db.get_note_by_object_uri(object_uri).await? else {
            return Ok(());
        };

        if note.remote_actor_uri.as_deref() == Some(signer.uri.as_str()) {
            self.db.delete_note(&note.id).await?;
            tracing::info!(object = %object_uri, "Remote note deleted");
        } else {
            tracing::debug!(
                object = %object_uri,
                actor = %signer.uri,
                "Delete for object not owned by actor, ignoring"
            );
        }

        Ok(())
    }

    /// Undo: transition the referenced prior activity's effect.
    ///
    /// A missing prior activity is a peer-side race, not an error: the
    /// Undo succeeds as a no-op.
    async fn apply_undo(&self, object: &UndoObject, signer: &RemoteActor) -> Result<(), AppError> {
        let now = Utc::now();

        match object {
            UndoObject::Reference(prior_uri) => {
                if self
                    .db
                    .undo_follower_by_activity_uri(prior_uri, &signer.uri, now)
                    .await?
                {
                    tracing::info!(follower = %signer.uri, "Follow undone");
                } else if self
                    .db
                    .delete_interaction_by_activity_uri(prior_uri, &signer.uri)
                    .await?
                {
                    tracing::info!(actor = %signer.uri, prior = %prior_uri, "Interaction undone");
                } else {
                    tracing::debug!(prior = %prior_uri, "Undo without matching prior activity, no-op");
                }
            }
            UndoObject::Embedded { kind, id, target } => match kind.as_str() {
                "Follow" => {
                    let undone = if let Some(follow_uri) = id {
                        self.db
                            .undo_follower_by_activity_uri(follow_uri, &signer.uri, now)
                            .await?
                    } else if let Some(target) = target {
                        // Minimal Undo payloads omit the Follow id.
                        match self.local_actor_for_target(target).await? {
                            Some(local) => {
                                self.db
                                    .undo_follower_by_pair(&local.id, &signer.uri, now)
                                    .await?
                            }
                            None => false,
                        }
                    } else {
                        false
                    };

                    if undone {
                        tracing::info!(follower = %signer.uri, "Follow undone");
                    } else {
                        tracing::debug!(follower = %signer.uri, "Undo Follow without matching edge, no-op");
                    }
                }
                "Like" | "Announce" => {
                    let interaction_kind = if kind == "Like" {
                        InteractionKind::Like
                    } else {
                        InteractionKind::Announce
                    };

                    let undone = if let Some(prior_uri) = id {
                        self.db
                            .delete_interaction_by_activity_uri(prior_uri, &signer.uri)
                            .await?
                    } else if let Some(target) = target {
                        match self.db.get_note_by_object_uri(target).await? {
                            Some(note) => {
                                self.db
                                    .delete_interaction_by_pair(
                                        &note.id,
                                        &signer.uri,
                                        interaction_kind,
                                    )
                                    .await?
                            }
                            None => false,
                        }
                    } else {
                        false
                    };

                    if !undone {
                        tracing::debug!(actor = %signer.uri, kind = %kind, "Undo without matching interaction, no-op");
                    }
                }
                other => {
                    tracing::debug!(kind = %other, "Undo of unsupported prior type, no-op");
                }
            },
        }

        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Resolve a Follow target reference to a local actor, if it is one.
    ///
    /// Accepted forms: `acct:user@domain`, `user@domain`,
    /// `{base}/users/{username}`, `{base}/@{username}`.
    async fn local_actor_for_target(&self, target: &str) -> Result<Option<LocalActor>, AppError> {
        let target = target.trim();
        if target.is_empty() {
            return Ok(None);
        }

        // Handle forms first.
        let handle = target.strip_prefix("acct:").unwrap_or(target);
        if !handle.contains('/') {
            if let Some((username, domain)) = handle.trim_start_matches('@').split_once('@') {
                if domain.eq_ignore_ascii_case(&self.domain) {
                    return self.db.get_local_actor_by_username(username).await;
                }
                return Ok(None);
            }
        }

        // URI forms.
        let Ok(parsed) = url::Url::parse(target) else {
            return Ok(None);
        };
        if !self.uri_matches_local_authority(&parsed) {
            return Ok(None);
        }

        let path = parsed.path().trim_end_matches('/');
        let username = path
            .strip_prefix("/users/")
            .or_else(|| path.strip_prefix("/@"));

        match username {
            Some(username) if !username.is_empty() && !username.contains('/') => {
                self.db.get_local_actor_by_username(username).await
            }
            _ => Ok(None),
        }
    }

    fn uri_matches_local_authority(&self, parsed: &url::Url) -> bool {
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let authority = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.clone(),
        };
        let domain = self.domain.to_ascii_lowercase();

        authority == domain || host == domain
    }
}
