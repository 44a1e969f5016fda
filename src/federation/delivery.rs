//! Outbound activity delivery
//!
//! Fans an activity out to follower inboxes as persistent delivery tasks,
//! then works the queue in the background: claim-once task pickup, signed
//! POSTs with bounded concurrency, exponential backoff, and per-recipient
//! failure isolation. Publishing callers only enqueue; delivery outcomes
//! surface exclusively through logs and metrics.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::Semaphore;

use crate::data::{
    ActivityDirection, ActivityRecord, ActivityStatus, Database, DeliveryStatus, DeliveryTask,
    EntityId, FollowerEdge, LocalActor,
};
use crate::error::{AppError, DeliveryError};
use crate::metrics::{DELIVERY_ATTEMPTS_TOTAL, DELIVERY_DURATION_SECONDS, DELIVERY_TASKS_PENDING};

/// Tasks claimed per worker pass.
const CLAIM_BATCH: u32 = 50;

/// Backoff ceiling so late retries stay within an operational horizon.
const MAX_BACKOFF_SECONDS: i64 = 3600;

/// Collapse follower edges to distinct delivery targets.
///
/// Followers advertising a shared inbox are delivered to once through it;
/// the rest keep their personal inboxes. Identical URIs are deduplicated
/// while distinct personal inboxes on the same domain are preserved.
pub fn collapse_recipient_inboxes(edges: &[FollowerEdge]) -> Vec<String> {
    use std::collections::HashSet;

    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for edge in edges {
        let inbox = edge
            .shared_inbox_uri
            .as_deref()
            .unwrap_or(&edge.inbox_uri)
            .to_string();
        if seen.insert(inbox.clone()) {
            targets.push(inbox);
        }
    }

    targets
}

/// Outbound delivery dispatcher
#[derive(Clone)]
pub struct DeliveryDispatcher {
    db: Arc<Database>,
    http_client: Arc<reqwest::Client>,
    base_url: String,
    max_attempts: u32,
    base_backoff_seconds: u64,
    concurrency: usize,
}

impl DeliveryDispatcher {
    /// Create a new dispatcher.
    pub fn new(
        db: Arc<Database>,
        http_client: Arc<reqwest::Client>,
        base_url: String,
        max_attempts: u32,
        base_backoff_seconds: u64,
        concurrency: usize,
    ) -> Self {
        Self {
            db,
            http_client,
            base_url,
            max_attempts,
            base_backoff_seconds,
            concurrency: concurrency.max(1),
        }
    }

    /// Fan an activity out to all accepted followers of `local_actor`.
    ///
    /// Records the outbound activity, collapses recipients behind shared
    /// inboxes, and enqueues one task per distinct inbox. Returns the
    /// number of tasks created.
    pub async fn fan_out(
        &self,
        activity: &serde_json::Value,
        local_actor: &LocalActor,
    ) -> Result<usize, AppError> {
        self.record_outbound(activity, local_actor).await?;

        let followers = self.db.get_accepted_followers(&local_actor.id).await?;
        let total = followers.len();
        let targets = collapse_recipient_inboxes(&followers);

        tracing::info!(
            actor = %local_actor.username,
            targets = targets.len(),
            followers = total,
            "Enqueueing delivery fan-out"
        );

        let payload = serde_json::to_string(activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;
        let now = Utc::now();

        for inbox_uri in &targets {
            let task = DeliveryTask {
                id: EntityId::new().0,
                local_actor_id: local_actor.id.clone(),
                inbox_uri: inbox_uri.clone(),
                payload: payload.clone(),
                attempts: 0,
                next_attempt_at: now,
                status: DeliveryStatus::Pending.as_str().to_string(),
                last_error: None,
                created_at: now,
            };
            self.db.insert_delivery_task(&task).await?;
        }

        self.update_pending_gauge().await;
        Ok(targets.len())
    }

    /// Enqueue an activity for a single recipient inbox (e.g. an Accept
    /// back to a new follower).
    pub async fn enqueue_to_inbox(
        &self,
        activity: &serde_json::Value,
        local_actor: &LocalActor,
        inbox_uri: &str,
    ) -> Result<(), AppError> {
        self.record_outbound(activity, local_actor).await?;

        let payload = serde_json::to_string(activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;
        let now = Utc::now();

        let task = DeliveryTask {
            id: EntityId::new().0,
            local_actor_id: local_actor.id.clone(),
            inbox_uri: inbox_uri.to_string(),
            payload,
            attempts: 0,
            next_attempt_at: now,
            status: DeliveryStatus::Pending.as_str().to_string(),
            last_error: None,
            created_at: now,
        };
        self.db.insert_delivery_task(&task).await?;

        self.update_pending_gauge().await;
        Ok(())
    }

    /// Claim and work all currently-due tasks once.
    ///
    /// Tasks run concurrently under a semaphore; one unreachable recipient
    /// never stalls the rest. Returns the number of tasks processed.
    pub async fn run_due_tasks_once(&self) -> Result<usize, AppError> {
        let tasks = self
            .db
            .claim_due_delivery_tasks(Utc::now(), CLAIM_BATCH)
            .await?;

        if tasks.is_empty() {
            return Ok(0);
        }

        let count = tasks.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(count);

        for task in tasks {
            let semaphore = semaphore.clone();
            let dispatcher = self.clone();

            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                dispatcher.work_task(task).await;
            }));
        }

        for handle in handles {
            // A panicked delivery future only loses that task's attempt;
            // the row stays inflight and is ignored until operator action.
            let _ = handle.await;
        }

        self.update_pending_gauge().await;
        Ok(count)
    }

    /// Deliver one claimed task and settle its row.
    async fn work_task(&self, task: DeliveryTask) {
        let timer = std::time::Instant::now();
        let outcome = self.attempt(&task).await;

        match outcome {
            Ok(()) => {
                DELIVERY_ATTEMPTS_TOTAL
                    .with_label_values(&["delivered"])
                    .inc();
                DELIVERY_DURATION_SECONDS
                    .with_label_values(&["delivered"])
                    .observe(timer.elapsed().as_secs_f64());

                if let Err(e) = self.db.mark_task_delivered(&task.id).await {
                    tracing::error!(task = %task.id, error = %e, "Failed to mark task delivered");
                } else {
                    tracing::info!(inbox = %task.inbox_uri, "Delivered activity");
                }
            }
            Err(delivery_error) => {
                DELIVERY_DURATION_SECONDS
                    .with_label_values(&["error"])
                    .observe(timer.elapsed().as_secs_f64());

                // attempts was already incremented by the claim.
                if task.attempts >= self.max_attempts as i64 {
                    DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["failed"]).inc();
                    let terminal = DeliveryError::ExhaustedRetries(task.attempts as u32);
                    tracing::warn!(
                        inbox = %task.inbox_uri,
                        attempts = task.attempts,
                        error = %delivery_error,
                        "Delivery retries exhausted"
                    );
                    if let Err(e) = self.db.mark_task_failed(&task.id, &terminal.to_string()).await
                    {
                        tracing::error!(task = %task.id, error = %e, "Failed to mark task failed");
                    }
                } else {
                    DELIVERY_ATTEMPTS_TOTAL
                        .with_label_values(&["retried"])
                        .inc();
                    let next_attempt_at = Utc::now() + self.backoff_delay(task.attempts);
                    tracing::debug!(
                        inbox = %task.inbox_uri,
                        attempts = task.attempts,
                        next_attempt = %next_attempt_at,
                        error = %delivery_error,
                        "Delivery attempt failed, rescheduling"
                    );
                    if let Err(e) = self
                        .db
                        .reschedule_task(&task.id, next_attempt_at, &delivery_error.to_string())
                        .await
                    {
                        tracing::error!(task = %task.id, error = %e, "Failed to reschedule task");
                    }
                }
            }
        }
    }

    /// Sign and POST the payload to the task's inbox.
    async fn attempt(&self, task: &DeliveryTask) -> Result<(), DeliveryError> {
        let actor = self
            .db
            .get_local_actor_by_id(&task.local_actor_id)
            .await
            .map_err(|e| DeliveryError::TransientNetwork(e.to_string()))?
            .ok_or_else(|| {
                DeliveryError::TransientNetwork(format!(
                    "signing actor {} not found",
                    task.local_actor_id
                ))
            })?;

        let body = task.payload.as_bytes();
        let sig_headers = crate::federation::sign_request(
            "POST",
            &task.inbox_uri,
            Some(body),
            &actor.private_key_pem,
            &actor.key_id(&self.base_url),
        )
        .map_err(|e| DeliveryError::TransientNetwork(e.to_string()))?;

        let mut request = self
            .http_client
            .post(&task.inbox_uri)
            .header("Content-Type", "application/activity+json")
            .header("Date", sig_headers.date)
            .header("Signature", sig_headers.signature);

        if let Some(digest) = sig_headers.digest {
            request = request.header("Digest", digest);
        }

        let response = request
            .body(task.payload.clone())
            .send()
            .await
            .map_err(|e| DeliveryError::TransientNetwork(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DeliveryError::PermanentRejection(
                response.status().as_u16(),
            ));
        }

        Ok(())
    }

    fn backoff_delay(&self, attempts: i64) -> Duration {
        backoff_delay(self.base_backoff_seconds, attempts)
    }

    /// Record the outbound activity for audit, keyed by URI.
    async fn record_outbound(
        &self,
        activity: &serde_json::Value,
        local_actor: &LocalActor,
    ) -> Result<(), AppError> {
        let Some(uri) = activity.get("id").and_then(|v| v.as_str()) else {
            return Ok(());
        };

        let record = ActivityRecord {
            uri: uri.to_string(),
            activity_type: activity
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown")
                .to_string(),
            actor_uri: local_actor.actor_uri(&self.base_url),
            document: activity.to_string(),
            direction: ActivityDirection::Outbound.as_str().to_string(),
            status: ActivityStatus::Applied.as_str().to_string(),
            reject_reason: None,
            created_at: Utc::now(),
        };

        self.db.insert_activity_if_new(&record).await?;
        Ok(())
    }

    async fn update_pending_gauge(&self) {
        if let Ok(pending) = self.db.count_pending_tasks().await {
            DELIVERY_TASKS_PENDING.set(pending);
        }
    }
}

/// Exponential backoff: base * 2^(attempts-1), capped.
fn backoff_delay(base_backoff_seconds: u64, attempts: i64) -> Duration {
    let exponent = (attempts.max(1) - 1).min(16) as u32;
    let seconds = (base_backoff_seconds as i64)
        .saturating_mul(1i64 << exponent)
        .min(MAX_BACKOFF_SECONDS);
    Duration::seconds(seconds)
}

/// Background delivery worker loop.
///
/// Spawned once from the binary; polls for due tasks on an interval.
pub async fn run_delivery_worker(dispatcher: Arc<DeliveryDispatcher>, poll_interval_seconds: u64) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(poll_interval_seconds.max(1)));

    loop {
        interval.tick().await;

        match dispatcher.run_due_tasks_once().await {
            Ok(0) => {}
            Ok(count) => tracing::debug!(count, "Delivery worker pass complete"),
            Err(e) => tracing::error!(error = %e, "Delivery worker pass failed"),
        }
    }
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    pub const PUBLIC_AUDIENCE: &str = "https://www.w3.org/ns/activitystreams#Public";

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Original activity being accepted (usually a Follow)
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Create activity wrapping an object
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (creator)
    /// * `object` - Object being created (usually a Note)
    pub fn create(id: &str, actor: &str, object: Value, published: &str) -> Value {
        let followers = format!("{}/followers", actor);
        serde_json::json!({
            "@context": [
                "https://www.w3.org/ns/activitystreams",
                "https://w3id.org/security/v1"
            ],
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": [PUBLIC_AUDIENCE],
            "cc": [followers],
            "published": published
        })
    }

    /// Build an Update activity for an edited object
    pub fn update(id: &str, actor: &str, object: Value, published: &str) -> Value {
        let followers = format!("{}/followers", actor);
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Update",
            "id": id,
            "actor": actor,
            "object": object,
            "to": [PUBLIC_AUDIENCE],
            "cc": [followers],
            "published": published
        })
    }

    /// Build a Delete activity (Tombstone object)
    pub fn delete(id: &str, actor: &str, object_uri: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Delete",
            "id": id,
            "actor": actor,
            "object": {
                "type": "Tombstone",
                "id": object_uri
            },
            "to": [PUBLIC_AUDIENCE]
        })
    }

    /// Build a Note object
    ///
    /// # Arguments
    /// * `id` - Note ID (unique URI)
    /// * `attributed_to` - Actor URI (author)
    /// * `content` - HTML content
    /// * `published` - Publication timestamp (RFC3339)
    /// * `in_reply_to` - URI of the note being replied to, if any
    pub fn note(
        id: &str,
        attributed_to: &str,
        content: &str,
        published: &str,
        in_reply_to: Option<&str>,
    ) -> Value {
        let followers = format!("{}/followers", attributed_to);
        let mut object = serde_json::json!({
            "type": "Note",
            "id": id,
            "attributedTo": attributed_to,
            "content": content,
            "published": published,
            "to": [PUBLIC_AUDIENCE],
            "cc": [followers]
        });
        if let Some(reply_uri) = in_reply_to {
            object["inReplyTo"] = serde_json::json!(reply_uri);
        }
        object
    }
}
