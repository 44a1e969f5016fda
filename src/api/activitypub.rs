//! ActivityPub endpoints
//!
//! - Actor documents
//! - Inbox (activity receiving)
//! - Outbox, followers, following collections
//! - Note objects

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::{
    Router,
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
};
use http::HeaderMap;
use serde::Deserialize;

use crate::AppState;
use crate::data::{LocalActor, Note};
use crate::error::AppError;
use crate::federation::{self, ProcessOutcome, builder};
use crate::metrics::FEDERATION_REQUESTS_TOTAL;

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor document
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:username/outbox - Outbox collection
/// - GET /users/:username/followers - Followers collection
/// - GET /users/:username/following - Following collection
/// - GET /users/:username/notes/:id - Note object
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .route("/users/:username/outbox", get(outbox))
        .route("/users/:username/followers", get(followers))
        .route("/users/:username/following", get(following))
        .route("/users/:username/notes/:id", get(note_object))
}

/// Collection paging query.
///
/// `page` selects page rendering; `max_id` is the keyset cursor (the last
/// item id of the previous page). Cursors stay stable under concurrent
/// appends because new items only ever get larger ids.
#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<String>,
    max_id: Option<String>,
}

impl PageQuery {
    fn wants_page(&self) -> bool {
        self.page.is_some()
    }
}

async fn require_local_actor(state: &AppState, username: &str) -> Result<LocalActor, AppError> {
    state
        .db
        .get_local_actor_by_username(username)
        .await?
        .ok_or(AppError::NotFound)
}

/// GET /users/:username
///
/// Returns the ActivityPub Actor document.
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let actor = require_local_actor(&state, &username).await?;

    let base_url = state.config.server.base_url();
    let actor_url = actor.actor_uri(&base_url);

    Ok(Json(serde_json::json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": "Person",
        "id": actor_url,
        "preferredUsername": actor.username,
        "name": actor.display_name.unwrap_or_else(|| actor.username.clone()),
        "summary": actor.summary.unwrap_or_default(),
        "discoverable": true,
        "inbox": format!("{}/inbox", actor_url),
        "outbox": format!("{}/outbox", actor_url),
        "followers": format!("{}/followers", actor_url),
        "following": format!("{}/following", actor_url),
        "endpoints": {
            "sharedInbox": format!("{}/inbox", base_url)
        },
        "url": actor_url,
        "publicKey": {
            "id": format!("{}#main-key", actor_url),
            "owner": actor_url,
            "publicKeyPem": actor.public_key_pem
        }
    })))
}

/// POST /users/:username/inbox
///
/// Receives incoming ActivityPub activities for one local actor.
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    require_local_actor(&state, &username).await?;

    let path = format!("/users/{}/inbox", username);
    handle_inbox_post(&state, &path, headers, body).await
}

/// POST /inbox
///
/// Shared inbox for all local actors. Remote servers deliver here once
/// instead of per-recipient.
async fn shared_inbox(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    handle_inbox_post(&state, "/inbox", headers, body).await
}

/// Shared verification-and-dispatch path for both inbox endpoints.
///
/// Unsigned or badly signed requests are rejected 4xx before processing;
/// benign processing rejections are acknowledged 2xx so peers do not
/// retry permanently-unprocessable activities.
async fn handle_inbox_post(
    state: &AppState,
    path: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    // Reject unsigned requests immediately, before any parsing.
    if headers.get("signature").is_none() {
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", "unauthorized"])
            .inc();
        return Err(AppError::Unauthorized);
    }

    let activity: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;

    let actor_id = activity
        .get("actor")
        .and_then(|a| a.as_str())
        .ok_or_else(|| AppError::Validation("Missing actor field".to_string()))?
        .to_string();

    // The keyId must point at the same actor as the activity before we
    // spend a network round-trip on key material.
    let signature_key_id =
        federation::extract_signature_key_id(&headers).map_err(AppError::Verification)?;
    if !federation::key_id_matches_actor(&signature_key_id, &actor_id) {
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", "unauthorized"])
            .inc();
        return Err(AppError::Validation(
            "Signature keyId actor mismatch".to_string(),
        ));
    }

    let signer = federation::verify_inbound(
        "POST",
        path,
        &headers,
        &body,
        &state.resolver,
        state.config.federation.clock_skew_seconds,
    )
    .await
    .inspect_err(|_| {
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", "unauthorized"])
            .inc();
    })?;

    let processor = federation::InboxProcessor::new(
        state.db.clone(),
        state.dispatcher.clone(),
        state.config.server.base_url(),
        state.config.server.domain.clone(),
    );

    match processor.process(activity, &signer).await? {
        ProcessOutcome::Applied | ProcessOutcome::Duplicate => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", "success"])
                .inc();
        }
        ProcessOutcome::Rejected(reason) => {
            // Recorded for operators; still acknowledged to the peer.
            tracing::info!(%reason, "Acknowledged rejected activity");
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", "rejected"])
                .inc();
        }
    }

    Ok(StatusCode::ACCEPTED)
}

/// GET /users/:username/outbox
///
/// OrderedCollection of the actor's Create activities, newest first,
/// paged with keyset cursors.
async fn outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let actor = require_local_actor(&state, &username).await?;

    let base_url = state.config.server.base_url();
    let outbox_url = format!("{}/outbox", actor.actor_uri(&base_url));

    if !query.wants_page() {
        let total = state.db.count_local_notes(&actor.id).await?;
        return Ok(Json(collection_envelope(&outbox_url, total)));
    }

    let page_size = state.config.federation.collection_page_size;
    let notes = state
        .db
        .get_local_notes_page(&actor.id, query.max_id.as_deref(), page_size)
        .await?;

    let items: Vec<serde_json::Value> = notes
        .iter()
        .map(|note| note_create_activity(note, &actor, &base_url))
        .collect();
    let next_cursor = page_cursor(&notes, page_size, |note| &note.id);

    Ok(Json(page_envelope(
        &outbox_url,
        query.max_id.as_deref(),
        items,
        next_cursor,
    )))
}

/// GET /users/:username/followers
///
/// OrderedCollection of follower actor URIs, newest first.
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let actor = require_local_actor(&state, &username).await?;

    let base_url = state.config.server.base_url();
    let followers_url = format!("{}/followers", actor.actor_uri(&base_url));

    if !query.wants_page() {
        let total = state.db.count_accepted_followers(&actor.id).await?;
        return Ok(Json(collection_envelope(&followers_url, total)));
    }

    let page_size = state.config.federation.collection_page_size;
    let edges = state
        .db
        .get_follower_page(&actor.id, query.max_id.as_deref(), page_size)
        .await?;

    let items: Vec<serde_json::Value> = edges
        .iter()
        .map(|edge| serde_json::json!(edge.remote_actor_uri))
        .collect();
    let next_cursor = page_cursor(&edges, page_size, |edge| &edge.id);

    Ok(Json(page_envelope(
        &followers_url,
        query.max_id.as_deref(),
        items,
        next_cursor,
    )))
}

/// GET /users/:username/following
///
/// The engine only receives follows; locally-initiated follows are not a
/// feature, so the collection is always empty.
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let actor = require_local_actor(&state, &username).await?;

    let base_url = state.config.server.base_url();
    let following_url = format!("{}/following", actor.actor_uri(&base_url));

    if !query.wants_page() {
        return Ok(Json(collection_envelope(&following_url, 0)));
    }

    Ok(Json(page_envelope(&following_url, None, Vec::new(), None)))
}

/// GET /users/:username/notes/:id
///
/// Returns the canonical JSON representation of a local note.
async fn note_object(
    State(state): State<AppState>,
    Path((username, note_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let actor = require_local_actor(&state, &username).await?;

    let base_url = state.config.server.base_url();
    let object_uri = format!("{}/notes/{}", actor.actor_uri(&base_url), note_id);

    let note = state
        .db
        .get_note_by_object_uri(&object_uri)
        .await?
        .filter(|note| note.local_actor_id.as_deref() == Some(actor.id.as_str()))
        .ok_or(AppError::NotFound)?;

    Ok(Json(builder::note(
        &note.object_uri,
        &actor.actor_uri(&base_url),
        &note.content,
        &note.published_at.to_rfc3339(),
        note.in_reply_to_uri.as_deref(),
    )))
}

// =============================================================================
// Collection rendering
// =============================================================================

fn collection_envelope(collection_url: &str, total: i64) -> serde_json::Value {
    serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": collection_url,
        "totalItems": total,
        "first": format!("{}?page=true", collection_url)
    })
}

fn page_envelope(
    collection_url: &str,
    current_cursor: Option<&str>,
    items: Vec<serde_json::Value>,
    next_cursor: Option<String>,
) -> serde_json::Value {
    let page_id = match current_cursor {
        Some(cursor) => format!("{}?page=true&max_id={}", collection_url, cursor),
        None => format!("{}?page=true", collection_url),
    };

    let mut page = serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollectionPage",
        "id": page_id,
        "partOf": collection_url,
        "orderedItems": items
    });

    if let Some(cursor) = next_cursor {
        page["next"] = serde_json::json!(format!(
            "{}?page=true&max_id={}",
            collection_url, cursor
        ));
    }

    page
}

/// Cursor for the next page: the last item's id when the page is full.
fn page_cursor<T>(items: &[T], page_size: u32, id_of: impl Fn(&T) -> &String) -> Option<String> {
    if items.len() == page_size as usize {
        items.last().map(|item| id_of(item).clone())
    } else {
        None
    }
}

fn note_create_activity(note: &Note, actor: &LocalActor, base_url: &str) -> serde_json::Value {
    let actor_uri = actor.actor_uri(base_url);
    let object = builder::note(
        &note.object_uri,
        &actor_uri,
        &note.content,
        &note.published_at.to_rfc3339(),
        note.in_reply_to_uri.as_deref(),
    );

    serde_json::json!({
        "type": "Create",
        "id": format!("{}/activity", note.object_uri),
        "actor": actor_uri,
        "published": note.published_at.to_rfc3339(),
        "to": [builder::PUBLIC_AUDIENCE],
        "cc": [format!("{}/followers", actor_uri)],
        "object": object
    })
}
