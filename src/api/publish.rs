//! Local publish API
//!
//! The narrow interface the host application uses to provision actors and
//! publish content. Real user authentication is an external collaborator;
//! these endpoints are guarded by a static bearer token from config.

use axum::http::StatusCode;
use axum::{Router, extract::State, response::Json, routing::post};
use http::HeaderMap;
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;

/// Create publish API router
///
/// Routes (all bearer-token guarded):
/// - POST /api/v1/actors - Provision a local actor
/// - POST /api/v1/notes - Upsert local content
/// - DELETE /api/v1/notes - Delete local content
pub fn publish_router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/actors", post(create_actor))
        .route("/api/v1/notes", post(upsert_note).delete(delete_note))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let token = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?;

    if token != state.config.api.publish_token {
        return Err(AppError::Unauthorized);
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct CreateActorRequest {
    username: String,
    display_name: Option<String>,
    summary: Option<String>,
}

/// POST /api/v1/actors
async fn create_actor(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateActorRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    authorize(&state, &headers)?;

    let username = request.username.trim();
    if username.is_empty()
        || !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AppError::Validation(
            "username must be non-empty and URL-safe".to_string(),
        ));
    }

    let actor = state
        .publisher
        .provision_actor(username, request.display_name, request.summary)
        .await?;

    let base_url = state.config.server.base_url();
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": actor.id,
            "username": actor.username,
            "actor_uri": actor.actor_uri(&base_url),
            "created_at": actor.created_at
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct UpsertNoteRequest {
    username: String,
    content: String,
    content_url: String,
}

/// POST /api/v1/notes
///
/// Keyed upsert: calling this on every save of the underlying content is
/// safe and never duplicates notes.
async fn upsert_note(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<UpsertNoteRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    authorize(&state, &headers)?;

    let actor = state
        .db
        .get_local_actor_by_username(&request.username)
        .await?
        .ok_or(AppError::NotFound)?;

    let note = state
        .publisher
        .upsert_note(&actor, &request.content, &request.content_url)
        .await?;

    Ok(Json(serde_json::json!({
        "id": note.id,
        "object_uri": note.object_uri,
        "content_url": note.content_url,
        "published_at": note.published_at,
        "updated_at": note.updated_at
    })))
}

#[derive(Debug, Deserialize)]
struct DeleteNoteRequest {
    username: String,
    content_url: String,
}

/// DELETE /api/v1/notes
async fn delete_note(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DeleteNoteRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    authorize(&state, &headers)?;

    let actor = state
        .db
        .get_local_actor_by_username(&request.username)
        .await?
        .ok_or(AppError::NotFound)?;

    let deleted = state
        .publisher
        .delete_note(&actor, &request.content_url)
        .await?;

    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
