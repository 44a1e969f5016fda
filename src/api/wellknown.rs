//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/nodeinfo
//! - /.well-known/host-meta

use axum::{
    Router,
    extract::{Query, State},
    response::Json,
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/nodeinfo
/// - GET /.well-known/host-meta
/// - GET /nodeinfo/2.0
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/.well-known/host-meta", get(host_meta))
        .route("/nodeinfo/2.0", get(nodeinfo))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// Extract the local username a webfinger resource refers to.
///
/// Accepts `acct:user@domain` and a local actor URI; anything else is not
/// resolvable here.
fn local_username_for_resource(resource: &str, domain: &str, base_url: &str) -> Option<String> {
    if let Some(acct) = resource.strip_prefix("acct:") {
        let (username, acct_domain) = acct.split_once('@')?;
        if !acct_domain.eq_ignore_ascii_case(domain) || username.is_empty() {
            return None;
        }
        return Some(username.to_string());
    }

    // Actor URI form: https://domain/users/name
    let prefix = format!("{}/users/", base_url.trim_end_matches('/'));
    let username = resource.strip_prefix(&prefix)?.trim_end_matches('/');
    (!username.is_empty() && !username.contains('/')).then(|| username.to_string())
}

/// GET /.well-known/webfinger
///
/// Responds to WebFinger queries for local accounts.
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let base_url = state.config.server.base_url();

    let username =
        local_username_for_resource(&query.resource, &state.config.server.domain, &base_url)
            .ok_or(AppError::NotFound)?;

    let actor = state
        .db
        .get_local_actor_by_username(&username)
        .await?
        .ok_or(AppError::NotFound)?;

    let actor_url = actor.actor_uri(&base_url);

    Ok(Json(serde_json::json!({
        "subject": format!("acct:{}@{}", actor.username, state.config.server.domain),
        "aliases": [actor_url],
        "links": [
            {
                "rel": "self",
                "type": "application/activity+json",
                "href": actor_url
            },
            {
                "rel": "http://webfinger.net/rel/profile-page",
                "type": "text/html",
                "href": actor_url
            }
        ]
    })))
}

/// GET /.well-known/nodeinfo
///
/// Returns links to nodeinfo documents.
async fn nodeinfo_links(State(state): State<AppState>) -> Json<serde_json::Value> {
    let base_url = state.config.server.base_url();
    Json(serde_json::json!({
        "links": [
            {
                "rel": "http://nodeinfo.diaspora.software/ns/schema/2.0",
                "href": format!("{}/nodeinfo/2.0", base_url)
            }
        ]
    }))
}

/// GET /nodeinfo/2.0
///
/// Returns NodeInfo 2.0 document.
async fn nodeinfo(State(_state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": "2.0",
        "software": {
            "name": "driftwood",
            "version": env!("CARGO_PKG_VERSION")
        },
        "protocols": ["activitypub"],
        "services": {
            "inbound": [],
            "outbound": []
        },
        "openRegistrations": false,
        "usage": {
            "users": {}
        },
        "metadata": {}
    }))
}

/// GET /.well-known/host-meta
///
/// Returns host-meta XML for WebFinger discovery.
async fn host_meta(State(state): State<AppState>) -> impl axum::response::IntoResponse {
    let base_url = state.config.server.base_url();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" template="{}/.well-known/webfinger?resource={{uri}}"/>
</XRD>"#,
        base_url
    );

    ([("Content-Type", "application/xrd+xml")], xml)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = "social.example.com";
    const BASE: &str = "https://social.example.com";

    #[test]
    fn local_username_for_resource_accepts_acct_form() {
        assert_eq!(
            local_username_for_resource("acct:alice@social.example.com", DOMAIN, BASE),
            Some("alice".to_string())
        );
    }

    #[test]
    fn local_username_for_resource_accepts_actor_uri_form() {
        assert_eq!(
            local_username_for_resource("https://social.example.com/users/alice", DOMAIN, BASE),
            Some("alice".to_string())
        );
    }

    #[test]
    fn local_username_for_resource_rejects_foreign_domains() {
        assert_eq!(
            local_username_for_resource("acct:alice@elsewhere.example", DOMAIN, BASE),
            None
        );
        assert_eq!(
            local_username_for_resource("https://elsewhere.example/users/alice", DOMAIN, BASE),
            None
        );
    }

    #[test]
    fn local_username_for_resource_rejects_malformed_resources() {
        assert_eq!(local_username_for_resource("alice", DOMAIN, BASE), None);
        assert_eq!(local_username_for_resource("acct:@", DOMAIN, BASE), None);
    }
}
