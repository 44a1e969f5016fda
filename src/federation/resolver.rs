//! Remote actor resolution
//!
//! Resolves a user-supplied identifier (`user@domain`, `acct:user@domain`,
//! or a direct actor URI) to a cached `RemoteActor` descriptor via
//! WebFinger discovery and an actor-document fetch.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::data::{Database, RemoteActor};
use crate::error::{AppError, ResolutionError};
use crate::metrics::ACTOR_RESOLUTIONS_TOTAL;

const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Validate a remote URL before fetching it.
///
/// Rejects non-HTTP(S) schemes and local/private hosts (SSRF guard).
pub fn validate_remote_url(raw: &str, allow_private: bool) -> Result<url::Url, ResolutionError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| ResolutionError::MalformedDocument(format!("invalid URL {}: {}", raw, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ResolutionError::MalformedDocument(format!(
                "unsupported URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| ResolutionError::MalformedDocument(format!("missing host in {}", raw)))?;

    if !allow_private && is_disallowed_host(host) {
        return Err(ResolutionError::Unreachable(format!(
            "host {} is not a public address",
            host
        )));
    }

    Ok(parsed)
}

/// Fields parsed out of an actor document.
#[derive(Debug, Clone)]
pub struct ParsedActor {
    pub id: String,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub key_id: String,
    pub public_key_pem: String,
}

/// Extract relevant data from an actor document.
///
/// Identifier, public key, and inbox are mandatory (the cache invariant:
/// a RemoteActor row without them is never written); everything else is
/// best-effort.
pub fn parse_actor_document(actor: &serde_json::Value) -> Result<ParsedActor, ResolutionError> {
    let malformed = |field: &str| {
        ResolutionError::MalformedDocument(format!("actor document missing {}", field))
    };

    let id = actor
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| malformed("id"))?
        .to_string();

    let inbox = actor
        .get("inbox")
        .and_then(|v| v.as_str())
        .ok_or_else(|| malformed("inbox"))?
        .to_string();

    let public_key = actor.get("publicKey").ok_or_else(|| malformed("publicKey"))?;
    let key_id = public_key
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| malformed("publicKey.id"))?
        .to_string();
    let public_key_pem = public_key
        .get("publicKeyPem")
        .and_then(|v| v.as_str())
        .ok_or_else(|| malformed("publicKey.publicKeyPem"))?
        .to_string();

    let shared_inbox = actor
        .get("endpoints")
        .and_then(|endpoints| endpoints.get("sharedInbox"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok(ParsedActor {
        id,
        username: actor
            .get("preferredUsername")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        display_name: actor
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        summary: actor
            .get("summary")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        inbox,
        shared_inbox,
        key_id,
        public_key_pem,
    })
}

/// Split an `acct:` style identifier into (username, domain).
///
/// Accepts `user@domain`, `@user@domain`, and `acct:user@domain`.
fn parse_acct_identifier(identifier: &str) -> Option<(String, String)> {
    // URIs are never handles, even when their path contains an `@`.
    if identifier.contains("://") {
        return None;
    }

    let stripped = identifier
        .strip_prefix("acct:")
        .unwrap_or(identifier)
        .trim_start_matches('@');

    let (username, domain) = stripped.split_once('@')?;
    if username.is_empty() || domain.is_empty() || domain.contains('@') || username.contains('/') {
        return None;
    }

    Some((username.to_string(), domain.to_ascii_lowercase()))
}

/// Identifier-to-actor resolver with a database-backed cache.
pub struct ActorResolver {
    db: Arc<Database>,
    http_client: Arc<reqwest::Client>,
    /// Freshness window for cached descriptors
    cache_ttl: chrono::Duration,
    allow_private_addresses: bool,
}

impl ActorResolver {
    /// Create a new resolver.
    pub fn new(
        db: Arc<Database>,
        http_client: Arc<reqwest::Client>,
        cache_ttl: chrono::Duration,
        allow_private_addresses: bool,
    ) -> Self {
        Self {
            db,
            http_client,
            cache_ttl,
            allow_private_addresses,
        }
    }

    /// Resolve an identifier to a remote actor, cache-first.
    ///
    /// A cached descriptor within the freshness window is returned without
    /// network I/O, even if its key later turns out stale; the signature
    /// verifier forces a refresh on verification failure.
    pub async fn resolve(&self, identifier: &str) -> Result<RemoteActor, AppError> {
        if let Some((username, domain)) = parse_acct_identifier(identifier) {
            let actor_uri = self.discover_actor_uri(&username, &domain).await?;
            return self.resolve_uri(&actor_uri, false).await;
        }

        self.resolve_uri(identifier, false).await
    }

    /// Resolve an actor URI, bypassing the freshness window.
    ///
    /// Used on signature verification failure to pick up rotated keys.
    pub async fn resolve_fresh(&self, actor_uri: &str) -> Result<RemoteActor, AppError> {
        self.resolve_uri(actor_uri, true).await
    }

    async fn resolve_uri(&self, actor_uri: &str, force: bool) -> Result<RemoteActor, AppError> {
        // Strip a key fragment so `actor#main-key` resolves the actor itself.
        let actor_uri = actor_uri.split('#').next().unwrap_or(actor_uri);

        if !force {
            if let Some(cached) = self.db.get_remote_actor(actor_uri).await? {
                if cached.is_fresh(self.cache_ttl, Utc::now()) {
                    ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["cache"]).inc();
                    return Ok(cached);
                }
            }
        }

        let document = self.fetch_actor_document(actor_uri).await?;
        let parsed = parse_actor_document(&document)?;

        let domain = url::Url::parse(&parsed.id)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .ok_or_else(|| {
                ResolutionError::MalformedDocument(format!("actor id has no host: {}", parsed.id))
            })?;

        let actor = RemoteActor {
            uri: parsed.id,
            username: parsed.username,
            domain,
            display_name: parsed.display_name,
            summary: parsed.summary,
            inbox_uri: parsed.inbox,
            shared_inbox_uri: parsed.shared_inbox,
            key_id: parsed.key_id,
            public_key_pem: parsed.public_key_pem,
            fetched_at: Utc::now(),
        };

        self.db.upsert_remote_actor(&actor).await?;
        ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["fetch"]).inc();

        tracing::debug!(uri = %actor.uri, "Resolved remote actor");
        Ok(actor)
    }

    /// WebFinger discovery: `acct:user@domain` -> actor URI.
    async fn discover_actor_uri(
        &self,
        username: &str,
        domain: &str,
    ) -> Result<String, ResolutionError> {
        // Development instances (private addresses allowed) federate over
        // plain HTTP; real federation is HTTPS-only.
        let scheme = if self.allow_private_addresses {
            "http"
        } else {
            "https"
        };
        let webfinger_url = format!("{}://{}/.well-known/webfinger", scheme, domain);
        validate_remote_url(&webfinger_url, self.allow_private_addresses)?;

        let resource = format!("acct:{}@{}", username, domain);
        let response = self
            .http_client
            .get(&webfinger_url)
            .query(&[("resource", resource.as_str())])
            .header("Accept", "application/jrd+json")
            .send()
            .await
            .map_err(|e| {
                ResolutionError::Unreachable(format!("webfinger fetch for {}: {}", resource, e))
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ResolutionError::NotFound(resource));
        }
        if !response.status().is_success() {
            return Err(ResolutionError::Unreachable(format!(
                "webfinger for {}: HTTP {}",
                resource,
                response.status()
            )));
        }

        let jrd: WebFingerResponse = response.json().await.map_err(|e| {
            ResolutionError::MalformedDocument(format!("webfinger JRD for {}: {}", resource, e))
        })?;

        // The actor profile link: rel=self with the activity content type.
        let href = jrd
            .links
            .iter()
            .find(|link| {
                link.rel == "self"
                    && link
                        .link_type
                        .as_deref()
                        .is_some_and(|t| t.starts_with(ACTIVITY_CONTENT_TYPE) || t.contains("ld+json"))
            })
            .and_then(|link| link.href.clone())
            .ok_or_else(|| {
                ResolutionError::MalformedDocument(format!(
                    "webfinger JRD for {} has no actor profile link",
                    resource
                ))
            })?;

        Ok(href)
    }

    /// Fetch an actor document with content-type negotiation.
    async fn fetch_actor_document(
        &self,
        actor_uri: &str,
    ) -> Result<serde_json::Value, ResolutionError> {
        validate_remote_url(actor_uri, self.allow_private_addresses)?;

        let response = self
            .http_client
            .get(actor_uri)
            .header("Accept", ACTIVITY_CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| {
                ResolutionError::Unreachable(format!("actor fetch {}: {}", actor_uri, e))
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND
            || response.status() == reqwest::StatusCode::GONE
        {
            return Err(ResolutionError::NotFound(actor_uri.to_string()));
        }
        if !response.status().is_success() {
            return Err(ResolutionError::Unreachable(format!(
                "actor fetch {}: HTTP {}",
                actor_uri,
                response.status()
            )));
        }

        response.json().await.map_err(|e| {
            ResolutionError::MalformedDocument(format!("actor document {}: {}", actor_uri, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_acct_identifier_accepts_all_handle_forms() {
        assert_eq!(
            parse_acct_identifier("alice@example.org"),
            Some(("alice".to_string(), "example.org".to_string()))
        );
        assert_eq!(
            parse_acct_identifier("@alice@example.org"),
            Some(("alice".to_string(), "example.org".to_string()))
        );
        assert_eq!(
            parse_acct_identifier("acct:alice@Example.ORG"),
            Some(("alice".to_string(), "example.org".to_string()))
        );
    }

    #[test]
    fn parse_acct_identifier_rejects_uris_and_garbage() {
        assert_eq!(parse_acct_identifier("https://example.org/users/alice"), None);
        assert_eq!(parse_acct_identifier("https://example.org/@alice"), None);
        assert_eq!(parse_acct_identifier("alice"), None);
        assert_eq!(parse_acct_identifier("@example.org"), None);
        assert_eq!(parse_acct_identifier("a@b@c"), None);
    }

    #[test]
    fn validate_remote_url_rejects_localhost_and_private_hosts() {
        assert!(matches!(
            validate_remote_url("https://localhost/users/alice", false),
            Err(ResolutionError::Unreachable(_))
        ));
        assert!(matches!(
            validate_remote_url("http://192.168.1.10/users/alice", false),
            Err(ResolutionError::Unreachable(_))
        ));
    }

    #[test]
    fn validate_remote_url_allows_private_hosts_when_configured() {
        assert!(validate_remote_url("http://127.0.0.1:3000/users/alice", true).is_ok());
    }

    #[test]
    fn validate_remote_url_rejects_non_http_schemes() {
        assert!(matches!(
            validate_remote_url("ftp://example.com/users/alice", false),
            Err(ResolutionError::MalformedDocument(_))
        ));
    }

    #[test]
    fn parse_actor_document_extracts_all_fields() {
        let doc = json!({
            "id": "https://example.org/users/alice",
            "type": "Person",
            "preferredUsername": "alice",
            "name": "Alice",
            "summary": "<p>hi</p>",
            "inbox": "https://example.org/users/alice/inbox",
            "endpoints": { "sharedInbox": "https://example.org/inbox" },
            "publicKey": {
                "id": "https://example.org/users/alice#main-key",
                "owner": "https://example.org/users/alice",
                "publicKeyPem": "-----BEGIN PUBLIC KEY-----\n..."
            }
        });

        let parsed = parse_actor_document(&doc).expect("valid actor document");
        assert_eq!(parsed.id, "https://example.org/users/alice");
        assert_eq!(parsed.username.as_deref(), Some("alice"));
        assert_eq!(parsed.inbox, "https://example.org/users/alice/inbox");
        assert_eq!(
            parsed.shared_inbox.as_deref(),
            Some("https://example.org/inbox")
        );
        assert_eq!(parsed.key_id, "https://example.org/users/alice#main-key");
    }

    #[test]
    fn parse_actor_document_rejects_missing_key_or_inbox() {
        let no_key = json!({
            "id": "https://example.org/users/alice",
            "inbox": "https://example.org/users/alice/inbox"
        });
        assert!(matches!(
            parse_actor_document(&no_key),
            Err(ResolutionError::MalformedDocument(_))
        ));

        let no_inbox = json!({
            "id": "https://example.org/users/alice",
            "publicKey": {
                "id": "https://example.org/users/alice#main-key",
                "publicKeyPem": "pem"
            }
        });
        assert!(matches!(
            parse_actor_document(&no_inbox),
            Err(ResolutionError::MalformedDocument(_))
        ));
    }
}
