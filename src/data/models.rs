//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Local actors
// =============================================================================

/// A federated identity bound to one local user.
///
/// The actor URI is derived from the instance base URL and the username,
/// which is unique and immutable once provisioned. The key pair is
/// generated at creation; the private key never leaves the database row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocalActor {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    /// RSA private key (PKCS#8 PEM)
    pub private_key_pem: String,
    /// RSA public key (PEM)
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalActor {
    /// Canonical actor URI, e.g. `https://social.example.com/users/alice`
    pub fn actor_uri(&self, base_url: &str) -> String {
        format!("{}/users/{}", base_url.trim_end_matches('/'), self.username)
    }

    /// Key id advertised in the actor document and used in signatures.
    pub fn key_id(&self, base_url: &str) -> String {
        format!("{}#main-key", self.actor_uri(base_url))
    }

    /// Inbox URI for this actor.
    pub fn inbox_uri(&self, base_url: &str) -> String {
        format!("{}/inbox", self.actor_uri(base_url))
    }
}

// =============================================================================
// Remote actors
// =============================================================================

/// Cached descriptor of a foreign identity.
///
/// Created or refreshed lazily by the resolver; `fetched_at` drives the
/// freshness window. Public key and inbox URI are always present: a row
/// without them is never written.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemoteActor {
    /// Actor URI (globally unique)
    pub uri: String,
    pub username: Option<String>,
    pub domain: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub inbox_uri: String,
    /// Shared inbox endpoint, if the remote advertises one
    pub shared_inbox_uri: Option<String>,
    /// Advertised public key id (usually `<uri>#main-key`)
    pub key_id: String,
    /// RSA public key (PEM)
    pub public_key_pem: String,
    /// When this descriptor was last fetched
    pub fetched_at: DateTime<Utc>,
}

impl RemoteActor {
    /// Whether the cached descriptor is within the freshness window.
    pub fn is_fresh(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.fetched_at) < ttl
    }

    /// The inbox deliveries should target: shared inbox when advertised.
    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox_uri.as_deref().unwrap_or(&self.inbox_uri)
    }
}

// =============================================================================
// Activities
// =============================================================================

/// Immutable record of a received or sent protocol event.
///
/// The URI is globally unique and serves as the deduplication key for
/// inbound processing. Rows are never mutated except for status
/// transitions, and are retained for audit and idempotence.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActivityRecord {
    /// Activity URI (globally unique)
    pub uri: String,
    /// Type: Follow, Like, Announce, Create, Undo, Accept, ...
    pub activity_type: String,
    pub actor_uri: String,
    /// Raw activity JSON document
    pub document: String,
    /// Direction: inbound, outbound
    pub direction: String,
    /// Status: received, applied, rejected
    pub status: String,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Activity direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityDirection {
    Inbound,
    Outbound,
}

impl ActivityDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// Activity processing status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityStatus {
    Received,
    Applied,
    Rejected,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Applied => "applied",
            Self::Rejected => "rejected",
        }
    }
}

// =============================================================================
// Follow relationships
// =============================================================================

/// Edge between a remote follower and a local followee.
///
/// At most one non-undone edge exists per (remote, local) pair, enforced
/// by a partial unique index.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowerEdge {
    pub id: String,
    pub local_actor_id: String,
    pub remote_actor_uri: String,
    /// Follower's personal inbox URI for delivery
    pub inbox_uri: String,
    /// Follower's shared inbox, if advertised at follow time
    pub shared_inbox_uri: Option<String>,
    /// The Follow activity URI that created this edge
    pub follow_activity_uri: String,
    /// State: pending, accepted, undone
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Follow relationship state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowState {
    Pending,
    Accepted,
    Undone,
}

impl FollowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Undone => "undone",
        }
    }
}

// =============================================================================
// Notes
// =============================================================================

/// A content object: locally authored or a stored remote object.
///
/// Local notes: `local_actor_id` set, `remote_actor_uri` NULL; the upsert
/// key is (local_actor_id, content_url) and the object URI is stable for
/// the life of the content. Remote notes are the inverse.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Note {
    pub id: String,
    pub local_actor_id: Option<String>,
    pub remote_actor_uri: Option<String>,
    /// Canonical ActivityPub object URI (globally unique)
    pub object_uri: String,
    /// Source content URL (upsert key for local notes)
    pub content_url: String,
    /// HTML content (sanitized for remote notes)
    pub content: String,
    pub in_reply_to_uri: Option<String>,
    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Interactions
// =============================================================================

/// Like or Announce recorded against a local note.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NoteInteraction {
    pub id: String,
    pub note_id: String,
    pub remote_actor_uri: String,
    /// Kind: like, announce
    pub kind: String,
    /// The activity URI that created this interaction (Undo looks it up)
    pub activity_uri: String,
    pub created_at: DateTime<Utc>,
}

/// Interaction kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Like,
    Announce,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Announce => "announce",
        }
    }
}

// =============================================================================
// Delivery tasks
// =============================================================================

/// Unit of outbound delivery work: one task per distinct recipient inbox.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryTask {
    pub id: String,
    /// Local actor whose key signs the request
    pub local_actor_id: String,
    pub inbox_uri: String,
    /// Serialized activity JSON
    pub payload: String,
    pub attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    /// Status: pending, inflight, delivered, failed
    pub status: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Delivery task status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Inflight,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Inflight => "inflight",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}
