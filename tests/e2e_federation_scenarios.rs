//! E2E tests for federation scenarios
//!
//! These tests verify the complete flow of federation activities with
//! in-process axum servers playing the remote peers:
//! - Signed Follow -> follower edge + Accept delivery
//! - Idempotent re-delivery of the same activity
//! - Signature rejection cases (digest, stale date)
//! - Key rotation recovery via forced re-resolution
//! - Delivery fan-out with shared-inbox dedup and failure isolation
//! - WebFinger resolution of a remote handle

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{Router, routing::get, routing::post};
use chrono::Utc;
use common::{
    TEST_DOMAIN, TestServer, cache_remote_actor, sign_inbox_request, spawn_peer, test_rsa_keypair,
};
use driftwood::data::{EntityId, FollowState, FollowerEdge};
use driftwood::federation::ActorResolver;
use http::StatusCode;
use serde_json::{Value, json};
use tokio::sync::Mutex;

/// A peer inbox that records every JSON body it receives.
fn recording_inbox(
    path: &str,
    received: Arc<Mutex<Vec<Value>>>,
) -> Router {
    Router::new().route(
        path,
        post(move |body: String| {
            let received = received.clone();
            async move {
                let value: Value = serde_json::from_str(&body).unwrap();
                received.lock().await.push(value);
                StatusCode::ACCEPTED
            }
        }),
    )
}

#[tokio::test]
async fn signed_follow_creates_edge_and_delivers_accept() {
    let server = TestServer::new().await;
    let alice = server.provision_actor("alice").await;

    // Remote peer "bob" with a recording inbox.
    let received = Arc::new(Mutex::new(Vec::new()));
    let peer_url = spawn_peer(recording_inbox("/users/bob/inbox", received.clone())).await;
    let bob_uri = format!("{}/users/bob", peer_url);
    let bob_inbox = format!("{}/users/bob/inbox", peer_url);

    let (private_pem, public_pem) = test_rsa_keypair();
    cache_remote_actor(&server.state, &bob_uri, &bob_inbox, None, &public_pem).await;

    let follow = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Follow",
        "id": format!("{}/follows/1", peer_url),
        "actor": bob_uri,
        "object": format!("https://{}/users/alice", TEST_DOMAIN)
    });
    let body = serde_json::to_vec(&follow).unwrap();

    let inbox_url = server.url("/users/alice/inbox");
    let (date, digest, signature) = sign_inbox_request(
        &inbox_url,
        &body,
        &private_pem,
        &format!("{}#main-key", bob_uri),
    );

    let response = server
        .client
        .post(&inbox_url)
        .header("Content-Type", "application/activity+json")
        .header("Date", &date)
        .header("Digest", &digest)
        .header("Signature", &signature)
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    // Follower edge is accepted.
    let followers = server
        .state
        .db
        .get_accepted_followers(&alice.id)
        .await
        .unwrap();
    assert_eq!(followers.len(), 1);
    assert_eq!(followers[0].remote_actor_uri, bob_uri);
    assert_eq!(followers[0].state, "accepted");

    // Exactly one Accept task was enqueued; work the queue and confirm it
    // lands in bob's inbox.
    let tasks = server
        .state
        .db
        .get_delivery_tasks_for_inbox(&bob_inbox)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);

    server.state.dispatcher.run_due_tasks_once().await.unwrap();

    let delivered = received.lock().await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0]["type"], "Accept");
    assert_eq!(delivered[0]["object"]["id"], format!("{}/follows/1", peer_url));

    let settled = server
        .state
        .db
        .get_delivery_tasks_for_inbox(&bob_inbox)
        .await
        .unwrap();
    assert_eq!(settled[0].status, "delivered");
}

#[tokio::test]
async fn redelivered_follow_is_idempotent() {
    let server = TestServer::new().await;
    let alice = server.provision_actor("alice").await;

    let peer_url = spawn_peer(Router::new()).await;
    let bob_uri = format!("{}/users/bob", peer_url);
    let bob_inbox = format!("{}/users/bob/inbox", peer_url);

    let (private_pem, public_pem) = test_rsa_keypair();
    cache_remote_actor(&server.state, &bob_uri, &bob_inbox, None, &public_pem).await;

    let follow = json!({
        "type": "Follow",
        "id": format!("{}/follows/idempotent", peer_url),
        "actor": bob_uri,
        "object": format!("https://{}/users/alice", TEST_DOMAIN)
    });
    let body = serde_json::to_vec(&follow).unwrap();
    let inbox_url = server.url("/users/alice/inbox");
    let key_id = format!("{}#main-key", bob_uri);

    for _ in 0..2 {
        let (date, digest, signature) =
            sign_inbox_request(&inbox_url, &body, &private_pem, &key_id);
        let response = server
            .client
            .post(&inbox_url)
            .header("Content-Type", "application/activity+json")
            .header("Date", date)
            .header("Digest", digest)
            .header("Signature", signature)
            .body(body.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
    }

    // One edge, one Accept task despite two deliveries.
    assert_eq!(
        server
            .state
            .db
            .get_accepted_followers(&alice.id)
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        server
            .state
            .db
            .get_delivery_tasks_for_inbox(&bob_inbox)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn tampered_body_is_rejected_with_digest_mismatch() {
    let server = TestServer::new().await;
    server.provision_actor("alice").await;

    let peer_url = spawn_peer(Router::new()).await;
    let bob_uri = format!("{}/users/bob", peer_url);
    let (private_pem, public_pem) = test_rsa_keypair();
    cache_remote_actor(
        &server.state,
        &bob_uri,
        &format!("{}/users/bob/inbox", peer_url),
        None,
        &public_pem,
    )
    .await;

    let follow = json!({
        "type": "Follow",
        "id": format!("{}/follows/tampered", peer_url),
        "actor": bob_uri,
        "object": format!("https://{}/users/alice", TEST_DOMAIN)
    });
    let body = serde_json::to_vec(&follow).unwrap();
    let inbox_url = server.url("/users/alice/inbox");
    let (date, digest, signature) = sign_inbox_request(
        &inbox_url,
        &body,
        &private_pem,
        &format!("{}#main-key", bob_uri),
    );

    // Body swapped after signing.
    let mut tampered = follow.clone();
    tampered["object"] = json!(format!("https://{}/users/mallory", TEST_DOMAIN));

    let response = server
        .client
        .post(&inbox_url)
        .header("Content-Type", "application/activity+json")
        .header("Date", date)
        .header("Digest", digest)
        .header("Signature", signature)
        .body(serde_json::to_vec(&tampered).unwrap())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn stale_date_is_rejected() {
    let server = TestServer::new().await;
    server.provision_actor("alice").await;

    let peer_url = spawn_peer(Router::new()).await;
    let bob_uri = format!("{}/users/bob", peer_url);
    let (private_pem, public_pem) = test_rsa_keypair();
    cache_remote_actor(
        &server.state,
        &bob_uri,
        &format!("{}/users/bob/inbox", peer_url),
        None,
        &public_pem,
    )
    .await;

    let follow = json!({
        "type": "Follow",
        "id": format!("{}/follows/stale", peer_url),
        "actor": bob_uri,
        "object": format!("https://{}/users/alice", TEST_DOMAIN)
    });
    let body = serde_json::to_vec(&follow).unwrap();
    let inbox_url = server.url("/users/alice/inbox");
    let (_date, digest, signature) = sign_inbox_request(
        &inbox_url,
        &body,
        &private_pem,
        &format!("{}#main-key", bob_uri),
    );

    // Replay with a Date far outside the skew window.
    let stale_date = (Utc::now() - chrono::Duration::hours(2))
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();

    let response = server
        .client
        .post(&inbox_url)
        .header("Content-Type", "application/activity+json")
        .header("Date", stale_date)
        .header("Digest", digest)
        .header("Signature", signature)
        .body(body)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn rotated_key_recovers_via_forced_refresh() {
    let server = TestServer::new().await;
    let alice = server.provision_actor("alice").await;

    let (new_private_pem, new_public_pem) = test_rsa_keypair();
    let (_old_private, old_public_pem) = test_rsa_keypair();

    // Peer serves the rotated actor document.
    let received = Arc::new(Mutex::new(Vec::new()));
    let inbox_routes = recording_inbox("/users/bob/inbox", received.clone());
    let bob_uri_holder: Arc<std::sync::OnceLock<String>> = Arc::new(std::sync::OnceLock::new());
    let bob_uri_for_doc = bob_uri_holder.clone();
    let new_public_for_doc = new_public_pem.clone();
    let peer_routes = inbox_routes.route(
        "/users/bob",
        get(move || {
            let bob_uri = bob_uri_for_doc.get().cloned().unwrap_or_default();
            let pem = new_public_for_doc.clone();
            async move {
                axum::Json(json!({
                    "id": bob_uri,
                    "type": "Person",
                    "preferredUsername": "bob",
                    "inbox": format!("{}/inbox", bob_uri),
                    "publicKey": {
                        "id": format!("{}#main-key", bob_uri),
                        "owner": bob_uri,
                        "publicKeyPem": pem
                    }
                }))
            }
        }),
    );
    let peer_url = spawn_peer(peer_routes).await;
    let bob_uri = format!("{}/users/bob", peer_url);
    bob_uri_holder.set(bob_uri.clone()).unwrap();

    // The cache still holds the pre-rotation key.
    cache_remote_actor(
        &server.state,
        &bob_uri,
        &format!("{}/users/bob/inbox", peer_url),
        None,
        &old_public_pem,
    )
    .await;

    let follow = json!({
        "type": "Follow",
        "id": format!("{}/follows/rotated", peer_url),
        "actor": bob_uri,
        "object": format!("https://{}/users/alice", TEST_DOMAIN)
    });
    let body = serde_json::to_vec(&follow).unwrap();
    let inbox_url = server.url("/users/alice/inbox");
    let (date, digest, signature) = sign_inbox_request(
        &inbox_url,
        &body,
        &new_private_pem,
        &format!("{}#main-key", bob_uri),
    );

    let response = server
        .client
        .post(&inbox_url)
        .header("Content-Type", "application/activity+json")
        .header("Date", date)
        .header("Digest", digest)
        .header("Signature", signature)
        .body(body)
        .send()
        .await
        .unwrap();

    // Verification failed against the cached key, succeeded after the
    // forced re-resolve of the actor document.
    assert_eq!(response.status(), 202);
    assert_eq!(
        server
            .state
            .db
            .get_accepted_followers(&alice.id)
            .await
            .unwrap()
            .len(),
        1
    );

    // The cache now holds the rotated key.
    let refreshed = server
        .state
        .db
        .get_remote_actor(&bob_uri)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.public_key_pem, new_public_pem);
}

#[tokio::test]
async fn fan_out_dedupes_shared_inboxes_and_isolates_failures() {
    let server = TestServer::with_config_tweaks(|config| {
        config.federation.delivery_max_attempts = 2;
        config.federation.delivery_base_backoff_seconds = 0;
    })
    .await;
    let alice = server.provision_actor("alice").await;

    // Peer 1 hosts two followers behind one shared inbox.
    let shared_received = Arc::new(AtomicUsize::new(0));
    let shared_counter = shared_received.clone();
    let peer1_url = spawn_peer(Router::new().route(
        "/inbox",
        post(move || {
            let counter = shared_counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                StatusCode::ACCEPTED
            }
        }),
    ))
    .await;

    // Peer 2 hosts one follower whose inbox always fails.
    let peer2_url = spawn_peer(Router::new().route(
        "/users/dave/inbox",
        post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    ))
    .await;

    let shared_inbox = format!("{}/inbox", peer1_url);
    let dave_inbox = format!("{}/users/dave/inbox", peer2_url);

    for (username, shared) in [("bob", true), ("carol", true), ("dave", false)] {
        let (remote_uri, inbox, shared_uri) = if shared {
            (
                format!("{}/users/{}", peer1_url, username),
                format!("{}/users/{}/inbox", peer1_url, username),
                Some(shared_inbox.clone()),
            )
        } else {
            (
                format!("{}/users/{}", peer2_url, username),
                dave_inbox.clone(),
                None,
            )
        };

        let edge = FollowerEdge {
            id: EntityId::new().0,
            local_actor_id: alice.id.clone(),
            remote_actor_uri: remote_uri,
            inbox_uri: inbox,
            shared_inbox_uri: shared_uri,
            follow_activity_uri: format!("https://remote.example/follows/{}", username),
            state: FollowState::Accepted.as_str().to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        server.state.db.upsert_follower(&edge).await.unwrap();
    }

    // Three followers, one shared inbox: exactly two delivery tasks.
    server
        .state
        .publisher
        .upsert_note(&alice, "<p>fan-out</p>", "https://blog.example/posts/fanout")
        .await
        .unwrap();

    let shared_tasks = server
        .state
        .db
        .get_delivery_tasks_for_inbox(&shared_inbox)
        .await
        .unwrap();
    let dave_tasks = server
        .state
        .db
        .get_delivery_tasks_for_inbox(&dave_inbox)
        .await
        .unwrap();
    assert_eq!(shared_tasks.len(), 1);
    assert_eq!(dave_tasks.len(), 1);

    // First pass: shared inbox delivered, dave rescheduled. Second pass:
    // dave exhausts retries. Backoff is zero so retries are due at once.
    server.state.dispatcher.run_due_tasks_once().await.unwrap();
    server.state.dispatcher.run_due_tasks_once().await.unwrap();

    assert_eq!(shared_received.load(Ordering::SeqCst), 1);

    let shared_task = &server
        .state
        .db
        .get_delivery_tasks_for_inbox(&shared_inbox)
        .await
        .unwrap()[0];
    assert_eq!(shared_task.status, "delivered");

    let dave_task = &server
        .state
        .db
        .get_delivery_tasks_for_inbox(&dave_inbox)
        .await
        .unwrap()[0];
    assert_eq!(dave_task.status, "failed");
    assert_eq!(dave_task.attempts, 2);
    assert!(dave_task.last_error.as_deref().unwrap().contains("2"));
}

#[tokio::test]
async fn resolver_follows_webfinger_to_cached_actor() {
    let server = TestServer::new().await;

    // Remote peer serving discovery and the actor document.
    let actor_uri_holder: Arc<std::sync::OnceLock<String>> = Arc::new(std::sync::OnceLock::new());

    let holder_for_webfinger = actor_uri_holder.clone();
    let holder_for_actor = actor_uri_holder.clone();
    let (_private_pem, public_pem) = test_rsa_keypair();
    let pem_for_actor = public_pem.clone();

    let peer = Router::new()
        .route(
            "/.well-known/webfinger",
            get(move || {
                let actor_uri = holder_for_webfinger.get().cloned().unwrap_or_default();
                async move {
                    axum::Json(json!({
                        "subject": "acct:alice@example.org",
                        "links": [
                            {
                                "rel": "http://webfinger.net/rel/profile-page",
                                "type": "text/html",
                                "href": actor_uri
                            },
                            {
                                "rel": "self",
                                "type": "application/activity+json",
                                "href": actor_uri
                            }
                        ]
                    }))
                }
            }),
        )
        .route(
            "/users/alice",
            get(move || {
                let actor_uri = holder_for_actor.get().cloned().unwrap_or_default();
                let pem = pem_for_actor.clone();
                async move {
                    axum::Json(json!({
                        "id": actor_uri,
                        "type": "Person",
                        "preferredUsername": "alice",
                        "inbox": format!("{}/inbox", actor_uri),
                        "publicKey": {
                            "id": format!("{}#main-key", actor_uri),
                            "owner": actor_uri,
                            "publicKeyPem": pem
                        }
                    }))
                }
            }),
        );
    let peer_url = spawn_peer(peer).await;
    let actor_uri = format!("{}/users/alice", peer_url);
    actor_uri_holder.set(actor_uri.clone()).unwrap();

    let peer_authority = peer_url.strip_prefix("http://").unwrap();
    let resolver = ActorResolver::new(
        server.state.db.clone(),
        server.state.http_client.clone(),
        chrono::Duration::hours(24),
        true,
    );

    let resolved = resolver
        .resolve(&format!("acct:alice@{}", peer_authority))
        .await
        .unwrap();

    assert_eq!(resolved.uri, actor_uri);
    assert_eq!(resolved.inbox_uri, format!("{}/inbox", actor_uri));
    assert_eq!(resolved.username.as_deref(), Some("alice"));

    // The descriptor is cached: a second resolve needs no discovery.
    let cached = server
        .state
        .db
        .get_remote_actor(&actor_uri)
        .await
        .unwrap()
        .expect("remote actor cached");
    assert_eq!(cached.inbox_uri, format!("{}/inbox", actor_uri));
}
