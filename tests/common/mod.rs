//! Common test utilities for E2E tests

#![allow(dead_code)]

use chrono::Utc;
use driftwood::data::{LocalActor, RemoteActor};
use driftwood::{AppState, config};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const TEST_PUBLISH_TOKEN: &str = "test-publish-token-32-bytes-long";
pub const TEST_DOMAIN: &str = "test.example.com";

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance with default test configuration.
    pub async fn new() -> Self {
        Self::with_config_tweaks(|_| {}).await
    }

    /// Create a test server, letting the caller adjust the config first.
    pub async fn with_config_tweaks(tweak: impl FnOnce(&mut config::AppConfig)) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let mut config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
                domain: TEST_DOMAIN.to_string(),
                protocol: "https".to_string(),
            },
            database: config::DatabaseConfig {
                path: db_path.clone(),
            },
            federation: config::FederationConfig {
                actor_cache_ttl_seconds: 86_400,
                clock_skew_seconds: 1800,
                delivery_max_attempts: 8,
                delivery_base_backoff_seconds: 30,
                delivery_concurrency: 4,
                delivery_poll_interval_seconds: 1,
                http_timeout_seconds: 5,
                collection_page_size: 10,
                // Test peers live on 127.0.0.1.
                allow_private_addresses: true,
            },
            api: config::ApiConfig {
                publish_token: TEST_PUBLISH_TOKEN.to_string(),
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };
        tweak(&mut config);

        let state = AppState::new(config).await.unwrap();
        let app = driftwood::build_router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: addr.to_string(),
            state,
            _temp_dir: temp_dir,
            client: reqwest::Client::new(),
        }
    }

    /// Build a full URL for a server path.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Provision a local actor through the publisher (generates real keys).
    pub async fn provision_actor(&self, username: &str) -> LocalActor {
        self.state
            .publisher
            .provision_actor(username, None, None)
            .await
            .unwrap()
    }
}

/// Spawn an in-process axum app playing a remote peer.
///
/// # Returns
/// The peer's base URL, e.g. `http://127.0.0.1:49152`
pub async fn spawn_peer(router: axum::Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Generate a small RSA keypair for test signing.
pub fn test_rsa_keypair() -> (String, String) {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("key generation should work");
    let public_key = RsaPublicKey::from(&private_key);

    (
        private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("private key pem")
            .to_string(),
        public_key
            .to_public_key_pem(LineEnding::LF)
            .expect("public key pem"),
    )
}

/// Insert a remote actor into the server's resolver cache.
///
/// With a fresh `fetched_at` the resolver serves it without network I/O,
/// so signed-inbox flows run fully offline.
pub async fn cache_remote_actor(
    state: &AppState,
    actor_uri: &str,
    inbox_uri: &str,
    shared_inbox_uri: Option<&str>,
    public_key_pem: &str,
) -> RemoteActor {
    let domain = url::Url::parse(actor_uri)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "remote.example".to_string());

    let actor = RemoteActor {
        uri: actor_uri.to_string(),
        username: None,
        domain,
        display_name: None,
        summary: None,
        inbox_uri: inbox_uri.to_string(),
        shared_inbox_uri: shared_inbox_uri.map(str::to_string),
        key_id: format!("{}#main-key", actor_uri),
        public_key_pem: public_key_pem.to_string(),
        fetched_at: Utc::now(),
    };
    state.db.upsert_remote_actor(&actor).await.unwrap();
    actor
}

/// Sign an inbox POST the way a remote peer would.
///
/// # Returns
/// (Date, Digest, Signature) header values for the request.
pub fn sign_inbox_request(
    url: &str,
    body: &[u8],
    private_key_pem: &str,
    key_id: &str,
) -> (String, String, String) {
    let headers =
        driftwood::federation::sign_request("POST", url, Some(body), private_key_pem, key_id)
            .expect("signing should work");

    (
        headers.date,
        headers.digest.expect("digest for body"),
        headers.signature,
    )
}
