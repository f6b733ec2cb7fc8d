//! Shared fixtures: deterministic keyrings, seeded targets, session
//! certificates and an in-process worker.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use gatehouse::cache::Repository;
use gatehouse::keyring::{KeyringToken, KeyringTokenLookup};
use gatehouse::proxy::authz::{SessionAuthorization, WorkerInfo};
use gatehouse::store::targets::{Target, TargetStore};
use gatehouse::store::{to_millis, Store};

/// Deterministic keyring in the style of the daemon's real one: every
/// `(kind, name)` pair resolves to a token derived from the name, unless it
/// has been revoked.
#[derive(Default)]
pub struct TestKeyring {
    revoked: Mutex<HashSet<(String, String)>>,
}

impl TestKeyring {
    /// Token names map to users by their prefix before the first dot, so
    /// "alice.laptop" and "alice.desktop" both belong to `u_alice`.
    pub fn token_for(name: &str) -> KeyringToken {
        let user = name.split('.').next().unwrap_or(name);
        KeyringToken {
            id: format!("at_{name}"),
            user_id: format!("u_{user}"),
            token: format!("at_{name}_secret"),
        }
    }

    pub fn revoke(&self, keyring_type: &str, token_name: &str) {
        self.revoked
            .lock()
            .unwrap()
            .insert((keyring_type.to_string(), token_name.to_string()));
    }
}

impl KeyringTokenLookup for TestKeyring {
    fn lookup(&self, keyring_kind: &str, token_name: &str) -> Option<KeyringToken> {
        let revoked = self.revoked.lock().unwrap();
        if revoked.contains(&(keyring_kind.to_string(), token_name.to_string())) {
            return None;
        }
        Some(Self::token_for(token_name))
    }
}

pub async fn test_repository() -> (Store, Repository, Arc<TestKeyring>) {
    let store = Store::open_in_memory().await.unwrap();
    let keyring = Arc::new(TestKeyring::default());
    (store.clone(), Repository::new(store, keyring.clone()), keyring)
}

/// Create `n` targets whose create and update times step backwards from
/// `newest`, oldest first in the returned vec (index 0 is oldest).
pub async fn seed_targets(
    store: &Store,
    targets: &TargetStore,
    n: usize,
    newest: DateTime<Utc>,
) -> Vec<Target> {
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let t = targets
            .create_target(&format!("target-{i}"), "", &format!("10.0.0.{i}:22"))
            .await
            .unwrap();
        let at = newest - Duration::minutes((n - 1 - i) as i64);
        set_target_times(store, &t.public_id, at, at).await;
        out.push(targets.lookup_target(&t.public_id).await.unwrap().unwrap());
    }
    out
}

/// Rewrite a target's timestamps directly, the way test setups pin rows to
/// known instants.
pub async fn set_target_times(
    store: &Store,
    public_id: &str,
    create_time: DateTime<Utc>,
    update_time: DateTime<Utc>,
) {
    sqlx::query("update target set create_time = ?, update_time = ? where public_id = ?")
        .bind(to_millis(create_time))
        .bind(to_millis(update_time))
        .bind(public_id)
        .execute(store.pool())
        .await
        .unwrap();
}

/// Pin the stored row-count approximation for a resource kind.
pub async fn set_estimate(store: &Store, resource_kind: &str, estimate: i64) {
    sqlx::query(
        "insert into resource_count_estimate (resource_kind, estimate, update_time) values (?, ?, ?) \
         on conflict (resource_kind) do update set estimate = excluded.estimate",
    )
    .bind(resource_kind)
    .bind(estimate)
    .bind(to_millis(Utc::now()))
    .execute(store.pool())
    .await
    .unwrap();
}

/// Rewrite a stored token's last accessed time so orderings are exact.
pub async fn set_token_last_accessed(
    store: &Store,
    keyring_type: &str,
    token_name: &str,
    at: DateTime<Utc>,
) {
    sqlx::query(
        "update cache_stored_token set last_accessed_time = ? where keyring_type = ? and token_name = ?",
    )
    .bind(to_millis(at))
    .bind(keyring_type)
    .bind(token_name)
    .execute(store.pool())
    .await
    .unwrap();
}

/// A session certificate set: CA plus a leaf for "localhost" whose validity
/// end is the session expiration.
pub struct SessionCerts {
    pub leaf_der: Vec<u8>,
    pub ca_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

pub fn session_certs(expires_in: Duration) -> SessionCerts {
    let ca_key = rcgen::KeyPair::generate().unwrap();
    let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = rcgen::KeyPair::generate().unwrap();
    let mut leaf_params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let now = time::OffsetDateTime::now_utc();
    leaf_params.not_before = now - time::Duration::minutes(5);
    leaf_params.not_after = now + time::Duration::seconds(expires_in.num_seconds());
    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

    SessionCerts {
        leaf_der: leaf_cert.der().to_vec(),
        ca_der: ca_cert.der().to_vec(),
        key_der: leaf_key.serialize_der(),
    }
}

pub fn session_authorization(
    certs: &SessionCerts,
    worker_addr: &str,
    connection_limit: i64,
    expires_in: Duration,
) -> SessionAuthorization {
    let now = Utc::now();
    SessionAuthorization {
        session_id: "s_testsession01".to_string(),
        created_time: now,
        expiration: now + expires_in,
        connection_limit,
        default_client_port: 0,
        workers: vec![WorkerInfo { address: worker_addr.to_string() }],
        certificate_chain: vec![certs.leaf_der.clone(), certs.ca_der.clone()],
        private_key: certs.key_der.clone(),
    }
}

/// Records of what an in-process worker observed.
#[derive(Default)]
pub struct WorkerLog {
    pub handshakes: Mutex<Vec<String>>,
    pub teardowns: Mutex<Vec<String>>,
}

/// Spawn a TLS websocket worker that answers handshakes with the given
/// remaining-connection count and echoes binary frames. Returns its address.
pub async fn spawn_worker(
    certs: &SessionCerts,
    connections_left_reply: i64,
) -> (String, Arc<WorkerLog>) {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(
        vec![
            rustls::pki_types::CertificateDer::from(certs.leaf_der.clone()),
            rustls::pki_types::CertificateDer::from(certs.ca_der.clone()),
        ],
        rustls::pki_types::PrivateKeyDer::Pkcs8(rustls::pki_types::PrivatePkcs8KeyDer::from(
            certs.key_der.clone(),
        )),
    )
    .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let log = Arc::new(WorkerLog::default());

    let worker_log = log.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let acceptor = acceptor.clone();
            let log = worker_log.clone();
            tokio::spawn(async move {
                let Ok(tls_stream) = acceptor.accept(stream).await else { return };
                let Ok(mut ws) = tokio_tungstenite::accept_async(tls_stream).await else {
                    return;
                };

                // First frame is the client hello.
                let hello = loop {
                    match ws.next().await {
                        Some(Ok(Message::Text(raw))) => break raw,
                        Some(Ok(_)) => continue,
                        _ => return,
                    }
                };
                let parsed: serde_json::Value = serde_json::from_str(&hello).unwrap();
                if parsed["teardown"].as_bool().unwrap_or(false) {
                    log.teardowns.lock().unwrap().push(hello);
                    let _ = ws.close(None).await;
                    return;
                }
                log.handshakes.lock().unwrap().push(hello);

                let reply = serde_json::json!({ "connections_left": connections_left_reply });
                if ws.send(Message::Text(reply.to_string())).await.is_err() {
                    return;
                }

                // Echo binary frames until the peer goes away.
                while let Some(msg) = ws.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            if ws.send(Message::Binary(data)).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            });
        }
    });

    (format!("localhost:{port}"), log)
}
