//! The client-side session proxy.
//!
//! A [`ClientProxy`] listens on a local TCP address and forwards each
//! accepted connection to a worker over an authenticated stream. It runs
//! until the session expires, the connection budget is exhausted, or the
//! caller cancels; a proxy moves through Configured, Listening, Draining and
//! Closed and is never restarted — build a new one per session.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::errors::{Error, Result};

pub mod authz;
pub mod worker;

use authz::{new_tofu_token, SessionAuthorization};

/// Budget for the final session-teardown request.
pub const SESSION_TEARDOWN_TIMEOUT_SECS: u64 = 10;

/// Teardown is skipped within this margin of the session expiration: the
/// worker is about to reap the session anyway, and clocks may disagree.
pub const TEARDOWN_SKIP_MARGIN_MINS: i64 = 5;

const LISTENER_ADDR_POLL_MS: u64 = 10;

/// Options for [`ClientProxy::new`].
#[derive(Default)]
pub struct ProxyOptions {
    /// Local address to listen on. Defaults to loopback with the
    /// authorization's default client port; a zero port in either place
    /// falls back to the authorization's default.
    pub listen_addr: Option<SocketAddr>,
    /// If set, remaining-connection updates are forwarded here.
    pub connections_left_tx: Option<mpsc::Sender<i64>>,
    /// Parent cancellation; cancel it to stop the proxy early.
    pub cancel: Option<CancellationToken>,
}

pub struct ClientProxy {
    authz: SessionAuthorization,
    tofu_token: String,
    tls: Arc<rustls::ClientConfig>,
    worker_addr: String,
    listen_addr: SocketAddr,
    expiration: DateTime<Utc>,
    cancel: CancellationToken,
    listener_cancel: CancellationToken,
    listener_closed: Arc<AtomicBool>,
    bound_addr: Arc<OnceLock<SocketAddr>>,
    connections_left: Arc<AtomicI64>,
    conns_tx: mpsc::Sender<i64>,
    conns_rx: Mutex<Option<mpsc::Receiver<i64>>>,
    caller_conns_tx: Option<mpsc::Sender<i64>>,
}

impl ClientProxy {
    /// Build a proxy from an authorization blob. The session's expiration is
    /// read from the client certificate; all scheduling observes it as a
    /// deadline.
    pub fn new(authz_blob: &str, opts: ProxyOptions) -> Result<Self> {
        const OP: &str = "proxy.new";
        let authz = SessionAuthorization::decode(authz_blob)?;
        let tls = authz.client_tls_config()?;
        let expiration = authz.certificate_expiration()?;
        let worker_addr = authz.workers[0].address.clone();

        let mut listen_addr = opts
            .listen_addr
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));
        if listen_addr.port() == 0 {
            listen_addr.set_port(authz.default_client_port);
        }

        let cancel = opts.cancel.unwrap_or_default();
        let listener_cancel = cancel.child_token();
        let (conns_tx, conns_rx) = mpsc::channel(8);
        let connections_left = Arc::new(AtomicI64::new(authz.connection_limit));

        Ok(ClientProxy {
            tofu_token: new_tofu_token(),
            tls,
            worker_addr,
            listen_addr,
            expiration,
            cancel,
            listener_cancel,
            listener_closed: Arc::new(AtomicBool::new(false)),
            bound_addr: Arc::new(OnceLock::new()),
            connections_left,
            conns_tx,
            conns_rx: Mutex::new(Some(conns_rx)),
            caller_conns_tx: opts.connections_left_tx,
            authz,
        })
    }

    /// Run the proxy: bind, accept and forward until the listener closes and
    /// every connection has drained. Not restartable; a second call fails.
    /// The returned error is the teardown outcome when everything else
    /// succeeded.
    pub async fn start(&self) -> Result<()> {
        const OP: &str = "proxy.start";
        let mut conns_rx = self
            .conns_rx
            .lock()
            .map_err(|_| Error::internal(OP, "proxy state poisoned"))?
            .take()
            .ok_or_else(|| Error::internal(OP, "proxy already started"))?;

        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| Error::transport(OP, format!("unable to start listening on {}: {e}", self.listen_addr)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::transport(OP, format!("reading listener address: {e}")))?;
        let _ = self.bound_addr.set(local_addr);
        tracing::info!(addr = %local_addr, session_id = %self.authz.session_id, "session proxy listening");

        // Deadline watchdog: fires the root cancellation at expiration. Not
        // tracked; it is stopped by the final cancel below.
        {
            let cancel = self.cancel.clone();
            let expiration = self.expiration;
            tokio::spawn(async move {
                let until = (expiration - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(until) => cancel.cancel(),
                }
            });
        }

        let tracker = TaskTracker::new();

        // Accept task: owns the listener. Dropping it on exit closes the
        // socket, so "closing the listener" is cancelling its token.
        {
            let conn_tracker = tracker.clone();
            let listener_cancel = self.listener_cancel.clone();
            let cancel = self.cancel.clone();
            let tls = self.tls.clone();
            let worker_addr = self.worker_addr.clone();
            let tofu_token = self.tofu_token.clone();
            let session_id = self.authz.session_id.clone();
            let conns_tx = self.conns_tx.clone();
            tracker.spawn(async move {
                loop {
                    tokio::select! {
                        _ = listener_cancel.cancelled() => break,
                        accepted = listener.accept() => {
                            let (client, peer) = match accepted {
                                Ok(pair) => pair,
                                Err(e) => {
                                    // Accept errors other than closure are
                                    // not fatal to the loop.
                                    tracing::warn!(error = %e, "accept failed; continuing");
                                    continue;
                                }
                            };
                            tracing::debug!(%peer, "accepted client connection");
                            let tls = tls.clone();
                            let worker_addr = worker_addr.clone();
                            let tofu_token = tofu_token.clone();
                            let session_id = session_id.clone();
                            let conns_tx = conns_tx.clone();
                            let cancel = cancel.clone();
                            conn_tracker.spawn(async move {
                                let (ws, hello) = match worker::connect(
                                    tls,
                                    &worker_addr,
                                    &tofu_token,
                                    &session_id,
                                )
                                .await
                                {
                                    Ok(v) => v,
                                    Err(e) => {
                                        tracing::warn!(error = %e, "opening worker stream failed");
                                        return;
                                    }
                                };
                                let _ = conns_tx.send(hello.connections_left).await;
                                if let Err(e) = worker::relay(ws, client, cancel).await {
                                    tracing::warn!(error = %e, "connection relay ended with error");
                                }
                            });
                        }
                    }
                }
            });
        }

        // Budget task: applies remaining-connection updates and closes the
        // listener when the budget reaches zero.
        {
            let cancel = self.cancel.clone();
            let connections_left = self.connections_left.clone();
            let caller_tx = self.caller_conns_tx.clone();
            let listener_closed = self.listener_closed.clone();
            let listener_cancel = self.listener_cancel.clone();
            tracker.spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        update = conns_rx.recv() => match update {
                            Some(n) => {
                                connections_left.store(n, Ordering::SeqCst);
                                if let Some(tx) = &caller_tx {
                                    let _ = tx.send(n).await;
                                }
                                if n == 0 {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
                close_listener(&listener_closed, &connections_left, &listener_cancel);
                // Drain residual updates so connections mid-send never block
                // on a full channel during shutdown.
                while conns_rx.try_recv().is_ok() {}
            });
        }

        tracker.close();
        tracker.wait().await;
        self.cancel.cancel();
        close_listener(&self.listener_closed, &self.connections_left, &self.listener_cancel);

        // Teardown, unless the session is expired or close enough to it that
        // the worker will reap it on its own.
        if Utc::now() < self.expiration - Duration::minutes(TEARDOWN_SKIP_MARGIN_MINS) {
            tokio::time::timeout(
                StdDuration::from_secs(SESSION_TEARDOWN_TIMEOUT_SECS),
                worker::send_teardown(
                    self.tls.clone(),
                    &self.worker_addr,
                    &self.tofu_token,
                    &self.authz.session_id,
                ),
            )
            .await
            .map_err(|_| Error::transport(OP, "session teardown request timed out"))??;
        }
        Ok(())
    }

    /// The bound listener address. Polls until the listener exists; returns
    /// `None` once the given token fires, or immediately when no token is
    /// supplied and the listener is not up yet.
    pub async fn listener_addr(&self, cancel: Option<&CancellationToken>) -> Option<SocketAddr> {
        if let Some(addr) = self.bound_addr.get() {
            return Some(*addr);
        }
        let cancel = cancel?;
        loop {
            if let Some(addr) = self.bound_addr.get() {
                return Some(*addr);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(StdDuration::from_millis(LISTENER_ADDR_POLL_MS)) => {}
            }
        }
    }

    pub fn session_creation(&self) -> DateTime<Utc> {
        self.authz.created_time
    }

    pub fn session_expiration(&self) -> DateTime<Utc> {
        self.expiration
    }

    pub fn connections_left(&self) -> i64 {
        self.connections_left.load(Ordering::SeqCst)
    }

    /// Sender half of the internal remaining-connections channel. Workers
    /// report counts through it via the per-connection handshake; embedders
    /// can inject counts directly.
    pub fn connections_left_sender(&self) -> mpsc::Sender<i64> {
        self.conns_tx.clone()
    }

    /// The root cancellation handle; cancelling it stops the proxy.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Close the listener exactly once across every exit path: zero the budget
/// so the accept loop cannot keep admitting, then cancel its token.
fn close_listener(
    closed: &AtomicBool,
    connections_left: &AtomicI64,
    listener_cancel: &CancellationToken,
) {
    if closed.swap(true, Ordering::SeqCst) {
        return;
    }
    connections_left.store(0, Ordering::SeqCst);
    listener_cancel.cancel();
}
