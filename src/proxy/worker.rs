//! The authenticated stream to a worker.
//!
//! Each client connection is carried over a TLS websocket to the worker. The
//! first exchange on every stream is a small JSON handshake: the proxy
//! presents its TOFU token and session id, the worker answers with the
//! session's remaining connection count. After that the stream carries raw
//! binary frames. Session teardown reuses the same endpoint with a teardown
//! marker instead of entering the relay.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::errors::{Error, Result};

pub type WorkerStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// First message on every worker stream.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientHello {
    pub tofu_token: String,
    pub session_id: String,
    /// When set, the stream is a session-teardown request and no relay
    /// follows.
    #[serde(default)]
    pub teardown: bool,
}

/// The worker's handshake reply.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerHello {
    pub connections_left: i64,
}

/// Open a worker stream and run the handshake.
pub async fn connect(
    tls: Arc<rustls::ClientConfig>,
    worker_addr: &str,
    tofu_token: &str,
    session_id: &str,
) -> Result<(WorkerStream, WorkerHello)> {
    const OP: &str = "worker.connect";
    let mut ws = open_stream(OP, tls, worker_addr).await?;

    let hello = ClientHello {
        tofu_token: tofu_token.to_string(),
        session_id: session_id.to_string(),
        teardown: false,
    };
    let hello = serde_json::to_string(&hello).map_err(|e| Error::encoding(OP, e))?;
    ws.send(Message::Text(hello)).await.map_err(|e| Error::transport(OP, e))?;

    while let Some(msg) = ws.next().await {
        match msg.map_err(|e| Error::transport(OP, e))? {
            Message::Text(raw) => {
                let reply: WorkerHello =
                    serde_json::from_str(&raw).map_err(|e| Error::encoding(OP, e))?;
                return Ok((ws, reply));
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => {
                return Err(Error::transport(OP, format!("unexpected handshake frame: {other:?}")))
            }
        }
    }
    Err(Error::transport(OP, "worker closed the stream during the handshake"))
}

/// Copy bytes both ways between the client connection and the worker stream
/// until either side closes or the token fires.
pub async fn relay(ws: WorkerStream, client: TcpStream, cancel: CancellationToken) -> Result<()> {
    let (mut ws_sink, mut ws_stream) = ws.split();
    let (mut client_read, mut client_write) = client.into_split();

    let client_to_worker = async {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if ws_sink.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_sink.close().await;
    };

    let worker_to_client = async {
        while let Some(msg) = ws_stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    if client_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = client_write.shutdown().await;
    };

    // Either direction ending, or cancellation, ends the connection.
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = client_to_worker => {}
        _ = worker_to_client => {}
    }
    Ok(())
}

/// Send the final session-teardown request. Callers apply their own
/// deadline; this performs a single handshake-and-close exchange.
pub async fn send_teardown(
    tls: Arc<rustls::ClientConfig>,
    worker_addr: &str,
    tofu_token: &str,
    session_id: &str,
) -> Result<()> {
    const OP: &str = "worker.send_teardown";
    let mut ws = open_stream(OP, tls, worker_addr).await?;
    let hello = ClientHello {
        tofu_token: tofu_token.to_string(),
        session_id: session_id.to_string(),
        teardown: true,
    };
    let hello = serde_json::to_string(&hello).map_err(|e| Error::encoding(OP, e))?;
    ws.send(Message::Text(hello)).await.map_err(|e| Error::transport(OP, e))?;
    let _ = ws.close(None).await;
    Ok(())
}

async fn open_stream(
    op: &'static str,
    tls: Arc<rustls::ClientConfig>,
    worker_addr: &str,
) -> Result<WorkerStream> {
    let uri = format!("wss://{worker_addr}/v1/proxy");
    let request = Request::builder()
        .uri(uri.as_str())
        .body(())
        .map_err(|e| Error::transport(op, format!("building request for {uri}: {e}")))?;
    let (ws, _resp) =
        connect_async_tls_with_config(request, None, false, Some(Connector::Rustls(tls)))
            .await
            .map_err(|e| Error::transport(op, format!("connecting to worker {worker_addr}: {e}")))?;
    Ok(ws)
}
