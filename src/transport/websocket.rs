//! WebSocket transport
//!
//! Opens a WebSocket to the broker and bridges it to a `Connection`:
//! - a writer task drains the outbound channel into the socket, so only one
//!   task ever writes and frames cannot interleave;
//! - a reader task parses text messages into `ServerFrame`s and pushes them to
//!   the inbound channel. When the socket closes or fails, the reader exits and
//!   the inbound stream ends, which the session sees as a lost connection.
//!
//! A frame that cannot be encoded is never silently skipped: a round trip is
//! failed locally with a `Failed` reply, and a response becomes an error
//! response, so no waiter is left hanging.
//!
//! TLS: `secure` sessions require `wss://`. Certificate validation uses the
//! bundled webpki roots unless a custom `rustls::ClientConfig` is supplied.

use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{Connector as TlsConnector, connect_async_tls_with_config};
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::transport::{
    ClientFrame, Connection, Connector, ErrorReport, OpenRequest, ServerFrame, handshake,
};
use crate::utils::error::{Result, SessionError};

#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    secure: bool,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl WebSocketConnector {
    pub fn new(secure: bool) -> Self {
        Self { secure, tls: None }
    }

    /// Use a caller-provided TLS configuration, which controls certificate
    /// validation. Implies a secure connection.
    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.secure = true;
        self.tls = Some(config);
        self
    }
}

/// Normalise an endpoint into a WebSocket URL. Bare `host:port` endpoints get
/// the scheme implied by `secure`.
pub fn endpoint_url(endpoint: &str, secure: bool) -> Result<String> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(SessionError::connection("endpoint is empty"));
    }
    match endpoint.split_once("://") {
        Some(("ws", _)) if secure => Err(SessionError::connection(
            "secure session requires a wss:// endpoint",
        )),
        Some(("ws", _)) | Some(("wss", _)) => Ok(endpoint.to_string()),
        Some((scheme, _)) => Err(SessionError::connection(format!(
            "unsupported scheme '{scheme}'"
        ))),
        None => {
            let scheme = if secure { "wss" } else { "ws" };
            Ok(format!("{scheme}://{endpoint}"))
        }
    }
}

impl Connector for WebSocketConnector {
    fn open(&self, request: OpenRequest) -> BoxFuture<'static, Result<Connection>> {
        let secure = self.secure;
        let tls = self.tls.clone();

        async move {
            let url = endpoint_url(&request.endpoint, secure)?;
            let (ws_stream, _response) =
                connect_async_tls_with_config(url.as_str(), None, false, tls.map(TlsConnector::Rustls))
                    .await
                    .map_err(|e| SessionError::connection(format!("{url}: {e}")))?;

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerFrame>();
            // weak, so the inbound stream still ends when the reader exits
            let local_replies = in_tx.downgrade();

            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    let text = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to serialize {frame:?}: {e}");
                            match unencodable(&frame, &e.to_string()) {
                                Unencodable::Fail(reply) => {
                                    if let Some(replies) = local_replies.upgrade() {
                                        let _ = replies.send(reply);
                                    }
                                    continue;
                                }
                                Unencodable::Replace(text) => text,
                                Unencodable::Drop => continue,
                            }
                        }
                    };
                    if let Err(e) = ws_sender.send(WsMessage::text(text)).await {
                        debug!("WebSocket write failed: {e}");
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            tokio::spawn(async move {
                while let Some(msg) = ws_receiver.next().await {
                    match msg {
                        Ok(WsMessage::Text(text)) => {
                            match serde_json::from_str::<ServerFrame>(text.as_str()) {
                                Ok(frame) => {
                                    if in_tx.send(frame).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!(
                                    "Invalid server frame: {e} | {}",
                                    text.as_str().chars().take(100).collect::<String>()
                                ),
                            }
                        }
                        Ok(WsMessage::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!("WebSocket read failed: {e}");
                            break;
                        }
                    }
                }
            });

            handshake(Connection::new(out_tx, in_rx), &request).await
        }
        .boxed()
    }
}

/// What to do with a client frame that could not be encoded.
#[derive(Debug, PartialEq)]
pub(crate) enum Unencodable {
    /// Settle the round trip locally with this reply.
    Fail(ServerFrame),
    /// Write this encoded frame instead.
    Replace(String),
    Drop,
}

pub(crate) fn unencodable(frame: &ClientFrame, reason: &str) -> Unencodable {
    if let Some(cid) = frame.conversation() {
        return Unencodable::Fail(ServerFrame::Failed {
            cid,
            error: ErrorReport::Rejected {
                message: format!("frame could not be encoded: {reason}"),
            },
        });
    }
    match frame {
        ClientFrame::Respond { request_id, .. } => {
            let rejection = ClientFrame::RespondError {
                request_id: *request_id,
                message: format!("response could not be encoded: {reason}"),
            };
            match serde_json::to_string(&rejection) {
                Ok(text) => Unencodable::Replace(text),
                Err(_) => Unencodable::Drop,
            }
        }
        _ => Unencodable::Drop,
    }
}
