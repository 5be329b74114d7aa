//! The `transport` module moves frames between a session and a broker.
//!
//! A `Connector` opens a `Connection` to an endpoint. The connection is a pair
//! of channels: frames pushed into the outbound side are written by a single
//! writer task, and frames read from the network arrive on the inbound side.
//! Any I/O fault simply ends the inbound stream; deciding what to do about it
//! is the session's job, the transport never retries.
//!
//! Two connectors exist: `WebSocketConnector` for real brokers, and
//! `broker::LoopbackConnector` for the in-process broker.

pub mod message;
pub mod websocket;

use std::fmt;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::utils::error::{Result, SessionError};
pub use message::{ClientFrame, ConversationId, ErrorReport, RequestId, ServerFrame, SessionId};
pub use websocket::WebSocketConnector;

/// Upper bound on the open handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct Credentials {
    pub principal: String,
    password: String,
}

impl Credentials {
    pub fn new(principal: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("principal", &self.principal)
            .field("password", &"***")
            .finish()
    }
}

/// Everything a connector needs to open and authenticate a connection.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub endpoint: String,
    pub credentials: Credentials,
    /// Session to resume after a reconnection.
    pub resume: Option<SessionId>,
}

pub trait Connector: Send + Sync + 'static {
    fn open(&self, request: OpenRequest) -> BoxFuture<'static, Result<Connection>>;
}

#[derive(Debug)]
pub struct Connection {
    session_id: SessionId,
    resumed: bool,
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    inbound: mpsc::UnboundedReceiver<ServerFrame>,
}

impl Connection {
    pub fn new(
        outbound: mpsc::UnboundedSender<ClientFrame>,
        inbound: mpsc::UnboundedReceiver<ServerFrame>,
    ) -> Self {
        Self {
            session_id: SessionId::default(),
            resumed: false,
            outbound: Some(outbound),
            inbound,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Whether the broker resumed the session named in `OpenRequest::resume`.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Queue a frame for the broker. Fails once the connection is closed.
    pub fn send(&self, frame: ClientFrame) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(SessionError::ConnectionLost)?;
        outbound
            .send(frame)
            .map_err(|_| SessionError::ConnectionLost)
    }

    /// Next inbound frame, or `None` once the connection is gone.
    pub async fn receive(&mut self) -> Option<ServerFrame> {
        self.inbound.recv().await
    }

    /// Release the connection. Frames already queued are still written.
    pub fn close(&mut self) {
        self.outbound.take();
        self.inbound.close();
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.as_ref().is_none_or(|tx| tx.is_closed())
    }
}

/// Run the open handshake on a freshly opened connection.
pub async fn handshake(mut connection: Connection, request: &OpenRequest) -> Result<Connection> {
    connection
        .send(ClientFrame::Open {
            principal: request.credentials.principal.clone(),
            password: request.credentials.password().to_string(),
            resume: request.resume.clone(),
        })
        .map_err(|_| SessionError::connection("connection closed before handshake"))?;

    match tokio::time::timeout(HANDSHAKE_TIMEOUT, connection.receive()).await {
        Ok(Some(ServerFrame::Opened {
            session_id,
            resumed,
        })) => {
            connection.session_id = session_id;
            connection.resumed = resumed;
            Ok(connection)
        }
        Ok(Some(ServerFrame::Rejected { message })) => {
            connection.close();
            Err(SessionError::Connection { message })
        }
        Ok(Some(other)) => {
            connection.close();
            Err(SessionError::connection(format!(
                "unexpected frame during handshake: {other:?}"
            )))
        }
        Ok(None) => Err(SessionError::connection(
            "connection closed during handshake",
        )),
        Err(_) => {
            connection.close();
            Err(SessionError::connection("handshake timed out"))
        }
    }
}
