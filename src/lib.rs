//! # PopSub Session
//!
//! `popsub_session` is a topic-based publish/subscribe session client. A
//! session connects to a broker, keeps typed topics up to date, follows other
//! topics, and exchanges requests with other sessions. When the connection
//! drops it reconnects on its own and restores what it had registered.
//!
//! ## Core Modules
//!
//! - `session`: the `Session` handle, its state machine and the driver task.
//! - `topic`: topic paths, typed values, time series events, topic views, the
//!   topic registry and value streams.
//! - `messaging`: request handlers and filtered request/response correlation.
//! - `reconnect`: backoff strategies and the reconnection policy.
//! - `transport`: frame vocabulary, connections and the WebSocket connector.
//! - `broker`: an in-memory broker for tests and local development.
//! - `config`: layered configuration loading.
//! - `utils`: the error type and logging setup.
//!
//! ```no_run
//! use popsub_session::{Credentials, Session, SessionOptions, TopicType};
//!
//! # async fn run() -> popsub_session::Result<()> {
//! let session = Session::connect(
//!     "ws://localhost:8080",
//!     Credentials::new("control", "password"),
//!     SessionOptions::default(),
//! )
//! .await?;
//! session.add_topic("random/Double", TopicType::Double).await?;
//! session.update("random/Double", 0.42).await?;
//! session.close().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod messaging;
pub mod reconnect;
pub mod session;
pub mod topic;
pub mod transport;
pub mod utils;

pub use messaging::{CloseReason, FilteredEvent, FilteredResponses, IncomingRequest};
pub use reconnect::{ExponentialBackoff, FixedDelay, ReconnectPolicy, ReconnectionStrategy};
pub use session::{RecoveryPolicy, Session, SessionEvent, SessionOptions, SessionState};
pub use topic::{
    AddTopicResult, EventMetadata, TimeSeriesEvent, TopicEvent, TopicSpecification, TopicType,
    TopicValue, TopicView,
};
pub use transport::{Credentials, SessionId};
pub use utils::error::{Result, SessionError};
