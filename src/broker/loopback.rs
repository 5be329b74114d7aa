//! In-process connector to a shared `Broker`.
//!
//! Each connection gets a pump task that feeds client frames to the broker
//! until the client lets go of the connection or the broker severs it. Frames
//! from the broker go straight into the connection's inbound channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::broker::Broker;
use crate::transport::{ClientFrame, Connection, Connector, OpenRequest, handshake};
use crate::utils::error::Result;

pub type SharedBroker = Arc<Mutex<Broker>>;

/// Locks the broker. A panic while holding the lock leaves the broker state
/// consistent enough for tests, so poisoning is ignored.
pub fn lock(broker: &Mutex<Broker>) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    broker: SharedBroker,
}

impl LoopbackConnector {
    pub fn new(broker: SharedBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }
}

impl Connector for LoopbackConnector {
    fn open(&self, request: OpenRequest) -> BoxFuture<'static, Result<Connection>> {
        let broker = self.broker.clone();
        async move {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (link, mut severed) = lock(&broker).accept(inbound_tx)?;
            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        frame = outbound_rx.recv() => match frame {
                            Some(frame) => {
                                lock(&broker).receive(link, frame);
                            }
                            None => break,
                        },
                        _ = &mut severed => break,
                    }
                }
                lock(&broker).detach(link);
                debug!("Loopback link {link} closed");
            });

            handshake(Connection::new(outbound_tx, inbound_rx), &request).await
        }
        .boxed()
    }
}
