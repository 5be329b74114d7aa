use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::loopback::{SharedBroker, lock};
use crate::transport::{ClientFrame, ConversationId, ErrorReport, ServerFrame};

/// Serves the broker over WebSocket on an already bound listener. Each text
/// message carries one JSON frame. Runs until the listener fails.
///
/// A client frame that does not decode but names a conversation is answered
/// with a failure, so the client is never left waiting on it.
pub async fn serve(listener: TcpListener, broker: SharedBroker) {
    if let Ok(addr) = listener.local_addr() {
        info!("WebSocket broker listening on ws://{addr}");
    }

    while let Ok((stream, peer)) = listener.accept().await {
        let broker = broker.clone();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake error from {peer}: {e}");
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();

            // Create channel for this connection
            let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

            let accepted = lock(&broker).accept(tx);
            let (link, mut severed) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!("Refusing {peer}: {e}");
                    let _ = ws_sender.close().await;
                    return;
                }
            };

            // Forward frames from broker to peer until the link is dropped
            spawn(async move {
                while let Some(frame) = rx.recv().await {
                    let encoded = serde_json::to_string(&frame).or_else(|e| {
                        warn!("Failed to serialize frame: {e}");
                        substitute(&frame, &e.to_string())
                            .map_or(Err(e), |frame| serde_json::to_string(&frame))
                    });
                    let Ok(text) = encoded else {
                        continue;
                    };
                    if let Err(e) = ws_sender.send(WsMessage::text(text)).await {
                        debug!("Failed to send to link {link}: {e}");
                        break;
                    }
                }
                let _ = ws_sender.close().await;
                debug!("Send loop closed for link {link}");
            });

            // Handle incoming frames from peer
            loop {
                let msg = tokio::select! {
                    msg = ws_receiver.next() => msg,
                    _ = &mut severed => break,
                };
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(frame) => {
                                lock(&broker).receive(link, frame);
                            }
                            Err(e) => {
                                warn!("Invalid client frame from {peer}: {e}");
                                if let Some(cid) = conversation_of(text.as_str()) {
                                    lock(&broker).reject_malformed(link, cid, &e.to_string());
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }

            debug!("{peer} disconnected");
            lock(&broker).detach(link);
        });
    }
}

/// Stand-in for a server frame that could not be encoded, if the frame
/// answers something the peer waits on.
fn substitute(frame: &ServerFrame, reason: &str) -> Option<ServerFrame> {
    let message = format!("reply could not be encoded: {reason}");
    if let Some(cid) = frame.reply_to() {
        return Some(ServerFrame::Failed {
            cid,
            error: ErrorReport::Rejected { message },
        });
    }
    match frame {
        ServerFrame::FilterResponse { cid, from, .. } => Some(ServerFrame::FilterResponseError {
            cid: *cid,
            from: from.clone(),
            message,
        }),
        _ => None,
    }
}

/// The conversation named by a frame that failed to decode.
fn conversation_of(text: &str) -> Option<ConversationId> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()?
        .get("cid")?
        .as_u64()
}
