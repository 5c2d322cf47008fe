//! Control-plane bridge.
//!
//! A thin WebSocket layer between peers and the transfer engine: commands
//! (open a room listener, offer/accept/reject a file, status/cancel/retry)
//! map onto engine calls, and the engine's lifecycle event feed plus
//! peer-to-peer offer messages are relayed to every connected client.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use roomdrop_transfer::TransferEngine;
use roomdrop_types::api::ControlMessage;

/// Ports for room listeners are drawn from this range, one per request.
const PORT_RANGE_BASE: u16 = 5000;
const PORT_RANGE_SPAN: u16 = 1000;

/// Shared bridge state: the engine plus a fan-out channel for peer-directed
/// control messages (offers, accept/reject relays).
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    engine: TransferEngine,
    peers: broadcast::Sender<ControlMessage>,
}

impl Bridge {
    pub fn new(engine: TransferEngine) -> Self {
        let (peers, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(BridgeInner { engine, peers }),
        }
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.inner.engine
    }

    fn subscribe_peers(&self) -> broadcast::Receiver<ControlMessage> {
        self.inner.peers.subscribe()
    }

    fn broadcast(&self, msg: ControlMessage) {
        let _ = self.inner.peers.send(msg);
    }

    /// Handle one command. Returns the direct reply for the requesting
    /// client, if any; relayed messages go out through the peer channel.
    async fn dispatch(&self, cmd: ControlMessage) -> Option<ControlMessage> {
        match cmd {
            ControlMessage::OpenTransfer { room_id, protocol } => {
                let port =
                    PORT_RANGE_BASE + rand::rng().random_range(0..PORT_RANGE_SPAN);
                match self.engine().open_listener(&room_id, protocol, port).await {
                    Ok(bound) => Some(ControlMessage::TransferReady {
                        room_id,
                        protocol,
                        port: bound,
                    }),
                    Err(err) => {
                        warn!(%room_id, %protocol, error = %err, "listener request failed");
                        Some(ControlMessage::ControlError {
                            code: err.code().to_string(),
                            message: err.to_string(),
                        })
                    }
                }
            }

            ControlMessage::SendFile {
                room_id,
                filename,
                file_size,
                mime_type,
                protocol,
                from_username,
            } => match self.engine().validate(&mime_type, file_size) {
                Ok(()) => {
                    let transfer_id = Uuid::new_v4().to_string();
                    info!(
                        %transfer_id,
                        %room_id,
                        %filename,
                        file_size,
                        %protocol,
                        %from_username,
                        "file offer"
                    );
                    self.broadcast(ControlMessage::FileIncoming {
                        transfer_id,
                        room_id,
                        from_username,
                        filename,
                        file_size,
                        protocol,
                        sent_at: Utc::now(),
                    });
                    None
                }
                Err(err) => Some(ControlMessage::ControlError {
                    code: err.code().to_string(),
                    message: err.to_string(),
                }),
            },

            ControlMessage::AcceptFile {
                transfer_id,
                protocol,
                port,
            } => {
                info!(%transfer_id, %protocol, port, "file offer accepted");
                self.broadcast(ControlMessage::FileAccepted {
                    transfer_id,
                    protocol,
                    port,
                });
                None
            }

            ControlMessage::RejectFile { transfer_id } => {
                info!(%transfer_id, "file offer rejected");
                self.broadcast(ControlMessage::FileRejected {
                    transfer_id,
                    reason: "user rejected".to_string(),
                });
                None
            }

            ControlMessage::GetStatus { transfer_id } => Some(ControlMessage::Status {
                report: self.engine().status(&transfer_id),
            }),

            ControlMessage::CancelTransfer { transfer_id } => {
                let result = match self.engine().cancel(&transfer_id) {
                    Ok(()) => ControlMessage::ActionResult {
                        success: true,
                        message: format!("transfer {} cancelled", transfer_id),
                    },
                    Err(err) => ControlMessage::ActionResult {
                        success: false,
                        message: err.to_string(),
                    },
                };
                Some(result)
            }

            ControlMessage::RetryTransfer { transfer_id } => {
                let result = match self.engine().retry(&transfer_id) {
                    Ok(()) => ControlMessage::ActionResult {
                        success: true,
                        message: format!("transfer {} retrying", transfer_id),
                    },
                    Err(err) => ControlMessage::ActionResult {
                        success: false,
                        message: err.to_string(),
                    },
                };
                Some(result)
            }

            // server → client shapes arriving from a client are ignored
            other => {
                debug!(?other, "ignoring non-command control message");
                None
            }
        }
    }
}

pub async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

pub async fn ws_handler(
    State(bridge): State<Bridge>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, bridge))
}

async fn handle_socket(socket: WebSocket, bridge: Bridge) {
    let (mut sender, mut receiver) = socket.split();

    let mut engine_events = bridge.engine().subscribe();
    let mut peer_msgs = bridge.subscribe_peers();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ControlMessage>();

    info!("control peer connected");

    // Forward lifecycle events, peer relays, and direct replies to the client.
    let send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                event = engine_events.recv() => match event {
                    Ok(event) => serde_json::to_string(&event).unwrap(),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("event feed lagged by {} messages", n);
                        continue;
                    }
                    Err(_) => break,
                },
                msg = peer_msgs.recv() => match msg {
                    Ok(msg) => serde_json::to_string(&msg).unwrap(),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("peer feed lagged by {} messages", n);
                        continue;
                    }
                    Err(_) => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(msg) => serde_json::to_string(&msg).unwrap(),
                    None => break,
                },
            };

            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Parse and dispatch commands from the client.
    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };

        let cmd: ControlMessage = match serde_json::from_str(&text) {
            Ok(cmd) => cmd,
            Err(err) => {
                warn!(error = %err, "bad control message");
                continue;
            }
        };

        if let Some(reply) = bridge.dispatch(cmd).await {
            if reply_tx.send(reply).is_err() {
                break;
            }
        }
    }

    send_task.abort();
    info!("control peer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomdrop_transfer::EngineConfig;
    use roomdrop_types::models::Protocol;

    fn test_bridge() -> Bridge {
        Bridge::new(TransferEngine::new(EngineConfig::default()))
    }

    #[tokio::test]
    async fn status_for_unknown_transfer_is_empty() {
        let bridge = test_bridge();
        let reply = bridge
            .dispatch(ControlMessage::GetStatus {
                transfer_id: "missing".into(),
            })
            .await;
        match reply {
            Some(ControlMessage::Status { report }) => assert!(report.is_none()),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn invalid_file_offer_is_rejected_synchronously() {
        let bridge = test_bridge();
        let reply = bridge
            .dispatch(ControlMessage::SendFile {
                room_id: "A1B2C3D4".into(),
                filename: "tool.exe".into(),
                file_size: 1024,
                mime_type: "application/x-dosexec".into(),
                protocol: Protocol::Tcp,
                from_username: "mallory".into(),
            })
            .await;
        match reply {
            Some(ControlMessage::ControlError { code, .. }) => {
                assert_eq!(code, "INVALID_FILE");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancel_of_unknown_transfer_reports_failure() {
        let bridge = test_bridge();
        let reply = bridge
            .dispatch(ControlMessage::CancelTransfer {
                transfer_id: "missing".into(),
            })
            .await;
        match reply {
            Some(ControlMessage::ActionResult { success, message }) => {
                assert!(!success);
                assert!(message.contains("not found"));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn accepted_offer_is_relayed_to_peers() {
        let bridge = test_bridge();
        let mut peers = bridge.subscribe_peers();

        let reply = bridge
            .dispatch(ControlMessage::AcceptFile {
                transfer_id: "t9".into(),
                protocol: Protocol::Udp,
                port: 5100,
            })
            .await;
        assert!(reply.is_none());

        match peers.try_recv().unwrap() {
            ControlMessage::FileAccepted {
                transfer_id, port, ..
            } => {
                assert_eq!(transfer_id, "t9");
                assert_eq!(port, 5100);
            }
            other => panic!("unexpected relay: {:?}", other),
        }
    }
}
