//! WebSocket gateway server.
//!
//! One listener accepts every peer: lock controllers, card readers, the
//! recognizer worker, and dashboard subscribers. Inbound text frames are
//! validated envelopes forwarded to the coordinator; outbound frames
//! (notifications and commands) are broadcast to every connection, and each
//! peer filters by topic — the same pub/sub contract the field firmware
//! already speaks.

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::notify::NotificationHub;
use crate::types::{CoreEvent, LockCommand};

use super::{command_envelope, notification_envelope, parse_envelope, Envelope, GatewayError};

/// Capacity of the internal outbound frame broadcast.
const OUTBOUND_CAPACITY: usize = 256;

/// The gateway server: one WebSocket endpoint for all peers.
pub struct GatewayServer {
    listen_addr: String,
    events: mpsc::Sender<CoreEvent>,
    hub: NotificationHub,
}

impl GatewayServer {
    /// Create a server that forwards inbound events to `events` and fans out
    /// everything published on `hub`.
    pub fn new(listen_addr: String, events: mpsc::Sender<CoreEvent>, hub: NotificationHub) -> Self {
        Self {
            listen_addr,
            events,
            hub,
        }
    }

    /// Bind and serve until the process shuts down.
    ///
    /// `commands` carries unlock and start-capture instructions from the
    /// coordinator; they are serialized and broadcast alongside
    /// notifications.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind. Per-connection failures
    /// are logged and drop only that connection.
    pub async fn run(self, mut commands: mpsc::Receiver<LockCommand>) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(addr = %self.listen_addr, "gateway listening");

        let (outbound_tx, _) = broadcast::channel::<String>(OUTBOUND_CAPACITY);

        // Pump: hub notifications and coordinator commands become frames.
        let pump_tx = outbound_tx.clone();
        let mut hub_rx = self.hub.subscribe();
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    notification = hub_rx.recv() => match notification {
                        Ok(n) => notification_envelope(&n),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "outbound pump lagged behind the hub");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    command = commands.recv() => match command {
                        Some(c) => command_envelope(&c),
                        None => break,
                    },
                };
                match serde_json::to_string(&envelope) {
                    Ok(frame) => {
                        // Err only means no connection is currently open.
                        let _ = pump_tx.send(frame);
                    }
                    Err(err) => warn!(error = %err, "failed to serialize outbound envelope"),
                }
            }
            debug!("gateway outbound pump stopped");
        });

        loop {
            let (stream, peer) = listener.accept().await?;
            let conn_id = Uuid::new_v4();
            debug!(%peer, %conn_id, "gateway connection accepted");
            let events = self.events.clone();
            let outbound_rx = outbound_tx.subscribe();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, events, outbound_rx).await {
                    debug!(%peer, %conn_id, error = %err, "gateway connection closed");
                }
            });
        }
    }
}

/// Serve one peer until it disconnects or the channels close.
async fn handle_connection(
    stream: TcpStream,
    events: mpsc::Sender<CoreEvent>,
    mut outbound: broadcast::Receiver<String>,
) -> Result<(), GatewayError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    handle_text_frame(&text, &events).await?;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    // Binary, ping, pong: nothing for the core.
                }
                Some(Err(err)) => return Err(err.into()),
            },
            frame = outbound.recv() => match frame {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "slow gateway peer missed frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    Ok(())
}

/// Validate one inbound text frame and forward the event, if any.
///
/// Malformed frames are logged and dropped — never fatal to the connection,
/// and never visible downstream.
async fn handle_text_frame(
    text: &str,
    events: &mpsc::Sender<CoreEvent>,
) -> Result<(), GatewayError> {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "dropping unparseable gateway frame");
            return Ok(());
        }
    };

    match parse_envelope(&envelope) {
        Ok(Some(event)) => events
            .send(event)
            .await
            .map_err(|_| GatewayError::ChannelClosed),
        Ok(None) => {
            debug!(topic = %envelope.topic, "ignoring frame on unconsumed topic");
            Ok(())
        }
        Err(err) => {
            warn!(topic = %envelope.topic, error = %err, "dropping malformed payload");
            Ok(())
        }
    }
}
