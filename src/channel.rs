//! WebSocket channel to the sync relay.
//!
//! Lifecycle:
//!
//! ```text
//! Disconnected ─connect()─▶ Connecting ─▶ Authenticating ─▶ Open
//!       ▲                                                    │
//!       └──────────── connect() ◀── Closed / Failed ◀────────┘
//! ```
//!
//! The auth frame goes out immediately after the socket opens, before
//! the channel reports `Open` — the server never acks it. While the
//! channel is anything other than `Open`, outbound sends are silently
//! dropped; there is no queue and no auto-reconnect. Recovery is the
//! owner calling `connect` again and re-flushing from its baseline.
//!
//! Reader and writer run as background tasks. Each `connect` bumps an
//! epoch so a close event from a previous connection's reader cannot
//! tear down the replacement.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{AuthFrame, ConnectionId, ControlFrame};

/// Where to find the document's relay endpoint.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub base_url: String,
    pub project: String,
    pub document_id: String,
}

impl ChannelConfig {
    pub fn endpoint(&self) -> String {
        format!("{}/{}/{}", self.base_url, self.project, self.document_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Authenticating,
    Open,
    /// Peer or network closed the socket cleanly.
    Closed,
    /// The socket died with an error.
    Failed,
}

/// Inbound traffic and lifecycle notifications, consumed by the
/// owning session.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Binary frame: an encoded document change.
    Delta(Vec<u8>),
    /// Text frame, already classified.
    Control(ControlFrame),
    /// The reader task ended. `epoch` identifies which connection.
    Closed { failed: bool, epoch: u64 },
}

#[derive(Debug, Clone)]
pub enum ChannelError {
    ConnectFailed(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectFailed(e) => write!(f, "Connect failed: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {}

pub struct Channel {
    config: ChannelConfig,
    state: ChannelState,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    /// Bumped on every successful connect; stale reader tasks carry
    /// the epoch they were spawned under.
    epoch: u64,
}

impl Channel {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            state: ChannelState::Disconnected,
            outgoing: None,
            epoch: 0,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// Dial the relay, send the auth handshake, spawn the socket
    /// tasks. Inbound frames arrive on `events`.
    pub async fn connect(
        &mut self,
        connection_id: ConnectionId,
        jwt: &str,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<(), ChannelError> {
        self.state = ChannelState::Connecting;
        self.outgoing = None;

        let url = self.config.endpoint();
        let ws = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                self.state = ChannelState::Disconnected;
                return Err(ChannelError::ConnectFailed(e.to_string()));
            }
        };
        let (mut writer, mut reader) = ws.split();

        self.state = ChannelState::Authenticating;
        let auth = AuthFrame::new(connection_id, jwt).encode();
        if let Err(e) = writer.send(Message::Text(auth.into())).await {
            self.state = ChannelState::Disconnected;
            return Err(ChannelError::ConnectFailed(e.to_string()));
        }

        self.epoch += 1;
        let epoch = self.epoch;

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if writer.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        // Reader task: classify inbound frames until the socket ends.
        tokio::spawn(async move {
            let mut failed = false;
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => {
                        let _ = events.send(ChannelEvent::Delta(data.to_vec()));
                    }
                    Ok(Message::Text(text)) => {
                        let _ = events.send(ChannelEvent::Control(ControlFrame::parse(
                            text.as_str(),
                        )));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Socket read error: {e}");
                        failed = true;
                        break;
                    }
                }
            }
            let _ = events.send(ChannelEvent::Closed { failed, epoch });
        });

        self.outgoing = Some(out_tx);
        self.state = ChannelState::Open;
        log::info!("Channel open: {url}");
        Ok(())
    }

    /// Send an encoded change. Dropped silently unless `Open`.
    pub fn send_delta(&self, payload: Vec<u8>) {
        if !self.is_open() {
            log::debug!("Dropping delta: channel not open");
            return;
        }
        if let Some(tx) = &self.outgoing {
            let _ = tx.send(Message::Binary(payload.into()));
        }
    }

    /// Send a presence text frame. Dropped silently unless `Open`.
    pub fn send_presence(&self, text: String) {
        if !self.is_open() {
            log::debug!("Dropping presence frame: channel not open");
            return;
        }
        if let Some(tx) = &self.outgoing {
            let _ = tx.send(Message::Text(text.into()));
        }
    }

    /// Apply a reader task's close notification. Returns false (and
    /// changes nothing) when the event is from a superseded
    /// connection.
    pub fn handle_closed(&mut self, failed: bool, epoch: u64) -> bool {
        if epoch != self.epoch {
            log::debug!("Ignoring close event from stale connection (epoch {epoch})");
            return false;
        }
        self.outgoing = None;
        self.state = if failed {
            ChannelState::Failed
        } else {
            ChannelState::Closed
        };
        log::info!("Channel closed (failed: {failed})");
        true
    }

    /// Drop the connection locally. A later close event from the old
    /// reader is ignored.
    pub fn close(&mut self) {
        if let Some(tx) = self.outgoing.take() {
            let _ = tx.send(Message::Close(None));
        }
        self.epoch += 1;
        self.state = ChannelState::Disconnected;
    }
}
