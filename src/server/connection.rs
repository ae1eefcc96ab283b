//! Per-connection handler
//!
//! Each accepted connection carries one bidirectional control stream. The
//! read loop decodes frames and dispatches them to the relay core in
//! receipt order; a writer task drains the session's outbound queue onto
//! the send half. When either side stops, the session is torn down.

use std::sync::Arc;

use quinn::{Connection, RecvStream, SendStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::protocol::codec::{Decodable, Encodable};
use crate::protocol::frame::{Frame, FrameCodec, FrameType};
use crate::protocol::messages::{
    Goodbye, JoinRoom, LeaveRoom, NewMessage, Ping, Pong, Setup, StopTyping, Typing,
};
use crate::server::router::{InboundEvent, RelayCore};
use crate::server::session::SessionHandle;

/// Handler for a single client connection
pub struct ConnectionHandler {
    connection: Connection,
    core: Arc<RelayCore>,
}

impl ConnectionHandler {
    /// Create a handler for an accepted connection
    pub fn new(connection: Connection, core: Arc<RelayCore>) -> Self {
        Self { connection, core }
    }

    /// Run the connection to completion
    ///
    /// This is the main entry point that should be spawned as a task.
    pub async fn run(self) -> Result<()> {
        let addr = self.connection.remote_address();
        info!("New connection from {}", addr);

        // The client opens the control stream first
        let (send, recv) = self
            .connection
            .accept_bi()
            .await
            .map_err(|e| RelayError::connection(format!("Failed to accept control stream: {}", e)))?;

        let (handle, outbound_rx) = self.core.connect_session().await;
        let session_id = handle.id.clone();

        let writer = tokio::spawn(write_outbound(send, outbound_rx));

        let result = self.read_events(&handle, recv).await;

        // Teardown runs exactly once even if the transport signals the
        // disconnect more than one way
        self.core.teardown_session(&session_id).await;
        writer.abort();

        info!("Connection from {} closed", addr);
        result
    }

    /// Read frames from the control stream and dispatch them in order
    async fn read_events(&self, handle: &Arc<SessionHandle>, mut recv: RecvStream) -> Result<()> {
        let mut codec = FrameCodec::new();
        let mut buf = vec![0u8; 4096];

        loop {
            match recv.read(&mut buf).await {
                Ok(Some(n)) => {
                    codec.feed(&buf[..n]);

                    loop {
                        match codec.decode_next() {
                            Ok(Some(frame)) => self.handle_frame(handle, frame).await,
                            Ok(None) => break,
                            Err(e) => {
                                return Err(RelayError::protocol(format!(
                                    "Frame decode error: {}",
                                    e
                                )));
                            }
                        }
                    }
                }
                Ok(None) => {
                    debug!("Control stream finished for session {}", handle.id);
                    return Ok(());
                }
                Err(e) => {
                    return Err(RelayError::network(format!(
                        "Control stream read error: {}",
                        e
                    )));
                }
            }
        }
    }

    /// Handle one decoded frame
    ///
    /// Payloads that fail shape validation are dropped with a diagnostic;
    /// the protocol has no inbound error channel, so nothing goes back to
    /// the client.
    async fn handle_frame(&self, handle: &Arc<SessionHandle>, frame: Frame) {
        let event = match frame.frame_type {
            FrameType::Setup => decode(&frame).map(|m: Setup| InboundEvent::Setup {
                identity: m.identity,
            }),
            FrameType::JoinRoom => {
                decode(&frame).map(|m: JoinRoom| InboundEvent::JoinRoom { room: m.room })
            }
            FrameType::LeaveRoom => {
                decode(&frame).map(|m: LeaveRoom| InboundEvent::LeaveRoom { room: m.room })
            }
            FrameType::Typing => {
                decode(&frame).map(|m: Typing| InboundEvent::Typing { room: m.room })
            }
            FrameType::StopTyping => {
                decode(&frame).map(|m: StopTyping| InboundEvent::StopTyping { room: m.room })
            }
            FrameType::NewMessage => {
                decode(&frame).map(|m: NewMessage| InboundEvent::NewMessage { message: m })
            }

            FrameType::Ping => {
                if let Some(ping) = decode::<Ping>(&frame) {
                    let pong = Pong {
                        timestamp: ping.timestamp,
                    };
                    if let Ok(frame) = pong.encode_frame() {
                        handle.push(frame);
                    }
                }
                return;
            }

            FrameType::Goodbye => {
                if let Some(goodbye) = decode::<Goodbye>(&frame) {
                    debug!("Session {} sent goodbye: {}", handle.id, goodbye.reason);
                }
                self.connection.close(0u32.into(), b"goodbye");
                return;
            }

            // Server-to-client frame types are not valid inbound
            FrameType::Connected | FrameType::Pong | FrameType::MessageReceived => {
                warn!(
                    "Dropping unexpected inbound frame {:?} from session {}",
                    frame.frame_type, handle.id
                );
                return;
            }
        };

        if let Some(event) = event {
            if let Err(e) = self.core.handle_event(&handle.id, event).await {
                warn!("Event handling error for session {}: {}", handle.id, e);
            }
        }
    }
}

/// Decode a frame payload, logging and discarding malformed events
fn decode<T: Decodable>(frame: &Frame) -> Option<T> {
    match T::decode_frame(frame) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!("Dropping malformed {:?} event: {}", frame.frame_type, e);
            None
        }
    }
}

/// Drain the session's outbound queue onto the send stream
///
/// Exits when the queue closes (teardown) or the peer stops reading.
async fn write_outbound(mut send: SendStream, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let data = frame.encode_to_bytes();
        if let Err(e) = send.write_all(&data).await {
            debug!("Outbound write ended: {}", e);
            break;
        }
    }
}
