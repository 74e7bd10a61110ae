//! WebSocket transport for the signaling channel

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use meetup_proto::Message;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as Frame, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use super::connector::{Endpoint, SignalingConnector, SignalingLink};
use crate::error::SignalingError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects with one JSON text frame per signaling message
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    async fn writer_task(
        mut sink: futures::stream::SplitSink<WsStream, Frame>,
        mut outbound: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(message) = outbound.recv().await {
            let text = match message.to_text() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Dropping unencodable signaling message");
                    continue;
                }
            };
            if let Err(e) = sink.send(Frame::Text(text)).await {
                warn!(error = %e, "Failed to send signaling frame");
                break;
            }
        }

        if let Err(e) = sink.close().await {
            debug!(error = %e, "WebSocket close handshake failed");
        }
        debug!("Signaling writer task terminated");
    }

    async fn reader_task(
        mut source: futures::stream::SplitStream<WsStream>,
        inbound: mpsc::UnboundedSender<Message>,
    ) {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(Frame::Text(text)) => match Message::from_text(&text) {
                    Ok(message) => {
                        if inbound.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Ignoring malformed signaling frame"),
                },
                Ok(Frame::Close(frame)) => {
                    info!(?frame, "Signaling server closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Signaling connection error");
                    break;
                }
            }
        }

        debug!("Signaling reader task terminated");
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<SignalingLink, SignalingError> {
        let url = endpoint.to_url()?;
        info!(url = %url, "Connecting to signaling server");

        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::Connect(e.to_string()))?;

        let (sink, source) = stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::writer_task(sink, outbound_rx));
        tokio::spawn(Self::reader_task(source, inbound_tx));

        Ok(SignalingLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
