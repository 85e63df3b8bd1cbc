use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::{CloseCode, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Frame written by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close(CloseCode),
}

/// Frame surfaced by an open socket.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Text(String),
    Closed { code: CloseCode, reason: Option<String> },
}

/// An open socket seen as a pair of channels. The inbound side ending
/// without a `Closed` frame counts as an abnormal closure.
#[derive(Debug)]
pub struct SocketChannel {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

/// The far ends of a [`SocketChannel`], held by whatever drives the wire.
#[derive(Debug)]
pub struct SocketPeer {
    pub outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    pub inbound: mpsc::UnboundedSender<InboundFrame>,
}

impl SocketChannel {
    pub fn pair() -> (SocketChannel, SocketPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            SocketChannel {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            SocketPeer {
                outbound: outbound_rx,
                inbound: inbound_tx,
            },
        )
    }

    pub fn close(self, code: CloseCode) {
        let _ = self.outbound.send(OutboundFrame::Close(code));
    }
}

/// Opens sockets. `Ok` means the handshake completed and the socket is open.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<SocketChannel, TransportError>;
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    handshake_timeout: Duration,
}

impl WsConnector {
    pub fn new() -> Self {
        install_crypto_provider();
        Self {
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        }
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<SocketChannel, TransportError> {
        let request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

        let (stream, _response) =
            tokio::time::timeout(self.handshake_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| TransportError::HandshakeFailed {
                    url: redact(url),
                    reason: format!("timed out after {:?}", self.handshake_timeout),
                })?
                .map_err(|e| TransportError::HandshakeFailed {
                    url: redact(url),
                    reason: e.to_string(),
                })?;

        let (channel, peer) = SocketChannel::pair();
        tokio::spawn(pump(stream, peer));
        Ok(channel)
    }
}

/// `wss://` handshakes need a process-wide rustls provider. Another one may
/// already be installed by the host, which is fine.
fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Move frames between the socket and the channel pair until either side
/// closes.
async fn pump(stream: WsStream, mut peer: SocketPeer) {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            frame = peer.outbound.recv() => {
                match frame {
                    Some(OutboundFrame::Text(text)) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            warn!("WebSocket write failed: {}", e);
                            let _ = peer.inbound.send(InboundFrame::Closed {
                                code: CloseCode::Abnormal,
                                reason: Some(e.to_string()),
                            });
                            break;
                        }
                    }
                    Some(OutboundFrame::Close(code)) => {
                        send_close(&mut write, code).await;
                        break;
                    }
                    // Owner went away without closing.
                    None => {
                        send_close(&mut write, CloseCode::Normal).await;
                        break;
                    }
                }
            }

            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if peer.inbound.send(InboundFrame::Text(text.as_str().to_string())).is_err() {
                            send_close(&mut write, CloseCode::Normal).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        debug!("Ignoring {} byte binary frame", data.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => {
                                let reason = frame.reason.as_str().to_string();
                                (
                                    CloseCode::from_u16(u16::from(frame.code)),
                                    (!reason.is_empty()).then_some(reason),
                                )
                            }
                            None => (CloseCode::NoStatus, None),
                        };
                        let _ = peer.inbound.send(InboundFrame::Closed { code, reason });
                        break;
                    }
                    // Pings are answered by tungstenite.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = peer.inbound.send(InboundFrame::Closed {
                            code: CloseCode::Abnormal,
                            reason: Some(e.to_string()),
                        });
                        break;
                    }
                    None => {
                        let _ = peer.inbound.send(InboundFrame::Closed {
                            code: CloseCode::Abnormal,
                            reason: None,
                        });
                        break;
                    }
                }
            }
        }
    }
}

async fn send_close<S>(write: &mut S, code: CloseCode)
where
    S: Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code: code.as_u16().into(),
        reason: String::new().into(),
    };
    if write.send(Message::Close(Some(frame))).await.is_err() {
        debug!("Socket already gone while sending close frame");
    }
    let _ = write.close().await;
}

/// URL with the token query value masked, for logs and error messages.
pub fn redact(url: &Url) -> String {
    let mut masked = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            let value = if key == "token" { "***".to_string() } else { value.into_owned() };
            (key.into_owned(), value)
        })
        .collect();

    if pairs.is_empty() {
        return masked.to_string();
    }

    masked.query_pairs_mut().clear().extend_pairs(pairs);
    masked.to_string()
}
