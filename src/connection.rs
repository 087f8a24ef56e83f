use crate::codec::{Decoded, PacketCodec};
use crate::config::ConnectionConfig;
use crate::error::Error;
use crate::protocol::Envelope;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::SocketAddr;
use tokio::net::TcpSocket;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

/// Type alias for WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Build the gateway URL for `base`, pinning the protocol version and JSON encoding
pub fn gateway_url(base: &str, version: u8) -> Result<Url, Error> {
    let mut url =
        Url::parse(base).map_err(|e| Error::ConnectionFailed(format!("Invalid URL: {}", e)))?;

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "v" && k != "encoding")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (k, v) in &kept {
            query.append_pair(k, v);
        }
        query
            .append_pair("v", &version.to_string())
            .append_pair("encoding", "json");
    }

    Ok(url)
}

/// A single gateway transport.
///
/// Owns at most one live socket. Opening a new one disposes the previous
/// socket first. Packets are framed through [`PacketCodec`], so partial
/// reads survive cancellation of [`Connection::read`].
pub struct Connection {
    shard_id: u32,
    config: ConnectionConfig,
    ws: Option<WsStream>,
    codec: PacketCodec,
    close_code: Option<u16>,
}

impl Connection {
    pub fn new(shard_id: u32, config: ConnectionConfig) -> Self {
        Self {
            shard_id,
            config,
            ws: None,
            codec: PacketCodec::new(),
            close_code: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ws.is_some()
    }

    /// Close code received from the server for the last socket, if any
    pub fn close_code(&self) -> Option<u16> {
        self.close_code
    }

    /// Open a new socket to `url`, closing any previous one
    pub async fn connect(&mut self, url: &Url) -> Result<(), Error> {
        if self.ws.is_some() {
            self.disconnect(crate::protocol::NORMAL_CLOSE, "reconnecting").await;
        }
        self.codec.reset();
        self.close_code = None;

        debug!("[SHARD-{}] Connecting to {}", self.shard_id, url);

        let stream = match timeout(self.config.connect_timeout, connect_with_options(url)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::ConnectionFailed(format!(
                    "Connection timeout after {:?}",
                    self.config.connect_timeout
                )))
            }
        };

        info!("[SHARD-{}] Connected to {}", self.shard_id, url);
        self.ws = Some(stream);
        Ok(())
    }

    /// Send one packet.
    ///
    /// Returns `false` without error when no socket is open or the write
    /// failed; failures are logged and surface through the read side.
    pub async fn send(&mut self, envelope: &Envelope) -> bool {
        let Some(ws) = self.ws.as_mut() else {
            debug!(
                "[SHARD-{}] Dropping {} packet, connection not open",
                self.shard_id, envelope.op
            );
            return false;
        };

        let message = match self.codec.encode(envelope) {
            Ok(message) => message,
            Err(e) => {
                warn!("[SHARD-{}] Failed to encode {}: {}", self.shard_id, envelope.op, e);
                return false;
            }
        };

        match ws.send(message).await {
            Ok(()) => {
                trace!("[SHARD-{}] Sent {}", self.shard_id, envelope.op);
                true
            }
            Err(e) => {
                warn!("[SHARD-{}] Failed to send {}: {}", self.shard_id, envelope.op, e);
                false
            }
        }
    }

    /// Read the next packet.
    ///
    /// Returns `None` once the socket is gone: closed by the server, failed,
    /// or never opened. Undecodable packets are logged and skipped.
    pub async fn read(&mut self) -> Option<Envelope> {
        loop {
            let ws = self.ws.as_mut()?;

            let message = match ws.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    warn!("[SHARD-{}] WebSocket error: {}", self.shard_id, e);
                    self.drop_socket();
                    return None;
                }
                None => {
                    info!("[SHARD-{}] WebSocket stream ended", self.shard_id);
                    self.drop_socket();
                    return None;
                }
            };

            match self.codec.decode(message) {
                Ok(Decoded::Packet(envelope)) => return Some(envelope),
                Ok(Decoded::Skip) => continue,
                Ok(Decoded::Close(frame)) => {
                    let code = frame.as_ref().map(|f| u16::from(f.code));
                    info!(
                        "[SHARD-{}] Received close frame (code: {:?}, reason: {})",
                        self.shard_id,
                        code,
                        frame.as_ref().map(|f| f.reason.as_ref()).unwrap_or("")
                    );
                    self.close_code = code;
                    self.drop_socket();
                    return None;
                }
                Err(e) => {
                    warn!("[SHARD-{}] Failed to decode packet: {}", self.shard_id, e);
                    continue;
                }
            }
        }
    }

    /// Close the socket with `code`.
    ///
    /// Bounded by the configured disconnect timeout; errors are swallowed.
    pub async fn disconnect(&mut self, code: u16, reason: &'static str) {
        let Some(mut ws) = self.ws.take() else {
            return;
        };
        self.codec.reset();

        debug!(
            "[SHARD-{}] Closing connection ({}: {})",
            self.shard_id, code, reason
        );

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Borrowed(reason),
        };

        match timeout(self.config.disconnect_timeout, ws.close(Some(frame))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("[SHARD-{}] Close failed: {}", self.shard_id, e),
            Err(_) => debug!(
                "[SHARD-{}] Close timed out after {:?}",
                self.shard_id, self.config.disconnect_timeout
            ),
        }
    }

    fn drop_socket(&mut self) {
        self.ws = None;
        self.codec.reset();
    }
}

/// Connect the TCP stream, tune it, then run the WebSocket handshake
async fn connect_with_options(url: &Url) -> Result<WsStream, Error> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::ConnectionFailed("No host in URL".to_string()))?;

    let is_tls = url.scheme() == "wss";
    let port = url.port().unwrap_or(if is_tls { 443 } else { 80 });

    let request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::ConnectionFailed(format!("Invalid WebSocket request: {}", e)))?;

    let tcp_stream = connect_direct(host, port).await?;

    set_tcp_options(&tcp_stream);

    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new()
            .map_err(|e| Error::ConnectionFailed(format!("TLS error: {}", e)))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let (ws_stream, _response) = client_async_tls_with_config(request, tcp_stream, None, connector)
        .await
        .map_err(Error::WebSocket)?;

    Ok(ws_stream)
}

async fn connect_direct(host: &str, port: u16) -> Result<tokio::net::TcpStream, Error> {
    let dest_str = format!("{}:{}", host, port);
    let dest_addr: SocketAddr = tokio::net::lookup_host(&dest_str)
        .await
        .map_err(|e| Error::ConnectionFailed(format!("DNS lookup failed: {}", e)))?
        .next()
        .ok_or_else(|| Error::ConnectionFailed(format!("No addresses found for {}", host)))?;

    let socket = if dest_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::ConnectionFailed(format!("Failed to create socket: {}", e)))?;

    socket
        .connect(dest_addr)
        .await
        .map_err(|e| Error::ConnectionFailed(format!("TCP connect to {} failed: {}", dest_addr, e)))
}

/// Set TCP options for low latency
fn set_tcp_options(stream: &tokio::net::TcpStream) {
    let sock2 = socket2::SockRef::from(stream);

    // Disable Nagle's algorithm
    let _ = sock2.set_nodelay(true);

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}
