//! Per-session gateway bridge: accepted WebSocket ↔ dialed TCP destination.
//!
//! One bridge runs per authorized `/vnc` upgrade. It owns exactly one client
//! transport and one TCP socket for its lifetime: dial, wrap the TCP read
//! path in the magic sniffer, adapt the WebSocket into byte stream/sink
//! form, and hand both to [`relay::run_duplex`]. Dial failures end the
//! session immediately — retry is a reverse-tunnel concern, never the
//! gateway's.
//!
//! After the session quiesces, a sniffed mismatch is reported as
//! [`BridgeError::ProtocolMismatch`] so a misconfigured destination (an
//! HTTP server on the "VNC" port, say) gets its own log line instead of
//! drowning in generic relay errors.

use std::io;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::future::ready;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;

use crate::relay;
use crate::sniff::MagicSniffer;

/// The RFB protocol version handshake starts with these bytes.
pub const RFB_MAGIC: &[u8] = b"RFB";

/// How a bridge session failed.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// TCP connect to the destination failed; nothing was relayed.
    #[error("dial {addr}: {source}")]
    Dial { addr: String, source: io::Error },
    /// The destination connected but did not open with the expected magic.
    #[error("attempt to connect to non-VNC port ({addr}, observed {observed:?})")]
    ProtocolMismatch { addr: String, observed: String },
    /// Read/write failure while relaying.
    #[error("relay {addr}: {source}")]
    Io { addr: String, source: io::Error },
}

/// Run one bridge session to completion. Blocks until both directions have
/// quiesced and both endpoints are closed.
pub async fn run(
    socket: WebSocket,
    addr: &str,
    magic: &'static [u8],
) -> Result<(), BridgeError> {
    let tcp = match TcpStream::connect(addr).await {
        Ok(tcp) => tcp,
        // Dropping `socket` closes the client transport
        Err(source) => {
            return Err(BridgeError::Dial {
                addr: addr.to_string(),
                source,
            })
        }
    };
    let _ = tcp.set_nodelay(true);

    let (tcp_rd, tcp_wr) = tcp.into_split();
    let sniffer = MagicSniffer::new(tcp_rd, magic);
    let (ws_sink, ws_stream) = socket.split();

    let outcome = relay::run_duplex(
        client_stream(ws_stream),
        client_sink(ws_sink),
        sniffer,
        tcp_wr,
    )
    .await;

    if outcome.server_reader.failed() {
        return Err(BridgeError::ProtocolMismatch {
            addr: addr.to_string(),
            observed: String::from_utf8_lossy(outcome.server_reader.observed()).into_owned(),
        });
    }
    match outcome.error {
        Some(source) => Err(BridgeError::Io {
            addr: addr.to_string(),
            source,
        }),
        None => Ok(()),
    }
}

/// Adapt incoming WebSocket messages into a byte stream. The stream ends at
/// the client's close frame; ping/pong frames are handled by the transport
/// and skipped here.
fn client_stream(
    stream: SplitStream<WebSocket>,
) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static {
    stream
        .take_while(|msg| ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            ready(match msg {
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(Message::Text(text)) => Some(Ok(Bytes::from(text.to_string()))),
                Ok(_) => None,
                Err(e) => Some(Err(io::Error::other(e))),
            })
        })
}

/// Adapt the WebSocket sink into a byte sink; every chunk becomes one
/// binary frame.
fn client_sink(
    sink: SplitSink<WebSocket, Message>,
) -> impl Sink<Bytes, Error = io::Error> + Send + Unpin + 'static {
    sink.sink_map_err(io::Error::other)
        .with(|data: Bytes| ready(Ok::<Message, io::Error>(Message::Binary(data))))
}
