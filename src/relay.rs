//! Bidirectional byte relay with synchronized teardown.
//!
//! Both halves of the product run the same session engine: the gateway
//! bridges an accepted WebSocket to a dialed TCP socket, the reverse tunnel
//! bridges an accepted TCP socket to a dialed WebSocket. The message-framed
//! side is adapted by the caller into a byte `Stream`/`Sink` pair; the raw
//! side is plain `AsyncRead`/`AsyncWrite` halves.
//!
//! ## Teardown protocol
//!
//! Two pump tasks copy independently, one per direction, and each reports
//! its end on a completion channel sized to hold both results. The session
//! owner blocks for the **first** completion, then broadcasts a close signal
//! that forces both endpoints shut — that is what unblocks the other pump,
//! which is otherwise parked on a read with no natural end — and finally
//! drains the **second** completion before returning. No task outlives the
//! session, and each endpoint's write side is closed exactly once by the
//! pump that owns it; closing an endpoint the peer already tore down is a
//! benign no-op.

use std::io;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

const READ_BUF: usize = 8192;

/// Which copy direction finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    ClientToServer,
    ServerToClient,
}

/// Completion signal from one pump task.
#[derive(Debug)]
struct LegEnd {
    leg: Leg,
    result: io::Result<()>,
}

/// Outcome of a finished duplex session.
pub struct DuplexOutcome<R> {
    /// The first error either direction reported, if any. A clean EOF on
    /// either side is not an error.
    pub error: Option<io::Error>,
    /// The server-side reader handed back to the caller, so wrappers (the
    /// gateway's magic sniffer) can be inspected after the session ends.
    pub server_reader: R,
}

/// Copy client frames into the server's write half until the client stream
/// ends, errors, or the session is force-closed. The close signal races the
/// whole copy, so a pump parked on a stalled write unblocks too.
async fn pump_to_writer<S, W>(
    mut src: S,
    mut dst: W,
    mut closed: watch::Receiver<bool>,
) -> io::Result<()>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = {
        let copy = async {
            while let Some(item) = src.next().await {
                dst.write_all(&item?).await?;
            }
            Ok(())
        };
        tokio::pin!(copy);
        tokio::select! {
            res = &mut copy => res,
            _ = closed.changed() => Ok(()),
        }
    };
    let _ = dst.shutdown().await;
    result
}

/// Copy server bytes into the client sink until the server read half ends,
/// errors, or the session is force-closed. Returns the reader to the owner.
async fn pump_to_sink<R, K>(
    mut src: R,
    mut dst: K,
    mut closed: watch::Receiver<bool>,
) -> (io::Result<()>, R)
where
    R: AsyncRead + Unpin,
    K: Sink<Bytes, Error = io::Error> + Unpin,
{
    let mut buf = vec![0u8; READ_BUF];
    let result = {
        let copy = async {
            loop {
                let n = src.read(&mut buf).await?;
                if n == 0 {
                    break Ok(());
                }
                dst.send(Bytes::copy_from_slice(&buf[..n])).await?;
            }
        };
        tokio::pin!(copy);
        tokio::select! {
            res = &mut copy => res,
            _ = closed.changed() => Ok(()),
        }
    };
    let _ = dst.close().await;
    (result, src)
}

/// Run one full duplex session to completion.
///
/// Blocks until both directions have fully quiesced; see the module docs for
/// the teardown protocol.
pub async fn run_duplex<CS, CK, SR, SW>(
    client_src: CS,
    client_sink: CK,
    server_rd: SR,
    server_wr: SW,
) -> DuplexOutcome<SR>
where
    CS: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
    CK: Sink<Bytes, Error = io::Error> + Send + Unpin + 'static,
    SR: AsyncRead + Send + Unpin + 'static,
    SW: AsyncWrite + Send + Unpin + 'static,
{
    let (done_tx, mut done_rx) = mpsc::channel::<LegEnd>(2);
    let (close_tx, close_rx) = watch::channel(false);

    let tx = done_tx.clone();
    let rx = close_rx.clone();
    tokio::spawn(async move {
        let result = pump_to_writer(client_src, server_wr, rx).await;
        let _ = tx
            .send(LegEnd {
                leg: Leg::ClientToServer,
                result,
            })
            .await;
    });

    let reader_task = tokio::spawn(async move {
        let (result, reader) = pump_to_sink(server_rd, client_sink, close_rx).await;
        let _ = done_tx
            .send(LegEnd {
                leg: Leg::ServerToClient,
                result,
            })
            .await;
        reader
    });

    let mut ends: Vec<LegEnd> = Vec::with_capacity(2);
    if let Some(end) = done_rx.recv().await {
        tracing::debug!(leg = ?end.leg, "relay leg finished");
        ends.push(end);
    }
    // First finisher seen: force the other direction shut
    let _ = close_tx.send(true);
    if let Some(end) = done_rx.recv().await {
        tracing::debug!(leg = ?end.leg, "relay leg finished");
        ends.push(end);
    }

    let error = ends.into_iter().find_map(|end| end.result.err());
    let server_reader = reader_task.await.expect("relay pump task panicked");

    DuplexOutcome {
        error,
        server_reader,
    }
}
