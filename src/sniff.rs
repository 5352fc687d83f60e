//! Magic-prefix sniffing for freshly dialed destinations.
//!
//! A VNC server opens its side of the connection by sending the ASCII bytes
//! `RFB` (the protocol version handshake). [`MagicSniffer`] wraps the TCP
//! read path and compares the first bytes against that expected prefix
//! without buffering the stream:
//!
//! - While comparing, bytes pass through as they arrive.
//! - On the first mismatching position the sniffer enters a **sticky
//!   failure**: every subsequent read reports end-of-stream, the mismatching
//!   chunk is withheld, and the underlying source is never read again.
//! - End-of-stream before the full prefix arrived is *not* a failure —
//!   insufficient data is distinct from a mismatch.
//! - Once the whole prefix has matched the sniffer is a pure pass-through.
//!
//! This lets the bridge tell "that port doesn't speak VNC" apart from a
//! generic connection failure, at the cost of a few byte comparisons.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

/// Streaming byte-prefix verifier over any [`AsyncRead`].
#[derive(Debug)]
pub struct MagicSniffer<R> {
    inner: R,
    expected: &'static [u8],
    observed: Vec<u8>,
    failed: bool,
}

impl<R> MagicSniffer<R> {
    pub fn new(inner: R, expected: &'static [u8]) -> Self {
        Self {
            inner,
            expected,
            observed: Vec::with_capacity(expected.len()),
            failed: false,
        }
    }

    /// True once a mismatch has been seen. Stays false when the source ended
    /// before the full prefix could be compared.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// The prefix bytes observed so far (at most the expected length).
    pub fn observed(&self) -> &[u8] {
        &self.observed
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for MagicSniffer<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.failed {
            // Sticky EOF: never touch the inner reader again
            return Poll::Ready(Ok(()));
        }

        let pre = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let fresh = &buf.filled()[pre..];
        if !fresh.is_empty() && this.observed.len() < this.expected.len() {
            let take = (this.expected.len() - this.observed.len()).min(fresh.len());
            this.observed.extend_from_slice(&fresh[..take]);
            if this.observed[..] != this.expected[..this.observed.len()] {
                this.failed = true;
                // Withhold the mismatching chunk and report end-of-stream
                buf.set_filled(pre);
            }
        }
        Poll::Ready(Ok(()))
    }
}
