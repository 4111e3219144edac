//! Bidirectional stream proxy
//!
//! Bridges two duplex streams: everything read from one is written to
//! the other, in both directions, until either side finishes. The two
//! streams are closed exactly once each, no matter which side stops
//! first or why.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Copy between `a` and `b` in both directions until one side reaches
/// end-of-stream or fails.
///
/// End-of-stream counts as success; the result is the join of both
/// directions' outcomes. Either way both streams end up shut down, each
/// exactly once.
pub async fn proxy<A, B>(a: A, b: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    // One guard covers both streams: the first direction to finish
    // fires it, which unblocks the other direction, and each direction
    // then closes the single write half it owns.
    let guard = CancellationToken::new();

    let forward = copy_direction(&mut a_read, &mut b_write, &guard);
    let backward = copy_direction(&mut b_read, &mut a_write, &guard);
    let (forward, backward) = tokio::join!(forward, backward);

    join_outcomes(forward, backward)
}

async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    guard: &CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = tokio::select! {
        res = tokio::io::copy(reader, writer) => res.map(|n| {
            trace!(bytes = n, "proxy direction finished");
        }),
        _ = guard.cancelled() => Ok(()),
    };
    guard.cancel();
    let closed = writer.shutdown().await;
    result.and(closed)
}

fn join_outcomes(a: io::Result<()>, b: io::Result<()>) -> io::Result<()> {
    match (a, b) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Err(e1), Err(e2)) => Err(io::Error::new(e1.kind(), format!("{e1}; {e2}"))),
    }
}
