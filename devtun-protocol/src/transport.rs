//! Duplex transport abstraction
//!
//! The tunnel runs over an already-established duplex byte stream; how
//! that stream came to exist (USB channel, TCP socket, in-memory pipe)
//! is outside this crate's concern. Anything that is tokio-readable,
//! tokio-writable and movable between tasks qualifies.
//!
//! The [`mock`] module provides an in-memory implementation for tests,
//! with scripted reads, write capture and close counting.

pub mod mock;

use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream usable as a tunnel wire.
///
/// Blanket-implemented; implement the tokio I/O traits and this comes
/// for free.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}
