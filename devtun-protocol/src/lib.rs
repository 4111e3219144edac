//! CDTunnel control-plane protocol
//!
//! Wire framing for the CDTunnel parameter handshake, plus the duplex
//! transport abstraction the tunnel data plane runs over.
//!
//! The handshake is a single request/response exchange on an
//! already-established byte stream. The client announces its MTU, the
//! server answers with the addresses and port the tunnel should use:
//!
//! ```ignore
//! use devtun_protocol::handshake;
//!
//! let params = handshake::exchange_tunnel_parameters(&mut stream).await?;
//! println!(
//!     "tunnel to {} port {}",
//!     params.server_address, params.server_rsd_port
//! );
//! ```

pub mod error;
pub mod handshake;
pub mod transport;

pub use error::{Error, Result};
pub use handshake::{ClientParameters, TunnelParameters};
pub use transport::DuplexStream;

/// MTU announced in the client handshake request
pub const HANDSHAKE_MTU: u32 = 1280;

/// Maximum handshake body size; the frame carries a one-byte length
pub const MAX_BODY_LEN: usize = 255;
