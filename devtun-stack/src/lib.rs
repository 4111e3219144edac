//! Userspace virtual network interface
//!
//! Binds a private TCP/IP stack to a single virtual NIC whose "wire"
//! is an opaque duplex byte stream, and exposes TCP connect and proxy
//! operations against addresses reachable only through that wire. No
//! kernel interface is created; everything runs in-process.
//!
//! # Example
//!
//! ```ignore
//! use devtun_stack::{IfaceConfig, VirtualInterface};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // `wire` is any AsyncRead + AsyncWrite byte stream carrying
//!     // whole IP packets, e.g. the device tunnel channel.
//!     let config = IfaceConfig::new("fd7b:6e3d::2".parse()?, 64).with_mtu(1280);
//!     let iface = VirtualInterface::init(config, wire)?;
//!
//!     let mut stream = iface.connect("fd7b:6e3d::1".parse()?, 55555).await?;
//!     // stream implements AsyncRead + AsyncWrite
//!
//!     iface.close();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod conn;
pub mod error;
mod iface;
mod link;
pub mod proxy;

pub use config::IfaceConfig;
pub use conn::{TunnelStream, KEEPALIVE_IDLE, KEEPALIVE_INTERVAL};
pub use error::{Error, Result};
pub use iface::VirtualInterface;
pub use proxy::proxy;

/// Default MTU for the virtual interface
pub const DEFAULT_MTU: usize = 1500;

/// Largest packet the link adapter will carry
pub const MAX_PACKET_SIZE: usize = 65535;

/// Per-direction TCP socket buffer size
pub const SOCKET_BUFSIZE: usize = 64 * 1024;
