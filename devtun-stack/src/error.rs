//! Error types for the virtual interface

use std::net::IpAddr;

use thiserror::Error;

/// Result type alias for virtual interface operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during interface setup and tunnel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration rejected before any resource was touched
    #[error("configuration error: {0}")]
    Config(String),

    /// Link endpoint over the byte stream could not be constructed
    #[error("link endpoint error: {0}")]
    LinkEndpoint(String),

    /// Virtual NIC could not be created
    #[error("NIC creation error: {0}")]
    NicCreation(String),

    /// Protocol address could not be assigned to the NIC
    #[error("address assignment error: {0}")]
    AddressAssignment(String),

    /// Default route could not be installed
    #[error("route installation error: {0}")]
    RouteInstallation(String),

    /// TCP endpoint could not be created
    #[error("endpoint creation error: {0}")]
    EndpointCreation(String),

    /// Requested local port is already in use on this interface
    #[error("bind failed: port {port} already in use")]
    Bind { port: u16 },

    /// Connection attempt failed
    #[error("connect to [{addr}]:{port} failed: {reason}")]
    Connect {
        addr: IpAddr,
        port: u16,
        reason: String,
    },

    /// Listen failed
    #[error("listen on port {port} failed: {reason}")]
    Listen { port: u16, reason: String },

    /// Operation on an interface that has been closed
    #[error("interface is closed")]
    InterfaceClosed,

    /// Proxy session failed
    #[error("proxy error: {0}")]
    Proxy(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
