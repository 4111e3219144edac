//! CDTunnel parameter handshake
//!
//! Frame layout, request and response alike:
//!
//! ```text
//! "CDTunnel\0"  (9 bytes)  magic
//! len           (1 byte)   body length
//! body          (len)      UTF-8 JSON
//! ```
//!
//! The response header is read as a fixed 10 bytes of which only the
//! final byte (the body length) is interpreted. The exchange is a
//! strict single round-trip; retries belong to the caller.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::DuplexStream;
use crate::{HANDSHAKE_MTU, MAX_BODY_LEN};

/// Frame magic, NUL terminator included
pub const MAGIC: &[u8; 9] = b"CDTunnel\0";

/// Response header size: the magic's text length plus two bytes
const HEADER_LEN: usize = 10;

/// Field order is the wire order; serde_json preserves it.
#[derive(Debug, Serialize)]
struct HandshakeRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    mtu: u32,
}

/// Tunnel parameters advertised by the server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TunnelParameters {
    pub server_address: String,
    #[serde(rename = "ServerRSDPort")]
    pub server_rsd_port: u64,
    pub client_parameters: ClientParameters,
}

/// Address assignment for the client end of the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientParameters {
    pub address: String,
    pub netmask: String,
    pub mtu: u64,
}

/// Encode a client handshake request frame for the given MTU.
pub fn encode_request(mtu: u32) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(&HandshakeRequest {
        kind: "clientHandshakeRequest",
        mtu,
    })?;
    if body.len() > MAX_BODY_LEN {
        return Err(Error::BodyTooLarge {
            len: body.len(),
            max: MAX_BODY_LEN,
        });
    }

    let mut frame = Vec::with_capacity(MAGIC.len() + 1 + body.len());
    frame.extend_from_slice(MAGIC);
    frame.push(body.len() as u8);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Perform the parameter handshake on `stream`.
///
/// Writes the client request, reads the fixed-size response header and
/// the JSON body it announces, and decodes the tunnel parameters. A
/// truncated stream is a hard error.
pub async fn exchange_tunnel_parameters<S>(stream: &mut S) -> Result<TunnelParameters>
where
    S: DuplexStream,
{
    let frame = encode_request(HANDSHAKE_MTU)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let mut header = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| Error::Handshake(format!("could not read response header: {e}")))?;
    let body_len = header[HEADER_LEN - 1] as usize;

    let mut body = vec![0u8; body_len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::Handshake(format!("could not read response body: {e}")))?;

    let parameters: TunnelParameters = serde_json::from_slice(&body)?;
    debug!(
        server_address = %parameters.server_address,
        server_rsd_port = parameters.server_rsd_port,
        "handshake complete"
    );
    Ok(parameters)
}
