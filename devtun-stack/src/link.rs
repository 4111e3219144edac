//! Link adapter between the byte-stream wire and the network stack
//!
//! [`LinkDevice`] is the stack-facing side of the wire: inbound packets
//! queued by the reader pump are handed to the stack one per receive
//! token, outbound packets are copied into owned buffers and pushed to
//! the writer pump's channel. The adapter never retries and never
//! reconnects; wire failures are handled a layer up.

use std::collections::VecDeque;

use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Error, Result};
use crate::MAX_PACKET_SIZE;

/// IP-medium device over a duplex byte stream.
pub(crate) struct LinkDevice {
    mtu: usize,
    rx_queue: VecDeque<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    sniff: bool,
}

impl LinkDevice {
    pub(crate) fn new(
        mtu: usize,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        sniff: bool,
    ) -> Result<Self> {
        if mtu == 0 || mtu > MAX_PACKET_SIZE {
            return Err(Error::LinkEndpoint(format!(
                "unusable MTU {mtu} (1..={MAX_PACKET_SIZE})"
            )));
        }
        Ok(Self {
            mtu,
            rx_queue: VecDeque::new(),
            outbound,
            sniff,
        })
    }

    /// Queue one inbound packet for the stack. Called by the reader
    /// pump; one transport read yields one packet.
    pub(crate) fn enqueue_rx(&mut self, packet: Vec<u8>) {
        self.rx_queue.push_back(packet);
    }
}

/// Passive per-packet log line; traffic is never altered.
fn sniff_packet(direction: &str, packet: &[u8]) {
    match packet.first().map(|b| b >> 4) {
        Some(4) if packet.len() >= 20 => {
            let src = std::net::Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
            let dst = std::net::Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
            let proto = packet[9];
            trace!(%direction, %src, %dst, proto, len = packet.len(), "IPv4");
        }
        Some(6) if packet.len() >= 40 => {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&packet[8..24]);
            dst.copy_from_slice(&packet[24..40]);
            let src = std::net::Ipv6Addr::from(src);
            let dst = std::net::Ipv6Addr::from(dst);
            let proto = packet[6];
            trace!(%direction, %src, %dst, proto, len = packet.len(), "IPv6");
        }
        _ => trace!(%direction, len = packet.len(), "non-IP packet"),
    }
}

pub(crate) struct LinkRxToken {
    packet: Vec<u8>,
    sniff: bool,
}

impl RxToken for LinkRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        if self.sniff {
            sniff_packet("rx", &self.packet);
        }
        f(&self.packet)
    }
}

pub(crate) struct LinkTxToken<'a> {
    outbound: &'a mpsc::UnboundedSender<Vec<u8>>,
    sniff: bool,
}

impl<'a> TxToken for LinkTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);
        if self.sniff {
            sniff_packet("tx", &buffer);
        }
        // Writer pump gone means the wire is already down; the packet
        // is dropped like on any dead link.
        if self.outbound.send(buffer).is_err() {
            trace!(len, "dropping outbound packet, wire is down");
        }
        result
    }
}

impl Device for LinkDevice {
    type RxToken<'a> = LinkRxToken where Self: 'a;
    type TxToken<'a> = LinkTxToken<'a> where Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.rx_queue.pop_front()?;
        Some((
            LinkRxToken {
                packet,
                sniff: self.sniff,
            },
            LinkTxToken {
                outbound: &self.outbound,
                sniff: self.sniff,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(LinkTxToken {
            outbound: &self.outbound,
            sniff: self.sniff,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}
