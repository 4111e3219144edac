//! Virtual interface lifecycle and stack driver
//!
//! [`VirtualInterface::init`] binds a fresh userspace network stack to
//! one NIC whose wire is the supplied duplex byte stream, then spawns
//! three tasks: a reader pump (wire to stack, one MTU-sized read per
//! packet), a writer pump (stack to wire) and the driver (stack poll
//! loop and timer handling). [`VirtualInterface::close`] tears all of
//! it down and is idempotent; dropping the interface closes it.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{tcp, Socket};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use devtun_protocol::DuplexStream;

use crate::config::IfaceConfig;
use crate::error::{Error, Result};
use crate::link::LinkDevice;

/// First ephemeral local port handed out for unbound connects
const EPHEMERAL_PORT_START: u16 = 49152;

static NEXT_NIC_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn wire_addr(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(a) => IpAddress::Ipv4(a),
        IpAddr::V6(a) => IpAddress::Ipv6(a),
    }
}

/// Stack state behind the interface lock.
///
/// The lock is held for individual socket operations and single poll
/// passes, never across an await point.
pub(crate) struct Inner {
    pub(crate) iface: Interface,
    pub(crate) sockets: SocketSet<'static>,
    pub(crate) device: LinkDevice,
    pub(crate) link_up: bool,
    next_port: u16,
    /// Handles whose streams are gone; removed once fully closed.
    reclaim: Vec<SocketHandle>,
}

impl Inner {
    pub(crate) fn port_in_use(&self, port: u16) -> bool {
        self.sockets.iter().any(|(_, socket)| match socket {
            Socket::Tcp(s) => {
                s.listen_endpoint().port == port
                    || s.local_endpoint().is_some_and(|ep| ep.port == port)
            }
        })
    }

    pub(crate) fn alloc_ephemeral_port(&mut self) -> u16 {
        loop {
            let port = self.next_port;
            self.next_port = if port == u16::MAX {
                EPHEMERAL_PORT_START
            } else {
                port + 1
            };
            if !self.port_in_use(port) {
                return port;
            }
        }
    }

    /// Queue a socket for removal once it reaches the closed state.
    pub(crate) fn schedule_reclaim(&mut self, handle: SocketHandle) {
        self.reclaim.push(handle);
    }

    fn abort_all(&mut self) {
        for (_, socket) in self.sockets.iter_mut() {
            match socket {
                Socket::Tcp(s) => s.abort(),
            }
        }
    }

    fn reap(&mut self) {
        let mut i = 0;
        while i < self.reclaim.len() {
            let handle = self.reclaim[i];
            let closed = matches!(
                self.sockets.get::<tcp::Socket>(handle).state(),
                tcp::State::Closed
            );
            if closed {
                self.sockets.remove(handle);
                self.reclaim.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }
}

pub(crate) struct Shared {
    pub(crate) inner: Mutex<Inner>,
    /// Kicks the driver after socket or rx-queue activity.
    pub(crate) notify: Notify,
    pub(crate) shutdown: CancellationToken,
}

impl Shared {
    /// Wire failure or end-of-stream: abort every socket so blocked
    /// readers and writers observe the loss. The interface itself
    /// stays alive until closed.
    fn link_down(&self, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.link_up {
            warn!(reason, "tunnel wire down, aborting sockets");
            inner.link_up = false;
            inner.abort_all();
        }
        drop(inner);
        self.notify.notify_one();
    }
}

/// A userspace network interface bound to a duplex byte stream.
///
/// Created by [`init`](VirtualInterface::init); a value of this type
/// only exists after setup fully succeeded. Connections are made with
/// [`connect`](VirtualInterface::connect) and friends in the connector
/// module.
pub struct VirtualInterface {
    pub(crate) shared: Arc<Shared>,
    nic_id: u64,
    address: IpAddr,
    prefix_len: u8,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for VirtualInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualInterface")
            .field("nic_id", &self.nic_id)
            .field("address", &self.address)
            .field("prefix_len", &self.prefix_len)
            .finish_non_exhaustive()
    }
}

impl VirtualInterface {
    /// Bring up the interface over `wire`.
    ///
    /// `wire` must carry whole IP packets: one write per outbound
    /// packet, one read yielding one inbound packet of at most MTU
    /// bytes. Each setup stage fails with its own error kind; nothing
    /// is retried and a failed init leaves no tasks behind.
    pub fn init<T>(config: IfaceConfig, wire: T) -> Result<Self>
    where
        T: DuplexStream + 'static,
    {
        config.validate()?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let mut device = LinkDevice::new(config.mtu, outbound_tx, config.sniff)?;

        // NIC tasks need a runtime to land on.
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::NicCreation(format!("no async runtime for NIC tasks: {e}")))?;

        let nic_id = NEXT_NIC_ID.fetch_add(1, Ordering::Relaxed);
        let mut iface = Interface::new(
            Config::new(HardwareAddress::Ip),
            &mut device,
            SmolInstant::now(),
        );

        let cidr = IpCidr::new(wire_addr(config.address), config.prefix_len);
        let mut assigned = false;
        iface.update_ip_addrs(|addrs| {
            assigned = addrs.push(cidr).is_ok();
        });
        if !assigned {
            return Err(Error::AddressAssignment(format!(
                "could not assign {}/{} to NIC {}",
                config.address, config.prefix_len, nic_id
            )));
        }

        // Point-to-point link over an IP medium: the far end is the
        // only peer and no next-hop resolution happens, so the local
        // address stands in as the gateway value.
        let route = match config.address {
            IpAddr::V4(addr) => iface
                .routes_mut()
                .add_default_ipv4_route(addr)
                .map(|_| ()),
            IpAddr::V6(addr) => iface
                .routes_mut()
                .add_default_ipv6_route(addr)
                .map(|_| ()),
        };
        route.map_err(|_| Error::RouteInstallation("route table full".into()))?;

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                iface,
                sockets: SocketSet::new(vec![]),
                device,
                link_up: true,
                next_port: EPHEMERAL_PORT_START,
                reclaim: Vec::new(),
            }),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        let (read_half, write_half) = tokio::io::split(wire);
        let tasks = vec![
            runtime.spawn(reader_pump(shared.clone(), read_half, config.mtu)),
            runtime.spawn(writer_pump(shared.clone(), write_half, outbound_rx)),
            runtime.spawn(driver(shared.clone())),
        ];

        debug!(
            nic_id,
            address = %config.address,
            prefix_len = config.prefix_len,
            mtu = config.mtu,
            "virtual interface up"
        );

        Ok(Self {
            shared,
            nic_id,
            address: config.address,
            prefix_len: config.prefix_len,
            tasks: Mutex::new(tasks),
        })
    }

    /// Process-unique NIC identifier.
    pub fn nic_id(&self) -> u64 {
        self.nic_id
    }

    /// Address assigned to the interface.
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Prefix length of the assigned address.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Whether [`close`](VirtualInterface::close) has run.
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Tear the interface down: stop the pump and driver tasks and
    /// abort every socket, waking anything blocked on them. Safe to
    /// call any number of times.
    pub fn close(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        self.shared.shutdown.cancel();
        {
            let mut inner = self.shared.inner.lock();
            inner.link_up = false;
            inner.abort_all();
        }
        self.shared.notify.notify_waiters();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!(nic_id = self.nic_id, "virtual interface closed");
    }
}

impl Drop for VirtualInterface {
    fn drop(&mut self) {
        self.close();
    }
}

/// Wire to stack: one read, one packet.
async fn reader_pump<R>(shared: Arc<Shared>, mut read_half: R, mtu: usize)
where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = vec![0u8; mtu];
    loop {
        let n = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            res = read_half.read(&mut buf) => match res {
                Ok(0) => {
                    shared.link_down("end of stream");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    shared.link_down(&format!("read failed: {e}"));
                    return;
                }
            },
        };
        shared.inner.lock().device.enqueue_rx(buf[..n].to_vec());
        shared.notify.notify_one();
    }
}

/// Stack to wire: one packet, one write.
async fn writer_pump<W>(
    shared: Arc<Shared>,
    mut write_half: W,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let packet = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => return,
            },
        };
        if let Err(e) = write_half.write_all(&packet).await {
            shared.link_down(&format!("write failed: {e}"));
            return;
        }
        if let Err(e) = write_half.flush().await {
            shared.link_down(&format!("flush failed: {e}"));
            return;
        }
    }
}

/// Stack poll loop: runs the state machines, reclaims dead sockets,
/// then sleeps until activity or the next protocol timer.
async fn driver(shared: Arc<Shared>) {
    loop {
        if shared.shutdown.is_cancelled() {
            return;
        }
        let delay = {
            let mut guard = shared.inner.lock();
            let inner = &mut *guard;
            let now = SmolInstant::now();
            let _ = inner.iface.poll(now, &mut inner.device, &mut inner.sockets);
            inner.reap();
            inner.iface.poll_delay(now, &inner.sockets)
        };
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = shared.notify.notified() => {}
            _ = sleep_for(delay) => {}
        }
    }
}

async fn sleep_for(delay: Option<smoltcp::time::Duration>) {
    match delay {
        Some(d) => tokio::time::sleep(d.into()).await,
        None => std::future::pending().await,
    }
}
