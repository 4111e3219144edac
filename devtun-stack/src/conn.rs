//! TCP endpoint connector and tunnel streams
//!
//! Connections are opened against addresses reachable through the
//! virtual interface. Every endpoint gets aggressive keep-alive
//! settings before any connect outcome is observable: NAT boxes and
//! firewalls drop idle mappings long before a stack's default
//! keep-alive would fire.

use std::future::poll_fn;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp;
use smoltcp::wire::IpAddress;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

use devtun_protocol::DuplexStream;

use crate::error::{Error, Result};
use crate::iface::{wire_addr, Shared, VirtualInterface};
use crate::proxy::proxy;
use crate::SOCKET_BUFSIZE;

/// Keep-alive idle allowance: how long a silent peer is tolerated
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// Keep-alive probe interval
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

fn new_tunnel_socket() -> tcp::Socket<'static> {
    let rx_buffer = tcp::SocketBuffer::new(vec![0; SOCKET_BUFSIZE]);
    let tx_buffer = tcp::SocketBuffer::new(vec![0; SOCKET_BUFSIZE]);
    tcp::Socket::new(rx_buffer, tx_buffer)
}

/// Applied while the endpoint is still being set up, before any
/// connect outcome is observable.
fn apply_keepalive(socket: &mut tcp::Socket<'_>) {
    socket.set_keep_alive(Some(KEEPALIVE_INTERVAL.into()));
    socket.set_timeout(Some(KEEPALIVE_IDLE.into()));
}

impl VirtualInterface {
    /// Connect to `remote_addr:remote_port` through the tunnel.
    pub async fn connect(&self, remote_addr: IpAddr, remote_port: u16) -> Result<TunnelStream> {
        self.connect_from(0, remote_addr, remote_port).await
    }

    /// Connect with an explicit local port; 0 draws from the ephemeral
    /// range. Fails with a bind error if the port is taken by another
    /// endpoint on this interface.
    pub async fn connect_from(
        &self,
        local_port: u16,
        remote_addr: IpAddr,
        remote_port: u16,
    ) -> Result<TunnelStream> {
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::InterfaceClosed);
        }

        let handle = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            if !inner.link_up {
                return Err(Error::Connect {
                    addr: remote_addr,
                    port: remote_port,
                    reason: "link is down".into(),
                });
            }

            let local = if local_port != 0 {
                if inner.port_in_use(local_port) {
                    return Err(Error::Bind { port: local_port });
                }
                local_port
            } else {
                inner.alloc_ephemeral_port()
            };

            let handle = inner.sockets.add(new_tunnel_socket());
            let socket = inner.sockets.get_mut::<tcp::Socket>(handle);
            if let Err(e) = socket.connect(
                inner.iface.context(),
                (wire_addr(remote_addr), remote_port),
                local,
            ) {
                inner.sockets.remove(handle);
                return Err(Error::Connect {
                    addr: remote_addr,
                    port: remote_port,
                    reason: e.to_string(),
                });
            }
            apply_keepalive(socket);
            handle
        };
        self.shared.notify.notify_one();

        // The connect is non-blocking; wait for the writable event,
        // then re-check what actually happened to the socket.
        let state = wait_leaves_synchronizing(&self.shared, handle).await;
        if state == tcp::State::Closed {
            let mut inner = self.shared.inner.lock();
            inner.sockets.remove(handle);
            return Err(Error::Connect {
                addr: remote_addr,
                port: remote_port,
                reason: "connection refused or reset".into(),
            });
        }

        debug!(addr = %remote_addr, port = remote_port, "connected");
        Ok(TunnelStream {
            shared: self.shared.clone(),
            handle,
            remote_addr,
            remote_port,
        })
    }

    /// Wait for a single inbound connection on `port`.
    pub async fn accept(&self, port: u16) -> Result<TunnelStream> {
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::InterfaceClosed);
        }

        let handle = {
            let mut inner = self.shared.inner.lock();
            if port != 0 && inner.port_in_use(port) {
                return Err(Error::Bind { port });
            }
            let mut socket = new_tunnel_socket();
            if let Err(e) = socket.listen(port) {
                return Err(Error::Listen {
                    port,
                    reason: e.to_string(),
                });
            }
            apply_keepalive(&mut socket);
            inner.sockets.add(socket)
        };
        self.shared.notify.notify_one();

        let state = wait_leaves_synchronizing(&self.shared, handle).await;
        if state == tcp::State::Closed {
            let mut inner = self.shared.inner.lock();
            inner.sockets.remove(handle);
            return Err(Error::Listen {
                port,
                reason: "closed before a connection was established".into(),
            });
        }

        let (remote_addr, remote_port) = {
            let inner = self.shared.inner.lock();
            match inner.sockets.get::<tcp::Socket>(handle).remote_endpoint() {
                Some(ep) => (
                    match ep.addr {
                        IpAddress::Ipv4(a) => IpAddr::V4(a),
                        IpAddress::Ipv6(a) => IpAddr::V6(a),
                    },
                    ep.port,
                ),
                None => (self.address(), 0),
            }
        };

        debug!(addr = %remote_addr, port = remote_port, "accepted");
        Ok(TunnelStream {
            shared: self.shared.clone(),
            handle,
            remote_addr,
            remote_port,
        })
    }

    /// Connect to `remote_addr:remote_port` and bridge the resulting
    /// tunnel stream with `local` until either side finishes.
    ///
    /// `local` is consumed and closed in every outcome, connect
    /// failures included.
    pub async fn connect_and_proxy<S>(
        &self,
        local_port: u16,
        remote_addr: IpAddr,
        remote_port: u16,
        mut local: S,
    ) -> Result<()>
    where
        S: DuplexStream,
    {
        let stream = match self.connect_from(local_port, remote_addr, remote_port).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = local.shutdown().await;
                return Err(e);
            }
        };
        proxy(local, stream).await.map_err(Error::Proxy)
    }
}

/// Park on the socket's writable event until it leaves the
/// synchronizing states, then report where it ended up.
async fn wait_leaves_synchronizing(shared: &Arc<Shared>, handle: SocketHandle) -> tcp::State {
    poll_fn(|cx| {
        let mut inner = shared.inner.lock();
        let socket = inner.sockets.get_mut::<tcp::Socket>(handle);
        match socket.state() {
            tcp::State::SynSent | tcp::State::SynReceived | tcp::State::Listen => {
                socket.register_send_waker(cx.waker());
                socket.register_recv_waker(cx.waker());
                Poll::Pending
            }
            state => Poll::Ready(state),
        }
    })
    .await
}

/// An established TCP connection over the virtual interface.
///
/// Reads and writes go through the interface's userspace stack. A
/// clean remote close reads as end-of-stream; a reset reads as an
/// error. Dropping the stream closes the connection and schedules the
/// socket for reclamation.
pub struct TunnelStream {
    shared: Arc<Shared>,
    handle: SocketHandle,
    remote_addr: IpAddr,
    remote_port: u16,
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("handle", &self.handle)
            .field("remote_addr", &self.remote_addr)
            .field("remote_port", &self.remote_port)
            .finish_non_exhaustive()
    }
}

impl TunnelStream {
    pub fn remote_addr(&self) -> IpAddr {
        self.remote_addr
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// The keep-alive settings applied to this connection, as
    /// `(idle allowance, probe interval)`.
    pub fn keepalive(&self) -> Option<(Duration, Duration)> {
        let inner = self.shared.inner.lock();
        let socket = inner.sockets.get::<tcp::Socket>(self.handle);
        let idle = socket.timeout()?;
        let interval = socket.keep_alive()?;
        Some((idle.into(), interval.into()))
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut inner = this.shared.inner.lock();
        let socket = inner.sockets.get_mut::<tcp::Socket>(this.handle);

        if socket.can_recv() {
            return match socket.recv_slice(buf.initialize_unfilled()) {
                Ok(n) => {
                    buf.advance(n);
                    drop(inner);
                    // Receive window opened; let the stack advertise it.
                    this.shared.notify.notify_one();
                    Poll::Ready(Ok(()))
                }
                Err(tcp::RecvError::Finished) => Poll::Ready(Ok(())),
                Err(tcp::RecvError::InvalidState) => Poll::Ready(Err(connection_reset())),
            };
        }
        if socket.may_recv() {
            socket.register_recv_waker(cx.waker());
            return Poll::Pending;
        }
        // Nothing more will arrive: distinguish a clean close from a
        // reset.
        match socket.recv_slice(&mut []) {
            Ok(_) | Err(tcp::RecvError::Finished) => Poll::Ready(Ok(())),
            Err(tcp::RecvError::InvalidState) => Poll::Ready(Err(connection_reset())),
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut inner = this.shared.inner.lock();
        let socket = inner.sockets.get_mut::<tcp::Socket>(this.handle);

        if !socket.may_send() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            )));
        }
        if socket.can_send() {
            return match socket.send_slice(data) {
                Ok(n) => {
                    drop(inner);
                    this.shared.notify.notify_one();
                    Poll::Ready(Ok(n))
                }
                Err(tcp::SendError::InvalidState) => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "connection closed",
                ))),
            };
        }
        socket.register_send_waker(cx.waker());
        Poll::Pending
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut inner = this.shared.inner.lock();
        let socket = inner.sockets.get_mut::<tcp::Socket>(this.handle);

        if socket.send_queue() == 0 || !socket.is_active() {
            return Poll::Ready(Ok(()));
        }
        socket.register_send_waker(cx.waker());
        drop(inner);
        this.shared.notify.notify_one();
        Poll::Pending
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        let this = self.get_mut();
        let mut inner = this.shared.inner.lock();
        inner.sockets.get_mut::<tcp::Socket>(this.handle).close();
        drop(inner);
        this.shared.notify.notify_one();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.sockets.get_mut::<tcp::Socket>(self.handle).close();
        inner.schedule_reclaim(self.handle);
        drop(inner);
        self.shared.notify.notify_one();
    }
}

fn connection_reset() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")
}
