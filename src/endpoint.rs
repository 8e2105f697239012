//! UDP endpoint abstraction.
//!
//! The dispatcher and every session reach the network through [`UdpEndpoint`]
//! and bind sockets through [`SocketFactory`], so tests can swap the real
//! sockets for the in-memory network in [`crate::simnet`]. Readable-data
//! notification is a channel subscription: each bound endpoint comes with an
//! unbounded receiver that yields one [`Datagram`] per arriving packet.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, TftpError};
use crate::MAX_PACKET_SIZE;

/// A datagram delivered on an endpoint's subscription channel.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Bytes,
    pub from: SocketAddr,
}

/// A bound, non-blocking datagram socket.
pub trait UdpEndpoint: Send + Sync {
    fn local_addr(&self) -> SocketAddr;

    /// Send a datagram without blocking; returns the number of bytes written.
    fn send_to(&self, data: &[u8], peer: SocketAddr) -> io::Result<usize>;

    /// Stop delivering datagrams on the subscription channel.
    fn close(&self);
}

/// A bound endpoint together with its readable-data subscription.
pub struct BoundEndpoint {
    pub endpoint: Arc<dyn UdpEndpoint>,
    pub incoming: mpsc::UnboundedReceiver<Datagram>,
}

/// Produces bound endpoints; `port` 0 selects a free ephemeral port.
pub trait SocketFactory: Send + Sync {
    fn bind(&self, addr: IpAddr, port: u16) -> Result<BoundEndpoint>;
}

/// Socket-level tuning applied to every real socket the factory binds.
#[derive(Debug, Clone)]
pub struct SocketTuning {
    /// Receive buffer size in KB (SO_RCVBUF)
    pub recv_buffer_kb: usize,
    /// Send buffer size in KB (SO_SNDBUF)
    pub send_buffer_kb: usize,
    /// Enable SO_REUSEADDR for faster restarts
    pub reuse_address: bool,
}

impl Default for SocketTuning {
    fn default() -> Self {
        Self {
            recv_buffer_kb: 2048,
            send_buffer_kb: 2048,
            reuse_address: true,
        }
    }
}

/// The real socket factory, backed by tokio UDP sockets.
#[derive(Debug, Default)]
pub struct UdpSocketFactory {
    tuning: SocketTuning,
}

impl UdpSocketFactory {
    pub fn new(tuning: SocketTuning) -> Self {
        Self { tuning }
    }
}

impl SocketFactory for UdpSocketFactory {
    fn bind(&self, addr: IpAddr, port: u16) -> Result<BoundEndpoint> {
        let socket = Arc::new(create_tuned_socket(
            SocketAddr::new(addr, port),
            &self.tuning,
        )?);
        let local = socket.local_addr().map_err(TftpError::Io)?;

        let (tx, incoming) = mpsc::unbounded_channel();
        let pump_socket = socket.clone();
        let pump = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            loop {
                match pump_socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let datagram = Datagram {
                            data: Bytes::copy_from_slice(&buf[..len]),
                            from,
                        };
                        if tx.send(datagram).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("receive failed on {}: {}", local, e);
                        break;
                    }
                }
            }
            debug!("receive pump for {} stopped", local);
        });

        Ok(BoundEndpoint {
            endpoint: Arc::new(TokioEndpoint {
                socket,
                local,
                pump: Mutex::new(Some(pump)),
            }),
            incoming,
        })
    }
}

struct TokioEndpoint {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl UdpEndpoint for TokioEndpoint {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn send_to(&self, data: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.socket.try_send_to(data, peer)
    }

    fn close(&self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for TokioEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// Create a UDP socket with SO_REUSEADDR and sized buffers, set non-blocking
/// and registered with the tokio reactor.
fn create_tuned_socket(bind_addr: SocketAddr, tuning: &SocketTuning) -> Result<UdpSocket> {
    let domain = if bind_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TftpError::Tftp(format!("Failed to create socket: {}", e)))?;

    if tuning.reuse_address {
        socket
            .set_reuse_address(true)
            .map_err(|e| TftpError::Tftp(format!("Failed to set SO_REUSEADDR: {}", e)))?;
    }

    // The kernel may clamp these; a smaller buffer is not worth failing over.
    if let Err(e) = socket.set_recv_buffer_size(tuning.recv_buffer_kb * 1024) {
        warn!("Failed to set SO_RCVBUF to {} KB: {}", tuning.recv_buffer_kb, e);
    }
    if let Err(e) = socket.set_send_buffer_size(tuning.send_buffer_kb * 1024) {
        warn!("Failed to set SO_SNDBUF to {} KB: {}", tuning.send_buffer_kb, e);
    }

    socket
        .bind(&bind_addr.into())
        .map_err(|e| TftpError::Tftp(format!("Failed to bind to {}: {}", bind_addr, e)))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TftpError::Tftp(format!("Failed to set non-blocking: {}", e)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|e| TftpError::Tftp(format!("Failed to register socket: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn datagrams_flow_between_real_endpoints() {
        let factory = UdpSocketFactory::default();
        let a = factory.bind(Ipv4Addr::LOCALHOST.into(), 0).unwrap();
        let mut b = factory.bind(Ipv4Addr::LOCALHOST.into(), 0).unwrap();

        // Give the reactor a chance to register the freshly bound sockets'
        // readiness before issuing a non-blocking send.
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;

        let sent = a
            .endpoint
            .send_to(b"ping", b.endpoint.local_addr())
            .unwrap();
        assert_eq!(sent, 4);

        let datagram = b.incoming.recv().await.unwrap();
        assert_eq!(&datagram.data[..], b"ping");
        assert_eq!(datagram.from, a.endpoint.local_addr());
    }

    #[tokio::test]
    async fn ephemeral_ports_are_distinct() {
        let factory = UdpSocketFactory::default();
        let a = factory.bind(Ipv4Addr::LOCALHOST.into(), 0).unwrap();
        let b = factory.bind(Ipv4Addr::LOCALHOST.into(), 0).unwrap();

        assert_ne!(a.endpoint.local_addr().port(), 0);
        assert_ne!(
            a.endpoint.local_addr().port(),
            b.endpoint.local_addr().port()
        );
    }

    #[tokio::test]
    async fn close_stops_the_subscription() {
        let factory = UdpSocketFactory::default();
        let mut a = factory.bind(Ipv4Addr::LOCALHOST.into(), 0).unwrap();

        a.endpoint.close();
        assert!(a.incoming.recv().await.is_none());
    }
}
