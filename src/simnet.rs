//! In-memory socket factory for tests.
//!
//! Each bound endpoint gets a pair of simulated streams: an input stream the
//! test writes datagrams into (delivered on the endpoint's subscription
//! channel) and an output stream that records every datagram the code under
//! test sends, together with its destination. Sockets are looked up by their
//! bound port; port 0 self-allocates from a private ephemeral range.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::endpoint::{BoundEndpoint, Datagram, SocketFactory, UdpEndpoint};
use crate::error::{Result, TftpError};

const FIRST_EPHEMERAL_PORT: u16 = 49152;

#[derive(Clone, Default)]
pub struct SimNetwork {
    inner: Arc<Mutex<SimState>>,
}

#[derive(Default)]
struct SimState {
    sockets: Vec<SimSocket>,
    next_ephemeral: u16,
}

struct SimSocket {
    local: SocketAddr,
    input: mpsc::UnboundedSender<Datagram>,
    output: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ports of all sockets bound so far, in bind order.
    pub fn bound_ports(&self) -> Vec<u16> {
        let state = self.inner.lock().expect("sim network lock poisoned");
        state.sockets.iter().map(|s| s.local.port()).collect()
    }

    /// Deliver a datagram to the socket bound on `port`, as if `from` had
    /// sent it over the network. Returns false if the socket is gone or its
    /// subscription has been dropped.
    pub fn deliver(&self, port: u16, from: SocketAddr, data: &[u8]) -> bool {
        let state = self.inner.lock().expect("sim network lock poisoned");
        match state.sockets.iter().find(|s| s.local.port() == port) {
            Some(socket) => socket
                .input
                .send(Datagram {
                    data: Bytes::copy_from_slice(data),
                    from,
                })
                .is_ok(),
            None => false,
        }
    }

    /// Wait for the next datagram written by the socket bound on `port`.
    pub async fn next_output(&self, port: u16) -> (Vec<u8>, SocketAddr) {
        let output = self.output_stream(port);
        let mut output = output.lock().await;
        output
            .recv()
            .await
            .expect("sim socket output stream closed")
    }

    /// Pull a pending output datagram without waiting.
    pub fn try_output(&self, port: u16) -> Option<(Vec<u8>, SocketAddr)> {
        let output = self.output_stream(port);
        let mut output = output.try_lock().ok()?;
        output.try_recv().ok()
    }

    /// Drain every pending output datagram of the socket bound on `port`.
    pub fn drain_output(&self, port: u16) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut drained = Vec::new();
        while let Some(datagram) = self.try_output(port) {
            drained.push(datagram);
        }
        drained
    }

    fn output_stream(
        &self,
        port: u16,
    ) -> Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>> {
        let state = self.inner.lock().expect("sim network lock poisoned");
        state
            .sockets
            .iter()
            .find(|s| s.local.port() == port)
            .map(|s| s.output.clone())
            .unwrap_or_else(|| panic!("no sim socket bound on port {}", port))
    }
}

impl SocketFactory for SimNetwork {
    fn bind(&self, addr: IpAddr, port: u16) -> Result<BoundEndpoint> {
        let mut state = self.inner.lock().expect("sim network lock poisoned");

        let port = if port == 0 {
            let mut candidate = FIRST_EPHEMERAL_PORT + state.next_ephemeral;
            while state.sockets.iter().any(|s| s.local.port() == candidate) {
                candidate = candidate.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
            }
            state.next_ephemeral = candidate - FIRST_EPHEMERAL_PORT + 1;
            candidate
        } else {
            if state.sockets.iter().any(|s| s.local.port() == port) {
                return Err(TftpError::Tftp(format!(
                    "sim port {} already bound",
                    port
                )));
            }
            port
        };
        let local = SocketAddr::new(addr, port);

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        state.sockets.push(SimSocket {
            local,
            input: input_tx,
            output: Arc::new(tokio::sync::Mutex::new(output_rx)),
        });

        Ok(BoundEndpoint {
            endpoint: Arc::new(SimEndpoint {
                local,
                output: output_tx,
            }),
            incoming: input_rx,
        })
    }
}

struct SimEndpoint {
    local: SocketAddr,
    output: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
}

impl UdpEndpoint for SimEndpoint {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn send_to(&self, data: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.output
            .send((data.to_vec(), peer))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "sim endpoint closed"))?;
        Ok(data.len())
    }

    fn close(&self) {}
}
