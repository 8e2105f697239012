//! Listening-endpoint dispatcher.
//!
//! Owns the well-known sockets and demultiplexes inbound datagrams: a new
//! RRQ spawns a fresh [`ReadSession`] on its own ephemeral socket, anything
//! else is answered with an ERROR. Sessions are reaped when their event
//! stream reports a terminal state; removal always happens here, in the
//! dispatcher loop, never inside a session's own handler.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::endpoint::{BoundEndpoint, Datagram, SocketFactory, UdpEndpoint};
use crate::error::Result;
use crate::packet::{self, Packet};
use crate::session::{ReadSession, SessionEvent, TransferLimits};
use crate::ErrorCode;

/// Notifications surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    NewReadSession { peer: SocketAddr, filename: String },
    Progress { peer: SocketAddr, percent: u8 },
    SlowNetwork { peer: SocketAddr, mean_delay_us: u64 },
    TransferFinished { peer: SocketAddr },
    TransferError { peer: SocketAddr, message: String },
}

/// Closes the server: listening endpoints are unbound, in-flight transfers
/// complete or time out naturally.
pub struct ServerHandle {
    shutdown: watch::Sender<bool>,
}

impl ServerHandle {
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

struct Listener {
    endpoint: Arc<dyn UdpEndpoint>,
    files_dir: PathBuf,
}

pub struct TftpServer {
    factory: Arc<dyn SocketFactory>,
    limits: TransferLimits,
    listeners: Vec<Listener>,
    /// Active sessions by peer identity; the value is the session's TID port.
    sessions: HashMap<SocketAddr, u16>,
    listener_tx: mpsc::UnboundedSender<(usize, Option<Datagram>)>,
    listener_rx: mpsc::UnboundedReceiver<(usize, Option<Datagram>)>,
    session_tx: mpsc::UnboundedSender<(SocketAddr, SessionEvent)>,
    session_rx: mpsc::UnboundedReceiver<(SocketAddr, SessionEvent)>,
    events: mpsc::UnboundedSender<ServerEvent>,
    shutdown: watch::Receiver<bool>,
}

impl TftpServer {
    pub fn new(
        limits: TransferLimits,
        factory: Arc<dyn SocketFactory>,
    ) -> (Self, ServerHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        let (listener_tx, listener_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = Self {
            factory,
            limits,
            listeners: Vec::new(),
            sessions: HashMap::new(),
            listener_tx,
            listener_rx,
            session_tx,
            session_rx,
            events: events_tx,
            shutdown: shutdown_rx,
        };
        let handle = ServerHandle {
            shutdown: shutdown_tx,
        };
        (server, handle, events_rx)
    }

    /// Bind a listening endpoint serving files from `files_dir`.
    pub fn bind(&mut self, addr: IpAddr, port: u16, files_dir: PathBuf) -> Result<SocketAddr> {
        let BoundEndpoint {
            endpoint,
            mut incoming,
        } = self.factory.bind(addr, port)?;
        let local = endpoint.local_addr();

        let index = self.listeners.len();
        let tx = self.listener_tx.clone();
        tokio::spawn(async move {
            while let Some(datagram) = incoming.recv().await {
                if tx.send((index, Some(datagram))).is_err() {
                    return;
                }
            }
            // subscription ended without close(): the socket itself failed
            let _ = tx.send((index, None));
        });

        self.listeners.push(Listener {
            endpoint,
            files_dir: files_dir.clone(),
        });
        info!("TFTP server listening on {} (files: {})", local, files_dir.display());
        Ok(local)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Run the dispatch loop until the handle is closed or every listener is
    /// gone.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                received = self.listener_rx.recv() => match received {
                    Some((index, Some(datagram))) => {
                        self.handle_listener_datagram(index, datagram)
                    }
                    Some((index, None)) => {
                        error!(
                            "listening endpoint {} failed, shutting down",
                            self.listeners[index].endpoint.local_addr()
                        );
                        break;
                    }
                    None => break,
                },
                received = self.session_rx.recv() => {
                    if let Some((peer, event)) = received {
                        self.handle_session_event(peer, event);
                    }
                }
            }
        }

        for listener in &self.listeners {
            listener.endpoint.close();
        }
        info!("TFTP server stopped");
    }

    fn handle_listener_datagram(&mut self, index: usize, datagram: Datagram) {
        let peer = datagram.from;
        match Packet::decode(&datagram.data) {
            Ok(Packet::Rrq {
                filename,
                mode,
                options,
            }) => {
                if self.sessions.contains_key(&peer) {
                    // clients have been observed to repeat the RRQ while the
                    // first answer is still in flight
                    debug!(%peer, %filename, "dropping duplicate read request");
                    return;
                }
                self.spawn_session(index, peer, filename, &mode, &options);
            }
            Ok(other) => {
                debug!(%peer, packet = ?packet_name(&other), "non-RRQ packet on listening endpoint");
                self.reject(index, peer);
            }
            Err(e) => {
                debug!(%peer, "undecodable datagram on listening endpoint: {}", e);
                self.reject(index, peer);
            }
        }
    }

    fn reject(&self, index: usize, peer: SocketAddr) {
        let datagram = packet::error_datagram(ErrorCode::IllegalOperation, "Illegal TFTP opcode");
        if let Err(e) = self.listeners[index].endpoint.send_to(&datagram, peer) {
            warn!(%peer, "failed to send error reply: {}", e);
        }
    }

    fn spawn_session(
        &mut self,
        index: usize,
        peer: SocketAddr,
        filename: String,
        mode: &str,
        options: &[(String, String)],
    ) {
        info!(%peer, %filename, %mode, "read request");
        let files_dir = self.listeners[index].files_dir.clone();
        let mut session = match ReadSession::new(
            peer,
            &filename,
            mode,
            options,
            &files_dir,
            &self.limits,
            self.factory.as_ref(),
        ) {
            Ok(session) => session,
            Err(e) => {
                error!(%peer, "could not set up read session: {}", e);
                return;
            }
        };

        // validation failures answered the peer already; just report them
        for event in session.drain_events() {
            self.forward_event(peer, event);
        }
        if session.is_terminal() {
            return;
        }

        let tid_port = session.local_port();
        let _ = self.events.send(ServerEvent::NewReadSession { peer, filename });
        self.sessions.insert(peer, tid_port);
        tokio::spawn(session.run(self.session_tx.clone()));
    }

    fn handle_session_event(&mut self, peer: SocketAddr, event: SessionEvent) {
        let terminal = matches!(
            event,
            SessionEvent::Finished | SessionEvent::Error { .. }
        );
        self.forward_event(peer, event);
        if terminal {
            if let Some(tid_port) = self.sessions.remove(&peer) {
                debug!(%peer, tid_port, "session reaped");
            }
        }
    }

    fn forward_event(&self, peer: SocketAddr, event: SessionEvent) {
        let event = match event {
            SessionEvent::Progress { percent } => ServerEvent::Progress { peer, percent },
            SessionEvent::SlowNetwork { mean_delay_us } => {
                ServerEvent::SlowNetwork {
                    peer,
                    mean_delay_us,
                }
            }
            SessionEvent::Finished => ServerEvent::TransferFinished { peer },
            SessionEvent::Error { message } => ServerEvent::TransferError { peer, message },
        };
        let _ = self.events.send(event);
    }
}

fn packet_name(packet: &Packet) -> &'static str {
    match packet {
        Packet::Rrq { .. } => "RRQ",
        Packet::Wrq { .. } => "WRQ",
        Packet::Data { .. } => "DATA",
        Packet::Ack { .. } => "ACK",
        Packet::Error { .. } => "ERROR",
        Packet::Oack { .. } => "OACK",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simnet::SimNetwork;
    use crate::Opcode;
    use std::io::Write;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    const LISTEN_PORT: u16 = 6969;

    fn peer() -> SocketAddr {
        "10.6.11.123:1234".parse().unwrap()
    }

    fn rrq(filename: &str, mode: &str) -> Vec<u8> {
        Packet::Rrq {
            filename: filename.to_string(),
            mode: mode.to_string(),
            options: vec![],
        }
        .encode()
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    async fn start_server(dir: &TempDir) -> (SimNetwork, ServerHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        let sim = SimNetwork::new();
        let (mut server, handle, events) =
            TftpServer::new(TransferLimits::default(), Arc::new(sim.clone()));
        server
            .bind(Ipv4Addr::LOCALHOST.into(), LISTEN_PORT, dir.path().to_path_buf())
            .unwrap();
        tokio::spawn(server.run());
        (sim, handle, events)
    }

    #[tokio::test]
    async fn rrq_spawns_a_session_on_its_own_port() {
        let dir = TempDir::new().unwrap();
        let mut file = std::fs::File::create(dir.path().join("hello.txt")).unwrap();
        file.write_all(b"hi there").unwrap();

        let (sim, _handle, mut events) = start_server(&dir).await;
        sim.deliver(LISTEN_PORT, peer(), &rrq("hello.txt", "octet"));

        assert_eq!(
            events.recv().await.unwrap(),
            ServerEvent::NewReadSession {
                peer: peer(),
                filename: "hello.txt".to_string()
            }
        );

        let ports = sim.bound_ports();
        assert_eq!(ports.len(), 2);
        let tid_port = ports[1];
        assert_ne!(tid_port, LISTEN_PORT);

        // the first DATA leaves the session socket, not the listener
        let (datagram, dest) = sim.next_output(tid_port).await;
        assert_eq!(dest, peer());
        assert_eq!(&datagram[0..2], &(Opcode::Data as u16).to_be_bytes());
        assert!(sim.try_output(LISTEN_PORT).is_none());
    }

    #[tokio::test]
    async fn duplicate_rrq_is_dropped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hi there").unwrap();

        let (sim, _handle, mut events) = start_server(&dir).await;
        sim.deliver(LISTEN_PORT, peer(), &rrq("hello.txt", "octet"));
        events.recv().await.unwrap();

        sim.deliver(LISTEN_PORT, peer(), &rrq("hello.txt", "octet"));
        settle().await;

        // one session socket, no error reply, no second event
        assert_eq!(sim.bound_ports().len(), 2);
        assert!(sim.try_output(LISTEN_PORT).is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_rrq_at_listener_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (sim, _handle, mut events) = start_server(&dir).await;

        sim.deliver(LISTEN_PORT, peer(), &packet::data_datagram(1, b"stray"));

        let (datagram, dest) = sim.next_output(LISTEN_PORT).await;
        assert_eq!(dest, peer());
        assert_eq!(&datagram[0..2], &(Opcode::Error as u16).to_be_bytes());
        assert_eq!(
            &datagram[2..4],
            &(ErrorCode::IllegalOperation as u16).to_be_bytes()
        );
        assert_eq!(&datagram[4..datagram.len() - 1], b"Illegal TFTP opcode");

        // no session was created
        assert_eq!(sim.bound_ports().len(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn wrq_is_rejected_like_any_unexpected_opcode() {
        let dir = TempDir::new().unwrap();
        let (sim, _handle, _events) = start_server(&dir).await;

        let wrq = Packet::Wrq {
            filename: "upload.bin".to_string(),
            mode: "octet".to_string(),
            options: vec![],
        }
        .encode();
        sim.deliver(LISTEN_PORT, peer(), &wrq);

        let (datagram, _) = sim.next_output(LISTEN_PORT).await;
        assert_eq!(
            &datagram[2..4],
            &(ErrorCode::IllegalOperation as u16).to_be_bytes()
        );
        assert_eq!(sim.bound_ports().len(), 1);
    }

    #[tokio::test]
    async fn failed_validation_reports_error_without_a_session() {
        let dir = TempDir::new().unwrap();
        let (sim, _handle, mut events) = start_server(&dir).await;

        sim.deliver(LISTEN_PORT, peer(), &rrq("missing.txt", "octet"));

        assert_eq!(
            events.recv().await.unwrap(),
            ServerEvent::TransferError {
                peer: peer(),
                message: "File not found".to_string()
            }
        );

        // the session socket answered the peer and is not retained
        let ports = sim.bound_ports();
        let (datagram, dest) = sim.next_output(ports[1]).await;
        assert_eq!(dest, peer());
        assert_eq!(
            &datagram[2..4],
            &(ErrorCode::FileNotFound as u16).to_be_bytes()
        );
    }

    #[tokio::test]
    async fn finished_sessions_are_reaped_and_peer_can_request_again() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hi there").unwrap();

        let (sim, _handle, mut events) = start_server(&dir).await;
        sim.deliver(LISTEN_PORT, peer(), &rrq("hello.txt", "octet"));
        events.recv().await.unwrap();

        let tid_port = sim.bound_ports()[1];
        sim.next_output(tid_port).await;
        sim.deliver(tid_port, peer(), &packet::ack_datagram(1));

        loop {
            match events.recv().await.unwrap() {
                ServerEvent::TransferFinished { peer: finished } => {
                    assert_eq!(finished, peer());
                    break;
                }
                ServerEvent::Progress { .. } => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }

        // reaped: a fresh RRQ from the same peer is accepted again
        sim.deliver(LISTEN_PORT, peer(), &rrq("hello.txt", "octet"));
        assert_eq!(
            events.recv().await.unwrap(),
            ServerEvent::NewReadSession {
                peer: peer(),
                filename: "hello.txt".to_string()
            }
        );
    }

    #[tokio::test]
    async fn close_unbinds_listeners() {
        let dir = TempDir::new().unwrap();
        let (sim, handle, _events) = start_server(&dir).await;

        handle.close();
        settle().await;

        // the dispatch loop is gone; new requests go nowhere
        sim.deliver(LISTEN_PORT, peer(), &rrq("hello.txt", "octet"));
        settle().await;
        assert_eq!(sim.bound_ports().len(), 1);
        assert!(sim.try_output(LISTEN_PORT).is_none());
    }
}
