//! Per-transfer session engine.
//!
//! A [`ReadSession`] is created for each accepted RRQ. It owns the ephemeral
//! UDP endpoint whose port is the server-side transfer ID, the open file
//! handle, the block counter and the retransmit timer. The state machine
//! itself is synchronous: [`ReadSession::handle_datagram`] and
//! [`ReadSession::handle_timeout`] run to completion and emit at most one
//! outbound datagram each. [`ReadSession::run`] is the async driver that
//! serializes those two inputs and forwards session events to the
//! dispatcher.
//!
//! Protocol rules enforced here (RFC 1350, RFC 2347):
//! - exactly one DATA or OACK is outstanding at any time; the next block is
//!   loaded only once that packet is acknowledged
//! - a retransmission carries the identical bytes and block number
//! - a DATA payload shorter than the block size ends the transfer, so a file
//!   whose size is an exact multiple of the block size is terminated by one
//!   empty DATA packet

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::endpoint::{BoundEndpoint, Datagram, SocketFactory, UdpEndpoint};
use crate::error::Result;
use crate::netascii::NetasciiEncoder;
use crate::options;
use crate::packet::{self, Packet};
use crate::{ErrorCode, TransferMode, DEFAULT_BLOCK_SIZE};

/// Size of the sliding window over recent ACK delays.
const ACK_DELAY_WINDOW: usize = 20;

/// Transfer tuning threaded from the dispatcher into every new session.
#[derive(Debug, Clone)]
pub struct TransferLimits {
    pub retransmit_timeout: Duration,
    pub max_retries: u32,
    pub slow_network_threshold_us: u64,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            retransmit_timeout: Duration::from_millis(crate::DEFAULT_RETRANSMIT_TIMEOUT_MS),
            max_retries: crate::DEFAULT_MAX_RETRIES,
            slow_network_threshold_us: crate::DEFAULT_SLOW_NETWORK_THRESHOLD_US,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// OACK sent, waiting for the client's ACK of block 0.
    OptionsNegotiation,
    /// Transfer in progress.
    Busy,
    /// Terminal: last block acknowledged.
    Finished,
    /// Terminal: validation, protocol or retransmit failure.
    InError,
}

/// Notifications a session produces for the dispatcher's event sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Progress { percent: u8 },
    SlowNetwork { mean_delay_us: u64 },
    Finished,
    Error { message: String },
}

pub struct ReadSession {
    peer: SocketAddr,
    socket: Arc<dyn UdpEndpoint>,
    incoming: Option<mpsc::UnboundedReceiver<Datagram>>,
    file_path: PathBuf,
    file: Option<File>,
    file_size: u64,
    file_pos: u64,
    mode: TransferMode,
    block_size: usize,
    retransmit_timeout: Duration,
    max_retries: u32,
    /// Number of the outstanding DATA block; 0 until the first send.
    block_nr: u16,
    /// Payload of the outstanding DATA block.
    block: Vec<u8>,
    /// Framed bytes of the outstanding DATA/OACK, for byte-identical resends.
    last_datagram: Vec<u8>,
    netascii: NetasciiEncoder,
    ack_delays: VecDeque<u64>,
    retransmit_count: u32,
    last_send: Option<Instant>,
    deadline: Option<Instant>,
    slow_threshold_us: u64,
    slow_network_reported: bool,
    last_progress: u8,
    state: SessionState,
    events: Vec<SessionEvent>,
}

impl ReadSession {
    /// Build a session for a decoded RRQ and perform the first send.
    ///
    /// The returned session may already be `InError` when the request failed
    /// validation; the error reply has been sent to the peer in that case.
    /// `Err` is returned only when no session socket could be bound.
    pub fn new(
        peer: SocketAddr,
        filename: &str,
        mode: &str,
        requested_options: &[(String, String)],
        files_dir: &Path,
        limits: &TransferLimits,
        factory: &dyn SocketFactory,
    ) -> Result<Self> {
        let bind_addr: IpAddr = if peer.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let BoundEndpoint { endpoint, incoming } = factory.bind(bind_addr, 0)?;

        let mut session = Self {
            peer,
            socket: endpoint,
            incoming: Some(incoming),
            file_path: files_dir.join(filename),
            file: None,
            file_size: 0,
            file_pos: 0,
            mode: TransferMode::Octet,
            block_size: DEFAULT_BLOCK_SIZE,
            retransmit_timeout: limits.retransmit_timeout,
            max_retries: limits.max_retries,
            block_nr: 0,
            block: Vec::new(),
            last_datagram: Vec::new(),
            netascii: NetasciiEncoder::new(),
            ack_delays: VecDeque::with_capacity(ACK_DELAY_WINDOW),
            retransmit_count: 0,
            last_send: None,
            deadline: None,
            slow_threshold_us: limits.slow_network_threshold_us,
            slow_network_reported: false,
            last_progress: 0,
            state: SessionState::Busy,
            events: Vec::new(),
        };
        session.start(mode, requested_options);
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Port of the session's ephemeral socket, i.e. the server-side TID.
    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().port()
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn current_block_nr(&self) -> u16 {
        self.block_nr
    }

    /// Mean of the recorded ACK delays, rounded half-up, in microseconds.
    pub fn average_ack_delay_us(&self) -> u64 {
        if self.ack_delays.is_empty() {
            return 0;
        }
        let sum: u64 = self.ack_delays.iter().sum();
        let n = self.ack_delays.len() as u64;
        (sum + n / 2) / n
    }

    /// Take the events accumulated since the last call.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Finished | SessionState::InError)
    }

    fn start(&mut self, mode: &str, requested_options: &[(String, String)]) {
        match TransferMode::from_str(mode) {
            Ok(TransferMode::Mail) => {
                return self.fail(ErrorCode::IllegalOperation, "Mail transfer not supported");
            }
            Ok(valid) => self.mode = valid,
            Err(_) => {
                return self.fail(ErrorCode::IllegalOperation, "Illegal transfer mode");
            }
        }

        match std::fs::metadata(&self.file_path) {
            Ok(meta) if meta.is_file() => self.file_size = meta.len(),
            _ => {
                return self.fail(ErrorCode::FileNotFound, "File not found");
            }
        }

        match File::open(&self.file_path) {
            Ok(file) => self.file = Some(file),
            Err(e) => {
                return self.fail(ErrorCode::NotDefined, &e.to_string());
            }
        }

        let negotiated = options::negotiate(requested_options, self.file_size);
        if let Some(size) = negotiated.block_size {
            self.block_size = size;
        }
        if let Some(timeout) = negotiated.timeout {
            self.retransmit_timeout = timeout;
        }

        if negotiated.any_accepted() {
            debug!(peer = %self.peer, options = ?negotiated.reply, "sending OACK");
            self.state = SessionState::OptionsNegotiation;
            self.send_outstanding(packet::oack_datagram(&negotiated.reply));
        } else {
            self.advance();
        }
    }

    /// Handle a datagram arriving on the session's ephemeral socket.
    pub fn handle_datagram(&mut self, data: &[u8]) {
        if self.is_terminal() {
            debug!(peer = %self.peer, "dropping datagram for terminal session");
            return;
        }

        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(peer = %self.peer, "undecodable datagram: {}", e);
                return self.fail(ErrorCode::NotDefined, "Malformed datagram");
            }
        };

        let ack_block = match packet {
            Packet::Ack { block } => block,
            Packet::Error { code, message }
                if self.state == SessionState::OptionsNegotiation
                    && (code == ErrorCode::OptionNegotiationFailed as u16
                        || code == ErrorCode::DiskFull as u16) =>
            {
                debug!(peer = %self.peer, code, reason = %message, "peer rejected option negotiation");
                return self.finish();
            }
            _ => {
                return self.fail(ErrorCode::IllegalOperation, "Unexpected TFTP opcode");
            }
        };

        // The previous block's ACK may arrive a second time; the next block
        // was already produced for the first copy.
        if self.block_nr > 0 && ack_block == self.block_nr - 1 {
            debug!(peer = %self.peer, "ignoring duplicate ack for block {}", ack_block);
            return;
        }
        if ack_block != self.block_nr {
            return self.fail(ErrorCode::IllegalOperation, "Ack contains wrong block number");
        }

        self.deadline = None;
        self.retransmit_count = 0;

        if self.state == SessionState::OptionsNegotiation {
            self.state = SessionState::Busy;
            return self.advance();
        }

        if self.block.len() < self.block_size {
            self.report_progress();
            return self.finish();
        }

        self.record_ack_delay(ack_block);
        self.report_progress();
        self.advance();
    }

    /// Drive the retransmit timer; call when the armed deadline has elapsed.
    pub fn handle_timeout(&mut self) {
        if self.is_terminal() || self.deadline.is_none() {
            return;
        }

        if self.retransmit_count < self.max_retries {
            self.retransmit_count += 1;
            debug!(
                peer = %self.peer,
                attempt = self.retransmit_count,
                "retransmitting block {}",
                self.block_nr
            );
            let datagram = self.last_datagram.clone();
            self.send_outstanding(datagram);
        } else {
            self.enter_error("Maximum nr of re-transmissions reached");
        }
    }

    /// Deadline of the armed retransmit timer, if one is outstanding.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drive the session to completion, forwarding its events tagged with the
    /// peer identity.
    pub async fn run(mut self, events: mpsc::UnboundedSender<(SocketAddr, SessionEvent)>) {
        let Some(mut incoming) = self.incoming.take() else {
            return;
        };

        self.flush_events(&events);
        while !self.is_terminal() {
            let deadline = self.deadline;
            tokio::select! {
                received = incoming.recv() => match received {
                    Some(datagram) => {
                        if datagram.from == self.peer {
                            self.handle_datagram(&datagram.data);
                        } else {
                            self.reject_stranger(datagram.from);
                        }
                    }
                    None => break,
                },
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => self.handle_timeout(),
            }
            self.flush_events(&events);
        }
        self.socket.close();
    }

    /// Load the next block and send it; errors are converted to `InError`.
    fn advance(&mut self) {
        if let Err(e) = self.load_next_block() {
            warn!(
                peer = %self.peer,
                path = %self.file_path.display(),
                "read error: {}",
                e
            );
            return self.fail(ErrorCode::NotDefined, &e.to_string());
        }
        self.block_nr = self.block_nr.wrapping_add(1);
        self.retransmit_count = 0;
        let datagram = packet::data_datagram(self.block_nr, &self.block);
        self.send_outstanding(datagram);
    }

    /// Fill `self.block` with the next payload.
    ///
    /// An empty payload at end-of-file is deliberate: it terminates a
    /// transfer whose size is an exact multiple of the block size.
    fn load_next_block(&mut self) -> std::io::Result<()> {
        self.block.clear();

        let carry_pending = self.mode == TransferMode::Netascii && self.netascii.has_carry();
        if self.file_pos >= self.file_size && !carry_pending {
            return Ok(());
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        match self.mode {
            TransferMode::Netascii => {
                self.block = self.netascii.next_block(file, self.block_size)?;
            }
            _ => {
                (&mut *file)
                    .take(self.block_size as u64)
                    .read_to_end(&mut self.block)?;
            }
        }
        self.file_pos = file.stream_position()?;
        Ok(())
    }

    /// Send a DATA/OACK datagram, remember it for retransmission and arm the
    /// retransmit timer.
    fn send_outstanding(&mut self, datagram: Vec<u8>) {
        if let Err(e) = self.socket.send_to(&datagram, self.peer) {
            warn!(peer = %self.peer, "send failed: {}", e);
            return self.enter_error(&format!("Socket send failed: {}", e));
        }
        let now = Instant::now();
        self.last_send = Some(now);
        self.deadline = Some(now + self.retransmit_timeout);
        self.last_datagram = datagram;
    }

    /// Send an ERROR reply to the peer and enter the terminal error state.
    fn fail(&mut self, code: ErrorCode, message: &str) {
        let datagram = packet::error_datagram(code, message);
        if let Err(e) = self.socket.send_to(&datagram, self.peer) {
            warn!(peer = %self.peer, "failed to send error reply: {}", e);
        }
        self.enter_error(message);
    }

    fn enter_error(&mut self, message: &str) {
        self.deadline = None;
        self.state = SessionState::InError;
        self.events.push(SessionEvent::Error {
            message: message.to_string(),
        });
    }

    fn finish(&mut self) {
        self.deadline = None;
        self.state = SessionState::Finished;
        self.events.push(SessionEvent::Finished);
    }

    fn record_ack_delay(&mut self, ack_block: u16) {
        // The first data block has no prior round trip to measure.
        if ack_block < 2 {
            return;
        }
        let Some(sent) = self.last_send else {
            return;
        };
        let delay_us = Instant::now().saturating_duration_since(sent).as_micros() as u64;
        if self.ack_delays.len() == ACK_DELAY_WINDOW {
            self.ack_delays.pop_front();
        }
        self.ack_delays.push_back(delay_us);

        if ack_block % 5 == 0 && !self.slow_network_reported {
            let mean = self.average_ack_delay_us();
            if mean > self.slow_threshold_us {
                self.slow_network_reported = true;
                self.events.push(SessionEvent::SlowNetwork {
                    mean_delay_us: mean,
                });
            }
        }
    }

    fn report_progress(&mut self) {
        if self.file_size == 0 {
            return;
        }
        let percent = (self.file_pos * 100 / self.file_size) as u8;
        if percent != self.last_progress {
            self.last_progress = percent;
            self.events.push(SessionEvent::Progress { percent });
        }
    }

    /// A datagram from a source other than our peer: answer with code 5 and
    /// leave the transfer alone (RFC 1350 §4).
    fn reject_stranger(&self, from: SocketAddr) {
        debug!(peer = %self.peer, %from, "datagram from unknown transfer id");
        let datagram =
            packet::error_datagram(ErrorCode::UnknownTransferId, "Unknown transfer ID");
        if let Err(e) = self.socket.send_to(&datagram, from) {
            warn!(peer = %self.peer, %from, "failed to send error reply: {}", e);
        }
    }

    fn flush_events(&mut self, events: &mpsc::UnboundedSender<(SocketAddr, SessionEvent)>) {
        for event in self.events.drain(..) {
            if events.send((self.peer, event)).is_err() {
                break;
            }
        }
    }
}
