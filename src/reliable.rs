use std::cmp::{max, min};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::codec;
use crate::error::ProtoError;
use crate::packet_header::{Flags, Opcode, PacketHeader, Proto};
use crate::udp::RECV_BUFFER_SIZE;

pub const WINDOW_SIZE: u32 = 32;
pub const INITIAL_RTT: Duration = Duration::from_millis(100);
pub const INITIAL_CWND: u32 = 4;
pub const MAX_CWND: u32 = 32;
pub const MAX_RETRIES: u32 = 5;
pub const FAST_RETRANSMIT_THRESHOLD: u32 = 3;

/// Abstraction over a UDP socket, introduced to facilitate mocking the I/O
/// part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_packet(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;

    async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_packet(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.send_to(buf, to).await
    }

    async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Sent,
    Acked,
    Retransmit,
}

/// One in-flight packet. The slot owns its serialized bytes until cumulative
/// advance frees it; retransmits reuse the stored bytes unchanged so the
/// frame a peer has already CRC-validated never mutates.
struct WindowSlot {
    serialized: BytesMut,
    state: SlotState,
    sent_at: Instant,
    retry_count: u32,
}

/// RFC 6298-style smoothed RTT estimation.
#[derive(Debug)]
struct RttEstimator {
    srtt: Duration,
    rttvar: Duration,
    rto: Duration,
    samples: u64,
}

impl RttEstimator {
    fn new() -> RttEstimator {
        RttEstimator {
            srtt: INITIAL_RTT,
            rttvar: INITIAL_RTT / 2,
            rto: INITIAL_RTT + 4 * (INITIAL_RTT / 2),
            samples: 0,
        }
    }

    fn on_sample(&mut self, r: Duration) {
        if self.samples == 0 {
            self.srtt = r;
            self.rttvar = r / 2;
        } else {
            let delta = if r > self.srtt { r - self.srtt } else { self.srtt - r };
            self.rttvar = (3 * self.rttvar + delta) / 4;
            self.srtt = (7 * self.srtt + r) / 8;
        }
        self.rto = self.srtt + 4 * self.rttvar;
        self.samples += 1;
    }
}

struct ReliableState {
    send_window: [Option<WindowSlot>; WINDOW_SIZE as usize],
    send_base: u32,
    next_seq: u32,

    recv_base: u32,
    recv_window: [bool; WINDOW_SIZE as usize],

    rtt: RttEstimator,

    cwnd: u32,
    ssthresh: u32,
    in_slow_start: bool,
    /// fresh-ACK accumulator realizing `cwnd += 1/cwnd` in integer arithmetic
    cwnd_cnt: u32,
    dup_ack_count: u32,
    last_ack_seq: u32,
}

impl ReliableState {
    fn new() -> ReliableState {
        ReliableState {
            send_window: std::array::from_fn(|_| None),
            send_base: 0,
            next_seq: 0,
            recv_base: 0,
            recv_window: [false; WINDOW_SIZE as usize],
            rtt: RttEstimator::new(),
            cwnd: INITIAL_CWND,
            ssthresh: MAX_CWND,
            in_slow_start: true,
            cwnd_cnt: 0,
            dup_ack_count: 0,
            last_ack_seq: 0,
        }
    }

    fn in_send_window(&self, seq: u32) -> bool {
        seq.wrapping_sub(self.send_base) < WINDOW_SIZE
    }

    fn in_recv_window(&self, seq: u32) -> bool {
        seq.wrapping_sub(self.recv_base) < WINDOW_SIZE
    }

    fn on_fresh_ack(&mut self) {
        if self.in_slow_start {
            self.cwnd = min(self.cwnd + 1, MAX_CWND);
            if self.cwnd >= self.ssthresh {
                self.in_slow_start = false;
            }
        } else {
            self.cwnd_cnt += 1;
            if self.cwnd_cnt >= self.cwnd {
                self.cwnd_cnt = 0;
                self.cwnd = min(self.cwnd + 1, MAX_CWND);
            }
        }
    }

    fn on_retransmission_timeout(&mut self) {
        self.ssthresh = max(self.cwnd / 2, 2);
        self.cwnd = INITIAL_CWND;
        self.in_slow_start = true;
        self.cwnd_cnt = 0;
        debug!("timeout - collapsing cwnd to {}, ssthresh {}", self.cwnd, self.ssthresh);
    }

    /// Advance `send_base` past every contiguously ACKed slot, freeing them.
    fn advance_send_base(&mut self) {
        while self.send_base != self.next_seq {
            let idx = (self.send_base % WINDOW_SIZE) as usize;
            match &self.send_window[idx] {
                Some(slot) if slot.state == SlotState::Acked => {
                    self.send_window[idx] = None;
                    self.send_base = self.send_base.wrapping_add(1);
                }
                _ => break,
            }
        }
    }
}

/// Selective-repeat ARQ over UDP for a single peer.
///
/// Unreliable packets pass through untouched; RELIABLE packets get a sequence
/// number from a 32-slot sliding window, are ACKed individually by the peer
/// and retransmitted on duplicate ACKs or RTO expiry. Each in-window packet
/// is delivered exactly once; the receive bitmap suppresses duplicates and
/// `recv_base` advances over every contiguous run of received packets.
///
/// One context serves exactly one peer; datagrams from other sources are
/// rejected with `WrongPeer`. A server talking to many peers keeps one
/// context per peer and evicts them on its own policy (an LRU with an idle
/// timeout works well).
///
/// The caller drives [`process_timeouts`](Self::process_timeouts) on a
/// cadence of at most half the current RTO.
pub struct ReliableContext {
    socket: Arc<dyn DatagramSocket>,
    peer: SocketAddr,
    state: Mutex<ReliableState>,
}

impl ReliableContext {
    pub fn new(socket: Arc<dyn DatagramSocket>, peer: SocketAddr) -> ReliableContext {
        ReliableContext {
            socket,
            peer,
            state: Mutex::new(ReliableState::new()),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn current_rto(&self) -> Duration {
        self.state.lock().await.rtt.rto
    }

    /// Assign the next sequence number, stamp RELIABLE, store the serialized
    /// frame in its window slot and send it.
    ///
    /// Fails with `WindowFull` when no slot is available; the caller may back
    /// off and retry after ACKs advance the window.
    pub async fn send(&self, header: &PacketHeader, payload: &[u8]) -> Result<usize, ProtoError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let in_flight = state.next_seq.wrapping_sub(state.send_base);
        let available = min(WINDOW_SIZE - in_flight, state.cwnd);
        if available == 0 {
            trace!("send window full: {} packets in flight", in_flight);
            return Err(ProtoError::WindowFull);
        }

        let seq = state.next_seq;
        state.next_seq = state.next_seq.wrapping_add(1);

        let mut pkt_header = header.clone();
        pkt_header.seq = seq;
        pkt_header.flags |= Flags::RELIABLE;

        let serialized = codec::serialize(&pkt_header, payload)?;

        let idx = (seq % WINDOW_SIZE) as usize;
        state.send_window[idx] = Some(WindowSlot {
            serialized,
            state: SlotState::Sent,
            sent_at: Instant::now(),
            retry_count: 0,
        });

        trace!("sending reliable packet {} ({} bytes)", seq, payload.len());
        let slot = state.send_window[idx].as_ref().expect("slot just stored");
        let n = self.socket.send_packet(&slot.serialized, self.peer).await?;
        Ok(n)
    }

    /// Receive the next packet from the peer.
    ///
    /// Incoming ACK packets are consumed internally (their `seq` refers to
    /// the send window) and the read continues. Unreliable packets pass
    /// through. Reliable data packets are ACKed, deduplicated, and delivered
    /// only inside the receive window; `OutOfWindow` and `Duplicate` are
    /// reported after the ACK has been re-emitted so the caller can loop.
    pub async fn recv(&self) -> Result<(PacketHeader, Vec<u8>), ProtoError> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let (n, from) = self.socket.recv_packet(&mut buf).await?;
            if from != self.peer {
                debug!("dropping datagram from unexpected peer {:?}", from);
                return Err(ProtoError::WrongPeer { expected: self.peer, actual: from });
            }

            let (header, payload) = codec::deserialize(&buf[..n])?;

            if header.flags.contains(Flags::ACK) && header.opcode == Opcode::Ack as u8 {
                trace!("ack for {}", header.seq);
                self.process_ack(header.seq).await?;
                continue;
            }

            if !header.flags.contains(Flags::RELIABLE) {
                return Ok((header, payload));
            }

            return self.handle_reliable_packet(header, payload).await;
        }
    }

    async fn handle_reliable_packet(
        &self,
        header: PacketHeader,
        payload: Vec<u8>,
    ) -> Result<(PacketHeader, Vec<u8>), ProtoError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let seq = header.seq;

        if !state.in_recv_window(seq) {
            let base = state.recv_base;
            debug!("packet {} outside receive window at {}", seq, base);
            self.send_ack(seq).await?;
            return Err(ProtoError::OutOfWindow { seq, base });
        }

        let idx = (seq % WINDOW_SIZE) as usize;
        if state.recv_window[idx] {
            trace!("duplicate packet {}", seq);
            self.send_ack(seq).await?;
            return Err(ProtoError::Duplicate(seq));
        }

        state.recv_window[idx] = true;
        if seq == state.recv_base {
            while state.recv_window[(state.recv_base % WINDOW_SIZE) as usize] {
                state.recv_window[(state.recv_base % WINDOW_SIZE) as usize] = false;
                state.recv_base = state.recv_base.wrapping_add(1);
            }
            trace!("receive window advanced to {}", state.recv_base);
        }

        self.send_ack(seq).await?;
        Ok((header, payload))
    }

    async fn send_ack(&self, ack_seq: u32) -> Result<(), ProtoError> {
        let mut header = PacketHeader::new(0, Opcode::Ack, Proto::Udp, Flags::ACK | Flags::RELIABLE);
        header.seq = ack_seq;

        let buf = codec::serialize(&header, &[])?;
        self.socket.send_packet(&buf, self.peer).await?;
        trace!("acked {}", ack_seq);
        Ok(())
    }

    /// Process one acknowledged sequence number.
    ///
    /// ACKs outside the send window or for already-settled slots are ignored,
    /// which makes replay idempotent. The third consecutive duplicate ACK
    /// triggers an immediate retransmit of the stored bytes; a fresh ACK
    /// samples RTT (first transmission only), grows cwnd and advances the
    /// window cumulatively.
    pub async fn process_ack(&self, ack_seq: u32) -> Result<(), ProtoError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if !state.in_send_window(ack_seq) {
            trace!("ack {} outside send window at {} - ignoring", ack_seq, state.send_base);
            return Ok(());
        }

        let idx = (ack_seq % WINDOW_SIZE) as usize;
        match state.send_window[idx].as_ref() {
            None => return Ok(()),
            Some(slot) if slot.state == SlotState::Acked => return Ok(()),
            Some(_) => {}
        }

        if ack_seq == state.last_ack_seq {
            state.dup_ack_count += 1;
            trace!("duplicate ack {} ({} so far)", ack_seq, state.dup_ack_count);

            if state.dup_ack_count == FAST_RETRANSMIT_THRESHOLD {
                debug!("fast retransmit of {}", ack_seq);
                let slot = state.send_window[idx].as_mut().expect("slot checked above");
                slot.state = SlotState::Retransmit;
                // sent_at is left alone: a fast-retransmitted packet must not
                // produce an RTT sample for the retransmission
                self.socket.send_packet(&slot.serialized, self.peer).await?;
            }
            return Ok(());
        }

        state.dup_ack_count = 0;
        state.last_ack_seq = ack_seq;

        let rtt_sample = {
            let slot = state.send_window[idx].as_mut().expect("slot checked above");
            let sample = (slot.retry_count == 0).then(|| slot.sent_at.elapsed());
            slot.state = SlotState::Acked;
            sample
        };
        if let Some(sample) = rtt_sample {
            state.rtt.on_sample(sample);
            trace!("rtt sample {:?}, rto now {:?}", sample, state.rtt.rto);
        }

        state.on_fresh_ack();
        state.advance_send_base();
        Ok(())
    }

    /// Scan the send window for slots whose RTO has expired: retransmit them
    /// (bumping retry counts and collapsing cwnd), or drop them once
    /// `MAX_RETRIES` is exhausted. Returns the number of retransmissions.
    pub async fn process_timeouts(&self) -> Result<usize, ProtoError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let now = Instant::now();
        let mut retransmitted = 0;
        let mut timed_out = false;

        let mut seq = state.send_base;
        while seq != state.next_seq {
            let idx = (seq % WINDOW_SIZE) as usize;

            let expired = match state.send_window[idx].as_ref() {
                Some(slot) => {
                    slot.state != SlotState::Acked
                        && now.duration_since(slot.sent_at) > state.rtt.rto
                }
                None => false,
            };

            if expired {
                let retries_exhausted = state.send_window[idx]
                    .as_ref()
                    .map(|slot| slot.retry_count >= MAX_RETRIES)
                    .unwrap_or(false);

                if retries_exhausted {
                    warn!("packet {} dropped after {} retries", seq, MAX_RETRIES);
                    state.send_window[idx] = None;
                } else {
                    let slot = state.send_window[idx].as_mut().expect("slot checked above");
                    slot.retry_count += 1;
                    slot.sent_at = now;
                    slot.state = SlotState::Retransmit;
                    debug!("retransmitting {} (attempt {})", seq, slot.retry_count);

                    self.socket.send_packet(&slot.serialized, self.peer).await?;
                    retransmitted += 1;
                    timed_out = true;
                }
            }

            seq = seq.wrapping_add(1);
        }

        if timed_out {
            state.on_retransmission_timeout();
        }

        Ok(retransmitted)
    }
}
