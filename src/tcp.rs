use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::codec;
use crate::error::ProtoError;
use crate::packet_header::{PacketHeader, CRC_SIZE, HEADER_SIZE};

const LISTEN_BACKLOG: u32 = 10;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn listen(port: u16) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
    socket.listen(LISTEN_BACKLOG)
}

pub async fn accept(listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
    listener.accept().await
}

pub async fn connect(host: &str, port: u16) -> io::Result<TcpStream> {
    timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
}

/// Serialize a packet and write the whole frame to the stream.
pub async fn send(
    stream: &mut TcpStream,
    header: &PacketHeader,
    payload: &[u8],
) -> Result<usize, ProtoError> {
    let buf = codec::serialize(header, payload)?;
    stream.write_all(&buf).await?;
    trace!("sent {} byte frame", buf.len());
    Ok(buf.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvPhase {
    Idle,
    ReadingHeader,
    ReadingPayload,
    ReadingCrc,
    Ready,
}

struct RecvState<S> {
    stream: S,
    phase: RecvPhase,
    buffer: Vec<u8>,
    bytes_read: usize,
}

/// A framed receiver over a TCP byte stream.
///
/// TCP delivers bytes at arbitrary boundaries, so packet framing is recovered
/// by a small state machine: read the 24-byte header, learn `payload_len`
/// from it, grow the buffer once, then read payload and trailer. The state
/// lives behind a mutex so a single connection is driven by at most one
/// reader at a time; a cancelled `recv` leaves the machine mid-frame and the
/// next call resumes from the buffered bytes.
pub struct TcpConnection<S = TcpStream> {
    state: Mutex<RecvState<S>>,
}

impl<S: AsyncRead + Unpin> TcpConnection<S> {
    pub fn new(stream: S) -> TcpConnection<S> {
        TcpConnection {
            state: Mutex::new(RecvState {
                stream,
                phase: RecvPhase::Idle,
                buffer: Vec::new(),
                bytes_read: 0,
            }),
        }
    }

    /// Produce exactly one decoded packet, or an error.
    ///
    /// Zero bytes from the peer surfaces as `Eof`. Any I/O or codec error
    /// resets the machine to `Idle` before surfacing; the caller decides
    /// whether to keep the connection.
    pub async fn recv(&self) -> Result<(PacketHeader, Vec<u8>), ProtoError> {
        let mut state = self.state.lock().await;
        state.recv_packet().await
    }
}

impl<S: AsyncRead + Unpin> RecvState<S> {
    async fn recv_packet(&mut self) -> Result<(PacketHeader, Vec<u8>), ProtoError> {
        loop {
            match self.phase {
                RecvPhase::Idle => {
                    self.buffer.clear();
                    self.buffer.resize(HEADER_SIZE, 0);
                    self.bytes_read = 0;
                    self.phase = RecvPhase::ReadingHeader;
                }
                RecvPhase::ReadingHeader => {
                    if let Err(e) = self.fill_to(HEADER_SIZE).await {
                        return Err(self.abort(e));
                    }

                    let total = HEADER_SIZE + self.payload_len() + CRC_SIZE;
                    if self.buffer.len() < total {
                        self.buffer.resize(total, 0);
                    }
                    self.phase = RecvPhase::ReadingPayload;
                }
                RecvPhase::ReadingPayload => {
                    let target = HEADER_SIZE + self.payload_len();
                    if let Err(e) = self.fill_to(target).await {
                        return Err(self.abort(e));
                    }
                    self.phase = RecvPhase::ReadingCrc;
                }
                RecvPhase::ReadingCrc => {
                    let target = HEADER_SIZE + self.payload_len() + CRC_SIZE;
                    if let Err(e) = self.fill_to(target).await {
                        return Err(self.abort(e));
                    }
                    self.phase = RecvPhase::Ready;
                }
                RecvPhase::Ready => {
                    let result = codec::deserialize(&self.buffer[..self.bytes_read]);
                    self.phase = RecvPhase::Idle;
                    self.bytes_read = 0;

                    match result {
                        Ok(packet) => {
                            trace!("received {} byte payload", packet.1.len());
                            return Ok(packet);
                        }
                        Err(e) => {
                            debug!("dropping invalid frame: {}", e);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// `payload_len` straight from the buffered header octets, valid once the
    /// header has been read completely.
    fn payload_len(&self) -> usize {
        u16::from_be_bytes([self.buffer[18], self.buffer[19]]) as usize
    }

    async fn fill_to(&mut self, target: usize) -> Result<(), ProtoError> {
        while self.bytes_read < target {
            let n = self.stream.read(&mut self.buffer[self.bytes_read..target]).await?;
            if n == 0 {
                return Err(ProtoError::Eof);
            }
            self.bytes_read += n;
        }
        Ok(())
    }

    fn abort(&mut self, e: ProtoError) -> ProtoError {
        self.phase = RecvPhase::Idle;
        self.bytes_read = 0;
        e
    }
}
