use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::codec;
use crate::config::DEFAULT_MTU;
use crate::error::ProtoError;
use crate::fragment;
use crate::packet_header::{PacketHeader, CRC_SIZE, HEADER_SIZE};

pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Bind a UDP socket on all interfaces with SO_REUSEADDR set before bind.
pub async fn bind(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from(([0, 0, 0, 0], port)).into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Bind an ephemeral socket and connect it to the remote address, so plain
/// `send`/`recv` can be used instead of the addressed variants.
pub async fn connect(host: &str, port: u16) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((host, port)).await?;
    Ok(socket)
}

/// Serialize and send one packet. `to` is required for unconnected sockets.
///
/// A frame that would exceed the path MTU is split by the fragmenter and
/// sent as independent datagrams - it is never silently truncated.
pub async fn send(
    socket: &UdpSocket,
    header: &PacketHeader,
    payload: &[u8],
    to: Option<SocketAddr>,
) -> Result<usize, ProtoError> {
    let mtu = probe_mtu(socket);

    if HEADER_SIZE + payload.len() + CRC_SIZE > mtu as usize {
        if let Some(fragments) = fragment::split(header, payload, mtu)? {
            debug!("frame exceeds mtu {} - sending {} fragments", mtu, fragments.len());
            let mut written = 0;
            for frag in &fragments {
                written += send_datagram(socket, frag, to).await?;
            }
            return Ok(written);
        }
    }

    let buf = codec::serialize(header, payload)?;
    send_datagram(socket, &buf, to).await
}

async fn send_datagram(
    socket: &UdpSocket,
    buf: &[u8],
    to: Option<SocketAddr>,
) -> Result<usize, ProtoError> {
    let n = match to {
        Some(addr) => socket.send_to(buf, addr).await?,
        None => socket.send(buf).await?,
    };
    trace!("sent {} byte datagram", n);
    Ok(n)
}

/// Receive one datagram and decode it, returning the sender's address.
pub async fn recv(socket: &UdpSocket) -> Result<(PacketHeader, Vec<u8>, SocketAddr), ProtoError> {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let (n, from) = socket.recv_from(&mut buf).await?;

    let (header, payload) = codec::deserialize(&buf[..n])?;
    Ok((header, payload, from))
}

/// Path MTU for the socket's connected route via getsockopt(IP_MTU).
/// Unconnected sockets and probe failures fall back to [`DEFAULT_MTU`].
#[cfg(target_os = "linux")]
pub fn probe_mtu(socket: &UdpSocket) -> u32 {
    use std::os::fd::AsRawFd;

    let mut mtu: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MTU,
            &mut mtu as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };

    if rc != 0 || mtu <= 0 {
        return DEFAULT_MTU;
    }
    mtu as u32
}

/// IP_MTU is not available on this platform; assume the default.
#[cfg(not(target_os = "linux"))]
pub fn probe_mtu(_socket: &UdpSocket) -> u32 {
    DEFAULT_MTU
}
