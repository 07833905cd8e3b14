//! OverProto multiplexes application messages over TCP and UDP inside a
//! compact binary envelope, with optional zlib compression, AES-256-GCM
//! authenticated encryption, UDP fragmentation, and a selective-repeat ARQ
//! layer for reliable delivery over UDP.
//!
//! ## Design goals
//!
//! * One wire format for both transports: a fixed 24-byte header, the
//!   payload, and a CRC32 trailer. TCP recovers frame boundaries from the
//!   length carried in the header; UDP maps one frame to one datagram.
//! * The library stays a pull API and spawns no tasks of its own - receive
//!   loops, ACK pumps and retransmit timers are driven by the caller, which
//!   keeps the concurrency model in the embedder's hands.
//! * Payload transforms (deflate, AEAD) compose on the send path and are
//!   reversed on delivery, signalled per-packet through header flags rather
//!   than negotiated per-connection.
//! * Reliability is opt-in per packet: the RELIABLE flag routes a packet
//!   through a per-peer sliding window with individual ACKs, RTT-driven
//!   retransmission and TCP-style congestion control, while unreliable
//!   traffic on the same socket passes straight through.
//!
//! ## Wire format
//!
//! All multi-byte integers are big-endian.
//!
//! ```ascii
//!  0: magic (u16) - 0xABCD
//!  2: version (u8) - 0x01
//!  3: flags (u8) - FRAGMENT 0x01 | COMPRESSED 0x02 | ENCRYPTED 0x04
//!                  | RELIABLE 0x08 | ACK 0x10
//!  4: opcode (u8) - DATA 1, CONTROL 2, ACK 3, PING 4, PONG 5
//!  5: proto (u8) - TCP 1, UDP 2, HTTP 3 (reserved)
//!  6: stream id (u32) - application-level multiplexing tag
//! 10: seq (u32) - ARQ sequence number, wraps
//! 14: fragment id (u16) - 0-based index, 0 when unfragmented
//! 16: total fragments (u16) - 0 when unfragmented
//! 18: payload length (u16)
//! 20: reserved (u32) - always transmitted as zero; part of the CRC preimage
//! 24: payload (payload length bytes)
//!  *: crc32 (u32) - IEEE 802.3 reflected, over header and payload
//! ```
//!
//! An encrypted payload carries its own sub-format:
//!
//! ```ascii
//!  0: iv (12 bytes, random per packet)
//! 12: ciphertext
//!  *: tag (16 bytes, AES-GCM authentication tag)
//! ```
//!
//! ## Reliability
//!
//! Reliable UDP delivery uses a 32-slot selective-repeat window per peer.
//! Each data packet is ACKed individually; the send base advances over
//! contiguous runs of acknowledged slots, and the receive side tracks
//! arrivals in a bitmap that suppresses duplicates and advances its base
//! once gaps close. Loss recovery combines an RFC 6298-style
//! RTO estimator with fast retransmit on the third duplicate ACK; cwnd grows
//! by slow start and congestion avoidance and collapses on a retransmission
//! timeout. A packet that exhausts its retries is dropped, surfacing only as
//! a stalled window.
//!
//! Ordering is promised only within one reliable context; distinct streams
//! and distinct peers are independent.

mod codec;
mod compress;
mod config;
mod crypto;
mod endpoint;
mod error;
mod fragment;
mod packet_header;
mod reliable;
mod safe_converter;
mod send_pipeline;
mod tcp;
mod udp;

pub use codec::{crc32, deserialize, serialize};
pub use compress::{
    compress, decompress, should_compress, COMPRESS_LEVEL, COMPRESS_THRESHOLD,
    MAX_DECOMPRESSED_SIZE,
};
pub use config::{Config, DEFAULT_MTU};
pub use crypto::{KeySlot, IV_SIZE, KEY_SIZE, TAG_SIZE};
pub use endpoint::{Conn, OverProto, RecvHandler};
pub use error::ProtoError;
pub use fragment::{split, FragmentAssembler, MAX_FRAGMENTS, REASSEMBLY_TIMEOUT};
pub use packet_header::{
    Flags, Opcode, PacketHeader, Proto, CRC_SIZE, HEADER_SIZE, MAGIC, MAX_PACKET_SIZE,
    MAX_PAYLOAD_SIZE, MIN_PACKET_SIZE, VERSION,
};
pub use reliable::{
    DatagramSocket, ReliableContext, FAST_RETRANSMIT_THRESHOLD, INITIAL_CWND, INITIAL_RTT,
    MAX_CWND, MAX_RETRIES, WINDOW_SIZE,
};
pub use send_pipeline::{open_payload, prepare_payload};
pub use tcp::{accept, connect, listen, send as tcp_send, TcpConnection};
pub use udp::{
    bind as udp_bind, connect as udp_connect, probe_mtu, recv as udp_recv, send as udp_send,
    RECV_BUFFER_SIZE,
};
