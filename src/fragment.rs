use std::time::{Duration, Instant};

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::codec;
use crate::error::ProtoError;
use crate::packet_header::{Flags, PacketHeader, CRC_SIZE, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::safe_converter::PrecheckedCast;

pub const MAX_FRAGMENTS: usize = 256;
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Split an oversize payload into independently framed fragments.
///
/// Returns `None` when the payload fits a single frame of `mtu` bytes. Each
/// fragment inherits the header with the FRAGMENT flag, its index and the
/// total count, and is serialized with its own CRC trailer.
pub fn split(
    header: &PacketHeader,
    payload: &[u8],
    mtu: u32,
) -> Result<Option<Vec<BytesMut>>, ProtoError> {
    let mtu = mtu as usize;
    if mtu <= HEADER_SIZE + CRC_SIZE {
        return Err(ProtoError::MtuTooSmall(mtu as u32));
    }

    let max_frag = mtu - HEADER_SIZE - CRC_SIZE;
    if payload.len() <= max_frag {
        return Ok(None);
    }

    let total_frags = payload.len().div_ceil(max_frag);
    if total_frags > MAX_FRAGMENTS {
        return Err(ProtoError::TooManyFragments(total_frags));
    }

    trace!(
        "splitting {} byte payload into {} fragments of up to {} bytes",
        payload.len(),
        total_frags,
        max_frag
    );

    let mut fragments = Vec::with_capacity(total_frags);
    for (i, chunk) in payload.chunks(max_frag).enumerate() {
        let mut frag_header = header.clone();
        frag_header.flags |= Flags::FRAGMENT;
        frag_header.frag_id = i.prechecked_cast();
        frag_header.total_frags = total_frags.prechecked_cast();
        fragments.push(codec::serialize(&frag_header, chunk)?);
    }

    Ok(Some(fragments))
}

struct FragmentContext {
    total_frags: u16,
    received: u16,
    slots: Vec<Option<Vec<u8>>>,
    /// header snapshot from fragment 0, template for the reassembled packet
    first_header: PacketHeader,
    created_at: Instant,
}

/// Reassembles fragmented packets, keyed by `(stream_id, seq)`.
///
/// Duplicate fragments are silently ignored; contexts older than
/// [`REASSEMBLY_TIMEOUT`] are discarded by [`reap_expired`](Self::reap_expired),
/// which the embedder drives on its own cadence.
#[derive(Default)]
pub struct FragmentAssembler {
    contexts: FxHashMap<(u32, u32), FragmentContext>,
}

impl FragmentAssembler {
    pub fn new() -> FragmentAssembler {
        FragmentAssembler { contexts: FxHashMap::default() }
    }

    /// Feed one FRAGMENT-flagged packet. Returns the reassembled packet once
    /// all fragments have arrived, `None` while the set is still incomplete.
    pub fn add(
        &mut self,
        header: &PacketHeader,
        payload: &[u8],
    ) -> Result<Option<(PacketHeader, Vec<u8>)>, ProtoError> {
        if header.frag_id >= header.total_frags {
            return Err(ProtoError::InvalidFragId {
                frag_id: header.frag_id,
                total_frags: header.total_frags,
            });
        }

        let key = (header.stream_id, header.seq);
        let ctx = self.contexts.entry(key).or_insert_with(|| FragmentContext {
            total_frags: header.total_frags,
            received: 0,
            slots: vec![None; header.total_frags as usize],
            first_header: header.clone(),
            created_at: Instant::now(),
        });

        if header.frag_id >= ctx.total_frags {
            return Err(ProtoError::InvalidFragId {
                frag_id: header.frag_id,
                total_frags: ctx.total_frags,
            });
        }

        let slot = &mut ctx.slots[header.frag_id as usize];
        if slot.is_some() {
            trace!("duplicate fragment {}/{} for {:?} - ignoring", header.frag_id, ctx.total_frags, key);
            return Ok(None);
        }

        *slot = Some(payload.to_vec());
        ctx.received += 1;
        if header.frag_id == 0 {
            ctx.first_header = header.clone();
        }

        if ctx.received < ctx.total_frags {
            return Ok(None);
        }

        let ctx = self.contexts.remove(&key).expect("context present, just updated");

        let assembled_len: usize = ctx.slots.iter().map(|s| s.as_ref().map_or(0, Vec::len)).sum();
        if assembled_len > MAX_PAYLOAD_SIZE {
            return Err(ProtoError::PayloadTooLarge(assembled_len));
        }

        let mut payload = Vec::with_capacity(assembled_len);
        for slot in ctx.slots {
            payload.extend_from_slice(&slot.expect("all fragments received"));
        }

        let mut reassembled = ctx.first_header;
        reassembled.flags.remove(Flags::FRAGMENT);
        reassembled.frag_id = 0;
        reassembled.total_frags = 0;
        reassembled.payload_len = payload.len().prechecked_cast();

        trace!("reassembled {} byte packet for {:?}", payload.len(), key);
        Ok(Some((reassembled, payload)))
    }

    /// Drop contexts whose first fragment arrived more than
    /// [`REASSEMBLY_TIMEOUT`] ago. Returns the number of contexts reaped.
    pub fn reap_expired(&mut self) -> usize {
        let before = self.contexts.len();
        self.contexts.retain(|key, ctx| {
            let keep = ctx.created_at.elapsed() <= REASSEMBLY_TIMEOUT;
            if !keep {
                debug!(
                    "fragment context {:?} timed out with {}/{} fragments - discarding",
                    key, ctx.received, ctx.total_frags
                );
            }
            keep
        });
        before - self.contexts.len()
    }

    pub fn pending_contexts(&self) -> usize {
        self.contexts.len()
    }
}
