//! Receive-side split of oversized TCP frames into MSS-sized packets.
//!
//! Every output segment gets its own page: a copy of the original headers
//! followed by up to `mss` bytes of payload read through the chain cursor.
//! IP total length, TCP sequence and both checksums are rewritten; PSH is
//! kept on the last segment only.

use byteorder::{BigEndian, ByteOrder};

use crate::buffer::{BufId, Owner};
use crate::checksum::{ipv4_header_checksum, transport_checksum, ChecksumMode};
use crate::cursor::{ChainCursor, CursorPos};
use crate::freelist::BufferPool;
use crate::header::{
    PacketInfo, ETH_HEADER_LEN, IPV4_CSUM_OFFSET, IPV4_TOTAL_LEN_OFFSET, TCP_FLAGS_OFFSET,
    TCP_FLAG_PSH, TCP_SEQ_OFFSET,
};
use crate::reassembly::Frame;

/// The freelist ran dry in the middle of a split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stalled;

/// A frame being split. Survives a [`Stalled`] step so the split can
/// continue once buffers come back.
#[derive(Debug)]
pub(crate) struct Split {
    pub(crate) frame: Frame,
    info: PacketInfo,
    pos: CursorPos,
    seq: u32,
    remaining: usize,
    headers: Vec<u8>,
}

impl Split {
    pub(crate) fn new(pool: &BufferPool, frame: Frame, info: PacketInfo) -> Split {
        let mut headers = vec![0u8; info.headers_len()];
        let mut cursor = ChainCursor::new(&pool.arena, &frame.bufs);
        cursor.read(&mut headers);
        Split {
            pos: cursor.position(),
            seq: info.tcp_seq,
            remaining: info.payload_len,
            info,
            frame,
            headers,
        }
    }

    /// Whether a full `mss` segment and its headers fit in one page.
    pub(crate) fn fits(info: &PacketInfo, page_size: usize) -> bool {
        info.mss > 0 && info.headers_len() + info.mss as usize <= page_size
    }

    pub(crate) fn remaining(&self) -> usize {
        self.remaining
    }

    /// Builds the next segment.
    ///
    /// `Ok(None)` once the payload is used up; the source buffers are then
    /// back on the freelist.
    pub(crate) fn next_segment(&mut self, pool: &mut BufferPool) -> Result<Option<BufId>, Stalled> {
        if self.remaining == 0 {
            self.finish(pool);
            return Ok(None);
        }
        let id = pool.allocate(Owner::InFlight).ok_or(Stalled)?;
        let hlen = self.headers.len();
        let seg = self.remaining.min(self.info.mss as usize);
        let last = seg == self.remaining;
        let l4 = self.info.l4_offset();

        let copied = {
            let desc = &pool.arena[id];
            let mut page = desc.page.lock();
            let out = &mut page[..hlen + seg];
            out[..hlen].copy_from_slice(&self.headers);

            let ip_total = (self.info.ip_header_len + self.info.l4_header_len + seg) as u16;
            BigEndian::write_u16(
                &mut out[ETH_HEADER_LEN + IPV4_TOTAL_LEN_OFFSET..ETH_HEADER_LEN + IPV4_TOTAL_LEN_OFFSET + 2],
                ip_total,
            );
            let csum = ipv4_header_checksum(&out[ETH_HEADER_LEN..l4]);
            BigEndian::write_u16(
                &mut out[ETH_HEADER_LEN + IPV4_CSUM_OFFSET..ETH_HEADER_LEN + IPV4_CSUM_OFFSET + 2],
                csum,
            );
            BigEndian::write_u32(&mut out[l4 + TCP_SEQ_OFFSET..l4 + TCP_SEQ_OFFSET + 4], self.seq);
            if !last {
                out[l4 + TCP_FLAGS_OFFSET] &= !TCP_FLAG_PSH;
            }

            let mut cursor = ChainCursor::at(&pool.arena, &self.frame.bufs, self.pos);
            let mut filled = hlen;
            let copied = cursor.for_each_chunk(seg, |chunk| {
                out[filled..filled + chunk.len()].copy_from_slice(chunk);
                filled += chunk.len();
            });
            self.pos = cursor.position();
            copied
        };
        if copied != seg {
            crate::error::defect(format_args!(
                "frame ended {} bytes early while splitting",
                seg - copied
            ));
        }

        let desc = &mut pool.arena[id];
        desc.offset = 0;
        desc.len = hlen + seg;
        let seg_info = PacketInfo {
            ip_total_len: self.info.ip_header_len + self.info.l4_header_len + seg,
            payload_len: seg,
            tcp_seq: self.seq,
            split_required: false,
            ..self.info
        };
        transport_checksum(&pool.arena, &[id], &seg_info, ChecksumMode::Compute);

        self.seq = self.seq.wrapping_add(seg as u32);
        self.remaining -= seg;
        Ok(Some(id))
    }

    fn finish(&mut self, pool: &mut BufferPool) {
        for id in self.frame.bufs.drain(..) {
            pool.release(id, Owner::InFlight);
        }
    }
}
