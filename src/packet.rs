use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::buffer::{BufId, BufferArena, Owner, Page};
use crate::freelist::BufferPool;

/// Checksum verdicts attached to a received packet.
///
/// Only set for protocols whose receive checksum offload is enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChecksumInfo {
    pub tcp_succeeded: bool,
    pub tcp_failed: bool,
    pub udp_succeeded: bool,
    pub udp_failed: bool,
}

impl ChecksumInfo {
    pub fn is_empty(&self) -> bool {
        *self == ChecksumInfo::default()
    }
}

struct Segment {
    id: BufId,
    page: Page,
    offset: usize,
    len: usize,
}

/// A received packet handed to the host stack.
///
/// The packet borrows its pages from the receive path; hand it back through
/// [`crate::RxContext::return_packet`] once done so the pages can be reposted.
pub struct RxPacket {
    segments: Vec<Segment>,
    checksum: ChecksumInfo,
}

impl RxPacket {
    fn new() -> RxPacket {
        RxPacket {
            segments: Vec::with_capacity(4),
            checksum: ChecksumInfo::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pages the packet spans.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn checksum_info(&self) -> ChecksumInfo {
        self.checksum
    }

    /// Copies the packet into `buf`, returning the bytes written.
    pub fn copy_to(&self, buf: &mut [u8]) -> usize {
        let mut written = 0;
        for seg in &self.segments {
            let n = seg.len.min(buf.len() - written);
            let page = seg.page.lock();
            buf[written..written + n].copy_from_slice(&page[seg.offset..seg.offset + n]);
            written += n;
            if written == buf.len() {
                break;
            }
        }
        written
    }

    /// The packet contents as one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        for seg in &self.segments {
            buf.extend_from_slice(&seg.page.lock()[seg.offset..seg.offset + seg.len]);
        }
        buf.freeze()
    }

    pub(crate) fn set_checksum(&mut self, info: ChecksumInfo) {
        self.checksum = info;
    }

    fn attach(&mut self, arena: &BufferArena, id: BufId) {
        let desc = &arena[id];
        self.segments.push(Segment {
            id,
            page: desc.page.clone(),
            offset: desc.offset,
            len: desc.len,
        });
    }
}

impl fmt::Debug for RxPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxPacket")
            .field("len", &self.len())
            .field("segments", &self.segments.len())
            .field("checksum", &self.checksum)
            .finish()
    }
}

/// Reusable packet wrappers and the count of packets the host still holds.
pub(crate) struct PacketPool {
    free: Vec<RxPacket>,
    capacity: usize,
    outstanding: usize,
    /// Buffers attached to outstanding packets.
    held: usize,
}

impl PacketPool {
    pub(crate) fn new(capacity: usize) -> PacketPool {
        PacketPool {
            free: Vec::with_capacity(capacity),
            capacity,
            outstanding: 0,
            held: 0,
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn held_buffers(&self) -> usize {
        self.held
    }

    /// Appends `id` to `packet` with the window it has right now.
    pub(crate) fn attach(&mut self, packet: &mut RxPacket, arena: &BufferArena, id: BufId) {
        packet.attach(arena, id);
        self.held += 1;
    }

    pub(crate) fn acquire(&mut self) -> RxPacket {
        self.outstanding += 1;
        self.free.pop().unwrap_or_else(RxPacket::new)
    }

    /// Takes a packet back from the host: its pages go to the freelist and
    /// the wrapper back to the pool. Returns the remaining outstanding count.
    pub(crate) fn recycle(&mut self, pool: &mut BufferPool, mut packet: RxPacket) -> usize {
        for seg in packet.segments.drain(..) {
            pool.release(seg.id, Owner::InFlight);
            self.held = self.held.saturating_sub(1);
        }
        packet.checksum = ChecksumInfo::default();
        if self.free.len() < self.capacity {
            self.free.push(packet);
        }
        match self.outstanding.checked_sub(1) {
            Some(n) => self.outstanding = n,
            None => crate::error::defect(format_args!("packet returned that was never handed out")),
        }
        self.outstanding
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::buffer::testing::CountingGrants;

    #[test]
    fn recycle_returns_pages_and_bounds_pool() {
        let mut pool = BufferPool::new(512, 4, 16, Arc::new(CountingGrants::default()));
        let mut packets = PacketPool::new(1);

        let mut a = packets.acquire();
        let mut b = packets.acquire();
        for packet in [&mut a, &mut b] {
            let id = pool.allocate(Owner::InFlight).unwrap();
            pool.arena[id].page.lock()[10..13].copy_from_slice(b"abc");
            pool.arena[id].offset = 10;
            pool.arena[id].len = 3;
            packets.attach(packet, &pool.arena, id);
            packet.set_checksum(ChecksumInfo {
                udp_succeeded: true,
                ..Default::default()
            });
        }
        assert_eq!(a.to_bytes(), Bytes::from_static(b"abc"));
        let mut two = [0u8; 2];
        assert_eq!(a.copy_to(&mut two), 2);
        assert_eq!(&two, b"ab");
        assert_eq!(packets.outstanding(), 2);
        assert_eq!(packets.held_buffers(), 2);

        assert_eq!(packets.recycle(&mut pool, a), 1);
        assert_eq!(packets.recycle(&mut pool, b), 0);
        assert_eq!(packets.pooled(), 1);
        assert_eq!(packets.held_buffers(), 0);
        assert_eq!(pool.census().free, 2);
        assert_eq!(pool.census().in_flight, 0);

        let again = packets.acquire();
        assert!(again.checksum_info().is_empty());
        assert!(again.is_empty());
    }
}
