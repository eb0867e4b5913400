//! Folds ring responses into one in-progress frame.
//!
//! Each accepted response buffer is placed against the tail of the frame:
//!
//! 1. no tail yet, or the tail page is full: the buffer becomes the new tail;
//! 2. the tail has room for the whole segment: it is copied over and the
//!    source buffer goes back to the freelist;
//! 3. the tail has some room: it is filled up to the page end and the rest of
//!    the segment is moved to the start of its own page, which becomes the tail.
//!
//! Frames therefore carry as few, as full pages as the backend allows.

use crate::buffer::{BufId, Owner};
use crate::freelist::BufferPool;
use crate::ring::{ExtraInfo, RxResponse, EXTRA_TYPE_GSO, GSO_TYPE_TCPV4};
use crate::ring::{RX_FLAG_CSUM_BLANK, RX_FLAG_DATA_VALIDATED, RX_FLAG_EXTRA_INFO, RX_FLAG_MORE_DATA};

/// Accumulated buffers and flags of one not yet complete frame.
#[derive(Debug, Default)]
pub(crate) struct Frame {
    pub(crate) bufs: Vec<BufId>,
    pub(crate) more_fragments: bool,
    pub(crate) extra_pending: bool,
    pub(crate) csum_blank: bool,
    pub(crate) data_validated: bool,
    pub(crate) mss: u16,
    /// Bytes received so far.
    pub(crate) len: usize,
    /// Some response of this frame broke the protocol; the frame is dropped once complete.
    pub(crate) errored: bool,
    pub(crate) started: bool,
}

impl Frame {
    fn complete(&self) -> bool {
        !self.more_fragments && !self.extra_pending
    }
}

#[derive(Default)]
pub(crate) struct Reassembler {
    frame: Frame,
}

impl Reassembler {
    /// Whether the next response slot holds an extra-info record.
    pub(crate) fn expects_extra(&self) -> bool {
        self.frame.extra_pending
    }

    pub(crate) fn in_progress(&self) -> bool {
        self.frame.started
    }

    fn begin(&mut self, rsp: &RxResponse) {
        if !self.frame.started {
            self.frame.started = true;
            self.frame.csum_blank = rsp.has(RX_FLAG_CSUM_BLANK);
            self.frame.data_validated = rsp.has(RX_FLAG_DATA_VALIDATED);
        }
        self.frame.more_fragments = rsp.has(RX_FLAG_MORE_DATA);
        self.frame.extra_pending = rsp.has(RX_FLAG_EXTRA_INFO);
    }

    fn finish(&mut self) -> Option<Frame> {
        if self.frame.complete() {
            Some(std::mem::take(&mut self.frame))
        } else {
            None
        }
    }

    /// Adds an accepted data buffer whose window already describes the
    /// response. Returns the frame if this response completed it.
    pub(crate) fn push_data(&mut self, pool: &mut BufferPool, id: BufId, rsp: &RxResponse) -> Option<Frame> {
        self.begin(rsp);
        self.frame.len += pool.arena[id].len;
        self.place(pool, id);
        self.finish()
    }

    /// Records a response that was rejected; its buffer is already back on the freelist.
    pub(crate) fn push_violation(&mut self, rsp: &RxResponse) -> Option<Frame> {
        self.begin(rsp);
        self.frame.errored = true;
        self.finish()
    }

    pub(crate) fn push_extra(&mut self, info: &ExtraInfo) -> Option<Frame> {
        match info.kind {
            EXTRA_TYPE_GSO if info.gso_type == GSO_TYPE_TCPV4 => {
                self.frame.mss = info.gso_size;
            }
            EXTRA_TYPE_GSO => {
                log::warn!("unsupported gso type {}", info.gso_type);
            }
            kind => {
                log::warn!("unknown extra info type {kind}");
            }
        }
        self.frame.extra_pending = info.more();
        self.finish()
    }

    pub(crate) fn buffers(&self) -> &[BufId] {
        &self.frame.bufs
    }

    /// Hands back the partial frame, leaving the reassembler idle.
    pub(crate) fn take(&mut self) -> Frame {
        std::mem::take(&mut self.frame)
    }

    fn place(&mut self, pool: &mut BufferPool, id: BufId) {
        let page_size = pool.page_size();
        let Some(&tail) = self.frame.bufs.last() else {
            self.frame.bufs.push(id);
            return;
        };
        let room = page_size - pool.arena[tail].end();
        if room == 0 {
            self.frame.bufs.push(id);
            return;
        }

        let seg_len = pool.arena[id].len;
        let take = room.min(seg_len);
        {
            let dst = &pool.arena[tail];
            let src = &pool.arena[id];
            let mut dst_page = dst.page.lock();
            let src_page = src.page.lock();
            dst_page[dst.end()..dst.end() + take]
                .copy_from_slice(&src_page[src.offset..src.offset + take]);
        }
        pool.arena[tail].len += take;

        if take == seg_len {
            pool.release(id, Owner::InFlight);
            return;
        }
        let src = &mut pool.arena[id];
        let rest = src.offset + take..src.end();
        src.page.lock().copy_within(rest, 0);
        src.offset = 0;
        src.len = seg_len - take;
        self.frame.bufs.push(id);
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::buffer::testing::CountingGrants;
    use crate::cursor::{chain_len, ChainCursor};
    use crate::header::testing::tcp_frame;

    fn pool() -> BufferPool {
        BufferPool::new(1024, 4, 16, Arc::new(CountingGrants::default()))
    }

    /// Puts `data` into a fresh in-flight buffer at `offset`, as the backend would.
    fn received(pool: &mut BufferPool, data: &[u8], offset: usize) -> BufId {
        let id = pool.allocate(Owner::InFlight).unwrap();
        let desc = &mut pool.arena[id];
        desc.page.lock()[offset..offset + data.len()].copy_from_slice(data);
        desc.offset = offset;
        desc.len = data.len();
        id
    }

    fn rsp(flags: u16, len: usize) -> RxResponse {
        RxResponse {
            id: 0,
            offset: 0,
            flags,
            status: len as i16,
        }
    }

    fn collect(pool: &BufferPool, frame: &Frame) -> Vec<u8> {
        let mut out = vec![0u8; chain_len(&pool.arena, &frame.bufs)];
        ChainCursor::new(&pool.arena, &frame.bufs).read(&mut out);
        out
    }

    #[test]
    fn folds_into_tail() {
        let mut pool = pool();
        let mut r = Reassembler::default();
        let data = tcp_frame(2000, 5, 0);

        // 600 at offset 0, then 300 fits entirely, then 700 fits partially
        let a = received(&mut pool, &data[..600], 0);
        assert!(r.push_data(&mut pool, a, &rsp(RX_FLAG_MORE_DATA | RX_FLAG_CSUM_BLANK, 600)).is_none());
        let b = received(&mut pool, &data[600..900], 100);
        assert!(r.push_data(&mut pool, b, &rsp(RX_FLAG_MORE_DATA, 300)).is_none());
        assert_eq!(pool.arena.owner(b), Some(Owner::Free));
        let c = received(&mut pool, &data[900..1600], 200);
        assert!(r.push_data(&mut pool, c, &rsp(RX_FLAG_MORE_DATA, 700)).is_none());
        assert_eq!(pool.arena[a].len, 1024);
        assert_eq!(pool.arena[c].offset, 0);
        assert_eq!(pool.arena[c].len, 1600 - 1024);
        // 454 more: 448 top up `c`, the last 6 bytes move to the front of `d`
        let d = received(&mut pool, &data[1600..], 50);
        let frame = r.push_data(&mut pool, d, &rsp(0, data.len() - 1600)).unwrap();

        assert_eq!(frame.bufs, vec![a, c, d]);
        assert_eq!(pool.arena[c].len, 1024);
        assert_eq!(pool.arena[d].offset, 0);
        assert_eq!(pool.arena[d].len, 6);
        assert!(frame.csum_blank);
        assert!(!frame.data_validated);
        assert_eq!(frame.len, data.len());
        assert_eq!(frame.len, 14 + 2040);
        assert_eq!(collect(&pool, &frame), data);
        assert!(!r.in_progress());
    }

    #[test]
    fn extra_info_carries_mss() {
        let mut pool = pool();
        let mut r = Reassembler::default();
        let data = tcp_frame(100, 0, 0);
        let a = received(&mut pool, &data, 0);
        assert!(r
            .push_data(&mut pool, a, &rsp(RX_FLAG_EXTRA_INFO | RX_FLAG_DATA_VALIDATED, data.len()))
            .is_none());
        assert!(r.expects_extra());

        let mut more = ExtraInfo::gso_tcpv4(1460);
        more.flags = crate::ring::EXTRA_FLAG_MORE;
        assert!(r.push_extra(&more).is_none());
        let unknown = ExtraInfo {
            kind: 9,
            ..Default::default()
        };
        let frame = r.push_extra(&unknown).unwrap();
        assert_eq!(frame.mss, 1460);
        assert!(frame.data_validated);
        assert_eq!(frame.bufs, vec![a]);
    }

    #[test]
    fn violation_poisons_frame() {
        let mut pool = pool();
        let mut r = Reassembler::default();
        let data = tcp_frame(100, 0, 0);
        let a = received(&mut pool, &data, 0);
        assert!(r.push_data(&mut pool, a, &rsp(RX_FLAG_MORE_DATA, data.len())).is_none());
        assert!(r.push_violation(&rsp(RX_FLAG_MORE_DATA, 0)).is_none());
        let b = received(&mut pool, &data[..10], 0);
        let frame = r.push_data(&mut pool, b, &rsp(0, 10)).unwrap();
        assert!(frame.errored);
    }

    #[test]
    fn full_tail_takes_new_buffer() {
        let mut pool = pool();
        let mut r = Reassembler::default();
        let data = vec![0x5au8; 1300];
        let a = received(&mut pool, &data[..1024], 0);
        assert!(r.push_data(&mut pool, a, &rsp(RX_FLAG_MORE_DATA, 1024)).is_none());
        let b = received(&mut pool, &data[1024..], 30);
        let frame = r.push_data(&mut pool, b, &rsp(0, 276)).unwrap();
        assert_eq!(frame.bufs, vec![a, b]);
        assert_eq!(pool.arena[b].offset, 30);
        assert_eq!(frame.len, 1300);
    }
}
