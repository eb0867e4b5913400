//! A read cursor treating a chain of buffer windows as one byte stream.
//!
//! Header fields, checksum walks and segment payload copies all go through
//! [`ChainCursor`], so crossing from one page to the next is handled here only.

use crate::buffer::{BufId, BufferArena};

/// Position in a chain: index into the chain plus offset inside that buffer's window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CursorPos {
    pub(crate) buf: usize,
    pub(crate) offset: usize,
}

pub(crate) struct ChainCursor<'a> {
    arena: &'a BufferArena,
    chain: &'a [BufId],
    pos: CursorPos,
}

/// Total valid bytes across `chain`.
#[cfg(test)]
pub(crate) fn chain_len(arena: &BufferArena, chain: &[BufId]) -> usize {
    chain.iter().map(|&id| arena[id].len).sum()
}

impl<'a> ChainCursor<'a> {
    pub(crate) fn new(arena: &'a BufferArena, chain: &'a [BufId]) -> ChainCursor<'a> {
        ChainCursor::at(arena, chain, CursorPos::default())
    }

    pub(crate) fn at(arena: &'a BufferArena, chain: &'a [BufId], pos: CursorPos) -> ChainCursor<'a> {
        let mut cursor = ChainCursor { arena, chain, pos };
        cursor.normalize();
        cursor
    }

    pub(crate) fn position(&self) -> CursorPos {
        self.pos
    }

    /// Bytes left between the cursor and the end of the chain.
    #[cfg(test)]
    pub(crate) fn remaining(&self) -> usize {
        let Some(&cur) = self.chain.get(self.pos.buf) else {
            return 0;
        };
        let rest: usize = self.chain[self.pos.buf + 1..]
            .iter()
            .map(|&id| self.arena[id].len)
            .sum();
        self.arena[cur].len - self.pos.offset + rest
    }

    /// Steps over exhausted buffers so the cursor always points at a readable byte
    /// or past the end.
    fn normalize(&mut self) {
        while let Some(&id) = self.chain.get(self.pos.buf) {
            if self.pos.offset < self.arena[id].len {
                break;
            }
            self.pos.offset -= self.arena[id].len;
            self.pos.buf += 1;
        }
    }

    /// Walks up to `len` bytes, handing each contiguous piece to `f`.
    ///
    /// Returns the number of bytes walked, short only at the end of the chain.
    pub(crate) fn for_each_chunk<F>(&mut self, len: usize, mut f: F) -> usize
    where
        F: FnMut(&[u8]),
    {
        let mut left = len;
        while left > 0 {
            let Some(&id) = self.chain.get(self.pos.buf) else {
                break;
            };
            let desc = &self.arena[id];
            let take = left.min(desc.len - self.pos.offset);
            let start = desc.offset + self.pos.offset;
            {
                let page = desc.page.lock();
                f(&page[start..start + take]);
            }
            left -= take;
            self.pos.offset += take;
            self.normalize();
        }
        len - left
    }

    /// Copies into `dst`, returning how many bytes were available.
    pub(crate) fn read(&mut self, dst: &mut [u8]) -> usize {
        let mut filled = 0;
        self.for_each_chunk(dst.len(), |chunk| {
            dst[filled..filled + chunk.len()].copy_from_slice(chunk);
            filled += chunk.len();
        })
    }

    pub(crate) fn skip(&mut self, len: usize) -> usize {
        let mut left = len;
        while left > 0 {
            let Some(&id) = self.chain.get(self.pos.buf) else {
                break;
            };
            let take = left.min(self.arena[id].len - self.pos.offset);
            left -= take;
            self.pos.offset += take;
            self.normalize();
        }
        len - left
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::buffer::{BufId, BufferArena, GrantRef, Owner, Page};

    /// Builds a chain whose windows hold consecutive pieces of `data`,
    /// split at `cuts` and placed at `lead` bytes into each page.
    pub(crate) fn chain_from(
        arena: &mut BufferArena,
        data: &[u8],
        cuts: &[usize],
        lead: usize,
    ) -> Vec<BufId> {
        let mut bounds = vec![0];
        bounds.extend_from_slice(cuts);
        bounds.push(data.len());
        let mut chain = Vec::new();
        for w in bounds.windows(2) {
            let piece = &data[w[0]..w[1]];
            let page = Page::new(arena.page_size());
            page.lock()[lead..lead + piece.len()].copy_from_slice(piece);
            let id = arena.insert(page, GrantRef(chain.len() as u32), 0);
            arena.transition(id, Owner::Free, Owner::InFlight);
            arena[id].offset = lead;
            arena[id].len = piece.len();
            chain.push(id);
        }
        chain
    }
}

#[cfg(test)]
mod test {
    use super::testing::chain_from;
    use super::*;

    #[test]
    fn reads_across_buffers() {
        let mut arena = BufferArena::new(256);
        let data: Vec<u8> = (0..200u8).collect();
        let chain = chain_from(&mut arena, &data, &[7, 8, 150], 3);
        assert_eq!(chain_len(&arena, &chain), 200);

        let mut cursor = ChainCursor::new(&arena, &chain);
        assert_eq!(cursor.skip(5), 5);
        let mut buf = [0u8; 10];
        assert_eq!(cursor.read(&mut buf), 10);
        assert_eq!(buf, [5, 6, 7, 8, 9, 10, 11, 12, 13, 14]);
        assert_eq!(cursor.position(), CursorPos { buf: 2, offset: 7 });
        assert_eq!(cursor.remaining(), 185);

        let mut rest = vec![0u8; 300];
        assert_eq!(cursor.read(&mut rest), 185);
        assert_eq!(&rest[..185], &data[15..]);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn resumes_from_saved_position() {
        let mut arena = BufferArena::new(64);
        let data: Vec<u8> = (0..100u8).collect();
        let chain = chain_from(&mut arena, &data, &[40], 0);
        let mut cursor = ChainCursor::new(&arena, &chain);
        cursor.skip(40);
        let pos = cursor.position();
        assert_eq!(pos, CursorPos { buf: 1, offset: 0 });

        let mut again = ChainCursor::at(&arena, &chain, pos);
        let mut chunks = Vec::new();
        again.for_each_chunk(100, |c| chunks.push(c.len()));
        assert_eq!(chunks, vec![60]);
    }
}
