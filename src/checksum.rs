//! Internet checksums over flat slices and over buffer chains.

use byteorder::{BigEndian, ByteOrder};

use crate::buffer::{BufId, BufferArena};
use crate::cursor::ChainCursor;
use crate::header::{
    PacketInfo, ETH_HEADER_LEN, IPV4_CSUM_OFFSET, IPV4_DST_OFFSET, IPV4_SRC_OFFSET,
    TCP_CSUM_OFFSET, UDP_CSUM_OFFSET,
};

/// Calculates a checksum accumulator over a byte slice without the final fold.
///
/// The input is summed as big-endian u32 words into a u64; a trailing odd
/// byte counts as the high byte of a 16-bit word (RFC 1071).
pub fn checksum_no_fold(mut b: &[u8], initial: u64) -> u64 {
    let mut accumulator = initial;
    while b.len() >= 4 {
        accumulator += BigEndian::read_u32(&b[0..4]) as u64;
        b = &b[4..];
    }
    if b.len() >= 2 {
        accumulator += BigEndian::read_u16(&b[0..2]) as u64;
        b = &b[2..];
    }
    if let Some(&byte) = b.first() {
        accumulator += (byte as u64) << 8;
    }
    accumulator
}

/// Folds a 64-bit accumulator down to 16 bits.
pub fn fold(mut accumulator: u64) -> u16 {
    while accumulator > 0xFFFF {
        accumulator = (accumulator >> 16) + (accumulator & 0xFFFF);
    }
    accumulator as u16
}

/// Folded (not complemented) checksum of `b`.
pub fn checksum(b: &[u8], initial: u64) -> u16 {
    fold(checksum_no_fold(b, initial))
}

/// Checksum accumulator for a TCP/UDP pseudo-header.
pub fn pseudo_header_checksum_no_fold(
    protocol: u8,
    src_addr: &[u8],
    dst_addr: &[u8],
    total_len: u16,
) -> u64 {
    let sum = checksum_no_fold(src_addr, 0);
    let sum = checksum_no_fold(dst_addr, sum);
    let len_bytes = total_len.to_be_bytes();
    checksum_no_fold(&[0, protocol, len_bytes[0], len_bytes[1]], sum)
}

/// IPv4 header checksum, computed as if the checksum field were zero.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let sum = checksum_no_fold(&header[..IPV4_CSUM_OFFSET], 0);
    let sum = checksum_no_fold(&header[IPV4_CSUM_OFFSET + 2..], sum);
    !fold(sum)
}

/// Running sum over a stream delivered in arbitrary pieces.
///
/// A piece of odd length leaves its last byte pending; it becomes the high
/// byte of the word completed by the next piece.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainSum {
    accumulator: u64,
    odd: Option<u8>,
}

impl ChainSum {
    pub fn new(initial: u64) -> ChainSum {
        ChainSum {
            accumulator: initial,
            odd: None,
        }
    }

    pub fn add(&mut self, mut b: &[u8]) {
        if let Some(high) = self.odd.take() {
            let Some((&low, rest)) = b.split_first() else {
                self.odd = Some(high);
                return;
            };
            self.accumulator += u16::from_be_bytes([high, low]) as u64;
            b = rest;
        }
        let even = b.len() & !1;
        self.accumulator = checksum_no_fold(&b[..even], self.accumulator);
        if even < b.len() {
            self.odd = Some(b[even]);
        }
    }

    pub fn finish(self) -> u64 {
        match self.odd {
            Some(high) => self.accumulator + ((high as u64) << 8),
            None => self.accumulator,
        }
    }
}

/// What [`transport_checksum`] does with the sum it computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    /// Write the result into the checksum field.
    Compute,
    /// Compare the result with the checksum field as delivered.
    Verify,
}

/// TCP or UDP checksum over a frame spread across `chain`.
///
/// The headers described by `info` must sit in the first buffer. In
/// [`ChecksumMode::Verify`] the return value is the verdict; in
/// [`ChecksumMode::Compute`] it is `false` only if the chain is shorter than
/// the IP total length says.
pub(crate) fn transport_checksum(
    arena: &BufferArena,
    chain: &[BufId],
    info: &PacketInfo,
    mode: ChecksumMode,
) -> bool {
    let Some(&first) = chain.first() else {
        return false;
    };
    let field = info.l4_offset()
        + if info.is_tcp() {
            TCP_CSUM_OFFSET
        } else {
            UDP_CSUM_OFFSET
        };
    let l4_len = info.l4_len();

    let pseudo = {
        let desc = &arena[first];
        let page = desc.page.lock();
        let ip = &page[desc.offset + ETH_HEADER_LEN..];
        pseudo_header_checksum_no_fold(
            info.protocol,
            &ip[IPV4_SRC_OFFSET..IPV4_SRC_OFFSET + 4],
            &ip[IPV4_DST_OFFSET..IPV4_DST_OFFSET + 4],
            l4_len as u16,
        )
    };

    let mut sum = ChainSum::new(pseudo);
    let mut cursor = ChainCursor::new(arena, chain);
    if cursor.skip(info.l4_offset()) != info.l4_offset() {
        return false;
    }
    let before = field - info.l4_offset();
    let after = l4_len - before - 2;
    let mut delivered = [0u8; 2];
    let walked = cursor.for_each_chunk(before, |c| sum.add(c))
        + cursor.read(&mut delivered)
        + cursor.for_each_chunk(after, |c| sum.add(c));
    if walked != l4_len {
        return false;
    }
    let mut result = !fold(sum.finish());

    match mode {
        ChecksumMode::Compute => {
            if info.is_udp() && result == 0 {
                result = 0xFFFF;
            }
            let desc = &arena[first];
            let mut page = desc.page.lock();
            BigEndian::write_u16(&mut page[desc.offset + field..desc.offset + field + 2], result);
            true
        }
        ChecksumMode::Verify => {
            let delivered = u16::from_be_bytes(delivered);
            // UDP over IPv4 may leave the checksum out
            (info.is_udp() && delivered == 0) || delivered == result
        }
    }
}
