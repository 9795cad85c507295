//! Bit-level reading over a medium.
//!
//! [`MediumReader`] owns the medium and an accumulation buffer. All
//! cursor arithmetic is 64-bit bit offsets from the start of the medium.
//! Reads are transactional: a primitive either completes or fails with
//! `Again`/`End` before the cursor moves, so an interrupted `next` can
//! resume later without replaying bytes. When a field straddles two
//! medium buffers the leftover bytes are compacted into the local
//! buffer, because medium buffers are only valid until the next request.

use byteorder::{BigEndian, ByteOrder as _, LittleEndian};
use bytes::{Bytes, BytesMut};
use tracemux_runtime_core::error;
use tracemux_runtime_core::ir::ByteOrder;
use tracemux_runtime_core::Error;

use crate::medium::Medium;

/// How many bytes to ask the medium for at a time.
const REQUEST_LEN: usize = 4096;

pub struct MediumReader {
    medium: Box<dyn Medium>,
    /// Unconsumed bytes; the cursor sits `bit_pos` bits into it.
    buf: BytesMut,
    bit_pos: u64,
    /// Absolute bit offset of `buf[0]` from the start of the medium.
    buf_origin_bits: u64,
    /// Bits left to discard for an in-progress skip.
    skip_remaining: u64,
}

impl MediumReader {
    pub fn new(medium: Box<dyn Medium>) -> Self {
        MediumReader {
            medium,
            buf: BytesMut::new(),
            bit_pos: 0,
            buf_origin_bits: 0,
            skip_remaining: 0,
        }
    }

    pub fn medium(&mut self) -> &mut dyn Medium {
        self.medium.as_mut()
    }

    /// Absolute bit position of the cursor.
    pub fn cursor_bits(&self) -> u64 {
        self.buf_origin_bits + self.bit_pos
    }

    fn avail_bits(&self) -> u64 {
        self.buf.len() as u64 * 8 - self.bit_pos
    }

    /// Drops fully consumed bytes from the front of the buffer.
    fn compact(&mut self) {
        let whole_bytes = (self.bit_pos / 8) as usize;
        if whole_bytes > 0 {
            bytes::Buf::advance(&mut self.buf, whole_bytes);
            self.buf_origin_bits += whole_bytes as u64 * 8;
            self.bit_pos %= 8;
        }
    }

    /// Makes at least `bits` bits available at the cursor, requesting
    /// more bytes from the medium as needed.
    ///
    /// `Err(Again)` and `Err(End)` leave the cursor (and any bytes
    /// already buffered) untouched.
    pub fn ensure_bits(&mut self, bits: u64) -> Result<(), Error> {
        while self.avail_bits() < bits {
            // A canceled graph surfaces at the medium boundary.
            if error::is_canceled() {
                return Err(Error::Again);
            }
            self.compact();
            let (bytes, offset) = self.medium.request_bytes(REQUEST_LEN)?;
            if self.buf.is_empty() {
                // Nothing buffered: adopt the medium's position (a fresh
                // reader may start anywhere in the medium).
                debug_assert_eq!(self.bit_pos, 0);
                self.buf_origin_bits = offset * 8;
            } else {
                debug_assert_eq!(
                    offset * 8,
                    self.buf_origin_bits + self.buf.len() as u64 * 8,
                    "medium returned non-contiguous bytes"
                );
            }
            self.buf.extend_from_slice(&bytes);
        }
        Ok(())
    }

    /// Whether the medium is exhausted and nothing is buffered.
    /// Distinguishes a clean end-of-data from a truncated field.
    pub fn at_eof(&mut self) -> Result<bool, Error> {
        if self.avail_bits() > 0 {
            return Ok(false);
        }
        match self.ensure_bits(1) {
            Ok(()) => Ok(false),
            Err(Error::End) => Ok(true),
            Err(err) => Err(err),
        }
    }

    /// Reads `bits` (1 to 64) at the cursor in the given byte order.
    pub fn read_bits(&mut self, bits: u32, byte_order: ByteOrder) -> Result<u64, Error> {
        debug_assert!((1..=64).contains(&bits));
        self.ensure_bits(bits as u64)?;
        self.compact();

        let in_byte = (self.bit_pos % 8) as u32;
        let nbytes = ((in_byte + bits + 7) / 8) as usize;
        let first = (self.bit_pos / 8) as usize;
        let span = &self.buf[first..first + nbytes];

        let mask: u128 = (1u128 << bits) - 1;
        let value = match byte_order {
            ByteOrder::LittleEndian => {
                let raw = LittleEndian::read_uint128(span, nbytes);
                (raw >> in_byte) & mask
            }
            ByteOrder::BigEndian => {
                let raw = BigEndian::read_uint128(span, nbytes);
                let total = nbytes as u32 * 8;
                (raw >> (total - in_byte - bits)) & mask
            }
        };
        self.bit_pos += bits as u64;
        Ok(value as u64)
    }

    /// Reads one byte-aligned byte.
    pub fn read_byte(&mut self) -> Result<u8, Error> {
        debug_assert_eq!(self.cursor_bits() % 8, 0);
        Ok(self.read_bits(8, ByteOrder::LittleEndian)? as u8)
    }

    /// Advances the cursor to the next multiple of `alignment_bits`.
    /// Idempotent under retry: the cursor only moves once the padding is
    /// fully available.
    pub fn align_to(&mut self, alignment_bits: u64) -> Result<(), Error> {
        debug_assert!(alignment_bits >= 1);
        let cursor = self.cursor_bits();
        let padding = (alignment_bits - cursor % alignment_bits) % alignment_bits;
        if padding == 0 {
            return Ok(());
        }
        self.ensure_bits(padding)?;
        self.bit_pos += padding;
        Ok(())
    }

    /// Discards bits. `Err(Again)`/`Err(End)` keep the remaining count;
    /// call [`continue_skip`](Self::continue_skip) to finish later.
    pub fn skip_bits(&mut self, bits: u64) -> Result<(), Error> {
        self.skip_remaining += bits;
        self.continue_skip()
    }

    pub fn continue_skip(&mut self) -> Result<(), Error> {
        while self.skip_remaining > 0 {
            if self.avail_bits() == 0 {
                self.ensure_bits(1)?;
            }
            let step = self.skip_remaining.min(self.avail_bits());
            self.bit_pos += step;
            self.skip_remaining -= step;
            self.compact();
        }
        Ok(())
    }

    pub fn skip_in_progress(&self) -> bool {
        self.skip_remaining > 0
    }

    /// Abandons an in-progress skip.
    pub fn cancel_skip(&mut self) {
        self.skip_remaining = 0;
    }

    /// Repositions the reader at a byte offset, dropping buffered bytes.
    pub fn seek_byte(&mut self, offset_from_begin: u64) -> Result<(), Error> {
        self.medium.seek(offset_from_begin)?;
        self.buf.clear();
        self.bit_pos = 0;
        self.buf_origin_bits = offset_from_begin * 8;
        self.skip_remaining = 0;
        Ok(())
    }
}

/// Sign-extends an unsigned `bits`-wide value.
pub fn sign_extend(value: u64, bits: u32) -> i64 {
    if bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::{BufferMedium, BufferStep};
    use assert_matches::assert_matches;

    fn reader(data: Vec<u8>) -> MediumReader {
        MediumReader::new(Box::new(BufferMedium::new(data)))
    }

    #[test]
    fn little_endian_reads_from_lsb() {
        // 0b1101_0110: LE bit 0 is the LSB.
        let mut r = reader(vec![0b1101_0110, 0xAB]);
        assert_eq!(r.read_bits(3, ByteOrder::LittleEndian).unwrap(), 0b110);
        assert_eq!(r.read_bits(5, ByteOrder::LittleEndian).unwrap(), 0b11010);
        assert_eq!(r.read_bits(8, ByteOrder::LittleEndian).unwrap(), 0xAB);
    }

    #[test]
    fn big_endian_reads_from_msb() {
        let mut r = reader(vec![0b1101_0110, 0x12]);
        assert_eq!(r.read_bits(3, ByteOrder::BigEndian).unwrap(), 0b110);
        assert_eq!(r.read_bits(5, ByteOrder::BigEndian).unwrap(), 0b10110);
        assert_eq!(r.read_bits(8, ByteOrder::BigEndian).unwrap(), 0x12);
    }

    #[test]
    fn multi_byte_integers() {
        let mut r = reader(vec![0x34, 0x12, 0x12, 0x34]);
        assert_eq!(r.read_bits(16, ByteOrder::LittleEndian).unwrap(), 0x1234);
        assert_eq!(r.read_bits(16, ByteOrder::BigEndian).unwrap(), 0x1234);
    }

    #[test]
    fn unaligned_multi_byte_read() {
        // A 4-bit field, then a 16-bit LE value 0xBEEF, bit-packed.
        let v: u32 = (0xBEEF << 4) | 0xF;
        let bytes = v.to_le_bytes();
        let mut r = reader(bytes.to_vec());
        assert_eq!(r.read_bits(4, ByteOrder::LittleEndian).unwrap(), 0xF);
        assert_eq!(r.read_bits(16, ByteOrder::LittleEndian).unwrap(), 0xBEEF);
    }

    #[test]
    fn straddling_a_buffer_boundary_survives_again() {
        // A 32-bit value split across two buffers with a stall between.
        let mut r = MediumReader::new(Box::new(
            BufferMedium::new(vec![0x78, 0x56, 0x34, 0x12])
                .with_script([BufferStep::Give(2), BufferStep::Again]),
        ));
        assert_matches!(
            r.read_bits(32, ByteOrder::LittleEndian),
            Err(Error::Again)
        );
        // State is intact; the retry completes the read.
        assert_eq!(r.read_bits(32, ByteOrder::LittleEndian).unwrap(), 0x12345678);
        assert_eq!(r.cursor_bits(), 32);
    }

    #[test]
    fn alignment_skips_to_boundary() {
        let mut r = reader(vec![0xFF, 0x0A]);
        r.read_bits(3, ByteOrder::LittleEndian).unwrap();
        r.align_to(8).unwrap();
        assert_eq!(r.cursor_bits(), 8);
        assert_eq!(r.read_bits(8, ByteOrder::LittleEndian).unwrap(), 0x0A);
    }

    #[test]
    fn skip_resumes_across_stalls() {
        let mut r = MediumReader::new(Box::new(
            BufferMedium::new((0..32u8).collect::<Vec<u8>>())
                .with_script([BufferStep::Give(4), BufferStep::Again, BufferStep::Give(30)]),
        ));
        assert_matches!(r.skip_bits(16 * 8), Err(Error::Again));
        assert!(r.skip_in_progress());
        r.continue_skip().unwrap();
        assert_eq!(r.cursor_bits(), 16 * 8);
        assert_eq!(r.read_bits(8, ByteOrder::LittleEndian).unwrap(), 16);
    }

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend(0b111, 3), -1);
        assert_eq!(sign_extend(0b011, 3), 3);
        assert_eq!(sign_extend(0x80, 8), -128);
        assert_eq!(sign_extend(u64::MAX, 64), -1);
    }

    #[test]
    fn eof_is_clean_only_at_a_boundary() {
        let mut r = reader(vec![0xAA]);
        assert!(!r.at_eof().unwrap());
        r.read_bits(8, ByteOrder::LittleEndian).unwrap();
        assert!(r.at_eof().unwrap());
        assert_matches!(r.read_bits(8, ByteOrder::LittleEndian), Err(Error::End));
    }
}
