//! Compact RFC 1951 decoder with bit-accurate resume.
//!
//! Unlike a whole-stream inflater, this decoder can start at an arbitrary
//! bit offset with a caller-supplied 32 KiB dictionary and can report the
//! exact bit position after each block. That is what makes checkpoint-based
//! random access possible: the scanner records (bit offset, dictionary)
//! pairs and any thread can later resume decoding from one of them.
//!
//! Errors are `io::Error` with `InvalidData`/`UnexpectedEof` kinds; callers
//! wrap them into the crate error type with block context attached.

use std::io::{self, Write};

/// Deflate sliding-window size.
pub const WINDOW_SIZE: usize = 32 * 1024;

/// Longest back-reference match length.
const MAX_MATCH: usize = 258;

const MAX_CODE_LEN: usize = 15;
const LOOKUP_BITS: usize = 9;

// RFC 1951 section 3.2.5 length/distance tables.
const LENGTH_BASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131,
    163, 195, 227, 258,
];
const LENGTH_EXTRA_BITS: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];
const DISTANCE_BASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];
const DISTANCE_EXTRA_BITS: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];
// Order in which code-length code lengths are stored (RFC 1951 3.2.7).
const CODELEN_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

fn bad_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn short_input() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "deflate stream truncated")
}

/// LSB-first bit cursor over a byte slice.
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    bit_pos: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::at(data, 0, 0)
    }

    /// Start mid-stream at (byte, bit-within-byte).
    pub fn at(data: &'a [u8], byte_pos: usize, bit_pos: u8) -> Self {
        debug_assert!(bit_pos < 8);
        Self {
            data,
            byte_pos,
            bit_pos,
        }
    }

    #[inline]
    pub fn read_bit(&mut self) -> io::Result<u32> {
        if self.byte_pos >= self.data.len() {
            return Err(short_input());
        }
        let bit = (self.data[self.byte_pos] >> self.bit_pos) & 1;
        self.bit_pos += 1;
        if self.bit_pos == 8 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }
        Ok(bit as u32)
    }

    /// Read `n` bits, LSB first. `n` must be at most 32.
    #[inline]
    pub fn read_bits(&mut self, n: u32) -> io::Result<u32> {
        let mut value = 0u32;
        for i in 0..n {
            value |= self.read_bit()? << i;
        }
        Ok(value)
    }

    /// Look ahead `n` bits without consuming them. Bits past the end of the
    /// input read as zero, so the caller can still probe near stream end.
    #[inline]
    pub fn peek_bits(&self, n: u32) -> u32 {
        let mut value = 0u32;
        let mut byte_pos = self.byte_pos;
        let mut bit_pos = self.bit_pos;
        for i in 0..n {
            if byte_pos >= self.data.len() {
                break;
            }
            value |= (((self.data[byte_pos] >> bit_pos) & 1) as u32) << i;
            bit_pos += 1;
            if bit_pos == 8 {
                bit_pos = 0;
                byte_pos += 1;
            }
        }
        value
    }

    #[inline]
    pub fn skip_bits(&mut self, n: u32) {
        let total = self.byte_pos * 8 + self.bit_pos as usize + n as usize;
        self.byte_pos = total / 8;
        self.bit_pos = (total % 8) as u8;
    }

    /// Discard bits up to the next byte boundary.
    pub fn align_to_byte(&mut self) {
        if self.bit_pos != 0 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }
    }

    pub fn read_byte(&mut self) -> io::Result<u8> {
        debug_assert_eq!(self.bit_pos, 0);
        let b = *self.data.get(self.byte_pos).ok_or_else(short_input)?;
        self.byte_pos += 1;
        Ok(b)
    }

    pub fn read_u16_le(&mut self) -> io::Result<u16> {
        let lo = self.read_byte()? as u16;
        let hi = self.read_byte()? as u16;
        Ok(hi << 8 | lo)
    }

    /// Absolute position in bits from the start of the slice.
    #[inline]
    pub fn bit_position(&self) -> u64 {
        self.byte_pos as u64 * 8 + self.bit_pos as u64
    }

    #[inline]
    fn bytes_remaining(&self) -> usize {
        self.data.len().saturating_sub(self.byte_pos)
    }
}

/// Canonical Huffman decoding table with a direct-lookup fast path.
///
/// `count`/`symbols` follow the classic two-array canonical layout; the
/// 9-bit lookup table resolves short codes in one probe and falls back to
/// the bit-serial walk for longer ones.
pub struct Huffman {
    count: [u16; MAX_CODE_LEN + 1],
    symbols: Vec<u16>,
    lookup: Vec<(u16, u8)>,
}

impl Huffman {
    /// Build a table from per-symbol code lengths (0 = unused symbol).
    ///
    /// Over-subscribed length sets are rejected; incomplete sets (including
    /// the degenerate single-code distance tables zlib emits) are accepted.
    pub fn from_lengths(lengths: &[u16]) -> io::Result<Self> {
        let mut count = [0u16; MAX_CODE_LEN + 1];
        for &len in lengths {
            if len as usize > MAX_CODE_LEN {
                return Err(bad_data("huffman code length exceeds 15"));
            }
            count[len as usize] += 1;
        }
        count[0] = 0;

        // Kraft inequality check.
        let mut left: i32 = 1;
        for len in 1..=MAX_CODE_LEN {
            left <<= 1;
            left -= count[len] as i32;
            if left < 0 {
                return Err(bad_data("over-subscribed huffman code"));
            }
        }

        // Symbols sorted by (length, symbol) give the canonical ordering.
        let mut offsets = [0u16; MAX_CODE_LEN + 2];
        for len in 1..=MAX_CODE_LEN {
            offsets[len + 1] = offsets[len] + count[len];
        }
        let total = offsets[MAX_CODE_LEN + 1] as usize;
        let mut symbols = vec![0u16; total];
        let mut next = offsets;
        for (symbol, &len) in lengths.iter().enumerate() {
            if len != 0 {
                symbols[next[len as usize] as usize] = symbol as u16;
                next[len as usize] += 1;
            }
        }

        // Direct lookup table for codes of at most LOOKUP_BITS bits. Deflate
        // codes arrive LSB first, so the index is the bit-reversed code
        // padded with every possible suffix.
        let mut lookup = vec![(0u16, 0u8); 1 << LOOKUP_BITS];
        let mut code = 0u32;
        let mut index = 0usize;
        for len in 1..=MAX_CODE_LEN {
            for _ in 0..count[len] {
                if len <= LOOKUP_BITS {
                    let reversed = reverse_bits(code, len as u32);
                    let step = 1usize << len;
                    let mut slot = reversed as usize;
                    while slot < lookup.len() {
                        lookup[slot] = (symbols[index], len as u8);
                        slot += step;
                    }
                }
                code += 1;
                index += 1;
            }
            code <<= 1;
        }

        Ok(Self {
            count,
            symbols,
            lookup,
        })
    }

    fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Decode one symbol.
    #[inline]
    pub fn decode(&self, reader: &mut BitReader<'_>) -> io::Result<u16> {
        // The fast path peeks LOOKUP_BITS at once, which only pads zeros
        // safely when enough real input remains.
        if reader.bytes_remaining() >= 2 {
            let probe = reader.peek_bits(LOOKUP_BITS as u32);
            let (symbol, len) = self.lookup[probe as usize];
            if len != 0 {
                reader.skip_bits(len as u32);
                return Ok(symbol);
            }
        }
        self.decode_serial(reader)
    }

    // One bit at a time over the canonical arrays; handles codes longer than
    // the lookup width and the tail of the input.
    fn decode_serial(&self, reader: &mut BitReader<'_>) -> io::Result<u16> {
        let mut code = 0u32;
        let mut first = 0u32;
        let mut index = 0u32;
        for len in 1..=MAX_CODE_LEN {
            code |= reader.read_bit()?;
            let count = self.count[len] as u32;
            if code < first + count {
                return Ok(self.symbols[(index + (code - first)) as usize]);
            }
            index += count;
            first = (first + count) << 1;
            code <<= 1;
        }
        Err(bad_data("invalid huffman code"))
    }
}

#[inline]
fn reverse_bits(value: u32, bits: u32) -> u32 {
    let mut result = 0;
    for i in 0..bits {
        result |= ((value >> i) & 1) << (bits - 1 - i);
    }
    result
}

fn fixed_litlen_table() -> Huffman {
    let mut lengths = [0u16; 288];
    for (i, len) in lengths.iter_mut().enumerate() {
        *len = match i {
            0..=143 => 8,
            144..=255 => 9,
            256..=279 => 7,
            _ => 8,
        };
    }
    Huffman::from_lengths(&lengths).expect("fixed litlen table is well-formed")
}

fn fixed_distance_table() -> Huffman {
    Huffman::from_lengths(&[5u16; 30]).expect("fixed distance table is well-formed")
}

/// The deflate 32 KiB history window, kept circularly.
pub struct SlidingWindow {
    buf: Vec<u8>,
    pos: usize,
    total: u64,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; WINDOW_SIZE],
            pos: 0,
            total: 0,
        }
    }

    /// Seed the window with up to 32 KiB of prior output, e.g. a checkpoint
    /// dictionary. Longer inputs keep only the most recent window's worth.
    pub fn from_dictionary(dict: &[u8]) -> Self {
        let mut window = Self::new();
        let tail = if dict.len() > WINDOW_SIZE {
            &dict[dict.len() - WINDOW_SIZE..]
        } else {
            dict
        };
        for &b in tail {
            window.push_byte(b);
        }
        window
    }

    #[inline]
    fn push_byte(&mut self, b: u8) {
        self.buf[self.pos] = b;
        self.pos = (self.pos + 1) % WINDOW_SIZE;
        self.total += 1;
    }

    pub fn push<W: Write>(&mut self, b: u8, out: &mut W) -> io::Result<()> {
        out.write_all(&[b])?;
        self.push_byte(b);
        Ok(())
    }

    /// Copy a `length`-byte match from `distance` bytes back, emitting to
    /// `out` while refreshing the window. Overlapping copies (distance <
    /// length) repeat bytes as deflate requires.
    pub fn copy_match<W: Write>(
        &mut self,
        distance: usize,
        length: usize,
        out: &mut W,
    ) -> io::Result<()> {
        let available = self.total.min(WINDOW_SIZE as u64) as usize;
        if distance == 0 || distance > available {
            return Err(bad_data("back-reference distance exceeds history"));
        }
        debug_assert!(length <= MAX_MATCH);
        let mut scratch = [0u8; MAX_MATCH];
        let mut src = (self.pos + WINDOW_SIZE - distance) % WINDOW_SIZE;
        for slot in scratch.iter_mut().take(length) {
            let b = self.buf[src];
            *slot = b;
            src = (src + 1) % WINDOW_SIZE;
            self.push_byte(b);
        }
        out.write_all(&scratch[..length])
    }

    /// The window contents in stream order, for use as a resume dictionary.
    pub fn dictionary(&self) -> Vec<u8> {
        if self.total >= WINDOW_SIZE as u64 {
            let mut dict = Vec::with_capacity(WINDOW_SIZE);
            dict.extend_from_slice(&self.buf[self.pos..]);
            dict.extend_from_slice(&self.buf[..self.pos]);
            dict
        } else {
            self.buf[..self.total as usize].to_vec()
        }
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Block-at-a-time deflate decoder over an in-memory compressed slice.
pub struct Inflater<'a> {
    reader: BitReader<'a>,
    window: SlidingWindow,
}

impl<'a> Inflater<'a> {
    /// Position the decoder at `bit_offset` bits into `data`, with `dict` as
    /// the pre-existing history (empty at a member start).
    pub fn new(data: &'a [u8], bit_offset: u64, dict: &[u8]) -> Self {
        Self {
            reader: BitReader::at(data, (bit_offset / 8) as usize, (bit_offset % 8) as u8),
            window: SlidingWindow::from_dictionary(dict),
        }
    }

    /// Decode exactly one deflate block into `out`.
    ///
    /// Returns `true` when the block carried the BFINAL flag, i.e. the
    /// member's deflate stream ends at `bit_position()`.
    pub fn next_block<W: Write>(&mut self, out: &mut W) -> io::Result<bool> {
        let bfinal = self.reader.read_bit()? == 1;
        let btype = self.reader.read_bits(2)?;
        match btype {
            0 => self.stored_block(out)?,
            1 => {
                let litlen = fixed_litlen_table();
                let distance = fixed_distance_table();
                self.compressed_block(&litlen, &distance, out)?;
            }
            2 => {
                let (litlen, distance) = self.read_dynamic_tables()?;
                self.compressed_block(&litlen, &distance, out)?;
            }
            _ => return Err(bad_data("reserved deflate block type")),
        }
        Ok(bfinal)
    }

    fn stored_block<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        self.reader.align_to_byte();
        let len = self.reader.read_u16_le()?;
        let nlen = self.reader.read_u16_le()?;
        if len != !nlen {
            return Err(bad_data("stored block length check failed"));
        }
        for _ in 0..len {
            let b = self.reader.read_byte()?;
            self.window.push(b, out)?;
        }
        Ok(())
    }

    fn read_dynamic_tables(&mut self) -> io::Result<(Huffman, Huffman)> {
        let hlit = self.reader.read_bits(5)? as usize + 257;
        let hdist = self.reader.read_bits(5)? as usize + 1;
        let hclen = self.reader.read_bits(4)? as usize + 4;
        if hlit > 286 || hdist > 30 {
            return Err(bad_data("dynamic block table sizes out of range"));
        }

        let mut codelen_lengths = [0u16; 19];
        for &slot in CODELEN_ORDER.iter().take(hclen) {
            codelen_lengths[slot] = self.reader.read_bits(3)? as u16;
        }
        let codelen_table = Huffman::from_lengths(&codelen_lengths)?;

        let mut lengths = vec![0u16; hlit + hdist];
        let mut filled = 0usize;
        while filled < lengths.len() {
            let symbol = codelen_table.decode(&mut self.reader)?;
            match symbol {
                0..=15 => {
                    lengths[filled] = symbol;
                    filled += 1;
                }
                16 => {
                    if filled == 0 {
                        return Err(bad_data("length repeat with no previous length"));
                    }
                    let prev = lengths[filled - 1];
                    let repeat = self.reader.read_bits(2)? as usize + 3;
                    if filled + repeat > lengths.len() {
                        return Err(bad_data("length repeat overflows table"));
                    }
                    for slot in &mut lengths[filled..filled + repeat] {
                        *slot = prev;
                    }
                    filled += repeat;
                }
                17 | 18 => {
                    let repeat = if symbol == 17 {
                        self.reader.read_bits(3)? as usize + 3
                    } else {
                        self.reader.read_bits(7)? as usize + 11
                    };
                    if filled + repeat > lengths.len() {
                        return Err(bad_data("zero-length repeat overflows table"));
                    }
                    filled += repeat;
                }
                _ => return Err(bad_data("invalid code-length symbol")),
            }
        }

        if lengths[256] == 0 {
            return Err(bad_data("dynamic block lacks an end-of-block code"));
        }

        let litlen = Huffman::from_lengths(&lengths[..hlit])?;
        let distance = Huffman::from_lengths(&lengths[hlit..])?;
        Ok((litlen, distance))
    }

    fn compressed_block<W: Write>(
        &mut self,
        litlen: &Huffman,
        distance: &Huffman,
        out: &mut W,
    ) -> io::Result<()> {
        loop {
            let symbol = litlen.decode(&mut self.reader)?;
            match symbol {
                0..=255 => {
                    self.window.push(symbol as u8, out)?;
                }
                256 => return Ok(()),
                257..=285 => {
                    let idx = symbol as usize - 257;
                    let length = LENGTH_BASE[idx] as usize
                        + self.reader.read_bits(LENGTH_EXTRA_BITS[idx] as u32)? as usize;

                    if distance.is_empty() {
                        return Err(bad_data("match emitted with empty distance table"));
                    }
                    let dist_symbol = distance.decode(&mut self.reader)? as usize;
                    if dist_symbol >= 30 {
                        return Err(bad_data("invalid distance symbol"));
                    }
                    let dist = DISTANCE_BASE[dist_symbol] as usize
                        + self.reader.read_bits(DISTANCE_EXTRA_BITS[dist_symbol] as u32)? as usize;

                    self.window.copy_match(dist, length, out)?;
                }
                _ => return Err(bad_data("invalid literal/length symbol")),
            }
        }
    }

    /// Bits consumed so far, absolute from the start of the input slice.
    pub fn bit_position(&self) -> u64 {
        self.reader.bit_position()
    }

    /// Snapshot of the current window in stream order.
    pub fn dictionary(&self) -> Vec<u8> {
        self.window.dictionary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;

    fn deflate(payload: &[u8], level: Compression) -> Vec<u8> {
        let mut enc = DeflateEncoder::new(Vec::new(), level);
        enc.write_all(payload).unwrap();
        enc.finish().unwrap()
    }

    fn inflate_all(data: &[u8]) -> Vec<u8> {
        let mut inflater = Inflater::new(data, 0, &[]);
        let mut out = Vec::new();
        while !inflater.next_block(&mut out).unwrap() {}
        out
    }

    #[test]
    fn bit_reader_lsb_order() {
        let mut reader = BitReader::new(&[0b1011_0100, 0xff]);
        assert_eq!(reader.read_bits(3).unwrap(), 0b100);
        assert_eq!(reader.read_bits(5).unwrap(), 0b10110);
        assert_eq!(reader.bit_position(), 8);
        assert_eq!(reader.read_bits(4).unwrap(), 0b1111);
    }

    #[test]
    fn peek_does_not_consume() {
        let reader = BitReader::new(&[0b0000_0101]);
        assert_eq!(reader.peek_bits(3), 0b101);
        assert_eq!(reader.peek_bits(3), 0b101);
    }

    #[test]
    fn peek_past_end_pads_zeros() {
        let mut reader = BitReader::new(&[0xff]);
        reader.skip_bits(6);
        assert_eq!(reader.peek_bits(9), 0b11);
    }

    #[test]
    fn stored_block_round_trip() {
        let data = deflate(b"stored payload", Compression::none());
        assert_eq!(inflate_all(&data), b"stored payload");
    }

    #[test]
    fn compressed_round_trip() {
        let payload: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let data = deflate(&payload, Compression::default());
        assert_eq!(inflate_all(&data), payload);
    }

    #[test]
    fn best_compression_round_trip() {
        let payload = b"abcabcabcabc the quick brown fox ".repeat(4000);
        let data = deflate(&payload, Compression::best());
        assert_eq!(inflate_all(&data), payload);
    }

    #[test]
    fn resume_from_dictionary_matches_straight_decode() {
        let payload = b"ABCDEFGH".repeat(50_000);
        let data = deflate(&payload, Compression::default());

        // Decode the first block, snapshot the resume state.
        let mut first = Inflater::new(&data, 0, &[]);
        let mut head = Vec::new();
        let finished = first.next_block(&mut head).unwrap();
        assert!(!finished, "payload should span multiple blocks");
        let bit = first.bit_position();
        let dict = first.dictionary();

        // A fresh inflater seeded from the snapshot must produce the rest.
        let mut resumed = Inflater::new(&data, bit, &dict);
        let mut tail = Vec::new();
        while !resumed.next_block(&mut tail).unwrap() {}

        let mut combined = head;
        combined.extend_from_slice(&tail);
        assert_eq!(combined, payload);
    }

    #[test]
    fn window_dictionary_is_most_recent_32k() {
        let mut window = SlidingWindow::new();
        let mut sink = Vec::new();
        for i in 0..(WINDOW_SIZE + 100) {
            window.push((i % 251) as u8, &mut sink).unwrap();
        }
        let dict = window.dictionary();
        assert_eq!(dict.len(), WINDOW_SIZE);
        assert_eq!(dict, sink[sink.len() - WINDOW_SIZE..]);
    }

    #[test]
    fn overlapping_match_repeats_bytes() {
        let mut window = SlidingWindow::new();
        let mut out = Vec::new();
        window.push(b'x', &mut out).unwrap();
        window.copy_match(1, 5, &mut out).unwrap();
        assert_eq!(out, b"xxxxxx");
    }

    #[test]
    fn distance_beyond_history_rejected() {
        let mut window = SlidingWindow::from_dictionary(b"abc");
        let mut out = Vec::new();
        assert!(window.copy_match(4, 1, &mut out).is_err());
    }

    #[test]
    fn over_subscribed_table_rejected() {
        assert!(Huffman::from_lengths(&[1, 1, 1]).is_err());
    }

    #[test]
    fn truncated_stream_is_unexpected_eof() {
        let data = deflate(&b"some compressible payload ".repeat(100), Compression::default());
        let mut inflater = Inflater::new(&data[..data.len() / 2], 0, &[]);
        let mut out = Vec::new();
        let err = loop {
            match inflater.next_block(&mut out) {
                Ok(true) => panic!("truncated stream decoded to completion"),
                Ok(false) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
