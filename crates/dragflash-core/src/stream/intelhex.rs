//! Resumable Intel HEX decoder
//!
//! The input arrives in disk sectors, so a record may be split at any byte.
//! [`HexParser`] keeps the partially decoded line between calls and returns
//! contiguous blocks of binary data together with their load address.

/// Size of the binary staging buffer filled by [`HexParser::parse`]
pub const BIN_BUFFER_SIZE: usize = 256;

/// Byte count, address, type, 32 data bytes and checksum
const LINE_SIZE: usize = 0x25;
const MAX_DATA_BYTES: usize = LINE_SIZE - 5;

const DATA_RECORD: u8 = 0;
const EOF_RECORD: u8 = 1;
const EXT_SEG_ADDR_RECORD: u8 = 2;
const EXT_LINEAR_ADDR_RECORD: u8 = 4;

/// Why [`HexParser::parse`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// All input was consumed
    Ok,
    /// An end-of-file record was decoded
    Eof,
    /// The block ended because the next data is not contiguous with it;
    /// call again with the remaining input
    Unaligned,
    /// A record failed its checksum
    ChecksumFail,
    /// A record announced more data bytes than a line can hold
    LineOverrun,
}

/// Result of one [`HexParser::parse`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOutput {
    /// Why parsing stopped
    pub status: ParseStatus,
    /// Input bytes consumed
    pub consumed: usize,
    /// Load address of the first byte in the staging buffer
    pub bin_addr: u32,
    /// Decoded bytes in the staging buffer
    pub bin_len: usize,
}

fn ctoh(c: u8) -> u8 {
    if c & 0x10 != 0 {
        c & 0xF
    } else {
        (c & 0xF) + 9
    }
}

/// Incremental Intel HEX record decoder
#[derive(Debug, Clone)]
pub struct HexParser {
    line: [u8; LINE_SIZE],
    next_address: u32,
    low_nibble: bool,
    idx: usize,
    record_processed: bool,
    load_unaligned: bool,
}

impl HexParser {
    /// Create a parser positioned before the first record
    pub const fn new() -> Self {
        Self {
            line: [0; LINE_SIZE],
            next_address: 0,
            low_nibble: false,
            idx: 0,
            record_processed: false,
            load_unaligned: false,
        }
    }

    /// Forget all state, including the extended address
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn byte_count(&self) -> usize {
        self.line[0] as usize
    }

    fn record_address(&self) -> u32 {
        u32::from(u16::from_be_bytes([self.line[1], self.line[2]]))
    }

    fn record_data(&self) -> &[u8] {
        &self.line[4..4 + self.byte_count()]
    }

    fn checksum_ok(&self) -> bool {
        self.line[..self.byte_count() + 5]
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b))
            == 0
    }

    fn record_start(&self) -> u32 {
        (self.next_address & 0xFFFF_0000) | self.record_address()
    }

    /// Decode as much of `input` as fits into one contiguous block
    ///
    /// The unused tail of `bin` is filled with `0xFF`.
    pub fn parse(&mut self, input: &[u8], bin: &mut [u8; BIN_BUFFER_SIZE]) -> ParseOutput {
        let mut len = 0;

        // A record held back by the previous call goes first
        if self.load_unaligned {
            self.load_unaligned = false;
            let count = self.byte_count();
            bin[..count].copy_from_slice(self.record_data());
            len = count;
            self.next_address = self.record_start().wrapping_add(count as u32);
        }

        let mut new_base = None;
        let mut pos = 0;
        let status = loop {
            let Some(&c) = input.get(pos) else {
                break ParseStatus::Ok;
            };
            pos += 1;

            match c {
                b'\r' | b'\n' => continue,
                b':' => {
                    self.line.fill(0);
                    self.low_nibble = false;
                    self.idx = 0;
                    self.record_processed = false;
                    continue;
                }
                _ => {}
            }

            if !self.low_nibble {
                if let Some(b) = self.line.get_mut(self.idx) {
                    *b = ctoh(c) << 4;
                }
                self.low_nibble = true;
                continue;
            }
            self.low_nibble = false;

            if let Some(b) = self.line.get_mut(self.idx) {
                *b |= ctoh(c) & 0xF;
            }
            self.idx += 1;

            if self.idx == 1 && self.byte_count() > MAX_DATA_BYTES {
                break ParseStatus::LineOverrun;
            }
            if self.record_processed || self.idx < self.byte_count() + 5 {
                continue;
            }

            if !self.checksum_ok() {
                break ParseStatus::ChecksumFail;
            }
            self.record_processed = true;

            let data = self.record_data();
            match self.line[3] {
                DATA_RECORD => {
                    let start = self.record_start();
                    let count = data.len();
                    if start != self.next_address || len + count > bin.len() {
                        self.load_unaligned = true;
                        break ParseStatus::Unaligned;
                    }
                    bin[len..len + count].copy_from_slice(data);
                    len += count;
                    self.next_address = start.wrapping_add(count as u32);
                }
                EOF_RECORD => break ParseStatus::Eof,
                EXT_SEG_ADDR_RECORD if data.len() >= 2 => {
                    new_base = Some(u32::from(data[0]) << 12 | u32::from(data[1]) << 4);
                    break ParseStatus::Unaligned;
                }
                EXT_LINEAR_ADDR_RECORD if data.len() >= 2 => {
                    new_base = Some(u32::from(data[0]) << 24 | u32::from(data[1]) << 16);
                    break ParseStatus::Unaligned;
                }
                // Start address records do not affect the image
                _ => {}
            }
        };

        bin[len..].fill(0xFF);
        let bin_addr = self.next_address.wrapping_sub(len as u32);
        if let Some(base) = new_base {
            self.next_address = base;
        }

        ParseOutput {
            status,
            consumed: pos,
            bin_addr,
            bin_len: len,
        }
    }
}

impl Default for HexParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &[u8] = b":020000040800F2\r\n\
:10000000000102030405060708090A0B0C0D0E0F78\r\n\
:10001000101112131415161718191A1B1C1D1E1F68\r\n\
:00000001FF\r\n";

    fn expected(range: core::ops::Range<u8>) -> std::vec::Vec<u8> {
        range.collect()
    }

    #[test]
    fn test_extended_linear_address() {
        let mut parser = HexParser::new();
        let mut bin = [0u8; BIN_BUFFER_SIZE];

        let out = parser.parse(HEX, &mut bin);
        assert_eq!(out.status, ParseStatus::Unaligned);
        assert_eq!(out.bin_len, 0);
        assert_eq!(out.consumed, 15);

        let out = parser.parse(&HEX[15..], &mut bin);
        assert_eq!(out.status, ParseStatus::Eof);
        assert_eq!(out.bin_addr, 0x0800_0000);
        assert_eq!(out.bin_len, 32);
        assert_eq!(&bin[..32], &expected(0..32)[..]);
        assert!(bin[32..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_split_at_every_byte() {
        let mut parser = HexParser::new();
        let mut bin = [0u8; BIN_BUFFER_SIZE];
        let mut decoded = std::vec::Vec::new();
        let mut eof = false;

        for i in 0..HEX.len() {
            let mut chunk = &HEX[i..i + 1];
            loop {
                let out = parser.parse(chunk, &mut bin);
                if out.bin_len > 0 {
                    assert_eq!(out.bin_addr, 0x0800_0000 + decoded.len() as u32);
                    decoded.extend_from_slice(&bin[..out.bin_len]);
                }
                match out.status {
                    ParseStatus::Ok => break,
                    ParseStatus::Unaligned => chunk = &chunk[out.consumed..],
                    ParseStatus::Eof => {
                        eof = true;
                        break;
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
        }

        assert!(eof);
        assert_eq!(decoded, expected(0..32));
    }

    #[test]
    fn test_gap_splits_block() {
        let hex = b":0400000001020304F2\r\n:04010000AABBCCDDED\r\n";
        let mut parser = HexParser::new();
        let mut bin = [0u8; BIN_BUFFER_SIZE];

        let out = parser.parse(hex, &mut bin);
        assert_eq!(out.status, ParseStatus::Unaligned);
        assert_eq!(out.bin_addr, 0);
        assert_eq!(&bin[..out.bin_len], &[1, 2, 3, 4]);

        let out = parser.parse(&hex[out.consumed..], &mut bin);
        assert_eq!(out.status, ParseStatus::Ok);
        assert_eq!(out.bin_addr, 0x100);
        assert_eq!(&bin[..out.bin_len], &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn test_checksum_failure() {
        let mut parser = HexParser::new();
        let mut bin = [0u8; BIN_BUFFER_SIZE];
        let out = parser.parse(b":0400000001020304F3\r\n", &mut bin);
        assert_eq!(out.status, ParseStatus::ChecksumFail);
        assert_eq!(out.bin_len, 0);
    }

    #[test]
    fn test_line_overrun() {
        let mut parser = HexParser::new();
        let mut bin = [0u8; BIN_BUFFER_SIZE];
        let out = parser.parse(b":2100000000", &mut bin);
        assert_eq!(out.status, ParseStatus::LineOverrun);
    }

    #[test]
    fn test_extended_segment_address() {
        let hex = b":020000021000EC\r\n:0200000055AAFF\r\n";
        let mut parser = HexParser::new();
        let mut bin = [0u8; BIN_BUFFER_SIZE];
        let out = parser.parse(hex, &mut bin);
        assert_eq!(out.status, ParseStatus::Unaligned);
        let out = parser.parse(&hex[out.consumed..], &mut bin);
        assert_eq!(out.status, ParseStatus::Ok);
        assert_eq!(out.bin_addr, 0x1_0000);
        assert_eq!(&bin[..out.bin_len], &[0x55, 0xAA]);
    }
}
