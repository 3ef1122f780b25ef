//! Intel HEX images

use crate::error::{Error, Result};
use crate::flash::decoder::{FlashDecoder, WriteStatus};
use crate::flash::FlashBank;

use super::intelhex::{HexParser, ParseStatus, BIN_BUFFER_SIZE};
use super::StreamStatus;

/// Per-stream state of a HEX file
#[derive(Debug, Clone)]
pub struct HexState {
    parser: HexParser,
    bin_buffer: [u8; BIN_BUFFER_SIZE],
}

impl From<WriteStatus> for StreamStatus {
    fn from(status: WriteStatus) -> Self {
        match status {
            WriteStatus::Continue => StreamStatus::Continue,
            WriteStatus::Done => StreamStatus::Done,
        }
    }
}

impl HexState {
    pub(super) const fn new() -> Self {
        Self {
            parser: HexParser::new(),
            bin_buffer: [0xFF; BIN_BUFFER_SIZE],
        }
    }

    /// Decode `data` block by block and pass every block to the decoder
    pub(super) fn write(
        &mut self,
        decoder: &mut FlashDecoder,
        bank: &mut FlashBank<'_>,
        mut data: &[u8],
    ) -> Result<StreamStatus> {
        loop {
            let out = self.parser.parse(data, &mut self.bin_buffer);
            let block = &self.bin_buffer[..out.bin_len];

            match out.status {
                ParseStatus::Ok => {
                    if block.is_empty() {
                        return Ok(StreamStatus::Continue);
                    }
                    return Ok(decoder.write(bank, out.bin_addr, block)?.into());
                }
                ParseStatus::Unaligned => {
                    if !block.is_empty()
                        && decoder.write(bank, out.bin_addr, block)? == WriteStatus::Done
                    {
                        return Ok(StreamStatus::Done);
                    }
                    data = &data[out.consumed..];
                }
                ParseStatus::Eof => {
                    if !block.is_empty() {
                        decoder.write(bank, out.bin_addr, block)?;
                    }
                    return Ok(StreamStatus::Done);
                }
                ParseStatus::ChecksumFail => {
                    log::warn!("hex stream: checksum mismatch");
                    return Err(Error::HexCksum);
                }
                ParseStatus::LineOverrun => return Err(Error::HexParser),
            }
        }
    }

    pub(super) fn reset(&mut self) {
        self.parser.reset();
        self.bin_buffer.fill(0xFF);
    }
}
