//! Raw binary images

use crate::error::{Error, Result};
use crate::flash::decoder::{get_flash, FlashDecoder, FlashType, WriteStatus, MIN_SIZE};
use crate::flash::FlashBank;

use super::StreamStatus;

/// Per-stream state of a raw binary
#[derive(Debug, Clone)]
pub struct BinState {
    vector_buf: [u8; MIN_SIZE],
    buf_pos: usize,
    flash_addr: u32,
}

impl BinState {
    pub(super) const fn new() -> Self {
        Self {
            vector_buf: [0; MIN_SIZE],
            buf_pos: 0,
            flash_addr: 0,
        }
    }

    /// Buffer the vector table, then place the image at the base address of
    /// the device it was recognised for
    pub(super) fn write(
        &mut self,
        decoder: &mut FlashDecoder,
        bank: &mut FlashBank<'_>,
        mut data: &[u8],
    ) -> Result<StreamStatus> {
        if self.buf_pos < MIN_SIZE {
            let copy_size = data.len().min(MIN_SIZE - self.buf_pos);
            self.vector_buf[self.buf_pos..self.buf_pos + copy_size]
                .copy_from_slice(&data[..copy_size]);
            self.buf_pos += copy_size;
            if self.buf_pos < MIN_SIZE {
                return Ok(StreamStatus::Continue);
            }
            data = &data[copy_size..];

            let flash_type = decoder.classify(bank.board, &self.vector_buf, None);
            if flash_type == FlashType::Unknown {
                return Err(Error::FdUnsupportedUpdate);
            }
            let (start_addr, _) = get_flash(bank.board, bank.settings, flash_type, None)?;
            log::debug!("bin stream: {:?} image at 0x{:08X}", flash_type, start_addr);

            self.flash_addr = start_addr;
            if decoder.write(bank, self.flash_addr, &self.vector_buf)? == WriteStatus::Done {
                return Ok(StreamStatus::Done);
            }
            self.flash_addr += MIN_SIZE as u32;
        }

        if decoder.write(bank, self.flash_addr, data)? == WriteStatus::Done {
            return Ok(StreamStatus::Done);
        }
        self.flash_addr += data.len() as u32;

        // Any point of a binary could be its end
        Ok(StreamStatus::DoneOrContinue)
    }
}
