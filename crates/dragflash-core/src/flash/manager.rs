//! Write-block buffering in front of a [`FlashInterface`]
//!
//! [`FlashManager`] accepts byte ranges at arbitrary addresses and turns them
//! into sector erases and whole write-block programs. Data is collected in a
//! RAM buffer of one write block (the erase sector, capped at
//! [`WRITE_BUFFER_SIZE`]); the buffer is flushed whenever an incoming address
//! leaves the current block, and the sector context is re-established
//! whenever it leaves the current sector, in either direction.

use super::intf::{FlashBank, FlashInterface, FlashKind};
use crate::error::{Error, Result};

/// Largest write block the manager buffers
pub const WRITE_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    Error,
}

/// Sector-erase and page-program sequencer for one flash session
pub struct FlashManager {
    state: State,
    kind: FlashKind,
    page_erase: bool,
    buf: [u8; WRITE_BUFFER_SIZE],
    buf_empty: bool,
    current_sector_valid: bool,
    current_write_block_addr: u32,
    current_write_block_size: u32,
    current_sector_addr: u32,
    current_sector_size: u32,
    last_addr: u32,
}

fn round_down(value: u32, boundary: u32) -> u32 {
    value / boundary * boundary
}

impl FlashManager {
    /// Create a closed manager
    pub const fn new() -> Self {
        Self {
            state: State::Closed,
            kind: FlashKind::Target,
            page_erase: false,
            buf: [0xFF; WRITE_BUFFER_SIZE],
            buf_empty: true,
            current_sector_valid: false,
            current_write_block_addr: 0,
            current_write_block_size: 0,
            current_sector_addr: 0,
            current_sector_size: 0,
            last_addr: 0,
        }
    }

    /// `true` between a successful [`init`](Self::init) and [`uninit`](Self::uninit)
    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// Whether sectors are erased one by one as they are reached
    pub fn page_erase(&self) -> bool {
        self.page_erase
    }

    /// Choose between erasing per sector and erasing the chip at `init`
    ///
    /// Takes effect at the next [`init`](Self::init). Persisting the choice is
    /// up to the owner of the [`Settings`](crate::config::Settings).
    pub fn set_page_erase(&mut self, enabled: bool) {
        log::debug!("flash manager: page erase {}", enabled);
        self.page_erase = enabled;
    }

    fn reset_session(&mut self) {
        self.buf.fill(0xFF);
        self.buf_empty = true;
        self.current_sector_valid = false;
        self.current_write_block_addr = 0;
        self.current_write_block_size = 0;
        self.current_sector_addr = 0;
        self.current_sector_size = 0;
        self.last_addr = 0;
    }

    /// Open a session on the device selected by `kind`
    ///
    /// Without page erase the whole chip is erased here; if that fails the
    /// device is released again before the error is returned.
    pub fn init(&mut self, bank: &mut FlashBank<'_>, kind: FlashKind) -> Result<()> {
        log::debug!("flash manager: init {:?}", kind);
        if self.state != State::Closed {
            return Err(Error::Internal);
        }

        self.reset_session();
        self.kind = kind;

        let intf = bank.get(kind);
        intf.init()?;

        if !self.page_erase {
            if let Err(e) = intf.erase_chip() {
                log::debug!("flash manager: erase_chip failed: {}", e);
                let _ = intf.uninit();
                return Err(e);
            }
        }

        self.state = State::Open;
        Ok(())
    }

    /// Buffer `data` for programming at `addr`
    ///
    /// Any device failure moves the manager to its error state; only
    /// [`uninit`](Self::uninit) is accepted afterwards.
    pub fn data(&mut self, bank: &mut FlashBank<'_>, addr: u32, data: &[u8]) -> Result<()> {
        log::trace!("flash manager: data addr=0x{:08X} size=0x{:X}", addr, data.len());
        if self.state != State::Open {
            return Err(Error::Internal);
        }

        let intf = bank.get(self.kind);
        match self.write(intf, addr, data) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = State::Error;
                Err(e)
            }
        }
    }

    fn write(&mut self, intf: &mut dyn FlashInterface, mut addr: u32, mut data: &[u8]) -> Result<()> {
        if !self.current_sector_valid {
            self.setup_next_sector(intf, addr)?;
            self.current_sector_valid = true;
            self.last_addr = addr;
        }

        // Addresses may also jump backwards
        if round_down(addr, self.current_write_block_size)
            != round_down(self.last_addr, self.current_write_block_size)
        {
            self.flush_current_block(intf, addr)?;
        }
        if round_down(addr, self.current_sector_size)
            != round_down(self.last_addr, self.current_sector_size)
        {
            self.setup_next_sector(intf, addr)?;
        }

        loop {
            if addr >= self.current_write_block_addr + self.current_write_block_size {
                self.flush_current_block(intf, addr)?;
            }

            if data.is_empty() {
                break;
            }

            if addr >= self.current_sector_addr + self.current_sector_size {
                self.setup_next_sector(intf, addr)?;
            }

            let pos = (addr - self.current_write_block_addr) as usize;
            let size_left = self.current_write_block_size as usize - pos;
            let copy_size = data.len().min(size_left);
            self.buf[pos..pos + copy_size].copy_from_slice(&data[..copy_size]);
            self.buf_empty = copy_size == 0;

            addr += copy_size as u32;
            data = &data[copy_size..];
        }

        self.last_addr = addr;
        Ok(())
    }

    /// Flush the pending block and close the session
    ///
    /// The device is released even when the final program fails; a release
    /// failure is reported in preference to the program failure.
    pub fn uninit(&mut self, bank: &mut FlashBank<'_>) -> Result<()> {
        log::debug!("flash manager: uninit");
        if self.state == State::Closed {
            return Err(Error::Internal);
        }

        let intf = bank.get(self.kind);
        let write_result = if self.state == State::Open {
            self.flush_current_block(intf, 0)
        } else {
            Ok(())
        };
        let uninit_result = intf.uninit();

        self.reset_session();
        self.state = State::Closed;

        uninit_result.and(write_result)
    }

    fn flush_current_block(&mut self, intf: &mut dyn FlashInterface, addr: u32) -> Result<()> {
        let mut status = Ok(());
        let block_size = self.current_write_block_size as usize;
        if !self.buf_empty {
            status = intf.program_page(self.current_write_block_addr, &self.buf[..block_size]);
            log::trace!(
                "flash manager: program_page addr=0x{:08X} size=0x{:X} -> {:?}",
                self.current_write_block_addr,
                block_size,
                status
            );
            self.buf_empty = true;
        }

        self.buf[..block_size].fill(0xFF);
        if self.current_write_block_size != 0 {
            self.current_write_block_addr = round_down(addr, self.current_write_block_size);
        }
        status
    }

    fn setup_next_sector(&mut self, intf: &mut dyn FlashInterface, addr: u32) -> Result<()> {
        let min_prog_size = intf.program_page_min_size(addr);
        let sector_size = intf.erase_sector_size(addr);
        if min_prog_size == 0 || sector_size == 0 {
            return Err(Error::Internal);
        }
        let block_size = sector_size.min(WRITE_BUFFER_SIZE as u32);
        if block_size % min_prog_size != 0
            || sector_size % min_prog_size != 0
            || sector_size % block_size != 0
        {
            return Err(Error::Internal);
        }

        self.current_sector_addr = round_down(addr, sector_size);
        self.current_sector_size = sector_size;
        self.current_write_block_addr = self.current_sector_addr;
        self.current_write_block_size = block_size;

        if let Err(e) = intf.flash_algo_set(self.current_sector_addr) {
            let _ = intf.uninit();
            return Err(e);
        }

        if self.page_erase {
            if let Err(e) = intf.erase_sector(self.current_sector_addr) {
                log::debug!(
                    "flash manager: erase_sector 0x{:08X} failed: {}",
                    self.current_sector_addr,
                    e
                );
                let _ = intf.uninit();
                return Err(e);
            }
        }

        self.buf[..block_size as usize].fill(0xFF);
        log::trace!(
            "flash manager: sector 0x{:08X} size=0x{:X} block=0x{:X} min_write=0x{:X}",
            self.current_sector_addr,
            sector_size,
            block_size,
            min_prog_size
        );
        Ok(())
    }
}

impl Default for FlashManager {
    fn default() -> Self {
        Self::new()
    }
}
