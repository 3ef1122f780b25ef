//! Guarded self-update of the HIC's own flash
//!
//! [`ProtectedIapFlash`] wraps the raw in-application-programming primitives
//! of the HIC ([`IapBackend`]) and refuses anything that could brick it:
//! writes into the running image, gaps between pages or sectors, programs
//! into sectors that were not erased first.
//!
//! When the interface firmware replaces the bootloader, the first sector of
//! the update is held back. While the update is in flight that sector holds
//! a copy of the interface vector table, so an interrupted update still
//! boots the interface. The real first sector is written last, and only if
//! the CRC-32 of the image matches the value stored in its last four bytes.

use crc::{Crc, Digest, CRC_32_ISO_HDLC};

use super::intf::FlashInterface;
use crate::config::{BoardConfig, DaplinkMode, RomRegion};
use crate::error::{Error, Result};

/// Largest HIC flash sector that can be held back
pub const MAX_SECTOR_SIZE: usize = 0x4000;

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Raw flash primitives of the HIC's own flash
pub trait IapBackend {
    /// Prepare the flash controller
    fn init(&mut self) -> Result<()>;
    /// Release the flash controller
    fn uninit(&mut self) -> Result<()>;
    /// Erase one sector
    fn erase_sector(&mut self, addr: u32) -> Result<()>;
    /// Program `data` at `addr`
    fn program_page(&mut self, addr: u32, data: &[u8]) -> Result<()>;
    /// Read back flash contents
    fn read(&self, addr: u32, buf: &mut [u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    Error,
}

/// [`FlashInterface`] over the HIC's own flash with update protection
pub struct ProtectedIapFlash<B> {
    backend: B,
    mode: DaplinkMode,
    app: RomRegion,
    update: RomRegion,
    interface_start: u32,
    sector_size: u32,
    min_write_size: u32,

    state: State,
    update_complete: bool,
    mass_erase_performed: bool,
    current_sector: Option<u32>,
    current_page: Option<(u32, u32)>,
    crc: Digest<'static, u32>,
    sector_buf: [u8; MAX_SECTOR_SIZE],
}

impl<B: IapBackend> ProtectedIapFlash<B> {
    /// Wrap `backend` using the ROM layout of `board`
    pub fn new(board: &BoardConfig, backend: B) -> Self {
        Self {
            backend,
            mode: board.mode,
            app: board.app_region(),
            update: board.update_region(),
            interface_start: board.interface.start,
            sector_size: board.iap_sector_size,
            min_write_size: board.iap_min_write_size,
            state: State::Closed,
            update_complete: false,
            mass_erase_performed: false,
            current_sector: None,
            current_page: None,
            crc: CRC32.digest(),
            sector_buf: [0; MAX_SECTOR_SIZE],
        }
    }

    /// The wrapped primitives
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the wrapped primitives
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// `true` once the last page of the update region has been written
    pub fn update_complete(&self) -> bool {
        self.update_complete
    }

    fn fail(&mut self, e: Error) -> Error {
        self.state = State::Error;
        e
    }

    fn page_program_allowed(&self, addr: u32, size: u32) -> bool {
        !(addr < self.app.end() && addr + size > self.app.start)
    }

    fn sector_erase_allowed(&self, addr: u32) -> bool {
        !self.app.contains(addr)
    }

    /// `None` when the write is not intercepted and should go to flash
    fn intercept_page_write(&mut self, addr: u32, data: &[u8]) -> Option<Result<()>> {
        let updt_start = self.update.start;
        let updt_end = self.update.end();
        if addr < updt_start || addr >= updt_end {
            return Some(Err(Error::IapOutOfBounds));
        }
        if self.mode != DaplinkMode::Interface {
            return None;
        }

        let crc_size = data.len().min((updt_end - addr).saturating_sub(4) as usize);
        self.crc.update(&data[..crc_size]);

        if addr < updt_start + self.sector_size {
            let offset = (addr - updt_start) as usize;
            self.sector_buf[offset..offset + data.len()].copy_from_slice(data);
            return Some(Ok(()));
        }

        if addr + data.len() as u32 == updt_end {
            let n = data.len();
            // The stored CRC must arrive in one piece
            if n < 4 {
                return Some(Err(Error::Internal));
            }
            let crc_in_image = u32::from_le_bytes([data[n - 4], data[n - 3], data[n - 2], data[n - 1]]);
            let crc = core::mem::replace(&mut self.crc, CRC32.digest()).finalize();
            if crc != crc_in_image {
                log::warn!(
                    "iap: image crc 0x{:08X} does not match computed 0x{:08X}",
                    crc_in_image,
                    crc
                );
                return Some(Err(Error::BlUpdtBadCrc));
            }

            if self.backend.program_page(addr, data).is_err() {
                return Some(Err(Error::IapWrite));
            }

            let sector_len = self.sector_size as usize;
            let status = critical_erase_and_program(
                &mut self.backend,
                self.min_write_size,
                updt_start,
                &self.sector_buf[..sector_len],
            );
            self.update_complete = true;
            return Some(status);
        }

        None
    }

    fn intercept_sector_erase(&mut self, addr: u32) -> Option<Result<()>> {
        if addr < self.update.start || addr >= self.update.end() {
            return Some(Err(Error::IapOutOfBounds));
        }
        if self.mode != DaplinkMode::Interface {
            return None;
        }

        if addr == self.update.start {
            // Park the interface vector table in the update's first sector.
            // sector_buf is still unused at this point of the update.
            let len = (self.min_write_size as usize).min(MAX_SECTOR_SIZE);
            self.backend.read(self.interface_start, &mut self.sector_buf[..len]);
            let status = critical_erase_and_program(
                &mut self.backend,
                self.min_write_size,
                addr,
                &self.sector_buf[..len],
            );
            self.sector_buf[..len].fill(0);
            return Some(status);
        }

        None
    }
}

fn critical_erase_and_program<B: IapBackend>(
    backend: &mut B,
    min_write_size: u32,
    addr: u32,
    data: &[u8],
) -> Result<()> {
    if data.len() < min_write_size as usize {
        return Err(Error::Internal);
    }
    log::debug!("iap: critical erase and program at 0x{:08X}", addr);
    // Between these two calls the HIC cannot boot
    backend.erase_sector(addr).map_err(|_| Error::EraseAll)?;
    backend.program_page(addr, data).map_err(|_| Error::IapWrite)
}

impl<B: IapBackend> FlashInterface for ProtectedIapFlash<B> {
    fn init(&mut self) -> Result<()> {
        if self.state != State::Closed {
            return Err(Error::Internal);
        }
        if self.sector_size == 0
            || self.min_write_size == 0
            || self.sector_size % self.min_write_size != 0
        {
            return Err(Error::Internal);
        }
        if self.update.size == 0 || self.sector_size as usize > MAX_SECTOR_SIZE {
            return Err(Error::IapUpdtNotSupported);
        }
        self.backend.init().map_err(|_| Error::IapInit)?;

        self.update_complete = false;
        self.mass_erase_performed = false;
        self.current_sector = None;
        self.current_page = None;
        self.crc = CRC32.digest();
        self.sector_buf.fill(0);
        self.state = State::Open;
        log::debug!(
            "iap: open, update region 0x{:08X}..0x{:08X}",
            self.update.start,
            self.update.end()
        );
        Ok(())
    }

    fn uninit(&mut self) -> Result<()> {
        if self.state == State::Closed {
            return Err(Error::Internal);
        }
        self.state = State::Closed;
        self.backend.uninit().map_err(|_| Error::IapUninit)?;

        // The end of a third-party application is unknown, so only the
        // interface treats an early end as a failure.
        if !self.update_complete && self.mode != DaplinkMode::Bootloader {
            return Err(Error::IapUpdtIncomplete);
        }
        Ok(())
    }

    fn program_page(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if self.state != State::Open {
            return Err(Error::Internal);
        }

        let size = data.len() as u32;
        let min_prog_size = self.min_write_size;
        let sector_size = self.sector_size;

        if addr % min_prog_size != 0
            || size < min_prog_size
            || size % min_prog_size != 0
            || (addr % sector_size) + size > sector_size
        {
            return Err(self.fail(Error::Internal));
        }

        if !self.mass_erase_performed {
            let in_sector = self
                .current_sector
                .is_some_and(|s| addr >= s && addr < s + sector_size);
            if !in_sector {
                return Err(self.fail(Error::Internal));
            }
        }

        if let Some((page, len)) = self.current_page {
            if addr != page + len {
                return Err(self.fail(Error::Internal));
            }
        }

        if !self.page_program_allowed(addr, size) {
            return Err(self.fail(Error::IapWrite));
        }

        self.current_page = Some((addr, size));
        if let Some(status) = self.intercept_page_write(addr, data) {
            return status.map_err(|e| self.fail(e));
        }

        if self.backend.program_page(addr, data).is_err() {
            return Err(self.fail(Error::IapWrite));
        }

        if addr + size >= self.update.end() {
            self.update_complete = true;
        }
        Ok(())
    }

    fn erase_sector(&mut self, addr: u32) -> Result<()> {
        if self.state != State::Open {
            return Err(Error::Internal);
        }

        let sector_size = self.sector_size;
        if addr % sector_size != 0 {
            return Err(self.fail(Error::Internal));
        }
        if let Some(current) = self.current_sector {
            if addr != current + sector_size {
                return Err(self.fail(Error::Internal));
            }
        }
        if !self.sector_erase_allowed(addr) {
            return Err(self.fail(Error::IapEraseSector));
        }

        self.current_sector = Some(addr);
        if let Some(status) = self.intercept_sector_erase(addr) {
            return status.map_err(|e| self.fail(e));
        }

        if self.backend.erase_sector(addr).is_err() {
            return Err(self.fail(Error::IapEraseSector));
        }
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<()> {
        if self.state != State::Open {
            return Err(Error::Internal);
        }
        if self.mass_erase_performed {
            return Err(self.fail(Error::Internal));
        }

        let mut addr = self.update.start;
        while addr < self.update.end() {
            if self.erase_sector(addr).is_err() {
                return Err(self.fail(Error::IapEraseAll));
            }
            addr += self.sector_size;
        }

        self.mass_erase_performed = true;
        Ok(())
    }

    fn program_page_min_size(&self, _addr: u32) -> u32 {
        self.min_write_size
    }

    fn erase_sector_size(&self, _addr: u32) -> u32 {
        self.sector_size
    }
}
