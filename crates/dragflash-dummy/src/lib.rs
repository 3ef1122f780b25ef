//! dragflash-dummy - In-memory flash emulators for testing
//!
//! This crate provides a target flash ([`DummyFlash`]) and a HIC flash
//! backend ([`DummyIap`]) that live in memory. They are useful for running
//! the drag-and-drop pipeline without hardware, and can be told to fail
//! specific operations.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::vec;
#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use dragflash_core::config::{BoardConfig, TargetConfig};
use dragflash_core::error::{Error, Result};
use dragflash_core::flash::{FlashInterface, IapBackend};

/// Geometry of a dummy flash
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Address of the first byte
    pub base: u32,
    /// Flash size in bytes
    pub size: usize,
    /// Minimum program size
    pub page_size: u32,
    /// Erase sector size
    pub sector_size: u32,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            base: 0,
            size: 256 * 1024,
            page_size: 256,
            sector_size: 4096,
        }
    }
}

impl DummyConfig {
    /// Geometry covering the default flash region of `target`
    pub fn from_target(target: &TargetConfig) -> Self {
        let mut config = Self::default();
        if let Some(region) = target.default_flash_region() {
            config.base = region.start;
            config.size = (region.end - region.start) as usize;
        }
        config
    }
}

/// One recorded flash operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DummyOp {
    /// `init`
    Init,
    /// `uninit`
    Uninit,
    /// `program_page`
    Program {
        /// Start address
        addr: u32,
        /// Byte count
        len: usize,
    },
    /// `erase_sector`
    EraseSector(u32),
    /// `erase_chip`
    EraseChip,
}

/// Operations to fail on purpose
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Fail `init`
    pub init: bool,
    /// Fail `erase_chip`
    pub erase_chip: bool,
    /// Fail `erase_sector` at this address
    pub erase_sector_at: Option<u32>,
    /// Fail `program_page` at this address
    pub program_at: Option<u32>,
}

/// Dummy target flash
///
/// Emulates NOR semantics (programming only clears bits) and rejects any
/// call that breaks the [`FlashInterface`] program contract.
#[cfg(feature = "alloc")]
pub struct DummyFlash {
    config: DummyConfig,
    data: Vec<u8>,
    ops: Vec<DummyOp>,
    faults: Faults,
    open: bool,
}

#[cfg(feature = "alloc")]
impl DummyFlash {
    /// Create an erased flash with the given geometry
    pub fn new(config: DummyConfig) -> Self {
        let data = vec![0xFF; config.size];
        Self {
            config,
            data,
            ops: Vec::new(),
            faults: Faults::default(),
            open: false,
        }
    }

    /// Create a flash matching the target of `board`
    pub fn for_board(board: &BoardConfig) -> Self {
        Self::new(DummyConfig::from_target(&board.target))
    }

    /// Get the configuration
    pub fn config(&self) -> &DummyConfig {
        &self.config
    }

    /// Get a reference to the flash data
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Every operation so far, oldest first
    pub fn ops(&self) -> &[DummyOp] {
        &self.ops
    }

    /// Forget recorded operations
    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    /// Set up failures
    pub fn faults_mut(&mut self) -> &mut Faults {
        &mut self.faults
    }

    /// Bytes written by programming, i.e. up to the last non-erased byte
    pub fn used(&self) -> &[u8] {
        let end = self.data.iter().rposition(|&b| b != 0xFF).map_or(0, |i| i + 1);
        &self.data[..end]
    }

    fn offset(&self, addr: u32, len: usize) -> Result<usize> {
        let offset = addr.checked_sub(self.config.base).ok_or(Error::Internal)? as usize;
        if offset + len > self.data.len() {
            return Err(Error::Internal);
        }
        Ok(offset)
    }
}

#[cfg(feature = "alloc")]
impl FlashInterface for DummyFlash {
    fn init(&mut self) -> Result<()> {
        self.ops.push(DummyOp::Init);
        if self.faults.init {
            return Err(Error::Init);
        }
        self.open = true;
        Ok(())
    }

    fn uninit(&mut self) -> Result<()> {
        self.ops.push(DummyOp::Uninit);
        self.open = false;
        Ok(())
    }

    fn program_page(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.ops.push(DummyOp::Program {
            addr,
            len: data.len(),
        });
        if !self.open {
            return Err(Error::Internal);
        }
        if self.faults.program_at == Some(addr) {
            log::debug!("dummy: failing program at 0x{:08X}", addr);
            return Err(Error::Write);
        }

        let len = data.len() as u32;
        let page = self.config.page_size;
        let sector = self.config.sector_size;
        if len == 0 || addr % page != 0 || len % page != 0 || addr / sector != (addr + len - 1) / sector
        {
            log::warn!("dummy: program 0x{:08X}+0x{:X} breaks the contract", addr, len);
            return Err(Error::Internal);
        }

        let offset = self.offset(addr, data.len())?;
        // Flash programming: can only change 1 -> 0
        for (d, s) in self.data[offset..offset + data.len()].iter_mut().zip(data) {
            *d &= *s;
        }
        Ok(())
    }

    fn erase_sector(&mut self, addr: u32) -> Result<()> {
        self.ops.push(DummyOp::EraseSector(addr));
        if self.faults.erase_sector_at == Some(addr) {
            return Err(Error::EraseSector);
        }
        if addr % self.config.sector_size != 0 {
            return Err(Error::Internal);
        }
        let size = self.config.sector_size as usize;
        let offset = self.offset(addr, size)?;
        self.data[offset..offset + size].fill(0xFF);
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<()> {
        self.ops.push(DummyOp::EraseChip);
        if self.faults.erase_chip {
            return Err(Error::EraseAll);
        }
        self.data.fill(0xFF);
        Ok(())
    }

    fn program_page_min_size(&self, _addr: u32) -> u32 {
        self.config.page_size
    }

    fn erase_sector_size(&self, _addr: u32) -> u32 {
        self.config.sector_size
    }
}

/// Dummy HIC flash, wrapped by `ProtectedIapFlash`
///
/// Covers the HIC's whole ROM from address 0 up to the end of the
/// interface image.
#[cfg(feature = "alloc")]
pub struct DummyIap {
    data: Vec<u8>,
    sector_size: u32,
    erases: Vec<u32>,
}

#[cfg(feature = "alloc")]
impl DummyIap {
    /// Erased HIC flash laid out like `board`
    pub fn for_board(board: &BoardConfig) -> Self {
        let size = board.interface.end().max(board.bootloader.end()) as usize;
        Self {
            data: vec![0xFF; size],
            sector_size: board.iap_sector_size,
            erases: Vec::new(),
        }
    }

    /// Get a reference to the flash data
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get a mutable reference to the flash data
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Addresses of every sector erase
    pub fn erases(&self) -> &[u32] {
        &self.erases
    }

    fn range(&self, addr: u32, len: usize) -> Result<core::ops::Range<usize>> {
        let start = addr as usize;
        if start + len > self.data.len() {
            return Err(Error::IapOutOfBounds);
        }
        Ok(start..start + len)
    }
}

#[cfg(feature = "alloc")]
impl IapBackend for DummyIap {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn uninit(&mut self) -> Result<()> {
        Ok(())
    }

    fn erase_sector(&mut self, addr: u32) -> Result<()> {
        let range = self.range(addr, self.sector_size as usize)?;
        self.erases.push(addr);
        self.data[range].fill(0xFF);
        Ok(())
    }

    fn program_page(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let range = self.range(addr, data.len())?;
        for (d, s) in self.data[range].iter_mut().zip(data) {
            *d &= *s;
        }
        Ok(())
    }

    fn read(&self, addr: u32, buf: &mut [u8]) {
        if let Ok(range) = self.range(addr, buf.len()) {
            buf.copy_from_slice(&self.data[range]);
        } else {
            buf.fill(0xFF);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dragflash_core::config::{Settings, VfsTimings};
    use dragflash_core::stream::{StreamStatus, StreamType};
    use dragflash_core::{FirmwareUpdatePipeline, ProtectedIapFlash, SyncState};

    fn small() -> DummyFlash {
        DummyFlash::new(DummyConfig {
            base: 0x1000_0000,
            size: 0x4000,
            page_size: 0x100,
            sector_size: 0x1000,
        })
    }

    #[test]
    fn test_program_and_erase() {
        let mut flash = small();
        flash.init().unwrap();
        flash.program_page(0x1000_0100, &[0x12; 0x100]).unwrap();
        // Programming only clears bits
        flash.program_page(0x1000_0100, &[0xF0; 0x100]).unwrap();
        assert_eq!(flash.data()[0x100], 0x10);
        assert_eq!(flash.used().len(), 0x200);

        flash.erase_sector(0x1000_0000).unwrap();
        assert!(flash.data().iter().all(|&b| b == 0xFF));
        assert_eq!(
            flash.ops()[..2],
            [
                DummyOp::Init,
                DummyOp::Program {
                    addr: 0x1000_0100,
                    len: 0x100
                }
            ]
        );
    }

    #[test]
    fn test_contract_violations() {
        let mut flash = small();
        assert_eq!(flash.program_page(0x1000_0000, &[0; 0x100]), Err(Error::Internal));
        flash.init().unwrap();
        assert_eq!(flash.program_page(0x1000_0010, &[0; 0x100]), Err(Error::Internal));
        assert_eq!(flash.program_page(0x1000_0F00, &[0; 0x200]), Err(Error::Internal));
        assert_eq!(flash.program_page(0x0, &[0; 0x100]), Err(Error::Internal));
        assert_eq!(flash.erase_sector(0x1000_0800), Err(Error::Internal));
    }

    #[test]
    fn test_fault_injection() {
        let mut flash = small();
        flash.faults_mut().init = true;
        assert_eq!(flash.init(), Err(Error::Init));
        flash.faults_mut().init = false;
        flash.faults_mut().erase_chip = true;
        flash.faults_mut().program_at = Some(0x1000_0200);
        flash.init().unwrap();
        assert_eq!(flash.erase_chip(), Err(Error::EraseAll));
        assert_eq!(flash.program_page(0x1000_0200, &[0; 0x100]), Err(Error::Write));
    }

    #[test]
    fn test_pipeline_on_dummies() {
        let board = BoardConfig::example();
        let sync = SyncState::new();
        let target = DummyFlash::for_board(&board);
        let iap = ProtectedIapFlash::new(&board, DummyIap::for_board(&board));
        let mut pipeline = FirmwareUpdatePipeline::new(
            board,
            Settings::default(),
            VfsTimings::default(),
            target,
            iap,
            &sync,
        );
        pipeline.init(true).unwrap();

        let mut image = vec![0x5Au8; 0x1000];
        let words: [u32; 4] = [0x2000_8000, 0x101, 0x105, 0x107];
        for (i, w) in words.iter().enumerate() {
            image[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        pipeline.stream_open(StreamType::Bin).unwrap();
        assert_eq!(
            pipeline.stream_write(&image).unwrap(),
            StreamStatus::DoneOrContinue
        );
        pipeline.stream_close().unwrap();

        assert_eq!(pipeline.target().used(), &image[..]);
        assert!(pipeline.iap().backend().erases().is_empty());
    }

    #[test]
    fn test_iap_guards_running_image() {
        let board = BoardConfig::example();
        let mut iap = ProtectedIapFlash::new(&board, DummyIap::for_board(&board));
        iap.init().unwrap();
        assert_eq!(
            iap.erase_sector(board.interface.start),
            Err(Error::IapEraseSector)
        );
        assert!(iap.backend().erases().is_empty());
    }
}
