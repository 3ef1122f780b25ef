//! Flash capability trait
//!
//! A [`FlashInterface`] is anything that can erase and program a flash
//! device: the attached target (through a debug-port flash algorithm) or the
//! HIC's own flash (see [`super::iap::ProtectedIapFlash`]).

use crate::config::{BoardConfig, Settings};
use crate::error::Result;

/// Erase/program capability of one flash device
///
/// `program_page` callers guarantee that `addr` is aligned to
/// [`program_page_min_size`](Self::program_page_min_size), that `data.len()`
/// is a non-zero multiple of it, and that the write stays inside one erase
/// sector.
pub trait FlashInterface {
    /// Prepare the device for erase/program operations
    fn init(&mut self) -> Result<()>;

    /// Release the device
    fn uninit(&mut self) -> Result<()>;

    /// Program `data` at `addr`
    fn program_page(&mut self, addr: u32, data: &[u8]) -> Result<()>;

    /// Erase the sector starting at `addr`
    fn erase_sector(&mut self, addr: u32) -> Result<()>;

    /// Erase the whole device
    fn erase_chip(&mut self) -> Result<()>;

    /// Minimum program granularity at `addr`
    fn program_page_min_size(&self, addr: u32) -> u32;

    /// Erase sector size at `addr`
    fn erase_sector_size(&self, addr: u32) -> u32;

    /// `true` while an operation is still running
    fn flash_busy(&self) -> bool {
        false
    }

    /// Select the flash algorithm for the region containing `addr`
    fn flash_algo_set(&mut self, _addr: u32) -> Result<()> {
        Ok(())
    }
}

impl<T: FlashInterface + ?Sized> FlashInterface for &mut T {
    fn init(&mut self) -> Result<()> {
        (**self).init()
    }

    fn uninit(&mut self) -> Result<()> {
        (**self).uninit()
    }

    fn program_page(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        (**self).program_page(addr, data)
    }

    fn erase_sector(&mut self, addr: u32) -> Result<()> {
        (**self).erase_sector(addr)
    }

    fn erase_chip(&mut self) -> Result<()> {
        (**self).erase_chip()
    }

    fn program_page_min_size(&self, addr: u32) -> u32 {
        (**self).program_page_min_size(addr)
    }

    fn erase_sector_size(&self, addr: u32) -> u32 {
        (**self).erase_sector_size(addr)
    }

    fn flash_busy(&self) -> bool {
        (**self).flash_busy()
    }

    fn flash_algo_set(&mut self, addr: u32) -> Result<()> {
        (**self).flash_algo_set(addr)
    }
}

/// Which flash device a session programs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlashKind {
    /// The attached target device
    Target,
    /// The HIC's own flash (bootloader or interface image)
    Iap,
}

/// Everything the flash layers borrow from their owner for one call
///
/// The pipeline owns the flash devices and configuration; the decoder and
/// manager only see them through this short-lived view.
pub struct FlashBank<'a> {
    /// Board description
    pub board: &'a BoardConfig,
    /// Current settings
    pub settings: &'a Settings,
    /// Target flash
    pub target: &'a mut dyn FlashInterface,
    /// HIC flash
    pub iap: &'a mut dyn FlashInterface,
}

impl<'a> FlashBank<'a> {
    /// Create a view over the given devices
    pub fn new(
        board: &'a BoardConfig,
        settings: &'a Settings,
        target: &'a mut dyn FlashInterface,
        iap: &'a mut dyn FlashInterface,
    ) -> Self {
        Self {
            board,
            settings,
            target,
            iap,
        }
    }

    /// Device selected by `kind`
    pub fn get(&mut self, kind: FlashKind) -> &mut dyn FlashInterface {
        match kind {
            FlashKind::Target => &mut *self.target,
            FlashKind::Iap => &mut *self.iap,
        }
    }
}
