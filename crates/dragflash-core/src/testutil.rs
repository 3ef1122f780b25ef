//! Recording flash mock shared by the unit tests

use std::vec;
use std::vec::Vec;

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::config::{BoardConfig, Settings};
use crate::error::{Error, Result};
use crate::flash::iap::IapBackend;
use crate::flash::validation::{BUILD_KEY_BL, DAPLINK_INFO_OFFSET};
use crate::flash::{FlashBank, FlashInterface};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Init,
    Uninit,
    Program { addr: u32, len: usize },
    EraseSector(u32),
    EraseChip,
}

/// Flash model that enforces the program contract and logs every call
pub struct MockFlash {
    pub base: u32,
    pub mem: Vec<u8>,
    pub sector_size: u32,
    pub page_size: u32,
    pub ops: Vec<Op>,
    pub fail_init: bool,
    pub fail_uninit: bool,
    pub fail_erase_chip: bool,
    pub fail_program_at: Option<u32>,
}

impl MockFlash {
    pub fn new(base: u32, size: usize, sector_size: u32, page_size: u32) -> Self {
        Self {
            base,
            mem: vec![0xFF; size],
            sector_size,
            page_size,
            ops: Vec::new(),
            fail_init: false,
            fail_uninit: false,
            fail_erase_chip: false,
            fail_program_at: None,
        }
    }

    /// `(addr, len)` of every program call, in order
    pub fn programs(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        self.ops.iter().filter_map(|op| match op {
            Op::Program { addr, len } => Some((*addr, *len)),
            _ => None,
        })
    }

    /// Bytes programmed at `addr`
    pub fn read(&self, addr: u32, len: usize) -> &[u8] {
        let offset = (addr - self.base) as usize;
        &self.mem[offset..offset + len]
    }
}

impl FlashInterface for MockFlash {
    fn init(&mut self) -> Result<()> {
        self.ops.push(Op::Init);
        if self.fail_init {
            return Err(Error::Init);
        }
        Ok(())
    }

    fn uninit(&mut self) -> Result<()> {
        self.ops.push(Op::Uninit);
        if self.fail_uninit {
            return Err(Error::Uninit);
        }
        Ok(())
    }

    fn program_page(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.ops.push(Op::Program {
            addr,
            len: data.len(),
        });
        if self.fail_program_at == Some(addr) {
            return Err(Error::Write);
        }
        let len = data.len() as u32;
        let sector = addr / self.sector_size;
        if addr % self.page_size != 0
            || len == 0
            || len % self.page_size != 0
            || (addr + len - 1) / self.sector_size != sector
            || addr < self.base
        {
            return Err(Error::Internal);
        }
        let offset = (addr - self.base) as usize;
        let Some(dst) = self.mem.get_mut(offset..offset + data.len()) else {
            return Err(Error::Internal);
        };
        for (d, s) in dst.iter_mut().zip(data) {
            *d &= *s;
        }
        Ok(())
    }

    fn erase_sector(&mut self, addr: u32) -> Result<()> {
        self.ops.push(Op::EraseSector(addr));
        let offset = (addr - self.base) as usize;
        let end = (offset + self.sector_size as usize).min(self.mem.len());
        self.mem[offset..end].fill(0xFF);
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<()> {
        self.ops.push(Op::EraseChip);
        if self.fail_erase_chip {
            return Err(Error::EraseAll);
        }
        self.mem.fill(0xFF);
        Ok(())
    }

    fn program_page_min_size(&self, _addr: u32) -> u32 {
        self.page_size
    }

    fn erase_sector_size(&self, _addr: u32) -> u32 {
        self.sector_size
    }
}

/// Board, settings and two mock devices, lendable as a [`FlashBank`]
pub struct TestEnv {
    pub board: BoardConfig,
    pub settings: Settings,
    pub target: MockFlash,
    pub iap: MockFlash,
}

impl TestEnv {
    /// Example board with a 256 KiB target (4 KiB sectors) and the HIC's
    /// own 512 KiB flash (8 KiB sectors)
    pub fn new() -> Self {
        Self {
            board: BoardConfig::example(),
            settings: Settings::default(),
            target: MockFlash::new(0, 0x4_0000, 0x1000, 0x100),
            iap: MockFlash::new(0, 0x8_0000, 0x2000, 0x20),
        }
    }

    pub fn bank(&mut self) -> FlashBank<'_> {
        FlashBank::new(&self.board, &self.settings, &mut self.target, &mut self.iap)
    }
}

/// First 0x40 bytes of a Cortex-M image valid for the example target
pub fn vector_table() -> [u8; 0x40] {
    let mut v = [0u8; 0x40];
    let words: [u32; 4] = [0x2000_8000, 0x0000_0101, 0x0000_0105, 0x0000_0107];
    for (i, w) in words.iter().enumerate() {
        v[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
    }
    v
}

/// Raw HIC flash in RAM: 512 KiB with 8 KiB sectors
pub struct RamIap {
    pub mem: Vec<u8>,
    pub erases: Vec<u32>,
}

impl RamIap {
    pub fn new() -> Self {
        Self {
            mem: vec![0xFF; 0x8_0000],
            erases: Vec::new(),
        }
    }
}

impl IapBackend for RamIap {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn uninit(&mut self) -> Result<()> {
        Ok(())
    }

    fn erase_sector(&mut self, addr: u32) -> Result<()> {
        self.erases.push(addr);
        let a = addr as usize;
        self.mem[a..a + 0x2000].fill(0xFF);
        Ok(())
    }

    fn program_page(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let a = addr as usize;
        for (d, s) in self.mem[a..a + data.len()].iter_mut().zip(data) {
            *d &= *s;
        }
        Ok(())
    }

    fn read(&self, addr: u32, buf: &mut [u8]) {
        let a = addr as usize;
        buf.copy_from_slice(&self.mem[a..a + buf.len()]);
    }
}

/// Bootloader image filling `board`'s bootloader region, tagged for its HIC
/// and ending in the CRC-32 of everything before it
pub fn bootloader_image(board: &BoardConfig) -> Vec<u8> {
    let size = board.bootloader.size as usize;
    let mut image: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let info = DAPLINK_INFO_OFFSET;
    image[info..info + 4].copy_from_slice(&BUILD_KEY_BL.to_le_bytes());
    image[info + 4..info + 8].copy_from_slice(&board.hic_id.to_le_bytes());
    let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&image[..size - 4]);
    image[size - 4..].copy_from_slice(&crc.to_le_bytes());
    image
}
