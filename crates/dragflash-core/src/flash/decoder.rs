//! Image classification and routing to the right flash device
//!
//! The decoder holds back the first [`MIN_SIZE`] bytes of a stream, decides
//! from them what kind of image it is looking at ([`FlashType`]), picks the
//! device and base address for it and only then starts the
//! [`FlashManager`] session.

use super::intf::{FlashBank, FlashKind};
use super::manager::FlashManager;
use super::validation::{validate_bin_nvic, DaplinkInfo, BUILD_KEY_BL, BUILD_KEY_IF};
use crate::config::{BoardConfig, DaplinkMode, Settings};
use crate::error::{Error, Result};

/// Bytes buffered before an image can be classified
pub const MIN_SIZE: usize = 0x30;

/// What an image is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlashType {
    /// Not recognised
    Unknown,
    /// HIC bootloader image
    Bootloader,
    /// HIC interface image
    Interface,
    /// Image for the attached target
    Target,
}

/// Outcome of a successful [`FlashDecoder::write`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// More data is expected
    Continue,
    /// The end of the destination region was reached
    Done,
}

/// Classify an image from its first bytes
///
/// `addr` is the load address when the caller knows it (HEX records); any
/// such data is at least a [`FlashType::Target`] image.
pub fn detect_type(board: &BoardConfig, data: &[u8], addr: Option<u32>) -> FlashType {
    if let Some(info) = DaplinkInfo::from_image(data) {
        if info.hic_id.get() == board.hic_id {
            return match info.build_key.get() {
                BUILD_KEY_IF => FlashType::Interface,
                BUILD_KEY_BL => FlashType::Bootloader,
                _ => FlashType::Unknown,
            };
        }
    }

    if validate_bin_nvic(&board.target, data) || addr.is_some() {
        return FlashType::Target;
    }

    FlashType::Unknown
}

/// Pick the device and base address for an image of type `ty`
///
/// `addr` is checked against the expected base for HIC images. Bootloader
/// images are refused unless automation is allowed.
pub fn get_flash(
    board: &BoardConfig,
    settings: &Settings,
    ty: FlashType,
    addr: Option<u32>,
) -> Result<(u32, FlashKind)> {
    let selected = match (board.mode, ty) {
        (DaplinkMode::Bootloader, FlashType::Interface) => match addr {
            Some(a) if a != board.interface.start => Err(Error::FdIntfUpdtAddrWrong),
            _ => Ok((board.interface.start, FlashKind::Iap)),
        },
        // A third-party interface application
        (DaplinkMode::Bootloader, FlashType::Target) => Ok((board.interface.start, FlashKind::Iap)),
        (DaplinkMode::Interface, FlashType::Bootloader) => match addr {
            Some(a) if a != board.bootloader.start => Err(Error::FdBlUpdtAddrWrong),
            _ => Ok((board.bootloader.start, FlashKind::Iap)),
        },
        (DaplinkMode::Interface, FlashType::Target) => board
            .target
            .default_flash_region()
            .map(|r| (r.start, FlashKind::Target))
            .ok_or(Error::FdUnsupportedUpdate),
        _ => Err(Error::FdUnsupportedUpdate),
    };

    if ty == FlashType::Bootloader && !settings.automation_allowed {
        return Err(Error::FdUnsupportedUpdate);
    }

    selected
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    Done,
    Error,
}

/// Stateful front end of the flash layer for one stream
pub struct FlashDecoder {
    state: State,
    flash_type: FlashType,
    buf: [u8; MIN_SIZE],
    buf_pos: usize,
    initial_addr: Option<u32>,
    current_addr: u32,
    flash_initialized: bool,
    target_bin: bool,
    manager: FlashManager,
}

impl FlashDecoder {
    /// Create a closed decoder
    pub const fn new() -> Self {
        Self {
            state: State::Closed,
            flash_type: FlashType::Unknown,
            buf: [0xFF; MIN_SIZE],
            buf_pos: 0,
            initial_addr: None,
            current_addr: 0,
            flash_initialized: false,
            target_bin: false,
            manager: FlashManager::new(),
        }
    }

    /// The flash manager fed by this decoder
    pub fn manager(&self) -> &FlashManager {
        &self.manager
    }

    /// Mutable access to the flash manager
    pub fn manager_mut(&mut self) -> &mut FlashManager {
        &mut self.manager
    }

    /// Type decided for the current stream so far
    pub fn flash_type(&self) -> FlashType {
        self.flash_type
    }

    /// [`detect_type`], remembering whether an address-less image turned
    /// out to be a raw target binary
    ///
    /// Only raw target binaries end at the end of their flash region; HEX
    /// images may arrive out of order and must not end early.
    pub fn classify(&mut self, board: &BoardConfig, data: &[u8], addr: Option<u32>) -> FlashType {
        let ty = detect_type(board, data, addr);
        if addr.is_none() {
            self.target_bin = ty == FlashType::Target;
        }
        ty
    }

    /// Start a new stream
    pub fn open(&mut self) -> Result<()> {
        log::debug!("flash decoder: open");
        if self.state != State::Closed {
            return Err(Error::Internal);
        }

        self.buf.fill(0xFF);
        self.state = State::Open;
        self.flash_type = FlashType::Unknown;
        self.buf_pos = 0;
        self.initial_addr = None;
        self.current_addr = 0;
        self.flash_initialized = false;
        self.target_bin = false;
        Ok(())
    }

    /// Feed image bytes destined for `addr`
    pub fn write(&mut self, bank: &mut FlashBank<'_>, addr: u32, data: &[u8]) -> Result<WriteStatus> {
        log::trace!("flash decoder: write addr=0x{:08X} size=0x{:X}", addr, data.len());
        if self.state != State::Open {
            return Err(Error::Internal);
        }

        let result = self.write_inner(bank, addr, data);
        match result {
            Ok(WriteStatus::Done) => self.state = State::Done,
            Ok(WriteStatus::Continue) => {}
            Err(_) => self.state = State::Error,
        }
        result
    }

    fn write_inner(
        &mut self,
        bank: &mut FlashBank<'_>,
        mut addr: u32,
        mut data: &[u8],
    ) -> Result<WriteStatus> {
        let initial_addr = match self.initial_addr {
            Some(a) => a,
            None => {
                log::debug!("flash decoder: initial_addr=0x{:08X}", addr);
                self.initial_addr = Some(addr);
                self.current_addr = addr;
                addr
            }
        };

        if !self.flash_initialized {
            let sequential = addr == self.current_addr;
            self.current_addr = self.current_addr.wrapping_add(data.len() as u32);

            let mut type_known = false;
            if sequential {
                let copy_size = data.len().min(MIN_SIZE - self.buf_pos);
                self.buf[self.buf_pos..self.buf_pos + copy_size].copy_from_slice(&data[..copy_size]);
                self.buf_pos += copy_size;
                data = &data[copy_size..];
                addr = addr.wrapping_add(copy_size as u32);

                if self.buf_pos >= MIN_SIZE {
                    self.flash_type = detect_type(bank.board, &self.buf, Some(initial_addr));
                    log::debug!("flash decoder: buffering complete, type {:?}", self.flash_type);
                    type_known = true;
                }
            } else {
                self.flash_type = FlashType::Target;
                log::debug!("flash decoder: non sequential address, assuming target image");
                type_known = true;
            }

            if type_known {
                let (start, kind) =
                    get_flash(bank.board, bank.settings, self.flash_type, Some(initial_addr))?;
                log::debug!("flash decoder: flash start 0x{:08X} on {:?}", start, kind);
                self.manager.init(bank, kind)?;
                self.flash_initialized = true;
                self.manager.data(bank, initial_addr, &self.buf[..self.buf_pos])?;
            }
        }

        if self.flash_initialized {
            self.manager.data(bank, addr, data)?;
        }

        if self.is_at_end(bank.board, addr, data.len()) {
            log::debug!(
                "flash decoder: end of image at 0x{:08X} size 0x{:X}",
                addr,
                data.len()
            );
            return Ok(WriteStatus::Done);
        }

        Ok(WriteStatus::Continue)
    }

    fn is_at_end(&self, board: &BoardConfig, addr: u32, size: usize) -> bool {
        let end_addr = match self.flash_type {
            FlashType::Bootloader => board.bootloader.end(),
            FlashType::Interface => board.interface.end(),
            FlashType::Target if self.target_bin => {
                match board
                    .target
                    .flash_regions
                    .iter()
                    .find(|r| r.contains_inclusive(addr))
                {
                    Some(region) => region.end,
                    None => return false,
                }
            }
            _ => return false,
        };
        addr.wrapping_add(size as u32) >= end_addr
    }

    /// End the stream, closing the flash session if one was started
    ///
    /// HIC images that never reached the end of their region report
    /// [`Error::IapUpdtIncomplete`].
    pub fn close(&mut self, bank: &mut FlashBank<'_>) -> Result<()> {
        log::debug!("flash decoder: close");
        if self.state == State::Closed {
            return Err(Error::Internal);
        }

        let prev_state = self.state;
        self.state = State::Closed;

        let mut status = Ok(());
        if self.flash_initialized {
            status = self.manager.uninit(bank);
            self.flash_initialized = false;
        }

        if prev_state != State::Done && self.flash_type != FlashType::Target && status.is_ok() {
            status = Err(Error::IapUpdtIncomplete);
        }
        status
    }
}

impl Default for FlashDecoder {
    fn default() -> Self {
        Self::new()
    }
}
