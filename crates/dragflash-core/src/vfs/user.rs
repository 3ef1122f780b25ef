//! Files the HIC puts on the drive, and files the user drops to control it
//!
//! Every filesystem build creates the website shortcut and `DETAILS.TXT`,
//! plus `FAIL.TXT` after a failed transfer and `ASSERT.TXT` while an
//! assertion is recorded. Creating one of the [`MagicFile`] names changes a
//! setting or triggers an action, usually followed by a remount so the host
//! sees the updated `DETAILS.TXT`.

use core::fmt::{self, Write};

use heapless::{String, Vec};

use crate::config::{BoardConfig, DaplinkMode, Settings};
use crate::error::{Error, Result};
use crate::flash::manager::FlashManager;
use crate::flash::FlashInterface;

use super::fat::{FileAttr, Filename, SECTOR_SIZE};
use super::filesystem::{FileChange, FileContents, FileEvent, FileHandle, VirtualFs};
use super::manager::SyncState;

/// Register words kept with an assertion
pub const MAX_HEXDUMPS: usize = 16;

/// Name of the assertion report
pub const ASSERT_FILE: Filename = Filename::new(*b"ASSERT  TXT");

const DETAILS_FILE: Filename = Filename::new(*b"DETAILS TXT");
const FAIL_FILE: Filename = Filename::new(*b"FAIL    TXT");

/// Contents of a generated file; always fits in one sector
type Text = String<SECTOR_SIZE>;

/// Firmware image that raised an assertion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssertSource {
    /// The bootloader
    Bootloader,
    /// The interface firmware
    Application,
}

impl AssertSource {
    fn name(self) -> &'static str {
        match self {
            AssertSource::Bootloader => "Bootloader",
            AssertSource::Application => "Application",
        }
    }
}

/// A recorded assertion, reported in `ASSERT.TXT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertInfo {
    /// Source file, truncated to fit
    pub file: String<64>,
    /// Source line
    pub line: u32,
    /// Image that asserted, when known
    pub source: Option<AssertSource>,
    /// Register dump
    pub hexdumps: Vec<u32, MAX_HEXDUMPS>,
}

impl AssertInfo {
    /// Assertion at `file:line`
    pub fn new(file: &str, line: u32) -> Self {
        let mut name = String::new();
        for c in file.chars() {
            if name.push(c).is_err() {
                break;
            }
        }
        Self {
            file: name,
            line,
            source: None,
            hexdumps: Vec::new(),
        }
    }

    /// Set the asserting image
    pub fn with_source(mut self, source: AssertSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Attach register words; extra words are dropped
    pub fn with_hexdumps(mut self, words: &[u32]) -> Self {
        let n = words.len().min(MAX_HEXDUMPS);
        self.hexdumps.clear();
        // n never exceeds the capacity
        let _ = self.hexdumps.extend_from_slice(&words[..n]);
        self
    }
}

/// Reserved file names that act on the HIC when created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MagicFile {
    /// Switch between bootloader and interface
    ModeSwitch,
    /// Record a test assertion
    TestAssert,
    /// Remount only
    Refresh,
    /// Erase the whole target flash
    EraseTarget,
    /// Reset the target after programming
    AutoReset,
    /// Leave the target alone after programming
    HardReset,
    /// Allow automation
    AutomationOn,
    /// Disallow automation
    AutomationOff,
    /// Enable overflow detection
    OverflowOn,
    /// Disable overflow detection
    OverflowOff,
    /// Show the drive
    MsdOn,
    /// Hide the drive after the next disconnect
    MsdOff,
    /// Erase sector by sector while programming
    PageErase,
    /// Erase the chip before programming
    ChipErase,
}

const MAGIC_FILES: [(&[u8; 11], MagicFile); 13] = [
    (b"ASSERT  ACT", MagicFile::TestAssert),
    (b"REFRESH ACT", MagicFile::Refresh),
    (b"ERASE   ACT", MagicFile::EraseTarget),
    (b"AUTO_RSTCFG", MagicFile::AutoReset),
    (b"HARD_RSTCFG", MagicFile::HardReset),
    (b"AUTO_ON CFG", MagicFile::AutomationOn),
    (b"AUTO_OFFCFG", MagicFile::AutomationOff),
    (b"OVFL_ON CFG", MagicFile::OverflowOn),
    (b"OVFL_OFFCFG", MagicFile::OverflowOff),
    (b"MSD_ON  CFG", MagicFile::MsdOn),
    (b"MSD_OFF CFG", MagicFile::MsdOff),
    (b"PAGE_ON ACT", MagicFile::PageErase),
    (b"PAGE_OFFACT", MagicFile::ChipErase),
];

impl MagicFile {
    /// Magic file called `name`, if any
    ///
    /// The mode switch file names the other mode: `START_BL.ACT` while
    /// running the interface, `START_IF.ACT` in the bootloader.
    pub fn from_name(mode: DaplinkMode, name: &Filename) -> Option<Self> {
        let mode_file = match mode {
            DaplinkMode::Interface => b"START_BLACT",
            DaplinkMode::Bootloader => b"START_IFACT",
        };
        if &name.0 == mode_file {
            return Some(MagicFile::ModeSwitch);
        }
        MAGIC_FILES
            .iter()
            .find(|(magic, _)| &name.0 == *magic)
            .map(|(_, file)| *file)
    }
}

/// What a magic file may touch
pub struct UserContext<'a> {
    /// Board description
    pub board: &'a BoardConfig,
    /// Settings to change
    pub settings: &'a mut Settings,
    /// Target flash, for the erase action
    pub target: &'a mut dyn FlashInterface,
    /// Keeps its page erase mode in step with the settings
    pub flash_manager: &'a mut FlashManager,
    /// Remount and assertion requests
    pub sync: &'a SyncState,
}

/// Generated files and HIC-side reactions to the host
pub struct UserFiles {
    files: Vec<(FileHandle, Text), 4>,
    remount_count: u32,
    reset_button: bool,
    reset_requested: bool,
}

impl UserFiles {
    /// No files yet, no remounts counted
    pub const fn new() -> Self {
        Self {
            files: Vec::new(),
            remount_count: 0,
            reset_button: false,
            reset_requested: false,
        }
    }

    /// Number of disconnects seen
    pub fn remount_count(&self) -> u32 {
        self.remount_count
    }

    /// Track the reset button; magic files are honoured while it is held
    pub fn set_reset_button_pressed(&mut self, pressed: bool) {
        self.reset_button = pressed;
    }

    /// `true` once if a disconnect asked for the HIC to reset
    pub fn take_reset_request(&mut self) -> bool {
        core::mem::take(&mut self.reset_requested)
    }

    /// Lay out a fresh drive in `fs` with the generated files
    pub fn build(
        &mut self,
        fs: &mut VirtualFs,
        board: &BoardConfig,
        settings: &Settings,
        last_status: Result<()>,
        assert: Option<&AssertInfo>,
    ) -> Result<()> {
        fs.init(&short_name(&board.drive_name), board.disk_size);
        self.files.clear();

        self.add(fs, short_name(&board.url_file_name), render_url_shortcut(board))?;
        let details = render_details(board, settings, self.remount_count);
        self.add(fs, DETAILS_FILE, details)?;
        if let Err(error) = last_status {
            self.add(fs, FAIL_FILE, render_fail(error))?;
        }
        if let Some(info) = assert {
            let handle = self.add(fs, ASSERT_FILE, render_assert(info))?;
            // The user deletes it to clear the assertion
            fs.set_file_attr(handle, FileAttr::empty());
        }
        Ok(())
    }

    fn add(&mut self, fs: &mut VirtualFs, name: Filename, text: Text) -> Result<FileHandle> {
        let handle = fs.create_file(name, text.len() as u32)?;
        self.files
            .push((handle, text))
            .map_err(|_| Error::Internal)?;
        Ok(handle)
    }

    /// Handle a root directory change before the transfer logic sees it
    pub fn file_change(&mut self, event: &FileEvent, ctx: UserContext<'_>) {
        if !self.reset_button && !ctx.settings.automation_allowed {
            return;
        }

        match event.change {
            FileChange::Created => {
                let Some(magic) = MagicFile::from_name(ctx.board.mode, &event.filename) else {
                    return;
                };
                log::info!("magic file {} ({:?})", event.filename, magic);
                let sync = ctx.sync;
                if apply_magic_file(magic, ctx) {
                    sync.fs_remount();
                }
            }
            FileChange::Deleted if event.filename == ASSERT_FILE => {
                ctx.sync.clear_assert();
                ctx.sync.fs_remount();
            }
            _ => {}
        }
    }

    /// Drive is going away
    pub fn disconnecting(&mut self, board: &BoardConfig, settings: &Settings, status: Result<()>) {
        let bootloader_done = board.is_bootloader() && status.is_ok();
        let leave_interface =
            board.is_interface() && (settings.hold_in_bootloader || settings.msd_disabled);
        if bootloader_done || leave_interface {
            log::info!("reset requested");
            self.reset_requested = true;
        }
        self.remount_count += 1;
    }
}

impl Default for UserFiles {
    fn default() -> Self {
        Self::new()
    }
}

impl FileContents for UserFiles {
    fn read_file(&self, file: FileHandle, sector_offset: u32, buf: &mut [u8]) {
        if sector_offset != 0 {
            return;
        }
        if let Some((_, text)) = self.files.iter().find(|(handle, _)| *handle == file) {
            let len = text.len().min(buf.len());
            buf[..len].copy_from_slice(&text.as_bytes()[..len]);
        }
    }
}

/// Returns whether a remount should follow
fn apply_magic_file(magic: MagicFile, ctx: UserContext<'_>) -> bool {
    let settings = ctx.settings;
    match magic {
        // The bootloader goes to the interface by default
        MagicFile::ModeSwitch => {
            if ctx.board.is_interface() {
                settings.hold_in_bootloader = true;
            }
        }
        MagicFile::TestAssert => {
            ctx.sync.record_assert(AssertInfo::new(file!(), line!()));
            return false;
        }
        MagicFile::Refresh => {}
        MagicFile::EraseTarget => {
            if let Err(e) = erase_target(ctx.target) {
                log::warn!("target erase failed: {}", e);
            }
        }
        MagicFile::AutoReset => settings.auto_reset = true,
        MagicFile::HardReset => settings.auto_reset = false,
        MagicFile::AutomationOn => settings.automation_allowed = true,
        MagicFile::AutomationOff => settings.automation_allowed = false,
        MagicFile::OverflowOn => settings.overflow_detect = true,
        MagicFile::OverflowOff => settings.overflow_detect = false,
        MagicFile::MsdOn => settings.msd_disabled = false,
        MagicFile::MsdOff => settings.msd_disabled = true,
        MagicFile::PageErase | MagicFile::ChipErase => {
            let enabled = magic == MagicFile::PageErase;
            settings.page_erase = enabled;
            ctx.flash_manager.set_page_erase(enabled);
        }
    }
    true
}

fn erase_target(target: &mut dyn FlashInterface) -> Result<()> {
    target.init()?;
    let erased = target.erase_chip();
    let uninit = target.uninit();
    erased.and(uninit)
}

/// 8.3 name from a configured string, space padded
fn short_name(name: &str) -> Filename {
    let mut raw = [b' '; 11];
    for (dst, src) in raw.iter_mut().zip(name.bytes()) {
        *dst = src;
    }
    Filename::new(raw)
}

fn render(f: impl FnOnce(&mut Text) -> fmt::Result) -> Text {
    let mut text = Text::new();
    if f(&mut text).is_err() {
        log::warn!("vfs: generated file truncated");
    }
    text
}

fn bit(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn render_url_shortcut(board: &BoardConfig) -> Text {
    render(|t| {
        t.write_str("<!doctype html>\r\n")?;
        t.write_str("<!-- Board Website Shortcut -->\r\n")?;
        t.write_str("<html>\r\n<head>\r\n<meta charset=\"utf-8\">\r\n")?;
        t.write_str("<title>Board Website Shortcut</title>\r\n</head>\r\n<body>\r\n")?;
        write!(t, "<script>\r\nwindow.location.replace(\"{}\");\r\n", board.url)?;
        t.write_str("</script>\r\n</body>\r\n</html>\r\n")
    })
}

fn render_details(board: &BoardConfig, settings: &Settings, remount_count: u32) -> Text {
    render(|t| {
        t.write_str("# DAPLink Firmware - see https://mbed.com/daplink\r\n")?;
        write!(t, "Unique ID: {}\r\n", board.unique_id)?;
        write!(t, "HIC ID: {:08x}\r\n", board.hic_id)?;
        write!(t, "Auto Reset: {}\r\n", bit(settings.auto_reset))?;
        write!(t, "Automation allowed: {}\r\n", bit(settings.automation_allowed))?;
        write!(t, "Overflow detection: {}\r\n", bit(settings.overflow_detect))?;
        write!(t, "Page erasing: {}\r\n", bit(settings.page_erase))?;
        let mode = board.mode.name();
        write!(t, "Daplink Mode: {}\r\n", mode)?;
        write!(t, "{} Version: {:04}\r\n", mode, board.version)?;
        write!(t, "Remount count: {}\r\n", remount_count)?;
        write!(t, "URL: {}\r\n", board.url)
    })
}

fn render_fail(error: Error) -> Text {
    render(|t| {
        write!(t, "error: {}\r\n", error.message())?;
        t.write_str("type: ")?;
        for (i, name) in error.error_type().names().enumerate() {
            if i > 0 {
                t.write_str(", ")?;
            }
            t.write_str(name)?;
        }
        t.write_str("\r\n")
    })
}

fn render_assert(info: &AssertInfo) -> Text {
    render(|t| {
        t.write_str("Assert\r\n")?;
        write!(t, "File: {}\r\n", info.file)?;
        write!(t, "Line: {}\r\n", info.line)?;
        if let Some(source) = info.source {
            write!(t, "Source: {}\r\n", source.name())?;
        }
        if !info.hexdumps.is_empty() {
            t.write_str("Hexdumps\r\n")?;
            for word in &info.hexdumps {
                write!(t, "{:08x}\r\n", word)?;
            }
        }
        Ok(())
    })
}
