//! Board and runtime configuration
//!
//! [`BoardConfig`] describes the HIC hardware: which firmware image is
//! running, where the bootloader and interface images live, and the memory
//! map of the attached target. [`Settings`] holds the user-changeable flags
//! that magic files toggle. [`VfsTimings`] collects the connect/disconnect
//! delays the drive state machine waits for.
//!
//! With the `std` feature the whole set can be loaded from a TOML file, see
//! [`toml`].

#[cfg(feature = "std")]
pub mod toml;

use heapless::{String, Vec};

/// Maximum number of flash or RAM regions in a target description
pub const MAX_REGIONS: usize = 8;

/// Which firmware image is currently running on the HIC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaplinkMode {
    /// The bootloader; it can update the interface image
    Bootloader,
    /// The interface firmware; it programs targets and can update the bootloader
    Interface,
}

impl DaplinkMode {
    /// Name shown in `DETAILS.TXT`
    pub fn name(self) -> &'static str {
        match self {
            Self::Bootloader => "Bootloader",
            Self::Interface => "Interface",
        }
    }
}

/// A region of the HIC's own ROM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RomRegion {
    /// First address
    pub start: u32,
    /// Size in bytes (zero when the image does not exist on this board)
    pub size: u32,
}

impl RomRegion {
    /// Create a region
    pub const fn new(start: u32, size: u32) -> Self {
        Self { start, size }
    }

    /// One past the last address
    pub const fn end(&self) -> u32 {
        self.start.wrapping_add(self.size)
    }

    /// Check whether `addr` lies inside the region
    pub const fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end()
    }
}

/// A flash or RAM region of the target device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// First address
    pub start: u32,
    /// One past the last address
    pub end: u32,
    /// Raw binaries without an address are programmed at the default flash region
    pub default: bool,
}

impl MemoryRegion {
    /// Create a non-default region
    pub const fn new(start: u32, end: u32) -> Self {
        Self {
            start,
            end,
            default: false,
        }
    }

    /// Create the default flash region
    pub const fn new_default(start: u32, end: u32) -> Self {
        Self {
            start,
            end,
            default: true,
        }
    }

    /// Inclusive range test; an initial stack pointer sits exactly at the
    /// end of RAM
    pub const fn contains_inclusive(&self, addr: u32) -> bool {
        addr >= self.start && addr <= self.end
    }
}

/// Memory map of the device being programmed through the target flash interface
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TargetConfig {
    /// Flash regions
    pub flash_regions: Vec<MemoryRegion, MAX_REGIONS>,
    /// RAM regions
    pub ram_regions: Vec<MemoryRegion, MAX_REGIONS>,
}

impl TargetConfig {
    /// Flash region raw binaries are placed in
    pub fn default_flash_region(&self) -> Option<&MemoryRegion> {
        self.flash_regions.iter().find(|r| r.default)
    }

    /// Flash region containing `addr`
    pub fn flash_region_containing(&self, addr: u32) -> Option<&MemoryRegion> {
        self.flash_regions
            .iter()
            .find(|r| addr >= r.start && addr < r.end)
    }
}

/// Static description of the HIC board
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardConfig {
    /// Image currently running
    pub mode: DaplinkMode,
    /// Host interface circuit identifier, matched against image headers
    pub hic_id: u32,
    /// Four character board identifier
    pub board_id: String<8>,
    /// Unique HIC identifier reported in `DETAILS.TXT`
    pub unique_id: String<48>,
    /// Firmware version of the running image
    pub version: u32,
    /// Landing page the URL shortcut redirects to
    pub url: String<96>,
    /// Volume label of the virtual drive (space padded to 11 characters)
    pub drive_name: String<11>,
    /// 8.3 name of the URL shortcut file
    pub url_file_name: String<11>,
    /// Advertised size of the virtual drive in bytes
    pub disk_size: u32,
    /// Bootloader ROM region
    pub bootloader: RomRegion,
    /// Interface firmware ROM region
    pub interface: RomRegion,
    /// Erase sector size of the HIC's own flash
    pub iap_sector_size: u32,
    /// Minimum program size of the HIC's own flash
    pub iap_min_write_size: u32,
    /// Memory map of the attached target
    pub target: TargetConfig,
}

impl BoardConfig {
    /// `true` when running as bootloader
    pub fn is_bootloader(&self) -> bool {
        self.mode == DaplinkMode::Bootloader
    }

    /// `true` when running as interface firmware
    pub fn is_interface(&self) -> bool {
        self.mode == DaplinkMode::Interface
    }

    /// Region of the image that is currently executing
    pub fn app_region(&self) -> RomRegion {
        match self.mode {
            DaplinkMode::Bootloader => self.bootloader,
            DaplinkMode::Interface => self.interface,
        }
    }

    /// Region the running image is allowed to rewrite
    pub fn update_region(&self) -> RomRegion {
        match self.mode {
            DaplinkMode::Bootloader => self.interface,
            DaplinkMode::Interface => self.bootloader,
        }
    }

    /// A board modelled on a MAX32625 HIC driving a 256 KiB Cortex-M target
    pub fn example() -> Self {
        let mut target = TargetConfig::default();
        // Capacity is MAX_REGIONS, so a single push cannot fail
        let _ = target
            .flash_regions
            .push(MemoryRegion::new_default(0x0000_0000, 0x0004_0000));
        let _ = target
            .ram_regions
            .push(MemoryRegion::new(0x2000_0000, 0x2000_8000));

        Self {
            mode: DaplinkMode::Interface,
            hic_id: 0x9796_9902,
            board_id: str_or_empty("0000"),
            unique_id: str_or_empty("00000000000000000000000000000000"),
            version: 254,
            url: str_or_empty("https://example.com/dragflash"),
            drive_name: str_or_empty("DAPLINK    "),
            url_file_name: str_or_empty("MBED    HTM"),
            disk_size: 64 * 1024 * 1024,
            bootloader: RomRegion::new(0x0000_0000, 0x0000_E000),
            interface: RomRegion::new(0x0001_0000, 0x0006_E000),
            iap_sector_size: 0x2000,
            iap_min_write_size: 0x20,
            target,
        }
    }
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self::example()
    }
}

fn str_or_empty<const N: usize>(s: &str) -> String<N> {
    String::try_from(s).unwrap_or_default()
}

/// Persisted, user-changeable settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Magic files and bootloader updates are accepted without holding reset
    pub automation_allowed: bool,
    /// Reset the target automatically after programming
    pub auto_reset: bool,
    /// Detect UART overflow
    pub overflow_detect: bool,
    /// Erase sector by sector instead of erasing the chip up front
    pub page_erase: bool,
    /// Hide the drive after the next disconnect
    pub msd_disabled: bool,
    /// Stay in the bootloader after the next reset
    pub hold_in_bootloader: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            automation_allowed: true,
            auto_reset: true,
            overflow_detect: false,
            page_erase: false,
            msd_disabled: false,
            hold_in_bootloader: false,
        }
    }
}

/// Delays of the drive connect/disconnect state machine, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfsTimings {
    /// Idle time before the drive first appears
    pub connect_delay: u32,
    /// Time the drive stays ejected during a remount
    pub reconnect_delay: u32,
    /// Idle time before giving up on a transfer that is still in progress
    pub disconnect_transfer_timeout: u32,
    /// Idle time before finishing a transfer that could already be finished
    pub disconnect_transfer_idle: u32,
    /// Idle time before a remount when no transfer is pending
    pub disconnect_delay: u32,
    /// Cap for the idle counter
    pub max_event_time: u32,
    /// Period at which the driver calls `periodic`
    pub tick: u32,
}

impl Default for VfsTimings {
    fn default() -> Self {
        Self {
            connect_delay: 0,
            reconnect_delay: 2500,
            disconnect_transfer_timeout: 20000,
            disconnect_transfer_idle: 500,
            disconnect_delay: 500,
            max_event_time: 60000,
            tick: 90,
        }
    }
}
