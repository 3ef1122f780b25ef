//! TOML board file parsing
//!
//! ```toml
//! [board]
//! mode = "interface"
//! hic_id = 0x97969902
//! bootloader = { start = 0x0, size = 0xE000 }
//! interface = { start = 0x10000, size = 0x6E000 }
//!
//! [[target.flash]]
//! start = 0x00000000
//! end = 0x00040000
//! default = true
//!
//! [[target.ram]]
//! start = 0x20000000
//! end = 0x20008000
//!
//! [settings]
//! automation_allowed = false
//!
//! [timings]
//! reconnect_delay = 1000
//! ```
//!
//! Every key is optional; missing keys keep the values of
//! [`BoardConfig::example`], [`Settings::default`] and [`VfsTimings::default`].

use std::fs;
use std::path::Path;
use std::string::String;
use std::vec::Vec;

use super::{BoardConfig, DaplinkMode, MemoryRegion, RomRegion, Settings, VfsTimings};

/// Errors from loading a board file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read board file: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid TOML or has wrongly typed keys
    #[error("failed to parse board file: {0}")]
    Parse(#[from] ::toml::de::Error),
    /// A string is longer than the fixed-capacity field it goes into
    #[error("value of `{0}` is too long")]
    TooLong(&'static str),
    /// More regions than a target description can hold
    #[error("too many {0} regions (max {max})", max = super::MAX_REGIONS)]
    TooManyRegions(&'static str),
    /// HIC flash sizes that cannot describe a sector layout
    #[error("iap_sector_size 0x{sector_size:X} is not a non-zero multiple of iap_min_write_size 0x{min_write_size:X}")]
    BadGeometry {
        /// Erase sector size
        sector_size: u32,
        /// Minimum program size
        min_write_size: u32,
    },
    /// A region whose end is not above its start
    #[error("region 0x{start:08X}..0x{end:08X} is empty")]
    EmptyRegion {
        /// Region start
        start: u32,
        /// Region end
        end: u32,
    },
}

/// Everything a board file can describe
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BoardFile {
    /// Board description
    pub board: BoardConfig,
    /// Initial settings
    pub settings: Settings,
    /// State machine delays
    pub timings: VfsTimings,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlFile {
    #[serde(default)]
    board: TomlBoard,
    #[serde(default)]
    target: TomlTarget,
    #[serde(default)]
    settings: TomlSettings,
    #[serde(default)]
    timings: TomlTimings,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlBoard {
    mode: Option<TomlMode>,
    #[serde(default, deserialize_with = "deserialize_opt_hex_u32")]
    hic_id: Option<u32>,
    board_id: Option<String>,
    unique_id: Option<String>,
    version: Option<u32>,
    url: Option<String>,
    drive_name: Option<String>,
    url_file_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_hex_u32")]
    disk_size: Option<u32>,
    bootloader: Option<TomlRom>,
    interface: Option<TomlRom>,
    #[serde(default, deserialize_with = "deserialize_opt_hex_u32")]
    iap_sector_size: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_opt_hex_u32")]
    iap_min_write_size: Option<u32>,
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
enum TomlMode {
    Bootloader,
    Interface,
}

#[derive(Debug, serde::Deserialize)]
struct TomlRom {
    #[serde(deserialize_with = "deserialize_hex_u32")]
    start: u32,
    #[serde(deserialize_with = "deserialize_hex_u32")]
    size: u32,
}

#[derive(Debug, Default, serde::Deserialize)]
struct TomlTarget {
    flash: Option<Vec<TomlRegion>>,
    ram: Option<Vec<TomlRegion>>,
}

#[derive(Debug, serde::Deserialize)]
struct TomlRegion {
    #[serde(deserialize_with = "deserialize_hex_u32")]
    start: u32,
    #[serde(deserialize_with = "deserialize_hex_u32")]
    end: u32,
    #[serde(default)]
    default: bool,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlSettings {
    automation_allowed: Option<bool>,
    auto_reset: Option<bool>,
    overflow_detect: Option<bool>,
    page_erase: Option<bool>,
    msd_disabled: Option<bool>,
    hold_in_bootloader: Option<bool>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlTimings {
    connect_delay: Option<u32>,
    reconnect_delay: Option<u32>,
    disconnect_transfer_timeout: Option<u32>,
    disconnect_transfer_idle: Option<u32>,
    disconnect_delay: Option<u32>,
    max_event_time: Option<u32>,
    tick: Option<u32>,
}

/// Deserialize a u32 that can be hex (0x...) or decimal
fn deserialize_hex_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HexOrInt {
        Int(u32),
        Str(String),
    }

    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(n) => Ok(n),
        HexOrInt::Str(s) => parse_number(&s).map_err(serde::de::Error::custom),
    }
}

fn deserialize_opt_hex_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserialize_hex_u32(deserializer).map(Some)
}

/// Parse a number that can be hex (0x...) or decimal
fn parse_number(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| std::format!("invalid number '{}': {}", s, e))
}

fn fixed<const N: usize>(
    value: Option<String>,
    current: heapless::String<N>,
    key: &'static str,
) -> Result<heapless::String<N>, ConfigError> {
    match value {
        Some(s) => heapless::String::try_from(s.as_str()).map_err(|_| ConfigError::TooLong(key)),
        None => Ok(current),
    }
}

fn regions(
    list: Option<Vec<TomlRegion>>,
    current: heapless::Vec<MemoryRegion, { super::MAX_REGIONS }>,
    kind: &'static str,
) -> Result<heapless::Vec<MemoryRegion, { super::MAX_REGIONS }>, ConfigError> {
    let Some(list) = list else {
        return Ok(current);
    };
    let mut out = heapless::Vec::new();
    for r in list {
        if r.end <= r.start {
            return Err(ConfigError::EmptyRegion {
                start: r.start,
                end: r.end,
            });
        }
        out.push(MemoryRegion {
            start: r.start,
            end: r.end,
            default: r.default,
        })
        .map_err(|_| ConfigError::TooManyRegions(kind))?;
    }
    Ok(out)
}

/// Parse a board file from a TOML string
pub fn parse_board_toml(content: &str) -> Result<BoardFile, ConfigError> {
    let file: TomlFile = ::toml::from_str(content)?;
    let defaults = BoardFile::default();

    let b = file.board;
    let d = defaults.board;
    let board = BoardConfig {
        mode: match b.mode {
            Some(TomlMode::Bootloader) => DaplinkMode::Bootloader,
            Some(TomlMode::Interface) => DaplinkMode::Interface,
            None => d.mode,
        },
        hic_id: b.hic_id.unwrap_or(d.hic_id),
        board_id: fixed(b.board_id, d.board_id, "board_id")?,
        unique_id: fixed(b.unique_id, d.unique_id, "unique_id")?,
        version: b.version.unwrap_or(d.version),
        url: fixed(b.url, d.url, "url")?,
        drive_name: fixed(b.drive_name, d.drive_name, "drive_name")?,
        url_file_name: fixed(b.url_file_name, d.url_file_name, "url_file_name")?,
        disk_size: b.disk_size.unwrap_or(d.disk_size),
        bootloader: b
            .bootloader
            .map_or(d.bootloader, |r| RomRegion::new(r.start, r.size)),
        interface: b
            .interface
            .map_or(d.interface, |r| RomRegion::new(r.start, r.size)),
        iap_sector_size: b.iap_sector_size.unwrap_or(d.iap_sector_size),
        iap_min_write_size: b.iap_min_write_size.unwrap_or(d.iap_min_write_size),
        target: super::TargetConfig {
            flash_regions: regions(file.target.flash, d.target.flash_regions, "flash")?,
            ram_regions: regions(file.target.ram, d.target.ram_regions, "ram")?,
        },
    };

    let (sector_size, min_write_size) = (board.iap_sector_size, board.iap_min_write_size);
    if sector_size == 0 || min_write_size == 0 || sector_size % min_write_size != 0 {
        return Err(ConfigError::BadGeometry {
            sector_size,
            min_write_size,
        });
    }

    let s = file.settings;
    let ds = defaults.settings;
    let settings = Settings {
        automation_allowed: s.automation_allowed.unwrap_or(ds.automation_allowed),
        auto_reset: s.auto_reset.unwrap_or(ds.auto_reset),
        overflow_detect: s.overflow_detect.unwrap_or(ds.overflow_detect),
        page_erase: s.page_erase.unwrap_or(ds.page_erase),
        msd_disabled: s.msd_disabled.unwrap_or(ds.msd_disabled),
        hold_in_bootloader: s.hold_in_bootloader.unwrap_or(ds.hold_in_bootloader),
    };

    let t = file.timings;
    let dt = defaults.timings;
    let timings = VfsTimings {
        connect_delay: t.connect_delay.unwrap_or(dt.connect_delay),
        reconnect_delay: t.reconnect_delay.unwrap_or(dt.reconnect_delay),
        disconnect_transfer_timeout: t
            .disconnect_transfer_timeout
            .unwrap_or(dt.disconnect_transfer_timeout),
        disconnect_transfer_idle: t
            .disconnect_transfer_idle
            .unwrap_or(dt.disconnect_transfer_idle),
        disconnect_delay: t.disconnect_delay.unwrap_or(dt.disconnect_delay),
        max_event_time: t.max_event_time.unwrap_or(dt.max_event_time),
        tick: t.tick.unwrap_or(dt.tick),
    };

    log::debug!(
        "board file: {:?} mode, {} flash / {} ram regions",
        board.mode,
        board.target.flash_regions.len(),
        board.target.ram_regions.len()
    );

    Ok(BoardFile {
        board,
        settings,
        timings,
    })
}

/// Load a board file from disk
pub fn load_board_toml(path: &Path) -> Result<BoardFile, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_board_toml(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let file = parse_board_toml("").unwrap();
        assert_eq!(file, BoardFile::default());
    }

    #[test]
    fn test_parse_board_file() {
        let content = r#"
[board]
mode = "bootloader"
hic_id = "0x97969902"
interface = { start = "0x10000", size = "0x6E000" }

[[target.flash]]
start = "0x08000000"
end = "0x08010000"
default = true

[[target.ram]]
start = 0x20000000
end = 0x20002000

[settings]
automation_allowed = false
page_erase = true

[timings]
reconnect_delay = 1000
"#;
        let file = parse_board_toml(content).unwrap();
        assert_eq!(file.board.mode, DaplinkMode::Bootloader);
        assert_eq!(file.board.hic_id, 0x9796_9902);
        assert_eq!(file.board.interface, RomRegion::new(0x10000, 0x6E000));
        let flash = file.board.target.default_flash_region().unwrap();
        assert_eq!(flash.start, 0x0800_0000);
        assert_eq!(file.board.target.ram_regions[0].end, 0x2000_2000);
        assert!(!file.settings.automation_allowed);
        assert!(file.settings.page_erase);
        assert_eq!(file.timings.reconnect_delay, 1000);
        assert_eq!(file.timings.disconnect_delay, 500);
    }

    #[test]
    fn test_reject_empty_region() {
        let content = r#"
[[target.flash]]
start = 0x1000
end = 0x1000
"#;
        assert!(matches!(
            parse_board_toml(content),
            Err(ConfigError::EmptyRegion { .. })
        ));
    }

    #[test]
    fn test_reject_bad_iap_geometry() {
        for board in [
            "iap_sector_size = 0",
            "iap_min_write_size = 0",
            "iap_sector_size = 0x2000\niap_min_write_size = 0x30",
        ] {
            let content = std::format!("[board]\n{}\n", board);
            assert!(
                matches!(
                    parse_board_toml(&content),
                    Err(ConfigError::BadGeometry { .. })
                ),
                "{}",
                board
            );
        }
    }

    #[test]
    fn test_reject_long_drive_name() {
        let content = r#"
[board]
drive_name = "THIS NAME IS TOO LONG"
"#;
        assert!(matches!(
            parse_board_toml(content),
            Err(ConfigError::TooLong("drive_name"))
        ));
    }
}
