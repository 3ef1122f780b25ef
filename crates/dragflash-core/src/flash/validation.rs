//! Content heuristics used to recognise firmware images

use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{MemoryRegion, TargetConfig};

/// Offset of the [`DaplinkInfo`] header inside a HIC image
pub const DAPLINK_INFO_OFFSET: usize = 0x20;
/// Build key of an interface image
pub const BUILD_KEY_IF: u32 = 0x9B93_9E8F;
/// Build key of a bootloader image
pub const BUILD_KEY_BL: u32 = 0x9B93_9D93;

/// Identification header embedded in bootloader and interface images
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DaplinkInfo {
    /// [`BUILD_KEY_IF`] or [`BUILD_KEY_BL`]
    pub build_key: U32,
    /// HIC the image was built for
    pub hic_id: U32,
    /// Image version
    pub version: U32,
}

impl DaplinkInfo {
    /// Read the header out of the start of an image
    pub fn from_image(image: &[u8]) -> Option<Self> {
        let tail = image.get(DAPLINK_INFO_OFFSET..)?;
        Self::read_from_prefix(tail).ok().map(|(info, _)| info)
    }
}

fn word(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn in_any(regions: &[MemoryRegion], value: u32) -> bool {
    regions.iter().any(|r| r.contains_inclusive(value))
}

/// Check whether `buf` starts with a plausible Cortex-M vector table
///
/// The initial stack pointer must point into target RAM and the Reset,
/// NMI and HardFault handlers into target flash.
pub fn validate_bin_nvic(target: &TargetConfig, buf: &[u8]) -> bool {
    let Some(sp) = word(buf, 0) else {
        return false;
    };
    if !in_any(&target.ram_regions, sp) {
        return false;
    }
    (1..4).all(|i| word(buf, i * 4).is_some_and(|v| in_any(&target.flash_regions, v)))
}

/// Check whether `buf` starts with an Intel HEX record of a known type
pub fn validate_hexfile(buf: &[u8]) -> bool {
    buf.first() == Some(&b':') && matches!(buf.get(8), Some(b'0' | b'2' | b'3' | b'4' | b'5'))
}
