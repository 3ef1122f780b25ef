//! FAT16 on-disk structures
//!
//! Only what the virtual drive fabricates or has to interpret: the boot
//! record, root directory entries and 8.3 file names.

use core::fmt;

use bitflags::bitflags;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Bytes per sector
pub const SECTOR_SIZE: usize = 512;
/// Sectors per cluster
pub const SECTORS_PER_CLUSTER: u32 = 8;
/// Bytes per cluster
pub const CLUSTER_SIZE: u32 = SECTOR_SIZE as u32 * SECTORS_PER_CLUSTER;
/// Entries in the root directory
pub const ROOT_DIR_ENTRIES: usize = 32;
/// Bytes of one directory entry
pub const DIR_ENTRY_SIZE: usize = 32;
/// Sectors occupied by the root directory
pub const ROOT_DIR_SECTORS: u32 = (ROOT_DIR_ENTRIES * DIR_ENTRY_SIZE / SECTOR_SIZE) as u32;

/// First byte of a deleted directory entry
pub const DELETED_MARKER: u8 = 0xE5;

bitflags! {
    /// Directory entry attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileAttr: u8 {
        /// Read only
        const READ_ONLY = 0x01;
        /// Hidden
        const HIDDEN = 0x02;
        /// System file
        const SYSTEM = 0x04;
        /// Volume label
        const VOLUME_LABEL = 0x08;
        /// Subdirectory
        const SUB_DIR = 0x10;
        /// Archive
        const ARCHIVE = 0x20;
    }
}

/// Space-padded 8.3 name without the dot, e.g. `b"FIRM    BIN"`
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(transparent)]
pub struct Filename(pub [u8; 11]);

impl Filename {
    /// Wrap raw directory-entry bytes
    pub const fn new(raw: [u8; 11]) -> Self {
        Self(raw)
    }

    /// Convert a `NAME.EXT` string, or `None` if it does not fit 8.3
    ///
    /// Letters are upper-cased.
    pub fn from_dotted(name: &str) -> Option<Self> {
        let (base, ext) = match name.rsplit_once('.') {
            Some((base, ext)) => (base, ext),
            None => (name, ""),
        };
        if base.is_empty() || base.len() > 8 || ext.len() > 3 {
            return None;
        }

        let mut raw = [b' '; 11];
        raw[..base.len()].copy_from_slice(base.as_bytes());
        raw[8..8 + ext.len()].copy_from_slice(ext.as_bytes());
        raw.make_ascii_uppercase();
        let filename = Self(raw);
        filename.is_valid().then_some(filename)
    }

    /// The three extension bytes
    pub fn extension(&self) -> &[u8] {
        &self.0[8..]
    }

    /// Name and extension with padding removed
    pub fn parts(&self) -> (&str, &str) {
        fn trim(bytes: &[u8]) -> &str {
            let end = bytes.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
            core::str::from_utf8(&bytes[..end]).unwrap_or("")
        }
        (trim(&self.0[..8]), trim(&self.0[8..]))
    }

    /// Whether this is an acceptable short name for a new file
    pub fn is_valid(&self) -> bool {
        if matches!(self.0[0], DELETED_MARKER | 0x00 | b' ') {
            return false;
        }
        self.0.iter().all(|&c| filename_character_valid(c))
    }
}

fn filename_character_valid(c: u8) -> bool {
    const INVALID: &[u8] = b"\"*+,./:;<=>?[\\]|";
    if c.is_ascii_lowercase() {
        return false;
    }
    if c < 0x20 && c != 0x05 {
        return false;
    }
    !INVALID.contains(&c)
}

impl fmt::Debug for Filename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Filename(\"{}\")", self)
    }
}

impl fmt::Display for Filename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (base, ext) = self.parts();
        if ext.is_empty() {
            write!(f, "{}", base)
        } else {
            write!(f, "{}.{}", base, ext)
        }
    }
}

/// One 32-byte root directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DirEntry {
    /// 8.3 name
    pub filename: Filename,
    /// [`FileAttr`] bits
    pub attributes: u8,
    /// Reserved
    pub reserved: u8,
    /// Creation time, 10 ms units
    pub creation_time_ms: u8,
    /// Creation time
    pub creation_time: U16,
    /// Creation date
    pub creation_date: U16,
    /// Last access date
    pub accessed_date: U16,
    /// High half of the first cluster (FAT32 only)
    pub first_cluster_high_16: U16,
    /// Modification time
    pub modification_time: U16,
    /// Modification date
    pub modification_date: U16,
    /// Low half of the first cluster
    pub first_cluster_low_16: U16,
    /// File size in bytes
    pub filesize: U32,
}

impl DirEntry {
    /// Directory entry for a fabricated file
    pub fn file(filename: Filename, first_cluster: u16, size: u32) -> Self {
        Self {
            filename,
            attributes: FileAttr::READ_ONLY.bits(),
            reserved: 0,
            creation_time_ms: 0,
            creation_time: U16::new(0),
            creation_date: U16::new(0x4876),
            accessed_date: U16::new(0x4876),
            first_cluster_high_16: U16::new(0),
            modification_time: U16::new(0x83DC),
            modification_date: U16::new(0x4876),
            first_cluster_low_16: U16::new(first_cluster),
            filesize: U32::new(size),
        }
    }

    /// Volume label entry
    pub fn volume_label(label: Filename) -> Self {
        Self {
            filename: label,
            attributes: (FileAttr::VOLUME_LABEL | FileAttr::ARCHIVE).bits(),
            reserved: 0,
            creation_time_ms: 0,
            creation_time: U16::new(0),
            creation_date: U16::new(0),
            accessed_date: U16::new(0),
            first_cluster_high_16: U16::new(0),
            modification_time: U16::new(0x8E41),
            modification_date: U16::new(0x32BB),
            first_cluster_low_16: U16::new(0),
            filesize: U32::new(0),
        }
    }

    /// Attribute bits, unknown bits dropped
    pub fn attr(&self) -> FileAttr {
        FileAttr::from_bits_truncate(self.attributes)
    }

    /// File size in bytes
    pub fn size(&self) -> u32 {
        self.filesize.get()
    }

    /// First cluster of the file
    pub fn first_cluster(&self) -> u32 {
        let high = u32::from(self.first_cluster_high_16.get());
        high << 16 | u32::from(self.first_cluster_low_16.get())
    }

    /// `true` for never-used and deleted entries
    pub fn is_free(&self) -> bool {
        matches!(self.filename.0[0], 0x00 | DELETED_MARKER)
    }
}

const BOOTSTRAP_CODE: [u8; 47] = [
    0xFA, 0xB8, 0xC0, 0x07, 0x05, 0x20, 0x01, 0x8E, 0xD0, 0xBC, 0x00, 0x10, 0xB8, 0xC0, 0x07, 0x8E,
    0xD8, 0xBE, 0x6D, 0x00, 0xE8, 0x0B, 0x00, 0xEB, 0xFE, 0xB4, 0x0E, 0xB7, 0x00, 0xB3, 0x07, 0xCD,
    0x10, 0xC3, 0x8A, 0x04, 0x46, 0x08, 0xC0, 0x74, 0x05, 0xE8, 0xED, 0xFF, 0xEB, 0xF4, 0xC3,
];

/// Printed by [`BOOTSTRAP_CODE`] if a PC tries to boot from the drive
const BOOTSTRAP_MESSAGE: &[u8] = b"PLEASE REMOVE THE USB DRIVE AND REBOOT THE SYSTEM..\0";

const fn bootstrap() -> [u8; 448] {
    let mut out = [0u8; 448];
    let mut i = 0;
    while i < BOOTSTRAP_CODE.len() {
        out[i] = BOOTSTRAP_CODE[i];
        i += 1;
    }
    let mut j = 0;
    while j < BOOTSTRAP_MESSAGE.len() {
        out[i + j] = BOOTSTRAP_MESSAGE[j];
        j += 1;
    }
    out
}

/// FAT16 boot record with DOS 3.31 and extended BPB
#[derive(Debug, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Mbr {
    /// Jump instruction and OEM name
    pub boot_sector: [u8; 11],
    /// Always [`SECTOR_SIZE`]
    pub bytes_per_sector: U16,
    /// Always [`SECTORS_PER_CLUSTER`]
    pub sectors_per_cluster: u8,
    /// Sectors before the first FAT
    pub reserved_logical_sectors: U16,
    /// Number of FAT copies
    pub num_fats: u8,
    /// Root directory capacity
    pub max_root_dir_entries: U16,
    /// Sector count when below 0x10000, otherwise 0
    pub total_logical_sectors: U16,
    /// Media descriptor
    pub media_descriptor: u8,
    /// Sectors per FAT copy
    pub logical_sectors_per_fat: U16,
    /// Geometry, unused
    pub physical_sectors_per_track: U16,
    /// Geometry, unused
    pub heads: U16,
    /// Sectors before this record
    pub hidden_sectors: U32,
    /// Sector count when it does not fit `total_logical_sectors`
    pub big_sectors_on_drive: U32,
    /// BIOS drive number
    pub physical_drive_number: u8,
    /// Unused
    pub not_used: u8,
    /// 0x29 when the fields below are present
    pub boot_record_signature: u8,
    /// Volume serial number
    pub volume_id: U32,
    /// Volume label
    pub volume_label: [u8; 11],
    /// File system type string
    pub file_system_type: [u8; 8],
    /// Boot code
    pub bootstrap: [u8; 448],
    /// 0xAA55
    pub signature: U16,
}

impl Mbr {
    /// Boot record with every field that does not depend on the disk size
    pub fn template() -> Self {
        Self {
            boot_sector: *b"\xEB\x3C\x90MSD0S4.1",
            bytes_per_sector: U16::new(SECTOR_SIZE as u16),
            sectors_per_cluster: SECTORS_PER_CLUSTER as u8,
            reserved_logical_sectors: U16::new(1),
            num_fats: 2,
            max_root_dir_entries: U16::new(ROOT_DIR_ENTRIES as u16),
            total_logical_sectors: U16::new(0x1F50),
            media_descriptor: 0xF8,
            logical_sectors_per_fat: U16::new(1),
            physical_sectors_per_track: U16::new(1),
            heads: U16::new(1),
            hidden_sectors: U32::new(0),
            big_sectors_on_drive: U32::new(0),
            physical_drive_number: 0,
            not_used: 0,
            boot_record_signature: 0x29,
            volume_id: U32::new(0x2702_1974),
            volume_label: *b"DAPLINK-DND",
            file_system_type: *b"FAT16   ",
            bootstrap: bootstrap(),
            signature: U16::new(0xAA55),
        }
    }

    /// Total sectors, whichever field holds it
    pub fn total_sectors(&self) -> u32 {
        match self.total_logical_sectors.get() {
            0 => self.big_sectors_on_drive.get(),
            n => u32::from(n),
        }
    }

    /// First sector of the first FAT
    pub fn fat_start(&self) -> u32 {
        u32::from(self.reserved_logical_sectors.get())
    }

    /// First sector of the root directory
    pub fn root_dir_start(&self) -> u32 {
        self.fat_start() + u32::from(self.num_fats) * u32::from(self.logical_sectors_per_fat.get())
    }

    /// First sector of cluster 2
    pub fn data_start(&self) -> u32 {
        let dir_bytes = u32::from(self.max_root_dir_entries.get()) * DIR_ENTRY_SIZE as u32;
        self.root_dir_start() + dir_bytes.div_ceil(u32::from(self.bytes_per_sector.get()))
    }

    /// First sector of `cluster`, `None` for the reserved clusters 0 and 1
    pub fn cluster_to_sector(&self, cluster: u32) -> Option<u32> {
        let index = cluster.checked_sub(2)?;
        Some(self.data_start() + index * u32::from(self.sectors_per_cluster))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeros;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(core::mem::size_of::<Mbr>(), SECTOR_SIZE);
        assert_eq!(core::mem::size_of::<DirEntry>(), DIR_ENTRY_SIZE);
        let mbr = Mbr::template();
        let bytes = mbr.as_bytes();
        assert_eq!(&bytes[3..11], b"MSD0S4.1");
        assert_eq!(&bytes[510..], &[0x55, 0xAA]);
        assert_eq!(bytes[21], 0xF8);
        assert_eq!(&bytes[62 + 47..62 + 53], b"PLEASE");
    }

    #[test]
    fn test_filename_validity() {
        assert!(Filename::new(*b"FIRM    BIN").is_valid());
        assert!(Filename::new(*b"AUTO_RSTCFG").is_valid());
        assert!(!Filename::new(*b"firm    bin").is_valid());
        assert!(!Filename::new(*b" IRM    BIN").is_valid());
        assert!(!Filename::new(*b"\xE5IRM    BIN").is_valid());
        assert!(!Filename::new(*b"FI*M    BIN").is_valid());
        assert!(!Filename::new(*b"FI\x01M    BIN").is_valid());
        assert!(Filename::new(*b"\x05IRM    BIN").is_valid());
    }

    #[test]
    fn test_dotted_names() {
        let name = Filename::from_dotted("firm.bin").unwrap();
        assert_eq!(name, Filename::new(*b"FIRM    BIN"));
        assert_eq!(name.parts(), ("FIRM", "BIN"));
        assert_eq!(std::format!("{}", name), "FIRM.BIN");
        assert_eq!(Filename::from_dotted("README").unwrap().extension(), b"   ");
        assert!(Filename::from_dotted("toolongname.bin").is_none());
        assert!(Filename::from_dotted("a.b.c").is_none());
        assert!(Filename::from_dotted(".bin").is_none());
    }

    #[test]
    fn test_dir_entry_fields() {
        let entry = DirEntry::file(Filename::new(*b"DETAILS TXT"), 3, 600);
        assert_eq!(entry.attr(), FileAttr::READ_ONLY);
        assert_eq!(entry.first_cluster(), 3);
        assert_eq!(entry.size(), 600);
        let bytes = entry.as_bytes();
        assert_eq!(&bytes[26..28], &[3, 0]);
        assert_eq!(&bytes[28..32], &600u32.to_le_bytes());
        assert!(!entry.is_free());
        assert!(DirEntry::new_zeroed().is_free());
    }

    #[test]
    fn test_cluster_mapping() {
        let mut mbr = Mbr::template();
        mbr.logical_sectors_per_fat = U16::new(4);
        assert_eq!(mbr.root_dir_start(), 9);
        assert_eq!(mbr.data_start(), 11);
        assert_eq!(mbr.cluster_to_sector(2), Some(11));
        assert_eq!(mbr.cluster_to_sector(3), Some(19));
        assert_eq!(mbr.cluster_to_sector(1), None);
    }
}
