//! Fabricated FAT16 volume
//!
//! [`VirtualFs`] answers sector reads with a boot record, FAT, root
//! directory and file contents that it makes up on the fly, and interprets
//! host writes to the root directory as file events. Everything else the
//! host writes is ignored here; file data is picked up by the VFS manager.
//!
//! Limitations: files are contiguous, data written cannot be read back and
//! only the first FAT sector is backed by RAM.

use heapless::Vec;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use super::fat::{
    DirEntry, FileAttr, Filename, Mbr, CLUSTER_SIZE, DELETED_MARKER, DIR_ENTRY_SIZE,
    ROOT_DIR_ENTRIES, ROOT_DIR_SECTORS, SECTORS_PER_CLUSTER, SECTOR_SIZE,
};
use crate::error::{Error, Result};

/// Files that can be placed on the volume
pub const MAX_FILES: usize = 16;

// FAT16 cluster count limits with a safety margin
const FAT_CLUSTERS_MAX: u32 = 65525 - 100;
const FAT_CLUSTERS_MIN: u32 = 4086 + 100;

/// Slack added to the requested disk size
const DISK_SIZE_MARGIN: u32 = 64 * 1024;

/// Root directory slot of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(u8);

impl FileHandle {
    /// Index into the root directory
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[cfg(test)]
    pub(crate) fn from_index(index: u8) -> Self {
        Self(index)
    }
}

/// What happened to a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    /// A valid new name appeared in a slot
    Created,
    /// The entry was marked deleted
    Deleted,
    /// Any byte of the entry changed
    Changed,
}

/// One directory change observed in a host write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileEvent {
    /// Kind of change
    pub change: FileChange,
    /// New name, or the old one for [`FileChange::Deleted`]
    pub filename: Filename,
    /// Slot that changed
    pub file: FileHandle,
    /// Entry as written by the host
    pub entry: DirEntry,
    /// First sector of the entry's data, `None` while it has no size
    pub start_sector: Option<u32>,
}

/// Source of file contents for [`VirtualFs::read`]
pub trait FileContents {
    /// Fill `buf` (one zeroed sector) with sector `sector_offset` of `file`
    fn read_file(&self, file: FileHandle, sector_offset: u32, buf: &mut [u8]);
}

impl<F: Fn(FileHandle, u32, &mut [u8])> FileContents for F {
    fn read_file(&self, file: FileHandle, sector_offset: u32, buf: &mut [u8]) {
        self(file, sector_offset, buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Mbr,
    Fat,
    RootDir,
    File(FileHandle),
}

#[derive(Debug, Clone, Copy)]
struct FileRegion {
    handle: FileHandle,
    sectors: u32,
}

/// In-RAM FAT16 volume
pub struct VirtualFs {
    mbr: Mbr,
    fat: [u8; SECTOR_SIZE],
    fat_idx: u32,
    dir: [DirEntry; ROOT_DIR_ENTRIES],
    dir_idx: usize,
    files: Vec<FileRegion, MAX_FILES>,
}

impl VirtualFs {
    /// Create an empty volume; call [`init`](Self::init) before use
    pub fn new() -> Self {
        Self {
            mbr: Mbr::template(),
            fat: [0; SECTOR_SIZE],
            fat_idx: 0,
            dir: [DirEntry::new_zeroed(); ROOT_DIR_ENTRIES],
            dir_idx: 0,
            files: Vec::new(),
        }
    }

    /// Wipe the volume and lay out an empty FAT16 file system of roughly
    /// `disk_size` bytes labelled `drive_name`
    pub fn init(&mut self, drive_name: &Filename, disk_size: u32) {
        *self = Self::new();

        let mut total_sectors = disk_size.saturating_add(DISK_SIZE_MARGIN) / SECTOR_SIZE as u32;
        let min_sectors = FAT_CLUSTERS_MIN * SECTORS_PER_CLUSTER;
        let max_sectors = FAT_CLUSTERS_MAX * SECTORS_PER_CLUSTER;
        if total_sectors < min_sectors {
            log::warn!("vfs: disk too small for FAT16, using {} sectors", min_sectors);
            total_sectors = min_sectors;
        } else if total_sectors > max_sectors {
            log::warn!("vfs: disk too large for FAT16, using {} sectors", max_sectors);
            total_sectors = max_sectors;
        }

        if total_sectors >= 0x1_0000 {
            self.mbr.total_logical_sectors = U16::new(0);
            self.mbr.big_sectors_on_drive.set(total_sectors);
        } else {
            self.mbr.total_logical_sectors = U16::new(total_sectors as u16);
            self.mbr.big_sectors_on_drive.set(0);
        }

        // Larger than needed, which FAT allows
        let num_clusters = total_sectors / SECTORS_PER_CLUSTER;
        let fat_sectors = (num_clusters * 2).div_ceil(SECTOR_SIZE as u32);
        self.mbr.logical_sectors_per_fat = U16::new(fat_sectors as u16);

        // Media type, then the clean-shutdown marker
        self.fat[0..2].copy_from_slice(&0xFFF8u16.to_le_bytes());
        self.fat[2..4].copy_from_slice(&0xFFFFu16.to_le_bytes());
        self.fat_idx = 2;

        self.dir[0] = DirEntry::volume_label(*drive_name);
        self.dir_idx = 1;
    }

    /// The boot record
    pub fn mbr(&self) -> &Mbr {
        &self.mbr
    }

    /// Volume size in bytes
    pub fn total_size(&self) -> u32 {
        self.mbr.total_sectors() * SECTOR_SIZE as u32
    }

    fn write_fat(&mut self, idx: u32, value: u16) -> Result<()> {
        let offset = idx as usize * 2;
        let Some(slot) = self.fat.get_mut(offset..offset + 2) else {
            log::warn!("vfs: cluster {} outside the FAT sector", idx);
            return Err(Error::Internal);
        };
        slot.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Add a read-only file of `len` bytes in the next free clusters
    pub fn create_file(&mut self, filename: Filename, len: u32) -> Result<FileHandle> {
        if !filename.is_valid() {
            return Err(Error::Internal);
        }
        if self.dir_idx >= ROOT_DIR_ENTRIES || self.files.is_full() {
            return Err(Error::Internal);
        }

        let clusters = len.div_ceil(CLUSTER_SIZE);
        let mut first_cluster = 0;
        if len > 0 {
            first_cluster = self.fat_idx;
            for _ in 1..clusters {
                self.write_fat(self.fat_idx, (self.fat_idx + 1) as u16)?;
                self.fat_idx += 1;
            }
            self.write_fat(self.fat_idx, 0xFFFF)?;
            self.fat_idx += 1;
        }

        let handle = FileHandle(self.dir_idx as u8);
        self.dir[self.dir_idx] = DirEntry::file(filename, first_cluster as u16, len);
        self.dir_idx += 1;
        self.files
            .push(FileRegion {
                handle,
                sectors: clusters * SECTORS_PER_CLUSTER,
            })
            .map_err(|_| Error::Internal)?;

        log::trace!("vfs: created {} ({} bytes, cluster {})", filename, len, first_cluster);
        Ok(handle)
    }

    /// Replace the attributes of `file`
    pub fn set_file_attr(&mut self, file: FileHandle, attr: FileAttr) {
        self.dir[file.index()].attributes = attr.bits();
    }

    /// Current directory entry of `file`
    pub fn entry(&self, file: FileHandle) -> &DirEntry {
        &self.dir[file.index()]
    }

    /// First sector of the data described by `entry`
    pub fn start_sector(&self, entry: &DirEntry) -> Option<u32> {
        if entry.size() == 0 {
            return None;
        }
        self.mbr
            .cluster_to_sector(u32::from(entry.first_cluster_low_16.get()))
    }

    fn regions(&self) -> impl Iterator<Item = (Region, u32)> + '_ {
        let fat_sectors = u32::from(self.mbr.logical_sectors_per_fat.get());
        [
            (Region::Mbr, 1),
            (Region::Fat, fat_sectors),
            (Region::Fat, fat_sectors),
            (Region::RootDir, ROOT_DIR_SECTORS),
        ]
        .into_iter()
        .chain(self.files.iter().map(|f| (Region::File(f.handle), f.sectors)))
    }

    fn locate(&self, sector: u32) -> Option<(Region, u32)> {
        let mut start: u32 = 0;
        for (region, sectors) in self.regions() {
            let end = start.checked_add(sectors)?;
            if sector < end {
                return Some((region, sector - start));
            }
            start = end;
        }
        None
    }

    /// Fill `buf` (whole sectors) starting at `sector`
    ///
    /// Sectors outside every region read as zeros.
    pub fn read(&self, sector: u32, buf: &mut [u8], contents: &dyn FileContents) {
        buf.fill(0);
        for (i, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let Some((region, offset)) = sector.checked_add(i as u32).and_then(|s| self.locate(s))
            else {
                continue;
            };
            match region {
                Region::Mbr => chunk.copy_from_slice(self.mbr.as_bytes()),
                Region::Fat if offset == 0 => chunk.copy_from_slice(&self.fat),
                Region::Fat => {}
                // Only the fabricated entries are served; host entries are
                // never read back
                Region::RootDir if offset == 0 => {
                    let len = self.dir_idx * DIR_ENTRY_SIZE;
                    chunk[..len].copy_from_slice(self.dir[..self.dir_idx].as_bytes());
                }
                Region::RootDir => {}
                Region::File(handle) => contents.read_file(handle, offset, chunk),
            }
        }
    }

    /// Process a host write of whole sectors starting at `sector`
    ///
    /// Only the root directory is interpreted; `on_change` sees every entry
    /// that differs from what was there before.
    pub fn write(&mut self, sector: u32, buf: &[u8], on_change: &mut dyn FnMut(FileEvent)) {
        for (i, chunk) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
            // Past the end of the sector space is simply out of range
            let Some(s) = sector.checked_add(i as u32) else {
                break;
            };
            if let Some((Region::RootDir, offset)) = self.locate(s) {
                self.write_dir(offset, chunk, on_change);
            }
        }
    }

    fn write_dir(&mut self, sector_offset: u32, data: &[u8], on_change: &mut dyn FnMut(FileEvent)) {
        let entries_per_sector = SECTOR_SIZE / DIR_ENTRY_SIZE;
        let start_index = sector_offset as usize * entries_per_sector;

        for (i, raw) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
            // Slot 0 holds the volume label
            if sector_offset == 0 && i == 0 {
                continue;
            }
            let Ok(new_entry) = DirEntry::read_from_bytes(raw) else {
                continue;
            };
            let index = start_index + i;
            let old_entry = self.dir[index];
            if old_entry == new_entry {
                continue;
            }

            let file = FileHandle(index as u8);
            let start_sector = self.start_sector(&new_entry);
            let event = |change, filename| FileEvent {
                change,
                filename,
                file,
                entry: new_entry,
                start_sector,
            };

            on_change(event(FileChange::Changed, new_entry.filename));
            if new_entry.filename.0[0] == DELETED_MARKER {
                on_change(event(FileChange::Deleted, old_entry.filename));
            } else if old_entry.filename != new_entry.filename && new_entry.filename.is_valid() {
                on_change(event(FileChange::Created, new_entry.filename));
            }
        }

        for (slot, raw) in self.dir[start_index..]
            .iter_mut()
            .zip(data.chunks_exact(DIR_ENTRY_SIZE))
        {
            if let Ok(entry) = DirEntry::read_from_bytes(raw) {
                *slot = entry;
            }
        }
    }
}

impl Default for VirtualFs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;
    use std::vec::Vec as StdVec;

    const DISK_SIZE: u32 = 64 * 1024 * 1024;

    fn label() -> Filename {
        Filename::new(*b"DAPLINK    ")
    }

    fn contents(file: FileHandle, offset: u32, buf: &mut [u8]) {
        if offset == 0 {
            buf[0] = b'A' + file.0;
        }
    }

    fn volume() -> (VirtualFs, FileHandle, FileHandle) {
        let mut fs = VirtualFs::new();
        fs.init(&label(), DISK_SIZE);
        let details = fs.create_file(Filename::new(*b"DETAILS TXT"), 600).unwrap();
        let big = fs.create_file(Filename::new(*b"BIG     BIN"), 0x2100).unwrap();
        (fs, details, big)
    }

    fn read_dir_sector(fs: &VirtualFs) -> StdVec<u8> {
        let mut buf = vec![0u8; SECTOR_SIZE];
        fs.read(fs.mbr().root_dir_start(), &mut buf, &contents);
        buf
    }

    fn events_for(fs: &mut VirtualFs, dir: &[u8]) -> StdVec<FileEvent> {
        let mut events = StdVec::new();
        let sector = fs.mbr().root_dir_start();
        fs.write(sector, dir, &mut |e| events.push(e));
        events
    }

    #[test]
    fn test_geometry() {
        let (fs, _, _) = volume();
        let mbr = fs.mbr();
        assert_eq!(mbr.total_logical_sectors.get(), 0);
        assert_eq!(mbr.big_sectors_on_drive.get(), 131_200);
        assert_eq!(mbr.logical_sectors_per_fat.get(), 65);
        assert_eq!(fs.total_size(), 131_200 * 512);
        assert_eq!(mbr.data_start(), 1 + 2 * 65 + 2);

        let mut small = VirtualFs::new();
        small.init(&label(), 0);
        assert_eq!(small.mbr().total_logical_sectors.get(), (4186 * 8) as u16);
        assert_eq!(small.mbr().big_sectors_on_drive.get(), 0);
    }

    #[test]
    fn test_fat_chain() {
        let (fs, details, big) = volume();
        let mut fat = vec![0u8; SECTOR_SIZE];
        fs.read(1, &mut fat, &contents);
        let entry = |i: usize| u16::from_le_bytes([fat[i * 2], fat[i * 2 + 1]]);
        assert_eq!(entry(0), 0xFFF8);
        assert_eq!(entry(1), 0xFFFF);
        assert_eq!(fs.entry(details).first_cluster(), 2);
        assert_eq!(entry(2), 0xFFFF);
        // Three clusters for 0x2100 bytes
        assert_eq!(fs.entry(big).first_cluster(), 3);
        assert_eq!((entry(3), entry(4), entry(5)), (4, 5, 0xFFFF));
        assert_eq!(entry(6), 0);

        // Second FAT copy mirrors the first sector
        let mut fat2 = vec![0u8; SECTOR_SIZE];
        fs.read(1 + 65, &mut fat2, &contents);
        assert_eq!(fat, fat2);
    }

    #[test]
    fn test_sectors_at_end_of_range() {
        let (mut fs, _, _) = volume();
        let mut buf = vec![0xAAu8; SECTOR_SIZE * 3];
        fs.read(u32::MAX - 1, &mut buf, &contents);
        assert!(buf.iter().all(|&b| b == 0));

        let before = read_dir_sector(&fs);
        let mut events = StdVec::new();
        fs.write(u32::MAX, &[0x41u8; SECTOR_SIZE * 2], &mut |e| events.push(e));
        assert!(events.is_empty());
        assert_eq!(read_dir_sector(&fs), before);
    }

    #[test]
    fn test_read_spanning_regions() {
        let (fs, details, big) = volume();
        let data_start = fs.mbr().data_start();
        let mut buf = vec![0xAAu8; SECTOR_SIZE * 4];
        // Last root dir sector, then DETAILS.TXT
        fs.read(data_start - 1, &mut buf, &contents);
        assert!(buf[..SECTOR_SIZE].iter().all(|&b| b == 0));
        assert_eq!(buf[SECTOR_SIZE], b'A' + details.0);
        assert_eq!(buf[2 * SECTOR_SIZE], 0);

        let big_start = fs.start_sector(fs.entry(big)).unwrap();
        assert_eq!(big_start, data_start + SECTORS_PER_CLUSTER);
        fs.read(big_start, &mut buf, &contents);
        assert_eq!(buf[0], b'A' + big.0);

        let mut mbr = vec![0u8; SECTOR_SIZE];
        fs.read(0, &mut mbr, &contents);
        assert_eq!(&mbr[510..], &[0x55, 0xAA]);
    }

    #[test]
    fn test_root_dir_contents() {
        let (fs, _, _) = volume();
        let dir = read_dir_sector(&fs);
        let label_entry = DirEntry::read_from_bytes(&dir[..32]).unwrap();
        assert_eq!(label_entry.filename, label());
        assert_eq!(label_entry.attr(), FileAttr::VOLUME_LABEL | FileAttr::ARCHIVE);
        let details = DirEntry::read_from_bytes(&dir[32..64]).unwrap();
        assert_eq!(details.filename, Filename::new(*b"DETAILS TXT"));
        assert_eq!(details.size(), 600);
        assert!(dir[96..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_create_change_delete() {
        let (mut fs, _, _) = volume();
        let mut dir = read_dir_sector(&fs);

        // Host adds FIRM.BIN in slot 3 without a size yet
        let mut entry = DirEntry::file(Filename::new(*b"FIRM    BIN"), 0, 0);
        entry.attributes = FileAttr::ARCHIVE.bits();
        dir[96..128].copy_from_slice(entry.as_bytes());
        let events = events_for(&mut fs, &dir);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].change, FileChange::Changed);
        assert_eq!(events[1].change, FileChange::Created);
        assert_eq!(events[1].file.index(), 3);
        assert_eq!(events[1].start_sector, None);

        // Size and cluster filled in
        entry.first_cluster_low_16 = U16::new(6);
        entry.filesize.set(0x1000);
        dir[96..128].copy_from_slice(entry.as_bytes());
        let events = events_for(&mut fs, &dir);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change, FileChange::Changed);
        assert_eq!(
            events[0].start_sector,
            Some(fs.mbr().data_start() + 4 * SECTORS_PER_CLUSTER)
        );

        // Unchanged write is silent
        assert!(events_for(&mut fs, &dir).is_empty());

        dir[96] = DELETED_MARKER;
        let events = events_for(&mut fs, &dir);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].change, FileChange::Deleted);
        assert_eq!(events[1].filename, Filename::new(*b"FIRM    BIN"));
    }

    #[test]
    fn test_label_slot_and_invalid_names_ignored() {
        let (mut fs, _, _) = volume();
        let mut dir = read_dir_sector(&fs);
        dir[0..11].copy_from_slice(b"NEWLABEL   ");
        let entry = DirEntry::file(Filename::new(*b"lower   txt"), 0, 0);
        dir[128..160].copy_from_slice(entry.as_bytes());
        let events = events_for(&mut fs, &dir);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change, FileChange::Changed);
    }

    #[test]
    fn test_directory_full() {
        let mut fs = VirtualFs::new();
        fs.init(&label(), DISK_SIZE);
        for i in 0..MAX_FILES {
            let mut name = *b"FILE00  TXT";
            name[4] = b'0' + (i / 10) as u8;
            name[5] = b'0' + (i % 10) as u8;
            fs.create_file(Filename::new(name), 10).unwrap();
        }
        assert_eq!(
            fs.create_file(Filename::new(*b"EXTRA   TXT"), 10),
            Err(Error::Internal)
        );
        assert_eq!(
            VirtualFs::new().create_file(Filename::new(*b"bad     txt"), 0),
            Err(Error::Internal)
        );
    }
}
