//! A USB host's view of the drive
//!
//! [`HostFs`] drives any [`SectorDevice`] the way an operating system's FAT
//! driver would: it reads the boot record and root directory once at mount,
//! allocates clusters after the ones in use, and writes file data, FAT and
//! directory sectors in a chosen [`WriteOrder`]. The pipeline implements
//! [`SectorDevice`], so this is enough to copy firmware onto it in tests and
//! from the command line.

use core::fmt;

use zerocopy::{FromBytes, FromZeros, IntoBytes};

use crate::vfs::fat::{
    DirEntry, FileAttr, Filename, Mbr, CLUSTER_SIZE, DELETED_MARKER, DIR_ENTRY_SIZE,
    ROOT_DIR_ENTRIES, SECTOR_SIZE,
};

/// Block device seen by the host
pub trait SectorDevice {
    /// Read whole sectors starting at `sector`
    fn read_sectors(&mut self, sector: u32, buf: &mut [u8]);
    /// Write whole sectors starting at `sector`
    fn write_sectors(&mut self, sector: u32, buf: &[u8]);
}

impl<D: SectorDevice + ?Sized> SectorDevice for &mut D {
    fn read_sectors(&mut self, sector: u32, buf: &mut [u8]) {
        (**self).read_sectors(sector, buf)
    }

    fn write_sectors(&mut self, sector: u32, buf: &[u8]) {
        (**self).write_sectors(sector, buf)
    }
}

/// Host side failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// Sector 0 is not a FAT boot record
    NotFormatted,
    /// No free root directory slot
    DirectoryFull,
    /// No such file
    NotFound,
    /// Not enough free clusters
    NoSpace,
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::NotFormatted => write!(f, "drive is not FAT formatted"),
            HostError::DirectoryFull => write!(f, "root directory is full"),
            HostError::NotFound => write!(f, "file not found"),
            HostError::NoSpace => write!(f, "drive is full"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for HostError {}

/// Order in which a new file reaches the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteOrder {
    /// Data, then FAT, then the directory entry
    #[default]
    DataFirst,
    /// Empty directory entry, data, FAT, then the final entry
    DirectoryFirst,
    /// Like [`DataFirst`](Self::DataFirst) with data sector `n + 1` sent
    /// before sector `n`
    Swap(u32),
}

/// Mounted drive
pub struct HostFs<D> {
    dev: D,
    mbr: Mbr,
    dir: [DirEntry; ROOT_DIR_ENTRIES],
    next_free_cluster: u32,
}

impl<D: SectorDevice> HostFs<D> {
    /// Read the boot record, first FAT sector and root directory
    pub fn mount(mut dev: D) -> Result<Self, HostError> {
        let mut sector = [0u8; SECTOR_SIZE];
        dev.read_sectors(0, &mut sector);
        let mbr = Mbr::read_from_bytes(&sector).map_err(|_| HostError::NotFormatted)?;
        if mbr.signature.get() != 0xAA55
            || usize::from(mbr.bytes_per_sector.get()) != SECTOR_SIZE
            || mbr.sectors_per_cluster == 0
        {
            return Err(HostError::NotFormatted);
        }

        let mut dir = [DirEntry::new_zeroed(); ROOT_DIR_ENTRIES];
        let mut raw = [0u8; ROOT_DIR_ENTRIES * DIR_ENTRY_SIZE];
        dev.read_sectors(mbr.root_dir_start(), &mut raw);
        for (entry, bytes) in dir.iter_mut().zip(raw.chunks_exact(DIR_ENTRY_SIZE)) {
            if let Ok(e) = DirEntry::read_from_bytes(bytes) {
                *entry = e;
            }
        }

        // Allocate after the last used cluster of the first FAT sector
        dev.read_sectors(mbr.fat_start(), &mut sector);
        let used = sector
            .chunks_exact(2)
            .rposition(|e| e.iter().any(|&b| b != 0))
            .map_or(2, |i| i as u32 + 1);
        let next_free_cluster = used.max(2);

        log::debug!(
            "host: mounted {} sectors, next free cluster {}",
            mbr.total_sectors(),
            next_free_cluster
        );
        Ok(Self {
            dev,
            mbr,
            dir,
            next_free_cluster,
        })
    }

    /// Boot record of the mounted drive
    pub fn mbr(&self) -> &Mbr {
        &self.mbr
    }

    /// Release the device
    pub fn into_inner(self) -> D {
        self.dev
    }

    /// Files and the volume label, in directory order
    pub fn entries(&self) -> impl Iterator<Item = &DirEntry> {
        self.dir.iter().filter(|e| !e.is_free())
    }

    /// Volume label
    pub fn label(&self) -> Option<Filename> {
        self.entries()
            .find(|e| e.attr().contains(FileAttr::VOLUME_LABEL))
            .map(|e| e.filename)
    }

    /// Directory entry of `name`
    pub fn find(&self, name: &Filename) -> Option<&DirEntry> {
        self.entries()
            .find(|e| e.filename == *name && !e.attr().contains(FileAttr::VOLUME_LABEL))
    }

    /// Read `name` into `out`, returning the file size
    ///
    /// Only `out.len()` bytes are read if the file is larger. Files are
    /// assumed to be contiguous.
    pub fn read_file(&mut self, name: &Filename, out: &mut [u8]) -> Result<usize, HostError> {
        let entry = *self.find(name).ok_or(HostError::NotFound)?;
        let size = entry.size() as usize;
        let Some(start) = self.mbr.cluster_to_sector(entry.first_cluster()) else {
            return Ok(size);
        };

        let mut sector = [0u8; SECTOR_SIZE];
        let len = size.min(out.len());
        for (i, chunk) in out[..len].chunks_mut(SECTOR_SIZE).enumerate() {
            self.dev.read_sectors(start + i as u32, &mut sector);
            chunk.copy_from_slice(&sector[..chunk.len()]);
        }
        Ok(size)
    }

    /// Copy `data` onto the drive as `name`
    pub fn create_file(
        &mut self,
        name: Filename,
        data: &[u8],
        order: WriteOrder,
    ) -> Result<(), HostError> {
        let slot = self
            .dir
            .iter()
            .position(|e| e.is_free())
            .ok_or(HostError::DirectoryFull)?;

        let clusters = (data.len() as u32).div_ceil(CLUSTER_SIZE);
        let first_cluster = if clusters == 0 { 0 } else { self.next_free_cluster };
        let start_sector = match self.mbr.cluster_to_sector(first_cluster) {
            Some(sector) if clusters > 0 => {
                let end = sector + clusters * self.mbr.sectors_per_cluster as u32;
                if end > self.mbr.total_sectors() {
                    return Err(HostError::NoSpace);
                }
                Some(sector)
            }
            _ => None,
        };
        log::debug!(
            "host: creating {} ({} bytes) at cluster {} ({:?})",
            name,
            data.len(),
            first_cluster,
            order
        );

        let mut entry = DirEntry::file(name, first_cluster as u16, data.len() as u32);
        entry.attributes = FileAttr::ARCHIVE.bits();

        if order == WriteOrder::DirectoryFirst {
            let mut empty = entry;
            empty.first_cluster_low_16.set(0);
            empty.filesize.set(0);
            self.dir[slot] = empty;
            self.write_dir_sector(slot);
        }

        if let Some(start) = start_sector {
            let sectors = (data.len()).div_ceil(SECTOR_SIZE) as u32;
            let swap = match order {
                WriteOrder::Swap(n) if n + 1 < sectors => Some(n),
                _ => None,
            };
            let mut i = 0;
            while i < sectors {
                if swap == Some(i) {
                    self.write_data_sector(start, data, i + 1);
                    self.write_data_sector(start, data, i);
                    i += 2;
                } else {
                    self.write_data_sector(start, data, i);
                    i += 1;
                }
            }
            self.write_fat_chain(first_cluster, clusters);
            self.next_free_cluster += clusters;
        }

        self.dir[slot] = entry;
        self.write_dir_sector(slot);
        Ok(())
    }

    /// Mark `name` deleted
    pub fn delete_file(&mut self, name: &Filename) -> Result<(), HostError> {
        let slot = self
            .dir
            .iter()
            .position(|e| !e.is_free() && e.filename == *name)
            .ok_or(HostError::NotFound)?;
        self.dir[slot].filename.0[0] = DELETED_MARKER;
        self.write_dir_sector(slot);
        Ok(())
    }

    fn write_data_sector(&mut self, start: u32, data: &[u8], index: u32) {
        let mut sector = [0u8; SECTOR_SIZE];
        let offset = index as usize * SECTOR_SIZE;
        let chunk = &data[offset..(offset + SECTOR_SIZE).min(data.len())];
        sector[..chunk.len()].copy_from_slice(chunk);
        self.dev.write_sectors(start + index, &sector);
    }

    fn write_fat_chain(&mut self, first_cluster: u32, clusters: u32) {
        let per_sector = (SECTOR_SIZE / 2) as u32;
        let fat_sectors = u32::from(self.mbr.logical_sectors_per_fat.get());
        let last = first_cluster + clusters - 1;
        let mut sector = [0u8; SECTOR_SIZE];

        for fat_sector in first_cluster / per_sector..=last / per_sector {
            let lba = self.mbr.fat_start() + fat_sector;
            self.dev.read_sectors(lba, &mut sector);
            for cluster in first_cluster..=last {
                if cluster / per_sector != fat_sector {
                    continue;
                }
                let value: u16 = if cluster == last { 0xFFFF } else { cluster as u16 + 1 };
                let offset = (cluster % per_sector) as usize * 2;
                sector[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
            }
            for copy in 0..u32::from(self.mbr.num_fats) {
                self.dev.write_sectors(lba + copy * fat_sectors, &sector);
            }
        }
    }

    fn write_dir_sector(&mut self, slot: usize) {
        let per_sector = SECTOR_SIZE / DIR_ENTRY_SIZE;
        let index = slot / per_sector;
        let entries = &self.dir[index * per_sector..(index + 1) * per_sector];
        let lba = self.mbr.root_dir_start() + index as u32;
        self.dev.write_sectors(lba, entries.as_bytes());
    }
}
