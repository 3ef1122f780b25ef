//! The drag-and-drop update pipeline
//!
//! [`FirmwareUpdatePipeline`] owns every piece of the update path: the
//! virtual volume, the generated user files, the transfer tracker with its
//! file stream, decoder and flash manager, and the two flash devices. The
//! USB mass-storage glue calls [`read_sectors`](FirmwareUpdatePipeline::read_sectors)
//! and [`write_sectors`](FirmwareUpdatePipeline::write_sectors), and a timer
//! calls [`periodic`](FirmwareUpdatePipeline::periodic) every
//! [`VfsTimings::tick`] milliseconds. Other threads only reach it through the
//! borrowed [`SyncState`].

use crate::config::{BoardConfig, Settings, VfsTimings};
use crate::error::Result;
use crate::flash::{FlashBank, FlashInterface};
use crate::host::SectorDevice;
use crate::stream::{StreamStatus, StreamType};
use crate::vfs::fat::SECTOR_SIZE;
use crate::vfs::manager::{
    LinkState, SyncState, TransferPhase, TransferState, Transition, VfsManager,
};
use crate::vfs::user::{AssertInfo, UserContext, UserFiles};
use crate::vfs::VirtualFs;

/// Block device parameters reported to the USB host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MscParams {
    /// Capacity in bytes
    pub memory_size: u32,
    /// Bytes per block
    pub block_size: u32,
    /// Blocks per transfer group
    pub block_group: u32,
    /// Number of blocks
    pub block_count: u32,
}

/// Virtual drive plus flash update path for one HIC
pub struct FirmwareUpdatePipeline<'s, T, I> {
    board: BoardConfig,
    settings: Settings,
    target: T,
    iap: I,
    fs: VirtualFs,
    user: UserFiles,
    vfs: VfsManager,
    sync: &'s SyncState,
}

impl<'s, T: FlashInterface, I: FlashInterface> FirmwareUpdatePipeline<'s, T, I> {
    /// Assemble a pipeline; nothing is presented until [`init`](Self::init)
    pub fn new(
        board: BoardConfig,
        settings: Settings,
        timings: VfsTimings,
        target: T,
        iap: I,
        sync: &'s SyncState,
    ) -> Self {
        let mut vfs = VfsManager::new(timings);
        vfs.stream_mut()
            .decoder_mut()
            .manager_mut()
            .set_page_erase(settings.page_erase);
        Self {
            board,
            settings,
            target,
            iap,
            fs: VirtualFs::new(),
            user: UserFiles::new(),
            vfs,
            sync,
        }
    }

    /// Build the drive and either present it at once or keep it hidden
    /// until [`SyncState::fs_enable`]
    pub fn init(&mut self, enable: bool) -> Result<()> {
        log::debug!("pipeline: init enable={}", enable);
        self.build_filesystem()?;
        let state = if enable {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        self.sync.reset(state);
        self.vfs.set_media_ready(enable);
        Ok(())
    }

    fn build_filesystem(&mut self) -> Result<()> {
        self.vfs.reset_transfer();
        let assert = self.sync.assert_info();
        self.user.build(
            &mut self.fs,
            &self.board,
            &self.settings,
            self.vfs.transfer_status(),
            assert.as_ref(),
        )
    }

    /// Advance the link timer by `elapsed_ms`
    ///
    /// Leaving [`LinkState::Connected`] ends any unfinished transfer;
    /// entering it rebuilds the drive so the host sees fresh files.
    pub fn periodic(&mut self, elapsed_ms: u32) -> Option<Transition> {
        let transition = self.vfs.tick(elapsed_ms, self.sync)?;

        if transition.from == LinkState::Connected {
            let mut bank =
                FlashBank::new(&self.board, &self.settings, &mut self.target, &mut self.iap);
            self.vfs.abort_transfer(&mut bank, self.sync);
            let status = self.vfs.transfer_status();
            self.user.disconnecting(&self.board, &self.settings, status);
        }

        match transition.to {
            LinkState::Disconnected | LinkState::Reconnecting => {
                self.vfs.set_media_ready(false);
            }
            LinkState::Connected => {
                if let Err(e) = self.build_filesystem() {
                    log::error!("pipeline: building the drive failed: {}", e);
                }
                self.vfs.set_media_ready(true);
            }
        }
        Some(transition)
    }

    /// Serve a host read; zeros while the media is not ready
    pub fn read_sectors(&self, sector: u32, buf: &mut [u8]) {
        if !self.vfs.media_ready() {
            buf.fill(0);
            return;
        }
        self.fs.read(sector, buf, &self.user);
    }

    /// Take a host write
    ///
    /// Directory sectors are interpreted first, then the data is offered to
    /// the transfer. Nothing happens once the transfer has finished until
    /// the next remount.
    pub fn write_sectors(&mut self, sector: u32, buf: &[u8]) {
        if !self.vfs.media_ready() {
            return;
        }
        self.vfs.touch();
        if self.vfs.transfer().phase == TransferPhase::Finished {
            return;
        }
        log::trace!(
            "pipeline: write sector {} count {}",
            sector,
            buf.len() / SECTOR_SIZE
        );

        let Self {
            board,
            settings,
            target,
            iap,
            fs,
            user,
            vfs,
            sync,
        } = self;
        let board = &*board;
        let sync: &SyncState = *sync;

        fs.write(sector, buf, &mut |event| {
            let ctx = UserContext {
                board,
                settings: &mut *settings,
                target: &mut *target,
                flash_manager: vfs.stream_mut().decoder_mut().manager_mut(),
                sync,
            };
            user.file_change(&event, ctx);
            let mut bank = FlashBank::new(board, &*settings, &mut *target, &mut *iap);
            vfs.file_change(&event, &mut bank, sync);
        });

        if vfs.transfer().phase == TransferPhase::Finished {
            return;
        }
        let mut bank = FlashBank::new(board, settings, &mut *target, &mut *iap);
        vfs.file_data(&mut bank, sync, sector, buf);
    }

    /// Parameters for the mass-storage class driver
    pub fn msc_params(&self) -> MscParams {
        let memory_size = self.fs.total_size();
        let block_size = SECTOR_SIZE as u32;
        MscParams {
            memory_size,
            block_size,
            block_group: 1,
            block_count: memory_size / block_size,
        }
    }

    /// Whether the host may access the drive
    pub fn media_ready(&self) -> bool {
        self.vfs.media_ready()
    }

    /// Result of the last finished transfer
    pub fn transfer_status(&self) -> Result<()> {
        self.vfs.transfer_status()
    }

    /// Bookkeeping of the current transfer
    pub fn transfer(&self) -> &TransferState {
        self.vfs.transfer()
    }

    /// Board description
    pub fn board(&self) -> &BoardConfig {
        &self.board
    }

    /// Current settings, including changes made through magic files
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Target flash device
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Mutable access to the target flash device
    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    /// HIC flash device
    pub fn iap(&self) -> &I {
        &self.iap
    }

    /// Mutable access to the HIC flash device
    pub fn iap_mut(&mut self) -> &mut I {
        &mut self.iap
    }

    /// The fabricated volume
    pub fn filesystem(&self) -> &VirtualFs {
        &self.fs
    }

    /// Request the drive to appear or go away
    pub fn fs_enable(&self, enable: bool) {
        self.sync.fs_enable(enable);
    }

    /// Request an eject and re-present of the drive
    pub fn fs_remount(&self) {
        self.sync.fs_remount();
    }

    /// Record an assertion; `ASSERT.TXT` appears after the remount
    pub fn record_assert(&self, info: AssertInfo) -> bool {
        self.sync.record_assert(info)
    }

    /// Track the reset button
    pub fn set_reset_button_pressed(&mut self, pressed: bool) {
        self.user.set_reset_button_pressed(pressed);
    }

    /// `true` once if a disconnect asked for the HIC to reset
    pub fn take_reset_request(&mut self) -> bool {
        self.user.take_reset_request()
    }

    /// Open a stream without going through the drive
    ///
    /// Used by the vendor command channel; must not overlap a transfer
    /// through the drive.
    pub fn stream_open(&mut self, ty: StreamType) -> Result<()> {
        self.vfs.stream_mut().open(ty)
    }

    /// Feed data to a stream opened with [`stream_open`](Self::stream_open)
    pub fn stream_write(&mut self, data: &[u8]) -> Result<StreamStatus> {
        let mut bank = FlashBank::new(&self.board, &self.settings, &mut self.target, &mut self.iap);
        self.vfs.stream_mut().write(&mut bank, data)
    }

    /// Close a stream opened with [`stream_open`](Self::stream_open)
    pub fn stream_close(&mut self) -> Result<()> {
        let mut bank = FlashBank::new(&self.board, &self.settings, &mut self.target, &mut self.iap);
        self.vfs.stream_mut().close(&mut bank)
    }

    /// Switch between sector-by-sector and whole-chip erase
    pub fn set_page_erase(&mut self, enabled: bool) {
        self.settings.page_erase = enabled;
        self.vfs
            .stream_mut()
            .decoder_mut()
            .manager_mut()
            .set_page_erase(enabled);
    }
}

impl<T: FlashInterface, I: FlashInterface> SectorDevice for FirmwareUpdatePipeline<'_, T, I> {
    fn read_sectors(&mut self, sector: u32, buf: &mut [u8]) {
        FirmwareUpdatePipeline::read_sectors(self, sector, buf)
    }

    fn write_sectors(&mut self, sector: u32, buf: &[u8]) {
        FirmwareUpdatePipeline::write_sectors(self, sector, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::flash::validation::BUILD_KEY_BL;
    use crate::host::{HostFs, WriteOrder};
    use crate::flash::iap::ProtectedIapFlash;
    use crate::testutil::{bootloader_image, vector_table, MockFlash, Op, RamIap};
    use crate::vfs::fat::Filename;
    use std::string::String as StdString;
    use std::vec;
    use std::vec::Vec;

    type TestPipeline<'s> = FirmwareUpdatePipeline<'s, MockFlash, MockFlash>;

    fn pipeline(sync: &SyncState, settings: Settings) -> TestPipeline<'_> {
        let mut p = FirmwareUpdatePipeline::new(
            BoardConfig::example(),
            settings,
            VfsTimings::default(),
            MockFlash::new(0, 0x4_0000, 0x1000, 0x100),
            MockFlash::new(0, 0x8_0000, 0x2000, 0x20),
            sync,
        );
        p.init(true).unwrap();
        p
    }

    type IapPipeline<'s> = FirmwareUpdatePipeline<'s, MockFlash, ProtectedIapFlash<RamIap>>;

    /// Interface firmware running from its own region of a RAM-backed HIC flash
    fn iap_pipeline(sync: &SyncState) -> IapPipeline<'_> {
        let board = BoardConfig::example();
        let mut backend = RamIap::new();
        let intf = board.interface.start as usize;
        backend.mem[intf..intf + 0x40].copy_from_slice(&vector_table());
        let iap = ProtectedIapFlash::new(&board, backend);
        let settings = Settings {
            automation_allowed: true,
            ..Settings::default()
        };
        let mut p = FirmwareUpdatePipeline::new(
            board,
            settings,
            VfsTimings::default(),
            MockFlash::new(0, 0x4_0000, 0x1000, 0x100),
            iap,
            sync,
        );
        p.init(true).unwrap();
        p
    }

    fn name(s: &str) -> Filename {
        Filename::from_dotted(s).unwrap()
    }

    /// Tick until the drive is presented again
    fn settle<T: FlashInterface, I: FlashInterface>(p: &mut FirmwareUpdatePipeline<'_, T, I>) {
        for _ in 0..1000 {
            if let Some(t) = p.periodic(90) {
                if t.to == LinkState::Connected {
                    return;
                }
            }
        }
        panic!("drive did not come back");
    }

    fn read_text<T: FlashInterface, I: FlashInterface>(
        p: &mut FirmwareUpdatePipeline<'_, T, I>,
        file: &str,
    ) -> Option<StdString> {
        let mut host = HostFs::mount(p).unwrap();
        let mut out = vec![0u8; 4096];
        let len = host.read_file(&name(file), &mut out).ok()?;
        Some(StdString::from_utf8(out[..len].to_vec()).unwrap())
    }

    fn bin_image(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        data[..0x40].copy_from_slice(&vector_table());
        for (i, b) in data.iter_mut().enumerate().skip(0x40) {
            *b = (i * 13 / 7) as u8;
        }
        data
    }

    fn hex_record(out: &mut Vec<u8>, addr: u16, ty: u8, data: &[u8], corrupt: bool) {
        let mut bytes = vec![data.len() as u8];
        bytes.extend_from_slice(&addr.to_be_bytes());
        bytes.push(ty);
        bytes.extend_from_slice(data);
        let sum = bytes.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        let checksum = sum.wrapping_neg().wrapping_add(corrupt as u8);
        bytes.push(checksum);
        out.push(b':');
        for b in bytes {
            out.extend_from_slice(std::format!("{:02X}", b).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
    }

    #[test]
    fn test_bin_round_trip() {
        let sync = SyncState::new();
        let mut p = pipeline(&sync, Settings::default());
        let image = bin_image(64 * 1024);

        let mut host = HostFs::mount(&mut p).unwrap();
        host.create_file(name("FIRM.BIN"), &image, WriteOrder::DataFirst)
            .unwrap();
        assert_eq!(p.transfer().phase, TransferPhase::CanBeFinished);

        settle(&mut p);
        assert_eq!(p.transfer_status(), Ok(()));
        assert_eq!(p.target().read(0, image.len()), &image[..]);

        let mut next = 0;
        for (addr, len) in p.target().programs() {
            assert_eq!(addr, next);
            next += len as u32;
        }
        assert_eq!(next, image.len() as u32);
        assert_eq!(p.target().ops[1], Op::EraseChip);
        assert!(p.target().ops.ends_with(&[Op::Uninit]));

        assert!(read_text(&mut p, "FAIL.TXT").is_none());
        let details = read_text(&mut p, "DETAILS.TXT").unwrap();
        assert!(details.contains("Remount count: 1\r\n"));
    }

    #[test]
    fn test_directory_first_transfer() {
        let sync = SyncState::new();
        let mut p = pipeline(&sync, Settings::default());
        let image = bin_image(8 * 1024);

        let mut host = HostFs::mount(&mut p).unwrap();
        host.create_file(name("FIRM.BIN"), &image, WriteOrder::DirectoryFirst)
            .unwrap();

        settle(&mut p);
        assert_eq!(p.transfer_status(), Ok(()));
        assert_eq!(p.target().read(0, image.len()), &image[..]);
    }

    #[test]
    fn test_hex_checksum_failure() {
        let sync = SyncState::new();
        let mut p = pipeline(&sync, Settings::default());

        let mut data = vec![0u8; 0x410];
        data[..0x40].copy_from_slice(&vector_table());
        for (i, b) in data.iter_mut().enumerate().skip(0x40) {
            *b = i as u8;
        }
        let mut hex = Vec::new();
        hex_record(&mut hex, 0, 4, &[0, 0], false);
        let records = data.chunks(16).count();
        for (i, chunk) in data.chunks(16).enumerate() {
            hex_record(&mut hex, (i * 16) as u16, 0, chunk, i == records - 1);
        }
        // Push the end of file record into a later sector
        while hex.len() < 8 * SECTOR_SIZE {
            hex_record(&mut hex, 0, 4, &[0, 0], false);
        }
        hex_record(&mut hex, 0, 1, &[], false);

        let mut host = HostFs::mount(&mut p).unwrap();
        host.create_file(name("FIRM.HEX"), &hex, WriteOrder::DataFirst)
            .unwrap();
        assert_eq!(p.transfer().phase, TransferPhase::Finished);
        assert_eq!(p.transfer_status(), Err(Error::HexCksum));

        // Nothing at or past the corrupted record reached the flash
        for (addr, len) in p.target().programs() {
            assert!(addr + len as u32 <= 0x400, "program at 0x{:X}", addr);
        }
        assert_eq!(p.target().read(0, 0x40), &vector_table());
        assert!(p.target().ops.contains(&Op::Uninit));

        settle(&mut p);
        let fail = read_text(&mut p, "FAIL.TXT").unwrap();
        assert!(fail.starts_with("error: "));
        assert!(fail.contains(Error::HexCksum.message()));
        assert!(fail.contains("type: "));
    }

    #[test]
    fn test_out_of_order_sector_times_out() {
        let sync = SyncState::new();
        let mut p = pipeline(&sync, Settings::default());
        let image = bin_image(16 * SECTOR_SIZE);
        let start = p.filesystem().mbr().data_start() + 64;
        fn sector(image: &[u8], n: usize) -> &[u8] {
            &image[n * SECTOR_SIZE..(n + 1) * SECTOR_SIZE]
        }

        for n in 0..=3 {
            p.write_sectors(start + n as u32, sector(&image, n));
        }
        p.write_sectors(start + 5, sector(&image, 5));
        assert_eq!(p.transfer().last_ooo_sector, Some(start + 4));
        assert_eq!(p.transfer().file_next_sector, start + 4);
        assert_eq!(p.transfer().size_processed, 4 * SECTOR_SIZE as u32);

        settle(&mut p);
        assert_eq!(p.transfer_status(), Err(Error::OooSector));
        let skipped = 5 * SECTOR_SIZE as u32;
        assert!(p.target().read(skipped, SECTOR_SIZE).iter().all(|&b| b == 0xFF));
        assert_eq!(p.target().read(0, 4 * SECTOR_SIZE), &image[..4 * SECTOR_SIZE]);
        assert!(read_text(&mut p, "FAIL.TXT").is_some());
    }

    #[test]
    fn test_bootloader_image_needs_automation() {
        let sync = SyncState::new();
        let settings = Settings {
            automation_allowed: false,
            ..Settings::default()
        };
        let mut p = pipeline(&sync, settings);

        let mut image = vec![0u8; 4 * SECTOR_SIZE];
        image[0x20..0x24].copy_from_slice(&BUILD_KEY_BL.to_le_bytes());
        let hic_id = p.board().hic_id;
        image[0x24..0x28].copy_from_slice(&hic_id.to_le_bytes());

        let mut host = HostFs::mount(&mut p).unwrap();
        host.create_file(name("BOOT.BIN"), &image, WriteOrder::DataFirst)
            .unwrap();
        assert_eq!(p.transfer_status(), Err(Error::FdUnsupportedUpdate));
        assert!(p.iap().ops.is_empty());
        assert!(p.target().ops.is_empty());
    }

    #[test]
    fn test_bootloader_update_through_drive() {
        let sync = SyncState::new();
        let mut p = iap_pipeline(&sync);
        let image = bootloader_image(p.board());

        let mut host = HostFs::mount(&mut p).unwrap();
        host.create_file(name("BOOT.BIN"), &image, WriteOrder::DataFirst)
            .unwrap();
        assert_eq!(p.transfer().phase, TransferPhase::Finished);
        assert_eq!(p.transfer_status(), Ok(()));
        assert!(p.iap().update_complete());
        assert_eq!(&p.iap().backend().mem[..image.len()], &image[..]);
        // The running interface is left alone
        let intf = p.board().interface.start as usize;
        assert_eq!(&p.iap().backend().mem[intf..intf + 0x40], &vector_table());
        assert!(p.target().ops.is_empty());

        settle(&mut p);
        assert!(read_text(&mut p, "FAIL.TXT").is_none());
    }

    #[test]
    fn test_bootloader_bad_crc_through_drive() {
        let sync = SyncState::new();
        let mut p = iap_pipeline(&sync);
        let mut image = bootloader_image(p.board());
        let last = image.len() - 1;
        image[last] ^= 0xFF;

        let mut host = HostFs::mount(&mut p).unwrap();
        host.create_file(name("BOOT.BIN"), &image, WriteOrder::DataFirst)
            .unwrap();
        assert_eq!(p.transfer().phase, TransferPhase::Finished);
        assert_eq!(p.transfer_status(), Err(Error::BlUpdtBadCrc));
        assert!(!p.iap().update_complete());
        // The first sector still boots the interface
        assert_eq!(&p.iap().backend().mem[..0x20], &vector_table()[..0x20]);
        assert!(p.target().ops.is_empty());

        settle(&mut p);
        let fail = read_text(&mut p, "FAIL.TXT").unwrap();
        assert!(fail.contains(Error::BlUpdtBadCrc.message()));
    }

    #[test]
    fn test_hidden_until_enabled() {
        let sync = SyncState::new();
        let mut p = pipeline(&sync, Settings::default());
        p.init(false).unwrap();
        assert!(!p.media_ready());

        let mut buf = [0xAAu8; SECTOR_SIZE];
        p.read_sectors(0, &mut buf);
        assert!(buf.iter().all(|&b| b == 0));
        assert!(HostFs::mount(&mut p).is_err());

        p.fs_enable(true);
        settle(&mut p);
        assert!(p.media_ready());
        let params = p.msc_params();
        assert_eq!(params.block_size, 512);
        assert_eq!(params.block_count * 512, params.memory_size);
        let host = HostFs::mount(&mut p).unwrap();
        assert_eq!(host.label(), Some(Filename::new(*b"DAPLINK    ")));
        assert!(host.find(&name("DETAILS.TXT")).is_some());
    }

    #[test]
    fn test_magic_file_through_drive() {
        let sync = SyncState::new();
        let mut p = pipeline(&sync, Settings::default());

        let mut host = HostFs::mount(&mut p).unwrap();
        host.create_file(Filename::new(*b"MSD_OFF CFG"), &[], WriteOrder::DataFirst)
            .unwrap();
        assert!(p.settings().msd_disabled);
        assert_eq!(sync.next_link_state(), LinkState::Reconnecting);

        settle(&mut p);
        assert!(p.take_reset_request());
        assert!(!p.take_reset_request());
        assert_eq!(p.transfer_status(), Ok(()));
    }

    #[test]
    fn test_assert_file_lifecycle() {
        let sync = SyncState::new();
        let mut p = pipeline(&sync, Settings::default());

        assert!(p.record_assert(AssertInfo::new("flash.rs", 77).with_hexdumps(&[0xDEAD_BEEF])));
        settle(&mut p);
        let text = read_text(&mut p, "ASSERT.TXT").unwrap();
        assert!(text.contains("File: flash.rs\r\n"));
        assert!(text.contains("deadbeef"));

        let mut host = HostFs::mount(&mut p).unwrap();
        host.delete_file(&name("ASSERT.TXT")).unwrap();
        assert!(sync.assert_info().is_none());

        settle(&mut p);
        assert!(read_text(&mut p, "ASSERT.TXT").is_none());
    }

    #[test]
    fn test_vendor_stream() {
        let sync = SyncState::new();
        let mut p = pipeline(&sync, Settings::default());
        let image = bin_image(0x2000);

        p.set_page_erase(true);
        assert!(p.settings().page_erase);
        p.stream_open(StreamType::Bin).unwrap();
        for chunk in image.chunks(0x400) {
            assert_eq!(p.stream_write(chunk).unwrap(), StreamStatus::DoneOrContinue);
        }
        p.stream_close().unwrap();

        assert_eq!(p.target().read(0, image.len()), &image[..]);
        assert!(p.target().ops.contains(&Op::EraseSector(0x1000)));
        assert!(!p.target().ops.contains(&Op::EraseChip));
    }
}
