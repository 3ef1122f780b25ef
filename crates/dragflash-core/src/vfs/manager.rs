//! Drive connection state and transfer tracking
//!
//! The [`VfsManager`] decides when the drive is presented to the host, when
//! it is ejected and re-presented (a "remount"), and whether the file the
//! host is copying has been fully programmed. It never reorders data: sectors
//! that do not arrive in sequence are recorded and dropped, and the transfer
//! is judged when it finishes or times out.
//!
//! Only [`SyncState`] is shared between threads. Every other entry point
//! takes `&mut self`, so all transfer bookkeeping happens on the thread that
//! owns the pipeline.

use spin::Mutex;

use crate::config::VfsTimings;
use crate::error::{Error, Result};
use crate::flash::FlashBank;
use crate::stream::{
    stream_start_identify, stream_type_from_name, FileStream, StreamStatus, StreamType,
};

use super::fat::{FileAttr, SECTOR_SIZE};
use super::filesystem::{FileChange, FileEvent, FileHandle};
use super::user::AssertInfo;

/// Presentation state of the drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Media not present
    Disconnected,
    /// Ejected for a remount, will come back
    Reconnecting,
    /// Media present
    Connected,
}

/// Progress of the current file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferPhase {
    /// Nothing recognised yet
    NotStarted,
    /// A file or stream has been identified
    InProgress,
    /// Everything announced has arrived; more may still follow
    CanBeFinished,
    /// Result recorded; nothing changes until the next remount
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LinkStates {
    current: LinkState,
    next: LinkState,
}

impl LinkStates {
    fn changing(&self) -> bool {
        self.current != self.next
    }
}

/// State that other threads may touch
///
/// Enable/disable and remount requests only set the desired link state; the
/// owning thread acts on them from [`VfsManager::tick`]. Assertions are kept
/// here too so they can be recorded from anywhere.
pub struct SyncState {
    link: Mutex<LinkStates>,
    assert: Mutex<Option<AssertInfo>>,
}

impl SyncState {
    /// Disconnected, no assertion recorded
    pub const fn new() -> Self {
        Self {
            link: Mutex::new(LinkStates {
                current: LinkState::Disconnected,
                next: LinkState::Disconnected,
            }),
            assert: Mutex::new(None),
        }
    }

    /// Request the drive to appear (`true`) or go away (`false`)
    pub fn fs_enable(&self, enable: bool) {
        let mut link = self.link.lock();
        if enable {
            if link.next == LinkState::Disconnected {
                link.next = LinkState::Connected;
            }
        } else {
            link.next = LinkState::Disconnected;
        }
    }

    /// Request an eject and re-present of the drive
    ///
    /// Ignored unless connected with no transition pending.
    pub fn fs_remount(&self) {
        let mut link = self.link.lock();
        if !link.changing() && link.current == LinkState::Connected {
            link.next = LinkState::Reconnecting;
        }
    }

    pub(crate) fn abort_remount(&self) {
        let mut link = self.link.lock();
        if link.next == LinkState::Reconnecting && link.current == LinkState::Connected {
            link.next = LinkState::Connected;
        }
    }

    pub(crate) fn reset(&self, state: LinkState) {
        let mut link = self.link.lock();
        link.current = state;
        link.next = state;
    }

    /// Current link state
    pub fn link_state(&self) -> LinkState {
        self.link.lock().current
    }

    /// Link state being moved to
    pub fn next_link_state(&self) -> LinkState {
        self.link.lock().next
    }

    /// `true` while a transition is pending
    pub fn changing_state(&self) -> bool {
        self.link.lock().changing()
    }

    /// Record an assertion and remount so `ASSERT.TXT` shows up
    ///
    /// Only the first assertion is kept until it is cleared. Returns whether
    /// `info` was stored.
    pub fn record_assert(&self, info: AssertInfo) -> bool {
        {
            let mut assert = self.assert.lock();
            if assert.is_some() {
                return false;
            }
            log::warn!("assert: {}:{}", info.file, info.line);
            *assert = Some(info);
        }
        self.fs_remount();
        true
    }

    /// Recorded assertion, if any
    pub fn assert_info(&self) -> Option<AssertInfo> {
        self.assert.lock().clone()
    }

    /// Forget the recorded assertion
    pub fn clear_assert(&self) {
        *self.assert.lock() = None;
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

/// Bookkeeping for the file being copied onto the drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferState {
    /// Directory entry believed to hold the image
    pub file_to_program: Option<FileHandle>,
    /// First sector of the image as found by content detection
    pub start_sector: Option<u32>,
    /// First sector of the image according to the directory
    pub file_start_sector: Option<u32>,
    /// Sector expected next
    pub file_next_sector: u32,
    /// Earliest sector seen out of sequence
    pub last_ooo_sector: Option<u32>,
    /// Bytes handed to the stream
    pub size_processed: u32,
    /// Size according to the directory
    pub file_size: u32,
    /// Bytes of in-sequence sectors seen
    pub size_transferred: u32,
    /// Overall progress
    pub phase: TransferPhase,
    /// Stream is open
    pub stream_open: bool,
    /// Stream was opened at some point
    pub stream_started: bool,
    /// Stream reported the end of the image
    pub stream_finished: bool,
    /// Stream could be complete
    pub stream_optional_finish: bool,
    /// Directory information says the file is complete
    pub file_info_optional_finish: bool,
    /// The transfer is being ended by a disconnect
    pub transfer_timeout: bool,
    /// Format of the file
    pub stream: Option<StreamType>,
}

impl Default for TransferState {
    fn default() -> Self {
        Self {
            file_to_program: None,
            start_sector: None,
            file_start_sector: None,
            file_next_sector: 0,
            last_ooo_sector: None,
            size_processed: 0,
            file_size: 0,
            size_transferred: 0,
            phase: TransferPhase::NotStarted,
            stream_open: false,
            stream_started: false,
            stream_finished: false,
            stream_optional_finish: false,
            file_info_optional_finish: false,
            transfer_timeout: false,
            stream: None,
        }
    }
}

/// A link state change performed by [`VfsManager::tick`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State that was left
    pub from: LinkState,
    /// State that was entered
    pub to: LinkState,
}

/// Transfer tracker and link timer
pub struct VfsManager {
    timings: VfsTimings,
    transfer: TransferState,
    stream: FileStream,
    time_usb_idle: u32,
    media_ready: bool,
    fail_reason: Result<()>,
}

impl VfsManager {
    /// Create a manager with no transfer and the media not ready
    pub fn new(timings: VfsTimings) -> Self {
        Self {
            timings,
            transfer: TransferState::default(),
            stream: FileStream::new(),
            time_usb_idle: 0,
            media_ready: false,
            fail_reason: Ok(()),
        }
    }

    /// Current transfer bookkeeping
    pub fn transfer(&self) -> &TransferState {
        &self.transfer
    }

    /// Result of the last finished transfer
    pub fn transfer_status(&self) -> Result<()> {
        self.fail_reason
    }

    /// Whether sector I/O is being served
    pub fn media_ready(&self) -> bool {
        self.media_ready
    }

    pub(crate) fn set_media_ready(&mut self, ready: bool) {
        self.media_ready = ready;
    }

    /// Configured delays
    pub fn timings(&self) -> &VfsTimings {
        &self.timings
    }

    /// The file stream behind the transfer
    pub fn stream(&self) -> &FileStream {
        &self.stream
    }

    /// Mutable access to the file stream
    pub fn stream_mut(&mut self) -> &mut FileStream {
        &mut self.stream
    }

    /// Milliseconds since the last host write
    pub fn idle_time(&self) -> u32 {
        self.time_usb_idle
    }

    /// Restart the idle timer
    pub fn touch(&mut self) {
        self.time_usb_idle = 0;
    }

    /// Forget the transfer; done on every filesystem build
    pub fn reset_transfer(&mut self) {
        self.transfer = TransferState::default();
    }

    fn state_change_timeout(&self, link: &LinkStates) -> u32 {
        let t = &self.timings;
        match (link.current, link.next) {
            (LinkState::Connected, _) => match self.transfer.phase {
                TransferPhase::NotStarted | TransferPhase::Finished => t.disconnect_delay,
                TransferPhase::InProgress => t.disconnect_transfer_timeout,
                TransferPhase::CanBeFinished => t.disconnect_transfer_idle,
            },
            (LinkState::Disconnected, LinkState::Connected) => t.connect_delay,
            (LinkState::Reconnecting, LinkState::Connected) => t.reconnect_delay,
            (LinkState::Reconnecting, LinkState::Disconnected) => 0,
            (current, next) => {
                log::warn!("vfs: unexpected transition {:?} -> {:?}", current, next);
                0
            }
        }
    }

    /// Advance the idle timer by `elapsed_ms` and perform a pending link
    /// transition once its delay has passed
    ///
    /// The caller handles the returned [`Transition`]: ending the transfer
    /// when leaving [`LinkState::Connected`] and rebuilding the drive when
    /// entering it.
    pub fn tick(&mut self, elapsed_ms: u32, sync: &SyncState) -> Option<Transition> {
        let mut link = sync.link.lock();
        if !link.changing() {
            return None;
        }

        let ready = self.time_usb_idle > self.state_change_timeout(&link);
        if self.time_usb_idle < self.timings.max_event_time {
            self.time_usb_idle += elapsed_ms;
        }
        if !ready {
            return None;
        }

        let from = link.current;
        link.current = link.next;
        if link.current == LinkState::Reconnecting {
            link.next = LinkState::Connected;
        }
        let to = link.current;
        self.time_usb_idle = 0;
        drop(link);

        log::debug!("vfs: link {:?} -> {:?} ({:?})", from, to, self.transfer.phase);
        Some(Transition { from, to })
    }

    /// End an unfinished transfer because the drive is going away
    pub fn abort_transfer(&mut self, bank: &mut FlashBank<'_>, sync: &SyncState) {
        if self.transfer.phase != TransferPhase::Finished {
            log::debug!("vfs: transfer timeout");
            self.transfer.transfer_timeout = true;
            self.update_state(bank, sync, Ok(()));
        }
    }

    /// React to a root directory change
    pub fn file_change(&mut self, event: &FileEvent, bank: &mut FlashBank<'_>, sync: &SyncState) {
        if self.transfer.phase == TransferPhase::Finished {
            return;
        }

        let size = event.entry.size();
        match event.change {
            FileChange::Changed if Some(event.file) == self.transfer.file_to_program => {
                let stream = stream_type_from_name(&event.filename);
                self.update_file_info(bank, sync, event.file, event.start_sector, size, stream);
            }
            FileChange::Created => {
                // macOS keeps hidden files with the same extension around
                if let Some(stream) = stream_type_from_name(&event.filename) {
                    if !event.entry.attr().contains(FileAttr::HIDDEN) {
                        let start = event.start_sector;
                        self.update_file_info(bank, sync, event.file, start, size, Some(stream));
                    }
                }
            }
            FileChange::Deleted if Some(event.file) == self.transfer.file_to_program => {
                self.reset_file_info(sync);
            }
            _ => {}
        }
    }

    /// React to sectors written outside the file system metadata
    pub fn file_data(
        &mut self,
        bank: &mut FlashBank<'_>,
        sync: &SyncState,
        sector: u32,
        data: &[u8],
    ) {
        let num_sectors = (data.len() / SECTOR_SIZE) as u32;
        if num_sectors == 0 || self.transfer.phase == TransferPhase::Finished {
            return;
        }

        if !self.transfer.stream_started {
            if let Some(stream) = stream_start_identify(bank.board, data) {
                self.stream_open(bank, sync, stream, sector);
            }
        }
        if !self.transfer.stream_started {
            return;
        }

        let t = &mut self.transfer;
        let Some(start_sector) = t.start_sector else {
            return;
        };
        if sector < start_sector {
            return;
        }

        if sector != t.file_next_sector {
            if sector < t.file_next_sector {
                log::debug!("vfs: sector {} out of order", sector);
                t.last_ooo_sector = Some(t.last_ooo_sector.map_or(sector, |s| s.min(sector)));
            } else if t.file_size == 0 || sector < file_end_sector(start_sector, t.file_size) {
                // A hole in the file; remember where it starts
                log::debug!("vfs: sector {} skips {}", sector, t.file_next_sector);
                let next = t.file_next_sector;
                t.last_ooo_sector = Some(t.last_ooo_sector.map_or(next, |s| s.min(next)));
            } else {
                log::trace!("vfs: sector {} not part of the transfer", sector);
            }
            return;
        }

        // The hole has been filled
        if t.last_ooo_sector == Some(sector) {
            t.last_ooo_sector = None;
        }

        let size = num_sectors * SECTOR_SIZE as u32;
        t.size_transferred += size;
        t.file_next_sector = sector.saturating_add(num_sectors);

        if t.stream_finished {
            log::trace!("vfs: discarding sector {} after end of stream", sector);
            self.update_state(bank, sync, Ok(()));
            return;
        }

        self.stream_data(bank, sync, data);
    }

    fn update_file_info(
        &mut self,
        bank: &mut FlashBank<'_>,
        sync: &SyncState,
        file: FileHandle,
        start_sector: Option<u32>,
        size: u32,
        stream: Option<StreamType>,
    ) {
        log::debug!("vfs: file info {:?} start={:?} size={}", file, start_sector, size);
        let t = &mut self.transfer;
        if t.phase == TransferPhase::Finished {
            return;
        }

        if t.file_to_program.is_none() {
            t.file_to_program = Some(file);
        }
        if t.file_start_sector.is_none() {
            t.file_start_sector = start_sector;
        }
        if t.stream.is_none() {
            t.stream = stream;
        }

        // Size may only grow, or shrink to no less than what has arrived
        if size < t.file_size && size < t.size_transferred && size > 0 {
            log::warn!("vfs: file size changed from {} to {}", t.file_size, size);
            self.update_state(bank, sync, Err(Error::ErrorDuringTransfer));
            return;
        }
        if start_sector.is_some() && start_sector != t.file_start_sector {
            log::warn!(
                "vfs: start sector changed from {:?} to {:?}",
                t.file_start_sector,
                start_sector
            );
            self.update_state(bank, sync, Err(Error::ErrorDuringTransfer));
            return;
        }
        if stream.is_some() && stream != t.stream {
            log::warn!("vfs: file type changed from {:?} to {:?}", t.stream, stream);
            self.update_state(bank, sync, Err(Error::ErrorDuringTransfer));
            return;
        }

        t.file_size = size;
        self.update_state(bank, sync, Ok(()));
    }

    fn reset_file_info(&mut self, sync: &SyncState) {
        log::debug!("vfs: file deleted");
        if self.transfer.stream_started {
            // Size can still be updated by a matching entry
            self.transfer.file_to_program = None;
            self.transfer.file_start_sector = None;
            self.transfer.file_size = 0;
        } else {
            self.transfer = TransferState::default();
            sync.abort_remount();
        }
    }

    fn stream_open(
        &mut self,
        bank: &mut FlashBank<'_>,
        sync: &SyncState,
        stream: StreamType,
        sector: u32,
    ) {
        log::debug!("vfs: {:?} stream starts at sector {}", stream, sector);
        let t = &mut self.transfer;
        if t.start_sector.is_none() {
            t.start_sector = Some(sector);
        }
        if t.stream.is_none() {
            t.stream = Some(stream);
        }

        if t.start_sector != Some(sector) || t.stream != Some(stream) {
            log::warn!(
                "vfs: stream {:?}@{} does not match {:?}@{:?}",
                stream,
                sector,
                t.stream,
                t.start_sector
            );
            self.update_state(bank, sync, Err(Error::ErrorDuringTransfer));
            return;
        }

        let status = self.stream.open(stream);
        if status.is_ok() {
            self.transfer.file_next_sector = sector;
            self.transfer.stream_open = true;
            self.transfer.stream_started = true;
        }
        self.update_state(bank, sync, status);
    }

    fn stream_data(&mut self, bank: &mut FlashBank<'_>, sync: &SyncState, data: &[u8]) {
        if self.transfer.stream_finished || !self.transfer.stream_open {
            return;
        }

        let status = match self.stream.write(bank, data) {
            Ok(StreamStatus::Done) => {
                self.transfer.stream_open = false;
                self.transfer.stream_finished = true;
                self.transfer.stream_optional_finish = true;
                self.stream.close(bank)
            }
            Ok(StreamStatus::DoneOrContinue) => {
                self.transfer.stream_optional_finish = true;
                Ok(())
            }
            Ok(StreamStatus::Continue) => {
                self.transfer.stream_optional_finish = false;
                Ok(())
            }
            Err(e) => Err(e),
        };

        self.transfer.size_processed += data.len() as u32;
        self.update_state(bank, sync, status);
    }

    fn out_of_order(&self) -> bool {
        let t = &self.transfer;
        let (Some(ooo), Some(start)) = (t.last_ooo_sector, t.start_sector) else {
            return false;
        };
        let offset = ooo.saturating_sub(start) * SECTOR_SIZE as u32;
        // A marker just past a complete file came from a write to some other file
        let complete = t.file_size > 0 && t.size_transferred >= t.file_size;
        offset < t.size_processed
            || (offset == t.size_processed && !t.stream_finished && !complete)
    }

    fn update_state(&mut self, bank: &mut FlashBank<'_>, sync: &SyncState, status: Result<()>) {
        if self.transfer.phase == TransferPhase::Finished {
            return;
        }

        let t = &mut self.transfer;
        // The end of a file is never known for sure; the directory may still
        // be flushing
        t.file_info_optional_finish = t.file_to_program.is_some()
            && t.size_transferred >= t.file_size
            && t.file_size > 0
            && t.start_sector == t.file_start_sector;
        let transfer_timeout = t.transfer_timeout;
        let transfer_started = t.file_to_program.is_some() || t.stream.is_some();
        let can_be_finished = t.file_info_optional_finish && t.stream_optional_finish;
        let must_be_finished = t.stream_finished && t.file_info_optional_finish;

        let mut status = status;
        if status.is_err() {
            self.transfer.phase = TransferPhase::Finished;
        } else if transfer_timeout {
            status = if self.out_of_order() {
                Err(Error::OooSector)
            } else if !transfer_started || can_be_finished {
                Ok(())
            } else {
                Err(Error::TransferTimeout)
            };
            self.transfer.phase = TransferPhase::Finished;
        } else if must_be_finished {
            self.transfer.phase = TransferPhase::Finished;
        } else if can_be_finished {
            self.transfer.phase = TransferPhase::CanBeFinished;
        } else if transfer_started {
            self.transfer.phase = TransferPhase::InProgress;
        }

        if self.transfer.phase == TransferPhase::Finished {
            if self.transfer.stream_open {
                let close_status = self.stream.close(bank);
                self.transfer.stream_open = false;
                if status.is_ok() {
                    status = close_status;
                }
            }
            self.fail_reason = status;
            match status {
                Ok(()) => log::info!("vfs: transfer finished"),
                Err(e) => log::warn!("vfs: transfer failed: {}", e),
            }
        }

        // Remounting is how the host gets to see the result
        if !transfer_timeout {
            sync.fs_remount();
        }
    }
}

/// First sector after a contiguous file of `size` bytes starting at `start`
fn file_end_sector(start: u32, size: u32) -> u32 {
    start.saturating_add(size.div_ceil(SECTOR_SIZE as u32))
}
