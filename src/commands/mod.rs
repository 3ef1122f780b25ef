//! Command implementations
//!
//! Every command builds a fresh pipeline on in-memory flashes, mounts the
//! drive the way an operating system would and works on it through
//! [`HostFs`].

pub mod cat;
pub mod drop;
pub mod ls;
pub mod magic;

use crate::error::CliError;
use dragflash_core::config::toml::{load_board_toml, BoardFile};
use dragflash_core::config::{BoardConfig, DaplinkMode};
use dragflash_core::host::{HostFs, SectorDevice};
use dragflash_core::vfs::fat::Filename;
use dragflash_core::vfs::LinkState;
use dragflash_core::{FirmwareUpdatePipeline, ProtectedIapFlash, SyncState};
use dragflash_dummy::{DummyFlash, DummyIap};
use std::path::Path;

/// Pipeline running on the dummy flashes
pub type SimPipeline<'s> = FirmwareUpdatePipeline<'s, DummyFlash, ProtectedIapFlash<DummyIap>>;

/// Upper bound on simulated time spent waiting for the drive
const SETTLE_LIMIT_MS: u32 = 120_000;

/// Load the board file, or the built-in example board
pub fn load_board(path: Option<&Path>, bootloader: bool) -> Result<BoardFile, CliError> {
    let mut file = match path {
        Some(path) => load_board_toml(path)?,
        None => BoardFile {
            board: BoardConfig::example(),
            ..Default::default()
        },
    };
    if bootloader {
        file.board.mode = DaplinkMode::Bootloader;
    }
    log::debug!(
        "Board {} running {}",
        file.board.board_id,
        file.board.mode.name()
    );
    Ok(file)
}

/// Build a pipeline for `file` and present its drive
pub fn build_pipeline<'s>(
    file: &BoardFile,
    sync: &'s SyncState,
) -> Result<SimPipeline<'s>, CliError> {
    let target = DummyFlash::for_board(&file.board);
    let iap = ProtectedIapFlash::new(&file.board, DummyIap::for_board(&file.board));
    let mut pipeline = FirmwareUpdatePipeline::new(
        file.board.clone(),
        file.settings,
        file.timings,
        target,
        iap,
        sync,
    );
    pipeline.init(true)?;
    Ok(pipeline)
}

/// Mount the drive the way the host would
pub fn mount<D: SectorDevice>(dev: D) -> Result<HostFs<D>, CliError> {
    Ok(HostFs::mount(dev)?)
}

/// Outcome of a remount cycle
#[derive(Debug, Clone, Copy)]
pub struct Settled {
    /// Simulated time until the drive came back
    pub elapsed_ms: u32,
    /// Transfer result as it stood when the drive was ejected
    pub status: dragflash_core::Result<()>,
}

/// Run the link timer until the drive is presented again
pub fn settle(pipeline: &mut SimPipeline<'_>, tick: u32) -> Result<Settled, CliError> {
    let tick = tick.max(1);
    let mut elapsed = 0;
    let mut status = pipeline.transfer_status();
    while elapsed < SETTLE_LIMIT_MS {
        elapsed += tick;
        let Some(t) = pipeline.periodic(tick) else {
            continue;
        };
        log::debug!("Link {:?} -> {:?} after {} ms", t.from, t.to, elapsed);
        if t.from == LinkState::Connected {
            // The rebuild on reconnect forgets the transfer
            status = pipeline.transfer_status();
        }
        if t.to == LinkState::Connected {
            return Ok(Settled {
                elapsed_ms: elapsed,
                status,
            });
        }
    }
    Err(CliError::Timeout(elapsed))
}

/// Parse a dotted 8.3 name such as `details.txt`
pub fn parse_name(name: &str) -> Result<Filename, CliError> {
    Filename::from_dotted(name).ok_or_else(|| CliError::InvalidName(name.to_string()))
}

/// Read a whole file from the drive
pub fn read_file<D: SectorDevice>(
    host: &mut HostFs<D>,
    name: &Filename,
) -> Result<Vec<u8>, CliError> {
    let size = host
        .find(name)
        .map(|e| e.size())
        .ok_or_else(|| CliError::NotFound(name.to_string()))?;
    let mut buf = vec![0u8; size as usize];
    let n = host.read_file(name, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name() {
        let name = parse_name("details.txt").unwrap();
        assert_eq!(name, Filename::new(*b"DETAILS TXT"));
        assert_eq!(parse_name("MSD_OFF.CFG").unwrap(), Filename::new(*b"MSD_OFF CFG"));
        assert!(parse_name("much_too_long.txt").is_err());
    }

    #[test]
    fn test_example_board_presents_drive() {
        let file = load_board(None, false).unwrap();
        let sync = SyncState::new();
        let mut pipeline = build_pipeline(&file, &sync).unwrap();
        assert!(pipeline.media_ready());
        let mut host = mount(&mut pipeline).unwrap();
        let details = read_file(&mut host, &Filename::new(*b"DETAILS TXT")).unwrap();
        assert!(!details.is_empty());
    }
}
