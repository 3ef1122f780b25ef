//! Print a file from the drive

use super::{build_pipeline, mount, parse_name, read_file};
use crate::error::CliError;
use dragflash_core::config::toml::BoardFile;
use dragflash_core::SyncState;
use std::io::Write;

/// Run the cat command
pub fn run_cat(file: BoardFile, name: &str) -> Result<(), CliError> {
    let name = parse_name(name)?;
    let sync = SyncState::new();
    let mut pipeline = build_pipeline(&file, &sync)?;
    let mut host = mount(&mut pipeline)?;

    let data = read_file(&mut host, &name)?;
    log::debug!("Read {} bytes from {}", data.len(), name);
    std::io::stdout()
        .write_all(&data)
        .map_err(|source| CliError::Io {
            path: "<stdout>".into(),
            source,
        })
}
