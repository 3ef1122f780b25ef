//! Error type of the command line tool

use dragflash_core::config::toml::ConfigError;
use dragflash_core::host::HostError;
use std::path::PathBuf;
use thiserror::Error;

/// Anything a command can fail with
#[derive(Debug, Error)]
pub enum CliError {
    /// Board file problem
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Input or output file problem
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Not usable as an 8.3 name
    #[error("'{0}' is not a valid 8.3 file name")]
    InvalidName(String),

    /// No such file on the drive
    #[error("{0} is not on the drive")]
    NotFound(String),

    /// The simulated host could not use the drive
    #[error("Drive error: {0}")]
    Host(#[from] HostError),

    /// The pipeline reported a failure
    #[error("Update failed: {0}")]
    Pipeline(#[from] dragflash_core::Error),

    /// The drive was not presented again in time
    #[error("Drive did not reappear within {0} ms")]
    Timeout(u32),
}
