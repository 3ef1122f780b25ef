//! dragflash-core - Drag-and-drop firmware updates through a virtual drive
//!
//! This crate implements the mass-storage side of a debug adapter's
//! interface chip (HIC): a FAT16 volume fabricated in RAM, detection of a
//! firmware image among the raw sectors the host writes, BIN and Intel HEX
//! decoding, and buffered erase/program of the target or the HIC's own
//! flash. It is `no_std` and allocation free so it can run on the HIC
//! itself.
//!
//! # Features
//!
//! - `std` - Enable standard library support, TOML board files and
//!   `std::error::Error` impls
//!
//! # Example
//!
//! ```ignore
//! use dragflash_core::{config::*, FirmwareUpdatePipeline, SyncState};
//!
//! static SYNC: SyncState = SyncState::new();
//!
//! let mut pipeline = FirmwareUpdatePipeline::new(
//!     BoardConfig::example(),
//!     Settings::default(),
//!     VfsTimings::default(),
//!     target_flash,
//!     iap_flash,
//!     &SYNC,
//! );
//! pipeline.init(true)?;
//! // USB glue: pipeline.read_sectors(..) / pipeline.write_sectors(..)
//! // 90 ms timer: pipeline.periodic(90)
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod config;
pub mod error;
pub mod flash;
pub mod host;
pub mod pipeline;
pub mod stream;
pub mod vfs;

#[cfg(test)]
mod testutil;

pub use error::{Error, ErrorType, Result};
pub use flash::{FlashBank, FlashInterface, IapBackend, ProtectedIapFlash};
pub use pipeline::{FirmwareUpdatePipeline, MscParams};
pub use vfs::{LinkState, SyncState, TransferPhase};
