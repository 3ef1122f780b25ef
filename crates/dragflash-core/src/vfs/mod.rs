//! The virtual drive
//!
//! - [`fat`]: on-disk FAT16 structures
//! - [`filesystem`]: the fabricated volume and its directory change events
//! - [`manager`]: connect/remount timing and transfer tracking
//! - [`user`]: generated files and magic files

pub mod fat;
pub mod filesystem;
pub mod manager;
pub mod user;

pub use fat::{DirEntry, FileAttr, Filename, SECTOR_SIZE};
pub use filesystem::{FileChange, FileContents, FileEvent, FileHandle, VirtualFs};
pub use manager::{LinkState, SyncState, TransferPhase, TransferState, Transition, VfsManager};
pub use user::{AssertInfo, AssertSource, MagicFile, UserFiles};
