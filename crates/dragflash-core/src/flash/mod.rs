//! Flash programming layers
//!
//! From the bottom up: [`FlashInterface`] devices, the buffering
//! [`manager::FlashManager`], and the [`decoder::FlashDecoder`] that works
//! out which device and address an image belongs to.

pub mod decoder;
pub mod iap;
mod intf;
pub mod manager;
pub mod validation;

pub use decoder::{FlashDecoder, FlashType};
pub use iap::{IapBackend, ProtectedIapFlash};
pub use intf::{FlashBank, FlashInterface, FlashKind};
pub use manager::FlashManager;
