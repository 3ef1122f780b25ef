//! Error types for dragflash-core
//!
//! Every failure the update pipeline can report is a variant of [`Error`].
//! Success is `Ok(())`; the stream layer's "done" outcomes live in
//! [`crate::stream::StreamStatus`] instead of being encoded as errors.
//!
//! Each error carries an [`ErrorType`] category used when rendering the
//! `FAIL.TXT` diagnostic file.

use core::fmt;

use bitflags::bitflags;

bitflags! {
    /// User-facing category of an [`Error`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ErrorType: u8 {
        /// Programmer or contract violation
        const INTERNAL = 0x01;
        /// Retrying the operation may succeed
        const TRANSIENT = 0x02;
        /// Caused by what the user supplied
        const USER = 0x04;
        /// Failure while talking to the target device
        const TARGET = 0x08;
        /// Failure while updating the interface itself
        const INTERFACE = 0x10;
    }
}

impl ErrorType {
    /// Lower-case names of the categories set in `self`, lowest bit first
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        const NAMES: [(ErrorType, &str); 5] = [
            (ErrorType::INTERNAL, "internal"),
            (ErrorType::TRANSIENT, "transient"),
            (ErrorType::USER, "user"),
            (ErrorType::TARGET, "target"),
            (ErrorType::INTERFACE, "interface"),
        ];
        NAMES
            .into_iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(_, name)| name)
    }
}

/// Core error type - no_std compatible, Copy for efficiency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// Unspecified failure
    Failure,
    /// Internal invariant violated (operation called in the wrong state)
    Internal,

    // Transfer errors
    /// The host changed the file in an incompatible way mid-transfer
    ErrorDuringTransfer,
    /// The transfer stalled and was timed out
    TransferTimeout,
    /// Directory size and programmed size disagree
    FileBounds,
    /// The host sent sectors out of order
    OooSector,

    // Target flash errors
    /// Target reset/halt failed
    Reset,
    /// Flash algorithm download failed
    AlgoDl,
    /// No flash algorithm for the region
    AlgoMissing,
    /// Flash data download failed
    AlgoDataSeq,
    /// Target flash init failed
    Init,
    /// Target flash uninit failed
    Uninit,
    /// Image tries to set security bits
    SecurityBits,
    /// Target unlock failed
    Unlock,
    /// Sector erase failed
    EraseSector,
    /// Chip erase failed
    EraseAll,
    /// Page program failed
    Write,
    /// Program verify failed
    WriteVerify,

    // File stream errors
    /// Intel HEX record checksum mismatch
    HexCksum,
    /// Intel HEX parser failure
    HexParser,
    /// Intel HEX programming failure
    HexProgram,
    /// Intel HEX address not valid for this device
    HexInvalidAddress,
    /// Intel HEX load offset not valid
    HexInvalidAppOffset,

    // Flash decoder errors
    /// Bootloader image does not start at the bootloader base
    FdBlUpdtAddrWrong,
    /// Interface image does not start at the interface base
    FdIntfUpdtAddrWrong,
    /// Image type or format not supported
    FdUnsupportedUpdate,

    // In-application programming errors
    /// IAP init failed
    IapInit,
    /// IAP uninit failed
    IapUninit,
    /// IAP program failed or was refused
    IapWrite,
    /// IAP sector erase failed or was refused
    IapEraseSector,
    /// IAP mass erase failed or was refused
    IapEraseAll,
    /// IAP access outside the update region
    IapOutOfBounds,
    /// This device cannot update itself
    IapUpdtNotSupported,
    /// The self-update did not reach the end of the update region
    IapUpdtIncomplete,
    /// The bootloader image CRC did not match
    BlUpdtBadCrc,
}

impl Error {
    /// Human readable description, as shown in `FAIL.TXT`
    pub const fn message(self) -> &'static str {
        match self {
            Self::Failure => "An error has occurred",
            Self::Internal => "An internal error has occurred",
            Self::ErrorDuringTransfer => "An error occurred during the transfer",
            Self::TransferTimeout => "The transfer timed out.",
            Self::FileBounds => "Possible mismatch between file size and size programmed",
            Self::OooSector => {
                "File sent out of order by PC. Target might not be programmed correctly."
            }
            Self::Reset => "The interface firmware FAILED to reset/halt the target MCU",
            Self::AlgoDl => {
                "The interface firmware FAILED to download the flash programming algorithms to the target MCU"
            }
            Self::AlgoMissing => "The flash algo missing for a region",
            Self::AlgoDataSeq => {
                "The interface firmware FAILED to download the flash data contents to be programmed"
            }
            Self::Init => "The interface firmware FAILED to initialize the target MCU",
            Self::Uninit => "The interface firmware FAILED to uninitialize the target MCU",
            Self::SecurityBits => {
                "The interface firmware ABORTED programming. Image is trying to set security bits"
            }
            Self::Unlock => "The interface firmware FAILED to unlock the target for programming",
            Self::EraseSector => "Flash algorithm erase sector command FAILURE",
            Self::EraseAll => "Flash algorithm erase all command FAILURE",
            Self::Write => "Flash algorithm write command FAILURE",
            Self::WriteVerify => "Flash algorithm write verify command FAILURE",
            Self::HexCksum => {
                "The hex file cannot be decoded. Checksum calculation failure occurred."
            }
            Self::HexParser => "The hex file cannot be decoded. Parser logic failure occurred.",
            Self::HexProgram => "The hex file cannot be programmed. Logic failure occurred.",
            Self::HexInvalidAddress => {
                "The hex file you dropped isn't compatible with this mode or device."
            }
            Self::HexInvalidAppOffset => "The hex file offset load address is not correct.",
            Self::FdBlUpdtAddrWrong => "The starting address for the bootloader update is wrong.",
            Self::FdIntfUpdtAddrWrong => {
                "The starting address for the interface update is wrong."
            }
            Self::FdUnsupportedUpdate => {
                "The application file format is unknown and cannot be parsed and/or processed."
            }
            Self::IapInit => "In application programming initialization failed.",
            Self::IapUninit => "In application programming uninit failed.",
            Self::IapWrite => "In application programming write failed.",
            Self::IapEraseSector => "In application programming sector erase failed.",
            Self::IapEraseAll => "In application programming mass erase failed.",
            Self::IapOutOfBounds => {
                "In application programming aborted due to an out of bounds address."
            }
            Self::IapUpdtNotSupported => "In application programming not supported on this device.",
            Self::IapUpdtIncomplete => {
                "In application programming failed because the update sent was incomplete."
            }
            Self::BlUpdtBadCrc => "The bootloader CRC did not pass.",
        }
    }

    /// Category flags for this error
    pub const fn error_type(self) -> ErrorType {
        match self {
            Self::Failure | Self::Internal => ErrorType::INTERNAL,
            Self::TransferTimeout | Self::HexCksum | Self::HexParser | Self::HexProgram => {
                ErrorType::USER.union(ErrorType::TRANSIENT)
            }
            Self::ErrorDuringTransfer | Self::FileBounds | Self::OooSector => {
                ErrorType::TRANSIENT
            }
            Self::SecurityBits
            | Self::HexInvalidAddress
            | Self::HexInvalidAppOffset
            | Self::FdBlUpdtAddrWrong
            | Self::FdIntfUpdtAddrWrong
            | Self::FdUnsupportedUpdate => ErrorType::USER,
            Self::Reset
            | Self::AlgoDl
            | Self::AlgoMissing
            | Self::AlgoDataSeq
            | Self::Init
            | Self::Uninit
            | Self::Unlock
            | Self::EraseSector
            | Self::EraseAll
            | Self::Write
            | Self::WriteVerify => ErrorType::TARGET,
            Self::IapInit
            | Self::IapUninit
            | Self::IapWrite
            | Self::IapEraseSector
            | Self::IapEraseAll
            | Self::IapOutOfBounds
            | Self::IapUpdtNotSupported
            | Self::IapUpdtIncomplete
            | Self::BlUpdtBadCrc => ErrorType::INTERFACE,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;
