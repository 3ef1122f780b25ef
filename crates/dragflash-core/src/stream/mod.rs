//! File formats accepted on the drive
//!
//! A [`FileStream`] turns the content of a dropped file into addressed
//! image data for the [`FlashDecoder`]. The format is chosen once, at
//! [`FileStream::open`], and its scratch state lives in a tagged enum for
//! the rest of the stream.

mod bin;
mod hex;
pub mod intelhex;

use crate::config::BoardConfig;
use crate::error::{Error, Result};
use crate::flash::decoder::{detect_type, FlashDecoder, FlashType};
use crate::flash::validation::validate_hexfile;
use crate::flash::FlashBank;
use crate::vfs::fat::Filename;

pub use bin::BinState;
pub use hex::HexState;

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    /// Raw binary image
    Bin,
    /// Intel HEX
    Hex,
}

impl StreamType {
    /// File extension used for this format
    pub fn extension(self) -> &'static str {
        match self {
            StreamType::Bin => "BIN",
            StreamType::Hex => "HEX",
        }
    }
}

/// Successful outcome of [`FileStream::write`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// More data is required
    Continue,
    /// The image is complete
    Done,
    /// The image may be complete; the format has no end marker
    DoneOrContinue,
}

/// Format detected from the first sector of a file, BIN before HEX
pub fn stream_start_identify(board: &BoardConfig, data: &[u8]) -> Option<StreamType> {
    if detect_type(board, data, None) != FlashType::Unknown {
        Some(StreamType::Bin)
    } else if validate_hexfile(data) {
        Some(StreamType::Hex)
    } else {
        None
    }
}

/// Format implied by the extension of an 8.3 name
pub fn stream_type_from_name(name: &Filename) -> Option<StreamType> {
    match name.extension() {
        b"BIN" => Some(StreamType::Bin),
        b"HEX" => Some(StreamType::Hex),
        _ => None,
    }
}

#[derive(Debug, Clone)]
enum Format {
    Bin(BinState),
    Hex(HexState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    End,
    Error,
}

/// Open/write/close state machine around one file format
pub struct FileStream {
    state: State,
    format: Option<Format>,
    decoder: FlashDecoder,
}

impl FileStream {
    /// Create a closed stream
    pub const fn new() -> Self {
        Self {
            state: State::Closed,
            format: None,
            decoder: FlashDecoder::new(),
        }
    }

    /// Format of the current or last stream
    pub fn stream_type(&self) -> Option<StreamType> {
        match self.format {
            Some(Format::Bin(_)) => Some(StreamType::Bin),
            Some(Format::Hex(_)) => Some(StreamType::Hex),
            None => None,
        }
    }

    /// `true` until [`close`](Self::close) once opened
    pub fn is_open(&self) -> bool {
        self.state != State::Closed
    }

    /// The decoder fed by this stream
    pub fn decoder(&self) -> &FlashDecoder {
        &self.decoder
    }

    /// Mutable access to the decoder
    pub fn decoder_mut(&mut self) -> &mut FlashDecoder {
        &mut self.decoder
    }

    /// Start a stream of type `ty`
    pub fn open(&mut self, ty: StreamType) -> Result<()> {
        log::debug!("stream: open {:?}", ty);
        if self.state != State::Closed {
            return Err(Error::Internal);
        }

        let format = match ty {
            StreamType::Bin => Format::Bin(BinState::new()),
            StreamType::Hex => {
                let mut hex = HexState::new();
                hex.reset();
                Format::Hex(hex)
            }
        };
        self.format = Some(format);
        self.state = State::Open;

        let status = self.decoder.open();
        if status.is_err() {
            self.state = State::Error;
        }
        status
    }

    /// Feed file content
    pub fn write(&mut self, bank: &mut FlashBank<'_>, data: &[u8]) -> Result<StreamStatus> {
        if self.state != State::Open {
            return Err(Error::Internal);
        }
        let Some(format) = self.format.as_mut() else {
            return Err(Error::Internal);
        };

        let status = match format {
            Format::Bin(bin) => bin.write(&mut self.decoder, bank, data),
            Format::Hex(hex) => hex.write(&mut self.decoder, bank, data),
        };
        match status {
            Ok(StreamStatus::Done) => self.state = State::End,
            Ok(_) => {}
            Err(e) => {
                log::debug!("stream: write failed: {}", e);
                self.state = State::Error;
            }
        }
        status
    }

    /// End the stream and close the flash session behind it
    pub fn close(&mut self, bank: &mut FlashBank<'_>) -> Result<()> {
        log::debug!("stream: close");
        if self.state == State::Closed {
            return Err(Error::Internal);
        }
        self.state = State::Closed;
        self.decoder.close(bank)
    }
}

impl Default for FileStream {
    fn default() -> Self {
        Self::new()
    }
}
