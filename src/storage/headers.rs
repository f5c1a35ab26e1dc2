//! # File Header Definitions
//!
//! This module provides the zerocopy-based header and footer structs of an
//! arenadb file. The header occupies the first 24 bytes of the file and is
//! the only place where the authoritative top-ref of the latest committed
//! version is recorded.
//!
//! ## Header Layout (24 bytes)
//!
//! ```text
//! Offset  Size  Field         Description
//! ------  ----  ------------  ------------------------------------------
//! 0       8     top_ref[0]    Top-ref slot 0
//! 8       8     top_ref[1]    Top-ref slot 1
//! 16      4     mnemonic      b"T-DB"
//! 20      2     file_format   Format version, once per slot
//! 22      1     reserved      Zero
//! 23      1     flags         Bit 0 selects the authoritative slot
//! ```
//!
//! ## Double Buffering
//!
//! A commit writes the new top-ref into the slot that is NOT selected, syncs,
//! then flips bit 0 of `flags` and syncs again. Either sync may be torn by a
//! crash without leaving the file without a valid top-ref: before the flip the
//! old slot is authoritative, after it the new one is.
//!
//! ## Streaming Form
//!
//! A file written in one pass (without knowing the top-ref up front) carries
//! `u64::MAX` in slot 0 and records the top-ref in a 16-byte footer at the end
//! of the file:
//!
//! ```text
//! +------------------+---------------------+------------------------+
//! | Header (24B)     | Data ...            | top_ref | magic_cookie |
//! | top_ref[0] = MAX |                     |   8B    |      8B      |
//! +------------------+---------------------+------------------------+
//! ```
//!
//! Streaming-form files are read transparently and converted to the
//! double-buffered form by the first write transaction.
//!
//! ## Endianness
//!
//! All multi-byte fields are little-endian via `zerocopy::little_endian::U64`.

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{FILE_HEADER_SIZE, STREAMING_FOOTER_SIZE};
use crate::error::ArenaError;

pub const MNEMONIC: &[u8; 4] = b"T-DB";
pub const CURRENT_FILE_FORMAT: u8 = 24;
pub const FOOTER_MAGIC_COOKIE: u64 = 0x3034_1252_37E5_26C8;
pub const STREAMING_MARKER: u64 = u64::MAX;

const FLAG_SELECT_BIT: u8 = 0x01;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    top_ref: [U64; 2],
    mnemonic: [u8; 4],
    file_format: [u8; 2],
    reserved: u8,
    flags: u8,
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    /// Header of a database that has never committed anything.
    pub fn empty() -> Self {
        Self {
            top_ref: [U64::new(0), U64::new(0)],
            mnemonic: *MNEMONIC,
            file_format: [CURRENT_FILE_FORMAT; 2],
            reserved: 0,
            flags: 0,
        }
    }

    pub fn streaming() -> Self {
        Self {
            top_ref: [U64::new(STREAMING_MARKER), U64::new(0)],
            ..Self::empty()
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            ArenaError::invalid_format(format!(
                "file too small for header: {} < {}",
                bytes.len(),
                FILE_HEADER_SIZE
            ))
        );

        let header = Self::read_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))?;

        if &header.mnemonic != MNEMONIC {
            bail!(ArenaError::invalid_format("bad mnemonic in file header"));
        }

        let format = header.file_format[header.selected_slot()];
        if format != CURRENT_FILE_FORMAT {
            bail!(ArenaError::invalid_format(format!(
                "unsupported file format {} (expected {})",
                format, CURRENT_FILE_FORMAT
            )));
        }

        if header.flags & !FLAG_SELECT_BIT != 0 {
            bail!(ArenaError::invalid_format(format!(
                "unknown header flags {:#04x}",
                header.flags
            )));
        }

        if header.is_streaming() && header.selected_slot() != 0 {
            bail!(ArenaError::invalid_format(
                "streaming-form header selects slot 1"
            ));
        }

        Ok(header)
    }

    pub fn is_streaming(&self) -> bool {
        self.top_ref[0].get() == STREAMING_MARKER
    }

    pub fn selected_slot(&self) -> usize {
        (self.flags & FLAG_SELECT_BIT) as usize
    }

    /// Authoritative top-ref of a double-buffered header. Meaningless for a
    /// streaming-form header, whose top-ref lives in the footer.
    pub fn top_ref(&self) -> u64 {
        self.top_ref[self.selected_slot()].get()
    }

    pub fn slot(&self, slot: usize) -> u64 {
        self.top_ref[slot].get()
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Stage one of a commit: `new_top` in the inactive slot, selector
    /// unchanged.
    pub fn with_staged_top(&self, new_top: u64) -> Self {
        let mut staged = *self;
        staged.top_ref[1 - self.selected_slot()] = U64::new(new_top);
        staged
    }

    /// Stage two of a commit: the selector points at the other slot.
    pub fn with_flipped_selector(&self) -> Self {
        let mut flipped = *self;
        flipped.flags ^= FLAG_SELECT_BIT;
        flipped
    }

    /// Double-buffered header equivalent to a streaming-form file whose footer
    /// names `top_ref`.
    pub fn upgraded_from_streaming(top_ref: u64) -> Self {
        Self {
            top_ref: [U64::new(top_ref), U64::new(0)],
            ..Self::empty()
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct StreamingFooter {
    top_ref: U64,
    magic_cookie: U64,
}

const _: () = assert!(std::mem::size_of::<StreamingFooter>() == STREAMING_FOOTER_SIZE);

impl StreamingFooter {
    pub fn new(top_ref: u64) -> Self {
        Self {
            top_ref: U64::new(top_ref),
            magic_cookie: U64::new(FOOTER_MAGIC_COOKIE),
        }
    }

    /// Parses the footer from the last `STREAMING_FOOTER_SIZE` bytes of
    /// `file_tail`.
    pub fn parse(file_tail: &[u8]) -> Result<Self> {
        ensure!(
            file_tail.len() >= STREAMING_FOOTER_SIZE,
            ArenaError::invalid_format("streaming-form file has no room for a footer")
        );

        let start = file_tail.len() - STREAMING_FOOTER_SIZE;
        let footer = Self::read_from_bytes(&file_tail[start..])
            .map_err(|e| eyre::eyre!("failed to parse StreamingFooter: {:?}", e))?;

        if footer.magic_cookie.get() != FOOTER_MAGIC_COOKIE {
            bail!(ArenaError::invalid_format(
                "bad magic cookie in streaming footer"
            ));
        }

        Ok(footer)
    }

    pub fn top_ref(&self) -> u64 {
        self.top_ref.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn header_size_is_24() {
        assert_eq!(std::mem::size_of::<FileHeader>(), 24);
    }

    #[test]
    fn empty_header_parses_with_null_top() {
        let header = FileHeader::empty();
        let parsed = FileHeader::parse(header.as_bytes()).unwrap();

        assert_eq!(parsed.top_ref(), 0);
        assert_eq!(parsed.selected_slot(), 0);
        assert!(!parsed.is_streaming());
    }

    #[test]
    fn bytes_are_bit_exact() {
        let header = FileHeader::empty().with_staged_top(0x1122).with_flipped_selector();
        let bytes = header.as_bytes();

        assert_eq!(&bytes[0..8], &[0u8; 8]);
        assert_eq!(&bytes[8..16], &0x1122u64.to_le_bytes());
        assert_eq!(&bytes[16..20], b"T-DB");
        assert_eq!(bytes[20], CURRENT_FILE_FORMAT);
        assert_eq!(bytes[21], CURRENT_FILE_FORMAT);
        assert_eq!(bytes[22], 0);
        assert_eq!(bytes[23], 0x01);
    }

    #[test]
    fn commit_staging_keeps_old_top_until_flip() {
        let header = FileHeader::empty().with_staged_top(64);
        assert_eq!(header.top_ref(), 0);

        let flipped = header.with_flipped_selector();
        assert_eq!(flipped.top_ref(), 64);

        let next = flipped.with_staged_top(128);
        assert_eq!(next.top_ref(), 64);
        assert_eq!(next.slot(0), 128);
        assert_eq!(next.with_flipped_selector().top_ref(), 128);
    }

    #[test]
    fn rejects_bad_mnemonic() {
        let mut bytes = FileHeader::empty().as_bytes().to_vec();
        bytes[16..20].copy_from_slice(b"XXXX");

        let err = FileHeader::parse(&bytes).unwrap_err();
        assert_eq!(ArenaError::kind_of(&err), Some(ErrorKind::InvalidFormat));
    }

    #[test]
    fn rejects_unknown_format() {
        let mut bytes = FileHeader::empty().as_bytes().to_vec();
        bytes[20] = 9;

        let err = FileHeader::parse(&bytes).unwrap_err();
        assert_eq!(ArenaError::kind_of(&err), Some(ErrorKind::InvalidFormat));
    }

    #[test]
    fn rejects_truncated_header() {
        let err = FileHeader::parse(&[0u8; 10]).unwrap_err();
        assert_eq!(ArenaError::kind_of(&err), Some(ErrorKind::InvalidFormat));
    }

    #[test]
    fn streaming_header_and_footer() {
        let header = FileHeader::parse(FileHeader::streaming().as_bytes()).unwrap();
        assert!(header.is_streaming());

        let mut file = vec![0u8; 64];
        file[..24].copy_from_slice(header.as_bytes());
        file[48..].copy_from_slice(StreamingFooter::new(40).as_bytes());

        let footer = StreamingFooter::parse(&file).unwrap();
        assert_eq!(footer.top_ref(), 40);

        let upgraded = FileHeader::upgraded_from_streaming(footer.top_ref());
        assert!(!upgraded.is_streaming());
        assert_eq!(upgraded.top_ref(), 40);
    }

    #[test]
    fn footer_rejects_bad_cookie() {
        let mut tail = StreamingFooter::new(40).as_bytes().to_vec();
        tail[8] ^= 0xFF;

        let err = StreamingFooter::parse(&tail).unwrap_err();
        assert_eq!(ArenaError::kind_of(&err), Some(ErrorKind::InvalidFormat));
    }
}
