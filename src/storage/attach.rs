//! # Attaching to a Backing Store
//!
//! `inspect` validates what is on disk before anything is mapped:
//!
//! 1. The store holds at least a header, and the header parses
//! 2. The top-ref comes from the selected header slot, or from the footer of
//!    a streaming-form file
//! 3. The top-ref is aligned and points inside the store
//! 4. The size is a multiple of `FILE_GRANULE`
//!
//! Step 4 is where the session initiator matters. Slabs must start on a
//! granule boundary, so an unaligned file has to be extended before anyone
//! can write to it. Only the initiator may do that. Any other writable
//! attacher gets `Retry` and is expected to come back once the initiator has
//! run. A streaming-form file is converted to the double-buffered form right
//! before the initiator extends it, since extending would move the footer
//! away from the end of the file.

use eyre::{bail, ensure, Result, WrapErr};

use super::backing::Backing;
use super::headers::{FileHeader, StreamingFooter};
use crate::alloc::Ref;
use crate::config::{ALLOC_ALIGNMENT, FILE_GRANULE, FILE_HEADER_SIZE, STREAMING_FOOTER_SIZE};
use crate::error::ArenaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreInfo {
    pub top_ref: Ref,
    pub file_size: u64,
    pub streaming: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct AttachMode {
    pub read_only: bool,
    pub session_initiator: bool,
}

pub fn inspect(backing: &Backing, mode: AttachMode) -> Result<StoreInfo> {
    let mut file_size = backing.len()?;
    ensure!(
        file_size >= FILE_HEADER_SIZE as u64,
        ArenaError::invalid_format(format!(
            "store of {} bytes cannot hold a {} byte header",
            file_size, FILE_HEADER_SIZE
        ))
    );

    let header = backing.read_header()?;
    let mut streaming = header.is_streaming();
    let top_ref = if streaming {
        read_footer_top_ref(backing, file_size)?
    } else {
        header.top_ref()
    };

    ensure!(
        top_ref % ALLOC_ALIGNMENT as u64 == 0 && top_ref < file_size,
        ArenaError::invalid_format(format!(
            "top ref {} is invalid for a store of {} bytes",
            top_ref, file_size
        ))
    );

    let granule = FILE_GRANULE as u64;
    if file_size % granule != 0 {
        let writable_initiator = !mode.read_only && mode.session_initiator;
        if writable_initiator {
            if streaming {
                backing.write_header(&FileHeader::upgraded_from_streaming(top_ref))?;
                backing.sync()?;
                streaming = false;
            }
            let aligned = file_size.next_multiple_of(granule);
            backing
                .grow_to(aligned)
                .wrap_err_with(|| format!("failed to align store size {} to {}", file_size, aligned))?;
            backing.sync()?;
            tracing::debug!(from = file_size, to = aligned, "aligned store size");
            file_size = aligned;
        } else if !mode.read_only {
            bail!(ArenaError::retry(format!(
                "store size {} is not a multiple of {} and only the session initiator may resize it",
                file_size, granule
            )));
        }
    }

    Ok(StoreInfo {
        top_ref,
        file_size,
        streaming,
    })
}

fn read_footer_top_ref(backing: &Backing, file_size: u64) -> Result<Ref> {
    ensure!(
        file_size >= (FILE_HEADER_SIZE + STREAMING_FOOTER_SIZE) as u64,
        ArenaError::invalid_format("streaming-form file has no room for a footer")
    );
    let mut tail = [0u8; STREAMING_FOOTER_SIZE];
    backing.read_at(file_size - STREAMING_FOOTER_SIZE as u64, &mut tail)?;
    let footer = StreamingFooter::parse(&tail)?;
    Ok(footer.top_ref())
}

/// Converts a streaming-form header in place. Returns whether anything was
/// written. The caller holds the writer lock.
pub fn upgrade_streaming_header(backing: &Backing) -> Result<bool> {
    let header = backing.read_header()?;
    if !header.is_streaming() {
        return Ok(false);
    }
    let top_ref = read_footer_top_ref(backing, backing.len()?)?;
    backing.write_header(&FileHeader::upgraded_from_streaming(top_ref))?;
    backing.sync()?;
    tracing::debug!(top_ref, "converted streaming-form header");
    Ok(true)
}
