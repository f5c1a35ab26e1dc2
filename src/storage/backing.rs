//! # Backing Store
//!
//! The bytes underneath the arena live either in a database file or in a
//! caller-supplied buffer. [`Backing`] hides which one:
//!
//! ```text
//! Backing::File    positional reads/writes on the file, sections mapped
//!                  read-only with memmap2
//! Backing::Memory  a Vec<u8> behind an RwLock, sections copied out
//! ```
//!
//! ## Append-Only Writes
//!
//! Committed bytes are never rewritten. A commit writes slab contents at
//! offsets past the committed size and then switches the header, so existing
//! mappings keep describing the exact bytes their readers saw. The header is
//! the one exception: it is rewritten in place, and readers never consult it
//! after attach.
//!
//! Writes go through `pwrite` (`FileExt::write_all_at`) rather than a
//! writable mapping. Readers in other processes therefore never observe a
//! half-written slab through a shared page.
//!
//! ## Encryption
//!
//! With an [`Encryption`] configured, `write_data` encrypts a copy of the
//! outgoing bytes and `map_section` decrypts into an owned buffer instead of
//! handing out the raw file mapping. Header and footer I/O uses the raw
//! `read_at`/`write_at` calls.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapOptions;
use parking_lot::RwLock;
use zerocopy::IntoBytes;

use super::cipher::Encryption;
use super::headers::FileHeader;
use super::mapping::Mapping;
use crate::config::{FILE_HEADER_SIZE, INITIAL_FILE_SIZE};
use crate::error::ArenaError;

/// How a file backing is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenMode {
    pub read_only: bool,
    pub no_create: bool,
}

/// Where a database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageKind {
    File { path: PathBuf },
    Buffer { bytes: Vec<u8> },
}

impl StorageKind {
    pub fn file<P: AsRef<Path>>(path: P) -> Self {
        StorageKind::File {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn buffer(bytes: Vec<u8>) -> Self {
        StorageKind::Buffer { bytes }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, StorageKind::File { .. })
    }

    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            StorageKind::File { path } => Some(path),
            StorageKind::Buffer { .. } => None,
        }
    }
}

#[derive(Debug)]
pub enum Backing {
    File(FileBacking),
    Memory(MemoryBacking),
}

#[derive(Debug)]
pub struct FileBacking {
    path: PathBuf,
    file: File,
    read_only: bool,
    encryption: Option<Encryption>,
}

#[derive(Debug)]
pub struct MemoryBacking {
    bytes: RwLock<Vec<u8>>,
    encryption: Option<Encryption>,
}

impl Backing {
    pub fn open(kind: StorageKind, mode: OpenMode, encryption: Option<Encryption>) -> Result<Self> {
        match kind {
            StorageKind::File { path } => Self::open_file(path, mode, encryption),
            StorageKind::Buffer { bytes } => Ok(Self::from_buffer(bytes, encryption)),
        }
    }

    /// Opens `path`, creating and initializing it unless `mode` forbids that.
    /// An existing zero-length file is initialized the same way.
    pub fn open_file<P: AsRef<Path>>(
        path: P,
        mode: OpenMode,
        encryption: Option<Encryption>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let exists = path.exists();

        if !exists && (mode.no_create || mode.read_only) {
            eyre::bail!(ArenaError::access(format!(
                "database file '{}' does not exist",
                path.display()
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(!mode.read_only)
            .create(!mode.read_only && !mode.no_create)
            .truncate(false)
            .open(path)
            .map_err(|e| access_error(e, "open", path))?;

        let backing = FileBacking {
            path: path.to_path_buf(),
            file,
            read_only: mode.read_only,
            encryption,
        };

        let len = backing.len()?;
        if len == 0 {
            ensure!(
                !mode.read_only,
                ArenaError::invalid_format(format!(
                    "database file '{}' is empty and was opened read-only",
                    path.display()
                ))
            );
            backing.initialize()?;
            tracing::debug!(path = %path.display(), "initialized new database file");
        }

        Ok(Backing::File(backing))
    }

    /// Wraps `bytes` as an in-memory database. An empty buffer is initialized
    /// as an empty database.
    pub fn from_buffer(mut bytes: Vec<u8>, encryption: Option<Encryption>) -> Self {
        if bytes.is_empty() {
            bytes.resize(INITIAL_FILE_SIZE, 0);
            bytes[..FILE_HEADER_SIZE].copy_from_slice(FileHeader::empty().as_bytes());
        }
        Backing::Memory(MemoryBacking {
            bytes: RwLock::new(bytes),
            encryption,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Backing::File(f) => Some(&f.path),
            Backing::Memory(_) => None,
        }
    }

    pub fn is_read_only(&self) -> bool {
        match self {
            Backing::File(f) => f.read_only,
            Backing::Memory(_) => false,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption().is_some()
    }

    fn encryption(&self) -> Option<&Encryption> {
        match self {
            Backing::File(f) => f.encryption.as_ref(),
            Backing::Memory(m) => m.encryption.as_ref(),
        }
    }

    /// Physical length of the store in bytes.
    pub fn len(&self) -> Result<u64> {
        match self {
            Backing::File(f) => f.len(),
            Backing::Memory(m) => Ok(m.bytes.read().len() as u64),
        }
    }

    pub fn read_header(&self) -> Result<FileHeader> {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        self.read_at(0, &mut buf)?;
        FileHeader::parse(&buf)
    }

    pub fn write_header(&self, header: &FileHeader) -> Result<()> {
        self.write_at(0, header.as_bytes())
    }

    /// Raw read, bypassing encryption.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Backing::File(f) => read_exact_at(&f.file, buf, offset)
                .map_err(|e| access_error(e, "read", &f.path)),
            Backing::Memory(m) => {
                let bytes = m.bytes.read();
                let start = offset as usize;
                ensure!(
                    start + buf.len() <= bytes.len(),
                    ArenaError::access(format!(
                        "read of {} bytes at {} past end of buffer ({})",
                        buf.len(),
                        offset,
                        bytes.len()
                    ))
                );
                buf.copy_from_slice(&bytes[start..start + buf.len()]);
                Ok(())
            }
        }
    }

    /// Raw write, bypassing encryption.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        ensure!(!self.is_read_only(), ArenaError::ReadOnly);
        match self {
            Backing::File(f) => write_all_at(&f.file, data, offset)
                .map_err(|e| access_error(e, "write", &f.path)),
            Backing::Memory(m) => {
                let mut bytes = m.bytes.write();
                let start = offset as usize;
                let end = start + data.len();
                if bytes.len() < end {
                    bytes.resize(end, 0);
                }
                bytes[start..end].copy_from_slice(data);
                Ok(())
            }
        }
    }

    /// Writes arena data at `offset`, encrypting it first when a key is
    /// configured.
    pub fn write_data(&self, offset: u64, data: &[u8]) -> Result<()> {
        match self.encryption() {
            Some(enc) => {
                let mut sealed = data.to_vec();
                enc.encrypt(offset, &mut sealed);
                self.write_at(offset, &sealed)
            }
            None => self.write_at(offset, data),
        }
    }

    /// Grows the store to `new_len`. Never shrinks.
    pub fn grow_to(&self, new_len: u64) -> Result<()> {
        ensure!(!self.is_read_only(), ArenaError::ReadOnly);
        if self.len()? >= new_len {
            return Ok(());
        }
        match self {
            Backing::File(f) => f
                .file
                .set_len(new_len)
                .map_err(|e| access_error(e, "resize", &f.path)),
            Backing::Memory(m) => {
                m.bytes.write().resize(new_len as usize, 0);
                Ok(())
            }
        }
    }

    pub fn sync(&self) -> Result<()> {
        match self {
            Backing::File(f) if !f.read_only => f
                .file
                .sync_data()
                .map_err(|e| access_error(e, "sync", &f.path)),
            _ => Ok(()),
        }
    }

    /// Produces a read-only view of `[start, start + len)`.
    pub fn map_section(&self, start: u64, len: usize) -> Result<Mapping> {
        ensure!(len > 0, "cannot map an empty section at {}", start);

        match (self, self.encryption()) {
            (Backing::File(f), None) => {
                // SAFETY: MmapOptions::map is unsafe because the file can be
                // modified underneath the mapping. This is sound because:
                // 1. Bytes below the committed file size are never rewritten;
                //    commits only append past it and rewrite the header
                // 2. The header is read with read_at, never through a mapping
                // 3. The range lies within the file, callers map at most the
                //    committed size
                let mmap = unsafe {
                    MmapOptions::new()
                        .offset(start)
                        .len(len)
                        .map(&f.file)
                        .wrap_err_with(|| {
                            format!(
                                "failed to map {} bytes at offset {} of '{}'",
                                len,
                                start,
                                f.path.display()
                            )
                        })?
                };
                Ok(Mapping::mapped(start, mmap))
            }
            (_, encryption) => {
                let mut owned = vec![0u8; len];
                self.read_at(start, &mut owned)?;
                if let Some(enc) = encryption {
                    enc.decrypt(start, &mut owned);
                }
                Ok(Mapping::owned(start, owned.into_boxed_slice()))
            }
        }
    }

    /// Snapshot of the whole in-memory buffer. `None` for file backings.
    pub fn buffer_contents(&self) -> Option<Vec<u8>> {
        match self {
            Backing::File(_) => None,
            Backing::Memory(m) => Some(m.bytes.read().clone()),
        }
    }
}

impl FileBacking {
    fn len(&self) -> Result<u64> {
        let metadata = self
            .file
            .metadata()
            .map_err(|e| access_error(e, "stat", &self.path))?;
        Ok(metadata.len())
    }

    fn initialize(&self) -> Result<()> {
        self.file
            .set_len(INITIAL_FILE_SIZE as u64)
            .map_err(|e| access_error(e, "resize", &self.path))?;
        write_all_at(&self.file, FileHeader::empty().as_bytes(), 0)
            .map_err(|e| access_error(e, "write header of", &self.path))?;
        self.file
            .sync_all()
            .map_err(|e| access_error(e, "sync", &self.path))
    }
}

fn access_error(err: io::Error, op: &str, path: &Path) -> eyre::Report {
    eyre::Report::new(ArenaError::access(format!(
        "failed to {} '{}': {}",
        op,
        path.display(),
        err
    )))
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                let rest = buf;
                buf = &mut rest[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::cipher::tests::XorCipher;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn create_initializes_header_and_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let backing = Backing::open_file(&path, OpenMode::default(), None).unwrap();

        assert_eq!(backing.len().unwrap(), INITIAL_FILE_SIZE as u64);
        assert_eq!(backing.read_header().unwrap().top_ref(), 0);
    }

    #[test]
    fn no_create_on_missing_file_is_access_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let mode = OpenMode {
            no_create: true,
            ..OpenMode::default()
        };

        let err = Backing::open_file(&path, mode, None).unwrap_err();

        assert_eq!(ArenaError::kind_of(&err), Some(ErrorKind::AccessError));
        assert!(!path.exists());
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.db");
        drop(Backing::open_file(&path, OpenMode::default(), None).unwrap());

        let mode = OpenMode {
            read_only: true,
            ..OpenMode::default()
        };
        let backing = Backing::open_file(&path, mode, None).unwrap();

        let err = backing.write_at(4096, &[1, 2, 3]).unwrap_err();
        assert_eq!(ArenaError::kind_of(&err), Some(ErrorKind::ReadOnly));
    }

    #[test]
    fn mapped_section_sees_written_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.db");
        let backing = Backing::open_file(&path, OpenMode::default(), None).unwrap();

        backing.grow_to(8192).unwrap();
        backing.write_data(4096, b"hello").unwrap();

        let mapping = backing.map_section(0, 8192).unwrap();
        assert_eq!(&mapping.bytes()[4096..4101], b"hello");
        assert_eq!(&mapping.bytes()[16..20], b"T-DB");
    }

    #[test]
    fn grow_never_shrinks() {
        let backing = Backing::from_buffer(Vec::new(), None);

        backing.grow_to(8192).unwrap();
        backing.grow_to(100).unwrap();

        assert_eq!(backing.len().unwrap(), 8192);
    }

    #[test]
    fn memory_mapping_is_a_snapshot() {
        let backing = Backing::from_buffer(Vec::new(), None);
        let mapping = backing.map_section(0, 4096).unwrap();

        backing.write_data(100, &[9; 8]).unwrap();

        assert_eq!(&mapping.bytes()[100..108], &[0; 8]);
        assert_eq!(&backing.map_section(0, 4096).unwrap().bytes()[100..108], &[9; 8]);
    }

    #[test]
    fn encrypted_data_is_sealed_on_disk_and_clear_when_mapped() {
        let enc = Encryption::new([3u8; 32], Arc::new(XorCipher));
        let backing = Backing::from_buffer(Vec::new(), Some(enc));

        backing.write_data(512, b"secret!!").unwrap();

        let mut raw = [0u8; 8];
        backing.read_at(512, &mut raw).unwrap();
        assert_ne!(&raw, b"secret!!");

        let mapping = backing.map_section(0, 4096).unwrap();
        assert_eq!(&mapping.bytes()[512..520], b"secret!!");
        assert_eq!(&mapping.bytes()[16..20], b"T-DB");
    }
}
