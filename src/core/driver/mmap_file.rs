//! [`MmapDriver`] keeps a file in a memory-mapped region.
//!
//! # File growth
//!
//! The end of file (EOF) is the length of the file on disk. It lags or leads
//! the end of address (EOA): writes past EOF grow the file in large chunks
//! (at least doubling it, and never by less than a minimum growth size), and
//! every flush truncates the file back to EOA so no allocated-but-unused tail
//! survives on disk.
//!
//! Reads between EOF and EOA produce zeros.
//!
//! When an existing file is opened its whole length counts as allocated,
//! i.e. EOA starts out equal to EOF.

use std::{
    any::Any,
    cmp::{Ordering, max},
    fs::{File, OpenOptions},
    ops::Deref,
    os::unix::fs::MetadataExt as _,
    path::PathBuf,
};

use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::debug;

use crate::core::{
    addr::{HADDR_MAX, Haddr},
    consts,
    driver::{Driver, DriverClass, DriverResult, Features, OpenFlags},
    error::DriverError,
    mem_type::MemType,
};

/// Opens [`MmapDriver`]s on paths in the local file system.
#[derive(Clone, Debug)]
pub struct MmapClass {
    min_growth: u64,
}

impl MmapClass {
    pub fn new() -> Self {
        MmapClass {
            min_growth: consts::MIN_FILE_GROWTH_SIZE,
        }
    }

    /// Sets the minimum number of bytes the file grows by.
    pub fn with_min_growth(mut self, min_growth: u64) -> Self {
        self.min_growth = min_growth.max(1);
        self
    }
}

impl Default for MmapClass {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverClass for MmapClass {
    fn name(&self) -> &str {
        "mmap"
    }

    fn open(&self, name: &str, flags: OpenFlags, max_addr: Haddr) -> DriverResult<Box<dyn Driver>> {
        Ok(Box::new(MmapDriver::open(
            name,
            flags,
            max_addr,
            self.min_growth,
        )?))
    }
}

/// Either flavor of mapping, depending on how the file was opened.
enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Deref for Mapping {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        match self {
            Mapping::ReadOnly(m) => m.deref(),
            Mapping::ReadWrite(m) => m.deref(),
        }
    }
}

/// A file-backed, memory-mapped driver.
pub struct MmapDriver {
    path: PathBuf,
    file: File,
    // None while the file is empty.
    mapping: Option<Mapping>,
    writable: bool,
    eoa: Haddr,
    eof: u64,
    max_addr: Haddr,
    min_growth: u64,
    // (device, inode)
    ident: (u64, u64),
    // Nothing written or resized since the last flush.
    synced: bool,
}

impl MmapDriver {
    /// Opens (or creates, per `flags`) the file at `path`.
    pub fn open(path: &str, flags: OpenFlags, max_addr: Haddr, min_growth: u64) -> DriverResult<Self> {
        let writable = flags.contains(OpenFlags::RDWR);
        let mut options = OpenOptions::new();
        options.read(true).write(writable);
        if writable && flags.contains(OpenFlags::CREAT) {
            if flags.contains(OpenFlags::EXCL) {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }
        if writable && flags.contains(OpenFlags::TRUNC) {
            options.truncate(true);
        }
        let file = options.open(path)?;
        let metadata = file.metadata()?;
        let eof = metadata.len();
        if eof > max_addr {
            return Err(DriverError::OutOfRange {
                addr: 0,
                size: eof,
            });
        }
        let mapping = Self::map(&file, eof, writable)?;
        debug!(path, eof, writable, "opened mmap file");
        Ok(MmapDriver {
            path: PathBuf::from(path),
            file,
            mapping,
            writable,
            eoa: eof,
            eof,
            max_addr: max_addr.min(HADDR_MAX),
            min_growth: min_growth.max(1),
            ident: (metadata.dev(), metadata.ino()),
            synced: true,
        })
    }

    fn map(file: &File, len: u64, writable: bool) -> DriverResult<Option<Mapping>> {
        if len == 0 {
            return Ok(None);
        }
        // Safety: it is assumed that no other process has a mutable mapping to the same file.
        let mapping = unsafe {
            if writable {
                Mapping::ReadWrite(MmapOptions::new().map_mut(file)?)
            } else {
                Mapping::ReadOnly(MmapOptions::new().map(file)?)
            }
        };
        Ok(Some(mapping))
    }

    /// Resizes the file (and mapping) to `new_len`.
    fn resize(&mut self, new_len: u64) -> DriverResult<()> {
        if let Some(Mapping::ReadWrite(m)) = &self.mapping {
            m.flush()?;
        }
        self.mapping = None;
        self.file.set_len(new_len)?;
        self.mapping = Self::map(&self.file, new_len, self.writable)?;
        debug!(path = ?self.path, from = self.eof, to = new_len, "resized mmap file");
        self.eof = new_len;
        Ok(())
    }

    /// Grows the file so that it holds at least `end` bytes.
    fn grow_to(&mut self, end: u64) -> DriverResult<()> {
        if end <= self.eof {
            return Ok(());
        }
        let expand = max(self.eof, self.min_growth);
        let new_len = max(end, self.eof.saturating_add(expand));
        self.resize(new_len)
    }

    fn check_span(&self, addr: Haddr, len: usize) -> DriverResult<u64> {
        let size = len as u64;
        addr.checked_add(size)
            .filter(|&end| end <= self.eoa)
            .ok_or(DriverError::OutOfRange { addr, size })
    }
}

impl Driver for MmapDriver {
    fn eoa(&self) -> Haddr {
        self.eoa
    }

    fn set_eoa(&mut self, addr: Haddr) -> DriverResult<()> {
        if addr > self.max_addr {
            return Err(DriverError::OutOfRange { addr, size: 0 });
        }
        if addr != self.eoa {
            self.eoa = addr;
            self.synced = false;
        }
        Ok(())
    }

    fn eof(&self) -> Haddr {
        self.eof
    }

    fn read(&mut self, _ty: MemType, addr: Haddr, buf: &mut [u8]) -> DriverResult<()> {
        self.check_span(addr, buf.len())?;
        let avail = self.eof.saturating_sub(addr).min(buf.len() as u64) as usize;
        if avail > 0 {
            let start = addr as usize;
            let mapping = self
                .mapping
                .as_deref()
                .ok_or(DriverError::Other("file has no mapping".into()))?;
            buf[..avail].copy_from_slice(&mapping[start..start + avail]);
        }
        buf[avail..].fill(0);
        Ok(())
    }

    fn write(&mut self, _ty: MemType, addr: Haddr, buf: &[u8]) -> DriverResult<()> {
        if !self.writable {
            return Err(DriverError::ReadOnly);
        }
        let end = self.check_span(addr, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        self.grow_to(end)?;
        let Some(Mapping::ReadWrite(m)) = &mut self.mapping else {
            return Err(DriverError::Other("file has no writable mapping".into()));
        };
        let start = addr as usize;
        m[start..start + buf.len()].copy_from_slice(buf);
        self.synced = false;
        Ok(())
    }

    fn close(&mut self) -> DriverResult<()> {
        self.flush(true)?;
        self.mapping = None;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn query(&self) -> Features {
        Features::AGGREGATE_METADATA
            | Features::ACCUMULATE_METADATA
            | Features::DATA_SIEVE
            | Features::AGGREGATE_SMALLDATA
    }

    fn cmp(&self, other: &dyn Driver) -> Option<Ordering> {
        let other = other.as_any().downcast_ref::<MmapDriver>()?;
        Some(self.ident.cmp(&other.ident))
    }

    fn flush(&mut self, _closing: bool) -> DriverResult<()> {
        if !self.writable || self.synced {
            return Ok(());
        }
        if let Some(Mapping::ReadWrite(m)) = &self.mapping {
            m.flush()?;
        }
        if self.eoa != self.eof {
            self.resize(self.eoa)?;
        }
        self.file.sync_all()?;
        self.synced = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::*;

    fn open(path: &str, flags: OpenFlags) -> MmapDriver {
        MmapDriver::open(path, flags, HADDR_MAX, consts::MIN_FILE_GROWTH_SIZE).unwrap()
    }

    #[test]
    fn test_write_grows_and_flush_truncates_to_eoa() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        let mut d = open(path, OpenFlags::RDWR);
        assert_eq!(d.eof(), 0);

        d.set_eoa(100).unwrap();
        d.write(MemType::Default, 90, &[9; 10]).unwrap();
        assert!(
            d.eof() >= consts::MIN_FILE_GROWTH_SIZE,
            "growth happens in chunks"
        );

        d.flush(false).unwrap();
        assert_eq!(d.eof(), 100);
        assert_eq!(std::fs::metadata(path).unwrap().len(), 100);
    }

    #[test]
    fn test_flush_skipped_when_unchanged() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        let mut d = open(path, OpenFlags::RDWR);
        assert!(d.synced);

        d.set_eoa(10).unwrap();
        d.write(MemType::Ohdr, 0, &[3; 10]).unwrap();
        assert!(!d.synced);
        d.flush(true).unwrap();
        assert!(d.synced);

        d.set_eoa(10).unwrap();
        assert!(d.synced, "same end of address");
        d.close().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), [3; 10]);
    }

    #[test]
    fn test_reopen_preserves_contents() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        let pattern = [0xDE, 0xAD, 0xBE, 0xEF];
        {
            let mut d = open(path, OpenFlags::RDWR);
            d.set_eoa(64).unwrap();
            d.write(MemType::Super, 50, &pattern).unwrap();
            d.close().unwrap();
        }
        let mut d = open(path, OpenFlags::empty());
        assert_eq!(d.eoa(), 64, "existing contents count as allocated");
        let mut buf = [0u8; 4];
        d.read(MemType::Super, 50, &mut buf).unwrap();
        assert_eq!(buf, pattern);
        assert!(matches!(
            d.write(MemType::Super, 0, &[1]),
            Err(DriverError::ReadOnly)
        ));
    }

    #[test]
    fn test_read_between_eof_and_eoa_is_zero() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        let mut d = open(path, OpenFlags::RDWR);
        d.set_eoa(1 << 20).unwrap();
        d.write(MemType::Draw, 0, &[1, 2]).unwrap();
        let mut buf = [0xFFu8; 6];
        d.read(MemType::Draw, (1 << 20) - 6, &mut buf).unwrap();
        assert_eq!(buf, [0; 6]);
        d.read(MemType::Draw, 0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 0, 0, 0, 0]);
    }

    #[test]
    fn test_excl_refuses_existing_file() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        let result = MmapDriver::open(
            path,
            OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::EXCL,
            HADDR_MAX,
            consts::MIN_FILE_GROWTH_SIZE,
        );
        assert!(matches!(result, Err(DriverError::IOError(_))));
    }

    #[test]
    fn test_cmp_same_inode() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        let other_file = NamedTempFile::new().unwrap();
        let a = open(path, OpenFlags::empty());
        let b = open(path, OpenFlags::empty());
        let c = open(other_file.path().to_str().unwrap(), OpenFlags::empty());
        assert_eq!(Driver::cmp(&a, &b), Some(Ordering::Equal));
        assert_ne!(Driver::cmp(&a, &c), Some(Ordering::Equal));
    }
}
