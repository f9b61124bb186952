//! [`VfdFile`] is an open file: a driver plus the allocation state layered
//! on top of it.
//!
//! Space management (allocation, freeing, reallocation and in-place
//! extension) lives in [`space`]. This module covers metadata-aware I/O, the
//! end of address, flushing and closing, and handle comparison.
//!
//! Metadata reads and writes go through the [`Accumulator`] when the driver
//! enables accumulation. Raw data always goes straight to the driver.

mod space;

use std::{cmp::Ordering, fmt, sync::Arc};

use tracing::{debug, trace, warn};

use crate::core::{
    accum::Accumulator,
    addr::{Haddr, addr_defined, checked_end},
    aggregator::{AggrKind, Aggregator},
    config::FileConfig,
    driver::{Driver, DriverClass, Features},
    error::VfdError,
    free_list::{FreeExtent, FreeLists},
    mem_type::{FreeListMap, MemType},
};

type Result<T> = std::result::Result<T, VfdError>;

/// Identifies an open file within a [`crate::Library`].
///
/// Serials are handed out in increasing order and never reused by the same
/// library. Files whose drivers cannot compare themselves are told apart by
/// serial.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileSerial {
    hi: u64,
    lo: u64,
}

impl FileSerial {
    pub(crate) const FIRST: FileSerial = FileSerial { hi: 0, lo: 1 };

    /// The serial after this one, or `None` once the counter is used up.
    pub(crate) fn next(self) -> Option<Self> {
        match self.lo.checked_add(1) {
            Some(lo) => Some(FileSerial { hi: self.hi, lo }),
            None => Some(FileSerial {
                hi: self.hi.checked_add(1)?,
                lo: 0,
            }),
        }
    }
}

impl fmt::Display for FileSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hi, self.lo)
    }
}

/// An open file.
///
/// Dropping a `VfdFile` closes it, but errors are then only logged; call
/// [`VfdFile::close`] to observe them.
pub struct VfdFile {
    class: Arc<dyn DriverClass>,
    driver: Box<dyn Driver>,
    serial: FileSerial,
    fl_map: FreeListMap,
    free_lists: FreeLists,
    meta_aggr: Aggregator,
    sdata_aggr: Aggregator,
    accum: Accumulator,
    alignment: u64,
    threshold: u64,
    max_addr: Haddr,
    features: Features,
    closed: bool,
}

impl VfdFile {
    pub(crate) fn new(
        class: Arc<dyn DriverClass>,
        driver: Box<dyn Driver>,
        serial: FileSerial,
        config: &FileConfig,
        max_addr: Haddr,
    ) -> Self {
        let features = driver.query() & !config.disabled_features;
        VfdFile {
            fl_map: class.free_list_map(),
            class,
            driver,
            serial,
            free_lists: FreeLists::new(),
            meta_aggr: Aggregator::new(AggrKind::Metadata, config.meta_block_size),
            sdata_aggr: Aggregator::new(AggrKind::SmallData, config.sdata_block_size),
            accum: Accumulator::new(),
            alignment: config.alignment,
            threshold: config.threshold,
            max_addr,
            features,
            closed: false,
        }
    }

    fn aggr(&self, kind: AggrKind) -> &Aggregator {
        match kind {
            AggrKind::Metadata => &self.meta_aggr,
            AggrKind::SmallData => &self.sdata_aggr,
        }
    }

    fn aggr_mut(&mut self, kind: AggrKind) -> &mut Aggregator {
        match kind {
            AggrKind::Metadata => &mut self.meta_aggr,
            AggrKind::SmallData => &mut self.sdata_aggr,
        }
    }

    /// The alignment a request of `size` bytes must satisfy, if any.
    fn alignment_for(&self, size: u64) -> Option<u64> {
        (self.alignment > 1 && size >= self.threshold).then_some(self.alignment)
    }

    fn accumulating(&self) -> bool {
        self.features.intersects(Features::ACCUMULATE_METADATA)
    }

    fn check_io(&self, addr: Haddr, len: usize) -> Result<()> {
        let size = len as u64;
        let end = checked_end(addr, size, self.max_addr)?;
        let eoa = self.driver.eoa();
        if end > eoa {
            return Err(VfdError::AddressOverflow {
                addr,
                size,
                limit: eoa,
            });
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes at `addr`, which must lie below the end of
    /// address.
    pub fn read(&mut self, ty: MemType, addr: Haddr, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.check_io(addr, buf.len())?;
        if self.accumulating() && !ty.is_raw() {
            let allow_displace = self.features.contains(Features::ACCUMULATE_METADATA_READ);
            self.accum
                .read(self.driver.as_mut(), ty, addr, buf, allow_displace)
        } else {
            Ok(self.driver.read(ty, addr, buf)?)
        }
    }

    /// Writes `buf` at `addr`, which must lie below the end of address.
    pub fn write(&mut self, ty: MemType, addr: Haddr, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.check_io(addr, buf.len())?;
        if self.accumulating() && !ty.is_raw() {
            self.accum.write(self.driver.as_mut(), addr, buf)
        } else {
            Ok(self.driver.write(ty, addr, buf)?)
        }
    }

    /// The end of the allocated address space.
    pub fn eoa(&self) -> Haddr {
        self.driver.eoa()
    }

    /// Moves the end of address. Space above the new end is no longer
    /// allocated; space below it is allocated but not tracked anywhere.
    ///
    /// Lowering the end of address drops cached metadata, slab space and free
    /// extents above it.
    pub fn set_eoa(&mut self, addr: Haddr) -> Result<()> {
        if !addr_defined(addr) || addr > self.max_addr {
            return Err(VfdError::AddressOverflow {
                addr,
                size: 0,
                limit: self.max_addr,
            });
        }
        let eoa = self.driver.eoa();
        if addr < eoa {
            self.accum.discard(self.driver.as_mut(), addr, eoa - addr)?;
            self.meta_aggr.clamp_to(addr);
            self.sdata_aggr.clamp_to(addr);
            self.free_lists.truncate(addr);
            debug!(from = eoa, to = addr, "lowered end of address");
        }
        Ok(self.driver.set_eoa(addr)?)
    }

    /// The end of the physical storage, as the driver reports it.
    pub fn eof(&self) -> Haddr {
        self.driver.eof()
    }

    /// Writes cached metadata out and flushes the driver.
    pub fn flush(&mut self) -> Result<()> {
        self.accum.flush(self.driver.as_mut())?;
        Ok(self.driver.flush(false)?)
    }

    /// Returns both aggregators' unused slab space through [`Self::free`],
    /// then flushes.
    pub fn invalidate(&mut self) -> Result<()> {
        self.return_slabs()?;
        self.flush()
    }

    fn return_slabs(&mut self) -> Result<()> {
        for kind in [AggrKind::Metadata, AggrKind::SmallData] {
            if let Some(rest) = self.aggr_mut(kind).take_remainder() {
                debug!(?kind, addr = rest.addr, size = rest.size, "returning slab remainder");
                self.free(kind.slab_type(), rest.addr, rest.size)?;
            }
        }
        Ok(())
    }

    /// Flushes everything and closes the driver.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.closed = true;
        let flushed = self
            .return_slabs()
            .and_then(|()| self.accum.flush(self.driver.as_mut()))
            .and_then(|()| Ok(self.driver.flush(true)?));

        let (mut extents, mut bytes) = (0usize, 0u64);
        for (bucket, ext) in self.free_lists.drain() {
            trace!(%bucket, addr = ext.addr, size = ext.size, "dropping free extent");
            extents += 1;
            bytes += ext.size;
        }
        if extents > 0 {
            debug!(serial = %self.serial, extents, bytes, "file space left on free lists at close");
        }

        let closed = self.driver.close().map_err(VfdError::from);
        flushed.and(closed)
    }

    /// Orders two open files: first by driver class, then by the driver's own
    /// comparison, then by serial.
    pub fn cmp(&self, other: &VfdFile) -> Ordering {
        if !Arc::ptr_eq(&self.class, &other.class) {
            let addr = |class: &Arc<dyn DriverClass>| Arc::as_ptr(class).cast::<()>() as usize;
            return self
                .class
                .name()
                .cmp(other.class.name())
                .then_with(|| addr(&self.class).cmp(&addr(&other.class)));
        }
        if let Some(ord) = Driver::cmp(self.driver.as_ref(), other.driver.as_ref()) {
            return ord;
        }
        self.serial.cmp(&other.serial)
    }

    /// Whether both handles refer to the same underlying file.
    pub fn is_same_file(&self, other: &VfdFile) -> bool {
        self.cmp(other) == Ordering::Equal
    }

    /// Total bytes on all free lists.
    pub fn free_space(&self) -> u64 {
        self.free_lists.total_free_space()
    }

    /// Bytes on the free list that `ty` allocates from.
    pub fn free_space_of(&self, ty: MemType) -> u64 {
        self.fl_map
            .resolve(ty)
            .map_or(0, |bucket| self.free_lists.free_space(bucket))
    }

    /// The extents on the free list that `ty` allocates from, most recently
    /// freed first.
    pub fn free_extents(&self, ty: MemType) -> Vec<FreeExtent> {
        self.fl_map
            .resolve(ty)
            .map(|bucket| self.free_lists.extents(bucket).copied().collect())
            .unwrap_or_default()
    }

    /// The features in effect for this file.
    pub fn features(&self) -> Features {
        self.features
    }

    pub fn max_addr(&self) -> Haddr {
        self.max_addr
    }

    pub fn serial(&self) -> FileSerial {
        self.serial
    }

    /// The underlying driver. Use [`Driver::as_any`] to reach the concrete
    /// type.
    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }
}

impl Drop for VfdFile {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.shutdown() {
            warn!(serial = %self.serial, %err, "failed to close file cleanly");
        }
    }
}

impl fmt::Debug for VfdFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VfdFile")
            .field("class", &self.class.name())
            .field("serial", &self.serial)
            .field("eoa", &self.driver.eoa())
            .field("features", &self.features)
            .field("free_space", &self.free_space())
            .field("meta_slab_remaining", &self.meta_aggr.remaining())
            .field("sdata_slab_remaining", &self.sdata_aggr.remaining())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::*;
    use crate::core::{
        addr::{HADDR_MAX, HADDR_UNDEF},
        driver::{MemoryClass, MemoryDriver, MmapClass, MmapDriver, OpenFlags},
    };

    fn open_with(class: Arc<dyn DriverClass>, name: &str, serial: FileSerial) -> VfdFile {
        let driver = class.open(name, OpenFlags::RDWR | OpenFlags::CREAT, HADDR_MAX).unwrap();
        VfdFile::new(class, driver, serial, &FileConfig::default(), HADDR_MAX)
    }

    fn open_memory(name: &str) -> VfdFile {
        open_with(Arc::new(MemoryClass::new()), name, FileSerial::FIRST)
    }

    fn memory_driver(file: &VfdFile) -> &MemoryDriver {
        file.driver().as_any().downcast_ref::<MemoryDriver>().unwrap()
    }

    #[test]
    fn test_serial_carries() {
        assert_eq!(FileSerial::FIRST.next(), Some(FileSerial { hi: 0, lo: 2 }));
        let s = FileSerial { hi: 3, lo: u64::MAX };
        assert_eq!(s.next(), Some(FileSerial { hi: 4, lo: 0 }));
        assert!(s < s.next().unwrap());
        assert_eq!(FileSerial { hi: u64::MAX, lo: u64::MAX }.next(), None);
    }

    #[test]
    fn test_io_bounds() {
        let mut file = open_memory("io");
        file.set_eoa(100).unwrap();
        assert!(matches!(
            file.write(MemType::Draw, 90, &[0; 20]),
            Err(VfdError::AddressOverflow { addr: 90, size: 20, limit: 100 })
        ));
        let mut buf = [0u8; 4];
        assert!(matches!(
            file.read(MemType::Ohdr, HADDR_UNDEF, &mut buf),
            Err(VfdError::AddressOverflow { .. })
        ));
        file.read(MemType::Ohdr, HADDR_UNDEF, &mut []).unwrap();
        file.write(MemType::Ohdr, 96, &[1; 4]).unwrap();
    }

    #[test]
    fn test_set_eoa_bounds() {
        let mut file = open_memory("eoa");
        assert!(file.set_eoa(HADDR_UNDEF).is_err());
        file.set_eoa(4096).unwrap();
        assert_eq!(file.eoa(), 4096);
        assert_eq!(file.eof(), 0);
    }

    #[test]
    fn test_raw_data_bypasses_accumulator() {
        let mut file = open_memory("raw");
        file.set_eoa(1024).unwrap();
        file.write(MemType::Draw, 0, &[5; 64]).unwrap();
        assert_eq!(memory_driver(&file).stats().writes, 1);
        assert_eq!(file.accum.range(), None);

        file.write(MemType::Lheap, 512, &[6; 64]).unwrap();
        assert_eq!(memory_driver(&file).stats().writes, 1);
        assert_eq!(file.accum.range(), Some((512, 64)));

        file.flush().unwrap();
        assert_eq!(memory_driver(&file).stats().writes, 2);
        assert!(!file.accum.is_dirty());
    }

    #[test]
    fn test_disabled_accumulation_writes_through() {
        let class = Arc::new(MemoryClass::new().with_features(Features::AGGREGATE_METADATA));
        let mut file = open_with(class, "plain", FileSerial::FIRST);
        file.set_eoa(1024).unwrap();
        file.write(MemType::Ohdr, 0, &[1; 8]).unwrap();
        let mut buf = [0u8; 8];
        file.read(MemType::Ohdr, 0, &mut buf).unwrap();
        assert_eq!(buf, [1; 8]);
        let stats = memory_driver(&file).stats();
        assert_eq!((stats.writes, stats.reads), (1, 1));
    }

    #[test]
    fn test_write_only_accumulation_reads_around_dirty_cache() {
        let features = Features::ACCUMULATE_METADATA_WRITE | Features::AGGREGATE_METADATA;
        let class = Arc::new(MemoryClass::new().with_features(features));
        let mut file = open_with(class, "write-only", FileSerial::FIRST);
        let a = file.alloc(MemType::Ohdr, 64).unwrap();
        file.alloc(MemType::Ohdr, 1000).unwrap();
        let b = file.alloc(MemType::Btree, 64).unwrap();
        assert_eq!((a, b), (0, 1064));

        file.write(MemType::Ohdr, a, &[1; 64]).unwrap();
        let mut buf = [0xFFu8; 8];
        file.read(MemType::Btree, b, &mut buf).unwrap();
        assert_eq!(buf, [0; 8]);
        assert_eq!(file.accum.range(), Some((0, 64)), "dirty cache kept");
        let stats = memory_driver(&file).stats();
        assert_eq!((stats.reads, stats.writes), (1, 0));

        file.read(MemType::Ohdr, a, &mut buf).unwrap();
        assert_eq!(buf, [1; 8]);
        assert_eq!(memory_driver(&file).stats().reads, 1);

        file.flush().unwrap();
        file.read(MemType::Btree, b, &mut buf).unwrap();
        assert_eq!(file.accum.range(), Some((b, 8)), "clean cache is reloaded");
        let stats = memory_driver(&file).stats();
        assert_eq!((stats.reads, stats.writes), (2, 1));
    }

    #[test]
    fn test_close_flushes_driver_once() {
        let mut file = open_memory("close");
        let a = file.alloc(MemType::Ohdr, 64).unwrap();
        file.write(MemType::Ohdr, a, &[1; 64]).unwrap();

        file.shutdown().unwrap();
        let stats = memory_driver(&file).stats();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.last_write, Some((0, 64)));
        assert_eq!(file.eoa(), 64);
    }

    #[test]
    fn test_invalidate_returns_slab_remainders() {
        let mut file = open_memory("invalidate");
        let a = file.alloc(MemType::Ohdr, 100).unwrap();
        let b = file.alloc(MemType::Draw, 100).unwrap();
        assert_eq!((a, b), (0, 2048));
        assert_eq!(file.eoa(), 4096);

        file.invalidate().unwrap();
        assert_eq!(file.free_space_of(MemType::Default), 1948);
        assert_eq!(file.eoa(), 2148, "small data remainder rolled back");
        assert_eq!(file.free_space_of(MemType::Draw), 0);
    }

    #[test]
    fn test_close_flushes_metadata_to_disk() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        let pattern: Vec<u8> = (0..64).collect();
        {
            let mut file = open_with(Arc::new(MmapClass::new()), path, FileSerial::FIRST);
            let addr = file.alloc(MemType::Ohdr, 64).unwrap();
            assert_eq!(addr, 0);
            file.write(MemType::Ohdr, addr, &pattern).unwrap();
            file.close().unwrap();
        }
        assert_eq!(std::fs::metadata(path).unwrap().len(), 64, "slab tail reclaimed");

        let mut d = MmapDriver::open(path, OpenFlags::empty(), HADDR_MAX, 4096).unwrap();
        let mut buf = [0u8; 64];
        d.read(MemType::Ohdr, 0, &mut buf).unwrap();
        assert_eq!(buf[..], pattern[..]);
    }

    #[test]
    fn test_drop_flushes_metadata_to_disk() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        {
            let mut file = open_with(Arc::new(MmapClass::new()), path, FileSerial::FIRST);
            let addr = file.alloc(MemType::Btree, 16).unwrap();
            file.write(MemType::Btree, addr, &[0xAB; 16]).unwrap();
        }
        let mut d = MmapDriver::open(path, OpenFlags::empty(), HADDR_MAX, 4096).unwrap();
        let mut buf = [0u8; 16];
        d.read(MemType::Btree, 0, &mut buf).unwrap();
        assert_eq!(buf, [0xAB; 16]);
    }

    #[test]
    fn test_cmp_orders_by_class_driver_then_serial() {
        let class: Arc<dyn DriverClass> = Arc::new(MemoryClass::new());
        let a = open_with(class.clone(), "a", FileSerial::FIRST);
        let a2 = open_with(class.clone(), "a", FileSerial { hi: 0, lo: 2 });
        let b = open_with(class.clone(), "b", FileSerial { hi: 0, lo: 3 });
        assert!(a.is_same_file(&a2));
        assert_eq!(a.cmp(&b), Ordering::Less);

        // Anonymous in-core files cannot be compared by the driver.
        let x = open_with(class.clone(), "", FileSerial { hi: 0, lo: 4 });
        let y = open_with(class.clone(), "", FileSerial { hi: 0, lo: 5 });
        assert_eq!(x.cmp(&y), Ordering::Less);
        assert!(!x.is_same_file(&y));

        let other_class = open_with(Arc::new(MemoryClass::new()), "a", FileSerial::FIRST);
        assert_ne!(a.cmp(&other_class), Ordering::Equal);
        assert_eq!(a.cmp(&other_class), other_class.cmp(&a).reverse());
    }
}
