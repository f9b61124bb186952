//! An in-core backend. File contents live in a growable byte vector that is
//! discarded when the file is closed.

use std::{any::Any, cmp::Ordering};

use crate::core::{
    addr::{HADDR_MAX, Haddr},
    driver::{Driver, DriverClass, DriverResult, Features, OpenFlags},
    error::DriverError,
    mem_type::{FreeListMap, MemType},
};

/// Counters of the calls a [`MemoryDriver`] has served.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IoStats {
    pub reads: u64,
    pub writes: u64,
    pub set_eoa_calls: u64,
    pub flushes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Address and length of the most recent write.
    pub last_write: Option<(Haddr, u64)>,
}

/// Opens [`MemoryDriver`]s.
#[derive(Clone, Debug)]
pub struct MemoryClass {
    features: Features,
    fl_map: FreeListMap,
    max_addr: Haddr,
}

impl MemoryClass {
    pub fn new() -> Self {
        MemoryClass {
            features: Features::AGGREGATE_METADATA
                | Features::ACCUMULATE_METADATA
                | Features::DATA_SIEVE
                | Features::AGGREGATE_SMALLDATA,
            fl_map: FreeListMap::per_type(),
            max_addr: HADDR_MAX,
        }
    }

    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub fn with_free_list_map(mut self, fl_map: FreeListMap) -> Self {
        self.fl_map = fl_map;
        self
    }

    pub fn with_max_addr(mut self, max_addr: Haddr) -> Self {
        self.max_addr = max_addr;
        self
    }
}

impl Default for MemoryClass {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverClass for MemoryClass {
    fn name(&self) -> &str {
        "core"
    }

    fn max_addr(&self) -> Haddr {
        self.max_addr
    }

    fn free_list_map(&self) -> FreeListMap {
        self.fl_map
    }

    fn open(&self, name: &str, _flags: OpenFlags, max_addr: Haddr) -> DriverResult<Box<dyn Driver>> {
        Ok(Box::new(MemoryDriver {
            name: name.into(),
            data: Vec::new(),
            eoa: 0,
            max_addr: max_addr.min(self.max_addr),
            features: self.features,
            stats: IoStats::default(),
        }))
    }
}

/// A file held entirely in memory.
#[derive(Debug)]
pub struct MemoryDriver {
    name: Box<str>,
    data: Vec<u8>,
    eoa: Haddr,
    max_addr: Haddr,
    features: Features,
    stats: IoStats,
}

impl MemoryDriver {
    pub fn stats(&self) -> IoStats {
        self.stats
    }

    /// Returns the byte range `[addr, addr + len)` as offsets into `data`, or
    /// an error if it is not below the end of address.
    fn span(&self, addr: Haddr, len: usize) -> DriverResult<(usize, usize)> {
        let size = len as u64;
        let out_of_range = || DriverError::OutOfRange { addr, size };
        let end = addr
            .checked_add(size)
            .filter(|&end| end <= self.eoa)
            .ok_or_else(out_of_range)?;
        let start = usize::try_from(addr).map_err(|_| out_of_range())?;
        let end = usize::try_from(end).map_err(|_| out_of_range())?;
        Ok((start, end))
    }
}

impl Driver for MemoryDriver {
    fn eoa(&self) -> Haddr {
        self.eoa
    }

    fn set_eoa(&mut self, addr: Haddr) -> DriverResult<()> {
        if addr > self.max_addr {
            return Err(DriverError::OutOfRange { addr, size: 0 });
        }
        self.stats.set_eoa_calls += 1;
        self.eoa = addr;
        Ok(())
    }

    fn eof(&self) -> Haddr {
        self.data.len() as Haddr
    }

    fn read(&mut self, _ty: MemType, addr: Haddr, buf: &mut [u8]) -> DriverResult<()> {
        let (start, end) = self.span(addr, buf.len())?;
        // Bytes past the end of file read back as zeros.
        let avail = end.min(self.data.len()).saturating_sub(start);
        if avail > 0 {
            buf[..avail].copy_from_slice(&self.data[start..start + avail]);
        }
        buf[avail..].fill(0);
        self.stats.reads += 1;
        self.stats.bytes_read += buf.len() as u64;
        Ok(())
    }

    fn write(&mut self, _ty: MemType, addr: Haddr, buf: &[u8]) -> DriverResult<()> {
        let (start, end) = self.span(addr, buf.len())?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        self.stats.writes += 1;
        self.stats.bytes_written += buf.len() as u64;
        self.stats.last_write = Some((addr, buf.len() as u64));
        Ok(())
    }

    fn close(&mut self) -> DriverResult<()> {
        self.data = Vec::new();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn query(&self) -> Features {
        self.features
    }

    fn cmp(&self, other: &dyn Driver) -> Option<Ordering> {
        let other = other.as_any().downcast_ref::<MemoryDriver>()?;
        if self.name.is_empty() || other.name.is_empty() {
            return None;
        }
        Some(self.name.cmp(&other.name))
    }

    fn flush(&mut self, _closing: bool) -> DriverResult<()> {
        self.stats.flushes += 1;
        Ok(())
    }
}
