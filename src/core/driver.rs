//! The driver contract: the boundary between the allocation engine and the
//! storage backends that hold the bytes.
//!
//! A [`DriverClass`] describes a kind of backend and opens [`Driver`]s, one
//! per open file. The engine only ever talks to a backend through these
//! traits. Capabilities a backend may lack (driver-managed allocation, handle
//! comparison, flushing) have default implementations that report the
//! capability as absent.
mod memory;
mod mmap_file;

use std::{any::Any, cmp::Ordering};

use bitflags::bitflags;

use crate::core::{
    addr::{HADDR_MAX, Haddr},
    error::DriverError,
    mem_type::{FreeListMap, MemType},
};

pub use memory::{IoStats, MemoryClass, MemoryDriver};
pub use mmap_file::{MmapClass, MmapDriver};

pub type DriverResult<T> = std::result::Result<T, DriverError>;

bitflags! {
    /// Capabilities a driver declares through [`Driver::query`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        /// Small metadata allocations are carved from larger slabs.
        const AGGREGATE_METADATA = 0x01;
        /// Metadata writes are combined in the accumulator.
        const ACCUMULATE_METADATA_WRITE = 0x02;
        /// Metadata reads may displace a dirty accumulator.
        const ACCUMULATE_METADATA_READ = 0x04;
        const ACCUMULATE_METADATA = Self::ACCUMULATE_METADATA_WRITE.bits()
            | Self::ACCUMULATE_METADATA_READ.bits();
        /// Raw data may be sieved by upper layers.
        const DATA_SIEVE = 0x08;
        /// Small raw data allocations are carved from larger slabs.
        const AGGREGATE_SMALLDATA = 0x10;
    }
}

bitflags! {
    /// How a file is opened. The empty set means read-only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const RDWR = 0x01;
        const TRUNC = 0x02;
        const EXCL = 0x04;
        const CREAT = 0x10;
    }
}

/// A kind of storage backend. Shared by every file opened through it.
pub trait DriverClass {
    /// A short name identifying the backend.
    fn name(&self) -> &str;

    /// The largest address this backend can represent.
    fn max_addr(&self) -> Haddr {
        HADDR_MAX
    }

    /// Which free list each memory type uses on files of this class.
    fn free_list_map(&self) -> FreeListMap {
        FreeListMap::per_type()
    }

    /// Opens `name`. `max_addr` is the ceiling the caller intends to use.
    fn open(&self, name: &str, flags: OpenFlags, max_addr: Haddr) -> DriverResult<Box<dyn Driver>>;
}

/// Driver-managed file space. Backends that implement it replace the
/// end-of-address bump allocator and take frees of unlisted memory types.
pub trait SpaceOps {
    fn alloc(&mut self, ty: MemType, size: u64) -> DriverResult<Haddr>;
    fn free(&mut self, ty: MemType, addr: Haddr, size: u64) -> DriverResult<()>;
}

/// An open file in some backend.
///
/// Reads of bytes that lie below the end-of-address marker but past the
/// physical end of file must succeed and produce zeros.
pub trait Driver {
    /// End of the allocated address space.
    fn eoa(&self) -> Haddr;

    fn set_eoa(&mut self, addr: Haddr) -> DriverResult<()>;

    /// End of the physical storage.
    fn eof(&self) -> Haddr;

    fn read(&mut self, ty: MemType, addr: Haddr, buf: &mut [u8]) -> DriverResult<()>;

    fn write(&mut self, ty: MemType, addr: Haddr, buf: &[u8]) -> DriverResult<()>;

    /// Releases the backend's resources. No other method is called afterwards.
    fn close(&mut self) -> DriverResult<()>;

    fn as_any(&self) -> &dyn Any;

    fn query(&self) -> Features {
        Features::empty()
    }

    fn space_ops(&mut self) -> Option<&mut dyn SpaceOps> {
        None
    }

    /// Orders two files of the same class, or `None` if this backend cannot
    /// tell them apart.
    fn cmp(&self, _other: &dyn Driver) -> Option<Ordering> {
        None
    }

    fn flush(&mut self, _closing: bool) -> DriverResult<()> {
        Ok(())
    }
}
