//! # File space allocation for a virtual file layer
//!
//! A virtual file layer sits between a file format library and the storage
//! backends ("drivers") that hold its bytes. This crate implements the part of
//! that layer that decides where things go in the file:
//!
//! - per memory type free lists with exact, best-fit and aligned search,
//!   coalescing, and giving space back at the end of address,
//! - aggregators that carve small metadata and raw data allocations out of
//!   larger slabs,
//! - a write-combining metadata accumulator,
//! - the [`Driver`] contract backends implement, with an in-core
//!   ([`MemoryClass`]) and a memory-mapped file ([`MmapClass`]) backend.
//!
//! ## Example
//!
//! ```rust
//! # use std::sync::Arc;
//! # use vfl_alloc::{FileConfig, Library, MemType, MemoryClass, OpenFlags, Result};
//! # fn main() -> Result<()> {
//! let mut lib = Library::new();
//! let mem = lib.register(Arc::new(MemoryClass::new()));
//! let mut file = lib.open(mem, "scratch", OpenFlags::RDWR, &FileConfig::default())?;
//!
//! // Metadata is carved from a slab and written through the accumulator.
//! let header = file.alloc(MemType::Ohdr, 64)?;
//! file.write(MemType::Ohdr, header, &[0xAB; 64])?;
//!
//! // Freed space is reused by the next request of the same size.
//! let chunk = file.alloc(MemType::Draw, 4096)?;
//! file.alloc(MemType::Draw, 4096)?;
//! file.free(MemType::Draw, chunk, 4096)?;
//! assert_eq!(file.alloc(MemType::Draw, 4096)?, chunk);
//!
//! file.close()?;
//! # Ok(())
//! # }
//! ```
mod api;
mod core;

pub use api::*;
