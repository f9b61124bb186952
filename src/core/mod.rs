//! The `core` module contains the allocation engine that sits between an
//! open file's users and its storage [`driver`].
//!
//! Space is handed out from the [`free_list`] first, then carved from an
//! [`aggregator`] slab, then taken from the end of address. Metadata I/O is
//! combined in the [`accum`]ulator. [`file::VfdFile`] ties these together.
pub(crate) mod accum;
pub mod addr;
pub(crate) mod aggregator;
pub(crate) mod config;
pub mod consts;
pub(crate) mod driver;
pub(crate) mod error;
pub(crate) mod file;
pub(crate) mod free_list;
pub(crate) mod mem_type;
