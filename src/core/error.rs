//! Errors returned by functions in the [`crate::core`] module.

use std::{collections::TryReserveError, io};

use crate::core::addr::Haddr;

/// An error type for storage backends implementing [`crate::Driver`].
#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    IOError(#[from] io::Error),
    #[error("Access of {size} bytes at {addr:#x} is outside the driver's address space")]
    OutOfRange { addr: Haddr, size: u64 },
    #[error("File is opened read-only")]
    ReadOnly,
    #[error("Driver error: {0}")]
    Other(Box<str>),
}

/// An error type for the allocation and I/O façade.
#[derive(thiserror::Error, Debug)]
pub enum VfdError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(Box<str>),
    #[error("Address overflow: {size} bytes at {addr:#x} exceed limit {limit:#x}")]
    AddressOverflow { addr: Haddr, size: u64, limit: Haddr },
    #[error("Unable to reserve {0} bytes of bookkeeping memory")]
    NoSpace(usize),
    #[error("Driver failure: {0}")]
    Driver(#[from] DriverError),
    #[error("Internal invariant violated: {0}")]
    Logic(Box<str>),
    #[error("File serial numbers exhausted")]
    SerialExhausted,
}

impl VfdError {
    /// Maps a failed buffer reservation of `bytes` into [`VfdError::NoSpace`].
    pub(crate) fn no_space(bytes: usize) -> impl FnOnce(TryReserveError) -> Self {
        move |_| VfdError::NoSpace(bytes)
    }
}
