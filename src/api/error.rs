pub use crate::core::error::{DriverError, VfdError};
