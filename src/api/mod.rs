pub mod error;

use std::sync::Arc;

use tracing::debug;

use error::VfdError;

pub use crate::core::{
    addr::{HADDR_MAX, HADDR_UNDEF, Haddr, addr_defined},
    config::FileConfig,
    consts,
    driver::{
        Driver, DriverClass, DriverResult, Features, IoStats, MemoryClass, MemoryDriver,
        MmapClass, MmapDriver, OpenFlags, SpaceOps,
    },
    file::{FileSerial, VfdFile},
    free_list::FreeExtent,
    mem_type::{FreeListMap, ListTarget, MemType},
};

pub type Result<T> = std::result::Result<T, VfdError>;

/// A handle to a driver class registered with a [`Library`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DriverId(usize);

/// A library instance: the registry of driver classes and the source of
/// file serials.
///
/// Instances are independent of each other. Open files hold their driver
/// class themselves, so unregistering a class does not affect them.
pub struct Library {
    classes: Vec<Option<Arc<dyn DriverClass>>>,
    // None once every serial has been handed out.
    next_serial: Option<FileSerial>,
}

impl Default for Library {
    fn default() -> Self {
        Self::new()
    }
}

impl Library {
    pub fn new() -> Self {
        Library {
            classes: Vec::new(),
            next_serial: Some(FileSerial::FIRST),
        }
    }

    pub fn register(&mut self, class: Arc<dyn DriverClass>) -> DriverId {
        debug!(class = class.name(), id = self.classes.len(), "registered driver class");
        self.classes.push(Some(class));
        DriverId(self.classes.len() - 1)
    }

    /// Removes a class from the registry and returns it.
    pub fn unregister(&mut self, id: DriverId) -> Result<Arc<dyn DriverClass>> {
        self.classes
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| VfdError::InvalidArgument(format!("unknown driver id {}", id.0).into()))
    }

    pub fn class(&self, id: DriverId) -> Option<&Arc<dyn DriverClass>> {
        self.classes.get(id.0)?.as_ref()
    }

    /// Opens `name` with a registered driver class.
    pub fn open(&mut self, id: DriverId, name: &str, flags: OpenFlags, config: &FileConfig) -> Result<VfdFile> {
        let class = self
            .class(id)
            .cloned()
            .ok_or_else(|| VfdError::InvalidArgument(format!("unknown driver id {}", id.0).into()))?;
        self.open_with(class, name, flags, config)
    }

    /// Opens `name` with a driver class that need not be registered.
    pub fn open_with(
        &mut self,
        class: Arc<dyn DriverClass>,
        name: &str,
        flags: OpenFlags,
        config: &FileConfig,
    ) -> Result<VfdFile> {
        config.validate()?;
        let declared = class.max_addr();
        let max_addr = config.max_addr.map_or(declared, |m| m.min(declared));
        if max_addr == 0 || !addr_defined(max_addr) {
            return Err(VfdError::InvalidArgument(
                format!("bad maximum address {max_addr:#x}").into(),
            ));
        }
        let serial = self.next_serial.ok_or(VfdError::SerialExhausted)?;

        let driver = class.open(name, flags, max_addr)?;
        self.next_serial = serial.next();
        debug!(class = class.name(), name, %serial, max_addr, "opened file");
        Ok(VfdFile::new(class, driver, serial, config, max_addr))
    }
}
