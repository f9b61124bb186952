//! Per-file allocation settings.

use crate::core::{
    addr::Haddr,
    consts,
    driver::Features,
    error::VfdError,
};

/// Allocation policy for a file, fixed when it is opened.
///
/// ```
/// # use vfl_alloc::{FileConfig, Features};
/// let config = FileConfig::default()
///     .alignment(4096, 1024)
///     .meta_block_size(8192)
///     .disable_features(Features::AGGREGATE_SMALLDATA);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileConfig {
    pub(crate) alignment: u64,
    pub(crate) threshold: u64,
    pub(crate) meta_block_size: u64,
    pub(crate) sdata_block_size: u64,
    pub(crate) max_addr: Option<Haddr>,
    pub(crate) disabled_features: Features,
}

impl Default for FileConfig {
    fn default() -> Self {
        FileConfig {
            alignment: 1,
            threshold: 1,
            meta_block_size: consts::DEFAULT_META_BLOCK_SIZE,
            sdata_block_size: consts::DEFAULT_SDATA_BLOCK_SIZE,
            max_addr: None,
            disabled_features: Features::empty(),
        }
    }
}

impl FileConfig {
    /// Requests of at least `threshold` bytes are placed at multiples of
    /// `alignment`. An alignment of 1 turns alignment off.
    pub fn alignment(mut self, alignment: u64, threshold: u64) -> Self {
        self.alignment = alignment;
        self.threshold = threshold;
        self
    }

    /// Size of the slabs small metadata allocations are carved from. Zero
    /// disables metadata aggregation.
    pub fn meta_block_size(mut self, size: u64) -> Self {
        self.meta_block_size = size;
        self
    }

    /// Size of the slabs small raw data allocations are carved from. Zero
    /// disables small data aggregation.
    pub fn sdata_block_size(mut self, size: u64) -> Self {
        self.sdata_block_size = size;
        self
    }

    /// Lowers the address ceiling below what the driver declares.
    pub fn max_addr(mut self, max_addr: Haddr) -> Self {
        self.max_addr = Some(max_addr);
        self
    }

    /// Masks off features the driver would otherwise enable.
    pub fn disable_features(mut self, features: Features) -> Self {
        self.disabled_features |= features;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), VfdError> {
        if self.alignment == 0 {
            return Err(VfdError::InvalidArgument("alignment must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_validation() {
        let config = FileConfig::default();
        assert_eq!(config.alignment, 1);
        assert_eq!(config.meta_block_size, 2048);
        assert!(config.validate().is_ok());

        let config = config
            .disable_features(Features::AGGREGATE_METADATA)
            .disable_features(Features::DATA_SIEVE);
        assert_eq!(
            config.disabled_features,
            Features::AGGREGATE_METADATA | Features::DATA_SIEVE
        );

        assert!(matches!(
            FileConfig::default().alignment(0, 0).validate(),
            Err(VfdError::InvalidArgument(_))
        ));
    }
}
