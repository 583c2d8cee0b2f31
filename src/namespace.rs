//! Ownership remapping for unprivileged volumes

use crate::errors::Result;
use std::path::Path;

/// Remaps file ownership of a freshly materialized volume.
///
/// Invoked once per unprivileged volume, before it is promoted.
pub trait Namespacer: Send + Sync {
    fn namespace(&self, data_path: &Path) -> Result<()>;
}

/// Leaves ownership untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNamespacer;

impl Namespacer for NoopNamespacer {
    fn namespace(&self, _data_path: &Path) -> Result<()> {
        Ok(())
    }
}
