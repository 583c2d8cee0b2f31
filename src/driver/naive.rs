//! Plain directory driver

use super::{driver_error, Driver};
use crate::errors::Result;
use crate::utils;
use std::fs;
use std::io;
use std::path::Path;

/// Volumes are ordinary directories; copy-on-write copies the whole tree
#[derive(Debug, Default, Clone, Copy)]
pub struct NaiveDriver;

impl Driver for NaiveDriver {
    fn create_volume(&self, path: &Path) -> Result<()> {
        fs::create_dir(path).map_err(|e| driver_error("create", path, e))
    }

    fn destroy_volume(&self, path: &Path) -> Result<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(driver_error("destroy", path, e)),
        }
    }

    fn create_cow_layer(&self, path: &Path, parent: &Path) -> Result<()> {
        fs::create_dir(path).map_err(|e| driver_error("create", path, e))?;
        utils::copy_tree(parent, path).map_err(|e| driver_error("copy into", path, e))
    }
}
