//! Writing products to disk
//!
//! Each product lands atomically: its body goes to a temporary file next to
//! the destination, the permission mask is applied, and the file is renamed
//! into place. Writing stops at the first failure.

use crate::error::PersistError;
use shared::Product;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Destination of `name` under `root`; rejects names that could escape it
pub fn product_path(root: &Path, name: &[String]) -> Result<PathBuf, PersistError> {
    let invalid = || PersistError::InvalidName(name.to_vec());
    if name.is_empty() {
        return Err(invalid());
    }

    let mut path = root.to_path_buf();
    for segment in name {
        if segment.is_empty()
            || segment == "."
            || segment == ".."
            || segment.contains('/')
            || segment.contains('\\')
            || segment.contains('\0')
        {
            return Err(invalid());
        }
        path.push(segment);
    }
    Ok(path)
}

pub fn write_product(root: &Path, product: &Product) -> Result<PathBuf, PersistError> {
    let path = product_path(root, &product.name)?;
    let io = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| PersistError::Io { path, source }
    };

    let parent = path.parent().unwrap_or(root);
    std::fs::create_dir_all(parent).map_err(io(parent))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(io(parent))?;
    tmp.write_all(&product.body).map_err(io(tmp.path()))?;
    tmp.as_file().sync_all().map_err(io(tmp.path()))?;
    set_mode(tmp.as_file(), product.mask).map_err(io(&path))?;
    tmp.persist(&path).map_err(|e| PersistError::Io {
        path: path.clone(),
        source: e.error,
    })?;

    debug!(path = %path.display(), mask = %format!("{:o}", product.mask), "Product written");
    Ok(path)
}

/// Write every product in order, aborting on the first failure
pub fn write_all(root: &Path, products: &[Product]) -> Result<Vec<PathBuf>, PersistError> {
    for product in products {
        product_path(root, &product.name)?;
    }
    products.iter().map(|p| write_product(root, p)).collect()
}

#[cfg(unix)]
fn set_mode(file: &std::fs::File, mask: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(mask))
}

#[cfg(not(unix))]
fn set_mode(_file: &std::fs::File, _mask: u32) -> std::io::Result<()> {
    Ok(())
}
