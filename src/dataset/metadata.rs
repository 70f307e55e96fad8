//! Metadata CSV reading
//!
//! Each site ships a CSV with at least the columns `image_id`, `vis_class`
//! and `basename`. Other columns are ignored.

use std::path::Path;

use serde::Deserialize;

use crate::utils::error::{FogError, Result};
use crate::NUM_CLASSES;

/// One metadata row
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MetadataRow {
    pub image_id: String,
    pub vis_class: i64,
    pub basename: String,
}

impl MetadataRow {
    /// The label as a class index, validated against the known classes
    pub fn label(&self) -> Result<usize> {
        if self.vis_class < 0 || self.vis_class >= NUM_CLASSES as i64 {
            return Err(FogError::InvalidLabel {
                image_id: self.image_id.clone(),
                label: self.vis_class,
            });
        }
        Ok(self.vis_class as usize)
    }
}

/// Read every row of a metadata CSV
///
/// Fails on a missing file, a missing required column, an unparsable
/// `vis_class`, or a label outside `0..NUM_CLASSES`.
pub fn read_metadata(path: &Path) -> Result<Vec<MetadataRow>> {
    if !path.exists() {
        return Err(FogError::PathNotFound(path.to_path_buf()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| FogError::Metadata(path.to_path_buf(), e.to_string()))?;

    let mut rows = Vec::new();
    for result in reader.deserialize::<MetadataRow>() {
        let row = result.map_err(|e| FogError::Metadata(path.to_path_buf(), e.to_string()))?;
        row.label()?;
        rows.push(row);
    }

    tracing::debug!("Read {} metadata rows from {:?}", rows.len(), path);
    Ok(rows)
}
