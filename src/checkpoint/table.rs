//! Filtered table output.
//!
//! K_i: Only rows whose accumulated result is `true` are written, in
//! original order, with the dataset's delimiter and header setting.
//! K_i: The target is replaced atomically (write temp, then rename), so a
//! crash mid-write leaves the previous checkpoint intact.

use crate::models::{Dataset, Result, SieveError, TableFormat};
use csv::WriterBuilder;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Sibling path used for the in-progress write.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write the kept subset of the first `results.len()` rows of `dataset`.
///
/// Returns the number of rows written (header excluded).
pub fn write_kept_rows(
    path: &Path,
    dataset: &Dataset,
    results: &[bool],
    format: TableFormat,
) -> Result<usize> {
    if results.len() > dataset.len() {
        return Err(SieveError::Internal(format!(
            "{} results for a dataset of {} rows",
            results.len(),
            dataset.len()
        )));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| SieveError::io("creating output dir", e))?;
    }

    let temp = temp_path(path);
    let mut written = 0;
    {
        let mut writer = WriterBuilder::new()
            .delimiter(format.delimiter)
            .has_headers(false)
            .from_path(&temp)?;

        if format.has_header {
            if let Some(headers) = dataset.headers() {
                writer.write_record(headers)?;
            }
        }

        for (sample, _) in dataset
            .samples()
            .zip(results)
            .filter(|(_, keep)| **keep)
        {
            writer.write_record(sample.record())?;
            written += 1;
        }

        writer
            .flush()
            .map_err(|e| SieveError::io("flushing filtered table", e))?;
    }

    fs::rename(&temp, path).map_err(|e| SieveError::io("renaming filtered table", e))?;

    debug!(path = %path.display(), rows = written, "Filtered table written");
    Ok(written)
}
