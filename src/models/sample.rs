//! Dataset, sample and statistics types for captionsieve.
//!
//! K_i: These types represent the core data flow through the pipeline.
//! K_i: Row order is significant and never changes.

use super::{ConfigError, DatasetConfig, Result, SieveError, parse_delimiter};
use csv::{ReaderBuilder, StringRecord};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Layout of a delimited table (shared by the input and the filtered output).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFormat {
    /// Field delimiter byte
    pub delimiter: u8,
    /// Whether a header row is read and written
    pub has_header: bool,
}

impl Default for TableFormat {
    fn default() -> Self {
        Self {
            delimiter: b'\t',
            has_header: true,
        }
    }
}

impl TableFormat {
    /// Build the table format from dataset configuration.
    pub fn from_config(config: &DatasetConfig) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            delimiter: parse_delimiter(&config.delimiter)?,
            has_header: config.has_header,
        })
    }
}

/// An in-memory tabular dataset.
///
/// K_i: Read-only once loaded; rows are addressed by their original index.
#[derive(Debug, Clone)]
pub struct Dataset {
    /// Source path (used to match resume state)
    path: PathBuf,
    /// Header row, if the table has one
    headers: Option<StringRecord>,
    /// Data rows in file order
    rows: Vec<StringRecord>,
}

impl Dataset {
    /// Load a delimited file.
    ///
    /// B_i(file exists and parses) → Result
    pub fn load(path: &Path, format: TableFormat) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .delimiter(format.delimiter)
            .has_headers(format.has_header)
            .from_path(path)?;

        let headers = if format.has_header {
            Some(reader.headers()?.clone())
        } else {
            None
        };

        let rows = reader.records().collect::<std::result::Result<Vec<_>, _>>()?;

        info!(path = %path.display(), rows = rows.len(), "Loaded dataset");

        Ok(Self {
            path: path.to_path_buf(),
            headers,
            rows,
        })
    }

    /// Build a dataset from in-memory rows.
    pub fn from_rows<R, F>(path: impl Into<PathBuf>, headers: Option<&[&str]>, rows: R) -> Self
    where
        R: IntoIterator<Item = F>,
        F: IntoIterator,
        F::Item: AsRef<str>,
    {
        Self {
            path: path.into(),
            headers: headers.map(|h| StringRecord::from(h.to_vec())),
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().collect::<StringRecord>())
                .collect(),
        }
    }

    /// Source path of the dataset.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header row, if any.
    pub fn headers(&self) -> Option<&StringRecord> {
        self.headers.as_ref()
    }

    /// Number of data rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the dataset has no data rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Resolve a column by header name, or by zero-based index when the
    /// table has no header.
    pub fn column_index(&self, column: &str) -> Result<usize> {
        let index = match &self.headers {
            Some(headers) => headers.iter().position(|h| h == column),
            None => column.parse::<usize>().ok(),
        };

        let width = self
            .headers
            .as_ref()
            .map(StringRecord::len)
            .or_else(|| self.rows.first().map(StringRecord::len));

        match (index, width) {
            (Some(i), Some(w)) if i < w => Ok(i),
            (Some(i), None) => Ok(i),
            _ => Err(SieveError::MissingColumn(column.to_string())),
        }
    }

    /// Borrow a row as a sample.
    pub fn sample(&self, index: usize) -> Option<Sample<'_>> {
        self.rows.get(index).map(|record| Sample { index, record })
    }

    /// Iterate over all rows in order.
    pub fn samples(&self) -> impl Iterator<Item = Sample<'_>> {
        self.rows
            .iter()
            .enumerate()
            .map(|(index, record)| Sample { index, record })
    }
}

/// One dataset row.
///
/// K_i: Never mutated; the pipeline only reads fields from it.
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    /// Row position in the dataset
    pub index: usize,
    record: &'a StringRecord,
}

impl<'a> Sample<'a> {
    /// Field at a resolved column index.
    pub fn field(&self, column: usize) -> Result<&'a str> {
        self.record.get(column).ok_or_else(|| {
            SieveError::InvalidInput(format!(
                "row {} has {} fields, column {} requested",
                self.index,
                self.record.len(),
                column
            ))
        })
    }

    /// The underlying record.
    pub fn record(&self) -> &'a StringRecord {
        self.record
    }
}

/// Statistics for a filtering run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Rows in the dataset
    pub total_rows: usize,

    /// Rows decided during this invocation (excludes resumed rows)
    pub processed: usize,

    /// Rows resumed from a previous checkpoint
    pub resumed: usize,

    /// Rows kept (including resumed rows)
    pub kept: usize,

    /// Rows discarded (including resumed rows)
    pub discarded: usize,

    /// Rows whose image was missing or corrupted
    pub corrupted: usize,

    /// Rows kept because the attempt limit was reached
    pub exhausted: usize,

    /// Checkpoint writes during this invocation
    pub checkpoints_written: usize,

    /// Total runtime in seconds
    pub runtime_secs: f64,

    /// Rows per hour throughput
    pub throughput_per_hour: f64,

    /// Keep rate (0.0 - 1.0)
    pub keep_rate: f64,
}

impl RunStats {
    /// Calculate derived stats.
    pub fn finalize(&mut self) {
        let decided = self.kept + self.discarded;
        if decided > 0 {
            self.keep_rate = self.kept as f64 / decided as f64;
        }
        if self.runtime_secs > 0.0 {
            self.throughput_per_hour = self.processed as f64 / self.runtime_secs * 3600.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_tsv_with_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.tsv");
        fs::write(&path, "image\tcaption\na.png\ta cat\nb.png\t\"a dog, sitting\"\n").unwrap();

        let ds = Dataset::load(&path, TableFormat::default()).unwrap();
        assert_eq!(ds.len(), 2);
        let caption = ds.column_index("caption").unwrap();
        assert_eq!(caption, 1);
        assert_eq!(ds.sample(1).unwrap().field(caption).unwrap(), "a dog, sitting");
        assert!(matches!(
            ds.column_index("url"),
            Err(SieveError::MissingColumn(_))
        ));
    }

    #[test]
    fn test_headerless_columns_by_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.csv");
        fs::write(&path, "a.png,first\nb.png,second\n").unwrap();

        let format = TableFormat {
            delimiter: b',',
            has_header: false,
        };
        let ds = Dataset::load(&path, format).unwrap();
        assert!(ds.headers().is_none());
        assert_eq!(ds.column_index("1").unwrap(), 1);
        assert!(ds.column_index("2").is_err());
        assert!(ds.column_index("caption").is_err());
        let samples: Vec<_> = ds.samples().map(|s| s.field(1).unwrap()).collect();
        assert_eq!(samples, vec!["first", "second"]);
    }

    #[test]
    fn test_run_stats_finalize() {
        let mut stats = RunStats {
            processed: 10,
            kept: 3,
            discarded: 7,
            runtime_secs: 36.0,
            ..Default::default()
        };
        stats.finalize();
        assert!((stats.keep_rate - 0.3).abs() < 1e-12);
        assert!((stats.throughput_per_hour - 1000.0).abs() < 1e-9);
    }
}
