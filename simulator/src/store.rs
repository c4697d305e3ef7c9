//! Append-only CSV results store
//!
//! One file per method inside the output directory:
//! - `bf.csv` with header `data_structure,null_model,bf`
//! - `pvalues.csv` with header `data_structure,null_model,p.value`
//!
//! Missing statistics are written `NA`, infinite Bayes factors `Inf`.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::warn;

use crate::compare::{ComparisonResult, Method, NullModel};
use crate::datagen::Regime;
use crate::error::PersistenceError;

/// Persisted rows per replication, one per null model
pub const ROWS_PER_REPLICATION: usize = 4;

/// Persisted form of a comparison; `statistic` is `None` when the fit failed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultRow {
    pub regime: Regime,
    pub null_model: NullModel,
    pub statistic: Option<f64>,
}

impl ResultRow {
    /// Four missing rows standing in for a failed replication
    pub fn missing_replication(regime: Regime) -> Vec<ResultRow> {
        NullModel::ALL
            .into_iter()
            .map(|null_model| ResultRow {
                regime,
                null_model,
                statistic: None,
            })
            .collect()
    }
}

impl From<ComparisonResult> for ResultRow {
    fn from(result: ComparisonResult) -> Self {
        ResultRow {
            regime: result.regime,
            null_model: result.null_model,
            statistic: Some(result.statistic),
        }
    }
}

fn format_statistic(value: Option<f64>) -> String {
    match value {
        None => "NA".to_string(),
        Some(v) if v.is_nan() => "NA".to_string(),
        Some(v) if v == f64::INFINITY => "Inf".to_string(),
        Some(v) if v == f64::NEG_INFINITY => "-Inf".to_string(),
        Some(v) => v.to_string(),
    }
}

fn parse_statistic(field: &str) -> Result<Option<f64>, String> {
    match field {
        "NA" | "" => Ok(None),
        "Inf" => Ok(Some(f64::INFINITY)),
        "-Inf" => Ok(Some(f64::NEG_INFINITY)),
        other => other
            .parse::<f64>()
            .map(Some)
            .map_err(|e| format!("bad statistic '{}': {}", other, e)),
    }
}

/// Write `bytes` in full, or undo the partial write with `rollback`
///
/// The write error is reported even when the rollback itself fails.
fn write_or_rollback<W: Write>(
    writer: &mut W,
    bytes: &[u8],
    rollback: impl FnOnce() -> io::Result<()>,
) -> io::Result<()> {
    match writer.write_all(bytes).and_then(|()| writer.flush()) {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Err(undo) = rollback() {
                warn!(error = %undo, "could not truncate a partially written batch");
            }
            Err(e)
        }
    }
}

/// Results directory holding one CSV per method
#[derive(Debug, Clone)]
pub struct ResultsStore {
    dir: PathBuf,
}

impl ResultsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, method: Method) -> PathBuf {
        let name = match method {
            Method::Bayesian => "bf.csv",
            Method::Frequentist => "pvalues.csv",
        };
        self.dir.join(name)
    }

    fn header(method: Method) -> &'static str {
        match method {
            Method::Bayesian => "data_structure,null_model,bf",
            Method::Frequentist => "data_structure,null_model,p.value",
        }
    }

    /// Append rows in one write; the file and header are created on first use
    ///
    /// A failed write truncates the file back to its previous length, so the
    /// file only ever holds whole replication groups.
    pub fn append_batch(&self, method: Method, rows: &[ResultRow]) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir).map_err(|e| PersistenceError::io(&self.dir, e))?;
        let path = self.path(method);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PersistenceError::io(&path, e))?;
        let original_len = file
            .metadata()
            .map_err(|e| PersistenceError::io(&path, e))?
            .len();

        let mut text = String::new();
        if original_len == 0 {
            text.push_str(Self::header(method));
            text.push('\n');
        }
        for row in rows {
            text.push_str(&format!(
                "{},{},{}\n",
                row.regime,
                row.null_model,
                format_statistic(row.statistic)
            ));
        }

        let mut writer = &file;
        write_or_rollback(&mut writer, text.as_bytes(), || file.set_len(original_len))
            .and_then(|()| file.sync_all())
            .map_err(|e| PersistenceError::io(&path, e))
    }

    /// All rows of a method's file; an absent file reads as empty
    pub fn read_rows(&self, method: Method) -> Result<Vec<ResultRow>, PersistenceError> {
        let path = self.path(method);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::io(&path, e)),
        };

        let malformed = |line: usize, detail: String| PersistenceError::Malformed {
            path: path.clone(),
            line,
            detail,
        };

        let mut lines = content.lines().enumerate();
        match lines.next() {
            Some((_, header)) if header.trim() == Self::header(method) => {}
            Some((_, header)) => {
                return Err(malformed(1, format!("unexpected header '{}'", header.trim())))
            }
            None => return Ok(Vec::new()),
        }

        let mut rows = Vec::new();
        for (idx, line) in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != 3 {
                return Err(malformed(
                    idx + 1,
                    format!("expected 3 fields, found {}", fields.len()),
                ));
            }
            let regime = fields[0]
                .parse::<Regime>()
                .map_err(|e| malformed(idx + 1, e.to_string()))?;
            let null_model = fields[1]
                .parse::<NullModel>()
                .map_err(|e| malformed(idx + 1, e))?;
            let statistic = parse_statistic(fields[2]).map_err(|e| malformed(idx + 1, e))?;
            rows.push(ResultRow {
                regime,
                null_model,
                statistic,
            });
        }
        Ok(rows)
    }

    /// Completed replications of `regime`, counted from its persisted rows
    pub fn replications_completed(
        &self,
        method: Method,
        regime: Regime,
    ) -> Result<u64, PersistenceError> {
        let rows = self
            .read_rows(method)?
            .iter()
            .filter(|row| row.regime == regime)
            .count();
        Ok((rows / ROWS_PER_REPLICATION) as u64)
    }

    /// Remove a method's results file, if present
    pub fn clear(&self, method: Method) -> Result<(), PersistenceError> {
        let path = self.path(method);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::io(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(regime: Regime, values: [Option<f64>; 4]) -> Vec<ResultRow> {
        NullModel::ALL
            .into_iter()
            .zip(values)
            .map(|(null_model, statistic)| ResultRow {
                regime,
                null_model,
                statistic,
            })
            .collect()
    }

    #[test]
    fn test_append_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultsStore::new(dir.path().join("out"));

        store
            .append_batch(Method::Frequentist, &rows(Regime::NullRe, [Some(0.5); 4]))
            .unwrap();
        store
            .append_batch(Method::Frequentist, &rows(Regime::NullRe, [Some(0.01); 4]))
            .unwrap();

        let text = fs::read_to_string(store.path(Method::Frequentist)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 9);
        assert_eq!(lines[0], "data_structure,null_model,p.value");
        assert_eq!(lines[1], "null_re,A,0.5");
        assert_eq!(lines[8], "null_re,C2,0.01");
    }

    #[test]
    fn test_missing_and_infinite_values_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultsStore::new(dir.path());
        let written = rows(
            Regime::NullFe,
            [Some(f64::INFINITY), None, Some(2.5e-7), Some(12.75)],
        );
        store.append_batch(Method::Bayesian, &written).unwrap();

        let text = fs::read_to_string(store.path(Method::Bayesian)).unwrap();
        assert!(text.starts_with("data_structure,null_model,bf\n"));
        assert!(text.contains("null_fe,A,Inf\n"));
        assert!(text.contains("null_fe,B,NA\n"));

        assert_eq!(store.read_rows(Method::Bayesian).unwrap(), written);
    }

    #[test]
    fn test_replications_completed_per_regime() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultsStore::new(dir.path());
        assert_eq!(
            store
                .replications_completed(Method::Frequentist, Regime::NullBoth)
                .unwrap(),
            0
        );

        let mut batch = Vec::new();
        for _ in 0..3 {
            batch.extend(rows(Regime::NullBoth, [Some(0.2); 4]));
        }
        batch.extend(ResultRow::missing_replication(Regime::NullRe));
        store.append_batch(Method::Frequentist, &batch).unwrap();

        let completed = |regime| {
            store
                .replications_completed(Method::Frequentist, regime)
                .unwrap()
        };
        assert_eq!(completed(Regime::NullBoth), 3);
        assert_eq!(completed(Regime::NullRe), 1);
        assert_eq!(completed(Regime::NullNone), 0);
    }

    #[test]
    fn test_malformed_rows_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultsStore::new(dir.path());
        let path = store.path(Method::Frequentist);

        fs::write(&path, "data_structure,null_model,p.value\nnull_re,A\n").unwrap();
        assert!(matches!(
            store.read_rows(Method::Frequentist),
            Err(PersistenceError::Malformed { line: 2, .. })
        ));

        fs::write(&path, "data_structure,null_model,p.value\nnull_zz,A,0.1\n").unwrap();
        assert!(matches!(
            store.read_rows(Method::Frequentist),
            Err(PersistenceError::Malformed { line: 2, .. })
        ));

        fs::write(&path, "wrong,header\n").unwrap();
        assert!(matches!(
            store.read_rows(Method::Frequentist),
            Err(PersistenceError::Malformed { line: 1, .. })
        ));
    }

    /// Accepts `limit` bytes, then fails like a full disk
    struct FullDisk<'a> {
        file: &'a fs::File,
        limit: usize,
    }

    impl Write for FullDisk<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.limit == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let n = buf.len().min(self.limit);
            let mut file = self.file;
            let written = file.write(&buf[..n])?;
            self.limit -= written;
            Ok(written)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_write_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultsStore::new(dir.path());
        store
            .append_batch(Method::Frequentist, &rows(Regime::NullRe, [Some(0.5); 4]))
            .unwrap();
        let path = store.path(Method::Frequentist);
        let before = fs::read_to_string(&path).unwrap();

        let file = OpenOptions::new().append(true).open(&path).unwrap();
        let original_len = file.metadata().unwrap().len();
        let mut disk = FullDisk {
            file: &file,
            limit: 20,
        };
        let batch = "null_re,A,0.1\nnull_re,B,0.2\nnull_re,C1,0.3\nnull_re,C2,0.4\n";
        let result = write_or_rollback(&mut disk, batch.as_bytes(), || file.set_len(original_len));
        assert!(result.is_err());

        assert_eq!(fs::read_to_string(&path).unwrap(), before);
        assert_eq!(
            store
                .replications_completed(Method::Frequentist, Regime::NullRe)
                .unwrap(),
            1
        );

        // The next batch lands on a clean group boundary
        store
            .append_batch(Method::Frequentist, &rows(Regime::NullRe, [Some(0.01); 4]))
            .unwrap();
        let rows = store.read_rows(Method::Frequentist).unwrap();
        assert_eq!(rows.len(), 8);
        assert_eq!(rows[4].statistic, Some(0.01));
    }

    #[test]
    fn test_header_only_file_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultsStore::new(dir.path());
        fs::write(store.path(Method::Bayesian), "data_structure,null_model,bf\n").unwrap();
        assert!(store.read_rows(Method::Bayesian).unwrap().is_empty());

        // Appending to a header-only file does not duplicate the header
        store
            .append_batch(Method::Bayesian, &ResultRow::missing_replication(Regime::NullNone))
            .unwrap();
        assert_eq!(store.read_rows(Method::Bayesian).unwrap().len(), 4);

        store.clear(Method::Bayesian).unwrap();
        store.clear(Method::Bayesian).unwrap();
        assert!(!store.path(Method::Bayesian).exists());
    }
}
