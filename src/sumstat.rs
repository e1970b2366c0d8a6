// ========================================================================================
//
//                       SUMMARY-STATISTIC INGESTION
//
// ========================================================================================
//
// Reads GWAS summary-statistic tables and validates them against the schema
// contract before anything downstream runs. Tables are keyed by marker id and
// are never silently reordered: the input row order is preserved, and
// alignment against a cohort annotates rather than rewrites.

use crate::manifest::ChromosomeEntry;
use crate::types::SummaryRecord;
use ahash::AHashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The required columns of a summary-statistic table, in canonical order.
pub const REQUIRED_COLUMNS: [&str; 6] =
    ["marker", "effect", "se", "pvalue", "effect_allele", "freq"];

#[derive(Error, Debug)]
pub enum SumstatError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error(
        "Summary-statistic table {path} is missing required column(s): {}. \
         Expected the tab-separated header to contain: {}.",
        .missing.join(", "),
        REQUIRED_COLUMNS.join(", ")
    )]
    MissingColumns { path: PathBuf, missing: Vec<String> },

    #[error("Row {row} of {path}: column '{column}' holds '{value}', which is not a number")]
    InvalidValue {
        path: PathBuf,
        row: usize,
        column: String,
        value: String,
    },

    #[error("Marker '{0}' appears more than once in the summary-statistic table")]
    DuplicateMarker(String),
}

/// A validated summary-statistic table in its original row order.
#[derive(Debug, Clone)]
pub struct SummaryTable {
    records: Vec<(String, SummaryRecord)>,
    index: AHashMap<String, usize>,
}

impl SummaryTable {
    /// Reads and validates a tab-separated summary-statistic table.
    pub fn read(path: &Path) -> Result<Self, SumstatError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_path(path)
            .map_err(|source| SumstatError::Csv {
                path: path.to_path_buf(),
                source,
            })?;

        let headers = reader
            .headers()
            .map_err(|source| SumstatError::Csv {
                path: path.to_path_buf(),
                source,
            })?
            .clone();
        let mut positions = AHashMap::new();
        for (i, name) in headers.iter().enumerate() {
            positions.insert(name.to_string(), i);
        }
        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|&&name| !positions.contains_key(name))
            .map(|&name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(SumstatError::MissingColumns {
                path: path.to_path_buf(),
                missing,
            });
        }

        let column = |record: &csv::StringRecord, name: &str| -> String {
            record.get(positions[name]).unwrap_or("").to_string()
        };
        let numeric = |record: &csv::StringRecord, name: &str, row: usize| -> Result<f64, SumstatError> {
            let raw = record.get(positions[name]).unwrap_or("");
            raw.parse().map_err(|_| SumstatError::InvalidValue {
                path: path.to_path_buf(),
                row,
                column: name.to_string(),
                value: raw.to_string(),
            })
        };

        let mut records = Vec::new();
        let mut index = AHashMap::new();
        for (row_idx, row) in reader.records().enumerate() {
            let row = row.map_err(|source| SumstatError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
            let marker = column(&row, "marker");
            let record = SummaryRecord {
                effect: numeric(&row, "effect", row_idx + 2)?,
                se: numeric(&row, "se", row_idx + 2)?,
                pvalue: numeric(&row, "pvalue", row_idx + 2)?,
                effect_allele: column(&row, "effect_allele"),
                frequency: numeric(&row, "freq", row_idx + 2)?,
            };
            if index.insert(marker.clone(), records.len()).is_some() {
                return Err(SumstatError::DuplicateMarker(marker));
            }
            records.push((marker, record));
        }

        Ok(Self { records, index })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows in input order.
    pub fn iter(&self) -> impl Iterator<Item = &(String, SummaryRecord)> {
        self.records.iter()
    }

    pub fn get(&self, marker: &str) -> Option<&SummaryRecord> {
        self.index.get(marker).map(|&i| &self.records[i].1)
    }
}

/// Summary statistics aligned to one chromosome's marker order. `None` marks
/// markers with no usable statistic (absent from the table, failing QC, or
/// with alleles that match neither side of the fileset's definition).
#[derive(Debug, Clone)]
pub struct AlignedSummary {
    pub chromosome: u8,
    pub per_marker: Vec<Option<SummaryRecord>>,
}

impl AlignedSummary {
    /// Aligns a table against one chromosome. Effects reported for the
    /// fileset's second allele are flipped (sign and frequency) so every
    /// aligned effect counts copies of allele1. Markers whose effect allele
    /// matches neither fileset allele are dropped with a warning rather than
    /// guessed at.
    pub fn align(table: &SummaryTable, entry: &ChromosomeEntry) -> Self {
        let mut per_marker = Vec::with_capacity(entry.markers.len());
        let mut dropped = 0usize;
        for marker in &entry.markers {
            if !marker.qc_pass {
                per_marker.push(None);
                continue;
            }
            let aligned = table.get(&marker.id).and_then(|record| {
                if record.effect_allele == marker.allele1 {
                    Some(record.clone())
                } else if record.effect_allele == marker.allele2 {
                    Some(SummaryRecord {
                        effect: -record.effect,
                        frequency: 1.0 - record.frequency,
                        effect_allele: marker.allele1.clone(),
                        ..record.clone()
                    })
                } else {
                    dropped += 1;
                    None
                }
            });
            per_marker.push(aligned);
        }
        if dropped > 0 {
            log::warn!(
                "chromosome {}: {} marker(s) dropped because the effect allele matches neither \
                 fileset allele",
                entry.chromosome,
                dropped
            );
        }
        Self {
            chromosome: entry.chromosome,
            per_marker,
        }
    }

    pub fn n_usable(&self) -> usize {
        self.per_marker.iter().filter(|r| r.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Marker;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_table(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "{body}").unwrap();
        path
    }

    fn marker(id: &str, a1: &str, a2: &str) -> Marker {
        Marker {
            id: id.to_string(),
            chromosome: 1,
            genetic_position: 0.0,
            position: 1000,
            allele1: a1.to_string(),
            allele2: a2.to_string(),
            frequency: 0.3,
            missingness: 0.0,
            qc_pass: true,
        }
    }

    #[test]
    fn reads_a_valid_table_in_order() {
        let dir = TempDir::new().unwrap();
        let path = write_table(
            dir.path(),
            "stats.tsv",
            "marker\teffect\tse\tpvalue\teffect_allele\tfreq\n\
             rs2\t0.10\t0.02\t0.001\tA\t0.25\n\
             rs1\t-0.05\t0.03\t0.200\tC\t0.40\n",
        );
        let table = SummaryTable::read(&path).unwrap();
        assert_eq!(table.len(), 2);
        let ids: Vec<&str> = table.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["rs2", "rs1"]);
        assert_eq!(table.get("rs1").unwrap().effect, -0.05);
    }

    #[test]
    fn missing_columns_are_all_named() {
        let dir = TempDir::new().unwrap();
        let path = write_table(
            dir.path(),
            "stats.tsv",
            "marker\teffect\tse\n rs1\t0.1\t0.02\n",
        );
        match SummaryTable::read(&path) {
            Err(SumstatError::MissingColumns { missing, .. }) => {
                assert_eq!(missing, vec!["pvalue", "effect_allele", "freq"]);
            }
            Err(other) => panic!("expected MissingColumns, got {other}"),
            Ok(_) => panic!("expected MissingColumns"),
        }
    }

    #[test]
    fn non_numeric_values_are_rejected_with_context() {
        let dir = TempDir::new().unwrap();
        let path = write_table(
            dir.path(),
            "stats.tsv",
            "marker\teffect\tse\tpvalue\teffect_allele\tfreq\n\
             rs1\tnot_a_number\t0.02\t0.5\tA\t0.3\n",
        );
        match SummaryTable::read(&path) {
            Err(SumstatError::InvalidValue { column, row, .. }) => {
                assert_eq!(column, "effect");
                assert_eq!(row, 2);
            }
            Err(other) => panic!("expected InvalidValue, got {other}"),
            Ok(_) => panic!("expected InvalidValue"),
        }
    }

    #[test]
    fn duplicate_markers_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_table(
            dir.path(),
            "stats.tsv",
            "marker\teffect\tse\tpvalue\teffect_allele\tfreq\n\
             rs1\t0.1\t0.02\t0.5\tA\t0.3\n\
             rs1\t0.2\t0.02\t0.5\tA\t0.3\n",
        );
        assert!(matches!(
            SummaryTable::read(&path),
            Err(SumstatError::DuplicateMarker(_))
        ));
    }

    #[test]
    fn alignment_flips_allele2_effects() {
        let dir = TempDir::new().unwrap();
        let path = write_table(
            dir.path(),
            "stats.tsv",
            "marker\teffect\tse\tpvalue\teffect_allele\tfreq\n\
             rs1\t0.10\t0.02\t0.001\tA\t0.25\n\
             rs2\t0.20\t0.02\t0.001\tG\t0.60\n\
             rs3\t0.30\t0.02\t0.001\tT\t0.50\n",
        );
        let table = SummaryTable::read(&path).unwrap();
        let entry = ChromosomeEntry {
            chromosome: 1,
            fileset_prefix: dir.path().join("chr1"),
            markers: vec![
                marker("rs1", "A", "C"),
                marker("rs2", "C", "G"),
                marker("rs3", "A", "C"),
            ],
        };

        let aligned = AlignedSummary::align(&table, &entry);
        assert_eq!(aligned.n_usable(), 2);
        // rs1 matches allele1 directly.
        assert_eq!(aligned.per_marker[0].as_ref().unwrap().effect, 0.10);
        // rs2's effect allele is the fileset's allele2: sign and freq flip.
        let flipped = aligned.per_marker[1].as_ref().unwrap();
        assert_eq!(flipped.effect, -0.20);
        assert!((flipped.frequency - 0.40).abs() < 1e-12);
        // rs3 matches neither allele and is dropped.
        assert!(aligned.per_marker[2].is_none());
    }
}
