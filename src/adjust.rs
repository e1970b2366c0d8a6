// ========================================================================================
//
//                       CLUMPING AND THRESHOLDING
//
// ========================================================================================
//
// LD-aware adjustment of summary statistics: at each p-value threshold, the
// most significant markers are retained greedily and everything in LD with a
// retained marker is zeroed. The procedure is deterministic: candidates sort
// by ascending p-value with lexical marker id as the tie-break, so two runs
// over identical inputs classify identically.
//
// The output keeps one row per input summary row at every threshold. Markers
// that are excluded, fail QC, or are unknown to the cohort keep their row with
// a zero effect; rows are never dropped and never reordered.

use crate::ldfile::LdError;
use crate::ldstore::LdStore;
use crate::manifest::CohortManifest;
use crate::sumstat::{AlignedSummary, SummaryTable};
use crate::types::MarkerIndex;
use ahash::AHashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdjustError {
    #[error("Invalid clumping parameter: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Ld(#[from] LdError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct AdjustConfig {
    /// Markers in LD above this r-squared with a retained marker are excluded.
    pub r2_threshold: f64,
    /// The p-value thresholds to evaluate, one output column each.
    pub p_thresholds: Vec<f64>,
}

impl AdjustConfig {
    fn validate(&self) -> Result<(), AdjustError> {
        if !(0.0..=1.0).contains(&self.r2_threshold) {
            return Err(AdjustError::InvalidConfig(format!(
                "r2 threshold {} is outside [0, 1]",
                self.r2_threshold
            )));
        }
        if self.p_thresholds.is_empty() {
            return Err(AdjustError::InvalidConfig(
                "at least one p-value threshold is required".to_string(),
            ));
        }
        for &t in &self.p_thresholds {
            if !(0.0..=1.0).contains(&t) {
                return Err(AdjustError::InvalidConfig(format!(
                    "p-value threshold {t} is outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// One row per input summary row, one effect column per threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjustedEffects {
    pub marker_ids: Vec<String>,
    pub thresholds: Vec<f64>,
    /// `columns[t][row]` is the adjusted effect of `marker_ids[row]` at
    /// `thresholds[t]`; zero unless the marker was retained.
    pub columns: Vec<Vec<f64>>,
}

impl AdjustedEffects {
    /// The markers retained at one threshold, as row indices.
    pub fn retained(&self, threshold_idx: usize) -> Vec<usize> {
        self.columns[threshold_idx]
            .iter()
            .enumerate()
            .filter(|(_, &b)| b != 0.0)
            .map(|(i, _)| i)
            .collect()
    }

    /// Writes the table as tab-separated text with `b_<threshold>` columns.
    pub fn write(&self, path: &Path) -> Result<(), AdjustError> {
        let io_err = |source| AdjustError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = std::io::BufWriter::new(std::fs::File::create(path).map_err(io_err)?);
        write!(writer, "marker").map_err(io_err)?;
        for t in &self.thresholds {
            write!(writer, "\tb_{t}").map_err(io_err)?;
        }
        writeln!(writer).map_err(io_err)?;
        for (row, id) in self.marker_ids.iter().enumerate() {
            write!(writer, "{id}").map_err(io_err)?;
            for column in &self.columns {
                write!(writer, "\t{}", column[row]).map_err(io_err)?;
            }
            writeln!(writer).map_err(io_err)?;
        }
        writer.flush().map_err(io_err)
    }
}

/// A summary-table row that aligned to a cohort marker and may participate in
/// clumping.
struct Candidate {
    row: usize,
    chromosome: u8,
    index: MarkerIndex,
    effect: f64,
    pvalue: f64,
}

/// Runs clumping and thresholding over the whole cohort.
///
/// Each threshold is evaluated independently: a marker retained under a
/// lenient threshold may be excluded under a stricter one because the
/// candidate set differs. An empty retained set is a valid outcome, not an
/// error.
pub fn adjust(
    manifest: &CohortManifest,
    ld: &LdStore,
    table: &SummaryTable,
    config: &AdjustConfig,
) -> Result<AdjustedEffects, AdjustError> {
    config.validate()?;

    // Row lookup by marker id, then per-chromosome alignment.
    let mut row_of: AHashMap<&str, usize> = AHashMap::new();
    let marker_ids: Vec<String> = table
        .iter()
        .enumerate()
        .map(|(row, (id, _))| {
            row_of.insert(id.as_str(), row);
            id.clone()
        })
        .collect();

    let mut candidates: Vec<Candidate> = Vec::new();
    for entry in &manifest.chromosomes {
        let aligned = AlignedSummary::align(table, entry);
        for (idx, record) in aligned.per_marker.iter().enumerate() {
            let Some(record) = record else { continue };
            let row = row_of[entry.markers[idx].id.as_str()];
            candidates.push(Candidate {
                row,
                chromosome: entry.chromosome,
                index: MarkerIndex(idx as u32),
                effect: record.effect,
                pvalue: record.pvalue,
            });
        }
    }

    // Deterministic significance order: ascending p-value, lexical id.
    candidates.sort_by(|a, b| {
        a.pvalue
            .total_cmp(&b.pvalue)
            .then_with(|| marker_ids[a.row].cmp(&marker_ids[b.row]))
    });

    // Position of each (chromosome, marker index) in the candidate list, for
    // neighbor exclusion.
    let mut candidate_slot: AHashMap<(u8, u32), usize> = AHashMap::new();
    for (slot, c) in candidates.iter().enumerate() {
        candidate_slot.insert((c.chromosome, c.index.0), slot);
    }

    let mut columns = Vec::with_capacity(config.p_thresholds.len());
    for &threshold in &config.p_thresholds {
        let mut column = vec![0.0f64; marker_ids.len()];
        // excluded[slot] marks candidates knocked out by a retained marker at
        // this threshold.
        let mut excluded = vec![false; candidates.len()];
        for (slot, candidate) in candidates.iter().enumerate() {
            if candidate.pvalue > threshold || excluded[slot] {
                continue;
            }
            column[candidate.row] = candidate.effect;
            for neighbor in
                ld.neighbors(candidate.chromosome, candidate.index, config.r2_threshold)?
            {
                if let Some(&other) = candidate_slot.get(&(candidate.chromosome, neighbor.0)) {
                    if other != slot {
                        excluded[other] = true;
                    }
                }
            }
        }
        columns.push(column);
    }

    Ok(AdjustedEffects {
        marker_ids,
        thresholds: config.p_thresholds.clone(),
        columns,
    })
}
