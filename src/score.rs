// ========================================================================================
//
//                       THE STREAMING SCORE PROJECTOR
//
// ========================================================================================
//
// Projects per-marker weight columns onto genotypes to produce per-individual
// linear scores. The hot path is a producer/consumer pipeline per chromosome:
// an I/O producer walks the memory-mapped .bed file in marker order and feeds
// packed records through a bounded channel (natural backpressure), while
// consumer threads decode and accumulate partial score matrices that are
// summed at the end. Record buffers recycle through a shared pool to keep the
// steady state allocation-free.
//
// Markers whose weights are all zero are dropped before any I/O happens, and
// missing genotypes impute to the marker's mean allele count.

use crate::genotypes::{decode_record_into, GenotypeError, GenotypeStore};
use crate::types::{Individual, MarkerIndex, MISSING_DOSAGE};
use ahash::AHashMap;
use crossbeam_channel::bounded;
use crossbeam_queue::ArrayQueue;
use ndarray::Array2;
use rayon::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// The maximum number of in-flight records between the producer and the
/// consumers. Provides backpressure against a fast producer.
const CHANNEL_BOUND: usize = 4096;

#[derive(Error, Debug)]
pub enum ScoreError {
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
        "Weight table {path} is missing its 'marker' column; the first header field must be \
         'marker' followed by one numeric column per score"
    )]
    MissingMarkerColumn { path: PathBuf },

    #[error("Weight table {path} names no usable weight column")]
    NoWeightColumns { path: PathBuf },

    #[error("Row {row} of {path}: column '{column}' holds '{value}', which is not a number")]
    InvalidValue {
        path: PathBuf,
        row: usize,
        column: String,
        value: String,
    },

    #[error(transparent)]
    Genotype(#[from] GenotypeError),
}

/// Per-marker weights, one or more named columns, keyed by marker id.
#[derive(Debug, Clone)]
pub struct WeightTable {
    pub column_names: Vec<String>,
    rows: AHashMap<String, Vec<f64>>,
}

impl WeightTable {
    /// Reads a tab-separated weight table. The header must start with
    /// `marker`; every other column is a weight column unless `columns`
    /// restricts the selection.
    pub fn read(path: &Path, columns: Option<&[String]>) -> Result<Self, ScoreError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_path(path)
            .map_err(|source| ScoreError::Csv {
                path: path.to_path_buf(),
                source,
            })?;

        let headers = reader
            .headers()
            .map_err(|source| ScoreError::Csv {
                path: path.to_path_buf(),
                source,
            })?
            .clone();
        let mut marker_col = None;
        let mut weight_cols: Vec<(usize, String)> = Vec::new();
        for (i, name) in headers.iter().enumerate() {
            if name == "marker" {
                marker_col = Some(i);
            } else if columns.is_none_or(|wanted| wanted.iter().any(|w| w == name)) {
                weight_cols.push((i, name.to_string()));
            }
        }
        let marker_col = marker_col.ok_or_else(|| ScoreError::MissingMarkerColumn {
            path: path.to_path_buf(),
        })?;
        if weight_cols.is_empty() {
            return Err(ScoreError::NoWeightColumns {
                path: path.to_path_buf(),
            });
        }

        let mut rows = AHashMap::new();
        for (row_idx, row) in reader.records().enumerate() {
            let row = row.map_err(|source| ScoreError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
            let marker = row.get(marker_col).unwrap_or("").to_string();
            let mut weights = Vec::with_capacity(weight_cols.len());
            for (col, name) in &weight_cols {
                let raw = row.get(*col).unwrap_or("");
                let value: f64 = raw.parse().map_err(|_| ScoreError::InvalidValue {
                    path: path.to_path_buf(),
                    row: row_idx + 2,
                    column: name.clone(),
                    value: raw.to_string(),
                })?;
                weights.push(value);
            }
            rows.insert(marker, weights);
        }

        Ok(Self {
            column_names: weight_cols.into_iter().map(|(_, name)| name).collect(),
            rows,
        })
    }

    pub fn n_markers(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, marker: &str) -> Option<&[f64]> {
        self.rows.get(marker).map(Vec::as_slice)
    }

    /// Builds a single-column table from posterior or adjusted effects.
    pub fn from_column(
        name: &str,
        entries: impl IntoIterator<Item = (String, f64)>,
    ) -> Self {
        let rows = entries
            .into_iter()
            .map(|(id, w)| (id, vec![w]))
            .collect();
        Self {
            column_names: vec![name.to_string()],
            rows,
        }
    }
}

/// One row per individual, one column per weight column.
#[derive(Debug, Clone)]
pub struct ScoreTable {
    pub individuals: Vec<Individual>,
    pub column_names: Vec<String>,
    /// Shape: [n_individuals, n_columns].
    pub scores: Array2<f64>,
    /// How many markers contributed at least one non-zero weight.
    pub markers_used: usize,
}

impl ScoreTable {
    pub fn score(&self, individual: usize, column: usize) -> f64 {
        self.scores[[individual, column]]
    }

    /// Writes the table as tab-separated text with the ids preserved.
    pub fn write(&self, path: &Path) -> Result<(), ScoreError> {
        let io_err = |source| ScoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = std::io::BufWriter::new(std::fs::File::create(path).map_err(io_err)?);
        write!(writer, "fid\tiid").map_err(io_err)?;
        for name in &self.column_names {
            write!(writer, "\t{name}").map_err(io_err)?;
        }
        writeln!(writer).map_err(io_err)?;
        for (i, individual) in self.individuals.iter().enumerate() {
            write!(writer, "{}\t{}", individual.family_id, individual.individual_id)
                .map_err(io_err)?;
            for c in 0..self.column_names.len() {
                write!(writer, "\t{}", self.score(i, c)).map_err(io_err)?;
            }
            writeln!(writer).map_err(io_err)?;
        }
        writer.flush().map_err(io_err)
    }
}

/// A unit of work in flight from the producer to the consumers: one marker's
/// packed record plus what to do with it.
struct WorkItem {
    data: Vec<u8>,
    /// Index into the per-chromosome task list.
    task: usize,
}

/// One selected marker: its weights and its mean allele count for imputation.
struct ScoreTask {
    index: MarkerIndex,
    weights: Vec<f64>,
    mean_dosage: f64,
}

/// Computes all scores. Weights apply to counted copies of allele1; markers
/// absent from the weight table or carrying only zero weights are skipped
/// without touching the genotype file.
pub fn project(store: &GenotypeStore, weights: &WeightTable) -> Result<ScoreTable, ScoreError> {
    let n_individuals = store.n_individuals();
    let n_columns = weights.column_names.len();
    let mut matched = 0usize;
    let mut totals = Array2::<f64>::zeros((n_individuals, n_columns));
    let mut markers_used = 0usize;

    for chromosome in store.chromosomes() {
        let partition = store.partition(chromosome)?;

        let mut tasks: Vec<ScoreTask> = Vec::new();
        for (idx, marker) in partition.markers().iter().enumerate() {
            let Some(row) = weights.get(&marker.id) else {
                continue;
            };
            matched += 1;
            if row.iter().all(|&w| w == 0.0) {
                continue;
            }
            tasks.push(ScoreTask {
                index: MarkerIndex(idx as u32),
                weights: row.to_vec(),
                mean_dosage: 2.0 * marker.frequency,
            });
        }
        if tasks.is_empty() {
            continue;
        }
        markers_used += tasks.len();

        let (tx, rx) = bounded::<Result<WorkItem, GenotypeError>>(CHANNEL_BOUND);
        let buffer_pool = Arc::new(ArrayQueue::<Vec<u8>>::new(num_cpus::get().max(1) * 4));
        let pool_for_consumers = Arc::clone(&buffer_pool);
        let tasks = &tasks;

        let partial = std::thread::scope(|scope| {
            // --- The I/O producer ---
            scope.spawn(move || {
                for (task_idx, task) in tasks.iter().enumerate() {
                    let record = match partition.record_bytes(task.index) {
                        Ok(record) => record,
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    };
                    let mut buffer = buffer_pool.pop().unwrap_or_default();
                    buffer.clear();
                    buffer.extend_from_slice(record);
                    if tx
                        .send(Ok(WorkItem {
                            data: buffer,
                            task: task_idx,
                        }))
                        .is_err()
                    {
                        // Consumers disconnected; stop producing.
                        return;
                    }
                }
            });

            // --- The decode-and-accumulate consumers ---
            rx.into_iter()
                .par_bridge()
                .map(|item| {
                    let item = item?;
                    let task = &tasks[item.task];
                    let mut decoded = Vec::new();
                    decode_record_into(&item.data, n_individuals, &mut decoded);
                    let _ = pool_for_consumers.push(item.data);

                    let mut local = Array2::<f64>::zeros((n_individuals, n_columns));
                    for (i, &dosage) in decoded.iter().enumerate() {
                        let x = if dosage == MISSING_DOSAGE {
                            task.mean_dosage
                        } else {
                            dosage as f64
                        };
                        if x == 0.0 {
                            continue;
                        }
                        for (c, &w) in task.weights.iter().enumerate() {
                            if w != 0.0 {
                                local[[i, c]] += x * w;
                            }
                        }
                    }
                    Ok::<_, GenotypeError>(local)
                })
                .try_reduce(
                    || Array2::<f64>::zeros((n_individuals, n_columns)),
                    |mut acc, local| {
                        acc += &local;
                        Ok(acc)
                    },
                )
        });
        let partial: Array2<f64> = partial?;
        totals += &partial;
    }

    if matched == 0 {
        log::warn!("no weight-table marker matched the cohort; all scores are zero");
    }
    log::info!(
        "scored {} individuals over {} markers and {} column(s)",
        n_individuals,
        markers_used,
        n_columns
    );

    Ok(ScoreTable {
        individuals: store.individuals().to_vec(),
        column_names: weights.column_names.clone(),
        scores: totals,
        markers_used,
    })
}
