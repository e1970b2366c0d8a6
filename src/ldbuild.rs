// ========================================================================================
//
//                       THE SPARSE LD BUILDER
//
// ========================================================================================
//
// Computes windowed pairwise marker correlations per chromosome and serializes
// them through `ldfile`. Chromosomes build in parallel; each rayon worker owns
// exclusive read access to one chromosome's genotypes and exclusive write
// access to one LD file, so there is no shared mutable state between workers.
//
// Within a chromosome, markers are visited in genomic order with a forward
// sliding cache of standardized columns, so the full genotype matrix is never
// resident. Each pair is computed once and mirrored into both band rows, which
// makes symmetry exact by construction.

use crate::genotypes::{ChromosomePartition, GenotypeStore};
use crate::ldfile::{self, LdError, SparseLdBlock};
use crate::types::{chromosome_label, MarkerIndex, MISSING_DOSAGE};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The window within which correlations are computed and stored. Exactly one
/// unit applies per build; everything outside the window is defined to be zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LdWindow {
    /// At most this many QC-passing markers on each side of the focal marker.
    Markers(usize),
    /// All markers within this many base pairs of the focal marker.
    BasePairs(u32),
    /// All markers within this genetic distance (centimorgans) of the focal
    /// marker.
    CentiMorgans(f64),
}

/// How missing genotypes enter the correlation. This is an explicit, documented
/// choice, never an implicit one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MissingPolicy {
    /// Missing genotypes are replaced by the marker's mean allele count before
    /// centering; with standardized columns a missing value contributes zero to
    /// every cross-product. The default.
    #[default]
    MeanImpute,
    /// Pairs with a missing genotype in either marker are dropped from the
    /// cross-product; means and variances are recomputed over the complete
    /// pairs for each marker pair.
    PairwiseComplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdBuildConfig {
    pub window: LdWindow,
    pub missing: MissingPolicy,
    /// Correlations with |r| strictly below this are stored as exact zeros for
    /// compactness. Zero keeps everything.
    pub zero_threshold: f64,
    /// Refuse to replace an existing LD file unless set.
    pub overwrite: bool,
}

impl Default for LdBuildConfig {
    fn default() -> Self {
        Self {
            window: LdWindow::Markers(1000),
            missing: MissingPolicy::default(),
            zero_threshold: 0.0,
            overwrite: false,
        }
    }
}

/// The canonical file name for a chromosome's LD block within an output
/// directory.
pub fn ld_file_name(chromosome: u8) -> String {
    format!("chr{}.ld", chromosome_label(chromosome))
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    pb.set_style(
        ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap()
        .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb.set_message(message.to_string());

    pb
}

/// Builds sparse LD blocks for every chromosome in the store, writes one file
/// per chromosome under `out_dir`, and returns the in-memory blocks keyed by
/// chromosome. Existing files fail the whole build up front unless `overwrite`
/// is set; nothing expensive runs before that check.
pub fn build_all(
    store: &GenotypeStore,
    out_dir: &Path,
    config: &LdBuildConfig,
) -> Result<BTreeMap<u8, SparseLdBlock>, LdError> {
    let chromosomes: Vec<u8> = store.chromosomes().collect();

    let mut paths: Vec<(u8, PathBuf)> = Vec::with_capacity(chromosomes.len());
    for &chromosome in &chromosomes {
        let path = out_dir.join(ld_file_name(chromosome));
        if path.exists() && !config.overwrite {
            return Err(LdError::AlreadyExists { path });
        }
        paths.push((chromosome, path));
    }

    let total_markers: u64 = chromosomes
        .iter()
        .map(|&c| store.partition(c).map(|p| p.n_markers() as u64).unwrap_or(0))
        .sum();
    let pb = Arc::new(create_progress_bar(total_markers, "Building sparse LD..."));

    let built: Result<Vec<(u8, SparseLdBlock)>, LdError> = paths
        .par_iter()
        .map(|(chromosome, path)| {
            let partition = store.partition(*chromosome)?;
            let block = build_chromosome(partition, config, Some(&pb))?;
            ldfile::write_block(path, &block)?;
            log::info!(
                "chromosome {}: sparse LD written to {}",
                chromosome,
                path.display()
            );
            Ok((*chromosome, block))
        })
        .collect();
    pb.finish_and_clear();

    Ok(built?.into_iter().collect())
}

/// A standardized marker column plus the raw counts needed for the
/// pairwise-complete policy.
struct PreparedColumn {
    /// Centered, scaled counts; exactly zero where the genotype was missing
    /// under the mean-imputation policy.
    z: Vec<f64>,
    /// Raw allele counts with the missing sentinel, kept for pairwise deletion.
    raw: Vec<u8>,
    /// True when the column has zero variance and carries no signal.
    degenerate: bool,
}

fn prepare_column(partition: &ChromosomePartition, marker: MarkerIndex) -> Result<PreparedColumn, LdError> {
    let mut raw = Vec::new();
    partition.decode_column(marker, &mut raw)?;

    let mut sum = 0.0f64;
    let mut observed = 0usize;
    for &d in &raw {
        if d != MISSING_DOSAGE {
            sum += d as f64;
            observed += 1;
        }
    }
    let mean = if observed == 0 { 0.0 } else { sum / observed as f64 };

    let mut centered: Vec<f64> = raw
        .iter()
        .map(|&d| {
            if d == MISSING_DOSAGE {
                0.0
            } else {
                d as f64 - mean
            }
        })
        .collect();

    let n = raw.len() as f64;
    let var = centered.iter().map(|v| v * v).sum::<f64>() / n;
    let degenerate = var <= f64::EPSILON;
    if !degenerate {
        let scale = 1.0 / var.sqrt();
        for v in &mut centered {
            *v *= scale;
        }
    }

    Ok(PreparedColumn {
        z: centered,
        raw,
        degenerate,
    })
}

/// Pearson correlation between two prepared columns under the given policy.
fn pair_correlation(a: &PreparedColumn, b: &PreparedColumn, policy: MissingPolicy) -> f64 {
    if a.degenerate || b.degenerate {
        return 0.0;
    }
    match policy {
        MissingPolicy::MeanImpute => {
            let n = a.z.len() as f64;
            a.z.iter().zip(&b.z).map(|(x, y)| x * y).sum::<f64>() / n
        }
        MissingPolicy::PairwiseComplete => {
            let mut n = 0.0f64;
            let mut sx = 0.0;
            let mut sy = 0.0;
            let mut sxx = 0.0;
            let mut syy = 0.0;
            let mut sxy = 0.0;
            for (&da, &db) in a.raw.iter().zip(&b.raw) {
                if da == MISSING_DOSAGE || db == MISSING_DOSAGE {
                    continue;
                }
                let (x, y) = (da as f64, db as f64);
                n += 1.0;
                sx += x;
                sy += y;
                sxx += x * x;
                syy += y * y;
                sxy += x * y;
            }
            if n < 2.0 {
                return 0.0;
            }
            let cov = sxy - sx * sy / n;
            let vx = sxx - sx * sx / n;
            let vy = syy - sy * sy / n;
            if vx <= f64::EPSILON || vy <= f64::EPSILON {
                0.0
            } else {
                cov / (vx * vy).sqrt()
            }
        }
    }
}

/// Builds the sparse banded correlation structure for one chromosome.
///
/// Band rows are indexed by the chromosome's full marker index space so that
/// downstream lookups use the same indices as the genotype store. QC-failing
/// markers get empty bands and never appear in any other marker's band.
pub fn build_chromosome(
    partition: &ChromosomePartition,
    config: &LdBuildConfig,
    progress: Option<&ProgressBar>,
) -> Result<SparseLdBlock, LdError> {
    let markers = partition.markers();
    let n = markers.len();

    // Rank of each QC-passing marker within the passing subset, for the
    // marker-count window unit.
    let mut qc_rank = vec![usize::MAX; n];
    let mut rank = 0usize;
    for (i, marker) in markers.iter().enumerate() {
        if marker.qc_pass {
            qc_rank[i] = rank;
            rank += 1;
        }
    }

    // Band bounds per marker, inclusive. Empty for QC failures.
    let in_window = |i: usize, j: usize| -> bool {
        match config.window {
            LdWindow::Markers(w) => qc_rank[i].abs_diff(qc_rank[j]) <= w,
            LdWindow::BasePairs(b) => {
                markers[i].position.abs_diff(markers[j].position) <= b
            }
            LdWindow::CentiMorgans(d) => {
                (markers[i].genetic_position - markers[j].genetic_position).abs() <= d
            }
        }
    };

    let mut band_lo = vec![0usize; n];
    let mut band_hi = vec![0usize; n];
    for i in 0..n {
        if !markers[i].qc_pass {
            // Empty band: lo strictly above hi, without wrapping at index 0.
            band_lo[i] = i + 1;
            band_hi[i] = i;
            continue;
        }
        // The band spans from the furthest passing marker still in window on
        // the left to the furthest on the right. Failing markers strictly
        // inside that span stay in the band as stored zeros, which keeps the
        // row contiguous.
        let mut lo = i;
        for j in (0..i).rev() {
            if markers[j].qc_pass {
                if in_window(i, j) {
                    lo = j;
                } else {
                    break;
                }
            }
        }
        let mut hi = i;
        for j in (i + 1)..n {
            if markers[j].qc_pass {
                if in_window(i, j) {
                    hi = j;
                } else {
                    break;
                }
            }
        }
        band_lo[i] = lo;
        band_hi[i] = hi;
    }

    let mut rows: Vec<Vec<f64>> = (0..n)
        .map(|i| {
            if band_hi[i] < band_lo[i] {
                Vec::new()
            } else {
                vec![0.0; band_hi[i] - band_lo[i] + 1]
            }
        })
        .collect();
    for i in 0..n {
        if markers[i].qc_pass {
            rows[i][i - band_lo[i]] = 1.0;
        }
    }

    // Forward sliding cache: when marker i is focal we need columns i..=hi(i),
    // and nothing before i is ever touched again.
    let mut cache: BTreeMap<usize, PreparedColumn> = BTreeMap::new();
    for i in 0..n {
        if let Some(bar) = progress {
            bar.inc(1);
        }
        if !markers[i].qc_pass {
            continue;
        }
        cache.retain(|&k, _| k >= i);
        for j in i..=band_hi[i] {
            if markers[j].qc_pass && !cache.contains_key(&j) {
                cache.insert(j, prepare_column(partition, MarkerIndex(j as u32))?);
            }
        }

        let focal = &cache[&i];
        for j in (i + 1)..=band_hi[i] {
            if !markers[j].qc_pass {
                continue;
            }
            let mut r = pair_correlation(focal, &cache[&j], config.missing);
            if r.abs() < config.zero_threshold {
                r = 0.0;
            }
            rows[i][j - band_lo[i]] = r;
            rows[j][i - band_lo[j]] = r;
        }
    }

    // Flatten into the block's CSR layout; LD scores fall out of the same pass.
    let mut window_start = Vec::with_capacity(n);
    let mut offsets = Vec::with_capacity(n + 1);
    offsets.push(0usize);
    let mut values = Vec::new();
    let mut ld_scores = Vec::with_capacity(n);
    for i in 0..n {
        window_start.push(band_lo[i] as u32);
        ld_scores.push(rows[i].iter().map(|r| r * r).sum());
        values.extend_from_slice(&rows[i]);
        offsets.push(values.len());
    }

    Ok(SparseLdBlock::new(
        partition.chromosome,
        window_start,
        offsets,
        values,
        ld_scores,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genotypes::tests::write_fileset;
    use approx::assert_abs_diff_eq;
    use tempfile::TempDir;

    fn pearson(a: &[u8], b: &[u8]) -> f64 {
        // Mean-imputed reference implementation: missing values sit at the mean
        // and contribute nothing after centering.
        let observed_mean = |col: &[u8]| {
            let (sum, n) = col
                .iter()
                .filter(|&&d| d != MISSING_DOSAGE)
                .fold((0.0, 0usize), |(s, n), &d| (s + d as f64, n + 1));
            sum / n as f64
        };
        let ma = observed_mean(a);
        let mb = observed_mean(b);
        let centered = |col: &[u8], m: f64| -> Vec<f64> {
            col.iter()
                .map(|&d| if d == MISSING_DOSAGE { 0.0 } else { d as f64 - m })
                .collect()
        };
        let xa = centered(a, ma);
        let xb = centered(b, mb);
        let dot = |x: &[f64], y: &[f64]| x.iter().zip(y).map(|(p, q)| p * q).sum::<f64>();
        dot(&xa, &xb) / (dot(&xa, &xa) * dot(&xb, &xb)).sqrt()
    }

    fn toy_columns() -> Vec<Vec<u8>> {
        vec![
            vec![0, 1, 2, 2, 1, 0, 1, 2],
            vec![0, 1, 2, 1, 1, 0, 1, 2],
            vec![2, 1, 0, 0, 1, 2, 1, 0],
            vec![1, 0, 1, 2, 0, 1, 2, 1],
            vec![0, 3, 2, 1, 1, 0, 1, 2],
        ]
    }

    fn open_store(dir: &TempDir) -> GenotypeStore {
        let ids = ["rs1", "rs2", "rs3", "rs4", "rs5"];
        let prefix = write_fileset(dir.path(), "chr1", 1, &ids, &toy_columns());
        GenotypeStore::open(&[prefix]).unwrap()
    }

    #[test]
    fn correlations_match_direct_computation() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let partition = store.partition(1).unwrap();

        let config = LdBuildConfig {
            window: LdWindow::Markers(4),
            ..LdBuildConfig::default()
        };
        let block = build_chromosome(partition, &config, None).unwrap();
        let columns = toy_columns();

        for i in 0..columns.len() {
            assert_abs_diff_eq!(
                block.r(MarkerIndex(i as u32), MarkerIndex(i as u32)),
                1.0,
                epsilon = 1e-12
            );
            for j in 0..columns.len() {
                let expected = if i == j { 1.0 } else { pearson(&columns[i], &columns[j]) };
                assert_abs_diff_eq!(
                    block.r(MarkerIndex(i as u32), MarkerIndex(j as u32)),
                    expected,
                    epsilon = 1e-10
                );
            }
        }
    }

    #[test]
    fn pairs_outside_window_are_exact_zero() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let partition = store.partition(1).unwrap();

        let config = LdBuildConfig {
            window: LdWindow::Markers(1),
            ..LdBuildConfig::default()
        };
        let block = build_chromosome(partition, &config, None).unwrap();

        assert_eq!(block.r(MarkerIndex(0), MarkerIndex(2)), 0.0);
        assert_eq!(block.r(MarkerIndex(2), MarkerIndex(0)), 0.0);
        assert_eq!(block.r(MarkerIndex(1), MarkerIndex(4)), 0.0);
        // Adjacent pairs are stored.
        assert!(block.r(MarkerIndex(1), MarkerIndex(2)).abs() > 0.0);
        assert_eq!(
            block.r(MarkerIndex(1), MarkerIndex(2)),
            block.r(MarkerIndex(2), MarkerIndex(1))
        );
    }

    #[test]
    fn base_pair_window_bounds_the_band() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let partition = store.partition(1).unwrap();

        // Fixture positions are 1000, 2000, ... so 1500 bp reaches only the
        // immediate neighbors.
        let config = LdBuildConfig {
            window: LdWindow::BasePairs(1500),
            ..LdBuildConfig::default()
        };
        let block = build_chromosome(partition, &config, None).unwrap();
        assert!(block.r(MarkerIndex(0), MarkerIndex(1)).abs() > 0.0);
        assert_eq!(block.r(MarkerIndex(0), MarkerIndex(2)), 0.0);
    }

    #[test]
    fn qc_failures_are_excluded_from_all_bands() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        // Fail rs3 by hand via an aggressive missingness threshold on rs5 and
        // then flip flags directly through the QC entry point: rs5 has one
        // missing genotype (12.5%).
        store.apply_qc(0.0, 0.10);
        let partition = store.partition(1).unwrap();
        assert!(!partition.markers()[4].qc_pass);

        let config = LdBuildConfig {
            window: LdWindow::Markers(4),
            ..LdBuildConfig::default()
        };
        let block = build_chromosome(partition, &config, None).unwrap();

        let (_, band) = block.window(MarkerIndex(4));
        assert!(band.is_empty());
        assert_eq!(block.r(MarkerIndex(4), MarkerIndex(4)), 0.0);
        for i in 0..4u32 {
            assert_eq!(block.r(MarkerIndex(i), MarkerIndex(4)), 0.0);
        }
        assert_eq!(block.ld_scores()[4], 0.0);
    }

    #[test]
    fn ld_scores_sum_squared_band() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let partition = store.partition(1).unwrap();

        let config = LdBuildConfig {
            window: LdWindow::Markers(4),
            ..LdBuildConfig::default()
        };
        let block = build_chromosome(partition, &config, None).unwrap();
        for i in 0..5u32 {
            let (_, band) = block.window(MarkerIndex(i));
            let expected: f64 = band.iter().map(|r| r * r).sum();
            assert_abs_diff_eq!(block.ld_scores()[i as usize], expected, epsilon = 1e-12);
        }
        // Diagonal alone contributes 1.
        assert!(block.ld_scores()[0] >= 1.0);
    }

    #[test]
    fn refuses_to_overwrite_unless_asked() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let out = TempDir::new().unwrap();

        let config = LdBuildConfig {
            window: LdWindow::Markers(2),
            ..LdBuildConfig::default()
        };
        build_all(&store, out.path(), &config).unwrap();
        assert!(matches!(
            build_all(&store, out.path(), &config),
            Err(LdError::AlreadyExists { .. })
        ));

        let overwrite = LdBuildConfig {
            overwrite: true,
            ..config
        };
        build_all(&store, out.path(), &overwrite).unwrap();
    }

    #[test]
    fn zero_threshold_rounds_small_correlations() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let partition = store.partition(1).unwrap();

        let config = LdBuildConfig {
            window: LdWindow::Markers(4),
            zero_threshold: 2.0,
            ..LdBuildConfig::default()
        };
        let block = build_chromosome(partition, &config, None).unwrap();
        // Everything off-diagonal rounds to zero under an absurd threshold;
        // the diagonal is pinned to one.
        for i in 0..5u32 {
            for j in 0..5u32 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_eq!(block.r(MarkerIndex(i), MarkerIndex(j)), expected);
            }
        }
    }

    #[test]
    fn pairwise_complete_ignores_missing_pairs() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let partition = store.partition(1).unwrap();

        let config = LdBuildConfig {
            window: LdWindow::Markers(4),
            missing: MissingPolicy::PairwiseComplete,
            ..LdBuildConfig::default()
        };
        let block = build_chromosome(partition, &config, None).unwrap();

        // rs5 (index 4) has a missing genotype at individual 1; the complete
        // pairs of rs1 x rs5 are identical vectors minus that slot.
        let columns = toy_columns();
        let kept: Vec<usize> = (0..8).filter(|&i| columns[4][i] != MISSING_DOSAGE).collect();
        let a: Vec<u8> = kept.iter().map(|&i| columns[0][i]).collect();
        let b: Vec<u8> = kept.iter().map(|&i| columns[4][i]).collect();
        let expected = pearson(&a, &b);
        assert_abs_diff_eq!(
            block.r(MarkerIndex(0), MarkerIndex(4)),
            expected,
            epsilon = 1e-10
        );
    }
}
