// End-to-end scenarios over a synthetic two-chromosome cohort: prep + QC,
// sparse LD build, clumping/thresholding, the Bayesian sampler and score
// projection, all through the public API and the on-disk artifacts.

use glisten::adjust::{adjust, AdjustConfig};
use glisten::bayes::{run, BayesConfig, PriorModel};
use glisten::genotypes::GenotypeStore;
use glisten::ldbuild::{build_all, LdBuildConfig, LdWindow};
use glisten::ldstore::LdStore;
use glisten::manifest::CohortManifest;
use glisten::score::{project, WeightTable};
use glisten::sumstat::SummaryTable;
use glisten::types::{MarkerIndex, MISSING_DOSAGE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const N_INDIVIDUALS: usize = 500;
const MARKERS_PER_CHROMOSOME: usize = 100;

/// Writes one PLINK fileset holding the given allele-count columns.
fn write_fileset(
    dir: &Path,
    stem: &str,
    chromosome: u8,
    ids: &[String],
    columns: &[Vec<u8>],
) -> PathBuf {
    let n = columns[0].len();
    let prefix = dir.join(stem);

    let mut fam = File::create(prefix.with_extension("fam")).unwrap();
    for i in 0..n {
        writeln!(fam, "F{i} I{i} 0 0 0 -9").unwrap();
    }

    let mut bim = File::create(prefix.with_extension("bim")).unwrap();
    for (j, id) in ids.iter().enumerate() {
        writeln!(bim, "{chromosome} {id} 0.0 {} A C", (j + 1) * 5000).unwrap();
    }

    let mut bed = vec![0x6c, 0x1b, 0x01];
    for column in columns {
        let mut record = vec![0u8; n.div_ceil(4)];
        for (i, &dosage) in column.iter().enumerate() {
            let code = match dosage {
                2 => 0b00,
                1 => 0b10,
                0 => 0b11,
                _ => 0b01,
            };
            record[i / 4] |= code << ((i % 4) * 2);
        }
        bed.extend_from_slice(&record);
    }
    std::fs::write(prefix.with_extension("bed"), bed).unwrap();
    prefix
}

/// Simulates one chromosome of genotypes. A couple of markers are forced
/// nearly monomorphic so the QC filter has something to remove, and adjacent
/// markers are correlated so the LD window holds real structure.
fn simulate_chromosome(rng: &mut StdRng, chromosome: u8) -> (Vec<String>, Vec<Vec<u8>>) {
    let mut ids = Vec::new();
    let mut columns: Vec<Vec<u8>> = Vec::new();
    for j in 0..MARKERS_PER_CHROMOSOME {
        ids.push(format!("chr{chromosome}_rs{j}"));
        let freq: f64 = if j % 37 == 5 {
            0.002
        } else {
            rng.gen_range(0.05..0.5)
        };
        let column: Vec<u8> = (0..N_INDIVIDUALS)
            .map(|i| {
                // Lean on the previous marker to create local LD.
                let base = if j > 0 && rng.gen_bool(0.7) {
                    columns[j - 1][i]
                } else {
                    u8::MAX
                };
                if base != u8::MAX && base != MISSING_DOSAGE {
                    base
                } else {
                    (rng.gen_bool(freq) as u8) + (rng.gen_bool(freq) as u8)
                }
            })
            .collect();
        let mut column = column;
        // A sprinkle of missingness on every fourth marker.
        if j % 4 == 0 {
            for _ in 0..3 {
                let slot = rng.gen_range(0..N_INDIVIDUALS);
                column[slot] = MISSING_DOSAGE;
            }
        }
        columns.push(column);
    }
    (ids, columns)
}

struct Cohort {
    _dir: TempDir,
    manifest: CohortManifest,
    store: GenotypeStore,
    ld: LdStore,
    stats_path: PathBuf,
}

/// Builds the full scenario fixture: two chromosomes, 100 markers each, 500
/// individuals, QC at maf 0.01, sparse LD with a 20-marker window, and a
/// summary-statistic table covering all 200 markers.
fn build_cohort() -> Cohort {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(20260806);

    let mut prefixes = Vec::new();
    let mut all_ids = Vec::new();
    for chromosome in [1u8, 2] {
        let (ids, columns) = simulate_chromosome(&mut rng, chromosome);
        prefixes.push(write_fileset(
            dir.path(),
            &format!("chr{chromosome}"),
            chromosome,
            &ids,
            &columns,
        ));
        all_ids.extend(ids);
    }

    let mut store = GenotypeStore::open(&prefixes).unwrap();
    store.apply_qc(0.01, 0.05);

    let ld_dir = dir.path().join("ld");
    std::fs::create_dir_all(&ld_dir).unwrap();
    let config = LdBuildConfig {
        window: LdWindow::Markers(20),
        overwrite: false,
        ..LdBuildConfig::default()
    };
    let blocks = build_all(&store, &ld_dir, &config).unwrap();

    let mut manifest = CohortManifest::from_store(&store).unwrap();
    let scores = blocks
        .iter()
        .map(|(&c, b)| (c, b.ld_scores().to_vec()))
        .collect();
    manifest.record_ld_build(&ld_dir, &config, scores);

    // Summary statistics for every marker; mostly null effects.
    let stats_path = dir.path().join("stats.tsv");
    let mut f = File::create(&stats_path).unwrap();
    writeln!(f, "marker\teffect\tse\tpvalue\teffect_allele\tfreq").unwrap();
    for id in &all_ids {
        let z: f64 = rng.gen_range(-3.0..3.0);
        let effect = z * 0.02;
        let pvalue: f64 = rng.gen_range(0.0001..1.0);
        writeln!(f, "{id}\t{effect}\t0.02\t{pvalue}\tA\t0.3").unwrap();
    }

    Cohort {
        ld: LdStore::open(&ld_dir),
        _dir: dir,
        manifest,
        store,
        stats_path,
    }
}

/// Mean-imputed Pearson correlation computed straight from decoded columns.
fn direct_correlation(a: &[u8], b: &[u8]) -> f64 {
    let mean = |col: &[u8]| {
        let (sum, n) = col
            .iter()
            .filter(|&&d| d != MISSING_DOSAGE)
            .fold((0.0, 0usize), |(s, n), &d| (s + d as f64, n + 1));
        sum / n as f64
    };
    let center = |col: &[u8], m: f64| -> Vec<f64> {
        col.iter()
            .map(|&d| if d == MISSING_DOSAGE { 0.0 } else { d as f64 - m })
            .collect()
    };
    let xa = center(a, mean(a));
    let xb = center(b, mean(b));
    let dot = |x: &[f64], y: &[f64]| x.iter().zip(y).map(|(p, q)| p * q).sum::<f64>();
    let denom = (dot(&xa, &xa) * dot(&xb, &xb)).sqrt();
    if denom == 0.0 { 0.0 } else { dot(&xa, &xb) / denom }
}

#[test]
fn ld_round_trip_matches_direct_correlations() {
    let cohort = build_cohort();
    let mut rng = StdRng::seed_from_u64(7);

    for chromosome in [1u8, 2] {
        let block = cohort.ld.block(chromosome).unwrap();
        let partition = cohort.store.partition(chromosome).unwrap();
        let markers = partition.markers();

        let mut checked = 0;
        while checked < 25 {
            let i = rng.gen_range(0..markers.len());
            if !markers[i].qc_pass {
                continue;
            }
            let (start, band) = block.window(MarkerIndex(i as u32));
            let j = start + rng.gen_range(0..band.len());
            if !markers[j].qc_pass {
                continue;
            }

            let mut a = Vec::new();
            let mut b = Vec::new();
            partition.decode_column(MarkerIndex(i as u32), &mut a).unwrap();
            partition.decode_column(MarkerIndex(j as u32), &mut b).unwrap();
            let expected = if i == j { 1.0 } else { direct_correlation(&a, &b) };
            let stored = block.r(MarkerIndex(i as u32), MarkerIndex(j as u32));
            assert!(
                (stored - expected).abs() < 1e-10,
                "chr{chromosome} pair ({i},{j}): stored {stored} vs direct {expected}"
            );
            checked += 1;
        }
    }
}

#[test]
fn ld_blocks_are_symmetric_with_unit_diagonal() {
    let cohort = build_cohort();
    for chromosome in [1u8, 2] {
        let block = cohort.ld.block(chromosome).unwrap();
        let markers = cohort.store.partition(chromosome).unwrap().markers();
        for i in 0..block.n_markers() {
            if !markers[i].qc_pass {
                continue;
            }
            let a = MarkerIndex(i as u32);
            assert_eq!(block.r(a, a), 1.0);
            let (start, band) = block.window(a);
            for offset in 0..band.len() {
                let b = MarkerIndex((start + offset) as u32);
                assert_eq!(block.r(a, b), block.r(b, a), "asymmetry at ({i},{})", start + offset);
            }
        }
    }
}

#[test]
fn correlations_vanish_outside_the_window() {
    let cohort = build_cohort();
    let block = cohort.ld.block(1).unwrap();
    let markers = cohort.store.partition(1).unwrap().markers();

    // Count QC ranks; any pair more than 20 passing markers apart is outside
    // the configured window.
    let ranks: Vec<Option<usize>> = {
        let mut rank = 0usize;
        markers
            .iter()
            .map(|m| {
                if m.qc_pass {
                    rank += 1;
                    Some(rank - 1)
                } else {
                    None
                }
            })
            .collect()
    };
    for i in 0..markers.len() {
        for j in 0..markers.len() {
            if let (Some(ri), Some(rj)) = (ranks[i], ranks[j]) {
                if ri.abs_diff(rj) > 20 {
                    assert_eq!(
                        block.r(MarkerIndex(i as u32), MarkerIndex(j as u32)),
                        0.0,
                        "pair ({i},{j}) is outside the window but stored non-zero"
                    );
                }
            }
        }
    }
}

#[test]
fn refusing_overwrite_protects_existing_blocks() {
    let cohort = build_cohort();
    let config = LdBuildConfig {
        window: LdWindow::Markers(20),
        overwrite: false,
        ..LdBuildConfig::default()
    };
    let ld_dir = cohort.manifest.ld_dir().unwrap();
    assert!(build_all(&cohort.store, ld_dir, &config).is_err());
}

#[test]
fn clumping_scenario_yields_the_full_table() {
    let cohort = build_cohort();
    let table = SummaryTable::read(&cohort.stats_path).unwrap();
    let config = AdjustConfig {
        r2_threshold: 0.9,
        p_thresholds: vec![0.01, 0.05],
    };
    let result = adjust(&cohort.manifest, &cohort.ld, &table, &config).unwrap();

    // Exactly one row per input marker, one effect column per threshold, and
    // no missing values anywhere.
    assert_eq!(result.marker_ids.len(), 2 * MARKERS_PER_CHROMOSOME);
    assert_eq!(result.columns.len(), 2);
    for column in &result.columns {
        assert_eq!(column.len(), 2 * MARKERS_PER_CHROMOSOME);
        assert!(column.iter().all(|b| b.is_finite()));
    }

    // The written table carries the b_<threshold> header.
    let out = cohort._dir.path().join("adjusted.tsv");
    result.write(&out).unwrap();
    let text = std::fs::read_to_string(&out).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next().unwrap(), "marker\tb_0.01\tb_0.05");
    assert_eq!(lines.count(), 2 * MARKERS_PER_CHROMOSOME);
}

#[test]
fn clumping_is_idempotent_and_monotone() {
    let cohort = build_cohort();
    let table = SummaryTable::read(&cohort.stats_path).unwrap();
    let config = AdjustConfig {
        r2_threshold: 0.9,
        p_thresholds: vec![0.01, 0.05, 0.5],
    };
    let first = adjust(&cohort.manifest, &cohort.ld, &table, &config).unwrap();
    let second = adjust(&cohort.manifest, &cohort.ld, &table, &config).unwrap();
    assert_eq!(first, second);

    for t in 1..first.thresholds.len() {
        let stricter = first.retained(t - 1);
        let looser = first.retained(t);
        for row in &stricter {
            assert!(looser.contains(row), "retained sets shrank at threshold {t}");
        }
    }
}

#[test]
fn bayes_c_scenario_bounds_pips_and_trace() {
    let cohort = build_cohort();
    let table = SummaryTable::read(&cohort.stats_path).unwrap();
    let config = BayesConfig {
        model: PriorModel::BayesC,
        n_gwas: N_INDIVIDUALS,
        nit: 100,
        burn_in: 0,
        pi: 0.01,
        ..BayesConfig::default()
    };
    let fit = run(&cohort.manifest, &cohort.ld, &table, &config).unwrap();

    assert_eq!(fit.trace.len(), 100);
    assert!(!fit.posteriors.is_empty());
    for p in &fit.posteriors {
        assert!((0.0..=1.0).contains(&p.pip), "pip {} out of range", p.pip);
        assert!(p.mean_effect.is_finite());
    }
}

#[test]
fn manifest_round_trip_reopens_the_cohort() {
    let cohort = build_cohort();
    let path = cohort._dir.path().join("cohort.json");
    cohort.manifest.save(&path).unwrap();

    let loaded = CohortManifest::load(&path).unwrap();
    assert_eq!(loaded.n_markers(), cohort.manifest.n_markers());
    assert_eq!(loaded.individuals.len(), N_INDIVIDUALS);
    assert_eq!(loaded.ld_dir(), cohort.manifest.ld_dir());

    let reopened = loaded.open_genotypes().unwrap();
    for chromosome in [1u8, 2] {
        let original = cohort.store.partition(chromosome).unwrap().markers();
        let restored = reopened.partition(chromosome).unwrap().markers();
        assert_eq!(original.len(), restored.len());
        for (a, b) in original.iter().zip(restored) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.qc_pass, b.qc_pass);
            assert_eq!(a.frequency, b.frequency);
        }
    }
}

#[test]
fn posterior_weights_project_to_finite_scores() {
    let cohort = build_cohort();
    let table = SummaryTable::read(&cohort.stats_path).unwrap();
    let config = BayesConfig {
        model: PriorModel::BayesC,
        n_gwas: N_INDIVIDUALS,
        nit: 200,
        burn_in: 50,
        pi: 0.05,
        ..BayesConfig::default()
    };
    let fit = run(&cohort.manifest, &cohort.ld, &table, &config).unwrap();

    let weights = WeightTable::from_column(
        "bayesC",
        fit.posteriors
            .iter()
            .map(|p| (p.id.clone(), p.allelic_effect())),
    );
    let scores = project(&cohort.store, &weights).unwrap();

    assert_eq!(scores.individuals.len(), N_INDIVIDUALS);
    assert_eq!(scores.column_names, vec!["bayesC"]);
    for i in 0..N_INDIVIDUALS {
        assert!(scores.score(i, 0).is_finite());
    }
    // At least some individuals differ, otherwise nothing was projected.
    let first = scores.score(0, 0);
    assert!((0..N_INDIVIDUALS).any(|i| scores.score(i, 0) != first));
}
