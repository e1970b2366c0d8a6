// ========================================================================================
//
//                       THE MULTI-TRAIT MARKER-EFFECT SAMPLER
//
// ========================================================================================
//
// Matrix-variate generalization of the single-trait sampler: each marker
// carries a vector of effects across traits drawn from N(0, B) with a t x t
// marker-effect covariance matrix B, updated from an inverse-Wishart
// conditional via Bartlett draws. Inclusion is a single indicator shared
// across traits (a marker is causal for all traits or none), which is what
// makes the mixture tractable at genome scale. Residuals are treated as
// uncorrelated across traits; per-trait residual variances are drawn exactly
// as in the single-trait sampler.
//
// The per-marker linear algebra is dense but tiny (t x t), so it runs on
// nalgebra factorizations rather than anything blocked.

use crate::bayes::{MarkerOrder, SamplerError};
use crate::ldstore::LdStore;
use crate::manifest::CohortManifest;
use crate::sumstat::{AlignedSummary, SummaryTable};
use crate::types::MarkerIndex;
use nalgebra::{Cholesky, DMatrix, DVector};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Beta as BetaDist, Distribution, Gamma, StandardNormal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiTraitConfig {
    /// GWAS sample size per trait, in trait order.
    pub n_gwas: Vec<usize>,
    pub nit: usize,
    pub burn_in: usize,
    pub thin: usize,
    /// Prior probability that a marker is causal (for all traits jointly).
    pub pi: f64,
    /// Heritability guess per trait for seeding the covariance diagonal.
    pub h2: f64,
    /// Inverse-Wishart prior degrees of freedom for the effect covariance.
    pub nu_b: f64,
    /// Residual-variance prior degrees of freedom.
    pub nu_e: f64,
    /// Spike-and-slab selection on (bayesC-style); false gives the bayesN
    /// analogue where every marker is causal.
    pub selection: bool,
    pub order: MarkerOrder,
    pub seed: u64,
}

impl Default for MultiTraitConfig {
    fn default() -> Self {
        Self {
            n_gwas: Vec::new(),
            nit: 1000,
            burn_in: 100,
            thin: 1,
            pi: 0.01,
            h2: 0.5,
            nu_b: 6.0,
            nu_e: 4.0,
            selection: true,
            order: MarkerOrder::Genomic,
            seed: 42,
        }
    }
}

impl MultiTraitConfig {
    pub fn validate(&self, n_traits: usize) -> Result<(), SamplerError> {
        let fail = |msg: String| Err(SamplerError::InvalidConfig(msg));
        if n_traits < 2 {
            return fail("a multi-trait run needs at least two traits".to_string());
        }
        if self.n_gwas.len() != n_traits {
            return fail(format!(
                "{} GWAS sample sizes were given for {} traits",
                self.n_gwas.len(),
                n_traits
            ));
        }
        if self.n_gwas.iter().any(|&n| n < 2) {
            return fail("every GWAS sample size must be at least 2".to_string());
        }
        if self.nit == 0 || self.thin == 0 {
            return fail("iteration count and thinning interval must be at least 1".to_string());
        }
        if self.burn_in >= self.nit {
            return fail(format!(
                "burn-in {} must be smaller than the iteration count {}",
                self.burn_in, self.nit
            ));
        }
        if !(0.0..=1.0).contains(&self.pi) {
            return fail(format!("pi {} is outside [0, 1]", self.pi));
        }
        if !(self.h2 > 0.0 && self.h2 < 1.0) {
            return fail(format!("heritability guess {} is outside (0, 1)", self.h2));
        }
        if self.nu_b <= (n_traits + 1) as f64 {
            return fail(format!(
                "the covariance prior needs more than {} degrees of freedom for {} traits",
                n_traits + 1,
                n_traits
            ));
        }
        Ok(())
    }
}

/// Posterior summary for one marker across all traits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiTraitPosterior {
    pub id: String,
    pub chromosome: u8,
    pub index: MarkerIndex,
    /// Posterior mean effect per trait, standardized scale.
    pub mean_effects: Vec<f64>,
    /// Shared posterior inclusion probability.
    pub pip: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiTraitSnapshot {
    pub iteration: usize,
    pub sigma_e2: Vec<f64>,
    /// The t x t marker-effect covariance, flattened column-major (it is
    /// symmetric, so the orientation is cosmetic).
    pub effect_covariance: Vec<f64>,
    pub pi: f64,
}

#[derive(Debug, Clone)]
pub struct MultiTraitFit {
    pub posteriors: Vec<MultiTraitPosterior>,
    pub trace: Vec<MultiTraitSnapshot>,
    /// Posterior mean of the t x t marker-effect correlation matrix.
    pub effect_correlation: DMatrix<f64>,
}

struct ModelMarker {
    id: String,
    chromosome: u8,
    index: MarkerIndex,
    chrom_slot: usize,
    /// Standardized marginal effect per trait.
    b_marginal: Vec<f64>,
}

struct ChromState {
    block: Arc<crate::ldfile::SparseLdBlock>,
    slots: Vec<Option<usize>>,
}

/// Runs the joint sampler over one summary table per trait. Only markers
/// usable in every trait enter the model.
pub fn run_multi(
    manifest: &CohortManifest,
    ld: &LdStore,
    tables: &[SummaryTable],
    config: &MultiTraitConfig,
) -> Result<MultiTraitFit, SamplerError> {
    let t = tables.len();
    config.validate(t)?;

    let mut markers: Vec<ModelMarker> = Vec::new();
    let mut chrom_states: Vec<ChromState> = Vec::new();
    for entry in &manifest.chromosomes {
        let block = ld.block(entry.chromosome)?;
        let aligned: Vec<AlignedSummary> = tables
            .iter()
            .map(|table| AlignedSummary::align(table, entry))
            .collect();
        let mut slots = vec![None; entry.markers.len()];
        'marker: for idx in 0..entry.markers.len() {
            let mut b = Vec::with_capacity(t);
            for (tau, summary) in aligned.iter().enumerate() {
                match &summary.per_marker[idx] {
                    Some(record) if record.se > 0.0 && record.effect.is_finite() => {
                        let z = record.effect / record.se;
                        b.push(z / (config.n_gwas[tau] as f64).sqrt());
                    }
                    _ => continue 'marker,
                }
            }
            slots[idx] = Some(markers.len());
            markers.push(ModelMarker {
                id: entry.markers[idx].id.clone(),
                chromosome: entry.chromosome,
                index: MarkerIndex(idx as u32),
                chrom_slot: chrom_states.len(),
                b_marginal: b,
            });
        }
        chrom_states.push(ChromState { block, slots });
    }
    if markers.is_empty() {
        return Err(SamplerError::NoUsableMarkers);
    }
    log::info!(
        "multi-trait: sampling {} markers across {} traits for {} iterations",
        markers.len(),
        t,
        config.nit
    );

    sample(&markers, &chrom_states, t, config)
}

fn chi2(rng: &mut StdRng, df: f64) -> f64 {
    Gamma::new(df / 2.0, 2.0)
        .expect("chi-square degrees of freedom are validated positive")
        .sample(rng)
}

/// Bartlett draw from Wishart(df, scale), where `scale_chol` is the lower
/// Cholesky factor of the scale matrix.
fn wishart(rng: &mut StdRng, df: f64, scale_chol: &DMatrix<f64>) -> DMatrix<f64> {
    let t = scale_chol.nrows();
    let mut a = DMatrix::zeros(t, t);
    for i in 0..t {
        a[(i, i)] = chi2(rng, df - i as f64).sqrt();
        for j in 0..i {
            a[(i, j)] = StandardNormal.sample(rng);
        }
    }
    let la = scale_chol * a;
    &la * la.transpose()
}

/// Inverse-Wishart draw with scale `psi` and the given degrees of freedom.
fn inverse_wishart(
    rng: &mut StdRng,
    df: f64,
    psi: &DMatrix<f64>,
    iteration: usize,
) -> Result<DMatrix<f64>, SamplerError> {
    let unstable = |detail: String| SamplerError::NumericInstability {
        iteration,
        detail,
        sigma_e2: f64::NAN,
        sigma_b2: f64::NAN,
    };
    let psi_inv = Cholesky::new(psi.clone())
        .ok_or_else(|| unstable("effect-covariance scale is not positive definite".to_string()))?
        .inverse();
    let chol = Cholesky::new(psi_inv)
        .ok_or_else(|| unstable("inverted covariance scale is not positive definite".to_string()))?;
    let w = wishart(rng, df, &chol.l());
    let b = Cholesky::new(w)
        .ok_or_else(|| unstable("wishart draw is not positive definite".to_string()))?
        .inverse();
    Ok(b)
}

fn sample(
    markers: &[ModelMarker],
    chrom_states: &[ChromState],
    t: usize,
    config: &MultiTraitConfig,
) -> Result<MultiTraitFit, SamplerError> {
    let m = markers.len();
    let mut rng = StdRng::seed_from_u64(config.seed);

    let causal_guess = if config.selection {
        (m as f64 * config.pi).max(1.0)
    } else {
        m as f64
    };
    // Effect covariance seeded diagonal; residuals per trait at 1 - h2.
    let sigma_b2_init = config.h2 / causal_guess;
    let mut b_cov = DMatrix::from_diagonal(&DVector::from_element(t, sigma_b2_init));
    let prior_scale = b_cov.clone() * config.nu_b;
    let mut sigma_e2 = vec![1.0 - config.h2; t];
    let s_e = 1.0 - config.h2;
    let mut pi = config.pi;

    let mut beta = vec![DVector::<f64>::zeros(t); m];
    let mut r_adj: Vec<DVector<f64>> = markers
        .iter()
        .map(|mk| DVector::from_vec(mk.b_marginal.clone()))
        .collect();
    let mut causal = vec![false; m];

    let mut sum_beta = vec![DVector::<f64>::zeros(t); m];
    let mut causal_draws = vec![0u64; m];
    let mut sum_b_corr = DMatrix::<f64>::zeros(t, t);
    let mut kept = 0u64;

    let mut order: Vec<usize> = (0..m).collect();
    let mut trace = Vec::with_capacity(config.nit / config.thin + 1);
    let n: Vec<f64> = config.n_gwas.iter().map(|&v| v as f64).collect();

    for iteration in 0..config.nit {
        if config.order == MarkerOrder::Shuffled {
            order.shuffle(&mut rng);
        }

        let b_chol = Cholesky::new(b_cov.clone()).ok_or_else(|| {
            SamplerError::NumericInstability {
                iteration,
                detail: "marker-effect covariance left the positive definite cone".to_string(),
                sigma_e2: sigma_e2[0],
                sigma_b2: b_cov[(0, 0)],
            }
        })?;
        let b_inv = b_chol.inverse();
        let log_det_b = 2.0 * (0..t).map(|i| b_chol.l()[(i, i)].ln()).sum::<f64>();

        for &s in &order {
            let marker = &markers[s];
            let state = &chrom_states[marker.chrom_slot];

            // Precision of the slab conditional: Q = n * Se^{-1} + B^{-1}.
            let mut q = b_inv.clone();
            let mut b_vec = DVector::zeros(t);
            for tau in 0..t {
                q[(tau, tau)] += n[tau] / sigma_e2[tau];
                let r_tilde = r_adj[s][tau] + beta[s][tau];
                b_vec[tau] = n[tau] * r_tilde / sigma_e2[tau];
            }
            let q_chol = Cholesky::new(q).ok_or_else(|| SamplerError::NumericInstability {
                iteration,
                detail: "per-marker conditional precision is not positive definite".to_string(),
                sigma_e2: sigma_e2[0],
                sigma_b2: b_cov[(0, 0)],
            })?;
            let mean = q_chol.solve(&b_vec);

            let draw_causal = if !config.selection {
                true
            } else if pi <= 0.0 {
                false
            } else if pi >= 1.0 {
                true
            } else {
                // log BF of slab vs spike; Q's log-determinant comes from its
                // Cholesky diagonal.
                let log_det_q = 2.0 * (0..t).map(|i| q_chol.l()[(i, i)].ln()).sum::<f64>();
                let log_bf = -0.5 * log_det_b - 0.5 * log_det_q + 0.5 * b_vec.dot(&mean);
                let log_odds = (pi / (1.0 - pi)).ln() + log_bf;
                let p_causal = 1.0 / (1.0 + (-log_odds).exp());
                rng.gen::<f64>() < p_causal
            };

            let new_beta = if draw_causal {
                // beta = mean + L^{-T} z for Q = L L^T.
                let z = DVector::from_fn(t, |_, _| StandardNormal.sample(&mut rng));
                let noise = q_chol.l().transpose().solve_upper_triangular(&z).ok_or_else(
                    || SamplerError::NumericInstability {
                        iteration,
                        detail: "triangular solve failed in the effect draw".to_string(),
                        sigma_e2: sigma_e2[0],
                        sigma_b2: b_cov[(0, 0)],
                    },
                )?;
                &mean + noise
            } else {
                DVector::zeros(t)
            };
            causal[s] = draw_causal;

            let diff = &new_beta - &beta[s];
            if diff.amax() > 0.0 {
                let (start, band) = state.block.window(marker.index);
                for (offset, &r) in band.iter().enumerate() {
                    if r != 0.0 {
                        if let Some(other) = state.slots[start + offset] {
                            for tau in 0..t {
                                r_adj[other][tau] -= r * diff[tau];
                            }
                        }
                    }
                }
                beta[s] = new_beta;
            }
        }

        // --- Effect covariance, mixing probability, residual variances ---
        let mut m_causal = 0u64;
        let mut scatter = DMatrix::<f64>::zeros(t, t);
        for s in 0..m {
            if causal[s] {
                m_causal += 1;
                scatter += &beta[s] * beta[s].transpose();
            }
        }
        let psi = &prior_scale + scatter;
        b_cov = inverse_wishart(&mut rng, config.nu_b + m_causal as f64, &psi, iteration)?;

        if config.selection {
            let dist = BetaDist::new(1.0 + m_causal as f64, 1.0 + (m as u64 - m_causal) as f64)
                .expect("beta parameters are positive");
            pi = dist.sample(&mut rng);
        }

        for tau in 0..t {
            let fitted: f64 = (0..m)
                .map(|s| beta[s][tau] * (markers[s].b_marginal[tau] + r_adj[s][tau]))
                .sum();
            let sse = n[tau] * (1.0 - fitted);
            if !sse.is_finite() || sse <= 0.0 {
                return Err(SamplerError::NumericInstability {
                    iteration,
                    detail: format!(
                        "trait {tau}: residual sum of squares {sse:.6e} is not positive finite"
                    ),
                    sigma_e2: sigma_e2[tau],
                    sigma_b2: b_cov[(0, 0)],
                });
            }
            sigma_e2[tau] = (config.nu_e * s_e + sse)
                / chi2(&mut rng, config.nu_e + n[tau]).max(f64::MIN_POSITIVE);
        }

        if (iteration + 1) % config.thin == 0 {
            trace.push(MultiTraitSnapshot {
                iteration,
                sigma_e2: sigma_e2.clone(),
                effect_covariance: b_cov.iter().cloned().collect(),
                pi,
            });
            if iteration >= config.burn_in {
                kept += 1;
                for s in 0..m {
                    sum_beta[s] += &beta[s];
                    if causal[s] {
                        causal_draws[s] += 1;
                    }
                }
                // Accumulate the correlation form of the drawn covariance.
                let mut corr = b_cov.clone();
                for i in 0..t {
                    for j in 0..t {
                        let denom = (b_cov[(i, i)] * b_cov[(j, j)]).sqrt();
                        corr[(i, j)] = if denom > 0.0 { b_cov[(i, j)] / denom } else { 0.0 };
                    }
                }
                sum_b_corr += corr;
            }
        }
    }

    let kept = kept.max(1) as f64;
    let posteriors = markers
        .iter()
        .enumerate()
        .map(|(s, marker)| MultiTraitPosterior {
            id: marker.id.clone(),
            chromosome: marker.chromosome,
            index: marker.index,
            mean_effects: (&sum_beta[s] / kept).iter().cloned().collect(),
            pip: causal_draws[s] as f64 / kept,
        })
        .collect();

    Ok(MultiTraitFit {
        posteriors,
        trace,
        effect_correlation: sum_b_corr / kept,
    })
}
