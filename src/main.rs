// ========================================================================================
//
//                               The strategic orchestrator: Glisten
//
// ========================================================================================
//
// This binary is the conductor of the engine. Its sole responsibility is to
// parse arguments, open the cohort resources, and dispatch into the library's
// pipeline stages: prep, ld, adjust, bayes, score. It owns no scientific
// logic of its own.

#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, Parser, Subcommand, ValueEnum};
use glisten::adjust::{adjust, AdjustConfig};
use glisten::bayes::{BayesConfig, MarkerOrder, PriorModel};
use glisten::bayes_mt::{run_multi, MultiTraitConfig};
use glisten::genotypes::GenotypeStore;
use glisten::ldbuild::{build_all, LdBuildConfig, LdWindow, MissingPolicy};
use glisten::ldstore::LdStore;
use glisten::manifest::CohortManifest;
use glisten::score::{project, WeightTable};
use glisten::sumstat::SummaryTable;
use std::collections::BTreeMap;
use std::error::Error;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[clap(
    name = "glisten",
    version,
    about = "An out-of-core genotype/LD engine and Bayesian marker-effect sampler."
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan per-chromosome PLINK filesets, run QC, and write a cohort manifest.
    Prep(PrepArgs),
    /// Build sparse LD blocks and LD scores for a prepared cohort.
    Ld(LdArgs),
    /// LD-clump and threshold a summary-statistic table.
    Adjust(AdjustArgs),
    /// Run the Bayesian marker-effect sampler on summary statistics.
    Bayes(BayesArgs),
    /// Project marker weights onto genotypes to produce individual scores.
    Score(ScoreArgs),
}

#[derive(Args)]
struct PrepArgs {
    /// PLINK fileset prefixes, one per chromosome (for `<p>.bed/.bim/.fam`).
    #[arg(required = true)]
    prefixes: Vec<PathBuf>,

    /// Where to write the cohort manifest.
    #[arg(long, default_value = "cohort.json")]
    out: PathBuf,

    /// Minimum minor-allele frequency a marker must reach to pass QC.
    #[arg(long, default_value = "0.01")]
    min_maf: f64,

    /// Maximum genotype missingness a marker may carry and still pass QC.
    #[arg(long, default_value = "0.05")]
    max_missingness: f64,
}

#[derive(Args)]
struct LdArgs {
    /// Path to the cohort manifest produced by `prep`.
    manifest: PathBuf,

    /// Directory that receives one LD file per chromosome.
    #[arg(long, default_value = "ld")]
    out_dir: PathBuf,

    /// Window size in markers on each side of the focal marker.
    #[arg(long, conflicts_with_all = ["window_bp", "window_cm"])]
    window_markers: Option<usize>,

    /// Window size as a base-pair distance.
    #[arg(long, conflicts_with = "window_cm")]
    window_bp: Option<u32>,

    /// Window size as a genetic distance in centimorgans.
    #[arg(long)]
    window_cm: Option<f64>,

    /// How missing genotypes enter the correlations.
    #[arg(long, value_enum, default_value = "mean-impute")]
    missing: MissingCli,

    /// Correlations below this magnitude are stored as exact zeros.
    #[arg(long, default_value = "0.0")]
    zero_threshold: f64,

    /// Replace existing LD files instead of refusing to run.
    #[arg(long)]
    overwrite: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum MissingCli {
    MeanImpute,
    PairwiseComplete,
}

#[derive(Args)]
struct AdjustArgs {
    /// Path to the cohort manifest produced by `prep`.
    manifest: PathBuf,

    /// Tab-separated summary statistics with columns
    /// marker/effect/se/pvalue/effect_allele/freq.
    stats: PathBuf,

    /// Markers in LD above this r-squared with a retained marker are zeroed.
    #[arg(long, default_value = "0.9")]
    r2: f64,

    /// P-value thresholds, one output column each.
    #[arg(long, value_delimiter = ',', default_value = "0.001,0.05,1.0")]
    thresholds: Vec<f64>,

    /// Where to write the adjusted effect table.
    #[arg(long, default_value = "adjusted.tsv")]
    out: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelCli {
    BayesN,
    BayesA,
    BayesC,
    BayesR,
}

#[derive(Args)]
struct BayesArgs {
    /// Path to the cohort manifest produced by `prep`.
    manifest: PathBuf,

    /// Summary-statistic tables; one runs the single-trait sampler, several
    /// run the joint multi-trait sampler.
    #[arg(required = true)]
    stats: Vec<PathBuf>,

    /// Marker-effect prior family (single-trait runs only).
    #[arg(long, value_enum, default_value = "bayes-c")]
    model: ModelCli,

    /// GWAS sample sizes, one per summary table.
    #[arg(long, value_delimiter = ',', required = true)]
    n: Vec<usize>,

    /// Gibbs iterations.
    #[arg(long, default_value = "1000")]
    nit: usize,

    /// Iterations discarded from posterior summaries.
    #[arg(long, default_value = "100")]
    burn_in: usize,

    /// Keep every nth iteration in the trace.
    #[arg(long, default_value = "1")]
    thin: usize,

    /// Prior probability that a marker effect is causal.
    #[arg(long, default_value = "0.01")]
    pi: f64,

    /// Heritability guess used to seed the variance components.
    #[arg(long, default_value = "0.5")]
    h2: f64,

    /// Visit markers in a fresh seeded shuffle each iteration instead of
    /// genomic order.
    #[arg(long)]
    shuffle: bool,

    /// Random seed for the sampler.
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Freeze the mixing probabilities at their initial values.
    #[arg(long)]
    fix_pi: bool,

    /// Freeze the residual variance at its initial value.
    #[arg(long)]
    fix_sigma_e: bool,

    /// Freeze all marker effects at zero (diagnostic runs).
    #[arg(long)]
    fix_effects: bool,

    /// Where to write the posterior weight table.
    #[arg(long, default_value = "posterior.tsv")]
    out: PathBuf,
}

#[derive(Args)]
struct ScoreArgs {
    /// Path to the cohort manifest produced by `prep`.
    manifest: PathBuf,

    /// Tab-separated weight table: a `marker` column plus numeric columns.
    weights: PathBuf,

    /// Restrict scoring to these weight columns (default: all).
    #[arg(long, value_delimiter = ',')]
    columns: Option<Vec<String>>,

    /// Where to write the per-individual score table.
    #[arg(long, default_value = "scores.tsv")]
    out: PathBuf,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Prep(args) => run_prep(args),
        Command::Ld(args) => run_ld(args),
        Command::Adjust(args) => run_adjust(args),
        Command::Bayes(args) => run_bayes(args),
        Command::Score(args) => run_score(args),
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        let mut source = e.source();
        while let Some(inner) = source {
            eprintln!("  caused by: {inner}");
            source = inner.source();
        }
        process::exit(1);
    }
}

fn run_prep(args: PrepArgs) -> Result<(), Box<dyn Error>> {
    let mut prefixes = args.prefixes;
    // Natural ordering so chr2 sorts before chr10 regardless of shell glob
    // order.
    prefixes.sort_by(|a, b| natord::compare(&a.to_string_lossy(), &b.to_string_lossy()));

    let mut store = GenotypeStore::open(&prefixes)?;
    let failed = store.apply_qc(args.min_maf, args.max_missingness);
    log::info!(
        "QC: {} of {} markers failed (maf < {} or missingness > {})",
        failed,
        store
            .chromosomes()
            .map(|c| store.partition(c).map(|p| p.n_markers()).unwrap_or(0))
            .sum::<usize>(),
        args.min_maf,
        args.max_missingness
    );

    let manifest = CohortManifest::from_store(&store)?;
    manifest.save(&args.out)?;
    log::info!("cohort manifest written to {}", args.out.display());
    Ok(())
}

fn run_ld(args: LdArgs) -> Result<(), Box<dyn Error>> {
    let window = match (args.window_markers, args.window_bp, args.window_cm) {
        (Some(w), _, _) => LdWindow::Markers(w),
        (None, Some(bp), _) => LdWindow::BasePairs(bp),
        (None, None, Some(cm)) => LdWindow::CentiMorgans(cm),
        (None, None, None) => LdWindow::Markers(1000),
    };
    let config = LdBuildConfig {
        window,
        missing: match args.missing {
            MissingCli::MeanImpute => MissingPolicy::MeanImpute,
            MissingCli::PairwiseComplete => MissingPolicy::PairwiseComplete,
        },
        zero_threshold: args.zero_threshold,
        overwrite: args.overwrite,
    };

    let mut manifest = CohortManifest::load(&args.manifest)?;
    let store = manifest.open_genotypes()?;
    std::fs::create_dir_all(&args.out_dir)?;

    let blocks = build_all(&store, &args.out_dir, &config)?;
    let scores: BTreeMap<u8, Vec<f64>> = blocks
        .iter()
        .map(|(&chromosome, block)| (chromosome, block.ld_scores().to_vec()))
        .collect();
    manifest.record_ld_build(&args.out_dir, &config, scores);
    manifest.save(&args.manifest)?;
    log::info!(
        "sparse LD built for {} chromosome(s) into {}",
        blocks.len(),
        args.out_dir.display()
    );
    Ok(())
}

fn open_ld(manifest: &CohortManifest) -> Result<LdStore, Box<dyn Error>> {
    let dir = manifest
        .ld_dir()
        .ok_or("the manifest records no LD build; run `glisten ld` first")?;
    Ok(LdStore::open(dir))
}

fn run_adjust(args: AdjustArgs) -> Result<(), Box<dyn Error>> {
    let manifest = CohortManifest::load(&args.manifest)?;
    let ld = open_ld(&manifest)?;
    let table = SummaryTable::read(&args.stats)?;
    let config = AdjustConfig {
        r2_threshold: args.r2,
        p_thresholds: args.thresholds,
    };
    let result = adjust(&manifest, &ld, &table, &config)?;
    result.write(&args.out)?;
    log::info!(
        "adjusted effects for {} markers at {} threshold(s) written to {}",
        result.marker_ids.len(),
        result.thresholds.len(),
        args.out.display()
    );
    Ok(())
}

fn run_bayes(args: BayesArgs) -> Result<(), Box<dyn Error>> {
    let manifest = CohortManifest::load(&args.manifest)?;
    let ld = open_ld(&manifest)?;
    let order = if args.shuffle {
        MarkerOrder::Shuffled
    } else {
        MarkerOrder::Genomic
    };

    if args.stats.len() > 1 {
        let tables: Result<Vec<SummaryTable>, _> =
            args.stats.iter().map(|p| SummaryTable::read(p)).collect();
        let config = MultiTraitConfig {
            n_gwas: args.n,
            nit: args.nit,
            burn_in: args.burn_in,
            thin: args.thin,
            pi: args.pi,
            h2: args.h2,
            order,
            seed: args.seed,
            ..MultiTraitConfig::default()
        };
        let fit = run_multi(&manifest, &ld, &tables?, &config)?;
        let json = serde_json::to_string_pretty(&fit.posteriors)?;
        std::fs::write(&args.out, json)?;
        log::info!(
            "multi-trait posteriors for {} markers written to {}",
            fit.posteriors.len(),
            args.out.display()
        );
        return Ok(());
    }

    if args.n.len() != 1 {
        return Err("a single-trait run takes exactly one --n value".into());
    }
    let table = SummaryTable::read(&args.stats[0])?;
    let config = BayesConfig {
        model: match args.model {
            ModelCli::BayesN => PriorModel::BayesN,
            ModelCli::BayesA => PriorModel::BayesA,
            ModelCli::BayesC => PriorModel::BayesC,
            ModelCli::BayesR => PriorModel::BayesR,
        },
        n_gwas: args.n[0],
        nit: args.nit,
        burn_in: args.burn_in,
        thin: args.thin,
        pi: args.pi,
        h2: args.h2,
        order,
        seed: args.seed,
        fix_pi: args.fix_pi,
        fix_sigma_e: args.fix_sigma_e,
        fix_effects: args.fix_effects,
        ..BayesConfig::default()
    };
    let fit = glisten::bayes::run(&manifest, &ld, &table, &config)?;
    fit.write(&args.out)?;
    log::info!(
        "{}: posteriors for {} markers written to {}",
        config.model.label(),
        fit.posteriors.len(),
        args.out.display()
    );
    Ok(())
}

fn run_score(args: ScoreArgs) -> Result<(), Box<dyn Error>> {
    let manifest = CohortManifest::load(&args.manifest)?;
    let store = manifest.open_genotypes()?;
    let weights = WeightTable::read(&args.weights, args.columns.as_deref())?;
    let result = project(&store, &weights)?;
    result.write(&args.out)?;
    log::info!(
        "scores for {} individuals over {} column(s) written to {}",
        result.individuals.len(),
        result.column_names.len(),
        args.out.display()
    );
    Ok(())
}
