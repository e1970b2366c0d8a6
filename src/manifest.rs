// ========================================================================================
//
//                       THE COHORT MANIFEST
//
// ========================================================================================
//
// The persisted aggregate that ties a cohort together: genotype fileset paths,
// marker metadata with QC annotations, the individual list, and the location
// and parameters of any built LD blocks. It is an explicit, immutable
// configuration object passed by reference to every component; there is no
// ambient global state. Lifecycle: construct from a genotype store, use,
// persist, reload.

use crate::genotypes::{GenotypeError, GenotypeStore};
use crate::ldbuild::LdBuildConfig;
use crate::types::{Individual, Marker};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MANIFEST_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "Manifest {path} has format version {found}, but this build reads version {expected}"
    )]
    Version {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error(transparent)]
    Genotype(#[from] GenotypeError),
}

/// Where one chromosome's data lives and what its markers look like.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChromosomeEntry {
    pub chromosome: u8,
    /// The PLINK fileset prefix (`<prefix>.bed/.bim/.fam`).
    pub fileset_prefix: PathBuf,
    pub markers: Vec<Marker>,
}

/// Parameters of the most recent LD build, recorded so downstream consumers
/// can tell which window and missing-data policy produced the blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdBuildRecord {
    pub dir: PathBuf,
    pub config: LdBuildConfig,
    /// Per-marker LD scores, keyed by chromosome, in marker order.
    pub scores: BTreeMap<u8, Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortManifest {
    format_version: u32,
    pub individuals: Vec<Individual>,
    pub chromosomes: Vec<ChromosomeEntry>,
    pub ld: Option<LdBuildRecord>,
}

impl CohortManifest {
    /// Assembles a manifest from already-built parts. Most callers go through
    /// [`CohortManifest::from_store`] instead.
    pub fn new(individuals: Vec<Individual>, chromosomes: Vec<ChromosomeEntry>) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            individuals,
            chromosomes,
            ld: None,
        }
    }

    /// Captures the state of an opened genotype store, including its scanned
    /// frequencies and QC annotations.
    pub fn from_store(store: &GenotypeStore) -> Result<Self, ManifestError> {
        let mut chromosomes = Vec::new();
        for chromosome in store.chromosomes() {
            let partition = store.partition(chromosome)?;
            chromosomes.push(ChromosomeEntry {
                chromosome,
                fileset_prefix: partition.bed_path.with_extension(""),
                markers: partition.markers().to_vec(),
            });
        }
        Ok(Self {
            format_version: MANIFEST_FORMAT_VERSION,
            individuals: store.individuals().to_vec(),
            chromosomes,
            ld: None,
        })
    }

    /// Reopens the genotype store named by this manifest, restoring the
    /// persisted marker annotations over the fresh frequency scan.
    pub fn open_genotypes(&self) -> Result<GenotypeStore, ManifestError> {
        let prefixes: Vec<PathBuf> = self
            .chromosomes
            .iter()
            .map(|entry| entry.fileset_prefix.clone())
            .collect();
        let mut store = GenotypeStore::open(&prefixes)?;
        for entry in &self.chromosomes {
            store.adopt_marker_annotations(entry.chromosome, &entry.markers)?;
        }
        Ok(store)
    }

    /// Records an LD build so its location, parameters and scores persist with
    /// the cohort.
    pub fn record_ld_build(
        &mut self,
        dir: &Path,
        config: &LdBuildConfig,
        scores: BTreeMap<u8, Vec<f64>>,
    ) {
        self.ld = Some(LdBuildRecord {
            dir: dir.to_path_buf(),
            config: config.clone(),
            scores,
        });
    }

    /// The directory of built LD files, if any build has been recorded.
    pub fn ld_dir(&self) -> Option<&Path> {
        self.ld.as_ref().map(|record| record.dir.as_path())
    }

    pub fn chromosome(&self, chromosome: u8) -> Option<&ChromosomeEntry> {
        self.chromosomes
            .iter()
            .find(|entry| entry.chromosome == chromosome)
    }

    pub fn n_markers(&self) -> usize {
        self.chromosomes.iter().map(|entry| entry.markers.len()).sum()
    }

    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        let io_err = |source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(io_err)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let file = File::open(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = BufReader::new(file);
        let manifest: Self =
            serde_json::from_reader(reader).map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if manifest.format_version != MANIFEST_FORMAT_VERSION {
            return Err(ManifestError::Version {
                path: path.to_path_buf(),
                found: manifest.format_version,
                expected: MANIFEST_FORMAT_VERSION,
            });
        }
        Ok(manifest)
    }
}
