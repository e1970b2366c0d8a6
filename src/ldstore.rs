// ========================================================================================
//
//                       THE LD STORE
//
// ========================================================================================
//
// Read-only service of previously built sparse LD blocks and LD scores. Blocks
// load lazily from their per-chromosome files and stay cached for the process
// lifetime; concurrent readers share one loaded copy.

use crate::ldbuild::ld_file_name;
use crate::ldfile::{self, LdError, SparseLdBlock};
use crate::types::MarkerIndex;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Serves sparse LD blocks and LD scores, keyed by chromosome.
pub struct LdStore {
    dir: PathBuf,
    cache: DashMap<u8, Arc<SparseLdBlock>>,
}

impl LdStore {
    /// Points the store at a directory of per-chromosome LD files. Nothing is
    /// read until a chromosome is first requested.
    pub fn open(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            cache: DashMap::new(),
        }
    }

    /// The sparse LD block for one chromosome, loading and caching it on first
    /// use. A missing file means the build step has not run for that
    /// chromosome.
    pub fn block(&self, chromosome: u8) -> Result<Arc<SparseLdBlock>, LdError> {
        if let Some(found) = self.cache.get(&chromosome) {
            return Ok(Arc::clone(&found));
        }
        let path = self.dir.join(ld_file_name(chromosome));
        if !path.exists() {
            return Err(LdError::NotBuilt(chromosome));
        }
        let block = Arc::new(ldfile::read_block(&path)?);
        if block.chromosome != chromosome {
            return Err(LdError::Format {
                path,
                detail: format!(
                    "file is named for chromosome {} but records chromosome {}",
                    chromosome, block.chromosome
                ),
            });
        }
        let entry = self
            .cache
            .entry(chromosome)
            .or_insert_with(|| Arc::clone(&block));
        Ok(Arc::clone(&entry))
    }

    /// Per-marker LD scores for one chromosome.
    pub fn scores(&self, chromosome: u8) -> Result<Vec<f64>, LdError> {
        Ok(self.block(chromosome)?.ld_scores().to_vec())
    }

    /// All markers on `chromosome` whose stored correlation with `marker`
    /// exceeds `r2_threshold` in r-squared terms.
    pub fn neighbors(
        &self,
        chromosome: u8,
        marker: MarkerIndex,
        r2_threshold: f64,
    ) -> Result<Vec<MarkerIndex>, LdError> {
        Ok(self.block(chromosome)?.neighbors(marker, r2_threshold))
    }
}
