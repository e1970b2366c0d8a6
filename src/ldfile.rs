// ========================================================================================
//
//                       THE SPARSE LD BLOCK AND ITS ON-DISK FORMAT
//
// ========================================================================================
//
// One LD file per chromosome. The format is read/write symmetric: whatever the
// builder serializes, the store reads back with the exact same f64 bits.
//
// Layout, all integers little-endian:
//
//   magic      4 bytes  "GLLD"
//   version    u32      currently 1
//   chromosome u8
//   reserved   3 bytes  zero
//   n_markers  u64
//   windows    n_markers x (start u32, len u32)
//   values     sum(len) x f64      signed correlations, row-major per marker
//   scores     n_markers x f64     per-marker LD scores
//
// Files are written to a sibling temp path and atomically renamed into place,
// so a file that exists under its final name is always complete.

use crate::genotypes::GenotypeError;
use crate::types::MarkerIndex;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const LD_MAGIC: &[u8; 4] = b"GLLD";
const LD_FORMAT_VERSION: u32 = 1;

/// Errors raised while building, serializing or serving sparse LD data.
#[derive(Error, Debug)]
pub enum LdError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed LD file {path}: {detail}")]
    Format { path: PathBuf, detail: String },

    #[error(
        "LD file {path} already exists. Rebuilding is expensive, so it is refused unless \
         overwrite is requested explicitly."
    )]
    AlreadyExists { path: PathBuf },

    #[error(
        "No sparse LD block has been built for chromosome {0}. Run the LD build step first."
    )]
    NotBuilt(u8),

    #[error(transparent)]
    Genotype(#[from] GenotypeError),
}

/// The sparse banded correlation structure for one chromosome.
///
/// For marker `i`, `window_start[i]` is the index of the first marker in its
/// band and the flat `values` slice at `offsets[i]..offsets[i+1]` holds the
/// signed correlations against markers `window_start[i]..`. Correlations
/// outside the band are exactly zero by definition and are not stored. The
/// structure is symmetric by construction and carries r(i,i) = 1 for every
/// QC-passing marker.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseLdBlock {
    pub chromosome: u8,
    window_start: Vec<u32>,
    offsets: Vec<usize>,
    values: Vec<f64>,
    ld_scores: Vec<f64>,
}

impl SparseLdBlock {
    pub fn new(
        chromosome: u8,
        window_start: Vec<u32>,
        offsets: Vec<usize>,
        values: Vec<f64>,
        ld_scores: Vec<f64>,
    ) -> Self {
        debug_assert_eq!(offsets.len(), window_start.len() + 1);
        debug_assert_eq!(ld_scores.len(), window_start.len());
        Self {
            chromosome,
            window_start,
            offsets,
            values,
            ld_scores,
        }
    }

    pub fn n_markers(&self) -> usize {
        self.window_start.len()
    }

    pub fn ld_scores(&self) -> &[f64] {
        &self.ld_scores
    }

    /// The band for one marker: the index of its first neighbor and the stored
    /// correlations, in marker order.
    #[inline]
    pub fn window(&self, marker: MarkerIndex) -> (usize, &[f64]) {
        let i = marker.0 as usize;
        (
            self.window_start[i] as usize,
            &self.values[self.offsets[i]..self.offsets[i + 1]],
        )
    }

    /// The stored correlation between two markers; exactly 0.0 outside the band.
    #[inline]
    pub fn r(&self, a: MarkerIndex, b: MarkerIndex) -> f64 {
        let (start, band) = self.window(a);
        let j = b.0 as usize;
        if j < start || j >= start + band.len() {
            0.0
        } else {
            band[j - start]
        }
    }

    #[inline]
    pub fn r2(&self, a: MarkerIndex, b: MarkerIndex) -> f64 {
        let r = self.r(a, b);
        r * r
    }

    /// All markers whose stored correlation with `marker` exceeds the given
    /// r-squared threshold, the marker itself excluded.
    pub fn neighbors(&self, marker: MarkerIndex, r2_threshold: f64) -> Vec<MarkerIndex> {
        let (start, band) = self.window(marker);
        band.iter()
            .enumerate()
            .filter_map(|(k, &r)| {
                let j = (start + k) as u32;
                if j != marker.0 && r * r > r2_threshold {
                    Some(MarkerIndex(j))
                } else {
                    None
                }
            })
            .collect()
    }
}

/// Serializes a block to `path` via a temp file and an atomic rename.
pub fn write_block(path: &Path, block: &SparseLdBlock) -> Result<(), LdError> {
    let io_err = |source| LdError::Io {
        path: path.to_path_buf(),
        source,
    };

    let tmp_path = path.with_extension("ld.tmp");
    {
        let file = File::create(&tmp_path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(LD_MAGIC).map_err(io_err)?;
        writer
            .write_all(&LD_FORMAT_VERSION.to_le_bytes())
            .map_err(io_err)?;
        writer
            .write_all(&[block.chromosome, 0, 0, 0])
            .map_err(io_err)?;
        writer
            .write_all(&(block.n_markers() as u64).to_le_bytes())
            .map_err(io_err)?;

        for i in 0..block.n_markers() {
            let len = (block.offsets[i + 1] - block.offsets[i]) as u32;
            writer
                .write_all(&block.window_start[i].to_le_bytes())
                .map_err(io_err)?;
            writer.write_all(&len.to_le_bytes()).map_err(io_err)?;
        }
        for value in &block.values {
            writer.write_all(&value.to_le_bytes()).map_err(io_err)?;
        }
        for score in &block.ld_scores {
            writer.write_all(&score.to_le_bytes()).map_err(io_err)?;
        }

        let file = writer.into_inner().map_err(|e| LdError::Io {
            path: path.to_path_buf(),
            source: e.into_error(),
        })?;
        file.sync_all().map_err(io_err)?;
    }
    fs::rename(&tmp_path, path).map_err(io_err)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], LdError> {
        if self.pos + n > self.bytes.len() {
            return Err(LdError::Format {
                path: self.path.to_path_buf(),
                detail: format!(
                    "file ends at byte {} but {} more bytes were expected; the file is truncated",
                    self.bytes.len(),
                    self.pos + n - self.bytes.len()
                ),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, LdError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, LdError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, LdError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

/// Reads a block back from disk, validating magic, version and length.
pub fn read_block(path: &Path) -> Result<SparseLdBlock, LdError> {
    let bytes = fs::read(path).map_err(|source| LdError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cursor = Cursor {
        bytes: &bytes,
        pos: 0,
        path,
    };

    let magic = cursor.take(4)?;
    if magic != LD_MAGIC {
        return Err(LdError::Format {
            path: path.to_path_buf(),
            detail: "missing GLLD magic; not a sparse LD file".to_string(),
        });
    }
    let version = cursor.u32()?;
    if version != LD_FORMAT_VERSION {
        return Err(LdError::Format {
            path: path.to_path_buf(),
            detail: format!(
                "format version {version} is not supported (expected {LD_FORMAT_VERSION})"
            ),
        });
    }
    let header = cursor.take(4)?;
    let chromosome = header[0];
    let n_markers = cursor.u64()? as usize;

    let mut window_start = Vec::with_capacity(n_markers);
    let mut offsets = Vec::with_capacity(n_markers + 1);
    offsets.push(0usize);
    for _ in 0..n_markers {
        window_start.push(cursor.u32()?);
        let len = cursor.u32()? as usize;
        offsets.push(offsets.last().unwrap() + len);
    }

    let total = *offsets.last().unwrap();
    let mut values = Vec::with_capacity(total);
    for _ in 0..total {
        values.push(cursor.f64()?);
    }
    let mut ld_scores = Vec::with_capacity(n_markers);
    for _ in 0..n_markers {
        ld_scores.push(cursor.f64()?);
    }

    if cursor.pos != bytes.len() {
        return Err(LdError::Format {
            path: path.to_path_buf(),
            detail: format!(
                "{} trailing bytes after the score table",
                bytes.len() - cursor.pos
            ),
        });
    }

    Ok(SparseLdBlock::new(
        chromosome,
        window_start,
        offsets,
        values,
        ld_scores,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_block() -> SparseLdBlock {
        // Three markers, band of width <= 2 on each side.
        SparseLdBlock::new(
            7,
            vec![0, 0, 1],
            vec![0, 2, 5, 7],
            vec![1.0, -0.25, -0.25, 1.0, 0.5, 0.5, 1.0],
            vec![1.0625, 1.3125, 1.25],
        )
    }

    #[test]
    fn round_trips_exactly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chr7.ld");
        let block = sample_block();

        write_block(&path, &block).unwrap();
        let loaded = read_block(&path).unwrap();
        assert_eq!(loaded, block);
        // No temp file is left behind.
        assert!(!dir.path().join("chr7.ld.tmp").exists());
    }

    #[test]
    fn band_lookup_is_symmetric_and_zero_outside() {
        let block = sample_block();
        let (a, b, c) = (MarkerIndex(0), MarkerIndex(1), MarkerIndex(2));
        assert_eq!(block.r(a, a), 1.0);
        assert_eq!(block.r(a, b), block.r(b, a));
        assert_eq!(block.r(a, c), 0.0);
        assert_eq!(block.r(c, a), 0.0);
    }

    #[test]
    fn neighbors_respects_threshold_and_excludes_self() {
        let block = sample_block();
        let hits = block.neighbors(MarkerIndex(1), 0.2);
        assert_eq!(hits, vec![MarkerIndex(2)]);
        let none = block.neighbors(MarkerIndex(1), 0.9);
        assert!(none.is_empty());
    }

    #[test]
    fn rejects_unknown_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chr7.ld");
        write_block(&path, &sample_block()).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[4] = 99;
        fs::write(&path, bytes).unwrap();

        match read_block(&path) {
            Err(LdError::Format { detail, .. }) => assert!(detail.contains("version")),
            Err(other) => panic!("expected a format error, got {other}"),
            Ok(_) => panic!("expected a format error"),
        }
    }

    #[test]
    fn rejects_truncation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chr7.ld");
        write_block(&path, &sample_block()).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

        assert!(matches!(read_block(&path), Err(LdError::Format { .. })));
    }
}
