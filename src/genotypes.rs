// ========================================================================================
//
//                       THE OUT-OF-CORE GENOTYPE STORE
//
// ========================================================================================
//
// This module is the only reader of raw genotype data. It memory-maps one PLINK
// binary fileset (.bed/.bim/.fam) per chromosome and exposes decoded allele-count
// slices in marker-major (column) and individual-major (row) orientation. Nothing
// here mutates the underlying files; derived statistics (allele frequency,
// missingness) are cached on the marker metadata.

use crate::types::{Individual, IndividualIndex, Marker, MarkerIndex, MISSING_DOSAGE};
use ahash::AHashMap;
use memmap2::Mmap;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

const BED_MAGIC_0: u8 = 0x6c;
const BED_MAGIC_1: u8 = 0x1b;
/// The third header byte for variant-major .bed files, the only mode supported.
const BED_MODE_VARIANT_MAJOR: u8 = 0x01;

/// Errors raised while opening or reading genotype filesets.
#[derive(Error, Debug)]
pub enum GenotypeError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed genotype data in {path}: {detail}")]
    Format { path: PathBuf, detail: String },

    #[error("No genotype fileset is loaded for chromosome {0}")]
    ChromosomeNotFound(u8),

    #[error("Marker '{0}' was not found in any loaded chromosome")]
    MarkerNotFound(String),

    #[error("Individual index {0} is out of range for a cohort of {1} individuals")]
    IndividualOutOfRange(u32, usize),

    #[error(
        "The .fam file {path} does not list the same individuals, in the same order, as the \
         first fileset. All per-chromosome filesets must share one cohort."
    )]
    CohortMismatch { path: PathBuf },
}

/// Decodes one packed .bed byte into four allele counts of allele1.
/// PLINK stores two bits per genotype, low bits first: 00 = two copies of
/// allele1, 10 = one copy, 11 = zero copies, 01 = missing.
const fn build_decode_table() -> [[u8; 4]; 256] {
    let mut table = [[0u8; 4]; 256];
    let mut byte = 0usize;
    while byte < 256 {
        let mut slot = 0usize;
        while slot < 4 {
            let code = (byte >> (slot * 2)) & 0b11;
            table[byte][slot] = match code {
                0b00 => 2,
                0b01 => MISSING_DOSAGE,
                0b10 => 1,
                _ => 0,
            };
            slot += 1;
        }
        byte += 1;
    }
    table
}

static DECODE_TABLE: [[u8; 4]; 256] = build_decode_table();

/// Decodes a packed variant record into allele counts for `n_individuals`
/// people. `dst` is cleared first; the padding genotypes in the final byte are
/// dropped.
pub fn decode_record_into(record: &[u8], n_individuals: usize, dst: &mut Vec<u8>) {
    dst.clear();
    dst.reserve(record.len() * 4);
    for &byte in record {
        dst.extend_from_slice(&DECODE_TABLE[byte as usize]);
    }
    dst.truncate(n_individuals);
}

/// One chromosome's share of the cohort: the parsed .bim metadata and the
/// memory-mapped .bed payload.
pub struct ChromosomePartition {
    pub chromosome: u8,
    pub bed_path: PathBuf,
    markers: Vec<Marker>,
    marker_lookup: AHashMap<String, MarkerIndex>,
    mmap: Arc<Mmap>,
    bytes_per_variant: usize,
    n_individuals: usize,
}

impl ChromosomePartition {
    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub fn n_markers(&self) -> usize {
        self.markers.len()
    }

    pub fn marker_index(&self, id: &str) -> Option<MarkerIndex> {
        self.marker_lookup.get(id).copied()
    }

    /// The packed on-disk record for one marker, exactly as stored.
    pub fn record_bytes(&self, marker: MarkerIndex) -> Result<&[u8], GenotypeError> {
        let idx = marker.0 as usize;
        if idx >= self.markers.len() {
            return Err(GenotypeError::MarkerNotFound(format!(
                "index {} on chromosome {}",
                idx, self.chromosome
            )));
        }
        let offset = 3 + idx * self.bytes_per_variant;
        Ok(&self.mmap[offset..offset + self.bytes_per_variant])
    }

    pub fn n_individuals(&self) -> usize {
        self.n_individuals
    }

    /// Decodes the allele-count column for one marker into `dst`. The buffer is
    /// cleared first and ends up holding exactly one count per individual, with
    /// `MISSING_DOSAGE` marking missing genotypes.
    pub fn decode_column(&self, marker: MarkerIndex, dst: &mut Vec<u8>) -> Result<(), GenotypeError> {
        let record = self.record_bytes(marker)?;
        decode_record_into(record, self.n_individuals, dst);
        Ok(())
    }

    /// Decodes one individual's allele counts across every marker of this
    /// chromosome. Column access is the fast path; this strided read exists for
    /// per-individual extraction and is not used in any hot loop.
    pub fn decode_row(&self, individual: IndividualIndex) -> Result<Vec<u8>, GenotypeError> {
        let person = individual.0 as usize;
        if person >= self.n_individuals {
            return Err(GenotypeError::IndividualOutOfRange(
                individual.0,
                self.n_individuals,
            ));
        }
        let byte_in_record = person / 4;
        let slot = person % 4;
        let mut out = Vec::with_capacity(self.markers.len());
        for marker_idx in 0..self.markers.len() {
            let offset = 3 + marker_idx * self.bytes_per_variant + byte_in_record;
            out.push(DECODE_TABLE[self.mmap[offset] as usize][slot]);
        }
        Ok(out)
    }

    /// One sequential pass over the chromosome, filling in allele frequency and
    /// missingness for every marker.
    fn scan_frequencies(&mut self) {
        let mut column = Vec::new();
        for idx in 0..self.markers.len() {
            // Safe by construction: idx ranges over this partition's markers.
            self.decode_column(MarkerIndex(idx as u32), &mut column)
                .expect("in-range marker index");
            let mut allele1_copies = 0u64;
            let mut observed = 0u64;
            for &dosage in &column {
                if dosage != MISSING_DOSAGE {
                    allele1_copies += dosage as u64;
                    observed += 1;
                }
            }
            let marker = &mut self.markers[idx];
            marker.frequency = if observed == 0 {
                0.0
            } else {
                allele1_copies as f64 / (2.0 * observed as f64)
            };
            marker.missingness =
                (self.n_individuals as u64 - observed) as f64 / self.n_individuals as f64;
        }
    }
}

/// Read-only access to the cohort's genotypes, partitioned by chromosome.
pub struct GenotypeStore {
    partitions: BTreeMap<u8, ChromosomePartition>,
    individuals: Vec<Individual>,
}

impl GenotypeStore {
    /// Opens one PLINK fileset per chromosome from the given path prefixes
    /// (each prefix names `<prefix>.bed`, `<prefix>.bim`, `<prefix>.fam`).
    ///
    /// Every fileset must cover exactly one chromosome, no chromosome may
    /// appear twice, and all .fam files must list the identical cohort. A
    /// frequency/missingness scan runs once per chromosome on open.
    pub fn open(prefixes: &[PathBuf]) -> Result<Self, GenotypeError> {
        let mut partitions = BTreeMap::new();
        let mut individuals: Option<Vec<Individual>> = None;

        for prefix in prefixes {
            let bed_path = prefix.with_extension("bed");
            let bim_path = prefix.with_extension("bim");
            let fam_path = prefix.with_extension("fam");

            let fam = parse_fam(&fam_path)?;
            match &individuals {
                None => individuals = Some(fam),
                Some(canonical) => {
                    if *canonical != fam {
                        return Err(GenotypeError::CohortMismatch { path: fam_path });
                    }
                }
            }
            let n_individuals = individuals.as_ref().map(Vec::len).unwrap_or(0);

            let markers = parse_bim(&bim_path)?;
            let chromosome = match markers.first() {
                Some(m) => m.chromosome,
                None => {
                    return Err(GenotypeError::Format {
                        path: bim_path,
                        detail: "fileset contains no markers".to_string(),
                    });
                }
            };
            if let Some(stray) = markers.iter().find(|m| m.chromosome != chromosome) {
                return Err(GenotypeError::Format {
                    path: bim_path,
                    detail: format!(
                        "fileset mixes chromosomes {} and {}; one fileset per chromosome is required",
                        chromosome, stray.chromosome
                    ),
                });
            }
            if partitions.contains_key(&chromosome) {
                return Err(GenotypeError::Format {
                    path: bim_path,
                    detail: format!("chromosome {chromosome} appears in more than one fileset"),
                });
            }

            let partition =
                open_partition(chromosome, &bed_path, markers, n_individuals)?;
            partitions.insert(chromosome, partition);
        }

        let individuals = individuals.unwrap_or_default();
        let mut store = Self {
            partitions,
            individuals,
        };
        for partition in store.partitions.values_mut() {
            partition.scan_frequencies();
            log::info!(
                "chromosome {}: {} markers, {} individuals scanned",
                partition.chromosome,
                partition.n_markers(),
                partition.n_individuals
            );
        }
        Ok(store)
    }

    pub fn chromosomes(&self) -> impl Iterator<Item = u8> + '_ {
        self.partitions.keys().copied()
    }

    pub fn partition(&self, chromosome: u8) -> Result<&ChromosomePartition, GenotypeError> {
        self.partitions
            .get(&chromosome)
            .ok_or(GenotypeError::ChromosomeNotFound(chromosome))
    }

    pub fn individuals(&self) -> &[Individual] {
        &self.individuals
    }

    pub fn n_individuals(&self) -> usize {
        self.individuals.len()
    }

    /// Looks a marker up by id across all loaded chromosomes.
    pub fn find_marker(&self, id: &str) -> Result<(u8, MarkerIndex), GenotypeError> {
        for partition in self.partitions.values() {
            if let Some(idx) = partition.marker_index(id) {
                return Ok((partition.chromosome, idx));
            }
        }
        Err(GenotypeError::MarkerNotFound(id.to_string()))
    }

    /// Replaces one chromosome's marker annotations (frequency, missingness,
    /// QC flags) with previously persisted ones. Marker identities must match
    /// one-for-one; this never reorders or renames markers.
    pub fn adopt_marker_annotations(
        &mut self,
        chromosome: u8,
        annotated: &[Marker],
    ) -> Result<(), GenotypeError> {
        let partition = self
            .partitions
            .get_mut(&chromosome)
            .ok_or(GenotypeError::ChromosomeNotFound(chromosome))?;
        if partition.markers.len() != annotated.len() {
            return Err(GenotypeError::Format {
                path: partition.bed_path.clone(),
                detail: format!(
                    "persisted metadata lists {} markers but the fileset has {}",
                    annotated.len(),
                    partition.markers.len()
                ),
            });
        }
        for (current, saved) in partition.markers.iter_mut().zip(annotated) {
            if current.id != saved.id {
                return Err(GenotypeError::Format {
                    path: partition.bed_path.clone(),
                    detail: format!(
                        "persisted metadata names marker '{}' where the fileset has '{}'",
                        saved.id, current.id
                    ),
                });
            }
            current.frequency = saved.frequency;
            current.missingness = saved.missingness;
            current.qc_pass = saved.qc_pass;
        }
        Ok(())
    }

    /// Annotates every marker's QC flag from its scanned frequency and
    /// missingness. Markers whose minor-allele frequency falls below
    /// `min_maf`, or whose missingness exceeds `max_missingness`, fail QC.
    /// Returns the number of markers failing.
    pub fn apply_qc(&mut self, min_maf: f64, max_missingness: f64) -> usize {
        let mut failed = 0usize;
        for partition in self.partitions.values_mut() {
            for marker in &mut partition.markers {
                let maf = marker.frequency.min(1.0 - marker.frequency);
                marker.qc_pass = maf >= min_maf && marker.missingness <= max_missingness;
                if !marker.qc_pass {
                    failed += 1;
                }
            }
        }
        failed
    }
}

fn open_partition(
    chromosome: u8,
    bed_path: &Path,
    markers: Vec<Marker>,
    n_individuals: usize,
) -> Result<ChromosomePartition, GenotypeError> {
    let file = File::open(bed_path).map_err(|source| GenotypeError::Io {
        path: bed_path.to_path_buf(),
        source,
    })?;
    let mmap = unsafe {
        Mmap::map(&file).map_err(|source| GenotypeError::Io {
            path: bed_path.to_path_buf(),
            source,
        })?
    };

    if mmap.len() < 3 || mmap[0] != BED_MAGIC_0 || mmap[1] != BED_MAGIC_1 {
        return Err(GenotypeError::Format {
            path: bed_path.to_path_buf(),
            detail: "missing PLINK .bed magic bytes".to_string(),
        });
    }
    if mmap[2] != BED_MODE_VARIANT_MAJOR {
        return Err(GenotypeError::Format {
            path: bed_path.to_path_buf(),
            detail: format!(
                "unsupported .bed mode byte {:#04x}; only variant-major files are supported",
                mmap[2]
            ),
        });
    }

    let bytes_per_variant = n_individuals.div_ceil(4);
    let expected = 3 + markers.len() * bytes_per_variant;
    if mmap.len() != expected {
        return Err(GenotypeError::Format {
            path: bed_path.to_path_buf(),
            detail: format!(
                "file is {} bytes but {} markers x {} individuals requires exactly {} bytes; \
                 the file is truncated or inconsistent with its .bim/.fam",
                mmap.len(),
                markers.len(),
                n_individuals,
                expected
            ),
        });
    }

    // Window bounds downstream assume genomic order, so enforce it here.
    if let Some(pair) = markers.windows(2).find(|w| w[0].position > w[1].position) {
        return Err(GenotypeError::Format {
            path: bed_path.to_path_buf(),
            detail: format!(
                "markers are not in genomic order: '{}' at {} precedes '{}' at {}",
                pair[0].id, pair[0].position, pair[1].id, pair[1].position
            ),
        });
    }

    let marker_lookup = markers
        .iter()
        .enumerate()
        .map(|(i, m)| (m.id.clone(), MarkerIndex(i as u32)))
        .collect();

    Ok(ChromosomePartition {
        chromosome,
        bed_path: bed_path.to_path_buf(),
        markers,
        marker_lookup,
        mmap: Arc::new(mmap),
        bytes_per_variant,
        n_individuals,
    })
}

fn parse_bim(path: &Path) -> Result<Vec<Marker>, GenotypeError> {
    let file = File::open(path).map_err(|source| GenotypeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);
    let mut markers = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| GenotypeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            return Err(GenotypeError::Format {
                path: path.to_path_buf(),
                detail: format!(
                    "line {}: expected 6 fields (chrom, id, cM, bp, a1, a2), found {}",
                    line_no + 1,
                    fields.len()
                ),
            });
        }
        let chromosome =
            crate::types::parse_chromosome_label(fields[0]).map_err(|detail| {
                GenotypeError::Format {
                    path: path.to_path_buf(),
                    detail: format!("line {}: {detail}", line_no + 1),
                }
            })?;
        let genetic_position: f64 = fields[2].parse().map_err(|_| GenotypeError::Format {
            path: path.to_path_buf(),
            detail: format!("line {}: invalid genetic position '{}'", line_no + 1, fields[2]),
        })?;
        let position: u32 = fields[3].parse().map_err(|_| GenotypeError::Format {
            path: path.to_path_buf(),
            detail: format!("line {}: invalid base-pair position '{}'", line_no + 1, fields[3]),
        })?;
        markers.push(Marker {
            id: fields[1].to_string(),
            chromosome,
            genetic_position,
            position,
            allele1: fields[4].to_string(),
            allele2: fields[5].to_string(),
            frequency: 0.0,
            missingness: 0.0,
            qc_pass: true,
        });
    }
    Ok(markers)
}

fn parse_fam(path: &Path) -> Result<Vec<Individual>, GenotypeError> {
    let file = File::open(path).map_err(|source| GenotypeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);
    let mut individuals = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| GenotypeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let family_id = fields.next();
        let individual_id = fields.next();
        match (family_id, individual_id) {
            (Some(fid), Some(iid)) => individuals.push(Individual {
                family_id: fid.to_string(),
                individual_id: iid.to_string(),
            }),
            _ => {
                return Err(GenotypeError::Format {
                    path: path.to_path_buf(),
                    detail: format!(
                        "line {}: expected at least family and individual ids",
                        line_no + 1
                    ),
                });
            }
        }
    }
    Ok(individuals)
}
