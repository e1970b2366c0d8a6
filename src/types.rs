// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used
// in one file.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Parses a chromosome label into the numeric code used throughout the engine.
/// Autosomes map to their number; X, Y and MT map to 23, 24 and 25.
pub fn parse_chromosome_label(chr_str: &str) -> Result<u8, String> {
    let mut trimmed = chr_str.trim();

    if trimmed.len() >= 3 && trimmed[..3].eq_ignore_ascii_case("chr") {
        trimmed = &trimmed[3..];
    }

    if trimmed.eq_ignore_ascii_case("X") {
        return Ok(23);
    }
    if trimmed.eq_ignore_ascii_case("Y") {
        return Ok(24);
    }
    if trimmed.eq_ignore_ascii_case("MT") {
        return Ok(25);
    }

    trimmed.parse::<u8>().map_err(|_| {
        format!(
            "Invalid chromosome format '{}'. Expected a number, 'X', 'Y', 'MT', or 'chr' prefix.",
            chr_str.trim()
        )
    })
}

/// Renders a numeric chromosome code with the conventional labels for the
/// non-autosomal codes.
pub fn chromosome_label(code: u8) -> String {
    match code {
        23 => "X".to_string(),
        24 => "Y".to_string(),
        25 => "MT".to_string(),
        n => format!("{n}"),
    }
}

// ========================================================================================
//                            Primitive Type Definitions
// ========================================================================================

/// A 0-based index of a marker within one chromosome's genotype fileset.
///
/// This newtype prevents confusion between different index spaces at compile time.
/// The `#[repr(transparent)]` attribute guarantees this is a zero-cost abstraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MarkerIndex(pub u32);

/// A 0-based index of an individual within the cohort's .fam ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct IndividualIndex(pub u32);

/// The sentinel used for a missing genotype in decoded allele-count columns.
/// Valid counts are 0, 1 and 2; anything else in a decoded buffer is this value.
pub const MISSING_DOSAGE: u8 = 3;

// ========================================================================================
//                              Cohort metadata records
// ========================================================================================

/// Identity and quality metadata for one marker. Identity fields are immutable
/// once loaded from the .bim file; `frequency`, `missingness` and `qc_pass` are
/// annotations filled in by the frequency scan and the QC filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Marker {
    pub id: String,
    pub chromosome: u8,
    /// Genetic-map position in centimorgans, as given in the .bim file.
    pub genetic_position: f64,
    /// Base-pair position.
    pub position: u32,
    /// First allele from the .bim file. Decoded allele counts count copies of
    /// this allele.
    pub allele1: String,
    /// Second allele from the .bim file.
    pub allele2: String,
    /// Frequency of `allele1` among non-missing genotypes.
    pub frequency: f64,
    /// Fraction of individuals with a missing genotype at this marker.
    pub missingness: f64,
    /// Whether the marker survived the most recent QC filter. Markers start
    /// out passing.
    pub qc_pass: bool,
}

/// One individual from the .fam file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Individual {
    pub family_id: String,
    pub individual_id: String,
}

impl fmt::Display for Individual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family_id, self.individual_id)
    }
}

/// One row of a GWAS summary-statistic table, keyed externally by marker id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub effect: f64,
    pub se: f64,
    pub pvalue: f64,
    pub effect_allele: String,
    pub frequency: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_chromosome_label_supports_common_variants() {
        assert_eq!(parse_chromosome_label("1").unwrap(), 1);
        assert_eq!(parse_chromosome_label("chr2").unwrap(), 2);
        assert_eq!(parse_chromosome_label("chrX").unwrap(), 23);
        assert_eq!(parse_chromosome_label("MT").unwrap(), 25);
        assert!(parse_chromosome_label("chrQ").is_err());
    }

    #[test]
    fn chromosome_label_round_trips_special_codes() {
        for code in [1u8, 9, 22, 23, 24, 25] {
            assert_eq!(parse_chromosome_label(&chromosome_label(code)).unwrap(), code);
        }
    }
}
