#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod adjust;
pub mod bayes;
pub mod bayes_mt;
pub mod genotypes;
pub mod ldbuild;
pub mod ldfile;
pub mod ldstore;
pub mod manifest;
pub mod score;
pub mod sumstat;
pub mod types;
