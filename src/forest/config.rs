//! Ranking configuration.
//!
//! The config is defined by a struct. A builder pattern is used to construct
//! it, but it can also be deserialized from a TOML file:
//!
//! ```toml,ignore
//! # Coefficients for isotype parsimony, mutability parsimony and allele
//! # count. If absent, trees are ranked lexicographically.
//! ranking_coeffs = [0.1, 1.0, 0.0]
//!
//! # Mutation model tables (both or neither).
//! mutability_file = "./MK_RS5NF_mutability.csv"
//! substitution_file = "./MK_RS5NF_substitution.csv"
//!
//! # Index at which two concatenated chains meet.
//! chain_split = 324
//!
//! # Observed isotypes and the mapping from sequence ids to cell ids.
//! isotype_map_file = "./isotypemap.txt"
//! id_map_file = "./idmap.txt"
//! ignore_isotype = false
//! isotype_names = ["IgM", "IgG3", "IgG1", "IgA1", "IgG2", "IgG4", "IgE", "IgA2"]
//! ```
//!
//! [RankingConfig::parse] resolves the file paths into runtime objects (the
//! mutation model and isotype tables) and validates what it can.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use derive_builder::Builder;
use log::debug;
use serde::Deserialize;
use thiserror::Error;

use crate::isotype::{parse_id_map, parse_isotype_map, IsotypeError, IsotypeOrder};
use crate::mutability::{MutabilityError, MutationModel};

use super::FilterOptions;

#[derive(Deserialize, Debug, Default, Builder)]
#[builder(default)]
pub struct RankingConfig {
    ranking_coeffs: Option<Vec<f64>>,
    mutability_file: Option<PathBuf>,
    substitution_file: Option<PathBuf>,
    chain_split: Option<usize>,
    #[serde(default)]
    ignore_isotype: bool,
    isotype_names: Option<Vec<String>>,
    isotype_map_file: Option<PathBuf>,
    id_map_file: Option<PathBuf>,
}

/// Runtime objects resolved from a [RankingConfig].
pub struct RankingChoices {
    pub options: FilterOptions,
    pub isotype_map: Option<HashMap<String, String>>,
    pub id_map: Option<HashMap<String, BTreeSet<String>>>,
    pub isotype_order: IsotypeOrder,
}

impl RankingConfig {
    /// Read a config from a TOML file.
    pub fn deserialize(path: PathBuf) -> Result<Self, RankingConfigError> {
        debug!("parsing ranking config from {:?}", path);
        let mut buf = String::new();
        File::open(path)?.read_to_string(&mut buf)?;
        Ok(toml::from_str(&buf)?)
    }

    /// Resolve file paths into runtime objects.
    pub fn parse(self) -> Result<RankingChoices, RankingConfigError> {
        let mutation_model = match (&self.mutability_file, &self.substitution_file) {
            (Some(mutability), Some(substitution)) => Some(MutationModel::from_files(
                mutability,
                substitution,
                self.chain_split.into_iter().collect(),
            )?),
            (None, None) => None,
            _ => return Err(RankingConfigError::IncompleteMutationModel),
        };

        let isotype_order = match self.isotype_names {
            Some(names) => IsotypeOrder::new(names)?,
            None => IsotypeOrder::default(),
        };
        let isotype_map = self
            .isotype_map_file
            .as_deref()
            .map(parse_isotype_map)
            .transpose()?;
        let id_map = self.id_map_file.as_deref().map(parse_id_map).transpose()?;

        Ok(RankingChoices {
            options: FilterOptions {
                ranking_coeffs: self.ranking_coeffs,
                mutation_model,
                ignore_isotype: self.ignore_isotype,
            },
            isotype_map,
            id_map,
            isotype_order,
        })
    }
}

#[derive(Error, Debug)]
pub enum RankingConfigError {
    #[error("unable to open or read the config file")]
    FileError(#[from] std::io::Error),
    #[error("problem deserializing TOML config")]
    TomlError(#[from] toml::de::Error),
    #[error("mutability_file and substitution_file must be given together")]
    IncompleteMutationModel,
    #[error("problem building the mutation model")]
    Mutability(#[from] MutabilityError),
    #[error("problem reading isotype tables")]
    Isotype(#[from] IsotypeError),
}

// -------------------------------------------------------------------------------------------------
// Unit tests.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_round_trip_with_coefficients() {
        let config: RankingConfig = toml::from_str(
            r#"
            ranking_coeffs = [0.1, 1.0, 0.0]
            ignore_isotype = true
            "#,
        )
        .unwrap();
        let choices = config.parse().unwrap();
        assert_eq!(choices.options.ranking_coeffs, Some(vec![0.1, 1.0, 0.0]));
        assert!(choices.options.ignore_isotype);
        assert!(choices.options.mutation_model.is_none());
    }

    #[test]
    fn builder_defaults_to_lexicographic_ranking() {
        let config = RankingConfigBuilder::default().build().unwrap();
        let choices = config.parse().unwrap();
        assert!(choices.options.ranking_coeffs.is_none());
        assert!(!choices.options.ignore_isotype);
    }

    #[test]
    fn mutation_model_files_must_come_in_pairs() {
        let config = RankingConfigBuilder::default()
            .mutability_file(Some(PathBuf::from("./mutability.csv")))
            .build()
            .unwrap();
        assert!(matches!(
            config.parse(),
            Err(RankingConfigError::IncompleteMutationModel)
        ));
    }

    #[test]
    fn custom_isotype_order_is_validated() {
        let config = RankingConfigBuilder::default()
            .isotype_names(Some(vec!["IgM".to_string(), "IgM".to_string()]))
            .build()
            .unwrap();
        assert!(config.parse().is_err());
    }
}
