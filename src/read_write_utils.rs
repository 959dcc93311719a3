//! Forest and tree file persistence.
//!
//! Collapsed forests and trees serialize opaquely through [bincode]; what
//! the rest of the crate relies on is only that the CM summaries, observed
//! names and sequences survive a round trip. The likelihood kernel cache is
//! never written — it is derived data keyed on `(p, q)` and rebuilt on
//! demand.
//!
//! An output path may name a file directly, in which case its extension is
//! checked, or a directory, in which case a timestamped default file name is
//! generated inside it. Missing directories are created along the way.

use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use log::debug;
use logging_timer::stime;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::forest::CollapsedForest;
use crate::tree::CollapsedTree;

/// File extension for serialized forests.
pub const FOREST_EXTENSION: &str = "gwforest";

/// File extension for serialized collapsed trees.
pub const TREE_EXTENSION: &str = "gwtree";

// -------------------------------------------------------------------------------------------------
// Forest files.

/// Serialize a forest to `path`: either a `.gwforest` file, or a directory
/// that gets a timestamped default name with the given prefix. Returns the
/// path actually written.
#[stime("debug")]
pub fn write_forest_file(
    forest: &CollapsedForest,
    path: PathBuf,
    default_file_name_prefix: &str,
) -> Result<PathBuf, ForestFileError> {
    let path = resolve_output_path(path, FOREST_EXTENSION, default_file_name_prefix)?;
    write_bincode(forest, &path)?;
    Ok(path)
}

/// Deserialize a forest written by [write_forest_file].
#[stime("debug")]
pub fn read_forest_file(path: PathBuf) -> Result<CollapsedForest, ForestFileError> {
    read_bincode(&path)
}

// -------------------------------------------------------------------------------------------------
// Tree files.

/// Serialize a collapsed tree, with the same path rules as forests.
pub fn write_tree_file(
    tree: &CollapsedTree,
    path: PathBuf,
    default_file_name_prefix: &str,
) -> Result<PathBuf, ForestFileError> {
    let path = resolve_output_path(path, TREE_EXTENSION, default_file_name_prefix)?;
    write_bincode(tree, &path)?;
    Ok(path)
}

/// Deserialize a collapsed tree written by [write_tree_file].
pub fn read_tree_file(path: PathBuf) -> Result<CollapsedTree, ForestFileError> {
    read_bincode(&path)
}

// -------------------------------------------------------------------------------------------------
// Plumbing.

fn write_bincode<T: Serialize>(value: &T, path: &PathBuf) -> Result<(), ForestFileError> {
    let writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(writer, value)?;
    debug!("serialized {:?}", path);
    Ok(())
}

fn read_bincode<T: DeserializeOwned>(path: &PathBuf) -> Result<T, ForestFileError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(bincode::deserialize_from(reader)?)
}

/// Turn a user-supplied output path into a concrete file path with the
/// expected extension. A path without an extension is treated as a directory
/// and gets `<prefix>_<timestamp>.<extension>` appended.
fn resolve_output_path(
    mut path: PathBuf,
    extension: &str,
    prefix: &str,
) -> Result<PathBuf, ForestFileError> {
    match path.extension() {
        Some(found) if found == extension => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.is_dir() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Ok(path)
        }
        Some(found) => Err(ForestFileError::WrongExtension {
            expected: extension.to_owned(),
            found: found.to_os_string(),
        }),
        None => {
            if !path.is_dir() {
                std::fs::create_dir_all(&path)?;
            }
            let stamp = chrono::offset::Local::now().timestamp();
            path.push(format!("{}_{}.{}", prefix, stamp, extension));
            Ok(path)
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Errors.

#[derive(thiserror::Error, Debug)]
pub enum ForestFileError {
    #[error("problem opening, reading or writing the file")]
    Io(#[from] std::io::Error),
    #[error("problem encoding or decoding with bincode")]
    Encoding(#[from] bincode::Error),
    #[error("expected a .{expected} file, found extension {found:?}")]
    WrongExtension { expected: String, found: OsString },
}

// -------------------------------------------------------------------------------------------------
// Unit tests.

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gwtree-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn forest_round_trip_preserves_tree_count() {
        let mut rng = SmallRng::seed_from_u64(23);
        let forest = CollapsedForest::simulate(0.3, 0.4, 4, &mut rng).unwrap();

        let path = write_forest_file(&forest, scratch_dir("forest-round-trip"), "forest").unwrap();
        assert_eq!(path.extension().unwrap(), FOREST_EXTENSION);

        let restored = read_forest_file(path).unwrap();
        assert_eq!(restored.n_trees(), forest.n_trees());
    }

    #[test]
    fn tree_round_trip_preserves_cm_summary() {
        let mut rng = SmallRng::seed_from_u64(29);
        let tree = crate::tree::simulate(0.3, 0.4, &mut rng).unwrap();

        let path = write_tree_file(&tree, scratch_dir("tree-round-trip"), "tree").unwrap();
        let restored = read_tree_file(path).unwrap();
        assert_eq!(restored.cm_counts(), tree.cm_counts());
    }

    #[test]
    fn wrong_extension_is_rejected() {
        let dir = scratch_dir("extension-check");
        assert!(matches!(
            resolve_output_path(dir.join("forest.bin"), FOREST_EXTENSION, "forest"),
            Err(ForestFileError::WrongExtension { .. })
        ));
        let ok = resolve_output_path(dir.join("forest.gwforest"), FOREST_EXTENSION, "forest")
            .unwrap();
        assert_eq!(ok.file_name().unwrap(), "forest.gwforest");
    }

    #[test]
    fn directory_paths_get_timestamped_default_names() {
        let path =
            resolve_output_path(scratch_dir("default-name"), FOREST_EXTENSION, "forest").unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("forest_"));
        assert!(name.ends_with(".gwforest"));
    }
}
