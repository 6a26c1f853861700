use serde::Deserialize;
use std::{fs, path::{Path, PathBuf}};
use thiserror::Error;
use walkdir::WalkDir;

use crate::curriculum::{Challenge, Curriculum, Module};
use crate::error::CurriculumError;

pub const MANIFEST_FILE: &str = "curriculum.json";

/// On-disk shape of a curriculum: the module table and, optionally, the
/// challenge bank.
#[derive(Deserialize, Debug, Clone)]
pub struct CurriculumManifest {
    pub modules: Vec<Module>,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("curriculum.json not found under {}", .0.display())]
    Missing(PathBuf),
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Invalid(#[from] CurriculumError),
}

/// `path` itself if it is a file, otherwise the first `curriculum.json`
/// found below it.
pub fn find_manifest(path: &Path) -> Result<PathBuf, ManifestError> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file() && e.file_name() == MANIFEST_FILE)
        .map(|e| e.into_path())
        .ok_or_else(|| ManifestError::Missing(path.to_path_buf()))
}

pub fn parse_manifest(json: &str) -> Result<Curriculum, ManifestError> {
    let manifest: CurriculumManifest = serde_json::from_str(json)?;
    Ok(Curriculum::new(manifest.modules, manifest.challenges)?)
}

/// Finds, reads and validates a curriculum. Any error here is fatal for
/// the caller: a broken graph must be fixed, not worked around.
pub fn load_curriculum(path: &Path) -> Result<Curriculum, ManifestError> {
    let file = find_manifest(path)?;
    let json = fs::read_to_string(&file)?;
    let curriculum = parse_manifest(&json)?;
    tracing::info!(path = %file.display(), modules = curriculum.len(), "curriculum loaded");
    Ok(curriculum)
}
