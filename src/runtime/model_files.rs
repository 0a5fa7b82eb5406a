/*!
 * Model directory layout.
 *
 * A model directory holds exactly the three files a decoder needs: the
 * weights (`*.npz`), the vocabulary (`*vocab*.yml`) and the decoder
 * configuration (`*decoder*.yml`).
 */

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::errors::RuntimeError;

/// Absolute paths of the files a decoder is started with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    /// Model weights
    pub weights: PathBuf,
    /// Vocabulary, passed to the decoder for both source and target side
    pub vocabulary: PathBuf,
    /// Decoder configuration
    pub decoder_config: PathBuf,
}

impl ModelFiles {
    /// Find the three model files in `model_dir`
    ///
    /// Only the top level of the directory is searched. When several files
    /// match the same role the last one in file name order is used.
    pub fn locate<P: AsRef<Path>>(model_dir: P) -> Result<Self, RuntimeError> {
        let model_dir = model_dir.as_ref();
        if !model_dir.is_dir() {
            return Err(RuntimeError::NotFound(format!(
                "Model directory does not exist: {}",
                model_dir.display()
            )));
        }

        let mut weights = None;
        let mut vocabulary = None;
        let mut decoder_config = None;

        let entries = WalkDir::new(model_dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by_file_name();

        for entry in entries {
            let entry = entry.map_err(|e| {
                RuntimeError::NotFound(format!("Failed to read {}: {}", model_dir.display(), e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy();
            if name.ends_with(".npz") {
                weights = Some(entry.path().to_path_buf());
            }
            if name.ends_with(".yml") && name.contains("vocab") {
                vocabulary = Some(entry.path().to_path_buf());
            }
            if name.ends_with(".yml") && name.contains("decoder") {
                decoder_config = Some(entry.path().to_path_buf());
            }
        }

        match (weights, vocabulary, decoder_config) {
            (Some(weights), Some(vocabulary), Some(decoder_config)) => Ok(Self {
                weights: absolutize(&weights)?,
                vocabulary: absolutize(&vocabulary)?,
                decoder_config: absolutize(&decoder_config)?,
            }),
            (weights, vocabulary, decoder_config) => {
                let missing: Vec<&str> = [
                    (weights.is_none(), "weights (*.npz)"),
                    (vocabulary.is_none(), "vocabulary (*vocab*.yml)"),
                    (decoder_config.is_none(), "decoder config (*decoder*.yml)"),
                ]
                .iter()
                .filter(|(absent, _)| *absent)
                .map(|(_, role)| *role)
                .collect();

                Err(RuntimeError::NotFound(format!(
                    "Required model files not found in {}: missing {}",
                    model_dir.display(),
                    missing.join(", ")
                )))
            }
        }
    }

    /// Decoder arguments: weights, vocabulary twice, decoder configuration
    pub fn decoder_args(&self) -> Vec<&Path> {
        vec![
            Path::new("-m"),
            self.weights.as_path(),
            Path::new("-v"),
            self.vocabulary.as_path(),
            self.vocabulary.as_path(),
            Path::new("-c"),
            self.decoder_config.as_path(),
        ]
    }
}

fn absolutize(path: &Path) -> Result<PathBuf, RuntimeError> {
    std::fs::canonicalize(path)
        .map_err(|e| RuntimeError::NotFound(format!("Cannot resolve {}: {}", path.display(), e)))
}
