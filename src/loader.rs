use std::fmt;
use std::path::{Path, PathBuf};
use onnx_graph::pth::{PthCheckpoint, PthError};
use rand::SeedableRng;
use rand::rngs::StdRng;
use crate::architecture::{ArchitectureError, DigitRecognitionCnn, CLASS_NAME};
use crate::prompt::{ConfirmationProvider, CONFIRMATION_PROMPT};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Cannot read checkpoint {path}: {source}")]
    CheckpointError { path: PathBuf, source: PthError },
    #[error("Checkpoint {path} does not fit the digit classifier: {source}")]
    MismatchError { path: PathBuf, source: ArchitectureError },
    #[error("Cannot initialize random weights: {0}")]
    RandomInitError(ArchitectureError),
    #[error("Cannot read confirmation: {0}")]
    PromptError(#[from] std::io::Error),
}

/// Where the exported weights came from.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightSource {
    FullModel { path: PathBuf, class_name: String },
    StateDict { path: PathBuf },
    Random { seed: Option<u64> },
}

impl WeightSource {
    pub fn is_trained(&self) -> bool {
        !matches!(self, WeightSource::Random { .. })
    }
}

impl fmt::Display for WeightSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightSource::FullModel { path, class_name } => write!(f, "{} ({class_name})", path.display()),
            WeightSource::StateDict { path } => write!(f, "{}", path.display()),
            WeightSource::Random { seed: Some(seed) } => write!(f, "random (seed {seed})"),
            WeightSource::Random { seed: None } => write!(f, "random"),
        }
    }
}

pub struct LoadedModel {
    pub model: DigitRecognitionCnn,
    pub source: WeightSource,
}

pub enum LoadOutcome {
    Loaded(LoadedModel),
    Declined,
}

fn load_checkpoint(path: &Path) -> Result<PthCheckpoint, LoadError> {
    PthCheckpoint::load(path).map_err(|source| LoadError::CheckpointError { path: path.to_path_buf(), source })
}

fn apply_checkpoint(path: &Path, checkpoint: PthCheckpoint) -> Result<DigitRecognitionCnn, LoadError> {
    log::debug!("{} tensors in {}", checkpoint.state_dict.len(), path.display());
    DigitRecognitionCnn::from_state_dict(checkpoint.state_dict)
        .map_err(|source| LoadError::MismatchError { path: path.to_path_buf(), source })
}

/// Resolves weights in priority order: full pickled model, then state dict, then (if confirmed) random init.
pub fn load_weights(
    full_model_path: &Path,
    state_dict_path: &Path,
    seed: Option<u64>,
    confirmation: &mut dyn ConfirmationProvider,
) -> Result<LoadOutcome, LoadError> {
    if full_model_path.exists() {
        println!("📥 Chargement du modèle complet: {}", full_model_path.display());
        let checkpoint = load_checkpoint(full_model_path)?;
        let source = match &checkpoint.module_class {
            Some(class_name) => {
                println!("   Classe du modèle: {class_name}");
                if class_name != CLASS_NAME {
                    log::warn!("Pickled module is a {class_name}, expected {CLASS_NAME}");
                }
                WeightSource::FullModel { path: full_model_path.to_path_buf(), class_name: class_name.clone() }
            }
            None => {
                log::info!("{} holds a plain mapping, loading it as a state dict", full_model_path.display());
                WeightSource::StateDict { path: full_model_path.to_path_buf() }
            }
        };
        let model = apply_checkpoint(full_model_path, checkpoint)?;
        println!("✅ Poids du modèle entraîné chargés!");
        return Ok(LoadOutcome::Loaded(LoadedModel { model, source }));
    }

    if state_dict_path.exists() {
        println!("📥 Chargement des poids: {}", state_dict_path.display());
        let checkpoint = load_checkpoint(state_dict_path)?;
        if let Some(class_name) = &checkpoint.module_class {
            log::info!("{} holds a pickled {class_name}, using its parameters", state_dict_path.display());
        }
        let model = apply_checkpoint(state_dict_path, checkpoint)?;
        println!("✅ Poids du modèle entraîné chargés!");
        let source = WeightSource::StateDict { path: state_dict_path.to_path_buf() };
        return Ok(LoadOutcome::Loaded(LoadedModel { model, source }));
    }

    println!("⚠️  ATTENTION: Aucun modèle entraîné trouvé!");
    println!("   Le modèle exporté aura des poids aléatoires.");
    println!("   Exécutez d'abord le notebook pour entraîner le modèle.");
    if !confirmation.confirm(CONFIRMATION_PROMPT)? {
        return Ok(LoadOutcome::Declined);
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let model = DigitRecognitionCnn::random(&mut rng).map_err(LoadError::RandomInitError)?;
    Ok(LoadOutcome::Loaded(LoadedModel { model, source: WeightSource::Random { seed } }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::FixedAnswer;

    #[test]
    fn test_missing_weights_asks_once_and_respects_refusal() {
        let dir = tempfile::tempdir().unwrap();
        let mut answer = FixedAnswer::new("n");
        let outcome = load_weights(&dir.path().join("full.pth"), &dir.path().join("state.pth"), None, &mut answer).unwrap();
        assert!(matches!(outcome, LoadOutcome::Declined));
        assert_eq!(answer.times_asked(), 1);
    }

    #[test]
    fn test_accepted_random_weights_are_seeded() {
        let dir = tempfile::tempdir().unwrap();
        let mut answer = FixedAnswer::yes();
        let outcome = load_weights(&dir.path().join("full.pth"), &dir.path().join("state.pth"), Some(3), &mut answer).unwrap();
        let LoadOutcome::Loaded(loaded) = outcome else {
            panic!("expected random weights");
        };
        assert_eq!(loaded.source, WeightSource::Random { seed: Some(3) });
        assert!(!loaded.source.is_trained());
        assert_eq!(loaded.model.state_dict().len(), 25);
    }

    #[test]
    fn test_unreadable_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.pth");
        std::fs::write(&path, b"not a zip archive").unwrap();
        let mut answer = FixedAnswer::yes();
        let res = load_weights(&dir.path().join("full.pth"), &path, None, &mut answer);
        assert!(matches!(res, Err(LoadError::CheckpointError { .. })));
        assert_eq!(answer.times_asked(), 0);
    }
}
