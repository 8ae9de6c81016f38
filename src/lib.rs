//! Exports the handwritten digit classifier from a PyTorch checkpoint to a single
//! self-contained ONNX file for in-browser inference.

pub mod architecture;
pub mod export;
pub mod loader;
pub mod prompt;
pub mod verify;

use std::path::PathBuf;
use crate::export::{export_model, ExportError};
use crate::loader::{load_weights, LoadError, LoadOutcome};
use crate::prompt::ConfirmationProvider;
use crate::verify::{print_instructions, verify_export, VerificationReport, VerifyError};

pub const DEFAULT_FULL_MODEL_PATH: &str = "digit_model_full.pth";
pub const DEFAULT_STATE_DICT_PATH: &str = "digit_model.pth";
pub const DEFAULT_OUTPUT_PATH: &str = "model.onnx";
pub const DEFAULT_OPSET_VERSION: i64 = 18;

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub full_model_path: PathBuf,
    pub state_dict_path: PathBuf,
    pub output_path: PathBuf,
    pub opset_version: i64,
    /// Seeds random initialization when no checkpoint is found.
    pub seed: Option<u64>,
    pub fold_constants: bool,
    /// Writes parameters to `<output>.data` instead of embedding them.
    pub external_data: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            full_model_path: PathBuf::from(DEFAULT_FULL_MODEL_PATH),
            state_dict_path: PathBuf::from(DEFAULT_STATE_DICT_PATH),
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            opset_version: DEFAULT_OPSET_VERSION,
            seed: None,
            fold_constants: true,
            external_data: false,
        }
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Exported(VerificationReport),
    /// The operator refused to export random weights.
    Cancelled,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Exported(_) => 0,
            RunOutcome::Cancelled => 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    LoadError(#[from] LoadError),
    #[error(transparent)]
    ExportError(#[from] ExportError),
    #[error(transparent)]
    VerifyError(#[from] VerifyError),
}

pub fn run(config: &ExportConfig, confirmation: &mut dyn ConfirmationProvider) -> Result<RunOutcome, RunError> {
    println!("🔄 Chargement du modèle PyTorch...");
    let loaded = match load_weights(&config.full_model_path, &config.state_dict_path, config.seed, confirmation)? {
        LoadOutcome::Loaded(loaded) => loaded,
        LoadOutcome::Declined => {
            println!("❌ Export annulé.");
            return Ok(RunOutcome::Cancelled);
        }
    };
    log::info!("Exporting weights from {}", loaded.source);

    export_model(&loaded.model, &loaded.source, config)?;
    let report = verify_export(&config.output_path)?;
    print_instructions();
    Ok(RunOutcome::Exported(report))
}
