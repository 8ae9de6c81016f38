use std::path::{Path, PathBuf};
use candle_core::Device;
use onnx_graph::{build_proto, onnx, write_model, BuildOptions, WeightStorageStrategy};
use serde::Serialize;
use crate::architecture::{ArchitectureError, DigitRecognitionCnn, CLASS_NAME, IMAGE_SIZE, INPUT_NAME, NUM_CLASSES, OUTPUT_NAME};
use crate::loader::WeightSource;
use crate::ExportConfig;

pub const METADATA_KEY: &str = "digit_export_metadata";
/// MNIST statistics the training pipeline normalized its inputs with.
pub const NORMALIZATION_MEAN: f32 = 0.1307;
pub const NORMALIZATION_STD: f32 = 0.3081;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    ArchitectureError(#[from] ArchitectureError),
    #[error("Cannot build graph: {0}")]
    GraphError(#[from] onnx_graph::Error),
    #[error("Cannot encode metadata: {0}")]
    MetadataError(#[from] serde_json::Error),
    #[error("Forward pass failed: {0}")]
    CandleCoreError(#[from] candle_core::Error),
}

#[derive(Serialize)]
struct Normalization {
    mean: f32,
    std: f32,
}

#[derive(Serialize)]
struct ExportMetadata {
    architecture: &'static str,
    input_name: &'static str,
    output_name: &'static str,
    labels: Vec<String>,
    normalization: Normalization,
    weights: String,
    trained: bool,
}

impl ExportMetadata {
    fn new(source: &WeightSource) -> Self {
        Self {
            architecture: CLASS_NAME,
            input_name: INPUT_NAME,
            output_name: OUTPUT_NAME,
            labels: (0..NUM_CLASSES).map(|x| x.to_string()).collect(),
            normalization: Normalization { mean: NORMALIZATION_MEAN, std: NORMALIZATION_STD },
            weights: source.to_string(),
            trained: source.is_trained(),
        }
    }
}

/// `model.onnx` → `model.onnx.data`
pub fn sidecar_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".data");
    PathBuf::from(name)
}

/// Deletes a previous export and its sidecar, returning what was removed.
pub fn remove_stale_outputs(output: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut removed = vec![];
    for path in [output.to_path_buf(), sidecar_path(output)] {
        if path.exists() {
            std::fs::remove_file(&path)?;
            println!("🗑️  Ancien {} supprimé", path.display());
            removed.push(path);
        }
    }
    Ok(removed)
}

fn build_options(config: &ExportConfig, source: &WeightSource) -> Result<BuildOptions, ExportError> {
    let metadata = serde_json::to_string(&ExportMetadata::new(source))?;
    let weight_storage = if config.external_data {
        WeightStorageStrategy::BinFile(sidecar_path(&config.output_path))
    } else {
        WeightStorageStrategy::EmbeddedData
    };
    Ok(BuildOptions {
        opset_version: config.opset_version,
        fold_constants: config.fold_constants,
        producer_name: env!("CARGO_PKG_NAME").to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        metadata: vec![(METADATA_KEY.to_string(), metadata)],
        weight_storage,
        ..Default::default()
    })
}

/// Traces the model on a dummy sample, then writes the inference graph to `config.output_path`.
/// A failure after the stale files are gone leaves whatever was written in place.
pub fn export_model(model: &DigitRecognitionCnn, source: &WeightSource, config: &ExportConfig) -> Result<onnx::ModelProto, ExportError> {
    let dummy_input = candle_core::Tensor::randn(0f32, 1f32, (1, 1, IMAGE_SIZE, IMAGE_SIZE), &Device::Cpu)?;

    remove_stale_outputs(&config.output_path)?;

    println!("📤 Export du modèle ONNX...");
    model.trace(&dummy_input)?;

    let (input, output) = model.build_graph()?;
    let options = build_options(config, source)?;
    let proto = build_proto(&[input], &[(OUTPUT_NAME, output)], &options)?;
    let graph = proto.graph.as_ref();
    log::info!(
        "Graph has {} nodes and {} initializers",
        graph.map(|g| g.node.len()).unwrap_or_default(),
        graph.map(|g| g.initializer.len()).unwrap_or_default()
    );
    write_model(&proto, &config.output_path)?;
    println!("✅ Modèle exporté: {}", config.output_path.display());
    Ok(proto)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_path_appends_data_suffix() {
        assert_eq!(sidecar_path(Path::new("out/model.onnx")), PathBuf::from("out/model.onnx.data"));
    }

    #[test]
    fn test_remove_stale_outputs_only_touches_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("model.onnx");
        assert!(remove_stale_outputs(&output).unwrap().is_empty());

        std::fs::write(sidecar_path(&output), b"stale").unwrap();
        let removed = remove_stale_outputs(&output).unwrap();
        assert_eq!(removed, vec![sidecar_path(&output)]);
        assert!(!sidecar_path(&output).exists());
    }

    #[test]
    fn test_metadata_records_labels_and_source() {
        let json = serde_json::to_value(ExportMetadata::new(&WeightSource::Random { seed: Some(1) })).unwrap();
        assert_eq!(json["architecture"], "DigitRecognitionCNN");
        assert_eq!(json["labels"].as_array().unwrap().len(), 10);
        assert_eq!(json["weights"], "random (seed 1)");
        assert_eq!(json["trained"], false);
    }
}
