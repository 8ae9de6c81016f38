use std::path::Path;
use onnx_graph::checker::{check_model_path, CheckerError};
use onnx_graph::onnx;
use onnx_graph::onnx::tensor_shape_proto::dimension::Value as DimValue;
use crate::architecture::{IMAGE_SIZE, INPUT_NAME, NUM_CLASSES, OUTPUT_NAME};
use crate::export::sidecar_path;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Exported model failed validation: {0}")]
    CheckerError(#[from] CheckerError),
    #[error("Exported model has an unexpected signature: {0}")]
    SignatureError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationReport {
    pub size_bytes: u64,
    pub sidecar_present: bool,
}

impl VerificationReport {
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Reports size and sidecar state, then reloads and validates the exported file.
pub fn verify_export(output: &Path) -> Result<VerificationReport, VerifyError> {
    let size_bytes = std::fs::metadata(output)?.len();
    let sidecar = sidecar_path(output);
    let report = VerificationReport { size_bytes, sidecar_present: sidecar.exists() };
    println!("📦 Taille: {:.2} MB", report.size_mb());

    if report.sidecar_present {
        println!("⚠️  Fichier {} détecté (peut poser problème sur le web)", sidecar.display());
        println!("   Le modèle est trop grand, les poids sont dans un fichier séparé.");
    } else {
        println!("✅ Pas de fichier .data externe - parfait pour le web!");
    }

    println!("🔍 Vérification du modèle ONNX...");
    let model = check_model_path(output)?;
    check_signature(&model)?;
    println!("✅ Modèle vérifié avec succès!");
    Ok(report)
}

fn dims(value_info: &onnx::ValueInfoProto) -> Option<&[onnx::tensor_shape_proto::Dimension]> {
    let onnx::type_proto::Value::TensorType(tensor) = value_info.r#type.as_ref()?.value.as_ref()?;
    Some(tensor.shape.as_ref()?.dim.as_slice())
}

fn check_value_info(value_info: &onnx::ValueInfoProto, name: &str, trailing: &[usize]) -> Result<(), VerifyError> {
    let mismatch = |reason: &str| VerifyError::SignatureError(format!("{name}: {reason}"));
    if value_info.name != name {
        return Err(VerifyError::SignatureError(format!("expected {name}, found {}", value_info.name)));
    }
    let dims = dims(value_info).ok_or_else(|| mismatch("not a tensor with a shape"))?;
    let Some((leading, rest)) = dims.split_first() else {
        return Err(mismatch("scalar"));
    };
    if !matches!(&leading.value, Some(DimValue::DimParam(p)) if !p.is_empty()) {
        return Err(mismatch("leading dimension is not symbolic"));
    }
    let rest = rest.iter()
        .map(|d| match d.value {
            Some(DimValue::DimValue(v)) => usize::try_from(v).ok(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>();
    if rest.as_deref() != Some(trailing) {
        return Err(mismatch(&format!("trailing dimensions are not {trailing:?}")));
    }
    Ok(())
}

/// One symbolic-batch `input` of `[1, 28, 28]` images, one `output` of 10 logits.
pub fn check_signature(model: &onnx::ModelProto) -> Result<(), VerifyError> {
    let graph = model.graph.as_ref().ok_or_else(|| VerifyError::SignatureError("no graph".to_string()))?;
    let [input] = graph.input.as_slice() else {
        return Err(VerifyError::SignatureError(format!("{} graph inputs", graph.input.len())));
    };
    let [output] = graph.output.as_slice() else {
        return Err(VerifyError::SignatureError(format!("{} graph outputs", graph.output.len())));
    };
    check_value_info(input, INPUT_NAME, &[1, IMAGE_SIZE, IMAGE_SIZE])?;
    check_value_info(output, OUTPUT_NAME, &[NUM_CLASSES])
}

pub fn print_instructions() {
    let rule = "=".repeat(60);
    println!("\n{rule}");
    println!("🎉 SUCCÈS! Le modèle est prêt pour le web!");
    println!("{rule}");
    println!("\nInstructions:");
    println!("1. Assurez-vous que le serveur HTTP est lancé:");
    println!("   python3 -m http.server 8000");
    println!("2. Ouvrez: http://localhost:8000");
    println!("3. Dessinez un chiffre et testez!");
    println!("{rule}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use onnx_graph::onnx::{GraphProto, ModelProto, TensorShapeProto, TypeProto, ValueInfoProto};

    fn value_info(name: &str, dims: Vec<DimValue>) -> ValueInfoProto {
        ValueInfoProto {
            name: name.to_string(),
            r#type: Some(TypeProto {
                value: Some(onnx::type_proto::Value::TensorType(onnx::type_proto::Tensor {
                    elem_type: onnx::tensor_proto::DataType::Float as i32,
                    shape: Some(TensorShapeProto {
                        dim: dims.into_iter().map(|v| onnx::tensor_shape_proto::Dimension { value: Some(v), denotation: String::new() }).collect()
                    }),
                })),
                denotation: String::new(),
            }),
            ..Default::default()
        }
    }

    fn model(input: ValueInfoProto, output: ValueInfoProto) -> ModelProto {
        ModelProto {
            graph: Some(GraphProto { input: vec![input], output: vec![output], ..Default::default() }),
            ..Default::default()
        }
    }

    fn batch() -> DimValue {
        DimValue::DimParam("batch_size".to_string())
    }

    #[test]
    fn test_expected_signature_passes() {
        let m = model(
            value_info("input", vec![batch(), DimValue::DimValue(1), DimValue::DimValue(28), DimValue::DimValue(28)]),
            value_info("output", vec![batch(), DimValue::DimValue(10)]),
        );
        check_signature(&m).unwrap();
    }

    #[test]
    fn test_fixed_batch_is_rejected() {
        let m = model(
            value_info("input", vec![DimValue::DimValue(1), DimValue::DimValue(1), DimValue::DimValue(28), DimValue::DimValue(28)]),
            value_info("output", vec![batch(), DimValue::DimValue(10)]),
        );
        assert!(matches!(check_signature(&m), Err(VerifyError::SignatureError(_))));
    }

    #[test]
    fn test_wrong_output_width_is_rejected() {
        let m = model(
            value_info("input", vec![batch(), DimValue::DimValue(1), DimValue::DimValue(28), DimValue::DimValue(28)]),
            value_info("output", vec![batch(), DimValue::DimValue(9)]),
        );
        assert!(matches!(check_signature(&m), Err(VerifyError::SignatureError(_))));
    }

    #[test]
    fn test_size_is_reported_in_mebibytes() {
        let report = VerificationReport { size_bytes: 3 * 512 * 1024, sidecar_present: false };
        assert_eq!(format!("{:.2}", report.size_mb()), "1.50");
    }
}
