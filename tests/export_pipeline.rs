mod common;

use std::path::Path;
use std::sync::Once;
use digit_export::architecture::{parameter_specs, DigitRecognitionCnn, ParameterInit};
use digit_export::export::{sidecar_path, METADATA_KEY};
use digit_export::loader::LoadError;
use digit_export::prompt::FixedAnswer;
use digit_export::verify::check_signature;
use digit_export::{run, ExportConfig, RunError, RunOutcome};
use onnx_graph::checker::check_model_path;
use onnx_graph::onnx::tensor_shape_proto::dimension::Value as DimValue;
use onnx_graph::onnx::ModelProto;
use onnx_graph::pth::PthCheckpoint;
use onnx_graph::read_model;
use onnx_graph::tensor::{Shape, TensorData};
use rand::SeedableRng;
use rand::rngs::StdRng;

static INIT: Once = Once::new();

fn setup(dir: &Path) -> ExportConfig {
    INIT.call_once(|| {
        env_logger::init();
    });
    ExportConfig {
        full_model_path: dir.join("digit_model_full.pth"),
        state_dict_path: dir.join("digit_model.pth"),
        output_path: dir.join("model.onnx"),
        seed: Some(42),
        ..Default::default()
    }
}

fn trained_model(seed: u64) -> DigitRecognitionCnn {
    DigitRecognitionCnn::random(&mut StdRng::seed_from_u64(seed)).unwrap()
}

fn op_types(model: &ModelProto) -> Vec<String> {
    model.graph.as_ref().unwrap().node.iter().map(|n| n.op_type.clone()).collect()
}

fn initializer(model: &ModelProto, name: &str) -> Option<TensorData> {
    model.graph.as_ref().unwrap().initializer.iter()
        .find(|i| i.name == name)
        .map(|i| TensorData::from_tensor_proto(i).unwrap())
}

#[test]
fn test_full_model_checkpoint_exports_without_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path());
    let model = trained_model(1);
    common::write_full_model(&config.full_model_path, "DigitRecognitionCNN", model.state_dict()).unwrap();

    let mut answer = FixedAnswer::new("n");
    let outcome = run(&config, &mut answer).unwrap();
    let RunOutcome::Exported(report) = outcome else {
        panic!("export did not run");
    };
    assert_eq!(answer.times_asked(), 0);
    assert!(!report.sidecar_present);
    assert!(config.output_path.exists());
    assert!(!sidecar_path(&config.output_path).exists());
    assert_eq!(report.size_bytes, std::fs::metadata(&config.output_path).unwrap().len());
}

#[test]
fn test_full_model_checkpoint_is_flattened_to_dotted_names() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("digit_model_full.pth");
    let model = trained_model(2);
    common::write_full_model(&path, "DigitRecognitionCNN", model.state_dict()).unwrap();

    let checkpoint = PthCheckpoint::load(&path).unwrap();
    assert_eq!(checkpoint.module_class.as_deref(), Some("DigitRecognitionCNN"));
    assert_eq!(checkpoint.state_dict.len(), 25);
    for (name, data) in model.state_dict().iter() {
        assert_eq!(checkpoint.state_dict.get(name).unwrap().value(), data.value(), "{name}");
    }
}

#[test]
fn test_state_dict_weights_become_initializers() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path());
    let model = trained_model(3);
    common::write_state_dict(&config.state_dict_path, model.state_dict()).unwrap();

    let outcome = run(&config, &mut FixedAnswer::new("n")).unwrap();
    assert_eq!(outcome.exit_code(), 0);

    let exported = read_model(&config.output_path).unwrap();
    for spec in parameter_specs() {
        let exported_value = initializer(&exported, &spec.name);
        if spec.init == ParameterInit::BatchCounter {
            assert!(exported_value.is_none(), "{} should not be exported", spec.name);
            continue;
        }
        let expected = model.state_dict().get(&spec.name).unwrap();
        let exported_value = exported_value.unwrap_or_else(|| panic!("missing initializer {}", spec.name));
        assert_eq!(exported_value.shape().resolve().unwrap(), spec.shape);
        assert_eq!(exported_value.to_f32_vec().unwrap(), expected.to_f32_vec().unwrap());
    }
}

#[test]
fn test_declined_prompt_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path());

    let mut answer = FixedAnswer::new("n");
    let outcome = run(&config, &mut answer).unwrap();
    assert!(matches!(outcome, RunOutcome::Cancelled));
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(answer.times_asked(), 1);
    assert!(!config.output_path.exists());
}

#[test]
fn test_accepted_prompt_exports_random_weights() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path());

    let outcome = run(&config, &mut FixedAnswer::new(" O ")).unwrap();
    assert_eq!(outcome.exit_code(), 0);

    let exported = read_model(&config.output_path).unwrap();
    let metadata = exported.metadata_props.iter().find(|p| p.key == METADATA_KEY).unwrap();
    let metadata: serde_json::Value = serde_json::from_str(&metadata.value).unwrap();
    assert_eq!(metadata["trained"], false);
    assert_eq!(metadata["normalization"]["mean"].as_f64().unwrap() as f32, 0.1307);

    // Same seed, same weights.
    let expected = trained_model(42);
    let fc2 = initializer(&exported, "fc2.weight").unwrap();
    assert_eq!(fc2.value(), expected.state_dict().get("fc2.weight").unwrap().value());
}

#[test]
fn test_stale_outputs_are_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path());
    common::write_state_dict(&config.state_dict_path, trained_model(4).state_dict()).unwrap();
    std::fs::write(&config.output_path, b"stale model").unwrap();
    std::fs::write(sidecar_path(&config.output_path), b"stale weights").unwrap();

    run(&config, &mut FixedAnswer::new("n")).unwrap();
    assert!(!sidecar_path(&config.output_path).exists());
    check_model_path(&config.output_path).unwrap();
}

#[test]
fn test_exported_graph_has_dynamic_batch_signature() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path());
    common::write_state_dict(&config.state_dict_path, trained_model(5).state_dict()).unwrap();
    run(&config, &mut FixedAnswer::new("n")).unwrap();

    let exported = check_model_path(&config.output_path).unwrap();
    check_signature(&exported).unwrap();
    assert_eq!(exported.ir_version, 8);
    assert_eq!(exported.opset_import[0].version, 18);

    let graph = exported.graph.as_ref().unwrap();
    assert_eq!(graph.name, "main_graph");
    assert_eq!(graph.input.len(), 1);
    assert_eq!(graph.output.len(), 1);
    let onnx_graph::onnx::type_proto::Value::TensorType(output) = graph.output[0].r#type.as_ref().unwrap().value.as_ref().unwrap();
    let dims: Vec<_> = output.shape.as_ref().unwrap().dim.iter().map(|d| d.value.clone().unwrap()).collect();
    assert_eq!(dims, vec![DimValue::DimParam("batch_size".to_string()), DimValue::DimValue(10)]);
}

#[test]
fn test_constant_folding_removes_shape_constant() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = setup(dir.path());
    common::write_state_dict(&config.state_dict_path, trained_model(6).state_dict()).unwrap();

    run(&config, &mut FixedAnswer::new("n")).unwrap();
    let folded = op_types(&read_model(&config.output_path).unwrap());
    assert_eq!(folded, vec![
        "Conv", "BatchNormalization", "Relu", "MaxPool",
        "Conv", "BatchNormalization", "Relu", "MaxPool",
        "Conv", "BatchNormalization", "Relu", "MaxPool",
        "Reshape", "Gemm", "Relu", "Gemm",
    ]);

    config.fold_constants = false;
    run(&config, &mut FixedAnswer::new("n")).unwrap();
    let unfolded = op_types(&read_model(&config.output_path).unwrap());
    assert_eq!(unfolded.iter().filter(|op| *op == "Constant").count(), 1);
    check_model_path(&config.output_path).unwrap();
}

#[test]
fn test_external_data_sidecar_is_flagged() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = setup(dir.path());
    config.external_data = true;
    common::write_state_dict(&config.state_dict_path, trained_model(7).state_dict()).unwrap();

    let RunOutcome::Exported(report) = run(&config, &mut FixedAnswer::new("n")).unwrap() else {
        panic!("export did not run");
    };
    assert!(report.sidecar_present);
    assert!(sidecar_path(&config.output_path).exists());
    let embedded_size = {
        config.external_data = false;
        let RunOutcome::Exported(report) = run(&config, &mut FixedAnswer::new("n")).unwrap() else {
            panic!("export did not run");
        };
        report.size_bytes
    };
    assert!(embedded_size > 1024 * 1024);
}

#[test]
fn test_state_dict_with_wrong_shape_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path());
    let mut state_dict = trained_model(8).state_dict().clone();
    state_dict.insert("fc1.weight".to_string(), TensorData::fill(Shape::from(vec![256usize, 1024]), 0.0f32).unwrap());
    common::write_state_dict(&config.state_dict_path, &state_dict).unwrap();

    let res = run(&config, &mut FixedAnswer::yes());
    assert!(matches!(res, Err(RunError::LoadError(LoadError::MismatchError { .. }))));
    assert!(!config.output_path.exists());
}
