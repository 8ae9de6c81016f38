pub mod operators;
pub mod weights;
pub mod tensor;
mod node;
pub mod pytorch;
pub mod pth;
pub mod checker;

#[allow(clippy::all)]
pub mod onnx;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use prost::Message;
use tensor::*;
use node::*;
use crate::weights::{BinOutputManager, EmbeddedOutputManager, WeightOutputManager};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Input shapes are incompatible")]
    InputShapeError,
    #[error("Input dtypes do not match")]
    DTypeMismatchError,
    #[error("Invalid input")]
    InvalidInputError,
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Unsupported dtype")]
    UnsupportedDTypeError,
    #[error("Tensor name {0} is used more than once")]
    NameConflictError(String),
    #[error("No such tensor: {0}")]
    NoSuchTensorError(String),
    #[error("Dimension cannot be resolved")]
    UnresolvedDimensionError,
    #[error("Invalid dtype for this operation")]
    InvalidDTypeError,
    #[error("Tensor data cannot be resolved")]
    CannotResolveDataError,
    #[error("Candle error: {0}")]
    CandleCoreError(#[from] candle_core::Error),
    #[error("Tensor {0} is used by the graph but is not a registered input")]
    UnregisteredInputError(String),
    #[error("Unsupported opset version {0}")]
    UnsupportedOpsetError(i64),
    #[error("Invalid path {0}")]
    InvalidPathError(PathBuf),
    #[error("Cannot decode model: {0}")]
    DecodeError(#[from] prost::DecodeError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WeightStorageStrategy {
    EmbeddedData,
    /// Initializer bytes go to this file, referenced from the model by relative location.
    BinFile(PathBuf),
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub opset_version: i64,
    pub fold_constants: bool,
    pub graph_name: String,
    pub producer_name: String,
    pub producer_version: String,
    pub metadata: Vec<(String, String)>,
    pub weight_storage: WeightStorageStrategy,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            opset_version: 18,
            fold_constants: true,
            graph_name: "main_graph".to_string(),
            producer_name: env!("CARGO_PKG_NAME").to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            metadata: vec![],
            weight_storage: WeightStorageStrategy::EmbeddedData,
        }
    }
}

/// Oldest IR version that can carry the given default-domain opset.
pub fn ir_version_for_opset(opset_version: i64) -> Result<i64, Error> {
    let version = match opset_version {
        13 | 14 => onnx::Version::IrVersion202058,
        15..=18 => onnx::Version::IrVersion2021730,
        19 | 20 => onnx::Version::IrVersion202355,
        21 => onnx::Version::IrVersion2024325,
        other => Err(Error::UnsupportedOpsetError(other))?
    };
    Ok(version as i64)
}

fn is_foldable(tensor: &dyn Tensor) -> bool {
    !tensor.is_input() && tensor.resolve_data().is_some()
}

/// Post-order walk, so every tensor comes after the tensors its producer reads.
fn visit_tensor<'a>(tensor: &'a dyn Tensor, fold_constants: bool, visited: &mut HashSet<&'a dyn Tensor>, constants: &mut HashSet<&'a dyn Tensor>, order: &mut Vec<&'a dyn Tensor>) {
    if !visited.insert(tensor) {
        return;
    }
    match tensor.get_producer() {
        Some(_) if fold_constants && is_foldable(tensor) => {
            constants.insert(tensor);
        }
        Some(node) => {
            for input in node.get_input_tensors() {
                visit_tensor(input, fold_constants, visited, constants, order);
            }
        }
        None => {
            if !tensor.is_input() {
                constants.insert(tensor);
            }
        }
    }
    order.push(tensor);
}

pub fn build_proto(
    inputs: &[Arc<InputTensor>],
    outputs: &[(&str, Arc<dyn Tensor>)],
    options: &BuildOptions,
) -> Result<onnx::ModelProto, Error> {
    let ir_version = ir_version_for_opset(options.opset_version)?;

    // Get all tensors in graph, in dependency order
    let mut visited = HashSet::new();
    let mut constants = HashSet::new();
    let mut order = vec![];
    for (_, tensor) in outputs {
        visit_tensor(tensor.as_ref(), options.fold_constants, &mut visited, &mut constants, &mut order);
    }

    // Assign output names, then requested names
    let mut chosen_names: HashSet<String> = HashSet::new();
    let mut tensor_names: HashMap<&dyn Tensor, String> = HashMap::new();
    for (name, tensor) in outputs {
        if !chosen_names.insert(name.to_string()) {
            return Err(Error::NameConflictError(name.to_string()));
        }
        tensor_names.insert(tensor.as_ref(), name.to_string());
    }
    for input in inputs {
        let name = input.get_name().unwrap_or_default().to_string();
        if !chosen_names.insert(name.clone()) {
            return Err(Error::NameConflictError(name));
        }
        tensor_names.insert(input.as_ref() as &dyn Tensor, name);
    }
    for tensor in &order {
        if tensor_names.contains_key(tensor) {
            continue;
        }
        if tensor.is_input() {
            return Err(Error::UnregisteredInputError(tensor.get_name().unwrap_or("?").to_string()));
        }
        if let Some(name) = tensor.get_name() {
            if !chosen_names.insert(name.to_string()) {
                return Err(Error::NameConflictError(name.to_string()));
            }
            tensor_names.insert(*tensor, name.to_string());
        }
    }
    // Assign remaining names
    let mut next_tensor_id = 0;
    for tensor in &order {
        if !tensor_names.contains_key(tensor) {
            let name = loop {
                let name = format!("tensor_{}", next_tensor_id);
                next_tensor_id += 1;
                if !chosen_names.contains(&name) {
                    break name;
                }
            };
            chosen_names.insert(name.clone());
            tensor_names.insert(*tensor, name);
        }
    }

    let mut data_manager: Box<dyn WeightOutputManager> = match &options.weight_storage {
        WeightStorageStrategy::EmbeddedData => Box::new(EmbeddedOutputManager::new()),
        WeightStorageStrategy::BinFile(path) => Box::new(BinOutputManager::new(path)?),
    };

    let output_tensors: HashSet<&dyn Tensor> = outputs.iter().map(|(_, t)| t.as_ref()).collect();
    let mut initializers = vec![];
    let mut nodes = vec![];
    let mut value_info = vec![];
    let mut emitted_nodes: HashSet<&dyn Node> = HashSet::new();
    let mut node_names: HashSet<String> = HashSet::new();
    for tensor in &order {
        let name = tensor_names[tensor].clone();
        if tensor.is_input() {
            continue;
        }
        if constants.contains(tensor) {
            let data = tensor.resolve_data().ok_or(Error::CannotResolveDataError)?;
            initializers.push(data_manager.write_initializer(name, &data)?);
            continue;
        }
        let Some(node) = tensor.get_producer() else {
            continue;
        };
        if emitted_nodes.insert(node) {
            let node_name = node.get_name().map(|base| {
                let mut candidate = base.to_string();
                let mut suffix = 1;
                while node_names.contains(&candidate) {
                    candidate = format!("{base}_{suffix}");
                    suffix += 1;
                }
                candidate
            });
            if let Some(node_name) = &node_name {
                node_names.insert(node_name.clone());
            }
            nodes.push(node.to_node_proto(node_name, &tensor_names)?);
        }
        if !output_tensors.contains(tensor) {
            value_info.push(tensor.to_value_info_proto(name));
        }
    }
    data_manager.finalize()?;
    log::debug!("Built graph with {} nodes and {} initializers", nodes.len(), initializers.len());

    let graph = onnx::GraphProto {
        name: options.graph_name.clone(),
        node: nodes,
        initializer: initializers,
        doc_string: String::new(),
        input: inputs.iter().map(|tensor| tensor.to_value_info_proto(tensor_names[&(tensor.as_ref() as &dyn Tensor)].clone())).collect(),
        output: outputs.iter().map(|(name, tensor)| tensor.to_value_info_proto(name.to_string())).collect(),
        value_info,
        metadata_props: vec![],
    };

    Ok(onnx::ModelProto {
        ir_version,
        opset_import: vec![onnx::OperatorSetIdProto {
            domain: String::new(),
            version: options.opset_version,
        }],
        producer_name: options.producer_name.clone(),
        producer_version: options.producer_version.clone(),
        domain: String::new(),
        model_version: 0,
        doc_string: String::new(),
        graph: Some(graph),
        metadata_props: options.metadata.iter().map(|(key, value)| onnx::StringStringEntryProto {
            key: key.clone(),
            value: value.clone(),
        }).collect(),
    })
}

pub fn write_model(model: &onnx::ModelProto, path: &Path) -> Result<(), Error> {
    std::fs::write(path, model.encode_to_vec())?;
    Ok(())
}

pub fn read_model(path: &Path) -> Result<onnx::ModelProto, Error> {
    let bytes = std::fs::read(path)?;
    Ok(onnx::ModelProto::decode(bytes.as_slice())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{Constant, Gemm, Relu, Reshape};

    fn param(name: &str, dims: &[usize], value: f32) -> Arc<ParameterTensor> {
        ParameterTensor::new(name.to_string(), TensorData::fill(Shape::from(dims.to_vec()), value).unwrap())
    }

    fn small_graph() -> (Arc<InputTensor>, Arc<dyn Tensor>) {
        let input = InputTensor::new(
            "input".to_string(),
            DType::F32,
            Shape::new(vec![Dimension::symbolic("batch_size"), Dimension::new(Some(2), None, None), Dimension::new(Some(2), None, None)])
        );
        let target = TensorData::new(TensorDataValue::I64(vec![-1, 4]), Shape::from(vec![2usize])).unwrap();
        let flat = Reshape::new(Some("flatten".to_string()), input.clone(), Constant::new(None, target)).unwrap();
        let fc = Gemm::new(Some("fc".to_string()), flat, param("fc.weight", &[3, 4], 0.5), Some(param("fc.bias", &[3], 1.0)), false, true, 1.0, 1.0).unwrap();
        let out = Relu::new(Some("relu".to_string()), fc).unwrap();
        (input, out)
    }

    #[test]
    fn test_build_proto_is_topologically_ordered() {
        let (input, output) = small_graph();
        let model = build_proto(&[input], &[("output", output)], &BuildOptions::default()).unwrap();
        let graph = model.graph.unwrap();
        let op_types: Vec<_> = graph.node.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(op_types, vec!["Reshape", "Gemm", "Relu"]);
        assert_eq!(graph.node[2].output, vec!["output".to_string()]);
        assert_eq!(graph.node[1].input[1], "fc.weight");
        assert_eq!(graph.name, "main_graph");
        assert_eq!(model.ir_version, 8);
        assert_eq!(model.opset_import[0].version, 18);
    }

    #[test]
    fn test_constant_folding_turns_constant_into_initializer() {
        let (input, output) = small_graph();
        let model = build_proto(&[input], &[("output", output)], &BuildOptions::default()).unwrap();
        let graph = model.graph.unwrap();
        assert!(graph.node.iter().all(|n| n.op_type != "Constant"));
        let shape_name = &graph.node[0].input[1];
        let shape_init = graph.initializer.iter().find(|i| &i.name == shape_name).unwrap();
        assert_eq!(TensorData::from_tensor_proto(shape_init).unwrap().to_int_vec().unwrap(), vec![-1, 4]);
    }

    #[test]
    fn test_constant_node_kept_without_folding() {
        let (input, output) = small_graph();
        let options = BuildOptions { fold_constants: false, ..Default::default() };
        let model = build_proto(&[input], &[("output", output)], &options).unwrap();
        let graph = model.graph.unwrap();
        assert_eq!(graph.node[0].op_type, "Constant");
        assert_eq!(graph.initializer.len(), 2);
    }

    #[test]
    fn test_unregistered_input_is_rejected() {
        let (_, output) = small_graph();
        let res = build_proto(&[], &[("output", output)], &BuildOptions::default());
        assert!(matches!(res, Err(Error::UnregisteredInputError(name)) if name == "input"));
    }

    #[test]
    fn test_unsupported_opset_is_rejected() {
        assert_eq!(ir_version_for_opset(17).unwrap(), 8);
        assert_eq!(ir_version_for_opset(21).unwrap(), 10);
        assert!(matches!(ir_version_for_opset(7), Err(Error::UnsupportedOpsetError(7))));
    }

    #[test]
    fn test_model_file_round_trip() {
        let (input, output) = small_graph();
        let options = BuildOptions { metadata: vec![("key".to_string(), "value".to_string())], ..Default::default() };
        let model = build_proto(&[input], &[("output", output)], &options).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        write_model(&model, &path).unwrap();
        let reloaded = read_model(&path).unwrap();
        assert_eq!(reloaded, model);
        assert_eq!(reloaded.metadata_props[0].key, "key");
    }
}
