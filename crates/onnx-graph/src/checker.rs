//! Structural validation of serialized models, covering the checks `onnx.checker` applies to
//! dense inference graphs: naming, topological order, operator arity, initializer payloads
//! and value info.

use std::collections::HashSet;
use std::path::{Component, Path};
use crate::onnx;
use crate::onnx::tensor_proto::{DataLocation, DataType};
use crate::onnx::tensor_shape_proto::dimension::Value as DimValue;

#[derive(Debug, thiserror::Error)]
pub enum CheckerError {
    #[error("Cannot load model: {0}")]
    LoadError(#[from] crate::Error),
    #[error("Model ir_version is not set")]
    MissingIrVersionError,
    #[error("Model does not import the default operator set")]
    MissingDefaultOpsetError,
    #[error("Model has no graph")]
    MissingGraphError,
    #[error("Graph name is empty")]
    EmptyGraphNameError,
    #[error("Name {0} is defined more than once")]
    DuplicateNameError(String),
    #[error("Node {node} reads {input}, which is not defined before it")]
    UndefinedInputError { node: String, input: String },
    #[error("Graph output {0} is not produced by any node, input or initializer")]
    UnproducedOutputError(String),
    #[error("Node {node} has unknown operator type {op_type}")]
    UnknownOperatorError { node: String, op_type: String },
    #[error("Node {node} ({op_type}) has {count} inputs")]
    InputCountError { node: String, op_type: String, count: usize },
    #[error("Node {node} is missing required attribute {attribute}")]
    MissingAttributeError { node: String, attribute: String },
    #[error("Initializer {name} is invalid: {reason}")]
    InvalidInitializerError { name: String, reason: String },
    #[error("Value info {name} is invalid: {reason}")]
    InvalidValueInfoError { name: String, reason: String },
}

struct OperatorSchema {
    op_type: &'static str,
    min_inputs: usize,
    max_inputs: usize,
    required_attributes: &'static [&'static str],
}

const fn schema(op_type: &'static str, min_inputs: usize, max_inputs: usize, required_attributes: &'static [&'static str]) -> OperatorSchema {
    OperatorSchema { op_type, min_inputs, max_inputs, required_attributes }
}

const OPERATOR_SCHEMAS: &[OperatorSchema] = &[
    schema("Add", 2, 2, &[]),
    schema("AveragePool", 1, 1, &["kernel_shape"]),
    schema("BatchNormalization", 5, 5, &[]),
    schema("Cast", 1, 1, &["to"]),
    schema("Concat", 1, usize::MAX, &["axis"]),
    schema("Constant", 0, 0, &[]),
    schema("Conv", 2, 3, &[]),
    schema("Div", 2, 2, &[]),
    schema("Dropout", 1, 3, &[]),
    schema("Flatten", 1, 1, &[]),
    schema("Gemm", 2, 3, &[]),
    schema("GlobalAveragePool", 1, 1, &[]),
    schema("Identity", 1, 1, &[]),
    schema("LogSoftmax", 1, 1, &[]),
    schema("MatMul", 2, 2, &[]),
    schema("MaxPool", 1, 1, &["kernel_shape"]),
    schema("Mul", 2, 2, &[]),
    schema("Relu", 1, 1, &[]),
    schema("Reshape", 2, 2, &[]),
    schema("Sigmoid", 1, 1, &[]),
    schema("Softmax", 1, 1, &[]),
    schema("Squeeze", 1, 2, &[]),
    schema("Sub", 2, 2, &[]),
    schema("Tanh", 1, 1, &[]),
    schema("Transpose", 1, 1, &[]),
    schema("Unsqueeze", 2, 2, &[]),
];

/// Attributes of which a `Constant` node carries exactly one.
const CONSTANT_VALUE_ATTRIBUTES: &[&str] = &[
    "value", "value_float", "value_floats", "value_int", "value_ints", "value_string", "value_strings", "sparse_value"
];

/// Loads a model file and checks it; external data is resolved next to the file.
pub fn check_model_path(path: &Path) -> Result<onnx::ModelProto, CheckerError> {
    let model = crate::read_model(path)?;
    check_model(&model, path.parent())?;
    Ok(model)
}

/// `base_dir` is where external data locations are resolved; `None` skips the file existence check.
pub fn check_model(model: &onnx::ModelProto, base_dir: Option<&Path>) -> Result<(), CheckerError> {
    if model.ir_version <= 0 {
        return Err(CheckerError::MissingIrVersionError);
    }
    if !model.opset_import.iter().any(|o| o.domain.is_empty() || o.domain == "ai.onnx") {
        return Err(CheckerError::MissingDefaultOpsetError);
    }
    let graph = model.graph.as_ref().ok_or(CheckerError::MissingGraphError)?;
    check_graph(graph, base_dir)
}

fn check_graph(graph: &onnx::GraphProto, base_dir: Option<&Path>) -> Result<(), CheckerError> {
    if graph.name.is_empty() {
        return Err(CheckerError::EmptyGraphNameError);
    }

    let mut defined: HashSet<&str> = HashSet::new();
    for input in &graph.input {
        check_value_info(input)?;
        if !defined.insert(input.name.as_str()) {
            return Err(CheckerError::DuplicateNameError(input.name.clone()));
        }
    }
    let mut initializer_names: HashSet<&str> = HashSet::new();
    for initializer in &graph.initializer {
        check_initializer(initializer, base_dir)?;
        if !initializer_names.insert(initializer.name.as_str()) {
            return Err(CheckerError::DuplicateNameError(initializer.name.clone()));
        }
        // An initializer may shadow a graph input as its default value.
        defined.insert(initializer.name.as_str());
    }

    for (index, node) in graph.node.iter().enumerate() {
        let node_label = if node.name.is_empty() { format!("#{index}") } else { node.name.clone() };
        check_node(node, &node_label)?;
        for input in &node.input {
            if !input.is_empty() && !defined.contains(input.as_str()) {
                return Err(CheckerError::UndefinedInputError { node: node_label, input: input.clone() });
            }
        }
        for output in &node.output {
            if output.is_empty() {
                continue;
            }
            if !defined.insert(output.as_str()) {
                return Err(CheckerError::DuplicateNameError(output.clone()));
            }
        }
    }

    for output in &graph.output {
        check_value_info(output)?;
        if !defined.contains(output.name.as_str()) {
            return Err(CheckerError::UnproducedOutputError(output.name.clone()));
        }
    }
    Ok(())
}

fn check_node(node: &onnx::NodeProto, node_label: &str) -> Result<(), CheckerError> {
    if !(node.domain.is_empty() || node.domain == "ai.onnx") {
        return Err(CheckerError::UnknownOperatorError { node: node_label.to_string(), op_type: format!("{}::{}", node.domain, node.op_type) });
    }
    let schema = OPERATOR_SCHEMAS.iter()
        .find(|s| s.op_type == node.op_type)
        .ok_or_else(|| CheckerError::UnknownOperatorError { node: node_label.to_string(), op_type: node.op_type.clone() })?;

    let count = node.input.len();
    if count < schema.min_inputs || count > schema.max_inputs {
        return Err(CheckerError::InputCountError { node: node_label.to_string(), op_type: node.op_type.clone(), count });
    }
    for attribute in schema.required_attributes {
        if !node.attribute.iter().any(|a| a.name == *attribute) {
            return Err(CheckerError::MissingAttributeError { node: node_label.to_string(), attribute: attribute.to_string() });
        }
    }
    if node.op_type == "Constant" {
        let values = node.attribute.iter().filter(|a| CONSTANT_VALUE_ATTRIBUTES.contains(&a.name.as_str())).count();
        if values != 1 {
            return Err(CheckerError::MissingAttributeError { node: node_label.to_string(), attribute: "value".to_string() });
        }
    }
    Ok(())
}

/// Bytes per element for types stored in `raw_data`; `None` for variable-size types.
fn element_size(data_type: DataType) -> Option<usize> {
    match data_type {
        DataType::Float | DataType::Int32 | DataType::Uint32 => Some(4),
        DataType::Double | DataType::Int64 | DataType::Uint64 | DataType::Complex64 => Some(8),
        DataType::Float16 | DataType::Bfloat16 | DataType::Int16 | DataType::Uint16 => Some(2),
        DataType::Int8 | DataType::Uint8 | DataType::Bool
        | DataType::Float8e4m3fn | DataType::Float8e4m3fnuz | DataType::Float8e5m2 | DataType::Float8e5m2fnuz => Some(1),
        DataType::Complex128 => Some(16),
        _ => None,
    }
}

fn typed_field_len(tensor: &onnx::TensorProto, data_type: DataType) -> usize {
    match data_type {
        DataType::Float | DataType::Complex64 => tensor.float_data.len(),
        DataType::Double | DataType::Complex128 => tensor.double_data.len(),
        DataType::Int64 => tensor.int64_data.len(),
        DataType::Uint32 | DataType::Uint64 => tensor.uint64_data.len(),
        DataType::String => tensor.string_data.len(),
        _ => tensor.int32_data.len(),
    }
}

fn check_initializer(tensor: &onnx::TensorProto, base_dir: Option<&Path>) -> Result<(), CheckerError> {
    let invalid = |reason: String| CheckerError::InvalidInitializerError { name: tensor.name.clone(), reason };
    if tensor.name.is_empty() {
        return Err(invalid("empty name".to_string()));
    }
    let data_type = match DataType::try_from(tensor.data_type) {
        Ok(DataType::Undefined) | Err(_) => return Err(invalid(format!("undefined data type {}", tensor.data_type))),
        Ok(data_type) => data_type,
    };
    let mut num_elements = 1usize;
    for dim in &tensor.dims {
        let dim = usize::try_from(*dim).map_err(|_| invalid(format!("negative dimension {dim}")))?;
        num_elements *= dim;
    }

    if tensor.data_location == DataLocation::External as i32 {
        return check_external_data(tensor, base_dir).map_err(invalid);
    }

    if !tensor.raw_data.is_empty() {
        let Some(size) = element_size(data_type) else {
            return Err(invalid(format!("{} cannot be stored in raw_data", data_type.as_str_name())));
        };
        if tensor.raw_data.len() != num_elements * size {
            return Err(invalid(format!("raw_data holds {} bytes, expected {}", tensor.raw_data.len(), num_elements * size)));
        }
    } else {
        let mut len = typed_field_len(tensor, data_type);
        if matches!(data_type, DataType::Complex64 | DataType::Complex128) {
            len /= 2;
        }
        if len != num_elements {
            return Err(invalid(format!("holds {len} elements, expected {num_elements}")));
        }
    }
    Ok(())
}

fn check_external_data(tensor: &onnx::TensorProto, base_dir: Option<&Path>) -> Result<(), String> {
    let entry = |key: &str| tensor.external_data.iter().find(|e| e.key == key).map(|e| e.value.as_str());
    let location = entry("location").ok_or("external data has no location")?;
    let location_path = Path::new(location);
    if location_path.is_absolute() || location_path.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(format!("external data location {location} must be a relative path inside the model directory"));
    }
    let parse = |key: &str| -> Result<Option<u64>, String> {
        entry(key).map(|v| v.parse::<u64>().map_err(|_| format!("invalid external data {key} {v}"))).transpose()
    };
    let offset = parse("offset")?.unwrap_or(0);
    let length = parse("length")?;
    if let Some(base_dir) = base_dir {
        let path = base_dir.join(location_path);
        let file_len = std::fs::metadata(&path)
            .map_err(|_| format!("external data file {} does not exist", path.display()))?
            .len();
        if let Some(length) = length {
            if offset + length > file_len {
                return Err(format!("external data range {offset}+{length} exceeds file size {file_len}"));
            }
        }
    }
    Ok(())
}

fn check_value_info(value_info: &onnx::ValueInfoProto) -> Result<(), CheckerError> {
    let invalid = |reason: &str| CheckerError::InvalidValueInfoError { name: value_info.name.clone(), reason: reason.to_string() };
    if value_info.name.is_empty() {
        return Err(invalid("empty name"));
    }
    let Some(onnx::type_proto::Value::TensorType(tensor_type)) = value_info.r#type.as_ref().and_then(|t| t.value.as_ref()) else {
        return Err(invalid("not a tensor type"));
    };
    if tensor_type.elem_type == DataType::Undefined as i32 || DataType::try_from(tensor_type.elem_type).is_err() {
        return Err(invalid("undefined element type"));
    }
    let shape = tensor_type.shape.as_ref().ok_or_else(|| invalid("missing shape"))?;
    for dim in &shape.dim {
        match &dim.value {
            Some(DimValue::DimValue(v)) if *v > 0 => {}
            Some(DimValue::DimParam(p)) if !p.is_empty() => {}
            _ => return Err(invalid("dimension is neither a positive value nor a named parameter")),
        }
    }
    Ok(())
}
