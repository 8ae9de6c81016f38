use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use crate::{onnx, Error};
use crate::onnx::TensorProto;
use crate::tensor::{ParameterTensor, Tensor, TensorData};

/// Tensors smaller than this stay inline even when writing to an external file.
const EXTERNAL_DATA_SIZE_THRESHOLD: usize = 1024;

/// Named parameter tensors in load order, keyed the way PyTorch names them (`conv1.weight`).
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    entries: Vec<(String, TensorData)>
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any existing entry of the same name.
    pub fn insert(&mut self, name: String, data: TensorData) {
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = data;
        } else {
            self.entries.push((name, data));
        }
    }

    pub fn get(&self, name: &str) -> Option<&TensorData> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    pub fn remove(&mut self, name: &str) -> Option<TensorData> {
        let index = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorData)> {
        self.entries.iter().map(|(n, d)| (n.as_str(), d))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, TensorData)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, TensorData)>>(iter: I) -> Self {
        let mut out = Self::new();
        for (name, data) in iter {
            out.insert(name, data);
        }
        out
    }
}

pub trait WeightManager {
    fn prefix(&self, name: &str) -> Self;
    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error>;
    fn get_prefix(&self) -> Option<&str>;
}

/// Hands out state dict entries as graph parameters, scoped by a dotted module prefix.
pub struct StateDictWeightManager {
    prefix: Option<String>,
    state_dict: Arc<StateDict>
}

impl StateDictWeightManager {
    pub fn new(state_dict: Arc<StateDict>) -> Self {
        Self {
            prefix: None,
            state_dict
        }
    }

    fn full_name(&self, name: &str) -> String {
        if let Some(prefix) = &self.prefix {
            format!("{}.{}", prefix, name)
        } else {
            name.to_string()
        }
    }
}

impl WeightManager for StateDictWeightManager {
    fn prefix(&self, name: &str) -> Self {
        Self {
            prefix: Some(self.full_name(name)),
            state_dict: self.state_dict.clone()
        }
    }

    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error> {
        let name = self.full_name(name);
        let data = self.state_dict.get(&name).ok_or_else(|| Error::NoSuchTensorError(name.clone()))?;
        Ok(ParameterTensor::new(name, data.clone()))
    }

    fn get_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }
}

/// Decides where initializer bytes end up when the model is serialized.
pub trait WeightOutputManager {
    fn write_initializer(&mut self, name: String, data: &TensorData) -> Result<TensorProto, Error>;
    fn finalize(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Default)]
pub struct EmbeddedOutputManager {}

impl EmbeddedOutputManager {
    pub fn new() -> Self {
        Self {}
    }
}

impl WeightOutputManager for EmbeddedOutputManager {
    fn write_initializer(&mut self, name: String, data: &TensorData) -> Result<TensorProto, Error> {
        data.to_tensor_data_proto(Some(name))
    }
}

/// Appends initializer bytes to a sidecar file next to the model and references them by offset.
pub struct BinOutputManager {
    output: BufWriter<File>,
    location: String,
    offset: usize
}

impl BinOutputManager {
    pub fn new(output_location: &Path) -> Result<Self, Error> {
        let location = output_location.file_name()
            .and_then(|x| x.to_str())
            .ok_or_else(|| Error::InvalidPathError(output_location.to_path_buf()))?
            .to_string();
        let output = BufWriter::new(File::create(output_location)?);
        Ok(Self {
            output,
            location,
            offset: 0
        })
    }
}

impl WeightOutputManager for BinOutputManager {
    fn write_initializer(&mut self, name: String, data: &TensorData) -> Result<TensorProto, Error> {
        let raw = data.to_raw_encoding();
        if raw.len() < EXTERNAL_DATA_SIZE_THRESHOLD {
            return data.to_tensor_data_proto(Some(name));
        }
        self.output.write_all(&raw)?;
        let byte_offset = self.offset;
        self.offset += raw.len();
        log::debug!("External initializer {name}: offset {byte_offset}, length {}", raw.len());
        Ok(TensorProto {
            name,
            data_type: onnx::tensor_proto::DataType::from(data.dtype()) as i32,
            dims: data.shape().resolve()?.iter().map(|x| *x as i64).collect(),
            data_location: onnx::tensor_proto::DataLocation::External as i32,
            external_data: vec![
                onnx::StringStringEntryProto {
                    key: "location".to_string(),
                    value: self.location.clone(),
                },
                onnx::StringStringEntryProto {
                    key: "offset".to_string(),
                    value: format!("{byte_offset}"),
                },
                onnx::StringStringEntryProto {
                    key: "length".to_string(),
                    value: format!("{}", raw.len()),
                }
            ],
            .. Default::default()
        })
    }

    fn finalize(&mut self) -> Result<(), Error> {
        self.output.flush()?;
        Ok(())
    }
}
