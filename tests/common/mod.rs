//! Writes PyTorch zip checkpoints (`torch.save` format, pickle protocol 2) for tests.
#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::Path;
use onnx_graph::tensor::{TensorData, TensorDataValue};
use onnx_graph::weights::StateDict;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

const BUFFER_NAMES: &[&str] = &["running_mean", "running_var", "num_batches_tracked"];

#[derive(Default)]
struct PickleWriter {
    bytes: Vec<u8>,
    storages: Vec<(String, Vec<u8>)>,
}

impl PickleWriter {
    fn op(&mut self, op: u8) {
        self.bytes.push(op);
    }

    fn proto(&mut self) {
        self.bytes.extend_from_slice(&[0x80, 2]);
    }

    fn global(&mut self, module: &str, name: &str) {
        self.op(b'c');
        self.bytes.extend_from_slice(module.as_bytes());
        self.bytes.push(b'\n');
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(b'\n');
    }

    fn unicode(&mut self, value: &str) {
        self.op(b'X');
        self.bytes.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(value.as_bytes());
    }

    fn int(&mut self, value: usize) {
        self.op(b'J');
        self.bytes.extend_from_slice(&(value as i32).to_le_bytes());
    }

    fn int_tuple(&mut self, values: &[usize]) {
        self.op(b'(');
        for v in values {
            self.int(*v);
        }
        self.op(b't');
    }

    fn ordered_dict(&mut self) {
        self.global("collections", "OrderedDict");
        self.op(b')');
        self.op(b'R');
    }

    fn tensor(&mut self, data: &TensorData) {
        let storage_class = match data.value() {
            TensorDataValue::F32(_) => "FloatStorage",
            TensorDataValue::F16(_) => "HalfStorage",
            TensorDataValue::BF16(_) => "BFloat16Storage",
            TensorDataValue::I64(_) => "LongStorage",
            TensorDataValue::I32(_) => panic!("torch has no IntStorage in this writer"),
        };
        let dims = data.shape().resolve().unwrap();
        let mut strides = vec![1usize; dims.len()];
        for i in (0..dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * dims[i + 1];
        }
        let key = self.storages.len().to_string();
        self.storages.push((key.clone(), data.value().get_raw_encoding()));

        self.global("torch._utils", "_rebuild_tensor_v2");
        self.op(b'(');
        // persistent id: ('storage', storage_type, key, location, numel)
        self.op(b'(');
        self.unicode("storage");
        self.global("torch", storage_class);
        self.unicode(&key);
        self.unicode("cpu");
        self.int(data.value().len());
        self.op(b't');
        self.op(b'Q');
        self.int(0);
        self.int_tuple(&dims);
        self.int_tuple(&strides);
        self.op(0x89);
        self.ordered_dict();
        self.op(b't');
        self.op(b'R');
    }

    fn parameter(&mut self, data: &TensorData) {
        self.global("torch._utils", "_rebuild_parameter");
        self.op(b'(');
        self.tensor(data);
        self.op(0x88);
        self.ordered_dict();
        self.op(b't');
        self.op(b'R');
    }

    fn tensor_dict<'a, 'b>(&mut self, entries: impl Iterator<Item = (&'a str, &'b TensorData)>, as_parameters: bool) {
        self.ordered_dict();
        self.op(b'(');
        for (name, data) in entries {
            self.unicode(name);
            if as_parameters {
                self.parameter(data);
            } else {
                self.tensor(data);
            }
        }
        self.op(b'u');
    }

    /// `NEWOBJ` of the class, then `BUILD` with its `__dict__`.
    fn module(&mut self, module_name: &str, class_name: &str, parameters: &[(&str, &TensorData)], buffers: &[(&str, &TensorData)], children: &[(&str, Vec<(&str, &TensorData)>)]) {
        self.global(module_name, class_name);
        self.op(b')');
        self.op(0x81);
        self.op(b'}');
        self.op(b'(');
        self.unicode("training");
        self.op(0x89);
        self.unicode("_parameters");
        self.tensor_dict(parameters.iter().copied(), true);
        self.unicode("_buffers");
        self.tensor_dict(buffers.iter().copied(), false);
        self.unicode("_modules");
        self.ordered_dict();
        self.op(b'(');
        for (name, tensors) in children {
            self.unicode(name);
            let (buffers, parameters): (Vec<_>, Vec<_>) = tensors.iter().copied().partition(|(n, _)| BUFFER_NAMES.contains(n));
            let (module_name, class_name) = child_class(name);
            self.module(module_name, class_name, &parameters, &buffers, &[]);
        }
        self.op(b'u');
        self.op(b'u');
        self.op(b'b');
    }

    fn finish(mut self, path: &Path) -> zip::result::ZipResult<()> {
        self.op(b'.');
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let mut zip = zip::ZipWriter::new(File::create(path)?);
        zip.start_file("archive/data.pkl", options)?;
        zip.write_all(&self.bytes)?;
        for (key, bytes) in &self.storages {
            zip.start_file(format!("archive/data/{key}"), options)?;
            zip.write_all(bytes)?;
        }
        zip.start_file("archive/version", options)?;
        zip.write_all(b"3\n")?;
        zip.finish()?;
        Ok(())
    }
}

fn child_class(name: &str) -> (&'static str, &'static str) {
    if name.starts_with("conv") {
        ("torch.nn.modules.conv", "Conv2d")
    } else if name.starts_with("bn") {
        ("torch.nn.modules.batchnorm", "BatchNorm2d")
    } else if name.starts_with("fc") {
        ("torch.nn.modules.linear", "Linear")
    } else if name.starts_with("pool") {
        ("torch.nn.modules.pooling", "MaxPool2d")
    } else {
        ("torch.nn.modules.dropout", "Dropout")
    }
}

/// `torch.save(model.state_dict(), path)`, including the `_metadata` attribute PyTorch attaches.
pub fn write_state_dict(path: &Path, state_dict: &StateDict) -> zip::result::ZipResult<()> {
    let mut pickle = PickleWriter::default();
    pickle.proto();
    pickle.tensor_dict(state_dict.iter(), false);
    pickle.op(b'}');
    pickle.op(b'(');
    pickle.unicode("_metadata");
    pickle.ordered_dict();
    pickle.op(b'(');
    pickle.unicode("");
    pickle.op(b'}');
    pickle.op(b'(');
    pickle.unicode("version");
    pickle.int(1);
    pickle.op(b'u');
    pickle.op(b'u');
    pickle.op(b'u');
    pickle.op(b'b');
    pickle.finish(path)
}

/// `torch.save(model, path)` for a module whose children are named by the first path segment.
pub fn write_full_model(path: &Path, class_name: &str, state_dict: &StateDict) -> zip::result::ZipResult<()> {
    let mut children: Vec<(&str, Vec<(&str, &TensorData)>)> = vec![];
    for (name, data) in state_dict.iter() {
        let (child, tensor) = name.split_once('.').unwrap();
        match children.iter_mut().find(|(c, _)| *c == child) {
            Some((_, tensors)) => tensors.push((tensor, data)),
            None => children.push((child, vec![(tensor, data)])),
        }
    }
    children.push(("pool", vec![]));
    children.push(("dropout", vec![]));

    let mut pickle = PickleWriter::default();
    pickle.proto();
    pickle.module("__main__", class_name, &[], &[], &children);
    pickle.finish(path)
}
