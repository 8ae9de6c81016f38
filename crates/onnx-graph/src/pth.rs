use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use candle_core::pickle::{Object, Stack, TensorInfo};
use candle_core::Device;
use crate::tensor::TensorData;
use crate::weights::StateDict;

#[derive(Debug, thiserror::Error)]
pub enum PthError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid checkpoint archive: {0}")]
    ZipError(#[from] zip::result::ZipError),
    #[error("Cannot decode checkpoint: {0}")]
    CandleCoreError(#[from] candle_core::Error),
    #[error("Checkpoint has no data.pkl entry")]
    MissingPickleError,
    #[error("Unsupported checkpoint contents: {0}")]
    UnsupportedContentsError(String),
    #[error("Tensor {0} is not stored contiguously")]
    NonContiguousTensorError(String),
    #[error("Tensor {0} has unsupported storage type {1:?}")]
    UnsupportedDTypeError(String, candle_core::DType),
    #[error(transparent)]
    TensorError(#[from] crate::Error),
}

/// Keys under which training scripts commonly nest the weights of a checkpoint dict.
const NESTED_STATE_KEYS: &[&str] = &["state_dict", "model_state_dict", "model"];

/// The decoded contents of a `torch.save` zip archive.
#[derive(Debug)]
pub struct PthCheckpoint {
    /// Set when the archive holds a pickled `nn.Module` rather than a bare mapping.
    pub module_class: Option<String>,
    pub state_dict: StateDict,
}

impl PthCheckpoint {
    pub fn load(path: &Path) -> Result<Self, PthError> {
        let file = File::open(path)?;
        let mut zip = zip::ZipArchive::new(BufReader::new(file))?;
        let pickle_name = zip.file_names()
            .find(|f| f.ends_with("data.pkl"))
            .map(|f| f.to_string())
            .ok_or(PthError::MissingPickleError)?;
        let dir_name = PathBuf::from(pickle_name.strip_suffix(".pkl").unwrap_or(&pickle_name));

        let obj = {
            let mut reader = BufReader::new(zip.by_name(&pickle_name)?);
            let mut stack = Stack::empty();
            stack.read_loop(&mut reader)?;
            stack.finalize()?
        };

        let mut tensor_infos = vec![];
        let module_class = collect_tensor_infos(obj, &dir_name, &mut tensor_infos)?;
        log::debug!("{} tensors referenced by {}", tensor_infos.len(), path.display());

        let mut state_dict = StateDict::new();
        for info in tensor_infos {
            let data = read_tensor(&mut zip, &info)?;
            state_dict.insert(info.name, data);
        }
        Ok(Self {
            module_class,
            state_dict
        })
    }
}

fn collect_tensor_infos(obj: Object, dir_name: &Path, out: &mut Vec<TensorInfo>) -> Result<Option<String>, PthError> {
    match obj {
        Object::Build { callable, args } => {
            let class_name = module_class_name(&callable)
                .ok_or_else(|| PthError::UnsupportedContentsError(format!("object built from {}", object_kind(&callable))))?;
            flatten_module("", *args, dir_name, out)?;
            Ok(Some(class_name))
        }
        Object::Dict(mut entries) => {
            let nested = entries.iter().position(|(k, v)| {
                matches!(k, Object::Unicode(key) if NESTED_STATE_KEYS.contains(&key.as_str()))
                    && matches!(v, Object::Dict(_) | Object::Build { .. })
            });
            if let Some(index) = nested {
                let (_, value) = entries.swap_remove(index);
                return collect_tensor_infos(value, dir_name, out);
            }
            for (name, value) in entries {
                push_tensor_info("", name, value, dir_name, out)?;
            }
            Ok(None)
        }
        other => Err(PthError::UnsupportedContentsError(object_kind(&other).to_string()))
    }
}

/// Class of a pickled object, either from `NEWOBJ` or from `copyreg._reconstructor`.
fn module_class_name(callable: &Object) -> Option<String> {
    let Object::Reduce { callable, args } = callable else {
        return None;
    };
    match callable.as_ref() {
        Object::Class { module_name, class_name } if module_name == "copyreg" && class_name == "_reconstructor" => {
            match args.as_ref() {
                Object::Tuple(args) => match args.first() {
                    Some(Object::Class { class_name, .. }) => Some(class_name.clone()),
                    _ => None
                },
                _ => None
            }
        }
        Object::Class { class_name, .. } => Some(class_name.clone()),
        _ => None
    }
}

fn object_kind(obj: &Object) -> &'static str {
    match obj {
        Object::Class { .. } => "class",
        Object::Int(_) | Object::Long(_) => "int",
        Object::Float(_) => "float",
        Object::Unicode(_) => "str",
        Object::Bool(_) => "bool",
        Object::None => "None",
        Object::Tuple(_) => "tuple",
        Object::List(_) => "list",
        Object::Mark => "mark",
        Object::Dict(_) => "dict",
        Object::Reduce { .. } => "reduce",
        Object::Build { .. } => "build",
        Object::PersistentLoad(_) => "persistent id",
    }
}

fn dotted(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Walks a module `__dict__`, collecting `_parameters` and `_buffers` of it and every submodule.
fn flatten_module(prefix: &str, state: Object, dir_name: &Path, out: &mut Vec<TensorInfo>) -> Result<(), PthError> {
    let state = match state {
        Object::Dict(state) => state,
        other => return Err(PthError::UnsupportedContentsError(format!("module state of kind {}", object_kind(&other))))
    };
    for (key, value) in state {
        let Object::Unicode(key) = key else { continue };
        match key.as_str() {
            "_parameters" | "_buffers" => {
                let Object::Dict(entries) = value else { continue };
                for (name, value) in entries {
                    push_tensor_info(prefix, name, value, dir_name, out)?;
                }
            }
            "_modules" => {
                let Object::Dict(children) = value else { continue };
                for (name, child) in children {
                    let Object::Unicode(name) = name else { continue };
                    match child {
                        Object::Build { args, .. } => flatten_module(&dotted(prefix, &name), *args, dir_name, out)?,
                        Object::None => {}
                        other => log::warn!("Skipping submodule {}: unexpected {}", dotted(prefix, &name), object_kind(&other)),
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn push_tensor_info(prefix: &str, name: Object, value: Object, dir_name: &Path, out: &mut Vec<TensorInfo>) -> Result<(), PthError> {
    let Object::Unicode(name) = name else {
        return Ok(());
    };
    // `state_dict()` carries per-module version info alongside the tensors.
    if value == Object::None || name == "_metadata" {
        return Ok(());
    }
    let full_name = dotted(prefix, &name);
    match value.into_tensor_info(Object::Unicode(full_name.clone()), dir_name)? {
        Some(info) => out.push(info),
        None => log::warn!("Skipping {full_name}: not a tensor"),
    }
    Ok(())
}

fn read_tensor<R: Read + std::io::Seek>(zip: &mut zip::ZipArchive<R>, info: &TensorInfo) -> Result<TensorData, PthError> {
    if !info.layout.is_contiguous() {
        return Err(PthError::NonContiguousTensorError(info.name.clone()));
    }
    let dtype = info.dtype;
    match dtype {
        candle_core::DType::F32 | candle_core::DType::F16 | candle_core::DType::BF16
        | candle_core::DType::F64 | candle_core::DType::I64 => {}
        other => return Err(PthError::UnsupportedDTypeError(info.name.clone(), other)),
    }
    let mut reader = zip.by_name(&info.path)?;
    let start_offset = info.layout.start_offset();
    if start_offset > 0 {
        std::io::copy(&mut reader.by_ref().take(start_offset as u64), &mut std::io::sink())?;
    }
    let mut buffer = vec![0u8; info.layout.shape().elem_count() * dtype.size_in_bytes()];
    reader.read_exact(&mut buffer)?;

    let tensor = candle_core::Tensor::from_raw_buffer(&buffer, dtype, info.layout.dims(), &Device::Cpu)?;
    let tensor = match dtype {
        candle_core::DType::F16 | candle_core::DType::BF16 | candle_core::DType::F64 => tensor.to_dtype(candle_core::DType::F32)?,
        _ => tensor
    };
    Ok(TensorData::from_candle_tensor(&tensor)?)
}
