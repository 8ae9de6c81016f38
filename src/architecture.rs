use std::sync::Arc;
use candle_core::Device;
use onnx_graph::pytorch;
use onnx_graph::tensor::{DType, Dimension, InputTensor, Shape, Tensor, TensorData, TensorDataValue};
use onnx_graph::weights::{StateDict, StateDictWeightManager, WeightManager};
use rand::Rng;

pub const CLASS_NAME: &str = "DigitRecognitionCNN";
pub const INPUT_NAME: &str = "input";
pub const OUTPUT_NAME: &str = "output";
pub const BATCH_DIM_NAME: &str = "batch_size";

pub const IMAGE_SIZE: usize = 28;
pub const NUM_CLASSES: usize = 10;
pub const FLATTENED_FEATURES: usize = 128 * 3 * 3;
pub const HIDDEN_FEATURES: usize = 256;

pub const BATCH_NORM_EPSILON: f32 = 1e-5;
/// PyTorch convention: weight of the new observation in the running statistics.
pub const BATCH_NORM_MOMENTUM: f32 = 0.1;

pub struct ConvStage {
    pub conv: &'static str,
    pub bn: &'static str,
    pub in_channels: usize,
    pub out_channels: usize,
}

pub const KERNEL_SIZE: usize = 3;
pub const PADDING: usize = 1;
pub const POOL_SIZE: usize = 2;

pub const CONV_STAGES: [ConvStage; 3] = [
    ConvStage { conv: "conv1", bn: "bn1", in_channels: 1, out_channels: 32 },
    ConvStage { conv: "conv2", bn: "bn2", in_channels: 32, out_channels: 64 },
    ConvStage { conv: "conv3", bn: "bn3", in_channels: 64, out_channels: 128 },
];

/// `(name, in_features, out_features)`. Dropout (p=0.5) sits between the two and is the identity in eval mode.
pub const LINEAR_LAYERS: [(&str, usize, usize); 2] = [
    ("fc1", FLATTENED_FEATURES, HIDDEN_FEATURES),
    ("fc2", HIDDEN_FEATURES, NUM_CLASSES),
];

#[derive(Debug, thiserror::Error)]
pub enum ArchitectureError {
    #[error("Missing key in state dict: {0}")]
    MissingParameterError(String),
    #[error("Unexpected key in state dict: {0}")]
    UnexpectedParameterError(String),
    #[error("Size mismatch for {name}: checkpoint has {actual:?}, model expects {expected:?}")]
    ShapeMismatchError { name: String, expected: Vec<usize>, actual: Vec<usize> },
    #[error("Forward pass produced shape {0:?}, expected [1, 10]")]
    ForwardShapeError(Vec<usize>),
    #[error(transparent)]
    GraphError(#[from] onnx_graph::Error),
    #[error(transparent)]
    CandleCoreError(#[from] candle_core::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterInit {
    /// Uniform in `±1/sqrt(fan_in)`, PyTorch's default for conv and linear weights and biases.
    FanInUniform(usize),
    Ones,
    Zeros,
    /// `num_batches_tracked`, an integer scalar that plays no part in inference.
    BatchCounter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub init: ParameterInit,
}

impl ParameterSpec {
    fn new(name: String, shape: Vec<usize>, init: ParameterInit) -> Self {
        Self { name, shape, init }
    }

    fn is_optional(&self) -> bool {
        self.init == ParameterInit::BatchCounter
    }
}

/// Every parameter and buffer of the network, in `state_dict()` order.
pub fn parameter_specs() -> Vec<ParameterSpec> {
    let mut specs = vec![];
    for stage in &CONV_STAGES {
        let fan_in = stage.in_channels * KERNEL_SIZE * KERNEL_SIZE;
        let c = stage.out_channels;
        specs.push(ParameterSpec::new(format!("{}.weight", stage.conv), vec![c, stage.in_channels, KERNEL_SIZE, KERNEL_SIZE], ParameterInit::FanInUniform(fan_in)));
        specs.push(ParameterSpec::new(format!("{}.bias", stage.conv), vec![c], ParameterInit::FanInUniform(fan_in)));
        specs.push(ParameterSpec::new(format!("{}.weight", stage.bn), vec![c], ParameterInit::Ones));
        specs.push(ParameterSpec::new(format!("{}.bias", stage.bn), vec![c], ParameterInit::Zeros));
        specs.push(ParameterSpec::new(format!("{}.running_mean", stage.bn), vec![c], ParameterInit::Zeros));
        specs.push(ParameterSpec::new(format!("{}.running_var", stage.bn), vec![c], ParameterInit::Ones));
        specs.push(ParameterSpec::new(format!("{}.num_batches_tracked", stage.bn), vec![], ParameterInit::BatchCounter));
    }
    for (name, in_features, out_features) in LINEAR_LAYERS {
        specs.push(ParameterSpec::new(format!("{name}.weight"), vec![out_features, in_features], ParameterInit::FanInUniform(in_features)));
        specs.push(ParameterSpec::new(format!("{name}.bias"), vec![out_features], ParameterInit::FanInUniform(in_features)));
    }
    specs
}

/// The handwritten digit classifier, frozen in eval mode.
pub struct DigitRecognitionCnn {
    state_dict: Arc<StateDict>,
}

impl DigitRecognitionCnn {
    /// Strict load: every key must be known and every shape must match.
    /// `num_batches_tracked` may be absent, as PyTorch tolerates for older checkpoints.
    pub fn from_state_dict(mut state_dict: StateDict) -> Result<Self, ArchitectureError> {
        let specs = parameter_specs();
        if let Some(unexpected) = state_dict.names().find(|n| !specs.iter().any(|s| s.name == *n)) {
            return Err(ArchitectureError::UnexpectedParameterError(unexpected.to_string()));
        }
        let mut validated = StateDict::new();
        for spec in &specs {
            let Some(data) = state_dict.remove(&spec.name) else {
                if spec.is_optional() {
                    continue;
                }
                return Err(ArchitectureError::MissingParameterError(spec.name.clone()));
            };
            let actual = data.shape().resolve()?;
            if actual != spec.shape {
                return Err(ArchitectureError::ShapeMismatchError { name: spec.name.clone(), expected: spec.shape.clone(), actual });
            }
            let data = match spec.init {
                ParameterInit::BatchCounter => data,
                _ => data.to_f32()?,
            };
            validated.insert(spec.name.clone(), data);
        }
        Ok(Self { state_dict: Arc::new(validated) })
    }

    /// Freshly initialized weights, the way `DigitRecognitionCNN()` would start out.
    pub fn random(rng: &mut impl Rng) -> Result<Self, ArchitectureError> {
        let mut state_dict = StateDict::new();
        for spec in parameter_specs() {
            let shape = Shape::from(spec.shape.clone());
            let data = match spec.init {
                ParameterInit::FanInUniform(fan_in) => {
                    let bound = 1.0 / (fan_in as f32).sqrt();
                    let count = spec.shape.iter().product::<usize>();
                    let values = (0..count).map(|_| rng.gen_range(-bound..bound)).collect::<Vec<f32>>();
                    TensorData::new(TensorDataValue::F32(values), shape)?
                }
                ParameterInit::Ones => TensorData::fill(shape, 1.0f32)?,
                ParameterInit::Zeros => TensorData::fill(shape, 0.0f32)?,
                ParameterInit::BatchCounter => TensorData::fill(shape, 0i64)?,
            };
            state_dict.insert(spec.name, data);
        }
        Ok(Self { state_dict: Arc::new(state_dict) })
    }

    pub fn state_dict(&self) -> &StateDict {
        &self.state_dict
    }

    fn parameter(&self, name: &str, device: &Device) -> Result<candle_core::Tensor, ArchitectureError> {
        let data = self.state_dict.get(name).ok_or_else(|| ArchitectureError::MissingParameterError(name.to_string()))?;
        Ok(data.to_candle_tensor(device)?)
    }

    /// Eval-mode forward pass on CPU: batch norm uses running statistics and dropout is skipped.
    pub fn forward(&self, input: &candle_core::Tensor) -> Result<candle_core::Tensor, ArchitectureError> {
        let device = input.device().clone();
        let mut x = input.clone();
        for stage in &CONV_STAGES {
            let channel_shape = (1, stage.out_channels, 1, 1);
            let weight = self.parameter(&format!("{}.weight", stage.conv), &device)?;
            let bias = self.parameter(&format!("{}.bias", stage.conv), &device)?.reshape(channel_shape)?;
            x = x.conv2d(&weight, PADDING, 1, 1, 1)?.broadcast_add(&bias)?;

            let gamma = self.parameter(&format!("{}.weight", stage.bn), &device)?.reshape(channel_shape)?;
            let beta = self.parameter(&format!("{}.bias", stage.bn), &device)?.reshape(channel_shape)?;
            let mean = self.parameter(&format!("{}.running_mean", stage.bn), &device)?.reshape(channel_shape)?;
            let std = self.parameter(&format!("{}.running_var", stage.bn), &device)?
                .affine(1.0, BATCH_NORM_EPSILON as f64)?
                .sqrt()?
                .reshape(channel_shape)?;
            x = x.broadcast_sub(&mean)?.broadcast_div(&std)?.broadcast_mul(&gamma)?.broadcast_add(&beta)?;

            x = x.relu()?.max_pool2d(POOL_SIZE)?;
        }
        x = x.flatten_from(1)?;
        for (index, (name, _, _)) in LINEAR_LAYERS.iter().enumerate() {
            let weight = self.parameter(&format!("{name}.weight"), &device)?;
            let bias = self.parameter(&format!("{name}.bias"), &device)?;
            x = x.matmul(&weight.t()?)?.broadcast_add(&bias)?;
            if index + 1 < LINEAR_LAYERS.len() {
                x = x.relu()?;
            }
        }
        Ok(x)
    }

    /// Runs one synthetic sample through the network to validate weights against the topology.
    pub fn trace(&self, input: &candle_core::Tensor) -> Result<(), ArchitectureError> {
        let output = self.forward(input)?;
        if output.dims() != [1, NUM_CLASSES] {
            return Err(ArchitectureError::ForwardShapeError(output.dims().to_vec()));
        }
        log::debug!("Dummy forward pass produced {:?}", output.dims());
        Ok(())
    }

    /// The inference graph: `input` of shape `[batch_size, 1, 28, 28]` to logits `[batch_size, 10]`.
    pub fn build_graph(&self) -> Result<(Arc<InputTensor>, Arc<dyn Tensor>), ArchitectureError> {
        let weights = StateDictWeightManager::new(self.state_dict.clone());
        let input = InputTensor::new(
            INPUT_NAME.to_string(),
            DType::F32,
            Shape::new(vec![
                Dimension::symbolic(BATCH_DIM_NAME),
                Dimension::new(Some(1), None, None),
                Dimension::new(Some(IMAGE_SIZE), None, None),
                Dimension::new(Some(IMAGE_SIZE), None, None),
            ])
        );

        let mut x: Arc<dyn Tensor> = input.clone();
        for (index, stage) in CONV_STAGES.iter().enumerate() {
            x = pytorch::conv2d(&weights.prefix(stage.conv), x, 1, PADDING)?;
            x = pytorch::batch_norm_2d(&weights.prefix(stage.bn), x, BATCH_NORM_EPSILON, BATCH_NORM_MOMENTUM)?;
            x = pytorch::relu(Some(format!("relu{}", index + 1)), x)?;
            x = pytorch::max_pool_2d(Some(format!("pool{}", index + 1)), x, POOL_SIZE)?;
        }
        x = pytorch::flatten(Some("flatten".to_string()), x, FLATTENED_FEATURES)?;
        x = pytorch::linear(&weights.prefix("fc1"), x)?;
        x = pytorch::relu(Some("relu4".to_string()), x)?;
        x = pytorch::linear(&weights.prefix("fc2"), x)?;
        Ok((input, x))
    }
}
