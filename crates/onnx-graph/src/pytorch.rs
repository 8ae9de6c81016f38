use std::sync::Arc;
use crate::{operators, Error};
use crate::tensor::{Shape, Tensor, TensorData, TensorDataValue};
use crate::weights::WeightManager;

/// `nn.Conv2d` with square stride and symmetric padding.
pub fn conv2d(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>, stride: usize, padding: usize) -> Result<Arc<dyn Tensor>, Error> {
    Ok(operators::Conv::new(
        weight_manager.get_prefix().map(|x| x.to_string()),
        input,
        weight_manager.get_tensor("weight")?,
        weight_manager.get_tensor("bias").ok(),
        [stride, stride],
        [padding; 4],
        [1, 1],
        1
    )?)
}

/// `nn.BatchNorm2d` in eval mode. ONNX momentum is the complement of PyTorch's.
pub fn batch_norm_2d(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>, epsilon: f32, momentum: f32) -> Result<Arc<dyn Tensor>, Error> {
    Ok(operators::BatchNormalization::new(
        weight_manager.get_prefix().map(|x| x.to_string()),
        input,
        weight_manager.get_tensor("weight")?,
        weight_manager.get_tensor("bias")?,
        weight_manager.get_tensor("running_mean")?,
        weight_manager.get_tensor("running_var")?,
        epsilon,
        1.0 - momentum
    )?)
}

/// `nn.Linear` as a single Gemm against the untransposed `[out, in]` weight.
pub fn linear(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    Ok(operators::Gemm::new(
        weight_manager.get_prefix().map(|x| x.to_string()),
        input,
        weight_manager.get_tensor("weight")?,
        weight_manager.get_tensor("bias").ok(),
        false,
        true,
        1.0,
        1.0
    )?)
}

pub fn relu(name: Option<String>, input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    Ok(operators::Relu::new(name, input)?)
}

pub fn max_pool_2d(name: Option<String>, input: Arc<dyn Tensor>, kernel_size: usize) -> Result<Arc<dyn Tensor>, Error> {
    Ok(operators::MaxPool::new(name, input, [kernel_size, kernel_size], [kernel_size, kernel_size], [0; 4])?)
}

/// `x.view(-1, features)`: keeps the leading dimension, which may be symbolic.
pub fn flatten(name: Option<String>, input: Arc<dyn Tensor>, features: usize) -> Result<Arc<dyn Tensor>, Error> {
    let target = TensorData::new(TensorDataValue::I64(vec![-1, features as i64]), Shape::from(vec![2usize]))?;
    let shape = operators::Constant::new(name.as_ref().map(|x| format!("{x}.shape")), target);
    Ok(operators::Reshape::new(name, input, shape)?)
}
