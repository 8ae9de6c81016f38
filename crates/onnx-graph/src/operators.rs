use std::sync::Arc;
use crate::{onnx, Error};
use crate::node::{float_attribute, int_attribute, ints_attribute, tensor_attribute, Node, SingleOutputNode};
use crate::tensor::{DType, Dimension, Shape, Tensor, TensorData};

fn validate_float_dtype(dtype: DType) -> Result<(), Error> {
    match dtype {
        DType::F32 | DType::F16 | DType::BF16 => Ok(()),
        _ => Err(Error::InvalidDTypeError)
    }
}

fn validate_channel_vector(tensor: &dyn Tensor, channels: &Dimension, dtype: DType) -> Result<(), Error> {
    if tensor.dtype() != dtype {
        Err(Error::DTypeMismatchError)?
    }
    if tensor.rank() != 1 || tensor.shape()[0].as_ref() != channels {
        Err(Error::InputShapeError)?
    }
    Ok(())
}

fn sliding_window_output(input: usize, kernel: usize, stride: usize, pad_begin: usize, pad_end: usize, dilation: usize) -> Result<usize, Error> {
    if kernel == 0 || stride == 0 || dilation == 0 {
        Err(Error::InputShapeError)?
    }
    let span = dilation * (kernel - 1) + 1;
    let padded = input + pad_begin + pad_end;
    if padded < span {
        Err(Error::InputShapeError)?
    }
    Ok((padded - span) / stride + 1)
}

fn to_i64(values: &[usize]) -> Vec<i64> {
    values.iter().map(|x| *x as i64).collect()
}

pub struct Conv {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    weight: Arc<dyn Tensor>,
    bias: Option<Arc<dyn Tensor>>,
    kernel_shape: [usize; 2],
    strides: [usize; 2],
    pads: [usize; 4],
    dilations: [usize; 2],
    group: usize,
    output_shape: Shape
}

impl Conv {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, weight: Arc<dyn Tensor>, bias: Option<Arc<dyn Tensor>>, strides: [usize; 2], pads: [usize; 4], dilations: [usize; 2], group: usize) -> Result<Arc<Self>, Error> {
        validate_float_dtype(input.dtype())?;
        if weight.dtype() != input.dtype() {
            Err(Error::DTypeMismatchError)?
        }
        if input.rank() != 4 || weight.rank() != 4 || group == 0 {
            Err(Error::InputShapeError)?
        }
        let out_channels = weight.shape()[0].resolve()?;
        let in_channels_per_group = weight.shape()[1].resolve()?;
        if input.shape()[1].resolve()? != in_channels_per_group * group || out_channels % group != 0 {
            Err(Error::InputShapeError)?
        }
        if let Some(bias) = &bias {
            validate_channel_vector(bias.as_ref(), &weight.shape()[0], input.dtype())?;
        }
        let kernel_shape = [weight.shape()[2].resolve()?, weight.shape()[3].resolve()?];
        let mut output_dims = vec![input.shape()[0].clone(), weight.shape()[0].clone()];
        for i in 0..2 {
            let size = sliding_window_output(input.shape()[2 + i].resolve()?, kernel_shape[i], strides[i], pads[i], pads[2 + i], dilations[i])?;
            output_dims.push(Dimension::new(Some(size), None, None));
        }
        Ok(Arc::new(Self {
            name,
            input,
            weight,
            bias,
            kernel_shape,
            strides,
            pads,
            dilations,
            group,
            output_shape: Shape::new(output_dims)
        }))
    }
}

impl Node for Conv {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        let mut inputs = vec![self.input.as_ref(), self.weight.as_ref()];
        if let Some(bias) = &self.bias {
            inputs.push(bias.as_ref());
        }
        inputs
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Conv"
    }

    fn get_onnx_attributes(&self) -> Result<Vec<onnx::AttributeProto>, Error> {
        Ok(vec![
            ints_attribute("dilations", &to_i64(&self.dilations)),
            int_attribute("group", self.group as i64),
            ints_attribute("kernel_shape", &to_i64(&self.kernel_shape)),
            ints_attribute("pads", &to_i64(&self.pads)),
            ints_attribute("strides", &to_i64(&self.strides)),
        ])
    }
}

impl SingleOutputNode for Conv {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

/// Inference-mode batch normalization over axis 1, using the stored running statistics.
pub struct BatchNormalization {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    scale: Arc<dyn Tensor>,
    bias: Arc<dyn Tensor>,
    mean: Arc<dyn Tensor>,
    var: Arc<dyn Tensor>,
    epsilon: f32,
    momentum: f32
}

impl BatchNormalization {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, scale: Arc<dyn Tensor>, bias: Arc<dyn Tensor>, mean: Arc<dyn Tensor>, var: Arc<dyn Tensor>, epsilon: f32, momentum: f32) -> Result<Arc<Self>, Error> {
        validate_float_dtype(input.dtype())?;
        if input.rank() < 2 {
            Err(Error::InputShapeError)?
        }
        let channels = input.shape()[1].clone();
        for param in [&scale, &bias, &mean, &var] {
            validate_channel_vector(param.as_ref(), &channels, input.dtype())?;
        }
        Ok(Arc::new(Self {
            name,
            input,
            scale,
            bias,
            mean,
            var,
            epsilon,
            momentum
        }))
    }
}

impl Node for BatchNormalization {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.scale.as_ref(), self.bias.as_ref(), self.mean.as_ref(), self.var.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "BatchNormalization"
    }

    fn get_onnx_attributes(&self) -> Result<Vec<onnx::AttributeProto>, Error> {
        Ok(vec![
            float_attribute("epsilon", self.epsilon),
            float_attribute("momentum", self.momentum),
        ])
    }
}

impl SingleOutputNode for BatchNormalization {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Relu {
    name: Option<String>,
    input: Arc<dyn Tensor>
}

impl Relu {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        validate_float_dtype(input.dtype())?;
        Ok(Arc::new(Self {
            name,
            input
        }))
    }
}

impl Node for Relu {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Relu"
    }
}

impl SingleOutputNode for Relu {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct MaxPool {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    kernel_shape: [usize; 2],
    strides: [usize; 2],
    pads: [usize; 4],
    output_shape: Shape
}

impl MaxPool {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, kernel_shape: [usize; 2], strides: [usize; 2], pads: [usize; 4]) -> Result<Arc<Self>, Error> {
        validate_float_dtype(input.dtype())?;
        if input.rank() != 4 {
            Err(Error::InputShapeError)?
        }
        let mut output_dims = vec![input.shape()[0].clone(), input.shape()[1].clone()];
        for i in 0..2 {
            // floor mode
            let size = sliding_window_output(input.shape()[2 + i].resolve()?, kernel_shape[i], strides[i], pads[i], pads[2 + i], 1)?;
            output_dims.push(Dimension::new(Some(size), None, None));
        }
        Ok(Arc::new(Self {
            name,
            input,
            kernel_shape,
            strides,
            pads,
            output_shape: Shape::new(output_dims)
        }))
    }
}

impl Node for MaxPool {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "MaxPool"
    }

    fn get_onnx_attributes(&self) -> Result<Vec<onnx::AttributeProto>, Error> {
        Ok(vec![
            int_attribute("ceil_mode", 0),
            ints_attribute("kernel_shape", &to_i64(&self.kernel_shape)),
            ints_attribute("pads", &to_i64(&self.pads)),
            ints_attribute("strides", &to_i64(&self.strides)),
        ])
    }
}

impl SingleOutputNode for MaxPool {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Reshape {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    shape: Arc<dyn Tensor>,
    output_shape: Shape
}

impl Reshape {
    /// The target shape must be resolvable at build time. `0` copies the input dimension at the
    /// same index and a single `-1` absorbs the remaining elements, which may be a symbolic dimension.
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, shape: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        if shape.dtype() != DType::I64 || shape.rank() != 1 {
            Err(Error::InvalidDTypeError)?
        }
        let target = shape.resolve_data().ok_or(Error::CannotResolveDataError)?.to_int_vec()?;
        let input_dims = &input.shape().dims;

        let mut output_dims: Vec<Option<Arc<Dimension>>> = vec![];
        let mut backfill_index = None;
        for (i, value) in target.iter().enumerate() {
            match *value {
                -1 => {
                    if backfill_index.is_some() {
                        Err(Error::InvalidInputError)?
                    }
                    backfill_index = Some(i);
                    output_dims.push(None);
                }
                0 => output_dims.push(Some(input_dims.get(i).ok_or(Error::InputShapeError)?.clone())),
                v if v > 0 => output_dims.push(Some(Dimension::new(Some(v as usize), None, None))),
                _ => Err(Error::InvalidInputError)?
            }
        }

        // Split both sides into a known element count and the leftover symbolic dims.
        let mut input_known = 1usize;
        let mut input_symbolic = vec![];
        for dim in input_dims {
            match dim.value {
                Some(v) => input_known *= v,
                None => input_symbolic.push(dim.clone())
            }
        }
        let mut output_known = 1usize;
        let mut output_symbolic = vec![];
        for dim in output_dims.iter().flatten() {
            match dim.value {
                Some(v) => output_known *= v,
                None => output_symbolic.push(dim.clone())
            }
        }

        let output_dims: Vec<Arc<Dimension>> = match backfill_index {
            Some(index) => {
                let remaining_symbolic: Vec<_> = input_symbolic.iter()
                    .filter(|d| !output_symbolic.iter().any(|o| Arc::ptr_eq(o, *d)))
                    .cloned()
                    .collect();
                if output_known == 0 || input_known % output_known != 0 {
                    Err(Error::InputShapeError)?
                }
                let backfill = match (remaining_symbolic.len(), input_known / output_known) {
                    (0, count) => Dimension::new(Some(count), None, None),
                    (1, 1) => remaining_symbolic[0].clone(),
                    _ => Err(Error::UnresolvedDimensionError)?
                };
                output_dims.into_iter().enumerate()
                    .map(|(i, d)| if i == index { Ok(backfill.clone()) } else { d.ok_or(Error::InvalidInputError) })
                    .collect::<Result<_, _>>()?
            }
            None => {
                if input_known != output_known || input_symbolic.len() != output_symbolic.len() {
                    Err(Error::InputShapeError)?
                }
                output_dims.into_iter().flatten().collect()
            }
        };

        Ok(Arc::new(Self {
            name,
            input,
            shape,
            output_shape: Shape::new(output_dims)
        }))
    }
}

impl Node for Reshape {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.shape.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Reshape"
    }
}

impl SingleOutputNode for Reshape {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }

    fn resolve_output_data(&self) -> Option<TensorData> {
        let data = self.input.resolve_data()?;
        self.output_shape.resolve().ok()?;
        data.reshape(self.output_shape.clone()).ok()
    }
}

pub struct Gemm {
    name: Option<String>,
    a: Arc<dyn Tensor>,
    b: Arc<dyn Tensor>,
    c: Option<Arc<dyn Tensor>>,
    trans_a: bool,
    trans_b: bool,
    alpha: f32,
    beta: f32,
    output_dtype: DType,
    output_shape: Shape
}

impl Gemm {
    pub fn new(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>, c: Option<Arc<dyn Tensor>>, trans_a: bool, trans_b: bool, alpha: f32, beta: f32) -> Result<Arc<Self>, Error> {
        if a.dtype() != b.dtype() {
            return Err(Error::DTypeMismatchError)
        }
        let a_shape = if trans_a {
            a.shape().transpose()
        } else {
            a.shape().clone()
        };
        let b_shape = if trans_b {
            b.shape().transpose()
        } else {
            b.shape().clone()
        };
        if a_shape.rank() != 2 || b_shape.rank() != 2 {
            return Err(Error::InputShapeError)
        }
        if a_shape[1].as_ref() != b_shape[0].as_ref() {
            return Err(Error::InputShapeError)
        }
        if let Some(c) = &c {
            if c.dtype() != a.dtype() {
                return Err(Error::DTypeMismatchError)
            }
            // Unidirectionally broadcastable to [M, N]; only the bias-vector forms are accepted.
            let valid = match c.rank() {
                1 => c.shape()[0].as_ref() == b_shape[1].as_ref(),
                2 => c.shape()[1].as_ref() == b_shape[1].as_ref() && c.shape()[0].value == Some(1),
                _ => false
            };
            if !valid {
                return Err(Error::InputShapeError)
            }
        }
        let output_shape = Shape::new(vec![a_shape[0].clone(), b_shape[1].clone()]);
        let output_dtype = a.dtype();
        Ok(Arc::new(Self {
            name,
            a,
            b,
            c,
            trans_a,
            trans_b,
            alpha,
            beta,
            output_dtype,
            output_shape
        }))
    }
}

impl Node for Gemm {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        if let Some(c) = &self.c {
            vec![&*self.a, &*self.b, c.as_ref()]
        } else {
            vec![&*self.a, &*self.b]
        }
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Gemm"
    }

    fn get_onnx_attributes(&self) -> Result<Vec<onnx::AttributeProto>, Error> {
        let mut attributes = vec![
            float_attribute("alpha", self.alpha),
            float_attribute("beta", self.beta),
        ];
        if self.trans_a {
            attributes.push(int_attribute("transA", 1));
        }
        if self.trans_b {
            attributes.push(int_attribute("transB", 1));
        }
        Ok(attributes)
    }
}

impl SingleOutputNode for Gemm {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.output_dtype
    }
}

pub struct Constant {
    name: Option<String>,
    data: TensorData
}

impl Constant {
    pub fn new(name: Option<String>, data: TensorData) -> Arc<Constant> {
        Arc::new(Constant {
            name,
            data
        })
    }
}

impl Node for Constant {
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Constant"
    }

    fn get_onnx_attributes(&self) -> Result<Vec<onnx::AttributeProto>, Error> {
        Ok(vec![tensor_attribute("value", &self.data)?])
    }
}

impl SingleOutputNode for Constant {
    fn get_output_shape(&self) -> &Shape {
        self.data.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.data.dtype()
    }

    fn resolve_output_data(&self) -> Option<TensorData> {
        Some(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{InputTensor, ParameterTensor, TensorDataValue};

    fn batch_input(dims: &[usize]) -> Arc<InputTensor> {
        let mut shape = vec![Dimension::symbolic("batch_size")];
        shape.extend(dims.iter().map(|x| Dimension::new(Some(*x), None, None)));
        InputTensor::new("input".to_string(), DType::F32, Shape::new(shape))
    }

    fn param(name: &str, dims: &[usize]) -> Arc<ParameterTensor> {
        let shape = Shape::from(dims.to_vec());
        ParameterTensor::new(name.to_string(), TensorData::fill(shape, 0.0f32).unwrap())
    }

    fn shape_constant(values: Vec<i64>) -> Arc<Constant> {
        let len = values.len();
        Constant::new(None, TensorData::new(TensorDataValue::I64(values), Shape::from(vec![len])).unwrap())
    }

    #[test]
    fn test_conv_keeps_symbolic_batch() {
        let input = batch_input(&[1, 28, 28]);
        let conv = Conv::new(None, input, param("w", &[32, 1, 3, 3]), Some(param("b", &[32])), [1, 1], [1, 1, 1, 1], [1, 1], 1).unwrap();
        assert!(conv.shape()[0].is_symbolic());
        assert_eq!(conv.shape().dims[1..].iter().map(|d| d.value.unwrap()).collect::<Vec<_>>(), vec![32, 28, 28]);
    }

    #[test]
    fn test_conv_rejects_channel_mismatch() {
        let input = batch_input(&[3, 28, 28]);
        let res = Conv::new(None, input, param("w", &[32, 1, 3, 3]), None, [1, 1], [1, 1, 1, 1], [1, 1], 1);
        assert!(matches!(res, Err(Error::InputShapeError)));
    }

    #[test]
    fn test_max_pool_uses_floor_mode() {
        let input = batch_input(&[128, 7, 7]);
        let pool = MaxPool::new(None, input, [2, 2], [2, 2], [0, 0, 0, 0]).unwrap();
        assert_eq!(pool.shape()[2].value, Some(3));
        assert_eq!(pool.shape()[3].value, Some(3));
    }

    #[test]
    fn test_batch_norm_validates_parameter_length() {
        let input = batch_input(&[32, 28, 28]);
        let res = BatchNormalization::new(None, input, param("s", &[32]), param("b", &[32]), param("m", &[16]), param("v", &[32]), 1e-5, 0.9);
        assert!(matches!(res, Err(Error::InputShapeError)));
    }

    #[test]
    fn test_reshape_backfill_maps_onto_symbolic_batch() {
        let input = batch_input(&[128, 3, 3]);
        let batch = input.shape()[0].clone();
        let reshape = Reshape::new(None, input, shape_constant(vec![-1, 1152])).unwrap();
        assert!(Arc::ptr_eq(&reshape.shape()[0], &batch));
        assert_eq!(reshape.shape()[1].value, Some(1152));
    }

    #[test]
    fn test_reshape_rejects_incompatible_target() {
        let input = batch_input(&[128, 3, 3]);
        let res = Reshape::new(None, input, shape_constant(vec![-1, 1000]));
        assert!(res.is_err());
    }

    #[test]
    fn test_reshape_of_constant_data_resolves() {
        let data = TensorData::new(TensorDataValue::F32(vec![1.0, 2.0, 3.0, 4.0]), Shape::from(vec![2usize, 2])).unwrap();
        let reshape = Reshape::new(None, Constant::new(None, data), shape_constant(vec![4])).unwrap();
        let resolved = reshape.resolve_data().unwrap();
        assert_eq!(resolved.shape().resolve().unwrap(), vec![4]);
    }

    #[test]
    fn test_gemm_trans_b_output_shape() {
        let input = batch_input(&[1152]);
        let gemm = Gemm::new(None, input, param("w", &[256, 1152]), Some(param("b", &[256])), false, true, 1.0, 1.0).unwrap();
        assert!(gemm.shape()[0].is_symbolic());
        assert_eq!(gemm.shape()[1].value, Some(256));
        let attributes = gemm.get_onnx_attributes().unwrap();
        assert!(attributes.iter().any(|a| a.name == "transB" && a.i == 1));
    }
}
