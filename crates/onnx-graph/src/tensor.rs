use std::hash::{Hash, Hasher};
use std::sync::Arc;
use crate::{onnx, Error};
use crate::node::{Node, SingleOutputNode};
use crate::onnx::{TensorProto, ValueInfoProto};
use core::fmt;

#[derive(Clone, Debug)]
pub struct Dimension {
    pub value: Option<usize>,
    pub name: Option<String>,
    pub denotation: Option<String>
}

impl Dimension {
    pub fn new(value: Option<usize>, name: Option<String>, denotation: Option<String>) -> Arc<Self> {
        Arc::new(Dimension { value, name, denotation })
    }

    /// A dimension only known at inference time, serialized as a `dim_param`.
    pub fn symbolic(name: &str) -> Arc<Self> {
        Self::new(None, Some(name.to_string()), None)
    }

    pub fn resolve(&self) -> Result<usize, Error> {
        self.value.ok_or(Error::UnresolvedDimensionError)
    }

    pub fn is_symbolic(&self) -> bool {
        self.value.is_none()
    }
}

impl From<&Dimension> for onnx::tensor_shape_proto::Dimension {
    fn from(value: &Dimension) -> Self {
        Self {
            value: match value.value {
                Some(value) => Some(onnx::tensor_shape_proto::dimension::Value::DimValue(value as i64)),
                None => value.name.as_ref().map(|name| onnx::tensor_shape_proto::dimension::Value::DimParam(name.clone()))
            },
            denotation: value.denotation.clone().unwrap_or_default()
        }
    }
}

impl From<usize> for Dimension {
    fn from(value: usize) -> Self {
        Self { value: Some(value), name: None, denotation: None }
    }
}

impl PartialEq for &Dimension {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(*self, *other) || match (self.value, other.value) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.name.is_some() && self.name == other.name,
            _ => false
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(value) = self.value {
            write!(f, "{}", value)
        }
        else if let Some(name) = &self.name {
            write!(f, "{}", name)
        }
        else {
            write!(f, "?")
        }
    }
}

#[derive(Clone, Debug)]
pub struct Shape {
    pub dims: Vec<Arc<Dimension>>
}

impl Shape {
    pub fn new(dims: Vec<Arc<Dimension>>) -> Self {
        Self { dims }
    }

    pub fn resolve(&self) -> Result<Vec<usize>, Error> {
        let mut res = vec![];
        for dim in &self.dims {
            res.push(dim.resolve()?);
        }
        Ok(res)
    }

    pub fn transpose(&self) -> Self {
        Self {
            dims: self.dims.iter().rev().cloned().collect()
        }
    }

    pub fn num_elements(&self) -> Result<usize, Error> {
        let mut v = 1;
        for dim in &self.dims {
            v *= dim.resolve()?;
        }
        Ok(v)
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dims.iter().map(|x| x.to_string()).collect::<Vec<_>>().join("x"))
    }
}

impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.dims.len() == other.dims.len() && self.dims.iter().zip(other.dims.iter()).all(|(a, b)| a.as_ref() == b.as_ref())
    }
}

impl From<&Shape> for onnx::TensorShapeProto {
    fn from(value: &Shape) -> Self {
        Self {
            dim: value.dims.iter().map(|x| x.as_ref().into()).collect()
        }
    }
}

impl From<&candle_core::Shape> for Shape {
    fn from(value: &candle_core::Shape) -> Self {
        Shape { dims: value.dims().iter().map(|x| Dimension::new(Some(*x), None, None)).collect() }
    }
}

impl core::ops::Index<usize> for Shape {
    type Output = Arc<Dimension>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.dims[index]
    }
}

impl <T: Clone> From<&[T]> for Shape
where
    Dimension: From<T>
{
    fn from(value: &[T]) -> Self {
        Shape { dims: value.iter().map(|x| Arc::new(Dimension::from(x.clone()))).collect() }
    }
}

impl <T> From<Vec<T>> for Shape
where
    Dimension: From<T>
{
    fn from(value: Vec<T>) -> Self {
        Shape { dims: value.into_iter().map(|x| Arc::new(Dimension::from(x))).collect() }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DType {
    F32,
    F16,
    BF16,
    I32,
    I64
}

impl DType {
    pub fn from_candle(dtype: candle_core::DType) -> Result<Self, Error> {
        match dtype {
            candle_core::DType::F32 => Ok(DType::F32),
            candle_core::DType::BF16 => Ok(DType::BF16),
            candle_core::DType::F16 => Ok(DType::F16),
            candle_core::DType::I64 => Ok(DType::I64),
            _ => Err(Error::UnsupportedDTypeError)
        }
    }

    pub fn from_onnx(data_type: i32) -> Result<Self, Error> {
        match onnx::tensor_proto::DataType::try_from(data_type) {
            Ok(onnx::tensor_proto::DataType::Float) => Ok(DType::F32),
            Ok(onnx::tensor_proto::DataType::Float16) => Ok(DType::F16),
            Ok(onnx::tensor_proto::DataType::Bfloat16) => Ok(DType::BF16),
            Ok(onnx::tensor_proto::DataType::Int32) => Ok(DType::I32),
            Ok(onnx::tensor_proto::DataType::Int64) => Ok(DType::I64),
            _ => Err(Error::UnsupportedDTypeError)
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I64 => 8,
        }
    }
}

impl From<DType> for onnx::tensor_proto::DataType {
    fn from(value: DType) -> Self {
        match value {
            DType::F32 => onnx::tensor_proto::DataType::Float,
            DType::F16 => onnx::tensor_proto::DataType::Float16,
            DType::BF16 => onnx::tensor_proto::DataType::Bfloat16,
            DType::I32 => onnx::tensor_proto::DataType::Int32,
            DType::I64 => onnx::tensor_proto::DataType::Int64,
        }
    }
}

impl core::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub trait Tensor {
    fn dtype(&self) -> DType;
    fn shape(&self) -> &Shape;
    fn rank(&self) -> usize {
        self.shape().rank()
    }
    fn to_value_info_proto(&self, name: String) -> ValueInfoProto {
        ValueInfoProto{
            name,
            r#type: Some(
                onnx::TypeProto{
                    value: Some(
                        onnx::type_proto::Value::TensorType(onnx::type_proto::Tensor {
                            elem_type: onnx::tensor_proto::DataType::from(self.dtype()) as i32,
                            shape: Some(self.shape().into())
                        })
                    ),
                    denotation: String::new()
                }
            ),
            .. Default::default()
        }
    }

    /// The node computing this tensor, if any. Graph inputs and parameters have none.
    fn get_producer(&self) -> Option<&dyn Node> {
        None
    }

    fn get_name(&self) -> Option<&str> {
        None
    }

    /// The value of this tensor if it is known without running the graph.
    fn resolve_data(&self) -> Option<TensorData> {
        None
    }

    fn is_input(&self) -> bool;
}

impl<'a> PartialEq for &'a dyn Tensor{
    fn eq(&self, other:&Self) -> bool{
        std::ptr::addr_eq(*self, *other)
    }
}

impl<'a> Eq for &'a dyn Tensor{}

impl<'a> Hash for &'a dyn Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let a: *const _ = *self;
        let address: *const u8 = a.cast();
        state.write_usize(address.addr());
    }
}

impl <T: SingleOutputNode> Tensor for T {
    fn dtype(&self) -> DType {
        self.get_output_dtype()
    }

    fn shape(&self) -> &Shape {
        self.get_output_shape()
    }

    fn get_producer(&self) -> Option<&dyn Node> {
        Some(self)
    }

    fn resolve_data(&self) -> Option<TensorData> {
        self.resolve_output_data()
    }

    fn is_input(&self) -> bool {
        false
    }
}

pub struct InputTensor {
    data_type: DType,
    name: String,
    shape: Shape
}

impl InputTensor {
    pub fn new(name: String, data_type: DType, shape: Shape) -> Arc<Self> {
        Arc::new(Self {name, data_type, shape })
    }
}

impl Tensor for InputTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn is_input(&self) -> bool {
        true
    }
}

/// A named, fixed-valued tensor such as a trained weight. Always exported as an initializer.
pub struct ParameterTensor {
    name: String,
    data: TensorData
}

impl ParameterTensor {
    pub fn new(name: String, data: TensorData) -> Arc<Self> {
        Arc::new(Self {name, data})
    }
}

impl Tensor for ParameterTensor {
    fn dtype(&self) -> DType {
        self.data.dtype()
    }

    fn shape(&self) -> &Shape {
        self.data.shape()
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn resolve_data(&self) -> Option<TensorData> {
        Some(self.data.clone())
    }

    fn is_input(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorDataValue {
    F32(Vec<f32>),
    BF16(Vec<half::bf16>),
    F16(Vec<half::f16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl TensorDataValue {
    pub fn len(&self) -> usize {
        match self {
            TensorDataValue::F32(v) => v.len(),
            TensorDataValue::I32(v) => v.len(),
            TensorDataValue::BF16(v) => v.len(),
            TensorDataValue::F16(v) => v.len(),
            TensorDataValue::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorDataValue::F32(_) => DType::F32,
            TensorDataValue::BF16(_) => DType::BF16,
            TensorDataValue::F16(_) => DType::F16,
            TensorDataValue::I32(_) => DType::I32,
            TensorDataValue::I64(_) => DType::I64,
        }
    }

    pub fn get_raw_encoding(&self) -> Vec<u8> {
        match self {
            TensorDataValue::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::BF16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::F16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    pub fn from_raw_encoding(dtype: DType, data: &[u8]) -> Result<Self, Error> {
        if data.len() % dtype.size_in_bytes() != 0 {
            Err(Error::InvalidInputError)?
        }
        Ok(match dtype {
            DType::F32 => TensorDataValue::F32(
                data.chunks_exact(4).map(|x| f32::from_le_bytes([x[0], x[1], x[2], x[3]])).collect()
            ),
            DType::F16 => TensorDataValue::F16(
                data.chunks_exact(2).map(|x| half::f16::from_le_bytes([x[0], x[1]])).collect()
            ),
            DType::BF16 => TensorDataValue::BF16(
                data.chunks_exact(2).map(|x| half::bf16::from_le_bytes([x[0], x[1]])).collect()
            ),
            DType::I32 => TensorDataValue::I32(
                data.chunks_exact(4).map(|x| i32::from_le_bytes([x[0], x[1], x[2], x[3]])).collect()
            ),
            DType::I64 => TensorDataValue::I64(
                data.chunks_exact(8).map(|x| i64::from_le_bytes([x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7]])).collect()
            ),
        })
    }
}

impl From<Vec<f32>> for TensorDataValue {
    fn from(value: Vec<f32>) -> Self {
        TensorDataValue::F32(value)
    }
}

impl From<Vec<half::bf16>> for TensorDataValue {
    fn from(value: Vec<half::bf16>) -> Self {
        TensorDataValue::BF16(value)
    }
}

impl From<Vec<half::f16>> for TensorDataValue {
    fn from(value: Vec<half::f16>) -> Self {
        TensorDataValue::F16(value)
    }
}

impl From<Vec<i32>> for TensorDataValue {
    fn from(value: Vec<i32>) -> Self {
        TensorDataValue::I32(value)
    }
}

impl From<Vec<i64>> for TensorDataValue {
    fn from(value: Vec<i64>) -> Self {
        TensorDataValue::I64(value)
    }
}

#[derive(Debug, Clone)]
pub struct TensorData {
    value: TensorDataValue,
    shape: Shape
}

impl TensorData {
    pub fn new(value: TensorDataValue, shape: Shape) -> Result<Self, Error> {
        if shape.num_elements()? != value.len() {
            return Err(Error::InvalidInputError);
        }
        Ok(Self { value, shape })
    }

    pub fn fill<T>(shape: Shape, value: T) -> Result<Self, Error>
    where
        T: Copy,
        TensorDataValue: From<Vec<T>>,
    {
        let num_elements = shape.num_elements()?;
        let data = vec![value; num_elements];
        Self::new(TensorDataValue::from(data), shape)
    }

    pub fn dtype(&self) -> DType {
        self.value.dtype()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn value(&self) -> &TensorDataValue {
        &self.value
    }

    /// Same elements viewed with another fully resolved shape.
    pub fn reshape(&self, shape: Shape) -> Result<Self, Error> {
        Self::new(self.value.clone(), shape)
    }

    pub fn to_int_vec(&self) -> Result<Vec<i64>, Error> {
        match &self.value {
            TensorDataValue::I32(x) => Ok(x.iter().map(|x| *x as i64).collect()),
            TensorDataValue::I64(x) => Ok(x.clone()),
            _ => Err(Error::UnsupportedDTypeError),
        }
    }

    /// Float values widened to f32.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>, Error> {
        match &self.value {
            TensorDataValue::F32(x) => Ok(x.clone()),
            TensorDataValue::F16(x) => Ok(x.iter().map(|x| x.to_f32()).collect()),
            TensorDataValue::BF16(x) => Ok(x.iter().map(|x| x.to_f32()).collect()),
            _ => Err(Error::UnsupportedDTypeError),
        }
    }

    pub fn to_f32(&self) -> Result<Self, Error> {
        Self::new(TensorDataValue::F32(self.to_f32_vec()?), self.shape.clone())
    }

    pub fn to_tensor_data_proto(&self, name: Option<String>) -> Result<TensorProto, Error> {
        Ok(TensorProto{
            name: name.unwrap_or_default(),
            data_type: (onnx::tensor_proto::DataType::from(self.value.dtype()) as i32),
            dims: self.shape.resolve()?.iter().map(|x| *x as i64).collect(),
            raw_data: self.value.get_raw_encoding(),
            ..Default::default()
        })
    }

    /// Decodes an embedded initializer, from either `raw_data` or the typed repeated fields.
    pub fn from_tensor_proto(proto: &TensorProto) -> Result<Self, Error> {
        if proto.data_location == onnx::tensor_proto::DataLocation::External as i32 {
            Err(Error::CannotResolveDataError)?
        }
        let dtype = DType::from_onnx(proto.data_type)?;
        let mut dims = vec![];
        for dim in &proto.dims {
            dims.push(usize::try_from(*dim).map_err(|_| Error::InputShapeError)?);
        }
        let shape = Shape::from(dims);
        let value = if !proto.raw_data.is_empty() {
            TensorDataValue::from_raw_encoding(dtype, &proto.raw_data)?
        } else {
            match dtype {
                DType::F32 => TensorDataValue::F32(proto.float_data.clone()),
                DType::I32 => TensorDataValue::I32(proto.int32_data.clone()),
                DType::I64 => TensorDataValue::I64(proto.int64_data.clone()),
                DType::F16 => TensorDataValue::F16(proto.int32_data.iter().map(|x| half::f16::from_bits(*x as u16)).collect()),
                DType::BF16 => TensorDataValue::BF16(proto.int32_data.iter().map(|x| half::bf16::from_bits(*x as u16)).collect()),
            }
        };
        Self::new(value, shape)
    }

    pub fn from_candle_tensor(tensor: &candle_core::Tensor) -> Result<Self, Error> {
        let shape = Shape::from(tensor.shape());
        let flat = tensor.flatten_all()?;
        let value = match tensor.dtype() {
            candle_core::DType::F32 => TensorDataValue::F32(flat.to_vec1()?),
            candle_core::DType::BF16 => TensorDataValue::BF16(flat.to_vec1()?),
            candle_core::DType::F16 => TensorDataValue::F16(flat.to_vec1()?),
            candle_core::DType::I64 => TensorDataValue::I64(flat.to_vec1()?),
            _ => return Err(Error::UnsupportedDTypeError),
        };
        Self::new(value, shape)
    }

    pub fn to_candle_tensor(&self, device: &candle_core::Device) -> Result<candle_core::Tensor, Error> {
        let dims = self.shape.resolve()?;
        let tensor = match &self.value {
            TensorDataValue::F32(v) => candle_core::Tensor::from_slice(v, dims, device)?,
            TensorDataValue::F16(v) => candle_core::Tensor::from_slice(v, dims, device)?,
            TensorDataValue::BF16(v) => candle_core::Tensor::from_slice(v, dims, device)?,
            TensorDataValue::I64(v) => candle_core::Tensor::from_slice(v, dims, device)?,
            TensorDataValue::I32(_) => Err(Error::UnsupportedDTypeError)?,
        };
        Ok(tensor)
    }

    pub(crate) fn to_raw_encoding(&self) -> Vec<u8> {
        self.value.get_raw_encoding()
    }
}
