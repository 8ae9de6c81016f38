use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use crate::onnx;
use crate::onnx::attribute_proto::AttributeType;
use crate::tensor::{DType, Shape, Tensor, TensorData};
use crate::Error;

pub trait Node {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor>;

    fn get_name(&self) -> Option<&str> {
        None
    }

    fn get_onnx_type(&self) -> &str;
    fn get_onnx_domain(&self) -> &str {
        ""
    }

    fn get_onnx_attributes(&self) -> Result<Vec<onnx::AttributeProto>, Error> {
        Ok(vec![])
    }

    fn to_node_proto(&self, name: Option<String>, tensor_names: &HashMap<&dyn Tensor, String>) -> Result<onnx::NodeProto, Error> {
        let mut input = vec![];
        for tensor in self.get_input_tensors() {
            input.push(tensor_names.get(&tensor).ok_or(Error::NoSuchTensorError(format!("input of {}", self.get_onnx_type())))?.clone());
        }
        let mut output = vec![];
        for tensor in self.get_output_tensors() {
            output.push(tensor_names.get(&tensor).ok_or(Error::NoSuchTensorError(format!("output of {}", self.get_onnx_type())))?.clone());
        }
        Ok(onnx::NodeProto {
            name: name.unwrap_or_default(),
            input,
            output,
            op_type: self.get_onnx_type().to_string(),
            domain: self.get_onnx_domain().to_string(),
            attribute: self.get_onnx_attributes()?,
            .. Default::default()
        })
    }
}

impl<'a> PartialEq for &'a dyn Node{
    fn eq(&self, other:&Self) -> bool{
        std::ptr::addr_eq(*self, *other)
    }
}

impl<'a> Eq for &'a dyn Node{}

impl<'a> Hash for &'a dyn Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let a: *const _ = *self;
        let address: *const u8 = a.cast();
        state.write_usize(address.addr());
    }
}

pub(crate) trait SingleOutputNode: Node {
    fn get_output_shape(&self) -> &Shape;

    fn get_output_dtype(&self) -> DType;

    fn resolve_output_data(&self) -> Option<TensorData> {
        None
    }
}

pub(crate) fn int_attribute(name: &str, value: i64) -> onnx::AttributeProto {
    onnx::AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Int as i32,
        i: value,
        .. Default::default()
    }
}

pub(crate) fn ints_attribute(name: &str, values: &[i64]) -> onnx::AttributeProto {
    onnx::AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Ints as i32,
        ints: values.to_vec(),
        .. Default::default()
    }
}

pub(crate) fn float_attribute(name: &str, value: f32) -> onnx::AttributeProto {
    onnx::AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Float as i32,
        f: value,
        .. Default::default()
    }
}

pub(crate) fn tensor_attribute(name: &str, value: &TensorData) -> Result<onnx::AttributeProto, Error> {
    Ok(onnx::AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Tensor as i32,
        t: Some(value.to_tensor_data_proto(None)?),
        .. Default::default()
    })
}
