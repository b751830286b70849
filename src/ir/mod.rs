use std::collections::HashMap;

pub mod graph;
pub mod registry;
pub mod scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Float32,
    Int8,
}

/// Typed tensor storage. The precision tag on the owning [`Tensor`] and the
/// active variant here always change together.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I8(Vec<i8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Round,
    Truncate,
}

#[derive(Debug, Clone)]
pub struct Tensor {
    pub dims: Vec<usize>,
    pub precision: Precision,
    pub persistable: bool,
    pub data: TensorData,
}

impl Tensor {
    pub fn from_f32(dims: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            dims,
            precision: Precision::Float32,
            persistable: false,
            data: TensorData::F32(data),
        }
    }

    pub fn numel(&self) -> usize {
        match &self.data {
            TensorData::F32(v) => v.len(),
            TensorData::I8(v) => v.len(),
        }
    }

    pub fn f32_data(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            TensorData::I8(_) => None,
        }
    }

    pub fn i8_data(&self) -> Option<&[i8]> {
        match &self.data {
            TensorData::I8(v) => Some(v),
            TensorData::F32(_) => None,
        }
    }

    /// Replaces the float buffer with `round(v / scale)` (or the truncated
    /// quotient) as int8, updating the precision tag in the same step. The
    /// logical shape is untouched.
    pub fn quantize_in_place(&mut self, scale: f32, rounding: Rounding) -> Result<(), TensorError> {
        if !(scale > 0.0) || !scale.is_finite() {
            return Err(TensorError::DegenerateScale(scale));
        }
        let src = match &self.data {
            TensorData::F32(v) => v,
            TensorData::I8(_) => return Err(TensorError::AlreadyQuantized),
        };
        let quantized: Vec<i8> = src
            .iter()
            .map(|&v| saturate_i8(apply_rounding(v / scale, rounding)))
            .collect();
        self.data = TensorData::I8(quantized);
        self.precision = Precision::Int8;
        Ok(())
    }

    /// Casts an already-quantized float buffer to int8 without rescaling.
    /// Used when an upstream fake-quant pass left the values in int range.
    pub fn cast_to_int8(&mut self, rounding: Rounding) -> Result<(), TensorError> {
        let src = match &self.data {
            TensorData::F32(v) => v,
            TensorData::I8(_) => return Err(TensorError::AlreadyQuantized),
        };
        let quantized: Vec<i8> = src
            .iter()
            .map(|&v| saturate_i8(apply_rounding(v, rounding)))
            .collect();
        self.data = TensorData::I8(quantized);
        self.precision = Precision::Int8;
        Ok(())
    }
}

fn apply_rounding(v: f32, rounding: Rounding) -> f32 {
    match rounding {
        Rounding::Round => v.round(),
        Rounding::Truncate => v.trunc(),
    }
}

fn saturate_i8(v: f32) -> i8 {
    v.clamp(i8::MIN as f32, i8::MAX as f32) as i8
}

#[derive(thiserror::Error, Debug)]
pub enum TensorError {
    #[error("scale must be positive and finite, got {0}")]
    DegenerateScale(f32),
    #[error("tensor buffer is already int8")]
    AlreadyQuantized,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Int(i64),
    Float(f32),
    Bool(bool),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
}

/// Operator descriptor: op type, ordered slot->argument-name maps, typed
/// attributes and the per-input quantization-scale table.
#[derive(Debug, Clone)]
pub struct OpDesc {
    pub op_type: String,
    inputs: Vec<(String, Vec<String>)>,
    outputs: Vec<(String, Vec<String>)>,
    pub attrs: HashMap<String, Attribute>,
    pub input_scales: HashMap<String, Vec<f32>>,
}

impl OpDesc {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: HashMap::new(),
            input_scales: HashMap::new(),
        }
    }

    pub fn set_input(&mut self, slot: impl Into<String>, names: Vec<String>) {
        let slot = slot.into();
        if let Some(entry) = self.inputs.iter_mut().find(|(s, _)| *s == slot) {
            entry.1 = names;
        } else {
            self.inputs.push((slot, names));
        }
    }

    pub fn set_output(&mut self, slot: impl Into<String>, names: Vec<String>) {
        let slot = slot.into();
        if let Some(entry) = self.outputs.iter_mut().find(|(s, _)| *s == slot) {
            entry.1 = names;
        } else {
            self.outputs.push((slot, names));
        }
    }

    pub fn input(&self, slot: &str) -> Option<&[String]> {
        self.inputs
            .iter()
            .find(|(s, _)| s == slot)
            .map(|(_, names)| names.as_slice())
    }

    pub fn output(&self, slot: &str) -> Option<&[String]> {
        self.outputs
            .iter()
            .find(|(s, _)| s == slot)
            .map(|(_, names)| names.as_slice())
    }

    pub fn input_slots(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.inputs.iter().map(|(s, n)| (s.as_str(), n.as_slice()))
    }

    pub fn output_slots(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.outputs.iter().map(|(s, n)| (s.as_str(), n.as_slice()))
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .flat_map(|(_, n)| n.iter().map(String::as_str))
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs
            .iter()
            .flat_map(|(_, n)| n.iter().map(String::as_str))
    }

    /// Slot name under which `name` appears as an input, if any.
    pub fn input_slot_of(&self, name: &str) -> Option<&str> {
        self.inputs
            .iter()
            .find(|(_, names)| names.iter().any(|n| n == name))
            .map(|(s, _)| s.as_str())
    }

    pub fn output_slot_of(&self, name: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|(_, names)| names.iter().any(|n| n == name))
            .map(|(s, _)| s.as_str())
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: Attribute) {
        self.attrs.insert(name.into(), value);
    }

    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attrs.get(name)
    }

    pub fn int_attr(&self, name: &str) -> Option<i64> {
        match self.attrs.get(name) {
            Some(Attribute::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn float_attr(&self, name: &str) -> Option<f32> {
        match self.attrs.get(name) {
            Some(Attribute::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn ints_attr(&self, name: &str) -> Option<&[i64]> {
        match self.attrs.get(name) {
            Some(Attribute::Ints(v)) => Some(v),
            _ => None,
        }
    }

    pub fn set_input_scale(&mut self, arg_name: impl Into<String>, scales: Vec<f32>) {
        self.input_scales.insert(arg_name.into(), scales);
    }

    pub fn input_scale(&self, arg_name: &str) -> Option<&[f32]> {
        self.input_scales.get(arg_name).map(Vec::as_slice)
    }

    /// Renames every input reference from `old` to `new`. A scale recorded
    /// under the old name follows the argument.
    pub fn update_all_inputs(&mut self, old: &str, new: &str) {
        for (_, names) in self.inputs.iter_mut() {
            for name in names.iter_mut() {
                if name == old {
                    *name = new.to_string();
                }
            }
        }
        if let Some(scales) = self.input_scales.remove(old) {
            self.input_scales.insert(new.to_string(), scales);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_rounds_and_retags() {
        let mut t = Tensor::from_f32(vec![4], vec![1.0, -1.0, 0.49, 126.6]);
        t.quantize_in_place(1.0, Rounding::Round).unwrap();
        assert_eq!(t.precision, Precision::Int8);
        assert_eq!(t.i8_data().unwrap(), &[1, -1, 0, 127]);
        assert_eq!(t.dims, vec![4]);
    }

    #[test]
    fn quantize_saturates_out_of_range() {
        let mut t = Tensor::from_f32(vec![2], vec![300.0, -300.0]);
        t.quantize_in_place(1.0, Rounding::Round).unwrap();
        assert_eq!(t.i8_data().unwrap(), &[127, -128]);
    }

    #[test]
    fn quantize_rejects_zero_scale() {
        let mut t = Tensor::from_f32(vec![1], vec![1.0]);
        assert!(t.quantize_in_place(0.0, Rounding::Round).is_err());
    }

    #[test]
    fn cast_truncates_without_rescaling() {
        let mut t = Tensor::from_f32(vec![3], vec![1.9, -1.9, 0.5]);
        t.cast_to_int8(Rounding::Truncate).unwrap();
        assert_eq!(t.i8_data().unwrap(), &[1, -1, 0]);
    }

    #[test]
    fn update_all_inputs_moves_scale_entry() {
        let mut desc = OpDesc::new("conv2d");
        desc.set_input("Input", vec!["a_quant".to_string()]);
        desc.set_input_scale("a_quant", vec![0.5]);
        desc.update_all_inputs("a_quant", "a");
        assert_eq!(desc.input("Input").unwrap(), ["a".to_string()]);
        assert_eq!(desc.input_scale("a").unwrap(), [0.5]);
        assert!(desc.input_scale("a_quant").is_none());
    }

    #[test]
    fn slot_order_is_preserved() {
        let mut desc = OpDesc::new("mul");
        desc.set_input("X", vec!["x".to_string()]);
        desc.set_input("Y", vec!["w".to_string()]);
        let slots: Vec<&str> = desc.input_slots().map(|(s, _)| s).collect();
        assert_eq!(slots, ["X", "Y"]);
    }
}
