use crate::ir::OpDesc;
use crate::optimizer::PassError;

/// Maximum representable signed magnitude for a quantization bit width.
pub fn quant_range(bit_length: i64) -> f32 {
    ((1i64 << (bit_length - 1)) - 1) as f32
}

pub(crate) fn require_int_attr(desc: &OpDesc, attr: &str) -> Result<i64, PassError> {
    match desc.attr(attr) {
        Some(crate::ir::Attribute::Int(v)) => Ok(*v),
        Some(_) => Err(PassError::AttrType {
            op_type: desc.op_type.clone(),
            attr: attr.to_string(),
        }),
        None => Err(PassError::MissingAttr {
            op_type: desc.op_type.clone(),
            attr: attr.to_string(),
        }),
    }
}

pub(crate) fn require_float_attr(desc: &OpDesc, attr: &str) -> Result<f32, PassError> {
    match desc.attr(attr) {
        Some(crate::ir::Attribute::Float(v)) => Ok(*v),
        Some(_) => Err(PassError::AttrType {
            op_type: desc.op_type.clone(),
            attr: attr.to_string(),
        }),
        None => Err(PassError::MissingAttr {
            op_type: desc.op_type.clone(),
            attr: attr.to_string(),
        }),
    }
}

pub(crate) fn require_ints_attr<'a>(desc: &'a OpDesc, attr: &str) -> Result<&'a [i64], PassError> {
    match desc.attr(attr) {
        Some(crate::ir::Attribute::Ints(v)) => Ok(v),
        Some(_) => Err(PassError::AttrType {
            op_type: desc.op_type.clone(),
            attr: attr.to_string(),
        }),
        None => Err(PassError::MissingAttr {
            op_type: desc.op_type.clone(),
            attr: attr.to_string(),
        }),
    }
}

/// Maximum absolute value over a flat float buffer. Callers guard against
/// empty input.
pub fn find_abs_max(values: &[f32]) -> f32 {
    values.iter().fold(0.0f32, |acc, v| acc.max(v.abs()))
}

/// Closed classification of the op types this pass family quantizes, with
/// the slot and axis conventions each family uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpFamily {
    Conv,
    MatMul,
    Other,
}

impl OpFamily {
    pub fn of(op_type: &str) -> Self {
        match op_type {
            "conv2d" | "depthwise_conv2d" | "conv2d_transpose" => OpFamily::Conv,
            "mul" | "matmul" => OpFamily::MatMul,
            _ => OpFamily::Other,
        }
    }

    /// Input slot holding the weight tensor.
    pub fn weight_argname(self) -> Option<&'static str> {
        match self {
            OpFamily::Conv => Some("Filter"),
            OpFamily::MatMul => Some("Y"),
            OpFamily::Other => None,
        }
    }

    /// (activation input slot, output slot) used when rebuilding the op
    /// descriptor.
    pub fn io_slots(self) -> Option<(&'static str, &'static str)> {
        match self {
            OpFamily::Conv => Some(("Input", "Output")),
            OpFamily::MatMul => Some(("X", "Out")),
            OpFamily::Other => None,
        }
    }

    /// Weight axis whose length gives the output-channel count: conv weights
    /// are `[Cout, Cin, kh, kw]`, fc weights are `[Cin, Cout]`.
    pub fn channel_axis(self) -> Option<usize> {
        match self {
            OpFamily::Conv => Some(0),
            OpFamily::MatMul => Some(1),
            OpFamily::Other => None,
        }
    }
}

pub fn weight_argname(op_type: &str) -> Option<&'static str> {
    OpFamily::of(op_type).weight_argname()
}

/// Quantization axis for a weight consumed by `op_type`: 0 for conv2d and
/// depthwise_conv2d, 1 for everything else (conv2d_transpose, mul, matmul).
pub fn quant_axis(op_type: &str) -> usize {
    match op_type {
        "conv2d" | "depthwise_conv2d" => 0,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_for_common_widths() {
        assert_eq!(quant_range(8), 127.0);
        assert_eq!(quant_range(16), 32767.0);
    }

    #[test]
    fn abs_max_ignores_sign() {
        assert_eq!(find_abs_max(&[0.5, -2.0, 1.5]), 2.0);
        assert_eq!(find_abs_max(&[]), 0.0);
    }

    #[test]
    fn weight_slots_per_family() {
        assert_eq!(weight_argname("conv2d"), Some("Filter"));
        assert_eq!(weight_argname("depthwise_conv2d"), Some("Filter"));
        assert_eq!(weight_argname("conv2d_transpose"), Some("Filter"));
        assert_eq!(weight_argname("mul"), Some("Y"));
        assert_eq!(weight_argname("matmul"), Some("Y"));
        assert_eq!(weight_argname("softmax"), None);
    }

    #[test]
    fn quant_axis_is_zero_only_for_plain_conv() {
        assert_eq!(quant_axis("conv2d"), 0);
        assert_eq!(quant_axis("depthwise_conv2d"), 0);
        assert_eq!(quant_axis("conv2d_transpose"), 1);
        assert_eq!(quant_axis("mul"), 1);
        assert_eq!(quant_axis("matmul"), 1);
    }
}
