use crate::ir::graph::Graph;
use crate::ir::scope::Scope;
use crate::ir::{Attribute, Rounding};
use crate::optimizer::quant_util::{quant_range, require_float_attr, require_int_attr};
use crate::optimizer::{require, PassError, QuantFuser};
use crate::pattern::matcher::MatchBinding;
use crate::pattern::Pattern;

/// Quantizes the 2-D weight of a dynamically quantized recurrent op (LSTM
/// style gates). The op advertises itself with a `quantization_type`
/// attribute and carries the weight threshold as `"<slot>0_threshold"`.
/// Attribute and tensor storage change only; the topology stays intact.
pub struct DynamicQuantOpFuser {
    op_type: String,
    input_argname: String,
}

impl DynamicQuantOpFuser {
    pub fn new(op_type: impl Into<String>, input_argname: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            input_argname: input_argname.into(),
        }
    }
}

impl QuantFuser for DynamicQuantOpFuser {
    fn build_pattern(&self) -> Pattern {
        let ty = self.op_type.as_str();
        let mut p = Pattern::new("dynamic_quant_op");
        let weight = p
            .var_node("weight_node")
            .assert_is_op_input(ty, Some(&self.input_argname))
            .id();
        let op = p
            .op_node("op_node", ty)
            .assert_has_attr("quantization_type")
            .id();
        p.links_from(op, &[weight]);
        p
    }

    fn rewrite(
        &self,
        graph: &mut Graph,
        scope: &mut Scope,
        matched: &MatchBinding,
    ) -> Result<(), PassError> {
        let op = require(matched, "op_node")?;
        let weight = require(matched, "weight_node")?;
        let weight_name = graph.arg(weight)?.name.clone();

        let weight_tensor = scope.resolve(&weight_name)?;
        if weight_tensor.dims.len() != 2 {
            return Err(PassError::WeightRank {
                name: weight_name,
                rank: weight_tensor.dims.len(),
            });
        }
        let scale_size = weight_tensor.dims[1];
        log::debug!("quantizing recurrent weight '{weight_name}'");

        let desc = graph.op_desc(op)?;
        let bit_length = require_int_attr(desc, "bit_length")?;
        let threshold = require_float_attr(desc, &format!("{}0_threshold", self.input_argname))?;
        let weight_scale = threshold / quant_range(bit_length);
        if !(weight_scale > 0.0) || !weight_scale.is_finite() {
            return Err(PassError::DegenerateScale {
                name: weight_name,
                scale: weight_scale,
            });
        }

        let desc = graph.op_desc_mut(op)?;
        desc.set_attr("enable_int8", Attribute::Bool(true));
        desc.set_attr("bit_length", Attribute::Int(bit_length));
        // Per-column scales across the gate dimension, all equal.
        desc.set_input_scale(weight_name.clone(), vec![weight_scale; scale_size]);

        let weight_tensor = scope.resolve_mut(&weight_name)?;
        weight_tensor.quantize_in_place(weight_scale, Rounding::Round)?;
        weight_tensor.persistable = true;
        Ok(())
    }
}
