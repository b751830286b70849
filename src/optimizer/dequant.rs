use crate::ir::graph::Graph;
use crate::ir::registry::OpRegistry;
use crate::ir::scope::Scope;
use crate::ir::{Attribute, Rounding};
use crate::optimizer::quant_util::{quant_range, require_float_attr, require_int_attr, OpFamily};
use crate::optimizer::{require, PassError, QuantFuser};
use crate::pattern::matcher::MatchBinding;
use crate::pattern::Pattern;

pub const DEQUANT_OP: &str = "fake_dequantize_max_abs";

/// Folds a per-tensor `fake_dequantize_max_abs` into the quantized op that
/// feeds it. The weight scale is recovered from the dequantize op's
/// `max_range` attribute, the weight buffer is converted to int8 by
/// truncation, and a rebuilt operator replaces the matched op/dequant pair.
pub struct DequantOpFuser {
    quantized_op_type: String,
}

impl DequantOpFuser {
    pub fn new(quantized_op_type: impl Into<String>) -> Self {
        Self {
            quantized_op_type: quantized_op_type.into(),
        }
    }
}

impl QuantFuser for DequantOpFuser {
    fn build_pattern(&self) -> Pattern {
        let ty = self.quantized_op_type.as_str();
        // An unknown op type yields a slot no descriptor uses, so the
        // pattern simply never matches.
        let weight_slot = OpFamily::of(ty).weight_argname().unwrap_or("");
        let mut p = Pattern::new("dequant_op");
        let input = p
            .var_node("quantized_op_input")
            .assert_is_op_input(ty, None)
            .as_input()
            .id();
        let weight = p
            .var_node("quantized_op_weight")
            .assert_is_op_input(ty, Some(weight_slot))
            .as_input()
            .id();
        let quantized_op = p.op_node("quantized_op", ty).as_intermediate().id();
        let quantized_op_out = p
            .var_node("quantized_op_out")
            .assert_is_op_output(ty, None)
            .assert_is_op_input(DEQUANT_OP, Some("X"))
            .as_intermediate()
            .id();
        let dequant_op = p.op_node("dequant_op", DEQUANT_OP).as_intermediate().id();
        let dequant_op_out = p
            .var_node("dequant_op_out")
            .assert_is_op_output(DEQUANT_OP, Some("Out"))
            .as_output()
            .id();
        p.links_from(quantized_op, &[input, weight]);
        p.links_from(quantized_op_out, &[quantized_op]);
        p.links_from(dequant_op, &[quantized_op_out]);
        p.links_from(dequant_op_out, &[dequant_op]);
        log::trace!("built dequant_op pattern for '{ty}'");
        p
    }

    fn rewrite(
        &self,
        graph: &mut Graph,
        scope: &mut Scope,
        matched: &MatchBinding,
    ) -> Result<(), PassError> {
        let ty = self.quantized_op_type.as_str();
        let input = require(matched, "quantized_op_input")?;
        let weight = require(matched, "quantized_op_weight")?;
        let quantized_op = require(matched, "quantized_op")?;
        let quantized_op_out = require(matched, "quantized_op_out")?;
        let dequant_op = require(matched, "dequant_op")?;
        let dequant_op_out = require(matched, "dequant_op_out")?;

        let input_name = graph.arg(input)?.name.clone();
        let weight_name = graph.arg(weight)?.name.clone();
        let dequant_out_name = graph.arg(dequant_op_out)?.name.clone();

        let bit_length = require_int_attr(graph.op_desc(quantized_op)?, "bit_length")?;
        let range = quant_range(bit_length);
        let max_range = require_float_attr(graph.op_desc(dequant_op)?, "max_range")?;
        // max_range was defined upstream as range^2 / max(|weight|), so this
        // recovers max(|weight|) / range.
        let whole_weight_scale = range * range / max_range / range;
        if !(whole_weight_scale > 0.0) || !whole_weight_scale.is_finite() {
            return Err(PassError::DegenerateScale {
                name: weight_name,
                scale: whole_weight_scale,
            });
        }

        let family = OpFamily::of(ty);
        let (input_slot, output_slot) = family
            .io_slots()
            .ok_or_else(|| PassError::UnknownWeightSlot(ty.to_string()))?;
        let channel_axis = family
            .channel_axis()
            .ok_or_else(|| PassError::UnknownWeightSlot(ty.to_string()))?;

        let mut op_desc = graph.op_desc(quantized_op)?.clone();
        op_desc.set_input(input_slot, vec![input_name]);
        op_desc.set_output(output_slot, vec![dequant_out_name]);

        let weight_tensor = scope.resolve_mut(&weight_name)?;
        let scale_size = weight_tensor
            .dims
            .get(channel_axis)
            .copied()
            .ok_or_else(|| PassError::WeightRank {
                name: weight_name.clone(),
                rank: weight_tensor.dims.len(),
            })?;
        op_desc.set_attr("enable_int8", Attribute::Bool(true));
        // Per-tensor quantization stored as a vector: every entry is equal.
        op_desc.set_input_scale(weight_name.clone(), vec![whole_weight_scale; scale_size]);

        // The float values already sit in int range; the cast truncates.
        weight_tensor.cast_to_int8(Rounding::Truncate)?;
        weight_tensor.persistable = true;

        let mut new_op = OpRegistry::instantiate(ty);
        OpRegistry::attach(&mut new_op, op_desc.clone(), scope)?;

        graph.unlink(input, quantized_op)?;
        graph.unlink(weight, quantized_op)?;
        graph.unlink(dequant_op, dequant_op_out)?;
        let new_node = graph.add_op(op_desc);
        graph.link(input, new_node)?;
        graph.link(weight, new_node)?;
        graph.link(new_node, dequant_op_out)?;
        graph.remove_node_set(&[quantized_op, quantized_op_out, dequant_op])?;
        log::debug!("fused dequant into '{ty}', weight scale {whole_weight_scale}");
        Ok(())
    }
}
