use crate::ir::graph::Graph;
use crate::ir::registry::OpRegistry;
use crate::ir::scope::Scope;
use crate::ir::{Attribute, Rounding};
use crate::optimizer::quant_util::{quant_range, require_ints_attr, OpFamily};
use crate::optimizer::{require, PassError, QuantFuser};
use crate::pattern::matcher::MatchBinding;
use crate::pattern::Pattern;

pub const CHANNEL_WISE_DEQUANT_OP: &str = "fake_channel_wise_dequantize_max_abs";

/// Per-channel variant of [`DequantOpFuser`](crate::optimizer::dequant::DequantOpFuser):
/// the dequantize op carries a channel-scale vector argument and a
/// `quant_bits` attribute, and every output channel gets its own scale. The
/// weight cast rounds instead of truncating.
pub struct ChannelWiseDequantOpFuser {
    quantized_op_type: String,
}

impl ChannelWiseDequantOpFuser {
    pub fn new(quantized_op_type: impl Into<String>) -> Self {
        Self {
            quantized_op_type: quantized_op_type.into(),
        }
    }
}

impl QuantFuser for ChannelWiseDequantOpFuser {
    fn build_pattern(&self) -> Pattern {
        let ty = self.quantized_op_type.as_str();
        let weight_slot = OpFamily::of(ty).weight_argname().unwrap_or("");
        let mut p = Pattern::new("channel_wise_dequant_op");
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
            .assert_is_op_input(CHANNEL_WISE_DEQUANT_OP, Some("X"))
            .as_intermediate()
            .id();
        // The activation in-scale argument was already deleted by
        // DeleteQuantOpFuser, so only the channel-scale vector remains.
        let channel_scale = p
            .var_node("dequant_op_channel_scale")
            .assert_is_op_input(CHANNEL_WISE_DEQUANT_OP, None)
            .as_intermediate()
            .id();
        let dequant_op = p
            .op_node("dequant_op", CHANNEL_WISE_DEQUANT_OP)
            .as_intermediate()
            .id();
        let dequant_op_out = p
            .var_node("dequant_op_out")
            .assert_is_op_output(CHANNEL_WISE_DEQUANT_OP, Some("Out"))
            .as_output()
            .id();
        p.links_from(quantized_op, &[input, weight]);
        p.links_from(quantized_op_out, &[quantized_op]);
        p.links_from(dequant_op, &[quantized_op_out, channel_scale]);
        p.links_from(dequant_op_out, &[dequant_op]);
        log::trace!("built channel_wise_dequant_op pattern for '{ty}'");
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
        let channel_scale = require(matched, "dequant_op_channel_scale")?;
        let dequant_op = require(matched, "dequant_op")?;
        let dequant_op_out = require(matched, "dequant_op_out")?;

        let input_name = graph.arg(input)?.name.clone();
        let weight_name = graph.arg(weight)?.name.clone();
        let channel_scale_name = graph.arg(channel_scale)?.name.clone();
        let dequant_out_name = graph.arg(dequant_op_out)?.name.clone();

        let quant_bits = require_ints_attr(graph.op_desc(dequant_op)?, "quant_bits")?;
        let weight_bit_length =
            *quant_bits
                .first()
                .ok_or_else(|| PassError::MissingAttr {
                    op_type: CHANNEL_WISE_DEQUANT_OP.to_string(),
                    attr: "quant_bits".to_string(),
                })?;
        let range = quant_range(weight_bit_length);

        let channel_scale_tensor = scope.resolve(&channel_scale_name)?;
        let channel_scales = channel_scale_tensor
            .f32_data()
            .ok_or_else(|| PassError::PrecisionMismatch {
                name: channel_scale_name.clone(),
            })?;
        if channel_scales.is_empty() {
            return Err(PassError::EmptyTensor(channel_scale_name));
        }
        let weight_scale: Vec<f32> = channel_scales.iter().map(|s| s / range).collect();
        for (i, &s) in weight_scale.iter().enumerate() {
            if !(s > 0.0) || !s.is_finite() {
                return Err(PassError::DegenerateScale {
                    name: format!("{weight_name}[{i}]"),
                    scale: s,
                });
            }
        }

        let (input_slot, output_slot) = OpFamily::of(ty)
            .io_slots()
            .ok_or_else(|| PassError::UnknownWeightSlot(ty.to_string()))?;

        let mut op_desc = graph.op_desc(quantized_op)?.clone();
        op_desc.set_input(input_slot, vec![input_name]);
        op_desc.set_output(output_slot, vec![dequant_out_name]);
        op_desc.set_attr("enable_int8", Attribute::Bool(true));
        op_desc.set_input_scale(weight_name.clone(), weight_scale);

        let weight_tensor = scope.resolve_mut(&weight_name)?;
        weight_tensor.cast_to_int8(Rounding::Round)?;
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
        graph.remove_node_set(&[quantized_op, quantized_op_out, channel_scale, dequant_op])?;
        log::debug!("fused channel-wise dequant into '{ty}'");
        Ok(())
    }
}
