use crate::ir::graph::Graph;
use crate::ir::scope::Scope;
use crate::ir::{Attribute, Precision, Rounding};
use crate::optimizer::quant_util::{find_abs_max, quant_axis, quant_range, require_int_attr};
use crate::optimizer::{require, PassError, QuantFuser};
use crate::pattern::matcher::MatchBinding;
use crate::pattern::Pattern;

pub const QUANT_DEQUANT_ABS_MAX: &str = "fake_quantize_dequantize_abs_max";
pub const QUANT_DEQUANT_MOVING_AVG: &str = "fake_quantize_dequantize_moving_average_abs_max";

/// Folds a combined quantize-dequantize marker. Weights are marked with the
/// abs-max variant and rescanned here for their threshold; activations are
/// marked with the moving-average variant and reuse the threshold the
/// training simulator stored in the output-scale argument. A marker applied
/// to the wrong role aborts the pass.
pub struct QuantDequantOpFuser {
    quant_dequant_op_type: String,
}

impl QuantDequantOpFuser {
    pub fn new(quant_dequant_op_type: impl Into<String>) -> Self {
        Self {
            quant_dequant_op_type: quant_dequant_op_type.into(),
        }
    }
}

impl QuantFuser for QuantDequantOpFuser {
    fn build_pattern(&self) -> Pattern {
        let ty = self.quant_dequant_op_type.as_str();
        let mut p = Pattern::new("quant_dequant_op");
        let input_var = p
            .var_node("input_var_node")
            .assert_is_op_input(ty, Some("X"))
            .id();
        let quant_dequant = p.op_node("quant_dequant_node", ty).id();
        let output_scale = p
            .var_node("output_scale_node")
            .assert_is_op_output(ty, Some("OutScale"))
            .id();
        let output_var = p
            .var_node("output_var_node")
            .assert_is_op_output(ty, Some("Out"))
            .id();
        if ty == QUANT_DEQUANT_MOVING_AVG {
            let input_scale = p
                .var_node("input_scale_node")
                .assert_is_op_input(ty, Some("InScale"))
                .id();
            p.links_from(quant_dequant, &[input_scale, input_var]);
        } else {
            p.links_from(quant_dequant, &[input_var]);
        }
        p.links_from(output_scale, &[quant_dequant]);
        p.links_from(output_var, &[quant_dequant]);
        p
    }

    fn rewrite(
        &self,
        graph: &mut Graph,
        scope: &mut Scope,
        matched: &MatchBinding,
    ) -> Result<(), PassError> {
        let ty = self.quant_dequant_op_type.as_str();
        let input_var = require(matched, "input_var_node")?;
        let quant_dequant = require(matched, "quant_dequant_node")?;
        let output_scale = require(matched, "output_scale_node")?;
        let output_var = require(matched, "output_var_node")?;

        let input_var_name = graph.arg(input_var)?.name.clone();
        let output_var_name = graph.arg(output_var)?.name.clone();
        let input_is_weight = graph.arg(input_var)?.is_weight;

        // Threshold: weights are scanned directly, activations reuse the
        // moving-average estimate stored by the simulator.
        let threshold = if input_is_weight {
            if ty != QUANT_DEQUANT_ABS_MAX {
                return Err(PassError::MarkerMismatch {
                    marker: ty.to_string(),
                    role: "weight",
                    arg: input_var_name,
                });
            }
            let weight_tensor = scope.resolve(&input_var_name)?;
            let data = weight_tensor
                .f32_data()
                .ok_or_else(|| PassError::PrecisionMismatch {
                    name: input_var_name.clone(),
                })?;
            if data.is_empty() {
                return Err(PassError::EmptyTensor(input_var_name));
            }
            find_abs_max(data)
        } else {
            if ty != QUANT_DEQUANT_MOVING_AVG {
                return Err(PassError::MarkerMismatch {
                    marker: ty.to_string(),
                    role: "activation",
                    arg: input_var_name,
                });
            }
            let scale_name = graph.arg(output_scale)?.name.clone();
            let scale_tensor = scope.resolve(&scale_name)?;
            scale_tensor
                .f32_data()
                .ok_or_else(|| PassError::PrecisionMismatch {
                    name: scale_name.clone(),
                })?
                .first()
                .copied()
                .ok_or(PassError::EmptyTensor(scale_name))?
        };

        let bit_length = require_int_attr(graph.op_desc(quant_dequant)?, "bit_length")?;
        let scale_value = threshold / quant_range(bit_length);
        if !(scale_value > 0.0) || !scale_value.is_finite() {
            return Err(PassError::DegenerateScale {
                name: input_var_name,
                scale: scale_value,
            });
        }

        for consumer in graph.consumers(output_var)? {
            let desc = graph.op_desc_mut(consumer)?;
            desc.update_all_inputs(&output_var_name, &input_var_name);
            desc.set_attr("bit_length", Attribute::Int(bit_length));

            if input_is_weight {
                let op_type = desc.op_type.clone();
                let axis = quant_axis(&op_type);
                let weight_tensor = scope.resolve(&input_var_name)?;
                let scale_size = weight_tensor.dims.get(axis).copied().ok_or_else(|| {
                    PassError::WeightRank {
                        name: input_var_name.clone(),
                        rank: weight_tensor.dims.len(),
                    }
                })?;
                let desc = graph.op_desc_mut(consumer)?;
                desc.set_input_scale(input_var_name.clone(), vec![scale_value; scale_size]);
                // conv2d_transpose and matmul are not yet supported as int8
                // consumers; their weights stay float.
                if matches!(op_type.as_str(), "mul" | "conv2d" | "depthwise_conv2d") {
                    desc.set_attr("enable_int8", Attribute::Bool(true));
                    let weight_tensor = scope.resolve_mut(&input_var_name)?;
                    if weight_tensor.precision == Precision::Float32 {
                        weight_tensor.quantize_in_place(scale_value, Rounding::Round)?;
                    }
                }
            } else {
                desc.set_input_scale(input_var_name.clone(), vec![scale_value]);
            }

            graph.unlink(output_var, consumer)?;
            graph.link(input_var, consumer)?;
        }

        graph.unlink(input_var, quant_dequant)?;
        let mut nodes2rm = vec![quant_dequant, output_scale, output_var];
        if ty == QUANT_DEQUANT_MOVING_AVG {
            nodes2rm.push(require(matched, "input_scale_node")?);
        }
        graph.remove_node_set(&nodes2rm)?;
        log::debug!(
            "folded quant-dequant marker over '{}' (scale {scale_value})",
            graph.arg(input_var)?.name
        );
        Ok(())
    }
}
