use crate::ir::graph::Graph;
use crate::ir::scope::Scope;
use crate::ir::Attribute;
use crate::optimizer::quant_util::{quant_range, require_int_attr};
use crate::optimizer::{require, PassError, QuantFuser};
use crate::pattern::matcher::MatchBinding;
use crate::pattern::Pattern;

/// Folds an activation-quantization marker away: its stored output scale
/// becomes a per-input scale on every downstream consumer, which is then
/// rewired to read the original activation directly. The four marker nodes
/// are removed as a unit.
pub struct DeleteQuantOpFuser {
    quant_op_type: String,
}

impl DeleteQuantOpFuser {
    pub fn new(quant_op_type: impl Into<String>) -> Self {
        Self {
            quant_op_type: quant_op_type.into(),
        }
    }
}

impl QuantFuser for DeleteQuantOpFuser {
    fn build_pattern(&self) -> Pattern {
        let ty = self.quant_op_type.as_str();
        let mut p = Pattern::new("delete_quant_op");
        let input_scale = p
            .var_node("input_scale_node")
            .assert_is_op_input(ty, Some("InScale"))
            .id();
        let input_act = p
            .var_node("input_act_node")
            .assert_is_op_input(ty, Some("X"))
            .id();
        let quant = p.op_node("quant_node", ty).id();
        let output_scale = p
            .var_node("output_scale_node")
            .assert_is_op_output(ty, Some("OutScale"))
            .id();
        let output_act = p
            .var_node("output_act_node")
            .assert_is_op_output(ty, Some("Out"))
            .id();
        p.links_from(quant, &[input_scale, input_act]);
        p.links_from(output_scale, &[quant]);
        p.links_from(output_act, &[quant]);
        log::trace!("built delete_quant_op pattern for '{ty}'");
        p
    }

    fn rewrite(
        &self,
        graph: &mut Graph,
        scope: &mut Scope,
        matched: &MatchBinding,
    ) -> Result<(), PassError> {
        let input_scale = require(matched, "input_scale_node")?;
        let input_act = require(matched, "input_act_node")?;
        let quant = require(matched, "quant_node")?;
        let output_scale = require(matched, "output_scale_node")?;
        let output_act = require(matched, "output_act_node")?;

        let bit_length = require_int_attr(graph.op_desc(quant)?, "bit_length")?;
        let range = quant_range(bit_length);

        let output_scale_name = graph.arg(output_scale)?.name.clone();
        let scale_tensor = scope.resolve(&output_scale_name)?;
        let stored = scale_tensor
            .f32_data()
            .ok_or_else(|| PassError::PrecisionMismatch {
                name: output_scale_name.clone(),
            })?
            .first()
            .copied()
            .ok_or_else(|| PassError::EmptyTensor(output_scale_name.clone()))?;
        let scale_value = stored / range;

        let in_act_name = graph.arg(input_act)?.name.clone();
        let out_act_name = graph.arg(output_act)?.name.clone();

        for consumer in graph.consumers(output_act)? {
            let desc = graph.op_desc_mut(consumer)?;
            // The scale is recorded against the surviving pre-quant name.
            desc.set_input_scale(in_act_name.clone(), vec![scale_value]);
            desc.set_attr("bit_length", Attribute::Int(bit_length));
            desc.update_all_inputs(&out_act_name, &in_act_name);
            graph.unlink(output_act, consumer)?;
            graph.link(input_act, consumer)?;
        }

        graph.unlink(input_act, quant)?;
        graph.remove_node_set(&[input_scale, quant, output_scale, output_act])?;
        log::debug!("folded quant marker over '{in_act_name}' (scale {scale_value})");
        Ok(())
    }
}
