use thiserror::Error;

use crate::ir::graph::{Graph, GraphError, NodeId};
use crate::ir::registry::RegistryError;
use crate::ir::scope::{Scope, ScopeError};
use crate::ir::TensorError;
use crate::pattern::matcher::{find_all, MatchBinding};
use crate::pattern::Pattern;

pub mod channel_wise_dequant;
pub mod delete_quant;
pub mod dequant;
pub mod dynamic_quant;
pub mod quant_dequant;
pub mod quant_util;
pub mod sweep;

#[derive(Error, Debug)]
pub enum PassError {
    #[error("op '{op_type}' is missing attribute '{attr}'")]
    MissingAttr { op_type: String, attr: String },
    #[error("attribute '{attr}' of op '{op_type}' has the wrong type")]
    AttrType { op_type: String, attr: String },
    #[error("match binding has no placeholder '{0}'")]
    MalformedMatch(String),
    #[error("marker op '{marker}' cannot quantize {role} '{arg}'")]
    MarkerMismatch {
        marker: String,
        role: &'static str,
        arg: String,
    },
    #[error("weight '{name}' must be rank 2, got rank {rank}")]
    WeightRank { name: String, rank: usize },
    #[error("tensor '{0}' has an empty buffer")]
    EmptyTensor(String),
    #[error("derived scale for '{name}' is degenerate: {scale}")]
    DegenerateScale { name: String, scale: f32 },
    #[error("op type '{0}' has no known weight slot")]
    UnknownWeightSlot(String),
    #[error("tensor '{name}' is not float32")]
    PrecisionMismatch { name: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Var(#[from] ScopeError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub trait Pass {
    fn apply(&self, graph: &mut Graph, scope: &mut Scope) -> Result<(), PassError>;
}

/// A quantization rewrite rule: one pattern declaration plus one rewrite
/// procedure applied to every occurrence.
pub trait QuantFuser {
    fn build_pattern(&self) -> Pattern;

    fn rewrite(
        &self,
        graph: &mut Graph,
        scope: &mut Scope,
        matched: &MatchBinding,
    ) -> Result<(), PassError>;
}

/// Builds the fuser's pattern once, rewrites every occurrence, then sweeps
/// unreferenced nodes. Returns the number of occurrences rewritten.
pub fn run_fuser(
    fuser: &dyn QuantFuser,
    graph: &mut Graph,
    scope: &mut Scope,
) -> Result<usize, PassError> {
    let pattern = fuser.build_pattern();
    let matches = find_all(graph, &pattern);
    let count = matches.len();
    for matched in &matches {
        fuser.rewrite(graph, scope, matched)?;
    }
    if count > 0 {
        sweep::remove_unreferenced_nodes(graph);
        log::debug!("fuser '{}' rewrote {count} occurrence(s)", pattern.name);
    }
    Ok(count)
}

impl<T: QuantFuser> Pass for T {
    fn apply(&self, graph: &mut Graph, scope: &mut Scope) -> Result<(), PassError> {
        run_fuser(self, graph, scope).map(|_| ())
    }
}

/// Runs registered passes sequentially over one graph.
#[derive(Default)]
pub struct Optimizer {
    passes: Vec<Box<dyn Pass>>,
}

impl Optimizer {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    pub fn run(&self, graph: &mut Graph, scope: &mut Scope) -> Result<(), PassError> {
        for pass in &self.passes {
            pass.apply(graph, scope)?;
        }
        Ok(())
    }
}

pub(crate) fn require(binding: &MatchBinding, name: &str) -> Result<NodeId, PassError> {
    binding
        .get(name)
        .ok_or_else(|| PassError::MalformedMatch(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Attribute, OpDesc, Precision, Tensor};
    use crate::optimizer::delete_quant::DeleteQuantOpFuser;
    use crate::optimizer::dequant::{DequantOpFuser, DEQUANT_OP};

    const QUANT: &str = "fake_quantize_moving_average_abs_max";

    /// Full marker chain around one conv:
    /// act -> quant -> act_q -> conv2d -> conv_out -> dequant -> deq_out
    fn quantized_model(scope: &mut Scope) -> Graph {
        let mut g = Graph::new();
        let act = g.add_arg("act", false);
        let in_scale = g.add_arg("in_scale", false);

        let mut quant = OpDesc::new(QUANT);
        quant.set_input("X", vec!["act".to_string()]);
        quant.set_input("InScale", vec!["in_scale".to_string()]);
        quant.set_output("Out", vec!["act_q".to_string()]);
        quant.set_output("OutScale", vec!["out_scale".to_string()]);
        quant.set_attr("bit_length", Attribute::Int(8));
        let quant_id = g.add_op(quant);
        let act_q = g.add_arg("act_q", false);
        let out_scale = g.add_arg("out_scale", false);

        let mut conv = OpDesc::new("conv2d");
        conv.set_input("Input", vec!["act_q".to_string()]);
        conv.set_input("Filter", vec!["w".to_string()]);
        conv.set_output("Output", vec!["conv_out".to_string()]);
        let conv_id = g.add_op(conv);
        let w = g.add_arg("w", true);
        let conv_out = g.add_arg("conv_out", false);

        let mut deq = OpDesc::new(DEQUANT_OP);
        deq.set_input("X", vec!["conv_out".to_string()]);
        deq.set_output("Out", vec!["deq_out".to_string()]);
        deq.set_attr("max_range", Attribute::Float(127.0 * 127.0 / 2.0));
        let deq_id = g.add_op(deq);
        let deq_out = g.add_arg("deq_out", false);

        g.link(act, quant_id).unwrap();
        g.link(in_scale, quant_id).unwrap();
        g.link(quant_id, act_q).unwrap();
        g.link(quant_id, out_scale).unwrap();
        g.link(act_q, conv_id).unwrap();
        g.link(w, conv_id).unwrap();
        g.link(conv_id, conv_out).unwrap();
        g.link(conv_out, deq_id).unwrap();
        g.link(deq_id, deq_out).unwrap();

        scope.insert("out_scale", Tensor::from_f32(vec![1], vec![0.5]));
        scope.insert("w", Tensor::from_f32(vec![16, 3, 3, 3], vec![100.0; 16 * 27]));
        g
    }

    #[test]
    fn pipeline_folds_both_markers() {
        let mut scope = Scope::new();
        let mut g = quantized_model(&mut scope);

        let mut optimizer = Optimizer::new();
        optimizer.add_pass(Box::new(DeleteQuantOpFuser::new(QUANT)));
        optimizer.add_pass(Box::new(DequantOpFuser::new("conv2d")));
        optimizer.run(&mut g, &mut scope).unwrap();
        g.verify().unwrap();

        // Only act, w, the rebuilt conv and deq_out survive.
        assert_eq!(g.len(), 4);
        let conv_id = g.node_ids().find(|&id| g.op_desc(id).is_ok()).unwrap();
        let conv = g.op_desc(conv_id).unwrap();
        assert_eq!(conv.op_type, "conv2d");
        assert_eq!(conv.input("Input").unwrap(), ["act".to_string()]);
        assert_eq!(conv.output("Output").unwrap(), ["deq_out".to_string()]);
        assert_eq!(conv.attr("enable_int8"), Some(&Attribute::Bool(true)));

        // Activation scale from the quant marker, weight scale from max_range.
        assert!((conv.input_scale("act").unwrap()[0] - 0.5 / 127.0).abs() < 1e-9);
        let w_scales = conv.input_scale("w").unwrap();
        assert_eq!(w_scales.len(), 16);
        assert!((w_scales[0] - 2.0 / 127.0).abs() < 1e-6);
        assert_eq!(scope.resolve("w").unwrap().precision, Precision::Int8);
    }

    #[test]
    fn pipeline_without_markers_is_a_noop() {
        let mut g = Graph::new();
        let a = g.add_arg("a", false);
        let mut relu = OpDesc::new("relu");
        relu.set_input("X", vec!["a".to_string()]);
        relu.set_output("Out", vec!["b".to_string()]);
        let relu_id = g.add_op(relu);
        let b = g.add_arg("b", false);
        g.link(a, relu_id).unwrap();
        g.link(relu_id, b).unwrap();
        let mut scope = Scope::new();

        let mut optimizer = Optimizer::new();
        optimizer.add_pass(Box::new(DeleteQuantOpFuser::new(QUANT)));
        optimizer.add_pass(Box::new(DequantOpFuser::new("conv2d")));
        optimizer.run(&mut g, &mut scope).unwrap();

        assert_eq!(g.len(), 3);
        g.verify().unwrap();
    }
}
