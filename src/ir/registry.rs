use thiserror::Error;

use crate::ir::scope::{Scope, ScopeError};
use crate::ir::OpDesc;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("descriptor op type '{desc}' does not match operator '{op}'")]
    TypeMismatch { op: String, desc: String },
    #[error(transparent)]
    Var(#[from] ScopeError),
}

/// An instantiated operator: the op type plus, once attached, its
/// descriptor. Kernel selection and execution happen elsewhere; this layer
/// only validates that a rebuilt descriptor is coherent before it is spliced
/// into the graph.
#[derive(Debug, Clone)]
pub struct Operator {
    pub op_type: String,
    pub desc: Option<OpDesc>,
}

#[derive(Debug, Default)]
pub struct OpRegistry;

impl OpRegistry {
    pub fn instantiate(op_type: &str) -> Operator {
        Operator {
            op_type: op_type.to_string(),
            desc: None,
        }
    }

    /// Binds a descriptor to the operator. Every input that carries a
    /// quantization scale must resolve in the scope; those are the weights a
    /// fuser just converted, and a missing tensor there means the rewrite
    /// went wrong.
    pub fn attach(op: &mut Operator, desc: OpDesc, scope: &Scope) -> Result<(), RegistryError> {
        if desc.op_type != op.op_type {
            return Err(RegistryError::TypeMismatch {
                op: op.op_type.clone(),
                desc: desc.op_type,
            });
        }
        for name in desc.input_scales.keys() {
            scope.resolve(name)?;
        }
        op.desc = Some(desc);
        Ok(())
    }
}
