use std::collections::HashMap;

use thiserror::Error;

use crate::ir::Tensor;

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("variable '{0}' not found in scope")]
    VarNotFound(String),
}

/// Variable store mapping argument names to their tensors. Lookup failure is
/// a programming error in the surrounding pass, surfaced as `VarNotFound`.
#[derive(Debug, Default)]
pub struct Scope {
    vars: HashMap<String, Tensor>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.vars.insert(name.into(), tensor);
    }

    pub fn resolve(&self, name: &str) -> Result<&Tensor, ScopeError> {
        self.vars
            .get(name)
            .ok_or_else(|| ScopeError::VarNotFound(name.to_string()))
    }

    pub fn resolve_mut(&mut self, name: &str) -> Result<&mut Tensor, ScopeError> {
        self.vars
            .get_mut(name)
            .ok_or_else(|| ScopeError::VarNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }
}
