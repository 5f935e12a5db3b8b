//! Functions and entry points.

use serde::{Deserialize, Serialize};

use crate::arena::Handle;
use crate::binding::Binding;
use crate::instruction::Block;
use crate::types::Type;
use crate::value::Value;

/// Pipeline stage of an entry point.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

/// A formal parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionParam {
    /// The parameter value (of kind [`ValueKind::Parameter`](crate::ValueKind::Parameter)).
    pub value: Handle<Value>,
    /// Optional IO binding (entry points only).
    pub binding: Option<Binding>,
}

/// An IR function. Entry points are functions with a [`ShaderStage`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<FunctionParam>,
    pub return_type: Option<Handle<Type>>,
    pub stage: Option<ShaderStage>,
    /// Workgroup size, for compute entry points.
    pub workgroup_size: Option<[u32; 3]>,
    /// The entry block.
    pub block: Handle<Block>,
}

impl Function {
    pub fn is_entry_point(&self) -> bool {
        self.stage.is_some()
    }
}
