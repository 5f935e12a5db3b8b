//! SSA values: literals, zero values, instruction results and parameters.

use serde::{Deserialize, Serialize};

use crate::arena::Handle;
use crate::func::Function;
use crate::instruction::Instruction;
use crate::types::{Scalar, Type};

/// A literal scalar constant.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Bool(bool),
    I32(i32),
    U32(u32),
    F32(f32),
}

impl Literal {
    /// The scalar type of this literal.
    pub fn scalar(self) -> Scalar {
        match self {
            Self::Bool(_) => Scalar::BOOL,
            Self::I32(_) => Scalar::I32,
            Self::U32(_) => Scalar::U32,
            Self::F32(_) => Scalar::F32,
        }
    }

    /// Returns the literal as a non-negative index, if it is an integer.
    pub fn as_index(self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(v),
            Self::I32(v) => u32::try_from(v).ok(),
            _ => None,
        }
    }
}

/// Where a value comes from.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ValueKind {
    /// A literal constant.
    Constant(Literal),
    /// The zero value of the value's type.
    Zero,
    /// The result of an instruction.
    Result(Handle<Instruction>),
    /// The `index`-th parameter of `function`.
    Parameter {
        function: Handle<Function>,
        index: u32,
    },
}

/// A typed SSA value. Each value is defined exactly once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub ty: Handle<Type>,
    pub name: Option<String>,
    pub kind: ValueKind,
}

impl Value {
    /// Returns the literal if this value is a constant.
    pub fn literal(&self) -> Option<Literal> {
        match self.kind {
            ValueKind::Constant(lit) => Some(lit),
            _ => None,
        }
    }

    /// Returns the defining instruction of a result value.
    pub fn instruction(&self) -> Option<Handle<Instruction>> {
        match self.kind {
            ValueKind::Result(inst) => Some(inst),
            _ => None,
        }
    }

    /// Returns `true` for constants and zero values.
    pub fn is_constant(&self) -> bool {
        matches!(self.kind, ValueKind::Constant(_) | ValueKind::Zero)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_scalars() {
        assert_eq!(Literal::Bool(true).scalar(), Scalar::BOOL);
        assert_eq!(Literal::I32(-1).scalar(), Scalar::I32);
        assert_eq!(Literal::U32(7).scalar(), Scalar::U32);
        assert_eq!(Literal::F32(0.5).scalar(), Scalar::F32);
    }

    #[test]
    fn literal_indices() {
        assert_eq!(Literal::U32(3).as_index(), Some(3));
        assert_eq!(Literal::I32(2).as_index(), Some(2));
        assert_eq!(Literal::I32(-2).as_index(), None);
        assert_eq!(Literal::F32(1.0).as_index(), None);
    }
}
