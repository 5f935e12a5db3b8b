//! Prism intermediate representation.
//!
//! A structured, typed SSA IR for GPU shader programs. Values are produced
//! once by instructions; instructions live in blocks; control instructions
//! own their nested blocks. Module-scope resources are `Var` instructions in
//! the root block.

pub mod arena;
mod binding;
mod builder;
mod display;
mod error;
mod func;
mod instruction;
mod module;
mod types;
pub mod validate;
mod value;

pub use arena::{Arena, Handle, UniqueArena};
pub use binding::{AddressSpace, Binding, BindingPoint, BuiltIn, StorageAccess};
pub use builder::Builder;
pub use display::{dump_module, format_type, format_type_inner, format_value};
pub use error::IrError;
pub use func::{Function, FunctionParam, ShaderStage};
pub use instruction::{
    AtomicStub, BinaryOp, Block, BuiltinFunction, CaseSelector, Instruction, InstructionKind,
    Stub, SwitchCase, UnaryOp,
};
pub use module::{Module, RootIdentifier};
pub use types::{
    ArraySize, Bytes, Scalar, ScalarKind, StructMember, TexelFormat, TextureClass,
    TextureDimension, Type, TypeInner, VectorSize, contains_atomic,
};
pub use validate::{Capabilities, PassValidationError, ValidationError, validate};
pub use value::{Literal, Value, ValueKind};
