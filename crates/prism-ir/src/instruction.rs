//! Instructions and blocks.
//!
//! Control flow is structured by construction: `If`, `Loop` and `Switch`
//! own their child blocks, and every function block ends in exactly one
//! terminator. The module root block holds only `Var` declarations.

use serde::{Deserialize, Serialize};

use crate::arena::Handle;
use crate::binding::BindingPoint;
use crate::func::Function;
use crate::value::Value;

/// Unary operators.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum UnaryOp {
    Negate,
    LogicalNot,
    BitwiseNot,
}

/// Binary operators.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    LogicalAnd,
    LogicalOr,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    ShiftLeft,
    ShiftRight,
}

impl BinaryOp {
    /// Returns `true` for operators producing a boolean result.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Equal
                | Self::NotEqual
                | Self::Less
                | Self::LessEqual
                | Self::Greater
                | Self::GreaterEqual
        )
    }
}

/// Built-in functions callable through [`InstructionKind::BuiltinCall`].
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum BuiltinFunction {
    // Numeric
    Abs,
    Clamp,
    Min,
    Max,
    Pow,
    Round,
    Sign,
    Floor,
    Dot,
    Mix,
    Select,
    All,
    // Memory
    ArrayLength,
    // Atomics
    AtomicLoad,
    AtomicStore,
    AtomicAdd,
    AtomicSub,
    AtomicMax,
    AtomicMin,
    AtomicAnd,
    AtomicOr,
    AtomicXor,
    AtomicExchange,
    AtomicCompareExchangeWeak,
    // Textures
    TextureDimensions,
    TextureNumLayers,
    TextureNumLevels,
    TextureNumSamples,
    TextureLoad,
    TextureStore,
    TextureSample,
    TextureSampleLevel,
    TextureSampleBaseClampToEdge,
    // Synchronization
    WorkgroupBarrier,
    StorageBarrier,
}

impl BuiltinFunction {
    /// Source-level name of the builtin.
    pub fn name(self) -> &'static str {
        match self {
            Self::Abs => "abs",
            Self::Clamp => "clamp",
            Self::Min => "min",
            Self::Max => "max",
            Self::Pow => "pow",
            Self::Round => "round",
            Self::Sign => "sign",
            Self::Floor => "floor",
            Self::Dot => "dot",
            Self::Mix => "mix",
            Self::Select => "select",
            Self::All => "all",
            Self::ArrayLength => "arrayLength",
            Self::AtomicLoad => "atomicLoad",
            Self::AtomicStore => "atomicStore",
            Self::AtomicAdd => "atomicAdd",
            Self::AtomicSub => "atomicSub",
            Self::AtomicMax => "atomicMax",
            Self::AtomicMin => "atomicMin",
            Self::AtomicAnd => "atomicAnd",
            Self::AtomicOr => "atomicOr",
            Self::AtomicXor => "atomicXor",
            Self::AtomicExchange => "atomicExchange",
            Self::AtomicCompareExchangeWeak => "atomicCompareExchangeWeak",
            Self::TextureDimensions => "textureDimensions",
            Self::TextureNumLayers => "textureNumLayers",
            Self::TextureNumLevels => "textureNumLevels",
            Self::TextureNumSamples => "textureNumSamples",
            Self::TextureLoad => "textureLoad",
            Self::TextureStore => "textureStore",
            Self::TextureSample => "textureSample",
            Self::TextureSampleLevel => "textureSampleLevel",
            Self::TextureSampleBaseClampToEdge => "textureSampleBaseClampToEdge",
            Self::WorkgroupBarrier => "workgroupBarrier",
            Self::StorageBarrier => "storageBarrier",
        }
    }

    /// Returns `true` for the atomic builtins. Their first argument is a
    /// pointer to an atomic.
    pub fn is_atomic(self) -> bool {
        matches!(
            self,
            Self::AtomicLoad
                | Self::AtomicStore
                | Self::AtomicAdd
                | Self::AtomicSub
                | Self::AtomicMax
                | Self::AtomicMin
                | Self::AtomicAnd
                | Self::AtomicOr
                | Self::AtomicXor
                | Self::AtomicExchange
                | Self::AtomicCompareExchangeWeak
        )
    }
}

/// Atomic operations that have not been lowered to builtins yet.
///
/// Front-ends that cannot see the final memory types emit these on plain
/// (non-atomic) pointers; the atomics pass retypes the memory and replaces
/// them with [`BuiltinFunction`] calls.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum AtomicStub {
    Load,
    Store,
    Exchange,
    CompareExchange,
    IAdd,
    ISub,
    SMax,
    SMin,
    UMax,
    UMin,
    And,
    Or,
    Xor,
    IIncrement,
    IDecrement,
    FAdd,
    FMin,
    FMax,
}

impl AtomicStub {
    pub fn name(self) -> &'static str {
        match self {
            Self::Load => "atomic_load",
            Self::Store => "atomic_store",
            Self::Exchange => "atomic_exchange",
            Self::CompareExchange => "atomic_compare_exchange",
            Self::IAdd => "atomic_iadd",
            Self::ISub => "atomic_isub",
            Self::SMax => "atomic_smax",
            Self::SMin => "atomic_smin",
            Self::UMax => "atomic_umax",
            Self::UMin => "atomic_umin",
            Self::And => "atomic_and",
            Self::Or => "atomic_or",
            Self::Xor => "atomic_xor",
            Self::IIncrement => "atomic_iincrement",
            Self::IDecrement => "atomic_idecrement",
            Self::FAdd => "atomic_fadd",
            Self::FMin => "atomic_fmin",
            Self::FMax => "atomic_fmax",
        }
    }

    /// Returns `true` for floating-point atomics.
    pub fn is_float(self) -> bool {
        matches!(self, Self::FAdd | Self::FMin | Self::FMax)
    }
}

/// A placeholder operation awaiting lowering by a later pass.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Stub {
    Atomic(AtomicStub),
}

impl Stub {
    pub fn name(self) -> &'static str {
        match self {
            Self::Atomic(a) => a.name(),
        }
    }
}

/// A selector of a switch case.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum CaseSelector {
    Value(i32),
    Default,
}

/// A case of a switch instruction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub selectors: Vec<CaseSelector>,
    pub block: Handle<Block>,
}

/// The operation performed by an instruction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum InstructionKind {
    /// Declares a variable. The result is a pointer to its storage.
    Var {
        binding: Option<BindingPoint>,
        initializer: Option<Handle<Value>>,
    },
    /// Names a value.
    Let { value: Handle<Value> },
    /// Reads through a pointer.
    Load { from: Handle<Value> },
    /// Writes through a pointer.
    Store {
        to: Handle<Value>,
        value: Handle<Value>,
    },
    /// Indexes into a composite, or a pointer to one.
    Access {
        object: Handle<Value>,
        indices: Vec<Handle<Value>>,
    },
    /// Builds a composite from its components.
    Construct { args: Vec<Handle<Value>> },
    /// Numeric conversion.
    Convert { value: Handle<Value> },
    /// Reinterprets bits.
    Bitcast { value: Handle<Value> },
    /// Selects vector components.
    Swizzle {
        object: Handle<Value>,
        indices: Vec<u32>,
    },
    Unary {
        op: UnaryOp,
        value: Handle<Value>,
    },
    Binary {
        op: BinaryOp,
        left: Handle<Value>,
        right: Handle<Value>,
    },
    /// Calls a user function.
    Call {
        function: Handle<Function>,
        args: Vec<Handle<Value>>,
    },
    /// Calls a builtin function.
    BuiltinCall {
        builtin: BuiltinFunction,
        args: Vec<Handle<Value>>,
    },
    /// A placeholder operation.
    Stub { stub: Stub, args: Vec<Handle<Value>> },
    If {
        condition: Handle<Value>,
        accept: Handle<Block>,
        reject: Handle<Block>,
    },
    Loop {
        body: Handle<Block>,
        continuing: Handle<Block>,
    },
    Switch {
        selector: Handle<Value>,
        cases: Vec<SwitchCase>,
    },
    // Terminators
    Return { value: Option<Handle<Value>> },
    ExitIf,
    ExitSwitch,
    ExitLoop,
    Continue,
    NextIteration,
    BreakIf { condition: Handle<Value> },
    Unreachable,
}

impl InstructionKind {
    /// Returns the value operands in order.
    pub fn operands(&self) -> Vec<Handle<Value>> {
        match *self {
            Self::Var { initializer, .. } => initializer.into_iter().collect(),
            Self::Let { value }
            | Self::Convert { value }
            | Self::Bitcast { value }
            | Self::Unary { value, .. } => vec![value],
            Self::Load { from } => vec![from],
            Self::Store { to, value } => vec![to, value],
            Self::Access {
                object,
                ref indices,
            } => std::iter::once(object).chain(indices.iter().copied()).collect(),
            Self::Swizzle { object, .. } => vec![object],
            Self::Binary { left, right, .. } => vec![left, right],
            Self::Construct { ref args }
            | Self::Call { ref args, .. }
            | Self::BuiltinCall { ref args, .. }
            | Self::Stub { ref args, .. } => args.clone(),
            Self::If { condition, .. } | Self::BreakIf { condition } => vec![condition],
            Self::Switch { selector, .. } => vec![selector],
            Self::Return { value } => value.into_iter().collect(),
            Self::Loop { .. }
            | Self::ExitIf
            | Self::ExitSwitch
            | Self::ExitLoop
            | Self::Continue
            | Self::NextIteration
            | Self::Unreachable => Vec::new(),
        }
    }

    /// Returns mutable references to the value operands, in the same order
    /// as [`operands`](Self::operands).
    pub fn operands_mut(&mut self) -> Vec<&mut Handle<Value>> {
        match self {
            Self::Var { initializer, .. } => initializer.iter_mut().collect(),
            Self::Let { value }
            | Self::Convert { value }
            | Self::Bitcast { value }
            | Self::Unary { value, .. } => vec![value],
            Self::Load { from } => vec![from],
            Self::Store { to, value } => vec![to, value],
            Self::Access { object, indices } => {
                std::iter::once(object).chain(indices.iter_mut()).collect()
            }
            Self::Swizzle { object, .. } => vec![object],
            Self::Binary { left, right, .. } => vec![left, right],
            Self::Construct { args }
            | Self::Call { args, .. }
            | Self::BuiltinCall { args, .. }
            | Self::Stub { args, .. } => args.iter_mut().collect(),
            Self::If { condition, .. } | Self::BreakIf { condition } => vec![condition],
            Self::Switch { selector, .. } => vec![selector],
            Self::Return { value } => value.iter_mut().collect(),
            Self::Loop { .. }
            | Self::ExitIf
            | Self::ExitSwitch
            | Self::ExitLoop
            | Self::Continue
            | Self::NextIteration
            | Self::Unreachable => Vec::new(),
        }
    }

    /// Returns the blocks owned by a control instruction, in execution order.
    pub fn child_blocks(&self) -> Vec<Handle<Block>> {
        match *self {
            Self::If { accept, reject, .. } => vec![accept, reject],
            Self::Loop { body, continuing } => vec![body, continuing],
            Self::Switch { ref cases, .. } => cases.iter().map(|c| c.block).collect(),
            _ => Vec::new(),
        }
    }

    pub fn child_blocks_mut(&mut self) -> Vec<&mut Handle<Block>> {
        match self {
            Self::If { accept, reject, .. } => vec![accept, reject],
            Self::Loop { body, continuing } => vec![body, continuing],
            Self::Switch { cases, .. } => cases.iter_mut().map(|c| &mut c.block).collect(),
            _ => Vec::new(),
        }
    }

    /// Returns `true` if this instruction ends a block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::Return { .. }
                | Self::ExitIf
                | Self::ExitSwitch
                | Self::ExitLoop
                | Self::Continue
                | Self::NextIteration
                | Self::BreakIf { .. }
                | Self::Unreachable
        )
    }

    /// Mnemonic used by the text dump and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Var { .. } => "var",
            Self::Let { .. } => "let",
            Self::Load { .. } => "load",
            Self::Store { .. } => "store",
            Self::Access { .. } => "access",
            Self::Construct { .. } => "construct",
            Self::Convert { .. } => "convert",
            Self::Bitcast { .. } => "bitcast",
            Self::Swizzle { .. } => "swizzle",
            Self::Unary { .. } => "unary",
            Self::Binary { .. } => "binary",
            Self::Call { .. } => "call",
            Self::BuiltinCall { builtin, .. } => builtin.name(),
            Self::Stub { stub, .. } => stub.name(),
            Self::If { .. } => "if",
            Self::Loop { .. } => "loop",
            Self::Switch { .. } => "switch",
            Self::Return { .. } => "return",
            Self::ExitIf => "exit_if",
            Self::ExitSwitch => "exit_switch",
            Self::ExitLoop => "exit_loop",
            Self::Continue => "continue",
            Self::NextIteration => "next_iteration",
            Self::BreakIf { .. } => "break_if",
            Self::Unreachable => "unreachable",
        }
    }
}

/// An instruction placed in (at most) one block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub kind: InstructionKind,
    /// The value produced, if any.
    pub result: Option<Handle<Value>>,
    /// The block currently holding this instruction; `None` once removed.
    pub block: Option<Handle<Block>>,
}

/// An ordered sequence of instructions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub instructions: Vec<Handle<Instruction>>,
    /// The control instruction owning this block. `None` for function entry
    /// blocks and the module root block.
    pub parent: Option<Handle<Instruction>>,
}
