//! Convenience API for emitting instructions.

use crate::Module;
use crate::arena::Handle;
use crate::binding::{AddressSpace, BindingPoint, StorageAccess};
use crate::error::IrError;
use crate::func::Function;
use crate::instruction::{
    BinaryOp, Block, BuiltinFunction, CaseSelector, Instruction, InstructionKind, Stub,
    SwitchCase, UnaryOp,
};
use crate::types::{Type, VectorSize};
use crate::value::{Literal, Value};

/// Emits instructions at an insertion point.
///
/// With no anchor, non-terminators are inserted before the block's
/// terminator (or appended when there is none) and a pushed terminator
/// replaces the existing one. With an anchor, every instruction is inserted
/// immediately before it, so consecutive pushes keep their order.
#[derive(Debug)]
pub struct Builder<'a> {
    module: &'a mut Module,
    block: Handle<Block>,
    anchor: Option<Handle<Instruction>>,
}

impl<'a> Builder<'a> {
    /// Builds at the end of `block`.
    pub fn at_end(module: &'a mut Module, block: Handle<Block>) -> Self {
        Self {
            module,
            block,
            anchor: None,
        }
    }

    /// Builds immediately before `inst`.
    pub fn before(module: &'a mut Module, inst: Handle<Instruction>) -> Result<Self, IrError> {
        let block = module.instructions[inst]
            .block
            .ok_or(IrError::Detached(inst.index()))?;
        Ok(Self {
            module,
            block,
            anchor: Some(inst),
        })
    }

    /// Builds immediately after `inst`.
    pub fn after(module: &'a mut Module, inst: Handle<Instruction>) -> Result<Self, IrError> {
        let (block, pos) = module
            .position(inst)
            .ok_or(IrError::Detached(inst.index()))?;
        let anchor = module.blocks[block].instructions.get(pos + 1).copied();
        Ok(Self {
            module,
            block,
            anchor,
        })
    }

    pub fn module(&mut self) -> &mut Module {
        self.module
    }

    /// The block being built into.
    pub fn block(&self) -> Handle<Block> {
        self.block
    }

    /// Creates an instruction and places it at the insertion point.
    pub fn push(
        &mut self,
        kind: InstructionKind,
        result_ty: Option<Handle<Type>>,
    ) -> Handle<Instruction> {
        let inst = self.module.create_instruction(kind, result_ty);
        self.place(inst);
        inst
    }

    fn push_value(&mut self, kind: InstructionKind, ty: Handle<Type>) -> Handle<Value> {
        let (inst, value) = self.module.create_with_result(kind, ty);
        self.place(inst);
        value
    }

    /// Places a detached instruction at the insertion point.
    pub fn place(&mut self, inst: Handle<Instruction>) {
        let is_terminator = self.module.instructions[inst].kind.is_terminator();
        let anchor_pos = self
            .anchor
            .and_then(|a| self.module.position(a))
            .filter(|&(block, _)| block == self.block)
            .map(|(_, pos)| pos);
        let last = self.module.blocks[self.block].instructions.last().copied();
        let last_is_terminator =
            last.is_some_and(|l| self.module.instructions[l].kind.is_terminator());

        match anchor_pos {
            Some(pos) => self.insert_at(pos, inst),
            None if is_terminator => {
                if let (Some(old), true) = (last, last_is_terminator) {
                    self.module.remove(old);
                }
                self.module.append(self.block, inst);
            }
            None if last_is_terminator => {
                let pos = self.module.blocks[self.block].instructions.len() - 1;
                self.insert_at(pos, inst);
            }
            None => self.module.append(self.block, inst),
        }
    }

    fn insert_at(&mut self, pos: usize, inst: Handle<Instruction>) {
        self.module.blocks[self.block].instructions.insert(pos, inst);
        self.module.instructions[inst].block = Some(self.block);
    }

    // -----------------------------------------------------------------------
    // Constants
    // -----------------------------------------------------------------------

    pub fn u32(&mut self, v: u32) -> Handle<Value> {
        self.module.constant(Literal::U32(v))
    }

    pub fn i32(&mut self, v: i32) -> Handle<Value> {
        self.module.constant(Literal::I32(v))
    }

    pub fn f32(&mut self, v: f32) -> Handle<Value> {
        self.module.constant(Literal::F32(v))
    }

    pub fn bool(&mut self, v: bool) -> Handle<Value> {
        self.module.constant(Literal::Bool(v))
    }

    pub fn zero(&mut self, ty: Handle<Type>) -> Handle<Value> {
        self.module.zero(ty)
    }

    // -----------------------------------------------------------------------
    // Memory
    // -----------------------------------------------------------------------

    /// Declares a variable holding `store_ty` and returns the pointer to it.
    pub fn var(
        &mut self,
        name: impl Into<String>,
        space: AddressSpace,
        store_ty: Handle<Type>,
        access: StorageAccess,
        binding: Option<BindingPoint>,
    ) -> Handle<Value> {
        let ptr = self.module.pointer_ty(space, store_ty, access);
        let value = self.push_value(
            InstructionKind::Var {
                binding,
                initializer: None,
            },
            ptr,
        );
        self.module.set_name(value, name);
        value
    }

    pub fn load(&mut self, from: Handle<Value>) -> Handle<Value> {
        let ptr_ty = self.module.value_type(from);
        let ty = self.module.pointee(ptr_ty).unwrap_or(ptr_ty);
        self.push_value(InstructionKind::Load { from }, ty)
    }

    pub fn store(&mut self, to: Handle<Value>, value: Handle<Value>) -> Handle<Instruction> {
        self.push(InstructionKind::Store { to, value }, None)
    }

    pub fn let_(&mut self, value: Handle<Value>) -> Handle<Value> {
        let ty = self.module.value_type(value);
        self.push_value(InstructionKind::Let { value }, ty)
    }

    /// Indexes `object` with an explicit result type.
    pub fn access(
        &mut self,
        ty: Handle<Type>,
        object: Handle<Value>,
        indices: &[Handle<Value>],
    ) -> Handle<Value> {
        self.push_value(
            InstructionKind::Access {
                object,
                indices: indices.to_vec(),
            },
            ty,
        )
    }

    /// Indexes `object`, deriving the result type from the object type.
    pub fn access_ptr(&mut self, object: Handle<Value>, indices: &[Handle<Value>]) -> Handle<Value> {
        let object_ty = self.module.value_type(object);
        let ty = self
            .module
            .access_result_type(object_ty, indices)
            .unwrap_or(object_ty);
        self.access(ty, object, indices)
    }

    // -----------------------------------------------------------------------
    // Values
    // -----------------------------------------------------------------------

    pub fn construct(&mut self, ty: Handle<Type>, args: &[Handle<Value>]) -> Handle<Value> {
        self.push_value(
            InstructionKind::Construct {
                args: args.to_vec(),
            },
            ty,
        )
    }

    pub fn convert(&mut self, ty: Handle<Type>, value: Handle<Value>) -> Handle<Value> {
        self.push_value(InstructionKind::Convert { value }, ty)
    }

    pub fn bitcast(&mut self, ty: Handle<Type>, value: Handle<Value>) -> Handle<Value> {
        self.push_value(InstructionKind::Bitcast { value }, ty)
    }

    /// Selects components of a vector; a single index yields a scalar.
    pub fn swizzle(&mut self, object: Handle<Value>, indices: &[u32]) -> Handle<Value> {
        let object_ty = self.module.value_type(object);
        let scalar = self.module.types[object_ty].inner.scalar();
        let ty = match (scalar, VectorSize::from_count(indices.len() as u32)) {
            (Some(scalar), Some(size)) => self.module.vec_ty(size, scalar),
            (Some(scalar), None) => self.module.scalar_ty(scalar),
            (None, _) => object_ty,
        };
        self.push_value(
            InstructionKind::Swizzle {
                object,
                indices: indices.to_vec(),
            },
            ty,
        )
    }

    pub fn unary(&mut self, op: UnaryOp, value: Handle<Value>) -> Handle<Value> {
        let ty = self.module.value_type(value);
        self.push_value(InstructionKind::Unary { op, value }, ty)
    }

    pub fn binary(&mut self, op: BinaryOp, left: Handle<Value>, right: Handle<Value>) -> Handle<Value> {
        let (lt, rt) = (self.module.value_type(left), self.module.value_type(right));
        let ty = self.module.binary_result_type(op, lt, rt);
        self.binary_typed(ty, op, left, right)
    }

    pub fn binary_typed(
        &mut self,
        ty: Handle<Type>,
        op: BinaryOp,
        left: Handle<Value>,
        right: Handle<Value>,
    ) -> Handle<Value> {
        self.push_value(InstructionKind::Binary { op, left, right }, ty)
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    pub fn call(&mut self, function: Handle<Function>, args: &[Handle<Value>]) -> Handle<Instruction> {
        let ty = self.module.functions[function].return_type;
        self.push(
            InstructionKind::Call {
                function,
                args: args.to_vec(),
            },
            ty,
        )
    }

    /// Calls a function with a return value.
    pub fn call_value(
        &mut self,
        function: Handle<Function>,
        args: &[Handle<Value>],
    ) -> Option<Handle<Value>> {
        let inst = self.call(function, args);
        self.module.result(inst)
    }

    pub fn builtin(
        &mut self,
        ty: Handle<Type>,
        builtin: BuiltinFunction,
        args: &[Handle<Value>],
    ) -> Handle<Value> {
        self.push_value(
            InstructionKind::BuiltinCall {
                builtin,
                args: args.to_vec(),
            },
            ty,
        )
    }

    /// Calls a builtin without a result.
    pub fn builtin_void(
        &mut self,
        builtin: BuiltinFunction,
        args: &[Handle<Value>],
    ) -> Handle<Instruction> {
        self.push(
            InstructionKind::BuiltinCall {
                builtin,
                args: args.to_vec(),
            },
            None,
        )
    }

    pub fn stub(
        &mut self,
        ty: Option<Handle<Type>>,
        stub: Stub,
        args: &[Handle<Value>],
    ) -> Handle<Instruction> {
        self.push(
            InstructionKind::Stub {
                stub,
                args: args.to_vec(),
            },
            ty,
        )
    }

    // -----------------------------------------------------------------------
    // Control flow
    // -----------------------------------------------------------------------

    /// Emits an `if`. Both branches start out holding a single `exit_if`.
    pub fn if_(
        &mut self,
        condition: Handle<Value>,
    ) -> (Handle<Instruction>, Handle<Block>, Handle<Block>) {
        let accept = self.terminated_block(InstructionKind::ExitIf);
        let reject = self.terminated_block(InstructionKind::ExitIf);
        let inst = self.push(
            InstructionKind::If {
                condition,
                accept,
                reject,
            },
            None,
        );
        (inst, accept, reject)
    }

    /// Emits a `loop`. The body starts with `continue` and the continuing
    /// block with `next_iteration`; callers replace them as needed.
    pub fn loop_(&mut self) -> (Handle<Instruction>, Handle<Block>, Handle<Block>) {
        let body = self.terminated_block(InstructionKind::Continue);
        let continuing = self.terminated_block(InstructionKind::NextIteration);
        let inst = self.push(InstructionKind::Loop { body, continuing }, None);
        (inst, body, continuing)
    }

    /// Emits a `switch` with one case per selector list. Every case starts
    /// out holding a single `exit_switch`.
    pub fn switch(
        &mut self,
        selector: Handle<Value>,
        cases: Vec<Vec<CaseSelector>>,
    ) -> (Handle<Instruction>, Vec<Handle<Block>>) {
        let cases: Vec<_> = cases
            .into_iter()
            .map(|selectors| SwitchCase {
                selectors,
                block: self.terminated_block(InstructionKind::ExitSwitch),
            })
            .collect();
        let blocks = cases.iter().map(|c| c.block).collect();
        let inst = self.push(InstructionKind::Switch { selector, cases }, None);
        (inst, blocks)
    }

    fn terminated_block(&mut self, terminator: InstructionKind) -> Handle<Block> {
        let block = self.module.new_block();
        let inst = self.module.create_instruction(terminator, None);
        self.module.append(block, inst);
        block
    }

    pub fn return_(&mut self, value: Option<Handle<Value>>) -> Handle<Instruction> {
        self.push(InstructionKind::Return { value }, None)
    }

    pub fn exit_if(&mut self) -> Handle<Instruction> {
        self.push(InstructionKind::ExitIf, None)
    }

    pub fn exit_loop(&mut self) -> Handle<Instruction> {
        self.push(InstructionKind::ExitLoop, None)
    }

    pub fn exit_switch(&mut self) -> Handle<Instruction> {
        self.push(InstructionKind::ExitSwitch, None)
    }

    pub fn continue_(&mut self) -> Handle<Instruction> {
        self.push(InstructionKind::Continue, None)
    }

    pub fn next_iteration(&mut self) -> Handle<Instruction> {
        self.push(InstructionKind::NextIteration, None)
    }

    pub fn break_if(&mut self, condition: Handle<Value>) -> Handle<Instruction> {
        self.push(InstructionKind::BreakIf { condition }, None)
    }

    pub fn unreachable(&mut self) -> Handle<Instruction> {
        self.push(InstructionKind::Unreachable, None)
    }
}
