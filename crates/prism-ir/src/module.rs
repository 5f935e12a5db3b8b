//! The [`Module`]: the single mutable aggregate every transform rewrites.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::arena::{Arena, Handle, UniqueArena};
use crate::binding::BindingPoint;
use crate::error::IrError;
use crate::func::{Function, FunctionParam, ShaderStage};
use crate::instruction::{Block, Instruction, InstructionKind};
use crate::types::{Type, TypeInner};
use crate::value::{Literal, Value, ValueKind};

/// A shader module.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Module {
    /// Deduplicated type arena.
    pub types: UniqueArena<Type>,
    pub values: Arena<Value>,
    pub instructions: Arena<Instruction>,
    pub blocks: Arena<Block>,
    pub functions: Arena<Function>,
    /// Module-scope declarations.
    pub root: Handle<Block>,
    /// Live functions in declaration order. Functions missing from this list
    /// are dead and ignored by the validator and the dump.
    pub function_order: Vec<Handle<Function>>,
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

/// The variable or parameter a pointer ultimately refers to, with the
/// access indices applied on the way.
#[derive(Clone, Debug, PartialEq)]
pub struct RootIdentifier {
    /// A `Var` result or a function parameter.
    pub root: Handle<Value>,
    /// Indices from the root to the pointer, outermost first.
    pub indices: Vec<Handle<Value>>,
}

impl Module {
    pub fn new() -> Self {
        let mut blocks = Arena::new();
        let root = blocks.append(Block::default());
        Self {
            types: UniqueArena::new(),
            values: Arena::new(),
            instructions: Arena::new(),
            blocks,
            functions: Arena::new(),
            root,
            function_order: Vec::new(),
        }
    }

    /// Decodes a module from JSON.
    pub fn from_json(text: &str) -> Result<Self, IrError> {
        let module: Self = serde_json::from_str(text)?;
        if !module.blocks.contains(module.root) {
            return Err(IrError::BadHandle {
                index: module.root.index(),
                size: module.blocks.len(),
            });
        }
        Ok(module)
    }

    /// Encodes the module as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, IrError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    // -----------------------------------------------------------------------
    // Values
    // -----------------------------------------------------------------------

    /// Creates a literal constant.
    pub fn constant(&mut self, literal: Literal) -> Handle<Value> {
        let ty = self.scalar_ty(literal.scalar());
        self.values.append(Value {
            ty,
            name: None,
            kind: ValueKind::Constant(literal),
        })
    }

    /// Creates the zero value of `ty`.
    pub fn zero(&mut self, ty: Handle<Type>) -> Handle<Value> {
        self.values.append(Value {
            ty,
            name: None,
            kind: ValueKind::Zero,
        })
    }

    pub fn value_type(&self, value: Handle<Value>) -> Handle<Type> {
        self.values[value].ty
    }

    pub fn type_inner(&self, value: Handle<Value>) -> &TypeInner {
        &self.types[self.values[value].ty].inner
    }

    pub fn set_name(&mut self, value: Handle<Value>, name: impl Into<String>) {
        self.values[value].name = Some(name.into());
    }

    /// Returns the instruction defining `value`, if it is a result.
    pub fn defining_instruction(&self, value: Handle<Value>) -> Option<Handle<Instruction>> {
        self.values[value].instruction()
    }

    /// Returns the literal of a constant index value as `u32`.
    pub fn const_index(&self, value: Handle<Value>) -> Option<u32> {
        match self.values[value].kind {
            ValueKind::Constant(lit) => lit.as_index(),
            ValueKind::Zero => match self.types[self.values[value].ty].inner {
                TypeInner::Scalar(s) if s.is_integer32() => Some(0),
                _ => None,
            },
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Instructions and blocks
    // -----------------------------------------------------------------------

    pub fn new_block(&mut self) -> Handle<Block> {
        self.blocks.append(Block::default())
    }

    /// Creates a detached instruction, with a result of `result_ty` if given.
    /// Child blocks of control instructions are re-parented to it.
    pub fn create_instruction(
        &mut self,
        kind: InstructionKind,
        result_ty: Option<Handle<Type>>,
    ) -> Handle<Instruction> {
        let children = kind.child_blocks();
        let inst = self.instructions.append(Instruction {
            kind,
            result: None,
            block: None,
        });
        if let Some(ty) = result_ty {
            let value = self.values.append(Value {
                ty,
                name: None,
                kind: ValueKind::Result(inst),
            });
            self.instructions[inst].result = Some(value);
        }
        for child in children {
            self.blocks[child].parent = Some(inst);
        }
        inst
    }

    /// Creates a detached instruction producing a value of type `ty`.
    pub fn create_with_result(
        &mut self,
        kind: InstructionKind,
        ty: Handle<Type>,
    ) -> (Handle<Instruction>, Handle<Value>) {
        let inst = self.create_instruction(kind, None);
        let value = self.values.append(Value {
            ty,
            name: None,
            kind: ValueKind::Result(inst),
        });
        self.instructions[inst].result = Some(value);
        (inst, value)
    }

    /// The result value of `inst`, if any.
    pub fn result(&self, inst: Handle<Instruction>) -> Option<Handle<Value>> {
        self.instructions[inst].result
    }

    /// Appends a detached instruction to the end of `block`.
    pub fn append(&mut self, block: Handle<Block>, inst: Handle<Instruction>) {
        self.blocks[block].instructions.push(inst);
        self.instructions[inst].block = Some(block);
    }

    pub(crate) fn position(&self, inst: Handle<Instruction>) -> Option<(Handle<Block>, usize)> {
        let block = self.instructions[inst].block?;
        let pos = self.blocks[block]
            .instructions
            .iter()
            .position(|&i| i == inst)?;
        Some((block, pos))
    }

    /// Inserts a detached instruction immediately before `anchor`.
    pub fn insert_before(
        &mut self,
        anchor: Handle<Instruction>,
        inst: Handle<Instruction>,
    ) -> Result<(), IrError> {
        let (block, pos) = self
            .position(anchor)
            .ok_or(IrError::Detached(anchor.index()))?;
        self.blocks[block].instructions.insert(pos, inst);
        self.instructions[inst].block = Some(block);
        Ok(())
    }

    /// Inserts a detached instruction immediately after `anchor`.
    pub fn insert_after(
        &mut self,
        anchor: Handle<Instruction>,
        inst: Handle<Instruction>,
    ) -> Result<(), IrError> {
        let (block, pos) = self
            .position(anchor)
            .ok_or(IrError::Detached(anchor.index()))?;
        self.blocks[block].instructions.insert(pos + 1, inst);
        self.instructions[inst].block = Some(block);
        Ok(())
    }

    /// Detaches `inst` from its block. The instruction stays in the arena.
    pub fn remove(&mut self, inst: Handle<Instruction>) {
        if let Some((block, pos)) = self.position(inst) {
            self.blocks[block].instructions.remove(pos);
        }
        self.instructions[inst].block = None;
    }

    /// Replaces `old` with the detached instruction `new` at the same
    /// position, redirecting all uses of `old`'s result to `new`'s.
    pub fn replace_with(
        &mut self,
        old: Handle<Instruction>,
        new: Handle<Instruction>,
    ) -> Result<(), IrError> {
        self.insert_before(old, new)?;
        if let (Some(from), Some(to)) = (self.result(old), self.result(new)) {
            self.replace_all_uses(from, to);
        }
        self.remove(old);
        Ok(())
    }

    /// Returns the top-level block enclosing `block`.
    pub fn top_block(&self, mut block: Handle<Block>) -> Handle<Block> {
        while let Some(parent) = self.blocks[block].parent {
            match self.instructions[parent].block {
                Some(b) => block = b,
                None => break,
            }
        }
        block
    }

    /// Returns the function holding `inst`, or `None` for root-block or
    /// detached instructions.
    pub fn function_containing(&self, inst: Handle<Instruction>) -> Option<Handle<Function>> {
        let top = self.top_block(self.instructions[inst].block?);
        self.function_order
            .iter()
            .copied()
            .find(|&f| self.functions[f].block == top)
    }

    /// Returns every instruction in `block` and its nested blocks, in program
    /// order (a control instruction precedes the contents of its blocks).
    pub fn instructions_in(&self, block: Handle<Block>) -> Vec<Handle<Instruction>> {
        let mut out = Vec::new();
        self.collect_instructions(block, &mut out);
        out
    }

    fn collect_instructions(&self, block: Handle<Block>, out: &mut Vec<Handle<Instruction>>) {
        for &inst in &self.blocks[block].instructions {
            out.push(inst);
            for child in self.instructions[inst].kind.child_blocks() {
                self.collect_instructions(child, out);
            }
        }
    }

    /// Every live instruction: the root block followed by each function.
    pub fn all_instructions(&self) -> Vec<Handle<Instruction>> {
        let mut out = self.instructions_in(self.root);
        for &f in &self.function_order {
            self.collect_instructions(self.functions[f].block, &mut out);
        }
        out
    }

    /// Returns `(instruction, operand index)` for every live use of `value`.
    pub fn uses_of(&self, value: Handle<Value>) -> Vec<(Handle<Instruction>, usize)> {
        let mut uses = Vec::new();
        for inst in self.all_instructions() {
            for (i, op) in self.instructions[inst].kind.operands().into_iter().enumerate() {
                if op == value {
                    uses.push((inst, i));
                }
            }
        }
        uses
    }

    /// Redirects every live use of `old` to `new`.
    pub fn replace_all_uses(&mut self, old: Handle<Value>, new: Handle<Value>) {
        for inst in self.all_instructions() {
            for op in self.instructions[inst].kind.operands_mut() {
                if *op == old {
                    *op = new;
                }
            }
        }
    }

    /// Module-scope `Var` instructions in declaration order.
    pub fn root_vars(&self) -> Vec<Handle<Instruction>> {
        self.blocks[self.root]
            .instructions
            .iter()
            .copied()
            .filter(|&i| matches!(self.instructions[i].kind, InstructionKind::Var { .. }))
            .collect()
    }

    /// Binding point of a `Var`.
    pub fn var_binding(&self, inst: Handle<Instruction>) -> Option<BindingPoint> {
        match self.instructions[inst].kind {
            InstructionKind::Var { binding, .. } => binding,
            _ => None,
        }
    }

    /// Walks `Access` and `Let` instructions back from `pointer` to the
    /// variable or parameter it is derived from.
    pub fn root_identifier(&self, pointer: Handle<Value>) -> RootIdentifier {
        let mut current = pointer;
        let mut chains = Vec::new();
        while let Some(inst) = self.defining_instruction(current) {
            match self.instructions[inst].kind {
                InstructionKind::Access {
                    object,
                    ref indices,
                } => {
                    chains.push(indices.clone());
                    current = object;
                }
                InstructionKind::Let { value } => current = value,
                _ => break,
            }
        }
        RootIdentifier {
            root: current,
            indices: chains.into_iter().rev().flatten().collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Functions
    // -----------------------------------------------------------------------

    /// Creates a function with an empty entry block and appends it to the
    /// declaration order.
    pub fn new_function(
        &mut self,
        name: impl Into<String>,
        return_type: Option<Handle<Type>>,
        stage: Option<ShaderStage>,
    ) -> Handle<Function> {
        let block = self.new_block();
        let handle = self.functions.append(Function {
            name: name.into(),
            params: Vec::new(),
            return_type,
            stage,
            workgroup_size: None,
            block,
        });
        self.function_order.push(handle);
        handle
    }

    /// Looks up a live function by name.
    pub fn function_by_name(&self, name: &str) -> Option<Handle<Function>> {
        self.function_order
            .iter()
            .copied()
            .find(|&f| self.functions[f].name == name)
    }

    /// Appends a parameter and returns its value.
    pub fn add_param(
        &mut self,
        function: Handle<Function>,
        ty: Handle<Type>,
        name: impl Into<String>,
    ) -> Handle<Value> {
        let index = self.functions[function].params.len();
        self.insert_param(function, index, ty, name)
    }

    /// Inserts a parameter at `index`, renumbering those after it.
    pub fn insert_param(
        &mut self,
        function: Handle<Function>,
        index: usize,
        ty: Handle<Type>,
        name: impl Into<String>,
    ) -> Handle<Value> {
        let value = self.values.append(Value {
            ty,
            name: Some(name.into()),
            kind: ValueKind::Parameter { function, index: 0 },
        });
        self.functions[function].params.insert(
            index,
            FunctionParam {
                value,
                binding: None,
            },
        );
        self.renumber_params(function);
        value
    }

    /// Removes the parameter at `index`, renumbering those after it.
    pub fn remove_param(&mut self, function: Handle<Function>, index: usize) -> FunctionParam {
        let param = self.functions[function].params.remove(index);
        self.renumber_params(function);
        param
    }

    fn renumber_params(&mut self, function: Handle<Function>) {
        let params: Vec<_> = self.functions[function]
            .params
            .iter()
            .map(|p| p.value)
            .collect();
        for (i, value) in params.into_iter().enumerate() {
            self.values[value].kind = ValueKind::Parameter {
                function,
                index: i as u32,
            };
        }
    }

    /// Removes `function` from the declaration order.
    pub fn remove_function(&mut self, function: Handle<Function>) {
        self.function_order.retain(|&f| f != function);
    }

    /// Every live `Call` instruction targeting `function`.
    pub fn calls_to(&self, function: Handle<Function>) -> Vec<Handle<Instruction>> {
        self.all_instructions()
            .into_iter()
            .filter(|&i| {
                matches!(self.instructions[i].kind, InstructionKind::Call { function: f, .. } if f == function)
            })
            .collect()
    }

    /// Deep-copies `function` under `name`, with fresh parameters, blocks,
    /// instructions and results. The clone is placed right after the
    /// original in declaration order.
    pub fn clone_function(
        &mut self,
        function: Handle<Function>,
        name: impl Into<String>,
    ) -> Handle<Function> {
        let original = self.functions[function].clone();
        let clone = self.functions.append(Function {
            name: name.into(),
            params: Vec::new(),
            return_type: original.return_type,
            stage: original.stage,
            workgroup_size: original.workgroup_size,
            block: original.block,
        });

        let mut map = HashMap::new();
        for (index, param) in original.params.iter().enumerate() {
            let ty = self.values[param.value].ty;
            let name = self.values[param.value].name.clone();
            let value = self.values.append(Value {
                ty,
                name,
                kind: ValueKind::Parameter {
                    function: clone,
                    index: index as u32,
                },
            });
            map.insert(param.value, value);
            self.functions[clone].params.push(FunctionParam {
                value,
                binding: param.binding,
            });
        }
        let block = self.clone_block(original.block, &mut map);
        self.functions[clone].block = block;

        let pos = self
            .function_order
            .iter()
            .position(|&f| f == function)
            .map_or(self.function_order.len(), |p| p + 1);
        self.function_order.insert(pos, clone);
        clone
    }

    fn clone_block(
        &mut self,
        block: Handle<Block>,
        map: &mut HashMap<Handle<Value>, Handle<Value>>,
    ) -> Handle<Block> {
        let new_block = self.new_block();
        let instructions = self.blocks[block].instructions.clone();
        for inst in instructions {
            let mut kind = self.instructions[inst].kind.clone();
            for op in kind.operands_mut() {
                if let Some(&mapped) = map.get(op) {
                    *op = mapped;
                }
            }
            for child in kind.child_blocks_mut() {
                *child = self.clone_block(*child, map);
            }
            let old_result = self.instructions[inst].result;
            let result_ty = old_result.map(|v| self.values[v].ty);
            let new_inst = self.create_instruction(kind, result_ty);
            if let (Some(old), Some(new)) = (old_result, self.instructions[new_inst].result) {
                self.values[new].name = self.values[old].name.clone();
                map.insert(old, new);
            }
            self.append(new_block, new_inst);
        }
        new_block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{AddressSpace, StorageAccess};
    use crate::builder::Builder;

    #[test]
    fn root_identifier_walks_access_and_let() {
        let mut module = Module::new();
        let u32_ty = module.u32_ty();
        let arr = module.array_ty(u32_ty, crate::ArraySize::Constant(4), 4);
        let f = module.new_function("main", None, Some(ShaderStage::Compute));
        let block = module.functions[f].block;
        let mut b = Builder::at_end(&mut module, block);
        let var = b.var("v", AddressSpace::Function, arr, StorageAccess::LOAD_STORE, None);
        let two = b.u32(2);
        let elem = b.access_ptr(var, &[two]);
        let named = b.let_(elem);
        b.return_(None);

        let root = module.root_identifier(named);
        assert_eq!(root.root, var);
        assert_eq!(root.indices, vec![two]);
        assert_eq!(module.const_index(two), Some(2));
    }

    #[test]
    fn replace_all_uses_rewrites_operands() {
        let mut module = Module::new();
        let f = module.new_function("f", None, None);
        let block = module.functions[f].block;
        let mut b = Builder::at_end(&mut module, block);
        let one = b.u32(1);
        let two = b.u32(2);
        let sum = b.binary(crate::BinaryOp::Add, one, one);
        b.return_(None);

        assert_eq!(module.uses_of(one).len(), 2);
        module.replace_all_uses(one, two);
        assert!(module.uses_of(one).is_empty());
        assert_eq!(module.uses_of(two).len(), 2);
        let inst = module.defining_instruction(sum).unwrap();
        assert_eq!(module.function_containing(inst), Some(f));
    }

    #[test]
    fn clone_function_is_deep() {
        let mut module = Module::new();
        let u32_ty = module.u32_ty();
        let f = module.new_function("f", Some(u32_ty), None);
        let p = module.add_param(f, u32_ty, "x");
        let block = module.functions[f].block;
        let mut b = Builder::at_end(&mut module, block);
        let one = b.u32(1);
        let sum = b.binary(crate::BinaryOp::Add, p, one);
        b.return_(Some(sum));
        let g = module.new_function("g", None, None);

        let clone = module.clone_function(f, "f_1");
        assert_eq!(module.function_order, vec![f, clone, g]);
        let cloned_param = module.functions[clone].params[0].value;
        assert_ne!(cloned_param, p);
        assert_ne!(module.functions[clone].block, module.functions[f].block);
        let uses = module.uses_of(cloned_param);
        assert_eq!(uses.len(), 1);
        assert_eq!(module.function_containing(uses[0].0), Some(clone));
        // The original body is untouched.
        assert_eq!(module.uses_of(p).len(), 1);
    }

    #[test]
    fn params_are_renumbered() {
        let mut module = Module::new();
        let u32_ty = module.u32_ty();
        let f = module.new_function("f", None, None);
        module.add_param(f, u32_ty, "a");
        let c = module.add_param(f, u32_ty, "c");
        let b = module.insert_param(f, 1, u32_ty, "b");
        assert_eq!(
            module.values[c].kind,
            ValueKind::Parameter { function: f, index: 2 }
        );
        module.remove_param(f, 0);
        assert_eq!(
            module.values[b].kind,
            ValueKind::Parameter { function: f, index: 0 }
        );
        assert_eq!(module.functions[f].params.len(), 2);
    }

    #[test]
    fn json_round_trip() {
        let mut module = Module::new();
        let u32_ty = module.u32_ty();
        let root = module.root;
        let mut b = Builder::at_end(&mut module, root);
        b.var(
            "buf",
            AddressSpace::Storage,
            u32_ty,
            StorageAccess::LOAD_STORE,
            Some(BindingPoint::new(0, 1)),
        );
        let text = module.to_json().unwrap();
        let decoded = Module::from_json(&text).unwrap();
        assert_eq!(crate::dump_module(&decoded), crate::dump_module(&module));
    }

    #[test]
    fn from_json_rejects_garbage() {
        assert!(Module::from_json("{}").is_err());
        assert!(Module::from_json("not json").is_err());
    }
}
