//! Module validator.
//!
//! Run after every transform to assert the structural and typing invariants
//! downstream passes and backends rely on. Checks can be relaxed per pass
//! through [`Capabilities`].

use std::collections::{BTreeMap, HashSet};

use crate::Module;
use crate::arena::Handle;
use crate::binding::{AddressSpace, BindingPoint, StorageAccess};
use crate::display::{dump_module, format_value};
use crate::func::Function;
use crate::instruction::{Block, BuiltinFunction, Instruction, InstructionKind};
use crate::types::{ArraySize, Scalar, Type, TypeInner};
use crate::value::{Value, ValueKind};

/// Validator relaxations a transform may request.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const EMPTY: Self = Self(0);
    /// Distinct resources may share a binding point.
    pub const ALLOW_DUPLICATE_BINDINGS: Self = Self(1);
    /// `Stub` instructions may remain in the module.
    pub const ALLOW_STUBS: Self = Self(2);

    /// Returns `true` if `self` contains all flags in `other`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// An invariant violated by a module.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("{kind} handle {index} out of bounds")]
    BadHandle { kind: &'static str, index: usize },

    #[error("root block may only declare variables, found `{0}`")]
    RootInstruction(&'static str),

    #[error("variable {name}: {message}")]
    BadVariable { name: String, message: String },

    #[error("binding point {binding} is used by both {first} and {second}")]
    DuplicateBinding {
        binding: BindingPoint,
        first: String,
        second: String,
    },

    #[error("in `{function}`: block {block} does not end in a terminator")]
    MissingTerminator { function: String, block: usize },

    #[error("in `{function}`: `{inst}` is not the last instruction of its block")]
    MisplacedTerminator { function: String, inst: &'static str },

    #[error("in `{function}`: `{inst}` is not valid in this block")]
    UnexpectedTerminator { function: String, inst: &'static str },

    #[error("in `{function}`: block {block} has inconsistent parent links")]
    BadParent { function: String, block: usize },

    #[error("instruction {0} is placed more than once")]
    Duplicated(usize),

    #[error("in `{function}`: `{inst}` uses {value}, which is not in scope")]
    NotInScope {
        function: String,
        inst: &'static str,
        value: String,
    },

    #[error("in `{function}`: `{inst}`: {message}")]
    Type {
        function: String,
        inst: &'static str,
        message: String,
    },

    #[error("in `{function}`: call to function `{callee}`, which is not part of the module")]
    DeadCallee { function: String, callee: String },

    #[error("in `{function}`: `{stub}` has not been lowered")]
    Stub { function: String, stub: &'static str },
}

/// A validation failure attributed to the pass that ran last.
#[derive(Debug, thiserror::Error)]
#[error("validation failed after `{pass}`: {source}")]
pub struct PassValidationError {
    pub pass: String,
    #[source]
    pub source: ValidationError,
}

/// Validates `module`, relaxing checks according to `capabilities`.
pub fn validate(module: &Module, capabilities: Capabilities) -> Result<(), ValidationError> {
    Validator::new(module, capabilities).run()
}

/// Validates `module` after `pass_name`. On failure the module dump is
/// logged at debug level and the error is tagged with the pass name.
pub fn validate_and_dump_if_needed(
    module: &Module,
    pass_name: &str,
    capabilities: Capabilities,
) -> Result<(), PassValidationError> {
    validate(module, capabilities).map_err(|source| {
        log::debug!("IR after `{pass_name}` failed validation:\n{}", dump_module(module));
        PassValidationError {
            pass: pass_name.to_string(),
            source,
        }
    })
}

/// Where a block sits relative to the innermost loop and switch.
#[derive(Clone, Copy, Debug, Default)]
struct Nesting {
    in_loop_body: bool,
    in_switch: bool,
}

struct Validator<'a> {
    module: &'a Module,
    capabilities: Capabilities,
    function: Option<Handle<Function>>,
    defined: HashSet<Handle<Value>>,
    scope: Vec<Handle<Value>>,
    placed: HashSet<Handle<Instruction>>,
}

impl<'a> Validator<'a> {
    fn new(module: &'a Module, capabilities: Capabilities) -> Self {
        Self {
            module,
            capabilities,
            function: None,
            defined: HashSet::new(),
            scope: Vec::new(),
            placed: HashSet::new(),
        }
    }

    fn run(mut self) -> Result<(), ValidationError> {
        self.check_types()?;
        self.check_root()?;
        let module = self.module;
        for &f in &module.function_order {
            let func = module
                .functions
                .try_get(f)
                .ok_or(ValidationError::BadHandle {
                    kind: "function",
                    index: f.index(),
                })?;
            self.function = Some(f);
            let mark = self.scope.len();
            for param in &func.params {
                self.value(param.value)?;
                if module.values[param.value].kind
                    != (ValueKind::Parameter {
                        function: f,
                        index: self.scope.len().saturating_sub(mark) as u32,
                    })
                {
                    return Err(self.type_error("fn", "parameter numbering is inconsistent"));
                }
                self.scope.push(param.value);
                self.defined.insert(param.value);
            }
            if let Some(ty) = func.return_type {
                self.ty(ty)?;
            }
            self.block(func.block, None, Nesting::default())?;
            self.pop_scope(mark);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Handles
    // -----------------------------------------------------------------------

    fn ty(&self, ty: Handle<Type>) -> Result<&'a Type, ValidationError> {
        self.module
            .types
            .try_get(ty)
            .ok_or(ValidationError::BadHandle {
                kind: "type",
                index: ty.index(),
            })
    }

    fn value(&self, value: Handle<Value>) -> Result<&'a Value, ValidationError> {
        let v = self
            .module
            .values
            .try_get(value)
            .ok_or(ValidationError::BadHandle {
                kind: "value",
                index: value.index(),
            })?;
        self.ty(v.ty)?;
        Ok(v)
    }

    fn check_types(&self) -> Result<(), ValidationError> {
        for (_, ty) in self.module.types.iter() {
            match ty.inner {
                TypeInner::Pointer { base, .. } | TypeInner::Array { base, .. } => {
                    self.ty(base)?;
                }
                TypeInner::Struct { ref members, .. } => {
                    for m in members {
                        self.ty(m.ty)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Root block
    // -----------------------------------------------------------------------

    fn check_root(&mut self) -> Result<(), ValidationError> {
        let module = self.module;
        let root = module
            .blocks
            .try_get(module.root)
            .ok_or(ValidationError::BadHandle {
                kind: "block",
                index: module.root.index(),
            })?;
        let mut bindings: BTreeMap<BindingPoint, String> = BTreeMap::new();
        for &inst in &root.instructions {
            let instruction = self.instruction(inst, module.root)?;
            let InstructionKind::Var {
                binding,
                initializer,
            } = instruction.kind
            else {
                return Err(ValidationError::RootInstruction(instruction.kind.name()));
            };
            let Some(result) = instruction.result else {
                return Err(ValidationError::BadVariable {
                    name: format!("{}", inst.index()),
                    message: "has no result".into(),
                });
            };
            let name = format_value(self.module, result);
            let var_error = |message: &str| ValidationError::BadVariable {
                name: name.clone(),
                message: message.to_string(),
            };
            let ptr = self.value(result)?;
            let TypeInner::Pointer { base, space, .. } = self.ty(ptr.ty)?.inner else {
                return Err(var_error("must have a pointer type"));
            };
            if space == AddressSpace::Function {
                return Err(var_error("function address space at module scope"));
            }
            if let Some(init) = initializer {
                let init_value = self.value(init)?;
                if !init_value.is_constant() || init_value.ty != base {
                    return Err(var_error("initializer must be a constant of the store type"));
                }
            }
            match (space.is_resource(), binding) {
                (true, None) => return Err(var_error("resource has no binding point")),
                (false, Some(_)) => return Err(var_error("non-resource has a binding point")),
                (true, Some(bp)) => {
                    if let Some(first) = bindings.get(&bp) {
                        if !self
                            .capabilities
                            .contains(Capabilities::ALLOW_DUPLICATE_BINDINGS)
                        {
                            return Err(ValidationError::DuplicateBinding {
                                binding: bp,
                                first: first.clone(),
                                second: name,
                            });
                        }
                    } else {
                        bindings.insert(bp, name);
                    }
                }
                (false, None) => {}
            }
            self.defined.insert(result);
        }
        Ok(())
    }

    fn instruction(
        &mut self,
        inst: Handle<Instruction>,
        block: Handle<Block>,
    ) -> Result<&'a Instruction, ValidationError> {
        let instruction =
            self.module
                .instructions
                .try_get(inst)
                .ok_or(ValidationError::BadHandle {
                    kind: "instruction",
                    index: inst.index(),
                })?;
        if !self.placed.insert(inst) {
            return Err(ValidationError::Duplicated(inst.index()));
        }
        if instruction.block != Some(block) {
            return Err(ValidationError::BadParent {
                function: self.function_name(),
                block: block.index(),
            });
        }
        if let Some(result) = instruction.result {
            let value = self.value(result)?;
            if value.kind != ValueKind::Result(inst) {
                return Err(ValidationError::BadParent {
                    function: self.function_name(),
                    block: block.index(),
                });
            }
        }
        Ok(instruction)
    }

    // -----------------------------------------------------------------------
    // Function bodies
    // -----------------------------------------------------------------------

    fn function_name(&self) -> String {
        match self.function {
            Some(f) => self.module.functions[f].name.clone(),
            None => "<root>".to_string(),
        }
    }

    fn pop_scope(&mut self, mark: usize) {
        for value in self.scope.drain(mark..) {
            self.defined.remove(&value);
        }
    }

    fn block(
        &mut self,
        block: Handle<Block>,
        parent: Option<Handle<Instruction>>,
        nesting: Nesting,
    ) -> Result<(), ValidationError> {
        let module = self.module;
        let b = module
            .blocks
            .try_get(block)
            .ok_or(ValidationError::BadHandle {
                kind: "block",
                index: block.index(),
            })?;
        if b.parent != parent {
            return Err(ValidationError::BadParent {
                function: self.function_name(),
                block: block.index(),
            });
        }
        let Some(&last) = b.instructions.last() else {
            return Err(ValidationError::MissingTerminator {
                function: self.function_name(),
                block: block.index(),
            });
        };
        for &inst in &b.instructions {
            let instruction = self.instruction(inst, block)?;
            let is_terminator = instruction.kind.is_terminator();
            if is_terminator && inst != last {
                return Err(ValidationError::MisplacedTerminator {
                    function: self.function_name(),
                    inst: instruction.kind.name(),
                });
            }
            if inst == last && !is_terminator {
                return Err(ValidationError::MissingTerminator {
                    function: self.function_name(),
                    block: block.index(),
                });
            }
            self.check_instruction(inst, instruction, block, nesting)?;
        }
        Ok(())
    }

    fn check_instruction(
        &mut self,
        inst: Handle<Instruction>,
        instruction: &'a Instruction,
        block: Handle<Block>,
        nesting: Nesting,
    ) -> Result<(), ValidationError> {
        let name = instruction.kind.name();
        for op in instruction.kind.operands() {
            self.check_in_scope(name, op)?;
        }
        self.check_types_of(instruction)?;
        self.check_terminator_placement(instruction, block, nesting)?;

        match instruction.kind {
            InstructionKind::If { accept, reject, .. } => {
                for child in [accept, reject] {
                    let mark = self.scope.len();
                    self.block(child, Some(inst), nesting)?;
                    self.pop_scope(mark);
                }
            }
            InstructionKind::Loop { body, continuing } => {
                let mark = self.scope.len();
                let inner = Nesting {
                    in_loop_body: true,
                    ..nesting
                };
                self.block(body, Some(inst), inner)?;
                self.block(continuing, Some(inst), nesting)?;
                self.pop_scope(mark);
            }
            InstructionKind::Switch { ref cases, .. } => {
                let inner = Nesting {
                    in_switch: true,
                    ..nesting
                };
                for case in cases {
                    let mark = self.scope.len();
                    self.block(case.block, Some(inst), inner)?;
                    self.pop_scope(mark);
                }
            }
            _ => {}
        }

        if let Some(result) = instruction.result {
            self.scope.push(result);
            self.defined.insert(result);
        }
        Ok(())
    }

    fn check_in_scope(&self, inst: &'static str, op: Handle<Value>) -> Result<(), ValidationError> {
        let value = self.value(op)?;
        let visible = match value.kind {
            ValueKind::Constant(_) | ValueKind::Zero => true,
            ValueKind::Parameter { function, .. } => {
                Some(function) == self.function && self.defined.contains(&op)
            }
            ValueKind::Result(_) => self.defined.contains(&op),
        };
        if visible {
            Ok(())
        } else {
            Err(ValidationError::NotInScope {
                function: self.function_name(),
                inst,
                value: format_value(self.module, op),
            })
        }
    }

    fn check_terminator_placement(
        &self,
        instruction: &Instruction,
        block: Handle<Block>,
        nesting: Nesting,
    ) -> Result<(), ValidationError> {
        let parent_kind = self.module.blocks[block]
            .parent
            .map(|p| &self.module.instructions[p].kind);
        let ok = match instruction.kind {
            InstructionKind::ExitIf => matches!(parent_kind, Some(InstructionKind::If { .. })),
            InstructionKind::ExitLoop | InstructionKind::Continue => nesting.in_loop_body,
            InstructionKind::ExitSwitch => nesting.in_switch,
            InstructionKind::NextIteration | InstructionKind::BreakIf { .. } => matches!(
                parent_kind,
                Some(InstructionKind::Loop { continuing, .. }) if *continuing == block
            ),
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(ValidationError::UnexpectedTerminator {
                function: self.function_name(),
                inst: instruction.kind.name(),
            })
        }
    }

    // -----------------------------------------------------------------------
    // Typing
    // -----------------------------------------------------------------------

    fn type_error(&self, inst: &'static str, message: impl Into<String>) -> ValidationError {
        ValidationError::Type {
            function: self.function_name(),
            inst,
            message: message.into(),
        }
    }

    fn vty(&self, value: Handle<Value>) -> Handle<Type> {
        self.module.values[value].ty
    }

    fn inner(&self, ty: Handle<Type>) -> &'a TypeInner {
        &self.module.types[ty].inner
    }

    fn is_bool(&self, value: Handle<Value>) -> bool {
        matches!(self.inner(self.vty(value)), TypeInner::Scalar(s) if *s == Scalar::BOOL)
    }

    /// Element type of `ty` at `index`, without interning new types.
    fn element_type(&self, ty: Handle<Type>, index: Handle<Value>) -> Option<Handle<Type>> {
        let lookup = |inner: TypeInner| {
            self.module.types.get(&Type { name: None, inner })
        };
        match *self.inner(ty) {
            TypeInner::Vector { scalar, .. } => lookup(TypeInner::Scalar(scalar)),
            TypeInner::Matrix { rows, scalar, .. } => lookup(TypeInner::Vector { size: rows, scalar }),
            TypeInner::Array { base, .. } => Some(base),
            TypeInner::Struct { ref members, .. } => {
                let i = self.module.const_index(index)? as usize;
                members.get(i).map(|m| m.ty)
            }
            _ => None,
        }
    }

    fn check_types_of(&self, instruction: &Instruction) -> Result<(), ValidationError> {
        let name = instruction.kind.name();
        let result_ty = instruction.result.map(|r| self.vty(r));
        let err = |message: &str| self.type_error(name, message);

        match instruction.kind {
            InstructionKind::Var { initializer, .. } => {
                let ty = result_ty.ok_or_else(|| err("variable without result"))?;
                let Some((space, base, _)) = self.module.pointer_parts(ty) else {
                    return Err(err("variable must have a pointer type"));
                };
                if space != AddressSpace::Function {
                    return Err(err("function-scope variable must be in the function space"));
                }
                if let Some(init) = initializer {
                    if self.vty(init) != base {
                        return Err(err("initializer does not match the store type"));
                    }
                }
            }
            InstructionKind::Let { value } => {
                if result_ty != Some(self.vty(value)) {
                    return Err(err("result type differs from its value"));
                }
            }
            InstructionKind::Load { from } => {
                let Some(base) = self.module.pointee(self.vty(from)) else {
                    return Err(err("operand is not a pointer"));
                };
                if self.module.contains_atomic(base) {
                    return Err(err("atomic memory must be read with atomicLoad"));
                }
                if result_ty != Some(base) {
                    return Err(err("result type differs from the pointee"));
                }
            }
            InstructionKind::Store { to, value } => {
                let Some((_, base, access)) = self.module.pointer_parts(self.vty(to)) else {
                    return Err(err("target is not a pointer"));
                };
                if !access.contains(StorageAccess::STORE) {
                    return Err(err("target is not writable"));
                }
                if self.module.contains_atomic(base) {
                    return Err(err("atomic memory must be written with atomicStore"));
                }
                if self.vty(value) != base {
                    return Err(err("stored value does not match the pointee"));
                }
            }
            InstructionKind::Access {
                object,
                ref indices,
            } => {
                let object_ty = self.vty(object);
                let (pointer, mut current) = match self.module.pointer_parts(object_ty) {
                    Some((space, base, access)) => (Some((space, access)), base),
                    None => (None, object_ty),
                };
                for &index in indices {
                    match self.inner(self.vty(index)).scalar() {
                        Some(s) if s.is_integer32() => {}
                        _ => return Err(err("index is not a 32-bit integer")),
                    }
                    current = self
                        .element_type(current, index)
                        .ok_or_else(|| err("index into a non-composite or out of range"))?;
                }
                let ty = result_ty.ok_or_else(|| err("access without result"))?;
                let matches = match pointer {
                    Some((space, access)) => {
                        self.module.pointer_parts(ty) == Some((space, current, access))
                    }
                    None => ty == current,
                };
                if !matches {
                    return Err(err("result type does not match the indexed element"));
                }
            }
            InstructionKind::Call { function, ref args } => {
                let callee = self.module.functions.try_get(function).ok_or(
                    ValidationError::BadHandle {
                        kind: "function",
                        index: function.index(),
                    },
                )?;
                if !self.module.function_order.contains(&function) {
                    return Err(ValidationError::DeadCallee {
                        function: self.function_name(),
                        callee: callee.name.clone(),
                    });
                }
                if callee.params.len() != args.len() {
                    return Err(err(&format!(
                        "`{}` expects {} arguments, got {}",
                        callee.name,
                        callee.params.len(),
                        args.len()
                    )));
                }
                for (i, (param, &arg)) in callee.params.iter().zip(args).enumerate() {
                    if self.vty(param.value) != self.vty(arg) {
                        return Err(err(&format!(
                            "argument {i} of `{}` has the wrong type",
                            callee.name
                        )));
                    }
                }
                if result_ty != callee.return_type {
                    return Err(err(&format!(
                        "result type differs from the return type of `{}`",
                        callee.name
                    )));
                }
            }
            InstructionKind::BuiltinCall { builtin, ref args } => {
                self.check_builtin(name, builtin, args, result_ty)?;
            }
            InstructionKind::Stub { stub, .. } => {
                if !self.capabilities.contains(Capabilities::ALLOW_STUBS) {
                    return Err(ValidationError::Stub {
                        function: self.function_name(),
                        stub: stub.name(),
                    });
                }
            }
            InstructionKind::If { condition, .. } | InstructionKind::BreakIf { condition } => {
                if !self.is_bool(condition) {
                    return Err(err("condition is not a bool"));
                }
            }
            InstructionKind::Return { value } => {
                let expected = self.function.and_then(|f| self.module.functions[f].return_type);
                if value.map(|v| self.vty(v)) != expected {
                    return Err(err("returned value does not match the return type"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn check_builtin(
        &self,
        name: &'static str,
        builtin: BuiltinFunction,
        args: &[Handle<Value>],
        result_ty: Option<Handle<Type>>,
    ) -> Result<(), ValidationError> {
        let err = |message: &str| self.type_error(name, message);
        if builtin == BuiltinFunction::ArrayLength {
            let base = args
                .first()
                .and_then(|&p| self.module.pointee(self.vty(p)))
                .ok_or_else(|| err("expects a pointer"))?;
            if !matches!(
                self.inner(base),
                TypeInner::Array {
                    size: ArraySize::Dynamic,
                    ..
                }
            ) {
                return Err(err("expects a pointer to a runtime-sized array"));
            }
            return match result_ty.map(|t| self.inner(t)) {
                Some(TypeInner::Scalar(s)) if *s == Scalar::U32 => Ok(()),
                _ => Err(err("result must be u32")),
            };
        }
        if !builtin.is_atomic() {
            return Ok(());
        }
        let scalar = args
            .first()
            .and_then(|&p| self.module.pointee(self.vty(p)))
            .and_then(|base| match *self.inner(base) {
                TypeInner::Atomic(s) => Some(s),
                _ => None,
            })
            .ok_or_else(|| err("first argument must point to an atomic"))?;
        for &arg in &args[1..] {
            if *self.inner(self.vty(arg)) != TypeInner::Scalar(scalar) {
                return Err(err("operand does not match the atomic type"));
            }
        }
        match builtin {
            BuiltinFunction::AtomicStore => {
                if result_ty.is_some() {
                    return Err(err("atomicStore has no result"));
                }
            }
            BuiltinFunction::AtomicCompareExchangeWeak => {
                let ok = result_ty.is_some_and(|t| match self.inner(t) {
                    TypeInner::Struct { members, .. } => {
                        members.len() == 2
                            && *self.inner(members[0].ty) == TypeInner::Scalar(scalar)
                    }
                    _ => false,
                });
                if !ok {
                    return Err(err("result must be a compare-exchange result struct"));
                }
            }
            _ => {
                if result_ty.map(|t| self.inner(t)) != Some(&TypeInner::Scalar(scalar)) {
                    return Err(err("result does not match the atomic type"));
                }
            }
        }
        Ok(())
    }
}
