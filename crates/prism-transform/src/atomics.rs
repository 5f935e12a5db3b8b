//! Atomic type propagation.
//!
//! Front-ends that cannot see the final memory types emit atomic stubs on
//! plain scalar pointers. This transform retypes the memory those stubs
//! touch to its atomic twin, rewrites every access through the retyped
//! memory, clones functions whose pointer parameters now receive
//! differently-typed arguments, and finally lowers the stubs to atomic
//! builtins.
//!
//! Twin types are memoized per original type, so every access path into
//! one struct type converges on a single derived type. Only struct members
//! reached by some stub become atomic; the rest keep their types.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use prism_ir::{
    AddressSpace, AtomicStub, Builder, BuiltinFunction, Capabilities, Function, Handle,
    Instruction, InstructionKind, Literal, Module, Scalar, ScalarKind, Stub, StructMember,
    Type, TypeInner, Value, ValueKind,
};

use crate::{Transform, TransformError, TransformOutput, unsupported};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// Accept floating-point atomic stubs.
    pub float_atomics: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    /// Variables and parameters whose memory became atomic.
    pub retyped_roots: usize,
    /// Function clones left in the module.
    pub cloned_functions: usize,
    /// Stubs replaced by atomic builtins.
    pub lowered_stubs: usize,
}

/// One step of an access path from a root to an atomic leaf.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
enum Step {
    Member(u32),
    Element,
}

/// A root variable or parameter with a path to memory used atomically.
type Mark = (Handle<Value>, Vec<Step>);

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

fn pointer_space(module: &Module, value: Handle<Value>) -> Option<AddressSpace> {
    module
        .pointer_parts(module.value_type(value))
        .map(|(space, _, _)| space)
}

/// Access path from `pointer`'s root, which must be a variable or a
/// parameter, through structs and arrays.
fn access_path(module: &Module, pointer: Handle<Value>) -> Result<Mark, TransformError> {
    let root = module.root_identifier(pointer);
    let is_root = match module.values[root.root].kind {
        ValueKind::Parameter { .. } => true,
        ValueKind::Result(inst) => {
            matches!(module.instructions[inst].kind, InstructionKind::Var { .. })
        }
        _ => false,
    };
    if !is_root {
        return unsupported("atomic pointer is not derived from a variable or parameter");
    }
    let Some(mut ty) = module.pointee(module.value_type(root.root)) else {
        return unsupported("atomic pointer root is not a pointer");
    };
    let mut steps = Vec::with_capacity(root.indices.len());
    for &index in &root.indices {
        match module.types[ty].inner {
            TypeInner::Struct { ref members, .. } => {
                let i = module.const_index(index).ok_or_else(|| {
                    TransformError::Internal("struct member index is not a constant".into())
                })?;
                steps.push(Step::Member(i));
                ty = members
                    .get(i as usize)
                    .ok_or_else(|| TransformError::Internal("struct member out of range".into()))?
                    .ty;
            }
            TypeInner::Array { base, .. } => {
                steps.push(Step::Element);
                ty = base;
            }
            TypeInner::Vector { .. } | TypeInner::Matrix { .. } => {
                return unsupported("atomic access to a vector or matrix component");
            }
            _ => return Err(TransformError::Internal("index into a non-composite".into())),
        }
    }
    Ok((root.root, steps))
}

/// Checks a stub and returns the mark it induces.
fn check_stub(
    module: &Module,
    config: &Config,
    op: AtomicStub,
    args: &[Handle<Value>],
) -> Result<Mark, TransformError> {
    if op.is_float() && !config.float_atomics {
        return unsupported(format!(
            "`{}` needs float atomics, which are not enabled",
            op.name()
        ));
    }
    let &pointer = args
        .first()
        .ok_or_else(|| TransformError::Internal(format!("`{}` without operands", op.name())))?;
    let Some((space, base, _)) = module.pointer_parts(module.value_type(pointer)) else {
        return unsupported(format!("`{}` operand is not a pointer", op.name()));
    };
    if !matches!(space, AddressSpace::Storage | AddressSpace::Workgroup) {
        return unsupported(format!("`{}` on {space} memory", op.name()));
    }
    match module.types[base].inner {
        TypeInner::Atomic(_) => {}
        TypeInner::Scalar(s) if s.is_integer32() => {}
        TypeInner::Scalar(s) if s == Scalar::F32 && config.float_atomics => {}
        TypeInner::Vector { .. } => {
            return unsupported(format!("`{}` on a vector", op.name()));
        }
        _ => {
            return unsupported(format!(
                "`{}` on a type with no atomic equivalent",
                op.name()
            ));
        }
    }
    access_path(module, pointer)
}

fn stubs(module: &Module) -> Vec<(Handle<Instruction>, AtomicStub, Vec<Handle<Value>>)> {
    module
        .all_instructions()
        .into_iter()
        .filter_map(|inst| match module.instructions[inst].kind {
            InstructionKind::Stub {
                stub: Stub::Atomic(op),
                ref args,
            } => Some((inst, op, args.clone())),
            _ => None,
        })
        .collect()
}

/// Collects the marks of every stub and pushes parameter marks out to the
/// arguments of every call, until no new mark appears. Fails before the
/// module is touched.
fn discover(module: &Module, config: &Config) -> Result<HashSet<Mark>, TransformError> {
    let mut marks = HashSet::new();
    let mut queue = VecDeque::new();
    for (_, op, args) in stubs(module) {
        let mark = check_stub(module, config, op, &args)?;
        if marks.insert(mark.clone()) {
            queue.push_back(mark);
        }
    }
    while let Some((root, steps)) = queue.pop_front() {
        let ValueKind::Parameter { function, index } = module.values[root].kind else {
            continue;
        };
        for call in module.calls_to(function) {
            let InstructionKind::Call { ref args, .. } = module.instructions[call].kind else {
                continue;
            };
            let Some(&arg) = args.get(index as usize) else {
                continue;
            };
            if !matches!(
                pointer_space(module, arg),
                Some(AddressSpace::Storage | AddressSpace::Workgroup)
            ) {
                return unsupported("atomic memory passed from a non-shared address space");
            }
            let (arg_root, mut path) = access_path(module, arg)?;
            path.extend_from_slice(&steps);
            let mark = (arg_root, path);
            if marks.insert(mark.clone()) {
                queue.push_back(mark);
            }
        }
    }
    Ok(marks)
}

// ---------------------------------------------------------------------------
// Rewriting
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Rewriter {
    /// Struct type to the members reached by some mark.
    forked: HashMap<Handle<Type>, BTreeSet<usize>>,
    /// Original type to its atomic twin.
    twins: HashMap<Handle<Type>, Handle<Type>>,
    /// Pointer values whose type changed and whose uses need revisiting.
    queue: VecDeque<Handle<Value>>,
    /// Calls whose argument types may no longer match their callee.
    pending: BTreeSet<Handle<Instruction>>,
    /// `(original function, argument types)` to the function with that
    /// signature.
    clones: HashMap<(Handle<Function>, Vec<Handle<Type>>), Handle<Function>>,
    /// Clone to the function it was cloned from.
    origin: HashMap<Handle<Function>, Handle<Function>>,
    clone_counts: BTreeMap<Handle<Function>, usize>,
}

impl Rewriter {
    fn fork(&mut self, module: &Module, (root, steps): &Mark) {
        let Some(mut ty) = module.pointee(module.value_type(*root)) else {
            return;
        };
        for step in steps {
            match (*step, &module.types[ty].inner) {
                (Step::Member(i), TypeInner::Struct { members, .. }) => {
                    self.forked.entry(ty).or_default().insert(i as usize);
                    ty = members[i as usize].ty;
                }
                (Step::Element, TypeInner::Array { base, .. }) => ty = *base,
                _ => return,
            }
        }
    }

    /// Returns the atomic twin of `ty`.
    fn twin(&mut self, module: &mut Module, ty: Handle<Type>) -> Handle<Type> {
        if let Some(&twin) = self.twins.get(&ty) {
            return twin;
        }
        let original = module.types[ty].clone();
        let twin = match original.inner {
            TypeInner::Scalar(s) => module.atomic_ty(s),
            TypeInner::Array { base, size, stride } => {
                let base = self.twin(module, base);
                module.types.insert(Type {
                    name: original.name,
                    inner: TypeInner::Array { base, size, stride },
                })
            }
            TypeInner::Struct { members, span } => match self.forked.get(&ty).cloned() {
                Some(marked) => {
                    let members = members
                        .into_iter()
                        .enumerate()
                        .map(|(i, m)| StructMember {
                            ty: if marked.contains(&i) {
                                self.twin(module, m.ty)
                            } else {
                                m.ty
                            },
                            ..m
                        })
                        .collect();
                    let name = original
                        .name
                        .map_or_else(|| "atomic_struct".to_string(), |n| format!("{n}_atomic"));
                    log::debug!("forked struct `{name}`");
                    module.struct_ty(name, members, span)
                }
                None => ty,
            },
            _ => ty,
        };
        self.twins.insert(ty, twin);
        twin
    }

    /// Gives `root` a pointer type to the atomic twin of its store type.
    fn retype_root(&mut self, module: &mut Module, root: Handle<Value>) {
        let Some((space, base, access)) = module.pointer_parts(module.value_type(root)) else {
            return;
        };
        let twin = self.twin(module, base);
        if twin == base {
            return;
        }
        module.values[root].ty = module.pointer_ty(space, twin, access);
        log::trace!("retyped root {}", prism_ir::format_value(module, root));
        self.queue.push_back(root);
    }

    /// Rewrites the uses of a retyped pointer.
    fn visit(&mut self, module: &mut Module, value: Handle<Value>) -> Result<(), TransformError> {
        for (inst, operand) in module.uses_of(value) {
            let kind = module.instructions[inst].kind.clone();
            match kind {
                InstructionKind::Access { object, indices } if operand == 0 => {
                    let object_ty = module.value_type(object);
                    let ty = module
                        .access_result_type(object_ty, &indices)
                        .ok_or_else(|| TransformError::Internal("bad access chain".into()))?;
                    self.set_result_type(module, inst, ty);
                }
                InstructionKind::Let { value } => {
                    let ty = module.value_type(value);
                    self.set_result_type(module, inst, ty);
                }
                InstructionKind::Load { from } => rewrite_load(module, inst, from)?,
                InstructionKind::Store { to, value } if operand == 0 => {
                    rewrite_store(module, inst, to, value)?;
                }
                InstructionKind::Call { .. } => {
                    self.pending.insert(inst);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn set_result_type(&mut self, module: &mut Module, inst: Handle<Instruction>, ty: Handle<Type>) {
        if let Some(result) = module.result(inst) {
            if module.values[result].ty != ty {
                module.values[result].ty = ty;
                self.queue.push_back(result);
            }
        }
    }

    /// Points `call` at a version of its callee whose parameter types match
    /// the arguments, cloning the original function on first need.
    fn resolve_call(
        &mut self,
        module: &mut Module,
        call: Handle<Instruction>,
    ) -> Result<(), TransformError> {
        if module.instructions[call].block.is_none() {
            return Ok(());
        }
        let InstructionKind::Call { function, ref args } = module.instructions[call].kind else {
            return Ok(());
        };
        let combo: Vec<_> = args.iter().map(|&a| module.value_type(a)).collect();
        let param_types = |module: &Module, f: Handle<Function>| -> Vec<Handle<Type>> {
            module.functions[f]
                .params
                .iter()
                .map(|p| module.value_type(p.value))
                .collect()
        };
        if param_types(module, function) == combo {
            return Ok(());
        }

        let original = self.origin.get(&function).copied().unwrap_or(function);
        let key = (original, combo);
        let target = match self.clones.get(&key) {
            Some(&f) => f,
            None if param_types(module, original) == key.1 => original,
            None => {
                let count = self.clone_counts.entry(original).or_insert(0);
                let name = loop {
                    *count += 1;
                    let name = format!("{}_{count}", module.functions[original].name);
                    if module.function_by_name(&name).is_none() {
                        break name;
                    }
                };
                let clone = module.clone_function(original, name);
                let params: Vec<_> = module.functions[clone].params.iter().map(|p| p.value).collect();
                for (param, &ty) in params.into_iter().zip(&key.1) {
                    if module.values[param].ty != ty {
                        module.values[param].ty = ty;
                        self.queue.push_back(param);
                    }
                }
                let body = module.functions[clone].block;
                for inst in module.instructions_in(body) {
                    if matches!(module.instructions[inst].kind, InstructionKind::Call { .. }) {
                        self.pending.insert(inst);
                    }
                }
                log::debug!(
                    "cloned `{}` as `{}`",
                    module.functions[original].name,
                    module.functions[clone].name
                );
                self.origin.insert(clone, original);
                self.clones.insert(key, clone);
                clone
            }
        };
        if let InstructionKind::Call { function, .. } = &mut module.instructions[call].kind {
            *function = target;
        }
        Ok(())
    }

    /// Drops versioned functions that lost all callers, repeating until none
    /// goes, then gives a sole surviving clone its original's name. Returns
    /// the number of clones left.
    fn finish_clones(&self, module: &mut Module) -> usize {
        let versioned: Vec<_> = self
            .clone_counts
            .keys()
            .chain(self.origin.keys())
            .copied()
            .collect();
        loop {
            let dead: Vec<_> = versioned
                .iter()
                .copied()
                .filter(|&f| module.function_order.contains(&f))
                .filter(|&f| {
                    !module.functions[f].is_entry_point() && module.calls_to(f).is_empty()
                })
                .collect();
            if dead.is_empty() {
                break;
            }
            for f in dead {
                log::debug!("removing unused `{}`", module.functions[f].name);
                module.remove_function(f);
            }
        }

        let mut left = 0;
        for &original in self.clone_counts.keys() {
            let clones: Vec<_> = module
                .function_order
                .iter()
                .copied()
                .filter(|c| self.origin.get(c) == Some(&original))
                .collect();
            if !module.function_order.contains(&original) {
                if let [only] = clones[..] {
                    let name = module.functions[original].name.clone();
                    module.functions[only].name = name;
                    continue;
                }
            }
            left += clones.len();
        }
        left
    }
}

/// Reads `pointer` as a value of `ty`, going through `atomicLoad` for
/// atomic members.
fn load_value(
    b: &mut Builder<'_>,
    pointer: Handle<Value>,
    ty: Handle<Type>,
) -> Result<Handle<Value>, TransformError> {
    let module = b.module();
    let ptr_ty = module.value_type(pointer);
    let pointee = module
        .pointee(ptr_ty)
        .ok_or_else(|| TransformError::Internal("load through a non-pointer".into()))?;
    if !module.contains_atomic(pointee) {
        return Ok(b.load(pointer));
    }
    let stored = module.types[pointee].inner.clone();
    let plain = module.types[ty].inner.clone();
    match (stored, plain) {
        (TypeInner::Atomic(_), _) => Ok(b.builtin(ty, BuiltinFunction::AtomicLoad, &[pointer])),
        (TypeInner::Struct { .. }, TypeInner::Struct { members, .. }) => {
            let mut parts = Vec::with_capacity(members.len());
            for (i, member) in members.iter().enumerate() {
                let index = b.u32(i as u32);
                let field = b.access_ptr(pointer, &[index]);
                parts.push(load_value(b, field, member.ty)?);
            }
            Ok(b.construct(ty, &parts))
        }
        (
            TypeInner::Array { .. },
            TypeInner::Array {
                base,
                size: prism_ir::ArraySize::Constant(n),
                ..
            },
        ) => {
            let mut parts = Vec::with_capacity(n as usize);
            for i in 0..n {
                let index = b.u32(i);
                let element = b.access_ptr(pointer, &[index]);
                parts.push(load_value(b, element, base)?);
            }
            Ok(b.construct(ty, &parts))
        }
        _ => unsupported("whole load of a runtime-sized array of atomics"),
    }
}

/// Writes `value` through `pointer`, going through `atomicStore` for
/// atomic members.
fn store_value(
    b: &mut Builder<'_>,
    pointer: Handle<Value>,
    value: Handle<Value>,
) -> Result<(), TransformError> {
    let module = b.module();
    let ptr_ty = module.value_type(pointer);
    let pointee = module
        .pointee(ptr_ty)
        .ok_or_else(|| TransformError::Internal("store through a non-pointer".into()))?;
    if !module.contains_atomic(pointee) {
        b.store(pointer, value);
        return Ok(());
    }
    let stored = module.types[pointee].inner.clone();
    let plain = module.type_inner(value).clone();
    match (stored, plain) {
        (TypeInner::Atomic(_), _) => {
            b.builtin_void(BuiltinFunction::AtomicStore, &[pointer, value]);
        }
        (TypeInner::Struct { .. }, TypeInner::Struct { members, .. }) => {
            for (i, member) in members.iter().enumerate() {
                let index = b.u32(i as u32);
                let field = b.access_ptr(pointer, &[index]);
                let part = b.access(member.ty, value, &[index]);
                store_value(b, field, part)?;
            }
        }
        (
            TypeInner::Array { .. },
            TypeInner::Array {
                base,
                size: prism_ir::ArraySize::Constant(n),
                ..
            },
        ) => {
            for i in 0..n {
                let index = b.u32(i);
                let element = b.access_ptr(pointer, &[index]);
                let part = b.access(base, value, &[index]);
                store_value(b, element, part)?;
            }
        }
        _ => return unsupported("whole store of a runtime-sized array of atomics"),
    }
    Ok(())
}

fn rewrite_load(
    module: &mut Module,
    inst: Handle<Instruction>,
    from: Handle<Value>,
) -> Result<(), TransformError> {
    let Some(result) = module.result(inst) else {
        return Ok(());
    };
    let ty = module.value_type(result);
    let mut b = Builder::before(module, inst)?;
    let value = load_value(&mut b, from, ty)?;
    module.replace_all_uses(result, value);
    module.remove(inst);
    Ok(())
}

fn rewrite_store(
    module: &mut Module,
    inst: Handle<Instruction>,
    to: Handle<Value>,
    value: Handle<Value>,
) -> Result<(), TransformError> {
    let mut b = Builder::before(module, inst)?;
    store_value(&mut b, to, value)?;
    module.remove(inst);
    Ok(())
}

// ---------------------------------------------------------------------------
// Stub lowering
// ---------------------------------------------------------------------------

fn one(module: &mut Module, scalar: Scalar) -> Handle<Value> {
    let literal = match scalar.kind {
        ScalarKind::Sint => Literal::I32(1),
        ScalarKind::Float => Literal::F32(1.0),
        _ => Literal::U32(1),
    };
    module.constant(literal)
}

fn lower_stub(
    module: &mut Module,
    inst: Handle<Instruction>,
    op: AtomicStub,
    args: &[Handle<Value>],
) -> Result<(), TransformError> {
    let pointer = args[0];
    let scalar = match module
        .pointee(module.value_type(pointer))
        .map(|base| &module.types[base].inner)
    {
        Some(&TypeInner::Atomic(scalar)) => scalar,
        _ => {
            return Err(TransformError::Internal(format!(
                "`{}` operand was not made atomic",
                op.name()
            )));
        }
    };
    let scalar_ty = module.scalar_ty(scalar);
    let value = |i: usize| {
        args.get(i).copied().ok_or_else(|| {
            TransformError::Internal(format!("`{}` is missing operand {i}", op.name()))
        })
    };

    let (builtin, operands) = match op {
        AtomicStub::Load => (BuiltinFunction::AtomicLoad, vec![pointer]),
        AtomicStub::Store => (BuiltinFunction::AtomicStore, vec![pointer, value(1)?]),
        AtomicStub::Exchange => (BuiltinFunction::AtomicExchange, vec![pointer, value(1)?]),
        AtomicStub::CompareExchange => (
            BuiltinFunction::AtomicCompareExchangeWeak,
            vec![pointer, value(2)?, value(1)?],
        ),
        AtomicStub::IAdd | AtomicStub::FAdd => {
            (BuiltinFunction::AtomicAdd, vec![pointer, value(1)?])
        }
        AtomicStub::ISub => (BuiltinFunction::AtomicSub, vec![pointer, value(1)?]),
        AtomicStub::SMax | AtomicStub::UMax | AtomicStub::FMax => {
            (BuiltinFunction::AtomicMax, vec![pointer, value(1)?])
        }
        AtomicStub::SMin | AtomicStub::UMin | AtomicStub::FMin => {
            (BuiltinFunction::AtomicMin, vec![pointer, value(1)?])
        }
        AtomicStub::And => (BuiltinFunction::AtomicAnd, vec![pointer, value(1)?]),
        AtomicStub::Or => (BuiltinFunction::AtomicOr, vec![pointer, value(1)?]),
        AtomicStub::Xor => (BuiltinFunction::AtomicXor, vec![pointer, value(1)?]),
        AtomicStub::IIncrement => (BuiltinFunction::AtomicAdd, vec![pointer, one(module, scalar)]),
        AtomicStub::IDecrement => (BuiltinFunction::AtomicSub, vec![pointer, one(module, scalar)]),
    };

    let replacement = match op {
        AtomicStub::Store => {
            Builder::before(module, inst)?.builtin_void(builtin, &operands);
            None
        }
        AtomicStub::CompareExchange => {
            let bool_ty = module.bool_ty();
            let result_ty = module.struct_ty(
                format!("__atomic_compare_exchange_result_{scalar}"),
                vec![
                    StructMember {
                        name: Some("old_value".into()),
                        ty: scalar_ty,
                        offset: 0,
                    },
                    StructMember {
                        name: Some("exchanged".into()),
                        ty: bool_ty,
                        offset: 4,
                    },
                ],
                8,
            );
            let mut b = Builder::before(module, inst)?;
            let exchanged = b.builtin(result_ty, builtin, &operands);
            let zero = b.u32(0);
            Some(b.access(scalar_ty, exchanged, &[zero]))
        }
        _ => Some(Builder::before(module, inst)?.builtin(scalar_ty, builtin, &operands)),
    };
    if let (Some(old), Some(new)) = (module.result(inst), replacement) {
        module.replace_all_uses(old, new);
    }
    module.remove(inst);
    log::trace!("lowered `{}` to `{}`", op.name(), builtin.name());
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// Runs atomic type propagation.
pub fn run(module: &mut Module, config: &Config) -> Result<Output, TransformError> {
    let marks = discover(module, config)?;
    let mut output = Output::default();
    if marks.is_empty() {
        return Ok(output);
    }

    // Marks on parameters of called functions are carried by the callers'
    // arguments; everything else is retyped directly.
    let terminal: Vec<&Mark> = marks
        .iter()
        .filter(|(root, _)| match module.values[*root].kind {
            ValueKind::Parameter { function, .. } => module.calls_to(function).is_empty(),
            _ => true,
        })
        .collect();

    let mut rewriter = Rewriter::default();
    for mark in &terminal {
        rewriter.fork(module, mark);
    }
    let roots: BTreeSet<Handle<Value>> = terminal.iter().map(|(root, _)| *root).collect();
    for &root in &roots {
        rewriter.retype_root(module, root);
        output.retyped_roots += 1;
    }

    loop {
        while let Some(value) = rewriter.queue.pop_front() {
            rewriter.visit(module, value)?;
        }
        let Some(call) = rewriter.pending.pop_first() else {
            break;
        };
        rewriter.resolve_call(module, call)?;
    }
    output.cloned_functions = rewriter.finish_clones(module);

    for (inst, op, args) in stubs(module) {
        lower_stub(module, inst, op, &args)?;
        output.lowered_stubs += 1;
    }
    Ok(output)
}

/// [`Transform`] wrapper around [`run`].
#[derive(Debug, Default)]
pub struct Atomics {
    pub config: Config,
}

impl Atomics {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl Transform for Atomics {
    fn name(&self) -> &str {
        "atomics"
    }

    fn lowers(&self) -> Capabilities {
        Capabilities::ALLOW_STUBS
    }

    fn apply(&self, module: &mut Module) -> Result<TransformOutput, TransformError> {
        run(module, &self.config).map(TransformOutput::Atomics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_ir::{BindingPoint, ShaderStage, StorageAccess, dump_module, validate};

    fn storage(module: &mut Module, name: &str, ty: Handle<Type>, binding: u32) -> Handle<Value> {
        let root = module.root;
        Builder::at_end(module, root).var(
            name,
            AddressSpace::Storage,
            ty,
            StorageAccess::LOAD_STORE,
            Some(BindingPoint::new(0, binding)),
        )
    }

    fn entry(module: &mut Module) -> prism_ir::Handle<prism_ir::Block> {
        let f = module.new_function("main", None, Some(ShaderStage::Compute));
        module.functions[f].workgroup_size = Some([1, 1, 1]);
        module.functions[f].block
    }

    fn atomic(op: AtomicStub) -> Stub {
        Stub::Atomic(op)
    }

    #[test]
    fn scalar_variable_becomes_atomic() {
        let mut module = Module::new();
        let u32_ty = module.u32_ty();
        let buf = storage(&mut module, "counter", u32_ty, 0);
        let block = entry(&mut module);
        let mut b = Builder::at_end(&mut module, block);
        let one = b.u32(1);
        b.stub(Some(u32_ty), atomic(AtomicStub::IAdd), &[buf, one]);
        let plain = b.load(buf);
        let i32_ty = b.module().i32_ty();
        let _ = b.bitcast(i32_ty, plain);
        b.return_(None);
        validate(&module, Capabilities::ALLOW_STUBS).unwrap();

        let out = run(&mut module, &Config::default()).unwrap();
        assert_eq!(out.retyped_roots, 1);
        assert_eq!(out.lowered_stubs, 1);
        validate(&module, Capabilities::EMPTY).unwrap();
        let dump = dump_module(&module);
        assert!(dump.contains("ptr<storage, atomic<u32>, read_write> = var"));
        assert!(dump.contains("atomicAdd %counter, 1u"));
        assert!(dump.contains("atomicLoad %counter"));
        assert!(!dump.contains("atomic_iadd"));
    }

    #[test]
    fn only_reached_members_become_atomic() {
        let mut module = Module::new();
        let u32_ty = module.u32_ty();
        let s = module.struct_ty(
            "S",
            vec![
                StructMember {
                    name: Some("a".into()),
                    ty: u32_ty,
                    offset: 0,
                },
                StructMember {
                    name: Some("b".into()),
                    ty: u32_ty,
                    offset: 4,
                },
            ],
            8,
        );
        let buf = storage(&mut module, "buf", s, 0);
        let block = entry(&mut module);
        let mut b = Builder::at_end(&mut module, block);
        let zero = b.u32(0);
        let one = b.u32(1);
        let a = b.access_ptr(buf, &[zero]);
        let field_b = b.access_ptr(buf, &[one]);
        b.stub(None, atomic(AtomicStub::Store), &[a, one]);
        let plain = b.load(field_b);
        b.store(field_b, plain);
        let whole = b.load(buf);
        b.store(buf, whole);
        b.return_(None);

        run(&mut module, &Config::default()).unwrap();
        validate(&module, Capabilities::EMPTY).unwrap();
        let dump = dump_module(&module);
        assert!(dump.contains("S_atomic = struct { a: atomic<u32>, b: u32 }"));
        assert!(dump.contains("atomicStore"));
        // Member `b` is still accessed with plain loads and stores, and the
        // whole-struct copy goes member by member.
        assert!(dump.contains("ptr<storage, u32, read_write> = access %buf, 1u"));
        assert!(dump.contains("construct"));
        assert!(!dump.contains("= load %buf\n"));
    }

    #[test]
    fn compare_exchange_extracts_old_value() {
        let mut module = Module::new();
        let i32_ty = module.i32_ty();
        let buf = storage(&mut module, "lock", i32_ty, 0);
        let block = entry(&mut module);
        let mut b = Builder::at_end(&mut module, block);
        let value = b.i32(1);
        let cmp = b.i32(0);
        let old = b.stub(Some(i32_ty), atomic(AtomicStub::CompareExchange), &[buf, value, cmp]);
        let old = module.result(old).unwrap();
        let mut b = Builder::at_end(&mut module, block);
        let _ = b.binary(prism_ir::BinaryOp::Add, old, old);
        b.return_(None);

        run(&mut module, &Config::default()).unwrap();
        validate(&module, Capabilities::EMPTY).unwrap();
        let dump = dump_module(&module);
        assert!(dump.contains("__atomic_compare_exchange_result_i32 = struct { old_value: i32, exchanged: bool }"));
        assert!(dump.contains("atomicCompareExchangeWeak %lock, 0i, 1i"));
    }

    #[test]
    fn float_stub_needs_config() {
        let mut module = Module::new();
        let f32_ty = module.f32_ty();
        let buf = storage(&mut module, "sum", f32_ty, 0);
        let block = entry(&mut module);
        let mut b = Builder::at_end(&mut module, block);
        let v = b.f32(0.5);
        b.stub(Some(f32_ty), atomic(AtomicStub::FAdd), &[buf, v]);
        b.return_(None);

        let before = dump_module(&module);
        let err = run(&mut module, &Config::default()).unwrap_err();
        assert!(matches!(err, TransformError::Unsupported(_)));
        assert_eq!(dump_module(&module), before);

        run(
            &mut module,
            &Config {
                float_atomics: true,
            },
        )
        .unwrap();
        assert!(dump_module(&module).contains("atomicAdd %sum, 0.5f"));
    }

    #[test]
    fn function_memory_is_rejected() {
        let mut module = Module::new();
        let u32_ty = module.u32_ty();
        let block = entry(&mut module);
        let mut b = Builder::at_end(&mut module, block);
        let local = b.var(
            "local",
            AddressSpace::Function,
            u32_ty,
            StorageAccess::LOAD_STORE,
            None,
        );
        b.stub(Some(u32_ty), atomic(AtomicStub::IIncrement), &[local]);
        b.return_(None);

        let err = run(&mut module, &Config::default()).unwrap_err();
        assert!(err.to_string().contains("function memory"));
    }

    #[test]
    fn vector_component_is_rejected() {
        let mut module = Module::new();
        let v = module.vec_ty(prism_ir::VectorSize::Quad, Scalar::U32);
        let buf = storage(&mut module, "v", v, 0);
        let block = entry(&mut module);
        let mut b = Builder::at_end(&mut module, block);
        let i = b.u32(2);
        let comp = b.access_ptr(buf, &[i]);
        let u32_ty = b.module().u32_ty();
        b.stub(Some(u32_ty), atomic(AtomicStub::IIncrement), &[comp]);
        b.return_(None);

        let err = run(&mut module, &Config::default()).unwrap_err();
        assert!(err.to_string().contains("vector"));
    }

    #[test]
    fn sole_clone_takes_the_original_name() {
        let mut module = Module::new();
        let u32_ty = module.u32_ty();
        let buf = storage(&mut module, "counter", u32_ty, 0);
        let ptr = module.pointer_ty(AddressSpace::Storage, u32_ty, StorageAccess::LOAD_STORE);
        let bump = module.new_function("bump", None, None);
        let p = module.add_param(bump, ptr, "p");
        let block = module.functions[bump].block;
        let mut b = Builder::at_end(&mut module, block);
        b.stub(Some(u32_ty), atomic(AtomicStub::IIncrement), &[p]);
        b.return_(None);

        let block = entry(&mut module);
        let mut b = Builder::at_end(&mut module, block);
        b.call(bump, &[buf]);
        b.return_(None);

        let out = run(&mut module, &Config::default()).unwrap();
        validate(&module, Capabilities::EMPTY).unwrap();
        assert_eq!(out.cloned_functions, 0);
        let dump = dump_module(&module);
        assert!(dump.contains("fn bump(%p: ptr<storage, atomic<u32>, read_write>)"));
        assert!(dump.contains("call bump(%counter)"));
        assert!(!dump.contains("bump_1"));
        assert_eq!(module.function_order.len(), 2);
    }
}
