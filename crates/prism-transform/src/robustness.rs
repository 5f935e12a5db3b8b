//! Out-of-bounds access protection.
//!
//! Every dynamically indexed access is either clamped into range before it
//! happens or guarded by a runtime check that skips it. The policy is chosen
//! per address space for pointer accesses, by the `value` category for
//! indexing into plain values, and by the `texture` category for texel
//! coordinates, levels and layers.

use std::collections::BTreeSet;

use prism_ir::{
    AddressSpace, BinaryOp, BindingPoint, Builder, BuiltinFunction, Handle, Instruction,
    InstructionKind, Module, RootIdentifier, Scalar, StorageAccess, TextureClass, Type, TypeInner,
    Value,
};
use serde::{Deserialize, Serialize};

use crate::{Transform, TransformError, TransformOutput, unsupported};

/// What to do with an access that may be out of bounds.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Leave the access alone.
    Ignore,
    /// Clamp the index into `[0, length - 1]`.
    #[default]
    Clamp,
    /// Skip the access when the index is out of range.
    Predicate,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub function: Policy,
    pub private: Policy,
    pub immediate: Policy,
    pub storage: Policy,
    pub uniform: Policy,
    pub workgroup: Policy,
    /// Indexing into values that are not behind a pointer.
    pub value: Policy,
    /// Texture coordinates, mip levels, array layers and sample indices.
    pub texture: Policy,
    /// Resources whose accesses are known to be in bounds.
    pub bindings_ignored: BTreeSet<BindingPoint>,
    /// Leave indices into runtime-sized arrays alone.
    pub disable_runtime_sized_array_index_clamping: bool,
}

impl Config {
    fn space_policy(&self, space: AddressSpace) -> Policy {
        match space {
            AddressSpace::Function => self.function,
            AddressSpace::Private => self.private,
            AddressSpace::Immediate => self.immediate,
            AddressSpace::Storage => self.storage,
            AddressSpace::Uniform => self.uniform,
            AddressSpace::Workgroup => self.workgroup,
            AddressSpace::Handle => Policy::Ignore,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    /// Accesses whose indices were clamped.
    pub clamped: usize,
    /// Accesses moved under a bounds check.
    pub predicated: usize,
}

/// Largest valid index at one step of an access chain.
#[derive(Clone, Copy, Debug)]
enum Bound {
    Fixed(u32),
    /// The length of a runtime-sized array.
    Runtime,
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Bound of each index of an access chain, `None` for struct members.
fn bounds(module: &Module, object: Handle<Value>, indices: &[Handle<Value>]) -> Vec<Option<Bound>> {
    let ty = module.value_type(object);
    let mut inner = module.types[module.pointee(ty).unwrap_or(ty)].inner.clone();
    indices
        .iter()
        .map(|&index| {
            let (bound, next) = match &inner {
                TypeInner::Array { base, size, .. } => {
                    let bound = match *size {
                        prism_ir::ArraySize::Constant(n) => Bound::Fixed(n.saturating_sub(1)),
                        prism_ir::ArraySize::Dynamic => Bound::Runtime,
                    };
                    (Some(bound), Some(module.types[*base].inner.clone()))
                }
                TypeInner::Vector { size, scalar } => (
                    Some(Bound::Fixed(*size as u32 - 1)),
                    Some(TypeInner::Scalar(*scalar)),
                ),
                TypeInner::Matrix {
                    columns,
                    rows,
                    scalar,
                } => (
                    Some(Bound::Fixed(*columns as u32 - 1)),
                    Some(TypeInner::Vector {
                        size: *rows,
                        scalar: *scalar,
                    }),
                ),
                TypeInner::Struct { members, .. } => (
                    None,
                    module
                        .const_index(index)
                        .and_then(|i| members.get(i as usize))
                        .map(|m| module.types[m.ty].inner.clone()),
                ),
                _ => (None, None),
            };
            if let Some(next) = next {
                inner = next;
            }
            bound
        })
        .collect()
}

/// What a clamp must keep an index within to count as done.
#[derive(Debug)]
enum Limit {
    /// At most this value.
    Fixed(u32),
    /// Below the `arrayLength` of the array at this root and path.
    Length(RootIdentifier),
    /// Below `query(texture, extra..)`.
    Query {
        query: BuiltinFunction,
        texture: Handle<Value>,
        extra: Vec<Handle<Value>>,
    },
}

/// Returns `true` if `index` is already an unsigned `min` against `limit`.
fn is_clamped(module: &Module, index: Handle<Value>, limit: &Limit) -> bool {
    let kind_of = |v: Handle<Value>| {
        module
            .defining_instruction(v)
            .map(|inst| &module.instructions[inst].kind)
    };
    let unsigned = matches!(
        module.type_inner(index),
        TypeInner::Scalar(Scalar::U32)
            | TypeInner::Vector {
                scalar: Scalar::U32,
                ..
            }
    );
    if !unsigned {
        return false;
    }
    let Some(InstructionKind::BuiltinCall {
        builtin: BuiltinFunction::Min,
        args,
    }) = kind_of(index)
    else {
        return false;
    };
    let Some(&bound) = args.get(1) else {
        return false;
    };
    if let Limit::Fixed(max) = *limit {
        return module.const_index(bound).is_some_and(|c| c <= max);
    }
    let Some(&InstructionKind::Binary {
        op: BinaryOp::Subtract,
        left,
        right,
    }) = kind_of(bound)
    else {
        return false;
    };
    if module.const_index(right).is_none_or(|c| c == 0) {
        return false;
    }
    let Some(InstructionKind::BuiltinCall {
        builtin,
        args: query_args,
    }) = kind_of(left)
    else {
        return false;
    };
    let Some((&queried, rest)) = query_args.split_first() else {
        return false;
    };
    match limit {
        Limit::Fixed(_) => false,
        Limit::Length(array) => {
            *builtin == BuiltinFunction::ArrayLength && module.root_identifier(queried) == *array
        }
        Limit::Query {
            query,
            texture,
            extra,
        } => builtin == query && same_texture(module, queried, *texture) && rest == &extra[..],
    }
}

/// Returns `true` if both values are the same texture or loads of the same
/// handle.
fn same_texture(module: &Module, a: Handle<Value>, b: Handle<Value>) -> bool {
    let loaded = |v: Handle<Value>| match module
        .defining_instruction(v)
        .map(|inst| &module.instructions[inst].kind)
    {
        Some(&InstructionKind::Load { from }) => Some(module.root_identifier(from)),
        _ => None,
    };
    a == b || loaded(a).is_some_and(|from| Some(from) == loaded(b))
}

/// The runtime-sized array reached by the first `k` indices of an access.
fn indexed_array(module: &Module, object: Handle<Value>, prefix: &[Handle<Value>]) -> RootIdentifier {
    let mut array = module.root_identifier(object);
    array.indices.extend_from_slice(prefix);
    array
}

/// The bound index `k` of an access still has to be checked against, if
/// any.
fn pending_bound(
    module: &Module,
    config: &Config,
    object: Handle<Value>,
    indices: &[Handle<Value>],
    k: usize,
    bound: Option<Bound>,
) -> Option<Bound> {
    let index = indices[k];
    match bound? {
        Bound::Runtime if config.disable_runtime_sized_array_index_clamping => None,
        Bound::Fixed(max)
            if module.values[index].is_constant()
                && module.const_index(index).is_some_and(|c| c <= max) =>
        {
            None
        }
        Bound::Fixed(max) if is_clamped(module, index, &Limit::Fixed(max)) => None,
        Bound::Runtime
            if is_clamped(
                module,
                index,
                &Limit::Length(indexed_array(module, object, &indices[..k])),
            ) =>
        {
            None
        }
        bound => Some(bound),
    }
}

fn binding_of(module: &Module, pointer: Handle<Value>) -> Option<BindingPoint> {
    let root = module.root_identifier(pointer).root;
    module.values[root]
        .instruction()
        .and_then(|inst| module.var_binding(inst))
}

fn texture_binding(module: &Module, texture: Handle<Value>) -> Option<BindingPoint> {
    let root = module.root_identifier(texture).root;
    match module.values[root]
        .instruction()
        .map(|inst| &module.instructions[inst].kind)
    {
        Some(&InstructionKind::Load { from }) => binding_of(module, from),
        _ => None,
    }
}

fn access_policy(module: &Module, config: &Config, object: Handle<Value>) -> Policy {
    match module.pointer_parts(module.value_type(object)) {
        Some(_) if binding_of(module, object).is_some_and(|b| config.bindings_ignored.contains(&b)) => {
            Policy::Ignore
        }
        Some((space, _, _)) => config.space_policy(space),
        None => config.value,
    }
}

/// Operand positions of a `textureLoad` or `textureStore`.
#[derive(Debug, Default)]
struct TextureOperands {
    coords: usize,
    layer: Option<usize>,
    level: Option<usize>,
    sample: Option<usize>,
}

fn texture_operands(
    module: &Module,
    builtin: BuiltinFunction,
    args: &[Handle<Value>],
) -> Option<TextureOperands> {
    let &texture = args.first()?;
    let TypeInner::Texture { arrayed, class, .. } = *module.type_inner(texture) else {
        return None;
    };
    if class == TextureClass::External {
        return None;
    }
    let count = match builtin {
        BuiltinFunction::TextureStore => args.len().checked_sub(1)?,
        _ => args.len(),
    };
    let mut ops = TextureOperands {
        coords: 1,
        ..TextureOperands::default()
    };
    let mut next = 2;
    if arrayed {
        ops.layer = Some(next);
        next += 1;
    }
    if builtin == BuiltinFunction::TextureLoad {
        match class {
            TextureClass::Storage { .. } => {}
            TextureClass::Sampled { multi: true, .. } | TextureClass::Depth { multi: true } => {
                ops.sample = Some(next);
            }
            _ => ops.level = Some(next),
        }
    }
    let present = |i: Option<usize>| i.filter(|&i| i < count);
    ops.layer = present(ops.layer);
    ops.level = present(ops.level);
    ops.sample = present(ops.sample);
    (ops.coords < count).then_some(ops)
}

/// Returns `true` if the access result is only used in ways that can be
/// moved under a bounds check.
fn guardable(module: &Module, user: Handle<Instruction>, operand: usize) -> bool {
    match module.instructions[user].kind {
        InstructionKind::Load { .. } => true,
        InstructionKind::Store { .. } => operand == 0,
        InstructionKind::BuiltinCall { builtin, .. } => builtin.is_atomic() && operand == 0,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Rewriting
// ---------------------------------------------------------------------------

/// Converts an integer scalar or vector to its `u32` counterpart.
fn to_u32(b: &mut Builder<'_>, value: Handle<Value>) -> Handle<Value> {
    let module = b.module();
    let target = match *module.type_inner(value) {
        TypeInner::Scalar(Scalar::U32) | TypeInner::Vector {
            scalar: Scalar::U32,
            ..
        } => return value,
        TypeInner::Vector { size, .. } => module.vec_ty(size, Scalar::U32),
        _ => module.u32_ty(),
    };
    b.convert(target, value)
}

fn min(b: &mut Builder<'_>, value: Handle<Value>, limit: Handle<Value>) -> Handle<Value> {
    let ty = b.module().value_type(value);
    b.builtin(ty, BuiltinFunction::Min, &[value, limit])
}

fn array_length(b: &mut Builder<'_>, array: Handle<Value>) -> Handle<Value> {
    let u32_ty = b.module().u32_ty();
    b.builtin(u32_ty, BuiltinFunction::ArrayLength, &[array])
}

/// `count - 1` for a texture query.
fn query_limit(
    b: &mut Builder<'_>,
    query: BuiltinFunction,
    args: &[Handle<Value>],
    ty: Handle<Type>,
) -> Handle<Value> {
    let count = b.builtin(ty, query, args);
    let one = b.u32(1);
    b.binary(BinaryOp::Subtract, count, one)
}

/// Moves `user` into `if condition { .. }`. A result is routed through a
/// zero-initialized function variable so it stays readable after the `if`.
fn guard(
    module: &mut Module,
    user: Handle<Instruction>,
    condition: Handle<Value>,
) -> Result<(), TransformError> {
    let kind = module.instructions[user].kind.clone();
    let result = module.result(user);
    let mut b = Builder::before(module, user)?;
    let slot = result.map(|value| {
        let ty = b.module().value_type(value);
        let var = b.var(
            "guarded",
            AddressSpace::Function,
            ty,
            StorageAccess::LOAD_STORE,
            None,
        );
        (value, ty, var)
    });
    let (_, accept, _) = b.if_(condition);
    let mut inner = Builder::at_end(module, accept);
    let moved = inner.push(kind, slot.map(|(_, ty, _)| ty));
    if let Some((old, _, var)) = slot {
        let value = inner
            .module()
            .result(moved)
            .ok_or_else(|| TransformError::Internal("guarded instruction lost its result".into()))?;
        inner.store(var, value);
        let loaded = Builder::before(module, user)?.load(var);
        module.replace_all_uses(old, loaded);
    }
    module.remove(user);
    Ok(())
}

fn clamp_access(
    module: &mut Module,
    config: &Config,
    inst: Handle<Instruction>,
) -> Result<bool, TransformError> {
    let InstructionKind::Access {
        object,
        ref indices,
    } = module.instructions[inst].kind
    else {
        return Ok(false);
    };
    let indices = indices.clone();
    let bounds = bounds(module, object, &indices);
    let mut clamped = indices.clone();
    let mut changed = false;
    for (k, (&index, bound)) in indices.iter().zip(bounds).enumerate() {
        let Some(bound) = pending_bound(module, config, object, &indices, k, bound) else {
            continue;
        };
        let mut b = Builder::before(module, inst)?;
        clamped[k] = match bound {
            Bound::Fixed(max) if b.module().values[index].is_constant() => b.u32(max),
            Bound::Fixed(max) => {
                let index = to_u32(&mut b, index);
                let limit = b.u32(max);
                min(&mut b, index, limit)
            }
            Bound::Runtime => {
                let array = if k == 0 {
                    object
                } else {
                    b.access_ptr(object, &clamped[..k])
                };
                let length = array_length(&mut b, array);
                let one = b.u32(1);
                let limit = b.binary(BinaryOp::Subtract, length, one);
                let index = to_u32(&mut b, index);
                min(&mut b, index, limit)
            }
        };
        changed = true;
    }
    if changed {
        if let InstructionKind::Access { indices, .. } = &mut module.instructions[inst].kind {
            *indices = clamped;
        }
        log::trace!("clamped access {}", inst.index());
    }
    Ok(changed)
}

/// The condition under which every index of an access is in range.
fn access_condition(
    module: &mut Module,
    config: &Config,
    inst: Handle<Instruction>,
) -> Result<Option<Handle<Value>>, TransformError> {
    let InstructionKind::Access {
        object,
        ref indices,
    } = module.instructions[inst].kind
    else {
        return Ok(None);
    };
    let indices = indices.clone();
    let bounds = bounds(module, object, &indices);
    let mut condition = None;
    for (k, (&index, bound)) in indices.iter().zip(bounds).enumerate() {
        let Some(bound) = pending_bound(module, config, object, &indices, k, bound) else {
            continue;
        };
        let mut b = Builder::before(module, inst)?;
        let check = match bound {
            Bound::Fixed(_) if b.module().values[index].is_constant() => b.bool(false),
            Bound::Fixed(max) => {
                let index = to_u32(&mut b, index);
                let limit = b.u32(max);
                b.binary(BinaryOp::LessEqual, index, limit)
            }
            Bound::Runtime => {
                let array = if k == 0 {
                    object
                } else {
                    b.access_ptr(object, &indices[..k])
                };
                let length = array_length(&mut b, array);
                let index = to_u32(&mut b, index);
                b.binary(BinaryOp::Less, index, length)
            }
        };
        condition = Some(match condition {
            Some(previous) => b.binary(BinaryOp::LogicalAnd, previous, check),
            None => check,
        });
    }
    Ok(condition)
}

fn predicate_access(
    module: &mut Module,
    config: &Config,
    inst: Handle<Instruction>,
) -> Result<bool, TransformError> {
    let Some(condition) = access_condition(module, config, inst)? else {
        return Ok(false);
    };
    let result = module
        .result(inst)
        .ok_or_else(|| TransformError::Internal("access without a result".into()))?;
    for (user, _) in module.uses_of(result) {
        guard(module, user, condition)?;
    }
    log::trace!("predicated access {}", inst.index());
    Ok(true)
}

fn clamp_texture(module: &mut Module, inst: Handle<Instruction>) -> Result<bool, TransformError> {
    let InstructionKind::BuiltinCall { builtin, ref args } = module.instructions[inst].kind else {
        return Ok(false);
    };
    let mut args = args.clone();
    let Some(ops) = texture_operands(module, builtin, &args) else {
        return Ok(false);
    };
    let texture = args[0];
    let mut changed = false;
    let mut b = Builder::before(module, inst)?;
    let u32_ty = b.module().u32_ty();

    let counted = [
        (ops.level, BuiltinFunction::TextureNumLevels),
        (ops.sample, BuiltinFunction::TextureNumSamples),
    ];
    for (slot, query) in counted {
        let limit = Limit::Query {
            query,
            texture,
            extra: Vec::new(),
        };
        if let Some(i) = slot.filter(|&i| !is_clamped(b.module(), args[i], &limit)) {
            let limit = query_limit(&mut b, query, &[texture], u32_ty);
            let value = to_u32(&mut b, args[i]);
            args[i] = min(&mut b, value, limit);
            changed = true;
        }
    }
    let dimensions = Limit::Query {
        query: BuiltinFunction::TextureDimensions,
        texture,
        extra: ops.level.map(|i| args[i]).into_iter().collect(),
    };
    if !is_clamped(b.module(), args[ops.coords], &dimensions) {
        let coords = to_u32(&mut b, args[ops.coords]);
        let ty = b.module().value_type(coords);
        let mut query = vec![texture];
        query.extend(ops.level.map(|i| args[i]));
        let limit = query_limit(&mut b, BuiltinFunction::TextureDimensions, &query, ty);
        args[ops.coords] = min(&mut b, coords, limit);
        changed = true;
    }
    let layers = Limit::Query {
        query: BuiltinFunction::TextureNumLayers,
        texture,
        extra: Vec::new(),
    };
    if let Some(i) = ops.layer.filter(|&i| !is_clamped(b.module(), args[i], &layers)) {
        let limit = query_limit(&mut b, BuiltinFunction::TextureNumLayers, &[texture], u32_ty);
        let value = to_u32(&mut b, args[i]);
        args[i] = min(&mut b, value, limit);
        changed = true;
    }

    if changed {
        if let InstructionKind::BuiltinCall { args: old, .. } = &mut module.instructions[inst].kind {
            *old = args;
        }
        log::trace!("clamped `{}` {}", builtin.name(), inst.index());
    }
    Ok(changed)
}

fn predicate_texture(module: &mut Module, inst: Handle<Instruction>) -> Result<bool, TransformError> {
    let InstructionKind::BuiltinCall { builtin, ref args } = module.instructions[inst].kind else {
        return Ok(false);
    };
    let args = args.clone();
    let Some(ops) = texture_operands(module, builtin, &args) else {
        return Ok(false);
    };
    let texture = args[0];
    let mut b = Builder::before(module, inst)?;
    let u32_ty = b.module().u32_ty();
    let bool_ty = b.module().bool_ty();
    let mut checks = Vec::new();

    let counted = [
        (ops.level, BuiltinFunction::TextureNumLevels),
        (ops.sample, BuiltinFunction::TextureNumSamples),
        (ops.layer, BuiltinFunction::TextureNumLayers),
    ];
    for (slot, query) in counted {
        if let Some(i) = slot {
            let count = b.builtin(u32_ty, query, &[texture]);
            let value = to_u32(&mut b, args[i]);
            checks.push(b.binary(BinaryOp::Less, value, count));
        }
    }
    let coords = to_u32(&mut b, args[ops.coords]);
    let ty = b.module().value_type(coords);
    let mut query = vec![texture];
    query.extend(ops.level.map(|i| args[i]));
    let dims = b.builtin(ty, BuiltinFunction::TextureDimensions, &query);
    let inside = b.binary(BinaryOp::Less, coords, dims);
    checks.push(if matches!(b.module().type_inner(inside), TypeInner::Vector { .. }) {
        b.builtin(bool_ty, BuiltinFunction::All, &[inside])
    } else {
        inside
    });

    let mut condition = checks[0];
    for &check in &checks[1..] {
        condition = b.binary(BinaryOp::LogicalAnd, condition, check);
    }
    guard(module, inst, condition)?;
    log::trace!("predicated `{}` {}", builtin.name(), inst.index());
    Ok(true)
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Site {
    Access(Handle<Instruction>, Policy),
    Texture(Handle<Instruction>, Policy),
}

/// Finds every access to protect. Accesses that would need a predicate
/// but have uses that cannot be guarded are rejected here, before any
/// rewrite.
fn plan(module: &Module, config: &Config) -> Result<Vec<Site>, TransformError> {
    let mut sites = Vec::new();
    for inst in module.all_instructions() {
        match module.instructions[inst].kind {
            InstructionKind::Access {
                object,
                ref indices,
            } => {
                let policy = access_policy(module, config, object);
                if policy == Policy::Ignore {
                    continue;
                }
                if policy == Policy::Predicate {
                    let pending = bounds(module, object, indices)
                        .into_iter()
                        .enumerate()
                        .any(|(k, bound)| {
                            pending_bound(module, config, object, indices, k, bound).is_some()
                        });
                    if !pending {
                        continue;
                    }
                    let result = module.result(inst);
                    for (user, operand) in result.map(|r| module.uses_of(r)).unwrap_or_default() {
                        if !guardable(module, user, operand) {
                            return unsupported(format!(
                                "cannot guard `{}` of a dynamically indexed pointer",
                                module.instructions[user].kind.name()
                            ));
                        }
                    }
                }
                sites.push(Site::Access(inst, policy));
            }
            InstructionKind::BuiltinCall {
                builtin: builtin @ (BuiltinFunction::TextureLoad | BuiltinFunction::TextureStore),
                ref args,
            } => {
                if config.texture == Policy::Ignore
                    || texture_operands(module, builtin, args).is_none()
                    || texture_binding(module, args[0])
                        .is_some_and(|b| config.bindings_ignored.contains(&b))
                {
                    continue;
                }
                sites.push(Site::Texture(inst, config.texture));
            }
            _ => {}
        }
    }
    Ok(sites)
}

/// Runs the robustness transform.
pub fn run(module: &mut Module, config: &Config) -> Result<Output, TransformError> {
    let mut output = Output::default();
    for site in plan(module, config)? {
        let (rewritten, predicated) = match site {
            Site::Access(inst, Policy::Predicate) => (predicate_access(module, config, inst)?, true),
            Site::Access(inst, _) => (clamp_access(module, config, inst)?, false),
            Site::Texture(inst, Policy::Predicate) => (predicate_texture(module, inst)?, true),
            Site::Texture(inst, _) => (clamp_texture(module, inst)?, false),
        };
        match (rewritten, predicated) {
            (true, true) => output.predicated += 1,
            (true, false) => output.clamped += 1,
            _ => {}
        }
    }
    log::debug!(
        "robustness: {} clamped, {} predicated",
        output.clamped,
        output.predicated
    );
    Ok(output)
}

/// [`Transform`] wrapper around [`run`].
#[derive(Debug)]
pub struct Robustness {
    config: Config,
}

impl Robustness {
    /// Checks the policy combination.
    pub fn new(config: Config) -> Result<Self, TransformError> {
        if config.value == Policy::Predicate {
            return Err(TransformError::Config(
                "indexing into values can be clamped or ignored, not predicated".into(),
            ));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Transform for Robustness {
    fn name(&self) -> &str {
        "robustness"
    }

    fn apply(&self, module: &mut Module) -> Result<TransformOutput, TransformError> {
        run(module, &self.config).map(TransformOutput::Robustness)
    }
}
