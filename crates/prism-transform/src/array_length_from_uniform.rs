//! Replaces `arrayLength` with sizes read from a uniform buffer.
//!
//! Targets without a native runtime-array length query receive the byte
//! size of each storage buffer in a synthesized uniform,
//! `array<vec4<u32>, N>`, packed four sizes per element. The length of a
//! runtime-sized array is then `(size - offset) / stride`.
//!
//! Lengths of arrays reached through pointer parameters are forwarded as an
//! extra `u32` parameter, computed at every call site.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use prism_ir::{
    AddressSpace, ArraySize, BinaryOp, BindingPoint, Builder, BuiltinFunction, Capabilities,
    Function, Handle, Instruction, InstructionKind, Module, Scalar, StorageAccess, TypeInner,
    Value, ValueKind, VectorSize,
};

use crate::{Transform, TransformError, TransformOutput, unsupported};

/// Name of the synthesized sizes uniform.
pub const SIZES_NAME: &str = "prism_storage_buffer_sizes";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// Binding point of the sizes uniform.
    pub ubo_binding: BindingPoint,
    /// Storage buffer binding to its index in the sizes uniform.
    pub bindpoint_to_size_index: BTreeMap<BindingPoint, u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    /// Whether the sizes uniform was declared.
    pub needs_storage_buffer_sizes: bool,
    /// Size indices read by the module.
    pub used_size_indices: BTreeSet<u32>,
}

/// Byte offset of the runtime-sized array `indices` reach from `root`, and
/// its element stride.
fn array_layout(
    module: &Module,
    root: Handle<Value>,
    indices: &[Handle<Value>],
) -> Result<(u32, u32), TransformError> {
    let Some(mut ty) = module.pointee(module.value_type(root)) else {
        return Err(TransformError::Internal("arrayLength root is not a pointer".into()));
    };
    let mut offset = 0;
    for &index in indices {
        let constant = module.const_index(index);
        match (&module.types[ty].inner, constant) {
            (TypeInner::Struct { members, .. }, Some(i)) => {
                let member = members.get(i as usize).ok_or_else(|| {
                    TransformError::Internal("struct member out of range".into())
                })?;
                offset += member.offset;
                ty = member.ty;
            }
            (TypeInner::Array { base, stride, .. }, Some(i)) => {
                offset += stride * i;
                ty = *base;
            }
            _ => return unsupported("runtime-sized array behind a dynamic index"),
        }
    }
    match module.types[ty].inner {
        TypeInner::Array {
            size: ArraySize::Dynamic,
            stride,
            ..
        } => Ok((offset, stride)),
        _ => Err(TransformError::Internal(
            "arrayLength of a fixed-size array".into(),
        )),
    }
}

struct Rewriter<'c> {
    config: &'c Config,
    sizes: Option<Handle<Value>>,
    /// `(function, parameter index, member path)` to the forwarded length.
    lengths: HashMap<(Handle<Function>, u32, Vec<u32>), Handle<Value>>,
    queue: VecDeque<Handle<Instruction>>,
    output: Output,
}

impl Rewriter<'_> {
    fn sizes(&mut self, module: &mut Module) -> Handle<Value> {
        if let Some(sizes) = self.sizes {
            return sizes;
        }
        let max = self
            .config
            .bindpoint_to_size_index
            .values()
            .copied()
            .max()
            .unwrap_or(0);
        let vec4u = module.vec_ty(VectorSize::Quad, Scalar::U32);
        let array = module.array_ty(vec4u, ArraySize::Constant(max / 4 + 1), 16);
        let root = module.root;
        let sizes = Builder::at_end(module, root).var(
            SIZES_NAME,
            AddressSpace::Uniform,
            array,
            StorageAccess::LOAD,
            Some(self.config.ubo_binding),
        );
        log::debug!("declared `{SIZES_NAME}` at {}", self.config.ubo_binding);
        self.output.needs_storage_buffer_sizes = true;
        self.sizes = Some(sizes);
        sizes
    }

    fn rewrite(&mut self, module: &mut Module, inst: Handle<Instruction>) -> Result<(), TransformError> {
        let InstructionKind::BuiltinCall {
            builtin: BuiltinFunction::ArrayLength,
            ref args,
        } = module.instructions[inst].kind
        else {
            return Ok(());
        };
        let Some(&pointer) = args.first() else {
            return Ok(());
        };
        let Some(result) = module.result(inst) else {
            return Ok(());
        };
        let root = module.root_identifier(pointer);

        let length = match module.values[root.root].kind {
            ValueKind::Parameter { function, index } => {
                self.forwarded(module, function, index, &root.indices)?
            }
            ValueKind::Result(var) => {
                let Some(size_index) = module
                    .var_binding(var)
                    .and_then(|b| self.config.bindpoint_to_size_index.get(&b).copied())
                else {
                    return Ok(());
                };
                let (offset, stride) = array_layout(module, root.root, &root.indices)?;
                let sizes = self.sizes(module);
                self.output.used_size_indices.insert(size_index);

                let mut b = Builder::before(module, inst)?;
                let element = b.u32(size_index / 4);
                let component = b.u32(size_index % 4);
                let slot = b.access_ptr(sizes, &[element, component]);
                let mut bytes = b.load(slot);
                if offset != 0 {
                    let offset = b.u32(offset);
                    bytes = b.binary(BinaryOp::Subtract, bytes, offset);
                }
                let stride = b.u32(stride);
                b.binary(BinaryOp::Divide, bytes, stride)
            }
            _ => return Ok(()),
        };
        module.replace_all_uses(result, length);
        module.remove(inst);
        log::trace!("replaced arrayLength {}", inst.index());
        Ok(())
    }

    /// The length parameter of `function` carrying the array at `path` from
    /// its `index`-th parameter. Call sites pass `arrayLength` of the same
    /// path from their argument, which is queued for rewriting in turn.
    fn forwarded(
        &mut self,
        module: &mut Module,
        function: Handle<Function>,
        index: u32,
        indices: &[Handle<Value>],
    ) -> Result<Handle<Value>, TransformError> {
        let path = indices
            .iter()
            .map(|&i| module.const_index(i))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| TransformError::Unsupported("runtime-sized array behind a dynamic index".into()))?;
        let key = (function, index, path);
        if let Some(&length) = self.lengths.get(&key) {
            return Ok(length);
        }

        let param = module.functions[function].params[index as usize].value;
        let name = module.values[param]
            .name
            .clone()
            .unwrap_or_else(|| format!("param{index}"));
        let u32_ty = module.u32_ty();
        let length = module.add_param(function, u32_ty, format!("{name}_length"));
        for call in module.calls_to(function) {
            let InstructionKind::Call { ref args, .. } = module.instructions[call].kind else {
                continue;
            };
            let arg = args[index as usize];
            let mut b = Builder::before(module, call)?;
            let array = if key.2.is_empty() {
                arg
            } else {
                let path: Vec<_> = key.2.iter().map(|&i| b.u32(i)).collect();
                b.access_ptr(arg, &path)
            };
            let arg_length = b.builtin(u32_ty, BuiltinFunction::ArrayLength, &[array]);
            if let Some(query) = module.defining_instruction(arg_length) {
                self.queue.push_back(query);
            }
            if let InstructionKind::Call { args, .. } = &mut module.instructions[call].kind {
                args.push(arg_length);
            }
        }
        log::debug!(
            "forwarding `{name}_length` into `{}`",
            module.functions[function].name
        );
        self.lengths.insert(key, length);
        Ok(length)
    }
}

/// Runs the transform.
pub fn run(module: &mut Module, config: &Config) -> Result<Output, TransformError> {
    if config.bindpoint_to_size_index.is_empty() {
        return Ok(Output::default());
    }
    let mut rewriter = Rewriter {
        config,
        sizes: None,
        lengths: HashMap::new(),
        queue: module
            .all_instructions()
            .into_iter()
            .filter(|&i| {
                matches!(
                    module.instructions[i].kind,
                    InstructionKind::BuiltinCall {
                        builtin: BuiltinFunction::ArrayLength,
                        ..
                    }
                )
            })
            .collect(),
        output: Output::default(),
    };
    while let Some(inst) = rewriter.queue.pop_front() {
        rewriter.rewrite(module, inst)?;
    }
    Ok(rewriter.output)
}

/// [`Transform`] wrapper around [`run`].
#[derive(Debug, Default)]
pub struct ArrayLengthFromUniform {
    pub config: Config,
}

impl ArrayLengthFromUniform {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl Transform for ArrayLengthFromUniform {
    fn name(&self) -> &str {
        "array_length_from_uniform"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ALLOW_DUPLICATE_BINDINGS
    }

    fn apply(&self, module: &mut Module) -> Result<TransformOutput, TransformError> {
        run(module, &self.config).map(TransformOutput::ArrayLengthFromUniform)
    }
}
