//! Display implementations and text dump for debugging.

use std::fmt::{self, Write as _};

use crate::Module;
use crate::arena::{Handle, UniqueArena};
use crate::binding::{AddressSpace, Binding, BuiltIn, StorageAccess};
use crate::instruction::{BinaryOp, Block, CaseSelector, InstructionKind, UnaryOp};
use crate::types::{
    ArraySize, Scalar, ScalarKind, TexelFormat, TextureClass, TextureDimension, Type, TypeInner,
    VectorSize,
};
use crate::value::{Literal, Value, ValueKind};

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScalarKind::Bool => write!(f, "bool"),
            ScalarKind::Sint => write!(f, "i{}", self.width * 8),
            ScalarKind::Uint => write!(f, "u{}", self.width * 8),
            ScalarKind::Float => write!(f, "f{}", self.width * 8),
        }
    }
}

impl fmt::Display for VectorSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u32)
    }
}

impl fmt::Display for StorageAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let has_load = self.contains(StorageAccess::LOAD);
        let has_store = self.contains(StorageAccess::STORE);
        match (has_load, has_store) {
            (true, true) => write!(f, "read_write"),
            (true, false) => write!(f, "read"),
            (false, true) => write!(f, "write"),
            (false, false) => write!(f, "none"),
        }
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Function => "function",
            Self::Private => "private",
            Self::Workgroup => "workgroup",
            Self::Uniform => "uniform",
            Self::Storage => "storage",
            Self::Immediate => "immediate",
            Self::Handle => "handle",
        };
        f.write_str(name)
    }
}

impl fmt::Display for BuiltIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Position => "position",
            Self::FragDepth => "frag_depth",
            Self::FrontFacing => "front_facing",
            Self::VertexIndex => "vertex_index",
            Self::InstanceIndex => "instance_index",
            Self::SampleIndex => "sample_index",
            Self::GlobalInvocationId => "global_invocation_id",
            Self::LocalInvocationId => "local_invocation_id",
            Self::LocalInvocationIndex => "local_invocation_index",
            Self::WorkgroupId => "workgroup_id",
            Self::NumWorkgroups => "num_workgroups",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuiltIn(b) => write!(f, "@builtin({b})"),
            Self::Location { location } => write!(f, "@location({location})"),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}i"),
            Self::U32(v) => write!(f, "{v}u"),
            Self::F32(v) => write!(f, "{v:?}f"),
        }
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Negate => "negate",
            Self::LogicalNot => "not",
            Self::BitwiseNot => "complement",
        };
        f.write_str(name)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Add => "add",
            Self::Subtract => "sub",
            Self::Multiply => "mul",
            Self::Divide => "div",
            Self::Modulo => "mod",
            Self::Equal => "eq",
            Self::NotEqual => "neq",
            Self::Less => "lt",
            Self::LessEqual => "lte",
            Self::Greater => "gt",
            Self::GreaterEqual => "gte",
            Self::LogicalAnd => "logical_and",
            Self::LogicalOr => "logical_or",
            Self::BitwiseAnd => "and",
            Self::BitwiseOr => "or",
            Self::BitwiseXor => "xor",
            Self::ShiftLeft => "shl",
            Self::ShiftRight => "shr",
        };
        f.write_str(name)
    }
}

impl fmt::Display for TexelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rgba8Unorm => "rgba8unorm",
            Self::Rgba8Snorm => "rgba8snorm",
            Self::Rgba8Uint => "rgba8uint",
            Self::Rgba8Sint => "rgba8sint",
            Self::Bgra8Unorm => "bgra8unorm",
            Self::Rgba16Float => "rgba16float",
            Self::R32Uint => "r32uint",
            Self::R32Sint => "r32sint",
            Self::R32Float => "r32float",
            Self::Rg32Float => "rg32float",
            Self::Rgba32Float => "rgba32float",
        };
        f.write_str(name)
    }
}

fn dim_suffix(dim: TextureDimension, arrayed: bool) -> String {
    let base = match dim {
        TextureDimension::D1 => "1d",
        TextureDimension::D2 => "2d",
        TextureDimension::D3 => "3d",
        TextureDimension::Cube => "cube",
    };
    if arrayed {
        format!("{base}_array")
    } else {
        base.to_string()
    }
}

/// Formats a type using the type arena for resolving inner references.
pub fn format_type(ty: &Type, types: &UniqueArena<Type>) -> String {
    if let Some(ref name) = ty.name {
        return name.clone();
    }
    format_type_inner(&ty.inner, types)
}

/// Formats a [`TypeInner`] using the type arena for resolving references.
pub fn format_type_inner(inner: &TypeInner, types: &UniqueArena<Type>) -> String {
    match inner {
        TypeInner::Scalar(s) => format!("{s}"),
        TypeInner::Vector { size, scalar } => format!("vec{size}<{scalar}>"),
        TypeInner::Matrix {
            columns,
            rows,
            scalar,
        } => format!("mat{columns}x{rows}<{scalar}>"),
        TypeInner::Atomic(s) => format!("atomic<{s}>"),
        TypeInner::Pointer {
            base,
            space,
            access,
        } => {
            let base_str = format_type(&types[*base], types);
            format!("ptr<{space}, {base_str}, {access}>")
        }
        TypeInner::Array { base, size, .. } => {
            let base_str = format_type(&types[*base], types);
            match size {
                ArraySize::Constant(n) => format!("array<{base_str}, {n}>"),
                ArraySize::Dynamic => format!("array<{base_str}>"),
            }
        }
        TypeInner::Struct { members, .. } => {
            let fields: Vec<_> = members
                .iter()
                .enumerate()
                .map(|(i, m)| {
                    let name = m.name.clone().unwrap_or_else(|| format!("member{i}"));
                    format!("{name}: {}", format_type(&types[m.ty], types))
                })
                .collect();
            format!("struct {{ {} }}", fields.join(", "))
        }
        TypeInner::Texture {
            dim,
            arrayed,
            class,
        } => match class {
            TextureClass::Sampled { kind, multi } => {
                let prefix = if *multi { "multisampled_" } else { "" };
                let scalar = Scalar {
                    kind: *kind,
                    width: 4,
                };
                format!("texture_{prefix}{}<{scalar}>", dim_suffix(*dim, *arrayed))
            }
            TextureClass::Depth { multi } => {
                let prefix = if *multi { "multisampled_" } else { "" };
                format!("texture_depth_{prefix}{}", dim_suffix(*dim, *arrayed))
            }
            TextureClass::Storage { format, access } => {
                format!(
                    "texture_storage_{}<{format}, {access}>",
                    dim_suffix(*dim, *arrayed)
                )
            }
            TextureClass::External => "texture_external".to_string(),
        },
        TypeInner::Sampler { comparison } => {
            if *comparison {
                "sampler_comparison".to_string()
            } else {
                "sampler".to_string()
            }
        }
    }
}

/// Formats a value reference: `%name`, `%N`, or a literal.
pub fn format_value(module: &Module, handle: Handle<Value>) -> String {
    let Some(value) = module.values.try_get(handle) else {
        return format!("<bad value {}>", handle.index());
    };
    match value.kind {
        ValueKind::Constant(lit) => format!("{lit}"),
        ValueKind::Zero => format!("{}()", format_type(&module.types[value.ty], &module.types)),
        _ => match value.name {
            Some(ref name) => format!("%{name}"),
            None => format!("%{}", handle.index()),
        },
    }
}

fn format_values(module: &Module, values: &[Handle<Value>]) -> String {
    values
        .iter()
        .map(|&v| format_value(module, v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Produces a human-readable dump of the module.
pub fn dump_module(module: &Module) -> String {
    let mut out = String::new();

    out.push_str("Types:\n");
    for (handle, ty) in module.types.iter() {
        let formatted = match (&ty.name, &ty.inner) {
            (Some(name), TypeInner::Struct { .. }) => {
                format!("{name} = {}", format_type_inner(&ty.inner, &module.types))
            }
            _ => format_type(ty, &module.types),
        };
        let _ = writeln!(out, "  {handle:?} {formatted}");
    }

    if !module.blocks[module.root].instructions.is_empty() {
        out.push_str("\nRoot:\n");
        dump_block(&mut out, module, module.root, 1);
    }

    if !module.function_order.is_empty() {
        out.push_str("\nFunctions:\n");
        for &handle in &module.function_order {
            dump_function(&mut out, module, handle);
        }
    }

    out
}

fn dump_function(out: &mut String, module: &Module, handle: Handle<crate::Function>) {
    let func = &module.functions[handle];
    let params: Vec<_> = func
        .params
        .iter()
        .map(|p| {
            let ty = format_type(&module.types[module.value_type(p.value)], &module.types);
            let binding = match p.binding {
                Some(b) => format!(" {b}"),
                None => String::new(),
            };
            format!("{}: {ty}{binding}", format_value(module, p.value))
        })
        .collect();
    let ret = match func.return_type {
        Some(ty) => format!(" -> {}", format_type(&module.types[ty], &module.types)),
        None => String::new(),
    };
    let stage = match (func.stage, func.workgroup_size) {
        (Some(crate::ShaderStage::Compute), Some([x, y, z])) => {
            format!("@compute @workgroup_size({x}, {y}, {z}) ")
        }
        (Some(crate::ShaderStage::Compute), None) => "@compute ".to_string(),
        (Some(crate::ShaderStage::Vertex), _) => "@vertex ".to_string(),
        (Some(crate::ShaderStage::Fragment), _) => "@fragment ".to_string(),
        (None, _) => String::new(),
    };
    let _ = writeln!(
        out,
        "  {stage}fn {}({}){ret} {{",
        func.name,
        params.join(", ")
    );
    dump_block(out, module, func.block, 2);
    out.push_str("  }\n");
}

fn dump_block(out: &mut String, module: &Module, block: Handle<Block>, depth: usize) {
    let indent = "  ".repeat(depth);
    for &inst_handle in &module.blocks[block].instructions {
        let inst = &module.instructions[inst_handle];
        let lhs = match inst.result {
            Some(v) => format!(
                "{}: {} = ",
                format_value(module, v),
                format_type(&module.types[module.value_type(v)], &module.types)
            ),
            None => String::new(),
        };
        let rhs = match &inst.kind {
            InstructionKind::Var {
                binding,
                initializer,
            } => {
                let mut s = "var".to_string();
                if let Some(init) = initializer {
                    s += &format!(" {}", format_value(module, *init));
                }
                if let Some(b) = binding {
                    s += &format!(" {b}");
                }
                s
            }
            InstructionKind::Unary { op, value } => {
                format!("{op} {}", format_value(module, *value))
            }
            InstructionKind::Binary { op, left, right } => format!(
                "{op} {}, {}",
                format_value(module, *left),
                format_value(module, *right)
            ),
            InstructionKind::Swizzle { object, indices } => {
                const XYZW: [char; 4] = ['x', 'y', 'z', 'w'];
                let comps: String = indices
                    .iter()
                    .map(|&i| XYZW.get(i as usize).copied().unwrap_or('?'))
                    .collect();
                format!("swizzle {}, {comps}", format_value(module, *object))
            }
            InstructionKind::Call { function, args } => {
                let name = module
                    .functions
                    .try_get(*function)
                    .map_or("<bad function>", |f| f.name.as_str());
                format!("call {name}({})", format_values(module, args))
            }
            InstructionKind::If {
                condition,
                accept,
                reject,
            } => {
                let _ = writeln!(out, "{indent}if {} {{", format_value(module, *condition));
                dump_block(out, module, *accept, depth + 1);
                let _ = writeln!(out, "{indent}}} else {{");
                dump_block(out, module, *reject, depth + 1);
                let _ = writeln!(out, "{indent}}}");
                continue;
            }
            InstructionKind::Loop { body, continuing } => {
                let _ = writeln!(out, "{indent}loop {{");
                dump_block(out, module, *body, depth + 1);
                let _ = writeln!(out, "{indent}}} continuing {{");
                dump_block(out, module, *continuing, depth + 1);
                let _ = writeln!(out, "{indent}}}");
                continue;
            }
            InstructionKind::Switch { selector, cases } => {
                let _ = writeln!(out, "{indent}switch {} {{", format_value(module, *selector));
                for case in cases {
                    let selectors: Vec<_> = case
                        .selectors
                        .iter()
                        .map(|s| match s {
                            CaseSelector::Value(v) => format!("{v}i"),
                            CaseSelector::Default => "default".to_string(),
                        })
                        .collect();
                    let _ = writeln!(out, "{indent}  case {} {{", selectors.join(", "));
                    dump_block(out, module, case.block, depth + 2);
                    let _ = writeln!(out, "{indent}  }}");
                }
                let _ = writeln!(out, "{indent}}}");
                continue;
            }
            other => {
                let operands = other.operands();
                if operands.is_empty() {
                    other.name().to_string()
                } else {
                    format!("{} {}", other.name(), format_values(module, &operands))
                }
            }
        };
        let _ = writeln!(out, "{indent}{lhs}{rhs}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BindingPoint;
    use crate::builder::Builder;

    #[test]
    fn format_scalar_types() {
        assert_eq!(format!("{}", Scalar::F32), "f32");
        assert_eq!(format!("{}", Scalar::I32), "i32");
        assert_eq!(format!("{}", Scalar::U32), "u32");
        assert_eq!(format!("{}", Scalar::BOOL), "bool");
        assert_eq!(format!("{}", Scalar::F16), "f16");
    }

    #[test]
    fn format_literals() {
        assert_eq!(format!("{}", Literal::U32(3)), "3u");
        assert_eq!(format!("{}", Literal::I32(-1)), "-1i");
        assert_eq!(format!("{}", Literal::F32(1.0)), "1.0f");
        assert_eq!(format!("{}", Literal::Bool(true)), "true");
    }

    #[test]
    fn format_handle_types() {
        let mut module = Module::new();
        let tex = module.texture_2d_f32_ty();
        let ext = module.external_texture_ty();
        let ptr = module.pointer_ty(AddressSpace::Handle, tex, StorageAccess::LOAD);
        assert_eq!(format_type(&module.types[tex], &module.types), "texture_2d<f32>");
        assert_eq!(
            format_type(&module.types[ext], &module.types),
            "texture_external"
        );
        assert_eq!(
            format_type(&module.types[ptr], &module.types),
            "ptr<handle, texture_2d<f32>, read>"
        );
    }

    #[test]
    fn dump_root_and_function() {
        let mut module = Module::new();
        let u32_ty = module.u32_ty();
        let root = module.root;
        let buf = Builder::at_end(&mut module, root).var(
            "buf",
            AddressSpace::Storage,
            u32_ty,
            StorageAccess::LOAD_STORE,
            Some(BindingPoint::new(0, 1)),
        );
        let f = module.new_function("main", None, Some(crate::ShaderStage::Compute));
        module.functions[f].workgroup_size = Some([64, 1, 1]);
        let block = module.functions[f].block;
        let mut b = Builder::at_end(&mut module, block);
        let one = b.u32(1);
        b.store(buf, one);
        b.return_(None);

        let dump = dump_module(&module);
        assert!(dump.contains(
            "%buf: ptr<storage, u32, read_write> = var @group(0) @binding(1)"
        ));
        assert!(dump.contains("@compute @workgroup_size(64, 1, 1) fn main()"));
        assert!(dump.contains("store %buf, 1u"));
        assert!(dump.contains("return"));
    }

    #[test]
    fn dump_nested_if() {
        let mut module = Module::new();
        let f = module.new_function("f", None, None);
        let block = module.functions[f].block;
        let mut b = Builder::at_end(&mut module, block);
        let cond = b.bool(true);
        b.if_(cond);
        b.return_(None);
        let dump = dump_module(&module);
        assert!(dump.contains("if true {"));
        assert!(dump.contains("} else {"));
        assert!(dump.contains("exit_if"));
    }
}
