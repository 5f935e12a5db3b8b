//! Expands external textures into two texture planes and a parameter
//! uniform.
//!
//! Every module-scope `texture_external` variable listed in the binding map
//! becomes three variables: `<name>_plane0` (reusing the original binding
//! point), `<name>_plane1` and `<name>_params`. Each load of the handle is
//! split into three loads at the same point, and each use of the loaded
//! handle is rewritten:
//!
//! - `textureDimensions(t)` reads `params.apparentSize` and adds one.
//! - `textureLoad(t, coords)` calls `TextureLoadExternal`.
//! - `textureSampleBaseClampToEdge(t, s, coords)` calls
//!   `TextureSampleExternal`.
//! - A handle passed to a user function turns the parameter into three
//!   parameters, and every caller forwards the three resources.
//!
//! The helper functions (and the shared `GammaCorrection`) are emitted once
//! per module, on first use.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use prism_ir::{
    AddressSpace, BinaryOp, BindingPoint, Builder, BuiltinFunction, Function, Handle,
    Instruction, InstructionKind, Module, Scalar, StorageAccess, StructMember, TextureClass,
    Type, TypeInner, Value, VectorSize,
};

use crate::{Transform, TransformError, TransformOutput, unsupported};

/// Binding points of the resources synthesized for one external texture.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct BindingPoints {
    pub plane1: BindingPoint,
    pub params: BindingPoint,
}

/// External-texture binding point to the synthesized binding points.
pub type BindingsMap = BTreeMap<BindingPoint, BindingPoints>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    pub bindings: BindingsMap,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    /// Original binding points of the expanded textures.
    pub expanded: Vec<BindingPoint>,
}

/// Member indices of the `ExternalTextureParams` struct.
mod fields {
    pub const NUM_PLANES: u32 = 0;
    pub const DO_YUV_TO_RGB_CONVERSION_ONLY: u32 = 1;
    pub const YUV_TO_RGB_CONVERSION_MATRIX: u32 = 2;
    pub const GAMMA_DECODE_PARAMS: u32 = 3;
    pub const GAMMA_ENCODE_PARAMS: u32 = 4;
    pub const GAMUT_CONVERSION_MATRIX: u32 = 5;
    pub const SAMPLE_TRANSFORM: u32 = 6;
    pub const LOAD_TRANSFORM: u32 = 7;
    pub const SAMPLE_PLANE0_RECT_MIN: u32 = 8;
    pub const SAMPLE_PLANE0_RECT_MAX: u32 = 9;
    pub const SAMPLE_PLANE1_RECT_MIN: u32 = 10;
    pub const SAMPLE_PLANE1_RECT_MAX: u32 = 11;
    pub const APPARENT_SIZE: u32 = 12;
    pub const PLANE1_COORD_FACTOR: u32 = 13;
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// A use of an external-texture value to rewrite.
#[derive(Clone, Copy, Debug)]
enum Site {
    /// Load of a target variable.
    Load {
        inst: Handle<Instruction>,
        var: Handle<Value>,
    },
    Let {
        inst: Handle<Instruction>,
        source: Handle<Value>,
    },
    Dimensions {
        inst: Handle<Instruction>,
        handle: Handle<Value>,
    },
    TextureLoad {
        inst: Handle<Instruction>,
        handle: Handle<Value>,
    },
    Sample {
        inst: Handle<Instruction>,
        handle: Handle<Value>,
    },
}

#[derive(Debug, Default)]
struct Plan {
    /// Target variables with their binding points.
    targets: Vec<(Handle<Instruction>, BindingPoint, BindingPoints)>,
    /// Function parameters to split, by function.
    params: BTreeMap<Handle<Function>, BTreeSet<usize>>,
    /// Rewrites in discovery order. A value is always mapped before the
    /// sites that use it.
    sites: Vec<Site>,
    /// Calls forwarding an expanded value.
    calls: BTreeSet<Handle<Instruction>>,
}

fn is_external(module: &Module, ty: Handle<Type>) -> bool {
    matches!(
        module.types[ty].inner,
        TypeInner::Texture {
            class: TextureClass::External,
            ..
        }
    )
}

/// Finds everything to rewrite without touching the module.
fn plan(module: &Module, config: &Config) -> Result<Plan, TransformError> {
    let mut plan = Plan::default();
    let mut queue = VecDeque::new();
    let mut expanded = HashSet::new();

    for var in module.root_vars() {
        let Some(value) = module.result(var) else {
            continue;
        };
        let Some(store) = module.pointee(module.value_type(value)) else {
            continue;
        };
        if !is_external(module, store) {
            continue;
        }
        let Some(bp) = module.var_binding(var) else {
            continue;
        };
        let Some(&points) = config.bindings.get(&bp) else {
            log::warn!("external texture at {bp} has no binding map entry; leaving it as is");
            continue;
        };
        plan.targets.push((var, bp, points));
        for (inst, _) in module.uses_of(value) {
            match module.instructions[inst].kind {
                InstructionKind::Load { .. } => {
                    plan.sites.push(Site::Load { inst, var: value });
                    if let Some(r) = module.result(inst) {
                        expanded.insert(r);
                        queue.push_back(r);
                    }
                }
                ref other => {
                    return unsupported(format!(
                        "`{}` of external texture variable at {bp}",
                        other.name()
                    ));
                }
            }
        }
    }

    while let Some(handle) = queue.pop_front() {
        for (inst, operand) in module.uses_of(handle) {
            let site = match module.instructions[inst].kind {
                InstructionKind::Let { .. } => {
                    if let Some(r) = module.result(inst) {
                        expanded.insert(r);
                        queue.push_back(r);
                    }
                    Site::Let {
                        inst,
                        source: handle,
                    }
                }
                InstructionKind::Call { function, .. } => {
                    let param = module.functions[function]
                        .params
                        .get(operand)
                        .ok_or_else(|| {
                            TransformError::Internal(format!(
                                "call to `{}` has more arguments than parameters",
                                module.functions[function].name
                            ))
                        })?;
                    plan.params.entry(function).or_default().insert(operand);
                    plan.calls.insert(inst);
                    if expanded.insert(param.value) {
                        queue.push_back(param.value);
                    }
                    continue;
                }
                InstructionKind::BuiltinCall { builtin, .. } if operand == 0 => match builtin {
                    BuiltinFunction::TextureDimensions => Site::Dimensions { inst, handle },
                    BuiltinFunction::TextureLoad => Site::TextureLoad { inst, handle },
                    BuiltinFunction::TextureSampleBaseClampToEdge => Site::Sample { inst, handle },
                    other => {
                        return unsupported(format!("`{}` on an external texture", other.name()));
                    }
                },
                ref other => {
                    return unsupported(format!("`{}` use of an external texture", other.name()));
                }
            };
            plan.sites.push(site);
        }
    }

    for (&function, indices) in &plan.params {
        for call in module.calls_to(function) {
            let InstructionKind::Call { ref args, .. } = module.instructions[call].kind else {
                continue;
            };
            for &k in indices {
                if !args.get(k).is_some_and(|a| expanded.contains(a)) {
                    return unsupported(format!(
                        "argument {k} of `{}` is an external texture that is not being expanded",
                        module.functions[function].name
                    ));
                }
            }
        }
    }
    Ok(plan)
}

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

/// Types used by the synthesized declarations and helpers.
#[derive(Clone, Copy, Debug)]
struct Types {
    texture: Handle<Type>,
    sampler: Handle<Type>,
    params: Handle<Type>,
    gamma: Handle<Type>,
    f32: Handle<Type>,
    u32: Handle<Type>,
    vec2f: Handle<Type>,
    vec3f: Handle<Type>,
    vec4f: Handle<Type>,
    vec2u: Handle<Type>,
    mat3x2f: Handle<Type>,
    mat3x3f: Handle<Type>,
    mat3x4f: Handle<Type>,
}

impl Types {
    fn new(module: &mut Module) -> Self {
        let f32 = module.f32_ty();
        let u32 = module.u32_ty();
        let vec2f = module.vec_ty(VectorSize::Bi, Scalar::F32);
        let vec2u = module.vec_ty(VectorSize::Bi, Scalar::U32);
        let mat3x2f = module.mat_ty(VectorSize::Tri, VectorSize::Bi, Scalar::F32);
        let mat3x3f = module.mat_ty(VectorSize::Tri, VectorSize::Tri, Scalar::F32);
        let mat3x4f = module.mat_ty(VectorSize::Tri, VectorSize::Quad, Scalar::F32);

        let def = |name: &str, ty, offset| StructMember {
            name: Some(name.to_string()),
            ty,
            offset,
        };
        let gamma = module.struct_ty(
            "GammaTransferParams",
            vec![
                def("G", f32, 0),
                def("A", f32, 4),
                def("B", f32, 8),
                def("C", f32, 12),
                def("D", f32, 16),
                def("E", f32, 20),
                def("F", f32, 24),
                def("padding", u32, 28),
            ],
            32,
        );
        let params = module.struct_ty(
            "ExternalTextureParams",
            vec![
                def("numPlanes", u32, 0),
                def("doYuvToRgbConversionOnly", u32, 4),
                def("yuvToRgbConversionMatrix", mat3x4f, 16),
                def("gammaDecodeParams", gamma, 64),
                def("gammaEncodeParams", gamma, 96),
                def("gamutConversionMatrix", mat3x3f, 128),
                def("sampleTransform", mat3x2f, 176),
                def("loadTransform", mat3x2f, 200),
                def("samplePlane0RectMin", vec2f, 224),
                def("samplePlane0RectMax", vec2f, 232),
                def("samplePlane1RectMin", vec2f, 240),
                def("samplePlane1RectMax", vec2f, 248),
                def("apparentSize", vec2u, 256),
                def("plane1CoordFactor", vec2f, 264),
            ],
            272,
        );
        Self {
            texture: module.texture_2d_f32_ty(),
            sampler: module.sampler_ty(false),
            params,
            gamma,
            f32,
            u32,
            vec2f,
            vec3f: module.vec_ty(VectorSize::Tri, Scalar::F32),
            vec4f: module.vec_ty(VectorSize::Quad, Scalar::F32),
            vec2u,
            mat3x2f,
            mat3x3f,
            mat3x4f,
        }
    }
}

/// Lazily emitted helper functions.
#[derive(Debug)]
struct Helpers {
    types: Types,
    gamma_correction: Option<Handle<Function>>,
    texture_load: Option<Handle<Function>>,
    texture_sample: Option<Handle<Function>>,
    /// Number of helpers moved to the front of the declaration order.
    placed: usize,
}

/// Reads member `index` of the params struct value `params`.
fn member(b: &mut Builder<'_>, ty: Handle<Type>, params: Handle<Value>, index: u32) -> Handle<Value> {
    let i = b.u32(index);
    b.access(ty, params, &[i])
}

impl Helpers {
    fn new(types: Types) -> Self {
        Self {
            types,
            gamma_correction: None,
            texture_load: None,
            texture_sample: None,
            placed: 0,
        }
    }

    /// Declares a helper ahead of every other function so it precedes its
    /// callers.
    fn declare(&mut self, module: &mut Module, name: &str, ret: Handle<Type>) -> Handle<Function> {
        let function = module.new_function(name, Some(ret), None);
        module.function_order.retain(|&f| f != function);
        module.function_order.insert(self.placed, function);
        self.placed += 1;
        log::debug!("emitting helper `{name}`");
        function
    }

    /// `GammaCorrection(v: vec3f, params: GammaTransferParams) -> vec3f`
    fn gamma_correction(&mut self, module: &mut Module) -> Handle<Function> {
        if let Some(f) = self.gamma_correction {
            return f;
        }
        let t = self.types;
        let function = self.declare(module, "GammaCorrection", t.vec3f);
        let v = module.add_param(function, t.vec3f, "v");
        let params = module.add_param(function, t.gamma, "params");
        let block = module.functions[function].block;

        let mut b = Builder::at_end(module, block);
        let g = member(&mut b, t.f32, params, 0);
        let a = member(&mut b, t.f32, params, 1);
        let b_coef = member(&mut b, t.f32, params, 2);
        let c = member(&mut b, t.f32, params, 3);
        let d = member(&mut b, t.f32, params, 4);
        let e = member(&mut b, t.f32, params, 5);
        let f = member(&mut b, t.f32, params, 6);

        let abs_v = b.builtin(t.vec3f, BuiltinFunction::Abs, &[v]);
        let sign_v = b.builtin(t.vec3f, BuiltinFunction::Sign, &[v]);
        let d3 = b.construct(t.vec3f, &[d, d, d]);
        let cond = b.binary(BinaryOp::Less, abs_v, d3);

        // Linear segment: sign(v) * (C * |v| + F)
        let scaled = b.binary(BinaryOp::Multiply, c, abs_v);
        let offset = b.binary(BinaryOp::Add, scaled, f);
        let linear = b.binary(BinaryOp::Multiply, sign_v, offset);

        // Power segment: sign(v) * (pow(A * |v| + B, G) + E)
        let scaled = b.binary(BinaryOp::Multiply, a, abs_v);
        let base = b.binary(BinaryOp::Add, scaled, b_coef);
        let g3 = b.construct(t.vec3f, &[g, g, g]);
        let powed = b.builtin(t.vec3f, BuiltinFunction::Pow, &[base, g3]);
        let offset = b.binary(BinaryOp::Add, powed, e);
        let curve = b.binary(BinaryOp::Multiply, sign_v, offset);

        let result = b.builtin(t.vec3f, BuiltinFunction::Select, &[curve, linear, cond]);
        b.return_(Some(result));

        self.gamma_correction = Some(function);
        function
    }

    /// Emits the part shared by both texel helpers: if the conversion is
    /// not YUV-only, gamma-decode, apply the gamut matrix and gamma-encode
    /// the color stored in `color`, then return it.
    fn finish_color(
        &mut self,
        module: &mut Module,
        block: Handle<prism_ir::Block>,
        params: Handle<Value>,
        color: Handle<Value>,
    ) {
        let t = self.types;
        let gamma = self.gamma_correction(module);

        let mut b = Builder::at_end(module, block);
        let yuv_only = member(&mut b, t.u32, params, fields::DO_YUV_TO_RGB_CONVERSION_ONLY);
        let zero = b.u32(0);
        let convert = b.binary(BinaryOp::Equal, yuv_only, zero);
        let (_, accept, _) = b.if_(convert);
        let result = b.load(color);
        b.return_(Some(result));

        let mut b = Builder::at_end(module, accept);
        let current = b.load(color);
        let rgb = b.swizzle(current, &[0, 1, 2]);
        let alpha = b.swizzle(current, &[3]);
        let decode = member(&mut b, t.gamma, params, fields::GAMMA_DECODE_PARAMS);
        let linear = b.call_value(gamma, &[rgb, decode]);
        let gamut = member(&mut b, t.mat3x3f, params, fields::GAMUT_CONVERSION_MATRIX);
        let encode = member(&mut b, t.gamma, params, fields::GAMMA_ENCODE_PARAMS);
        if let Some(linear) = linear {
            let converted = b.binary(BinaryOp::Multiply, gamut, linear);
            if let Some(out) = b.call_value(gamma, &[converted, encode]) {
                let rgba = b.construct(t.vec4f, &[out, alpha]);
                b.store(color, rgba);
            }
        }
    }

    /// Reconstructs RGB from luma `y` and chroma `uv` with the YUV matrix
    /// and stores it in `color`.
    fn store_yuv(
        b: &mut Builder<'_>,
        t: Types,
        params: Handle<Value>,
        y: Handle<Value>,
        uv: Handle<Value>,
        color: Handle<Value>,
    ) {
        let one = b.f32(1.0);
        let yuv = b.construct(t.vec4f, &[y, uv, one]);
        let matrix = member(b, t.mat3x4f, params, fields::YUV_TO_RGB_CONVERSION_MATRIX);
        let rgb = b.binary(BinaryOp::Multiply, yuv, matrix);
        let rgba = b.construct(t.vec4f, &[rgb, one]);
        b.store(color, rgba);
    }

    /// `TextureLoadExternal(plane0, plane1, params, coords: vec2u) -> vec4f`
    fn texture_load(&mut self, module: &mut Module) -> Handle<Function> {
        if let Some(f) = self.texture_load {
            return f;
        }
        self.gamma_correction(module);
        let t = self.types;
        let function = self.declare(module, "TextureLoadExternal", t.vec4f);
        let plane0 = module.add_param(function, t.texture, "plane0");
        let plane1 = module.add_param(function, t.texture, "plane1");
        let params = module.add_param(function, t.params, "params");
        let coords = module.add_param(function, t.vec2u, "coords");
        let block = module.functions[function].block;

        let mut b = Builder::at_end(module, block);
        let apparent = member(&mut b, t.vec2u, params, fields::APPARENT_SIZE);
        let clamped = b.builtin(t.vec2u, BuiltinFunction::Min, &[coords, apparent]);
        let clamped_f = b.convert(t.vec2f, clamped);
        let one = b.f32(1.0);
        let homogeneous = b.construct(t.vec3f, &[clamped_f, one]);
        let transform = member(&mut b, t.mat3x2f, params, fields::LOAD_TRANSFORM);
        let transformed = b.binary(BinaryOp::Multiply, transform, homogeneous);
        let rounded = b.builtin(t.vec2f, BuiltinFunction::Round, &[transformed]);
        let plane0_coords = b.convert(t.vec2u, rounded);
        let color = b.var(
            "color",
            AddressSpace::Function,
            t.vec4f,
            StorageAccess::LOAD_STORE,
            None,
        );
        let num_planes = member(&mut b, t.u32, params, fields::NUM_PLANES);
        let one_u = b.u32(1);
        let single = b.binary(BinaryOp::Equal, num_planes, one_u);
        let (_, accept, reject) = b.if_(single);

        let mut b = Builder::at_end(module, accept);
        let level = b.u32(0);
        let texel = b.builtin(t.vec4f, BuiltinFunction::TextureLoad, &[plane0, plane0_coords, level]);
        b.store(color, texel);

        let mut b = Builder::at_end(module, reject);
        let level = b.u32(0);
        let luma = b.builtin(t.vec4f, BuiltinFunction::TextureLoad, &[plane0, plane0_coords, level]);
        let y = b.swizzle(luma, &[0]);
        let factor = member(&mut b, t.vec2f, params, fields::PLANE1_COORD_FACTOR);
        let scaled = b.convert(t.vec2f, plane0_coords);
        let scaled = b.binary(BinaryOp::Multiply, scaled, factor);
        let plane1_coords = b.convert(t.vec2u, scaled);
        let chroma = b.builtin(t.vec4f, BuiltinFunction::TextureLoad, &[plane1, plane1_coords, level]);
        let uv = b.swizzle(chroma, &[0, 1]);
        Self::store_yuv(&mut b, t, params, y, uv, color);

        self.finish_color(module, block, params, color);
        self.texture_load = Some(function);
        function
    }

    /// `TextureSampleExternal(plane0, plane1, params, sampler, coords: vec2f) -> vec4f`
    fn texture_sample(&mut self, module: &mut Module) -> Handle<Function> {
        if let Some(f) = self.texture_sample {
            return f;
        }
        self.gamma_correction(module);
        let t = self.types;
        let function = self.declare(module, "TextureSampleExternal", t.vec4f);
        let plane0 = module.add_param(function, t.texture, "plane0");
        let plane1 = module.add_param(function, t.texture, "plane1");
        let params = module.add_param(function, t.params, "params");
        let sampler = module.add_param(function, t.sampler, "smp");
        let coords = module.add_param(function, t.vec2f, "coords");
        let block = module.functions[function].block;

        let mut b = Builder::at_end(module, block);
        let one = b.f32(1.0);
        let homogeneous = b.construct(t.vec3f, &[coords, one]);
        let transform = member(&mut b, t.mat3x2f, params, fields::SAMPLE_TRANSFORM);
        let modified = b.binary(BinaryOp::Multiply, transform, homogeneous);
        let rect0_min = member(&mut b, t.vec2f, params, fields::SAMPLE_PLANE0_RECT_MIN);
        let rect0_max = member(&mut b, t.vec2f, params, fields::SAMPLE_PLANE0_RECT_MAX);
        let plane0_coords = b.builtin(
            t.vec2f,
            BuiltinFunction::Clamp,
            &[modified, rect0_min, rect0_max],
        );
        let color = b.var(
            "color",
            AddressSpace::Function,
            t.vec4f,
            StorageAccess::LOAD_STORE,
            None,
        );
        let num_planes = member(&mut b, t.u32, params, fields::NUM_PLANES);
        let one_u = b.u32(1);
        let single = b.binary(BinaryOp::Equal, num_planes, one_u);
        let (_, accept, reject) = b.if_(single);

        let mut b = Builder::at_end(module, accept);
        let level = b.f32(0.0);
        let texel = b.builtin(
            t.vec4f,
            BuiltinFunction::TextureSampleLevel,
            &[plane0, sampler, plane0_coords, level],
        );
        b.store(color, texel);

        let mut b = Builder::at_end(module, reject);
        let level = b.f32(0.0);
        let rect1_min = member(&mut b, t.vec2f, params, fields::SAMPLE_PLANE1_RECT_MIN);
        let rect1_max = member(&mut b, t.vec2f, params, fields::SAMPLE_PLANE1_RECT_MAX);
        let plane1_coords = b.builtin(
            t.vec2f,
            BuiltinFunction::Clamp,
            &[modified, rect1_min, rect1_max],
        );
        let luma = b.builtin(
            t.vec4f,
            BuiltinFunction::TextureSampleLevel,
            &[plane0, sampler, plane0_coords, level],
        );
        let y = b.swizzle(luma, &[0]);
        let chroma = b.builtin(
            t.vec4f,
            BuiltinFunction::TextureSampleLevel,
            &[plane1, sampler, plane1_coords, level],
        );
        let uv = b.swizzle(chroma, &[0, 1]);
        Self::store_yuv(&mut b, t, params, y, uv, color);

        self.finish_color(module, block, params, color);
        self.texture_sample = Some(function);
        function
    }
}

// ---------------------------------------------------------------------------
// Rewriting
// ---------------------------------------------------------------------------

type Triple = [Handle<Value>; 3];

fn triple(map: &HashMap<Handle<Value>, Triple>, value: Handle<Value>) -> Result<Triple, TransformError> {
    map.get(&value).copied().ok_or_else(|| {
        TransformError::Internal(format!(
            "external texture value {} was not expanded",
            value.index()
        ))
    })
}

fn builtin_args(module: &Module, inst: Handle<Instruction>) -> Vec<Handle<Value>> {
    match module.instructions[inst].kind {
        InstructionKind::BuiltinCall { ref args, .. } => args.clone(),
        _ => Vec::new(),
    }
}

/// Replaces `inst` by `value` and detaches it.
fn retire(module: &mut Module, inst: Handle<Instruction>, value: Option<Handle<Value>>) {
    if let (Some(old), Some(new)) = (module.result(inst), value) {
        module.replace_all_uses(old, new);
    }
    module.remove(inst);
}

/// Runs the expansion.
pub fn run(module: &mut Module, config: &Config) -> Result<Output, TransformError> {
    let plan = plan(module, config)?;
    if plan.targets.is_empty() {
        return Ok(Output::default());
    }

    let types = Types::new(module);
    let mut helpers = Helpers::new(types);
    let mut triples: HashMap<Handle<Value>, Triple> = HashMap::new();

    // Split parameters, highest index first so lower indices stay put.
    for (&function, indices) in &plan.params {
        for &k in indices.iter().rev() {
            let old = module.remove_param(function, k);
            let base = module.values[old.value]
                .name
                .clone()
                .unwrap_or_else(|| format!("texture{k}"));
            let params = module.insert_param(function, k, types.params, format!("{base}_params"));
            let plane1 = module.insert_param(function, k, types.texture, format!("{base}_plane1"));
            let plane0 = module.insert_param(function, k, types.texture, format!("{base}_plane0"));
            triples.insert(old.value, [plane0, plane1, params]);
        }
        log::debug!(
            "split {} external texture parameter(s) of `{}`",
            indices.len(),
            module.functions[function].name
        );
    }

    let mut output = Output::default();
    for &(var, bp, points) in &plan.targets {
        let Some(value) = module.result(var) else {
            continue;
        };
        let name = module.values[value]
            .name
            .clone()
            .unwrap_or_else(|| format!("ext_tex_{}_{}", bp.group, bp.binding));
        let mut b = Builder::before(module, var)?;
        let plane0 = b.var(
            format!("{name}_plane0"),
            AddressSpace::Handle,
            types.texture,
            StorageAccess::LOAD,
            Some(bp),
        );
        let plane1 = b.var(
            format!("{name}_plane1"),
            AddressSpace::Handle,
            types.texture,
            StorageAccess::LOAD,
            Some(points.plane1),
        );
        let params = b.var(
            format!("{name}_params"),
            AddressSpace::Uniform,
            types.params,
            StorageAccess::LOAD,
            Some(points.params),
        );
        module.remove(var);
        triples.insert(value, [plane0, plane1, params]);
        log::debug!(
            "expanded `{name}` at {bp} into planes at {bp} and {} with params at {}",
            points.plane1,
            points.params
        );
        output.expanded.push(bp);
    }

    for &site in &plan.sites {
        match site {
            Site::Load { inst, var } => {
                let [p0, p1, params] = triple(&triples, var)?;
                let mut b = Builder::before(module, inst)?;
                let loaded = [b.load(p0), b.load(p1), b.load(params)];
                if let Some(r) = module.result(inst) {
                    triples.insert(r, loaded);
                }
                module.remove(inst);
            }
            Site::Let { inst, source } => {
                let loaded = triple(&triples, source)?;
                if let Some(r) = module.result(inst) {
                    triples.insert(r, loaded);
                }
                module.remove(inst);
            }
            Site::Dimensions { inst, handle } => {
                let [_, _, params] = triple(&triples, handle)?;
                let mut b = Builder::before(module, inst)?;
                let apparent = member(&mut b, types.vec2u, params, fields::APPARENT_SIZE);
                let one = b.u32(1);
                let ones = b.construct(types.vec2u, &[one, one]);
                let size = b.binary(BinaryOp::Add, apparent, ones);
                retire(module, inst, Some(size));
            }
            Site::TextureLoad { inst, handle } => {
                let [p0, p1, params] = triple(&triples, handle)?;
                let coords = builtin_args(module, inst)
                    .get(1)
                    .copied()
                    .ok_or_else(|| TransformError::Internal("textureLoad without coordinates".into()))?;
                let helper = helpers.texture_load(module);
                let needs_convert = module.value_type(coords) != types.vec2u;
                let mut b = Builder::before(module, inst)?;
                let coords = if needs_convert {
                    b.convert(types.vec2u, coords)
                } else {
                    coords
                };
                let texel = b.call_value(helper, &[p0, p1, params, coords]);
                retire(module, inst, texel);
            }
            Site::Sample { inst, handle } => {
                let [p0, p1, params] = triple(&triples, handle)?;
                let args = builtin_args(module, inst);
                let (Some(&sampler), Some(&coords)) = (args.get(1), args.get(2)) else {
                    return Err(TransformError::Internal(
                        "textureSampleBaseClampToEdge without sampler and coordinates".into(),
                    ));
                };
                let helper = helpers.texture_sample(module);
                let mut b = Builder::before(module, inst)?;
                let texel = b.call_value(helper, &[p0, p1, params, sampler, coords]);
                retire(module, inst, texel);
            }
        }
    }

    for &call in &plan.calls {
        let InstructionKind::Call { ref args, .. } = module.instructions[call].kind else {
            continue;
        };
        let forwarded: Vec<_> = args
            .iter()
            .flat_map(|a| match triples.get(a) {
                Some(t) => t.to_vec(),
                None => vec![*a],
            })
            .collect();
        if let InstructionKind::Call { args, .. } = &mut module.instructions[call].kind {
            *args = forwarded;
        }
    }

    Ok(output)
}

/// [`Transform`] wrapper around [`run`].
#[derive(Debug, Default)]
pub struct MultiplanarExternalTexture {
    pub config: Config,
}

impl MultiplanarExternalTexture {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl Transform for MultiplanarExternalTexture {
    fn name(&self) -> &str {
        "multiplanar_external_texture"
    }

    fn apply(&self, module: &mut Module) -> Result<TransformOutput, TransformError> {
        run(module, &self.config).map(TransformOutput::MultiplanarExternalTexture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_ir::{Capabilities, ShaderStage, dump_module, validate};

    fn ext_var(module: &mut Module, name: &str, bp: BindingPoint) -> Handle<Value> {
        let ty = module.external_texture_ty();
        let root = module.root;
        Builder::at_end(module, root).var(name, AddressSpace::Handle, ty, StorageAccess::LOAD, Some(bp))
    }

    fn config(entries: &[((u32, u32), (u32, u32), (u32, u32))]) -> Config {
        Config {
            bindings: entries
                .iter()
                .map(|&((g, b), (g1, b1), (g2, b2))| {
                    (
                        BindingPoint::new(g, b),
                        BindingPoints {
                            plane1: BindingPoint::new(g1, b1),
                            params: BindingPoint::new(g2, b2),
                        },
                    )
                })
                .collect(),
        }
    }

    fn fragment(module: &mut Module) -> (Handle<Function>, Handle<prism_ir::Block>) {
        let vec4f = module.vec_ty(VectorSize::Quad, Scalar::F32);
        let f = module.new_function("main", Some(vec4f), Some(ShaderStage::Fragment));
        let block = module.functions[f].block;
        (f, block)
    }

    fn load_module() -> Module {
        let mut module = Module::new();
        let tex = ext_var(&mut module, "t", BindingPoint::new(1, 2));
        let vec2i = module.vec_ty(VectorSize::Bi, Scalar::I32);
        let vec4f = module.vec_ty(VectorSize::Quad, Scalar::F32);
        let (_, block) = fragment(&mut module);
        let mut b = Builder::at_end(&mut module, block);
        let handle = b.load(tex);
        let coords = b.zero(vec2i);
        let texel = b.builtin(vec4f, BuiltinFunction::TextureLoad, &[handle, coords]);
        b.return_(Some(texel));
        module
    }

    #[test]
    fn load_becomes_helper_call() {
        let mut module = load_module();
        validate(&module, Capabilities::EMPTY).unwrap();
        let out = run(&mut module, &config(&[((1, 2), (1, 3), (1, 4))])).unwrap();
        assert_eq!(out.expanded, vec![BindingPoint::new(1, 2)]);
        validate(&module, Capabilities::EMPTY).unwrap();

        let dump = dump_module(&module);
        assert!(dump.contains("%t_plane0: ptr<handle, texture_2d<f32>, read> = var @group(1) @binding(2)"));
        assert!(dump.contains("%t_plane1: ptr<handle, texture_2d<f32>, read> = var @group(1) @binding(3)"));
        assert!(dump.contains(
            "%t_params: ptr<uniform, ExternalTextureParams, read> = var @group(1) @binding(4)"
        ));
        assert!(!dump.contains("texture_external, read> = var"));
        assert!(dump.contains("fn TextureLoadExternal(%plane0: texture_2d<f32>"));
        assert!(dump.contains("fn GammaCorrection("));
        assert!(!dump.contains("fn TextureSampleExternal("));
        assert!(dump.contains("call TextureLoadExternal("));
        // Helpers precede the entry point.
        let order: Vec<_> = module
            .function_order
            .iter()
            .map(|&f| module.functions[f].name.as_str())
            .collect();
        assert_eq!(order, ["GammaCorrection", "TextureLoadExternal", "main"]);
    }

    #[test]
    fn unmapped_texture_is_untouched() {
        let mut module = load_module();
        let before = dump_module(&module);
        let out = run(&mut module, &config(&[((0, 0), (0, 1), (0, 2))])).unwrap();
        assert!(out.expanded.is_empty());
        assert_eq!(dump_module(&module), before);
    }

    #[test]
    fn dimensions_read_apparent_size() {
        let mut module = Module::new();
        let tex = ext_var(&mut module, "t", BindingPoint::new(0, 0));
        let vec2u = module.vec_ty(VectorSize::Bi, Scalar::U32);
        let f = module.new_function("size", Some(vec2u), None);
        let block = module.functions[f].block;
        let mut b = Builder::at_end(&mut module, block);
        let handle = b.load(tex);
        let dims = b.builtin(vec2u, BuiltinFunction::TextureDimensions, &[handle]);
        b.return_(Some(dims));

        run(&mut module, &config(&[((0, 0), (0, 1), (0, 2))])).unwrap();
        validate(&module, Capabilities::EMPTY).unwrap();
        let dump = dump_module(&module);
        assert!(!dump.contains("textureDimensions"));
        assert!(dump.contains("load %t_params"));
        assert!(dump.contains("add "));
        assert!(module.function_by_name("TextureLoadExternal").is_none());
    }

    #[test]
    fn parameters_are_split() {
        let mut module = Module::new();
        let tex = ext_var(&mut module, "t", BindingPoint::new(0, 0));
        let ext_ty = module.external_texture_ty();
        let sampler_ty = module.sampler_ty(false);
        let vec2f = module.vec_ty(VectorSize::Bi, Scalar::F32);
        let vec4f = module.vec_ty(VectorSize::Quad, Scalar::F32);
        let root = module.root;
        let smp = Builder::at_end(&mut module, root).var(
            "s",
            AddressSpace::Handle,
            sampler_ty,
            StorageAccess::LOAD,
            Some(BindingPoint::new(0, 5)),
        );

        let sample = module.new_function("sample", Some(vec4f), None);
        let p = module.add_param(sample, ext_ty, "img");
        let uv = module.add_param(sample, vec2f, "uv");
        let block = module.functions[sample].block;
        let mut b = Builder::at_end(&mut module, block);
        let s = b.load(smp);
        let texel = b.builtin(
            vec4f,
            BuiltinFunction::TextureSampleBaseClampToEdge,
            &[p, s, uv],
        );
        b.return_(Some(texel));

        let (_, block) = fragment(&mut module);
        let mut b = Builder::at_end(&mut module, block);
        let handle = b.load(tex);
        let named = b.let_(handle);
        let coords = b.zero(vec2f);
        let texel = b.call_value(sample, &[named, coords]).unwrap();
        b.return_(Some(texel));

        run(&mut module, &config(&[((0, 0), (0, 1), (0, 2))])).unwrap();
        validate(&module, Capabilities::EMPTY).unwrap();
        assert_eq!(module.functions[sample].params.len(), 4);
        let dump = dump_module(&module);
        assert!(dump.contains("fn sample(%img_plane0: texture_2d<f32>, %img_plane1: texture_2d<f32>, %img_params: ExternalTextureParams, %uv: vec2<f32>)"));
        assert!(dump.contains("call TextureSampleExternal(%img_plane0, %img_plane1, %img_params, "));
        assert!(dump.contains("call sample("));
    }

    #[test]
    fn unexpanded_argument_is_rejected() {
        let mut module = Module::new();
        let mapped = ext_var(&mut module, "a", BindingPoint::new(0, 0));
        let unmapped = ext_var(&mut module, "b", BindingPoint::new(0, 1));
        let ext_ty = module.external_texture_ty();
        let callee = module.new_function("use_it", None, None);
        module.add_param(callee, ext_ty, "t");
        let block = module.functions[callee].block;
        Builder::at_end(&mut module, block).return_(None);

        let (_, block) = fragment(&mut module);
        let vec4f = module.vec_ty(VectorSize::Quad, Scalar::F32);
        let mut b = Builder::at_end(&mut module, block);
        let ha = b.load(mapped);
        let hb = b.load(unmapped);
        b.call(callee, &[ha]);
        b.call(callee, &[hb]);
        let z = b.zero(vec4f);
        b.return_(Some(z));

        let before = dump_module(&module);
        let err = run(&mut module, &config(&[((0, 0), (0, 5), (0, 6))])).unwrap_err();
        assert!(matches!(err, TransformError::Unsupported(_)));
        assert_eq!(dump_module(&module), before);
    }

    #[test]
    fn other_builtins_are_rejected() {
        let mut module = Module::new();
        let tex = ext_var(&mut module, "t", BindingPoint::new(0, 0));
        let u32_ty = module.u32_ty();
        let f = module.new_function("f", Some(u32_ty), None);
        let block = module.functions[f].block;
        let mut b = Builder::at_end(&mut module, block);
        let handle = b.load(tex);
        let n = b.builtin(u32_ty, BuiltinFunction::TextureNumLevels, &[handle]);
        b.return_(Some(n));

        let err = run(&mut module, &config(&[((0, 0), (0, 1), (0, 2))])).unwrap_err();
        assert!(err.to_string().contains("textureNumLevels"));
    }
}
