//! Integration tests for multiplanar external texture expansion.

use prism_ir::*;
use prism_transform::multiplanar_external_texture::{self, BindingPoints, Config};
use prism_transform::{Target, generate_bindings};

fn external(module: &mut Module, name: &str, bp: BindingPoint) -> Handle<Value> {
    let ty = module.external_texture_ty();
    let root = module.root;
    Builder::at_end(module, root).var(name, AddressSpace::Handle, ty, StorageAccess::LOAD, Some(bp))
}

fn config(entries: &[(BindingPoint, BindingPoint, BindingPoint)]) -> Config {
    Config {
        bindings: entries
            .iter()
            .map(|&(bp, plane1, params)| (bp, BindingPoints { plane1, params }))
            .collect(),
    }
}

fn struct_layout(module: &Module, name: &str) -> (Vec<(String, u32)>, u32) {
    let (_, ty) = module
        .types
        .iter()
        .find(|(_, ty)| ty.name.as_deref() == Some(name))
        .unwrap_or_else(|| panic!("no type named {name}"));
    let TypeInner::Struct { ref members, span } = ty.inner else {
        panic!("{name} is not a struct");
    };
    let members = members
        .iter()
        .map(|m| (m.name.clone().unwrap_or_default(), m.offset))
        .collect();
    (members, span)
}

fn calls_to(module: &Module, name: &str) -> Vec<usize> {
    let Some(f) = module.function_by_name(name) else {
        return Vec::new();
    };
    module
        .calls_to(f)
        .into_iter()
        .filter_map(|call| match module.instructions[call].kind {
            InstructionKind::Call { ref args, .. } => Some(args.len()),
            _ => None,
        })
        .collect()
}

/// Three external textures, each read once with `textureLoad`.
fn three_textures() -> Module {
    let mut module = Module::new();
    let handles: Vec<_> = (0..3)
        .map(|i| external(&mut module, &format!("video{i}"), BindingPoint::new(0, i)))
        .collect();
    let vec2u = module.vec_ty(VectorSize::Bi, Scalar::U32);
    let vec4f = module.vec_ty(VectorSize::Quad, Scalar::F32);
    let main = module.new_function("main", Some(vec4f), Some(ShaderStage::Fragment));
    let block = module.functions[main].block;
    let mut b = Builder::at_end(&mut module, block);
    let coords = b.zero(vec2u);
    let mut total = None;
    for var in handles {
        let handle = b.load(var);
        let texel = b.builtin(vec4f, BuiltinFunction::TextureLoad, &[handle, coords]);
        total = Some(match total {
            Some(sum) => b.binary(BinaryOp::Add, sum, texel),
            None => texel,
        });
    }
    b.return_(total);
    module
}

#[test]
fn parameter_struct_layout() {
    let mut module = three_textures();
    let bp = |b| BindingPoint::new(0, b);
    multiplanar_external_texture::run(&mut module, &config(&[(bp(0), bp(10), bp(11))])).unwrap();

    let (members, span) = struct_layout(&module, "ExternalTextureParams");
    let expected = [
        ("numPlanes", 0),
        ("doYuvToRgbConversionOnly", 4),
        ("yuvToRgbConversionMatrix", 16),
        ("gammaDecodeParams", 64),
        ("gammaEncodeParams", 96),
        ("gamutConversionMatrix", 128),
        ("sampleTransform", 176),
        ("loadTransform", 200),
        ("samplePlane0RectMin", 224),
        ("samplePlane0RectMax", 232),
        ("samplePlane1RectMin", 240),
        ("samplePlane1RectMax", 248),
        ("apparentSize", 256),
        ("plane1CoordFactor", 264),
    ];
    let expected: Vec<_> = expected
        .iter()
        .map(|&(name, offset)| (name.to_string(), offset))
        .collect();
    assert_eq!(members, expected);
    assert_eq!(span, 272);

    let (members, span) = struct_layout(&module, "GammaTransferParams");
    let names: Vec<_> = members.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["G", "A", "B", "C", "D", "E", "F", "padding"]);
    assert_eq!(span, 32);
}

#[test]
fn helpers_are_shared_between_textures() {
    let mut module = three_textures();
    let bp = |b| BindingPoint::new(0, b);
    let out = multiplanar_external_texture::run(
        &mut module,
        &config(&[
            (bp(0), bp(3), bp(4)),
            (bp(1), bp(5), bp(6)),
            (bp(2), bp(7), bp(8)),
        ]),
    )
    .unwrap();
    assert_eq!(out.expanded, vec![bp(0), bp(1), bp(2)]);
    validate(&module, Capabilities::EMPTY).unwrap();

    assert_eq!(module.root_vars().len(), 9);
    assert_eq!(calls_to(&module, "TextureLoadExternal"), vec![4, 4, 4]);
    let names: Vec<_> = module
        .function_order
        .iter()
        .map(|&f| module.functions[f].name.as_str())
        .collect();
    assert_eq!(names, ["GammaCorrection", "TextureLoadExternal", "main"]);

    let dump = dump_module(&module);
    for i in 0..3 {
        assert!(dump.contains(&format!("%video{i}_plane0: ptr<handle, texture_2d<f32>, read>")));
        assert!(dump.contains(&format!("%video{i}_params: ptr<uniform, ExternalTextureParams, read>")));
    }
    assert!(dump.contains("%video2_plane1: ptr<handle, texture_2d<f32>, read> = var @group(0) @binding(7)"));
}

#[test]
fn unused_texture_is_still_expanded() {
    let mut module = Module::new();
    external(&mut module, "idle", BindingPoint::new(2, 0));
    let main = module.new_function("main", None, Some(ShaderStage::Compute));
    module.functions[main].workgroup_size = Some([1, 1, 1]);
    let block = module.functions[main].block;
    Builder::at_end(&mut module, block).return_(None);

    let bindings = generate_bindings(&module, Target::Spirv)
        .unwrap()
        .external_texture_map();
    let out = multiplanar_external_texture::run(&mut module, &Config { bindings }).unwrap();
    assert_eq!(out.expanded, vec![BindingPoint::new(2, 0)]);
    validate(&module, Capabilities::EMPTY).unwrap();

    let dump = dump_module(&module);
    assert!(dump.contains("%idle_plane0: ptr<handle, texture_2d<f32>, read> = var @group(2) @binding(0)"));
    assert!(dump.contains("%idle_plane1: ptr<handle, texture_2d<f32>, read> = var @group(2) @binding(1)"));
    assert!(dump.contains("%idle_params: ptr<uniform, ExternalTextureParams, read> = var @group(2) @binding(2)"));
    assert!(module.function_by_name("GammaCorrection").is_none());
    assert_eq!(module.function_order.len(), 1);
}
