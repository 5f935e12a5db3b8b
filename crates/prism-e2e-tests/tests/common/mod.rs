use prism_backend_core::{Backend, BackendOptions, IrDumpBackend, OutputContent};
use prism_ir::*;
use prism_transform::{PipelineConfig, PipelineError, PipelineOutput, Target};

/// Builds the configuration and runs it over `module`.
#[allow(dead_code)]
pub fn run_config(
    module: &mut Module,
    config: &str,
    target: Target,
) -> Result<PipelineOutput, PipelineError> {
    let config = PipelineConfig::from_json(config).expect("configuration should parse");
    let pipeline = config
        .build(module, target)
        .expect("pipeline should build");
    pipeline.run(module)
}

/// Renders `module` through the IR dump backend.
#[allow(dead_code)]
pub fn dump(module: &Module) -> String {
    let output = IrDumpBackend
        .compile(module, &BackendOptions::default())
        .expect("IR dump should not fail");
    match &output.files[0].content {
        OutputContent::Text(text) => text.clone(),
        OutputContent::Binary(_) => panic!("expected text output"),
    }
}

/// A histogram kernel:
///
/// ```wgsl
/// @group(0) @binding(0) var<storage, read_write> total: u32;   // atomic stub
/// @group(0) @binding(1) var<storage, read_write> data: array<u32>;
///
/// @compute @workgroup_size(64)
/// fn main(@builtin(global_invocation_id) gid: vec3<u32>,
///         @builtin(num_workgroups) groups: vec3<u32>) {
///     data[gid.x] = groups.x;
///     atomic_iadd(&total, arrayLength(&data));
/// }
/// ```
#[allow(dead_code)]
pub fn histogram() -> Module {
    let mut module = Module::new();
    let u32_ty = module.u32_ty();
    let runtime = module.array_ty(u32_ty, ArraySize::Dynamic, 4);
    let vec3u = module.vec_ty(VectorSize::Tri, Scalar::U32);

    let root = module.root;
    let mut b = Builder::at_end(&mut module, root);
    let total = b.var(
        "total",
        AddressSpace::Storage,
        u32_ty,
        StorageAccess::LOAD_STORE,
        Some(BindingPoint::new(0, 0)),
    );
    let data = b.var(
        "data",
        AddressSpace::Storage,
        runtime,
        StorageAccess::LOAD_STORE,
        Some(BindingPoint::new(0, 1)),
    );

    let main = module.new_function("main", None, Some(ShaderStage::Compute));
    module.functions[main].workgroup_size = Some([64, 1, 1]);
    let gid = module.add_param(main, vec3u, "gid");
    module.functions[main].params[0].binding = Some(Binding::BuiltIn(BuiltIn::GlobalInvocationId));
    let groups = module.add_param(main, vec3u, "groups");
    module.functions[main].params[1].binding = Some(Binding::BuiltIn(BuiltIn::NumWorkgroups));
    let block = module.functions[main].block;

    let mut b = Builder::at_end(&mut module, block);
    let i = b.swizzle(gid, &[0]);
    let slot = b.access_ptr(data, &[i]);
    let count = b.swizzle(groups, &[0]);
    b.store(slot, count);
    let len = b.builtin(u32_ty, BuiltinFunction::ArrayLength, &[data]);
    b.stub(Some(u32_ty), Stub::Atomic(AtomicStub::IAdd), &[total, len]);
    b.return_(None);
    module
}

/// A fragment shader sampling one external texture through a helper.
#[allow(dead_code)]
pub fn video_frame() -> Module {
    let mut module = Module::new();
    let ext = module.external_texture_ty();
    let sampler_ty = module.sampler_ty(false);
    let vec2f = module.vec_ty(VectorSize::Bi, Scalar::F32);
    let vec4f = module.vec_ty(VectorSize::Quad, Scalar::F32);

    let root = module.root;
    let mut b = Builder::at_end(&mut module, root);
    let frame = b.var(
        "frame",
        AddressSpace::Handle,
        ext,
        StorageAccess::LOAD,
        Some(BindingPoint::new(1, 0)),
    );
    let smp = b.var(
        "smp",
        AddressSpace::Handle,
        sampler_ty,
        StorageAccess::LOAD,
        Some(BindingPoint::new(1, 1)),
    );

    let shade = module.new_function("shade", Some(vec4f), None);
    let img = module.add_param(shade, ext, "img");
    let uv = module.add_param(shade, vec2f, "uv");
    let block = module.functions[shade].block;
    let mut b = Builder::at_end(&mut module, block);
    let s = b.load(smp);
    let texel = b.builtin(
        vec4f,
        BuiltinFunction::TextureSampleBaseClampToEdge,
        &[img, s, uv],
    );
    b.return_(Some(texel));

    let main = module.new_function("main", Some(vec4f), Some(ShaderStage::Fragment));
    let uv = module.add_param(main, vec2f, "uv");
    module.functions[main].params[0].binding = Some(Binding::Location { location: 0 });
    let block = module.functions[main].block;
    let mut b = Builder::at_end(&mut module, block);
    let handle = b.load(frame);
    let color = b.call_value(shade, &[handle, uv]).expect("shade returns a value");
    b.return_(Some(color));
    module
}
