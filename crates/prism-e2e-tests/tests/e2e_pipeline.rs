mod common;

use prism_backend_core::{Backend, BackendOptions, IrJsonBackend, OutputContent};
use prism_ir::{BindingPoint, Capabilities, Module, validate};
use prism_transform::{Target, TransformOutput};

#[test]
fn compute_pipeline_for_hlsl() {
    let mut module = common::histogram();
    let out = common::run_config(
        &mut module,
        r#"{
            "atomics": {},
            "robustness": {},
            "array_length_from_uniform": {
                "ubo_binding": { "group": 1, "binding": 0 },
                "sizes": [ { "binding": { "group": 0, "binding": 1 }, "index": 0 } ]
            },
            "num_workgroups_from_uniform": {}
        }"#,
        Target::Hlsl,
    )
    .unwrap();

    let stages: Vec<_> = out.outputs.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(
        stages,
        [
            "atomics",
            "robustness",
            "array_length_from_uniform",
            "num_workgroups_from_uniform"
        ]
    );
    let Some(TransformOutput::ArrayLengthFromUniform(lengths)) =
        out.get("array_length_from_uniform")
    else {
        panic!("missing array length output");
    };
    assert!(lengths.needs_storage_buffer_sizes);
    assert_eq!(lengths.used_size_indices, [0].into());
    let Some(TransformOutput::NumWorkgroupsFromUniform(groups)) =
        out.get("num_workgroups_from_uniform")
    else {
        panic!("missing num workgroups output");
    };
    assert_eq!(groups.binding, Some(BindingPoint::new(0, 2)));

    let dump = common::dump(&module);
    assert!(dump.contains("%total: ptr<storage, atomic<u32>, read_write> = var @group(0) @binding(0)"));
    assert!(dump.contains(
        "%prism_storage_buffer_sizes: ptr<uniform, array<vec4<u32>, 1>, read> = var @group(1) @binding(0)"
    ));
    assert!(dump.contains(
        "%prism_num_workgroups: ptr<uniform, vec3<u32>, read> = var @group(0) @binding(2)"
    ));
    assert!(dump.contains("fn main(%gid: vec3<u32> @builtin(global_invocation_id))"));
    assert!(dump.contains("atomicAdd %total, "));
    assert!(dump.contains("min "));
    assert!(!dump.contains("arrayLength"));
    assert!(!dump.contains("atomic_iadd"));
}

#[test]
fn video_pipeline_for_msl() {
    let mut module = common::video_frame();
    common::run_config(
        &mut module,
        r#"{ "multiplanar": {}, "flatten_bindings": true }"#,
        Target::Msl,
    )
    .unwrap();

    let dump = common::dump(&module);
    assert!(dump.contains(
        "fn shade(%img_plane0: texture_2d<f32>, %img_plane1: texture_2d<f32>, %img_params: ExternalTextureParams, %uv: vec2<f32>) -> vec4<f32>"
    ));
    assert!(dump.contains("call TextureSampleExternal(%img_plane0, %img_plane1, %img_params, "));
    assert!(dump.contains("%frame_plane0: ptr<handle, texture_2d<f32>, read> = var @group(0) @binding(0)"));
    assert!(dump.contains("%frame_plane1: ptr<handle, texture_2d<f32>, read> = var @group(0) @binding(1)"));
    assert!(dump.contains("%frame_params: ptr<uniform, ExternalTextureParams, read> = var @group(0) @binding(0)"));
    assert!(dump.contains("%smp: ptr<handle, sampler, read> = var @group(0) @binding(0)"));
    assert!(!dump.contains("texture_external"));
}

#[test]
fn transformed_module_survives_json() {
    let mut module = common::video_frame();
    common::run_config(&mut module, r#"{ "multiplanar": {} }"#, Target::Spirv).unwrap();

    let output = IrJsonBackend
        .compile(&module, &BackendOptions::default())
        .unwrap();
    let OutputContent::Text(json) = &output.files[0].content else {
        panic!("expected text output");
    };
    let decoded = Module::from_json(json).unwrap();
    validate(&decoded, Capabilities::EMPTY).unwrap();
    assert_eq!(common::dump(&decoded), common::dump(&module));

    // The expansion is not repeated on an already expanded module.
    let before = common::dump(&module);
    common::run_config(&mut module, r#"{ "multiplanar": {} }"#, Target::Spirv).unwrap();
    assert_eq!(common::dump(&module), before);
}

#[test]
fn empty_configuration_leaves_the_module_alone() {
    let mut module = common::video_frame();
    let before = common::dump(&module);
    let out = common::run_config(&mut module, "{}", Target::Glsl).unwrap();
    assert!(out.outputs.is_empty());
    assert_eq!(common::dump(&module), before);
}
