//! Replaces the `num_workgroups` builtin with a uniform buffer read.
//!
//! Some targets have no native equivalent of `num_workgroups`; the host
//! writes the dispatch size into a `vec3<u32>` uniform instead.

use prism_ir::{
    AddressSpace, Binding, BindingPoint, BuiltIn, Builder, Module, Scalar, StorageAccess,
    VectorSize,
};

use crate::bindings::allocate_free_binding;
use crate::{Transform, TransformError, TransformOutput};

/// Name of the synthesized uniform.
pub const UNIFORM_NAME: &str = "prism_num_workgroups";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// Where to bind the uniform. A free binding point is allocated when
    /// unset.
    pub ubo_binding: Option<BindingPoint>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    /// Binding point of the uniform, if one was declared.
    pub binding: Option<BindingPoint>,
}

/// Runs the transform.
pub fn run(module: &mut Module, config: &Config) -> Result<Output, TransformError> {
    let targets: Vec<_> = module
        .function_order
        .iter()
        .flat_map(|&f| {
            module.functions[f]
                .params
                .iter()
                .enumerate()
                .filter(|(_, p)| p.binding == Some(Binding::BuiltIn(BuiltIn::NumWorkgroups)))
                .map(move |(i, _)| (f, i))
        })
        .collect();
    if targets.is_empty() {
        return Ok(Output::default());
    }

    let binding = match config.ubo_binding {
        Some(binding) => binding,
        None => allocate_free_binding(module, None)?,
    };
    let vec3u = module.vec_ty(VectorSize::Tri, Scalar::U32);
    let root = module.root;
    let uniform = Builder::at_end(module, root).var(
        UNIFORM_NAME,
        AddressSpace::Uniform,
        vec3u,
        StorageAccess::LOAD,
        Some(binding),
    );
    log::debug!("declared `{UNIFORM_NAME}` at {binding}");

    // Highest index first, so earlier indices stay valid.
    for &(function, index) in targets.iter().rev() {
        let param = module.functions[function].params[index].value;
        let block = module.functions[function].block;
        let Some(&first) = module.blocks[block].instructions.first() else {
            return Err(TransformError::Internal(format!(
                "`{}` has an empty body",
                module.functions[function].name
            )));
        };
        let value = Builder::before(module, first)?.load(uniform);
        module.replace_all_uses(param, value);
        module.remove_param(function, index);
        log::trace!(
            "replaced num_workgroups of `{}`",
            module.functions[function].name
        );
    }
    Ok(Output {
        binding: Some(binding),
    })
}

/// [`Transform`] wrapper around [`run`].
#[derive(Debug, Default)]
pub struct NumWorkgroupsFromUniform {
    pub config: Config,
}

impl NumWorkgroupsFromUniform {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl Transform for NumWorkgroupsFromUniform {
    fn name(&self) -> &str {
        "num_workgroups_from_uniform"
    }

    fn apply(&self, module: &mut Module) -> Result<TransformOutput, TransformError> {
        run(module, &self.config).map(TransformOutput::NumWorkgroupsFromUniform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_ir::{BinaryOp, Capabilities, ShaderStage, dump_module, validate};

    fn compute(module: &mut Module) {
        let u32_ty = module.u32_ty();
        let root = module.root;
        let out = Builder::at_end(module, root).var(
            "out",
            AddressSpace::Storage,
            u32_ty,
            StorageAccess::LOAD_STORE,
            Some(BindingPoint::new(0, 3)),
        );
        let vec3u = module.vec_ty(VectorSize::Tri, Scalar::U32);
        let f = module.new_function("main", None, Some(ShaderStage::Compute));
        module.functions[f].workgroup_size = Some([1, 1, 1]);
        let local = module.add_param(f, vec3u, "local_id");
        module.functions[f].params[0].binding =
            Some(Binding::BuiltIn(BuiltIn::LocalInvocationId));
        let groups = module.add_param(f, vec3u, "groups");
        module.functions[f].params[1].binding = Some(Binding::BuiltIn(BuiltIn::NumWorkgroups));
        let block = module.functions[f].block;
        let mut b = Builder::at_end(module, block);
        let x = b.swizzle(groups, &[0]);
        let y = b.swizzle(local, &[0]);
        let sum = b.binary(BinaryOp::Add, x, y);
        b.store(out, sum);
        b.return_(None);
    }

    #[test]
    fn builtin_parameter_becomes_uniform_load() {
        let mut module = Module::new();
        compute(&mut module);
        let out = run(&mut module, &Config::default()).unwrap();
        assert_eq!(out.binding, Some(BindingPoint::new(0, 4)));
        validate(&module, Capabilities::EMPTY).unwrap();

        let dump = dump_module(&module);
        assert!(dump.contains(
            "%prism_num_workgroups: ptr<uniform, vec3<u32>, read> = var @group(0) @binding(4)"
        ));
        assert!(dump.contains("fn main(%local_id: vec3<u32> @builtin(local_invocation_id))"));
        assert!(dump.contains("load %prism_num_workgroups"));
        assert!(!dump.contains("%groups"));
    }

    #[test]
    fn configured_binding_is_used() {
        let mut module = Module::new();
        compute(&mut module);
        let config = Config {
            ubo_binding: Some(BindingPoint::new(7, 1)),
        };
        let out = run(&mut module, &config).unwrap();
        assert_eq!(out.binding, Some(BindingPoint::new(7, 1)));
        assert!(dump_module(&module).contains("@group(7) @binding(1)"));
    }

    #[test]
    fn nothing_to_do_without_the_builtin() {
        let mut module = Module::new();
        let out = run(&mut module, &Config::default()).unwrap();
        assert_eq!(out, Output::default());
        assert!(module.blocks[module.root].instructions.is_empty());
    }
}
