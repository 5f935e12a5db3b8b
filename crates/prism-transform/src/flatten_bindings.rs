//! Moves every resource into group 0.
//!
//! Targets with a single flat namespace per resource kind number textures,
//! samplers and buffers independently. Resources are renumbered in binding
//! point order; variables that shared a binding point keep sharing one.

use std::collections::BTreeMap;

use prism_ir::{BindingPoint, Capabilities, InstructionKind, Module};

use crate::bindings::{Category, categorize};
use crate::{Transform, TransformError, TransformOutput};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
enum Namespace {
    Buffer,
    Texture,
    Sampler,
}

impl From<Category> for Namespace {
    fn from(category: Category) -> Self {
        match category {
            Category::Uniform | Category::Storage => Self::Buffer,
            Category::Texture | Category::StorageTexture | Category::ExternalTexture => {
                Self::Texture
            }
            Category::Sampler => Self::Sampler,
        }
    }
}

/// Flattens all resource bindings into group 0 and returns the number of
/// variables renumbered.
pub fn run(module: &mut Module) -> usize {
    let mut vars: Vec<_> = module
        .root_vars()
        .into_iter()
        .filter_map(|var| {
            let bp = module.var_binding(var)?;
            let namespace = Namespace::from(categorize(module, var)?);
            Some((bp, namespace, var))
        })
        .collect();
    vars.sort_by_key(|&(bp, namespace, _)| (namespace, bp));

    let mut next: BTreeMap<Namespace, u32> = BTreeMap::new();
    let mut assigned: BTreeMap<(Namespace, BindingPoint), BindingPoint> = BTreeMap::new();
    let count = vars.len();
    for (bp, namespace, var) in vars {
        let flat = *assigned.entry((namespace, bp)).or_insert_with(|| {
            let slot = next.entry(namespace).or_insert(0);
            let flat = BindingPoint::new(0, *slot);
            *slot += 1;
            flat
        });
        if let InstructionKind::Var { binding, .. } = &mut module.instructions[var].kind {
            *binding = Some(flat);
        }
        log::trace!("flattened {bp} to {flat} ({namespace:?})");
    }
    count
}

/// [`Transform`] wrapper around [`run`].
#[derive(Debug, Default)]
pub struct FlattenBindings;

impl Transform for FlattenBindings {
    fn name(&self) -> &str {
        "flatten_bindings"
    }

    fn capabilities(&self) -> Capabilities {
        // Textures, samplers and buffers each restart at binding 0.
        Capabilities::ALLOW_DUPLICATE_BINDINGS
    }

    fn apply(&self, module: &mut Module) -> Result<TransformOutput, TransformError> {
        run(module);
        Ok(TransformOutput::None)
    }
}
