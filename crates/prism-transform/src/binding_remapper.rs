//! Rewrites resource binding points through a caller-supplied map.

use std::collections::BTreeMap;

use prism_ir::{BindingPoint, Capabilities, InstructionKind, Module, format_value};

use crate::{Transform, TransformError, TransformOutput};

/// Remapper configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// Old binding point to new binding point. Unmapped bindings pass through.
    pub binding_points: BTreeMap<BindingPoint, BindingPoint>,
    /// Permit distinct resources to end up on the same binding point.
    pub allow_collisions: bool,
}

/// Result of a remap.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    /// Number of variables whose binding point changed.
    pub remapped: usize,
}

/// Remaps the binding points of module-scope variables.
///
/// Fails before touching the module if two distinct resources, at least one
/// of them remapped, would share a binding point and collisions are not
/// allowed.
pub fn run(module: &mut Module, config: &Config) -> Result<Output, TransformError> {
    let mut updates = Vec::new();
    let mut resulting: BTreeMap<BindingPoint, (String, bool)> = BTreeMap::new();
    for var in module.root_vars() {
        let Some(old) = module.var_binding(var) else {
            continue;
        };
        let new = config.binding_points.get(&old).copied();
        let name = module
            .result(var)
            .map_or_else(|| format!("{old}"), |v| format_value(module, v));
        let target = new.unwrap_or(old);
        if let Some((first, first_moved)) = resulting.get(&target) {
            if !config.allow_collisions && (new.is_some() || *first_moved) {
                return Err(TransformError::DuplicateBinding {
                    binding: target,
                    first: first.clone(),
                    second: name,
                });
            }
        } else {
            resulting.insert(target, (name, new.is_some()));
        }
        if let Some(new) = new.filter(|&n| n != old) {
            updates.push((var, new));
        }
    }

    for &(var, new) in &updates {
        if let InstructionKind::Var { binding, .. } = &mut module.instructions[var].kind {
            log::trace!("remapping {binding:?} to {new}");
            *binding = Some(new);
        }
    }
    Ok(Output {
        remapped: updates.len(),
    })
}

/// [`Transform`] wrapper around [`run`].
#[derive(Debug, Default)]
pub struct BindingRemapper {
    pub config: Config,
}

impl BindingRemapper {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl Transform for BindingRemapper {
    fn name(&self) -> &str {
        "binding_remapper"
    }

    fn capabilities(&self) -> Capabilities {
        if self.config.allow_collisions {
            Capabilities::ALLOW_DUPLICATE_BINDINGS
        } else {
            Capabilities::EMPTY
        }
    }

    fn apply(&self, module: &mut Module) -> Result<TransformOutput, TransformError> {
        run(module, &self.config).map(TransformOutput::BindingRemapper)
    }
}
