//! Binding-point bookkeeping: default backend layouts and fresh-binding
//! allocation for synthesized resources.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use prism_ir::{AddressSpace, BindingPoint, Module, TextureClass, TypeInner};

use crate::TransformError;
use crate::multiplanar_external_texture::{BindingPoints, BindingsMap};

/// Backend a binding layout is generated for.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Hlsl,
    Msl,
    Glsl,
    Spirv,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hlsl => "hlsl",
            Self::Msl => "msl",
            Self::Glsl => "glsl",
            Self::Spirv => "spirv",
        };
        f.write_str(name)
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hlsl" => Ok(Self::Hlsl),
            "msl" => Ok(Self::Msl),
            "glsl" => Ok(Self::Glsl),
            "spirv" | "spir-v" => Ok(Self::Spirv),
            other => Err(format!("unknown target '{other}'")),
        }
    }
}

/// Source binding point to backend binding.
pub type BindingMap = BTreeMap<BindingPoint, BindingPoint>;

/// Backend bindings of the three resources an external texture expands to.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct ExternalTexture {
    /// Source-space points of the synthesized resources.
    pub source: BindingPoints,
    pub plane0: BindingPoint,
    pub plane1: BindingPoint,
    pub params: BindingPoint,
}

/// Per-category binding tables for one backend.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bindings {
    pub uniform: BindingMap,
    pub storage: BindingMap,
    pub texture: BindingMap,
    pub storage_texture: BindingMap,
    pub sampler: BindingMap,
    pub external_texture: BTreeMap<BindingPoint, ExternalTexture>,
}

impl Bindings {
    /// The multiplanar expansion map: every external texture to its
    /// synthesized plane-1 and parameter binding points.
    pub fn external_texture_map(&self) -> BindingsMap {
        self.external_texture
            .iter()
            .map(|(&bp, ext)| (bp, ext.source))
            .collect()
    }

    /// Every category merged into one remapping table.
    pub fn remap_table(&self) -> BindingMap {
        let mut table = BindingMap::new();
        for map in [
            &self.uniform,
            &self.storage,
            &self.texture,
            &self.storage_texture,
            &self.sampler,
        ] {
            table.extend(map.iter().map(|(&k, &v)| (k, v)));
        }
        table
    }
}

/// Resource category used for binding tables.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Category {
    Uniform,
    Storage,
    Texture,
    StorageTexture,
    Sampler,
    ExternalTexture,
}

pub(crate) fn categorize(
    module: &Module,
    inst: prism_ir::Handle<prism_ir::Instruction>,
) -> Option<Category> {
    let value = module.result(inst)?;
    let (space, base, _) = module.pointer_parts(module.value_type(value))?;
    Some(match (space, &module.types[base].inner) {
        (AddressSpace::Uniform, _) => Category::Uniform,
        (AddressSpace::Storage, _) => Category::Storage,
        (
            AddressSpace::Handle,
            TypeInner::Texture {
                class: TextureClass::External,
                ..
            },
        ) => Category::ExternalTexture,
        (
            AddressSpace::Handle,
            TypeInner::Texture {
                class: TextureClass::Storage { .. },
                ..
            },
        ) => Category::StorageTexture,
        (AddressSpace::Handle, TypeInner::Texture { .. }) => Category::Texture,
        (AddressSpace::Handle, TypeInner::Sampler { .. }) => Category::Sampler,
        _ => return None,
    })
}

/// All resource bindings in the module with their categories, sorted by
/// binding point.
fn resources(module: &Module) -> Vec<(BindingPoint, Category)> {
    let mut out: Vec<_> = module
        .root_vars()
        .into_iter()
        .filter_map(|v| Some((module.var_binding(v)?, categorize(module, v)?)))
        .collect();
    out.sort_by_key(|&(bp, _)| bp);
    out.dedup_by_key(|&mut (bp, _)| bp);
    out
}

/// Returns a binding point no resource uses yet.
///
/// The group is `preferred_group` when given, otherwise the group holding
/// the most resources (lowest group on ties), or group 0 for a module
/// without resources. The binding is one past the largest binding in that
/// group. Deterministic for a given module. Fails when that group already
/// uses the largest binding number.
pub fn allocate_free_binding(
    module: &Module,
    preferred_group: Option<u32>,
) -> Result<BindingPoint, TransformError> {
    let mut max_binding: BTreeMap<u32, u32> = BTreeMap::new();
    let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
    for var in module.root_vars() {
        if let Some(bp) = module.var_binding(var) {
            let max = max_binding.entry(bp.group).or_insert(bp.binding);
            *max = (*max).max(bp.binding);
            *counts.entry(bp.group).or_default() += 1;
        }
    }
    let group = preferred_group.unwrap_or_else(|| {
        counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map_or(0, |(&g, _)| g)
    });
    let binding = match max_binding.get(&group) {
        Some(&b) => b.checked_add(1).ok_or_else(|| group_full(group))?,
        None => 0,
    };
    Ok(BindingPoint::new(group, binding))
}

fn group_full(group: u32) -> TransformError {
    TransformError::Config(format!("no free binding left in @group({group})"))
}

/// Generates the default binding layout `target` uses when the caller
/// supplies no explicit remapping. Does not modify the module.
///
/// Every external texture gets two extra source-space binding points (plane 1
/// and parameters) taken from a per-group "next free binding" counter that
/// is seeded once from the existing bindings. For MSL, bindings are then
/// flattened to per-category slot indices (buffers, textures, samplers); for
/// every other target they map to themselves. Fails when an external
/// texture's group has no room for its extra binding points.
pub fn generate_bindings(module: &Module, target: Target) -> Result<Bindings, TransformError> {
    let resources = resources(module);

    // `None` once the group holds the largest binding number.
    let mut next_free: HashMap<u32, Option<u32>> = HashMap::new();
    for &(bp, _) in &resources {
        let next = next_free.entry(bp.group).or_insert(Some(0));
        *next = match (*next, bp.binding.checked_add(1)) {
            (Some(n), Some(after)) => Some(n.max(after)),
            _ => None,
        };
    }

    let mut bindings = Bindings::default();
    let mut synthesized: Vec<(BindingPoint, BindingPoints)> = Vec::new();
    for &(bp, category) in &resources {
        let map = match category {
            Category::Uniform => &mut bindings.uniform,
            Category::Storage => &mut bindings.storage,
            Category::Texture => &mut bindings.texture,
            Category::StorageTexture => &mut bindings.storage_texture,
            Category::Sampler => &mut bindings.sampler,
            Category::ExternalTexture => {
                let next = next_free.entry(bp.group).or_insert(Some(0));
                let plane1 = next.ok_or_else(|| group_full(bp.group))?;
                let params = plane1.checked_add(1).ok_or_else(|| group_full(bp.group))?;
                *next = params.checked_add(1);
                let plane1 = BindingPoint::new(bp.group, plane1);
                let params = BindingPoint::new(bp.group, params);
                log::debug!("external texture {bp}: plane1 {plane1}, params {params}");
                synthesized.push((bp, BindingPoints { plane1, params }));
                bindings.texture.insert(bp, bp);
                bindings.texture.insert(plane1, plane1);
                bindings.uniform.insert(params, params);
                continue;
            }
        };
        map.insert(bp, bp);
    }

    if target == Target::Msl {
        let mut buffer_slot = 0;
        for map in [&mut bindings.uniform, &mut bindings.storage] {
            for info in map.values_mut() {
                *info = BindingPoint::new(0, buffer_slot);
                buffer_slot += 1;
            }
        }
        let mut texture_slot = 0;
        for map in [&mut bindings.texture, &mut bindings.storage_texture] {
            for info in map.values_mut() {
                *info = BindingPoint::new(0, texture_slot);
                texture_slot += 1;
            }
        }
        for (slot, info) in bindings.sampler.values_mut().enumerate() {
            *info = BindingPoint::new(0, slot as u32);
        }
    }

    for (bp, source) in synthesized {
        let lookup = |map: &BindingMap, key| map.get(&key).copied().unwrap_or(key);
        let ext = ExternalTexture {
            source,
            plane0: lookup(&bindings.texture, bp),
            plane1: lookup(&bindings.texture, source.plane1),
            params: lookup(&bindings.uniform, source.params),
        };
        bindings.external_texture.insert(bp, ext);
    }
    Ok(bindings)
}
