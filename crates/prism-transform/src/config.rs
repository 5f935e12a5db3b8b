//! Serde-backed pipeline configuration.
//!
//! A [`PipelineConfig`] names the transforms to run and their options. JSON
//! object keys must be strings, so binding-point maps are written as lists
//! of entries and turned into maps when the pipeline is built:
//!
//! ```json
//! {
//!   "atomics": { "float_atomics": false },
//!   "multiplanar": { "bindings": [
//!     { "binding": { "group": 1, "binding": 2 },
//!       "plane1": { "group": 1, "binding": 3 },
//!       "params": { "group": 1, "binding": 4 } }
//!   ] },
//!   "robustness": { "storage": "clamp", "texture": "predicate" },
//!   "binding_remapper": { "entries": [
//!     { "from": { "group": 1, "binding": 2 }, "to": { "group": 0, "binding": 0 } }
//!   ] }
//! }
//! ```
//!
//! Transforms always run in the same order, whatever the order of keys:
//! atomics, multiplanar external textures, robustness, array length from
//! uniform, num workgroups from uniform, binding remapper, flatten bindings.

use std::collections::BTreeMap;
use std::fmt::Display;

use prism_ir::{BindingPoint, Module};
use serde::{Deserialize, Serialize};

use crate::bindings::{Target, generate_bindings};
use crate::multiplanar_external_texture::BindingPoints;
use crate::{
    ArrayLengthFromUniform, Atomics, BindingRemapper, FlattenBindings, MultiplanarExternalTexture,
    NumWorkgroupsFromUniform, Pipeline, Robustness, TransformError, array_length_from_uniform,
    atomics, binding_remapper, multiplanar_external_texture, num_workgroups_from_uniform,
    robustness,
};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AtomicsOptions {
    pub float_atomics: bool,
}

/// One external texture and the binding points of its extra resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalTextureEntry {
    pub binding: BindingPoint,
    pub plane1: BindingPoint,
    pub params: BindingPoint,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MultiplanarOptions {
    /// Explicit expansion map. Generated for the target when absent.
    pub bindings: Option<Vec<ExternalTextureEntry>>,
}

/// A storage buffer and its index in the sizes uniform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SizeEntry {
    pub binding: BindingPoint,
    pub index: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArrayLengthOptions {
    pub ubo_binding: BindingPoint,
    pub sizes: Vec<SizeEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NumWorkgroupsOptions {
    pub ubo_binding: Option<BindingPoint>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemapEntry {
    pub from: BindingPoint,
    pub to: BindingPoint,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemapperOptions {
    pub entries: Vec<RemapEntry>,
    pub allow_collisions: bool,
}

/// Which transforms to run, and how.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub atomics: Option<AtomicsOptions>,
    pub multiplanar: Option<MultiplanarOptions>,
    pub robustness: Option<robustness::Config>,
    pub array_length_from_uniform: Option<ArrayLengthOptions>,
    pub num_workgroups_from_uniform: Option<NumWorkgroupsOptions>,
    /// Explicit remapping. Targets that need one get a generated table when
    /// absent.
    pub binding_remapper: Option<RemapperOptions>,
    pub flatten_bindings: bool,
}

/// Collects `entries` into a map, rejecting repeated keys.
fn unique<K: Ord + Copy + Display, V>(
    what: &str,
    entries: impl IntoIterator<Item = (K, V)>,
) -> Result<BTreeMap<K, V>, TransformError> {
    let mut map = BTreeMap::new();
    for (key, value) in entries {
        if map.insert(key, value).is_some() {
            return Err(TransformError::Config(format!(
                "{what}: {key} is listed more than once"
            )));
        }
    }
    Ok(map)
}

impl PipelineConfig {
    /// Parses a JSON configuration document.
    pub fn from_json(text: &str) -> Result<Self, TransformError> {
        serde_json::from_str(text).map_err(|e| TransformError::Config(e.to_string()))
    }

    /// Builds the pipeline for `module` and `target`. Generated binding
    /// layouts are computed from `module` as it is now.
    pub fn build(&self, module: &Module, target: Target) -> Result<Pipeline, TransformError> {
        let mut pipeline = Pipeline::new();

        if let Some(options) = &self.atomics {
            pipeline.add(Box::new(Atomics::new(atomics::Config {
                float_atomics: options.float_atomics,
            })));
        }

        if let Some(options) = &self.multiplanar {
            let bindings = match &options.bindings {
                Some(entries) => unique(
                    "multiplanar bindings",
                    entries.iter().map(|e| {
                        (
                            e.binding,
                            BindingPoints {
                                plane1: e.plane1,
                                params: e.params,
                            },
                        )
                    }),
                )?,
                None => generate_bindings(module, target)?.external_texture_map(),
            };
            pipeline.add(Box::new(MultiplanarExternalTexture::new(
                multiplanar_external_texture::Config { bindings },
            )));
        }

        if let Some(options) = &self.robustness {
            pipeline.add(Box::new(Robustness::new(options.clone())?));
        }

        if let Some(options) = &self.array_length_from_uniform {
            let bindpoint_to_size_index = unique(
                "array length sizes",
                options.sizes.iter().map(|e| (e.binding, e.index)),
            )?;
            pipeline.add(Box::new(ArrayLengthFromUniform::new(
                array_length_from_uniform::Config {
                    ubo_binding: options.ubo_binding,
                    bindpoint_to_size_index,
                },
            )));
        }

        if let Some(options) = &self.num_workgroups_from_uniform {
            pipeline.add(Box::new(NumWorkgroupsFromUniform::new(
                num_workgroups_from_uniform::Config {
                    ubo_binding: options.ubo_binding,
                },
            )));
        }

        let remapper = match &self.binding_remapper {
            Some(options) => Some(binding_remapper::Config {
                binding_points: unique(
                    "binding remapper",
                    options.entries.iter().map(|e| (e.from, e.to)),
                )?,
                allow_collisions: options.allow_collisions,
            }),
            // Flattened slots of different categories overlap.
            None if target == Target::Msl => Some(binding_remapper::Config {
                binding_points: generate_bindings(module, target)?.remap_table(),
                allow_collisions: true,
            }),
            None => None,
        };
        if let Some(config) = remapper {
            pipeline.add(Box::new(BindingRemapper::new(config)));
        }

        if self.flatten_bindings {
            pipeline.add(Box::new(FlattenBindings));
        }

        log::debug!("pipeline for {target}: {:?}", pipeline.names());
        Ok(pipeline)
    }
}
