//! IR-to-IR transforms for Prism.
//!
//! Provides the [`Transform`] trait, a [`Pipeline`] that validates the
//! module after every stage, and the built-in transforms that rewrite
//! resource bindings and memory-access semantics ahead of a backend.

pub mod array_length_from_uniform;
pub mod atomics;
pub mod binding_remapper;
pub mod bindings;
pub mod config;
pub mod flatten_bindings;
pub mod multiplanar_external_texture;
pub mod num_workgroups_from_uniform;
mod pipeline;
pub mod robustness;

pub use array_length_from_uniform::ArrayLengthFromUniform;
pub use atomics::Atomics;
pub use binding_remapper::BindingRemapper;
pub use bindings::{Bindings, Target, allocate_free_binding, generate_bindings};
pub use config::PipelineConfig;
pub use flatten_bindings::FlattenBindings;
pub use multiplanar_external_texture::MultiplanarExternalTexture;
pub use num_workgroups_from_uniform::NumWorkgroupsFromUniform;
pub use pipeline::{Pipeline, PipelineError, PipelineOutput};
pub use robustness::Robustness;

use std::fmt::Debug;

use prism_ir::{BindingPoint, Capabilities, IrError, Module};

/// A transform that rewrites an IR module in place.
///
/// A transform either completes its rewrite or reports a failure. Failures
/// that can be detected up front are reported before the module is touched.
pub trait Transform: Debug {
    /// Human-readable name of the transform.
    fn name(&self) -> &str;

    /// Validator relaxations the module may rely on after this transform.
    fn capabilities(&self) -> Capabilities {
        Capabilities::EMPTY
    }

    /// Validator relaxations the input may rely on that this transform
    /// eliminates. Stages before it are validated with these enabled.
    fn lowers(&self) -> Capabilities {
        Capabilities::EMPTY
    }

    /// Runs the transform.
    fn apply(&self, module: &mut Module) -> Result<TransformOutput, TransformError>;
}

/// Facts a transform reports for later stages or the caller.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum TransformOutput {
    #[default]
    None,
    BindingRemapper(binding_remapper::Output),
    MultiplanarExternalTexture(multiplanar_external_texture::Output),
    Atomics(atomics::Output),
    Robustness(robustness::Output),
    ArrayLengthFromUniform(array_length_from_uniform::Output),
    NumWorkgroupsFromUniform(num_workgroups_from_uniform::Output),
}

/// Errors reported by transforms.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// The caller supplied contradictory or out-of-range options.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The module contains a construct the transform has no rewrite for.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The rewrite would give two resources the same binding point.
    #[error("binding point {binding} would be shared by {first} and {second}")]
    DuplicateBinding {
        binding: BindingPoint,
        first: String,
        second: String,
    },

    /// An IR invariant did not hold.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Ir(#[from] IrError),
}

/// Shorthand for an [`TransformError::Unsupported`] result.
pub(crate) fn unsupported<T>(message: impl Into<String>) -> Result<T, TransformError> {
    Err(TransformError::Unsupported(message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages() {
        let err = TransformError::DuplicateBinding {
            binding: BindingPoint::new(1, 2),
            first: "%a".into(),
            second: "%b".into(),
        };
        assert_eq!(
            err.to_string(),
            "binding point @group(1) @binding(2) would be shared by %a and %b"
        );
        assert_eq!(
            TransformError::Config("bad".into()).to_string(),
            "invalid configuration: bad"
        );
    }

    #[test]
    fn default_output_is_none() {
        assert_eq!(TransformOutput::default(), TransformOutput::None);
    }
}
