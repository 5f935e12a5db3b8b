//! The transform pipeline driver.

use prism_ir::validate::validate_and_dump_if_needed;
use prism_ir::{Capabilities, Module, PassValidationError, ValidationError, validate};

use crate::{Transform, TransformError, TransformOutput};

/// Runs transforms in sequence, validating after each one.
#[derive(Debug, Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Transform>>,
}

/// Why a pipeline stopped.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The module handed to the pipeline was already invalid.
    #[error("input module is invalid: {0}")]
    InvalidInput(#[source] ValidationError),

    /// A transform reported a failure.
    #[error("transform `{pass}` failed: {source}")]
    Transform {
        pass: String,
        #[source]
        source: TransformError,
    },

    /// A transform left the module in an invalid state.
    #[error(transparent)]
    Validation(#[from] PassValidationError),
}

impl PipelineError {
    /// Name of the stage the failure is attributed to.
    pub fn pass(&self) -> Option<&str> {
        match self {
            Self::InvalidInput(_) => None,
            Self::Transform { pass, .. } => Some(pass),
            Self::Validation(e) => Some(&e.pass),
        }
    }
}

/// Outputs of every stage that ran, in order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineOutput {
    pub outputs: Vec<(String, TransformOutput)>,
}

impl PipelineOutput {
    /// Output of the stage called `name`.
    pub fn get(&self, name: &str) -> Option<&TransformOutput> {
        self.outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, output)| output)
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Adds a stage to the end of the pipeline.
    pub fn add(&mut self, stage: Box<dyn Transform>) {
        self.stages.push(stage);
    }

    /// Builder-style [`add`](Self::add).
    pub fn with(mut self, stage: impl Transform + 'static) -> Self {
        self.add(Box::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Capabilities still needed by stages from `index` on.
    fn pending(&self, index: usize) -> Capabilities {
        self.stages[index..]
            .iter()
            .fold(Capabilities::EMPTY, |caps, s| caps | s.lowers())
    }

    /// Validates the input, then runs every stage in order. The first
    /// failure stops the pipeline; later stages never run. Relaxations a
    /// stage declares stay in force for the stages after it.
    pub fn run(&self, module: &mut Module) -> Result<PipelineOutput, PipelineError> {
        validate(module, self.pending(0)).map_err(PipelineError::InvalidInput)?;

        let mut output = PipelineOutput::default();
        let mut granted = Capabilities::EMPTY;
        for (i, stage) in self.stages.iter().enumerate() {
            let name = stage.name();
            log::debug!("running transform `{name}`");
            let result = stage
                .apply(module)
                .map_err(|source| PipelineError::Transform {
                    pass: name.to_string(),
                    source,
                })?;
            granted |= stage.capabilities();
            validate_and_dump_if_needed(module, name, granted | self.pending(i + 1))?;
            log::debug!("transform `{name}` done");
            output.outputs.push((name.to_string(), result));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Debug)]
    struct Counting {
        name: &'static str,
        runs: Rc<Cell<u32>>,
        fail: bool,
    }

    impl Transform for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn apply(&self, _module: &mut Module) -> Result<TransformOutput, TransformError> {
            self.runs.set(self.runs.get() + 1);
            if self.fail {
                return Err(TransformError::Unsupported("nope".into()));
            }
            Ok(TransformOutput::None)
        }
    }

    fn stage(name: &'static str, fail: bool) -> (Counting, Rc<Cell<u32>>) {
        let runs = Rc::new(Cell::new(0));
        (
            Counting {
                name,
                runs: runs.clone(),
                fail,
            },
            runs,
        )
    }

    #[test]
    fn empty_pipeline_is_noop() {
        let mut module = Module::default();
        let output = Pipeline::new().run(&mut module).unwrap();
        assert!(output.outputs.is_empty());
    }

    #[test]
    fn stops_at_first_failure() {
        let (a, a_runs) = stage("a", false);
        let (b, b_runs) = stage("b", true);
        let (c, c_runs) = stage("c", false);
        let pipeline = Pipeline::new().with(a).with(b).with(c);
        assert_eq!(pipeline.names(), vec!["a", "b", "c"]);

        let mut module = Module::default();
        let err = pipeline.run(&mut module).unwrap_err();
        assert_eq!(err.pass(), Some("b"));
        assert_eq!(a_runs.get(), 1);
        assert_eq!(b_runs.get(), 1);
        assert_eq!(c_runs.get(), 0);
    }

    #[test]
    fn outputs_are_recorded() {
        let (a, _) = stage("a", false);
        let mut module = Module::default();
        let output = Pipeline::new().with(a).run(&mut module).unwrap();
        assert_eq!(output.get("a"), Some(&TransformOutput::None));
        assert_eq!(output.get("missing"), None);
    }
}
