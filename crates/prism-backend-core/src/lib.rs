#![warn(missing_docs)]
//! Backend trait and registry for Prism.
//!
//! A [`Backend`] consumes a transformed, validated [`Module`] and renders it
//! into one or more output files. The [`BackendRegistry`] maps `--emit`
//! identifiers to backends. Two backends are built in: [`IrDumpBackend`]
//! (the human-readable IR text) and [`IrJsonBackend`] (the serialized
//! module, suitable for feeding back into the CLI).

use std::fmt::{self, Debug};

use prism_ir::{IrError, Module};

/// A backend that renders a Prism IR module.
pub trait Backend: Debug + Send + Sync {
    /// Human-readable name.
    fn name(&self) -> &str;

    /// Identifiers this backend answers to.
    fn targets(&self) -> &[&str];

    /// Renders `module`.
    fn compile(&self, module: &Module, opts: &BackendOptions)
    -> Result<BackendOutput, BackendError>;
}

/// Options passed to a backend.
#[derive(Clone, Debug, Default)]
pub struct BackendOptions {
    /// Base name for output files. Backends fall back to `module`.
    pub stem: Option<String>,
}

impl BackendOptions {
    fn file_name(&self, extension: &str) -> String {
        format!("{}.{extension}", self.stem.as_deref().unwrap_or("module"))
    }
}

/// Files and diagnostics produced by a backend.
#[derive(Clone, Debug, Default)]
pub struct BackendOutput {
    /// Output files in emission order.
    pub files: Vec<OutputFile>,
    /// Non-fatal diagnostics.
    pub diagnostics: Vec<Diagnostic>,
}

impl fmt::Display for BackendOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} file(s), {} diagnostic(s)",
            self.files.len(),
            self.diagnostics.len()
        )
    }
}

/// One output file.
#[derive(Clone, Debug)]
pub struct OutputFile {
    /// Suggested file name.
    pub name: String,
    /// File content.
    pub content: OutputContent,
}

/// Content of an output file.
#[derive(Clone, Debug)]
pub enum OutputContent {
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Binary(Vec<u8>),
}

impl OutputContent {
    /// The content as bytes, for writing to disk.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }
}

/// A non-fatal message from a backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity.
    pub level: DiagnosticLevel,
    /// Message text.
    pub message: String,
}

impl Diagnostic {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.level, self.message)
    }
}

/// Severity of a [`Diagnostic`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticLevel {
    /// Suspicious but accepted input.
    Warning,
    /// Informational note.
    Info,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Warning => "warning",
            Self::Info => "info",
        })
    }
}

/// Errors a backend can report.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The module uses something this backend cannot render.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Serializing the module failed.
    #[error(transparent)]
    Ir(#[from] IrError),
}

/// Backends by identifier.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: Vec<Box<dyn Backend>>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in backends.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(IrDumpBackend));
        registry.register(Box::new(IrJsonBackend));
        registry
    }

    /// Adds a backend. Earlier registrations win on identifier clashes.
    pub fn register(&mut self, backend: Box<dyn Backend>) {
        log::debug!("registered backend `{}`", backend.name());
        self.backends.push(backend);
    }

    /// The backend answering to `target`.
    pub fn find(&self, target: &str) -> Option<&dyn Backend> {
        self.backends
            .iter()
            .find(|b| b.targets().contains(&target))
            .map(|b| &**b)
    }

    /// Every identifier, in registration order.
    pub fn list_targets(&self) -> Vec<&str> {
        self.backends
            .iter()
            .flat_map(|b| b.targets().iter().copied())
            .collect()
    }
}

/// Warnings shared by the built-in backends.
fn common_diagnostics(module: &Module) -> Vec<Diagnostic> {
    let has_entry_point = module
        .function_order
        .iter()
        .any(|&f| module.functions[f].is_entry_point());
    if has_entry_point {
        Vec::new()
    } else {
        vec![Diagnostic::warning("module has no entry points")]
    }
}

/// Renders the module with [`prism_ir::dump_module`].
#[derive(Debug)]
pub struct IrDumpBackend;

impl Backend for IrDumpBackend {
    fn name(&self) -> &str {
        "IR dump"
    }

    fn targets(&self) -> &[&str] {
        &["ir-dump", "ir"]
    }

    fn compile(
        &self,
        module: &Module,
        opts: &BackendOptions,
    ) -> Result<BackendOutput, BackendError> {
        Ok(BackendOutput {
            files: vec![OutputFile {
                name: opts.file_name("ir"),
                content: OutputContent::Text(prism_ir::dump_module(module)),
            }],
            diagnostics: common_diagnostics(module),
        })
    }
}

/// Serializes the module with [`Module::to_json`].
#[derive(Debug)]
pub struct IrJsonBackend;

impl Backend for IrJsonBackend {
    fn name(&self) -> &str {
        "IR JSON"
    }

    fn targets(&self) -> &[&str] {
        &["ir-json", "json"]
    }

    fn compile(
        &self,
        module: &Module,
        opts: &BackendOptions,
    ) -> Result<BackendOutput, BackendError> {
        let mut text = module.to_json()?;
        text.push('\n');
        Ok(BackendOutput {
            files: vec![OutputFile {
                name: opts.file_name("json"),
                content: OutputContent::Text(text),
            }],
            diagnostics: common_diagnostics(module),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_ir::ShaderStage;

    fn compute_module() -> Module {
        let mut module = Module::new();
        let f = module.new_function("main", None, Some(ShaderStage::Compute));
        module.functions[f].workgroup_size = Some([1, 1, 1]);
        let block = module.functions[f].block;
        prism_ir::Builder::at_end(&mut module, block).return_(None);
        module
    }

    fn text(output: &BackendOutput) -> &str {
        match &output.files[0].content {
            OutputContent::Text(text) => text,
            OutputContent::Binary(_) => panic!("expected text output"),
        }
    }

    #[test]
    fn ir_dump_names_file_after_stem() {
        let opts = BackendOptions {
            stem: Some("blur".into()),
        };
        let output = IrDumpBackend.compile(&compute_module(), &opts).unwrap();
        assert_eq!(output.files[0].name, "blur.ir");
        assert!(text(&output).contains("fn main()"));
        assert!(output.diagnostics.is_empty());
    }

    #[test]
    fn ir_json_round_trips() {
        let module = compute_module();
        let output = IrJsonBackend
            .compile(&module, &BackendOptions::default())
            .unwrap();
        assert_eq!(output.files[0].name, "module.json");
        let decoded = Module::from_json(text(&output)).unwrap();
        assert_eq!(
            prism_ir::dump_module(&decoded),
            prism_ir::dump_module(&module)
        );
    }

    #[test]
    fn empty_module_warns() {
        let output = IrDumpBackend
            .compile(&Module::new(), &BackendOptions::default())
            .unwrap();
        assert_eq!(
            output.diagnostics,
            vec![Diagnostic::warning("module has no entry points")]
        );
        assert_eq!(
            output.diagnostics[0].to_string(),
            "[warning] module has no entry points"
        );
    }

    #[test]
    fn registry_lookup() {
        let registry = BackendRegistry::with_builtins();
        assert_eq!(registry.list_targets(), ["ir-dump", "ir", "ir-json", "json"]);
        assert_eq!(registry.find("json").map(|b| b.name()), Some("IR JSON"));
        assert!(registry.find("msl").is_none());
        assert!(BackendRegistry::new().list_targets().is_empty());
    }

    #[test]
    fn output_summary() {
        let output = BackendOutput {
            files: vec![OutputFile {
                name: "a.bin".into(),
                content: OutputContent::Binary(vec![1, 2, 3]),
            }],
            diagnostics: Vec::new(),
        };
        assert_eq!(output.to_string(), "1 file(s), 0 diagnostic(s)");
        assert_eq!(output.files[0].content.as_bytes(), &[1, 2, 3]);
    }
}
