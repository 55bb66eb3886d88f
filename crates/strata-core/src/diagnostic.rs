//! Node-attributed diagnostics
//!
//! Every resolution, compilation, execution and artifact failure surfaces as
//! a [`Diagnostic`] carrying a [`DiagnosticCode`]. Code strings end up in
//! logs and downstream tooling: never rename or remove one, only add.

use serde::{Deserialize, Serialize};

/// Stable failure codes, grouped by the phase that raises them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosticCode {
    // Resolution (1xxx) - attributed to one node, never fatal to the pass
    /// `ref()` target does not exist
    RefNotFound,

    /// `ref()` target matches nodes in more than one package
    RefAmbiguous,

    /// `ref()` target exists but is disabled
    RefDisabled,

    /// `source()` target does not exist
    SourceNotFound,

    /// `doc()` target does not exist
    DocNotFound,

    /// Unparseable inline `config()` value
    InvalidInlineConfig,

    // Graph (2xxx) - fatal to the invocation
    /// Two enabled nodes share an identity
    DuplicateIdentifier,

    /// The dependency graph contains a cycle
    CyclicDependency,

    /// A declaration could not be turned into a node
    InvalidDeclaration,

    // Compilation (3xxx) - per node
    /// Template failed to render
    CompilationError,

    /// Template used an undefined variable
    UndefinedVariable,

    // Execution (4xxx) - per node
    /// The executor reported an error
    ExecutionError,

    /// A data test returned failing rows
    TestFailure,

    // Artifacts (5xxx) - internal
    /// An artifact did not match its schema
    SchemaValidation,

    // Other (9xxx)
    Info,

    Warning,
}

impl DiagnosticCode {
    /// The SCREAMING_SNAKE_CASE form used in output
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RefNotFound => "REF_NOT_FOUND",
            Self::RefAmbiguous => "REF_AMBIGUOUS",
            Self::RefDisabled => "REF_DISABLED",
            Self::SourceNotFound => "SOURCE_NOT_FOUND",
            Self::DocNotFound => "DOC_NOT_FOUND",
            Self::InvalidInlineConfig => "INVALID_INLINE_CONFIG",
            Self::DuplicateIdentifier => "DUPLICATE_IDENTIFIER",
            Self::CyclicDependency => "CYCLIC_DEPENDENCY",
            Self::InvalidDeclaration => "INVALID_DECLARATION",
            Self::CompilationError => "COMPILATION_ERROR",
            Self::UndefinedVariable => "UNDEFINED_VARIABLE",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::TestFailure => "TEST_FAILURE",
            Self::SchemaValidation => "SCHEMA_VALIDATION",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
        }
    }

    /// Whether this code ends the whole invocation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DuplicateIdentifier
                | Self::CyclicDependency
                | Self::InvalidDeclaration
                | Self::SchemaValidation
        )
    }
}

impl std::fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How serious a diagnostic is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,

    /// Reported, the node still counts as succeeded
    Warn,

    /// The node ends `error` or the invocation stops
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Where in a project file a diagnostic points
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// `original_file_path` of the node
    pub file: String,

    /// 1-indexed, when the template engine reports one
    pub line: Option<usize>,
}

impl Location {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: None,
        }
    }

    pub fn with_line(file: impl Into<String>, line: usize) -> Self {
        Self {
            file: file.into(),
            line: Some(line),
        }
    }
}

/// One reported problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: DiagnosticCode,

    pub severity: Severity,

    pub message: String,

    /// Node the diagnostic is attributed to
    pub node_id: Option<String>,

    pub location: Option<Location>,
}

impl Diagnostic {
    pub fn new(code: DiagnosticCode, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            message: message.into(),
            node_id: None,
            location: None,
        }
    }

    /// Shorthand for an error-severity diagnostic
    pub fn error(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Error, message)
    }

    /// Attribute to a node
    pub fn for_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Set the location
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.node_id {
            Some(node_id) => write!(f, "[{}] {}: {}", self.code, node_id, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_code_stability() {
        assert_eq!(DiagnosticCode::RefNotFound.as_str(), "REF_NOT_FOUND");
        assert_eq!(DiagnosticCode::CyclicDependency.as_str(), "CYCLIC_DEPENDENCY");
        assert_eq!(
            serde_json::to_string(&DiagnosticCode::RefAmbiguous).unwrap(),
            "\"REF_AMBIGUOUS\""
        );
    }

    #[test]
    fn fatal_codes() {
        assert!(DiagnosticCode::CyclicDependency.is_fatal());
        assert!(DiagnosticCode::DuplicateIdentifier.is_fatal());
        assert!(!DiagnosticCode::RefNotFound.is_fatal());
        assert!(!DiagnosticCode::ExecutionError.is_fatal());
    }

    #[test]
    fn diagnostic_serialization() {
        let diag = Diagnostic::error(DiagnosticCode::RefNotFound, "Model 'users' was not found")
            .for_node("model.shop.orders")
            .with_location(Location::with_line("models/orders.sql", 4));

        let json = serde_json::to_string(&diag).unwrap();
        assert!(json.contains("REF_NOT_FOUND"));
        assert!(json.contains("model.shop.orders"));
        assert_eq!(
            diag.to_string(),
            "[REF_NOT_FOUND] model.shop.orders: Model 'users' was not found"
        );
    }
}
