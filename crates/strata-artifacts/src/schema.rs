//! JSON Schema validation for artifacts
//!
//! Artifacts are checked against the Draft 7 schemas embedded in this crate.
//! Each embedded schema is compiled once per process.

use jsonschema::{ValidationError, Validator};
use serde_json::Value;
use std::sync::OnceLock;

/// Schema URI of the manifest document
pub const MANIFEST_SCHEMA_VERSION: &str = "https://schemas.strata.dev/strata/manifest/v1.json";

/// Schema URI of the run results document
pub const RUN_RESULTS_SCHEMA_VERSION: &str = "https://schemas.strata.dev/strata/run-results/v1.json";

const MANIFEST_SCHEMA: &str = include_str!("../schemas/strata/manifest/v1.json");
const RUN_RESULTS_SCHEMA: &str = include_str!("../schemas/strata/run-results/v1.json");

/// Embedded schema document for a schema URI
pub fn schema_for(version: &str) -> Option<&'static str> {
    match version {
        MANIFEST_SCHEMA_VERSION => Some(MANIFEST_SCHEMA),
        RUN_RESULTS_SCHEMA_VERSION => Some(RUN_RESULTS_SCHEMA),
        _ => None,
    }
}

/// One place where a document does not match its schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// JSON pointer into the instance
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{}: {}", path, self.message)
    }
}

impl From<ValidationError<'_>> for Violation {
    fn from(error: ValidationError<'_>) -> Self {
        Self {
            path: error.instance_path.to_string(),
            message: error.to_string(),
        }
    }
}

/// Compiled validator of an embedded schema
///
/// `None` for an unknown schema URI; `Some(Err)` when the embedded schema
/// itself does not compile.
pub fn validator_for(version: &str) -> Option<Result<&'static Validator, String>> {
    static MANIFEST: OnceLock<Result<Validator, String>> = OnceLock::new();
    static RUN_RESULTS: OnceLock<Result<Validator, String>> = OnceLock::new();

    let cell = match version {
        MANIFEST_SCHEMA_VERSION => &MANIFEST,
        RUN_RESULTS_SCHEMA_VERSION => &RUN_RESULTS,
        _ => return None,
    };
    let raw = schema_for(version)?;

    Some(cell.get_or_init(|| compile_str(raw)).as_ref().map_err(Clone::clone))
}

fn compile_str(raw: &str) -> Result<Validator, String> {
    let schema: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    compile(&schema)
}

fn compile(schema: &Value) -> Result<Validator, String> {
    jsonschema::draft7::new(schema).map_err(|e| e.to_string())
}

/// Every violation of `instance` against a compiled validator
pub fn check(validator: &Validator, instance: &Value) -> Result<(), Vec<Violation>> {
    let violations: Vec<Violation> = validator.iter_errors(instance).map(Violation::from).collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Validate `instance` against an ad hoc Draft 7 schema
pub fn validate(schema: &Value, instance: &Value) -> Result<(), Vec<Violation>> {
    match compile(schema) {
        Ok(validator) => check(&validator, instance),
        Err(message) => Err(vec![Violation {
            path: String::new(),
            message: format!("invalid schema: {}", message),
        }]),
    }
}
