//! Validated, atomic artifact writes

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use strata_core::{Diagnostic, DiagnosticCode};
use tracing::{debug, info};

use crate::manifest::WritableManifest;
use crate::run_results::RunResultsArtifact;
use crate::schema::{self, validator_for, Violation};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const RUN_RESULTS_FILE_NAME: &str = "run_results.json";

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// The document does not match its own schema; a bug, not a user error
    #[error("{artifact} does not match schema {schema_version}: {}", format_violations(.violations))]
    SchemaValidation {
        artifact: String,
        schema_version: String,
        violations: Vec<Violation>,
    },

    #[error("No embedded schema for {0}")]
    UnknownSchema(String),

    #[error("Embedded schema {schema_version} does not compile: {message}")]
    InvalidSchema { schema_version: String, message: String },

    #[error("IO error on {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Serialization error: {0}")]
    Serialize(String),
}

impl ArtifactError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(DiagnosticCode::SchemaValidation, self.to_string())
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

fn io_error(path: &Path, e: std::io::Error) -> ArtifactError {
    ArtifactError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// Check a serialized document against the schema its metadata names
pub fn validate_document(artifact: &str, document: &serde_json::Value) -> Result<(), ArtifactError> {
    let schema_version = document
        .pointer("/metadata/dbt_schema_version")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();

    let validator = validator_for(&schema_version)
        .ok_or_else(|| ArtifactError::UnknownSchema(schema_version.clone()))?
        .map_err(|message| ArtifactError::InvalidSchema {
            schema_version: schema_version.clone(),
            message,
        })?;

    schema::check(validator, document).map_err(|violations| ArtifactError::SchemaValidation {
        artifact: artifact.to_string(),
        schema_version,
        violations,
    })
}

/// Writes artifacts into a target directory
pub struct ArtifactWriter {
    target_path: PathBuf,
}

impl ArtifactWriter {
    pub fn new(target_path: impl Into<PathBuf>) -> Self {
        Self {
            target_path: target_path.into(),
        }
    }

    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    pub fn write_manifest(&self, manifest: &WritableManifest) -> Result<PathBuf, ArtifactError> {
        self.write(MANIFEST_FILE_NAME, manifest)
    }

    pub fn write_run_results(&self, run_results: &RunResultsArtifact) -> Result<PathBuf, ArtifactError> {
        self.write(RUN_RESULTS_FILE_NAME, run_results)
    }

    /// Serialize, validate, write to a temporary file and rename into place
    fn write<T: Serialize>(&self, file_name: &str, artifact: &T) -> Result<PathBuf, ArtifactError> {
        let document = serde_json::to_value(artifact).map_err(|e| ArtifactError::Serialize(e.to_string()))?;
        validate_document(file_name, &document)?;

        let contents = serde_json::to_string_pretty(&document).map_err(|e| ArtifactError::Serialize(e.to_string()))?;

        std::fs::create_dir_all(&self.target_path).map_err(|e| io_error(&self.target_path, e))?;

        let final_path = self.target_path.join(file_name);
        let tmp_path = self.target_path.join(format!(".{}.tmp", file_name));

        std::fs::write(&tmp_path, contents).map_err(|e| io_error(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &final_path).map_err(|e| io_error(&final_path, e))?;

        info!(path = %final_path.display(), "wrote artifact");
        Ok(final_path)
    }
}

/// Read an artifact back, validating it on the way in
pub fn read_artifact<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    let document: serde_json::Value =
        serde_json::from_str(&contents).map_err(|e| ArtifactError::Serialize(e.to_string()))?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    validate_document(&name, &document)?;
    debug!(path = %path.display(), "read artifact");

    serde_json::from_value(document).map_err(|e| ArtifactError::Serialize(e.to_string()))
}

pub fn read_manifest(path: &Path) -> Result<WritableManifest, ArtifactError> {
    read_artifact(path)
}

pub fn read_run_results(path: &Path) -> Result<RunResultsArtifact, ArtifactError> {
    read_artifact(path)
}
