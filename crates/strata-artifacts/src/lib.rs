//! Versioned run artifacts
//!
//! This crate handles:
//! - The manifest (resolved graph plus metadata), written for every
//!   invocation that builds a graph
//! - Run results, written after an execution pass
//! - Validation of both against embedded, versioned JSON Schemas
//! - Atomic writes into the target directory

pub mod manifest;
pub mod metadata;
pub mod run_results;
pub mod schema;
pub mod writer;

pub use manifest::{ManifestNode, WritableManifest};
pub use metadata::{env_metadata, ArtifactMetadata, Invocation, ENV_METADATA_PREFIX, TOOL_VERSION};
pub use run_results::{RunResultOutput, RunResultsArtifact};
pub use schema::{check, validate, validator_for, Violation, MANIFEST_SCHEMA_VERSION, RUN_RESULTS_SCHEMA_VERSION};
pub use writer::{
    read_manifest, read_run_results, validate_document, ArtifactError, ArtifactWriter, MANIFEST_FILE_NAME,
    RUN_RESULTS_FILE_NAME,
};
