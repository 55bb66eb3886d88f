//! Run results: per-node outcomes of one execution pass

use serde::{Deserialize, Serialize};
use strata_core::RunConfig;
use strata_engine::{RunOutcome, RunResult};
use strata_jinja::CompileOutput;

use crate::metadata::{ArtifactMetadata, Invocation};
use crate::schema::RUN_RESULTS_SCHEMA_VERSION;

/// A run result as written to the artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResultOutput {
    #[serde(flatten)]
    pub result: RunResult,

    pub compiled: Option<bool>,

    pub compiled_code: Option<String>,

    pub relation_name: Option<String>,
}

impl RunResultOutput {
    pub fn new(result: RunResult, compiled: &CompileOutput) -> Self {
        let output = compiled.compiled.get(&result.unique_id);

        Self {
            compiled: Some(output.is_some()),
            compiled_code: output.map(|c| c.compiled_code.clone()),
            relation_name: output.and_then(|c| c.relation_name.clone()),
            result,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResultsArtifact {
    pub metadata: ArtifactMetadata,

    /// Completion order; sort by `unique_id` to compare
    pub results: Vec<RunResultOutput>,

    /// Seconds, always positive
    pub elapsed_time: f64,

    /// Effective options of the invocation
    pub args: serde_json::Value,
}

impl RunResultsArtifact {
    pub fn build(outcome: &RunOutcome, compiled: &CompileOutput, run: &RunConfig, invocation: &Invocation) -> Self {
        let results = outcome
            .results
            .iter()
            .cloned()
            .map(|r| RunResultOutput::new(r, compiled))
            .collect();

        Self {
            metadata: invocation.metadata(RUN_RESULTS_SCHEMA_VERSION),
            results,
            elapsed_time: outcome.elapsed.as_secs_f64().max(1e-6),
            args: serde_json::to_value(run).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn result(&self, unique_id: &str) -> Option<&RunResultOutput> {
        self.results.iter().find(|r| r.result.unique_id == unique_id)
    }
}
