//! Artifact metadata shared by the manifest and run results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Environment variables with this prefix are recorded in artifact metadata,
/// keyed by the remainder of their name
pub const ENV_METADATA_PREFIX: &str = "DBT_ENV_CUSTOM_ENV_";

/// Tool version recorded in every artifact
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Schema URI the document conforms to
    pub dbt_schema_version: String,

    pub dbt_version: String,

    pub generated_at: DateTime<Utc>,

    pub invocation_id: Option<String>,

    /// Whitelisted environment values
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Anonymized project id (manifest only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_anonymous_usage_stats: Option<bool>,

    /// Target system kind (manifest only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_type: Option<String>,
}

/// Identity of one invocation
///
/// Every artifact written by the same invocation carries the same
/// invocation id and environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub invocation_id: Uuid,
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    /// New invocation reading the process environment
    pub fn new() -> Self {
        Self::with_env(env_metadata(std::env::vars()))
    }

    pub fn with_env(env: BTreeMap<String, String>) -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            env,
        }
    }

    /// Metadata stamped now for a document of `schema_version`
    pub fn metadata(&self, schema_version: &str) -> ArtifactMetadata {
        ArtifactMetadata {
            dbt_schema_version: schema_version.to_string(),
            dbt_version: TOOL_VERSION.to_string(),
            generated_at: Utc::now(),
            invocation_id: Some(self.invocation_id.to_string()),
            env: self.env.clone(),
            project_id: None,
            send_anonymous_usage_stats: None,
            adapter_type: None,
        }
    }
}

impl Default for Invocation {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep prefixed variables, stripping the prefix
pub fn env_metadata<I>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(ENV_METADATA_PREFIX)
                .filter(|k| !k.is_empty())
                .map(|k| (k.to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_whitelist() {
        let env = env_metadata(vec![
            ("DBT_ENV_CUSTOM_ENV_env_key".to_string(), "env_value".to_string()),
            ("DBT_ENV_CUSTOM_ENV_".to_string(), "empty".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ]);

        assert_eq!(env.len(), 1);
        assert_eq!(env["env_key"], "env_value");
    }

    #[test]
    fn invocation_metadata_shares_id() {
        let invocation = Invocation::with_env(BTreeMap::new());
        let a = invocation.metadata("a");
        let b = invocation.metadata("b");

        assert_eq!(a.invocation_id, b.invocation_id);
        assert_eq!(a.dbt_version, TOOL_VERSION);
        assert!(a.project_id.is_none());
    }
}
