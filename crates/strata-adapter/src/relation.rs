//! Addressable relations in the target system

use std::fmt;
use strata_core::{Node, ResourceType, TargetConfig};

/// Identifies a table or view in the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub database: Option<String>,

    pub schema: String,

    pub identifier: String,
}

impl Relation {
    pub fn new(database: Option<String>, schema: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            database,
            schema: schema.into(),
            identifier: identifier.into(),
        }
    }

    /// Where a node's output lives
    ///
    /// Sources keep their declared location. Other nodes land in the target
    /// schema, or `<target_schema>_<custom>` when a custom schema is set.
    pub fn for_node(node: &Node, target: &TargetConfig) -> Self {
        if node.resource_type == ResourceType::Source {
            let schema = node
                .schema
                .clone()
                .or_else(|| node.source_name.clone())
                .unwrap_or_else(|| target.schema.clone());

            return Self {
                database: node.database.clone().or_else(|| target.database.clone()),
                schema,
                identifier: node.identifier.clone().unwrap_or_else(|| node.name.clone()),
            };
        }

        let schema = match &node.config.schema {
            Some(custom) => format!("{}_{}", target.schema, custom.trim()),
            None => target.schema.clone(),
        };

        Self {
            database: node.config.database.clone().or_else(|| target.database.clone()),
            schema,
            identifier: node.config.alias.clone().unwrap_or_else(|| node.name.clone()),
        }
    }

    /// Default rendering: `"database"."schema"."identifier"`
    pub fn render(&self) -> String {
        match &self.database {
            Some(database) => format!("{}.{}.{}", quote(database), quote(&self.schema), quote(&self.identifier)),
            None => format!("{}.{}", quote(&self.schema), quote(&self.identifier)),
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn quote(part: &str) -> String {
    format!("\"{}\"", part.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{Declaration, NodeConfig};

    fn target() -> TargetConfig {
        TargetConfig {
            database: Some("analytics".to_string()),
            schema: "dbt_dev".to_string(),
            ..TargetConfig::default()
        }
    }

    #[test]
    fn model_in_target_schema() {
        let node = Node::from_declaration(Declaration::new(ResourceType::Model, "shop", "orders"), 0).unwrap();
        let relation = Relation::for_node(&node, &target());

        assert_eq!(relation.render(), r#""analytics"."dbt_dev"."orders""#);
    }

    #[test]
    fn custom_schema_and_alias() {
        let decl = Declaration::new(ResourceType::Model, "shop", "orders").with_config(NodeConfig {
            schema: Some("marts".to_string()),
            alias: Some("fct_orders".to_string()),
            database: Some("warehouse".to_string()),
            ..Default::default()
        });
        let node = Node::from_declaration(decl, 0).unwrap();

        assert_eq!(
            Relation::for_node(&node, &target()),
            Relation::new(Some("warehouse".to_string()), "dbt_dev_marts", "fct_orders")
        );
    }

    #[test]
    fn source_defaults_schema_to_source_name() {
        let mut decl = Declaration::source("shop", "raw", "orders");
        decl.identifier = Some("orders_v2".to_string());
        let node = Node::from_declaration(decl, 0).unwrap();

        let relation = Relation::for_node(&node, &TargetConfig::default());
        assert_eq!(relation.to_string(), r#""raw"."orders_v2""#);
    }

    #[test]
    fn quotes_are_escaped() {
        let relation = Relation::new(None, "odd\"schema", "t");
        assert_eq!(relation.render(), r#""odd""schema"."t""#);
    }
}
