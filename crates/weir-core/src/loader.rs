//! Workflow definition loading.
//!
//! The engine consumes a [`WorkflowDefinition`]; this module is the input
//! adapter that parses one from JSON or YAML (picked by file extension or
//! an explicit format) and validates it before handing it over.

use std::path::Path;

use tracing::info;

use crate::definition::WorkflowDefinition;
use crate::{Result, WeirError};

/// Wire encoding of a definition document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Json,
    Yaml,
}

impl DefinitionFormat {
    /// Pick a format from a file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("json") => Ok(DefinitionFormat::Json),
            Some("yaml") | Some("yml") => Ok(DefinitionFormat::Yaml),
            other => Err(WeirError::Validation(format!(
                "unsupported definition extension {:?} (expected json, yaml, or yml)",
                other.unwrap_or("<none>")
            ))),
        }
    }
}

/// Parse and validate a definition from a string.
pub fn parse_definition(content: &str, format: DefinitionFormat) -> Result<WorkflowDefinition> {
    let mut definition: WorkflowDefinition = match format {
        DefinitionFormat::Json => serde_json::from_str(content)
            .map_err(|e| WeirError::Validation(format!("malformed JSON definition: {e}")))?,
        DefinitionFormat::Yaml => serde_yaml::from_str(content)
            .map_err(|e| WeirError::Validation(format!("malformed YAML definition: {e}")))?,
    };
    definition.validate()?;
    Ok(definition)
}

/// Serialize a definition. Round-trips through [`parse_definition`]
/// preserve every field.
pub fn serialize_definition(
    definition: &WorkflowDefinition,
    format: DefinitionFormat,
) -> Result<String> {
    match format {
        DefinitionFormat::Json => Ok(serde_json::to_string_pretty(definition)?),
        DefinitionFormat::Yaml => serde_yaml::to_string(definition)
            .map_err(|e| WeirError::Validation(format!("failed to serialize definition: {e}"))),
    }
}

/// Load and validate a definition file, format chosen by extension.
pub async fn load_definition(path: &Path) -> Result<WorkflowDefinition> {
    let format = DefinitionFormat::from_path(path)?;
    let content = tokio::fs::read_to_string(path).await?;
    let definition = parse_definition(&content, format)?;
    info!(
        path = %path.display(),
        workflow_id = %definition.workflow_id,
        nodes = definition.nodes.len(),
        connections = definition.connections.len(),
        "workflow definition loaded"
    );
    Ok(definition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{NodeConnection, NodeDefinition, NodeKind, NodePriority};
    use crate::message::MessageType;
    use crate::retry::{BackoffStrategy, RetryPolicy};

    fn sample() -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new("sample", "Sample");
        def.description = "round-trip fixture".into();
        def.max_concurrency = 4;
        def.timeout_seconds = 30;
        def.default_variables
            .insert("threshold".into(), serde_json::json!(10));

        let mut task = NodeDefinition::new("fetch", NodeKind::Task { body: "fetch".into() });
        task.priority = NodePriority::High;
        task.retry = Some(RetryPolicy {
            strategy: BackoffStrategy::Exponential,
            max_attempts: 4,
            initial_delay_ms: 50,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            retry_on: vec!["io".into()],
            do_not_retry_on: vec!["validation".into()],
        });
        def.add_node(task);
        def.add_node(NodeDefinition::new(
            "check",
            NodeKind::IfElse {
                condition: "output.value > 10".into(),
            },
        ));

        def.add_connection(NodeConnection::new("fetch", "check"));
        def.add_connection(
            NodeConnection::new("fetch", "check")
                .on(MessageType::Fail)
                .when("output.error != none"),
        );
        def
    }

    #[test]
    fn json_round_trip_preserves_fields() {
        let original = sample();
        let json = serialize_definition(&original, DefinitionFormat::Json).unwrap();
        let parsed = parse_definition(&json, DefinitionFormat::Json).unwrap();

        assert_eq!(parsed.workflow_id, original.workflow_id);
        assert_eq!(parsed.max_concurrency, 4);
        assert_eq!(parsed.nodes.len(), 2);
        assert_eq!(parsed.connections.len(), 2);
        let retry = parsed.nodes[0].retry.as_ref().unwrap();
        assert_eq!(retry.strategy, BackoffStrategy::Exponential);
        assert_eq!(retry.retry_on, vec!["io".to_string()]);
    }

    #[test]
    fn yaml_round_trip_preserves_fields() {
        let original = sample();
        let yaml = serialize_definition(&original, DefinitionFormat::Yaml).unwrap();
        let parsed = parse_definition(&yaml, DefinitionFormat::Yaml).unwrap();

        assert_eq!(parsed.workflow_id, original.workflow_id);
        assert_eq!(parsed.default_variables["threshold"], serde_json::json!(10));
        match &parsed.nodes[1].kind {
            NodeKind::IfElse { condition } => assert_eq!(condition, "output.value > 10"),
            other => panic!("expected IfElse, got {other:?}"),
        }
    }

    #[test]
    fn parse_validates_the_graph() {
        let json = r#"{"workflow_id": "bad", "name": "Bad", "nodes": []}"#;
        let err = parse_definition(json, DefinitionFormat::Json).unwrap_err();
        assert!(err.to_string().contains("no nodes"));
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(
            DefinitionFormat::from_path(Path::new("wf.json")).unwrap(),
            DefinitionFormat::Json
        );
        assert_eq!(
            DefinitionFormat::from_path(Path::new("wf.yml")).unwrap(),
            DefinitionFormat::Yaml
        );
        assert!(DefinitionFormat::from_path(Path::new("wf.toml")).is_err());
    }

    #[tokio::test]
    async fn load_definition_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("wf.yaml");
        let yaml = serialize_definition(&sample(), DefinitionFormat::Yaml).unwrap();
        tokio::fs::write(&path, yaml).await.unwrap();

        let loaded = load_definition(&path).await.unwrap();
        assert_eq!(loaded.workflow_id, "sample");
    }
}
