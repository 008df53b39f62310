//! Workflow definition files → [`WorkflowDefinition`].
//!
//! The on-disk format is YAML or JSON, auto-detected by file extension
//! (`.yaml`/`.yml` vs `.json`; anything else falls back to YAML, which is
//! a superset of JSON for our purposes). Loading validates the definition
//! before handing it to callers, so a successfully loaded workflow is
//! always startable.

use miette::Diagnostic;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::definition::{DefinitionError, WorkflowDefinition};

/// Errors raised while loading a workflow definition file.
#[derive(Debug, Error, Diagnostic)]
pub enum LoaderError {
    #[error("failed to read workflow file `{path}`: {source}")]
    #[diagnostic(
        code(flowloom::loader::io),
        help("Check that the file exists and is readable.")
    )]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workflow file `{path}`: {message}")]
    #[diagnostic(code(flowloom::loader::parse))]
    Parse { path: PathBuf, message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Invalid(#[from] DefinitionError),
}

/// Load and validate a workflow definition from a YAML or JSON file.
pub async fn load_workflow_file(path: impl AsRef<Path>) -> Result<WorkflowDefinition, LoaderError> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| LoaderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    parse_workflow(&text, path)
}

/// Parse definition text, picking the format from the path's extension.
pub fn parse_workflow(text: &str, path: &Path) -> Result<WorkflowDefinition, LoaderError> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let definition: WorkflowDefinition = if is_json {
        serde_json::from_str(text).map_err(|e| LoaderError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
    } else {
        serde_yaml::from_str(text).map_err(|e| LoaderError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
    };

    definition.validate()?;
    Ok(definition)
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
workflowId: greet
workflowName: Greeting
defaultVariables:
  who: "world"
nodes:
  - nodeId: gate
    runtimeType: IfElse
    condition: 'GetGlobal("who") == "world"'
  - nodeId: done
    runtimeType: Noop
connections:
  - sourceNodeId: gate
    targetNodeId: done
    triggerKind: Complete
    sourcePort: "True"
"#;

    #[test]
    fn parses_yaml() {
        let wf = parse_workflow(YAML, Path::new("greet.yaml")).unwrap();
        assert_eq!(wf.workflow_id, "greet");
        assert_eq!(wf.nodes.len(), 2);
        assert_eq!(wf.connections.len(), 1);
        assert_eq!(
            wf.connections[0].source_port.as_deref(),
            Some("True")
        );
    }

    #[test]
    fn parses_json_by_extension() {
        let json = r#"{
            "workflowId": "j",
            "nodes": [{"nodeId": "n", "runtimeType": "Noop"}]
        }"#;
        let wf = parse_workflow(json, Path::new("wf.json")).unwrap();
        assert_eq!(wf.workflow_id, "j");
    }

    #[test]
    fn invalid_definitions_are_rejected_at_load() {
        let yaml = r#"
workflowId: bad
nodes:
  - nodeId: loop
    runtimeType: While
    condition: ""
"#;
        let err = parse_workflow(yaml, Path::new("bad.yaml")).unwrap_err();
        assert!(matches!(err, LoaderError::Invalid(_)));
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let err = load_workflow_file("/definitely/not/here.yaml").await.unwrap_err();
        assert!(matches!(err, LoaderError::Io { .. }));
    }
}
