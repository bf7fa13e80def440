use crate::sink::SinkError;
use crate::staging::StagingError;
use crate::tool::ToolError;
use strata_store::StoreError;
use thiserror::Error;

/// Raised by [`crate::NodeRegistry`] while the static graph is assembled.
/// Any of these aborts the run before a single node executes.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GraphValidationError {
    #[error("node '{0}' is already registered")]
    DuplicateNode(String),
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    GraphValidation(#[from] GraphValidationError),
    #[error("capability '{0}' is not provisioned for this node")]
    MissingCapability(String),
    #[error("{0}")]
    NodeCompute(String),
    #[error("node '{node}' has no materialization in run '{run_id}'")]
    NotMaterialized { run_id: String, node: String },
    #[error("export render failed: {0}")]
    ExportRender(String),
    #[error("export upload failed: {0}")]
    ExportUpload(String),
    #[error("selection references unknown node '{0}'")]
    UnknownSelection(String),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Store(StoreError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl PipelineError {
    pub fn compute(message: impl Into<String>) -> Self {
        Self::NodeCompute(message.into())
    }

    /// Stable label recorded next to a failed node. Collaborator failures
    /// raised inside a compute function all report as `node_compute`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GraphValidation(_) => "graph_validation",
            Self::MissingCapability(_) => "missing_capability",
            Self::NotMaterialized { .. } => "not_materialized",
            Self::ExportRender(_) => "export_render",
            Self::ExportUpload(_) => "export_upload",
            Self::UnknownSelection(_) => "unknown_selection",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
            Self::NodeCompute(_)
            | Self::Sink(_)
            | Self::Tool(_)
            | Self::Staging(_)
            | Self::Runtime(_) => "node_compute",
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotMaterialized { run_id, node } => Self::NotMaterialized { run_id, node },
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_display_expected_arrow_path() {
        let error = GraphValidationError::Cycle {
            path: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(error.to_string(), "dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn store_not_materialized_conversion_expected_pipeline_variant() {
        let error = PipelineError::from(StoreError::NotMaterialized {
            run_id: "run-1".to_string(),
            node: "a".to_string(),
        });
        assert!(matches!(error, PipelineError::NotMaterialized { .. }));
        assert_eq!(error.kind(), "not_materialized");
    }

    #[test]
    fn staging_error_kind_expected_node_compute() {
        let error = PipelineError::from(StagingError::MissingColumn {
            column: "revenue".to_string(),
        });
        assert_eq!(error.kind(), "node_compute");
    }
}
